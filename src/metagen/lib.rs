// Copyright (c) 2025 knix
// All rights reserved.

//! Generic metadata fulfillment and protocol witness table emission.
//!
//! Given a lowered function type, [`convention::PolymorphicConvention`] decides which
//! type metadata and witness tables must be passed explicitly and which can be
//! recovered by replaying a [`metadata_path::MetadataPath`] from a value that is
//! already available. Given a conformance, [`witness_table`] lays out and emits its
//! witness table and conformance descriptor into an [`ir::IrModule`].

use smallvec::SmallVec;

pub mod bindings;
pub mod config;
pub mod conformance;
pub mod convention;
pub mod fulfillment;
pub mod ir;
pub mod layout;
pub mod local_type_data;
pub mod metadata_path;
mod pool;
pub mod program;
pub mod requirements;
pub mod session;
pub mod witness_table;

#[cfg(test)]
mod test_fixtures;

pub type SV4<T> = SmallVec<[T; 4]>;

#[macro_export]
macro_rules! nz_u32_id {
    ($name: ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(std::num::NonZeroU32);
        impl From<std::num::NonZeroU32> for $name {
            fn from(value: std::num::NonZeroU32) -> Self {
                $name(value)
            }
        }
        impl From<$name> for std::num::NonZeroU32 {
            fn from(val: $name) -> Self {
                val.0
            }
        }
        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }

        impl $name {
            pub const fn as_u32(self) -> u32 {
                self.0.get()
            }

            pub const fn from_u32(value: u32) -> Option<Self> {
                match std::num::NonZeroU32::new(value) {
                    None => None,
                    Some(nz_u32) => Some($name(nz_u32)),
                }
            }
        }
    };
}

#[macro_export]
macro_rules! static_assert_size {
    ($ty:ty, $size:expr) => {
        const _: [(); $size] = [(); ::std::mem::size_of::<$ty>()];
    };
}

#[macro_export]
macro_rules! static_assert_niched {
    ($ty:ty) => {
        $crate::static_assert_size!(Option<$ty>, ::std::mem::size_of::<$ty>());
    };
}
