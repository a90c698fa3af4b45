// Copyright (c) 2025 knix
// All rights reserved.

use std::sync::{PoisonError, RwLock};

use crate::SV4;
use crate::nz_u32_id;
use crate::pool::InternPool;
use crate::program::{AssocTypeId, GenericSignatureId, NominalId};
use crate::static_assert_niched;

nz_u32_id!(TypeId);
static_assert_niched!(TypeId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinType {
    Void,
    Int,
    Float,
    Bool,
    RawPointer,
}

/// A generic parameter of a canonical signature. Protocol `Self` is always `(0, 0)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GenericParamType {
    pub depth: u32,
    pub index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DependentMemberType {
    pub base: TypeId,
    pub assoc: AssocTypeId,
}

/// A type parameter mapped into a generic environment. `interface` is the
/// generic parameter or dependent member it stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArchetypeType {
    pub environment: GenericSignatureId,
    pub interface: TypeId,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NominalType {
    pub decl: NominalId,
    pub args: SV4<TypeId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionType {
    pub params: SV4<TypeId>,
    pub result: TypeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetatypeRepr {
    Thin,
    Thick,
    ObjC,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MetatypeType {
    pub instance: TypeId,
    pub repr: MetatypeRepr,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Builtin(BuiltinType),
    GenericParam(GenericParamType),
    DependentMember(DependentMemberType),
    Archetype(ArchetypeType),
    Nominal(NominalType),
    Tuple(SV4<TypeId>),
    Function(FunctionType),
    Metatype(MetatypeType),
}

impl Type {
    pub fn is_type_parameter(&self) -> bool {
        matches!(self, Type::GenericParam(_) | Type::DependentMember(_))
    }

    pub fn as_archetype(&self) -> Option<&ArchetypeType> {
        match self {
            Type::Archetype(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_nominal(&self) -> Option<&NominalType> {
        match self {
            Type::Nominal(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_metatype(&self) -> Option<&MetatypeType> {
        match self {
            Type::Metatype(m) => Some(m),
            _ => None,
        }
    }

    #[track_caller]
    pub fn expect_nominal(&self) -> &NominalType {
        match self {
            Type::Nominal(n) => n,
            _ => panic!("expect_nominal called on: {:?}", self),
        }
    }

    #[track_caller]
    pub fn expect_archetype(&self) -> &ArchetypeType {
        match self {
            Type::Archetype(a) => a,
            _ => panic!("expect_archetype called on: {:?}", self),
        }
    }

    pub fn children(&self) -> SV4<TypeId> {
        match self {
            Type::Builtin(_) | Type::GenericParam(_) | Type::Archetype(_) => SV4::new(),
            Type::DependentMember(m) => smallvec::smallvec![m.base],
            Type::Nominal(n) => n.args.clone(),
            Type::Tuple(elements) => elements.clone(),
            Type::Function(f) => {
                let mut c = f.params.clone();
                c.push(f.result);
                c
            }
            Type::Metatype(m) => smallvec::smallvec![m.instance],
        }
    }
}

/// Structural facts computed once at interning time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TypeFlags {
    pub has_type_parameter: bool,
    pub has_archetype: bool,
    /// Nesting depth; leaves are 1.
    pub depth: u32,
}

struct TypesInner {
    types: InternPool<Type, TypeId>,
    flags: Vec<TypeFlags>,
}

/// The type interner. Code generation creates new types (substitutions, archetypes)
/// while only holding a shared `&Program`, so interning goes through a lock.
pub struct Types {
    inner: RwLock<TypesInner>,
}

impl Types {
    pub fn new() -> Types {
        Types {
            inner: RwLock::new(TypesInner { types: InternPool::new("types"), flags: Vec::new() }),
        }
    }

    pub fn intern(&self, ty: Type) -> TypeId {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = inner.types.find(&ty) {
            return existing;
        }
        let mut flags = TypeFlags {
            has_type_parameter: ty.is_type_parameter(),
            has_archetype: matches!(ty, Type::Archetype(_)),
            depth: 1,
        };
        for child in ty.children() {
            let child_flags = inner.flags[child.as_u32() as usize - 1];
            flags.has_type_parameter |= child_flags.has_type_parameter;
            flags.has_archetype |= child_flags.has_archetype;
            flags.depth = flags.depth.max(child_flags.depth + 1);
        }
        let id = inner.types.intern(ty);
        debug_assert_eq!(id.as_u32() as usize, inner.flags.len() + 1);
        inner.flags.push(flags);
        id
    }

    pub fn get(&self, id: TypeId) -> Type {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.types.get(id).clone()
    }

    pub fn flags(&self, id: TypeId) -> TypeFlags {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.flags[id.as_u32() as usize - 1]
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.types.len()
    }
}

impl Default for Types {
    fn default() -> Self {
        Types::new()
    }
}
