// Copyright (c) 2025 knix
// All rights reserved.

use anyhow::{Result, bail};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetOs {
    Linux,
    MacOs,
    Wasm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    Intel,
    Arm,
    Wasm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordSize {
    W32,
    W64,
}

impl WordSize {
    pub const fn bits(&self) -> u32 {
        match self {
            WordSize::W32 => 32,
            WordSize::W64 => 64,
        }
    }

    pub const fn bytes(&self) -> u32 {
        self.bits() / 8
    }
}

/// Witness tables and generic requirement buffers are arrays of pointers, so the
/// only thing this layer needs from the target is its pointer width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    LinuxIntel64,
    MacOsArm64,
    Wasm32,
}

impl Target {
    pub fn from(arch: Arch, word_size: WordSize, os: Option<TargetOs>) -> Option<Self> {
        match (arch, word_size, os) {
            (Arch::Intel, WordSize::W64, Some(TargetOs::Linux)) => Some(Target::LinuxIntel64),
            (Arch::Arm, WordSize::W64, Some(TargetOs::MacOs)) => Some(Target::MacOsArm64),
            (Arch::Wasm, WordSize::W32, Some(TargetOs::Wasm)) => Some(Target::Wasm32),
            _ => None,
        }
    }

    pub fn word_size(&self) -> WordSize {
        match self {
            Target::LinuxIntel64 => WordSize::W64,
            Target::MacOsArm64 => WordSize::W64,
            Target::Wasm32 => WordSize::W32,
        }
    }

    pub fn pointer_size(&self) -> u32 {
        self.word_size().bytes()
    }
}

pub fn detect_host_target() -> Option<Target> {
    let (arch, word_size) = match std::env::consts::ARCH {
        "x86" => (Arch::Intel, WordSize::W32),
        "x86_64" => (Arch::Intel, WordSize::W64),
        "arm" => (Arch::Arm, WordSize::W32),
        "aarch64" => (Arch::Arm, WordSize::W64),
        "wasm32" => (Arch::Wasm, WordSize::W32),
        _ => return None,
    };
    let os = match std::env::consts::OS {
        "linux" => Some(TargetOs::Linux),
        "macos" => Some(TargetOs::MacOs),
        "unknown" if arch == Arch::Wasm => Some(TargetOs::Wasm),
        _ => None,
    };
    Target::from(arch, word_size, os)
}

/// Default number of pointer-sized words reserved as private data for a generic
/// witness table's instantiation cache.
pub const NUM_GENERIC_METADATA_PRIVATE_DATA_WORDS: u32 = 16;

#[derive(Debug, Clone)]
pub struct GenConfig {
    pub target: Target,
    /// Never hand out a constant witness table for a conformance defined in
    /// another module; go through an accessor instead so the table is
    /// initialized on first use.
    pub lazy_initialize_conformances: bool,
    /// Mark generated accessors as never-inline.
    pub optimize_for_size: bool,
    /// Attach type-derived debug names to emitted values.
    pub enable_value_names: bool,
    pub generic_metadata_private_data_words: u32,
}

impl Default for GenConfig {
    fn default() -> Self {
        GenConfig {
            target: detect_host_target().unwrap_or(Target::LinuxIntel64),
            lazy_initialize_conformances: false,
            optimize_for_size: false,
            enable_value_names: true,
            generic_metadata_private_data_words: NUM_GENERIC_METADATA_PRIVATE_DATA_WORDS,
        }
    }
}

impl GenConfig {
    pub fn for_target(target: Target) -> GenConfig {
        GenConfig { target, ..GenConfig::default() }
    }

    pub fn pointer_size(&self) -> u32 {
        self.target.pointer_size()
    }

    pub fn validate(&self) -> Result<()> {
        if self.generic_metadata_private_data_words == 0 {
            bail!("generic metadata private data must be at least one word");
        }
        // The private size shares a 16-bit field with the instantiation bit.
        if self.generic_metadata_private_data_words > (u16::MAX >> 1) as u32 {
            bail!(
                "generic metadata private data of {} words does not fit the descriptor",
                self.generic_metadata_private_data_words
            );
        }
        Ok(())
    }
}
