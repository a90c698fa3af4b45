// Copyright (c) 2025 knix
// All rights reserved.

//! Witness table layout.
//!
//! A protocol's witness table is an array of pointer-sized words. Word 0 holds
//! the conformance descriptor; requirement `i` lives at word `i + 1`. The
//! requirement order is fixed by [`visit_protocol_requirements`] and never
//! changes once assigned, because other modules index tables by it.
//!
//! Private words live at negative offsets: private index `k` is word `-1 - k`.

use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex, PoisonError};

use fxhash::FxHashMap;
use log::debug;

use crate::program::{AssocTypeId, AssociatedConformance, MethodId, Program, ProtocolId, ProtocolMember};

#[cfg(test)]
mod layout_test;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WitnessTableEntry {
    OutOfLineBase(ProtocolId),
    Method(MethodId),
    AssociatedType(AssocTypeId),
    AssociatedConformance(AssociatedConformance),
    /// A requirement whose implementation was stripped; it keeps its slot.
    Placeholder,
}

impl WitnessTableEntry {
    pub fn is_base(&self) -> bool {
        matches!(self, WitnessTableEntry::OutOfLineBase(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtocolInfoKind {
    /// Only inherited protocols. All that is knowable about a protocol whose
    /// full shape may change under library evolution.
    RequirementSignature,
    Full,
}

/// The index of a requirement within a protocol's entry list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WitnessIndex(u32);

impl WitnessIndex {
    pub const fn new(index: u32) -> WitnessIndex {
        WitnessIndex(index)
    }

    pub const fn value(self) -> u32 {
        self.0
    }

    /// The word offset into a runtime witness table, skipping the descriptor.
    pub const fn for_protocol_witness_table(self) -> i32 {
        self.0 as i32 + 1
    }

    /// Word offset of private slot `k`.
    pub const fn private_offset(k: u32) -> i32 {
        -1 - k as i32
    }
}

impl Display for WitnessIndex {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The plain ordered traversal of a protocol's requirements: out-of-line bases,
/// then methods and placeholders in declaration order, then associated types,
/// then associated conformances.
///
/// Bases that are marker protocols have no witness table and therefore no slot.
pub fn visit_protocol_requirements(program: &Program, protocol: ProtocolId) -> Vec<WitnessTableEntry> {
    let decl = program.protocol(protocol);
    if !decl.requires_witness_table {
        return Vec::new();
    }
    let mut entries = Vec::with_capacity(decl.inherited.len() + decl.members.len());
    for base in decl.inherited.iter() {
        if program.protocol(*base).requires_witness_table {
            entries.push(WitnessTableEntry::OutOfLineBase(*base));
        }
    }
    for member in decl.members.iter() {
        match member {
            ProtocolMember::Method(m) => entries.push(WitnessTableEntry::Method(*m)),
            ProtocolMember::Placeholder => entries.push(WitnessTableEntry::Placeholder),
            ProtocolMember::AssociatedType(_) => {}
        }
    }
    for member in decl.members.iter() {
        if let ProtocolMember::AssociatedType(a) = member {
            entries.push(WitnessTableEntry::AssociatedType(*a));
        }
    }
    for ac in decl.associated_conformances.iter() {
        if program.protocol(ac.requirement).requires_witness_table {
            entries.push(WitnessTableEntry::AssociatedConformance(*ac));
        }
    }
    entries
}

/// The memoized layout of one protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolInfo {
    pub protocol: ProtocolId,
    pub kind: ProtocolInfoKind,
    entries: Vec<WitnessTableEntry>,
}

impl ProtocolInfo {
    pub fn compute(program: &Program, protocol: ProtocolId, kind: ProtocolInfoKind) -> ProtocolInfo {
        let mut entries = visit_protocol_requirements(program, protocol);
        if kind == ProtocolInfoKind::RequirementSignature {
            entries.retain(|e| e.is_base());
        }
        ProtocolInfo { protocol, kind, entries }
    }

    pub fn entries(&self) -> &[WitnessTableEntry] {
        &self.entries
    }

    pub fn num_witnesses(&self) -> u32 {
        self.entries.len() as u32
    }

    fn index_of(&self, matches: impl Fn(&WitnessTableEntry) -> bool) -> Option<WitnessIndex> {
        self.entries.iter().position(matches).map(|i| WitnessIndex::new(i as u32))
    }

    #[track_caller]
    pub fn base_index(&self, base: ProtocolId) -> WitnessIndex {
        match self.index_of(|e| *e == WitnessTableEntry::OutOfLineBase(base)) {
            Some(i) => i,
            None => panic!("base_index called on: {:?} for base {}", self, base),
        }
    }

    #[track_caller]
    pub fn function_index(&self, method: MethodId) -> WitnessIndex {
        self.expect_full("function_index");
        match self.index_of(|e| *e == WitnessTableEntry::Method(method)) {
            Some(i) => i,
            None => panic!("function_index called on: {:?} for method {}", self, method),
        }
    }

    #[track_caller]
    pub fn associated_type_index(&self, assoc: AssocTypeId) -> WitnessIndex {
        self.expect_full("associated_type_index");
        match self.index_of(|e| *e == WitnessTableEntry::AssociatedType(assoc)) {
            Some(i) => i,
            None => panic!("associated_type_index called on: {:?} for {}", self, assoc),
        }
    }

    #[track_caller]
    pub fn associated_conformance_index(&self, requirement: &AssociatedConformance) -> WitnessIndex {
        self.expect_full("associated_conformance_index");
        match self.index_of(|e| *e == WitnessTableEntry::AssociatedConformance(*requirement)) {
            Some(i) => i,
            None => panic!("associated_conformance_index called on: {:?} for {:?}", self, requirement),
        }
    }

    #[track_caller]
    fn expect_full(&self, what: &str) {
        if self.kind != ProtocolInfoKind::Full {
            panic!("{} requires a full layout of protocol {}", what, self.protocol)
        }
    }
}

/// Layouts keyed by protocol, shared by every session compiling against the
/// same program.
#[derive(Default)]
pub struct ProtocolInfoCache {
    infos: Mutex<FxHashMap<ProtocolId, Arc<ProtocolInfo>>>,
}

impl ProtocolInfoCache {
    pub fn new() -> ProtocolInfoCache {
        ProtocolInfoCache::default()
    }

    /// Returns a layout of at least `kind`. A broader recompute must extend the
    /// previously cached entries.
    pub fn get(&self, program: &Program, protocol: ProtocolId, kind: ProtocolInfoKind) -> Arc<ProtocolInfo> {
        let mut infos = self.infos.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = infos.get(&protocol) {
            if existing.kind >= kind {
                return existing.clone();
            }
        }
        let info = ProtocolInfo::compute(program, protocol, kind);
        if let Some(original) = infos.get(&protocol) {
            assert!(
                info.entries.starts_with(&original.entries),
                "layout of protocol {} changed from {:?} to {:?}",
                program.name(program.protocol(protocol).name),
                original.entries,
                info.entries
            );
        }
        debug!(
            "laid out {} ({:?}): {} witnesses",
            program.name(program.protocol(protocol).name),
            kind,
            info.entries.len()
        );
        let info = Arc::new(info);
        infos.insert(protocol, info.clone());
        info
    }

    pub fn len(&self) -> usize {
        self.infos.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
