// Copyright (c) 2025 knix
// All rights reserved.

//! The fulfillment map: for a fixed, numbered set of sources, the first
//! discovered way to derive each interesting metadata or witness table from
//! one of them.

use fxhash::FxHashMap;
use log::trace;

use crate::SV4;
use crate::bindings::GenericTypeRequirements;
use crate::ir::MetadataState;
use crate::layout::{ProtocolInfoKind, WitnessTableEntry};
use crate::metadata_path::{Component, MetadataPath};
use crate::program::types::TypeId;
use crate::program::{ConformanceId, GenericSignatureId, Program, ProtocolId};
use crate::session::Session;


/// `(ty, None)` is the metadata of `ty`; `(ty, Some(p))` its table for `p`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FulfillmentKey {
    pub ty: TypeId,
    pub protocol: Option<ProtocolId>,
}

impl FulfillmentKey {
    pub fn metadata(ty: TypeId) -> FulfillmentKey {
        FulfillmentKey { ty, protocol: None }
    }

    pub fn witness_table(ty: TypeId, protocol: ProtocolId) -> FulfillmentKey {
        FulfillmentKey { ty, protocol: Some(protocol) }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fulfillment {
    pub source_index: u32,
    pub path: MetadataPath,
    pub state: MetadataState,
}

/// Decides which types and conformances a search should record.
pub trait InterestingKeys {
    /// Is this type itself a key we want fulfilled?
    fn is_interesting_type(&self, ty: TypeId) -> bool;

    /// Does this type mention anything we want fulfilled?
    fn has_interesting_type(&self, ty: TypeId) -> bool;

    /// Should only some of this type's conformances be recorded?
    fn has_limited_interesting_conformances(&self, ty: TypeId) -> bool;

    fn interesting_conformances(&self, ty: TypeId) -> SV4<ProtocolId>;

    fn superclass_bound(&self, ty: TypeId) -> Option<TypeId>;

    /// The number of requirements of the signature that owns the keys.
    fn requirement_count(&self) -> u32;

    /// How many components a search starting at `start` may add. Structure
    /// cannot nest deeper than the start type without a matching requirement.
    fn depth_budget(&self, program: &Program, start: TypeId) -> u32 {
        program.type_depth(start) + self.requirement_count()
    }
}

/// Keys for lowering a function: the type parameters of its signature, with
/// exactly the conformances the signature states.
pub struct SignatureKeys<'a> {
    program: &'a Program,
    signature: Option<GenericSignatureId>,
}

impl<'a> SignatureKeys<'a> {
    pub fn new(program: &'a Program, signature: Option<GenericSignatureId>) -> SignatureKeys<'a> {
        SignatureKeys { program, signature }
    }
}

impl InterestingKeys for SignatureKeys<'_> {
    fn is_interesting_type(&self, ty: TypeId) -> bool {
        self.program.is_type_parameter(ty)
    }

    fn has_interesting_type(&self, ty: TypeId) -> bool {
        self.program.has_type_parameter(ty)
    }

    fn has_limited_interesting_conformances(&self, _ty: TypeId) -> bool {
        true
    }

    fn interesting_conformances(&self, ty: TypeId) -> SV4<ProtocolId> {
        match self.signature {
            None => SV4::new(),
            Some(sig) => self
                .program
                .signature(sig)
                .conforms_to(ty)
                .into_iter()
                .filter(|p| self.program.protocol(*p).requires_witness_table)
                .collect(),
        }
    }

    fn superclass_bound(&self, ty: TypeId) -> Option<TypeId> {
        self.program.signature(self.signature?).superclass_bound(ty)
    }

    fn requirement_count(&self) -> u32 {
        self.signature.map(|sig| self.program.signature(sig).requirements.len() as u32).unwrap_or(0)
    }
}

/// Keys for binding values inside a function body: any archetype, with any
/// conformance.
pub struct ArchetypeKeys<'a> {
    program: &'a Program,
    requirement_count: u32,
}

impl<'a> ArchetypeKeys<'a> {
    pub fn new(program: &'a Program, environment: Option<GenericSignatureId>) -> ArchetypeKeys<'a> {
        let requirement_count = environment.map(|e| program.signature(e).requirements.len() as u32).unwrap_or(0);
        ArchetypeKeys { program, requirement_count }
    }
}

impl InterestingKeys for ArchetypeKeys<'_> {
    fn is_interesting_type(&self, ty: TypeId) -> bool {
        self.program.is_archetype(ty)
    }

    fn has_interesting_type(&self, ty: TypeId) -> bool {
        self.program.has_archetype(ty)
    }

    fn has_limited_interesting_conformances(&self, _ty: TypeId) -> bool {
        false
    }

    fn interesting_conformances(&self, _ty: TypeId) -> SV4<ProtocolId> {
        SV4::new()
    }

    fn superclass_bound(&self, ty: TypeId) -> Option<TypeId> {
        self.program.archetype_superclass(ty)
    }

    fn requirement_count(&self) -> u32 {
        self.requirement_count
    }
}

#[derive(Debug, Clone, Default)]
pub struct FulfillmentMap {
    index: FxHashMap<FulfillmentKey, usize>,
    fulfillments: Vec<(FulfillmentKey, Fulfillment)>,
}

impl FulfillmentMap {
    pub fn new() -> FulfillmentMap {
        FulfillmentMap::default()
    }

    pub fn len(&self) -> usize {
        self.fulfillments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fulfillments.is_empty()
    }

    /// Fulfillments in the order their keys were first recorded.
    pub fn iter(&self) -> impl Iterator<Item = (&FulfillmentKey, &Fulfillment)> {
        self.fulfillments.iter().map(|(k, f)| (k, f))
    }

    pub fn get(&self, key: &FulfillmentKey) -> Option<&Fulfillment> {
        self.index.get(key).map(|i| &self.fulfillments[*i].1)
    }

    pub fn get_type_metadata(&self, ty: TypeId) -> Option<&Fulfillment> {
        self.get(&FulfillmentKey::metadata(ty))
    }

    pub fn get_witness_table(&self, ty: TypeId, protocol: ProtocolId) -> Option<&Fulfillment> {
        self.get(&FulfillmentKey::witness_table(ty, protocol))
    }

    /// Records a fulfillment for `key`. An existing one is only replaced by a
    /// strictly more complete state; path length is never compared.
    pub fn add_fulfillment(
        &mut self,
        key: FulfillmentKey,
        source_index: u32,
        path: MetadataPath,
        state: MetadataState,
    ) -> bool {
        match self.index.get(&key) {
            Some(i) => {
                let existing = &mut self.fulfillments[*i].1;
                if state > existing.state {
                    trace!("improving fulfillment {:?} from {:?} to {:?} via {}", key, existing.state, state, path);
                    *existing = Fulfillment { source_index, path, state };
                    true
                } else {
                    false
                }
            }
            None => {
                trace!("fulfilled {:?} from source {} via [{}]", key, source_index, path);
                self.index.insert(key, self.fulfillments.len());
                self.fulfillments.push((key, Fulfillment { source_index, path, state }));
                true
            }
        }
    }

    /// Searches the metadata of `ty`, available from `source` by following
    /// `path`, for interesting keys. Returns true if anything new was recorded.
    pub fn search_type_metadata(
        &mut self,
        cx: &Session,
        ty: TypeId,
        is_exact: bool,
        state: MetadataState,
        source: u32,
        path: &MetadataPath,
        keys: &impl InterestingKeys,
    ) -> bool {
        let budget = keys.depth_budget(cx.program, ty);
        self.search_type_metadata_in(cx, ty, is_exact, state, source, path, keys, budget)
    }

    fn search_type_metadata_in(
        &mut self,
        cx: &Session,
        ty: TypeId,
        is_exact: bool,
        state: MetadataState,
        source: u32,
        path: &MetadataPath,
        keys: &impl InterestingKeys,
        budget: u32,
    ) -> bool {
        if is_exact && keys.is_interesting_type(ty) {
            if !keys.has_interesting_type(ty) {
                return false;
            }
            let mut found = self.add_fulfillment(FulfillmentKey::metadata(ty), source, path.clone(), state);
            if let Some(superclass) = keys.superclass_bound(ty) {
                found |= self.search_nominal_type_metadata(cx, superclass, state, source, path, keys, budget);
            }
            return found;
        }
        if cx.program.nominal_of(ty).is_some() {
            return self.search_nominal_type_metadata(cx, ty, state, source, path, keys, budget);
        }
        false
    }

    fn search_nominal_type_metadata(
        &mut self,
        cx: &Session,
        ty: TypeId,
        state: MetadataState,
        source: u32,
        path: &MetadataPath,
        keys: &impl InterestingKeys,
        budget: u32,
    ) -> bool {
        if !keys.has_interesting_type(ty) || budget == 0 {
            return false;
        }
        let program = cx.program;
        let Some(nominal) = program.nominal_of(ty) else { return false };
        if program.nominal(nominal).generic_signature.is_none() {
            return false;
        }
        let subs = program.context_substitution_map(ty);
        let requirements = GenericTypeRequirements::new(cx, nominal);
        let mut found = false;
        for (index, requirement) in requirements.requirements().iter().enumerate() {
            let arg = program.subst_type(requirement.type_parameter, &subs);
            if !keys.has_interesting_type(arg) {
                continue;
            }
            match requirement.protocol {
                None => {
                    let arg_path = path.with(Component::NominalTypeArgument(index as u32));
                    let arg_state = state.presumed_for_type_argument();
                    found |= self.search_type_metadata_in(cx, arg, true, arg_state, source, &arg_path, keys, budget - 1);
                }
                Some(protocol) => {
                    if !keys.is_interesting_type(arg) {
                        continue;
                    }
                    let arg_path = path.with(Component::NominalTypeArgumentConformance(index as u32));
                    found |= self.search_witness_table_in(cx, arg, protocol, source, &arg_path, keys, budget - 1);
                }
            }
        }
        found
    }

    /// Searches a witness table for `ty: protocol`, available from `source` by
    /// following `path`.
    pub fn search_witness_table(
        &mut self,
        cx: &Session,
        ty: TypeId,
        protocol: ProtocolId,
        source: u32,
        path: &MetadataPath,
        keys: &impl InterestingKeys,
    ) -> bool {
        let budget = keys.depth_budget(cx.program, ty);
        self.search_witness_table_in(cx, ty, protocol, source, path, keys, budget)
    }

    fn search_witness_table_in(
        &mut self,
        cx: &Session,
        ty: TypeId,
        protocol: ProtocolId,
        source: u32,
        path: &MetadataPath,
        keys: &impl InterestingKeys,
        budget: u32,
    ) -> bool {
        assert!(
            cx.program.protocol(protocol).requires_witness_table,
            "searching a witness table of marker protocol {}",
            protocol
        );
        let interesting = if keys.is_interesting_type(ty) && keys.has_limited_interesting_conformances(ty) {
            let interesting = keys.interesting_conformances(ty);
            if interesting.is_empty() {
                return false;
            }
            Some(interesting)
        } else {
            None
        };
        self.search_witness_table_limited(cx, ty, protocol, source, path, keys, interesting.as_deref(), budget)
    }

    fn search_witness_table_limited(
        &mut self,
        cx: &Session,
        ty: TypeId,
        protocol: ProtocolId,
        source: u32,
        path: &MetadataPath,
        keys: &impl InterestingKeys,
        interesting: Option<&[ProtocolId]>,
        budget: u32,
    ) -> bool {
        let program = cx.program;
        let mut found = false;
        if budget > 0 {
            let info = cx.protocol_info(protocol, ProtocolInfoKind::RequirementSignature);
            for entry in info.entries() {
                let WitnessTableEntry::OutOfLineBase(base) = entry else { continue };
                let base_path = path.with(Component::OutOfLineBaseProtocol(info.base_index(*base)));
                found |= self.search_witness_table_limited(
                    cx,
                    ty,
                    *base,
                    source,
                    &base_path,
                    keys,
                    interesting,
                    budget - 1,
                );
            }

            // Associated conformances of a type parameter are only reachable
            // through a layout this module may rely on.
            let subject_is_parameter = program.is_type_parameter(ty) || program.is_archetype(ty);
            if subject_is_parameter && !cx.is_resilient_protocol(protocol) {
                let info = cx.protocol_info(protocol, ProtocolInfoKind::Full);
                for entry in info.entries() {
                    let WitnessTableEntry::AssociatedConformance(requirement) = entry else { continue };
                    if !program.protocol(requirement.requirement).requires_witness_table {
                        continue;
                    }
                    let associated = program.replace_self(requirement.association, ty);
                    if !keys.is_interesting_type(associated) {
                        continue;
                    }
                    let index = info.associated_conformance_index(requirement);
                    let associated_path = path.with(Component::AssociatedConformance(index));
                    found |= self.search_witness_table_in(
                        cx,
                        associated,
                        requirement.requirement,
                        source,
                        &associated_path,
                        keys,
                        budget - 1,
                    );
                }
            }
        }

        if interesting.is_none_or(|protocols| protocols.contains(&protocol)) {
            found |= self.add_fulfillment(
                FulfillmentKey::witness_table(ty, protocol),
                source,
                path.clone(),
                MetadataState::Complete,
            );
        }
        found
    }

    /// Searches the conditional requirements of a concrete conformance whose
    /// witness table is available from `source`.
    pub fn search_conformance(
        &mut self,
        cx: &Session,
        conformance: ConformanceId,
        source: u32,
        path: &MetadataPath,
        keys: &impl InterestingKeys,
    ) -> bool {
        let program = cx.program;
        let mut found = false;
        for (index, (ty, protocol)) in program.conditional_conformances(conformance).into_iter().enumerate() {
            let conditional_path = path.with(Component::ConditionalConformance(index as u32));
            found |= self.search_witness_table(cx, ty, protocol, source, &conditional_path, keys);
        }
        found
    }
}
