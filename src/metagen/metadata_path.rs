// Copyright (c) 2025 knix
// All rights reserved.

//! Metadata paths: how to reach a type's metadata or a witness table starting
//! from some other value that is already available.
//!
//! A path is pure data. Following it against a source value emits the loads
//! and runtime calls that walk each component in turn; following it with no
//! source value only advances the lookup key, which tells a caller what the
//! path resolves to without emitting anything.

use std::fmt::{Display, Formatter};

use fxhash::FxHashMap;
use smallvec::smallvec;

use crate::SV4;
use crate::bindings::GenericTypeRequirements;
use crate::conformance::{emit_associated_conformance_ref, witness_table_name};
use crate::ir::{Inst, MetadataRequest};
use crate::layout::{ProtocolInfoKind, WitnessIndex, WitnessTableEntry};
use crate::local_type_data::{FunctionEmitter, LocalTypeDataKey, LocalTypeDataKind, MetadataResponse};
use crate::program::ConformanceRef;
use crate::program::types::TypeId;
use crate::session::Session;

#[cfg(test)]
mod metadata_path_test;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    /// Generic argument metadata `i` of a nominal type's metadata, indexed by
    /// the nominal's generic type requirements.
    NominalTypeArgument(u32),
    /// Generic argument witness table `i` of a nominal type's metadata.
    NominalTypeArgumentConformance(u32),
    /// An inherited protocol's table, stored in a witness table.
    OutOfLineBaseProtocol(WitnessIndex),
    /// An associated conformance, fetched through a witness table.
    AssociatedConformance(WitnessIndex),
    /// A conditional requirement's table, stored in the private area of a
    /// witness table.
    ConditionalConformance(u32),
    /// Never resolvable at run time.
    Impossible,
}

impl Display for Component {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Component::NominalTypeArgument(i) => write!(f, "nominal_type_argument[{}]", i),
            Component::NominalTypeArgumentConformance(i) => write!(f, "nominal_type_argument_conformance[{}]", i),
            Component::OutOfLineBaseProtocol(i) => write!(f, "out_of_line_base_protocol[{}]", i),
            Component::AssociatedConformance(i) => write!(f, "associated_conformance[{}]", i),
            Component::ConditionalConformance(i) => write!(f, "conditional_conformance[{}]", i),
            Component::Impossible => write!(f, "impossible"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct MetadataPath {
    components: SV4<Component>,
}

impl MetadataPath {
    pub fn new() -> MetadataPath {
        MetadataPath::default()
    }

    pub fn impossible() -> MetadataPath {
        MetadataPath { components: smallvec![Component::Impossible] }
    }

    /// A copy of this path extended by one component.
    pub fn with(&self, component: Component) -> MetadataPath {
        let mut components = self.components.clone();
        components.push(component);
        MetadataPath { components }
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn is_impossible(&self) -> bool {
        self.components.contains(&Component::Impossible)
    }

    fn prefix(&self, len: usize) -> MetadataPath {
        MetadataPath { components: self.components[..len].into() }
    }

    pub fn follow_from_type_metadata(
        &self,
        cx: &mut Session,
        igf: &mut FunctionEmitter,
        source_type: TypeId,
        source: MetadataResponse,
        request: MetadataRequest,
        cache: Option<&mut PathCache>,
    ) -> MetadataResponse {
        let key = LocalTypeDataKey::metadata(source_type);
        self.follow_present(cx, igf, key, source, request, cache)
    }

    pub fn follow_from_witness_table(
        &self,
        cx: &mut Session,
        igf: &mut FunctionEmitter,
        conforming_type: TypeId,
        conformance: ConformanceRef,
        source: MetadataResponse,
        request: MetadataRequest,
        cache: Option<&mut PathCache>,
    ) -> MetadataResponse {
        let key = LocalTypeDataKey::witness_table(conforming_type, conformance);
        self.follow_present(cx, igf, key, source, request, cache)
    }

    fn follow_present(
        &self,
        cx: &mut Session,
        igf: &mut FunctionEmitter,
        key: LocalTypeDataKey,
        source: MetadataResponse,
        request: MetadataRequest,
        cache: Option<&mut PathCache>,
    ) -> MetadataResponse {
        match self.follow(cx, igf, key, Some(source), request, cache) {
            Some(response) => response,
            None => panic!("following {} from a present source produced no value", self),
        }
    }

    /// The key this path reaches from `source_key`, without emitting code.
    pub fn resolve_key(&self, cx: &mut Session, source_key: LocalTypeDataKey) -> LocalTypeDataKey {
        let mut key = source_key;
        for component in self.components.iter() {
            advance_key(cx, &mut key, *component);
        }
        key
    }

    /// Walks the path from `source`. With no source only the key moves and the
    /// result is `None`.
    pub fn follow(
        &self,
        cx: &mut Session,
        igf: &mut FunctionEmitter,
        source_key: LocalTypeDataKey,
        source: Option<MetadataResponse>,
        final_request: MetadataRequest,
        mut cache: Option<&mut PathCache>,
    ) -> Option<MetadataResponse> {
        let mut key = source_key;
        let Some(mut value) = source else {
            for component in self.components.iter() {
                advance_key(cx, &mut key, *component);
            }
            return None;
        };
        assert!(!self.is_impossible(), "following an impossible path from {:?}", source_key);

        let end = self.components.len();
        let mut next = 0;
        match cache.as_deref() {
            Some(cache) => {
                if let Some((cached, prefix_len)) = cache.find_prefix(self) {
                    value = cached;
                    if prefix_len == end {
                        return Some(value);
                    }
                    for component in self.components[..prefix_len].iter() {
                        advance_key(cx, &mut key, *component);
                    }
                    next = prefix_len;
                }
            }
            None => {
                // Pick up from the deepest step something else already computed
                let mut skip_key = key;
                for (i, component) in self.components.iter().enumerate() {
                    advance_key(cx, &mut skip_key, *component);
                    let skip_request = if i + 1 == end { final_request } else { MetadataRequest::ABSTRACT };
                    if let Some(found) = igf.try_get_concrete_local_type_data(skip_key, skip_request) {
                        key = skip_key;
                        value = found;
                        next = i + 1;
                    }
                }
            }
        }

        while next < end {
            let component = self.components[next];
            next += 1;
            let request = if next == end { final_request } else { MetadataRequest::ABSTRACT };
            value = follow_component(cx, igf, &mut key, value, component, request);
            match cache.as_deref_mut() {
                Some(cache) => cache.insert_new(self.prefix(next), value),
                None => igf.set_scoped_local_type_data(key, value),
            }
        }
        Some(value)
    }
}

impl Display for MetadataPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (i, component) in self.components.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{}", component)?;
        }
        Ok(())
    }
}

/// Values already computed for prefixes of paths from one source.
#[derive(Default)]
pub struct PathCache {
    values: FxHashMap<MetadataPath, MetadataResponse>,
}

impl PathCache {
    pub fn new() -> PathCache {
        PathCache::default()
    }

    /// The value of the longest cached non-empty prefix of `path`, and its length.
    pub fn find_prefix(&self, path: &MetadataPath) -> Option<(MetadataResponse, usize)> {
        (1..=path.len()).rev().find_map(|len| self.values.get(&path.prefix(len)).map(|v| (*v, len)))
    }

    /// Records the value of `path` unless one is already known.
    pub fn insert_new(&mut self, path: MetadataPath, value: MetadataResponse) {
        self.values.entry(path).or_insert(value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

fn advance_key(cx: &mut Session, key: &mut LocalTypeDataKey, component: Component) {
    match component {
        Component::NominalTypeArgument(index) | Component::NominalTypeArgumentConformance(index) => {
            let program = cx.program;
            assert_eq!(key.kind, LocalTypeDataKind::FormalTypeMetadata, "type argument of a witness table");
            let subs = program.context_substitution_map(key.ty);
            let nominal = nominal_of_source(cx, key.ty);
            let requirements = GenericTypeRequirements::new(cx, nominal);
            let requirement = requirements.requirements()[index as usize];
            key.ty = program.subst_type(requirement.type_parameter, &subs);
            match (component, requirement.protocol) {
                (Component::NominalTypeArgument(_), None) => {}
                (Component::NominalTypeArgumentConformance(_), Some(protocol)) => {
                    let conformance = match program.lookup_conformance_in_map(&subs, requirement.type_parameter, protocol)
                    {
                        Some(c) => c,
                        None => panic!("type argument {} lost its conformance", program.display_type(key.ty)),
                    };
                    *key = LocalTypeDataKey::witness_table(key.ty, conformance);
                }
                _ => panic!("requirement index mismatch following {} on {:?}", component, requirement),
            }
        }
        Component::OutOfLineBaseProtocol(index) => {
            let conformance = key.expect_conformance();
            let protocol = conformance.protocol(cx.program);
            let info = cx.protocol_info(protocol, ProtocolInfoKind::RequirementSignature);
            let WitnessTableEntry::OutOfLineBase(base) = info.entries()[index.value() as usize] else {
                panic!("entry {} of protocol {} is not a base", index, protocol)
            };
            let inherited = match conformance {
                ConformanceRef::Abstract(_) => ConformanceRef::Abstract(base),
                ConformanceRef::Concrete(c) => {
                    cx.program.inherited_conformance(c, base).unwrap_or(ConformanceRef::Abstract(base))
                }
            };
            *key = LocalTypeDataKey::witness_table(key.ty, inherited);
        }
        Component::AssociatedConformance(index) => {
            let program = cx.program;
            let conformance = key.expect_conformance();
            let protocol = conformance.protocol(program);
            let info = cx.protocol_info(protocol, ProtocolInfoKind::Full);
            let WitnessTableEntry::AssociatedConformance(requirement) = info.entries()[index.value() as usize] else {
                panic!("entry {} of protocol {} is not an associated conformance", index, protocol)
            };
            let mut associated_type = program.associated_type(conformance, key.ty, requirement.association);
            if let ConformanceRef::Concrete(c) = conformance {
                if let Some(normal) = program.conformance(c).as_normal() {
                    associated_type = program.map_type_into_context(normal.generic_signature, associated_type);
                }
            }
            let associated_conformance =
                program.associated_conformance(conformance, requirement.association, requirement.requirement);
            assert!(
                !associated_conformance.is_abstract() || program.is_archetype(associated_type),
                "couldn't find a concrete conformance for concrete type {}",
                program.display_type(associated_type)
            );
            *key = LocalTypeDataKey::witness_table(associated_type, associated_conformance);
        }
        Component::ConditionalConformance(index) => {
            let program = cx.program;
            let conformance = key.expect_conformance().expect_concrete();
            let conditional = program.conditional_conformances(conformance);
            let Some((requirement_ty, protocol)) = conditional.get(index as usize).copied() else {
                panic!("conformance {} has no conditional requirement {}", program.conformance_name(conformance), index)
            };
            let subs = program.conformance_substitutions(conformance);
            let ty = program.subst_type(requirement_ty, &subs);
            let requirement_conformance = program
                .lookup_conformance_in_map(&subs, requirement_ty, protocol)
                .unwrap_or(ConformanceRef::Abstract(protocol));
            *key = LocalTypeDataKey::witness_table(ty, requirement_conformance);
        }
        Component::Impossible => {}
    }
}

fn nominal_of_source(cx: &Session, ty: TypeId) -> crate::program::NominalId {
    let program = cx.program;
    let nominal_ty = match program.archetype_superclass(ty) {
        Some(superclass) => superclass,
        None => ty,
    };
    match program.nominal_of(nominal_ty) {
        Some(n) => n,
        None => panic!("type argument of non-nominal type {}", program.display_type(ty)),
    }
}

/// Steps across one component, updating `key` to describe the result.
fn follow_component(
    cx: &mut Session,
    igf: &mut FunctionEmitter,
    key: &mut LocalTypeDataKey,
    source: MetadataResponse,
    component: Component,
    request: MetadataRequest,
) -> MetadataResponse {
    let source_key = *key;
    advance_key(cx, key, component);
    let program = cx.program;
    match component {
        Component::NominalTypeArgument(index) => {
            let nominal = nominal_of_source(cx, source_key.ty);
            let value = igf.b.push_inst(Inst::NominalTypeArgument { metadata: source.value, nominal, index });
            igf.b.set_name(value, program.display_type(key.ty));
            let state = source.state.presumed_for_type_argument();
            igf.check_metadata_state(MetadataResponse::new(value, state), request)
        }
        Component::NominalTypeArgumentConformance(index) => {
            let nominal = nominal_of_source(cx, source_key.ty);
            let value =
                igf.b.push_inst(Inst::NominalTypeArgumentWitnessTable { metadata: source.value, nominal, index });
            igf.b.set_name(value, witness_table_name(cx, key.ty, key.expect_conformance()));
            MetadataResponse::complete(value)
        }
        Component::OutOfLineBaseProtocol(index) => {
            let value =
                igf.b.push_inst(Inst::LoadWitness { table: source.value, offset: index.for_protocol_witness_table() });
            igf.b.set_name(value, witness_table_name(cx, key.ty, key.expect_conformance()));
            MetadataResponse::complete(value)
        }
        Component::AssociatedConformance(index) => {
            let source_conformance = source_key.expect_conformance();
            let info = cx.protocol_info(source_conformance.protocol(program), ProtocolInfoKind::Full);
            let WitnessTableEntry::AssociatedConformance(requirement) = info.entries()[index.value() as usize] else {
                unreachable!("checked while advancing the key")
            };
            let parent_metadata = igf.emit_type_metadata_ref(cx, source_key.ty, MetadataRequest::ABSTRACT);
            let associated_metadata = igf.emit_type_metadata_ref(cx, key.ty, MetadataRequest::ABSTRACT);
            let value =
                emit_associated_conformance_ref(igf, parent_metadata.value, source.value, requirement, associated_metadata.value);
            igf.b.set_name(value, witness_table_name(cx, key.ty, key.expect_conformance()));
            MetadataResponse::complete(value)
        }
        Component::ConditionalConformance(index) => {
            let value =
                igf.b.push_inst(Inst::LoadWitness { table: source.value, offset: WitnessIndex::private_offset(index) });
            igf.b.set_name(value, witness_table_name(cx, key.ty, key.expect_conformance()));
            MetadataResponse::complete(value)
        }
        Component::Impossible => panic!("following an impossible path from {:?}", source_key),
    }
}
