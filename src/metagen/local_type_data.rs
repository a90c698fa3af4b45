// Copyright (c) 2025 knix
// All rights reserved.

//! Per-function knowledge of where type metadata and witness tables live.
//!
//! Concrete entries name a value that has already been emitted. Abstract
//! entries name a source value and a [`MetadataPath`] from it; the path is only
//! followed, and its result cached, the first time the key is asked for.

use fxhash::FxHashMap;
use log::trace;
use smallvec::smallvec;

use crate::SV4;
use crate::bindings::{GenericTypeRequirements, emit_generic_requirement_from_substitutions};
use crate::conformance::{emit_associated_conformance_ref, emit_associated_type_metadata_ref, witness_table_name};
use crate::fulfillment::{ArchetypeKeys, FulfillmentMap};
use crate::ir::{Callee, FunctionBuilder, Inst, InstId, IrType, MetadataRequest, MetadataState, RuntimeFn, Symbol};
use crate::layout::{ProtocolInfoKind, WitnessIndex, WitnessTableEntry};
use crate::metadata_path::MetadataPath;
use crate::program::types::{Type, TypeId};
use crate::program::{AssociatedConformance, ConformanceId, ConformanceRef, ProtocolId};
use crate::session::Session;


#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocalTypeDataKind {
    FormalTypeMetadata,
    AbstractWitnessTable(ProtocolId),
    ConcreteWitnessTable(ConformanceId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalTypeDataKey {
    pub ty: TypeId,
    pub kind: LocalTypeDataKind,
}

impl LocalTypeDataKey {
    pub fn metadata(ty: TypeId) -> LocalTypeDataKey {
        LocalTypeDataKey { ty, kind: LocalTypeDataKind::FormalTypeMetadata }
    }

    pub fn witness_table(ty: TypeId, conformance: ConformanceRef) -> LocalTypeDataKey {
        let kind = match conformance {
            ConformanceRef::Abstract(p) => LocalTypeDataKind::AbstractWitnessTable(p),
            ConformanceRef::Concrete(c) => LocalTypeDataKind::ConcreteWitnessTable(c),
        };
        LocalTypeDataKey { ty, kind }
    }

    pub fn is_metadata(&self) -> bool {
        self.kind == LocalTypeDataKind::FormalTypeMetadata
    }

    #[track_caller]
    pub fn expect_conformance(&self) -> ConformanceRef {
        match self.kind {
            LocalTypeDataKind::AbstractWitnessTable(p) => ConformanceRef::Abstract(p),
            LocalTypeDataKind::ConcreteWitnessTable(c) => ConformanceRef::Concrete(c),
            LocalTypeDataKind::FormalTypeMetadata => panic!("expect_conformance called on: {:?}", self),
        }
    }
}

/// An emitted value and the metadata state it is known to be in. Witness
/// tables are always complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MetadataResponse {
    pub value: InstId,
    pub state: MetadataState,
}

impl MetadataResponse {
    pub fn new(value: InstId, state: MetadataState) -> MetadataResponse {
        MetadataResponse { value, state }
    }

    pub fn complete(value: InstId) -> MetadataResponse {
        MetadataResponse { value, state: MetadataState::Complete }
    }
}

#[derive(Debug, Clone, Copy)]
struct ConcreteEntry {
    response: MetadataResponse,
    /// Conditional scope depth it was recorded at; 0 for entries valid in the
    /// whole function.
    depth: u32,
}

#[derive(Debug, Clone)]
struct AbstractSource {
    ty: TypeId,
    value: MetadataResponse,
}

#[derive(Debug, Clone)]
struct AbstractEntry {
    source: usize,
    path: MetadataPath,
    state: MetadataState,
}

#[derive(Default)]
pub struct LocalTypeDataCache {
    concrete: FxHashMap<LocalTypeDataKey, ConcreteEntry>,
    abstract_sources: Vec<AbstractSource>,
    abstract_entries: FxHashMap<LocalTypeDataKey, AbstractEntry>,
    depth: u32,
}

impl LocalTypeDataCache {
    fn get_concrete(&self, key: &LocalTypeDataKey) -> Option<MetadataResponse> {
        self.concrete.get(key).map(|e| e.response)
    }

    fn set(&mut self, key: LocalTypeDataKey, response: MetadataResponse, depth: u32) {
        self.concrete.insert(key, ConcreteEntry { response, depth });
    }

    pub fn has_concrete(&self, key: &LocalTypeDataKey) -> bool {
        self.concrete.contains_key(key)
    }

    pub fn has_abstract(&self, key: &LocalTypeDataKey) -> bool {
        self.abstract_entries.contains_key(key)
    }
}

/// Emits the body of one function, tracking local type data as it goes.
pub struct FunctionEmitter {
    pub b: FunctionBuilder,
    cache: LocalTypeDataCache,
}

impl FunctionEmitter {
    pub fn new(b: FunctionBuilder) -> FunctionEmitter {
        FunctionEmitter { b, cache: LocalTypeDataCache::default() }
    }

    pub fn for_function(cx: &Session, symbol: Symbol, params: Vec<IrType>, ret: IrType) -> FunctionEmitter {
        let mut b = FunctionBuilder::new(symbol, params, ret, cx.config.enable_value_names);
        if cx.config.optimize_for_size {
            b.set_no_inline();
        }
        FunctionEmitter::new(b)
    }

    pub fn cache(&self) -> &LocalTypeDataCache {
        &self.cache
    }

    // Scopes

    /// Entries recorded until the matching [`FunctionEmitter::end_conditional_scope`]
    /// are dropped at that point; they do not dominate code after it.
    pub fn begin_conditional_scope(&mut self) {
        self.cache.depth += 1;
    }

    pub fn end_conditional_scope(&mut self) {
        assert!(self.cache.depth > 0, "unbalanced conditional scope");
        let depth = self.cache.depth;
        self.cache.concrete.retain(|_, e| e.depth < depth);
        self.cache.depth -= 1;
    }

    // Concrete data

    /// Valid from here to the end of the innermost conditional scope.
    pub fn set_scoped_local_type_data(&mut self, key: LocalTypeDataKey, response: MetadataResponse) {
        let depth = self.cache.depth;
        self.cache.set(key, response, depth);
    }

    /// Valid for the rest of the function.
    pub fn set_unscoped_local_type_data(&mut self, key: LocalTypeDataKey, response: MetadataResponse) {
        self.cache.set(key, response, 0);
    }

    pub fn set_scoped_local_type_metadata(&mut self, ty: TypeId, response: MetadataResponse) {
        self.set_scoped_local_type_data(LocalTypeDataKey::metadata(ty), response);
    }

    /// An already-emitted value for `key`, dynamically checked up to the
    /// requested state if it is not statically known to be there.
    pub fn try_get_concrete_local_type_data(
        &mut self,
        key: LocalTypeDataKey,
        request: MetadataRequest,
    ) -> Option<MetadataResponse> {
        let response = self.cache.get_concrete(&key)?;
        if request.is_satisfied_by(response.state) {
            return Some(response);
        }
        Some(self.check_metadata_state(response, request))
    }

    /// Emits a runtime check when `response` might not be in the requested state.
    pub fn check_metadata_state(&mut self, response: MetadataResponse, request: MetadataRequest) -> MetadataResponse {
        if request.is_satisfied_by(response.state) {
            return response;
        }
        let request_value = self.b.push_inst(Inst::Request(request));
        let value = self.b.call(
            Callee::Runtime(RuntimeFn::CheckMetadataState),
            smallvec![request_value, response.value],
            IrType::TypeMetadataPtr,
        );
        MetadataResponse::new(value, request.state)
    }

    // Abstract data

    /// Records every archetype reachable from `metadata`, the metadata of `ty`,
    /// as lazily available.
    pub fn bind_local_type_data_from_type_metadata(
        &mut self,
        cx: &Session,
        ty: TypeId,
        is_exact: bool,
        metadata: InstId,
        state: MetadataState,
    ) {
        let program = cx.program;
        if is_exact {
            self.set_unscoped_local_type_data(LocalTypeDataKey::metadata(ty), MetadataResponse::new(metadata, state));
        }
        let keys = ArchetypeKeys::new(program, program.generic_environment_of(ty));
        let mut fulfillments = FulfillmentMap::new();
        if !fulfillments.search_type_metadata(cx, ty, is_exact, state, 0, &MetadataPath::new(), &keys) {
            return;
        }
        self.add_abstract_for_fulfillments(ty, MetadataResponse::new(metadata, state), &fulfillments);
    }

    fn add_abstract_for_fulfillments(&mut self, ty: TypeId, value: MetadataResponse, fulfillments: &FulfillmentMap) {
        let source = self.cache.abstract_sources.len();
        self.cache.abstract_sources.push(AbstractSource { ty, value });
        for (key, fulfillment) in fulfillments.iter() {
            let key = match key.protocol {
                None => LocalTypeDataKey::metadata(key.ty),
                Some(p) => LocalTypeDataKey::witness_table(key.ty, ConformanceRef::Abstract(p)),
            };
            if self.cache.has_concrete(&key) || self.cache.has_abstract(&key) {
                continue;
            }
            trace!("abstract local type data {:?} via [{}]", key, fulfillment.path);
            self.cache.abstract_entries.insert(
                key,
                AbstractEntry { source, path: fulfillment.path.clone(), state: fulfillment.state },
            );
        }
    }

    /// Binds the conditional requirement tables stored in the private area of
    /// `wtable`, a table for `conformance`.
    pub fn bind_local_type_data_from_self_witness_table(
        &mut self,
        cx: &Session,
        conformance: ConformanceId,
        wtable: InstId,
    ) {
        let program = cx.program;
        let conf = program.conformance(program.root_conformance(conformance));
        let signature = conf.as_normal().and_then(|n| n.generic_signature);
        for (index, (ty, protocol)) in program.conditional_conformances(conformance).into_iter().enumerate() {
            let ty = program.map_type_into_context(signature, ty);
            if !program.is_archetype(ty) {
                continue;
            }
            let table = self.b.push_inst(Inst::LoadWitness { table: wtable, offset: WitnessIndex::private_offset(index as u32) });
            self.b.set_name(table, witness_table_name(cx, ty, ConformanceRef::Abstract(protocol)));
            let key = LocalTypeDataKey::witness_table(ty, ConformanceRef::Abstract(protocol));
            self.set_unscoped_local_type_data(key, MetadataResponse::complete(table));
        }
    }

    /// Concrete data first, then an abstract entry, whose path is followed now.
    pub fn try_get_local_type_data(
        &mut self,
        cx: &mut Session,
        key: LocalTypeDataKey,
        request: MetadataRequest,
    ) -> Option<MetadataResponse> {
        if let Some(found) = self.try_get_concrete_local_type_data(key, request) {
            return Some(found);
        }
        let entry = self.cache.abstract_entries.get(&key)?.clone();
        let source = self.cache.abstract_sources[entry.source].clone();
        trace!("following [{}] for {:?} (statically {:?})", entry.path, key, entry.state);
        let response = entry.path.follow_from_type_metadata(cx, self, source.ty, source.value, request, None);
        self.set_scoped_local_type_data(key, response);
        Some(response)
    }

    // Emission

    pub fn emit_type_metadata_ref(&mut self, cx: &mut Session, ty: TypeId, request: MetadataRequest) -> MetadataResponse {
        let key = LocalTypeDataKey::metadata(ty);
        if let Some(found) = self.try_get_local_type_data(cx, key, request) {
            return found;
        }
        let program = cx.program;
        let response = match program.get_type(ty) {
            Type::Archetype(archetype) => {
                let Type::DependentMember(member) = program.get_type(archetype.interface) else {
                    panic!("no metadata bound for archetype {}", program.display_type(ty))
                };
                let parent = program.map_type_into_context(Some(archetype.environment), member.base);
                let protocol = program.assoc_type(member.assoc).protocol;
                let wtable = self.emit_archetype_witness_table_ref(cx, parent, protocol);
                let parent_metadata = self.emit_type_metadata_ref(cx, parent, MetadataRequest::ABSTRACT);
                emit_associated_type_metadata_ref(cx, self, parent_metadata.value, wtable, member.assoc, request)
            }
            Type::GenericParam(_) | Type::DependentMember(_) => {
                panic!("emit_type_metadata_ref on interface type {}", program.display_type(ty))
            }
            Type::Nominal(nominal) if program.has_archetype(ty) => {
                // Generic arguments come from local data; the accessor instantiates.
                let subs = program.context_substitution_map(ty);
                let requirements = GenericTypeRequirements::new(cx, nominal.decl);
                let request_value = self.b.push_inst(Inst::Request(request));
                let mut args: SV4<InstId> = smallvec![request_value];
                for requirement in requirements.requirements() {
                    args.push(emit_generic_requirement_from_substitutions(cx, self, *requirement, &subs));
                }
                let value = self.b.call(
                    Callee::Direct(Symbol::TypeMetadataAccessor(nominal.decl)),
                    args,
                    IrType::TypeMetadataPtr,
                );
                MetadataResponse::new(value, request.state)
            }
            _ => {
                let value = self.b.push_inst(Inst::TypeMetadataRef { ty, request });
                MetadataResponse::new(value, request.state)
            }
        };
        self.b.set_name(response.value, program.display_type(ty));
        self.set_scoped_local_type_data(key, response);
        response
    }

    /// The table for `archetype: protocol`: bound directly, or reached from a
    /// bound table of a refining protocol, or through the parent's associated
    /// conformance.
    pub fn emit_archetype_witness_table_ref(
        &mut self,
        cx: &mut Session,
        archetype: TypeId,
        protocol: ProtocolId,
    ) -> InstId {
        let key = LocalTypeDataKey::witness_table(archetype, ConformanceRef::Abstract(protocol));
        if let Some(found) = self.try_get_local_type_data(cx, key, MetadataRequest::COMPLETE) {
            return found.value;
        }
        let program = cx.program;
        let refining = program
            .archetype_conforms_to(archetype)
            .into_iter()
            .filter(|p| *p != protocol)
            .find_map(|p| base_protocol_path(cx, p, protocol).map(|path| (p, path)));
        let value = if let Some((refining, path)) = refining {
            let mut table = self.emit_archetype_witness_table_ref(cx, archetype, refining);
            for index in path {
                table = self.b.push_inst(Inst::LoadWitness { table, offset: index.for_protocol_witness_table() });
            }
            table
        } else {
            let archetype_ty = *program.get_type(archetype).expect_archetype();
            let Type::DependentMember(member) = program.get_type(archetype_ty.interface) else {
                panic!(
                    "no witness table bound for {}: {}",
                    program.display_type(archetype),
                    program.name(program.protocol(protocol).name)
                )
            };
            let parent = program.map_type_into_context(Some(archetype_ty.environment), member.base);
            let source_protocol = program.assoc_type(member.assoc).protocol;
            let association = program.dependent_member(program.self_type(), member.assoc);
            let requirement = AssociatedConformance { source_protocol, association, requirement: protocol };
            let parent_table = self.emit_archetype_witness_table_ref(cx, parent, source_protocol);
            let parent_metadata = self.emit_type_metadata_ref(cx, parent, MetadataRequest::ABSTRACT);
            let associated_metadata = self.emit_type_metadata_ref(cx, archetype, MetadataRequest::ABSTRACT);
            emit_associated_conformance_ref(
                self,
                parent_metadata.value,
                parent_table,
                requirement,
                associated_metadata.value,
            )
        };
        self.b.set_name(value, witness_table_name(cx, archetype, ConformanceRef::Abstract(protocol)));
        self.set_scoped_local_type_data(key, MetadataResponse::complete(value));
        value
    }
}

/// Witness indices leading from a table for `from` to its inherited table for `to`.
pub fn base_protocol_path(cx: &Session, from: ProtocolId, to: ProtocolId) -> Option<Vec<WitnessIndex>> {
    if from == to {
        return Some(Vec::new());
    }
    let info = cx.protocol_info(from, ProtocolInfoKind::RequirementSignature);
    info.entries().iter().enumerate().find_map(|(i, entry)| match entry {
        WitnessTableEntry::OutOfLineBase(base) => base_protocol_path(cx, *base, to).map(|mut rest| {
            rest.insert(0, WitnessIndex::new(i as u32));
            rest
        }),
        _ => None,
    })
}
