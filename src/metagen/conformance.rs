// Copyright (c) 2025 knix
// All rights reserved.

//! Classifying conformances, and reaching their witness tables at run time.

use ahash::HashSetExt;
use fxhash::FxHashSet;
use log::debug;
use smallvec::smallvec;

use crate::SV4;
use crate::ir::{
    AtomicOrdering, Callee, GlobalInit, Inst, InstId, IrGlobal, IrType, Linkage, MetadataRequest, RuntimeFn, Symbol,
};
use crate::layout::ProtocolInfoKind;
use crate::local_type_data::{FunctionEmitter, LocalTypeDataKey, MetadataResponse};
use crate::program::types::TypeId;
use crate::program::{
    AssocTypeId, AssociatedConformance, ConformanceId, ConformanceKind, ConformanceRef, MethodId, ProtocolId,
    Requirement,
};
use crate::session::Session;


/// How code reaches the witness table of a conformance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConformanceInfo {
    /// One constant table shared by every use.
    Direct { root: ConformanceId },
    /// A table that may need instantiating or uniquing at run time.
    Accessor { conformance: ConformanceId },
}

impl ConformanceInfo {
    pub fn is_direct(&self) -> bool {
        matches!(self, ConformanceInfo::Direct { .. })
    }

    /// Emits a reference to the table for `conforming_type`. `metadata_cache`
    /// holds the conforming type's metadata once it has been emitted.
    pub fn get_table(
        &self,
        cx: &mut Session,
        igf: &mut FunctionEmitter,
        conforming_type: TypeId,
        metadata_cache: &mut Option<InstId>,
    ) -> InstId {
        match *self {
            ConformanceInfo::Direct { root } => igf.b.global_addr(Symbol::ProtocolWitnessTable(root)),
            ConformanceInfo::Accessor { conformance } => {
                // Archetype-dependent tables can't be cached
                if cx.program.has_archetype(conforming_type) {
                    return emit_witness_table_accessor_call(cx, igf, conforming_type, conformance, metadata_cache);
                }
                let accessor = get_witness_table_lazy_access_function(cx, conformance);
                igf.b.call(Callee::Direct(accessor), SV4::new(), IrType::WitnessTablePtr)
            }
        }
    }

    /// The table's symbol, when code may refer to it as a link-time constant.
    pub fn try_get_constant_table(&self, cx: &Session, _conforming_type: TypeId) -> Option<Symbol> {
        match *self {
            ConformanceInfo::Direct { root } => {
                if cx.config.lazy_initialize_conformances
                    && cx.program.conformance_module(root) != cx.current_module
                {
                    return None;
                }
                Some(Symbol::ProtocolWitnessTable(root))
            }
            ConformanceInfo::Accessor { .. } => None,
        }
    }
}

impl Session<'_> {
    /// Whether the shape of the conformance's witness table is not fixed at
    /// compile time. The protocol must be resilient, and the conformance must
    /// either live in another module or have a generic conforming type.
    pub fn is_resilient_conformance(&self, conformance: ConformanceId) -> bool {
        let program = self.program;
        let root = program.conformance(program.root_conformance(conformance));
        let ConformanceKind::Normal(normal) = &root.kind else {
            return false;
        };
        let protocol = program.protocol(root.protocol);
        if !protocol.is_resilient {
            return false;
        }
        normal.module != protocol.module || normal.is_generic_context()
    }

    /// Whether the table must be instantiated per conforming type.
    pub fn is_dependent_conformance(&self, conformance: ConformanceId) -> bool {
        let mut visited = FxHashSet::new();
        self.is_dependent_conformance_in(self.program.root_conformance(conformance), &mut visited)
    }

    fn is_dependent_conformance_in(&self, root: ConformanceId, visited: &mut FxHashSet<ConformanceId>) -> bool {
        let program = self.program;
        let conf = program.conformance(root);
        let Some(normal) = conf.as_normal() else {
            return false;
        };
        // Assume the best on revisits; we want the maximal fixed point
        if !visited.insert(root) {
            return false;
        }
        if self.is_resilient_conformance(root) {
            return true;
        }

        for requirement in program.protocol(conf.protocol).associated_conformances.iter() {
            let associated = program.associated_conformance(
                ConformanceRef::Concrete(root),
                requirement.association,
                requirement.requirement,
            );
            let dependent = match associated {
                ConformanceRef::Abstract(_) => true,
                ConformanceRef::Concrete(c) => self.is_dependent_conformance_in(program.root_conformance(c), visited),
            };
            if dependent {
                return true;
            }
        }

        if normal.is_generic_context()
            && normal.type_witnesses.iter().any(|(_, witness)| program.has_type_parameter(*witness))
        {
            return true;
        }

        normal.conditional_requirements.iter().any(|r| match r {
            Requirement::Conformance { protocol, .. } => program.protocol(*protocol).requires_witness_table,
            _ => false,
        })
    }

    pub fn is_synthesized_non_unique(&self, conformance: ConformanceId) -> bool {
        let program = self.program;
        let root = program.conformance(program.root_conformance(conformance));
        root.as_normal().is_some_and(|n| n.is_synthesized_non_unique)
    }

    /// How code reaches `conformance`'s table. The decision is made once per
    /// root conformance.
    pub fn conformance_info(&mut self, protocol: ProtocolId, conformance: ConformanceId) -> ConformanceInfo {
        let program = self.program;
        assert_eq!(program.conformance(conformance).protocol, protocol, "conformance is for the wrong protocol");
        let root = program.root_conformance(conformance);
        let needs_accessor = match self.conformance_strategies.get(&root) {
            Some(known) => *known,
            None => {
                let needs_accessor = program.protocol(protocol).is_resilient
                    || self.is_dependent_conformance(root)
                    || self.is_synthesized_non_unique(root);
                debug!(
                    "conformance {} is reached {}",
                    program.conformance_name(root),
                    if needs_accessor { "through an accessor" } else { "directly" }
                );
                self.conformance_strategies.insert(root, needs_accessor);
                needs_accessor
            }
        };
        if needs_accessor { ConformanceInfo::Accessor { conformance } } else { ConformanceInfo::Direct { root } }
    }
}

/// A readable name for a witness table value.
pub fn witness_table_name(cx: &Session, ty: TypeId, conformance: ConformanceRef) -> String {
    let program = cx.program;
    let protocol = conformance.protocol(program);
    format!("{}.{}", program.display_type(ty), program.name(program.protocol(protocol).name))
}

/// The table proving `ty: conformance`, from local data when possible.
pub fn emit_witness_table_ref(
    cx: &mut Session,
    igf: &mut FunctionEmitter,
    ty: TypeId,
    conformance: ConformanceRef,
) -> InstId {
    let mut metadata_cache = None;
    emit_witness_table_ref_cached(cx, igf, ty, &mut metadata_cache, conformance)
}

pub fn emit_witness_table_ref_cached(
    cx: &mut Session,
    igf: &mut FunctionEmitter,
    ty: TypeId,
    metadata_cache: &mut Option<InstId>,
    conformance: ConformanceRef,
) -> InstId {
    let concrete = match conformance {
        ConformanceRef::Abstract(protocol) => return igf.emit_archetype_witness_table_ref(cx, ty, protocol),
        ConformanceRef::Concrete(c) => c,
    };
    let key = LocalTypeDataKey::witness_table(ty, conformance);
    if let Some(found) = igf.try_get_local_type_data(cx, key, MetadataRequest::COMPLETE) {
        return found.value;
    }
    let protocol = cx.program.conformance(concrete).protocol;
    let info = cx.conformance_info(protocol, concrete);
    let table = info.get_table(cx, igf, ty, metadata_cache);
    igf.b.set_name(table, witness_table_name(cx, ty, conformance));
    igf.set_scoped_local_type_data(key, MetadataResponse::complete(table));
    table
}

/// A stack buffer holding the tables of `conformance`'s conditional
/// requirements, in declaration order; undef when there are none.
pub fn emit_conditional_conformances_buffer(
    cx: &mut Session,
    igf: &mut FunctionEmitter,
    conformance: ConformanceId,
) -> InstId {
    let program = cx.program;
    let subs = program.conformance_substitutions(conformance);
    let mut tables: SV4<InstId> = SV4::new();
    for (ty, protocol) in program.conditional_conformances(conformance) {
        let subst_ty = program.subst_type(ty, &subs);
        let Some(requirement_conformance) = program.lookup_conformance_in_map(&subs, ty, protocol) else {
            panic!("conditional conformance {} of {} must be valid", program.display_type(subst_ty), conformance)
        };
        tables.push(emit_witness_table_ref(cx, igf, subst_ty, requirement_conformance));
    }
    if tables.is_empty() {
        return igf.b.push_inst(Inst::Undef(IrType::WitnessTablePtrPtr));
    }
    let buffer = igf.b.push_inst(Inst::BufferAlloca { words: tables.len() as u32 });
    igf.b.set_name(buffer, "conditional.tables");
    for (index, table) in tables.into_iter().enumerate() {
        igf.b.push_inst(Inst::BufferStore { buffer, index: index as u32, value: table });
    }
    buffer
}

fn emit_witness_table_accessor_call(
    cx: &mut Session,
    igf: &mut FunctionEmitter,
    conforming_type: TypeId,
    conformance: ConformanceId,
    metadata_cache: &mut Option<InstId>,
) -> InstId {
    let program = cx.program;
    let descriptor = igf.b.global_addr(Symbol::ProtocolConformanceDescriptor(program.root_conformance(conformance)));
    let metadata = match *metadata_cache {
        Some(metadata) => metadata,
        None => {
            let metadata = igf.emit_type_metadata_ref(cx, conforming_type, MetadataRequest::COMPLETE).value;
            *metadata_cache = Some(metadata);
            metadata
        }
    };
    let conditional_tables = emit_conditional_conformances_buffer(cx, igf, conformance);
    igf.b.call(
        Callee::Runtime(RuntimeFn::GetWitnessTable),
        smallvec![descriptor, metadata, conditional_tables],
        IrType::WitnessTablePtr,
    )
}

/// The once-initialized accessor for `conformance`'s table, defined on first
/// request. It caches the runtime's answer in a zeroed global.
pub fn get_witness_table_lazy_access_function(cx: &mut Session, conformance: ConformanceId) -> Symbol {
    let program = cx.program;
    let conf = program.conformance(conformance);
    let root = program.root_conformance(conformance);
    assert!(!program.has_archetype(conf.ty), "lazy witness table accessor for archetype-dependent type");
    let accessor = Symbol::WitnessTableLazyAccessor { conformance: root, ty: conf.ty };
    if cx.module.has_function(accessor) {
        return accessor;
    }
    let cache = Symbol::WitnessTableLazyCache { conformance: root, ty: conf.ty };
    cx.module.get_or_add_global(cache, || IrGlobal {
        symbol: cache,
        init: GlobalInit::Zeroed { words: 1 },
        is_constant: false,
        linkage: Linkage::Hidden,
    });

    let mut igf = FunctionEmitter::for_function(cx, accessor, Vec::new(), IrType::WitnessTablePtr);
    emit_cache_access_function(&mut igf, cache, |igf| {
        let mut metadata_cache = None;
        emit_witness_table_accessor_call(cx, igf, conf.ty, conformance, &mut metadata_cache)
    });
    debug!("defined lazy witness table accessor {}", accessor);
    cx.module.add_function(igf.b.finish());
    accessor
}

/// `cache != null ? cache : (cache = compute())`, with acquire and release
/// ordering on the cache variable.
fn emit_cache_access_function(
    igf: &mut FunctionEmitter,
    cache: Symbol,
    compute: impl FnOnce(&mut FunctionEmitter) -> InstId,
) {
    let entry = igf.b.cur_block();
    let cached = igf.b.push_inst(Inst::LoadGlobal { global: cache, ordering: AtomicOrdering::Acquire });
    let is_null = igf.b.push_inst(Inst::IsNull(cached));
    let miss = igf.b.push_block();
    let cont = igf.b.push_block();
    igf.b.push_inst(Inst::JumpIf { cond: is_null, cons: miss, alt: cont });

    igf.b.goto_block(miss);
    igf.begin_conditional_scope();
    let computed = compute(igf);
    igf.b.push_inst(Inst::StoreGlobal { global: cache, value: computed, ordering: AtomicOrdering::Release });
    let miss_end = igf.b.cur_block();
    igf.b.push_inst(Inst::Jump(cont));
    igf.end_conditional_scope();

    igf.b.goto_block(cont);
    let result = igf.b.push_inst(Inst::ComeFrom { incomings: smallvec![(entry, cached), (miss_end, computed)] });
    igf.b.ret(Some(result));
}

/// `swift_getAssociatedConformanceWitness`-style lookup through `wtable`.
pub fn emit_associated_conformance_ref(
    igf: &mut FunctionEmitter,
    parent_metadata: InstId,
    wtable: InstId,
    requirement: AssociatedConformance,
    associated_metadata: InstId,
) -> InstId {
    let base = igf.b.global_addr(Symbol::ProtocolRequirementsBaseDescriptor(requirement.source_protocol));
    let descriptor = igf.b.global_addr(Symbol::AssociatedConformanceDescriptor(requirement));
    igf.b.call(
        Callee::Runtime(RuntimeFn::GetAssociatedConformanceWitness),
        smallvec![wtable, parent_metadata, associated_metadata, base, descriptor],
        IrType::WitnessTablePtr,
    )
}

/// The metadata of an associated type, fetched through `wtable`.
pub fn emit_associated_type_metadata_ref(
    cx: &Session,
    igf: &mut FunctionEmitter,
    parent_metadata: InstId,
    wtable: InstId,
    assoc: AssocTypeId,
    request: MetadataRequest,
) -> MetadataResponse {
    let request_value = igf.b.push_inst(Inst::Request(request));
    let protocol = cx.program.assoc_type(assoc).protocol;
    let base = igf.b.global_addr(Symbol::ProtocolRequirementsBaseDescriptor(protocol));
    let descriptor = igf.b.global_addr(Symbol::AssociatedTypeDescriptor(assoc));
    let value = igf.b.call(
        Callee::Runtime(RuntimeFn::GetAssociatedTypeWitness),
        smallvec![request_value, wtable, parent_metadata, base, descriptor],
        IrType::TypeMetadataPtr,
    );
    MetadataResponse::new(value, request.state)
}

/// Loads the witness for `method` out of a table for its protocol.
pub fn emit_witness_method_value(cx: &Session, igf: &mut FunctionEmitter, wtable: InstId, method: MethodId) -> InstId {
    let protocol = cx.program.method(method).protocol;
    let info = cx.protocol_info(protocol, ProtocolInfoKind::Full);
    let index = info.function_index(method);
    let value = igf.b.push_inst(Inst::LoadWitness { table: wtable, offset: index.for_protocol_witness_table() });
    igf.b.set_name(value, cx.program.name(cx.program.method(method).name).to_string());
    value
}
