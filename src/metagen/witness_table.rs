// Copyright (c) 2025 knix
// All rights reserved.

//! Emitting the witness table and conformance descriptor of a conformance.
//!
//! A table starts with its conformance descriptor and then holds one word per
//! entry of the protocol's layout. Conditional requirement tables are kept in
//! the private area before the table, closest to offset 0. Resilient
//! conformances get no table; their witnesses are listed in the descriptor and
//! the runtime builds the table.

use std::time::Instant;

use itertools::Itertools;
use log::{debug, info};

use crate::conformance::ConformanceInfo;
use crate::fulfillment::{ArchetypeKeys, FulfillmentMap};
use crate::ir::{
    GlobalInit, Inst, InstId, IrGlobal, IrType, Linkage, MetadataRequest, MetadataState, Symbol, WitnessValue,
};
use crate::layout::{ProtocolInfoKind, WitnessIndex, WitnessTableEntry};
use crate::local_type_data::{FunctionEmitter, LocalTypeDataKey, MetadataResponse};
use crate::metadata_path::MetadataPath;
use crate::program::types::TypeId;
use crate::program::{
    AssociatedConformance, ConformanceId, ConformanceRef, GenericSignatureId, ProtocolId, Requirement,
    WitnessRecordEntry, WitnessTableRecord,
};
use crate::session::Session;

#[cfg(test)]
mod witness_table_test;

/// How a conformance descriptor refers to its conforming type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TypeReferenceKind {
    DirectTypeDescriptor = 0,
    IndirectTypeDescriptor = 1,
    DirectObjCClassName = 2,
    IndirectObjCClass = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConformanceFlags(u32);

impl ConformanceFlags {
    const TYPE_REFERENCE_KIND_SHIFT: u32 = 3;
    const TYPE_REFERENCE_KIND_MASK: u32 = 0x7 << Self::TYPE_REFERENCE_KIND_SHIFT;
    const IS_RETROACTIVE: u32 = 0x1 << 6;
    const IS_SYNTHESIZED_NON_UNIQUE: u32 = 0x1 << 7;
    const NUM_CONDITIONAL_REQUIREMENTS_SHIFT: u32 = 8;
    const NUM_CONDITIONAL_REQUIREMENTS_MASK: u32 = 0xFF << Self::NUM_CONDITIONAL_REQUIREMENTS_SHIFT;
    const HAS_RESILIENT_WITNESSES: u32 = 0x1 << 16;
    const HAS_GENERIC_WITNESS_TABLE: u32 = 0x1 << 17;

    fn with_bit(self, bit: u32, value: bool) -> Self {
        ConformanceFlags(if value { self.0 | bit } else { self.0 & !bit })
    }

    pub fn with_type_reference_kind(self, kind: TypeReferenceKind) -> Self {
        ConformanceFlags(
            (self.0 & !Self::TYPE_REFERENCE_KIND_MASK) | ((kind as u32) << Self::TYPE_REFERENCE_KIND_SHIFT),
        )
    }

    pub fn with_is_retroactive(self, value: bool) -> Self {
        self.with_bit(Self::IS_RETROACTIVE, value)
    }

    pub fn with_is_synthesized_non_unique(self, value: bool) -> Self {
        self.with_bit(Self::IS_SYNTHESIZED_NON_UNIQUE, value)
    }

    #[track_caller]
    pub fn with_num_conditional_requirements(self, count: u32) -> Self {
        assert!(count <= 0xFF, "too many conditional requirements: {}", count);
        ConformanceFlags(
            (self.0 & !Self::NUM_CONDITIONAL_REQUIREMENTS_MASK) | (count << Self::NUM_CONDITIONAL_REQUIREMENTS_SHIFT),
        )
    }

    pub fn with_has_resilient_witnesses(self, value: bool) -> Self {
        self.with_bit(Self::HAS_RESILIENT_WITNESSES, value)
    }

    pub fn with_has_generic_witness_table(self, value: bool) -> Self {
        self.with_bit(Self::HAS_GENERIC_WITNESS_TABLE, value)
    }

    pub fn type_reference_kind(&self) -> u32 {
        (self.0 & Self::TYPE_REFERENCE_KIND_MASK) >> Self::TYPE_REFERENCE_KIND_SHIFT
    }

    pub fn is_retroactive(&self) -> bool {
        self.0 & Self::IS_RETROACTIVE != 0
    }

    pub fn is_synthesized_non_unique(&self) -> bool {
        self.0 & Self::IS_SYNTHESIZED_NON_UNIQUE != 0
    }

    pub fn num_conditional_requirements(&self) -> u32 {
        (self.0 & Self::NUM_CONDITIONAL_REQUIREMENTS_MASK) >> Self::NUM_CONDITIONAL_REQUIREMENTS_SHIFT
    }

    pub fn has_resilient_witnesses(&self) -> bool {
        self.0 & Self::HAS_RESILIENT_WITNESSES != 0
    }

    pub fn has_generic_witness_table(&self) -> bool {
        self.0 & Self::HAS_GENERIC_WITNESS_TABLE != 0
    }

    pub fn bits(&self) -> u32 {
        self.0
    }
}

/// A witness for the runtime to place, keyed by its requirement's descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResilientWitness {
    pub requirement: Symbol,
    pub witness: WitnessValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenericWitnessTableHeader {
    pub witness_table_size: u16,
    /// `private_size << 1 | requires_instantiation`
    pub private_size_and_requires_instantiation: u16,
    pub instantiator: Option<Symbol>,
    pub private_data: Symbol,
}

impl GenericWitnessTableHeader {
    /// Sizes are in words. The private size must fit in 15 bits.
    #[track_caller]
    pub fn new(
        table_size: u32,
        private_size: u32,
        requires_instantiation: bool,
        instantiator: Option<Symbol>,
        private_data: Symbol,
    ) -> GenericWitnessTableHeader {
        let Ok(witness_table_size) = u16::try_from(table_size) else {
            panic!("witness table of {} words does not fit the header", table_size)
        };
        assert!(private_size <= (u16::MAX >> 1) as u32, "private data of {} words does not fit the header", private_size);
        GenericWitnessTableHeader {
            witness_table_size,
            private_size_and_requires_instantiation: ((private_size as u16) << 1) | requires_instantiation as u16,
            instantiator,
            private_data,
        }
    }

    pub fn private_size(&self) -> u16 {
        self.private_size_and_requires_instantiation >> 1
    }

    pub fn requires_instantiation(&self) -> bool {
        self.private_size_and_requires_instantiation & 1 != 0
    }
}

/// The runtime record describing one conformance, in field order.
#[derive(Debug, Clone)]
pub struct ConformanceDescriptor {
    pub protocol: Symbol,
    pub conforming_type: Symbol,
    pub witness_table_pattern: Option<Symbol>,
    pub flags: ConformanceFlags,
    pub retroactive_context: Option<Symbol>,
    pub conditional_requirements: Vec<Requirement>,
    pub resilient_witnesses: Vec<ResilientWitness>,
    pub generic_witness_table: Option<GenericWitnessTableHeader>,
}

/// What was emitted for one conformance.
#[derive(Debug, Clone)]
pub struct ConformanceDescription {
    pub conformance: ConformanceId,
    pub record: WitnessTableRecord,
    /// The table or pattern; `None` for resilient conformances.
    pub pattern: Option<Symbol>,
    /// In words, including the descriptor slot.
    pub table_size: u32,
    pub private_size: u32,
    pub requires_specialization: bool,
    pub instantiation_fn: Option<Symbol>,
    pub resilient_witnesses: Vec<ResilientWitness>,
}

/// A table whose associated types or conformances are filled in lazily must
/// stay writable.
pub fn is_constant_witness_table(record: &WitnessTableRecord) -> bool {
    !record.entries.iter().any(|entry| {
        matches!(entry, WitnessRecordEntry::AssociatedType { .. } | WitnessRecordEntry::AssociatedTypeProtocol { .. })
    })
}

struct SpecializedBase {
    offset: i32,
    info: ConformanceInfo,
}

struct WitnessTableBuilder<'a, 'p> {
    cx: &'a mut Session<'p>,
    record: &'a WitnessTableRecord,
    root: ConformanceId,
    protocol: ProtocolId,
    signature: Option<GenericSignatureId>,
    /// The conforming type with its parameters mapped to archetypes.
    concrete_type: TypeId,
    conformance_in_context: ConformanceId,
    resilient: bool,
    table: Vec<WitnessValue>,
    specialized_bases: Vec<SpecializedBase>,
    conditional_private_indices: Vec<u32>,
    next_private_index: u32,
    fulfillments: Option<FulfillmentMap>,
}

impl<'a, 'p> WitnessTableBuilder<'a, 'p> {
    fn new(cx: &'a mut Session<'p>, record: &'a WitnessTableRecord) -> WitnessTableBuilder<'a, 'p> {
        let program = cx.program;
        let root = record.conformance;
        let conf = program.conformance(root);
        let normal = conf.expect_normal();
        let signature = normal.generic_signature;
        let concrete_type = program.map_type_into_context(signature, conf.ty);
        let conformance_in_context = match program.nominal_of(concrete_type) {
            Some(_) if signature.is_some() => program.specialize_conformance(root, concrete_type),
            _ => root,
        };
        let resilient = cx.is_resilient_conformance(root);
        WitnessTableBuilder {
            cx,
            record,
            root,
            protocol: conf.protocol,
            signature,
            concrete_type,
            conformance_in_context,
            resilient,
            table: Vec::new(),
            specialized_bases: Vec::new(),
            conditional_private_indices: Vec::new(),
            next_private_index: 0,
            fulfillments: None,
        }
    }

    fn table_size(&self) -> u32 {
        self.table.len() as u32
    }

    fn private_size(&self) -> u32 {
        self.next_private_index
    }

    fn next_private_data_index(&mut self) -> u32 {
        let index = self.next_private_index;
        self.next_private_index += 1;
        index
    }

    fn build(&mut self) {
        self.add_conditional_conformances();
        self.table.push(WitnessValue::Address(Symbol::ProtocolConformanceDescriptor(self.root)));
        if self.resilient {
            return;
        }
        let program = self.cx.program;
        let record = self.record;
        let info = self.cx.protocol_info(self.protocol, ProtocolInfoKind::Full);
        for (slot, (entry, recorded)) in info.entries().iter().zip_eq(record.entries.iter()).enumerate() {
            debug_assert_eq!(self.table.len(), WitnessIndex::new(slot as u32).for_protocol_witness_table() as usize);
            match (*entry, *recorded) {
                (WitnessTableEntry::OutOfLineBase(base), WitnessRecordEntry::BaseProtocol { requirement, .. })
                    if base == requirement =>
                {
                    self.add_out_of_line_base(base)
                }
                (WitnessTableEntry::Method(method), WitnessRecordEntry::Method { requirement, witness })
                    if method == requirement =>
                {
                    let witness = match witness {
                        Some(function) => Symbol::Function(function),
                        // Removed as dead; reaching it is a bug
                        None => Symbol::DeletedMethodError,
                    };
                    self.table.push(WitnessValue::Address(witness));
                }
                (WitnessTableEntry::Placeholder, WitnessRecordEntry::Invalid) => self.table.push(WitnessValue::Null),
                (WitnessTableEntry::AssociatedType(assoc), WitnessRecordEntry::AssociatedType { requirement, witness })
                    if assoc == requirement =>
                {
                    debug_assert!(!program.has_archetype(witness));
                    self.table.push(WitnessValue::MangledTypeName(witness));
                }
                (
                    WitnessTableEntry::AssociatedConformance(requirement),
                    WitnessRecordEntry::AssociatedTypeProtocol { association, protocol, .. },
                ) if requirement.association == association && requirement.requirement == protocol => {
                    let witness = self.associated_conformance_witness(requirement, true);
                    self.table.push(witness);
                }
                (entry, recorded) => panic!(
                    "witness table for {} does not match its protocol at slot {}: {:?} vs {:?}",
                    program.conformance_name(self.root),
                    slot,
                    entry,
                    recorded
                ),
            }
        }
    }

    fn add_conditional_conformances(&mut self) {
        assert_eq!(self.next_private_index, 0);
        let record = self.record;
        for _ in record.conditional_conformances.iter() {
            let index = self.next_private_data_index();
            self.conditional_private_indices.push(index);
        }
    }

    fn add_out_of_line_base(&mut self, base: ProtocolId) {
        let program = self.cx.program;
        let Some(ConformanceRef::Concrete(base_conformance)) =
            program.inherited_conformance(self.conformance_in_context, base)
        else {
            panic!(
                "{} has no concrete inherited conformance to {}",
                program.conformance_name(self.root),
                program.name(program.protocol(base).name)
            )
        };
        debug_assert_eq!(program.conformance(base_conformance).ty, self.concrete_type);
        let info = self.cx.conformance_info(base, base_conformance);
        if let Some(constant) = info.try_get_constant_table(self.cx, self.concrete_type) {
            self.table.push(WitnessValue::Address(constant));
            return;
        }
        // Filled in by the instantiation function
        let offset = self.table.len() as i32;
        self.specialized_bases.push(SpecializedBase { offset, info });
        self.table.push(WitnessValue::Null);
    }

    /// The slot value for an associated conformance: a constant table when
    /// `allow_constant` and one exists, otherwise an accessor function.
    fn associated_conformance_witness(&mut self, requirement: AssociatedConformance, allow_constant: bool) -> WitnessValue {
        let program = self.cx.program;
        let in_context = ConformanceRef::Concrete(self.conformance_in_context);
        let associated_type = program.associated_type(in_context, self.concrete_type, requirement.association);
        let associated_conformance =
            program.associated_conformance(in_context, requirement.association, requirement.requirement);
        if let (true, ConformanceRef::Concrete(c)) = (allow_constant, associated_conformance) {
            let info = self.cx.conformance_info(requirement.requirement, c);
            if let Some(constant) = info.try_get_constant_table(self.cx, associated_type) {
                return WitnessValue::Address(constant);
            }
        }
        let accessor = self.define_associated_conformance_accessor(requirement, associated_type, associated_conformance);
        WitnessValue::Address(accessor)
    }

    /// What the conforming type's own metadata fulfills, computed on first use.
    fn fulfillment_map(&mut self) -> &FulfillmentMap {
        let cx: &Session = self.cx;
        let concrete_type = self.concrete_type;
        let signature = self.signature;
        self.fulfillments.get_or_insert_with(|| {
            let mut map = FulfillmentMap::new();
            if cx.program.has_archetype(concrete_type) {
                let keys = ArchetypeKeys::new(cx.program, signature);
                map.search_type_metadata(
                    cx,
                    concrete_type,
                    true,
                    MetadataState::Abstract,
                    0,
                    &MetadataPath::new(),
                    &keys,
                );
            }
            map
        })
    }

    /// `(associated metadata, self metadata, self table) -> table`, defined
    /// once per requirement.
    fn define_associated_conformance_accessor(
        &mut self,
        requirement: AssociatedConformance,
        associated_type: TypeId,
        associated_conformance: ConformanceRef,
    ) -> Symbol {
        let symbol = Symbol::AssociatedConformanceAccessor { conformance: self.root, requirement };
        if self.cx.module.has_function(symbol) {
            return symbol;
        }
        let program = self.cx.program;
        let mut igf = FunctionEmitter::for_function(
            self.cx,
            symbol,
            vec![IrType::TypeMetadataPtr, IrType::TypeMetadataPtr, IrType::WitnessTablePtr],
            IrType::WitnessTablePtr,
        );
        let associated_metadata = igf.b.param(0);
        let self_metadata = igf.b.param(1);
        let dest_table = igf.b.param(2);
        igf.b.set_name(associated_metadata, program.display_type(associated_type));
        igf.b.set_name(self_metadata, program.display_type(self.concrete_type));
        igf.b.set_name(
            dest_table,
            format!("{}.{}", program.display_type(self.concrete_type), program.name(program.protocol(self.protocol).name)),
        );

        let value = self.emit_associated_conformance_accessor_body(
            &mut igf,
            requirement,
            associated_type,
            associated_conformance,
            associated_metadata,
            self_metadata,
            dest_table,
        );
        igf.b.ret(Some(value));
        debug!("defined associated conformance accessor {} for {}", symbol, program.conformance_name(self.root));
        self.cx.module.add_function(igf.b.finish());
        symbol
    }

    fn emit_associated_conformance_accessor_body(
        &mut self,
        igf: &mut FunctionEmitter,
        requirement: AssociatedConformance,
        associated_type: TypeId,
        associated_conformance: ConformanceRef,
        associated_metadata: InstId,
        self_metadata: InstId,
        dest_table: InstId,
    ) -> InstId {
        let program = self.cx.program;
        let info = match associated_conformance {
            ConformanceRef::Concrete(c) => {
                let info = self.cx.conformance_info(requirement.requirement, c);
                if let Some(constant) = info.try_get_constant_table(self.cx, associated_type) {
                    return igf.b.global_addr(constant);
                }
                Some(info)
            }
            ConformanceRef::Abstract(_) => None,
        };

        if !program.has_archetype(associated_type) {
            let Some(info) = info else {
                panic!("abstract conformance for concrete type {}", program.display_type(associated_type))
            };
            return info.get_table(self.cx, igf, associated_type, &mut Some(associated_metadata));
        }

        igf.bind_local_type_data_from_self_witness_table(self.cx, self.root, dest_table);

        let concrete_type = self.concrete_type;
        let fulfilled =
            self.fulfillment_map().get_witness_table(associated_type, requirement.requirement).map(|f| f.path.clone());
        if let Some(path) = fulfilled {
            // Self is only known to be abstract here
            let source = MetadataResponse::new(self_metadata, MetadataState::Abstract);
            return path.follow_from_type_metadata(self.cx, igf, concrete_type, source, MetadataRequest::COMPLETE, None).value;
        }

        igf.bind_local_type_data_from_type_metadata(
            self.cx,
            associated_type,
            true,
            associated_metadata,
            MetadataState::Abstract,
        );
        igf.bind_local_type_data_from_type_metadata(self.cx, concrete_type, true, self_metadata, MetadataState::Abstract);

        match info {
            None => igf.emit_archetype_witness_table_ref(self.cx, associated_type, requirement.requirement),
            Some(info) => info.get_table(self.cx, igf, associated_type, &mut Some(associated_metadata)),
        }
    }

    /// Witnesses for the runtime to install, in recorded order. Empty unless
    /// the conformance is resilient.
    fn collect_resilient_witnesses(&mut self) -> Vec<ResilientWitness> {
        if !self.resilient {
            return Vec::new();
        }
        let program = self.cx.program;
        let record = self.record;
        let mut witnesses = Vec::with_capacity(record.entries.len());
        for entry in record.entries.iter() {
            let witness = match *entry {
                WitnessRecordEntry::AssociatedType { requirement, witness } => ResilientWitness {
                    requirement: Symbol::AssociatedTypeDescriptor(requirement),
                    witness: WitnessValue::MangledTypeName(witness),
                },
                WitnessRecordEntry::AssociatedTypeProtocol { association, protocol, .. } => {
                    let requirement =
                        AssociatedConformance { source_protocol: self.protocol, association, requirement: protocol };
                    ResilientWitness {
                        requirement: Symbol::AssociatedConformanceDescriptor(requirement),
                        witness: self.associated_conformance_witness(requirement, false),
                    }
                }
                WitnessRecordEntry::BaseProtocol { requirement: base, .. } => {
                    // An inherited conformance is the associated conformance of Self
                    let requirement = AssociatedConformance {
                        source_protocol: self.protocol,
                        association: program.self_type(),
                        requirement: base,
                    };
                    ResilientWitness {
                        requirement: Symbol::BaseConformanceDescriptor { protocol: self.protocol, base },
                        witness: self.associated_conformance_witness(requirement, false),
                    }
                }
                WitnessRecordEntry::Method { requirement, witness } => ResilientWitness {
                    requirement: Symbol::MethodDescriptor(requirement),
                    witness: match witness {
                        Some(function) => WitnessValue::Address(Symbol::Function(function)),
                        None => WitnessValue::Null,
                    },
                },
                WitnessRecordEntry::Invalid => continue,
            };
            witnesses.push(witness);
        }
        witnesses
    }

    /// `(table, metadata, conditional tables) -> ()`, which fills the base
    /// slots that could not be constant. Only built when there are any.
    fn build_instantiation_function(&mut self) -> Option<Symbol> {
        if self.specialized_bases.is_empty() {
            return None;
        }
        let program = self.cx.program;
        let symbol = Symbol::GenericWitnessTableInstantiation(self.root);
        let mut igf = FunctionEmitter::for_function(
            self.cx,
            symbol,
            vec![IrType::WitnessTablePtr, IrType::TypeMetadataPtr, IrType::WitnessTablePtrPtr],
            IrType::Void,
        );
        let wtable = igf.b.param(0);
        let metadata = igf.b.param(1);
        let conditional_tables = igf.b.param(2);
        igf.bind_local_type_data_from_type_metadata(self.cx, self.concrete_type, true, metadata, MetadataState::Complete);

        let record = self.record;
        for (index, conditional) in record.conditional_conformances.iter().enumerate() {
            let buffer_index = self.conditional_private_indices[index];
            let table = igf.b.push_inst(Inst::BufferLoad {
                buffer: conditional_tables,
                index: buffer_index,
                ty: IrType::WitnessTablePtr,
            });
            let requirement_type = program.map_type_into_context(self.signature, conditional.requirement);
            if program.is_archetype(requirement_type) {
                let protocol = conditional.conformance.protocol(program);
                let key = LocalTypeDataKey::witness_table(requirement_type, ConformanceRef::Abstract(protocol));
                igf.set_unscoped_local_type_data(key, MetadataResponse::complete(table));
            }
        }

        let mut metadata_cache = Some(metadata);
        for base in self.specialized_bases.iter() {
            let base_table = base.info.get_table(self.cx, &mut igf, self.concrete_type, &mut metadata_cache);
            igf.b.push_inst(Inst::StoreWitness { table: wtable, offset: base.offset, value: base_table });
        }
        igf.b.ret(None);
        self.cx.module.add_function(igf.b.finish());
        Some(symbol)
    }
}

impl Session<'_> {
    /// Emits the table, accessors and descriptor for one recorded conformance.
    /// Declarations and externally available tables emit nothing.
    pub fn emit_witness_table(&mut self, record: &WitnessTableRecord) -> Option<&ConformanceDescription> {
        if record.is_declaration || record.is_available_externally {
            return None;
        }
        let program = self.program;
        let root = record.conformance;
        let name = program.conformance_name(root);
        let (table, table_size, private_size, instantiation_fn, resilient_witnesses) = {
            let mut builder = WitnessTableBuilder::new(self, record);
            builder.build();
            let resilient_witnesses = builder.collect_resilient_witnesses();
            let instantiation_fn = builder.build_instantiation_function();
            let table_size = builder.table_size();
            let private_size = builder.private_size();
            (builder.table, table_size, private_size, instantiation_fn, resilient_witnesses)
        };

        let is_dependent = self.is_dependent_conformance(root);
        let (pattern, table_size) = if self.is_resilient_conformance(root) {
            (None, 0)
        } else {
            let is_generic = program.conformance(root).expect_normal().is_generic_context();
            let symbol = if is_dependent && is_generic {
                Symbol::ProtocolWitnessTablePattern(root)
            } else {
                Symbol::ProtocolWitnessTable(root)
            };
            self.module.add_global(IrGlobal {
                symbol,
                init: GlobalInit::Table(table),
                is_constant: is_constant_witness_table(record),
                linkage: Linkage::Public,
            });
            (Some(symbol), table_size)
        };
        debug!(
            "witness table for {}: {} words, {} private, {}",
            name,
            table_size,
            private_size,
            if is_dependent { "instantiated" } else { "static" }
        );

        let description = ConformanceDescription {
            conformance: root,
            record: record.clone(),
            pattern,
            table_size,
            private_size,
            requires_specialization: is_dependent,
            instantiation_fn,
            resilient_witnesses,
        };
        self.emit_protocol_conformance(&description);
        self.descriptions.push(description);
        self.descriptions.last()
    }

    /// Emits every table in `records`, in order.
    pub fn emit_witness_tables(&mut self, records: &[WitnessTableRecord]) {
        let start = Instant::now();
        let mut emitted = 0;
        for record in records {
            if self.emit_witness_table(record).is_some() {
                emitted += 1;
            }
        }
        info!(
            "emitting {} of {} witness tables took {}ms",
            emitted,
            records.len(),
            start.elapsed().as_millis()
        );
    }

    /// The conforming type's descriptor and how to reach it.
    fn type_entity_reference(&self, ty: TypeId) -> (Symbol, TypeReferenceKind) {
        let program = self.program;
        let Some(nominal) = program.nominal_of(ty) else {
            panic!("conformance descriptor for non-nominal type {}", program.display_type(ty))
        };
        let decl = program.nominal(nominal);
        let kind = match (decl.is_foreign, decl.module == self.current_module) {
            (true, _) => TypeReferenceKind::IndirectObjCClass,
            (false, true) => TypeReferenceKind::DirectTypeDescriptor,
            (false, false) => TypeReferenceKind::IndirectTypeDescriptor,
        };
        (Symbol::NominalTypeDescriptor(nominal), kind)
    }

    /// Builds and emits the conformance descriptor for `description`.
    pub fn emit_protocol_conformance(&mut self, description: &ConformanceDescription) {
        let program = self.program;
        let conf = program.conformance(description.conformance);
        let normal = conf.as_normal();

        let (conforming_type, kind) = self.type_entity_reference(conf.ty);
        let is_retroactive = normal.is_some_and(|n| n.is_retroactive);
        let conditional_requirements = normal.map(|n| n.conditional_requirements.clone()).unwrap_or_default();
        let flags = ConformanceFlags::default()
            .with_type_reference_kind(kind)
            .with_num_conditional_requirements(conditional_requirements.len() as u32)
            .with_is_retroactive(is_retroactive)
            .with_is_synthesized_non_unique(normal.is_some_and(|n| n.is_synthesized_non_unique))
            .with_has_resilient_witnesses(!description.resilient_witnesses.is_empty())
            .with_has_generic_witness_table(description.requires_specialization);

        let retroactive_context = match normal {
            Some(n) if n.is_retroactive => Some(Symbol::ModuleContextDescriptor(n.module)),
            _ => None,
        };

        let generic_witness_table = if description.requires_specialization {
            let private_data = Symbol::GenericWitnessTablePrivateData(description.conformance);
            let words = self.config.generic_metadata_private_data_words;
            self.module.get_or_add_global(private_data, || IrGlobal {
                symbol: private_data,
                init: GlobalInit::Zeroed { words },
                is_constant: false,
                linkage: Linkage::Internal,
            });
            Some(GenericWitnessTableHeader::new(
                description.table_size,
                description.private_size,
                description.requires_specialization,
                description.instantiation_fn,
                private_data,
            ))
        } else {
            None
        };

        let descriptor = ConformanceDescriptor {
            protocol: Symbol::ProtocolDescriptor(conf.protocol),
            conforming_type,
            witness_table_pattern: description.pattern,
            flags,
            retroactive_context,
            conditional_requirements,
            resilient_witnesses: description.resilient_witnesses.clone(),
            generic_witness_table,
        };
        self.module.add_global(IrGlobal {
            symbol: Symbol::ProtocolConformanceDescriptor(description.conformance),
            init: GlobalInit::ConformanceDescriptor(descriptor),
            is_constant: true,
            linkage: Linkage::Public,
        });
    }
}
