// Copyright (c) 2025 knix
// All rights reserved.

use itertools::Itertools;

use crate::ir::{Callee, GlobalInit, Inst, IrType, Linkage, RuntimeFn, Symbol, WitnessValue};
use crate::program::{
    AssociatedConformance, ConditionalConformanceRecord, ConformanceRef, WitnessRecordEntry, WitnessTableRecord,
};
use crate::test_fixtures::TestProgram;
use crate::witness_table::*;

#[test]
fn table_holds_descriptor_then_witnesses() {
    let mut t = TestProgram::new();
    let (p, methods) = t.protocol("P", &["f", "g"]);
    t.program.add_placeholder(p);
    let (key_decl, key) = t.plain_struct("Key");
    let key_p = t.conformance(key, p, |_| {});
    let key_f = t.program.add_function("Key.f");
    let record = WitnessTableRecord::new(
        key_p,
        vec![
            WitnessRecordEntry::Method { requirement: methods[0], witness: Some(key_f) },
            WitnessRecordEntry::Method { requirement: methods[1], witness: None },
            WitnessRecordEntry::Invalid,
        ],
    );
    let mut cx = t.session();

    let description = cx.emit_witness_table(&record).unwrap().clone();
    assert_eq!(description.pattern, Some(Symbol::ProtocolWitnessTable(key_p)));
    assert_eq!((description.table_size, description.private_size), (4, 0));
    assert!(!description.requires_specialization);
    assert_eq!(description.instantiation_fn, None);
    assert!(description.resilient_witnesses.is_empty());

    let table = cx.module.global(Symbol::ProtocolWitnessTable(key_p)).unwrap();
    assert!(table.is_constant);
    assert_eq!(table.linkage, Linkage::Public);
    assert_eq!(
        table.expect_table(),
        &[
            WitnessValue::Address(Symbol::ProtocolConformanceDescriptor(key_p)),
            WitnessValue::Address(Symbol::Function(key_f)),
            WitnessValue::Address(Symbol::DeletedMethodError),
            WitnessValue::Null,
        ]
    );

    let descriptor = cx.module.global(Symbol::ProtocolConformanceDescriptor(key_p)).unwrap().expect_descriptor();
    assert_eq!(descriptor.protocol, Symbol::ProtocolDescriptor(p));
    assert_eq!(descriptor.conforming_type, Symbol::NominalTypeDescriptor(key_decl));
    assert_eq!(descriptor.witness_table_pattern, Some(Symbol::ProtocolWitnessTable(key_p)));
    assert_eq!(descriptor.flags.type_reference_kind(), TypeReferenceKind::DirectTypeDescriptor as u32);
    assert_eq!(descriptor.flags.num_conditional_requirements(), 0);
    assert!(!descriptor.flags.has_generic_witness_table());
    assert!(descriptor.generic_witness_table.is_none());
    assert_eq!(cx.descriptions.len(), 1);
}

#[test]
fn associated_types_keep_the_table_writable() {
    let mut t = TestProgram::new();
    let (container, element) = t.protocol_with_assoc("Container", "Element");
    let (_, key) = t.plain_struct("Key");
    let int = t.int();
    let key_container = t.conformance(key, container, |c| c.type_witnesses = vec![(element, int)]);
    let record =
        WitnessTableRecord::new(key_container, vec![WitnessRecordEntry::AssociatedType { requirement: element, witness: int }]);
    assert!(!is_constant_witness_table(&record));
    let mut cx = t.session();

    cx.emit_witness_table(&record);
    let table = cx.module.global(Symbol::ProtocolWitnessTable(key_container)).unwrap();
    assert!(!table.is_constant);
    assert_eq!(table.expect_table()[1], WitnessValue::MangledTypeName(int));
}

#[test]
fn constant_base_table_is_referenced_directly() {
    let mut t = TestProgram::new();
    let (base, base_methods) = t.protocol("Base", &["base"]);
    let (p, methods) = t.protocol("P", &["f"]);
    t.program.add_inherited_protocol(p, base);
    let (_, key) = t.plain_struct("Key");
    let key_base = t.conformance(key, base, |_| {});
    let key_p = t.conformance(key, p, |c| c.inherited = vec![(base, ConformanceRef::Concrete(key_base))]);
    let f = t.program.add_function("Key.f");
    let base_record = WitnessTableRecord::new(
        key_base,
        vec![WitnessRecordEntry::Method { requirement: base_methods[0], witness: None }],
    );
    let record = WitnessTableRecord::new(
        key_p,
        vec![
            WitnessRecordEntry::BaseProtocol { requirement: base, witness: ConformanceRef::Concrete(key_base) },
            WitnessRecordEntry::Method { requirement: methods[0], witness: Some(f) },
        ],
    );
    let mut cx = t.session();

    cx.emit_witness_tables(&[base_record, record]);
    assert_eq!(cx.descriptions.len(), 2);
    let table = cx.module.global(Symbol::ProtocolWitnessTable(key_p)).unwrap().expect_table();
    assert_eq!(table[1], WitnessValue::Address(Symbol::ProtocolWitnessTable(key_base)));
    assert_eq!(table[2], WitnessValue::Address(Symbol::Function(f)));
}

#[test]
#[should_panic(expected = "does not match its protocol at slot 0")]
fn record_out_of_protocol_order_is_rejected() {
    let mut t = TestProgram::new();
    let (p, methods) = t.protocol("P", &["f", "g"]);
    let (_, key) = t.plain_struct("Key");
    let key_p = t.conformance(key, p, |_| {});
    let record = WitnessTableRecord::new(
        key_p,
        vec![
            WitnessRecordEntry::Method { requirement: methods[1], witness: None },
            WitnessRecordEntry::Method { requirement: methods[0], witness: None },
        ],
    );
    let mut cx = t.session();
    cx.emit_witness_table(&record);
}

#[test]
fn declarations_emit_nothing() {
    let mut t = TestProgram::new();
    let (p, _) = t.protocol("P", &["f"]);
    let (_, key) = t.plain_struct("Key");
    let key_p = t.conformance(key, p, |_| {});
    let mut declaration = WitnessTableRecord::new(key_p, vec![WitnessRecordEntry::Invalid]);
    declaration.is_declaration = true;
    let mut external = declaration.clone();
    external.is_declaration = false;
    external.is_available_externally = true;
    let mut cx = t.session();

    assert!(cx.emit_witness_table(&declaration).is_none());
    cx.emit_witness_tables(&[external]);
    assert!(cx.descriptions.is_empty());
    assert!(cx.module.globals.is_empty());
}

/// `extension Wrapper: Describable where T: Showable`, where Describable
/// refines Showable and Wrapper's Showable conformance is equally conditional.
#[test]
fn conditional_generic_table_is_instantiated() {
    let mut t = TestProgram::new();
    let (showable, _) = t.protocol("Showable", &["show"]);
    let (describable, methods) = t.protocol("Describable", &["describe"]);
    t.program.add_inherited_protocol(describable, showable);
    let t0 = t.param(0);
    let wrapper = t.generic_struct("Wrapper", 1, vec![]);
    let wrapper_t0 = t.program.nominal_type(wrapper, &[t0]);
    let requirement = t.conforms(t0, showable);
    let signature = t.signature(1, vec![requirement]);
    let wrapper_showable = t.conformance(wrapper_t0, showable, |c| {
        c.generic_signature = Some(signature);
        c.conditional_requirements = vec![requirement];
    });
    let wrapper_describable = t.conformance(wrapper_t0, describable, |c| {
        c.generic_signature = Some(signature);
        c.conditional_requirements = vec![requirement];
        c.inherited = vec![(showable, ConformanceRef::Concrete(wrapper_showable))];
    });
    let describe = t.program.add_function("Wrapper.describe");
    let mut record = WitnessTableRecord::new(
        wrapper_describable,
        vec![
            WitnessRecordEntry::BaseProtocol { requirement: showable, witness: ConformanceRef::Concrete(wrapper_showable) },
            WitnessRecordEntry::Method { requirement: methods[0], witness: Some(describe) },
        ],
    );
    record.conditional_conformances =
        vec![ConditionalConformanceRecord { requirement: t0, conformance: ConformanceRef::Abstract(showable) }];
    let mut cx = t.session();

    let description = cx.emit_witness_table(&record).unwrap().clone();
    let pattern = Symbol::ProtocolWitnessTablePattern(wrapper_describable);
    let instantiation = Symbol::GenericWitnessTableInstantiation(wrapper_describable);
    assert_eq!(description.pattern, Some(pattern));
    assert_eq!((description.table_size, description.private_size), (3, 1));
    assert!(description.requires_specialization);
    assert_eq!(description.instantiation_fn, Some(instantiation));
    assert_eq!(
        cx.module.global(pattern).unwrap().expect_table(),
        &[
            WitnessValue::Address(Symbol::ProtocolConformanceDescriptor(wrapper_describable)),
            WitnessValue::Null,
            WitnessValue::Address(Symbol::Function(describe)),
        ]
    );

    // (table, metadata, conditional tables): the base table comes from the runtime
    let function = cx.module.function(instantiation).unwrap();
    assert_eq!(function.params, vec![IrType::WitnessTablePtr, IrType::TypeMetadataPtr, IrType::WitnessTablePtrPtr]);
    let (store_table, store_value) = function
        .instrs
        .iter()
        .find_map(|i| match i {
            Inst::StoreWitness { table, offset: 1, value } => Some((*table, *value)),
            _ => None,
        })
        .unwrap();
    assert_eq!(store_table, 0);
    let Inst::Call { callee, args, .. } = function.get_inst(store_value) else { panic!("expected a runtime call") };
    assert_eq!(*callee, Callee::Runtime(RuntimeFn::GetWitnessTable));
    assert_eq!(function.get_inst(args[0]), &Inst::GlobalAddr(Symbol::ProtocolConformanceDescriptor(wrapper_showable)));
    assert_eq!(args[1], 1);
    // The conditional table arrives in the third parameter
    let forwarded = function
        .instrs
        .iter()
        .find_map(|i| match i {
            Inst::BufferStore { buffer, index: 0, value } if *buffer == args[2] => Some(*value),
            _ => None,
        })
        .unwrap();
    assert_eq!(
        function.get_inst(forwarded),
        &Inst::BufferLoad { buffer: 2, index: 0, ty: IrType::WitnessTablePtr }
    );

    let descriptor =
        cx.module.global(Symbol::ProtocolConformanceDescriptor(wrapper_describable)).unwrap().expect_descriptor();
    assert_eq!(descriptor.flags.num_conditional_requirements(), 1);
    assert!(descriptor.flags.has_generic_witness_table());
    assert_eq!(descriptor.conditional_requirements, vec![requirement]);
    let header = descriptor.generic_witness_table.unwrap();
    assert_eq!(header.witness_table_size, 3);
    assert_eq!(header.private_size(), 1);
    assert!(header.requires_instantiation());
    assert_eq!(header.instantiator, Some(instantiation));
    let private_data = cx.module.global(header.private_data).unwrap();
    assert!(matches!(private_data.init, GlobalInit::Zeroed { words: 16 }));
    assert_eq!(private_data.linkage, Linkage::Internal);
}

#[test]
fn abstract_associated_conformance_gets_an_accessor() {
    let mut t = TestProgram::new();
    let (p, _) = t.protocol("P", &["f"]);
    let (container, element) = t.protocol_with_assoc("Container", "Element");
    let element_ty = t.program.dependent_member(t.program.self_type(), element);
    let requirement = t.program.add_associated_conformance(container, element_ty, p);
    let t0 = t.param(0);
    let signature = t.signature(1, vec![t.conforms(t0, p)]);
    let list = t.program.add_struct("List", t.module, Some(signature));
    let list_t0 = t.program.nominal_type(list, &[t0]);
    let list_container = t.conformance(list_t0, container, |c| {
        c.generic_signature = Some(signature);
        c.type_witnesses = vec![(element, t0)];
        c.associated_conformances = vec![(element_ty, p, ConformanceRef::Abstract(p))];
    });
    let record = WitnessTableRecord::new(
        list_container,
        vec![
            WitnessRecordEntry::AssociatedType { requirement: element, witness: t0 },
            WitnessRecordEntry::AssociatedTypeProtocol {
                association: element_ty,
                protocol: p,
                witness: ConformanceRef::Abstract(p),
            },
        ],
    );
    let mut cx = t.session();

    let description = cx.emit_witness_table(&record).unwrap().clone();
    assert!(description.requires_specialization);
    assert_eq!(description.instantiation_fn, None);
    let accessor = Symbol::AssociatedConformanceAccessor { conformance: list_container, requirement };
    let table = cx.module.global(Symbol::ProtocolWitnessTablePattern(list_container)).unwrap();
    assert!(!table.is_constant);
    assert_eq!(table.expect_table()[2], WitnessValue::Address(accessor));

    // The element's table is the list's second stored generic argument
    let function = cx.module.function(accessor).unwrap();
    let returned = function
        .instrs
        .iter()
        .find_map(|i| match i {
            Inst::Ret(Some(value)) => Some(*value),
            _ => None,
        })
        .unwrap();
    assert_eq!(
        function.get_inst(returned),
        &Inst::NominalTypeArgumentWitnessTable { metadata: 1, nominal: list, index: 1 }
    );
}

#[test]
fn resilient_conformance_lists_its_witnesses() {
    let mut t = TestProgram::new();
    let (base, _) = t.protocol("Base", &["base"]);
    let p = t.program.add_protocol("P", t.other_module);
    t.program.protocol_mut(p).is_resilient = true;
    t.program.add_inherited_protocol(p, base);
    let f = t.program.add_method(p, "f");
    let element = t.program.add_assoc_type(p, "Element");
    let (_, key) = t.plain_struct("Key");
    let int = t.int();
    let key_base = t.conformance(key, base, |_| {});
    let key_p = t.conformance(key, p, |c| {
        c.inherited = vec![(base, ConformanceRef::Concrete(key_base))];
        c.type_witnesses = vec![(element, int)];
    });
    let key_f = t.program.add_function("Key.f");
    let record = WitnessTableRecord::new(
        key_p,
        vec![
            WitnessRecordEntry::BaseProtocol { requirement: base, witness: ConformanceRef::Concrete(key_base) },
            WitnessRecordEntry::Method { requirement: f, witness: Some(key_f) },
            WitnessRecordEntry::AssociatedType { requirement: element, witness: int },
        ],
    );
    let self_type = t.program.self_type();
    let mut cx = t.session();

    let description = cx.emit_witness_table(&record).unwrap().clone();
    assert_eq!(description.pattern, None);
    assert_eq!(description.table_size, 0);
    assert!(!cx.module.has_global(Symbol::ProtocolWitnessTable(key_p)));

    let base_requirement = AssociatedConformance { source_protocol: p, association: self_type, requirement: base };
    let base_accessor = Symbol::AssociatedConformanceAccessor { conformance: key_p, requirement: base_requirement };
    assert_eq!(
        description.resilient_witnesses,
        vec![
            ResilientWitness {
                requirement: Symbol::BaseConformanceDescriptor { protocol: p, base },
                witness: WitnessValue::Address(base_accessor),
            },
            ResilientWitness {
                requirement: Symbol::MethodDescriptor(f),
                witness: WitnessValue::Address(Symbol::Function(key_f)),
            },
            ResilientWitness {
                requirement: Symbol::AssociatedTypeDescriptor(element),
                witness: WitnessValue::MangledTypeName(int),
            },
        ]
    );
    let accessor_body = cx.module.function(base_accessor).unwrap();
    assert!(accessor_body.instrs.contains(&Inst::GlobalAddr(Symbol::ProtocolWitnessTable(key_base))));

    let descriptor = cx.module.global(Symbol::ProtocolConformanceDescriptor(key_p)).unwrap().expect_descriptor();
    assert_eq!(descriptor.witness_table_pattern, None);
    assert!(descriptor.flags.has_resilient_witnesses());
    assert_eq!(descriptor.resilient_witnesses.len(), 3);
    assert_eq!(descriptor.generic_witness_table.map(|h| h.witness_table_size), Some(0));
}

#[test]
fn descriptor_describes_retroactive_and_foreign_types() {
    let mut t = TestProgram::new();
    let (p, _) = t.protocol("P", &[]);
    let remote = t.program.add_struct("Remote", t.other_module, None);
    let remote_ty = t.program.nominal_type(remote, &[]);
    let remote_p = t.conformance(remote_ty, p, |c| c.is_retroactive = true);
    let foreign = t.program.add_class("NSThing", t.other_module, None, None);
    t.program.nominal_mut(foreign).is_foreign = true;
    let foreign_ty = t.program.nominal_type(foreign, &[]);
    let foreign_p = t.conformance(foreign_ty, p, |c| c.is_synthesized_non_unique = true);
    let records = [remote_p, foreign_p].map(|c| WitnessTableRecord::new(c, vec![]));
    let module = t.module;
    let mut cx = t.session();
    cx.emit_witness_tables(&records);

    let descriptors = [remote_p, foreign_p]
        .map(|c| cx.module.global(Symbol::ProtocolConformanceDescriptor(c)).unwrap().expect_descriptor().clone());
    assert_eq!(descriptors[0].flags.type_reference_kind(), TypeReferenceKind::IndirectTypeDescriptor as u32);
    assert!(descriptors[0].flags.is_retroactive());
    assert_eq!(descriptors[0].retroactive_context, Some(Symbol::ModuleContextDescriptor(module)));
    assert_eq!(descriptors[1].flags.type_reference_kind(), TypeReferenceKind::IndirectObjCClass as u32);
    assert!(descriptors[1].flags.is_synthesized_non_unique());
    assert_eq!(descriptors[1].retroactive_context, None);
    assert_eq!(
        cx.descriptions.iter().map(|d| d.conformance).collect_vec(),
        vec![remote_p, foreign_p]
    );
}

#[test]
fn flags_pack_into_their_fields() {
    let flags = ConformanceFlags::default()
        .with_type_reference_kind(TypeReferenceKind::IndirectObjCClass)
        .with_num_conditional_requirements(3)
        .with_is_retroactive(true)
        .with_has_generic_witness_table(true);
    assert_eq!(flags.bits(), (3 << 3) | (1 << 6) | (3 << 8) | (1 << 17));
    let flags = flags.with_is_retroactive(false).with_type_reference_kind(TypeReferenceKind::DirectTypeDescriptor);
    assert_eq!(flags.bits(), (3 << 8) | (1 << 17));
    assert!(!flags.has_resilient_witnesses());
}

#[test]
#[should_panic(expected = "too many conditional requirements")]
fn conditional_requirement_count_is_bounded() {
    ConformanceFlags::default().with_num_conditional_requirements(256);
}

fn private_data() -> Symbol {
    Symbol::GenericWitnessTablePrivateData(crate::program::ConformanceId::from_u32(1).unwrap())
}

#[test]
fn header_packs_private_size_with_the_instantiation_bit() {
    let header = GenericWitnessTableHeader::new(5, 0x7FFF, true, None, private_data());
    assert_eq!(header.witness_table_size, 5);
    assert_eq!(header.private_size(), 0x7FFF);
    assert!(header.requires_instantiation());
}

#[test]
#[should_panic(expected = "private data of 32768 words does not fit the header")]
fn header_private_size_is_bounded() {
    GenericWitnessTableHeader::new(5, 0x8000, true, None, private_data());
}

#[test]
#[should_panic(expected = "witness table of 65536 words does not fit the header")]
fn header_table_size_is_bounded() {
    GenericWitnessTableHeader::new(0x1_0000, 1, true, None, private_data());
}
