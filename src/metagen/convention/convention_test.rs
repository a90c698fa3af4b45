// Copyright (c) 2025 knix
// All rights reserved.

use itertools::Itertools;

use crate::convention::*;
use crate::ir::{Inst, IrType, MetadataRequest, Symbol};
use crate::local_type_data::{FunctionEmitter, LocalTypeDataKey};
use crate::metadata_path::{Component, MetadataPath};
use crate::program::lowered::{FunctionRepresentation, LoweredFunctionType, ParameterConvention, ParameterInfo};
use crate::program::types::MetatypeRepr;
use crate::program::{ConformanceRef, GenericSignatureId, NominalId, ProtocolId};
use crate::requirements::GenericRequirement;
use crate::test_fixtures::TestProgram;

/// `struct Box<T: Comparable>` and `func f<T: Comparable, U>(self: Box<T>)` with
/// an indirect self.
struct BoxMethod {
    t: TestProgram,
    comparable: ProtocolId,
    boxed: NominalId,
    signature: GenericSignatureId,
}

impl BoxMethod {
    fn new() -> BoxMethod {
        let mut t = TestProgram::new();
        let (comparable, _) = t.protocol("Comparable", &["lt"]);
        let t0 = t.param(0);
        let boxed = t.generic_struct("Box", 1, vec![t.conforms(t0, comparable)]);
        let signature = t.signature(2, vec![t.conforms(t0, comparable)]);
        BoxMethod { t, comparable, boxed, signature }
    }

    fn fn_type(&self) -> LoweredFunctionType {
        let box_t0 = self.t.program.nominal_type(self.boxed, &[self.t.param(0)]);
        LoweredFunctionType::new(
            FunctionRepresentation::Method,
            Some(self.signature),
            vec![ParameterInfo::new(box_t0, ParameterConvention::IndirectInGuaranteed)],
        )
        .with_self_param()
    }
}

#[test]
fn indirect_self_fulfills_its_generic_arguments() {
    let m = BoxMethod::new();
    let (t0, t1) = (m.t.param(0), m.t.param(1));
    let cx = m.t.session();
    let convention = PolymorphicConvention::new(&cx, &m.fn_type());

    assert_eq!(convention.kind(), ConventionKind::General);
    let box_t0 = m.t.program.nominal_type(m.boxed, &[t0]);
    assert_eq!(
        convention.sources(),
        &[MetadataSource { kind: MetadataSourceKind::GenericLValueMetadata, param_index: Some(0), ty: box_t0 }]
    );

    let t0_metadata = convention.fulfillment_for_type_metadata(t0).unwrap();
    assert_eq!(t0_metadata.source_index, 0);
    assert_eq!(t0_metadata.path.components(), &[Component::NominalTypeArgument(0)]);
    let t0_comparable = convention.fulfillments().get_witness_table(t0, m.comparable).unwrap();
    assert_eq!(t0_comparable.path.components(), &[Component::NominalTypeArgumentConformance(1)]);
    assert!(convention.fulfillment_for_type_metadata(t1).is_none());

    let unfulfilled = convention.enumerate_unfulfilled_requirements(&m.t.program).collect_vec();
    assert_eq!(unfulfilled, vec![GenericRequirement::metadata(t1)]);
    assert_eq!(
        expand_polymorphic_signature(&cx, &m.fn_type()),
        vec![IrType::TypeMetadataPtr, IrType::TypeMetadataPtr]
    );
}

#[test]
fn generic_param_fulfillments_name_their_source() {
    let m = BoxMethod::new();
    let cx = m.t.session();
    let mut seen = Vec::new();
    enumerate_generic_param_fulfillments(&cx, &m.fn_type(), |ty, source, path| {
        seen.push((ty, source.kind, path.to_string()));
    });
    assert_eq!(
        seen,
        vec![(m.t.param(0), MetadataSourceKind::GenericLValueMetadata, "nominal_type_argument[0]".to_string())]
    );
}

#[test]
fn entry_binds_lvalue_metadata_then_explicit_arguments() {
    let mut m = BoxMethod::new();
    let f = m.t.program.add_function("f");
    let fn_type = m.fn_type();
    let mut cx = m.t.session();
    let program = &m.t.program;
    let mut igf = FunctionEmitter::for_function(
        &cx,
        Symbol::Function(f),
        vec![IrType::TypeMetadataPtr, IrType::TypeMetadataPtr, IrType::IntPtr],
        IrType::Void,
    );
    let polymorphic = [igf.b.param(0), igf.b.param(1)];
    let self_address = igf.b.param(2);
    emit_polymorphic_parameters(&mut cx, &mut igf, &fn_type, &polymorphic, None, move |_| self_address);

    let arch_t0 = program.map_type_into_context(Some(m.signature), m.t.param(0));
    let arch_t1 = program.map_type_into_context(Some(m.signature), m.t.param(1));
    let box_arch = program.nominal_type(m.boxed, &[arch_t0]);
    assert!(igf.cache().has_concrete(&LocalTypeDataKey::metadata(box_arch)));
    assert!(igf.cache().has_concrete(&LocalTypeDataKey::metadata(arch_t1)));
    assert!(igf.cache().has_abstract(&LocalTypeDataKey::metadata(arch_t0)));
    let comparable = ConformanceRef::Abstract(m.comparable);
    assert!(igf.cache().has_abstract(&LocalTypeDataKey::witness_table(arch_t0, comparable)));

    let t0_metadata = igf.emit_type_metadata_ref(&mut cx, arch_t0, MetadataRequest::COMPLETE);
    assert_eq!(
        igf.b.get_inst(t0_metadata.value),
        &Inst::NominalTypeArgument { metadata: polymorphic[0], nominal: m.boxed, index: 0 }
    );
    let t0_table = igf.emit_archetype_witness_table_ref(&mut cx, arch_t0, m.comparable);
    assert_eq!(
        igf.b.get_inst(t0_table),
        &Inst::NominalTypeArgumentWitnessTable { metadata: polymorphic[0], nominal: m.boxed, index: 1 }
    );
    let t1_metadata = igf.emit_type_metadata_ref(&mut cx, arch_t1, MetadataRequest::COMPLETE);
    assert_eq!(t1_metadata.value, polymorphic[1]);
}

#[test]
fn call_passes_lvalue_metadata_then_unfulfilled_requirements() {
    let mut m = BoxMethod::new();
    let (_, key) = m.t.plain_struct("Key");
    let comparable = m.comparable;
    m.t.conformance(key, comparable, |_| {});
    let caller = m.t.program.add_function("caller");
    let fn_type = m.fn_type();
    let int = m.t.int();
    let subs = m.t.program.substitution_map_from_types(Some(m.signature), &[key, int]);
    let mut cx = m.t.session();
    let mut igf = FunctionEmitter::for_function(&cx, Symbol::Function(caller), Vec::new(), IrType::Void);

    let args = emit_polymorphic_arguments(&mut cx, &mut igf, &fn_type, &subs, None);
    assert_eq!(args.len(), 2);
    let box_key = m.t.program.nominal_type(m.boxed, &[key]);
    assert_eq!(igf.b.get_inst(args[0]), &Inst::TypeMetadataRef { ty: box_key, request: MetadataRequest::COMPLETE });
    assert_eq!(igf.b.get_inst(args[1]), &Inst::TypeMetadataRef { ty: int, request: MetadataRequest::COMPLETE });
}

#[test]
fn concrete_witness_method_uses_self_and_conditional_tables() {
    let mut t = TestProgram::new();
    let (showable, _) = t.protocol("Showable", &["show"]);
    let t0 = t.param(0);
    let wrapper = t.generic_struct("Wrapper", 1, vec![]);
    let wrapper_t0 = t.program.nominal_type(wrapper, &[t0]);
    let requirement = t.conforms(t0, showable);
    let conditional = t.signature(1, vec![requirement]);
    let conformance = t.conformance(wrapper_t0, showable, |c| {
        c.generic_signature = Some(conditional);
        c.conditional_requirements = vec![requirement];
    });
    let fn_type = LoweredFunctionType::new(
        FunctionRepresentation::WitnessMethod,
        Some(conditional),
        vec![ParameterInfo::new(wrapper_t0, ParameterConvention::IndirectInGuaranteed)],
    )
    .with_self_param()
    .with_witness_method_conformance(ConformanceRef::Concrete(conformance));
    let cx = t.session();
    let convention = PolymorphicConvention::new(&cx, &fn_type);

    assert_eq!(convention.kind(), ConventionKind::WitnessMethod);
    assert_eq!(
        convention.sources().iter().map(|s| s.kind).collect_vec(),
        vec![MetadataSourceKind::SelfMetadata, MetadataSourceKind::SelfWitnessTable]
    );
    let t0_metadata = convention.fulfillment_for_type_metadata(t0).unwrap();
    assert_eq!((t0_metadata.source_index, t0_metadata.path.to_string()), (0, "nominal_type_argument[0]".to_string()));
    let t0_showable = convention.fulfillments().get_witness_table(t0, showable).unwrap();
    assert_eq!(t0_showable.source_index, 1);
    assert_eq!(t0_showable.path.components(), &[Component::ConditionalConformance(0)]);
    assert_eq!(convention.enumerate_unfulfilled_requirements(&t.program).count(), 0);
    assert!(expand_polymorphic_signature(&cx, &fn_type).is_empty());
}

/// `func p<Self: P>(self)` as the witness of a protocol requirement.
fn abstract_witness(t: &mut TestProgram) -> (ProtocolId, GenericSignatureId, LoweredFunctionType) {
    let (p, _) = t.protocol("P", &["f"]);
    let t0 = t.param(0);
    let signature = t.signature(1, vec![t.conforms(t0, p)]);
    let fn_type = LoweredFunctionType::new(
        FunctionRepresentation::WitnessMethod,
        Some(signature),
        vec![ParameterInfo::new(t0, ParameterConvention::IndirectInGuaranteed)],
    )
    .with_self_param()
    .with_witness_method_conformance(ConformanceRef::Abstract(p));
    (p, signature, fn_type)
}

#[test]
fn abstract_witness_method_needs_only_trailing_values() {
    let mut t = TestProgram::new();
    let (p, _, fn_type) = abstract_witness(&mut t);
    let t0 = t.param(0);
    let cx = t.session();
    let convention = PolymorphicConvention::new(&cx, &fn_type);

    let self_metadata = convention.fulfillment_for_type_metadata(t0).unwrap();
    assert_eq!((self_metadata.source_index, self_metadata.path.is_empty()), (0, true));
    let self_table = convention.fulfillments().get_witness_table(t0, p).unwrap();
    assert_eq!((self_table.source_index, self_table.path.is_empty()), (1, true));
    assert!(expand_polymorphic_signature(&cx, &fn_type).is_empty());
    assert_eq!(expand_trailing_witness_signature(&fn_type), [IrType::TypeMetadataPtr, IrType::WitnessTablePtr]);
}

#[test]
fn abstract_witness_method_entry_binds_trailing_values() {
    let mut t = TestProgram::new();
    let (p, signature, fn_type) = abstract_witness(&mut t);
    let f = t.program.add_function("f");
    let mut cx = t.session();
    let mut igf = FunctionEmitter::for_function(
        &cx,
        Symbol::Function(f),
        vec![IrType::IntPtr, IrType::TypeMetadataPtr, IrType::WitnessTablePtr],
        IrType::Void,
    );
    let mut params = (0..3).map(|i| igf.b.param(i)).collect_vec();
    let witness_metadata = collect_trailing_witness_metadata(&mut igf, &fn_type, &mut params);
    assert_eq!(params.len(), 1);
    assert_eq!(witness_metadata.self_metadata, Some(igf.b.param(1)));
    assert_eq!(witness_metadata.self_witness_table, Some(igf.b.param(2)));

    let self_address = params[0];
    emit_polymorphic_parameters(&mut cx, &mut igf, &fn_type, &[], Some(&witness_metadata), move |_| self_address);
    let arch_self = t.program.map_type_into_context(Some(signature), t.param(0));
    assert!(igf.cache().has_concrete(&LocalTypeDataKey::metadata(arch_self)));
    assert_eq!(igf.emit_archetype_witness_table_ref(&mut cx, arch_self, p), igf.b.param(2));

    let function = igf.b.finish();
    assert_eq!(function.value_name(1), Some("Self"));
    assert_eq!(function.value_name(2), Some("SelfWitnessTable"));
}

#[test]
fn witness_method_call_fills_trailing_values() {
    let mut t = TestProgram::new();
    let (p, signature, fn_type) = abstract_witness(&mut t);
    let (_, key) = t.plain_struct("Key");
    let key_p = t.conformance(key, p, |_| {});
    let caller = t.program.add_function("caller");
    let subs = t.program.substitution_map_from_types(Some(signature), &[key]);
    let mut cx = t.session();
    let mut igf = FunctionEmitter::for_function(&cx, Symbol::Function(caller), Vec::new(), IrType::Void);

    let mut witness_metadata = WitnessMetadata::default();
    let args = emit_polymorphic_arguments(&mut cx, &mut igf, &fn_type, &subs, Some(&mut witness_metadata));
    assert!(args.is_empty());
    let self_metadata = witness_metadata.self_metadata.unwrap();
    assert_eq!(igf.b.get_inst(self_metadata), &Inst::TypeMetadataRef { ty: key, request: MetadataRequest::COMPLETE });
    let self_table = witness_metadata.self_witness_table.unwrap();
    assert_eq!(igf.b.get_inst(self_table), &Inst::GlobalAddr(Symbol::ProtocolWitnessTable(key_p)));
}

#[test]
#[should_panic(expected = "no witness metadata")]
fn witness_method_call_requires_witness_metadata() {
    let mut t = TestProgram::new();
    let (p, signature, fn_type) = abstract_witness(&mut t);
    let (_, key) = t.plain_struct("Key");
    t.conformance(key, p, |_| {});
    let caller = t.program.add_function("caller");
    let subs = t.program.substitution_map_from_types(Some(signature), &[key]);
    let mut cx = t.session();
    let mut igf = FunctionEmitter::for_function(&cx, Symbol::Function(caller), Vec::new(), IrType::Void);
    emit_polymorphic_arguments(&mut cx, &mut igf, &fn_type, &subs, None);
}

#[test]
fn pseudogeneric_requirements_are_never_passed() {
    let mut t = TestProgram::new();
    let (p, _) = t.protocol("P", &["f"]);
    let t0 = t.param(0);
    let signature = t.signature(1, vec![t.conforms(t0, p)]);
    let fn_type = LoweredFunctionType::new(FunctionRepresentation::Thick, Some(signature), vec![]).with_pseudogeneric();
    let cx = t.session();
    let convention = PolymorphicConvention::new(&cx, &fn_type);

    assert_eq!(convention.kind(), ConventionKind::Pseudogeneric);
    assert!(convention.sources().is_empty());
    assert_eq!(convention.fulfillment_for_type_metadata(t0).unwrap().path, MetadataPath::impossible());
    assert!(convention.fulfillments().get_witness_table(t0, p).unwrap().path.is_impossible());
    assert_eq!(convention.enumerate_unfulfilled_requirements(&t.program).count(), 0);
}

#[test]
#[should_panic(expected = "expect_witness_method_conformance called on")]
fn pseudogeneric_witness_method_needs_a_conformance() {
    let mut t = TestProgram::new();
    let t0 = t.param(0);
    let signature = t.signature(1, vec![]);
    let fn_type = LoweredFunctionType::new(
        FunctionRepresentation::WitnessMethod,
        Some(signature),
        vec![ParameterInfo::new(t0, ParameterConvention::DirectGuaranteed)],
    )
    .with_self_param()
    .with_pseudogeneric();
    let cx = t.session();
    PolymorphicConvention::new(&cx, &fn_type);
}

#[test]
fn thick_metatype_of_a_parameter_is_not_exact() {
    let mut t = TestProgram::new();
    let t0 = t.param(0);
    let signature = t.signature(1, vec![]);
    // Could be the metatype of a subclass
    let param = t.program.metatype(t0, MetatypeRepr::Thick);
    let fn_type = LoweredFunctionType::new(
        FunctionRepresentation::Thin,
        Some(signature),
        vec![ParameterInfo::new(param, ParameterConvention::DirectUnowned)],
    );
    let cx = t.session();
    let convention = PolymorphicConvention::new(&cx, &fn_type);
    assert!(convention.sources().is_empty());
    assert_eq!(expand_polymorphic_signature(&cx, &fn_type), vec![IrType::TypeMetadataPtr]);
}

#[test]
fn unproductive_parameter_source_is_dropped() {
    let mut t = TestProgram::new();
    let t0 = t.param(0);
    let signature = t.signature(1, vec![]);
    // Tuple metadata exposes nothing about its elements
    let tuple = t.program.tuple_type(&[t0, t.int()]);
    let param = t.program.metatype(tuple, MetatypeRepr::Thick);
    let fn_type = LoweredFunctionType::new(
        FunctionRepresentation::Thin,
        Some(signature),
        vec![ParameterInfo::new(param, ParameterConvention::DirectUnowned)],
    );
    let cx = t.session();
    let convention = PolymorphicConvention::new(&cx, &fn_type);
    assert!(convention.sources().is_empty());
    assert_eq!(
        convention.enumerate_unfulfilled_requirements(&t.program).collect_vec(),
        vec![GenericRequirement::metadata(t0)]
    );
}

#[test]
fn class_and_metatype_parameters_are_sources() {
    let mut t = TestProgram::new();
    let (t0, t1) = (t.param(0), t.param(1));
    let node_signature = t.signature(1, vec![]);
    let node = t.program.add_class("Node", t.module, Some(node_signature), None);
    let node_t0 = t.program.nominal_type(node, &[t0]);
    let pair = t.generic_struct("Pair", 1, vec![]);
    let pair_t1 = t.program.nominal_type(pair, &[t1]);
    let pair_type = t.program.metatype(pair_t1, MetatypeRepr::Thick);
    let signature = t.signature(2, vec![]);
    let fn_type = LoweredFunctionType::new(
        FunctionRepresentation::Thin,
        Some(signature),
        vec![
            ParameterInfo::new(node_t0, ParameterConvention::DirectGuaranteed),
            ParameterInfo::new(pair_type, ParameterConvention::DirectUnowned),
        ],
    );
    let cx = t.session();
    let convention = PolymorphicConvention::new(&cx, &fn_type);

    assert_eq!(
        convention.sources(),
        &[
            MetadataSource { kind: MetadataSourceKind::ClassPointer, param_index: Some(0), ty: node_t0 },
            MetadataSource { kind: MetadataSourceKind::Metadata, param_index: Some(1), ty: pair_t1 },
        ]
    );
    assert!(convention.is_class_pointer_source(0));
    assert!(!convention.is_class_pointer_source(1));
    assert_eq!(convention.fulfillment_for_type_metadata(t0).unwrap().path.len(), 1);
    let t1_metadata = convention.fulfillment_for_type_metadata(t1).unwrap();
    assert_eq!(t1_metadata.source_index, 1);
    assert_eq!(t1_metadata.path.components(), &[Component::NominalTypeArgument(0)]);
    assert!(expand_polymorphic_signature(&cx, &fn_type).is_empty());
}

#[test]
fn objc_and_block_functions_take_no_polymorphic_arguments() {
    let mut t = TestProgram::new();
    let signature = t.signature(1, vec![]);
    let objc = LoweredFunctionType::new(FunctionRepresentation::ObjCMethod, Some(signature), vec![]);
    let block = LoweredFunctionType::new(FunctionRepresentation::Block, None, vec![]);
    let thick = LoweredFunctionType::new(FunctionRepresentation::Thick, Some(signature), vec![]);
    assert!(!has_polymorphic_parameters(&objc));
    assert!(!has_polymorphic_parameters(&block));
    assert!(has_polymorphic_parameters(&thick));
}

#[test]
#[should_panic(expected = "consider_objc_generic_self called on a method without a self parameter")]
fn objc_method_convention_needs_a_self_parameter() {
    let mut t = TestProgram::new();
    let signature = t.signature(1, vec![]);
    let objc = LoweredFunctionType::new(FunctionRepresentation::ObjCMethod, Some(signature), vec![]);
    let cx = t.session();
    PolymorphicConvention::new(&cx, &objc);
}

#[test]
#[should_panic(expected = "self_param_index called on a function with no parameters")]
fn self_parameter_index_needs_a_parameter() {
    let mut t = TestProgram::new();
    let signature = t.signature(1, vec![]);
    let mut objc = LoweredFunctionType::new(FunctionRepresentation::ObjCMethod, Some(signature), vec![]);
    objc.has_self_param = true;
    let cx = t.session();
    PolymorphicConvention::new(&cx, &objc);
}
