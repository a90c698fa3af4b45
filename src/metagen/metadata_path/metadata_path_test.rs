// Copyright (c) 2025 knix
// All rights reserved.

use crate::ir::{Callee, Inst, IrType, MetadataRequest, MetadataState, RuntimeFn, Symbol};
use crate::layout::WitnessIndex;
use crate::local_type_data::{FunctionEmitter, LocalTypeDataKey, MetadataResponse};
use crate::metadata_path::*;
use crate::program::ConformanceRef;
use crate::test_fixtures::TestProgram;

fn path(components: &[Component]) -> MetadataPath {
    components.iter().fold(MetadataPath::new(), |path, c| path.with(*c))
}

#[test]
fn display() {
    let p = path(&[
        Component::NominalTypeArgument(0),
        Component::OutOfLineBaseProtocol(WitnessIndex::new(2)),
        Component::ConditionalConformance(1),
    ]);
    assert_eq!(p.to_string(), "nominal_type_argument[0].out_of_line_base_protocol[2].conditional_conformance[1]");
    assert_eq!(p.len(), 3);
    assert_eq!(MetadataPath::new().to_string(), "");
    assert!(MetadataPath::new().is_empty());
    let impossible = MetadataPath::impossible();
    assert!(impossible.is_impossible());
    assert!(!p.is_impossible());
    assert_eq!(impossible.to_string(), "impossible");
}

#[test]
fn resolves_nominal_arguments_to_their_conformances() {
    let mut t = TestProgram::new();
    let (comparable, _) = t.protocol("Comparable", &["lt"]);
    let t0 = t.param(0);
    let boxed = t.generic_struct("Box", 1, vec![t.conforms(t0, comparable)]);
    let (_, key) = t.plain_struct("Key");
    let key_comparable = t.conformance(key, comparable, |_| {});
    let box_key = t.program.nominal_type(boxed, &[key]);
    let mut cx = t.session();

    let source = LocalTypeDataKey::metadata(box_key);
    assert_eq!(
        path(&[Component::NominalTypeArgument(0)]).resolve_key(&mut cx, source),
        LocalTypeDataKey::metadata(key)
    );
    assert_eq!(
        path(&[Component::NominalTypeArgumentConformance(1)]).resolve_key(&mut cx, source),
        LocalTypeDataKey::witness_table(key, ConformanceRef::Concrete(key_comparable))
    );
    assert_eq!(MetadataPath::new().resolve_key(&mut cx, source), source);
}

#[test]
fn resolves_inherited_and_conditional_tables() {
    let mut t = TestProgram::new();
    let (base, _) = t.protocol("Base", &["base"]);
    let (p, _) = t.protocol("P", &["f"]);
    t.program.add_inherited_protocol(p, base);
    let (showable, _) = t.protocol("Showable", &["show"]);
    let (_, key) = t.plain_struct("Key");
    let key_base = t.conformance(key, base, |_| {});
    let key_p = t.conformance(key, p, |c| c.inherited = vec![(base, ConformanceRef::Concrete(key_base))]);
    let key_showable = t.conformance(key, showable, |_| {});
    let t0 = t.param(0);
    let wrapper = t.generic_struct("Wrapper", 1, vec![]);
    let wrapper_t0 = t.program.nominal_type(wrapper, &[t0]);
    let requirement = t.conforms(t0, showable);
    let signature = t.signature(1, vec![requirement]);
    t.conformance(wrapper_t0, showable, |c| {
        c.generic_signature = Some(signature);
        c.conditional_requirements = vec![requirement];
    });
    let wrapper_key = t.program.nominal_type(wrapper, &[key]);
    let wrapper_key_showable = t.program.lookup_conformance(wrapper_key, showable).unwrap();
    let a0 = t.program.map_type_into_context(Some(signature), t0);
    let mut cx = t.session();

    let to_base = path(&[Component::OutOfLineBaseProtocol(WitnessIndex::new(0))]);
    assert_eq!(
        to_base.resolve_key(&mut cx, LocalTypeDataKey::witness_table(key, ConformanceRef::Concrete(key_p))),
        LocalTypeDataKey::witness_table(key, ConformanceRef::Concrete(key_base))
    );
    assert_eq!(
        to_base.resolve_key(&mut cx, LocalTypeDataKey::witness_table(a0, ConformanceRef::Abstract(p))),
        LocalTypeDataKey::witness_table(a0, ConformanceRef::Abstract(base))
    );
    assert_eq!(
        path(&[Component::ConditionalConformance(0)])
            .resolve_key(&mut cx, LocalTypeDataKey::witness_table(wrapper_key, wrapper_key_showable)),
        LocalTypeDataKey::witness_table(key, ConformanceRef::Concrete(key_showable))
    );
}

#[test]
fn following_without_a_source_emits_nothing() {
    let mut t = TestProgram::new();
    let boxed = t.generic_struct("Box", 1, vec![]);
    let box_int = t.program.nominal_type(boxed, &[t.int()]);
    let f = t.program.add_function("f");
    let mut cx = t.session();
    let mut igf = FunctionEmitter::for_function(&cx, Symbol::Function(f), vec![], IrType::Void);

    let followed = path(&[Component::NominalTypeArgument(0)]).follow(
        &mut cx,
        &mut igf,
        LocalTypeDataKey::metadata(box_int),
        None,
        MetadataRequest::COMPLETE,
        None,
    );
    assert_eq!(followed, None);
    assert!(igf.b.finish().instrs.is_empty());
}

#[test]
fn followed_steps_become_local_data() {
    let mut t = TestProgram::new();
    let boxed = t.generic_struct("Box", 1, vec![]);
    let int = t.int();
    let box_int = t.program.nominal_type(boxed, &[int]);
    let box_box_int = t.program.nominal_type(boxed, &[box_int]);
    let f = t.program.add_function("f");
    let mut cx = t.session();
    let mut igf = FunctionEmitter::for_function(&cx, Symbol::Function(f), vec![IrType::TypeMetadataPtr], IrType::Void);
    let source = MetadataResponse::complete(igf.b.param(0));
    let two_deep = path(&[Component::NominalTypeArgument(0), Component::NominalTypeArgument(0)]);

    igf.begin_conditional_scope();
    let int_metadata =
        two_deep.follow_from_type_metadata(&mut cx, &mut igf, box_box_int, source, MetadataRequest::COMPLETE, None);
    let int_load = igf.b.get_inst(int_metadata.value).clone();
    let Inst::NominalTypeArgument { metadata: middle, nominal, index: 0 } = int_load else {
        panic!("expected a type argument load, got {:?}", int_load)
    };
    assert_eq!(nominal, boxed);
    assert_eq!(igf.b.get_inst(middle), &Inst::NominalTypeArgument { metadata: 0, nominal: boxed, index: 0 });
    assert_eq!(int_metadata.state, MetadataState::Complete);
    assert!(igf.cache().has_concrete(&LocalTypeDataKey::metadata(box_int)));
    assert!(igf.cache().has_concrete(&LocalTypeDataKey::metadata(int)));

    // The second walk starts from the deepest step already emitted
    let again =
        two_deep.follow_from_type_metadata(&mut cx, &mut igf, box_box_int, source, MetadataRequest::COMPLETE, None);
    assert_eq!(again, int_metadata);

    igf.end_conditional_scope();
    assert!(!igf.cache().has_concrete(&LocalTypeDataKey::metadata(int)));
    assert_eq!(igf.b.finish().instrs.len(), 3);
}

#[test]
fn incomplete_sources_are_checked() {
    let mut t = TestProgram::new();
    let boxed = t.generic_struct("Box", 1, vec![]);
    let box_int = t.program.nominal_type(boxed, &[t.int()]);
    let f = t.program.add_function("f");
    let mut cx = t.session();
    let mut igf = FunctionEmitter::for_function(&cx, Symbol::Function(f), vec![IrType::TypeMetadataPtr], IrType::Void);
    let source = MetadataResponse::new(igf.b.param(0), MetadataState::LayoutComplete);

    let response = path(&[Component::NominalTypeArgument(0)]).follow_from_type_metadata(
        &mut cx,
        &mut igf,
        box_int,
        source,
        MetadataRequest::COMPLETE,
        None,
    );
    assert_eq!(response.state, MetadataState::Complete);
    let function = igf.b.finish();
    let Inst::Call { callee, args, .. } = function.get_inst(response.value) else { panic!("expected a state check") };
    assert_eq!(*callee, Callee::Runtime(RuntimeFn::CheckMetadataState));
    assert_eq!(
        function.get_inst(args[1]),
        &Inst::NominalTypeArgument { metadata: 0, nominal: boxed, index: 0 }
    );
}

#[test]
fn path_cache_shares_prefixes() {
    let mut t = TestProgram::new();
    let boxed = t.generic_struct("Box", 1, vec![]);
    let int = t.int();
    let box_int = t.program.nominal_type(boxed, &[int]);
    let box_box_int = t.program.nominal_type(boxed, &[box_int]);
    let f = t.program.add_function("f");
    let mut cx = t.session();
    let mut igf = FunctionEmitter::for_function(&cx, Symbol::Function(f), vec![IrType::TypeMetadataPtr], IrType::Void);
    let source = MetadataResponse::complete(igf.b.param(0));
    let one_deep = path(&[Component::NominalTypeArgument(0)]);
    let two_deep = one_deep.with(Component::NominalTypeArgument(0));

    let mut cache = PathCache::new();
    assert!(cache.is_empty());
    let first = one_deep.follow_from_type_metadata(
        &mut cx,
        &mut igf,
        box_box_int,
        source,
        MetadataRequest::COMPLETE,
        Some(&mut cache),
    );
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.find_prefix(&two_deep), Some((first, 1)));

    let second = two_deep.follow_from_type_metadata(
        &mut cx,
        &mut igf,
        box_box_int,
        source,
        MetadataRequest::COMPLETE,
        Some(&mut cache),
    );
    assert_eq!(cache.len(), 2);
    assert_eq!(
        igf.b.get_inst(second.value),
        &Inst::NominalTypeArgument { metadata: first.value, nominal: boxed, index: 0 }
    );
    // Cached walks don't leave local data behind
    assert!(!igf.cache().has_concrete(&LocalTypeDataKey::metadata(int)));

    let instrs = igf.b.finish().instrs.len();
    assert_eq!(instrs, 3);
    assert_eq!(cache.find_prefix(&two_deep.with(Component::NominalTypeArgument(0))), Some((second, 2)));
    cache.insert_new(one_deep.clone(), MetadataResponse::complete(99));
    assert_eq!(cache.find_prefix(&one_deep), Some((first, 1)));
}

#[test]
fn associated_conformances_go_through_the_runtime() {
    let mut t = TestProgram::new();
    let (p, _) = t.protocol("P", &["f"]);
    let (container, element) = t.protocol_with_assoc("Container", "Element");
    let self_element = t.program.dependent_member(t.program.self_type(), element);
    let requirement = t.program.add_associated_conformance(container, self_element, p);
    let t0 = t.param(0);
    let t0_element = t.program.dependent_member(t0, element);
    let signature = t.signature(1, vec![t.conforms(t0, container), t.conforms(t0_element, p)]);
    let a0 = t.program.map_type_into_context(Some(signature), t0);
    let a0_element = t.program.map_type_into_context(Some(signature), t0_element);
    let f = t.program.add_function("f");
    let mut cx = t.session();
    let mut igf = FunctionEmitter::for_function(
        &cx,
        Symbol::Function(f),
        vec![IrType::TypeMetadataPtr, IrType::WitnessTablePtr],
        IrType::Void,
    );
    let (metadata, table) = (igf.b.param(0), igf.b.param(1));
    igf.set_unscoped_local_type_data(LocalTypeDataKey::metadata(a0), MetadataResponse::complete(metadata));
    let container_conformance = ConformanceRef::Abstract(container);
    igf.set_unscoped_local_type_data(
        LocalTypeDataKey::witness_table(a0, container_conformance),
        MetadataResponse::complete(table),
    );

    let element_p = path(&[Component::AssociatedConformance(WitnessIndex::new(1))]).follow_from_witness_table(
        &mut cx,
        &mut igf,
        a0,
        container_conformance,
        MetadataResponse::complete(table),
        MetadataRequest::COMPLETE,
        None,
    );
    assert!(igf.cache().has_concrete(&LocalTypeDataKey::witness_table(a0_element, ConformanceRef::Abstract(p))));
    let function = igf.b.finish();
    let Inst::Call { callee, args, .. } = function.get_inst(element_p.value) else { panic!("expected a runtime call") };
    assert_eq!(*callee, Callee::Runtime(RuntimeFn::GetAssociatedConformanceWitness));
    assert_eq!((args[0], args[1]), (table, metadata));
    assert_eq!(function.get_inst(args[4]), &Inst::GlobalAddr(Symbol::AssociatedConformanceDescriptor(requirement)));
    assert!(function.calls().any(|(callee, _)| *callee == Callee::Runtime(RuntimeFn::GetAssociatedTypeWitness)));
}

#[test]
#[should_panic(expected = "following an impossible path")]
fn impossible_paths_cannot_be_followed() {
    let mut t = TestProgram::new();
    let int = t.int();
    let f = t.program.add_function("f");
    let mut cx = t.session();
    let mut igf = FunctionEmitter::for_function(&cx, Symbol::Function(f), vec![IrType::TypeMetadataPtr], IrType::Void);
    let source = MetadataResponse::complete(igf.b.param(0));
    MetadataPath::impossible().follow_from_type_metadata(&mut cx, &mut igf, int, source, MetadataRequest::COMPLETE, None);
}

#[test]
#[should_panic(expected = "following an impossible path")]
fn impossible_paths_fail_even_when_the_source_is_bound() {
    let mut t = TestProgram::new();
    let int = t.int();
    let f = t.program.add_function("f");
    let mut cx = t.session();
    let mut igf = FunctionEmitter::for_function(&cx, Symbol::Function(f), vec![IrType::TypeMetadataPtr], IrType::Void);
    let source = MetadataResponse::complete(igf.b.param(0));
    igf.set_unscoped_local_type_data(LocalTypeDataKey::metadata(int), source);
    MetadataPath::impossible().follow_from_type_metadata(&mut cx, &mut igf, int, source, MetadataRequest::COMPLETE, None);
}
