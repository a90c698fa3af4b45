// Copyright (c) 2025 knix
// All rights reserved.

use std::sync::Arc;

use crate::layout::*;
use crate::program::ProtocolId;
use crate::test_fixtures::TestProgram;

/// `protocol Collection: Sequence, Sendable { func count(); <stripped>; associatedtype Element; Element: Hashable }`
fn collection(t: &mut TestProgram) -> (ProtocolId, ProtocolId, ProtocolId) {
    let (sequence, _) = t.protocol("Sequence", &["make_iterator"]);
    let (hashable, _) = t.protocol("Hashable", &["hash"]);
    let sendable = t.marker_protocol("Sendable");
    let collection = t.program.add_protocol("Collection", t.module);
    t.program.add_inherited_protocol(collection, sequence);
    t.program.add_inherited_protocol(collection, sendable);
    let element = t.program.add_assoc_type(collection, "Element");
    t.program.add_method(collection, "count");
    t.program.add_placeholder(collection);
    let element_ty = t.program.dependent_member(t.program.self_type(), element);
    t.program.add_associated_conformance(collection, element_ty, hashable);
    t.program.add_associated_conformance(collection, element_ty, sendable);
    (collection, sequence, hashable)
}

#[test]
fn entry_order() {
    let mut t = TestProgram::new();
    let (collection, sequence, hashable) = collection(&mut t);
    let entries = visit_protocol_requirements(&t.program, collection);
    let decl = t.program.protocol(collection);
    let count = decl.members.iter().find_map(|m| match m {
        crate::program::ProtocolMember::Method(m) => Some(*m),
        _ => None,
    });
    let element = decl.members.iter().find_map(|m| match m {
        crate::program::ProtocolMember::AssociatedType(a) => Some(*a),
        _ => None,
    });
    let hashable_req = decl.associated_conformances[0];
    assert_eq!(hashable_req.requirement, hashable);
    assert_eq!(
        entries,
        vec![
            WitnessTableEntry::OutOfLineBase(sequence),
            WitnessTableEntry::Method(count.unwrap()),
            WitnessTableEntry::Placeholder,
            WitnessTableEntry::AssociatedType(element.unwrap()),
            WitnessTableEntry::AssociatedConformance(hashable_req),
        ]
    );
}

#[test]
fn indices_and_offsets() {
    let mut t = TestProgram::new();
    let (collection, sequence, _) = collection(&mut t);
    let info = ProtocolInfo::compute(&t.program, collection, ProtocolInfoKind::Full);
    let hashable_req = t.program.protocol(collection).associated_conformances[0];
    assert_eq!(info.num_witnesses(), 5);
    assert_eq!(info.base_index(sequence), WitnessIndex::new(0));
    assert_eq!(info.base_index(sequence).for_protocol_witness_table(), 1);
    let conformance_index = info.associated_conformance_index(&hashable_req);
    assert_eq!(conformance_index.value(), 4);
    assert_eq!(conformance_index.for_protocol_witness_table(), 5);
    assert_eq!(WitnessIndex::private_offset(0), -1);
    assert_eq!(WitnessIndex::private_offset(2), -3);
}

#[test]
#[should_panic]
fn requirement_signature_hides_methods() {
    let mut t = TestProgram::new();
    let (sized, methods) = t.protocol("Sized", &["size"]);
    let info = ProtocolInfo::compute(&t.program, sized, ProtocolInfoKind::RequirementSignature);
    assert_eq!(info.num_witnesses(), 0);
    info.function_index(methods[0]);
}

#[test]
fn layout_is_deterministic_and_prefix_stable() {
    let mut t = TestProgram::new();
    let (collection, sequence, _) = collection(&mut t);
    let cache = ProtocolInfoCache::new();

    let rs = cache.get(&t.program, collection, ProtocolInfoKind::RequirementSignature);
    assert_eq!(rs.entries(), &[WitnessTableEntry::OutOfLineBase(sequence)]);
    let rs_again = cache.get(&t.program, collection, ProtocolInfoKind::RequirementSignature);
    assert!(Arc::ptr_eq(&rs, &rs_again));

    let full = cache.get(&t.program, collection, ProtocolInfoKind::Full);
    assert_eq!(full.kind, ProtocolInfoKind::Full);
    assert!(full.entries().starts_with(rs.entries()));
    assert_eq!(full.base_index(sequence), rs.base_index(sequence));

    // A narrower request is served by the broader cached layout
    let narrow = cache.get(&t.program, collection, ProtocolInfoKind::RequirementSignature);
    assert!(Arc::ptr_eq(&full, &narrow));

    let fresh = ProtocolInfo::compute(&t.program, collection, ProtocolInfoKind::Full);
    assert_eq!(&fresh, full.as_ref());
    assert_eq!(cache.len(), 1);
}

#[test]
fn marker_protocols_have_no_layout() {
    let mut t = TestProgram::new();
    let sendable = t.marker_protocol("Sendable");
    assert!(visit_protocol_requirements(&t.program, sendable).is_empty());
}

#[test]
fn cache_shared_across_threads() {
    let mut t = TestProgram::new();
    let (collection, _, _) = collection(&mut t);
    let cache = Arc::new(ProtocolInfoCache::new());
    let program = &t.program;
    let layouts: Vec<Arc<ProtocolInfo>> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let cache = cache.clone();
                let kind = if i % 2 == 0 { ProtocolInfoKind::RequirementSignature } else { ProtocolInfoKind::Full };
                s.spawn(move || cache.get(program, collection, kind))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    let full = cache.get(program, collection, ProtocolInfoKind::Full);
    for layout in layouts {
        assert!(full.entries().starts_with(layout.entries()));
    }
}
