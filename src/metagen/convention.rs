// Copyright (c) 2025 knix
// All rights reserved.

//! The polymorphic calling convention: which generic requirements a function
//! receives as extra arguments, and which it recovers from its ordinary
//! parameters.
//!
//! A [`PolymorphicConvention`] is computed from a lowered function type alone, so
//! the caller and the callee always agree on it. Sources are discovered in a fixed
//! order and each is searched for fulfillments; whatever remains unfulfilled is
//! passed explicitly, in [`enumerate_generic_requirements`] order.

use log::trace;

use crate::bindings::{bind_generic_requirement, emit_generic_requirement_from_substitutions};
use crate::conformance::{emit_witness_table_ref, witness_table_name};
use crate::fulfillment::{Fulfillment, FulfillmentKey, FulfillmentMap, InterestingKeys, SignatureKeys};
use crate::ir::{Inst, InstId, IrType, MetadataRequest, MetadataState};
use crate::local_type_data::{FunctionEmitter, LocalTypeDataKey, MetadataResponse};
use crate::metadata_path::MetadataPath;
use crate::program::lowered::{FunctionRepresentation, LoweredFunctionType, ParameterInfo};
use crate::program::types::{MetatypeRepr, Type, TypeId};
use crate::program::{ConformanceRef, GenericSignatureId, Program, SubstitutionMap};
use crate::requirements::{GenericRequirement, enumerate_generic_requirements};
use crate::session::Session;

#[cfg(test)]
mod convention_test;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConventionKind {
    /// Generic arguments are erased; only a witness method's Self is tracked.
    Pseudogeneric,
    /// Everything comes from the trailing Self metadata and Self witness table.
    WitnessMethod,
    /// Everything comes from the class pointer passed as self.
    ObjCGenericSelf,
    General,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetadataSourceKind {
    /// The metadata of a thick metatype parameter.
    Metadata,
    /// The isa of a class instance parameter.
    ClassPointer,
    /// Extra metadata passed for an indirect self.
    GenericLValueMetadata,
    /// The trailing Self metadata of a witness method.
    SelfMetadata,
    /// The trailing Self witness table of a witness method.
    SelfWitnessTable,
}

/// A value available on entry from which metadata can be recovered. `ty` is the
/// interface type it is the metadata (or a table) of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MetadataSource {
    pub kind: MetadataSourceKind,
    pub param_index: Option<u32>,
    pub ty: TypeId,
}

impl MetadataSource {
    fn new(kind: MetadataSourceKind, param_index: Option<u32>, ty: TypeId) -> MetadataSource {
        MetadataSource { kind, param_index, ty }
    }

    #[track_caller]
    pub fn expect_param_index(&self) -> u32 {
        match self.param_index {
            Some(index) => index,
            None => panic!("expect_param_index called on: {:?}", self),
        }
    }
}

pub struct PolymorphicConvention {
    kind: ConventionKind,
    signature: Option<GenericSignatureId>,
    sources: Vec<MetadataSource>,
    fulfillments: FulfillmentMap,
}

impl PolymorphicConvention {
    pub fn new(cx: &Session, fn_type: &LoweredFunctionType) -> PolymorphicConvention {
        let kind = if fn_type.is_pseudogeneric {
            ConventionKind::Pseudogeneric
        } else {
            match fn_type.representation {
                FunctionRepresentation::WitnessMethod => ConventionKind::WitnessMethod,
                FunctionRepresentation::ObjCMethod => ConventionKind::ObjCGenericSelf,
                _ => ConventionKind::General,
            }
        };
        let mut convention = PolymorphicConvention {
            kind,
            signature: fn_type.generic_signature,
            sources: Vec::new(),
            fulfillments: FulfillmentMap::new(),
        };
        match kind {
            ConventionKind::Pseudogeneric => {
                if fn_type.representation == FunctionRepresentation::WitnessMethod {
                    convention.consider_witness_self(cx, fn_type);
                }
                convention.add_pseudogeneric_fulfillments(cx.program);
            }
            ConventionKind::WitnessMethod => convention.consider_witness_self(cx, fn_type),
            ConventionKind::ObjCGenericSelf => convention.consider_objc_generic_self(cx, fn_type),
            ConventionKind::General => {
                let self_index = fn_type.self_param_index();
                if let Some(self_index) = self_index {
                    convention.consider_parameter(cx, &fn_type.params[self_index], self_index, true);
                }
                for (index, param) in fn_type.params.iter().enumerate() {
                    if Some(index) != self_index {
                        convention.consider_parameter(cx, param, index, false);
                    }
                }
            }
        }
        trace!(
            "{:?} convention: {} sources, {} fulfillments",
            kind,
            convention.sources.len(),
            convention.fulfillments.len()
        );
        convention
    }

    pub fn kind(&self) -> ConventionKind {
        self.kind
    }

    pub fn signature(&self) -> Option<GenericSignatureId> {
        self.signature
    }

    pub fn sources(&self) -> &[MetadataSource] {
        &self.sources
    }

    pub fn source(&self, index: u32) -> &MetadataSource {
        &self.sources[index as usize]
    }

    pub fn fulfillments(&self) -> &FulfillmentMap {
        &self.fulfillments
    }

    pub fn fulfillment_for_type_metadata(&self, ty: TypeId) -> Option<&Fulfillment> {
        self.fulfillments.get_type_metadata(ty)
    }

    pub fn is_class_pointer_source(&self, param_index: usize) -> bool {
        self.class_pointer_source(param_index).is_some()
    }

    fn class_pointer_source(&self, param_index: usize) -> Option<&MetadataSource> {
        self.sources
            .iter()
            .find(|s| s.kind == MetadataSourceKind::ClassPointer && s.param_index == Some(param_index as u32))
    }

    pub fn enumerate_requirements<'a>(&self, program: &'a Program) -> impl Iterator<Item = GenericRequirement> + 'a {
        enumerate_generic_requirements(program, self.signature)
    }

    /// The requirements that must be passed explicitly, in argument order.
    pub fn enumerate_unfulfilled_requirements<'a>(
        &'a self,
        program: &'a Program,
    ) -> impl Iterator<Item = GenericRequirement> + 'a {
        self.enumerate_requirements(program).filter(move |r| {
            let key = FulfillmentKey { ty: r.type_parameter, protocol: r.protocol };
            self.fulfillments.get(&key).is_none()
        })
    }

    fn add_pseudogeneric_fulfillments(&mut self, program: &Program) {
        let requirements: Vec<GenericRequirement> = self.enumerate_requirements(program).collect();
        for requirement in requirements {
            let key = FulfillmentKey { ty: requirement.type_parameter, protocol: requirement.protocol };
            // The source index is irrelevant; the path can never be followed
            self.fulfillments.add_fulfillment(key, 0, MetadataPath::impossible(), MetadataState::Complete);
        }
    }

    fn consider_witness_self(&mut self, cx: &Session, fn_type: &LoweredFunctionType) {
        let program = cx.program;
        let self_ty = fn_type.self_instance_type(program);
        let conformance = fn_type.expect_witness_method_conformance();

        self.sources.push(MetadataSource::new(MetadataSourceKind::SelfMetadata, None, self_ty));
        if is_generic_param(program, self_ty) {
            self.add_self_metadata_fulfillment(self_ty);
        }
        self.consider_type(cx, self_ty, false, self.last_source());

        self.sources.push(MetadataSource::new(MetadataSourceKind::SelfWitnessTable, None, self_ty));
        self.add_self_witness_table_fulfillment(cx, self_ty, conformance);
    }

    fn consider_objc_generic_self(&mut self, cx: &Session, fn_type: &LoweredFunctionType) {
        let program = cx.program;
        let Some(param_index) = fn_type.self_param_index() else {
            panic!("consider_objc_generic_self called on a method without a self parameter: {:?}", fn_type)
        };
        let self_ty = fn_type.self_instance_type(program);
        self.sources.push(MetadataSource::new(MetadataSourceKind::ClassPointer, Some(param_index as u32), self_ty));
        if is_generic_param(program, self_ty) {
            self.add_self_metadata_fulfillment(self_ty);
        } else {
            self.consider_type(cx, self_ty, false, self.last_source());
        }
    }

    fn consider_parameter(&mut self, cx: &Session, param: &ParameterInfo, index: usize, is_self: bool) {
        let program = cx.program;
        let ty = param.ty;
        if param.convention.is_indirect() {
            // Only an indirect self is worth an extra argument
            if is_self && program.nominal_of(ty).is_some() {
                self.consider_new_type_source(cx, MetadataSourceKind::GenericLValueMetadata, index, ty, true);
            }
            return;
        }

        if program.class_of(ty).is_some() {
            self.consider_new_type_source(cx, MetadataSourceKind::ClassPointer, index, ty, false);
            return;
        }

        if is_generic_param(program, ty) {
            let keys = SignatureKeys::new(program, self.signature);
            if let Some(superclass) = keys.superclass_bound(ty) {
                self.consider_new_type_source(cx, MetadataSourceKind::ClassPointer, index, superclass, false);
                return;
            }
        }

        if let Some(metatype) = program.get_type(ty).as_metatype() {
            if metatype.repr == MetatypeRepr::Thick {
                self.consider_new_type_source(cx, MetadataSourceKind::Metadata, index, metatype.instance, false);
            }
        }
    }

    /// Adds a source speculatively, keeping it only if it fulfills something.
    fn consider_new_type_source(
        &mut self,
        cx: &Session,
        kind: MetadataSourceKind,
        index: usize,
        ty: TypeId,
        is_exact: bool,
    ) {
        let keys = SignatureKeys::new(cx.program, self.signature);
        if !keys.has_interesting_type(ty) {
            return;
        }
        self.sources.push(MetadataSource::new(kind, Some(index as u32), ty));
        if !self.consider_type(cx, ty, is_exact, self.last_source()) {
            trace!("dropping unused {:?} source for parameter {}", kind, index);
            self.sources.pop();
        }
    }

    fn consider_type(&mut self, cx: &Session, ty: TypeId, is_exact: bool, source: u32) -> bool {
        let keys = SignatureKeys::new(cx.program, self.signature);
        self.fulfillments.search_type_metadata(
            cx,
            ty,
            is_exact,
            MetadataState::Complete,
            source,
            &MetadataPath::new(),
            &keys,
        )
    }

    fn add_self_metadata_fulfillment(&mut self, ty: TypeId) {
        let source = self.last_source();
        self.fulfillments.add_fulfillment(FulfillmentKey::metadata(ty), source, MetadataPath::new(), MetadataState::Complete);
    }

    fn add_self_witness_table_fulfillment(&mut self, cx: &Session, ty: TypeId, conformance: ConformanceRef) {
        let source = self.last_source();
        let protocol = conformance.protocol(cx.program);
        self.fulfillments.add_fulfillment(
            FulfillmentKey::witness_table(ty, protocol),
            source,
            MetadataPath::new(),
            MetadataState::Complete,
        );
        if let ConformanceRef::Concrete(concrete) = conformance {
            let keys = SignatureKeys::new(cx.program, self.signature);
            self.fulfillments.search_conformance(cx, concrete, source, &MetadataPath::new(), &keys);
        }
    }

    fn last_source(&self) -> u32 {
        (self.sources.len() - 1) as u32
    }
}

fn is_generic_param(program: &Program, ty: TypeId) -> bool {
    matches!(program.get_type(ty), Type::GenericParam(_))
}

/// Whether the lowered signature carries generic arguments at all.
pub fn has_polymorphic_parameters(fn_type: &LoweredFunctionType) -> bool {
    match fn_type.representation {
        FunctionRepresentation::Block => {
            assert!(!fn_type.is_polymorphic(), "polymorphic block function");
            false
        }
        FunctionRepresentation::Thick
        | FunctionRepresentation::Thin
        | FunctionRepresentation::Method
        | FunctionRepresentation::Closure => fn_type.is_polymorphic(),
        // Generic at the language level, but no metadata is passed
        FunctionRepresentation::CFunctionPointer | FunctionRepresentation::ObjCMethod => false,
        FunctionRepresentation::WitnessMethod => true,
    }
}

/// The extra leading arguments of a polymorphic function: lvalue metadata for an
/// indirect self, then one value per unfulfilled requirement.
pub fn expand_polymorphic_signature(cx: &Session, fn_type: &LoweredFunctionType) -> Vec<IrType> {
    let convention = PolymorphicConvention::new(cx, fn_type);
    let mut out = Vec::new();
    for source in convention.sources() {
        match source.kind {
            MetadataSourceKind::GenericLValueMetadata => out.push(IrType::TypeMetadataPtr),
            // Already ordinary parameters, or trailing
            MetadataSourceKind::Metadata
            | MetadataSourceKind::ClassPointer
            | MetadataSourceKind::SelfMetadata
            | MetadataSourceKind::SelfWitnessTable => {}
        }
    }
    out.extend(convention.enumerate_unfulfilled_requirements(cx.program).map(|r| r.ir_type()));
    out
}

/// A witness method always ends with Self's metadata and Self's witness table.
pub fn expand_trailing_witness_signature(fn_type: &LoweredFunctionType) -> [IrType; 2] {
    assert_eq!(
        fn_type.representation,
        FunctionRepresentation::WitnessMethod,
        "trailing witness signature of a non-witness method"
    );
    [IrType::TypeMetadataPtr, IrType::WitnessTablePtr]
}

/// Calls `callback` for each generic parameter that some source fulfills.
pub fn enumerate_generic_param_fulfillments(
    cx: &Session,
    fn_type: &LoweredFunctionType,
    mut callback: impl FnMut(TypeId, &MetadataSource, &MetadataPath),
) {
    let convention = PolymorphicConvention::new(cx, fn_type);
    let Some(signature) = fn_type.generic_signature else { return };
    for param in cx.program.signature(signature).params.iter() {
        let Some(fulfillment) = convention.fulfillment_for_type_metadata(param.ty) else { continue };
        let source = convention.source(fulfillment.source_index);
        callback(param.ty, source, &fulfillment.path);
    }
}

/// The trailing Self values a witness method receives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WitnessMetadata {
    pub self_metadata: Option<InstId>,
    pub self_witness_table: Option<InstId>,
}

/// Takes the trailing Self witness table and Self metadata off the end of
/// `params`.
pub fn collect_trailing_witness_metadata(
    igf: &mut FunctionEmitter,
    fn_type: &LoweredFunctionType,
    params: &mut Vec<InstId>,
) -> WitnessMetadata {
    assert_eq!(fn_type.representation, FunctionRepresentation::WitnessMethod, "not a witness method");
    let (Some(wtable), Some(metadata)) = (params.pop(), params.pop()) else {
        panic!("witness method is missing its trailing witness parameters")
    };
    assert!(
        matches!(igf.b.get_inst(wtable), Inst::Param { ty: IrType::WitnessTablePtr, .. }),
        "parameter signature mismatch: witness metadata didn't end in a witness table"
    );
    assert!(
        matches!(igf.b.get_inst(metadata), Inst::Param { ty: IrType::TypeMetadataPtr, .. }),
        "parameter signature mismatch: witness metadata didn't end in a metatype"
    );
    igf.b.set_name(wtable, "SelfWitnessTable");
    igf.b.set_name(metadata, "Self");
    WitnessMetadata { self_metadata: Some(metadata), self_witness_table: Some(wtable) }
}

/// Binds everything the function's generic context needs on entry:
/// early sources, then `polymorphic_params` (one per unfulfilled requirement,
/// after any lvalue metadata), then metadata recoverable from ordinary
/// parameters, which `get_parameter` yields by index.
pub fn emit_polymorphic_parameters(
    cx: &mut Session,
    igf: &mut FunctionEmitter,
    fn_type: &LoweredFunctionType,
    polymorphic_params: &[InstId],
    witness_metadata: Option<&WitnessMetadata>,
    get_parameter: impl Fn(usize) -> InstId,
) {
    let convention = PolymorphicConvention::new(cx, fn_type);
    let program = cx.program;
    let signature = fn_type.generic_signature;
    let in_context = |ty: TypeId| program.map_type_into_context(signature, ty);
    let mut claimed = polymorphic_params.iter().copied();

    for source in convention.sources() {
        bind_extra_source(cx, igf, fn_type, source, &mut claimed, witness_metadata);
    }

    for requirement in convention.enumerate_unfulfilled_requirements(program) {
        let Some(value) = claimed.next() else {
            panic!("missing polymorphic argument for {}", requirement)
        };
        bind_generic_requirement(cx, igf, requirement, value, MetadataState::Complete, &in_context);
    }
    assert!(claimed.next().is_none(), "unclaimed polymorphic arguments");

    bind_parameter_sources(cx, igf, fn_type, &convention, get_parameter);
}

fn bind_extra_source(
    cx: &Session,
    igf: &mut FunctionEmitter,
    fn_type: &LoweredFunctionType,
    source: &MetadataSource,
    claimed: &mut impl Iterator<Item = InstId>,
    witness_metadata: Option<&WitnessMetadata>,
) {
    let program = cx.program;
    let signature = fn_type.generic_signature;
    match source.kind {
        // Bound when walking the parameters
        MetadataSourceKind::Metadata | MetadataSourceKind::ClassPointer => {}
        MetadataSourceKind::GenericLValueMetadata => {
            let param_ty = fn_type.params[source.expect_param_index() as usize].ty;
            let arg_ty = program.map_type_into_context(signature, param_ty);
            let Some(metadata) = claimed.next() else { panic!("missing lvalue metadata argument") };
            igf.b.set_name(metadata, program.display_type(arg_ty));
            igf.bind_local_type_data_from_type_metadata(cx, arg_ty, true, metadata, MetadataState::Complete);
        }
        MetadataSourceKind::SelfMetadata => {
            let Some(metadata) = witness_metadata.and_then(|w| w.self_metadata) else {
                panic!("no Self metadata for witness method")
            };
            let self_ty = fn_type.self_instance_type(program);
            let arg_ty = program.map_type_into_context(signature, self_ty);
            igf.b.set_name(metadata, program.display_type(arg_ty));
            // A subclass may be using an inherited conformance
            let is_exact = match program.class_of(self_ty) {
                Some(class) => program.nominal(class).is_final,
                None => true,
            };
            igf.bind_local_type_data_from_type_metadata(cx, arg_ty, is_exact, metadata, MetadataState::Complete);
        }
        MetadataSourceKind::SelfWitnessTable => {
            let Some(table) = witness_metadata.and_then(|w| w.self_witness_table) else {
                panic!("no Self witness table for witness method")
            };
            let conformance = fn_type.expect_witness_method_conformance();
            let self_ty = fn_type.self_instance_type(program);
            let arg_ty = program.map_type_into_context(signature, self_ty);
            igf.b.set_name(table, witness_table_name(cx, arg_ty, conformance));
            igf.set_unscoped_local_type_data(
                LocalTypeDataKey::witness_table(arg_ty, conformance),
                MetadataResponse::complete(table),
            );
            if let ConformanceRef::Concrete(concrete) = conformance {
                igf.bind_local_type_data_from_self_witness_table(cx, concrete, table);
            }
        }
    }
}

fn bind_parameter_sources(
    cx: &Session,
    igf: &mut FunctionEmitter,
    fn_type: &LoweredFunctionType,
    convention: &PolymorphicConvention,
    get_parameter: impl Fn(usize) -> InstId,
) {
    let self_index = fn_type.self_param_index();
    if let Some(self_index) = self_index {
        bind_parameter_source(cx, igf, fn_type, convention, self_index, &get_parameter);
    }
    for index in 0..fn_type.params.len() {
        if Some(index) != self_index {
            bind_parameter_source(cx, igf, fn_type, convention, index, &get_parameter);
        }
    }
}

fn bind_parameter_source(
    cx: &Session,
    igf: &mut FunctionEmitter,
    fn_type: &LoweredFunctionType,
    convention: &PolymorphicConvention,
    index: usize,
    get_parameter: &impl Fn(usize) -> InstId,
) {
    let param = &fn_type.params[index];
    if param.convention.is_indirect() {
        return;
    }
    let program = cx.program;
    let signature = fn_type.generic_signature;
    let param_ty = program.map_type_into_context(signature, param.ty);

    if let Some(metatype) = program.get_type(param_ty).as_metatype() {
        // ObjC metatypes would need a runtime conversion we don't model
        if metatype.repr == MetatypeRepr::Thick {
            let metadata = get_parameter(index);
            igf.bind_local_type_data_from_type_metadata(cx, metatype.instance, false, metadata, MetadataState::Complete);
        }
        return;
    }

    if let Some(source) = convention.class_pointer_source(index) {
        let source_ty = program.map_type_into_context(signature, source.ty);
        let instance = get_parameter(index);
        let metadata = igf.b.push_inst(Inst::DynamicTypeOf { instance });
        igf.b.set_name(metadata, program.display_type(source_ty));
        igf.bind_local_type_data_from_type_metadata(cx, source_ty, false, metadata, MetadataState::Complete);
    }
}

/// The substituted instance type of self. A direct metatype self belongs to a
/// static method.
pub fn subst_self_type(program: &Program, fn_type: &LoweredFunctionType, subs: &SubstitutionMap) -> TypeId {
    let Some(self_param) = fn_type.params.last() else {
        panic!("subst_self_type on a function with no parameters: {:?}", fn_type)
    };
    let mut ty = self_param.ty;
    if let Some(metatype) = program.get_type(ty).as_metatype() {
        if !self_param.convention.is_indirect() {
            ty = metatype.instance;
        }
    }
    program.subst_type(ty, subs)
}

/// The polymorphic arguments for a call of `fn_type` with `subs`, in the
/// order [`expand_polymorphic_signature`] describes. For a witness method,
/// the trailing Self values are stored into `witness_metadata` instead.
pub fn emit_polymorphic_arguments(
    cx: &mut Session,
    igf: &mut FunctionEmitter,
    fn_type: &LoweredFunctionType,
    subs: &SubstitutionMap,
    witness_metadata: Option<&mut WitnessMetadata>,
) -> Vec<InstId> {
    let convention = PolymorphicConvention::new(cx, fn_type);
    let program = cx.program;
    let mut out = Vec::new();

    for source in convention.sources() {
        if source.kind == MetadataSourceKind::GenericLValueMetadata {
            let self_ty = subst_self_type(program, fn_type, subs);
            out.push(igf.emit_type_metadata_ref(cx, self_ty, MetadataRequest::COMPLETE).value);
        }
    }

    let unfulfilled: Vec<GenericRequirement> = convention.enumerate_unfulfilled_requirements(program).collect();
    for requirement in unfulfilled {
        out.push(emit_generic_requirement_from_substitutions(cx, igf, requirement, subs));
    }

    let has_self_sources = convention
        .sources()
        .iter()
        .any(|s| matches!(s.kind, MetadataSourceKind::SelfMetadata | MetadataSourceKind::SelfWitnessTable));
    if has_self_sources {
        let Some(witness_metadata) = witness_metadata else {
            panic!("no witness metadata to fill for a witness method call")
        };
        let self_ty = subst_self_type(program, fn_type, subs);
        witness_metadata.self_metadata = Some(igf.emit_type_metadata_ref(cx, self_ty, MetadataRequest::COMPLETE).value);
        let interface_self = fn_type.self_instance_type(program);
        let conformance = program.subst_conformance(fn_type.expect_witness_method_conformance(), interface_self, subs);
        witness_metadata.self_witness_table = Some(emit_witness_table_ref(cx, igf, self_ty, conformance));
    }
    out
}

/// Binds what a class pointer parameter of `orig_fn` provides, once its value
/// arrives. `subst_fn` gives the parameter's type in the current context.
pub fn bind_polymorphic_parameter(
    cx: &Session,
    igf: &mut FunctionEmitter,
    orig_fn: &LoweredFunctionType,
    subst_fn: &LoweredFunctionType,
    value: InstId,
    index: usize,
) {
    let convention = PolymorphicConvention::new(cx, orig_fn);
    if !convention.is_class_pointer_source(index) {
        return;
    }
    let param_ty = subst_fn.params[index].ty;
    let metadata = igf.b.push_inst(Inst::DynamicTypeOf { instance: value });
    igf.b.set_name(metadata, cx.program.display_type(param_ty));
    igf.bind_local_type_data_from_type_metadata(cx, param_ty, false, metadata, MetadataState::Complete);
}
