// Copyright (c) 2025 knix
// All rights reserved.

//! Generic requirements captured into, and restored from, pointer-sized
//! buffers: closure contexts, partial applications, and the generic argument
//! area of nominal type metadata.

use fxhash::FxHashSet;

use crate::conformance::{emit_witness_table_ref_cached, witness_table_name};
use crate::convention::{MetadataSourceKind, PolymorphicConvention, has_polymorphic_parameters, subst_self_type};
use crate::ir::{Inst, InstId, MetadataRequest, MetadataState};
use crate::local_type_data::{FunctionEmitter, LocalTypeDataKey, MetadataResponse};
use crate::program::lowered::{FunctionRepresentation, LoweredFunctionType};
use crate::program::types::{Type, TypeId};
use crate::program::{ConformanceRef, NominalId, Program, SubstitutionMap};
use crate::requirements::GenericRequirement;
use crate::session::Session;


/// The archetype metadata and abstract witness tables a piece of code needs
/// from its enclosing context, in first-recorded order.
#[derive(Debug, Clone, Default)]
pub struct NecessaryBindings {
    requirements: Vec<GenericRequirement>,
    seen: FxHashSet<GenericRequirement>,
}

impl NecessaryBindings {
    pub fn new() -> NecessaryBindings {
        NecessaryBindings::default()
    }

    /// What a call of `fn_type` with `subs` needs passed: its unfulfilled
    /// requirements, plus Self metadata when self travels as an extra source.
    pub fn for_function_invocations(
        cx: &Session,
        fn_type: &LoweredFunctionType,
        subs: &SubstitutionMap,
    ) -> NecessaryBindings {
        let mut bindings = NecessaryBindings::new();
        if !has_polymorphic_parameters(fn_type) {
            return bindings;
        }
        let program = cx.program;
        let convention = PolymorphicConvention::new(cx, fn_type);
        for requirement in convention.enumerate_unfulfilled_requirements(program) {
            let ty = program.subst_type(requirement.type_parameter, subs);
            match requirement.protocol {
                None => bindings.add_type_metadata(program, ty),
                Some(protocol) => {
                    let Some(conformance) =
                        program.lookup_conformance_in_map(subs, requirement.type_parameter, protocol)
                    else {
                        panic!("{} does not satisfy {}", program.display_type(ty), requirement)
                    };
                    bindings.add_conformance(program, ty, conformance);
                }
            }
        }
        for source in convention.sources() {
            match source.kind {
                MetadataSourceKind::Metadata | MetadataSourceKind::ClassPointer => {}
                MetadataSourceKind::GenericLValueMetadata | MetadataSourceKind::SelfMetadata => {
                    bindings.add_type_metadata(program, subst_self_type(program, fn_type, subs));
                }
                // Passed as undef when the callee is reached this way
                MetadataSourceKind::SelfWitnessTable => {}
            }
        }
        bindings
    }

    pub fn requirements(&self) -> &[GenericRequirement] {
        &self.requirements
    }

    pub fn len(&self) -> usize {
        self.requirements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    fn insert(&mut self, requirement: GenericRequirement) {
        if self.seen.insert(requirement) {
            self.requirements.push(requirement);
        }
    }

    /// Records the need for `ty`'s metadata. Structural types are broken down
    /// into their elements; only archetype-dependent leaves are recorded.
    pub fn add_type_metadata(&mut self, program: &Program, ty: TypeId) {
        if !program.has_archetype(ty) {
            return;
        }
        match program.get_type(ty) {
            Type::Tuple(elements) => {
                for element in elements {
                    self.add_type_metadata(program, element);
                }
            }
            Type::Function(function) => {
                for param in function.params.iter() {
                    self.add_type_metadata(program, *param);
                }
                self.add_type_metadata(program, function.result);
            }
            Type::Metatype(metatype) => self.add_type_metadata(program, metatype.instance),
            _ => self.insert(GenericRequirement::metadata(ty)),
        }
    }

    /// Concrete conformances need nothing; the table is known statically.
    pub fn add_conformance(&mut self, program: &Program, ty: TypeId, conformance: ConformanceRef) {
        let ConformanceRef::Abstract(protocol) = conformance else { return };
        assert!(program.is_archetype(ty), "abstract conformance of non-archetype {}", program.display_type(ty));
        self.insert(GenericRequirement::witness_table(ty, protocol));
    }

    pub fn buffer_size(&self, pointer_size: u32) -> u32 {
        pointer_size * self.requirements.len() as u32
    }

    /// A stack buffer with one slot per requirement.
    pub fn alloca_buffer(&self, igf: &mut FunctionEmitter) -> InstId {
        let buffer = igf.b.push_inst(Inst::BufferAlloca { words: self.requirements.len() as u32 });
        igf.b.set_name(buffer, "bindings");
        buffer
    }

    /// Stores each requirement's current value into its slot of `buffer`.
    pub fn save(&self, cx: &mut Session, igf: &mut FunctionEmitter, buffer: InstId) {
        emit_init_of_generic_requirements_buffer(cx, igf, &self.requirements, buffer, |cx, igf, requirement| {
            match requirement.protocol {
                Some(protocol) => igf.emit_archetype_witness_table_ref(cx, requirement.type_parameter, protocol),
                None => igf.emit_type_metadata_ref(cx, requirement.type_parameter, MetadataRequest::COMPLETE).value,
            }
        });
    }

    /// Reads every slot of `buffer` back and binds it as local type data.
    pub fn restore(&self, cx: &Session, igf: &mut FunctionEmitter, buffer: InstId, state: MetadataState) {
        bind_from_generic_requirements_buffer(cx, igf, &self.requirements, buffer, state, |ty| ty);
    }
}

/// The requirements a nominal type's metadata stores for its generic
/// arguments: exactly what a function generic over the type's signature with
/// no parameters would have to be passed.
#[derive(Debug, Clone)]
pub struct GenericTypeRequirements {
    nominal: NominalId,
    requirements: Vec<GenericRequirement>,
}

impl GenericTypeRequirements {
    pub fn new(cx: &Session, nominal: NominalId) -> GenericTypeRequirements {
        let program = cx.program;
        let Some(signature) = program.nominal(nominal).generic_signature else {
            return GenericTypeRequirements { nominal, requirements: Vec::new() };
        };
        if !program.signature(signature).params.iter().any(|p| p.is_canonical) {
            return GenericTypeRequirements { nominal, requirements: Vec::new() };
        }
        let representative = LoweredFunctionType::new(FunctionRepresentation::Thin, Some(signature), Vec::new());
        let convention = PolymorphicConvention::new(cx, &representative);
        let requirements = convention.enumerate_unfulfilled_requirements(program).collect();
        GenericTypeRequirements { nominal, requirements }
    }

    pub fn nominal(&self) -> NominalId {
        self.nominal
    }

    pub fn requirements(&self) -> &[GenericRequirement] {
        &self.requirements
    }

    pub fn len(&self) -> usize {
        self.requirements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    /// Calls `callback` with each requirement's index, its substituted type,
    /// and for table requirements the conformance that satisfies it.
    pub fn enumerate_fulfillments(
        &self,
        program: &Program,
        subs: &SubstitutionMap,
        mut callback: impl FnMut(usize, TypeId, Option<ConformanceRef>),
    ) {
        for (index, requirement) in self.requirements.iter().enumerate() {
            let ty = program.subst_type(requirement.type_parameter, subs);
            let conformance = requirement.protocol.map(|protocol| {
                match program.lookup_conformance_in_map(subs, requirement.type_parameter, protocol) {
                    Some(c) => c,
                    None => panic!("{} does not satisfy {}", program.display_type(ty), requirement),
                }
            });
            callback(index, ty, conformance);
        }
    }

    /// Fills `buffer` with the generic arguments `subs` gives the type.
    pub fn emit_init_of_buffer(
        &self,
        cx: &mut Session,
        igf: &mut FunctionEmitter,
        subs: &SubstitutionMap,
        buffer: InstId,
    ) {
        emit_init_of_generic_requirements_buffer(cx, igf, &self.requirements, buffer, |cx, igf, requirement| {
            emit_generic_requirement_from_substitutions(cx, igf, requirement, subs)
        });
    }

    /// Binds the type's archetypes from a buffer laid out by
    /// [`GenericTypeRequirements::emit_init_of_buffer`].
    pub fn bind_from_buffer(&self, cx: &Session, igf: &mut FunctionEmitter, buffer: InstId, state: MetadataState) {
        let program = cx.program;
        let signature = program.nominal(self.nominal).generic_signature;
        bind_from_generic_requirements_buffer(cx, igf, &self.requirements, buffer, state, |ty| {
            program.map_type_into_context(signature, ty)
        });
    }
}

pub fn emit_init_of_generic_requirements_buffer(
    cx: &mut Session,
    igf: &mut FunctionEmitter,
    requirements: &[GenericRequirement],
    buffer: InstId,
    mut emit_requirement: impl FnMut(&mut Session, &mut FunctionEmitter, GenericRequirement) -> InstId,
) {
    for (index, requirement) in requirements.iter().enumerate() {
        let value = emit_requirement(cx, igf, *requirement);
        igf.b.push_inst(Inst::BufferStore { buffer, index: index as u32, value });
    }
}

pub fn bind_from_generic_requirements_buffer(
    cx: &Session,
    igf: &mut FunctionEmitter,
    requirements: &[GenericRequirement],
    buffer: InstId,
    state: MetadataState,
    get_in_context: impl Fn(TypeId) -> TypeId,
) {
    for (index, requirement) in requirements.iter().enumerate() {
        let value = igf.b.push_inst(Inst::BufferLoad { buffer, index: index as u32, ty: requirement.ir_type() });
        bind_generic_requirement(cx, igf, *requirement, value, state, &get_in_context);
    }
}

/// Makes `value` the local source for `requirement`, with its type parameter
/// mapped into the function's context.
pub fn bind_generic_requirement(
    cx: &Session,
    igf: &mut FunctionEmitter,
    requirement: GenericRequirement,
    value: InstId,
    state: MetadataState,
    get_in_context: impl Fn(TypeId) -> TypeId,
) {
    let program = cx.program;
    let ty = get_in_context(requirement.type_parameter);
    match requirement.protocol {
        Some(protocol) => {
            assert!(program.is_archetype(ty), "witness table bound for non-archetype {}", program.display_type(ty));
            let conformance = ConformanceRef::Abstract(protocol);
            igf.b.set_name(value, witness_table_name(cx, ty, conformance));
            igf.set_unscoped_local_type_data(
                LocalTypeDataKey::witness_table(ty, conformance),
                MetadataResponse::complete(value),
            );
        }
        None => {
            igf.b.set_name(value, program.display_type(ty));
            igf.bind_local_type_data_from_type_metadata(cx, ty, true, value, state);
        }
    }
}

/// The value `subs` supplies for `requirement`: the substituted type's
/// metadata, or the table of its conformance.
pub fn emit_generic_requirement_from_substitutions(
    cx: &mut Session,
    igf: &mut FunctionEmitter,
    requirement: GenericRequirement,
    subs: &SubstitutionMap,
) -> InstId {
    let program = cx.program;
    let arg_ty = program.subst_type(requirement.type_parameter, subs);
    let Some(protocol) = requirement.protocol else {
        return igf.emit_type_metadata_ref(cx, arg_ty, MetadataRequest::COMPLETE).value;
    };
    let Some(conformance) = program.lookup_conformance_in_map(subs, requirement.type_parameter, protocol) else {
        panic!("{} does not satisfy {}", program.display_type(arg_ty), requirement)
    };
    assert_eq!(conformance.protocol(program), protocol, "conformance found for the wrong protocol");
    let mut metadata_cache = None;
    emit_witness_table_ref_cached(cx, igf, arg_ty, &mut metadata_cache, conformance)
}

/// Binds a nominal type's generic context from its stored generic arguments.
pub fn emit_polymorphic_parameters_from_array(
    cx: &Session,
    igf: &mut FunctionEmitter,
    nominal: NominalId,
    array: InstId,
    state: MetadataState,
) {
    GenericTypeRequirements::new(cx, nominal).bind_from_buffer(cx, igf, array, state);
}
