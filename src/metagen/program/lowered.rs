// Copyright (c) 2025 knix
// All rights reserved.

use crate::program::types::TypeId;
use crate::program::{ConformanceRef, GenericSignatureId, Program};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParameterConvention {
    IndirectIn,
    IndirectInConstant,
    IndirectInGuaranteed,
    IndirectInout,
    IndirectInoutAliasable,
    DirectOwned,
    DirectUnowned,
    DirectGuaranteed,
}

impl ParameterConvention {
    pub fn is_indirect(&self) -> bool {
        match self {
            ParameterConvention::IndirectIn
            | ParameterConvention::IndirectInConstant
            | ParameterConvention::IndirectInGuaranteed
            | ParameterConvention::IndirectInout
            | ParameterConvention::IndirectInoutAliasable => true,
            ParameterConvention::DirectOwned
            | ParameterConvention::DirectUnowned
            | ParameterConvention::DirectGuaranteed => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterInfo {
    pub ty: TypeId,
    pub convention: ParameterConvention,
}

impl ParameterInfo {
    pub fn new(ty: TypeId, convention: ParameterConvention) -> ParameterInfo {
        ParameterInfo { ty, convention }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionRepresentation {
    Thick,
    Thin,
    Method,
    Closure,
    Block,
    CFunctionPointer,
    ObjCMethod,
    WitnessMethod,
}

/// A function type after lowering: explicit parameter conventions, with `self`
/// (when present) as the last parameter.
#[derive(Debug, Clone)]
pub struct LoweredFunctionType {
    pub representation: FunctionRepresentation,
    pub generic_signature: Option<GenericSignatureId>,
    pub params: Vec<ParameterInfo>,
    pub has_self_param: bool,
    pub is_pseudogeneric: bool,
    pub witness_method_conformance: Option<ConformanceRef>,
}

impl LoweredFunctionType {
    pub fn new(
        representation: FunctionRepresentation,
        generic_signature: Option<GenericSignatureId>,
        params: Vec<ParameterInfo>,
    ) -> LoweredFunctionType {
        LoweredFunctionType {
            representation,
            generic_signature,
            params,
            has_self_param: false,
            is_pseudogeneric: false,
            witness_method_conformance: None,
        }
    }

    pub fn with_self_param(mut self) -> Self {
        assert!(!self.params.is_empty(), "self parameter requested for a function with no parameters");
        self.has_self_param = true;
        self
    }

    pub fn with_pseudogeneric(mut self) -> Self {
        self.is_pseudogeneric = true;
        self
    }

    pub fn with_witness_method_conformance(mut self, conformance: ConformanceRef) -> Self {
        self.witness_method_conformance = Some(conformance);
        self
    }

    pub fn is_polymorphic(&self) -> bool {
        self.generic_signature.is_some()
    }

    #[track_caller]
    pub fn self_param_index(&self) -> Option<usize> {
        if !self.has_self_param {
            return None;
        }
        match self.params.len().checked_sub(1) {
            None => panic!("self_param_index called on a function with no parameters: {:?}", self),
            Some(index) => Some(index),
        }
    }

    pub fn self_parameter(&self) -> Option<&ParameterInfo> {
        self.self_param_index().map(|i| &self.params[i])
    }

    /// The instance type of `self`; static methods take their metatype.
    #[track_caller]
    pub fn self_instance_type(&self, program: &Program) -> TypeId {
        let Some(self_param) = self.self_parameter() else {
            panic!("self_instance_type called on a function without a self parameter: {:?}", self)
        };
        match program.get_type(self_param.ty).as_metatype() {
            Some(metatype) => metatype.instance,
            None => self_param.ty,
        }
    }

    #[track_caller]
    pub fn expect_witness_method_conformance(&self) -> ConformanceRef {
        match self.witness_method_conformance {
            Some(c) => c,
            None => panic!("expect_witness_method_conformance called on: {:?}", self),
        }
    }
}
