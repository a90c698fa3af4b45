// Copyright (c) 2025 knix
// All rights reserved.

//! Small programs shared by the unit tests.

use crate::config::{GenConfig, Target};
use crate::program::types::{BuiltinType, TypeId};
use crate::program::{
    AssocTypeId, ConformanceId, GenericSignatureId, MethodId, ModuleId, NominalId, NormalConformance, Program,
    ProtocolId, Requirement,
};
use crate::session::Session;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub struct TestProgram {
    pub program: Program,
    pub module: ModuleId,
    pub other_module: ModuleId,
}

impl TestProgram {
    pub fn new() -> TestProgram {
        init_logging();
        let mut program = Program::new();
        let module = program.add_module("Main");
        let other_module = program.add_module("Library");
        TestProgram { program, module, other_module }
    }

    /// `τ_0_i`
    pub fn param(&self, index: u32) -> TypeId {
        self.program.generic_param(0, index)
    }

    pub fn int(&self) -> TypeId {
        self.program.builtin(BuiltinType::Int)
    }

    pub fn protocol(&mut self, name: &str, methods: &[&str]) -> (ProtocolId, Vec<MethodId>) {
        let protocol = self.program.add_protocol(name, self.module);
        let methods = methods.iter().map(|m| self.program.add_method(protocol, m)).collect();
        (protocol, methods)
    }

    pub fn marker_protocol(&mut self, name: &str) -> ProtocolId {
        let protocol = self.program.add_protocol(name, self.module);
        self.program.protocol_mut(protocol).requires_witness_table = false;
        protocol
    }

    /// `protocol name { associatedtype assoc }`
    pub fn protocol_with_assoc(&mut self, name: &str, assoc: &str) -> (ProtocolId, AssocTypeId) {
        let protocol = self.program.add_protocol(name, self.module);
        let assoc = self.program.add_assoc_type(protocol, assoc);
        (protocol, assoc)
    }

    pub fn signature(&mut self, params: u32, requirements: Vec<Requirement>) -> GenericSignatureId {
        let params: Vec<TypeId> = (0..params).map(|i| self.param(i)).collect();
        self.program.add_signature(&params, requirements)
    }

    pub fn conforms(&self, subject: TypeId, protocol: ProtocolId) -> Requirement {
        Requirement::Conformance { subject, protocol }
    }

    /// A struct with one generic parameter per entry of `requirements`' signature.
    pub fn generic_struct(&mut self, name: &str, params: u32, requirements: Vec<Requirement>) -> NominalId {
        let signature = self.signature(params, requirements);
        self.program.add_struct(name, self.module, Some(signature))
    }

    pub fn plain_struct(&mut self, name: &str) -> (NominalId, TypeId) {
        let decl = self.program.add_struct(name, self.module, None);
        (decl, self.program.nominal_type(decl, &[]))
    }

    /// A non-generic conformance in the main module with the given method witnesses.
    pub fn conformance(
        &mut self,
        ty: TypeId,
        protocol: ProtocolId,
        configure: impl FnOnce(&mut NormalConformance),
    ) -> ConformanceId {
        let mut normal = NormalConformance::new(self.module);
        configure(&mut normal);
        self.program.add_conformance(ty, protocol, normal)
    }

    pub fn config(&self) -> GenConfig {
        GenConfig::for_target(Target::LinuxIntel64)
    }

    pub fn session(&self) -> Session<'_> {
        match Session::new(&self.program, self.config(), self.module) {
            Ok(session) => session,
            Err(e) => panic!("failed to create test session: {e}"),
        }
    }

    pub fn session_with(&self, config: GenConfig) -> Session<'_> {
        match Session::new(&self.program, config, self.module) {
            Ok(session) => session,
            Err(e) => panic!("failed to create test session: {e}"),
        }
    }
}
