// Copyright (c) 2025 knix
// All rights reserved.

use std::sync::Arc;

use ahash::HashMapExt;
use anyhow::{Result, bail};
use fxhash::FxHashMap;
use log::debug;

use crate::config::GenConfig;
use crate::ir::IrModule;
use crate::layout::{ProtocolInfo, ProtocolInfoCache, ProtocolInfoKind};
use crate::program::{ConformanceId, ModuleId, Program, ProtocolId};
use crate::witness_table::ConformanceDescription;

/// State for generating code into one module. Caches live here and are
/// dropped with the session, except protocol layouts, which may be shared.
pub struct Session<'p> {
    pub program: &'p Program,
    pub config: GenConfig,
    pub current_module: ModuleId,
    protocol_infos: Arc<ProtocolInfoCache>,
    /// Root conformance to whether it is reached through an accessor.
    pub(crate) conformance_strategies: FxHashMap<ConformanceId, bool>,
    pub descriptions: Vec<ConformanceDescription>,
    pub module: IrModule,
}

impl<'p> Session<'p> {
    pub fn new(program: &'p Program, config: GenConfig, current_module: ModuleId) -> Result<Session<'p>> {
        Session::with_protocol_infos(program, config, current_module, Arc::new(ProtocolInfoCache::new()))
    }

    /// A session that shares protocol layouts with other sessions over the
    /// same program.
    pub fn with_protocol_infos(
        program: &'p Program,
        config: GenConfig,
        current_module: ModuleId,
        protocol_infos: Arc<ProtocolInfoCache>,
    ) -> Result<Session<'p>> {
        config.validate()?;
        if !program.has_module(current_module) {
            bail!("module {} is not part of the program", current_module);
        }
        debug!(
            "session for module {} ({:?}, {}-byte pointers)",
            program.name(program.module(current_module).name),
            config.target,
            config.pointer_size()
        );
        Ok(Session {
            program,
            config,
            current_module,
            protocol_infos,
            conformance_strategies: FxHashMap::new(),
            descriptions: Vec::new(),
            module: IrModule::new(),
        })
    }

    pub fn protocol_infos(&self) -> &Arc<ProtocolInfoCache> {
        &self.protocol_infos
    }

    /// Whether this module must treat `protocol`'s layout as opaque beyond its
    /// inherited protocols.
    pub fn is_resilient_protocol(&self, protocol: ProtocolId) -> bool {
        let decl = self.program.protocol(protocol);
        decl.is_resilient && decl.module != self.current_module
    }

    #[track_caller]
    pub fn protocol_info(&self, protocol: ProtocolId, kind: ProtocolInfoKind) -> Arc<ProtocolInfo> {
        assert!(
            kind == ProtocolInfoKind::RequirementSignature || !self.is_resilient_protocol(protocol),
            "full layout requested for resilient protocol {}",
            self.program.name(self.program.protocol(protocol).name)
        );
        self.protocol_infos.get(self.program, protocol, kind)
    }

    pub fn pointer_size(&self) -> u32 {
        self.config.pointer_size()
    }

    /// Consumes the session, yielding everything it emitted.
    pub fn finish(self) -> (IrModule, Vec<ConformanceDescription>) {
        (self.module, self.descriptions)
    }
}
