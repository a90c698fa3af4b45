// Copyright (c) 2025 knix
// All rights reserved.
//
// The emission backend this layer produces into: a small instruction-based IR
// with basic blocks for the accessor functions it generates, and constant
// records for witness tables and conformance descriptors. It carries just
// enough structure to be inspected by tests and printed for debugging.

use std::fmt::{Display, Formatter, Write};

use ahash::HashMapExt;
use ecow::EcoString;
use fxhash::FxHashMap;

use crate::SV4;
use crate::program::types::TypeId;
use crate::program::{
    AssocTypeId, AssociatedConformance, ConformanceId, FunctionId, MethodId, ModuleId, NominalId,
    Program, ProtocolId,
};
use crate::witness_table::ConformanceDescriptor;

pub type InstId = u32;
pub type BlockId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IrType {
    TypeMetadataPtr,
    WitnessTablePtr,
    WitnessTablePtrPtr,
    Int8Ptr,
    IntPtr,
    Bool,
    Void,
}

/// How complete a type metadata record is known to be. Ordered from least to
/// most complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MetadataState {
    Abstract,
    LayoutComplete,
    NonTransitiveComplete,
    Complete,
}

impl MetadataState {
    pub fn is_at_least(self, other: MetadataState) -> bool {
        self >= other
    }

    /// Generic arguments of complete metadata are complete; beyond that nothing
    /// is known about them.
    pub fn presumed_for_type_argument(self) -> MetadataState {
        match self {
            MetadataState::Complete => MetadataState::Complete,
            _ => MetadataState::Abstract,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MetadataRequest {
    pub state: MetadataState,
    pub is_blocking: bool,
}

impl MetadataRequest {
    pub const COMPLETE: MetadataRequest = MetadataRequest { state: MetadataState::Complete, is_blocking: true };
    pub const ABSTRACT: MetadataRequest = MetadataRequest { state: MetadataState::Abstract, is_blocking: true };

    pub fn new(state: MetadataState) -> MetadataRequest {
        MetadataRequest { state, is_blocking: true }
    }

    pub fn is_satisfied_by(&self, state: MetadataState) -> bool {
        state.is_at_least(self.state)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AtomicOrdering {
    Acquire,
    Release,
}

/// Functions provided by the language runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeFn {
    /// `(conformance descriptor, type metadata, conditional tables) -> wtable`
    GetWitnessTable,
    /// `(request, wtable, parent metadata, requirements base, assoc type descriptor) -> metadata`
    GetAssociatedTypeWitness,
    /// `(wtable, parent metadata, assoc metadata, requirements base, assoc conformance descriptor) -> wtable`
    GetAssociatedConformanceWitness,
    /// `(request, metadata) -> metadata`
    CheckMetadataState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Callee {
    Runtime(RuntimeFn),
    Direct(Symbol),
}

/// A link-level entity. Every global and generated function is named by one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Symbol {
    Function(FunctionId),
    DeletedMethodError,
    ProtocolDescriptor(ProtocolId),
    ProtocolRequirementsBaseDescriptor(ProtocolId),
    MethodDescriptor(MethodId),
    AssociatedTypeDescriptor(AssocTypeId),
    AssociatedConformanceDescriptor(AssociatedConformance),
    BaseConformanceDescriptor { protocol: ProtocolId, base: ProtocolId },
    ModuleContextDescriptor(ModuleId),
    NominalTypeDescriptor(NominalId),
    /// `(request, generic arguments...) -> metadata`
    TypeMetadataAccessor(NominalId),
    ProtocolWitnessTable(ConformanceId),
    ProtocolWitnessTablePattern(ConformanceId),
    ProtocolConformanceDescriptor(ConformanceId),
    GenericWitnessTableInstantiation(ConformanceId),
    GenericWitnessTablePrivateData(ConformanceId),
    AssociatedConformanceAccessor { conformance: ConformanceId, requirement: AssociatedConformance },
    WitnessTableLazyAccessor { conformance: ConformanceId, ty: TypeId },
    WitnessTableLazyCache { conformance: ConformanceId, ty: TypeId },
}

impl Display for Symbol {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Symbol::Function(id) => write!(f, "fn{}", id),
            Symbol::DeletedMethodError => write!(f, "deleted_method_error"),
            Symbol::ProtocolDescriptor(p) => write!(f, "p{}Mp", p),
            Symbol::ProtocolRequirementsBaseDescriptor(p) => write!(f, "p{}TL", p),
            Symbol::MethodDescriptor(m) => write!(f, "m{}Tq", m),
            Symbol::AssociatedTypeDescriptor(a) => write!(f, "a{}Tl", a),
            Symbol::AssociatedConformanceDescriptor(ac) => {
                write!(f, "p{}_t{}_p{}Tn", ac.source_protocol, ac.association, ac.requirement)
            }
            Symbol::BaseConformanceDescriptor { protocol, base } => write!(f, "p{}_p{}Tb", protocol, base),
            Symbol::ModuleContextDescriptor(m) => write!(f, "mod{}MXM", m),
            Symbol::NominalTypeDescriptor(n) => write!(f, "n{}Mn", n),
            Symbol::TypeMetadataAccessor(n) => write!(f, "n{}Ma", n),
            Symbol::ProtocolWitnessTable(c) => write!(f, "c{}WP", c),
            Symbol::ProtocolWitnessTablePattern(c) => write!(f, "c{}Wp", c),
            Symbol::ProtocolConformanceDescriptor(c) => write!(f, "c{}Mc", c),
            Symbol::GenericWitnessTableInstantiation(c) => write!(f, "c{}WI", c),
            Symbol::GenericWitnessTablePrivateData(c) => write!(f, "c{}WG", c),
            Symbol::AssociatedConformanceAccessor { conformance, requirement } => write!(
                f,
                "c{}_t{}_p{}WT",
                conformance, requirement.association, requirement.requirement
            ),
            Symbol::WitnessTableLazyAccessor { conformance, ty } => write!(f, "c{}_t{}Wl", conformance, ty),
            Symbol::WitnessTableLazyCache { conformance, ty } => write!(f, "c{}_t{}WL", conformance, ty),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inst {
    Param { index: u32, ty: IrType },
    GlobalAddr(Symbol),
    Undef(IrType),
    /// A metadata request passed to the runtime.
    Request(MetadataRequest),
    /// Metadata for a type with no cheaper local source.
    TypeMetadataRef { ty: TypeId, request: MetadataRequest },
    /// Generic argument `index` of a nominal type's metadata.
    NominalTypeArgument { metadata: InstId, nominal: NominalId, index: u32 },
    NominalTypeArgumentWitnessTable { metadata: InstId, nominal: NominalId, index: u32 },
    /// Load a word from a witness table; negative offsets reach private data.
    LoadWitness { table: InstId, offset: i32 },
    StoreWitness { table: InstId, offset: i32, value: InstId },
    DynamicTypeOf { instance: InstId },
    Call { callee: Callee, args: SV4<InstId>, ret: IrType },

    BufferAlloca { words: u32 },
    BufferLoad { buffer: InstId, index: u32, ty: IrType },
    BufferStore { buffer: InstId, index: u32, value: InstId },
    LoadGlobal { global: Symbol, ordering: AtomicOrdering },
    StoreGlobal { global: Symbol, value: InstId, ordering: AtomicOrdering },
    IsNull(InstId),

    // Control flow
    Jump(BlockId),
    JumpIf { cond: InstId, cons: BlockId, alt: BlockId },
    // goto considered harmful, but come-from is friend (phi node)
    ComeFrom { incomings: SV4<(BlockId, InstId)> },
    Ret(Option<InstId>),
}

#[derive(Debug, Clone, Default)]
pub struct Block {
    pub instrs: Vec<InstId>,
}

#[derive(Debug, Clone)]
pub struct IrFunction {
    pub symbol: Symbol,
    pub params: Vec<IrType>,
    pub ret: IrType,
    pub instrs: Vec<Inst>,
    pub blocks: Vec<Block>,
    pub value_names: FxHashMap<InstId, EcoString>,
    pub no_inline: bool,
}

impl IrFunction {
    pub fn get_block(&self, id: BlockId) -> &Block {
        &self.blocks[id as usize]
    }

    pub fn get_inst(&self, id: InstId) -> &Inst {
        &self.instrs[id as usize]
    }

    pub fn value_name(&self, id: InstId) -> Option<&str> {
        self.value_names.get(&id).map(|n| n.as_str())
    }

    pub fn calls(&self) -> impl Iterator<Item = (&Callee, &SV4<InstId>)> {
        self.instrs.iter().filter_map(|i| match i {
            Inst::Call { callee, args, .. } => Some((callee, args)),
            _ => None,
        })
    }
}

pub struct FunctionBuilder {
    func: IrFunction,
    cur_block: BlockId,
    enable_value_names: bool,
}

impl FunctionBuilder {
    pub fn new(symbol: Symbol, params: Vec<IrType>, ret: IrType, enable_value_names: bool) -> FunctionBuilder {
        let mut func = IrFunction {
            symbol,
            params,
            ret,
            instrs: Vec::new(),
            blocks: vec![Block::default()],
            value_names: FxHashMap::new(),
            no_inline: false,
        };
        let param_types = func.params.clone();
        for (index, ty) in param_types.into_iter().enumerate() {
            func.instrs.push(Inst::Param { index: index as u32, ty });
            func.blocks[0].instrs.push(index as InstId);
        }
        FunctionBuilder { func, cur_block: 0, enable_value_names }
    }

    pub fn symbol(&self) -> Symbol {
        self.func.symbol
    }

    pub fn param(&self, index: usize) -> InstId {
        debug_assert!(index < self.func.params.len());
        index as InstId
    }

    pub fn param_count(&self) -> usize {
        self.func.params.len()
    }

    pub fn set_no_inline(&mut self) {
        self.func.no_inline = true;
    }

    pub fn push_inst_to(&mut self, block: BlockId, inst: Inst) -> InstId {
        let id = self.func.instrs.len() as InstId;
        self.func.instrs.push(inst);
        self.func.blocks[block as usize].instrs.push(id);
        id
    }

    pub fn push_inst(&mut self, inst: Inst) -> InstId {
        self.push_inst_to(self.cur_block, inst)
    }

    pub fn push_block(&mut self) -> BlockId {
        let id = self.func.blocks.len() as BlockId;
        self.func.blocks.push(Block::default());
        id
    }

    pub fn cur_block(&self) -> BlockId {
        self.cur_block
    }

    #[track_caller]
    pub fn goto_block(&mut self, block_id: BlockId) {
        match self.func.blocks.get(block_id as usize) {
            None => panic!("goto_block on non-existent block: {}", block_id),
            Some(_) => self.cur_block = block_id,
        }
    }

    pub fn get_inst(&self, id: InstId) -> &Inst {
        self.func.get_inst(id)
    }

    pub fn get_inst_mut(&mut self, id: InstId) -> &mut Inst {
        &mut self.func.instrs[id as usize]
    }

    /// Names a value unless names are disabled or it already has one.
    pub fn set_name(&mut self, id: InstId, name: impl Into<EcoString>) {
        if !self.enable_value_names {
            return;
        }
        self.func.value_names.entry(id).or_insert_with(|| name.into());
    }

    pub fn global_addr(&mut self, symbol: Symbol) -> InstId {
        self.push_inst(Inst::GlobalAddr(symbol))
    }

    pub fn call(&mut self, callee: Callee, args: SV4<InstId>, ret: IrType) -> InstId {
        self.push_inst(Inst::Call { callee, args, ret })
    }

    pub fn ret(&mut self, value: Option<InstId>) -> InstId {
        self.push_inst(Inst::Ret(value))
    }

    pub fn finish(self) -> IrFunction {
        self.func
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linkage {
    Public,
    Hidden,
    Internal,
}

/// One pointer-sized word of a constant table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WitnessValue {
    Address(Symbol),
    /// A reference to a mangled type name, tagged in the low bit.
    MangledTypeName(TypeId),
    Null,
}

impl WitnessValue {
    pub fn as_symbol(&self) -> Option<Symbol> {
        match self {
            WitnessValue::Address(s) => Some(*s),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum GlobalInit {
    Zeroed { words: u32 },
    /// Pointer-sized slots; slot 0 of a witness table is its descriptor.
    Table(Vec<WitnessValue>),
    ConformanceDescriptor(ConformanceDescriptor),
}

#[derive(Debug, Clone)]
pub struct IrGlobal {
    pub symbol: Symbol,
    pub init: GlobalInit,
    pub is_constant: bool,
    pub linkage: Linkage,
}

impl IrGlobal {
    #[track_caller]
    pub fn expect_table(&self) -> &[WitnessValue] {
        match &self.init {
            GlobalInit::Table(t) => t,
            _ => panic!("expect_table called on: {:?}", self),
        }
    }

    #[track_caller]
    pub fn expect_descriptor(&self) -> &ConformanceDescriptor {
        match &self.init {
            GlobalInit::ConformanceDescriptor(d) => d,
            _ => panic!("expect_descriptor called on: {:?}", self),
        }
    }
}

/// Everything emitted for one compilation unit.
#[derive(Default)]
pub struct IrModule {
    pub functions: Vec<IrFunction>,
    function_index: FxHashMap<Symbol, usize>,
    pub globals: Vec<IrGlobal>,
    global_index: FxHashMap<Symbol, usize>,
}

impl IrModule {
    pub fn new() -> IrModule {
        IrModule::default()
    }

    pub fn has_function(&self, symbol: Symbol) -> bool {
        self.function_index.contains_key(&symbol)
    }

    pub fn function(&self, symbol: Symbol) -> Option<&IrFunction> {
        self.function_index.get(&symbol).map(|i| &self.functions[*i])
    }

    #[track_caller]
    pub fn add_function(&mut self, function: IrFunction) {
        let symbol = function.symbol;
        if self.function_index.insert(symbol, self.functions.len()).is_some() {
            panic!("function {} defined twice", symbol);
        }
        self.functions.push(function);
    }

    pub fn has_global(&self, symbol: Symbol) -> bool {
        self.global_index.contains_key(&symbol)
    }

    pub fn global(&self, symbol: Symbol) -> Option<&IrGlobal> {
        self.global_index.get(&symbol).map(|i| &self.globals[*i])
    }

    #[track_caller]
    pub fn add_global(&mut self, global: IrGlobal) {
        let symbol = global.symbol;
        if self.global_index.insert(symbol, self.globals.len()).is_some() {
            panic!("global {} defined twice", symbol);
        }
        self.globals.push(global);
    }

    pub fn get_or_add_global(&mut self, symbol: Symbol, make: impl FnOnce() -> IrGlobal) -> &IrGlobal {
        let index = match self.global_index.get(&symbol) {
            Some(i) => *i,
            None => {
                let global = make();
                debug_assert_eq!(global.symbol, symbol);
                self.global_index.insert(symbol, self.globals.len());
                self.globals.push(global);
                self.globals.len() - 1
            }
        };
        &self.globals[index]
    }
}

////////////////////////////// Display //////////////////////////////

pub fn display_function(w: &mut impl Write, program: &Program, function: &IrFunction) -> std::fmt::Result {
    write!(w, "fn {}(", function.symbol)?;
    for (i, p) in function.params.iter().enumerate() {
        if i > 0 {
            w.write_str(", ")?;
        }
        write!(w, "{:?}", p)?;
    }
    writeln!(w, ") -> {:?}{}", function.ret, if function.no_inline { " noinline" } else { "" })?;
    for index in 0..function.blocks.len() {
        display_block(w, program, function, index as BlockId)?;
    }
    Ok(())
}

pub fn display_block(
    w: &mut impl Write,
    program: &Program,
    function: &IrFunction,
    block_id: BlockId,
) -> std::fmt::Result {
    let block = function.get_block(block_id);
    writeln!(w, "B{}", block_id)?;
    for inst_id in block.instrs.iter() {
        write!(w, "  v{}", *inst_id)?;
        if let Some(name) = function.value_name(*inst_id) {
            write!(w, " %{}", name)?;
        }
        w.write_str(" = ")?;
        display_inst(w, program, function.get_inst(*inst_id))?;
        writeln!(w)?;
    }
    Ok(())
}

pub fn display_inst(w: &mut impl Write, program: &Program, inst: &Inst) -> std::fmt::Result {
    match inst {
        Inst::Param { index, ty } => write!(w, "param {} {:?}", index, ty),
        Inst::GlobalAddr(symbol) => write!(w, "global {}", symbol),
        Inst::Undef(ty) => write!(w, "undef {:?}", ty),
        Inst::Request(request) => write!(w, "request {:?}", request.state),
        Inst::TypeMetadataRef { ty, request } => {
            w.write_str("metadata ")?;
            program.write_type(w, *ty)?;
            write!(w, " {:?}", request.state)
        }
        Inst::NominalTypeArgument { metadata, nominal, index } => {
            write!(w, "type_arg v{} n{}[{}]", metadata, nominal, index)
        }
        Inst::NominalTypeArgumentWitnessTable { metadata, nominal, index } => {
            write!(w, "type_arg_wtable v{} n{}[{}]", metadata, nominal, index)
        }
        Inst::LoadWitness { table, offset } => write!(w, "load_witness v{}[{}]", table, offset),
        Inst::StoreWitness { table, offset, value } => {
            write!(w, "store_witness v{}[{}], v{}", table, offset, value)
        }
        Inst::DynamicTypeOf { instance } => write!(w, "dynamic_type_of v{}", instance),
        Inst::Call { callee, args, ret } => {
            match callee {
                Callee::Runtime(f) => write!(w, "call {:?} runtime {:?}(", ret, f)?,
                Callee::Direct(s) => write!(w, "call {:?} {}(", ret, s)?,
            }
            for (i, arg) in args.iter().enumerate() {
                if i > 0 {
                    w.write_str(", ")?;
                }
                write!(w, "v{}", arg)?;
            }
            w.write_str(")")
        }
        Inst::BufferAlloca { words } => write!(w, "alloca [{} x ptr]", words),
        Inst::BufferLoad { buffer, index, ty } => write!(w, "load {:?} v{}[{}]", ty, buffer, index),
        Inst::BufferStore { buffer, index, value } => write!(w, "store v{}[{}], v{}", buffer, index, value),
        Inst::LoadGlobal { global, ordering } => write!(w, "load_global {} {:?}", global, ordering),
        Inst::StoreGlobal { global, value, ordering } => {
            write!(w, "store_global {}, v{} {:?}", global, value, ordering)
        }
        Inst::IsNull(v) => write!(w, "is_null v{}", v),
        Inst::Jump(block_id) => write!(w, "jmp b{}", block_id),
        Inst::JumpIf { cond, cons, alt } => write!(w, "jmpif v{}, b{}, b{}", cond, cons, alt),
        Inst::ComeFrom { incomings } => {
            write!(w, "comefrom [")?;
            for (i, (from, value)) in incomings.iter().enumerate() {
                if i > 0 {
                    write!(w, ", ")?;
                }
                write!(w, "(b{}: v{})", from, value)?;
            }
            write!(w, "]")
        }
        Inst::Ret(None) => write!(w, "ret"),
        Inst::Ret(Some(value)) => write!(w, "ret v{}", value),
    }
}
