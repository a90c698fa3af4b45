// Copyright (c) 2025 knix
// All rights reserved.

//! The front-end model this layer consumes: canonical types, nominal and protocol
//! declarations, generic signatures, conformances and the witness tables recorded
//! for them. Everything is addressed by copyable ids; a [`Program`] owns the data.

pub mod idents;
pub mod lowered;
pub mod types;

use std::fmt::Write;
use std::sync::{Arc, PoisonError, RwLock};

use fxhash::FxHashMap;
use itertools::Itertools;
use log::trace;
use smallvec::smallvec;

use crate::SV4;
use crate::nz_u32_id;
use crate::pool::Pool;
use idents::{Ident, IdentPool};
use types::*;

nz_u32_id!(ModuleId);
nz_u32_id!(NominalId);
nz_u32_id!(ProtocolId);
nz_u32_id!(AssocTypeId);
nz_u32_id!(MethodId);
nz_u32_id!(FunctionId);
nz_u32_id!(GenericSignatureId);
nz_u32_id!(ConformanceId);

pub struct ModuleDecl {
    pub name: Ident,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NominalKind {
    Struct,
    Enum,
    Class,
}

pub struct NominalDecl {
    pub name: Ident,
    pub kind: NominalKind,
    pub module: ModuleId,
    pub generic_signature: Option<GenericSignatureId>,
    pub superclass: Option<TypeId>,
    pub is_final: bool,
    /// Imported from a foreign runtime; its conformances are uniqued at run time.
    pub is_foreign: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolMember {
    Method(MethodId),
    AssociatedType(AssocTypeId),
    /// A requirement that was dropped; it still owns a witness table slot.
    Placeholder,
}

/// `association: requirement`, where `association` is `Self` or a dependent
/// member type rooted at `Self` of `source_protocol`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AssociatedConformance {
    pub source_protocol: ProtocolId,
    pub association: TypeId,
    pub requirement: ProtocolId,
}

pub struct ProtocolDecl {
    pub name: Ident,
    pub module: ModuleId,
    /// Declared in a module built for library evolution.
    pub is_resilient: bool,
    /// Marker protocols have no run-time witness table.
    pub requires_witness_table: bool,
    pub inherited: SV4<ProtocolId>,
    /// Requirements in declaration order.
    pub members: Vec<ProtocolMember>,
    pub associated_conformances: Vec<AssociatedConformance>,
}

pub struct AssocTypeDecl {
    pub name: Ident,
    pub protocol: ProtocolId,
}

pub struct MethodDecl {
    pub name: Ident,
    pub protocol: ProtocolId,
}

pub struct FunctionDecl {
    pub name: Ident,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayoutConstraint {
    Class,
    Trivial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Requirement {
    Conformance { subject: TypeId, protocol: ProtocolId },
    SameType { first: TypeId, second: TypeId },
    Superclass { subject: TypeId, superclass: TypeId },
    Layout { subject: TypeId, constraint: LayoutConstraint },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenericParamDecl {
    pub ty: TypeId,
    pub name: Ident,
    /// False when a same-type requirement made this parameter concrete or equal to
    /// another parameter.
    pub is_canonical: bool,
}

pub struct GenericSignature {
    pub params: SV4<GenericParamDecl>,
    pub requirements: Vec<Requirement>,
}

impl GenericSignature {
    /// Every conformance requirement in order, including ones for protocols without
    /// witness tables. [`SubstitutionMap::conformances`] is parallel to this.
    pub fn conformance_requirements(&self) -> impl Iterator<Item = (TypeId, ProtocolId)> + '_ {
        self.requirements.iter().filter_map(|r| match r {
            Requirement::Conformance { subject, protocol } => Some((*subject, *protocol)),
            _ => None,
        })
    }

    pub fn param_index(&self, param: TypeId) -> Option<usize> {
        self.params.iter().position(|p| p.ty == param)
    }

    pub fn conforms_to(&self, ty: TypeId) -> SV4<ProtocolId> {
        self.conformance_requirements().filter(|(subject, _)| *subject == ty).map(|(_, p)| p).collect()
    }

    pub fn superclass_bound(&self, ty: TypeId) -> Option<TypeId> {
        self.requirements.iter().find_map(|r| match r {
            Requirement::Superclass { subject, superclass } if *subject == ty => Some(*superclass),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConformanceRef {
    /// Known only through a generic requirement.
    Abstract(ProtocolId),
    Concrete(ConformanceId),
}

impl ConformanceRef {
    pub fn protocol(&self, program: &Program) -> ProtocolId {
        match self {
            ConformanceRef::Abstract(p) => *p,
            ConformanceRef::Concrete(c) => program.conformance(*c).protocol,
        }
    }

    pub fn is_abstract(&self) -> bool {
        matches!(self, ConformanceRef::Abstract(_))
    }

    pub fn as_concrete(&self) -> Option<ConformanceId> {
        match self {
            ConformanceRef::Concrete(c) => Some(*c),
            ConformanceRef::Abstract(_) => None,
        }
    }

    #[track_caller]
    pub fn expect_concrete(&self) -> ConformanceId {
        match self {
            ConformanceRef::Concrete(c) => *c,
            ConformanceRef::Abstract(_) => panic!("expect_concrete called on: {:?}", self),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubstitutionMap {
    pub signature: Option<GenericSignatureId>,
    /// Parallel to the signature's params.
    pub replacement_types: SV4<TypeId>,
    /// Parallel to [`GenericSignature::conformance_requirements`].
    pub conformances: SV4<ConformanceRef>,
}

impl SubstitutionMap {
    pub fn empty() -> SubstitutionMap {
        SubstitutionMap { signature: None, replacement_types: SV4::new(), conformances: SV4::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.signature.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct NormalConformance {
    pub module: ModuleId,
    /// The generic signature of the conformance's context, including its
    /// conditional requirements. `None` for a non-generic conforming type.
    pub generic_signature: Option<GenericSignatureId>,
    pub conditional_requirements: Vec<Requirement>,
    pub type_witnesses: Vec<(AssocTypeId, TypeId)>,
    /// `(association, requirement, witness)` for each associated conformance of
    /// the protocol.
    pub associated_conformances: Vec<(TypeId, ProtocolId, ConformanceRef)>,
    pub inherited: Vec<(ProtocolId, ConformanceRef)>,
    pub is_retroactive: bool,
    pub is_synthesized_non_unique: bool,
}

impl NormalConformance {
    pub fn new(module: ModuleId) -> NormalConformance {
        NormalConformance {
            module,
            generic_signature: None,
            conditional_requirements: Vec::new(),
            type_witnesses: Vec::new(),
            associated_conformances: Vec::new(),
            inherited: Vec::new(),
            is_retroactive: false,
            is_synthesized_non_unique: false,
        }
    }

    pub fn is_generic_context(&self) -> bool {
        self.generic_signature.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct SpecializedConformance {
    pub root: ConformanceId,
    pub substitutions: SubstitutionMap,
}

#[derive(Debug, Clone)]
pub enum ConformanceKind {
    Normal(NormalConformance),
    /// A protocol conforming to itself.
    SelfConformance,
    Specialized(SpecializedConformance),
}

#[derive(Debug, Clone)]
pub struct Conformance {
    pub ty: TypeId,
    pub protocol: ProtocolId,
    pub kind: ConformanceKind,
}

impl Conformance {
    pub fn as_normal(&self) -> Option<&NormalConformance> {
        match &self.kind {
            ConformanceKind::Normal(n) => Some(n),
            _ => None,
        }
    }

    #[track_caller]
    pub fn expect_normal(&self) -> &NormalConformance {
        match &self.kind {
            ConformanceKind::Normal(n) => n,
            _ => panic!("expect_normal called on: {:?}", self),
        }
    }
}

/// One recorded witness, in the order the front end lowered the conformance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WitnessRecordEntry {
    BaseProtocol { requirement: ProtocolId, witness: ConformanceRef },
    Method { requirement: MethodId, witness: Option<FunctionId> },
    AssociatedType { requirement: AssocTypeId, witness: TypeId },
    AssociatedTypeProtocol { association: TypeId, protocol: ProtocolId, witness: ConformanceRef },
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConditionalConformanceRecord {
    pub requirement: TypeId,
    pub conformance: ConformanceRef,
}

/// The lowered witness table of one normal conformance.
#[derive(Debug, Clone)]
pub struct WitnessTableRecord {
    pub conformance: ConformanceId,
    pub entries: Vec<WitnessRecordEntry>,
    pub conditional_conformances: Vec<ConditionalConformanceRecord>,
    pub is_declaration: bool,
    pub is_available_externally: bool,
}

impl WitnessTableRecord {
    pub fn new(conformance: ConformanceId, entries: Vec<WitnessRecordEntry>) -> WitnessTableRecord {
        WitnessTableRecord {
            conformance,
            entries,
            conditional_conformances: Vec::new(),
            is_declaration: false,
            is_available_externally: false,
        }
    }
}

struct ConformanceTable {
    pool: Pool<Arc<Conformance>, ConformanceId>,
    by_nominal: FxHashMap<(NominalId, ProtocolId), ConformanceId>,
    specialized: FxHashMap<(ConformanceId, TypeId), ConformanceId>,
}

pub struct Program {
    pub idents: IdentPool,
    pub types: Types,
    modules: Pool<ModuleDecl, ModuleId>,
    nominals: Pool<NominalDecl, NominalId>,
    protocols: Pool<ProtocolDecl, ProtocolId>,
    assoc_types: Pool<AssocTypeDecl, AssocTypeId>,
    methods: Pool<MethodDecl, MethodId>,
    functions: Pool<FunctionDecl, FunctionId>,
    signatures: Pool<GenericSignature, GenericSignatureId>,
    conformances: RwLock<ConformanceTable>,
    self_type: TypeId,
}

impl Default for Program {
    fn default() -> Self {
        Program::new()
    }
}

impl Program {
    pub fn new() -> Program {
        let types = Types::new();
        let self_type = types.intern(Type::GenericParam(GenericParamType { depth: 0, index: 0 }));
        Program {
            idents: IdentPool::make(),
            types,
            modules: Pool::new("modules"),
            nominals: Pool::new("nominals"),
            protocols: Pool::new("protocols"),
            assoc_types: Pool::new("assoc_types"),
            methods: Pool::new("methods"),
            functions: Pool::new("functions"),
            signatures: Pool::new("signatures"),
            conformances: RwLock::new(ConformanceTable {
                pool: Pool::new("conformances"),
                by_nominal: FxHashMap::default(),
                specialized: FxHashMap::default(),
            }),
            self_type,
        }
    }

    // Building

    pub fn add_module(&mut self, name: &str) -> ModuleId {
        let name = self.idents.intern(name);
        self.modules.add(ModuleDecl { name })
    }

    pub fn intern_type(&self, ty: Type) -> TypeId {
        self.types.intern(ty)
    }

    pub fn builtin(&self, builtin: BuiltinType) -> TypeId {
        self.intern_type(Type::Builtin(builtin))
    }

    pub fn generic_param(&self, depth: u32, index: u32) -> TypeId {
        self.intern_type(Type::GenericParam(GenericParamType { depth, index }))
    }

    pub fn dependent_member(&self, base: TypeId, assoc: AssocTypeId) -> TypeId {
        self.intern_type(Type::DependentMember(DependentMemberType { base, assoc }))
    }

    pub fn nominal_type(&self, decl: NominalId, args: &[TypeId]) -> TypeId {
        self.intern_type(Type::Nominal(NominalType { decl, args: args.into() }))
    }

    pub fn tuple_type(&self, elements: &[TypeId]) -> TypeId {
        self.intern_type(Type::Tuple(elements.into()))
    }

    pub fn function_type(&self, params: &[TypeId], result: TypeId) -> TypeId {
        self.intern_type(Type::Function(FunctionType { params: params.into(), result }))
    }

    pub fn metatype(&self, instance: TypeId, repr: MetatypeRepr) -> TypeId {
        self.intern_type(Type::Metatype(MetatypeType { instance, repr }))
    }

    pub fn add_nominal(&mut self, decl: NominalDecl) -> NominalId {
        self.nominals.add(decl)
    }

    pub fn add_struct(
        &mut self,
        name: &str,
        module: ModuleId,
        generic_signature: Option<GenericSignatureId>,
    ) -> NominalId {
        let name = self.idents.intern(name);
        self.add_nominal(NominalDecl {
            name,
            kind: NominalKind::Struct,
            module,
            generic_signature,
            superclass: None,
            is_final: true,
            is_foreign: false,
        })
    }

    pub fn add_class(
        &mut self,
        name: &str,
        module: ModuleId,
        generic_signature: Option<GenericSignatureId>,
        superclass: Option<TypeId>,
    ) -> NominalId {
        let name = self.idents.intern(name);
        self.add_nominal(NominalDecl {
            name,
            kind: NominalKind::Class,
            module,
            generic_signature,
            superclass,
            is_final: false,
            is_foreign: false,
        })
    }

    pub fn nominal_mut(&mut self, id: NominalId) -> &mut NominalDecl {
        self.nominals.get_mut(id)
    }

    pub fn add_protocol(&mut self, name: &str, module: ModuleId) -> ProtocolId {
        let name = self.idents.intern(name);
        self.protocols.add(ProtocolDecl {
            name,
            module,
            is_resilient: false,
            requires_witness_table: true,
            inherited: SV4::new(),
            members: Vec::new(),
            associated_conformances: Vec::new(),
        })
    }

    pub fn protocol_mut(&mut self, id: ProtocolId) -> &mut ProtocolDecl {
        self.protocols.get_mut(id)
    }

    pub fn add_method(&mut self, protocol: ProtocolId, name: &str) -> MethodId {
        let name = self.idents.intern(name);
        let method = self.methods.add(MethodDecl { name, protocol });
        self.protocols.get_mut(protocol).members.push(ProtocolMember::Method(method));
        method
    }

    pub fn add_assoc_type(&mut self, protocol: ProtocolId, name: &str) -> AssocTypeId {
        let name = self.idents.intern(name);
        let assoc = self.assoc_types.add(AssocTypeDecl { name, protocol });
        self.protocols.get_mut(protocol).members.push(ProtocolMember::AssociatedType(assoc));
        assoc
    }

    pub fn add_placeholder(&mut self, protocol: ProtocolId) {
        self.protocols.get_mut(protocol).members.push(ProtocolMember::Placeholder);
    }

    pub fn add_inherited_protocol(&mut self, protocol: ProtocolId, base: ProtocolId) {
        self.protocols.get_mut(protocol).inherited.push(base);
    }

    pub fn add_associated_conformance(
        &mut self,
        protocol: ProtocolId,
        association: TypeId,
        requirement: ProtocolId,
    ) -> AssociatedConformance {
        let ac = AssociatedConformance { source_protocol: protocol, association, requirement };
        self.protocols.get_mut(protocol).associated_conformances.push(ac);
        ac
    }

    pub fn add_function(&mut self, name: &str) -> FunctionId {
        let name = self.idents.intern(name);
        self.functions.add(FunctionDecl { name })
    }

    /// Adds a signature whose parameters are all canonical and named `T0`, `T1`, ...
    pub fn add_signature(&mut self, params: &[TypeId], requirements: Vec<Requirement>) -> GenericSignatureId {
        let params = params
            .iter()
            .enumerate()
            .map(|(i, ty)| GenericParamDecl { ty: *ty, name: self.idents.intern(format!("T{i}")), is_canonical: true })
            .collect();
        self.add_signature_ext(params, requirements)
    }

    pub fn add_signature_ext(
        &mut self,
        params: SV4<GenericParamDecl>,
        requirements: Vec<Requirement>,
    ) -> GenericSignatureId {
        self.signatures.add(GenericSignature { params, requirements })
    }

    /// Registers a normal conformance. Conformances of nominal types are indexed so
    /// that [`Program::lookup_conformance`] can find them.
    pub fn add_conformance(&mut self, ty: TypeId, protocol: ProtocolId, normal: NormalConformance) -> ConformanceId {
        let nominal = self.get_type(ty).as_nominal().map(|n| n.decl);
        let table = self.conformances.get_mut().unwrap_or_else(PoisonError::into_inner);
        let id = table.pool.add(Arc::new(Conformance { ty, protocol, kind: ConformanceKind::Normal(normal) }));
        if let Some(nominal) = nominal {
            table.by_nominal.insert((nominal, protocol), id);
        }
        id
    }

    pub fn add_self_conformance(&mut self, protocol: ProtocolId) -> ConformanceId {
        let ty = self.self_type;
        let table = self.conformances.get_mut().unwrap_or_else(PoisonError::into_inner);
        table.pool.add(Arc::new(Conformance { ty, protocol, kind: ConformanceKind::SelfConformance }))
    }

    pub fn conformance_mut(&mut self, id: ConformanceId) -> &mut NormalConformance {
        let table = self.conformances.get_mut().unwrap_or_else(PoisonError::into_inner);
        let conformance = Arc::make_mut(table.pool.get_mut(id));
        match &mut conformance.kind {
            ConformanceKind::Normal(n) => n,
            _ => panic!("conformance_mut called on a non-normal conformance"),
        }
    }

    // Lookup

    pub fn self_type(&self) -> TypeId {
        self.self_type
    }

    pub fn get_type(&self, id: TypeId) -> Type {
        self.types.get(id)
    }

    pub fn has_type_parameter(&self, id: TypeId) -> bool {
        self.types.flags(id).has_type_parameter
    }

    pub fn has_archetype(&self, id: TypeId) -> bool {
        self.types.flags(id).has_archetype
    }

    pub fn is_type_parameter(&self, id: TypeId) -> bool {
        self.get_type(id).is_type_parameter()
    }

    pub fn is_archetype(&self, id: TypeId) -> bool {
        self.get_type(id).as_archetype().is_some()
    }

    pub fn type_depth(&self, id: TypeId) -> u32 {
        self.types.flags(id).depth
    }

    pub fn name(&self, ident: Ident) -> &str {
        self.idents.get_name(ident)
    }

    pub fn has_module(&self, id: ModuleId) -> bool {
        id.as_u32() as usize <= self.modules.len()
    }

    pub fn module(&self, id: ModuleId) -> &ModuleDecl {
        self.modules.get(id)
    }

    pub fn nominal(&self, id: NominalId) -> &NominalDecl {
        self.nominals.get(id)
    }

    pub fn protocol(&self, id: ProtocolId) -> &ProtocolDecl {
        self.protocols.get(id)
    }

    pub fn assoc_type(&self, id: AssocTypeId) -> &AssocTypeDecl {
        self.assoc_types.get(id)
    }

    pub fn method(&self, id: MethodId) -> &MethodDecl {
        self.methods.get(id)
    }

    pub fn function(&self, id: FunctionId) -> &FunctionDecl {
        self.functions.get(id)
    }

    pub fn signature(&self, id: GenericSignatureId) -> &GenericSignature {
        self.signatures.get(id)
    }

    pub fn nominal_of(&self, ty: TypeId) -> Option<NominalId> {
        self.get_type(ty).as_nominal().map(|n| n.decl)
    }

    pub fn class_of(&self, ty: TypeId) -> Option<NominalId> {
        self.nominal_of(ty).filter(|decl| self.nominal(*decl).kind == NominalKind::Class)
    }

    /// True if `protocol` is `base` or refines it, directly or transitively.
    pub fn protocol_inherits(&self, protocol: ProtocolId, base: ProtocolId) -> bool {
        protocol == base || self.protocol(protocol).inherited.iter().any(|p| self.protocol_inherits(*p, base))
    }

    pub fn conformance(&self, id: ConformanceId) -> Arc<Conformance> {
        let table = self.conformances.read().unwrap_or_else(PoisonError::into_inner);
        table.pool.get(id).clone()
    }

    pub fn root_conformance(&self, id: ConformanceId) -> ConformanceId {
        match &self.conformance(id).kind {
            ConformanceKind::Specialized(s) => self.root_conformance(s.root),
            ConformanceKind::Normal(_) | ConformanceKind::SelfConformance => id,
        }
    }

    /// The module a conformance was declared in; self conformances live with their
    /// protocol.
    pub fn conformance_module(&self, id: ConformanceId) -> ModuleId {
        let root = self.conformance(self.root_conformance(id));
        match &root.kind {
            ConformanceKind::Normal(n) => n.module,
            _ => self.protocol(root.protocol).module,
        }
    }

    /// Conformance requirements among the conditional requirements that need a
    /// witness table at run time, in declaration order.
    pub fn conditional_conformances(&self, conformance: ConformanceId) -> SV4<(TypeId, ProtocolId)> {
        let root = self.conformance(self.root_conformance(conformance));
        let Some(normal) = root.as_normal() else { return SV4::new() };
        normal
            .conditional_requirements
            .iter()
            .filter_map(|r| match r {
                Requirement::Conformance { subject, protocol }
                    if self.protocol(*protocol).requires_witness_table =>
                {
                    Some((*subject, *protocol))
                }
                _ => None,
            })
            .collect()
    }

    /// Finds the conformance of `ty` to `protocol`. Type parameters and archetypes
    /// conform abstractly; bound generic types get a specialized conformance.
    pub fn lookup_conformance(&self, ty: TypeId, protocol: ProtocolId) -> Option<ConformanceRef> {
        match self.get_type(ty) {
            Type::GenericParam(_) | Type::DependentMember(_) | Type::Archetype(_) => {
                Some(ConformanceRef::Abstract(protocol))
            }
            Type::Nominal(n) => {
                let found = {
                    let table = self.conformances.read().unwrap_or_else(PoisonError::into_inner);
                    table.by_nominal.get(&(n.decl, protocol)).copied()
                };
                match found {
                    Some(root) if n.args.is_empty() => Some(ConformanceRef::Concrete(root)),
                    Some(root) => Some(ConformanceRef::Concrete(self.specialize_conformance(root, ty))),
                    None => {
                        // Subclasses inherit their superclass's conformances.
                        let superclass = self.nominal(n.decl).superclass?;
                        self.lookup_conformance(superclass, protocol)
                    }
                }
            }
            Type::Builtin(_) | Type::Tuple(_) | Type::Function(_) | Type::Metatype(_) => None,
        }
    }

    pub fn specialize_conformance(&self, root: ConformanceId, ty: TypeId) -> ConformanceId {
        let root_conf = self.conformance(root);
        if root_conf.ty == ty {
            return root;
        }
        {
            let table = self.conformances.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = table.specialized.get(&(root, ty)) {
                return *existing;
            }
        }
        let normal = root_conf.expect_normal();
        let args = self.get_type(ty).expect_nominal().args.clone();
        let substitutions = self.substitution_map_from_types(normal.generic_signature, &args);
        let conformance = Conformance {
            ty,
            protocol: root_conf.protocol,
            kind: ConformanceKind::Specialized(SpecializedConformance { root, substitutions }),
        };
        let mut table = self.conformances.write().unwrap_or_else(PoisonError::into_inner);
        // Another thread may have raced us here
        if let Some(existing) = table.specialized.get(&(root, ty)) {
            return *existing;
        }
        let id = table.pool.add(Arc::new(conformance));
        table.specialized.insert((root, ty), id);
        trace!("specialized conformance {} as {}", root, id);
        id
    }

    // Substitution

    /// Builds a substitution map for `signature` from replacement types alone,
    /// looking up each conformance requirement against the replacement.
    pub fn substitution_map_from_types(
        &self,
        signature: Option<GenericSignatureId>,
        replacement_types: &[TypeId],
    ) -> SubstitutionMap {
        let Some(signature) = signature else { return SubstitutionMap::empty() };
        let sig = self.signature(signature);
        assert_eq!(
            sig.params.len(),
            replacement_types.len(),
            "substitution arity mismatch for signature {}",
            signature
        );
        let mut map = SubstitutionMap {
            signature: Some(signature),
            replacement_types: replacement_types.into(),
            conformances: SV4::new(),
        };
        let mut conformances = SV4::new();
        for (subject, protocol) in sig.conformance_requirements() {
            let replacement = self.subst_type(subject, &map);
            let Some(conformance) = self.lookup_conformance(replacement, protocol) else {
                panic!(
                    "{} does not conform to {} while substituting signature {}",
                    self.display_type(replacement),
                    self.name(self.protocol(protocol).name),
                    signature
                )
            };
            conformances.push(conformance);
        }
        map.conformances = conformances;
        map
    }

    /// Maps every parameter to itself and every conformance to its abstract form.
    pub fn identity_substitution_map(&self, signature: Option<GenericSignatureId>) -> SubstitutionMap {
        let Some(signature) = signature else { return SubstitutionMap::empty() };
        let sig = self.signature(signature);
        SubstitutionMap {
            signature: Some(signature),
            replacement_types: sig.params.iter().map(|p| p.ty).collect(),
            conformances: sig.conformance_requirements().map(|(_, p)| ConformanceRef::Abstract(p)).collect(),
        }
    }

    /// The substitutions that turn a nominal's generic signature into the bound
    /// generic type `ty`. Archetypes use their superclass bound.
    pub fn context_substitution_map(&self, ty: TypeId) -> SubstitutionMap {
        let ty = match self.get_type(ty) {
            Type::Archetype(_) => match self.archetype_superclass(ty) {
                Some(superclass) => superclass,
                None => panic!("context_substitution_map on archetype without superclass"),
            },
            _ => ty,
        };
        let nominal = self.get_type(ty).expect_nominal().clone();
        let decl = self.nominal(nominal.decl);
        self.substitution_map_from_types(decl.generic_signature, &nominal.args)
    }

    pub fn conformance_substitutions(&self, conformance: ConformanceId) -> SubstitutionMap {
        let conf = self.conformance(conformance);
        match &conf.kind {
            ConformanceKind::Specialized(s) => s.substitutions.clone(),
            ConformanceKind::Normal(n) => self.identity_substitution_map(n.generic_signature),
            ConformanceKind::SelfConformance => SubstitutionMap::empty(),
        }
    }

    fn replacement_for(&self, param: TypeId, subs: &SubstitutionMap) -> Option<TypeId> {
        let sig = self.signature(subs.signature?);
        sig.param_index(param).map(|i| subs.replacement_types[i])
    }

    pub fn subst_type(&self, ty: TypeId, subs: &SubstitutionMap) -> TypeId {
        if subs.is_empty() || !self.has_type_parameter(ty) {
            return ty;
        }
        match self.get_type(ty) {
            Type::GenericParam(_) => self.replacement_for(ty, subs).unwrap_or(ty),
            Type::DependentMember(m) => {
                let base = self.subst_type(m.base, subs);
                self.member_type(base, m.assoc)
            }
            Type::Nominal(n) => {
                let args: SV4<TypeId> = n.args.iter().map(|a| self.subst_type(*a, subs)).collect();
                self.nominal_type(n.decl, &args)
            }
            Type::Tuple(elements) => {
                let elements: SV4<TypeId> = elements.iter().map(|e| self.subst_type(*e, subs)).collect();
                self.tuple_type(&elements)
            }
            Type::Function(f) => {
                let params: SV4<TypeId> = f.params.iter().map(|p| self.subst_type(*p, subs)).collect();
                let result = self.subst_type(f.result, subs);
                self.function_type(&params, result)
            }
            Type::Metatype(m) => self.metatype(self.subst_type(m.instance, subs), m.repr),
            Type::Builtin(_) | Type::Archetype(_) => ty,
        }
    }

    /// `base.assoc`, resolved through the type witness when `base` is concrete.
    pub fn member_type(&self, base: TypeId, assoc: AssocTypeId) -> TypeId {
        match self.get_type(base) {
            Type::GenericParam(_) | Type::DependentMember(_) => self.dependent_member(base, assoc),
            Type::Archetype(a) => {
                let interface = self.dependent_member(a.interface, assoc);
                self.intern_type(Type::Archetype(ArchetypeType { environment: a.environment, interface }))
            }
            _ => {
                let protocol = self.assoc_type(assoc).protocol;
                match self.lookup_conformance(base, protocol) {
                    Some(ConformanceRef::Concrete(c)) => self.type_witness(c, assoc),
                    _ => panic!(
                        "{} has no conformance to {} providing {}",
                        self.display_type(base),
                        self.name(self.protocol(protocol).name),
                        self.name(self.assoc_type(assoc).name)
                    ),
                }
            }
        }
    }

    pub fn type_witness(&self, conformance: ConformanceId, assoc: AssocTypeId) -> TypeId {
        let conf = self.conformance(conformance);
        match &conf.kind {
            ConformanceKind::Normal(n) => match n.type_witnesses.iter().find(|(a, _)| *a == assoc) {
                Some((_, witness)) => *witness,
                None => panic!(
                    "conformance {} has no type witness for {}",
                    self.conformance_name(conformance),
                    self.name(self.assoc_type(assoc).name)
                ),
            },
            ConformanceKind::Specialized(s) => {
                let root_witness = self.type_witness(s.root, assoc);
                self.subst_type(root_witness, &s.substitutions)
            }
            ConformanceKind::SelfConformance => {
                panic!("type_witness called on self conformance {}", conformance)
            }
        }
    }

    /// Looks up the conformance of a type parameter of `subs`'s signature, or of
    /// the substituted type when the signature doesn't state it.
    pub fn lookup_conformance_in_map(
        &self,
        subs: &SubstitutionMap,
        ty: TypeId,
        protocol: ProtocolId,
    ) -> Option<ConformanceRef> {
        if let Some(signature) = subs.signature {
            let sig = self.signature(signature);
            let requirements = sig.conformance_requirements().collect::<SV4<_>>();
            if let Some(k) = requirements.iter().position(|(s, p)| *s == ty && *p == protocol) {
                return Some(subs.conformances[k]);
            }
            if let Some(k) =
                requirements.iter().position(|(s, p)| *s == ty && self.protocol_inherits(*p, protocol))
            {
                return match subs.conformances[k] {
                    ConformanceRef::Abstract(_) => Some(ConformanceRef::Abstract(protocol)),
                    ConformanceRef::Concrete(c) => self.inherited_conformance(c, protocol),
                };
            }
            if let Type::DependentMember(m) = self.get_type(ty) {
                let assoc_protocol = self.assoc_type(m.assoc).protocol;
                if let Some(base_conformance) = self.lookup_conformance_in_map(subs, m.base, assoc_protocol) {
                    let association = self.dependent_member(self.self_type, m.assoc);
                    return Some(self.associated_conformance(base_conformance, association, protocol));
                }
            }
        }
        self.lookup_conformance(self.subst_type(ty, subs), protocol)
    }

    /// Substitutes a conformance of `original_ty`.
    pub fn subst_conformance(
        &self,
        conformance: ConformanceRef,
        original_ty: TypeId,
        subs: &SubstitutionMap,
    ) -> ConformanceRef {
        match conformance {
            ConformanceRef::Abstract(p) => {
                self.lookup_conformance_in_map(subs, original_ty, p).unwrap_or(ConformanceRef::Abstract(p))
            }
            ConformanceRef::Concrete(c) => {
                let conf = self.conformance(c);
                if !self.has_type_parameter(conf.ty) {
                    return conformance;
                }
                let substituted = self.subst_type(conf.ty, subs);
                match self.lookup_conformance(substituted, conf.protocol) {
                    Some(r) => r,
                    None => panic!("substituted conformance {} vanished", self.conformance_name(c)),
                }
            }
        }
    }

    pub fn inherited_conformance(&self, conformance: ConformanceId, base: ProtocolId) -> Option<ConformanceRef> {
        let conf = self.conformance(conformance);
        match &conf.kind {
            ConformanceKind::Normal(n) => {
                if let Some((_, direct)) = n.inherited.iter().find(|(p, _)| *p == base) {
                    return Some(*direct);
                }
                // Reach grandparents through whichever parent refines them
                n.inherited.iter().find(|(p, _)| self.protocol_inherits(*p, base)).and_then(|(_, c)| match c {
                    ConformanceRef::Abstract(_) => Some(ConformanceRef::Abstract(base)),
                    ConformanceRef::Concrete(parent) => self.inherited_conformance(*parent, base),
                })
            }
            ConformanceKind::Specialized(s) => {
                let root_inherited = self.inherited_conformance(s.root, base)?;
                let root_ty = self.conformance(s.root).ty;
                Some(self.subst_conformance(root_inherited, root_ty, &s.substitutions))
            }
            ConformanceKind::SelfConformance => None,
        }
    }

    /// The type reached from `conforming_ty` by following `association`, a type
    /// rooted at `Self`.
    pub fn associated_type(&self, conformance: ConformanceRef, conforming_ty: TypeId, association: TypeId) -> TypeId {
        if association == self.self_type {
            return conforming_ty;
        }
        let Type::DependentMember(member) = self.get_type(association) else {
            panic!("association {} is not rooted at Self", self.display_type(association))
        };
        if member.base == self.self_type {
            return match conformance {
                ConformanceRef::Abstract(_) => self.member_type(conforming_ty, member.assoc),
                ConformanceRef::Concrete(c) => self.type_witness(c, member.assoc),
            };
        }
        let parent = self.associated_type(conformance, conforming_ty, member.base);
        let parent_protocol = self.assoc_type(member.assoc).protocol;
        let parent_conformance = self.associated_conformance(conformance, member.base, parent_protocol);
        let nested = self.dependent_member(self.self_type, member.assoc);
        self.associated_type(parent_conformance, parent, nested)
    }

    pub fn associated_conformance(
        &self,
        conformance: ConformanceRef,
        association: TypeId,
        requirement: ProtocolId,
    ) -> ConformanceRef {
        let ConformanceRef::Concrete(c) = conformance else {
            return ConformanceRef::Abstract(requirement);
        };
        let conf = self.conformance(c);
        match &conf.kind {
            ConformanceKind::Normal(n) => {
                if association == self.self_type {
                    if let Some((_, inherited)) = n.inherited.iter().find(|(p, _)| *p == requirement) {
                        return *inherited;
                    }
                }
                match n.associated_conformances.iter().find(|(a, p, _)| *a == association && *p == requirement) {
                    Some((_, _, witness)) => *witness,
                    None => panic!(
                        "conformance {} has no associated conformance {}: {}",
                        self.conformance_name(c),
                        self.display_type(association),
                        self.name(self.protocol(requirement).name)
                    ),
                }
            }
            ConformanceKind::Specialized(s) => {
                let root = ConformanceRef::Concrete(s.root);
                let root_ty = self.conformance(s.root).ty;
                let root_result = self.associated_conformance(root, association, requirement);
                let root_associated = self.associated_type(root, root_ty, association);
                self.subst_conformance(root_result, root_associated, &s.substitutions)
            }
            ConformanceKind::SelfConformance => ConformanceRef::Abstract(requirement),
        }
    }

    /// Rewrites a `Self`-rooted type so that it is rooted at `new_self` instead.
    pub fn replace_self(&self, ty: TypeId, new_self: TypeId) -> TypeId {
        if ty == self.self_type {
            return new_self;
        }
        match self.get_type(ty) {
            Type::DependentMember(m) => {
                let base = self.replace_self(m.base, new_self);
                self.member_type(base, m.assoc)
            }
            _ => ty,
        }
    }

    // Generic environments

    pub fn map_type_into_context(&self, signature: Option<GenericSignatureId>, ty: TypeId) -> TypeId {
        let Some(environment) = signature else { return ty };
        if !self.has_type_parameter(ty) {
            return ty;
        }
        match self.get_type(ty) {
            Type::GenericParam(_) | Type::DependentMember(_) => {
                self.intern_type(Type::Archetype(ArchetypeType { environment, interface: ty }))
            }
            Type::Nominal(n) => {
                let args: SV4<TypeId> = n.args.iter().map(|a| self.map_type_into_context(signature, *a)).collect();
                self.nominal_type(n.decl, &args)
            }
            Type::Tuple(elements) => {
                let elements: SV4<TypeId> =
                    elements.iter().map(|e| self.map_type_into_context(signature, *e)).collect();
                self.tuple_type(&elements)
            }
            Type::Function(f) => {
                let params: SV4<TypeId> = f.params.iter().map(|p| self.map_type_into_context(signature, *p)).collect();
                let result = self.map_type_into_context(signature, f.result);
                self.function_type(&params, result)
            }
            Type::Metatype(m) => self.metatype(self.map_type_into_context(signature, m.instance), m.repr),
            Type::Builtin(_) | Type::Archetype(_) => ty,
        }
    }

    /// The environment of the first archetype found in `ty`.
    pub fn generic_environment_of(&self, ty: TypeId) -> Option<GenericSignatureId> {
        if !self.has_archetype(ty) {
            return None;
        }
        match self.get_type(ty) {
            Type::Archetype(a) => Some(a.environment),
            other => other.children().into_iter().find_map(|c| self.generic_environment_of(c)),
        }
    }

    pub fn archetype_conforms_to(&self, ty: TypeId) -> SV4<ProtocolId> {
        match self.get_type(ty) {
            Type::Archetype(a) => self.signature(a.environment).conforms_to(a.interface),
            _ => smallvec![],
        }
    }

    pub fn archetype_superclass(&self, ty: TypeId) -> Option<TypeId> {
        let archetype = *self.get_type(ty).as_archetype()?;
        let superclass = self.signature(archetype.environment).superclass_bound(archetype.interface)?;
        Some(self.map_type_into_context(Some(archetype.environment), superclass))
    }

    // Printing

    pub fn display_type(&self, ty: TypeId) -> String {
        let mut s = String::new();
        self.write_type(&mut s, ty).unwrap_or_default();
        s
    }

    pub fn write_type(&self, w: &mut impl Write, ty: TypeId) -> std::fmt::Result {
        match self.get_type(ty) {
            Type::Builtin(b) => write!(w, "{:?}", b),
            Type::GenericParam(_) if ty == self.self_type => w.write_str("Self"),
            Type::GenericParam(p) => write!(w, "τ_{}_{}", p.depth, p.index),
            Type::DependentMember(m) => {
                self.write_type(w, m.base)?;
                write!(w, ".{}", self.name(self.assoc_type(m.assoc).name))
            }
            Type::Archetype(a) => {
                w.write_char('$')?;
                self.write_type(w, a.interface)
            }
            Type::Nominal(n) => {
                w.write_str(self.name(self.nominal(n.decl).name))?;
                if !n.args.is_empty() {
                    let args = n.args.iter().map(|a| self.display_type(*a)).join(", ");
                    write!(w, "<{}>", args)?;
                }
                Ok(())
            }
            Type::Tuple(elements) => {
                write!(w, "({})", elements.iter().map(|e| self.display_type(*e)).join(", "))
            }
            Type::Function(f) => {
                let params = f.params.iter().map(|p| self.display_type(*p)).join(", ");
                write!(w, "({}) -> ", params)?;
                self.write_type(w, f.result)
            }
            Type::Metatype(m) => {
                self.write_type(w, m.instance)?;
                w.write_str(".Type")
            }
        }
    }

    pub fn conformance_name(&self, id: ConformanceId) -> String {
        let conf = self.conformance(id);
        format!("{}: {}", self.display_type(conf.ty), self.name(self.protocol(conf.protocol).name))
    }
}
