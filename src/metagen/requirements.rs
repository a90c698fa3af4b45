// Copyright (c) 2025 knix
// All rights reserved.

use std::fmt::{Display, Formatter};

use either::Either;

use crate::ir::IrType;
use crate::program::types::TypeId;
use crate::program::{GenericSignatureId, Program, ProtocolId, Requirement};


/// A value a generic context needs at run time: the metadata for a type
/// parameter, or, with a protocol, the witness table proving its conformance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GenericRequirement {
    pub type_parameter: TypeId,
    pub protocol: Option<ProtocolId>,
}

impl GenericRequirement {
    pub fn metadata(type_parameter: TypeId) -> GenericRequirement {
        GenericRequirement { type_parameter, protocol: None }
    }

    pub fn witness_table(type_parameter: TypeId, protocol: ProtocolId) -> GenericRequirement {
        GenericRequirement { type_parameter, protocol: Some(protocol) }
    }

    pub fn is_metadata(&self) -> bool {
        self.protocol.is_none()
    }

    pub fn ir_type(&self) -> IrType {
        match self.protocol {
            None => IrType::TypeMetadataPtr,
            Some(_) => IrType::WitnessTablePtr,
        }
    }
}

impl Display for GenericRequirement {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.protocol {
            None => write!(f, "metadata(t{})", self.type_parameter),
            Some(p) => write!(f, "witness(t{}: p{})", self.type_parameter, p),
        }
    }
}

/// The requirements of `signature` in ABI order: one metadata requirement per
/// canonical generic parameter, then each conformance requirement whose protocol
/// has a witness table. The order is a function of the signature alone; it is
/// the argument order for implicit generic parameters and the slot order of
/// generic requirement buffers.
///
/// The iterator is lazy and can be cloned to restart it.
pub fn enumerate_generic_requirements(
    program: &Program,
    signature: Option<GenericSignatureId>,
) -> impl Iterator<Item = GenericRequirement> + Clone + '_ {
    let Some(signature) = signature else {
        return Either::Left(std::iter::empty());
    };
    let sig = program.signature(signature);
    let params = sig.params.iter().filter(|p| p.is_canonical).map(|p| GenericRequirement::metadata(p.ty));
    let conformances = sig.requirements.iter().filter_map(move |r| match r {
        Requirement::Conformance { subject, protocol } => {
            if program.protocol(*protocol).requires_witness_table {
                Some(GenericRequirement::witness_table(*subject, *protocol))
            } else {
                None
            }
        }
        // These constrain the parameters but need no value of their own
        Requirement::SameType { .. } | Requirement::Superclass { .. } | Requirement::Layout { .. } => None,
    });
    Either::Right(params.chain(conformances))
}
