use crate::response::{PacketType, ResultType};

/// Wire value that does not map to any pinned enum member.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} ordinal: {value}")]
pub struct UnknownOrdinal {
    pub kind: &'static str,
    pub value: u16,
}

/// Malformed packet construction. Surfaced synchronously at the builder
/// boundary; a packet failing these checks never reaches the wire.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("effect requests require a positive id")]
    MissingEffectRequestId,
    #[error("effect requests require an effect key")]
    MissingEffect,
    #[error("effect requests require a viewer")]
    MissingViewer,
    #[error("quantity must be positive")]
    ZeroQuantity,
    #[error("`value` is only carried by remote function results")]
    UnexpectedValue,
    #[error("{0:?} responses require a request id")]
    MissingRequestId(PacketType),
    #[error("{0:?} responses cannot carry a request id")]
    UnexpectedRequestId(PacketType),
    #[error("{0:?} responses require a message")]
    MissingMessage(PacketType),
    #[error("{0:?} responses require a result")]
    MissingResult(PacketType),
    #[error("{0:?} responses cannot carry a result")]
    UnexpectedResult(PacketType),
    #[error("result {result:?} does not belong to the {packet:?} family")]
    ResultFamilyMismatch {
        packet: PacketType,
        result: ResultType,
    },
    #[error("timeRemaining must be positive")]
    ZeroTimeRemaining,
    #[error("effect status responses require an effect or a non-empty id set")]
    MissingStatusIds,
}
