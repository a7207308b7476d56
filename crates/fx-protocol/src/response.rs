use crate::error::{UnknownOrdinal, ValidationError};
use crate::value::opt_millis;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Outer classification of a response packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum PacketType {
    EffectResult,
    EffectStatus,
    RemoteFunction,
    Login,
    LoginSuccess,
    Disconnect,
    KeepAlive,
}

impl PacketType {
    /// Packet types that must carry a non-empty message.
    pub fn requires_message(self) -> bool {
        matches!(self, PacketType::Disconnect)
    }

    /// Packet types that carry a result classification.
    pub fn carries_result(self) -> bool {
        matches!(self, PacketType::EffectResult | PacketType::EffectStatus)
    }

    /// Packet types permitted to echo the originating request id.
    ///
    /// EFFECT_RESULT responses always correlate to a request; KEEP_ALIVE
    /// echoes whatever id the ping carried. Everything else is
    /// connection-wide and uses id 0.
    pub fn carries_request_id(self) -> bool {
        matches!(self, PacketType::EffectResult | PacketType::KeepAlive)
    }
}

impl From<PacketType> for u16 {
    fn from(value: PacketType) -> Self {
        match value {
            PacketType::EffectResult => 0,
            PacketType::EffectStatus => 1,
            PacketType::RemoteFunction => 0xD0,
            PacketType::Login => 0xF0,
            PacketType::LoginSuccess => 0xF1,
            PacketType::Disconnect => 0xF2,
            PacketType::KeepAlive => 0xFF,
        }
    }
}

impl TryFrom<u16> for PacketType {
    type Error = UnknownOrdinal;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PacketType::EffectResult),
            1 => Ok(PacketType::EffectStatus),
            0xD0 => Ok(PacketType::RemoteFunction),
            0xF0 => Ok(PacketType::Login),
            0xF1 => Ok(PacketType::LoginSuccess),
            0xF2 => Ok(PacketType::Disconnect),
            0xFF => Ok(PacketType::KeepAlive),
            other => Err(UnknownOrdinal {
                kind: "packet type",
                value: other,
            }),
        }
    }
}

/// Inner classification carried by EFFECT_RESULT and EFFECT_STATUS packets.
///
/// The two families never mix: a packet's result must belong to the family
/// matching its packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ResultType {
    Success,
    Failure,
    Unavailable,
    Retry,
    Queue,
    NotReady,
    Paused,
    Resumed,
    Finished,
    Visible,
    NotVisible,
    Selectable,
    NotSelectable,
}

impl ResultType {
    /// True for the EFFECT_STATUS family.
    pub fn is_status(self) -> bool {
        matches!(
            self,
            ResultType::Visible
                | ResultType::NotVisible
                | ResultType::Selectable
                | ResultType::NotSelectable
        )
    }
}

impl From<ResultType> for u8 {
    fn from(value: ResultType) -> Self {
        match value {
            ResultType::Success => 0,
            ResultType::Failure => 1,
            ResultType::Unavailable => 2,
            ResultType::Retry => 3,
            ResultType::Queue => 4,
            ResultType::NotReady => 5,
            ResultType::Paused => 6,
            ResultType::Resumed => 7,
            ResultType::Finished => 8,
            ResultType::Visible => 0x80,
            ResultType::NotVisible => 0x81,
            ResultType::Selectable => 0x82,
            ResultType::NotSelectable => 0x83,
        }
    }
}

impl TryFrom<u8> for ResultType {
    type Error = UnknownOrdinal;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ResultType::Success),
            1 => Ok(ResultType::Failure),
            2 => Ok(ResultType::Unavailable),
            3 => Ok(ResultType::Retry),
            4 => Ok(ResultType::Queue),
            5 => Ok(ResultType::NotReady),
            6 => Ok(ResultType::Paused),
            7 => Ok(ResultType::Resumed),
            8 => Ok(ResultType::Finished),
            0x80 => Ok(ResultType::Visible),
            0x81 => Ok(ResultType::NotVisible),
            0x82 => Ok(ResultType::Selectable),
            0x83 => Ok(ResultType::NotSelectable),
            other => Err(UnknownOrdinal {
                kind: "result type",
                value: u16::from(other),
            }),
        }
    }
}

/// Namespace of the keys in an EFFECT_STATUS id set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum IdType {
    Effect,
    Group,
    Category,
}

impl From<IdType> for u8 {
    fn from(value: IdType) -> Self {
        match value {
            IdType::Effect => 0,
            IdType::Group => 1,
            IdType::Category => 2,
        }
    }
}

impl TryFrom<u8> for IdType {
    type Error = UnknownOrdinal;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(IdType::Effect),
            1 => Ok(IdType::Group),
            2 => Ok(IdType::Category),
            other => Err(UnknownOrdinal {
                kind: "id type",
                value: u16::from(other),
            }),
        }
    }
}

/// Reply to a request, or a connection-wide packet.
///
/// Responses for a single request form a finite stream ending with a
/// terminating response; see [`Response::is_terminating`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub id: u32,
    #[serde(rename = "type")]
    pub packet: PacketType,
    #[serde(rename = "status", default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(
        rename = "timeRemaining",
        default,
        with = "opt_millis",
        skip_serializing_if = "Option::is_none"
    )]
    pub time_remaining: Option<Duration>,
    /// Effect key, for EFFECT_STATUS packets about a single effect.
    #[serde(rename = "code", default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<String>,
    /// Target keys for status broadcasts about several effects at once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<BTreeSet<String>>,
    #[serde(rename = "idType", default, skip_serializing_if = "Option::is_none")]
    pub id_type: Option<IdType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(rename = "args", default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<serde_json::Value>,
}

impl Response {
    pub fn builder(packet: PacketType) -> ResponseBuilder {
        ResponseBuilder::new(packet)
    }

    /// True when this response closes its per-request stream: FAILURE,
    /// UNAVAILABLE, FINISHED, NOT_READY, or a SUCCESS with no remaining
    /// duration. A SUCCESS that carries `timeRemaining` starts a timed effect
    /// and leaves the stream open.
    pub fn is_terminating(&self) -> bool {
        match self.result {
            Some(ResultType::Success) => self.time_remaining.is_none(),
            Some(
                ResultType::Failure
                | ResultType::Unavailable
                | ResultType::Finished
                | ResultType::NotReady,
            ) => true,
            _ => false,
        }
    }

    /// Enforce the construction invariants, typically on a packet that
    /// arrived over the wire.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.packet == PacketType::EffectResult && self.id == 0 {
            return Err(ValidationError::MissingRequestId(self.packet));
        }
        if self.id > 0 && !self.packet.carries_request_id() {
            return Err(ValidationError::UnexpectedRequestId(self.packet));
        }
        if self.packet.requires_message() && self.message.as_deref().is_none_or(str::is_empty) {
            return Err(ValidationError::MissingMessage(self.packet));
        }
        match (self.packet.carries_result(), self.result) {
            (true, None) => return Err(ValidationError::MissingResult(self.packet)),
            (false, Some(_)) => return Err(ValidationError::UnexpectedResult(self.packet)),
            (true, Some(result)) => {
                let wants_status = self.packet == PacketType::EffectStatus;
                if result.is_status() != wants_status {
                    return Err(ValidationError::ResultFamilyMismatch {
                        packet: self.packet,
                        result,
                    });
                }
            }
            (false, None) => {}
        }
        if self.time_remaining.is_some_and(|t| t.is_zero()) {
            return Err(ValidationError::ZeroTimeRemaining);
        }
        if self.packet == PacketType::EffectStatus
            && self.effect.is_none()
            && self.ids.as_ref().is_none_or(BTreeSet::is_empty)
        {
            return Err(ValidationError::MissingStatusIds);
        }
        Ok(())
    }

    /// An unsolicited keep-alive (id 0). Echo replies go through the builder
    /// with the originating id instead.
    pub fn keep_alive() -> Response {
        ResponseBuilder::new(PacketType::KeepAlive).finish()
    }

    /// The challenge a password-protected server writes on accept.
    pub fn login_challenge() -> Response {
        ResponseBuilder::new(PacketType::Login).finish()
    }

    pub fn login_success() -> Response {
        ResponseBuilder::new(PacketType::LoginSuccess)
            .message("Login successful")
            .finish()
    }

    pub fn disconnect(reason: impl Into<String>) -> Response {
        ResponseBuilder::new(PacketType::Disconnect)
            .message(reason)
            .finish()
    }
}

/// Fluent constructor for [`Response`]; `build` runs the validation pass.
#[derive(Debug, Clone)]
pub struct ResponseBuilder {
    response: Response,
}

impl ResponseBuilder {
    pub fn new(packet: PacketType) -> Self {
        ResponseBuilder {
            response: Response {
                id: 0,
                packet,
                result: None,
                message: None,
                time_remaining: None,
                effect: None,
                ids: None,
                id_type: None,
                method: None,
                arguments: Vec::new(),
            },
        }
    }

    pub fn id(mut self, id: u32) -> Self {
        self.response.id = id;
        self
    }

    pub fn result(mut self, result: ResultType) -> Self {
        self.response.result = Some(result);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.response.message = Some(message.into());
        self
    }

    pub fn time_remaining(mut self, remaining: Duration) -> Self {
        self.response.time_remaining = Some(remaining);
        self
    }

    pub fn effect(mut self, effect: impl AsRef<str>) -> Self {
        self.response.effect = Some(effect.as_ref().to_lowercase());
        self
    }

    pub fn ids(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.response.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn id_type(mut self, id_type: IdType) -> Self {
        self.response.id_type = Some(id_type);
        self
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.response.method = Some(method.into());
        self
    }

    pub fn argument(mut self, argument: serde_json::Value) -> Self {
        self.response.arguments.push(argument);
        self
    }

    pub fn build(self) -> Result<Response, ValidationError> {
        self.response.validate()?;
        Ok(self.response)
    }

    /// Build without re-validating; for the fixed-shape convenience
    /// constructors whose output is valid by construction.
    fn finish(self) -> Response {
        debug_assert!(self.response.validate().is_ok());
        self.response
    }
}
