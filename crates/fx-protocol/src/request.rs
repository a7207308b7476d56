use crate::error::{UnknownOrdinal, ValidationError};
use crate::target::{Source, Target};
use crate::value::{ParamValue, opt_millis};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Classification of an incoming request.
///
/// Wire values are pinned; see `codec::tests::request_type_ordinals_are_pinned`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum RequestType {
    Start,
    Stop,
    RemoteFunctionResult,
    PlayerInfo,
    Login,
    KeepAlive,
}

impl RequestType {
    /// True for request types that carry an effect (START / STOP).
    pub fn is_effect(self) -> bool {
        matches!(self, RequestType::Start | RequestType::Stop)
    }
}

impl From<RequestType> for u16 {
    fn from(value: RequestType) -> Self {
        match value {
            RequestType::Start => 1,
            RequestType::Stop => 2,
            RequestType::RemoteFunctionResult => 0xD0,
            RequestType::PlayerInfo => 0xE0,
            RequestType::Login => 0xF0,
            RequestType::KeepAlive => 0xFF,
        }
    }
}

impl TryFrom<u16> for RequestType {
    type Error = UnknownOrdinal;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(RequestType::Start),
            2 => Ok(RequestType::Stop),
            0xD0 => Ok(RequestType::RemoteFunctionResult),
            0xE0 => Ok(RequestType::PlayerInfo),
            0xF0 => Ok(RequestType::Login),
            0xFF => Ok(RequestType::KeepAlive),
            other => Err(UnknownOrdinal {
                kind: "request type",
                value: other,
            }),
        }
    }
}

/// A single unit of incoming work.
///
/// An `id` of 0 marks an unsolicited packet (keep-alive, login, status
/// broadcast); a positive id marks an effect-bearing request whose responses
/// are correlated by that id. Requests are immutable once built; handlers
/// receive shared snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: u32,
    #[serde(rename = "type")]
    pub kind: RequestType,
    /// Effect key, case-folded to lowercase.
    #[serde(rename = "code", default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<u32>,
    #[serde(
        default,
        with = "opt_millis",
        skip_serializing_if = "Option::is_none"
    )]
    pub duration: Option<Duration>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<ParamValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<Target>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login: Option<String>,
    /// Remote function return value; only valid with
    /// [`RequestType::RemoteFunctionResult`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

impl Request {
    pub fn builder(kind: RequestType) -> RequestBuilder {
        RequestBuilder::new(kind)
    }

    /// The purchased quantity; defaults to 1 when the field is absent.
    pub fn quantity(&self) -> u32 {
        self.quantity.unwrap_or(1)
    }

    /// Enforce the construction invariants on a request, typically one that
    /// arrived over the wire.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.kind.is_effect() {
            if self.id == 0 {
                return Err(ValidationError::MissingEffectRequestId);
            }
            if self.effect.as_deref().is_none_or(str::is_empty) {
                return Err(ValidationError::MissingEffect);
            }
            if self.viewer.as_deref().is_none_or(str::is_empty) {
                return Err(ValidationError::MissingViewer);
            }
        }
        if self.quantity == Some(0) {
            return Err(ValidationError::ZeroQuantity);
        }
        if self.value.is_some() && self.kind != RequestType::RemoteFunctionResult {
            return Err(ValidationError::UnexpectedValue);
        }
        Ok(())
    }
}

/// Fluent constructor for [`Request`]; `build` runs the validation pass.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    request: Request,
}

impl RequestBuilder {
    pub fn new(kind: RequestType) -> Self {
        RequestBuilder {
            request: Request {
                id: 0,
                kind,
                effect: None,
                viewer: None,
                message: None,
                cost: None,
                duration: None,
                parameters: Vec::new(),
                quantity: None,
                targets: Vec::new(),
                source: None,
                password: None,
                login: None,
                value: None,
            },
        }
    }

    pub fn id(mut self, id: u32) -> Self {
        self.request.id = id;
        self
    }

    /// Effect key; folded to lowercase here so registry lookups and wire
    /// packets always agree.
    pub fn effect(mut self, effect: impl AsRef<str>) -> Self {
        self.request.effect = Some(effect.as_ref().to_lowercase());
        self
    }

    pub fn viewer(mut self, viewer: impl Into<String>) -> Self {
        self.request.viewer = Some(viewer.into());
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.request.message = Some(message.into());
        self
    }

    pub fn cost(mut self, cost: u32) -> Self {
        self.request.cost = Some(cost);
        self
    }

    pub fn duration(mut self, duration: Duration) -> Self {
        self.request.duration = Some(duration);
        self
    }

    pub fn parameter(mut self, value: ParamValue) -> Self {
        self.request.parameters.push(value);
        self
    }

    pub fn quantity(mut self, quantity: u32) -> Self {
        self.request.quantity = Some(quantity);
        self
    }

    pub fn target(mut self, target: Target) -> Self {
        self.request.targets.push(target);
        self
    }

    pub fn source(mut self, source: Source) -> Self {
        self.request.source = Some(source);
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.request.password = Some(password.into());
        self
    }

    pub fn login(mut self, login: impl Into<String>) -> Self {
        self.request.login = Some(login.into());
        self
    }

    pub fn value(mut self, value: serde_json::Value) -> Self {
        self.request.value = Some(value);
        self
    }

    pub fn build(self) -> Result<Request, ValidationError> {
        self.request.validate()?;
        Ok(self.request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effect_requests_require_a_positive_id() {
        let missing_id = Request::builder(RequestType::Start)
            .effect("summon")
            .viewer("v")
            .build();
        assert_eq!(missing_id.unwrap_err(), ValidationError::MissingEffectRequestId);
    }

    #[test]
    fn effect_requests_require_effect_and_viewer() {
        let missing_effect = Request::builder(RequestType::Start).id(1).viewer("v").build();
        assert_eq!(missing_effect.unwrap_err(), ValidationError::MissingEffect);

        let missing_viewer = Request::builder(RequestType::Start)
            .id(1)
            .effect("summon")
            .build();
        assert_eq!(missing_viewer.unwrap_err(), ValidationError::MissingViewer);

        let ok = Request::builder(RequestType::Start)
            .id(1)
            .effect("summon")
            .viewer("qixils")
            .build()
            .unwrap();
        assert_eq!(ok.effect.as_deref(), Some("summon"));
    }

    #[test]
    fn effect_keys_fold_to_lowercase() {
        let request = Request::builder(RequestType::Stop)
            .id(2)
            .effect("Disable_Jump")
            .viewer("v")
            .build()
            .unwrap();
        assert_eq!(request.effect.as_deref(), Some("disable_jump"));
    }

    #[test]
    fn quantity_defaults_to_one_and_rejects_zero() {
        let request = Request::builder(RequestType::KeepAlive).build().unwrap();
        assert_eq!(request.quantity(), 1);

        let zero = Request::builder(RequestType::Start)
            .id(1)
            .effect("e")
            .viewer("v")
            .quantity(0)
            .build();
        assert_eq!(zero.unwrap_err(), ValidationError::ZeroQuantity);
    }

    #[test]
    fn value_is_rejected_outside_remote_function_results() {
        let bad = Request::builder(RequestType::KeepAlive)
            .value(serde_json::json!(3))
            .build();
        assert_eq!(bad.unwrap_err(), ValidationError::UnexpectedValue);

        Request::builder(RequestType::RemoteFunctionResult)
            .value(serde_json::json!(3))
            .build()
            .unwrap();
    }

    #[test]
    fn negative_wire_duration_is_rejected() {
        let err = serde_json::from_str::<Request>(r#"{"id":1,"type":1,"duration":-1000}"#);
        assert!(err.is_err());
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let request: Request =
            serde_json::from_str(r#"{"id":0,"type":255,"somethingNew":true}"#).unwrap();
        assert_eq!(request.kind, RequestType::KeepAlive);
    }
}
