use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Identity of a viewer or platform endpoint an effect applies to.
///
/// Every field is optional on the wire; an empty object is a valid (if
/// useless) target. The platform service ("TWITCH", "YOUTUBE", ...) is
/// carried under the `source` key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(rename = "source", default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
}

impl Target {
    /// True when this target and `other` plausibly name the same identity:
    /// matching ids on the same service, or matching logins.
    pub fn overlaps(&self, other: &Target) -> bool {
        if let (Some(a), Some(b)) = (&self.id, &other.id) {
            if a == b && self.service == other.service {
                return true;
            }
        }
        matches!((&self.login, &other.login), (Some(a), Some(b)) if a.eq_ignore_ascii_case(b))
    }
}

/// Originator of a request: the target identity of the purchasing viewer plus
/// the network endpoint it arrived from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    #[serde(flatten)]
    pub viewer: Target,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Target>,
}
