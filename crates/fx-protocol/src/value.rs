use serde::{Deserialize, Serialize};

/// A single effect parameter as supplied by the streamer-side tooling.
///
/// Parameters arrive as an ordered JSON array of loosely typed scalars; the
/// untagged representation keeps the wire shape (`[5, "red", true]`) intact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

/// Three-valued knowledge about a fact learned from the wire, e.g. whether an
/// effect is available on the connected game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriState {
    True,
    False,
    #[default]
    Unknown,
}

impl From<bool> for TriState {
    fn from(value: bool) -> Self {
        if value { TriState::True } else { TriState::False }
    }
}

/// Serde adapter for optional durations carried as whole milliseconds.
///
/// Negative wire values are rejected at deserialization, so a malformed
/// duration never constructs.
pub(crate) mod opt_millis {
    use serde::{Deserialize, Deserializer, Serializer, de};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => {
                serializer.serialize_some(&u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        match Option::<i64>::deserialize(deserializer)? {
            None => Ok(None),
            Some(ms) if ms < 0 => Err(de::Error::custom("duration must not be negative")),
            Some(ms) => Ok(Some(Duration::from_millis(ms.unsigned_abs()))),
        }
    }
}
