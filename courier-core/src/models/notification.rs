use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A notification payload as carried on the pub/sub channels.
///
/// The wire format is a UTF-8 JSON object; no shape beyond that is
/// enforced. Anything that is not a JSON object (arrays, scalars,
/// invalid UTF-8, truncated JSON) fails to decode and is dropped by the
/// relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotificationPayload(Map<String, Value>);

impl NotificationPayload {
    /// Decode a payload from raw channel bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Serialize back to the wire representation
    #[must_use]
    pub fn to_json(&self) -> String {
        // A Map of Values cannot fail to serialize
        serde_json::to_string(&self.0).unwrap_or_default()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Map<String, Value>> for NotificationPayload {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl std::str::FromStr for NotificationPayload {
    type Err = serde_json::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decodes_json_object() {
        let payload: NotificationPayload = r#"{"msg":"hi"}"#.parse().unwrap();
        assert_eq!(payload.get("msg"), Some(&Value::String("hi".to_string())));
    }

    #[test]
    fn test_rejects_non_object_json() {
        assert!(r#"["not","an","object"]"#.parse::<NotificationPayload>().is_err());
        assert!("42".parse::<NotificationPayload>().is_err());
        assert!(r#""just a string""#.parse::<NotificationPayload>().is_err());
    }

    #[test]
    fn test_rejects_invalid_json() {
        assert!("{not json".parse::<NotificationPayload>().is_err());
        assert!(NotificationPayload::from_bytes(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn test_round_trips_to_json() {
        let payload: NotificationPayload = r#"{"a":1,"b":"two"}"#.parse().unwrap();
        let reparsed: NotificationPayload = payload.to_json().parse().unwrap();
        assert_eq!(payload, reparsed);
    }
}
