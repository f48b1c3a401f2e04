//! Serde helpers for configuration payloads

/// Serialize an optional `Duration` as whole seconds. Absent values are
/// omitted by the containing struct's `skip_serializing_if`.
pub mod duration_secs_opt {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<u64>::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct TestConfig {
        #[serde(
            default,
            with = "super::duration_secs_opt",
            skip_serializing_if = "Option::is_none"
        )]
        timeout: Option<Duration>,
    }

    #[test]
    fn test_present_roundtrip() {
        let cfg = TestConfig {
            timeout: Some(Duration::from_secs(15)),
        };
        let json = serde_json::to_string(&cfg).unwrap();
        assert_eq!(json, r#"{"timeout":15}"#);
        assert_eq!(serde_json::from_str::<TestConfig>(&json).unwrap(), cfg);
    }

    #[test]
    fn test_absent_is_omitted() {
        let cfg = TestConfig { timeout: None };
        assert_eq!(serde_json::to_string(&cfg).unwrap(), "{}");
        assert_eq!(serde_json::from_str::<TestConfig>("{}").unwrap(), cfg);
    }
}
