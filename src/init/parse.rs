// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Deserializer};
use std::error::Error;
use std::net::SocketAddr;
use std::time::Duration;

/// Parse an endpoint
pub fn parse_endpoint(s: &str) -> Result<SocketAddr, Box<dyn Error + Send + Sync + 'static>> {
    // Use actual localhost address instead of localhost name
    let s = if s.starts_with("localhost:") {
        s.replace("localhost:", "127.0.0.1:")
    } else {
        s.to_string()
    };
    let sa: SocketAddr = s.parse()?;
    Ok(sa)
}

// Durations are written as humantime strings ("800ms", "5s"), or as a bare integer
// of milliseconds. Environment overrides of integer-looking values arrive as numbers.
#[derive(Deserialize)]
#[serde(untagged)]
enum DurationValue {
    Millis(u64),
    Text(String),
}

pub(crate) fn deser_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    match DurationValue::deserialize(deserializer)? {
        DurationValue::Millis(ms) => Ok(Duration::from_millis(ms)),
        DurationValue::Text(s) => {
            let s = s.trim();
            if let Ok(ms) = s.parse::<u64>() {
                return Ok(Duration::from_millis(ms));
            }
            humantime::parse_duration(s)
                .map_err(|e| serde::de::Error::custom(format!("invalid duration `{}`: {}", s, e)))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio_test::assert_ok;

    #[test]
    fn endpoint_parse() {
        let sa = parse_endpoint("localhost:55678");
        assert_ok!(sa);
        let sa = sa.unwrap();
        assert!(sa.is_ipv4());
        assert_eq!("127.0.0.1", sa.ip().to_string());
        assert_eq!(55678, sa.port());

        let sa = parse_endpoint("[::1]:55679");
        assert_ok!(sa);
        let sa = sa.unwrap();
        assert!(sa.is_ipv6());
        assert_eq!("::1", sa.ip().to_string());

        let sa = parse_endpoint("0.0.0.0:1234");
        assert_ok!(sa);
        assert_eq!("0.0.0.0", sa.unwrap().ip().to_string());

        assert!(parse_endpoint("localhost").is_err());
        assert!(parse_endpoint("example.com:80").is_err());
    }

    #[derive(Deserialize, Debug)]
    struct DurationConfig {
        #[serde(deserialize_with = "deser_duration")]
        value: Duration,
    }

    fn from_yaml(yaml: &str) -> Result<DurationConfig, figment::Error> {
        use figment::Figment;
        use figment::providers::{Format, Yaml};
        Figment::new().merge(Yaml::string(yaml)).extract()
    }

    #[test]
    fn duration_from_humantime_string() {
        assert_eq!(Duration::from_millis(800), from_yaml("value: 800ms").unwrap().value);
        assert_eq!(Duration::from_secs(90), from_yaml("value: 1m 30s").unwrap().value);
        assert_eq!(Duration::ZERO, from_yaml("value: 0s").unwrap().value);
    }

    #[test]
    fn duration_from_integer_millis() {
        assert_eq!(Duration::from_millis(1500), from_yaml("value: 1500").unwrap().value);
        assert_eq!(Duration::from_millis(250), from_yaml("value: \"250\"").unwrap().value);
    }

    #[test]
    fn invalid_duration() {
        let err = from_yaml("value: soon").unwrap_err();
        assert!(err.to_string().contains("invalid duration"));
    }
}
