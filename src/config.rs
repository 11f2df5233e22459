//! Registry credentials and tunables loaded from the YAML config file

use crate::errors::ImageError;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, io::Read, time::Duration};

pub const DEFAULT_MIN_TEMPORARY_AGE: Duration = Duration::from_secs(5 * 60);

/// Username and password for one registry server
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
}

/// Contents of the porter config file
///
/// Decoding is strict: unknown keys are rejected so that a typo in the
/// config file fails loudly instead of silently losing credentials.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub auths: BTreeMap<String, AuthConfig>,
    #[serde(
        rename = "minTemporaryAge",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub min_temporary_age: Option<String>,
}

impl Config {
    /// Strictly decode a config file
    pub fn load<R: Read>(reader: R) -> Result<Config, ImageError> {
        Ok(serde_yaml::from_reader(reader)?)
    }

    /// Look up credentials for a registry server, if configured
    pub fn credentials_for(&self, registry: &str) -> Option<&AuthConfig> {
        self.auths.get(registry)
    }

    /// Minimum age before a temporary file may be garbage collected
    pub fn min_temporary_age(&self) -> Duration {
        self.min_temporary_age
            .as_deref()
            .and_then(|s| parse_duration(s).ok())
            .filter(|d| !d.is_zero())
            .unwrap_or(DEFAULT_MIN_TEMPORARY_AGE)
    }
}

/// Parse a duration written as `300`, `90s`, `5m`, or `1h`
pub fn parse_duration(s: &str) -> Result<Duration, ImageError> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| ImageError::IllegalFormat(format!("invalid duration: {:?}", s)))?;
    let seconds = match unit {
        "" | "s" => value,
        "m" => value * 60,
        "h" => value * 60 * 60,
        _ => {
            return Err(ImageError::IllegalFormat(format!(
                "invalid duration unit: {:?}",
                s
            )))
        }
    };
    Ok(Duration::from_secs(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_config_with_auths() {
        let yaml = "\
auths:
  registry-1.docker.io:
    username: somebody
    password: hunter2
minTemporaryAge: 10m
";
        let config = Config::load(yaml.as_bytes()).unwrap();
        let auth = config.credentials_for("registry-1.docker.io").unwrap();
        assert_eq!(auth.username, "somebody");
        assert_eq!(auth.password, "hunter2");
        assert!(config.credentials_for("quay.io").is_none());
        assert_eq!(config.min_temporary_age(), Duration::from_secs(600));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let yaml = "auths: {}\nmispeled: true\n";
        assert!(Config::load(yaml.as_bytes()).is_err());
    }

    #[test]
    fn default_min_temporary_age() {
        let config = Config::default();
        assert_eq!(config.min_temporary_age(), DEFAULT_MIN_TEMPORARY_AGE);
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("300").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert!(parse_duration("5 minutes").is_err());
        assert!(parse_duration("").is_err());
    }
}
