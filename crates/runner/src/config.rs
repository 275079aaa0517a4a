//! Runner configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::HarnessResult;

/// Default number of concurrent builds
pub const DEFAULT_PARALLEL: usize = 4;

/// Orchestrator configuration.
///
/// Every field has a default, so a `specrun.toml` only needs to name what
/// it changes. Command-line flags are applied on top of the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Maximum number of builds in flight
    pub parallel: usize,

    /// Leave servers running and binaries on disk after testing
    pub keep_alive: bool,

    /// Binary used by specs in prebuilt mode
    pub prebuilt_binary: Option<PathBuf>,

    /// Directory cargo is invoked from
    pub workspace_root: PathBuf,

    /// Build with `--release`
    pub release: bool,

    /// Whether we are running under CI (honours `skip_ci` on test cases)
    pub ci: bool,

    /// Per-request timeout for HTTP test cases
    #[serde(with = "duration")]
    pub request_timeout: Duration,

    /// Per-probe timeout while polling the readiness endpoint
    #[serde(with = "duration")]
    pub probe_timeout: Duration,

    /// Readiness poll cadence
    #[serde(with = "duration")]
    pub poll_interval: Duration,

    /// Timeout for CLI cases when the spec does not declare one
    #[serde(with = "duration")]
    pub default_cli_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            parallel: DEFAULT_PARALLEL,
            keep_alive: false,
            prebuilt_binary: None,
            workspace_root: PathBuf::from("."),
            release: false,
            ci: false,
            request_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(50),
            default_cli_timeout: Duration::from_secs(30),
        }
    }
}

impl RunnerConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml(text: &str) -> HarnessResult<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Load a configuration file
    pub fn from_file(path: &Path) -> HarnessResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }
}

/// Parse a human duration such as `30s`, `500ms`, `1m30s` or `1.5h`.
///
/// A bare number is read as seconds. The empty string is zero.
pub fn parse_duration(text: &str) -> Result<Duration, String> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(Duration::ZERO);
    }
    if let Ok(secs) = text.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = text;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| format!("invalid duration {text:?}: missing unit"))?;
        if num_len == 0 {
            return Err(format!("invalid duration {text:?}"));
        }
        let value: f64 = rest[..num_len]
            .parse()
            .map_err(|_| format!("invalid duration {text:?}"))?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos_per_unit = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            unit => return Err(format!("invalid duration {text:?}: unknown unit {unit:?}")),
        };
        rest = &rest[unit_len..];
        total += Duration::from_nanos((value * nanos_per_unit).round() as u64);
    }
    Ok(total)
}

fn format_duration(d: &Duration) -> String {
    if d.subsec_nanos() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Secs(u64),
    Text(String),
}

impl RawDuration {
    fn into_duration(self) -> Result<Duration, String> {
        match self {
            RawDuration::Secs(secs) => Ok(Duration::from_secs(secs)),
            RawDuration::Text(text) => parse_duration(&text),
        }
    }
}

/// Serde adapter for `Duration` fields written as human strings
pub mod duration {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_duration(d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        RawDuration::deserialize(deserializer)?
            .into_duration()
            .map_err(serde::de::Error::custom)
    }
}

/// Serde adapter for optional durations; zero is treated as unset
pub mod opt_duration {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        d: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => serializer.serialize_str(&format_duration(d)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let raw = Option::<RawDuration>::deserialize(deserializer)?;
        match raw {
            None => Ok(None),
            Some(raw) => {
                let d = raw.into_duration().map_err(serde::de::Error::custom)?;
                Ok((!d.is_zero()).then_some(d))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("30s", Duration::from_secs(30) ; "seconds")]
    #[test_case("500ms", Duration::from_millis(500) ; "millis")]
    #[test_case("2m", Duration::from_secs(120) ; "minutes")]
    #[test_case("1m30s", Duration::from_secs(90) ; "compound")]
    #[test_case("1.5s", Duration::from_millis(1500) ; "fractional")]
    #[test_case("45", Duration::from_secs(45) ; "bare seconds")]
    #[test_case("", Duration::ZERO ; "empty")]
    fn test_parse_duration(input: &str, expected: Duration) {
        assert_eq!(parse_duration(input).unwrap(), expected);
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert!(parse_duration("10 parsecs").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("10").is_ok());
        assert!(parse_duration("10x").is_err());
    }

    #[test]
    fn test_config_from_toml_overrides_defaults() {
        let config = RunnerConfig::from_toml(
            r#"
parallel = 2
keep_alive = true
request_timeout = "3s"
poll_interval = "20ms"
"#,
        )
        .unwrap();

        assert_eq!(config.parallel, 2);
        assert!(config.keep_alive);
        assert_eq!(config.request_timeout, Duration::from_secs(3));
        assert_eq!(config.poll_interval, Duration::from_millis(20));
        assert_eq!(config.default_cli_timeout, Duration::from_secs(30));
        assert!(config.prebuilt_binary.is_none());
    }
}
