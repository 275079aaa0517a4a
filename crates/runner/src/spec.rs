//! Declarative YAML test specification
//!
//! A `test.yaml` describes one test target: how to build it, and either a
//! list of HTTP cases (server mode) or a list of command-line cases (cli or
//! prebuilt mode). The raw document is validated into a [`TestSpec`] whose
//! [`ExecutionMode`] owns exactly one typed case list.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::opt_duration;
use crate::error::{HarnessError, HarnessResult};

/// File name looked up during discovery
pub const SPEC_FILE_NAME: &str = "test.yaml";

/// Environment overrides, applied in key order on top of the inherited environment
pub type EnvMap = BTreeMap<String, String>;

const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_PORT_ENV: &str = "PORT";
const DEFAULT_HEALTH_PATH: &str = "/health";

/// A validated test specification
#[derive(Debug, Clone)]
pub struct TestSpec {
    pub name: String,
    pub description: String,
    pub build: BuildConfig,
    pub mode: ExecutionMode,
    /// Directory the spec was loaded from (empty for in-memory specs)
    pub dir: PathBuf,
}

/// How the spec's subject is exercised
#[derive(Debug, Clone)]
pub enum ExecutionMode {
    /// Long-running HTTP service driven with requests
    Server {
        config: ServerConfig,
        tests: Vec<TestCase>,
    },
    /// Freshly built executable invoked once per case
    Cli {
        config: CliConfig,
        tests: Vec<CliTestCase>,
    },
    /// Like `Cli`, but the binary is supplied by the runner instead of built
    Prebuilt {
        config: CliConfig,
        tests: Vec<CliTestCase>,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Cargo package to build; empty means the manifest in the spec directory
    #[serde(default)]
    pub package: String,

    /// Binary target within the package
    #[serde(default)]
    pub bin: Option<String>,

    #[serde(default, with = "opt_duration")]
    pub timeout: Option<Duration>,
}

impl BuildConfig {
    pub fn timeout(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_BUILD_TIMEOUT)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Fixed listen port; unset means an ephemeral port is picked
    #[serde(default)]
    pub port: Option<u16>,

    /// Environment variable the port is handed over in
    #[serde(default)]
    pub port_env: Option<String>,

    /// Readiness endpoint path
    #[serde(default)]
    pub health_path: Option<String>,

    #[serde(default, with = "opt_duration")]
    pub startup_timeout: Option<Duration>,

    /// Grace period between the termination signal and a forced kill
    #[serde(default, with = "opt_duration")]
    pub shutdown_timeout: Option<Duration>,

    #[serde(default)]
    pub env: EnvMap,
}

impl ServerConfig {
    pub fn startup_timeout(&self) -> Duration {
        self.startup_timeout.unwrap_or(DEFAULT_STARTUP_TIMEOUT)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT)
    }

    pub fn port_env(&self) -> &str {
        self.port_env.as_deref().unwrap_or(DEFAULT_PORT_ENV)
    }

    pub fn health_path(&self) -> &str {
        self.health_path.as_deref().unwrap_or(DEFAULT_HEALTH_PATH)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CliConfig {
    /// Timeout for each case; unset falls back to the runner default
    #[serde(default, with = "opt_duration")]
    pub timeout: Option<Duration>,

    #[serde(default)]
    pub env: EnvMap,
}

/// A single HTTP test case
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestCase {
    pub name: String,

    #[serde(default = "default_method")]
    pub method: String,

    pub path: String,

    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Structured body, sent as JSON
    #[serde(default)]
    pub body: Option<Value>,

    #[serde(default)]
    pub body_raw: Option<String>,

    #[serde(default)]
    pub body_base64: Option<String>,

    #[serde(default)]
    pub expect: Expectation,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Expected HTTP response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Expectation {
    /// Exact status; 0 leaves the status unchecked
    #[serde(default)]
    pub status: u16,

    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    #[serde(default)]
    pub body_contains: String,

    #[serde(default)]
    pub body_equals: String,

    /// Field path to literal value or predicate object
    #[serde(default)]
    pub json: Map<String, Value>,
}

/// A single command-line test case
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CliTestCase {
    pub name: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub stdin: Option<String>,

    #[serde(default)]
    pub env: EnvMap,

    #[serde(default)]
    pub skip: bool,

    /// Skip when running under CI
    #[serde(default)]
    pub skip_ci: bool,

    #[serde(default)]
    pub fixtures: Fixtures,

    #[serde(default)]
    pub expect: CliExpectation,
}

impl CliTestCase {
    /// Whether the case needs its own scratch working directory
    pub fn needs_workdir(&self) -> bool {
        !self.fixtures.is_empty() || !self.expect.files.is_empty()
    }
}

/// Files and directories created before a CLI case runs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Fixtures {
    #[serde(default)]
    pub dirs: Vec<String>,

    /// Relative path to file content
    #[serde(default)]
    pub files: BTreeMap<String, String>,
}

impl Fixtures {
    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty() && self.files.is_empty()
    }
}

/// Expected process outcome
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CliExpectation {
    #[serde(default)]
    pub exit_code: i32,

    #[serde(default)]
    pub stdout_contains: String,

    #[serde(default)]
    pub stdout_equals: String,

    #[serde(default)]
    pub stderr_contains: String,

    #[serde(default)]
    pub stderr_equals: String,

    /// Relative path to expectation, checked after the process exits
    #[serde(default)]
    pub files: BTreeMap<String, FileExpect>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileExpect {
    #[serde(default = "default_true")]
    pub exists: bool,

    #[serde(default)]
    pub contains: String,
}

fn default_true() -> bool {
    true
}

/// The document as written, before mode validation
#[derive(Debug, Deserialize)]
struct RawSpec {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    build: BuildConfig,
    #[serde(default)]
    server: Option<ServerConfig>,
    #[serde(default)]
    tests: Vec<TestCase>,
    #[serde(default)]
    cli: Option<CliConfig>,
    #[serde(default)]
    cli_tests: Vec<CliTestCase>,
    #[serde(default)]
    prebuilt: Option<CliConfig>,
    #[serde(default)]
    prebuilt_tests: Vec<CliTestCase>,
}

impl TryFrom<RawSpec> for TestSpec {
    type Error = HarnessError;

    fn try_from(raw: RawSpec) -> HarnessResult<Self> {
        let invalid = |reason: String| HarnessError::InvalidSpec {
            spec: raw.name.clone(),
            reason,
        };

        let is_cli = raw.cli.is_some() || !raw.cli_tests.is_empty();
        let is_prebuilt = raw.prebuilt.is_some() || !raw.prebuilt_tests.is_empty();
        let is_server = raw.server.is_some() || !raw.tests.is_empty();

        let modes = [is_server, is_cli, is_prebuilt].iter().filter(|m| **m).count();
        if modes > 1 {
            return Err(invalid(
                "exactly one of server/tests, cli/cli_tests or prebuilt/prebuilt_tests may be set"
                    .to_string(),
            ));
        }

        for tc in &raw.tests {
            let bodies = [
                tc.body.is_some(),
                tc.body_raw.is_some(),
                tc.body_base64.is_some(),
            ];
            if bodies.iter().filter(|b| **b).count() > 1 {
                return Err(invalid(format!(
                    "test '{}' sets more than one of body, body_raw, body_base64",
                    tc.name
                )));
            }
        }

        let declared = if is_cli {
            raw.cli_tests.len()
        } else if is_prebuilt {
            raw.prebuilt_tests.len()
        } else {
            raw.tests.len()
        };
        if declared == 0 {
            return Err(invalid(
                "no test cases declared (expected one of tests, cli_tests or prebuilt_tests)"
                    .to_string(),
            ));
        }

        let mode = if is_cli {
            ExecutionMode::Cli {
                config: raw.cli.unwrap_or_default(),
                tests: raw.cli_tests,
            }
        } else if is_prebuilt {
            ExecutionMode::Prebuilt {
                config: raw.prebuilt.unwrap_or_default(),
                tests: raw.prebuilt_tests,
            }
        } else {
            ExecutionMode::Server {
                config: raw.server.unwrap_or_default(),
                tests: raw.tests,
            }
        };

        Ok(TestSpec {
            name: raw.name,
            description: raw.description,
            build: raw.build,
            mode,
            dir: PathBuf::new(),
        })
    }
}

impl TestSpec {
    /// Parse a test spec from YAML string
    pub fn from_yaml(yaml: &str) -> HarnessResult<Self> {
        let raw: RawSpec = serde_yaml::from_str(yaml)?;
        Self::try_from(raw)
    }

    /// Parse a test spec from a YAML file
    pub fn from_file(path: &Path) -> HarnessResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut spec = Self::from_yaml(&content).map_err(|e| {
            HarnessError::SpecParse(format!("loading {}: {}", path.display(), e))
        })?;
        spec.dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Ok(spec)
    }

    /// Discover and load every spec matching `patterns`
    pub fn load_all(patterns: &[String]) -> HarnessResult<Vec<Self>> {
        let paths = discover(patterns)?;
        if paths.is_empty() {
            return Err(HarnessError::NoSpecs);
        }
        paths.iter().map(|p| Self::from_file(p)).collect()
    }

    /// Number of declared test cases
    pub fn total_tests(&self) -> usize {
        match &self.mode {
            ExecutionMode::Server { tests, .. } => tests.len(),
            ExecutionMode::Cli { tests, .. } | ExecutionMode::Prebuilt { tests, .. } => {
                tests.len()
            }
        }
    }

    pub fn is_server(&self) -> bool {
        matches!(self.mode, ExecutionMode::Server { .. })
    }

    /// Whether the binary comes from the runner rather than a build
    pub fn is_prebuilt(&self) -> bool {
        matches!(self.mode, ExecutionMode::Prebuilt { .. })
    }

    pub fn mode_name(&self) -> &'static str {
        match self.mode {
            ExecutionMode::Server { .. } => "server",
            ExecutionMode::Cli { .. } => "cli",
            ExecutionMode::Prebuilt { .. } => "prebuilt",
        }
    }
}

/// Find spec files.
///
/// `dir/...` walks `dir` recursively for every `test.yaml`; any other pattern
/// names a directory holding a `test.yaml` (or the file itself). Results keep
/// pattern order with duplicates removed. No patterns means `./examples/...`.
pub fn discover(patterns: &[String]) -> HarnessResult<Vec<PathBuf>> {
    let defaults = ["./examples/...".to_string()];
    let patterns = if patterns.is_empty() { &defaults[..] } else { patterns };

    let mut seen = HashSet::new();
    let mut paths = Vec::new();
    let mut push = |path: PathBuf| {
        if seen.insert(path.clone()) {
            paths.push(path);
        }
    };

    for pattern in patterns {
        if let Some(base) = pattern.strip_suffix("/...") {
            let walker = walkdir::WalkDir::new(base).sort_by_file_name();
            for entry in walker {
                let entry = entry.map_err(|e| {
                    HarnessError::SpecParse(format!("walking {}: {}", base, e))
                })?;
                if entry.file_type().is_file() && entry.file_name() == SPEC_FILE_NAME {
                    push(entry.into_path());
                }
            }
        } else {
            let path = PathBuf::from(pattern);
            if path.is_file() {
                push(path);
            } else {
                let candidate = path.join(SPEC_FILE_NAME);
                if candidate.is_file() {
                    push(candidate);
                }
            }
        }
    }

    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_server_spec() {
        let yaml = r#"
name: hello-server
description: Greets people
build:
  package: hello
  timeout: 45s
server:
  startup_timeout: 2s
  env:
    GREETING: hi
tests:
  - name: greet
    path: /hello
    expect:
      status: 200
      json:
        ok: true
        user:
          age: {gte: 18}
  - name: post
    method: POST
    path: /echo
    body: {a: 1}
"#;
        let spec = TestSpec::from_yaml(yaml).unwrap();
        assert_eq!(spec.name, "hello-server");
        assert_eq!(spec.build.timeout(), Duration::from_secs(45));
        assert!(spec.is_server());
        assert_eq!(spec.total_tests(), 2);

        let ExecutionMode::Server { config, tests } = &spec.mode else {
            panic!("expected server mode");
        };
        assert_eq!(config.startup_timeout(), Duration::from_secs(2));
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(5));
        assert_eq!(config.port_env(), "PORT");
        assert_eq!(config.health_path(), "/health");
        assert_eq!(config.env.get("GREETING").map(String::as_str), Some("hi"));
        assert_eq!(tests[0].method, "GET");
        assert_eq!(tests[1].method, "POST");

        // Declared key order is preserved for deterministic error order
        let keys: Vec<&String> = tests[0].expect.json.keys().collect();
        assert_eq!(keys, ["ok", "user"]);
    }

    #[test]
    fn test_parse_cli_spec_with_defaults() {
        let yaml = r#"
name: stdin-echo
cli:
  env:
    MODE: test
cli_tests:
  - name: echo
    args: [hello]
    stdin: "abc"
    expect:
      stdout_contains: hello
  - name: failing
    args: [exit, "3"]
    skip_ci: true
    expect:
      exit_code: 3
"#;
        let spec = TestSpec::from_yaml(yaml).unwrap();
        assert_eq!(spec.mode_name(), "cli");
        assert_eq!(spec.build.timeout(), Duration::from_secs(30));

        let ExecutionMode::Cli { config, tests } = &spec.mode else {
            panic!("expected cli mode");
        };
        assert!(config.timeout.is_none());
        assert_eq!(tests[0].stdin.as_deref(), Some("abc"));
        assert_eq!(tests[0].expect.exit_code, 0);
        assert_eq!(tests[1].expect.exit_code, 3);
        assert!(tests[1].skip_ci);
    }

    #[test]
    fn test_cli_tests_without_cli_block_selects_cli_mode() {
        let yaml = r#"
name: implicit
cli_tests:
  - name: run
"#;
        let spec = TestSpec::from_yaml(yaml).unwrap();
        assert_eq!(spec.mode_name(), "cli");
    }

    #[test]
    fn test_parse_prebuilt_spec() {
        let yaml = r#"
name: tool
prebuilt:
  timeout: 2m
prebuilt_tests:
  - name: version
    args: [--version]
    fixtures:
      dirs: [out]
      files:
        in.txt: data
    expect:
      files:
        out/result.txt: {contains: done}
"#;
        let spec = TestSpec::from_yaml(yaml).unwrap();
        assert!(spec.is_prebuilt());

        let ExecutionMode::Prebuilt { config, tests } = &spec.mode else {
            panic!("expected prebuilt mode");
        };
        assert_eq!(config.timeout, Some(Duration::from_secs(120)));
        assert!(tests[0].needs_workdir());
        let expect = &tests[0].expect.files["out/result.txt"];
        assert!(expect.exists);
        assert_eq!(expect.contains, "done");
    }

    #[test]
    fn test_mixed_modes_rejected() {
        let yaml = r#"
name: confused
tests:
  - name: http
    path: /
cli_tests:
  - name: cli
"#;
        let err = TestSpec::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, HarnessError::InvalidSpec { .. }), "{err}");
    }

    #[test]
    fn test_multiple_bodies_rejected() {
        let yaml = r#"
name: bodies
tests:
  - name: both
    method: POST
    path: /echo
    body: {a: 1}
    body_raw: "a=1"
"#;
        let err = TestSpec::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("more than one of body"), "{err}");
    }

    #[test]
    fn test_spec_without_cases_is_rejected() {
        for yaml in [
            "name: empty\n",
            "name: typo\ncli_test:\n  - name: a\n    args: [x]\n",
            "name: bare-server\nserver:\n  port: 8080\n",
            "name: bare-cli\ncli:\n  timeout: 5s\ncli_tests: []\n",
        ] {
            let err = TestSpec::from_yaml(yaml).unwrap_err();
            assert!(matches!(err, HarnessError::InvalidSpec { .. }), "{yaml}: {err}");
            assert!(err.to_string().contains("no test cases"), "{err}");
        }
    }

    #[test]
    fn test_zero_timeout_means_default() {
        let yaml = r#"
name: zeros
build:
  timeout: 0s
server:
  startup_timeout: ""
tests:
  - name: health
    path: /health
"#;
        let spec = TestSpec::from_yaml(yaml).unwrap();
        assert_eq!(spec.build.timeout(), Duration::from_secs(30));
        let ExecutionMode::Server { config, .. } = &spec.mode else {
            panic!("expected server mode");
        };
        assert_eq!(config.startup_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_discover_walks_and_dedupes() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        for dir in ["b/nested", "a", "c"] {
            std::fs::create_dir_all(root.join(dir)).unwrap();
        }
        let spec = |name: &str| format!("name: {name}\ncli_tests: [{{name: t}}]\n");
        std::fs::write(root.join("a/test.yaml"), spec("a")).unwrap();
        std::fs::write(root.join("b/nested/test.yaml"), spec("b")).unwrap();
        std::fs::write(root.join("c/other.yaml"), spec("c")).unwrap();

        let recursive = format!("{}/...", root.display());
        let direct = root.join("a").display().to_string();
        let paths = discover(&[recursive, direct]).unwrap();

        assert_eq!(paths.len(), 2);
        assert!(paths[0].ends_with("a/test.yaml"));
        assert!(paths[1].ends_with("b/nested/test.yaml"));

        let specs = TestSpec::load_all(&[root.join("a").display().to_string()]).unwrap();
        assert_eq!(specs[0].name, "a");
        assert!(specs[0].dir.ends_with("a"));
    }

    #[test]
    fn test_load_all_with_no_matches_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let err = TestSpec::load_all(&[tmp.path().display().to_string()]).unwrap_err();
        assert!(matches!(err, HarnessError::NoSpecs));
    }
}
