//! Command-line arguments and how they layer over `specrun.toml`

use anyhow::Context;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Duration;

use specrun::config::parse_duration;
use specrun::RunnerConfig;

use crate::output::OutputFormat;

/// Config file picked up from the working directory when `--config` is absent
pub const DEFAULT_CONFIG_FILE: &str = "specrun.toml";

/// specrun - build, launch and verify example programs
#[derive(Parser, Debug)]
#[command(name = "specrun")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Spec locations; `dir/...` searches recursively [default: ./examples/...]
    #[arg(value_name = "PATTERN")]
    pub patterns: Vec<String>,

    /// Maximum number of concurrent builds
    #[arg(short = 'j', long)]
    pub parallel: Option<usize>,

    /// Leave servers running and built binaries on disk
    #[arg(long)]
    pub keep_alive: bool,

    /// Binary used for specs in prebuilt mode
    #[arg(long, value_name = "PATH")]
    pub prebuilt_binary: Option<PathBuf>,

    /// Configuration file
    #[arg(short, long, env = "SPECRUN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory cargo is run from
    #[arg(long)]
    pub workspace_root: Option<PathBuf>,

    /// Build in release mode
    #[arg(long)]
    pub release: bool,

    /// Run only specs whose name contains this string
    #[arg(short, long)]
    pub name: Option<String>,

    /// Deadline for the whole run (e.g. "10m")
    #[arg(long, value_parser = parse_duration)]
    pub timeout: Option<Duration>,

    /// Timeout for CLI cases whose spec does not set one
    #[arg(long, value_parser = parse_duration)]
    pub cli_timeout: Option<Duration>,

    /// Honour `skip_ci` (also enabled by a non-empty CI variable)
    #[arg(long)]
    pub ci: bool,

    /// Output format
    #[arg(short, long, value_enum, default_value_t)]
    pub format: OutputFormat,

    /// Write test-results.json into this directory
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Load the config file (if any) and apply flags on top of it
    pub fn runner_config(&self) -> anyhow::Result<RunnerConfig> {
        let mut config = match &self.config {
            Some(path) => load(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
                load(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => RunnerConfig::default(),
        };

        if let Some(parallel) = self.parallel {
            config.parallel = parallel;
        }
        if let Some(binary) = &self.prebuilt_binary {
            config.prebuilt_binary = Some(binary.clone());
        }
        if let Some(root) = &self.workspace_root {
            config.workspace_root = root.clone();
        }
        if let Some(timeout) = self.cli_timeout {
            config.default_cli_timeout = timeout;
        }
        config.keep_alive |= self.keep_alive;
        config.release |= self.release;
        config.ci |= self.ci || ci_enabled(std::env::var("CI").ok().as_deref());

        Ok(config)
    }
}

fn load(path: &Path) -> anyhow::Result<RunnerConfig> {
    RunnerConfig::from_file(path).with_context(|| format!("loading {}", path.display()))
}

/// Any non-empty value other than "false"/"0" counts as CI
pub fn ci_enabled(value: Option<&str>) -> bool {
    match value.map(str::trim) {
        None | Some("") => false,
        Some(v) => !v.eq_ignore_ascii_case("false") && v != "0",
    }
}
