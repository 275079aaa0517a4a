//! Build coordination - producing one executable per spec with bounded parallelism

use async_trait::async_trait;
use futures::future::join_all;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{HarnessError, HarnessResult};
use crate::spec::TestSpec;

/// Turns a spec's build descriptor into an executable on disk
#[async_trait]
pub trait Compiler: Send + Sync {
    /// Build the spec's subject and return a path the caller owns
    async fn compile(&self, spec: &TestSpec) -> HarnessResult<PathBuf>;
}

/// An executable ready to be tested
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    path: PathBuf,
    owned: bool,
}

impl Artifact {
    /// A temporary binary produced by a build; removed by [`Artifact::cleanup`]
    pub fn built(path: PathBuf) -> Self {
        Self { path, owned: true }
    }

    /// A binary supplied from outside; never removed
    pub fn prebuilt(path: PathBuf) -> Self {
        Self { path, owned: false }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_owned(&self) -> bool {
        self.owned
    }

    /// Delete the binary if this run produced it
    pub fn cleanup(&self) {
        if !self.owned {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Builds every spec's subject, at most `parallel` at a time
pub struct BuildCoordinator<C> {
    compiler: C,
    parallel: usize,
    prebuilt: Option<PathBuf>,
}

impl<C: Compiler> BuildCoordinator<C> {
    pub fn new(compiler: C, parallel: usize) -> Self {
        Self {
            compiler,
            parallel: parallel.max(1),
            prebuilt: None,
        }
    }

    /// Binary handed to specs in prebuilt mode.
    ///
    /// Made absolute when possible, since CLI cases may run in a scratch
    /// working directory.
    pub fn with_prebuilt(mut self, binary: Option<PathBuf>) -> Self {
        self.prebuilt = binary.map(|b| std::fs::canonicalize(&b).unwrap_or(b));
        self
    }

    /// Produce one artifact per spec, in spec order.
    ///
    /// Every build runs to completion before results are inspected. The
    /// first failure in spec order is returned, after deleting any binaries
    /// the successful builds produced.
    pub async fn build_all(
        &self,
        specs: &[TestSpec],
        cancel: &CancellationToken,
    ) -> HarnessResult<Vec<Artifact>> {
        info!("Building {} examples ({} at a time)", specs.len(), self.parallel);

        let gate = Semaphore::new(self.parallel);
        let units = specs.iter().map(|spec| self.build_one(spec, &gate, cancel));
        let results = join_all(units).await;

        let mut artifacts = Vec::with_capacity(results.len());
        let mut first_error = None;
        for result in results {
            match result {
                Ok(artifact) => artifacts.push(artifact),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            for artifact in &artifacts {
                artifact.cleanup();
            }
            return Err(e);
        }
        Ok(artifacts)
    }

    async fn build_one(
        &self,
        spec: &TestSpec,
        gate: &Semaphore,
        cancel: &CancellationToken,
    ) -> HarnessResult<Artifact> {
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(HarnessError::Cancelled),
            permit = gate.acquire() => permit.map_err(|_| HarnessError::Cancelled)?,
        };

        if spec.is_prebuilt() {
            return self
                .prebuilt
                .clone()
                .map(Artifact::prebuilt)
                .ok_or_else(|| HarnessError::MissingArtifact {
                    spec: spec.name.clone(),
                });
        }

        let limit = spec.build.timeout();
        debug!("Building {} (timeout {:?})", spec.name, limit);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(HarnessError::Cancelled),
            built = tokio::time::timeout(limit, self.compiler.compile(spec)) => match built {
                Ok(path) => path.map(Artifact::built),
                Err(_) => Err(HarnessError::BuildTimeout {
                    spec: spec.name.clone(),
                    timeout: limit,
                }),
            },
        }
    }
}

/// Builds subjects with `cargo build` and copies the binary somewhere private
#[derive(Debug, Clone)]
pub struct CargoCompiler {
    cargo: PathBuf,
    workspace_root: PathBuf,
    release: bool,
}

impl CargoCompiler {
    pub fn new(workspace_root: PathBuf, release: bool) -> Self {
        Self {
            cargo: PathBuf::from("cargo"),
            workspace_root,
            release,
        }
    }

    /// Use a specific cargo executable
    pub fn with_cargo(mut self, cargo: PathBuf) -> Self {
        self.cargo = cargo;
        self
    }

    fn command(&self, spec: &TestSpec) -> Command {
        let mut cmd = Command::new(&self.cargo);
        cmd.arg("build")
            .arg("--message-format=json-render-diagnostics")
            .current_dir(&self.workspace_root);

        if spec.build.package.is_empty() {
            cmd.arg("--manifest-path").arg(spec.dir.join("Cargo.toml"));
        } else {
            cmd.args(["-p", &spec.build.package]);
        }
        if let Some(bin) = &spec.build.bin {
            cmd.args(["--bin", bin]);
        }
        if self.release {
            cmd.arg("--release");
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Compiler for CargoCompiler {
    async fn compile(&self, spec: &TestSpec) -> HarnessResult<PathBuf> {
        let output = self.command(spec).output().await.map_err(|e| HarnessError::Build {
            spec: spec.name.clone(),
            reason: format!("failed to run {}: {}", self.cargo.display(), e),
        })?;

        if !output.status.success() {
            return Err(HarnessError::Build {
                spec: spec.name.clone(),
                reason: format!(
                    "cargo build failed: {}",
                    String::from_utf8_lossy(&output.stderr)
                ),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let built = find_executable(&stdout, spec.build.bin.as_deref()).ok_or_else(|| {
            HarnessError::Build {
                spec: spec.name.clone(),
                reason: "cargo build produced no executable".to_string(),
            }
        })?;

        let private = tempfile::Builder::new()
            .prefix("specrun-")
            .suffix(std::env::consts::EXE_SUFFIX)
            .tempfile()?
            .into_temp_path()
            .keep()
            .map_err(|e| e.error)?;
        tokio::fs::copy(&built, &private).await?;

        debug!("Built {} -> {}", spec.name, private.display());
        Ok(private)
    }
}

#[derive(Debug, Deserialize)]
struct CargoMessage {
    reason: String,
    #[serde(default)]
    target: Option<CargoTarget>,
    #[serde(default)]
    executable: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct CargoTarget {
    name: String,
    #[serde(default)]
    kind: Vec<String>,
}

/// Pick the binary out of cargo's JSON message stream; the last match wins
fn find_executable(messages: &str, bin: Option<&str>) -> Option<PathBuf> {
    messages
        .lines()
        .filter_map(|line| serde_json::from_str::<CargoMessage>(line).ok())
        .filter(|msg| msg.reason == "compiler-artifact")
        .filter_map(|msg| {
            let target = msg.target?;
            let is_bin = target.kind.iter().any(|k| k == "bin");
            let wanted = bin.map_or(true, |b| b == target.name);
            (is_bin && wanted).then_some(msg.executable).flatten()
        })
        .last()
}
