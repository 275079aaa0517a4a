//! Orchestrator - build everything, then test each spec in order

use std::path::Path;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::builder::{BuildCoordinator, CargoCompiler, Compiler};
use crate::config::RunnerConfig;
use crate::error::HarnessResult;
use crate::executor::{self, CliInvocation};
use crate::results::{millis, ExampleResult, Results, TestResult};
use crate::server::{LaunchConfig, ServerHandle};
use crate::spec::{CliConfig, CliTestCase, ExecutionMode, ServerConfig, TestCase, TestSpec};

/// Drives a batch of specs through build, test and teardown
pub struct TestRunner<C = CargoCompiler> {
    config: RunnerConfig,
    builder: BuildCoordinator<C>,
}

impl TestRunner<CargoCompiler> {
    /// Runner that builds subjects with cargo from `config.workspace_root`
    pub fn new(config: RunnerConfig) -> Self {
        let compiler = CargoCompiler::new(config.workspace_root.clone(), config.release);
        Self::with_compiler(config, compiler)
    }
}

impl<C: Compiler> TestRunner<C> {
    pub fn with_compiler(config: RunnerConfig, compiler: C) -> Self {
        let builder = BuildCoordinator::new(compiler, config.parallel)
            .with_prebuilt(config.prebuilt_binary.clone());
        Self { config, builder }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Discover specs matching `patterns` and run them
    pub async fn run_patterns(
        &self,
        patterns: &[String],
        cancel: &CancellationToken,
    ) -> HarnessResult<Results> {
        let specs = TestSpec::load_all(patterns)?;
        self.run(&specs, cancel).await
    }

    /// Build every spec, then test them one at a time.
    ///
    /// A build failure aborts the batch. A server that fails to start only
    /// fails its own spec. After cancellation the remaining specs are left
    /// out of the totals entirely.
    pub async fn run(
        &self,
        specs: &[TestSpec],
        cancel: &CancellationToken,
    ) -> HarnessResult<Results> {
        let start = Instant::now();
        let artifacts = self.builder.build_all(specs, cancel).await?;

        info!("Running {} example(s)...", specs.len());

        let mut results = Results::default();
        for (spec, artifact) in specs.iter().zip(&artifacts) {
            if cancel.is_cancelled() {
                warn!("Cancelled; {} example(s) not run", specs.len() - results.examples.len());
                break;
            }

            let example = self.run_spec(spec, artifact.path(), cancel).await;
            if example.success() {
                info!("✓ {} ({} ms)", example.name, example.duration_ms);
            } else {
                error!(
                    "✗ {} - {}/{} failed",
                    example.name, example.failed, example.total
                );
            }
            results.push(example);

            if !self.config.keep_alive {
                artifact.cleanup();
            }
        }

        if !self.config.keep_alive {
            for artifact in &artifacts {
                artifact.cleanup();
            }
        }

        results.duration_ms = millis(start.elapsed());

        info!(
            "Test Results: {} passed, {} failed, {} skipped ({} ms)",
            results.passed, results.failed, results.skipped, results.duration_ms
        );
        Ok(results)
    }

    async fn run_spec(
        &self,
        spec: &TestSpec,
        binary: &Path,
        cancel: &CancellationToken,
    ) -> ExampleResult {
        let start = Instant::now();
        let mut example = ExampleResult::new(&spec.name, spec.total_tests());

        debug!("Running example: {} ({})", spec.name, spec.mode_name());

        match &spec.mode {
            ExecutionMode::Server { config, tests } => {
                self.run_server_spec(config, tests, binary, cancel, &mut example)
                    .await
            }
            ExecutionMode::Cli { config, tests } | ExecutionMode::Prebuilt { config, tests } => {
                self.run_cli_spec(config, tests, binary, cancel, &mut example)
                    .await
            }
        }

        example.finish(start);
        example
    }

    async fn run_server_spec(
        &self,
        server_config: &ServerConfig,
        tests: &[TestCase],
        binary: &Path,
        cancel: &CancellationToken,
        example: &mut ExampleResult,
    ) {
        let launch = LaunchConfig::new(binary.to_path_buf(), server_config, &self.config);
        let mut server = match ServerHandle::spawn(launch, cancel).await {
            Ok(server) => server,
            Err(e) => {
                let error = format!("failed to start server: {e}");
                error!("{}: {}", example.name, error);
                example.fail_all(error, tests.iter().map(|t| t.name.as_str()));
                return;
            }
        };

        for tc in tests {
            if cancel.is_cancelled() {
                break;
            }
            let result = executor::run_http_case(&server, tc, cancel).await;
            log_test(&result);
            example.record(result);
        }

        if self.config.keep_alive {
            info!(
                "Leaving server running at {} (pid: {:?})",
                server.base_url(),
                server.pid()
            );
            return;
        }

        match server.stop().await {
            Ok(outcome) => debug!("Server stopped: {:?}", outcome),
            Err(e) => warn!("Failed to stop server: {}", e),
        }
    }

    async fn run_cli_spec(
        &self,
        cli_config: &CliConfig,
        tests: &[CliTestCase],
        binary: &Path,
        cancel: &CancellationToken,
        example: &mut ExampleResult,
    ) {
        let invocation = CliInvocation {
            binary,
            env: &cli_config.env,
            timeout: cli_config.timeout.unwrap_or(self.config.default_cli_timeout),
        };

        for tc in tests {
            if cancel.is_cancelled() {
                break;
            }

            let result = if tc.skip {
                TestResult::skipped(&tc.name, "skipped")
            } else if tc.skip_ci && self.config.ci {
                TestResult::skipped(&tc.name, "skipped in CI")
            } else {
                executor::run_cli_case(&invocation, tc, cancel).await
            };
            log_test(&result);
            example.record(result);
        }
    }
}

fn log_test(result: &TestResult) {
    if result.skipped {
        debug!("  - {} (skipped)", result.name);
    } else if result.passed {
        debug!("  ✓ {} ({} ms)", result.name, result.duration_ms);
    } else {
        error!(
            "  ✗ {} - {}",
            result.name,
            result.error.as_deref().unwrap_or("unknown error")
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HarnessError;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::time::Duration;

    /// Hands back a path without building anything
    struct NoCompile;

    #[async_trait]
    impl Compiler for NoCompile {
        async fn compile(&self, spec: &TestSpec) -> HarnessResult<PathBuf> {
            Err(HarnessError::Build {
                spec: spec.name.clone(),
                reason: "not expected to build".to_string(),
            })
        }
    }

    fn prebuilt_spec(yaml_tests: &str) -> TestSpec {
        TestSpec::from_yaml(&format!("name: sh\nprebuilt_tests:\n{yaml_tests}")).unwrap()
    }

    #[tokio::test]
    async fn test_build_failure_aborts_batch() {
        let spec = TestSpec::from_yaml("name: needs-build\ncli_tests:\n  - name: a\n").unwrap();
        let runner = TestRunner::with_compiler(RunnerConfig::default(), NoCompile);

        let err = runner
            .run(&[spec], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::Build { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_skips_count_as_passed() {
        let spec = prebuilt_spec(
            "  - name: always\n    skip: true\n  - name: ci-only\n    skip_ci: true\n",
        );
        let config = RunnerConfig {
            prebuilt_binary: Some(PathBuf::from("/definitely/not/here")),
            ci: true,
            ..Default::default()
        };
        let runner = TestRunner::with_compiler(config, NoCompile);

        let results = runner.run(&[spec], &CancellationToken::new()).await.unwrap();
        assert_eq!(results.total, 2);
        assert_eq!(results.passed, 2);
        assert_eq!(results.skipped, 2);
        assert!(results.success());
    }

    #[tokio::test]
    async fn test_cancelled_before_build_is_error() {
        let spec = prebuilt_spec("  - name: a\n");
        let config = RunnerConfig {
            prebuilt_binary: Some(PathBuf::from("/definitely/not/here")),
            ..Default::default()
        };
        let runner = TestRunner::with_compiler(config, NoCompile);
        let cancel = CancellationToken::new();
        cancel.cancel();

        // Cancellation before the build phase surfaces as an error
        let err = runner.run(&[spec], &cancel).await.unwrap_err();
        assert!(matches!(err, HarnessError::Cancelled), "{err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancelled_batch_excludes_untested_specs() {
        let first = TestSpec::from_yaml(
            r#"
name: first
prebuilt_tests:
  - name: quick
    args: ["-c", "echo ok"]
  - name: slow
    args: ["-c", "sleep 5"]
"#,
        )
        .unwrap();
        let second = TestSpec::from_yaml(
            "name: second\nprebuilt_tests:\n  - name: never\n    args: [\"-c\", \"true\"]\n",
        )
        .unwrap();
        let config = RunnerConfig {
            prebuilt_binary: Some(PathBuf::from("/bin/sh")),
            ..Default::default()
        };
        let runner = TestRunner::with_compiler(config, NoCompile);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let results = runner.run(&[first, second], &cancel).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(4));

        assert_eq!(results.examples.len(), 1);
        assert_eq!(results.examples[0].name, "first");
        assert_eq!((results.total, results.passed, results.failed), (2, 1, 1));
        assert_eq!(
            results.examples[0].tests[1].error.as_deref(),
            Some("cancelled")
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cli_cases_run_against_prebuilt_binary() {
        let spec = prebuilt_spec(
            r#"  - name: greets
    args: ["-c", "echo hello"]
    expect:
      stdout_contains: hello
  - name: wrong-exit
    args: ["-c", "exit 3"]
"#,
        );
        let config = RunnerConfig {
            prebuilt_binary: Some(PathBuf::from("/bin/sh")),
            ..Default::default()
        };
        let runner = TestRunner::with_compiler(config, NoCompile);

        let results = runner.run(&[spec], &CancellationToken::new()).await.unwrap();
        assert_eq!((results.total, results.passed, results.failed), (2, 1, 1));

        let example = &results.examples[0];
        assert_eq!(example.tests[1].error.as_deref(), Some("exit_code: expected 0, got 3"));
        // Pre-supplied binaries are never deleted
        assert!(Path::new("/bin/sh").exists());
    }
}
