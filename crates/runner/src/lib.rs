//! specrun - declarative integration testing for executables
//!
//! This crate drives example programs through their public surface:
//! - Discovers and parses declarative YAML test specs (`test.yaml`)
//! - Builds every subject binary with bounded parallelism
//! - Spawns HTTP servers, waits for readiness, and stops them gracefully
//! - Invokes command-line programs with arguments, environment and stdin
//! - Compares responses and process output against structural expectations
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    TestRunner (orchestrator)                │
//! ├─────────────────────────────────────────────────────────────┤
//! │  BuildCoordinator                                           │
//! │    └── build_all(specs) -> [Artifact]   (≤ parallel)        │
//! │  per spec, in order:                                        │
//! │    server mode                                              │
//! │      ├── ServerHandle::spawn() -> wait for /health          │
//! │      ├── run_http_case(case) -> TestResult                  │
//! │      └── ServerHandle::stop()  (SIGTERM, grace, kill)       │
//! │    cli / prebuilt mode                                      │
//! │      └── run_cli_case(case) -> TestResult                   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  assert                                                     │
//! │    ├── assert_response(response, expectation)               │
//! │    ├── assert_cli_output(stdout, stderr, code, expectation) │
//! │    └── assert_json_fields(actual, expected)  (predicates)   │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod assert;
pub mod builder;
pub mod config;
pub mod error;
pub mod executor;
pub mod results;
pub mod runner;
pub mod server;
pub mod spec;

pub use assert::{AssertionError, Response};
pub use builder::{Artifact, BuildCoordinator, CargoCompiler, Compiler};
pub use config::RunnerConfig;
pub use error::{HarnessError, HarnessResult};
pub use results::{ExampleResult, Results, TestResult, TestResultDetails};
pub use runner::TestRunner;
pub use server::{LaunchConfig, ServerHandle, StopOutcome};
pub use spec::{ExecutionMode, TestSpec};
