//! Test execution
//!
//! One function per mode: an HTTP case is a single request against a live
//! [`ServerHandle`]; a CLI case is a single invocation of the binary. Both
//! return a [`TestResult`] and never an error: transport and process
//! failures are scoped to the case that hit them.

use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::assert::{self, format_errors, Response};
use crate::results::{TestResult, TestResultDetails};
use crate::server::{Capture, ServerHandle, DRAIN_TIMEOUT};
use crate::spec::{CliTestCase, EnvMap, Fixtures, TestCase};

/// Send one request and check the response
pub async fn run_http_case(
    server: &ServerHandle,
    case: &TestCase,
    cancel: &CancellationToken,
) -> TestResult {
    let start = Instant::now();
    let method = case.method.to_ascii_uppercase();
    let fail = |error: String, status: Option<u16>, body: Option<String>| {
        TestResult::failed(
            &case.name,
            error,
            start.elapsed(),
            Some(TestResultDetails::Http {
                method: method.clone(),
                path: case.path.clone(),
                status,
                body,
            }),
        )
    };

    debug!("{} {} ({})", method, case.path, case.name);

    let request = match build_request(server.client(), &server.url(&case.path), case) {
        Ok(request) => request,
        Err(e) => return fail(format!("building request: {e}"), None, None),
    };

    let sent = tokio::select! {
        _ = cancel.cancelled() => return fail("cancelled".to_string(), None, None),
        sent = server.client().execute(request) => sent,
    };
    let resp = match sent {
        Ok(resp) => resp,
        Err(e) => return fail(format!("request failed: {e}"), None, None),
    };

    let status = resp.status().as_u16();
    let headers = resp.headers().clone();
    let body = match resp.bytes().await {
        Ok(body) => body.to_vec(),
        Err(e) => return fail(format!("reading response: {e}"), Some(status), None),
    };

    let response = Response {
        status,
        headers,
        body,
    };
    let errors = assert::assert_response(&response, &case.expect);
    if errors.is_empty() {
        TestResult::passed(&case.name, start.elapsed())
    } else {
        fail(format_errors(&errors), Some(status), Some(response.text()))
    }
}

/// Body precedence: structured JSON, then raw text, then base64 bytes.
/// Declared headers replace any default of the same name.
fn build_request(
    client: &reqwest::Client,
    url: &str,
    case: &TestCase,
) -> Result<reqwest::Request, String> {
    let method = Method::from_bytes(case.method.to_ascii_uppercase().as_bytes())
        .map_err(|_| format!("invalid method {:?}", case.method))?;
    let mut builder = client.request(method, url);

    if let Some(body) = &case.body {
        let bytes = serde_json::to_vec(body).map_err(|e| e.to_string())?;
        builder = builder.header(CONTENT_TYPE, "application/json").body(bytes);
    } else if let Some(raw) = &case.body_raw {
        builder = builder.body(raw.clone());
    } else if let Some(encoded) = &case.body_base64 {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| format!("decoding body_base64: {e}"))?;
        builder = builder.body(bytes);
    }

    let mut headers = HeaderMap::new();
    for (key, value) in &case.headers {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|e| format!("header {key:?}: {e}"))?;
        let value = HeaderValue::from_str(value).map_err(|e| format!("header {key:?}: {e}"))?;
        headers.insert(name, value);
    }

    builder.headers(headers).build().map_err(|e| e.to_string())
}

/// Where and how a CLI case's binary is invoked
#[derive(Debug, Clone, Copy)]
pub struct CliInvocation<'a> {
    pub binary: &'a Path,
    /// Spec-level environment; case-level entries override it
    pub env: &'a EnvMap,
    pub timeout: Duration,
}

enum Waited {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
    Failed(std::io::Error),
}

/// Run the binary once and check its output
pub async fn run_cli_case(
    invocation: &CliInvocation<'_>,
    case: &CliTestCase,
    cancel: &CancellationToken,
) -> TestResult {
    let start = Instant::now();
    let stdout = Capture::default();
    let stderr = Capture::default();
    let fail = |error: String, exit_code: i32| {
        TestResult::failed(
            &case.name,
            error,
            start.elapsed(),
            Some(TestResultDetails::Cli {
                args: case.args.clone(),
                exit_code,
                stdout: stdout.contents(),
                stderr: stderr.contents(),
            }),
        )
    };

    debug!("Running {} {:?} ({})", invocation.binary.display(), case.args, case.name);

    let workdir = if case.needs_workdir() {
        match prepare_workdir(&case.fixtures) {
            Ok(dir) => Some(dir),
            Err(e) => return fail(format!("setting up fixtures: {e}"), -1),
        }
    } else {
        None
    };

    let mut cmd = Command::new(invocation.binary);
    cmd.args(&case.args)
        .envs(merge_env(invocation.env, &case.env))
        .stdin(if case.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &workdir {
        cmd.current_dir(dir.path());
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return fail(
                format!("failed to start {}: {e}", invocation.binary.display()),
                -1,
            )
        }
    };

    let mut pumps = Vec::new();
    if let Some(out) = child.stdout.take() {
        pumps.push(stdout.pump(out));
    }
    if let Some(err) = child.stderr.take() {
        pumps.push(stderr.pump(err));
    }

    // Fed from a task so a child that writes before reading cannot deadlock us
    if let (Some(input), Some(mut pipe)) = (case.stdin.clone(), child.stdin.take()) {
        tokio::spawn(async move {
            if let Err(e) = pipe.write_all(input.as_bytes()).await {
                debug!("stdin write ended early: {}", e);
            }
        });
    }

    let waited = tokio::select! {
        _ = cancel.cancelled() => Waited::Cancelled,
        res = timeout(invocation.timeout, child.wait()) => match res {
            Ok(Ok(status)) => Waited::Exited(status),
            Ok(Err(e)) => Waited::Failed(e),
            Err(_) => Waited::TimedOut,
        },
    };

    if !matches!(waited, Waited::Exited(_)) {
        if let Err(e) = child.kill().await {
            warn!("Failed to kill {}: {}", invocation.binary.display(), e);
        }
    }
    for pump in pumps {
        let _ = timeout(DRAIN_TIMEOUT, pump).await;
    }

    let status = match waited {
        Waited::Exited(status) => status,
        Waited::TimedOut => {
            return fail(format!("test timed out after {:?}", invocation.timeout), -1)
        }
        Waited::Cancelled => return fail("cancelled".to_string(), -1),
        Waited::Failed(e) => return fail(format!("waiting for process: {e}"), -1),
    };

    // Killed by a signal reports -1
    let exit_code = status.code().unwrap_or(-1);
    let mut errors = assert::assert_cli_output(
        &stdout.contents(),
        &stderr.contents(),
        exit_code,
        &case.expect,
    );
    if let Some(dir) = &workdir {
        errors.extend(assert::assert_files(dir.path(), &case.expect.files));
    }

    if errors.is_empty() {
        TestResult::passed(&case.name, start.elapsed())
    } else {
        fail(format_errors(&errors), exit_code)
    }
}

/// Spec-level entries first, case-level entries win
fn merge_env(base: &EnvMap, overrides: &EnvMap) -> EnvMap {
    let mut merged = base.clone();
    merged.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

/// Fresh scratch directory populated with the case's fixtures
fn prepare_workdir(fixtures: &Fixtures) -> std::io::Result<TempDir> {
    let dir = tempfile::Builder::new().prefix("specrun-case-").tempdir()?;

    for rel in &fixtures.dirs {
        std::fs::create_dir_all(dir.path().join(rel))?;
    }
    for (rel, content) in &fixtures.files {
        let path = dir.path().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
    }

    Ok(dir)
}
