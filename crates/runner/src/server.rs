//! Server management - spawning, readiness polling and stopping a subject process
//!
//! Each server-mode spec gets exactly one [`ServerHandle`]. The handle owns
//! the child process, the port handed to it, and in-memory captures of its
//! stdout and stderr.

use parking_lot::Mutex;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RunnerConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::spec::ServerConfig;

/// How long to wait for output pumps to drain after the process is gone
pub(crate) const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Configuration for launching one subject server
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub binary_path: PathBuf,

    /// Environment overrides applied on top of the inherited environment
    pub env: Vec<(String, String)>,

    /// Port to listen on (None = find free port)
    pub port: Option<u16>,

    /// Variable the port is passed in
    pub port_env: String,

    /// Readiness endpoint path
    pub health_path: String,

    pub startup_timeout: Duration,

    /// Grace period after the termination signal before a forced kill
    pub shutdown_timeout: Duration,

    pub request_timeout: Duration,
    pub probe_timeout: Duration,
    pub poll_interval: Duration,

    /// Leave the process running when the handle is dropped
    pub keep_alive: bool,
}

impl LaunchConfig {
    /// Combine a spec's server block with runner-wide settings
    pub fn new(binary_path: PathBuf, server: &ServerConfig, runner: &RunnerConfig) -> Self {
        Self {
            binary_path,
            env: server
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            port: server.port,
            port_env: server.port_env().to_string(),
            health_path: server.health_path().to_string(),
            startup_timeout: server.startup_timeout(),
            shutdown_timeout: server.shutdown_timeout(),
            request_timeout: runner.request_timeout,
            probe_timeout: runner.probe_timeout,
            poll_interval: runner.poll_interval,
            keep_alive: runner.keep_alive,
        }
    }
}

/// What [`ServerHandle::stop`] had to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Already stopped, or never started
    NotRunning,
    /// The process had exited on its own before the signal
    AlreadyExited,
    /// Exited within the grace period after the termination signal
    Graceful,
    /// Still running after the grace period; killed
    Killed,
}

/// Growable in-memory copy of one output stream
#[derive(Debug, Clone, Default)]
pub struct Capture(Arc<Mutex<Vec<u8>>>);

impl Capture {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }

    pub(crate) fn pump<R>(&self, mut reader: R) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let sink = Arc::clone(&self.0);
        tokio::spawn(async move {
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => sink.lock().extend_from_slice(&buf[..n]),
                }
            }
        })
    }
}

/// Handle to a running server process
pub struct ServerHandle {
    child: Option<Child>,
    pumps: Vec<JoinHandle<()>>,
    client: reqwest::Client,
    stdout: Capture,
    stderr: Capture,
    grace: Duration,
    pub base_url: String,
    pub port: u16,
}

impl ServerHandle {
    /// Spawn the subject and wait until its readiness endpoint answers 200.
    ///
    /// On timeout or early exit the process is stopped and the error carries
    /// everything it printed so far.
    pub async fn spawn(config: LaunchConfig, cancel: &CancellationToken) -> HarnessResult<Self> {
        let port = match config.port {
            Some(port) => port,
            None => find_free_port()?,
        };
        let base_url = format!("http://127.0.0.1:{}", port);

        info!("Spawning {} on port {}", config.binary_path.display(), port);

        let mut cmd = Command::new(&config.binary_path);
        cmd.envs(config.env.iter().map(|(k, v)| (k, v)))
            .env(&config.port_env, port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(!config.keep_alive);

        let mut child = cmd.spawn().map_err(|e| {
            HarnessError::ServerStartup(format!(
                "Failed to spawn {}: {}",
                config.binary_path.display(),
                e
            ))
        })?;

        let stdout = Capture::default();
        let stderr = Capture::default();
        let mut pumps = Vec::new();
        if let Some(out) = child.stdout.take() {
            pumps.push(stdout.pump(out));
        }
        if let Some(err) = child.stderr.take() {
            pumps.push(stderr.pump(err));
        }

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        let mut handle = ServerHandle {
            child: Some(child),
            pumps,
            client,
            stdout,
            stderr,
            grace: config.shutdown_timeout,
            base_url,
            port,
        };

        if let Err(e) = handle.wait_for_ready(&config, cancel).await {
            if let Err(stop_err) = handle.stop().await {
                warn!("Failed to stop server after startup failure: {}", stop_err);
            }
            return Err(handle.decorate(e));
        }

        info!("Server is ready at {}", handle.base_url);
        Ok(handle)
    }

    /// Poll the readiness endpoint at a fixed cadence until it returns 200
    async fn wait_for_ready(
        &mut self,
        config: &LaunchConfig,
        cancel: &CancellationToken,
    ) -> HarnessResult<usize> {
        let url = self.url(&config.health_path);
        let start = Instant::now();
        let deadline = start + config.startup_timeout;
        let mut ticker = tokio::time::interval(config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut attempts = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(HarnessError::Cancelled),
                _ = sleep_until(deadline) => {
                    return Err(HarnessError::ReadinessTimeout {
                        elapsed: start.elapsed(),
                        attempts,
                        stdout: String::new(),
                        stderr: String::new(),
                    });
                }
                _ = ticker.tick() => {}
            }

            attempts += 1;

            if let Some(child) = self.child.as_mut() {
                if let Some(status) = child.try_wait()? {
                    return Err(HarnessError::ProcessExited {
                        status: status.to_string(),
                        stdout: String::new(),
                        stderr: String::new(),
                    });
                }
            }

            let probe_timeout = config
                .probe_timeout
                .min(deadline.saturating_duration_since(Instant::now()));
            match self.client.get(&url).timeout(probe_timeout).send().await {
                Ok(resp) if resp.status() == reqwest::StatusCode::OK => {
                    debug!("Ready after {} poll(s)", attempts);
                    return Ok(attempts);
                }
                Ok(resp) => {
                    debug!("Readiness probe returned {}", resp.status());
                }
                Err(e) => {
                    // Connection refused is expected while the server is starting
                    if !e.is_connect() && !e.is_timeout() {
                        warn!("Readiness probe error: {}", e);
                    }
                }
            }
        }
    }

    /// Attach captured output to startup errors
    fn decorate(&self, error: HarnessError) -> HarnessError {
        match error {
            HarnessError::ReadinessTimeout {
                elapsed, attempts, ..
            } => HarnessError::ReadinessTimeout {
                elapsed,
                attempts,
                stdout: self.stdout(),
                stderr: self.stderr(),
            },
            HarnessError::ProcessExited { status, .. } => HarnessError::ProcessExited {
                status,
                stdout: self.stdout(),
                stderr: self.stderr(),
            },
            other => other,
        }
    }

    /// Get the base URL for this server
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute URL for a request path
    pub fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    /// HTTP client bound to this server's request timeout
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Everything the process has written to stdout so far
    pub fn stdout(&self) -> String {
        self.stdout.contents()
    }

    /// Everything the process has written to stderr so far
    pub fn stderr(&self) -> String {
        self.stderr.contents()
    }

    /// OS process id, while running
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Stop the server: terminate, wait out the grace period, then kill.
    ///
    /// Idempotent; a second call reports [`StopOutcome::NotRunning`].
    pub async fn stop(&mut self) -> HarnessResult<StopOutcome> {
        let Some(mut child) = self.child.take() else {
            return Ok(StopOutcome::NotRunning);
        };

        if child.try_wait()?.is_some() {
            self.drain().await;
            return Ok(StopOutcome::AlreadyExited);
        }

        info!("Stopping server (pid: {:?})", child.id());
        terminate(&mut child);

        let waited = timeout(self.grace, child.wait()).await.ok();
        let outcome = match graceful_exit(waited) {
            Ok(Some(outcome)) => outcome,
            Ok(None) => {
                warn!(
                    "Server did not exit within {:?}; killing (pid: {:?})",
                    self.grace,
                    child.id()
                );
                child.kill().await?;
                StopOutcome::Killed
            }
            Err(e) => {
                warn!("Waiting for server (pid: {:?}) failed: {}", child.id(), e);
                let _ = child.start_kill();
                self.drain().await;
                return Err(e);
            }
        };

        self.drain().await;
        Ok(outcome)
    }

    async fn drain(&mut self) {
        for pump in self.pumps.drain(..) {
            let _ = timeout(DRAIN_TIMEOUT, pump).await;
        }
    }
}

/// Interpret the grace-period wait; `None` means the process is still running
fn graceful_exit(waited: Option<std::io::Result<ExitStatus>>) -> HarnessResult<Option<StopOutcome>> {
    match waited {
        Some(Ok(status)) => {
            debug!("Server exited with {}", status);
            Ok(Some(StopOutcome::Graceful))
        }
        Some(Err(e)) => Err(e.into()),
        None => Ok(None),
    }
}

/// Ask the process to shut down
#[cfg(unix)]
fn terminate(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!("Failed to signal pid {}: {}", pid, e);
        }
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    let _ = child.start_kill();
}

/// Find a free port to use.
///
/// The probe socket is released before the subject binds, so another
/// process may grab the port in between; the allocation is advisory.
pub fn find_free_port() -> std::io::Result<u16> {
    use std::net::TcpListener;

    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}
