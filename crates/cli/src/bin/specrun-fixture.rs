//! Reference subject for the demos and the self-tests
//!
//! Without arguments it serves HTTP on `127.0.0.1:$PORT`. With arguments it
//! runs one small command and exits.
//!
//! Server behaviour can be bent through the environment:
//! - `FIXTURE_READY_AFTER_MS`: `/health` answers 503 until this much time has passed
//! - `FIXTURE_NEVER_READY`: `/health` never answers 200
//! - `FIXTURE_IGNORE_SIGTERM`: keep running after the termination signal
//! - `FIXTURE_CRASH`: print the value to stderr and exit 3 before listening
//! - `GREETING`: message returned by `/hello`

use anyhow::{bail, Context};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header::CONTENT_TYPE, HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Map, Value};
use std::io::Write;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::time::Instant;

#[derive(Clone)]
struct AppState {
    /// When `/health` starts answering 200; `None` means never
    ready_at: Option<Instant>,
    greeting: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        return serve().await;
    }

    let code = run_command(&args).await?;
    std::io::stdout().flush()?;
    std::process::exit(code);
}

async fn serve() -> anyhow::Result<()> {
    let port: u16 = std::env::var("PORT")
        .context("PORT is not set")?
        .parse()
        .context("PORT is not a port number")?;

    if let Ok(reason) = std::env::var("FIXTURE_CRASH") {
        println!("fixture starting");
        eprintln!("fatal: {reason}");
        std::process::exit(3);
    }

    let ready_after = match std::env::var("FIXTURE_READY_AFTER_MS") {
        Ok(ms) => Duration::from_millis(ms.parse().context("FIXTURE_READY_AFTER_MS")?),
        Err(_) => Duration::ZERO,
    };
    let state = AppState {
        ready_at: if std::env::var_os("FIXTURE_NEVER_READY").is_some() {
            None
        } else {
            Some(Instant::now() + ready_after)
        },
        greeting: std::env::var("GREETING").unwrap_or_else(|_| "hello".to_string()),
    };

    // Installed before listening so the signal is never missed
    let shutdown = shutdown_signal(std::env::var_os("FIXTURE_IGNORE_SIGTERM").is_some())?;

    let app = Router::new()
        .route("/health", get(health))
        .route("/hello", get(hello))
        .route("/echo", post(echo))
        .route("/headers", get(headers))
        .route("/status/:code", get(status))
        .route("/slow/:ms", get(slow))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
    println!("fixture listening on 127.0.0.1:{port}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    println!("fixture shutting down");
    Ok(())
}

#[cfg(unix)]
fn shutdown_signal(
    ignore: bool,
) -> anyhow::Result<impl std::future::Future<Output = ()> + Send + 'static> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    Ok(async move {
        while terminate.recv().await.is_some() {
            if !ignore {
                return;
            }
            println!("ignoring SIGTERM");
        }
    })
}

#[cfg(not(unix))]
fn shutdown_signal(
    _ignore: bool,
) -> anyhow::Result<impl std::future::Future<Output = ()> + Send + 'static> {
    Ok(async {
        let _ = tokio::signal::ctrl_c().await;
    })
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    match state.ready_at {
        Some(at) if Instant::now() >= at => (StatusCode::OK, "ok"),
        _ => (StatusCode::SERVICE_UNAVAILABLE, "starting"),
    }
}

async fn hello(State(state): State<AppState>) -> impl IntoResponse {
    (
        [("x-fixture", "hello")],
        Json(json!({
            "message": state.greeting,
            "ok": true,
            "count": 5,
            "ratio": 0.5,
            "tags": ["a", "b"],
            "user": {"name": "Alice", "age": 17},
            "deleted": null
        })),
    )
}

async fn echo(headers: HeaderMap, body: Bytes) -> impl IntoResponse {
    let content_type = headers
        .get(CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("application/octet-stream"));
    ([(CONTENT_TYPE, content_type)], body)
}

async fn headers(headers: HeaderMap) -> Json<Value> {
    let map: Map<String, Value> = headers
        .iter()
        .map(|(name, value)| {
            let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
            (name.as_str().to_string(), Value::String(value))
        })
        .collect();
    Json(Value::Object(map))
}

async fn status(Path(code): Path<u16>) -> impl IntoResponse {
    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_REQUEST);
    (status, format!("status {code}"))
}

/// Holds the request open before answering
async fn slow(Path(ms): Path<u64>) -> String {
    tokio::time::sleep(Duration::from_millis(ms)).await;
    format!("slept {ms}ms")
}

/// Command mode; returns the exit code
async fn run_command(args: &[String]) -> anyhow::Result<i32> {
    let (command, rest) = match args.split_first() {
        Some((command, rest)) => (command.as_str(), rest),
        None => bail!("no command"),
    };

    match command {
        "echo" => println!("{}", rest.join(" ")),
        "cat" => {
            let mut input = Vec::new();
            tokio::io::stdin().read_to_end(&mut input).await?;
            print!("{}", String::from_utf8_lossy(&input));
        }
        "exit" => {
            let code = rest.first().map(|c| c.parse::<i32>()).transpose()?.unwrap_or(0);
            return Ok(code);
        }
        "env" => {
            let name = rest.first().context("env needs a variable name")?;
            match std::env::var(name) {
                Ok(value) => println!("{value}"),
                Err(_) => {
                    eprintln!("{name} is not set");
                    return Ok(1);
                }
            }
        }
        "sleep" => {
            let ms: u64 = rest.first().context("sleep needs milliseconds")?.parse()?;
            tokio::time::sleep(Duration::from_millis(ms)).await;
            println!("slept {ms}ms");
        }
        "stderr" => eprintln!("{}", rest.join(" ")),
        "write" => {
            let [path, content] = rest else {
                bail!("usage: write <path> <content>");
            };
            if let Some(parent) = std::path::Path::new(path).parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, content)?;
            println!("wrote {path}");
        }
        "mv" => {
            let [from, to] = rest else {
                bail!("usage: mv <from> <to>");
            };
            std::fs::rename(from, to)?;
        }
        other => {
            eprintln!("unknown command: {other}");
            return Ok(2);
        }
    }

    Ok(0)
}
