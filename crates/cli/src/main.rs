//! specrun CLI - Main Entry Point
//!
//! Exit status: 0 when every test passed, 1 when any test failed, 2 when
//! the run itself could not complete (no specs, build failure, bad config,
//! cancellation).

use anyhow::bail;
use clap::Parser;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use specrun::{TestRunner, TestSpec};
use specrun_cli::{output, Cli};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging; stderr keeps stdout clean for JSON/YAML reports
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            output::print_error(&format!("{e:#}"));
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<bool> {
    let config = cli.runner_config()?;
    let cancel = CancellationToken::new();

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Received interrupt; cancelling run");
                cancel.cancel();
            }
        });
    }

    if let Some(limit) = cli.timeout {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            warn!("Run deadline of {:?} reached; cancelling", limit);
            cancel.cancel();
        });
    }

    let mut specs = TestSpec::load_all(&cli.patterns)?;
    if let Some(filter) = &cli.name {
        specs.retain(|spec| spec.name.contains(filter.as_str()));
        if specs.is_empty() {
            bail!("no specs match name filter {:?}", filter);
        }
    }

    info!(
        "Loaded {} spec(s) with {} test(s)",
        specs.len(),
        specs.iter().map(TestSpec::total_tests).sum::<usize>()
    );

    let runner = TestRunner::new(config);
    let results = runner.run(&specs, &cancel).await?;

    output::print_results(&results, cli.format)?;
    if let Some(dir) = &cli.output {
        results.write_json(dir)?;
    }

    if cancel.is_cancelled() {
        bail!(
            "run cancelled after {} of {} spec(s)",
            results.examples.len(),
            specs.len()
        );
    }

    Ok(results.success())
}
