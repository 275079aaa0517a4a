//! Output formatting for CLI

use clap::ValueEnum;
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};
use std::fmt::Write;

use specrun::{Results, TestResult, TestResultDetails};

/// Longest failure detail printed before clipping
pub const DETAIL_LIMIT: usize = 500;

/// Output format
#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Summary table followed by failure details
    #[default]
    Table,
    /// Plain PASS/FAIL lines
    Plain,
    /// JSON format
    Json,
    /// YAML format
    Yaml,
}

/// Print a finished run in the requested format
pub fn print_results(results: &Results, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Table => {
            println!("{}", render_table(results));
            print!("{}", render_failures(results));
            println!("{}", summary_line(results));
        }
        OutputFormat::Plain => {
            print!("{}", render_plain(results));
            println!("{}", summary_line(results));
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(results)?);
        }
        OutputFormat::Yaml => {
            print!("{}", serde_yaml::to_string(results)?);
        }
    }
    Ok(())
}

/// One row per example
pub fn render_table(results: &Results) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(vec!["Example", "Result", "Passed", "Failed", "Skipped", "Time"]);
    for example in &results.examples {
        let status = if example.success() {
            Cell::new("PASS").fg(Color::Green)
        } else {
            Cell::new("FAIL").fg(Color::Red)
        };
        table.add_row(vec![
            Cell::new(&example.name),
            status,
            Cell::new(example.passed),
            Cell::new(example.failed),
            Cell::new(example.skipped),
            Cell::new(format!("{} ms", example.duration_ms)),
        ]);
    }

    table
}

/// PASS/FAIL per example, with each failing test underneath
pub fn render_plain(results: &Results) -> String {
    let mut out = String::new();

    for example in &results.examples {
        let counts = format!("{}/{}", example.passed, example.total);
        if example.success() {
            let _ = writeln!(
                out,
                "{} {} ({}, {} ms)",
                "PASS".green().bold(),
                example.name,
                counts,
                example.duration_ms
            );
        } else {
            let _ = writeln!(
                out,
                "{} {} ({}, {} ms)",
                "FAIL".red().bold(),
                example.name,
                counts,
                example.duration_ms
            );
            if let Some(error) = &example.error {
                let _ = writeln!(out, "  {}", clip(error, DETAIL_LIMIT));
            }
            for test in example.tests.iter().filter(|t| !t.passed) {
                out.push_str(&render_test_failure(test));
            }
        }
    }

    out
}

/// Every failing test, grouped under its example
pub fn render_failures(results: &Results) -> String {
    let mut out = String::new();
    let mut current = None;

    for (example, test) in results.failures() {
        if current != Some(example.name.as_str()) {
            current = Some(example.name.as_str());
            let _ = writeln!(out, "\n{}", example.name.bold());
        }
        out.push_str(&render_test_failure(test));
    }

    out
}

fn render_test_failure(test: &TestResult) -> String {
    let mut out = String::new();
    let error = test.error.as_deref().unwrap_or("unknown error");
    let _ = writeln!(out, "  {} {}: {}", "✗".red(), test.name, clip(error, DETAIL_LIMIT));

    match &test.details {
        Some(TestResultDetails::Http {
            method,
            path,
            status,
            body,
        }) => {
            let _ = writeln!(out, "    request: {} {}", method, path);
            if let Some(status) = status {
                let _ = writeln!(out, "    status: {}", status);
            }
            if let Some(body) = body.as_deref().filter(|b| !b.is_empty()) {
                let _ = writeln!(out, "    body: {}", clip(body, DETAIL_LIMIT));
            }
        }
        Some(TestResultDetails::Cli {
            args,
            exit_code,
            stdout,
            stderr,
        }) => {
            let _ = writeln!(out, "    args: {:?}", args);
            let _ = writeln!(out, "    exit code: {}", exit_code);
            if !stdout.is_empty() {
                let _ = writeln!(out, "    stdout: {}", clip(stdout, DETAIL_LIMIT));
            }
            if !stderr.is_empty() {
                let _ = writeln!(out, "    stderr: {}", clip(stderr, DETAIL_LIMIT));
            }
        }
        None => {}
    }

    out
}

/// Final PASSED/FAILED line
pub fn summary_line(results: &Results) -> String {
    if results.success() {
        format!("PASSED: {}/{}", results.passed, results.total)
            .green()
            .bold()
            .to_string()
    } else {
        format!("FAILED: {}/{}", results.failed, results.total)
            .red()
            .bold()
            .to_string()
    }
}

/// Cut `s` to at most `max` bytes on a char boundary, noting how much was dropped
pub fn clip(s: &str, max: usize) -> String {
    let s = s.trim_end();
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... ({} bytes truncated)", &s[..end], s.len() - end)
}

/// Print error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "error:".red().bold(), message);
}
