//! specrun CLI
//!
//! Argument handling and report rendering for the `specrun` binary.

pub mod output;
pub mod settings;

pub use output::OutputFormat;
pub use settings::Cli;
