// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, ValueEnum};

/// Command-line arguments for `reductor`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "reductor",
    version,
    about = "Control plane for a multi-stage data-reduction pipeline.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    ///
    /// Default: `Reductor.toml` in the current working directory.
    #[arg(long, value_name = "PATH", default_value = "Reductor.toml")]
    pub config: String,

    /// Run one scheduler / launcher / cleaner round, then exit.
    #[arg(long)]
    pub once: bool,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `REDUCTOR_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Parse + validate, print stage order and settings, but run nothing.
    #[arg(long)]
    pub dry_run: bool,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let args = CliArgs::parse_from(["reductor"]);
        assert_eq!(args.config, "Reductor.toml");
        assert!(!args.once);
        assert!(!args.dry_run);
        assert!(args.log_level.is_none());
    }

    #[test]
    fn flags_parse() {
        let args = CliArgs::parse_from([
            "reductor",
            "--config",
            "pipeline.toml",
            "--once",
            "--log-level",
            "debug",
        ]);
        assert_eq!(args.config, "pipeline.toml");
        assert!(args.once);
        assert!(matches!(args.log_level, Some(LogLevel::Debug)));
    }
}
