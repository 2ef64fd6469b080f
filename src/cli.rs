//! CLI argument parsing for ioeye

use crate::correlation::BeginPolicy;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// How completed events are written to stdout
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Fixed-width text table (default)
    Text,
    /// One JSON object per line
    Json,
    /// Raw 96-byte binary records
    Wire,
}

#[derive(Parser, Debug)]
#[command(name = "ioeye")]
#[command(version)]
#[command(about = "Per-process block and VFS I/O latency tracer", long_about = None)]
pub struct Cli {
    /// Enable debug tracing output to stderr
    #[arg(long = "debug", global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Replay a recorded hook log through the tracer
    Replay {
        /// JSON-lines hook log ("-" reads stdin)
        #[arg(value_name = "LOG")]
        log: PathBuf,

        /// TOML tracer configuration
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Override the configured begin policy
        #[arg(long, value_enum)]
        policy: Option<BeginPolicy>,

        /// Event output format
        #[arg(long = "format", value_enum, default_value = "text")]
        format: OutputFormat,

        /// Print per-process latency totals after the replay
        #[arg(short = 's', long = "summary")]
        summary: bool,
    },

    /// Decode a file of binary event records into JSON lines
    Decode {
        /// File of back-to-back 96-byte records ("-" reads stdin)
        #[arg(value_name = "FILE")]
        input: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_replay_defaults() {
        let cli = Cli::parse_from(["ioeye", "replay", "hooks.jsonl"]);
        assert!(!cli.debug);
        match cli.command {
            Command::Replay {
                log,
                config,
                policy,
                format,
                summary,
            } => {
                assert_eq!(log, PathBuf::from("hooks.jsonl"));
                assert!(config.is_none());
                assert!(policy.is_none());
                assert_eq!(format, OutputFormat::Text);
                assert!(!summary);
            }
            other => panic!("expected replay, got {:?}", other),
        }
    }

    #[test]
    fn test_cli_replay_all_flags() {
        let cli = Cli::parse_from([
            "ioeye",
            "--debug",
            "replay",
            "-",
            "--config",
            "ioeye.toml",
            "--policy",
            "version",
            "--format",
            "json",
            "--summary",
        ]);
        assert!(cli.debug);
        match cli.command {
            Command::Replay {
                log,
                config,
                policy,
                format,
                summary,
            } => {
                assert_eq!(log, PathBuf::from("-"));
                assert_eq!(config, Some(PathBuf::from("ioeye.toml")));
                assert_eq!(policy, Some(BeginPolicy::Version));
                assert_eq!(format, OutputFormat::Json);
                assert!(summary);
            }
            other => panic!("expected replay, got {:?}", other),
        }
    }

    #[test]
    fn test_cli_debug_after_subcommand() {
        let cli = Cli::parse_from(["ioeye", "decode", "events.bin", "--debug"]);
        assert!(cli.debug);
        assert!(matches!(cli.command, Command::Decode { .. }));
    }

    #[test]
    fn test_cli_rejects_unknown_policy() {
        let result = Cli::try_parse_from(["ioeye", "replay", "x", "--policy", "merge"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["ioeye"]).is_err());
    }
}
