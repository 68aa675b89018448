//! CLI argument parsing for memtrace

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Output format for the shutdown report
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text format (default)
    Text,
    /// JSON format for machine parsing
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "memtrace")]
#[command(version)]
#[command(about = "Lock-free memory-access trace recorder", long_about = None)]
pub struct Cli {
    /// Enable debug logging on stderr
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the events of a binary or legacy text trace, one per line
    Dump {
        /// Trace file to decode
        trace: PathBuf,
    },
    /// Drive the recorder with a synthetic multi-threaded workload
    Synth(SynthArgs),
}

#[derive(Args, Debug, Clone)]
pub struct SynthArgs {
    /// Load recorder settings from a TOML file (flags below override it)
    #[arg(long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Trace output path
    #[arg(short = 'o', long = "output", value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Trace buffer capacity in bytes
    #[arg(long = "capacity", value_name = "BYTES")]
    pub capacity: Option<u64>,

    /// Record page-floored addresses instead of raw ones
    #[arg(long = "page-addresses")]
    pub page_addresses: bool,

    /// Write the legacy human-readable text trace
    #[arg(long = "legacy-text")]
    pub legacy_text: bool,

    /// Do not start the liveness watchdog
    #[arg(long = "no-watchdog")]
    pub no_watchdog: bool,

    /// Number of worker threads
    #[arg(short = 't', long = "threads", default_value = "4")]
    pub threads: u32,

    /// Loads and stores per thread per phase
    #[arg(short = 'n', long = "accesses", default_value = "1000")]
    pub accesses: u64,

    /// Idle time before shutdown, in milliseconds
    #[arg(long = "hold-ms", default_value = "0")]
    pub hold_ms: u64,

    /// Shutdown report format
    #[arg(long = "format", value_enum, default_value = "text")]
    pub format: OutputFormat,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_dump() {
        let cli = Cli::parse_from(["memtrace", "dump", "trace.bin"]);
        match cli.command {
            Command::Dump { trace } => assert_eq!(trace, PathBuf::from("trace.bin")),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!cli.debug);
    }

    #[test]
    fn test_cli_synth_defaults() {
        let cli = Cli::parse_from(["memtrace", "synth"]);
        let Command::Synth(args) = cli.command else {
            panic!("expected synth");
        };
        assert_eq!(args.threads, 4);
        assert_eq!(args.accesses, 1000);
        assert_eq!(args.format, OutputFormat::Text);
        assert!(args.output.is_none());
        assert!(!args.no_watchdog);
    }

    #[test]
    fn test_cli_synth_flags() {
        let cli = Cli::parse_from([
            "memtrace",
            "--debug",
            "synth",
            "-o",
            "/tmp/t.bin",
            "--capacity",
            "2048",
            "--page-addresses",
            "--legacy-text",
            "--no-watchdog",
            "-t",
            "2",
            "-n",
            "10",
            "--format",
            "json",
        ]);
        assert!(cli.debug);
        let Command::Synth(args) = cli.command else {
            panic!("expected synth");
        };
        assert_eq!(args.output, Some(PathBuf::from("/tmp/t.bin")));
        assert_eq!(args.capacity, Some(2048));
        assert!(args.page_addresses && args.legacy_text && args.no_watchdog);
        assert_eq!(args.threads, 2);
        assert_eq!(args.format, OutputFormat::Json);
    }

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["memtrace"]).is_err());
    }
}
