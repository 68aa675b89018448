use anyhow::{Context, Result};
use clap::Parser;
use memtrace::cli::{Cli, Command, OutputFormat, SynthArgs};
use memtrace::config::{Backend, RecorderConfig};
use memtrace::encoder::AddressMode;
use memtrace::legacy::{format_access, TextLine, TextTraceParser, TEXT_HEADER};
use memtrace::record::{TraceEvent, TraceReader};
use memtrace::recorder::Recorder;
use memtrace::synth::{self, Workload};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::DEBUG.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Decode a trace and print one line per event on stdout
fn dump(path: &Path) -> Result<()> {
    let data = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let stdout = std::io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    let mut events = 0u64;

    // a binary header can never spell out the banner: that length would exceed the file
    if data.starts_with(TEXT_HEADER.as_bytes()) {
        let text = String::from_utf8(data).context("Text trace is not UTF-8")?;
        let parser = TextTraceParser::new()?;
        for line in parser.parse(&text)? {
            match line {
                TextLine::Access {
                    thread_id,
                    ip,
                    kind,
                    address,
                } => writeln!(out, "[{thread_id}]{ip:#x}: {kind} {address:#x}")?,
                TextLine::Phase(name) => writeln!(out, "=== {name} ===")?,
                TextLine::Eof => writeln!(out, "#eof")?,
                TextLine::Comment => continue,
            }
            events += 1;
        }
    } else {
        let reader = TraceReader::new(&data)
            .with_context(|| format!("Failed to read trace header of {}", path.display()))?;
        let logical_len = reader.logical_len();
        if reader.is_truncated() {
            eprintln!("[memtrace: header points past end of file, trace was not closed]");
        }
        for event in reader {
            // the binary layout does not keep instruction pointers
            match event?.1 {
                TraceEvent::Access(r) => {
                    writeln!(out, "{}", format_access(r.thread_id, 0, r.kind, r.address))?
                }
                TraceEvent::Phase(name) => writeln!(out, "=== {name} ===")?,
                TraceEvent::Heartbeat => writeln!(out, "# heartbeat")?,
                TraceEvent::Eof => writeln!(out, "#eof")?,
            }
            events += 1;
        }
        eprintln!("[memtrace: logical length {logical_len} bytes]");
    }

    out.flush()?;
    eprintln!("[memtrace: {events} events]");
    Ok(())
}

/// Build the recorder configuration from an optional file plus flag overrides
fn synth_config(args: &SynthArgs) -> Result<RecorderConfig> {
    let mut config = match &args.config {
        Some(path) => RecorderConfig::from_file(path)?,
        None => RecorderConfig::default(),
    };
    if let Some(output) = &args.output {
        config.output = output.clone();
    }
    if let Some(capacity) = args.capacity {
        config.capacity_bytes = capacity;
    }
    if args.page_addresses {
        config.address_mode = AddressMode::Page;
    }
    if args.legacy_text {
        config.backend = Backend::Text;
    }
    if args.no_watchdog {
        config.watchdog.enabled = false;
    }
    config.validate()?;
    Ok(config)
}

fn run_synth(args: &SynthArgs) -> Result<()> {
    let config = synth_config(args)?;
    let recorder = Recorder::start(config).context("Failed to start recording")?;

    synth::run(
        &recorder,
        Workload {
            threads: args.threads,
            accesses_per_phase: args.accesses,
        },
    );
    if args.hold_ms > 0 {
        std::thread::sleep(Duration::from_millis(args.hold_ms));
    }

    let report = recorder.finish().context("Failed to finalize trace")?;
    match args.format {
        OutputFormat::Text => eprint!("{report}"),
        OutputFormat::Json => eprintln!("{}", serde_json::to_string_pretty(&report)?),
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Cli::parse();

    // Initialize tracing if --debug flag is set
    init_tracing(args.debug);

    match &args.command {
        Command::Dump { trace } => dump(trace),
        Command::Synth(synth_args) => run_synth(synth_args),
    }
}
