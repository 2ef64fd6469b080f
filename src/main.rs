use anyhow::{Context, Result};
use clap::Parser;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use tracing_subscriber::EnvFilter;

use ioeye::cli::{Cli, Command, OutputFormat};
use ioeye::config::TracerConfig;
use ioeye::correlation::BeginPolicy;
use ioeye::emitter::{EventPump, JsonLinesSink, TextSink, WireSink};
use ioeye::event;
use ioeye::replay::Replayer;
use ioeye::report;

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

fn open_input(path: &Path) -> Result<Box<dyn BufRead>> {
    if path.as_os_str() == "-" {
        return Ok(Box::new(BufReader::new(io::stdin())));
    }
    let file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    Ok(Box::new(BufReader::new(file)))
}

fn load_config(path: Option<&Path>, policy: Option<BeginPolicy>) -> Result<TracerConfig> {
    let mut config = match path {
        Some(path) => TracerConfig::from_file(path)?,
        None => TracerConfig::default(),
    };
    if let Some(policy) = policy {
        config.begin_policy = policy;
    }
    Ok(config)
}

fn spawn_pump(receiver: ioeye::emitter::EventReceiver, format: OutputFormat) -> Result<EventPump> {
    let out = BufWriter::new(io::stdout());
    let pump = match format {
        OutputFormat::Text => EventPump::spawn(receiver, TextSink::new(out)),
        OutputFormat::Json => EventPump::spawn(receiver, JsonLinesSink::new(out)),
        OutputFormat::Wire => EventPump::spawn(receiver, WireSink::new(out)),
    };
    pump.context("failed to spawn event pump")
}

fn run_replay(
    log: &Path,
    config_path: Option<&Path>,
    policy: Option<BeginPolicy>,
    format: OutputFormat,
    summary: bool,
) -> Result<()> {
    let config = load_config(config_path, policy)?;
    tracing::debug!(?config, "starting replay");

    let (mut replayer, receiver) = Replayer::new(&config)?;
    let pump = spawn_pump(receiver, format)?;
    // The pump drains concurrently, so the replay can wait for room
    replayer.wait_for_consumer(true);

    let input = open_input(log)?;
    let outcome = replayer.run(input);
    let snapshot = replayer.tracer().latency_snapshot();
    let replay_stats = replayer.stats();
    let tracer_stats = replayer.finish();
    let delivered = pump.shutdown();
    outcome.with_context(|| format!("replay of {} failed", log.display()))?;

    tracing::debug!(
        hooks = replay_stats.hooks,
        out_of_order = replay_stats.out_of_order,
        completed = tracer_stats.completed(),
        pending = tracer_stats.pending(),
        delivered,
        dropped = tracer_stats.events.dropped,
        "replay finished"
    );
    if replay_stats.out_of_order > 0 {
        tracing::warn!(
            count = replay_stats.out_of_order,
            "hook log timestamps went backwards"
        );
    }

    if summary {
        let rates = report::rates_between(&BTreeMap::new(), &snapshot, replay_stats.span());
        let table = format!(
            "{}\nRates over {:.3}s of replayed time\n{}",
            report::render_summary(&snapshot),
            replay_stats.span().as_secs_f64(),
            report::render_rates(&rates)
        );
        // Keep binary output on stdout clean
        if format == OutputFormat::Wire {
            eprint!("{}", table);
        } else {
            print!("{}", table);
        }
    }

    if tracer_stats.events.dropped > 0 {
        anyhow::bail!(
            "{} of {} events were dropped by the event channel (event_capacity = {})",
            tracer_stats.events.dropped,
            tracer_stats.events.dropped + tracer_stats.events.published,
            tracer_stats.events.capacity
        );
    }
    Ok(())
}

fn run_decode(input: &Path) -> Result<()> {
    let mut buf = Vec::new();
    open_input(input)?
        .read_to_end(&mut buf)
        .with_context(|| format!("failed to read {}", input.display()))?;

    let events = event::decode_records(&buf)
        .with_context(|| format!("{} is not a stream of event records", input.display()))?;

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    for event in &events {
        serde_json::to_writer(&mut out, event)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.debug);

    match args.command {
        Command::Replay {
            log,
            config,
            policy,
            format,
            summary,
        } => run_replay(&log, config.as_deref(), policy, format, summary),
        Command::Decode { input } => run_decode(&input),
    }
}
