//! eventflow - Main Entry Point
//!
//! Runs a synthetic three-arrow topology (generator, busy stage, sink) to
//! completion and prints the metrics report.
//!
//! ```text
//! eventflow [CONFIG.toml] [--events N] [--threads N] [--spin-us N] [--json]
//! ```

use anyhow::{bail, Context};
use eventflow::{
    config::EngineConfig,
    engine::{Engine, MetricsReport, TopologyBuilder},
    pool::EventPool,
    synthetic::{BusyStage, SyntheticSource},
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const USAGE: &str =
    "usage: eventflow [CONFIG.toml] [--events N] [--threads N] [--spin-us N] [--json]";

#[derive(Debug)]
struct Args {
    config: Option<PathBuf>,
    events: u64,
    threads: Option<usize>,
    spin: Duration,
    json: bool,
}

impl Args {
    fn parse(mut args: impl Iterator<Item = String>) -> anyhow::Result<Option<Self>> {
        let mut parsed = Args {
            config: None,
            events: 10_000,
            threads: None,
            spin: Duration::from_micros(100),
            json: false,
        };
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-h" | "--help" => return Ok(None),
                "--json" => parsed.json = true,
                "--events" => parsed.events = value(&mut args, &arg)?,
                "--threads" => parsed.threads = Some(value(&mut args, &arg)?),
                "--spin-us" => parsed.spin = Duration::from_micros(value(&mut args, &arg)?),
                flag if flag.starts_with('-') => bail!("unknown option '{}'\n{}", flag, USAGE),
                path if parsed.config.is_none() => parsed.config = Some(PathBuf::from(path)),
                extra => bail!("unexpected argument '{}'\n{}", extra, USAGE),
            }
        }
        Ok(Some(parsed))
    }
}

fn value<T>(args: &mut impl Iterator<Item = String>, flag: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw = args
        .next()
        .with_context(|| format!("{} needs a value", flag))?;
    raw.parse()
        .with_context(|| format!("invalid value '{}' for {}", raw, flag))
}

fn print_summary(report: &MetricsReport) {
    println!("status:        {}", report.status);
    println!("threads:       {}", report.thread_count);
    println!("uptime:        {:.3?}", report.uptime);
    println!("events read:   {}", report.events_read);
    println!("throughput:    {:.1} events/s", report.throughput_hz());
    println!();
    println!(
        "{:<12} {:>6} {:>10} {:>10} {:>12} {:>12}",
        "arrow", "par", "success", "wait", "active", "idle"
    );
    for arrow in &report.arrows {
        println!(
            "{:<12} {:>6} {:>10} {:>10} {:>12} {:>12}",
            arrow.name,
            arrow.parallelism,
            arrow.successes,
            arrow.come_back_later,
            format!("{:.3?}", arrow.active_time),
            format!("{:.3?}", arrow.idle_time)
        );
    }
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,eventflow=debug")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let Some(args) = Args::parse(std::env::args().skip(1))? else {
        println!("{}", USAGE);
        return Ok(());
    };

    let config = match &args.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => EngineConfig::default(),
    };
    config.validate()?;
    let threads = args.threads.unwrap_or(config.workers.nthreads);

    tracing::info!(
        "Starting eventflow: {} events, {} threads, {:?} per event",
        args.events,
        threads,
        args.spin
    );

    let pool = Arc::new(EventPool::new(&config.pool)?);
    let mut builder = TopologyBuilder::new(&config, pool);
    let raw = builder.add_queue("raw");
    let processed = builder.add_queue("processed");
    builder.add_source(
        "generator",
        Box::new(SyntheticSource::new(args.events).with_events_per_run(1_000)),
        raw,
    )?;
    let busy = builder.add_stage(
        "busy",
        raw,
        Some(processed),
        vec![Box::new(BusyStage::new(args.spin))],
    )?;
    builder.set_parallelism(busy, threads)?;
    builder.add_sink("sink", processed, Vec::new())?;

    let mut engine = Engine::new(builder.build()?, config);
    let report = engine.run_to_completion(threads)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(&report);
    }
    Ok(())
}
