use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;

use spigot::{AggValue, DrainStats, ReplayProvider, Session};

#[derive(Debug, Parser)]
struct Command {
    /// Probe script text
    #[arg(short, long)]
    script: Option<String>,
    /// Read the probe script from a file instead
    #[arg(long)]
    script_file: Option<PathBuf>,
    /// JSON replay scenario standing in for a live instrumentation engine
    #[arg(short, long)]
    replay: PathBuf,
    /// Milliseconds between drain passes
    #[arg(long, default_value = "100")]
    interval_ms: u64,
    /// Stop after this many drain passes (0 = until interrupted or the
    /// scenario is exhausted)
    #[arg(long, default_value = "0")]
    cycles: u64,
    /// Walk these aggregations after the drain loop ends
    #[arg(short, long)]
    walk: Vec<String>,
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let opts = Command::parse();

    env_logger::Builder::new()
        .filter_level(if opts.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Warn
        })
        .init();

    let script = match (&opts.script, &opts.script_file) {
        (Some(text), None) => text.clone(),
        (None, Some(path)) => fs::read_to_string(path)
            .with_context(|| format!("couldn't read script {}", path.display()))?,
        _ => bail!("exactly one of --script or --script-file is required"),
    };

    let scenario = fs::read_to_string(&opts.replay)
        .with_context(|| format!("couldn't read scenario {}", opts.replay.display()))?;
    let provider = ReplayProvider::from_json(&scenario)?;

    let mut session = Session::new(provider);
    session.compile(&script)?;
    session.activate()?;

    // the handler needs the clause layouts to format records while the
    // session itself is borrowed by drain
    let program = session
        .program()
        .expect("activated session holds a program")
        .clone();

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst))
            .context("couldn't set Ctrl-C handler")?;
    }

    let mut stats = DrainStats::default();
    let mut cycle = 0;
    while !stop.load(Ordering::SeqCst) {
        stats = session.drain(|record| {
            match program.clause_by_cookie(record.cookie) {
                Some(clause) => println!("{}", clause.render(record)),
                None => println!("{:?}", record),
            }
            Ok(())
        })?;

        cycle += 1;
        if opts.cycles > 0 && cycle >= opts.cycles {
            break;
        }
        if session.provider().exhausted() {
            break;
        }
        thread::sleep(Duration::from_millis(opts.interval_ms));
    }

    for aggregation in &opts.walk {
        println!("@{aggregation}:");
        session.walk(aggregation, |keys, value| {
            let keys = keys
                .iter()
                .map(|key| key.to_string())
                .collect::<Vec<_>>()
                .join(",");
            match value {
                AggValue::Scalar(v) => println!("  [{keys}] {v}"),
                AggValue::Histogram(buckets) => {
                    for bucket in buckets {
                        println!("  [{keys}] [{}, {}] {}", bucket.lo, bucket.hi, bucket.count);
                    }
                }
            }
            Ok(())
        })?;
    }

    let mut dropped: Vec<_> = stats
        .per_source_dropped
        .iter()
        .filter(|(_, count)| **count > 0)
        .collect();
    dropped.sort();
    for (source, count) in dropped {
        eprintln!("source {source}: {count} records dropped on overflow");
    }
    for (source, reason) in &stats.quarantined {
        eprintln!("source {source}: quarantined ({reason})");
    }

    session.stop();
    Ok(())
}
