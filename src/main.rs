#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::doc_markdown, clippy::if_not_else, clippy::non_ascii_literal)]

use rangeping::address::{load_targets, RangeExpander};
use rangeping::input::{Config, Opts, ScanConfig};
use rangeping::probe;
use rangeping::scanner::{Progress, Prober, ResultSet, TargetResult};
use rangeping::{detail, output, warning};

use anyhow::Context;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use log::debug;
use std::num::NonZeroUsize;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

// Average value for Ubuntu
#[cfg(unix)]
const DEFAULT_FILE_DESCRIPTORS_LIMIT: u64 = 8000;
// File descriptors kept free for stdio, the ping children and the log output.
#[cfg(unix)]
const RESERVED_FILE_DESCRIPTORS: u64 = 100;

#[tokio::main]
/// Reads the command line arguments and the configuration file, expands the
/// ranges into targets, probes them and prints the fastest ones.
#[allow(clippy::too_many_lines)]
async fn main() -> anyhow::Result<()> {
    #[cfg(not(unix))]
    let _ = colored::control::set_virtual_terminal(true);

    env_logger::init();
    let started = Instant::now();

    let mut opts: Opts = Opts::read();
    let config = Config::read(opts.config_path.clone())?;
    opts.merge(&config);

    debug!("Main() `opts` arguments are {opts:?}");

    #[cfg_attr(not(unix), allow(unused_mut))]
    let mut scan_config = opts.scan_config()?;

    #[cfg(unix)]
    {
        let ulimit = adjust_ulimit_size(&opts);
        scan_config.concurrency = infer_concurrency(&opts, scan_config.concurrency, ulimit);
    }

    let source = opts.target_source();
    let expander = RangeExpander::new(scan_config.exhaustive);
    let targets = load_targets(&source, &expander, scan_config.port)
        .await
        .with_context(|| format!("could not load targets from {source}"))?;

    if targets.is_empty() {
        warning!(
            format!("No targets found in {source}."),
            opts.greppable,
            opts.accessible
        );
        return Ok(());
    }

    print_run_details(&opts, &scan_config, targets.len());

    let (sender, receiver) = mpsc::unbounded_channel();
    let bar = progress_bar(targets.len(), opts.greppable || opts.accessible);
    let reporter = tokio::spawn(report_progress(receiver, bar.clone()));

    let results = Prober::new(probe::pick(&scan_config), &scan_config)
        .with_progress(sender)
        .run(targets.as_slice())
        .await;

    reporter.await?;
    bar.finish_and_clear();

    let reachable = results.len();
    let results = results.filter(&opts.result_filter());
    debug!(
        "{reachable} reachable targets, {} left after filtering",
        results.len()
    );

    print_results(&opts, &results);

    if let Some(path) = &opts.output {
        write_csv(path, &results)
            .with_context(|| format!("could not write results to {}", path.display()))?;
        detail!(
            format!("Results written to {}", path.display()),
            opts.greppable,
            opts.accessible
        );
    }

    debug!("Run took {:?}", started.elapsed());
    Ok(())
}

fn print_run_details(opts: &Opts, config: &ScanConfig, targets: usize) {
    detail!(
        format!(
            "Probing {targets} targets with {} ({} attempts each, {} at a time).",
            config.mode.label(),
            config.tries,
            config.concurrency
        ),
        opts.greppable,
        opts.accessible
    );
    if !config.exhaustive {
        detail!(
            "One random address is sampled per /24; use --all to probe every address.",
            opts.greppable,
            opts.accessible
        );
    }
}

fn progress_bar(len: usize, hidden: bool) -> ProgressBar {
    if hidden {
        return ProgressBar::hidden();
    }

    let bar = ProgressBar::new(u64::try_from(len).unwrap_or(u64::MAX));
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
        .map(|style| style.progress_chars("#>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    bar.set_style(style);
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}

/// Advances `bar` once per finished target until the prober drops its sender.
async fn report_progress(mut receiver: mpsc::UnboundedReceiver<Progress>, bar: ProgressBar) {
    let mut reachable = 0;
    while let Some(progress) = receiver.recv().await {
        reachable = reachable.max(progress.reachable);
        bar.inc(1);
        bar.set_message(format!("{reachable} reachable"));
    }
}

fn print_results(opts: &Opts, results: &ResultSet) {
    if opts.print_num == 0 {
        return;
    }
    if results.is_empty() {
        warning!(
            "No target passed the delay and loss filters.",
            opts.greppable,
            opts.accessible
        );
        return;
    }

    let shown = results.iter().take(opts.print_num);

    if opts.greppable {
        for result in shown {
            println!("{},{}", result.target, delay_millis(result));
        }
        return;
    }

    let header = format!(
        "{:<47} {:>5} {:>8} {:>6} {:>9} {:>6}",
        "Address", "Sent", "Received", "Loss", "Avg (ms)", "Colo"
    );
    if opts.accessible {
        println!("{header}");
    } else {
        println!("{}", header.bold());
    }

    for result in shown {
        output!(
            format!(
                "{:<47} {:>5} {:>8} {:>6.2} {:>9} {:>6}",
                result.target.to_string(),
                result.attempts,
                result.successes,
                result.loss_rate(),
                delay_millis(result),
                result.location.as_deref().unwrap_or("N/A")
            ),
            false,
            opts.accessible
        );
    }
}

fn delay_millis(result: &TargetResult) -> String {
    format!("{:.2}", result.average_delay.as_secs_f64() * 1000.0)
}

fn write_csv(path: &Path, results: &ResultSet) -> anyhow::Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["ip", "port", "sent", "received", "loss", "delay_ms", "colo"])?;
    for result in results {
        writer.write_record([
            result.target.ip().to_string(),
            result.target.port().to_string(),
            result.attempts.to_string(),
            result.successes.to_string(),
            format!("{:.2}", result.loss_rate()),
            delay_millis(result),
            result.location.clone().unwrap_or_default(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(unix)]
fn adjust_ulimit_size(opts: &Opts) -> u64 {
    use rlimit::Resource;

    if let Some(limit) = opts.ulimit {
        if Resource::NOFILE.set(limit, limit).is_ok() {
            detail!(
                format!("Automatically increasing ulimit value to {limit}."),
                opts.greppable,
                opts.accessible
            );
        } else {
            warning!(
                "ERROR. Failed to set ulimit value.",
                opts.greppable,
                opts.accessible
            );
        }
    }

    match Resource::NOFILE.get() {
        Ok((soft, _)) => soft,
        Err(e) => {
            debug!("Could not read the open file limit: {e}");
            DEFAULT_FILE_DESCRIPTORS_LIMIT
        }
    }
}

/// Lowers the concurrency ceiling when the open file limit cannot hold one
/// socket per in-flight target.
#[cfg(unix)]
fn infer_concurrency(opts: &Opts, requested: NonZeroUsize, ulimit: u64) -> NonZeroUsize {
    let wanted = u64::try_from(requested.get()).unwrap_or(u64::MAX);
    let available = ulimit.saturating_sub(RESERVED_FILE_DESCRIPTORS);

    if available >= wanted {
        return requested;
    }

    warning!(
        "File limit is lower than the concurrency. Consider upping it with --ulimit.",
        opts.greppable,
        opts.accessible
    );

    let lowered = if available == 0 {
        debug!("Halving the file limit because it is smaller than the reserved descriptors");
        ulimit / 2
    } else {
        available
    };

    usize::try_from(lowered)
        .ok()
        .and_then(NonZeroUsize::new)
        .unwrap_or(NonZeroUsize::MIN)
}
