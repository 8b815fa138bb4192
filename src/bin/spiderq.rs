//! Command-line front end: crawl a site from a seed URL
//!
//! Exit codes: 0 when the crawl finished, 1 for a runtime failure such as an
//! unusable seed URL, 2 for bad settings or a run whose slot bookkeeping
//! went wrong.

use clap::{Parser, Subcommand};
use spiderq::{Config, Error, Event, PipelineBuilder, PipelineStats, shutdown_on_signal};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "spiderq",
    version,
    about = "Recursive, concurrent crawler built on a deduplicating priority work queue"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Crawl from a seed URL until idle or interrupted
    ///
    /// Example: spiderq crawl https://example.com --max-depth 2 --idle-timeout 3
    Crawl {
        /// Seed URL (absolute)
        url: String,

        /// TOML configuration file; flags override its values
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Maximum simultaneous fetches across all hosts
        #[arg(long)]
        concurrency: Option<usize>,

        /// Maximum simultaneous fetches per host
        #[arg(long)]
        per_host: Option<usize>,

        /// Stop after this many seconds without queued or in-flight work
        /// (default: the config file's value, else 5; 0 never stops)
        #[arg(long, value_name = "SECS")]
        idle_timeout: Option<f64>,

        /// Global requests per second
        #[arg(long)]
        rps: Option<u64>,

        /// Do not follow links from pages this many hops away from the seed
        #[arg(long)]
        max_depth: Option<u32>,

        /// Follow links to other hosts too
        #[arg(long)]
        any_host: bool,

        /// Log filter used when RUST_LOG is unset (e.g. "debug", "spiderq=trace")
        #[arg(long)]
        log_level: Option<String>,

        /// Print final statistics as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    let exit_code = match run(Cli::parse()).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Error [{}]: {e}", e.error_code());
            exit_code_for(&e)
        }
    };
    std::process::exit(exit_code);
}

fn exit_code_for(error: &Error) -> i32 {
    if error.is_fatal() { 2 } else { 1 }
}

async fn run(cli: Cli) -> spiderq::Result<()> {
    match cli.command {
        Commands::Crawl {
            url,
            config,
            concurrency,
            per_host,
            idle_timeout,
            rps,
            max_depth,
            any_host,
            log_level,
            json,
        } => {
            let mut config = match config {
                Some(path) => Config::load(path)?,
                None => Config::default(),
            };
            if let Some(n) = concurrency {
                config.pipeline.max_concurrent_fetches = n;
            }
            if let Some(n) = per_host {
                config.pipeline.per_resource_limit = n;
            }
            if rps.is_some() {
                config.rate_limit.requests_per_second = rps;
            }
            if max_depth.is_some() {
                config.spider.max_depth = max_depth;
            }
            if any_host {
                config.spider.same_host_only = false;
            }
            if let Some(level) = log_level {
                config.log_level = level;
            }
            config.pipeline.idle_timeout =
                resolve_idle_timeout(idle_timeout, config.pipeline.idle_timeout)?;

            init_tracing(&config.log_level);

            let pipeline = PipelineBuilder::from_config(config)?.build()?;
            let printer = tokio::spawn(print_events(pipeline.subscribe(), std::io::stdout()));

            let token = CancellationToken::new();
            tokio::spawn(shutdown_on_signal(token.clone()));

            let stats = pipeline.run_with_seed(token, &url).await?;
            if let Err(e) = printer.await {
                tracing::warn!(error = %e, "event printer terminated abnormally");
            }
            print_stats(&stats, json)?;
            check_bookkeeping(&stats)
        }
    }
}

/// One line per fetched URL until the run stops
async fn print_events(mut events: broadcast::Receiver<Event>, mut out: impl Write) {
    loop {
        match events.recv().await {
            Ok(Event::Fetched { url, status, bytes }) => {
                if let Err(e) = writeln!(out, "{status} {url} ({bytes} bytes)") {
                    tracing::warn!(error = %e, "cannot write fetch output, stopping it");
                    return;
                }
            }
            Ok(Event::Stopped) | Err(RecvError::Closed) => break,
            Ok(_) => {}
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "event output fell behind, some fetches not listed");
            }
        }
    }
}

/// The flag wins, then the config file, then a 5 second default
fn resolve_idle_timeout(
    flag: Option<f64>,
    from_file: Option<Duration>,
) -> spiderq::Result<Option<Duration>> {
    match flag {
        Some(secs) => idle_timeout_from_secs(secs),
        None => Ok(from_file.or(Some(DEFAULT_IDLE_TIMEOUT))),
    }
}

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

fn idle_timeout_from_secs(secs: f64) -> spiderq::Result<Option<Duration>> {
    if !secs.is_finite() || secs < 0.0 {
        return Err(Error::config(
            "pipeline.idle_timeout",
            format!("idle timeout must be a non-negative number of seconds, got {secs}"),
        ));
    }
    // 0 keeps crawling until interrupted
    if secs == 0.0 {
        return Ok(None);
    }
    Duration::try_from_secs_f64(secs).map(Some).map_err(|e| {
        Error::config(
            "pipeline.idle_timeout",
            format!("idle timeout of {secs} seconds is out of range: {e}"),
        )
    })
}

/// A run that released resource slots it never admitted is reported as failed
fn check_bookkeeping(stats: &PipelineStats) -> spiderq::Result<()> {
    if stats.invariant_violations > 0 {
        return Err(Error::Invariant(format!(
            "{} resource slot release(s) had no matching admit",
            stats.invariant_violations
        )));
    }
    Ok(())
}

fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();
}

fn print_stats(stats: &PipelineStats, json: bool) -> spiderq::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(stats)?);
        return Ok(());
    }
    println!();
    println!("fetched:      {}", stats.fetched);
    println!("synthesized:  {}", stats.synthesized);
    println!("  failures:   {}", stats.transport_errors);
    println!("  retries:    {}", stats.retry_requested);
    println!("denied:       {}", stats.denied);
    println!("dropped:      {}", stats.dropped);
    println!("discovered:   {}", stats.published);
    if stats.invariant_violations > 0 {
        println!("violations:   {}", stats.invariant_violations);
    }
    Ok(())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_timeout_flag_overrides_the_file() {
        let from_file = Some(Duration::from_millis(800));
        assert_eq!(
            resolve_idle_timeout(Some(2.5), from_file).unwrap(),
            Some(Duration::from_millis(2500))
        );
        assert_eq!(resolve_idle_timeout(Some(0.0), from_file).unwrap(), None);
    }

    #[test]
    fn idle_timeout_from_file_is_kept_without_flag() {
        assert_eq!(
            resolve_idle_timeout(None, Some(Duration::from_millis(800))).unwrap(),
            Some(Duration::from_millis(800))
        );
        assert_eq!(
            resolve_idle_timeout(None, None).unwrap(),
            Some(DEFAULT_IDLE_TIMEOUT)
        );
    }

    #[test]
    fn bad_idle_timeout_flags_are_rejected() {
        for secs in [-1.0, f64::NAN, f64::INFINITY, 1e300] {
            let err = resolve_idle_timeout(Some(secs), None).unwrap_err();
            assert!(
                matches!(&err, Error::Config { key: Some(key), .. } if key == "pipeline.idle_timeout"),
                "{secs}: {err:?}"
            );
        }
    }

    #[test]
    fn settings_errors_exit_with_two() {
        assert_eq!(exit_code_for(&Error::config("pipeline.channel_capacity", "zero")), 2);
        assert_eq!(exit_code_for(&Error::Invariant("unmatched release".into())), 2);
        assert_eq!(
            exit_code_for(&Error::InvalidUrl {
                url: "/relative".into(),
                reason: "relative URL without a base".into(),
            }),
            1
        );
    }

    #[test]
    fn unmatched_releases_fail_the_run() {
        assert!(check_bookkeeping(&PipelineStats::default()).is_ok());

        let stats = PipelineStats {
            invariant_violations: 2,
            ..PipelineStats::default()
        };
        let err = check_bookkeeping(&stats).unwrap_err();
        assert!(matches!(err, Error::Invariant(_)));
        assert_eq!(err.error_code(), "invariant_violation");
        assert_eq!(exit_code_for(&err), 2);
    }

    fn fetched(n: usize) -> Event {
        Event::Fetched {
            url: format!("https://example.com/{n}"),
            status: 200,
            bytes: n,
        }
    }

    #[tokio::test]
    async fn printer_skips_lagged_events_and_keeps_printing() {
        let (tx, rx) = broadcast::channel(2);
        for n in 0..5 {
            tx.send(fetched(n)).unwrap();
        }
        drop(tx);

        let mut out = Vec::new();
        print_events(rx, &mut out).await;

        assert_eq!(
            String::from_utf8(out).unwrap(),
            "200 https://example.com/3 (3 bytes)\n200 https://example.com/4 (4 bytes)\n"
        );
    }

    #[tokio::test]
    async fn printer_stops_at_the_end_of_the_run() {
        let (tx, rx) = broadcast::channel(8);
        tx.send(fetched(1)).unwrap();
        tx.send(Event::Stopped).unwrap();
        tx.send(fetched(2)).unwrap();

        let mut out = Vec::new();
        tokio::time::timeout(Duration::from_secs(1), print_events(rx, &mut out))
            .await
            .expect("printer should stop at Stopped while the sender is alive");

        assert_eq!(String::from_utf8(out).unwrap(), "200 https://example.com/1 (1 bytes)\n");
        drop(tx);
    }

    #[test]
    fn crawl_flags_parse() {
        let cli = Cli::try_parse_from(["spiderq", "crawl", "https://example.com/", "--json"]).unwrap();
        let Commands::Crawl {
            url,
            idle_timeout,
            json,
            ..
        } = cli.command;
        assert_eq!(url, "https://example.com/");
        assert_eq!(idle_timeout, None, "no implicit value that would hide the config file");
        assert!(json);
    }
}
