/*!
 * Hearth CLI
 *
 * `hearth soak` drives a simulated backend through the full stack (pool,
 * recovery manager, monitors) with failure injection and prints the
 * resulting statistics as JSON.
 */

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::json;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hearth::{
    config::{HearthConfig, LogLevel},
    engine::{Engine, Loader, UsageProbe},
    error::{HearthError, EXIT_DEGRADED, EXIT_FATAL, EXIT_PARTIAL, EXIT_SUCCESS},
    logging,
    monitor::{HealthChecker, HealthSource, UsageMonitor},
    recovery::RecoveryManager,
    service::Service,
    sim::{FailureInjector, SimBackend, SimLoader, SimRequest, SimUsageProbe},
    CallContext,
};

#[derive(Parser)]
#[command(name = "hearth")]
#[command(version, about = "Resilient local inference runtime", long_about = None)]
struct Cli {
    /// Configuration file (TOML). Defaults apply when omitted.
    #[arg(short = 'c', long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Log level (overrides the config file)
    #[arg(long, value_enum, global = true)]
    log_level: Option<LogLevelArg>,

    /// Path to log file (default: stdout)
    #[arg(long, value_name = "FILE", global = true)]
    log: Option<PathBuf>,

    /// Enable verbose logging (equivalent to --log-level=debug)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulated workload with failure injection and print statistics
    Soak(SoakArgs),

    /// Print the effective configuration as TOML
    ShowConfig,
}

#[derive(Args)]
struct SoakArgs {
    /// Total requests to issue
    #[arg(short = 'n', long, default_value_t = 200)]
    requests: u64,

    /// Concurrent callers
    #[arg(short = 'j', long, default_value_t = 4)]
    concurrency: usize,

    /// Probability that a single backend run fails (0.0-1.0)
    #[arg(long, default_value_t = 0.05)]
    failure_rate: f64,

    /// Probability that a model reload fails (0.0-1.0)
    #[arg(long, default_value_t = 0.0)]
    load_failure_rate: f64,

    /// Simulated latency of one backend run
    #[arg(long, default_value_t = 5)]
    latency_ms: u64,

    /// Tokens generated per request
    #[arg(long, default_value_t = 16)]
    max_tokens: usize,

    /// Deadline for each request, including retries
    #[arg(long, default_value_t = 30_000)]
    request_timeout_ms: u64,

    /// Simulated accelerator memory in GiB
    #[arg(long, default_value_t = 16)]
    device_memory_gib: u64,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum LogLevelArg {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevelArg> for LogLevel {
    fn from(arg: LogLevelArg) -> Self {
        match arg {
            LogLevelArg::Error => LogLevel::Error,
            LogLevelArg::Warn => LogLevel::Warn,
            LogLevelArg::Info => LogLevel::Info,
            LogLevelArg::Debug => LogLevel::Debug,
            LogLevelArg::Trace => LogLevel::Trace,
        }
    }
}

/// Model weights resident regardless of context count
const BASE_FOOTPRINT: u64 = 2 << 30;
/// Memory held by one live context (KV cache and scratch)
const CONTEXT_FOOTPRINT: u64 = 512 << 20;

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            e.downcast_ref::<HearthError>()
                .map(HearthError::exit_code)
                .unwrap_or(EXIT_FATAL)
        }
    };
    std::process::exit(code);
}

fn run() -> anyhow::Result<i32> {
    let cli = Cli::parse();

    let mut config = match cli.config {
        Some(ref path) => HearthConfig::from_file(path)?,
        None => HearthConfig::default(),
    };

    if let Some(level) = cli.log_level {
        config.logging.level = level.into();
    }
    if cli.log.is_some() {
        config.logging.file = cli.log.clone();
    }
    config.logging.verbose |= cli.verbose;
    config.validate()?;

    match cli.command {
        Commands::ShowConfig => {
            let rendered = toml::to_string_pretty(&config).context("rendering configuration")?;
            print!("{}", rendered);
            Ok(EXIT_SUCCESS)
        }
        Commands::Soak(args) => {
            if let Err(e) = logging::init_logging(&config.logging) {
                eprintln!("Warning: Failed to initialize logging: {}", e);
            }

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("starting tokio runtime")?;
            runtime.block_on(soak(config, args))
        }
    }
}

#[derive(Default)]
struct Tally {
    issued: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

async fn soak(config: HearthConfig, args: SoakArgs) -> anyhow::Result<i32> {
    let started = Instant::now();
    let injector = FailureInjector::with_rate(args.failure_rate);
    let backend = SimBackend::new(
        Arc::clone(&injector),
        Duration::from_millis(args.latency_ms),
    );

    let usage_probe: Arc<dyn UsageProbe> = Arc::new(SimUsageProbe::new(
        args.device_memory_gib.saturating_mul(1 << 30),
        BASE_FOOTPRINT,
        CONTEXT_FOOTPRINT,
        backend.live_contexts(),
    ));

    let loader = Arc::new(
        SimLoader::new(config.pool_config(), Arc::clone(&injector), &backend)
            .with_usage_probe(Arc::clone(&usage_probe)),
    );
    loader
        .load_injector()
        .set_failure_rate(args.load_failure_rate);

    let service = Service::new(backend, config.pool_config())
        .await
        .map_err(HearthError::from)?
        .with_usage_probe(Arc::clone(&usage_probe));

    let manager = Arc::new(
        RecoveryManager::builder(Arc::new(service))
            .config(config.recovery_config())
            .loader(Arc::clone(&loader) as Arc<dyn Loader<Service<SimBackend>>>)
            .canary(SimRequest::new("ping", 1))
            .on_recovery_attempt(|action, attempt, error| match error {
                Some(e) => debug!(%action, attempt, error = %e, "Recovery attempt"),
                None => debug!(%action, attempt, "Recovery attempt"),
            })
            .on_degraded_enter(|reason| warn!(reason, "Serving suspended"))
            .on_degraded_exit(|| info!("Serving resumed"))
            .build(),
    );

    let root = CancellationToken::new();

    let usage_monitor = UsageMonitor::new(usage_probe, config.monitor_config());
    if config.usage_monitor.enabled {
        usage_monitor.start(&root);
    }

    let health_checker =
        HealthChecker::builder(Arc::clone(&manager) as Arc<dyn HealthSource>)
            .config(config.health_checker_config())
            .on_unhealthy(|reason| warn!(reason, "Health check failing"))
            .on_healthy(|| info!("Health check recovered"))
            .build();
    if config.health.enabled {
        health_checker.start(&root);
    }

    info!(
        requests = args.requests,
        concurrency = args.concurrency,
        failure_rate = args.failure_rate,
        "Soak started"
    );

    let tally = Arc::new(Tally::default());
    let next = Arc::new(AtomicU64::new(0));
    let request_timeout = Duration::from_millis(args.request_timeout_ms);
    let mut workers = JoinSet::new();

    for worker in 0..args.concurrency.max(1) {
        let manager = Arc::clone(&manager);
        let tally = Arc::clone(&tally);
        let next = Arc::clone(&next);
        let root = root.clone();
        let total = args.requests;
        let max_tokens = args.max_tokens;

        workers.spawn(async move {
            loop {
                let n = next.fetch_add(1, Ordering::SeqCst);
                if n >= total || root.is_cancelled() {
                    break;
                }
                tally.issued.fetch_add(1, Ordering::Relaxed);

                let ctx = CallContext::background()
                    .with_cancellation(root.child_token())
                    .with_timeout(request_timeout);
                let request = SimRequest::new(format!("request {} from worker {}", n, worker), max_tokens);

                match manager.execute(&ctx, &request).await {
                    Ok(_) => {
                        tally.succeeded.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) if e.is_degraded() => {
                        tally.rejected.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        tally.failed.fetch_add(1, Ordering::Relaxed);
                        debug!(request = n, error = %e, "Request failed");
                    }
                }
            }
        });
    }

    let interrupted = tokio::select! {
        _ = drain(&mut workers) => false,
        _ = tokio::signal::ctrl_c() => true,
    };
    if interrupted {
        warn!("Interrupted, cancelling outstanding requests");
        root.cancel();
        drain(&mut workers).await;
    }

    let engine = manager.engine();
    let recovery = manager.stats();
    let degraded = recovery.in_degraded_mode;
    let failed = tally.failed.load(Ordering::Relaxed);

    let report = json!({
        "requests": {
            "issued": tally.issued.load(Ordering::Relaxed),
            "succeeded": tally.succeeded.load(Ordering::Relaxed),
            "failed": failed,
            "rejected_degraded": tally.rejected.load(Ordering::Relaxed),
        },
        "injected_failures": injector.injected(),
        "model_loads": loader.loads(),
        "recovery": recovery,
        "pool": engine.pool_stats(),
        "service": engine.request_stats(),
        "usage": usage_monitor.stats(),
        "health": health_checker.stats(),
        "interrupted": interrupted,
        "elapsed_ms": started.elapsed().as_millis() as u64,
    });

    health_checker.stop().await;
    usage_monitor.stop().await;
    manager.shutdown().await;
    engine.close().await;
    root.cancel();

    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("serializing report")?
    );

    info!(failed, degraded, "Soak finished");
    Ok(if degraded {
        EXIT_DEGRADED
    } else if failed > 0 || interrupted {
        EXIT_PARTIAL
    } else {
        EXIT_SUCCESS
    })
}

async fn drain(workers: &mut JoinSet<()>) {
    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Soak worker panicked");
        }
    }
}
