mod config;
mod counter;
mod error;
mod server;
mod util;

use anyhow::{Context, Result};
use clap::Parser;
use config::Config;
use counter::SlidingWindowCounter;
use error::StatError;
use server::Gateway;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use util::human::{fmt_count, fmt_secs};
use util::state_store;

#[derive(Parser, Debug)]
#[command(name = "reqstat", about = "Count GET requests over a sliding window", version = "0.1")]
struct Cli {
    /// Config file (default: ~/.config/reqstat/reqstat.toml)
    #[arg(long)]
    config_file: Option<PathBuf>,

    /// Listen address
    #[arg(long)]
    host: Option<String>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Window length in seconds
    #[arg(short, long)]
    interval: Option<u64>,

    /// Slot length in seconds (rotation cadence)
    #[arg(long)]
    precision: Option<u64>,

    /// State file used for checkpoints
    #[arg(long)]
    state: Option<PathBuf>,

    /// Start from zero instead of restoring the last checkpoint
    #[arg(long)]
    no_restore: bool,

    /// Print config file path and effective values, then exit
    #[arg(long)]
    print_config: bool,

    /// Print the persisted state file as JSON and exit
    #[arg(long)]
    show_state: bool,

    /// Overwrite the persisted state with a zeroed counter and exit
    #[arg(long)]
    reset: bool,
}

impl Cli {
    fn apply(&self, cfg: &mut Config) {
        if let Some(h) = &self.host      { cfg.server.host = h.clone(); }
        if let Some(p) = self.port       { cfg.server.port = p; }
        if let Some(i) = self.interval   { cfg.window.interval_secs = i; }
        if let Some(p) = self.precision  { cfg.window.precision_secs = p; }
        if let Some(s) = &self.state     { cfg.state.path = s.clone(); }
        if self.no_restore               { cfg.state.restore = false; }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("reqstat=info")),
        )
        .init();

    let cli = Cli::parse();
    let mut cfg = Config::load(cli.config_file.as_deref());
    cli.apply(&mut cfg);

    if cli.print_config {
        return run_print_config(&cfg, cli.config_file.as_deref());
    }
    if cli.show_state {
        return run_show_state(&cfg.state.path);
    }
    if cli.reset {
        return run_reset(&cfg);
    }

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?
        .block_on(run(cfg))
}

fn run_print_config(cfg: &Config, override_path: Option<&Path>) -> Result<()> {
    let path = override_path
        .map(Path::to_path_buf)
        .or_else(Config::config_path)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|| "(unknown)".to_string());
    println!("Config: {}", path);
    println!();
    println!("[window]");
    println!("  interval_secs   = {}", cfg.window.interval_secs);
    println!("  precision_secs  = {}", cfg.window.precision_secs);
    match cfg.capacity() {
        Ok(c)  => println!("  -> {} slots, {} window", c, fmt_secs(cfg.window_secs())),
        Err(e) => println!("  -> {}", e),
    }
    println!();
    println!("[server]");
    println!("  host = {}", cfg.server.host);
    println!("  port = {}", cfg.server.port);
    println!();
    println!("[state]");
    println!("  path            = {}", cfg.state.path.display());
    println!("  restore         = {}", cfg.state.restore);
    println!("  checkpoint_secs = {}", cfg.state.checkpoint_secs);
    Ok(())
}

fn run_show_state(path: &Path) -> Result<()> {
    match state_store::load(path) {
        Ok(state) => {
            eprintln!(
                "{}: {} slots, cursor {}, {} requests retired",
                path.display(), state.capacity, state.cursor, fmt_count(state.running_total)
            );
            println!("{}", serde_json::to_string_pretty(&state)?);
            Ok(())
        }
        Err(StatError::PersistenceNotFound(_)) => {
            println!("No persisted state at {}", path.display());
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn run_reset(cfg: &Config) -> Result<()> {
    let counter = build_counter(cfg).context("invalid window configuration")?;
    let before = counter.snapshot().total;
    counter.reset();
    checkpoint(&counter, &cfg.state.path)?;
    println!(
        "Reset {} ({} requests discarded)",
        cfg.state.path.display(), fmt_count(before)
    );
    Ok(())
}

/// Build the counter, restoring the checkpoint when allowed.
/// A missing or corrupt checkpoint is never fatal: both start from zero.
fn build_counter(cfg: &Config) -> Result<SlidingWindowCounter, StatError> {
    let capacity = cfg.capacity()?;
    if !cfg.state.restore {
        info!("state restore disabled, starting from zero");
        return SlidingWindowCounter::new(capacity);
    }
    let path = &cfg.state.path;
    let restored = state_store::load(path).and_then(|s| SlidingWindowCounter::from_state(s, capacity));
    match restored {
        Ok(counter) => {
            info!(
                path = %path.display(),
                total = counter.snapshot().total,
                "restored counter from checkpoint"
            );
            Ok(counter)
        }
        Err(StatError::PersistenceNotFound(_)) => {
            info!(path = %path.display(), "no checkpoint found, starting from zero");
            SlidingWindowCounter::new(capacity)
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "discarding unusable checkpoint, starting from zero");
            SlidingWindowCounter::new(capacity)
        }
    }
}

fn checkpoint(counter: &SlidingWindowCounter, path: &Path) -> Result<(), StatError> {
    state_store::save(path, &counter.to_state())
}

/// Drives `rotate()` once per precision interval. The first rotation happens one
/// full interval after start; missed ticks are replayed so the ring stays aligned
/// with wall-clock time.
async fn rotation_loop(counter: Arc<SlidingWindowCounter>, every: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {
                counter.rotate();
                debug!(snapshot = ?counter.snapshot(), "rotated");
            }
        }
    }
}

async fn checkpoint_loop(
    counter: Arc<SlidingWindowCounter>,
    path: PathBuf,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {
                let c = Arc::clone(&counter);
                let p = path.clone();
                match tokio::task::spawn_blocking(move || checkpoint(&c, &p)).await {
                    Ok(Ok(()))  => debug!(path = %path.display(), "checkpoint written"),
                    Ok(Err(e))  => warn!(error = %e, "periodic checkpoint failed"),
                    Err(e)      => warn!(error = %e, "checkpoint task panicked"),
                }
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => { sig.recv().await; }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn run(cfg: Config) -> Result<()> {
    let counter = Arc::new(build_counter(&cfg).context("invalid window configuration")?);
    let precision = Duration::from_secs(cfg.window.precision_secs);
    info!(
        slots = counter.capacity(),
        precision = %fmt_secs(cfg.window.precision_secs),
        window = %fmt_secs(cfg.window_secs()),
        "counter ready"
    );

    let listener = TcpListener::bind(cfg.bind_addr())
        .await
        .with_context(|| format!("failed to bind {} port {}", cfg.server.host, cfg.server.port))?;

    let shutdown = CancellationToken::new();
    let gateway = Gateway::new(Arc::clone(&counter), cfg.window_secs());
    let mut server = tokio::spawn(gateway.serve(listener, shutdown.clone()));
    let rotator = tokio::spawn(rotation_loop(Arc::clone(&counter), precision, shutdown.clone()));
    let checkpointer = (cfg.state.checkpoint_secs > 0).then(|| {
        tokio::spawn(checkpoint_loop(
            Arc::clone(&counter),
            cfg.state.path.clone(),
            Duration::from_secs(cfg.state.checkpoint_secs),
            shutdown.clone(),
        ))
    });

    let server_result = tokio::select! {
        _ = shutdown_signal() => {
            info!("shutdown requested");
            None
        }
        res = &mut server => Some(res),
    };
    shutdown.cancel();
    let _ = rotator.await;
    if let Some(task) = checkpointer {
        let _ = task.await;
    }
    let server_result = match server_result {
        Some(res) => res,
        None => server.await,
    };

    match checkpoint(&counter, &cfg.state.path) {
        Ok(()) => info!(
            path = %cfg.state.path.display(),
            total = counter.snapshot().total,
            "state saved"
        ),
        Err(e) => error!(error = %e, "state not saved"),
    }

    server_result.context("gateway task panicked")?.context("gateway failed")?;
    Ok(())
}
