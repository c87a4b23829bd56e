//! Sandrun launcher.
//!
//! Two operator commands exercise the core: `generate-key` writes a fresh
//! worker keypair and exits; `serve` assembles the execution core and runs
//! until interrupted, then drains. The HTTP/WebSocket transport mounts on
//! top of the running service; nothing in this binary speaks a wire
//! protocol.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sandrun_logging::LogConfig;
use sandrun_protocol::{defaults, SystemConfig};
use sandrun_security::WorkerIdentity;
use sandrun_sentinel::{RateLimitConfig, Sentinel, SentinelConfig, ShutdownMode};
use sandrun_worker::env_manager::{EnvironmentManager, EnvironmentTemplate};
use sandrun_worker::sandbox::SandboxRuntime;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "sandrun", about = "Anonymous ephemeral code execution service")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a worker keypair PEM and exit
    GenerateKey {
        /// Where to write the private key
        path: PathBuf,
    },
    /// Run the execution core until interrupted
    Serve {
        /// Worker key file; omit to run in anonymous mode
        #[arg(long)]
        worker_key: Option<PathBuf>,

        /// RAM-backed root for per-job work dirs
        #[arg(long, default_value = defaults::DEFAULT_WORK_ROOT)]
        work_root: PathBuf,

        /// Environment cache root
        #[arg(long, default_value = defaults::DEFAULT_ENV_CACHE_ROOT)]
        env_root: PathBuf,

        /// Dispatch queue capacity
        #[arg(long, default_value_t = defaults::DEFAULT_QUEUE_CAPACITY)]
        queue_capacity: usize,

        /// Size of the executor pool
        #[arg(long, default_value_t = defaults::DEFAULT_WORKER_COUNT)]
        workers: usize,

        /// Environment template definitions (JSON array) to register at startup
        #[arg(long)]
        templates: Option<PathBuf>,

        /// Mirror full logs to stderr, not just warnings
        #[arg(long)]
        verbose: bool,
    },
}

fn main() -> Result<()> {
    match Cli::parse().command {
        Commands::GenerateKey { path } => generate_key(path),
        Commands::Serve {
            worker_key,
            work_root,
            env_root,
            queue_capacity,
            workers,
            templates,
            verbose,
        } => serve(
            worker_key,
            work_root,
            env_root,
            queue_capacity,
            workers,
            templates,
            verbose,
        ),
    }
}

fn generate_key(path: PathBuf) -> Result<()> {
    let identity = WorkerIdentity::generate();
    identity
        .save_pem(&path)
        .with_context(|| format!("failed to write worker key to {}", path.display()))?;
    println!("{}", identity.worker_id());
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn serve(
    worker_key: Option<PathBuf>,
    work_root: PathBuf,
    env_root: PathBuf,
    queue_capacity: usize,
    workers: usize,
    templates: Option<PathBuf>,
    verbose: bool,
) -> Result<()> {
    sandrun_logging::init_logging(LogConfig {
        app_name: "sandrun",
        verbose,
    })?;

    let identity = match worker_key {
        Some(path) => {
            let identity = WorkerIdentity::load_pem(&path)
                .with_context(|| format!("failed to load worker key {}", path.display()))?;
            Some(Arc::new(identity))
        }
        None => {
            info!("no worker key configured, running in anonymous mode");
            None
        }
    };

    let config = SentinelConfig {
        system: SystemConfig {
            work_root,
            env_cache_root: env_root.clone(),
            queue_capacity,
            worker_count: workers,
            ..SystemConfig::default()
        },
        rate: RateLimitConfig::default(),
        janitor_tick: Duration::from_secs(5),
    };

    let env_manager = Arc::new(
        EnvironmentManager::new(env_root).context("failed to initialize environment cache")?,
    );
    if let Some(path) = templates {
        register_templates(&env_manager, &path)?;
    }

    let sentinel = Sentinel::start(config, env_manager, sandbox_runtime(), identity)
        .context("failed to start sentinel")?;
    let service = sentinel.service();
    println!(
        "{}",
        serde_json::to_string(&service.health()).expect("health serializes")
    );

    wait_for_interrupt();
    info!("interrupt received, draining");
    sentinel.shutdown(ShutdownMode::Drain);
    Ok(())
}

fn register_templates(env_manager: &EnvironmentManager, path: &PathBuf) -> Result<()> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("failed to read templates from {}", path.display()))?;
    let templates: Vec<EnvironmentTemplate> =
        serde_json::from_slice(&bytes).context("templates file is not a JSON array")?;
    for template in templates {
        info!(name = %template.name, "registering environment template");
        env_manager.register_template(template);
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn sandbox_runtime() -> Arc<dyn SandboxRuntime> {
    Arc::new(sandrun_worker::sandbox::native::NativeSandbox::new())
}

#[cfg(not(target_os = "linux"))]
fn sandbox_runtime() -> Arc<dyn SandboxRuntime> {
    warn!("no native isolation on this platform; jobs will be refused");
    Arc::new(sandrun_worker::sandbox::stub::StubSandbox)
}

fn wait_for_interrupt() {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("signal runtime builds");
    runtime.block_on(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "ctrl-c handler failed, exiting");
        }
    });
}
