//! proxylb - an HTTP reverse-proxy load balancer
//!
//! Usage:
//!     proxylb --config <path>
//!
//! See --help for more options.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use proxylb::admin::{AdminContext, AdminServer};
use proxylb::config::{load_config, Config, ConfigWatcher};
use proxylb::frontend::FrontendListener;
use proxylb::health::HealthChecker;
use proxylb::proxy::Dispatcher;
use proxylb::util::init_logging;
use proxylb::AppState;

/// HTTP reverse-proxy load balancer.
#[derive(Parser, Debug)]
#[command(name = "proxylb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE", default_value = "config.json")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config).with_context(|| {
        format!(
            "failed to load configuration from '{}'",
            cli.config.display()
        )
    })?;

    // CLI overrides config
    let log_level = cli.log_level.as_deref().unwrap_or(&config.log_level);
    init_logging(log_level, &config.log_format);

    if cli.validate {
        info!("configuration is valid");
        println!("Configuration is valid.");
        println!("  Listen: {}", config.listen_addr());
        println!("  Admin: {}", config.admin_addr());
        println!("  Strategy: {}", config.strategy);
        println!("  Sticky sessions: {}", config.enable_sticky_sessions);
        println!("  Backends: {}", config.backends.len());
        for backend in &config.backends {
            println!("    - {} (weight {})", backend.url, backend.effective_weight());
        }
        return Ok(());
    }

    info!(
        config_path = %cli.config.display(),
        listen = %config.listen_addr(),
        admin = %config.admin_addr(),
        strategy = %config.strategy,
        sticky = config.enable_sticky_sessions,
        backends = config.backends.len(),
        "proxylb starting"
    );

    run(config, cli.config)
}

/// Run the load balancer with the given configuration.
fn run(config: Config, config_path: PathBuf) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    runtime.block_on(run_async(config, config_path))
}

/// Async entry point for the load balancer.
async fn run_async(config: Config, config_path: PathBuf) -> Result<()> {
    let state = AppState::new(config.clone()).context("failed to build backend registry")?;
    let balancer = Arc::clone(state.balancer());
    let metrics = state.metrics().clone();
    let shutdown = state.shutdown().clone();

    let dispatcher = Arc::new(Dispatcher::from_config(&config, Arc::clone(&balancer), metrics.clone()));
    let listener = FrontendListener::bind(config.listen_addr(), dispatcher)
        .await
        .with_context(|| format!("failed to bind proxy listener on {}", config.listen_addr()))?;

    let admin = AdminServer::bind(
        config.admin_addr(),
        AdminContext {
            balancer: Arc::clone(&balancer),
            metrics: metrics.clone(),
        },
    )
    .await
    .with_context(|| format!("failed to bind admin server on {}", config.admin_addr()))?;

    let checker = HealthChecker::new(
        Arc::clone(&balancer),
        config.health_check_method,
        config.health_check_frequency,
        config.probe_timeout(),
        metrics,
    );

    let reload_state = state.clone();
    let watcher = ConfigWatcher::new(
        config_path,
        Box::new(move |new_config| {
            reload_state.apply_config(new_config);
        }),
    );

    let mut handles = vec![
        tokio::spawn(listener.run(shutdown.subscribe())),
        tokio::spawn(admin.run(shutdown.subscribe())),
        tokio::spawn(checker.run(shutdown.subscribe())),
        tokio::spawn(watcher.run(shutdown.subscribe())),
    ];

    if let Some(sticky) = state.sticky() {
        handles.push(tokio::spawn(Arc::clone(sticky).run_sweeper(shutdown.subscribe())));
    }

    info!("proxylb is running");
    info!("press Ctrl+C to stop");

    shutdown.wait_for_signal().await;

    for handle in handles {
        let _ = handle.await;
    }

    info!("proxylb shut down complete");
    Ok(())
}
