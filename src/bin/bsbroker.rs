//! BrowserStack broker CLI.
//!
//! Provides a smoke-check workflow against real credentials: configure the
//! plugin with a single browser definition, optionally establish the tunnel,
//! create a remote worker, report a completed status, and terminate.
//!
//! Usage examples:
//!   Plain check against a public URL:
//!     $ BROWSER_STACK_USERNAME=... BROWSER_STACK_ACCESS_KEY=... \
//!       cargo run --bin bsbroker -- check --browser chrome --os Windows --os-version 11
//!   Through the tunnel, against a locally served suite:
//!     $ BROWSER_STACK_USERNAME=... BROWSER_STACK_ACCESS_KEY=... \
//!       cargo run --bin bsbroker -- check --tunnel --url http://localhost:8081/suite.html

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use browserstack_broker::broker::{BrowserDefinition, SessionRunner};
use browserstack_broker::config::{PluginConfig, Verbosity};
use browserstack_broker::logging::{LogCallback, LogLevel, LogRecord};
use browserstack_broker::plugin::SessionPlugin;
use browserstack_broker::reporter::{RUN_COMPLETE, RunStats};
use clap::{Args, Parser, Subcommand};
use log::{debug, error, info, warn};
use tokio::time::sleep;

#[derive(Parser)]
#[command(
    name = "bsbroker",
    author,
    version,
    about = "BrowserStack session broker utilities"
)]
struct Cli {
    /// Increase log verbosity (pass multiple times for DEBUG).
    #[arg(long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create one remote worker, report its status, and terminate it.
    Check(CheckArgs),
}

#[derive(Args)]
struct CheckArgs {
    /// Page URL the remote browser must load.
    #[arg(long, default_value = "https://www.example.com")]
    url: String,

    /// Browser to request from the provider.
    #[arg(long, default_value = "chrome")]
    browser: String,

    /// Browser version; the provider default applies when omitted.
    #[arg(long)]
    browser_version: Option<String>,

    #[arg(long, default_value = "Windows")]
    os: String,

    #[arg(long, default_value = "11")]
    os_version: String,

    /// Establish the secure tunnel before creating the worker.
    #[arg(long)]
    tunnel: bool,

    /// Keep the worker alive for N seconds before terminating it.
    #[arg(long, default_value_t = 0)]
    dwell_seconds: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_env_logger();

    let cli = Cli::parse();
    let verbosity = verbosity_from_count(cli.verbose);

    match cli.command {
        Command::Check(args) => {
            run_check(args, verbosity).await?;
        }
    }

    Ok(())
}

async fn run_check(args: CheckArgs, verbosity: Verbosity) -> Result<()> {
    let mut config = PluginConfig::from_env().context("failed to read configuration")?;
    config.verbose = verbosity;
    config.logger = Some(make_logger_callback());
    config.browsers = vec![BrowserDefinition {
        browser: Some(args.browser.clone()),
        browser_version: args.browser_version.clone(),
        os: Some(args.os.clone()),
        os_version: Some(args.os_version.clone()),
        ..BrowserDefinition::default()
    }];

    let plugin = SessionPlugin::new(config);

    let active = plugin
        .configure()
        .await
        .context("failed to configure plugin")?;
    info!("Configured {} remote browser(s)", active.len());

    if args.tunnel {
        plugin
            .prepare()
            .await
            .context("failed to establish tunnel")?;
        info!(
            "Tunnel established ({})",
            plugin
                .tunnel_identifier()
                .await
                .unwrap_or_else(|| "unknown".to_string())
        );
    }

    tokio::spawn(plugin.shutdown().listen());

    let definition = plugin
        .active_browsers()
        .await
        .into_iter()
        .next()
        .context("no active browser definition")?;
    let label = definition.label();

    let runner = plugin
        .create_runner(definition, &args.url, None)
        .await
        .context("failed to create session runner")?;

    runner.init_browser().await.context("init failed")?;
    runner
        .attach_browser()
        .await
        .with_context(|| format!("failed to create remote worker for {label}"))?;
    runner.mark_running().await;

    if let Some(worker) = runner.worker().await {
        info!("Worker {} is live", worker.id);
        if let Some(url) = worker.browser_url.as_deref() {
            info!("Session dashboard: {url}");
        }
    }

    if args.dwell_seconds > 0 {
        sleep(Duration::from_secs(args.dwell_seconds)).await;
    }

    match runner.session_id().await {
        Some(session_id) => {
            plugin
                .on_browser_end(
                    runner.definition(),
                    None,
                    &RunStats {
                        status: RUN_COMPLETE.to_string(),
                        failing: 0,
                    },
                    Some(&session_id),
                )
                .await;
        }
        None => warn!("No session id available; skipping status report"),
    }

    if let Err(err) = runner.quit_browser().await {
        warn!("Failed to terminate worker: {err}");
    }

    plugin.teardown().await;
    info!("Check completed");
    Ok(())
}

fn verbosity_from_count(count: u8) -> Verbosity {
    match count {
        0 => Verbosity::Medium,
        _ => Verbosity::Detailed,
    }
}

fn make_logger_callback() -> LogCallback {
    Arc::new(|record: &LogRecord| {
        let message = match &record.category {
            Some(category) => format!("[{category}] {}", record.message),
            None => record.message.clone(),
        };
        match record.level {
            LogLevel::Error => error!("{message}"),
            LogLevel::Warn => warn!("{message}"),
            LogLevel::Info => info!("{message}"),
            LogLevel::Debug => debug!("{message}"),
        }
    })
}

fn init_env_logger() {
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info,bsbroker=debug"),
    )
    .try_init();
}
