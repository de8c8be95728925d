//! Live smoke test against the real BrowserStack API.
//!
//! Ignored by default because it requires:
//! - `BROWSER_STACK_USERNAME` / `BROWSER_STACK_ACCESS_KEY` with Automate
//!   access.
//! Running it creates one real worker, pushes a completed status for its
//! session, and terminates the worker, exercising the reqwest client end to
//! end.

use std::env;

use anyhow::{Context, Result};
use browserstack_broker::broker::{BrowserDefinition, SessionRunner};
use browserstack_broker::config::{ACCESS_KEY_ENV, PluginConfig, USERNAME_ENV};
use browserstack_broker::plugin::SessionPlugin;
use browserstack_broker::reporter::{RUN_COMPLETE, RunStats};

fn build_config() -> Result<PluginConfig> {
    env::var(USERNAME_ENV).context("BROWSER_STACK_USERNAME must be set for the live test")?;
    env::var(ACCESS_KEY_ENV).context("BROWSER_STACK_ACCESS_KEY must be set for the live test")?;

    let mut config = PluginConfig::from_env().context("failed to read configuration")?;
    config.browsers = vec![BrowserDefinition {
        browser: Some("chrome".into()),
        os: Some("Windows".into()),
        os_version: Some("11".into()),
        ..BrowserDefinition::default()
    }];
    Ok(config)
}

#[tokio::test]
#[ignore]
async fn live_worker_roundtrip() -> Result<()> {
    let config = build_config()?;
    let plugin = SessionPlugin::new(config);

    let active = plugin.configure().await.context("configure failed")?;
    let definition = active
        .into_iter()
        .next()
        .context("no active browser definition")?;

    let runner = plugin
        .create_runner(definition, "https://www.example.com", None)
        .await
        .context("failed to create session runner")?;

    runner.init_browser().await.context("init failed")?;
    runner
        .attach_browser()
        .await
        .context("worker creation failed")?;
    runner.mark_running().await;

    let worker = runner.worker().await.context("worker should be live")?;
    assert!(worker.id > 0);

    if let Some(session_id) = runner.session_id().await {
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

    runner
        .quit_browser()
        .await
        .context("failed to terminate worker")?;
    Ok(())
}
