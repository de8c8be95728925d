//! Host-runner facade.
//!
//! Wires the tunnel controller, session brokers, and run reporter to the host
//! test runner's lifecycle: `configure` normalises the requested browser
//! definitions and constructs the shared API client, `prepare` establishes
//! the tunnel and tags every definition with its identifier, and
//! `on_browser_end` reports each finished session's outcome. The immutable
//! [`PluginConfig`] is produced once at startup; everything that lives for
//! one run (client handle, tunnel handle, active definitions, brokers) sits
//! in the run-scoped [`RunState`].

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;

use crate::broker::{BrowserDefinition, SessionBroker, WatchdogSignal};
use crate::client::{BrowserStackClient, ClientError, WorkerApi};
use crate::config::{ConfigError, PluginConfig, Verbosity};
use crate::logging::{BrokerLogger, LogConfig};
use crate::reporter::{RunReporter, RunStats};
use crate::shutdown::ShutdownCoordinator;
use crate::tunnel::{TunnelController, TunnelError};

/// Errors surfaced to the host through the lifecycle hooks.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Tunnel(#[from] TunnelError),
    #[error("prepare must run after configure")]
    NotConfigured,
}

/// Run-scoped mutable state, separate from the immutable configuration.
#[derive(Default)]
struct RunState {
    client: Option<Arc<dyn WorkerApi>>,
    tunnel: Option<Arc<TunnelController>>,
    active: Vec<BrowserDefinition>,
    brokers: Vec<Arc<SessionBroker>>,
}

/// The plugin's entry point, owned by the host for the duration of one run.
pub struct SessionPlugin {
    config: PluginConfig,
    logger: Arc<BrokerLogger>,
    shutdown: Arc<ShutdownCoordinator>,
    api_override: Option<Arc<dyn WorkerApi>>,
    state: Mutex<RunState>,
}

impl SessionPlugin {
    pub fn new(config: PluginConfig) -> Self {
        let mut log_config = LogConfig::new(config.verbose);
        log_config.external_logger = config.logger.clone();
        let logger = Arc::new(BrokerLogger::with_config(log_config));
        let shutdown = Arc::new(ShutdownCoordinator::with_defaults(Arc::clone(&logger)));

        Self {
            config,
            logger,
            shutdown,
            api_override: None,
            state: Mutex::new(RunState::default()),
        }
    }

    /// Construct with an explicit provider client instead of building one
    /// from the resolved credentials. Used by tests and by hosts that already
    /// hold a client.
    pub fn with_api(config: PluginConfig, api: Arc<dyn WorkerApi>) -> Self {
        let mut plugin = Self::new(config);
        plugin.api_override = Some(api);
        plugin
    }

    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    pub fn logger(&self) -> Arc<BrokerLogger> {
        Arc::clone(&self.logger)
    }

    /// Process-wide cleanup coordinator. Hosts that install their own signal
    /// handling call `run_cleanup` from it; standalone consumers spawn
    /// [`ShutdownCoordinator::listen`].
    pub fn shutdown(&self) -> Arc<ShutdownCoordinator> {
        Arc::clone(&self.shutdown)
    }

    /// `configure` lifecycle hook.
    ///
    /// Normalises every requested browser definition (defaults, build label,
    /// WebDriver keys), constructs the shared API client, and returns the
    /// normalised definitions for the host's active-browsers list. With an
    /// empty browser list this completes immediately and creates nothing.
    pub async fn configure(&self) -> Result<Vec<BrowserDefinition>, PluginError> {
        if self.config.browsers.is_empty() {
            return Ok(Vec::new());
        }

        let build_label = self.config.build_label();
        let active: Vec<BrowserDefinition> = self
            .config
            .browsers
            .iter()
            .map(|def| def.normalized(&self.config.defaults, build_label.as_deref()))
            .collect();

        let client = match &self.api_override {
            Some(api) => Arc::clone(api),
            None => Arc::new(BrowserStackClient::new(
                self.config.credentials(),
                &self.config.api_url,
                &self.config.automate_url,
            )?) as Arc<dyn WorkerApi>,
        };

        let mut state = self.state.lock().await;
        state.client = Some(client);
        state.active = active.clone();

        self.logger.debug(
            format!("configured {} remote browsers", active.len()),
            Some("plugin"),
            None,
        );
        Ok(active)
    }

    /// `prepare` lifecycle hook.
    ///
    /// Establishes the tunnel and tags every active definition with the
    /// tunnel identifier. Must run after [`configure`](Self::configure);
    /// completes immediately when no remote browsers were requested. A tunnel
    /// start failure aborts the run.
    pub async fn prepare(&self) -> Result<(), PluginError> {
        if self.config.browsers.is_empty() {
            return Ok(());
        }

        let mut state = self.state.lock().await;
        if state.client.is_none() {
            return Err(PluginError::NotConfigured);
        }

        let mut options = self.config.tunnel.clone();
        if options.key.is_none() {
            options.key = self.config.credentials().access_key;
        }
        options.force_kill = options.force_kill || self.config.force_kill();
        options.verbose = options.verbose || self.config.verbose == Verbosity::Detailed;

        let tunnel = Arc::new(TunnelController::establish(&options, Arc::clone(&self.logger)).await?);
        let identifier = tunnel.local_identifier().to_string();
        for def in &mut state.active {
            def.local = true;
            def.local_identifier = Some(identifier.clone());
        }

        let cleanup = Arc::clone(&tunnel);
        self.shutdown.on_interrupt(move || async move {
            cleanup.teardown().await;
        });

        state.tunnel = Some(tunnel);
        Ok(())
    }

    /// Instantiate a session broker for one active browser definition. The
    /// host's generic driver receives it through the `SessionRunner`
    /// capability contract; its interrupt cleanup is registered here, once.
    pub async fn create_runner(
        &self,
        definition: BrowserDefinition,
        test_url: impl Into<String>,
        watchdog: Option<WatchdogSignal>,
    ) -> Result<Arc<SessionBroker>, PluginError> {
        let mut state = self.state.lock().await;
        let client = state.client.clone().ok_or(PluginError::NotConfigured)?;

        let broker = Arc::new(SessionBroker::new(
            definition,
            test_url,
            client,
            Arc::clone(&self.logger),
            watchdog,
        ));
        broker.register_interrupt(&self.shutdown);
        state.brokers.push(Arc::clone(&broker));
        Ok(broker)
    }

    /// `browser-end` event handler. For serial runs every completion extends
    /// the watchdog of the brokers still in flight; when the host supplies a
    /// session id the outcome is pushed to the provider. Never fails the
    /// event.
    pub async fn on_browser_end(
        &self,
        definition: &BrowserDefinition,
        error: Option<&str>,
        stats: &RunStats,
        session_id: Option<&str>,
    ) {
        if self.config.browsers.is_empty() {
            return;
        }

        match error {
            Some(error) => self.logger.debug(
                format!("{} finished with error: {error}", definition.label()),
                Some("plugin"),
                None,
            ),
            None => self.logger.debug(
                format!("{} finished", definition.label()),
                Some("plugin"),
                None,
            ),
        }

        let (client, brokers) = {
            let state = self.state.lock().await;
            (state.client.clone(), state.brokers.clone())
        };

        if !self.config.parallel {
            self.logger.debug(
                "serial run; extending timeouts",
                Some("plugin"),
                None,
            );
            for broker in &brokers {
                broker.extend_timeout();
            }
        }

        let Some(session_id) = session_id else {
            return;
        };
        let Some(client) = client else {
            return;
        };

        RunReporter::new(client, Arc::clone(&self.logger))
            .report(session_id, stats)
            .await;
    }

    /// Tear down run-scoped resources on normal completion. Idempotent with
    /// the interrupt path: whichever runs first stops the tunnel.
    pub async fn teardown(&self) {
        let tunnel = self.state.lock().await.tunnel.clone();
        if let Some(tunnel) = tunnel {
            tunnel.teardown().await;
        }
    }

    /// The normalised definitions produced by `configure`, including any
    /// tunnel tagging applied by `prepare`.
    pub async fn active_browsers(&self) -> Vec<BrowserDefinition> {
        self.state.lock().await.active.clone()
    }

    /// Identifier of the established tunnel, if `prepare` has run.
    pub async fn tunnel_identifier(&self) -> Option<String> {
        self.state
            .lock()
            .await
            .tunnel
            .as_ref()
            .map(|tunnel| tunnel.local_identifier().to_string())
    }

    #[cfg(test)]
    async fn has_client(&self) -> bool {
        self.state.lock().await.client.is_some()
    }
}
