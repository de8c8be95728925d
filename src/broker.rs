//! Per-browser remote session brokering.
//!
//! One [`SessionBroker`] is created for each requested browser definition and
//! driven by the host runner through the [`SessionRunner`] capability
//! contract: initialise a placeholder, attach a remote worker, run the suite,
//! quit. The broker owns the worker handle for its lifetime and guarantees it
//! is terminated at most once across normal teardown and interrupt.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::client::{ClientError, RemoteWorker, WorkerApi, WorkerRequest};
use crate::config::BrowserDefaults;
use crate::logging::BrokerLogger;
use crate::shutdown::ShutdownCoordinator;

/// Signal the host runner exposes to extend its run-timeout watchdog.
pub type WatchdogSignal = Arc<dyn Fn() + Send + Sync + 'static>;

/// One requested remote browser instance.
///
/// Configured with provider keys (`browser`, `browser_version`, `os`,
/// `os_version`, `device`); the WebDriver-style keys (`browser_name`,
/// `version`, `platform`) are derived during normalisation so the host
/// runner's generic driver can display and select sessions uniformly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserDefinition {
    pub browser: Option<String>,
    #[serde(alias = "browserVersion")]
    pub browser_version: Option<String>,
    pub os: Option<String>,
    #[serde(alias = "osVersion")]
    pub os_version: Option<String>,
    pub device: Option<String>,
    #[serde(alias = "browserName")]
    pub browser_name: Option<String>,
    pub version: Option<String>,
    pub platform: Option<String>,
    pub name: Option<String>,
    pub build: Option<String>,
    pub project: Option<String>,
    #[serde(alias = "localIdentifier")]
    pub local_identifier: Option<String>,
    pub local: bool,
}

impl BrowserDefinition {
    /// Merge run defaults, attach the build label, and derive the
    /// WebDriver-style keys.
    pub fn normalized(
        &self,
        defaults: &BrowserDefaults,
        build_label: Option<&str>,
    ) -> BrowserDefinition {
        let mut def = self.clone();

        if def.browser_version.is_none() && def.device.is_none() {
            def.browser_version = Some(defaults.browser_version().to_string());
        }
        if def.name.is_none() {
            def.name = Some(defaults.run_name().to_string());
        }
        if def.build.is_none() {
            def.build = build_label.map(str::to_string);
        }
        if def.project.is_none() {
            def.project = defaults.project.clone();
        }

        def.browser_name = def
            .browser_name
            .take()
            .or_else(|| def.browser.clone())
            .or_else(|| def.device.clone());
        def.version = def
            .version
            .take()
            .or_else(|| def.browser_version.clone())
            .or_else(|| def.os_version.clone());
        def.platform = def.platform.take().or_else(|| def.os.clone());
        if let (Some(platform), Some(os_version)) = (&def.platform, &def.os_version) {
            def.platform = Some(format!("{platform} {os_version}"));
        }

        def
    }

    /// Sanitised worker-creation payload: provider keys plus the target URL,
    /// with the derived WebDriver keys and plugin metadata stripped.
    pub fn worker_request(&self, url: impl Into<String>) -> WorkerRequest {
        WorkerRequest {
            os: self.os.clone(),
            os_version: self.os_version.clone(),
            browser: self.browser.clone(),
            browser_version: self.browser_version.clone(),
            device: self.device.clone(),
            url: url.into(),
            name: self.name.clone(),
            build: self.build.clone(),
            project: self.project.clone(),
            local: self.local,
            local_identifier: self.local_identifier.clone(),
        }
    }

    /// Human-readable label for log messages.
    pub fn label(&self) -> String {
        self.browser_name
            .clone()
            .or_else(|| self.browser.clone())
            .or_else(|| self.device.clone())
            .unwrap_or_else(|| "browser".to_string())
    }
}

/// Broker lifecycle states, in driving order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    Uninitialized,
    BrowserInitialized,
    Attaching,
    Attached,
    Running,
    Terminating,
    Terminated,
    /// Terminal: worker creation failed; the error has been surfaced upward.
    AttachFailed,
}

/// Errors surfaced by [`SessionBroker`] operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to create remote worker for {label}: {source}")]
    Attach {
        label: String,
        #[source]
        source: ClientError,
    },
    #[error("failed to terminate remote worker {worker_id}: {source}")]
    Terminate {
        worker_id: u64,
        #[source]
        source: ClientError,
    },
    #[error("no live worker to terminate")]
    NoWorker,
    #[error("operation not valid in state {state:?}")]
    InvalidState { state: BrokerState },
}

/// Capability contract the host's generic runner driver operates per browser
/// definition. The driver depends only on this trait, never on the concrete
/// broker type.
#[async_trait]
pub trait SessionRunner: Send + Sync {
    async fn init_browser(&self) -> Result<(), BrokerError>;
    async fn attach_browser(&self) -> Result<(), BrokerError>;
    async fn quit_browser(&self) -> Result<(), BrokerError>;
}

/// Per-browser-definition session lifecycle manager.
pub struct SessionBroker {
    definition: BrowserDefinition,
    test_url: String,
    api: Arc<dyn WorkerApi>,
    logger: Arc<BrokerLogger>,
    watchdog: Option<WatchdogSignal>,
    state: Mutex<BrokerState>,
    worker: Mutex<Option<RemoteWorker>>,
}

impl fmt::Debug for SessionBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionBroker")
            .field("definition", &self.definition)
            .field("test_url", &self.test_url)
            .field("watchdog", &self.watchdog.is_some())
            .finish_non_exhaustive()
    }
}

impl SessionBroker {
    pub fn new(
        definition: BrowserDefinition,
        test_url: impl Into<String>,
        api: Arc<dyn WorkerApi>,
        logger: Arc<BrokerLogger>,
        watchdog: Option<WatchdogSignal>,
    ) -> Self {
        Self {
            definition,
            test_url: test_url.into(),
            api,
            logger,
            watchdog,
            state: Mutex::new(BrokerState::Uninitialized),
            worker: Mutex::new(None),
        }
    }

    pub fn definition(&self) -> &BrowserDefinition {
        &self.definition
    }

    pub async fn state(&self) -> BrokerState {
        *self.state.lock().await
    }

    pub async fn worker(&self) -> Option<RemoteWorker> {
        self.worker.lock().await.clone()
    }

    /// Automate session id of the live worker, once the extended info fetch
    /// has populated the live-session URL.
    pub async fn session_id(&self) -> Option<String> {
        self.worker
            .lock()
            .await
            .as_ref()
            .and_then(|worker| worker.session_id().map(str::to_string))
    }

    /// Signal the host watchdog to extend its run timeout.
    pub fn extend_timeout(&self) {
        if let Some(watchdog) = &self.watchdog {
            watchdog();
        }
    }

    /// Mark the session as running its suite. The host driver calls this once
    /// the remote browser has loaded the first test page.
    pub async fn mark_running(&self) {
        let mut state = self.state.lock().await;
        if *state == BrokerState::Attached {
            *state = BrokerState::Running;
        }
    }

    /// Register this broker's interrupt cleanup with the process-wide
    /// coordinator. Called exactly once, at construction time by the plugin.
    pub fn register_interrupt(self: &Arc<Self>, coordinator: &ShutdownCoordinator) {
        let broker = Arc::clone(self);
        coordinator.on_interrupt(move || async move {
            broker.terminate_live_worker().await;
        });
    }

    /// Terminate the live worker, if any, at most once. Failures are logged
    /// and swallowed; this is the interrupt path and the process is already
    /// exiting.
    pub async fn terminate_live_worker(&self) {
        let worker = self.worker.lock().await.take();
        let Some(worker) = worker else {
            return;
        };

        *self.state.lock().await = BrokerState::Terminating;
        self.logger.debug(
            format!("terminating worker {}", worker.id),
            Some("broker"),
            None,
        );
        if let Err(err) = self.api.terminate_worker(worker.id).await {
            self.logger.warn(
                format!("failed to terminate worker {}: {err}", worker.id),
                Some("broker"),
                None,
            );
        }
        *self.state.lock().await = BrokerState::Terminated;
    }
}

#[async_trait]
impl SessionRunner for SessionBroker {
    async fn init_browser(&self) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        if *state != BrokerState::Uninitialized {
            return Err(BrokerError::InvalidState { state: *state });
        }
        *state = BrokerState::BrowserInitialized;
        Ok(())
    }

    async fn attach_browser(&self) -> Result<(), BrokerError> {
        {
            let mut state = self.state.lock().await;
            if *state != BrokerState::BrowserInitialized {
                return Err(BrokerError::InvalidState { state: *state });
            }
            *state = BrokerState::Attaching;
        }

        let request = self.definition.worker_request(&self.test_url);
        self.logger.debug(
            format!("creating worker for {}", self.definition.label()),
            Some("broker"),
            serde_json::to_value(&request).ok(),
        );

        let worker = match self.api.create_worker(&request).await {
            Ok(worker) => worker,
            Err(source) => {
                *self.state.lock().await = BrokerState::AttachFailed;
                return Err(BrokerError::Attach {
                    label: self.definition.label(),
                    source,
                });
            }
        };

        self.extend_timeout();
        self.logger.debug(
            format!("worker {} created", worker.id),
            Some("broker"),
            None,
        );

        let worker_id = worker.id;
        *self.worker.lock().await = Some(worker);
        *self.state.lock().await = BrokerState::Attached;

        // Secondary fetch for extended session info. Never fatal: the broker
        // is attached either way, just without a live-session URL.
        match self.api.fetch_worker(worker_id).await {
            Ok(updated) => {
                if let Some(url) = updated.browser_url.as_deref() {
                    self.logger.info(
                        format!("{} session at {url}", self.definition.label()),
                        Some("broker"),
                        None,
                    );
                }
                let mut guard = self.worker.lock().await;
                // An interrupt may already have cleared the slot; do not
                // resurrect a terminated worker.
                if guard.is_some() {
                    *guard = Some(updated);
                }
            }
            Err(err) => {
                self.logger.warn(
                    format!("failed to fetch worker session: {err}"),
                    Some("broker"),
                    None,
                );
            }
        }

        Ok(())
    }

    async fn quit_browser(&self) -> Result<(), BrokerError> {
        let worker = self.worker.lock().await.take();
        let Some(worker) = worker else {
            return Err(BrokerError::NoWorker);
        };

        *self.state.lock().await = BrokerState::Terminating;
        self.logger.debug(
            format!("terminating worker {}", worker.id),
            Some("broker"),
            None,
        );

        let result = self.api.terminate_worker(worker.id).await;
        *self.state.lock().await = BrokerState::Terminated;
        result.map_err(|source| BrokerError::Terminate {
            worker_id: worker.id,
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::SessionStatus;
    use crate::config::Verbosity;
    use crate::logging::LogConfig;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn test_logger() -> Arc<BrokerLogger> {
        let mut config = LogConfig::new(Verbosity::Minimal);
        config.external_logger = Some(Arc::new(|_record| {}));
        Arc::new(BrokerLogger::with_config(config))
    }

    #[derive(Default)]
    struct RecordingApi {
        create_calls: StdMutex<Vec<WorkerRequest>>,
        fetch_calls: StdMutex<Vec<u64>>,
        terminate_calls: StdMutex<Vec<u64>>,
        fail_create: bool,
        fail_fetch: bool,
        fail_terminate: bool,
        browser_url: Option<String>,
    }

    #[async_trait]
    impl WorkerApi for RecordingApi {
        async fn create_worker(
            &self,
            request: &WorkerRequest,
        ) -> Result<RemoteWorker, ClientError> {
            self.create_calls.lock().unwrap().push(request.clone());
            if self.fail_create {
                return Err(ClientError::MissingWorkerId);
            }
            Ok(RemoteWorker {
                id: 42,
                status: None,
                browser_url: None,
            })
        }

        async fn fetch_worker(&self, worker_id: u64) -> Result<RemoteWorker, ClientError> {
            self.fetch_calls.lock().unwrap().push(worker_id);
            if self.fail_fetch {
                return Err(ClientError::MissingWorkerId);
            }
            Ok(RemoteWorker {
                id: worker_id,
                status: Some("running".into()),
                browser_url: self.browser_url.clone(),
            })
        }

        async fn terminate_worker(&self, worker_id: u64) -> Result<(), ClientError> {
            self.terminate_calls.lock().unwrap().push(worker_id);
            if self.fail_terminate {
                return Err(ClientError::MissingWorkerId);
            }
            Ok(())
        }

        async fn update_session(
            &self,
            _session_id: &str,
            _status: SessionStatus,
        ) -> Result<(), ClientError> {
            Ok(())
        }
    }

    fn chrome_definition() -> BrowserDefinition {
        BrowserDefinition {
            browser: Some("chrome".into()),
            browser_version: Some("latest".into()),
            os: Some("Windows".into()),
            os_version: Some("11".into()),
            ..BrowserDefinition::default()
        }
    }

    fn broker_with(api: Arc<RecordingApi>, watchdog: Option<WatchdogSignal>) -> SessionBroker {
        SessionBroker::new(
            chrome_definition(),
            "http://localhost:8081/suite.html",
            api,
            test_logger(),
            watchdog,
        )
    }

    #[test]
    fn normalized_derives_webdriver_keys() {
        let defaults = BrowserDefaults::default();
        let def = chrome_definition().normalized(&defaults, Some("build-7"));

        assert_eq!(def.browser_name.as_deref(), Some("chrome"));
        assert_eq!(def.version.as_deref(), Some("latest"));
        assert_eq!(def.platform.as_deref(), Some("Windows 11"));
        assert_eq!(def.name.as_deref(), Some("Web test"));
        assert_eq!(def.build.as_deref(), Some("build-7"));
    }

    #[test]
    fn normalized_falls_back_to_device() {
        let defaults = BrowserDefaults::default();
        let def = BrowserDefinition {
            device: Some("iPhone 15".into()),
            os: Some("ios".into()),
            os_version: Some("17".into()),
            ..BrowserDefinition::default()
        }
        .normalized(&defaults, None);

        assert_eq!(def.browser_name.as_deref(), Some("iPhone 15"));
        assert_eq!(def.version.as_deref(), Some("17"));
        assert_eq!(def.platform.as_deref(), Some("ios 17"));
        assert!(def.build.is_none());
        // Device sessions must not inherit a desktop browser version.
        assert!(def.browser_version.is_none());
    }

    #[test]
    fn worker_request_strips_derived_keys() {
        let defaults = BrowserDefaults::default();
        let def = chrome_definition().normalized(&defaults, None);
        let request = def.worker_request("http://localhost:8081/suite.html");

        let value = serde_json::to_value(&request).expect("serialise");
        assert_eq!(value["browser"], "chrome");
        assert_eq!(value["url"], "http://localhost:8081/suite.html");
        assert!(value.get("browserName").is_none());
        assert!(value.get("platform").is_none());
    }

    #[tokio::test]
    async fn lifecycle_reaches_attached_with_session_info() {
        let api = Arc::new(RecordingApi {
            browser_url: Some("https://automate.browserstack.com/sessions/sess-1".into()),
            ..RecordingApi::default()
        });
        let extensions = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&extensions);
        let watchdog: WatchdogSignal = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let broker = broker_with(Arc::clone(&api), Some(watchdog));
        broker.init_browser().await.expect("init");
        assert_eq!(broker.state().await, BrokerState::BrowserInitialized);

        broker.attach_browser().await.expect("attach");
        assert_eq!(broker.state().await, BrokerState::Attached);
        assert_eq!(broker.worker().await.map(|w| w.id), Some(42));
        assert_eq!(broker.session_id().await.as_deref(), Some("sess-1"));
        assert_eq!(extensions.load(Ordering::SeqCst), 1);
        assert_eq!(api.create_calls.lock().unwrap().len(), 1);
        assert_eq!(api.fetch_calls.lock().unwrap().as_slice(), &[42]);

        broker.mark_running().await;
        assert_eq!(broker.state().await, BrokerState::Running);

        broker.quit_browser().await.expect("quit");
        assert_eq!(broker.state().await, BrokerState::Terminated);
        assert_eq!(api.terminate_calls.lock().unwrap().as_slice(), &[42]);
    }

    #[tokio::test]
    async fn attach_resolves_when_secondary_fetch_fails() {
        let api = Arc::new(RecordingApi {
            fail_fetch: true,
            ..RecordingApi::default()
        });

        let broker = broker_with(Arc::clone(&api), None);
        broker.init_browser().await.expect("init");
        broker.attach_browser().await.expect("attach still resolves");

        let worker = broker.worker().await.expect("worker is set");
        assert_eq!(worker.id, 42);
        assert!(worker.browser_url.is_none());
        assert_eq!(broker.session_id().await, None);
        assert_eq!(broker.state().await, BrokerState::Attached);
    }

    #[tokio::test]
    async fn attach_failure_is_terminal() {
        let api = Arc::new(RecordingApi {
            fail_create: true,
            ..RecordingApi::default()
        });

        let broker = broker_with(Arc::clone(&api), None);
        broker.init_browser().await.expect("init");
        let err = broker.attach_browser().await.expect_err("attach fails");
        assert!(matches!(err, BrokerError::Attach { .. }));
        assert_eq!(broker.state().await, BrokerState::AttachFailed);
        assert!(broker.worker().await.is_none());
        assert!(api.fetch_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn attach_requires_initialised_browser() {
        let api = Arc::new(RecordingApi::default());
        let broker = broker_with(api, None);

        let err = broker.attach_browser().await.expect_err("must init first");
        assert!(matches!(err, BrokerError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn quit_without_worker_reports_no_worker() {
        let api = Arc::new(RecordingApi::default());
        let broker = broker_with(Arc::clone(&api), None);

        let err = broker.quit_browser().await.expect_err("nothing to quit");
        assert!(matches!(err, BrokerError::NoWorker));
        assert!(api.terminate_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn quit_surfaces_termination_failure() {
        let api = Arc::new(RecordingApi {
            fail_terminate: true,
            ..RecordingApi::default()
        });

        let broker = broker_with(Arc::clone(&api), None);
        broker.init_browser().await.expect("init");
        broker.attach_browser().await.expect("attach");

        let err = broker.quit_browser().await.expect_err("quit fails");
        assert!(matches!(err, BrokerError::Terminate { worker_id: 42, .. }));
    }

    #[tokio::test]
    async fn interrupt_terminates_live_worker_exactly_once() {
        let api = Arc::new(RecordingApi::default());
        let broker = broker_with(Arc::clone(&api), None);
        broker.init_browser().await.expect("init");
        broker.attach_browser().await.expect("attach");

        broker.terminate_live_worker().await;
        broker.terminate_live_worker().await;

        assert_eq!(api.terminate_calls.lock().unwrap().as_slice(), &[42]);
        assert_eq!(broker.state().await, BrokerState::Terminated);
    }

    #[tokio::test]
    async fn interrupt_without_worker_is_a_noop() {
        let api = Arc::new(RecordingApi::default());
        let broker = broker_with(Arc::clone(&api), None);

        broker.terminate_live_worker().await;
        assert!(api.terminate_calls.lock().unwrap().is_empty());
        assert_eq!(broker.state().await, BrokerState::Uninitialized);
    }

    #[tokio::test]
    async fn interrupt_cleanup_runs_through_coordinator() {
        let api = Arc::new(RecordingApi::default());
        let broker = Arc::new(broker_with(Arc::clone(&api), None));
        broker.init_browser().await.expect("init");
        broker.attach_browser().await.expect("attach");

        let coordinator =
            ShutdownCoordinator::new(Duration::from_secs(5), test_logger());
        broker.register_interrupt(&coordinator);

        coordinator.run_cleanup().await;
        coordinator.run_cleanup().await;

        assert_eq!(api.terminate_calls.lock().unwrap().as_slice(), &[42]);
    }
}
