//! Process-wide interrupt cleanup coordination.
//!
//! The tunnel controller and every session broker own remote resources that
//! must not outlive the process. Instead of each component installing its own
//! signal listener, they register a cleanup callback here exactly once; on
//! interrupt the coordinator runs all callbacks concurrently under a bounded
//! deadline. Cleanup failures are each component's to log; the coordinator
//! never lets them propagate past the interrupt path.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::join_all;

use crate::logging::BrokerLogger;

/// Deadline applied to the whole cleanup batch on interrupt.
pub const DEFAULT_CLEANUP_DEADLINE: Duration = Duration::from_secs(30);

pub type CleanupFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type CleanupCallback = Box<dyn FnOnce() -> CleanupFuture + Send>;

pub struct ShutdownCoordinator {
    deadline: Duration,
    callbacks: Mutex<Vec<CleanupCallback>>,
    fired: AtomicBool,
    logger: Arc<BrokerLogger>,
}

impl ShutdownCoordinator {
    pub fn new(deadline: Duration, logger: Arc<BrokerLogger>) -> Self {
        Self {
            deadline,
            callbacks: Mutex::new(Vec::new()),
            fired: AtomicBool::new(false),
            logger,
        }
    }

    pub fn with_defaults(logger: Arc<BrokerLogger>) -> Self {
        Self::new(DEFAULT_CLEANUP_DEADLINE, logger)
    }

    /// Register a cleanup callback. Callbacks registered after the
    /// coordinator has fired are ignored; the process is already exiting.
    pub fn on_interrupt<F, Fut>(&self, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.has_fired() {
            return;
        }
        self.callbacks
            .lock()
            .expect("shutdown callback registry poisoned")
            .push(Box::new(move || Box::pin(callback())));
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Run every registered callback concurrently, bounded by the deadline.
    /// Only the first invocation has any effect.
    pub async fn run_cleanup(&self) {
        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }

        let callbacks = {
            let mut guard = self
                .callbacks
                .lock()
                .expect("shutdown callback registry poisoned");
            std::mem::take(&mut *guard)
        };

        if callbacks.is_empty() {
            return;
        }

        let futures: Vec<CleanupFuture> = callbacks.into_iter().map(|callback| callback()).collect();
        if tokio::time::timeout(self.deadline, join_all(futures))
            .await
            .is_err()
        {
            self.logger.warn(
                "interrupt cleanup exceeded its deadline; abandoning remaining teardown",
                Some("shutdown"),
                None,
            );
        }
    }

    /// Wait for Ctrl-C, then run the registered cleanup callbacks.
    pub async fn listen(self: Arc<Self>) {
        if tokio::signal::ctrl_c().await.is_ok() {
            self.run_cleanup().await;
        }
    }
}
