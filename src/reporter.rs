//! Run status reporting.
//!
//! After each browser finishes its suite the host runner emits completion
//! statistics; this module maps the local outcome onto the provider's two
//! remote statuses and pushes the update to the Automate session endpoint.
//! The push is fire-and-forget from the run's perspective: the authoritative
//! pass/fail result has already been determined locally.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::client::{SessionStatus, WorkerApi};
use crate::logging::BrokerLogger;

/// Completion status string the host runner reports for a finished browser.
pub const RUN_COMPLETE: &str = "complete";

/// Statistics the host runner emits with each `browser-end` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub status: String,
    pub failing: u32,
}

impl RunStats {
    /// Map the local outcome to a remote session status: `completed` only
    /// when the run reached completion with zero failing tests.
    pub fn outcome(&self) -> SessionStatus {
        if self.status == RUN_COMPLETE && self.failing == 0 {
            SessionStatus::Completed
        } else {
            SessionStatus::Error
        }
    }
}

/// Pushes per-browser outcomes to the provider's session-tracking endpoint.
pub struct RunReporter {
    api: Arc<dyn WorkerApi>,
    logger: Arc<BrokerLogger>,
}

impl RunReporter {
    pub fn new(api: Arc<dyn WorkerApi>, logger: Arc<BrokerLogger>) -> Self {
        Self { api, logger }
    }

    /// Report the outcome for a completed browser run. Push failures are
    /// logged at warn and swallowed; they must never fail the run itself.
    pub async fn report(&self, session_id: &str, stats: &RunStats) {
        let status = stats.outcome();
        self.logger.debug(
            format!("updating session {session_id} to {}", status.as_str()),
            Some("reporter"),
            None,
        );

        if let Err(err) = self.api.update_session(session_id, status).await {
            self.logger.warn(
                format!("failed to update session {session_id}: {err}"),
                Some("reporter"),
                None,
            );
        }
    }
}
