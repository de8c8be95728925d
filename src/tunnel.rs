//! Secure tunnel process control.
//!
//! Spawns the BrowserStackLocal binary so the provider can reach test assets
//! served on the local machine, waits for it to report ready on stdout, and
//! guarantees at most one stop attempt across normal completion and external
//! interrupt. The binary's internal lifecycle (reconnects, daemonisation) is
//! its own business; this module only starts and stops it.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::TunnelOptions;
use crate::logging::BrokerLogger;

/// Substring the tunnel binary prints once the bridge is usable.
pub const READY_MARKER: &str = "You can now access your local server";

const STOP_WAIT: Duration = Duration::from_secs(5);

/// Errors surfaced while establishing the tunnel. Stop failures are logged,
/// never returned.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("failed to spawn tunnel process: {source}")]
    Spawn {
        #[source]
        source: std::io::Error,
    },
    #[error("tunnel process exited before reporting ready ({status})")]
    ExitedEarly { status: std::process::ExitStatus },
    #[error("tunnel process closed its output before reporting ready")]
    OutputClosed,
    #[error("failed to read tunnel output: {source}")]
    Output {
        #[source]
        source: std::io::Error,
    },
    #[error("tunnel process has no readable stdout")]
    MissingStdout,
}

/// Generate a best-effort unique tunnel identifier.
///
/// Uniqueness is not cryptographically load-bearing; a collision only risks
/// two concurrent runs sharing tunnel state.
pub fn generate_identifier() -> String {
    format!("tunnel-{}", Uuid::new_v4())
}

/// Handle to a running tunnel process.
pub struct TunnelController {
    local_identifier: String,
    force_kill: bool,
    child: Mutex<Option<Child>>,
    drain: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
    logger: Arc<BrokerLogger>,
}

impl TunnelController {
    /// Start the tunnel process and wait until it reports ready.
    ///
    /// Resolves once [`READY_MARKER`] appears on the process's stdout; rejects
    /// with the underlying error if the process cannot be spawned or exits
    /// first. No retries.
    pub async fn establish(
        options: &TunnelOptions,
        logger: Arc<BrokerLogger>,
    ) -> Result<Self, TunnelError> {
        let local_identifier = options
            .local_identifier
            .clone()
            .unwrap_or_else(generate_identifier);

        let mut cmd = Command::new(&options.binary_path);
        if let Some(key) = &options.key {
            cmd.arg("--key").arg(key);
        }
        cmd.arg("--local-identifier").arg(&local_identifier);
        if options.verbose {
            cmd.arg("--verbose");
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        logger.debug(
            format!("creating tunnel {local_identifier}"),
            Some("tunnel"),
            None,
        );

        let mut child = cmd.spawn().map_err(|source| TunnelError::Spawn { source })?;
        let stdout = child.stdout.take().ok_or(TunnelError::MissingStdout)?;
        let mut lines = BufReader::new(stdout).lines();

        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    logger.debug(line.clone(), Some("tunnel"), None);
                    if line.contains(READY_MARKER) {
                        break;
                    }
                }
                Ok(None) => {
                    if let Ok(Some(status)) = child.try_wait() {
                        return Err(TunnelError::ExitedEarly { status });
                    }
                    let _ = child.kill().await;
                    return Err(TunnelError::OutputClosed);
                }
                Err(source) => {
                    let _ = child.kill().await;
                    return Err(TunnelError::Output { source });
                }
            }
        }

        logger.debug(
            format!("tunnel established {local_identifier}"),
            Some("tunnel"),
            None,
        );

        // Keep draining stdout so the pipe never fills up and stalls the
        // tunnel process.
        let drain_logger = Arc::clone(&logger);
        let drain = tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                drain_logger.debug(line, Some("tunnel"), None);
            }
        });

        Ok(Self {
            local_identifier,
            force_kill: options.force_kill,
            child: Mutex::new(Some(child)),
            drain: Mutex::new(Some(drain)),
            stopped: AtomicBool::new(false),
            logger,
        })
    }

    pub fn local_identifier(&self) -> &str {
        &self.local_identifier
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Stop the tunnel process. Idempotent: only the first invocation has an
    /// external effect, whether it comes from normal run completion or from
    /// the interrupt path. Stop failures are logged at warn, never returned.
    pub async fn teardown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        self.logger.debug(
            format!("stopping tunnel {}", self.local_identifier),
            Some("tunnel"),
            None,
        );

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            if self.force_kill {
                // Signal goes out before the graceful stop completes.
                if let Err(err) = child.start_kill() {
                    self.logger.warn(
                        format!("failed to signal tunnel process: {err}"),
                        Some("tunnel"),
                        None,
                    );
                }
            }

            if let Err(err) = child.kill().await {
                self.logger.warn(
                    format!("failed to stop tunnel: {err}"),
                    Some("tunnel"),
                    None,
                );
            }

            match tokio::time::timeout(STOP_WAIT, child.wait()).await {
                Ok(Ok(_)) => {
                    self.logger.debug(
                        format!("tunnel stopped {}", self.local_identifier),
                        Some("tunnel"),
                        None,
                    );
                }
                Ok(Err(err)) => {
                    self.logger.warn(
                        format!("failed to reap tunnel process: {err}"),
                        Some("tunnel"),
                        None,
                    );
                }
                Err(_) => {
                    self.logger.warn(
                        "tunnel process did not exit within the stop window",
                        Some("tunnel"),
                        None,
                    );
                }
            }
        }

        if let Some(handle) = self.drain.lock().await.take() {
            handle.abort();
        }
    }
}
