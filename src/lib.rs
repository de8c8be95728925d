//! BrowserStack session brokering for web test runners.
//!
//! Lets a host test runner delegate browser execution to BrowserStack instead
//! of spawning local browsers: the plugin negotiates remote worker sessions,
//! opens a secure tunnel so the provider can reach locally-served test
//! assets, and reports pass/fail status back to the provider after each run.
//!
//! The host drives the plugin through three touch points: the `configure` and
//! `prepare` lifecycle hooks on [`plugin::SessionPlugin`], and one
//! [`broker::SessionRunner`] per requested browser definition. Tunnel
//! teardown, watchdog extension, interrupt cleanup, and status reporting all
//! happen behind those seams.

pub mod broker;
pub mod client;
pub mod config;
pub mod logging;
pub mod plugin;
pub mod reporter;
pub mod shutdown;
pub mod tunnel;

pub use broker::{
    BrokerError, BrokerState, BrowserDefinition, SessionBroker, SessionRunner, WatchdogSignal,
};
pub use client::{
    BrowserStackClient, ClientError, RemoteWorker, SessionStatus, WorkerApi, WorkerRequest,
};
pub use config::{
    BrowserDefaults, ConfigError, Credentials, PluginConfig, PluginConfigOverrides, TunnelOptions,
    Verbosity,
};
pub use logging::{BrokerLogger, LogCallback, LogConfig, LogLevel, LogRecord};
pub use plugin::{PluginError, SessionPlugin};
pub use reporter::{RunReporter, RunStats};
pub use shutdown::ShutdownCoordinator;
pub use tunnel::{TunnelController, TunnelError, generate_identifier};
