//! Integration tests driving the full plugin lifecycle against a recording
//! provider mock and a fake tunnel binary.
//!
//! These mirror how a host runner uses the plugin: configure, prepare, one
//! session runner per browser definition, a `browser-end` report per
//! completed run, then teardown, plus the interrupt path.

use std::path::PathBuf;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use browserstack_broker::broker::{BrowserDefinition, SessionRunner};
use browserstack_broker::client::{
    ClientError, RemoteWorker, SessionStatus, WorkerApi, WorkerRequest,
};
use browserstack_broker::config::PluginConfig;
use browserstack_broker::plugin::SessionPlugin;
use browserstack_broker::reporter::{RUN_COMPLETE, RunStats};

#[derive(Default)]
struct RecordingApi {
    next_id: AtomicU64,
    create_calls: StdMutex<Vec<WorkerRequest>>,
    terminate_calls: StdMutex<Vec<u64>>,
    update_calls: StdMutex<Vec<(String, SessionStatus)>>,
}

impl RecordingApi {
    fn worker(&self, id: u64) -> RemoteWorker {
        RemoteWorker {
            id,
            status: Some("running".into()),
            browser_url: Some(format!(
                "https://automate.browserstack.com/sessions/sess-{id}"
            )),
        }
    }
}

#[async_trait]
impl WorkerApi for RecordingApi {
    async fn create_worker(&self, request: &WorkerRequest) -> Result<RemoteWorker, ClientError> {
        self.create_calls.lock().unwrap().push(request.clone());
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(RemoteWorker {
            id,
            status: None,
            browser_url: None,
        })
    }

    async fn fetch_worker(&self, worker_id: u64) -> Result<RemoteWorker, ClientError> {
        Ok(self.worker(worker_id))
    }

    async fn terminate_worker(&self, worker_id: u64) -> Result<(), ClientError> {
        self.terminate_calls.lock().unwrap().push(worker_id);
        Ok(())
    }

    async fn update_session(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<(), ClientError> {
        self.update_calls
            .lock()
            .unwrap()
            .push((session_id.to_string(), status));
        Ok(())
    }
}

#[cfg(unix)]
fn fake_tunnel(dir: &tempfile::TempDir) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.path().join("fake-tunnel.sh");
    std::fs::write(
        &path,
        "#!/bin/sh\n\
         echo \"You can now access your local server(s) in our remote browser\"\n\
         sleep 30\n",
    )
    .expect("write fake tunnel");
    let mut perms = std::fs::metadata(&path).expect("metadata").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("set permissions");
    path
}

fn browser(browser: &str) -> BrowserDefinition {
    BrowserDefinition {
        browser: Some(browser.to_string()),
        os: Some("Windows".into()),
        os_version: Some("11".into()),
        ..BrowserDefinition::default()
    }
}

fn quiet_config(browsers: Vec<BrowserDefinition>) -> PluginConfig {
    let mut config = PluginConfig::default();
    config.logger = Some(Arc::new(|_record| {}));
    config.browsers = browsers;
    config
}

fn complete_stats() -> RunStats {
    RunStats {
        status: RUN_COMPLETE.to_string(),
        failing: 0,
    }
}

#[cfg(unix)]
#[tokio::test]
async fn full_run_reports_and_tears_down() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = quiet_config(vec![browser("chrome"), browser("firefox")]);
    config.tunnel.binary_path = fake_tunnel(&dir);

    let api = Arc::new(RecordingApi::default());
    let plugin = SessionPlugin::with_api(config, Arc::clone(&api) as Arc<dyn WorkerApi>);

    let active = plugin.configure().await.expect("configure");
    assert_eq!(active.len(), 2);

    plugin.prepare().await.expect("prepare");
    let identifier = plugin.tunnel_identifier().await.expect("tunnel is up");

    let mut runners = Vec::new();
    for definition in plugin.active_browsers().await {
        assert!(definition.local);
        assert_eq!(definition.local_identifier.as_deref(), Some(identifier.as_str()));

        let runner = plugin
            .create_runner(definition, "http://localhost:8081/suite.html", None)
            .await
            .expect("create runner");
        runner.init_browser().await.expect("init");
        runners.push(runner);
    }

    // Brokers attach concurrently; no ordering is required between them.
    futures_util::future::join_all(runners.iter().map(|runner| runner.attach_browser()))
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()
        .expect("all attach");

    let mut session_ids = Vec::new();
    for runner in &runners {
        runner.mark_running().await;
        session_ids.push(runner.session_id().await.expect("session id"));
    }
    session_ids.sort();
    session_ids.dedup();
    assert_eq!(session_ids.len(), 2);

    for (runner, session_id) in runners.iter().zip(&session_ids) {
        plugin
            .on_browser_end(runner.definition(), None, &complete_stats(), Some(session_id))
            .await;
        runner.quit_browser().await.expect("quit");
    }

    {
        let updates = api.update_calls.lock().unwrap();
        assert_eq!(updates.len(), 2);
        assert!(
            updates
                .iter()
                .all(|(_, status)| *status == SessionStatus::Completed)
        );

        let mut terminated = api.terminate_calls.lock().unwrap().clone();
        terminated.sort();
        assert_eq!(terminated, vec![1, 2]);
    }

    plugin.teardown().await;
    plugin.teardown().await;
}

#[cfg(unix)]
#[tokio::test]
async fn interrupt_terminates_workers_and_tunnel_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = quiet_config(vec![browser("chrome")]);
    config.tunnel.binary_path = fake_tunnel(&dir);

    let api = Arc::new(RecordingApi::default());
    let plugin = SessionPlugin::with_api(config, Arc::clone(&api) as Arc<dyn WorkerApi>);

    plugin.configure().await.expect("configure");
    plugin.prepare().await.expect("prepare");

    let definition = plugin
        .active_browsers()
        .await
        .into_iter()
        .next()
        .expect("definition");
    let runner = plugin
        .create_runner(definition, "http://localhost:8081/suite.html", None)
        .await
        .expect("create runner");
    runner.init_browser().await.expect("init");
    runner.attach_browser().await.expect("attach");

    let coordinator = plugin.shutdown();
    coordinator.run_cleanup().await;
    coordinator.run_cleanup().await;

    assert_eq!(api.terminate_calls.lock().unwrap().as_slice(), &[1]);

    // The worker is gone; a later quit must not issue a second termination.
    runner
        .quit_browser()
        .await
        .expect_err("worker already terminated");
    assert_eq!(api.terminate_calls.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn empty_browser_list_is_a_complete_noop() {
    let api = Arc::new(RecordingApi::default());
    let plugin = SessionPlugin::with_api(quiet_config(Vec::new()), Arc::clone(&api) as Arc<dyn WorkerApi>);

    assert!(plugin.configure().await.expect("configure").is_empty());
    plugin.prepare().await.expect("prepare");
    plugin
        .on_browser_end(&browser("chrome"), None, &complete_stats(), Some("sess-1"))
        .await;

    assert!(api.create_calls.lock().unwrap().is_empty());
    assert!(api.update_calls.lock().unwrap().is_empty());
    assert!(plugin.tunnel_identifier().await.is_none());
}
