//! Test helper functions for E2E tests

use escalate::client::Client;
use escalate::config::Config;
use escalate::daemon::{DaemonPhase, DaemonServer, RunOutcome};
use escalate::notify::{DeliveryError, Notification, Notifier};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// One delivery seen by [`Recorder`].
#[derive(Debug, Clone)]
pub struct Delivered {
    pub id: String,
    pub title: String,
    pub message: String,
    pub priority: i8,
    pub at: Instant,
}

/// Notifier that records every delivery instead of pushing it anywhere.
#[derive(Debug, Default)]
pub struct Recorder {
    seen: Mutex<Vec<Delivered>>,
}

impl Recorder {
    pub fn deliveries(&self) -> Vec<Delivered> {
        self.seen.lock().unwrap().clone()
    }
}

impl Notifier for Recorder {
    fn deliver(&self, notification: &Notification) -> Result<(), DeliveryError> {
        self.seen.lock().unwrap().push(Delivered {
            id: notification.escalation_id.clone(),
            title: notification.title.clone(),
            message: notification.message.clone(),
            priority: notification.priority,
            at: Instant::now(),
        });
        Ok(())
    }
}

/// A daemon running on a background thread in its own temp directory.
pub struct TestDaemon {
    pub dir: TempDir,
    pub config: Config,
    pub server: Arc<DaemonServer>,
    pub recorder: Arc<Recorder>,
    handle: Option<JoinHandle<RunOutcome>>,
}

impl TestDaemon {
    pub fn start() -> Self {
        Self::start_with(|_| {})
    }

    /// Start with a configuration adjusted by `tweak`.
    pub fn start_with(tweak: impl FnOnce(&mut Config)) -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut config = Config::with_runtime_dir(dir.path());
        config.client_retry_backoff_ms = 10;
        tweak(&mut config);
        Self::start_in(dir, config)
    }

    /// Start a daemon on an existing directory and configuration.
    pub fn start_in(dir: TempDir, config: Config) -> Self {
        let recorder = Arc::new(Recorder::default());
        let server = Arc::new(DaemonServer::with_notifier(&config, recorder.clone()));

        let runner = Arc::clone(&server);
        let handle = thread::spawn(move || runner.run().expect("daemon run failed"));

        let daemon = Self {
            dir,
            config,
            server,
            recorder,
            handle: Some(handle),
        };
        wait_for(Duration::from_secs(5), || {
            daemon.server.phase() == DaemonPhase::Listening
        });
        daemon
    }

    pub fn client(&self) -> Client {
        Client::from_config(&self.config)
    }

    /// Wait for the daemon thread to finish on its own.
    pub fn wait_stopped(&mut self, timeout: Duration) -> RunOutcome {
        let handle = self.handle.take().expect("daemon already joined");
        wait_for(timeout, || handle.is_finished());
        handle.join().expect("daemon thread panicked")
    }

    /// Hand back the directory and config so another daemon can reuse them.
    pub fn into_parts(mut self) -> (TempDir, Config) {
        self.server.shutdown();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        let dir = std::mem::replace(&mut self.dir, TempDir::new().expect("Failed to create temp dir"));
        (dir, self.config.clone())
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.server.shutdown();
            let _ = handle.join();
        }
    }
}

/// Poll `condition` until it holds, panicking after `timeout`.
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met within {timeout:?}");
        thread::sleep(Duration::from_millis(10));
    }
}
