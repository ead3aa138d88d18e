//! Owner of the current engine process
//!
//! The supervisor serializes start/stop/restart through one async lock and
//! replaces the [`EngineProcess`] on every (re)start. It also remembers whether
//! the operator stopped the engine on purpose so crash recovery leaves it alone.

use crate::engine_config::{ConfigProvider, EngineConfig};
use crate::error::{CoreError, Result};
use crate::process::{EngineProcess, EnginePaths, UNKNOWN_VERSION};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Extra wait after a force-kill before giving up on the exit
const KILL_WAIT: Duration = Duration::from_secs(2);

/// What the control loops need from the engine owner
#[async_trait]
pub trait EngineControl: Send + Sync {
    fn is_running(&self) -> bool;

    /// Not running and not stopped on purpose
    fn did_crash(&self) -> bool;

    fn result(&self) -> String;

    fn api_port(&self) -> Option<u16>;

    fn set_online_clients(&self, clients: Vec<String>);

    /// Stop-then-start with a freshly provided configuration
    async fn restart(&self, force: bool) -> Result<()>;
}

/// Snapshot for display
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub running: bool,
    pub version: String,
    pub uptime_secs: u64,
    pub api_port: Option<u16>,
    pub pid: Option<u32>,
    pub result: String,
    pub online_clients: Vec<String>,
}

pub struct EngineSupervisor {
    paths: EnginePaths,
    provider: Arc<dyn ConfigProvider>,
    grace_period: Duration,
    current: RwLock<Option<Arc<EngineProcess>>>,
    op_lock: Mutex<()>,
    manually_stopped: AtomicBool,
    last_error: RwLock<Option<String>>,
}

impl EngineSupervisor {
    pub fn new(
        paths: EnginePaths,
        provider: Arc<dyn ConfigProvider>,
        grace_period: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            paths,
            provider,
            grace_period,
            current: RwLock::new(None),
            op_lock: Mutex::new(()),
            manually_stopped: AtomicBool::new(false),
            last_error: RwLock::new(None),
        })
    }

    /// Current process handle, if one was ever started
    pub fn current(&self) -> Option<Arc<EngineProcess>> {
        self.current.read().clone()
    }

    pub async fn start(&self) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        self.start_locked().await
    }

    /// Stop the engine and keep crash recovery from bringing it back.
    ///
    /// Stopping an engine that is not running changes nothing. Any later
    /// start or restart, including a queued configuration reload, runs the
    /// engine again.
    pub async fn stop(&self) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        let process = match self.current() {
            Some(process) if process.is_running() => process,
            _ => return Err(CoreError::NotRunning),
        };
        let was_stopped = self.manually_stopped.swap(true, Ordering::SeqCst);
        process.stop().map_err(|e| {
            self.manually_stopped.store(was_stopped, Ordering::SeqCst);
            e
        })
    }

    pub async fn restart_engine(&self, force: bool) -> Result<()> {
        let _guard = self.op_lock.lock().await;

        let config = self.provider.engine_config().map_err(|e| {
            self.record_error(&e);
            e
        })?;

        if let Some(process) = self.current() {
            if process.is_running() {
                if !force && process.config() == &config {
                    debug!("Engine configuration unchanged, restart skipped");
                    return Ok(());
                }
                self.terminate(&process).await;
            }
        }

        self.spawn_with(config).await
    }

    /// Stop the engine for good: SIGTERM, wait the grace period, then kill
    pub async fn shutdown(&self) {
        let _guard = self.op_lock.lock().await;
        self.manually_stopped.store(true, Ordering::SeqCst);

        if let Some(process) = self.current() {
            if process.is_running() {
                info!(
                    grace_period_secs = self.grace_period.as_secs(),
                    "Shutting down engine"
                );
                self.terminate(&process).await;
            }
        }
    }

    pub fn version(&self) -> String {
        self.current()
            .map(|p| p.version())
            .unwrap_or_else(|| UNKNOWN_VERSION.to_string())
    }

    pub fn uptime(&self) -> Duration {
        self.current().map(|p| p.uptime()).unwrap_or(Duration::ZERO)
    }

    pub fn pid(&self) -> Option<u32> {
        self.current().and_then(|p| p.pid())
    }

    pub fn online_clients(&self) -> Vec<String> {
        self.current()
            .map(|p| p.online_clients())
            .unwrap_or_default()
    }

    pub fn status(&self) -> EngineStatus {
        let running = EngineControl::is_running(self);
        EngineStatus {
            running,
            version: self.version(),
            uptime_secs: self.uptime().as_secs(),
            api_port: EngineControl::api_port(self),
            pid: self.pid(),
            result: EngineControl::result(self),
            online_clients: self.online_clients(),
        }
    }

    async fn start_locked(&self) -> Result<()> {
        if let Some(process) = self.current() {
            if process.is_running() {
                return Err(CoreError::AlreadyRunning);
            }
        }

        let config = self.provider.engine_config().map_err(|e| {
            self.record_error(&e);
            e
        })?;
        self.spawn_with(config).await
    }

    async fn spawn_with(&self, config: EngineConfig) -> Result<()> {
        let process = Arc::new(EngineProcess::new(self.paths.clone(), config));
        self.manually_stopped.store(false, Ordering::SeqCst);
        *self.current.write() = Some(Arc::clone(&process));

        match process.start().await {
            Ok(()) => {
                *self.last_error.write() = None;
                info!(version = %process.version(), "Engine started");
                Ok(())
            }
            Err(e) => {
                self.record_error(&e);
                Err(e)
            }
        }
    }

    async fn terminate(&self, process: &EngineProcess) {
        if let Err(e) = process.stop() {
            debug!(error = %e, "Engine already stopped");
            return;
        }
        if process.wait_exit(self.grace_period).await {
            return;
        }

        warn!(
            grace_period_secs = self.grace_period.as_secs(),
            "Grace period exceeded, killing engine"
        );
        process.kill();
        if !process.wait_exit(KILL_WAIT).await {
            warn!("Engine did not exit after kill");
        }
    }

    fn record_error(&self, err: &CoreError) {
        *self.last_error.write() = Some(err.to_string());
    }
}

#[async_trait]
impl EngineControl for EngineSupervisor {
    fn is_running(&self) -> bool {
        self.current().map(|p| p.is_running()).unwrap_or(false)
    }

    fn did_crash(&self) -> bool {
        !self.is_running() && !self.manually_stopped.load(Ordering::SeqCst)
    }

    fn result(&self) -> String {
        let result = self.current().map(|p| p.result()).unwrap_or_default();
        if result.is_empty() {
            return self.last_error.read().clone().unwrap_or_default();
        }
        result
    }

    fn api_port(&self) -> Option<u16> {
        self.current().and_then(|p| p.api_port())
    }

    fn set_online_clients(&self, clients: Vec<String>) {
        if let Some(process) = self.current() {
            process.set_online_clients(clients);
        }
    }

    async fn restart(&self, force: bool) -> Result<()> {
        self.restart_engine(force).await
    }
}
