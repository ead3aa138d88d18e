//! Supervision of a single proxy engine process
//!
//! [`EngineProcess`] owns at most one OS process at a time. Output is piped
//! through a [`LogWriter`], exit is awaited by a background task, and the
//! recorded exit is what [`EngineProcess::is_running`] and
//! [`EngineProcess::result`] report on.

use crate::config::EngineSettings;
use crate::engine_config::EngineConfig;
use crate::error::{CoreError, Result};
use crate::log_writer::LogWriter;
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

/// Upper bound for the `-version` probe
const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub const UNKNOWN_VERSION: &str = "Unknown";

/// Where the engine binary lives and where its files go
#[derive(Debug, Clone)]
pub struct EnginePaths {
    pub binary: PathBuf,
    pub config_file: PathBuf,
    pub crash_dir: PathBuf,
}

impl EnginePaths {
    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self {
            binary: settings.binary.clone(),
            config_file: settings.config_file(),
            crash_dir: settings.bin_folder.clone(),
        }
    }
}

/// How the process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitRecord {
    pub code: Option<i32>,
    /// Set for any unsuccessful exit, including termination by signal
    pub error: Option<String>,
}

/// Handle to the live run, replaced on every successful start
struct RunHandle {
    pid: Option<u32>,
    started_at: Instant,
    kill_tx: Option<oneshot::Sender<()>>,
    exit_rx: watch::Receiver<Option<ExitRecord>>,
}

impl RunHandle {
    fn exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }
}

pub struct EngineProcess {
    paths: EnginePaths,
    config: EngineConfig,
    writer: Arc<LogWriter>,
    run: Mutex<Option<RunHandle>>,
    version: RwLock<String>,
    api_port: RwLock<Option<u16>>,
    online_clients: RwLock<Vec<String>>,
}

impl EngineProcess {
    pub fn new(paths: EnginePaths, config: EngineConfig) -> Self {
        let writer = Arc::new(LogWriter::new(paths.crash_dir.clone()));
        Self {
            paths,
            config,
            writer,
            run: Mutex::new(None),
            version: RwLock::new(UNKNOWN_VERSION.to_string()),
            api_port: RwLock::new(None),
            online_clients: RwLock::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// True iff a process was spawned and no exit has been recorded
    pub fn is_running(&self) -> bool {
        self.run
            .lock()
            .as_ref()
            .map(|run| !run.exited())
            .unwrap_or(false)
    }

    /// Write the config file, spawn the engine and probe its version
    pub async fn start(&self) -> Result<()> {
        if self.is_running() {
            return Err(CoreError::AlreadyRunning);
        }

        write_config_file(&self.paths.config_file, &self.config)?;

        let mut child = Command::new(&self.paths.binary)
            .arg("-c")
            .arg(&self.paths.config_file)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CoreError::ProcessSpawn {
                binary: self.paths.binary.clone(),
                source: e,
            })?;

        let pid = child.id();
        info!(pid, binary = %self.paths.binary.display(), "Engine process spawned");

        if let Some(stdout) = child.stdout.take() {
            spawn_output_reader(stdout, Arc::clone(&self.writer));
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_output_reader(stderr, Arc::clone(&self.writer));
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(wait_for_exit(child, kill_rx, exit_tx));

        {
            let mut run = self.run.lock();
            if run.as_ref().map(|r| !r.exited()).unwrap_or(false) {
                // A concurrent start won; kill the extra child.
                let _ = kill_tx.send(());
                return Err(CoreError::AlreadyRunning);
            }
            *run = Some(RunHandle {
                pid,
                started_at: Instant::now(),
                kill_tx: Some(kill_tx),
                exit_rx,
            });
        }

        *self.version.write() = probe_version(&self.paths.binary).await;
        *self.api_port.write() = self.config.api_port();

        Ok(())
    }

    /// Ask the engine to terminate gracefully
    pub fn stop(&self) -> Result<()> {
        let mut run = self.run.lock();
        let handle = match run.as_mut() {
            Some(handle) if !handle.exited() => handle,
            _ => return Err(CoreError::NotRunning),
        };

        info!(pid = handle.pid, "Stopping engine process");

        #[cfg(unix)]
        if let Some(pid) = handle.pid {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
            return Ok(());
        }

        if let Some(kill_tx) = handle.kill_tx.take() {
            let _ = kill_tx.send(());
        }
        Ok(())
    }

    /// Force-kill the engine if it is still running
    pub fn kill(&self) {
        let mut run = self.run.lock();
        if let Some(handle) = run.as_mut() {
            if !handle.exited() {
                if let Some(kill_tx) = handle.kill_tx.take() {
                    warn!(pid = handle.pid, "Force-killing engine process");
                    let _ = kill_tx.send(());
                }
            }
        }
    }

    /// Wait until an exit is recorded. Returns false on timeout.
    pub async fn wait_exit(&self, timeout: Duration) -> bool {
        let exit_rx = match self.run.lock().as_ref() {
            Some(run) => run.exit_rx.clone(),
            None => return true,
        };
        let mut exit_rx = exit_rx;
        let exited = matches!(
            tokio::time::timeout(timeout, exit_rx.wait_for(|exit| exit.is_some())).await,
            Ok(Ok(_))
        );
        exited
    }

    pub fn exit_record(&self) -> Option<ExitRecord> {
        self.run
            .lock()
            .as_ref()
            .and_then(|run| run.exit_rx.borrow().clone())
    }

    /// Last output line, or the exit error when the engine printed nothing
    pub fn result(&self) -> String {
        let last = self.writer.last_line();
        if last.is_empty() {
            if let Some(error) = self.exit_record().and_then(|exit| exit.error) {
                return error;
            }
        }
        last
    }

    pub fn pid(&self) -> Option<u32> {
        self.run.lock().as_ref().and_then(|run| run.pid)
    }

    pub fn version(&self) -> String {
        self.version.read().clone()
    }

    pub fn api_port(&self) -> Option<u16> {
        *self.api_port.read()
    }

    /// Time since the last successful start, zero when not running
    pub fn uptime(&self) -> Duration {
        match self.run.lock().as_ref() {
            Some(run) if !run.exited() => run.started_at.elapsed(),
            _ => Duration::ZERO,
        }
    }

    pub fn online_clients(&self) -> Vec<String> {
        self.online_clients.read().clone()
    }

    pub fn set_online_clients(&self, clients: Vec<String>) {
        *self.online_clients.write() = clients;
    }

    pub fn log_writer(&self) -> &LogWriter {
        &self.writer
    }
}

impl Drop for EngineProcess {
    fn drop(&mut self) {
        if let Some(handle) = self.run.get_mut().as_mut() {
            if !handle.exited() {
                if let Some(kill_tx) = handle.kill_tx.take() {
                    debug!(pid = handle.pid, "Engine handle dropped while running, killing");
                    let _ = kill_tx.send(());
                }
            }
        }
    }
}

fn write_config_file(path: &Path, config: &EngineConfig) -> Result<()> {
    let to_error = |message: String| CoreError::ConfigWrite {
        path: path.to_path_buf(),
        message,
    };

    let data = config.to_json_pretty().map_err(|e| to_error(e.to_string()))?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| to_error(e.to_string()))?;
        }
    }

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    use std::io::Write;
    let mut file = options.open(path).map_err(|e| to_error(e.to_string()))?;
    file.write_all(data.as_bytes())
        .map_err(|e| to_error(e.to_string()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| to_error(e.to_string()))?;
    }

    debug!(path = %path.display(), "Engine configuration written");
    Ok(())
}

fn spawn_output_reader<R>(stream: R, writer: Arc<LogWriter>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    writer.write_line(&line);
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "Engine output stream closed");
                    break;
                }
            }
        }
    });
}

async fn wait_for_exit(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<ExitRecord>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        result = kill_rx => {
            if result.is_ok() {
                if let Err(e) = child.start_kill() {
                    warn!(error = %e, "Failed to kill engine process");
                }
            }
            child.wait().await
        }
    };

    let record = match status {
        Ok(status) if status.success() => ExitRecord {
            code: status.code(),
            error: None,
        },
        Ok(status) => {
            error!(%status, "Engine process exited with failure");
            ExitRecord {
                code: status.code(),
                error: Some(status.to_string()),
            }
        }
        Err(e) => {
            error!(error = %e, "Failed waiting for engine process");
            ExitRecord {
                code: None,
                error: Some(e.to_string()),
            }
        }
    };

    info!(code = ?record.code, "Engine process exited");
    let _ = exit_tx.send(Some(record));
}

/// Run `<binary> -version` and keep the second whitespace token
async fn probe_version(binary: &Path) -> String {
    let output = tokio::time::timeout(
        VERSION_PROBE_TIMEOUT,
        Command::new(binary)
            .arg("-version")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output(),
    )
    .await;

    match output {
        Ok(Ok(output)) => parse_version(&String::from_utf8_lossy(&output.stdout))
            .unwrap_or_else(|| UNKNOWN_VERSION.to_string()),
        Ok(Err(e)) => {
            warn!(error = %e, "Engine version probe failed");
            UNKNOWN_VERSION.to_string()
        }
        Err(_) => {
            warn!("Engine version probe timed out");
            UNKNOWN_VERSION.to_string()
        }
    }
}

pub fn parse_version(output: &str) -> Option<String> {
    output
        .lines()
        .next()?
        .split_whitespace()
        .nth(1)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn paths(dir: &Path, binary: &str) -> EnginePaths {
        EnginePaths {
            binary: PathBuf::from(binary),
            config_file: dir.join("bin").join("config.json"),
            crash_dir: dir.join("bin"),
        }
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(
            parse_version("Xray 1.8.4 (Xray, Penetrates Everything.) Custom (go1.21.1 linux/amd64)\nA unified platform"),
            Some("1.8.4".to_string())
        );
        assert_eq!(parse_version("Xray"), None);
        assert_eq!(parse_version(""), None);
    }

    #[test]
    fn test_new_process_is_stopped() {
        let tmp = TempDir::new().unwrap();
        let process = EngineProcess::new(paths(tmp.path(), "xray"), EngineConfig::default());

        assert!(!process.is_running());
        assert_eq!(process.version(), UNKNOWN_VERSION);
        assert_eq!(process.uptime(), Duration::ZERO);
        assert_eq!(process.result(), "");
        assert!(process.pid().is_none());
    }

    #[test]
    fn test_stop_when_not_running() {
        let tmp = TempDir::new().unwrap();
        let process = EngineProcess::new(paths(tmp.path(), "xray"), EngineConfig::default());

        assert!(matches!(process.stop(), Err(CoreError::NotRunning)));
        assert!(!tmp.path().join("bin").exists());
    }

    #[tokio::test]
    async fn test_wait_exit_without_run() {
        let tmp = TempDir::new().unwrap();
        let process = EngineProcess::new(paths(tmp.path(), "xray"), EngineConfig::default());
        assert!(process.wait_exit(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let tmp = TempDir::new().unwrap();
        let process = EngineProcess::new(
            paths(tmp.path(), "/nonexistent/engine-binary"),
            EngineConfig::default(),
        );

        let err = process.start().await.unwrap_err();
        assert!(matches!(err, CoreError::ProcessSpawn { .. }));
        assert!(!process.is_running());
        // Config file is written before the spawn attempt
        assert!(tmp.path().join("bin").join("config.json").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_config_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("config.json");
        let config: EngineConfig =
            serde_json::from_str(r#"{"inbounds": [{"tag": "api", "port": 10085}]}"#).unwrap();

        write_config_file(&path, &config).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let written: EngineConfig =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written, config);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_recorded_and_result_falls_back_to_error() {
        let tmp = TempDir::new().unwrap();
        // `false` ignores its arguments and exits 1 without output
        let process = EngineProcess::new(paths(tmp.path(), "false"), EngineConfig::default());

        process.start().await.unwrap();
        assert!(process.wait_exit(Duration::from_secs(5)).await);
        assert!(!process.is_running());

        let exit = process.exit_record().unwrap();
        assert_eq!(exit.code, Some(1));
        assert!(exit.error.is_some());
        assert_eq!(process.result(), exit.error.unwrap());
    }
}
