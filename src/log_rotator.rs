//! Keeps exactly one previous generation of the ban log and access log

use crate::engine_config::ConfigProvider;
use crate::error::{CoreError, Result};
use crate::jobs::Tick;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Copy `live` over `prev`, then truncate `live` to zero length.
///
/// Returns false when `live` does not exist.
pub async fn rotate_file(live: &Path, prev: &Path) -> Result<bool> {
    let to_error = |source: std::io::Error| CoreError::LogRead {
        path: live.to_path_buf(),
        source,
    };

    match tokio::fs::metadata(live).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(to_error(e)),
    }

    tokio::fs::copy(live, prev).await.map_err(to_error)?;
    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .open(live)
        .await
        .map_err(to_error)?;
    file.set_len(0).await.map_err(to_error)?;
    Ok(true)
}

pub struct LogRotator {
    provider: Arc<dyn ConfigProvider>,
    ban_log: PathBuf,
    ban_log_prev: PathBuf,
    access_log_prev: PathBuf,
}

impl LogRotator {
    pub fn new(
        provider: Arc<dyn ConfigProvider>,
        ban_log: PathBuf,
        ban_log_prev: PathBuf,
        access_log_prev: PathBuf,
    ) -> Self {
        Self {
            provider,
            ban_log,
            ban_log_prev,
            access_log_prev,
        }
    }

    /// Rotate both logs; returns how many files were rotated
    pub async fn rotate(&self) -> Result<usize> {
        let mut rotated = 0;
        if rotate_file(&self.ban_log, &self.ban_log_prev).await? {
            rotated += 1;
        }

        match self.provider.engine_config()?.access_log_path() {
            Some(access_log) => {
                if rotate_file(&access_log, &self.access_log_prev).await? {
                    rotated += 1;
                }
            }
            None => debug!("Access log disabled, nothing to rotate"),
        }
        Ok(rotated)
    }
}

#[async_trait]
impl Tick for LogRotator {
    fn name(&self) -> &str {
        "log-rotator"
    }

    async fn tick(&self) {
        match self.rotate().await {
            Ok(0) => {}
            Ok(rotated) => info!(files = rotated, "Rotated logs"),
            Err(e) => warn!(error = %e, "Log rotation failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine_config::EngineConfig;
    use tempfile::TempDir;

    struct AccessLogAt(String);

    impl ConfigProvider for AccessLogAt {
        fn engine_config(&self) -> Result<EngineConfig> {
            let mut config = EngineConfig::default();
            config.log.access = self.0.clone();
            Ok(config)
        }
    }

    #[tokio::test]
    async fn test_rotate_keeps_one_generation() {
        let tmp = TempDir::new().unwrap();
        let live = tmp.path().join("ip-limit.log");
        let prev = tmp.path().join("ip-limit.prev.log");

        std::fs::write(&prev, b"ancient generation\n").unwrap();
        std::fs::write(&live, b"line one\nline two\n").unwrap();

        assert!(rotate_file(&live, &prev).await.unwrap());
        assert_eq!(std::fs::metadata(&live).unwrap().len(), 0);
        assert_eq!(std::fs::read(&prev).unwrap(), b"line one\nline two\n");

        std::fs::write(&live, b"next\n").unwrap();
        rotate_file(&live, &prev).await.unwrap();
        assert_eq!(std::fs::read(&prev).unwrap(), b"next\n");
    }

    #[tokio::test]
    async fn test_missing_live_file_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let live = tmp.path().join("missing.log");
        let prev = tmp.path().join("missing.prev.log");

        assert!(!rotate_file(&live, &prev).await.unwrap());
        assert!(!prev.exists());
    }

    #[tokio::test]
    async fn test_rotator_handles_both_logs() {
        let tmp = TempDir::new().unwrap();
        let access = tmp.path().join("access.log");
        let ban = tmp.path().join("ip-limit.log");
        std::fs::write(&access, b"from tcp:203.0.113.5:1 accepted x email: a\n").unwrap();
        std::fs::write(&ban, b"2024/01/15 12:00:00 [LIMIT_IP] Email = a || SRC = 203.0.113.5\n")
            .unwrap();

        let rotator = LogRotator::new(
            Arc::new(AccessLogAt(access.display().to_string())),
            ban.clone(),
            tmp.path().join("ip-limit.prev.log"),
            tmp.path().join("access.prev.log"),
        );

        assert_eq!(rotator.rotate().await.unwrap(), 2);
        assert_eq!(std::fs::metadata(&access).unwrap().len(), 0);
        assert_eq!(std::fs::metadata(&ban).unwrap().len(), 0);
        assert!(std::fs::read_to_string(tmp.path().join("access.prev.log"))
            .unwrap()
            .contains("email: a"));
    }

    #[tokio::test]
    async fn test_rotator_without_access_log() {
        let tmp = TempDir::new().unwrap();
        let ban = tmp.path().join("ip-limit.log");
        std::fs::write(&ban, b"x\n").unwrap();

        let rotator = LogRotator::new(
            Arc::new(AccessLogAt("none".into())),
            ban,
            tmp.path().join("ip-limit.prev.log"),
            tmp.path().join("access.prev.log"),
        );
        assert_eq!(rotator.rotate().await.unwrap(), 1);
    }
}
