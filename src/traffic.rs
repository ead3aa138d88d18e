//! Traffic accounting
//!
//! Each tick pulls a clear-on-read snapshot from the engine's management API
//! and adds it to the persisted totals. Quota crossings raise the restart flag
//! instead of restarting directly.

use crate::error::{CoreError, Result};
use crate::jobs::Tick;
use crate::notifications::{Notification, Notifier};
use crate::restart::RestartFlag;
use crate::stats::TrafficSnapshot;
use crate::supervisor::EngineControl;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

const STATS_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Source of clear-on-read traffic counters
#[async_trait]
pub trait StatsSource: Send + Sync {
    async fn query(&self, api_port: u16) -> Result<TrafficSnapshot>;
}

/// Queries the engine through its own CLI:
/// `<binary> api statsquery --server=127.0.0.1:<port> -reset`
pub struct EngineCliStats {
    binary: PathBuf,
}

impl EngineCliStats {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl StatsSource for EngineCliStats {
    async fn query(&self, api_port: u16) -> Result<TrafficSnapshot> {
        let output = tokio::time::timeout(
            STATS_QUERY_TIMEOUT,
            Command::new(&self.binary)
                .arg("api")
                .arg("statsquery")
                .arg(format!("--server=127.0.0.1:{}", api_port))
                .arg("-reset")
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| CoreError::Stats("stats query timed out".to_string()))?
        .map_err(|e| CoreError::Stats(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CoreError::Stats(format!(
                "{}: {}",
                output.status,
                stderr.trim()
            )));
        }

        decode_stats_json(&String::from_utf8_lossy(&output.stdout))
    }
}

#[derive(Debug, Deserialize)]
struct StatsResponse {
    #[serde(default)]
    stat: Vec<StatEntry>,
}

#[derive(Debug, Deserialize)]
struct StatEntry {
    name: String,
    #[serde(default)]
    value: Value,
}

/// Decode `{"stat":[{"name":..,"value":..}]}`; values may be numbers or strings
pub fn decode_stats_json(raw: &str) -> Result<TrafficSnapshot> {
    if raw.trim().is_empty() {
        return Ok(TrafficSnapshot::default());
    }

    let response: StatsResponse = serde_json::from_str(raw)?;
    let mut snapshot = TrafficSnapshot::default();
    for entry in response.stat {
        let value = match &entry.value {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            Value::Null => Some(0),
            _ => None,
        };
        match value {
            Some(value) => {
                snapshot.add(&entry.name, value);
            }
            None => debug!(name = %entry.name, "Skipping stat with unreadable value"),
        }
    }
    Ok(snapshot)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaKind {
    Inbound,
    Client,
    Outbound,
}

impl fmt::Display for QuotaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaKind::Inbound => write!(f, "inbound"),
            QuotaKind::Client => write!(f, "client"),
            QuotaKind::Outbound => write!(f, "outbound"),
        }
    }
}

/// Entries disabled because their quota was used up
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuotaOutcome {
    pub disabled: Vec<(QuotaKind, String)>,
}

impl QuotaOutcome {
    pub fn needs_restart(&self) -> bool {
        !self.disabled.is_empty()
    }
}

/// Persisted traffic counters
pub trait TrafficStore: Send + Sync {
    /// Add the deltas and disable entries whose quota is now used up
    fn apply_traffic(&self, snapshot: &TrafficSnapshot) -> Result<QuotaOutcome>;
}

pub struct TrafficAccountant {
    engine: Arc<dyn EngineControl>,
    source: Arc<dyn StatsSource>,
    store: Arc<dyn TrafficStore>,
    flag: Arc<RestartFlag>,
    notifier: Arc<dyn Notifier>,
}

impl TrafficAccountant {
    pub fn new(
        engine: Arc<dyn EngineControl>,
        source: Arc<dyn StatsSource>,
        store: Arc<dyn TrafficStore>,
        flag: Arc<RestartFlag>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            engine,
            source,
            store,
            flag,
            notifier,
        }
    }

    /// One accounting pass. Not running is a no-op, not an error.
    pub async fn run_once(&self) -> Result<()> {
        if !self.engine.is_running() {
            return Ok(());
        }
        let Some(api_port) = self.engine.api_port() else {
            debug!("Engine has no API inbound, skipping traffic accounting");
            return Ok(());
        };

        let snapshot = self.source.query(api_port).await?;
        self.engine.set_online_clients(snapshot.active_clients());
        if snapshot.is_empty() {
            return Ok(());
        }

        let outcome = self.store.apply_traffic(&snapshot)?;
        for (kind, name) in &outcome.disabled {
            self.notifier.notify(Notification::QuotaExceeded {
                kind: kind.to_string(),
                name: name.clone(),
            });
        }
        if outcome.needs_restart() {
            info!(
                disabled = outcome.disabled.len(),
                "Quota exhausted, engine reload requested"
            );
            self.flag.raise();
        }
        Ok(())
    }
}

#[async_trait]
impl Tick for TrafficAccountant {
    fn name(&self) -> &str {
        "traffic-accounting"
    }

    async fn tick(&self) {
        if let Err(e) = self.run_once().await {
            warn!(error = %e, "Traffic accounting pass failed");
        }
    }
}
