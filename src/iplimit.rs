//! Per-client IP limit enforcement
//!
//! Enforcement never blocks traffic itself. For every client over its limit
//! it appends one `[LIMIT_IP]` line per excess IP to the ban log; an external
//! intrusion-prevention tool watching that file performs the actual ban.

use crate::access_log::read_observations;
use crate::client_ips::ClientIpState;
use crate::engine_config::ConfigProvider;
use crate::error::{CoreError, Result};
use crate::jobs::Tick;
use crate::notifications::{Notification, Notifier};
use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{Notify, OnceCell};
use tracing::{debug, info, warn};

/// Persisted per-client IP history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientIpRecord {
    pub client: String,
    pub ips: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

/// Storage for [`ClientIpRecord`]s
pub trait ClientIpStore: Send + Sync {
    fn find_by_client(&self, client: &str) -> Result<Option<ClientIpRecord>>;
    fn create(&self, record: &ClientIpRecord) -> Result<()>;
    fn update(&self, record: &ClientIpRecord) -> Result<()>;
}

/// Limit configured for one client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientLimit {
    pub limit: u32,
    pub inbound_enabled: bool,
}

impl ClientLimit {
    pub fn enforced(&self) -> bool {
        self.limit > 0 && self.inbound_enabled
    }
}

/// Answers which limits apply right now
pub trait LimitPolicy: Send + Sync {
    /// Cheap check whether any client has a limit at all
    fn ip_limit_active(&self) -> Result<bool>;

    fn client_limit(&self, client: &str) -> Result<Option<ClientLimit>>;
}

/// The lexicographically largest `ips.len() - limit` entries of sorted `ips`
pub fn disallowed_ips(sorted_ips: &[String], limit: u32) -> &[String] {
    let limit = limit as usize;
    if sorted_ips.len() > limit {
        &sorted_ips[limit..]
    } else {
        &[]
    }
}

pub fn format_ban_line(at: DateTime<Local>, client: &str, ip: &str) -> String {
    format!(
        "{} [LIMIT_IP] Email = {} || SRC = {}",
        at.format("%Y/%m/%d %H:%M:%S"),
        client,
        ip
    )
}

/// Detects the external ban tool once per run
pub struct BanToolProbe {
    command: String,
    detected: OnceCell<bool>,
}

impl BanToolProbe {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            detected: OnceCell::new(),
        }
    }

    pub async fn is_available(&self) -> bool {
        *self
            .detected
            .get_or_init(|| async {
                let status = Command::new(&self.command)
                    .arg("-h")
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .kill_on_drop(true)
                    .status()
                    .await;

                match status {
                    Ok(status) if status.success() => {
                        info!(tool = %self.command, "Ban tool detected");
                        true
                    }
                    _ => {
                        let err = CoreError::ExternalToolMissing(self.command.clone());
                        warn!(
                            error = %err,
                            "Ban log is still written but no tool will act on it"
                        );
                        false
                    }
                }
            })
            .await
    }
}

/// Result of one enforcement pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnforcementReport {
    pub clients_checked: usize,
    pub ban_lines: usize,
    pub evicted_ips: usize,
}

pub struct IpLimitEnforcer {
    state: Arc<ClientIpState>,
    store: Arc<dyn ClientIpStore>,
    policy: Arc<dyn LimitPolicy>,
    notifier: Arc<dyn Notifier>,
    ban_log: PathBuf,
    ban_tool: BanToolProbe,
    ttl: Option<Duration>,
    rotate: Arc<Notify>,
    seeded: Mutex<HashSet<String>>,
    reported: Mutex<HashMap<String, Vec<String>>>,
    pass_lock: tokio::sync::Mutex<()>,
}

impl IpLimitEnforcer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: Arc<ClientIpState>,
        store: Arc<dyn ClientIpStore>,
        policy: Arc<dyn LimitPolicy>,
        notifier: Arc<dyn Notifier>,
        ban_log: impl Into<PathBuf>,
        ban_tool: BanToolProbe,
        ttl: Option<Duration>,
        rotate: Arc<Notify>,
    ) -> Self {
        Self {
            state,
            store,
            policy,
            notifier,
            ban_log: ban_log.into(),
            ban_tool,
            ttl,
            rotate,
            seeded: Mutex::new(HashSet::new()),
            reported: Mutex::new(HashMap::new()),
            pass_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn state(&self) -> &Arc<ClientIpState> {
        &self.state
    }

    /// Run one enforcement pass over the current state
    pub async fn enforce(&self, now: DateTime<Local>) -> Result<EnforcementReport> {
        let _pass = self.pass_lock.lock().await;
        let mut report = EnforcementReport::default();

        if !self.policy.ip_limit_active()? {
            return Ok(report);
        }
        self.ban_tool.is_available().await;

        if let Some(ttl) = self.ttl {
            report.evicted_ips = self.state.evict_stale(now, ttl);
            if report.evicted_ips > 0 {
                debug!(evicted = report.evicted_ips, "Evicted stale client IPs");
            }
        }

        let clients: Vec<String> = self.state.snapshot().into_keys().collect();
        let mut ban_lines = Vec::new();

        for client in clients {
            self.seed_from_store(&client, now)?;
            let ips = self.state.ips_of(&client);
            if ips.is_empty() {
                continue;
            }
            report.clients_checked += 1;

            if let Some(limit) = self.policy.client_limit(&client)? {
                if limit.enforced() {
                    let disallowed = disallowed_ips(&ips, limit.limit);
                    for ip in disallowed {
                        ban_lines.push(format_ban_line(now, &client, ip));
                    }
                    self.report_violation(&client, limit.limit, disallowed);
                }
            }

            self.persist(&client, ips)?;
        }

        if !ban_lines.is_empty() {
            self.append_ban_lines(&ban_lines)?;
            report.ban_lines = ban_lines.len();
            info!(lines = report.ban_lines, "IP limit violations written to ban log");
            self.rotate.notify_one();
        }

        Ok(report)
    }

    fn seed_from_store(&self, client: &str, now: DateTime<Local>) -> Result<()> {
        if !self.seeded.lock().insert(client.to_string()) {
            return Ok(());
        }
        if let Some(record) = self.store.find_by_client(client)? {
            self.state.seed(client, &record.ips, now);
        }
        Ok(())
    }

    fn persist(&self, client: &str, ips: Vec<String>) -> Result<()> {
        let record = ClientIpRecord {
            client: client.to_string(),
            ips,
            updated_at: Utc::now(),
        };
        match self.store.find_by_client(client)? {
            Some(_) => self.store.update(&record),
            None => self.store.create(&record),
        }
    }

    fn report_violation(&self, client: &str, limit: u32, disallowed: &[String]) {
        let mut reported = self.reported.lock();
        if disallowed.is_empty() {
            reported.remove(client);
            return;
        }
        if reported.get(client).map(Vec::as_slice) == Some(disallowed) {
            return;
        }
        reported.insert(client.to_string(), disallowed.to_vec());
        self.notifier.notify(Notification::IpLimitExceeded {
            client: client.to_string(),
            limit,
            disallowed: disallowed.to_vec(),
        });
    }

    fn append_ban_lines(&self, lines: &[String]) -> Result<()> {
        let to_error = |source: std::io::Error| CoreError::LogRead {
            path: self.ban_log.clone(),
            source,
        };

        if let Some(parent) = self.ban_log.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(to_error)?;
            }
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.ban_log)
            .map_err(to_error)?;

        let mut body = lines.join("\n");
        body.push('\n');
        file.write_all(body.as_bytes()).map_err(to_error)
    }
}

/// Re-reads the whole access log each tick, then enforces
pub struct BatchIpScanner {
    provider: Arc<dyn ConfigProvider>,
    enforcer: Arc<IpLimitEnforcer>,
    missing_log_warned: AtomicBool,
}

impl BatchIpScanner {
    pub fn new(provider: Arc<dyn ConfigProvider>, enforcer: Arc<IpLimitEnforcer>) -> Self {
        Self {
            provider,
            enforcer,
            missing_log_warned: AtomicBool::new(false),
        }
    }

    pub async fn scan(&self) -> Result<EnforcementReport> {
        let access_log = self.provider.engine_config()?.access_log_path();
        let Some(path) = access_log else {
            if !self.missing_log_warned.swap(true, Ordering::SeqCst) {
                warn!("Engine access log is disabled, IP limits cannot be enforced");
            }
            return Ok(EnforcementReport::default());
        };

        match read_observations(&path).await {
            Ok(observations) => {
                let now = Local::now();
                let accepted = self.enforcer.state().observe_all(&observations, now);
                debug!(path = %path.display(), lines = observations.len(), accepted, "Access log scanned");
            }
            // Missing or rotated mid-read; the next tick retries
            Err(e) => debug!(error = %e, "Access log not readable"),
        }

        self.enforcer.enforce(Local::now()).await
    }
}

#[async_trait]
impl Tick for BatchIpScanner {
    fn name(&self) -> &str {
        "ip-limit-scan"
    }

    async fn tick(&self) {
        if let Err(e) = self.scan().await {
            warn!(error = %e, "IP limit enforcement pass failed");
        }
    }
}
