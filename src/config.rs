use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the control plane
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Proxy engine binary and file locations
    #[serde(default)]
    pub engine: EngineSettings,

    /// Log folder for the ban log and previous-generation files
    #[serde(default)]
    pub logs: LogSettings,

    /// Storage settings
    #[serde(default)]
    pub database: DatabaseSettings,

    /// Background job intervals
    #[serde(default)]
    pub jobs: JobSettings,

    /// Per-client IP limit enforcement
    #[serde(default)]
    pub ip_limit: IpLimitSettings,

    /// Admin API
    #[serde(default)]
    pub admin: AdminSettings,

    /// Alert delivery
    #[serde(default)]
    pub notifications: NotificationSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineSettings {
    /// Path to the proxy engine binary
    #[serde(default = "default_engine_binary")]
    pub binary: PathBuf,

    /// Folder holding the generated config file and crash reports
    #[serde(default = "default_bin_folder")]
    pub bin_folder: PathBuf,

    /// JSON file served by the default configuration provider
    #[serde(default = "default_config_template")]
    pub config_template: PathBuf,

    /// Grace period in seconds between SIGTERM and SIGKILL on shutdown
    #[serde(default = "default_stop_grace_period")]
    pub stop_grace_period_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            binary: default_engine_binary(),
            bin_folder: default_bin_folder(),
            config_template: default_config_template(),
            stop_grace_period_secs: default_stop_grace_period(),
        }
    }
}

impl EngineSettings {
    /// Location the engine configuration is written to before each start
    pub fn config_file(&self) -> PathBuf {
        self.bin_folder.join("config.json")
    }

    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_secs(self.stop_grace_period_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogSettings {
    #[serde(default = "default_log_folder")]
    pub folder: PathBuf,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            folder: default_log_folder(),
        }
    }
}

impl LogSettings {
    /// Live ban log consumed by the external ban tool
    pub fn ban_log(&self) -> PathBuf {
        self.folder.join("ip-limit.log")
    }

    pub fn ban_log_prev(&self) -> PathBuf {
        self.folder.join("ip-limit.prev.log")
    }

    pub fn access_log_prev(&self) -> PathBuf {
        self.folder.join("access.prev.log")
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseSettings {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct JobSettings {
    /// Health loop sampling interval in milliseconds
    #[serde(default = "default_health_interval")]
    pub health_interval_ms: u64,

    /// Restart-flag check interval in seconds
    #[serde(default = "default_reload_interval")]
    pub reload_interval_secs: u64,

    /// Traffic accounting interval in seconds
    #[serde(default = "default_traffic_interval")]
    pub traffic_interval_secs: u64,

    /// Batch access-log scan and enforcement interval in seconds
    #[serde(default = "default_ip_scan_interval")]
    pub ip_scan_interval_secs: u64,

    /// Log rotation interval in seconds
    #[serde(default = "default_rotate_interval")]
    pub rotate_interval_secs: u64,

    /// Shared deadline for stopping all jobs, in seconds
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            health_interval_ms: default_health_interval(),
            reload_interval_secs: default_reload_interval(),
            traffic_interval_secs: default_traffic_interval(),
            ip_scan_interval_secs: default_ip_scan_interval(),
            rotate_interval_secs: default_rotate_interval(),
            stop_timeout_secs: default_stop_timeout(),
        }
    }
}

impl JobSettings {
    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.reload_interval_secs)
    }

    pub fn traffic_interval(&self) -> Duration {
        Duration::from_secs(self.traffic_interval_secs)
    }

    pub fn ip_scan_interval(&self) -> Duration {
        Duration::from_secs(self.ip_scan_interval_secs)
    }

    pub fn rotate_interval(&self) -> Duration {
        Duration::from_secs(self.rotate_interval_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IpLimitSettings {
    /// Follow the access log in real time in addition to batch scans
    #[serde(default = "default_true")]
    pub streamer: bool,

    /// Evict IPs not seen for this many seconds (0 keeps them for the whole run)
    #[serde(default = "default_ip_ttl")]
    pub ip_ttl_secs: u64,

    /// Upper bound of tracked IPs per client
    #[serde(default = "default_max_ips_per_client")]
    pub max_ips_per_client: usize,

    /// Upper bound of tracked clients
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,

    /// Poll interval of the access-log follower in milliseconds
    #[serde(default = "default_tail_poll")]
    pub tail_poll_ms: u64,

    /// Command used to detect the external ban tool
    #[serde(default = "default_ban_tool")]
    pub ban_tool: String,
}

impl Default for IpLimitSettings {
    fn default() -> Self {
        Self {
            streamer: true,
            ip_ttl_secs: default_ip_ttl(),
            max_ips_per_client: default_max_ips_per_client(),
            max_clients: default_max_clients(),
            tail_poll_ms: default_tail_poll(),
            ban_tool: default_ban_tool(),
        }
    }
}

impl IpLimitSettings {
    pub fn ip_ttl(&self) -> Option<Duration> {
        (self.ip_ttl_secs > 0).then(|| Duration::from_secs(self.ip_ttl_secs))
    }

    pub fn tail_poll(&self) -> Duration {
        Duration::from_millis(self.tail_poll_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AdminSettings {
    #[serde(default = "default_admin_bind")]
    pub bind: String,

    /// Admin API port (0 disables the API)
    #[serde(default)]
    pub port: u16,

    /// Bearer token; a random one is generated at startup if not set
    pub token: Option<String>,
}

impl Default for AdminSettings {
    fn default() -> Self {
        Self {
            bind: default_admin_bind(),
            port: 0,
            token: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct NotificationSettings {
    /// Webhook receiving JSON alert payloads
    pub webhook_url: Option<String>,

    /// Secret used to sign webhook bodies (X-Signature-256)
    pub webhook_secret: Option<String>,
}

fn default_engine_binary() -> PathBuf {
    PathBuf::from(format!(
        "bin/xray-{}-{}",
        std::env::consts::OS,
        std::env::consts::ARCH
    ))
}

fn default_bin_folder() -> PathBuf {
    PathBuf::from("bin")
}

fn default_config_template() -> PathBuf {
    PathBuf::from("bin/template.json")
}

fn default_stop_grace_period() -> u64 {
    5
}

fn default_log_folder() -> PathBuf {
    PathBuf::from("log")
}

fn default_database_path() -> PathBuf {
    PathBuf::from("db/corekeeper.db")
}

fn default_health_interval() -> u64 {
    1000
}

fn default_reload_interval() -> u64 {
    30
}

fn default_traffic_interval() -> u64 {
    10
}

fn default_ip_scan_interval() -> u64 {
    30
}

fn default_rotate_interval() -> u64 {
    3600
}

fn default_stop_timeout() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_ip_ttl() -> u64 {
    1800
}

fn default_max_ips_per_client() -> usize {
    100
}

fn default_max_clients() -> usize {
    5000
}

fn default_tail_poll() -> u64 {
    500
}

fn default_ban_tool() -> String {
    "fail2ban-client".to_string()
}

fn default_admin_bind() -> String {
    "127.0.0.1".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.engine.binary.as_os_str().is_empty() {
            anyhow::bail!("engine.binary must not be empty");
        }

        let jobs = &self.jobs;
        let intervals = [
            ("jobs.health_interval_ms", jobs.health_interval_ms),
            ("jobs.reload_interval_secs", jobs.reload_interval_secs),
            ("jobs.traffic_interval_secs", jobs.traffic_interval_secs),
            ("jobs.ip_scan_interval_secs", jobs.ip_scan_interval_secs),
            ("jobs.rotate_interval_secs", jobs.rotate_interval_secs),
            ("jobs.stop_timeout_secs", jobs.stop_timeout_secs),
            ("ip_limit.tail_poll_ms", self.ip_limit.tail_poll_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                anyhow::bail!("{} must be greater than zero", name);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        config.validate().unwrap();

        assert_eq!(config.jobs.health_interval(), Duration::from_secs(1));
        assert_eq!(config.jobs.reload_interval(), Duration::from_secs(30));
        assert_eq!(config.jobs.rotate_interval(), Duration::from_secs(3600));
        assert_eq!(config.jobs.stop_timeout(), Duration::from_secs(10));
        assert!(config.ip_limit.streamer);
        assert_eq!(config.ip_limit.ip_ttl(), Some(Duration::from_secs(1800)));
        assert_eq!(config.admin.port, 0);
        assert!(config.notifications.webhook_url.is_none());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
            [engine]
            binary = "/usr/local/x-ui/bin/xray-linux-amd64"
            bin_folder = "/usr/local/x-ui/bin"
            stop_grace_period_secs = 2

            [logs]
            folder = "/var/log/x-ui"

            [jobs]
            health_interval_ms = 500
            traffic_interval_secs = 5

            [ip_limit]
            streamer = false
            ip_ttl_secs = 0

            [admin]
            port = 2096
            token = "secret"

            [notifications]
            webhook_url = "https://hooks.example.com/alerts"
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();

        assert_eq!(
            config.engine.config_file(),
            PathBuf::from("/usr/local/x-ui/bin/config.json")
        );
        assert_eq!(config.engine.stop_grace_period(), Duration::from_secs(2));
        assert_eq!(
            config.logs.ban_log(),
            PathBuf::from("/var/log/x-ui/ip-limit.log")
        );
        assert_eq!(
            config.logs.ban_log_prev(),
            PathBuf::from("/var/log/x-ui/ip-limit.prev.log")
        );
        assert_eq!(config.jobs.health_interval(), Duration::from_millis(500));
        assert_eq!(config.jobs.traffic_interval(), Duration::from_secs(5));
        assert!(!config.ip_limit.streamer);
        assert_eq!(config.ip_limit.ip_ttl(), None);
        assert_eq!(config.admin.port, 2096);
        assert_eq!(config.admin.token.as_deref(), Some("secret"));
        assert_eq!(
            config.notifications.webhook_url.as_deref(),
            Some("https://hooks.example.com/alerts")
        );
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let config: Config = toml::from_str("[jobs]\nreload_interval_secs = 0").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("reload_interval_secs"));
    }

    #[test]
    fn test_load_from_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("corekeeper.toml");
        std::fs::write(&path, "[ip_limit]\nmax_clients = 10\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.ip_limit.max_clients, 10);
        assert_eq!(config.ip_limit.max_ips_per_client, 100);
    }
}
