use anyhow::Context;
use corekeeper::admin::{AdminContext, AdminServer, PKG_NAME, VERSION};
use corekeeper::client_ips::ClientIpState;
use corekeeper::config::Config;
use corekeeper::db::Database;
use corekeeper::engine_config::{ConfigProvider, FileConfigProvider};
use corekeeper::healthcheck::HealthLoop;
use corekeeper::iplimit::{BanToolProbe, BatchIpScanner, IpLimitEnforcer};
use corekeeper::jobs::{JobManager, PeriodicJob};
use corekeeper::log_rotator::LogRotator;
use corekeeper::log_streamer::LogStreamer;
use corekeeper::notifications::{FanoutNotifier, Notifier, TracingNotifier, WebhookNotifier};
use corekeeper::process::EnginePaths;
use corekeeper::restart::{ConfigReloadLoop, RestartFlag};
use corekeeper::supervisor::{EngineControl, EngineSupervisor};
use corekeeper::traffic::{EngineCliStats, TrafficAccountant};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("corekeeper=info".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("corekeeper.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    info!(path = %config_path.display(), "Configuration loaded");
    log_startup(&config);

    let notifier = build_notifier(&config)?;
    let db = Arc::new(Database::open(&config.database.path)?);

    let provider: Arc<dyn ConfigProvider> =
        Arc::new(FileConfigProvider::new(&config.engine.config_template));
    let supervisor = EngineSupervisor::new(
        EnginePaths::from_settings(&config.engine),
        Arc::clone(&provider),
        config.engine.stop_grace_period(),
    );
    let engine: Arc<dyn EngineControl> = supervisor.clone();

    let restart_flag = Arc::new(RestartFlag::new());
    let client_ips = Arc::new(ClientIpState::new(
        config.ip_limit.max_ips_per_client,
        config.ip_limit.max_clients,
    ));
    let rotate_wake = Arc::new(Notify::new());

    let enforcer = Arc::new(IpLimitEnforcer::new(
        Arc::clone(&client_ips),
        db.clone(),
        db.clone(),
        Arc::clone(&notifier),
        config.logs.ban_log(),
        BanToolProbe::new(config.ip_limit.ban_tool.as_str()),
        config.ip_limit.ip_ttl(),
        Arc::clone(&rotate_wake),
    ));

    // The health loop retries a failed first start
    if let Err(e) = supervisor.start().await {
        error!(error = %e, "Engine failed to start");
    }

    let mut jobs = JobManager::new();

    if config.admin.port != 0 {
        let bind_addr: SocketAddr = format!("{}:{}", config.admin.bind, config.admin.port)
            .parse()
            .with_context(|| format!("Invalid admin bind address {}", config.admin.bind))?;
        let auth_token = config.admin.token.clone().unwrap_or_else(|| {
            let token = uuid::Uuid::new_v4().to_string();
            warn!(token = %token, "No admin token configured, generated one for this run");
            token
        });
        jobs.register_critical(Arc::new(AdminServer::new(
            bind_addr,
            AdminContext {
                engine: supervisor.clone(),
                client_ips: Arc::clone(&client_ips),
                restart_flag: Arc::clone(&restart_flag),
                auth_token,
            },
        )));
    }

    jobs.register(Arc::new(PeriodicJob::new(
        Arc::new(HealthLoop::new(engine.clone(), Arc::clone(&notifier))),
        config.jobs.health_interval(),
    )));
    jobs.register(Arc::new(PeriodicJob::new(
        Arc::new(ConfigReloadLoop::new(
            engine.clone(),
            Arc::clone(&restart_flag),
            Arc::clone(&notifier),
        )),
        config.jobs.reload_interval(),
    )));
    jobs.register(Arc::new(PeriodicJob::new(
        Arc::new(TrafficAccountant::new(
            engine.clone(),
            Arc::new(EngineCliStats::new(&config.engine.binary)),
            db.clone(),
            Arc::clone(&restart_flag),
            Arc::clone(&notifier),
        )),
        config.jobs.traffic_interval(),
    )));
    jobs.register(Arc::new(PeriodicJob::new(
        Arc::new(BatchIpScanner::new(Arc::clone(&provider), Arc::clone(&enforcer))),
        config.jobs.ip_scan_interval(),
    )));
    if config.ip_limit.streamer {
        jobs.register(Arc::new(LogStreamer::new(
            Arc::clone(&provider),
            Arc::clone(&client_ips),
            config.ip_limit.tail_poll(),
        )));
    }
    jobs.register(Arc::new(
        PeriodicJob::new(
            Arc::new(LogRotator::new(
                Arc::clone(&provider),
                config.logs.ban_log(),
                config.logs.ban_log_prev(),
                config.logs.access_log_prev(),
            )),
            config.jobs.rotate_interval(),
        )
        .with_wake(rotate_wake),
    ));

    if let Err(e) = jobs.start_all() {
        error!(error = %e, "Startup aborted");
        supervisor.shutdown().await;
        return Err(e);
    }
    info!(jobs = ?jobs.names(), "All jobs started");

    wait_for_shutdown_signal().await?;

    let report = jobs.stop_all(config.jobs.stop_timeout()).await;
    if !report.timed_out.is_empty() {
        warn!(jobs = ?report.timed_out, "Some jobs did not stop before the deadline");
    }

    info!("Stopping engine...");
    supervisor.shutdown().await;

    info!("Shutdown complete");
    Ok(())
}

fn build_notifier(config: &Config) -> anyhow::Result<Arc<dyn Notifier>> {
    let mut fanout = FanoutNotifier::new().with(Arc::new(TracingNotifier));
    if let Some(url) = &config.notifications.webhook_url {
        let webhook = WebhookNotifier::new(url, config.notifications.webhook_secret.clone())
            .context("Failed to create webhook notifier")?;
        info!(url = %url, "Webhook notifications enabled");
        fanout = fanout.with(Arc::new(webhook));
    }
    Ok(Arc::new(fanout))
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT (Ctrl+C), shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

fn log_startup(config: &Config) {
    info!(
        name = PKG_NAME,
        version = VERSION,
        engine = %config.engine.binary.display(),
        database = %config.database.path.display(),
        ban_log = %config.logs.ban_log().display(),
        admin_port = config.admin.port,
        streamer = config.ip_limit.streamer,
        ip_ttl_secs = config.ip_limit.ip_ttl_secs,
        "Starting corekeeper"
    );
}
