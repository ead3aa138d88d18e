//! Needs-restart flag and the loop that consumes it

use crate::jobs::Tick;
use crate::notifications::{Notification, Notifier};
use crate::supervisor::EngineControl;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};

/// Shared "engine must reload its configuration" signal.
///
/// Any number of raises between two consumes collapse into one restart.
#[derive(Debug, Default)]
pub struct RestartFlag {
    needed: AtomicBool,
}

impl RestartFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.needed.store(true, Ordering::SeqCst);
    }

    /// Clear the flag, returning whether it was set
    pub fn consume_if_set(&self) -> bool {
        self.needed
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_set(&self) -> bool {
        self.needed.load(Ordering::SeqCst)
    }
}

/// Restarts the engine whenever the flag was raised since the last tick
pub struct ConfigReloadLoop {
    engine: Arc<dyn EngineControl>,
    flag: Arc<RestartFlag>,
    notifier: Arc<dyn Notifier>,
}

impl ConfigReloadLoop {
    pub fn new(
        engine: Arc<dyn EngineControl>,
        flag: Arc<RestartFlag>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            engine,
            flag,
            notifier,
        }
    }
}

#[async_trait]
impl Tick for ConfigReloadLoop {
    fn name(&self) -> &str {
        "config-reload"
    }

    async fn tick(&self) {
        if !self.flag.consume_if_set() {
            return;
        }

        info!("Restart requested, reloading engine");
        match self.engine.restart(true).await {
            Ok(()) => self.notifier.notify(Notification::EngineRestarted {
                reason: "configuration changed".to_string(),
            }),
            Err(e) => {
                error!(error = %e, "Engine restart failed");
                self.notifier.notify(Notification::EngineRestartFailed {
                    error: e.to_string(),
                });
            }
        }
    }
}
