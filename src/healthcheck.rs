//! Crash recovery for the engine process
//!
//! Samples the engine on a short interval and restarts it after two
//! consecutive crashed samples.

use crate::jobs::Tick;
use crate::notifications::{Notification, Notifier};
use crate::supervisor::EngineControl;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Consecutive crashed samples that trigger a restart
pub const CRASH_THRESHOLD: u32 = 2;

pub struct HealthLoop {
    engine: Arc<dyn EngineControl>,
    notifier: Arc<dyn Notifier>,
    consecutive_failures: AtomicU32,
    crash_reported: AtomicBool,
}

impl HealthLoop {
    pub fn new(engine: Arc<dyn EngineControl>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            engine,
            notifier,
            consecutive_failures: AtomicU32::new(0),
            crash_reported: AtomicBool::new(false),
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Tick for HealthLoop {
    fn name(&self) -> &str {
        "engine-health"
    }

    async fn tick(&self) {
        if !self.engine.did_crash() {
            if self.consecutive_failures.swap(0, Ordering::SeqCst) > 0 {
                debug!("Engine healthy again, failure count reset");
            }
            self.crash_reported.store(false, Ordering::SeqCst);
            return;
        }

        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures < CRASH_THRESHOLD {
            debug!(failures, "Engine not running, waiting for next sample");
            return;
        }
        self.consecutive_failures.store(0, Ordering::SeqCst);

        let result = self.engine.result();
        if !self.crash_reported.swap(true, Ordering::SeqCst) {
            warn!(result = %result, "Engine is not running");
            self.notifier.notify(Notification::EngineCrashed {
                result: result.clone(),
            });
        }

        info!("Restarting crashed engine");
        match self.engine.restart(true).await {
            Ok(()) => self.notifier.notify(Notification::EngineRestarted {
                reason: "crash recovery".to_string(),
            }),
            Err(e) => {
                error!(error = %e, "Engine restart after crash failed");
                self.notifier.notify(Notification::EngineRestartFailed {
                    error: e.to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CoreError, Result};
    use crate::notifications::RecordingNotifier;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use parking_lot::Mutex;

    /// Replays a scripted sequence of crashed/healthy samples
    struct ScriptedEngine {
        samples: Mutex<VecDeque<bool>>,
        restarts: AtomicUsize,
        restart_ok: bool,
    }

    impl ScriptedEngine {
        fn new(crashed: &[bool], restart_ok: bool) -> Arc<Self> {
            Arc::new(Self {
                samples: Mutex::new(crashed.iter().copied().collect()),
                restarts: AtomicUsize::new(0),
                restart_ok,
            })
        }

        fn restarts(&self) -> usize {
            self.restarts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EngineControl for ScriptedEngine {
        fn is_running(&self) -> bool {
            !self.did_crash()
        }
        fn did_crash(&self) -> bool {
            self.samples.lock().pop_front().unwrap_or(false)
        }
        fn result(&self) -> String {
            "panic: out of memory".to_string()
        }
        fn api_port(&self) -> Option<u16> {
            None
        }
        fn set_online_clients(&self, _clients: Vec<String>) {}
        async fn restart(&self, _force: bool) -> Result<()> {
            self.restarts.fetch_add(1, Ordering::SeqCst);
            if self.restart_ok {
                Ok(())
            } else {
                Err(CoreError::Stats("spawn failed".into()))
            }
        }
    }

    async fn run(engine: Arc<ScriptedEngine>, ticks: usize) -> (HealthLoop, Arc<RecordingNotifier>) {
        let notifier = Arc::new(RecordingNotifier::default());
        let health = HealthLoop::new(engine, notifier.clone());
        for _ in 0..ticks {
            health.tick().await;
        }
        (health, notifier)
    }

    #[tokio::test]
    async fn test_single_blip_does_not_restart() {
        let engine = ScriptedEngine::new(&[true, false], true);
        let (health, notifier) = run(engine.clone(), 2).await;

        assert_eq!(engine.restarts(), 0);
        assert_eq!(health.consecutive_failures(), 0);
        assert!(notifier.events().is_empty());
    }

    #[tokio::test]
    async fn test_two_consecutive_samples_restart_once() {
        let engine = ScriptedEngine::new(&[true, true], true);
        let (health, notifier) = run(engine.clone(), 2).await;

        assert_eq!(engine.restarts(), 1);
        assert_eq!(health.consecutive_failures(), 0);
        assert_eq!(
            notifier.events(),
            vec![
                Notification::EngineCrashed {
                    result: "panic: out of memory".into()
                },
                Notification::EngineRestarted {
                    reason: "crash recovery".into()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_restart_retried_on_later_ticks() {
        let engine = ScriptedEngine::new(&[true, true, true, true], false);
        let (_health, notifier) = run(engine.clone(), 4).await;

        assert_eq!(engine.restarts(), 2);
        let crashed = notifier
            .events()
            .iter()
            .filter(|n| matches!(n, Notification::EngineCrashed { .. }))
            .count();
        assert_eq!(crashed, 1);
    }
}
