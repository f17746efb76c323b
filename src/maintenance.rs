//! Background maintenance loops
//!
//! Each loop runs one cycle per interval until its cancellation token fires.
//! A failed cycle is logged and the next one is pushed back by an
//! exponentially growing delay, capped at `max_backoff_secs`, so a broken
//! store does not turn into a tight error loop.

use crate::backoff::FailureBackoff;
use crate::blackboard::Blackboard;
use crate::config::MaintenanceConfig;
use crate::dedup::DedupTracker;
use crate::error::Result;
use crate::heuristics::HeuristicService;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One periodic job
#[async_trait]
pub trait MaintenanceTask: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Run one cycle; returns how many items it touched
    async fn cycle(&self) -> Result<usize>;
}

/// Batch fraud evaluation of every live heuristic with applications
pub struct FraudSweeper {
    heuristics: HeuristicService,
}

impl FraudSweeper {
    pub fn new(heuristics: HeuristicService) -> Self {
        Self { heuristics }
    }
}

#[async_trait]
impl MaintenanceTask for FraudSweeper {
    fn name(&self) -> &'static str {
        "fraud_sweep"
    }

    async fn cycle(&self) -> Result<usize> {
        let summary = self.heuristics.fraud_sweep().await?;
        if summary.suspicious + summary.fraudulent > 0 {
            info!(
                suspicious = summary.suspicious,
                fraudulent = summary.fraudulent,
                "fraud sweep flagged heuristics"
            );
        }
        if summary.failed > 0 {
            warn!(failed = summary.failed, "fraud sweep could not evaluate some heuristics");
        }
        Ok(summary.evaluated)
    }
}

/// Removes expired blackboard entries and idle retrieval sessions
pub struct BlackboardSweeper {
    blackboard: Arc<dyn Blackboard>,
    dedup: DedupTracker,
    session_idle: chrono::Duration,
}

impl BlackboardSweeper {
    pub fn new(blackboard: Arc<dyn Blackboard>, dedup: DedupTracker, session_idle: chrono::Duration) -> Self {
        Self {
            blackboard,
            dedup,
            session_idle,
        }
    }
}

#[async_trait]
impl MaintenanceTask for BlackboardSweeper {
    fn name(&self) -> &'static str {
        "blackboard_sweep"
    }

    async fn cycle(&self) -> Result<usize> {
        let removed = self.blackboard.sweep_expired().await?;
        let sessions = self.dedup.prune_idle(Utc::now(), self.session_idle);
        if sessions > 0 {
            debug!(sessions, "pruned idle retrieval sessions");
        }
        Ok(removed)
    }
}

/// Spawn `task` on a fixed period with failure backoff
pub fn spawn_loop(
    task: Arc<dyn MaintenanceTask>,
    period: Duration,
    max_backoff: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let name = task.name();
        info!(task = name, period_secs = period.as_secs(), "maintenance loop started");

        let mut tick = interval(period.max(Duration::from_millis(1)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut backoff = FailureBackoff::new(period.min(Duration::from_secs(1)).max(Duration::from_millis(10)), max_backoff);

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = shutdown.cancelled() => break,
            }

            match task.cycle().await {
                Ok(count) => {
                    if backoff.consecutive_failures() > 0 {
                        info!(task = name, "maintenance recovered");
                    }
                    backoff.record_success();
                    debug!(task = name, count, "maintenance cycle done");
                }
                Err(e) => {
                    let delay = backoff.record_failure();
                    warn!(
                        task = name,
                        error = %e,
                        consecutive_failures = backoff.consecutive_failures(),
                        ?delay,
                        "maintenance cycle failed"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.cancelled() => break,
                    }
                }
            }
        }

        info!(task = name, "maintenance loop stopped");
    })
}

/// Running maintenance loops
pub struct Maintenance {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Maintenance {
    /// Start the fraud and blackboard sweepers. Disabled config starts nothing.
    pub fn start(
        config: &MaintenanceConfig,
        heuristics: HeuristicService,
        blackboard: Arc<dyn Blackboard>,
        dedup: DedupTracker,
        session_idle: chrono::Duration,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let mut handles = Vec::new();
        if config.enabled {
            let max_backoff = Duration::from_secs(config.max_backoff_secs);
            handles.push(spawn_loop(
                Arc::new(FraudSweeper::new(heuristics)),
                Duration::from_secs(config.fraud_sweep_secs),
                max_backoff,
                shutdown.clone(),
            ));
            handles.push(spawn_loop(
                Arc::new(BlackboardSweeper::new(blackboard, dedup, session_idle)),
                Duration::from_secs(config.blackboard_sweep_secs),
                max_backoff,
                shutdown.clone(),
            ));
        } else {
            info!("background maintenance is disabled");
        }
        Self { shutdown, handles }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_running(&self) -> bool {
        self.handles.iter().any(|h| !h.is_finished())
    }

    /// Cancel every loop and wait for them to stop
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "maintenance loop ended abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails its first `failures` cycles
    struct Counting {
        calls: AtomicUsize,
        failures: usize,
    }

    #[async_trait]
    impl MaintenanceTask for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn cycle(&self) -> Result<usize> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(EngineError::TransientStore("database is locked".into()))
            } else {
                Ok(n)
            }
        }
    }

    #[tokio::test]
    async fn test_loop_survives_failures_and_stops_on_cancel() {
        let task = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            failures: 3,
        });
        let token = CancellationToken::new();
        let handle = spawn_loop(
            task.clone(),
            Duration::from_millis(10),
            Duration::from_millis(100),
            token.clone(),
        );

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(task.calls.load(Ordering::SeqCst) > 3);

        token.cancel();
        handle.await.unwrap();
        let after = task.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(task.calls.load(Ordering::SeqCst), after);
    }

    #[tokio::test]
    async fn test_failures_back_off() {
        let task = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            failures: usize::MAX,
        });
        let token = CancellationToken::new();
        let handle = spawn_loop(
            task.clone(),
            Duration::from_millis(1),
            Duration::from_secs(60),
            token.clone(),
        );

        // without backoff this would be ~1000 cycles
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(task.calls.load(Ordering::SeqCst) < 50);
        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_disabled_starts_nothing() {
        let store = crate::db::Store::open_in_memory(&Default::default()).unwrap();
        let promotion = crate::config::PromotionConfig::default();
        let heuristics = HeuristicService::new(
            store,
            promotion.clone(),
            crate::fraud::FraudDetector::new(Default::default(), &promotion),
            crate::events::EventBus::new(8),
        );
        let config = MaintenanceConfig {
            enabled: false,
            ..MaintenanceConfig::default()
        };
        let maintenance = Maintenance::start(
            &config,
            heuristics,
            Arc::new(crate::blackboard::MemoryBlackboard::new(Default::default())),
            DedupTracker::new(Default::default()),
            chrono::Duration::minutes(30),
        );
        assert!(!maintenance.is_running());
        maintenance.shutdown().await;
    }
}
