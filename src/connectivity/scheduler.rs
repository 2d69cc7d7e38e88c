//! Renewal scheduler: periodic reconciliation and re-discovery
//!
//! One background task ticks at a fixed interval. Each tick reconciles the
//! lease manager; a run of ticks where the gateway never answered triggers a
//! fresh discovery, and while no gateway is known discovery is retried on its
//! own slower cadence as long as some mapping still needs a gateway. Granted
//! leases keep aging in between, so they expire on schedule even then.

use super::manager::{LeaseManager, ReconcileReport};
use crate::config::NatConfig;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Scheduler tunables
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Time between reconciliation passes
    pub tick_interval: Duration,
    /// Consecutive unreachable passes before re-discovery
    pub unreachable_threshold: u32,
    /// Discovery retry cadence while no gateway is known
    pub rediscovery_interval: Duration,
}

impl From<&NatConfig> for SchedulerConfig {
    fn from(config: &NatConfig) -> Self {
        Self {
            tick_interval: config.tick_interval(),
            unreachable_threshold: config.unreachable_threshold,
            rediscovery_interval: config.rediscovery_interval(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&NatConfig::default())
    }
}

/// Counts consecutive reconciliation passes where the gateway never answered
#[derive(Debug, Clone)]
pub struct UnreachableTracker {
    threshold: u32,
    consecutive: u32,
}

impl UnreachableTracker {
    /// Trip after `threshold` consecutive unreachable passes (at least one)
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive: 0,
        }
    }

    /// Feed one pass; returns true once the threshold is reached.
    ///
    /// Passes that made no gateway call leave the count unchanged.
    pub fn observe(&mut self, report: &ReconcileReport) -> bool {
        if report.gateway_unreachable() {
            self.consecutive += 1;
        } else if report.gateway_answered() {
            self.consecutive = 0;
        }
        self.consecutive >= self.threshold
    }

    /// Consecutive unreachable passes so far
    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    /// Start counting from zero
    pub fn reset(&mut self) {
        self.consecutive = 0;
    }
}

/// What one scheduler tick did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Ran a reconciliation pass
    Reconciled(ReconcileReport),
    /// Ran discovery; `found` tells whether a gateway answered
    Rediscovered {
        /// A gateway is now held
        found: bool,
    },
    /// No gateway and no mapping that needs one
    Idle,
}

/// Per-task scheduler bookkeeping, driven one tick at a time
#[derive(Debug)]
pub struct SchedulerState {
    config: SchedulerConfig,
    tracker: UnreachableTracker,
    last_discovery: Option<Instant>,
}

impl SchedulerState {
    /// Fresh state
    pub fn new(config: SchedulerConfig) -> Self {
        let tracker = UnreachableTracker::new(config.unreachable_threshold);
        Self {
            config,
            tracker,
            last_discovery: None,
        }
    }

    /// Run one tick against `manager`
    pub async fn tick(&mut self, manager: &LeaseManager) -> TickOutcome {
        if !manager.has_gateway().await {
            if !manager.wants_gateway().await {
                return TickOutcome::Idle;
            }
            let due = self
                .last_discovery
                .is_none_or(|at| at.elapsed() >= self.config.rediscovery_interval);
            if !due {
                // Only ages leases; nothing is sent without a gateway
                return TickOutcome::Reconciled(manager.reconcile().await);
            }
            self.last_discovery = Some(Instant::now());
            let found = manager.discover().await.is_ok();
            if found {
                info!("Gateway found again; resuming renewals");
                self.tracker.reset();
                return TickOutcome::Reconciled(manager.reconcile().await);
            }
            manager.reconcile().await;
            return TickOutcome::Rediscovered { found };
        }

        let report = manager.reconcile().await;
        if !self.tracker.observe(&report) {
            return TickOutcome::Reconciled(report);
        }

        warn!(
            "Gateway unreachable for {} consecutive passes; re-discovering",
            self.tracker.consecutive()
        );
        self.tracker.reset();
        self.last_discovery = Some(Instant::now());
        let found = match manager.discover().await {
            Ok(descriptor) => {
                info!("Re-discovered gateway at {}", descriptor.control_url);
                manager.reconcile().await;
                true
            }
            Err(e) => {
                debug!("Re-discovery failed: {}", e);
                false
            }
        };
        TickOutcome::Rediscovered { found }
    }
}

/// Background task renewing leases on a fixed tick
pub struct RenewalScheduler {
    task: Option<JoinHandle<()>>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl RenewalScheduler {
    /// Spawn the scheduler task; the first tick fires after one interval
    pub fn spawn(manager: LeaseManager, config: SchedulerConfig) -> Self {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let tick_interval = config.tick_interval;

        let task = tokio::spawn(async move {
            info!("Renewal scheduler started (tick every {:?})", tick_interval);
            let mut state = SchedulerState::new(config);
            let mut ticker =
                tokio::time::interval_at(Instant::now() + tick_interval, tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {}
                }
                let outcome = state.tick(&manager).await;
                debug!("Scheduler tick: {:?}", outcome);
            }
            info!("Renewal scheduler stopped");
        });

        Self {
            task: Some(task),
            shutdown: Some(shutdown_tx),
        }
    }

    /// Stop, letting a tick in progress finish for at most `grace`
    ///
    /// A tick still running after `grace` is aborted; its gateway call is
    /// abandoned and the lock it held is released.
    pub async fn stop(mut self, grace: Duration) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let Some(mut task) = self.task.take() else {
            return;
        };

        let result = match tokio::time::timeout(grace, &mut task).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Renewal tick still running after {:?}; aborting it", grace);
                task.abort();
                task.await
            }
        };
        if let Err(e) = result {
            if !e.is_cancelled() {
                warn!("Renewal scheduler task failed: {}", e);
            }
        }
    }

    /// The task is still running
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for RenewalScheduler {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
