//! Fleet poll scheduler
//!
//! Decides when a monitoring cycle may start. Two rules hold at all times:
//!
//! - **Mutual exclusion**: at most one cycle runs. Admission is a compare-and-set
//!   on the scheduler's `active` flag, won before any device work starts.
//! - **Cadence**: a scheduled cycle starts only once `interval` has passed since
//!   the previous start. Manual triggers skip this rule but not the first one.
//!
//! A cycle that runs longer than `stale_after` is aborted on the next admission
//! attempt, so a stuck or crashed cycle cannot block the fleet forever.
//!
//! An operator can pause automated monitoring. While paused, `check_and_run`
//! refuses every start; manual triggers still go through.
//!
//! ```text
//! tick / request ─→ check_and_run ─→ recover stale ─→ cadence? ─→ CAS flag ─→ cadence again ─→ begin_cycle ─→ spawn runner
//!                                                                                                          │
//!                                                              clear flag (same cycle id only) ←── finish ─┘
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::MonitoringConfig;
use crate::cycle::{CycleOutcome, CycleRunner};
use crate::storage::StorageBackend;
use crate::util::to_chrono;
use crate::{CycleId, CycleStatus, CycleTrigger};

#[derive(Debug, Clone, Copy)]
pub struct SchedulerSettings {
    /// Minimum time between two cycle starts
    pub interval: Duration,

    /// Running time after which a cycle is considered stuck
    pub stale_after: Duration,

    /// Period of the self-driving loop
    pub tick: Duration,
}

impl SchedulerSettings {
    pub fn from_config(config: &MonitoringConfig) -> Self {
        Self {
            interval: config.interval(),
            stale_after: config.stale_after(),
            tick: config.tick(),
        }
    }
}

/// Answer to an admission request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Admission {
    pub started: bool,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cycle_id: Option<CycleId>,
}

impl Admission {
    fn refused(reason: impl Into<String>) -> Self {
        Self {
            started: false,
            reason: reason.into(),
            cycle_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerStatus {
    pub active: bool,
    pub paused: bool,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub next_eligible_at: DateTime<Utc>,
    pub current_cycle_id: Option<CycleId>,
}

struct RunningCycle {
    id: CycleId,
    started_at: DateTime<Utc>,

    /// Absent for a cycle adopted from the store after a restart
    task: Option<AbortHandle>,
}

#[derive(Default)]
struct SchedulerState {
    last_cycle_at: Option<DateTime<Utc>>,
    running: Option<RunningCycle>,
}

pub struct FleetScheduler {
    active: AtomicBool,
    paused: AtomicBool,
    state: Mutex<SchedulerState>,
    settings: SchedulerSettings,
    runner: Arc<CycleRunner>,
    store: Arc<dyn StorageBackend>,
    idle: watch::Sender<bool>,
}

impl FleetScheduler {
    pub fn new(
        settings: SchedulerSettings,
        runner: Arc<CycleRunner>,
        store: Arc<dyn StorageBackend>,
    ) -> Arc<Self> {
        let (idle, _) = watch::channel(true);

        Arc::new(Self {
            active: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            state: Mutex::new(SchedulerState::default()),
            settings,
            runner,
            store,
            idle,
        })
    }

    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pick up the last recorded cycle so cadence survives restarts
    ///
    /// A cycle still marked RUNNING belonged to a process that died; it is adopted
    /// as the active cycle and expires through the staleness rule.
    pub async fn restore(&self) -> anyhow::Result<()> {
        let Some(latest) = self.store.latest_cycle().await? else {
            debug!("no previous cycle recorded");
            return Ok(());
        };

        let mut state = self.state();
        state.last_cycle_at = Some(latest.started_at);

        if latest.status == CycleStatus::Running {
            warn!(
                "cycle {} from a previous run is still marked running, adopting it",
                latest.id
            );
            state.running = Some(RunningCycle {
                id: latest.id,
                started_at: latest.started_at,
                task: None,
            });
            self.active.store(true, Ordering::Release);
            self.idle.send_replace(false);
        }

        info!("restored scheduler state, last cycle started at {}", latest.started_at);
        Ok(())
    }

    /// Start a cycle if none is running and the interval has elapsed
    #[instrument(skip(self))]
    pub async fn check_and_run(self: &Arc<Self>, now: DateTime<Utc>) -> anyhow::Result<Admission> {
        self.recover_stale(now).await;

        if self.is_paused() {
            return Ok(Admission::refused("automated monitoring is paused"));
        }

        if self.active.load(Ordering::Acquire) {
            return Ok(Admission::refused("a cycle is already running"));
        }

        if let Some(reason) = self.cadence_block(now) {
            return Ok(Admission::refused(reason));
        }

        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(Admission::refused("a cycle is already running"));
        }

        // a cycle may have started and finished since the first look
        if let Some(reason) = self.cadence_block(now) {
            self.active.store(false, Ordering::Release);
            return Ok(Admission::refused(reason));
        }
        if self.is_paused() {
            self.active.store(false, Ordering::Release);
            return Ok(Admission::refused("automated monitoring is paused"));
        }

        let trigger = if self.state().last_cycle_at.is_none() {
            CycleTrigger::AutoStart
        } else {
            CycleTrigger::Scheduled
        };

        self.start(trigger, now).await
    }

    /// Start a cycle now regardless of cadence, unless one is running
    #[instrument(skip(self))]
    pub async fn trigger_manual(self: &Arc<Self>, now: DateTime<Utc>) -> anyhow::Result<Admission> {
        self.recover_stale(now).await;

        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            let current = self.state().running.as_ref().map(|r| r.id);
            return Ok(Admission {
                started: false,
                reason: "a cycle is already running".to_string(),
                cycle_id: current,
            });
        }

        self.start(CycleTrigger::Manual, now).await
    }

    /// Stop automated cycle starts; a running cycle is left to finish
    pub fn pause(&self) -> bool {
        let was_paused = self.paused.swap(true, Ordering::AcqRel);
        if !was_paused {
            info!("automated monitoring paused");
        }
        !was_paused
    }

    /// Allow automated cycle starts again
    pub fn resume(&self) -> bool {
        let was_paused = self.paused.swap(false, Ordering::AcqRel);
        if was_paused {
            info!("automated monitoring resumed");
        }
        was_paused
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn status(&self, now: DateTime<Utc>) -> SchedulerStatus {
        let state = self.state();
        let due = state
            .last_cycle_at
            .map_or(now, |last| last + to_chrono(self.settings.interval));

        SchedulerStatus {
            active: self.active.load(Ordering::Acquire),
            paused: self.is_paused(),
            last_cycle_at: state.last_cycle_at,
            next_eligible_at: due.max(now),
            current_cycle_id: state.running.as_ref().map(|r| r.id),
        }
    }

    /// Resolves once no cycle is running
    pub async fn wait_idle(&self) {
        let mut idle = self.idle.subscribe();
        let _ = idle.wait_for(|idle| *idle).await;
    }

    /// Tick until `shutdown` resolves, trying to start a cycle on every tick
    pub async fn run(self: Arc<Self>, shutdown: impl Future<Output = ()>) {
        debug!("starting scheduler loop, tick every {:?}", self.settings.tick);

        let mut ticker = interval(self.settings.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.check_and_run(Utc::now()).await {
                        Ok(admission) if admission.started => {
                            debug!("tick started cycle {:?}", admission.cycle_id);
                        }
                        Ok(admission) => trace!("tick: {}", admission.reason),
                        Err(e) => error!("failed to start cycle: {e:#}"),
                    }
                }

                _ = &mut shutdown => {
                    debug!("scheduler loop received shutdown");
                    break;
                }
            }
        }
    }

    /// Why cadence forbids a scheduled start at `now`, if it does
    fn cadence_block(&self, now: DateTime<Utc>) -> Option<String> {
        let last = self.state().last_cycle_at?;
        let due = last + to_chrono(self.settings.interval);

        (now < due).then(|| format!("next cycle due at {}", due.to_rfc3339()))
    }

    /// Record and spawn a cycle; the caller holds the `active` flag
    async fn start(
        self: &Arc<Self>,
        trigger: CycleTrigger,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Admission> {
        let cycle = match self.store.begin_cycle(trigger, now).await {
            Ok(cycle) => cycle,
            Err(e) => {
                self.active.store(false, Ordering::Release);
                error!("failed to record cycle start: {e}");
                return Err(e.into());
            }
        };

        {
            let mut state = self.state();
            state.last_cycle_at = Some(cycle.started_at);
            state.running = Some(RunningCycle {
                id: cycle.id,
                started_at: cycle.started_at,
                task: None,
            });
        }
        self.idle.send_replace(false);

        info!("starting {} cycle {}", trigger.as_str(), cycle.id);

        let this = self.clone();
        let cycle_id = cycle.id;
        let task = tokio::spawn(async move {
            let outcome = this.runner.run(cycle_id).await;
            this.finish(cycle_id, outcome);
        });

        if let Some(running) = self.state().running.as_mut() {
            if running.id == cycle_id {
                running.task = Some(task.abort_handle());
            }
        }

        Ok(Admission {
            started: true,
            reason: format!("{} cycle started", trigger.as_str()),
            cycle_id: Some(cycle_id),
        })
    }

    /// Release the flag, but only for the cycle that holds it
    fn finish(&self, cycle_id: CycleId, outcome: CycleOutcome) {
        match &outcome {
            CycleOutcome::Completed(summary) => {
                debug!("cycle {cycle_id} finished with {} results", summary.total)
            }
            CycleOutcome::Aborted(reason) => warn!("cycle {cycle_id} aborted: {reason}"),
        }

        if self.release(cycle_id) {
            trace!("admission flag released by cycle {cycle_id}");
        } else {
            debug!("cycle {cycle_id} finished after being superseded");
        }
    }

    fn release(&self, cycle_id: CycleId) -> bool {
        let mut state = self.state();
        if state.running.as_ref().map(|r| r.id) != Some(cycle_id) {
            return false;
        }

        state.running = None;
        self.active.store(false, Ordering::Release);
        self.idle.send_replace(true);
        true
    }

    /// Abort the running cycle if it has exceeded `stale_after`
    async fn recover_stale(&self, now: DateTime<Utc>) {
        let stale_after = to_chrono(self.settings.stale_after);

        let stale = {
            let state = self.state();
            state
                .running
                .as_ref()
                .filter(|running| now - running.started_at >= stale_after)
                .map(|running| (running.id, running.started_at, running.task.clone()))
        };

        let Some((cycle_id, started_at, task)) = stale else {
            return;
        };

        warn!("cycle {cycle_id} running since {started_at} is stale, aborting it");

        if let Some(task) = task {
            task.abort();
        }

        let reason = format!(
            "stale: still running after {}s",
            self.settings.stale_after.as_secs()
        );
        if let Err(e) = self.store.abort_cycle(cycle_id, now, &reason).await {
            error!("failed to record abort of stale cycle {cycle_id}: {e}");
        }

        self.release(cycle_id);
    }
}
