//! Cycle orchestration: clock, concurrent dispatch, barrier, report.

use std::future::Future;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::clock;
use crate::command::{dispatch_commands, CommandOutcome};
use crate::config::{ClockPolicy, Config, DEFAULT_MAX_CATCH_UP_TICKS};
use crate::context::AgentContext;
use crate::error::Result;
use crate::messaging::Messenger;
use crate::store::ObjectStore;
use crate::task::{dispatch_tasks, TaskOutcome};

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Counters for one completed work cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub shard_id: u32,
    pub tick: u64,
    /// Whether this shard moved the clock (as opposed to observing it).
    pub advanced: bool,
    /// Task dispatch was skipped because the observed tick was already fired.
    pub tasks_skipped: bool,
    /// Ticks tasks were evaluated at; above 1 when a follower catches up.
    pub ticks_evaluated: u64,
    pub tasks_seen: usize,
    pub tasks_fired: usize,
    pub tasks_not_due: usize,
    pub tasks_failed: usize,
    pub commands_seen: usize,
    pub commands_applied: usize,
    pub commands_duplicate: usize,
    pub commands_discarded: usize,
    pub commands_rolled_back: usize,
    pub commands_failed: usize,
    pub peak_workers: usize,
}

impl CycleReport {
    fn record_task(&mut self, outcome: TaskOutcome) {
        self.tasks_seen += 1;
        match outcome {
            TaskOutcome::Fired => self.tasks_fired += 1,
            TaskOutcome::NotDue => self.tasks_not_due += 1,
            TaskOutcome::Failed => self.tasks_failed += 1,
        }
    }

    fn record_command(&mut self, outcome: CommandOutcome) {
        self.commands_seen += 1;
        match outcome {
            CommandOutcome::Applied => self.commands_applied += 1,
            CommandOutcome::Duplicate => self.commands_duplicate += 1,
            CommandOutcome::Discarded => self.commands_discarded += 1,
            CommandOutcome::RolledBack => self.commands_rolled_back += 1,
            CommandOutcome::Failed => self.commands_failed += 1,
        }
    }
}

/// Totals across a `run` invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub cycles: u64,
    pub halted_cycles: u64,
    pub tasks_fired: usize,
    pub commands_applied: usize,
    pub last_tick: Option<u64>,
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

pub struct Agent {
    ctx: AgentContext,
    policy: ClockPolicy,
    max_catch_up_ticks: u64,
    last_fired_tick: Option<u64>,
}

impl Agent {
    pub fn new(ctx: AgentContext, policy: ClockPolicy) -> Self {
        Self {
            ctx,
            policy,
            max_catch_up_ticks: DEFAULT_MAX_CATCH_UP_TICKS,
            last_fired_tick: None,
        }
    }

    /// Cap the number of missed ticks a follower evaluates in one cycle.
    pub fn with_max_catch_up_ticks(mut self, max: u64) -> Self {
        self.max_catch_up_ticks = max.max(1);
        self
    }

    /// Build an agent from a validated config.
    pub fn from_config(
        config: &Config,
        store: Arc<dyn ObjectStore>,
        messenger: Arc<dyn Messenger>,
    ) -> Result<Self> {
        config.ensure_valid()?;
        let ctx = AgentContext::new(store, messenger, config.shard, config.concurrency_limit)?
            .with_collection(&config.command_collection);
        Ok(Self::new(ctx, config.clock).with_max_catch_up_ticks(config.max_catch_up_ticks))
    }

    pub fn context(&self) -> &AgentContext {
        &self.ctx
    }

    pub fn policy(&self) -> ClockPolicy {
        self.policy
    }

    /// Run one work cycle.
    ///
    /// A clock failure aborts the cycle before any worker is spawned. Once
    /// dispatch starts, every worker is awaited before the report is built;
    /// individual worker failures only show up in the counters.
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        let shard_id = self.ctx.shard.id;
        let advances = self.policy.advances(self.ctx.shard);

        let clock_result = if advances {
            clock::advance_clock(self.ctx.store.as_ref()).await
        } else {
            clock::observe_clock(self.ctx.store.as_ref()).await
        };
        let tick = match clock_result {
            Ok(tick) => tick,
            Err(e) => {
                error!(shard_id, error = %e, "clock unavailable, halting work cycle");
                return Err(e);
            }
        };

        let window = match self.tick_window(advances, tick).await {
            Ok(window) => window,
            Err(e) => {
                error!(shard_id, error = %e, "fire cursor unavailable, halting work cycle");
                return Err(e);
            }
        };
        if window.is_none() {
            debug!(shard_id, tick, "tick already fired on this shard, skipping tasks");
        }

        info!(shard_id, tick, "starting agent work cycle");
        self.ctx.reset_peak();

        let ctx = &self.ctx;
        let task_window = window.clone();
        let (task_workers, command_workers) = tokio::join!(
            async {
                match task_window {
                    Some(ticks) => dispatch_tasks(ctx, ticks).await,
                    None => JoinSet::new(),
                }
            },
            dispatch_commands(ctx)
        );

        let mut report = CycleReport {
            shard_id,
            tick,
            advanced: advances,
            tasks_skipped: window.is_none(),
            ticks_evaluated: window
                .as_ref()
                .map_or(0, |ticks| ticks.end() - ticks.start() + 1),
            ..CycleReport::default()
        };

        let (tasks, commands) = tokio::join!(join_all(task_workers), join_all(command_workers));
        for outcome in tasks {
            report.record_task(outcome.unwrap_or(TaskOutcome::Failed));
        }
        for outcome in commands {
            report.record_command(outcome.unwrap_or(CommandOutcome::Failed));
        }
        report.peak_workers = self.ctx.peak_workers();

        if window.is_some() {
            self.last_fired_tick = Some(tick);
            if !advances {
                if let Err(e) =
                    clock::record_fire_cursor(self.ctx.store.as_ref(), shard_id, tick).await
                {
                    error!(shard_id, tick, error = %e, "failed to persist fire cursor");
                }
            }
        }

        info!(
            shard_id,
            tick,
            tasks_fired = report.tasks_fired,
            tasks_failed = report.tasks_failed,
            commands_applied = report.commands_applied,
            commands_rolled_back = report.commands_rolled_back,
            peak_workers = report.peak_workers,
            "agent work cycle complete"
        );
        Ok(report)
    }

    /// Ticks to evaluate tasks at this cycle, or `None` when this shard has
    /// already evaluated `tick`.
    ///
    /// The advancing shard evaluates exactly the tick it produced. A follower
    /// evaluates every tick since its fire cursor, starting from tick 1 when
    /// it has none, bounded by `max_catch_up_ticks`.
    async fn tick_window(
        &self,
        advances: bool,
        tick: u64,
    ) -> Result<Option<RangeInclusive<u64>>> {
        if advances {
            return Ok(Some(tick..=tick));
        }
        let shard_id = self.ctx.shard.id;
        let stored = clock::read_fire_cursor(self.ctx.store.as_ref(), shard_id).await?;
        let last = stored.max(self.last_fired_tick).unwrap_or(0);
        if tick <= last {
            return Ok(None);
        }
        let mut from = last + 1;
        if tick - last > self.max_catch_up_ticks {
            from = tick - self.max_catch_up_ticks + 1;
            warn!(
                shard_id,
                tick,
                skipped = from - last - 1,
                "catch-up window exceeded; oldest missed ticks not evaluated"
            );
        }
        Ok(Some(from..=tick))
    }

    /// Run cycles every `interval` until `shutdown` resolves or `max_cycles`
    /// cycles have been attempted.
    ///
    /// A halted cycle is logged and counted; the loop carries on.
    pub async fn run<F>(
        &mut self,
        max_cycles: Option<u64>,
        interval: Duration,
        shutdown: F,
    ) -> RunSummary
    where
        F: Future<Output = ()>,
    {
        let mut summary = RunSummary::default();
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            if max_cycles.is_some_and(|max| summary.cycles >= max) {
                break;
            }
            tokio::select! {
                _ = &mut shutdown => {
                    info!(shard_id = self.ctx.shard.id, "shutdown requested, stopping agent");
                    break;
                }
                _ = ticker.tick() => {
                    summary.cycles += 1;
                    match self.run_cycle().await {
                        Ok(report) => {
                            summary.tasks_fired += report.tasks_fired;
                            summary.commands_applied += report.commands_applied;
                            summary.last_tick = Some(report.tick);
                        }
                        Err(e) => {
                            warn!(cycle = summary.cycles, error = %e, "work cycle halted");
                            summary.halted_cycles += 1;
                        }
                    }
                }
            }
        }

        summary
    }
}

/// Await every worker. A panicked or cancelled worker yields `None`.
async fn join_all<T: 'static>(mut workers: JoinSet<T>) -> Vec<Option<T>> {
    let mut out = Vec::with_capacity(workers.len());
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(outcome) => out.push(Some(outcome)),
            Err(e) => {
                error!(error = %e, "worker did not complete");
                out.push(None);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::RecordingMessenger;
    use crate::model::{AssocType, ObjectKind, Shard, TASK_ROOT};
    use crate::store::{FailPoint, MemoryStore, ObjectStore, Transaction};
    use crate::task::TaskDefinition;

    fn agent(store: &MemoryStore, shard: Shard, policy: ClockPolicy) -> Agent {
        recording_agent(store, shard, policy, Arc::new(RecordingMessenger::new()))
    }

    fn recording_agent(
        store: &MemoryStore,
        shard: Shard,
        policy: ClockPolicy,
        messenger: Arc<RecordingMessenger>,
    ) -> Agent {
        let ctx = AgentContext::new(Arc::new(store.clone()), messenger, shard, 4).unwrap();
        Agent::new(ctx, policy)
    }

    /// One task owned by shard 1 of 2, due every third tick.
    async fn seed_follower_task(store: &MemoryStore) {
        let task = TaskDefinition {
            owner: 5,
            channel: 2,
            payload1: 10,
            payload2: 20,
            interval_ticks: 3,
        };
        let mut tx = store.begin_read_write().await.unwrap();
        let id = tx
            .insert_object(ObjectKind::Task, task.encode())
            .await
            .unwrap();
        assert_eq!(id % 2, 1);
        tx.create_assoc(TASK_ROOT, id, AssocType::ScheduledTask)
            .await
            .unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn empty_store_cycle_starts_clock() {
        let store = MemoryStore::new();
        let mut a = agent(&store, Shard::default(), ClockPolicy::default());
        let report = a.run_cycle().await.unwrap();
        assert_eq!(report.tick, 1);
        assert!(report.advanced);
        assert_eq!(report.tasks_seen, 0);
        assert_eq!(report.commands_seen, 0);
        assert_eq!(a.run_cycle().await.unwrap().tick, 2);
    }

    #[tokio::test]
    async fn clock_failure_halts_before_dispatch() {
        let store = MemoryStore::new();
        store.append_block("commands", Some("c1"), vec![0; 48]);
        store.fail_once(FailPoint::Put(ObjectKind::Clock));
        let mut a = agent(&store, Shard::default(), ClockPolicy::default());
        assert!(a.run_cycle().await.is_err());
        assert_eq!(store.stats().commits, 0);
        assert_eq!(store.stats().rollbacks, 0);
    }

    #[tokio::test]
    async fn follower_skips_already_fired_tick() {
        let store = MemoryStore::new();
        let policy = ClockPolicy::SingleAdvancer { owner_shard: 0 };
        let mut owner = agent(&store, Shard::new(0, 2), policy);
        let mut follower = agent(&store, Shard::new(1, 2), policy);

        assert!(follower.run_cycle().await.is_err());
        owner.run_cycle().await.unwrap();

        let first = follower.run_cycle().await.unwrap();
        assert_eq!(first.tick, 1);
        assert!(!first.advanced);
        assert!(!first.tasks_skipped);

        let second = follower.run_cycle().await.unwrap();
        assert_eq!(second.tick, 1);
        assert!(second.tasks_skipped);
    }

    #[tokio::test]
    async fn run_stops_after_max_cycles() {
        let store = MemoryStore::new();
        let mut a = agent(&store, Shard::default(), ClockPolicy::EveryShard);
        let summary = a
            .run(Some(3), Duration::from_millis(1), std::future::pending())
            .await;
        assert_eq!(summary.cycles, 3);
        assert_eq!(summary.halted_cycles, 0);
        assert_eq!(summary.last_tick, Some(3));
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let store = MemoryStore::new();
        let mut a = agent(&store, Shard::default(), ClockPolicy::default());
        let summary = a.run(None, Duration::from_secs(60), async {}).await;
        assert!(summary.cycles <= 1);
    }

    #[tokio::test]
    async fn follower_catches_up_on_ticks_advanced_between_its_cycles() {
        let store = MemoryStore::new();
        seed_follower_task(&store).await;
        let policy = ClockPolicy::SingleAdvancer { owner_shard: 0 };
        let messenger = Arc::new(RecordingMessenger::new());
        let mut owner = agent(&store, Shard::new(0, 2), policy);
        let mut follower = recording_agent(&store, Shard::new(1, 2), policy, messenger.clone());

        for _ in 0..4 {
            owner.run_cycle().await.unwrap();
        }
        let first = follower.run_cycle().await.unwrap();
        assert_eq!(first.tick, 4);
        assert_eq!(first.ticks_evaluated, 4);
        assert_eq!(messenger.deliveries().len(), 1);

        owner.run_cycle().await.unwrap();
        owner.run_cycle().await.unwrap();
        let second = follower.run_cycle().await.unwrap();
        assert_eq!(second.tick, 6);
        assert_eq!(second.ticks_evaluated, 2);
        assert_eq!(messenger.deliveries().len(), 2);
    }

    #[tokio::test]
    async fn restarted_follower_does_not_refire_evaluated_ticks() {
        let store = MemoryStore::new();
        seed_follower_task(&store).await;
        let policy = ClockPolicy::SingleAdvancer { owner_shard: 0 };
        let mut owner = agent(&store, Shard::new(0, 2), policy);
        for _ in 0..3 {
            owner.run_cycle().await.unwrap();
        }

        let before = Arc::new(RecordingMessenger::new());
        recording_agent(&store, Shard::new(1, 2), policy, before.clone())
            .run_cycle()
            .await
            .unwrap();
        assert_eq!(before.deliveries().len(), 1);

        let after = Arc::new(RecordingMessenger::new());
        let mut restarted = recording_agent(&store, Shard::new(1, 2), policy, after.clone());
        let report = restarted.run_cycle().await.unwrap();
        assert!(report.tasks_skipped);
        assert!(after.deliveries().is_empty());
    }

    #[tokio::test]
    async fn catch_up_is_bounded() {
        let store = MemoryStore::new();
        seed_follower_task(&store).await;
        let policy = ClockPolicy::SingleAdvancer { owner_shard: 0 };
        let mut owner = agent(&store, Shard::new(0, 2), policy);
        for _ in 0..9 {
            owner.run_cycle().await.unwrap();
        }

        let messenger = Arc::new(RecordingMessenger::new());
        let mut follower = recording_agent(&store, Shard::new(1, 2), policy, messenger.clone())
            .with_max_catch_up_ticks(4);
        let report = follower.run_cycle().await.unwrap();
        assert_eq!(report.ticks_evaluated, 4);
        // Ticks 6..=9 only: tick 3 falls outside the window.
        assert_eq!(messenger.deliveries().len(), 2);
    }

    #[tokio::test]
    async fn owner_never_writes_a_fire_cursor() {
        let store = MemoryStore::new();
        let mut owner = agent(&store, Shard::new(0, 2), ClockPolicy::default());
        owner.run_cycle().await.unwrap();
        assert!(store.objects_of(ObjectKind::FireCursor).is_empty());
    }
}
