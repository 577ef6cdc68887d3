//! Recurring tasks: the record model and the per-cycle dispatcher.

use std::ops::RangeInclusive;

use futures::StreamExt;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::codec::{decode_words, encode_words};
use crate::context::AgentContext;
use crate::error::{MetronomeError, Result};
use crate::model::{AssocType, ObjectId, ObjectKind, TASK_ROOT};

// ---------------------------------------------------------------------------
// TaskDefinition
// ---------------------------------------------------------------------------

/// Wire layout: `[owner, channel, payload1, payload2, interval_ticks]`,
/// five big-endian u64 words (40 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TaskDefinition {
    pub owner: u64,
    pub channel: u64,
    pub payload1: u64,
    pub payload2: u64,
    pub interval_ticks: u64,
}

impl TaskDefinition {
    pub const WORDS: usize = 5;

    pub fn encode(&self) -> Vec<u8> {
        encode_words(&[
            self.owner,
            self.channel,
            self.payload1,
            self.payload2,
            self.interval_ticks,
        ])
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let [owner, channel, payload1, payload2, interval_ticks] = decode_words::<5>(data)?;
        Ok(Self {
            owner,
            channel,
            payload1,
            payload2,
            interval_ticks,
        })
    }

    /// Whether the task fires at `tick`. A zero interval never reaches the
    /// modulo; it is reported as invalid.
    pub fn is_due(&self, tick: u64) -> Result<bool> {
        Ok(!self.due_ticks(tick..=tick)?.is_empty())
    }

    /// Ticks in `ticks` at which the task fires, in ascending order.
    pub fn due_ticks(&self, ticks: RangeInclusive<u64>) -> Result<Vec<u64>> {
        let interval = self.interval_ticks;
        if interval == 0 {
            return Err(MetronomeError::Validation(
                "task has a zero interval".into(),
            ));
        }
        let (start, end) = ticks.into_inner();
        let first = match start % interval {
            0 => start,
            rem => match start.checked_add(interval - rem) {
                Some(first) => first,
                None => return Ok(Vec::new()),
            },
        };
        if first > end {
            return Ok(Vec::new());
        }
        let count = (end - first) / interval + 1;
        Ok((0..count).map(|i| first + i * interval).collect())
    }

    /// Bytes delivered when the task fires: `[payload1, payload2]`.
    pub fn payload(&self) -> Vec<u8> {
        encode_words(&[self.payload1, self.payload2])
    }
}

// ---------------------------------------------------------------------------
// Dispatch / execution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Fired,
    NotDue,
    Failed,
}

/// Spawn one worker per scheduled task owned by this shard, evaluating every
/// tick in `ticks`.
///
/// A stream failure stops discovery but keeps the workers already spawned.
pub async fn dispatch_tasks(
    ctx: &AgentContext,
    ticks: RangeInclusive<u64>,
) -> JoinSet<TaskOutcome> {
    let mut workers = JoinSet::new();
    let mut candidates = ctx
        .store
        .stream_assocs(AssocType::ScheduledTask, TASK_ROOT, ctx.shard);

    while let Some(next) = candidates.next().await {
        match next {
            Ok(task_id) => {
                let ctx = ctx.clone();
                let ticks = ticks.clone();
                workers.spawn(async move { execute_task(&ctx, task_id, ticks).await });
            }
            Err(e) => {
                error!(shard_id = ctx.shard.id, error = %e, "scheduled task stream failed");
                break;
            }
        }
    }

    debug!(
        shard_id = ctx.shard.id,
        from_tick = *ticks.start(),
        to_tick = *ticks.end(),
        workers = workers.len(),
        "tasks dispatched"
    );
    workers
}

/// Evaluate one task over `ticks` and push its payload once per due tick.
///
/// Never fails: errors are logged and reported as [`TaskOutcome::Failed`].
pub async fn execute_task(
    ctx: &AgentContext,
    task_id: u64,
    ticks: RangeInclusive<u64>,
) -> TaskOutcome {
    let _slot = match ctx.acquire_slot().await {
        Ok(slot) => slot,
        Err(e) => {
            error!(task_id, error = %e, "no worker slot for scheduled task");
            return TaskOutcome::Failed;
        }
    };

    let (from_tick, to_tick) = (*ticks.start(), *ticks.end());
    match fire_due_ticks(ctx, task_id, ticks).await {
        Ok(0) => TaskOutcome::NotDue,
        Ok(_) => TaskOutcome::Fired,
        Err(e) => {
            error!(
                task_id,
                from_tick,
                to_tick,
                error = %e,
                "failed to process a scheduled task"
            );
            TaskOutcome::Failed
        }
    }
}

async fn fire_due_ticks(
    ctx: &AgentContext,
    task_id: u64,
    ticks: RangeInclusive<u64>,
) -> Result<usize> {
    let data = ctx
        .store
        .get_object(ObjectKind::Task, &ObjectId::Seq(task_id))
        .await?
        .ok_or_else(|| MetronomeError::NotFound {
            kind: ObjectKind::Task.to_string(),
            id: task_id.to_string(),
        })?;
    let task = TaskDefinition::decode(&data)?;
    let due = task.due_ticks(ticks)?;
    for &tick in &due {
        info!(
            task_id,
            tick,
            owner = task.owner,
            channel = task.channel,
            "executing scheduled task"
        );
        ctx.messenger
            .push_message(task.owner, task.channel, task.payload())
            .await?;
    }
    Ok(due.len())
}
