//! Command blocks: the record model and the transactional processor.
//!
//! A block payload holds one or more 48-byte commands
//! (`[action, p1, p2, p3, p4, p5]`, big-endian u64 words). Every block is
//! applied in a single read-write transaction together with its
//! processed-command marker and its state change, so a block either takes
//! full effect exactly once or leaves no trace and stays open for retry.

use chrono::Utc;
use futures::StreamExt;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::codec::{bytes_to_ints, ints_to_bytes, ByteOrder, Signedness, WORD};
use crate::context::AgentContext;
use crate::error::{MetronomeError, Result};
use crate::handlers::{self, HandlerOutcome};
use crate::model::{BlockState, CommandBlock, ObjectId, ObjectKind};
use crate::store::Transaction;
use crate::task::TaskDefinition;

pub const COMMAND_WORDS: usize = 6;
pub const COMMAND_BYTES: usize = COMMAND_WORDS * WORD;

// ---------------------------------------------------------------------------
// Action / CommandRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Repeat,
    Desist,
}

impl Action {
    pub fn code(self) -> u64 {
        match self {
            Self::Repeat => 1,
            Self::Desist => 2,
        }
    }

    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            1 => Some(Self::Repeat),
            2 => Some(Self::Desist),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandRecord {
    pub action: u64,
    pub params: [u64; 5],
}

impl CommandRecord {
    pub fn repeat(task: &TaskDefinition) -> Self {
        Self {
            action: Action::Repeat.code(),
            params: [
                task.owner,
                task.channel,
                task.payload1,
                task.payload2,
                task.interval_ticks,
            ],
        }
    }

    pub fn desist(task_id: u64) -> Self {
        Self {
            action: Action::Desist.code(),
            params: [task_id, 0, 0, 0, 0],
        }
    }

    fn words(&self) -> [u64; COMMAND_WORDS] {
        let [p1, p2, p3, p4, p5] = self.params;
        [self.action, p1, p2, p3, p4, p5]
    }
}

pub fn encode_commands(commands: &[CommandRecord]) -> Vec<u8> {
    commands
        .iter()
        .flat_map(|c| c.words())
        .flat_map(u64::to_be_bytes)
        .collect()
}

/// Decode a block payload into its commands. The payload must hold at least
/// one command and a whole number of them.
pub fn decode_commands(payload: &[u8]) -> Result<Vec<CommandRecord>> {
    if payload.is_empty() {
        return Err(MetronomeError::Validation("empty command payload".into()));
    }
    if payload.len() % COMMAND_BYTES != 0 {
        return Err(MetronomeError::LengthMismatch {
            len: payload.len(),
            width: COMMAND_BYTES,
        });
    }
    let words = bytes_to_ints(payload, WORD, ByteOrder::BigEndian, Signedness::Unsigned)?;
    Ok(words
        .chunks_exact(COMMAND_WORDS)
        .map(|w| CommandRecord {
            action: w[0] as u64,
            params: [w[1] as u64, w[2] as u64, w[3] as u64, w[4] as u64, w[5] as u64],
        })
        .collect())
}

// ---------------------------------------------------------------------------
// ProcessedCommandMarker
// ---------------------------------------------------------------------------

/// Idempotency ledger entry. Stored under the command id; the value is the
/// processing time in unix seconds as one signed big-endian word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedCommandMarker {
    pub command_id: String,
    pub processed_at: i64,
}

impl ProcessedCommandMarker {
    pub fn now(command_id: &str) -> Self {
        Self {
            command_id: command_id.to_string(),
            processed_at: Utc::now().timestamp(),
        }
    }

    pub fn object_id(&self) -> ObjectId {
        ObjectId::Named(self.command_id.clone())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        ints_to_bytes(
            &[i128::from(self.processed_at)],
            WORD,
            ByteOrder::BigEndian,
            Signedness::Signed,
        )
    }

    pub fn decode(command_id: &str, data: &[u8]) -> Result<Self> {
        let values = bytes_to_ints(data, WORD, ByteOrder::BigEndian, Signedness::Signed)?;
        match values.as_slice() {
            [processed_at] => Ok(Self {
                command_id: command_id.to_string(),
                processed_at: *processed_at as i64,
            }),
            _ => Err(MetronomeError::LengthMismatch {
                len: data.len(),
                width: WORD,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatch / processing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Effects, marker and state change committed together.
    Applied,
    /// The marker already existed; the block was only marked processed.
    Duplicate,
    /// The block had no id and was marked as an error.
    Discarded,
    /// The transaction was rolled back; the block stays open.
    RolledBack,
    /// A store call outside the transaction failed.
    Failed,
}

/// Spawn one worker per open block in the context's command collection.
pub async fn dispatch_commands(ctx: &AgentContext) -> JoinSet<CommandOutcome> {
    let mut workers = JoinSet::new();
    let mut blocks = ctx.store.stream_blocks(&ctx.collection, &BlockState::OPEN);

    while let Some(next) = blocks.next().await {
        match next {
            Ok(block) => {
                let ctx = ctx.clone();
                workers.spawn(async move { process_block(&ctx, block).await });
            }
            Err(e) => {
                error!(collection = %ctx.collection, error = %e, "command block stream failed");
                break;
            }
        }
    }

    debug!(collection = %ctx.collection, workers = workers.len(), "command blocks dispatched");
    workers
}

/// Apply one block atomically and at most once per command id.
pub async fn process_block(ctx: &AgentContext, block: CommandBlock) -> CommandOutcome {
    let Some(command_id) = block.command_id().map(str::to_string) else {
        warn!(seq = block.key.seq, "command block missing id, discarding");
        return match ctx.store.mark_block(&block.key, BlockState::Error).await {
            Ok(()) => CommandOutcome::Discarded,
            Err(e) => {
                error!(seq = block.key.seq, error = %e, "failed to mark id-less block");
                CommandOutcome::Failed
            }
        };
    };

    let _slot = match ctx.acquire_slot().await {
        Ok(slot) => slot,
        Err(e) => {
            error!(command_id = %command_id, error = %e, "no worker slot for command block");
            return CommandOutcome::Failed;
        }
    };

    let marker_id = ObjectId::Named(command_id.clone());
    match ctx
        .store
        .object_exists(ObjectKind::ProcessedCommand, &marker_id)
        .await
    {
        Ok(true) => {
            info!(command_id = %command_id, "skipping already processed command block");
            return match ctx.store.mark_block(&block.key, BlockState::Processed).await {
                Ok(()) => CommandOutcome::Duplicate,
                Err(e) => {
                    error!(
                        command_id = %command_id,
                        error = %e,
                        "failed to mark duplicate block"
                    );
                    CommandOutcome::Failed
                }
            };
        }
        Ok(false) => {}
        Err(e) => {
            error!(command_id = %command_id, error = %e, "idempotency check failed");
            return CommandOutcome::Failed;
        }
    }

    let mut tx = match ctx.store.begin_read_write().await {
        Ok(tx) => tx,
        Err(e) => {
            error!(command_id = %command_id, error = %e, "failed to open transaction");
            return CommandOutcome::Failed;
        }
    };

    let outcome = apply_block(tx.as_mut(), &block, &command_id).await;
    match outcome {
        HandlerOutcome::Applied => match tx.commit().await {
            Ok(()) => {
                info!(command_id = %command_id, "successfully committed command block");
                CommandOutcome::Applied
            }
            Err(MetronomeError::Conflict(reason)) => {
                warn!(
                    command_id = %command_id,
                    reason = %reason,
                    "command block committed elsewhere first"
                );
                CommandOutcome::RolledBack
            }
            Err(e) => {
                error!(
                    command_id = %command_id,
                    error = %e,
                    "commit failed; block left for retry"
                );
                CommandOutcome::RolledBack
            }
        },
        rejected => {
            if let Err(e) = tx.rollback().await {
                error!(command_id = %command_id, error = %e, "rollback failed");
            }
            match rejected {
                HandlerOutcome::ValidationFailed(reason) => warn!(
                    command_id = %command_id,
                    reason = %reason,
                    permanent = true,
                    "command block rejected; transaction rolled back"
                ),
                HandlerOutcome::StoreError(e) => error!(
                    command_id = %command_id,
                    error = %e,
                    "failed to process command block; transaction rolled back"
                ),
                HandlerOutcome::Applied => {}
            }
            CommandOutcome::RolledBack
        }
    }
}

async fn apply_block(
    tx: &mut dyn Transaction,
    block: &CommandBlock,
    command_id: &str,
) -> HandlerOutcome {
    let commands = match decode_commands(&block.payload) {
        Ok(commands) => commands,
        Err(e) => return HandlerOutcome::ValidationFailed(format!("malformed payload: {e}")),
    };

    for (index, command) in commands.iter().enumerate() {
        match handlers::execute(tx, command).await {
            HandlerOutcome::Applied => {}
            HandlerOutcome::ValidationFailed(reason) => {
                return HandlerOutcome::ValidationFailed(format!("command {index}: {reason}"))
            }
            failed => return failed,
        }
    }

    let marker = ProcessedCommandMarker::now(command_id);
    let data = match marker.encode() {
        Ok(data) => data,
        Err(e) => return e.into(),
    };
    if let Err(e) = tx
        .create_object(ObjectKind::ProcessedCommand, marker.object_id(), data)
        .await
    {
        return e.into();
    }
    if let Err(e) = tx.mark(&block.key, BlockState::Processed).await {
        return e.into();
    }
    HandlerOutcome::Applied
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::LogMessenger;
    use crate::model::{AssocType, Shard, COMMAND_COLLECTION, TASK_ROOT};
    use crate::store::{FailPoint, MemoryStore, ObjectStore};
    use std::sync::Arc;

    const TASK: TaskDefinition = TaskDefinition {
        owner: 5,
        channel: 2,
        payload1: 10,
        payload2: 20,
        interval_ticks: 1,
    };

    fn setup() -> (MemoryStore, AgentContext) {
        let store = MemoryStore::new();
        let ctx = AgentContext::new(
            Arc::new(store.clone()),
            Arc::new(LogMessenger),
            Shard::default(),
            4,
        )
        .unwrap();
        (store, ctx)
    }

    fn submit(store: &MemoryStore, id: Option<&str>, commands: &[CommandRecord]) -> CommandBlock {
        let key = store.append_block(COMMAND_COLLECTION, id, encode_commands(commands));
        store.block(&key).unwrap()
    }

    #[test]
    fn command_payload_is_48_bytes_per_command() {
        let payload = encode_commands(&[CommandRecord::repeat(&TASK)]);
        assert_eq!(payload.len(), COMMAND_BYTES);
        assert_eq!(&payload[..8], &1u64.to_be_bytes());
        assert_eq!(
            decode_commands(&payload).unwrap(),
            vec![CommandRecord::repeat(&TASK)]
        );
    }

    #[test]
    fn decode_rejects_empty_and_partial_payloads() {
        assert!(decode_commands(&[]).is_err());
        assert!(decode_commands(&[0; 47]).is_err());
        assert!(decode_commands(&[0; 56]).is_err());
        assert_eq!(decode_commands(&[0; 96]).unwrap().len(), 2);
    }

    #[test]
    fn marker_encodes_signed_timestamp() {
        let marker = ProcessedCommandMarker {
            command_id: "c1".into(),
            processed_at: 1_700_000_000,
        };
        let data = marker.encode().unwrap();
        assert_eq!(data.len(), 8);
        assert_eq!(ProcessedCommandMarker::decode("c1", &data).unwrap(), marker);
    }

    #[tokio::test]
    async fn applied_block_writes_task_marker_and_state_together() {
        let (store, ctx) = setup();
        let block = submit(&store, Some("c1"), &[CommandRecord::repeat(&TASK)]);

        assert_eq!(process_block(&ctx, block.clone()).await, CommandOutcome::Applied);

        assert_eq!(store.objects_of(ObjectKind::Task).len(), 1);
        assert_eq!(
            store
                .assoc_targets(AssocType::ScheduledTask, TASK_ROOT)
                .len(),
            1
        );
        assert!(store
            .object(ObjectKind::ProcessedCommand, &ObjectId::Named("c1".into()))
            .is_some());
        assert_eq!(
            store.block(&block.key).unwrap().state,
            BlockState::Processed
        );
    }

    #[tokio::test]
    async fn missing_id_marks_error_without_transaction() {
        let (store, ctx) = setup();
        let block = submit(&store, None, &[CommandRecord::repeat(&TASK)]);

        assert_eq!(process_block(&ctx, block.clone()).await, CommandOutcome::Discarded);
        assert_eq!(store.block(&block.key).unwrap().state, BlockState::Error);
        assert!(store.objects_of(ObjectKind::Task).is_empty());
        assert_eq!(store.stats().commits, 0);
    }

    #[tokio::test]
    async fn redelivered_block_only_gets_marked() {
        let (store, ctx) = setup();
        let first = submit(&store, Some("c1"), &[CommandRecord::repeat(&TASK)]);
        process_block(&ctx, first).await;
        let before = store.stats();

        let again = submit(&store, Some("c1"), &[CommandRecord::repeat(&TASK)]);
        assert_eq!(process_block(&ctx, again.clone()).await, CommandOutcome::Duplicate);

        let after = store.stats();
        assert_eq!(after.commits, before.commits);
        assert_eq!(after.object_writes, before.object_writes);
        assert_eq!(after.block_marks, before.block_marks + 1);
        assert_eq!(store.objects_of(ObjectKind::Task).len(), 1);
        assert_eq!(store.block(&again.key).unwrap().state, BlockState::Processed);
    }

    #[tokio::test]
    async fn failing_command_rolls_back_whole_block() {
        let (store, ctx) = setup();
        let block = submit(
            &store,
            Some("batch"),
            &[
                CommandRecord::repeat(&TASK),
                CommandRecord::repeat(&TASK),
                CommandRecord::desist(999),
            ],
        );

        assert_eq!(process_block(&ctx, block.clone()).await, CommandOutcome::RolledBack);
        assert!(store.objects_of(ObjectKind::Task).is_empty());
        assert!(store
            .assoc_targets(AssocType::ScheduledTask, TASK_ROOT)
            .is_empty());
        assert!(store.objects_of(ObjectKind::ProcessedCommand).is_empty());
        assert_eq!(
            store.block(&block.key).unwrap().state,
            BlockState::Unprocessed
        );
    }

    #[tokio::test]
    async fn malformed_payload_is_rolled_back_and_left_open() {
        let (store, ctx) = setup();
        let key = store.append_block(COMMAND_COLLECTION, Some("junk"), vec![1, 2, 3]);
        let block = store.block(&key).unwrap();

        assert_eq!(process_block(&ctx, block).await, CommandOutcome::RolledBack);
        assert_eq!(store.block(&key).unwrap().state, BlockState::Unprocessed);
        assert_eq!(store.stats().rollbacks, 1);
    }

    #[tokio::test]
    async fn commit_failure_leaves_block_retryable() {
        let (store, ctx) = setup();
        let block = submit(&store, Some("c1"), &[CommandRecord::repeat(&TASK)]);
        store.fail_once(FailPoint::Commit);

        assert_eq!(process_block(&ctx, block.clone()).await, CommandOutcome::RolledBack);
        assert!(store.objects_of(ObjectKind::Task).is_empty());
        assert_eq!(store.block(&block.key).unwrap().state, BlockState::Unprocessed);

        assert_eq!(process_block(&ctx, block).await, CommandOutcome::Applied);
        assert_eq!(store.objects_of(ObjectKind::Task).len(), 1);
    }

    #[tokio::test]
    async fn idempotency_check_failure_touches_nothing() {
        let (store, ctx) = setup();
        let block = submit(&store, Some("c1"), &[CommandRecord::repeat(&TASK)]);
        store.fail_once(FailPoint::Exists(ObjectKind::ProcessedCommand));

        assert_eq!(process_block(&ctx, block.clone()).await, CommandOutcome::Failed);
        assert_eq!(store.block(&block.key).unwrap().state, BlockState::Unprocessed);
    }

    #[tokio::test]
    async fn dispatch_skips_processed_blocks() {
        let (store, ctx) = setup();
        let done = submit(&store, Some("a"), &[CommandRecord::repeat(&TASK)]);
        store
            .mark_block(&done.key, BlockState::Processed)
            .await
            .unwrap();
        submit(&store, Some("b"), &[CommandRecord::repeat(&TASK)]);

        let mut workers = dispatch_commands(&ctx).await;
        let mut outcomes = Vec::new();
        while let Some(res) = workers.join_next().await {
            outcomes.push(res.unwrap());
        }
        assert_eq!(outcomes, vec![CommandOutcome::Applied]);
    }
}
