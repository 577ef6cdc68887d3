//! In-process store used by tests and dry runs.
//!
//! Effects, streams and transactions follow the same contract as the redb
//! store. Every operation yields to the runtime (or sleeps for the configured
//! latency) before touching state so that concurrent workers interleave, and
//! one-shot [`FailPoint`]s let tests break individual store calls.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};

use super::{AssocStream, BlockStream, ObjectStore, PendingOp, Transaction, WriteBuffer};
use crate::error::{MetronomeError, Result};
use crate::model::{AssocType, BlockRef, BlockState, CommandBlock, ObjectId, ObjectKind, Shard};

/// A store call that should fail the next time it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailPoint {
    Get(ObjectKind),
    Put(ObjectKind),
    Exists(ObjectKind),
    StreamAssocs,
    StreamBlocks,
    MarkBlock,
    Begin,
    Commit,
}

/// Counters of state-changing calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub object_writes: u64,
    pub block_marks: u64,
    pub commits: u64,
    pub rollbacks: u64,
}

#[derive(Debug, Clone)]
struct StoredBlock {
    id: Option<String>,
    payload: Vec<u8>,
    state: BlockState,
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<(ObjectKind, ObjectId), Vec<u8>>,
    assocs: BTreeSet<(AssocType, u64, u64)>,
    blocks: BTreeMap<BlockRef, StoredBlock>,
    next_object_id: u64,
    next_block_seq: u64,
    stats: MemoryStats,
}

impl State {
    fn remove_object(&mut self, kind: ObjectKind, id: &ObjectId) -> bool {
        let removed = self.objects.remove(&(kind, id.clone())).is_some();
        if removed && kind == ObjectKind::Task {
            if let Some(task_id) = id.as_seq() {
                self.assocs
                    .retain(|(_, src, target)| *src != task_id && *target != task_id);
            }
        }
        removed
    }

    fn apply(&mut self, op: PendingOp) {
        match op {
            PendingOp::Put { kind, id, data } | PendingOp::Create { kind, id, data } => {
                self.objects.insert((kind, id), data);
                self.stats.object_writes += 1;
            }
            PendingOp::Assoc { src, target, ty } => {
                self.assocs.insert((ty, src, target));
            }
            PendingOp::Delete { kind, id } => {
                self.remove_object(kind, &id);
            }
            PendingOp::Mark { block, state } => {
                if let Some(stored) = self.blocks.get_mut(&block) {
                    stored.state = state;
                    self.stats.block_marks += 1;
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<State>,
    fail_points: Mutex<Vec<FailPoint>>,
    latency: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every store call sleeps for `latency` before running.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                latency: Some(latency),
                ..Inner::default()
            }),
        }
    }

    /// Arm a one-shot failure for the next matching call.
    pub fn fail_once(&self, point: FailPoint) {
        self.inner
            .fail_points
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(point);
    }

    /// Append a new `Unprocessed` block, playing the external writer.
    pub fn append_block(&self, collection: &str, id: Option<&str>, payload: Vec<u8>) -> BlockRef {
        let mut state = self.lock();
        state.next_block_seq += 1;
        let key = BlockRef {
            collection: collection.to_string(),
            seq: state.next_block_seq,
        };
        state.blocks.insert(
            key.clone(),
            StoredBlock {
                id: id.map(str::to_string),
                payload,
                state: BlockState::Unprocessed,
            },
        );
        key
    }

    /// Move a block back to `state`, as a writer re-submitting it would.
    pub fn reset_block(&self, block: &BlockRef, state: BlockState) {
        if let Some(stored) = self.lock().blocks.get_mut(block) {
            stored.state = state;
        }
    }

    pub fn block(&self, block: &BlockRef) -> Option<CommandBlock> {
        self.lock().blocks.get(block).map(|stored| CommandBlock {
            key: block.clone(),
            id: stored.id.clone(),
            payload: stored.payload.clone(),
            state: stored.state,
        })
    }

    pub fn object(&self, kind: ObjectKind, id: &ObjectId) -> Option<Vec<u8>> {
        self.lock().objects.get(&(kind, id.clone())).cloned()
    }

    pub fn objects_of(&self, kind: ObjectKind) -> Vec<(ObjectId, Vec<u8>)> {
        self.lock()
            .objects
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|((_, id), data)| (id.clone(), data.clone()))
            .collect()
    }

    pub fn assoc_targets(&self, ty: AssocType, src: u64) -> Vec<u64> {
        self.lock()
            .assocs
            .iter()
            .filter(|(t, s, _)| *t == ty && *s == src)
            .map(|(_, _, target)| *target)
            .collect()
    }

    pub fn stats(&self) -> MemoryStats {
        self.lock().stats
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn trip(&self, point: &FailPoint) -> Result<()> {
        let mut points = self
            .inner
            .fail_points
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        match points.iter().position(|p| p == point) {
            Some(idx) => {
                points.remove(idx);
                Err(MetronomeError::Store(format!("injected failure: {point:?}")))
            }
            None => Ok(()),
        }
    }

    async fn pause(&self) {
        match self.inner.latency {
            Some(latency) => tokio::time::sleep(latency).await,
            None => tokio::task::yield_now().await,
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get_object(&self, kind: ObjectKind, id: &ObjectId) -> Result<Option<Vec<u8>>> {
        self.pause().await;
        self.trip(&FailPoint::Get(kind))?;
        Ok(self.object(kind, id))
    }

    async fn put_object(&self, kind: ObjectKind, id: &ObjectId, data: &[u8]) -> Result<()> {
        self.pause().await;
        self.trip(&FailPoint::Put(kind))?;
        self.lock().apply(PendingOp::Put {
            kind,
            id: id.clone(),
            data: data.to_vec(),
        });
        Ok(())
    }

    async fn delete_object(&self, kind: ObjectKind, id: &ObjectId) -> Result<bool> {
        self.pause().await;
        Ok(self.lock().remove_object(kind, id))
    }

    async fn object_exists(&self, kind: ObjectKind, id: &ObjectId) -> Result<bool> {
        self.pause().await;
        self.trip(&FailPoint::Exists(kind))?;
        Ok(self.lock().objects.contains_key(&(kind, id.clone())))
    }

    fn stream_assocs(&self, ty: AssocType, src: u64, shard: Shard) -> AssocStream<'_> {
        let store = self.clone();
        stream::once(async move {
            store.pause().await;
            store.trip(&FailPoint::StreamAssocs)?;
            let targets: Vec<Result<u64>> = store
                .assoc_targets(ty, src)
                .into_iter()
                .filter(|target| shard.owns(*target))
                .map(Ok)
                .collect();
            Ok::<_, MetronomeError>(stream::iter(targets))
        })
        .try_flatten()
        .boxed()
    }

    fn stream_blocks(&self, collection: &str, states: &[BlockState]) -> BlockStream<'_> {
        let store = self.clone();
        let collection = collection.to_string();
        let states = states.to_vec();
        stream::once(async move {
            store.pause().await;
            store.trip(&FailPoint::StreamBlocks)?;
            let blocks: Vec<Result<CommandBlock>> = store
                .lock()
                .blocks
                .iter()
                .filter(|(key, stored)| {
                    key.collection == collection && states.contains(&stored.state)
                })
                .map(|(key, stored)| {
                    Ok(CommandBlock {
                        key: key.clone(),
                        id: stored.id.clone(),
                        payload: stored.payload.clone(),
                        state: stored.state,
                    })
                })
                .collect();
            Ok::<_, MetronomeError>(stream::iter(blocks))
        })
        .try_flatten()
        .boxed()
    }

    async fn mark_block(&self, block: &BlockRef, state: BlockState) -> Result<()> {
        self.pause().await;
        self.trip(&FailPoint::MarkBlock)?;
        let mut guard = self.lock();
        if !guard.blocks.contains_key(block) {
            return Err(MetronomeError::NotFound {
                kind: "block".into(),
                id: format!("{}/{}", block.collection, block.seq),
            });
        }
        guard.apply(PendingOp::Mark {
            block: block.clone(),
            state,
        });
        Ok(())
    }

    async fn begin_read_write(&self) -> Result<Box<dyn Transaction>> {
        self.pause().await;
        self.trip(&FailPoint::Begin)?;
        Ok(Box::new(MemoryTransaction {
            store: self.clone(),
            buffer: WriteBuffer::default(),
        }))
    }
}

// ---------------------------------------------------------------------------
// MemoryTransaction
// ---------------------------------------------------------------------------

struct MemoryTransaction {
    store: MemoryStore,
    buffer: WriteBuffer,
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn insert_object(&mut self, kind: ObjectKind, data: Vec<u8>) -> Result<u64> {
        self.store.pause().await;
        // Ids are reserved eagerly; a rollback leaves a gap.
        let id = {
            let mut state = self.store.lock();
            state.next_object_id += 1;
            state.next_object_id
        };
        self.buffer.push(PendingOp::Put {
            kind,
            id: ObjectId::Seq(id),
            data,
        });
        Ok(id)
    }

    async fn put_object(&mut self, kind: ObjectKind, id: ObjectId, data: Vec<u8>) -> Result<()> {
        self.buffer.push(PendingOp::Put { kind, id, data });
        Ok(())
    }

    async fn create_object(
        &mut self,
        kind: ObjectKind,
        id: ObjectId,
        data: Vec<u8>,
    ) -> Result<()> {
        self.buffer.push(PendingOp::Create { kind, id, data });
        Ok(())
    }

    async fn create_assoc(&mut self, src: u64, target: u64, ty: AssocType) -> Result<()> {
        self.buffer.push(PendingOp::Assoc { src, target, ty });
        Ok(())
    }

    async fn delete_object(&mut self, kind: ObjectKind, id: &ObjectId) -> Result<bool> {
        let visible = match self.buffer.visibility(kind, id) {
            Some(visible) => visible,
            None => {
                self.store.pause().await;
                self.store.lock().objects.contains_key(&(kind, id.clone()))
            }
        };
        if visible {
            self.buffer.push(PendingOp::Delete {
                kind,
                id: id.clone(),
            });
        }
        Ok(visible)
    }

    async fn mark(&mut self, block: &BlockRef, state: BlockState) -> Result<()> {
        self.buffer.push(PendingOp::Mark {
            block: block.clone(),
            state,
        });
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTransaction { store, buffer } = *self;
        store.pause().await;
        store.trip(&FailPoint::Commit)?;

        let ops = buffer.into_ops();
        let mut state = store.lock();

        let mut created = BTreeSet::new();
        for op in &ops {
            match op {
                PendingOp::Create { kind, id, .. } => {
                    let key = (*kind, id.clone());
                    if state.objects.contains_key(&key) || !created.insert(key) {
                        return Err(MetronomeError::Conflict(format!(
                            "{kind} {id} already exists"
                        )));
                    }
                }
                PendingOp::Mark { block, .. } if !state.blocks.contains_key(block) => {
                    return Err(MetronomeError::NotFound {
                        kind: "block".into(),
                        id: format!("{}/{}", block.collection, block.seq),
                    });
                }
                _ => {}
            }
        }

        for op in ops {
            state.apply(op);
        }
        state.stats.commits += 1;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.store.lock().stats.rollbacks += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn committed_effects_become_visible() {
        let store = MemoryStore::new();
        let mut tx = store.begin_read_write().await.unwrap();
        let id = tx.insert_object(ObjectKind::Task, vec![1, 2]).await.unwrap();
        tx.create_assoc(0, id, AssocType::ScheduledTask).await.unwrap();

        assert!(store.object(ObjectKind::Task, &ObjectId::Seq(id)).is_none());
        tx.commit().await.unwrap();

        assert_eq!(
            store.object(ObjectKind::Task, &ObjectId::Seq(id)),
            Some(vec![1, 2])
        );
        assert_eq!(store.assoc_targets(AssocType::ScheduledTask, 0), vec![id]);
    }

    #[tokio::test]
    async fn rollback_discards_everything() {
        let store = MemoryStore::new();
        let mut tx = store.begin_read_write().await.unwrap();
        let id = tx.insert_object(ObjectKind::Task, vec![1]).await.unwrap();
        tx.create_assoc(0, id, AssocType::ScheduledTask).await.unwrap();
        tx.rollback().await.unwrap();

        assert!(store.objects_of(ObjectKind::Task).is_empty());
        assert!(store.assoc_targets(AssocType::ScheduledTask, 0).is_empty());
        assert_eq!(store.stats().rollbacks, 1);
    }

    #[tokio::test]
    async fn deleting_a_task_cascades_to_associations() {
        let store = MemoryStore::new();
        let mut tx = store.begin_read_write().await.unwrap();
        let id = tx.insert_object(ObjectKind::Task, vec![]).await.unwrap();
        tx.create_assoc(0, id, AssocType::ScheduledTask).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin_read_write().await.unwrap();
        assert!(tx
            .delete_object(ObjectKind::Task, &ObjectId::Seq(id))
            .await
            .unwrap());
        tx.commit().await.unwrap();

        assert!(store.assoc_targets(AssocType::ScheduledTask, 0).is_empty());
    }

    #[tokio::test]
    async fn create_conflicts_with_existing_object() {
        let store = MemoryStore::new();
        let marker = ObjectId::Named("c1".into());
        store
            .put_object(ObjectKind::ProcessedCommand, &marker, &[0])
            .await
            .unwrap();

        let mut tx = store.begin_read_write().await.unwrap();
        tx.create_object(ObjectKind::ProcessedCommand, marker, vec![1])
            .await
            .unwrap();
        let err = tx.commit().await.unwrap_err();
        assert!(matches!(err, MetronomeError::Conflict(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn stream_blocks_filters_by_collection_and_state() {
        let store = MemoryStore::new();
        let open = store.append_block("commands", Some("a"), vec![]);
        let done = store.append_block("commands", Some("b"), vec![]);
        store.append_block("other", Some("c"), vec![]);
        store
            .mark_block(&done, BlockState::Processed)
            .await
            .unwrap();

        let blocks: Vec<CommandBlock> = store
            .stream_blocks("commands", &BlockState::OPEN)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].key, open);
    }

    #[tokio::test]
    async fn fail_points_fire_once() {
        let store = MemoryStore::new();
        store.fail_once(FailPoint::Get(ObjectKind::Clock));
        let id = ObjectId::Seq(1);
        assert!(store.get_object(ObjectKind::Clock, &id).await.is_err());
        assert!(store.get_object(ObjectKind::Clock, &id).await.is_ok());
    }
}
