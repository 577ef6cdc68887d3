//! Persistent store backed by redb.
//!
//! # Table design
//!
//! ```text
//! objects           [ kind: u8 | id key bytes ]                 -> record bytes
//! assocs            [ type: u8 | src: u64 BE | target: u64 BE ] -> ()
//! assocs_by_target  [ target: u64 BE | type: u8 | src: u64 BE ] -> ()
//! blocks            [ collection bytes | 0x00 | seq: u64 BE ]   -> JSON BlockRow
//! sequences         name                                        -> last issued u64
//! outbox            seq                                         -> JSON OutboxMessage
//! ```
//!
//! Big-endian integers keep byte order equal to numeric order, so a prefix
//! range scan over `assocs` yields the targets of one source in id order.
//! The reverse index lets a task delete find and drop its edges.
//!
//! redb is synchronous; every call runs on the blocking pool.

use std::collections::VecDeque;
use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};

use super::{AssocStream, BlockStream, ObjectStore, PendingOp, Transaction, WriteBuffer};
use crate::error::{MetronomeError, Result};
use crate::messaging::Messenger;
use crate::model::{AssocType, BlockRef, BlockState, CommandBlock, ObjectId, ObjectKind, Shard};

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

const OBJECTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("objects");
const ASSOCS: TableDefinition<&[u8], ()> = TableDefinition::new("assocs");
const ASSOCS_BY_TARGET: TableDefinition<&[u8], ()> = TableDefinition::new("assocs_by_target");
const BLOCKS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("blocks");
const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");
const OUTBOX: TableDefinition<u64, &[u8]> = TableDefinition::new("outbox");

const OBJECT_SEQ: &str = "object";
const BLOCK_SEQ: &str = "block";
const OUTBOX_SEQ: &str = "outbox";

/// Raw keys scanned per stream page.
const PAGE_SIZE: usize = 256;

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BlockRow {
    id: Option<String>,
    payload: Vec<u8>,
    state: BlockState,
    submitted_at: DateTime<Utc>,
}

/// A message handed to the transport collaborator through the outbox table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub seq: u64,
    pub owner: u64,
    pub channel: u64,
    pub payload: Vec<u8>,
    pub enqueued_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Key helpers
// ---------------------------------------------------------------------------

fn db_err(e: impl std::fmt::Display) -> MetronomeError {
    MetronomeError::Store(e.to_string())
}

fn object_key(kind: ObjectKind, id: &ObjectId) -> Vec<u8> {
    let mut key = vec![kind.code()];
    key.extend_from_slice(&id.to_key_bytes());
    key
}

fn assoc_prefix(ty: AssocType, src: u64) -> [u8; 9] {
    let mut key = [0u8; 9];
    key[0] = ty.code();
    key[1..].copy_from_slice(&src.to_be_bytes());
    key
}

fn assoc_key(ty: AssocType, src: u64, target: u64) -> [u8; 17] {
    let mut key = [0u8; 17];
    key[..9].copy_from_slice(&assoc_prefix(ty, src));
    key[9..].copy_from_slice(&target.to_be_bytes());
    key
}

fn target_key(target: u64, ty: AssocType, src: u64) -> [u8; 17] {
    let mut key = [0u8; 17];
    key[..8].copy_from_slice(&target.to_be_bytes());
    key[8] = ty.code();
    key[9..].copy_from_slice(&src.to_be_bytes());
    key
}

fn block_prefix(collection: &str) -> Vec<u8> {
    let mut key = collection.as_bytes().to_vec();
    key.push(0);
    key
}

fn block_key(block: &BlockRef) -> Vec<u8> {
    let mut key = block_prefix(&block.collection);
    key.extend_from_slice(&block.seq.to_be_bytes());
    key
}

fn read_u64(bytes: &[u8]) -> Result<u64> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| db_err("malformed key: expected 8 trailing bytes"))?;
    Ok(u64::from_be_bytes(raw))
}

fn check_collection(collection: &str) -> Result<()> {
    if collection.is_empty() || collection.contains('\0') {
        return Err(MetronomeError::Validation(format!(
            "invalid collection name {collection:?}"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Write helpers (run inside an open write transaction)
// ---------------------------------------------------------------------------

fn next_seq(wt: &WriteTransaction, name: &str) -> Result<u64> {
    let mut seqs = wt.open_table(SEQUENCES).map_err(db_err)?;
    let next = seqs.get(name).map_err(db_err)?.map(|v| v.value()).unwrap_or(0) + 1;
    seqs.insert(name, next).map_err(db_err)?;
    Ok(next)
}

fn object_present(wt: &WriteTransaction, key: &[u8]) -> Result<bool> {
    let objects = wt.open_table(OBJECTS).map_err(db_err)?;
    let present = objects.get(key).map_err(db_err)?.is_some();
    Ok(present)
}

fn insert_assoc(wt: &WriteTransaction, src: u64, target: u64, ty: AssocType) -> Result<()> {
    let mut assocs = wt.open_table(ASSOCS).map_err(db_err)?;
    assocs
        .insert(assoc_key(ty, src, target).as_slice(), ())
        .map_err(db_err)?;
    let mut by_target = wt.open_table(ASSOCS_BY_TARGET).map_err(db_err)?;
    by_target
        .insert(target_key(target, ty, src).as_slice(), ())
        .map_err(db_err)?;
    Ok(())
}

/// Drop every association whose source or target is `id`.
fn remove_assocs_touching(wt: &WriteTransaction, id: u64) -> Result<()> {
    let mut edges: Vec<(AssocType, u64, u64)> = Vec::new();

    {
        let by_target = wt.open_table(ASSOCS_BY_TARGET).map_err(db_err)?;
        let prefix = id.to_be_bytes();
        for entry in by_target.range::<&[u8]>(prefix.as_slice()..).map_err(db_err)? {
            let (k, _) = entry.map_err(db_err)?;
            let key = k.value();
            if !key.starts_with(&prefix) {
                break;
            }
            if key[8] == AssocType::ScheduledTask.code() {
                edges.push((AssocType::ScheduledTask, read_u64(&key[9..])?, id));
            }
        }
    }

    {
        let assocs = wt.open_table(ASSOCS).map_err(db_err)?;
        for ty in [AssocType::ScheduledTask] {
            let prefix = assoc_prefix(ty, id);
            for entry in assocs.range::<&[u8]>(prefix.as_slice()..).map_err(db_err)? {
                let (k, _) = entry.map_err(db_err)?;
                let key = k.value();
                if !key.starts_with(&prefix) {
                    break;
                }
                edges.push((ty, id, read_u64(&key[9..])?));
            }
        }
    }

    let mut assocs = wt.open_table(ASSOCS).map_err(db_err)?;
    let mut by_target = wt.open_table(ASSOCS_BY_TARGET).map_err(db_err)?;
    for (ty, src, target) in edges {
        assocs
            .remove(assoc_key(ty, src, target).as_slice())
            .map_err(db_err)?;
        by_target
            .remove(target_key(target, ty, src).as_slice())
            .map_err(db_err)?;
    }
    Ok(())
}

fn remove_object(wt: &WriteTransaction, kind: ObjectKind, id: &ObjectId) -> Result<bool> {
    let mut objects = wt.open_table(OBJECTS).map_err(db_err)?;
    let removed = objects
        .remove(object_key(kind, id).as_slice())
        .map_err(db_err)?
        .is_some();
    drop(objects);
    if removed && kind == ObjectKind::Task {
        if let Some(task_id) = id.as_seq() {
            remove_assocs_touching(wt, task_id)?;
        }
    }
    Ok(removed)
}

fn set_block_state(wt: &WriteTransaction, block: &BlockRef, state: BlockState) -> Result<()> {
    let key = block_key(block);
    let mut blocks = wt.open_table(BLOCKS).map_err(db_err)?;
    let mut row: BlockRow = match blocks.get(key.as_slice()).map_err(db_err)? {
        Some(current) => serde_json::from_slice(current.value())?,
        None => {
            return Err(MetronomeError::NotFound {
                kind: "block".into(),
                id: format!("{}/{}", block.collection, block.seq),
            })
        }
    };
    row.state = state;
    let value = serde_json::to_vec(&row)?;
    blocks
        .insert(key.as_slice(), value.as_slice())
        .map_err(db_err)?;
    Ok(())
}

fn apply_op(wt: &WriteTransaction, op: PendingOp) -> Result<()> {
    match op {
        PendingOp::Put { kind, id, data } => {
            let mut objects = wt.open_table(OBJECTS).map_err(db_err)?;
            objects
                .insert(object_key(kind, &id).as_slice(), data.as_slice())
                .map_err(db_err)?;
        }
        PendingOp::Create { kind, id, data } => {
            let key = object_key(kind, &id);
            if object_present(wt, &key)? {
                return Err(MetronomeError::Conflict(format!("{kind} {id} already exists")));
            }
            let mut objects = wt.open_table(OBJECTS).map_err(db_err)?;
            objects
                .insert(key.as_slice(), data.as_slice())
                .map_err(db_err)?;
        }
        PendingOp::Assoc { src, target, ty } => insert_assoc(wt, src, target, ty)?,
        PendingOp::Delete { kind, id } => {
            remove_object(wt, kind, &id)?;
        }
        PendingOp::Mark { block, state } => set_block_state(wt, &block, state)?,
    }
    Ok(())
}

/// Run `f` against a write transaction; commit on success, abort otherwise.
fn with_write<T>(db: &Database, f: impl FnOnce(&WriteTransaction) -> Result<T>) -> Result<T> {
    let wt = db.begin_write().map_err(db_err)?;
    match f(&wt) {
        Ok(value) => {
            wt.commit().map_err(db_err)?;
            Ok(value)
        }
        Err(e) => {
            wt.abort().map_err(db_err)?;
            Err(e)
        }
    }
}

async fn run_blocking<T, F>(db: Arc<Database>, f: F) -> Result<T>
where
    F: FnOnce(&Database) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || f(&db))
        .await
        .map_err(|e| MetronomeError::Store(format!("blocking store task failed: {e}")))?
}

// ---------------------------------------------------------------------------
// Paged streams
// ---------------------------------------------------------------------------

struct Page<T> {
    items: Vec<T>,
    /// Last scanned key when more keys may follow; `None` once exhausted.
    resume_after: Option<Vec<u8>>,
}

struct Cursor<T> {
    pending: VecDeque<T>,
    after: Option<Vec<u8>>,
    exhausted: bool,
}

/// Scan up to `PAGE_SIZE` keys under `prefix`, starting after `after`.
fn scan_page<T>(
    table: &impl ReadableTable<&'static [u8], ()>,
    prefix: &[u8],
    after: Option<&[u8]>,
    mut keep: impl FnMut(&[u8]) -> Result<Option<T>>,
) -> Result<Page<T>> {
    let lower = match after {
        Some(key) => Bound::Excluded(key),
        None => Bound::Included(prefix),
    };
    let mut items = Vec::new();
    let mut last = None;
    let mut more = false;
    for (scanned, entry) in table
        .range::<&[u8]>((lower, Bound::Unbounded))
        .map_err(db_err)?
        .enumerate()
    {
        let (k, _) = entry.map_err(db_err)?;
        let key = k.value();
        if !key.starts_with(prefix) {
            break;
        }
        if scanned == PAGE_SIZE {
            more = true;
            break;
        }
        last = Some(key.to_vec());
        if let Some(item) = keep(key)? {
            items.push(item);
        }
    }
    Ok(Page {
        items,
        resume_after: if more { last } else { None },
    })
}

fn paged<T, F>(db: Arc<Database>, fetch: F) -> stream::BoxStream<'static, Result<T>>
where
    T: Send + 'static,
    F: Fn(&Database, Option<&[u8]>) -> Result<Page<T>> + Clone + Send + Sync + 'static,
{
    let start = Cursor {
        pending: VecDeque::new(),
        after: None,
        exhausted: false,
    };
    stream::try_unfold(start, move |mut cursor| {
        let db = Arc::clone(&db);
        let fetch = fetch.clone();
        async move {
            loop {
                if let Some(item) = cursor.pending.pop_front() {
                    return Ok(Some((item, cursor)));
                }
                if cursor.exhausted {
                    return Ok(None);
                }
                let after = cursor.after.take();
                let fetch = fetch.clone();
                let page = run_blocking(Arc::clone(&db), move |db| fetch(db, after.as_deref()))
                    .await?;
                cursor.exhausted = page.resume_after.is_none();
                cursor.after = page.resume_after;
                cursor.pending.extend(page.items);
            }
        }
    })
    .boxed()
}

// ---------------------------------------------------------------------------
// RedbStore
// ---------------------------------------------------------------------------

/// Embedded store implementing the scheduler's store and messaging contracts.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open or create the database at `path`, creating every table.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path).map_err(db_err)?;
        let wt = db.begin_write().map_err(db_err)?;
        wt.open_table(OBJECTS).map_err(db_err)?;
        wt.open_table(ASSOCS).map_err(db_err)?;
        wt.open_table(ASSOCS_BY_TARGET).map_err(db_err)?;
        wt.open_table(BLOCKS).map_err(db_err)?;
        wt.open_table(SEQUENCES).map_err(db_err)?;
        wt.open_table(OUTBOX).map_err(db_err)?;
        wt.commit().map_err(db_err)?;
        Ok(Self { db: Arc::new(db) })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        run_blocking(Arc::clone(&self.db), f).await
    }

    /// Append an `Unprocessed` block to `collection`.
    pub async fn append_block(
        &self,
        collection: &str,
        id: Option<&str>,
        payload: Vec<u8>,
    ) -> Result<BlockRef> {
        check_collection(collection)?;
        let collection = collection.to_string();
        let row = BlockRow {
            id: id.map(str::to_string),
            payload,
            state: BlockState::Unprocessed,
            submitted_at: Utc::now(),
        };
        self.blocking(move |db| {
            with_write(db, |wt| {
                let block = BlockRef {
                    collection,
                    seq: next_seq(wt, BLOCK_SEQ)?,
                };
                let value = serde_json::to_vec(&row)?;
                let mut blocks = wt.open_table(BLOCKS).map_err(db_err)?;
                blocks
                    .insert(block_key(&block).as_slice(), value.as_slice())
                    .map_err(db_err)?;
                Ok(block)
            })
        })
        .await
    }

    /// Every block of `collection` in submission order.
    pub async fn list_blocks(&self, collection: &str) -> Result<Vec<CommandBlock>> {
        let states = [
            BlockState::Unprocessed,
            BlockState::Processed,
            BlockState::Error,
        ];
        futures::TryStreamExt::try_collect(self.stream_blocks(collection, &states)).await
    }

    /// Every object of `kind` in key order.
    pub async fn list_objects(&self, kind: ObjectKind) -> Result<Vec<(ObjectId, Vec<u8>)>> {
        self.blocking(move |db| {
            let rt = db.begin_read().map_err(db_err)?;
            let objects = rt.open_table(OBJECTS).map_err(db_err)?;
            let prefix = [kind.code()];
            let mut result = Vec::new();
            for entry in objects.range::<&[u8]>(prefix.as_slice()..).map_err(db_err)? {
                let (k, v) = entry.map_err(db_err)?;
                let key = k.value();
                if !key.starts_with(&prefix) {
                    break;
                }
                let id = ObjectId::from_key_bytes(&key[1..])
                    .ok_or_else(|| db_err("malformed object key"))?;
                result.push((id, v.value().to_vec()));
            }
            Ok(result)
        })
        .await
    }

    /// Pending outbox messages, oldest first.
    pub async fn outbox(&self) -> Result<Vec<OutboxMessage>> {
        self.blocking(|db| {
            let rt = db.begin_read().map_err(db_err)?;
            let outbox = rt.open_table(OUTBOX).map_err(db_err)?;
            let mut result = Vec::new();
            for entry in outbox.iter().map_err(db_err)? {
                let (_, v) = entry.map_err(db_err)?;
                result.push(serde_json::from_slice(v.value())?);
            }
            Ok(result)
        })
        .await
    }

    /// Remove and return every pending outbox message.
    pub async fn drain_outbox(&self) -> Result<Vec<OutboxMessage>> {
        self.blocking(|db| {
            with_write(db, |wt| {
                let mut outbox = wt.open_table(OUTBOX).map_err(db_err)?;
                let mut drained: Vec<OutboxMessage> = Vec::new();
                for entry in outbox.iter().map_err(db_err)? {
                    let (_, v) = entry.map_err(db_err)?;
                    drained.push(serde_json::from_slice(v.value())?);
                }
                for message in &drained {
                    outbox.remove(message.seq).map_err(db_err)?;
                }
                Ok(drained)
            })
        })
        .await
    }
}

#[async_trait]
impl ObjectStore for RedbStore {
    async fn get_object(&self, kind: ObjectKind, id: &ObjectId) -> Result<Option<Vec<u8>>> {
        let key = object_key(kind, id);
        self.blocking(move |db| {
            let rt = db.begin_read().map_err(db_err)?;
            let objects = rt.open_table(OBJECTS).map_err(db_err)?;
            let value = objects
                .get(key.as_slice())
                .map_err(db_err)?
                .map(|v| v.value().to_vec());
            Ok(value)
        })
        .await
    }

    async fn put_object(&self, kind: ObjectKind, id: &ObjectId, data: &[u8]) -> Result<()> {
        let op = PendingOp::Put {
            kind,
            id: id.clone(),
            data: data.to_vec(),
        };
        self.blocking(move |db| with_write(db, |wt| apply_op(wt, op)))
            .await
    }

    async fn delete_object(&self, kind: ObjectKind, id: &ObjectId) -> Result<bool> {
        let id = id.clone();
        self.blocking(move |db| with_write(db, |wt| remove_object(wt, kind, &id)))
            .await
    }

    async fn object_exists(&self, kind: ObjectKind, id: &ObjectId) -> Result<bool> {
        Ok(self.get_object(kind, id).await?.is_some())
    }

    fn stream_assocs(&self, ty: AssocType, src: u64, shard: Shard) -> AssocStream<'_> {
        let prefix = assoc_prefix(ty, src);
        paged(Arc::clone(&self.db), move |db, after| {
            let rt = db.begin_read().map_err(db_err)?;
            let assocs = rt.open_table(ASSOCS).map_err(db_err)?;
            scan_page(&assocs, &prefix, after, |key| {
                let target = read_u64(&key[prefix.len()..])?;
                Ok(shard.owns(target).then_some(target))
            })
        })
    }

    fn stream_blocks(&self, collection: &str, states: &[BlockState]) -> BlockStream<'_> {
        if let Err(e) = check_collection(collection) {
            return stream::once(async move { Err(e) }).boxed();
        }
        let collection = collection.to_string();
        let prefix = block_prefix(&collection);
        let states = states.to_vec();
        paged(Arc::clone(&self.db), move |db, after| {
            let rt = db.begin_read().map_err(db_err)?;
            let blocks = rt.open_table(BLOCKS).map_err(db_err)?;
            let lower = match after {
                Some(key) => Bound::Excluded(key),
                None => Bound::Included(prefix.as_slice()),
            };
            let mut items = Vec::new();
            let mut last = None;
            let mut more = false;
            for (scanned, entry) in blocks
                .range::<&[u8]>((lower, Bound::Unbounded))
                .map_err(db_err)?
                .enumerate()
            {
                let (k, v) = entry.map_err(db_err)?;
                let key = k.value();
                if !key.starts_with(&prefix) {
                    break;
                }
                if scanned == PAGE_SIZE {
                    more = true;
                    break;
                }
                last = Some(key.to_vec());
                let row: BlockRow = serde_json::from_slice(v.value())?;
                if states.contains(&row.state) {
                    items.push(CommandBlock {
                        key: BlockRef {
                            collection: collection.clone(),
                            seq: read_u64(&key[prefix.len()..])?,
                        },
                        id: row.id,
                        payload: row.payload,
                        state: row.state,
                    });
                }
            }
            Ok(Page {
                items,
                resume_after: if more { last } else { None },
            })
        })
    }

    async fn mark_block(&self, block: &BlockRef, state: BlockState) -> Result<()> {
        let block = block.clone();
        self.blocking(move |db| with_write(db, |wt| set_block_state(wt, &block, state)))
            .await
    }

    async fn begin_read_write(&self) -> Result<Box<dyn Transaction>> {
        Ok(Box::new(RedbTransaction {
            db: Arc::clone(&self.db),
            buffer: WriteBuffer::default(),
        }))
    }
}

#[async_trait]
impl Messenger for RedbStore {
    async fn push_message(&self, owner: u64, channel: u64, payload: Vec<u8>) -> Result<()> {
        self.blocking(move |db| {
            with_write(db, |wt| {
                let message = OutboxMessage {
                    seq: next_seq(wt, OUTBOX_SEQ)?,
                    owner,
                    channel,
                    payload,
                    enqueued_at: Utc::now(),
                };
                let value = serde_json::to_vec(&message)?;
                let mut outbox = wt.open_table(OUTBOX).map_err(db_err)?;
                outbox
                    .insert(message.seq, value.as_slice())
                    .map_err(db_err)?;
                Ok(())
            })
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// RedbTransaction
// ---------------------------------------------------------------------------

/// Buffers effects in memory and applies them in one redb write transaction.
struct RedbTransaction {
    db: Arc<Database>,
    buffer: WriteBuffer,
}

#[async_trait]
impl Transaction for RedbTransaction {
    async fn insert_object(&mut self, kind: ObjectKind, data: Vec<u8>) -> Result<u64> {
        // Ids come from their own short write so the association can name the
        // task before commit; a rollback leaves a gap in the sequence.
        let id = run_blocking(Arc::clone(&self.db), |db| {
            with_write(db, |wt| next_seq(wt, OBJECT_SEQ))
        })
        .await?;
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
                let key = object_key(kind, id);
                run_blocking(Arc::clone(&self.db), move |db| {
                    let rt = db.begin_read().map_err(db_err)?;
                    let objects = rt.open_table(OBJECTS).map_err(db_err)?;
                    let present = objects.get(key.as_slice()).map_err(db_err)?.is_some();
                    Ok(present)
                })
                .await?
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
        let RedbTransaction { db, buffer } = *self;
        let ops = buffer.into_ops();
        run_blocking(db, move |db| {
            with_write(db, |wt| ops.into_iter().try_for_each(|op| apply_op(wt, op)))
        })
        .await
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        // Nothing reached the database; dropping the buffer discards it.
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use tempfile::TempDir;

    fn open_tmp() -> (TempDir, RedbStore) {
        let dir = TempDir::new().unwrap();
        let store = RedbStore::open(&dir.path().join("test.redb")).unwrap();
        (dir, store)
    }

    async fn schedule(store: &RedbStore, data: Vec<u8>) -> u64 {
        let mut tx = store.begin_read_write().await.unwrap();
        let id = tx.insert_object(ObjectKind::Task, data).await.unwrap();
        tx.create_assoc(0, id, AssocType::ScheduledTask).await.unwrap();
        tx.commit().await.unwrap();
        id
    }

    async fn targets(store: &RedbStore, shard: Shard) -> Vec<u64> {
        store
            .stream_assocs(AssocType::ScheduledTask, 0, shard)
            .try_collect()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn put_get_and_exists() {
        let (_dir, store) = open_tmp();
        let id = ObjectId::Seq(1);
        assert_eq!(store.get_object(ObjectKind::Clock, &id).await.unwrap(), None);
        store.put_object(ObjectKind::Clock, &id, &[9]).await.unwrap();
        assert_eq!(
            store.get_object(ObjectKind::Clock, &id).await.unwrap(),
            Some(vec![9])
        );
        assert!(store.object_exists(ObjectKind::Clock, &id).await.unwrap());
        assert!(!store.object_exists(ObjectKind::Task, &id).await.unwrap());
    }

    #[tokio::test]
    async fn committed_transaction_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.redb");
        let id = {
            let store = RedbStore::open(&path).unwrap();
            schedule(&store, vec![1, 2, 3]).await
        };

        let store = RedbStore::open(&path).unwrap();
        assert_eq!(
            store
                .get_object(ObjectKind::Task, &ObjectId::Seq(id))
                .await
                .unwrap(),
            Some(vec![1, 2, 3])
        );
        assert_eq!(targets(&store, Shard::default()).await, vec![id]);
    }

    #[tokio::test]
    async fn rollback_leaves_no_trace() {
        let (_dir, store) = open_tmp();
        let mut tx = store.begin_read_write().await.unwrap();
        let id = tx.insert_object(ObjectKind::Task, vec![1]).await.unwrap();
        tx.create_assoc(0, id, AssocType::ScheduledTask).await.unwrap();
        tx.rollback().await.unwrap();

        assert!(store.list_objects(ObjectKind::Task).await.unwrap().is_empty());
        assert!(targets(&store, Shard::default()).await.is_empty());
    }

    #[tokio::test]
    async fn failed_commit_applies_nothing() {
        let (_dir, store) = open_tmp();
        let marker = ObjectId::Named("c1".into());
        store
            .put_object(ObjectKind::ProcessedCommand, &marker, &[0])
            .await
            .unwrap();

        let mut tx = store.begin_read_write().await.unwrap();
        let id = tx.insert_object(ObjectKind::Task, vec![1]).await.unwrap();
        tx.create_assoc(0, id, AssocType::ScheduledTask).await.unwrap();
        tx.create_object(ObjectKind::ProcessedCommand, marker, vec![1])
            .await
            .unwrap();
        let err = tx.commit().await.unwrap_err();

        assert!(matches!(err, MetronomeError::Conflict(_)), "got {err:?}");
        assert!(store.list_objects(ObjectKind::Task).await.unwrap().is_empty());
        assert!(targets(&store, Shard::default()).await.is_empty());
    }

    #[tokio::test]
    async fn deleting_a_task_removes_its_associations() {
        let (_dir, store) = open_tmp();
        let keep = schedule(&store, vec![]).await;
        let gone = schedule(&store, vec![]).await;

        let mut tx = store.begin_read_write().await.unwrap();
        assert!(tx
            .delete_object(ObjectKind::Task, &ObjectId::Seq(gone))
            .await
            .unwrap());
        tx.commit().await.unwrap();

        assert_eq!(targets(&store, Shard::default()).await, vec![keep]);
    }

    #[tokio::test]
    async fn delete_of_missing_object_is_not_visible() {
        let (_dir, store) = open_tmp();
        let mut tx = store.begin_read_write().await.unwrap();
        assert!(!tx
            .delete_object(ObjectKind::Task, &ObjectId::Seq(42))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn shard_streams_are_disjoint_and_complete() {
        let (_dir, store) = open_tmp();
        let mut all = Vec::new();
        for _ in 0..7 {
            all.push(schedule(&store, vec![]).await);
        }

        let mut seen = Vec::new();
        for id in 0..3 {
            let part = targets(&store, Shard::new(id, 3)).await;
            assert!(part.iter().all(|t| t % 3 == u64::from(id)));
            seen.extend(part);
        }
        seen.sort_unstable();
        assert_eq!(seen, all);
    }

    #[tokio::test]
    async fn streams_page_through_large_sets() {
        let (_dir, store) = open_tmp();
        let mut tx = store.begin_read_write().await.unwrap();
        for target in 1..=(PAGE_SIZE as u64 * 2 + 5) {
            tx.create_assoc(0, target, AssocType::ScheduledTask)
                .await
                .unwrap();
        }
        tx.commit().await.unwrap();

        let found = targets(&store, Shard::default()).await;
        assert_eq!(found.len(), PAGE_SIZE * 2 + 5);
        assert!(found.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn blocks_stream_by_state_and_mark() {
        let (_dir, store) = open_tmp();
        let a = store
            .append_block("commands", Some("a"), vec![1])
            .await
            .unwrap();
        let b = store
            .append_block("commands", Some("b"), vec![2])
            .await
            .unwrap();
        store.append_block("other", None, vec![]).await.unwrap();

        store.mark_block(&a, BlockState::Processed).await.unwrap();

        let open: Vec<CommandBlock> = store
            .stream_blocks("commands", &BlockState::OPEN)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].key, b);
        assert_eq!(open[0].id.as_deref(), Some("b"));
        assert_eq!(open[0].payload, vec![2]);

        let all = store.list_blocks("commands").await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn marking_unknown_block_fails() {
        let (_dir, store) = open_tmp();
        let missing = BlockRef {
            collection: "commands".into(),
            seq: 99,
        };
        let err = store
            .mark_block(&missing, BlockState::Processed)
            .await
            .unwrap_err();
        assert!(matches!(err, MetronomeError::NotFound { .. }));
    }

    #[tokio::test]
    async fn outbox_collects_and_drains_messages() {
        let (_dir, store) = open_tmp();
        store.push_message(5, 2, vec![1]).await.unwrap();
        store.push_message(6, 3, vec![2]).await.unwrap();

        let pending = store.outbox().await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!((pending[0].owner, pending[0].channel), (5, 2));

        let drained = store.drain_outbox().await.unwrap();
        assert_eq!(drained, pending);
        assert!(store.outbox().await.unwrap().is_empty());
    }
}
