//! Store contract consumed by the scheduler.
//!
//! `ObjectStore` covers point reads and writes, the two candidate streams and
//! transaction creation. `Transaction` buffers every effect until `commit`,
//! which applies all of them or none.
//!
//! Two implementations ship with the crate: [`RedbStore`] persists to an
//! embedded redb database, [`MemoryStore`] keeps everything in process and
//! exposes fault injection for tests.

pub mod memory;
pub mod redb_store;

pub use self::memory::{FailPoint, MemoryStats, MemoryStore};
pub use self::redb_store::{OutboxMessage, RedbStore};

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::model::{AssocType, BlockRef, BlockState, CommandBlock, ObjectId, ObjectKind, Shard};

/// Lazy, single-pass sequence of association target ids.
pub type AssocStream<'a> = BoxStream<'a, Result<u64>>;

/// Lazy, single-pass sequence of command blocks.
pub type BlockStream<'a> = BoxStream<'a, Result<CommandBlock>>;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// `Ok(None)` when the object does not exist.
    async fn get_object(&self, kind: ObjectKind, id: &ObjectId) -> Result<Option<Vec<u8>>>;

    async fn put_object(&self, kind: ObjectKind, id: &ObjectId, data: &[u8]) -> Result<()>;

    /// Returns whether an object was removed. Deleting a task also removes
    /// every association that touches it.
    async fn delete_object(&self, kind: ObjectKind, id: &ObjectId) -> Result<bool>;

    async fn object_exists(&self, kind: ObjectKind, id: &ObjectId) -> Result<bool>;

    /// Targets of `ty` associations leaving `src` that belong to `shard`.
    fn stream_assocs(&self, ty: AssocType, src: u64, shard: Shard) -> AssocStream<'_>;

    /// Blocks of `collection` whose state is one of `states`.
    fn stream_blocks(&self, collection: &str, states: &[BlockState]) -> BlockStream<'_>;

    /// Set a block's state outside of any transaction.
    async fn mark_block(&self, block: &BlockRef, state: BlockState) -> Result<()>;

    async fn begin_read_write(&self) -> Result<Box<dyn Transaction>>;
}

#[async_trait]
pub trait Transaction: Send {
    /// Create an object under a store-assigned sequence id.
    async fn insert_object(&mut self, kind: ObjectKind, data: Vec<u8>) -> Result<u64>;

    /// Create or overwrite an object.
    async fn put_object(&mut self, kind: ObjectKind, id: ObjectId, data: Vec<u8>) -> Result<()>;

    /// Create an object that must not exist yet; the commit fails with a
    /// conflict otherwise.
    async fn create_object(&mut self, kind: ObjectKind, id: ObjectId, data: Vec<u8>)
        -> Result<()>;

    async fn create_assoc(&mut self, src: u64, target: u64, ty: AssocType) -> Result<()>;

    /// Returns whether the object is visible to this transaction.
    async fn delete_object(&mut self, kind: ObjectKind, id: &ObjectId) -> Result<bool>;

    async fn mark(&mut self, block: &BlockRef, state: BlockState) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

// ---------------------------------------------------------------------------
// WriteBuffer
// ---------------------------------------------------------------------------

/// One buffered transaction effect.
#[derive(Debug, Clone)]
pub(crate) enum PendingOp {
    Put {
        kind: ObjectKind,
        id: ObjectId,
        data: Vec<u8>,
    },
    Create {
        kind: ObjectKind,
        id: ObjectId,
        data: Vec<u8>,
    },
    Assoc {
        src: u64,
        target: u64,
        ty: AssocType,
    },
    Delete {
        kind: ObjectKind,
        id: ObjectId,
    },
    Mark {
        block: BlockRef,
        state: BlockState,
    },
}

/// Ordered effects of an open transaction, shared by both store backends.
#[derive(Debug, Default)]
pub(crate) struct WriteBuffer {
    ops: Vec<PendingOp>,
}

impl WriteBuffer {
    pub(crate) fn push(&mut self, op: PendingOp) {
        self.ops.push(op);
    }

    pub(crate) fn into_ops(self) -> Vec<PendingOp> {
        self.ops
    }

    /// Visibility of an object according to this buffer alone: `Some(true)`
    /// if the latest buffered effect writes it, `Some(false)` if it deletes
    /// it, `None` if the buffer never touched it.
    pub(crate) fn visibility(&self, kind: ObjectKind, id: &ObjectId) -> Option<bool> {
        self.ops.iter().rev().find_map(|op| match op {
            PendingOp::Put { kind: k, id: i, .. } | PendingOp::Create { kind: k, id: i, .. }
                if *k == kind && i == id =>
            {
                Some(true)
            }
            PendingOp::Delete { kind: k, id: i } if *k == kind && i == id => Some(false),
            _ => None,
        })
    }
}
