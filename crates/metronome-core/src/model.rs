//! Identifiers and record shapes shared by the store, the dispatchers and the CLI.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Source of every `ScheduledTask` association.
pub const TASK_ROOT: u64 = 0;

/// Fixed id of the singleton clock object.
pub const GLOBAL_CLOCK: u64 = 1;

/// Default collection the command dispatcher reads from.
pub const COMMAND_COLLECTION: &str = "commands";

// ---------------------------------------------------------------------------
// ObjectKind / ObjectId
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Task,
    Clock,
    ProcessedCommand,
    /// Last tick a follower shard evaluated its tasks at, keyed by shard id.
    FireCursor,
}

impl ObjectKind {
    pub fn code(self) -> u8 {
        match self {
            Self::Task => 1,
            Self::Clock => 2,
            Self::ProcessedCommand => 3,
            Self::FireCursor => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Task),
            2 => Some(Self::Clock),
            3 => Some(Self::ProcessedCommand),
            4 => Some(Self::FireCursor),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Clock => "clock",
            Self::ProcessedCommand => "processed_command",
            Self::FireCursor => "fire_cursor",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Object identifier. Tasks and the clock use store-assigned sequence
/// numbers; processed-command markers are keyed by the command id itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectId {
    Seq(u64),
    Named(String),
}

impl ObjectId {
    /// Order-preserving key encoding: a tag byte followed by the id.
    pub fn to_key_bytes(&self) -> Vec<u8> {
        match self {
            Self::Seq(n) => {
                let mut key = Vec::with_capacity(9);
                key.push(0);
                key.extend_from_slice(&n.to_be_bytes());
                key
            }
            Self::Named(name) => {
                let mut key = Vec::with_capacity(1 + name.len());
                key.push(1);
                key.extend_from_slice(name.as_bytes());
                key
            }
        }
    }

    pub fn from_key_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes.split_first()? {
            (0, rest) => {
                let raw: [u8; 8] = rest.try_into().ok()?;
                Some(Self::Seq(u64::from_be_bytes(raw)))
            }
            (1, rest) => String::from_utf8(rest.to_vec()).ok().map(Self::Named),
            _ => None,
        }
    }

    pub fn as_seq(&self) -> Option<u64> {
        match self {
            Self::Seq(n) => Some(*n),
            Self::Named(_) => None,
        }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Seq(n) => write!(f, "{n}"),
            Self::Named(name) => f.write_str(name),
        }
    }
}

// ---------------------------------------------------------------------------
// Associations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssocType {
    ScheduledTask,
}

impl AssocType {
    pub fn code(self) -> u8 {
        match self {
            Self::ScheduledTask => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ScheduledTask => "scheduled_task",
        }
    }
}

// ---------------------------------------------------------------------------
// Shard
// ---------------------------------------------------------------------------

/// A disjoint slice `(id, count)` of the workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    #[serde(default)]
    pub id: u32,
    #[serde(default = "default_shard_count")]
    pub count: u32,
}

fn default_shard_count() -> u32 {
    1
}

impl Default for Shard {
    fn default() -> Self {
        Self {
            id: 0,
            count: default_shard_count(),
        }
    }
}

impl Shard {
    pub fn new(id: u32, count: u32) -> Self {
        Self { id, count }
    }

    /// Deterministic modulo partition. A zero count owns nothing.
    pub fn owns(&self, target: u64) -> bool {
        self.count != 0 && target % u64::from(self.count) == u64::from(self.id)
    }
}

// ---------------------------------------------------------------------------
// Command blocks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockState {
    Unprocessed,
    Processed,
    Error,
}

impl BlockState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unprocessed => "unprocessed",
            Self::Processed => "processed",
            Self::Error => "error",
        }
    }

    /// States the command dispatcher still considers open.
    pub const OPEN: [BlockState; 2] = [BlockState::Unprocessed, BlockState::Error];
}

/// Store-side handle of a block, independent of its command id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockRef {
    pub collection: String,
    pub seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandBlock {
    pub key: BlockRef,
    pub id: Option<String>,
    pub payload: Vec<u8>,
    pub state: BlockState,
}

impl CommandBlock {
    /// The command id, treating an empty string as absent.
    pub fn command_id(&self) -> Option<&str> {
        self.id.as_deref().filter(|id| !id.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_id_key_bytes_round_trip() {
        for id in [
            ObjectId::Seq(0),
            ObjectId::Seq(u64::MAX),
            ObjectId::Named("c1".into()),
        ] {
            assert_eq!(ObjectId::from_key_bytes(&id.to_key_bytes()), Some(id));
        }
    }

    #[test]
    fn seq_keys_sort_numerically() {
        assert!(ObjectId::Seq(2).to_key_bytes() < ObjectId::Seq(256).to_key_bytes());
    }

    #[test]
    fn shards_partition_targets_disjointly() {
        let shards: Vec<Shard> = (0..3).map(|id| Shard::new(id, 3)).collect();
        for target in 0..30u64 {
            let owners = shards.iter().filter(|s| s.owns(target)).count();
            assert_eq!(owners, 1, "target {target}");
        }
    }

    #[test]
    fn empty_command_id_counts_as_missing() {
        let block = CommandBlock {
            key: BlockRef {
                collection: COMMAND_COLLECTION.into(),
                seq: 1,
            },
            id: Some(String::new()),
            payload: vec![],
            state: BlockState::Unprocessed,
        };
        assert_eq!(block.command_id(), None);
    }
}
