//! Per-agent context threaded through every scheduler operation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{MetronomeError, Result};
use crate::messaging::Messenger;
use crate::model::{Shard, COMMAND_COLLECTION};
use crate::store::ObjectStore;

/// Default number of workers allowed in flight at once.
pub const DEFAULT_CONCURRENCY_LIMIT: usize = 10;

/// Store handle, shard identity and the shared worker limiter.
///
/// Cloning is cheap; every spawned worker owns a clone. Task and command
/// workers draw from the same limiter.
#[derive(Clone)]
pub struct AgentContext {
    pub store: Arc<dyn ObjectStore>,
    pub messenger: Arc<dyn Messenger>,
    pub shard: Shard,
    pub collection: Arc<str>,
    limiter: Arc<Semaphore>,
    gauge: Arc<WorkerGauge>,
}

impl AgentContext {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        messenger: Arc<dyn Messenger>,
        shard: Shard,
        concurrency_limit: usize,
    ) -> Result<Self> {
        if concurrency_limit == 0 {
            return Err(MetronomeError::InvalidConfig(
                "concurrency_limit must be at least 1".into(),
            ));
        }
        if shard.count == 0 || shard.id >= shard.count {
            return Err(MetronomeError::InvalidConfig(format!(
                "shard id {} is outside shard count {}",
                shard.id, shard.count
            )));
        }
        Ok(Self {
            store,
            messenger,
            shard,
            collection: Arc::from(COMMAND_COLLECTION),
            limiter: Arc::new(Semaphore::new(concurrency_limit)),
            gauge: Arc::new(WorkerGauge::default()),
        })
    }

    /// Read command blocks from `collection` instead of the default.
    pub fn with_collection(mut self, collection: &str) -> Self {
        self.collection = Arc::from(collection);
        self
    }

    /// Wait for a free worker slot. The slot is released when dropped.
    pub async fn acquire_slot(&self) -> Result<WorkerSlot> {
        let permit = Arc::clone(&self.limiter)
            .acquire_owned()
            .await
            .map_err(|_| MetronomeError::LimiterClosed)?;
        Ok(WorkerSlot {
            _permit: permit,
            _active: WorkerGauge::enter(&self.gauge),
        })
    }

    /// Highest number of simultaneously held slots since the last reset.
    pub fn peak_workers(&self) -> usize {
        self.gauge.peak.load(Ordering::SeqCst)
    }

    pub(crate) fn reset_peak(&self) {
        self.gauge
            .peak
            .store(self.gauge.active.load(Ordering::SeqCst), Ordering::SeqCst);
    }
}

/// A held worker slot.
pub struct WorkerSlot {
    _permit: OwnedSemaphorePermit,
    _active: ActiveGuard,
}

#[derive(Debug, Default)]
struct WorkerGauge {
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl WorkerGauge {
    fn enter(gauge: &Arc<WorkerGauge>) -> ActiveGuard {
        let now = gauge.active.fetch_add(1, Ordering::SeqCst) + 1;
        gauge.peak.fetch_max(now, Ordering::SeqCst);
        ActiveGuard {
            gauge: Arc::clone(gauge),
        }
    }
}

struct ActiveGuard {
    gauge: Arc<WorkerGauge>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.gauge.active.fetch_sub(1, Ordering::SeqCst);
    }
}
