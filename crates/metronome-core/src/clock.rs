//! The shared logical clock.
//!
//! A single object of kind `Clock` holds the current tick as one big-endian
//! word. A failed read or write surfaces as `ClockUnavailable`, which aborts
//! the cycle before any dispatch so no work runs against a stale tick.
//!
//! Follower shards also keep a fire cursor per shard: the last tick they
//! evaluated tasks at. It lets a follower catch up on ticks the owner
//! advanced through between two of its cycles, and survives restarts.

use tracing::{info, warn};

use crate::codec::{decode_words, encode_words};
use crate::error::{MetronomeError, Result};
use crate::model::{ObjectId, ObjectKind, GLOBAL_CLOCK};
use crate::store::ObjectStore;

fn clock_id() -> ObjectId {
    ObjectId::Seq(GLOBAL_CLOCK)
}

fn unavailable(stage: &str, e: MetronomeError) -> MetronomeError {
    MetronomeError::ClockUnavailable(format!("{stage}: {e}"))
}

/// Current tick, or `None` before the first advance.
pub async fn read_clock(store: &dyn ObjectStore) -> Result<Option<u64>> {
    let Some(data) = store
        .get_object(ObjectKind::Clock, &clock_id())
        .await
        .map_err(|e| unavailable("fetch", e))?
    else {
        return Ok(None);
    };
    let [time] = decode_words::<1>(&data).map_err(|e| unavailable("decode", e))?;
    Ok(Some(time))
}

/// Advance the clock by one tick and return the new value.
///
/// An absent clock is a first run and starts at 1.
pub async fn advance_clock(store: &dyn ObjectStore) -> Result<u64> {
    let tick = match read_clock(store).await? {
        Some(time) => time
            .checked_add(1)
            .ok_or_else(|| MetronomeError::ClockUnavailable("tick overflow".into()))?,
        None => {
            warn!("clock object not found, initializing to 1");
            1
        }
    };
    store
        .put_object(ObjectKind::Clock, &clock_id(), &encode_words(&[tick]))
        .await
        .map_err(|e| unavailable("persist", e))?;
    Ok(tick)
}

/// Read the tick without advancing it. A missing clock is an error here:
/// a follower has nothing to act on until the advancing shard has run.
pub async fn observe_clock(store: &dyn ObjectStore) -> Result<u64> {
    match read_clock(store).await? {
        Some(tick) => Ok(tick),
        None => {
            info!("clock not started yet");
            Err(MetronomeError::ClockUnavailable(
                "clock has not been started by the advancing shard".into(),
            ))
        }
    }
}

// ---------------------------------------------------------------------------
// Follower fire cursor
// ---------------------------------------------------------------------------

fn cursor_id(shard_id: u32) -> ObjectId {
    ObjectId::Seq(u64::from(shard_id))
}

/// Last tick `shard_id` evaluated its tasks at, or `None` if it never has.
pub async fn read_fire_cursor(store: &dyn ObjectStore, shard_id: u32) -> Result<Option<u64>> {
    let Some(data) = store
        .get_object(ObjectKind::FireCursor, &cursor_id(shard_id))
        .await
        .map_err(|e| unavailable("fetch fire cursor", e))?
    else {
        return Ok(None);
    };
    let [tick] = decode_words::<1>(&data).map_err(|e| unavailable("decode fire cursor", e))?;
    Ok(Some(tick))
}

pub async fn record_fire_cursor(store: &dyn ObjectStore, shard_id: u32, tick: u64) -> Result<()> {
    store
        .put_object(
            ObjectKind::FireCursor,
            &cursor_id(shard_id),
            &encode_words(&[tick]),
        )
        .await
}
