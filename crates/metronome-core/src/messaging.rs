//! Delivery of fired task payloads.
//!
//! The scheduler only hands a payload to a [`Messenger`]; transport and
//! acknowledgement belong to whatever sits behind it. `RedbStore` implements
//! this trait by appending to its outbox table.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

#[async_trait]
pub trait Messenger: Send + Sync {
    /// Fire-and-forget delivery of `payload` to `(owner, channel)`.
    async fn push_message(&self, owner: u64, channel: u64, payload: Vec<u8>) -> Result<()>;
}

/// Logs every message and drops it. Useful for dry runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMessenger;

#[async_trait]
impl Messenger for LogMessenger {
    async fn push_message(&self, owner: u64, channel: u64, payload: Vec<u8>) -> Result<()> {
        tracing::info!(owner, channel, bytes = payload.len(), "message pushed");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub owner: u64,
    pub channel: u64,
    pub payload: Vec<u8>,
}

/// Keeps every delivery in memory, optionally taking `delay` per message.
#[derive(Debug, Default)]
pub struct RecordingMessenger {
    deliveries: Mutex<Vec<Delivery>>,
    delay: Option<Duration>,
}

impl RecordingMessenger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl Messenger for RecordingMessenger {
    async fn push_message(&self, owner: u64, channel: u64, payload: Vec<u8>) -> Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.deliveries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Delivery {
                owner,
                channel,
                payload,
            });
        Ok(())
    }
}
