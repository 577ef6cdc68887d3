pub mod blocks;
pub mod clock;
pub mod config;
pub mod cycle;
pub mod init;
pub mod outbox;
pub mod run;
pub mod submit;
pub mod tasks;

use anyhow::Context;
use clap::{Args, ValueEnum};
use metronome_core::messaging::LogMessenger;
use metronome_core::model::Shard;
use metronome_core::{paths, Agent, Config, MetronomeError, Messenger, RedbStore};
use std::path::Path;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Shared arguments
// ---------------------------------------------------------------------------

/// Per-invocation overrides of the agent section of `config.yaml`.
#[derive(Args, Debug, Default, Clone)]
pub struct AgentArgs {
    /// Shard id this agent serves (overrides config)
    #[arg(long, env = "METRONOME_SHARD_ID")]
    pub shard_id: Option<u32>,

    /// Total number of shards (overrides config)
    #[arg(long, env = "METRONOME_SHARD_COUNT")]
    pub shard_count: Option<u32>,

    /// Maximum workers in flight (overrides config)
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Where fired task payloads go
    #[arg(long, value_enum, default_value_t = MessengerKind::Outbox)]
    pub messenger: MessengerKind,
}

#[derive(ValueEnum, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum MessengerKind {
    /// Durable hand-off table inside the store
    #[default]
    Outbox,
    /// Log each message and drop it
    Log,
}

impl AgentArgs {
    pub fn apply(&self, config: &mut Config) {
        if let Some(id) = self.shard_id {
            config.shard.id = id;
        }
        if let Some(count) = self.shard_count {
            config.shard.count = count;
        }
        if let Some(limit) = self.concurrency {
            config.concurrency_limit = limit;
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub fn load_config(root: &Path) -> anyhow::Result<Config> {
    Config::load(root).context("failed to load config")
}

/// Open the store created by `metronome init`.
pub fn open_store(root: &Path) -> anyhow::Result<RedbStore> {
    let path = paths::store_path(root);
    if !path.exists() {
        return Err(MetronomeError::NotInitialized.into());
    }
    RedbStore::open(&path).with_context(|| format!("failed to open {}", path.display()))
}

/// Build an agent from config plus overrides, backed by the root's store.
pub fn build_agent(root: &Path, args: &AgentArgs) -> anyhow::Result<(Agent, RedbStore)> {
    let mut config = load_config(root)?;
    args.apply(&mut config);
    let store = open_store(root)?;
    let messenger: Arc<dyn Messenger> = match args.messenger {
        MessengerKind::Outbox => Arc::new(store.clone()),
        MessengerKind::Log => Arc::new(LogMessenger),
    };
    let agent = Agent::from_config(&config, Arc::new(store.clone()), messenger)
        .context("invalid agent configuration")?;
    Ok((agent, store))
}

/// Owning shard of `target` under `shard_count`, for display.
pub fn owner_shard(target: u64, shard_count: u32) -> Option<u32> {
    (0..shard_count).find(|id| Shard::new(*id, shard_count).owns(target))
}
