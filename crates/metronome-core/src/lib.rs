pub mod agent;
pub mod clock;
pub mod codec;
pub mod command;
pub mod config;
pub mod context;
pub mod error;
pub mod handlers;
pub mod io;
pub mod messaging;
pub mod model;
pub mod paths;
pub mod store;
pub mod task;

pub use agent::{Agent, CycleReport, RunSummary};
pub use config::{ClockPolicy, Config};
pub use context::AgentContext;
pub use error::{MetronomeError, Result};
pub use messaging::Messenger;
pub use store::{MemoryStore, ObjectStore, RedbStore, Transaction};
