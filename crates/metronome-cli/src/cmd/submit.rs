use super::{load_config, open_store};
use crate::output::print_json;
use anyhow::Context;
use clap::Subcommand;
use metronome_core::command::{encode_commands, CommandRecord};
use metronome_core::task::TaskDefinition;
use serde::Serialize;
use std::path::Path;

// ---------------------------------------------------------------------------
// Subcommand types
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum SubmitSubcommand {
    /// Schedule a recurring task
    Repeat {
        /// Recipient of the fired message
        #[arg(long)]
        owner: u64,
        /// Channel the message is pushed on
        #[arg(long)]
        channel: u64,
        /// First payload word
        #[arg(long, default_value_t = 0)]
        payload1: u64,
        /// Second payload word
        #[arg(long, default_value_t = 0)]
        payload2: u64,
        /// Fire whenever the tick is a multiple of this
        #[arg(long = "interval")]
        interval_ticks: u64,
        /// Number of identical REPEAT commands to pack into the block
        #[arg(long, default_value_t = 1)]
        count: usize,
        /// Command id (default: random UUID)
        #[arg(long)]
        id: Option<String>,
    },

    /// Stop and delete a scheduled task
    Desist {
        /// Task id as shown by `metronome tasks`
        task_id: u64,
        /// Command id (default: random UUID)
        #[arg(long)]
        id: Option<String>,
    },
}

#[derive(Serialize)]
struct Submitted {
    collection: String,
    seq: u64,
    id: String,
    commands: usize,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run(root: &Path, subcmd: SubmitSubcommand, json: bool) -> anyhow::Result<()> {
    let (commands, id) = match subcmd {
        SubmitSubcommand::Repeat {
            owner,
            channel,
            payload1,
            payload2,
            interval_ticks,
            count,
            id,
        } => {
            if count == 0 {
                anyhow::bail!("--count must be at least 1");
            }
            let task = TaskDefinition {
                owner,
                channel,
                payload1,
                payload2,
                interval_ticks,
            };
            (vec![CommandRecord::repeat(&task); count], id)
        }
        SubmitSubcommand::Desist { task_id, id } => (vec![CommandRecord::desist(task_id)], id),
    };
    let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let config = load_config(root)?;
    let store = open_store(root)?;
    let rt = tokio::runtime::Runtime::new()?;
    let block = rt
        .block_on(store.append_block(
            &config.command_collection,
            Some(&id),
            encode_commands(&commands),
        ))
        .context("failed to append command block")?;

    let submitted = Submitted {
        collection: block.collection,
        seq: block.seq,
        id,
        commands: commands.len(),
    };
    if json {
        print_json(&submitted)?;
    } else {
        println!(
            "Submitted block {}/{} (id {}, {} command(s))",
            submitted.collection, submitted.seq, submitted.id, submitted.commands
        );
    }
    Ok(())
}
