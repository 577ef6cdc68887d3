use super::{load_config, open_store};
use crate::output::{hex, print_json, print_table};
use clap::ValueEnum;
use metronome_core::command::{decode_commands, Action};
use metronome_core::model::BlockState;
use serde::Serialize;
use std::path::Path;

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateFilter {
    Unprocessed,
    Processed,
    Error,
}

impl StateFilter {
    fn matches(self, state: BlockState) -> bool {
        matches!(
            (self, state),
            (Self::Unprocessed, BlockState::Unprocessed)
                | (Self::Processed, BlockState::Processed)
                | (Self::Error, BlockState::Error)
        )
    }
}

#[derive(Serialize)]
struct BlockRow {
    seq: u64,
    id: Option<String>,
    state: BlockState,
    /// Human summary of the decoded commands, or the decode error.
    commands: String,
    payload: String,
}

fn describe(payload: &[u8]) -> String {
    match decode_commands(payload) {
        Ok(commands) => commands
            .iter()
            .map(|c| match Action::from_code(c.action) {
                Some(Action::Repeat) => format!("repeat(every {})", c.params[4]),
                Some(Action::Desist) => format!("desist({})", c.params[0]),
                None => format!("action {}", c.action),
            })
            .collect::<Vec<_>>()
            .join(", "),
        Err(e) => format!("invalid: {e}"),
    }
}

pub fn run(root: &Path, state: Option<StateFilter>, json: bool) -> anyhow::Result<()> {
    let config = load_config(root)?;
    let store = open_store(root)?;
    let rt = tokio::runtime::Runtime::new()?;
    let blocks = rt.block_on(store.list_blocks(&config.command_collection))?;

    let rows: Vec<BlockRow> = blocks
        .into_iter()
        .filter(|b| state.map_or(true, |s| s.matches(b.state)))
        .map(|b| BlockRow {
            seq: b.key.seq,
            commands: describe(&b.payload),
            payload: hex(&b.payload),
            id: b.id,
            state: b.state,
        })
        .collect();

    if json {
        return print_json(&rows);
    }
    if rows.is_empty() {
        println!("No command blocks in '{}'.", config.command_collection);
        return Ok(());
    }
    let headers = &["SEQ", "ID", "STATE", "COMMANDS"];
    let table = rows
        .iter()
        .map(|r| {
            vec![
                r.seq.to_string(),
                r.id.clone().unwrap_or_else(|| "-".to_string()),
                r.state.as_str().to_string(),
                r.commands.clone(),
            ]
        })
        .collect();
    print_table(headers, table);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use metronome_core::command::{encode_commands, CommandRecord};

    #[test]
    fn describe_lists_each_command() {
        let payload = encode_commands(&[CommandRecord::desist(4), CommandRecord::desist(9)]);
        assert_eq!(describe(&payload), "desist(4), desist(9)");
        assert!(describe(&[1, 2, 3]).starts_with("invalid:"));
    }

    #[test]
    fn filter_matches_only_its_state() {
        assert!(StateFilter::Error.matches(BlockState::Error));
        assert!(!StateFilter::Error.matches(BlockState::Processed));
    }
}
