use super::open_store;
use crate::output::{hex, print_json, print_table};
use std::path::Path;

pub fn run(root: &Path, drain: bool, json: bool) -> anyhow::Result<()> {
    let store = open_store(root)?;
    let rt = tokio::runtime::Runtime::new()?;
    let messages = if drain {
        rt.block_on(store.drain_outbox())?
    } else {
        rt.block_on(store.outbox())?
    };

    if json {
        return print_json(&messages);
    }
    if messages.is_empty() {
        println!("Outbox is empty.");
        return Ok(());
    }
    let headers = &["SEQ", "OWNER", "CHANNEL", "PAYLOAD", "ENQUEUED"];
    let rows = messages
        .iter()
        .map(|m| {
            vec![
                m.seq.to_string(),
                m.owner.to_string(),
                m.channel.to_string(),
                hex(&m.payload),
                m.enqueued_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            ]
        })
        .collect();
    print_table(headers, rows);
    if drain {
        println!("\nDrained {} message(s).", messages.len());
    }
    Ok(())
}
