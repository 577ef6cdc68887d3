use super::{load_config, open_store, owner_shard};
use crate::output::{print_json, print_table};
use metronome_core::model::ObjectKind;
use metronome_core::task::TaskDefinition;
use serde::Serialize;
use std::path::Path;

#[derive(Serialize)]
struct TaskRow {
    id: u64,
    shard: Option<u32>,
    #[serde(flatten)]
    task: TaskDefinition,
}

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = load_config(root)?;
    let store = open_store(root)?;
    let rt = tokio::runtime::Runtime::new()?;
    let objects = rt.block_on(store.list_objects(ObjectKind::Task))?;

    let mut rows = Vec::with_capacity(objects.len());
    for (id, data) in objects {
        let Some(id) = id.as_seq() else {
            tracing::warn!(%id, "task stored under a non-numeric id");
            continue;
        };
        match TaskDefinition::decode(&data) {
            Ok(task) => rows.push(TaskRow {
                id,
                shard: owner_shard(id, config.shard.count),
                task,
            }),
            Err(e) => tracing::warn!(task_id = id, error = %e, "skipping undecodable task"),
        }
    }

    if json {
        return print_json(&rows);
    }
    if rows.is_empty() {
        println!("No scheduled tasks.");
        return Ok(());
    }
    let headers = &["ID", "SHARD", "OWNER", "CHANNEL", "PAYLOAD1", "PAYLOAD2", "INTERVAL"];
    let table = rows
        .iter()
        .map(|r| {
            vec![
                r.id.to_string(),
                r.shard.map_or_else(|| "-".to_string(), |s| s.to_string()),
                r.task.owner.to_string(),
                r.task.channel.to_string(),
                r.task.payload1.to_string(),
                r.task.payload2.to_string(),
                r.task.interval_ticks.to_string(),
            ]
        })
        .collect();
    print_table(headers, table);
    Ok(())
}
