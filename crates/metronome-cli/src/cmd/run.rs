use super::{build_agent, load_config, AgentArgs};
use crate::output::print_json;
use std::path::Path;
use std::time::Duration;

pub fn run(
    root: &Path,
    args: &AgentArgs,
    max_cycles: Option<u64>,
    interval_ms: Option<u64>,
    json: bool,
) -> anyhow::Result<()> {
    let interval = match interval_ms {
        Some(ms) => Duration::from_millis(ms),
        None => load_config(root)?.cycle_interval(),
    };

    let rt = tokio::runtime::Runtime::new()?;
    let summary = rt.block_on(async {
        let (mut agent, _store) = build_agent(root, args)?;
        tracing::info!(
            shard_id = agent.context().shard.id,
            shard_count = agent.context().shard.count,
            interval_ms = interval.as_millis() as u64,
            "agent started"
        );
        let shutdown = async {
            // Without a signal handler the loop runs until max_cycles.
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
        };
        anyhow::Ok(agent.run(max_cycles, interval, shutdown).await)
    })?;

    if json {
        print_json(&summary)?;
    } else {
        println!(
            "{} cycle(s), {} halted, {} task(s) fired, {} command block(s) applied",
            summary.cycles, summary.halted_cycles, summary.tasks_fired, summary.commands_applied
        );
        if let Some(tick) = summary.last_tick {
            println!("last tick: {tick}");
        }
    }
    Ok(())
}
