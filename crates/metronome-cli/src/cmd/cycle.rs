use super::{build_agent, AgentArgs};
use crate::output::print_json;
use metronome_core::CycleReport;
use std::path::Path;

pub fn run(root: &Path, args: &AgentArgs, json: bool) -> anyhow::Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(async {
        let (mut agent, _store) = build_agent(root, args)?;
        let report = agent.run_cycle().await?;
        anyhow::Ok(report)
    })?;

    if json {
        print_json(&report)?;
    } else {
        print_report(&report);
    }
    Ok(())
}

pub fn print_report(report: &CycleReport) {
    let clock = if report.advanced { "advanced" } else { "observed" };
    println!("shard {} tick {} ({clock})", report.shard_id, report.tick);
    if report.tasks_skipped {
        println!("  tasks:    skipped, tick already fired");
    } else {
        println!(
            "  tasks:    {} seen, {} fired, {} not due, {} failed over {} tick(s)",
            report.tasks_seen,
            report.tasks_fired,
            report.tasks_not_due,
            report.tasks_failed,
            report.ticks_evaluated
        );
    }
    println!(
        "  commands: {} seen, {} applied, {} duplicate, {} discarded, {} rolled back, {} failed",
        report.commands_seen,
        report.commands_applied,
        report.commands_duplicate,
        report.commands_discarded,
        report.commands_rolled_back,
        report.commands_failed
    );
    println!("  peak workers: {}", report.peak_workers);
}
