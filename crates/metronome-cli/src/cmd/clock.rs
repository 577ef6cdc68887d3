use super::open_store;
use crate::output::print_json;
use metronome_core::clock::read_clock;
use std::path::Path;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let store = open_store(root)?;
    let rt = tokio::runtime::Runtime::new()?;
    let tick = rt.block_on(read_clock(&store))?;

    if json {
        print_json(&serde_json::json!({ "tick": tick }))?;
    } else {
        match tick {
            Some(tick) => println!("tick: {tick}"),
            None => println!("Clock not started. Run `metronome cycle` on the clock owner."),
        }
    }
    Ok(())
}
