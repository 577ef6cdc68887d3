use anyhow::{bail, Context};
use metronome_core::config::{Config, WarnLevel};
use metronome_core::model::Shard;
use metronome_core::{io, paths, RedbStore};
use std::path::Path;

pub fn run(root: &Path, shard: Shard, concurrency: Option<usize>) -> anyhow::Result<()> {
    println!("Initializing metronome in: {}", root.display());

    let dir = paths::metronome_dir(root);
    io::ensure_dir(&dir).with_context(|| format!("failed to create {}", dir.display()))?;

    // 1. config.yaml, left alone when present
    let config_path = paths::config_path(root);
    if !config_path.exists() {
        let mut cfg = Config {
            shard,
            ..Config::default()
        };
        if let Some(limit) = concurrency {
            cfg.concurrency_limit = limit;
        }
        let errors: Vec<String> = cfg
            .validate()
            .into_iter()
            .filter(|w| w.level == WarnLevel::Error)
            .map(|w| w.message)
            .collect();
        if !errors.is_empty() {
            bail!("refusing to write invalid config: {}", errors.join("; "));
        }
        cfg.save(root).context("failed to write config.yaml")?;
        println!("  created: {}", paths::CONFIG_FILE);
    } else {
        println!("  exists:  {}", paths::CONFIG_FILE);
    }

    // 2. store.redb with every table
    let store_path = paths::store_path(root);
    let existed = store_path.exists();
    RedbStore::open(&store_path)
        .with_context(|| format!("failed to create {}", store_path.display()))?;
    if existed {
        println!("  exists:  {}", paths::STORE_FILE);
    } else {
        println!("  created: {}", paths::STORE_FILE);
    }

    println!("\nmetronome initialized. Next: metronome submit repeat --help");
    Ok(())
}
