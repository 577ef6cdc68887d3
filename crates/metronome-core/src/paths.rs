use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const METRONOME_DIR: &str = ".metronome";
pub const CONFIG_FILE: &str = ".metronome/config.yaml";
pub const STORE_FILE: &str = ".metronome/store.redb";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn metronome_dir(root: &Path) -> PathBuf {
    root.join(METRONOME_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn store_path(root: &Path) -> PathBuf {
    root.join(STORE_FILE)
}
