use crate::context::DEFAULT_CONCURRENCY_LIMIT;
use crate::error::{MetronomeError, Result};
use crate::model::{Shard, COMMAND_COLLECTION};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default bound on how many missed ticks a follower evaluates in one cycle.
pub const DEFAULT_MAX_CATCH_UP_TICKS: u64 = 10_000;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// ClockPolicy
// ---------------------------------------------------------------------------

/// Which shards advance the shared clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ClockPolicy {
    /// Only `owner_shard` advances; every other shard observes the tick.
    SingleAdvancer {
        #[serde(default)]
        owner_shard: u32,
    },
    /// Every shard advances once per cycle, so the tick moves N times per
    /// wall-clock cycle with N shards.
    EveryShard,
}

impl Default for ClockPolicy {
    fn default() -> Self {
        Self::SingleAdvancer { owner_shard: 0 }
    }
}

impl ClockPolicy {
    pub fn advances(&self, shard: Shard) -> bool {
        match self {
            Self::SingleAdvancer { owner_shard } => shard.id == *owner_shard,
            Self::EveryShard => true,
        }
    }
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub shard: Shard,
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
    #[serde(default = "default_cycle_interval_ms")]
    pub cycle_interval_ms: u64,
    #[serde(default)]
    pub clock: ClockPolicy,
    #[serde(default = "default_max_catch_up_ticks")]
    pub max_catch_up_ticks: u64,
    #[serde(default = "default_command_collection")]
    pub command_collection: String,
}

fn default_version() -> u32 {
    1
}

fn default_concurrency_limit() -> usize {
    DEFAULT_CONCURRENCY_LIMIT
}

fn default_cycle_interval_ms() -> u64 {
    1000
}

fn default_max_catch_up_ticks() -> u64 {
    DEFAULT_MAX_CATCH_UP_TICKS
}

fn default_command_collection() -> String {
    COMMAND_COLLECTION.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            shard: Shard::default(),
            concurrency_limit: default_concurrency_limit(),
            cycle_interval_ms: default_cycle_interval_ms(),
            clock: ClockPolicy::default(),
            max_catch_up_ticks: default_max_catch_up_ticks(),
            command_collection: default_command_collection(),
        }
    }
}

impl Config {
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(MetronomeError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_millis(self.cycle_interval_ms)
    }

    /// Fail with the first error-level warning, if any.
    pub fn ensure_valid(&self) -> Result<()> {
        match self
            .validate()
            .into_iter()
            .find(|w| w.level == WarnLevel::Error)
        {
            Some(w) => Err(MetronomeError::InvalidConfig(w.message)),
            None => Ok(()),
        }
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        // 1. Shard identity must name a real slice
        if self.shard.count == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "shard.count must be at least 1".to_string(),
            });
        } else if self.shard.id >= self.shard.count {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: format!(
                    "shard.id {} is outside shard.count {}",
                    self.shard.id, self.shard.count
                ),
            });
        }

        // 2. Concurrency bounds
        if self.concurrency_limit == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "concurrency_limit must be at least 1".to_string(),
            });
        } else if self.concurrency_limit > 1000 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "concurrency_limit={} (>1000 is unusual)",
                    self.concurrency_limit
                ),
            });
        }

        // 3. A zero interval spins the agent loop
        if self.cycle_interval_ms == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "cycle_interval_ms is 0; cycles will run back to back".to_string(),
            });
        }

        // 4. The clock owner must be one of the shards
        if let ClockPolicy::SingleAdvancer { owner_shard } = self.clock {
            if self.shard.count != 0 && owner_shard >= self.shard.count {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Error,
                    message: format!(
                        "clock.owner_shard {} is outside shard.count {}; no shard would advance the clock",
                        owner_shard, self.shard.count
                    ),
                });
            }
        }

        // 5. A follower must be able to evaluate at least the observed tick
        if self.max_catch_up_ticks == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "max_catch_up_ticks must be at least 1".to_string(),
            });
        }

        // 6. Block keys use NUL as the collection terminator
        if self.command_collection.is_empty() || self.command_collection.contains('\0') {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: format!("invalid command_collection {:?}", self.command_collection),
            });
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_config_roundtrip() {
        let cfg = Config::default();
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.version, 1);
        assert_eq!(parsed.concurrency_limit, 10);
        assert_eq!(parsed.clock, ClockPolicy::SingleAdvancer { owner_shard: 0 });
    }

    #[test]
    fn empty_yaml_uses_defaults() {
        let parsed: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(parsed.shard, Shard::default());
        assert_eq!(parsed.command_collection, "commands");
        assert_eq!(parsed.cycle_interval(), Duration::from_secs(1));
        assert_eq!(parsed.max_catch_up_ticks, DEFAULT_MAX_CATCH_UP_TICKS);
    }

    #[test]
    fn clock_policy_yaml_tagged() {
        let yaml = "mode: every_shard\n";
        let parsed: ClockPolicy = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(parsed, ClockPolicy::EveryShard);

        let yaml = serde_yaml::to_string(&ClockPolicy::SingleAdvancer { owner_shard: 2 }).unwrap();
        assert!(yaml.contains("mode: single_advancer"));
        assert!(yaml.contains("owner_shard: 2"));
    }

    #[test]
    fn single_advancer_only_moves_on_owner() {
        let policy = ClockPolicy::SingleAdvancer { owner_shard: 1 };
        assert!(!policy.advances(Shard::new(0, 3)));
        assert!(policy.advances(Shard::new(1, 3)));
        assert!(ClockPolicy::EveryShard.advances(Shard::new(2, 3)));
    }

    #[test]
    fn validate_default_has_no_warnings() {
        assert!(Config::default().validate().is_empty());
        assert!(Config::default().ensure_valid().is_ok());
    }

    #[test]
    fn validate_flags_bad_shard_and_concurrency() {
        let cfg = Config {
            shard: Shard::new(3, 2),
            concurrency_limit: 0,
            ..Config::default()
        };
        let warnings = cfg.validate();
        assert_eq!(
            warnings
                .iter()
                .filter(|w| w.level == WarnLevel::Error)
                .count(),
            2
        );
        assert!(matches!(
            cfg.ensure_valid(),
            Err(MetronomeError::InvalidConfig(_))
        ));
    }

    #[test]
    fn validate_flags_unreachable_clock_owner() {
        let cfg = Config {
            shard: Shard::new(0, 2),
            clock: ClockPolicy::SingleAdvancer { owner_shard: 5 },
            ..Config::default()
        };
        assert!(cfg
            .validate()
            .iter()
            .any(|w| w.message.contains("owner_shard")));
    }

    #[test]
    fn validate_flags_zero_catch_up_window() {
        let cfg = Config {
            max_catch_up_ticks: 0,
            ..Config::default()
        };
        assert!(matches!(
            cfg.ensure_valid(),
            Err(MetronomeError::InvalidConfig(msg)) if msg.contains("max_catch_up_ticks")
        ));
    }

    #[test]
    fn large_concurrency_is_only_a_warning() {
        let cfg = Config {
            concurrency_limit: 5000,
            ..Config::default()
        };
        let warnings = cfg.validate();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].level, WarnLevel::Warning);
    }

    #[test]
    fn load_requires_init_and_reads_saved_config() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            Config::load(dir.path()),
            Err(MetronomeError::NotInitialized)
        ));

        let cfg = Config {
            shard: Shard::new(1, 4),
            concurrency_limit: 3,
            ..Config::default()
        };
        cfg.save(dir.path()).unwrap();
        let loaded = Config::load(dir.path()).unwrap();
        assert_eq!(loaded.shard, Shard::new(1, 4));
        assert_eq!(loaded.concurrency_limit, 3);
    }
}
