use anyhow::{Context, Result};
use chainmend_repair::RepairOptions;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Values from `config.toml`. Anything unset falls back to the built-in
/// defaults; flags and environment variables win over the file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainmendConfig {
    pub interval: Option<usize>,
    pub marker: Option<String>,
    pub verify: Option<bool>,
    pub time_gap_secs: Option<i64>,
    pub projects_dir: Option<PathBuf>,
    pub backup_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct RepairOverrides {
    pub dry_run: bool,
    pub interval: Option<usize>,
    pub marker: Option<String>,
    pub no_verify: bool,
    pub time_gap_secs: Option<i64>,
    pub backup_dir: Option<PathBuf>,
}

impl ChainmendConfig {
    pub fn repair_options(&self, overrides: &RepairOverrides) -> RepairOptions {
        let defaults = RepairOptions::default();
        RepairOptions {
            dry_run: overrides.dry_run,
            interval: overrides
                .interval
                .or(self.interval)
                .filter(|value| *value > 0)
                .unwrap_or(defaults.interval),
            verify: !overrides.no_verify && self.verify.unwrap_or(defaults.verify),
            marker: overrides
                .marker
                .clone()
                .or_else(|| self.marker.clone())
                .filter(|value| !value.is_empty())
                .unwrap_or(defaults.marker),
            time_gap_secs: overrides
                .time_gap_secs
                .or(self.time_gap_secs)
                .filter(|value| *value >= 0)
                .unwrap_or(defaults.time_gap_secs),
            backup_dir: self.backup_dir(overrides.backup_dir.as_deref()),
        }
    }

    pub fn backup_dir(&self, flag: Option<&Path>) -> Option<PathBuf> {
        flag.map(Path::to_path_buf).or_else(|| self.backup_dir.clone())
    }

    pub fn marker(&self) -> String {
        self.repair_options(&RepairOverrides::default()).marker
    }
}

pub fn config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    config_dir().join("chainmend/config.toml")
}

pub fn load_config(path: &Path) -> Result<ChainmendConfig> {
    if !path.exists() {
        return Ok(ChainmendConfig::default());
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("Failed to parse config {}", path.display()))
}

fn config_dir() -> PathBuf {
    if let Ok(path) = env::var("XDG_CONFIG_HOME") {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    dirs::home_dir()
        .map(|home| home.join(".config"))
        .unwrap_or_else(|| PathBuf::from(".config"))
}
