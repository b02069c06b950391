use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::engine::EngineSettings;
use crate::model::{USER_SYSTEM, UserInfo};

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Config {
    /// Directory holding the policy state blobs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,

    /// Device user topology
    #[serde(default = "default_users")]
    pub users: Vec<UserInfo>,

    #[serde(default)]
    pub time_budget: TimeBudgetConfig,

    #[serde(default)]
    pub suspension: SuspensionConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_users() -> Vec<UserInfo> {
    vec![UserInfo::full(USER_SYSTEM)]
}

/// Profile time budget tuning
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TimeBudgetConfig {
    /// How long before the deadline the warning notice appears
    #[serde(default = "default_warning_period_hours")]
    pub warning_period_hours: u64,

    /// Wall-clock drift below this is not treated as a clock change
    #[serde(default = "default_clock_jump_tolerance_secs")]
    pub clock_jump_tolerance_secs: u64,

    /// How often the daemon compares the wall clock with the monotonic clock
    #[serde(default = "default_clock_check_interval_secs")]
    pub clock_check_interval_secs: u64,
}

fn default_warning_period_hours() -> u64 {
    24
}

fn default_clock_jump_tolerance_secs() -> u64 {
    5
}

fn default_clock_check_interval_secs() -> u64 {
    30
}

impl Default for TimeBudgetConfig {
    fn default() -> Self {
        Self {
            warning_period_hours: default_warning_period_hours(),
            clock_jump_tolerance_secs: default_clock_jump_tolerance_secs(),
            clock_check_interval_secs: default_clock_check_interval_secs(),
        }
    }
}

/// How personal apps get suspended
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum SuspensionConfig {
    /// Only log what would be suspended
    Log {
        /// Personal packages reported for every user
        #[serde(default)]
        packages: Vec<String>,
    },
    /// Run an external program. `{user}` and `{package}` in the argument
    /// templates are substituted.
    Command {
        program: String,
        /// Prints one personal package per line
        list_args: Vec<String>,
        suspend_args: Vec<String>,
        unsuspend_args: Vec<String>,
    },
}

impl Default for SuspensionConfig {
    fn default() -> Self {
        SuspensionConfig::Log {
            packages: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: None,
            users: default_users(),
            time_budget: TimeBudgetConfig::default(),
            suspension: SuspensionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Engine tuning derived from this configuration
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            warning_period_millis: hours_to_millis(self.time_budget.warning_period_hours),
            clock_jump_tolerance_millis: secs_to_millis(self.time_budget.clock_jump_tolerance_secs),
            reconcile_budgets: true,
        }
    }

    /// State directory from the config, or the platform default
    pub fn state_dir(&self) -> Result<PathBuf> {
        match &self.state_dir {
            Some(dir) => Ok(dir.clone()),
            None => crate::storage::default_state_dir(),
        }
    }
}

fn hours_to_millis(hours: u64) -> i64 {
    i64::try_from(hours.saturating_mul(60 * 60 * 1000)).unwrap_or(i64::MAX)
}

fn secs_to_millis(secs: u64) -> i64 {
    i64::try_from(secs.saturating_mul(1000)).unwrap_or(i64::MAX)
}

/// Get the platform-specific config file path
pub fn get_config_path() -> Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        let system_path = PathBuf::from("/etc/device-policy/config.yaml");
        if system_path.exists() {
            return Ok(system_path);
        }
    }

    if let Some(dirs) = directories::ProjectDirs::from("", "", "device-policy") {
        let mut path = dirs.config_dir().to_path_buf();
        path.push("config.yaml");
        return Ok(path);
    }

    anyhow::bail!("Could not determine config file location");
}

/// Load and validate configuration from a YAML file
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse YAML config file: {}", path.display()))?;

    validate_config(&config)?;

    Ok(config)
}

/// Validate and write configuration as YAML
pub fn save_config(path: &Path, config: &Config) -> Result<()> {
    validate_config(config)?;

    let content = serde_yaml::to_string(config)
        .context("Failed to serialize config to YAML")?;

    crate::platform::common::atomic_write(path, content.as_bytes())
        .with_context(|| format!("Failed to write config file: {}", path.display()))?;

    Ok(())
}

pub fn validate_config(config: &Config) -> Result<()> {
    validate_users(&config.users).context("Invalid user topology")?;

    if config.time_budget.warning_period_hours == 0 {
        anyhow::bail!("time_budget.warning_period_hours must be greater than zero");
    }

    if let SuspensionConfig::Command { program, .. } = &config.suspension {
        if program.trim().is_empty() {
            anyhow::bail!("suspension.program must not be empty");
        }
    }

    if !LOG_LEVELS.contains(&config.logging.level.as_str()) {
        anyhow::bail!(
            "Unknown logging level '{}' (expected one of {})",
            config.logging.level,
            LOG_LEVELS.join(", ")
        );
    }

    Ok(())
}

fn validate_users(users: &[UserInfo]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for user in users {
        if !seen.insert(user.id) {
            anyhow::bail!("User {} is listed more than once", user.id);
        }
    }

    if !seen.contains(&USER_SYSTEM) {
        anyhow::bail!("The system user {} must be listed", USER_SYSTEM);
    }

    for user in users {
        match (user.managed_profile, user.parent) {
            (true, None) => anyhow::bail!("Managed profile {} has no parent", user.id),
            (true, Some(parent)) => {
                let parent_is_full_user = users
                    .iter()
                    .any(|candidate| candidate.id == parent && !candidate.managed_profile);
                if !parent_is_full_user || parent == user.id {
                    anyhow::bail!(
                        "Managed profile {} has parent {} which is not a full user",
                        user.id,
                        parent
                    );
                }
            }
            (false, Some(parent)) => {
                anyhow::bail!("Full user {} cannot have parent {}", user.id, parent)
            }
            (false, None) => {}
        }
    }

    Ok(())
}

/// Example configuration written by `init-config`
pub const EXAMPLE_CONFIG: &str = include_str!("../example-config.yaml");
