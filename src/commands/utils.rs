use anyhow::{Context, Result};
use chrono::Duration;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use device_policy::config::{self, Config};
use device_policy::platform::Collaborators;
use device_policy::platform::system::offline_collaborators;
use device_policy::{EngineSettings, PolicyStore};
use device_policy::storage::FileBlobStore;

/// Initialize logging
pub fn init_logging(verbose: bool, configured_level: &str) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let level = if verbose { "debug" } else { configured_level };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();
}

/// Config file given on the command line, or the platform default
pub fn config_path(explicit: Option<PathBuf>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path),
        None => config::get_config_path(),
    }
}

/// Load the configuration. A missing default config falls back to built-in
/// defaults; a missing explicit one is an error.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    if let Some(path) = explicit {
        return config::load_config(path);
    }

    let path = config::get_config_path()?;
    if path.exists() {
        return config::load_config(&path);
    }

    // Logging is not up yet; this goes straight to stderr
    eprintln!(
        "No config file at {}; using defaults. Create one with 'device-policy init-config'",
        path.display()
    );
    Ok(Config::default())
}

/// Open the policy engine on the configured state directory
pub fn open_engine(config: &Config, collaborators: Collaborators) -> Result<PolicyStore> {
    open_with_settings(config, config.engine_settings(), collaborators)
}

/// Open the engine for a one-shot read. Stored budgets are reported as they
/// are; nothing is suspended and no alarm is armed.
pub fn open_engine_read_only(config: &Config) -> Result<PolicyStore> {
    let settings = EngineSettings {
        reconcile_budgets: false,
        ..config.engine_settings()
    };
    open_with_settings(config, settings, offline_collaborators())
}

fn open_with_settings(
    config: &Config,
    settings: EngineSettings,
    collaborators: Collaborators,
) -> Result<PolicyStore> {
    let state_dir = config.state_dir()?;
    let store = FileBlobStore::open(&state_dir)
        .with_context(|| format!("Failed to open state directory: {}", state_dir.display()))?;

    PolicyStore::open(
        settings,
        config.users.clone(),
        Arc::new(store),
        collaborators,
    )
}

/// Format duration for display
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.num_seconds();
    if secs < 0 {
        return format!("-{}", format_duration(-duration));
    }

    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else if secs < 86400 {
        format!("{}h", secs / 3600)
    } else {
        format!("{}d", secs / 86400)
    }
}
