use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use std::path::Path;

use device_policy::config::{Config, EXAMPLE_CONFIG};
use device_policy::platform::common::ensure_directory_exists;
use device_policy::storage::FileBlobStore;
use device_policy::time_budget::BudgetPhase;
use device_policy::transfer::{self, ApplyOutcome};

use super::utils::{format_duration, open_engine_read_only};

/// Show engine state
pub fn status(config: &Config) -> Result<()> {
    let engine = open_engine_read_only(config)?;

    println!("Device Policy Status");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("State directory: {}", config.state_dir()?.display());
    println!();

    let owners = engine.owners()?;
    match owners.device_owner() {
        Some(owner) => println!("Device owner:  {} (user {})", owner.admin, owner.user_id),
        None => println!("Device owner:  none"),
    }

    let logging = engine.logging_status()?;
    println!("All users affiliated: {}", logging.all_users_affiliated);
    println!(
        "Security logging: {}   Network logging: {}",
        describe_logging(logging.security_enabled, logging.security_collecting),
        describe_logging(logging.network_enabled, logging.network_collecting)
    );
    println!();

    let now = Utc::now();
    for user in engine.users()? {
        let kind = if user.managed_profile {
            format!("managed profile of {}", user.parent.unwrap_or_default())
        } else {
            "full user".to_string()
        };
        println!("User {} ({})", user.id, kind);

        if let Some(owner) = owners.profile_owner(user.id) {
            println!(
                "  Profile owner: {}{}",
                owner.admin,
                if owner.organization_owned { " [organization-owned]" } else { "" }
            );
        }

        let admins = engine.admins(user.id)?;
        println!("  Admins:        {}", admins.len());
        for admin in &admins {
            println!("    - {}", admin.component());
        }
        println!("  Affiliated:    {}", engine.is_user_affiliated(user.id)?);

        if user.managed_profile {
            let budget = engine.budget_status(user.id)?;
            print!("  Budget:        ");
            if budget.max_off_millis == 0 {
                println!("none");
            } else {
                println!("{}", format_duration(Duration::milliseconds(budget.max_off_millis)));
            }

            match budget.phase {
                BudgetPhase::Armed | BudgetPhase::Warning => {
                    if let Some(deadline) = DateTime::<Utc>::from_timestamp_millis(budget.deadline) {
                        println!(
                            "  Deadline:      {} (in {}){}",
                            deadline.format("%Y-%m-%d %H:%M:%S %Z"),
                            format_duration(deadline - now),
                            if budget.phase == BudgetPhase::Warning { " [warning shown]" } else { "" }
                        );
                    }
                }
                BudgetPhase::Expired => println!("  Deadline:      passed"),
                BudgetPhase::None => {}
            }

            if budget.apps_suspended {
                println!("  Personal apps: suspended ({} packages)", budget.suspended_packages.len());
            }
            if !budget.failed_packages.is_empty() {
                println!("  Failed:        {} packages will be retried", budget.failed_packages.len());
            }
        }
        println!();
    }

    Ok(())
}

fn describe_logging(enabled: bool, collecting: bool) -> &'static str {
    match (enabled, collecting) {
        (false, _) => "off",
        (true, true) => "collecting",
        (true, false) => "paused",
    }
}

/// Print the resolved policy of a user
pub fn resolve(config: &Config, user_id: u32, parent: bool) -> Result<()> {
    let engine = open_engine_read_only(config)?;
    let resolved = engine
        .resolve(user_id, parent)
        .with_context(|| format!("Failed to resolve policy for user {}", user_id))?;

    let json = serde_json::to_string_pretty(&resolved).context("Failed to serialize policy")?;
    println!("{}", json);
    Ok(())
}

/// Replay a pending transfer journal without starting the engine
pub fn recover(config: &Config) -> Result<()> {
    let state_dir = config.state_dir()?;
    let store = FileBlobStore::open(&state_dir)?;

    match transfer::recover_pending(&store)? {
        Some(report) => {
            match report.outcome {
                ApplyOutcome::Applied { .. } => println!(
                    "✓ Ownership of user {} moved from {} to {}",
                    report.entry.user_id, report.entry.source, report.entry.target
                ),
                ApplyOutcome::TargetMissing => println!(
                    "✗ Transfer to {} could not finish; {} remains owner of user {}",
                    report.entry.target, report.entry.source, report.entry.user_id
                ),
            }
            println!("  Journal cleared in {}", state_dir.display());
        }
        None => println!("✓ No interrupted ownership transfer"),
    }

    Ok(())
}

/// Write the example configuration
pub fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "Config file already exists: {} (use --force to overwrite)",
            path.display()
        );
    }

    if let Some(parent) = path.parent() {
        ensure_directory_exists(parent)?;
    }
    std::fs::write(path, EXAMPLE_CONFIG)
        .with_context(|| format!("Failed to write config file: {}", path.display()))?;

    println!("✓ Example configuration written to: {}", path.display());
    Ok(())
}
