use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};

use device_policy::PolicyStore;
use device_policy::config::Config;
use device_policy::model::UserId;
use device_policy::platform::system::system_collaborators;

use super::utils::open_engine;

/// Host events read from stdin, one per line:
///
/// ```text
/// unlocked <user>
/// locked <user>
/// package-removed <package> <user>
/// clock-changed
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
enum HostEvent {
    ProfileUnlocked(UserId),
    ProfileLocked(UserId),
    PackageRemoved { package: String, user_id: UserId },
    ClockChanged,
}

fn parse_event(line: &str) -> Result<Option<HostEvent>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let parts: Vec<&str> = line.split_whitespace().collect();
    let user = |raw: &str| -> Result<UserId> {
        raw.parse()
            .with_context(|| format!("Invalid user id '{}' in event: {}", raw, line))
    };

    let event = match parts.as_slice() {
        ["unlocked", user_id] => HostEvent::ProfileUnlocked(user(*user_id)?),
        ["locked", user_id] => HostEvent::ProfileLocked(user(*user_id)?),
        ["package-removed", package, user_id] => HostEvent::PackageRemoved {
            package: package.to_string(),
            user_id: user(*user_id)?,
        },
        ["clock-changed"] => HostEvent::ClockChanged,
        _ => anyhow::bail!("Unknown event: {}", line),
    };
    Ok(Some(event))
}

/// Run the daemon until Ctrl-C
pub fn run(config: Config) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("Failed to start tokio runtime")?;
    runtime.block_on(run_daemon(config))
}

async fn run_daemon(config: Config) -> Result<()> {
    info!("Starting device policy daemon");
    info!("State directory: {}", config.state_dir()?.display());
    info!(
        "Warning period: {}h, clock check every {}s",
        config.time_budget.warning_period_hours, config.time_budget.clock_check_interval_secs
    );

    let (collaborators, mut fired) = system_collaborators(&config)?;

    // Opening replays any pending transfer journal and may call the suspender
    let engine = {
        let config = config.clone();
        tokio::task::spawn_blocking(move || open_engine(&config, collaborators))
            .await
            .context("Engine startup task failed")??
    };
    let engine = Arc::new(engine);

    let interval = Duration::from_secs(config.time_budget.clock_check_interval_secs.max(1));
    let mut clock_check = tokio::time::interval(interval);
    clock_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    // Managed profiles count as off until the host reports them unlocked
    let mut events = BufReader::new(tokio::io::stdin()).lines();
    let mut events_open = true;

    loop {
        tokio::select! {
            Some(user_id) = fired.recv() => {
                debug!("Budget alarm fired for user {}", user_id);
                deliver_alarm(&engine, user_id).await;
            }
            line = events.next_line(), if events_open => {
                match line {
                    Ok(Some(line)) => match parse_event(&line) {
                        Ok(Some(event)) => deliver_event(&engine, event).await,
                        Ok(None) => {}
                        Err(e) => warn!("{:#}", e),
                    },
                    Ok(None) => {
                        info!("Event input closed; profile lock state is no longer tracked");
                        events_open = false;
                    }
                    Err(e) => {
                        warn!("Failed to read event input: {}", e);
                        events_open = false;
                    }
                }
            }
            _ = clock_check.tick() => {
                check_clock(&engine).await;
            }
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-C")?;
                info!("Shutting down");
                break;
            }
        }
    }

    Ok(())
}

async fn deliver_event(engine: &Arc<PolicyStore>, event: HostEvent) {
    debug!("Host event: {:?}", event);
    if event == HostEvent::ClockChanged {
        check_clock(engine).await;
        return;
    }

    let engine = engine.clone();
    let task = tokio::task::spawn_blocking(move || match &event {
        HostEvent::ProfileUnlocked(user_id) => engine.on_profile_unlocked(*user_id),
        HostEvent::ProfileLocked(user_id) => engine.on_profile_locked(*user_id),
        HostEvent::PackageRemoved { package, user_id } => engine.on_package_removed(package, *user_id),
        HostEvent::ClockChanged => Ok(()),
    });

    match task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Host event failed: {}", e),
        Err(e) => error!("Host event task panicked: {}", e),
    }
}

async fn deliver_alarm(engine: &Arc<PolicyStore>, user_id: UserId) {
    let engine = engine.clone();
    match tokio::task::spawn_blocking(move || engine.on_alarm(user_id)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Alarm for user {} failed: {}", user_id, e),
        Err(e) => error!("Alarm task for user {} panicked: {}", user_id, e),
    }
}

async fn check_clock(engine: &Arc<PolicyStore>) {
    let engine = engine.clone();
    match tokio::task::spawn_blocking(move || engine.on_clock_changed()).await {
        Ok(Ok(0)) => {}
        Ok(Ok(drift)) => info!("Adjusted profile budgets for a {} ms clock change", drift),
        Ok(Err(e)) => warn!("Clock check failed: {}", e),
        Err(e) => error!("Clock check task panicked: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use device_policy::model::UserInfo;
    use device_policy::platform::system::offline_collaborators;
    use device_policy::{EngineSettings, storage::MemoryBlobStore};

    #[test]
    fn parse_event_accepts_host_events() {
        assert_eq!(parse_event("unlocked 10").unwrap(), Some(HostEvent::ProfileUnlocked(10)));
        assert_eq!(parse_event("  locked 10 ").unwrap(), Some(HostEvent::ProfileLocked(10)));
        assert_eq!(
            parse_event("package-removed com.example.mdm 0").unwrap(),
            Some(HostEvent::PackageRemoved {
                package: "com.example.mdm".to_string(),
                user_id: 0
            })
        );
        assert_eq!(parse_event("clock-changed").unwrap(), Some(HostEvent::ClockChanged));
        assert_eq!(parse_event("").unwrap(), None);
        assert_eq!(parse_event("# comment").unwrap(), None);
    }

    #[test]
    fn parse_event_rejects_garbage() {
        assert!(parse_event("unlocked ten").is_err());
        assert!(parse_event("unlocked").is_err());
        assert!(parse_event("reboot 0").is_err());
    }

    #[tokio::test]
    async fn unlock_event_reaches_engine() {
        let engine = PolicyStore::open(
            EngineSettings::default(),
            vec![UserInfo::full(0), UserInfo::managed_profile(10, 0, false)],
            Arc::new(MemoryBlobStore::new()),
            offline_collaborators(),
        )
        .unwrap();
        let engine = Arc::new(engine);

        let event = parse_event("unlocked 10").unwrap().unwrap();
        deliver_event(&engine, event).await;
        assert!(engine.budget_status(10).unwrap().profile_on);

        deliver_event(&engine, HostEvent::ProfileLocked(10)).await;
        assert!(!engine.budget_status(10).unwrap().profile_on);
    }
}
