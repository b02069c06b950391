//! Collaborator backends used by the daemon

use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    AdminEvent, AdminNotifier, AlarmScheduler, Clock, Collaborators, DeviceLogKind, DeviceLogSink,
    LogAction, PackageSuspender, ProfileOffNotice, UserNotifier,
};
use crate::config::{Config, SuspensionConfig};
use crate::model::{ComponentName, UserId};

/// Wall time from chrono, monotonic time from a process-local `Instant`
pub struct SystemClock {
    base: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }

    fn monotonic_millis(&self) -> i64 {
        i64::try_from(self.base.elapsed().as_millis()).unwrap_or(i64::MAX)
    }
}

/// Alarms as sleeping tokio tasks. A fired alarm sends its user id down the
/// channel handed out by `new`.
pub struct TokioAlarmScheduler {
    runtime: Handle,
    clock: Arc<dyn Clock>,
    fired: mpsc::UnboundedSender<UserId>,
    pending: Mutex<HashMap<UserId, JoinHandle<()>>>,
}

impl TokioAlarmScheduler {
    /// Must be called from inside a tokio runtime
    pub fn new(clock: Arc<dyn Clock>) -> Result<(Self, mpsc::UnboundedReceiver<UserId>)> {
        let runtime = Handle::try_current().context("Alarm scheduler needs a tokio runtime")?;
        let (fired, receiver) = mpsc::unbounded_channel();

        Ok((
            Self {
                runtime,
                clock,
                fired,
                pending: Mutex::new(HashMap::new()),
            },
            receiver,
        ))
    }
}

impl AlarmScheduler for TokioAlarmScheduler {
    fn schedule(&self, user_id: UserId, at_millis: i64) {
        let delay = at_millis.saturating_sub(self.clock.now_millis()).max(0);
        let delay = Duration::from_millis(u64::try_from(delay).unwrap_or(0));
        let fired = self.fired.clone();

        debug!("Scheduling alarm for user {} in {:?}", user_id, delay);

        let task = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if fired.send(user_id).is_err() {
                debug!("Alarm for user {} fired after the receiver closed", user_id);
            }
        });

        if let Ok(mut pending) = self.pending.lock() {
            if let Some(previous) = pending.insert(user_id, task) {
                previous.abort();
            }
        }
    }

    fn cancel(&self, user_id: UserId) {
        if let Ok(mut pending) = self.pending.lock() {
            if let Some(task) = pending.remove(&user_id) {
                debug!("Cancelled alarm for user {}", user_id);
                task.abort();
            }
        }
    }
}

/// Reports a fixed package list and only logs suspension changes
pub struct LogSuspender {
    packages: Vec<String>,
}

impl LogSuspender {
    pub fn new(packages: Vec<String>) -> Self {
        Self { packages }
    }
}

impl PackageSuspender for LogSuspender {
    fn personal_packages(&self, _user_id: UserId) -> Result<Vec<String>> {
        Ok(self.packages.clone())
    }

    fn set_packages_suspended(
        &self,
        user_id: UserId,
        packages: &[String],
        suspended: bool,
    ) -> Vec<String> {
        for package in packages {
            info!(
                "{} {} for user {}",
                if suspended { "Suspending" } else { "Unsuspending" },
                package,
                user_id
            );
        }
        Vec::new()
    }
}

/// Delegates to an external package tool
pub struct CommandSuspender {
    program: String,
    list_args: Vec<String>,
    suspend_args: Vec<String>,
    unsuspend_args: Vec<String>,
}

impl CommandSuspender {
    pub fn new(
        program: String,
        list_args: Vec<String>,
        suspend_args: Vec<String>,
        unsuspend_args: Vec<String>,
    ) -> Self {
        Self {
            program,
            list_args,
            suspend_args,
            unsuspend_args,
        }
    }
}

fn expand_args(templates: &[String], user_id: UserId, package: Option<&str>) -> Vec<String> {
    templates
        .iter()
        .map(|arg| {
            let arg = arg.replace("{user}", &user_id.to_string());
            match package {
                Some(package) => arg.replace("{package}", package),
                None => arg,
            }
        })
        .collect()
}

impl PackageSuspender for CommandSuspender {
    fn personal_packages(&self, user_id: UserId) -> Result<Vec<String>> {
        let args = expand_args(&self.list_args, user_id, None);
        let output = super::common::run_command(&self.program, &args)?;

        Ok(output
            .lines()
            .map(str::trim)
            .map(|line| line.strip_prefix("package:").unwrap_or(line))
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn set_packages_suspended(
        &self,
        user_id: UserId,
        packages: &[String],
        suspended: bool,
    ) -> Vec<String> {
        let templates = if suspended {
            &self.suspend_args
        } else {
            &self.unsuspend_args
        };

        let mut failed = Vec::new();
        for package in packages {
            let args = expand_args(templates, user_id, Some(package));
            if let Err(e) = super::common::run_command(&self.program, &args) {
                warn!("Failed to change suspension of {}: {:#}", package, e);
                failed.push(package.clone());
            }
        }
        failed
    }
}

/// Build the suspension backend selected by configuration
pub fn build_suspender(config: &SuspensionConfig) -> Arc<dyn PackageSuspender> {
    match config {
        SuspensionConfig::Log { packages } => Arc::new(LogSuspender::new(packages.clone())),
        SuspensionConfig::Command {
            program,
            list_args,
            suspend_args,
            unsuspend_args,
        } => Arc::new(CommandSuspender::new(
            program.clone(),
            list_args.clone(),
            suspend_args.clone(),
            unsuspend_args.clone(),
        )),
    }
}

/// Writes admin events to the log
pub struct LogAdminNotifier;

impl AdminNotifier for LogAdminNotifier {
    fn send(&self, admin: &ComponentName, user_id: UserId, event: AdminEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => info!("Admin event for {} on user {}: {}", admin, user_id, json),
            Err(_) => info!("Admin event for {} on user {}: {:?}", admin, user_id, event),
        }
    }
}

pub struct LogUserNotifier;

impl UserNotifier for LogUserNotifier {
    fn show(&self, user_id: UserId, notice: ProfileOffNotice) {
        match notice {
            ProfileOffNotice::Warning { deadline } => {
                let at = chrono::DateTime::from_timestamp_millis(deadline)
                    .map(|time| time.to_rfc3339())
                    .unwrap_or_else(|| deadline.to_string());
                warn!(
                    "User {}: personal apps will be suspended at {} unless the work profile is turned on",
                    user_id, at
                );
            }
            ProfileOffNotice::Suspended => {
                warn!("User {}: personal apps are suspended", user_id);
            }
        }
    }

    fn clear(&self, user_id: UserId) {
        debug!("User {}: profile-off notice cleared", user_id);
    }
}

pub struct LogDeviceLogSink;

impl DeviceLogSink for LogDeviceLogSink {
    fn control(&self, kind: DeviceLogKind, action: LogAction) {
        info!("Device {:?} log: {:?}", kind, action);
    }
}

/// Collaborators for the daemon, plus the channel fired alarms arrive on
pub fn system_collaborators(
    config: &Config,
) -> Result<(Collaborators, mpsc::UnboundedReceiver<UserId>)> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let (alarms, fired) = TokioAlarmScheduler::new(clock.clone())?;

    let collaborators = Collaborators {
        clock,
        alarms: Arc::new(alarms),
        suspender: build_suspender(&config.suspension),
        admin_notifier: Arc::new(LogAdminNotifier),
        user_notifier: Arc::new(LogUserNotifier),
        log_sink: Arc::new(LogDeviceLogSink),
    };

    Ok((collaborators, fired))
}

/// Collaborators for one-shot commands. They never wait for alarms and
/// never suspend packages.
pub fn offline_collaborators() -> Collaborators {
    Collaborators {
        clock: Arc::new(SystemClock::new()),
        alarms: Arc::new(NoAlarms),
        suspender: Arc::new(NoSuspension),
        admin_notifier: Arc::new(LogAdminNotifier),
        user_notifier: Arc::new(LogUserNotifier),
        log_sink: Arc::new(LogDeviceLogSink),
    }
}

/// Drops alarms; the daemon re-arms them on its next start
struct NoAlarms;

impl AlarmScheduler for NoAlarms {
    fn schedule(&self, user_id: UserId, at_millis: i64) {
        debug!("Not scheduling alarm for user {} at {} (offline)", user_id, at_millis);
    }

    fn cancel(&self, _user_id: UserId) {}
}

/// Leaves packages alone; the daemon reconciles suspension on its next start
struct NoSuspension;

impl PackageSuspender for NoSuspension {
    fn personal_packages(&self, _user_id: UserId) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn set_packages_suspended(
        &self,
        user_id: UserId,
        packages: &[String],
        suspended: bool,
    ) -> Vec<String> {
        debug!(
            "Not changing suspension of {} packages for user {} to {} (offline)",
            packages.len(),
            user_id,
            suspended
        );
        packages.to_vec()
    }
}
