/// Host collaborators of the policy engine
///
/// The engine never talks to the operating system directly. Time, alarms,
/// package suspension, notifications and device-wide log collection are
/// reached through the traits below; `system` holds the backends used by the
/// daemon.
pub mod common;
pub mod system;

#[cfg(test)]
pub mod testing;

use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::model::{ComponentName, UserId};

/// Wall and monotonic time, both in milliseconds
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
    fn monotonic_millis(&self) -> i64;
}

/// One-shot alarms, at most one per user
pub trait AlarmScheduler: Send + Sync {
    /// Fire at wall time `at_millis`, replacing any alarm for the user
    fn schedule(&self, user_id: UserId, at_millis: i64);
    fn cancel(&self, user_id: UserId);
}

pub trait PackageSuspender: Send + Sync {
    /// Personal packages of a user that are subject to suspension
    fn personal_packages(&self, user_id: UserId) -> Result<Vec<String>>;

    /// Suspend or unsuspend packages. Returns the packages that failed.
    fn set_packages_suspended(
        &self,
        user_id: UserId,
        packages: &[String],
        suspended: bool,
    ) -> Vec<String>;
}

/// Events delivered to admin components
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AdminEvent {
    Enabled,
    Disabled,
    TransferOwnershipComplete {
        extras: Option<BTreeMap<String, serde_json::Value>>,
    },
    PasswordFailed {
        attempts: u32,
    },
    PasswordSucceeded,
    LockTaskPackagesCleared,
    PersonalAppsSuspended {
        suspended: bool,
    },
}

/// Fire-and-forget delivery to admin components
pub trait AdminNotifier: Send + Sync {
    fn send(&self, admin: &ComponentName, user_id: UserId, event: AdminEvent);
}

/// Notices shown to the user about a profile that is turned off
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileOffNotice {
    /// Personal apps will be suspended at `deadline`
    Warning { deadline: i64 },
    Suspended,
}

pub trait UserNotifier: Send + Sync {
    fn show(&self, user_id: UserId, notice: ProfileOffNotice);
    fn clear(&self, user_id: UserId);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceLogKind {
    Security,
    Network,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogAction {
    Enable,
    Disable,
    /// Stop collecting, keep buffered entries
    Pause,
    Resume,
    /// Drop buffered entries
    Discard,
}

/// Device-wide log collection
pub trait DeviceLogSink: Send + Sync {
    fn control(&self, kind: DeviceLogKind, action: LogAction);
}

/// Every collaborator the engine needs
#[derive(Clone)]
pub struct Collaborators {
    pub clock: Arc<dyn Clock>,
    pub alarms: Arc<dyn AlarmScheduler>,
    pub suspender: Arc<dyn PackageSuspender>,
    pub admin_notifier: Arc<dyn AdminNotifier>,
    pub user_notifier: Arc<dyn UserNotifier>,
    pub log_sink: Arc<dyn DeviceLogSink>,
}
