//! In-memory collaborators for tests

use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex};

use super::{
    AdminEvent, AdminNotifier, AlarmScheduler, Clock, Collaborators, DeviceLogKind, DeviceLogSink,
    LogAction, PackageSuspender, ProfileOffNotice, UserNotifier,
};
use crate::model::{ComponentName, UserId};

/// Manually driven clock
pub struct FakeClock {
    wall: AtomicI64,
    monotonic: AtomicI64,
}

impl FakeClock {
    pub fn new(wall: i64) -> Self {
        Self {
            wall: AtomicI64::new(wall),
            monotonic: AtomicI64::new(0),
        }
    }

    /// Let time pass on both clocks
    pub fn advance(&self, millis: i64) {
        self.wall.fetch_add(millis, Ordering::SeqCst);
        self.monotonic.fetch_add(millis, Ordering::SeqCst);
    }

    /// Move only the wall clock, like a user changing the time
    pub fn jump_wall(&self, millis: i64) {
        self.wall.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now_millis(&self) -> i64 {
        self.wall.load(Ordering::SeqCst)
    }

    fn monotonic_millis(&self) -> i64 {
        self.monotonic.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct RecordingAlarms {
    pub scheduled: Mutex<BTreeMap<UserId, i64>>,
}

impl RecordingAlarms {
    pub fn alarm_for(&self, user_id: UserId) -> Option<i64> {
        self.scheduled.lock().unwrap().get(&user_id).copied()
    }
}

impl AlarmScheduler for RecordingAlarms {
    fn schedule(&self, user_id: UserId, at_millis: i64) {
        self.scheduled.lock().unwrap().insert(user_id, at_millis);
    }

    fn cancel(&self, user_id: UserId) {
        self.scheduled.lock().unwrap().remove(&user_id);
    }
}

#[derive(Default)]
pub struct FakeSuspender {
    pub packages: Vec<String>,
    /// Packages whose suspension calls fail
    pub failing: Mutex<BTreeSet<String>>,
    pub suspended: Mutex<BTreeSet<String>>,
    pub calls: Mutex<Vec<(UserId, Vec<String>, bool)>>,
    /// Blocks the next call until the test releases it
    gate: Mutex<Option<(SyncSender<()>, Receiver<()>)>>,
}

impl FakeSuspender {
    pub fn with_packages(packages: &[&str]) -> Self {
        Self {
            packages: packages.iter().map(|package| package.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn fail_package(&self, package: &str) {
        self.failing.lock().unwrap().insert(package.to_string());
    }

    pub fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }

    pub fn suspended(&self) -> BTreeSet<String> {
        self.suspended.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Hold the next suspension call. Returns a receiver signalled once the
    /// call is blocked, and a sender that lets it continue.
    pub fn hold_next_call(&self) -> (Receiver<()>, SyncSender<()>) {
        let (entered_tx, entered_rx) = mpsc::sync_channel(1);
        let (release_tx, release_rx) = mpsc::sync_channel(1);
        *self.gate.lock().unwrap() = Some((entered_tx, release_rx));
        (entered_rx, release_tx)
    }
}

impl PackageSuspender for FakeSuspender {
    fn personal_packages(&self, _user_id: UserId) -> Result<Vec<String>> {
        Ok(self.packages.clone())
    }

    fn set_packages_suspended(
        &self,
        user_id: UserId,
        packages: &[String],
        suspended: bool,
    ) -> Vec<String> {
        let gate = self.gate.lock().unwrap().take();
        if let Some((entered, release)) = gate {
            entered.send(()).unwrap();
            release.recv().unwrap();
        }

        self.calls
            .lock()
            .unwrap()
            .push((user_id, packages.to_vec(), suspended));

        let failing = self.failing.lock().unwrap().clone();
        let mut current = self.suspended.lock().unwrap();
        let mut failed = Vec::new();
        for package in packages {
            if failing.contains(package) {
                failed.push(package.clone());
            } else if suspended {
                current.insert(package.clone());
            } else {
                current.remove(package);
            }
        }
        failed
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub admin_events: Mutex<Vec<(ComponentName, UserId, AdminEvent)>>,
    pub notices: Mutex<Vec<(UserId, Option<ProfileOffNotice>)>>,
}

impl RecordingNotifier {
    pub fn events_for(&self, package: &str) -> Vec<AdminEvent> {
        self.admin_events
            .lock()
            .unwrap()
            .iter()
            .filter(|(admin, _, _)| admin.package == package)
            .map(|(_, _, event)| event.clone())
            .collect()
    }

    /// Notice currently shown to a user
    pub fn current_notice(&self, user_id: UserId) -> Option<ProfileOffNotice> {
        self.notices
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(user, _)| *user == user_id)
            .and_then(|(_, notice)| *notice)
    }

    pub fn notice_count(&self) -> usize {
        self.notices.lock().unwrap().len()
    }
}

impl AdminNotifier for RecordingNotifier {
    fn send(&self, admin: &ComponentName, user_id: UserId, event: AdminEvent) {
        self.admin_events
            .lock()
            .unwrap()
            .push((admin.clone(), user_id, event));
    }
}

impl UserNotifier for RecordingNotifier {
    fn show(&self, user_id: UserId, notice: ProfileOffNotice) {
        self.notices.lock().unwrap().push((user_id, Some(notice)));
    }

    fn clear(&self, user_id: UserId) {
        self.notices.lock().unwrap().push((user_id, None));
    }
}

#[derive(Default)]
pub struct RecordingLogSink {
    pub actions: Mutex<Vec<(DeviceLogKind, LogAction)>>,
}

impl RecordingLogSink {
    pub fn actions(&self) -> Vec<(DeviceLogKind, LogAction)> {
        self.actions.lock().unwrap().clone()
    }

    pub fn count(&self, action: LogAction) -> usize {
        self.actions
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, recorded)| *recorded == action)
            .count()
    }

    pub fn reset(&self) {
        self.actions.lock().unwrap().clear();
    }
}

impl DeviceLogSink for RecordingLogSink {
    fn control(&self, kind: DeviceLogKind, action: LogAction) {
        self.actions.lock().unwrap().push((kind, action));
    }
}

/// Every fake, kept typed so tests can inspect them
pub struct Fakes {
    pub clock: Arc<FakeClock>,
    pub alarms: Arc<RecordingAlarms>,
    pub suspender: Arc<FakeSuspender>,
    pub notifier: Arc<RecordingNotifier>,
    pub log_sink: Arc<RecordingLogSink>,
}

impl Fakes {
    pub fn new(wall: i64) -> Self {
        Self {
            clock: Arc::new(FakeClock::new(wall)),
            alarms: Arc::new(RecordingAlarms::default()),
            suspender: Arc::new(FakeSuspender::with_packages(&["com.game", "com.social"])),
            notifier: Arc::new(RecordingNotifier::default()),
            log_sink: Arc::new(RecordingLogSink::default()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            clock: self.clock.clone(),
            alarms: self.alarms.clone(),
            suspender: self.suspender.clone(),
            admin_notifier: self.notifier.clone(),
            user_notifier: self.notifier.clone(),
            log_sink: self.log_sink.clone(),
        }
    }
}
