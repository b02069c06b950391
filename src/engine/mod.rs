// The policy engine handle
//
// `PolicyStore` owns the in-memory policy state behind one lock. Every
// operation mutates state while holding the lock, stages the blobs it
// dirtied, and then persists them and talks to the host collaborators with
// the lock released.

mod admins;
mod owners;
mod profile_budget;
mod users;

#[cfg(test)]
pub(crate) mod test_support;

pub use admins::{PolicyChange, WipeDecision, WipeScope};
pub use owners::LoggingStatus;
pub use profile_budget::BudgetStatus;

use anyhow::{Context, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::access::{self, CallerIdentity, CapabilitySet, Operation};
use crate::affiliation::AffiliationSnapshot;
use crate::error::{PolicyError, PolicyResult};
use crate::model::{
    ActiveAdmin, ComponentName, OwnerRegistry, UserId, UserInfo, UserPolicyData,
};
use crate::platform::{
    AdminEvent, Collaborators, DeviceLogKind, LogAction, ProfileOffNotice,
};
use crate::resolver::{PolicyView, ResolutionCache, ResolvedPolicy};
use crate::storage::{BlobKey, BlobStore, OrderedWriter, PendingWrite, decode_snapshot, encode_snapshot};
use crate::time_budget::ClockAnchor;
use crate::transfer::{self, ApplyOutcome};

/// Engine tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    /// How long before a budget deadline the warning appears
    pub warning_period_millis: i64,
    /// Wall-clock drift below this is ignored
    pub clock_jump_tolerance_millis: i64,
    /// Re-arm alarms and apply suspension for stored budgets on open. Off
    /// for one-shot inspection, which must not touch the device.
    pub reconcile_budgets: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            warning_period_millis: 24 * 60 * 60 * 1000,
            clock_jump_tolerance_millis: 5_000,
            reconcile_budgets: true,
        }
    }
}

/// Side effects collected under the lock and run after it is released
#[derive(Debug, Clone, PartialEq)]
enum Effect {
    Notify {
        admin: ComponentName,
        user_id: UserId,
        event: AdminEvent,
    },
    ScheduleAlarm {
        user_id: UserId,
        at: i64,
    },
    CancelAlarm(UserId),
    ShowNotice(UserId, ProfileOffNotice),
    ClearNotice(UserId),
    DeviceLog(DeviceLogKind, LogAction),
    /// Bring personal-app suspension of a profile's parent in line
    Suspension {
        profile: UserId,
        personal_user: UserId,
        suspend: bool,
        /// Packages to unsuspend; suspension queries the suspender instead
        packages: Vec<String>,
    },
}

struct EngineState {
    users: BTreeMap<UserId, UserInfo>,
    data: BTreeMap<UserId, UserPolicyData>,
    owners: OwnerRegistry,
    cache: ResolutionCache,
    /// Managed profiles currently turned on and unlocked
    profiles_on: BTreeSet<UserId>,
    clock_anchor: ClockAnchor,
    affiliation: AffiliationSnapshot,
    dirty: BTreeSet<BlobKey>,
    effects: Vec<Effect>,
}

impl EngineState {
    fn view(&self) -> PolicyView<'_> {
        PolicyView {
            users: &self.users,
            data: &self.data,
        }
    }

    fn user(&self, user_id: UserId) -> PolicyResult<&UserInfo> {
        self.users
            .get(&user_id)
            .ok_or(PolicyError::UnknownUser(user_id))
    }

    fn data_mut(&mut self, user_id: UserId) -> &mut UserPolicyData {
        self.dirty.insert(BlobKey::User(user_id));
        self.data.entry(user_id).or_default()
    }

    fn admin(&self, component: &ComponentName, user_id: UserId) -> PolicyResult<&ActiveAdmin> {
        self.data
            .get(&user_id)
            .and_then(|data| data.admin(component))
            .ok_or_else(|| PolicyError::UnknownAdmin {
                component: component.clone(),
                user_id,
            })
    }

    fn admin_mut(
        &mut self,
        component: &ComponentName,
        user_id: UserId,
    ) -> PolicyResult<&mut ActiveAdmin> {
        if self.admin(component, user_id).is_err() {
            return Err(PolicyError::UnknownAdmin {
                component: component.clone(),
                user_id,
            });
        }
        self.data_mut(user_id)
            .admin_mut(component)
            .ok_or_else(|| PolicyError::UnknownAdmin {
                component: component.clone(),
                user_id,
            })
    }

    fn group_of(&self, user_id: UserId) -> UserId {
        self.users
            .get(&user_id)
            .map(UserInfo::group_id)
            .unwrap_or(user_id)
    }

    /// Drop cached resolutions for the group `user_id` belongs to
    fn invalidate(&mut self, user_id: UserId) {
        let group = self.group_of(user_id);
        self.cache.invalidate_group(&self.users, group);
    }

    fn owners_changed(&mut self) {
        self.dirty.insert(BlobKey::Owners);
    }

    fn emit(&mut self, effect: Effect) {
        self.effects.push(effect);
    }

    fn notify(&mut self, admin: &ComponentName, user_id: UserId, event: AdminEvent) {
        self.emit(Effect::Notify {
            admin: admin.clone(),
            user_id,
            event,
        });
    }

    /// Resolve the caller's capabilities and check them against `operation`
    fn authorize(&self, caller: &CallerIdentity, operation: Operation) -> PolicyResult<CapabilitySet> {
        let affiliated = self.affiliation.is_affiliated(caller.user_id);
        let capabilities = access::resolve_capabilities(
            caller,
            &self.owners,
            self.data.get(&caller.user_id),
            affiliated,
        );
        operation.check(caller, &capabilities)?;
        Ok(capabilities)
    }

    /// Component the caller acts as, required for admin operations
    fn caller_component<'a>(&self, caller: &'a CallerIdentity) -> PolicyResult<&'a ComponentName> {
        caller
            .component
            .as_ref()
            .ok_or_else(|| PolicyError::InvalidArgument("caller has no admin component".to_string()))
    }
}

/// Engine handle, shared by `Arc`
pub struct PolicyStore {
    state: Mutex<EngineState>,
    writer: OrderedWriter,
    store: Arc<dyn BlobStore>,
    collab: Collaborators,
    settings: EngineSettings,
    /// Held for a whole transfer; the journal has room for one entry
    transfer_lock: Mutex<()>,
}

fn load_blob<T: serde::de::DeserializeOwned>(
    store: &dyn BlobStore,
    key: BlobKey,
    what: &str,
) -> Result<Option<T>> {
    match store.load(key)? {
        Some(blob) => decode_snapshot(&blob, what)
            .with_context(|| format!("Failed to load {}", key.file_name())),
        None => Ok(None),
    }
}

impl PolicyStore {
    /// Recover any interrupted transfer, load persisted state for `users`
    /// and bring alarms, notices and suspension in line with it.
    pub fn open(
        settings: EngineSettings,
        users: Vec<UserInfo>,
        store: Arc<dyn BlobStore>,
        collab: Collaborators,
    ) -> Result<Self> {
        let recovery = transfer::recover_pending(store.as_ref())
            .context("Failed to recover pending ownership transfer")?;

        let users: BTreeMap<UserId, UserInfo> =
            users.into_iter().map(|user| (user.id, user)).collect();

        let mut owners: OwnerRegistry =
            load_blob(store.as_ref(), BlobKey::Owners, "owners")?.unwrap_or_default();

        let mut data = BTreeMap::new();
        for user_id in users.keys() {
            if let Some(user_data) = load_blob::<UserPolicyData>(store.as_ref(), BlobKey::User(*user_id), "user")? {
                data.insert(*user_id, user_data);
            }
        }

        for key in store.keys()? {
            if let BlobKey::User(user_id) = key {
                if !users.contains_key(&user_id) {
                    warn!("Ignoring state for user {} which is not on this device", user_id);
                }
            }
        }

        let mut dirty = BTreeSet::new();
        let stale: Vec<_> = owners
            .device_owner
            .iter()
            .chain(owners.profile_owners.values())
            .filter(|owner| {
                !users.contains_key(&owner.user_id)
                    || !data
                        .get(&owner.user_id)
                        .is_some_and(|user_data: &UserPolicyData| user_data.has_admin(&owner.admin))
            })
            .map(|owner| (owner.role, owner.user_id, owner.admin.clone()))
            .collect();
        for (role, user_id, admin) in stale {
            warn!(
                "Dropping {:?} assignment of {} on user {}: admin is not active",
                role, admin, user_id
            );
            owners.clear(role, user_id);
            dirty.insert(BlobKey::Owners);
        }

        let affiliation = AffiliationSnapshot::compute(users.keys(), &owners, &data);
        let clock_anchor = ClockAnchor::new(collab.clock.now_millis(), collab.clock.monotonic_millis());

        let engine = Self {
            state: Mutex::new(EngineState {
                users,
                data,
                owners,
                cache: ResolutionCache::default(),
                profiles_on: BTreeSet::new(),
                clock_anchor,
                affiliation,
                dirty,
                effects: Vec::new(),
            }),
            writer: OrderedWriter::new(),
            store,
            collab,
            settings,
            transfer_lock: Mutex::new(()),
        };

        engine
            .mutate(|state| {
                if let Some(report) = &recovery {
                    if let ApplyOutcome::Applied { .. } = report.outcome {
                        let extras = state
                            .data
                            .get(&report.entry.user_id)
                            .and_then(|data| data.transfer_extras.clone());
                        state.notify(
                            &report.entry.target,
                            report.entry.user_id,
                            AdminEvent::TransferOwnershipComplete { extras },
                        );
                    }
                }

                Self::announce_logging_state(state);
                if !engine.settings.reconcile_budgets {
                    return Ok(());
                }

                let now = engine.collab.clock.now_millis();
                let profiles: Vec<UserId> = state
                    .users
                    .values()
                    .filter(|user| user.managed_profile)
                    .map(|user| user.id)
                    .collect();
                for profile in profiles {
                    engine.evaluate_budget(state, profile, now, true);
                }
                Ok(())
            })
            .context("Failed to initialise policy state")?;

        let state = engine.lock()?;
        info!(
            "Policy engine ready: {} users, {} owners",
            state.users.len(),
            state.owners.owner_count()
        );
        drop(state);

        Ok(engine)
    }

    pub fn settings(&self) -> EngineSettings {
        self.settings
    }

    fn lock(&self) -> PolicyResult<MutexGuard<'_, EngineState>> {
        self.state.lock().map_err(|_| PolicyError::LockPoisoned)
    }

    /// Run `f` under the lock, then persist and run effects without it.
    ///
    /// An `Err` from `f` must leave the state untouched. Persistence errors
    /// surface as `PolicyError::Storage` after the in-memory state changed.
    fn mutate<T, F>(&self, f: F) -> PolicyResult<T>
    where
        F: FnOnce(&mut EngineState) -> PolicyResult<T>,
    {
        let (result, writes, effects) = {
            let mut guard = self.lock()?;
            let state = &mut *guard;
            let result = f(state);
            let writes = self.stage_writes(state);
            let effects = std::mem::take(&mut state.effects);
            (result, writes, effects)
        };

        let persisted = writes.and_then(|writes| {
            self.writer
                .commit_all(self.store.as_ref(), &writes)
                .map_err(PolicyError::Storage)
        });
        self.run_effects(effects);

        let value = result?;
        persisted?;
        Ok(value)
    }

    fn stage_writes(&self, state: &mut EngineState) -> PolicyResult<Vec<PendingWrite>> {
        let mut writes = Vec::new();
        for key in std::mem::take(&mut state.dirty) {
            let blob = match key {
                BlobKey::Owners => Some(encode_snapshot(&state.owners)?),
                BlobKey::User(user_id) => match state.data.get(&user_id) {
                    Some(data) => Some(encode_snapshot(data)?),
                    None => None,
                },
                BlobKey::TransferJournal => continue,
            };
            writes.push(self.writer.stage(key, blob));
        }
        Ok(writes)
    }

    fn run_effects(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Notify {
                    admin,
                    user_id,
                    event,
                } => self.collab.admin_notifier.send(&admin, user_id, event),
                Effect::ScheduleAlarm { user_id, at } => self.collab.alarms.schedule(user_id, at),
                Effect::CancelAlarm(user_id) => self.collab.alarms.cancel(user_id),
                Effect::ShowNotice(user_id, notice) => {
                    self.collab.user_notifier.show(user_id, notice)
                }
                Effect::ClearNotice(user_id) => self.collab.user_notifier.clear(user_id),
                Effect::DeviceLog(kind, action) => self.collab.log_sink.control(kind, action),
                Effect::Suspension {
                    profile,
                    personal_user,
                    suspend,
                    packages,
                } => self.apply_suspension(profile, personal_user, suspend, packages),
            }
        }
    }

    /// Call the suspender without the lock, then record the outcome.
    ///
    /// The profile may have been unlocked or locked while the call was in
    /// flight, so the budget is evaluated again and a corrective call
    /// follows when the recorded state no longer matches.
    fn apply_suspension(&self, profile: UserId, personal_user: UserId, suspend: bool, packages: Vec<String>) {
        let packages = if suspend {
            match self.collab.suspender.personal_packages(personal_user) {
                Ok(packages) => packages,
                Err(e) => {
                    warn!("Could not list personal packages of user {}: {:#}", personal_user, e);
                    Vec::new()
                }
            }
        } else {
            packages
        };

        let failed = self
            .collab
            .suspender
            .set_packages_suspended(personal_user, &packages, suspend);
        if !failed.is_empty() {
            warn!(
                "{} of {} packages could not be {} for user {}",
                failed.len(),
                packages.len(),
                if suspend { "suspended" } else { "unsuspended" },
                personal_user
            );
        }

        let result = self.mutate(|state| {
            if !state.users.contains_key(&profile) {
                return Ok(());
            }
            let budget = &mut state.data_mut(profile).time_budget;
            let was_suspended = budget.apps_suspended;
            budget.commit_suspension(suspend, &packages, failed);

            if was_suspended != suspend {
                if let Some(owner) = state.owners.profile_owner(profile).map(|owner| owner.admin.clone()) {
                    state.notify(&owner, profile, AdminEvent::PersonalAppsSuspended { suspended: suspend });
                }
            }

            let now = self.collab.clock.now_millis();
            self.evaluate_budget(state, profile, now, false);
            Ok(())
        });

        if let Err(e) = result {
            warn!("Failed to record suspension state of user {}: {}", profile, e);
        }
    }

    /// Re-derive affiliation; pause or resume device logs and clear lock-task
    /// packages of users that lost affiliation
    fn refresh_affiliation(state: &mut EngineState) {
        let after = AffiliationSnapshot::compute(state.users.keys(), &state.owners, &state.data);
        let transition = crate::affiliation::GateTransition::between(&state.affiliation, &after);
        state.affiliation = after;

        if let Some(action) = transition.logging {
            info!("Device-wide logging {:?}: all users affiliated = {}", action, state.affiliation.all_affiliated);
            for kind in [DeviceLogKind::Security, DeviceLogKind::Network] {
                state.emit(Effect::DeviceLog(kind, action));
            }
        }

        for user_id in transition.lost {
            if !state.users.contains_key(&user_id) {
                continue;
            }
            let has_packages = state
                .data
                .get(&user_id)
                .is_some_and(|data| !data.lock_task_packages.is_empty());
            if has_packages {
                info!("User {} lost affiliation; clearing lock task packages", user_id);
                state.data_mut(user_id).lock_task_packages.clear();
                if let Some(owner) = state.owners.owner_of(user_id).map(|owner| owner.admin.clone()) {
                    state.notify(&owner, user_id, AdminEvent::LockTaskPackagesCleared);
                }
            }
        }
    }

    fn announce_logging_state(state: &mut EngineState) {
        let gate = if state.affiliation.all_affiliated {
            LogAction::Resume
        } else {
            LogAction::Pause
        };
        let status = owners::logging_flags(state);
        for (kind, enabled) in [
            (DeviceLogKind::Security, status.0),
            (DeviceLogKind::Network, status.1),
        ] {
            state.emit(Effect::DeviceLog(kind, if enabled { LogAction::Enable } else { LogAction::Disable }));
            state.emit(Effect::DeviceLog(kind, gate));
        }
    }

    // Reads. All return owned snapshots.

    /// Resolved policy for `user_id`; with `parent` on a managed profile,
    /// the parent's policy
    pub fn resolve(&self, user_id: UserId, parent: bool) -> PolicyResult<ResolvedPolicy> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        state.user(user_id)?;

        let view = PolicyView {
            users: &state.users,
            data: &state.data,
        };
        let resolved = state.cache.get_or_resolve(view, user_id, parent);
        debug!("Resolved quality {:?} for user {}", resolved.password_quality, user_id);
        Ok(resolved)
    }

    pub fn users(&self) -> PolicyResult<Vec<UserInfo>> {
        Ok(self.lock()?.users.values().cloned().collect())
    }

    pub fn owners(&self) -> PolicyResult<OwnerRegistry> {
        Ok(self.lock()?.owners.clone())
    }

    pub fn admins(&self, user_id: UserId) -> PolicyResult<Vec<ActiveAdmin>> {
        let state = self.lock()?;
        state.user(user_id)?;
        Ok(state
            .data
            .get(&user_id)
            .map(|data| data.admins.clone())
            .unwrap_or_default())
    }

    pub fn user_data(&self, user_id: UserId) -> PolicyResult<UserPolicyData> {
        let state = self.lock()?;
        state.user(user_id)?;
        Ok(state.data.get(&user_id).cloned().unwrap_or_default())
    }

    pub fn is_user_affiliated(&self, user_id: UserId) -> PolicyResult<bool> {
        let state = self.lock()?;
        state.user(user_id)?;
        Ok(state.affiliation.is_affiliated(user_id))
    }

    pub fn all_users_affiliated(&self) -> PolicyResult<bool> {
        Ok(self.lock()?.affiliation.all_affiliated)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::model::{OwnerRole, PasswordQuality};
    use crate::storage::MemoryBlobStore;
    use crate::transfer::TransferJournalEntry;

    #[test]
    fn open_on_empty_store_has_no_policy() {
        let harness = Harness::new(&[UserInfo::full(0)]);
        let resolved = harness.engine.resolve(0, false).unwrap();
        assert_eq!(resolved, ResolvedPolicy::default());
        assert!(matches!(
            harness.engine.resolve(42, false),
            Err(PolicyError::UnknownUser(42))
        ));
    }

    #[test]
    fn state_survives_reopen() {
        let harness = Harness::with_device_owner();
        harness
            .engine
            .set_admin_policy(&harness.do_caller(), false, PolicyChange::PasswordQuality(PasswordQuality::Complex))
            .unwrap();
        let before = harness.engine.user_data(0).unwrap();

        let reopened = harness.reopen();
        assert_eq!(reopened.engine.user_data(0).unwrap(), before);
        assert!(reopened.engine.owners().unwrap().is_device_owner(&do_component(), 0));
        assert_eq!(
            reopened.engine.resolve(0, false).unwrap().password_quality,
            PasswordQuality::Complex
        );
    }

    #[test]
    fn open_drops_owner_without_active_admin() {
        let store = Arc::new(MemoryBlobStore::new());
        let mut owners = OwnerRegistry::default();
        owners.assign(crate::model::OwnerAssignment {
            role: OwnerRole::DeviceOwner,
            admin: do_component(),
            user_id: 0,
            organization_owned: false,
        });
        store.store(BlobKey::Owners, &encode_snapshot(&owners).unwrap()).unwrap();

        let harness = Harness::open_with(store, &[UserInfo::full(0)]);
        assert_eq!(harness.engine.owners().unwrap().owner_count(), 0);
    }

    #[test]
    fn crash_during_transfer_leaves_exactly_one_owner() {
        // Count the writes a full transfer makes
        let dry_run = Harness::with_device_owner();
        let writes_before = dry_run.store.write_count();
        dry_run
            .engine
            .transfer_ownership(&dry_run.do_caller(), &target_component(), None)
            .unwrap();
        let total_writes = dry_run.store.write_count() - writes_before;
        assert!(total_writes >= 3);

        for allowed in 0..=total_writes {
            let harness = Harness::with_device_owner();
            harness.store.fail_after(allowed);
            let _ = harness
                .engine
                .transfer_ownership(&harness.do_caller(), &target_component(), None);
            harness.store.heal();

            let reopened = harness.reopen();
            let owners = reopened.engine.owners().unwrap();
            assert_eq!(owners.owner_count(), 1, "after {} writes", allowed);
            let owner = owners.device_owner().unwrap();
            assert!(
                owner.admin == do_component() || owner.admin == target_component(),
                "unexpected owner {}",
                owner.admin
            );
            assert!(!reopened.store.contains(BlobKey::TransferJournal));

            // The owner in the registry is an active admin
            let admins = reopened.engine.admins(0).unwrap();
            assert!(admins.iter().any(|admin| admin.component() == &owner.admin));
        }
    }

    #[test]
    fn pending_journal_replayed_on_open_and_target_notified() {
        let harness = Harness::with_device_owner();
        let entry = TransferJournalEntry::new(do_component(), target_component(), 0, OwnerRole::DeviceOwner);
        harness
            .store
            .store(BlobKey::TransferJournal, &encode_snapshot(&entry).unwrap())
            .unwrap();

        let reopened = harness.reopen();
        assert!(reopened.engine.owners().unwrap().is_device_owner(&target_component(), 0));
        assert!(!reopened.store.contains(BlobKey::TransferJournal));
        assert!(reopened
            .fakes
            .notifier
            .events_for("com.example.next")
            .iter()
            .any(|event| matches!(event, AdminEvent::TransferOwnershipComplete { .. })));
    }

    #[test]
    fn pending_journal_to_uninstalled_target_keeps_source() {
        let harness = Harness::with_device_owner();
        let gone = ComponentName::new("com.example.gone", "com.example.gone.AdminReceiver");
        let entry = TransferJournalEntry::new(do_component(), gone, 0, OwnerRole::DeviceOwner);
        harness
            .store
            .store(BlobKey::TransferJournal, &encode_snapshot(&entry).unwrap())
            .unwrap();

        let reopened = harness.reopen();
        let owners = reopened.engine.owners().unwrap();
        assert!(owners.is_device_owner(&do_component(), 0));
        assert_eq!(owners.owner_count(), 1);
        assert!(!reopened.store.contains(BlobKey::TransferJournal));
        assert!(reopened.fakes.notifier.events_for("com.example.gone").is_empty());
        assert!(!reopened
            .fakes
            .notifier
            .events_for("com.example.mdm")
            .iter()
            .any(|event| matches!(event, AdminEvent::TransferOwnershipComplete { .. })));
    }

    #[test]
    fn storage_failure_keeps_memory_state() {
        let harness = Harness::with_device_owner();
        harness.store.fail_after(0);

        let result = harness.engine.set_admin_policy(
            &harness.do_caller(),
            false,
            PolicyChange::MaxFailedAttempts(5),
        );
        assert!(matches!(result, Err(PolicyError::Storage(_))));
        assert_eq!(
            harness.engine.resolve(0, false).unwrap().max_failed_attempts_before_wipe,
            5
        );
    }
}
