use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

use super::{Effect, EngineState, PolicyStore};
use crate::access::{Capability, CallerIdentity, Operation};
use crate::error::{PolicyError, PolicyResult};
use crate::model::{ComponentName, OwnerAssignment, OwnerRole, UserId};
use crate::platform::{AdminEvent, DeviceLogKind, LogAction};
use crate::storage::{BlobKey, encode_snapshot};
use crate::transfer::{self, TransferJournalEntry};

/// Device-wide logging as configured and as actually collected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LoggingStatus {
    pub security_enabled: bool,
    pub network_enabled: bool,
    pub all_users_affiliated: bool,
    pub security_collecting: bool,
    pub network_collecting: bool,
}

/// Security and network logging flags of the device owner
pub(super) fn logging_flags(state: &EngineState) -> (bool, bool) {
    state
        .owners
        .device_owner()
        .and_then(|owner| state.admin(&owner.admin, owner.user_id).ok())
        .map(|admin| (admin.security_logging_enabled, admin.network_logging_enabled))
        .unwrap_or((false, false))
}

impl PolicyStore {
    pub fn set_device_owner(
        &self,
        caller: &CallerIdentity,
        component: &ComponentName,
        user_id: UserId,
    ) -> PolicyResult<()> {
        self.mutate(|state| {
            state.authorize(caller, Operation::SetDeviceOwner)?;
            state.user(user_id)?;
            state.admin(component, user_id)?;

            if let Some(existing) = state.owners.device_owner() {
                return Err(PolicyError::Precondition(format!(
                    "device owner already set to {} on user {}",
                    existing.admin, existing.user_id
                )));
            }
            if let Some(profile) = state.users.values().find(|user| user.managed_profile) {
                return Err(PolicyError::Precondition(format!(
                    "managed profile {} exists on this device",
                    profile.id
                )));
            }
            if state.owners.profile_owner(user_id).is_some() {
                return Err(PolicyError::Precondition(format!(
                    "user {} already has a profile owner",
                    user_id
                )));
            }

            info!("Setting device owner {} on user {}", component, user_id);
            state.owners.assign(OwnerAssignment {
                role: OwnerRole::DeviceOwner,
                admin: component.clone(),
                user_id,
                organization_owned: false,
            });
            state.owners_changed();
            state.invalidate(user_id);
            Self::refresh_affiliation(state);
            Ok(())
        })
    }

    pub fn set_profile_owner(
        &self,
        caller: &CallerIdentity,
        component: &ComponentName,
        user_id: UserId,
    ) -> PolicyResult<()> {
        self.mutate(|state| {
            state.authorize(caller, Operation::SetProfileOwner)?;
            let managed_profile = state.user(user_id)?.managed_profile;
            state.admin(component, user_id)?;

            if let Some(existing) = state.owners.owner_of(user_id) {
                return Err(PolicyError::Precondition(format!(
                    "user {} is already owned by {}",
                    user_id, existing.admin
                )));
            }
            if managed_profile && state.owners.device_owner().is_some() {
                return Err(PolicyError::Precondition(
                    "a device owner and a managed profile cannot coexist".to_string(),
                ));
            }

            info!("Setting profile owner {} on user {}", component, user_id);
            state.owners.assign(OwnerAssignment {
                role: OwnerRole::ProfileOwner,
                admin: component.clone(),
                user_id,
                organization_owned: false,
            });
            state.owners_changed();
            state.invalidate(user_id);
            Self::refresh_affiliation(state);
            Ok(())
        })
    }

    /// Remove the device owner. The owner itself or the system may do this.
    pub fn clear_device_owner(&self, caller: &CallerIdentity) -> PolicyResult<()> {
        self.mutate(|state| {
            state.authorize(caller, Operation::ClearDeviceOwner)?;
            let user_id = state
                .owners
                .device_owner_user()
                .ok_or_else(|| PolicyError::Precondition("no device owner is set".to_string()))?;

            info!("Clearing device owner of user {}", user_id);
            self.release_owner(state, OwnerRole::DeviceOwner, user_id);
            Ok(())
        })
    }

    pub fn clear_profile_owner(&self, caller: &CallerIdentity, user_id: UserId) -> PolicyResult<()> {
        self.mutate(|state| {
            let capabilities = state.authorize(caller, Operation::ClearProfileOwner)?;
            if !capabilities.has(Capability::System) && caller.user_id != user_id {
                return Err(PolicyError::NotPermitted {
                    operation: Operation::ClearProfileOwner,
                    uid: caller.uid,
                });
            }
            state.user(user_id)?;
            if state.owners.profile_owner(user_id).is_none() {
                return Err(PolicyError::Precondition(format!(
                    "user {} has no profile owner",
                    user_id
                )));
            }

            info!("Clearing profile owner of user {}", user_id);
            self.release_owner(state, OwnerRole::ProfileOwner, user_id);
            Ok(())
        })
    }

    /// Mark the profile owner of a managed profile as owning the device on
    /// behalf of an organization
    pub fn set_organization_owned(
        &self,
        caller: &CallerIdentity,
        user_id: UserId,
        organization_owned: bool,
    ) -> PolicyResult<()> {
        self.mutate(|state| {
            state.authorize(caller, Operation::SetOrganizationOwned)?;
            if !state.user(user_id)?.managed_profile {
                return Err(PolicyError::Precondition(format!(
                    "user {} is not a managed profile",
                    user_id
                )));
            }

            let owner = state
                .owners
                .profile_owners
                .get_mut(&user_id)
                .ok_or_else(|| {
                    PolicyError::Precondition(format!("user {} has no profile owner", user_id))
                })?;
            if owner.organization_owned == organization_owned {
                return Ok(());
            }
            owner.organization_owned = organization_owned;
            state.owners_changed();

            info!(
                "Profile owner of user {} is {}organization-owned",
                user_id,
                if organization_owned { "" } else { "no longer " }
            );
            if !organization_owned {
                self.reset_budget(state, user_id);
            }
            Ok(())
        })
    }

    /// Hand the caller's owner role on its user to `target`, an admin already
    /// active on the same user.
    ///
    /// The journal is written before anything else changes; a crash at any
    /// later point is finished by the next `open`.
    pub fn transfer_ownership(
        &self,
        caller: &CallerIdentity,
        target: &ComponentName,
        extras: Option<BTreeMap<String, serde_json::Value>>,
    ) -> PolicyResult<()> {
        let _transfer = self
            .transfer_lock
            .lock()
            .map_err(|_| PolicyError::LockPoisoned)?;

        let entry = self.mutate(|state| {
            state.authorize(caller, Operation::TransferOwnership)?;
            let source = state.caller_component(caller)?.clone();
            let user_id = caller.user_id;

            let data = state.data.get(&user_id).ok_or_else(|| PolicyError::UnknownAdmin {
                component: target.clone(),
                user_id,
            })?;
            let role = transfer::validate(&state.owners, data, &source, target, user_id)?;

            if data.transfer_extras != extras {
                let mut with_extras = data.clone();
                with_extras.transfer_extras = extras.clone();
                let write = self
                    .writer
                    .stage(BlobKey::User(user_id), Some(encode_snapshot(&with_extras)?));
                self.writer.commit(self.store.as_ref(), &write)?;
            }

            let entry = TransferJournalEntry::new(source, target.clone(), user_id, role);
            let write = self
                .writer
                .stage(BlobKey::TransferJournal, Some(encode_snapshot(&entry)?));
            self.writer.commit(self.store.as_ref(), &write)?;

            info!(
                "Transferring {:?} of user {} from {} to {} ({})",
                role, user_id, entry.source, entry.target, entry.id
            );

            state.dirty.insert(BlobKey::User(user_id));
            let data = state.data.entry(user_id).or_default();
            data.transfer_extras = extras;
            transfer::apply(&entry, &mut state.owners, data);
            state.owners_changed();
            state.invalidate(user_id);
            Self::refresh_affiliation(state);

            let extras = state
                .data
                .get(&user_id)
                .and_then(|data| data.transfer_extras.clone());
            state.notify(target, user_id, AdminEvent::TransferOwnershipComplete { extras });
            Ok(entry)
        })?;

        let write = self.writer.stage(BlobKey::TransferJournal, None);
        self.writer
            .commit(self.store.as_ref(), &write)
            .map_err(PolicyError::Storage)?;
        info!("Ownership transfer {} complete", entry.id);
        Ok(())
    }

    /// Extras the previous owner left for the caller
    pub fn transfer_ownership_extras(
        &self,
        caller: &CallerIdentity,
    ) -> PolicyResult<Option<BTreeMap<String, serde_json::Value>>> {
        let state = self.lock()?;
        state.authorize(caller, Operation::GetTransferExtras)?;
        Ok(state
            .data
            .get(&caller.user_id)
            .and_then(|data| data.transfer_extras.clone()))
    }

    pub fn set_affiliation_ids(&self, caller: &CallerIdentity, ids: BTreeSet<String>) -> PolicyResult<()> {
        if ids.iter().any(|id| id.trim().is_empty()) {
            return Err(PolicyError::InvalidArgument("empty affiliation id".to_string()));
        }

        self.mutate(|state| {
            state.authorize(caller, Operation::SetAffiliationIds)?;
            let user_id = caller.user_id;
            if state.data.get(&user_id).is_some_and(|data| data.affiliation_ids == ids) {
                return Ok(());
            }

            info!("Setting {} affiliation id(s) on user {}", ids.len(), user_id);
            state.data_mut(user_id).affiliation_ids = ids;
            Self::refresh_affiliation(state);
            Ok(())
        })
    }

    /// Turn security or network logging on or off for the device
    pub fn set_device_logging(
        &self,
        caller: &CallerIdentity,
        kind: DeviceLogKind,
        enabled: bool,
    ) -> PolicyResult<()> {
        self.mutate(|state| {
            state.authorize(caller, Operation::SetDeviceLogging)?;
            let component = state.caller_component(caller)?;

            let admin = state.admin_mut(component, caller.user_id)?;
            let flag = match kind {
                DeviceLogKind::Security => &mut admin.security_logging_enabled,
                DeviceLogKind::Network => &mut admin.network_logging_enabled,
            };
            if *flag == enabled {
                return Ok(());
            }
            *flag = enabled;

            info!("{:?} logging {}", kind, if enabled { "enabled" } else { "disabled" });
            if enabled {
                state.emit(Effect::DeviceLog(kind, LogAction::Enable));
                if !state.affiliation.all_affiliated {
                    state.emit(Effect::DeviceLog(kind, LogAction::Pause));
                }
            } else {
                state.emit(Effect::DeviceLog(kind, LogAction::Disable));
            }
            Ok(())
        })
    }

    pub fn logging_status(&self) -> PolicyResult<LoggingStatus> {
        let state = self.lock()?;
        let (security_enabled, network_enabled) = logging_flags(&state);
        let all_users_affiliated = state.affiliation.all_affiliated;
        Ok(LoggingStatus {
            security_enabled,
            network_enabled,
            all_users_affiliated,
            security_collecting: security_enabled && all_users_affiliated,
            network_collecting: network_enabled && all_users_affiliated,
        })
    }

    /// Packages allowed to run in lock-task mode on the caller's user
    pub fn set_lock_task_packages(&self, caller: &CallerIdentity, packages: Vec<String>) -> PolicyResult<()> {
        self.mutate(|state| {
            state.authorize(caller, Operation::SetLockTaskPackages)?;

            let mut seen = BTreeSet::new();
            let packages: Vec<String> = packages
                .into_iter()
                .filter(|package| seen.insert(package.clone()))
                .collect();
            state.data_mut(caller.user_id).lock_task_packages = packages;
            Ok(())
        })
    }

    pub fn lock_task_packages(&self, user_id: UserId) -> PolicyResult<Vec<String>> {
        let state = self.lock()?;
        state.user(user_id)?;
        Ok(state
            .data
            .get(&user_id)
            .map(|data| data.lock_task_packages.clone())
            .unwrap_or_default())
    }

    /// Drop the owner role held on `user_id`. The admin stays active as an
    /// ordinary admin.
    pub(super) fn release_owner(&self, state: &mut EngineState, role: OwnerRole, user_id: UserId) {
        let Some(assignment) = state.owners.clear(role, user_id) else {
            return;
        };
        state.owners_changed();

        let flags = match state.admin_mut(&assignment.admin, user_id) {
            Ok(admin) => {
                let flags = (admin.security_logging_enabled, admin.network_logging_enabled);
                admin.demote();
                flags
            }
            Err(_) => {
                warn!("Released owner {} was not an active admin on user {}", assignment.admin, user_id);
                (false, false)
            }
        };
        for (kind, was_enabled) in [(DeviceLogKind::Security, flags.0), (DeviceLogKind::Network, flags.1)] {
            if was_enabled {
                state.emit(Effect::DeviceLog(kind, LogAction::Disable));
            }
        }

        if role == OwnerRole::ProfileOwner {
            self.reset_budget(state, user_id);
        }
        state.invalidate(user_id);
        Self::refresh_affiliation(state);
    }
}
