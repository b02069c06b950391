use tracing::info;

use super::{Effect, PolicyStore};
use crate::access::{CallerIdentity, Operation};
use crate::error::{PolicyError, PolicyResult};
use crate::model::{USER_SYSTEM, UserId, UserInfo};
use crate::platform::{DeviceLogKind, LogAction};
use crate::storage::BlobKey;

impl PolicyStore {
    /// Add a user or managed profile to the device
    pub fn add_user(&self, caller: &CallerIdentity, user: UserInfo) -> PolicyResult<()> {
        self.mutate(|state| {
            state.authorize(caller, Operation::ManageUsers)?;
            if state.users.contains_key(&user.id) {
                return Err(PolicyError::InvalidArgument(format!("user {} already exists", user.id)));
            }

            match (user.managed_profile, user.parent) {
                (true, Some(parent)) => {
                    if state.user(parent)?.managed_profile {
                        return Err(PolicyError::InvalidArgument(format!(
                            "profile {} cannot have profile {} as parent",
                            user.id, parent
                        )));
                    }
                    if state.owners.device_owner().is_some() {
                        return Err(PolicyError::Precondition(
                            "a device owner and a managed profile cannot coexist".to_string(),
                        ));
                    }
                }
                (true, None) => {
                    return Err(PolicyError::InvalidArgument(format!(
                        "managed profile {} has no parent",
                        user.id
                    )));
                }
                (false, Some(_)) => {
                    return Err(PolicyError::InvalidArgument(format!(
                        "full user {} cannot have a parent",
                        user.id
                    )));
                }
                (false, None) => {}
            }

            info!("Adding user {} (managed profile: {})", user.id, user.managed_profile);
            let user_id = user.id;
            state.users.insert(user_id, user);
            state.invalidate(user_id);
            Self::refresh_affiliation(state);
            Ok(())
        })
    }

    /// Remove a user together with its profiles
    pub fn remove_user(&self, caller: &CallerIdentity, user_id: UserId) -> PolicyResult<()> {
        self.mutate(|state| {
            state.authorize(caller, Operation::ManageUsers)?;
            if user_id == USER_SYSTEM {
                return Err(PolicyError::InvalidArgument("the system user cannot be removed".to_string()));
            }
            state.user(user_id)?;

            let mut removed: Vec<UserId> = state
                .users
                .values()
                .filter(|user| user.parent == Some(user_id))
                .map(|user| user.id)
                .collect();
            removed.push(user_id);

            let mut discard = false;
            for id in removed {
                discard |= !state.affiliation.is_affiliated(id);

                while let Some(role) = state.owners.owner_of(id).map(|owner| owner.role) {
                    self.release_owner(state, role, id);
                }
                self.reset_budget(state, id);
                state.invalidate(id);

                info!("Removing user {}", id);
                state.users.remove(&id);
                state.data.remove(&id);
                state.profiles_on.remove(&id);
                state.dirty.insert(BlobKey::User(id));
                state.emit(Effect::CancelAlarm(id));
                state.emit(Effect::ClearNotice(id));
            }

            if discard {
                info!("Removed an unaffiliated user; discarding buffered device logs");
                for kind in [DeviceLogKind::Security, DeviceLogKind::Network] {
                    state.emit(Effect::DeviceLog(kind, LogAction::Discard));
                }
            }
            Self::refresh_affiliation(state);
            Ok(())
        })
    }

    /// Give a managed profile its own credential, or unify it with the parent's
    pub fn set_separate_challenge(
        &self,
        caller: &CallerIdentity,
        user_id: UserId,
        separate_challenge: bool,
    ) -> PolicyResult<()> {
        self.mutate(|state| {
            state.authorize(caller, Operation::ManageUsers)?;
            if !state.user(user_id)?.managed_profile {
                return Err(PolicyError::InvalidArgument(format!(
                    "user {} is not a managed profile",
                    user_id
                )));
            }

            if let Some(user) = state.users.get_mut(&user_id) {
                user.separate_challenge = separate_challenge;
            }
            state.invalidate(user_id);
            Ok(())
        })
    }
}
