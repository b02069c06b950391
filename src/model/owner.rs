use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{ComponentName, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerRole {
    DeviceOwner,
    ProfileOwner,
}

/// The admin holding an owner role on one user
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct OwnerAssignment {
    pub role: OwnerRole,
    pub admin: ComponentName,
    pub user_id: UserId,

    /// Profile owner of an organization-owned managed profile
    #[serde(default)]
    pub organization_owned: bool,
}

/// Device-wide record of who owns what
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct OwnerRegistry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_owner: Option<OwnerAssignment>,

    #[serde(default)]
    pub profile_owners: BTreeMap<UserId, OwnerAssignment>,
}

impl OwnerRegistry {
    pub fn device_owner(&self) -> Option<&OwnerAssignment> {
        self.device_owner.as_ref()
    }

    pub fn device_owner_user(&self) -> Option<UserId> {
        self.device_owner.as_ref().map(|owner| owner.user_id)
    }

    pub fn profile_owner(&self, user_id: UserId) -> Option<&OwnerAssignment> {
        self.profile_owners.get(&user_id)
    }

    /// The assignment held on `user_id`, whichever role it is
    pub fn owner_of(&self, user_id: UserId) -> Option<&OwnerAssignment> {
        match &self.device_owner {
            Some(owner) if owner.user_id == user_id => Some(owner),
            _ => self.profile_owners.get(&user_id),
        }
    }

    pub fn role_of(&self, admin: &ComponentName, user_id: UserId) -> Option<OwnerRole> {
        self.owner_of(user_id)
            .filter(|owner| &owner.admin == admin)
            .map(|owner| owner.role)
    }

    pub fn is_device_owner(&self, admin: &ComponentName, user_id: UserId) -> bool {
        self.role_of(admin, user_id) == Some(OwnerRole::DeviceOwner)
    }

    pub fn is_profile_owner(&self, admin: &ComponentName, user_id: UserId) -> bool {
        self.role_of(admin, user_id) == Some(OwnerRole::ProfileOwner)
    }

    /// Total number of owner assignments on the device
    pub fn owner_count(&self) -> usize {
        self.profile_owners.len() + usize::from(self.device_owner.is_some())
    }

    pub fn assign(&mut self, assignment: OwnerAssignment) {
        match assignment.role {
            OwnerRole::DeviceOwner => self.device_owner = Some(assignment),
            OwnerRole::ProfileOwner => {
                self.profile_owners.insert(assignment.user_id, assignment);
            }
        }
    }

    /// Point an existing assignment at a different admin. Returns false when
    /// there is no such assignment.
    pub fn reassign(&mut self, role: OwnerRole, user_id: UserId, admin: &ComponentName) -> bool {
        let slot = match role {
            OwnerRole::DeviceOwner => self
                .device_owner
                .as_mut()
                .filter(|owner| owner.user_id == user_id),
            OwnerRole::ProfileOwner => self.profile_owners.get_mut(&user_id),
        };

        match slot {
            Some(owner) => {
                owner.admin = admin.clone();
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self, role: OwnerRole, user_id: UserId) -> Option<OwnerAssignment> {
        match role {
            OwnerRole::DeviceOwner => {
                if self.device_owner_user() == Some(user_id) {
                    self.device_owner.take()
                } else {
                    None
                }
            }
            OwnerRole::ProfileOwner => self.profile_owners.remove(&user_id),
        }
    }

    /// Remove every assignment on `user_id`
    pub fn clear_user(&mut self, user_id: UserId) -> Vec<OwnerAssignment> {
        let mut removed = Vec::new();
        if let Some(owner) = self.clear(OwnerRole::DeviceOwner, user_id) {
            removed.push(owner);
        }
        if let Some(owner) = self.clear(OwnerRole::ProfileOwner, user_id) {
            removed.push(owner);
        }
        removed
    }
}
