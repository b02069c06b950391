use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::{ActiveAdmin, ComponentName, UserId};
use crate::time_budget::ProfileTimeBudget;

/// Topology entry for one user on the device
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct UserInfo {
    pub id: UserId,

    /// Parent full user, set only for managed profiles
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<UserId>,

    #[serde(default)]
    pub managed_profile: bool,

    /// Profile has its own unlock challenge instead of sharing the parent's
    #[serde(default)]
    pub separate_challenge: bool,
}

impl UserInfo {
    pub fn full(id: UserId) -> Self {
        Self {
            id,
            parent: None,
            managed_profile: false,
            separate_challenge: false,
        }
    }

    pub fn managed_profile(id: UserId, parent: UserId, separate_challenge: bool) -> Self {
        Self {
            id,
            parent: Some(parent),
            managed_profile: true,
            separate_challenge,
        }
    }

    /// Id of the full user this user's policies roll up into
    pub fn group_id(&self) -> UserId {
        if self.managed_profile {
            self.parent.unwrap_or(self.id)
        } else {
            self.id
        }
    }
}

/// Everything persisted for one user
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct UserPolicyData {
    /// Active admins in activation order
    pub admins: Vec<ActiveAdmin>,

    pub affiliation_ids: BTreeSet<String>,

    pub lock_task_packages: Vec<String>,

    pub failed_unlock_attempts: u32,

    pub time_budget: ProfileTimeBudget,

    /// Extras handed over by the previous owner during a transfer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_extras: Option<BTreeMap<String, serde_json::Value>>,
}

impl UserPolicyData {
    pub fn admin(&self, component: &ComponentName) -> Option<&ActiveAdmin> {
        self.admins.iter().find(|admin| admin.component() == component)
    }

    pub fn admin_mut(&mut self, component: &ComponentName) -> Option<&mut ActiveAdmin> {
        self.admins
            .iter_mut()
            .find(|admin| admin.component() == component)
    }

    pub fn has_admin(&self, component: &ComponentName) -> bool {
        self.admin(component).is_some()
    }

    pub fn remove_admin(&mut self, component: &ComponentName) -> Option<ActiveAdmin> {
        let index = self
            .admins
            .iter()
            .position(|admin| admin.component() == component)?;
        Some(self.admins.remove(index))
    }

    /// Drop every admin belonging to `package`, returning what was removed
    pub fn remove_package(&mut self, package: &str) -> Vec<ActiveAdmin> {
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.admins)
            .into_iter()
            .partition(|admin| admin.component().package == package);
        self.admins = kept;
        removed
    }
}
