//! Affiliation between users and the device owner
//!
//! A user is affiliated when its owner shares an affiliation id with the
//! device owner. Device-wide logs are collected only while every user on the
//! device is affiliated.

use std::collections::{BTreeMap, BTreeSet};

use crate::model::{OwnerRegistry, USER_SYSTEM, UserId, UserPolicyData};
use crate::platform::LogAction;

pub fn is_user_affiliated(
    user_id: UserId,
    owners: &OwnerRegistry,
    data: &BTreeMap<UserId, UserPolicyData>,
) -> bool {
    if user_id == USER_SYSTEM {
        return true;
    }

    let Some(device_owner_user) = owners.device_owner_user() else {
        return false;
    };
    if user_id == device_owner_user {
        return true;
    }

    if owners.profile_owner(user_id).is_none() {
        return false;
    }

    let ids_of = |user: UserId| data.get(&user).map(|data| &data.affiliation_ids);
    match (ids_of(device_owner_user), ids_of(user_id)) {
        (Some(device_ids), Some(user_ids)) => !device_ids.is_disjoint(user_ids),
        _ => false,
    }
}

/// Affiliation of every user at one point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AffiliationSnapshot {
    pub affiliated: BTreeSet<UserId>,
    pub all_affiliated: bool,
}

impl AffiliationSnapshot {
    pub fn compute<'a>(
        users: impl IntoIterator<Item = &'a UserId>,
        owners: &OwnerRegistry,
        data: &BTreeMap<UserId, UserPolicyData>,
    ) -> Self {
        let mut snapshot = Self {
            affiliated: BTreeSet::new(),
            all_affiliated: true,
        };

        for user_id in users {
            if is_user_affiliated(*user_id, owners, data) {
                snapshot.affiliated.insert(*user_id);
            } else {
                snapshot.all_affiliated = false;
            }
        }

        snapshot
    }

    pub fn is_affiliated(&self, user_id: UserId) -> bool {
        self.affiliated.contains(&user_id)
    }
}

/// What changed between two snapshots
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GateTransition {
    /// Pause or resume device-wide log collection
    pub logging: Option<LogAction>,
    /// Users that were affiliated and no longer are
    pub lost: Vec<UserId>,
}

impl GateTransition {
    pub fn between(before: &AffiliationSnapshot, after: &AffiliationSnapshot) -> Self {
        let logging = match (before.all_affiliated, after.all_affiliated) {
            (true, false) => Some(LogAction::Pause),
            (false, true) => Some(LogAction::Resume),
            _ => None,
        };

        Self {
            logging,
            lost: before.affiliated.difference(&after.affiliated).copied().collect(),
        }
    }
}
