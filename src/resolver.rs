//! Merges the policies of every admin affecting a user into one value per
//! policy dimension.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

use crate::model::{
    ActiveAdmin, AdminPolicySet, ComponentName, PasswordComplexity, PasswordQuality, UserId,
    UserInfo, UserPolicyData, keyguard,
};

/// Read-only view of the device topology and per-user admin data
#[derive(Clone, Copy)]
pub struct PolicyView<'a> {
    pub users: &'a BTreeMap<UserId, UserInfo>,
    pub data: &'a BTreeMap<UserId, UserPolicyData>,
}

/// One merged value per policy dimension. The default value is the
/// "no policy" answer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResolvedPolicy {
    pub password_quality: PasswordQuality,
    pub password_min_length: u32,
    pub password_min_letters: u32,
    pub password_min_uppercase: u32,
    pub password_min_lowercase: u32,
    pub password_min_numeric: u32,
    pub password_min_symbols: u32,
    pub password_min_non_letter: u32,
    pub password_history_length: u32,
    pub password_expiration_timeout_millis: i64,
    pub required_complexity: PasswordComplexity,
    pub max_time_to_lock_millis: i64,
    pub max_failed_attempts_before_wipe: u32,
    pub keyguard_disabled_features: u32,
    pub camera_disabled: bool,
    pub screen_capture_disabled: bool,
    pub user_restrictions: BTreeSet<String>,
    /// Number of policy sets that took part
    pub contributors: usize,
}

/// Which fields of a candidate set take part in the merge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reach {
    /// Every field
    Full,
    /// Only credential and keyguard fields, for a unified profile's own set
    /// seen from its parent
    Credential,
}

#[derive(Debug, Clone, Copy)]
struct Candidate<'a> {
    admin: &'a ActiveAdmin,
    set: &'a AdminPolicySet,
    keyguard_mask: u32,
    reach: Reach,
    on_primary: bool,
}

/// The admin whose ceiling value won, and where it sits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CeilingOwner {
    pub admin: ComponentName,
    pub user_id: UserId,
    pub value: i64,
}

/// User whose admins are resolved when `user_id` is queried
pub fn effective_user(users: &BTreeMap<UserId, UserInfo>, user_id: UserId, parent: bool) -> UserId {
    match users.get(&user_id) {
        Some(user) if user.managed_profile && (parent || !user.separate_challenge) => {
            user.group_id()
        }
        _ => user_id,
    }
}

fn candidates<'a>(view: PolicyView<'a>, user_id: UserId, parent: bool) -> Vec<Candidate<'a>> {
    let target = effective_user(view.users, user_id, parent);
    let Some(user) = view.users.get(&target) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    if let Some(data) = view.data.get(&target) {
        out.extend(data.admins.iter().map(|admin| Candidate {
            admin,
            set: &admin.policy,
            keyguard_mask: keyguard::DISABLE_FEATURES_ALL,
            reach: Reach::Full,
            on_primary: true,
        }));
    }

    // A separate-challenge profile answers only for itself
    if user.managed_profile {
        return out;
    }

    let unified_profiles = view.users.values().filter(|profile| {
        profile.managed_profile && profile.parent == Some(target) && !profile.separate_challenge
    });

    for profile in unified_profiles {
        let Some(data) = view.data.get(&profile.id) else {
            continue;
        };
        for admin in &data.admins {
            out.push(Candidate {
                admin,
                set: &admin.policy,
                keyguard_mask: keyguard::PROFILE_AFFECTS_PARENT,
                reach: Reach::Credential,
                on_primary: false,
            });
            if let Some(parent_set) = &admin.parent_policy {
                out.push(Candidate {
                    admin,
                    set: parent_set,
                    keyguard_mask: keyguard::PARENT_INSTANCE_LEGAL,
                    reach: Reach::Full,
                    on_primary: false,
                });
            }
        }
    }

    out
}

/// Resolve every policy dimension for `user_id`. With `parent` set on a
/// managed profile, resolves the profile's parent instead.
pub fn resolve(view: PolicyView<'_>, user_id: UserId, parent: bool) -> ResolvedPolicy {
    let candidates = candidates(view, user_id, parent);
    let mut resolved = ResolvedPolicy {
        contributors: candidates.len(),
        ..Default::default()
    };

    for candidate in &candidates {
        merge_into(&mut resolved, candidate);
    }

    debug!(
        "Resolved policy for user {} (parent={}) from {} policy sets",
        user_id,
        parent,
        candidates.len()
    );

    resolved
}

fn merge_into(resolved: &mut ResolvedPolicy, candidate: &Candidate<'_>) {
    let set = candidate.set;
    let quality = set.password_quality;

    resolved.password_quality = resolved.password_quality.max(quality);

    if quality >= PasswordQuality::Numeric {
        resolved.password_min_length = resolved.password_min_length.max(set.password_min_length);
    }

    if quality >= PasswordQuality::Complex {
        resolved.password_min_letters = resolved.password_min_letters.max(set.password_min_letters);
        resolved.password_min_uppercase =
            resolved.password_min_uppercase.max(set.password_min_uppercase);
        resolved.password_min_lowercase =
            resolved.password_min_lowercase.max(set.password_min_lowercase);
        resolved.password_min_numeric = resolved.password_min_numeric.max(set.password_min_numeric);
        resolved.password_min_symbols = resolved.password_min_symbols.max(set.password_min_symbols);
        resolved.password_min_non_letter =
            resolved.password_min_non_letter.max(set.password_min_non_letter);
    }

    resolved.password_history_length =
        resolved.password_history_length.max(set.password_history_length);
    resolved.required_complexity = resolved.required_complexity.max(set.required_complexity);

    resolved.password_expiration_timeout_millis = min_nonzero(
        resolved.password_expiration_timeout_millis,
        set.password_expiration_timeout_millis,
    );
    resolved.max_time_to_lock_millis =
        min_nonzero(resolved.max_time_to_lock_millis, set.max_time_to_lock_millis);
    resolved.max_failed_attempts_before_wipe = min_nonzero(
        resolved.max_failed_attempts_before_wipe,
        set.max_failed_attempts_before_wipe,
    );

    resolved.keyguard_disabled_features |=
        set.keyguard_disabled_features & candidate.keyguard_mask;

    if candidate.reach == Reach::Full {
        resolved.camera_disabled |= set.camera_disabled;
        resolved.screen_capture_disabled |= set.screen_capture_disabled;
        resolved
            .user_restrictions
            .extend(set.user_restrictions.iter().cloned());
    }
}

fn min_nonzero<T: Copy + Default + Ord>(current: T, candidate: T) -> T {
    let zero = T::default();
    match (current == zero, candidate == zero) {
        (_, true) => current,
        (true, false) => candidate,
        (false, false) => current.min(candidate),
    }
}

/// Find the admin holding the strictest non-zero value of a ceiling field.
/// Ties go to an admin on the primary user, then to the earliest candidate.
fn strictest_ceiling<F>(view: PolicyView<'_>, user_id: UserId, field: F) -> Option<CeilingOwner>
where
    F: Fn(&AdminPolicySet) -> i64,
{
    let mut best: Option<Candidate<'_>> = None;
    let mut best_value = 0;

    for candidate in candidates(view, user_id, false) {
        let value = field(candidate.set);
        if value <= 0 {
            continue;
        }

        let better = match best {
            None => true,
            Some(current) => {
                value < best_value
                    || (value == best_value && candidate.on_primary && !current.on_primary)
            }
        };

        if better {
            best = Some(candidate);
            best_value = value;
        }
    }

    best.map(|candidate| CeilingOwner {
        admin: candidate.admin.component().clone(),
        user_id: candidate.admin.identity.user_id,
        value: best_value,
    })
}

/// Admin whose max-failed-attempts limit triggers a wipe for `user_id`
pub fn strictest_wipe_admin(view: PolicyView<'_>, user_id: UserId) -> Option<CeilingOwner> {
    strictest_ceiling(view, user_id, |set| {
        i64::from(set.max_failed_attempts_before_wipe)
    })
}

/// Admin whose max-time-to-lock is in force for `user_id`
pub fn strictest_lock_admin(view: PolicyView<'_>, user_id: UserId) -> Option<CeilingOwner> {
    strictest_ceiling(view, user_id, |set| set.max_time_to_lock_millis)
}

/// Resolved values keyed by (user, parent selector)
#[derive(Debug, Default)]
pub struct ResolutionCache {
    entries: HashMap<(UserId, bool), ResolvedPolicy>,
}

impl ResolutionCache {
    pub fn get_or_resolve(
        &mut self,
        view: PolicyView<'_>,
        user_id: UserId,
        parent: bool,
    ) -> ResolvedPolicy {
        self.entries
            .entry((user_id, parent))
            .or_insert_with(|| resolve(view, user_id, parent))
            .clone()
    }

    /// Drop every entry for users in the group rooted at `group_id`
    pub fn invalidate_group(&mut self, users: &BTreeMap<UserId, UserInfo>, group_id: UserId) {
        self.entries.retain(|(user_id, _), _| {
            let group = users
                .get(user_id)
                .map(UserInfo::group_id)
                .unwrap_or(*user_id);
            group != group_id
        });
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
