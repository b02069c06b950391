use serde::Serialize;
use tracing::{info, warn};

use super::PolicyStore;
use crate::access::{Capability, CallerIdentity, Operation};
use crate::error::{PolicyError, PolicyResult};
use crate::model::{
    ActiveAdmin, AdminIdentity, AdminPolicySet, ComponentName, PasswordComplexity,
    PasswordQuality, USER_SYSTEM, UserId,
};
use crate::platform::AdminEvent;
use crate::resolver;

/// One change to an admin's policy set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyChange {
    PasswordQuality(PasswordQuality),
    PasswordMinLength(u32),
    PasswordMinLetters(u32),
    PasswordMinUppercase(u32),
    PasswordMinLowercase(u32),
    PasswordMinNumeric(u32),
    PasswordMinSymbols(u32),
    PasswordMinNonLetter(u32),
    PasswordHistoryLength(u32),
    PasswordExpirationTimeout(i64),
    RequiredComplexity(PasswordComplexity),
    MaxTimeToLock(i64),
    MaxFailedAttempts(u32),
    KeyguardDisabledFeatures(u32),
    CameraDisabled(bool),
    ScreenCaptureDisabled(bool),
}

impl PolicyChange {
    fn apply(self, set: &mut AdminPolicySet) -> PolicyResult<()> {
        match self {
            PolicyChange::PasswordQuality(quality) => set.set_password_quality(quality),
            PolicyChange::PasswordMinLength(value) => set.password_min_length = value,
            PolicyChange::PasswordMinLetters(value) => set.password_min_letters = value,
            PolicyChange::PasswordMinUppercase(value) => set.password_min_uppercase = value,
            PolicyChange::PasswordMinLowercase(value) => set.password_min_lowercase = value,
            PolicyChange::PasswordMinNumeric(value) => set.password_min_numeric = value,
            PolicyChange::PasswordMinSymbols(value) => set.password_min_symbols = value,
            PolicyChange::PasswordMinNonLetter(value) => set.password_min_non_letter = value,
            PolicyChange::PasswordHistoryLength(value) => set.password_history_length = value,
            PolicyChange::PasswordExpirationTimeout(millis) => {
                set.password_expiration_timeout_millis = non_negative("expiration timeout", millis)?
            }
            PolicyChange::RequiredComplexity(complexity) => set.set_required_complexity(complexity),
            PolicyChange::MaxTimeToLock(millis) => {
                set.max_time_to_lock_millis = non_negative("max time to lock", millis)?
            }
            PolicyChange::MaxFailedAttempts(value) => set.max_failed_attempts_before_wipe = value,
            PolicyChange::KeyguardDisabledFeatures(bits) => set.keyguard_disabled_features = bits,
            PolicyChange::CameraDisabled(value) => set.camera_disabled = value,
            PolicyChange::ScreenCaptureDisabled(value) => set.screen_capture_disabled = value,
        }
        Ok(())
    }
}

fn non_negative(what: &str, value: i64) -> PolicyResult<i64> {
    if value < 0 {
        return Err(PolicyError::InvalidArgument(format!(
            "{} must not be negative (got {})",
            what, value
        )));
    }
    Ok(value)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "scope", content = "user", rename_all = "snake_case")]
pub enum WipeScope {
    Device,
    User(UserId),
}

/// Too many failed unlock attempts: who asked for the wipe and what goes
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WipeDecision {
    pub admin: ComponentName,
    pub admin_user: UserId,
    pub attempts: u32,
    pub scope: WipeScope,
}

impl PolicyStore {
    /// Register an admin app on its user
    pub fn activate_admin(&self, caller: &CallerIdentity, identity: AdminIdentity) -> PolicyResult<()> {
        self.mutate(|state| {
            state.authorize(caller, Operation::ActivateAdmin)?;
            let user_id = identity.user_id;
            state.user(user_id)?;

            if state.admin(&identity.component, user_id).is_ok() {
                return Err(PolicyError::AdminExists {
                    component: identity.component,
                    user_id,
                });
            }

            info!("Activating admin {} on user {}", identity.component, user_id);
            let component = identity.component.clone();
            state.data_mut(user_id).admins.push(ActiveAdmin::new(identity));
            state.invalidate(user_id);
            state.notify(&component, user_id, AdminEvent::Enabled);
            Ok(())
        })
    }

    /// Deactivate an admin. Owners must give up their role first unless
    /// they are test-only.
    pub fn remove_admin(
        &self,
        caller: &CallerIdentity,
        component: &ComponentName,
        user_id: UserId,
    ) -> PolicyResult<()> {
        self.mutate(|state| {
            let capabilities = state.authorize(caller, Operation::RemoveAdmin)?;
            if !capabilities.has(Capability::System)
                && (caller.component.as_ref() != Some(component) || caller.user_id != user_id)
            {
                return Err(PolicyError::NotPermitted {
                    operation: Operation::RemoveAdmin,
                    uid: caller.uid,
                });
            }

            let admin = state.admin(component, user_id)?;
            if let Some(role) = state.owners.role_of(component, user_id) {
                if !admin.identity.test_only {
                    return Err(PolicyError::Precondition(format!(
                        "{} is the {:?} of user {} and cannot be removed",
                        component, role, user_id
                    )));
                }
                self.release_owner(state, role, user_id);
            }

            info!("Removing admin {} from user {}", component, user_id);
            if let Some(removed) = state.data_mut(user_id).remove_admin(component) {
                state.notify(removed.component(), user_id, AdminEvent::Disabled);
            }
            state.invalidate(user_id);
            Ok(())
        })
    }

    /// Change one field of the caller's own policy set, or with `parent` of
    /// the set it applies to its profile's parent
    pub fn set_admin_policy(
        &self,
        caller: &CallerIdentity,
        parent: bool,
        change: PolicyChange,
    ) -> PolicyResult<()> {
        self.mutate(|state| {
            state.authorize(caller, Operation::SetAdminPolicy)?;
            let component = state.caller_component(caller)?;
            let user_id = caller.user_id;

            if parent {
                state.authorize(caller, Operation::SetParentPolicy)?;
                if !state.user(user_id)?.managed_profile {
                    return Err(PolicyError::InvalidArgument(format!(
                        "user {} is not a managed profile",
                        user_id
                    )));
                }
            }

            // Validate on a copy so a rejected change leaves no trace
            let admin = state.admin(component, user_id)?;
            let mut set = if parent {
                admin.parent_policy.clone().unwrap_or_default()
            } else {
                admin.policy.clone()
            };
            change.apply(&mut set)?;

            let admin = state.admin_mut(component, user_id)?;
            if parent {
                admin.parent_policy = Some(set);
            } else {
                admin.policy = set;
            }
            state.invalidate(user_id);
            Ok(())
        })
    }

    pub fn set_user_restriction(
        &self,
        caller: &CallerIdentity,
        restriction: &str,
        enabled: bool,
    ) -> PolicyResult<()> {
        if restriction.trim().is_empty() {
            return Err(PolicyError::InvalidArgument("empty user restriction".to_string()));
        }

        self.mutate(|state| {
            state.authorize(caller, Operation::SetUserRestriction)?;
            let component = state.caller_component(caller)?;
            let user_id = caller.user_id;

            let restrictions = &mut state.admin_mut(component, user_id)?.policy.user_restrictions;
            if enabled {
                restrictions.insert(restriction.to_string());
            } else {
                restrictions.remove(restriction);
            }
            state.invalidate(user_id);
            Ok(())
        })
    }

    /// Count a failed unlock of `user_id`'s credential. Returns a wipe
    /// decision once the strictest max-failed-attempts limit is reached.
    pub fn report_failed_unlock(&self, user_id: UserId) -> PolicyResult<Option<WipeDecision>> {
        self.mutate(|state| {
            state.user(user_id)?;
            let data = state.data_mut(user_id);
            data.failed_unlock_attempts = data.failed_unlock_attempts.saturating_add(1);
            let attempts = data.failed_unlock_attempts;

            let admins: Vec<ComponentName> = data
                .admins
                .iter()
                .map(|admin| admin.component().clone())
                .collect();
            for admin in &admins {
                state.notify(admin, user_id, AdminEvent::PasswordFailed { attempts });
            }

            let Some(limit) = resolver::strictest_wipe_admin(state.view(), user_id) else {
                return Ok(None);
            };
            if i64::from(attempts) < limit.value {
                return Ok(None);
            }

            let scope = if state.owners.is_device_owner(&limit.admin, limit.user_id)
                || limit.user_id == USER_SYSTEM
            {
                WipeScope::Device
            } else {
                WipeScope::User(limit.user_id)
            };

            warn!(
                "User {} reached {} failed unlock attempts; {} requires a {:?} wipe",
                user_id, attempts, limit.admin, scope
            );

            Ok(Some(WipeDecision {
                admin: limit.admin,
                admin_user: limit.user_id,
                attempts,
                scope,
            }))
        })
    }

    pub fn report_successful_unlock(&self, user_id: UserId) -> PolicyResult<()> {
        self.mutate(|state| {
            state.user(user_id)?;
            let had_failures = state
                .data
                .get(&user_id)
                .is_some_and(|data| data.failed_unlock_attempts > 0);
            if !had_failures {
                return Ok(());
            }

            let data = state.data_mut(user_id);
            data.failed_unlock_attempts = 0;
            let admins: Vec<ComponentName> = data
                .admins
                .iter()
                .map(|admin| admin.component().clone())
                .collect();
            for admin in &admins {
                state.notify(admin, user_id, AdminEvent::PasswordSucceeded);
            }
            Ok(())
        })
    }

    /// A package was uninstalled from `user_id`: its admins go, and so does
    /// any owner role they held
    pub fn on_package_removed(&self, package: &str, user_id: UserId) -> PolicyResult<()> {
        self.mutate(|state| {
            let affected = state
                .data
                .get(&user_id)
                .is_some_and(|data| data.admins.iter().any(|admin| admin.component().package == package));
            if !affected {
                return Ok(());
            }

            let owner_role = state
                .owners
                .owner_of(user_id)
                .filter(|owner| owner.admin.package == package)
                .map(|owner| owner.role);
            if let Some(role) = owner_role {
                warn!("Owner package {} removed from user {}", package, user_id);
                self.release_owner(state, role, user_id);
            }

            let removed = state.data_mut(user_id).remove_package(package);
            info!(
                "Package {} removed from user {}: dropped {} admin(s)",
                package,
                user_id,
                removed.len()
            );
            state.invalidate(user_id);
            Self::refresh_affiliation(state);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::model::{UserInfo, keyguard};

    #[test]
    fn two_admins_resolve_to_strictest_password() {
        let harness = Harness::new(&[UserInfo::full(0)]);
        harness.activate(ComponentName::new("com.a", "A"), 0, 10_001);
        harness.activate(ComponentName::new("com.b", "B"), 0, 10_002);
        let a = CallerIdentity::admin(ComponentName::new("com.a", "A"), 0, 10_001);
        let b = CallerIdentity::admin(ComponentName::new("com.b", "B"), 0, 10_002);

        let engine = &harness.engine;
        engine.set_admin_policy(&a, false, PolicyChange::PasswordQuality(PasswordQuality::Numeric)).unwrap();
        engine.set_admin_policy(&a, false, PolicyChange::PasswordMinLength(8)).unwrap();
        engine.set_admin_policy(&b, false, PolicyChange::PasswordQuality(PasswordQuality::Alphabetic)).unwrap();
        engine.set_admin_policy(&b, false, PolicyChange::PasswordMinLength(6)).unwrap();

        let resolved = engine.resolve(0, false).unwrap();
        assert_eq!(resolved.password_quality, PasswordQuality::Alphabetic);
        assert_eq!(resolved.password_min_length, 8);
    }

    #[test]
    fn activate_requires_system_and_rejects_duplicates() {
        let harness = Harness::with_device_owner();
        let identity = AdminIdentity {
            component: ComponentName::new("com.c", "C"),
            user_id: 0,
            uid: 10_003,
            test_only: false,
            supports_transfer: false,
        };

        assert!(matches!(
            harness.engine.activate_admin(&harness.do_caller(), identity.clone()),
            Err(PolicyError::NotPermitted { .. })
        ));
        harness
            .engine
            .activate_admin(&CallerIdentity::system(), identity.clone())
            .unwrap();
        assert!(matches!(
            harness.engine.activate_admin(&CallerIdentity::system(), identity),
            Err(PolicyError::AdminExists { .. })
        ));
    }

    #[test]
    fn owner_cannot_be_removed_through_admin_api() {
        let harness = Harness::with_device_owner();
        let result = harness
            .engine
            .remove_admin(&harness.do_caller(), &do_component(), 0);
        assert!(matches!(result, Err(PolicyError::Precondition(_))));
        assert_eq!(harness.engine.admins(0).unwrap().len(), 2);
    }

    #[test]
    fn admin_removes_itself_and_policy_goes_with_it() {
        let harness = Harness::with_device_owner();
        let target = CallerIdentity::admin(target_component(), 0, TARGET_UID);
        harness
            .engine
            .set_admin_policy(&target, false, PolicyChange::CameraDisabled(true))
            .unwrap();
        assert!(harness.engine.resolve(0, false).unwrap().camera_disabled);

        // Another admin may not remove it
        assert!(harness
            .engine
            .remove_admin(&harness.do_caller(), &target_component(), 0)
            .is_err());

        harness.engine.remove_admin(&target, &target_component(), 0).unwrap();
        assert!(!harness.engine.resolve(0, false).unwrap().camera_disabled);
        assert!(harness
            .fakes
            .notifier
            .events_for("com.example.next")
            .contains(&AdminEvent::Disabled));
    }

    #[test]
    fn invalid_change_leaves_policy_untouched() {
        let harness = Harness::with_device_owner();
        let caller = harness.do_caller();
        harness
            .engine
            .set_admin_policy(&caller, false, PolicyChange::MaxTimeToLock(60_000))
            .unwrap();

        let result = harness
            .engine
            .set_admin_policy(&caller, false, PolicyChange::MaxTimeToLock(-1));
        assert!(matches!(result, Err(PolicyError::InvalidArgument(_))));
        assert_eq!(harness.engine.resolve(0, false).unwrap().max_time_to_lock_millis, 60_000);
    }

    #[test]
    fn parent_policy_requires_profile_owner_on_profile() {
        let harness = Harness::with_work_profile(false, false);
        let po = harness.po_caller();

        harness
            .engine
            .set_admin_policy(
                &po,
                true,
                PolicyChange::KeyguardDisabledFeatures(
                    keyguard::DISABLE_SECURE_CAMERA | keyguard::DISABLE_UNREDACTED_NOTIFICATIONS,
                ),
            )
            .unwrap();
        let resolved = harness.engine.resolve(0, false).unwrap();
        assert_eq!(resolved.keyguard_disabled_features, keyguard::DISABLE_SECURE_CAMERA);

        // The device owner harness has no managed profile
        let harness = Harness::with_device_owner();
        assert!(matches!(
            harness.engine.set_admin_policy(&harness.do_caller(), true, PolicyChange::CameraDisabled(true)),
            Err(PolicyError::NotPermitted { .. })
        ));
    }

    #[test]
    fn profile_policy_change_invalidates_parent_resolution() {
        let harness = Harness::with_work_profile(false, false);
        assert_eq!(
            harness.engine.resolve(0, false).unwrap().password_quality,
            PasswordQuality::Unspecified
        );

        harness
            .engine
            .set_admin_policy(&harness.po_caller(), false, PolicyChange::PasswordQuality(PasswordQuality::Complex))
            .unwrap();
        assert_eq!(
            harness.engine.resolve(0, false).unwrap().password_quality,
            PasswordQuality::Complex
        );
    }

    #[test]
    fn user_restrictions_need_an_owner() {
        let harness = Harness::with_device_owner();
        let target = CallerIdentity::admin(target_component(), 0, TARGET_UID);
        assert!(harness.engine.set_user_restriction(&target, "no_sms", true).is_err());

        harness
            .engine
            .set_user_restriction(&harness.do_caller(), "no_sms", true)
            .unwrap();
        let resolved = harness.engine.resolve(0, false).unwrap();
        assert!(resolved.user_restrictions.contains("no_sms"));
    }

    #[test]
    fn failed_unlocks_trigger_wipe_at_strictest_limit() {
        let harness = Harness::with_device_owner();
        let target = CallerIdentity::admin(target_component(), 0, TARGET_UID);
        harness
            .engine
            .set_admin_policy(&harness.do_caller(), false, PolicyChange::MaxFailedAttempts(5))
            .unwrap();
        harness
            .engine
            .set_admin_policy(&target, false, PolicyChange::MaxFailedAttempts(3))
            .unwrap();

        assert!(harness.engine.report_failed_unlock(0).unwrap().is_none());
        assert!(harness.engine.report_failed_unlock(0).unwrap().is_none());
        let decision = harness.engine.report_failed_unlock(0).unwrap().unwrap();

        assert_eq!(decision.admin, target_component());
        assert_eq!(decision.attempts, 3);
        assert_eq!(decision.scope, WipeScope::Device);

        harness.engine.report_successful_unlock(0).unwrap();
        assert_eq!(harness.engine.user_data(0).unwrap().failed_unlock_attempts, 0);
    }

    #[test]
    fn separate_profile_wipe_only_wipes_profile() {
        let harness = Harness::with_work_profile(true, false);
        harness
            .engine
            .set_admin_policy(&harness.po_caller(), false, PolicyChange::MaxFailedAttempts(1))
            .unwrap();

        let decision = harness.engine.report_failed_unlock(WORK_PROFILE).unwrap().unwrap();
        assert_eq!(decision.scope, WipeScope::User(WORK_PROFILE));
        assert!(harness
            .fakes
            .notifier
            .events_for("com.example.work")
            .contains(&AdminEvent::PasswordFailed { attempts: 1 }));
    }

    #[test]
    fn package_removal_drops_owner() {
        let harness = Harness::with_device_owner();
        harness.engine.on_package_removed("com.example.mdm", 0).unwrap();

        assert_eq!(harness.engine.owners().unwrap().owner_count(), 0);
        let admins = harness.engine.admins(0).unwrap();
        assert_eq!(admins.len(), 1);
        assert_eq!(admins[0].component(), &target_component());

        // Unrelated package is a no-op
        harness.engine.on_package_removed("com.unknown", 0).unwrap();
        assert_eq!(harness.engine.admins(0).unwrap().len(), 1);
    }
}
