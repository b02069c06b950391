use serde::Serialize;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

use super::{Effect, EngineState, PolicyStore};
use crate::access::{CallerIdentity, Operation};
use crate::error::{PolicyError, PolicyResult};
use crate::model::UserId;
use crate::platform::ProfileOffNotice;
use crate::time_budget::{BudgetInputs, BudgetPhase, ClockAdjustment, ClockAnchor, NoticeState};

/// Time-budget state of one managed profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BudgetStatus {
    pub user_id: UserId,
    pub profile_on: bool,
    pub max_off_millis: i64,
    pub explicit_suspend: bool,
    pub phase: BudgetPhase,
    pub deadline: i64,
    pub notice: NoticeState,
    pub apps_suspended: bool,
    pub suspended_packages: BTreeSet<String>,
    pub failed_packages: BTreeSet<String>,
}

impl PolicyStore {
    /// Bring alarm, notice and suspension of a managed profile in line with
    /// its budget at `now`. With `retry_failed`, packages whose last
    /// suspension call failed are tried again.
    pub(super) fn evaluate_budget(&self, state: &mut EngineState, user_id: UserId, now: i64, retry_failed: bool) {
        let Some(user) = state.users.get(&user_id) else {
            return;
        };
        if !user.managed_profile {
            return;
        }
        let personal_user = user.group_id();
        let profile_off = !state.profiles_on.contains(&user_id);

        let before = state
            .data
            .get(&user_id)
            .map(|data| data.time_budget.clone())
            .unwrap_or_default();
        let mut budget = before.clone();
        let plan = budget.evaluate(&BudgetInputs {
            now,
            warning_period: self.settings.warning_period_millis,
            profile_off,
        });
        debug!("Profile {} budget phase {:?} at {}", user_id, plan.phase, now);

        match plan.alarm_at {
            Some(at) => state.emit(Effect::ScheduleAlarm { user_id, at }),
            None => state.emit(Effect::CancelAlarm(user_id)),
        }

        if plan.notice != budget.notice {
            let effect = match plan.notice {
                NoticeState::None => Effect::ClearNotice(user_id),
                NoticeState::Warning => Effect::ShowNotice(
                    user_id,
                    ProfileOffNotice::Warning {
                        deadline: budget.deadline,
                    },
                ),
                NoticeState::Suspended => Effect::ShowNotice(user_id, ProfileOffNotice::Suspended),
            };
            state.emit(effect);
            budget.notice = plan.notice;
        }

        if budget.needs_suspension_change(plan.suspend, retry_failed) {
            if plan.suspend != budget.apps_suspended {
                info!(
                    "{} personal apps of user {} for profile {}",
                    if plan.suspend { "Suspending" } else { "Unsuspending" },
                    personal_user,
                    user_id
                );
            }
            let packages = if plan.suspend {
                Vec::new()
            } else {
                budget.packages_to_change(false, Vec::new())
            };
            state.emit(Effect::Suspension {
                profile: user_id,
                personal_user,
                suspend: plan.suspend,
                packages,
            });
        }

        if budget != before {
            state.data_mut(user_id).time_budget = budget;
        }
    }

    /// Put a profile back to no budget and no suspension
    pub(super) fn reset_budget(&self, state: &mut EngineState, user_id: UserId) {
        let is_profile = state.users.get(&user_id).is_some_and(|user| user.managed_profile);
        if !is_profile {
            return;
        }

        let configured = state.data.get(&user_id).is_some_and(|data| {
            data.time_budget.max_off_millis != 0 || data.time_budget.explicit_suspend
        });
        if configured {
            let budget = &mut state.data_mut(user_id).time_budget;
            budget.set_max_off(0);
            budget.set_explicit_suspend(false);
        }
        let now = self.collab.clock.now_millis();
        self.evaluate_budget(state, user_id, now, true);
    }

    pub fn on_profile_unlocked(&self, user_id: UserId) -> PolicyResult<()> {
        self.set_profile_running(user_id, true)
    }

    pub fn on_profile_locked(&self, user_id: UserId) -> PolicyResult<()> {
        self.set_profile_running(user_id, false)
    }

    fn set_profile_running(&self, user_id: UserId, running: bool) -> PolicyResult<()> {
        self.mutate(|state| {
            if !state.user(user_id)?.managed_profile {
                debug!("Ignoring lock state change of user {}: not a managed profile", user_id);
                return Ok(());
            }

            if running {
                state.profiles_on.insert(user_id);
            } else {
                state.profiles_on.remove(&user_id);
            }
            info!("Profile {} {}", user_id, if running { "unlocked" } else { "locked" });

            let now = self.collab.clock.now_millis();
            self.evaluate_budget(state, user_id, now, true);
            Ok(())
        })
    }

    /// Budget alarm of `user_id` fired
    pub fn on_alarm(&self, user_id: UserId) -> PolicyResult<()> {
        self.mutate(|state| {
            state.user(user_id)?;
            let now = self.collab.clock.now_millis();
            self.evaluate_budget(state, user_id, now, false);
            Ok(())
        })
    }

    /// Check the wall clock against the monotonic one and move deadlines
    /// along with a clock change. Returns the drift applied, or 0 when the
    /// drift is within tolerance.
    pub fn on_clock_changed(&self) -> PolicyResult<i64> {
        self.mutate(|state| {
            let now = self.collab.clock.now_millis();
            let monotonic = self.collab.clock.monotonic_millis();
            let drift = state.clock_anchor.drift(now, monotonic);
            if drift.abs() <= self.settings.clock_jump_tolerance_millis {
                return Ok(0);
            }

            warn!("Wall clock moved by {} ms", drift);
            state.clock_anchor = ClockAnchor::new(now, monotonic);

            let profiles: Vec<UserId> = state
                .users
                .values()
                .filter(|user| user.managed_profile)
                .map(|user| user.id)
                .collect();
            for user_id in profiles {
                let mut budget = state
                    .data
                    .get(&user_id)
                    .map(|data| data.time_budget.clone())
                    .unwrap_or_default();
                let adjustment = budget.on_clock_changed(now, drift);
                if adjustment != ClockAdjustment::Unaffected {
                    info!("Profile {} budget after clock change: {:?}", user_id, adjustment);
                    state.data_mut(user_id).time_budget = budget;
                }
                self.evaluate_budget(state, user_id, now, false);
            }
            Ok(drift)
        })
    }

    /// How long the profile may stay off before personal apps are suspended;
    /// 0 removes the budget
    pub fn set_max_profile_off(&self, caller: &CallerIdentity, max_off_millis: i64) -> PolicyResult<()> {
        if max_off_millis < 0 {
            return Err(PolicyError::InvalidArgument(format!(
                "profile off budget must not be negative (got {})",
                max_off_millis
            )));
        }

        self.mutate(|state| {
            state.authorize(caller, Operation::SetProfileTimeBudget)?;
            let user_id = caller.user_id;
            require_profile(state, user_id)?;

            info!("Profile {} off budget set to {} ms", user_id, max_off_millis);
            state.data_mut(user_id).time_budget.set_max_off(max_off_millis);
            let now = self.collab.clock.now_millis();
            self.evaluate_budget(state, user_id, now, false);
            Ok(())
        })
    }

    pub fn set_personal_apps_suspended(&self, caller: &CallerIdentity, suspended: bool) -> PolicyResult<()> {
        self.mutate(|state| {
            state.authorize(caller, Operation::SetPersonalAppsSuspended)?;
            let user_id = caller.user_id;
            require_profile(state, user_id)?;

            state.data_mut(user_id).time_budget.set_explicit_suspend(suspended);
            let now = self.collab.clock.now_millis();
            self.evaluate_budget(state, user_id, now, false);
            Ok(())
        })
    }

    pub fn budget_status(&self, user_id: UserId) -> PolicyResult<BudgetStatus> {
        let state = self.lock()?;
        require_profile(&state, user_id)?;

        let budget = state
            .data
            .get(&user_id)
            .map(|data| data.time_budget.clone())
            .unwrap_or_default();
        let now = self.collab.clock.now_millis();

        Ok(BudgetStatus {
            user_id,
            profile_on: state.profiles_on.contains(&user_id),
            max_off_millis: budget.max_off_millis,
            explicit_suspend: budget.explicit_suspend,
            phase: budget.phase(now, self.settings.warning_period_millis),
            deadline: budget.deadline,
            notice: budget.notice,
            apps_suspended: budget.apps_suspended,
            suspended_packages: budget.suspended_packages,
            failed_packages: budget.failed_packages,
        })
    }
}

fn require_profile(state: &EngineState, user_id: UserId) -> PolicyResult<()> {
    if state.user(user_id)?.managed_profile {
        Ok(())
    } else {
        Err(PolicyError::InvalidArgument(format!(
            "user {} is not a managed profile",
            user_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::engine::EngineSettings;
    use crate::platform::AdminEvent;

    fn budgeted_profile(max_off: i64) -> Harness {
        let harness = Harness::with_work_profile(false, true);
        harness
            .engine
            .set_max_profile_off(&harness.po_caller(), max_off)
            .unwrap();
        harness
    }

    fn suspended(harness: &Harness) -> BTreeSet<String> {
        harness.fakes.suspender.suspended()
    }

    #[test]
    fn three_day_budget_warns_then_suspends() {
        let harness = budgeted_profile(3 * DAY);
        let deadline = T0 + 3 * DAY;
        assert_eq!(harness.fakes.alarms.alarm_for(WORK_PROFILE), Some(deadline - DAY));

        harness.fakes.clock.advance(2 * DAY + 23 * HOUR);
        harness.engine.on_alarm(WORK_PROFILE).unwrap();
        let status = harness.engine.budget_status(WORK_PROFILE).unwrap();
        assert_eq!(status.phase, BudgetPhase::Warning);
        assert!(!status.apps_suspended);
        assert!(suspended(&harness).is_empty());
        assert_eq!(
            harness.fakes.notifier.current_notice(WORK_PROFILE),
            Some(ProfileOffNotice::Warning { deadline })
        );
        assert_eq!(harness.fakes.alarms.alarm_for(WORK_PROFILE), Some(deadline + 1));

        harness.fakes.clock.advance(2 * HOUR);
        harness.engine.on_alarm(WORK_PROFILE).unwrap();
        let status = harness.engine.budget_status(WORK_PROFILE).unwrap();
        assert_eq!(status.phase, BudgetPhase::Expired);
        assert!(status.apps_suspended);
        assert_eq!(
            harness.fakes.notifier.current_notice(WORK_PROFILE),
            Some(ProfileOffNotice::Suspended)
        );
        assert_eq!(
            suspended(&harness),
            ["com.game", "com.social"]
                .iter()
                .map(|package| package.to_string())
                .collect::<BTreeSet<String>>()
        );
        assert!(harness
            .fakes
            .notifier
            .events_for("com.example.work")
            .contains(&AdminEvent::PersonalAppsSuspended { suspended: true }));
    }

    #[test]
    fn unlocking_profile_lifts_suspension() {
        let harness = budgeted_profile(DAY);
        harness.fakes.clock.advance(DAY + HOUR);
        harness.engine.on_alarm(WORK_PROFILE).unwrap();
        assert!(!suspended(&harness).is_empty());

        harness.engine.on_profile_unlocked(WORK_PROFILE).unwrap();
        let status = harness.engine.budget_status(WORK_PROFILE).unwrap();
        assert_eq!(status.phase, BudgetPhase::None);
        assert!(!status.apps_suspended);
        assert!(suspended(&harness).is_empty());
        assert_eq!(harness.fakes.notifier.current_notice(WORK_PROFILE), None);
        assert_eq!(harness.fakes.alarms.alarm_for(WORK_PROFILE), None);

        // Locking again starts a fresh budget
        harness.engine.on_profile_locked(WORK_PROFILE).unwrap();
        let status = harness.engine.budget_status(WORK_PROFILE).unwrap();
        assert_eq!(status.deadline, T0 + DAY + HOUR + DAY);
    }

    #[test]
    fn backward_clock_jump_moves_deadline_back() {
        let harness = budgeted_profile(3 * DAY);
        let deadline = T0 + 3 * DAY;

        harness.fakes.clock.advance(HOUR);
        harness.fakes.clock.jump_wall(-2 * HOUR);
        assert_eq!(harness.engine.on_clock_changed().unwrap(), -2 * HOUR);

        let status = harness.engine.budget_status(WORK_PROFILE).unwrap();
        assert_eq!(status.deadline, deadline - 2 * HOUR);
        assert_eq!(
            harness.fakes.alarms.alarm_for(WORK_PROFILE),
            Some(deadline - 2 * HOUR - DAY)
        );
    }

    #[test]
    fn clock_jump_with_unbounded_budget_keeps_engine_usable() {
        let harness = budgeted_profile(i64::MAX);
        harness.fakes.clock.jump_wall(HOUR);
        assert_eq!(harness.engine.on_clock_changed().unwrap(), HOUR);

        let status = harness.engine.budget_status(WORK_PROFILE).unwrap();
        assert_eq!(status.deadline, i64::MAX);
        assert_eq!(status.phase, BudgetPhase::Armed);
        assert!(!status.apps_suspended);
    }

    #[test]
    fn small_clock_drift_is_ignored() {
        let harness = budgeted_profile(3 * DAY);
        harness.fakes.clock.jump_wall(1_000);
        assert_eq!(harness.engine.on_clock_changed().unwrap(), 0);
        assert_eq!(
            harness.engine.budget_status(WORK_PROFILE).unwrap().deadline,
            T0 + 3 * DAY
        );
    }

    #[test]
    fn unlock_during_suspension_call_wins() {
        let harness = budgeted_profile(DAY);
        harness.fakes.clock.advance(DAY + HOUR);
        let (entered, release) = harness.fakes.suspender.hold_next_call();

        std::thread::scope(|scope| {
            let alarm = scope.spawn(|| harness.engine.on_alarm(WORK_PROFILE));
            entered.recv().unwrap();

            // The suspend call is in flight when the profile comes back
            harness.engine.on_profile_unlocked(WORK_PROFILE).unwrap();
            release.send(()).unwrap();
            alarm.join().unwrap().unwrap();
        });

        let status = harness.engine.budget_status(WORK_PROFILE).unwrap();
        assert!(status.profile_on);
        assert_eq!(status.phase, BudgetPhase::None);
        assert!(!status.apps_suspended);
        assert!(status.suspended_packages.is_empty());
        assert!(suspended(&harness).is_empty());
    }

    #[test]
    fn partial_suspension_failure_is_retried() {
        let harness = budgeted_profile(DAY);
        harness.fakes.suspender.fail_package("com.social");

        harness.fakes.clock.advance(DAY + HOUR);
        harness.engine.on_alarm(WORK_PROFILE).unwrap();
        let status = harness.engine.budget_status(WORK_PROFILE).unwrap();
        assert!(status.apps_suspended);
        assert_eq!(status.failed_packages.len(), 1);
        assert_eq!(suspended(&harness).len(), 1);

        harness.fakes.suspender.heal();
        harness.engine.on_profile_locked(WORK_PROFILE).unwrap();
        let status = harness.engine.budget_status(WORK_PROFILE).unwrap();
        assert!(status.failed_packages.is_empty());
        assert_eq!(suspended(&harness).len(), 2);
    }

    #[test]
    fn explicit_suspension_applies_immediately() {
        let harness = Harness::with_work_profile(false, true);
        harness
            .engine
            .set_personal_apps_suspended(&harness.po_caller(), true)
            .unwrap();
        assert_eq!(suspended(&harness).len(), 2);

        harness
            .engine
            .set_personal_apps_suspended(&harness.po_caller(), false)
            .unwrap();
        assert!(suspended(&harness).is_empty());
    }

    #[test]
    fn budget_requires_organization_owned_profile_owner() {
        let harness = Harness::with_work_profile(false, false);
        assert!(matches!(
            harness.engine.set_max_profile_off(&harness.po_caller(), DAY),
            Err(PolicyError::NotPermitted { .. })
        ));
        assert!(matches!(
            harness.engine.set_max_profile_off(&harness.po_caller(), -1),
            Err(PolicyError::InvalidArgument(_))
        ));
    }

    #[test]
    fn budget_survives_restart() {
        let harness = budgeted_profile(3 * DAY);
        harness.fakes.clock.advance(HOUR);

        let reopened = harness.reopen();
        let status = reopened.engine.budget_status(WORK_PROFILE).unwrap();
        assert_eq!(status.deadline, T0 + 3 * DAY);
        assert_eq!(reopened.fakes.alarms.alarm_for(WORK_PROFILE), Some(T0 + 2 * DAY));
    }

    #[test]
    fn inspection_open_leaves_budgets_alone() {
        let harness = budgeted_profile(DAY);
        harness.fakes.clock.advance(2 * DAY);
        let writes_before = harness.store.write_count();

        let inspected = harness.reopen_with(EngineSettings {
            reconcile_budgets: false,
            ..EngineSettings::default()
        });
        assert_eq!(inspected.fakes.suspender.call_count(), 0);
        assert_eq!(inspected.fakes.alarms.alarm_for(WORK_PROFILE), None);
        assert_eq!(harness.store.write_count(), writes_before);

        let status = inspected.engine.budget_status(WORK_PROFILE).unwrap();
        assert_eq!(status.deadline, T0 + DAY);
        assert_eq!(status.phase, BudgetPhase::Expired);
        assert!(!status.apps_suspended);
    }

    #[test]
    fn losing_organization_ownership_clears_budget() {
        let harness = budgeted_profile(DAY);
        harness.fakes.clock.advance(DAY + HOUR);
        harness.engine.on_alarm(WORK_PROFILE).unwrap();
        assert!(!suspended(&harness).is_empty());

        harness
            .engine
            .set_organization_owned(&CallerIdentity::system(), WORK_PROFILE, false)
            .unwrap();
        let status = harness.engine.budget_status(WORK_PROFILE).unwrap();
        assert_eq!(status.max_off_millis, 0);
        assert!(!status.apps_suspended);
        assert!(suspended(&harness).is_empty());
    }
}
