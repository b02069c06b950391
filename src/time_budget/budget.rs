use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// No budget deadline is running
pub const DEADLINE_UNSET: i64 = 0;

/// The budget ran out; personal apps stay suspended until the profile unlocks
pub const DEADLINE_EXPIRED: i64 = -1;

/// Which profile-off notice the user currently sees
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeState {
    #[default]
    None,
    Warning,
    Suspended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetPhase {
    None,
    Armed,
    Warning,
    Expired,
}

/// Per managed-profile "profile off" budget
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ProfileTimeBudget {
    /// Maximum cumulative time the profile may stay off; 0 disables the budget
    pub max_off_millis: i64,

    /// Personal apps suspended on the owner's request, independent of the budget
    pub explicit_suspend: bool,

    /// Wall-clock deadline, or one of `DEADLINE_UNSET` / `DEADLINE_EXPIRED`
    pub deadline: i64,

    /// Wall-clock time the current deadline was armed
    pub armed_at: i64,

    pub notice: NoticeState,

    /// Committed suspension state of the personal apps
    pub apps_suspended: bool,

    pub suspended_packages: BTreeSet<String>,

    /// Packages whose last suspend/unsuspend call failed
    pub failed_packages: BTreeSet<String>,
}

/// Inputs for one evaluation of the budget state machine
#[derive(Debug, Clone, Copy)]
pub struct BudgetInputs {
    pub now: i64,
    pub warning_period: i64,
    pub profile_off: bool,
}

/// What the outside world should look like after an evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetPlan {
    pub phase: BudgetPhase,
    /// Absolute wall time for the next alarm, `None` to cancel
    pub alarm_at: Option<i64>,
    pub notice: NoticeState,
    pub suspend: bool,
}

/// How a clock change affected a running deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockAdjustment {
    Unaffected,
    Shifted,
    Expired,
    Rearmed,
}

impl ProfileTimeBudget {
    pub fn phase(&self, now: i64, warning_period: i64) -> BudgetPhase {
        match self.deadline {
            DEADLINE_EXPIRED => BudgetPhase::Expired,
            DEADLINE_UNSET => BudgetPhase::None,
            deadline if now > deadline => BudgetPhase::Expired,
            deadline if now >= deadline.saturating_sub(warning_period) => BudgetPhase::Warning,
            _ => BudgetPhase::Armed,
        }
    }

    /// Advance the state machine to `inputs.now` and describe the desired
    /// alarm, notice and suspension state. Calling this twice with the same
    /// inputs yields the same plan.
    pub fn evaluate(&mut self, inputs: &BudgetInputs) -> BudgetPlan {
        if !inputs.profile_off || self.explicit_suspend {
            self.clear_deadline();
        } else if self.deadline == DEADLINE_UNSET {
            if self.max_off_millis > 0 {
                self.armed_at = inputs.now;
                self.deadline = inputs.now.saturating_add(self.max_off_millis);
            }
        } else if self.deadline > 0 && inputs.now > self.deadline {
            self.deadline = DEADLINE_EXPIRED;
        }

        let phase = self.phase(inputs.now, inputs.warning_period);
        let alarm_at = match phase {
            BudgetPhase::Armed => Some(self.deadline.saturating_sub(inputs.warning_period)),
            BudgetPhase::Warning => Some(self.deadline.saturating_add(1)),
            BudgetPhase::None | BudgetPhase::Expired => None,
        };

        let suspend = self.explicit_suspend || phase == BudgetPhase::Expired;
        let notice = if suspend {
            NoticeState::Suspended
        } else if phase == BudgetPhase::Warning {
            NoticeState::Warning
        } else {
            NoticeState::None
        };

        BudgetPlan {
            phase,
            alarm_at,
            notice,
            suspend,
        }
    }

    /// Change the budget. A running deadline is re-based on its arm time;
    /// removing the budget lifts a budget-driven suspension.
    pub fn set_max_off(&mut self, max_off_millis: i64) {
        self.max_off_millis = max_off_millis.max(0);

        if self.max_off_millis == 0 {
            self.clear_deadline();
        } else if self.deadline > 0 {
            self.deadline = self.armed_at.saturating_add(self.max_off_millis);
        }
    }

    pub fn set_explicit_suspend(&mut self, suspended: bool) {
        self.explicit_suspend = suspended;
    }

    /// React to the wall clock moving by `delta` millis relative to the
    /// monotonic clock. `now` is the post-jump wall time.
    pub fn on_clock_changed(&mut self, now: i64, delta: i64) -> ClockAdjustment {
        if self.deadline <= 0 || delta == 0 {
            return ClockAdjustment::Unaffected;
        }

        let before = now.saturating_sub(delta);
        if before >= self.armed_at && before <= self.deadline {
            self.armed_at = self.armed_at.saturating_add(delta);
            self.deadline = self.deadline.saturating_add(delta).max(1);
            ClockAdjustment::Shifted
        } else if before > self.deadline {
            // The budget had already run out before the jump
            self.deadline = DEADLINE_EXPIRED;
            ClockAdjustment::Expired
        } else {
            self.clear_deadline();
            ClockAdjustment::Rearmed
        }
    }

    /// Whether the suspender has to be called to reach `desired`
    pub fn needs_suspension_change(&self, desired: bool, retry_failed: bool) -> bool {
        desired != self.apps_suspended || (retry_failed && !self.failed_packages.is_empty())
    }

    /// Packages to pass to the suspender to reach `desired`
    pub fn packages_to_change(&self, desired: bool, personal: Vec<String>) -> Vec<String> {
        if desired {
            personal
        } else {
            self.suspended_packages
                .iter()
                .chain(self.failed_packages.iter())
                .cloned()
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect()
        }
    }

    /// Record the outcome of a suspend/unsuspend call
    pub fn commit_suspension(&mut self, suspended: bool, requested: &[String], failed: Vec<String>) {
        let failed: BTreeSet<String> = failed.into_iter().collect();

        self.suspended_packages = if suspended {
            requested
                .iter()
                .filter(|package| !failed.contains(*package))
                .cloned()
                .collect()
        } else {
            // Packages that could not be unsuspended are still suspended
            failed.clone()
        };
        self.failed_packages = failed;
        self.apps_suspended = suspended;
    }

    fn clear_deadline(&mut self) {
        self.deadline = DEADLINE_UNSET;
        self.armed_at = 0;
    }
}

/// Pairs a wall-clock reading with a monotonic one so later readings can
/// tell a clock change from elapsed time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockAnchor {
    pub wall: i64,
    pub monotonic: i64,
}

impl ClockAnchor {
    pub fn new(wall: i64, monotonic: i64) -> Self {
        Self { wall, monotonic }
    }

    /// Wall-clock movement not explained by elapsed monotonic time
    pub fn drift(&self, wall: i64, monotonic: i64) -> i64 {
        wall.saturating_sub(self.wall)
            .saturating_sub(monotonic.saturating_sub(self.monotonic))
    }
}
