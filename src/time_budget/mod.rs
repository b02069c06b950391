/// Profile time budget enforcement
///
/// A managed profile may stay turned off only for a limited time. Once the
/// budget runs out the user's personal apps are suspended until the profile
/// is turned back on.
mod budget;

pub use budget::{
    BudgetInputs, BudgetPhase, BudgetPlan, ClockAdjustment, ClockAnchor, DEADLINE_EXPIRED,
    DEADLINE_UNSET, NoticeState, ProfileTimeBudget,
};
