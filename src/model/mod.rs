//! Persistent data model: admins, their policy sets, owners and users

mod admin;
mod owner;
mod user;

pub use admin::{
    ActiveAdmin, AdminIdentity, AdminPolicySet, ComponentName, PasswordComplexity,
    PasswordQuality, keyguard,
};
pub use owner::{OwnerAssignment, OwnerRegistry, OwnerRole};
pub use user::{UserInfo, UserPolicyData};

/// Numeric user id
pub type UserId = u32;

/// The system user, always present and always affiliated
pub const USER_SYSTEM: UserId = 0;
