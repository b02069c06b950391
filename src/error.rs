use thiserror::Error;

use crate::access::Operation;
use crate::model::{ComponentName, UserId};

/// Errors returned by policy engine operations
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("caller uid {uid} is not permitted to {operation:?}")]
    NotPermitted { operation: Operation, uid: u32 },

    #[error("unknown user {0}")]
    UnknownUser(UserId),

    #[error("admin {component} is not active on user {user_id}")]
    UnknownAdmin {
        component: ComponentName,
        user_id: UserId,
    },

    #[error("admin {component} is already active on user {user_id}")]
    AdminExists {
        component: ComponentName,
        user_id: UserId,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("ownership transfer rejected: {0}")]
    TransferRejected(String),

    #[error("policy state lock poisoned")]
    LockPoisoned,

    /// In-memory state was updated but could not be persisted
    #[error("failed to persist policy state")]
    Storage(#[from] anyhow::Error),
}

pub type PolicyResult<T> = std::result::Result<T, PolicyError>;
