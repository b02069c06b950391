//! Crash-safe ownership transfer
//!
//! A transfer is recorded in a journal before the owner registry and the
//! user's admin data are rewritten, and the journal is removed only after
//! both rewrites are durable. On startup a leftover journal is replayed
//! before anything else is loaded.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{PolicyError, PolicyResult};
use crate::model::{ComponentName, OwnerRegistry, OwnerRole, UserId, UserPolicyData};
use crate::storage::{BlobKey, BlobStore, decode_snapshot, encode_snapshot};

/// An ownership move that has not finished yet
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TransferJournalEntry {
    pub id: Uuid,
    pub source: ComponentName,
    pub target: ComponentName,
    pub user_id: UserId,
    pub role: OwnerRole,
    pub started_at: DateTime<Utc>,
}

impl TransferJournalEntry {
    pub fn new(source: ComponentName, target: ComponentName, user_id: UserId, role: OwnerRole) -> Self {
        Self {
            id: Uuid::new_v4(),
            source,
            target,
            user_id,
            role,
            started_at: Utc::now(),
        }
    }
}

/// Result of applying a journal entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The target owns the user now; `changed` is false on a repeat
    Applied { changed: bool },
    /// The target is gone; the source owns the user (or nobody does)
    TargetMissing,
}

/// Check that `source` may hand its owner role on `user_id` to `target`
pub fn validate(
    owners: &OwnerRegistry,
    data: &UserPolicyData,
    source: &ComponentName,
    target: &ComponentName,
    user_id: UserId,
) -> PolicyResult<OwnerRole> {
    let role = owners.role_of(source, user_id).ok_or_else(|| {
        PolicyError::Precondition(format!("{} is not an owner of user {}", source, user_id))
    })?;

    let target_admin = data.admin(target).ok_or_else(|| {
        PolicyError::TransferRejected(format!("{} is not an active admin on user {}", target, user_id))
    })?;

    if target.package == source.package {
        return Err(PolicyError::TransferRejected(format!(
            "{} is in the same package as the current owner",
            target
        )));
    }

    if !target_admin.identity.supports_transfer {
        return Err(PolicyError::TransferRejected(format!(
            "{} does not support ownership transfer",
            target
        )));
    }

    Ok(role)
}

/// Move the owner role and carry-over state. Applying an entry a second
/// time changes nothing.
pub fn apply(
    entry: &TransferJournalEntry,
    owners: &mut OwnerRegistry,
    data: &mut UserPolicyData,
) -> ApplyOutcome {
    if !data.has_admin(&entry.target) {
        // Fail closed: the source keeps (or gets back) the role
        let holds_target = owners.role_of(&entry.target, entry.user_id) == Some(entry.role);
        if holds_target {
            if data.has_admin(&entry.source) {
                owners.reassign(entry.role, entry.user_id, &entry.source);
            } else {
                owners.clear(entry.role, entry.user_id);
            }
        }
        return ApplyOutcome::TargetMissing;
    }

    let mut changed = false;
    if owners.role_of(&entry.target, entry.user_id) != Some(entry.role) {
        if !owners.reassign(entry.role, entry.user_id, &entry.target) {
            // The assignment vanished; recreate it for the target
            owners.assign(crate::model::OwnerAssignment {
                role: entry.role,
                admin: entry.target.clone(),
                user_id: entry.user_id,
                organization_owned: false,
            });
        }
        changed = true;
    }

    if let Some(source) = data.admin(&entry.source).cloned() {
        if let Some(target) = data.admin_mut(&entry.target) {
            changed |= target.carry_over_from(&source);
        }
        if let Some(source) = data.admin_mut(&entry.source) {
            if source.security_logging_enabled || source.network_logging_enabled {
                source.demote();
                changed = true;
            }
        }
    }

    ApplyOutcome::Applied { changed }
}

/// What startup recovery did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub entry: TransferJournalEntry,
    pub outcome: ApplyOutcome,
}

/// Replay a pending transfer journal, if any. Must run before per-user
/// state is loaded.
pub fn recover_pending(store: &dyn BlobStore) -> Result<Option<RecoveryReport>> {
    let Some(blob) = store.load(BlobKey::TransferJournal)? else {
        return Ok(None);
    };

    let entry: TransferJournalEntry = match decode_snapshot(&blob, "transfer journal") {
        Ok(Some(entry)) => entry,
        Ok(None) => {
            warn!("Discarding transfer journal from an unknown format version");
            store
                .delete(BlobKey::TransferJournal)
                .context("Failed to clear transfer journal")?;
            return Ok(None);
        }
        Err(e) => {
            error!("Unreadable transfer journal, keeping current owners: {:#}", e);
            store
                .delete(BlobKey::TransferJournal)
                .context("Failed to clear transfer journal")?;
            return Ok(None);
        }
    };

    info!(
        "Replaying ownership transfer {} of user {} from {} to {}",
        entry.id, entry.user_id, entry.source, entry.target
    );

    let mut owners: OwnerRegistry = match store.load(BlobKey::Owners)? {
        Some(blob) => decode_snapshot(&blob, "owners")?.unwrap_or_default(),
        None => OwnerRegistry::default(),
    };
    let user_key = BlobKey::User(entry.user_id);
    let mut data: UserPolicyData = match store.load(user_key)? {
        Some(blob) => decode_snapshot(&blob, "user")?.unwrap_or_default(),
        None => UserPolicyData::default(),
    };

    let outcome = apply(&entry, &mut owners, &mut data);
    if outcome == ApplyOutcome::TargetMissing {
        error!(
            "Ownership transfer {} failed: target {} is no longer installed on user {}; {} remains owner",
            entry.id, entry.target, entry.user_id, entry.source
        );
    }

    store
        .store(user_key, &encode_snapshot(&data)?)
        .context("Failed to persist user state during transfer recovery")?;
    store
        .store(BlobKey::Owners, &encode_snapshot(&owners)?)
        .context("Failed to persist owners during transfer recovery")?;
    store
        .delete(BlobKey::TransferJournal)
        .context("Failed to clear transfer journal")?;

    Ok(Some(RecoveryReport { entry, outcome }))
}
