//! Caller identity resolution and the per-operation permission table

use std::collections::BTreeSet;

use crate::error::{PolicyError, PolicyResult};
use crate::model::{ComponentName, OwnerRegistry, UserId, UserPolicyData};

/// Uid of the platform itself
pub const SYSTEM_UID: u32 = 1000;

/// Uid of root, treated like the platform
pub const ROOT_UID: u32 = 0;

/// Who is calling, as established by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    pub uid: u32,
    pub user_id: UserId,

    /// Admin component the caller acts as, if any
    pub component: Option<ComponentName>,
}

impl CallerIdentity {
    pub fn system() -> Self {
        Self {
            uid: SYSTEM_UID,
            user_id: crate::model::USER_SYSTEM,
            component: None,
        }
    }

    pub fn admin(component: ComponentName, user_id: UserId, uid: u32) -> Self {
        Self {
            uid,
            user_id,
            component: Some(component),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Capability {
    System,
    ActiveAdmin,
    DeviceOwner,
    ProfileOwner,
    OrgOwnedProfileOwner,
    /// Device owner, or a profile owner on an affiliated user
    AffiliatedOwner,
}

/// Everything a caller may do, resolved once per call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    pub fn has(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }

    pub fn insert(&mut self, capability: Capability) {
        self.0.insert(capability);
    }

    pub fn satisfies(&self, requirement: &[Capability]) -> bool {
        requirement.iter().any(|capability| self.has(*capability))
    }
}

/// Resolve what `caller` is allowed to do on its own user
pub fn resolve_capabilities(
    caller: &CallerIdentity,
    owners: &OwnerRegistry,
    data: Option<&UserPolicyData>,
    user_affiliated: bool,
) -> CapabilitySet {
    let mut set = CapabilitySet::default();

    if caller.uid == SYSTEM_UID || caller.uid == ROOT_UID {
        set.insert(Capability::System);
    }

    let Some(component) = &caller.component else {
        return set;
    };

    let active = data
        .and_then(|data| data.admin(component))
        .is_some_and(|admin| admin.identity.uid == caller.uid);
    if !active {
        return set;
    }
    set.insert(Capability::ActiveAdmin);

    if owners.is_device_owner(component, caller.user_id) {
        set.insert(Capability::DeviceOwner);
        set.insert(Capability::AffiliatedOwner);
    }

    if let Some(owner) = owners
        .profile_owner(caller.user_id)
        .filter(|owner| &owner.admin == component)
    {
        set.insert(Capability::ProfileOwner);
        if owner.organization_owned {
            set.insert(Capability::OrgOwnedProfileOwner);
        }
        if user_affiliated {
            set.insert(Capability::AffiliatedOwner);
        }
    }

    set
}

/// Typed entry points of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    ActivateAdmin,
    RemoveAdmin,
    SetAdminPolicy,
    SetParentPolicy,
    SetUserRestriction,
    SetDeviceOwner,
    SetProfileOwner,
    ClearDeviceOwner,
    ClearProfileOwner,
    SetOrganizationOwned,
    TransferOwnership,
    SetAffiliationIds,
    SetDeviceLogging,
    SetLockTaskPackages,
    SetProfileTimeBudget,
    SetPersonalAppsSuspended,
    GetTransferExtras,
    ManageUsers,
}

impl Operation {
    /// Capabilities of which the caller needs at least one
    pub fn requirement(self) -> &'static [Capability] {
        use Capability::*;

        match self {
            Operation::ActivateAdmin => &[System],
            Operation::RemoveAdmin => &[System, ActiveAdmin],
            Operation::SetAdminPolicy => &[ActiveAdmin],
            Operation::SetParentPolicy => &[ProfileOwner],
            Operation::SetUserRestriction => &[DeviceOwner, ProfileOwner],
            Operation::SetDeviceOwner => &[System],
            Operation::SetProfileOwner => &[System],
            Operation::ClearDeviceOwner => &[System, DeviceOwner],
            Operation::ClearProfileOwner => &[System, ProfileOwner],
            Operation::SetOrganizationOwned => &[System],
            Operation::TransferOwnership => &[DeviceOwner, ProfileOwner],
            Operation::SetAffiliationIds => &[DeviceOwner, ProfileOwner],
            Operation::SetDeviceLogging => &[DeviceOwner],
            Operation::SetLockTaskPackages => &[AffiliatedOwner],
            Operation::SetProfileTimeBudget => &[OrgOwnedProfileOwner],
            Operation::SetPersonalAppsSuspended => &[OrgOwnedProfileOwner],
            Operation::GetTransferExtras => &[DeviceOwner, ProfileOwner],
            Operation::ManageUsers => &[System],
        }
    }

    pub fn check(self, caller: &CallerIdentity, capabilities: &CapabilitySet) -> PolicyResult<()> {
        if capabilities.satisfies(self.requirement()) {
            Ok(())
        } else {
            Err(PolicyError::NotPermitted {
                operation: self,
                uid: caller.uid,
            })
        }
    }
}
