//! Shared fixtures for engine tests

use std::sync::Arc;

use super::{EngineSettings, PolicyStore};
use crate::access::CallerIdentity;
use crate::model::{AdminIdentity, ComponentName, UserId, UserInfo};
use crate::platform::Clock;
use crate::platform::testing::Fakes;
use crate::storage::MemoryBlobStore;

pub const T0: i64 = 1_700_000_000_000;
pub const HOUR: i64 = 60 * 60 * 1000;
pub const DAY: i64 = 24 * HOUR;

pub const DO_UID: u32 = 10_050;
pub const TARGET_UID: u32 = 10_060;
pub const PO_UID: u32 = 1_010_070;
pub const WORK_PROFILE: UserId = 10;
pub const SECONDARY_USER: UserId = 11;

pub fn do_component() -> ComponentName {
    ComponentName::new("com.example.mdm", "com.example.mdm.AdminReceiver")
}

pub fn target_component() -> ComponentName {
    ComponentName::new("com.example.next", "com.example.next.AdminReceiver")
}

pub fn po_component() -> ComponentName {
    ComponentName::new("com.example.work", "com.example.work.AdminReceiver")
}

pub struct Harness {
    pub engine: PolicyStore,
    pub store: Arc<MemoryBlobStore>,
    pub fakes: Fakes,
    users: Vec<UserInfo>,
}

impl Harness {
    pub fn new(users: &[UserInfo]) -> Self {
        Self::open_with(Arc::new(MemoryBlobStore::new()), users)
    }

    pub fn open_with(store: Arc<MemoryBlobStore>, users: &[UserInfo]) -> Self {
        Self::open_at(store, users, T0, EngineSettings::default())
    }

    fn open_at(store: Arc<MemoryBlobStore>, users: &[UserInfo], now: i64, settings: EngineSettings) -> Self {
        let fakes = Fakes::new(now);
        let engine = PolicyStore::open(
            settings,
            users.to_vec(),
            store.clone(),
            fakes.collaborators(),
        )
        .unwrap();

        Self {
            engine,
            store,
            fakes,
            users: users.to_vec(),
        }
    }

    /// Open a fresh engine on the same store, as after a restart
    pub fn reopen(&self) -> Self {
        self.reopen_with(EngineSettings::default())
    }

    pub fn reopen_with(&self, settings: EngineSettings) -> Self {
        Self::open_at(self.store.clone(), &self.users, self.fakes.clock.now_millis(), settings)
    }

    pub fn activate(&self, component: ComponentName, user_id: UserId, uid: u32) {
        self.engine
            .activate_admin(
                &CallerIdentity::system(),
                AdminIdentity {
                    component,
                    user_id,
                    uid,
                    test_only: false,
                    supports_transfer: true,
                },
            )
            .unwrap();
    }

    /// System user with a device owner and a second admin able to take over
    pub fn with_device_owner() -> Self {
        Self::with_device_owner_and(&[])
    }

    pub fn with_device_owner_and(extra_users: &[UserInfo]) -> Self {
        let mut users = vec![UserInfo::full(0)];
        users.extend_from_slice(extra_users);
        let harness = Self::new(&users);

        harness.activate(do_component(), 0, DO_UID);
        harness.activate(target_component(), 0, TARGET_UID);
        harness
            .engine
            .set_device_owner(&CallerIdentity::system(), &do_component(), 0)
            .unwrap();
        harness
    }

    /// System user plus a managed profile with a profile owner
    pub fn with_work_profile(separate_challenge: bool, organization_owned: bool) -> Self {
        let harness = Self::new(&[
            UserInfo::full(0),
            UserInfo::managed_profile(WORK_PROFILE, 0, separate_challenge),
        ]);

        harness.activate(po_component(), WORK_PROFILE, PO_UID);
        harness
            .engine
            .set_profile_owner(&CallerIdentity::system(), &po_component(), WORK_PROFILE)
            .unwrap();
        if organization_owned {
            harness
                .engine
                .set_organization_owned(&CallerIdentity::system(), WORK_PROFILE, true)
                .unwrap();
        }
        harness
    }

    pub fn do_caller(&self) -> CallerIdentity {
        CallerIdentity::admin(do_component(), 0, DO_UID)
    }

    pub fn po_caller(&self) -> CallerIdentity {
        CallerIdentity::admin(po_component(), WORK_PROFILE, PO_UID)
    }
}
