use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use super::UserId;

/// Package + receiver class identifying an administrator app
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct ComponentName {
    pub package: String,
    pub class: String,
}

impl ComponentName {
    pub fn new(package: impl Into<String>, class: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            class: class.into(),
        }
    }

    /// Parse the flattened `package/class` form. A class starting with `.`
    /// is relative to the package.
    pub fn parse(flat: &str) -> Option<Self> {
        let (package, class) = flat.split_once('/')?;
        if package.is_empty() || class.is_empty() {
            return None;
        }

        let class = if let Some(relative) = class.strip_prefix('.') {
            format!("{}.{}", package, relative)
        } else {
            class.to_string()
        };

        Some(Self::new(package, class))
    }
}

impl fmt::Display for ComponentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.package, self.class)
    }
}

/// One registered administrator app on one user
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AdminIdentity {
    pub component: ComponentName,
    pub user_id: UserId,
    pub uid: u32,

    /// Installed as a test-only package (may be removed without ceremony)
    #[serde(default)]
    pub test_only: bool,

    /// Declares support for receiving transferred ownership
    #[serde(default)]
    pub supports_transfer: bool,
}

/// Legacy password quality, ordered from weakest to strongest
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PasswordQuality {
    #[default]
    Unspecified,
    BiometricWeak,
    Something,
    Numeric,
    NumericComplex,
    Alphabetic,
    Alphanumeric,
    Complex,
    Managed,
}

impl PasswordQuality {
    /// Platform constant for this quality
    pub fn constant(self) -> u32 {
        match self {
            Self::Unspecified => 0,
            Self::BiometricWeak => 0x8000,
            Self::Something => 0x10000,
            Self::Numeric => 0x20000,
            Self::NumericComplex => 0x30000,
            Self::Alphabetic => 0x40000,
            Self::Alphanumeric => 0x50000,
            Self::Complex => 0x60000,
            Self::Managed => 0x80000,
        }
    }
}

/// Coarse password complexity bucket
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PasswordComplexity {
    #[default]
    None,
    Low,
    Medium,
    High,
}

/// Keyguard feature bits an admin may disable
pub mod keyguard {
    pub const DISABLE_WIDGETS_ALL: u32 = 1;
    pub const DISABLE_SECURE_CAMERA: u32 = 1 << 1;
    pub const DISABLE_SECURE_NOTIFICATIONS: u32 = 1 << 2;
    pub const DISABLE_UNREDACTED_NOTIFICATIONS: u32 = 1 << 3;
    pub const DISABLE_TRUST_AGENTS: u32 = 1 << 4;
    pub const DISABLE_FINGERPRINT: u32 = 1 << 5;
    pub const DISABLE_REMOTE_INPUT: u32 = 1 << 6;
    pub const DISABLE_FACE: u32 = 1 << 7;
    pub const DISABLE_IRIS: u32 = 1 << 8;
    pub const DISABLE_SHORTCUTS_ALL: u32 = 1 << 9;
    pub const DISABLE_FEATURES_ALL: u32 = 0x7fff_ffff;

    pub const DISABLE_BIOMETRICS: u32 = DISABLE_FINGERPRINT | DISABLE_FACE | DISABLE_IRIS;

    /// Bits that only make sense on the profile's own keyguard
    pub const PROFILE_ONLY: u32 = DISABLE_UNREDACTED_NOTIFICATIONS;

    /// Bits of a profile admin's own set that reach the parent keyguard
    pub const PROFILE_AFFECTS_PARENT: u32 = DISABLE_TRUST_AGENTS | DISABLE_BIOMETRICS;

    /// Bits a profile admin may set through its parent instance
    pub const PARENT_INSTANCE_LEGAL: u32 = DISABLE_FEATURES_ALL & !PROFILE_ONLY;
}

/// Restrictions declared by a single admin
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminPolicySet {
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
}

impl AdminPolicySet {
    /// Set the legacy quality; clears this admin's complexity requirement
    pub fn set_password_quality(&mut self, quality: PasswordQuality) {
        self.password_quality = quality;
        self.required_complexity = PasswordComplexity::None;
    }

    /// Set the coarse complexity; resets quality and its sub-fields
    pub fn set_required_complexity(&mut self, complexity: PasswordComplexity) {
        self.reset_password_requirements();
        self.required_complexity = complexity;
    }

    fn reset_password_requirements(&mut self) {
        self.password_quality = PasswordQuality::Unspecified;
        self.password_min_length = 0;
        self.password_min_letters = 0;
        self.password_min_uppercase = 0;
        self.password_min_lowercase = 0;
        self.password_min_numeric = 0;
        self.password_min_symbols = 0;
        self.password_min_non_letter = 0;
    }

    /// Neither the quality path nor the complexity path has been used
    pub fn password_requirements_unset(&self) -> bool {
        self.password_quality == PasswordQuality::Unspecified
            && self.required_complexity == PasswordComplexity::None
            && self.password_min_length == 0
            && self.password_min_letters == 0
            && self.password_min_uppercase == 0
            && self.password_min_lowercase == 0
            && self.password_min_numeric == 0
            && self.password_min_symbols == 0
            && self.password_min_non_letter == 0
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Copy `source`'s values into fields this set still holds at their
    /// defaults. Returns true if anything changed.
    ///
    /// The password path moves as a unit so a target never ends up with both
    /// a quality and a complexity.
    pub fn carry_over_from(&mut self, source: &AdminPolicySet) -> bool {
        let before = self.clone();

        if self.password_requirements_unset() {
            self.password_quality = source.password_quality;
            self.password_min_length = source.password_min_length;
            self.password_min_letters = source.password_min_letters;
            self.password_min_uppercase = source.password_min_uppercase;
            self.password_min_lowercase = source.password_min_lowercase;
            self.password_min_numeric = source.password_min_numeric;
            self.password_min_symbols = source.password_min_symbols;
            self.password_min_non_letter = source.password_min_non_letter;
            self.required_complexity = source.required_complexity;
        }

        fill_zero(&mut self.password_history_length, source.password_history_length);
        fill_zero(
            &mut self.password_expiration_timeout_millis,
            source.password_expiration_timeout_millis,
        );
        fill_zero(&mut self.max_time_to_lock_millis, source.max_time_to_lock_millis);
        fill_zero(
            &mut self.max_failed_attempts_before_wipe,
            source.max_failed_attempts_before_wipe,
        );
        fill_zero(&mut self.keyguard_disabled_features, source.keyguard_disabled_features);

        if !self.camera_disabled {
            self.camera_disabled = source.camera_disabled;
        }
        if !self.screen_capture_disabled {
            self.screen_capture_disabled = source.screen_capture_disabled;
        }
        if self.user_restrictions.is_empty() {
            self.user_restrictions = source.user_restrictions.clone();
        }

        *self != before
    }
}

fn fill_zero<T: Default + PartialEq + Copy>(target: &mut T, source: T) {
    if *target == T::default() {
        *target = source;
    }
}

/// An active admin: identity plus the policies it owns
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ActiveAdmin {
    pub identity: AdminIdentity,

    #[serde(default)]
    pub policy: AdminPolicySet,

    /// Policies a managed-profile admin applies to the parent user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_policy: Option<AdminPolicySet>,

    #[serde(default)]
    pub security_logging_enabled: bool,

    #[serde(default)]
    pub network_logging_enabled: bool,
}

impl ActiveAdmin {
    pub fn new(identity: AdminIdentity) -> Self {
        Self {
            identity,
            policy: AdminPolicySet::default(),
            parent_policy: None,
            security_logging_enabled: false,
            network_logging_enabled: false,
        }
    }

    pub fn component(&self) -> &ComponentName {
        &self.identity.component
    }

    /// Take over `source`'s carry-over-eligible state without clobbering
    /// anything this admin already set itself
    pub fn carry_over_from(&mut self, source: &ActiveAdmin) -> bool {
        let mut changed = self.policy.carry_over_from(&source.policy);

        if let Some(source_parent) = &source.parent_policy {
            let parent = self.parent_policy.get_or_insert_with(AdminPolicySet::default);
            changed |= parent.carry_over_from(source_parent);
        }

        if !self.security_logging_enabled && source.security_logging_enabled {
            self.security_logging_enabled = true;
            changed = true;
        }
        if !self.network_logging_enabled && source.network_logging_enabled {
            self.network_logging_enabled = true;
            changed = true;
        }

        changed
    }

    /// Drop owner-only state once this admin stops being an owner
    pub fn demote(&mut self) {
        self.security_logging_enabled = false;
        self.network_logging_enabled = false;
    }
}
