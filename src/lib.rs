//! Device policy control plane
//!
//! Resolves the policies of every device admin into one effective policy per
//! user, moves device and profile ownership between admins without ever
//! losing an owner, tracks affiliation between users and the device owner,
//! and enforces how long a managed profile may stay turned off.

pub mod access;
pub mod affiliation;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod platform;
pub mod resolver;
pub mod storage;
pub mod time_budget;
pub mod transfer;

pub use engine::{EngineSettings, PolicyStore};
pub use error::{PolicyError, PolicyResult};
