//! `civitas-auth` — pure authorization boundary.
//!
//! This crate is decoupled from transport and storage. Guards that need data
//! reach it through the [`Directory`] trait.

pub mod actor;
pub mod authorize;
pub mod claims;
pub mod guards;
pub mod roles;
pub mod tier;

pub use actor::{Actor, SystemActor, UserActor};
pub use authorize::{AuthContext, AuthzError, Directory, Guard, GuardChain, ResourceOwner};
pub use claims::{SessionClaims, TokenValidationError, validate_claims};
pub use guards::{RequireOwner, RequireRole, RequireSystem, RequireTier};
pub use roles::Role;
pub use tier::{TierUpgrade, TrustTier};
