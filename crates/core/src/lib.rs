//! `civitas-core` — domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod error;
pub mod id;
pub mod validate;

pub use error::{DomainError, DomainResult};
pub use id::{AggregateRef, CommunityId, ThreadId, UserId};
pub use validate::{Validate, require_text};
