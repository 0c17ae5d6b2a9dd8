//! Common utilities and types shared across FieldSync modules.
//!
//! This module provides foundational types that are used throughout the codebase:
//! the shared error type, entity kinds, local identifier minting and the
//! timestamp formats spoken by the remote API.

pub mod error;
pub mod time;
pub mod types;

pub use error::{Error, Result};
pub use types::{is_local_id, EntityKind, LocalIdGenerator};
