//! Common types for the mpool metadata core
//!
//! This crate defines the pieces shared by every mpool crate:
//! - The workspace-wide error type and result alias
//! - Pool configuration (persisted) and metadata tunables (in-memory)
//! - Drive parameters, drive states and media classes

pub mod config;
pub mod error;
pub mod types;

// Re-exports
pub use config::{PmdParams, PoolConfig};
pub use error::{Error, Result};
pub use types::{DriveParms, DriveState, MediaClass, MED_NUMBER, PAGE_SHIFT};
