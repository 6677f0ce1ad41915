//! Core types for the kernel.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (MessageId, SessionId)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Connection file and kernel tunables

mod config;
mod errors;
mod ids;

pub use config::{ConnectionInfo, KernelConfig, SIGNATURE_SCHEME_HMAC_SHA256};
pub use errors::{Error, Result};
pub use ids::{MessageId, SessionId};
