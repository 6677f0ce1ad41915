//! # Kernelkit - Jupyter kernel protocol server
//!
//! Speaks the Jupyter messaging protocol over ZeroMQ and delegates all
//! language work to a pluggable [`evaluator::Evaluator`]:
//! - Signed multi-frame wire codec (HMAC-SHA256)
//! - Five-socket topology: shell, control, stdin, iopub, heartbeat
//! - Dispatch loop with busy/idle bracketing and control priority
//! - Execution sessions with captured stdout/stderr and rich display data
//! - Object registry with per-object locks for host-side handles
//!
//! ## Architecture
//!
//! ```text
//!   front-end ──shell/control──▶ listeners ──queues──▶ ┌──────────────┐
//!                                                      │    Kernel    │──▶ Evaluator
//!   front-end ◀──────iopub───── OutboundSocket ◀────── │ (dispatch)   │
//!   front-end ◀──────reply───── OutboundSocket ◀────── └──────────────┘
//!   front-end ◀─────▶ heartbeat echo (independent task)
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod data;
pub mod evaluator;
pub mod kernel;
pub mod registry;
pub mod transport;
pub mod types;
pub mod wire;

// Internal utilities
pub mod observability;

pub use types::{ConnectionInfo, Error, KernelConfig, Result};
