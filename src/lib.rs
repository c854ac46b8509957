//! # regionmaster
//!
//! Coordinator-side region assignment for a sharded storage service:
//! - Durable, resumable procedures on a fixed worker pool
//! - Assign / Unassign / Move state machines with per-region locking
//! - Batched open/close dispatch to storage nodes with retry classification
//! - Server crash recovery that redrives everything a dead node held
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │            AssignmentManager              │
//! │  assign / unassign / move / reports       │
//! └───────────┬───────────────────┬───────────┘
//!             │ submit            │ signals
//! ┌───────────▼──────────┐  ┌─────▼──────────────┐
//! │ ProcedureExecutor    │  │ Region index       │
//! │  + ProcedureStore    │  │  + region table    │
//! └───────────┬──────────┘  └────────────────────┘
//!             │ open / close
//! ┌───────────▼──────────┐
//! │ RemoteDispatcher     │──── send_batch ────▶ storage nodes
//! └──────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! # 1000 regions on 5 simulated nodes, two of which crash mid-run
//! regionmaster-sim run --regions 1000 --servers 5 --kill 2
//!
//! # Effective configuration (file + REGIONMASTER__* env vars)
//! regionmaster-sim --config regionmaster.toml show-config
//! ```

pub mod assignment;
pub mod common;
pub mod procedure;
pub mod sim;

// Re-export commonly used types
pub use assignment::AssignmentManager;
pub use common::{Config, Error, Result};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
