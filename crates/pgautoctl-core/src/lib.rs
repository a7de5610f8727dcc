//! # pgautoctl-core
//!
//! Core library for the pg_autoctl keeper: the per-node control agent that
//! drives a local PostgreSQL instance toward the role a central monitor
//! assigns to it.
//!
//! This crate holds everything that is pure policy and durable state:
//!
//! - **State machine**: node roles, the `(from, to)` transition table, and
//!   the action-program executor
//! - **Durable state**: the crash-atomic keeper state record
//! - **Partition detection**: when a primary that lost the monitor must
//!   demote itself
//! - **Adapters**: the PostgreSQL controller and monitor client contracts;
//!   the daemon crate ships the real implementations
//!
//! ## Example
//!
//! ```rust,no_run
//! use pgautoctl_core::state::{KeeperState, StateStore};
//!
//! let store = StateStore::new("/var/lib/postgres/data/pg_autoctl.state");
//! let mut state = KeeperState::new();
//! state.touch_monitor_contact(1_722_000_000);
//! store.write(&state).expect("state file is writable");
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod fakes;
pub mod fsm;
pub mod monitor;
pub mod node_state;
pub mod partition;
pub mod pg;
pub mod pidfile;
pub mod state;

pub use config::KeeperConfig;
pub use error::{ExitCode, KeeperError, Result};
pub use node_state::NodeState;
pub use state::{KeeperState, StateStore};

/// Version reported by the CLI and the status server.
pub const KEEPER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Monitor extension version this keeper speaks.
pub const EXTENSION_VERSION: &str = "1.0";

/// Status server API version.
pub const HTTP_API_VERSION: &str = "1.0";
