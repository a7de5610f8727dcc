//! # pgautoctl-daemon
//!
//! The keeper service: everything `pg_autoctl run` executes.
//!
//! - **reconcile**: the periodic loop that converges the local PostgreSQL
//!   onto the monitor's assigned role
//! - **service**: supervision of the reconcile loop and the status HTTP
//!   server, with restart policy and signal translation
//! - **httpd**: the read-only status endpoints
//! - **signals**: process-wide signal intake, polled at loop barriers
//! - **pgctl** / **monitor_client**: the production adapters behind the
//!   core crate's contracts

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod httpd;
pub mod monitor_client;
pub mod pgctl;
pub mod reconcile;
pub mod restart;
pub mod service;
pub mod signals;

pub use reconcile::{ReconcileLoop, TickOutcome};
pub use signals::SignalFlags;
