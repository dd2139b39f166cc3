//! User-issued ON/OFF commands with optimistic display and confirmation.
//!
//! - [`intent`] - typestate lifecycle of one command
//! - [`dispatcher`] - delivery, confirmation wait, revert on failure

pub mod dispatcher;
pub mod intent;

pub use dispatcher::{CommandConfig, CommandDispatcher, CommandReport, CommandTicket, ControlChannel};
pub use intent::CommandIntent;
