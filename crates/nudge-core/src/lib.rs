//! # Nudge Core
//!
//! Shared domain model for the reminder engine: routines, notifications,
//! the response state machine vocabulary, collaborator traits (stores,
//! push transport, metrics sink, clock), errors and configuration.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::{GatewayConfig, NudgeConfig, SchedulerConfig};
pub use error::{NudgeError, Result};
pub use types::*;
