//! # Nudge Gateway
//!
//! Thin edge in front of the scheduler: a WebSocket hub that carries
//! `notification` and `notification-updated` events to each user's devices,
//! and JSON routes for responses, routine registration and status.

pub mod hub;
pub mod routes;
pub mod server;
pub mod ws;

pub use hub::{PushEnvelope, PushHub};
pub use server::{AppState, build_router, start};
