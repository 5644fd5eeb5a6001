//! Test doubles for the reminder engine.
//!
//! - [`RecordingTransport`]: captures every push, can be switched to fail
//! - [`FlakyNotificationStore`]: wraps a real store and fails the next N calls

pub mod flaky_store;
pub mod recording_transport;

pub use flaky_store::FlakyNotificationStore;
pub use recording_transport::{RecordingTransport, SentPush};
