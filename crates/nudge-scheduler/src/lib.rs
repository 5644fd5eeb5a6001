//! # Nudge Scheduler
//!
//! The reminder engine: finds routines due this minute, turns them into
//! notifications, pushes them to users, re-delivers snoozes and applies
//! user responses.
//!
//! ## Design Principles
//! - No external services: SQLite persistence survives restarts
//! - Tokio timers only, idle between ticks
//! - One `processing` flag per notification guards every response and delivery
//! - Side effects after a committed response are best-effort
//!
//! ## Architecture
//! ```text
//! SchedulerHandle
//!   ├── due-scan (60s)
//!   │     ├── DueRoutineMatcher   → routines firing this minute
//!   │     ├── DuplicateSuppressor → skip if an open one is nearby
//!   │     ├── NotificationFactory → pending, scheduled_for = T + offset
//!   │     └── PendingSweep        → Dispatcher → PushTransport
//!   ├── snooze-scan (30s) → SnoozeScanner → Dispatcher
//!   ├── retention-sweep (daily) → RetentionSweeper
//!   └── respond() → ResponseProcessor
//!                     ├── transactional_update (processing CAS)
//!                     ├── MetricsSink
//!                     ├── AdaptiveTimingUpdater
//!                     └── notification-updated push
//! ```

pub mod adaptive;
pub mod dedup;
pub mod dispatch;
pub mod engine;
pub mod factory;
pub mod matcher;
pub mod pending;
pub mod persistence;
pub mod response;
pub mod retention;
pub mod snooze;

pub use adaptive::{AdaptiveTimingUpdater, adjust_offset};
pub use dispatch::{DispatchOutcome, DispatchTally, Dispatcher};
pub use engine::{DueScanReport, SchedulerDeps, SchedulerHandle, SchedulerStatus};
pub use persistence::{DailyMetrics, SqliteStore};
pub use response::{RespondRequest, RespondResult, ResponsePolicy, ResponseProcessor};
