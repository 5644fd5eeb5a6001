//! Collaborator seams consumed by the scheduler core.

pub mod clock;
pub mod metrics;
pub mod store;
pub mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use metrics::MetricsSink;
pub use store::{DeliveryOutcome, NotificationMutator, NotificationStore, OffsetAdjustment, RoutineStore};
pub use transport::PushTransport;
