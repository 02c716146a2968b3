//! Lifecycle/stream event model and fan-out.

pub mod model;
pub mod publisher;

pub use model::{
    EventKind, EventPayload, LifecyclePayload, LifecycleType, SOURCE_DB_RECONCILE, StreamBody,
    StreamPayload, TaskEvent,
};
pub use publisher::ProgressPublisher;
