// crates/weftcore/src/events/mod.rs

mod base;
mod sink;

pub use base::{EventBus, EventType, ExecutionEvent, ExecutionId};
pub use sink::{NotificationSink, TracingSink};
