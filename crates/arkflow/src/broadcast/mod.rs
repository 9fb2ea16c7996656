//! Broadcasting of task lifecycle events to in-process observers.

pub mod task_events;

pub use task_events::{TaskEvent, TaskEventBroadcaster, TaskEventKind};
