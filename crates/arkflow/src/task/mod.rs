//! Processing tasks: the domain model and its durable store.

pub mod model;
pub mod store;

pub use model::{
    Metadata, ProcessingTask, ProcessingType, TaskPage, TaskStatus, TaskUpdate,
    UNKNOWN_FAILURE_REASON,
};
pub use store::{CreateOutcome, TaskStore, UpdateOutcome, MAX_PAGE_SIZE};
