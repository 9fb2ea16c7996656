//! Routing new tasks to their workers.

pub mod gateway;
pub mod message;

pub use gateway::{DispatchGateway, Route};
pub use message::{JobMessage, TextExtractedMessage};
