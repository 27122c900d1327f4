#![deny(clippy::as_conversions)]

pub mod clock;
pub mod cluster;
pub mod engine;
pub mod error;
pub mod ha;
pub mod health;
pub mod lease;
mod node;
pub mod probe;
pub mod record;
pub mod store;
mod task;

pub use node::*;
