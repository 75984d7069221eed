pub mod config;
pub mod cube;
pub mod engine;
pub mod error;
pub mod execution;
pub mod harness;
pub mod lease;
pub mod node;
pub mod registry;
pub mod scheduler;
pub mod shutdown;
pub mod store;

pub use error::{CubeForgeError, Result};
