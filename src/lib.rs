/* src/lib.rs */

// Re-export modules for both binaries and tests
pub mod control;
pub mod error;
pub mod ipc;
pub mod jobs;
pub mod logger;
pub mod parse;
pub mod reactor;
pub mod runtime;
pub mod shell;

pub use error::{Error, Result};
