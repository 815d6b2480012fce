use std::io;
use std::os::unix::io::RawFd;

use thiserror::Error;

use crate::jobs::state::ProcessState;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("job not found: {0}")]
    JobNotFound(String),
    #[error("job {0} is being reloaded, try again once it has stopped")]
    JobReloading(String),
    #[error("failed to parse configuration {path}: {reason}")]
    ConfigParse { path: String, reason: String },
    #[error("invalid job {name}: {reason}")]
    InvalidJob { name: String, reason: String },
    #[error("failed to register fd {fd} with the event loop: {source}")]
    PollRegistration {
        fd: RawFd,
        #[source]
        source: io::Error,
    },
    #[error("fd {0} is not registered with the event loop")]
    NotRegistered(RawFd),
    #[error("fork failed for process {name}: {source}")]
    Fork {
        name: String,
        #[source]
        source: nix::Error,
    },
    #[error("pidfd_open failed for process {name}: {source}")]
    PidfdOpen {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to send {signal} to process {name}: {source}")]
    Signal {
        name: String,
        signal: String,
        #[source]
        source: io::Error,
    },
    #[error("timer error: {0}")]
    Timer(#[source] nix::Error),
    #[error("process {name} cannot {operation} while {state}")]
    InvalidTransition {
        name: String,
        operation: &'static str,
        state: ProcessState,
    },
    #[error("daemon is shutting down")]
    ShuttingDown,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}
