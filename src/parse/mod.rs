#[allow(clippy::module_inception)]
mod parse;

pub use parse::{
    parse_signal, parse_str, parser, JobConfig, OneOrMany, RestartPolicy, DEFAULT_NUMPROCS, DEFAULT_START_RETRIES,
    DEFAULT_START_TIME, DEFAULT_STOP_TIME, DEFAULT_UMASK,
};
