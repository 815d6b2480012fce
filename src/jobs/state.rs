use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessState {
    /// Never started, or fully stopped on request.
    Stopped,
    /// Forked, waiting to survive `starttime`.
    Starting,
    /// Survived `starttime`.
    Running,
    /// Exited while still Starting.
    Backoff,
    /// Stop signal sent, waiting for the exit notification.
    Stopping,
    /// Exited after reaching Running.
    Exited,
    /// Reserved, no policy produces it yet.
    Fatal,
    /// Exit observed from a state that cannot exit. Always a bug.
    Unknown,
}

impl ProcessState {
    pub const ALL: [ProcessState; 8] = [
        ProcessState::Stopped,
        ProcessState::Starting,
        ProcessState::Running,
        ProcessState::Backoff,
        ProcessState::Stopping,
        ProcessState::Exited,
        ProcessState::Fatal,
        ProcessState::Unknown,
    ];

    /// A live child (and a valid pid) exists only in these states.
    pub fn is_alive(self) -> bool {
        matches!(self, ProcessState::Starting | ProcessState::Running | ProcessState::Stopping)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_alive()
    }

    pub fn can_start(self) -> bool {
        matches!(self, ProcessState::Stopped | ProcessState::Backoff | ProcessState::Exited)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProcessState::Stopped => "STOPPED",
            ProcessState::Starting => "STARTING",
            ProcessState::Running => "RUNNING",
            ProcessState::Backoff => "BACKOFF",
            ProcessState::Stopping => "STOPPING",
            ProcessState::Exited => "EXITED",
            ProcessState::Fatal => "FATAL",
            ProcessState::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProcessState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown process state `{s}`"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    /// Created from config, no process spawned yet.
    Empty,
    Starting,
    Running,
    Stopping,
    Stopped,
    /// Marked by the manager: config changed, rebuild once stopped.
    Replace,
    /// Marked by the manager: job left the config, drop once stopped.
    Remove,
}

impl JobState {
    pub const ALL: [JobState; 7] = [
        JobState::Empty,
        JobState::Starting,
        JobState::Running,
        JobState::Stopping,
        JobState::Stopped,
        JobState::Replace,
        JobState::Remove,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Empty => "EMPTY",
            JobState::Starting => "STARTING",
            JobState::Running => "RUNNING",
            JobState::Stopping => "STOPPING",
            JobState::Stopped => "STOPPED",
            JobState::Replace => "REPLACE",
            JobState::Remove => "REMOVE",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown job state `{s}`"))
    }
}
