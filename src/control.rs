use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::jobs::{JobManager, StatusTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandType {
    Start,
    Stop,
    Restart,
    Status,
    Reload,
    Terminate,
}

impl CommandType {
    pub const ALL: [CommandType; 6] = [
        CommandType::Start,
        CommandType::Stop,
        CommandType::Restart,
        CommandType::Status,
        CommandType::Reload,
        CommandType::Terminate,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CommandType::Start => "start",
            CommandType::Stop => "stop",
            CommandType::Restart => "restart",
            CommandType::Status => "status",
            CommandType::Reload => "reload",
            CommandType::Terminate => "terminate",
        }
    }

    /// Accepted argument count, inclusive.
    fn arity(self) -> (usize, usize) {
        match self {
            CommandType::Start | CommandType::Stop | CommandType::Restart => (1, 1),
            CommandType::Status => (0, 1),
            CommandType::Reload | CommandType::Terminate => (0, 0),
        }
    }

    pub fn usage(self) -> &'static str {
        match self {
            CommandType::Start => "start <job>",
            CommandType::Stop => "stop <job>",
            CommandType::Restart => "restart <job>",
            CommandType::Status => "status [job]",
            CommandType::Reload => "reload",
            CommandType::Terminate => "terminate",
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CommandType::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown command `{s}`"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    #[serde(rename = "type")]
    pub kind: CommandType,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    Ok,
    Error,
    TypeError,
    ArgumentError,
    TooManyArguments,
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CommandStatus::Ok => "OK",
            CommandStatus::Error => "ERROR",
            CommandStatus::TypeError => "TYPE_ERROR",
            CommandStatus::ArgumentError => "ARGUMENT_ERROR",
            CommandStatus::TooManyArguments => "TOO_MANY_ARGUMENTS",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub status: CommandStatus,
    pub message: String,
}

impl CommandResponse {
    pub fn new(status: CommandStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn ok(message: impl Into<String>) -> Self {
        Self::new(CommandStatus::Ok, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(CommandStatus::Error, message)
    }

    pub fn is_ok(&self) -> bool {
        self.status == CommandStatus::Ok
    }
}

impl Command {
    pub fn new(kind: CommandType, args: Vec<String>) -> Self {
        Self { kind, args }
    }

    /*
        @@@
        @parse();
        . Splits a shell line on whitespace: the first word is the command type, the rest its arguments.
        . An unknown type is a TypeError; the argument count is then checked by validate().
    */
    pub fn parse(line: &str) -> Result<Self, CommandResponse> {
        let mut words = line.split_whitespace();
        let Some(first) = words.next() else {
            return Err(CommandResponse::new(CommandStatus::TypeError, "empty command"));
        };
        let kind = first
            .parse::<CommandType>()
            .map_err(|reason| CommandResponse::new(CommandStatus::TypeError, reason))?;
        let command = Self::new(kind, words.map(String::from).collect());
        command.validate()?;
        Ok(command)
    }

    pub fn validate(&self) -> Result<(), CommandResponse> {
        let (min, max) = self.kind.arity();
        let count = self.args.len();
        if count < min {
            return Err(CommandResponse::new(
                CommandStatus::ArgumentError,
                format!("missing argument, usage: {}", self.kind.usage()),
            ));
        }
        if count > max {
            return Err(CommandResponse::new(
                CommandStatus::TooManyArguments,
                format!("too many arguments, usage: {}", self.kind.usage()),
            ));
        }
        Ok(())
    }

    fn job(&self) -> &str {
        self.args.first().map(String::as_str).unwrap_or_default()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind.as_str())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// What the runtime does after answering a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Terminate,
}

/*
    @@@
    @dispatch();
    . Validates the command again (clients may skip it) and applies it to the JobManager.
    . Job errors become ERROR responses; the daemon keeps running.
    . Terminate only answers, the runtime owns the shutdown drain.
*/
pub fn dispatch(manager: &mut JobManager, command: &Command) -> (CommandResponse, Flow) {
    if let Err(response) = command.validate() {
        warn!(command = %command, status = %response.status, "rejected command");
        return (response, Flow::Continue);
    }
    info!(command = %command, "received command");

    let name = command.job();
    let result = match command.kind {
        CommandType::Start => manager
            .start(name)
            .map(|_| format!("Successfully put job {name} in starting state.")),
        CommandType::Stop => manager
            .stop(name)
            .map(|_| format!("Successfully put job {name} in stopping state.")),
        CommandType::Restart => manager
            .restart(name)
            .map(|_| format!("Successfully put job {name} in restarting state.")),
        CommandType::Status if command.args.is_empty() => {
            let jobs = manager.status();
            if jobs.is_empty() {
                Ok("No jobs configured.".to_string())
            } else {
                Ok(StatusTable(&jobs).to_string())
            }
        }
        CommandType::Status => manager.status_of(name).map(|status| status.to_string()),
        CommandType::Reload => manager
            .reload()
            .map(|_| "Successfully started a reload of the config file.".to_string()),
        CommandType::Terminate => {
            return (CommandResponse::ok("Shutting down taskmasterd."), Flow::Terminate);
        }
    };

    let response = match result {
        Ok(message) => CommandResponse::ok(message),
        Err(err) => {
            warn!(command = %command, error = %err, "command failed");
            CommandResponse::error(err.to_string())
        }
    };
    (response, Flow::Continue)
}
