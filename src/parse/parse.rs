use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use nix::sys::signal::Signal;
use serde::de::{Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use serde_yaml::Value;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};

pub const DEFAULT_NUMPROCS: usize = 1;
pub const DEFAULT_UMASK: u32 = 0o022;
pub const DEFAULT_START_RETRIES: u32 = 3;
pub const DEFAULT_START_TIME: Duration = Duration::from_secs(1);
pub const DEFAULT_STOP_TIME: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    Never,
    Always,
    OnFailure,
}

impl FromStr for RestartPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "true" | "always" => Ok(RestartPolicy::Always),
            "false" | "never" => Ok(RestartPolicy::Never),
            "unexpected" | "onfailure" | "on_failure" | "on-failure" => Ok(RestartPolicy::OnFailure),
            other => Err(format!("unknown autorestart value `{other}`")),
        }
    }
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartPolicy::Never => write!(f, "never"),
            RestartPolicy::Always => write!(f, "always"),
            RestartPolicy::OnFailure => write!(f, "unexpected"),
        }
    }
}

/// Accepts `TERM` as well as `SIGTERM`, case-insensitively.
pub fn parse_signal(name: &str) -> Option<Signal> {
    let upper = name.trim().to_ascii_uppercase();
    let short = upper.strip_prefix("SIG").unwrap_or(&upper);
    match short {
        "HUP" => Some(Signal::SIGHUP),
        "INT" => Some(Signal::SIGINT),
        "TERM" => Some(Signal::SIGTERM),
        "QUIT" => Some(Signal::SIGQUIT),
        "KILL" => Some(Signal::SIGKILL),
        "USR1" => Some(Signal::SIGUSR1),
        "USR2" => Some(Signal::SIGUSR2),
        _ => None,
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
enum Flag {
    Bool(bool),
    Text(String),
}

#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
enum Umask {
    // `umask: 022` arrives as the integer 22
    Number(u32),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct RawJob {
    cmd: Option<String>,
    numprocs: Option<usize>,
    umask: Option<Umask>,
    workingdir: Option<PathBuf>,
    autostart: Option<bool>,
    autorestart: Option<Flag>,
    exitcodes: Option<OneOrMany<i32>>,
    startretries: Option<u32>,
    starttime: Option<u64>,
    stopsignal: Option<String>,
    stoptime: Option<u64>,
    stdout: Option<PathBuf>,
    stderr: Option<PathBuf>,
    env: Option<BTreeMap<String, Value>>,
}

/// Immutable snapshot of one job entry. Equality is structural and drives reload reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobConfig {
    pub name: String,
    pub cmd: String,
    pub working_dir: PathBuf,
    pub numprocs: usize,
    pub umask: u32,
    pub autostart: bool,
    pub restart_policy: RestartPolicy,
    pub exit_codes: BTreeSet<i32>,
    pub start_retries: u32,
    pub start_time: Duration,
    pub stop_time: Duration,
    pub stop_signal: Signal,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl JobConfig {
    /// A job running `cmd` with every other field at its default.
    pub fn new(name: impl Into<String>, cmd: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cmd: cmd.into(),
            working_dir: PathBuf::from("."),
            numprocs: DEFAULT_NUMPROCS,
            umask: DEFAULT_UMASK,
            autostart: true,
            restart_policy: RestartPolicy::OnFailure,
            exit_codes: BTreeSet::from([0]),
            start_retries: DEFAULT_START_RETRIES,
            start_time: DEFAULT_START_TIME,
            stop_time: DEFAULT_STOP_TIME,
            stop_signal: Signal::SIGTERM,
            stdout: None,
            stderr: None,
            env: BTreeMap::new(),
        }
    }

    /// Shell-style split of `cmd`.
    pub fn argv(&self) -> Result<Vec<String>> {
        let invalid = |reason: String| Error::InvalidJob {
            name: self.name.clone(),
            reason,
        };
        let argv = shell_words::split(&self.cmd).map_err(|e| invalid(format!("cannot tokenize cmd: {e}")))?;
        if argv.is_empty() {
            return Err(invalid("cmd is empty".into()));
        }
        Ok(argv)
    }

    fn from_raw(name: &str, raw: RawJob) -> std::result::Result<Self, String> {
        let mut config = JobConfig::new(name, raw.cmd.ok_or("cmd is required")?);

        if let Some(numprocs) = raw.numprocs {
            if numprocs == 0 {
                return Err("numprocs must be at least 1".into());
            }
            config.numprocs = numprocs;
        }
        if let Some(umask) = raw.umask {
            config.umask = parse_umask(umask)?;
        }
        if let Some(dir) = raw.workingdir {
            config.working_dir = dir;
        }
        if let Some(autostart) = raw.autostart {
            config.autostart = autostart;
        }
        if let Some(flag) = raw.autorestart {
            config.restart_policy = match flag {
                Flag::Bool(true) => RestartPolicy::Always,
                Flag::Bool(false) => RestartPolicy::Never,
                Flag::Text(text) => text.parse()?,
            };
        }
        if let Some(codes) = raw.exitcodes {
            config.exit_codes = match codes {
                OneOrMany::One(code) => BTreeSet::from([code]),
                OneOrMany::Many(codes) => codes.into_iter().collect(),
            };
        }
        if let Some(retries) = raw.startretries {
            config.start_retries = retries;
        }
        if let Some(secs) = raw.starttime {
            config.start_time = Duration::from_secs(secs);
        }
        if let Some(secs) = raw.stoptime {
            config.stop_time = Duration::from_secs(secs);
        }
        if let Some(signal) = raw.stopsignal {
            config.stop_signal = parse_signal(&signal).ok_or_else(|| format!("unknown stopsignal `{signal}`"))?;
        }
        config.stdout = raw.stdout.and_then(|path| redirect_target(name, "stdout", path));
        config.stderr = raw.stderr.and_then(|path| redirect_target(name, "stderr", path));
        if let Some(env) = raw.env {
            for (key, value) in env {
                let value = match value {
                    Value::String(s) => s,
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    Value::Null => String::new(),
                    _ => return Err(format!("env value for `{key}` must be a scalar")),
                };
                config.env.insert(key, value);
            }
        }

        // exec needs NUL-free strings; reject here so the entry is skipped instead of failing at start
        config.argv().map_err(|e| e.to_string())?;
        let has_nul = config.cmd.contains('\0')
            || config
                .env
                .iter()
                .any(|(k, v)| k.contains('\0') || k.contains('=') || v.contains('\0'));
        if has_nul {
            return Err("cmd or env contains a NUL byte or an invalid variable name".into());
        }
        Ok(config)
    }
}

fn parse_umask(umask: Umask) -> std::result::Result<u32, String> {
    let text = match umask {
        Umask::Number(n) => format!("{n:03}"),
        Umask::Text(text) => text,
    };
    if text.len() != 3 || !text.chars().all(|c| ('0'..='7').contains(&c)) {
        return Err(format!("invalid umask `{text}`, expected three octal digits"));
    }
    u32::from_str_radix(&text, 8).map_err(|e| e.to_string())
}

fn redirect_target(job: &str, stream: &str, path: PathBuf) -> Option<PathBuf> {
    let parent_exists = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.is_dir(),
        _ => true,
    };
    if !parent_exists {
        warn!(job, stream, path = %path.display(), "directory of redirect path does not exist, output discarded");
        return None;
    }
    Some(path)
}

// Keeps every `name: entry` pair in document order, duplicates included.
struct JobEntries(Vec<(String, Value)>);

impl<'de> Deserialize<'de> for JobEntries {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct EntriesVisitor;

        impl<'de> Visitor<'de> for EntriesVisitor {
            type Value = JobEntries;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping of job names to job definitions")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<JobEntries, A::Error> {
                let mut entries = Vec::new();
                while let Some((name, body)) = map.next_entry::<String, Value>()? {
                    entries.push((name, body));
                }
                Ok(JobEntries(entries))
            }
        }

        deserializer.deserialize_map(EntriesVisitor)
    }
}

#[derive(Deserialize)]
struct ConfigFile {
    jobs: Option<JobEntries>,
}

/*
    @@@
    @parse_str();
    . Hands the raw YAML text to serde_yaml and walks the `jobs` mapping entry by entry.
    . A malformed entry or a duplicated name is logged and skipped.
    . Only a broken document or a missing `jobs` node is an error.
*/
pub fn parse_str(text: &str, origin: &str) -> Result<BTreeMap<String, JobConfig>> {
    let parse_error = |reason: String| Error::ConfigParse {
        path: origin.to_string(),
        reason,
    };

    let file: ConfigFile = serde_yaml::from_str(text).map_err(|e| parse_error(e.to_string()))?;
    let entries = file.jobs.ok_or_else(|| parse_error("no `jobs` node found".into()))?;

    let mut configs = BTreeMap::new();
    for (name, body) in entries.0 {
        if configs.contains_key(&name) {
            warn!(job = %name, "duplicate job name, skipping");
            continue;
        }
        let parsed = serde_yaml::from_value::<RawJob>(body)
            .map_err(|e| e.to_string())
            .and_then(|raw| JobConfig::from_raw(&name, raw));
        match parsed {
            Ok(config) => {
                debug!(job = %name, "parsed job");
                configs.insert(name, config);
            }
            Err(reason) => error!(job = %name, %reason, "failed to parse job, skipping"),
        }
    }
    Ok(configs)
}

/*
    @@@
    @parser();
    . Reads the content of the config file into a String. Any I/O error is returned as a ConfigParse error.
    . Delegates to parse_str() for the YAML handling.
*/
pub fn parser(path: impl AsRef<Path>) -> Result<BTreeMap<String, JobConfig>> {
    let path = path.as_ref();
    let origin = path.display().to_string();
    let text = fs::read_to_string(path).map_err(|e| Error::ConfigParse {
        path: origin.clone(),
        reason: e.to_string(),
    })?;
    parse_str(&text, &origin)
}
