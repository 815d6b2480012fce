use std::fmt;

use chrono::{DateTime, Local};

use crate::jobs::job::Job;
use crate::jobs::process::ProcessHandle;
use crate::jobs::state::{JobState, ProcessState};

const COLUMNS: [(&str, usize); 6] = [
    ("JOB", 16),
    ("STATE", 10),
    ("PROCESS", 20),
    ("PID", 8),
    ("RESTARTS", 8),
    ("STARTED", 19),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessStatus {
    pub name: String,
    pub state: ProcessState,
    pub pid: Option<i32>,
    pub restarts: u32,
    pub started_at: Option<DateTime<Local>>,
    pub exit_code: Option<i32>,
}

impl ProcessStatus {
    pub fn of(process: &ProcessHandle) -> Self {
        Self {
            name: process.name().to_string(),
            state: process.state(),
            pid: process.pid(),
            restarts: process.restarts(),
            started_at: process.started_at(),
            exit_code: process.exit_code(),
        }
    }
}

/// Read-only snapshot of a Job, rendered as a box table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    pub name: String,
    pub state: JobState,
    pub processes: Vec<ProcessStatus>,
}

impl JobStatus {
    pub fn of(job: &Job) -> Self {
        Self {
            name: job.name().to_string(),
            state: job.state(),
            processes: job.processes().iter().map(ProcessStatus::of).collect(),
        }
    }
}

fn cell(text: &str, width: usize) -> String {
    if text.chars().count() > width {
        let cut: String = text.chars().take(width.saturating_sub(1)).collect();
        format!(" {cut}~ ")
    } else {
        format!(" {text:<width$} ")
    }
}

fn rule(f: &mut fmt::Formatter<'_>, left: &str, middle: &str, right: &str) -> fmt::Result {
    let parts: Vec<String> = COLUMNS.iter().map(|(_, width)| "─".repeat(width + 2)).collect();
    writeln!(f, "{left}{}{right}", parts.join(middle))
}

fn row(f: &mut fmt::Formatter<'_>, cells: [&str; 6]) -> fmt::Result {
    let parts: Vec<String> = cells
        .iter()
        .zip(COLUMNS.iter())
        .map(|(text, (_, width))| cell(text, *width))
        .collect();
    writeln!(f, "│{}│", parts.join("│"))
}

fn body(f: &mut fmt::Formatter<'_>, status: &JobStatus) -> fmt::Result {
    row(f, [&status.name, status.state.as_str(), "", "", "", ""])?;
    for process in &status.processes {
        let pid = process.pid.map(|pid| pid.to_string()).unwrap_or_else(|| "-".into());
        let restarts = process.restarts.to_string();
        let started = process
            .started_at
            .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".into());
        row(f, ["", process.state.as_str(), &process.name, &pid, &restarts, &started])?;
    }
    Ok(())
}

/// Renders several jobs in one table, one block per job.
pub struct StatusTable<'a>(pub &'a [JobStatus]);

impl fmt::Display for StatusTable<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let headers = COLUMNS.map(|(title, _)| title);
        rule(f, "┌", "┬", "┐")?;
        row(f, headers)?;
        for status in self.0 {
            rule(f, "├", "┼", "┤")?;
            body(f, status)?;
        }
        rule(f, "└", "┴", "┘")
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        StatusTable(std::slice::from_ref(self)).fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> JobStatus {
        JobStatus {
            name: "web".into(),
            state: JobState::Running,
            processes: vec![
                ProcessStatus {
                    name: "web_0".into(),
                    state: ProcessState::Running,
                    pid: Some(4242),
                    restarts: 1,
                    started_at: None,
                    exit_code: None,
                },
                ProcessStatus {
                    name: "web_1".into(),
                    state: ProcessState::Backoff,
                    pid: None,
                    restarts: 3,
                    started_at: None,
                    exit_code: Some(1),
                },
            ],
        }
    }

    #[test]
    fn table_lists_the_job_then_each_process() {
        let rendered = sample().to_string();
        let lines: Vec<_> = rendered.lines().collect();
        // top rule, header, separator, job row, two process rows, bottom rule
        assert_eq!(lines.len(), 7);
        assert!(lines[1].contains("JOB") && lines[1].contains("RESTARTS"));
        assert!(lines[3].contains("web") && lines[3].contains("RUNNING"));
        assert!(lines[4].contains("web_0") && lines[4].contains("4242"));
        assert!(lines[5].contains("web_1") && lines[5].contains("BACKOFF"));

        let width = lines[0].chars().count();
        assert!(lines.iter().all(|line| line.chars().count() == width));
    }

    #[test]
    fn long_names_are_truncated() {
        let mut status = sample();
        status.name = "a-very-long-job-name-that-overflows".into();
        let rendered = status.to_string();
        assert!(rendered.contains("a-very-long-job~"));
    }

    #[test]
    fn several_jobs_share_one_table() {
        let mut other = sample();
        other.name = "db".into();
        other.processes.clear();
        let jobs = [sample(), other];
        let rendered = StatusTable(&jobs).to_string();
        assert_eq!(rendered.matches('┌').count(), 1);
        assert_eq!(rendered.matches('├').count(), 2);
        assert!(rendered.contains(" db "));
    }
}
