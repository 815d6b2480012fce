#![allow(dead_code)]

use std::fs;
use std::time::{Duration, Instant};

use tempfile::NamedTempFile;

use taskmaster::jobs::{JobManager, JobState, ProcessState};
use taskmaster::reactor::Context;
use taskmaster::runtime;

pub const TICK: Duration = Duration::from_millis(20);

/// A JobManager over a temporary YAML file, pumped through `runtime::tick`.
pub struct Harness {
    pub ctx: Context,
    pub manager: JobManager,
    pub file: NamedTempFile,
}

impl Harness {
    pub fn new(yaml: &str) -> Self {
        let file = NamedTempFile::new().unwrap();
        fs::write(file.path(), yaml).unwrap();
        let ctx = Context::new().unwrap();
        let manager = JobManager::new(&ctx, file.path()).unwrap();
        Self { ctx, manager, file }
    }

    pub fn rewrite(&self, yaml: &str) {
        fs::write(self.file.path(), yaml).unwrap();
    }

    /// One cycle, then the invariants every test relies on.
    pub fn tick(&mut self) {
        let rest = runtime::tick(&self.ctx, &mut self.manager, Some(TICK)).unwrap();
        assert!(rest.is_empty(), "unexpected notices: {rest:?}");
        for name in self.manager.names() {
            let job = self.manager.job(name).unwrap();
            assert!(job.processes().len() <= job.config().numprocs, "{name} has too many slots");
            for process in job.processes() {
                assert_ne!(process.state(), ProcessState::Unknown, "{} reached UNKNOWN", process.name());
            }
        }
    }

    /// Ticks until `done` holds; false when `limit` ran out first.
    pub fn pump_until(&mut self, limit: Duration, done: impl Fn(&JobManager) -> bool) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            if done(&self.manager) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            self.tick();
        }
    }

    pub fn pump_for(&mut self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            self.tick();
        }
    }

    pub fn job_state(&self, name: &str) -> Option<JobState> {
        self.manager.job(name).map(|job| job.state())
    }

    pub fn states(&self, name: &str) -> Vec<ProcessState> {
        self.manager
            .job(name)
            .map(|job| job.processes().iter().map(|p| p.state()).collect())
            .unwrap_or_default()
    }

    pub fn pids(&self, name: &str) -> Vec<i32> {
        self.manager
            .job(name)
            .map(|job| job.processes().iter().filter_map(|p| p.pid()).collect())
            .unwrap_or_default()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.manager.kill();
        let deadline = Instant::now() + Duration::from_secs(15);
        while self.manager.has_live_processes() && Instant::now() < deadline {
            if runtime::tick(&self.ctx, &mut self.manager, Some(TICK)).is_err() {
                break;
            }
        }
    }
}

pub fn job_is(name: &'static str, state: JobState) -> impl Fn(&JobManager) -> bool {
    move |manager| manager.job(name).is_some_and(|job| job.state() == state)
}

pub fn all_processes(name: &'static str, state: ProcessState) -> impl Fn(&JobManager) -> bool {
    move |manager| {
        manager
            .job(name)
            .is_some_and(|job| !job.processes().is_empty() && job.processes().iter().all(|p| p.state() == state))
    }
}
