use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::jobs::job::Job;
use crate::jobs::state::JobState;
use crate::jobs::status::JobStatus;
use crate::parse::{self, JobConfig};
use crate::reactor::{Context, ProcessNotice};

/*
    @@@
    @JobManager;
    . Owns the live jobs and the last parsed configuration snapshot.
    . A job is stale when its name left the snapshot or its config differs from the snapshot's entry;
      stale jobs are stopped, marked on stop and swapped or dropped by update().
*/
pub struct JobManager {
    ctx: Context,
    config_path: PathBuf,
    configs: BTreeMap<String, JobConfig>,
    jobs: BTreeMap<String, Job>,
    shutting_down: bool,
}

impl JobManager {
    /// Parses `config_path` and creates (without starting) one Job per entry.
    pub fn new(ctx: &Context, config_path: impl AsRef<Path>) -> Result<Self> {
        let config_path = config_path.as_ref().to_path_buf();
        let configs = parse::parser(&config_path)?;
        let mut manager = Self {
            ctx: ctx.clone(),
            config_path,
            configs,
            jobs: BTreeMap::new(),
            shutting_down: false,
        };
        let names: Vec<String> = manager.configs.keys().cloned().collect();
        for name in names {
            manager.create_job(&name);
        }
        info!(jobs = manager.jobs.len(), path = %manager.config_path.display(), "configuration loaded");
        Ok(manager)
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn job(&self, name: &str) -> Option<&Job> {
        self.jobs.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.jobs.keys().map(String::as_str)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    pub fn has_live_processes(&self) -> bool {
        self.jobs.values().any(Job::has_live_processes)
    }

    fn create_job(&mut self, name: &str) -> bool {
        let Some(config) = self.configs.get(name) else {
            return false;
        };
        match Job::new(&self.ctx, config.clone()) {
            Ok(job) => {
                debug!(job = name, "created");
                self.jobs.insert(name.to_string(), job);
                true
            }
            Err(err) => {
                error!(job = name, error = %err, "failed to create job");
                false
            }
        }
    }

    fn is_stale(&self, name: &str) -> bool {
        match (self.jobs.get(name), self.configs.get(name)) {
            (Some(job), Some(config)) => job.config() != config,
            (Some(_), None) => true,
            _ => false,
        }
    }

    fn find(&mut self, name: &str) -> Result<&mut Job> {
        self.jobs.get_mut(name).ok_or_else(|| Error::JobNotFound(name.to_string()))
    }

    /// Starts every autostart job that is not waiting to be swapped out.
    pub fn start_all(&mut self) {
        if self.shutting_down {
            return;
        }
        let names: Vec<String> = self.jobs.keys().filter(|name| !self.is_stale(name)).cloned().collect();
        for name in names {
            let Some(job) = self.jobs.get_mut(&name) else { continue };
            if !job.config().autostart {
                continue;
            }
            if let Err(err) = job.start() {
                warn!(job = %name, error = %err, "autostart incomplete");
            }
        }
    }

    pub fn start(&mut self, name: &str) -> Result<()> {
        if self.shutting_down {
            return Err(Error::ShuttingDown);
        }
        let stale = self.is_stale(name);
        let job = self.find(name)?;
        if stale || matches!(job.state(), JobState::Replace | JobState::Remove) {
            return Err(Error::JobReloading(name.to_string()));
        }
        job.start()
    }

    pub fn stop(&mut self, name: &str) -> Result<()> {
        if self.find(name)?.stop() {
            self.on_stop(name);
        }
        Ok(())
    }

    /// Stop then start: the slots come back through the reused-slot path once they are down.
    pub fn restart(&mut self, name: &str) -> Result<()> {
        self.stop(name)?;
        self.start(name)
    }

    /// Stops every job for shutdown; no job is started or rebuilt afterwards.
    pub fn kill(&mut self) {
        self.shutting_down = true;
        let mut stopped = Vec::new();
        for (name, job) in &mut self.jobs {
            if job.stop() {
                stopped.push(name.clone());
            }
        }
        for name in stopped {
            self.on_stop(&name);
        }
    }

    /// Last resort when the loop cannot run: every job is dropped, which kills and reaps its children.
    pub fn abandon(&mut self) {
        self.shutting_down = true;
        for (name, job) in std::mem::take(&mut self.jobs) {
            if job.has_live_processes() {
                warn!(job = %name, "abandoning live processes");
            }
        }
    }

    /*
        @@@
        @reload();
        . Parses first: a broken file leaves every job untouched.
        . Stale jobs are stopped, the ones already down get their marker right away.
        . New names get a fresh Job, then update() and start_all() run.
    */
    pub fn reload(&mut self) -> Result<()> {
        if self.shutting_down {
            return Err(Error::ShuttingDown);
        }
        let fresh = parse::parser(&self.config_path)?;
        self.configs = fresh;

        let stale: Vec<String> = self.jobs.keys().filter(|name| self.is_stale(name)).cloned().collect();
        for name in &stale {
            let Some(job) = self.jobs.get_mut(name) else { continue };
            info!(job = %name, "configuration changed, stopping");
            let stopped = job.stop();
            if stopped || matches!(job.state(), JobState::Stopped | JobState::Empty) {
                self.on_stop(name);
            }
        }

        let added: Vec<String> = self
            .configs
            .keys()
            .filter(|name| !self.jobs.contains_key(*name))
            .cloned()
            .collect();
        for name in &added {
            info!(job = %name, "new job");
            self.create_job(name);
        }

        self.update();
        self.start_all();
        info!(stale = stale.len(), added = added.len(), "reload done");
        Ok(())
    }

    /// Called when a job has fully stopped: marks it if its configuration moved on.
    pub fn on_stop(&mut self, name: &str) {
        let remove = !self.configs.contains_key(name);
        let stale = self.is_stale(name);
        let Some(job) = self.jobs.get_mut(name) else { return };
        if !matches!(job.state(), JobState::Stopped | JobState::Empty) {
            return;
        }
        if remove {
            debug!(job = name, "marked for removal");
            job.remove();
        } else if stale {
            debug!(job = name, "marked for replacement");
            job.replace();
        }
    }

    /*
        @@@
        @update();
        . Runs after every event-loop cycle.
        . Drops jobs marked Remove and rebuilds jobs marked Replace from the current snapshot (autostarting them),
          but only once none of their slots holds a live child.
    */
    pub fn update(&mut self) {
        let ready: Vec<String> = self
            .jobs
            .iter()
            .filter(|(_, job)| (job.replaced() || job.removed()) && job.is_idle())
            .map(|(name, _)| name.clone())
            .collect();

        for name in ready {
            let Some(job) = self.jobs.remove(&name) else { continue };
            if job.removed() || self.shutting_down {
                info!(job = %name, "removed");
                continue;
            }
            drop(job);
            if !self.create_job(&name) {
                continue;
            }
            info!(job = %name, "replaced");
            if let Some(job) = self.jobs.get_mut(&name) {
                if job.config().autostart {
                    if let Err(err) = job.start() {
                        warn!(job = %name, error = %err, "autostart incomplete");
                    }
                }
            }
        }
    }

    /// Routes a process notice to its job; a job that just stopped goes through on_stop.
    pub fn handle(&mut self, notice: &ProcessNotice) {
        let Some(job) = self.jobs.get_mut(&*notice.job) else {
            debug!(job = %notice.job, "notice for a job that is gone");
            return;
        };
        if job.handle(notice) {
            let name = notice.job.to_string();
            self.on_stop(&name);
        }
    }

    pub fn status(&self) -> Vec<JobStatus> {
        self.jobs.values().map(Job::status).collect()
    }

    pub fn status_of(&self, name: &str) -> Result<JobStatus> {
        self.jobs
            .get(name)
            .map(Job::status)
            .ok_or_else(|| Error::JobNotFound(name.to_string()))
    }
}
