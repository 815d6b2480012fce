use std::rc::Rc;

use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::jobs::image::ExecImage;
use crate::jobs::process::{ProcessExit, ProcessHandle};
use crate::jobs::state::{JobState, ProcessState};
use crate::jobs::status::JobStatus;
use crate::parse::{JobConfig, RestartPolicy};
use crate::reactor::{Context, ProcessEvent, ProcessNotice};

/*
    @@@
    @Job;
    . One configuration entry at runtime: `numprocs` slots sharing a process group.
    . Aggregates the slots' states into a JobState and applies the restart policy on exits.
    . Methods reacting to process events return true when the Job has just reached Stopped,
      so the JobManager can decide on a pending replace/remove.
*/
pub struct Job {
    ctx: Context,
    name: Rc<str>,
    config: JobConfig,
    image: ExecImage,
    state: JobState,
    pgid: i32,
    processes: Vec<ProcessHandle>,
}

impl Job {
    pub fn new(ctx: &Context, config: JobConfig) -> Result<Self> {
        let image = ExecImage::new(&config)?;
        Ok(Self {
            ctx: ctx.clone(),
            name: Rc::from(config.name.as_str()),
            config,
            image,
            state: JobState::Empty,
            pgid: 0,
            processes: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn pgid(&self) -> i32 {
        self.pgid
    }

    pub fn processes(&self) -> &[ProcessHandle] {
        &self.processes
    }

    pub fn process(&self, slot: usize) -> Option<&ProcessHandle> {
        self.processes.get(slot)
    }

    pub fn replace(&mut self) {
        self.state = JobState::Replace;
    }

    pub fn remove(&mut self) {
        self.state = JobState::Remove;
    }

    pub fn replaced(&self) -> bool {
        self.state == JobState::Replace
    }

    pub fn removed(&self) -> bool {
        self.state == JobState::Remove
    }

    /// No slot holds a live child.
    pub fn is_idle(&self) -> bool {
        self.processes.iter().all(|p| p.state().is_terminal())
    }

    pub fn has_live_processes(&self) -> bool {
        !self.is_idle()
    }

    pub fn status(&self) -> JobStatus {
        JobStatus::of(self)
    }

    // Join the job's group while one of its members is alive, otherwise lead a new one.
    fn spawn_group(&self) -> i32 {
        if self.has_live_processes() {
            self.pgid
        } else {
            0
        }
    }

    fn spawn(&mut self, slot: usize) -> Result<()> {
        let group = self.spawn_group();
        let process = &mut self.processes[slot];
        process.set_pgid(group);
        process.start(&self.image, &self.config)?;
        if group == 0 {
            self.pgid = process.pid().unwrap_or(0);
        }
        Ok(())
    }

    fn restart_slot(&mut self, slot: usize) {
        if let Err(err) = self.spawn(slot) {
            error!(job = %self.name, slot, error = %err, "failed to start process");
        }
    }

    // Starting/Running/Stopping collapse to Stopped once no slot is alive.
    fn settle(&mut self) -> bool {
        if !self.is_idle() {
            return false;
        }
        match self.state {
            JobState::Starting | JobState::Running | JobState::Stopping => {
                info!(job = %self.name, "stopped");
                self.state = JobState::Stopped;
                true
            }
            _ => false,
        }
    }

    /*
        @@@
        @start();
        . Empty: creates the `numprocs` slots `<job>_<i>` and starts them, the first child becomes the group leader.
        . Stopped/Stopping: resets restart counters and restarts every slot that can start; slots still Stopping
          are restarted from on_stop once they are down.
        . Any other state is left untouched.
        . A slot that fails to spawn stays where it was; the last such error is returned after all slots were tried.
    */
    pub fn start(&mut self) -> Result<()> {
        let mut failure = None;
        match self.state {
            JobState::Empty => {
                self.pgid = 0;
                for slot in 0..self.config.numprocs {
                    let process = ProcessHandle::new(&self.ctx, Rc::clone(&self.name), slot, 0);
                    self.processes.push(process);
                    if let Err(err) = self.spawn(slot) {
                        error!(job = %self.name, slot, error = %err, "failed to start process");
                        failure = Some(err);
                    }
                }
            }
            JobState::Stopped | JobState::Stopping => {
                for slot in 0..self.processes.len() {
                    self.processes[slot].reset_restarts();
                    if !self.processes[slot].state().can_start() {
                        continue;
                    }
                    if let Err(err) = self.spawn(slot) {
                        error!(job = %self.name, slot, error = %err, "failed to start process");
                        failure = Some(err);
                    }
                }
            }
            other => {
                debug!(job = %self.name, state = %other, "start ignored");
                return Ok(());
            }
        }

        info!(job = %self.name, numprocs = self.config.numprocs, "starting");
        self.state = JobState::Starting;
        self.settle();
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /*
        @@@
        @stop();
        . Sends every live slot its stop signal with the configured stop time and moves to Stopping.
        . A slot whose signal cannot be delivered is killed instead.
        . Returns true when nothing was alive and the Job is already Stopped.
    */
    pub fn stop(&mut self) -> bool {
        match self.state {
            JobState::Stopped | JobState::Empty | JobState::Stopping | JobState::Replace | JobState::Remove => {
                return false
            }
            JobState::Starting | JobState::Running => {}
        }

        info!(job = %self.name, signal = %self.config.stop_signal, "stopping");
        self.state = JobState::Stopping;
        for process in &mut self.processes {
            if let Err(err) = process.stop(self.config.stop_time, self.config.stop_signal) {
                warn!(process = %process.name(), error = %err, "stop signal failed, killing");
                if let Err(err) = process.kill() {
                    error!(process = %process.name(), error = %err, "failed to kill process");
                }
            }
        }
        self.settle()
    }

    /// Routes a notice addressed to one of this Job's slots.
    pub fn handle(&mut self, notice: &ProcessNotice) -> bool {
        let slot = notice.slot;
        let Some(process) = self.processes.get_mut(slot) else {
            warn!(job = %self.name, slot, "notice for a slot that does not exist");
            return false;
        };
        if !process.accepts(notice) {
            debug!(process = %process.name(), event = ?notice.event, "stale notice ignored");
            return false;
        }

        match notice.event {
            ProcessEvent::Exited => match process.on_state_change() {
                Ok(ProcessExit::Stopped) => self.on_stop(slot),
                Ok(ProcessExit::Exited { code }) => self.on_exit(slot, code),
                Ok(ProcessExit::Unknown) => false,
                Err(err) => {
                    error!(job = %self.name, slot, error = %err, "failed to reap process");
                    false
                }
            },
            ProcessEvent::StartTimeElapsed => {
                if process.on_start_time() {
                    self.on_process_surpassed_start_time();
                }
                false
            }
            ProcessEvent::StopTimeElapsed => {
                if let Err(err) = process.on_stop_timeout() {
                    error!(job = %self.name, slot, error = %err, "failed to kill process");
                }
                false
            }
        }
    }

    /*
        @@@
        @on_exit();
        . A slot died on its own (Backoff or Exited).
        . After `startretries` restarts the slot is parked until the next explicit start.
        . Otherwise Never keeps it down, Always restarts it, OnFailure restarts unless the code is expected.
        . A restarted slot puts a Running job back into Starting.
    */
    pub fn on_exit(&mut self, slot: usize, code: i32) -> bool {
        if matches!(self.state, JobState::Starting | JobState::Running) {
            let process = &mut self.processes[slot];
            let restart = if process.restarts() >= self.config.start_retries {
                warn!(
                    process = %process.name(),
                    restarts = process.restarts(),
                    code,
                    "start retries exhausted, giving up"
                );
                false
            } else {
                match self.config.restart_policy {
                    RestartPolicy::Never => false,
                    RestartPolicy::Always => {
                        process.add_restart();
                        true
                    }
                    RestartPolicy::OnFailure => {
                        process.add_restart();
                        !self.config.exit_codes.contains(&code)
                    }
                }
            };
            if restart {
                info!(process = %self.processes[slot].name(), code, "restarting");
                self.restart_slot(slot);
                // on_process_surpassed_start_time() brings it back to Running
                if self.state == JobState::Running && self.processes[slot].state() == ProcessState::Starting {
                    self.state = JobState::Starting;
                }
            }
        }
        self.settle()
    }

    pub fn on_stop(&mut self, slot: usize) -> bool {
        match self.state {
            JobState::Starting => {
                if self.processes[slot].state().can_start() {
                    self.restart_slot(slot);
                }
                self.settle()
            }
            JobState::Stopping => {
                if self.is_idle() {
                    info!(job = %self.name, "stopped");
                    self.state = JobState::Stopped;
                    return true;
                }
                false
            }
            _ => self.settle(),
        }
    }

    pub fn on_process_surpassed_start_time(&mut self) {
        if self.state == JobState::Starting && self.processes.iter().all(|p| p.state() == ProcessState::Running) {
            info!(job = %self.name, "running");
            self.state = JobState::Running;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::Notice;
    use std::time::{Duration, Instant};

    fn pump(ctx: &Context, job: &mut Job, limit: Duration, done: impl Fn(&Job) -> bool) -> usize {
        let deadline = Instant::now() + limit;
        let mut stopped = 0;
        while !done(job) && Instant::now() < deadline {
            ctx.event_loop().run_once(Some(Duration::from_millis(20))).unwrap();
            for notice in ctx.mailbox().drain() {
                if let Notice::Process(notice) = notice {
                    if job.handle(&notice) {
                        stopped += 1;
                    }
                }
            }
        }
        for process in job.processes() {
            assert_ne!(process.state(), ProcessState::Unknown);
        }
        stopped
    }

    fn config(name: &str, cmd: &str) -> JobConfig {
        let mut config = JobConfig::new(name, cmd);
        config.start_time = Duration::from_millis(200);
        config.stop_time = Duration::from_secs(2);
        config
    }

    #[test]
    fn pool_runs_in_one_group_then_stops() {
        let ctx = Context::new().unwrap();
        let mut config = config("pool", "/bin/sleep 30");
        config.numprocs = 3;
        let mut job = Job::new(&ctx, config).unwrap();
        assert_eq!(job.state(), JobState::Empty);

        job.start().unwrap();
        assert_eq!(job.state(), JobState::Starting);
        assert_eq!(job.processes().len(), 3);
        let names: Vec<_> = job.processes().iter().map(|p| p.name().to_string()).collect();
        assert_eq!(names, vec!["pool_0", "pool_1", "pool_2"]);
        assert_eq!(job.pgid(), job.processes()[0].pid().unwrap());

        pump(&ctx, &mut job, Duration::from_secs(3), |j| j.state() == JobState::Running);
        assert_eq!(job.state(), JobState::Running);
        for process in job.processes() {
            let pid = nix::unistd::Pid::from_raw(process.pid().unwrap());
            assert_eq!(nix::unistd::getpgid(Some(pid)).unwrap().as_raw(), job.pgid());
        }

        // idempotent
        job.start().unwrap();
        assert_eq!(job.processes().len(), 3);

        assert!(!job.stop());
        assert_eq!(job.state(), JobState::Stopping);
        assert!(!job.stop());
        let stopped = pump(&ctx, &mut job, Duration::from_secs(3), |j| j.state() == JobState::Stopped);
        assert_eq!(stopped, 1);
        assert!(job.processes().iter().all(|p| p.state() == ProcessState::Stopped));
    }

    #[test]
    fn always_policy_gives_up_after_start_retries() {
        let ctx = Context::new().unwrap();
        let mut config = config("flaky", "/bin/sh -c 'exit 1'");
        config.restart_policy = RestartPolicy::Always;
        config.start_retries = 2;
        config.start_time = Duration::from_secs(5);
        let mut job = Job::new(&ctx, config).unwrap();

        job.start().unwrap();
        pump(&ctx, &mut job, Duration::from_secs(5), |j| j.state() == JobState::Stopped);

        let process = job.process(0).unwrap();
        assert_eq!(process.state(), ProcessState::Backoff);
        assert_eq!(process.restarts(), 2);
        assert_eq!(job.state(), JobState::Stopped);
    }

    #[test]
    fn on_failure_keeps_expected_exits_down() {
        let ctx = Context::new().unwrap();
        let mut config = config("expected", "/bin/sh -c 'sleep 0.3; exit 2'");
        config.exit_codes = [0, 2].into_iter().collect();
        config.start_time = Duration::from_millis(100);
        let mut job = Job::new(&ctx, config).unwrap();

        job.start().unwrap();
        pump(&ctx, &mut job, Duration::from_secs(3), |j| j.state() == JobState::Stopped);
        let process = job.process(0).unwrap();
        assert_eq!(process.state(), ProcessState::Exited);
        assert_eq!(process.exit_code(), Some(2));
        assert_eq!(process.restarts(), 1);
    }

    #[test]
    fn on_failure_restarts_unexpected_exits() {
        let ctx = Context::new().unwrap();
        let mut config = config("unexpected", "/bin/sh -c 'exit 5'");
        config.start_retries = 1;
        config.start_time = Duration::from_secs(5);
        let mut job = Job::new(&ctx, config).unwrap();

        job.start().unwrap();
        pump(&ctx, &mut job, Duration::from_secs(3), |j| j.state() == JobState::Stopped);
        let process = job.process(0).unwrap();
        assert_eq!(process.restarts(), 1);
        assert_eq!(process.state(), ProcessState::Backoff);
    }

    #[test]
    fn manual_start_revives_parked_slots() {
        let ctx = Context::new().unwrap();
        let mut config = config("parked", "/bin/sh -c 'exit 1'");
        config.restart_policy = RestartPolicy::Never;
        config.start_time = Duration::from_secs(5);
        let mut job = Job::new(&ctx, config).unwrap();

        job.start().unwrap();
        pump(&ctx, &mut job, Duration::from_secs(3), |j| j.state() == JobState::Stopped);
        assert_eq!(job.process(0).unwrap().restarts(), 0);

        job.start().unwrap();
        assert_eq!(job.state(), JobState::Starting);
        assert_eq!(job.process(0).unwrap().state(), ProcessState::Starting);
        assert_eq!(job.processes().len(), 1);
        pump(&ctx, &mut job, Duration::from_secs(3), |j| j.state() == JobState::Stopped);
    }

    #[test]
    fn restart_reuses_slots_once_they_are_down() {
        let ctx = Context::new().unwrap();
        let mut config = config("cycle", "/bin/sleep 30");
        config.numprocs = 2;
        let mut job = Job::new(&ctx, config).unwrap();
        job.start().unwrap();
        pump(&ctx, &mut job, Duration::from_secs(3), |j| j.state() == JobState::Running);
        let before: Vec<_> = job.processes().iter().map(|p| p.pid().unwrap()).collect();

        job.stop();
        job.start().unwrap();
        assert_eq!(job.state(), JobState::Starting);
        pump(&ctx, &mut job, Duration::from_secs(5), |j| j.state() == JobState::Running);

        assert_eq!(job.processes().len(), 2);
        for (process, old) in job.processes().iter().zip(before) {
            assert_eq!(process.state(), ProcessState::Running);
            assert_ne!(process.pid().unwrap(), old);
        }

        job.stop();
        pump(&ctx, &mut job, Duration::from_secs(3), |j| j.state() == JobState::Stopped);
    }

    #[test]
    fn markers_are_advisory() {
        let ctx = Context::new().unwrap();
        let mut job = Job::new(&ctx, config("marked", "/bin/sleep 30")).unwrap();
        job.replace();
        assert!(job.replaced());
        assert!(!job.removed());
        job.start().unwrap();
        assert!(job.processes().is_empty());
        job.remove();
        assert!(job.removed());
        assert!(!job.stop());
    }
}
