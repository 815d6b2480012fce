use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::rc::Rc;
use std::time::Duration;

use chrono::{DateTime, Local};
use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, setpgid, ForkResult, Pid};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::jobs::image::ExecImage;
use crate::jobs::state::ProcessState;
use crate::parse::JobConfig;
use crate::reactor::{Context, Notice, ProcessEvent, ProcessNotice, Timer};

/// What the owning Job has to react to after an exit notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    /// Reached Stopped through the graceful or the forced path.
    Stopped,
    /// Died on its own while Starting (now Backoff) or Running (now Exited).
    Exited { code: i32 },
    Unknown,
}

fn pidfd_open(pid: Pid) -> io::Result<OwnedFd> {
    let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid.as_raw(), 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd as RawFd) })
}

fn pidfd_send_signal(pidfd: &OwnedFd, sig: Signal) -> io::Result<()> {
    let rc = unsafe {
        libc::syscall(
            libc::SYS_pidfd_send_signal,
            pidfd.as_raw_fd(),
            sig as libc::c_int,
            ptr::null::<libc::siginfo_t>(),
            0,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/*
    @@@
    @ProcessHandle;
    . One slot of a Job: a single OS child, its lifecycle state, its pidfd registration and its active timer.
    . Event-loop callbacks never touch the handle directly: they post a ProcessNotice {job, slot, ticket}
      and the Job routes it back here. A notice whose ticket is no longer current is ignored.
*/
pub struct ProcessHandle {
    ctx: Context,
    job: Rc<str>,
    slot: usize,
    name: String,
    pid: Option<Pid>,
    pgid: i32,
    state: ProcessState,
    restarts: u32,
    pidfd: Option<OwnedFd>,
    timer: Option<Timer>,
    spawn_ticket: u64,
    timer_ticket: u64,
    started_at: Option<DateTime<Local>>,
    exit_code: Option<i32>,
}

impl ProcessHandle {
    pub fn new(ctx: &Context, job: Rc<str>, slot: usize, pgid: i32) -> Self {
        Self {
            ctx: ctx.clone(),
            name: format!("{job}_{slot}"),
            job,
            slot,
            pid: None,
            pgid,
            state: ProcessState::Stopped,
            restarts: 0,
            pidfd: None,
            timer: None,
            spawn_ticket: 0,
            timer_ticket: 0,
            started_at: None,
            exit_code: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn pid(&self) -> Option<i32> {
        self.pid.map(Pid::as_raw)
    }

    pub fn pgid(&self) -> i32 {
        self.pgid
    }

    /// 0 means "lead a new group".
    pub fn set_pgid(&mut self, pgid: i32) {
        self.pgid = pgid;
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    pub fn add_restart(&mut self) {
        self.restarts += 1;
    }

    pub fn reset_restarts(&mut self) {
        self.restarts = 0;
    }

    pub fn started_at(&self) -> Option<DateTime<Local>> {
        self.started_at
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn has_timer(&self) -> bool {
        self.timer.as_ref().is_some_and(Timer::is_armed)
    }

    pub fn accepts(&self, notice: &ProcessNotice) -> bool {
        match notice.event {
            ProcessEvent::Exited => self.pid.is_some() && notice.ticket == self.spawn_ticket,
            ProcessEvent::StartTimeElapsed | ProcessEvent::StopTimeElapsed => notice.ticket == self.timer_ticket,
        }
    }

    fn notice(&self, ticket: u64, event: ProcessEvent) -> ProcessNotice {
        ProcessNotice {
            job: Rc::clone(&self.job),
            slot: self.slot,
            ticket,
            event,
        }
    }

    fn make_timer(&self, duration: Duration, event: ProcessEvent) -> Result<(Timer, u64)> {
        let ticket = self.ctx.next_ticket();
        let notice = self.notice(ticket, event);
        let mailbox = self.ctx.mailbox().clone();
        let timer = Timer::new(self.ctx.event_loop(), duration, move || {
            mailbox.post(Notice::Process(notice.clone()));
            Ok(())
        })?;
        Ok((timer, ticket))
    }

    // A child that could not be wired up is killed and reaped on the spot.
    fn abandon(&self, child: Pid) {
        let _ = signal::kill(child, Signal::SIGKILL);
        let _ = waitpid(child, None);
    }

    /*
        @@@
        @start();
        . Legal from Stopped, Backoff and Exited.
        . Forks; the child joins the process group and execs (see ExecImage::exec_child), it never returns here.
        . The parent opens a pidfd for the child and registers it with the EventLoop.
        . Then the start timer is armed and the slot moves to Starting.
        . On failure the slot keeps its previous (terminal) state and no child is left behind.
    */
    pub fn start(&mut self, image: &ExecImage, config: &JobConfig) -> Result<()> {
        if !self.state.can_start() {
            return Err(Error::InvalidTransition {
                name: self.name.clone(),
                operation: "start",
                state: self.state,
            });
        }

        let (mut timer, timer_ticket) = self.make_timer(config.start_time, ProcessEvent::StartTimeElapsed)?;

        let child = match unsafe { fork() } {
            Ok(ForkResult::Child) => image.exec_child(self.pgid),
            Ok(ForkResult::Parent { child }) => child,
            Err(source) => {
                return Err(Error::Fork {
                    name: self.name.clone(),
                    source,
                })
            }
        };

        // mirrors the child's own setpgid so the group exists whichever side runs first
        let group = if self.pgid == 0 { child } else { Pid::from_raw(self.pgid) };
        let _ = setpgid(child, group);

        let pidfd = match pidfd_open(child) {
            Ok(fd) => fd,
            Err(source) => {
                self.abandon(child);
                return Err(Error::PidfdOpen {
                    name: self.name.clone(),
                    source,
                });
            }
        };

        let spawn_ticket = self.ctx.next_ticket();
        let exited = self.notice(spawn_ticket, ProcessEvent::Exited);
        let mailbox = self.ctx.mailbox().clone();
        let registered = self.ctx.event_loop().register(
            pidfd.as_raw_fd(),
            Some(Box::new(move || {
                mailbox.post(Notice::Process(exited.clone()));
                Ok(())
            })),
            None,
        );
        if let Err(err) = registered {
            self.abandon(child);
            return Err(err);
        }

        if let Err(err) = timer.start() {
            let _ = self.ctx.event_loop().unregister(pidfd.as_raw_fd());
            self.abandon(child);
            return Err(err);
        }

        self.pid = Some(child);
        self.pidfd = Some(pidfd);
        self.timer = Some(timer);
        self.spawn_ticket = spawn_ticket;
        self.timer_ticket = timer_ticket;
        self.state = ProcessState::Starting;
        self.started_at = Some(Local::now());
        self.exit_code = None;

        info!(process = %self.name, pid = child.as_raw(), pgid = group.as_raw(), "spawned");
        Ok(())
    }

    fn send(&self, sig: Signal) -> Result<()> {
        let Some(pidfd) = &self.pidfd else {
            return Err(Error::InvalidTransition {
                name: self.name.clone(),
                operation: "signal",
                state: self.state,
            });
        };
        match pidfd_send_signal(pidfd, sig) {
            Ok(()) => {
                debug!(process = %self.name, signal = %sig, "sent signal");
                Ok(())
            }
            // already exited, its notification is on the way
            Err(err) if err.raw_os_error() == Some(libc::ESRCH) => {
                debug!(process = %self.name, signal = %sig, "process already gone");
                Ok(())
            }
            Err(source) => Err(Error::Signal {
                name: self.name.clone(),
                signal: sig.to_string(),
                source,
            }),
        }
    }

    /*
        @@@
        @stop();
        . Backoff/Exited resolve to Stopped at once; Stopped, Stopping and the other idle states are left alone.
        . Starting/Running get `sig`, move to Stopping and arm a stop timer that escalates to kill() after `timeout`.
    */
    pub fn stop(&mut self, timeout: Duration, sig: Signal) -> Result<()> {
        match self.state {
            ProcessState::Backoff | ProcessState::Exited => {
                self.state = ProcessState::Stopped;
                return Ok(());
            }
            ProcessState::Starting | ProcessState::Running => {}
            _ => return Ok(()),
        }

        self.send(sig)?;
        self.state = ProcessState::Stopping;

        let (mut timer, ticket) = self.make_timer(timeout, ProcessEvent::StopTimeElapsed)?;
        timer.start()?;
        // replacing the start timer cancels it
        self.timer = Some(timer);
        self.timer_ticket = ticket;
        Ok(())
    }

    pub fn kill(&mut self) -> Result<()> {
        if !self.state.is_alive() {
            return Ok(());
        }
        self.send(Signal::SIGKILL)?;
        self.state = ProcessState::Stopping;
        Ok(())
    }

    pub fn on_stop_timeout(&mut self) -> Result<()> {
        if self.state != ProcessState::Stopping {
            return Ok(());
        }
        warn!(process = %self.name, "did not stop in time, sending SIGKILL");
        self.kill()
    }

    /// Health probe: survived `starttime`. Returns true when the process just became Running.
    pub fn on_start_time(&mut self) -> bool {
        if self.state != ProcessState::Starting {
            return false;
        }
        self.timer = None;
        self.state = ProcessState::Running;
        info!(process = %self.name, "surpassed start time, running");
        true
    }

    fn release(&mut self) {
        if let Some(pidfd) = self.pidfd.take() {
            if let Err(err) = self.ctx.event_loop().unregister(pidfd.as_raw_fd()) {
                warn!(process = %self.name, error = %err, "failed to unregister pidfd");
            }
        }
        self.pid = None;
        self.spawn_ticket = 0;
    }

    /*
        @@@
        @on_state_change();
        . Called once the pidfd reported the exit: reaps the child, cancels the timer, unregisters the pidfd.
        . Dispatches on the state the process was in: Stopping -> Stopped, Starting -> Backoff, Running -> Exited.
        . Death by signal while Stopping counts as a forced stop; otherwise it is an exit with code 128 + signal.
    */
    pub fn on_state_change(&mut self) -> Result<ProcessExit> {
        let Some(pid) = self.pid else {
            return Err(Error::InvalidTransition {
                name: self.name.clone(),
                operation: "reap",
                state: self.state,
            });
        };

        let status = waitpid(pid, None);
        self.timer = None;
        self.release();

        let status = match status {
            Ok(status) => status,
            Err(errno) => {
                self.state = ProcessState::Unknown;
                return Err(Error::Io(io::Error::from(errno)));
            }
        };

        let previous = self.state;
        Ok(match status {
            WaitStatus::Exited(_, code) => self.on_exit(previous, code),
            WaitStatus::Signaled(_, sig, _) if previous == ProcessState::Stopping => {
                debug!(process = %self.name, signal = %sig, "terminated by signal");
                self.exit_code = Some(128 + sig as i32);
                self.state = ProcessState::Stopped;
                ProcessExit::Stopped
            }
            WaitStatus::Signaled(_, sig, _) => {
                warn!(process = %self.name, signal = %sig, "killed by signal");
                self.on_exit(previous, 128 + sig as i32)
            }
            other => {
                error!(process = %self.name, status = ?other, "unexpected wait status");
                self.state = ProcessState::Unknown;
                ProcessExit::Unknown
            }
        })
    }

    fn on_exit(&mut self, previous: ProcessState, code: i32) -> ProcessExit {
        self.exit_code = Some(code);
        match previous {
            ProcessState::Stopping => {
                debug!(process = %self.name, code, "stopped");
                self.state = ProcessState::Stopped;
                ProcessExit::Stopped
            }
            ProcessState::Starting => {
                warn!(process = %self.name, code, "exited before reaching its start time");
                self.state = ProcessState::Backoff;
                ProcessExit::Exited { code }
            }
            ProcessState::Running => {
                info!(process = %self.name, code, "exited");
                self.state = ProcessState::Exited;
                ProcessExit::Exited { code }
            }
            other => {
                error!(process = %self.name, state = %other, code, "exit observed in an impossible state");
                self.state = ProcessState::Unknown;
                ProcessExit::Unknown
            }
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if let Some(pid) = self.pid {
            warn!(process = %self.name, pid = pid.as_raw(), "dropping a live process, killing it");
            self.abandon(pid);
        }
        self.release();
    }
}
