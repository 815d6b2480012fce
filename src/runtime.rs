use std::io::{self, Read};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::SigId;
use tracing::{debug, error, info, warn};

use crate::control::{dispatch, Flow};
use crate::error::Result;
use crate::ipc::ControlServer;
use crate::jobs::JobManager;
use crate::reactor::{Context, Notice, ServerEvent};

const SHUTDOWN_POLL: Duration = Duration::from_millis(100);
const SHUTDOWN_FLUSH: Duration = Duration::from_secs(2);

/// Where the daemon finds its configuration and exposes its control socket.
#[derive(Debug, Clone)]
pub struct Options {
    pub config: PathBuf,
    pub socket: PathBuf,
}

/// Routes every process notice in the mailbox to the manager and hands back the others.
pub fn route(ctx: &Context, manager: &mut JobManager) -> Vec<Notice> {
    let mut rest = Vec::new();
    loop {
        let notices = ctx.mailbox().drain();
        if notices.is_empty() {
            return rest;
        }
        for notice in notices {
            match notice {
                Notice::Process(notice) => manager.handle(&notice),
                other => rest.push(other),
            }
        }
    }
}

/*
    @@@
    @tick();
    . One "wait -> dispatch -> update" cycle: waits at most `timeout` for readiness, lets the callbacks post
      their notices, applies the process notices to the manager and runs the reconciliation pass.
    . Notices that are not about processes (control, signals) are returned to the caller.
*/
pub fn tick(ctx: &Context, manager: &mut JobManager, timeout: Option<Duration>) -> Result<Vec<Notice>> {
    ctx.event_loop().run_once(timeout)?;
    let rest = route(ctx, manager);
    manager.update();
    Ok(rest)
}

struct SignalPipe {
    signal: i32,
    read: UnixStream,
    id: SigId,
}

/// signal-hook self-pipes registered with the EventLoop; each delivery posts Notice::Signal.
pub struct SignalPipes {
    ctx: Context,
    pipes: Vec<SignalPipe>,
}

impl SignalPipes {
    pub fn install(ctx: &Context, signals: &[i32]) -> Result<Self> {
        let mut installed = Self {
            ctx: ctx.clone(),
            pipes: Vec::new(),
        };
        for &signal in signals {
            let (read, write) = UnixStream::pair()?;
            read.set_nonblocking(true)?;
            write.set_nonblocking(true)?;
            let id = signal_hook::low_level::pipe::register(signal, write)?;

            let mut drain = read.try_clone()?;
            let mailbox = ctx.mailbox().clone();
            let registered = ctx.event_loop().register(
                read.as_raw_fd(),
                Some(Box::new(move || {
                    let mut buf = [0u8; 64];
                    let mut delivered = false;
                    loop {
                        match drain.read(&mut buf) {
                            Ok(0) => break,
                            Ok(_) => delivered = true,
                            Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                            Err(err) => return Err(err.into()),
                        }
                    }
                    if delivered {
                        mailbox.post(Notice::Signal(signal));
                    }
                    Ok(())
                })),
                None,
            );
            if let Err(err) = registered {
                signal_hook::low_level::unregister(id);
                return Err(err);
            }
            installed.pipes.push(SignalPipe { signal, read, id });
        }
        Ok(installed)
    }
}

impl Drop for SignalPipes {
    fn drop(&mut self) {
        for pipe in &self.pipes {
            signal_hook::low_level::unregister(pipe.id);
            if let Err(err) = self.ctx.event_loop().unregister(pipe.read.as_raw_fd()) {
                warn!(signal = pipe.signal, error = %err, "failed to unregister signal pipe");
            }
        }
    }
}

/*
    @@@
    @Daemon;
    . The JobManager plus its outer surfaces (control socket, signal pipes) driven by one EventLoop.
    . run() autostarts, cycles until a Terminate command or SIGTERM/SIGINT, then drains: every job is stopped
      and the loop keeps turning until no child is left alive.
*/
pub struct Daemon {
    ctx: Context,
    manager: JobManager,
    server: Option<ControlServer>,
    signals: Option<SignalPipes>,
    terminating: bool,
}

impl Daemon {
    pub fn new(ctx: &Context, manager: JobManager) -> Self {
        Self {
            ctx: ctx.clone(),
            manager,
            server: None,
            signals: None,
            terminating: false,
        }
    }

    pub fn with_server(mut self, server: ControlServer) -> Self {
        self.server = Some(server);
        self
    }

    pub fn with_signals(mut self, signals: SignalPipes) -> Self {
        self.signals = Some(signals);
        self
    }

    pub fn manager(&self) -> &JobManager {
        &self.manager
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating
    }

    pub fn cycle(&mut self, timeout: Option<Duration>) -> Result<()> {
        let mut pending = tick(&self.ctx, &mut self.manager, timeout)?;
        while !pending.is_empty() {
            for notice in pending {
                self.on_notice(notice);
            }
            pending = route(&self.ctx, &mut self.manager);
            self.manager.update();
        }
        Ok(())
    }

    fn on_notice(&mut self, notice: Notice) {
        match notice {
            Notice::Process(notice) => self.manager.handle(&notice),
            Notice::Server(event) => {
                let Some(server) = self.server.as_mut() else { return };
                match event {
                    ServerEvent::Accept => server.accept(),
                    ServerEvent::Ready(client) => server.service(client),
                }
            }
            Notice::Control { client, command } => {
                let (response, flow) = dispatch(&mut self.manager, &command);
                if let Some(server) = self.server.as_mut() {
                    server.respond(client, &response);
                }
                if flow == Flow::Terminate {
                    info!("terminate requested");
                    self.terminating = true;
                }
            }
            Notice::Signal(SIGHUP) => {
                info!("SIGHUP received, reloading configuration");
                if let Err(err) = self.manager.reload() {
                    error!(error = %err, "reload failed, keeping the current jobs");
                }
            }
            Notice::Signal(signal) => {
                info!(signal, "shutdown signal received");
                self.terminating = true;
            }
        }
    }

    /// The drain runs even when the loop failed, so children are never left behind.
    pub fn run(&mut self) -> Result<()> {
        self.manager.start_all();
        let mut failure = None;
        while !self.terminating {
            if let Err(err) = self.cycle(None) {
                error!(error = %err, "event loop failed, shutting down");
                self.terminating = true;
                failure = Some(err);
            }
        }
        self.shutdown()?;
        failure.map_or(Ok(()), Err)
    }

    /*
        @@@
        @shutdown();
        . kill() every job and cycle until no child is alive; if the loop itself fails the rest is SIGKILLed and reaped.
        . Pending responses get SHUTDOWN_FLUSH once the children are gone, then the clients are dropped.
    */
    pub fn shutdown(&mut self) -> Result<()> {
        info!("stopping every job");
        self.manager.kill();
        while self.manager.has_live_processes() {
            if let Err(err) = self.cycle(Some(SHUTDOWN_POLL)) {
                error!(error = %err, "event loop failed while draining, killing what is left");
                self.manager.abandon();
                return Err(err);
            }
        }
        debug!("no process left");

        let deadline = Instant::now() + SHUTDOWN_FLUSH;
        while self.server.as_ref().is_some_and(ControlServer::has_pending_output) {
            if Instant::now() >= deadline {
                warn!("clients stopped reading, dropping unsent responses");
                break;
            }
            self.cycle(Some(SHUTDOWN_POLL))?;
        }
        if let Some(server) = self.server.as_mut() {
            server.close_all();
        }
        Ok(())
    }
}

/*
    @@@
    @run();
    . Builds the EventLoop context, loads the configuration, binds the control socket and installs the signal pipes.
    . Any failure here is fatal to startup; afterwards the daemon only stops on request.
*/
pub fn run(opts: &Options) -> anyhow::Result<()> {
    let ctx = Context::new().context("failed to create the event loop")?;
    let manager = JobManager::new(&ctx, &opts.config)
        .with_context(|| format!("failed to load {}", opts.config.display()))?;
    let server = ControlServer::bind(&ctx, &opts.socket)
        .with_context(|| format!("failed to bind control socket {}", opts.socket.display()))?;
    let signals = SignalPipes::install(&ctx, &[SIGTERM, SIGINT, SIGHUP]).context("failed to install signal handlers")?;

    info!(pid = std::process::id(), config = %opts.config.display(), "taskmasterd started");
    let mut daemon = Daemon::new(&ctx, manager).with_server(server).with_signals(signals);
    daemon.run()?;
    info!("taskmasterd stopped");
    Ok(())
}
