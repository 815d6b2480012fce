use std::cell::Cell;
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};
use tracing::{trace, warn};

use crate::error::{Error, Result};
use crate::reactor::event_loop::{Callback, EventLoop};

// a zero it_value would disarm the timerfd instead of firing right away
const MIN_DELAY: Duration = Duration::from_nanos(1);

/*
    @@@
    @Timer;
    . One-shot countdown on a CLOCK_MONOTONIC timerfd registered with the EventLoop.
    . start() arms it once; expiry drains the counter and runs the stored callback exactly once.
    . Callers replace the Timer instead of re-arming it; dropping it unregisters the fd.
*/
pub struct Timer {
    event_loop: EventLoop,
    fd: Rc<TimerFd>,
    duration: Duration,
    on_expire: Option<Callback>,
    armed: Rc<Cell<bool>>,
    registered: bool,
}

impl Timer {
    pub fn new(
        event_loop: &EventLoop,
        duration: Duration,
        on_expire: impl FnMut() -> anyhow::Result<()> + 'static,
    ) -> Result<Self> {
        let fd = TimerFd::new(ClockId::CLOCK_MONOTONIC, TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC)
            .map_err(Error::Timer)?;
        Ok(Self {
            event_loop: event_loop.clone(),
            fd: Rc::new(fd),
            duration,
            on_expire: Some(Box::new(on_expire)),
            armed: Rc::new(Cell::new(false)),
            registered: false,
        })
    }

    fn raw_fd(&self) -> RawFd {
        self.fd.as_fd().as_raw_fd()
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn is_armed(&self) -> bool {
        self.armed.get()
    }

    pub fn start(&mut self) -> Result<()> {
        let Some(mut callback) = self.on_expire.take() else {
            return Err(Error::Timer(Errno::EALREADY));
        };

        self.fd
            .set(
                Expiration::OneShot(TimeSpec::from_duration(self.duration.max(MIN_DELAY))),
                TimerSetTimeFlags::empty(),
            )
            .map_err(Error::Timer)?;

        let fd = Rc::clone(&self.fd);
        let armed = Rc::clone(&self.armed);
        armed.set(true);

        let registered = self.event_loop.register(
            self.raw_fd(),
            Some(Box::new(move || {
                if !armed.replace(false) {
                    return Ok(());
                }
                fd.wait()?;
                trace!("timer expired");
                callback()
            })),
            None,
        );
        if let Err(err) = registered {
            self.armed.set(false);
            let _ = self.fd.unset();
            return Err(err);
        }
        self.registered = true;
        Ok(())
    }

    pub fn cancel(&mut self) {
        self.armed.set(false);
        if !self.registered {
            return;
        }
        self.registered = false;
        let _ = self.fd.unset();
        if let Err(err) = self.event_loop.unregister(self.raw_fd()) {
            warn!(error = %err, "failed to unregister timer");
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}
