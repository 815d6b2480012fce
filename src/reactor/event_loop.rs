use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, error};

use crate::error::{Error, Result};

const MAX_EVENTS: usize = 128;

/// Readiness callback. An `Err` is logged by the loop and never aborts it.
pub type Callback = Box<dyn FnMut() -> anyhow::Result<()>>;

#[derive(Clone, Copy)]
enum Direction {
    Readable,
    Writable,
}

struct Handlers {
    on_readable: Option<Callback>,
    on_writable: Option<Callback>,
    // bumped by update() so a callback replaced from inside itself is not restored
    version: u64,
}

impl Handlers {
    fn slot(&mut self, direction: Direction) -> &mut Option<Callback> {
        match direction {
            Direction::Readable => &mut self.on_readable,
            Direction::Writable => &mut self.on_writable,
        }
    }
}

struct Inner {
    poll: RefCell<Poll>,
    events: RefCell<Events>,
    tokens: RefCell<HashMap<RawFd, Token>>,
    handlers: RefCell<HashMap<Token, Handlers>>,
    next_token: Cell<usize>,
}

/*
    @@@
    @EventLoop;
    . Single-threaded readiness multiplexer (edge-triggered epoll through mio).
    . Maps every registered fd to a fresh token and a pair of optional callbacks {on_readable, on_writable}.
    . Cloning yields another handle on the same loop.
    . Callbacks may register, update or unregister any fd, themselves included.
*/
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<Inner>,
}

impl AsRawFd for EventLoop {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.poll.borrow().as_raw_fd()
    }
}

fn interest_of(on_readable: &Option<Callback>, on_writable: &Option<Callback>) -> Option<Interest> {
    match (on_readable.is_some(), on_writable.is_some()) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

fn no_interest(fd: RawFd) -> Error {
    Error::PollRegistration {
        fd,
        source: io::Error::new(io::ErrorKind::InvalidInput, "neither a read nor a write callback was given"),
    }
}

impl EventLoop {
    pub fn new() -> Result<Self> {
        let poll = Poll::new()?;
        Ok(Self {
            inner: Rc::new(Inner {
                poll: RefCell::new(poll),
                events: RefCell::new(Events::with_capacity(MAX_EVENTS)),
                tokens: RefCell::new(HashMap::new()),
                handlers: RefCell::new(HashMap::new()),
                next_token: Cell::new(0),
            }),
        })
    }

    pub fn register(&self, fd: RawFd, on_readable: Option<Callback>, on_writable: Option<Callback>) -> Result<()> {
        let interest = interest_of(&on_readable, &on_writable).ok_or_else(|| no_interest(fd))?;
        if self.inner.tokens.borrow().contains_key(&fd) {
            return Err(Error::PollRegistration {
                fd,
                source: io::Error::new(io::ErrorKind::AlreadyExists, "fd is already registered"),
            });
        }

        let token = Token(self.inner.next_token.get());
        self.inner.next_token.set(token.0.wrapping_add(1));

        self.inner
            .poll
            .borrow()
            .registry()
            .register(&mut SourceFd(&fd), token, interest)
            .map_err(|source| Error::PollRegistration { fd, source })?;

        self.inner.tokens.borrow_mut().insert(fd, token);
        self.inner.handlers.borrow_mut().insert(
            token,
            Handlers {
                on_readable,
                on_writable,
                version: 0,
            },
        );
        debug!(fd, token = token.0, "registered fd");
        Ok(())
    }

    pub fn update(&self, fd: RawFd, on_readable: Option<Callback>, on_writable: Option<Callback>) -> Result<()> {
        let interest = interest_of(&on_readable, &on_writable).ok_or_else(|| no_interest(fd))?;
        let token = *self.inner.tokens.borrow().get(&fd).ok_or(Error::NotRegistered(fd))?;

        self.inner
            .poll
            .borrow()
            .registry()
            .reregister(&mut SourceFd(&fd), token, interest)
            .map_err(|source| Error::PollRegistration { fd, source })?;

        let mut handlers = self.inner.handlers.borrow_mut();
        let version = handlers.get(&token).map_or(0, |h| h.version + 1);
        handlers.insert(
            token,
            Handlers {
                on_readable,
                on_writable,
                version,
            },
        );
        Ok(())
    }

    pub fn unregister(&self, fd: RawFd) -> Result<()> {
        let Some(token) = self.inner.tokens.borrow_mut().remove(&fd) else {
            error!(fd, "unregister called for an fd that was never registered");
            return Err(Error::NotRegistered(fd));
        };
        self.inner.handlers.borrow_mut().remove(&token);

        self.inner
            .poll
            .borrow()
            .registry()
            .deregister(&mut SourceFd(&fd))
            .map_err(|source| Error::PollRegistration { fd, source })?;
        debug!(fd, token = token.0, "unregistered fd");
        Ok(())
    }

    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.inner.tokens.borrow().contains_key(&fd)
    }

    pub fn registered(&self) -> usize {
        self.inner.tokens.borrow().len()
    }

    /*
        @@@
        @run_once();
        . Blocks until a registered fd is ready or `timeout` elapses (None waits forever).
        . Dispatches each ready fd's read and/or write callback at most once, in readiness order.
        . EINTR is reported as zero events; callback errors are logged and swallowed.
    */
    pub fn run_once(&self, timeout: Option<Duration>) -> Result<usize> {
        let ready: Vec<(Token, bool, bool)> = {
            let mut events = self.inner.events.borrow_mut();
            match self.inner.poll.borrow_mut().poll(&mut events, timeout) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(0),
                Err(err) => return Err(Error::Io(err)),
            }
            events
                .iter()
                .map(|event| {
                    (
                        event.token(),
                        event.is_readable() || event.is_read_closed() || event.is_error(),
                        event.is_writable() || event.is_write_closed(),
                    )
                })
                .collect()
        };

        let mut dispatched = 0;
        for (token, readable, writable) in ready {
            if readable && self.dispatch(token, Direction::Readable) {
                dispatched += 1;
            }
            if writable && self.dispatch(token, Direction::Writable) {
                dispatched += 1;
            }
        }
        Ok(dispatched)
    }

    fn dispatch(&self, token: Token, direction: Direction) -> bool {
        // The callback is taken out of the map while it runs so it can freely touch the loop.
        let taken = {
            let mut handlers = self.inner.handlers.borrow_mut();
            let Some(entry) = handlers.get_mut(&token) else {
                return false;
            };
            let version = entry.version;
            entry.slot(direction).take().map(|callback| (callback, version))
        };
        let Some((mut callback, version)) = taken else {
            return false;
        };

        if let Err(err) = callback() {
            error!(token = token.0, error = format!("{err:#}"), "event callback failed");
        }

        let mut handlers = self.inner.handlers.borrow_mut();
        if let Some(entry) = handlers.get_mut(&token) {
            if entry.version == version {
                *entry.slot(direction) = Some(callback);
            }
        }
        true
    }
}
