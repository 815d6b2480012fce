pub mod event_loop;
pub mod mailbox;
pub mod timer;

use std::cell::Cell;
use std::rc::Rc;

pub use event_loop::{Callback, EventLoop};
pub use mailbox::{Mailbox, Notice, ProcessEvent, ProcessNotice, ServerEvent};
pub use timer::Timer;

use crate::error::Result;

/*
    @@@
    @Context;
    . Built once in the entry point and cloned into JobManager, Job and ProcessHandle.
    . Bundles the EventLoop, the Mailbox its callbacks post into, and a ticket counter used to recognise stale notices.
*/
#[derive(Clone)]
pub struct Context {
    event_loop: EventLoop,
    mailbox: Mailbox,
    tickets: Rc<Cell<u64>>,
}

impl Context {
    pub fn new() -> Result<Self> {
        Ok(Self {
            event_loop: EventLoop::new()?,
            mailbox: Mailbox::default(),
            tickets: Rc::new(Cell::new(0)),
        })
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    pub fn next_ticket(&self) -> u64 {
        let ticket = self.tickets.get() + 1;
        self.tickets.set(ticket);
        ticket
    }
}
