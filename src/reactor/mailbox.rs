use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::control::Command;
use crate::ipc::server::ClientId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessEvent {
    /// The pidfd became readable: the child is ready to be reaped.
    Exited,
    StartTimeElapsed,
    StopTimeElapsed,
}

/// Addresses one process slot. `ticket` pins the notice to the spawn or timer that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessNotice {
    pub job: Rc<str>,
    pub slot: usize,
    pub ticket: u64,
    pub event: ProcessEvent,
}

/// Readiness on the control socket, serviced by ControlServer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerEvent {
    Accept,
    Ready(ClientId),
}

#[derive(Debug)]
pub enum Notice {
    Process(ProcessNotice),
    Server(ServerEvent),
    Control { client: ClientId, command: Command },
    Signal(i32),
}

/// Queue filled by event-loop callbacks and drained by the runtime after each cycle.
#[derive(Clone, Default)]
pub struct Mailbox {
    queue: Rc<RefCell<VecDeque<Notice>>>,
}

impl Mailbox {
    pub fn post(&self, notice: Notice) {
        self.queue.borrow_mut().push_back(notice);
    }

    pub fn drain(&self) -> Vec<Notice> {
        self.queue.borrow_mut().drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.borrow().is_empty()
    }
}
