use std::{io, sync::mpsc, time::Instant};

use mio::{Events, Poll};
use tracing::trace;

use crate::{error::Result, event_loop::EventLoop, poll::WAKE_TOKEN};

pub const DEFAULT_EVENTS_CAPACITY: usize = 1024;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// The poll side of an event loop: the OS poller, its event buffer and the
/// receiving end of the loop's task queue.
///
/// A reactor is driven by exactly one thread, the one that called
/// [`EventLoop::start`].
pub struct Reactor {
    poll: Poll,
    events: Events,
    tasks: mpsc::Receiver<Task>,
}

impl Reactor {
    pub(crate) fn new(poll: Poll, events_capacity: usize, tasks: mpsc::Receiver<Task>) -> Self {
        Self {
            poll,
            events: Events::with_capacity(events_capacity),
            tasks,
        }
    }

    /// Runs until the loop is asked to quit.
    ///
    /// Each iteration drains the tasks queued so far, polls with a timeout
    /// derived from the earliest timer, dispatches readiness events to their
    /// handlers, then fires expired timers.
    pub(crate) fn run(&mut self, event_loop: &EventLoop) -> Result<()> {
        loop {
            self.run_pending_tasks();
            if event_loop.quit_requested() {
                break;
            }

            let timeout = event_loop.next_timer_timeout(Instant::now());
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            self.dispatch_events(event_loop);
            event_loop.fire_expired_timers(Instant::now());
        }

        let dropped = self.tasks.try_iter().count();
        if dropped > 0 {
            trace!(event_loop = event_loop.name(), dropped, "discarding tasks queued after stop");
        }
        Ok(())
    }

    fn run_pending_tasks(&mut self) {
        // tasks queued while this batch runs wait for the next iteration
        let batch: Vec<Task> = self.tasks.try_iter().collect();
        for task in batch {
            task();
        }
    }

    fn dispatch_events(&self, event_loop: &EventLoop) {
        let poll_handle = event_loop.poll_handle();
        for event in self.events.iter() {
            let token = event.token();
            if token == WAKE_TOKEN {
                continue;
            }
            if let Some(handler) = poll_handle.entry_for(token, event) {
                handler.handle_event(event);
            }
        }
    }
}
