use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, OnceLock,
    },
    thread::{self, ThreadId},
    time::{Duration, Instant},
};

use mio::{event::Source, Interest, Poll, Token};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{
    error::{Error, Result},
    handler::EventHandler,
    poll::PollHandle,
    reactor::{Reactor, Task, DEFAULT_EVENTS_CAPACITY},
    status::{Status, StatusCell},
    timer::{TimerHandle, TimerQueue},
};

struct Shared {
    name: String,
    poll_handle: PollHandle,
    reactor: Mutex<Option<Reactor>>,
    tasks: mpsc::Sender<Task>,
    timers: Mutex<TimerQueue>,
    status: StatusCell,
    owner: OnceLock<ThreadId>,
    quit: AtomicBool,
}

/// A single-threaded reactor: I/O readiness, deferred tasks and timers all
/// run on the one thread that called [`start`](Self::start).
///
/// `EventLoop` is a cheap, cloneable handle. Every method except `start` may
/// be called from any thread; work meant for the loop is marshalled through
/// its task queue and the poller is woken up.
///
/// ```rust,no_run
/// use mill_tcp::EventLoop;
/// use std::time::Duration;
///
/// let event_loop = EventLoop::new("main")?;
/// let handle = event_loop.clone();
/// event_loop.run_after(Duration::from_millis(100), move || handle.stop());
/// event_loop.start()?; // returns once stop() ran
/// # Ok::<(), mill_tcp::Error>(())
/// ```
#[derive(Clone)]
pub struct EventLoop {
    shared: Arc<Shared>,
}

impl EventLoop {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        Self::with_capacity(name, DEFAULT_EVENTS_CAPACITY)
    }

    /// Creates a loop whose poller returns at most `events_capacity` events
    /// per iteration.
    pub fn with_capacity(name: impl Into<String>, events_capacity: usize) -> Result<Self> {
        let poll = Poll::new()?;
        let poll_handle = PollHandle::new(&poll)?;
        let (tasks, receiver) = mpsc::channel();
        let reactor = Reactor::new(poll, events_capacity, receiver);
        Ok(Self {
            shared: Arc::new(Shared {
                name: name.into(),
                poll_handle,
                reactor: Mutex::new(Some(reactor)),
                tasks,
                timers: Mutex::new(TimerQueue::default()),
                status: StatusCell::new(),
                owner: OnceLock::new(),
                quit: AtomicBool::new(false),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// `Null` before start, `Running` while the reactor runs, `Stopped` after.
    pub fn status(&self) -> Status {
        self.shared.status.get()
    }

    /// Binds the calling thread as the loop's owner and runs the reactor until
    /// [`stop`](Self::stop) is called. A loop cannot be restarted.
    pub fn start(&self) -> Result<()> {
        let mut reactor = self
            .shared
            .reactor
            .lock()
            .take()
            .ok_or_else(|| Error::LoopStarted(self.shared.name.clone()))?;

        let _ = self.shared.owner.set(thread::current().id());
        self.shared.status.set(Status::Running);
        info!(event_loop = %self.shared.name, "event loop started");

        let result = reactor.run(self);

        self.shared.status.set(Status::Stopped);
        drop(reactor);
        match &result {
            Ok(()) => info!(event_loop = %self.shared.name, "event loop stopped"),
            Err(e) => warn!(event_loop = %self.shared.name, error = %e, "event loop failed"),
        }
        result
    }

    /// Asks the loop to return from `start` after its current iteration.
    pub fn stop(&self) {
        self.shared.quit.store(true, Ordering::Release);
        self.wakeup();
    }

    pub fn is_in_loop_thread(&self) -> bool {
        self.shared.owner.get() == Some(&thread::current().id())
    }

    /// Runs `task` right away on the loop thread, or queues it from any other.
    pub fn run_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Always defers `task` to a later loop iteration. Tasks queued from one
    /// thread run in submission order.
    pub fn queue_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shared.tasks.send(Box::new(task)).is_err() {
            debug!(event_loop = %self.shared.name, "loop is gone, task dropped");
            return;
        }
        self.wakeup();
    }

    /// Runs `callback` once on the loop thread after `delay`.
    pub fn run_after<F>(&self, delay: Duration, callback: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let mut callback = Some(callback);
        self.schedule(
            delay,
            None,
            Box::new(move || {
                if let Some(callback) = callback.take() {
                    callback();
                }
            }),
        )
    }

    /// Runs `callback` on the loop thread every `interval` until cancelled.
    pub fn run_every<F>(&self, interval: Duration, callback: F) -> TimerHandle
    where
        F: FnMut() + Send + 'static,
    {
        self.schedule(interval, Some(interval), Box::new(callback))
    }

    /// Registers `source` with this loop's poller, returning the token
    /// assigned to it. `handler` runs on the loop thread.
    pub fn register<S>(
        &self,
        source: &mut S,
        interest: Interest,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Token>
    where
        S: Source + ?Sized,
    {
        self.shared.poll_handle.register(source, interest, handler)
    }

    pub fn reregister<S>(&self, source: &mut S, token: Token, interest: Interest) -> Result<()>
    where
        S: Source + ?Sized,
    {
        self.shared.poll_handle.reregister(source, token, interest)
    }

    pub fn deregister<S>(&self, source: &mut S, token: Token) -> Result<()>
    where
        S: Source + ?Sized,
    {
        self.shared.poll_handle.deregister(source, token)
    }

    pub(crate) fn poll_handle(&self) -> &PollHandle {
        &self.shared.poll_handle
    }

    pub(crate) fn quit_requested(&self) -> bool {
        self.shared.quit.load(Ordering::Acquire)
    }

    pub(crate) fn next_timer_timeout(&self, now: Instant) -> Option<Duration> {
        self.shared.timers.lock().next_timeout(now)
    }

    pub(crate) fn fire_expired_timers(&self, now: Instant) {
        let expired = self.shared.timers.lock().pop_expired(now);
        for entry in expired {
            // callbacks run unlocked, they may schedule more timers
            if let Some(entry) = entry.fire() {
                self.shared.timers.lock().reschedule(entry);
            }
        }
    }

    fn schedule(
        &self,
        delay: Duration,
        interval: Option<Duration>,
        callback: crate::timer::TimerCallback,
    ) -> TimerHandle {
        let handle = self
            .shared
            .timers
            .lock()
            .schedule(Instant::now() + delay, interval, callback);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
        handle
    }

    fn wakeup(&self) {
        if let Err(e) = self.shared.poll_handle.wake() {
            warn!(event_loop = %self.shared.name, error = %e, "failed to wake event loop");
        }
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("name", &self.shared.name)
            .field("status", &self.status())
            .finish()
    }
}
