use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Arc,
    },
    thread::{self, Builder, JoinHandle},
    time::Duration,
};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{
    error::{Error, Result},
    event_loop::EventLoop,
    status::{Status, StatusCell},
};

/// Runs once on the loop thread before the first iteration. An error stops
/// the loop straight away.
pub type StartHook = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// Runs once on the loop thread after the loop returned.
pub type StopHook = Box<dyn FnOnce() + Send + 'static>;

/// One [`EventLoop`] running on its own OS thread.
pub struct EventLoopThread {
    event_loop: EventLoop,
    status: Arc<StatusCell>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl EventLoopThread {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        Ok(Self {
            event_loop: EventLoop::new(name)?,
            status: Arc::new(StatusCell::new()),
            thread: Mutex::new(None),
        })
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    pub fn status(&self) -> Status {
        self.status.get()
    }

    /// Spawns the thread. With `wait_started` the call returns only after
    /// `pre` ran on the new thread, and reports its failure.
    pub fn start(
        &self,
        wait_started: bool,
        pre: Option<StartHook>,
        post: Option<StopHook>,
    ) -> Result<()> {
        self.status
            .transition(Status::Null, Status::Starting)
            .map_err(|actual| Error::invalid_state("loop thread", "Null", actual.as_str()))?;

        let (ready_tx, ready_rx) = mpsc::channel::<bool>();
        let name = self.event_loop.name().to_string();

        let hook_loop = self.event_loop.clone();
        let hook_status = Arc::clone(&self.status);
        self.event_loop.queue_in_loop(move || {
            let outcome = pre.map_or(Ok(()), |hook| hook());
            match outcome {
                Ok(()) => {
                    hook_status.set(Status::Running);
                    let _ = ready_tx.send(true);
                }
                Err(e) => {
                    warn!(event_loop = hook_loop.name(), error = %e, "start hook failed, stopping loop");
                    let _ = ready_tx.send(false);
                    hook_loop.stop();
                }
            }
        });

        let event_loop = self.event_loop.clone();
        let status = Arc::clone(&self.status);
        let handle = Builder::new()
            .name(name.clone())
            .spawn(move || {
                debug!(event_loop = event_loop.name(), "loop thread started");
                if let Err(e) = event_loop.start() {
                    warn!(event_loop = event_loop.name(), error = %e, "event loop exited with error");
                }
                if let Some(post) = post {
                    post();
                }
                status.set(Status::Stopped);
                debug!(event_loop = event_loop.name(), "loop thread exiting");
            })
            .map_err(|source| {
                self.status.set(Status::Stopped);
                Error::ThreadSpawn {
                    name: name.clone(),
                    source,
                }
            })?;
        *self.thread.lock() = Some(handle);

        if wait_started {
            match ready_rx.recv() {
                Ok(true) => {}
                Ok(false) | Err(_) => return Err(Error::HookFailed(name)),
            }
        }
        Ok(())
    }

    /// Stops the loop. With `wait_exit` the caller polls until the thread
    /// finished its stop hook; never wait from the loop's own thread.
    pub fn stop(&self, wait_exit: bool) {
        self.event_loop.stop();
        if !wait_exit {
            return;
        }
        if self.event_loop.is_in_loop_thread() {
            warn!(event_loop = self.event_loop.name(), "stop(wait) called on its own thread");
            return;
        }
        while self.status.get() != Status::Stopped && self.thread.lock().is_some() {
            thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn join(&self) {
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!(event_loop = self.event_loop.name(), "loop thread panicked");
            }
        }
    }
}

struct PoolInner {
    name: String,
    base_loop: EventLoop,
    threads: Vec<EventLoopThread>,
    status: StatusCell,
    next: AtomicUsize,
    started: AtomicUsize,
    exited: AtomicUsize,
    on_stopped: Mutex<Option<Box<dyn FnOnce() + Send + 'static>>>,
}

/// A base loop plus `n` worker loops, each on its own thread.
///
/// New work is spread over the workers round-robin with
/// [`next_loop`](Self::next_loop); with zero workers everything stays on the
/// base loop.
#[derive(Clone)]
pub struct EventLoopThreadPool {
    inner: Arc<PoolInner>,
}

impl EventLoopThreadPool {
    pub fn new(base_loop: &EventLoop, thread_count: usize, name: &str) -> Result<Self> {
        let threads = (0..thread_count)
            .map(|i| EventLoopThread::new(format!("{name}-loop-{i}")))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            inner: Arc::new(PoolInner {
                name: name.to_string(),
                base_loop: base_loop.clone(),
                threads,
                status: StatusCell::new(),
                next: AtomicUsize::new(0),
                started: AtomicUsize::new(0),
                exited: AtomicUsize::new(0),
                on_stopped: Mutex::new(None),
            }),
        })
    }

    pub fn thread_count(&self) -> usize {
        self.inner.threads.len()
    }

    pub fn status(&self) -> Status {
        self.inner.status.get()
    }

    pub fn base_loop(&self) -> &EventLoop {
        &self.inner.base_loop
    }

    /// Starts every worker. With `wait_started` this returns once all of
    /// them report running.
    pub fn start(&self, wait_started: bool) -> Result<()> {
        let inner = &self.inner;
        inner
            .status
            .transition(Status::Null, Status::Starting)
            .map_err(|actual| Error::invalid_state("thread pool", "Null", actual.as_str()))?;

        if inner.threads.is_empty() {
            inner.status.set(Status::Running);
            return Ok(());
        }

        let total = inner.threads.len();
        for thread in &inner.threads {
            let on_start = Arc::clone(inner);
            let pre: StartHook = Box::new(move || {
                if on_start.started.fetch_add(1, Ordering::AcqRel) + 1 == total {
                    on_start.status.set(Status::Running);
                    info!(pool = %on_start.name, threads = total, "thread pool running");
                }
                Ok(())
            });
            let on_exit = Arc::clone(inner);
            let post: StopHook = Box::new(move || {
                if on_exit.exited.fetch_add(1, Ordering::AcqRel) + 1 == total {
                    let finisher = Arc::clone(&on_exit);
                    on_exit
                        .base_loop
                        .queue_in_loop(move || PoolInner::finish(&finisher));
                }
            });
            thread.start(wait_started, Some(pre), Some(post))?;
        }
        Ok(())
    }

    /// The loop the next unit of work should go to.
    pub fn next_loop(&self) -> EventLoop {
        let inner = &self.inner;
        if inner.threads.is_empty() || !inner.status.is_running() {
            return inner.base_loop.clone();
        }
        let index = inner.next.fetch_add(1, Ordering::Relaxed) % inner.threads.len();
        inner.threads[index].event_loop().clone()
    }

    /// Stops every worker without blocking. `on_stopped` runs exactly once,
    /// on the base loop, after all workers exited and were joined.
    pub fn stop<F>(&self, on_stopped: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let inner = &self.inner;
        let from = inner.status.get();
        if !matches!(from, Status::Starting | Status::Running) {
            return Err(Error::invalid_state(
                "thread pool",
                "Running",
                from.as_str(),
            ));
        }
        inner
            .status
            .transition(from, Status::Stopping)
            .map_err(|actual| Error::invalid_state("thread pool", "Running", actual.as_str()))?;
        *inner.on_stopped.lock() = Some(Box::new(on_stopped));

        if inner.threads.is_empty() {
            PoolInner::finish(inner);
            return Ok(());
        }
        for thread in &inner.threads {
            thread.stop(false);
        }
        Ok(())
    }

    /// Blocks until every worker thread is gone. Call from outside the pool.
    pub fn join(&self) {
        for thread in &self.inner.threads {
            thread.join();
        }
    }
}

impl PoolInner {
    fn finish(inner: &Arc<PoolInner>) {
        for thread in &inner.threads {
            thread.join();
        }
        inner.status.set(Status::Stopped);
        info!(pool = %inner.name, "thread pool stopped");
        let callback = inner.on_stopped.lock().take();
        if let Some(callback) = callback {
            callback();
        }
    }
}
