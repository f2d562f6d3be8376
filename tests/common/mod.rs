#![allow(dead_code)]

use std::{
    thread,
    time::{Duration, Instant},
};

use mill_tcp::{EventLoop, Status};

/// An event loop running on its own thread, stopped and joined on drop.
pub struct LoopHandle {
    pub event_loop: EventLoop,
    handle: Option<thread::JoinHandle<mill_tcp::Result<()>>>,
}

impl LoopHandle {
    pub fn spawn(name: &str) -> Self {
        init_tracing();
        let event_loop = EventLoop::new(name).expect("create loop");
        let runner = event_loop.clone();
        let handle = thread::spawn(move || runner.start());
        assert!(wait_until(Duration::from_secs(5), || {
            event_loop.status() == Status::Running
        }));
        Self {
            event_loop,
            handle: Some(handle),
        }
    }
}

impl Drop for LoopHandle {
    fn drop(&mut self) {
        self.event_loop.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

pub fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    done()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
