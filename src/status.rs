use std::{
    fmt,
    sync::atomic::{AtomicU8, Ordering},
};

/// Lifecycle shared by event loops, loop threads, pools and servers.
///
/// Event loops only use `Null`, `Running` and `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Null = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    Stopped = 4,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Null => "Null",
            Status::Starting => "Starting",
            Status::Running => "Running",
            Status::Stopping => "Stopping",
            Status::Stopped => "Stopped",
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Status::Starting,
            2 => Status::Running,
            3 => Status::Stopping,
            4 => Status::Stopped,
            _ => Status::Null,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which teardown step a stopping server is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SubStatus {
    None = 0,
    StoppingListener = 1,
    StoppingThreadPool = 2,
}

impl SubStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SubStatus::None => "None",
            SubStatus::StoppingListener => "StoppingListener",
            SubStatus::StoppingThreadPool => "StoppingThreadPool",
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => SubStatus::StoppingListener,
            2 => SubStatus::StoppingThreadPool,
            _ => SubStatus::None,
        }
    }
}

impl fmt::Display for SubStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Atomically readable [`Status`] plus [`SubStatus`].
#[derive(Debug)]
pub struct StatusCell {
    status: AtomicU8,
    sub: AtomicU8,
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusCell {
    pub fn new() -> Self {
        Self {
            status: AtomicU8::new(Status::Null as u8),
            sub: AtomicU8::new(SubStatus::None as u8),
        }
    }

    pub fn get(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set(&self, status: Status) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Moves from `from` to `to`, returning the observed status on failure.
    pub fn transition(&self, from: Status, to: Status) -> Result<(), Status> {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(Status::from_u8)
    }

    pub fn sub(&self) -> SubStatus {
        SubStatus::from_u8(self.sub.load(Ordering::Acquire))
    }

    pub fn set_sub(&self, sub: SubStatus) {
        self.sub.store(sub as u8, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.get() == Status::Running
    }

    pub fn is_stopped(&self) -> bool {
        self.get() == Status::Stopped
    }
}
