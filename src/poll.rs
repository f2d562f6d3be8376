use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use mio::{event::Source, Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;

use crate::{
    error::Result,
    handler::{EventHandler, HandlerEntry},
};

/// Token reserved for the loop's waker.
pub const WAKE_TOKEN: Token = Token(0);

/// Registration side of a loop's poller, shareable across threads.
///
/// Owns a clone of the [`mio::Registry`], the waker used to interrupt a
/// blocking poll, and the token to handler map the reactor dispatches through.
pub struct PollHandle {
    registry: Registry,
    waker: Arc<Waker>,
    handlers: Mutex<HashMap<Token, HandlerEntry>>,
    next_token: AtomicUsize,
}

impl PollHandle {
    pub fn new(poll: &Poll) -> Result<Self> {
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        Ok(PollHandle {
            registry,
            waker: Arc::new(waker),
            handlers: Mutex::new(HashMap::new()),
            next_token: AtomicUsize::new(WAKE_TOKEN.0 + 1),
        })
    }

    /// Registers `source` under a fresh token and returns it.
    pub fn register<S>(
        &self,
        source: &mut S,
        interest: Interest,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Token>
    where
        S: Source + ?Sized,
    {
        let token = Token(self.next_token.fetch_add(1, Ordering::Relaxed));
        // insert first so an event arriving right after registration finds its handler
        self.handlers
            .lock()
            .insert(token, HandlerEntry::new(handler, interest));
        if let Err(e) = source.register(&self.registry, token, interest) {
            self.handlers.lock().remove(&token);
            return Err(e.into());
        }
        Ok(token)
    }

    pub fn reregister<S>(&self, source: &mut S, token: Token, interest: Interest) -> Result<()>
    where
        S: Source + ?Sized,
    {
        source.reregister(&self.registry, token, interest)?;
        if let Some(entry) = self.handlers.lock().get_mut(&token) {
            entry.interest = interest;
        }
        Ok(())
    }

    pub fn deregister<S>(&self, source: &mut S, token: Token) -> Result<()>
    where
        S: Source + ?Sized,
    {
        let removed = self.handlers.lock().remove(&token);
        // dropped after the guard so a handler drop cannot re-enter the map lock
        drop(removed);
        source.deregister(&self.registry)?;
        Ok(())
    }

    /// The handler for `token` if `event` matches its registered interest.
    pub(crate) fn entry_for(
        &self,
        token: Token,
        event: &mio::event::Event,
    ) -> Option<Arc<dyn EventHandler>> {
        let handlers = self.handlers.lock();
        let entry = handlers.get(&token)?;
        entry.wants(event).then(|| Arc::clone(&entry.handler))
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.lock().len()
    }

    pub fn wake(&self) -> Result<()> {
        Ok(self.waker.wake()?)
    }
}
