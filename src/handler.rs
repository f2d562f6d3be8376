use std::sync::Arc;

use mio::{event::Event, Interest};

/// Callback target for readiness events on a registered source.
///
/// Handlers always run on the thread of the event loop they were registered
/// with.
pub trait EventHandler: Send + Sync {
    fn handle_event(&self, event: &Event);
}

pub(crate) struct HandlerEntry {
    pub handler: Arc<dyn EventHandler>,
    pub interest: Interest,
}

impl HandlerEntry {
    pub fn new(handler: Arc<dyn EventHandler>, interest: Interest) -> Self {
        HandlerEntry { handler, interest }
    }

    /// Whether `event` carries anything this entry subscribed to. Errors and
    /// hang-ups are always delivered.
    pub fn wants(&self, event: &Event) -> bool {
        (self.interest.is_readable() && (event.is_readable() || event.is_read_closed()))
            || (self.interest.is_writable() && (event.is_writable() || event.is_write_closed()))
            || event.is_error()
    }
}
