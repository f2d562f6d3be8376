//! Deadline timers driven by the reactor's poll timeout.
//!
//! Timers live in a min-heap ordered by deadline, ties broken by insertion
//! order. Cancellation only flips a shared flag; cancelled entries are
//! skipped when they reach the top of the heap.

use std::{
    cmp::Ordering as CmpOrdering,
    collections::BinaryHeap,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

pub(crate) type TimerCallback = Box<dyn FnMut() + Send + 'static>;

/// Cancellation handle returned by `run_after` and `run_every`.
///
/// Cancelling a timer that already fired is a no-op. A callback that is
/// already running when `cancel` is called still completes.
#[derive(Clone)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

pub(crate) struct TimerEntry {
    deadline: Instant,
    sequence: u64,
    interval: Option<Duration>,
    callback: TimerCallback,
    cancelled: Arc<AtomicBool>,
}

impl TimerEntry {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Runs the callback. Returns the entry again if it repeats and is still live.
    pub(crate) fn fire(mut self) -> Option<TimerEntry> {
        if self.is_cancelled() {
            return None;
        }
        (self.callback)();
        let interval = self.interval?;
        if self.is_cancelled() {
            return None;
        }
        self.deadline = Instant::now() + interval;
        Some(self)
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.sequence == other.sequence
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // reversed so the earliest deadline sits on top of the max-heap
    fn cmp(&self, other: &Self) -> CmpOrdering {
        match other.deadline.cmp(&self.deadline) {
            CmpOrdering::Equal => other.sequence.cmp(&self.sequence),
            ord => ord,
        }
    }
}

#[derive(Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<TimerEntry>,
    sequence: u64,
}

impl TimerQueue {
    pub fn schedule(
        &mut self,
        deadline: Instant,
        interval: Option<Duration>,
        callback: TimerCallback,
    ) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        self.sequence += 1;
        self.heap.push(TimerEntry {
            deadline,
            sequence: self.sequence,
            interval,
            callback,
            cancelled: Arc::clone(&cancelled),
        });
        TimerHandle { cancelled }
    }

    /// Puts a repeating entry back after it fired.
    pub fn reschedule(&mut self, mut entry: TimerEntry) {
        self.sequence += 1;
        entry.sequence = self.sequence;
        self.heap.push(entry);
    }

    /// Time until the earliest live deadline, `None` when no timer is pending.
    pub fn next_timeout(&mut self, now: Instant) -> Option<Duration> {
        while let Some(top) = self.heap.peek() {
            if top.is_cancelled() {
                self.heap.pop();
                continue;
            }
            return Some(top.deadline.saturating_duration_since(now));
        }
        None
    }

    /// Removes every entry due at `now`, earliest first.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<TimerEntry> {
        let mut expired = Vec::new();
        while let Some(top) = self.heap.peek() {
            if top.deadline > now {
                break;
            }
            if let Some(entry) = self.heap.pop() {
                if !entry.is_cancelled() {
                    expired.push(entry);
                }
            }
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{atomic::AtomicUsize, Mutex};

    fn recorder(log: &Arc<Mutex<Vec<u32>>>, tag: u32) -> TimerCallback {
        let log = log.clone();
        Box::new(move || log.lock().unwrap().push(tag))
    }

    #[test]
    fn test_expired_in_deadline_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut queue = TimerQueue::default();
        let now = Instant::now();
        queue.schedule(now + Duration::from_millis(30), None, recorder(&log, 3));
        queue.schedule(now + Duration::from_millis(10), None, recorder(&log, 1));
        queue.schedule(now + Duration::from_millis(10), None, recorder(&log, 2));
        queue.schedule(now + Duration::from_secs(60), None, recorder(&log, 9));

        for entry in queue.pop_expired(now + Duration::from_millis(40)) {
            assert!(entry.fire().is_none());
        }
        assert_eq!(*log.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_cancelled_timer_never_fires() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut queue = TimerQueue::default();
        let now = Instant::now();
        let handle = queue.schedule(now, None, recorder(&log, 1));
        handle.cancel();

        assert!(queue.pop_expired(now).is_empty());
        assert!(log.lock().unwrap().is_empty());
        // cancelling again after the entry is gone is harmless
        handle.cancel();
    }

    #[test]
    fn test_next_timeout_skips_cancelled() {
        let mut queue = TimerQueue::default();
        let now = Instant::now();
        let early = queue.schedule(now + Duration::from_millis(5), None, Box::new(|| {}));
        queue.schedule(now + Duration::from_millis(50), None, Box::new(|| {}));

        early.cancel();
        assert_eq!(queue.next_timeout(now), Some(Duration::from_millis(50)));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_repeating_entry_reschedules_until_cancelled() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut queue = TimerQueue::default();
        let counter = count.clone();
        let handle = queue.schedule(
            Instant::now(),
            Some(Duration::from_millis(1)),
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let entry = queue.pop_expired(Instant::now()).pop().unwrap();
        let entry = entry.fire().expect("repeating timer comes back");
        queue.reschedule(entry);
        assert_eq!(queue.len(), 1);

        handle.cancel();
        assert!(queue
            .pop_expired(Instant::now() + Duration::from_secs(1))
            .is_empty());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
