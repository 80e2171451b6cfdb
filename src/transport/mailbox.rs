//! Single-slot conflating mailbox.
//!
//! Holds at most one unconsumed value. Posting while a value is still unread
//! replaces it, so a slow consumer always sees the freshest state and backlog
//! can never build up. The consumer waits at most the given timeout.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::frame::Frame;

/// The video frame channel used by the control loop.
pub type FrameChannel = Mailbox<Frame>;

/// Result of a bounded receive.
#[derive(Debug, PartialEq)]
pub enum Receive<T> {
    Fresh(T),
    /// Nothing arrived within the timeout. Not an error.
    Timeout,
}

/// Counters for health logging.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MailboxStats {
    pub posted: u64,
    pub delivered: u64,
    /// Values replaced before anyone read them.
    pub conflated: u64,
}

pub struct Mailbox<T> {
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

struct Slot<T> {
    value: Option<T>,
    stats: MailboxStats,
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot {
                    value: None,
                    stats: MailboxStats::default(),
                }),
                ready: Condvar::new(),
            }),
        }
    }

    /// Store `value`, discarding any unread predecessor.
    ///
    /// Returns true when an unread value was dropped.
    pub fn post(&self, value: T) -> bool {
        let replaced = {
            let mut slot = self.lock();
            slot.stats.posted += 1;
            let replaced = slot.value.replace(value).is_some();
            if replaced {
                slot.stats.conflated += 1;
            }
            replaced
        };
        self.shared.ready.notify_one();
        replaced
    }

    /// Take the pending value without waiting.
    pub fn try_take(&self) -> Option<T> {
        let mut slot = self.lock();
        let value = slot.value.take();
        if value.is_some() {
            slot.stats.delivered += 1;
        }
        value
    }

    /// Wait up to `timeout` for a value.
    pub fn try_receive(&self, timeout: Duration) -> Receive<T> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.lock();
        loop {
            if let Some(value) = slot.value.take() {
                slot.stats.delivered += 1;
                return Receive::Fresh(value);
            }
            let now = Instant::now();
            if now >= deadline {
                return Receive::Timeout;
            }
            let (guard, _) = self
                .shared
                .ready
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            slot = guard;
        }
    }

    pub fn has_pending(&self) -> bool {
        self.lock().value.is_some()
    }

    pub fn stats(&self) -> MailboxStats {
        self.lock().stats
    }

    // poisoning is ignored: the slot only holds plain data
    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.shared
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Clone for Mailbox<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn only_the_last_unconsumed_value_is_kept() {
        let mailbox = Mailbox::new();
        for i in 0..10 {
            mailbox.post(i);
        }
        assert_eq!(mailbox.try_take(), Some(9));
        assert_eq!(mailbox.try_take(), None);
        let stats = mailbox.stats();
        assert_eq!(stats.posted, 10);
        assert_eq!(stats.conflated, 9);
        assert_eq!(stats.delivered, 1);
    }

    #[test]
    fn receive_times_out_when_empty() {
        let mailbox: Mailbox<u32> = Mailbox::new();
        let start = Instant::now();
        assert_eq!(mailbox.try_receive(Duration::from_millis(30)), Receive::Timeout);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn receive_wakes_on_post_from_another_thread() {
        let mailbox = Mailbox::new();
        let producer = mailbox.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.post("frame");
        });
        assert_eq!(
            mailbox.try_receive(Duration::from_secs(5)),
            Receive::Fresh("frame")
        );
        handle.join().unwrap();
    }

    #[test]
    fn post_reports_replacement() {
        let mailbox = Mailbox::new();
        assert!(!mailbox.post(1));
        assert!(mailbox.post(2));
        assert!(mailbox.has_pending());
        assert_eq!(mailbox.try_receive(Duration::from_millis(1)), Receive::Fresh(2));
        assert!(!mailbox.has_pending());
    }
}
