//! One-slot binary task notification.
//!
//! A [`Notifier`] gives a token, a [`TaskNotification`] takes it and blocks
//! while none is available. Several gives before a take collapse into one
//! token. Giving is non-blocking and may be done from interrupt context.
//!
//! The token flag is published with release ordering before the waiter is
//! unparked and consumed with acquire ordering, so everything the giver wrote
//! before `notify()` is visible to the task once `take()` returns.

use crossbeam_utils::sync::{Parker, Unparker};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Giving side of a task notification. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Notifier {
    token: Arc<AtomicBool>,
    unparker: Unparker,
}

/// Taking side of a task notification, owned by exactly one task.
#[derive(Debug)]
pub struct TaskNotification {
    token: Arc<AtomicBool>,
    parker: Parker,
}

/// Create a connected notifier / notification pair.
#[must_use]
pub fn task_notification() -> (Notifier, TaskNotification) {
    let parker = Parker::new();
    let token = Arc::new(AtomicBool::new(false));
    (
        Notifier {
            token: Arc::clone(&token),
            unparker: parker.unparker().clone(),
        },
        TaskNotification { token, parker },
    )
}

impl Notifier {
    /// Make the token available and wake the task.
    #[inline]
    pub fn notify(&self) {
        self.token.store(true, Ordering::Release);
        self.unparker.unpark();
    }

    /// Returns true if a token was given and not taken yet.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.token.load(Ordering::Acquire)
    }
}

impl TaskNotification {
    /// Consume the token, blocking until it is available.
    pub fn take(&self) {
        while !self.try_take() {
            self.parker.park();
        }
    }

    /// Consume the token if available, without blocking.
    #[inline]
    pub fn try_take(&self) -> bool {
        self.token.swap(false, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_gives_collapse_into_one_token() {
        let (notifier, notification) = task_notification();
        notifier.notify();
        notifier.notify();

        assert!(notification.try_take());
        assert!(!notification.try_take());
    }

    #[test]
    fn test_pending_does_not_consume() {
        let (notifier, notification) = task_notification();
        assert!(!notifier.is_pending());

        notifier.notify();
        assert!(notifier.is_pending());
        assert!(notifier.is_pending());
        assert!(notification.try_take());
        assert!(!notifier.is_pending());
    }

    #[test]
    fn test_cross_thread_handoff() {
        let (notifier, notification) = task_notification();
        let flag = Arc::new(AtomicBool::new(false));

        let writer_flag = Arc::clone(&flag);
        let handle = thread::spawn(move || {
            writer_flag.store(true, Ordering::Relaxed);
            notifier.notify();
        });

        notification.take();
        assert!(flag.load(Ordering::Relaxed));
        handle.join().unwrap();
    }
}
