//! D-Mail: a deferred revert-and-inject request
//!
//! A tool sends a D-Mail naming a past checkpoint and a replacement user
//! message; the loop driver consumes it between steps, reverts the context
//! to that checkpoint, and continues with the injected message. The
//! mailbox holds at most one pending mail.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

/// A pending revert-and-inject request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DMail {
    /// Target checkpoint id
    pub checkpoint_id: u32,
    /// User message injected after the revert
    pub message: String,
}

/// One-slot mailbox shared between the sending tool and the loop driver.
/// Cheap to clone.
#[derive(Clone, Default)]
pub struct DMailBox {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    pending: Mutex<Option<DMail>>,
    n_checkpoints: AtomicU32,
}

impl DMailBox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record how many checkpoints currently exist; maintained by the
    /// driver after every checkpoint, revert, and compaction.
    pub fn set_checkpoint_count(&self, count: u32) {
        self.inner.n_checkpoints.store(count, Ordering::Release);
    }

    /// Checkpoint count as last synced by the driver
    pub fn checkpoint_count(&self) -> u32 {
        self.inner.n_checkpoints.load(Ordering::Acquire)
    }

    /// Store a mail targeting `checkpoint_id`.
    ///
    /// Returns `false` when the id is out of range or a mail is already
    /// pending; the slot is left untouched in both cases.
    pub fn send(&self, checkpoint_id: u32, message: impl Into<String>) -> bool {
        let available = self.checkpoint_count();
        if checkpoint_id >= available {
            tracing::warn!(
                "rejected D-Mail to checkpoint {checkpoint_id}: {available} checkpoints exist"
            );
            return false;
        }
        let mut slot = self.inner.pending.lock();
        if slot.is_some() {
            tracing::warn!("rejected D-Mail to checkpoint {checkpoint_id}: mailbox occupied");
            return false;
        }
        *slot = Some(DMail {
            checkpoint_id,
            message: message.into(),
        });
        true
    }

    /// Atomically remove and return any pending mail
    pub fn fetch(&self) -> Option<DMail> {
        self.inner.pending.lock().take()
    }

    /// Drop any pending mail
    pub fn clear(&self) {
        *self.inner.pending.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_requires_existing_checkpoint() {
        let mailbox = DMailBox::new();
        assert!(!mailbox.send(0, "no checkpoints yet"));

        mailbox.set_checkpoint_count(3);
        assert!(mailbox.send(2, "ok"));
        assert_eq!(
            mailbox.fetch(),
            Some(DMail {
                checkpoint_id: 2,
                message: "ok".into()
            })
        );
        assert!(!mailbox.send(3, "out of range"));
    }

    #[test]
    fn test_single_slot() {
        let mailbox = DMailBox::new();
        mailbox.set_checkpoint_count(1);
        assert!(mailbox.send(0, "first"));
        assert!(!mailbox.send(0, "second"));
        assert_eq!(mailbox.fetch().unwrap().message, "first");
        // fetch cleared the slot
        assert!(mailbox.fetch().is_none());
        assert!(mailbox.send(0, "third"));
    }

    #[test]
    fn test_clear() {
        let mailbox = DMailBox::new();
        mailbox.set_checkpoint_count(1);
        assert!(mailbox.send(0, "pending"));
        mailbox.clear();
        assert!(mailbox.fetch().is_none());
    }
}
