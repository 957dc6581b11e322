//! Mailboxes between the host UI, render and encoder threads.
//!
//! Each mailbox carries a [`ValidityToken`]. Invalidating the token bumps its
//! epoch, so anything posted before the invalidation is discarded on delivery
//! even if the mailbox is revived later.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

#[derive(Debug)]
struct TokenState {
    epoch: AtomicU64,
    live: AtomicBool,
}

/// Shared liveness flag for a mailbox's target.
#[derive(Debug, Clone)]
pub struct ValidityToken {
    state: Arc<TokenState>,
}

impl ValidityToken {
    pub fn new() -> Self {
        Self {
            state: Arc::new(TokenState {
                epoch: AtomicU64::new(0),
                live: AtomicBool::new(true),
            }),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.state.epoch.load(Ordering::Acquire)
    }

    pub fn is_live(&self) -> bool {
        self.state.live.load(Ordering::Acquire)
    }

    /// Marks the target torn down; in-flight messages become stale.
    pub fn invalidate(&self) {
        self.state.live.store(false, Ordering::Release);
        self.state.epoch.fetch_add(1, Ordering::AcqRel);
    }

    /// Accepts new messages again. Messages from before the last
    /// invalidation stay stale.
    pub fn revive(&self) {
        self.state.live.store(true, Ordering::Release);
    }

    fn accepts(&self, epoch: u64) -> bool {
        self.is_live() && self.epoch() == epoch
    }
}

impl Default for ValidityToken {
    fn default() -> Self {
        Self::new()
    }
}

struct Envelope<T> {
    epoch: u64,
    message: T,
}

/// Sending half of a mailbox.
pub struct Port<T> {
    name: &'static str,
    sender: Sender<Envelope<T>>,
    token: ValidityToken,
}

impl<T> Clone for Port<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            sender: self.sender.clone(),
            token: self.token.clone(),
        }
    }
}

impl<T> Port<T> {
    /// Queues `message`. Returns `false` when the target is invalidated or
    /// the inbox is gone.
    pub fn post(&self, message: T) -> bool {
        // Epoch first: `invalidate` clears `live` before bumping the epoch, so
        // a post racing it is either refused or stamped stale.
        let epoch = self.token.epoch();
        if !self.token.is_live() {
            tracing::warn!(mailbox = self.name, "dropping message for invalidated target");
            return false;
        }
        let envelope = Envelope { epoch, message };
        if self.sender.send(envelope).is_err() {
            tracing::warn!(mailbox = self.name, "mailbox closed; message dropped");
            return false;
        }
        true
    }

    pub fn token(&self) -> &ValidityToken {
        &self.token
    }
}

/// Receiving half of a mailbox; owned by the target thread.
pub struct Inbox<T> {
    name: &'static str,
    receiver: Receiver<Envelope<T>>,
    token: ValidityToken,
}

impl<T> Inbox<T> {
    pub fn token(&self) -> &ValidityToken {
        &self.token
    }

    pub fn invalidate(&self) {
        self.token.invalidate();
    }

    pub fn revive(&self) {
        self.token.revive();
    }

    fn admit(&self, envelope: Envelope<T>) -> Option<T> {
        if self.token.accepts(envelope.epoch) {
            Some(envelope.message)
        } else {
            tracing::warn!(
                mailbox = self.name,
                posted_epoch = envelope.epoch,
                current_epoch = self.token.epoch(),
                "discarding stale message"
            );
            None
        }
    }

    /// Returns every deliverable message queued right now, in post order.
    pub fn drain(&self) -> Vec<T> {
        self.receiver
            .try_iter()
            .filter_map(|envelope| self.admit(envelope))
            .collect()
    }

    /// Waits up to `timeout` for the next deliverable message.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            match self.receiver.recv_timeout(remaining) {
                Ok(envelope) => {
                    if let Some(message) = self.admit(envelope) {
                        return Some(message);
                    }
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return None
                }
            }
        }
    }
}

/// Creates a mailbox whose messages are only delivered while its token is
/// live and unchanged since posting.
pub fn mailbox<T>(name: &'static str) -> (Port<T>, Inbox<T>) {
    let (sender, receiver) = unbounded();
    let token = ValidityToken::new();
    (
        Port {
            name,
            sender,
            token: token.clone(),
        },
        Inbox {
            name,
            receiver,
            token,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_in_post_order() {
        let (port, inbox) = mailbox::<u32>("test");
        assert!(port.post(1));
        assert!(port.post(2));
        assert_eq!(inbox.drain(), vec![1, 2]);
        assert!(inbox.drain().is_empty());
    }

    #[test]
    fn message_posted_before_invalidation_is_dropped() {
        let (port, inbox) = mailbox::<&str>("ui");
        assert!(port.post("surface ready"));
        inbox.invalidate();
        inbox.revive();
        assert!(inbox.drain().is_empty());
    }

    #[test]
    fn post_to_invalidated_target_is_refused() {
        let (port, inbox) = mailbox::<u8>("ui");
        inbox.invalidate();
        assert!(!port.post(7));
        inbox.revive();
        assert!(port.post(8));
        assert_eq!(inbox.drain(), vec![8]);
    }

    #[test]
    fn post_racing_invalidation_is_never_stamped_current() {
        for _ in 0..500 {
            let (port, inbox) = mailbox::<u32>("ui");
            let poster = std::thread::spawn(move || {
                let mut n = 0;
                while port.post(n) {
                    n += 1;
                }
            });
            while inbox.receiver.is_empty() {
                std::thread::yield_now();
            }
            inbox.invalidate();
            poster.join().unwrap();

            let current = inbox.token.epoch();
            let fresh = inbox
                .receiver
                .try_iter()
                .filter(|envelope| envelope.epoch == current)
                .count();
            assert_eq!(fresh, 0);
        }
    }

    #[test]
    fn recv_timeout_skips_stale_messages() {
        let (port, inbox) = mailbox::<u8>("render");
        port.post(1);
        inbox.invalidate();
        inbox.revive();
        port.post(2);
        assert_eq!(inbox.recv_timeout(Duration::from_millis(50)), Some(2));
        assert_eq!(inbox.recv_timeout(Duration::from_millis(10)), None);
    }
}
