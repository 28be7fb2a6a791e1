//! Registry of calls awaiting a correlated reply.
//!
//! The firmware echoes the command code in its reply and carries no sequence
//! number, so the code is the correlation key. The dispatcher serializes
//! response-expecting calls per code, which keeps at most one live entry per
//! key.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;

use lsctl_core::error::{Error, Result};
use lsctl_core::types::Message;

type Slot = oneshot::Sender<Result<Message>>;

#[derive(Default)]
struct Inner {
    calls: HashMap<u32, Slot>,
    closed: Option<String>,
}

/// Pending calls keyed by command code.
///
/// Locked only for map operations, never across an await.
#[derive(Default)]
pub(crate) struct PendingCalls {
    inner: Mutex<Inner>,
}

impl PendingCalls {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a call for `code` and return the receiving end.
    ///
    /// Fails once the registry has been closed by [`fail_all`]. An entry
    /// whose caller has gone away is replaced.
    ///
    /// [`fail_all`]: PendingCalls::fail_all
    pub(crate) fn register(&self, code: u32) -> Result<oneshot::Receiver<Result<Message>>> {
        let mut inner = self.lock();
        if let Some(reason) = &inner.closed {
            return Err(Error::Connection(reason.clone()));
        }
        if inner.calls.get(&code).is_some_and(|slot| !slot.is_closed()) {
            return Err(Error::InvalidState(format!(
                "a call for code 0x{code:04X} is already pending"
            )));
        }

        let (tx, rx) = oneshot::channel();
        inner.calls.insert(code, tx);
        Ok(rx)
    }

    /// Hand `message` to the call waiting on its code.
    ///
    /// Returns the message when nothing matched so the caller can route it
    /// as a notification.
    pub(crate) fn resolve(&self, message: Message) -> Option<Message> {
        let slot = self.lock().calls.remove(&message.code());
        match slot {
            Some(tx) => match tx.send(Ok(message)) {
                Ok(()) => None,
                // The caller timed out between our lookup and the send.
                Err(Ok(message)) => Some(message),
                Err(Err(_)) => None,
            },
            None => Some(message),
        }
    }

    /// Drop the entry for `code`, e.g. after a timeout or a failed write.
    pub(crate) fn remove(&self, code: u32) {
        self.lock().calls.remove(&code);
    }

    /// Fail every pending call with a connection error and refuse new ones.
    pub(crate) fn fail_all(&self, reason: &str) -> usize {
        let calls: Vec<Slot> = {
            let mut inner = self.lock();
            inner.closed.get_or_insert_with(|| reason.to_string());
            inner.calls.drain().map(|(_, tx)| tx).collect()
        };

        let failed = calls.len();
        for tx in calls {
            let _ = tx.send(Err(Error::Connection(reason.to_string())));
        }
        if failed > 0 {
            tracing::debug!(failed, reason, "failed pending calls");
        }
        failed
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().calls.len()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lsctl_core::types::CommandFrame;

    fn message(code: u32) -> Message {
        Message::new(CommandFrame::new(code))
    }

    #[tokio::test]
    async fn resolve_delivers_to_matching_code() {
        let pending = PendingCalls::new();
        let rx = pending.register(0x4001).unwrap();
        assert!(pending.resolve(message(0x4001)).is_none());
        let reply = rx.await.unwrap().unwrap();
        assert_eq!(reply.code(), 0x4001);
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn unmatched_message_is_returned() {
        let pending = PendingCalls::new();
        let _rx = pending.register(0x4001).unwrap();
        let back = pending.resolve(message(0x6010)).unwrap();
        assert_eq!(back.code(), 0x6010);
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn duplicate_live_registration_is_rejected() {
        let pending = PendingCalls::new();
        let _rx = pending.register(0x4001).unwrap();
        assert!(matches!(pending.register(0x4001), Err(Error::InvalidState(_))));
    }

    #[test]
    fn abandoned_registration_is_replaced() {
        let pending = PendingCalls::new();
        drop(pending.register(0x4001).unwrap());
        assert!(pending.register(0x4001).is_ok());
    }

    #[test]
    fn reply_to_abandoned_call_becomes_notification() {
        let pending = PendingCalls::new();
        drop(pending.register(0x4001).unwrap());
        assert!(pending.resolve(message(0x4001)).is_some());
    }

    #[tokio::test]
    async fn fail_all_fails_every_call_and_closes() {
        let pending = PendingCalls::new();
        let a = pending.register(0x4001).unwrap();
        let b = pending.register(0x6008).unwrap();

        assert_eq!(pending.fail_all("closed by instrument"), 2);
        assert!(matches!(a.await.unwrap(), Err(Error::Connection(_))));
        assert!(matches!(b.await.unwrap(), Err(Error::Connection(_))));
        assert!(pending.is_closed());
        assert!(matches!(pending.register(0x4001), Err(Error::Connection(_))));
    }
}
