//! Command dispatch: fire-and-forget and correlated request/response.
//!
//! Whether a call waits is decided by [`CommandRequest::expects_response`],
//! normally filled in from the [`CommandTable`]. Response-expecting calls for
//! the same code run one at a time, since the firmware's reply carries only
//! the code to correlate on. Calls for different codes and fire-and-forget
//! sends never wait on each other beyond the socket write itself.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use lsctl_core::error::{Error, Result};
use lsctl_core::types::{CommandRequest, Message};
use lsctl_protocol::codec;
use lsctl_protocol::table::CommandTable;
use lsctl_transport::InstrumentTransport;

use crate::pending::PendingCalls;

type CodeLocks = Mutex<HashMap<u32, Arc<AsyncMutex<()>>>>;

/// Sends commands over the command socket and correlates replies.
pub struct CommandDispatcher {
    transport: Arc<InstrumentTransport>,
    pending: Arc<PendingCalls>,
    table: Arc<CommandTable>,
    in_flight: CodeLocks,
}

impl CommandDispatcher {
    pub(crate) fn new(
        transport: Arc<InstrumentTransport>,
        pending: Arc<PendingCalls>,
        table: Arc<CommandTable>,
    ) -> Self {
        CommandDispatcher {
            transport,
            pending,
            table,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// The classification table in use.
    pub fn table(&self) -> &CommandTable {
        &self.table
    }

    /// A request for `code`, classified from the table.
    pub fn request(&self, code: u32) -> CommandRequest {
        self.table.request(code)
    }

    /// Send `request`.
    ///
    /// Fire-and-forget requests complete once the frame is written and
    /// return `Ok(None)`. Response-expecting requests set the callback flag,
    /// wait up to `request.timeout` for the reply with the same code, and
    /// return `Ok(Some(reply))`.
    ///
    /// # Errors
    ///
    /// - [`Error::NotConnected`] or [`Error::Connection`] if the socket is
    ///   closed before or while the call is outstanding
    /// - [`Error::CommandTimeout`] if the frame cannot be written or no reply
    ///   arrives within `request.timeout`
    /// - [`Error::ProtocolViolation`] if the reply status marks a rejection
    pub async fn send(&self, request: CommandRequest) -> Result<Option<Message>> {
        let code = request.code;
        let bytes = codec::encode_request(&request);

        if !request.expects_response {
            tracing::debug!(
                code = format!("0x{code:04X}"),
                command = %self.table.name(code),
                bytes = bytes.len(),
                "sending command (no reply expected)"
            );
            self.write(code, &bytes, request.timeout).await?;
            return Ok(None);
        }

        let _turn = self.take_turn(code).await;

        let rx = self.pending.register(code)?;
        tracing::debug!(
            code = format!("0x{code:04X}"),
            command = %self.table.name(code),
            bytes = bytes.len(),
            timeout_ms = request.timeout.as_millis() as u64,
            "sending command"
        );
        let started = tokio::time::Instant::now();
        if let Err(e) = self.write(code, &bytes, request.timeout).await {
            self.pending.remove(code);
            return Err(e);
        }
        let remaining = request.timeout.saturating_sub(started.elapsed());

        match tokio::time::timeout(remaining, rx).await {
            Ok(Ok(Ok(reply))) => {
                if reply.frame.is_rejection() {
                    tracing::warn!(
                        code = format!("0x{code:04X}"),
                        status = format!("0x{:08X}", reply.frame.status),
                        "command rejected by instrument"
                    );
                    return Err(Error::ProtocolViolation {
                        code,
                        status: reply.frame.status,
                    });
                }
                tracing::trace!(
                    code = format!("0x{code:04X}"),
                    payload = reply.payload.len(),
                    "reply received"
                );
                Ok(Some(reply))
            }
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => {
                self.pending.remove(code);
                Err(Error::Connection("reader stopped".into()))
            }
            Err(_) => {
                self.pending.remove(code);
                tracing::warn!(
                    code = format!("0x{code:04X}"),
                    timeout_ms = request.timeout.as_millis() as u64,
                    "command timed out"
                );
                Err(Error::CommandTimeout {
                    code,
                    timeout: request.timeout,
                })
            }
        }
    }

    /// Send `request` and wait for its reply regardless of classification.
    pub async fn query(&self, request: CommandRequest) -> Result<Message> {
        let code = request.code;
        self.send(request.expects_response(true))
            .await?
            .ok_or_else(|| Error::Protocol(format!("no reply for 0x{code:04X}")))
    }

    /// Send `request` without waiting, regardless of classification.
    pub async fn fire(&self, request: CommandRequest) -> Result<()> {
        self.send(request.expects_response(false)).await.map(|_| ())
    }

    /// Send a bare command for `code`, classified from the table.
    pub async fn command(&self, code: u32) -> Result<Option<Message>> {
        self.send(self.request(code)).await
    }

    /// Write one encoded frame, bounded by the request deadline.
    async fn write(&self, code: u32, bytes: &[u8], timeout: std::time::Duration) -> Result<()> {
        match self.transport.send_timeout(bytes, timeout).await {
            Err(Error::WriteTimeout { .. }) => {
                tracing::warn!(
                    code = format!("0x{code:04X}"),
                    timeout_ms = timeout.as_millis() as u64,
                    "command could not be written in time"
                );
                Err(Error::CommandTimeout { code, timeout })
            }
            other => other,
        }
    }

    /// Wait until no other response-expecting call for `code` is running.
    async fn take_turn(&self, code: u32) -> CodeTurn<'_> {
        let lock = {
            let mut in_flight = lock_codes(&self.in_flight);
            Arc::clone(in_flight.entry(code).or_default())
        };
        let mut turn = CodeTurn {
            in_flight: &self.in_flight,
            code,
            lock,
            guard: None,
        };
        turn.guard = Some(Arc::clone(&turn.lock).lock_owned().await);
        turn
    }
}

fn lock_codes(locks: &CodeLocks) -> std::sync::MutexGuard<'_, HashMap<u32, Arc<AsyncMutex<()>>>> {
    locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Exclusive use of one command code. The code's lock entry is removed on
/// drop once nobody else holds or waits on it.
struct CodeTurn<'a> {
    in_flight: &'a CodeLocks,
    code: u32,
    lock: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for CodeTurn<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut in_flight = lock_codes(self.in_flight);
        // Held by the map and by this turn only.
        let idle = Arc::strong_count(&self.lock) == 2
            && in_flight
                .get(&self.code)
                .is_some_and(|entry| Arc::ptr_eq(entry, &self.lock));
        if idle {
            in_flight.remove(&self.code);
        }
    }
}
