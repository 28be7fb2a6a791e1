//! Background reader for the command socket.
//!
//! One task per connection owns the read half. It accumulates chunks,
//! extracts complete messages (frame plus trailing payload), and routes each
//! one either to the pending call waiting on its code or, failing that, to
//! subscribers as an [`InstrumentEvent::Notification`]. Bytes that do not
//! start a valid frame are discarded one at a time until the stream is back
//! in sync.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use lsctl_core::events::InstrumentEvent;
use lsctl_core::types::{ConnectionState, FRAME_SIZE, Message};
use lsctl_protocol::codec::{self, Scan};
use lsctl_transport::{CommandReader, InstrumentTransport};

use crate::pending::PendingCalls;

/// Size of each socket read.
const READ_CHUNK: usize = 8192;

/// Discarded bytes beyond which resynchronization is logged as persistent.
const PERSISTENT_CORRUPTION: usize = 32 * FRAME_SIZE;

/// Bookkeeping for bytes skipped while looking for a frame boundary.
#[derive(Debug, Default)]
pub(crate) struct Resync {
    discarded: usize,
    reported: bool,
}

impl Resync {
    fn skip(&mut self) {
        self.discarded += 1;
        if self.discarded >= PERSISTENT_CORRUPTION && !self.reported {
            self.reported = true;
            tracing::warn!(
                discarded = self.discarded,
                "persistent frame decode failures on command stream"
            );
        }
    }

    fn found_frame(&mut self) {
        if self.discarded > 0 {
            tracing::debug!(discarded = self.discarded, "resynchronized command stream");
        }
        self.discarded = 0;
        self.reported = false;
    }

    pub(crate) fn discarded(&self) -> usize {
        self.discarded
    }
}

/// Pull every complete message off the front of `buf`.
///
/// Partial frames and partial payloads stay in `buf` for the next read.
pub(crate) fn drain_messages(buf: &mut BytesMut, resync: &mut Resync) -> Vec<Message> {
    let mut messages = Vec::new();
    loop {
        match codec::scan(buf) {
            Scan::Complete { frame, len } => {
                resync.found_frame();
                let mut raw = buf.split_to(len);
                let payload = raw.split_off(FRAME_SIZE).freeze();
                messages.push(Message { frame, payload });
            }
            Scan::Incomplete => break,
            Scan::Corrupt(e) => {
                tracing::trace!(error = %e, "discarding byte before frame boundary");
                let _ = buf.split_to(1);
                resync.skip();
            }
        }
    }
    messages
}

/// Start the reader task for `transport`.
///
/// Returns `None` if the read half was already taken.
pub(crate) fn spawn_reader(
    transport: Arc<InstrumentTransport>,
    pending: Arc<PendingCalls>,
    event_tx: broadcast::Sender<InstrumentEvent>,
    state: Arc<watch::Sender<ConnectionState>>,
) -> Option<JoinHandle<()>> {
    let reader = transport.take_reader()?;
    Some(tokio::spawn(read_loop(reader, transport, pending, event_tx, state)))
}

async fn read_loop(
    mut reader: CommandReader,
    transport: Arc<InstrumentTransport>,
    pending: Arc<PendingCalls>,
    event_tx: broadcast::Sender<InstrumentEvent>,
    state: Arc<watch::Sender<ConnectionState>>,
) {
    let mut buf = BytesMut::with_capacity(READ_CHUNK * 2);
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut resync = Resync::default();

    tracing::debug!(addr = %reader.addr(), "command reader started");

    let err = loop {
        match reader.recv(&mut chunk).await {
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                for message in drain_messages(&mut buf, &mut resync) {
                    route(message, &pending, &event_tx);
                }
            }
            Err(e) => break e,
        }
    };

    // A transport that closed itself over a write fault counts as lost.
    let fault = transport.fault();
    let local = reader.is_cancelled() && fault.is_none();
    let reason = match fault {
        Some(fault) => fault,
        None if local => "disconnected".to_string(),
        None => err.to_string(),
    };
    pending.fail_all(&reason);

    if local {
        tracing::debug!(addr = %reader.addr(), "command reader stopped");
        return;
    }

    tracing::warn!(addr = %reader.addr(), reason = %reason, "command channel lost");
    if let Err(e) = transport.disconnect().await {
        tracing::debug!(error = %e, "transport teardown after peer close failed");
    }
    state.send_replace(ConnectionState::Disconnected);
    let _ = event_tx.send(InstrumentEvent::ConnectionError { reason });
}

fn route(
    message: Message,
    pending: &PendingCalls,
    event_tx: &broadcast::Sender<InstrumentEvent>,
) {
    let code = message.code();
    let Some(message) = pending.resolve(message) else {
        tracing::trace!(code = format!("0x{code:04X}"), "reply delivered to pending call");
        return;
    };

    tracing::debug!(
        code = format!("0x{code:04X}"),
        payload = message.payload.len(),
        "unsolicited message"
    );
    if event_tx.send(InstrumentEvent::Notification(message)).is_err() {
        tracing::trace!(code = format!("0x{code:04X}"), "no subscribers for notification");
    }
}
