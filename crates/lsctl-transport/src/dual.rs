//! Command and live channel sockets for one instrument connection.
//!
//! The instrument listens on two adjacent ports: frames on the command port
//! `N`, image data on the live port `N + 1`. [`InstrumentTransport`] opens
//! both, owns them exclusively, and hands the read half of the command
//! socket to exactly one background reader via [`take_reader`].
//!
//! [`take_reader`]: InstrumentTransport::take_reader

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use lsctl_core::error::{Error, Result};
use lsctl_core::types::ConnectionState;

use crate::tcp::{connect_stream, map_io_error};

/// Read half of the command channel.
pub type BoxReader = Box<dyn AsyncRead + Unpin + Send + 'static>;

/// Write half of the command channel.
pub type BoxWriter = Box<dyn AsyncWrite + Unpin + Send + 'static>;

/// Upper bound on each step of [`InstrumentTransport::disconnect`].
const RELEASE_TIMEOUT: Duration = Duration::from_millis(500);

/// A bidirectional stream usable as the live channel.
pub trait LiveStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> LiveStream for T {}

/// Pre-connected streams for building a transport without TCP.
///
/// Pass any `AsyncRead`/`AsyncWrite` pair, for example the halves of a
/// [`tokio::io::duplex()`] in tests.
pub struct InstrumentStreams {
    pub command_read: BoxReader,
    pub command_write: BoxWriter,
    pub live: Option<Box<dyn LiveStream>>,
}

/// Owner of the command and live sockets.
pub struct InstrumentTransport {
    addr: String,
    writer: Mutex<Option<BoxWriter>>,
    reader: std::sync::Mutex<Option<BoxReader>>,
    live: std::sync::Mutex<Option<Box<dyn LiveStream>>>,
    cancel: CancellationToken,
    fault: std::sync::Mutex<Option<String>>,
    state: Arc<watch::Sender<ConnectionState>>,
}

enum WriteOutcome {
    Done(Result<()>),
    /// The deadline passed before the writer lock was free; nothing was sent.
    Queued,
    /// The deadline passed mid-write.
    Stalled,
}

impl InstrumentTransport {
    /// Connect the command socket to `host:command_port`, then the live
    /// socket to `host:command_port + 1`.
    ///
    /// Both must succeed. If the live socket fails, the already-open command
    /// socket is shut down before the error is returned.
    pub async fn connect(
        host: &str,
        command_port: u16,
        timeout: Duration,
        state: Arc<watch::Sender<ConnectionState>>,
    ) -> Result<Self> {
        let live_port = command_port.checked_add(1).ok_or_else(|| {
            Error::InvalidParameter(format!("command port {command_port} leaves no room for live port"))
        })?;
        let command_addr = format!("{host}:{command_port}");
        let live_addr = format!("{host}:{live_port}");

        state.send_replace(ConnectionState::Connecting);

        let command = match connect_stream(&command_addr, timeout).await {
            Ok(s) => s,
            Err(e) => {
                state.send_replace(ConnectionState::Disconnected);
                return Err(e);
            }
        };
        state.send_replace(ConnectionState::CommandSocketOpen);
        tracing::debug!(addr = %command_addr, "Command socket open");

        let live = match connect_stream(&live_addr, timeout).await {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(
                    addr = %live_addr,
                    error = %e,
                    "Live socket failed, closing command socket"
                );
                let mut command = command;
                if let Err(err) = command.shutdown().await {
                    tracing::debug!(error = %err, "Command socket shutdown failed");
                }
                drop(command);
                state.send_replace(ConnectionState::Disconnected);
                return Err(Error::Connection(format!("live channel: {e}")));
            }
        };

        let (read_half, write_half) = command.into_split();
        let transport = InstrumentTransport {
            addr: command_addr,
            writer: Mutex::new(Some(Box::new(write_half))),
            reader: std::sync::Mutex::new(Some(Box::new(read_half))),
            live: std::sync::Mutex::new(Some(Box::new(live))),
            cancel: CancellationToken::new(),
            fault: std::sync::Mutex::new(None),
            state,
        };
        transport.state.send_replace(ConnectionState::Ready);
        tracing::info!(addr = %transport.addr, live = %live_addr, "Instrument sockets connected");
        Ok(transport)
    }

    /// Wrap already-connected streams. The state moves straight to `Ready`.
    pub fn from_streams(
        streams: InstrumentStreams,
        label: &str,
        state: Arc<watch::Sender<ConnectionState>>,
    ) -> Self {
        tracing::debug!(addr = %label, "Wrapping existing instrument streams");
        state.send_replace(ConnectionState::Ready);
        InstrumentTransport {
            addr: label.to_string(),
            writer: Mutex::new(Some(streams.command_write)),
            reader: std::sync::Mutex::new(Some(streams.command_read)),
            live: std::sync::Mutex::new(streams.live),
            cancel: CancellationToken::new(),
            fault: std::sync::Mutex::new(None),
            state,
        }
    }

    /// The command channel address, for logging.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Write raw bytes to the command socket.
    ///
    /// The writer lock is held only for the write and flush, so concurrent
    /// callers interleave whole frames, never partial ones. A disconnect
    /// while the write is blocked returns [`Error::NotConnected`].
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        self.send_inner(data, None).await
    }

    /// Like [`send`](Self::send), giving up after `timeout`.
    ///
    /// Time spent waiting behind another writer counts against the deadline.
    /// If the deadline passes while this frame is going out, the rest of the
    /// stream can no longer be framed: the transport records a fault and
    /// closes itself. Either way the result is [`Error::WriteTimeout`].
    pub async fn send_timeout(&self, data: &[u8], timeout: Duration) -> Result<()> {
        self.send_inner(data, Some(timeout)).await
    }

    async fn send_inner(&self, data: &[u8], timeout: Option<Duration>) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::NotConnected);
        }
        let deadline = timeout.map(|t| Instant::now() + t);

        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Error::NotConnected),
            outcome = self.write_frame(data, deadline) => outcome,
        };

        let timeout = timeout.unwrap_or_default();
        match outcome {
            WriteOutcome::Done(result) => result,
            WriteOutcome::Queued => {
                tracing::warn!(
                    addr = %self.addr,
                    timeout_ms = timeout.as_millis() as u64,
                    "Command socket busy past deadline"
                );
                Err(Error::WriteTimeout { timeout })
            }
            WriteOutcome::Stalled => {
                self.fail(format!(
                    "command socket write stalled for {}ms",
                    timeout.as_millis()
                ))
                .await;
                Err(Error::WriteTimeout { timeout })
            }
        }
    }

    async fn write_frame(&self, data: &[u8], deadline: Option<Instant>) -> WriteOutcome {
        let mut guard = match deadline {
            Some(at) => match tokio::time::timeout_at(at, self.writer.lock()).await {
                Ok(guard) => guard,
                Err(_) => return WriteOutcome::Queued,
            },
            None => self.writer.lock().await,
        };
        let Some(writer) = guard.as_mut() else {
            return WriteOutcome::Done(Err(Error::NotConnected));
        };

        tracing::trace!(addr = %self.addr, bytes = data.len(), "Sending data");

        let io = async {
            writer.write_all(data).await?;
            writer.flush().await?;
            Ok::<_, std::io::Error>(())
        };
        let result = match deadline {
            Some(at) => match tokio::time::timeout_at(at, io).await {
                Ok(result) => result,
                Err(_) => return WriteOutcome::Stalled,
            },
            None => io.await,
        };
        WriteOutcome::Done(result.map_err(|e| {
            tracing::error!(addr = %self.addr, error = %e, "Failed to send data");
            map_io_error(e)
        }))
    }

    /// Close the connection because of a local fault, recording `reason`
    /// for the reader to report.
    async fn fail(&self, reason: String) {
        tracing::error!(addr = %self.addr, reason = %reason, "Closing command channel");
        if let Ok(mut fault) = self.fault.lock() {
            fault.get_or_insert(reason);
        }
        if let Err(e) = self.disconnect().await {
            tracing::debug!(error = %e, "Teardown after write fault failed");
        }
    }

    /// Why the transport closed itself, if it did.
    pub fn fault(&self) -> Option<String> {
        self.fault.lock().ok()?.clone()
    }

    /// Hand out the command socket's read half. Returns `None` after the
    /// first call.
    pub fn take_reader(&self) -> Option<CommandReader> {
        let inner = self.reader.lock().ok()?.take()?;
        Some(CommandReader {
            inner,
            cancel: self.cancel.clone(),
            addr: self.addr.clone(),
        })
    }

    /// Hand out the live channel socket. Pixel transport is handled by the
    /// caller.
    pub fn take_live(&self) -> Option<Box<dyn LiveStream>> {
        self.live.lock().ok()?.take()
    }

    /// Token cancelled on disconnect.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_connected(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Close both sockets.
    ///
    /// Signals the reader first, so a reader blocked in
    /// [`CommandReader::recv`] returns immediately. Safe to call repeatedly.
    pub async fn disconnect(&self) -> Result<()> {
        let first = !self.cancel.is_cancelled();
        self.cancel.cancel();

        // A blocked send drops its guard as soon as it sees the cancellation.
        let writer = match tokio::time::timeout(RELEASE_TIMEOUT, self.writer.lock()).await {
            Ok(mut guard) => guard.take(),
            Err(_) => {
                tracing::warn!(addr = %self.addr, "Command writer still busy, skipping shutdown");
                None
            }
        };
        if let Some(mut writer) = writer {
            match tokio::time::timeout(RELEASE_TIMEOUT, writer.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(
                    addr = %self.addr,
                    error = %e,
                    "Failed to shutdown command socket (continuing anyway)"
                ),
                Err(_) => tracing::debug!(addr = %self.addr, "Command socket shutdown timed out"),
            }
        }

        let live = self.live.lock().ok().and_then(|mut l| l.take());
        if let Some(mut live) = live {
            match tokio::time::timeout(RELEASE_TIMEOUT, live.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!(error = %e, "Failed to shutdown live socket"),
                Err(_) => tracing::debug!("Live socket shutdown timed out"),
            }
        }

        self.state.send_replace(ConnectionState::Disconnected);
        if first {
            tracing::info!(addr = %self.addr, "Instrument sockets closed");
        }
        Ok(())
    }
}

impl Drop for InstrumentTransport {
    fn drop(&mut self) {
        if !self.cancel.is_cancelled() {
            tracing::debug!(addr = %self.addr, "InstrumentTransport dropped, closing connection");
            self.cancel.cancel();
        }
    }
}

/// Chunked reader over the command socket.
///
/// Framing is not done here; callers accumulate chunks themselves.
pub struct CommandReader {
    inner: BoxReader,
    cancel: CancellationToken,
    addr: String,
}

impl CommandReader {
    /// Read whatever bytes are available into `buf`.
    ///
    /// Returns [`Error::Connection`] when the peer closes the socket, when
    /// the read fails, or when the transport is disconnected locally.
    pub async fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        tokio::select! {
            biased;

            _ = self.cancel.cancelled() => {
                Err(Error::Connection("disconnected".into()))
            }

            result = self.inner.read(buf) => match result {
                Ok(0) => {
                    tracing::warn!(addr = %self.addr, "Peer closed connection (0 bytes read)");
                    Err(Error::Connection("closed by instrument".into()))
                }
                Ok(n) => {
                    tracing::trace!(addr = %self.addr, bytes = n, "Received data");
                    Ok(n)
                }
                Err(e) => {
                    tracing::error!(addr = %self.addr, error = %e, "Failed to receive data");
                    Err(map_io_error(e))
                }
            },
        }
    }

    /// Whether the owning transport has been disconnected.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}
