//! InstrumentBuilder -- fluent builder for [`Instrument`] sessions.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use lsctl::InstrumentBuilder;
//!
//! # async fn example() -> lsctl::Result<()> {
//! let instrument = InstrumentBuilder::new()
//!     .host("192.168.10.2")
//!     .command_timeout(Duration::from_secs(2))
//!     .build()
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};

use lsctl_core::error::{Error, Result};
use lsctl_core::events::InstrumentEvent;
use lsctl_core::types::ConnectionState;
use lsctl_protocol::codes::SYSTEM_STATE_IDLE;
use lsctl_protocol::table::CommandTable;
use lsctl_transport::{DEFAULT_CONNECT_TIMEOUT, InstrumentStreams, InstrumentTransport};

use crate::instrument::{Instrument, SessionOptions};

/// Default command port; the live port is the next one up.
pub const DEFAULT_COMMAND_PORT: u16 = 53717;

/// Broadcast channel capacity when the builder creates the event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Fluent builder for [`Instrument`].
pub struct InstrumentBuilder {
    host: Option<String>,
    command_port: u16,
    connect_timeout: Duration,
    command_timeout: Option<Duration>,
    table: Option<CommandTable>,
    load_settings: bool,
    completion_codes: Vec<u32>,
    event_tx: Option<broadcast::Sender<InstrumentEvent>>,
}

impl InstrumentBuilder {
    pub fn new() -> Self {
        InstrumentBuilder {
            host: None,
            command_port: DEFAULT_COMMAND_PORT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            command_timeout: None,
            table: None,
            load_settings: true,
            completion_codes: vec![SYSTEM_STATE_IDLE],
            event_tx: None,
        }
    }

    /// Instrument IP address or hostname.
    pub fn host(mut self, host: &str) -> Self {
        self.host = Some(host.to_string());
        self
    }

    /// Command port (default: 53717). The live port is `port + 1`.
    pub fn command_port(mut self, port: u16) -> Self {
        self.command_port = port;
        self
    }

    /// Deadline for opening each socket (default: 5s).
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Reply timeout for commands whose table entry has none of its own.
    ///
    /// Overrides the table's default. Without this, the table's
    /// `default_timeout_ms` applies, or 3s for the canonical table.
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    /// Use `table` instead of the canonical classification table.
    pub fn command_table(mut self, table: CommandTable) -> Self {
        self.table = Some(table);
        self
    }

    /// Retrieve scope settings during build (default: true).
    pub fn load_settings(mut self, enable: bool) -> Self {
        self.load_settings = enable;
        self
    }

    /// Notification codes that mark a running workflow as completed
    /// (default: system idle).
    pub fn completion_codes(mut self, codes: impl IntoIterator<Item = u32>) -> Self {
        self.completion_codes = codes.into_iter().collect();
        self
    }

    /// Publish events on an existing channel, so subscribers see the events
    /// emitted during build.
    pub fn event_channel(mut self, tx: broadcast::Sender<InstrumentEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Connect both sockets and start the session.
    ///
    /// Requires [`host()`](Self::host).
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidParameter`] without a host
    /// - [`Error::Connection`] if either socket cannot be opened
    /// - [`Error::SettingsUnavailable`] if the settings exchange fails; the
    ///   sockets are closed again
    pub async fn build(self) -> Result<Instrument> {
        let host = self.host.clone().ok_or_else(|| {
            Error::InvalidParameter("host is required: call .host() before .build()".into())
        })?;
        let (state, event_tx) = self.channels();

        let transport = match InstrumentTransport::connect(
            &host,
            self.command_port,
            self.connect_timeout,
            Arc::clone(&state),
        )
        .await
        {
            Ok(t) => t,
            Err(e) => {
                let _ = event_tx.send(InstrumentEvent::ConnectionError {
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };

        Instrument::start(transport, self.into_options(), event_tx, state).await
    }

    /// Build a session over pre-connected streams instead of TCP.
    ///
    /// ```no_run
    /// use lsctl::{InstrumentBuilder, InstrumentStreams};
    ///
    /// # async fn example() -> lsctl::Result<()> {
    /// let (client, _server) = tokio::io::duplex(64 * 1024);
    /// let (read, write) = tokio::io::split(client);
    /// let instrument = InstrumentBuilder::new()
    ///     .load_settings(false)
    ///     .build_with_streams(InstrumentStreams {
    ///         command_read: Box::new(read),
    ///         command_write: Box::new(write),
    ///         live: None,
    ///     })
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn build_with_streams(self, streams: InstrumentStreams) -> Result<Instrument> {
        let (state, event_tx) = self.channels();
        let label = self.host.clone().unwrap_or_else(|| "streams".to_string());
        let transport = InstrumentTransport::from_streams(streams, &label, Arc::clone(&state));
        Instrument::start(transport, self.into_options(), event_tx, state).await
    }

    fn channels(
        &self,
    ) -> (
        Arc<watch::Sender<ConnectionState>>,
        broadcast::Sender<InstrumentEvent>,
    ) {
        let state = Arc::new(watch::channel(ConnectionState::Disconnected).0);
        let event_tx = self
            .event_tx
            .clone()
            .unwrap_or_else(|| broadcast::channel(EVENT_CHANNEL_CAPACITY).0);
        (state, event_tx)
    }

    fn into_options(self) -> SessionOptions {
        let mut table = self.table.unwrap_or_default();
        if let Some(timeout) = self.command_timeout {
            table.set_default_timeout(timeout);
        }
        SessionOptions {
            table,
            load_settings: self.load_settings,
            completion_codes: self.completion_codes,
        }
    }
}

impl Default for InstrumentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use lsctl_core::types::{DEFAULT_COMMAND_TIMEOUT, Message};
    use lsctl_protocol::codec::{self, Scan};
    use lsctl_protocol::codes::{LED_ON, SCOPE_SETTINGS_LOAD};
    use lsctl_test_harness::{MockInstrument, ack_for, bind_port_pair, encode_message};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn builder_defaults() {
        let builder = InstrumentBuilder::new();
        assert!(builder.host.is_none());
        assert_eq!(builder.command_port, 53717);
        assert_eq!(builder.connect_timeout, Duration::from_secs(5));
        assert!(builder.command_timeout.is_none());
        assert!(builder.load_settings);
        assert_eq!(builder.completion_codes, vec![SYSTEM_STATE_IDLE]);
        assert!(builder.table.is_none());
    }

    #[test]
    fn builder_custom_settings() {
        let builder = InstrumentBuilder::new()
            .host("10.0.0.42")
            .command_port(6000)
            .connect_timeout(Duration::from_millis(500))
            .command_timeout(Duration::from_millis(750))
            .load_settings(false)
            .completion_codes([0x6010, 0xA002]);
        assert_eq!(builder.host.as_deref(), Some("10.0.0.42"));
        assert_eq!(builder.command_port, 6000);
        assert_eq!(builder.connect_timeout, Duration::from_millis(500));
        assert!(!builder.load_settings);
        assert_eq!(builder.completion_codes, vec![0x6010, 0xA002]);

        let options = builder.into_options();
        assert_eq!(options.table.timeout(LED_ON), Duration::from_millis(750));
    }

    #[test]
    fn default_timeout_comes_from_table_unless_overridden() {
        let table = CommandTable::from_toml_str("default_timeout_ms = 10000").unwrap();
        let options = InstrumentBuilder::new()
            .command_table(table.clone())
            .into_options();
        assert_eq!(options.table.default_timeout(), Duration::from_secs(10));

        let options = InstrumentBuilder::new()
            .command_table(table)
            .command_timeout(Duration::from_millis(500))
            .into_options();
        assert_eq!(options.table.default_timeout(), Duration::from_millis(500));

        let options = InstrumentBuilder::new().into_options();
        assert_eq!(options.table.default_timeout(), DEFAULT_COMMAND_TIMEOUT);
    }

    #[tokio::test]
    async fn build_requires_host() {
        match InstrumentBuilder::new().build().await {
            Err(Error::InvalidParameter(msg)) => assert!(msg.contains("host")),
            Err(other) => panic!("expected InvalidParameter, got {other:?}"),
            Ok(_) => panic!("build without host should fail"),
        }
    }

    #[tokio::test]
    async fn connect_refused_reports_connection_error() {
        let (command, live, port) = bind_port_pair().await.unwrap();
        drop(command);
        drop(live);
        let (event_tx, mut events) = broadcast::channel(4);

        let result = InstrumentBuilder::new()
            .host("127.0.0.1")
            .command_port(port)
            .event_channel(event_tx)
            .build()
            .await;
        assert!(matches!(result, Err(Error::Connection(_))));
        assert!(matches!(
            events.try_recv().unwrap(),
            InstrumentEvent::ConnectionError { .. }
        ));
    }

    #[tokio::test]
    async fn build_connects_to_mock() {
        let mock = MockInstrument::start().await.unwrap();
        mock.reply_with_payload(SCOPE_SETTINGS_LOAD, Bytes::from_static(b"Objective = 4x\n"));

        let instrument = InstrumentBuilder::new()
            .host(mock.host())
            .command_port(mock.port())
            .build()
            .await
            .unwrap();
        assert!(instrument.state().is_ready());
        assert_eq!(instrument.settings().unwrap().get("Objective"), Some("4x"));
        instrument.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn build_with_streams_over_duplex() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let (read, write) = tokio::io::split(client);

        // Answer the settings request and one LED command.
        let server_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            let mut answered = 0;
            while answered < 2 {
                let n = server.read(&mut chunk).await.unwrap();
                assert!(n > 0);
                buf.extend_from_slice(&chunk[..n]);
                while let Scan::Complete { frame, len } = codec::scan(&buf) {
                    buf.drain(..len);
                    let mut reply = ack_for(&Message::new(frame));
                    if reply.code() == SCOPE_SETTINGS_LOAD {
                        reply.payload = Bytes::from_static(b"Zoom = 2\n");
                    }
                    server.write_all(&encode_message(&reply)).await.unwrap();
                    answered += 1;
                }
            }
            server
        });

        let instrument = InstrumentBuilder::new()
            .build_with_streams(InstrumentStreams {
                command_read: Box::new(read),
                command_write: Box::new(write),
                live: None,
            })
            .await
            .unwrap();
        assert_eq!(instrument.settings().unwrap().get("Zoom"), Some("2"));

        let reply = instrument
            .dispatcher()
            .command(LED_ON)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.code(), LED_ON);

        let _server = server_task.await.unwrap();
        assert!(instrument.take_live_channel().is_none());
    }
}
