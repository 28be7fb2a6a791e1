//! Instrument session: one connection with its reader, dispatcher and
//! workflow service.
//!
//! Construct through [`InstrumentBuilder`](crate::builder::InstrumentBuilder).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use lsctl_core::error::{Error, Result};
use lsctl_core::events::InstrumentEvent;
use lsctl_core::types::{CommandRequest, ConnectionState, Message};
use lsctl_protocol::codes::{
    Axis, INT_DATA_SLOT, LASER_ALL_DISABLE, STAGE_POSITION_GET, SYSTEM_STATE_GET,
};
use lsctl_protocol::table::CommandTable;
use lsctl_transport::{InstrumentTransport, LiveStream};

use crate::dispatcher::CommandDispatcher;
use crate::pending::PendingCalls;
use crate::reader::spawn_reader;
use crate::settings::{self, ScopeSettings};
use crate::workflow::WorkflowTransmissionService;

/// How long [`Instrument::disconnect`] waits for the reader task to exit.
const READER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Session options resolved by the builder.
pub(crate) struct SessionOptions {
    pub table: CommandTable,
    pub load_settings: bool,
    pub completion_codes: Vec<u32>,
}

/// A connected instrument.
///
/// Safe to share across tasks behind an `Arc`; every method takes `&self`.
pub struct Instrument {
    transport: Arc<InstrumentTransport>,
    pending: Arc<PendingCalls>,
    dispatcher: Arc<CommandDispatcher>,
    workflow: WorkflowTransmissionService,
    event_tx: broadcast::Sender<InstrumentEvent>,
    state: Arc<watch::Sender<ConnectionState>>,
    settings: Mutex<Option<ScopeSettings>>,
    reader_handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Instrument {
    /// Start the reader on an open transport and run the post-connect
    /// exchange.
    pub(crate) async fn start(
        transport: InstrumentTransport,
        options: SessionOptions,
        event_tx: broadcast::Sender<InstrumentEvent>,
        state: Arc<watch::Sender<ConnectionState>>,
    ) -> Result<Self> {
        let transport = Arc::new(transport);
        let pending = Arc::new(PendingCalls::new());

        let reader_handle = spawn_reader(
            Arc::clone(&transport),
            Arc::clone(&pending),
            event_tx.clone(),
            Arc::clone(&state),
        )
        .ok_or_else(|| Error::InvalidState("command reader already taken".into()))?;

        let dispatcher = Arc::new(CommandDispatcher::new(
            Arc::clone(&transport),
            Arc::clone(&pending),
            Arc::new(options.table),
        ));
        let workflow = WorkflowTransmissionService::new(
            Arc::clone(&dispatcher),
            event_tx.clone(),
            options.completion_codes,
            transport.cancel_token(),
        );

        let instrument = Instrument {
            transport,
            pending,
            dispatcher,
            workflow,
            event_tx,
            state,
            settings: Mutex::new(None),
            reader_handle: tokio::sync::Mutex::new(Some(reader_handle)),
        };

        let _ = instrument.event_tx.send(InstrumentEvent::ConnectionEstablished);
        tracing::info!(addr = %instrument.transport.addr(), "instrument connected");

        if options.load_settings {
            if let Err(e) = instrument.reload_settings().await {
                instrument.teardown().await;
                instrument.state.send_replace(ConnectionState::Error);
                return Err(e);
            }
        }

        Ok(instrument)
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch connection state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Subscribe to session events.
    ///
    /// Each subscriber gets every event sent after it subscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<InstrumentEvent> {
        self.event_tx.subscribe()
    }

    pub fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.dispatcher
    }

    pub fn workflow(&self) -> &WorkflowTransmissionService {
        &self.workflow
    }

    /// Shorthand for [`CommandDispatcher::send`].
    pub async fn send(&self, request: CommandRequest) -> Result<Option<Message>> {
        self.dispatcher.send(request).await
    }

    /// Settings from the last successful retrieval.
    pub fn settings(&self) -> Option<ScopeSettings> {
        self.settings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Retrieve the scope settings again.
    ///
    /// On failure the connection state moves to `Error` and
    /// [`InstrumentEvent::ConnectionError`] is emitted; the sockets stay
    /// open. A later successful reload returns the state to `Ready`.
    pub async fn reload_settings(&self) -> Result<ScopeSettings> {
        match settings::retrieve(&self.dispatcher).await {
            Ok(loaded) => {
                *self
                    .settings
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(loaded.clone());
                self.state.send_if_modified(|s| {
                    if *s == ConnectionState::Error {
                        *s = ConnectionState::Ready;
                        true
                    } else {
                        false
                    }
                });
                let _ = self.event_tx.send(InstrumentEvent::SettingsLoaded);
                Ok(loaded)
            }
            Err(e) => {
                let reason = format!("settings retrieval failed: {e}");
                tracing::error!(addr = %self.transport.addr(), error = %e, "settings retrieval failed");
                self.state.send_if_modified(|s| {
                    if *s == ConnectionState::Ready {
                        *s = ConnectionState::Error;
                        true
                    } else {
                        false
                    }
                });
                let _ = self.event_tx.send(InstrumentEvent::ConnectionError { reason });
                Err(Error::SettingsUnavailable(Box::new(e)))
            }
        }
    }

    /// Position of `axis` in millimetres.
    pub async fn stage_position(&self, axis: Axis) -> Result<f64> {
        let request = self
            .dispatcher
            .request(STAGE_POSITION_GET)
            .param(INT_DATA_SLOT, axis.code());
        let reply = self.dispatcher.query(request).await?;
        Ok(reply.frame.value)
    }

    /// The firmware's system state word.
    pub async fn system_state(&self) -> Result<u32> {
        let reply = self
            .dispatcher
            .query(self.dispatcher.request(SYSTEM_STATE_GET))
            .await?;
        Ok(reply.frame.params[INT_DATA_SLOT])
    }

    /// Switch every laser off.
    pub async fn disable_all_lasers(&self) -> Result<()> {
        self.dispatcher
            .fire(self.dispatcher.request(LASER_ALL_DISABLE))
            .await
    }

    /// Take the live channel socket for image transport. Returns `None`
    /// after the first call or for sessions built without one.
    pub fn take_live_channel(&self) -> Option<Box<dyn LiveStream>> {
        self.transport.take_live()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Close both sockets.
    ///
    /// Pending calls fail immediately with [`Error::Connection`]. Emits
    /// [`InstrumentEvent::Disconnected`] the first time. Safe to call
    /// repeatedly.
    pub async fn disconnect(&self) -> Result<()> {
        let first = self.transport.is_connected();
        self.teardown().await;
        if first {
            tracing::info!(addr = %self.transport.addr(), "instrument disconnected");
            let _ = self.event_tx.send(InstrumentEvent::Disconnected);
        }
        Ok(())
    }

    async fn teardown(&self) {
        if let Err(e) = self.transport.disconnect().await {
            tracing::debug!(error = %e, "transport disconnect failed");
        }
        self.pending.fail_all("disconnected");

        let handle = self.reader_handle.lock().await.take();
        if let Some(handle) = handle {
            if tokio::time::timeout(READER_SHUTDOWN_TIMEOUT, handle).await.is_err() {
                tracing::warn!("command reader did not stop in time");
            }
        }
    }
}

impl Drop for Instrument {
    fn drop(&mut self) {
        self.transport.cancel_token().cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    use bytes::Bytes;
    use lsctl_core::types::{CommandFrame, WorkflowState};
    use lsctl_protocol::codes::*;
    use lsctl_test_harness::{MockInstrument, ack_for, encode_message};

    use crate::builder::InstrumentBuilder;

    const SETTINGS: &[u8] = b"<Optics>\nObjective = 10x\nZoom: 1.25\n";

    async fn mock_with_settings() -> MockInstrument {
        let mock = MockInstrument::start().await.unwrap();
        mock.reply_with_payload(SCOPE_SETTINGS_LOAD, Bytes::from_static(SETTINGS));
        mock
    }

    fn builder_for(mock: &MockInstrument) -> InstrumentBuilder {
        InstrumentBuilder::new()
            .host(mock.host())
            .command_port(mock.port())
            .command_timeout(Duration::from_millis(300))
    }

    #[tokio::test]
    async fn build_loads_settings_and_is_ready() {
        let mock = mock_with_settings().await;
        let (event_tx, mut events) = broadcast::channel(16);

        let instrument = builder_for(&mock)
            .event_channel(event_tx)
            .build()
            .await
            .unwrap();

        assert_eq!(instrument.state(), ConnectionState::Ready);
        let settings = instrument.settings().unwrap();
        assert_eq!(settings.get("Objective"), Some("10x"));
        assert_eq!(settings.get("Zoom"), Some("1.25"));

        assert!(matches!(
            events.recv().await.unwrap(),
            InstrumentEvent::ConnectionEstablished
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            InstrumentEvent::SettingsLoaded
        ));
        assert!(mock.received()[0].frame.callback_requested());
    }

    #[tokio::test]
    async fn settings_failure_fails_build_and_reports() {
        let mock = MockInstrument::start().await.unwrap();
        let (event_tx, mut events) = broadcast::channel(16);

        let result = builder_for(&mock).event_channel(event_tx).build().await;
        match result {
            Err(Error::SettingsUnavailable(inner)) => {
                assert!(matches!(*inner, Error::CommandTimeout { .. }))
            }
            Err(other) => panic!("expected SettingsUnavailable, got {other:?}"),
            Ok(_) => panic!("build should fail without settings"),
        }

        let mut saw_error = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, InstrumentEvent::ConnectionError { .. }) {
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn build_without_settings_skips_exchange() {
        let mock = MockInstrument::start().await.unwrap();
        let instrument = builder_for(&mock).load_settings(false).build().await.unwrap();
        assert_eq!(instrument.state(), ConnectionState::Ready);
        assert!(instrument.settings().is_none());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(mock.received().is_empty());
    }

    #[tokio::test]
    async fn runtime_reload_failure_keeps_sockets_open() {
        let mock = mock_with_settings().await;
        let instrument = builder_for(&mock).build().await.unwrap();
        let mut events = instrument.subscribe();

        mock.silence(SCOPE_SETTINGS_LOAD);
        assert!(matches!(
            instrument.reload_settings().await,
            Err(Error::SettingsUnavailable(_))
        ));
        assert_eq!(instrument.state(), ConnectionState::Error);
        assert!(instrument.is_connected());
        assert!(matches!(
            events.recv().await.unwrap(),
            InstrumentEvent::ConnectionError { .. }
        ));

        mock.reply_with_payload(SCOPE_SETTINGS_LOAD, Bytes::from_static(SETTINGS));
        instrument.reload_settings().await.unwrap();
        assert_eq!(instrument.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn stage_position_reads_reply_value() {
        let mock = mock_with_settings().await;
        mock.reply_with(STAGE_POSITION_GET, |req| {
            let mut reply = ack_for(req);
            reply.frame.value = match req.frame.params[INT_DATA_SLOT] {
                1 => 12.5,
                3 => -0.25,
                _ => 0.0,
            };
            vec![reply]
        });
        let instrument = builder_for(&mock).build().await.unwrap();

        assert_eq!(instrument.stage_position(Axis::X).await.unwrap(), 12.5);
        assert_eq!(instrument.stage_position(Axis::Z).await.unwrap(), -0.25);
    }

    #[tokio::test]
    async fn system_state_reads_int_slot() {
        let mock = mock_with_settings().await;
        mock.reply_with(SYSTEM_STATE_GET, |req| {
            let mut reply = ack_for(req);
            reply.frame.params[INT_DATA_SLOT] = 7;
            vec![reply]
        });
        let instrument = builder_for(&mock).build().await.unwrap();
        assert_eq!(instrument.system_state().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn notifications_reach_subscribers() {
        let mock = mock_with_settings().await;
        let instrument = builder_for(&mock).build().await.unwrap();
        let mut events = instrument.subscribe();

        let mut frame = CommandFrame::new(STAGE_MOTION_STOPPED);
        frame.params[INT_DATA_SLOT] = Axis::Y.code();
        mock.push(frame);

        match tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap()
        {
            InstrumentEvent::Notification(m) => {
                assert_eq!(m.code(), STAGE_MOTION_STOPPED);
                assert_eq!(m.frame.params[INT_DATA_SLOT], 2);
            }
            other => panic!("expected notification, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn workflow_round_trip_through_session() {
        let mock = mock_with_settings().await;
        mock.reply(WORKFLOW_START);
        let instrument = builder_for(&mock).build().await.unwrap();
        let mut events = instrument.subscribe();

        instrument.workflow().execute("<Workflow>\n").await.unwrap();
        mock.push(CommandFrame::new(SYSTEM_STATE_IDLE));

        loop {
            let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
                .await
                .unwrap()
                .unwrap();
            if matches!(event, InstrumentEvent::WorkflowCompleted) {
                break;
            }
        }
        assert_eq!(instrument.workflow().state(), WorkflowState::Completed);
    }

    #[tokio::test]
    async fn custom_completion_code() {
        let mock = mock_with_settings().await;
        mock.reply(WORKFLOW_START);
        let instrument = builder_for(&mock)
            .completion_codes([STAGE_MOTION_STOPPED])
            .build()
            .await
            .unwrap();

        instrument.workflow().execute("run").await.unwrap();
        mock.push(CommandFrame::new(SYSTEM_STATE_IDLE));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(instrument.workflow().state(), WorkflowState::Running);

        mock.push(CommandFrame::new(STAGE_MOTION_STOPPED));
        let mut states = instrument.workflow().watch();
        tokio::time::timeout(
            Duration::from_secs(1),
            states.wait_for(|s| *s == WorkflowState::Completed),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn disable_all_lasers_is_fire_and_forget() {
        let mock = mock_with_settings().await;
        let instrument = builder_for(&mock).build().await.unwrap();

        let start = Instant::now();
        instrument.disable_all_lasers().await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(250));
        assert!(mock.wait_for(LASER_ALL_DISABLE, 1, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_fails_pending() {
        let mock = mock_with_settings().await;
        let instrument = Arc::new(builder_for(&mock).build().await.unwrap());
        let mut events = instrument.subscribe();

        let call = tokio::spawn({
            let instrument = instrument.clone();
            async move {
                instrument
                    .send(CommandRequest::new(LED_ON).expects_response(true).timeout(Duration::from_secs(5)))
                    .await
            }
        });
        assert!(mock.wait_for(LED_ON, 1, Duration::from_secs(1)).await);

        instrument.disconnect().await.unwrap();
        instrument.disconnect().await.unwrap();

        let result = tokio::time::timeout(Duration::from_millis(500), call)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::Connection(_))));
        assert_eq!(instrument.state(), ConnectionState::Disconnected);

        assert!(matches!(events.recv().await.unwrap(), InstrumentEvent::Disconnected));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn peer_close_reports_connection_error() {
        let mock = mock_with_settings().await;
        let instrument = builder_for(&mock).build().await.unwrap();
        let mut events = instrument.subscribe();
        let mut state = instrument.watch_state();

        mock.close();
        match tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap()
        {
            InstrumentEvent::ConnectionError { .. } => {}
            other => panic!("expected ConnectionError, got {other:?}"),
        }
        tokio::time::timeout(
            Duration::from_secs(1),
            state.wait_for(|s| *s == ConnectionState::Disconnected),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(!instrument.is_connected());
    }

    async fn next_event(events: &mut broadcast::Receiver<InstrumentEvent>) -> InstrumentEvent {
        tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("event within 1s")
            .unwrap()
    }

    #[tokio::test]
    async fn reply_split_across_reads_is_decoded_once() {
        let mock = mock_with_settings().await;
        let instrument = Arc::new(builder_for(&mock).build().await.unwrap());
        let mut events = instrument.subscribe();

        let call = tokio::spawn({
            let instrument = instrument.clone();
            async move { instrument.stage_position(Axis::Y).await }
        });
        assert!(mock.wait_for(STAGE_POSITION_GET, 1, Duration::from_secs(1)).await);

        let request = mock.received().pop().unwrap();
        let mut reply = ack_for(&request);
        reply.frame.value = 4.75;
        mock.push_split(encode_message(&reply), 60, Duration::from_millis(30));

        assert_eq!(call.await.unwrap().unwrap(), 4.75);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn garbage_on_the_wire_is_skipped() {
        let mock = mock_with_settings().await;
        let instrument = builder_for(&mock).build().await.unwrap();
        let mut events = instrument.subscribe();

        let mut bytes = b"\x00\xFF\x21\xF3noise".to_vec();
        bytes.extend_from_slice(&encode_message(&Message::new(CommandFrame::new(
            STAGE_MOTION_STOPPED,
        ))));
        mock.push_raw(bytes);
        mock.push(CommandFrame::new(SYSTEM_STATE_IDLE));

        match next_event(&mut events).await {
            InstrumentEvent::Notification(m) => assert_eq!(m.code(), STAGE_MOTION_STOPPED),
            other => panic!("expected notification, got {other:?}"),
        }
        match next_event(&mut events).await {
            InstrumentEvent::Notification(m) => assert_eq!(m.code(), SYSTEM_STATE_IDLE),
            other => panic!("expected notification, got {other:?}"),
        }
        assert!(instrument.is_connected());
    }

    #[tokio::test]
    async fn notification_payload_reaches_subscribers() {
        let mock = mock_with_settings().await;
        let instrument = builder_for(&mock).build().await.unwrap();
        let mut events = instrument.subscribe();

        let mut message = Message::new(CommandFrame::new(SYSTEM_STATE_IDLE));
        message.payload = Bytes::from_static(b"stack 3 of 3 done");
        mock.push_message(message);

        match next_event(&mut events).await {
            InstrumentEvent::Notification(m) => {
                assert_eq!(m.code(), SYSTEM_STATE_IDLE);
                assert_eq!(&m.payload[..], b"stack 3 of 3 done");
            }
            other => panic!("expected notification, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn workflow_fails_when_instrument_drops_connection() {
        let mock = mock_with_settings().await;
        mock.reply(WORKFLOW_START);
        let instrument = builder_for(&mock).build().await.unwrap();

        instrument.workflow().execute("<Workflow>\n").await.unwrap();
        mock.close();

        let mut states = instrument.workflow().watch();
        tokio::time::timeout(
            Duration::from_secs(1),
            states.wait_for(|s| *s == WorkflowState::Failed),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(!instrument.workflow().is_executing());
        assert_eq!(instrument.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn live_channel_handed_out_once() {
        let mock = mock_with_settings().await;
        let instrument = builder_for(&mock).build().await.unwrap();
        assert!(instrument.take_live_channel().is_some());
        assert!(instrument.take_live_channel().is_none());
    }
}
