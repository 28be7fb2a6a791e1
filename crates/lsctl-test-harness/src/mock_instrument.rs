//! Mock instrument for protocol-level testing.
//!
//! [`MockInstrument`] listens on a command port and the adjacent live port on
//! localhost, accepts one client on each, records every message the client
//! sends, and answers according to per-code rules. Codes without a rule are
//! never answered, which is how an unresponsive instrument is simulated.
//!
//! # Example
//!
//! ```no_run
//! use lsctl_test_harness::MockInstrument;
//!
//! # async fn example() -> lsctl_core::Result<()> {
//! let mock = MockInstrument::start().await?;
//! mock.reply(0x4001);
//! mock.reply_with_payload(0x1009, b"Objective = 10x\n".to_vec());
//! // connect a client to ("127.0.0.1", mock.port()) ...
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use lsctl_core::error::{Error, Result};
use lsctl_core::types::{CALLBACK_FLAG, CALLBACK_SLOT, CommandFrame, FRAME_SIZE, Message};
use lsctl_protocol::codec::{self, Scan};

type Responder = Arc<dyn Fn(&Message) -> Vec<Message> + Send + Sync>;

#[derive(Clone)]
struct Rule {
    delay: Duration,
    respond: Responder,
}

enum Control {
    Write(Vec<u8>),
    WriteSplit {
        first: Vec<u8>,
        rest: Vec<u8>,
        pause: Duration,
    },
    Close,
}

/// Bind a listener on an ephemeral port and a second one on the next port.
///
/// Retries when the adjacent port is taken.
pub async fn bind_port_pair() -> Result<(TcpListener, TcpListener, u16)> {
    for _ in 0..64 {
        let command = TcpListener::bind("127.0.0.1:0").await?;
        let port = command.local_addr()?.port();
        let Some(live_port) = port.checked_add(1) else {
            continue;
        };
        if let Ok(live) = TcpListener::bind(("127.0.0.1", live_port)).await {
            return Ok((command, live, port));
        }
    }
    Err(Error::Connection("no free adjacent port pair".into()))
}

/// Encode a message the way the instrument puts it on the wire.
pub fn encode_message(message: &Message) -> Vec<u8> {
    let mut frame = message.frame.clone();
    frame.additional_len = message.payload.len() as u32;
    let mut buf = BytesMut::with_capacity(FRAME_SIZE + message.payload.len());
    buf.put_slice(&codec::encode(&frame));
    buf.put_slice(&message.payload);
    buf.to_vec()
}

/// The acknowledgement the firmware sends for `request`: the same frame with
/// status 0 and the callback flag cleared.
pub fn ack_for(request: &Message) -> Message {
    let mut frame = request.frame.clone();
    frame.status = 0;
    frame.params[CALLBACK_SLOT] &= !CALLBACK_FLAG;
    frame.additional_len = 0;
    Message::new(frame)
}

/// A scripted instrument on localhost.
pub struct MockInstrument {
    port: u16,
    rules: Arc<Mutex<HashMap<u32, Rule>>>,
    received: Arc<Mutex<Vec<Message>>>,
    control: mpsc::UnboundedSender<Control>,
    task: JoinHandle<()>,
}

impl MockInstrument {
    /// Bind both listeners and start accepting in the background.
    pub async fn start() -> Result<Self> {
        let (command, live, port) = bind_port_pair().await?;
        let rules: Arc<Mutex<HashMap<u32, Rule>>> = Arc::new(Mutex::new(HashMap::new()));
        let received = Arc::new(Mutex::new(Vec::new()));
        let (control, control_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(serve(
            command,
            live,
            Arc::clone(&rules),
            Arc::clone(&received),
            control.clone(),
            control_rx,
        ));

        Ok(MockInstrument {
            port,
            rules,
            received,
            control,
            task,
        })
    }

    /// Command port; the live port is `port() + 1`.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn host(&self) -> &'static str {
        "127.0.0.1"
    }

    /// Answer `code` with a plain acknowledgement.
    pub fn reply(&self, code: u32) {
        self.reply_with(code, |req| vec![ack_for(req)]);
    }

    /// Answer `code` with an acknowledgement carrying `payload`.
    pub fn reply_with_payload(&self, code: u32, payload: impl Into<Bytes>) {
        let payload = payload.into();
        self.reply_with(code, move |req| {
            let mut msg = ack_for(req);
            msg.payload = payload.clone();
            vec![msg]
        });
    }

    /// Answer `code` with a frame whose status marks a rejection.
    pub fn reject(&self, code: u32, status: u32) {
        self.reply_with(code, move |req| {
            let mut msg = ack_for(req);
            msg.frame.status = status;
            vec![msg]
        });
    }

    /// Answer `code` with an acknowledgement after `delay`.
    pub fn reply_after(&self, code: u32, delay: Duration) {
        self.insert_rule(
            code,
            Rule {
                delay,
                respond: Arc::new(|req| vec![ack_for(req)]),
            },
        );
    }

    /// Answer `code` with whatever `respond` returns (possibly nothing).
    pub fn reply_with<F>(&self, code: u32, respond: F)
    where
        F: Fn(&Message) -> Vec<Message> + Send + Sync + 'static,
    {
        self.insert_rule(
            code,
            Rule {
                delay: Duration::ZERO,
                respond: Arc::new(respond),
            },
        );
    }

    /// Stop answering `code`.
    pub fn silence(&self, code: u32) {
        if let Ok(mut rules) = self.rules.lock() {
            rules.remove(&code);
        }
    }

    fn insert_rule(&self, code: u32, rule: Rule) {
        if let Ok(mut rules) = self.rules.lock() {
            rules.insert(code, rule);
        }
    }

    /// Send an unsolicited frame.
    pub fn push(&self, frame: CommandFrame) {
        self.push_message(Message::new(frame));
    }

    /// Send an unsolicited message with payload.
    pub fn push_message(&self, message: Message) {
        let _ = self.control.send(Control::Write(encode_message(&message)));
    }

    /// Write raw bytes to the command socket.
    pub fn push_raw(&self, bytes: Vec<u8>) {
        let _ = self.control.send(Control::Write(bytes));
    }

    /// Write `bytes` in two separate socket writes, split at `at`, with a
    /// pause in between so the client sees two reads.
    pub fn push_split(&self, bytes: Vec<u8>, at: usize, pause: Duration) {
        let at = at.min(bytes.len());
        let (first, rest) = bytes.split_at(at);
        let _ = self.control.send(Control::WriteSplit {
            first: first.to_vec(),
            rest: rest.to_vec(),
            pause,
        });
    }

    /// Close the client connection on both sockets.
    pub fn close(&self) {
        let _ = self.control.send(Control::Close);
    }

    /// Every message received so far, in arrival order.
    pub fn received(&self) -> Vec<Message> {
        self.received.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Codes of every message received so far.
    pub fn received_codes(&self) -> Vec<u32> {
        self.received().iter().map(|m| m.frame.code).collect()
    }

    /// Wait until at least `count` messages with `code` have arrived.
    pub async fn wait_for(&self, code: u32, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let seen = self.received_codes().iter().filter(|&&c| c == code).count();
            if seen >= count {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl Drop for MockInstrument {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    command: TcpListener,
    live: TcpListener,
    rules: Arc<Mutex<HashMap<u32, Rule>>>,
    received: Arc<Mutex<Vec<Message>>>,
    control_tx: mpsc::UnboundedSender<Control>,
    mut control_rx: mpsc::UnboundedReceiver<Control>,
) {
    let Ok((stream, _)) = command.accept().await else {
        return;
    };
    let Ok((_live_stream, _)) = live.accept().await else {
        return;
    };
    tracing::debug!("mock instrument accepted client");

    let (mut reader, mut writer) = stream.into_split();
    let mut buf = BytesMut::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        tokio::select! {
            ctl = control_rx.recv() => match ctl {
                Some(Control::Write(bytes)) => {
                    if writer.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
                Some(Control::WriteSplit { first, rest, pause }) => {
                    if writer.write_all(&first).await.is_err() || writer.flush().await.is_err() {
                        break;
                    }
                    tokio::time::sleep(pause).await;
                    if writer.write_all(&rest).await.is_err() {
                        break;
                    }
                }
                Some(Control::Close) | None => break,
            },

            read = reader.read(&mut chunk) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    while let Scan::Complete { frame, len } = codec::scan(&buf) {
                        let raw = buf.split_to(len);
                        let message = Message {
                            frame,
                            payload: Bytes::copy_from_slice(&raw[FRAME_SIZE..]),
                        };
                        respond(&message, &rules, &control_tx);
                        if let Ok(mut r) = received.lock() {
                            r.push(message);
                        }
                    }
                }
            },
        }
    }

    tracing::debug!("mock instrument closing client connection");
}

fn respond(
    message: &Message,
    rules: &Arc<Mutex<HashMap<u32, Rule>>>,
    control_tx: &mpsc::UnboundedSender<Control>,
) {
    let rule = match rules.lock() {
        Ok(rules) => rules.get(&message.frame.code).cloned(),
        Err(_) => None,
    };
    let Some(rule) = rule else {
        return;
    };

    let bytes: Vec<u8> = (rule.respond)(message)
        .iter()
        .flat_map(encode_message)
        .collect();
    if bytes.is_empty() {
        return;
    }

    if rule.delay.is_zero() {
        let _ = control_tx.send(Control::Write(bytes));
    } else {
        let tx = control_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(rule.delay).await;
            let _ = tx.send(Control::Write(bytes));
        });
    }
}
