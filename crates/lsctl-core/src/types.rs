//! Protocol data model shared by every lsctl crate.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;

/// Size of one command frame on the wire.
pub const FRAME_SIZE: usize = 128;

/// Number of integer parameter slots in a frame.
pub const PARAM_COUNT: usize = 7;

/// Size of the opaque `data` field.
pub const DATA_SIZE: usize = 72;

/// Parameter slot that carries the command data bits, including the
/// request-callback flag.
pub const CALLBACK_SLOT: usize = 6;

/// Bit in [`CALLBACK_SLOT`] asking the instrument to reply.
pub const CALLBACK_FLAG: u32 = 0x8000_0000;

/// Timeout applied to response-expecting commands unless overridden.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(3);

/// One decoded 128-byte frame.
///
/// `additional_len` is the number of raw payload bytes that follow the
/// frame on the stream; the payload itself travels in [`Message`].
#[derive(Debug, Clone, PartialEq)]
pub struct CommandFrame {
    pub code: u32,
    pub status: u32,
    pub params: [u32; PARAM_COUNT],
    pub value: f64,
    pub additional_len: u32,
    pub data: [u8; DATA_SIZE],
}

impl CommandFrame {
    /// A zeroed frame for `code`.
    pub fn new(code: u32) -> Self {
        CommandFrame {
            code,
            status: 0,
            params: [0; PARAM_COUNT],
            value: 0.0,
            additional_len: 0,
            data: [0; DATA_SIZE],
        }
    }

    /// Whether the request-callback flag is set.
    pub fn callback_requested(&self) -> bool {
        self.params[CALLBACK_SLOT] & CALLBACK_FLAG != 0
    }

    /// Whether the status word reports a firmware-side rejection.
    ///
    /// The instrument sets bit 31 of the status word on rejected commands;
    /// every other status value is an acknowledgement.
    pub fn is_rejection(&self) -> bool {
        self.status & 0x8000_0000 != 0
    }

    /// The `data` field up to the first NUL, as lossy UTF-8.
    pub fn data_str(&self) -> String {
        let end = self
            .data
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(DATA_SIZE);
        String::from_utf8_lossy(&self.data[..end]).into_owned()
    }
}

impl Default for CommandFrame {
    fn default() -> Self {
        CommandFrame::new(0)
    }
}

/// A decoded frame plus the additional payload that followed it.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub frame: CommandFrame,
    pub payload: Bytes,
}

impl Message {
    pub fn new(frame: CommandFrame) -> Self {
        Message {
            frame,
            payload: Bytes::new(),
        }
    }

    pub fn code(&self) -> u32 {
        self.frame.code
    }
}

/// A logical command, created per call and discarded after resolution.
///
/// `data` is truncated or zero-padded to 72 bytes at encode time.
/// `payload` is sent verbatim after the frame and its length is written
/// into the frame header.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    pub code: u32,
    pub status: u32,
    pub params: [u32; PARAM_COUNT],
    pub value: f64,
    pub data: Vec<u8>,
    pub payload: Bytes,
    pub expects_response: bool,
    pub timeout: Duration,
}

impl CommandRequest {
    /// A fire-and-forget request with no parameters.
    pub fn new(code: u32) -> Self {
        CommandRequest {
            code,
            status: 0,
            params: [0; PARAM_COUNT],
            value: 0.0,
            data: Vec::new(),
            payload: Bytes::new(),
            expects_response: false,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Set parameter slot `index`. Out-of-range indices are ignored.
    pub fn param(mut self, index: usize, value: u32) -> Self {
        if let Some(slot) = self.params.get_mut(index) {
            *slot = value;
        }
        self
    }

    pub fn value(mut self, value: f64) -> Self {
        self.value = value;
        self
    }

    pub fn data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = data.into();
        self
    }

    pub fn payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn expects_response(mut self, expects: bool) -> Self {
        self.expects_response = expects;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Build the wire frame for this request.
    ///
    /// The callback flag is set for response-expecting requests and the
    /// additional-payload length mirrors `payload`.
    pub fn to_frame(&self) -> CommandFrame {
        let mut frame = CommandFrame::new(self.code);
        frame.status = self.status;
        frame.params = self.params;
        if self.expects_response {
            frame.params[CALLBACK_SLOT] |= CALLBACK_FLAG;
        }
        frame.value = self.value;
        frame.additional_len = self.payload.len() as u32;
        let n = self.data.len().min(DATA_SIZE);
        frame.data[..n].copy_from_slice(&self.data[..n]);
        frame
    }
}

/// Connection lifecycle, driven by the transport and session layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    CommandSocketOpen,
    /// Both sockets open; the session is usable.
    Ready,
    /// Sockets are open but a required exchange after connect failed.
    Error,
}

impl ConnectionState {
    pub fn is_ready(&self) -> bool {
        matches!(self, ConnectionState::Ready)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::CommandSocketOpen => "command socket open",
            ConnectionState::Ready => "ready",
            ConnectionState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Execution state of the acquisition workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkflowState {
    #[default]
    Idle,
    Running,
    Completed,
    Stopped,
    Failed,
}

impl WorkflowState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowState::Completed | WorkflowState::Stopped | WorkflowState::Failed
        )
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkflowState::Idle => "idle",
            WorkflowState::Running => "running",
            WorkflowState::Completed => "completed",
            WorkflowState::Stopped => "stopped",
            WorkflowState::Failed => "failed",
        };
        f.write_str(s)
    }
}
