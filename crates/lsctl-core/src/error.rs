//! Error types for lsctl.
//!
//! All fallible operations across the library return [`Result<T>`], which
//! uses [`Error`] as the error type. Frame decoding failures have their own
//! [`DecodeError`] so the reader can recover from them locally without
//! allocating a full [`Error`].

use std::time::Duration;

/// Which frame marker failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    Start,
    End,
}

impl std::fmt::Display for Marker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Marker::Start => f.write_str("start"),
            Marker::End => f.write_str("end"),
        }
    }
}

/// Failure to decode a 128-byte command frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Fewer than 128 bytes were supplied.
    #[error("truncated frame: {len} bytes available")]
    Truncated { len: usize },

    /// The start or end marker did not match the protocol constant.
    #[error("bad {which} marker: 0x{found:08X}")]
    BadMarker { which: Marker, found: u32 },

    /// The header declares an additional payload above the accepted limit.
    #[error("declared payload of {len} bytes exceeds limit")]
    PayloadTooLarge { len: usize },
}

/// The error type for all lsctl operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A frame could not be decoded (bad marker or truncated buffer).
    #[error("frame decode error: {0}")]
    FrameDecode(#[from] DecodeError),

    /// The connection was refused, could not be established, or was lost.
    ///
    /// Every pending call is resolved with this variant when the command
    /// socket closes.
    #[error("connection error: {0}")]
    Connection(String),

    /// No correlated response arrived before the deadline.
    #[error("command 0x{code:04X} timed out after {}ms", timeout.as_millis())]
    CommandTimeout { code: u32, timeout: Duration },

    /// A frame could not be written to the command socket before the
    /// deadline. If part of it was already written the connection is closed.
    #[error("command socket write did not complete within {}ms", timeout.as_millis())]
    WriteTimeout { timeout: Duration },

    /// The instrument answered, but the reply status reports a rejection.
    #[error("command 0x{code:04X} rejected by instrument (status 0x{status:08X})")]
    ProtocolViolation { code: u32, status: u32 },

    /// Any other semantically unexpected exchange.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A dispatcher error encountered while starting or stopping a workflow.
    #[error("workflow execution failed: {0}")]
    Workflow(Box<Error>),

    /// A workflow is already running; the new request is rejected, not queued.
    #[error("a workflow is already executing")]
    WorkflowBusy,

    /// The operation is not valid in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Both sockets opened but the settings exchange that follows failed.
    #[error("connected, but settings retrieval failed: {0}")]
    SettingsUnavailable(Box<Error>),

    /// No connection to the instrument has been established.
    #[error("not connected")]
    NotConnected,

    /// An invalid parameter was passed to a command.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Configuration data could not be loaded or was rejected.
    #[error("configuration error: {0}")]
    Config(String),

    /// An underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;
