//! Asynchronous instrument event types.
//!
//! Events are published through a [`tokio::sync::broadcast`] channel owned by
//! the connection. GUI panels and scan orchestration subscribe to them; the
//! engine never depends on a subscriber being present.

use crate::types::Message;

/// An event emitted by an instrument session.
#[derive(Debug, Clone)]
pub enum InstrumentEvent {
    /// Both sockets are open and the background reader is running.
    ConnectionEstablished,

    /// The connection failed, was lost, or a required post-connect
    /// exchange failed.
    ConnectionError {
        /// Human-readable cause.
        reason: String,
    },

    /// The connection was closed locally.
    Disconnected,

    /// Scope settings were retrieved after connect or on reload.
    SettingsLoaded,

    /// The running workflow finished on the instrument.
    WorkflowCompleted,

    /// Starting or stopping a workflow failed.
    WorkflowFailed {
        /// Human-readable cause.
        reason: String,
    },

    /// An inbound frame that matched no pending call, e.g. a position or
    /// status update.
    Notification(Message),
}
