//! lsctl-core: shared types, errors, and events for lsctl.
//!
//! The protocol codec, the transport, and the session engine all depend on
//! this crate; collaborators that only consume events can depend on it alone.
//!
//! # Key types
//!
//! - [`CommandFrame`] / [`Message`] -- the 128-byte wire frame and its payload
//! - [`CommandRequest`] -- a logical command before encoding
//! - [`ConnectionState`] / [`WorkflowState`] -- lifecycle state machines
//! - [`InstrumentEvent`] -- asynchronous notifications
//! - [`Error`] / [`Result`] -- error handling

pub mod error;
pub mod events;
pub mod types;

pub use error::{DecodeError, Error, Marker, Result};
pub use events::InstrumentEvent;
pub use types::*;
