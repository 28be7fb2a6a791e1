//! lsctl-test-harness: mock instrument and helpers for testing lsctl
//! without hardware.
//!
//! [`MockInstrument`] speaks the real frame protocol over loopback TCP on an
//! adjacent command/live port pair.

pub mod mock_instrument;

pub use mock_instrument::{MockInstrument, ack_for, bind_port_pair, encode_message};
