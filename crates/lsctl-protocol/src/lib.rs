//! Wire protocol for the light-sheet instrument command channel.
//!
//! - **Codec** ([`codec`]) -- encode/decode the fixed 128-byte frame and scan
//!   an accumulation buffer for complete messages.
//! - **Command codes** ([`codes`]) -- firmware command constants and axes.
//! - **Classification table** ([`table`]) -- which commands the firmware
//!   answers, and how long to wait.
//!
//! Everything in this crate is pure; sockets live in `lsctl-transport` and the
//! request/response engine in `lsctl`.

pub mod codec;
pub mod codes;
pub mod table;

pub use codec::{END_MARKER, MAX_PAYLOAD_LEN, START_MARKER, Scan, decode, encode, encode_request, scan};
pub use codes::Axis;
pub use table::{CommandSpec, CommandTable};
