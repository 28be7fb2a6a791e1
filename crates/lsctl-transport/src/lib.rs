//! Socket layer for lsctl.
//!
//! - [`InstrumentTransport`]: owns the command socket (port `N`) and the live
//!   socket (port `N + 1`), with an idempotent, reader-aware disconnect
//! - [`CommandReader`]: chunked reads from the command socket for the
//!   background reader
//! - [`connect_stream`]: TCP connect with deadline and error mapping
//!
//! No framing happens here; see `lsctl-protocol`.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use lsctl_core::ConnectionState;
//! use lsctl_transport::InstrumentTransport;
//!
//! # async fn example() -> lsctl_core::Result<()> {
//! let state = Arc::new(tokio::sync::watch::channel(ConnectionState::Disconnected).0);
//! let transport =
//!     InstrumentTransport::connect("192.168.1.50", 53717, Duration::from_secs(5), state).await?;
//! transport.disconnect().await?;
//! # Ok(())
//! # }
//! ```

pub mod dual;
pub mod tcp;

pub use dual::{BoxReader, BoxWriter, CommandReader, InstrumentStreams, InstrumentTransport, LiveStream};
pub use tcp::{DEFAULT_CONNECT_TIMEOUT, connect_stream};
