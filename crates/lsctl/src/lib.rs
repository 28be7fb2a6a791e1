//! # lsctl -- Light-sheet microscope instrument control
//!
//! `lsctl` is an asynchronous client for the binary command protocol spoken
//! by light-sheet microscope control firmware. It opens the command socket
//! and the adjacent live socket, runs a background reader that routes
//! replies to waiting calls and everything else to subscribers, and offers
//! typed operations on top.
//!
//! ## Quick Start
//!
//! ```no_run
//! use lsctl::{Axis, InstrumentBuilder, InstrumentEvent};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let instrument = InstrumentBuilder::new()
//!         .host("192.168.10.2")
//!         .build()
//!         .await?;
//!
//!     let z = instrument.stage_position(Axis::Z).await?;
//!     println!("Z: {z} mm");
//!
//!     let mut events = instrument.subscribe();
//!     instrument.workflow().execute("<Workflow>\n...").await?;
//!     while let Ok(event) = events.recv().await {
//!         if let InstrumentEvent::WorkflowCompleted = event {
//!             break;
//!         }
//!     }
//!     instrument.disconnect().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! | Crate                | Purpose                                           |
//! |----------------------|---------------------------------------------------|
//! | `lsctl-core`         | Errors, frame and message types, events           |
//! | `lsctl-protocol`     | 128-byte frame codec, command codes, classification table |
//! | `lsctl-transport`    | Command and live sockets                          |
//! | **`lsctl`**          | Reader, dispatcher, workflow service, session     |
//!
//! ## Commands
//!
//! The wire format has no "expects reply" bit, so each code is classified in
//! a [`CommandTable`]. Response-expecting commands wait for the reply
//! carrying the same code, up to a timeout; fire-and-forget commands return
//! as soon as the frame is written. Replies to the same code are serialized,
//! different codes run concurrently.
//!
//! ```no_run
//! # async fn example(instrument: &lsctl::Instrument) -> lsctl::Result<()> {
//! use lsctl::codes::LASER_LEVEL_SET;
//!
//! let request = instrument.dispatcher().request(LASER_LEVEL_SET).param(0, 2).value(35.0);
//! instrument.send(request).await?;
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod dispatcher;
pub mod instrument;
pub(crate) mod pending;
pub(crate) mod reader;
pub mod settings;
pub mod workflow;

pub use builder::{DEFAULT_COMMAND_PORT, InstrumentBuilder};
pub use dispatcher::CommandDispatcher;
pub use instrument::Instrument;
pub use settings::ScopeSettings;
pub use workflow::{MAX_WORKFLOW_LEN, WorkflowTransmissionService};

pub use lsctl_core::{
    CommandFrame, CommandRequest, ConnectionState, DecodeError, Error, InstrumentEvent, Message,
    PARAM_COUNT, Result, WorkflowState,
};
pub use lsctl_protocol::{Axis, CommandSpec, CommandTable, codec, codes};
pub use lsctl_transport::{InstrumentStreams, LiveStream};
