//! # Simulated Transport
//!
//! In-memory asynchronous channels for exercising the synchronous layer
//! without sockets or processes.
//!
//! ## Purpose
//!
//! - Runs under `cargo test`
//! - Real threads: every endpoint owns an I/O thread, so blocking, wakeups
//!   and cross-thread delivery behave as they do over a real pipe
//! - Fault injection: channel errors, closes and injected traffic on demand
//! - Inspectable: messages the listener forwards are readable from an inbox
//!
//! ## Model
//!
//! [`sim_pipe`] returns two connected [`SimEndpoint`]s. Sending on one
//! endpoint's transport posts the message to the other endpoint's I/O
//! thread, which offers it to the attached [`ipc::ChannelListener`]. Anything
//! the listener does not consume is forwarded to the endpoint's inbox for the
//! listener thread to dispatch.

pub mod io_thread;
pub mod pipe;

pub use io_thread::IoThread;
pub use pipe::{sim_pipe, FaultHandle, FnListener, SimEndpoint};
