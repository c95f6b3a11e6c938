//! SessionTrace Ingest - TCP listener for the event forwarder
//!
//! Each connection carries newline-delimited JSON records. Frames are parsed
//! and valid events pushed onto the pipeline queue.

pub mod frame;
pub mod listener;

pub use frame::{Frame, FrameReader};
pub use listener::{ListenerConfig, SessionListener};
