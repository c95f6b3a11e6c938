//! SessionTrace Correlate - session GUID to trace id side channel
//!
//! Every transformed span produces a [`CorrelationRecord`] mapping the
//! session to the trace it landed in. Records are buffered, deduplicated and
//! written in batches to an InfluxDB v2 compatible store. Writes are
//! best-effort: failures are logged and counted, never retried or escalated.
//!
//! [`CorrelationRecord`]: sessiontrace_core::CorrelationRecord

pub mod backend;
pub mod error;
pub mod line;
pub mod writer;

pub use backend::{CorrelationBackend, InfluxLineBackend};
pub use error::{CorrelationError, CorrelationResult};
pub use line::{line_protocol, Measurements};
pub use writer::{spawn_writer, CorrelationWriter, WriterConfig, WriterHandle};
