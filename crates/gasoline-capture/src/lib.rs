//! In-memory capture engine: bounded buffers for everything the browser
//! extension reports, plus the correlator that turns pull-based extension
//! polling into request/response tool calls.

pub mod alerts;
pub mod circuit;
pub mod correlator;
pub mod error;
pub mod perf;
pub mod persist;
pub mod redact;
pub mod ring;
pub mod store;
pub mod time;
pub mod websocket;

pub use circuit::{Admission, Category, CircuitBreaker, CircuitSnapshot};
pub use correlator::{Correlator, SweepReport};
pub use error::{IngestError, PersistError, QueueError};
pub use perf::PerfDiff;
pub use redact::Redactor;
pub use ring::{BufferCursor, RingBuffer};
pub use store::{CaptureStore, ClearScope, Connectivity, HealthSnapshot, PilotReadiness, StoreConfig};
