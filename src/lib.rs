//! Streaming client for a `MakePDF` gRPC service.
//!
//! Records are read from a CSV source, pushed through a bounded request queue
//! onto one bidirectional stream, and every reply is handed to a pool of
//! consumers that persist the returned documents.
//!
//! ```text
//! RecordSource -> RequestProducer -> BoundedRequestQueue -> StreamDriver
//!                                                                |
//!     PersistenceSink <- ResponseConsumerPool <- UnboundedResponseQueue
//! ```

pub mod client;
pub mod common;
pub mod config;
pub mod error;
pub mod message;
pub mod orchestrator;
pub mod persist;
pub mod producer;
pub mod progress;
pub mod queue;
pub mod source;
pub mod state;
pub mod telemetry;
pub mod transport;
pub mod workerpool;
