//! Connector invocation core.

pub mod container;
pub mod first_error;
pub mod framing;
pub mod process;
pub mod stderr;

pub use container::run_image;
pub use first_error::FirstError;
pub use framing::{LengthDelimited, NdjsonLines, RecordSink, MAX_RECORD_SIZE};
pub use process::run;
pub use stderr::BoundedStderr;
