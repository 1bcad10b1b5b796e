//! Sandboxed execution of untrusted WebAssembly binaries.
//!
//! A request names where the bytes are ([`transport`]), the harness runs
//! them through an [`engine::EngineBackend`] with stdout captured
//! ([`capture`]) and renders what happened as a plain-text report
//! ([`report`]).

pub mod backend;
pub mod capture;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod harness;
pub mod limits;
pub mod report;
pub mod samples;
pub mod transport;

pub use backend::EngineContext;
pub use config::HarnessConfig;
pub use engine::{EngineBackend, ExecutionOutcome, ExecutionStatus};
pub use error::{HarnessError, TransportError};
pub use harness::{apply_resource_limits, probe, Harness};
pub use report::{ExecutionReport, ReportBuilder};
pub use transport::{BinarySource, BinaryTransport, ExecutionRequest, Strategy};
