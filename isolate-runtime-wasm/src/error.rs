use std::io;
use thiserror::Error;

/// Why no byte buffer could be produced for a binary.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no usable source")]
    NoUsableSource,
    #[error("declared size {declared} exceeds the {available} bytes supplied")]
    DeclaredSizeTooLarge { declared: usize, available: usize },
    #[error("mmap & heap allocation both failed ({0} bytes)")]
    AllocationFailed(usize),
    #[error("fallback read truncated after {read} of {declared} bytes")]
    ShortRead { read: usize, declared: usize },
    #[error("fallback read failed: {0}")]
    Io(#[from] io::Error),
}

/// Failure taxonomy of a single harness invocation.
///
/// Engine-reported messages are carried verbatim. Every variant is rendered
/// to text at the entry-point boundary; nothing here is ever raised to the
/// host.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("Transport Failure ({0})")]
    Transport(#[from] TransportError),
    #[error("Load failed - {0}")]
    Load(String),
    #[error("Instantiate failed - {0}")]
    Instantiate(String),
    #[error("Execution Failed: {0}")]
    Execution(String),
    #[error("resource limit rejected: {0}")]
    ResourceLimit(io::Error),
}

impl HarnessError {
    /// The `Error: ...` line a host sees when the harness bails out before a
    /// report could be assembled.
    pub fn to_report_text(&self) -> String {
        format!("Error: {}", self)
    }
}
