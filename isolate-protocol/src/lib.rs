use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Where a worker listens unless told otherwise.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/isolate-node.sock";

/// Binaries at or above this size are not sent inline.
pub const INLINE_BLOB_LIMIT: usize = 500 * 1024;

pub const STATUS_SUCCESS: &str = "SUCCESS";
pub const STATUS_ERROR: &str = "ERROR";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Ping,
    /// Confirm the harness is linked in and callable.
    Probe,
    /// Run a binary through the harness.
    ExecuteJob(JobArgs),
    /// Set the worker's CPU ceiling. The memory figure is advisory.
    ApplyLimits {
        memory_limit_bytes: u64,
        cpu_time_seconds: u64,
    },
    /// Stop the worker, and with it whatever it is running.
    StopJob,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Pong,
    Probe(String),
    JobResult(JobResult),
    LimitsApplied(bool),
    Ack,
    Error(String),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct JobResult {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

impl JobResult {
    pub fn success(report: String, pid: u32) -> Self {
        Self {
            status: STATUS_SUCCESS.into(),
            output: Some(report),
            message: None,
            pid: Some(pid),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: STATUS_ERROR.into(),
            output: None,
            message: Some(message.into()),
            pid: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == STATUS_SUCCESS
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct JobConfig {
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: u32,
}

fn default_memory_limit_mb() -> u32 {
    32
}

impl Default for JobConfig {
    fn default() -> Self {
        Self { memory_limit_mb: default_memory_limit_mb() }
    }
}

/// One job. Exactly one of `blob`, `shared_memory` and `descriptor_path`
/// should be set; see [`JobArgs::payload`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct JobArgs {
    pub file_size: usize,
    #[serde(default)]
    pub config: JobConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_memory: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub descriptor_path: Option<PathBuf>,
}

/// How a job's bytes reach the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload<'a> {
    Inline(&'a [u8]),
    SharedMemory(&'a std::path::Path),
    Descriptor(&'a std::path::Path),
}

impl JobArgs {
    pub fn inline(blob: Vec<u8>, memory_limit_mb: u32) -> Self {
        Self {
            file_size: blob.len(),
            config: JobConfig { memory_limit_mb },
            blob: Some(blob),
            ..Default::default()
        }
    }

    pub fn shared_memory(path: impl Into<PathBuf>, file_size: usize, memory_limit_mb: u32) -> Self {
        Self {
            file_size,
            config: JobConfig { memory_limit_mb },
            shared_memory: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn descriptor(path: impl Into<PathBuf>, file_size: usize, memory_limit_mb: u32) -> Self {
        Self {
            file_size,
            config: JobConfig { memory_limit_mb },
            descriptor_path: Some(path.into()),
            ..Default::default()
        }
    }

    /// The single payload source, or an error naming what is wrong.
    pub fn payload(&self) -> Result<Payload<'_>, String> {
        match (&self.blob, &self.shared_memory, &self.descriptor_path) {
            (Some(blob), None, None) => Ok(Payload::Inline(blob)),
            (None, Some(path), None) => Ok(Payload::SharedMemory(path)),
            (None, None, Some(path)) => Ok(Payload::Descriptor(path)),
            (None, None, None) => Err("job carries no binary".into()),
            _ => Err("job carries more than one binary source".into()),
        }
    }
}

/// Length-prefixed framing: a little-endian `u32` byte count, then the JSON
/// body.
pub fn encode_frame<T: Serialize>(message: &T) -> serde_json::Result<Vec<u8>> {
    let body = serde_json::to_vec(message)?;
    let mut frame = Vec::with_capacity(body.len() + 4);
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

pub fn frame_len(prefix: [u8; 4]) -> usize {
    u32::from_le_bytes(prefix) as usize
}
