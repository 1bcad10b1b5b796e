use serde::{Deserialize, Serialize};

/// Native stack handed to every instance and its execution environment.
pub const DEFAULT_STACK_SIZE: usize = 8 * 1024;
/// Memory budget used when a job does not name one.
pub const DEFAULT_MEMORY_BUDGET_MB: u32 = 32;
pub const DEFAULT_REPORT_TITLE: &str = "ADVANCED ISOLATED EXECUTION REPORT";

/// Tunables of the execution harness.
///
/// Every field has a default, so a partial JSON document (or `{}`) is a
/// valid configuration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct HarnessConfig {
    pub stack_size_bytes: usize,
    pub default_memory_budget_mb: u32,
    /// Instruction budget per call. `None` leaves execution unmetered.
    pub fuel_limit: Option<u64>,
    /// When false, descriptor sources skip `mmap` and go straight to the
    /// heap-copy fallback.
    pub attempt_mmap: bool,
    pub capture_stdout: bool,
    pub report_title: String,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            stack_size_bytes: DEFAULT_STACK_SIZE,
            default_memory_budget_mb: DEFAULT_MEMORY_BUDGET_MB,
            fuel_limit: None,
            attempt_mmap: true,
            capture_stdout: true,
            report_title: DEFAULT_REPORT_TITLE.to_string(),
        }
    }
}
