use std::fmt;

use crate::error::HarnessError;

/// The capability set the harness needs from a WebAssembly engine.
///
/// Handles are passed back by value for teardown so the caller decides the
/// order: execution environment, then instance, then module.
pub trait EngineBackend {
    type Module;
    type Instance;
    type Function;
    type ExecEnv;

    /// Fails with [`HarnessError::Load`] carrying the engine's message.
    fn load(&self, binary: &[u8]) -> Result<Self::Module, HarnessError>;

    /// Fails with [`HarnessError::Instantiate`] carrying the engine's message.
    fn instantiate(
        &self,
        module: &Self::Module,
        stack_size: usize,
        memory_limit_bytes: usize,
    ) -> Result<Self::Instance, HarnessError>;

    fn lookup_function(&self, instance: &mut Self::Instance, name: &str) -> Option<Self::Function>;

    fn create_exec_env(&self, instance: &mut Self::Instance, stack_size: usize) -> Option<Self::ExecEnv>;

    /// Invokes a zero-argument function. `Ok(None)` means it ran but
    /// produced no i32. Fails with [`HarnessError::Execution`] carrying the
    /// engine's exception text.
    fn call(
        &self,
        env: &mut Self::ExecEnv,
        instance: &mut Self::Instance,
        function: &Self::Function,
    ) -> Result<Option<i32>, HarnessError>;

    /// Current size of the instance's first linear memory, 0 if it has none.
    fn linear_memory_bytes(&self, instance: &mut Self::Instance) -> u64;

    fn destroy_exec_env(&self, instance: &mut Self::Instance, env: Self::ExecEnv);

    fn deinstantiate(&self, instance: Self::Instance);

    fn unload(&self, module: Self::Module);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    ExecutedSuccessfully,
    ExecutionFailed(String),
    LoadedNoEntryPoint,
    LoadFailed(String),
    InstantiateFailed(String),
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExecutedSuccessfully => f.write_str("Executed Successfully"),
            Self::ExecutionFailed(reason) => write!(f, "Execution Failed: {}", reason),
            Self::LoadedNoEntryPoint => f.write_str("Loaded (No Entry Point)"),
            Self::LoadFailed(reason) => write!(f, "Error: Load failed - {}", reason),
            Self::InstantiateFailed(reason) => write!(f, "Error: Instantiate failed - {}", reason),
        }
    }
}

/// What happened to one binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    /// Only ever set alongside [`ExecutionStatus::ExecutedSuccessfully`].
    pub return_code: Option<i32>,
    pub captured_stdout: String,
    pub linear_memory_bytes: u64,
}

impl ExecutionOutcome {
    pub fn new(
        status: ExecutionStatus,
        return_code: Option<i32>,
        captured_stdout: String,
        linear_memory_bytes: u64,
    ) -> Self {
        let return_code = match status {
            ExecutionStatus::ExecutedSuccessfully => return_code,
            _ => None,
        };
        Self { status, return_code, captured_stdout, linear_memory_bytes }
    }

    /// An outcome that never reached an instance.
    pub fn status_only(status: ExecutionStatus) -> Self {
        Self::new(status, None, String::new(), 0)
    }
}
