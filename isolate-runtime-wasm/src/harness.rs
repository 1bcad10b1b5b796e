use log::{debug, info, warn};

use crate::backend::EngineContext;
use crate::config::HarnessConfig;
use crate::engine::EngineBackend;
use crate::error::HarnessError;
use crate::executor::ExecutionEngineAdapter;
use crate::limits;
use crate::report::{ExecutionReport, ReportBuilder};
use crate::transport::{BinarySource, BinaryTransport, ExecutionRequest};

pub const PROBE_RESPONSE: &str = "Advanced Native Bridge Operational";

/// Confirms the harness is linked in and callable.
pub fn probe() -> &'static str {
    PROBE_RESPONSE
}

/// Applies the CPU-time ceiling. The memory budget is advisory only and is
/// enforced per instance, never through `RLIMIT_AS`.
pub fn apply_resource_limits(memory_budget_bytes: u64, cpu_time_seconds: u64) -> bool {
    debug!("Advisory memory budget: {} bytes", memory_budget_bytes);
    match limits::apply(cpu_time_seconds) {
        Ok(()) => true,
        Err(e) => {
            warn!("Continuing without resource limits: {}", e);
            false
        }
    }
}

/// Front door of the runtime: request in, report out.
pub struct Harness<'c, B: EngineBackend> {
    backend: &'c B,
    config: HarnessConfig,
    transport: BinaryTransport,
    reports: ReportBuilder,
}

impl Harness<'static, EngineContext> {
    /// A harness over the process-wide engine context.
    pub fn shared(config: HarnessConfig) -> Result<Self, String> {
        let context = EngineContext::init(&config)?;
        Ok(Self::new(context, config))
    }
}

impl<'c, B: EngineBackend> Harness<'c, B> {
    pub fn new(backend: &'c B, config: HarnessConfig) -> Self {
        Self {
            backend,
            transport: BinaryTransport::from_config(&config),
            reports: ReportBuilder::new(config.report_title.clone()),
            config,
        }
    }

    /// Resolves, runs and reports one request. Only transport problems are
    /// returned as errors; engine failures are part of the report.
    pub fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionReport, HarnessError> {
        let outcome = self.transport.resolve(request)?;
        let strategy = outcome.strategy();

        let bytes = outcome.bytes();
        debug!(
            "WASM header: {:02x?} ({} bytes via {})",
            &bytes[..bytes.len().min(8)],
            bytes.len(),
            strategy
        );

        let result = ExecutionEngineAdapter::with_config(self.backend, &self.config)
            .run(bytes, request.memory_budget_mb());
        let released = outcome.release();
        debug!("Transport buffer released ({:?})", released);

        info!("Execution finished: {}", result.status);
        Ok(self.reports.build(&result, Some(strategy)))
    }

    /// Runs bytes handed over directly by the host.
    pub fn execute_direct(&self, binary: Vec<u8>, declared_size: usize, memory_budget_mb: u32) -> String {
        self.render(&ExecutionRequest::direct(binary, declared_size, memory_budget_mb))
    }

    /// Runs bytes that live behind a shared-memory region or descriptor.
    pub fn execute_via_transport(
        &self,
        source: BinarySource,
        declared_size: usize,
        memory_budget_mb: u32,
    ) -> String {
        self.render(&ExecutionRequest::new(source, declared_size, memory_budget_mb))
    }

    fn render(&self, request: &ExecutionRequest) -> String {
        match self.execute(request) {
            Ok(report) => report.into_string(),
            Err(e) => {
                warn!("Request rejected: {}", e);
                e.to_report_text()
            }
        }
    }
}
