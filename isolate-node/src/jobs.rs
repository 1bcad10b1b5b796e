use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use isolate_protocol::{JobArgs, JobResult, Payload};
use isolate_runtime_wasm::{EngineContext, ExecutionRequest, Harness, HarnessConfig};
use log::{error, info};

/// Runs one job to completion on the calling thread. Files opened for the
/// job are closed before this returns, whatever the outcome.
pub fn run_job(context: &EngineContext, config: &HarnessConfig, args: &JobArgs) -> JobResult {
    let request = match build_request(args) {
        Ok(request) => request,
        Err(e) => {
            error!("Rejecting job: {e:#}");
            return JobResult::error(format!("{e:#}"));
        }
    };

    info!(
        "Executing job: {} bytes, {} MB budget",
        request.declared_size(),
        request.memory_budget_mb()
    );
    let harness = Harness::new(context, config.clone());
    let report = match harness.execute(&request) {
        Ok(report) => report.into_string(),
        Err(e) => e.to_report_text(),
    };
    JobResult::success(report, std::process::id())
}

fn build_request(args: &JobArgs) -> Result<ExecutionRequest> {
    let budget = args.config.memory_limit_mb;
    let payload = args.payload().map_err(anyhow::Error::msg)?;
    Ok(match payload {
        Payload::Inline(blob) => ExecutionRequest::direct(blob.to_vec(), args.file_size, budget),
        Payload::SharedMemory(path) => {
            ExecutionRequest::shared_memory(open_readonly(path)?, args.file_size, budget)
        }
        Payload::Descriptor(path) => {
            ExecutionRequest::descriptor(open_readonly(path)?, args.file_size, budget)
        }
    })
}

fn open_readonly(path: &Path) -> Result<File> {
    File::open(path).with_context(|| format!("opening {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use isolate_runtime_wasm::samples;
    use std::io::Write;

    fn setup() -> (EngineContext, HarnessConfig) {
        let config = HarnessConfig { capture_stdout: false, ..Default::default() };
        (EngineContext::new(&config).unwrap(), config)
    }

    fn sample_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&samples::RETURN_42).unwrap();
        file
    }

    #[test]
    fn inline_job_succeeds_with_report() {
        let (ctx, config) = setup();
        let result = run_job(&ctx, &config, &JobArgs::inline(samples::return_42(), 4));

        assert!(result.is_success());
        assert_eq!(result.pid, Some(std::process::id()));
        let report = result.output.unwrap();
        assert!(report.contains("WASM Return Code: 42"), "{report}");
        assert!(report.contains("Strategy: Copy"));
    }

    #[test]
    fn shared_memory_path_is_mapped() {
        let (ctx, config) = setup();
        let file = sample_file();
        let args = JobArgs::shared_memory(file.path(), samples::RETURN_42.len(), 4);

        let report = run_job(&ctx, &config, &args).output.unwrap();
        assert!(report.contains("Transport: Shared Memory (mmap FD)"), "{report}");
        assert!(report.contains("WASM Return Code: 42"));
    }

    #[test]
    fn descriptor_path_without_mmap_is_read() {
        let (ctx, config) = setup();
        let config = HarnessConfig { attempt_mmap: false, ..config };
        let file = sample_file();
        let args = JobArgs::descriptor(file.path(), samples::RETURN_42.len(), 4);

        let report = run_job(&ctx, &config, &args).output.unwrap();
        assert!(report.contains("Transport: File Descriptor (Fallback)"), "{report}");
    }

    #[test]
    fn missing_file_is_a_job_error() {
        let (ctx, config) = setup();
        let args = JobArgs::descriptor("/nonexistent/job.wasm", 37, 4);

        let result = run_job(&ctx, &config, &args);
        assert!(!result.is_success());
        assert!(result.message.unwrap().contains("opening /nonexistent/job.wasm"));
    }

    #[test]
    fn transport_failure_is_still_a_report() {
        let (ctx, config) = setup();
        let file = sample_file();
        let args = JobArgs::descriptor(file.path(), 4096, 4);

        let result = run_job(&ctx, &config, &args);
        assert!(result.is_success());
        assert!(result.output.unwrap().starts_with("Error: Transport Failure"));
    }
}
