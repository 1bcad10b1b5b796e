use std::fmt;

use crate::config::DEFAULT_REPORT_TITLE;
use crate::engine::ExecutionOutcome;
use crate::transport::Strategy;

/// Rendered, read-only execution report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReport {
    text: String,
}

impl ExecutionReport {
    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn into_string(self) -> String {
        self.text
    }
}

impl fmt::Display for ExecutionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Renders outcomes. Pure: no I/O, same input, same text.
#[derive(Debug, Clone)]
pub struct ReportBuilder {
    title: String,
}

impl Default for ReportBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_REPORT_TITLE)
    }
}

impl ReportBuilder {
    pub fn new(title: impl Into<String>) -> Self {
        Self { title: title.into() }
    }

    /// Title, rule, status, optional return code, memory, transport, then
    /// any captured output.
    pub fn build(&self, outcome: &ExecutionOutcome, strategy: Option<Strategy>) -> ExecutionReport {
        let mut lines = vec![
            self.title.clone(),
            "-".repeat(self.title.len() + 2),
            format!("Status: {}", outcome.status),
        ];
        if let Some(code) = outcome.return_code {
            lines.push(format!("WASM Return Code: {}", code));
        }
        lines.push(format!("Linear Memory: {} bytes", outcome.linear_memory_bytes));
        if let Some(strategy) = strategy {
            lines.push(format!("Transport: {}", strategy.transport_name()));
            lines.push(format!("Strategy: {}", strategy.strategy_name()));
        }
        if !outcome.captured_stdout.is_empty() {
            lines.push("Output:".to_string());
            lines.push(outcome.captured_stdout.trim_end_matches('\n').to_string());
        }
        ExecutionReport { text: lines.join("\n") }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ExecutionStatus;

    #[test]
    fn successful_run_has_every_line_in_order() {
        let outcome = ExecutionOutcome::new(ExecutionStatus::ExecutedSuccessfully, Some(42), String::new(), 65536);
        let report = ReportBuilder::default().build(&outcome, Some(Strategy::DirectCopy));

        assert_eq!(
            report.as_str(),
            "ADVANCED ISOLATED EXECUTION REPORT\n\
             ------------------------------------\n\
             Status: Executed Successfully\n\
             WASM Return Code: 42\n\
             Linear Memory: 65536 bytes\n\
             Transport: Direct Byte Array (Hybrid)\n\
             Strategy: Copy"
        );
    }

    #[test]
    fn no_entry_point_has_no_return_code_line() {
        let outcome = ExecutionOutcome::new(ExecutionStatus::LoadedNoEntryPoint, None, String::new(), 0);
        let report = ReportBuilder::default().build(&outcome, Some(Strategy::SharedMemoryMap));
        let text = report.as_str();

        assert!(text.contains("Status: Loaded (No Entry Point)"));
        assert!(!text.contains("WASM Return Code"));
        assert!(text.contains("Linear Memory: 0 bytes"));
        assert!(text.ends_with("Transport: Shared Memory (mmap FD)\nStrategy: NDK/Ashmem"));
    }

    #[test]
    fn negative_return_codes_are_signed() {
        let outcome = ExecutionOutcome::new(ExecutionStatus::ExecutedSuccessfully, Some(-1), String::new(), 0);
        let report = ReportBuilder::default().build(&outcome, None);
        assert!(report.as_str().contains("WASM Return Code: -1\n"));
        assert!(!report.as_str().contains("Transport:"));
    }

    #[test]
    fn captured_output_trails_the_report() {
        let outcome = ExecutionOutcome::new(ExecutionStatus::ExecutedSuccessfully, Some(0), "hi\n".into(), 0);
        let report = ReportBuilder::new("T").build(&outcome, Some(Strategy::SharedMemoryFallbackCopy));
        assert_eq!(
            report.as_str(),
            "T\n---\nStatus: Executed Successfully\nWASM Return Code: 0\nLinear Memory: 0 bytes\n\
             Transport: Shared Memory (Fallback)\nStrategy: Heap Copy\nOutput:\nhi"
        );
    }

    #[test]
    fn building_twice_is_identical() {
        let outcome = ExecutionOutcome::new(ExecutionStatus::ExecutionFailed("Unknown".into()), None, "x".into(), 3);
        let builder = ReportBuilder::default();
        assert_eq!(builder.build(&outcome, None), builder.build(&outcome, None));
    }
}
