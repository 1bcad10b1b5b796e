//! Guest output through WASI. Kept in its own test binary so nothing else
//! writes to stdout while the capture is active.

use isolate_runtime_wasm::{EngineContext, Harness, HarnessConfig};

const HELLO: &str = r#"
(module
  (import "wasi_snapshot_preview1" "fd_write"
    (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 16) "hi")
  (func (export "main") (result i32)
    (i32.store (i32.const 0) (i32.const 16))
    (i32.store (i32.const 4) (i32.const 2))
    (drop (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 8)))
    (i32.const 0)))
"#;

#[test]
fn guest_stdout_lands_in_the_report() {
    let config = HarnessConfig::default();
    let ctx = EngineContext::new(&config).unwrap();
    let harness = Harness::new(&ctx, config);
    let binary = wat::parse_str(HELLO).unwrap();

    let report = harness.execute_direct(binary.clone(), binary.len(), 1);

    assert!(report.contains("Status: Executed Successfully"), "{report}");
    assert!(report.contains("WASM Return Code: 0\n"));
    assert!(report.contains("Linear Memory: 65536 bytes"));
    assert!(report.ends_with("Output:\nhi"), "{report}");
}
