use log::{debug, info};

use crate::capture;
use crate::config::{HarnessConfig, DEFAULT_STACK_SIZE};
use crate::engine::{EngineBackend, ExecutionOutcome, ExecutionStatus};
use crate::error::HarnessError;

/// Exports probed, in order, for something to run.
pub const ENTRY_POINTS: [&str; 3] = ["main", "run", "_start"];

const MIB: usize = 1024 * 1024;

pub fn memory_limit_bytes(memory_budget_mb: u32) -> usize {
    (memory_budget_mb as usize).saturating_mul(MIB)
}

/// Drives one binary through load, instantiate, entry-point lookup and call,
/// then tears everything down in reverse order whatever happened.
pub struct ExecutionEngineAdapter<'e, B: EngineBackend> {
    backend: &'e B,
    stack_size: usize,
    capture_stdout: bool,
}

impl<'e, B: EngineBackend> ExecutionEngineAdapter<'e, B> {
    pub fn new(backend: &'e B) -> Self {
        Self { backend, stack_size: DEFAULT_STACK_SIZE, capture_stdout: true }
    }

    pub fn with_config(backend: &'e B, config: &HarnessConfig) -> Self {
        Self {
            backend,
            stack_size: config.stack_size_bytes,
            capture_stdout: config.capture_stdout,
        }
    }

    pub fn run(&self, binary: &[u8], memory_budget_mb: u32) -> ExecutionOutcome {
        let backend = self.backend;

        let module = match backend.load(binary) {
            Ok(module) => module,
            Err(e) => return ExecutionOutcome::status_only(ExecutionStatus::LoadFailed(reason(e))),
        };

        let limit = memory_limit_bytes(memory_budget_mb);
        let mut instance = match backend.instantiate(&module, self.stack_size, limit) {
            Ok(instance) => instance,
            Err(e) => {
                backend.unload(module);
                return ExecutionOutcome::status_only(ExecutionStatus::InstantiateFailed(reason(e)));
            }
        };

        let entry = ENTRY_POINTS
            .iter()
            .find_map(|name| backend.lookup_function(&mut instance, name).map(|f| (*name, f)));

        let mut env = backend.create_exec_env(&mut instance, self.stack_size);

        let (status, return_code, captured_stdout) = match (env.as_mut(), entry) {
            (None, _) => (
                ExecutionStatus::ExecutionFailed("execution environment unavailable".into()),
                None,
                String::new(),
            ),
            (Some(_), None) => {
                info!("Module loaded, none of {:?} exported", ENTRY_POINTS);
                (ExecutionStatus::LoadedNoEntryPoint, None, String::new())
            }
            (Some(env), Some((name, function))) => {
                debug!("Invoking entry point `{}`", name);
                let (result, captured) = if self.capture_stdout {
                    capture::capture(|| backend.call(env, &mut instance, &function))
                } else {
                    (backend.call(env, &mut instance, &function), String::new())
                };
                match result {
                    Ok(code) => (ExecutionStatus::ExecutedSuccessfully, code, captured),
                    Err(e) => (ExecutionStatus::ExecutionFailed(reason(e)), None, captured),
                }
            }
        };

        let linear_memory_bytes = backend.linear_memory_bytes(&mut instance);

        if let Some(env) = env {
            backend.destroy_exec_env(&mut instance, env);
        }
        backend.deinstantiate(instance);
        backend.unload(module);

        ExecutionOutcome::new(status, return_code, captured_stdout, linear_memory_bytes)
    }
}

/// The engine's own message, without the harness's framing.
fn reason(err: HarnessError) -> String {
    match err {
        HarnessError::Load(msg)
        | HarnessError::Instantiate(msg)
        | HarnessError::Execution(msg) => msg,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    /// Scripted engine that records every lifecycle call.
    #[derive(Default)]
    struct Scripted {
        fail_load: bool,
        fail_instantiate: bool,
        fail_env: bool,
        exports: Vec<&'static str>,
        call_result: Option<Result<Option<i32>, String>>,
        events: RefCell<Vec<String>>,
    }

    impl Scripted {
        fn log(&self, event: impl Into<String>) {
            self.events.borrow_mut().push(event.into());
        }

        fn events(&self) -> Vec<String> {
            self.events.borrow().clone()
        }
    }

    impl EngineBackend for Scripted {
        type Module = ();
        type Instance = ();
        type Function = &'static str;
        type ExecEnv = ();

        fn load(&self, _binary: &[u8]) -> Result<(), HarnessError> {
            self.log("load");
            if self.fail_load {
                return Err(HarnessError::Load("magic header not detected".into()));
            }
            Ok(())
        }

        fn instantiate(&self, _: &(), stack_size: usize, limit: usize) -> Result<(), HarnessError> {
            self.log(format!("instantiate stack={} limit={}", stack_size, limit));
            if self.fail_instantiate {
                return Err(HarnessError::Instantiate("memory limit exceeded".into()));
            }
            Ok(())
        }

        fn lookup_function(&self, _: &mut (), name: &str) -> Option<&'static str> {
            self.log(format!("lookup {}", name));
            self.exports.iter().copied().find(|export| *export == name)
        }

        fn create_exec_env(&self, _: &mut (), stack_size: usize) -> Option<()> {
            self.log(format!("create_env {}", stack_size));
            (!self.fail_env).then_some(())
        }

        fn call(&self, _: &mut (), _: &mut (), function: &&'static str) -> Result<Option<i32>, HarnessError> {
            self.log(format!("call {}", function));
            match self.call_result.clone().unwrap_or(Ok(Some(0))) {
                Ok(code) => Ok(code),
                Err(msg) => Err(HarnessError::Execution(msg)),
            }
        }

        fn linear_memory_bytes(&self, _: &mut ()) -> u64 {
            self.log("memory");
            131072
        }

        fn destroy_exec_env(&self, _: &mut (), _: ()) {
            self.log("destroy_env");
        }

        fn deinstantiate(&self, _: ()) {
            self.log("deinstantiate");
        }

        fn unload(&self, _: ()) {
            self.log("unload");
        }
    }

    fn teardown_tail(events: &[String]) -> Vec<&str> {
        events.iter().rev().take(3).rev().map(String::as_str).collect()
    }

    #[test]
    fn successful_run_tears_down_in_reverse_order() {
        let engine = Scripted { exports: vec!["main"], call_result: Some(Ok(Some(42))), ..Default::default() };
        let outcome = ExecutionEngineAdapter::new(&engine).run(b"bin", 2);

        assert_eq!(outcome.status, ExecutionStatus::ExecutedSuccessfully);
        assert_eq!(outcome.return_code, Some(42));
        assert_eq!(outcome.linear_memory_bytes, 131072);
        let events = engine.events();
        assert_eq!(events[1], "instantiate stack=8192 limit=2097152");
        assert_eq!(teardown_tail(&events), ["destroy_env", "deinstantiate", "unload"]);
        let memory = events.iter().position(|e| e == "memory").unwrap();
        let call = events.iter().position(|e| e == "call main").unwrap();
        assert!(call < memory);
    }

    #[test]
    fn entry_points_are_probed_in_priority_order() {
        let engine = Scripted { exports: vec!["_start", "run"], ..Default::default() };
        ExecutionEngineAdapter::new(&engine).run(b"bin", 1);

        let events = engine.events();
        assert!(events.contains(&"lookup main".to_string()));
        assert!(events.contains(&"call run".to_string()));
        assert!(!events.contains(&"lookup _start".to_string()));
    }

    #[test]
    fn missing_entry_point_is_a_terminal_state() {
        let engine = Scripted::default();
        let outcome = ExecutionEngineAdapter::new(&engine).run(b"bin", 1);

        assert_eq!(outcome.status, ExecutionStatus::LoadedNoEntryPoint);
        assert_eq!(outcome.return_code, None);
        assert_eq!(teardown_tail(&engine.events()), ["destroy_env", "deinstantiate", "unload"]);
    }

    #[test]
    fn load_failure_touches_nothing_else() {
        let engine = Scripted { fail_load: true, ..Default::default() };
        let outcome = ExecutionEngineAdapter::new(&engine).run(b"junk", 1);

        assert_eq!(outcome.status, ExecutionStatus::LoadFailed("magic header not detected".into()));
        assert_eq!(engine.events(), ["load"]);
    }

    #[test]
    fn instantiate_failure_unloads_the_module() {
        let engine = Scripted { fail_instantiate: true, exports: vec!["main"], ..Default::default() };
        let outcome = ExecutionEngineAdapter::new(&engine).run(b"bin", 0);

        assert_eq!(outcome.status, ExecutionStatus::InstantiateFailed("memory limit exceeded".into()));
        assert_eq!(engine.events(), ["load", "instantiate stack=8192 limit=0", "unload"]);
    }

    #[test]
    fn trap_is_reported_and_still_torn_down() {
        let engine = Scripted {
            exports: vec!["main"],
            call_result: Some(Err("wasm `unreachable` instruction executed".into())),
            ..Default::default()
        };
        let outcome = ExecutionEngineAdapter::new(&engine).run(b"bin", 1);

        assert_eq!(
            outcome.status,
            ExecutionStatus::ExecutionFailed("wasm `unreachable` instruction executed".into())
        );
        assert_eq!(outcome.return_code, None);
        assert_eq!(teardown_tail(&engine.events()), ["destroy_env", "deinstantiate", "unload"]);
    }

    #[test]
    fn missing_exec_env_skips_the_call() {
        let engine = Scripted { fail_env: true, exports: vec!["main"], ..Default::default() };
        let outcome = ExecutionEngineAdapter::new(&engine).run(b"bin", 1);

        assert!(matches!(outcome.status, ExecutionStatus::ExecutionFailed(_)));
        let events = engine.events();
        assert!(!events.iter().any(|e| e.starts_with("call")));
        assert!(!events.contains(&"destroy_env".to_string()));
        assert_eq!(teardown_tail(&events)[1..], ["deinstantiate", "unload"]);
    }

    #[test]
    fn configured_stack_reaches_the_engine() {
        let engine = Scripted::default();
        let config = HarnessConfig { stack_size_bytes: 16 * 1024, capture_stdout: false, ..Default::default() };
        ExecutionEngineAdapter::with_config(&engine, &config).run(b"bin", 1);
        assert!(engine.events().contains(&"create_env 16384".to_string()));
    }

    #[test]
    fn memory_limit_saturates() {
        assert_eq!(memory_limit_bytes(32), 32 * 1024 * 1024);
        assert_eq!(memory_limit_bytes(u32::MAX), (u32::MAX as usize).saturating_mul(MIB));
    }
}
