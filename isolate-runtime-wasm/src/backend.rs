use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use log::{debug, info, warn};
use wasmtime::{Config, Engine, Func, Instance, Linker, Module, Store, StoreLimits, StoreLimitsBuilder, Trap, Val, ValType};
use wasmtime_wasi::p1::{add_to_linker_sync, WasiP1Ctx};
use wasmtime_wasi::{I32Exit, WasiCtxBuilder};

use crate::config::HarnessConfig;
use crate::engine::EngineBackend;
use crate::error::HarnessError;

static SHARED: OnceLock<Result<EngineContext, String>> = OnceLock::new();
static SHARED_INITIALIZATIONS: AtomicUsize = AtomicUsize::new(0);

/// Per-instance store data: WASI wired to the process's own stdio, plus the
/// linear-memory ceiling.
pub struct HostState {
    wasi: WasiP1Ctx,
    limits: StoreLimits,
}

/// A configured wasmtime engine and WASI linker, reused by every request.
///
/// Build one explicitly with [`EngineContext::new`] or share a process-wide
/// one through [`EngineContext::shared`].
pub struct EngineContext {
    engine: Engine,
    linker: Linker<HostState>,
    stack_size: usize,
    fuel_limit: Option<u64>,
}

impl EngineContext {
    pub fn new(config: &HarnessConfig) -> anyhow::Result<Self> {
        let mut wasm_config = Config::new();
        wasm_config.max_wasm_stack(config.stack_size_bytes);
        if config.fuel_limit.is_some() {
            wasm_config.consume_fuel(true);
        }
        let engine = Engine::new(&wasm_config)
            .map_err(|e| anyhow::anyhow!("failed to create wasm engine: {e}"))?;

        let mut linker = Linker::new(&engine);
        add_to_linker_sync(&mut linker, |state: &mut HostState| &mut state.wasi)
            .map_err(|e| anyhow::anyhow!("failed to link WASI: {e}"))?;

        info!(
            "Wasm engine initialised (stack={} bytes, fuel={:?})",
            config.stack_size_bytes, config.fuel_limit
        );
        Ok(Self {
            engine,
            linker,
            stack_size: config.stack_size_bytes,
            fuel_limit: config.fuel_limit,
        })
    }

    /// The process-wide context, built on first use from `config`. Later
    /// calls return the same context and ignore their argument.
    pub fn init(config: &HarnessConfig) -> Result<&'static EngineContext, String> {
        SHARED
            .get_or_init(|| {
                SHARED_INITIALIZATIONS.fetch_add(1, Ordering::SeqCst);
                EngineContext::new(config).map_err(|e| format!("{e:#}"))
            })
            .as_ref()
            .map_err(Clone::clone)
    }

    /// [`EngineContext::init`] with default settings.
    pub fn shared() -> Result<&'static EngineContext, String> {
        Self::init(&HarnessConfig::default())
    }

    /// How many times the process-wide context has been built.
    pub fn shared_initializations() -> usize {
        SHARED_INITIALIZATIONS.load(Ordering::SeqCst)
    }
}

pub struct WasmtimeInstance {
    store: Store<HostState>,
    instance: Instance,
}

/// Per-call execution budget.
pub struct WasmtimeExecEnv {
    fuel_granted: Option<u64>,
}

impl EngineBackend for EngineContext {
    type Module = Module;
    type Instance = WasmtimeInstance;
    type Function = Func;
    type ExecEnv = WasmtimeExecEnv;

    fn load(&self, binary: &[u8]) -> Result<Module, HarnessError> {
        Module::from_binary(&self.engine, binary).map_err(|e| HarnessError::Load(format!("{e:#}")))
    }

    fn instantiate(
        &self,
        module: &Module,
        stack_size: usize,
        memory_limit_bytes: usize,
    ) -> Result<WasmtimeInstance, HarnessError> {
        if stack_size != self.stack_size {
            // wasmtime fixes the stack ceiling per engine, not per instance.
            debug!("Requested stack {} bytes, engine enforces {}", stack_size, self.stack_size);
        }

        let wasi = WasiCtxBuilder::new().inherit_stdout().inherit_stderr().build_p1();
        let limits = StoreLimitsBuilder::new()
            .memory_size(memory_limit_bytes)
            .instances(1)
            .build();
        let mut store = Store::new(&self.engine, HostState { wasi, limits });
        store.limiter(|state| &mut state.limits);

        let instance = self
            .linker
            .instantiate(&mut store, module)
            .map_err(|e| HarnessError::Instantiate(format!("{e:#}")))?;
        Ok(WasmtimeInstance { store, instance })
    }

    fn lookup_function(&self, instance: &mut WasmtimeInstance, name: &str) -> Option<Func> {
        instance.instance.get_func(&mut instance.store, name)
    }

    fn create_exec_env(&self, instance: &mut WasmtimeInstance, _stack_size: usize) -> Option<WasmtimeExecEnv> {
        if let Some(fuel) = self.fuel_limit {
            if let Err(e) = instance.store.set_fuel(fuel) {
                warn!("Could not arm fuel budget: {e}");
                return None;
            }
        }
        Some(WasmtimeExecEnv { fuel_granted: self.fuel_limit })
    }

    fn call(
        &self,
        _env: &mut WasmtimeExecEnv,
        instance: &mut WasmtimeInstance,
        function: &Func,
    ) -> Result<Option<i32>, HarnessError> {
        let ty = function.ty(&instance.store);
        let params = ty.params().len();
        let results: Vec<ValType> = ty.results().collect();
        let returns_i32 = match results.as_slice() {
            [] => false,
            [ValType::I32] => true,
            _ => {
                return Err(HarnessError::Execution(format!(
                    "entry point returns {} values, expected a single i32",
                    results.len()
                )))
            }
        };
        if params != 0 {
            return Err(HarnessError::Execution(format!(
                "entry point expects {} parameters, called with none",
                params
            )));
        }

        let mut slots = vec![Val::I32(0); results.len()];
        match function.call(&mut instance.store, &[], &mut slots) {
            Ok(()) => Ok(match slots.first() {
                Some(Val::I32(code)) if returns_i32 => Some(*code),
                _ => None,
            }),
            Err(e) => {
                if let Some(exit) = e.downcast_ref::<I32Exit>() {
                    return Ok(Some(exit.0));
                }
                let message = match e.downcast_ref::<Trap>() {
                    Some(trap) => trap.to_string(),
                    None => format!("{e:#}"),
                };
                Err(HarnessError::Execution(if message.is_empty() { "Unknown".into() } else { message }))
            }
        }
    }

    fn linear_memory_bytes(&self, instance: &mut WasmtimeInstance) -> u64 {
        // Only exported memories are reachable through the public API.
        let memory = instance
            .instance
            .exports(&mut instance.store)
            .find_map(|export| export.into_memory());
        memory.map_or(0, |memory| memory.data_size(&instance.store) as u64)
    }

    fn destroy_exec_env(&self, instance: &mut WasmtimeInstance, env: WasmtimeExecEnv) {
        if let Some(granted) = env.fuel_granted {
            let remaining = instance.store.get_fuel().unwrap_or(0);
            debug!("Fuel consumed: {} of {}", granted.saturating_sub(remaining), granted);
        }
    }

    fn deinstantiate(&self, instance: WasmtimeInstance) {
        drop(instance);
    }

    fn unload(&self, module: Module) {
        drop(module);
    }
}
