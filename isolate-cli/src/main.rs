use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use isolate_protocol::{JobArgs, Request, Response, DEFAULT_SOCKET_PATH, INLINE_BLOB_LIMIT};
use isolate_runtime_wasm::{apply_resource_limits, samples, ExecutionRequest, Harness, HarnessConfig};
use log::info;
use tempfile::{Builder, NamedTempFile};

mod client;

const SHM_DIR: &str = "/dev/shm";

#[derive(Parser, Debug)]
#[command(name = "isolate", version, about = "Run untrusted WebAssembly in an isolated harness")]
struct Cli {
    /// Worker socket for remote commands
    #[arg(long, global = true, env = "ISOLATE_SOCKET", default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute a binary in this process and print the report
    Run {
        path: PathBuf,
        #[arg(long, default_value_t = 32)]
        memory_mb: u32,
        #[arg(long, value_enum, default_value = "direct")]
        transport: Transport,
        /// Skip mmap and force the heap-copy fallback
        #[arg(long)]
        no_mmap: bool,
        /// Apply a CPU-time ceiling before running
        #[arg(long)]
        cpu_seconds: Option<u64>,
    },
    /// Send a binary to a worker
    Submit {
        path: PathBuf,
        #[arg(long, default_value_t = 32)]
        memory_mb: u32,
    },
    /// Check the worker's harness is reachable
    Probe,
    Ping,
    /// Stop the worker
    Stop,
    /// Write the "return 42" sample module
    Sample {
        out: PathBuf,
        /// Append a custom section of this many KiB
        #[arg(long, default_value_t = 0)]
        padding_kb: usize,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Transport {
    Direct,
    Shm,
    Fd,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Run { path, memory_mb, transport, no_mmap, cpu_seconds } => {
            if let Some(seconds) = cpu_seconds {
                apply_resource_limits(0, seconds);
            }
            let config = HarnessConfig { attempt_mmap: !no_mmap, ..Default::default() };
            println!("{}", run_local(&path, memory_mb, transport, config)?);
        }
        Command::Submit { path, memory_mb } => {
            let binary = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
            let staged = stage(binary, memory_mb)?;
            let resp = remote(&cli.socket, Request::ExecuteJob(staged.args.clone()))?;
            drop(staged);
            match resp {
                Response::JobResult(result) if result.is_success() => {
                    println!("{}", result.output.unwrap_or_default());
                    if let Some(pid) = result.pid {
                        info!("Executed by worker pid {}", pid);
                    }
                }
                Response::JobResult(result) => bail!("job failed: {}", result.message.unwrap_or_default()),
                other => bail!("unexpected reply: {:?}", other),
            }
        }
        Command::Probe => match remote(&cli.socket, Request::Probe)? {
            Response::Probe(text) => println!("{}", text),
            other => bail!("unexpected reply: {:?}", other),
        },
        Command::Ping => match remote(&cli.socket, Request::Ping)? {
            Response::Pong => println!("pong"),
            other => bail!("unexpected reply: {:?}", other),
        },
        Command::Stop => match remote(&cli.socket, Request::StopJob)? {
            Response::Ack => println!("worker stopping"),
            other => bail!("unexpected reply: {:?}", other),
        },
        Command::Sample { out, padding_kb } => {
            let module = match padding_kb {
                0 => samples::return_42(),
                kb => samples::padded(kb * 1024),
            };
            fs::write(&out, &module).with_context(|| format!("writing {}", out.display()))?;
            println!("wrote {} bytes to {}", module.len(), out.display());
        }
    }
    Ok(())
}

fn run_local(path: &Path, memory_mb: u32, transport: Transport, config: HarnessConfig) -> Result<String> {
    let harness = Harness::shared(config).map_err(|e| anyhow!("engine init failed: {e}"))?;
    let size = fs::metadata(path).with_context(|| format!("reading {}", path.display()))?.len() as usize;

    let request = match transport {
        Transport::Direct => ExecutionRequest::direct(fs::read(path)?, size, memory_mb),
        Transport::Shm => ExecutionRequest::shared_memory(File::open(path)?, size, memory_mb),
        Transport::Fd => ExecutionRequest::descriptor(File::open(path)?, size, memory_mb),
    };
    Ok(match harness.execute(&request) {
        Ok(report) => report.into_string(),
        Err(e) => e.to_report_text(),
    })
}

fn remote(socket: &Path, req: Request) -> Result<Response> {
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    runtime.block_on(client::send(socket, &req))
}

/// A job plus the file backing it, if any. The file is removed on drop.
struct StagedJob {
    args: JobArgs,
    _backing: Option<NamedTempFile>,
}

/// Small binaries travel inline. Larger ones are written to a read-only
/// file, in `/dev/shm` when it exists.
fn stage(binary: Vec<u8>, memory_mb: u32) -> Result<StagedJob> {
    if binary.len() < INLINE_BLOB_LIMIT {
        info!("Using direct transport ({} bytes)", binary.len());
        return Ok(StagedJob { args: JobArgs::inline(binary, memory_mb), _backing: None });
    }

    let shm = Path::new(SHM_DIR);
    let (mut file, via_shm) = if shm.is_dir() {
        (Builder::new().prefix("isolate-").tempfile_in(shm)?, true)
    } else {
        (Builder::new().prefix("isolate-").tempfile()?, false)
    };
    file.write_all(&binary)?;
    file.flush()?;
    let mut perms = file.as_file().metadata()?.permissions();
    perms.set_readonly(true);
    file.as_file().set_permissions(perms)?;

    let args = if via_shm {
        info!("Using shared memory transport ({} bytes) at {}", binary.len(), file.path().display());
        JobArgs::shared_memory(file.path(), binary.len(), memory_mb)
    } else {
        info!("Using descriptor transport ({} bytes) at {}", binary.len(), file.path().display());
        JobArgs::descriptor(file.path(), binary.len(), memory_mb)
    };
    Ok(StagedJob { args, _backing: Some(file) })
}
