use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use isolate_protocol::{encode_frame, frame_len, JobResult, Request, Response};
use isolate_runtime_wasm::{apply_resource_limits, probe, EngineContext};
use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixListener;

use crate::config::NodeConfig;
use crate::jobs;

/// What the connection loop does after answering.
#[derive(Debug, PartialEq, Eq)]
enum After {
    Continue,
    Exit,
}

pub async fn run_ipc_server(context: &'static EngineContext, config: NodeConfig) -> Result<()> {
    let listener = bind(&config.socket_path)?;
    info!("IPC server listening on Unix socket: {}", config.socket_path.display());

    let config = Arc::new(config);
    loop {
        let (stream, _) = listener.accept().await?;
        let config = config.clone();

        tokio::spawn(async move {
            let (mut reader, mut writer) = stream.into_split();
            if serve_connection(context, &config, &mut reader, &mut writer).await == After::Exit {
                info!("Stop requested, worker exiting");
                let _ = std::fs::remove_file(&config.socket_path);
                std::process::exit(0);
            }
        });
    }
}

fn bind(socket_path: &Path) -> Result<UnixListener> {
    // A previous worker may have left its socket behind.
    let _ = std::fs::remove_file(socket_path);
    UnixListener::bind(socket_path).with_context(|| format!("binding {}", socket_path.display()))
}

/// Answers framed requests until the peer goes away or asks the worker to
/// stop.
async fn serve_connection<R, W>(
    context: &'static EngineContext,
    config: &NodeConfig,
    reader: &mut R,
    writer: &mut W,
) -> After
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut len_buf = [0u8; 4];
    loop {
        if reader.read_exact(&mut len_buf).await.is_err() {
            return After::Continue;
        }
        let len = frame_len(len_buf);

        if len > config.max_message_bytes {
            error!(
                "IPC client requested {} bytes (limit {}). Dropping connection.",
                len, config.max_message_bytes
            );
            return After::Continue;
        }

        let mut buf = vec![0u8; len];
        if reader.read_exact(&mut buf).await.is_err() {
            return After::Continue;
        }

        let (resp, after) = match serde_json::from_slice::<Request>(&buf) {
            Ok(req) => handle(context, config, req).await,
            Err(e) => {
                warn!("Malformed request: {}", e);
                (Response::Error(format!("malformed request: {e}")), After::Continue)
            }
        };

        let frame = match encode_frame(&resp) {
            Ok(frame) => frame,
            Err(e) => {
                error!("Could not encode response: {}", e);
                return After::Continue;
            }
        };
        if let Err(e) = writer.write_all(&frame).await {
            debug!("Client went away before the reply: {}", e);
            return after;
        }
        let _ = writer.flush().await;

        if after == After::Exit {
            return after;
        }
    }
}

async fn handle(context: &'static EngineContext, config: &NodeConfig, req: Request) -> (Response, After) {
    match req {
        Request::Ping => (Response::Pong, After::Continue),
        Request::Probe => (Response::Probe(probe().to_string()), After::Continue),
        Request::ApplyLimits { memory_limit_bytes, cpu_time_seconds } => {
            let applied = apply_resource_limits(memory_limit_bytes, cpu_time_seconds);
            (Response::LimitsApplied(applied), After::Continue)
        }
        Request::ExecuteJob(args) => {
            let harness_config = config.harness.clone();
            let res = tokio::task::spawn_blocking(move || jobs::run_job(context, &harness_config, &args)).await;
            let result = match res {
                Ok(result) => result,
                Err(e) => JobResult::error(format!("job task failed: {e}")),
            };
            (Response::JobResult(result), After::Continue)
        }
        Request::StopJob => (Response::Ack, After::Exit),
    }
}
