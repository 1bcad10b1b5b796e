use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use isolate_protocol::{encode_frame, frame_len, Request, Response};
use log::{debug, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

pub const CONNECT_ATTEMPTS: u32 = 3;
pub const RETRY_DELAY: Duration = Duration::from_millis(500);
const MAX_RESPONSE_BYTES: usize = 64 * 1024 * 1024;

/// Connects to a worker, retrying while it may still be starting up.
pub async fn connect(socket: &Path) -> Result<UnixStream> {
    let mut attempt = 1;
    loop {
        match UnixStream::connect(socket).await {
            Ok(stream) => return Ok(stream),
            Err(e) if attempt < CONNECT_ATTEMPTS => {
                warn!("Connect to {} failed (attempt {}): {}", socket.display(), attempt, e);
                tokio::time::sleep(RETRY_DELAY).await;
                attempt += 1;
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("worker not reachable at {} after {} attempts", socket.display(), attempt)
                })
            }
        }
    }
}

/// One request, one response.
pub async fn send(socket: &Path, req: &Request) -> Result<Response> {
    let mut stream = connect(socket).await?;
    stream.write_all(&encode_frame(req)?).await?;

    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.context("worker closed the connection")?;
    let len = frame_len(len_buf);
    if len > MAX_RESPONSE_BYTES {
        bail!("worker reply of {} bytes exceeds the {} byte limit", len, MAX_RESPONSE_BYTES);
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    debug!("Received {} byte reply", len);

    Ok(serde_json::from_slice(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    #[tokio::test]
    async fn round_trip_against_a_fake_worker() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("worker.sock");
        let listener = UnixListener::bind(&socket).unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut len_buf = [0u8; 4];
            stream.read_exact(&mut len_buf).await.unwrap();
            let mut body = vec![0u8; frame_len(len_buf)];
            stream.read_exact(&mut body).await.unwrap();
            assert_eq!(serde_json::from_slice::<Request>(&body).unwrap(), Request::Ping);
            stream.write_all(&encode_frame(&Response::Pong).unwrap()).await.unwrap();
        });

        assert_eq!(send(&socket, &Request::Ping).await.unwrap(), Response::Pong);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn gives_up_after_three_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let err = connect(&dir.path().join("absent.sock")).await.unwrap_err();
        assert!(format!("{err:#}").contains("after 3 attempts"), "{err:#}");
    }
}
