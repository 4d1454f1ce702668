//! Unix-socket front end. Each line is one JSON frame; each frame gets one
//! JSON line back. The peer's uid is the caller handle.

pub mod client;
pub mod protocol;

use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use crate::api::{Gateway, ResponseEnvelope};
use crate::config::ServerConfig;
use crate::error::ApiError;
use crate::permission::CallerHandle;
use protocol::{ClientFrame, InteractionRequest, InteractionResponse};

/// A bound gateway socket.
pub struct GatewayServer {
    listener: UnixListener,
    gateway: Arc<Gateway>,
    /// Uid allowed to answer interactions: whoever owns the socket.
    owner_uid: u32,
    max_frame: usize,
}

impl GatewayServer {
    /// Bind `socket`, replacing a stale socket file from an earlier run.
    pub fn bind(socket: &Path, gateway: Arc<Gateway>) -> Result<Self> {
        if socket.exists() {
            std::fs::remove_file(socket)
                .with_context(|| format!("failed to remove stale socket {}", socket.display()))?;
        }
        if let Some(parent) = socket.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let listener = UnixListener::bind(socket)
            .with_context(|| format!("failed to bind {}", socket.display()))?;
        // Any local app may connect; who it is comes from its credentials.
        std::fs::set_permissions(socket, std::fs::Permissions::from_mode(0o666))
            .with_context(|| format!("failed to set permissions on {}", socket.display()))?;
        let owner_uid = std::fs::metadata(socket)
            .with_context(|| format!("failed to stat {}", socket.display()))?
            .uid();

        Ok(Self {
            listener,
            gateway,
            owner_uid,
            max_frame: ServerConfig::default().max_frame_bytes,
        })
    }

    /// Disconnect clients whose request line grows past `bytes`.
    pub fn with_max_frame(mut self, bytes: usize) -> Self {
        self.max_frame = bytes;
        self
    }

    /// Accept connections until the listener fails.
    pub async fn run(self) -> Result<()> {
        loop {
            let (stream, _) = self
                .listener
                .accept()
                .await
                .context("failed to accept connection")?;

            let handle = match stream.peer_cred() {
                Ok(cred) => CallerHandle { uid: cred.uid() },
                Err(e) => {
                    tracing::warn!("dropping connection without credentials: {}", e);
                    continue;
                }
            };

            let gateway = Arc::clone(&self.gateway);
            let owner_uid = self.owner_uid;
            let max_frame = self.max_frame;
            tokio::spawn(async move {
                if let Err(e) =
                    handle_connection(stream, handle, gateway, owner_uid, max_frame).await
                {
                    tracing::debug!(uid = handle.uid, "connection ended: {:#}", e);
                }
            });
        }
    }
}

async fn handle_connection(
    stream: UnixStream,
    handle: CallerHandle,
    gateway: Arc<Gateway>,
    owner_uid: u32,
    max_frame: usize,
) -> Result<()> {
    tracing::debug!(uid = handle.uid, "client connected");
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut frame = Vec::new();

    loop {
        frame.clear();
        // One byte past the limit tells an oversized line from one that fits.
        let read = (&mut reader)
            .take(max_frame as u64 + 1)
            .read_until(b'\n', &mut frame)
            .await?;
        if read == 0 {
            return Ok(());
        }
        if frame.last() != Some(&b'\n') && frame.len() > max_frame {
            tracing::warn!(uid = handle.uid, limit = max_frame, "frame too large; disconnecting");
            let reply = error_reply(ApiError::UnsupportedAction("frame too large".to_string()))?;
            writer.write_all(reply.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
            return Ok(());
        }
        if frame.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        let reply = match serde_json::from_slice::<ClientFrame>(&frame) {
            Ok(ClientFrame::Api(request)) => {
                serde_json::to_string(&gateway.execute(&handle, request).await)?
            }
            Ok(ClientFrame::Interaction(request)) => {
                let response = if handle.uid == owner_uid {
                    interact(&gateway, request).await
                } else {
                    tracing::warn!(uid = handle.uid, "interaction from a non-owner refused");
                    InteractionResponse::failed(&ApiError::NotRegistered)
                };
                serde_json::to_string(&response)?
            }
            Err(e) => {
                tracing::debug!(uid = handle.uid, "malformed frame: {}", e);
                error_reply(ApiError::UnsupportedAction("malformed request".to_string()))?
            }
        };

        writer.write_all(reply.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }
}

fn error_reply(err: ApiError) -> Result<String> {
    Ok(serde_json::to_string(&ResponseEnvelope::error(&err))?)
}

async fn interact(gateway: &Gateway, request: InteractionRequest) -> InteractionResponse {
    let outcome = match request {
        InteractionRequest::Describe { token } => {
            gateway.describe(token).map(InteractionResponse::Pending)
        }
        InteractionRequest::Complete { token, input } => gateway
            .complete(token, input.into())
            .await
            .map(|token| InteractionResponse::Completed { token }),
        InteractionRequest::Cancel { token } => Ok(InteractionResponse::Cancelled {
            existed: gateway.cancel(token),
        }),
    };
    outcome.unwrap_or_else(|err| InteractionResponse::failed(&err))
}
