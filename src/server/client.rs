use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

use super::protocol::{ClientFrame, InteractionRequest, InteractionResponse};
use crate::api::{ApiRequest, ResponseEnvelope};

/// Line-oriented client for the gateway socket.
pub struct GatewayClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl GatewayClient {
    pub async fn connect(socket: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket).await.with_context(|| {
            format!(
                "cannot connect to {} (is `pgpgate serve` running?)",
                socket.display()
            )
        })?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(reader).lines(),
            writer,
        })
    }

    async fn round_trip<T: DeserializeOwned>(&mut self, frame: &ClientFrame) -> Result<T> {
        let mut line = serde_json::to_string(frame).context("failed to serialize request")?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;

        let Some(reply) = self.lines.next_line().await? else {
            bail!("gateway closed the connection");
        };
        serde_json::from_str(&reply).context("failed to parse gateway reply")
    }

    pub async fn call(&mut self, request: ApiRequest) -> Result<ResponseEnvelope> {
        self.round_trip(&ClientFrame::Api(request)).await
    }

    pub async fn interact(&mut self, request: InteractionRequest) -> Result<InteractionResponse> {
        self.round_trip(&ClientFrame::Interaction(request)).await
    }
}
