//! Minimal QMP client: one connection per request, capabilities negotiated
//! on connect, asynchronous events skipped while waiting for a reply.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tracing::debug;

use crate::engine::EngineError;

#[derive(Debug, Deserialize)]
struct QmpErrorBody {
    class: String,
    desc: String,
}

#[derive(Debug, Deserialize)]
struct QmpMessage {
    #[serde(rename = "QMP")]
    greeting: Option<Value>,
    #[serde(rename = "return")]
    ret: Option<Value>,
    error: Option<QmpErrorBody>,
    event: Option<String>,
}

struct QmpClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

fn monitor<E: std::fmt::Display>(e: E) -> EngineError {
    EngineError::Monitor(e.to_string())
}

impl QmpClient {
    async fn handshake(socket: &Path) -> Result<Self, EngineError> {
        let stream = UnixStream::connect(socket).await.map_err(monitor)?;
        let (read, writer) = stream.into_split();
        let mut client = Self {
            lines: BufReader::new(read).lines(),
            writer,
        };

        let greeting = client.read_message().await?;
        if greeting.greeting.is_none() {
            return Err(EngineError::Monitor("missing QMP greeting".into()));
        }
        client.execute("qmp_capabilities", None).await?;
        Ok(client)
    }

    async fn read_message(&mut self) -> Result<QmpMessage, EngineError> {
        let line = self
            .lines
            .next_line()
            .await
            .map_err(monitor)?
            .ok_or_else(|| EngineError::Monitor("monitor closed the connection".into()))?;
        serde_json::from_str(&line).map_err(monitor)
    }

    async fn execute(
        &mut self,
        command: &str,
        arguments: Option<Value>,
    ) -> Result<Value, EngineError> {
        let mut request = json!({ "execute": command });
        if let Some(arguments) = arguments {
            request["arguments"] = arguments;
        }
        debug!("QMP -> {}", request);

        let mut line = request.to_string();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await.map_err(monitor)?;

        loop {
            let message = self.read_message().await?;
            if let Some(event) = message.event {
                debug!("QMP event {} while waiting for {}", event, command);
                continue;
            }
            if let Some(error) = message.error {
                return Err(EngineError::Monitor(format!(
                    "{}: {}",
                    error.class, error.desc
                )));
            }
            if let Some(ret) = message.ret {
                return Ok(ret);
            }
        }
    }
}

/// Connect, run one command, and give the whole exchange `timeout`.
pub async fn execute_once(
    socket: &Path,
    timeout: Duration,
    command: &str,
    arguments: Option<Value>,
) -> Result<Value, EngineError> {
    tokio::time::timeout(timeout, async {
        let mut client = QmpClient::handshake(socket).await?;
        client.execute(command, arguments).await
    })
    .await
    .map_err(|_| EngineError::Monitor(format!("{} timed out", command)))?
}

/// Run an HMP command line through `human-monitor-command`.
pub async fn hmp_once(
    socket: &Path,
    timeout: Duration,
    command_line: &str,
) -> Result<String, EngineError> {
    let output = execute_once(
        socket,
        timeout,
        "human-monitor-command",
        Some(json!({ "command-line": command_line })),
    )
    .await?;
    Ok(output.as_str().unwrap_or_default().to_string())
}
