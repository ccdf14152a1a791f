use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use common::telemetry::{get_subscriber, init_subscriber};
use vmorch::{
    configuration::{default_configuration_dir, get_configuration},
    model::command::{CommandEnvelope, CommandResult},
    startup::{build_app, run, status_event_line},
};

/// VM and remote-display orchestrator speaking JSON lines on stdin/stdout.
#[derive(Parser, Debug)]
#[command(name = "vmorch-server", version, about)]
struct Args {
    /// Directory holding base.yaml and <environment>.yaml
    #[arg(long, env = "VMORCH_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // stdout carries the command channel.
    let subscriber = get_subscriber("vmorch".into(), args.log_level.clone(), std::io::stderr);
    init_subscriber(subscriber);

    let config_dir = args.config_dir.unwrap_or_else(default_configuration_dir);
    let settings = get_configuration(&config_dir)
        .with_context(|| format!("Failed to read configuration from {:?}", config_dir))?;

    let app = build_app(&settings);
    let status_updates = app.monitor().subscribe();
    let (commands, consumer) = run(app, settings.channel.capacity);

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            stdout.write_all(line.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let events = tokio::spawn({
        let out_tx = out_tx.clone();
        async move {
            let mut updates = BroadcastStream::new(status_updates);
            while let Some(update) = updates.next().await {
                match update {
                    Ok(update) => match status_event_line(&update) {
                        Ok(line) => {
                            if out_tx.send(line).is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::warn!("Failed to encode status update: {}", e),
                    },
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        tracing::warn!("Dropped {} status updates", skipped);
                    }
                }
            }
        }
    });

    tracing::info!("vmorch-server ready, reading commands from stdin");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let envelope: CommandEnvelope = match serde_json::from_str(&line) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("Rejected malformed command line: {}", e);
                let reply = CommandResult::failure(format!("invalid command: {}", e));
                out_tx.send(serde_json::to_string(&reply)?)?;
                continue;
            }
        };

        let commands = commands.clone();
        let out_tx = out_tx.clone();
        tokio::spawn(async move {
            let result = commands.send(envelope).await;
            match serde_json::to_string(&result) {
                Ok(line) => {
                    let _ = out_tx.send(line);
                }
                Err(e) => tracing::error!("Failed to encode command result: {}", e),
            }
        });
    }

    tracing::info!("stdin closed, shutting down");
    drop(commands);
    consumer.await?;
    events.abort();
    drop(out_tx);
    writer.await??;
    Ok(())
}
