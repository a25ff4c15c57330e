use std::collections::HashMap;
use std::io::{self, Write};
use std::path::PathBuf;

use agentfeed_core::{
    config::Config,
    connection::{ConnectionManager, StreamDriver, StreamReport},
    error::CoreResult,
    model::GenerationRequest,
    sink::{ChannelSink, SinkEvent},
    telemetry::StreamOutcome,
    transport::{StreamRequest, Transport, TransportKind},
};
use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing_subscriber::EnvFilter;

const CONNECTION_ID: &str = "cli";

#[derive(Parser)]
#[command(author, version, about = "agentfeed CLI: stream multi-agent generation output", long_about = None)]
struct Cli {
    /// Config file (JSON or TOML). Defaults are used when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Override the backend base URL.
    #[arg(long, global = true)]
    base_url: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream a chat answer (prints deltas live)
    Chat {
        #[arg(short, long, help = "Message from the user")]
        message: String,
        #[arg(long)]
        conversation: Option<String>,
    },
    /// Run the test-case generation pipeline
    Testcase {
        #[arg(short, long, help = "Requirement text")]
        text: Option<String>,
        #[arg(short, long = "file", help = "Uploaded file path on the backend; repeatable")]
        files: Vec<String>,
        #[arg(long)]
        conversation: Option<String>,
        #[arg(long, default_value_t = 1)]
        round: u32,
        #[arg(long, help = "Feedback on the previous round")]
        feedback: Option<String>,
        #[arg(long, help = "Use the push-subscribe (GET) endpoint with reconnects")]
        subscribe: bool,
    },
    /// Feed a captured stream through the pipeline offline
    Replay {
        file: PathBuf,
        #[arg(long, default_value_t = 64)]
        chunk_size: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let mut cfg = match &cli.config {
        Some(path) => Config::from_path(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(url) = cli.base_url {
        cfg.endpoints.base_url = url;
    }

    let report = match cli.command {
        Commands::Chat { message, conversation } => {
            let mut body = GenerationRequest::text(message);
            body.conversation_id = conversation;
            stream(cfg, StreamRequest::chat(body)).await?
        }
        Commands::Testcase {
            text,
            files,
            conversation,
            round,
            feedback,
            subscribe,
        } => {
            let body = GenerationRequest {
                conversation_id: conversation,
                text_content: text,
                file_paths: Some(files).filter(|f| !f.is_empty()),
                round_number: round,
                enable_streaming: true,
                user_feedback: feedback,
            };
            let request = if subscribe {
                StreamRequest::testcase_subscribe(body)
            } else {
                StreamRequest::testcase(body)
            };
            stream(cfg, request).await?
        }
        Commands::Replay { file, chunk_size } => {
            let data = tokio::fs::read(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let transport = ReplayTransport::new(Bytes::from(data), chunk_size.max(1));
            let (tx, rx) = mpsc::unbounded_channel();
            let printer = tokio::spawn(print_events(rx));
            let report = StreamDriver::new("replay", Box::new(transport), Box::new(ChannelSink::new(tx)), &cfg, 1)
                .run()
                .await;
            printer.await?;
            Some(report)
        }
    };

    match report {
        Some(r) if r.outcome == StreamOutcome::Errored => anyhow::bail!("stream failed"),
        Some(r) => {
            print_summary(&r);
            Ok(())
        }
        None => Ok(()),
    }
}

/// Run one live connection until it ends or Ctrl-C cancels it.
async fn stream(cfg: Config, request: StreamRequest) -> anyhow::Result<Option<StreamReport>> {
    let mgr = ConnectionManager::http(cfg)?;
    let (tx, rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_events(rx));

    mgr.connect(CONNECTION_ID, request, Box::new(ChannelSink::new(tx)))
        .await?;

    let report = tokio::select! {
        r = mgr.join(CONNECTION_ID) => r,
        _ = tokio::signal::ctrl_c() => {
            mgr.cancel(CONNECTION_ID).await;
            eprintln!("\n[cancelled]");
            None
        }
    };
    mgr.shutdown().await;
    printer.await?;
    Ok(report)
}

/// Print cumulative deltas as a live tail per agent, then finalized messages.
async fn print_events(mut rx: UnboundedReceiver<SinkEvent>) {
    let mut printed: HashMap<String, usize> = HashMap::new();
    let mut current: Option<String> = None;
    let mut out = io::stdout();

    while let Some(ev) = rx.recv().await {
        match ev {
            SinkEvent::Delta { agent_id, cumulative } => {
                if current.as_deref() != Some(agent_id.as_str()) {
                    let _ = writeln!(out, "\n== {agent_id} ==");
                    current = Some(agent_id.clone());
                }
                let done = printed.entry(agent_id).or_insert(0);
                if let Some(tail) = cumulative.get(*done..) {
                    let _ = write!(out, "{tail}");
                }
                *done = cumulative.len();
                let _ = out.flush();
            }
            SinkEvent::Message(m) => {
                let streamed = printed.remove(&m.agent_id).is_some();
                if !streamed {
                    let _ = writeln!(out, "\n== {} ==\n{}", m.agent_id, m.content);
                }
                let _ = writeln!(out, "\n[{} finalized, round {}]", m.agent_id, m.round);
                current = None;
            }
            SinkEvent::Complete => {
                let _ = writeln!(out, "\n[complete]");
            }
            SinkEvent::Error { kind, message } => {
                eprintln!("\n[error ({kind}): {message}]");
            }
            SinkEvent::Diagnostic(d) => {
                tracing::warn!(kind = ?d.kind, detail = %d.detail, "parse diagnostic");
            }
        }
    }
}

fn print_summary(report: &StreamReport) {
    eprintln!(
        "[{} messages, outcome {}, reconnects {}{}]",
        report.messages.len(),
        report.outcome.as_str(),
        report.reconnects,
        report
            .conversation_id
            .as_deref()
            .map(|c| format!(", conversation {c}"))
            .unwrap_or_default()
    );
}

/// Serves a captured byte stream in fixed-size chunks.
struct ReplayTransport {
    data: Bytes,
    chunk_size: usize,
    opened: bool,
}

impl ReplayTransport {
    fn new(data: Bytes, chunk_size: usize) -> Self {
        Self {
            data,
            chunk_size,
            opened: false,
        }
    }
}

#[async_trait]
impl Transport for ReplayTransport {
    async fn open(&mut self) -> CoreResult<()> {
        self.opened = true;
        Ok(())
    }

    async fn read(&mut self) -> CoreResult<Option<Bytes>> {
        if !self.opened || self.data.is_empty() {
            return Ok(None);
        }
        let n = self.chunk_size.min(self.data.len());
        Ok(Some(self.data.split_to(n)))
    }

    fn cancel(&mut self) {
        self.data.clear();
    }

    fn kind(&self) -> TransportKind {
        TransportKind::RequestStream
    }
}
