//! Terminal chat client.
//!
//! Run with: cargo run -p chat-cli-demo -- --conversation <id>
//!
//! Lines typed on stdin are sent as user messages. Commands:
//! `/watch <id>`, `/cancel <id>`, `/clear`, `/quit`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use agent_sync_core::Execution;
use agent_sync_session::{ChatSession, ConversationEntry, NoticeLevel};
use agent_sync_transport::{ClientConfig, SyncClient};
use anyhow::Context;
use clap::Parser;
use futures::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Image formats written with their own extension; anything else is saved as png.
const IMAGE_FORMATS: [&str; 5] = ["png", "jpeg", "jpg", "gif", "svg"];

#[derive(Debug, Parser)]
#[command(about = "Chat with the agent backend from a terminal")]
struct Args {
    /// Config file (default: <config_dir>/agent-sync/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Endpoint URL, overrides config and environment
    #[arg(long)]
    url: Option<String>,

    /// Conversation to send messages to
    #[arg(long, default_value = "default")]
    conversation: String,

    /// Ask the backend to use the secondary agent
    #[arg(long)]
    dual_agent: bool,

    /// Write execution images to this directory
    #[arg(long)]
    save_images: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = ClientConfig::load(args.config.as_deref()).context("loading config")?;
    if let Some(url) = args.url {
        config.connection.url = Some(url);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    let session = ChatSession::new();
    let client = SyncClient::websocket(&config, session.clone()).context("creating client")?;
    session.open_conversation(&args.conversation);
    session.track_connection(&client);

    tokio::spawn(print_feed(session.clone()));
    tokio::spawn(print_notices(session.subscribe_notices()));
    tokio::spawn(print_executions(
        session.execution_updates(),
        args.save_images.clone(),
    ));

    client.connect()?;
    tracing::info!(url = %config.websocket_url()?, "Connecting");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line.split_once(' ').unwrap_or((line, "")) {
            ("/quit", _) => break,
            ("/clear", _) => {
                session.clear(&client);
                println!("-- cleared --");
            }
            ("/watch", id) if !id.is_empty() => {
                client.watch_execution(id.trim(), |_: &Value| {})?;
                println!("-- watching {id} --");
            }
            ("/cancel", id) if !id.is_empty() => {
                if let Err(e) = client.cancel_execution(id.trim()).await {
                    eprintln!("cancel request not sent: {e}");
                }
            }
            ("", _) => {}
            _ => {
                let dual_agent = args.dual_agent.then_some(true);
                if let Err(e) = session.send_user_message(&client, line, dual_agent).await {
                    eprintln!("not sent: {e}");
                }
            }
        }
    }

    client.disconnect().await?;
    Ok(())
}

async fn print_feed(session: ChatSession) {
    let mut entries = session.feed().history_plus_stream();
    while let Some(entry) = entries.next().await {
        match entry {
            // echo of our own input
            ConversationEntry::User { .. } => {}
            ConversationEntry::Assistant { content } => println!("assistant> {content}"),
            ConversationEntry::UserAgent { content } => println!("agent> {content}"),
            ConversationEntry::ToolStart {
                invocation_id,
                function,
                arguments,
            } => println!("[tool {invocation_id}] {function}({arguments})"),
            ConversationEntry::ToolResult {
                invocation_id,
                function,
                result,
            } => println!("[tool {invocation_id}] {function} -> {result}"),
            ConversationEntry::CodeExecution { execution_id, code } => {
                println!("[exec {execution_id}]");
                for line in code.lines() {
                    println!("  | {line}");
                }
            }
        }
    }
}

async fn print_notices(mut notices: broadcast::Receiver<agent_sync_session::Notice>) {
    loop {
        match notices.recv().await {
            Ok(notice) => {
                let tag = match notice.level {
                    NoticeLevel::Info => "info",
                    NoticeLevel::Success => "ok",
                    NoticeLevel::Error => "error",
                };
                match notice.details {
                    Some(details) => eprintln!("({tag}) {} - {details}", notice.message),
                    None => eprintln!("({tag}) {}", notice.message),
                }
            }
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn print_executions(mut updates: broadcast::Receiver<Execution>, image_dir: Option<PathBuf>) {
    // outputs already printed, per execution
    let mut printed: HashMap<String, usize> = HashMap::new();
    loop {
        let execution = match updates.recv().await {
            Ok(execution) => execution,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let seen = printed.entry(execution.id.clone()).or_default();
        for output in execution.outputs.iter().skip(*seen) {
            if output.is_image() {
                println!("[exec {}] <image>", execution.id);
            } else {
                println!("[exec {}] {}", execution.id, output.content.trim_end());
            }
        }
        *seen = execution.outputs.len();

        if !execution.is_running() {
            match &execution.error {
                Some(error) => println!("[exec {}] {} ({error})", execution.id, execution.status),
                None => println!("[exec {}] {}", execution.id, execution.status),
            }
            if let Some(dir) = &image_dir {
                save_images(dir, &execution).await;
            }
        }
    }
}

async fn save_images(dir: &Path, execution: &Execution) {
    if execution.images.is_empty() {
        return;
    }
    if !is_safe_file_stem(&execution.id) {
        tracing::warn!(execution_id = %execution.id, "Not saving images for unsafe execution id");
        return;
    }
    if let Err(e) = tokio::fs::create_dir_all(dir).await {
        tracing::warn!(dir = %dir.display(), error = %e, "Cannot create image directory");
        return;
    }
    for (index, image) in execution.images.iter().enumerate() {
        let bytes = match image.decode() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(execution_id = %execution.id, index, error = %e, "Undecodable image");
                continue;
            }
        };
        let path = dir.join(image_file_name(&execution.id, index, &image.format));
        match tokio::fs::write(&path, bytes).await {
            Ok(()) => println!("[exec {}] saved {}", execution.id, path.display()),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Cannot write image"),
        }
    }
}

/// Whether `stem` is usable as a file name inside the image directory.
fn is_safe_file_stem(stem: &str) -> bool {
    !stem.is_empty()
        && stem
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// `<execution_id>-<index>.<ext>`, with unknown formats mapped to png.
fn image_file_name(execution_id: &str, index: usize, format: &str) -> String {
    let format = format.to_ascii_lowercase();
    let ext = IMAGE_FORMATS
        .iter()
        .find(|known| **known == format)
        .copied()
        .unwrap_or("png");
    format!("{execution_id}-{index}.{ext}")
}
