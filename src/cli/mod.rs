//! CLI entry point for chatstream.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;

use crate::config::ChatConfig;
use crate::session::{ChatSession, MessagesChangeFn};
use crate::sse::event_stream;
use crate::types::{
    Attachment, ChatMessage, PromptSelection, ResponseFormat, SessionIdentity, Settings,
};

/// chatstream CLI
#[derive(Parser, Debug)]
#[command(name = "chatstream", version, about = "Streaming chat client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Send one message and stream the answer
    Send(SendArgs),
    /// Decode an SSE transcript into one JSON event per line
    Decode(DecodeArgs),
}

/// Arguments for the `send` subcommand.
#[derive(Args, Debug)]
pub struct SendArgs {
    /// Message text
    pub text: String,

    /// User id sent with the request
    #[arg(short, long, default_value = "cli")]
    pub user: String,

    /// Session id (random when omitted)
    #[arg(short, long)]
    pub session: Option<String>,

    /// Server base URL (overrides config and environment)
    #[arg(long)]
    pub base_url: Option<String>,

    /// Model id
    #[arg(short, long)]
    pub model: Option<String>,

    /// Persona id
    #[arg(long, conflicts_with_all = ["template", "system"])]
    pub persona: Option<String>,

    /// Prompt template id
    #[arg(long, conflicts_with = "system")]
    pub template: Option<String>,

    /// Raw system prompt
    #[arg(long)]
    pub system: Option<String>,

    /// Ask for a structured JSON answer (not streamed)
    #[arg(long)]
    pub json: bool,

    /// Files to attach (sent as multipart, not streamed)
    #[arg(short, long = "attach")]
    pub attachments: Vec<PathBuf>,
}

/// Arguments for the `decode` subcommand.
#[derive(Args, Debug)]
pub struct DecodeArgs {
    /// Transcript file (stdin when omitted)
    pub file: Option<PathBuf>,
}

/// Handle `chatstream send`.
pub async fn handle_send(args: SendArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = ChatConfig::discover()?;
    if let Some(url) = args.base_url {
        config.base_url = url;
    }

    let session_id = args
        .session
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let settings = Settings {
        model: args.model,
        prompt: PromptSelection::resolve(args.persona, args.template, args.system),
        response_format: if args.json {
            ResponseFormat::Json
        } else {
            ResponseFormat::Text
        },
    };

    let mut attachments = Vec::new();
    for path in &args.attachments {
        attachments.push(load_attachment(path).await?);
    }

    let session = ChatSession::builder()
        .transport(Arc::new(crate::transport::HttpChatTransport::new(config.clone())?))
        .identity(SessionIdentity::new(args.user, session_id))
        .config(config)
        .settings(settings)
        .on_messages_change(terminal_printer())
        .build()?;

    if !session.send_message(args.text, attachments) {
        return Err("nothing to send".into());
    }

    tokio::select! {
        _ = session.wait_for_idle() => {}
        _ = tokio::signal::ctrl_c() => {
            session.stop_generation();
            session.wait_for_idle().await;
        }
    }
    println!();

    match session.messages().last() {
        Some(msg) if msg.error => Err(msg.content.clone().into()),
        Some(msg) if msg.is_user() => {
            eprintln!("(cancelled)");
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Handle `chatstream decode`.
pub async fn handle_decode(args: DecodeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let reader: Box<dyn AsyncRead + Send + Unpin> = match args.file {
        Some(path) => Box::new(tokio::fs::File::open(path).await?),
        None => Box::new(tokio::io::stdin()),
    };

    let mut events = event_stream(ReaderStream::new(reader));
    while let Some(event) = events.next().await {
        println!("{}", serde_json::to_string(&event?)?);
    }
    Ok(())
}

/// Print the growing tail of the streaming assistant message.
fn terminal_printer() -> MessagesChangeFn {
    let printed = Arc::new(Mutex::new(0usize));
    Arc::new(move |messages: &[ChatMessage]| {
        use std::io::Write;
        let Some(last) = messages.last().filter(|m| m.is_assistant() && !m.error) else {
            return;
        };
        let mut printed = printed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if last.content.len() > *printed && last.content.is_char_boundary(*printed) {
            print!("{}", &last.content[*printed..]);
            let _ = std::io::stdout().flush();
            *printed = last.content.len();
        }
    })
}

async fn load_attachment(path: &Path) -> Result<Attachment, Box<dyn std::error::Error>> {
    let data = tokio::fs::read(path).await?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "attachment".to_string());
    Ok(Attachment::new(file_name, mime_for(path), data))
}

fn mime_for(path: &Path) -> String {
    mime_guess::from_path(path).first_or_octet_stream().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_send_with_prompt_selection() {
        let cli = Cli::parse_from(["chatstream", "send", "hi", "--persona", "p1", "--json"]);
        let Commands::Send(args) = cli.command else {
            panic!("expected send");
        };
        assert_eq!(args.text, "hi");
        assert_eq!(args.persona.as_deref(), Some("p1"));
        assert!(args.json);
    }

    #[test]
    fn persona_conflicts_with_system_prompt() {
        let result = Cli::try_parse_from(["chatstream", "send", "hi", "--persona", "p", "--system", "s"]);
        assert!(result.is_err());
    }

    #[test]
    fn mime_is_guessed_from_extension() {
        assert_eq!(mime_for(Path::new("a/notes.txt")), "text/plain");
        assert_eq!(mime_for(Path::new("photo.PNG")), "image/png");
        assert_eq!(mime_for(Path::new("page.html")), "text/html");
        assert_eq!(mime_for(Path::new("blob")), "application/octet-stream");
    }
}
