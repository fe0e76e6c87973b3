use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{
    load_settings, ChatClient, ChatMessage, ClientEvent, Credential, DeliveryState,
    HttpChatBackend, LocalId, SessionContext, WebSocketConnector,
};
use shared::{
    domain::{ParticipantId, RoomId},
    protocol::{MessageContent, ThreadRecord},
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

/// Staff console for live marketplace conversations.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = client_core::config::DEFAULT_SETTINGS_FILE)]
    config: PathBuf,
    /// Overrides `server_url` from the settings file.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long, env = "CONSOLE_TOKEN")]
    token: String,
    /// Participant id of the signed-in staff member.
    #[arg(long)]
    me: String,
    /// Room to focus right after start.
    #[arg(long)]
    room: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut settings = load_settings(&args.config);
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url.trim_end_matches('/').to_string();
    }
    info!(server_url = %settings.server_url, route = ?settings.send_route, "console: starting");

    let credential = Credential::new(args.token);
    let me = ParticipantId::new(args.me);
    let backend = Arc::new(HttpChatBackend::new(
        settings.server_url.clone(),
        credential.clone(),
        settings.history_limit,
    ));
    let connector = Arc::new(
        WebSocketConnector::from_server_url(&settings.server_url, &settings.ws_path)
            .context("invalid websocket endpoint")?,
    );
    let client = ChatClient::new(
        SessionContext::new(credential, me.clone()),
        settings,
        backend,
        connector,
    );

    let events = client.subscribe_events();
    tokio::spawn(print_events(Arc::clone(&client), events));

    client.start().await.context("failed to start chat session")?;
    client
        .load_threads()
        .await
        .context("failed to load conversations")?;
    print_threads(&client.threads().await, &me);

    if let Some(room) = args.room {
        if let Err(err) = client.focus_room(RoomId::new(room)).await {
            eprintln!("! {err}");
        }
    }

    print_help();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        if let Err(err) = run_command(&client, &me, line).await {
            eprintln!("! {err}");
        }
    }

    client.shutdown().await;
    Ok(())
}

async fn run_command(client: &Arc<ChatClient>, me: &ParticipantId, line: &str) -> Result<()> {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    match command {
        "/threads" => print_threads(&client.threads().await, me),
        "/filter" => print_threads(&client.filter_threads(rest).await, me),
        "/contacts" => {
            for participant in client.contacts().await {
                println!("  {} ({})", participant.name, participant.id);
            }
        }
        "/open" => {
            let room_id = client
                .open_thread_with(ParticipantId::new(rest), None)
                .await?;
            println!("focused {room_id}");
        }
        "/room" => {
            client.focus_room(RoomId::new(rest)).await?;
            print_messages(&client.messages().await);
        }
        "/leave" => client.blur().await,
        "/refresh" => {
            client.refresh_history().await?;
            print_messages(&client.messages().await);
        }
        "/retry" => client.retry(parse_local_id(rest)?).await?,
        "/discard" => client.discard(parse_local_id(rest)?).await?,
        "/typing" => client.input_changed().await?,
        "/help" => print_help(),
        _ if command.starts_with('/') => println!("unknown command {command}"),
        _ => {
            let local_id = client.send_text(line).await?;
            println!("  [{local_id}] sending");
        }
    }
    Ok(())
}

fn parse_local_id(raw: &str) -> Result<LocalId> {
    let raw = raw.trim_start_matches("local-");
    let id = raw
        .parse::<u64>()
        .with_context(|| format!("not a local message id: {raw}"))?;
    Ok(LocalId(id))
}

async fn print_events(
    client: Arc<ChatClient>,
    mut events: tokio::sync::broadcast::Receiver<ClientEvent>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        };
        match event {
            ClientEvent::ConnectionChanged(state) => println!("* connection {state:?}"),
            ClientEvent::MessagesChanged { .. } => {
                if let Some(last) = client.messages().await.last() {
                    print_message(last);
                }
            }
            ClientEvent::HistoryFailed { room_id, error } => {
                println!("* history for {room_id} failed: {error} (try /refresh)");
            }
            ClientEvent::SendFailed {
                local_id, reason, ..
            } => println!("* [{local_id}] failed: {reason} (/retry or /discard)"),
            ClientEvent::ThreadsChanged => {}
            ClientEvent::RemoteTypingChanged { typing, .. } if typing.is_empty() => {}
            ClientEvent::RemoteTypingChanged { typing, .. } => {
                let names: Vec<&str> = typing.iter().map(ParticipantId::as_str).collect();
                println!("* {} typing...", names.join(", "));
            }
            ClientEvent::SessionExpired(reason) => {
                println!("* session expired: {reason}; restart with a fresh token");
            }
            ClientEvent::Error(message) => println!("* server error: {message}"),
        }
    }
}

fn print_threads(threads: &[ThreadRecord], me: &ParticipantId) {
    for thread in threads {
        let name = thread
            .counterpart(me)
            .map(|participant| participant.name.as_str())
            .unwrap_or("?");
        let last = thread
            .last_message
            .as_ref()
            .map(|last| last.content.as_str())
            .unwrap_or("");
        let unread = if thread.unread_count > 0 {
            format!(" ({})", thread.unread_count)
        } else {
            String::new()
        };
        println!("  {} {name}{unread}: {last}", thread.id);
    }
}

fn print_messages(messages: &[ChatMessage]) {
    for message in messages {
        print_message(message);
    }
}

fn print_message(message: &ChatMessage) {
    let body = match &message.content {
        MessageContent::Text(text) => text.clone(),
        MessageContent::Product(product) => match product.price {
            Some(price) => format!("[product] {} {price:.2}", product.title),
            None => format!("[product] {}", product.title),
        },
    };
    let marker = match (message.delivery, message.local_id()) {
        (DeliveryState::Pending, Some(local_id)) => format!(" [{local_id} sending]"),
        (DeliveryState::Failed, Some(local_id)) => format!(" [{local_id} failed]"),
        _ => String::new(),
    };
    let sender = message
        .sender_name
        .as_deref()
        .unwrap_or(message.sender_id.as_str());
    println!(
        "  {} {sender}: {body}{marker}",
        message.created_at.format("%H:%M")
    );
}

fn print_help() {
    println!(
        "commands: /threads /filter <q> /contacts /open <participant> /room <id> /leave \
         /refresh /retry <n> /discard <n> /typing /quit; anything else is sent"
    );
}
