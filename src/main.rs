//! agrichat - terminal front end for the streaming chat client
//!
//! Usage: `agrichat [conversation-id]`. Each input line is sent as a
//! message. `/stop`, `/typing`, `/retry`, `/reconnect` and `/quit` are
//! commands.

use agrichat::{ChatClient, ClientConfig, ClientUpdate, ConnectionState};
use futures::StreamExt;
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::BroadcastStream;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging; stdout belongs to the conversation
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "agrichat=info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let conversation_id = std::env::args().nth(1).unwrap_or_else(|| "default".to_string());
    let config = ClientConfig::from_env();
    tracing::info!(
        ws_url = %config.ws_url,
        api_url = %config.api_url,
        strategy = ?config.reconcile,
        "Starting chat client"
    );
    if config.auth_token.is_none() {
        tracing::warn!("AGRICHAT_TOKEN is not set, the backend will likely reject the connection");
    }

    let client = ChatClient::new(&config)?;
    let printer = tokio::spawn(print_updates(client.update_stream(), conversation_id.clone()));

    let token = config.auth_token.clone().unwrap_or_default();
    client.connect(&token).await?;
    let _ = client.join(&conversation_id);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut typing = false;

    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };

        match line.trim() {
            "" => {}
            "/quit" => break,
            "/stop" => {
                if !client.stop(&conversation_id) {
                    println!("(nothing to stop)");
                }
            }
            "/typing" => {
                typing = !typing;
                client.set_typing(&conversation_id, typing);
            }
            "/retry" => {
                if let Err(e) = client.retry_reconcile(&conversation_id).await {
                    println!("! {e}");
                }
            }
            "/reconnect" => match client.connect(&token).await {
                Ok(()) => {
                    let _ = client.join(&conversation_id);
                }
                Err(e) => println!("! {e}"),
            },
            text => {
                if let Err(e) = client.send_message(&conversation_id, text) {
                    println!("! {e}");
                }
            }
        }
    }

    client.disconnect();
    printer.abort();
    Ok(())
}

/// Render updates for one conversation on stdout
async fn print_updates(mut updates: BroadcastStream<ClientUpdate>, conversation_id: String) {
    let mut shown = String::new();

    while let Some(update) = updates.next().await {
        let update = match update {
            Ok(update) => update,
            Err(e) => {
                tracing::debug!(error = %e, "Update printer lagged");
                continue;
            }
        };

        match update {
            ClientUpdate::ConnectionChanged(state) => match state {
                ConnectionState::Errored { retriable, reason } => {
                    let hint = if retriable { " (type /reconnect)" } else { "" };
                    println!("\n[connection error: {reason}{hint}]");
                }
                other => println!("[{}]", other.name()),
            },
            ClientUpdate::Partial {
                conversation_id: conv,
                content,
                ..
            } if conv == conversation_id => {
                match content.strip_prefix(shown.as_str()) {
                    Some(rest) => print!("{rest}"),
                    None => print!("\n{content}"),
                }
                let _ = std::io::stdout().flush();
                shown = content;
            }
            ClientUpdate::Completed {
                conversation_id: conv,
                content,
                follow_up_questions,
                title,
                ..
            } if conv == conversation_id => {
                if content == shown {
                    println!();
                } else {
                    println!("\n{content}");
                }
                for question in &follow_up_questions {
                    println!("  ? {}", question.question);
                }
                if let Some(title) = title {
                    println!("[title: {title}]");
                }
                shown.clear();
            }
            ClientUpdate::Stopped {
                conversation_id: conv, ..
            } if conv == conversation_id => {
                println!("\n[stopped]");
                shown.clear();
            }
            ClientUpdate::Errored {
                conversation_id: conv,
                message,
                ..
            } if conv == conversation_id => {
                println!("\n[error: {message}]");
                shown.clear();
            }
            ClientUpdate::Typing {
                conversation_id: conv,
                is_typing: true,
            } if conv == conversation_id => {
                if shown.is_empty() {
                    println!("[assistant is typing]");
                }
            }
            ClientUpdate::ReconcileFailed { error, .. } => {
                let hint = if error.is_retryable() { " (type /retry)" } else { "" };
                println!("[could not sync history: {}{hint}]", error.source);
            }
            ClientUpdate::ProtocolWarning { frame_type, .. } => {
                tracing::debug!(frame_type = %frame_type, "Ignored unknown frame");
            }
            _ => {}
        }
    }
}
