mod config;
mod controller;
mod logging;

use anyhow::{Context, Result};
use chatter_api::ApiClient;
use chatter_core::{EventStream, SessionDescriptor, SessionEvent, UserId};
use chatter_realtime::{RealtimeConfig, SessionHandle, WsConnector};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use config::CliConfig;
use controller::{ConversationController, SelectionChange};

struct ActiveSession {
    handle: SessionHandle,
    events: EventStream,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let config = CliConfig::from_env().context("invalid configuration")?;

    let api = ApiClient::new(config.api_base.clone());
    let auth = api
        .login(&config.username, &config.password)
        .await
        .context("login failed")?;
    info!(user_id = auth.user.id, "logged in");
    println!("Logged in as {} (#{})", auth.user.username, auth.user.id);

    let mut controller = ConversationController::new(auth.user.id, config.log_max_items);
    let contacts = api
        .contacts(&auth.token)
        .await
        .context("failed to fetch contacts")?;
    controller.replace_contacts(contacts);
    print_contacts(&controller);
    println!("Commands: /open <username>, /contacts, /quit. Anything else sends to the open conversation.");

    let mut session: Option<ActiveSession> = None;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                let line = line.trim().to_owned();
                if line.is_empty() {
                    continue;
                }

                if line == "/quit" {
                    break;
                } else if line == "/contacts" {
                    match api.contacts(&auth.token).await {
                        Ok(contacts) => {
                            controller.replace_contacts(contacts);
                            print_contacts(&controller);
                        }
                        Err(err) => {
                            warn!(%err, "contact refresh failed");
                            println!("Failed to load contacts.");
                        }
                    }
                } else if let Some(username) = line.strip_prefix("/open ") {
                    open_conversation(
                        username.trim(),
                        &api,
                        &auth.token,
                        auth.user.id,
                        &config,
                        &mut controller,
                        &mut session,
                    )
                    .await;
                } else if let Some(active) = &session {
                    if active.handle.send_message(line.clone()).await {
                        if let Some(receiver) = controller.selected_contact_id() {
                            persist_message(&api, &auth.token, auth.user.id, receiver, line);
                        }
                    } else {
                        println!("Cannot send right now ({}).", controller.snapshot().status_text);
                    }
                } else {
                    println!("No open conversation; use /open <username>.");
                }
            }
            event = next_session_event(&mut session) => match event {
                Ok(event) => {
                    print_event(&event, &controller);
                    controller.handle_session_event(event);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "session event stream lagged");
                }
                Err(RecvError::Closed) => {
                    session = None;
                }
            },
        }
    }

    if let Some(active) = session.take() {
        active.handle.close().await;
        active.handle.join().await;
    }
    Ok(())
}

/// Switch the conversation: close the previous session first, clear the
/// display log, load history, then connect.
async fn open_conversation(
    username: &str,
    api: &ApiClient,
    token: &str,
    own_user_id: UserId,
    config: &CliConfig,
    controller: &mut ConversationController,
    session: &mut Option<ActiveSession>,
) {
    let Some(contact_id) = controller.contact_id_by_username(username) else {
        println!("Unknown contact '{username}'.");
        return;
    };

    match controller.select_contact(contact_id) {
        SelectionChange::Unchanged => {
            println!("Already talking to {username}.");
            return;
        }
        SelectionChange::Switched { close_previous } => {
            if close_previous
                && let Some(active) = session.take()
            {
                active.handle.close().await;
                active.handle.join().await;
            }
        }
    }

    match api.history(token, contact_id).await {
        Ok(records) => {
            controller.load_history(records);
            for message in controller.snapshot().messages {
                println!("{}: {}", sender_label(controller, message.sender), message.body);
            }
        }
        Err(err) => {
            warn!(%err, "history fetch failed");
            println!("Failed to load message history.");
        }
    }

    let descriptor = SessionDescriptor::new(own_user_id, contact_id, token);
    let handle = SessionHandle::open(
        WsConnector,
        RealtimeConfig::new(config.ws_base.clone()),
        descriptor,
    );
    let events = handle.subscribe();
    *session = Some(ActiveSession { handle, events });
    println!("Connecting to {username}...");
}

/// Durably store a sent message without blocking the send path.
fn persist_message(api: &ApiClient, token: &str, sender: UserId, receiver: UserId, message: String) {
    let api = api.clone();
    let token = token.to_owned();
    tokio::spawn(async move {
        if let Err(err) = api.save_message(&token, sender, receiver, &message).await {
            warn!(%err, "failed to persist sent message");
        }
    });
}

async fn next_session_event(session: &mut Option<ActiveSession>) -> Result<SessionEvent, RecvError> {
    match session {
        Some(active) => active.events.recv().await,
        None => std::future::pending().await,
    }
}

fn print_event(event: &SessionEvent, controller: &ConversationController) {
    match event {
        SessionEvent::Connected => println!("[connected]"),
        SessionEvent::Message(message) => {
            println!("{}: {}", sender_label(controller, message.sender), message.body);
        }
        SessionEvent::ConnectivityLost {
            attempt,
            max_attempts,
            retry_in_ms,
        } => println!("[connection lost; retry {attempt}/{max_attempts} in {retry_in_ms} ms]"),
        SessionEvent::Error { error, terminal } => {
            if *terminal {
                println!("[fatal] {}", error.message);
            } else {
                println!("[error] {}", error.message);
            }
        }
        SessionEvent::Closed => println!("[disconnected]"),
    }
}

fn sender_label(controller: &ConversationController, sender: UserId) -> String {
    controller
        .snapshot()
        .contacts
        .iter()
        .find(|contact| contact.id == sender)
        .map(|contact| contact.username.clone())
        .unwrap_or_else(|| format!("user#{sender}"))
}

fn print_contacts(controller: &ConversationController) {
    let snapshot = controller.snapshot();
    if snapshot.contacts.is_empty() {
        println!("No contacts available.");
        return;
    }
    println!("Contacts:");
    for contact in snapshot.contacts {
        let marker = if contact.is_selected { "*" } else { "-" };
        println!("  {marker} {}", contact.username);
    }
}
