//! Conversation state for the console client.
//!
//! Owns the contact list, the selected counterpart, and the display log,
//! and reduces session events into connectivity/error status. Session
//! handles themselves are opened and closed by the main loop; this type
//! decides when that has to happen.

use chatter_api::{StoredMessage, UserProfile};
use chatter_core::{SessionEvent, UserId};
use tracing::{debug, warn};

const DEFAULT_STATUS: &str = "Offline";

/// Contact row shown in the contact list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactView {
    pub id: UserId,
    pub username: String,
    pub is_selected: bool,
}

/// Display log row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageView {
    pub sender: UserId,
    pub body: String,
    pub is_own: bool,
}

/// Outcome of a counterpart selection change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionChange {
    /// The counterpart was already selected; nothing to do.
    Unchanged,
    /// Selection switched. When `close_previous` is set, the caller must
    /// close the old session before opening the new one.
    Switched { close_previous: bool },
}

/// Full snapshot for rendering after a state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSnapshot {
    pub contacts: Vec<ContactView>,
    pub messages: Vec<MessageView>,
    pub selected_contact_id: Option<UserId>,
    pub status_text: String,
    pub error_text: Option<String>,
    pub can_send: bool,
}

/// Mutable conversation state fed by session events and user actions.
#[derive(Debug, Clone)]
pub struct ConversationController {
    own_user_id: UserId,
    log_max_items: usize,
    contacts: Vec<ContactView>,
    selected: Option<UserId>,
    messages: Vec<MessageView>,
    status_text: String,
    error_text: Option<String>,
    connected: bool,
}

impl ConversationController {
    pub fn new(own_user_id: UserId, log_max_items: usize) -> Self {
        Self {
            own_user_id,
            log_max_items: log_max_items.max(1),
            contacts: Vec::new(),
            selected: None,
            messages: Vec::new(),
            status_text: DEFAULT_STATUS.to_owned(),
            error_text: None,
            connected: false,
        }
    }

    /// Current immutable snapshot for rendering.
    pub fn snapshot(&self) -> ConversationSnapshot {
        ConversationSnapshot {
            contacts: self.contacts.clone(),
            messages: self.messages.clone(),
            selected_contact_id: self.selected,
            status_text: self.status_text.clone(),
            error_text: self.error_text.clone(),
            can_send: self.connected && self.selected.is_some(),
        }
    }

    pub fn selected_contact_id(&self) -> Option<UserId> {
        self.selected
    }

    /// Look up a contact ID by username.
    pub fn contact_id_by_username(&self, username: &str) -> Option<UserId> {
        self.contacts
            .iter()
            .find(|contact| contact.username == username)
            .map(|contact| contact.id)
    }

    /// Replace the contact list, keeping backend ordering.
    pub fn replace_contacts(&mut self, contacts: Vec<UserProfile>) {
        let selected = self.selected;
        self.contacts = contacts
            .into_iter()
            .filter(|profile| profile.id != self.own_user_id)
            .map(|profile| ContactView {
                is_selected: selected == Some(profile.id),
                id: profile.id,
                username: profile.username,
            })
            .collect();
        debug!(contact_count = self.contacts.len(), "contact list replaced");

        if let Some(selected_id) = self.selected
            && !self.contacts.iter().any(|contact| contact.id == selected_id)
        {
            warn!(contact_id = selected_id, "selected contact disappeared from contact list");
            self.selected = None;
            self.messages.clear();
        }
    }

    /// Switch the active counterpart.
    ///
    /// The display log is cleared synchronously here, before any history
    /// fetch or new connection starts, so late frames from the old session
    /// can never land in the new log.
    pub fn select_contact(&mut self, contact_id: UserId) -> SelectionChange {
        if self.selected == Some(contact_id) {
            return SelectionChange::Unchanged;
        }

        let close_previous = self.selected.is_some();
        self.selected = Some(contact_id);
        for contact in &mut self.contacts {
            contact.is_selected = contact.id == contact_id;
        }
        self.messages.clear();
        self.error_text = None;
        self.connected = false;
        self.status_text = "Connecting".to_owned();

        SelectionChange::Switched { close_previous }
    }

    /// Prepend fetched history into the (just-cleared) display log.
    pub fn load_history(&mut self, records: Vec<StoredMessage>) {
        for record in records {
            self.push_message(MessageView {
                is_own: record.sender == self.own_user_id,
                sender: record.sender,
                body: record.message,
            });
        }
    }

    /// Feed one session event into the reducer.
    pub fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Connected => {
                self.connected = true;
                self.status_text = "Connected".to_owned();
                self.error_text = None;
            }
            SessionEvent::Message(message) => {
                if self.selected.is_none() {
                    warn!("dropping message event without a selected contact");
                    return;
                }
                self.push_message(MessageView {
                    is_own: message.sender == self.own_user_id,
                    sender: message.sender,
                    body: message.body,
                });
            }
            SessionEvent::ConnectivityLost {
                attempt,
                max_attempts,
                retry_in_ms,
            } => {
                self.connected = false;
                self.status_text =
                    format!("Reconnecting ({attempt}/{max_attempts}, retry in {retry_in_ms} ms)");
                self.error_text = Some("Lost connection to chat server".to_owned());
            }
            SessionEvent::Error { error, terminal } => {
                if terminal {
                    self.connected = false;
                    self.status_text = "Failed".to_owned();
                }
                self.error_text = Some(error.message);
            }
            SessionEvent::Closed => {
                self.connected = false;
                self.status_text = "Disconnected".to_owned();
            }
        }
    }

    fn push_message(&mut self, message: MessageView) {
        self.messages.push(message);
        if self.messages.len() > self.log_max_items {
            let excess = self.messages.len() - self.log_max_items;
            self.messages.drain(0..excess);
        }
    }
}
