//! Classifies inbound chat text and relays authorized commands.
//!
//! Administrative commands (auth, link, unlink, sessions, status, history,
//! help) are handled locally; any other text from an authorized, linked user
//! is forwarded verbatim to the control plane. Every error path resolves to
//! display text: nothing thrown here may reach the chat channel raw.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};

use crate::access_store::AccessStore;
use crate::control_plane::ControlPlaneClient;

/// Upper bound on a user-facing reply before the truncation marker applies.
pub const REPLY_MAX_CHARS: usize = 4_096;
/// Per-user command history cap; oldest entries are evicted first.
pub const HISTORY_CAP: usize = 50;
/// Number of history entries rendered by the `history` command.
pub const HISTORY_WINDOW: usize = 5;
pub const TRUNCATION_MARKER: &str = "\n[output truncated]";

const HISTORY_RESULT_MAX_CHARS: usize = 100;
const SESSION_LIST_MAX_ROWS: usize = 10;

const ADMIN_COMMAND_WORDS: &[&str] = &[
    "auth", "help", "link", "unlink", "sessions", "status", "history",
];

#[derive(Debug, Clone)]
pub struct CommandHistoryEntry {
    pub timestamp: String,
    pub command: String,
    pub result: String,
}

pub struct CommandRouter {
    access: Arc<AccessStore>,
    control_plane: ControlPlaneClient,
    shared_secret: String,
    history: Mutex<HashMap<String, VecDeque<CommandHistoryEntry>>>,
}

impl CommandRouter {
    pub fn new(
        access: Arc<AccessStore>,
        control_plane: ControlPlaneClient,
        shared_secret: String,
    ) -> Self {
        Self {
            access,
            control_plane,
            shared_secret,
            history: Mutex::new(HashMap::new()),
        }
    }

    /// True when this text belongs to the router pipeline: either its first
    /// word is an administrative/authentication word, or the sender is
    /// already authorized (and so every message is a candidate command).
    /// Unclaimed text goes to the generic plugin pipeline.
    pub fn claims(&self, user_id: &str, text: &str) -> bool {
        let Some(word) = text.split_whitespace().next() else {
            return false;
        };
        ADMIN_COMMAND_WORDS.contains(&word.to_lowercase().as_str())
            || self.access.is_authorized(user_id)
    }

    /// Routes one inbound text and always produces a displayable reply.
    pub async fn route(&self, user_id: &str, text: &str) -> String {
        let trimmed = text.trim();
        let mut words = trimmed.split_whitespace();
        let Some(word) = words.next() else {
            return String::new();
        };
        let command = word.to_lowercase();
        let args: Vec<&str> = words.collect();

        match command.as_str() {
            "auth" => self.handle_auth(user_id, &args),
            "help" => help_text(self.access.is_authorized(user_id)),
            _ if !self.access.is_authorized(user_id) => {
                debug!(user_id, command = %command, "privileged command from unauthorized user");
                "Unauthorized. Use: auth <secret>".to_string()
            }
            "link" => self.handle_link(user_id, &args),
            "unlink" => {
                self.access.unlink_session(user_id);
                "Unlinked from session.".to_string()
            }
            "sessions" => self.render_sessions().await,
            "status" => {
                let link = match self.access.session_for(user_id) {
                    Some(session_id) => format!("Current session: {session_id}"),
                    None => "Not linked to any session.".to_string(),
                };
                format!("{link}\nAuthorized users: {}", self.access.authorized_count())
            }
            "history" => self.render_history(user_id),
            _ => self.relay_command(user_id, trimmed).await,
        }
    }

    /// Administrative revocation. Not reachable from chat commands.
    pub fn revoke_user(&self, user_id: &str) {
        self.access.revoke(user_id);
    }

    fn handle_auth(&self, user_id: &str, args: &[&str]) -> String {
        let secret = args.join(" ");
        if secret.is_empty() {
            return "Usage: auth <secret>".to_string();
        }
        if secret == self.shared_secret {
            self.access.authorize(user_id);
            debug!(user_id, "user authorized");
            "Authorized. Use `help` to list available commands.".to_string()
        } else {
            "Invalid access secret.".to_string()
        }
    }

    fn handle_link(&self, user_id: &str, args: &[&str]) -> String {
        let Some(session_id) = args.first().filter(|value| !value.is_empty()) else {
            return "Usage: link <session_id>".to_string();
        };
        if self.access.link_session(user_id, session_id) {
            format!("Linked to session `{session_id}`.")
        } else {
            "Unauthorized. Use: auth <secret>".to_string()
        }
    }

    async fn relay_command(&self, user_id: &str, raw_text: &str) -> String {
        let Some(session_id) = self.access.session_for(user_id) else {
            return "No session linked. Use: link <session_id>".to_string();
        };
        let timestamp = Utc::now().to_rfc3339();
        match self
            .control_plane
            .send_command(&session_id, user_id, raw_text, &timestamp)
            .await
        {
            Ok(data) => {
                let reply = format_command_result(&data);
                self.push_history(user_id, raw_text, &reply, timestamp);
                reply
            }
            Err(error) => {
                warn!(user_id, session_id = %session_id, %error, "control plane command failed");
                "Command failed. The control plane did not return a result.".to_string()
            }
        }
    }

    async fn render_sessions(&self) -> String {
        match self.control_plane.list_sessions().await {
            Ok(sessions) if sessions.is_empty() => "No active sessions.".to_string(),
            Ok(sessions) => {
                let mut lines = vec![format!("Active sessions ({}):", sessions.len())];
                for session in sessions.iter().take(SESSION_LIST_MAX_ROWS) {
                    lines.push(format!("- {}: {}", session.id, session.hostname));
                }
                if sessions.len() > SESSION_LIST_MAX_ROWS {
                    lines.push(format!(
                        "... {} more omitted",
                        sessions.len() - SESSION_LIST_MAX_ROWS
                    ));
                }
                lines.join("\n")
            }
            Err(error) => {
                warn!(%error, "control plane session listing failed");
                "Failed to fetch sessions from the control plane.".to_string()
            }
        }
    }

    fn push_history(&self, user_id: &str, command: &str, result: &str, timestamp: String) {
        let mut history = self.lock_history();
        let entries = history.entry(user_id.to_string()).or_default();
        entries.push_back(CommandHistoryEntry {
            timestamp,
            command: command.to_string(),
            result: truncate_chars(result, HISTORY_RESULT_MAX_CHARS),
        });
        while entries.len() > HISTORY_CAP {
            entries.pop_front();
        }
    }

    fn render_history(&self, user_id: &str) -> String {
        let history = self.lock_history();
        let Some(entries) = history.get(user_id).filter(|entries| !entries.is_empty()) else {
            return "No command history.".to_string();
        };
        let start = entries.len().saturating_sub(HISTORY_WINDOW);
        let mut lines = vec!["Recent commands:".to_string()];
        for (index, entry) in entries.iter().skip(start).enumerate() {
            lines.push(format!(
                "{}. [{}] {}",
                index + 1,
                entry.timestamp,
                entry.command
            ));
        }
        lines.join("\n")
    }

    fn lock_history(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, VecDeque<CommandHistoryEntry>>> {
        self.history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn format_command_result(data: &Value) -> String {
    let text = match data {
        Value::Null => return "Command executed.".to_string(),
        Value::String(text) if text.is_empty() => return "Command executed.".to_string(),
        Value::String(text) => text.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    };
    if text.chars().count() <= REPLY_MAX_CHARS {
        return text;
    }
    let mut truncated = truncate_chars(&text, REPLY_MAX_CHARS);
    truncated.push_str(TRUNCATION_MARKER);
    truncated
}

fn truncate_chars(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

fn help_text(authorized: bool) -> String {
    if !authorized {
        return [
            "Courier control.",
            "",
            "To get started: auth <secret>",
            "Ask the operator for the access secret.",
        ]
        .join("\n");
    }
    [
        "Courier control.",
        "",
        "Session commands:",
        "  link <session_id>   link to a control-plane session",
        "  unlink              drop the current link",
        "  sessions            list active sessions",
        "  status              show the linked session",
        "",
        "Other:",
        "  history             five most recent relayed commands",
        "  help                this menu",
        "",
        "Any other text is relayed to the linked session.",
    ]
    .join("\n")
}
