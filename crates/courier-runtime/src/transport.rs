//! Typed event boundary between the bridge runtime and the messaging
//! transport.
//!
//! The transport is a pure producer of three event classes (message receipt,
//! message update, connection change) plus authentication side-channels. The
//! runtime registers for them at connect time, which keeps the contract
//! testable with synthetic event injection.

use std::sync::{Arc, OnceLock};

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::credentials::CredentialState;

/// Status code the transport uses when the device registration was removed.
/// Terminal: reconnecting is pointless until the operator re-registers.
pub const DISCONNECT_LOGGED_OUT: u16 = 401;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    AuthenticatingQr,
    AuthenticatingPairingCode,
    Connecting,
    Open,
    Closing,
    LoggedOut,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::AuthenticatingQr => "authenticating-qr",
            Self::AuthenticatingPairingCode => "authenticating-pairing-code",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::LoggedOut => "logged-out",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectClass {
    Recoverable,
    Terminal,
}

pub fn classify_disconnect(status_code: Option<u16>) -> DisconnectClass {
    match status_code {
        Some(DISCONNECT_LOGGED_OUT) => DisconnectClass::Terminal,
        _ => DisconnectClass::Recoverable,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting,
    Open,
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionUpdate {
    pub status: ConnectionStatus,
    #[serde(default)]
    pub status_code: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub from_me: bool,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageUpdate {
    pub id: String,
    #[serde(default)]
    pub patch: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    MessagesReceived(Vec<InboundMessage>),
    MessagesUpdated(Vec<MessageUpdate>),
    ConnectionUpdate(ConnectionUpdate),
    CredentialsUpdated(Value),
    QrCode(String),
    PairingCode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Qr,
    PairingCode,
}

/// Answers the transport's historical-lookup callback. Must always return a
/// well-formed message payload.
pub trait MessageLookup: Send + Sync {
    fn lookup_message(&self, id: &str) -> Value;
}

#[async_trait]
pub trait TransportSender: Send + Sync {
    async fn send_text(&self, user_id: &str, text: &str) -> Result<()>;
    async fn request_pairing_code(&self, phone_number: &str) -> Result<()>;
}

/// Live transport session: an event stream plus a cloneable send handle.
pub struct TransportSession {
    pub events: mpsc::Receiver<TransportEvent>,
    pub sender: Arc<dyn TransportSender>,
}

pub struct ConnectOptions {
    pub credentials: CredentialState,
    pub message_lookup: Arc<dyn MessageLookup>,
}

#[async_trait]
pub trait TransportClient: Send + Sync {
    async fn connect(&self, options: ConnectOptions) -> Result<TransportSession>;
}

/// Resolves the first-registration authentication choice when no configured
/// value is supplied. The interactive implementation lives in the binary.
#[async_trait]
pub trait AuthMethodResolver: Send + Sync {
    async fn resolve_method(&self) -> Result<AuthMethod>;
    async fn resolve_phone_number(&self) -> Result<String>;
}

/// Generic command pipeline for inbound text the router does not claim.
#[async_trait]
pub trait PluginHost: Send + Sync {
    async fn handle(&self, sender: Arc<dyn TransportSender>, message: &InboundMessage)
        -> Result<()>;
}

/// Normalizes a phone-number-shaped string to `+<10-15 digits>`, or None when
/// the input cannot be normalized to that pattern.
pub fn normalize_phone_number(raw: &str) -> Option<String> {
    static PHONE_PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PHONE_PATTERN
        .get_or_init(|| Regex::new(r"^\+\d{10,15}$").expect("phone pattern is valid"));

    let stripped: String = raw
        .chars()
        .filter(|ch| ch.is_ascii_digit() || *ch == '+')
        .collect();
    let normalized = if stripped.starts_with('+') {
        stripped
    } else {
        format!("+{stripped}")
    };
    pattern.is_match(&normalized).then_some(normalized)
}
