//! Websocket gateway implementation of the transport contract.
//!
//! One connection per session. The pump task owns both directions: it
//! translates inbound gateway envelopes into [`TransportEvent`]s and drains an
//! outbound frame queue into the sink, which keeps the sender handle cheap to
//! clone and free of socket state. Historical message requests are answered
//! inline from the injected lookup without surfacing to the runtime.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, warn};

use crate::transport::{
    ConnectOptions, ConnectionUpdate, InboundMessage, MessageLookup, MessageUpdate,
    TransportClient, TransportEvent, TransportSender, TransportSession,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const OUTBOUND_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum GatewayEnvelope {
    #[serde(rename = "connection.update")]
    ConnectionUpdate(ConnectionUpdate),
    #[serde(rename = "messages.upsert")]
    MessagesUpsert {
        #[serde(default)]
        messages: Vec<InboundMessage>,
    },
    #[serde(rename = "messages.update")]
    MessagesUpdate {
        #[serde(default)]
        updates: Vec<MessageUpdate>,
    },
    #[serde(rename = "creds.update")]
    CredentialsUpdate {
        #[serde(default)]
        credentials: Value,
    },
    #[serde(rename = "qr")]
    Qr { payload: String },
    #[serde(rename = "pairing.code")]
    PairingCode { code: String },
    #[serde(rename = "message.request")]
    MessageRequest { id: String },
    #[serde(other)]
    Unknown,
}

fn parse_gateway_envelope(message: WsMessage) -> Result<Option<GatewayEnvelope>> {
    match message {
        WsMessage::Text(text) => {
            let envelope = serde_json::from_str::<GatewayEnvelope>(&text)
                .context("failed to parse gateway envelope")?;
            Ok(Some(envelope))
        }
        WsMessage::Binary(bytes) => {
            let text =
                String::from_utf8(bytes.to_vec()).context("invalid utf-8 gateway payload")?;
            let envelope = serde_json::from_str::<GatewayEnvelope>(&text)
                .context("failed to parse gateway envelope")?;
            Ok(Some(envelope))
        }
        WsMessage::Ping(_) | WsMessage::Pong(_) => Ok(None),
        WsMessage::Close(_) => Ok(None),
        WsMessage::Frame(_) => Ok(None),
    }
}

struct SocketSender {
    outbound: mpsc::Sender<WsMessage>,
}

impl SocketSender {
    async fn send_frame(&self, frame: Value) -> Result<()> {
        self.outbound
            .send(WsMessage::Text(frame.to_string().into()))
            .await
            .context("gateway connection closed before frame could be queued")
    }
}

#[async_trait]
impl TransportSender for SocketSender {
    async fn send_text(&self, user_id: &str, text: &str) -> Result<()> {
        self.send_frame(json!({
            "type": "send",
            "to": user_id,
            "message": { "text": text },
        }))
        .await
    }

    async fn request_pairing_code(&self, phone_number: &str) -> Result<()> {
        self.send_frame(json!({
            "type": "pairing.request",
            "phone_number": phone_number,
        }))
        .await
    }
}

pub struct SocketTransport {
    gateway_url: String,
}

impl SocketTransport {
    pub fn new(gateway_url: String) -> Self {
        Self { gateway_url }
    }
}

#[async_trait]
impl TransportClient for SocketTransport {
    async fn connect(&self, options: ConnectOptions) -> Result<TransportSession> {
        let (stream, _response) = connect_async(&self.gateway_url)
            .await
            .with_context(|| format!("failed to connect gateway websocket {}", self.gateway_url))?;
        let (mut sink, source) = stream.split();

        let init = json!({
            "type": "init",
            "credentials": options.credentials,
        });
        sink.send(WsMessage::Text(init.to_string().into()))
            .await
            .context("failed to send gateway init frame")?;

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
        tokio::spawn(pump_session(
            sink,
            source,
            event_tx,
            outbound_rx,
            options.message_lookup,
        ));

        Ok(TransportSession {
            events: event_rx,
            sender: Arc::new(SocketSender {
                outbound: outbound_tx,
            }),
        })
    }
}

async fn pump_session<Sink, Source>(
    mut sink: Sink,
    mut source: Source,
    events: mpsc::Sender<TransportEvent>,
    mut outbound: mpsc::Receiver<WsMessage>,
    message_lookup: Arc<dyn MessageLookup>,
) where
    Sink: futures_util::Sink<WsMessage> + Unpin,
    Sink::Error: std::error::Error + Send + Sync + 'static,
    Source: futures_util::Stream<Item = tokio_tungstenite::tungstenite::Result<WsMessage>> + Unpin,
{
    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    debug!("gateway sender dropped; closing pump");
                    break;
                };
                if let Err(error) = sink.send(frame).await {
                    warn!(%error, "failed to send gateway frame");
                    break;
                }
            }
            inbound = source.next() => {
                let Some(inbound) = inbound else {
                    debug!("gateway stream ended");
                    break;
                };
                let message = match inbound {
                    Ok(message) => message,
                    Err(error) => {
                        warn!(%error, "gateway websocket error");
                        break;
                    }
                };
                let is_close = matches!(message, WsMessage::Close(_));
                match parse_gateway_envelope(message) {
                    Ok(Some(envelope)) => {
                        if !dispatch_envelope(&mut sink, &events, &message_lookup, envelope).await {
                            break;
                        }
                    }
                    Ok(None) => {
                        if is_close {
                            debug!("gateway sent close frame");
                            break;
                        }
                    }
                    Err(error) => {
                        warn!(%error, "skipping malformed gateway envelope");
                    }
                }
            }
        }
    }
    // Dropping `events` closes the stream; the runtime treats that as a
    // recoverable session end unless a terminal close update arrived first.
}

/// Returns false when the event channel is gone and the pump should stop.
async fn dispatch_envelope<Sink>(
    sink: &mut Sink,
    events: &mpsc::Sender<TransportEvent>,
    message_lookup: &Arc<dyn MessageLookup>,
    envelope: GatewayEnvelope,
) -> bool
where
    Sink: futures_util::Sink<WsMessage> + Unpin,
    Sink::Error: std::error::Error + Send + Sync + 'static,
{
    let event = match envelope {
        GatewayEnvelope::ConnectionUpdate(update) => TransportEvent::ConnectionUpdate(update),
        GatewayEnvelope::MessagesUpsert { messages } => {
            TransportEvent::MessagesReceived(messages)
        }
        GatewayEnvelope::MessagesUpdate { updates } => TransportEvent::MessagesUpdated(updates),
        GatewayEnvelope::CredentialsUpdate { credentials } => {
            TransportEvent::CredentialsUpdated(credentials)
        }
        GatewayEnvelope::Qr { payload } => TransportEvent::QrCode(payload),
        GatewayEnvelope::PairingCode { code } => TransportEvent::PairingCode(code),
        GatewayEnvelope::MessageRequest { id } => {
            let response = json!({
                "type": "message.response",
                "id": id,
                "message": message_lookup.lookup_message(&id),
            });
            if let Err(error) = sink.send(WsMessage::Text(response.to_string().into())).await {
                warn!(%error, "failed to answer gateway message request");
                return false;
            }
            return true;
        }
        GatewayEnvelope::Unknown => {
            debug!("ignoring unknown gateway envelope");
            return true;
        }
    };
    events.send(event).await.is_ok()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::transport::ConnectionStatus;

    fn text(frame: Value) -> WsMessage {
        WsMessage::Text(frame.to_string().into())
    }

    #[test]
    fn unit_parses_connection_update_with_status_code() {
        let envelope = parse_gateway_envelope(text(json!({
            "type": "connection.update",
            "status": "close",
            "status_code": 401,
        })))
        .expect("parse")
        .expect("envelope");
        match envelope {
            GatewayEnvelope::ConnectionUpdate(update) => {
                assert_eq!(update.status, ConnectionStatus::Close);
                assert_eq!(update.status_code, Some(401));
            }
            other => panic!("unexpected envelope: {other:?}"),
        }
    }

    #[test]
    fn unit_parses_message_batches() {
        let envelope = parse_gateway_envelope(text(json!({
            "type": "messages.upsert",
            "messages": [
                {"id": "m1", "user_id": "u1", "text": "hello", "payload": {"k": 1}},
            ],
        })))
        .expect("parse")
        .expect("envelope");
        match envelope {
            GatewayEnvelope::MessagesUpsert { messages } => {
                assert_eq!(messages.len(), 1);
                assert_eq!(messages[0].id, "m1");
                assert_eq!(messages[0].text, "hello");
                assert!(!messages[0].from_me);
            }
            other => panic!("unexpected envelope: {other:?}"),
        }
    }

    #[test]
    fn unit_parses_binary_frames_as_utf8_json() {
        let raw = json!({"type": "qr", "payload": "qr-blob"}).to_string();
        let envelope = parse_gateway_envelope(WsMessage::Binary(raw.into_bytes().into()))
            .expect("parse")
            .expect("envelope");
        assert!(matches!(
            envelope,
            GatewayEnvelope::Qr { payload } if payload == "qr-blob"
        ));
    }

    #[test]
    fn unit_control_frames_yield_no_envelope() {
        assert!(parse_gateway_envelope(WsMessage::Ping(vec![].into()))
            .expect("parse")
            .is_none());
        assert!(parse_gateway_envelope(WsMessage::Pong(vec![].into()))
            .expect("parse")
            .is_none());
        assert!(parse_gateway_envelope(WsMessage::Close(None))
            .expect("parse")
            .is_none());
    }

    #[test]
    fn regression_unknown_envelope_types_are_tolerated() {
        let envelope = parse_gateway_envelope(text(json!({
            "type": "presence.update",
            "whatever": true,
        })))
        .expect("parse")
        .expect("envelope");
        assert!(matches!(envelope, GatewayEnvelope::Unknown));
    }

    #[test]
    fn unit_malformed_text_is_an_error() {
        assert!(parse_gateway_envelope(WsMessage::Text("not json".into())).is_err());
    }

    #[tokio::test]
    async fn unit_sender_queues_send_and_pairing_frames() {
        let (outbound_tx, mut outbound_rx) = mpsc::channel(4);
        let sender = SocketSender {
            outbound: outbound_tx,
        };

        sender.send_text("u1", "hello there").await.expect("send");
        sender
            .request_pairing_code("+27694176088")
            .await
            .expect("pairing");

        let first = outbound_rx.recv().await.expect("frame");
        let value: Value = match first {
            WsMessage::Text(text) => serde_json::from_str(&text).expect("json"),
            other => panic!("unexpected frame: {other:?}"),
        };
        assert_eq!(value["type"], "send");
        assert_eq!(value["to"], "u1");
        assert_eq!(value["message"]["text"], "hello there");

        let second = outbound_rx.recv().await.expect("frame");
        let value: Value = match second {
            WsMessage::Text(text) => serde_json::from_str(&text).expect("json"),
            other => panic!("unexpected frame: {other:?}"),
        };
        assert_eq!(value["type"], "pairing.request");
        assert_eq!(value["phone_number"], "+27694176088");
    }
}
