//! End-to-end bridge tests against an in-process websocket gateway and a
//! mock control plane.

use std::{sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use httpmock::prelude::*;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, tungstenite::Message as WsMessage, WebSocketStream};

use courier_runtime::{
    AccessStore, BridgeRuntime, BridgeRuntimeConfig, CommandRouter, ControlPlaneClient,
    CredentialState, CredentialStore, ExitReason, FileCredentialStore, MessageCache,
    SocketTransport,
    transport::{AuthMethod, AuthMethodResolver, InboundMessage, PluginHost, TransportSender},
};

const SECRET: &str = "integration-secret";

struct NoopPluginHost;

#[async_trait]
impl PluginHost for NoopPluginHost {
    async fn handle(
        &self,
        _sender: Arc<dyn TransportSender>,
        _message: &InboundMessage,
    ) -> Result<()> {
        Ok(())
    }
}

struct NoResolver;

#[async_trait]
impl AuthMethodResolver for NoResolver {
    async fn resolve_method(&self) -> Result<AuthMethod> {
        bail!("registration should not be required")
    }

    async fn resolve_phone_number(&self) -> Result<String> {
        bail!("registration should not be required")
    }
}

fn build_runtime(
    gateway_url: String,
    control_plane_url: &str,
    state_dir: &std::path::Path,
) -> Result<BridgeRuntime> {
    let credential_store = FileCredentialStore::new(state_dir.join("credentials.json"));
    credential_store.save(&CredentialState {
        registered: true,
        blob: json!({"device": "test"}),
    })?;

    let control_plane = ControlPlaneClient::new(
        control_plane_url.to_string(),
        "token-123".to_string(),
        2_000,
        2_000,
    )?;
    let router = Arc::new(CommandRouter::new(
        Arc::new(AccessStore::new()),
        control_plane,
        SECRET.to_string(),
    ));
    let config = BridgeRuntimeConfig {
        max_reconnect_attempts: 3,
        base_reconnect_delay_ms: 1,
        ..BridgeRuntimeConfig::default()
    };
    Ok(BridgeRuntime::new(
        config,
        Arc::new(SocketTransport::new(gateway_url)),
        router,
        Arc::new(MessageCache::new()),
        Arc::new(credential_store),
        Arc::new(NoopPluginHost),
        Arc::new(NoResolver),
    ))
}

async fn send_json(socket: &mut WebSocketStream<TcpStream>, frame: Value) -> Result<()> {
    socket
        .send(WsMessage::Text(frame.to_string().into()))
        .await
        .context("gateway failed to send frame")
}

/// Next JSON frame from the bridge, skipping websocket control frames.
async fn recv_json(socket: &mut WebSocketStream<TcpStream>) -> Result<Value> {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .context("timed out waiting for bridge frame")?
            .context("bridge closed the socket")??;
        match message {
            WsMessage::Text(text) => return Ok(serde_json::from_str(&text)?),
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            other => bail!("unexpected websocket frame: {other:?}"),
        }
    }
}

fn connection_update(status: &str, status_code: Option<u16>) -> Value {
    json!({
        "type": "connection.update",
        "status": status,
        "status_code": status_code,
    })
}

#[tokio::test]
async fn functional_auth_link_relay_roundtrip_over_the_gateway() -> Result<()> {
    let control_plane = MockServer::start();
    let relay = control_plane.mock(|when, then| {
        when.method(POST)
            .path("/api/command")
            .header("authorization", "Bearer token-123")
            .body_includes("\"session_id\":\"abc123\"")
            .body_includes("\"command\":\"whoami\"");
        then.status(200).json_body(json!({"data": "root"}));
    });

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let gateway_url = format!("ws://{}", listener.local_addr()?);

    let gateway = tokio::spawn(async move {
        let (stream, _addr) = listener.accept().await?;
        let mut socket = accept_async(stream).await?;

        let init = recv_json(&mut socket).await?;
        assert_eq!(init["type"], "init");
        assert_eq!(init["credentials"]["registered"], true);

        send_json(&mut socket, connection_update("open", None)).await?;
        send_json(
            &mut socket,
            json!({
                "type": "messages.upsert",
                "messages": [
                    {"id": "m1", "user_id": "u1", "text": format!("auth {SECRET}"),
                     "payload": {"conversation": format!("auth {SECRET}")}},
                    {"id": "m2", "user_id": "u1", "text": "link abc123",
                     "payload": {"conversation": "link abc123"}},
                    {"id": "m3", "user_id": "u1", "text": "whoami",
                     "payload": {"conversation": "whoami"}},
                ],
            }),
        )
        .await?;

        let mut replies = Vec::new();
        while replies.len() < 3 {
            let frame = recv_json(&mut socket).await?;
            assert_eq!(frame["type"], "send");
            assert_eq!(frame["to"], "u1");
            replies.push(frame["message"]["text"].as_str().unwrap_or_default().to_string());
        }
        assert!(replies[0].starts_with("Authorized."));
        assert!(replies[1].contains("abc123"));
        assert!(replies[2].contains("root"));

        // Historical lookup is answered from the cache without involving the
        // runtime loop.
        send_json(&mut socket, json!({"type": "message.request", "id": "m3"})).await?;
        let response = recv_json(&mut socket).await?;
        assert_eq!(response["type"], "message.response");
        assert_eq!(response["id"], "m3");
        assert_eq!(response["message"]["conversation"], "whoami");

        send_json(&mut socket, json!({"type": "message.request", "id": "missing"})).await?;
        let response = recv_json(&mut socket).await?;
        assert_eq!(
            response["message"]["conversation"],
            "message not found in cache"
        );

        send_json(&mut socket, connection_update("close", Some(401))).await?;
        anyhow::Ok(())
    });

    let state_dir = tempfile::tempdir()?;
    let mut runtime = build_runtime(gateway_url, &control_plane.base_url(), state_dir.path())?;
    let exit = runtime.run().await?;
    assert_eq!(exit, ExitReason::LoggedOut);

    gateway.await??;
    relay.assert();
    Ok(())
}

#[tokio::test]
async fn functional_recoverable_close_reconnects_until_logged_out() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let gateway_url = format!("ws://{}", listener.local_addr()?);

    let gateway = tokio::spawn(async move {
        // First session drops with a recoverable status.
        let (stream, _addr) = listener.accept().await?;
        let mut socket = accept_async(stream).await?;
        let init = recv_json(&mut socket).await?;
        assert_eq!(init["type"], "init");
        send_json(&mut socket, connection_update("open", None)).await?;
        send_json(&mut socket, connection_update("close", Some(500))).await?;

        // The bridge backs off and connects again; this one is terminal.
        let (stream, _addr) = listener.accept().await?;
        let mut socket = accept_async(stream).await?;
        let init = recv_json(&mut socket).await?;
        assert_eq!(init["type"], "init");
        send_json(&mut socket, connection_update("open", None)).await?;
        send_json(&mut socket, connection_update("close", Some(401))).await?;
        anyhow::Ok(())
    });

    let control_plane = MockServer::start();
    let state_dir = tempfile::tempdir()?;
    let mut runtime = build_runtime(gateway_url, &control_plane.base_url(), state_dir.path())?;
    let exit = runtime.run().await?;
    assert_eq!(exit, ExitReason::LoggedOut);

    gateway.await??;
    Ok(())
}
