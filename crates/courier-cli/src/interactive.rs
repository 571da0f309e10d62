//! Interactive fallbacks used when registration settings are not configured.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::debug;

use courier_runtime::transport::{
    normalize_phone_number, AuthMethod, AuthMethodResolver, InboundMessage, PluginHost,
    TransportSender,
};

/// Prompts on stdin for the registration method and phone number. Loops until
/// the operator provides something usable.
pub struct StdinAuthResolver;

impl StdinAuthResolver {
    async fn prompt_line(prompt: &str) -> Result<String> {
        let mut stdout = tokio::io::stdout();
        stdout
            .write_all(prompt.as_bytes())
            .await
            .context("failed to write prompt")?;
        stdout.flush().await.context("failed to flush prompt")?;

        let mut line = String::new();
        let mut reader = BufReader::new(tokio::io::stdin());
        let read = reader
            .read_line(&mut line)
            .await
            .context("failed to read stdin")?;
        if read == 0 {
            anyhow::bail!("stdin closed during interactive prompt");
        }
        Ok(line.trim().to_string())
    }
}

#[async_trait]
impl AuthMethodResolver for StdinAuthResolver {
    async fn resolve_method(&self) -> Result<AuthMethod> {
        loop {
            let answer =
                Self::prompt_line("Register this device with (1) QR code or (2) pairing code? ")
                    .await?;
            match answer.as_str() {
                "1" | "qr" => return Ok(AuthMethod::Qr),
                "2" | "pairing-code" | "pairing" => return Ok(AuthMethod::PairingCode),
                other => println!("Unrecognized choice {other:?}; enter 1 or 2."),
            }
        }
    }

    async fn resolve_phone_number(&self) -> Result<String> {
        loop {
            let answer =
                Self::prompt_line("Phone number for pairing (e.g. +27694176088): ").await?;
            if let Some(normalized) = normalize_phone_number(&answer) {
                return Ok(normalized);
            }
            println!("That does not look like a valid number; use + followed by 10-15 digits.");
        }
    }
}

/// Default collaborator for text the command router does not claim. The
/// generic plugin pipeline plugs in here; out of the box we only log.
pub struct LogOnlyPluginHost;

#[async_trait]
impl PluginHost for LogOnlyPluginHost {
    async fn handle(
        &self,
        _sender: Arc<dyn TransportSender>,
        message: &InboundMessage,
    ) -> Result<()> {
        debug!(
            user = %message.user_id,
            id = %message.id,
            "no plugin claimed inbound message"
        );
        Ok(())
    }
}
