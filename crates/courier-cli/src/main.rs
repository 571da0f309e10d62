mod cli_args;
mod interactive;

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

use courier_runtime::{
    AccessStore, BridgeRuntime, BridgeRuntimeConfig, CommandRouter, ControlPlaneClient,
    ExitReason, FileCredentialStore, MessageCache, SocketTransport,
};

use crate::cli_args::Cli;
use crate::interactive::{LogOnlyPluginHost, StdinAuthResolver};

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    std::fs::create_dir_all(&cli.state_dir).with_context(|| {
        format!("failed to create state directory {}", cli.state_dir.display())
    })?;
    let credential_store = Arc::new(FileCredentialStore::new(
        cli.state_dir.join("credentials.json"),
    ));

    let control_plane = ControlPlaneClient::new(
        cli.control_plane_url,
        cli.api_token,
        cli.command_timeout_ms,
        cli.sessions_timeout_ms,
    )?;
    let router = Arc::new(CommandRouter::new(
        Arc::new(AccessStore::new()),
        control_plane,
        cli.access_secret,
    ));

    let config = BridgeRuntimeConfig {
        auth_method: cli.auth_method.map(Into::into),
        phone_number: cli.phone_number,
        max_reconnect_attempts: cli.max_reconnect_attempts,
        base_reconnect_delay_ms: cli.base_reconnect_delay_ms,
        sweep_interval: Duration::from_secs(cli.sweep_interval_secs),
    };
    let mut runtime = BridgeRuntime::new(
        config,
        Arc::new(SocketTransport::new(cli.gateway_url)),
        router,
        Arc::new(MessageCache::new()),
        credential_store,
        Arc::new(LogOnlyPluginHost),
        Arc::new(StdinAuthResolver),
    );

    match runtime.run().await? {
        ExitReason::LoggedOut => info!("bridge stopped: device registration removed"),
        ExitReason::Interrupted => info!("bridge stopped"),
    }
    Ok(())
}
