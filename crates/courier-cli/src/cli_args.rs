use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use courier_runtime::AuthMethod;

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliAuthMethod {
    Qr,
    PairingCode,
}

impl From<CliAuthMethod> for AuthMethod {
    fn from(value: CliAuthMethod) -> Self {
        match value {
            CliAuthMethod::Qr => AuthMethod::Qr,
            CliAuthMethod::PairingCode => AuthMethod::PairingCode,
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "courier",
    about = "Chat bridge relaying authorized commands to an ops control plane",
    version
)]
pub struct Cli {
    #[arg(
        long,
        env = "COURIER_GATEWAY_URL",
        default_value = "ws://127.0.0.1:8055",
        help = "Websocket URL of the messaging gateway process."
    )]
    pub gateway_url: String,

    #[arg(
        long,
        env = "COURIER_CONTROL_PLANE_URL",
        default_value = "http://localhost:3000",
        help = "Base URL of the control plane API."
    )]
    pub control_plane_url: String,

    #[arg(
        long,
        env = "COURIER_API_TOKEN",
        hide_env_values = true,
        help = "Bearer token for control plane requests."
    )]
    pub api_token: String,

    #[arg(
        long,
        env = "COURIER_ACCESS_SECRET",
        hide_env_values = true,
        help = "Shared secret chat users present via `auth <secret>`."
    )]
    pub access_secret: String,

    #[arg(
        long,
        env = "COURIER_STATE_DIR",
        default_value = ".courier",
        help = "Directory holding the persisted credential file."
    )]
    pub state_dir: PathBuf,

    #[arg(
        long,
        env = "COURIER_AUTH_METHOD",
        value_enum,
        help = "Registration method for an unregistered device. Prompted interactively when omitted."
    )]
    pub auth_method: Option<CliAuthMethod>,

    #[arg(
        long,
        env = "COURIER_PHONE_NUMBER",
        help = "Phone number for pairing-code registration, e.g. +27694176088."
    )]
    pub phone_number: Option<String>,

    #[arg(
        long,
        env = "COURIER_MAX_RECONNECT_ATTEMPTS",
        default_value_t = 10,
        help = "Consecutive reconnect attempts before the bridge gives up."
    )]
    pub max_reconnect_attempts: u32,

    #[arg(
        long,
        env = "COURIER_BASE_RECONNECT_DELAY_MS",
        default_value_t = 3_000,
        value_parser = parse_positive_u64,
        help = "First reconnect delay; doubles per attempt up to 60s."
    )]
    pub base_reconnect_delay_ms: u64,

    #[arg(
        long,
        env = "COURIER_COMMAND_TIMEOUT_MS",
        default_value_t = 30_000,
        value_parser = parse_positive_u64,
        help = "Timeout for control plane command relays."
    )]
    pub command_timeout_ms: u64,

    #[arg(
        long,
        env = "COURIER_SESSIONS_TIMEOUT_MS",
        default_value_t = 10_000,
        value_parser = parse_positive_u64,
        help = "Timeout for control plane session listings."
    )]
    pub sessions_timeout_ms: u64,

    #[arg(
        long,
        env = "COURIER_SWEEP_INTERVAL_SECS",
        default_value_t = 3_600,
        value_parser = parse_positive_u64,
        help = "Interval between message cache retention sweeps."
    )]
    pub sweep_interval_secs: u64,
}
