//! Connection lifecycle manager for the bridge.
//!
//! Owns the repeated-session loop: connect the transport, pump its events,
//! classify the disconnect, and either back off and retry or stop. All
//! failure paths (startup errors and mid-session drops) funnel through the
//! same reconnect policy so escalation and the attempt ceiling behave
//! identically no matter where a session died.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, bail, Result};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use courier_core::current_unix_timestamp_ms;

use crate::command_router::CommandRouter;
use crate::credentials::{CredentialState, CredentialStore};
use crate::message_cache::{MessageCache, MESSAGE_RETENTION_MS};
use crate::reconnect::ReconnectPolicy;
use crate::transport::{
    classify_disconnect, normalize_phone_number, AuthMethod, AuthMethodResolver, ConnectOptions,
    ConnectionState, ConnectionStatus, DisconnectClass, InboundMessage, PluginHost,
    TransportClient, TransportEvent, TransportSender,
};

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

const IDLE_TICK: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct BridgeRuntimeConfig {
    pub auth_method: Option<AuthMethod>,
    pub phone_number: Option<String>,
    pub max_reconnect_attempts: u32,
    pub base_reconnect_delay_ms: u64,
    pub sweep_interval: Duration,
}

impl Default for BridgeRuntimeConfig {
    fn default() -> Self {
        Self {
            auth_method: None,
            phone_number: None,
            max_reconnect_attempts: crate::reconnect::DEFAULT_MAX_ATTEMPTS,
            base_reconnect_delay_ms: crate::reconnect::DEFAULT_BASE_DELAY_MS,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// How a completed `run()` ended. Errors (ceiling exhaustion, fatal setup
/// failures) travel the `Err` path instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The transport reported the device registration was removed.
    LoggedOut,
    /// Operator shutdown via ctrl-c.
    Interrupted,
}

enum SessionEnd {
    Disconnected,
    LoggedOut,
    Interrupted,
}

pub struct BridgeRuntime {
    config: BridgeRuntimeConfig,
    transport: Arc<dyn TransportClient>,
    router: Arc<CommandRouter>,
    cache: Arc<MessageCache>,
    credential_store: Arc<dyn CredentialStore>,
    plugin_host: Arc<dyn PluginHost>,
    auth_resolver: Arc<dyn AuthMethodResolver>,
    policy: ReconnectPolicy,
    state: ConnectionState,
    user_queues: HashMap<String, VecDeque<InboundMessage>>,
    active_runs: HashMap<String, JoinHandle<()>>,
}

impl BridgeRuntime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: BridgeRuntimeConfig,
        transport: Arc<dyn TransportClient>,
        router: Arc<CommandRouter>,
        cache: Arc<MessageCache>,
        credential_store: Arc<dyn CredentialStore>,
        plugin_host: Arc<dyn PluginHost>,
        auth_resolver: Arc<dyn AuthMethodResolver>,
    ) -> Self {
        let policy =
            ReconnectPolicy::new(config.max_reconnect_attempts, config.base_reconnect_delay_ms);
        Self {
            config,
            transport,
            router,
            cache,
            credential_store,
            plugin_host,
            auth_resolver,
            policy,
            state: ConnectionState::Disconnected,
            user_queues: HashMap::new(),
            active_runs: HashMap::new(),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state
    }

    /// Runs sessions until a terminal condition. Recoverable session ends and
    /// startup failures both consult the reconnect policy; once the ceiling
    /// is reached the runtime gives up with an error.
    pub async fn run(&mut self) -> Result<ExitReason> {
        loop {
            let session_end = self.run_session().await;
            self.set_state(ConnectionState::Disconnected);

            match session_end {
                Ok(SessionEnd::Interrupted) => {
                    info!("shutdown requested");
                    return Ok(ExitReason::Interrupted);
                }
                Ok(SessionEnd::LoggedOut) => {
                    self.set_state(ConnectionState::LoggedOut);
                    error!(
                        "device registration was removed; delete the credential file and \
                         re-register before restarting"
                    );
                    return Ok(ExitReason::LoggedOut);
                }
                Ok(SessionEnd::Disconnected) => {
                    warn!("transport session ended");
                }
                Err(session_error) => {
                    warn!(error = %session_error, "transport session failed");
                }
            }

            let Some(delay) = self.policy.next_delay() else {
                bail!(
                    "giving up after {} reconnect attempts",
                    self.policy.attempts()
                );
            };
            info!(
                attempt = self.policy.attempts(),
                delay_ms = delay.as_millis() as u64,
                "reconnecting after delay"
            );
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown requested");
                    return Ok(ExitReason::Interrupted);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn run_session(&mut self) -> Result<SessionEnd> {
        let mut credentials = self.credential_store.load()?;
        let pending_pairing = if credentials.registered {
            None
        } else {
            self.resolve_registration().await?
        };

        self.set_state(ConnectionState::Connecting);
        let mut session = self
            .transport
            .connect(ConnectOptions {
                credentials: credentials.clone(),
                message_lookup: self.cache.clone(),
            })
            .await?;

        if let Some(phone_number) = pending_pairing {
            session.sender.request_pairing_code(&phone_number).await?;
        }

        let sweep_period = self.config.sweep_interval.max(Duration::from_millis(1));
        let mut sweep = tokio::time::interval_at(
            tokio::time::Instant::now() + sweep_period,
            sweep_period,
        );
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            self.drain_finished_runs().await;
            self.try_start_queued_runs(&session.sender);

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    return Ok(SessionEnd::Interrupted);
                }
                maybe_event = session.events.recv() => {
                    let Some(event) = maybe_event else {
                        debug!("transport event stream closed");
                        return Ok(SessionEnd::Disconnected);
                    };
                    if let Some(end) = self.handle_event(event, &mut credentials) {
                        return Ok(end);
                    }
                }
                _ = sweep.tick() => {
                    let removed = self
                        .cache
                        .sweep(current_unix_timestamp_ms(), MESSAGE_RETENTION_MS);
                    info!(removed, remaining = self.cache.len(), "message cache sweep");
                }
                _ = tokio::time::sleep(IDLE_TICK) => {}
            }
        }
    }

    /// Decides how an unregistered device authenticates. A configured method
    /// wins; otherwise the injected resolver (interactive in the binary) is
    /// consulted. Returns the validated phone number when pairing was chosen.
    async fn resolve_registration(&mut self) -> Result<Option<String>> {
        let method = match self.config.auth_method {
            Some(method) => method,
            None => self.auth_resolver.resolve_method().await?,
        };
        match method {
            AuthMethod::Qr => {
                self.set_state(ConnectionState::AuthenticatingQr);
                Ok(None)
            }
            AuthMethod::PairingCode => {
                self.set_state(ConnectionState::AuthenticatingPairingCode);
                let configured = self
                    .config
                    .phone_number
                    .as_deref()
                    .and_then(normalize_phone_number);
                if let Some(phone_number) = configured {
                    return Ok(Some(phone_number));
                }
                if self.config.phone_number.is_some() {
                    warn!("configured phone number is not valid; prompting instead");
                }
                let raw = self.auth_resolver.resolve_phone_number().await?;
                let phone_number = normalize_phone_number(&raw)
                    .ok_or_else(|| anyhow!("phone number {raw:?} is not valid"))?;
                Ok(Some(phone_number))
            }
        }
    }

    fn handle_event(
        &mut self,
        event: TransportEvent,
        credentials: &mut CredentialState,
    ) -> Option<SessionEnd> {
        match event {
            TransportEvent::MessagesReceived(messages) => {
                for message in messages {
                    self.handle_inbound_message(message);
                }
            }
            TransportEvent::MessagesUpdated(updates) => {
                for update in updates {
                    self.cache.merge(&update.id, &update.patch);
                }
            }
            TransportEvent::ConnectionUpdate(update) => match update.status {
                ConnectionStatus::Connecting => {
                    self.set_state(ConnectionState::Connecting);
                }
                ConnectionStatus::Open => {
                    self.set_state(ConnectionState::Open);
                    self.policy.reset();
                }
                ConnectionStatus::Close => {
                    self.set_state(ConnectionState::Closing);
                    return match classify_disconnect(update.status_code) {
                        DisconnectClass::Terminal => Some(SessionEnd::LoggedOut),
                        DisconnectClass::Recoverable => {
                            warn!(
                                status_code = update.status_code,
                                "transport connection closed"
                            );
                            Some(SessionEnd::Disconnected)
                        }
                    };
                }
            },
            TransportEvent::CredentialsUpdated(blob) => {
                credentials.registered = true;
                credentials.blob = blob;
                if let Err(save_error) = self.credential_store.save(credentials) {
                    warn!(error = %save_error, "failed to persist credential update");
                }
            }
            TransportEvent::QrCode(payload) => {
                self.set_state(ConnectionState::AuthenticatingQr);
                info!(payload = %payload, "scan this code with the registered device");
            }
            TransportEvent::PairingCode(code) => {
                info!(code = %code, "enter this pairing code on the registered device");
            }
        }
        None
    }

    fn handle_inbound_message(&mut self, message: InboundMessage) {
        if !message.id.is_empty() {
            self.cache.record(
                &message.id,
                message.payload.clone(),
                current_unix_timestamp_ms(),
            );
        }
        if message.from_me || message.text.trim().is_empty() {
            return;
        }
        self.user_queues
            .entry(message.user_id.clone())
            .or_default()
            .push_back(message);
    }

    /// One active run per user; queued texts wait their turn so a slow relay
    /// for one user never blocks another.
    fn try_start_queued_runs(&mut self, sender: &Arc<dyn TransportSender>) {
        let users = self.user_queues.keys().cloned().collect::<Vec<_>>();
        for user in users {
            if self.active_runs.contains_key(&user) {
                continue;
            }
            let Some(message) = self
                .user_queues
                .get_mut(&user)
                .and_then(VecDeque::pop_front)
            else {
                continue;
            };
            let router = self.router.clone();
            let plugin_host = self.plugin_host.clone();
            let sender = sender.clone();
            let handle = tokio::spawn(async move {
                execute_user_run(router, plugin_host, sender, message).await;
            });
            self.active_runs.insert(user, handle);
        }
    }

    async fn drain_finished_runs(&mut self) {
        let finished = self
            .active_runs
            .iter()
            .filter_map(|(user, handle)| handle.is_finished().then(|| user.clone()))
            .collect::<Vec<_>>();
        for user in finished {
            let Some(handle) = self.active_runs.remove(&user) else {
                continue;
            };
            if let Err(join_error) = handle.await {
                warn!(user = %user, error = %join_error, "user run task panicked");
            }
        }
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state != next {
            info!(from = self.state.as_str(), to = next.as_str(), "connection state");
            self.state = next;
        }
    }
}

/// Claim evaluation happens here, at execution time, so an `auth` earlier in
/// a user's queue takes effect before later texts in the same batch are
/// classified.
async fn execute_user_run(
    router: Arc<CommandRouter>,
    plugin_host: Arc<dyn PluginHost>,
    sender: Arc<dyn TransportSender>,
    message: InboundMessage,
) {
    if router.claims(&message.user_id, &message.text) {
        let reply = router.route(&message.user_id, &message.text).await;
        if reply.is_empty() {
            return;
        }
        if let Err(send_error) = sender.send_text(&message.user_id, &reply).await {
            warn!(user = %message.user_id, error = %send_error, "failed to send reply");
        }
    } else if let Err(plugin_error) = plugin_host.handle(sender, &message).await {
        warn!(user = %message.user_id, error = %plugin_error, "plugin pipeline failed");
    }
}
