//! Bridge runtime for the Courier messaging relay.
//!
//! Hosts the connection lifecycle manager, the time-bounded message cache,
//! the authorization store, and the command router that relays authorized
//! chat commands to a remote control plane.

pub mod access_store;
pub mod command_router;
pub mod control_plane;
pub mod credentials;
pub mod message_cache;
pub mod reconnect;
pub mod runtime;
pub mod socket_transport;
pub mod transport;

pub use access_store::AccessStore;
pub use command_router::{CommandRouter, HISTORY_CAP, HISTORY_WINDOW, REPLY_MAX_CHARS};
pub use control_plane::{ControlPlaneClient, ControlPlaneError, ControlPlaneSession};
pub use credentials::{CredentialState, CredentialStore, FileCredentialStore};
pub use message_cache::{MessageCache, MESSAGE_RETENTION_MS};
pub use reconnect::ReconnectPolicy;
pub use runtime::{BridgeRuntime, BridgeRuntimeConfig, ExitReason};
pub use socket_transport::SocketTransport;
pub use transport::{
    classify_disconnect, normalize_phone_number, AuthMethod, AuthMethodResolver, ConnectOptions,
    ConnectionState, ConnectionStatus, ConnectionUpdate, DisconnectClass, InboundMessage,
    MessageLookup, MessageUpdate, PluginHost, TransportClient, TransportEvent, TransportSender,
    TransportSession, DISCONNECT_LOGGED_OUT,
};
