//! Persistence for the transport's opaque credential blob.
//!
//! The core never interprets the blob beyond the registration flag: it loads
//! the state at startup and writes it back whenever the transport signals a
//! credential change.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use courier_core::write_text_atomic;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CredentialState {
    #[serde(default)]
    pub registered: bool,
    #[serde(default)]
    pub blob: Value,
}

pub trait CredentialStore: Send + Sync {
    fn load(&self) -> Result<CredentialState>;
    fn save(&self, state: &CredentialState) -> Result<()>;
}

pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> Result<CredentialState> {
        if !self.path.exists() {
            return Ok(CredentialState::default());
        }
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read credential file {}", self.path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse credential file {}", self.path.display()))
    }

    fn save(&self, state: &CredentialState) -> Result<()> {
        let mut payload =
            serde_json::to_string_pretty(state).context("failed to serialize credential state")?;
        payload.push('\n');
        write_text_atomic(&self.path, &payload)
            .with_context(|| format!("failed to write credential file {}", self.path.display()))
    }
}
