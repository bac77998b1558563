use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use tide_protocol::Credentials;

use crate::error::{ClientError, ClientResult};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// `host:port` of the server.
    pub addr: String,
    /// Bearer token for the handshake; anonymous when absent.
    pub token: Option<String>,
    pub read_only: bool,
    /// Maximum number of cached objects; 0 disables the cache.
    pub cache_capacity: usize,
    pub connect_timeout_secs: u64,
    /// Applies to every request except vote and quiesce, which wait for the
    /// commit lock.
    pub request_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8100".into(),
            token: None,
            read_only: false,
            cache_capacity: 10_000,
            connect_timeout_secs: 10,
            request_timeout_secs: 60,
        }
    }
}

impl ClientConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            ..Self::default()
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn from_toml_str(s: &str) -> ClientResult<Self> {
        toml::from_str(s).map_err(|e| ClientError::Config(e.to_string()))
    }

    pub fn from_toml_file(path: &Path) -> ClientResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ClientError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn credentials(&self) -> Credentials {
        match &self.token {
            Some(token) => Credentials::Token(token.clone()),
            None => Credentials::Anonymous,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
