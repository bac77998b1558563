use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use tide_store::{FileBackend, FileBackendConfig, InMemoryBackend, StorageBackend, SyncMode};

use crate::auth::{AllowAll, Authenticator, StaticTokens};
use crate::coordinator::CoordinatorConfig;
use crate::error::{ServerError, ServerResult};
use crate::resync::ResyncPolicy;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Name announced in the handshake and used in logs.
    pub store_name: String,
    pub storage: StorageConfig,
    /// Reject every store, whatever the client asks for.
    pub read_only: bool,
    pub max_connections: usize,
    /// How long a voted transaction may wait for finish or abort.
    pub transaction_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    /// Capacity of each session's outbound queue. A session that lets it
    /// fill up is disconnected.
    pub outbound_queue: usize,
    pub eager_conflict_detection: bool,
    /// Commits remembered for incremental resync.
    pub invalidation_history: usize,
    pub resync: ResyncPolicy,
    pub auth: AuthConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8100)),
            store_name: "main".into(),
            storage: StorageConfig::Memory,
            read_only: false,
            max_connections: 256,
            transaction_timeout_secs: 30,
            handshake_timeout_secs: 10,
            outbound_queue: 1024,
            eager_conflict_detection: true,
            invalidation_history: 100,
            resync: ResyncPolicy::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_toml_str(s: &str) -> ServerResult<Self> {
        let config: Self = toml::from_str(s).map_err(|e| ServerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> ServerResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ServerError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> ServerResult<()> {
        if self.store_name.is_empty() {
            return Err(ServerError::Config("store_name must not be empty".into()));
        }
        if self.max_connections == 0 {
            return Err(ServerError::Config("max_connections must be at least 1".into()));
        }
        if self.outbound_queue == 0 {
            return Err(ServerError::Config("outbound_queue must be at least 1".into()));
        }
        if self.transaction_timeout_secs == 0 {
            return Err(ServerError::Config(
                "transaction_timeout_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_secs(self.transaction_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            eager_conflict_detection: self.eager_conflict_detection,
        }
    }
}

/// Where objects live.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StorageConfig {
    #[default]
    Memory,
    File {
        path: PathBuf,
        #[serde(default)]
        sync_mode: SyncMode,
    },
}

impl StorageConfig {
    pub fn open(&self, read_only: bool) -> ServerResult<Arc<dyn StorageBackend>> {
        match self {
            Self::Memory => Ok(Arc::new(InMemoryBackend::new())),
            Self::File { path, sync_mode } => {
                let backend = FileBackend::open(
                    path,
                    FileBackendConfig {
                        sync_mode: sync_mode.clone(),
                        read_only,
                    },
                )?;
                Ok(Arc::new(backend))
            }
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Accepted bearer tokens. Empty means tokens are not checked.
    pub tokens: Vec<String>,
    pub allow_anonymous: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            tokens: Vec::new(),
            allow_anonymous: true,
        }
    }
}

impl AuthConfig {
    pub fn authenticator(&self) -> Arc<dyn Authenticator> {
        if self.tokens.is_empty() && self.allow_anonymous {
            Arc::new(AllowAll)
        } else {
            Arc::new(StaticTokens::new(self.tokens.clone(), self.allow_anonymous))
        }
    }
}
