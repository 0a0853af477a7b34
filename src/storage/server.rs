//! Embedded server lifecycle: data directory, ports, endpoints.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;

use super::client::KvClient;
use super::error::StorageError;
use super::store::KvStore;

const STORE_FILE: &str = "kv.redb";

/// Configuration for an embedded server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port advertised to clients. Zero binds an ephemeral port.
    pub client_port: u16,
    /// Port reserved for peer traffic. Zero binds an ephemeral port.
    pub peer_port: u16,
    /// Directory holding the store's tables. Created if absent.
    pub data_dir: PathBuf,
}

impl ServerConfig {
    #[must_use]
    pub fn new(client_port: u16, peer_port: u16, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            client_port,
            peer_port,
            data_dir: data_dir.into(),
        }
    }
}

/// An embedded KV server: a [`KvStore`] persisted under the configured data
/// directory, with its ports held for the lifetime of the server.
///
/// Clients in this process reach the store through [`KvClient`] handles; the
/// listeners keep the advertised endpoints reserved until [`stop`].
///
/// [`stop`]: EmbeddedServer::stop
pub struct EmbeddedServer {
    store: Arc<KvStore>,
    client_endpoints: Vec<String>,
    _client_listener: TcpListener,
    _peer_listener: TcpListener,
}

impl EmbeddedServer {
    /// Starts the server: creates the data directory, opens the store, and
    /// binds both ports.
    pub async fn start(config: ServerConfig) -> Result<Self, StorageError> {
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .map_err(|err| StorageError::Io(err.to_string()))?;

        let path = config.data_dir.join(STORE_FILE);
        let store = tokio::task::spawn_blocking(move || KvStore::open(&path))
            .await
            .map_err(|err| StorageError::Io(err.to_string()))??;

        let client_listener = bind("127.0.0.1", config.client_port).await?;
        let peer_listener = bind("127.0.0.1", config.peer_port).await?;

        let client_addr = client_listener
            .local_addr()
            .map_err(|err| StorageError::Io(err.to_string()))?;
        let client_endpoints = vec![format!("http://{client_addr}")];

        tracing::info!(
            endpoint = %client_endpoints[0],
            data_dir = %config.data_dir.display(),
            "embedded kv server started"
        );

        Ok(Self {
            store,
            client_endpoints,
            _client_listener: client_listener,
            _peer_listener: peer_listener,
        })
    }

    /// Returns a fresh client handle.
    #[must_use]
    pub fn client(&self) -> KvClient {
        KvClient::new(Arc::clone(&self.store))
    }

    /// The advertised client endpoint URLs, in order.
    #[must_use]
    pub fn client_endpoints(&self) -> &[String] {
        &self.client_endpoints
    }

    /// Shuts the store down. Idempotent; pending watch streams end and the
    /// data directory is released.
    pub async fn stop(&self) {
        let store = Arc::clone(&self.store);
        if let Err(err) = tokio::task::spawn_blocking(move || store.shutdown()).await {
            tracing::warn!(error = %err, "embedded kv server shutdown task failed");
        }
        tracing::info!("embedded kv server stopped");
    }
}

async fn bind(host: &str, port: u16) -> Result<TcpListener, StorageError> {
    TcpListener::bind((host, port))
        .await
        .map_err(|err| StorageError::Io(format!("failed to bind port {port}: {err}")))
}
