//! DFS client - mounts local storage and (optionally) the coordinating server

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use dfs_core::{validate_filename, ClientConfig, ClientId, DfsError, FileMode, Reply, Request, Result};

use crate::connection_manager::ConnectionManager;
use crate::file::DfsFile;
use crate::local_cache::LocalCacheStore;

/// A mounted DFS
///
/// Mounting always succeeds when the local path is usable, even if the
/// server cannot be reached, so files cached locally stay readable in
/// DREAD mode.
pub struct Dfs {
    local_path: PathBuf,
    store: Arc<LocalCacheStore>,
    conn: Arc<ConnectionManager>,
}

impl Dfs {
    /// Mount with the default client configuration
    ///
    /// Can return `LocalPath` when `local_path` is unusable, and `Network`
    /// when `local_ip` or `server_addr` cannot be resolved or bound.
    pub async fn mount(
        server_addr: &str,
        local_ip: &str,
        local_path: impl AsRef<Path>,
    ) -> Result<Self> {
        Self::mount_with_config(server_addr, local_ip, local_path, ClientConfig::default()).await
    }

    pub async fn mount_with_config(
        server_addr: &str,
        local_ip: &str,
        local_path: impl AsRef<Path>,
        config: ClientConfig,
    ) -> Result<Self> {
        let local_path = local_path.as_ref().to_path_buf();
        let store = Arc::new(LocalCacheStore::open(&local_path)?);
        let conn =
            Arc::new(ConnectionManager::connect(local_ip, server_addr, store.clone(), config).await?);

        info!(
            "Mounted DFS at {:?} (server {}, {})",
            local_path,
            server_addr,
            if conn.is_connected() { "connected" } else { "offline" }
        );

        Ok(Self {
            local_path,
            store,
            conn,
        })
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Server-assigned id of this client, once known
    pub fn client_id(&self) -> Option<ClientId> {
        self.conn.session().client_id()
    }

    /// Try to (re)establish the session with the server
    pub async fn reconnect(&self) -> bool {
        self.conn.probe().await
    }

    /// Whether `name` is available locally for DREAD reads
    pub fn local_file_exists(&self, name: &str) -> Result<bool> {
        validate_filename(name)?;
        Ok(self.store.file_exists_locally(name))
    }

    /// Whether `name` exists anywhere in the DFS
    pub async fn global_file_exists(&self, name: &str) -> Result<bool> {
        validate_filename(name)?;
        if !self.conn.is_connected() {
            return Err(self.conn.disconnected_error());
        }

        match self
            .conn
            .request(Request::Exists {
                filename: name.to_string(),
            })
            .await?
        {
            Reply::Exists { exists } => Ok(exists),
            other => Err(self
                .conn
                .protocol_violation(&format!("unexpected {} reply to exists", other.kind()))),
        }
    }

    /// Names of all files mirrored locally
    pub fn local_files(&self) -> Result<Vec<String>> {
        self.store.list_files()
    }

    /// Open `name` in `mode`, creating it in READ/WRITE modes if needed
    pub async fn open(&self, name: &str, mode: FileMode) -> Result<DfsFile> {
        validate_filename(name)?;
        DfsFile::open(self.conn.clone(), self.store.clone(), name, mode).await
    }

    /// Disconnect from the server
    ///
    /// Fails with `Disconnected` if the session is already offline.
    pub async fn unmount(&self) -> Result<()> {
        if !self.conn.is_connected() {
            return Err(self.conn.disconnected_error());
        }
        self.conn.close().await?;
        info!("Unmounted DFS at {:?}", self.local_path);
        Ok(())
    }
}

impl std::fmt::Debug for Dfs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dfs")
            .field("local_path", &self.local_path)
            .field("session", self.conn.session())
            .finish()
    }
}
