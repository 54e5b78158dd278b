//! The root container: vhost table, node identity and the two endpoints.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions, TryLockError};
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use regex::Regex;
use tracing::{info, warn};

use crate::backend_endpoint::BackendEndpoint;
use crate::channel::ChannelType;
use crate::error::ContextError;
use crate::storage::{Storage, VhostRecord};
use crate::vhost::Vhost;
use crate::websocket_endpoint::WebsocketEndpoint;

/// Size of a node cookie, in bytes.
pub const COOKIE_SIZE: usize = 40;

const DEFAULT_STORAGE_DIR: &str = "/var/lib/webrocket";

static NODE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[A-Za-z0-9_-]+$").expect("node name pattern"));
static VHOST_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/[A-Za-z0-9_\-./]+$").expect("vhost path pattern"));

/// The node name used when none is configured: the sanitized host name, or
/// `webrocket` when no usable one exists.
pub fn default_node_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .and_then(|host| {
            let name: String = host
                .split('.')
                .next()
                .unwrap_or("")
                .chars()
                .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
                .collect();
            (!name.is_empty()).then_some(name)
        })
        .unwrap_or_else(|| "webrocket".to_string())
}

/// Owns the vhosts and at most one endpoint of each kind. Vhost mutation is
/// serialized here; endpoint handler tables are rebuilt under its lock.
pub struct Context {
    node_name: Mutex<String>,
    cookie: Mutex<Option<String>>,
    storage_dir: Mutex<PathBuf>,
    vhosts: Mutex<HashMap<String, Arc<Vhost>>>,
    websocket: Mutex<Option<Arc<WebsocketEndpoint>>>,
    backend: Mutex<Option<Arc<BackendEndpoint>>>,
    /// Open handle to the cookie file; holding it holds the node lock.
    node_lock: Mutex<Option<File>>,
}

impl Context {
    pub fn new() -> Self {
        Self {
            node_name: Mutex::new(default_node_name()),
            cookie: Mutex::new(None),
            storage_dir: Mutex::new(PathBuf::from(DEFAULT_STORAGE_DIR)),
            vhosts: Mutex::new(HashMap::new()),
            websocket: Mutex::new(None),
            backend: Mutex::new(None),
            node_lock: Mutex::new(None),
        }
    }

    pub fn node_name(&self) -> String {
        self.node_name.lock().clone()
    }

    pub fn set_node_name(&self, name: &str) -> Result<(), ContextError> {
        if !NODE_NAME.is_match(name) {
            return Err(ContextError::InvalidNodeName);
        }
        *self.node_name.lock() = name.to_string();
        Ok(())
    }

    pub fn storage_dir(&self) -> PathBuf {
        self.storage_dir.lock().clone()
    }

    pub fn set_storage_dir(&self, dir: impl Into<PathBuf>) {
        *self.storage_dir.lock() = dir.into();
    }

    pub fn cookie(&self) -> Option<String> {
        self.cookie.lock().clone()
    }

    pub fn cookie_path(&self) -> PathBuf {
        self.storage_dir().join(format!("{}.cookie", self.node_name()))
    }

    /// Loads the node cookie from disk, generating and persisting a fresh
    /// one when missing or when `force` is set. The file is created with
    /// mode 0600.
    pub fn generate_cookie(&self, force: bool) -> Result<(), ContextError> {
        let path = self.cookie_path();
        if !force {
            if let Ok(existing) = fs::read_to_string(&path) {
                if existing.len() == COOKIE_SIZE {
                    *self.cookie.lock() = Some(existing);
                    return Ok(());
                }
            }
        }
        let cookie: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(COOKIE_SIZE)
            .map(char::from)
            .collect();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, &cookie)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(&path, perms)?;
        }
        *self.cookie.lock() = Some(cookie);
        Ok(())
    }

    /// Claims exclusive ownership of this node name by taking an advisory
    /// lock on the cookie file itself, held for the context's lifetime. A
    /// second process claiming the same node must fail here.
    pub fn lock_node(&self) -> Result<(), ContextError> {
        let path = self.cookie_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        match file.try_lock() {
            Ok(()) => {
                *self.node_lock.lock() = Some(file);
                Ok(())
            }
            Err(TryLockError::WouldBlock) => Err(ContextError::NodeLocked(self.node_name())),
            Err(TryLockError::Error(err)) => Err(err.into()),
        }
    }

    /// Releases the node lock by dropping the cookie file handle.
    pub fn unlock_node(&self) {
        self.node_lock.lock().take();
    }

    pub fn add_vhost(&self, path: &str) -> Result<Arc<Vhost>, ContextError> {
        if !VHOST_PATH.is_match(path) {
            return Err(ContextError::InvalidVhostPath);
        }
        let vhost = {
            let mut vhosts = self.vhosts.lock();
            if vhosts.contains_key(path) {
                return Err(ContextError::VhostExists);
            }
            let vhost = Arc::new(Vhost::new(path));
            vhosts.insert(path.to_string(), Arc::clone(&vhost));
            vhost
        };
        self.register_vhost(&vhost);
        self.persist();
        info!(vhost = %path, "vhost added");
        Ok(vhost)
    }

    /// Removes the vhost and kills its channels and lobby.
    pub fn delete_vhost(&self, path: &str) -> Result<(), ContextError> {
        let Some(vhost) = self.vhosts.lock().remove(path) else {
            return Err(ContextError::VhostNotFound);
        };
        if let Some(websocket) = self.websocket.lock().as_ref() {
            websocket.unregister_vhost(path);
        }
        if let Some(backend) = self.backend.lock().as_ref() {
            backend.unregister_vhost(path);
        }
        vhost.kill();
        self.persist();
        info!(vhost = %path, "vhost deleted");
        Ok(())
    }

    pub fn vhost(&self, path: &str) -> Result<Arc<Vhost>, ContextError> {
        self.vhosts
            .lock()
            .get(path)
            .cloned()
            .ok_or(ContextError::VhostNotFound)
    }

    pub fn vhosts(&self) -> Vec<Arc<Vhost>> {
        self.vhosts.lock().values().cloned().collect()
    }

    /// Creates the websocket endpoint. One-shot: a second call fails
    /// instead of replacing the first endpoint.
    pub fn new_websocket_endpoint(
        &self,
        addr: &str,
    ) -> Result<Arc<WebsocketEndpoint>, ContextError> {
        let current = self.vhosts();
        let mut slot = self.websocket.lock();
        if slot.is_some() {
            return Err(ContextError::WebsocketEndpointExists);
        }
        let endpoint = WebsocketEndpoint::new(addr);
        for vhost in &current {
            endpoint.register_vhost(vhost);
        }
        *slot = Some(Arc::clone(&endpoint));
        Ok(endpoint)
    }

    /// Creates the backend endpoint. One-shot, like the websocket side.
    pub fn new_backend_endpoint(&self, addr: &str) -> Result<Arc<BackendEndpoint>, ContextError> {
        let current = self.vhosts();
        let mut slot = self.backend.lock();
        if slot.is_some() {
            return Err(ContextError::BackendEndpointExists);
        }
        let endpoint = BackendEndpoint::new(addr);
        for vhost in &current {
            endpoint.register_vhost(vhost);
        }
        *slot = Some(Arc::clone(&endpoint));
        Ok(endpoint)
    }

    pub fn websocket_endpoint(&self) -> Option<Arc<WebsocketEndpoint>> {
        self.websocket.lock().clone()
    }

    pub fn backend_endpoint(&self) -> Option<Arc<BackendEndpoint>> {
        self.backend.lock().clone()
    }

    /// Tears down both endpoints. Idempotent and safe to call when no
    /// endpoint was ever created.
    pub fn kill(&self) {
        if let Some(websocket) = self.websocket.lock().as_ref() {
            websocket.kill();
        }
        if let Some(backend) = self.backend.lock().as_ref() {
            backend.kill();
        }
    }

    /// Recreates vhosts and their named channels from the stored
    /// configuration.
    pub fn load(&self) -> Result<(), ContextError> {
        for record in self.storage().load()? {
            let vhost = {
                let mut vhosts = self.vhosts.lock();
                if vhosts.contains_key(&record.path) {
                    continue;
                }
                let vhost = Arc::new(Vhost::new(&record.path));
                vhost.set_access_token(record.access_token);
                vhosts.insert(record.path.clone(), Arc::clone(&vhost));
                vhost
            };
            for name in &record.channels {
                if let Err(err) = vhost.open_channel(name, ChannelType::from_name(name)) {
                    warn!(vhost = %record.path, channel = %name, error = %err, "skipping stored channel");
                }
            }
            self.register_vhost(&vhost);
            info!(vhost = %record.path, "vhost restored");
        }
        Ok(())
    }

    /// Writes the current vhost configuration to the storage directory.
    pub fn save(&self) -> Result<(), ContextError> {
        let mut records: Vec<VhostRecord> = self
            .vhosts()
            .iter()
            .map(|vhost| VhostRecord {
                path: vhost.path().to_string(),
                access_token: vhost.access_token(),
                channels: vhost
                    .channels()
                    .iter()
                    .map(|channel| channel.name().to_string())
                    .collect(),
            })
            .collect();
        records.sort_by(|a, b| a.path.cmp(&b.path));
        self.storage().save(&records)?;
        Ok(())
    }

    fn storage(&self) -> Storage {
        Storage::new(&self.storage_dir(), &self.node_name())
    }

    fn register_vhost(&self, vhost: &Arc<Vhost>) {
        if let Some(websocket) = self.websocket.lock().as_ref() {
            websocket.register_vhost(vhost);
        }
        if let Some(backend) = self.backend.lock().as_ref() {
            backend.register_vhost(vhost);
        }
    }

    fn persist(&self) {
        if let Err(err) = self.save() {
            warn!(error = %err, "failed to persist vhost configuration");
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.unlock_node();
    }
}
