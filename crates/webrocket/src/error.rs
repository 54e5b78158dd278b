use thiserror::Error;

/// Errors raised by vhost-level operations.
#[derive(Debug, Error)]
pub enum VhostError {
    #[error("invalid channel name")]
    InvalidChannelName,
    #[error("channel doesn't exist")]
    ChannelNotFound,
    #[error("invalid permission pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

/// Errors raised by the context while managing vhosts, endpoints and the
/// node's on-disk state.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("vhost already exists")]
    VhostExists,
    #[error("vhost doesn't exist")]
    VhostNotFound,
    #[error("invalid vhost path")]
    InvalidVhostPath,
    #[error("invalid node name")]
    InvalidNodeName,
    #[error("websocket endpoint already registered")]
    WebsocketEndpointExists,
    #[error("backend endpoint already registered")]
    BackendEndpointExists,
    #[error("node '{0}' is locked by another process")]
    NodeLocked(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised by the endpoint listeners.
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("endpoint has been killed")]
    Killed,
    #[error("no live lobby for this vhost")]
    LobbyClosed,
    #[error("tls setup failed: {0}")]
    Tls(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised by the vhost configuration store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage io: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}
