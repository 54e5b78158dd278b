//! WebRocket: a multi-tenant realtime message broker.
//!
//! Browser clients subscribe to named channels inside isolated vhosts over
//! WebSocket; backend applications broadcast into those channels and consume
//! load-balanced work items over a line-framed TCP protocol, majordomo
//! style. The [`Context`] owns the vhost table and the two endpoints.

pub mod backend_endpoint;
pub mod backend_identity;
pub mod backend_proto;
pub mod channel;
pub mod client;
pub mod context;
pub mod error;
pub mod lobby;
pub mod permission;
pub mod status;
pub mod storage;
pub mod subscription;
mod tls;
pub mod vhost;
pub mod websocket_endpoint;
pub mod websocket_proto;
pub mod worker;

pub use backend_endpoint::BackendEndpoint;
pub use backend_identity::{parse_backend_identity, BackendIdentity, SocketType};
pub use channel::{Channel, ChannelType};
pub use client::ClientSession;
pub use context::{default_node_name, Context, COOKIE_SIZE};
pub use error::{ContextError, EndpointError, StorageError, VhostError};
pub use lobby::Lobby;
pub use permission::Permission;
pub use status::Status;
pub use storage::{Storage, VhostRecord};
pub use subscription::Subscription;
pub use vhost::{OpenedChannel, Vhost, ACCESS_TOKEN_LENGTH};
pub use websocket_endpoint::WebsocketEndpoint;
pub use websocket_proto::ClientFrame;
pub use worker::{BackendWorker, WorkerCommand, WorkerState};

/// Broker version, reported by the server binary.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
