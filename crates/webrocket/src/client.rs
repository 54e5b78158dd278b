//! Server-side handle for one WebSocket client connection.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::channel::Channel;
use crate::permission::Permission;

#[derive(Debug, Default)]
struct AuthState {
    /// Authenticated with the vhost's own access token.
    master: bool,
    /// Last single-access token presented via `auth`, not yet validated
    /// against a concrete channel.
    token: Option<String>,
    /// Permissions consumed from the vhost on behalf of this connection.
    granted: Vec<Permission>,
}

/// One connected WebSocket client. Channels address the client through its
/// session id and outbound queue; the connection task owns the socket.
#[derive(Debug)]
pub struct ClientSession {
    sid: String,
    sender: mpsc::UnboundedSender<Value>,
    subscriptions: DashMap<String, Arc<Channel>>,
    auth: Mutex<AuthState>,
}

impl ClientSession {
    /// Creates the session and the receiving end of its outbound queue. The
    /// caller drains the receiver into the socket.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Value>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            sid: Uuid::new_v4().to_string(),
            sender,
            subscriptions: DashMap::new(),
            auth: Mutex::new(AuthState::default()),
        });
        (session, receiver)
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    pub(crate) fn sender(&self) -> mpsc::UnboundedSender<Value> {
        self.sender.clone()
    }

    /// Queues a frame for delivery; best-effort.
    pub fn send(&self, payload: Value) -> bool {
        self.sender.send(payload).is_ok()
    }

    /// Channel shortcuts recorded at subscribe time; drives unsubscription
    /// on disconnect.
    pub(crate) fn subscriptions(&self) -> &DashMap<String, Arc<Channel>> {
        &self.subscriptions
    }

    pub fn authenticate_master(&self) {
        let mut auth = self.auth.lock();
        auth.master = true;
        auth.token = None;
    }

    /// Remembers a single-access token for validation at subscribe time.
    pub fn authenticate_token(&self, token: String) {
        self.auth.lock().token = Some(token);
    }

    pub fn is_master(&self) -> bool {
        self.auth.lock().master
    }

    pub(crate) fn pending_token(&self) -> Option<String> {
        self.auth.lock().token.clone()
    }

    /// Attaches a permission consumed from the vhost's table.
    pub(crate) fn grant(&self, permission: Permission) {
        let mut auth = self.auth.lock();
        auth.token = None;
        auth.granted.push(permission);
    }

    pub fn has_grant_for(&self, channel: &str) -> bool {
        self.auth.lock().granted.iter().any(|p| p.is_matching(channel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission::Permission;

    #[tokio::test]
    async fn sends_land_in_the_outbound_queue() {
        let (client, mut rx) = ClientSession::new();
        assert!(client.send(serde_json::json!({"hello": 1})));
        let frame = rx.try_recv().unwrap();
        assert_eq!(frame["hello"], 1);
    }

    #[tokio::test]
    async fn grants_authorize_matching_channels() {
        let (client, _rx) = ClientSession::new();
        assert!(!client.has_grant_for("private-room"));
        client.grant(Permission::new("joe", "private-.*").unwrap());
        assert!(client.has_grant_for("private-room"));
        assert!(!client.has_grant_for("other"));
    }

    #[tokio::test]
    async fn master_auth_clears_pending_token() {
        let (client, _rx) = ClientSession::new();
        client.authenticate_token("abc".into());
        assert_eq!(client.pending_token().as_deref(), Some("abc"));
        client.authenticate_master();
        assert!(client.is_master());
        assert!(client.pending_token().is_none());
    }
}
