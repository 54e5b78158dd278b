use std::sync::{Arc, Weak};

use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::client::ClientSession;

/// A single channel subscriber: the client's outbound queue, a hidden flag
/// and the presence metadata attached at subscribe time. The client itself
/// is held weakly so a dead connection can be collected.
#[derive(Debug, Clone)]
pub struct Subscription {
    sid: String,
    client: Weak<ClientSession>,
    sender: mpsc::UnboundedSender<Value>,
    hidden: bool,
    data: Map<String, Value>,
}

impl Subscription {
    pub(crate) fn new(client: &Arc<ClientSession>, hidden: bool, data: Map<String, Value>) -> Self {
        Self {
            sid: client.sid().to_string(),
            client: Arc::downgrade(client),
            sender: client.sender(),
            hidden,
            data,
        }
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden
    }

    /// The metadata shared with other presence-channel members; always
    /// carries `sid` and `channel`.
    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    pub(crate) fn client(&self) -> Option<Arc<ClientSession>> {
        self.client.upgrade()
    }

    /// Best-effort delivery; a dropped receiver means the connection is gone.
    pub(crate) fn send(&self, payload: Value) -> bool {
        self.sender.send(payload).is_ok()
    }
}
