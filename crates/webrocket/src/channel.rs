//! Channels: named subscriber sets within a vhost.
//!
//! A channel fans broadcast payloads out to its subscribers. Presence
//! channels additionally announce joins and departures to the remaining
//! members, carrying the per-member metadata attached at subscribe time.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;
use regex::Regex;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

use crate::client::ClientSession;
use crate::error::VhostError;
use crate::subscription::Subscription;
use crate::websocket_proto as proto;

static CHANNEL_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w\d_][\w\d\-_.]*$").expect("channel name pattern"));

/// Depth of the per-channel fan-out queue.
const FANOUT_QUEUE: usize = 256;

pub fn is_valid_name(name: &str) -> bool {
    CHANNEL_NAME.is_match(name)
}

/// Channel flavor, derived from the name prefix at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelType {
    Normal,
    Private,
    Presence,
}

impl ChannelType {
    pub fn from_name(name: &str) -> Self {
        match name.split_once('-') {
            Some(("presence", _)) => Self::Presence,
            Some(("private", _)) => Self::Private,
            _ => Self::Normal,
        }
    }

    /// Presence channels require authorization too.
    pub fn is_private(self) -> bool {
        matches!(self, Self::Private | Self::Presence)
    }

    pub fn is_presence(self) -> bool {
        matches!(self, Self::Presence)
    }
}

struct Fanout {
    targets: Vec<Subscription>,
    payload: Value,
    include_hidden: bool,
}

fn deliver(job: Fanout) {
    for subscription in &job.targets {
        if subscription.is_hidden() && !job.include_hidden {
            continue;
        }
        subscription.send(job.payload.clone());
    }
}

#[derive(Debug)]
struct ChannelState {
    subscribers: HashMap<String, Subscription>,
    alive: bool,
}

/// A named subscriber set. All operations no-op once the channel is killed.
#[derive(Debug)]
pub struct Channel {
    name: String,
    kind: ChannelType,
    state: Mutex<ChannelState>,
    fanout: mpsc::Sender<Fanout>,
    shutdown: Arc<Notify>,
}

impl Channel {
    /// Validates the name and starts the channel's fan-out task.
    pub(crate) fn new(name: &str, kind: ChannelType) -> Result<Arc<Self>, VhostError> {
        if !is_valid_name(name) {
            return Err(VhostError::InvalidChannelName);
        }
        let (fanout, mut jobs) = mpsc::channel::<Fanout>(FANOUT_QUEUE);
        let shutdown = Arc::new(Notify::new());
        let stop = Arc::clone(&shutdown);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.notified() => {
                        // Flush the teardown events queued just before the
                        // kill, then exit.
                        while let Ok(job) = jobs.try_recv() {
                            deliver(job);
                        }
                        break;
                    }
                    job = jobs.recv() => {
                        let Some(job) = job else { break };
                        deliver(job);
                    }
                }
            }
        });
        Ok(Arc::new(Self {
            name: name.to_string(),
            kind,
            state: Mutex::new(ChannelState {
                subscribers: HashMap::new(),
                alive: true,
            }),
            fanout,
            shutdown,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ChannelType {
        self.kind
    }

    pub fn is_alive(&self) -> bool {
        self.state.lock().alive
    }

    pub fn has_subscriber(&self, sid: &str) -> bool {
        self.state.lock().subscribers.contains_key(sid)
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    /// Adds the client to the subscriber set. Idempotent; silent on a dead
    /// channel. Confirms with `:subscribed` (including a member snapshot on
    /// presence channels) and, for visible presence joins, announces
    /// `:memberJoined` to every member.
    pub(crate) fn subscribe(
        self: &Arc<Self>,
        client: &Arc<ClientSession>,
        hidden: bool,
        mut data: Map<String, Value>,
    ) {
        let mut state = self.state.lock();
        if !state.alive || state.subscribers.contains_key(client.sid()) {
            return;
        }
        data.insert("sid".into(), Value::String(client.sid().to_string()));
        data.insert("channel".into(), Value::String(self.name.clone()));
        let snapshot = self.kind.is_presence().then(|| {
            state
                .subscribers
                .values()
                .filter(|s| !s.is_hidden())
                .map(|s| Value::Object(s.data().clone()))
                .collect::<Vec<_>>()
        });
        client.send(proto::subscribed(&self.name, snapshot));
        state.subscribers.insert(
            client.sid().to_string(),
            Subscription::new(client, hidden, data.clone()),
        );
        client.subscriptions().insert(self.name.clone(), Arc::clone(self));
        drop(state);
        debug!(channel = %self.name, sid = %client.sid(), "subscribed");
        if self.kind.is_presence() && !hidden {
            self.broadcast(proto::member_joined(data), true);
        }
    }

    /// Removes the client from the subscriber set. Idempotent; sends
    /// `:unsubscribed` only when `confirm` is set. Visible departures from
    /// presence channels announce `:memberLeft` carrying the stored metadata.
    pub(crate) fn unsubscribe(
        &self,
        client: &Arc<ClientSession>,
        mut data: Map<String, Value>,
        confirm: bool,
    ) {
        let mut state = self.state.lock();
        if !state.alive {
            return;
        }
        let Some(subscription) = state.subscribers.remove(client.sid()) else {
            return;
        };
        if confirm {
            client.send(proto::unsubscribed(&self.name));
        }
        client.subscriptions().remove(&self.name);
        drop(state);
        debug!(channel = %self.name, sid = %client.sid(), "unsubscribed");
        if self.kind.is_presence() && !subscription.is_hidden() {
            for (key, value) in subscription.data() {
                data.insert(key.clone(), value.clone());
            }
            data.insert("sid".into(), Value::String(client.sid().to_string()));
            data.insert("channel".into(), Value::String(self.name.clone()));
            self.broadcast(proto::member_left(data), true);
        }
    }

    /// Fans the payload out to a point-in-time snapshot of the subscriber
    /// set. Delivery happens on the channel's fan-out task; per-subscriber
    /// failures never abort the sweep.
    pub fn broadcast(&self, payload: Value, include_hidden: bool) {
        let targets = {
            let state = self.state.lock();
            if !state.alive {
                return;
            }
            state.subscribers.values().cloned().collect::<Vec<_>>()
        };
        self.dispatch(targets, payload, include_hidden);
    }

    fn dispatch(&self, targets: Vec<Subscription>, payload: Value, include_hidden: bool) {
        if targets.is_empty() {
            return;
        }
        match self.fanout.try_send(Fanout {
            targets,
            payload,
            include_hidden,
        }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(channel = %self.name, "fan-out queue full, dropping broadcast");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Marks the channel dead and unsubscribes every subscriber without
    /// confirmation. Visible presence members still see `:memberLeft` for
    /// everyone removed before them; then the fan-out task stops.
    pub(crate) fn kill(&self) {
        let mut state = self.state.lock();
        if !state.alive {
            return;
        }
        state.alive = false;
        let departing: Vec<Subscription> =
            state.subscribers.drain().map(|(_, subscription)| subscription).collect();
        drop(state);
        for (index, subscription) in departing.iter().enumerate() {
            if let Some(client) = subscription.client() {
                client.subscriptions().remove(&self.name);
            }
            if self.kind.is_presence() && !subscription.is_hidden() {
                let remaining = departing[index + 1..].to_vec();
                self.dispatch(remaining, proto::member_left(subscription.data().clone()), true);
            }
        }
        self.shutdown.notify_one();
        debug!(channel = %self.name, "channel killed");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::timeout;

    async fn next_frame(rx: &mut UnboundedReceiver<Value>) -> Value {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("queue closed")
    }

    #[test]
    fn type_derivation_round_trips() {
        assert_eq!(ChannelType::from_name("presence-lobby"), ChannelType::Presence);
        assert_eq!(ChannelType::from_name("private-room"), ChannelType::Private);
        assert_eq!(ChannelType::from_name("room"), ChannelType::Normal);
        assert_eq!(ChannelType::from_name("presencelobby"), ChannelType::Normal);
    }

    #[test]
    fn name_validation() {
        for name in ["room", "presence-lobby", "a.b-c_d", "_x"] {
            assert!(is_valid_name(name), "expected {name} to be valid");
        }
        for name in ["", "-room", ".room", "ro om", "ro/om"] {
            assert!(!is_valid_name(name), "expected {name} to be invalid");
        }
    }

    #[tokio::test]
    async fn subscribe_is_idempotent_and_confirmed() {
        let channel = Channel::new("room", ChannelType::Normal).unwrap();
        let (client, mut rx) = ClientSession::new();
        channel.subscribe(&client, false, Map::new());
        channel.subscribe(&client, false, Map::new());
        assert_eq!(channel.subscriber_count(), 1);
        assert!(channel.has_subscriber(client.sid()));
        let frame = next_frame(&mut rx).await;
        assert_eq!(frame[":subscribed"]["channel"], "room");
        assert!(client.subscriptions().contains_key("room"));
    }

    #[tokio::test]
    async fn unsubscribe_confirms_only_when_asked() {
        let channel = Channel::new("room", ChannelType::Normal).unwrap();
        let (client, mut rx) = ClientSession::new();
        channel.subscribe(&client, false, Map::new());
        let _ = next_frame(&mut rx).await;
        channel.unsubscribe(&client, Map::new(), false);
        assert!(!channel.has_subscriber(client.sid()));
        assert!(rx.try_recv().is_err());

        channel.subscribe(&client, false, Map::new());
        let _ = next_frame(&mut rx).await;
        channel.unsubscribe(&client, Map::new(), true);
        let frame = next_frame(&mut rx).await;
        assert_eq!(frame[":unsubscribed"]["channel"], "room");
    }

    #[tokio::test]
    async fn presence_join_and_leave_are_announced() {
        let channel = Channel::new("presence-lobby", ChannelType::Presence).unwrap();
        let (alice, mut alice_rx) = ClientSession::new();
        let mut data = Map::new();
        data.insert("name".into(), Value::String("alice".into()));
        channel.subscribe(&alice, false, data);
        let confirm = next_frame(&mut alice_rx).await;
        assert_eq!(confirm[":subscribed"]["subscribers"], serde_json::json!([]));

        let (bob, mut bob_rx) = ClientSession::new();
        let mut data = Map::new();
        data.insert("name".into(), Value::String("bob".into()));
        channel.subscribe(&bob, false, data);
        let confirm = next_frame(&mut bob_rx).await;
        assert_eq!(confirm[":subscribed"]["subscribers"][0]["name"], "alice");

        let joined = next_frame(&mut alice_rx).await;
        assert_eq!(joined[":memberJoined"]["name"], "bob");
        assert_eq!(joined[":memberJoined"]["sid"], *bob.sid());
        assert_eq!(joined[":memberJoined"]["channel"], "presence-lobby");

        channel.unsubscribe(&bob, Map::new(), false);
        let left = next_frame(&mut alice_rx).await;
        assert_eq!(left[":memberLeft"]["name"], "bob");
        assert_eq!(left[":memberLeft"]["sid"], *bob.sid());
    }

    #[tokio::test]
    async fn hidden_presence_subscribers_are_not_announced() {
        let channel = Channel::new("presence-lobby", ChannelType::Presence).unwrap();
        let (alice, mut alice_rx) = ClientSession::new();
        channel.subscribe(&alice, false, Map::new());
        let _ = next_frame(&mut alice_rx).await;

        let (ghost, mut ghost_rx) = ClientSession::new();
        channel.subscribe(&ghost, true, Map::new());
        let confirm = next_frame(&mut ghost_rx).await;
        // The snapshot still lists visible members for the hidden joiner.
        assert_eq!(confirm[":subscribed"]["subscribers"].as_array().unwrap().len(), 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_respects_hidden_flag() {
        let channel = Channel::new("room", ChannelType::Normal).unwrap();
        let (visible, mut visible_rx) = ClientSession::new();
        let (hidden, mut hidden_rx) = ClientSession::new();
        channel.subscribe(&visible, false, Map::new());
        channel.subscribe(&hidden, true, Map::new());
        let _ = next_frame(&mut visible_rx).await;
        let _ = next_frame(&mut hidden_rx).await;

        channel.broadcast(serde_json::json!({"event": {"x": 1}}), false);
        let frame = next_frame(&mut visible_rx).await;
        assert_eq!(frame["event"]["x"], 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(hidden_rx.try_recv().is_err());

        channel.broadcast(serde_json::json!({"event": {"x": 2}}), true);
        let frame = next_frame(&mut hidden_rx).await;
        assert_eq!(frame["event"]["x"], 2);
    }

    #[tokio::test]
    async fn kill_silences_and_clears_the_channel() {
        let channel = Channel::new("room", ChannelType::Normal).unwrap();
        let (client, mut rx) = ClientSession::new();
        channel.subscribe(&client, false, Map::new());
        let _ = next_frame(&mut rx).await;
        channel.kill();
        assert!(!channel.is_alive());
        assert_eq!(channel.subscriber_count(), 0);
        assert!(!client.subscriptions().contains_key("room"));
        assert!(rx.try_recv().is_err());
        // Operations on a dead channel are no-ops.
        channel.subscribe(&client, false, Map::new());
        assert_eq!(channel.subscriber_count(), 0);
        channel.broadcast(serde_json::json!({"event": {}}), false);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn kill_announces_presence_departures() {
        let channel = Channel::new("presence-lobby", ChannelType::Presence).unwrap();
        let (alice, mut alice_rx) = ClientSession::new();
        let (bob, mut bob_rx) = ClientSession::new();
        channel.subscribe(&alice, false, Map::new());
        channel.subscribe(&bob, false, Map::new());
        // Drain the confirmations and bob's join announcement.
        let _ = next_frame(&mut alice_rx).await;
        let _ = next_frame(&mut alice_rx).await;
        let _ = next_frame(&mut bob_rx).await;
        let _ = next_frame(&mut bob_rx).await;

        channel.kill();
        assert!(!alice.subscriptions().contains_key("presence-lobby"));
        assert!(!bob.subscriptions().contains_key("presence-lobby"));

        // Removal order is unspecified; whichever member was removed second
        // saw exactly one :memberLeft for the first, and nobody was sent an
        // :unsubscribed confirmation.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        let mut frames = Vec::new();
        loop {
            while let Ok(frame) = alice_rx.try_recv() {
                frames.push(frame);
            }
            while let Ok(frame) = bob_rx.try_recv() {
                frames.push(frame);
            }
            if frames.iter().any(|f| f.get(":memberLeft").is_some())
                || tokio::time::Instant::now() >= deadline
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let lefts: Vec<_> = frames
            .iter()
            .filter(|f| f.get(":memberLeft").is_some())
            .collect();
        assert_eq!(lefts.len(), 1);
        assert_eq!(lefts[0][":memberLeft"]["channel"], "presence-lobby");
        assert!(frames.iter().all(|f| f.get(":unsubscribed").is_none()));
    }
}
