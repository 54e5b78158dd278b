//! Vhosts: isolated namespaces owning channels, permissions and a lobby.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::debug;

use crate::channel::{Channel, ChannelType};
use crate::error::VhostError;
use crate::lobby::Lobby;
use crate::permission::Permission;

/// Length of a vhost access token, in characters.
pub const ACCESS_TOKEN_LENGTH: usize = 40;

fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ACCESS_TOKEN_LENGTH)
        .map(char::from)
        .collect()
}

/// Result of `open_channel`; callers distinguish a fresh channel from one
/// that already existed.
pub enum OpenedChannel {
    Created(Arc<Channel>),
    Existing(Arc<Channel>),
}

impl OpenedChannel {
    pub fn get(&self) -> &Arc<Channel> {
        match self {
            Self::Created(channel) | Self::Existing(channel) => channel,
        }
    }

    pub fn created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// A namespaced tenant: channel table, permission table, access token and
/// exactly one backend lobby.
#[derive(Debug)]
pub struct Vhost {
    path: String,
    access_token: Mutex<String>,
    channels: DashMap<String, Arc<Channel>>,
    permissions: DashMap<String, Permission>,
    lobby: Arc<Lobby>,
}

impl Vhost {
    pub(crate) fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            access_token: Mutex::new(generate_token()),
            channels: DashMap::new(),
            permissions: DashMap::new(),
            lobby: Lobby::new(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn access_token(&self) -> String {
        self.access_token.lock().clone()
    }

    /// Replaces the access token with a fresh one and returns it.
    pub fn regenerate_access_token(&self) -> String {
        let token = generate_token();
        *self.access_token.lock() = token.clone();
        token
    }

    pub(crate) fn set_access_token(&self, token: String) {
        *self.access_token.lock() = token;
    }

    pub fn lobby(&self) -> &Arc<Lobby> {
        &self.lobby
    }

    /// Opens a channel, or returns the existing one under that name.
    pub fn open_channel(
        &self,
        name: &str,
        kind: ChannelType,
    ) -> Result<OpenedChannel, VhostError> {
        match self.channels.entry(name.to_string()) {
            Entry::Occupied(entry) => Ok(OpenedChannel::Existing(entry.get().clone())),
            Entry::Vacant(entry) => {
                let channel = Channel::new(name, kind)?;
                entry.insert(Arc::clone(&channel));
                debug!(vhost = %self.path, channel = %name, "channel opened");
                Ok(OpenedChannel::Created(channel))
            }
        }
    }

    pub fn channel(&self, name: &str) -> Result<Arc<Channel>, VhostError> {
        self.channels
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(VhostError::ChannelNotFound)
    }

    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.channels
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Kills and removes the named channel.
    pub fn delete_channel(&self, name: &str) -> Result<(), VhostError> {
        let (_, channel) = self
            .channels
            .remove(name)
            .ok_or(VhostError::ChannelNotFound)?;
        channel.kill();
        debug!(vhost = %self.path, channel = %name, "channel deleted");
        Ok(())
    }

    /// Issues a one-shot token granting `uid` access to channels matching
    /// the pattern. A fresh grant replaces any earlier one for the same uid.
    pub fn generate_single_access_token(
        &self,
        uid: &str,
        pattern: &str,
    ) -> Result<String, VhostError> {
        let permission = Permission::new(uid, pattern)?;
        let token = permission.token().to_string();
        self.permissions.insert(uid.to_string(), permission);
        Ok(token)
    }

    /// Consumes the permission matching this token and channel, if any.
    /// Single use: the first successful validation removes the grant.
    pub fn validate_single_access_token(&self, token: &str, channel: &str) -> Option<Permission> {
        let uid = self
            .permissions
            .iter()
            .find(|entry| entry.value().token() == token && entry.value().is_matching(channel))
            .map(|entry| entry.key().clone())?;
        self.permissions.remove(&uid).map(|(_, permission)| permission)
    }

    /// Kills every channel and the lobby.
    pub(crate) fn kill(&self) {
        for entry in self.channels.iter() {
            entry.value().kill();
        }
        self.channels.clear();
        self.permissions.clear();
        self.lobby.kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_tokens_are_forty_characters() {
        let vhost = Vhost::new("/demo");
        assert_eq!(vhost.access_token().len(), ACCESS_TOKEN_LENGTH);
        let fresh = vhost.regenerate_access_token();
        assert_eq!(fresh.len(), ACCESS_TOKEN_LENGTH);
        assert_eq!(vhost.access_token(), fresh);
    }

    #[tokio::test]
    async fn open_channel_returns_the_existing_instance() {
        let vhost = Vhost::new("/demo");
        let first = vhost.open_channel("room", ChannelType::Normal).unwrap();
        assert!(first.created());
        let second = vhost.open_channel("room", ChannelType::Normal).unwrap();
        assert!(!second.created());
        assert!(Arc::ptr_eq(first.get(), second.get()));
    }

    #[tokio::test]
    async fn open_channel_rejects_invalid_names() {
        let vhost = Vhost::new("/demo");
        assert!(matches!(
            vhost.open_channel("-bad", ChannelType::Normal),
            Err(VhostError::InvalidChannelName)
        ));
    }

    #[tokio::test]
    async fn delete_channel_kills_it() {
        let vhost = Vhost::new("/demo");
        let opened = vhost.open_channel("room", ChannelType::Normal).unwrap();
        let channel = opened.get().clone();
        vhost.delete_channel("room").unwrap();
        assert!(!channel.is_alive());
        assert!(matches!(
            vhost.channel("room"),
            Err(VhostError::ChannelNotFound)
        ));
        assert!(matches!(
            vhost.delete_channel("room"),
            Err(VhostError::ChannelNotFound)
        ));
    }

    #[test]
    fn single_access_tokens_validate_once() {
        let vhost = Vhost::new("/demo");
        let token = vhost
            .generate_single_access_token("joe", "private-.*")
            .unwrap();
        assert_eq!(token.len(), crate::permission::TOKEN_LENGTH);
        assert!(vhost
            .validate_single_access_token(&token, "other")
            .is_none());
        let permission = vhost
            .validate_single_access_token(&token, "private-room")
            .expect("first matching validation succeeds");
        assert_eq!(permission.uid(), "joe");
        assert!(vhost
            .validate_single_access_token(&token, "private-room")
            .is_none());
    }

    #[tokio::test]
    async fn kill_tears_down_channels_and_lobby() {
        let vhost = Vhost::new("/demo");
        let opened = vhost.open_channel("room", ChannelType::Normal).unwrap();
        let channel = opened.get().clone();
        vhost.kill();
        assert!(!channel.is_alive());
        assert!(vhost.channels().is_empty());
        assert!(!vhost.lobby().is_alive());
    }

    #[tokio::test]
    async fn delete_presence_channel_announces_departures() {
        use std::time::Duration;

        use serde_json::Map;

        use crate::client::ClientSession;

        let vhost = Vhost::new("/demo");
        let channel = vhost
            .open_channel("presence-lobby", ChannelType::Presence)
            .unwrap()
            .get()
            .clone();
        let (alice, mut alice_rx) = ClientSession::new();
        let (bob, mut bob_rx) = ClientSession::new();
        channel.subscribe(&alice, false, Map::new());
        channel.subscribe(&bob, false, Map::new());
        // Drain the confirmations and bob's join announcement.
        for _ in 0..2 {
            let _ = tokio::time::timeout(Duration::from_secs(1), alice_rx.recv())
                .await
                .unwrap();
            let _ = tokio::time::timeout(Duration::from_secs(1), bob_rx.recv())
                .await
                .unwrap();
        }

        vhost.delete_channel("presence-lobby").unwrap();
        assert!(!channel.is_alive());
        assert!(!alice.subscriptions().contains_key("presence-lobby"));
        assert!(!bob.subscriptions().contains_key("presence-lobby"));

        // Closing the channel still announces each visible departure to the
        // members that had not been removed yet.
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
    }
}
