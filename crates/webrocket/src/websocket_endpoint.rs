//! The WebSocket endpoint: a TCP listener upgrading browser connections.
//!
//! The upgrade request's path selects the vhost. Connections authenticate
//! per message: an `auth` frame carrying the vhost access token or a
//! single-access token elevates the connection before `subscribe` checks
//! private and presence channels. On disconnect the connection is silently
//! unsubscribed from every channel it joined.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::channel::{self, ChannelType};
use crate::client::ClientSession;
use crate::error::EndpointError;
use crate::status::Status;
use crate::vhost::Vhost;
use crate::websocket_proto::{self as proto, ClientFrame};

const ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

pub struct WebsocketEndpoint {
    addr: String,
    /// Handler mux: vhost path to vhost, rebuilt through the context.
    vhosts: Arc<DashMap<String, Arc<Vhost>>>,
    bound: Mutex<Option<SocketAddr>>,
    alive: AtomicBool,
    killed: AtomicBool,
    shutdown: Notify,
}

impl WebsocketEndpoint {
    pub(crate) fn new(addr: &str) -> Arc<Self> {
        Arc::new(Self {
            addr: addr.to_string(),
            vhosts: Arc::new(DashMap::new()),
            bound: Mutex::new(None),
            alive: AtomicBool::new(false),
            killed: AtomicBool::new(false),
            shutdown: Notify::new(),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// The socket address actually bound, once serving.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock()
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub(crate) fn register_vhost(&self, vhost: &Arc<Vhost>) {
        self.vhosts.insert(vhost.path().to_string(), Arc::clone(vhost));
    }

    pub(crate) fn unregister_vhost(&self, path: &str) {
        self.vhosts.remove(path);
    }

    /// Closes the listener; connection tasks drain on their next read.
    /// Idempotent.
    pub fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.alive.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();
        info!(addr = %self.addr, "websocket endpoint killed");
    }

    pub async fn listen_and_serve(self: Arc<Self>) -> Result<(), EndpointError> {
        let listener = self.bind().await?;
        self.serve(listener, None).await
    }

    /// TLS variant of `listen_and_serve`, symmetric with the plaintext
    /// listener.
    pub async fn listen_and_serve_tls(
        self: Arc<Self>,
        cert: &Path,
        key: &Path,
    ) -> Result<(), EndpointError> {
        let acceptor = crate::tls::acceptor(cert, key)?;
        let listener = self.bind().await?;
        self.serve(listener, Some(acceptor)).await
    }

    async fn bind(&self) -> Result<TcpListener, EndpointError> {
        if self.killed.load(Ordering::SeqCst) {
            return Err(EndpointError::Killed);
        }
        let listener = TcpListener::bind(&self.addr).await?;
        *self.bound.lock() = listener.local_addr().ok();
        self.alive.store(true, Ordering::SeqCst);
        info!(addr = %self.addr, "websocket endpoint listening");
        Ok(listener)
    }

    async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        tls: Option<TlsAcceptor>,
    ) -> Result<(), EndpointError> {
        loop {
            if !self.is_alive() {
                return Ok(());
            }
            let accepted = tokio::select! {
                _ = self.shutdown.notified() => return Ok(()),
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "websocket connection accepted");
                    let endpoint = Arc::clone(&self);
                    let tls = tls.clone();
                    tokio::spawn(async move {
                        match tls {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(stream) => endpoint.handle_connection(stream).await,
                                Err(err) => warn!(%peer, error = %err, "tls handshake failed"),
                            },
                            None => endpoint.handle_connection(stream).await,
                        }
                    });
                }
                Err(err) if is_transient(&err) => {
                    warn!(error = %err, "transient accept error, backing off");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
                Err(err) => {
                    self.alive.store(false, Ordering::SeqCst);
                    error!(error = %err, "websocket accept loop terminated");
                    return Err(err.into());
                }
            }
        }
    }

    async fn handle_connection<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        // The handshake callback resolves the vhost from the request path
        // and rejects unknown paths before the upgrade completes.
        let requested: Arc<OnceLock<String>> = Arc::new(OnceLock::new());
        let captured = Arc::clone(&requested);
        let mux = Arc::clone(&self.vhosts);
        let callback = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            let path = request.uri().path().to_string();
            if !mux.contains_key(&path) {
                let mut rejection = ErrorResponse::new(Some("vhost not found".into()));
                *rejection.status_mut() = StatusCode::NOT_FOUND;
                return Err(rejection);
            }
            let _ = captured.set(path);
            Ok(response)
        };
        let websocket = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(websocket) => websocket,
            Err(err) => {
                debug!(error = %err, "websocket handshake rejected");
                return;
            }
        };
        let Some(path) = requested.get() else { return };
        let Some(vhost) = self.vhosts.get(path).map(|entry| Arc::clone(entry.value())) else {
            return;
        };

        let (client, mut outbound) = ClientSession::new();
        let (mut sink, mut stream) = websocket.split();
        let writer = tokio::spawn(async move {
            while let Some(payload) = outbound.recv().await {
                if sink.send(Message::Text(payload.to_string())).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });
        info!(vhost = %vhost.path(), sid = %client.sid(), "websocket client connected");

        loop {
            if !self.is_alive() {
                break;
            }
            let message = tokio::select! {
                _ = self.shutdown.notified() => break,
                message = stream.next() => message,
            };
            match message {
                Some(Ok(Message::Text(text))) => {
                    if self.handle_frame(&vhost, &client, &text) {
                        break;
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    client.send(proto::error_frame(&Status::bad_request()));
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(sid = %client.sid(), error = %err, "websocket read error");
                    break;
                }
            }
        }

        // Silent unsubscription from every channel this connection joined.
        let channels: Vec<_> = client
            .subscriptions()
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for channel in channels {
            channel.unsubscribe(&client, Map::new(), false);
        }
        writer.abort();
        info!(vhost = %vhost.path(), sid = %client.sid(), "websocket client disconnected");
    }

    /// Dispatches one client frame. Returns true when the connection should
    /// close.
    fn handle_frame(&self, vhost: &Arc<Vhost>, client: &Arc<ClientSession>, text: &str) -> bool {
        let frame: ClientFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(err) => {
                debug!(sid = %client.sid(), error = %err, "unparseable frame");
                client.send(proto::error_frame(&Status::bad_request()));
                return false;
            }
        };
        match frame {
            ClientFrame::Auth { token } => {
                if token == vhost.access_token() {
                    client.authenticate_master();
                    debug!(sid = %client.sid(), "client authenticated with vhost token");
                } else {
                    client.authenticate_token(token);
                }
                false
            }
            ClientFrame::Subscribe {
                channel,
                hidden,
                data,
            } => {
                self.handle_subscribe(vhost, client, &channel, hidden, data);
                false
            }
            ClientFrame::Unsubscribe { channel } => {
                match vhost.channel(&channel) {
                    Ok(channel) => channel.unsubscribe(client, Map::new(), true),
                    Err(_) => {
                        client.send(proto::error_frame(&Status::channel_not_found()));
                    }
                }
                false
            }
            ClientFrame::Broadcast {
                channel,
                event,
                mut data,
            } => {
                match vhost.channel(&channel) {
                    Ok(target) if target.has_subscriber(client.sid()) => {
                        data.insert("channel".into(), Value::String(channel));
                        let mut body = Map::new();
                        body.insert(event, Value::Object(data));
                        target.broadcast(Value::Object(body), false);
                    }
                    Ok(_) => {
                        client.send(proto::error_frame(&Status::unauthorized()));
                    }
                    Err(_) => {
                        client.send(proto::error_frame(&Status::channel_not_found()));
                    }
                }
                false
            }
            ClientFrame::Trigger { event, mut data } => {
                data.insert("sid".into(), Value::String(client.sid().to_string()));
                let payload = serde_json::json!({ "event": event, "data": data });
                if !vhost.lobby().enqueue(payload) {
                    client.send(proto::error_frame(&Status::internal_error()));
                }
                false
            }
            ClientFrame::Close {} => true,
        }
    }

    fn handle_subscribe(
        &self,
        vhost: &Arc<Vhost>,
        client: &Arc<ClientSession>,
        name: &str,
        hidden: bool,
        data: Map<String, Value>,
    ) {
        if !channel::is_valid_name(name) {
            client.send(proto::error_frame(&Status::invalid_channel_name()));
            return;
        }
        let kind = vhost
            .channel(name)
            .map(|existing| existing.kind())
            .unwrap_or_else(|_| ChannelType::from_name(name));
        if kind.is_private() && !authorize_subscribe(vhost, client, name) {
            client.send(proto::error_frame(&Status::unauthorized()));
            return;
        }
        match vhost.open_channel(name, kind) {
            Ok(opened) => opened.get().subscribe(client, hidden, data),
            Err(_) => {
                client.send(proto::error_frame(&Status::invalid_channel_name()));
            }
        }
    }
}

/// Private and presence channels need the vhost token or a matching unused
/// permission; validating a single-access token consumes it.
fn authorize_subscribe(vhost: &Vhost, client: &Arc<ClientSession>, channel: &str) -> bool {
    if client.is_master() || client.has_grant_for(channel) {
        return true;
    }
    let Some(token) = client.pending_token() else {
        return false;
    };
    match vhost.validate_single_access_token(&token, channel) {
        Some(permission) => {
            client.grant(permission);
            true
        }
        None => false,
    }
}

fn is_transient(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
    )
}
