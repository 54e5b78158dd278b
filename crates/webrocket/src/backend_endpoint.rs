//! The backend endpoint: a TCP listener speaking the worker protocol.
//!
//! Every connection opens with an identity line. REQ peers issue a single
//! verb (`BC`, `OC`, `CC`, `AT`) and get one reply; DEALER peers register as
//! workers with `RD` and stay connected, heartbeating with `HB`, until they
//! disconnect or miss their liveness window and are sent `QT`.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::backend_identity::{parse_backend_identity, BackendIdentity, SocketType};
use crate::backend_proto::{read_message, write_message, BackendRequest};
use crate::channel::ChannelType;
use crate::error::EndpointError;
use crate::status::Status;
use crate::vhost::Vhost;
use crate::worker::{BackendWorker, WorkerCommand};

const ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

pub struct BackendEndpoint {
    addr: String,
    vhosts: DashMap<String, Arc<Vhost>>,
    bound: Mutex<Option<SocketAddr>>,
    alive: AtomicBool,
    killed: AtomicBool,
    shutdown: Notify,
}

impl BackendEndpoint {
    pub(crate) fn new(addr: &str) -> Arc<Self> {
        Arc::new(Self {
            addr: addr.to_string(),
            vhosts: DashMap::new(),
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

    /// Enqueues the payload on the vhost's lobby for worker delivery.
    pub fn trigger(&self, vhost: &Vhost, payload: Value) -> Result<(), EndpointError> {
        if !vhost.lobby().enqueue(payload) {
            return Err(EndpointError::LobbyClosed);
        }
        Ok(())
    }

    /// Closes the listener and kills every registered vhost's lobby.
    /// Idempotent.
    pub fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.alive.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();
        for entry in self.vhosts.iter() {
            entry.value().lobby().kill();
        }
        info!(addr = %self.addr, "backend endpoint killed");
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
        info!(addr = %self.addr, "backend endpoint listening");
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
                    debug!(%peer, "backend connection accepted");
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
                    error!(error = %err, "backend accept loop terminated");
                    return Err(err.into());
                }
            }
        }
    }

    async fn handle_connection<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);
        let frames = match read_message(&mut reader).await {
            Ok(Some(frames)) => frames,
            Ok(None) => return,
            Err(err) => {
                debug!(error = %err, "backend read failed");
                return;
            }
        };
        let Some(request) = BackendRequest::from_frames(frames) else {
            let _ = write_message(&mut write_half, &["ER", "400"]).await;
            log_status(None, &Status::bad_request(), "malformed request");
            return;
        };
        let Some((vhost, identity)) = self.authenticate(&request.identity) else {
            // Unauthorized peers get no reply body, just a closed socket.
            log_status(None, &Status::unauthorized(), &request.command);
            return;
        };
        match identity.socket {
            SocketType::Req => {
                let (status, reply) = dispatch_req(&vhost, &request);
                match reply {
                    Some(frames) => {
                        let frames: Vec<&str> = frames.iter().map(String::as_str).collect();
                        let _ = write_message(&mut write_half, &frames).await;
                    }
                    None if status.is_error() => {
                        let code = status.code().to_string();
                        let _ = write_message(&mut write_half, &["ER", &code]).await;
                    }
                    None => {}
                }
                log_status(Some(vhost.path()), &status, &request.command);
            }
            SocketType::Dealer => {
                let status = self
                    .dispatch_dealer(&vhost, &request, &identity, &mut reader, write_half)
                    .await;
                log_status(Some(vhost.path()), &status, &request.command);
            }
        }
    }

    fn authenticate(&self, raw: &str) -> Option<(Arc<Vhost>, BackendIdentity)> {
        let identity = parse_backend_identity(raw).ok()?;
        let vhost = Arc::clone(self.vhosts.get(&identity.vhost)?.value());
        if vhost.access_token() != identity.access_token {
            return None;
        }
        Some((vhost, identity))
    }

    async fn dispatch_dealer<R, W>(
        &self,
        vhost: &Arc<Vhost>,
        request: &BackendRequest,
        identity: &BackendIdentity,
        reader: &mut R,
        mut write_half: W,
    ) -> Status
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        match request.command.as_str() {
            "RD" => self.run_worker(vhost, identity, reader, write_half).await,
            "HB" => {
                // A heartbeat on a fresh connection means the worker outlived
                // its liveness window; tell it to restart.
                let _ = write_message(&mut write_half, &["QT"]).await;
                Status::expired()
            }
            _ => {
                let _ = write_message(&mut write_half, &["ER", "400"]).await;
                Status::bad_request()
            }
        }
    }

    /// Keeps a registered worker alive: forwards lobby deliveries to the
    /// socket and feeds heartbeats and ready frames back to the lobby.
    /// Blocks until the worker disconnects or is told to quit.
    async fn run_worker<R, W>(
        &self,
        vhost: &Arc<Vhost>,
        identity: &BackendIdentity,
        reader: &mut R,
        mut write_half: W,
    ) -> Status
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let lobby = Arc::clone(vhost.lobby());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let quit = Arc::new(Notify::new());
        let quit_signal = Arc::clone(&quit);
        let writer = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    WorkerCommand::Deliver(payload) => {
                        let body = payload.to_string();
                        if write_message(&mut write_half, &["TR", &body]).await.is_err() {
                            break;
                        }
                    }
                    WorkerCommand::Quit => {
                        let _ = write_message(&mut write_half, &["QT"]).await;
                        quit_signal.notify_one();
                        break;
                    }
                }
            }
        });

        let liveness = lobby.liveness();
        lobby.add_worker(BackendWorker::new(identity.id.clone(), tx.clone(), liveness));
        info!(vhost = %vhost.path(), worker = %identity.id, "worker registered");

        let status = loop {
            tokio::select! {
                _ = quit.notified() => break Status::expired(),
                message = read_message(reader) => match message {
                    Ok(Some(frames)) => match frames.first().map(String::as_str) {
                        Some("HB") => {
                            if !lobby.heartbeat(&identity.id) {
                                let _ = tx.send(WorkerCommand::Quit);
                            }
                        }
                        Some("RD") => lobby.worker_ready(&identity.id),
                        other => debug!(worker = %identity.id, frame = ?other, "ignoring worker frame"),
                    },
                    Ok(None) | Err(_) => break Status::disconnected(),
                },
            }
        };

        lobby.delete_worker(&identity.id);
        drop(tx);
        let _ = writer.await;
        info!(vhost = %vhost.path(), worker = %identity.id, "worker deregistered");
        status
    }
}

/// Routes a one-shot REQ verb. Returns the resulting status and, on
/// success, the reply frames; errors are answered with `ER <code>` by the
/// caller.
fn dispatch_req(vhost: &Arc<Vhost>, request: &BackendRequest) -> (Status, Option<Vec<String>>) {
    match request.command.as_str() {
        "BC" => handle_broadcast(vhost, request),
        "OC" => handle_open_channel(vhost, request),
        "CC" => handle_close_channel(vhost, request),
        "AT" => handle_access_token(vhost, request),
        _ => (Status::bad_request(), None),
    }
}

fn handle_broadcast(vhost: &Vhost, request: &BackendRequest) -> (Status, Option<Vec<String>>) {
    if request.payload.len() < 3 {
        return (Status::bad_request(), None);
    }
    let (channel_name, event) = (request.payload[0].as_str(), request.payload[1].as_str());
    if channel_name.is_empty() || event.is_empty() {
        return (Status::bad_request(), None);
    }
    // Undecodable bodies broadcast as empty data, as the protocol allows.
    let mut data: Map<String, Value> =
        serde_json::from_str(&request.payload[2]).unwrap_or_default();
    let Ok(channel) = vhost.channel(channel_name) else {
        return (Status::channel_not_found(), None);
    };
    data.insert("channel".into(), Value::String(channel_name.to_string()));
    let mut body = Map::new();
    body.insert(event.to_string(), Value::Object(data));
    channel.broadcast(Value::Object(body), false);
    (Status::broadcasted(), Some(vec!["OK".into()]))
}

fn handle_open_channel(vhost: &Vhost, request: &BackendRequest) -> (Status, Option<Vec<String>>) {
    let Some(channel_name) = request.payload.first().filter(|n| !n.is_empty()) else {
        return (Status::bad_request(), None);
    };
    let kind = ChannelType::from_name(channel_name);
    match vhost.open_channel(channel_name, kind) {
        Ok(opened) if opened.created() => (Status::channel_opened(), Some(vec!["OK".into()])),
        Ok(_) => (Status::channel_exists(), Some(vec!["OK".into()])),
        Err(_) => (Status::invalid_channel_name(), None),
    }
}

fn handle_close_channel(vhost: &Vhost, request: &BackendRequest) -> (Status, Option<Vec<String>>) {
    let Some(channel_name) = request.payload.first().filter(|n| !n.is_empty()) else {
        return (Status::bad_request(), None);
    };
    match vhost.delete_channel(channel_name) {
        Ok(()) => (Status::channel_closed(), Some(vec!["OK".into()])),
        Err(_) => (Status::channel_not_found(), None),
    }
}

fn handle_access_token(vhost: &Vhost, request: &BackendRequest) -> (Status, Option<Vec<String>>) {
    if request.payload.len() < 2 {
        return (Status::bad_request(), None);
    }
    let (uid, pattern) = (request.payload[0].as_str(), request.payload[1].as_str());
    if uid.is_empty() || pattern.is_empty() {
        return (Status::bad_request(), None);
    }
    match vhost.generate_single_access_token(uid, pattern) {
        Ok(token) => (Status::token_generated(), Some(vec!["AT".into(), token])),
        Err(_) => (Status::internal_error(), None),
    }
}

fn log_status(vhost: Option<&str>, status: &Status, detail: &str) {
    let vhost = vhost.unwrap_or("???");
    if status.is_error() {
        error!("backend[{vhost}]: {status}; {detail}");
    } else if status.is_success() {
        info!("backend[{vhost}]: {status}; {detail}");
    } else {
        debug!("backend[{vhost}]: {status}; {detail}");
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

#[cfg(test)]
mod tests {
    use super::*;

    fn request(command: &str, payload: &[&str]) -> BackendRequest {
        BackendRequest {
            identity: "test".into(),
            command: command.into(),
            payload: payload.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn open_close_channel_statuses() {
        let vhost = Arc::new(Vhost::new("/demo"));
        let (status, reply) = dispatch_req(&vhost, &request("OC", &["room"]));
        assert_eq!(status, Status::channel_opened());
        assert_eq!(reply, Some(vec!["OK".to_string()]));
        let (status, _) = dispatch_req(&vhost, &request("OC", &["room"]));
        assert_eq!(status, Status::channel_exists());
        let (status, _) = dispatch_req(&vhost, &request("OC", &["-bad"]));
        assert_eq!(status, Status::invalid_channel_name());
        let (status, _) = dispatch_req(&vhost, &request("CC", &["room"]));
        assert_eq!(status, Status::channel_closed());
        let (status, _) = dispatch_req(&vhost, &request("CC", &["room"]));
        assert_eq!(status, Status::channel_not_found());
    }

    #[tokio::test]
    async fn broadcast_requires_channel_and_event() {
        let vhost = Arc::new(Vhost::new("/demo"));
        let (status, _) = dispatch_req(&vhost, &request("BC", &["room", "hello"]));
        assert_eq!(status, Status::bad_request());
        let (status, _) = dispatch_req(&vhost, &request("BC", &["room", "hello", "{}"]));
        assert_eq!(status, Status::channel_not_found());
        vhost.open_channel("room", ChannelType::Normal).unwrap();
        let (status, reply) =
            dispatch_req(&vhost, &request("BC", &["room", "hello", r#"{"x":1}"#]));
        assert_eq!(status, Status::broadcasted());
        assert_eq!(reply, Some(vec!["OK".to_string()]));
    }

    #[tokio::test]
    async fn access_token_generation() {
        let vhost = Arc::new(Vhost::new("/demo"));
        let (status, reply) = dispatch_req(&vhost, &request("AT", &["joe", ".*"]));
        assert_eq!(status, Status::token_generated());
        let reply = reply.unwrap();
        assert_eq!(reply[0], "AT");
        assert_eq!(reply[1].len(), crate::permission::TOKEN_LENGTH);
        let (status, _) = dispatch_req(&vhost, &request("AT", &["joe"]));
        assert_eq!(status, Status::bad_request());
    }

    #[tokio::test]
    async fn unknown_verbs_are_bad_requests() {
        let vhost = Arc::new(Vhost::new("/demo"));
        let (status, reply) = dispatch_req(&vhost, &request("XX", &[]));
        assert_eq!(status, Status::bad_request());
        assert!(reply.is_none());
    }
}
