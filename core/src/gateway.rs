//! Host-side admission and session management.
//!
//! A single task owns the trust registry and every session. Handles talk to it over a
//! command channel; state changes are published as [`GatewayEvent`]s.

use crate::error::{RemoteError, Result};
use crate::fingerprint::Fingerprint;
use crate::handshake;
use crate::peer::{IncomingRequest, PeerConnection};
use crate::protocol::{CLOSE_BLOCKED, CLOSE_UNAUTHENTICATED, PROTOCOL_VERSION, Reply, Request};
use crate::trust::{TrustEntry, TrustRegistry, TrustStatus};
use crate::vm::{RemoteVmState, VirtualMachineHost};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Block and drop unknown clients instead of asking the operator.
    pub autoblock: bool,
    /// Required in the client's `ServerHandshake` when set.
    pub password: Option<String>,
    pub protocol_version: u32,
    /// Reported to clients in the handshake reply.
    pub model: String,
    pub handshake_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            autoblock: false,
            password: None,
            protocol_version: PROTOCOL_VERSION,
            model: std::env::consts::OS.to_string(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApprovalDecision {
    Allow,
    Deny,
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    Unauthenticated,
    Blocked,
    Autoblocked,
    HandshakeFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    Disconnected,
    Blocked,
    Forgotten,
    Replaced,
    TransportClosed,
    Reset,
    Shutdown,
}

impl CloseReason {
    fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Disconnected => "disconnected",
            CloseReason::Blocked => CLOSE_BLOCKED,
            CloseReason::Forgotten => "forgotten",
            CloseReason::Replaced => "replaced",
            CloseReason::TransportClosed => "transport closed",
            CloseReason::Reset => "server reset",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    /// Unknown client parked until the operator allows or denies it.
    ApprovalRequested {
        fingerprint: Fingerprint,
        /// `client ^ server`, the value both sides can display for comparison.
        combined: Fingerprint,
        remote_address: String,
    },
    /// An approved client connected. The operator may still disconnect it.
    TrustedConnection {
        fingerprint: Fingerprint,
        remote_address: String,
    },
    Established {
        fingerprint: Fingerprint,
        remote_address: String,
    },
    Rejected {
        fingerprint: Option<Fingerprint>,
        remote_address: String,
        reason: RejectReason,
    },
    Closed {
        fingerprint: Fingerprint,
        reason: CloseReason,
    },
    TrustChanged {
        fingerprint: Fingerprint,
        status: Option<TrustStatus>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Pending,
    Handshaking,
    Established,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub fingerprint: Fingerprint,
    pub remote_address: String,
    pub state: SessionState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRecord {
    pub entry: TrustEntry,
    pub status: TrustStatus,
    pub session: Option<SessionState>,
}

type ReplyTo<T> = oneshot::Sender<T>;

enum Command {
    Accept(Arc<dyn PeerConnection>),
    Approve(Fingerprint, ReplyTo<Result<()>>),
    Block(Fingerprint, ReplyTo<Result<()>>),
    Forget(Fingerprint, ReplyTo<Result<bool>>),
    Disconnect(Fingerprint, ReplyTo<bool>),
    DisconnectAll(ReplyTo<usize>),
    SetServerFingerprint(Fingerprint, ReplyTo<()>),
    ServerFingerprint(ReplyTo<Fingerprint>),
    Clients(ReplyTo<Vec<ClientRecord>>),
    Sessions(ReplyTo<Vec<SessionInfo>>),
    Broadcast(Request),
    HandshakeCompleted {
        fingerprint: Fingerprint,
        session_id: u64,
        result: Result<()>,
    },
    PeerClosed {
        fingerprint: Fingerprint,
        session_id: u64,
    },
    Shutdown(ReplyTo<()>),
}

/// Cloneable entry point to a running gateway.
#[derive(Clone)]
pub struct GatewayHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<GatewayEvent>,
}

impl GatewayHandle {
    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| RemoteError::GatewayStopped)
    }

    async fn call<T>(&self, make: impl FnOnce(ReplyTo<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx))?;
        rx.await.map_err(|_| RemoteError::GatewayStopped)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }

    /// Hand an inbound transport connection to the gateway.
    pub fn accept<P: PeerConnection>(&self, peer: P) -> Result<()> {
        self.send(Command::Accept(Arc::new(peer)))
    }

    /// Approve a fingerprint and establish its parked connection, if any.
    pub async fn approve(&self, fingerprint: Fingerprint) -> Result<()> {
        self.call(|tx| Command::Approve(fingerprint, tx)).await?
    }

    /// Block a fingerprint. Every connection it has is closed before this returns.
    pub async fn block(&self, fingerprint: Fingerprint) -> Result<()> {
        self.call(|tx| Command::Block(fingerprint, tx)).await?
    }

    pub async fn forget(&self, fingerprint: Fingerprint) -> Result<bool> {
        self.call(|tx| Command::Forget(fingerprint, tx)).await?
    }

    /// Close the session for a fingerprint without changing its trust.
    pub async fn disconnect(&self, fingerprint: Fingerprint) -> Result<bool> {
        self.call(|tx| Command::Disconnect(fingerprint, tx)).await
    }

    pub async fn disconnect_all(&self) -> Result<usize> {
        self.call(Command::DisconnectAll).await
    }

    pub async fn respond(&self, fingerprint: Fingerprint, decision: ApprovalDecision) -> Result<()> {
        match decision {
            ApprovalDecision::Allow => self.approve(fingerprint).await,
            ApprovalDecision::Deny => self.block(fingerprint).await,
            ApprovalDecision::Disconnect => self.disconnect(fingerprint).await.map(|_| ()),
        }
    }

    /// Switch to a regenerated server identity. Every session is closed.
    pub async fn set_server_fingerprint(&self, fingerprint: Fingerprint) -> Result<()> {
        self.call(|tx| Command::SetServerFingerprint(fingerprint, tx))
            .await
    }

    pub async fn server_fingerprint(&self) -> Result<Fingerprint> {
        self.call(Command::ServerFingerprint).await
    }

    pub async fn clients(&self) -> Result<Vec<ClientRecord>> {
        self.call(Command::Clients).await
    }

    pub async fn sessions(&self) -> Result<Vec<SessionInfo>> {
        self.call(Command::Sessions).await
    }

    /// Push a VM state change to every established client.
    pub fn notify_transition(&self, id: Uuid, state: RemoteVmState) -> Result<()> {
        self.send(Command::Broadcast(Request::VirtualMachineDidTransition {
            id,
            state,
        }))
    }

    pub fn notify_error(&self, id: Uuid, message: impl Into<String>) -> Result<()> {
        self.send(Command::Broadcast(Request::VirtualMachineDidError {
            id,
            message: message.into(),
        }))
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.call(Command::Shutdown).await
    }
}

pub struct SessionGateway;

impl SessionGateway {
    /// Start the gateway task.
    pub fn spawn(
        config: GatewayConfig,
        server_fingerprint: Fingerprint,
        registry: TrustRegistry,
        host: Arc<dyn VirtualMachineHost>,
    ) -> GatewayHandle {
        let (commands, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let actor = Gateway {
            config: Arc::new(config),
            server_fingerprint,
            registry,
            host,
            pending: HashMap::new(),
            handshaking: HashMap::new(),
            established: HashMap::new(),
            next_session_id: 1,
            events: events.clone(),
            commands: commands.downgrade(),
        };
        tokio::spawn(actor.run(rx));

        GatewayHandle { commands, events }
    }
}

struct Session {
    id: u64,
    peer: Arc<dyn PeerConnection>,
    remote_address: String,
    /// Host pushes, delivered in order by one task. Set once established.
    outbound: Option<mpsc::UnboundedSender<Request>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    fn close(self, reason: CloseReason) {
        self.peer.close(reason.as_str());
        for task in self.tasks {
            task.abort();
        }
    }
}

struct Gateway {
    config: Arc<GatewayConfig>,
    server_fingerprint: Fingerprint,
    registry: TrustRegistry,
    host: Arc<dyn VirtualMachineHost>,
    pending: HashMap<Fingerprint, Session>,
    handshaking: HashMap<Fingerprint, Session>,
    established: HashMap<Fingerprint, Session>,
    next_session_id: u64,
    events: broadcast::Sender<GatewayEvent>,
    commands: mpsc::WeakUnboundedSender<Command>,
}

impl Gateway {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        info!(
            "Session gateway started (server fingerprint {})",
            self.server_fingerprint.short()
        );

        while let Some(command) = rx.recv().await {
            match command {
                Command::Accept(peer) => self.accept(peer),
                Command::Approve(fp, reply) => {
                    let _ = reply.send(self.approve(fp));
                }
                Command::Block(fp, reply) => {
                    let _ = reply.send(self.block(fp));
                }
                Command::Forget(fp, reply) => {
                    let _ = reply.send(self.forget(fp));
                }
                Command::Disconnect(fp, reply) => {
                    let _ = reply.send(self.close_active(fp, CloseReason::Disconnected));
                }
                Command::DisconnectAll(reply) => {
                    let _ = reply.send(self.close_all_active(CloseReason::Disconnected));
                }
                Command::SetServerFingerprint(fp, reply) => {
                    info!(
                        "Server fingerprint changed {} -> {}",
                        self.server_fingerprint.short(),
                        fp.short()
                    );
                    self.server_fingerprint = fp;
                    self.close_everything(CloseReason::Reset);
                    let _ = reply.send(());
                }
                Command::ServerFingerprint(reply) => {
                    let _ = reply.send(self.server_fingerprint);
                }
                Command::Clients(reply) => {
                    let _ = reply.send(self.clients());
                }
                Command::Sessions(reply) => {
                    let _ = reply.send(self.sessions());
                }
                Command::Broadcast(request) => self.broadcast(request),
                Command::HandshakeCompleted {
                    fingerprint,
                    session_id,
                    result,
                } => self.handshake_completed(fingerprint, session_id, result),
                Command::PeerClosed {
                    fingerprint,
                    session_id,
                } => self.peer_closed(fingerprint, session_id),
                Command::Shutdown(reply) => {
                    self.close_everything(CloseReason::Shutdown);
                    let _ = reply.send(());
                    break;
                }
            }
        }

        self.close_everything(CloseReason::Shutdown);
        info!("Session gateway stopped");
    }

    fn emit(&self, event: GatewayEvent) {
        let _ = self.events.send(event);
    }

    fn accept(&mut self, peer: Arc<dyn PeerConnection>) {
        let remote_address = peer.remote_address();

        let Some(fingerprint) = peer.fingerprint() else {
            warn!("Rejecting {}: no client certificate", remote_address);
            peer.close(CLOSE_UNAUTHENTICATED);
            self.emit(GatewayEvent::Rejected {
                fingerprint: None,
                remote_address,
                reason: RejectReason::Unauthenticated,
            });
            return;
        };

        if self.registry.is_blocked(&fingerprint) {
            info!("Rejecting blocked client {} ({})", fingerprint.short(), remote_address);
            peer.close(CLOSE_BLOCKED);
            self.emit(GatewayEvent::Rejected {
                fingerprint: Some(fingerprint),
                remote_address,
                reason: RejectReason::Blocked,
            });
            return;
        }

        if let Err(e) = self.registry.record_seen(fingerprint, &remote_address) {
            warn!("Failed to record client {}: {}", fingerprint.short(), e);
        }

        let session = self.new_session(fingerprint, peer, remote_address.clone());

        if self.registry.is_approved(&fingerprint) {
            info!("Trusted client {} connected from {}", fingerprint.short(), remote_address);
            self.emit(GatewayEvent::TrustedConnection {
                fingerprint,
                remote_address,
            });
            self.begin_handshake(fingerprint, session);
        } else if self.config.autoblock {
            info!("Autoblocking unknown client {} ({})", fingerprint.short(), remote_address);
            session.close(CloseReason::Blocked);
            if let Err(e) = self.registry.block(fingerprint) {
                warn!("Failed to block {}: {}", fingerprint.short(), e);
            }
            self.emit(GatewayEvent::Rejected {
                fingerprint: Some(fingerprint),
                remote_address,
                reason: RejectReason::Autoblocked,
            });
        } else {
            if let Some(previous) = self.pending.remove(&fingerprint) {
                previous.close(CloseReason::Replaced);
            }
            info!(
                "Unknown client {} from {} is waiting for approval",
                fingerprint.short(),
                remote_address
            );
            self.pending.insert(fingerprint, session);
            self.emit(GatewayEvent::ApprovalRequested {
                fingerprint,
                combined: fingerprint.combined_with(&self.server_fingerprint),
                remote_address,
            });
        }
    }

    fn new_session(
        &mut self,
        fingerprint: Fingerprint,
        peer: Arc<dyn PeerConnection>,
        remote_address: String,
    ) -> Session {
        let id = self.next_session_id;
        self.next_session_id += 1;

        let watched = peer.clone();
        let commands = self.commands.clone();
        let watcher = tokio::spawn(async move {
            watched.closed().await;
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::PeerClosed {
                    fingerprint,
                    session_id: id,
                });
            }
        });

        Session {
            id,
            peer,
            remote_address,
            outbound: None,
            tasks: vec![watcher],
        }
    }

    fn begin_handshake(&mut self, fingerprint: Fingerprint, mut session: Session) {
        if let Some(previous) = self.handshaking.remove(&fingerprint) {
            previous.close(CloseReason::Replaced);
        }

        let peer = session.peer.clone();
        let session_id = session.id;
        let version = self.config.protocol_version;
        let deadline = self.config.handshake_timeout;
        let commands = self.commands.clone();
        session.tasks.push(tokio::spawn(async move {
            let result = match tokio::time::timeout(deadline, handshake::initiate(&*peer, version)).await {
                Ok(result) => result.map(|_| ()),
                Err(_) => Err(RemoteError::Timeout("Handshake timeout".to_string())),
            };
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::HandshakeCompleted {
                    fingerprint,
                    session_id,
                    result,
                });
            }
        }));

        self.handshaking.insert(fingerprint, session);
    }

    fn handshake_completed(&mut self, fingerprint: Fingerprint, session_id: u64, result: Result<()>) {
        if self
            .handshaking
            .get(&fingerprint)
            .is_none_or(|s| s.id != session_id)
        {
            debug!("Ignoring stale handshake for {}", fingerprint.short());
            return;
        }
        let Some(mut session) = self.handshaking.remove(&fingerprint) else {
            return;
        };

        if let Err(e) = result {
            warn!("Handshake with {} failed: {}", fingerprint.short(), e);
            let remote_address = session.remote_address.clone();
            session.peer.close("handshake failed");
            for task in session.tasks {
                task.abort();
            }
            self.emit(GatewayEvent::Rejected {
                fingerprint: Some(fingerprint),
                remote_address,
                reason: RejectReason::HandshakeFailed(e.to_string()),
            });
            return;
        }

        if let Some(previous) = self.established.remove(&fingerprint) {
            info!("Replacing previous session for {}", fingerprint.short());
            previous.close(CloseReason::Replaced);
            self.emit(GatewayEvent::Closed {
                fingerprint,
                reason: CloseReason::Replaced,
            });
        }

        session.tasks.push(tokio::spawn(serve_session(
            session.peer.clone(),
            self.host.clone(),
            self.config.clone(),
        )));
        let (outbound, pushes) = mpsc::unbounded_channel();
        session.tasks.push(tokio::spawn(deliver_pushes(
            fingerprint,
            session.id,
            session.peer.clone(),
            pushes,
            self.commands.clone(),
        )));
        session.outbound = Some(outbound);
        let remote_address = session.remote_address.clone();
        self.established.insert(fingerprint, session);

        info!("Session established with {} ({})", fingerprint.short(), remote_address);
        self.emit(GatewayEvent::Established {
            fingerprint,
            remote_address,
        });
    }

    fn peer_closed(&mut self, fingerprint: Fingerprint, session_id: u64) {
        let maps = [&mut self.pending, &mut self.handshaking, &mut self.established];
        let Some(session) = maps.into_iter().find_map(|map| {
            if map.get(&fingerprint).is_some_and(|s| s.id == session_id) {
                map.remove(&fingerprint)
            } else {
                None
            }
        }) else {
            return;
        };

        debug!("Connection from {} closed", fingerprint.short());
        session.close(CloseReason::TransportClosed);
        self.emit(GatewayEvent::Closed {
            fingerprint,
            reason: CloseReason::TransportClosed,
        });
    }

    fn approve(&mut self, fingerprint: Fingerprint) -> Result<()> {
        self.registry.approve(fingerprint)?;
        self.emit(GatewayEvent::TrustChanged {
            fingerprint,
            status: self.registry.status(&fingerprint),
        });

        if let Some(session) = self.pending.remove(&fingerprint) {
            self.begin_handshake(fingerprint, session);
        }
        Ok(())
    }

    fn block(&mut self, fingerprint: Fingerprint) -> Result<()> {
        self.registry.block(fingerprint)?;
        self.close_fingerprint(fingerprint, CloseReason::Blocked);
        self.emit(GatewayEvent::TrustChanged {
            fingerprint,
            status: self.registry.status(&fingerprint),
        });
        Ok(())
    }

    fn forget(&mut self, fingerprint: Fingerprint) -> Result<bool> {
        let known = self.registry.forget(fingerprint)?;
        self.close_fingerprint(fingerprint, CloseReason::Forgotten);
        if known {
            self.emit(GatewayEvent::TrustChanged {
                fingerprint,
                status: None,
            });
        }
        Ok(known)
    }

    /// Close every connection for `fingerprint`, parked or active.
    fn close_fingerprint(&mut self, fingerprint: Fingerprint, reason: CloseReason) {
        if let Some(session) = self.pending.remove(&fingerprint) {
            session.close(reason);
            self.emit(GatewayEvent::Closed {
                fingerprint,
                reason,
            });
        }
        self.close_active(fingerprint, reason);
    }

    /// Close handshaking and established sessions for `fingerprint`.
    fn close_active(&mut self, fingerprint: Fingerprint, reason: CloseReason) -> bool {
        let mut closed = false;
        for map in [&mut self.handshaking, &mut self.established] {
            if let Some(session) = map.remove(&fingerprint) {
                session.close(reason);
                closed = true;
            }
        }
        if closed {
            info!("Closed session for {} ({})", fingerprint.short(), reason.as_str());
            self.emit(GatewayEvent::Closed {
                fingerprint,
                reason,
            });
        }
        closed
    }

    fn close_all_active(&mut self, reason: CloseReason) -> usize {
        let fingerprints: Vec<Fingerprint> = self
            .handshaking
            .keys()
            .chain(self.established.keys())
            .copied()
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        fingerprints
            .into_iter()
            .filter(|fp| self.close_active(*fp, reason))
            .count()
    }

    fn close_everything(&mut self, reason: CloseReason) {
        let pending: Vec<Fingerprint> = self.pending.keys().copied().collect();
        for fingerprint in pending {
            self.close_fingerprint(fingerprint, reason);
        }
        self.close_all_active(reason);
    }

    fn clients(&self) -> Vec<ClientRecord> {
        self.registry
            .all_seen()
            .into_iter()
            .filter_map(|entry| {
                let status = self.registry.status(&entry.fingerprint)?;
                let fp = entry.fingerprint;
                let session = if self.established.contains_key(&fp) {
                    Some(SessionState::Established)
                } else if self.handshaking.contains_key(&fp) {
                    Some(SessionState::Handshaking)
                } else if self.pending.contains_key(&fp) {
                    Some(SessionState::Pending)
                } else {
                    None
                };
                Some(ClientRecord {
                    entry,
                    status,
                    session,
                })
            })
            .collect()
    }

    fn sessions(&self) -> Vec<SessionInfo> {
        let states = [
            (&self.pending, SessionState::Pending),
            (&self.handshaking, SessionState::Handshaking),
            (&self.established, SessionState::Established),
        ];
        states
            .into_iter()
            .flat_map(|(map, state)| {
                map.iter().map(move |(fp, session)| SessionInfo {
                    fingerprint: *fp,
                    remote_address: session.remote_address.clone(),
                    state,
                })
            })
            .collect()
    }

    /// Queue `request` for every established session.
    fn broadcast(&self, request: Request) {
        for (fingerprint, session) in &self.established {
            let Some(outbound) = &session.outbound else {
                continue;
            };
            if outbound.send(request.clone()).is_err() {
                debug!("Push queue for {} is closed", fingerprint.short());
            }
        }
    }
}

/// Deliver pushes to one client in the order they were queued.
///
/// A transport failure closes the connection and ends the session.
async fn deliver_pushes(
    fingerprint: Fingerprint,
    session_id: u64,
    peer: Arc<dyn PeerConnection>,
    mut pushes: mpsc::UnboundedReceiver<Request>,
    commands: mpsc::WeakUnboundedSender<Command>,
) {
    while let Some(request) = pushes.recv().await {
        match peer.request(request).await.and_then(Reply::into_result) {
            Ok(_) => {}
            Err(RemoteError::Remote(message)) => {
                error!("Client {} returned error on broadcast: {}", fingerprint.short(), message);
            }
            Err(e) => {
                warn!("Broadcast to {} failed: {}", fingerprint.short(), e);
                peer.close("broadcast failed");
                if let Some(commands) = commands.upgrade() {
                    let _ = commands.send(Command::PeerClosed {
                        fingerprint,
                        session_id,
                    });
                }
                break;
            }
        }
    }
}

/// Request handlers still running for a session. Dropping it cancels them.
#[derive(Default)]
struct InFlight(Vec<JoinHandle<()>>);

impl InFlight {
    fn spawn<F>(&mut self, handler: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.0.retain(|task| !task.is_finished());
        self.0.push(tokio::spawn(handler));
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        for task in &self.0 {
            task.abort();
        }
    }
}

/// Answer requests from one established client until the connection ends.
async fn serve_session(
    peer: Arc<dyn PeerConnection>,
    host: Arc<dyn VirtualMachineHost>,
    config: Arc<GatewayConfig>,
) {
    let mut authenticated = false;
    let mut in_flight = InFlight::default();

    loop {
        let IncomingRequest { request, responder } = match peer.next_request().await {
            Ok(Some(incoming)) => incoming,
            Ok(None) => break,
            Err(e) => {
                debug!("Session request error: {}", e);
                break;
            }
        };

        match request {
            Request::ServerHandshake { version, password } => {
                if version != config.protocol_version {
                    debug!(
                        "Client handshake version {} (ours: {})",
                        version, config.protocol_version
                    );
                }
                let (reply, ok) = handshake::answer_server(
                    config.protocol_version,
                    &config.model,
                    config.password.as_deref(),
                    password.as_deref(),
                );
                if !ok {
                    warn!("Client {} failed password check", peer.remote_address());
                }
                authenticated = ok;
                responder.respond(reply);
            }
            _ if !authenticated => {
                responder.respond(Reply::error(RemoteError::NotAuthenticated.to_string()));
            }
            request => {
                let host = host.clone();
                in_flight.spawn(async move {
                    responder.respond(dispatch(&*host, request).await);
                });
            }
        }
    }

    peer.close("session ended");
}

async fn dispatch(host: &dyn VirtualMachineHost, request: Request) -> Reply {
    debug!("Handling {}", request.name());
    let result = match request {
        Request::ListVirtualMachines => {
            return match host.list().await {
                Ok(machines) => Reply::VirtualMachines { machines },
                Err(e) => Reply::error(e.to_string()),
            };
        }
        Request::StartVirtualMachine { id } => host.start(id).await,
        Request::StopVirtualMachine { id, method } => host.stop(id, method).await,
        Request::RestartVirtualMachine { id } => host.restart(id).await,
        Request::PauseVirtualMachine { id } => host.pause(id).await,
        Request::ResumeVirtualMachine { id } => host.resume(id).await,
        Request::SaveSnapshot { id, name } => host.save_snapshot(id, name).await,
        Request::DeleteSnapshot { id, name } => host.delete_snapshot(id, name).await,
        Request::RestoreSnapshot { id, name } => host.restore_snapshot(id, name).await,
        other => Err(RemoteError::Protocol(format!(
            "Unsupported request: {}",
            other.name()
        ))),
    };
    Reply::from_result(result)
}
