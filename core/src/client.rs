use crate::discovery::{self, DiscoveredEndpoint, EndpointTable, SERVICE_TYPE};
use crate::error::{RemoteError, Result};
use crate::fingerprint::Fingerprint;
use crate::handshake::{self, ServerInfo};
use crate::identity::Identity;
use crate::peer::{IncomingRequest, PeerConnection};
use crate::protocol::{
    CLOSE_BLOCKED, CLOSE_UNAUTHENTICATED, PROTOCOL_VERSION, Reply, Request, unexpected,
};
use crate::sequencer::{OperationSequencer, SequencerState};
use crate::transport::QuicTransport;
use crate::vm::{RemoteVmState, StopMethod, VirtualMachineInfo};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 100;

/// The host answers `ServerHandshake` only after its operator approves us.
pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct RemoteClientConfig {
    pub service_type: String,
    pub protocol_version: u32,
    pub approval_timeout: Duration,
}

impl Default for RemoteClientConfig {
    fn default() -> Self {
        Self {
            service_type: SERVICE_TYPE.to_string(),
            protocol_version: PROTOCOL_VERSION,
            approval_timeout: DEFAULT_APPROVAL_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    EndpointsChanged(Vec<DiscoveredEndpoint>),
    Connected {
        server_fingerprint: Fingerprint,
        model: String,
    },
    Disconnected {
        server_fingerprint: Fingerprint,
    },
    VirtualMachineTransitioned {
        id: Uuid,
        state: RemoteVmState,
    },
    VirtualMachineError {
        id: Uuid,
        message: String,
    },
}

/// Finds hosts on the local network and opens sessions to them.
pub struct RemoteClient {
    identity: Identity,
    config: RemoteClientConfig,
    endpoints: Arc<RwLock<EndpointTable>>,
    scan_task: Mutex<Option<JoinHandle<()>>>,
    transport: Mutex<Option<Arc<QuicTransport>>>,
    event_tx: broadcast::Sender<ClientEvent>,
}

impl RemoteClient {
    pub fn new(identity: Identity, config: RemoteClientConfig) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            identity,
            config,
            endpoints: Arc::new(RwLock::new(EndpointTable::new())),
            scan_task: Mutex::new(None),
            transport: Mutex::new(None),
            event_tx,
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.identity.fingerprint()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.event_tx.subscribe()
    }

    pub fn endpoints(&self) -> Vec<DiscoveredEndpoint> {
        self.endpoints.read().snapshot()
    }

    /// Browse for hosts until [`stop_scanning`](Self::stop_scanning). Restarts a running scan.
    pub fn start_scanning(&self) -> Result<()> {
        let mut scan = discovery::scan(&self.config.service_type)?;
        let endpoints = self.endpoints.clone();
        let event_tx = self.event_tx.clone();

        let task = tokio::spawn(async move {
            while let Some(snapshot) = scan.next().await {
                replace_endpoints(&endpoints, &event_tx, snapshot);
            }
        });

        if let Some(previous) = self.scan_task.lock().replace(task) {
            previous.abort();
        }
        Ok(())
    }

    pub fn stop_scanning(&self) {
        if let Some(task) = self.scan_task.lock().take() {
            task.abort();
            debug!("Stopped scanning");
        }
    }

    /// Replace the endpoint set with a complete snapshot.
    pub fn did_find_endpoints(&self, endpoints: Vec<DiscoveredEndpoint>) {
        replace_endpoints(&self.endpoints, &self.event_tx, endpoints);
    }

    fn transport(&self) -> Result<Arc<QuicTransport>> {
        let mut guard = self.transport.lock();
        if let Some(transport) = guard.as_ref() {
            return Ok(transport.clone());
        }
        let transport = Arc::new(QuicTransport::client(&self.identity)?);
        *guard = Some(transport.clone());
        Ok(transport)
    }

    /// Connect to a scanned endpoint. Fails with `EndpointNotFound` when it is no longer listed.
    pub async fn connect(&self, endpoint_id: &str, password: Option<String>) -> Result<RemoteServer> {
        let address = self
            .endpoints
            .read()
            .get(endpoint_id)
            .and_then(DiscoveredEndpoint::preferred_address)
            .ok_or(RemoteError::EndpointNotFound)?;

        info!("Connecting to {} at {}", endpoint_id, address);
        let peer = self.transport()?.connect(address).await?;
        self.connect_peer(peer, password).await
    }

    /// Run the session setup over an already connected peer.
    ///
    /// Waits for the host operator to approve this client, bounded by the approval timeout.
    pub async fn connect_peer<P: PeerConnection>(
        &self,
        peer: P,
        password: Option<String>,
    ) -> Result<RemoteServer> {
        let server_fingerprint = peer.fingerprint().ok_or(RemoteError::FingerprintUnavailable)?;
        let peer: Arc<dyn PeerConnection> = Arc::new(peer);
        let machines: Machines = Arc::new(Mutex::new(HashMap::new()));

        let serve_task = tokio::spawn(serve_host(
            peer.clone(),
            self.config.protocol_version,
            server_fingerprint,
            machines.clone(),
            self.event_tx.clone(),
        ));

        let handshake = tokio::time::timeout(
            self.config.approval_timeout,
            handshake::initiate_server(&*peer, self.config.protocol_version, password),
        )
        .await
        .unwrap_or_else(|_| Err(RemoteError::Timeout("Waiting for host approval".to_string())));

        let info = match handshake {
            Ok(info) => info,
            Err(e) => {
                let e = rejection(&*peer, e);
                warn!("Session with {} failed: {}", server_fingerprint.short(), e);
                peer.close("handshake failed");
                serve_task.abort();
                return Err(e);
            }
        };

        info!(
            "Connected to {} ({}, version {})",
            server_fingerprint.short(),
            info.model,
            info.version
        );
        let _ = self.event_tx.send(ClientEvent::Connected {
            server_fingerprint,
            model: info.model.clone(),
        });

        Ok(RemoteServer {
            inner: Arc::new(ServerInner {
                peer,
                fingerprint: server_fingerprint,
                info,
                machines,
                serve_task,
                event_tx: self.event_tx.clone(),
            }),
        })
    }
}

/// Prefer the host's stated policy reason over the transport error it caused.
fn rejection(peer: &dyn PeerConnection, error: RemoteError) -> RemoteError {
    match peer.close_reason().as_deref() {
        Some(CLOSE_BLOCKED) => RemoteError::PeerBlocked,
        Some(CLOSE_UNAUTHENTICATED) => RemoteError::NotAuthenticated,
        _ => error,
    }
}

impl Drop for RemoteClient {
    fn drop(&mut self) {
        self.stop_scanning();
    }
}

fn replace_endpoints(
    table: &RwLock<EndpointTable>,
    event_tx: &broadcast::Sender<ClientEvent>,
    endpoints: Vec<DiscoveredEndpoint>,
) {
    {
        let mut table = table.write();
        table.clear();
        for endpoint in endpoints.iter().cloned() {
            table.resolved(endpoint);
        }
    }
    let _ = event_tx.send(ClientEvent::EndpointsChanged(endpoints));
}

type Machines = Arc<Mutex<HashMap<Uuid, Tracked>>>;

struct Tracked {
    info: VirtualMachineInfo,
    sequencer: OperationSequencer,
}

/// Answer host-initiated requests: the version check and state pushes.
async fn serve_host(
    peer: Arc<dyn PeerConnection>,
    version: u32,
    server_fingerprint: Fingerprint,
    machines: Machines,
    event_tx: broadcast::Sender<ClientEvent>,
) {
    loop {
        let IncomingRequest { request, responder } = match peer.next_request().await {
            Ok(Some(incoming)) => incoming,
            Ok(None) => break,
            Err(e) => {
                debug!("Host request error: {}", e);
                break;
            }
        };

        let reply = match request {
            Request::ClientHandshake { .. } => handshake::answer(version),
            Request::VirtualMachineDidTransition { id, state } => {
                machines
                    .lock()
                    .entry(id)
                    .and_modify(|vm| {
                        vm.info.state = state;
                        vm.sequencer.apply_remote_state(state);
                    })
                    .or_insert_with(|| Tracked {
                        info: VirtualMachineInfo {
                            id,
                            name: String::new(),
                            is_suspended: false,
                            state,
                        },
                        sequencer: OperationSequencer::new(state),
                    });
                let _ = event_tx.send(ClientEvent::VirtualMachineTransitioned { id, state });
                Reply::Ok
            }
            Request::VirtualMachineDidError { id, message } => {
                warn!("VM {} reported error: {}", id, message);
                let _ = event_tx.send(ClientEvent::VirtualMachineError { id, message });
                Reply::Ok
            }
            other => Reply::error(
                RemoteError::Protocol(format!("Unsupported request: {}", other.name())).to_string(),
            ),
        };
        responder.respond(reply);
    }

    info!("Disconnected from {}", server_fingerprint.short());
    let _ = event_tx.send(ClientEvent::Disconnected { server_fingerprint });
}

struct ServerInner {
    peer: Arc<dyn PeerConnection>,
    fingerprint: Fingerprint,
    info: ServerInfo,
    machines: Machines,
    serve_task: JoinHandle<()>,
    event_tx: broadcast::Sender<ClientEvent>,
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        self.peer.close("client closed");
        self.serve_task.abort();
    }
}

/// An established, authenticated session with one host.
#[derive(Clone)]
pub struct RemoteServer {
    inner: Arc<ServerInner>,
}

impl RemoteServer {
    pub fn fingerprint(&self) -> Fingerprint {
        self.inner.fingerprint
    }

    pub fn model(&self) -> &str {
        &self.inner.info.model
    }

    pub fn version(&self) -> u32 {
        self.inner.info.version
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.event_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        !self.inner.peer.is_closed()
    }

    pub fn disconnect(&self) {
        self.inner.peer.close("disconnected");
    }

    /// Fetch the host's VM list and refresh the local view of each VM.
    pub async fn list_virtual_machines(&self) -> Result<Vec<RemoteVirtualMachine>> {
        let reply = self
            .inner
            .peer
            .request(Request::ListVirtualMachines)
            .await?
            .into_result()?;
        let Reply::VirtualMachines { machines } = reply else {
            return Err(unexpected(&reply));
        };

        let mut tracked = self.inner.machines.lock();
        let listed = machines
            .into_iter()
            .map(|info| {
                let sequencer = match tracked.get_mut(&info.id) {
                    Some(vm) => {
                        vm.info = info.clone();
                        vm.sequencer.apply_remote_state(info.state);
                        vm.sequencer.clone()
                    }
                    None => {
                        let sequencer = OperationSequencer::new(info.state);
                        tracked.insert(
                            info.id,
                            Tracked {
                                info: info.clone(),
                                sequencer: sequencer.clone(),
                            },
                        );
                        sequencer
                    }
                };
                self.wrap(info, sequencer)
            })
            .collect();
        Ok(listed)
    }

    /// A VM seen by an earlier listing or push.
    pub fn virtual_machine(&self, id: Uuid) -> Option<RemoteVirtualMachine> {
        let tracked = self.inner.machines.lock();
        tracked
            .get(&id)
            .map(|vm| self.wrap(vm.info.clone(), vm.sequencer.clone()))
    }

    fn wrap(&self, info: VirtualMachineInfo, sequencer: OperationSequencer) -> RemoteVirtualMachine {
        RemoteVirtualMachine {
            info,
            peer: self.inner.peer.clone(),
            sequencer,
        }
    }
}

/// Client-side handle to one VM on the host.
///
/// State-changing calls go through the VM's sequencer, so at most one runs at a time and
/// host pushes received meanwhile take precedence once it ends.
#[derive(Clone)]
pub struct RemoteVirtualMachine {
    info: VirtualMachineInfo,
    peer: Arc<dyn PeerConnection>,
    sequencer: OperationSequencer,
}

impl RemoteVirtualMachine {
    pub fn id(&self) -> Uuid {
        self.info.id
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn is_suspended(&self) -> bool {
        self.info.is_suspended
    }

    pub fn state(&self) -> RemoteVmState {
        self.sequencer.current()
    }

    pub fn watch(&self) -> watch::Receiver<SequencerState> {
        self.sequencer.subscribe()
    }

    async fn perform(
        &self,
        precondition: &[RemoteVmState],
        transitional: RemoteVmState,
        postcondition: Option<RemoteVmState>,
        request: Request,
    ) -> Result<()> {
        let peer = self.peer.clone();
        self.sequencer
            .perform(Some(precondition), transitional, postcondition, move || async move {
                peer.request(request).await?.expect_ok()
            })
            .await
    }

    pub async fn start(&self) -> Result<()> {
        use RemoteVmState::*;
        self.perform(
            &[Stopped],
            Starting,
            Some(Started),
            Request::StartVirtualMachine { id: self.id() },
        )
        .await
    }

    pub async fn stop(&self, method: StopMethod) -> Result<()> {
        use RemoteVmState::*;
        self.perform(
            &[Started, Paused],
            Stopping,
            Some(Stopped),
            Request::StopVirtualMachine {
                id: self.id(),
                method,
            },
        )
        .await
    }

    pub async fn restart(&self) -> Result<()> {
        use RemoteVmState::*;
        self.perform(
            &[Started, Paused],
            Stopping,
            Some(Started),
            Request::RestartVirtualMachine { id: self.id() },
        )
        .await
    }

    pub async fn pause(&self) -> Result<()> {
        use RemoteVmState::*;
        self.perform(
            &[Started],
            Pausing,
            Some(Paused),
            Request::PauseVirtualMachine { id: self.id() },
        )
        .await
    }

    pub async fn resume(&self) -> Result<()> {
        use RemoteVmState::*;
        self.perform(
            &[Paused],
            Resuming,
            Some(Started),
            Request::ResumeVirtualMachine { id: self.id() },
        )
        .await
    }

    pub async fn save_snapshot(&self, name: Option<String>) -> Result<()> {
        use RemoteVmState::*;
        self.perform(
            &[Started, Paused],
            Saving,
            None,
            Request::SaveSnapshot { id: self.id(), name },
        )
        .await
    }

    pub async fn delete_snapshot(&self, name: Option<String>) -> Result<()> {
        self.peer
            .request(Request::DeleteSnapshot { id: self.id(), name })
            .await?
            .expect_ok()
    }

    pub async fn restore_snapshot(&self, name: Option<String>) -> Result<()> {
        self.peer
            .request(Request::RestoreSnapshot { id: self.id(), name })
            .await?
            .expect_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{IdentityStore, MemorySecureStorage, Role};
    use crate::testing::{MemoryPeer, authenticated_pair, peer_pair};
    use std::net::SocketAddr;

    fn identity(role: Role) -> Identity {
        IdentityStore::new(role, "test", Box::new(MemorySecureStorage::new()))
            .load()
            .unwrap()
    }

    fn linux_vm(state: RemoteVmState) -> VirtualMachineInfo {
        VirtualMachineInfo {
            id: Uuid::new_v4(),
            name: "Linux".into(),
            is_suspended: false,
            state,
        }
    }

    /// Minimal host: handshakes first, then answers every request with `Ok` or the VM list.
    fn scripted_host(host: MemoryPeer, machines: Vec<VirtualMachineInfo>) -> JoinHandle<Vec<Request>> {
        tokio::spawn(async move {
            handshake::initiate(&host, PROTOCOL_VERSION).await.unwrap();
            let mut seen = Vec::new();
            while let Ok(Some(incoming)) = host.next_request().await {
                let reply = match &incoming.request {
                    Request::ServerHandshake { version, .. } => Reply::ServerHandshake {
                        version: *version,
                        is_authenticated: true,
                        model: "test".into(),
                    },
                    Request::ListVirtualMachines => Reply::VirtualMachines {
                        machines: machines.clone(),
                    },
                    Request::PauseVirtualMachine { .. } => Reply::error("cannot pause"),
                    _ => Reply::Ok,
                };
                seen.push(incoming.request.clone());
                incoming.respond(reply);
            }
            seen
        })
    }

    #[tokio::test]
    async fn test_connect_unknown_endpoint_fails() {
        let client = RemoteClient::new(identity(Role::Client), RemoteClientConfig::default());
        let result = client.connect("missing._utm_server._udp.local.", None).await;
        assert!(matches!(result, Err(RemoteError::EndpointNotFound)));
    }

    #[tokio::test]
    async fn test_endpoint_snapshot_replaces_previous() {
        let client = RemoteClient::new(identity(Role::Client), RemoteClientConfig::default());
        let mut events = client.subscribe();
        let endpoint = |id: &str| DiscoveredEndpoint {
            id: id.to_string(),
            display_name: id.to_string(),
            model: None,
            addresses: vec![SocketAddr::from(([10, 0, 0, 2], 4000))],
            last_seen: 0,
        };

        client.did_find_endpoints(vec![endpoint("a"), endpoint("b")]);
        client.did_find_endpoints(vec![endpoint("b")]);

        let ids: Vec<String> = client.endpoints().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["b".to_string()]);
        assert!(matches!(events.recv().await.unwrap(), ClientEvent::EndpointsChanged(e) if e.len() == 2));
        assert!(matches!(events.recv().await.unwrap(), ClientEvent::EndpointsChanged(e) if e.len() == 1));
    }

    #[tokio::test]
    async fn test_connect_requires_server_certificate() {
        let client = RemoteClient::new(identity(Role::Client), RemoteClientConfig::default());
        let (_host, client_end) = peer_pair();
        let result = client.connect_peer(client_end, None).await;
        assert!(matches!(result, Err(RemoteError::FingerprintUnavailable)));
    }

    #[tokio::test]
    async fn test_operations_follow_state_table() {
        let client_identity = identity(Role::Client);
        let server_identity = identity(Role::Server);
        let (client_end, host_end) = authenticated_pair(&client_identity, &server_identity);
        let vm = linux_vm(RemoteVmState::Stopped);
        let host = scripted_host(host_end, vec![vm.clone()]);

        let client = RemoteClient::new(client_identity, RemoteClientConfig::default());
        let server = client.connect_peer(client_end, None).await.unwrap();
        assert_eq!(server.fingerprint(), server_identity.fingerprint());
        assert_eq!(server.model(), "test");

        let machines = server.list_virtual_machines().await.unwrap();
        assert_eq!(machines.len(), 1);
        let remote = &machines[0];
        assert_eq!(remote.state(), RemoteVmState::Stopped);

        assert!(matches!(
            remote.pause().await,
            Err(RemoteError::IllegalTransition { .. })
        ));
        remote.start().await.unwrap();
        assert_eq!(remote.state(), RemoteVmState::Started);

        let failed = remote.pause().await;
        assert!(matches!(failed, Err(RemoteError::Remote(m)) if m == "cannot pause"));
        assert_eq!(remote.state(), RemoteVmState::Started);

        remote.save_snapshot(Some("before".into())).await.unwrap();
        assert_eq!(remote.state(), RemoteVmState::Started);
        remote.stop(StopMethod::Force).await.unwrap();
        assert_eq!(remote.state(), RemoteVmState::Stopped);
        remote.restore_snapshot(Some("before".into())).await.unwrap();

        server.disconnect();
        let seen = host.await.unwrap();
        assert!(seen.contains(&Request::StopVirtualMachine {
            id: vm.id,
            method: StopMethod::Force
        }));
    }

    #[tokio::test]
    async fn test_push_updates_tracked_vm() {
        let client_identity = identity(Role::Client);
        let server_identity = identity(Role::Server);
        let (client_end, host_end) = authenticated_pair(&client_identity, &server_identity);
        let vm = linux_vm(RemoteVmState::Stopped);
        let host_end = Arc::new(host_end);

        let host = {
            let host_end = host_end.clone();
            let machines = vec![vm.clone()];
            tokio::spawn(async move {
                handshake::initiate(&*host_end, PROTOCOL_VERSION).await.unwrap();
                while let Ok(Some(incoming)) = host_end.next_request().await {
                    let reply = match incoming.request {
                        Request::ServerHandshake { version, .. } => Reply::ServerHandshake {
                            version,
                            is_authenticated: true,
                            model: "test".into(),
                        },
                        _ => Reply::VirtualMachines {
                            machines: machines.clone(),
                        },
                    };
                    incoming.respond(reply);
                }
            })
        };

        let client = RemoteClient::new(client_identity, RemoteClientConfig::default());
        let server = client.connect_peer(client_end, None).await.unwrap();
        let mut events = server.subscribe();
        let remote = server.list_virtual_machines().await.unwrap().remove(0);

        host_end
            .request(Request::VirtualMachineDidTransition {
                id: vm.id,
                state: RemoteVmState::Started,
            })
            .await
            .unwrap()
            .expect_ok()
            .unwrap();

        assert_eq!(remote.state(), RemoteVmState::Started);
        assert_eq!(
            events.recv().await.unwrap(),
            ClientEvent::VirtualMachineTransitioned {
                id: vm.id,
                state: RemoteVmState::Started
            }
        );

        host_end.close("done");
        assert_eq!(
            events.recv().await.unwrap(),
            ClientEvent::Disconnected {
                server_fingerprint: server_identity.fingerprint()
            }
        );
        host.await.unwrap();
    }

    #[tokio::test]
    async fn test_approval_timeout_closes_connection() {
        let client_identity = identity(Role::Client);
        let server_identity = identity(Role::Server);
        let (client_end, host_end) = authenticated_pair(&client_identity, &server_identity);

        let config = RemoteClientConfig {
            approval_timeout: Duration::from_millis(50),
            ..RemoteClientConfig::default()
        };
        let client = RemoteClient::new(client_identity, config);
        let result = client.connect_peer(client_end, None).await;

        assert!(matches!(result, Err(RemoteError::Timeout(_))));
        assert!(host_end.is_closed());
    }

    /// Connect to a host that closes the connection with `reason` on the first request.
    async fn refused_with(reason: &'static str) -> RemoteError {
        let client_identity = identity(Role::Client);
        let server_identity = identity(Role::Server);
        let (client_end, host_end) = authenticated_pair(&client_identity, &server_identity);
        tokio::spawn(async move {
            let pending = host_end.next_request().await;
            host_end.close(reason);
            drop(pending);
        });

        let client = RemoteClient::new(client_identity, RemoteClientConfig::default());
        client.connect_peer(client_end, None).await.err().unwrap()
    }

    #[tokio::test]
    async fn test_policy_close_is_not_retryable() {
        let blocked = refused_with(CLOSE_BLOCKED).await;
        assert!(matches!(blocked, RemoteError::PeerBlocked));
        assert!(!blocked.is_retryable());

        let unauthenticated = refused_with(CLOSE_UNAUTHENTICATED).await;
        assert!(matches!(unauthenticated, RemoteError::NotAuthenticated));
        assert!(!unauthenticated.is_retryable());

        let reset = refused_with("server reset").await;
        assert!(matches!(reset, RemoteError::SessionClosed));
        assert!(reset.is_retryable());
    }
}
