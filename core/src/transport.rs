use crate::error::{RemoteError, Result};
use crate::identity::Identity;
use crate::peer::{IncomingRequest, PeerConnection};
use crate::protocol::{self, ALPN_PROTOCOL, Reply, Request};
use async_trait::async_trait;
use quinn::{
    ClientConfig, Connection, Endpoint, IdleTimeout, Incoming, ServerConfig, TransportConfig, VarInt,
};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{WebPkiSupportedAlgorithms, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

const SERVER_NAME: &str = "utm-remote.local";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPTED_QUEUE: usize = 16;

// LAN-optimized transport parameters
const INITIAL_RTT_MS: u64 = 10;
const MAX_IDLE_TIMEOUT_MS: u32 = 60_000;
const KEEP_ALIVE_INTERVAL_SECS: u64 = 15;
const MAX_CONCURRENT_BIDI_STREAMS: u32 = 128;
const MAX_CONCURRENT_UNI_STREAMS: u32 = 0;

/// QUIC endpoint authenticated with one [`Identity`].
///
/// Both sides present a certificate. Neither verifier checks trust: the host gates on the
/// client fingerprint after accept, and the client records the server fingerprint.
pub struct QuicTransport {
    endpoint: Endpoint,
    /// Connections whose TLS handshake finished. `None` on client endpoints.
    accepted: Option<Mutex<mpsc::Receiver<QuicPeer>>>,
    accept_task: Option<JoinHandle<()>>,
}

impl QuicTransport {
    /// Host endpoint accepting inbound connections on `bind_addr`.
    pub fn bind(identity: &Identity, bind_addr: SocketAddr) -> Result<Self> {
        let mut endpoint = Endpoint::server(Self::create_server_config(identity)?, bind_addr)?;
        endpoint.set_default_client_config(Self::create_client_config(identity)?);
        info!("QUIC transport listening on {}", endpoint.local_addr()?);

        let (tx, rx) = mpsc::channel(ACCEPTED_QUEUE);
        let accept_task = tokio::spawn(accept_loop(endpoint.clone(), tx));
        Ok(Self {
            endpoint,
            accepted: Some(Mutex::new(rx)),
            accept_task: Some(accept_task),
        })
    }

    /// Client endpoint on an ephemeral port.
    pub fn client(identity: &Identity) -> Result<Self> {
        let mut endpoint = Endpoint::client(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))?;
        endpoint.set_default_client_config(Self::create_client_config(identity)?);
        Ok(Self {
            endpoint,
            accepted: None,
            accept_task: None,
        })
    }

    fn create_transport_config() -> TransportConfig {
        let mut transport = TransportConfig::default();
        transport.initial_rtt(Duration::from_millis(INITIAL_RTT_MS));
        transport.max_idle_timeout(Some(IdleTimeout::from(VarInt::from_u32(MAX_IDLE_TIMEOUT_MS))));
        transport.keep_alive_interval(Some(Duration::from_secs(KEEP_ALIVE_INTERVAL_SECS)));
        transport.max_concurrent_bidi_streams(VarInt::from_u32(MAX_CONCURRENT_BIDI_STREAMS));
        transport.max_concurrent_uni_streams(VarInt::from_u32(MAX_CONCURRENT_UNI_STREAMS));
        transport.datagram_receive_buffer_size(None);
        transport
    }

    fn create_server_config(identity: &Identity) -> Result<ServerConfig> {
        let mut server_crypto =
            rustls::ServerConfig::builder_with_provider(Arc::new(crypto_provider()))
                .with_protocol_versions(&[&rustls::version::TLS13])?
                .with_client_cert_verifier(Arc::new(AnyClientCert::new()))
                .with_single_cert(vec![identity.certificate()], identity.private_key())?;
        server_crypto.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

        let mut server_config = ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
                .map_err(|e| RemoteError::Tls(rustls::Error::General(e.to_string())))?,
        ));
        server_config.transport_config(Arc::new(Self::create_transport_config()));
        Ok(server_config)
    }

    fn create_client_config(identity: &Identity) -> Result<ClientConfig> {
        let mut client_crypto =
            rustls::ClientConfig::builder_with_provider(Arc::new(crypto_provider()))
                .with_protocol_versions(&[&rustls::version::TLS13])?
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AnyServerCert::new()))
                .with_client_auth_cert(vec![identity.certificate()], identity.private_key())?;
        client_crypto.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

        let mut client_config = ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
                .map_err(|e| RemoteError::Tls(rustls::Error::General(e.to_string())))?,
        ));
        client_config.transport_config(Arc::new(Self::create_transport_config()));
        Ok(client_config)
    }

    /// Next inbound connection that finished its TLS handshake.
    ///
    /// Returns `None` once the endpoint is closed, and always on client endpoints.
    pub async fn accept(&self) -> Option<QuicPeer> {
        self.accepted.as_ref()?.lock().await.recv().await
    }

    pub async fn connect(&self, addr: SocketAddr) -> Result<QuicPeer> {
        debug!("Establishing new connection to {}", addr);
        let connecting = self.endpoint.connect(addr, SERVER_NAME)?;
        let connection = timeout(CONNECT_TIMEOUT, connecting)
            .await
            .map_err(|_| RemoteError::Timeout("Connection timeout".to_string()))??;
        info!("Connected to {} (RTT: {:?})", addr, connection.rtt());
        Ok(QuicPeer::new(connection))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.endpoint.local_addr().map_err(RemoteError::Io)
    }

    pub async fn shutdown(&self) {
        self.endpoint.close(VarInt::from_u32(0), b"shutdown");
        self.endpoint.wait_idle().await;
        info!("QUIC transport shut down");
    }
}

impl Drop for QuicTransport {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}

/// Each handshake runs on its own task so a silent peer cannot hold up the others.
async fn accept_loop(endpoint: Endpoint, accepted: mpsc::Sender<QuicPeer>) {
    while let Some(incoming) = endpoint.accept().await {
        let accepted = accepted.clone();
        tokio::spawn(async move {
            if let Some(peer) = complete_handshake(incoming).await {
                let _ = accepted.send(peer).await;
            }
        });
    }
    debug!("QUIC accept loop stopped");
}

async fn complete_handshake(incoming: Incoming) -> Option<QuicPeer> {
    let remote_addr = incoming.remote_address();
    let connecting = match incoming.accept() {
        Ok(connecting) => connecting,
        Err(e) => {
            warn!("Failed to accept connection from {}: {}", remote_addr, e);
            return None;
        }
    };

    match timeout(CONNECT_TIMEOUT, connecting).await {
        Ok(Ok(connection)) => {
            debug!(
                "Accepted connection from {} (RTT: {:?})",
                remote_addr,
                connection.rtt()
            );
            Some(QuicPeer::new(connection))
        }
        Ok(Err(e)) => {
            warn!("Failed to complete connection from {}: {}", remote_addr, e);
            None
        }
        Err(_) => {
            warn!("Handshake with {} timed out", remote_addr);
            None
        }
    }
}

/// One QUIC connection. Every request travels on its own bidirectional stream.
#[derive(Clone)]
pub struct QuicPeer {
    connection: Connection,
}

impl QuicPeer {
    fn new(connection: Connection) -> Self {
        Self { connection }
    }

    pub fn remote_socket_addr(&self) -> SocketAddr {
        self.connection.remote_address()
    }
}

#[async_trait]
impl PeerConnection for QuicPeer {
    fn peer_certificate(&self) -> Option<CertificateDer<'static>> {
        let identity = self.connection.peer_identity()?;
        let certs = identity.downcast_ref::<Vec<CertificateDer<'static>>>()?;
        certs.first().cloned()
    }

    fn remote_address(&self) -> String {
        self.connection.remote_address().ip().to_string()
    }

    async fn request(&self, request: Request) -> Result<Reply> {
        trace!("-> {} to {}", request.name(), self.connection.remote_address());
        let (mut send, mut recv) = self.connection.open_bi().await?;
        protocol::write_frame(&mut send, &request).await?;
        send.finish()?;
        protocol::read_frame(&mut recv).await
    }

    async fn next_request(&self) -> Result<Option<IncomingRequest>> {
        loop {
            let (mut send, mut recv) = match self.connection.accept_bi().await {
                Ok(streams) => streams,
                Err(quinn::ConnectionError::ApplicationClosed(reason)) => {
                    debug!(
                        "Connection closed by peer: {} (reason: {:?})",
                        self.connection.remote_address(),
                        reason
                    );
                    return Ok(None);
                }
                Err(quinn::ConnectionError::LocallyClosed)
                | Err(quinn::ConnectionError::TimedOut)
                | Err(quinn::ConnectionError::Reset) => return Ok(None),
                Err(e) => return Err(e.into()),
            };

            let request: Request = match protocol::read_frame(&mut recv).await {
                Ok(request) => request,
                Err(e) => {
                    debug!("Failed to read request: {}", e);
                    continue;
                }
            };
            trace!("<- {} from {}", request.name(), self.connection.remote_address());

            let (tx, rx) = oneshot::channel::<Reply>();
            tokio::spawn(async move {
                let Ok(reply) = rx.await else {
                    return;
                };
                if let Err(e) = protocol::write_frame(&mut send, &reply).await {
                    debug!("Failed to write reply: {}", e);
                    return;
                }
                let _ = send.finish();
            });
            return Ok(Some(IncomingRequest::new(request, tx)));
        }
    }

    fn close(&self, reason: &str) {
        self.connection
            .close(VarInt::from_u32(0), reason.as_bytes());
    }

    fn is_closed(&self) -> bool {
        self.connection.close_reason().is_some()
    }

    fn close_reason(&self) -> Option<String> {
        match self.connection.close_reason()? {
            quinn::ConnectionError::ApplicationClosed(close) => {
                Some(String::from_utf8_lossy(&close.reason).into_owned())
            }
            _ => None,
        }
    }

    async fn closed(&self) {
        self.connection.closed().await;
    }
}

fn crypto_provider() -> rustls::crypto::CryptoProvider {
    rustls::crypto::ring::default_provider()
}

/// Accepts any server certificate but still checks handshake signatures.
#[derive(Debug)]
struct AnyServerCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl AnyServerCert {
    fn new() -> Self {
        Self {
            algorithms: crypto_provider().signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for AnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Requires a client certificate and accepts any, leaving the trust decision to the gateway.
#[derive(Debug)]
struct AnyClientCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl AnyClientCert {
    fn new() -> Self {
        Self {
            algorithms: crypto_provider().signature_verification_algorithms,
        }
    }
}

impl ClientCertVerifier for AnyClientCert {
    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::Fingerprint;
    use crate::identity::{IdentityStore, MemorySecureStorage, Role};

    fn identity(role: Role) -> Identity {
        IdentityStore::new(role, "test", Box::new(MemorySecureStorage::new()))
            .load()
            .unwrap()
    }

    #[tokio::test]
    async fn test_mutual_auth_exposes_fingerprints() {
        let server_identity = identity(Role::Server);
        let client_identity = identity(Role::Client);

        let server =
            QuicTransport::bind(&server_identity, SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
                .unwrap();
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, server.local_addr().unwrap().port()));
        let client = QuicTransport::client(&client_identity).unwrap();

        let (accepted, connected) = tokio::join!(server.accept(), client.connect(addr));
        let accepted = accepted.unwrap();
        let connected = connected.unwrap();

        assert_eq!(accepted.fingerprint(), Some(client_identity.fingerprint()));
        assert_eq!(
            connected.peer_certificate().map(|c| Fingerprint::of_certificate(c.as_ref())),
            Some(server_identity.fingerprint())
        );

        let serve = tokio::spawn(async move {
            let incoming = accepted.next_request().await.unwrap().unwrap();
            assert_eq!(incoming.request, Request::ListVirtualMachines);
            incoming.respond(Reply::VirtualMachines { machines: vec![] });
            accepted
        });
        let reply = connected.request(Request::ListVirtualMachines).await.unwrap();
        assert_eq!(reply, Reply::VirtualMachines { machines: vec![] });

        let accepted = serve.await.unwrap();
        connected.close("done");
        assert!(connected.is_closed());
        assert!(accepted.next_request().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stalled_handshake_does_not_block_accept() {
        let server_identity = identity(Role::Server);
        let server =
            QuicTransport::bind(&server_identity, SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
                .unwrap();
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, server.local_addr().unwrap().port()));

        // Relay that forwards only the first Initial packet, then goes silent.
        let relay = tokio::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let relay_addr = relay.local_addr().unwrap();
        let (forwarded_tx, forwarded) = oneshot::channel();
        let relay_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            let (len, _) = relay.recv_from(&mut buf).await.unwrap();
            relay.send_to(&buf[..len], addr).await.unwrap();
            let _ = forwarded_tx.send(());
            loop {
                if relay.recv_from(&mut buf).await.is_err() {
                    break;
                }
            }
        });

        let stalled = QuicTransport::client(&identity(Role::Client)).unwrap();
        let stalled_connect = tokio::spawn(async move { stalled.connect(relay_addr).await });
        forwarded.await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let honest_identity = identity(Role::Client);
        let honest = QuicTransport::client(&honest_identity).unwrap();
        let (accepted, connected) = tokio::join!(
            timeout(Duration::from_secs(5), server.accept()),
            honest.connect(addr)
        );
        let accepted = accepted.expect("accept was held up by the stalled handshake").unwrap();
        connected.unwrap();
        assert_eq!(accepted.fingerprint(), Some(honest_identity.fingerprint()));

        stalled_connect.abort();
        relay_task.abort();
    }
}
