use crate::vm::RemoteVmState;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("Failed to generate a key pair: {0}")]
    KeyGeneration(String),

    #[error("Secure storage error: {0}")]
    SecureStorage(String),

    #[error("Identity has not been loaded")]
    IdentityNotLoaded,

    #[error("Trust store error: {0}")]
    TrustStore(String),

    #[error("Invalid fingerprint: {0}")]
    InvalidFingerprint(String),

    #[error("Discovery error: {0}")]
    Discovery(String),

    #[error("mDNS error: {0}")]
    Mdns(#[from] mdns_sd::Error),

    #[error("The server has disappeared")]
    EndpointNotFound,

    #[error("Peer certificate fingerprint unavailable")]
    FingerprintUnavailable,

    #[error("Interface version mismatch (expected {expected}, received {received})")]
    VersionMismatch { expected: u32, received: u32 },

    #[error("Peer is blocked")]
    PeerBlocked,

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Password is required")]
    PasswordRequired,

    #[error("Password is incorrect")]
    PasswordInvalid,

    #[error("Session closed")]
    SessionClosed,

    #[error("Cannot find VM with ID: {0}")]
    VirtualMachineNotFound(uuid::Uuid),

    #[error("Cannot transition from {from} to {to}")]
    IllegalTransition {
        from: RemoteVmState,
        to: RemoteVmState,
    },

    #[error("Another operation is in progress (state: {0})")]
    OperationInProgress(RemoteVmState),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("QUIC connection error: {0}")]
    QuicConnection(#[from] quinn::ConnectionError),

    #[error("QUIC connect error: {0}")]
    QuicConnect(#[from] quinn::ConnectError),

    #[error("QUIC write error: {0}")]
    QuicWrite(#[from] quinn::WriteError),

    #[error("QUIC read error: {0}")]
    QuicRead(#[from] quinn::ReadExactError),

    #[error("QUIC stream closed: {0}")]
    QuicClosedStream(#[from] quinn::ClosedStream),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("Certificate generation error: {0}")]
    CertGen(#[from] rcgen::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Gateway is not running")]
    GatewayStopped,
}

impl RemoteError {
    /// Whether the caller may retry once the blocking condition clears.
    ///
    /// Policy rejections (blocked peer, bad password, version mismatch) return `false`
    /// and must not be retried automatically.
    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteError::OperationInProgress(_)
            | RemoteError::IllegalTransition { .. }
            | RemoteError::EndpointNotFound
            | RemoteError::Timeout(_)
            | RemoteError::SessionClosed
            | RemoteError::QuicConnection(_)
            | RemoteError::QuicConnect(_)
            | RemoteError::QuicWrite(_)
            | RemoteError::QuicRead(_)
            | RemoteError::QuicClosedStream(_)
            | RemoteError::Io(_)
            | RemoteError::KeyGeneration(_)
            | RemoteError::SecureStorage(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, RemoteError>;
