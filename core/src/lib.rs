pub mod client;
pub mod discovery;
pub mod error;
pub mod fingerprint;
pub mod gateway;
pub mod handshake;
pub mod identity;
pub mod peer;
pub mod protocol;
pub mod sequencer;
pub mod storage;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transport;
pub mod trust;
pub mod vm;

pub use client::{ClientEvent, RemoteClient, RemoteClientConfig, RemoteServer, RemoteVirtualMachine};
pub use discovery::{Advertisement, DiscoveredEndpoint, EndpointScan, SERVICE_TYPE};
pub use error::{RemoteError, Result};
pub use fingerprint::Fingerprint;
pub use gateway::{
    ApprovalDecision, ClientRecord, CloseReason, GatewayConfig, GatewayEvent, GatewayHandle,
    RejectReason, SessionGateway, SessionInfo, SessionState,
};
pub use identity::{FileSecureStorage, Identity, IdentityStore, MemorySecureStorage, Role, SecureStorage};
pub use peer::{IncomingRequest, PeerConnection};
pub use protocol::{PROTOCOL_VERSION, Reply, Request};
pub use sequencer::{OperationSequencer, SequencerState};
pub use transport::{QuicPeer, QuicTransport};
pub use trust::{JsonFileTrustStore, MemoryTrustStore, TrustEntry, TrustRegistry, TrustStatus, TrustStore};
pub use vm::{RemoteVmState, StopMethod, VirtualMachineHost, VirtualMachineInfo};
