use crate::error::Result;
use crate::fingerprint::Fingerprint;
use crate::protocol::{Reply, Request};
use async_trait::async_trait;
use rustls::pki_types::CertificateDer;
use tokio::sync::oneshot;

/// A mutually authenticated, request/reply connection to one remote party.
///
/// Both directions may issue requests; replies are matched to their request by the
/// implementation.
#[async_trait]
pub trait PeerConnection: Send + Sync + 'static {
    /// Leaf certificate presented by the remote party during the transport handshake.
    fn peer_certificate(&self) -> Option<CertificateDer<'static>>;

    /// Human-readable address, shown in approval prompts.
    fn remote_address(&self) -> String;

    async fn request(&self, request: Request) -> Result<Reply>;

    /// Next request initiated by the remote party, or `None` once the connection is closed.
    async fn next_request(&self) -> Result<Option<IncomingRequest>>;

    fn close(&self, reason: &str);

    fn is_closed(&self) -> bool;

    /// Reason the remote party gave when it closed the connection.
    fn close_reason(&self) -> Option<String>;

    /// Resolves once the connection has been closed from either side.
    async fn closed(&self);

    fn fingerprint(&self) -> Option<Fingerprint> {
        self.peer_certificate()
            .map(|cert| Fingerprint::of_certificate(cert.as_ref()))
    }
}

#[derive(Debug)]
pub struct IncomingRequest {
    pub request: Request,
    pub responder: Responder,
}

impl IncomingRequest {
    pub fn new(request: Request, responder: oneshot::Sender<Reply>) -> Self {
        Self {
            request,
            responder: Responder(responder),
        }
    }

    pub fn respond(self, reply: Reply) {
        self.responder.respond(reply);
    }
}

/// Sends the reply for one incoming request. Dropping it leaves the request unanswered.
#[derive(Debug)]
pub struct Responder(oneshot::Sender<Reply>);

impl Responder {
    pub fn respond(self, reply: Reply) {
        let _ = self.0.send(reply);
    }
}
