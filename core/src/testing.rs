//! In-process stand-ins for the transport and the hypervisor.

use crate::error::{RemoteError, Result};
use crate::identity::Identity;
use crate::peer::{IncomingRequest, PeerConnection};
use crate::protocol::{Reply, Request};
use crate::vm::{RemoteVmState, StopMethod, VirtualMachineHost, VirtualMachineInfo};
use async_trait::async_trait;
use parking_lot::Mutex;
use rustls::pki_types::CertificateDer;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

type Envelope = (Request, oneshot::Sender<Reply>);

static NEXT_ADDRESS: AtomicU64 = AtomicU64::new(1);

/// One end of an in-memory connection. Closing either end closes both.
pub struct MemoryPeer {
    remote_certificate: Option<CertificateDer<'static>>,
    remote_address: String,
    outgoing: mpsc::UnboundedSender<Envelope>,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Envelope>>,
    closed: Arc<watch::Sender<bool>>,
    close_reason: Arc<Mutex<Option<String>>>,
}

/// Connected pair without certificates.
pub fn peer_pair() -> (MemoryPeer, MemoryPeer) {
    build_pair(None, None)
}

/// Connected pair where each end sees the other's certificate, as after mutual TLS.
pub fn authenticated_pair(a: &Identity, b: &Identity) -> (MemoryPeer, MemoryPeer) {
    build_pair(Some(b.certificate()), Some(a.certificate()))
}

fn build_pair(
    a_sees: Option<CertificateDer<'static>>,
    b_sees: Option<CertificateDer<'static>>,
) -> (MemoryPeer, MemoryPeer) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    let closed = Arc::new(watch::Sender::new(false));
    let close_reason = Arc::new(Mutex::new(None));
    let a_addr = format!("memory-{}", NEXT_ADDRESS.fetch_add(1, Ordering::Relaxed));
    let b_addr = format!("memory-{}", NEXT_ADDRESS.fetch_add(1, Ordering::Relaxed));

    let a = MemoryPeer {
        remote_certificate: a_sees,
        remote_address: b_addr,
        outgoing: a_tx,
        incoming: tokio::sync::Mutex::new(a_rx),
        closed: closed.clone(),
        close_reason: close_reason.clone(),
    };
    let b = MemoryPeer {
        remote_certificate: b_sees,
        remote_address: a_addr,
        outgoing: b_tx,
        incoming: tokio::sync::Mutex::new(b_rx),
        closed,
        close_reason,
    };
    (a, b)
}

async fn wait_closed(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[async_trait]
impl PeerConnection for MemoryPeer {
    fn peer_certificate(&self) -> Option<CertificateDer<'static>> {
        self.remote_certificate.clone()
    }

    fn remote_address(&self) -> String {
        self.remote_address.clone()
    }

    async fn request(&self, request: Request) -> Result<Reply> {
        if self.is_closed() {
            return Err(RemoteError::SessionClosed);
        }
        let (tx, rx) = oneshot::channel();
        self.outgoing
            .send((request, tx))
            .map_err(|_| RemoteError::SessionClosed)?;

        tokio::select! {
            reply = rx => reply.map_err(|_| RemoteError::SessionClosed),
            _ = wait_closed(self.closed.subscribe()) => Err(RemoteError::SessionClosed),
        }
    }

    async fn next_request(&self) -> Result<Option<IncomingRequest>> {
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            biased;
            _ = wait_closed(self.closed.subscribe()) => Ok(None),
            envelope = incoming.recv() => {
                Ok(envelope.map(|(request, responder)| IncomingRequest::new(request, responder)))
            }
        }
    }

    fn close(&self, reason: &str) {
        let mut close_reason = self.close_reason.lock();
        if close_reason.is_none() {
            *close_reason = Some(reason.to_string());
        }
        self.closed.send_replace(true);
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Shared by both ends: the first `close` wins.
    fn close_reason(&self) -> Option<String> {
        self.close_reason.lock().clone()
    }

    async fn closed(&self) {
        wait_closed(self.closed.subscribe()).await;
    }
}

impl Drop for MemoryPeer {
    fn drop(&mut self) {
        self.close("dropped");
    }
}

/// Scriptable [`VirtualMachineHost`] that records every call.
pub struct MockHost {
    machines: Mutex<Vec<VirtualMachineInfo>>,
    calls: Mutex<Vec<String>>,
    failure: Mutex<Option<String>>,
    delay: Duration,
}

impl MockHost {
    pub fn new(machines: Vec<VirtualMachineInfo>) -> Self {
        Self {
            machines: Mutex::new(machines),
            calls: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
            delay: Duration::ZERO,
        }
    }

    /// Every operation sleeps for `delay` before completing.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Make the next operation fail with `message`.
    pub fn fail_next(&self, message: &str) {
        *self.failure.lock() = Some(message.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn state(&self, id: Uuid) -> Option<RemoteVmState> {
        self.machines
            .lock()
            .iter()
            .find(|vm| vm.id == id)
            .map(|vm| vm.state)
    }

    async fn operate(&self, call: String, id: Uuid, to: Option<RemoteVmState>) -> Result<()> {
        self.calls.lock().push(call);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(message) = self.failure.lock().take() {
            return Err(RemoteError::Remote(message));
        }

        let mut machines = self.machines.lock();
        let vm = machines
            .iter_mut()
            .find(|vm| vm.id == id)
            .ok_or(RemoteError::VirtualMachineNotFound(id))?;
        if let Some(to) = to {
            vm.state = to;
        }
        Ok(())
    }
}

#[async_trait]
impl VirtualMachineHost for MockHost {
    async fn list(&self) -> Result<Vec<VirtualMachineInfo>> {
        self.calls.lock().push("list".to_string());
        Ok(self.machines.lock().clone())
    }

    async fn start(&self, id: Uuid) -> Result<()> {
        self.operate(format!("start {}", id), id, Some(RemoteVmState::Started))
            .await
    }

    async fn stop(&self, id: Uuid, method: StopMethod) -> Result<()> {
        self.operate(
            format!("stop {} {:?}", id, method),
            id,
            Some(RemoteVmState::Stopped),
        )
        .await
    }

    async fn restart(&self, id: Uuid) -> Result<()> {
        self.operate(format!("restart {}", id), id, Some(RemoteVmState::Started))
            .await
    }

    async fn pause(&self, id: Uuid) -> Result<()> {
        self.operate(format!("pause {}", id), id, Some(RemoteVmState::Paused))
            .await
    }

    async fn resume(&self, id: Uuid) -> Result<()> {
        self.operate(format!("resume {}", id), id, Some(RemoteVmState::Started))
            .await
    }

    async fn save_snapshot(&self, id: Uuid, name: Option<String>) -> Result<()> {
        self.operate(format!("save {} {:?}", id, name), id, None).await
    }

    async fn delete_snapshot(&self, id: Uuid, name: Option<String>) -> Result<()> {
        self.operate(format!("delete {} {:?}", id, name), id, None)
            .await
    }

    async fn restore_snapshot(&self, id: Uuid, name: Option<String>) -> Result<()> {
        self.operate(format!("restore {} {:?}", id, name), id, None)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_request_reply_both_directions() {
        let (a, b) = peer_pair();

        let serve = async {
            let incoming = b.next_request().await.unwrap().unwrap();
            assert_eq!(incoming.request, Request::ListVirtualMachines);
            incoming.respond(Reply::Ok);
        };
        let (reply, _) = tokio::join!(a.request(Request::ListVirtualMachines), serve);
        assert_eq!(reply.unwrap(), Reply::Ok);

        let serve = async {
            let incoming = a.next_request().await.unwrap().unwrap();
            incoming.respond(Reply::ClientHandshake { version: 1 });
        };
        let (reply, _) = tokio::join!(b.request(Request::ClientHandshake { version: 1 }), serve);
        assert_eq!(reply.unwrap(), Reply::ClientHandshake { version: 1 });
    }

    #[tokio::test]
    async fn test_close_is_shared() {
        let (a, b) = peer_pair();
        a.close("bye");

        assert!(b.is_closed());
        b.closed().await;
        assert!(b.next_request().await.unwrap().is_none());
        assert!(matches!(
            b.request(Request::ListVirtualMachines).await,
            Err(RemoteError::SessionClosed)
        ));
        assert_eq!(b.close_reason().as_deref(), Some("bye"));
    }

    #[tokio::test]
    async fn test_pending_request_fails_on_close() {
        let (a, b) = peer_pair();
        let request = tokio::spawn(async move { a.request(Request::ListVirtualMachines).await });

        let incoming = b.next_request().await.unwrap().unwrap();
        b.close("gone");
        drop(incoming);

        assert!(matches!(
            request.await.unwrap(),
            Err(RemoteError::SessionClosed)
        ));
    }
}
