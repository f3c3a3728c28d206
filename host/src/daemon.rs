//! Listener lifecycle and console command handling.

use crate::config::HostConfig;
use crate::console::{self, ConsoleCommand};
use anyhow::{Context, Result};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use utm_remote_core::discovery;
use utm_remote_core::{Fingerprint, GatewayHandle, Identity, IdentityStore, QuicTransport};

/// QUIC endpoint plus its mDNS advertisement, feeding the gateway.
pub struct Listener {
    transport: Arc<QuicTransport>,
    task: JoinHandle<()>,
}

impl Listener {
    pub fn start(config: &HostConfig, identity: &Identity, gateway: &GatewayHandle) -> Result<Self> {
        let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
        let transport = Arc::new(QuicTransport::bind(identity, bind_addr)?);
        let mut advertisement = discovery::advertise(
            &config.service_type,
            &config.device_name,
            identity,
            transport.clone(),
        )?;

        let gateway = gateway.clone();
        let task = tokio::spawn(async move {
            while let Some(peer) = advertisement.next_connection().await {
                debug!("Inbound connection from {}", peer.remote_socket_addr());
                if gateway.accept(peer).is_err() {
                    break;
                }
            }
        });

        Ok(Self { transport, task })
    }

    async fn stop(self) {
        self.task.abort();
        let _ = self.task.await;
        self.transport.shutdown().await;
    }
}

pub struct Daemon {
    pub config: HostConfig,
    pub identities: IdentityStore,
    pub gateway: GatewayHandle,
    pub listener: Option<Listener>,
}

impl Daemon {
    /// Returns `false` when the operator asked to quit.
    pub async fn execute(&mut self, command: ConsoleCommand) -> Result<bool> {
        match command {
            ConsoleCommand::Allow(text) => {
                let fingerprint = self.resolve(&text).await?;
                self.gateway.approve(fingerprint).await?;
                println!("Approved {}", fingerprint.short());
            }
            ConsoleCommand::Deny(text) => {
                let fingerprint = self.resolve(&text).await?;
                self.gateway.block(fingerprint).await?;
                println!("Blocked {}", fingerprint.short());
            }
            ConsoleCommand::Disconnect(None) => {
                let count = self.gateway.disconnect_all().await?;
                println!("Disconnected {} session(s)", count);
            }
            ConsoleCommand::Disconnect(Some(text)) => {
                let fingerprint = self.resolve(&text).await?;
                if !self.gateway.disconnect(fingerprint).await? {
                    println!("{} has no active session", fingerprint.short());
                }
            }
            ConsoleCommand::Forget(text) => {
                let fingerprint = self.resolve(&text).await?;
                if self.gateway.forget(fingerprint).await? {
                    println!("Forgot {}", fingerprint.short());
                } else {
                    println!("{} was not known", fingerprint.short());
                }
            }
            ConsoleCommand::List => {
                println!("Server fingerprint: {}", self.gateway.server_fingerprint().await?);
                println!("{}", console::format_clients(&self.gateway.clients().await?));
            }
            ConsoleCommand::Reset => self.reset().await?,
            ConsoleCommand::Help => println!("{}", console::HELP),
            ConsoleCommand::Quit => return Ok(false),
        }
        Ok(true)
    }

    async fn resolve(&self, text: &str) -> Result<Fingerprint> {
        let known = self.gateway.clients().await?;
        console::resolve(text, &known)
    }

    /// Regenerate the server identity and advertise under it. Every session is dropped.
    ///
    /// The running listener is only replaced once the new identity is in place.
    async fn reset(&mut self) -> Result<()> {
        let identity = self
            .identities
            .reset()
            .context("Failed to regenerate server identity")?;
        self.gateway
            .set_server_fingerprint(identity.fingerprint())
            .await?;

        if let Some(listener) = self.listener.take() {
            listener.stop().await;
        }
        self.listener = Some(
            Listener::start(&self.config, &identity, &self.gateway)
                .context("Failed to restart listener with the new identity")?,
        );
        println!("New server fingerprint: {}", identity.fingerprint());
        Ok(())
    }

    pub async fn shutdown(mut self) {
        if let Err(e) = self.gateway.shutdown().await {
            warn!("Gateway shutdown failed: {}", e);
        }
        if let Some(listener) = self.listener.take() {
            listener.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machines::SimulatedHost;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use utm_remote_core::identity::StoredIdentity;
    use utm_remote_core::{
        GatewayConfig, MemorySecureStorage, MemoryTrustStore, RemoteError, Role, SecureStorage,
        SessionGateway, TrustRegistry, TrustStatus,
    };

    /// Memory storage whose deletes fail while `broken` is set.
    struct BrokenStorage {
        inner: MemorySecureStorage,
        broken: Arc<AtomicBool>,
    }

    impl SecureStorage for BrokenStorage {
        fn load(&self, label: &str) -> utm_remote_core::Result<Option<StoredIdentity>> {
            self.inner.load(label)
        }

        fn store(&self, label: &str, identity: &StoredIdentity) -> utm_remote_core::Result<()> {
            self.inner.store(label, identity)
        }

        fn delete(&self, label: &str) -> utm_remote_core::Result<()> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(RemoteError::SecureStorage("keychain locked".into()));
            }
            self.inner.delete(label)
        }
    }

    fn daemon(broken: Arc<AtomicBool>) -> Daemon {
        let mut identities = IdentityStore::new(
            Role::Server,
            "test-host",
            Box::new(BrokenStorage {
                inner: MemorySecureStorage::new(),
                broken,
            }),
        );
        let identity = identities.load().unwrap();
        let registry = TrustRegistry::open(Box::new(MemoryTrustStore::new())).unwrap();
        let gateway = SessionGateway::spawn(
            GatewayConfig::default(),
            identity.fingerprint(),
            registry,
            Arc::new(SimulatedHost::new(&[], Duration::ZERO)),
        );

        let transport =
            QuicTransport::bind(&identity, SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).unwrap();
        let listener = Listener {
            transport: Arc::new(transport),
            task: tokio::spawn(std::future::pending()),
        };

        Daemon {
            config: HostConfig::default(),
            identities,
            gateway,
            listener: Some(listener),
        }
    }

    #[tokio::test]
    async fn test_failed_reset_keeps_listener() {
        let broken = Arc::new(AtomicBool::new(true));
        let mut daemon = daemon(broken);
        let before = daemon.gateway.server_fingerprint().await.unwrap();
        let addr = daemon
            .listener
            .as_ref()
            .map(|l| l.transport.local_addr().unwrap());

        assert!(daemon.execute(ConsoleCommand::Reset).await.is_err());

        let listener = daemon.listener.as_ref().expect("listener was torn down");
        assert_eq!(Some(listener.transport.local_addr().unwrap()), addr);
        assert!(!listener.task.is_finished());
        assert_eq!(daemon.gateway.server_fingerprint().await.unwrap(), before);
        daemon.shutdown().await;
    }

    #[tokio::test]
    async fn test_console_commands_reach_gateway() {
        let mut daemon = daemon(Arc::new(AtomicBool::new(false)));
        let client = Fingerprint::from_bytes([0xAB; 32]);

        assert!(daemon.execute(ConsoleCommand::Allow(client.to_hex())).await.unwrap());
        let clients = daemon.gateway.clients().await.unwrap();
        assert_eq!(clients[0].entry.fingerprint, client);
        assert_eq!(clients[0].status, TrustStatus::Approved);

        // Known clients resolve by prefix.
        let prefix = client.to_hex()[..5].to_string();
        assert!(daemon.execute(ConsoleCommand::Deny(prefix)).await.unwrap());
        assert_eq!(
            daemon.gateway.clients().await.unwrap()[0].status,
            TrustStatus::Blocked
        );
        assert!(daemon.execute(ConsoleCommand::List).await.unwrap());
        assert!(!daemon.execute(ConsoleCommand::Quit).await.unwrap());
        daemon.shutdown().await;
    }
}
