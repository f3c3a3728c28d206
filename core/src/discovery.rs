use crate::error::{RemoteError, Result};
use crate::identity::Identity;
use crate::protocol::PROTOCOL_VERSION;
use crate::storage::unix_timestamp;
use crate::transport::{QuicPeer, QuicTransport};
use mdns_sd::{IfKind, ResolvedService, ServiceDaemon, ServiceEvent, ServiceInfo};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle as TaskHandle;
use tracing::{debug, info, trace, warn};

// QUIC runs over UDP, so we use UDP service type
pub const SERVICE_TYPE: &str = "_utm_server._udp.local.";

const BROWSE_TIMEOUT: Duration = Duration::from_millis(100);
const ACCEPT_QUEUE: usize = 16;

/// A host found on the local network. Rebuilt on every scan tick, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredEndpoint {
    /// Full mDNS service name, stable for the lifetime of the advertisement.
    pub id: String,
    pub display_name: String,
    pub model: Option<String>,
    pub addresses: Vec<SocketAddr>,
    pub last_seen: u64,
}

impl DiscoveredEndpoint {
    /// First IPv4 address, falling back to whatever was resolved.
    pub fn preferred_address(&self) -> Option<SocketAddr> {
        self.addresses
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| self.addresses.first())
            .copied()
    }
}

/// Current set of resolved endpoints keyed by id.
#[derive(Debug, Default)]
pub struct EndpointTable {
    endpoints: BTreeMap<String, DiscoveredEndpoint>,
}

impl EndpointTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolved(&mut self, endpoint: DiscoveredEndpoint) {
        self.endpoints.insert(endpoint.id.clone(), endpoint);
    }

    /// Returns whether the id was present.
    pub fn removed(&mut self, id: &str) -> bool {
        self.endpoints.remove(id).is_some()
    }

    pub fn get(&self, id: &str) -> Option<&DiscoveredEndpoint> {
        self.endpoints.get(id)
    }

    pub fn snapshot(&self) -> Vec<DiscoveredEndpoint> {
        self.endpoints.values().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.endpoints.clear();
    }
}

/// Best-effort address of the interface used for outbound traffic.
pub fn local_ip() -> Option<IpAddr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket.local_addr().ok().map(|a| a.ip())
}

/// Virtual adapters that tend to swallow multicast.
fn disable_virtual_interfaces(daemon: &ServiceDaemon) {
    let patterns = [
        "vmnet", "vboxnet", "vethernet", "docker", "br-", "veth", "virbr", "utun", "wg",
    ];
    for pattern in patterns {
        if let Err(e) = daemon.disable_interface(IfKind::Name(pattern.to_string())) {
            trace!("Could not disable interface pattern '{}': {}", pattern, e);
        }
    }
}

fn instance_name(device_name: &str) -> String {
    device_name.replace('.', "-")
}

fn instance_from_fullname<'a>(fullname: &'a str, service_type: &str) -> &'a str {
    fullname
        .strip_suffix(service_type)
        .and_then(|s| s.strip_suffix('.'))
        .unwrap_or(fullname)
}

fn endpoint_from_resolved(info: &ResolvedService, service_type: &str) -> Option<DiscoveredEndpoint> {
    let version = info
        .txt_properties
        .get("version")
        .and_then(|v| v.val_str().parse::<u32>().ok())
        .unwrap_or(0);
    if version != 0 && version != PROTOCOL_VERSION {
        debug!(
            "Endpoint {} advertises protocol version {} (ours: {})",
            info.fullname, version, PROTOCOL_VERSION
        );
    }

    let display_name = info
        .txt_properties
        .get("name")
        .map(|v| v.val_str().to_string())
        .unwrap_or_else(|| instance_from_fullname(&info.fullname, service_type).to_string());
    let model = info
        .txt_properties
        .get("model")
        .map(|v| v.val_str().to_string());

    let mut addresses: Vec<SocketAddr> = info
        .addresses
        .iter()
        .map(|scoped_ip| SocketAddr::new(scoped_ip.to_ip_addr(), info.port))
        .collect();
    addresses.sort();
    if addresses.is_empty() {
        warn!("No IP address found for endpoint: {}", info.fullname);
        return None;
    }

    Some(DiscoveredEndpoint {
        id: info.fullname.clone(),
        display_name,
        model,
        addresses,
        last_seen: unix_timestamp(),
    })
}

/// Published host service plus the stream of inbound connections it receives.
///
/// Dropping it unregisters the service and stops accepting.
pub struct Advertisement {
    daemon: ServiceDaemon,
    fullname: String,
    incoming: mpsc::Receiver<QuicPeer>,
    accept_task: TaskHandle<()>,
    stopped: bool,
}

/// Publish `transport` under `service_type` and hand out its inbound connections.
pub fn advertise(
    service_type: &str,
    device_name: &str,
    identity: &Identity,
    transport: Arc<QuicTransport>,
) -> Result<Advertisement> {
    let daemon = ServiceDaemon::new()?;
    disable_virtual_interfaces(&daemon);

    let local_addr = transport.local_addr()?;
    let ip = if local_addr.ip().is_unspecified() {
        local_ip().ok_or_else(|| RemoteError::Discovery("Could not determine local IP".into()))?
    } else {
        local_addr.ip()
    };

    let instance = instance_name(device_name);
    let fingerprint = identity.fingerprint().to_hex().replace(':', "");
    let hostname = format!("utm-{}.local.", &fingerprint[..12].to_lowercase());

    let mut properties = HashMap::new();
    properties.insert("name".to_string(), device_name.to_string());
    properties.insert("model".to_string(), std::env::consts::OS.to_string());
    properties.insert("version".to_string(), PROTOCOL_VERSION.to_string());

    let service_info = ServiceInfo::new(
        service_type,
        &instance,
        &hostname,
        ip,
        local_addr.port(),
        properties,
    )?
    .enable_addr_auto();
    let fullname = service_info.get_fullname().to_string();
    daemon.register(service_info)?;

    info!(
        "Advertising '{}' at {}:{} [service_type={}]",
        instance,
        ip,
        local_addr.port(),
        service_type
    );

    let (tx, incoming) = mpsc::channel(ACCEPT_QUEUE);
    let accept_task = tokio::spawn(async move {
        while let Some(peer) = transport.accept().await {
            if tx.send(peer).await.is_err() {
                break;
            }
        }
        debug!("Accept loop stopped");
    });

    Ok(Advertisement {
        daemon,
        fullname,
        incoming,
        accept_task,
        stopped: false,
    })
}

impl Advertisement {
    pub fn fullname(&self) -> &str {
        &self.fullname
    }

    /// Next inbound transport connection, or `None` once stopped.
    pub async fn next_connection(&mut self) -> Option<QuicPeer> {
        if self.stopped {
            return None;
        }
        self.incoming.recv().await
    }

    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.accept_task.abort();
        self.incoming.close();
        if let Err(e) = self.daemon.unregister(&self.fullname) {
            debug!("Failed to unregister mDNS service: {}", e);
        }
        if let Err(e) = self.daemon.shutdown() {
            debug!("Failed to shutdown mDNS daemon: {}", e);
        }
        info!("Stopped advertising {}", self.fullname);
    }
}

impl Drop for Advertisement {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Live browse for hosts. Each item is the complete current endpoint set.
pub struct EndpointScan {
    daemon: ServiceDaemon,
    service_type: String,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    snapshots: mpsc::UnboundedReceiver<Vec<DiscoveredEndpoint>>,
}

pub fn scan(service_type: &str) -> Result<EndpointScan> {
    let daemon = ServiceDaemon::new()?;
    disable_virtual_interfaces(&daemon);
    let receiver = daemon.browse(service_type)?;

    let running = Arc::new(AtomicBool::new(true));
    let (tx, snapshots) = mpsc::unbounded_channel();
    let thread_running = running.clone();
    let thread_service_type = service_type.to_string();

    info!("Started mDNS discovery for {}", service_type);

    let thread = std::thread::Builder::new()
        .name("mdns-scan".to_string())
        .spawn(move || {
            let mut table = EndpointTable::new();
            while thread_running.load(Ordering::SeqCst) {
                let event = match receiver.recv_timeout(BROWSE_TIMEOUT) {
                    Ok(event) => event,
                    Err(e) => {
                        let err_msg = e.to_string().to_lowercase();
                        if err_msg.contains("timeout") || err_msg.contains("timed out") {
                            continue;
                        }
                        warn!("mDNS receiver error: {}", e);
                        break;
                    }
                };

                let changed = match event {
                    ServiceEvent::ServiceResolved(info) => {
                        match endpoint_from_resolved(&info, &thread_service_type) {
                            Some(endpoint) => {
                                trace!("Resolved {} at {:?}", endpoint.id, endpoint.addresses);
                                table.resolved(endpoint);
                                true
                            }
                            None => false,
                        }
                    }
                    ServiceEvent::ServiceRemoved(_service_type, fullname) => {
                        debug!("ServiceRemoved: {}", fullname);
                        table.removed(&fullname)
                    }
                    ServiceEvent::SearchStopped(stype) => {
                        debug!("mDNS search stopped for {}", stype);
                        break;
                    }
                    _ => false,
                };

                if changed && tx.send(table.snapshot()).is_err() {
                    break;
                }
            }
            debug!("Scan thread stopped");
        })?;

    Ok(EndpointScan {
        daemon,
        service_type: service_type.to_string(),
        running,
        thread: Some(thread),
        snapshots,
    })
}

impl EndpointScan {
    pub async fn next(&mut self) -> Option<Vec<DiscoveredEndpoint>> {
        self.snapshots.recv().await
    }

    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.daemon.stop_browse(&self.service_type) {
            debug!("Failed to stop mDNS browse: {}", e);
        }
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("Scan thread panicked during shutdown");
            }
        }
        if let Err(e) = self.daemon.shutdown() {
            debug!("Failed to shutdown mDNS daemon: {}", e);
        }
        self.snapshots.close();
        info!("Stopped mDNS discovery for {}", self.service_type);
    }
}

impl Drop for EndpointScan {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(id: &str, port: u16) -> DiscoveredEndpoint {
        DiscoveredEndpoint {
            id: id.to_string(),
            display_name: id.to_string(),
            model: None,
            addresses: vec![SocketAddr::from(([192, 168, 1, 10], port))],
            last_seen: 0,
        }
    }

    #[test]
    fn test_table_snapshot_replaces_entries() {
        let mut table = EndpointTable::new();
        table.resolved(endpoint("mac._utm_server._udp.local.", 1000));
        table.resolved(endpoint("mac._utm_server._udp.local.", 2000));
        table.resolved(endpoint("mini._utm_server._udp.local.", 3000));

        let snapshot = table.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(
            table.get("mac._utm_server._udp.local.").unwrap().addresses[0].port(),
            2000
        );

        assert!(table.removed("mac._utm_server._udp.local."));
        assert!(!table.removed("mac._utm_server._udp.local."));
        assert_eq!(table.snapshot().len(), 1);
    }

    #[test]
    fn test_preferred_address_is_ipv4() {
        let mut ep = endpoint("a", 1);
        ep.addresses.insert(0, "[fe80::1]:1".parse().unwrap());
        assert!(ep.preferred_address().unwrap().is_ipv4());

        ep.addresses.clear();
        assert!(ep.preferred_address().is_none());
    }

    #[test]
    fn test_instance_from_fullname() {
        assert_eq!(
            instance_from_fullname("Office Mac._utm_server._udp.local.", SERVICE_TYPE),
            "Office Mac"
        );
        assert_eq!(instance_from_fullname("weird", SERVICE_TYPE), "weird");
        assert_eq!(instance_name("mac.local"), "mac-local");
    }
}
