//! Stand-in hypervisor backing the daemon. Machines come from the config file.

use crate::config::MachineConfig;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};
use utm_remote_core::{
    GatewayHandle, RemoteError, RemoteVmState, Result, StopMethod, VirtualMachineHost,
    VirtualMachineInfo,
};
use uuid::Uuid;

const DEFAULT_SNAPSHOT: &str = "default";

pub struct SimulatedHost {
    machines: Mutex<Vec<VirtualMachineInfo>>,
    snapshots: Mutex<HashMap<Uuid, Vec<String>>>,
    gateway: Mutex<Option<GatewayHandle>>,
    delay: Duration,
}

impl SimulatedHost {
    pub fn new(machines: &[MachineConfig], delay: Duration) -> Self {
        let machines = machines
            .iter()
            .map(|m| VirtualMachineInfo {
                id: m.id,
                name: m.name.clone(),
                is_suspended: m.state == RemoteVmState::Paused,
                state: m.state,
            })
            .collect();
        Self {
            machines: Mutex::new(machines),
            snapshots: Mutex::new(HashMap::new()),
            gateway: Mutex::new(None),
            delay,
        }
    }

    /// State changes are pushed to clients through `gateway` from now on.
    pub fn attach(&self, gateway: GatewayHandle) {
        *self.gateway.lock() = Some(gateway);
    }

    fn current(&self, id: Uuid) -> Result<RemoteVmState> {
        self.machines
            .lock()
            .iter()
            .find(|vm| vm.id == id)
            .map(|vm| vm.state)
            .ok_or(RemoteError::VirtualMachineNotFound(id))
    }

    fn set_state(&self, id: Uuid, state: RemoteVmState) {
        if let Some(vm) = self.machines.lock().iter_mut().find(|vm| vm.id == id) {
            vm.state = state;
            vm.is_suspended = state == RemoteVmState::Paused;
        }
        if let Some(gateway) = self.gateway.lock().as_ref() {
            if let Err(e) = gateway.notify_transition(id, state) {
                warn!("Failed to push state for {}: {}", id, e);
            }
        }
    }

    async fn transition(
        &self,
        id: Uuid,
        allowed: &[RemoteVmState],
        transitional: RemoteVmState,
        target: Option<RemoteVmState>,
    ) -> Result<()> {
        let from = self.current(id)?;
        if !allowed.contains(&from) {
            return Err(RemoteError::IllegalTransition {
                from,
                to: transitional,
            });
        }

        self.set_state(id, transitional);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let target = target.unwrap_or(from);
        self.set_state(id, target);
        info!("VM {} is now {}", id, target);
        Ok(())
    }
}

#[async_trait]
impl VirtualMachineHost for SimulatedHost {
    async fn list(&self) -> Result<Vec<VirtualMachineInfo>> {
        Ok(self.machines.lock().clone())
    }

    async fn start(&self, id: Uuid) -> Result<()> {
        use RemoteVmState::*;
        self.transition(id, &[Stopped], Starting, Some(Started)).await
    }

    async fn stop(&self, id: Uuid, method: StopMethod) -> Result<()> {
        use RemoteVmState::*;
        info!("Stopping VM {} ({:?})", id, method);
        self.transition(id, &[Started, Paused], Stopping, Some(Stopped))
            .await
    }

    async fn restart(&self, id: Uuid) -> Result<()> {
        use RemoteVmState::*;
        self.transition(id, &[Started, Paused], Stopping, Some(Started))
            .await
    }

    async fn pause(&self, id: Uuid) -> Result<()> {
        use RemoteVmState::*;
        self.transition(id, &[Started], Pausing, Some(Paused)).await
    }

    async fn resume(&self, id: Uuid) -> Result<()> {
        use RemoteVmState::*;
        self.transition(id, &[Paused], Resuming, Some(Started)).await
    }

    async fn save_snapshot(&self, id: Uuid, name: Option<String>) -> Result<()> {
        use RemoteVmState::*;
        self.transition(id, &[Started, Paused], Saving, None).await?;
        let name = name.unwrap_or_else(|| DEFAULT_SNAPSHOT.to_string());
        let mut snapshots = self.snapshots.lock();
        let names = snapshots.entry(id).or_default();
        if !names.contains(&name) {
            names.push(name);
        }
        Ok(())
    }

    async fn delete_snapshot(&self, id: Uuid, name: Option<String>) -> Result<()> {
        self.current(id)?;
        let name = name.unwrap_or_else(|| DEFAULT_SNAPSHOT.to_string());
        let mut snapshots = self.snapshots.lock();
        let names = snapshots.entry(id).or_default();
        let before = names.len();
        names.retain(|n| *n != name);
        if names.len() == before {
            return Err(RemoteError::Remote(format!("No snapshot named '{}'", name)));
        }
        Ok(())
    }

    async fn restore_snapshot(&self, id: Uuid, name: Option<String>) -> Result<()> {
        self.current(id)?;
        let name = name.unwrap_or_else(|| DEFAULT_SNAPSHOT.to_string());
        let exists = self
            .snapshots
            .lock()
            .get(&id)
            .is_some_and(|names| names.contains(&name));
        if !exists {
            return Err(RemoteError::Remote(format!("No snapshot named '{}'", name)));
        }
        info!("Restored VM {} to snapshot '{}'", id, name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> (SimulatedHost, Uuid) {
        let id = Uuid::new_v4();
        let config = MachineConfig {
            id,
            name: "Fedora".into(),
            state: RemoteVmState::Stopped,
        };
        (SimulatedHost::new(&[config], Duration::ZERO), id)
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let (host, id) = host();
        host.start(id).await.unwrap();
        host.pause(id).await.unwrap();
        let listed = host.list().await.unwrap();
        assert_eq!(listed[0].state, RemoteVmState::Paused);
        assert!(listed[0].is_suspended);

        host.resume(id).await.unwrap();
        host.stop(id, StopMethod::Kill).await.unwrap();
        assert_eq!(host.current(id).unwrap(), RemoteVmState::Stopped);
    }

    #[tokio::test]
    async fn test_illegal_transition_is_rejected() {
        let (host, id) = host();
        assert!(matches!(
            host.pause(id).await,
            Err(RemoteError::IllegalTransition { .. })
        ));
        assert!(matches!(
            host.start(Uuid::new_v4()).await,
            Err(RemoteError::VirtualMachineNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_snapshots() {
        let (host, id) = host();
        host.start(id).await.unwrap();
        host.save_snapshot(id, Some("clean".into())).await.unwrap();
        assert_eq!(host.current(id).unwrap(), RemoteVmState::Started);

        host.restore_snapshot(id, Some("clean".into())).await.unwrap();
        assert!(host.restore_snapshot(id, None).await.is_err());
        host.delete_snapshot(id, Some("clean".into())).await.unwrap();
        assert!(host.delete_snapshot(id, Some("clean".into())).await.is_err());
    }
}
