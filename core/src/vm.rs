use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Host-side VM lifecycle, mirrored by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteVmState {
    Stopped,
    Starting,
    Started,
    Pausing,
    Paused,
    Resuming,
    Stopping,
    Saving,
}

impl RemoteVmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteVmState::Stopped => "stopped",
            RemoteVmState::Starting => "starting",
            RemoteVmState::Started => "started",
            RemoteVmState::Pausing => "pausing",
            RemoteVmState::Paused => "paused",
            RemoteVmState::Resuming => "resuming",
            RemoteVmState::Stopping => "stopping",
            RemoteVmState::Saving => "saving",
        }
    }

    /// States that only exist while an operation is running.
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            RemoteVmState::Starting
                | RemoteVmState::Pausing
                | RemoteVmState::Resuming
                | RemoteVmState::Stopping
                | RemoteVmState::Saving
        )
    }
}

impl fmt::Display for RemoteVmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopMethod {
    #[default]
    Request,
    Force,
    Kill,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualMachineInfo {
    pub id: Uuid,
    pub name: String,
    pub is_suspended: bool,
    pub state: RemoteVmState,
}

/// The hypervisor side of the host. Each call returns once the VM reached its target state.
///
/// State changes that happen for other reasons are reported through
/// [`GatewayHandle::notify_transition`](crate::gateway::GatewayHandle::notify_transition).
#[async_trait]
pub trait VirtualMachineHost: Send + Sync + 'static {
    async fn list(&self) -> Result<Vec<VirtualMachineInfo>>;
    async fn start(&self, id: Uuid) -> Result<()>;
    async fn stop(&self, id: Uuid, method: StopMethod) -> Result<()>;
    async fn restart(&self, id: Uuid) -> Result<()>;
    async fn pause(&self, id: Uuid) -> Result<()>;
    async fn resume(&self, id: Uuid) -> Result<()>;
    async fn save_snapshot(&self, id: Uuid, name: Option<String>) -> Result<()>;
    async fn delete_snapshot(&self, id: Uuid, name: Option<String>) -> Result<()>;
    async fn restore_snapshot(&self, id: Uuid, name: Option<String>) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitional_states() {
        assert!(RemoteVmState::Starting.is_transitional());
        assert!(RemoteVmState::Saving.is_transitional());
        assert!(!RemoteVmState::Started.is_transitional());
        assert!(!RemoteVmState::Paused.is_transitional());
    }

    #[test]
    fn test_state_wire_names() {
        assert_eq!(
            serde_json::to_string(&RemoteVmState::Resuming).unwrap(),
            "\"resuming\""
        );
        assert_eq!(RemoteVmState::Stopped.to_string(), "stopped");
        assert_eq!(StopMethod::default(), StopMethod::Request);
    }
}
