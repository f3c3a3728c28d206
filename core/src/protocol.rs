use crate::error::{RemoteError, Result};
use crate::vm::{RemoteVmState, StopMethod, VirtualMachineInfo};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

/// Application protocol version exchanged in both handshakes.
pub const PROTOCOL_VERSION: u32 = 1;

pub const ALPN_PROTOCOL: &[u8] = b"utm-remote/1";

/// Leading byte of every frame. Bumped only if the framing itself changes.
pub const FRAME_VERSION: u8 = 1;

pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024; // 1MB, VM lists included

/// Close reasons the host uses when it turns a client away on policy grounds.
pub const CLOSE_BLOCKED: &str = "blocked";
pub const CLOSE_UNAUTHENTICATED: &str = "unauthenticated";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    // host -> client
    ClientHandshake {
        version: u32,
    },
    VirtualMachineDidTransition {
        id: Uuid,
        state: RemoteVmState,
    },
    VirtualMachineDidError {
        id: Uuid,
        message: String,
    },

    // client -> host
    ServerHandshake {
        version: u32,
        password: Option<String>,
    },
    ListVirtualMachines,
    StartVirtualMachine {
        id: Uuid,
    },
    StopVirtualMachine {
        id: Uuid,
        method: StopMethod,
    },
    RestartVirtualMachine {
        id: Uuid,
    },
    PauseVirtualMachine {
        id: Uuid,
    },
    ResumeVirtualMachine {
        id: Uuid,
    },
    SaveSnapshot {
        id: Uuid,
        name: Option<String>,
    },
    DeleteSnapshot {
        id: Uuid,
        name: Option<String>,
    },
    RestoreSnapshot {
        id: Uuid,
        name: Option<String>,
    },
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::ClientHandshake { .. } => "client_handshake",
            Request::VirtualMachineDidTransition { .. } => "virtual_machine_did_transition",
            Request::VirtualMachineDidError { .. } => "virtual_machine_did_error",
            Request::ServerHandshake { .. } => "server_handshake",
            Request::ListVirtualMachines => "list_virtual_machines",
            Request::StartVirtualMachine { .. } => "start_virtual_machine",
            Request::StopVirtualMachine { .. } => "stop_virtual_machine",
            Request::RestartVirtualMachine { .. } => "restart_virtual_machine",
            Request::PauseVirtualMachine { .. } => "pause_virtual_machine",
            Request::ResumeVirtualMachine { .. } => "resume_virtual_machine",
            Request::SaveSnapshot { .. } => "save_snapshot",
            Request::DeleteSnapshot { .. } => "delete_snapshot",
            Request::RestoreSnapshot { .. } => "restore_snapshot",
        }
    }

    /// Messages the host sends to a client.
    pub fn is_client_bound(&self) -> bool {
        matches!(
            self,
            Request::ClientHandshake { .. }
                | Request::VirtualMachineDidTransition { .. }
                | Request::VirtualMachineDidError { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    ClientHandshake {
        version: u32,
    },
    ServerHandshake {
        version: u32,
        is_authenticated: bool,
        model: String,
    },
    VirtualMachines {
        machines: Vec<VirtualMachineInfo>,
    },
    Ok,
    Error {
        message: String,
    },
}

impl Reply {
    pub fn error(message: impl Into<String>) -> Self {
        Reply::Error {
            message: message.into(),
        }
    }

    pub fn from_result(result: Result<()>) -> Self {
        match result {
            Ok(()) => Reply::Ok,
            Err(e) => Reply::error(e.to_string()),
        }
    }

    /// Map an `Error` reply to [`RemoteError::Remote`].
    pub fn into_result(self) -> Result<Reply> {
        match self {
            Reply::Error { message } => Err(RemoteError::Remote(message)),
            other => Ok(other),
        }
    }

    pub fn expect_ok(self) -> Result<()> {
        match self.into_result()? {
            Reply::Ok => Ok(()),
            other => Err(unexpected(&other)),
        }
    }
}

pub(crate) fn unexpected(reply: &Reply) -> RemoteError {
    RemoteError::Protocol(format!("Unexpected reply: {:?}", reply))
}

/// Write one frame: version byte, big-endian `u32` length, JSON body.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let data = serde_json::to_vec(message)?;
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(RemoteError::Protocol(format!(
            "Message too large: {} bytes",
            data.len()
        )));
    }

    writer.write_all(&[FRAME_VERSION]).await?;
    writer.write_all(&(data.len() as u32).to_be_bytes()).await?;
    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut version = [0u8; 1];
    reader.read_exact(&mut version).await?;
    if version[0] != FRAME_VERSION {
        return Err(RemoteError::Protocol(format!(
            "Unsupported frame version {}",
            version[0]
        )));
    }

    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > MAX_MESSAGE_SIZE {
        return Err(RemoteError::Protocol(format!("Invalid frame length {}", len)));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;
    Ok(serde_json::from_slice(&data)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let request = Request::StopVirtualMachine {
            id: Uuid::new_v4(),
            method: StopMethod::Force,
        };

        write_frame(&mut a, &request).await.unwrap();
        let received: Request = read_frame(&mut b).await.unwrap();
        assert_eq!(received, request);
    }

    #[tokio::test]
    async fn test_rejects_unknown_frame_version() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[9, 0, 0, 0, 2, b'{', b'}']).await.unwrap();

        let result: Result<Reply> = read_frame(&mut b).await;
        assert!(matches!(result, Err(RemoteError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_rejects_oversized_length() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let len = (MAX_MESSAGE_SIZE as u32 + 1).to_be_bytes();
        a.write_all(&[FRAME_VERSION]).await.unwrap();
        a.write_all(&len).await.unwrap();

        let result: Result<Reply> = read_frame(&mut b).await;
        assert!(matches!(result, Err(RemoteError::Protocol(_))));
    }

    #[test]
    fn test_handshake_wire_shape() {
        let json = serde_json::to_value(Request::ClientHandshake { version: 1 }).unwrap();
        assert_eq!(json, serde_json::json!({"type": "client_handshake", "version": 1}));

        let json = serde_json::to_value(Reply::ClientHandshake { version: 1 }).unwrap();
        assert_eq!(json, serde_json::json!({"type": "client_handshake", "version": 1}));
    }

    #[test]
    fn test_error_reply_maps_to_remote_error() {
        assert!(Reply::Ok.expect_ok().is_ok());
        assert!(matches!(
            Reply::error("boom").expect_ok(),
            Err(RemoteError::Remote(m)) if m == "boom"
        ));
        assert!(matches!(
            Reply::ClientHandshake { version: 1 }.expect_ok(),
            Err(RemoteError::Protocol(_))
        ));
    }

    #[test]
    fn test_direction() {
        assert!(Request::ClientHandshake { version: 1 }.is_client_bound());
        assert!(!Request::ListVirtualMachines.is_client_bound());
    }
}
