//! Version exchange performed right after the transport is up.
//!
//! Only the initiator validates. The answering side always replies with its own version.
//! Callers bound the exchange with their own deadline.

use crate::error::{RemoteError, Result};
use crate::peer::PeerConnection;
use crate::protocol::{Reply, Request, unexpected};
use constant_time_eq::constant_time_eq;
use tracing::{debug, warn};

/// Ask the client side for its version. Fails with `VersionMismatch` unless it equals `expected`.
pub async fn initiate<P: PeerConnection + ?Sized>(peer: &P, expected: u32) -> Result<u32> {
    let reply = peer
        .request(Request::ClientHandshake { version: expected })
        .await?;

    match reply.into_result()? {
        Reply::ClientHandshake { version } => check_version(expected, version),
        other => Err(unexpected(&other)),
    }
}

/// Passive reply to a `ClientHandshake`.
pub fn answer(version: u32) -> Reply {
    Reply::ClientHandshake { version }
}

fn check_version(expected: u32, received: u32) -> Result<u32> {
    if received != expected {
        warn!(
            "Handshake version mismatch (expected {}, received {})",
            expected, received
        );
        return Err(RemoteError::VersionMismatch { expected, received });
    }
    debug!("Handshake complete (version {})", received);
    Ok(received)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub version: u32,
    pub model: String,
}

/// Client-initiated handshake toward the host, carrying the optional server password.
pub async fn initiate_server<P: PeerConnection + ?Sized>(
    peer: &P,
    expected: u32,
    password: Option<String>,
) -> Result<ServerInfo> {
    let has_password = password.is_some();
    let reply = peer
        .request(Request::ServerHandshake {
            version: expected,
            password,
        })
        .await?;

    match reply.into_result()? {
        Reply::ServerHandshake {
            version,
            is_authenticated,
            model,
        } => {
            let version = check_version(expected, version)?;
            if !is_authenticated {
                return Err(if has_password {
                    RemoteError::PasswordInvalid
                } else {
                    RemoteError::PasswordRequired
                });
            }
            Ok(ServerInfo { version, model })
        }
        other => Err(unexpected(&other)),
    }
}

/// Passive reply to a `ServerHandshake`. Returns the reply and whether the peer is now authenticated.
pub fn answer_server(
    version: u32,
    model: &str,
    required: Option<&str>,
    offered: Option<&str>,
) -> (Reply, bool) {
    let is_authenticated = match required {
        None => true,
        Some(required) => offered
            .is_some_and(|offered| constant_time_eq(offered.as_bytes(), required.as_bytes())),
    };
    (
        Reply::ServerHandshake {
            version,
            is_authenticated,
            model: model.to_string(),
        },
        is_authenticated,
    )
}
