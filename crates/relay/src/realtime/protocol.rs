// Realtime protocol version negotiation and frame helpers.
//
// Clients name the protocol they speak in the `vsn` query parameter of the
// upgrade request. Omitting it selects the current version.

use axum::extract::ws::{Message, WebSocket};
use scrumflow_common::protocol::realtime::{encode_message, RealtimeMessage, CURRENT_PROTOCOL_VERSION};

use crate::error::{ErrorCode, RelayError};

/// Accepted versions, newest first.
const SUPPORTED_VERSIONS: &[&str] = &[CURRENT_PROTOCOL_VERSION];

pub fn is_supported(version: &str) -> bool {
    SUPPORTED_VERSIONS.contains(&version)
}

pub fn supported_versions() -> &'static [&'static str] {
    SUPPORTED_VERSIONS
}

/// Validate the requested version, if any. Unsupported versions are refused
/// with `UPGRADE_REQUIRED` before the socket is upgraded.
pub fn require_supported(version: Option<&str>) -> Result<(), RelayError> {
    match version {
        None => Ok(()),
        Some(version) if is_supported(version) => Ok(()),
        Some(version) => Err(RelayError::new(
            ErrorCode::UpgradeRequired,
            format!("unsupported realtime protocol version: {version}"),
        )
        .with_details(format!("supported versions: {}", SUPPORTED_VERSIONS.join(", ")))),
    }
}

pub async fn send_ws_message(socket: &mut WebSocket, message: &RealtimeMessage) -> Result<(), ()> {
    let encoded = encode_message(message).map_err(|_| ())?;
    socket.send(Message::Text(encoded.into())).await.map_err(|_| ())
}
