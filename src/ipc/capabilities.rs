//! Capabilities advertisement for IPC clients.

use super::protocol::{MessageType, MAX_PAYLOAD_SIZE};

pub const SUPPORTED_TYPES: &[MessageType] = &[
    MessageType::TaskSubmit,
    MessageType::TaskQuery,
    MessageType::TaskCancel,
    MessageType::Ping,
    MessageType::Pong,
    MessageType::Capabilities,
    MessageType::ResponseOk,
    MessageType::ResponseError,
];

pub fn is_type_supported(message_type: MessageType) -> bool {
    SUPPORTED_TYPES.contains(&message_type)
}

/// JSON document answered to a `Capabilities` request.
pub fn capabilities_json() -> serde_json::Value {
    let types: Vec<String> = SUPPORTED_TYPES
        .iter()
        .map(|t| format!("0x{:02x}", t.as_u8()))
        .collect();
    serde_json::json!({
        "protocol_version": "1.0",
        "supported_versions": ["1.0"],
        "supported_message_types": types,
        "max_payload_size": MAX_PAYLOAD_SIZE,
        "features": ["basic"],
    })
}
