//! Ad-hoc device command translation.
//!
//! An inbound JSON command request becomes the command payload dictionary
//! the remote service enqueues. Only request types with a known mapping
//! are accepted; everything else is rejected before any remote call.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Request types with a known command mapping. Command-specific fields
/// (profile payloads, queries, PINs and so on) pass through untouched.
const SUPPORTED_REQUEST_TYPES: &[&str] = &[
    "CertificateList",
    "ClearPasscode",
    "DeviceConfigured",
    "DeviceInformation",
    "DeviceLock",
    "EraseDevice",
    "InstallApplication",
    "InstallProfile",
    "InstalledApplicationList",
    "ProfileList",
    "ProvisioningProfileList",
    "RemoveApplication",
    "RemoveProfile",
    "RestartDevice",
    "SecurityInfo",
    "Settings",
    "ShutDownDevice",
];

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("unsupported request type: {0}")]
    UnsupportedRequestType(String),

    #[error("command request has no UDID")]
    MissingUdid,

    #[error("encode command payload: {0}")]
    Encode(#[from] plist::Error),
}

/// An inbound command request. Fields beyond the addressing ones are
/// collected as-is and forwarded inside the command body.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CommandRequest {
    #[serde(rename = "UDID", default)]
    pub udid: String,
    pub request_type: String,
    #[serde(rename = "CommandUUID", default)]
    pub command_uuid: Option<String>,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

/// The command dictionary delivered to the remote enqueue API.
#[derive(Debug, Clone, Serialize)]
pub struct CommandPayload {
    #[serde(rename = "UDID")]
    pub udid: String,
    #[serde(rename = "CommandUUID")]
    pub command_uuid: String,
    #[serde(rename = "Command")]
    pub command: Command,
}

#[derive(Debug, Clone, Serialize)]
pub struct Command {
    #[serde(rename = "RequestType")]
    pub request_type: String,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

/// Derives the command payload from a request. Deterministic when the
/// request carries a `CommandUUID`; otherwise one is generated.
pub fn build_command_payload(request: CommandRequest) -> Result<CommandPayload, CommandError> {
    if request.udid.is_empty() {
        return Err(CommandError::MissingUdid);
    }
    if !SUPPORTED_REQUEST_TYPES.contains(&request.request_type.as_str()) {
        return Err(CommandError::UnsupportedRequestType(request.request_type));
    }

    let command_uuid = match request.command_uuid {
        Some(uuid) if !uuid.is_empty() => uuid,
        _ => uuid::Uuid::new_v4().to_string(),
    };

    // JSON nulls have no property-list representation; they only mean
    // "field absent" on the way in.
    let params = request
        .params
        .into_iter()
        .filter(|(_, value)| !value.is_null())
        .collect();

    Ok(CommandPayload {
        udid: request.udid,
        command_uuid,
        command: Command {
            request_type: request.request_type,
            params,
        },
    })
}

/// Encodes a command payload to property-list bytes for forwarding.
pub fn encode_payload(payload: &CommandPayload) -> Result<Vec<u8>, CommandError> {
    let mut buf = Vec::new();
    plist::to_writer_xml(&mut buf, payload)?;
    Ok(buf)
}
