//! Check-in message construction and wire encoding.
//!
//! Builders are pure: the same device/user/push-info input always yields
//! the same message, and [`encode`] serializes fields in a fixed order, so
//! the encoded bytes (and therefore the dedup digest) are a pure function
//! of logical content. Fields without a value are omitted from the
//! encoding entirely, never written as empty strings or empty data.

use crate::store::{DeviceRecord, PushInfo, UserRecord};
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

/// Errors from message construction or wire encoding.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// A hex-encoded source field did not decode. The builder never
    /// substitutes defaults for malformed binary fields.
    #[error("malformed {field} for {id}: {source}")]
    MalformedField {
        field: &'static str,
        id: String,
        source: hex::FromHexError,
    },

    #[error("encode check-in message: {0}")]
    Encode(#[from] plist::Error),
}

/// A check-in message bound for the remote MDM service.
///
/// The `MessageType` discriminant is carried by the serde tag, so each
/// variant encodes as a flat dictionary with `MessageType` first followed
/// by the variant's fields in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "MessageType")]
pub enum CheckinMessage {
    #[serde(rename_all = "PascalCase")]
    Authenticate {
        #[serde(rename = "UDID")]
        udid: String,
        topic: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        build_version: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        device_name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        model_name: Option<String>,
        #[serde(rename = "OSVersion", skip_serializing_if = "Option::is_none")]
        os_version: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        product_name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        serial_number: Option<String>,
        #[serde(rename = "IMEI", skip_serializing_if = "Option::is_none")]
        imei: Option<String>,
        #[serde(rename = "MEID", skip_serializing_if = "Option::is_none")]
        meid: Option<String>,
    },
    #[serde(rename_all = "PascalCase")]
    TokenUpdate {
        #[serde(rename = "UDID")]
        udid: String,
        push_magic: String,
        topic: String,
        token: ByteBuf,
        #[serde(skip_serializing_if = "Option::is_none")]
        unlock_token: Option<ByteBuf>,
        #[serde(rename = "UserID", skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_short_name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_long_name: Option<String>,
    },
}

impl CheckinMessage {
    /// Message type discriminant, for logs and ledger audit values.
    pub fn kind(&self) -> &'static str {
        match self {
            CheckinMessage::Authenticate { .. } => "Authenticate",
            CheckinMessage::TokenUpdate { .. } => "TokenUpdate",
        }
    }

    pub fn udid(&self) -> &str {
        match self {
            CheckinMessage::Authenticate { udid, .. } => udid,
            CheckinMessage::TokenUpdate { udid, .. } => udid,
        }
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn decode_hex(
    field: &'static str,
    id: &str,
    value: &str,
) -> Result<Vec<u8>, BuildError> {
    hex::decode(value).map_err(|source| BuildError::MalformedField {
        field,
        id: id.to_string(),
        source,
    })
}

/// Builds the Authenticate check-in announcing a device's identity.
pub fn build_authenticate(device: &DeviceRecord, push: &PushInfo) -> CheckinMessage {
    CheckinMessage::Authenticate {
        udid: device.udid.clone(),
        topic: push.topic.clone(),
        build_version: non_empty(&device.build_version),
        device_name: non_empty(&device.device_name),
        model: non_empty(&device.model),
        model_name: non_empty(&device.model_name),
        os_version: non_empty(&device.os_version),
        product_name: non_empty(&device.product_name),
        serial_number: non_empty(&device.serial_number),
        imei: non_empty(&device.imei),
        meid: non_empty(&device.meid),
    }
}

/// Builds the device-channel TokenUpdate carrying the push registration
/// and, when present, the unlock token.
pub fn build_device_token_update(
    device: &DeviceRecord,
    push: &PushInfo,
) -> Result<CheckinMessage, BuildError> {
    let token = decode_hex("Token", &device.udid, &push.token)?;
    let unlock_token = decode_hex("UnlockToken", &device.udid, &device.unlock_token)?;
    Ok(CheckinMessage::TokenUpdate {
        udid: device.udid.clone(),
        push_magic: push.push_magic.clone(),
        topic: push.topic.clone(),
        token: ByteBuf::from(token),
        unlock_token: if unlock_token.is_empty() {
            None
        } else {
            Some(ByteBuf::from(unlock_token))
        },
        user_id: None,
        user_short_name: None,
        user_long_name: None,
    })
}

/// Builds the user-channel TokenUpdate for a managed user.
pub fn build_user_token_update(
    user: &UserRecord,
    push: &PushInfo,
) -> Result<CheckinMessage, BuildError> {
    let token = decode_hex("Token", &user.user_id, &push.token)?;
    Ok(CheckinMessage::TokenUpdate {
        udid: user.udid.clone(),
        push_magic: push.push_magic.clone(),
        topic: push.topic.clone(),
        token: ByteBuf::from(token),
        unlock_token: None,
        user_id: non_empty(&user.user_id),
        user_short_name: non_empty(&user.user_shortname),
        user_long_name: non_empty(&user.user_longname),
    })
}

/// Encodes a check-in message to the property-list bytes the remote
/// service expects.
pub fn encode(message: &CheckinMessage) -> Result<Vec<u8>, BuildError> {
    let mut buf = Vec::new();
    plist::to_writer_xml(&mut buf, message)?;
    Ok(buf)
}
