//! Read-only views over the source record store.
//!
//! The migration source is a single redb file holding three tables of
//! JSON-encoded records: `devices` (keyed by UDID), `users` (keyed by
//! UserID) and `push_info` (keyed by either, depending on whether the
//! push registration belongs to a device or a managed user). The store is
//! input only; the adapter never opens a write transaction against it.
//!
//! Enumeration order is whatever the underlying btree yields. Callers must
//! not rely on it for correctness, only for log readability.

use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::path::Path;

const DEVICES: TableDefinition<&str, &[u8]> = TableDefinition::new("devices");
const USERS: TableDefinition<&str, &[u8]> = TableDefinition::new("users");
const PUSH_INFO: TableDefinition<&str, &[u8]> = TableDefinition::new("push_info");

/// Errors from the record store adapter.
///
/// `PushInfoNotFound` is the one recoverable case: a record with no push
/// registration is skipped by the driver, not fatal. Everything else means
/// the source store itself is unusable.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("open source store: {0}")]
    Open(#[from] redb::DatabaseError),

    #[error("store transaction: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("store table: {0}")]
    Table(#[from] redb::TableError),

    #[error("store read: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("decode record {key}: {source}")]
    Decode {
        key: String,
        source: serde_json::Error,
    },

    #[error("no push registration for {0}")]
    PushInfoNotFound(String),
}

/// A managed device snapshot as exported from the old control plane.
///
/// String fields mirror the exporter's zero-value convention: absent
/// attributes come through as empty strings and are dropped again when the
/// check-in message is built.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DeviceRecord {
    #[serde(rename = "UDID")]
    pub udid: String,
    pub serial_number: String,
    pub build_version: String,
    pub device_name: String,
    pub model: String,
    pub model_name: String,
    #[serde(rename = "OSVersion")]
    pub os_version: String,
    pub product_name: String,
    #[serde(rename = "IMEI")]
    pub imei: String,
    #[serde(rename = "MEID")]
    pub meid: String,
    /// Hex-encoded unlock token; may be empty.
    pub unlock_token: String,
    pub last_seen: Option<chrono::DateTime<chrono::Utc>>,
}

/// A managed user record, tied to its owning device by UDID.
///
/// The UDID may reference a device outside the current selection filter,
/// or one missing from the export entirely.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct UserRecord {
    #[serde(rename = "UserID")]
    pub user_id: String,
    #[serde(rename = "UDID")]
    pub udid: String,
    pub user_shortname: String,
    pub user_longname: String,
}

/// Push-notification registration data for a device or user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PushInfo {
    pub topic: String,
    /// Hex-encoded APNs device token.
    pub token: String,
    pub push_magic: String,
}

/// Read-only access to the migration source records.
///
/// The driver is generic over this seam so it can run against an
/// in-memory source in tests; [`RedbSource`] is the production
/// implementation.
pub trait RecordSource {
    fn devices(&self) -> Result<Vec<DeviceRecord>, StoreError>;
    fn users(&self) -> Result<Vec<UserRecord>, StoreError>;
    fn device_by_udid(&self, udid: &str) -> Result<Option<DeviceRecord>, StoreError>;
    /// Push registration for a device UDID or user ID.
    fn push_info(&self, id: &str) -> Result<PushInfo, StoreError>;
}

/// Record source backed by a redb file.
pub struct RedbSource {
    db: Database,
}

impl RedbSource {
    /// Opens an existing source store. The file must already exist; this
    /// tool never creates or mutates the source.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = Database::open(path)?;
        Ok(Self { db })
    }

    fn list<T: serde::de::DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &[u8]>,
    ) -> Result<Vec<T>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(table)?;
        let mut out = Vec::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            let record = serde_json::from_slice(value.value()).map_err(|source| {
                StoreError::Decode {
                    key: key.value().to_string(),
                    source,
                }
            })?;
            out.push(record);
        }
        Ok(out)
    }

    fn get<T: serde::de::DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(table)?;
        match table.get(key)? {
            Some(value) => {
                let record = serde_json::from_slice(value.value()).map_err(|source| {
                    StoreError::Decode {
                        key: key.to_string(),
                        source,
                    }
                })?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }
}

impl RecordSource for RedbSource {
    fn devices(&self) -> Result<Vec<DeviceRecord>, StoreError> {
        self.list(DEVICES)
    }

    fn users(&self) -> Result<Vec<UserRecord>, StoreError> {
        self.list(USERS)
    }

    fn device_by_udid(&self, udid: &str) -> Result<Option<DeviceRecord>, StoreError> {
        self.get(DEVICES, udid)
    }

    fn push_info(&self, id: &str) -> Result<PushInfo, StoreError> {
        self.get(PUSH_INFO, id)?
            .ok_or_else(|| StoreError::PushInfoNotFound(id.to_string()))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn sample_device() -> DeviceRecord {
        DeviceRecord {
            udid: "A1B2C3".into(),
            serial_number: "SN100".into(),
            build_version: "22B83".into(),
            device_name: "Test iPad".into(),
            model: "iPad8,1".into(),
            model_name: "iPad Pro".into(),
            os_version: "18.1".into(),
            product_name: "iPad8,1".into(),
            imei: String::new(),
            meid: String::new(),
            unlock_token: "00ff".into(),
            last_seen: Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()),
        }
    }

    #[test]
    fn round_trips_records_through_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("source.redb");
        let device = sample_device();
        let user = UserRecord {
            user_id: "U1".into(),
            udid: "A1B2C3".into(),
            user_shortname: "jdoe".into(),
            user_longname: "Jo Doe".into(),
        };
        let push = PushInfo {
            topic: "com.apple.mgmt.External.test".into(),
            token: "aabbcc".into(),
            push_magic: "magic".into(),
        };
        fixtures::write_source(&path, &[device.clone()], &[user.clone()], &[("A1B2C3", push.clone())]);

        let source = RedbSource::open(&path).unwrap();
        assert_eq!(source.devices().unwrap(), vec![device.clone()]);
        assert_eq!(source.users().unwrap(), vec![user]);
        assert_eq!(source.device_by_udid("A1B2C3").unwrap(), Some(device));
        assert_eq!(source.device_by_udid("missing").unwrap(), None);
        assert_eq!(source.push_info("A1B2C3").unwrap(), push);
    }

    #[test]
    fn missing_push_info_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("source.redb");
        fixtures::write_source(&path, &[sample_device()], &[], &[]);

        let source = RedbSource::open(&path).unwrap();
        let err = source.push_info("A1B2C3").unwrap_err();
        assert!(matches!(err, StoreError::PushInfoNotFound(id) if id == "A1B2C3"));
    }

    #[test]
    fn tolerates_partial_device_json() {
        let device: DeviceRecord =
            serde_json::from_str(r#"{"UDID":"X","SerialNumber":"S"}"#).unwrap();
        assert_eq!(device.udid, "X");
        assert_eq!(device.serial_number, "S");
        assert!(device.device_name.is_empty());
        assert!(device.last_seen.is_none());
    }
}
