//! Content-addressed dedup ledger.
//!
//! A persistent set of SHA-256 digests of already-delivered check-in
//! messages, backed by one redb table. Presence of a digest means "this
//! exact encoded message was delivered by some earlier run"; values are
//! free-text audit strings. The table is append-only: entries are never
//! updated or deleted within a run.
//!
//! `seen` and `mark_sent` each run in their own transaction and no lock is
//! held across the remote delivery in between, so a crash after delivery
//! but before `mark_sent` re-delivers that message on the next run. The
//! remote service's check-in handling is assumed idempotent.

use redb::{Database, ReadableTable, TableDefinition};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::path::Path;

const SENT_MESSAGES: TableDefinition<&[u8], &str> =
    TableDefinition::new("checkin_message_digests");

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("open ledger store: {0}")]
    Open(#[from] redb::DatabaseError),

    #[error("ledger transaction: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("ledger table: {0}")]
    Table(#[from] redb::TableError),

    #[error("ledger read/write: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("ledger commit: {0}")]
    Commit(#[from] redb::CommitError),
}

/// SHA-256 digest of an encoded check-in message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageDigest([u8; 32]);

impl MessageDigest {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for MessageDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Digest of the encoded message bytes. Identical logical content encodes
/// identically (see `checkin::encode`), so this is stable across runs.
pub fn digest(encoded: &[u8]) -> MessageDigest {
    let mut hasher = Sha256::new();
    hasher.update(encoded);
    MessageDigest(hasher.finalize().into())
}

/// Persistent set of delivered-message digests.
pub struct Ledger {
    db: Database,
}

impl Ledger {
    /// Opens (or creates) the ledger store and ensures its table exists,
    /// so later reads never race table creation.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let db = Database::create(path)?;
        let txn = db.begin_write()?;
        txn.open_table(SENT_MESSAGES)?;
        txn.commit()?;
        Ok(Self { db })
    }

    /// Whether this digest was recorded by this or any earlier run.
    pub fn seen(&self, digest: &MessageDigest) -> Result<bool, LedgerError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SENT_MESSAGES)?;
        Ok(table.get(digest.as_bytes())?.is_some())
    }

    /// Records a delivered message. The audit value is free text naming
    /// the record kind, identifying id and timestamp.
    pub fn mark_sent(&self, digest: &MessageDigest, audit: &str) -> Result<(), LedgerError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(SENT_MESSAGES)?;
            table.insert(digest.as_bytes(), audit)?;
        }
        txn.commit()?;
        Ok(())
    }
}
