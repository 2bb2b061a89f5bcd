//! mdmshift moves MDM enrollment state between control planes.
//!
//! Two programs share this library: the `mdmshift` batch migrator reads
//! device, user and push-registration records from a source store,
//! rebuilds the check-in messages those enrollments would have sent
//! (Authenticate, then TokenUpdate) and PUTs them to a remote MDM
//! service's migration endpoint; the `mdmshift-proxy` server translates
//! live JSON command requests into wire payloads and relays them to the
//! remote enqueue API.
//!
//! Delivery is idempotent per content: an optional ledger keyed by the
//! SHA-256 digest of each encoded message records what earlier runs
//! already sent, so re-running the migration only delivers what is new.
//! The window between a successful PUT and the ledger write is accepted:
//! a crash there re-delivers exactly one message on the next run, which
//! the remote's check-in handling tolerates.

pub mod checkin;
pub mod command;
pub mod deliver;
pub mod ledger;
pub mod migrate;
pub mod proxy;
pub mod store;

pub use checkin::{
    build_authenticate, build_device_token_update, build_user_token_update, encode, BuildError,
    CheckinMessage,
};
pub use command::{
    build_command_payload, encode_payload, CommandError, CommandPayload, CommandRequest,
};
pub use deliver::{DeliveryClient, DeliveryError};
pub use ledger::{digest, Ledger, LedgerError, MessageDigest};
pub use migrate::{MessageOutcome, MigrationSummary, Migrator, SelectionFilter, SkipReason};
pub use store::{DeviceRecord, PushInfo, RecordSource, RedbSource, StoreError, UserRecord};
