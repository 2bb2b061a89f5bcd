//! Migration driver: walks the source records and delivers check-ins.
//!
//! Single-threaded and strictly sequential, two independent phases
//! (devices, then users). Every per-record problem is converted to a
//! logged outcome and the walk continues; the run aborts only when the
//! source records cannot be enumerated at all. The ledger check and the
//! later mark happen in separate transactions with the remote PUT in
//! between, giving at-least-once delivery with at-most-once recording.

use crate::checkin::{self, BuildError, CheckinMessage};
use crate::deliver::{DeliveryClient, DeliveryError};
use crate::ledger::{digest, Ledger, LedgerError};
use crate::store::{DeviceRecord, RecordSource, StoreError};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tracing::{info, warn};

/// Record selection applied before any message is built.
#[derive(Debug, Clone, Default)]
pub struct SelectionFilter {
    udids: HashSet<String>,
    last_seen_cutoff: Option<DateTime<Utc>>,
}

impl SelectionFilter {
    /// An empty UDID set means no UDID restriction.
    pub fn new(udids: HashSet<String>, last_seen_cutoff: Option<DateTime<Utc>>) -> Self {
        Self {
            udids,
            last_seen_cutoff,
        }
    }

    /// Returns the skip reason, or `None` when the device passes.
    pub fn check(&self, device: &DeviceRecord) -> Option<String> {
        if let Some(reason) = self.check_udid(&device.udid) {
            return Some(reason);
        }
        if let Some(cutoff) = self.last_seen_cutoff {
            match device.last_seen {
                Some(last_seen) if last_seen < cutoff => {
                    return Some(format!(
                        "LastSeen of {} before cut off",
                        last_seen.format("%Y-%m-%d")
                    ));
                }
                None => return Some("no LastSeen recorded".to_string()),
                Some(_) => {}
            }
        }
        None
    }

    /// UDID-only check, for user records whose owning device is missing
    /// from the export and so cannot be checked against the cutoff.
    pub fn check_udid(&self, udid: &str) -> Option<String> {
        if !self.udids.is_empty() && !self.udids.contains(udid) {
            return Some("not in UDID set".to_string());
        }
        None
    }
}

/// Why a message was skipped without error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Ledger already holds this digest.
    AlreadySent,
    /// No remote configured; the message was built and logged only.
    DryRun,
}

/// A per-record problem that abandons the record but not the run.
#[derive(Debug, thiserror::Error)]
pub enum RecordFailure {
    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Lookup(#[from] StoreError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Terminal state of one message within a run. There is no retry loop.
#[derive(Debug)]
pub enum MessageOutcome {
    Delivered,
    Skipped(SkipReason),
    Failed(RecordFailure),
}

/// Aggregate counts for the run, one event per message or abandoned
/// record.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MigrationSummary {
    pub delivered: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl MigrationSummary {
    fn record(&mut self, outcome: &MessageOutcome) {
        match outcome {
            MessageOutcome::Delivered => self.delivered += 1,
            MessageOutcome::Skipped(_) => self.skipped += 1,
            MessageOutcome::Failed(_) => self.failed += 1,
        }
    }
}

/// Orchestrates one migration run over a record source.
pub struct Migrator<S> {
    source: S,
    /// `None` runs in dry-run mode: build and log, never deliver.
    client: Option<DeliveryClient>,
    /// `None` disables dedup: every message is attempted unconditionally.
    ledger: Option<Ledger>,
    filter: SelectionFilter,
}

impl<S: RecordSource> Migrator<S> {
    pub fn new(
        source: S,
        client: Option<DeliveryClient>,
        ledger: Option<Ledger>,
        filter: SelectionFilter,
    ) -> Self {
        Self {
            source,
            client,
            ledger,
            filter,
        }
    }

    /// Runs both phases. Fails only when records cannot be enumerated;
    /// everything per-record is absorbed into the summary.
    pub async fn run(&self) -> Result<MigrationSummary, StoreError> {
        let mut summary = MigrationSummary::default();

        let devices = self.source.devices()?;
        info!(count = devices.len(), "migrating device check-ins");
        for device in &devices {
            self.migrate_device(device, &mut summary).await;
        }

        let users = self.source.users()?;
        info!(count = users.len(), "migrating user check-ins");
        for user in &users {
            self.migrate_user(user, &mut summary).await;
        }

        info!(
            delivered = summary.delivered,
            skipped = summary.skipped,
            failed = summary.failed,
            "migration run complete"
        );
        Ok(summary)
    }

    async fn migrate_device(&self, device: &DeviceRecord, summary: &mut MigrationSummary) {
        if let Some(reason) = self.filter.check(device) {
            info!(udid = %device.udid, %reason, "skipping device");
            summary.skipped += 1;
            return;
        }

        let push = match self.source.push_info(&device.udid) {
            Ok(push) => push,
            Err(err @ StoreError::PushInfoNotFound(_)) => {
                info!(udid = %device.udid, "skipping device: {err}");
                summary.skipped += 1;
                return;
            }
            Err(err) => {
                warn!(udid = %device.udid, "push info lookup failed: {err}");
                summary.failed += 1;
                return;
            }
        };

        // An Authenticate failure does not block the TokenUpdate; each
        // message reaches its own terminal state.
        let authenticate = checkin::build_authenticate(device, &push);
        let outcome = self
            .step("device_authenticate", &device.udid, &authenticate)
            .await;
        summary.record(&outcome);

        match checkin::build_device_token_update(device, &push) {
            Ok(token_update) => {
                let outcome = self
                    .step("device_token_update", &device.udid, &token_update)
                    .await;
                summary.record(&outcome);
            }
            Err(err) => {
                warn!(udid = %device.udid, "building device TokenUpdate failed: {err}");
                summary.failed += 1;
            }
        }
    }

    async fn migrate_user(&self, user: &crate::store::UserRecord, summary: &mut MigrationSummary) {
        let device = match self.source.device_by_udid(&user.udid) {
            Ok(device) => device,
            Err(err) => {
                warn!(udid = %user.udid, user_id = %user.user_id, "device lookup failed: {err}");
                None
            }
        };

        let skip = match &device {
            Some(device) => self.filter.check(device),
            None => {
                warn!(udid = %user.udid, user_id = %user.user_id, "owning device not in export");
                self.filter.check_udid(&user.udid)
            }
        };
        if let Some(reason) = skip {
            info!(udid = %user.udid, user_id = %user.user_id, %reason, "skipping user");
            summary.skipped += 1;
            return;
        }

        let push = match self.source.push_info(&user.user_id) {
            Ok(push) => push,
            Err(err @ StoreError::PushInfoNotFound(_)) => {
                info!(user_id = %user.user_id, "skipping user: {err}");
                summary.skipped += 1;
                return;
            }
            Err(err) => {
                warn!(user_id = %user.user_id, "push info lookup failed: {err}");
                summary.failed += 1;
                return;
            }
        };

        match checkin::build_user_token_update(user, &push) {
            Ok(token_update) => {
                let audit_id = format!("{},{},{}", user.user_id, user.udid, user.user_shortname);
                let outcome = self.step("user_token_update", &audit_id, &token_update).await;
                summary.record(&outcome);
            }
            Err(err) => {
                warn!(user_id = %user.user_id, "building user TokenUpdate failed: {err}");
                summary.failed += 1;
            }
        }
    }

    /// Carries one message to its terminal state: encode, dedup check,
    /// deliver, record. Side effects stop at the first failure; the
    /// skip/continue policy lives entirely in the callers above.
    async fn step(&self, kind: &'static str, audit_id: &str, message: &CheckinMessage) -> MessageOutcome {
        let outcome = self.attempt(kind, audit_id, message).await;
        match &outcome {
            MessageOutcome::Delivered => {
                info!(kind, udid = %message.udid(), "sent check-in");
            }
            MessageOutcome::Skipped(SkipReason::AlreadySent) => {
                info!(kind, udid = %message.udid(), "skipping (seen)");
            }
            MessageOutcome::Skipped(SkipReason::DryRun) => {
                info!(kind, udid = %message.udid(), "processing check-in (dry run)");
            }
            MessageOutcome::Failed(err) => {
                warn!(kind, udid = %message.udid(), "check-in failed: {err}");
            }
        }
        outcome
    }

    async fn attempt(
        &self,
        kind: &'static str,
        audit_id: &str,
        message: &CheckinMessage,
    ) -> MessageOutcome {
        let encoded = match checkin::encode(message) {
            Ok(encoded) => encoded,
            Err(err) => return MessageOutcome::Failed(err.into()),
        };

        let Some(client) = &self.client else {
            return MessageOutcome::Skipped(SkipReason::DryRun);
        };

        let message_digest = digest(&encoded);
        if let Some(ledger) = &self.ledger {
            match ledger.seen(&message_digest) {
                Ok(true) => return MessageOutcome::Skipped(SkipReason::AlreadySent),
                Ok(false) => {}
                Err(err) => return MessageOutcome::Failed(err.into()),
            }
        }

        if let Err(err) = client.put_checkin(encoded).await {
            return MessageOutcome::Failed(err.into());
        }

        if let Some(ledger) = &self.ledger {
            let audit = format!("{kind} {audit_id} {}", Utc::now().to_rfc3339());
            if let Err(err) = ledger.mark_sent(&message_digest, &audit) {
                // Delivery already happened; losing the ledger entry only
                // risks one re-delivery on the next run.
                warn!(kind, %message_digest, "recording sent message failed: {err}");
            }
        }
        MessageOutcome::Delivered
    }
}
