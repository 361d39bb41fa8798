//! Garbage collection of expired session records.
//!
//! Periodically sweeps the session namespace and deletes records that the
//! lifecycle manager would no longer accept.

use crate::expiry::ExpiryPolicy;
use crate::store::RecordStore;
use chrono::{DateTime, Utc};
use kvsession_core::{SessionError, SessionResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Result of one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GcReport {
    /// Records examined.
    pub scanned: usize,
    /// Records deleted by this sweep.
    pub deleted: usize,
}

/// Deletes records that are stale, expired, or unreadable.
pub struct GarbageCollector {
    store: RecordStore,
    policy: ExpiryPolicy,
}

impl GarbageCollector {
    pub fn new(store: RecordStore, policy: ExpiryPolicy) -> Self {
        Self { store, policy }
    }

    /// Sweep the namespace once, judging records as of `now`.
    ///
    /// Deletes are conditional on the version seen by the scan, so a session
    /// written after the scan survives. A record deleted concurrently by
    /// another collector or a logout is not an error.
    pub async fn collect(&self, now: DateTime<Utc>) -> SessionResult<GcReport> {
        let scanned = self.store.scan().await?;
        let mut report = GcReport {
            scanned: scanned.len(),
            deleted: 0,
        };

        for entry in scanned {
            let reason = match &entry.record {
                Ok(record) => match self.policy.stale_reason(record, now) {
                    Some(reason) => reason.as_str(),
                    None => continue,
                },
                Err(_) => "unreadable",
            };
            match self.store.delete_if_version(&entry.id, entry.version).await {
                Ok(()) => {
                    debug!(session = %entry.id.short(), reason, "Collected session");
                    report.deleted += 1;
                }
                Err(SessionError::VersionConflict { .. }) => {
                    debug!(session = %entry.id.short(), "Session rewritten since scan, kept");
                }
                Err(SessionError::NotFound) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(report)
    }
}

/// Spawn a background task that runs `collector` every `interval_secs`.
///
/// Returns a `JoinHandle` that can be used to abort the task.
pub fn spawn_gc_task(
    collector: Arc<GarbageCollector>,
    interval_secs: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(interval_secs.max(1)));

        // Skip the first immediate tick
        ticker.tick().await;

        loop {
            ticker.tick().await;

            match collector.collect(Utc::now()).await {
                Ok(report) if report.deleted > 0 => {
                    info!(
                        scanned = report.scanned,
                        deleted = report.deleted,
                        "Session garbage collection completed"
                    );
                }
                Ok(report) => {
                    debug!(scanned = report.scanned, "Session garbage collection: nothing expired");
                }
                Err(e) => {
                    warn!(error = %e, "Session garbage collection failed");
                }
            }
        }
    })
}
