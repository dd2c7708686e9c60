// sync/runner.rs - One sync cycle: push stage, paginated pull stage, summary

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::db::{checkpoint, diagnostics, outbox, Database};
use crate::protocol::codec;
use crate::provider::config::RuntimePreset;
use crate::sync::apply::apply_incoming_change;
use crate::sync::engine::{self, PullBatchSummary, PullFailure};
use crate::sync::transport::{SyncTransport, DEFAULT_DEADLINE};
use crate::Result;

/// Options for one cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleOptions {
    /// Push only; skip the pull stage entirely.
    pub skip_pull: bool,
    /// User-initiated: bypasses the backoff gate and resets the failure
    /// counter.
    pub manual: bool,
}

/// Pull-stage counters aggregated across pages.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct PullStageSummary {
    pub applied: u64,
    pub skipped: u64,
    pub conflicts: u64,
    pub failed: u64,
    pub skipped_self: u64,
    pub has_more: bool,
    pub failures: Vec<PullFailure>,
}

impl PullStageSummary {
    fn absorb(&mut self, batch: PullBatchSummary) {
        self.applied += batch.applied;
        self.skipped += batch.skipped;
        self.conflicts += batch.conflicts;
        self.failed += batch.failed;
        self.skipped_self += batch.skipped_self;
        self.failures.extend(batch.failures);
    }
}

/// Aggregate result of one sync cycle.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct SyncSummary {
    pub checkpoint_before: Option<String>,
    pub checkpoint_after: Option<String>,
    pub removed_outbox_changes: u64,
    pub failed_outbox_changes: u64,
    pub pull: PullStageSummary,
}

/// Exponential backoff for auto cycles: 5s base doubling to a 300s cap.
pub fn backoff_delay(consecutive_failures: u32) -> Duration {
    if consecutive_failures == 0 {
        return Duration::ZERO;
    }
    let exponent = (consecutive_failures - 1).min(6);
    Duration::from_secs((5u64 << exponent).min(300))
}

#[derive(Debug, Default)]
struct BackoffState {
    consecutive_failures: u32,
    next_attempt_at: Option<DateTime<Utc>>,
}

/// Drives sync cycles against a pluggable transport.
///
/// At most one cycle runs at a time; a second attempt while one is in
/// flight returns immediately as a no-op.
pub struct SyncRunner {
    db: Database,
    transport: Arc<dyn SyncTransport>,
    preset: RuntimePreset,
    deadline: Duration,
    in_flight: Mutex<()>,
    backoff: RwLock<BackoffState>,
}

impl SyncRunner {
    pub fn new(db: Database, transport: Arc<dyn SyncTransport>, preset: RuntimePreset) -> Self {
        Self {
            db,
            transport,
            preset,
            deadline: DEFAULT_DEADLINE,
            in_flight: Mutex::new(()),
            backoff: RwLock::new(BackoffState::default()),
        }
    }

    /// Build a runner using the runtime preset persisted in settings.
    pub async fn from_settings(
        db: Database,
        transport: Arc<dyn SyncTransport>,
        user_agent: &str,
    ) -> Result<Self> {
        let preset = crate::provider::config::load_runtime_preset(&db.pool, user_agent).await?;
        Ok(Self::new(db, transport, preset))
    }

    /// Auto-cycle cadence for the embedding scheduler.
    pub fn preset(&self) -> &RuntimePreset {
        &self.preset
    }

    /// Seconds until the next auto attempt is allowed, if backed off.
    pub async fn next_attempt_at(&self) -> Option<DateTime<Utc>> {
        self.backoff.read().await.next_attempt_at
    }

    /// Run one sync cycle. Returns None when another cycle is in flight or
    /// when an auto attempt lands inside the backoff window.
    pub async fn run_cycle(&self, options: CycleOptions) -> Result<Option<SyncSummary>> {
        let _guard = match self.in_flight.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::debug!("Sync cycle already in flight, skipping");
                return Ok(None);
            }
        };

        if options.manual {
            let mut state = self.backoff.write().await;
            state.consecutive_failures = 0;
            state.next_attempt_at = None;
        } else {
            let state = self.backoff.read().await;
            if let Some(next) = state.next_attempt_at {
                if Utc::now() < next {
                    tracing::debug!("Auto sync gated by backoff until {}", next);
                    return Ok(None);
                }
            }
        }

        match self.cycle(options).await {
            Ok(summary) => {
                let mut state = self.backoff.write().await;
                state.consecutive_failures = 0;
                state.next_attempt_at = None;
                Ok(Some(summary))
            }
            Err(err) => {
                let mut state = self.backoff.write().await;
                state.consecutive_failures += 1;
                let delay = backoff_delay(state.consecutive_failures);
                state.next_attempt_at = Some(
                    Utc::now()
                        + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::seconds(300)),
                );
                tracing::warn!(
                    "Sync cycle failed ({} consecutive): {}",
                    state.consecutive_failures,
                    err
                );
                Err(err)
            }
        }
    }

    async fn cycle(&self, options: CycleOptions) -> Result<SyncSummary> {
        let pool = &self.db.pool;
        let device_id = self.db.device_id.clone();

        let checkpoint_before = checkpoint::get_checkpoint(pool).await?.last_sync_cursor;
        let mut cursor = checkpoint_before.clone();

        let mut summary = SyncSummary {
            checkpoint_before: checkpoint_before.clone(),
            ..SyncSummary::default()
        };

        // Push stage
        let outbox_rows = outbox::list_pending(pool, self.preset.push_limit).await?;
        if !outbox_rows.is_empty() {
            let prepared = engine::prepare_push_batch(&device_id, cursor.as_deref(), &outbox_rows)?;
            for skip in &prepared.skipped {
                tracing::warn!("Outbox row {} excluded from push: {}", skip.outbox_id, skip.reason);
            }

            if !prepared.request.changes.is_empty() {
                let raw = self.transport.push(&prepared.request, self.deadline).await?;
                let response = codec::parse_push_response(&raw)?;
                let ack = engine::acknowledge_push_result(&prepared.entries, &response);

                summary.removed_outbox_changes =
                    outbox::remove_changes(pool, &ack.removed_outbox_ids).await?;
                for failure in &ack.failed {
                    outbox::mark_failed(pool, failure.outbox_id, &failure.message).await?;
                }
                summary.failed_outbox_changes = ack.failed.len() as u64;

                let advance = engine::advance_cursor(&response.server_cursor, &response.server_time)?;
                checkpoint::set_checkpoint(pool, &advance.cursor, advance.synced_at).await?;
                cursor = Some(advance.cursor);
            }
        }

        // Pull stage, paginated
        if !options.skip_pull {
            for _ in 0..self.preset.max_pull_pages {
                let request = codec::build_pull_request(
                    &device_id,
                    cursor.as_deref(),
                    Some(self.preset.pull_limit),
                )?;
                let raw = self.transport.pull(&request, self.deadline).await?;
                let response = codec::parse_pull_response(&raw)?;

                let batch = engine::apply_pull_batch(&response, &device_id, |change| {
                    let pool = pool.clone();
                    let device_id = device_id.clone();
                    async move { apply_incoming_change(&pool, &device_id, &change).await }
                })
                .await;
                summary.pull.absorb(batch);

                // Cursor advances only after the whole page is applied
                let advance = engine::advance_cursor(&response.server_cursor, &response.server_time)?;
                checkpoint::set_checkpoint(pool, &advance.cursor, advance.synced_at).await?;
                cursor = Some(advance.cursor);

                summary.pull.has_more = response.has_more;
                if !response.has_more {
                    break;
                }
            }
        }

        summary.checkpoint_after = cursor;

        diagnostics::append_snapshot(
            pool,
            "sync_cycle",
            Utc::now(),
            &serde_json::to_value(&summary)?,
        )
        .await?;

        tracing::info!(
            "Sync cycle complete: {} pushed, {} applied, {} conflicts",
            summary.removed_outbox_changes,
            summary.pull.applied,
            summary.pull.conflicts
        );

        Ok(summary)
    }
}
