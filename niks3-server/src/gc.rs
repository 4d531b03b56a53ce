//! Garbage collection.
//!
//! Reclaims S3 objects (and their ledger rows) once they fall out of
//! every live closure's reachable set, and cleans up abandoned
//! multipart uploads left behind by clients that never completed a
//! pending closure.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::time;
use tracing::instrument;

use crate::database::Ledger;
use crate::error::ServerResult;
use crate::storage::{DeleteOutcome, ObjectStore};

/// Batch size for `GetObjectsReadyForDeletion` and the ledger-side
/// delete/resurrect flushes.
const SWEEP_BATCH_SIZE: u64 = 1000;

/// Parameters for one GC pass, mirroring the `DELETE /api/closures`
/// query parameters.
#[derive(Debug, Clone)]
pub struct GcParams {
    /// Closures untouched for longer than this are deleted (unless pinned).
    pub older_than: Duration,
    /// Pending closures and multipart uploads older than this are abandoned.
    pub failed_uploads_older_than: Duration,
    /// Skip the grace period entirely and sweep everything already marked stale.
    pub force: bool,
    /// Concurrency for multipart-abort and bulk-delete worker pools.
    pub s3_concurrency: usize,
}

/// Outcome of one GC pass, returned to API callers as the response body
/// of the explicit `DELETE /api/closures` trigger.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GcStats {
    pub aborted_multipart_uploads: u64,
    pub cleaned_pending_closures: u64,
    pub deleted_closures: u64,
    pub marked_stale_objects: u64,
    pub deleted_objects: u64,
    pub resurrected_objects: u64,
}

/// Runs garbage collection on `interval`, forever. Does not stop on
/// error — failures are logged and retried on the next tick.
pub async fn run_periodically(
    ledger: Arc<dyn Ledger>,
    storage: Arc<dyn ObjectStore>,
    interval: Duration,
    params: GcParams,
) {
    if interval.is_zero() {
        return;
    }

    loop {
        if let Err(e) = run_once(ledger.as_ref(), storage.as_ref(), &params).await {
            tracing::warn!("Garbage collection failed: {}", e);
        }

        time::sleep(interval).await;
    }
}

/// Runs one full garbage-collection pass.
#[instrument(skip_all)]
pub async fn run_once(
    ledger: &dyn Ledger,
    storage: &dyn ObjectStore,
    params: &GcParams,
) -> ServerResult<GcStats> {
    tracing::info!("Running garbage collection");

    let mut stats = GcStats::default();

    reap_abandoned_uploads(ledger, storage, params, &mut stats).await?;

    let older_than_cutoff = Utc::now()
        - chrono::Duration::from_std(params.older_than).unwrap_or_else(|_| chrono::Duration::zero());
    stats.deleted_closures = ledger.delete_old_closures(older_than_cutoff).await?;
    tracing::info!("Deleted {} stale closures", stats.deleted_closures);

    stats.marked_stale_objects = ledger.mark_stale_objects().await?;
    tracing::info!("Marked {} objects stale", stats.marked_stale_objects);

    sweep(ledger, storage, params, &mut stats).await?;
    vacuum(ledger).await?;

    Ok(stats)
}

/// Runs only the abandoned-upload reap (step 1 of `run_once`), without
/// touching closures or sweeping objects. Backs `DELETE
/// /api/pending_closures`, which is scoped to stuck uploads and has no
/// business affecting live closures.
pub async fn run_reap_only(
    ledger: &dyn Ledger,
    storage: &dyn ObjectStore,
    failed_uploads_older_than: Duration,
    s3_concurrency: usize,
) -> ServerResult<GcStats> {
    let params = GcParams {
        older_than: Duration::ZERO,
        failed_uploads_older_than,
        force: false,
        s3_concurrency,
    };

    let mut stats = GcStats::default();
    reap_abandoned_uploads(ledger, storage, &params, &mut stats).await?;
    Ok(stats)
}

/// Aborts multipart uploads belonging to pending closures that never
/// completed, then tombstones their orphaned pending objects and
/// cascade-deletes the pending-closure rows.
#[instrument(skip_all)]
async fn reap_abandoned_uploads(
    ledger: &dyn Ledger,
    storage: &dyn ObjectStore,
    params: &GcParams,
    stats: &mut GcStats,
) -> ServerResult<()> {
    let seconds_old = params.failed_uploads_older_than.as_secs() as i64;
    let uploads = ledger.get_old_multipart_uploads(seconds_old).await?;

    if !uploads.is_empty() {
        let permits = Arc::new(Semaphore::new(params.s3_concurrency.max(1)));
        let futures = uploads.into_iter().map(|(object_key, upload_id)| {
            let permits = permits.clone();
            async move {
                let _permit = permits.acquire().await.expect("semaphore never closed");
                if let Err(e) = storage.abort_multipart(&object_key, &upload_id).await {
                    tracing::warn!("Failed to abort multipart upload {}: {}", upload_id, e);
                }
            }
        });

        let aborted = join_all(futures).await.len() as u64;
        stats.aborted_multipart_uploads = aborted;
        tracing::info!("Aborted {} abandoned multipart uploads", aborted);
    }

    let outcome = ledger.cleanup_pending_closures(seconds_old).await?;
    stats.cleaned_pending_closures = outcome.pending_closures_removed;
    tracing::info!(
        "Cleaned up {} abandoned pending closures",
        outcome.pending_closures_removed
    );

    Ok(())
}

/// Sweeps every object that has cleared its grace period: deletes it
/// from S3 and, on success (or if it was already gone), from the
/// ledger; any other S3 failure resurrects the ledger row so it is
/// reconsidered on the next mark phase.
#[instrument(skip_all)]
async fn sweep(
    ledger: &dyn Ledger,
    storage: &dyn ObjectStore,
    params: &GcParams,
    stats: &mut GcStats,
) -> ServerResult<()> {
    let grace_period = if params.force {
        Duration::ZERO
    } else {
        params.failed_uploads_older_than
    };

    loop {
        let keys = ledger
            .get_objects_ready_for_deletion(grace_period, SWEEP_BATCH_SIZE)
            .await?;

        if keys.is_empty() {
            break;
        }

        let results = storage.bulk_delete(keys).await?;

        let mut to_delete = Vec::new();
        let mut to_resurrect = Vec::new();
        for (key, outcome) in results {
            match outcome {
                DeleteOutcome::Deleted => to_delete.push(key),
                DeleteOutcome::Failed(reason) => {
                    tracing::warn!("Failed to delete {} from storage: {}", key, reason);
                    to_resurrect.push(key);
                }
            }
        }

        if !to_delete.is_empty() {
            stats.deleted_objects += ledger.delete_objects(&to_delete).await?;
        }
        if !to_resurrect.is_empty() {
            stats.resurrected_objects += to_resurrect.len() as u64;
            ledger.mark_objects_as_active(&to_resurrect).await?;
        }
    }

    tracing::info!(
        "Sweep complete: {} deleted, {} resurrected",
        stats.deleted_objects,
        stats.resurrected_objects
    );

    Ok(())
}

/// Issues a non-blocking reclaim/analyze on a supporting engine
/// (Postgres); a no-op on SQLite, which has no equivalent online
/// vacuum that is safe to run from application code.
#[instrument(skip_all)]
async fn vacuum(ledger: &dyn Ledger) -> ServerResult<()> {
    ledger.vacuum().await
}
