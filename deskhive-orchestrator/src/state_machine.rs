use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres};

use deskhive_common::VmState;

use crate::models;

/// Record a state transition in vm_status_history.
async fn log_state_transition(
    db: &Pool<Postgres>,
    vm_status_id: i64,
    from_status: VmState,
    to_status: VmState,
    reason: &str,
) {
    let _ = sqlx::query(
        "INSERT INTO vm_status_history (vm_status_id, from_status, to_status, reason)
         VALUES ($1, $2, $3, $4)",
    )
    .bind(vm_status_id)
    .bind(from_status)
    .bind(to_status)
    .bind(reason)
    .execute(db)
    .await;
}

async fn current_status(db: &Pool<Postgres>, vm_status_id: i64) -> Option<VmState> {
    sqlx::query_scalar("SELECT status FROM vm_statuses WHERE id = $1")
        .bind(vm_status_id)
        .fetch_optional(db)
        .await
        .ok()
        .flatten()
}

/// Entry point for a guarded public operation: flip to the in-flight state,
/// arm the watchdog deadline and reset progress, in one guarded write.
pub async fn begin_operation(
    db: &Pool<Postgres>,
    vm_status_id: i64,
    from: &[VmState],
    to: VmState,
    wait_time: DateTime<Utc>,
    message: &str,
    done: &str,
    reason: &str,
) -> Result<bool> {
    let prev = current_status(db, vm_status_id).await;
    let res = sqlx::query(
        "UPDATE vm_statuses
         SET status = $3, wait_time = $4, status_progress = 0,
             status_message = $5, status_done = $6
         WHERE id = $1 AND status = ANY($2)",
    )
    .bind(vm_status_id)
    .bind(from)
    .bind(to)
    .bind(wait_time)
    .bind(message)
    .bind(done)
    .execute(db)
    .await?;

    if res.rows_affected() > 0 {
        if let Some(prev) = prev {
            log_state_transition(db, vm_status_id, prev, to, reason).await;
        }
        Ok(true)
    } else {
        Ok(false)
    }
}

/// Progress update while a workflow is in flight; a no-op once the status
/// has left the in-flight states.
pub async fn set_progress(
    db: &Pool<Postgres>,
    vm_status_id: i64,
    progress: i32,
    message: &str,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE vm_statuses
         SET status_progress = $2, status_message = $3
         WHERE id = $1 AND status IN ('creating', 'waiting', 'resizing')",
    )
    .bind(vm_status_id)
    .bind(progress)
    .bind(message)
    .execute(db)
    .await?;
    Ok(res.rows_affected() > 0)
}

/// Workflow completion: in-flight -> ready (okay or supersized), progress 100.
pub async fn to_ready(
    db: &Pool<Postgres>,
    vm_status_id: i64,
    ready: VmState,
    reason: &str,
) -> Result<bool> {
    let prev = current_status(db, vm_status_id).await;
    let res = sqlx::query(
        "UPDATE vm_statuses
         SET status = $2, status_progress = 100, status_message = 'Instance ready'
         WHERE id = $1 AND status IN ('creating', 'waiting', 'resizing', 'error')",
    )
    .bind(vm_status_id)
    .bind(ready)
    .execute(db)
    .await?;
    if res.rows_affected() > 0 {
        if let Some(prev) = prev {
            log_state_transition(db, vm_status_id, prev, ready, reason).await;
        }
        Ok(true)
    } else {
        Ok(false)
    }
}

/// Mark the status errored and cascade the error onto the instance and its
/// boot volume, so operator tooling sees the whole picture.
pub async fn status_error(db: &Pool<Postgres>, vm_status_id: i64, message: &str) -> Result<()> {
    let prev = current_status(db, vm_status_id).await;
    sqlx::query(
        "UPDATE vm_statuses SET status = 'error', status_message = $2 WHERE id = $1",
    )
    .bind(vm_status_id)
    .bind(message)
    .execute(db)
    .await?;
    if let Some(prev) = prev {
        log_state_transition(db, vm_status_id, prev, VmState::Error, message).await;
    }

    if let Some(vm_status) = models::vm_status_by_id(db, vm_status_id).await? {
        if let Some(instance_id) = vm_status.instance_id {
            models::instance_error(db, instance_id, message).await?;
            if let Some(instance) = models::get_instance(db, instance_id).await? {
                models::volume_error(db, instance.boot_volume_id, message).await?;
            }
        }
    }
    Ok(())
}

/// Unconditional status write used by teardown and give-up paths (delete is
/// performed out of the user's sight; there is no progress view to keep
/// consistent).
pub async fn force_status(
    db: &Pool<Postgres>,
    vm_status_id: i64,
    to: VmState,
    message: Option<&str>,
    reason: &str,
) -> Result<()> {
    let prev = current_status(db, vm_status_id).await;
    sqlx::query(
        "UPDATE vm_statuses SET status = $2, status_message = COALESCE($3, status_message)
         WHERE id = $1",
    )
    .bind(vm_status_id)
    .bind(to)
    .bind(message)
    .execute(db)
    .await?;
    if let Some(prev) = prev {
        log_state_transition(db, vm_status_id, prev, to, reason).await;
    }
    Ok(())
}
