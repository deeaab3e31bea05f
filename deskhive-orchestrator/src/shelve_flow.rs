use anyhow::Result;
use uuid::Uuid;

use deskhive_common::{Instance, WfOutcome};

use crate::context::Ctx;
use crate::expiry;
use crate::workflow::{AfterTeardown, WorkflowStep};
use crate::{logger, models, scheduler};

/// Final step of the shelve teardown: the instance is confirmed gone, the
/// volume is parked and given its archive clock, and the desktop shows as
/// shelved.
pub async fn complete_shelve(ctx: &Ctx, instance: &Instance) -> Result<()> {
    sqlx::query("UPDATE volumes SET shelved_at = NOW() WHERE id = $1")
        .bind(instance.boot_volume_id)
        .execute(&ctx.db)
        .await?;
    let policy = expiry::volume_policy(&ctx.settings);
    models::set_volume_expires(
        &ctx.db,
        instance.boot_volume_id,
        Some(policy.initial_expiry(chrono::Utc::now())),
    )
    .await?;

    if let Some(vm_status) = models::vm_status_by_instance(&ctx.db, instance.id).await? {
        sqlx::query(
            "UPDATE vm_statuses
             SET status = 'shelved', status_progress = 100, status_message = 'Instance shelved'
             WHERE id = $1",
        )
        .bind(vm_status.id)
        .execute(&ctx.db)
        .await?;
    }

    models::finish_expiration(&ctx.db, instance.expiration_id, WfOutcome::Success).await?;
    logger::log_quick(&ctx.db, "INSTANCE_SHELVED", Some(instance.id), None).await;
    tracing::info!(
        "instance {} shelved; volume {} retained",
        instance.id,
        instance.boot_volume_id
    );
    Ok(())
}

/// Expiry-triggered shelve. Simulates the VMStatus behavior of a user shelve
/// (with a longer deadline) in case the user refreshes while the forced
/// shelve is happening.
pub async fn shelve_expired(ctx: &Ctx, instance_id: Uuid) -> Result<WfOutcome> {
    let Some(vm_status) = models::vm_status_by_instance(&ctx.db, instance_id).await? else {
        tracing::error!("no vm_status for expiring instance {}", instance_id);
        return Ok(WfOutcome::Retry);
    };
    if !vm_status.status.is_ready() {
        tracing::error!(
            "instance {} in unexpected state {} for expiry shelve",
            instance_id,
            vm_status.status
        );
        return Ok(WfOutcome::Retry);
    }

    let wait_time = chrono::Utc::now()
        + chrono::Duration::from_std(ctx.settings.forced_shelve_wait).unwrap_or_else(|_| chrono::Duration::zero());
    sqlx::query(
        "UPDATE vm_statuses
         SET status = 'waiting', wait_time = $2, status_progress = 0,
             status_message = 'Starting desktop shelve',
             status_done = 'has been shelved'
         WHERE id = $1",
    )
    .bind(vm_status.id)
    .bind(wait_time)
    .execute(&ctx.db)
    .await?;

    scheduler::enqueue(
        &ctx.db,
        &WorkflowStep::StopAndRelease {
            instance_id,
            after: AfterTeardown::ShelveVolume,
        },
    )
    .await?;
    Ok(WfOutcome::Continue)
}
