//! Teardown workflows: delete, the teardown half of shelve, and archive.
//! They are kept in one module because they share the stop → wait-for-shutoff
//! → confirm-gone chain; only what happens to the backing volume differs.

use anyhow::Result;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use deskhive_common::{Instance, VmState, WfOutcome};
use deskhive_providers::{backup_status, server_status, volume_status};

use crate::context::Ctx;
use crate::expiry;
use crate::workflow::{AfterTeardown, WorkflowStep};
use crate::{gateway, logger, models, scheduler, shelve_flow, state_machine};

/// Entry step: drop the gateway connection, best-effort stop the server,
/// then hand over to the bounded shutoff wait.
pub async fn stop_and_release(ctx: &Ctx, instance_id: Uuid, after: AfterTeardown) -> Result<()> {
    let Some(instance) = models::get_instance(&ctx.db, instance_id).await? else {
        tracing::error!("teardown of unknown instance {}", instance_id);
        return Ok(());
    };
    tracing::info!("about to tear down instance {} ({:?})", instance_id, after);

    if let Some(connection_id) = instance.gateway_connection_id {
        gateway::delete_connection(&ctx.db, connection_id).await?;
        sqlx::query("UPDATE instances SET gateway_connection_id = NULL WHERE id = $1")
            .bind(instance_id)
            .execute(&ctx.db)
            .await?;
    }

    let vm_status = models::vm_status_by_instance(&ctx.db, instance_id).await?;
    if after == AfterTeardown::ShelveVolume {
        if let Some(vm_status) = &vm_status {
            let _ =
                state_machine::set_progress(&ctx.db, vm_status.id, 33, "Instance stopping").await;
        }
    }

    match ctx.provider.get_server(instance_id).await {
        Ok(detail) if detail.status == server_status::ACTIVE => {
            if let Err(e) = ctx.provider.stop_server(instance_id).await {
                if after == AfterTeardown::ShelveVolume {
                    tracing::error!("instance stop failed for {}: {}", instance_id, e);
                    models::finish_expiration(&ctx.db, instance.expiration_id, WfOutcome::Fail)
                        .await?;
                    return Ok(());
                }
                tracing::error!("instance stop failed for {}, deleting anyway: {}", instance_id, e);
            }
        }
        Ok(detail) if detail.status == server_status::SHUTOFF => {
            tracing::info!("instance {} already shut off", instance_id);
        }
        Ok(detail) => {
            // Stuck resizing, locked after an incident, ERROR from a failed
            // launch... all need a human.
            let msg = format!("Control-plane server in unexpected state {}", detail.status);
            tracing::error!("{}; needs manual cleanup ({})", msg, instance_id);
            models::instance_error(&ctx.db, instance_id, &msg).await?;
            if after == AfterTeardown::ShelveVolume {
                if let Some(vm_status) = &vm_status {
                    state_machine::force_status(
                        &ctx.db,
                        vm_status.id,
                        VmState::Error,
                        Some(&msg),
                        "teardown found unexpected state",
                    )
                    .await?;
                }
                models::finish_expiration(&ctx.db, instance.expiration_id, WfOutcome::Retry)
                    .await?;
            }
            return Ok(());
        }
        Err(e) if e.is_not_found() => {
            tracing::error!("tearing down instance {} but it is already gone", instance_id);
            models::instance_error(&ctx.db, instance_id, "Control-plane server missing").await?;
            if after == AfterTeardown::ShelveVolume {
                if let Some(vm_status) = &vm_status {
                    state_machine::force_status(
                        &ctx.db,
                        vm_status.id,
                        VmState::Missing,
                        None,
                        "server missing at shelve",
                    )
                    .await?;
                }
                models::finish_expiration(&ctx.db, instance.expiration_id, WfOutcome::Success)
                    .await?;
                return Ok(());
            }
            // For delete, "already gone" just advances the workflow.
        }
        Err(e) => {
            if after == AfterTeardown::ShelveVolume {
                tracing::error!("instance get failed for {}: {}", instance_id, e);
                models::finish_expiration(&ctx.db, instance.expiration_id, WfOutcome::Retry)
                    .await?;
                return Ok(());
            }
            return Err(e.into()); // bounded redelivery by the dispatcher
        }
    }

    scheduler::enqueue_in(
        &ctx.db,
        &WorkflowStep::WaitShutoff {
            instance_id,
            retries: ctx.settings.shutoff_retry_count,
            after,
        },
        ctx.settings.shutoff_retry_wait,
    )
    .await?;
    Ok(())
}

/// Bounded wait for SHUTOFF. Exhausting retries is logged and the delete is
/// issued anyway; an instance that refuses to stop should not wedge the
/// teardown forever.
pub async fn wait_shutoff(
    ctx: &Ctx,
    instance_id: Uuid,
    retries: i32,
    after: AfterTeardown,
) -> Result<()> {
    let Some(instance) = models::get_instance(&ctx.db, instance_id).await? else {
        return Ok(());
    };

    let shut_off = match ctx.provider.get_server(instance_id).await {
        Ok(detail) => detail.status == server_status::SHUTOFF,
        Err(e) if e.is_not_found() => true, // already gone is as stopped as it gets
        Err(e) => {
            tracing::warn!("shutoff check failed for {}: {}", instance_id, e);
            false
        }
    };

    if !shut_off && retries > 0 {
        tracing::info!(
            "instance {} not yet SHUTOFF, rechecking with {} retries remaining",
            instance_id,
            retries
        );
        scheduler::enqueue_in(
            &ctx.db,
            &WorkflowStep::WaitShutoff {
                instance_id,
                retries: retries - 1,
                after,
            },
            ctx.settings.shutoff_retry_wait,
        )
        .await?;
        return Ok(());
    }
    if !shut_off {
        tracing::info!(
            "ran out of retries waiting for {} to shut off, deleting anyway",
            instance_id
        );
    }

    if let Some(vm_status) = models::vm_status_by_instance(&ctx.db, instance_id).await? {
        if vm_status.status == VmState::Waiting {
            let message = match after {
                AfterTeardown::ShelveVolume => "Instance shelving",
                _ => "Instance deleting",
            };
            let _ = state_machine::set_progress(&ctx.db, vm_status.id, 66, message).await;
        }
    }

    request_server_delete(ctx, &instance).await;

    scheduler::enqueue_in(
        &ctx.db,
        &WorkflowStep::ConfirmInstanceGone {
            instance_id,
            retries: ctx.settings.deletion_retry_count,
            after,
        },
        ctx.settings.deletion_retry_wait,
    )
    .await?;
    Ok(())
}

/// Mark the record, then tell the control plane. "Not found" means a prior
/// run (or the control plane itself) already did it.
async fn request_server_delete(ctx: &Ctx, instance: &Instance) {
    if let Err(e) = models::mark_instance_for_deletion(&ctx.db, instance.id).await {
        tracing::error!("could not mark instance {} for deletion: {:?}", instance.id, e);
    }
    match ctx.provider.delete_server(instance.id).await {
        Ok(()) => tracing::info!("instructed control plane to delete {}", instance.id),
        Err(e) if e.is_not_found() => tracing::info!("instance {} already deleted", instance.id),
        Err(e) => tracing::error!("server delete call failed for {}: {}", instance.id, e),
    }
}

/// Bounded poll until the control plane confirms the server is gone, then
/// dispose of the backing volume according to `after`.
pub async fn confirm_instance_gone(
    ctx: &Ctx,
    instance_id: Uuid,
    retries: i32,
    after: AfterTeardown,
) -> Result<()> {
    let Some(instance) = models::get_instance(&ctx.db, instance_id).await? else {
        return Ok(());
    };

    match ctx.provider.get_server(instance_id).await {
        Err(e) if e.is_not_found() => {
            models::set_instance_deleted(&ctx.db, instance_id).await?;
            logger::log_quick(&ctx.db, "INSTANCE_DELETED", Some(instance_id), None).await;
            match after {
                AfterTeardown::DeleteVolume => {
                    tracing::info!(
                        "instance {} deleted, proceeding to delete volume {}",
                        instance_id,
                        instance.boot_volume_id
                    );
                    delete_volume(ctx, instance.boot_volume_id).await?;
                }
                AfterTeardown::ShelveVolume => {
                    tracing::info!(
                        "instance {} deleted, marking volume {} shelved",
                        instance_id,
                        instance.boot_volume_id
                    );
                    shelve_flow::complete_shelve(ctx, &instance).await?;
                }
            }
            Ok(())
        }
        Ok(_) => {
            if retries <= 0 {
                let msg = "Ran out of retries trying to delete";
                tracing::error!("{} {}", msg, instance_id);
                models::instance_error(&ctx.db, instance_id, msg).await?;
                models::volume_error(&ctx.db, instance.boot_volume_id, msg).await?;
                if after == AfterTeardown::ShelveVolume {
                    models::finish_expiration(&ctx.db, instance.expiration_id, WfOutcome::Retry)
                        .await?;
                }
                return Ok(());
            }
            // The delete request may have been lost; repeat it, it is
            // idempotent on the control-plane side.
            request_server_delete(ctx, &instance).await;
            scheduler::enqueue_in(
                &ctx.db,
                &WorkflowStep::ConfirmInstanceGone {
                    instance_id,
                    retries: retries - 1,
                    after,
                },
                ctx.settings.deletion_retry_wait,
            )
            .await?;
            Ok(())
        }
        Err(e) => {
            tracing::error!("server get failed while confirming delete of {}: {}", instance_id, e);
            if after == AfterTeardown::ShelveVolume {
                models::finish_expiration(&ctx.db, instance.expiration_id, WfOutcome::Fail)
                    .await?;
            }
            Ok(())
        }
    }
}

pub async fn delete_volume(ctx: &Ctx, volume_id: Uuid) -> Result<bool> {
    match ctx.provider.delete_volume(volume_id).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {
            tracing::info!("control-plane volume {} already gone", volume_id);
        }
        Err(e) => {
            tracing::error!("volume delete failed for {}: {}", volume_id, e);
            models::volume_error(&ctx.db, volume_id, "Control-plane volume delete failed").await?;
            return Ok(false);
        }
    }
    models::set_volume_deleted(&ctx.db, volume_id).await?;
    logger::log_quick(&ctx.db, "VOLUME_DELETED", Some(volume_id), None).await;
    Ok(true)
}

/// Delete a volume's archive backup; used by the backup-retention expirer.
pub async fn delete_backup(ctx: &Ctx, volume_id: Uuid) -> Result<WfOutcome> {
    let Some(volume) = models::get_volume(&ctx.db, volume_id).await? else {
        return Ok(WfOutcome::Fail);
    };
    let Some(backup_id) = volume.backup_id.as_deref() else {
        tracing::info!("no backup to delete for volume {}", volume_id);
        return Ok(WfOutcome::Success);
    };
    match ctx.provider.delete_backup(backup_id).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {
            tracing::info!("backup {} for volume {} already gone", backup_id, volume_id);
        }
        Err(e) => {
            tracing::error!("backup delete failed for volume {}: {}", volume_id, e);
            return Ok(WfOutcome::Retry);
        }
    }
    sqlx::query("UPDATE volumes SET backup_id = NULL WHERE id = $1")
        .bind(volume_id)
        .execute(&ctx.db)
        .await?;
    logger::log_quick(&ctx.db, "BACKUP_DELETED", Some(volume_id), None).await;
    Ok(WfOutcome::Success)
}

/// Archive a volume: take a control-plane backup, then delete the volume
/// once the backup is confirmed. Marking for deletion up front frees the
/// slot so the user can launch a fresh desktop immediately.
pub async fn archive_volume(ctx: &Ctx, volume_id: Uuid) -> Result<WfOutcome> {
    let Some(volume) = models::get_volume(&ctx.db, volume_id).await? else {
        tracing::error!("archive of unknown volume {}", volume_id);
        return Ok(WfOutcome::Fail);
    };

    models::mark_volume_for_deletion(&ctx.db, volume_id).await?;

    match ctx.provider.get_volume(volume_id).await {
        Ok(detail) if detail.status == volume_status::AVAILABLE => {}
        Ok(detail) => {
            tracing::error!(
                "cannot archive volume {} with control-plane status {}; manual cleanup needed",
                volume_id,
                detail.status
            );
            return Ok(WfOutcome::Retry);
        }
        Err(e) if e.is_not_found() => {
            tracing::error!("control-plane volume missing for {}; cannot be archived", volume_id);
            models::volume_error(&ctx.db, volume_id, "Control-plane volume missing").await?;
            // Nothing left to archive; the retirement is effectively done.
            return Ok(WfOutcome::Success);
        }
        Err(e) => return Err(e.into()),
    }

    let backup_id = match ctx
        .provider
        .create_backup(volume_id, &format!("{volume_id}-archive"))
        .await
    {
        Ok(id) => id,
        Err(e) => {
            tracing::error!("backup request failed for volume {}: {}", volume_id, e);
            models::volume_error(&ctx.db, volume_id, "Control-plane backup failed").await?;
            return Ok(WfOutcome::Fail);
        }
    };
    tracing::info!("backup {} started for volume {}", backup_id, volume_id);
    logger::log_quick(&ctx.db, "VOLUME_ARCHIVE_STARTED", Some(volume_id), Some(&backup_id)).await;

    scheduler::enqueue_in(
        &ctx.db,
        &WorkflowStep::WaitBackup {
            volume_id,
            backup_id,
            deadline: Utc::now()
                + chrono::Duration::from_std(ctx.settings.archive_wait).unwrap_or_else(|_| chrono::Duration::zero()),
        },
        ctx.settings.poll_step_delay,
    )
    .await?;

    // The slot is free; let the user launch a new desktop right away.
    if let Some(vm_status) = models::vm_status_for_volume(&ctx.db, volume_id).await? {
        state_machine::force_status(
            &ctx.db,
            vm_status.id,
            VmState::NoVm,
            None,
            "volume archiving",
        )
        .await?;
    }

    Ok(WfOutcome::Continue)
}

/// Poll the backup. Available: record it, give the volume its retention
/// expiry and delete the volume. Timeout: log and abandon; the volume stays
/// marked-for-deletion and flagged for manual recovery.
pub async fn wait_backup(
    ctx: &Ctx,
    volume_id: Uuid,
    backup_id: &str,
    deadline: DateTime<Utc>,
) -> Result<()> {
    let Some(volume) = models::get_volume(&ctx.db, volume_id).await? else {
        return Ok(());
    };

    let detail = match ctx.provider.get_backup(backup_id).await {
        Ok(detail) => detail,
        Err(e) if e.is_not_found() => {
            tracing::error!(
                "backup {} for volume {} not found; presumed failed",
                backup_id,
                volume_id
            );
            models::finish_expiration(&ctx.db, volume.expiration_id, WfOutcome::Fail).await?;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    match detail.status.as_str() {
        backup_status::CREATING => {
            if Utc::now() > deadline {
                let msg = format!("Backup {backup_id} took too long");
                tracing::error!("{} (volume {})", msg, volume_id);
                models::volume_error(&ctx.db, volume_id, &msg).await?;
                models::finish_expiration(&ctx.db, volume.expiration_id, WfOutcome::Fail).await?;
                return Ok(());
            }
            scheduler::enqueue_in(
                &ctx.db,
                &WorkflowStep::WaitBackup {
                    volume_id,
                    backup_id: backup_id.to_string(),
                    deadline,
                },
                ctx.settings.archive_poll_delay,
            )
            .await?;
        }
        backup_status::AVAILABLE => {
            tracing::info!("backup {} completed for volume {}", backup_id, volume_id);
            sqlx::query("UPDATE volumes SET backup_id = $2, archived_at = NOW() WHERE id = $1")
                .bind(volume_id)
                .bind(backup_id)
                .execute(&ctx.db)
                .await?;
            models::finish_expiration(&ctx.db, volume.expiration_id, WfOutcome::Success).await?;
            // The backup now carries the retention clock.
            let policy = expiry::backup_policy(&ctx.settings);
            models::set_volume_expires(&ctx.db, volume_id, Some(policy.initial_expiry(Utc::now())))
                .await?;
            logger::log_quick(&ctx.db, "VOLUME_ARCHIVED", Some(volume_id), Some(backup_id)).await;
            delete_volume(ctx, volume_id).await?;
        }
        other => {
            tracing::error!(
                "backup {} for volume {} in unexpected state {}",
                backup_id,
                volume_id,
                other
            );
            models::finish_expiration(&ctx.db, volume.expiration_id, WfOutcome::Fail).await?;
        }
    }
    Ok(())
}
