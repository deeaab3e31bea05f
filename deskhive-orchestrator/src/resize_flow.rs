use anyhow::Result;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use deskhive_common::{Resize, VmState, WfOutcome};
use deskhive_providers::{server_status, ProviderError};

use crate::context::Ctx;
use crate::expiry;
use crate::workflow::WorkflowStep;
use crate::{logger, models, scheduler, state_machine};

/// Report a resize workflow's terminal outcome onto an in-flight
/// (expiry-triggered) downsize; a no-op for user-triggered resizes.
pub async fn end_resize(ctx: &Ctx, instance_id: Uuid, outcome: WfOutcome) -> Result<()> {
    if let Some(resize) = models::latest_resize(&ctx.db, instance_id).await? {
        models::finish_expiration(&ctx.db, resize.expiration_id, outcome).await?;
    }
    Ok(())
}

/// Issue the control-plane resize, or short-circuit when the instance is
/// already at the target flavor. Supersize opens a Resize record with its
/// boost expiry; downsize closes the current one.
pub async fn start_resize(
    ctx: &Ctx,
    instance_id: Uuid,
    target_flavor: &str,
    target_state: VmState,
    boost: bool,
) -> Result<()> {
    let Some(_instance) = models::get_instance(&ctx.db, instance_id).await? else {
        tracing::error!("resize of unknown instance {}", instance_id);
        return Ok(());
    };
    let Some(vm_status) = models::vm_status_by_instance(&ctx.db, instance_id).await? else {
        tracing::error!("no vm_status for resizing instance {}", instance_id);
        return Ok(());
    };

    let detail = match ctx.provider.get_server(instance_id).await {
        Ok(detail) => detail,
        Err(ProviderError::NotFound(_)) => {
            tracing::error!("trying to resize {} but it is gone from the control plane", instance_id);
            models::instance_error(&ctx.db, instance_id, "Control-plane server missing").await?;
            state_machine::status_error(&ctx.db, vm_status.id, "Control-plane server missing")
                .await?;
            end_resize(ctx, instance_id, WfOutcome::Fail).await?;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    if detail.status != server_status::ACTIVE {
        let msg = format!("Control-plane server in unexpected state {}", detail.status);
        tracing::error!("{}; needs manual cleanup ({})", msg, instance_id);
        models::instance_error(&ctx.db, instance_id, &msg).await?;
        end_resize(ctx, instance_id, WfOutcome::Retry).await?;
        return Ok(());
    }

    if detail.flavor == target_flavor {
        // Idempotent no-op: the desired size is already in effect.
        tracing::info!(
            "instance {} already has flavor {}, skipping the resize",
            instance_id,
            target_flavor
        );
        if !boost {
            if let Some(resize) = models::latest_resize(&ctx.db, instance_id).await? {
                if resize.reverted.is_none() {
                    models::revert_resize(&ctx.db, resize.id).await?;
                }
            }
        }
        state_machine::to_ready(&ctx.db, vm_status.id, target_state, "resize short-circuit")
            .await?;
        end_resize(ctx, instance_id, WfOutcome::Success).await?;
        return Ok(());
    }

    if let Err(e) = ctx.provider.resize_server(instance_id, target_flavor).await {
        tracing::error!("resize call failed for {}: {}", instance_id, e);
        state_machine::status_error(&ctx.db, vm_status.id, "Resize request failed").await?;
        end_resize(ctx, instance_id, WfOutcome::Fail).await?;
        return Ok(());
    }
    logger::log_quick(&ctx.db, "RESIZE_REQUESTED", Some(instance_id), Some(target_flavor)).await;
    let _ = state_machine::set_progress(
        &ctx.db,
        vm_status.id,
        33,
        "Resize initiated; waiting to confirm",
    )
    .await;

    if boost {
        match models::insert_resize(&ctx.db, instance_id).await? {
            Some(resize_id) => {
                let policy = expiry::boost_policy(&ctx.settings);
                models::set_resize_expires(
                    &ctx.db,
                    resize_id,
                    Some(policy.initial_expiry(Utc::now())),
                )
                .await?;
            }
            None => {
                // The partial unique index caught a concurrent boost.
                tracing::error!("instance {} already has a current resize record", instance_id);
            }
        }
    } else {
        match models::latest_resize(&ctx.db, instance_id).await? {
            Some(resize) => models::revert_resize(&ctx.db, resize.id).await?,
            None => tracing::error!("missing resize record for instance {}", instance_id),
        }
    }

    scheduler::enqueue_in(
        &ctx.db,
        &WorkflowStep::WaitResizeConfirm {
            instance_id,
            target_flavor: target_flavor.to_string(),
            target_state,
            deadline: Utc::now()
                + chrono::Duration::from_std(ctx.settings.resize_confirm_wait).unwrap_or_else(|_| chrono::Duration::zero()),
        },
        ctx.settings.poll_step_delay,
    )
    .await?;
    Ok(())
}

/// Poll for VERIFY_RESIZE (confirm it) or ACTIVE within the deadline. An
/// ACTIVE instance that still reports the old flavor is a failed resize even
/// though the control-plane calls all "succeeded".
pub async fn wait_resize_confirm(
    ctx: &Ctx,
    instance_id: Uuid,
    target_flavor: &str,
    target_state: VmState,
    deadline: DateTime<Utc>,
) -> Result<()> {
    let Some(vm_status) = models::vm_status_by_instance(&ctx.db, instance_id).await? else {
        return Ok(());
    };

    let detail = match ctx.provider.get_server(instance_id).await {
        Ok(detail) => detail,
        Err(ProviderError::NotFound(_)) => {
            models::instance_error(&ctx.db, instance_id, "Control-plane server missing").await?;
            state_machine::status_error(&ctx.db, vm_status.id, "Control-plane server missing")
                .await?;
            end_resize(ctx, instance_id, WfOutcome::Fail).await?;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    match detail.status.as_str() {
        server_status::VERIFY_RESIZE => {
            tracing::info!("confirming resize of {}", instance_id);
            ctx.provider.confirm_resize(instance_id).await?;
            let _ = state_machine::set_progress(
                &ctx.db,
                vm_status.id,
                66,
                "Resize completed; waiting for reboot",
            )
            .await;
            // The final step is done in response to a boot callback.
        }
        server_status::RESIZE => {
            if Utc::now() < deadline {
                tracing::info!("waiting for resize of {}", instance_id);
                scheduler::enqueue_in(
                    &ctx.db,
                    &WorkflowStep::WaitResizeConfirm {
                        instance_id,
                        target_flavor: target_flavor.to_string(),
                        target_state,
                        deadline,
                    },
                    ctx.settings.poll_step_delay,
                )
                .await?;
            } else {
                // The read-path watchdog turns the stale wait into VM_ERROR.
                tracing::error!("resize of {} has taken too long", instance_id);
            }
        }
        server_status::ACTIVE => {
            if detail.flavor != target_flavor {
                let msg = format!(
                    "Resize of {} failed: flavor is {}, expected {}",
                    instance_id, detail.flavor, target_flavor
                );
                tracing::error!("{}", msg);
                state_machine::status_error(&ctx.db, vm_status.id, &msg).await?;
                end_resize(ctx, instance_id, WfOutcome::Fail).await?;
            } else {
                tracing::info!("resize of {} was confirmed automatically", instance_id);
                let _ = state_machine::set_progress(
                    &ctx.db,
                    vm_status.id,
                    66,
                    "Resize completed; waiting for reboot",
                )
                .await;
                // The final step is done in response to a boot callback.
            }
        }
        other => {
            let msg = format!("Resize of {instance_id} failed, instance in state {other}");
            tracing::error!("{}", msg);
            state_machine::status_error(&ctx.db, vm_status.id, &msg).await?;
            end_resize(ctx, instance_id, WfOutcome::Fail).await?;
        }
    }
    Ok(())
}

/// Expiry-triggered downsize back to the volume's recorded default flavor.
pub async fn downsize_expired(ctx: &Ctx, resize: &Resize) -> Result<WfOutcome> {
    let Some(vm_status) = models::vm_status_by_instance(&ctx.db, resize.instance_id).await? else {
        tracing::error!("no vm_status for boosted instance {}", resize.instance_id);
        return Ok(WfOutcome::Retry);
    };
    if vm_status.status != VmState::Supersized {
        tracing::info!(
            "skipping downsize of instance {} in state {}",
            resize.instance_id,
            vm_status.status
        );
        return Ok(WfOutcome::Retry);
    }
    let Some(instance) = models::get_instance(&ctx.db, resize.instance_id).await? else {
        return Ok(WfOutcome::Fail);
    };
    let Some(volume) = models::get_volume(&ctx.db, instance.boot_volume_id).await? else {
        return Ok(WfOutcome::Fail);
    };

    // Mirror a user downsize's progress view with a longer deadline, in case
    // the user refreshes while the forced downsize runs.
    let wait_time = Utc::now()
        + chrono::Duration::from_std(ctx.settings.forced_downsize_wait).unwrap_or_else(|_| chrono::Duration::zero());
    sqlx::query(
        "UPDATE vm_statuses
         SET status = 'resizing', wait_time = $2, status_progress = 0,
             status_message = 'Forced downsize starting'
         WHERE id = $1",
    )
    .bind(vm_status.id)
    .bind(wait_time)
    .execute(&ctx.db)
    .await?;

    scheduler::enqueue(
        &ctx.db,
        &WorkflowStep::StartResize {
            instance_id: resize.instance_id,
            target_flavor: volume.flavor.clone(),
            target_state: VmState::Okay,
            boost: false,
        },
    )
    .await?;
    Ok(WfOutcome::Continue)
}
