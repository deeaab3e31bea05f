use anyhow::Result;
use uuid::Uuid;

use deskhive_common::VmState;
use deskhive_providers::{server_status, ProviderError};

use crate::context::Ctx;
use crate::workflow::WorkflowStep;
use crate::{logger, models, scheduler, state_machine};

pub async fn reboot(ctx: &Ctx, instance_id: Uuid, hard: bool) -> Result<()> {
    let Some(instance) = models::get_instance(&ctx.db, instance_id).await? else {
        tracing::error!("reboot of unknown instance {}", instance_id);
        return Ok(());
    };
    let Some(vm_status) = models::vm_status_by_instance(&ctx.db, instance_id).await? else {
        return Ok(());
    };

    sqlx::query("UPDATE volumes SET rebooted_at = NOW() WHERE id = $1")
        .bind(instance.boot_volume_id)
        .execute(&ctx.db)
        .await?;

    let level = if hard { "hard" } else { "soft" };
    tracing::info!("about to {} reboot instance {}", level, instance_id);
    match ctx.provider.reboot_server(instance_id, hard).await {
        Ok(()) => {}
        Err(ProviderError::NotFound(_)) => {
            models::instance_error(&ctx.db, instance_id, "Control-plane server missing").await?;
            state_machine::force_status(
                &ctx.db,
                vm_status.id,
                VmState::Missing,
                Some("Control-plane server missing"),
                "server missing at reboot",
            )
            .await?;
            return Ok(());
        }
        Err(e) => {
            tracing::error!("reboot call failed for {}: {}", instance_id, e);
            state_machine::status_error(&ctx.db, vm_status.id, "Reboot request failed").await?;
            return Ok(());
        }
    }
    logger::log_quick(&ctx.db, "REBOOT_REQUESTED", Some(instance_id), Some(level)).await;

    let _ = state_machine::set_progress(
        &ctx.db,
        vm_status.id,
        33,
        "Reboot request sent; waiting for restart",
    )
    .await;

    scheduler::enqueue_in(
        &ctx.db,
        &WorkflowStep::WaitRebootActive {
            instance_id,
            retries: ctx.settings.reboot_confirm_retries,
        },
        ctx.settings.reboot_confirm_wait,
    )
    .await?;
    Ok(())
}

pub async fn wait_reboot_active(ctx: &Ctx, instance_id: Uuid, retries: i32) -> Result<()> {
    let Some(vm_status) = models::vm_status_by_instance(&ctx.db, instance_id).await? else {
        return Ok(());
    };

    let active = match ctx.provider.get_server(instance_id).await {
        Ok(detail) => detail.status == server_status::ACTIVE,
        Err(ProviderError::NotFound(_)) => {
            state_machine::status_error(&ctx.db, vm_status.id, "Control-plane server missing")
                .await?;
            return Ok(());
        }
        Err(e) => {
            tracing::warn!("reboot status check failed for {}: {}", instance_id, e);
            false
        }
    };

    if active {
        tracing::info!("instance {} is ACTIVE after reboot", instance_id);
        let _ = state_machine::set_progress(
            &ctx.db,
            vm_status.id,
            66,
            "Instance restarted; waiting for boot",
        )
        .await;
        // The final stage is done in response to a boot callback.
    } else if retries > 0 {
        scheduler::enqueue_in(
            &ctx.db,
            &WorkflowStep::WaitRebootActive {
                instance_id,
                retries: retries - 1,
            },
            ctx.settings.reboot_confirm_wait,
        )
        .await?;
    } else {
        let msg = format!("Instance {instance_id} has not gone ACTIVE after reboot");
        tracing::error!("{}", msg);
        state_machine::status_error(&ctx.db, vm_status.id, &msg).await?;
    }
    Ok(())
}
