use anyhow::{bail, Result};
use chrono::Utc;
use uuid::Uuid;

use deskhive_common::{VmState, VmStatus};

use crate::context::Ctx;
use crate::expiry;
use crate::workflow::{AfterTeardown, WorkflowStep};
use crate::{catalog, logger, models, scheduler, state_machine};

/// Public lifecycle operations. Each one checks the latest VMStatus against
/// a fixed permitted-source-state set, rejects with a descriptive error when
/// the desktop is in the wrong state (scheduling nothing), and otherwise
/// persists the intermediate status and enqueues the first workflow step.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Delete,
    Shelve,
    Unshelve,
    DeleteShelved,
    Reboot,
    Supersize,
    Downsize,
    Extend,
    ExtendBoost,
}

/// The fixed guard table. Launch is absent on purpose: its guard is the
/// storage-level uniqueness constraint, not a source-state list.
pub fn permitted_sources(op: Operation) -> &'static [VmState] {
    match op {
        // Anything except the resting states can be torn down; shelved
        // desktops go through delete_shelved instead.
        Operation::Delete => &[
            VmState::Creating,
            VmState::Waiting,
            VmState::Resizing,
            VmState::Okay,
            VmState::Supersized,
            VmState::Error,
            VmState::Missing,
            VmState::Shutdown,
        ],
        Operation::Shelve | Operation::Reboot => &[VmState::Okay, VmState::Supersized],
        Operation::Unshelve | Operation::DeleteShelved => &[VmState::Shelved],
        Operation::Supersize | Operation::Extend => &[VmState::Okay],
        Operation::Downsize | Operation::ExtendBoost => &[VmState::Supersized],
    }
}

fn wrong_state_message(action: &str, username: &str, vm_status: Option<&VmStatus>) -> String {
    let status_str = match vm_status {
        Some(vm_status) => format!("in wrong state ({})", vm_status.status),
        None => "missing".to_string(),
    };
    format!("VMStatus for user {username} is {status_str}. Cannot {action} VM.")
}

fn guard<'a>(
    action: &str,
    op: Operation,
    username: &str,
    vm_status: Option<&'a VmStatus>,
) -> Result<&'a VmStatus> {
    match vm_status {
        Some(vm_status) if permitted_sources(op).contains(&vm_status.status) => Ok(vm_status),
        _ => {
            let message = wrong_state_message(action, username, vm_status);
            tracing::error!("{}", message);
            bail!(message)
        }
    }
}

/// One desktop per user, across all desktop types. The UI should never offer
/// a second one; this guards against accidents.
async fn desktop_limit_check(ctx: &Ctx, username: &str) -> Result<()> {
    let live = models::live_instance_count(&ctx.db, username).await?;
    if live > 0 {
        let message = format!("User {username} already has {live} live desktop(s)");
        tracing::error!("{}", message);
        bail!(message);
    }
    Ok(())
}

pub async fn launch(
    ctx: &Ctx,
    username: &str,
    desktop_type: &str,
    zone: Option<&str>,
) -> Result<String> {
    let dt = catalog::get_desktop_type(&ctx.db, desktop_type).await?;
    let zone = zone.unwrap_or(&dt.default_zone).to_string();
    tracing::info!("launching {} desktop for {} in {}", dt.id, username, zone);

    desktop_limit_check(ctx, username).await?;

    let wait_time = Utc::now()
        + chrono::Duration::from_std(ctx.settings.launch_wait).unwrap_or_else(|_| chrono::Duration::zero());
    let vm_status_id = match models::insert_vm_status(
        &ctx.db,
        username,
        &dt.id,
        &dt.feature,
        VmState::Creating,
        wait_time,
        "Starting desktop creation",
        "has been created",
    )
    .await?
    {
        models::VmStatusInsert::Created(id) => id,
        models::VmStatusInsert::Duplicate => {
            let message = format!("A {desktop_type} desktop for {username} already exists");
            tracing::error!("{}", message);
            bail!(message);
        }
    };

    scheduler::enqueue(
        &ctx.db,
        &WorkflowStep::CreateVolume {
            vm_status_id,
            username: username.to_string(),
            desktop_type: dt.id.clone(),
            zone,
            unshelve: false,
        },
    )
    .await?;
    logger::log_quick(&ctx.db, "LAUNCH_REQUESTED", None, Some(username)).await;
    Ok(format!("Desktop creation started for {username}"))
}

pub async fn delete_desktop(
    ctx: &Ctx,
    username: &str,
    requesting_feature: &str,
    instance_id: Uuid,
) -> Result<String> {
    let instance =
        models::get_instance_checked(&ctx.db, instance_id, username, requesting_feature).await?;
    let vm_status = models::vm_status_by_instance(&ctx.db, instance_id).await?;
    let vm_status = guard("delete", Operation::Delete, username, vm_status.as_ref())?;

    tracing::info!(
        "deleting desktop {}: status {} -> {}, marking instance and volume",
        instance_id,
        vm_status.status,
        VmState::NoVm
    );
    // Deletion happens out of the user's sight; the status drops straight
    // back to "nothing to show".
    state_machine::force_status(&ctx.db, vm_status.id, VmState::NoVm, None, "delete requested")
        .await?;
    models::mark_instance_for_deletion(&ctx.db, instance_id).await?;
    models::mark_volume_for_deletion(&ctx.db, instance.boot_volume_id).await?;

    scheduler::enqueue(
        &ctx.db,
        &WorkflowStep::StopAndRelease {
            instance_id,
            after: AfterTeardown::DeleteVolume,
        },
    )
    .await?;
    Ok(format!("Desktop deletion started for {username}"))
}

pub async fn shelve_desktop(
    ctx: &Ctx,
    username: &str,
    requesting_feature: &str,
    instance_id: Uuid,
) -> Result<String> {
    models::get_instance_checked(&ctx.db, instance_id, username, requesting_feature).await?;
    let vm_status = models::vm_status_by_instance(&ctx.db, instance_id).await?;
    let vm_status = guard("shelve", Operation::Shelve, username, vm_status.as_ref())?;

    let wait_time = Utc::now()
        + chrono::Duration::from_std(ctx.settings.shelve_wait).unwrap_or_else(|_| chrono::Duration::zero());
    let begun = state_machine::begin_operation(
        &ctx.db,
        vm_status.id,
        permitted_sources(Operation::Shelve),
        VmState::Waiting,
        wait_time,
        "Starting desktop shelve",
        "has been shelved",
        "shelve requested",
    )
    .await?;
    if !begun {
        // Lost a race with another trigger; re-read and report.
        let now = models::vm_status_by_id(&ctx.db, vm_status.id).await?;
        bail!(wrong_state_message("shelve", username, now.as_ref()));
    }
    models::mark_instance_for_deletion(&ctx.db, instance_id).await?;

    scheduler::enqueue(
        &ctx.db,
        &WorkflowStep::StopAndRelease {
            instance_id,
            after: AfterTeardown::ShelveVolume,
        },
    )
    .await?;
    Ok(format!("Desktop shelve started for {username}"))
}

pub async fn unshelve_desktop(ctx: &Ctx, username: &str, desktop_type: &str) -> Result<String> {
    let dt = catalog::get_desktop_type(&ctx.db, desktop_type).await?;
    desktop_limit_check(ctx, username).await?;

    let latest = models::latest_vm_status(&ctx.db, username, &dt.id, &dt.feature).await?;
    guard("unshelve", Operation::Unshelve, username, latest.as_ref())?;

    let volume = models::get_current_volume(&ctx.db, username, &dt.id, &dt.feature)
        .await?
        .ok_or_else(|| {
            tracing::error!("no shelved volume for {} {}", username, desktop_type);
            anyhow::anyhow!("No shelved volume found for {username}")
        })?;

    let wait_time = Utc::now()
        + chrono::Duration::from_std(ctx.settings.launch_wait).unwrap_or_else(|_| chrono::Duration::zero());
    let vm_status_id = match models::insert_vm_status(
        &ctx.db,
        username,
        &dt.id,
        &dt.feature,
        VmState::Creating,
        wait_time,
        "Starting desktop unshelve",
        "has been unshelved",
    )
    .await?
    {
        models::VmStatusInsert::Created(id) => id,
        models::VmStatusInsert::Duplicate => {
            bail!("A {desktop_type} desktop for {username} already exists")
        }
    };

    scheduler::enqueue(
        &ctx.db,
        &WorkflowStep::CreateVolume {
            vm_status_id,
            username: username.to_string(),
            desktop_type: dt.id.clone(),
            zone: volume.zone.clone(),
            unshelve: true,
        },
    )
    .await?;
    Ok(format!("Desktop unshelve started for {username}"))
}

pub async fn delete_shelved_desktop(
    ctx: &Ctx,
    username: &str,
    desktop_type: &str,
) -> Result<String> {
    let dt = catalog::get_desktop_type(&ctx.db, desktop_type).await?;
    let latest = models::latest_vm_status(&ctx.db, username, &dt.id, &dt.feature).await?;
    let vm_status = guard(
        "delete shelved",
        Operation::DeleteShelved,
        username,
        latest.as_ref(),
    )?;

    if let Some(instance_id) = vm_status.instance_id {
        if let Some(instance) = models::get_instance(&ctx.db, instance_id).await? {
            if instance.deleted.is_none() {
                tracing::error!(
                    "instance {} still exists for shelved {} desktop",
                    instance_id,
                    desktop_type
                );
                bail!("Shelved desktop still has a live instance; cannot delete");
            }
        }
    }

    state_machine::force_status(
        &ctx.db,
        vm_status.id,
        VmState::NoVm,
        None,
        "shelved delete requested",
    )
    .await?;

    if let Some(volume) = models::get_current_volume(&ctx.db, username, &dt.id, &dt.feature).await?
    {
        tracing::info!("deleting shelved volume {}", volume.id);
        models::mark_volume_for_deletion(&ctx.db, volume.id).await?;
        scheduler::enqueue(&ctx.db, &WorkflowStep::DeleteVolume { volume_id: volume.id }).await?;
    }
    Ok(format!("Shelved desktop deleted for {username}"))
}

pub async fn reboot_desktop(
    ctx: &Ctx,
    username: &str,
    requesting_feature: &str,
    instance_id: Uuid,
    hard: bool,
) -> Result<String> {
    models::get_instance_checked(&ctx.db, instance_id, username, requesting_feature).await?;
    let vm_status = models::vm_status_by_instance(&ctx.db, instance_id).await?;
    let vm_status = guard("reboot", Operation::Reboot, username, vm_status.as_ref())?;

    let wait_time = Utc::now()
        + chrono::Duration::from_std(ctx.settings.reboot_wait).unwrap_or_else(|_| chrono::Duration::zero());
    let begun = state_machine::begin_operation(
        &ctx.db,
        vm_status.id,
        permitted_sources(Operation::Reboot),
        VmState::Waiting,
        wait_time,
        "Starting desktop reboot",
        "has been rebooted",
        "reboot requested",
    )
    .await?;
    if !begun {
        let now = models::vm_status_by_id(&ctx.db, vm_status.id).await?;
        bail!(wrong_state_message("reboot", username, now.as_ref()));
    }

    scheduler::enqueue(&ctx.db, &WorkflowStep::Reboot { instance_id, hard }).await?;
    Ok(format!("Desktop reboot started for {username}"))
}

pub async fn supersize_desktop(
    ctx: &Ctx,
    username: &str,
    requesting_feature: &str,
    instance_id: Uuid,
) -> Result<String> {
    let instance =
        models::get_instance_checked(&ctx.db, instance_id, username, requesting_feature).await?;
    let vm_status = models::vm_status_by_instance(&ctx.db, instance_id).await?;
    let vm_status = guard("supersize", Operation::Supersize, username, vm_status.as_ref())?;

    let volume = models::get_volume(&ctx.db, instance.boot_volume_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("boot volume record missing"))?;
    let dt = catalog::get_desktop_type(&ctx.db, &volume.operating_system).await?;

    let wait_time = Utc::now()
        + chrono::Duration::from_std(ctx.settings.resize_wait).unwrap_or_else(|_| chrono::Duration::zero());
    let begun = state_machine::begin_operation(
        &ctx.db,
        vm_status.id,
        permitted_sources(Operation::Supersize),
        VmState::Resizing,
        wait_time,
        "Starting desktop boost",
        "has been boosted",
        "supersize requested",
    )
    .await?;
    if !begun {
        let now = models::vm_status_by_id(&ctx.db, vm_status.id).await?;
        bail!(wrong_state_message("supersize", username, now.as_ref()));
    }

    scheduler::enqueue(
        &ctx.db,
        &WorkflowStep::StartResize {
            instance_id,
            target_flavor: dt.big_flavor.clone(),
            target_state: VmState::Supersized,
            boost: true,
        },
    )
    .await?;
    Ok(format!("Desktop boost started for {username}"))
}

pub async fn downsize_desktop(
    ctx: &Ctx,
    username: &str,
    requesting_feature: &str,
    instance_id: Uuid,
) -> Result<String> {
    let instance =
        models::get_instance_checked(&ctx.db, instance_id, username, requesting_feature).await?;
    let vm_status = models::vm_status_by_instance(&ctx.db, instance_id).await?;
    let vm_status = guard("downsize", Operation::Downsize, username, vm_status.as_ref())?;

    let volume = models::get_volume(&ctx.db, instance.boot_volume_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("boot volume record missing"))?;
    let dt = catalog::get_desktop_type(&ctx.db, &volume.operating_system).await?;

    let wait_time = Utc::now()
        + chrono::Duration::from_std(ctx.settings.resize_wait).unwrap_or_else(|_| chrono::Duration::zero());
    let begun = state_machine::begin_operation(
        &ctx.db,
        vm_status.id,
        permitted_sources(Operation::Downsize),
        VmState::Resizing,
        wait_time,
        "Starting desktop downsize",
        "has been downsized",
        "downsize requested",
    )
    .await?;
    if !begun {
        let now = models::vm_status_by_id(&ctx.db, vm_status.id).await?;
        bail!(wrong_state_message("downsize", username, now.as_ref()));
    }

    scheduler::enqueue(
        &ctx.db,
        &WorkflowStep::StartResize {
            instance_id,
            target_flavor: dt.default_flavor.clone(),
            target_state: VmState::Okay,
            boost: false,
        },
    )
    .await?;
    Ok(format!("Desktop downsize started for {username}"))
}

pub async fn extend_desktop(
    ctx: &Ctx,
    username: &str,
    requesting_feature: &str,
    instance_id: Uuid,
) -> Result<String> {
    let instance =
        models::get_instance_checked(&ctx.db, instance_id, username, requesting_feature).await?;
    let vm_status = models::vm_status_by_instance(&ctx.db, instance_id).await?;
    let vm_status = guard("extend", Operation::Extend, username, vm_status.as_ref())?;

    extend_instance_expiry(ctx, &instance.id, instance.created, instance.expiration_id).await?;
    sqlx::query("UPDATE vm_statuses SET status_done = 'has been extended' WHERE id = $1")
        .bind(vm_status.id)
        .execute(&ctx.db)
        .await?;
    Ok(format!("Desktop expiry extended for {username}"))
}

pub async fn extend_boost_desktop(
    ctx: &Ctx,
    username: &str,
    requesting_feature: &str,
    instance_id: Uuid,
) -> Result<String> {
    let instance =
        models::get_instance_checked(&ctx.db, instance_id, username, requesting_feature).await?;
    let vm_status = models::vm_status_by_instance(&ctx.db, instance_id).await?;
    let vm_status = guard("extend_boost", Operation::ExtendBoost, username, vm_status.as_ref())?;

    let resize = models::latest_resize(&ctx.db, instance_id).await?;
    let resize = match resize {
        Some(resize) if resize.reverted.is_none() => resize,
        _ => {
            let message = format!("No current resize job for instance {instance_id}");
            tracing::error!("{}", message);
            bail!(message);
        }
    };

    let now = Utc::now();
    let policy = expiry::boost_policy(&ctx.settings);
    let current = match resize.expiration_id {
        Some(id) => models::get_expiration(&ctx.db, id).await?.map(|e| e.expires),
        None => None,
    };
    if let Some(new_expires) = policy.new_expiry(resize.requested, current, now) {
        models::set_resize_expires(&ctx.db, resize.id, Some(new_expires)).await?;
    }

    // A boost extension also keeps the desktop itself alive.
    extend_instance_expiry(ctx, &instance.id, instance.created, instance.expiration_id).await?;
    sqlx::query("UPDATE vm_statuses SET status_done = 'has been extended' WHERE id = $1")
        .bind(vm_status.id)
        .execute(&ctx.db)
        .await?;
    Ok(format!("Boost expiry extended for {username}"))
}

async fn extend_instance_expiry(
    ctx: &Ctx,
    instance_id: &Uuid,
    created: chrono::DateTime<Utc>,
    expiration_id: Option<i64>,
) -> Result<()> {
    let now = Utc::now();
    let policy = expiry::instance_policy(&ctx.settings);
    let current = match expiration_id {
        Some(id) => models::get_expiration(&ctx.db, id).await?.map(|e| e.expires),
        None => None,
    };
    if let Some(new_expires) = policy.new_expiry(created, current, now) {
        models::set_instance_expires(&ctx.db, *instance_id, Some(new_expires)).await?;
    }
    tracing::info!("extended expiry of instance {}", instance_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_only_operations_reject_every_other_state() {
        let all = [
            VmState::NoVm,
            VmState::Creating,
            VmState::Waiting,
            VmState::Resizing,
            VmState::Okay,
            VmState::Supersized,
            VmState::Shelved,
            VmState::Error,
            VmState::Missing,
            VmState::Shutdown,
        ];
        for state in all {
            let shelve_ok = permitted_sources(Operation::Shelve).contains(&state);
            assert_eq!(shelve_ok, state.is_ready(), "shelve from {state}");
            let reboot_ok = permitted_sources(Operation::Reboot).contains(&state);
            assert_eq!(reboot_ok, state.is_ready(), "reboot from {state}");
        }
    }

    #[test]
    fn boost_operations_are_keyed_to_the_current_size() {
        assert_eq!(permitted_sources(Operation::Supersize), &[VmState::Okay]);
        assert_eq!(permitted_sources(Operation::Downsize), &[VmState::Supersized]);
        assert_eq!(permitted_sources(Operation::Extend), &[VmState::Okay]);
        assert_eq!(
            permitted_sources(Operation::ExtendBoost),
            &[VmState::Supersized]
        );
    }

    #[test]
    fn delete_is_allowed_from_everything_but_resting_states() {
        let sources = permitted_sources(Operation::Delete);
        assert!(!sources.contains(&VmState::NoVm));
        assert!(!sources.contains(&VmState::Shelved));
        for state in [
            VmState::Creating,
            VmState::Waiting,
            VmState::Resizing,
            VmState::Okay,
            VmState::Supersized,
            VmState::Error,
            VmState::Missing,
            VmState::Shutdown,
        ] {
            assert!(sources.contains(&state), "delete from {state}");
        }
    }

    #[test]
    fn unshelve_requires_a_shelved_desktop() {
        assert_eq!(permitted_sources(Operation::Unshelve), &[VmState::Shelved]);
        assert_eq!(
            permitted_sources(Operation::DeleteShelved),
            &[VmState::Shelved]
        );
    }

    #[test]
    fn wrong_state_messages_name_the_action_and_state() {
        let message = wrong_state_message("shelve", "alice", None);
        assert!(message.contains("missing"));
        assert!(message.contains("shelve"));
    }
}
