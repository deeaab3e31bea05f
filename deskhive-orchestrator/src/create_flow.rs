use anyhow::Result;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use deskhive_common::{DesktopType, VmState, Volume};
use deskhive_providers::{volume_status, ProviderError, ServerSpec, VolumeSpec};

use crate::context::Ctx;
use crate::expiry;
use crate::workflow::WorkflowStep;
use crate::{catalog, gateway, logger, models, scheduler, state_machine};

/// First step of launch/unshelve: make sure a boot volume exists. Reuses the
/// user's current volume when there is one (it must be shelved, unarchived
/// and still healthy on the control plane); otherwise clones a fresh volume
/// from the newest source image.
pub async fn create_volume_step(
    ctx: &Ctx,
    vm_status_id: i64,
    username: &str,
    desktop_type: &str,
    zone: &str,
    unshelve: bool,
) -> Result<()> {
    let dt = catalog::get_desktop_type(&ctx.db, desktop_type).await?;
    let existing = models::get_current_volume(&ctx.db, username, &dt.id, &dt.feature).await?;

    let volume_id = match existing {
        Some(volume) => match check_reusable_volume(ctx, vm_status_id, &volume, zone).await? {
            Some(id) => id,
            None => return Ok(()), // terminal; already logged and marked
        },
        None => {
            let _ = state_machine::set_progress(&ctx.db, vm_status_id, 25, "Creating volume").await;
            match provision_volume(ctx, vm_status_id, username, &dt, zone).await? {
                Some(id) => id,
                None => return Ok(()),
            }
        }
    };

    tracing::info!(
        "{} volume {} ready for {}; scheduling instance creation",
        desktop_type,
        volume_id,
        username
    );
    scheduler::enqueue_in(
        &ctx.db,
        &WorkflowStep::WaitVolumeAvailable {
            vm_status_id,
            volume_id,
            desktop_type: dt.id.clone(),
            started: Utc::now(),
            unshelve,
        },
        ctx.settings.poll_step_delay,
    )
    .await?;
    Ok(())
}

/// A current volume already exists; it is only usable when shelved,
/// unarchived, and still available in the expected zone on the control
/// plane. Anything else needs manual cleanup and stops the workflow.
async fn check_reusable_volume(
    ctx: &Ctx,
    vm_status_id: i64,
    volume: &Volume,
    zone: &str,
) -> Result<Option<Uuid>> {
    match ctx.provider.get_volume(volume.id).await {
        Ok(detail) => {
            if detail.status != volume_status::AVAILABLE {
                tracing::error!(
                    "control-plane volume for {} in wrong state {}; needs manual cleanup",
                    volume.id,
                    detail.status
                );
                models::volume_error(
                    &ctx.db,
                    volume.id,
                    &format!("Control-plane volume in state {}", detail.status),
                )
                .await?;
                return Ok(None);
            }
            if detail.zone != zone {
                tracing::error!(
                    "control-plane volume for {} in wrong zone {}; needs manual cleanup",
                    volume.id,
                    detail.zone
                );
                models::volume_error(&ctx.db, volume.id, "Control-plane volume in wrong zone")
                    .await?;
                return Ok(None);
            }
        }
        Err(e) if e.is_not_found() => {
            tracing::error!("control-plane volume missing for {}; needs manual cleanup", volume.id);
            models::volume_error(&ctx.db, volume.id, "Control-plane volume missing").await?;
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    }

    if volume.archived_at.is_some() {
        tracing::error!("cannot launch shelved volume marked as archived: {}", volume.id);
        state_machine::status_error(
            &ctx.db,
            vm_status_id,
            "Shelved volume has already been archived",
        )
        .await?;
        return Ok(None);
    }
    if volume.shelved_at.is_none() {
        // A live, unshelved current volume means a bookkeeping mess; do not
        // guess, leave it for an operator.
        tracing::error!(
            "existing current volume {} is not shelved; needs manual cleanup",
            volume.id
        );
        state_machine::status_error(&ctx.db, vm_status_id, "Existing volume is not shelved")
            .await?;
        return Ok(None);
    }

    // Reviving the volume cancels its archive schedule.
    models::set_volume_expires(&ctx.db, volume.id, None).await?;
    Ok(Some(volume.id))
}

async fn provision_volume(
    ctx: &Ctx,
    vm_status_id: i64,
    username: &str,
    dt: &DesktopType,
    zone: &str,
) -> Result<Option<Uuid>> {
    let source = match ctx.provider.find_source_volume(&dt.image_name, zone).await? {
        Some(source) => source,
        None => {
            let msg = format!(
                "No source volume with image names starting with {} in availability zone {}",
                dt.image_name, zone
            );
            tracing::error!("{}", msg);
            state_machine::status_error(&ctx.db, vm_status_id, &msg).await?;
            return Ok(None);
        }
    };

    let name = models::generate_server_name(username, &dt.id);
    let volume_id = ctx
        .provider
        .create_volume(&VolumeSpec {
            name,
            size_gb: dt.volume_size_gb,
            source_volume_id: source,
            zone: zone.to_string(),
            metadata: serde_json::json!({"readonly": "False"}),
        })
        .await?;
    ctx.provider.set_volume_bootable(volume_id, true).await?;

    let hostname_id = match models::allocate_hostname_id_db(&ctx.db).await {
        Ok(id) => id,
        Err(e) => {
            tracing::error!("could not assign hostname id to volume {}: {}", volume_id, e);
            // Best-effort cleanup of the half-created control-plane volume.
            if let Err(e) = ctx.provider.delete_volume(volume_id).await {
                tracing::error!("cleanup of volume {} failed too: {}", volume_id, e);
            }
            state_machine::status_error(&ctx.db, vm_status_id, "Could not assign hostname id")
                .await?;
            return Ok(None);
        }
    };

    sqlx::query(
        "INSERT INTO volumes
         (id, username, image, operating_system, flavor, zone, requesting_feature, hostname_id)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(volume_id)
    .bind(username)
    .bind(source.to_string())
    .bind(&dt.id)
    .bind(&dt.default_flavor)
    .bind(zone)
    .bind(&dt.feature)
    .bind(&hostname_id)
    .execute(&ctx.db)
    .await?;

    // Tag the control-plane object so operators can trace it back.
    let metadata = serde_json::json!({
        "hostname": models::generate_hostname(&hostname_id, &dt.id),
        "user": username,
        "desktop": dt.id,
        "environment": ctx.settings.environment_name,
        "requesting_feature": dt.feature,
    });
    if let Err(e) = ctx.provider.set_volume_metadata(volume_id, metadata).await {
        tracing::warn!("could not set metadata on volume {}: {}", volume_id, e);
    }

    logger::log_quick(&ctx.db, "VOLUME_CREATED", Some(volume_id), None).await;
    Ok(Some(volume_id))
}

/// Poll until the volume reports available, then create the instance and its
/// gateway connection. Timeout sends the status back to No_VM so the user
/// can retry, and flags the volume for cleanup.
pub async fn wait_volume_available(
    ctx: &Ctx,
    vm_status_id: i64,
    volume_id: Uuid,
    desktop_type: &str,
    started: DateTime<Utc>,
    unshelve: bool,
) -> Result<()> {
    let Some(volume) = models::get_volume(&ctx.db, volume_id).await? else {
        tracing::error!("volume record {} vanished mid-create", volume_id);
        return Ok(());
    };

    let detail = match ctx.provider.get_volume(volume_id).await {
        Ok(detail) => detail,
        Err(e) if e.is_not_found() => {
            models::volume_error(&ctx.db, volume_id, "Control-plane volume missing").await?;
            state_machine::status_error(&ctx.db, vm_status_id, "Control-plane volume missing")
                .await?;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let now = Utc::now();
    if detail.status == volume_status::AVAILABLE {
        tracing::info!(
            "volume {} available after {}s",
            volume_id,
            (now - started).num_seconds()
        );
        let message = if volume.shelved_at.is_some() {
            "Unshelving instance"
        } else {
            "Volume created, launching instance"
        };
        let _ = state_machine::set_progress(&ctx.db, vm_status_id, 50, message).await;

        let dt = catalog::get_desktop_type(&ctx.db, desktop_type).await?;
        let instance_id = create_instance(ctx, vm_status_id, &dt, &volume).await?;

        sqlx::query("UPDATE volumes SET shelved_at = NULL WHERE id = $1")
            .bind(volume_id)
            .execute(&ctx.db)
            .await?;
        models::set_volume_expires(&ctx.db, volume_id, None).await?;

        tracing::info!("{} instance {} creation initiated for {}", dt.id, instance_id, volume.username);
        scheduler::enqueue_in(
            &ctx.db,
            &WorkflowStep::WaitInstanceActive {
                vm_status_id,
                instance_id,
                desktop_type: dt.id.clone(),
                started: Utc::now(),
                unshelve,
            },
            ctx.settings.poll_step_delay,
        )
        .await?;
    } else if now - started
        > chrono::Duration::from_std(ctx.settings.volume_creation_timeout).unwrap_or_else(|_| chrono::Duration::zero())
    {
        let msg = "Volume took too long to create";
        tracing::error!(
            "{}: volume {} status {} started {}",
            msg,
            volume_id,
            detail.status,
            started
        );
        models::volume_error(&ctx.db, volume_id, msg).await?;
        state_machine::force_status(&ctx.db, vm_status_id, VmState::NoVm, Some(msg), "volume timeout")
            .await?;
    } else {
        scheduler::enqueue_in(
            &ctx.db,
            &WorkflowStep::WaitVolumeAvailable {
                vm_status_id,
                volume_id,
                desktop_type: desktop_type.to_string(),
                started,
                unshelve,
            },
            ctx.settings.poll_step_delay,
        )
        .await?;
    }
    Ok(())
}

async fn create_instance(
    ctx: &Ctx,
    vm_status_id: i64,
    dt: &DesktopType,
    volume: &Volume,
) -> Result<Uuid> {
    let hostname = models::generate_hostname(
        volume.hostname_id.as_deref().unwrap_or_default(),
        &dt.id,
    );
    let name = models::generate_server_name(&volume.username, &dt.id);

    // Reuse the previous login so an unshelved desktop keeps its credentials.
    let (login_username, login_password) =
        match models::latest_instance_for_volume(&ctx.db, volume.id).await? {
            Some(last) => (last.login_username, last.login_password),
            None => ("vdiuser".to_string(), models::generate_password()),
        };

    let user_data = build_user_data(ctx, &hostname, &login_username, &login_password);
    let zone = catalog::get_zone(&ctx.db, &volume.zone).await?;

    let server_id = ctx
        .provider
        .create_server(&ServerSpec {
            name,
            flavor: dt.default_flavor.clone(),
            boot_volume_id: volume.id,
            user_data,
            security_groups: dt.security_groups.0.clone(),
            network_id: zone.network_id.clone(),
            zone: volume.zone.clone(),
            metadata: serde_json::json!({
                "allow_user": volume.username,
                "environment": ctx.settings.environment_name,
                "requesting_feature": dt.feature,
            }),
        })
        .await?;

    let connection_name = format!("{}'s {} desktop", volume.username, dt.name);
    let gateway_connection_id =
        gateway::create_connection(&ctx.db, &connection_name, "rdp").await?;

    sqlx::query(
        "INSERT INTO instances
         (id, username, boot_volume_id, gateway_connection_id, login_username, login_password)
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(server_id)
    .bind(&volume.username)
    .bind(volume.id)
    .bind(gateway_connection_id)
    .bind(&login_username)
    .bind(&login_password)
    .execute(&ctx.db)
    .await?;

    models::attach_instance_to_vm_status(&ctx.db, vm_status_id, server_id).await?;
    logger::log_quick(&ctx.db, "INSTANCE_CREATED", Some(server_id), None).await;
    Ok(server_id)
}

fn build_user_data(ctx: &Ctx, hostname: &str, login_username: &str, login_password: &str) -> String {
    let site = ctx.settings.site_url.trim_end_matches('/');
    format!(
        "#cloud-config\n\
         hostname: {hostname}\n\
         users:\n\
         \x20 - name: {login_username}\n\
         \x20   lock_passwd: false\n\
         \x20   shell: /bin/bash\n\
         chpasswd:\n\
         \x20 expire: false\n\
         \x20 list: |\n\
         \x20   {login_username}:{login_password}\n\
         phone_home:\n\
         \x20 url: {site}/callback/phone-home\n\
         \x20 post: [instance_id]\n\
         \x20 tries: 10\n\
         runcmd:\n\
         \x20 - curl -s \"{site}/callback/notify?ip=$(hostname -I | cut -d' ' -f1)&hn={hostname}&os=$(lsb_release -is)&state=1&msg=started\"\n"
    )
}

/// Poll until the instance goes ACTIVE. For a launch the desktop is only
/// ready once the boot callback confirms cloud-init; for an unshelve the
/// disk has already completed first boot, so ACTIVE is ready.
pub async fn wait_instance_active(
    ctx: &Ctx,
    vm_status_id: i64,
    instance_id: Uuid,
    desktop_type: &str,
    started: DateTime<Utc>,
    unshelve: bool,
) -> Result<()> {
    let Some(instance) = models::get_instance(&ctx.db, instance_id).await? else {
        tracing::error!("instance record {} vanished mid-create", instance_id);
        return Ok(());
    };

    let now = Utc::now();
    let status = match ctx.provider.get_server(instance_id).await {
        Ok(detail) => detail.status,
        Err(ProviderError::NotFound(_)) => {
            models::instance_error(&ctx.db, instance_id, "Control-plane server missing").await?;
            state_machine::status_error(&ctx.db, vm_status_id, "Control-plane server missing")
                .await?;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    if status == deskhive_providers::server_status::ACTIVE {
        tracing::info!("instance {} is now ACTIVE", instance_id);
        // The clock for the desktop's lifetime starts at creation, not at
        // whenever this poll happened to run.
        let policy = expiry::instance_policy(&ctx.settings);
        models::set_instance_expires(
            &ctx.db,
            instance_id,
            Some(policy.initial_expiry(instance.created)),
        )
        .await?;

        if unshelve {
            sqlx::query("UPDATE volumes SET ready = TRUE WHERE id = $1")
                .bind(instance.boot_volume_id)
                .execute(&ctx.db)
                .await?;
            state_machine::to_ready(&ctx.db, vm_status_id, VmState::Okay, "unshelve complete")
                .await?;
        } else {
            let _ = state_machine::set_progress(
                &ctx.db,
                vm_status_id,
                75,
                "Instance launched; waiting for boot",
            )
            .await;
        }
    } else if now - started
        > chrono::Duration::from_std(ctx.settings.instance_launch_timeout).unwrap_or_else(|_| chrono::Duration::zero())
    {
        let msg = "Instance took too long to launch";
        tracing::error!("{}: instance {} status {} started {}", msg, instance_id, status, started);
        models::instance_error(&ctx.db, instance_id, msg).await?;
        state_machine::force_status(&ctx.db, vm_status_id, VmState::NoVm, Some(msg), "launch timeout")
            .await?;
    } else {
        scheduler::enqueue_in(
            &ctx.db,
            &WorkflowStep::WaitInstanceActive {
                vm_status_id,
                instance_id,
                desktop_type: desktop_type.to_string(),
                started,
                unshelve,
            },
            ctx.settings.poll_step_delay,
        )
        .await?;
    }
    Ok(())
}
