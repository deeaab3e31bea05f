//! Read-path state derivation. Computing what to display also cross-checks
//! the control plane and persists corrections: a stale "waiting" past its
//! deadline becomes an error, an unexpected power state marks the instance
//! errored. The display path deliberately doubles as a watchdog.

use anyhow::{bail, Result};
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use deskhive_common::{ExpiryStage, Instance, VmState, WfOutcome};
use deskhive_providers::{server_status, ProviderError};

use crate::context::Ctx;
use crate::expiry::{self, ExpiryPolicy};
use crate::{gateway, models, resize_flow, state_machine};

#[derive(Debug)]
pub struct DesktopState {
    pub state: VmState,
    pub detail: serde_json::Value,
    pub instance_id: Option<Uuid>,
}

pub async fn derive_state(ctx: &Ctx, username: &str, desktop_type: &str) -> Result<DesktopState> {
    let dt = crate::catalog::get_desktop_type(&ctx.db, desktop_type).await?;
    let Some(vm_status) = models::latest_vm_status(&ctx.db, username, &dt.id, &dt.feature).await?
    else {
        return Ok(DesktopState {
            state: VmState::NoVm,
            detail: json!("No VM"),
            instance_id: None,
        });
    };

    if vm_status.status == VmState::NoVm {
        return Ok(DesktopState {
            state: VmState::NoVm,
            detail: json!("No VM"),
            instance_id: None,
        });
    }

    let instance = match vm_status.instance_id {
        Some(id) => models::get_instance(&ctx.db, id).await?,
        None => None,
    };

    if vm_status.status == VmState::Error {
        return Ok(match &instance {
            Some(instance) => DesktopState {
                state: VmState::Error,
                detail: json!("VM has Errored"),
                instance_id: Some(instance.id),
            },
            None => DesktopState {
                state: VmState::Missing,
                detail: json!("VM has Errored"),
                instance_id: None,
            },
        });
    }

    let now = Utc::now();
    if vm_status.status.in_flight() {
        if let Some(wait_time) = vm_status.wait_time {
            if wait_time > now {
                let seconds = (wait_time - now).num_seconds().max(0);
                return Ok(DesktopState {
                    state: vm_status.status,
                    detail: json!({
                        "wait_seconds": seconds,
                        "progress": vm_status.status_progress,
                        "message": vm_status.status_message,
                    }),
                    instance_id: vm_status.instance_id,
                });
            }
        }
        // Deadline passed without a further update: the workflow is stuck.
        return match &instance {
            Some(instance) => {
                // An expiry-triggered downsize that never finished counts as
                // retryable; the next driver pass will try again.
                if let Some(resize) = models::latest_resize(&ctx.db, instance.id).await? {
                    if let Some(expiration_id) = resize.expiration_id {
                        if let Some(expiration) =
                            models::get_expiration(&ctx.db, expiration_id).await?
                        {
                            if expiration.stage == ExpiryStage::Expiring {
                                resize_flow::end_resize(ctx, instance.id, WfOutcome::Retry)
                                    .await?;
                            }
                        }
                    }
                }
                let msg = format!(
                    "Instance {} not ready at {:?} timeout",
                    instance.id, vm_status.wait_time
                );
                state_machine::status_error(&ctx.db, vm_status.id, &msg).await?;
                Ok(DesktopState {
                    state: VmState::Error,
                    detail: json!("Instance Not Ready"),
                    instance_id: Some(instance.id),
                })
            }
            None => {
                tracing::error!(
                    "instance is missing at timeout for vm_status {} ({}, {})",
                    vm_status.id,
                    username,
                    desktop_type
                );
                state_machine::force_status(
                    &ctx.db,
                    vm_status.id,
                    VmState::Error,
                    Some("Instance missing at timeout"),
                    "wait deadline exceeded",
                )
                .await?;
                Ok(DesktopState {
                    state: VmState::Missing,
                    detail: json!("VM has Errored"),
                    instance_id: None,
                })
            }
        };
    }

    let Some(instance) = instance else {
        // Probably someone cleared an errored status by hand; all that is
        // left to do is fold it back to "nothing to show".
        tracing::error!(
            "instance unexpectedly missing for vm_status {} ({}, {}); setting {}",
            vm_status.id,
            username,
            desktop_type,
            VmState::NoVm
        );
        state_machine::force_status(
            &ctx.db,
            vm_status.id,
            VmState::NoVm,
            None,
            "instance record missing",
        )
        .await?;
        return Ok(DesktopState {
            state: VmState::NoVm,
            detail: json!("No VM"),
            instance_id: None,
        });
    };

    if vm_status.status == VmState::Shelved {
        let volume = models::get_volume(&ctx.db, instance.boot_volume_id).await?;
        let detail = match volume {
            Some(volume) => {
                let policy = expiry::volume_policy(&ctx.settings);
                expiry_detail(ctx, &policy, volume.created, volume.expiration_id, None).await?
            }
            None => json!({}),
        };
        return Ok(DesktopState {
            state: VmState::Shelved,
            detail,
            instance_id: Some(instance.id),
        });
    }

    // From here on the desktop is supposed to be running; ask the control
    // plane what it actually looks like.
    let server = match ctx.provider.get_server(instance.id).await {
        Ok(detail) => detail,
        Err(ProviderError::NotFound(_)) => {
            let msg = "Control-plane server missing";
            models::instance_error(&ctx.db, instance.id, msg).await?;
            state_machine::status_error(&ctx.db, vm_status.id, msg).await?;
            return Ok(DesktopState {
                state: VmState::Error,
                detail: json!("Error at control-plane level"),
                instance_id: Some(instance.id),
            });
        }
        Err(e) => return Err(e.into()),
    };

    if server.status == server_status::SHUTOFF {
        return Ok(DesktopState {
            state: VmState::Shutdown,
            detail: json!("VM Shutdown"),
            instance_id: Some(instance.id),
        });
    }

    if vm_status.status == VmState::Okay {
        let url = connection_url(ctx, &instance).await?;
        let policy = expiry::instance_policy(&ctx.settings);
        let detail =
            expiry_detail(ctx, &policy, instance.created, instance.expiration_id, url).await?;
        return Ok(DesktopState {
            state: VmState::Okay,
            detail,
            instance_id: Some(instance.id),
        });
    }

    if !matches!(
        server.status.as_str(),
        server_status::ACTIVE | server_status::VERIFY_RESIZE | server_status::RESIZE
    ) {
        let msg = format!("Error at control-plane level. Status: {}", server.status);
        models::instance_error(&ctx.db, instance.id, &msg).await?;
        state_machine::status_error(&ctx.db, vm_status.id, &msg).await?;
        return Ok(DesktopState {
            state: VmState::Error,
            detail: json!("Error at control-plane level"),
            instance_id: Some(instance.id),
        });
    }

    if vm_status.status == VmState::Supersized {
        let url = connection_url(ctx, &instance).await?;
        let resize = models::latest_resize(&ctx.db, instance.id).await?;
        let detail = match resize {
            Some(resize) => {
                let policy = expiry::boost_policy(&ctx.settings);
                expiry_detail(ctx, &policy, resize.requested, resize.expiration_id, url).await?
            }
            None => json!({ "url": url }),
        };
        return Ok(DesktopState {
            state: VmState::Supersized,
            detail,
            instance_id: Some(instance.id),
        });
    }

    tracing::error!(
        "unhandled state {} for {} requesting {}",
        vm_status.status,
        username,
        desktop_type
    );
    bail!("unhandled desktop state {}", vm_status.status)
}

/// Lazily resolve the instance IP, make sure the gateway connection has its
/// parameter records, and return the connection URL.
async fn connection_url(ctx: &Ctx, instance: &Instance) -> Result<Option<String>> {
    let Some(connection_id) = instance.gateway_connection_id else {
        return Ok(None);
    };

    let ip = match &instance.ip_address {
        Some(ip) => ip.clone(),
        None => {
            let Some(ip) = ctx.provider.get_server(instance.id).await?.ip_address else {
                return Ok(None);
            };
            models::set_instance_ip(&ctx.db, instance.id, &ip).await?;
            ip
        }
    };

    gateway::ensure_parameters(
        &ctx.db,
        connection_id,
        &ip,
        &instance.login_username,
        &instance.login_password,
        &instance.username,
    )
    .await?;

    let volume = models::get_volume(&ctx.db, instance.boot_volume_id).await?;
    let zone = volume.map(|v| v.zone).unwrap_or_default();
    Ok(Some(gateway::connection_url(
        &ctx.settings.site_url,
        &ctx.settings.environment_name,
        &zone,
        connection_id,
    )))
}

/// Expiry/extension block shown alongside ready and shelved desktops.
async fn expiry_detail(
    ctx: &Ctx,
    policy: &ExpiryPolicy,
    created: chrono::DateTime<Utc>,
    expiration_id: Option<i64>,
    url: Option<String>,
) -> Result<serde_json::Value> {
    let expiration = match expiration_id {
        Some(id) => models::get_expiration(&ctx.db, id).await?,
        None => None,
    };
    let now = Utc::now();
    let expires = expiration.as_ref().map(|e| e.expires);
    let extension = policy.permitted_extension(created, expires, now);
    let extended = policy.new_expiry(created, expires, now);
    Ok(json!({
        "url": url,
        "expires": expires,
        "expiry_stage": expiration.as_ref().map(|e| e.stage),
        "expiry_warned": expiration.as_ref().map(|e| e.stage.is_warned()).unwrap_or(false),
        "extension_seconds": extension.num_seconds(),
        "extended_expires": extended,
    }))
}
