use axum::extract::{Form, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use deskhive_common::{Instance, VmState, WfOutcome};

use crate::context::Ctx;
use crate::{models, reconciliation, resize_flow, state_machine};

pub const SCRIPT_OKAY: i32 = 1;
pub const CLOUD_INIT_STARTED: &str = "started";
pub const CLOUD_INIT_FINISHED: &str = "finished";

#[derive(Deserialize, Debug)]
pub struct NotifyParams {
    ip: String,
    hn: String,
    os: String,
    state: i32,
    msg: String,
}

/// Boot-time progress report from the desktop image. The hostname token is
/// the only authentication: it must match the token derived from the target
/// volume's hostname id and OS tag.
pub async fn notify_vm(State(ctx): State<Ctx>, Query(params): Query<NotifyParams>) -> impl IntoResponse {
    let instance = match find_instance_by_ip(&ctx, &params.ip).await {
        Ok(Some(instance)) => instance,
        Ok(None) => {
            tracing::error!("no current instance found with IP address {}", params.ip);
            return (StatusCode::NOT_FOUND, "unknown instance".to_string()).into_response();
        }
        Err(e) => {
            tracing::error!("notify lookup failed for {}: {:?}", params.ip, e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "lookup failed".to_string())
                .into_response();
        }
    };

    let volume = match models::get_volume(&ctx.db, instance.boot_volume_id).await {
        Ok(Some(volume)) => volume,
        _ => return (StatusCode::NOT_FOUND, "unknown volume".to_string()).into_response(),
    };
    let expected = models::generate_hostname(
        volume.hostname_id.as_deref().unwrap_or_default(),
        &volume.operating_system,
    );
    if expected != params.hn {
        tracing::error!(
            "hostname token in request does not match volume {} ({} != {})",
            volume.id,
            params.hn,
            expected
        );
        return (StatusCode::NOT_FOUND, "unknown hostname".to_string()).into_response();
    }

    if params.state == SCRIPT_OKAY {
        match params.msg.as_str() {
            CLOUD_INIT_FINISHED => {
                let _ = sqlx::query("UPDATE volumes SET ready = TRUE WHERE id = $1")
                    .bind(volume.id)
                    .execute(&ctx.db)
                    .await;
                if let Ok(Some(vm_status)) =
                    models::vm_status_by_instance(&ctx.db, instance.id).await
                {
                    let _ = state_machine::to_ready(
                        &ctx.db,
                        vm_status.id,
                        VmState::Okay,
                        "boot callback finished",
                    )
                    .await;
                }
            }
            CLOUD_INIT_STARTED => {
                let _ = sqlx::query("UPDATE volumes SET checked_in = TRUE WHERE id = $1")
                    .bind(volume.id)
                    .execute(&ctx.db)
                    .await;
            }
            other => tracing::warn!("unknown notify message '{}' for {}", other, instance.id),
        }
    } else {
        tracing::error!("notify error '{}' for instance {}", params.msg, instance.id);
        if let Ok(Some(vm_status)) = models::vm_status_by_instance(&ctx.db, instance.id).await {
            let _ = state_machine::status_error(&ctx.db, vm_status.id, &params.msg).await;
        }
    }

    let result = format!("{}, {}, {}, {}", params.ip, params.os, params.state, params.msg);
    tracing::info!("{}", result);
    (StatusCode::OK, result).into_response()
}

async fn find_instance_by_ip(ctx: &Ctx, ip: &str) -> anyhow::Result<Option<Instance>> {
    // The callback can arrive before the create flow cached the IP; resolve
    // the stragglers from the control plane and look again.
    let desktop_types = crate::catalog::list_desktop_types(&ctx.db).await?;
    for dt in &desktop_types {
        if let Some(instance) = models::get_instance_by_ip(&ctx.db, ip, &dt.feature).await? {
            return Ok(Some(instance));
        }
    }
    for dt in &desktop_types {
        for instance in models::instances_without_ip(&ctx.db, &dt.feature).await? {
            if let Ok(detail) = ctx.provider.get_server(instance.id).await {
                if let Some(found) = detail.ip_address {
                    models::set_instance_ip(&ctx.db, instance.id, &found).await?;
                }
            }
        }
        if let Some(instance) = models::get_instance_by_ip(&ctx.db, ip, &dt.feature).await? {
            return Ok(Some(instance));
        }
    }
    Ok(None)
}

#[derive(Deserialize, Debug)]
pub struct PhoneHomeForm {
    instance_id: Uuid,
}

/// Final boot confirmation ("phone home"). Flips the desktop to its ready
/// state: supersized when a current boost exists, okay otherwise.
pub async fn phone_home(State(ctx): State<Ctx>, Form(form): Form<PhoneHomeForm>) -> impl IntoResponse {
    let instance = match models::get_instance(&ctx.db, form.instance_id).await {
        Ok(Some(instance)) if instance.marked_for_deletion.is_none() => instance,
        Ok(_) => {
            tracing::error!("phone home for unknown or torn-down instance {}", form.instance_id);
            return (StatusCode::NOT_FOUND, "unknown instance".to_string()).into_response();
        }
        Err(e) => {
            tracing::error!("phone home lookup failed: {:?}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "lookup failed".to_string())
                .into_response();
        }
    };

    let vm_status = match models::vm_status_by_instance(&ctx.db, instance.id).await {
        Ok(Some(vm_status)) => vm_status,
        _ => {
            return (StatusCode::NOT_FOUND, "no status for instance".to_string()).into_response()
        }
    };

    if !vm_status.status.in_flight() {
        // A late callback for a desktop the watchdog already errored is
        // fine as long as the server is actually up.
        let active_again = vm_status.status == VmState::Error
            && matches!(
                ctx.provider.get_server(instance.id).await,
                Ok(detail) if detail.status == deskhive_providers::server_status::ACTIVE
            );
        if active_again {
            tracing::info!("handling a late phone home for {}", instance.id);
        } else {
            let result = format!(
                "Unexpected phone home for {}; status is {}",
                instance.id, vm_status.status
            );
            tracing::error!("{}", result);
            return (StatusCode::OK, result).into_response();
        }
    }

    let _ = sqlx::query("UPDATE volumes SET ready = TRUE WHERE id = $1")
        .bind(instance.boot_volume_id)
        .execute(&ctx.db)
        .await;

    let resize = models::latest_resize(&ctx.db, instance.id).await.ok().flatten();
    let current_boost = resize.as_ref().map(|r| r.reverted.is_none()).unwrap_or(false);
    let status = if current_boost {
        VmState::Supersized
    } else {
        VmState::Okay
    };
    // An expiry-triggered downsize completes here, with the reboot.
    let _ = resize_flow::end_resize(&ctx, instance.id, WfOutcome::Success).await;

    let _ = state_machine::to_ready(&ctx.db, vm_status.id, status, "phone home").await;

    let result = format!("Phone home for {} - success", instance.id);
    tracing::info!("{}", result);
    (StatusCode::OK, result).into_response()
}

#[derive(Deserialize, Debug)]
pub struct DesktopStateParams {
    username: String,
    desktop_type: String,
}

/// Read path for the web layer: the displayable state, with the watchdog
/// side effects of the reconciliation pass.
pub async fn desktop_state(
    State(ctx): State<Ctx>,
    Query(params): Query<DesktopStateParams>,
) -> impl IntoResponse {
    match reconciliation::derive_state(&ctx, &params.username, &params.desktop_type).await {
        Ok(state) => (
            StatusCode::OK,
            Json(json!({
                "state": state.state,
                "label": state.state.to_string(),
                "detail": state.detail,
                "instance_id": state.instance_id,
            })),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

pub async fn admin_status(State(ctx): State<Ctx>) -> impl IntoResponse {
    let live_desktops: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM vm_statuses WHERE status NOT IN ('no_vm', 'shelved')",
    )
    .fetch_one(&ctx.db)
    .await
    .unwrap_or(0);
    let shelved: i64 =
        sqlx::query_scalar("SELECT count(*) FROM vm_statuses WHERE status = 'shelved'")
            .fetch_one(&ctx.db)
            .await
            .unwrap_or(0);
    let pending_tasks: i64 = sqlx::query_scalar("SELECT count(*) FROM tasks")
        .fetch_one(&ctx.db)
        .await
        .unwrap_or(0);

    Json(json!({
        "live_desktops": live_desktops,
        "shelved_desktops": shelved,
        "pending_tasks": pending_tasks,
    }))
    .into_response()
}
