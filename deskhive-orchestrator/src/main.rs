use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use deskhive_providers::mock::MockProvider;
use deskhive_providers::openstack::{OpenStackConfig, OpenStackProvider};
use deskhive_providers::CloudProvider;

mod callbacks;
mod catalog;
mod config;
mod context;
mod create_flow;
mod delete_flow;
mod expirer;
mod expiry;
mod expiry_job;
mod gateway;
mod logger;
mod migrations;
mod models;
mod notifier;
mod reboot_flow;
mod reconciliation;
mod resize_flow;
mod scheduler;
mod services;
mod shelve_flow;
mod state_machine;
mod workflow;

use config::Settings;
use context::Ctx;
use notifier::Notifier;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt::init();

    let settings = Settings::from_env().expect("invalid configuration");
    let redis_client = redis::Client::open(settings.redis_url.clone()).expect("invalid REDIS_URL");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&settings.database_url)
        .await
        .expect("Failed to connect to Postgres");
    sqlx::query("SELECT 1")
        .execute(&pool)
        .await
        .expect("Postgres connection check failed");
    tracing::info!("connected to database");

    migrations::run_inline_migrations(&pool).await;

    let provider = build_provider(&pool).await;

    let ctx = Ctx {
        db: pool,
        provider,
        notifier: Notifier::new(redis_client, settings.expiry_dry_run),
        settings: Arc::new(settings),
    };

    // job-dispatcher (workflow steps)
    let ctx_dispatcher = ctx.clone();
    tokio::spawn(async move {
        scheduler::run(ctx_dispatcher).await;
    });

    // job-expiry (staged retirement)
    let ctx_expiry = ctx.clone();
    tokio::spawn(async move {
        expiry_job::run(ctx_expiry).await;
    });

    let app = Router::new()
        .route("/", get(root))
        .route("/admin/status", get(callbacks::admin_status))
        .route("/callback/notify", get(callbacks::notify_vm))
        .route("/callback/phone-home", post(callbacks::phone_home))
        .route("/internal/desktop-state", get(callbacks::desktop_state))
        .route("/internal/launch", post(launch))
        .route("/internal/delete", post(delete))
        .route("/internal/shelve", post(shelve))
        .route("/internal/unshelve", post(unshelve))
        .route("/internal/delete-shelved", post(delete_shelved))
        .route("/internal/reboot", post(reboot))
        .route("/internal/supersize", post(supersize))
        .route("/internal/downsize", post(downsize))
        .route("/internal/extend", post(extend))
        .route("/internal/extend-boost", post(extend_boost))
        .with_state(ctx.clone());

    let bind_addr = ctx.settings.bind_addr.clone();
    tracing::info!("deskhive orchestrator listening on {}", bind_addr);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("failed to bind");
    axum::serve(listener, app).await.expect("server failed");
}

/// One provider handle for the process; passed into every workflow and
/// service call. PROVIDER=mock gives an in-memory control plane seeded with
/// the catalog's source images, which is enough for local bring-up.
async fn build_provider(pool: &sqlx::Pool<sqlx::Postgres>) -> Arc<dyn CloudProvider> {
    let which = std::env::var("PROVIDER").unwrap_or_else(|_| "openstack".to_string());
    match which.as_str() {
        "mock" => {
            let mock = MockProvider::new();
            if let Ok(desktop_types) = catalog::list_desktop_types(pool).await {
                for dt in desktop_types {
                    let id = mock.seed_source_volume(&dt.image_name, &dt.default_zone);
                    tracing::info!("mock: seeded source volume {} for {}", id, dt.id);
                }
            }
            Arc::new(mock)
        }
        _ => {
            let env = |key: &str| std::env::var(key).unwrap_or_default();
            let config = OpenStackConfig {
                auth_url: env("OS_AUTH_URL"),
                application_credential_id: env("OS_APPLICATION_CREDENTIAL_ID"),
                application_credential_secret: env("OS_APPLICATION_CREDENTIAL_SECRET"),
                compute_url: env("OS_COMPUTE_URL"),
                volume_url: env("OS_VOLUME_URL"),
            };
            let provider = OpenStackProvider::connect(config)
                .await
                .expect("control-plane authentication failed");
            Arc::new(provider)
        }
    }
}

async fn root() -> &'static str {
    "Deskhive Orchestrator Online (Postgres Backed)"
}

// Thin request wrappers over the guarded operations in services.rs. The web
// layer proper (HTML, auth, sessions) lives elsewhere; these internal routes
// only translate HTTP to service calls.

#[derive(Deserialize, Debug)]
struct LaunchRequest {
    username: String,
    desktop_type: String,
    zone: Option<String>,
}

#[derive(Deserialize, Debug)]
struct InstanceRequest {
    username: String,
    requesting_feature: String,
    instance_id: Uuid,
}

#[derive(Deserialize, Debug)]
struct DesktopTypeRequest {
    username: String,
    desktop_type: String,
}

#[derive(Deserialize, Debug)]
struct RebootRequest {
    username: String,
    requesting_feature: String,
    instance_id: Uuid,
    hard: bool,
}

fn respond(result: anyhow::Result<String>) -> axum::response::Response {
    match result {
        Ok(message) => (StatusCode::OK, Json(json!({"status": message}))).into_response(),
        // Guard rejections and bad identifiers both land here; the message
        // says which.
        Err(e) => (
            StatusCode::CONFLICT,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

async fn launch(State(ctx): State<Ctx>, Json(req): Json<LaunchRequest>) -> impl IntoResponse {
    respond(services::launch(&ctx, &req.username, &req.desktop_type, req.zone.as_deref()).await)
}

async fn delete(State(ctx): State<Ctx>, Json(req): Json<InstanceRequest>) -> impl IntoResponse {
    respond(
        services::delete_desktop(&ctx, &req.username, &req.requesting_feature, req.instance_id)
            .await,
    )
}

async fn shelve(State(ctx): State<Ctx>, Json(req): Json<InstanceRequest>) -> impl IntoResponse {
    respond(
        services::shelve_desktop(&ctx, &req.username, &req.requesting_feature, req.instance_id)
            .await,
    )
}

async fn unshelve(
    State(ctx): State<Ctx>,
    Json(req): Json<DesktopTypeRequest>,
) -> impl IntoResponse {
    respond(services::unshelve_desktop(&ctx, &req.username, &req.desktop_type).await)
}

async fn delete_shelved(
    State(ctx): State<Ctx>,
    Json(req): Json<DesktopTypeRequest>,
) -> impl IntoResponse {
    respond(services::delete_shelved_desktop(&ctx, &req.username, &req.desktop_type).await)
}

async fn reboot(State(ctx): State<Ctx>, Json(req): Json<RebootRequest>) -> impl IntoResponse {
    respond(
        services::reboot_desktop(
            &ctx,
            &req.username,
            &req.requesting_feature,
            req.instance_id,
            req.hard,
        )
        .await,
    )
}

async fn supersize(State(ctx): State<Ctx>, Json(req): Json<InstanceRequest>) -> impl IntoResponse {
    respond(
        services::supersize_desktop(&ctx, &req.username, &req.requesting_feature, req.instance_id)
            .await,
    )
}

async fn downsize(State(ctx): State<Ctx>, Json(req): Json<InstanceRequest>) -> impl IntoResponse {
    respond(
        services::downsize_desktop(&ctx, &req.username, &req.requesting_feature, req.instance_id)
            .await,
    )
}

async fn extend(State(ctx): State<Ctx>, Json(req): Json<InstanceRequest>) -> impl IntoResponse {
    respond(
        services::extend_desktop(&ctx, &req.username, &req.requesting_feature, req.instance_id)
            .await,
    )
}

async fn extend_boost(
    State(ctx): State<Ctx>,
    Json(req): Json<InstanceRequest>,
) -> impl IntoResponse {
    respond(
        services::extend_boost_desktop(&ctx, &req.username, &req.requesting_feature, req.instance_id)
            .await,
    )
}
