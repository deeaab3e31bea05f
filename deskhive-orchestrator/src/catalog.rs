use anyhow::{anyhow, Result};
use sqlx::{Pool, Postgres};

use deskhive_common::{AvailabilityZone, DesktopType};

/// Read-only desktop catalog lookups. The catalog itself is owned by
/// operators (seeded by migrations, edited out of band); the orchestrator
/// never writes it.

pub async fn get_desktop_type(db: &Pool<Postgres>, id: &str) -> Result<DesktopType> {
    sqlx::query_as::<_, DesktopType>(
        "SELECT * FROM desktop_types WHERE id = $1 AND is_active = TRUE",
    )
    .bind(id)
    .fetch_optional(db)
    .await?
    .ok_or_else(|| anyhow!("unknown desktop type '{id}'"))
}

pub async fn list_desktop_types(db: &Pool<Postgres>) -> Result<Vec<DesktopType>> {
    Ok(sqlx::query_as("SELECT * FROM desktop_types ORDER BY id")
        .fetch_all(db)
        .await?)
}

pub async fn get_zone(db: &Pool<Postgres>, name: &str) -> Result<AvailabilityZone> {
    sqlx::query_as::<_, AvailabilityZone>(
        "SELECT * FROM availability_zones WHERE name = $1 AND is_active = TRUE",
    )
    .bind(name)
    .fetch_optional(db)
    .await?
    .ok_or_else(|| anyhow!("unknown availability zone '{name}'"))
}
