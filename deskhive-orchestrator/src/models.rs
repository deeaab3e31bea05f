use std::future::Future;

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use sqlx::{Pool, Postgres};
use uuid::Uuid;

use deskhive_common::{Expiration, Instance, Resize, VmState, VmStatus, Volume, WfOutcome};

use crate::logger;

// --- Current-resource lookups -----------------------------------------------
//
// "Current" means: not deleted, not marked for deletion, not errored. A
// marked_for_deletion resource is invisible here even while its teardown is
// still in flight, which is what lets a replacement be created concurrently.

pub async fn get_current_volume(
    db: &Pool<Postgres>,
    username: &str,
    operating_system: &str,
    requesting_feature: &str,
) -> Result<Option<Volume>> {
    let volumes: Vec<Volume> = sqlx::query_as(
        "SELECT * FROM volumes
         WHERE username = $1 AND operating_system = $2 AND requesting_feature = $3
           AND deleted IS NULL AND marked_for_deletion IS NULL AND error_flag IS NULL",
    )
    .bind(username)
    .bind(operating_system)
    .bind(requesting_feature)
    .fetch_all(db)
    .await?;
    if volumes.len() > 1 {
        bail!(
            "multiple current volumes for user={username} os={operating_system}; \
             needs manual cleanup"
        );
    }
    Ok(volumes.into_iter().next())
}

/// Policy check input: one desktop per user, across all desktop types.
pub async fn live_instance_count(db: &Pool<Postgres>, username: &str) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM instances
         WHERE username = $1 AND deleted IS NULL
           AND marked_for_deletion IS NULL AND error_flag IS NULL",
    )
    .bind(username)
    .fetch_one(db)
    .await?;
    Ok(count)
}

pub async fn get_volume(db: &Pool<Postgres>, id: Uuid) -> Result<Option<Volume>> {
    Ok(sqlx::query_as("SELECT * FROM volumes WHERE id = $1")
        .bind(id)
        .fetch_optional(db)
        .await?)
}

pub async fn get_instance(db: &Pool<Postgres>, id: Uuid) -> Result<Option<Instance>> {
    Ok(sqlx::query_as("SELECT * FROM instances WHERE id = $1")
        .bind(id)
        .fetch_optional(db)
        .await?)
}

/// Resolve an instance from an id supplied by an untrusted caller: it must
/// exist, belong to the user and feature, and not be torn down already.
pub async fn get_instance_checked(
    db: &Pool<Postgres>,
    id: Uuid,
    username: &str,
    requesting_feature: &str,
) -> Result<Instance> {
    let instance = get_instance(db, id)
        .await?
        .ok_or_else(|| anyhow!("no instance {id}"))?;
    let volume = get_volume(db, instance.boot_volume_id)
        .await?
        .ok_or_else(|| anyhow!("no boot volume for instance {id}"))?;
    if instance.username != username {
        tracing::error!(
            "instance {} belongs to {}, requested by {}",
            id,
            instance.username,
            username
        );
        bail!("no instance {id}");
    }
    if volume.requesting_feature != requesting_feature {
        tracing::error!(
            "instance {} belongs to feature {}, requested for {}",
            id,
            volume.requesting_feature,
            requesting_feature
        );
        bail!("no instance {id}");
    }
    if instance.marked_for_deletion.is_some() || instance.deleted.is_some() {
        bail!("instance {id} is already being torn down");
    }
    Ok(instance)
}

/// Latest created instance for a volume, irrespective of deletion status.
pub async fn latest_instance_for_volume(
    db: &Pool<Postgres>,
    volume_id: Uuid,
) -> Result<Option<Instance>> {
    Ok(sqlx::query_as(
        "SELECT * FROM instances WHERE boot_volume_id = $1 ORDER BY created DESC LIMIT 1",
    )
    .bind(volume_id)
    .fetch_optional(db)
    .await?)
}

pub async fn get_instance_by_ip(
    db: &Pool<Postgres>,
    ip_address: &str,
    requesting_feature: &str,
) -> Result<Option<Instance>> {
    let instances: Vec<Instance> = sqlx::query_as(
        "SELECT i.* FROM instances i
         JOIN volumes v ON v.id = i.boot_volume_id
         WHERE i.ip_address = $1 AND v.requesting_feature = $2
           AND i.marked_for_deletion IS NULL AND i.error_flag IS NULL",
    )
    .bind(ip_address)
    .bind(requesting_feature)
    .fetch_all(db)
    .await?;
    if instances.len() > 1 {
        bail!("multiple current instances with ip {ip_address}");
    }
    Ok(instances.into_iter().next())
}

/// Current instances whose IP has not been resolved from the control plane
/// yet (the boot callback arrives before the create flow polls again).
pub async fn instances_without_ip(
    db: &Pool<Postgres>,
    requesting_feature: &str,
) -> Result<Vec<Instance>> {
    Ok(sqlx::query_as(
        "SELECT i.* FROM instances i
         JOIN volumes v ON v.id = i.boot_volume_id
         WHERE i.ip_address IS NULL AND v.requesting_feature = $1
           AND i.marked_for_deletion IS NULL AND i.error_flag IS NULL",
    )
    .bind(requesting_feature)
    .fetch_all(db)
    .await?)
}

pub async fn set_instance_ip(db: &Pool<Postgres>, id: Uuid, ip_address: &str) -> Result<()> {
    sqlx::query("UPDATE instances SET ip_address = $2 WHERE id = $1")
        .bind(id)
        .bind(ip_address)
        .execute(db)
        .await?;
    Ok(())
}

// --- VMStatus ---------------------------------------------------------------

pub async fn latest_vm_status(
    db: &Pool<Postgres>,
    username: &str,
    operating_system: &str,
    requesting_feature: &str,
) -> Result<Option<VmStatus>> {
    Ok(sqlx::query_as(
        "SELECT * FROM vm_statuses
         WHERE username = $1 AND operating_system = $2 AND requesting_feature = $3
         ORDER BY created DESC LIMIT 1",
    )
    .bind(username)
    .bind(operating_system)
    .bind(requesting_feature)
    .fetch_optional(db)
    .await?)
}

pub async fn vm_status_by_id(db: &Pool<Postgres>, id: i64) -> Result<Option<VmStatus>> {
    Ok(sqlx::query_as("SELECT * FROM vm_statuses WHERE id = $1")
        .bind(id)
        .fetch_optional(db)
        .await?)
}

pub async fn vm_status_by_instance(
    db: &Pool<Postgres>,
    instance_id: Uuid,
) -> Result<Option<VmStatus>> {
    let statuses: Vec<VmStatus> = sqlx::query_as(
        "SELECT * FROM vm_statuses WHERE instance_id = $1 ORDER BY created DESC",
    )
    .bind(instance_id)
    .fetch_all(db)
    .await?;
    if statuses.len() > 1 {
        bail!("multiple vm_statuses for instance {instance_id}");
    }
    Ok(statuses.into_iter().next())
}

/// The VMStatus attached to a volume's most recent instance.
pub async fn vm_status_for_volume(
    db: &Pool<Postgres>,
    volume_id: Uuid,
) -> Result<Option<VmStatus>> {
    let Some(instance) = latest_instance_for_volume(db, volume_id).await? else {
        return Ok(None);
    };
    vm_status_by_instance(db, instance.id).await
}

pub enum VmStatusInsert {
    Created(i64),
    /// The partial unique index rejected the insert: another non-resting
    /// status already exists for this (user, desktop type, feature).
    Duplicate,
}

pub async fn insert_vm_status(
    db: &Pool<Postgres>,
    username: &str,
    operating_system: &str,
    requesting_feature: &str,
    status: VmState,
    wait_time: DateTime<Utc>,
    status_message: &str,
    status_done: &str,
) -> Result<VmStatusInsert> {
    let res: std::result::Result<i64, sqlx::Error> = sqlx::query_scalar(
        "INSERT INTO vm_statuses
         (username, operating_system, requesting_feature, status, wait_time,
          status_progress, status_message, status_done)
         VALUES ($1, $2, $3, $4, $5, 0, $6, $7)
         RETURNING id",
    )
    .bind(username)
    .bind(operating_system)
    .bind(requesting_feature)
    .bind(status)
    .bind(wait_time)
    .bind(status_message)
    .bind(status_done)
    .fetch_one(db)
    .await;

    match res {
        Ok(id) => Ok(VmStatusInsert::Created(id)),
        Err(sqlx::Error::Database(e)) if e.code().as_deref() == Some("23505") => {
            Ok(VmStatusInsert::Duplicate)
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn attach_instance_to_vm_status(
    db: &Pool<Postgres>,
    vm_status_id: i64,
    instance_id: Uuid,
) -> Result<()> {
    sqlx::query("UPDATE vm_statuses SET instance_id = $2 WHERE id = $1")
        .bind(vm_status_id)
        .bind(instance_id)
        .execute(db)
        .await?;
    Ok(())
}

// --- Error marking ----------------------------------------------------------
//
// error() is the only way error_flag/error_message are set, and they are
// always set together with the current timestamp.

pub async fn volume_error(db: &Pool<Postgres>, id: Uuid, message: &str) -> Result<()> {
    sqlx::query("UPDATE volumes SET error_flag = NOW(), error_message = $2 WHERE id = $1")
        .bind(id)
        .bind(message)
        .execute(db)
        .await?;
    logger::log_quick(db, "VOLUME_ERROR", Some(id), Some(message)).await;
    Ok(())
}

pub async fn instance_error(db: &Pool<Postgres>, id: Uuid, message: &str) -> Result<()> {
    sqlx::query("UPDATE instances SET error_flag = NOW(), error_message = $2 WHERE id = $1")
        .bind(id)
        .bind(message)
        .execute(db)
        .await?;
    logger::log_quick(db, "INSTANCE_ERROR", Some(id), Some(message)).await;
    Ok(())
}

// --- Teardown markers -------------------------------------------------------

pub async fn mark_volume_for_deletion(db: &Pool<Postgres>, id: Uuid) -> Result<()> {
    sqlx::query(
        "UPDATE volumes SET marked_for_deletion = COALESCE(marked_for_deletion, NOW())
         WHERE id = $1",
    )
    .bind(id)
    .execute(db)
    .await?;
    Ok(())
}

pub async fn mark_instance_for_deletion(db: &Pool<Postgres>, id: Uuid) -> Result<()> {
    sqlx::query(
        "UPDATE instances SET marked_for_deletion = COALESCE(marked_for_deletion, NOW())
         WHERE id = $1",
    )
    .bind(id)
    .execute(db)
    .await?;
    Ok(())
}

pub async fn set_instance_deleted(db: &Pool<Postgres>, id: Uuid) -> Result<()> {
    sqlx::query("UPDATE instances SET deleted = COALESCE(deleted, NOW()) WHERE id = $1")
        .bind(id)
        .execute(db)
        .await?;
    Ok(())
}

pub async fn set_volume_deleted(db: &Pool<Postgres>, id: Uuid) -> Result<()> {
    sqlx::query("UPDATE volumes SET deleted = COALESCE(deleted, NOW()) WHERE id = $1")
        .bind(id)
        .execute(db)
        .await?;
    Ok(())
}

// --- Expirations ------------------------------------------------------------

pub async fn get_expiration(db: &Pool<Postgres>, id: i64) -> Result<Option<Expiration>> {
    Ok(sqlx::query_as("SELECT * FROM expirations WHERE id = $1")
        .bind(id)
        .fetch_optional(db)
        .await?)
}

async fn set_expires_inner(
    db: &Pool<Postgres>,
    current: Option<i64>,
    expires: Option<DateTime<Utc>>,
) -> Result<Option<i64>> {
    match (current, expires) {
        (Some(id), Some(expires)) => {
            sqlx::query(
                "UPDATE expirations SET expires = $2, stage = 'initial', stage_date = NOW()
                 WHERE id = $1",
            )
            .bind(id)
            .bind(expires)
            .execute(db)
            .await?;
            Ok(Some(id))
        }
        (None, Some(expires)) => {
            let id: i64 = sqlx::query_scalar(
                "INSERT INTO expirations (expires, stage, stage_date)
                 VALUES ($1, 'initial', NOW()) RETURNING id",
            )
            .bind(expires)
            .fetch_one(db)
            .await?;
            Ok(Some(id))
        }
        (Some(_), None) | (None, None) => Ok(None),
    }
}

pub async fn set_volume_expires(
    db: &Pool<Postgres>,
    volume_id: Uuid,
    expires: Option<DateTime<Utc>>,
) -> Result<()> {
    let current: Option<i64> =
        sqlx::query_scalar("SELECT expiration_id FROM volumes WHERE id = $1")
            .bind(volume_id)
            .fetch_one(db)
            .await?;
    let new_id = set_expires_inner(db, current, expires).await?;
    sqlx::query("UPDATE volumes SET expiration_id = $2 WHERE id = $1")
        .bind(volume_id)
        .bind(new_id)
        .execute(db)
        .await?;
    if let (Some(old), None) = (current, new_id) {
        let _ = sqlx::query("DELETE FROM expirations WHERE id = $1")
            .bind(old)
            .execute(db)
            .await;
    }
    Ok(())
}

pub async fn set_instance_expires(
    db: &Pool<Postgres>,
    instance_id: Uuid,
    expires: Option<DateTime<Utc>>,
) -> Result<()> {
    let current: Option<i64> =
        sqlx::query_scalar("SELECT expiration_id FROM instances WHERE id = $1")
            .bind(instance_id)
            .fetch_one(db)
            .await?;
    let new_id = set_expires_inner(db, current, expires).await?;
    sqlx::query("UPDATE instances SET expiration_id = $2 WHERE id = $1")
        .bind(instance_id)
        .bind(new_id)
        .execute(db)
        .await?;
    if let (Some(old), None) = (current, new_id) {
        let _ = sqlx::query("DELETE FROM expirations WHERE id = $1")
            .bind(old)
            .execute(db)
            .await;
    }
    Ok(())
}

pub async fn set_resize_expires(
    db: &Pool<Postgres>,
    resize_id: i64,
    expires: Option<DateTime<Utc>>,
) -> Result<()> {
    let current: Option<i64> =
        sqlx::query_scalar("SELECT expiration_id FROM resizes WHERE id = $1")
            .bind(resize_id)
            .fetch_one(db)
            .await?;
    let new_id = set_expires_inner(db, current, expires).await?;
    sqlx::query("UPDATE resizes SET expiration_id = $2 WHERE id = $1")
        .bind(resize_id)
        .bind(new_id)
        .execute(db)
        .await?;
    if let (Some(old), None) = (current, new_id) {
        let _ = sqlx::query("DELETE FROM expirations WHERE id = $1")
            .bind(old)
            .execute(db)
            .await;
    }
    Ok(())
}

/// End-of-workflow hook: an expiry-triggered workflow reports its terminal
/// outcome back onto the in-flight (EXPIRING) expiration. A no-op for
/// user-triggered runs of the same workflow.
pub async fn finish_expiration(
    db: &Pool<Postgres>,
    expiration_id: Option<i64>,
    outcome: WfOutcome,
) -> Result<()> {
    let Some(id) = expiration_id else {
        return Ok(());
    };
    let stage = match outcome {
        WfOutcome::Success => "completed",
        WfOutcome::Fail => "failed",
        WfOutcome::Retry => "failed_retryable",
        WfOutcome::Continue => return Ok(()),
    };
    sqlx::query(
        "UPDATE expirations
         SET stage = $2::expiry_stage, stage_date = NOW()
         WHERE id = $1 AND stage = 'expiring'",
    )
    .bind(id)
    .bind(stage)
    .execute(db)
    .await?;
    Ok(())
}

// --- Resizes ----------------------------------------------------------------

pub async fn latest_resize(db: &Pool<Postgres>, instance_id: Uuid) -> Result<Option<Resize>> {
    Ok(sqlx::query_as(
        "SELECT * FROM resizes WHERE instance_id = $1 ORDER BY requested DESC LIMIT 1",
    )
    .bind(instance_id)
    .fetch_optional(db)
    .await?)
}

/// Insert the boost record; the partial unique index guarantees a single
/// current resize per instance.
pub async fn insert_resize(db: &Pool<Postgres>, instance_id: Uuid) -> Result<Option<i64>> {
    let res: std::result::Result<i64, sqlx::Error> = sqlx::query_scalar(
        "INSERT INTO resizes (instance_id, requested) VALUES ($1, NOW()) RETURNING id",
    )
    .bind(instance_id)
    .fetch_one(db)
    .await;
    match res {
        Ok(id) => Ok(Some(id)),
        Err(sqlx::Error::Database(e)) if e.code().as_deref() == Some("23505") => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub async fn revert_resize(db: &Pool<Postgres>, resize_id: i64) -> Result<()> {
    sqlx::query("UPDATE resizes SET reverted = COALESCE(reverted, NOW()) WHERE id = $1")
        .bind(resize_id)
        .execute(db)
        .await?;
    Ok(())
}

// --- Hostname ids and credentials -------------------------------------------

pub fn random_hostname_id() -> String {
    let mut rng = rand::thread_rng();
    (0..6)
        .map(|_| (rng.sample::<u8, _>(Alphanumeric) as char).to_ascii_lowercase())
        .collect()
}

pub const HOSTNAME_ID_ATTEMPTS: usize = 100;

/// Sample short ids until one is free, giving up after a fixed bound.
/// The collision check is injected so the policy is testable.
pub async fn allocate_hostname_id<F, Fut>(mut taken: F) -> Result<String>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    for _ in 0..HOSTNAME_ID_ATTEMPTS {
        let candidate = random_hostname_id();
        if !taken(candidate.clone()).await? {
            return Ok(candidate);
        }
    }
    bail!("could not allocate a unique hostname id after {HOSTNAME_ID_ATTEMPTS} attempts")
}

pub async fn allocate_hostname_id_db(db: &Pool<Postgres>) -> Result<String> {
    let pool = db.clone();
    allocate_hostname_id(move |candidate| {
        let pool = pool.clone();
        async move {
            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM volumes WHERE hostname_id = $1)")
                    .bind(candidate)
                    .fetch_one(&pool)
                    .await?;
            Ok(exists)
        }
    })
    .await
}

/// Deterministic boot-callback token for a volume: short OS discriminator
/// plus the volume's hostname id.
pub fn generate_hostname(hostname_id: &str, operating_system: &str) -> String {
    let discriminator = operating_system.chars().next().unwrap_or('x');
    format!("vd{discriminator}-{hostname_id}")
}

pub fn generate_server_name(username: &str, desktop_id: &str) -> String {
    format!("{username}_{desktop_id}")
}

pub fn generate_password() -> String {
    let mut rng = rand::thread_rng();
    (0..20)
        .map(|_| rng.sample::<u8, _>(Alphanumeric) as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn hostname_ids_are_six_lowercase_alphanumerics() {
        for _ in 0..50 {
            let id = random_hostname_id();
            assert_eq!(id.len(), 6);
            assert!(id
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        }
    }

    #[tokio::test]
    async fn hostname_allocation_gives_up_after_fixed_bound() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let result = allocate_hostname_id(move |_| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(true) // every candidate collides
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), HOSTNAME_ID_ATTEMPTS);
    }

    #[tokio::test]
    async fn hostname_allocation_returns_first_free_candidate() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let result = allocate_hostname_id(move |_| {
            let seen = seen.clone();
            async move {
                // First two candidates collide, third is free.
                Ok(seen.fetch_add(1, Ordering::SeqCst) < 2)
            }
        })
        .await
        .unwrap();
        assert_eq!(result.len(), 6);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn hostname_token_is_derived_from_volume_identity() {
        assert_eq!(generate_hostname("ab12cd", "ubuntu"), "vdu-ab12cd");
        assert_eq!(generate_hostname("ab12cd", "rocky"), "vdr-ab12cd");
        // Same volume always produces the same token.
        assert_eq!(
            generate_hostname("ab12cd", "ubuntu"),
            generate_hostname("ab12cd", "ubuntu")
        );
    }

    #[test]
    fn generated_passwords_are_long_enough_and_distinct() {
        let a = generate_password();
        let b = generate_password();
        assert_eq!(a.len(), 20);
        assert_ne!(a, b);
    }
}
