//! Staged notify-then-act retirement. One staging algorithm, parameterized
//! by a small strategy interface; the four resource retirements (shelve,
//! archive, backup deletion, downsize) differ only in their targets, warning
//! intervals, notification template and terminal action.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use deskhive_common::{Expiration, ExpiryStage, VmState, WfOutcome};

use crate::config::Settings;
use crate::context::Ctx;
use crate::{catalog, delete_flow, models, resize_flow, shelve_flow};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceRef {
    Volume(Uuid),
    Instance(Uuid),
    Resize { id: i64, instance_id: Uuid },
}

#[derive(Clone, Debug)]
pub struct ExpiryTarget {
    pub resource: ResourceRef,
    pub expiration: Expiration,
    pub username: String,
}

#[derive(Debug, PartialEq, Eq)]
pub enum StageOutcome {
    /// Nothing due (or the stage is terminal / already being acted on).
    Skip,
    Notified(ExpiryStage),
    Expired(WfOutcome),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagePlan {
    pub next: ExpiryStage,
    /// How much notice the user is still owed once this stage fires; the
    /// expiry is re-anchored to `now + remaining` so a late driver run never
    /// shortens the configured notice-to-action gap.
    pub remaining: Duration,
}

/// Decide whether an expiration crosses its next stage boundary at `now`.
/// Pure; all persistence happens in `do_stage`.
pub fn assess(
    stage: ExpiryStage,
    expires: DateTime<Utc>,
    now: DateTime<Utc>,
    first_warning: Option<Duration>,
    final_warning: Option<Duration>,
) -> Option<StagePlan> {
    match stage {
        ExpiryStage::Initial => {
            if let Some(first) = first_warning {
                if expires - first <= now {
                    return Some(StagePlan {
                        next: ExpiryStage::FirstWarning,
                        remaining: first,
                    });
                }
            } else if let Some(last) = final_warning {
                if expires - last <= now {
                    return Some(StagePlan {
                        next: ExpiryStage::FinalWarning,
                        remaining: last,
                    });
                }
            } else if expires <= now {
                // No warnings configured at all: act as soon as due.
                return Some(StagePlan {
                    next: ExpiryStage::Expiring,
                    remaining: Duration::zero(),
                });
            }
            None
        }
        ExpiryStage::FirstWarning => {
            let last = final_warning?;
            if expires - last <= now {
                Some(StagePlan {
                    next: ExpiryStage::FinalWarning,
                    remaining: last,
                })
            } else {
                None
            }
        }
        // A retryable failure is re-attempted exactly as if newly due.
        ExpiryStage::FinalWarning | ExpiryStage::FailedRetryable => {
            if expires <= now {
                Some(StagePlan {
                    next: ExpiryStage::Expiring,
                    remaining: Duration::zero(),
                })
            } else {
                None
            }
        }
        // Expiring: another run is already performing the action.
        // Completed/Failed: terminal; repeated driver runs are no-ops.
        ExpiryStage::Expiring | ExpiryStage::Completed | ExpiryStage::Failed => None,
    }
}

#[async_trait]
pub trait ExpiryStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn template(&self) -> &'static str;
    fn first_warning(&self, settings: &Settings) -> Option<Duration>;
    fn final_warning(&self, settings: &Settings) -> Option<Duration>;
    /// Every resource of this kind with an active Expiration.
    async fn targets(&self, ctx: &Ctx) -> Result<Vec<ExpiryTarget>>;
    /// The terminal action, usually a workflow entry point.
    async fn expire(&self, ctx: &Ctx, target: &ExpiryTarget) -> Result<WfOutcome>;
    /// Resource-type details injected into the notification context.
    async fn describe(
        &self,
        ctx: &Ctx,
        target: &ExpiryTarget,
        context: &mut serde_json::Map<String, serde_json::Value>,
    ) -> Result<()>;
}

async fn update_stage(
    ctx: &Ctx,
    expiration_id: i64,
    stage: ExpiryStage,
    now: DateTime<Utc>,
    expires: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "UPDATE expirations SET stage = $2, stage_date = $3, expires = $4 WHERE id = $1",
    )
    .bind(expiration_id)
    .bind(stage)
    .bind(now)
    .bind(expires)
    .execute(&ctx.db)
    .await?;
    Ok(())
}

/// Advance one expiration through the state machine. Safe to call on every
/// driver pass; anything not due is a SKIP with no side effects.
pub async fn do_stage(
    ctx: &Ctx,
    strategy: &dyn ExpiryStrategy,
    target: &ExpiryTarget,
) -> Result<StageOutcome> {
    let now = Utc::now();
    let Some(plan) = assess(
        target.expiration.stage,
        target.expiration.expires,
        now,
        strategy.first_warning(&ctx.settings),
        strategy.final_warning(&ctx.settings),
    ) else {
        return Ok(StageOutcome::Skip);
    };

    let dry_run = ctx.settings.expiry_dry_run;

    match plan.next {
        ExpiryStage::FirstWarning | ExpiryStage::FinalWarning => {
            let mut context = serde_json::Map::new();
            context.insert(
                "warning".to_string(),
                json!(if plan.next == ExpiryStage::FirstWarning {
                    "first"
                } else {
                    "final"
                }),
            );
            context.insert("expires".to_string(), json!(target.expiration.expires));
            context.insert("adjusted".to_string(), json!(now + plan.remaining));
            context.insert(
                "remaining_seconds".to_string(),
                json!(plan.remaining.num_seconds()),
            );
            strategy.describe(ctx, target, &mut context).await?;
            ctx.notifier
                .notify(
                    &target.username,
                    strategy.template(),
                    serde_json::Value::Object(context),
                )
                .await?;

            if !dry_run {
                update_stage(
                    ctx,
                    target.expiration.id,
                    plan.next,
                    now,
                    now + plan.remaining,
                )
                .await?;
            } else {
                tracing::debug!(
                    "dry-run: would advance expiration {} to {:?}",
                    target.expiration.id,
                    plan.next
                );
            }
            Ok(StageOutcome::Notified(plan.next))
        }
        ExpiryStage::Expiring => {
            if dry_run {
                tracing::info!(
                    "dry-run: would have expired {:?} (expiration {})",
                    target.resource,
                    target.expiration.id
                );
                return Ok(StageOutcome::Expired(WfOutcome::Success));
            }
            // Persist EXPIRING before acting so a concurrent pass skips.
            update_stage(ctx, target.expiration.id, ExpiryStage::Expiring, now, now).await?;
            let outcome = strategy.expire(ctx, target).await?;
            let terminal = match outcome {
                WfOutcome::Success => Some(ExpiryStage::Completed),
                WfOutcome::Fail => Some(ExpiryStage::Failed),
                WfOutcome::Retry => Some(ExpiryStage::FailedRetryable),
                // The workflow's end hook reports the terminal stage later.
                WfOutcome::Continue => None,
            };
            if let Some(stage) = terminal {
                update_stage(ctx, target.expiration.id, stage, Utc::now(), now).await?;
            }
            if outcome == WfOutcome::Fail {
                tracing::error!("expiration action failed for {:?}", target.resource);
            }
            Ok(StageOutcome::Expired(outcome))
        }
        _ => Ok(StageOutcome::Skip),
    }
}

/// One pass of a strategy over its targets. Returns (notified, expired).
pub async fn run_strategy(ctx: &Ctx, strategy: &dyn ExpiryStrategy) -> Result<(usize, usize)> {
    let mut notified = 0usize;
    let mut expired = 0usize;
    for target in strategy.targets(ctx).await? {
        match do_stage(ctx, strategy, &target).await {
            Ok(StageOutcome::Notified(_)) => notified += 1,
            Ok(StageOutcome::Expired(_)) => expired += 1,
            Ok(StageOutcome::Skip) => {}
            Err(e) => {
                tracing::error!(
                    "{} staging failed for {:?}: {:?}",
                    strategy.name(),
                    target.resource,
                    e
                );
            }
        }
    }
    Ok((notified, expired))
}

fn target_from_row(
    resource: ResourceRef,
    username: String,
    expiration_id: i64,
    expires: DateTime<Utc>,
    stage: ExpiryStage,
    stage_date: DateTime<Utc>,
) -> ExpiryTarget {
    ExpiryTarget {
        resource,
        expiration: Expiration {
            id: expiration_id,
            expires,
            stage,
            stage_date,
        },
        username,
    }
}

// --- Instance shelving ------------------------------------------------------

pub struct InstanceShelveStrategy;

#[async_trait]
impl ExpiryStrategy for InstanceShelveStrategy {
    fn name(&self) -> &'static str {
        "instance-shelve"
    }
    fn template(&self) -> &'static str {
        "email/instance_expiry"
    }
    fn first_warning(&self, settings: &Settings) -> Option<Duration> {
        settings.instance_warning_1
    }
    fn final_warning(&self, settings: &Settings) -> Option<Duration> {
        settings.instance_warning_2
    }

    async fn targets(&self, ctx: &Ctx) -> Result<Vec<ExpiryTarget>> {
        let rows: Vec<(Uuid, String, i64, DateTime<Utc>, ExpiryStage, DateTime<Utc>)> =
            sqlx::query_as(
                "SELECT i.id, i.username, e.id, e.expires, e.stage, e.stage_date
                 FROM instances i JOIN expirations e ON e.id = i.expiration_id
                 WHERE i.deleted IS NULL AND i.marked_for_deletion IS NULL",
            )
            .fetch_all(&ctx.db)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(id, username, eid, expires, stage, stage_date)| {
                target_from_row(
                    ResourceRef::Instance(id),
                    username,
                    eid,
                    expires,
                    stage,
                    stage_date,
                )
            })
            .collect())
    }

    async fn expire(&self, ctx: &Ctx, target: &ExpiryTarget) -> Result<WfOutcome> {
        let ResourceRef::Instance(instance_id) = target.resource else {
            return Ok(WfOutcome::Fail);
        };
        shelve_flow::shelve_expired(ctx, instance_id).await
    }

    async fn describe(
        &self,
        ctx: &Ctx,
        target: &ExpiryTarget,
        context: &mut serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        let ResourceRef::Instance(instance_id) = target.resource else {
            return Ok(());
        };
        context.insert("instance".to_string(), json!(instance_id));
        if let Some(instance) = models::get_instance(&ctx.db, instance_id).await? {
            context.insert("volume".to_string(), json!(instance.boot_volume_id));
            if let Some(volume) = models::get_volume(&ctx.db, instance.boot_volume_id).await? {
                describe_desktop(ctx, &volume.operating_system, context).await;
            }
        }
        Ok(())
    }
}

// --- Volume archival --------------------------------------------------------

pub struct VolumeArchiveStrategy;

#[async_trait]
impl ExpiryStrategy for VolumeArchiveStrategy {
    fn name(&self) -> &'static str {
        "volume-archive"
    }
    fn template(&self) -> &'static str {
        "email/volume_expiry"
    }
    fn first_warning(&self, settings: &Settings) -> Option<Duration> {
        settings.volume_warning_1
    }
    fn final_warning(&self, settings: &Settings) -> Option<Duration> {
        settings.volume_warning_2
    }

    async fn targets(&self, ctx: &Ctx) -> Result<Vec<ExpiryTarget>> {
        let rows: Vec<(Uuid, String, i64, DateTime<Utc>, ExpiryStage, DateTime<Utc>)> =
            sqlx::query_as(
                "SELECT v.id, v.username, e.id, e.expires, e.stage, e.stage_date
                 FROM volumes v JOIN expirations e ON e.id = v.expiration_id
                 WHERE v.deleted IS NULL AND v.marked_for_deletion IS NULL
                   AND v.archived_at IS NULL",
            )
            .fetch_all(&ctx.db)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(id, username, eid, expires, stage, stage_date)| {
                target_from_row(
                    ResourceRef::Volume(id),
                    username,
                    eid,
                    expires,
                    stage,
                    stage_date,
                )
            })
            .collect())
    }

    async fn expire(&self, ctx: &Ctx, target: &ExpiryTarget) -> Result<WfOutcome> {
        let ResourceRef::Volume(volume_id) = target.resource else {
            return Ok(WfOutcome::Fail);
        };
        // Only shelved desktops get archived; anything else is off-script.
        match models::vm_status_for_volume(&ctx.db, volume_id).await? {
            Some(vm_status) if vm_status.status == VmState::Shelved => {
                delete_flow::archive_volume(ctx, volume_id).await
            }
            other => {
                tracing::info!(
                    "skipping archive of volume {} in unexpected state {:?}",
                    volume_id,
                    other.map(|s| s.status)
                );
                Ok(WfOutcome::Retry)
            }
        }
    }

    async fn describe(
        &self,
        ctx: &Ctx,
        target: &ExpiryTarget,
        context: &mut serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        let ResourceRef::Volume(volume_id) = target.resource else {
            return Ok(());
        };
        context.insert("volume".to_string(), json!(volume_id));
        if let Some(volume) = models::get_volume(&ctx.db, volume_id).await? {
            describe_desktop(ctx, &volume.operating_system, context).await;
        }
        Ok(())
    }
}

// --- Backup (archive) deletion ----------------------------------------------

pub struct BackupDeleteStrategy;

#[async_trait]
impl ExpiryStrategy for BackupDeleteStrategy {
    fn name(&self) -> &'static str {
        "backup-delete"
    }
    fn template(&self) -> &'static str {
        "email/backup_expiry"
    }
    fn first_warning(&self, settings: &Settings) -> Option<Duration> {
        settings.backup_warning_1
    }
    fn final_warning(&self, settings: &Settings) -> Option<Duration> {
        settings.backup_warning_2
    }

    async fn targets(&self, ctx: &Ctx) -> Result<Vec<ExpiryTarget>> {
        // The volume row is already deleted by the archive flow; what expires
        // here is the backup it left behind.
        let rows: Vec<(Uuid, String, i64, DateTime<Utc>, ExpiryStage, DateTime<Utc>)> =
            sqlx::query_as(
                "SELECT v.id, v.username, e.id, e.expires, e.stage, e.stage_date
                 FROM volumes v JOIN expirations e ON e.id = v.expiration_id
                 WHERE v.archived_at IS NOT NULL AND v.backup_id IS NOT NULL",
            )
            .fetch_all(&ctx.db)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(id, username, eid, expires, stage, stage_date)| {
                target_from_row(
                    ResourceRef::Volume(id),
                    username,
                    eid,
                    expires,
                    stage,
                    stage_date,
                )
            })
            .collect())
    }

    async fn expire(&self, ctx: &Ctx, target: &ExpiryTarget) -> Result<WfOutcome> {
        let ResourceRef::Volume(volume_id) = target.resource else {
            return Ok(WfOutcome::Fail);
        };
        delete_flow::delete_backup(ctx, volume_id).await
    }

    async fn describe(
        &self,
        ctx: &Ctx,
        target: &ExpiryTarget,
        context: &mut serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        let ResourceRef::Volume(volume_id) = target.resource else {
            return Ok(());
        };
        context.insert("volume".to_string(), json!(volume_id));
        if let Some(volume) = models::get_volume(&ctx.db, volume_id).await? {
            context.insert("backup".to_string(), json!(volume.backup_id));
            describe_desktop(ctx, &volume.operating_system, context).await;
        }
        Ok(())
    }
}

// --- Resize downsizing ------------------------------------------------------

pub struct ResizeDownsizeStrategy;

#[async_trait]
impl ExpiryStrategy for ResizeDownsizeStrategy {
    fn name(&self) -> &'static str {
        "resize-downsize"
    }
    fn template(&self) -> &'static str {
        "email/resize_expiry"
    }
    fn first_warning(&self, settings: &Settings) -> Option<Duration> {
        settings.boost_warning_1
    }
    fn final_warning(&self, settings: &Settings) -> Option<Duration> {
        settings.boost_warning_2
    }

    async fn targets(&self, ctx: &Ctx) -> Result<Vec<ExpiryTarget>> {
        let rows: Vec<(i64, Uuid, String, i64, DateTime<Utc>, ExpiryStage, DateTime<Utc>)> =
            sqlx::query_as(
                "SELECT r.id, r.instance_id, i.username, e.id, e.expires, e.stage, e.stage_date
                 FROM resizes r
                 JOIN instances i ON i.id = r.instance_id
                 JOIN expirations e ON e.id = r.expiration_id
                 WHERE r.reverted IS NULL
                   AND i.deleted IS NULL AND i.marked_for_deletion IS NULL",
            )
            .fetch_all(&ctx.db)
            .await?;
        Ok(rows
            .into_iter()
            .map(
                |(id, instance_id, username, eid, expires, stage, stage_date)| {
                    target_from_row(
                        ResourceRef::Resize { id, instance_id },
                        username,
                        eid,
                        expires,
                        stage,
                        stage_date,
                    )
                },
            )
            .collect())
    }

    async fn expire(&self, ctx: &Ctx, target: &ExpiryTarget) -> Result<WfOutcome> {
        let ResourceRef::Resize { id, .. } = target.resource else {
            return Ok(WfOutcome::Fail);
        };
        let Some(resize) = sqlx::query_as::<_, deskhive_common::Resize>(
            "SELECT * FROM resizes WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&ctx.db)
        .await?
        else {
            return Ok(WfOutcome::Fail);
        };
        resize_flow::downsize_expired(ctx, &resize).await
    }

    async fn describe(
        &self,
        ctx: &Ctx,
        target: &ExpiryTarget,
        context: &mut serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        let ResourceRef::Resize { instance_id, .. } = target.resource else {
            return Ok(());
        };
        context.insert("instance".to_string(), json!(instance_id));
        if let Some(instance) = models::get_instance(&ctx.db, instance_id).await? {
            if let Some(volume) = models::get_volume(&ctx.db, instance.boot_volume_id).await? {
                describe_desktop(ctx, &volume.operating_system, context).await;
            }
        }
        Ok(())
    }
}

async fn describe_desktop(
    ctx: &Ctx,
    operating_system: &str,
    context: &mut serde_json::Map<String, serde_json::Value>,
) {
    context.insert("operating_system".to_string(), json!(operating_system));
    if let Ok(dt) = catalog::get_desktop_type(&ctx.db, operating_system).await {
        context.insert("desktop_name".to_string(), json!(dt.name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn days(n: i64) -> Duration {
        Duration::days(n)
    }

    #[test]
    fn terminal_and_inflight_stages_always_skip() {
        let now = Utc::now();
        for stage in [ExpiryStage::Expiring, ExpiryStage::Completed, ExpiryStage::Failed] {
            assert_eq!(
                assess(stage, now - days(10), now, Some(days(7)), Some(days(1))),
                None,
                "{stage:?} must be skipped"
            );
        }
    }

    #[test]
    fn nothing_happens_before_the_warning_boundary() {
        let now = Utc::now();
        let expires = now + days(7);
        assert_eq!(assess(ExpiryStage::Initial, expires, now, None, Some(days(1))), None);
    }

    #[test]
    fn final_warning_only_walks_skip_notify_expire_over_seven_days() {
        // Expires in 7 days, no first warning, final warning 1 day.
        // Day 0-5: SKIP. Day 6: FINAL_WARNING. Day 7: EXPIRING.
        let start = Utc::now();
        let mut expires = start + days(7);
        let mut stage = ExpiryStage::Initial;

        for day in 0..=7 {
            let now = start + days(day) + Duration::seconds(1);
            let plan = assess(stage, expires, now, None, Some(days(1)));
            match day {
                0..=5 => assert_eq!(plan, None, "day {day} should skip"),
                6 => {
                    let plan = plan.expect("day 6 should notify");
                    assert_eq!(plan.next, ExpiryStage::FinalWarning);
                    assert_eq!(plan.remaining, days(1));
                    // What do_stage persists: stage advances, expiry is
                    // re-anchored to preserve the remaining notice.
                    stage = plan.next;
                    expires = now + plan.remaining;
                }
                7 => {
                    let plan = plan.expect("day 7 should expire");
                    assert_eq!(plan.next, ExpiryStage::Expiring);
                    assert_eq!(plan.remaining, Duration::zero());
                    stage = plan.next;
                }
                _ => unreachable!(),
            }
        }
        assert_eq!(stage, ExpiryStage::Expiring);
    }

    #[test]
    fn two_warning_schedule_hits_both_warnings_then_expires() {
        // Expires in 14 days, first warning 7 days, final warning 1 day.
        let start = Utc::now();
        let mut expires = start + days(14);
        let mut stage = ExpiryStage::Initial;
        let mut transitions = vec![];

        for day in 0..=14 {
            let now = start + days(day) + Duration::seconds(1);
            if let Some(plan) = assess(stage, expires, now, Some(days(7)), Some(days(1))) {
                transitions.push((day, plan.next));
                stage = plan.next;
                if plan.next != ExpiryStage::Expiring {
                    expires = now + plan.remaining;
                }
            }
        }
        assert_eq!(
            transitions,
            vec![
                (7, ExpiryStage::FirstWarning),
                (13, ExpiryStage::FinalWarning),
                (14, ExpiryStage::Expiring),
            ]
        );
    }

    #[test]
    fn late_driver_runs_still_give_the_full_final_notice() {
        // The driver does not run for 9 days straight; the user must still
        // get a full day's notice between warning and action.
        let start = Utc::now();
        let expires = start + days(7);
        let now = start + days(9);
        let plan = assess(ExpiryStage::Initial, expires, now, None, Some(days(1))).unwrap();
        assert_eq!(plan.next, ExpiryStage::FinalWarning);
        // Re-anchored expiry lands a full final_warning after "now".
        assert_eq!(plan.remaining, days(1));
    }

    #[test]
    fn failed_retryable_is_due_again_immediately() {
        let now = Utc::now();
        let plan = assess(
            ExpiryStage::FailedRetryable,
            now - Duration::seconds(5),
            now,
            None,
            Some(days(1)),
        )
        .unwrap();
        assert_eq!(plan.next, ExpiryStage::Expiring);
    }

    #[test]
    fn no_warnings_configured_means_act_when_due() {
        let now = Utc::now();
        assert_eq!(assess(ExpiryStage::Initial, now + days(1), now, None, None), None);
        let plan = assess(ExpiryStage::Initial, now - days(1), now, None, None).unwrap();
        assert_eq!(plan.next, ExpiryStage::Expiring);
    }
}
