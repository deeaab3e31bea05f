use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use sqlx::{Pool, Postgres};

use crate::context::Ctx;
use crate::workflow::{self, WorkflowStep};

/// Durable task queue over Postgres. Steps are tagged JSON payloads; claiming
/// uses SKIP LOCKED plus a visibility timeout, so multiple orchestrator
/// processes can drain the same queue and a crashed worker's claim simply
/// expires. Delivery is at-least-once; the steps themselves are idempotent.

pub async fn enqueue(db: &Pool<Postgres>, step: &WorkflowStep) -> Result<i64> {
    enqueue_in(db, step, Duration::ZERO).await
}

pub async fn enqueue_in(db: &Pool<Postgres>, step: &WorkflowStep, delay: Duration) -> Result<i64> {
    let run_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO tasks (run_at, payload) VALUES ($1, $2) RETURNING id",
    )
    .bind(run_at)
    .bind(serde_json::to_value(step)?)
    .fetch_one(db)
    .await?;
    tracing::debug!("enqueued task {} step={} run_at={}", id, step.name(), run_at);
    Ok(id)
}

/// Claim a batch of due tasks and run them. Returns how many were executed.
pub async fn run_due_tasks(ctx: &Ctx, limit: i64) -> Result<usize> {
    let visibility = Utc::now()
        + chrono::Duration::from_std(ctx.settings.task_visibility_timeout).unwrap_or_else(|_| chrono::Duration::zero());
    let claimed: Vec<(i64, serde_json::Value, i32)> = sqlx::query_as(
        "WITH cte AS (
            SELECT id FROM tasks
            WHERE run_at <= NOW()
              AND (claimed_until IS NULL OR claimed_until < NOW())
            ORDER BY run_at
            LIMIT $1
            FOR UPDATE SKIP LOCKED
        )
        UPDATE tasks t
        SET claimed_until = $2, attempts = t.attempts + 1
        FROM cte
        WHERE t.id = cte.id
        RETURNING t.id, t.payload, t.attempts",
    )
    .bind(limit)
    .bind(visibility)
    .fetch_all(&ctx.db)
    .await?;

    let mut executed = 0usize;
    for (task_id, payload, attempts) in claimed {
        if attempts > ctx.settings.task_max_attempts {
            tracing::error!(
                "task {} exceeded {} attempts, dropping: {}",
                task_id,
                ctx.settings.task_max_attempts,
                payload
            );
            delete_task(&ctx.db, task_id).await;
            continue;
        }

        let step: WorkflowStep = match serde_json::from_value(payload.clone()) {
            Ok(step) => step,
            Err(e) => {
                // A payload we cannot parse will never parse; drop it rather
                // than redeliver forever.
                tracing::error!("task {} has an unreadable payload ({}): {}", task_id, e, payload);
                delete_task(&ctx.db, task_id).await;
                continue;
            }
        };

        let name = step.name();
        let start = std::time::Instant::now();
        let log_id = crate::logger::log_event_with_metadata(
            &ctx.db,
            "WORKFLOW_STEP",
            "in_progress",
            None,
            None,
            Some(payload),
        )
        .await
        .ok();

        match workflow::dispatch(ctx, step).await {
            Ok(()) => {
                if let Some(lid) = log_id {
                    let duration = start.elapsed().as_millis() as i32;
                    let _ =
                        crate::logger::log_event_complete(&ctx.db, lid, "success", duration, None)
                            .await;
                }
                delete_task(&ctx.db, task_id).await;
                executed += 1;
            }
            Err(e) => {
                // Leave the row; the claim expires and the task is
                // redelivered, bounded by the attempts counter.
                tracing::error!("task {} step {} failed (attempt {}): {:?}", task_id, name, attempts, e);
                if let Some(lid) = log_id {
                    let duration = start.elapsed().as_millis() as i32;
                    let _ = crate::logger::log_event_complete(
                        &ctx.db,
                        lid,
                        "failed",
                        duration,
                        Some(&e.to_string()),
                    )
                    .await;
                }
            }
        }
    }
    Ok(executed)
}

async fn delete_task(db: &Pool<Postgres>, task_id: i64) {
    let _ = sqlx::query("DELETE FROM tasks WHERE id = $1")
        .bind(task_id)
        .execute(db)
        .await;
}

/// job-dispatcher: drains due workflow steps until shutdown.
pub async fn run(ctx: Ctx) {
    let mut interval = tokio::time::interval(ctx.settings.dispatcher_poll);
    tracing::info!("job-dispatcher started (draining workflow steps)");

    loop {
        interval.tick().await;
        match run_due_tasks(&ctx, 20).await {
            Ok(count) if count > 0 => tracing::debug!("job-dispatcher: ran {} step(s)", count),
            Ok(_) => {}
            Err(e) => tracing::error!("job-dispatcher error: {:?}", e),
        }
    }
}
