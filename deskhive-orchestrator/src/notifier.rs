use anyhow::{Context, Result};
use redis::AsyncCommands;

use deskhive_common::bus::{NotificationEnvelope, CHANNEL_NOTIFICATIONS};

/// Fire-and-forget notification hand-off. Delivery is an external concern;
/// the orchestrator publishes envelopes on the bus and moves on. In dry-run
/// mode the envelope is only traced.
#[derive(Clone)]
pub struct Notifier {
    redis_client: redis::Client,
    dry_run: bool,
}

impl Notifier {
    pub fn new(redis_client: redis::Client, dry_run: bool) -> Self {
        Self {
            redis_client,
            dry_run,
        }
    }

    pub async fn notify(
        &self,
        user: &str,
        template: &str,
        context: serde_json::Value,
    ) -> Result<()> {
        if self.dry_run {
            tracing::info!(
                "dry-run notification: user={} template={} context={}",
                user,
                template,
                context
            );
            return Ok(());
        }

        let envelope = NotificationEnvelope::new(user, template, context, "deskhive-orchestrator");
        let payload = serde_json::to_string(&envelope)?;
        let mut conn = self
            .redis_client
            .get_multiplexed_async_connection()
            .await
            .context("failed to connect to Redis (publisher)")?;
        let _: () = conn.publish(CHANNEL_NOTIFICATIONS, payload).await?;
        Ok(())
    }
}
