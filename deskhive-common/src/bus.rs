use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// -----------------------------------------------------------------------------
// Channels
// -----------------------------------------------------------------------------

/// PubSub channel the outbound notification relay subscribes to.
pub const CHANNEL_NOTIFICATIONS: &str = "deskhive_notifications";

// -----------------------------------------------------------------------------
// Envelopes
// -----------------------------------------------------------------------------

/// A rendered-notification request handed to the delivery relay.
/// Delivery (email / ticketing) is somebody else's problem; the orchestrator
/// only publishes these fire-and-forget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEnvelope {
    pub notification_id: Uuid,
    /// Owning user the notice is addressed to.
    pub user: String,
    /// Template key, e.g. "email/instance_expiry".
    pub template: String,
    pub occurred_at: DateTime<Utc>,
    /// Template context (expiry dates, desktop details, ...).
    pub context: serde_json::Value,
    pub source: String,
}

impl NotificationEnvelope {
    pub fn new(user: &str, template: &str, context: serde_json::Value, source: &str) -> Self {
        Self {
            notification_id: Uuid::new_v4(),
            user: user.to_string(),
            template: template.to_string(),
            occurred_at: Utc::now(),
            context,
            source: source.to_string(),
        }
    }
}
