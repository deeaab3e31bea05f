use std::sync::Arc;

use sqlx::{Pool, Postgres};

use crate::config::Settings;
use crate::notifier::Notifier;
use deskhive_providers::CloudProvider;

/// Shared handles constructed once at process start and passed into every
/// workflow/service call. The provider is an explicit handle, never a
/// lazily-initialized global.
#[derive(Clone)]
pub struct Ctx {
    pub db: Pool<Postgres>,
    pub provider: Arc<dyn CloudProvider>,
    pub notifier: Notifier,
    pub settings: Arc<Settings>,
}
