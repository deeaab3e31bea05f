use std::time::Duration;

use anyhow::{bail, Context, Result};

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

/// Warning intervals in days; zero or negative means "not configured",
/// matching how the cron settings expressed it.
fn warning_days(key: &str, default: i64) -> Option<chrono::Duration> {
    let days = env_i64(key, default);
    (days > 0).then(|| chrono::Duration::days(days))
}

/// Everything tunable, read once at startup.
#[derive(Clone, Debug)]
pub struct Settings {
    pub database_url: String,
    pub redis_url: String,
    pub bind_addr: String,
    pub environment_name: String,
    pub site_url: String,
    /// Expiry engine counts and logs instead of notifying/acting.
    pub expiry_dry_run: bool,

    // User-visible wait deadlines (VMStatus.wait_time)
    pub launch_wait: Duration,
    pub shelve_wait: Duration,
    pub resize_wait: Duration,
    pub reboot_wait: Duration,
    pub forced_shelve_wait: Duration,
    pub forced_downsize_wait: Duration,

    // Workflow polling bounds
    pub volume_creation_timeout: Duration,
    pub instance_launch_timeout: Duration,
    pub poll_step_delay: Duration,
    pub shutoff_retry_wait: Duration,
    pub shutoff_retry_count: i32,
    pub deletion_retry_wait: Duration,
    pub deletion_retry_count: i32,
    pub resize_confirm_wait: Duration,
    pub reboot_confirm_wait: Duration,
    pub reboot_confirm_retries: i32,
    pub archive_poll_delay: Duration,
    pub archive_wait: Duration,

    // Expiry policies (days; lifetime < 0 means no cap)
    pub instance_expiry_days: i64,
    pub instance_extension_days: i64,
    pub instance_lifetime_days: i64,
    pub volume_expiry_days: i64,
    pub backup_retention_days: i64,
    pub boost_expiry_days: i64,
    pub boost_extension_days: i64,
    pub boost_lifetime_days: i64,

    // Warning intervals per expirer
    pub instance_warning_1: Option<chrono::Duration>,
    pub instance_warning_2: Option<chrono::Duration>,
    pub volume_warning_1: Option<chrono::Duration>,
    pub volume_warning_2: Option<chrono::Duration>,
    pub backup_warning_1: Option<chrono::Duration>,
    pub backup_warning_2: Option<chrono::Duration>,
    pub boost_warning_1: Option<chrono::Duration>,
    pub boost_warning_2: Option<chrono::Duration>,

    // Driver cadence
    pub dispatcher_poll: Duration,
    pub expiry_pass_interval: Duration,
    pub task_visibility_timeout: Duration,
    pub task_max_attempts: i32,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let settings = Self {
            database_url: std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            redis_url: std::env::var("REDIS_URL").context("REDIS_URL must be set")?,
            bind_addr: env_string("BIND_ADDR", "0.0.0.0:8003"),
            environment_name: env_string("ENVIRONMENT_NAME", "dev"),
            site_url: env_string("SITE_URL", "http://localhost:8003"),
            expiry_dry_run: env_bool("EXPIRY_DRY_RUN", false),

            launch_wait: Duration::from_secs(env_i64("LAUNCH_WAIT_SECONDS", 1200) as u64),
            shelve_wait: Duration::from_secs(env_i64("SHELVE_WAIT_SECONDS", 600) as u64),
            resize_wait: Duration::from_secs(env_i64("RESIZE_WAIT_SECONDS", 900) as u64),
            reboot_wait: Duration::from_secs(env_i64("REBOOT_WAIT_SECONDS", 600) as u64),
            forced_shelve_wait: Duration::from_secs(
                env_i64("FORCED_SHELVE_WAIT_SECONDS", 1800) as u64
            ),
            forced_downsize_wait: Duration::from_secs(
                env_i64("FORCED_DOWNSIZE_WAIT_SECONDS", 1800) as u64,
            ),

            volume_creation_timeout: Duration::from_secs(
                env_i64("VOLUME_CREATION_TIMEOUT_SECONDS", 180) as u64,
            ),
            instance_launch_timeout: Duration::from_secs(
                env_i64("INSTANCE_LAUNCH_TIMEOUT_SECONDS", 300) as u64,
            ),
            poll_step_delay: Duration::from_secs(env_i64("POLL_STEP_DELAY_SECONDS", 5) as u64),
            shutoff_retry_wait: Duration::from_secs(
                env_i64("SHUTOFF_RETRY_WAIT_SECONDS", 15) as u64
            ),
            shutoff_retry_count: env_i64("SHUTOFF_RETRY_COUNT", 8) as i32,
            deletion_retry_wait: Duration::from_secs(
                env_i64("DELETION_RETRY_WAIT_SECONDS", 30) as u64
            ),
            deletion_retry_count: env_i64("DELETION_RETRY_COUNT", 10) as i32,
            resize_confirm_wait: Duration::from_secs(
                env_i64("RESIZE_CONFIRM_WAIT_SECONDS", 300) as u64
            ),
            reboot_confirm_wait: Duration::from_secs(
                env_i64("REBOOT_CONFIRM_WAIT_SECONDS", 30) as u64
            ),
            reboot_confirm_retries: env_i64("REBOOT_CONFIRM_RETRIES", 10) as i32,
            archive_poll_delay: Duration::from_secs(env_i64("ARCHIVE_POLL_SECONDS", 30) as u64),
            archive_wait: Duration::from_secs(env_i64("ARCHIVE_WAIT_SECONDS", 3600) as u64),

            instance_expiry_days: env_i64("INSTANCE_EXPIRY_DAYS", 14),
            instance_extension_days: env_i64("INSTANCE_EXTENSION_DAYS", 14),
            instance_lifetime_days: env_i64("INSTANCE_LIFETIME_DAYS", -1),
            volume_expiry_days: env_i64("VOLUME_EXPIRY_DAYS", 90),
            backup_retention_days: env_i64("BACKUP_RETENTION_DAYS", 180),
            boost_expiry_days: env_i64("BOOST_EXPIRY_DAYS", 7),
            boost_extension_days: env_i64("BOOST_EXTENSION_DAYS", 7),
            boost_lifetime_days: env_i64("BOOST_LIFETIME_DAYS", 28),

            instance_warning_1: warning_days("INSTANCE_WARNING_1_DAYS", 7),
            instance_warning_2: warning_days("INSTANCE_WARNING_2_DAYS", 1),
            volume_warning_1: warning_days("VOLUME_WARNING_1_DAYS", 14),
            volume_warning_2: warning_days("VOLUME_WARNING_2_DAYS", 3),
            backup_warning_1: warning_days("BACKUP_WARNING_1_DAYS", 0),
            backup_warning_2: warning_days("BACKUP_WARNING_2_DAYS", 7),
            boost_warning_1: warning_days("BOOST_WARNING_1_DAYS", 0),
            boost_warning_2: warning_days("BOOST_WARNING_2_DAYS", 1),

            dispatcher_poll: Duration::from_secs(env_i64("DISPATCHER_POLL_SECONDS", 2) as u64),
            expiry_pass_interval: Duration::from_secs(
                env_i64("EXPIRY_PASS_INTERVAL_SECONDS", 3600) as u64,
            ),
            task_visibility_timeout: Duration::from_secs(
                env_i64("TASK_VISIBILITY_TIMEOUT_SECONDS", 120) as u64,
            ),
            task_max_attempts: env_i64("TASK_MAX_ATTEMPTS", 5) as i32,
        };
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        let pairs = [
            ("instance", &self.instance_warning_1, &self.instance_warning_2),
            ("volume", &self.volume_warning_1, &self.volume_warning_2),
            ("backup", &self.backup_warning_1, &self.backup_warning_2),
            ("boost", &self.boost_warning_1, &self.boost_warning_2),
        ];
        for (name, first, last) in pairs {
            if first.is_some() && last.is_none() {
                bail!("config error: {name} first warning configured without final warning");
            }
        }
        Ok(())
    }
}
