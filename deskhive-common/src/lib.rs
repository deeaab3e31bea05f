use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod bus;

// --- Enums ---

/// User-visible desktop state. This is the single authoritative state shown
/// to the user; background flows and the read-path reconciliation are the
/// only writers.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "vm_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    NoVm,       // nothing to show (also the post-delete state)
    Creating,   // create workflow in flight
    Waiting,    // teardown/reboot workflow in flight
    Resizing,   // resize workflow in flight
    Okay,       // ready, default flavor
    Supersized, // ready, boosted flavor
    Shelved,    // volume retained, instance torn down
    Error,      // operator attention required
    Missing,    // expected instance record absent
    Shutdown,   // control plane reports powered off unexpectedly
}

impl sqlx::postgres::PgHasArrayType for VmState {
    fn array_type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("_vm_state")
    }
}

impl VmState {
    /// Resting states do not block a new lifecycle cycle for the same
    /// (user, desktop type) pair.
    pub fn is_resting(self) -> bool {
        matches!(self, VmState::NoVm | VmState::Shelved)
    }

    pub fn is_ready(self) -> bool {
        matches!(self, VmState::Okay | VmState::Supersized)
    }

    pub fn in_flight(self) -> bool {
        matches!(self, VmState::Creating | VmState::Waiting | VmState::Resizing)
    }
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VmState::NoVm => "No_VM",
            VmState::Creating => "VM_Creating",
            VmState::Waiting => "VM_Waiting",
            VmState::Resizing => "VM_Resizing",
            VmState::Okay => "VM_Okay",
            VmState::Supersized => "VM_Supersized",
            VmState::Shelved => "VM_Shelved",
            VmState::Error => "VM_Error",
            VmState::Missing => "VM_Missing",
            VmState::Shutdown => "VM_Shutdown",
        };
        f.write_str(s)
    }
}

/// Position within the notify-then-act retirement state machine.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "expiry_stage", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExpiryStage {
    Initial,
    FirstWarning,
    FinalWarning,
    Expiring,
    Completed,
    Failed,
    FailedRetryable,
}

impl ExpiryStage {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExpiryStage::Completed | ExpiryStage::Failed)
    }

    /// True once a warning has gone out but the action has not completed,
    /// i.e. the stage a user-facing "expiring soon" banner keys off.
    pub fn is_warned(self) -> bool {
        matches!(
            self,
            ExpiryStage::FirstWarning | ExpiryStage::FinalWarning | ExpiryStage::Expiring
        )
    }
}

/// Outcome reported by workflow entry points that the expiry engine (and
/// end-of-workflow hooks) map onto terminal expiration stages.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WfOutcome {
    /// Workflow completed.
    Success,
    /// Workflow continues via scheduled steps; terminal outcome comes later.
    Continue,
    /// Failed, worth retrying on a later pass.
    Retry,
    /// Failed, not retryable.
    Fail,
}

// --- Entities (SQLx mapped) ---

/// Storage volume record. The id is shared with the control-plane volume.
#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
pub struct Volume {
    pub id: Uuid,
    pub username: String,
    pub created: DateTime<Utc>,
    pub marked_for_deletion: Option<DateTime<Utc>>,
    pub deleted: Option<DateTime<Utc>>,
    pub error_flag: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub expiration_id: Option<i64>,
    pub image: String,
    pub operating_system: String,
    pub flavor: String,
    pub zone: String,
    pub requesting_feature: String,
    pub checked_in: bool,
    pub ready: bool,
    pub hostname_id: Option<String>,
    pub shelved_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
    pub backup_id: Option<String>,
    pub rebooted_at: Option<DateTime<Utc>>,
}

/// Compute instance record. Refers to, but does not own, its boot volume:
/// the volume outlives the instance across shelve/unshelve cycles.
#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
pub struct Instance {
    pub id: Uuid,
    pub username: String,
    pub created: DateTime<Utc>,
    pub marked_for_deletion: Option<DateTime<Utc>>,
    pub deleted: Option<DateTime<Utc>>,
    pub error_flag: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub expiration_id: Option<i64>,
    pub boot_volume_id: Uuid,
    pub ip_address: Option<String>,
    pub gateway_connection_id: Option<i64>,
    pub login_username: String,
    pub login_password: String,
}

/// One "performance boost" episode. Current iff `reverted` is null and the
/// instance is not deleted.
#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
pub struct Resize {
    pub id: i64,
    pub instance_id: Uuid,
    pub requested: DateTime<Utc>,
    pub expiration_id: Option<i64>,
    pub reverted: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
pub struct VmStatus {
    pub id: i64,
    pub username: String,
    pub created: DateTime<Utc>,
    pub requesting_feature: String,
    pub operating_system: String,
    pub instance_id: Option<Uuid>,
    pub status: VmState,
    pub status_message: Option<String>,
    pub status_progress: i32,
    pub status_done: Option<String>,
    pub wait_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
pub struct Expiration {
    pub id: i64,
    pub expires: DateTime<Utc>,
    pub stage: ExpiryStage,
    pub stage_date: DateTime<Utc>,
}

// --- Desktop catalog (read-only) ---

#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
pub struct DesktopType {
    pub id: String,
    pub name: String,
    pub image_name: String,
    pub default_flavor: String,
    pub big_flavor: String,
    pub volume_size_gb: i32,
    pub feature: String,
    pub security_groups: sqlx::types::Json<Vec<String>>,
    pub default_zone: String,
    pub is_active: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
pub struct AvailabilityZone {
    pub name: String,
    pub network_id: String,
    pub is_active: bool,
}
