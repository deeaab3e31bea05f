use async_trait::async_trait;
use uuid::Uuid;

/// Control-plane server status values the orchestration core cares about.
/// These mirror the wire values; the control plane defines more, but anything
/// outside this set is "unexpected" for a managed desktop.
pub mod server_status {
    pub const ACTIVE: &str = "ACTIVE";
    pub const BUILD: &str = "BUILD";
    pub const REBOOT: &str = "REBOOT";
    pub const RESIZE: &str = "RESIZE";
    pub const VERIFY_RESIZE: &str = "VERIFY_RESIZE";
    pub const SHUTOFF: &str = "SHUTOFF";
    pub const ERROR: &str = "ERROR";
}

pub mod volume_status {
    pub const AVAILABLE: &str = "available";
    pub const IN_USE: &str = "in-use";
    pub const CREATING: &str = "creating";
    pub const MAINTENANCE: &str = "maintenance";
}

pub mod backup_status {
    pub const AVAILABLE: &str = "available";
    pub const CREATING: &str = "creating";
    pub const ERROR: &str = "error";
}

/// Control-plane errors. The orchestration core depends on "not found" being
/// distinguishable from every other failure: on teardown paths it means
/// "already done" and the workflow advances instead of failing.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("{0} not found on control plane")]
    NotFound(String),
    #[error("control plane rejected the request: {0}")]
    Api(String),
    #[error("control plane transport error: {0}")]
    Transport(String),
}

impl ProviderError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, ProviderError>;

#[derive(Clone, Debug)]
pub struct ServerDetail {
    pub id: Uuid,
    pub status: String,
    pub flavor: String,
    pub ip_address: Option<String>,
}

#[derive(Clone, Debug)]
pub struct VolumeDetail {
    pub id: Uuid,
    pub status: String,
    pub zone: String,
    pub bootable: bool,
}

#[derive(Clone, Debug)]
pub struct BackupDetail {
    pub id: String,
    pub status: String,
}

/// Parameters for a new server backed by an existing boot volume.
#[derive(Clone, Debug)]
pub struct ServerSpec {
    pub name: String,
    pub flavor: String,
    pub boot_volume_id: Uuid,
    pub user_data: String,
    pub security_groups: Vec<String>,
    pub network_id: String,
    pub zone: String,
    pub metadata: serde_json::Value,
}

/// Parameters for a new volume cloned from a source (image) volume.
#[derive(Clone, Debug)]
pub struct VolumeSpec {
    pub name: String,
    pub size_gb: i32,
    pub source_volume_id: Uuid,
    pub zone: String,
    pub metadata: serde_json::Value,
}

/// The remote cloud control plane. One handle is constructed at process
/// start and passed into every workflow/service call.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    // Servers
    async fn create_server(&self, spec: &ServerSpec) -> Result<Uuid>;
    async fn get_server(&self, id: Uuid) -> Result<ServerDetail>;
    async fn stop_server(&self, id: Uuid) -> Result<()>;
    async fn reboot_server(&self, id: Uuid, hard: bool) -> Result<()>;
    async fn delete_server(&self, id: Uuid) -> Result<()>;
    async fn resize_server(&self, id: Uuid, flavor: &str) -> Result<()>;
    async fn confirm_resize(&self, id: Uuid) -> Result<()>;

    // Volumes
    async fn create_volume(&self, spec: &VolumeSpec) -> Result<Uuid>;
    async fn get_volume(&self, id: Uuid) -> Result<VolumeDetail>;
    async fn set_volume_bootable(&self, id: Uuid, bootable: bool) -> Result<()>;
    async fn set_volume_metadata(&self, id: Uuid, metadata: serde_json::Value) -> Result<()>;
    async fn delete_volume(&self, id: Uuid) -> Result<()>;

    /// Find the newest available source volume whose name starts with
    /// `image_name` in the given zone. Returns None when no match exists.
    async fn find_source_volume(&self, image_name: &str, zone: &str) -> Result<Option<Uuid>>;

    // Backups
    async fn create_backup(&self, volume_id: Uuid, name: &str) -> Result<String>;
    async fn get_backup(&self, id: &str) -> Result<BackupDetail>;
    async fn delete_backup(&self, id: &str) -> Result<()>;
}

pub mod mock;
pub mod openstack;
