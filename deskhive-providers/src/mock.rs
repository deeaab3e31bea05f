//! In-memory control plane used by tests and local bring-up.
//!
//! Objects settle one poll after a state-changing call: the first `get_*`
//! after `create`/`stop`/`resize` still reports the transitional status, the
//! next one reports the settled status. That is enough to exercise every
//! delay-based polling loop in the orchestrator without sleeping.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::{
    backup_status, server_status, volume_status, BackupDetail, CloudProvider, ProviderError,
    Result, ServerDetail, ServerSpec, VolumeDetail, VolumeSpec,
};

#[derive(Clone)]
struct MockObject {
    status: String,
    next_status: Option<String>,
}

impl MockObject {
    fn new(status: &str, next: Option<&str>) -> Self {
        Self {
            status: status.to_string(),
            next_status: next.map(|s| s.to_string()),
        }
    }

    fn advance(&mut self) -> String {
        if let Some(next) = self.next_status.take() {
            let current = self.status.clone();
            self.status = next;
            return current;
        }
        self.status.clone()
    }
}

struct MockServer {
    state: MockObject,
    flavor: String,
    pending_flavor: Option<String>,
    ip_address: String,
    deleting: bool,
}

struct MockVolume {
    state: MockObject,
    zone: String,
    bootable: bool,
    name: String,
}

#[derive(Default)]
struct MockState {
    servers: HashMap<Uuid, MockServer>,
    volumes: HashMap<Uuid, MockVolume>,
    backups: HashMap<String, MockObject>,
    ip_seq: u32,
}

#[derive(Default)]
pub struct MockProvider {
    state: Mutex<MockState>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an image source volume so `find_source_volume` can match it.
    pub fn seed_source_volume(&self, name: &str, zone: &str) -> Uuid {
        let id = Uuid::new_v4();
        let mut state = self.state.lock().unwrap();
        state.volumes.insert(
            id,
            MockVolume {
                state: MockObject::new(volume_status::AVAILABLE, None),
                zone: zone.to_string(),
                bootable: true,
                name: name.to_string(),
            },
        );
        id
    }

    /// Force a server status, bypassing the settle mechanics (test hook).
    pub fn set_server_status(&self, id: Uuid, status: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(server) = state.servers.get_mut(&id) {
            server.state = MockObject::new(status, None);
        }
    }

    /// Force a volume status (test hook).
    pub fn set_volume_status(&self, id: Uuid, status: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(volume) = state.volumes.get_mut(&id) {
            volume.state = MockObject::new(status, None);
        }
    }

    pub fn server_exists(&self, id: Uuid) -> bool {
        self.state.lock().unwrap().servers.contains_key(&id)
    }

    pub fn volume_exists(&self, id: Uuid) -> bool {
        self.state.lock().unwrap().volumes.contains_key(&id)
    }
}

#[async_trait]
impl CloudProvider for MockProvider {
    async fn create_server(&self, spec: &ServerSpec) -> Result<Uuid> {
        let mut state = self.state.lock().unwrap();
        if !state.volumes.contains_key(&spec.boot_volume_id) {
            return Err(ProviderError::NotFound(format!(
                "volume {}",
                spec.boot_volume_id
            )));
        }
        let id = Uuid::new_v4();
        state.ip_seq += 1;
        let seq = state.ip_seq;
        let ip = format!("10.0.{}.{}", (seq / 250) % 250, (seq % 250) + 1);
        state.servers.insert(
            id,
            MockServer {
                state: MockObject::new(server_status::BUILD, Some(server_status::ACTIVE)),
                flavor: spec.flavor.clone(),
                pending_flavor: None,
                ip_address: ip,
                deleting: false,
            },
        );
        if let Some(volume) = state.volumes.get_mut(&spec.boot_volume_id) {
            volume.state = MockObject::new(volume_status::IN_USE, None);
        }
        Ok(id)
    }

    async fn get_server(&self, id: Uuid) -> Result<ServerDetail> {
        let mut state = self.state.lock().unwrap();
        let Some(server) = state.servers.get_mut(&id) else {
            return Err(ProviderError::NotFound(format!("server {id}")));
        };
        if server.deleting {
            state.servers.remove(&id);
            return Err(ProviderError::NotFound(format!("server {id}")));
        }
        let status = server.state.advance();
        Ok(ServerDetail {
            id,
            status,
            flavor: server.flavor.clone(),
            ip_address: Some(server.ip_address.clone()),
        })
    }

    async fn stop_server(&self, id: Uuid) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let Some(server) = state.servers.get_mut(&id) else {
            return Err(ProviderError::NotFound(format!("server {id}")));
        };
        server.state = MockObject::new(server_status::ACTIVE, Some(server_status::SHUTOFF));
        Ok(())
    }

    async fn reboot_server(&self, id: Uuid, _hard: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let Some(server) = state.servers.get_mut(&id) else {
            return Err(ProviderError::NotFound(format!("server {id}")));
        };
        server.state = MockObject::new(server_status::REBOOT, Some(server_status::ACTIVE));
        Ok(())
    }

    async fn delete_server(&self, id: Uuid) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let Some(server) = state.servers.get_mut(&id) else {
            return Err(ProviderError::NotFound(format!("server {id}")));
        };
        // The next get still sees the server; the one after that gets 404,
        // which is what a real asynchronous delete looks like.
        server.deleting = true;
        Ok(())
    }

    async fn resize_server(&self, id: Uuid, flavor: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let Some(server) = state.servers.get_mut(&id) else {
            return Err(ProviderError::NotFound(format!("server {id}")));
        };
        server.pending_flavor = Some(flavor.to_string());
        server.state = MockObject::new(server_status::RESIZE, Some(server_status::VERIFY_RESIZE));
        Ok(())
    }

    async fn confirm_resize(&self, id: Uuid) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let Some(server) = state.servers.get_mut(&id) else {
            return Err(ProviderError::NotFound(format!("server {id}")));
        };
        if let Some(flavor) = server.pending_flavor.take() {
            server.flavor = flavor;
        }
        server.state = MockObject::new(server_status::ACTIVE, None);
        Ok(())
    }

    async fn create_volume(&self, spec: &VolumeSpec) -> Result<Uuid> {
        let mut state = self.state.lock().unwrap();
        if !state.volumes.contains_key(&spec.source_volume_id) {
            return Err(ProviderError::NotFound(format!(
                "volume {}",
                spec.source_volume_id
            )));
        }
        let id = Uuid::new_v4();
        state.volumes.insert(
            id,
            MockVolume {
                state: MockObject::new(volume_status::CREATING, Some(volume_status::AVAILABLE)),
                zone: spec.zone.clone(),
                bootable: false,
                name: spec.name.clone(),
            },
        );
        Ok(id)
    }

    async fn get_volume(&self, id: Uuid) -> Result<VolumeDetail> {
        let mut state = self.state.lock().unwrap();
        let Some(volume) = state.volumes.get_mut(&id) else {
            return Err(ProviderError::NotFound(format!("volume {id}")));
        };
        let status = volume.state.advance();
        Ok(VolumeDetail {
            id,
            status,
            zone: volume.zone.clone(),
            bootable: volume.bootable,
        })
    }

    async fn set_volume_bootable(&self, id: Uuid, bootable: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let Some(volume) = state.volumes.get_mut(&id) else {
            return Err(ProviderError::NotFound(format!("volume {id}")));
        };
        volume.bootable = bootable;
        Ok(())
    }

    async fn set_volume_metadata(&self, id: Uuid, _metadata: serde_json::Value) -> Result<()> {
        let state = self.state.lock().unwrap();
        if !state.volumes.contains_key(&id) {
            return Err(ProviderError::NotFound(format!("volume {id}")));
        }
        Ok(())
    }

    async fn delete_volume(&self, id: Uuid) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.volumes.remove(&id).is_none() {
            return Err(ProviderError::NotFound(format!("volume {id}")));
        }
        Ok(())
    }

    async fn find_source_volume(&self, image_name: &str, zone: &str) -> Result<Option<Uuid>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .volumes
            .iter()
            .find(|(_, v)| {
                v.name.starts_with(image_name)
                    && v.zone == zone
                    && v.state.status == volume_status::AVAILABLE
            })
            .map(|(id, _)| *id))
    }

    async fn create_backup(&self, volume_id: Uuid, name: &str) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        if !state.volumes.contains_key(&volume_id) {
            return Err(ProviderError::NotFound(format!("volume {volume_id}")));
        }
        let id = format!("backup-{}-{}", name, Uuid::new_v4());
        state.backups.insert(
            id.clone(),
            MockObject::new(backup_status::CREATING, Some(backup_status::AVAILABLE)),
        );
        Ok(id)
    }

    async fn get_backup(&self, id: &str) -> Result<BackupDetail> {
        let mut state = self.state.lock().unwrap();
        let Some(backup) = state.backups.get_mut(id) else {
            return Err(ProviderError::NotFound(format!("backup {id}")));
        };
        let status = backup.advance();
        Ok(BackupDetail {
            id: id.to_string(),
            status,
        })
    }

    async fn delete_backup(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.backups.remove(id).is_none() {
            return Err(ProviderError::NotFound(format!("backup {id}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_spec(boot_volume_id: Uuid) -> ServerSpec {
        ServerSpec {
            name: "alice_ubuntu".to_string(),
            flavor: "m3.medium".to_string(),
            boot_volume_id,
            user_data: String::new(),
            security_groups: vec!["desktops".to_string()],
            network_id: "net-1".to_string(),
            zone: "melbourne".to_string(),
            metadata: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn volume_settles_to_available_after_one_poll() {
        let mock = MockProvider::new();
        let source = mock.seed_source_volume("ubuntu-jammy", "melbourne");
        let id = mock
            .create_volume(&VolumeSpec {
                name: "alice_ubuntu".to_string(),
                size_gb: 30,
                source_volume_id: source,
                zone: "melbourne".to_string(),
                metadata: serde_json::json!({}),
            })
            .await
            .unwrap();

        assert_eq!(
            mock.get_volume(id).await.unwrap().status,
            volume_status::CREATING
        );
        assert_eq!(
            mock.get_volume(id).await.unwrap().status,
            volume_status::AVAILABLE
        );
    }

    #[tokio::test]
    async fn server_lifecycle_build_active_shutoff_gone() {
        let mock = MockProvider::new();
        let source = mock.seed_source_volume("ubuntu-jammy", "melbourne");
        let id = mock.create_server(&server_spec(source)).await.unwrap();

        assert_eq!(mock.get_server(id).await.unwrap().status, server_status::BUILD);
        assert_eq!(mock.get_server(id).await.unwrap().status, server_status::ACTIVE);

        mock.stop_server(id).await.unwrap();
        mock.get_server(id).await.unwrap();
        assert_eq!(mock.get_server(id).await.unwrap().status, server_status::SHUTOFF);

        mock.delete_server(id).await.unwrap();
        assert!(matches!(
            mock.get_server(id).await,
            Err(ProviderError::NotFound(_))
        ));
        // Repeated teardown of an already-gone server keeps reporting 404.
        assert!(mock.delete_server(id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn resize_reports_verify_then_new_flavor_on_confirm() {
        let mock = MockProvider::new();
        let source = mock.seed_source_volume("ubuntu-jammy", "melbourne");
        let id = mock.create_server(&server_spec(source)).await.unwrap();
        mock.get_server(id).await.unwrap();

        mock.resize_server(id, "m3.xlarge").await.unwrap();
        mock.get_server(id).await.unwrap();
        let detail = mock.get_server(id).await.unwrap();
        assert_eq!(detail.status, server_status::VERIFY_RESIZE);
        assert_eq!(detail.flavor, "m3.medium");

        mock.confirm_resize(id).await.unwrap();
        let detail = mock.get_server(id).await.unwrap();
        assert_eq!(detail.status, server_status::ACTIVE);
        assert_eq!(detail.flavor, "m3.xlarge");
    }

    #[tokio::test]
    async fn backup_settles_and_deletes() {
        let mock = MockProvider::new();
        let source = mock.seed_source_volume("ubuntu-jammy", "melbourne");
        let backup = mock.create_backup(source, "archive").await.unwrap();
        assert_eq!(
            mock.get_backup(&backup).await.unwrap().status,
            backup_status::CREATING
        );
        assert_eq!(
            mock.get_backup(&backup).await.unwrap().status,
            backup_status::AVAILABLE
        );
        mock.delete_backup(&backup).await.unwrap();
        assert!(mock.get_backup(&backup).await.unwrap_err().is_not_found());
    }
}
