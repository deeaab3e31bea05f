//! OpenStack-style control plane over plain REST.
//!
//! Authentication uses an application credential against the identity
//! service; the token is cached and refreshed once on a 401. Endpoint URLs
//! are supplied by configuration instead of being discovered from the
//! service catalog, which keeps the client to the handful of calls the
//! orchestrator actually makes.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, Method, StatusCode};
use serde_json::json;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    BackupDetail, CloudProvider, ProviderError, Result, ServerDetail, ServerSpec, VolumeDetail,
    VolumeSpec,
};

#[derive(Clone, Debug)]
pub struct OpenStackConfig {
    pub auth_url: String,
    pub application_credential_id: String,
    pub application_credential_secret: String,
    pub compute_url: String,
    pub volume_url: String,
}

pub struct OpenStackProvider {
    client: Client,
    config: OpenStackConfig,
    token: RwLock<String>,
}

impl OpenStackProvider {
    pub async fn connect(config: OpenStackConfig) -> Result<Self> {
        // No overall timeout on the default client; if the control plane
        // stalls, a workflow step would hang past its scheduling slot.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        let token = authenticate(&client, &config).await?;
        Ok(Self {
            client,
            config,
            token: RwLock::new(token),
        })
    }

    async fn call(
        &self,
        method: Method,
        url: &str,
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response> {
        for attempt in 0..2 {
            let token = self.token.read().await.clone();
            let mut req = self
                .client
                .request(method.clone(), url)
                .header("X-Auth-Token", token)
                .header("Content-Type", "application/json");
            if let Some(body) = &body {
                req = req.json(body);
            }
            let resp = req
                .send()
                .await
                .map_err(|e| ProviderError::Transport(e.to_string()))?;

            if resp.status() == StatusCode::UNAUTHORIZED && attempt == 0 {
                let fresh = authenticate(&self.client, &self.config).await?;
                *self.token.write().await = fresh;
                continue;
            }
            return Ok(resp);
        }
        unreachable!("token refresh loop runs at most twice")
    }

    async fn expect_json(
        &self,
        method: Method,
        url: &str,
        body: Option<serde_json::Value>,
        what: &str,
    ) -> Result<serde_json::Value> {
        let resp = self.call(method, url, body).await?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound(what.to_string()));
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Api(format!("{what}: {status} - {text}")));
        }
        resp.json()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))
    }

    async fn expect_ok(
        &self,
        method: Method,
        url: &str,
        body: Option<serde_json::Value>,
        what: &str,
    ) -> Result<()> {
        let resp = self.call(method, url, body).await?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound(what.to_string()));
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Api(format!("{what}: {status} - {text}")));
        }
        Ok(())
    }

    async fn server_action(&self, id: Uuid, action: serde_json::Value, what: &str) -> Result<()> {
        let url = format!("{}/servers/{}/action", self.config.compute_url, id);
        self.expect_ok(Method::POST, &url, Some(action), what).await
    }
}

async fn authenticate(client: &Client, config: &OpenStackConfig) -> Result<String> {
    let url = format!("{}/v3/auth/tokens", config.auth_url.trim_end_matches('/'));
    let body = json!({
        "auth": {
            "identity": {
                "methods": ["application_credential"],
                "application_credential": {
                    "id": config.application_credential_id,
                    "secret": config.application_credential_secret,
                }
            }
        }
    });
    let resp = client
        .post(&url)
        .json(&body)
        .send()
        .await
        .map_err(|e| ProviderError::Transport(e.to_string()))?;
    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        return Err(ProviderError::Api(format!(
            "authentication failed: {status} - {text}"
        )));
    }
    let token = resp
        .headers()
        .get("X-Subject-Token")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .ok_or_else(|| ProviderError::Api("no X-Subject-Token in auth response".to_string()))?;
    Ok(token)
}

fn parse_uuid(value: &serde_json::Value, pointer: &str, what: &str) -> Result<Uuid> {
    value
        .pointer(pointer)
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| ProviderError::Api(format!("{what}: malformed id in response")))
}

fn first_address(server: &serde_json::Value) -> Option<String> {
    let addresses = server.pointer("/server/addresses")?.as_object()?;
    for (_net, addrs) in addresses {
        if let Some(addr) = addrs
            .as_array()
            .and_then(|a| a.first())
            .and_then(|a| a.get("addr"))
            .and_then(|a| a.as_str())
        {
            return Some(addr.to_string());
        }
    }
    None
}

#[async_trait]
impl CloudProvider for OpenStackProvider {
    async fn create_server(&self, spec: &ServerSpec) -> Result<Uuid> {
        let url = format!("{}/servers", self.config.compute_url);
        let user_data = base64::engine::general_purpose::STANDARD.encode(&spec.user_data);
        let body = json!({
            "server": {
                "name": spec.name,
                "flavorRef": spec.flavor,
                "user_data": user_data,
                "security_groups": spec.security_groups.iter()
                    .map(|g| json!({"name": g})).collect::<Vec<_>>(),
                "networks": [{"uuid": spec.network_id}],
                "availability_zone": spec.zone,
                "metadata": spec.metadata,
                "block_device_mapping_v2": [{
                    "source_type": "volume",
                    "destination_type": "volume",
                    "delete_on_termination": false,
                    "uuid": spec.boot_volume_id,
                    "boot_index": "0",
                }],
            }
        });
        let v = self
            .expect_json(Method::POST, &url, Some(body), "create server")
            .await?;
        parse_uuid(&v, "/server/id", "create server")
    }

    async fn get_server(&self, id: Uuid) -> Result<ServerDetail> {
        let url = format!("{}/servers/{}", self.config.compute_url, id);
        let what = format!("server {id}");
        let v = self.expect_json(Method::GET, &url, None, &what).await?;
        let status = v
            .pointer("/server/status")
            .and_then(|s| s.as_str())
            .unwrap_or_default()
            .to_string();
        let flavor = v
            .pointer("/server/flavor/id")
            .and_then(|s| s.as_str())
            .unwrap_or_default()
            .to_string();
        Ok(ServerDetail {
            id,
            status,
            flavor,
            ip_address: first_address(&v),
        })
    }

    async fn stop_server(&self, id: Uuid) -> Result<()> {
        self.server_action(id, json!({"os-stop": null}), &format!("stop server {id}"))
            .await
    }

    async fn reboot_server(&self, id: Uuid, hard: bool) -> Result<()> {
        let kind = if hard { "HARD" } else { "SOFT" };
        self.server_action(
            id,
            json!({"reboot": {"type": kind}}),
            &format!("reboot server {id}"),
        )
        .await
    }

    async fn delete_server(&self, id: Uuid) -> Result<()> {
        let url = format!("{}/servers/{}", self.config.compute_url, id);
        self.expect_ok(Method::DELETE, &url, None, &format!("server {id}"))
            .await
    }

    async fn resize_server(&self, id: Uuid, flavor: &str) -> Result<()> {
        self.server_action(
            id,
            json!({"resize": {"flavorRef": flavor}}),
            &format!("resize server {id}"),
        )
        .await
    }

    async fn confirm_resize(&self, id: Uuid) -> Result<()> {
        self.server_action(
            id,
            json!({"confirmResize": null}),
            &format!("confirm resize of server {id}"),
        )
        .await
    }

    async fn create_volume(&self, spec: &VolumeSpec) -> Result<Uuid> {
        let url = format!("{}/volumes", self.config.volume_url);
        let body = json!({
            "volume": {
                "name": spec.name,
                "size": spec.size_gb,
                "source_volid": spec.source_volume_id,
                "availability_zone": spec.zone,
                "metadata": spec.metadata,
            }
        });
        let v = self
            .expect_json(Method::POST, &url, Some(body), "create volume")
            .await?;
        parse_uuid(&v, "/volume/id", "create volume")
    }

    async fn get_volume(&self, id: Uuid) -> Result<VolumeDetail> {
        let url = format!("{}/volumes/{}", self.config.volume_url, id);
        let what = format!("volume {id}");
        let v = self.expect_json(Method::GET, &url, None, &what).await?;
        Ok(VolumeDetail {
            id,
            status: v
                .pointer("/volume/status")
                .and_then(|s| s.as_str())
                .unwrap_or_default()
                .to_string(),
            zone: v
                .pointer("/volume/availability_zone")
                .and_then(|s| s.as_str())
                .unwrap_or_default()
                .to_string(),
            bootable: v
                .pointer("/volume/bootable")
                .and_then(|s| s.as_str())
                .map(|s| s == "true")
                .unwrap_or(false),
        })
    }

    async fn set_volume_bootable(&self, id: Uuid, bootable: bool) -> Result<()> {
        let url = format!("{}/volumes/{}/action", self.config.volume_url, id);
        self.expect_ok(
            Method::POST,
            &url,
            Some(json!({"os-set_bootable": {"bootable": bootable}})),
            &format!("set bootable on volume {id}"),
        )
        .await
    }

    async fn set_volume_metadata(&self, id: Uuid, metadata: serde_json::Value) -> Result<()> {
        let url = format!("{}/volumes/{}/metadata", self.config.volume_url, id);
        self.expect_ok(
            Method::POST,
            &url,
            Some(json!({"metadata": metadata})),
            &format!("set metadata on volume {id}"),
        )
        .await
    }

    async fn delete_volume(&self, id: Uuid) -> Result<()> {
        let url = format!("{}/volumes/{}", self.config.volume_url, id);
        self.expect_ok(Method::DELETE, &url, None, &format!("volume {id}"))
            .await
    }

    async fn find_source_volume(&self, image_name: &str, zone: &str) -> Result<Option<Uuid>> {
        let url = format!(
            "{}/volumes/detail?status=available",
            self.config.volume_url
        );
        let v = self
            .expect_json(Method::GET, &url, None, "list source volumes")
            .await?;
        let volumes = v
            .pointer("/volumes")
            .and_then(|x| x.as_array())
            .cloned()
            .unwrap_or_default();

        // Server-side name filtering is unreliable, so filter here: prefix
        // match on the image name, then the highest build number wins.
        let mut best: Option<(i64, Uuid)> = None;
        for vol in volumes {
            let name = vol.get("name").and_then(|x| x.as_str()).unwrap_or_default();
            let az = vol
                .get("availability_zone")
                .and_then(|x| x.as_str())
                .unwrap_or_default();
            if !name.starts_with(image_name) || az != zone {
                continue;
            }
            let Some(id) = vol
                .get("id")
                .and_then(|x| x.as_str())
                .and_then(|s| Uuid::parse_str(s).ok())
            else {
                continue;
            };
            let build = vol
                .pointer("/metadata/build")
                .and_then(|x| x.as_str())
                .and_then(|s| s.parse::<i64>().ok())
                .unwrap_or(0);
            if best.map(|(b, _)| build > b).unwrap_or(true) {
                best = Some((build, id));
            }
        }
        Ok(best.map(|(_, id)| id))
    }

    async fn create_backup(&self, volume_id: Uuid, name: &str) -> Result<String> {
        let url = format!("{}/backups", self.config.volume_url);
        let body = json!({"backup": {"volume_id": volume_id, "name": name}});
        let what = format!("backup of volume {volume_id}");
        let v = self.expect_json(Method::POST, &url, Some(body), &what).await?;
        v.pointer("/backup/id")
            .and_then(|x| x.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| ProviderError::Api(format!("{what}: malformed id in response")))
    }

    async fn get_backup(&self, id: &str) -> Result<BackupDetail> {
        let url = format!("{}/backups/{}", self.config.volume_url, id);
        let what = format!("backup {id}");
        let v = self.expect_json(Method::GET, &url, None, &what).await?;
        Ok(BackupDetail {
            id: id.to_string(),
            status: v
                .pointer("/backup/status")
                .and_then(|s| s.as_str())
                .unwrap_or_default()
                .to_string(),
        })
    }

    async fn delete_backup(&self, id: &str) -> Result<()> {
        let url = format!("{}/backups/{}", self.config.volume_url, id);
        self.expect_ok(Method::DELETE, &url, None, &format!("backup {id}"))
            .await
    }
}
