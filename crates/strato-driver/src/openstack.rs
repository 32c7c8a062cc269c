use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Value};
use strato_model::{Node, PortRecord, RuleSource, SecurityGroup, SecurityGroupRule};
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::driver::{CloudDriver, DriverOptions, NullRecorder, ResourceRecorder};
use crate::error::DriverError;

const NAMESPACE_KEY: &str = "strato_namespace";

/// Poll interval while waiting for a volume to become available.
const VOLUME_POLL: Duration = Duration::from_secs(3);

// ── Credentials ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OpenStackCredentials {
    pub username: String,
    pub password: String,
    pub auth_url: String,
    pub tenant_name: String,
    pub region: Option<String>,
}

impl OpenStackCredentials {
    /// Read the standard `OS_*` environment variables.
    pub fn from_env() -> Result<Self, DriverError> {
        let var = |name: &str| {
            std::env::var(name)
                .map_err(|_| DriverError::Config(format!("{} is not set", name)))
        };
        Ok(Self {
            username: var("OS_USERNAME")?,
            password: var("OS_PASSWORD")?,
            auth_url: var("OS_AUTH_URL")?,
            tenant_name: var("OS_TENANT_NAME")?,
            region: std::env::var("OS_REGION_NAME").ok(),
        })
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Endpoints {
    nova: String,
    neutron: String,
    cinder: String,
}

#[derive(Debug, Clone)]
struct Session {
    token: String,
    endpoints: Endpoints,
}

// ── OpenStackDriver ───────────────────────────────────────────────────────────

/// Driver for OpenStack clouds.
///
/// Beyond the common [`CloudDriver`] surface this exposes the per-resource
/// create/delete API the provisioning runner composes: ports, floating IPs,
/// networks with subnets, security groups with inline rules, keypairs,
/// volumes and servers. Every successful create is pushed into the
/// [`ResourceRecorder`] under its type tag so a cleanup pass can roll the
/// deployment back in reverse order.
pub struct OpenStackDriver {
    options: DriverOptions,
    creds: Option<OpenStackCredentials>,
    client: reqwest::Client,
    recorder: Arc<dyn ResourceRecorder>,
    session: OnceCell<Session>,
}

impl OpenStackDriver {
    pub fn new(creds: OpenStackCredentials, options: DriverOptions) -> Self {
        Self {
            options,
            creds: Some(creds),
            client: reqwest::Client::new(),
            recorder: Arc::new(NullRecorder),
            session: OnceCell::new(),
        }
    }

    /// Replace the recorder; the runner wires its cleanup journal in here.
    pub fn with_recorder(mut self, recorder: Arc<dyn ResourceRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    /// Skip Keystone and talk to fixed service endpoints with a
    /// pre-issued token. Used against clouds without a service catalog,
    /// and by tests pointing at a mock server.
    pub fn with_session(
        token: impl Into<String>,
        nova: String,
        neutron: String,
        cinder: String,
        options: DriverOptions,
    ) -> Self {
        let driver = Self {
            options,
            creds: None,
            client: reqwest::Client::new(),
            recorder: Arc::new(NullRecorder),
            session: OnceCell::new(),
        };
        driver
            .session
            .set(Session {
                token: token.into(),
                endpoints: Endpoints { nova, neutron, cinder },
            })
            .expect("fresh cell");
        driver
    }

    // ── Keystone ──────────────────────────────────────────────────────────────

    async fn session(&self) -> Result<&Session, DriverError> {
        self.session
            .get_or_try_init(|| async {
                let creds = self
                    .creds
                    .as_ref()
                    .ok_or_else(|| DriverError::Config("no OpenStack credentials".into()))?;
                authenticate(&self.client, creds).await
            })
            .await
    }

    // ── HTTP plumbing ─────────────────────────────────────────────────────────

    async fn get(&self, url: String) -> Result<Value, DriverError> {
        let session = self.session().await?;
        let resp = self
            .client
            .get(&url)
            .header("X-Auth-Token", &session.token)
            .send()
            .await
            .map_err(|e| DriverError::DetectFailed(format!("GET {}: {}", url, e)))?;
        let status = resp.status().as_u16();
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        if status >= 400 {
            return Err(DriverError::DetectFailed(os_error(&url, status, &body)));
        }
        Ok(body)
    }

    async fn post(&self, url: String, body: &Value) -> Result<(u16, Value), DriverError> {
        let session = self.session().await?;
        let resp = self
            .client
            .post(&url)
            .header("X-Auth-Token", &session.token)
            .json(body)
            .send()
            .await
            .map_err(|e| DriverError::CreateFailed(format!("POST {}: {}", url, e)))?;
        let status = resp.status().as_u16();
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        Ok((status, body))
    }

    async fn put(&self, url: String, body: &Value) -> Result<(u16, Value), DriverError> {
        let session = self.session().await?;
        let resp = self
            .client
            .put(&url)
            .header("X-Auth-Token", &session.token)
            .json(body)
            .send()
            .await
            .map_err(|e| DriverError::CreateFailed(format!("PUT {}: {}", url, e)))?;
        let status = resp.status().as_u16();
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        Ok((status, body))
    }

    /// DELETE returning the status code so callers can react to 409.
    async fn delete_raw(&self, url: String) -> Result<u16, DriverError> {
        let session = self.session().await?;
        let resp = self
            .client
            .delete(&url)
            .header("X-Auth-Token", &session.token)
            .send()
            .await
            .map_err(|e| DriverError::DeleteFailed(format!("DELETE {}: {}", url, e)))?;
        Ok(resp.status().as_u16())
    }

    async fn delete(&self, url: String) -> Result<(), DriverError> {
        let status = self.delete_raw(url.clone()).await?;
        if status >= 400 {
            return Err(DriverError::DeleteFailed(format!("{}: HTTP {}", url, status)));
        }
        Ok(())
    }

    async fn nova(&self, path: &str) -> Result<String, DriverError> {
        Ok(format!("{}{}", self.session().await?.endpoints.nova, path))
    }

    async fn neutron(&self, path: &str) -> Result<String, DriverError> {
        Ok(format!("{}{}", self.session().await?.endpoints.neutron, path))
    }

    async fn cinder(&self, path: &str) -> Result<String, DriverError> {
        Ok(format!("{}{}", self.session().await?.endpoints.cinder, path))
    }

    fn record(&self, resource_type: &str, id: &str) {
        self.recorder.record(resource_type, id);
    }

    // ── Inventory ─────────────────────────────────────────────────────────────

    pub async fn get_networks(&self) -> Result<Vec<Value>, DriverError> {
        let body = self.get(self.neutron("/v2.0/networks").await?).await?;
        Ok(array_of(&body, "networks"))
    }

    pub async fn get_ports(&self) -> Result<Vec<Value>, DriverError> {
        let body = self.get(self.neutron("/v2.0/ports").await?).await?;
        Ok(array_of(&body, "ports"))
    }

    pub async fn get_floating_ips(&self) -> Result<Vec<Value>, DriverError> {
        let body = self.get(self.neutron("/v2.0/floatingips").await?).await?;
        Ok(array_of(&body, "floatingips"))
    }

    pub async fn get_security_groups(&self) -> Result<Vec<Value>, DriverError> {
        let body = self.get(self.neutron("/v2.0/security-groups").await?).await?;
        Ok(array_of(&body, "security_groups"))
    }

    pub async fn get_servers(&self) -> Result<Vec<Value>, DriverError> {
        let body = self.get(self.nova("/servers/detail").await?).await?;
        Ok(array_of(&body, "servers"))
    }

    // ── Ports and floating IPs ────────────────────────────────────────────────

    pub async fn create_port(
        &self,
        name: &str,
        network: &str,
        network_id: &str,
        secgroup_ids: &[String],
    ) -> Result<PortRecord, DriverError> {
        let body = json!({
            "port": {
                "name": name,
                "admin_state_up": true,
                "network_id": network_id,
                "security_groups": secgroup_ids,
            }
        });
        let (status, resp) = self.post(self.neutron("/v2.0/ports").await?, &body).await?;
        if status >= 400 {
            return Err(DriverError::CreateFailed(os_error("ports", status, &resp)));
        }
        let port = &resp["port"];
        let id = port["id"].as_str().unwrap_or_default().to_string();
        self.record("port", &id);
        Ok(PortRecord {
            id,
            fixed_ip: port["fixed_ips"][0]["ip_address"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
            mac: port["mac_address"].as_str().unwrap_or_default().to_string(),
            network_name: network.to_string(),
            floating_ip: None,
        })
    }

    /// Allocate a floating IP from the first external network Neutron lists.
    pub async fn find_floating_network(&self) -> Result<String, DriverError> {
        let body = self
            .get(self.neutron("/v2.0/networks?router:external=True").await?)
            .await?;
        array_of(&body, "networks")
            .first()
            .and_then(|n| n["id"].as_str())
            .map(str::to_string)
            .ok_or_else(|| DriverError::CreateFailed("no external network found".into()))
    }

    pub async fn create_floating_ip(&self) -> Result<(String, String), DriverError> {
        let floating_network = self.find_floating_network().await?;
        let body = json!({"floatingip": {"floating_network_id": floating_network}});
        let (status, resp) = self
            .post(self.neutron("/v2.0/floatingips").await?, &body)
            .await?;
        if status >= 400 {
            return Err(DriverError::CreateFailed(os_error("floatingips", status, &resp)));
        }
        let id = resp["floatingip"]["id"].as_str().unwrap_or_default().to_string();
        let address = resp["floatingip"]["floating_ip_address"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        self.record("floatingip", &id);
        Ok((id, address))
    }

    pub async fn associate_floating_ip(
        &self,
        port_id: &str,
        fip_id: &str,
    ) -> Result<(), DriverError> {
        let url = self.neutron(&format!("/v2.0/floatingips/{}", fip_id)).await?;
        let (status, resp) = self
            .put(url, &json!({"floatingip": {"port_id": port_id}}))
            .await?;
        if status >= 400 {
            return Err(DriverError::CreateFailed(os_error("floatingips", status, &resp)));
        }
        Ok(())
    }

    // ── Networks ──────────────────────────────────────────────────────────────

    /// Create a network and its subnet; attach the subnet to the wildcard
    /// router if the mappings name one. Returns the network id.
    pub async fn create_network(
        &self,
        name: &str,
        cidr: &str,
        mappings: &strato_config::cloud::Mappings,
    ) -> Result<String, DriverError> {
        let body = json!({"network": {"name": name, "admin_state_up": true}});
        let (status, resp) = self.post(self.neutron("/v2.0/networks").await?, &body).await?;
        if status >= 400 {
            return Err(DriverError::CreateFailed(os_error("networks", status, &resp)));
        }
        let network_id = resp["network"]["id"].as_str().unwrap_or_default().to_string();
        self.record("network", &network_id);

        let subnet_body = json!({
            "subnet": {
                "network_id": network_id,
                "ip_version": 4,
                "cidr": cidr,
                "name": name,
            }
        });
        let (status, resp) = self
            .post(self.neutron("/v2.0/subnets").await?, &subnet_body)
            .await?;
        if status >= 400 {
            return Err(DriverError::CreateFailed(os_error("subnets", status, &resp)));
        }
        let subnet_id = resp["subnet"]["id"].as_str().unwrap_or_default().to_string();
        self.record("subnet", &subnet_id);

        if let Some(router) = mappings.get("routers", "*") {
            let url = self
                .neutron(&format!("/v2.0/routers/{}/add_router_interface", router))
                .await?;
            let (status, resp) = self.put(url, &json!({"subnet_id": subnet_id})).await?;
            if status >= 400 {
                return Err(DriverError::CreateFailed(os_error("routers", status, &resp)));
            }
        }

        Ok(network_id)
    }

    // ── Security groups ───────────────────────────────────────────────────────

    /// Create a security group with its rules inline. `secgroups` maps base
    /// names to ids of groups created earlier in the run, letting a rule's
    /// `source_group` reference them.
    pub async fn create_security_group_with_rules(
        &self,
        base_name: &str,
        name: &str,
        rules: &[strato_config::raw::RawRule],
        secgroups: &mut HashMap<String, String>,
    ) -> Result<String, DriverError> {
        let body = json!({"security_group": {"name": name}});
        let (status, resp) = self
            .post(self.neutron("/v2.0/security-groups").await?, &body)
            .await?;
        if status >= 400 {
            return Err(DriverError::CreateFailed(os_error("security-groups", status, &resp)));
        }
        let group_id = resp["security_group"]["id"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        self.record("secgroup", &group_id);
        secgroups.insert(base_name.to_string(), group_id.clone());

        for rule in rules {
            let mut rule_body = json!({
                "direction": "ingress",
                "ethertype": "IPv4",
                "port_range_min": rule.from_port,
                "port_range_max": rule.to_port,
                "protocol": rule.protocol,
                "security_group_id": group_id,
            });
            match (&rule.source_group, &rule.cidr) {
                (Some(source_group), _) => {
                    // an unknown name is passed through as a literal id
                    let remote = secgroups
                        .get(source_group)
                        .cloned()
                        .unwrap_or_else(|| source_group.clone());
                    rule_body["remote_group_id"] = json!(remote);
                }
                (None, Some(cidr)) => {
                    rule_body["remote_ip_prefix"] = json!(cidr);
                }
                (None, None) => {}
            }

            let (status, resp) = self
                .post(
                    self.neutron("/v2.0/security-group-rules").await?,
                    &json!({"security_group_rule": rule_body}),
                )
                .await?;
            if status >= 400 {
                return Err(DriverError::CreateFailed(os_error(
                    "security-group-rules",
                    status,
                    &resp,
                )));
            }
            let rule_id = resp["security_group_rule"]["id"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            self.record("secgroup_rule", &rule_id);
        }

        Ok(group_id)
    }

    // ── Keypairs ──────────────────────────────────────────────────────────────

    /// Idempotent on conflict; arbitrary failures are retried up to
    /// `retry_count` extra times.
    pub async fn create_keypair(
        &self,
        name: &str,
        keydata: &str,
        retry_count: u32,
    ) -> Result<(), DriverError> {
        let mut attempts_left = retry_count + 1;
        loop {
            let body = json!({"keypair": {"name": name, "public_key": keydata}});
            let result = self.post(self.nova("/os-keypairs").await?, &body).await;
            match result {
                Ok((status, _)) if status == 409 => return Ok(()),
                Ok((status, resp)) if status >= 400 => {
                    attempts_left -= 1;
                    if attempts_left == 0 {
                        return Err(DriverError::CreateFailed(os_error(
                            "os-keypairs",
                            status,
                            &resp,
                        )));
                    }
                    warn!("keypair create failed (HTTP {}), retrying", status);
                }
                Ok(_) => {
                    self.record("keypair", name);
                    return Ok(());
                }
                Err(e) => {
                    attempts_left -= 1;
                    if attempts_left == 0 {
                        return Err(e);
                    }
                    warn!("keypair create failed ({}), retrying", e);
                }
            }
        }
    }

    // ── Volumes ───────────────────────────────────────────────────────────────

    /// Returns the new volume's (id, status). Retried like keypairs.
    pub async fn create_volume(
        &self,
        size: u32,
        image_ref: &str,
        retry_count: u32,
    ) -> Result<(String, String), DriverError> {
        let mut attempts_left = retry_count + 1;
        loop {
            let body = json!({"volume": {"size": size, "imageRef": image_ref}});
            let result = self.post(self.cinder("/volumes").await?, &body).await;
            match result {
                Ok((status, resp)) if status < 400 => {
                    let id = resp["volume"]["id"].as_str().unwrap_or_default().to_string();
                    let volume_status = resp["volume"]["status"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string();
                    self.record("volume", &id);
                    return Ok((id, volume_status));
                }
                Ok((status, resp)) => {
                    attempts_left -= 1;
                    if attempts_left == 0 {
                        return Err(DriverError::CreateFailed(os_error("volumes", status, &resp)));
                    }
                    warn!("volume create failed (HTTP {}), retrying", status);
                }
                Err(e) => {
                    attempts_left -= 1;
                    if attempts_left == 0 {
                        return Err(e);
                    }
                    warn!("volume create failed ({}), retrying", e);
                }
            }
        }
    }

    pub async fn get_volume_status(&self, id: &str) -> Result<String, DriverError> {
        let body = self.get(self.cinder(&format!("/volumes/{}", id)).await?).await?;
        Ok(body["volume"]["status"].as_str().unwrap_or_default().to_string())
    }

    /// Block until the volume reports "available", polling every 3 s.
    pub async fn wait_for_volume(&self, id: &str) -> Result<(), DriverError> {
        loop {
            if self.get_volume_status(id).await? == "available" {
                return Ok(());
            }
            tokio::time::sleep(VOLUME_POLL).await;
        }
    }

    // ── Servers ───────────────────────────────────────────────────────────────

    /// Resolve a flavor reference: an exact id, or a flavor name.
    pub async fn get_flavor(&self, flavor: &str) -> Result<String, DriverError> {
        let body = self.get(self.nova("/flavors").await?).await?;
        array_of(&body, "flavors")
            .iter()
            .find(|f| f["id"].as_str() == Some(flavor) || f["name"].as_str() == Some(flavor))
            .and_then(|f| f["id"].as_str())
            .map(str::to_string)
            .ok_or_else(|| DriverError::CreateFailed(format!("no such flavor: {}", flavor)))
    }

    /// Launch a server booted from `volume_id` mapped onto `vda`, attached
    /// to the given ports. Returns the server id.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_server(
        &self,
        name: &str,
        volume_id: &str,
        flavor_ref: &str,
        port_ids: &[String],
        key_name: Option<&str>,
        userdata: Option<&str>,
        security_group_names: &[String],
    ) -> Result<String, DriverError> {
        let mut server = json!({
            "name": name,
            "flavorRef": flavor_ref,
            // vda → <volume>:::1 in the classic mapping syntax
            "block_device_mapping": [{
                "device_name": "vda",
                "volume_id": volume_id,
                "volume_size": "",
                "delete_on_termination": "1",
            }],
        });
        if !port_ids.is_empty() {
            server["networks"] = json!(port_ids
                .iter()
                .map(|id| json!({"port": id}))
                .collect::<Vec<_>>());
        }
        if let Some(key) = key_name {
            server["key_name"] = json!(key);
        }
        if let Some(userdata) = userdata {
            let encoded = base64::engine::general_purpose::STANDARD.encode(userdata);
            server["user_data"] = json!(encoded);
        }
        if !security_group_names.is_empty() {
            server["security_groups"] = json!(security_group_names
                .iter()
                .map(|name| json!({"name": name}))
                .collect::<Vec<_>>());
        }
        if let Some(namespace) = &self.options.namespace {
            server["metadata"] = json!({ NAMESPACE_KEY: namespace });
        }

        let (status, resp) = self
            .post(self.nova("/servers").await?, &json!({"server": server}))
            .await?;
        if status >= 400 {
            return Err(DriverError::CreateFailed(os_error("servers", status, &resp)));
        }
        let id = resp["server"]["id"].as_str().unwrap_or_default().to_string();
        self.record("server", &id);
        Ok(id)
    }

    pub async fn get_server_status(&self, id: &str) -> Result<String, DriverError> {
        let body = self.get(self.nova(&format!("/servers/{}", id)).await?).await?;
        Ok(body["server"]["status"].as_str().unwrap_or_default().to_string())
    }

    // ── Deletion ──────────────────────────────────────────────────────────────

    pub async fn delete_port(&self, id: &str) -> Result<(), DriverError> {
        self.delete(self.neutron(&format!("/v2.0/ports/{}", id)).await?).await
    }

    pub async fn delete_network(&self, id: &str) -> Result<(), DriverError> {
        self.delete(self.neutron(&format!("/v2.0/networks/{}", id)).await?).await
    }

    pub async fn delete_router(&self, id: &str) -> Result<(), DriverError> {
        self.delete(self.neutron(&format!("/v2.0/routers/{}", id)).await?).await
    }

    /// A subnet with a router interface refuses deletion with a conflict.
    /// Detach the interface and retry once; any other conflict propagates.
    pub async fn delete_subnet(&self, id: &str) -> Result<(), DriverError> {
        let url = self.neutron(&format!("/v2.0/subnets/{}", id)).await?;
        let status = self.delete_raw(url.clone()).await?;
        if status < 400 {
            return Ok(());
        }
        if status != 409 {
            return Err(DriverError::DeleteFailed(format!("{}: HTTP {}", url, status)));
        }

        let ports = self
            .get(
                self.neutron("/v2.0/ports?device_owner=network:router_interface")
                    .await?,
            )
            .await?;
        let mut router_found = false;
        'ports: for port in array_of(&ports, "ports") {
            for fixed_ip in port["fixed_ips"].as_array().into_iter().flatten() {
                if fixed_ip["subnet_id"].as_str() == Some(id) {
                    router_found = true;
                    let device_id = port["device_id"].as_str().unwrap_or_default();
                    let remove_url = self
                        .neutron(&format!("/v2.0/routers/{}/remove_router_interface", device_id))
                        .await?;
                    self.put(remove_url, &json!({"subnet_id": id})).await?;
                    break 'ports;
                }
            }
        }

        if router_found {
            self.delete(url).await
        } else {
            // not the router port after all, surface the original conflict
            Err(DriverError::DeleteFailed(format!("{}: HTTP {}", url, status)))
        }
    }

    pub async fn delete_secgroup(&self, id: &str) -> Result<(), DriverError> {
        self.delete(self.neutron(&format!("/v2.0/security-groups/{}", id)).await?)
            .await
    }

    pub async fn delete_secgroup_rule(&self, id: &str) -> Result<(), DriverError> {
        self.delete(
            self.neutron(&format!("/v2.0/security-group-rules/{}", id)).await?,
        )
        .await
    }

    pub async fn delete_floatingip(&self, id: &str) -> Result<(), DriverError> {
        self.delete(self.neutron(&format!("/v2.0/floatingips/{}", id)).await?)
            .await
    }

    pub async fn delete_keypair(&self, name: &str) -> Result<(), DriverError> {
        self.delete(self.nova(&format!("/os-keypairs/{}", name)).await?).await
    }

    pub async fn delete_server(&self, id: &str) -> Result<(), DriverError> {
        self.delete(self.nova(&format!("/servers/{}", id)).await?).await
    }

    pub async fn delete_volume(&self, id: &str) -> Result<(), DriverError> {
        self.delete(self.cinder(&format!("/volumes/{}", id)).await?).await
    }

    // ── Reconcile-mode helpers ────────────────────────────────────────────────

    /// Root volume size per attached server, for node identity.
    async fn volume_sizes_by_server(&self) -> Result<HashMap<String, u32>, DriverError> {
        let body = self.get(self.cinder("/volumes/detail").await?).await?;
        let mut sizes = HashMap::new();
        for volume in array_of(&body, "volumes") {
            let size = volume["size"].as_u64().unwrap_or(0) as u32;
            for attachment in volume["attachments"].as_array().into_iter().flatten() {
                if let Some(server_id) = attachment["server_id"].as_str() {
                    sizes.entry(server_id.to_string()).or_insert(size);
                }
            }
        }
        Ok(sizes)
    }
}

async fn authenticate(
    client: &reqwest::Client,
    creds: &OpenStackCredentials,
) -> Result<Session, DriverError> {
    let url = format!("{}/tokens", creds.auth_url.trim_end_matches('/'));
    let body = json!({
        "auth": {
            "passwordCredentials": {
                "username": creds.username,
                "password": creds.password,
            },
            "tenantName": creds.tenant_name,
        }
    });

    let resp: Value = client
        .post(&url)
        .json(&body)
        .send()
        .await
        .map_err(|e| DriverError::Auth(format!("POST {}: {}", url, e)))?
        .json()
        .await
        .map_err(|e| DriverError::Auth(format!("decode {}: {}", url, e)))?;

    let token = resp["access"]["token"]["id"]
        .as_str()
        .ok_or_else(|| DriverError::Auth("keystone response carried no token".into()))?
        .to_string();

    let endpoint_for = |service: &str| -> Result<String, DriverError> {
        resp["access"]["serviceCatalog"]
            .as_array()
            .into_iter()
            .flatten()
            .find(|entry| entry["type"].as_str() == Some(service))
            .and_then(|entry| {
                let endpoints = entry["endpoints"].as_array()?;
                let chosen = match &creds.region {
                    Some(region) => endpoints
                        .iter()
                        .find(|e| e["region"].as_str() == Some(region.as_str()))
                        .or_else(|| endpoints.first()),
                    None => endpoints.first(),
                };
                chosen?["publicURL"].as_str().map(str::to_string)
            })
            .ok_or_else(|| DriverError::Auth(format!("no {} endpoint in catalog", service)))
    };

    info!("Connected to OpenStack at {}", creds.auth_url);
    Ok(Session {
        token,
        endpoints: Endpoints {
            nova: endpoint_for("compute")?,
            neutron: endpoint_for("network")?,
            cinder: endpoint_for("volume")?,
        },
    })
}

fn os_error(what: &str, status: u16, body: &Value) -> String {
    // error envelopes vary by service; take the first message-looking field
    let message = body
        .as_object()
        .and_then(|o| o.values().next())
        .and_then(|v| v["message"].as_str())
        .unwrap_or("unknown error");
    format!("{}: HTTP {}: {}", what, status, message)
}

fn array_of(body: &Value, key: &str) -> Vec<Value> {
    body[key].as_array().cloned().unwrap_or_default()
}

#[async_trait]
impl CloudDriver for OpenStackDriver {
    fn provider_name(&self) -> &'static str {
        "openstack"
    }

    fn options(&self) -> &DriverOptions {
        &self.options
    }

    async fn detect_nodes(&self) -> Result<Vec<Node>, DriverError> {
        let volume_sizes = self.volume_sizes_by_server().await?;

        let mut nodes = Vec::new();
        for server in self.get_servers().await? {
            let namespace = server["metadata"][NAMESPACE_KEY].as_str();
            if !self.is_namespace_relevant(namespace) {
                continue;
            }
            if server["status"].as_str() == Some("DELETED") {
                continue;
            }

            let server_id = server["id"].as_str().unwrap_or_default();
            let mut node = Node::new(
                server["name"].as_str().unwrap_or_default(),
                server["flavor"]["id"].as_str().unwrap_or_default(),
                server["image"]["id"].as_str().unwrap_or_default(),
                volume_sizes.get(server_id).copied().unwrap_or(0),
            );
            node.provider_id = Some(server_id.to_string());
            node.server_id = Some(server_id.to_string());
            node.server_status = server["status"].as_str().map(str::to_string);
            node.security_group_names = server["security_groups"]
                .as_array()
                .into_iter()
                .flatten()
                .filter_map(|g| g["name"].as_str().map(str::to_string))
                .collect();

            info!("Detected node: {}", node.name);
            nodes.push(node);
        }
        Ok(nodes)
    }

    async fn detect_firewalls(
        &self,
    ) -> Result<(HashSet<SecurityGroup>, HashSet<SecurityGroupRule>), DriverError> {
        let listed = self.get_security_groups().await?;
        let id_to_name: HashMap<&str, &str> = listed
            .iter()
            .filter_map(|g| Some((g["id"].as_str()?, g["name"].as_str()?)))
            .collect();

        let mut groups = HashSet::new();
        let mut rules = HashSet::new();
        for listed_group in &listed {
            let Some(name) = listed_group["name"].as_str() else { continue };
            let mut group = SecurityGroup::new(name);
            group.provider_id = listed_group["id"].as_str().map(str::to_string);
            groups.insert(group);

            for raw in listed_group["security_group_rules"]
                .as_array()
                .into_iter()
                .flatten()
            {
                if raw["direction"].as_str() != Some("ingress") {
                    continue;
                }
                let source = match raw["remote_ip_prefix"].as_str() {
                    Some(cidr) => RuleSource::Cidr(cidr.to_string()),
                    None => match raw["remote_group_id"].as_str() {
                        Some(remote_id) => RuleSource::Group(
                            id_to_name.get(remote_id).unwrap_or(&remote_id).to_string(),
                        ),
                        None => continue,
                    },
                };
                let mut rule = SecurityGroupRule::new(
                    name,
                    source,
                    raw["port_range_min"].as_u64().map(|p| p as u16),
                    raw["port_range_max"].as_u64().map(|p| p as u16),
                    raw["protocol"].as_str().unwrap_or_default(),
                );
                rule.provider_id = raw["id"].as_str().map(str::to_string);
                rules.insert(rule);
            }
        }
        Ok((groups, rules))
    }

    /// Boot-from-volume, the same shape the provisioning runner builds:
    /// volume from image, wait until available, then a server with the
    /// volume mapped onto vda.
    async fn create_node(&self, node: &mut Node) -> Result<(), DriverError> {
        info!("Launching node: {}", node.name);

        let image = self.apply_mappings("images", &node.image);
        let (volume_id, status) = self.create_volume(node.disk, &image, 0).await?;
        if status != "available" {
            self.wait_for_volume(&volume_id).await?;
        }

        let flavor_ref = self
            .get_flavor(&self.apply_mappings("flavors", &node.flavor))
            .await?;
        let groups: Vec<String> = node.sorted_security_group_names().into_iter().collect();
        let server_id = self
            .create_server(
                &node.name,
                &volume_id,
                &flavor_ref,
                &[],
                None,
                node.script.as_deref(),
                &groups,
            )
            .await?;

        node.server_id = Some(server_id.clone());
        node.provider_id = Some(server_id);
        info!("Launched node: {}", node.name);
        Ok(())
    }

    async fn create_security_group(&self, group: &SecurityGroup) -> Result<(), DriverError> {
        let body = json!({"security_group": {"name": group.name}});
        let (status, resp) = self
            .post(self.neutron("/v2.0/security-groups").await?, &body)
            .await?;
        if status == 409 {
            return Ok(());
        }
        if status >= 400 {
            return Err(DriverError::CreateFailed(os_error("security-groups", status, &resp)));
        }
        if let Some(id) = resp["security_group"]["id"].as_str() {
            self.record("secgroup", id);
        }
        Ok(())
    }

    async fn create_security_group_rule(
        &self,
        rule: &SecurityGroupRule,
    ) -> Result<(), DriverError> {
        let listed = self.get_security_groups().await?;
        let find_id = |name: &str| {
            listed
                .iter()
                .find(|g| g["name"].as_str() == Some(name))
                .and_then(|g| g["id"].as_str())
                .map(str::to_string)
        };
        let group_id = find_id(&rule.security_group).ok_or_else(|| {
            DriverError::CreateFailed(format!("unknown security group {}", rule.security_group))
        })?;

        let mut body = json!({
            "direction": "ingress",
            "ethertype": "IPv4",
            "port_range_min": rule.from_port,
            "port_range_max": rule.to_port,
            "protocol": rule.protocol,
            "security_group_id": group_id,
        });
        match &rule.source {
            RuleSource::Cidr(cidr) => body["remote_ip_prefix"] = json!(cidr),
            RuleSource::Group(group) => {
                body["remote_group_id"] = json!(find_id(group).unwrap_or_else(|| group.clone()));
            }
        }

        let (status, resp) = self
            .post(
                self.neutron("/v2.0/security-group-rules").await?,
                &json!({"security_group_rule": body}),
            )
            .await?;
        if status == 409 {
            return Ok(());
        }
        if status >= 400 {
            return Err(DriverError::CreateFailed(os_error(
                "security-group-rules",
                status,
                &resp,
            )));
        }
        if let Some(id) = resp["security_group_rule"]["id"].as_str() {
            self.record("secgroup_rule", id);
        }
        Ok(())
    }

    async fn delete_node(&self, node: &Node) -> Result<(), DriverError> {
        let id = node
            .server_id
            .as_deref()
            .or(node.provider_id.as_deref())
            .ok_or_else(|| {
                DriverError::DeleteFailed(format!("node {} has no server id", node.name))
            })?;
        self.delete_server(id).await
    }

    async fn delete_security_group(&self, group: &SecurityGroup) -> Result<(), DriverError> {
        match &group.provider_id {
            Some(id) => self.delete_secgroup(id).await,
            None => Ok(()),
        }
    }

    async fn delete_security_group_rule(
        &self,
        rule: &SecurityGroupRule,
    ) -> Result<(), DriverError> {
        match &rule.provider_id {
            Some(id) => self.delete_secgroup_rule(id).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use strato_config::cloud::parse_mappings_ini;
    use strato_config::raw::RawRule;
    use wiremock::matchers::{body_json_string, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct VecRecorder(Mutex<Vec<(String, String)>>);

    impl VecRecorder {
        fn new() -> Arc<Self> {
            Arc::new(Self(Mutex::new(Vec::new())))
        }

        fn entries(&self) -> Vec<(String, String)> {
            self.0.lock().unwrap().clone()
        }
    }

    impl ResourceRecorder for VecRecorder {
        fn record(&self, resource_type: &str, id: &str) {
            self.0
                .lock()
                .unwrap()
                .push((resource_type.to_string(), id.to_string()));
        }
    }

    fn driver(server: &MockServer) -> OpenStackDriver {
        OpenStackDriver::with_session(
            "fake-token",
            server.uri(),
            server.uri(),
            server.uri(),
            DriverOptions::default(),
        )
    }

    #[tokio::test]
    async fn keystone_auth_parses_catalog() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tokens"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access": {
                    "token": {"id": "tok-123"},
                    "serviceCatalog": [
                        {"type": "compute", "endpoints": [{"publicURL": "http://nova", "region": "r1"}]},
                        {"type": "network", "endpoints": [{"publicURL": "http://neutron", "region": "r1"}]},
                        {"type": "volume", "endpoints": [{"publicURL": "http://cinder", "region": "r1"}]},
                    ],
                },
            })))
            .mount(&server)
            .await;

        let creds = OpenStackCredentials {
            username: "user".into(),
            password: "pass".into(),
            auth_url: server.uri(),
            tenant_name: "tenant".into(),
            region: Some("r1".into()),
        };
        let session = authenticate(&reqwest::Client::new(), &creds).await.unwrap();
        assert_eq!(session.token, "tok-123");
        assert_eq!(session.endpoints.nova, "http://nova");
        assert_eq!(session.endpoints.cinder, "http://cinder");
    }

    #[tokio::test]
    async fn create_network_records_network_subnet_and_attaches_router() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2.0/networks"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "network": {"id": "net-1"},
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v2.0/subnets"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "subnet": {"id": "sub-1"},
            })))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/v2.0/routers/rtr-9/add_router_interface"))
            .and(body_json_string(r#"{"subnet_id":"sub-1"}"#))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let recorder = VecRecorder::new();
        let driver = driver(&server).with_recorder(recorder.clone());
        let mappings = parse_mappings_ini("[routers]\n* = rtr-9\n");

        let network_id = driver
            .create_network("default_pqr", "10.0.0.0/24", &mappings)
            .await
            .unwrap();
        assert_eq!(network_id, "net-1");
        assert_eq!(
            recorder.entries(),
            vec![
                ("network".to_string(), "net-1".to_string()),
                ("subnet".to_string(), "sub-1".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn delete_subnet_detaches_router_interface_on_conflict() {
        let server = MockServer::start().await;
        // first delete conflicts, second (after detach) succeeds
        Mock::given(method("DELETE"))
            .and(path("/v2.0/subnets/sub-1"))
            .respond_with(ResponseTemplate::new(409))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2.0/ports"))
            .and(query_param("device_owner", "network:router_interface"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ports": [{
                    "device_id": "rtr-9",
                    "fixed_ips": [{"subnet_id": "sub-1"}],
                }],
            })))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/v2.0/routers/rtr-9/remove_router_interface"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/v2.0/subnets/sub-1"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        driver(&server).delete_subnet("sub-1").await.unwrap();
    }

    #[tokio::test]
    async fn keypair_conflict_is_idempotent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/os-keypairs"))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({})))
            .mount(&server)
            .await;

        driver(&server)
            .create_keypair("pubkey_x", "ssh-rsa AAAA", 2)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn keypair_retries_on_failure_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/os-keypairs"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({})))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/os-keypairs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        let recorder = VecRecorder::new();
        let driver = driver(&server).with_recorder(recorder.clone());
        driver.create_keypair("pubkey_x", "ssh-rsa AAAA", 2).await.unwrap();
        assert_eq!(recorder.entries(), vec![("keypair".to_string(), "pubkey_x".to_string())]);
    }

    #[tokio::test]
    async fn secgroup_create_resolves_source_group_references() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2.0/security-groups"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "security_group": {"id": "sg-new"},
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v2.0/security-group-rules"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "security_group_rule": {"id": "sgr-1"},
            })))
            .mount(&server)
            .await;

        let recorder = VecRecorder::new();
        let driver = driver(&server).with_recorder(recorder.clone());
        let mut secgroups = HashMap::from([("www".to_string(), "sg-www".to_string())]);

        let rules = vec![RawRule {
            from_port: Some(8080),
            to_port: Some(8081),
            protocol: "udp".into(),
            cidr: None,
            source_group: Some("www".into()),
        }];
        driver
            .create_security_group_with_rules("default", "default_pqr", &rules, &mut secgroups)
            .await
            .unwrap();

        assert_eq!(secgroups.get("default"), Some(&"sg-new".to_string()));
        assert_eq!(
            recorder.entries(),
            vec![
                ("secgroup".to_string(), "sg-new".to_string()),
                ("secgroup_rule".to_string(), "sgr-1".to_string()),
            ]
        );

        let requests = server.received_requests().await.unwrap();
        let rule_body: Value = requests
            .iter()
            .filter(|r| r.url.path() == "/v2.0/security-group-rules")
            .map(|r| serde_json::from_slice(&r.body).unwrap())
            .next()
            .unwrap();
        assert_eq!(rule_body["security_group_rule"]["remote_group_id"], "sg-www");
    }

    #[tokio::test]
    async fn floating_ip_comes_from_first_external_network() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2.0/networks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "networks": [{"id": "ext-1"}, {"id": "ext-2"}],
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v2.0/floatingips"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "floatingip": {"id": "fip-1", "floating_ip_address": "198.51.100.9"},
            })))
            .mount(&server)
            .await;

        let recorder = VecRecorder::new();
        let driver = driver(&server).with_recorder(recorder.clone());
        let (id, address) = driver.create_floating_ip().await.unwrap();
        assert_eq!(id, "fip-1");
        assert_eq!(address, "198.51.100.9");

        let requests = server.received_requests().await.unwrap();
        let create: Value = requests
            .iter()
            .filter(|r| r.url.path() == "/v2.0/floatingips")
            .map(|r| serde_json::from_slice(&r.body).unwrap())
            .next()
            .unwrap();
        assert_eq!(create["floatingip"]["floating_network_id"], "ext-1");
    }

    #[tokio::test]
    async fn create_port_returns_port_record() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2.0/ports"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "port": {
                    "id": "port-1",
                    "fixed_ips": [{"ip_address": "10.0.0.5"}],
                    "mac_address": "fa:16:3e:aa:bb:cc",
                },
            })))
            .mount(&server)
            .await;

        let port = driver(&server)
            .create_port("web1_eth0", "default", "net-1", &["sg-www".to_string()])
            .await
            .unwrap();
        assert_eq!(port.id, "port-1");
        assert_eq!(port.fixed_ip, "10.0.0.5");
        assert_eq!(port.network_name, "default");
        assert!(port.floating_ip.is_none());
    }
}
