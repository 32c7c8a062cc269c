use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde_json::{json, Value};
use strato_config::cloud::CloudConfig;
use strato_model::{Collection, Node, RuleSource, SecurityGroup, SecurityGroupRule};
use tracing::{debug, info};

use crate::driver::{expand_path, proxyconf, CloudDriver, DriverOptions};
use crate::error::DriverError;

const NAMESPACE_KEY: &str = "strato_namespace";

/// Firewalls without target tags land in this synthetic group.
const GLOBAL_GROUP: &str = "global";

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct GceDriverConfig {
    /// Service-account JSON key file.
    pub key_file: String,
    /// Zone, e.g. "europe-west1-b".
    pub location: String,
    pub username: String,
    pub ssh_key_file: Option<String>,
}

impl GceDriverConfig {
    pub fn from_cloud_config(cfg: &CloudConfig) -> Result<Self, DriverError> {
        Ok(Self {
            key_file: cfg
                .connection_key("key_file")
                .map_err(|e| DriverError::Config(e.to_string()))?
                .to_string(),
            location: cfg
                .connection_key("location")
                .map_err(|e| DriverError::Config(e.to_string()))?
                .to_string(),
            username: cfg
                .connection
                .get("username")
                .cloned()
                .unwrap_or_else(|| "ubuntu".to_string()),
            ssh_key_file: cfg.connection.get("sshkey").cloned(),
        })
    }
}

// ── Token provider ────────────────────────────────────────────────────────────

/// Abstraction over GCP token acquisition — enables test injection.
#[async_trait]
trait TokenProvider: Send + Sync {
    async fn token(&self) -> Result<String, DriverError>;
}

/// Production token provider backed by the service-account key file.
struct ServiceAccountToken {
    inner: gcp_auth::CustomServiceAccount,
}

#[async_trait]
impl TokenProvider for ServiceAccountToken {
    async fn token(&self) -> Result<String, DriverError> {
        use gcp_auth::TokenProvider as _;
        let token = self
            .inner
            .token(&["https://www.googleapis.com/auth/cloud-platform"])
            .await
            .map_err(|e| DriverError::Auth(format!("GCE auth failed: {}", e)))?;
        Ok(token.as_str().to_string())
    }
}

/// Test token provider — a fixed string, no network.
#[cfg(test)]
struct StaticToken(String);

#[cfg(test)]
#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> Result<String, DriverError> {
        Ok(self.0.clone())
    }
}

// ── GceDriver ─────────────────────────────────────────────────────────────────

pub struct GceDriver {
    config: GceDriverConfig,
    options: DriverOptions,
    project: String,
    client: reqwest::Client,
    token: Box<dyn TokenProvider>,
    base: String,
}

impl GceDriver {
    /// Build a driver from a service-account key file. The GCP project is
    /// whatever the key belongs to.
    pub fn from_key_file(
        config: GceDriverConfig,
        options: DriverOptions,
    ) -> Result<Self, DriverError> {
        let raw = std::fs::read_to_string(expand_path(&config.key_file))
            .map_err(|e| DriverError::Config(format!("read {}: {}", config.key_file, e)))?;
        let key: Value = serde_json::from_str(&raw)
            .map_err(|e| DriverError::Config(format!("parse {}: {}", config.key_file, e)))?;
        let project = key["project_id"]
            .as_str()
            .ok_or_else(|| DriverError::Config("key file has no project_id".into()))?
            .to_string();

        let account = gcp_auth::CustomServiceAccount::from_json(&raw)
            .map_err(|e| DriverError::Auth(format!("load service account: {}", e)))?;

        info!("Connecting to Google Compute Engine (project {})", project);
        Ok(Self {
            config,
            options,
            project,
            client: reqwest::Client::new(),
            token: Box::new(ServiceAccountToken { inner: account }),
            base: "https://compute.googleapis.com".into(),
        })
    }

    #[cfg(test)]
    fn with_static_token(
        config: GceDriverConfig,
        options: DriverOptions,
        project: &str,
        base: String,
    ) -> Self {
        Self {
            config,
            options,
            project: project.to_string(),
            client: reqwest::Client::new(),
            token: Box::new(StaticToken("fake-token".into())),
            base,
        }
    }

    fn zone_url(&self, resource: &str) -> String {
        format!(
            "{}/compute/v1/projects/{}/zones/{}/{}",
            self.base, self.project, self.config.location, resource
        )
    }

    fn global_url(&self, resource: &str) -> String {
        format!(
            "{}/compute/v1/projects/{}/global/{}",
            self.base, self.project, resource
        )
    }

    async fn get(&self, url: &str) -> Result<Value, DriverError> {
        let token = self.token.token().await?;
        let resp = self
            .client
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| DriverError::DetectFailed(format!("GET {}: {}", url, e)))?;
        let status = resp.status().as_u16();
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        if status >= 400 {
            return Err(DriverError::DetectFailed(gce_error(url, status, &body)));
        }
        Ok(body)
    }

    /// POST returning (status, body) so callers can treat 409 as benign.
    async fn post(&self, url: &str, body: &Value) -> Result<(u16, Value), DriverError> {
        let token = self.token.token().await?;
        let resp = self
            .client
            .post(url)
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .map_err(|e| DriverError::CreateFailed(format!("POST {}: {}", url, e)))?;
        let status = resp.status().as_u16();
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        Ok((status, body))
    }

    async fn delete(&self, url: &str) -> Result<(), DriverError> {
        let token = self.token.token().await?;
        let resp = self
            .client
            .delete(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| DriverError::DeleteFailed(format!("DELETE {}: {}", url, e)))?;
        let status = resp.status().as_u16();
        if status >= 400 {
            let body: Value = resp.json().await.unwrap_or(Value::Null);
            return Err(DriverError::DeleteFailed(gce_error(url, status, &body)));
        }
        Ok(())
    }

    // ── Resolution helpers ────────────────────────────────────────────────────

    /// Disk selfLink → (size GB, source image name).
    async fn volume_size_map(&self) -> Result<HashMap<String, (u32, String)>, DriverError> {
        let body = self.get(&self.zone_url("disks")).await?;
        let mut sizes = HashMap::new();
        for disk in body["items"].as_array().into_iter().flatten() {
            let Some(link) = disk["selfLink"].as_str() else { continue };
            let size = disk["sizeGb"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .or_else(|| disk["sizeGb"].as_u64().map(|s| s as u32))
                .unwrap_or(0);
            let image = disk["sourceImage"]
                .as_str()
                .and_then(|l| l.rsplit('/').next())
                .unwrap_or_default()
                .to_string();
            sizes.insert(link.to_string(), (size, image));
        }
        Ok(sizes)
    }

    async fn resolve_image_link(&self, name: &str) -> Result<String, DriverError> {
        let body = self.get(&self.global_url("images")).await?;
        body["items"]
            .as_array()
            .into_iter()
            .flatten()
            .find(|image| image["name"].as_str() == Some(name))
            .and_then(|image| image["selfLink"].as_str().map(str::to_string))
            .ok_or_else(|| DriverError::CreateFailed(format!("no such image: {}", name)))
    }

    async fn resolve_disk_type(&self, name: &str) -> Result<String, DriverError> {
        let body = self.get(&self.zone_url("diskTypes")).await?;
        body["items"]
            .as_array()
            .into_iter()
            .flatten()
            .find(|dt| dt["name"].as_str() == Some(name))
            .and_then(|dt| dt["selfLink"].as_str().map(str::to_string))
            .ok_or_else(|| DriverError::CreateFailed(format!("no such disk type: {}", name)))
    }

    async fn disk_struct(&self, node: &Node) -> Result<Value, DriverError> {
        let image = self.apply_mappings("images", &node.image);
        Ok(json!([{
            "boot": true,
            "autoDelete": true,
            "initializeParams": {
                "sourceImage": self.resolve_image_link(&image).await?,
                "diskType": self.resolve_disk_type("pd-ssd").await?,
                "diskSizeGb": node.disk,
            },
        }]))
    }

    /// Startup script, SSH keys and namespace all travel as metadata items.
    fn metadata_items(&self, node: &Node) -> Result<Value, DriverError> {
        let mut entries = Vec::new();
        if let Some(script) = &node.script {
            entries.push(json!({"key": "startup-script", "value": script}));
        }
        if let Some(key_file) = &self.config.ssh_key_file {
            let path = expand_path(key_file);
            let pubkey = std::fs::read_to_string(&path)
                .map_err(|e| DriverError::Config(format!("read {}: {}", path.display(), e)))?;
            entries.push(json!({
                "key": "sshKeys",
                "value": format!("{}:{}", self.config.username, pubkey.trim_end()),
            }));
        }
        if let Some(namespace) = &self.options.namespace {
            entries.push(json!({"key": NAMESPACE_KEY, "value": namespace}));
        }
        Ok(json!({ "items": entries }))
    }
}

// ── Firewall parsing ──────────────────────────────────────────────────────────

/// `ports: ["N"]` → N..N, `ports: ["N-M"]` → N..M, absent → the full range.
fn parse_port_spec(allowed: &Value) -> (u16, u16) {
    match allowed["ports"][0].as_str() {
        Some(spec) => match spec.split_once('-') {
            Some((from, to)) => (
                from.parse().unwrap_or(0),
                to.parse().unwrap_or(65535),
            ),
            None => {
                let port = spec.parse().unwrap_or(0);
                (port, port)
            }
        },
        None => (0, 65535),
    }
}

/// Every firewall contributes one synthetic group per target tag; untargeted
/// firewalls fall under "global".
fn firewall_tags(firewall: &Value) -> Vec<String> {
    let tags: Vec<String> = firewall["targetTags"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|t| t.as_str().map(str::to_string))
        .collect();
    if tags.is_empty() {
        vec![GLOBAL_GROUP.to_string()]
    } else {
        tags
    }
}

fn format_ports(rule: &SecurityGroupRule) -> String {
    let from = rule.from_port.unwrap_or(0);
    let to = rule.to_port.unwrap_or(0);
    if from == to {
        from.to_string()
    } else {
        format!("{}-{}", from, to)
    }
}

fn gce_error(url: &str, status: u16, body: &Value) -> String {
    let message = body["error"]["message"].as_str().unwrap_or("unknown error");
    format!("{}: HTTP {}: {}", url, status, message)
}

#[async_trait]
impl CloudDriver for GceDriver {
    fn provider_name(&self) -> &'static str {
        "gce"
    }

    fn options(&self) -> &DriverOptions {
        &self.options
    }

    async fn detect_nodes(&self) -> Result<Vec<Node>, DriverError> {
        let volume_sizes = self.volume_size_map().await?;
        let body = self.get(&self.zone_url("instances")).await?;

        let mut nodes = Vec::new();
        for instance in body["items"].as_array().into_iter().flatten() {
            let metadata: HashMap<&str, &str> = instance["metadata"]["items"]
                .as_array()
                .into_iter()
                .flatten()
                .filter_map(|item| Some((item["key"].as_str()?, item["value"].as_str()?)))
                .collect();
            if !self.is_namespace_relevant(metadata.get(NAMESPACE_KEY).copied()) {
                continue;
            }

            let boot_disk = instance["disks"][0]["source"].as_str().unwrap_or_default();
            let (disk, image) = volume_sizes
                .get(boot_disk)
                .cloned()
                .unwrap_or((0, String::new()));

            let flavor = instance["machineType"]
                .as_str()
                .and_then(|l| l.rsplit('/').next())
                .unwrap_or_default();

            let mut node = Node::new(
                instance["name"].as_str().unwrap_or_default(),
                flavor,
                image,
                disk,
            );
            // GCE models firewalling with tags, not real groups.
            node.security_group_names = instance["tags"]["items"]
                .as_array()
                .into_iter()
                .flatten()
                .filter_map(|t| t.as_str().map(str::to_string))
                .collect();
            node.provider_id = instance["name"].as_str().map(str::to_string);
            for iface in instance["networkInterfaces"].as_array().into_iter().flatten() {
                for access in iface["accessConfigs"].as_array().into_iter().flatten() {
                    if let Some(ip) = access["natIP"].as_str() {
                        node.public_ips.push(ip.to_string());
                    }
                }
            }

            info!("Detected node: {}", node.name);
            nodes.push(node);
        }
        Ok(nodes)
    }

    async fn detect_firewalls(
        &self,
    ) -> Result<(HashSet<SecurityGroup>, HashSet<SecurityGroupRule>), DriverError> {
        let body = self.get(&self.global_url("firewalls")).await?;
        let firewalls: Vec<&Value> = body["items"].as_array().into_iter().flatten().collect();

        let mut groups = HashSet::new();
        let mut rules = HashSet::new();

        for firewall in &firewalls {
            for tag in firewall_tags(firewall) {
                info!("Detected security group: {}", tag);
                groups.insert(SecurityGroup::new(&tag));

                for allowed in firewall["allowed"].as_array().into_iter().flatten() {
                    let (from_port, to_port) = parse_port_spec(allowed);
                    let protocol = allowed["IPProtocol"].as_str().unwrap_or_default();
                    info!(
                        "Detected security group rule for security group {}: {}: {}-{}",
                        tag, protocol, from_port, to_port
                    );
                    let mut rule = SecurityGroupRule::new(
                        &tag,
                        RuleSource::Cidr("0.0.0.0/0".into()),
                        Some(from_port),
                        Some(to_port),
                        protocol,
                    );
                    rule.provider_id = firewall["name"].as_str().map(str::to_string);
                    rules.insert(rule);
                }
            }
        }

        Ok((groups, rules))
    }

    async fn create_node(&self, node: &mut Node) -> Result<(), DriverError> {
        info!("Launching node: {}", node.name);

        let machine_type = format!(
            "zones/{}/machineTypes/{}",
            self.config.location,
            self.apply_mappings("flavors", &node.flavor)
        );

        let body = json!({
            "name": node.name,
            "machineType": machine_type,
            "disks": self.disk_struct(node).await?,
            "tags": { "items": node.sorted_security_group_names() },
            "metadata": self.metadata_items(node)?,
            "networkInterfaces": [{
                "network": "global/networks/default",
                "accessConfigs": [{"type": "ONE_TO_ONE_NAT", "name": "External NAT"}],
            }],
        });

        let (status, resp) = self.post(&self.zone_url("instances"), &body).await?;
        if status >= 400 {
            return Err(DriverError::CreateFailed(gce_error(
                &self.zone_url("instances"),
                status,
                &resp,
            )));
        }
        node.provider_id = Some(node.name.clone());

        info!("Launched node: {}", node.name);
        Ok(())
    }

    /// GCE has no real security groups; tags on nodes plus firewall rules
    /// carry the semantics, so group creation is a no-op.
    async fn create_security_group(&self, _group: &SecurityGroup) -> Result<(), DriverError> {
        Ok(())
    }

    async fn create_security_group_rule(
        &self,
        rule: &SecurityGroupRule,
    ) -> Result<(), DriverError> {
        let name = format!(
            "{}-{}-{}-{}",
            rule.security_group,
            rule.protocol,
            rule.from_port.unwrap_or(0),
            rule.to_port.unwrap_or(0),
        );
        info!("Creating firewall rule: {}", name);

        let mut body = json!({
            "name": name,
            "allowed": [{
                "IPProtocol": rule.protocol,
                "ports": [format_ports(rule)],
            }],
            "targetTags": [rule.security_group],
        });
        match &rule.source {
            // 0.0.0.0/0 is GCE's implicit default and is omitted entirely
            RuleSource::Cidr(cidr) if cidr != "0.0.0.0/0" => {
                body["sourceRanges"] = json!([cidr]);
            }
            RuleSource::Cidr(_) => {}
            RuleSource::Group(group) => {
                body["sourceTags"] = json!([group]);
            }
        }

        let url = self.global_url("firewalls");
        let (status, resp) = self.post(&url, &body).await?;
        if status == 409 {
            debug!("firewall {} already exists", name);
            return Ok(());
        }
        if status >= 400 {
            return Err(DriverError::CreateFailed(gce_error(&url, status, &resp)));
        }
        Ok(())
    }

    async fn delete_node(&self, node: &Node) -> Result<(), DriverError> {
        let name = node.provider_id.as_deref().unwrap_or(&node.name);
        self.delete(&self.zone_url(&format!("instances/{}", name))).await
    }

    async fn delete_security_group_rule(
        &self,
        rule: &SecurityGroupRule,
    ) -> Result<(), DriverError> {
        // Deletion is by firewall handle; synthetic rules detected without
        // one have nothing to delete.
        let Some(firewall) = rule.provider_id.as_deref() else {
            return Ok(());
        };
        self.delete(&self.global_url(&format!("firewalls/{}", firewall))).await
    }

    /// Groups before nodes has no meaning here: there is nothing to create
    /// for a group, so apply is nodes then firewall rules.
    async fn apply_resources(&self, collection: &mut Collection) -> Result<(), DriverError> {
        self.update_cluster(collection).await?;

        let pool = self.options.pool.clone();

        let node_futs: Vec<_> = collection
            .nodes
            .iter_mut()
            .map(|node| self.create_node(node))
            .collect();
        pool.map(node_futs).await?;

        let rule_futs: Vec<_> = collection
            .security_group_rules
            .iter()
            .map(|rule| self.create_security_group_rule(rule))
            .collect();
        pool.map(rule_futs).await?;

        Ok(())
    }

    fn cluster_data(&self, collection: &Collection) -> Value {
        let collection = collection.original();
        let mut containers = self.default_containers(collection);
        containers.extend(collection.containers.iter().cloned());
        json!({
            "containers": containers,
            "tasks": collection.tasks,
            "proxyconf": proxyconf(collection),
        })
    }
}
