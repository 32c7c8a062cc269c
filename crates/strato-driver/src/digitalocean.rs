use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde_json::{json, Value};
use strato_config::cloud::CloudConfig;
use strato_model::{Collection, Node, SecurityGroup, SecurityGroupRule};
use tokio::sync::OnceCell;
use tracing::info;

use crate::driver::{
    expand_path, keypair_name, openssh_fingerprint, proxyconf, CloudDriver, DriverOptions,
    KeyPairInfo,
};
use crate::error::DriverError;

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct DigitalOceanDriverConfig {
    pub api_key: String,
    /// Region slug, e.g. "ams3".
    pub location: String,
    pub ssh_key_file: Option<String>,
}

impl DigitalOceanDriverConfig {
    pub fn from_cloud_config(cfg: &CloudConfig) -> Result<Self, DriverError> {
        Ok(Self {
            api_key: cfg
                .connection_key("api_key")
                .map_err(|e| DriverError::Config(e.to_string()))?
                .to_string(),
            location: cfg
                .connection_key("location")
                .map_err(|e| DriverError::Config(e.to_string()))?
                .to_string(),
            ssh_key_file: cfg.connection.get("sshkey").cloned(),
        })
    }
}

// ── DigitalOceanDriver ────────────────────────────────────────────────────────

pub struct DigitalOceanDriver {
    config: DigitalOceanDriverConfig,
    options: DriverOptions,
    client: reqwest::Client,
    base: String,
    /// size slug → disk GB, fetched once.
    size_cache: OnceCell<HashMap<String, u32>>,
}

impl DigitalOceanDriver {
    pub fn new(config: DigitalOceanDriverConfig, options: DriverOptions) -> Self {
        Self {
            config,
            options,
            client: reqwest::Client::new(),
            base: "https://api.digitalocean.com".into(),
            size_cache: OnceCell::new(),
        }
    }

    #[cfg(test)]
    fn with_base_url(
        config: DigitalOceanDriverConfig,
        options: DriverOptions,
        base: String,
    ) -> Self {
        let mut driver = Self::new(config, options);
        driver.base = base;
        driver
    }

    async fn get(&self, path: &str) -> Result<Value, DriverError> {
        let url = format!("{}{}", self.base, path);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(|e| DriverError::DetectFailed(format!("GET {}: {}", url, e)))?;
        let status = resp.status().as_u16();
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        if status >= 400 {
            return Err(DriverError::DetectFailed(do_error(&url, status, &body)));
        }
        Ok(body)
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, DriverError> {
        let url = format!("{}{}", self.base, path);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| DriverError::CreateFailed(format!("POST {}: {}", url, e)))?;
        let status = resp.status().as_u16();
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        if status >= 400 {
            return Err(DriverError::CreateFailed(do_error(&url, status, &body)));
        }
        Ok(body)
    }

    async fn sizes(&self) -> Result<&HashMap<String, u32>, DriverError> {
        self.size_cache
            .get_or_try_init(|| async {
                let body = self.get("/v2/sizes?per_page=200").await?;
                let mut sizes = HashMap::new();
                for size in body["sizes"].as_array().into_iter().flatten() {
                    if let (Some(slug), Some(disk)) =
                        (size["slug"].as_str(), size["disk"].as_u64())
                    {
                        sizes.insert(slug.to_string(), disk as u32);
                    }
                }
                Ok(sizes)
            })
            .await
    }

    async fn find_or_import_keypair(&self, pubkey: &str) -> Result<KeyPairInfo, DriverError> {
        let fingerprint = openssh_fingerprint(pubkey)?;

        let body = self.get("/v2/account/keys?per_page=200").await?;
        for key in body["ssh_keys"].as_array().into_iter().flatten() {
            if key["fingerprint"].as_str() == Some(fingerprint.as_str()) {
                return Ok(KeyPairInfo {
                    name: key["name"].as_str().unwrap_or_default().to_string(),
                    fingerprint,
                });
            }
        }

        let name = keypair_name(pubkey)?;
        self.post(
            "/v2/account/keys",
            &json!({ "name": name, "public_key": pubkey }),
        )
        .await?;
        Ok(KeyPairInfo { name, fingerprint })
    }
}

fn do_error(url: &str, status: u16, body: &Value) -> String {
    let message = body["message"].as_str().unwrap_or("unknown error");
    format!("{}: HTTP {}: {}", url, status, message)
}

#[async_trait]
impl CloudDriver for DigitalOceanDriver {
    fn provider_name(&self) -> &'static str {
        "digitalocean"
    }

    fn options(&self) -> &DriverOptions {
        &self.options
    }

    async fn detect_nodes(&self) -> Result<Vec<Node>, DriverError> {
        let sizes = self.sizes().await?.clone();
        let body = self.get("/v2/droplets?per_page=200").await?;

        let mut nodes = Vec::new();
        for droplet in body["droplets"].as_array().into_iter().flatten() {
            if droplet["status"].as_str() == Some("off") {
                continue;
            }
            // Droplets carry no namespace metadata; a namespaced run sees none.
            if !self.is_namespace_relevant(None) {
                continue;
            }

            let slug = droplet["size_slug"].as_str().unwrap_or_default();
            let mut node = Node::new(
                droplet["name"].as_str().unwrap_or_default(),
                slug,
                droplet["image"]["id"]
                    .as_u64()
                    .map(|id| id.to_string())
                    .unwrap_or_default(),
                sizes.get(slug).copied().unwrap_or(0),
            );
            node.provider_id = droplet["id"].as_u64().map(|id| id.to_string());
            for network in droplet["networks"]["v4"].as_array().into_iter().flatten() {
                if network["type"].as_str() == Some("public") {
                    if let Some(ip) = network["ip_address"].as_str() {
                        node.public_ips.push(ip.to_string());
                    }
                }
            }

            info!("Detected node: {}", node.name);
            nodes.push(node);
        }
        Ok(nodes)
    }

    /// DigitalOcean nodes manage their own firewall locally; nothing to
    /// detect on the provider side.
    async fn detect_firewalls(
        &self,
    ) -> Result<(HashSet<SecurityGroup>, HashSet<SecurityGroupRule>), DriverError> {
        Ok((HashSet::new(), HashSet::new()))
    }

    async fn create_node(&self, node: &mut Node) -> Result<(), DriverError> {
        info!("Launching node: {}", node.name);

        let mut body = json!({
            "name": node.name,
            "region": self.config.location,
            "size": self.apply_mappings("flavors", &node.flavor),
            "image": self.apply_mappings("images", &node.image),
        });
        if let Some(script) = &node.script {
            body["user_data"] = json!(script);
        }
        if let Some(key_file) = &self.config.ssh_key_file {
            let path = expand_path(key_file);
            let pubkey = std::fs::read_to_string(&path)
                .map_err(|e| DriverError::Config(format!("read {}: {}", path.display(), e)))?;
            let info = self.find_or_import_keypair(pubkey.trim_end()).await?;
            body["ssh_keys"] = json!([info.fingerprint]);
        }

        let resp = self.post("/v2/droplets", &body).await?;
        node.provider_id = resp["droplet"]["id"].as_u64().map(|id| id.to_string());
        if let Some(ip) = resp["droplet"]["networks"]["v4"][0]["ip_address"].as_str() {
            node.public_ips.push(ip.to_string());
        }

        info!("Launched node: {}", node.name);
        Ok(())
    }

    async fn create_security_group(&self, _group: &SecurityGroup) -> Result<(), DriverError> {
        Ok(())
    }

    async fn create_security_group_rule(
        &self,
        _rule: &SecurityGroupRule,
    ) -> Result<(), DriverError> {
        Ok(())
    }

    async fn delete_node(&self, node: &Node) -> Result<(), DriverError> {
        let id = node.provider_id.as_deref().ok_or_else(|| {
            DriverError::DeleteFailed(format!("node {} has no droplet id", node.name))
        })?;
        let url = format!("{}/v2/droplets/{}", self.base, id);
        let resp = self
            .client
            .delete(&url)
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(|e| DriverError::DeleteFailed(format!("DELETE {}: {}", url, e)))?;
        if resp.status().as_u16() >= 400 {
            return Err(DriverError::DeleteFailed(format!(
                "DELETE {}: HTTP {}",
                url,
                resp.status()
            )));
        }
        Ok(())
    }

    /// The firewall-manager daemon runs on every node and applies `fwconf`
    /// locally, which is why it ships as an implicit container.
    fn default_containers(&self, _collection: &Collection) -> Vec<Value> {
        vec![json!({
            "image": "strato/fwmanager",
            "name": "fwmanager",
            "privileged": true,
            "host_network": true,
            "nodes": ".*",
        })]
    }

    fn cluster_data(&self, collection: &Collection) -> Value {
        let collection = collection.original();

        let mut containers = self.default_containers(collection);
        containers.extend(collection.containers.iter().cloned());

        // fwconf must serialize identically across runs: nodes sort
        // lexically, rules by their serialized form.
        let mut security_groups: serde_json::Map<String, Value> = Default::default();
        for node in &collection.nodes {
            for group in &node.security_groups {
                let entry = security_groups
                    .entry(group.name.clone())
                    .or_insert_with(|| json!({"nodes": [], "rules": []}));
                entry["nodes"]
                    .as_array_mut()
                    .expect("nodes is an array")
                    .push(json!(node.name));
            }
        }
        for rule in &collection.security_group_rules {
            let mut entry = serde_json::Map::new();
            match (rule.source.source_ip(), rule.source.source_group()) {
                (Some(ip), _) => {
                    entry.insert("source_ip".into(), json!(ip));
                }
                (None, Some(group)) => {
                    entry.insert("source_group".into(), json!(group));
                }
                (None, None) => {}
            }
            if let (Some(from), Some(to)) = (rule.from_port, rule.to_port) {
                entry.insert("from_port".into(), json!(from));
                entry.insert("to_port".into(), json!(to));
            }
            if !rule.protocol.is_empty() {
                entry.insert("protocol".into(), json!(rule.protocol));
            }
            if let Some(group) = security_groups.get_mut(&rule.security_group) {
                group["rules"]
                    .as_array_mut()
                    .expect("rules is an array")
                    .push(Value::Object(entry));
            }
        }
        for group in security_groups.values_mut() {
            let nodes = group["nodes"].as_array_mut().expect("nodes is an array");
            nodes.sort_by_key(|v| v.as_str().unwrap_or_default().to_string());
            let rules = group["rules"].as_array_mut().expect("rules is an array");
            rules.sort_by_key(|v| v.to_string());
        }

        json!({
            "containers": containers,
            "proxyconf": proxyconf(collection),
            "fwconf": { "security_groups": security_groups },
        })
    }
}
