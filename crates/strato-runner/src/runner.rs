use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use strato_config::cloud::Mappings;
use strato_config::raw::{RawNode, RawStack};
use strato_model::{NetworkAttachment, PortRecord};
use strato_driver::OpenStackDriver;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::error::RunnerError;
use crate::shell::{run_cmd_once, run_with_retries, shell_quote, RetryPolicy, ShellStep};

/// Pause between full polling passes over pending nodes.
const POLL_INTERVAL: Duration = Duration::from_secs(5);

// ── Deployment config ─────────────────────────────────────────────────────────

/// A deployment config file: named deployments, each an ordered list of
/// steps.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeploymentConfig(pub BTreeMap<String, Vec<Step>>);

impl DeploymentConfig {
    pub fn load(path: &Path) -> Result<Self, RunnerError> {
        let content = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&content)
            .map_err(|e| RunnerError::InvalidConfig(format!("{}: {}", path.display(), e)))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Step {
    Provision(ProvisionStep),
    Shell(ShellStep),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProvisionStep {
    /// Stack document describing networks, security groups and nodes.
    pub stack: String,
    /// File whose contents become the servers' user data.
    pub userdata: Option<String>,
}

// ── Node state ────────────────────────────────────────────────────────────────

/// A node being provisioned: its declaration plus everything created for it
/// so far. Only the runner's single polling task touches this state.
#[derive(Debug, Clone)]
pub struct RunnerNode {
    /// Suffixed name as it appears in the cloud.
    pub name: String,
    pub flavor: String,
    pub image: String,
    pub disk: u32,
    pub networks: Vec<NetworkAttachment>,
    pub export: bool,
    pub keypair: Option<String>,
    pub userdata: Option<String>,
    pub flavor_ref: Option<String>,
    pub server_id: Option<String>,
    pub ports: Vec<PortRecord>,
    pub fip_ids: BTreeSet<String>,
    pub server_status: Option<String>,
    pub attempts_left: u32,
}

impl RunnerNode {
    fn new(
        name: String,
        info: &RawNode,
        keypair: Option<&str>,
        userdata: Option<&str>,
        retry_count: u32,
        mappings: &Mappings,
    ) -> Self {
        RunnerNode {
            name,
            // symbolic references resolve once, at declaration time
            flavor: mappings.apply("flavors", &info.flavor),
            image: mappings.apply("images", &info.image),
            disk: info.disk,
            networks: info.networks.clone(),
            export: info.export,
            keypair: keypair.map(str::to_string),
            userdata: userdata.map(str::to_string),
            flavor_ref: None,
            server_id: None,
            ports: Vec::new(),
            fip_ids: BTreeSet::new(),
            server_status: None,
            attempts_left: retry_count + 1,
        }
    }

    /// Bare shell for a node discovered by incremental detection.
    fn detected(name: String) -> Self {
        RunnerNode {
            name,
            flavor: String::new(),
            image: String::new(),
            disk: 0,
            networks: Vec::new(),
            export: false,
            keypair: None,
            userdata: None,
            flavor_ref: None,
            server_id: None,
            ports: Vec::new(),
            fip_ids: BTreeSet::new(),
            server_status: None,
            attempts_left: 1,
        }
    }

    pub fn floating_ip(&self) -> Option<&str> {
        self.ports.iter().find_map(|p| p.floating_ip.as_deref())
    }
}

// ── DeploymentRunner ──────────────────────────────────────────────────────────

/// Drives a named, multi-step deployment against OpenStack: staged creation
/// of networks, security groups and nodes, a polling loop with per-node
/// retry budgets, and shell steps against the freshly built hosts.
pub struct DeploymentRunner {
    pub config: DeploymentConfig,
    pub suffix: Option<String>,
    pub mappings: Mappings,
    /// Public key material to register as a keypair before provisioning.
    pub key: Option<String>,
    pub retry_count: u32,
    pub driver: Arc<OpenStackDriver>,

    /// base name → provider id
    pub networks: HashMap<String, String>,
    pub secgroups: HashMap<String, String>,
    /// base name → node state; populated before the polling loop reads it
    pub nodes: BTreeMap<String, RunnerNode>,
}

impl DeploymentRunner {
    pub fn new(driver: Arc<OpenStackDriver>) -> Self {
        DeploymentRunner {
            config: DeploymentConfig::default(),
            suffix: None,
            mappings: Mappings::new(),
            key: None,
            retry_count: 0,
            driver,
            networks: HashMap::new(),
            secgroups: HashMap::new(),
            nodes: BTreeMap::new(),
        }
    }

    /// `"{base}_{suffix}"`, or the base name alone when no suffix is set.
    /// The suffix keeps parallel deployments in one tenant disjoint.
    pub fn add_suffix(&self, base: &str) -> String {
        match &self.suffix {
            Some(suffix) => format!("{}_{}", base, suffix),
            None => base.to_string(),
        }
    }

    fn map_network(&self, network: &str) -> String {
        if let Some(mapped) = self.mappings.get("networks", network) {
            return mapped.to_string();
        }
        if let Some(id) = self.networks.get(network) {
            return id.clone();
        }
        network.to_string()
    }

    // ── Incremental detection ─────────────────────────────────────────────────

    /// Discover suffix-matching resources already present in the tenant so
    /// a re-run skips them. Two resources collapsing onto one base name is
    /// an error: it means the suffix convention was violated.
    pub async fn detect_existing_resources(&mut self) -> Result<(), RunnerError> {
        let suffix = match &self.suffix {
            Some(suffix) => format!("_{}", suffix),
            None => String::new(),
        };
        let strip = |name: &str| name[..name.len() - suffix.len()].to_string();

        let mut network_name_by_id: HashMap<String, String> = HashMap::new();
        for network in self.driver.get_networks().await? {
            let Some(name) = network["name"].as_str() else { continue };
            if !name.ends_with(&suffix) {
                continue;
            }
            let base = strip(name);
            if self.networks.contains_key(&base) {
                return Err(RunnerError::DuplicateResource {
                    kind: "network",
                    name: name.to_string(),
                });
            }
            let id = network["id"].as_str().unwrap_or_default().to_string();
            network_name_by_id.insert(id.clone(), base.clone());
            self.networks.insert(base, id);
        }

        let mut ports_by_id: HashMap<String, PortRecord> = HashMap::new();
        let mut port_id_by_mac: HashMap<String, String> = HashMap::new();
        for port in self.driver.get_ports().await? {
            let id = port["id"].as_str().unwrap_or_default().to_string();
            let network_id = port["network_id"].as_str().unwrap_or_default();
            let record = PortRecord {
                id: id.clone(),
                fixed_ip: port["fixed_ips"][0]["ip_address"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string(),
                mac: port["mac_address"].as_str().unwrap_or_default().to_string(),
                network_name: network_name_by_id
                    .get(network_id)
                    .cloned()
                    .unwrap_or_else(|| network_id.to_string()),
                floating_ip: None,
            };
            port_id_by_mac.insert(record.mac.clone(), id.clone());
            ports_by_id.insert(id, record);
        }

        for fip in self.driver.get_floating_ips().await? {
            let Some(port_id) = fip["port_id"].as_str() else { continue };
            if let Some(port) = ports_by_id.get_mut(port_id) {
                port.floating_ip = fip["floating_ip_address"].as_str().map(str::to_string);
            }
        }

        for secgroup in self.driver.get_security_groups().await? {
            let Some(name) = secgroup["name"].as_str() else { continue };
            if !name.ends_with(&suffix) {
                continue;
            }
            let base = strip(name);
            if self.secgroups.contains_key(&base) {
                return Err(RunnerError::DuplicateResource {
                    kind: "security group",
                    name: name.to_string(),
                });
            }
            self.secgroups
                .insert(base, secgroup["id"].as_str().unwrap_or_default().to_string());
        }

        for server in self.driver.get_servers().await? {
            let Some(name) = server["name"].as_str() else { continue };
            if !name.ends_with(&suffix) {
                continue;
            }
            let base = strip(name);
            if self.nodes.contains_key(&base) {
                return Err(RunnerError::DuplicateResource {
                    kind: "node",
                    name: name.to_string(),
                });
            }

            let mut node = RunnerNode::detected(name.to_string());
            node.server_id = server["id"].as_str().map(str::to_string);
            for addresses in server["addresses"]
                .as_object()
                .into_iter()
                .flat_map(|nets| nets.values())
            {
                let Some(mac) = addresses[0]["OS-EXT-IPS-MAC:mac_addr"].as_str() else {
                    continue;
                };
                if let Some(port_id) = port_id_by_mac.get(mac) {
                    node.ports.push(ports_by_id[port_id].clone());
                }
            }
            info!("Detected existing node: {}", node.name);
            self.nodes.insert(base, node);
        }

        Ok(())
    }

    // ── Provisioning ──────────────────────────────────────────────────────────

    pub async fn provision_step(&mut self, details: &ProvisionStep) -> Result<(), RunnerError> {
        let stack: RawStack = strato_config::load_stack_raw(Path::new(&details.stack))?;

        let keypair_name = match &self.key {
            Some(key) => {
                let name = self.add_suffix("pubkey");
                self.driver
                    .create_keypair(&name, key, self.retry_count)
                    .await?;
                Some(name)
            }
            None => None,
        };

        let userdata = match &details.userdata {
            Some(path) => Some(std::fs::read_to_string(path)?),
            None => None,
        };

        for (base, network) in &stack.networks {
            if self.networks.contains_key(base) {
                continue;
            }
            let name = self.add_suffix(base);
            let id = self
                .driver
                .create_network(&name, &network.cidr, &self.mappings)
                .await?;
            self.networks.insert(base.clone(), id);
        }

        for (base, rules) in &stack.security_groups {
            if self.secgroups.contains_key(base) {
                continue;
            }
            let name = self.add_suffix(base);
            self.driver
                .create_security_group_with_rules(base, &name, rules, &mut self.secgroups)
                .await?;
        }

        let mut pending: BTreeSet<String> = BTreeSet::new();
        for (base, info) in &stack.nodes {
            match info.count {
                Some(count) => {
                    for idx in 1..=count {
                        let numbered = format!("{}{}", base, idx);
                        if self
                            .create_node(&numbered, info, keypair_name.as_deref(), userdata.as_deref())
                            .await?
                        {
                            pending.insert(numbered);
                        }
                    }
                }
                None => {
                    if self
                        .create_node(base, info, keypair_name.as_deref(), userdata.as_deref())
                        .await?
                    {
                        pending.insert(base.clone());
                    }
                }
            }
        }

        loop {
            pending = self.poll_pending_nodes(pending).await?;
            if pending.is_empty() {
                break;
            }
            sleep(POLL_INTERVAL).await;
        }
        Ok(())
    }

    /// Returns true if the node was created (false: already known).
    async fn create_node(
        &mut self,
        base_name: &str,
        info: &RawNode,
        keypair: Option<&str>,
        userdata: Option<&str>,
    ) -> Result<bool, RunnerError> {
        if self.nodes.contains_key(base_name) {
            return Ok(false);
        }
        let node = RunnerNode::new(
            self.add_suffix(base_name),
            info,
            keypair,
            userdata,
            self.retry_count,
            &self.mappings,
        );
        self.nodes.insert(base_name.to_string(), node);
        self.build_node(base_name).await?;
        Ok(true)
    }

    async fn build_node(&mut self, base_name: &str) -> Result<(), RunnerError> {
        let mut node = self.nodes.remove(base_name).expect("node registered");
        let result = self.build(&mut node).await;
        self.nodes.insert(base_name.to_string(), node);
        result
    }

    /// Ports (with floating IPs where requested), volume, then the server
    /// booted from that volume.
    async fn build(&self, node: &mut RunnerNode) -> Result<(), RunnerError> {
        info!("Building node {}", node.name);

        if node.flavor_ref.is_none() {
            node.flavor_ref = Some(self.driver.get_flavor(&node.flavor).await?);
        }

        let networks = node.networks.clone();
        for (eth_idx, attachment) in networks.iter().enumerate() {
            let port_name = format!("{}_eth{}", node.name, eth_idx);
            let network_id = self.map_network(&attachment.network);
            let secgroup_ids = attachment
                .securitygroups
                .iter()
                .map(|name| {
                    self.secgroups.get(name).cloned().ok_or_else(|| {
                        RunnerError::InvalidConfig(format!("unknown security group '{}'", name))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;

            let mut port = self
                .driver
                .create_port(&port_name, &attachment.network, &network_id, &secgroup_ids)
                .await?;

            if attachment.assign_floating_ip {
                let (fip_id, fip_address) = self.driver.create_floating_ip().await?;
                self.driver.associate_floating_ip(&port.id, &fip_id).await?;
                port.floating_ip = Some(fip_address);
                node.fip_ids.insert(fip_id);
            }

            node.ports.push(port);
        }

        let (volume_id, status) = self
            .driver
            .create_volume(node.disk, &node.image, self.retry_count)
            .await?;
        if status != "available" {
            self.driver.wait_for_volume(&volume_id).await?;
        }

        let port_ids: Vec<String> = node.ports.iter().map(|p| p.id.clone()).collect();
        let server_id = self
            .driver
            .create_server(
                &node.name,
                &volume_id,
                node.flavor_ref.as_deref().expect("flavor resolved above"),
                &port_ids,
                node.keypair.as_deref(),
                node.userdata.as_deref(),
                &[],
            )
            .await?;

        node.server_id = Some(server_id);
        node.server_status = None;
        node.attempts_left -= 1;
        Ok(())
    }

    /// Release the node's floating IPs, ports and server so a fresh build
    /// can start over.
    async fn clean_node(&mut self, base_name: &str) -> Result<(), RunnerError> {
        let mut node = self.nodes.remove(base_name).expect("node registered");
        let result = self.clean(&mut node).await;
        self.nodes.insert(base_name.to_string(), node);
        result
    }

    async fn clean(&self, node: &mut RunnerNode) -> Result<(), RunnerError> {
        info!("Cleaning node {}", node.name);
        for fip_id in std::mem::take(&mut node.fip_ids) {
            self.driver.delete_floatingip(&fip_id).await?;
        }
        for port in std::mem::take(&mut node.ports) {
            self.driver.delete_port(&port.id).await?;
        }
        if let Some(server_id) = node.server_id.take() {
            self.driver.delete_server(&server_id).await?;
        }
        node.server_status = None;
        Ok(())
    }

    /// One polling pass. ACTIVE nodes leave the pending set; ERROR nodes
    /// are rebuilt while the retry budget lasts, otherwise the whole
    /// deployment fails.
    async fn poll_pending_nodes(
        &mut self,
        pending: BTreeSet<String>,
    ) -> Result<BTreeSet<String>, RunnerError> {
        let mut done = BTreeSet::new();

        for base_name in &pending {
            let status = self.poll_node(base_name).await?;
            match status.as_str() {
                "ACTIVE" => {
                    info!("Node {} is active", base_name);
                    done.insert(base_name.clone());
                }
                "ERROR" => {
                    warn!("Node {} entered ERROR", base_name);
                    if self.retry_count > 0 {
                        self.clean_node(base_name).await?;
                        if self.nodes[base_name].attempts_left > 0 {
                            self.build_node(base_name).await?;
                            continue;
                        }
                    }
                    return Err(RunnerError::ProvisionFailed(base_name.clone()));
                }
                _ => {}
            }
        }

        Ok(pending.difference(&done).cloned().collect())
    }

    async fn poll_node(&mut self, base_name: &str) -> Result<String, RunnerError> {
        let node = &self.nodes[base_name];
        if node.server_status.as_deref() == Some("ACTIVE") {
            return Ok("ACTIVE".to_string());
        }
        let server_id = node
            .server_id
            .clone()
            .ok_or_else(|| RunnerError::ProvisionFailed(base_name.to_string()))?;
        let status = self.driver.get_server_status(&server_id).await?;
        self.nodes
            .get_mut(base_name)
            .expect("node registered")
            .server_status = Some(status.clone());
        Ok(status)
    }

    // ── Shell steps ───────────────────────────────────────────────────────────

    /// The `KEY=value ` prefix exported to a shell step: every known node
    /// under `ALL_NODES`, per-port fixed IPs for exported nodes, and the
    /// step's literal environment (values starting with `$` resolve from
    /// the process environment).
    pub fn build_env_prefix(&self, step: &ShellStep) -> String {
        let mut prefix = String::new();
        let mut add = |key: &str, value: &str| {
            prefix.push_str(&format!("{}={} ", shell_quote(key), shell_quote(value)));
        };

        let all_nodes: Vec<String> = self
            .nodes
            .keys()
            .map(|base| self.add_suffix(base))
            .collect();
        add("ALL_NODES", &all_nodes.join(" "));

        for (base_name, node) in &self.nodes {
            if !node.export {
                continue;
            }
            for port in &node.ports {
                let key = format!("AASEMBLE_{}_{}_fixed", base_name, port.network_name);
                add(&key, &port.fixed_ip);
            }
        }

        for (key, value) in &step.environment {
            let resolved = match value.strip_prefix('$') {
                Some(var) => std::env::var(var).unwrap_or_default(),
                None => value.clone(),
            };
            add(key, &resolved);
        }

        prefix
    }

    pub fn shell_step_cmd(&self, step: &ShellStep, env_prefix: &str) -> Result<String, RunnerError> {
        if !step.is_remote() {
            return Ok(format!("{}bash", env_prefix));
        }

        let node_name = step.node.as_deref().ok_or_else(|| {
            RunnerError::InvalidConfig("remote shell step names no node".into())
        })?;
        let node = self.nodes.get(node_name).ok_or_else(|| {
            RunnerError::InvalidConfig(format!("remote shell step names unknown node '{}'", node_name))
        })?;
        let fip = node.floating_ip().ok_or_else(|| {
            RunnerError::InvalidConfig(format!("node '{}' has no floating IP", node_name))
        })?;
        Ok(format!(
            "ssh -o StrictHostKeyChecking=no ubuntu@{} \"{}bash\"",
            fip, env_prefix
        ))
    }

    pub async fn shell_step(&self, step: &ShellStep) -> Result<(), RunnerError> {
        let env_prefix = self.build_env_prefix(step);
        let cmd = self.shell_step_cmd(step, &env_prefix)?;
        let policy = RetryPolicy::from_step(step)?;
        run_with_retries(&policy, |deadline| run_cmd_once(&cmd, &step.cmd, deadline)).await
    }

    // ── Entry point ───────────────────────────────────────────────────────────

    /// Execute a named deployment's steps in order.
    pub async fn deploy(&mut self, name: &str) -> Result<(), RunnerError> {
        let steps = self
            .config
            .0
            .get(name)
            .cloned()
            .ok_or_else(|| RunnerError::InvalidConfig(format!("no deployment named '{}'", name)))?;

        for step in steps {
            match step {
                Step::Provision(details) => self.provision_step(&details).await?,
                Step::Shell(details) => self.shell_step(&details).await?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strato_driver::DriverOptions;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn runner_for(server: &MockServer) -> DeploymentRunner {
        let driver = OpenStackDriver::with_session(
            "fake-token",
            server.uri(),
            server.uri(),
            server.uri(),
            DriverOptions::default(),
        );
        DeploymentRunner::new(Arc::new(driver))
    }

    async fn offline_runner() -> (MockServer, DeploymentRunner) {
        let server = MockServer::start().await;
        let runner = runner_for(&server);
        (server, runner)
    }

    #[tokio::test]
    async fn suffix_is_appended_with_underscore() {
        let (_server, mut runner) = offline_runner().await;
        assert_eq!(runner.add_suffix("web"), "web");
        runner.suffix = Some("pqr".into());
        assert_eq!(runner.add_suffix("web"), "web_pqr");
    }

    #[tokio::test]
    async fn env_prefix_lists_nodes_exports_and_environment() {
        let (_server, mut runner) = offline_runner().await;
        runner.suffix = Some("x1".into());

        let mut web = RunnerNode::detected("web_x1".into());
        web.export = true;
        web.ports.push(PortRecord {
            id: "p1".into(),
            fixed_ip: "10.0.0.5".into(),
            mac: "m1".into(),
            network_name: "default".into(),
            floating_ip: None,
        });
        runner.nodes.insert("web".into(), web);
        runner.nodes.insert("db".into(), RunnerNode::detected("db_x1".into()));

        std::env::set_var("STRATO_TEST_TOKEN", "sekrit");
        let step: ShellStep = serde_yaml::from_str(
            "cmd: \"true\"\nenvironment:\n  TOKEN: $STRATO_TEST_TOKEN\n  MODE: fast\n",
        )
        .unwrap();

        let prefix = runner.build_env_prefix(&step);
        assert_eq!(
            prefix,
            "ALL_NODES='db_x1 web_x1' AASEMBLE_web_default_fixed=10.0.0.5 MODE=fast TOKEN=sekrit "
        );
    }

    #[tokio::test]
    async fn shell_cmd_local_and_remote() {
        let (_server, mut runner) = offline_runner().await;

        let local: ShellStep = serde_yaml::from_str("cmd: hostname\n").unwrap();
        assert_eq!(runner.shell_step_cmd(&local, "A=b ").unwrap(), "A=b bash");

        let mut web = RunnerNode::detected("web".into());
        web.ports.push(PortRecord {
            id: "p1".into(),
            fixed_ip: "10.0.0.5".into(),
            mac: "m1".into(),
            network_name: "default".into(),
            floating_ip: Some("198.51.100.7".into()),
        });
        runner.nodes.insert("web".into(), web);

        let remote: ShellStep =
            serde_yaml::from_str("cmd: hostname\ntype: remote\nnode: web\n").unwrap();
        assert_eq!(
            runner.shell_step_cmd(&remote, "A=b ").unwrap(),
            "ssh -o StrictHostKeyChecking=no ubuntu@198.51.100.7 \"A=b bash\""
        );
    }

    fn detection_mocks() -> Vec<(&'static str, serde_json::Value)> {
        vec![
            (
                "/v2.0/networks",
                json!({"networks": [
                    {"id": "net-1", "name": "default_pqr"},
                    {"id": "net-2", "name": "other_abc"},
                ]}),
            ),
            (
                "/v2.0/ports",
                json!({"ports": [{
                    "id": "port-1",
                    "network_id": "net-1",
                    "mac_address": "fa:16:3e:aa:bb:cc",
                    "fixed_ips": [{"ip_address": "10.0.0.5"}],
                }]}),
            ),
            (
                "/v2.0/floatingips",
                json!({"floatingips": [{
                    "port_id": "port-1",
                    "floating_ip_address": "198.51.100.7",
                }]}),
            ),
            (
                "/v2.0/security-groups",
                json!({"security_groups": [{"id": "sg-1", "name": "www_pqr"}]}),
            ),
            (
                "/servers/detail",
                json!({"servers": [{
                    "id": "srv-1",
                    "name": "web_pqr",
                    "addresses": {"default_pqr": [
                        {"OS-EXT-IPS-MAC:mac_addr": "fa:16:3e:aa:bb:cc", "addr": "10.0.0.5"},
                    ]},
                }]}),
            ),
        ]
    }

    #[tokio::test]
    async fn incremental_detection_strips_suffix_and_wires_ports() {
        let server = MockServer::start().await;
        for (route, body) in detection_mocks() {
            Mock::given(method("GET"))
                .and(path(route))
                .respond_with(ResponseTemplate::new(200).set_body_json(body))
                .mount(&server)
                .await;
        }

        let mut runner = runner_for(&server);
        runner.suffix = Some("pqr".into());
        runner.detect_existing_resources().await.unwrap();

        assert_eq!(runner.networks.get("default"), Some(&"net-1".to_string()));
        assert!(!runner.networks.contains_key("other"));
        assert_eq!(runner.secgroups.get("www"), Some(&"sg-1".to_string()));

        let web = &runner.nodes["web"];
        assert_eq!(web.name, "web_pqr");
        assert_eq!(web.server_id.as_deref(), Some("srv-1"));
        assert_eq!(web.ports.len(), 1);
        assert_eq!(web.ports[0].network_name, "default");
        assert_eq!(web.ports[0].floating_ip.as_deref(), Some("198.51.100.7"));
        assert_eq!(web.floating_ip(), Some("198.51.100.7"));
    }

    #[tokio::test]
    async fn duplicate_base_name_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2.0/networks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "networks": [
                    {"id": "net-1", "name": "default_pqr"},
                    {"id": "net-9", "name": "default_pqr"},
                ],
            })))
            .mount(&server)
            .await;

        let mut runner = runner_for(&server);
        runner.suffix = Some("pqr".into());
        let err = runner.detect_existing_resources().await.unwrap_err();
        assert!(matches!(err, RunnerError::DuplicateResource { kind: "network", .. }));
    }

    /// A node that errors once gets cleaned, rebuilt and eventually comes
    /// up ACTIVE without failing the deployment.
    #[tokio::test(start_paused = true)]
    async fn error_node_is_rebuilt_within_retry_budget() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/flavors"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "flavors": [{"id": "f-1", "name": "small"}],
            })))
            .mount(&server)
            .await;
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
        Mock::given(method("POST"))
            .and(path("/volumes"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "volume": {"id": "vol-1", "status": "available"},
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/servers"))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({
                "server": {"id": "srv-1"},
            })))
            .mount(&server)
            .await;
        // status sequence: BUILD, BUILD, ERROR, then (rebuilt) BUILD, BUILD, ACTIVE
        for (times, status) in [(2, "BUILD"), (1, "ERROR"), (2, "BUILD")] {
            Mock::given(method("GET"))
                .and(path("/servers/srv-1"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "server": {"id": "srv-1", "status": status},
                })))
                .up_to_n_times(times)
                .mount(&server)
                .await;
        }
        Mock::given(method("GET"))
            .and(path("/servers/srv-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "server": {"id": "srv-1", "status": "ACTIVE"},
            })))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/v2.0/ports/port-1"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/servers/srv-1"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let stack_dir = tempfile::tempdir().unwrap();
        let stack_path = stack_dir.path().join("stack.yaml");
        std::fs::write(
            &stack_path,
            "nodes:\n  web:\n    flavor: small\n    image: img-1\n    disk: 10\n    networks:\n      - network: net-1\n",
        )
        .unwrap();

        let mut runner = runner_for(&server);
        runner.retry_count = 2;
        runner
            .provision_step(&ProvisionStep {
                stack: stack_path.display().to_string(),
                userdata: None,
            })
            .await
            .unwrap();

        let requests = server.received_requests().await.unwrap();
        let count = |m: &str, p: &str| {
            requests
                .iter()
                .filter(|r| r.method.as_str() == m && r.url.path() == p)
                .count()
        };
        // one clean (server + port deleted once) and one rebuild
        assert_eq!(count("POST", "/servers"), 2);
        assert_eq!(count("DELETE", "/servers/srv-1"), 1);
        assert_eq!(count("DELETE", "/v2.0/ports/port-1"), 1);

        assert_eq!(
            runner.nodes["web"].server_status.as_deref(),
            Some("ACTIVE")
        );
        // two of the three attempts were spent
        assert_eq!(runner.nodes["web"].attempts_left, 1);
    }

    #[tokio::test]
    async fn exhausted_retry_budget_fails_the_deployment() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/servers/srv-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "server": {"id": "srv-1", "status": "ERROR"},
            })))
            .mount(&server)
            .await;

        let mut runner = runner_for(&server);
        // no retry budget at all
        let mut node = RunnerNode::detected("web".into());
        node.server_id = Some("srv-1".into());
        node.attempts_left = 0;
        runner.nodes.insert("web".into(), node);

        let pending: BTreeSet<String> = ["web".to_string()].into_iter().collect();
        let err = runner.poll_pending_nodes(pending).await.unwrap_err();
        assert!(matches!(err, RunnerError::ProvisionFailed(name) if name == "web"));
    }

    #[tokio::test]
    async fn deployment_config_parses_step_kinds() {
        let config: DeploymentConfig = serde_yaml::from_str(
            r#"
full:
  - provision:
      stack: stack.yaml
  - shell:
      cmd: echo done
      type: remote
      node: web
"#,
        )
        .unwrap();

        let steps = &config.0["full"];
        assert_eq!(steps.len(), 2);
        assert!(matches!(steps[0], Step::Provision(_)));
        assert!(matches!(&steps[1], Step::Shell(s) if s.is_remote()));
    }
}
