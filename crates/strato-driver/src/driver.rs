use std::collections::HashSet;
use std::path::PathBuf;

use async_trait::async_trait;
use base64::Engine;
use md5::{Digest, Md5};
use serde_json::{json, Value};
use strato_config::cloud::Mappings;
use strato_model::{Collection, Node, SecurityGroup, SecurityGroupRule, UrlConf};
use tracing::info;

use crate::cluster::ClusterClient;
use crate::error::DriverError;
use crate::pool::WorkerPool;

// ── Resource recording ────────────────────────────────────────────────────────

/// Sink for created-resource records. The OpenStack driver pushes every
/// created handle here so a later cleanup can tear them down in reverse.
pub trait ResourceRecorder: Send + Sync {
    fn record(&self, resource_type: &str, id: &str);
}

/// Recorder that drops everything. Used when no cleanup log is requested.
pub struct NullRecorder;

impl ResourceRecorder for NullRecorder {
    fn record(&self, _resource_type: &str, _id: &str) {}
}

// ── Shared driver state ───────────────────────────────────────────────────────

/// Settings common to every provider driver.
#[derive(Default)]
pub struct DriverOptions {
    /// Partition tag for sharing one cloud account between deployments.
    /// `None` means every node in the account is relevant.
    pub namespace: Option<String>,
    /// Symbolic image/flavor translation from the cloud config.
    pub mappings: Mappings,
    pub pool: WorkerPool,
    /// When set, `apply_resources` pushes the topology here before creating
    /// anything.
    pub cluster: Option<ClusterClient>,
}

/// Result of a key-pair find-or-import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPairInfo {
    pub name: String,
    pub fingerprint: String,
}

// ── Driver interface ──────────────────────────────────────────────────────────

/// A provider driver. Implementations supply detection and per-resource
/// creation; the reconciliation pipeline (detect → diff → apply → clean)
/// lives here as default methods so providers override only what differs.
#[async_trait]
pub trait CloudDriver: Send + Sync {
    fn provider_name(&self) -> &'static str;

    fn options(&self) -> &DriverOptions;

    // ── Detection ─────────────────────────────────────────────────────────────

    async fn detect_nodes(&self) -> Result<Vec<Node>, DriverError>;

    async fn detect_firewalls(
        &self,
    ) -> Result<(HashSet<SecurityGroup>, HashSet<SecurityGroupRule>), DriverError>;

    async fn detect_resources(&self) -> Result<Collection, DriverError> {
        let mut collection = Collection::new();

        info!("Detecting nodes");
        for node in self.detect_nodes().await? {
            collection.nodes.add(node);
        }

        info!("Detecting security groups and security group rules");
        let (groups, rules) = self.detect_firewalls().await?;
        for group in groups {
            collection.security_groups.add(group);
        }
        for rule in rules {
            collection.security_group_rules.insert(rule);
        }

        collection.connect();
        Ok(collection)
    }

    // ── Creation ──────────────────────────────────────────────────────────────

    /// Create the instance and fill in the node's runtime fields.
    async fn create_node(&self, node: &mut Node) -> Result<(), DriverError>;

    async fn create_security_group(&self, group: &SecurityGroup) -> Result<(), DriverError>;

    async fn create_security_group_rule(
        &self,
        rule: &SecurityGroupRule,
    ) -> Result<(), DriverError>;

    // ── Deletion ──────────────────────────────────────────────────────────────

    async fn delete_node(&self, node: &Node) -> Result<(), DriverError>;

    async fn delete_security_group(&self, _group: &SecurityGroup) -> Result<(), DriverError> {
        Ok(())
    }

    async fn delete_security_group_rule(
        &self,
        _rule: &SecurityGroupRule,
    ) -> Result<(), DriverError> {
        Ok(())
    }

    // ── Cluster metadata ──────────────────────────────────────────────────────

    /// Containers every deployment on this provider carries implicitly.
    fn default_containers(&self, _collection: &Collection) -> Vec<Value> {
        Vec::new()
    }

    /// Provider-specific topology document for the cluster endpoint. Each
    /// driver's shape is its own contract; see the provider modules.
    fn cluster_data(&self, collection: &Collection) -> Value {
        let collection = collection.original();
        let mut containers = self.default_containers(collection);
        containers.extend(collection.containers.iter().cloned());
        json!({ "containers": containers })
    }

    async fn update_cluster(&self, collection: &Collection) -> Result<(), DriverError> {
        if let Some(cluster) = &self.options().cluster {
            cluster.update(&self.cluster_data(collection)).await?;
        }
        Ok(())
    }

    // ── Pipeline ──────────────────────────────────────────────────────────────

    /// Groups, then nodes, then rules; each batch fully parallel. Rules come
    /// after groups because they may reference groups that do not exist yet.
    async fn apply_resources(&self, collection: &mut Collection) -> Result<(), DriverError> {
        self.update_cluster(collection).await?;

        let pool = self.options().pool.clone();

        let group_futs: Vec<_> = collection
            .security_groups
            .iter()
            .map(|group| self.create_security_group(group))
            .collect();
        pool.map(group_futs).await?;

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

    /// Reverse of apply: nodes, then rules, then groups.
    async fn clean_resources(&self, collection: &Collection) -> Result<(), DriverError> {
        let pool = self.options().pool.clone();

        let node_futs: Vec<_> = collection.nodes.iter().map(|node| self.delete_node(node)).collect();
        pool.map(node_futs).await?;

        let rule_futs: Vec<_> = collection
            .security_group_rules
            .iter()
            .map(|rule| self.delete_security_group_rule(rule))
            .collect();
        pool.map(rule_futs).await?;

        let group_futs: Vec<_> = collection
            .security_groups
            .iter()
            .map(|group| self.delete_security_group(group))
            .collect();
        pool.map(group_futs).await?;

        Ok(())
    }

    // ── Shared helpers ────────────────────────────────────────────────────────

    /// Translate a symbolic image/flavor name via the cloud config mappings.
    fn apply_mappings(&self, kind: &str, name: &str) -> String {
        self.options().mappings.apply(kind, name)
    }

    /// True unless a namespace is configured and the node's advertised
    /// namespace differs.
    fn is_namespace_relevant(&self, node_namespace: Option<&str>) -> bool {
        match &self.options().namespace {
            None => true,
            Some(ns) => node_namespace == Some(ns.as_str()),
        }
    }
}

// ── Proxy configuration ───────────────────────────────────────────────────────

/// Build the `proxyconf` document shared by the AWS, GCE and DigitalOcean
/// cluster data shapes: hostname → path → backend route, plus the unique
/// set of backend host prefixes.
pub(crate) fn proxyconf(collection: &Collection) -> Value {
    let mut domains = serde_json::Map::new();
    let mut backends: std::collections::BTreeSet<String> = Default::default();

    for url in &collection.urls {
        let paths = domains
            .entry(url.hostname().to_string())
            .or_insert_with(|| Value::Object(Default::default()));

        if let UrlConf::Backend { path, destination, .. } = url {
            paths[path] = json!({
                "type": "backend",
                "destination": destination,
            });
            let host = destination.split('/').next().unwrap_or(destination);
            backends.insert(host.to_string());
        }
    }

    json!({ "domains": domains, "backends": backends })
}

// ── Key material helpers ──────────────────────────────────────────────────────

/// MD5 fingerprint of an OpenSSH public key: colon-separated hex over the
/// base64-decoded key blob.
pub fn openssh_fingerprint(pubkey: &str) -> Result<String, DriverError> {
    let blob = pubkey
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| DriverError::Config("malformed OpenSSH public key".into()))?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(blob)
        .map_err(|e| DriverError::Config(format!("public key is not base64: {}", e)))?;

    let digest = Md5::digest(&decoded);
    Ok(digest
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":"))
}

/// The comment field of an OpenSSH public key, or "unnamed".
pub fn pubkey_comment(pubkey: &str) -> String {
    pubkey
        .split_whitespace()
        .nth(2)
        .filter(|c| !c.is_empty())
        .unwrap_or("unnamed")
        .to_string()
}

/// The name an imported key pair gets: `{comment}-{fingerprint}`.
pub fn keypair_name(pubkey: &str) -> Result<String, DriverError> {
    Ok(format!("{}-{}", pubkey_comment(pubkey), openssh_fingerprint(pubkey)?))
}

/// Resolve a leading `~` against `$HOME`. No `$VAR` expansion.
pub fn expand_path(path: &str) -> PathBuf {
    if path == "~" {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home);
        }
    } else if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use strato_model::RuleSource;

    // An ssh-rsa key blob is opaque to the fingerprint computation; any
    // base64 payload works for testing.
    const PUBKEY: &str = "ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAABAQC7 user@host";
    const PUBKEY_NO_COMMENT: &str = "ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAABAQC7";

    #[test]
    fn fingerprint_is_colon_separated_md5() {
        let fp = openssh_fingerprint(PUBKEY).unwrap();
        let parts: Vec<&str> = fp.split(':').collect();
        assert_eq!(parts.len(), 16);
        assert!(parts.iter().all(|p| p.len() == 2));
    }

    #[test]
    fn fingerprint_ignores_comment() {
        assert_eq!(
            openssh_fingerprint(PUBKEY).unwrap(),
            openssh_fingerprint(PUBKEY_NO_COMMENT).unwrap()
        );
    }

    #[test]
    fn comment_defaults_to_unnamed() {
        assert_eq!(pubkey_comment(PUBKEY), "user@host");
        assert_eq!(pubkey_comment(PUBKEY_NO_COMMENT), "unnamed");
    }

    #[test]
    fn keypair_name_joins_comment_and_fingerprint() {
        let name = keypair_name(PUBKEY).unwrap();
        assert!(name.starts_with("user@host-"));
        assert!(name.ends_with(&openssh_fingerprint(PUBKEY).unwrap()));
    }

    #[test]
    fn expand_path_resolves_tilde_only() {
        std::env::set_var("HOME", "/home/tester");
        assert_eq!(expand_path("~/keys/id_rsa.pub"), PathBuf::from("/home/tester/keys/id_rsa.pub"));
        assert_eq!(expand_path("~"), PathBuf::from("/home/tester"));
        assert_eq!(expand_path("/abs/$HOME/path"), PathBuf::from("/abs/$HOME/path"));
    }

    #[test]
    fn proxyconf_dedups_backends_by_host() {
        let mut c = Collection::new();
        c.urls.push(UrlConf::Backend {
            hostname: "example.com".into(),
            path: "/a".into(),
            destination: "api/v1".into(),
        });
        c.urls.push(UrlConf::Backend {
            hostname: "example.com".into(),
            path: "/b".into(),
            destination: "api/v2".into(),
        });
        c.urls.push(UrlConf::Static {
            hostname: "static.example.com".into(),
            path: "/".into(),
            local_path: "/srv".into(),
        });

        let conf = proxyconf(&c);
        assert_eq!(conf["backends"], json!(["api"]));
        assert_eq!(conf["domains"]["example.com"]["/a"]["destination"], "api/v1");
        // static hostnames appear as domains without backend routes
        assert_eq!(conf["domains"]["static.example.com"], json!({}));
    }

    // ── Pipeline ordering via a scripted fake driver ──────────────────────────

    struct FakeDriver {
        options: DriverOptions,
        events: Mutex<Vec<String>>,
    }

    impl FakeDriver {
        fn new() -> Self {
            Self { options: DriverOptions::default(), events: Mutex::new(Vec::new()) }
        }

        fn push(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[async_trait]
    impl CloudDriver for FakeDriver {
        fn provider_name(&self) -> &'static str {
            "fake"
        }

        fn options(&self) -> &DriverOptions {
            &self.options
        }

        async fn detect_nodes(&self) -> Result<Vec<Node>, DriverError> {
            let mut node = Node::new("web1", "small", "trusty", 10);
            node.security_group_names = vec!["www".into()];
            Ok(vec![node])
        }

        async fn detect_firewalls(
            &self,
        ) -> Result<(HashSet<SecurityGroup>, HashSet<SecurityGroupRule>), DriverError> {
            let groups = [SecurityGroup::new("www")].into_iter().collect();
            Ok((groups, HashSet::new()))
        }

        async fn create_node(&self, node: &mut Node) -> Result<(), DriverError> {
            node.provider_id = Some(format!("fake-{}", node.name));
            self.push(format!("node:{}", node.name));
            Ok(())
        }

        async fn create_security_group(&self, group: &SecurityGroup) -> Result<(), DriverError> {
            self.push(format!("group:{}", group.name));
            Ok(())
        }

        async fn create_security_group_rule(
            &self,
            rule: &SecurityGroupRule,
        ) -> Result<(), DriverError> {
            self.push(format!("rule:{}", rule.security_group));
            Ok(())
        }

        async fn delete_node(&self, node: &Node) -> Result<(), DriverError> {
            self.push(format!("del-node:{}", node.name));
            Ok(())
        }

        async fn delete_security_group(&self, group: &SecurityGroup) -> Result<(), DriverError> {
            self.push(format!("del-group:{}", group.name));
            Ok(())
        }

        async fn delete_security_group_rule(
            &self,
            rule: &SecurityGroupRule,
        ) -> Result<(), DriverError> {
            self.push(format!("del-rule:{}", rule.security_group));
            Ok(())
        }
    }

    fn sample_collection() -> Collection {
        let mut c = Collection::new();
        let mut node = Node::new("web1", "small", "trusty", 10);
        node.security_group_names = vec!["www".into()];
        c.nodes.add(node);
        c.security_groups.add(SecurityGroup::new("www"));
        c.security_group_rules.insert(SecurityGroupRule::new(
            "www",
            RuleSource::Cidr("0.0.0.0/0".into()),
            Some(80),
            Some(80),
            "tcp",
        ));
        c.connect();
        c
    }

    fn positions(events: &[String]) -> (Vec<usize>, Vec<usize>, Vec<usize>) {
        let index = |prefix: &str| {
            events
                .iter()
                .enumerate()
                .filter(|(_, e)| e.starts_with(prefix))
                .map(|(i, _)| i)
                .collect::<Vec<_>>()
        };
        (index("group:"), index("node:"), index("rule:"))
    }

    #[tokio::test]
    async fn apply_orders_groups_nodes_rules() {
        let driver = FakeDriver::new();
        let mut collection = sample_collection();
        driver.apply_resources(&mut collection).await.unwrap();

        let events = driver.events.lock().unwrap().clone();
        let (groups, nodes, rules) = positions(&events);
        assert!(!groups.is_empty() && !nodes.is_empty() && !rules.is_empty());
        assert!(groups.iter().max().unwrap() < nodes.iter().min().unwrap());
        assert!(nodes.iter().max().unwrap() < rules.iter().min().unwrap());
    }

    #[tokio::test]
    async fn apply_fills_node_runtime_fields() {
        let driver = FakeDriver::new();
        let mut collection = sample_collection();
        driver.apply_resources(&mut collection).await.unwrap();
        assert_eq!(
            collection.nodes.get("web1").unwrap().provider_id.as_deref(),
            Some("fake-web1")
        );
    }

    #[tokio::test]
    async fn clean_reverses_ordering() {
        let driver = FakeDriver::new();
        let collection = sample_collection();
        driver.clean_resources(&collection).await.unwrap();

        let events = driver.events.lock().unwrap().clone();
        let del_node = events.iter().position(|e| e.starts_with("del-node:")).unwrap();
        let del_rule = events.iter().position(|e| e.starts_with("del-rule:")).unwrap();
        let del_group = events.iter().position(|e| e.starts_with("del-group:")).unwrap();
        assert!(del_node < del_rule && del_rule < del_group);
    }

    #[tokio::test]
    async fn detect_resources_connects_groups() {
        let driver = FakeDriver::new();
        let collection = driver.detect_resources().await.unwrap();
        let node = collection.nodes.get("web1").unwrap();
        assert_eq!(node.security_groups.names().collect::<Vec<_>>(), vec!["www"]);
    }

    #[tokio::test]
    async fn namespace_filter_semantics() {
        let mut driver = FakeDriver::new();
        assert!(driver.is_namespace_relevant(None));
        assert!(driver.is_namespace_relevant(Some("other")));

        driver.options.namespace = Some("prod".into());
        assert!(driver.is_namespace_relevant(Some("prod")));
        assert!(!driver.is_namespace_relevant(Some("dev")));
        assert!(!driver.is_namespace_relevant(None));
    }
}
