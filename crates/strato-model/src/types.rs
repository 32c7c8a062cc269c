use std::collections::{BTreeSet, HashSet};
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::named_set::{Named, NamedSet};

// ── Network attachment ────────────────────────────────────────────────────────

/// A node's attachment to one network, as declared in the stack document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAttachment {
    pub network: String,
    #[serde(default)]
    pub assign_floating_ip: bool,
    #[serde(default)]
    pub securitygroups: Vec<String>,
}

// ── Port record ───────────────────────────────────────────────────────────────

/// Runtime record of a provisioned port. Never part of node identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRecord {
    pub id: String,
    pub fixed_ip: String,
    pub mac: String,
    pub network_name: String,
    pub floating_ip: Option<String>,
}

// ── Floating IP ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FloatingIp {
    pub id: String,
    pub ip_address: String,
}

// ── Node ──────────────────────────────────────────────────────────────────────

/// A compute instance.
///
/// Identity is the tuple (name, flavor, image, disk, script, sorted
/// security-group names). Everything else is runtime state written by
/// drivers during apply/clean and ignored by equality and hashing, so
/// re-running the same desired stack against already-created resources
/// diffs to nothing even when mutable fields differ.
#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub flavor: String,
    pub image: String,
    pub disk: u32,
    pub networks: Vec<NetworkAttachment>,
    pub script: Option<String>,
    /// Group names as referenced by the stack or the provider inventory.
    pub security_group_names: Vec<String>,
    /// Resolved groups, populated by [`Collection::connect`](crate::Collection::connect).
    pub security_groups: NamedSet<SecurityGroup>,
    pub attempts_left: u32,

    // Runtime state, not part of identity.
    pub provider_id: Option<String>,
    pub server_id: Option<String>,
    pub ports: Vec<PortRecord>,
    pub floating_ips: HashSet<FloatingIp>,
    pub server_status: Option<String>,
    pub public_ips: Vec<String>,
}

impl Node {
    pub fn new(
        name: impl Into<String>,
        flavor: impl Into<String>,
        image: impl Into<String>,
        disk: u32,
    ) -> Self {
        Node {
            name: name.into(),
            flavor: flavor.into(),
            image: image.into(),
            disk,
            networks: Vec::new(),
            script: None,
            security_group_names: Vec::new(),
            security_groups: NamedSet::new(),
            attempts_left: 1,
            provider_id: None,
            server_id: None,
            ports: Vec::new(),
            floating_ips: HashSet::new(),
            server_status: None,
            public_ips: Vec::new(),
        }
    }

    /// The sorted set of group names this node references, whether or not
    /// they have been resolved into `security_groups` yet.
    pub fn sorted_security_group_names(&self) -> BTreeSet<String> {
        self.security_groups
            .names()
            .map(str::to_string)
            .chain(self.security_group_names.iter().cloned())
            .collect()
    }

    /// The floating IP of the first port that has one, if any.
    pub fn floating_ip(&self) -> Option<&str> {
        self.ports.iter().find_map(|p| p.floating_ip.as_deref())
    }

    pub fn to_json(&self) -> Value {
        let mut obj = json!({
            "name": self.name,
            "flavor": self.flavor,
            "image": self.image,
            "disk": self.disk,
            "security_groups": self.sorted_security_group_names(),
        });
        if let Some(script) = &self.script {
            obj["script"] = json!(script);
        }
        if !self.networks.is_empty() {
            obj["networks"] = json!(self.networks);
        }
        if !self.public_ips.is_empty() {
            obj["public_ips"] = json!(self.public_ips);
        }
        obj
    }
}

impl Named for Node {
    fn name(&self) -> &str {
        &self.name
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.flavor == other.flavor
            && self.image == other.image
            && self.disk == other.disk
            && self.script == other.script
            && self.sorted_security_group_names() == other.sorted_security_group_names()
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.flavor.hash(state);
        self.image.hash(state);
        self.disk.hash(state);
        self.script.hash(state);
        for name in self.sorted_security_group_names() {
            name.hash(state);
        }
    }
}

// ── Security group ────────────────────────────────────────────────────────────

/// Identified solely by name.
#[derive(Debug, Clone)]
pub struct SecurityGroup {
    pub name: String,
    /// Provider-native id, set by drivers that need it for deletion.
    pub provider_id: Option<String>,
}

impl SecurityGroup {
    pub fn new(name: impl Into<String>) -> Self {
        SecurityGroup { name: name.into(), provider_id: None }
    }

    pub fn to_json(&self) -> Value {
        json!({ "name": self.name })
    }
}

impl Named for SecurityGroup {
    fn name(&self) -> &str {
        &self.name
    }
}

impl PartialEq for SecurityGroup {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for SecurityGroup {}

impl Hash for SecurityGroup {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl std::fmt::Display for SecurityGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

// ── Security group rule ───────────────────────────────────────────────────────

/// Traffic source of an ingress rule. Exactly one of CIDR or group reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RuleSource {
    Cidr(String),
    Group(String),
}

impl RuleSource {
    pub fn source_ip(&self) -> Option<&str> {
        match self {
            RuleSource::Cidr(ip) => Some(ip),
            RuleSource::Group(_) => None,
        }
    }

    pub fn source_group(&self) -> Option<&str> {
        match self {
            RuleSource::Cidr(_) => None,
            RuleSource::Group(group) => Some(group),
        }
    }
}

/// An ingress rule. Identity is (group, source, ports, protocol); the
/// provider handle is runtime state used for deletion only.
#[derive(Debug, Clone)]
pub struct SecurityGroupRule {
    /// Name of the owning [`SecurityGroup`] in the same collection.
    pub security_group: String,
    pub source: RuleSource,
    pub from_port: Option<u16>,
    pub to_port: Option<u16>,
    pub protocol: String,
    /// Provider-native handle (firewall name on GCE, rule id on OpenStack).
    pub provider_id: Option<String>,
}

impl PartialEq for SecurityGroupRule {
    fn eq(&self, other: &Self) -> bool {
        self.security_group == other.security_group
            && self.source == other.source
            && self.from_port == other.from_port
            && self.to_port == other.to_port
            && self.protocol == other.protocol
    }
}

impl Eq for SecurityGroupRule {}

impl Hash for SecurityGroupRule {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.security_group.hash(state);
        self.source.hash(state);
        self.from_port.hash(state);
        self.to_port.hash(state);
        self.protocol.hash(state);
    }
}

impl SecurityGroupRule {
    pub fn new(
        security_group: impl Into<String>,
        source: RuleSource,
        from_port: Option<u16>,
        to_port: Option<u16>,
        protocol: impl Into<String>,
    ) -> Self {
        SecurityGroupRule {
            security_group: security_group.into(),
            source,
            from_port,
            to_port,
            protocol: protocol.into(),
            provider_id: None,
        }
    }

    /// Ports are omitted when both ends are absent or zero.
    fn has_port_range(&self) -> bool {
        self.from_port.unwrap_or(0) != 0 || self.to_port.unwrap_or(0) != 0
    }

    pub fn to_json(&self) -> Value {
        let mut obj = json!({
            "security_group": self.security_group,
            "protocol": self.protocol,
        });
        if self.has_port_range() {
            obj["from_port"] = json!(self.from_port);
            obj["to_port"] = json!(self.to_port);
        }
        match &self.source {
            RuleSource::Cidr(ip) => obj["source_ip"] = json!(ip),
            RuleSource::Group(group) => obj["source_group"] = json!(group),
        }
        obj
    }
}

impl std::fmt::Display for SecurityGroupRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} {}-{}",
            self.security_group,
            self.protocol,
            self.from_port.unwrap_or(0),
            self.to_port.unwrap_or(0),
        )
    }
}

// ── URL configuration ─────────────────────────────────────────────────────────

/// A routing entry for the HTTP proxy layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum UrlConf {
    /// Serve files from a path on the node.
    Static {
        hostname: String,
        path: String,
        local_path: String,
    },
    /// Proxy to a backend service.
    Backend {
        hostname: String,
        path: String,
        destination: String,
    },
}

impl UrlConf {
    pub fn hostname(&self) -> &str {
        match self {
            UrlConf::Static { hostname, .. } | UrlConf::Backend { hostname, .. } => hostname,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            UrlConf::Static { path, .. } | UrlConf::Backend { path, .. } => path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of<T: Hash>(value: &T) -> u64 {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn node_identity_ignores_runtime_fields() {
        let mut a = Node::new("web1", "small", "trusty", 10);
        let mut b = Node::new("web1", "small", "trusty", 10);
        a.server_id = Some("deadbeef".into());
        a.public_ips = vec!["203.0.113.10".into()];
        b.server_status = Some("ACTIVE".into());
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn node_identity_covers_disk_and_script() {
        let a = Node::new("web1", "small", "trusty", 10);
        let mut b = Node::new("web1", "small", "trusty", 20);
        assert_ne!(a, b);
        b.disk = 10;
        b.script = Some("#!/bin/sh\n".into());
        assert_ne!(a, b);
    }

    #[test]
    fn node_identity_uses_sorted_group_names() {
        let mut a = Node::new("web1", "small", "trusty", 10);
        let mut b = Node::new("web1", "small", "trusty", 10);
        a.security_group_names = vec!["www".into(), "ssh".into()];
        b.security_group_names = vec!["ssh".into(), "www".into()];
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn node_connected_groups_count_toward_identity() {
        let mut a = Node::new("web1", "small", "trusty", 10);
        let mut b = Node::new("web1", "small", "trusty", 10);
        a.security_group_names = vec!["www".into()];
        b.security_groups.add(SecurityGroup::new("www"));
        assert_eq!(a, b);
    }

    #[test]
    fn node_json_omits_empty_transients() {
        let node = Node::new("web1", "small", "trusty", 10);
        let obj = node.to_json();
        assert_eq!(obj["name"], "web1");
        assert!(obj.get("script").is_none());
        assert!(obj.get("public_ips").is_none());
    }

    #[test]
    fn node_json_includes_public_ips_when_present() {
        let mut node = Node::new("web1", "small", "trusty", 10);
        node.public_ips = vec!["203.0.113.10".into()];
        assert_eq!(node.to_json()["public_ips"], json!(["203.0.113.10"]));
    }

    #[test]
    fn floating_ip_from_first_port_that_has_one() {
        let mut node = Node::new("web1", "small", "trusty", 10);
        node.ports = vec![
            PortRecord {
                id: "p1".into(),
                fixed_ip: "10.0.0.5".into(),
                mac: "aa:bb".into(),
                network_name: "default".into(),
                floating_ip: None,
            },
            PortRecord {
                id: "p2".into(),
                fixed_ip: "10.0.0.6".into(),
                mac: "aa:cc".into(),
                network_name: "default".into(),
                floating_ip: Some("198.51.100.7".into()),
            },
        ];
        assert_eq!(node.floating_ip(), Some("198.51.100.7"));
    }

    #[test]
    fn security_group_identity_is_name_only() {
        let mut a = SecurityGroup::new("www");
        let b = SecurityGroup::new("www");
        a.provider_id = Some("sg-123".into());
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn rule_json_omits_absent_ports() {
        let rule = SecurityGroupRule::new(
            "www",
            RuleSource::Cidr("0.0.0.0/0".into()),
            None,
            None,
            "icmp",
        );
        let obj = rule.to_json();
        assert!(obj.get("from_port").is_none());
        assert!(obj.get("to_port").is_none());
        assert_eq!(obj["source_ip"], "0.0.0.0/0");
        assert!(obj.get("source_group").is_none());
    }

    #[test]
    fn rule_json_with_group_source() {
        let rule = SecurityGroupRule::new(
            "default",
            RuleSource::Group("www".into()),
            Some(8080),
            Some(8081),
            "udp",
        );
        let obj = rule.to_json();
        assert_eq!(obj["from_port"], 8080);
        assert_eq!(obj["to_port"], 8081);
        assert_eq!(obj["source_group"], "www");
        assert!(obj.get("source_ip").is_none());
    }

    #[test]
    fn url_conf_parses_tagged_form() {
        let url: UrlConf = serde_json::from_value(json!({
            "type": "backend",
            "hostname": "example.com",
            "path": "/",
            "destination": "api/v1",
        }))
        .unwrap();
        assert_eq!(url.hostname(), "example.com");
        assert!(matches!(url, UrlConf::Backend { .. }));
    }
}
