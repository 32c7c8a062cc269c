use std::collections::HashSet;
use std::ops::Sub;

use serde_json::{json, Value};

use crate::named_set::NamedSet;
use crate::types::{Node, RuleSource, SecurityGroup, SecurityGroupRule, UrlConf};

/// A full topology snapshot: nodes, security groups, rules, URL routes and
/// pass-through container/task manifests.
///
/// Collections come from two places: the stack loader (desired state) and a
/// driver's `detect_resources` (current state). Subtracting one from the
/// other yields the work to do.
#[derive(Debug, Clone, Default)]
pub struct Collection {
    pub nodes: NamedSet<Node>,
    pub security_groups: NamedSet<SecurityGroup>,
    pub security_group_rules: HashSet<SecurityGroupRule>,
    pub urls: Vec<UrlConf>,
    pub containers: Vec<Value>,
    pub tasks: Vec<Value>,
    /// Set by the subtraction operator so the apply phase can re-derive the
    /// full topology for cluster metadata even when applying a sparse diff.
    pub original_collection: Option<Box<Collection>>,
}

impl Collection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rewrite each node's `security_group_names` into references to this
    /// collection's groups. Names with no matching group are left unresolved;
    /// they are assumed to belong to externally managed groups.
    pub fn connect(&mut self) {
        let groups = self.security_groups.clone();
        for node in self.nodes.iter_mut() {
            for name in &node.security_group_names {
                if let Some(group) = groups.get(name) {
                    node.security_groups.add(group.clone());
                }
            }
        }
    }

    /// The full topology to report to the cluster endpoint: the original
    /// collection when this one is a diff, otherwise this one.
    pub fn original(&self) -> &Collection {
        self.original_collection.as_deref().unwrap_or(self)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
            && self.security_groups.is_empty()
            && self.security_group_rules.is_empty()
    }

    pub fn to_json(&self) -> Value {
        json!({
            "nodes": self.nodes.iter().map(Node::to_json).collect::<Vec<_>>(),
            "security_groups": self
                .security_groups
                .iter()
                .map(SecurityGroup::to_json)
                .collect::<Vec<_>>(),
            "security_group_rules": self
                .security_group_rules
                .iter()
                .map(SecurityGroupRule::to_json)
                .collect::<Vec<_>>(),
            "urls": self.urls,
        })
    }

    /// Rebuild a collection from its [`to_json`](Collection::to_json) form.
    /// Only identity-bearing fields survive the round trip.
    pub fn from_json(value: &Value) -> Collection {
        let mut collection = Collection::new();

        for obj in value["nodes"].as_array().into_iter().flatten() {
            let mut node = Node::new(
                obj["name"].as_str().unwrap_or_default(),
                obj["flavor"].as_str().unwrap_or_default(),
                obj["image"].as_str().unwrap_or_default(),
                obj["disk"].as_u64().unwrap_or_default() as u32,
            );
            node.script = obj["script"].as_str().map(str::to_string);
            node.security_group_names = obj["security_groups"]
                .as_array()
                .into_iter()
                .flatten()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect();
            collection.nodes.add(node);
        }

        for obj in value["security_groups"].as_array().into_iter().flatten() {
            if let Some(name) = obj["name"].as_str() {
                collection.security_groups.add(SecurityGroup::new(name));
            }
        }

        for obj in value["security_group_rules"].as_array().into_iter().flatten() {
            let source = match (obj["source_ip"].as_str(), obj["source_group"].as_str()) {
                (Some(ip), _) => RuleSource::Cidr(ip.to_string()),
                (None, Some(group)) => RuleSource::Group(group.to_string()),
                (None, None) => continue,
            };
            collection.security_group_rules.insert(SecurityGroupRule::new(
                obj["security_group"].as_str().unwrap_or_default(),
                source,
                obj["from_port"].as_u64().map(|p| p as u16),
                obj["to_port"].as_u64().map(|p| p as u16),
                obj["protocol"].as_str().unwrap_or_default(),
            ));
        }

        if let Ok(urls) = serde_json::from_value(value["urls"].clone()) {
            collection.urls = urls;
        }

        collection.connect();
        collection
    }
}

/// Structural equality over the four principal sub-collections.
impl PartialEq for Collection {
    fn eq(&self, other: &Self) -> bool {
        self.nodes == other.nodes
            && self.security_groups == other.security_groups
            && self.security_group_rules == other.security_group_rules
            && self.urls == other.urls
    }
}

impl Eq for Collection {}

/// `desired - detected`: what is missing from the cloud.
///
/// Nodes and groups subtract by name, rules by full identity. URLs,
/// containers and tasks have no detection path and are carried over
/// verbatim. The left operand is remembered as `original_collection`.
impl Sub for &Collection {
    type Output = Collection;

    fn sub(self, rhs: &Collection) -> Collection {
        Collection {
            nodes: &self.nodes - &rhs.nodes,
            security_groups: &self.security_groups - &rhs.security_groups,
            security_group_rules: self
                .security_group_rules
                .difference(&rhs.security_group_rules)
                .cloned()
                .collect(),
            urls: self.urls.clone(),
            containers: self.containers.clone(),
            tasks: self.tasks.clone(),
            original_collection: Some(Box::new(self.clone())),
        }
    }
}
