use std::collections::BTreeMap;

use serde::Deserialize;
use strato_model::NetworkAttachment;

/// Raw YAML form of a stack document, prior to conversion into a
/// [`Collection`](strato_model::Collection). The provisioning runner works
/// on these types directly.
#[derive(Debug, Default, Deserialize)]
pub struct RawStack {
    #[serde(default)]
    pub nodes: BTreeMap<String, RawNode>,
    #[serde(default, alias = "securitygroups")]
    pub security_groups: BTreeMap<String, Vec<RawRule>>,
    /// Networks to create; recognised by the runner only.
    #[serde(default)]
    pub networks: BTreeMap<String, RawNetwork>,
    #[serde(default)]
    pub urls: Vec<RawUrl>,
    #[serde(default)]
    pub containers: Vec<serde_json::Value>,
    #[serde(default)]
    pub tasks: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawNode {
    pub flavor: String,
    pub image: String,
    pub disk: u32,
    #[serde(default)]
    pub networks: Vec<NetworkAttachment>,
    #[serde(default)]
    pub security_groups: Vec<String>,
    pub script: Option<String>,
    /// Expands the node into `base1..baseN`.
    #[serde(alias = "number")]
    pub count: Option<u32>,
    /// Runner only: export this node's port addresses to shell steps.
    #[serde(default)]
    pub export: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawRule {
    pub from_port: Option<u16>,
    pub to_port: Option<u16>,
    pub protocol: String,
    pub cidr: Option<String>,
    pub source_group: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawNetwork {
    pub cidr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawUrl {
    #[serde(rename = "type")]
    pub url_type: String,
    pub hostname: String,
    pub path: String,
    pub local_path: Option<String>,
    pub destination: Option<String>,
}
