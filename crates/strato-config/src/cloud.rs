use std::collections::HashMap;
use std::path::Path;

use crate::error::ConfigError;

/// Which provider driver a cloud config selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Gce,
    Aws,
    DigitalOcean,
    OpenStack,
}

impl ProviderKind {
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s {
            "gce" => Ok(ProviderKind::Gce),
            "aws" => Ok(ProviderKind::Aws),
            "digitalocean" => Ok(ProviderKind::DigitalOcean),
            "openstack" => Ok(ProviderKind::OpenStack),
            other => Err(ConfigError::UnknownDriver(other.to_string())),
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Gce => write!(f, "gce"),
            ProviderKind::Aws => write!(f, "aws"),
            ProviderKind::DigitalOcean => write!(f, "digitalocean"),
            ProviderKind::OpenStack => write!(f, "openstack"),
        }
    }
}

/// The `[images]` / `[flavors]` (and, for the runner, `[networks]` /
/// `[routers]`) sections of a cloud config: symbolic name → provider id.
#[derive(Debug, Clone, Default)]
pub struct Mappings {
    sections: HashMap<String, HashMap<String, String>>,
}

impl Mappings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Translate a symbolic name, or return it unchanged when unmapped.
    pub fn apply(&self, kind: &str, name: &str) -> String {
        self.get(kind, name).unwrap_or(name).to_string()
    }

    pub fn get(&self, kind: &str, name: &str) -> Option<&str> {
        self.sections.get(kind)?.get(name).map(String::as_str)
    }

    pub fn insert(&mut self, kind: &str, name: &str, value: &str) {
        self.sections
            .entry(kind.to_string())
            .or_default()
            .insert(name.to_string(), value.to_string());
    }
}

/// Parsed cloud configuration: provider selection, its connection keys and
/// the symbolic-name mappings.
#[derive(Debug, Clone)]
pub struct CloudConfig {
    pub driver: ProviderKind,
    pub connection: HashMap<String, String>,
    pub mappings: Mappings,
}

impl CloudConfig {
    /// Fetch a required `[connection]` key.
    pub fn connection_key(&self, key: &str) -> Result<&str, ConfigError> {
        self.connection
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| ConfigError::MissingKey {
                path: "cloud config".to_string(),
                section: "connection".to_string(),
                key: key.to_string(),
            })
    }
}

pub fn load_cloud_config(path: &Path) -> Result<CloudConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    parse_cloud_config(&content, &path.display().to_string())
}

pub fn parse_cloud_config(content: &str, origin: &str) -> Result<CloudConfig, ConfigError> {
    let sections = parse_ini(content);

    let connection = sections.get("connection").cloned().unwrap_or_default();
    let driver_name = connection.get("driver").ok_or_else(|| ConfigError::MissingKey {
        path: origin.to_string(),
        section: "connection".to_string(),
        key: "driver".to_string(),
    })?;
    let driver = ProviderKind::parse(driver_name)?;

    let mut mappings = Mappings::new();
    for kind in ["images", "flavors"] {
        if let Some(section) = sections.get(kind) {
            for (name, value) in section {
                mappings.insert(kind, name, value);
            }
        }
    }

    Ok(CloudConfig { driver, connection, mappings })
}

/// Parse a mappings-only INI (runner mode): `[flavors]`, `[networks]`,
/// `[images]`, `[routers]`.
pub fn parse_mappings_ini(content: &str) -> Mappings {
    let sections = parse_ini(content);
    let mut mappings = Mappings::new();
    for kind in ["flavors", "networks", "images", "routers"] {
        if let Some(section) = sections.get(kind) {
            for (name, value) in section {
                mappings.insert(kind, name, value);
            }
        }
    }
    mappings
}

/// Minimal INI reader: `[section]` headers, `key = value` pairs, `#`/`;`
/// comment lines. Keys keep their case. There is no INI crate in our
/// dependency set and this is the whole surface the configs use.
fn parse_ini(content: &str) -> HashMap<String, HashMap<String, String>> {
    let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
    let mut current: Option<String> = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            current = Some(name.trim().to_string());
            sections.entry(name.trim().to_string()).or_default();
            continue;
        }
        if let (Some(section), Some((key, value))) = (&current, line.split_once('=')) {
            sections
                .get_mut(section)
                .expect("section entry created on header")
                .insert(key.trim().to_string(), value.trim().to_string());
        }
    }

    sections
}
