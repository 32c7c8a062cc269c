use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use strato_model::{Collection, Node, RuleSource, SecurityGroup, SecurityGroupRule, UrlConf};
use tracing::info;

use crate::error::ConfigError;
use crate::interpolate::interpolate;
use crate::raw::{RawStack, RawUrl};

/// Load a stack document into a desired-state [`Collection`].
///
/// `substitutions` feeds `$name` expansion in node scripts.
pub fn load(
    path: &Path,
    substitutions: &HashMap<String, String>,
) -> Result<Collection, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    load_stack_str(&content, substitutions, &path.display().to_string())
}

/// Load a stack document without converting it: the provisioning runner
/// works on the raw form directly.
pub fn load_stack_raw(path: &Path) -> Result<RawStack, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    serde_yaml::from_str(&content).map_err(|e| ConfigError::YamlParse {
        path: path.display().to_string(),
        source: e,
    })
}

pub fn load_stack_str(
    content: &str,
    substitutions: &HashMap<String, String>,
    origin: &str,
) -> Result<Collection, ConfigError> {
    let raw: RawStack = serde_yaml::from_str(content).map_err(|e| ConfigError::YamlParse {
        path: origin.to_string(),
        source: e,
    })?;

    let mut collection = Collection::new();

    for (base_name, info) in &raw.nodes {
        let names: Vec<String> = match info.count {
            Some(count) => (1..=count).map(|idx| format!("{}{}", base_name, idx)).collect(),
            None => vec![base_name.clone()],
        };

        for name in names {
            info!("Loaded node {} from stack", name);
            let mut node = Node::new(&name, &info.flavor, &info.image, info.disk);
            node.networks = info.networks.clone();
            node.script = info
                .script
                .as_deref()
                .map(|script| interpolate(script, substitutions));
            node.security_group_names = info.security_groups.clone();
            collection.nodes.add(node);
        }
    }

    for (name, rules) in &raw.security_groups {
        info!("Loaded security group {} from stack", name);
        collection.security_groups.add(SecurityGroup::new(name));
        for rule in rules {
            let source = match (&rule.cidr, &rule.source_group) {
                (Some(cidr), _) => RuleSource::Cidr(cidr.clone()),
                (None, Some(group)) => RuleSource::Group(group.clone()),
                (None, None) => {
                    return Err(ConfigError::Conversion {
                        path: origin.to_string(),
                        message: format!(
                            "rule in security group '{}' has neither cidr nor source_group",
                            name
                        ),
                    })
                }
            };
            collection.security_group_rules.insert(SecurityGroupRule {
                security_group: name.clone(),
                source,
                from_port: rule.from_port,
                to_port: rule.to_port,
                protocol: rule.protocol.clone(),
                provider_id: None,
            });
        }
    }

    for url in &raw.urls {
        collection.urls.push(convert_url(url, origin)?);
    }

    collection.containers = raw.containers.clone();
    collection.tasks = raw.tasks.clone();

    collection.connect();
    Ok(collection)
}

fn convert_url(raw: &RawUrl, origin: &str) -> Result<UrlConf, ConfigError> {
    let missing = |field: &str| ConfigError::Conversion {
        path: origin.to_string(),
        message: format!("url '{}{}' is missing '{}'", raw.hostname, raw.path, field),
    };

    match raw.url_type.as_str() {
        "static" => Ok(UrlConf::Static {
            hostname: raw.hostname.clone(),
            path: raw.path.clone(),
            local_path: raw.local_path.clone().ok_or_else(|| missing("local_path"))?,
        }),
        "backend" => Ok(UrlConf::Backend {
            hostname: raw.hostname.clone(),
            path: raw.path.clone(),
            destination: raw.destination.clone().ok_or_else(|| missing("destination"))?,
        }),
        other => Err(ConfigError::UnknownUrlType(other.to_string())),
    }
}

/// The symbolic images, flavors and statically-referenced networks a stack
/// mentions. Powers `list-refs`, which operators use to template a mappings
/// file before the first apply.
pub fn find_weak_refs(
    stack: &RawStack,
) -> (BTreeSet<String>, BTreeSet<String>, BTreeSet<String>) {
    let mut images = BTreeSet::new();
    let mut flavors = BTreeSet::new();
    let mut networks = BTreeSet::new();

    for node in stack.nodes.values() {
        images.insert(node.image.clone());
        flavors.insert(node.flavor.clone());
        for attachment in &node.networks {
            networks.insert(attachment.network.clone());
        }
    }

    // Networks the stack itself creates are not external references.
    for dynamic in stack.networks.keys() {
        networks.remove(dynamic);
    }

    (images, flavors, networks)
}
