use std::collections::BTreeSet;

use strato_model::Collection;

/// Per-node summary printed after an apply: the node and its public IPs.
pub fn render_apply_summary(collection: &Collection) -> String {
    let mut out = String::new();
    for node in &collection.nodes {
        if node.public_ips.is_empty() {
            out.push_str(&format!("{}\n", node.name));
        } else {
            out.push_str(&format!("{}: {}\n", node.name, node.public_ips.join(", ")));
        }
    }
    out
}

/// Human-readable rendering of a detected topology.
pub fn render_collection(collection: &Collection) -> String {
    let mut out = String::new();

    out.push_str("Nodes:\n");
    for node in &collection.nodes {
        out.push_str(&format!(
            "  {} ({}, {}, {} GB)\n",
            node.name, node.flavor, node.image, node.disk
        ));
        for ip in &node.public_ips {
            out.push_str(&format!("    public ip: {}\n", ip));
        }
    }

    out.push_str("Security groups:\n");
    for group in &collection.security_groups {
        out.push_str(&format!("  {}\n", group.name));
        for rule in &collection.security_group_rules {
            if rule.security_group != group.name {
                continue;
            }
            let source = rule
                .source
                .source_ip()
                .or(rule.source.source_group())
                .unwrap_or("-");
            out.push_str(&format!(
                "    {} {}-{} from {}\n",
                rule.protocol,
                rule.from_port.unwrap_or(0),
                rule.to_port.unwrap_or(0),
                source,
            ));
        }
    }

    out
}

/// The `list-refs` output: either a plain listing or a template mappings
/// INI with placeholders to fill in.
pub fn render_refs(images: &BTreeSet<String>, flavors: &BTreeSet<String>, tmpl: bool) -> String {
    let mut out = String::new();

    if tmpl {
        out.push_str("[images]\n");
        for image in images {
            out.push_str(&format!("{} = <missing value>\n", image));
        }
        out.push_str("\n[flavors]\n");
        for flavor in flavors {
            out.push_str(&format!("{} = <missing value>\n", flavor));
        }
        return out;
    }

    out.push_str("Images:\n  ");
    if images.is_empty() {
        out.push_str("None");
    } else {
        out.push_str(&images.iter().cloned().collect::<Vec<_>>().join("  "));
    }
    out.push_str("\n\nFlavors:\n  ");
    if flavors.is_empty() {
        out.push_str("None");
    } else {
        out.push_str(&flavors.iter().cloned().collect::<Vec<_>>().join("  "));
    }
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use strato_model::Node;

    #[test]
    fn apply_summary_lists_public_ips() {
        let mut c = Collection::new();
        let mut node = Node::new("web1", "small", "trusty", 10);
        node.public_ips = vec!["203.0.113.10".into()];
        c.nodes.add(node);
        c.nodes.add(Node::new("db", "large", "trusty", 100));

        let summary = render_apply_summary(&c);
        assert_eq!(summary, "web1: 203.0.113.10\ndb\n");
    }

    #[test]
    fn refs_template_has_placeholder_sections() {
        let images: BTreeSet<String> = ["trusty".to_string()].into_iter().collect();
        let flavors: BTreeSet<String> = ["small".to_string()].into_iter().collect();

        let out = render_refs(&images, &flavors, true);
        assert!(out.contains("[images]\ntrusty = <missing value>\n"));
        assert!(out.contains("[flavors]\nsmall = <missing value>\n"));
    }

    #[test]
    fn refs_text_lists_or_none() {
        let empty = BTreeSet::new();
        let out = render_refs(&empty, &empty, false);
        assert!(out.contains("Images:\n  None"));
        assert!(out.contains("Flavors:\n  None"));
    }
}
