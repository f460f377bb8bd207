//! Node list loading: JSON array or TOML `[[nodes]]` tables.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

use super::NodeConfig;

#[derive(Deserialize)]
struct TomlNodeList {
    #[serde(default)]
    nodes: Vec<NodeConfig>,
}

/// Load a node list from `path`, format chosen by extension.
///
/// Duplicate identities keep their first occurrence.
pub fn load_nodes(path: &Path) -> Result<Vec<NodeConfig>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read node list: {}", path.display()))?;

    let nodes = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => {
            let list: TomlNodeList = toml::from_str(&content)
                .with_context(|| format!("failed to parse node list: {}", path.display()))?;
            list.nodes
        }
        _ => serde_json::from_str::<Vec<NodeConfig>>(&content)
            .with_context(|| format!("failed to parse node list: {}", path.display()))?,
    };

    let nodes = dedup(nodes);
    info!(path = %path.display(), count = nodes.len(), "loaded node list");
    Ok(nodes)
}

/// Drop nodes whose identity was already seen, keeping input order.
pub fn dedup(nodes: Vec<NodeConfig>) -> Vec<NodeConfig> {
    let mut seen = HashSet::with_capacity(nodes.len());
    nodes
        .into_iter()
        .filter(|n| {
            let fresh = seen.insert(n.id());
            if !fresh {
                warn!(node = %n.id(), label = %n.label(), "duplicate node dropped");
            }
            fresh
        })
        .collect()
}
