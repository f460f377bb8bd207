//! Keyword filtering applied to the node list before a run.

use super::NodeConfig;

/// Include and exclude keyword sets.
///
/// A node passes when it matches any include set (or all include sets are
/// empty) and matches no exclude set. `keywords` match against group or
/// remarks; the group and remark sets match only their own field.
#[derive(Debug, Clone, Default)]
pub struct NodeFilter {
    pub keywords: Vec<String>,
    pub group_keywords: Vec<String>,
    pub remark_keywords: Vec<String>,
    pub exclude_keywords: Vec<String>,
    pub exclude_group_keywords: Vec<String>,
    pub exclude_remark_keywords: Vec<String>,
}

fn any_in(haystack: &str, needles: &[String]) -> bool {
    needles.iter().any(|k| haystack.contains(k.as_str()))
}

impl NodeFilter {
    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty()
            && self.group_keywords.is_empty()
            && self.remark_keywords.is_empty()
            && self.exclude_keywords.is_empty()
            && self.exclude_group_keywords.is_empty()
            && self.exclude_remark_keywords.is_empty()
    }

    pub fn matches(&self, node: &NodeConfig) -> bool {
        let has_include = !self.keywords.is_empty()
            || !self.group_keywords.is_empty()
            || !self.remark_keywords.is_empty();

        if has_include {
            let included = any_in(&node.group, &self.keywords)
                || any_in(&node.remarks, &self.keywords)
                || any_in(&node.group, &self.group_keywords)
                || any_in(&node.remarks, &self.remark_keywords);
            if !included {
                return false;
            }
        }

        !(any_in(&node.group, &self.exclude_keywords)
            || any_in(&node.remarks, &self.exclude_keywords)
            || any_in(&node.group, &self.exclude_group_keywords)
            || any_in(&node.remarks, &self.exclude_remark_keywords))
    }

    pub fn apply(&self, nodes: Vec<NodeConfig>) -> Vec<NodeConfig> {
        if self.is_empty() {
            return nodes;
        }
        let before = nodes.len();
        let kept: Vec<_> = nodes.into_iter().filter(|n| self.matches(n)).collect();
        tracing::debug!(before, after = kept.len(), "node filter applied");
        kept
    }
}

/// Replace every node's group with `group`.
pub fn override_group(nodes: &mut [NodeConfig], group: &str) {
    for node in nodes {
        node.group = group.to_string();
    }
}
