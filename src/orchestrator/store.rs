//! Ordered per-node results, in completion order.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::node::{NodeConfig, NodeId};
use crate::record::MeasurementRecord;

/// One node and what was measured for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportEntry {
    pub node: NodeConfig,
    pub record: MeasurementRecord,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("node {0} already has a record")]
    Duplicate(NodeId),
}

#[derive(Debug, Default, Clone)]
pub struct ResultStore {
    index: HashMap<NodeId, usize>,
    entries: Vec<ReportEntry>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record. A node gets exactly one.
    pub fn insert(&mut self, node: NodeConfig, record: MeasurementRecord) -> Result<(), StoreError> {
        let id = node.id();
        if self.index.contains_key(&id) {
            return Err(StoreError::Duplicate(id));
        }
        self.index.insert(id, self.entries.len());
        self.entries.push(ReportEntry { node, record });
        Ok(())
    }

    pub fn get(&self, id: &NodeId) -> Option<&ReportEntry> {
        self.index.get(id).map(|&i| &self.entries[i])
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ReportEntry] {
        &self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReportEntry> {
        self.entries.iter()
    }

    pub fn into_entries(self) -> Vec<ReportEntry> {
        self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::sample_node;
    use crate::record::RecordStatus;
    use chrono::Utc;

    fn rec(status: RecordStatus) -> MeasurementRecord {
        MeasurementRecord::failed(status, "", Utc::now())
    }

    #[test]
    fn test_keeps_insertion_order() {
        let mut store = ResultStore::new();
        store.insert(sample_node("c", 3), rec(RecordStatus::Timeout)).unwrap();
        store.insert(sample_node("a", 1), rec(RecordStatus::NetworkError)).unwrap();
        let servers: Vec<_> = store.iter().map(|e| e.node.server.as_str()).collect();
        assert_eq!(servers, vec!["c", "a"]);
        assert_eq!(store.get(&sample_node("a", 1).id()).unwrap().record.status, RecordStatus::NetworkError);
    }

    #[test]
    fn test_rejects_second_record_for_same_node() {
        let mut store = ResultStore::new();
        let node = sample_node("a", 1);
        store.insert(node.clone(), rec(RecordStatus::Timeout)).unwrap();

        // Display fields differ, identity does not.
        let mut renamed = node.clone();
        renamed.remarks = "renamed".into();
        let err = store.insert(renamed, rec(RecordStatus::Success)).unwrap_err();
        assert_eq!(err, StoreError::Duplicate(node.id()));
        assert_eq!(store.len(), 1);
    }
}
