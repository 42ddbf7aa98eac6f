//! Delta between an item's stored and freshly projected distinct mapping.

use std::collections::BTreeSet;

use browse_model::MappingDelta;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed mapping for item {item_id} in index {index}: {reason}")]
pub struct ReconcileError {
    pub item_id: i64,
    pub index: String,
    pub reason: String,
}

/// `added = current \ previous`, `retained = current ∩ previous`,
/// `removed = previous \ current`; each in ascending order.
pub fn reconcile(
    item_id: i64,
    index: &str,
    previous: &BTreeSet<i64>,
    current: &BTreeSet<i64>,
) -> Result<MappingDelta, ReconcileError> {
    for (label, set) in [("previous", previous), ("current", current)] {
        if let Some(bad) = set.iter().find(|id| **id < 0) {
            return Err(ReconcileError {
                item_id,
                index: index.to_string(),
                reason: format!("negative distinct id {bad} in {label} mapping"),
            });
        }
    }
    Ok(MappingDelta {
        added: current.difference(previous).copied().collect(),
        retained: current.intersection(previous).copied().collect(),
        removed: previous.difference(current).copied().collect(),
    })
}
