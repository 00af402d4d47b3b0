//! Idempotent cart operations and the in-flight registry.
//!
//! Every mutating command is dispatched with an operation id of the form
//! `prefix-[entityId-]suffix`. The transport uses it as a deduplication key,
//! so re-delivery of the same id never applies twice.
//!
//! Individual edits are never persisted offline; only a finished order is
//! (see `ingestion`). The registry therefore lives in memory and is bounded by
//! the current cart session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    AddItem,
    UpdateQuantity,
    RemoveItem,
    ApplyDiscount,
    RemoveDiscount,
    ApplyAdjustment,
    RemoveAdjustment,
    ClearCart,
    HoldOrder,
    CompleteOrder,
    CancelOrder,
}

impl OperationKind {
    pub fn prefix(self) -> &'static str {
        match self {
            OperationKind::AddItem => "add_item",
            OperationKind::UpdateQuantity => "update_quantity",
            OperationKind::RemoveItem => "remove_item",
            OperationKind::ApplyDiscount => "apply_discount",
            OperationKind::RemoveDiscount => "remove_discount",
            OperationKind::ApplyAdjustment => "apply_adjustment",
            OperationKind::RemoveAdjustment => "remove_adjustment",
            OperationKind::ClearCart => "clear_cart",
            OperationKind::HoldOrder => "hold_order",
            OperationKind::CompleteOrder => "complete_order",
            OperationKind::CancelOrder => "cancel_order",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(String);

impl OperationId {
    /// `prefix-[entity-]suffix`, where the suffix is a random v4 uuid.
    pub fn generate(prefix: &str, entity_id: Option<&str>) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        match entity_id.map(str::trim).filter(|e| !e.is_empty()) {
            Some(entity) => OperationId(format!("{prefix}-{entity}-{suffix}")),
            None => OperationId(format!("{prefix}-{suffix}")),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for OperationId {
    fn from(value: &str) -> Self {
        OperationId(value.to_string())
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An operation produced by the reducer, not yet assigned an id.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationRequest {
    pub kind: OperationKind,
    pub entity_id: Option<String>,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingOperation {
    pub id: OperationId,
    pub request: OperationRequest,
    pub epoch: u64,
    pub attempts: u32,
    pub registered_at: DateTime<Utc>,
    /// Set after a transient failure; the next sync tick re-sends it.
    pub awaiting_retry: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RegistryStats {
    pub in_flight: usize,
    pub awaiting_retry: usize,
    pub failed_total: u64,
}

/// Tracks operation ids that are still in flight.
///
/// Presence means "not resolved yet"; success and terminal failure both
/// remove the entry.
#[derive(Debug, Default)]
pub struct OperationRegistry {
    entries: HashMap<OperationId, PendingOperation>,
    failed_total: u64,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register before dispatch. Registering an id twice keeps the first entry.
    pub fn register(&mut self, op: PendingOperation) -> bool {
        if self.entries.contains_key(&op.id) {
            debug!(operation_id = %op.id, "operation already registered");
            return false;
        }
        self.entries.insert(op.id.clone(), op);
        true
    }

    pub fn contains(&self, id: &OperationId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &OperationId) -> Option<&PendingOperation> {
        self.entries.get(id)
    }

    pub fn begin_attempt(&mut self, id: &OperationId) -> Option<&PendingOperation> {
        let entry = self.entries.get_mut(id)?;
        entry.attempts += 1;
        entry.awaiting_retry = false;
        Some(entry)
    }

    pub fn resolve_success(&mut self, id: &OperationId) -> Option<PendingOperation> {
        self.entries.remove(id)
    }

    pub fn resolve_failure(&mut self, id: &OperationId) -> Option<PendingOperation> {
        let removed = self.entries.remove(id);
        if removed.is_some() {
            self.failed_total += 1;
        }
        removed
    }

    pub fn mark_for_retry(&mut self, id: &OperationId) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.awaiting_retry = true;
        }
    }

    /// Ids waiting to be re-sent for the given session epoch.
    pub fn retry_candidates(&self, epoch: u64) -> Vec<OperationId> {
        let mut ids: Vec<&PendingOperation> = self
            .entries
            .values()
            .filter(|op| op.awaiting_retry && op.epoch == epoch)
            .collect();
        ids.sort_by_key(|op| op.registered_at);
        ids.into_iter().map(|op| op.id.clone()).collect()
    }

    /// Forget entries that belong to a superseded cart session.
    pub fn drop_stale(&mut self, current_epoch: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, op| op.epoch == current_epoch);
        before - self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            in_flight: self.entries.len(),
            awaiting_retry: self.entries.values().filter(|op| op.awaiting_retry).count(),
            failed_total: self.failed_total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pending(id: &OperationId, epoch: u64) -> PendingOperation {
        PendingOperation {
            id: id.clone(),
            request: OperationRequest {
                kind: OperationKind::AddItem,
                entity_id: Some("p1".into()),
                payload: json!({ "product_id": "p1" }),
            },
            epoch,
            attempts: 0,
            registered_at: Utc::now(),
            awaiting_retry: false,
        }
    }

    #[test]
    fn test_operation_id_format() {
        let with_entity = OperationId::generate("add_item", Some("p1"));
        assert!(with_entity.as_str().starts_with("add_item-p1-"));
        assert_eq!(with_entity.as_str().len(), "add_item-p1-".len() + 32);

        let bare = OperationId::generate("clear_cart", None);
        assert!(bare.as_str().starts_with("clear_cart-"));
        assert_ne!(bare, OperationId::generate("clear_cart", None));
    }

    #[test]
    fn test_registry_presence_means_in_flight() {
        let mut registry = OperationRegistry::new();
        let id = OperationId::generate("add_item", None);
        assert!(registry.register(pending(&id, 1)));
        assert!(!registry.register(pending(&id, 1)));
        assert!(registry.contains(&id));

        registry.resolve_success(&id);
        assert!(!registry.contains(&id));
        assert_eq!(registry.stats().failed_total, 0);
    }

    #[test]
    fn test_registry_failure_and_retry_bookkeeping() {
        let mut registry = OperationRegistry::new();
        let a = OperationId::generate("add_item", None);
        let b = OperationId::generate("add_item", None);
        registry.register(pending(&a, 1));
        registry.register(pending(&b, 1));

        registry.mark_for_retry(&a);
        assert_eq!(registry.retry_candidates(1), vec![a.clone()]);
        assert!(registry.retry_candidates(2).is_empty());

        registry.resolve_failure(&b);
        let stats = registry.stats();
        assert_eq!(stats.in_flight, 1);
        assert_eq!(stats.awaiting_retry, 1);
        assert_eq!(stats.failed_total, 1);

        assert_eq!(registry.drop_stale(2), 1);
        assert!(registry.is_empty());
    }
}
