//! Offline-order ingestion.
//!
//! Turns a persisted finished order into the canonical payload for
//! `POST /sync/offline-orders/` and flushes the queue. A record is deleted
//! locally only after the server acknowledged it; rejected orders stay
//! queued for manual review.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::api::{ApiError, SyncApi};
use crate::cart::model::{OrderRef, OrderSnapshot, OrderStatus};
use crate::db::{LocalStore, OfflineOrderRecord, OfflineOrderStatus, TerminalIdentity};
use crate::error::Result;
use crate::money::clamp_money;

pub const INGESTION_PATH: &str = "/sync/offline-orders/";

/// Deterministic per order, so a resubmission after a lost acknowledgement
/// is recognised server-side as a duplicate.
pub fn idempotency_key_for(local_id: &str) -> String {
    format!("offline-order:{local_id}")
}

/// Wrap a finished order for the queue. Orders that already had a server id
/// get a fresh local id and keep the server id for update semantics.
pub fn new_offline_record(
    order: &OrderRef,
    snapshot: OrderSnapshot,
    now: DateTime<Utc>,
) -> OfflineOrderRecord {
    let (local_id, server_order_id) = match order {
        OrderRef::Local(id) => (id.clone(), None),
        OrderRef::Server(id) => (OrderRef::new_local().as_str().to_string(), Some(id.clone())),
    };
    OfflineOrderRecord {
        idempotency_key: idempotency_key_for(&local_id),
        local_id,
        server_order_id,
        created_at: snapshot.created_at,
        order: snapshot,
        status: OfflineOrderStatus::Pending,
        last_error: None,
        attempts: 0,
        updated_at: now,
    }
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// Exactly one of the two ids is ever sent.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderIdentification {
    /// Order existed online before going offline: update semantics.
    ServerOrderId(String),
    /// Created entirely offline: create semantics.
    LocalOrderId(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestionItem {
    pub product_id: Option<String>,
    pub name: String,
    pub quantity: u32,
    pub unit_price: f64,
    pub line_total: f64,
    pub modifiers: Value,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestionAdjustment {
    pub adjustment_id: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub amount: f64,
    pub reason: Option<String>,
    pub target_product_id: Option<String>,
    pub approved_by_user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestionTotals {
    pub subtotal: f64,
    pub tax: f64,
    pub discount_total: f64,
    pub adjustment_total: f64,
    pub surcharge: f64,
    pub tip: f64,
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InventoryDelta {
    pub product_id: String,
    /// Negative: units sold.
    pub delta: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestionPayload {
    pub idempotency_key: String,
    #[serde(flatten)]
    pub identification: OrderIdentification,
    pub terminal_id: String,
    pub branch_id: Option<String>,
    /// Fresh at each attempt; checked against the server's freshness window.
    pub client_timestamp: DateTime<Utc>,
    /// When the order was created on the terminal, for the ledger.
    pub offline_created_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub status: OrderStatus,
    pub order_number: Option<String>,
    pub payment_method: Option<String>,
    pub is_tax_exempt: bool,
    pub is_fee_exempt: bool,
    pub cancellation_reason: Option<String>,
    pub items: Vec<IngestionItem>,
    pub adjustments: Vec<IngestionAdjustment>,
    pub discount_ids: Vec<String>,
    pub totals: IngestionTotals,
    pub inventory_deltas: Vec<InventoryDelta>,
}

/// Sold quantities per product, as negative deltas. Cancelled orders sold
/// nothing.
pub fn inventory_deltas(order: &OrderSnapshot) -> Vec<InventoryDelta> {
    if order.status != OrderStatus::Completed {
        return Vec::new();
    }
    let mut sold: BTreeMap<&str, i64> = BTreeMap::new();
    for item in &order.items {
        if let Some(product_id) = item.product_id() {
            *sold.entry(product_id).or_default() += i64::from(item.quantity);
        }
    }
    sold.into_iter()
        .map(|(product_id, quantity)| InventoryDelta {
            product_id: product_id.to_string(),
            delta: -quantity,
        })
        .collect()
}

pub fn build_payload(
    record: &OfflineOrderRecord,
    identity: &TerminalIdentity,
    now: DateTime<Utc>,
) -> IngestionPayload {
    let order = &record.order;
    let identification = match &record.server_order_id {
        Some(server_id) => OrderIdentification::ServerOrderId(server_id.clone()),
        None => OrderIdentification::LocalOrderId(record.local_id.clone()),
    };

    let items = order
        .items
        .iter()
        .map(|item| IngestionItem {
            product_id: item.product_id().map(ToString::to_string),
            name: item.name().to_string(),
            quantity: item.quantity,
            unit_price: clamp_money("unit_price", item.unit_price()),
            line_total: clamp_money("line_total", item.line_total()),
            modifiers: serde_json::to_value(&item.modifiers).unwrap_or(Value::Null),
            notes: item.notes.clone(),
        })
        .collect();

    let adjustments = order
        .adjustments
        .iter()
        .map(|adj| IngestionAdjustment {
            adjustment_id: adj.id.clone(),
            kind: adj.kind.wire_name(),
            amount: clamp_money("adjustment_amount", adj.amount),
            reason: adj.reason.clone(),
            target_product_id: adj
                .target_item_id
                .as_ref()
                .and_then(|id| order.items.iter().find(|item| &item.id == id))
                .and_then(|item| item.product_id().map(ToString::to_string)),
            approved_by_user_id: adj.approved_by_user_id.clone(),
        })
        .collect();

    let totals = &order.totals;
    IngestionPayload {
        idempotency_key: record.idempotency_key.clone(),
        identification,
        terminal_id: identity.terminal_id.clone(),
        branch_id: identity.branch_id.clone(),
        client_timestamp: now,
        offline_created_at: order.created_at,
        closed_at: order.closed_at,
        status: order.status,
        order_number: order.order_number.clone(),
        payment_method: order.payment_method.clone(),
        is_tax_exempt: order.is_tax_exempt,
        is_fee_exempt: order.is_fee_exempt,
        cancellation_reason: order.cancellation_reason.clone(),
        items,
        adjustments,
        discount_ids: order
            .applied_discounts
            .iter()
            .map(|d| d.discount_id.clone())
            .collect(),
        totals: IngestionTotals {
            subtotal: clamp_money("subtotal", totals.subtotal),
            tax: clamp_money("tax", totals.tax),
            discount_total: clamp_money("discount_total", totals.discount_total),
            adjustment_total: clamp_money("adjustment_total", totals.adjustment_total),
            surcharge: clamp_money("surcharge", totals.surcharge),
            tip: clamp_money("tip", order.tip),
            total: clamp_money("total", totals.total),
        },
        inventory_deltas: inventory_deltas(order),
    }
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IngestionStatus {
    Success,
    AcceptedWithWarnings,
    Duplicate,
    Conflict,
    Rejected,
    #[serde(other)]
    Unknown,
}

impl IngestionStatus {
    pub fn is_accepted(self) -> bool {
        matches!(
            self,
            IngestionStatus::Success
                | IngestionStatus::AcceptedWithWarnings
                | IngestionStatus::Duplicate
        )
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IngestionResponse {
    pub status: IngestionStatus,
    #[serde(default)]
    pub order_number: Option<String>,
    #[serde(default)]
    pub warnings: Vec<Value>,
    #[serde(default)]
    pub errors: Vec<Value>,
}

fn describe(values: &[Value]) -> String {
    values
        .iter()
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join("; ")
}

// ---------------------------------------------------------------------------
// Flush
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct FlushReport {
    pub attempted: u32,
    pub accepted: u32,
    pub conflicted: u32,
    pub rejected: u32,
    /// The flush stopped early on a transient failure; the rest stays pending.
    pub interrupted: bool,
}

pub struct OfflineOrderFlusher {
    api: Arc<dyn SyncApi>,
    store: Arc<LocalStore>,
    identity: TerminalIdentity,
}

impl OfflineOrderFlusher {
    pub fn new(api: Arc<dyn SyncApi>, store: Arc<LocalStore>, identity: TerminalIdentity) -> Self {
        Self { api, store, identity }
    }

    /// Submit every pending order, oldest first.
    pub async fn flush(&self) -> Result<FlushReport> {
        let pending = self.store.list_offline_orders(Some(OfflineOrderStatus::Pending))?;
        let mut report = FlushReport::default();
        if pending.is_empty() {
            return Ok(report);
        }
        debug!(count = pending.len(), "flushing offline orders");

        for record in pending {
            report.attempted += 1;
            let payload = serde_json::to_value(build_payload(&record, &self.identity, Utc::now()))?;

            let response = match self.api.post_json(INGESTION_PATH, &payload).await {
                Ok(body) => body,
                Err(e) if e.is_transient() || e.is_auth_failure() => {
                    warn!(local_id = %record.local_id, "offline order flush interrupted: {e}");
                    report.interrupted = true;
                    break;
                }
                Err(e) => {
                    let status = match &e {
                        ApiError::Status { status: 409, .. } => OfflineOrderStatus::Conflict,
                        _ => OfflineOrderStatus::Failed,
                    };
                    self.hold_for_review(&record, status, &e.to_string(), &mut report)?;
                    continue;
                }
            };

            let parsed: IngestionResponse = match serde_json::from_value(response) {
                Ok(parsed) => parsed,
                Err(e) => {
                    // Unknown outcome: keep it pending and try again next cycle.
                    warn!(local_id = %record.local_id, "unreadable ingestion response: {e}");
                    report.interrupted = true;
                    break;
                }
            };

            match parsed.status {
                status if status.is_accepted() => {
                    if !parsed.warnings.is_empty() {
                        warn!(
                            local_id = %record.local_id,
                            warnings = %describe(&parsed.warnings),
                            "offline order accepted with warnings"
                        );
                    }
                    self.store.delete_offline_order(&record.local_id)?;
                    report.accepted += 1;
                    info!(
                        local_id = %record.local_id,
                        order_number = ?parsed.order_number,
                        status = ?status,
                        "offline order synced"
                    );
                }
                IngestionStatus::Conflict | IngestionStatus::Rejected => {
                    let held = if parsed.status == IngestionStatus::Conflict {
                        OfflineOrderStatus::Conflict
                    } else {
                        OfflineOrderStatus::Failed
                    };
                    let reason = describe(&parsed.errors);
                    self.hold_for_review(&record, held, &reason, &mut report)?;
                }
                _ => {
                    warn!(
                        local_id = %record.local_id,
                        "unknown ingestion status, order left pending"
                    );
                    report.interrupted = true;
                    break;
                }
            }
        }

        Ok(report)
    }

    fn hold_for_review(
        &self,
        record: &OfflineOrderRecord,
        status: OfflineOrderStatus,
        reason: &str,
        report: &mut FlushReport,
    ) -> Result<()> {
        warn!(
            local_id = %record.local_id,
            status = status.as_str(),
            reason,
            "offline order held for review"
        );
        self.store
            .mark_offline_order_status(&record.local_id, status, Some(reason))?;
        match status {
            OfflineOrderStatus::Conflict => report.conflicted += 1,
            _ => report.rejected += 1,
        }
        Ok(())
    }
}
