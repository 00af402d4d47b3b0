//! Cart data model.
//!
//! Identity of items and orders is carried as tagged variants (`ItemId`,
//! `OrderRef`) so "local, not yet confirmed" is never inferred from the shape
//! of an id string.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

use crate::cart::reducer::CartCommand;
use crate::money::round_money;
use crate::operations::OperationId;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Cart line identity: a client token until the server assigns its own id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ItemId {
    Local(String),
    Server(String),
}

impl ItemId {
    pub fn new_local() -> Self {
        ItemId::Local(Uuid::new_v4().simple().to_string())
    }

    pub fn is_local(&self) -> bool {
        matches!(self, ItemId::Local(_))
    }

    pub fn as_str(&self) -> &str {
        match self {
            ItemId::Local(token) | ItemId::Server(token) => token,
        }
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemId::Local(token) => write!(f, "local:{token}"),
            ItemId::Server(id) => write!(f, "{id}"),
        }
    }
}

/// Order identity: created offline on this terminal, or known to the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum OrderRef {
    Local(String),
    Server(String),
}

impl OrderRef {
    pub fn new_local() -> Self {
        OrderRef::Local(format!("offline-{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        match self {
            OrderRef::Local(id) | OrderRef::Server(id) => id,
        }
    }

    pub fn server_id(&self) -> Option<&str> {
        match self {
            OrderRef::Server(id) => Some(id),
            OrderRef::Local(_) => None,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, OrderRef::Local(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    #[default]
    Draft,
    Hold,
    /// Completion submitted online, waiting for the server acknowledgement.
    Pending,
    Completed,
    Cancelled,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Completed | OrderStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Draft => "DRAFT",
            OrderStatus::Hold => "HOLD",
            OrderStatus::Pending => "PENDING",
            OrderStatus::Completed => "COMPLETED",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }
}

// ---------------------------------------------------------------------------
// Items
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRef {
    pub product_id: String,
    pub name: String,
    #[serde(default)]
    pub tax_category: Option<String>,
    #[serde(default)]
    pub product_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomItem {
    pub name: String,
    #[serde(default)]
    pub tax_category: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ItemSource {
    Product(ProductRef),
    Custom(CustomItem),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModifierSnapshot {
    pub modifier_id: String,
    pub name: String,
    pub price: f64,
    #[serde(default = "one")]
    pub quantity: u32,
}

fn one() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartItem {
    pub id: ItemId,
    pub source: ItemSource,
    pub quantity: u32,
    pub price_at_sale: f64,
    #[serde(default)]
    pub modifiers: Vec<ModifierSnapshot>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl CartItem {
    pub fn name(&self) -> &str {
        match &self.source {
            ItemSource::Product(p) => &p.name,
            ItemSource::Custom(c) => &c.name,
        }
    }

    pub fn product_id(&self) -> Option<&str> {
        match &self.source {
            ItemSource::Product(p) => Some(&p.product_id),
            ItemSource::Custom(_) => None,
        }
    }

    pub fn tax_category(&self) -> Option<&str> {
        match &self.source {
            ItemSource::Product(p) => p.tax_category.as_deref(),
            ItemSource::Custom(c) => c.tax_category.as_deref(),
        }
    }

    /// Base price plus modifier prices, per unit.
    pub fn unit_price(&self) -> f64 {
        let modifiers: f64 = self
            .modifiers
            .iter()
            .map(|m| m.price * f64::from(m.quantity))
            .sum();
        self.price_at_sale + modifiers
    }

    pub fn line_total(&self) -> f64 {
        round_money(self.unit_price() * f64::from(self.quantity))
    }

    /// Plain product lines are the only ones eligible for quantity merging.
    pub fn is_mergeable_with(&self, product_id: &str, unit_price: f64) -> bool {
        self.modifiers.is_empty()
            && self.notes.is_none()
            && self.product_id() == Some(product_id)
            && round_money(self.price_at_sale) == round_money(unit_price)
    }
}

// ---------------------------------------------------------------------------
// Discounts and adjustments
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum DiscountValue {
    Percent(f64),
    Fixed(f64),
}

impl DiscountValue {
    /// Discount amount (positive) against `base`, never exceeding it.
    pub fn amount_on(self, base: f64) -> f64 {
        let base = base.max(0.0);
        let raw = match self {
            DiscountValue::Percent(pct) => crate::money::percent_of(base, pct.clamp(0.0, 100.0)),
            DiscountValue::Fixed(amount) => round_money(amount.max(0.0)),
        };
        raw.min(base)
    }
}

/// A catalog discount (or redeemed code) applied to the whole order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedDiscount {
    pub discount_id: String,
    pub name: String,
    #[serde(default)]
    pub code: Option<String>,
    pub value: DiscountValue,
    /// Recomputed on every cart change.
    #[serde(default)]
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdjustmentKind {
    OneOffDiscount { value: DiscountValue },
    /// `original_price` is kept so removing the override restores the line.
    PriceOverride { original_price: f64, new_price: f64 },
    TaxExempt,
    FeeExempt,
}

impl AdjustmentKind {
    pub fn wire_name(&self) -> &'static str {
        match self {
            AdjustmentKind::OneOffDiscount { .. } => "ONE_OFF_DISCOUNT",
            AdjustmentKind::PriceOverride { .. } => "PRICE_OVERRIDE",
            AdjustmentKind::TaxExempt => "TAX_EXEMPT",
            AdjustmentKind::FeeExempt => "FEE_EXEMPT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adjustment {
    pub id: String,
    pub kind: AdjustmentKind,
    /// Signed effect on the order; negative for discounts.
    pub amount: f64,
    #[serde(default)]
    pub reason: Option<String>,
    /// `None` means order-level.
    #[serde(default)]
    pub target_item_id: Option<ItemId>,
    #[serde(default)]
    pub approved_by_user_id: Option<String>,
}

impl Adjustment {
    pub fn original_price(&self) -> Option<f64> {
        match self.kind {
            AdjustmentKind::PriceOverride { original_price, .. } => Some(original_price),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Totals
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Totals {
    pub subtotal: f64,
    pub tax: f64,
    pub discount_total: f64,
    pub adjustment_total: f64,
    pub surcharge: f64,
    pub total: f64,
    pub item_count: u32,
}

// ---------------------------------------------------------------------------
// Interactive sub-flows
// ---------------------------------------------------------------------------

/// Raised when the server rejects an add/quantity change for stock.
#[derive(Debug, Clone, PartialEq)]
pub struct StockOverrideDialog {
    pub operation_id: OperationId,
    pub item_id: ItemId,
    pub product_name: String,
    pub requested_quantity: u32,
    /// Quantity before the request; `None` when the request created the line.
    pub previous_quantity: Option<u32>,
    pub available_quantity: Option<u32>,
    pub message: String,
    pub(crate) request: crate::operations::OperationRequest,
}

/// Manager-gated action waiting for approve/cancel.
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalRequest {
    pub command: CartCommand,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Cart state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CartState {
    pub order_id: Option<OrderRef>,
    pub order_number: Option<String>,
    pub status: OrderStatus,
    pub items: Vec<CartItem>,
    pub totals: Totals,
    pub is_tax_exempt: bool,
    pub is_fee_exempt: bool,
    pub is_offline_order: bool,
    pub adjustments: Vec<Adjustment>,
    pub applied_discounts: Vec<AppliedDiscount>,
    pub payment_method: Option<String>,
    pub tip: f64,
    pub created_at: Option<DateTime<Utc>>,

    // Transient UI flags
    pub adding_item_id: Option<ItemId>,
    pub updating_items: BTreeSet<ItemId>,
    pub is_syncing: bool,
    pub last_reconciled_at: Option<DateTime<Utc>>,

    pub stock_override_dialog: Option<StockOverrideDialog>,
    pub approval_request: Option<ApprovalRequest>,
}

impl CartState {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn item(&self, id: &ItemId) -> Option<&CartItem> {
        self.items.iter().find(|item| &item.id == id)
    }

    pub fn item_mut(&mut self, id: &ItemId) -> Option<&mut CartItem> {
        self.items.iter_mut().find(|item| &item.id == id)
    }

    pub fn clear_transient_flags(&mut self) {
        self.adding_item_id = None;
        self.updating_items.clear();
        self.is_syncing = false;
    }
}

/// Frozen copy of a finished order, persisted for offline ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSnapshot {
    #[serde(default)]
    pub order_number: Option<String>,
    pub status: OrderStatus,
    pub items: Vec<CartItem>,
    #[serde(default)]
    pub adjustments: Vec<Adjustment>,
    #[serde(default)]
    pub applied_discounts: Vec<AppliedDiscount>,
    pub totals: Totals,
    #[serde(default)]
    pub payment_method: Option<String>,
    #[serde(default)]
    pub tip: f64,
    #[serde(default)]
    pub is_tax_exempt: bool,
    #[serde(default)]
    pub is_fee_exempt: bool,
    pub created_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    #[serde(default)]
    pub cancellation_reason: Option<String>,
}

impl OrderSnapshot {
    pub fn from_state(
        state: &CartState,
        status: OrderStatus,
        cancellation_reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            order_number: state.order_number.clone(),
            status,
            items: state.items.clone(),
            adjustments: state.adjustments.clone(),
            applied_discounts: state.applied_discounts.clone(),
            totals: state.totals,
            payment_method: state.payment_method.clone(),
            tip: state.tip,
            is_tax_exempt: state.is_tax_exempt,
            is_fee_exempt: state.is_fee_exempt,
            created_at: state.created_at.unwrap_or(now),
            closed_at: now,
            cancellation_reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product_line(id: ItemId, price: f64, qty: u32) -> CartItem {
        CartItem {
            id,
            source: ItemSource::Product(ProductRef {
                product_id: "p1".into(),
                name: "Latte".into(),
                tax_category: None,
                product_type: None,
            }),
            quantity: qty,
            price_at_sale: price,
            modifiers: vec![],
            notes: None,
        }
    }

    #[test]
    fn test_item_id_variants_are_distinct() {
        let local = ItemId::Local("abc".into());
        let server = ItemId::Server("abc".into());
        assert_ne!(local, server);
        assert!(local.is_local());
        assert!(!server.is_local());
        assert_eq!(local.to_string(), "local:abc");
        assert_eq!(server.to_string(), "abc");
    }

    #[test]
    fn test_line_total_includes_modifiers() {
        let mut item = product_line(ItemId::new_local(), 4.0, 2);
        item.modifiers.push(ModifierSnapshot {
            modifier_id: "m1".into(),
            name: "Oat milk".into(),
            price: 0.5,
            quantity: 1,
        });
        assert_eq!(item.line_total(), 9.0);
        assert!(!item.is_mergeable_with("p1", 4.0));
    }

    #[test]
    fn test_discount_value_never_exceeds_base() {
        assert_eq!(DiscountValue::Fixed(15.0).amount_on(10.0), 10.0);
        assert_eq!(DiscountValue::Percent(10.0).amount_on(20.0), 2.0);
        assert_eq!(DiscountValue::Percent(150.0).amount_on(20.0), 20.0);
    }

    #[test]
    fn test_item_id_serde_shape() {
        let json = serde_json::to_value(ItemId::Server("42".into())).unwrap();
        assert_eq!(json, serde_json::json!({ "kind": "server", "value": "42" }));
    }
}
