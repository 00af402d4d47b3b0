//! Drift reconciliation against server-confirmed order snapshots.
//!
//! A push that agrees with local state within tolerance only clears the
//! transient flags. Otherwise just the drifted total fields are patched, and
//! the item list is replaced (with catalog metadata rehydrated) only when the
//! item sets disagree.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cart::model::{
    Adjustment, AppliedDiscount, CartItem, CartState, CustomItem, ItemId, ItemSource,
    ModifierSnapshot, OrderStatus, ProductRef, Totals,
};
use crate::catalog::CatalogLookup;
use crate::money::exceeds_tolerance;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerOrderItem {
    #[serde(alias = "item_id")]
    pub id: String,
    #[serde(default)]
    pub product_id: Option<String>,
    #[serde(default)]
    pub name: String,
    pub quantity: u32,
    #[serde(alias = "unit_price", alias = "price")]
    pub price_at_sale: f64,
    #[serde(default)]
    pub modifiers: Vec<ModifierSnapshot>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub tax_category: Option<String>,
    #[serde(default)]
    pub product_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerOrderSnapshot {
    #[serde(alias = "id")]
    pub order_id: String,
    #[serde(default)]
    pub order_number: Option<String>,
    #[serde(default)]
    pub status: Option<OrderStatus>,
    #[serde(default)]
    pub items: Vec<ServerOrderItem>,
    pub subtotal: f64,
    pub tax: f64,
    pub total: f64,
    #[serde(default)]
    pub discount_total: f64,
    #[serde(default)]
    pub adjustment_total: f64,
    #[serde(default)]
    pub adjustments: Vec<Adjustment>,
    #[serde(default)]
    pub applied_discounts: Vec<AppliedDiscount>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TotalField {
    Subtotal,
    Tax,
    Total,
    DiscountTotal,
    AdjustmentTotal,
}

impl TotalField {
    pub const ALL: [TotalField; 5] = [
        TotalField::Subtotal,
        TotalField::Tax,
        TotalField::Total,
        TotalField::DiscountTotal,
        TotalField::AdjustmentTotal,
    ];

    fn local(self, totals: &Totals) -> f64 {
        match self {
            TotalField::Subtotal => totals.subtotal,
            TotalField::Tax => totals.tax,
            TotalField::Total => totals.total,
            TotalField::DiscountTotal => totals.discount_total,
            TotalField::AdjustmentTotal => totals.adjustment_total,
        }
    }

    fn server(self, snapshot: &ServerOrderSnapshot) -> f64 {
        match self {
            TotalField::Subtotal => snapshot.subtotal,
            TotalField::Tax => snapshot.tax,
            TotalField::Total => snapshot.total,
            TotalField::DiscountTotal => snapshot.discount_total,
            TotalField::AdjustmentTotal => snapshot.adjustment_total,
        }
    }

    fn set(self, totals: &mut Totals, value: f64) {
        match self {
            TotalField::Subtotal => totals.subtotal = value,
            TotalField::Tax => totals.tax = value,
            TotalField::Total => totals.total = value,
            TotalField::DiscountTotal => totals.discount_total = value,
            TotalField::AdjustmentTotal => totals.adjustment_total = value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DriftReport {
    pub fields: Vec<TotalField>,
    pub item_drift: bool,
}

impl DriftReport {
    pub fn has_drift(&self) -> bool {
        self.item_drift || !self.fields.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    pub state: CartState,
    pub report: DriftReport,
}

pub fn detect_drift(
    state: &CartState,
    server: &ServerOrderSnapshot,
    tolerance: f64,
) -> DriftReport {
    let fields = TotalField::ALL
        .into_iter()
        .filter(|field| {
            exceeds_tolerance(field.local(&state.totals), field.server(server), tolerance)
        })
        .collect();

    // A local line never matches: the server only knows confirmed ids.
    let item_drift = state.items.len() != server.items.len()
        || state.items.iter().any(|local| match &local.id {
            ItemId::Local(_) => true,
            ItemId::Server(id) => !server
                .items
                .iter()
                .any(|remote| &remote.id == id && remote.quantity == local.quantity),
        });

    DriftReport { fields, item_drift }
}

/// Build a cart line from a server item, taking tax category and product type
/// from the local catalog when the payload omits them.
pub fn rehydrate_item(item: &ServerOrderItem, catalog: &dyn CatalogLookup) -> CartItem {
    let source = match &item.product_id {
        Some(product_id) => {
            let cached = catalog.product(product_id);
            let name = if item.name.is_empty() {
                cached.as_ref().map(|p| p.name.clone()).unwrap_or_default()
            } else {
                item.name.clone()
            };
            ItemSource::Product(ProductRef {
                product_id: product_id.clone(),
                name,
                tax_category: cached
                    .as_ref()
                    .and_then(|p| p.tax_category.clone())
                    .or_else(|| item.tax_category.clone()),
                product_type: cached
                    .as_ref()
                    .and_then(|p| p.product_type.clone())
                    .or_else(|| item.product_type.clone()),
            })
        }
        None => ItemSource::Custom(CustomItem {
            name: item.name.clone(),
            tax_category: item.tax_category.clone(),
        }),
    };

    CartItem {
        id: ItemId::Server(item.id.clone()),
        source,
        quantity: item.quantity,
        price_at_sale: item.price_at_sale,
        modifiers: item.modifiers.clone(),
        notes: item.notes.clone(),
    }
}

/// Merge a server snapshot into the current state. The caller must pass the
/// state as it is at the moment of applying, not when the push arrived.
pub fn reconcile(
    state: &CartState,
    server: &ServerOrderSnapshot,
    catalog: &dyn CatalogLookup,
    tolerance: f64,
    now: DateTime<Utc>,
) -> Reconciliation {
    let report = detect_drift(state, server, tolerance);
    let mut next = state.clone();
    next.clear_transient_flags();

    if !report.has_drift() {
        debug!(order_id = %server.order_id, "server snapshot matches local state");
        return Reconciliation {
            state: next,
            report,
        };
    }

    for field in &report.fields {
        field.set(&mut next.totals, field.server(server));
    }
    if report.item_drift {
        next.items = server
            .items
            .iter()
            .map(|item| rehydrate_item(item, catalog))
            .collect();
        next.totals.item_count = next.items.iter().map(|item| item.quantity).sum();
    }
    if next.order_number.is_none() {
        next.order_number = server.order_number.clone();
    }
    next.last_reconciled_at = Some(now);

    info!(
        order_id = %server.order_id,
        drifted_fields = ?report.fields,
        item_drift = report.item_drift,
        "reconciled cart with server snapshot"
    );
    Reconciliation {
        state: next,
        report,
    }
}
