//! Pure cart transitions.
//!
//! `reduce(state, command, ctx)` returns the next state plus the effects the
//! machine must run (dispatch an operation, persist a finished offline order,
//! discard a local order). Nothing here touches the network, the clock or a
//! random source: line ids and adjustment ids arrive inside the command, and
//! "now" arrives through the context. That keeps the command log replayable.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashSet;
use tracing::debug;

use crate::calculator::{Calculator, PricingSettings, TotalsInput};
use crate::cart::model::{
    Adjustment, AdjustmentKind, AppliedDiscount, ApprovalRequest, CartItem, CartState, CustomItem,
    DiscountValue, ItemId, ItemSource, ModifierSnapshot, OrderRef, OrderSnapshot, OrderStatus,
    ProductRef,
};
use crate::error::CartError;
use crate::money::round_money;
use crate::operations::{OperationId, OperationKind, OperationRequest};

pub struct CartContext<'a> {
    pub calculator: &'a dyn Calculator,
    pub settings: &'a PricingSettings,
    pub is_offline: bool,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CartCommand {
    AddItem {
        line_id: ItemId,
        product: ProductRef,
        unit_price: f64,
        quantity: u32,
        modifiers: Vec<ModifierSnapshot>,
        notes: Option<String>,
    },
    AddCustomItem {
        line_id: ItemId,
        item: CustomItem,
        unit_price: f64,
        quantity: u32,
        notes: Option<String>,
    },
    UpdateItemQuantity {
        item_id: ItemId,
        quantity: u32,
    },
    RemoveItem {
        item_id: ItemId,
    },
    ApplyDiscount {
        discount: AppliedDiscount,
    },
    RemoveDiscount {
        discount_id: String,
    },
    ApplyOneOffDiscount {
        adjustment_id: String,
        value: DiscountValue,
        reason: Option<String>,
        target_item_id: Option<ItemId>,
        approved_by: Option<String>,
    },
    ApplyPriceOverride {
        adjustment_id: String,
        item_id: ItemId,
        new_price: f64,
        reason: Option<String>,
        approved_by: Option<String>,
    },
    ApplyTaxExemption {
        adjustment_id: String,
        reason: Option<String>,
        approved_by: Option<String>,
    },
    ApplyFeeExemption {
        adjustment_id: String,
        reason: Option<String>,
        approved_by: Option<String>,
    },
    RemoveAdjustment {
        adjustment_id: String,
    },
    ClearCart,
    HoldOrder,
    CompleteOrder {
        payment_method: Option<String>,
        tip: f64,
    },
    CancelOrder {
        reason: Option<String>,
    },
}

impl CartCommand {
    pub fn name(&self) -> &'static str {
        match self {
            CartCommand::AddItem { .. } => "add_item",
            CartCommand::AddCustomItem { .. } => "add_custom_item",
            CartCommand::UpdateItemQuantity { .. } => "update_item_quantity",
            CartCommand::RemoveItem { .. } => "remove_item",
            CartCommand::ApplyDiscount { .. } => "apply_discount",
            CartCommand::RemoveDiscount { .. } => "remove_discount",
            CartCommand::ApplyOneOffDiscount { .. } => "apply_one_off_discount",
            CartCommand::ApplyPriceOverride { .. } => "apply_price_override",
            CartCommand::ApplyTaxExemption { .. } => "apply_tax_exemption",
            CartCommand::ApplyFeeExemption { .. } => "apply_fee_exemption",
            CartCommand::RemoveAdjustment { .. } => "remove_adjustment",
            CartCommand::ClearCart => "clear_cart",
            CartCommand::HoldOrder => "hold_order",
            CartCommand::CompleteOrder { .. } => "complete_order",
            CartCommand::CancelOrder { .. } => "cancel_order",
        }
    }

    /// Stamp a manager approval onto a gated command.
    pub fn with_approver(self, manager_id: &str) -> Self {
        let approver = Some(manager_id.to_string());
        match self {
            CartCommand::ApplyOneOffDiscount {
                adjustment_id,
                value,
                reason,
                target_item_id,
                ..
            } => CartCommand::ApplyOneOffDiscount {
                adjustment_id,
                value,
                reason,
                target_item_id,
                approved_by: approver,
            },
            CartCommand::ApplyPriceOverride {
                adjustment_id,
                item_id,
                new_price,
                reason,
                ..
            } => CartCommand::ApplyPriceOverride {
                adjustment_id,
                item_id,
                new_price,
                reason,
                approved_by: approver,
            },
            CartCommand::ApplyTaxExemption {
                adjustment_id,
                reason,
                ..
            } => CartCommand::ApplyTaxExemption {
                adjustment_id,
                reason,
                approved_by: approver,
            },
            CartCommand::ApplyFeeExemption {
                adjustment_id,
                reason,
                ..
            } => CartCommand::ApplyFeeExemption {
                adjustment_id,
                reason,
                approved_by: approver,
            },
            other => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CartEffect {
    Dispatch(OperationRequest),
    PersistOfflineOrder {
        status: OrderStatus,
        cancellation_reason: Option<String>,
    },
    DiscardOrder,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub state: CartState,
    pub effects: Vec<CartEffect>,
    /// Line created or changed by the command, for stock-override bookkeeping.
    pub touched_item: Option<ItemId>,
}

impl Transition {
    pub fn dispatch_request(&self) -> Option<&OperationRequest> {
        self.effects.iter().find_map(|effect| match effect {
            CartEffect::Dispatch(request) => Some(request),
            _ => None,
        })
    }
}

/// One entry of the session command log.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedCommand {
    pub operation_id: Option<OperationId>,
    pub epoch: u64,
    pub command: CartCommand,
    /// Connectivity at apply time; it decides the merge rule on replay.
    pub is_offline: bool,
    pub at: DateTime<Utc>,
}

fn dispatch(kind: OperationKind, entity_id: Option<&str>, payload: Value) -> CartEffect {
    CartEffect::Dispatch(OperationRequest {
        kind,
        entity_id: entity_id.map(ToString::to_string),
        payload,
    })
}

fn ensure_editable(state: &CartState, action: &'static str) -> Result<(), CartError> {
    if state.status != OrderStatus::Draft {
        return Err(CartError::InvalidTransition {
            action,
            status: state.status,
        });
    }
    Ok(())
}

fn ensure_price(value: f64) -> Result<(), CartError> {
    if !value.is_finite() || value < 0.0 {
        return Err(CartError::InvalidAmount(format!(
            "price must be a finite non-negative number, got {value}"
        )));
    }
    Ok(())
}

fn ensure_quantity(quantity: u32) -> Result<(), CartError> {
    if quantity == 0 {
        return Err(CartError::InvalidAmount("quantity must be positive".into()));
    }
    Ok(())
}

fn ensure_discount_value(value: DiscountValue) -> Result<(), CartError> {
    let ok = match value {
        DiscountValue::Percent(pct) => pct.is_finite() && pct > 0.0 && pct <= 100.0,
        DiscountValue::Fixed(amount) => amount.is_finite() && amount > 0.0,
    };
    if !ok {
        return Err(CartError::InvalidAmount(format!("invalid discount {value:?}")));
    }
    Ok(())
}

fn adjustment_payload(adjustment: &Adjustment) -> Value {
    json!({
        "adjustment_id": adjustment.id,
        "type": adjustment.kind.wire_name(),
        "kind": adjustment.kind,
        "reason": adjustment.reason,
        "target_item_id": adjustment.target_item_id,
        "approved_by_user_id": adjustment.approved_by_user_id,
    })
}

/// Apply `command` to `state`.
pub fn reduce(
    state: &CartState,
    command: &CartCommand,
    ctx: &CartContext<'_>,
) -> Result<Transition, CartError> {
    let mut next = state.clone();
    let mut effects = Vec::new();
    let mut touched_item = None;

    match command {
        CartCommand::AddItem {
            line_id,
            product,
            unit_price,
            quantity,
            modifiers,
            notes,
        } => {
            ensure_editable(state, "add items")?;
            ensure_quantity(*quantity)?;
            ensure_price(*unit_price)?;

            // Online, an unconfirmed local line is about to be replaced by the
            // server's canonical row, so merging into it would flicker.
            let merge_target = if modifiers.is_empty() && notes.is_none() {
                next.items.iter().position(|item| {
                    item.is_mergeable_with(&product.product_id, *unit_price)
                        && (ctx.is_offline || !item.id.is_local())
                })
            } else {
                None
            };

            let (item_id, line_quantity) = match merge_target {
                Some(index) => {
                    let item = &mut next.items[index];
                    item.quantity += quantity;
                    (item.id.clone(), item.quantity)
                }
                None => {
                    next.items.push(CartItem {
                        id: line_id.clone(),
                        source: ItemSource::Product(product.clone()),
                        quantity: *quantity,
                        price_at_sale: *unit_price,
                        modifiers: modifiers.clone(),
                        notes: notes.clone(),
                    });
                    (line_id.clone(), *quantity)
                }
            };

            next.adding_item_id = Some(item_id.clone());
            effects.push(dispatch(
                OperationKind::AddItem,
                Some(&product.product_id),
                json!({
                    "item_id": item_id,
                    "product_id": product.product_id,
                    "name": product.name,
                    "quantity": quantity,
                    "line_quantity": line_quantity,
                    "unit_price": unit_price,
                    "modifiers": modifiers,
                    "notes": notes,
                    "merged": merge_target.is_some(),
                }),
            ));
            touched_item = Some(item_id);
        }

        CartCommand::AddCustomItem {
            line_id,
            item,
            unit_price,
            quantity,
            notes,
        } => {
            ensure_editable(state, "add items")?;
            ensure_quantity(*quantity)?;
            ensure_price(*unit_price)?;

            next.items.push(CartItem {
                id: line_id.clone(),
                source: ItemSource::Custom(item.clone()),
                quantity: *quantity,
                price_at_sale: *unit_price,
                modifiers: Vec::new(),
                notes: notes.clone(),
            });
            next.adding_item_id = Some(line_id.clone());
            effects.push(dispatch(
                OperationKind::AddItem,
                None,
                json!({
                    "item_id": line_id,
                    "custom_item": item,
                    "quantity": quantity,
                    "line_quantity": quantity,
                    "unit_price": unit_price,
                    "notes": notes,
                }),
            ));
            touched_item = Some(line_id.clone());
        }

        CartCommand::UpdateItemQuantity { item_id, quantity } => {
            ensure_editable(state, "change quantities")?;
            if *quantity == 0 {
                return reduce(
                    state,
                    &CartCommand::RemoveItem {
                        item_id: item_id.clone(),
                    },
                    ctx,
                );
            }
            let item = next
                .item_mut(item_id)
                .ok_or_else(|| CartError::ItemNotFound(item_id.clone()))?;
            let previous = item.quantity;
            item.quantity = *quantity;
            next.updating_items.insert(item_id.clone());
            effects.push(dispatch(
                OperationKind::UpdateQuantity,
                Some(item_id.as_str()),
                json!({
                    "item_id": item_id,
                    "quantity": quantity,
                    "previous_quantity": previous,
                }),
            ));
            touched_item = Some(item_id.clone());
        }

        CartCommand::RemoveItem { item_id } => {
            ensure_editable(state, "remove items")?;
            let before = next.items.len();
            next.items.retain(|item| &item.id != item_id);
            if next.items.len() == before {
                return Err(CartError::ItemNotFound(item_id.clone()));
            }
            next.adjustments
                .retain(|adj| adj.target_item_id.as_ref() != Some(item_id));
            next.updating_items.remove(item_id);
            if next.adding_item_id.as_ref() == Some(item_id) {
                next.adding_item_id = None;
            }
            effects.push(dispatch(
                OperationKind::RemoveItem,
                Some(item_id.as_str()),
                json!({ "item_id": item_id }),
            ));
        }

        CartCommand::ApplyDiscount { discount } => {
            ensure_editable(state, "apply discounts")?;
            ensure_discount_value(discount.value)?;
            next.applied_discounts
                .retain(|d| d.discount_id != discount.discount_id);
            next.applied_discounts.push(discount.clone());
            effects.push(dispatch(
                OperationKind::ApplyDiscount,
                Some(&discount.discount_id),
                json!({
                    "discount_id": discount.discount_id,
                    "code": discount.code,
                    "value": discount.value,
                }),
            ));
        }

        CartCommand::RemoveDiscount { discount_id } => {
            ensure_editable(state, "remove discounts")?;
            let before = next.applied_discounts.len();
            next.applied_discounts.retain(|d| &d.discount_id != discount_id);
            if next.applied_discounts.len() == before {
                return Err(CartError::DiscountNotFound(discount_id.clone()));
            }
            effects.push(dispatch(
                OperationKind::RemoveDiscount,
                Some(discount_id),
                json!({ "discount_id": discount_id }),
            ));
        }

        CartCommand::ApplyOneOffDiscount {
            adjustment_id,
            value,
            reason,
            target_item_id,
            approved_by,
        } => {
            ensure_editable(state, "apply discounts")?;
            ensure_discount_value(*value)?;
            let base = match target_item_id {
                Some(id) => state
                    .item(id)
                    .map(CartItem::line_total)
                    .ok_or_else(|| CartError::ItemNotFound(id.clone()))?,
                None => state.totals.subtotal,
            };

            if approved_by.is_none() {
                if let Some(threshold) = ctx.settings.approval_discount_threshold_percent {
                    let effective = match *value {
                        DiscountValue::Percent(pct) => pct,
                        DiscountValue::Fixed(amount) if base > 0.0 => amount / base * 100.0,
                        DiscountValue::Fixed(_) => 0.0,
                    };
                    if effective > threshold {
                        next.approval_request = Some(ApprovalRequest {
                            command: command.clone(),
                            reason: format!(
                                "Discount of {effective:.1}% exceeds the {threshold:.1}% limit"
                            ),
                        });
                        return Ok(Transition {
                            state: next,
                            effects,
                            touched_item,
                        });
                    }
                }
            }

            let adjustment = Adjustment {
                id: adjustment_id.clone(),
                kind: AdjustmentKind::OneOffDiscount { value: *value },
                amount: 0.0,
                reason: reason.clone(),
                target_item_id: target_item_id.clone(),
                approved_by_user_id: approved_by.clone(),
            };
            effects.push(dispatch(
                OperationKind::ApplyAdjustment,
                Some(adjustment_id),
                adjustment_payload(&adjustment),
            ));
            next.adjustments.push(adjustment);
        }

        CartCommand::ApplyPriceOverride {
            adjustment_id,
            item_id,
            new_price,
            reason,
            approved_by,
        } => {
            ensure_editable(state, "override prices")?;
            ensure_price(*new_price)?;
            let current_price = state
                .item(item_id)
                .map(|item| item.price_at_sale)
                .ok_or_else(|| CartError::ItemNotFound(item_id.clone()))?;

            // A second override on the same line keeps the first original.
            let existing = next.adjustments.iter().position(|adj| {
                adj.target_item_id.as_ref() == Some(item_id)
                    && matches!(adj.kind, AdjustmentKind::PriceOverride { .. })
            });
            let original_price = match existing {
                Some(index) => {
                    let previous = next.adjustments.remove(index);
                    previous.original_price().unwrap_or(current_price)
                }
                None => current_price,
            };

            if let Some(item) = next.item_mut(item_id) {
                item.price_at_sale = *new_price;
            }
            let adjustment = Adjustment {
                id: adjustment_id.clone(),
                kind: AdjustmentKind::PriceOverride {
                    original_price,
                    new_price: *new_price,
                },
                amount: 0.0,
                reason: reason.clone(),
                target_item_id: Some(item_id.clone()),
                approved_by_user_id: approved_by.clone(),
            };
            effects.push(dispatch(
                OperationKind::ApplyAdjustment,
                Some(adjustment_id),
                adjustment_payload(&adjustment),
            ));
            next.adjustments.push(adjustment);
            touched_item = Some(item_id.clone());
        }

        CartCommand::ApplyTaxExemption {
            adjustment_id,
            reason,
            approved_by,
        }
        | CartCommand::ApplyFeeExemption {
            adjustment_id,
            reason,
            approved_by,
        } => {
            ensure_editable(state, "apply exemptions")?;
            let kind = if matches!(command, CartCommand::ApplyTaxExemption { .. }) {
                AdjustmentKind::TaxExempt
            } else {
                AdjustmentKind::FeeExempt
            };
            next.adjustments.retain(|adj| adj.kind != kind);
            let adjustment = Adjustment {
                id: adjustment_id.clone(),
                kind,
                amount: 0.0,
                reason: reason.clone(),
                target_item_id: None,
                approved_by_user_id: approved_by.clone(),
            };
            effects.push(dispatch(
                OperationKind::ApplyAdjustment,
                Some(adjustment_id),
                adjustment_payload(&adjustment),
            ));
            next.adjustments.push(adjustment);
        }

        CartCommand::RemoveAdjustment { adjustment_id } => {
            ensure_editable(state, "remove adjustments")?;
            let index = next
                .adjustments
                .iter()
                .position(|adj| &adj.id == adjustment_id)
                .ok_or_else(|| CartError::AdjustmentNotFound(adjustment_id.clone()))?;
            let removed = next.adjustments.remove(index);
            if let (Some(original), Some(target)) =
                (removed.original_price(), removed.target_item_id.as_ref())
            {
                if let Some(item) = next.item_mut(target) {
                    item.price_at_sale = original;
                }
            }
            effects.push(dispatch(
                OperationKind::RemoveAdjustment,
                Some(adjustment_id),
                json!({
                    "adjustment_id": adjustment_id,
                    "type": removed.kind.wire_name(),
                }),
            ));
        }

        CartCommand::ClearCart => {
            ensure_editable(state, "clear the cart")?;
            next.items.clear();
            next.adjustments.clear();
            next.applied_discounts.clear();
            next.clear_transient_flags();
            if next.order_id.is_some() {
                effects.push(dispatch(OperationKind::ClearCart, None, json!({})));
            }
        }

        CartCommand::HoldOrder => {
            ensure_editable(state, "hold the order")?;
            // Holding relies on server-side persistence.
            if ctx.is_offline || state.order_id.as_ref().is_some_and(OrderRef::is_local) {
                return Err(CartError::HoldUnavailableOffline);
            }
            if state.is_empty() {
                return Err(CartError::EmptyCart);
            }
            next.status = OrderStatus::Hold;
            effects.push(dispatch(
                OperationKind::HoldOrder,
                None,
                json!({ "status": OrderStatus::Hold }),
            ));
        }

        CartCommand::CompleteOrder {
            payment_method,
            tip,
        } => {
            ensure_editable(state, "complete the order")?;
            if state.is_empty() {
                return Err(CartError::EmptyCart);
            }
            if !tip.is_finite() || *tip < 0.0 {
                return Err(CartError::InvalidAmount(format!("invalid tip {tip}")));
            }
            next.payment_method = payment_method.clone();
            next.tip = round_money(*tip);
            recompute(&mut next, ctx);

            let local_only = state.order_id.as_ref().map_or(ctx.is_offline, OrderRef::is_local);
            if ctx.is_offline || local_only {
                next.status = OrderStatus::Completed;
                next.is_offline_order = true;
                effects.push(CartEffect::PersistOfflineOrder {
                    status: OrderStatus::Completed,
                    cancellation_reason: None,
                });
            } else {
                next.status = OrderStatus::Pending;
                let snapshot =
                    OrderSnapshot::from_state(&next, OrderStatus::Completed, None, ctx.now);
                effects.push(dispatch(
                    OperationKind::CompleteOrder,
                    None,
                    json!({
                        "payment_method": payment_method,
                        "tip": next.tip,
                        "totals": next.totals,
                        "order": snapshot,
                    }),
                ));
            }
            return Ok(Transition {
                state: next,
                effects,
                touched_item,
            });
        }

        CartCommand::CancelOrder { reason } => {
            if !matches!(state.status, OrderStatus::Draft | OrderStatus::Hold) {
                return Err(CartError::InvalidTransition {
                    action: "cancel the order",
                    status: state.status,
                });
            }
            next.status = OrderStatus::Cancelled;
            let server_id = state.order_id.as_ref().and_then(OrderRef::server_id);
            match (ctx.is_offline, server_id) {
                (false, Some(_)) => effects.push(dispatch(
                    OperationKind::CancelOrder,
                    None,
                    json!({ "reason": reason }),
                )),
                (true, Some(_)) => {
                    next.is_offline_order = true;
                    effects.push(CartEffect::PersistOfflineOrder {
                        status: OrderStatus::Cancelled,
                        cancellation_reason: reason.clone(),
                    });
                }
                (_, None) => effects.push(CartEffect::DiscardOrder),
            }
            return Ok(Transition {
                state: next,
                effects,
                touched_item,
            });
        }
    }

    if next.created_at.is_none() && !next.items.is_empty() {
        next.created_at = Some(ctx.now);
    }
    if ctx.is_offline && next.order_id.is_none() && !next.items.is_empty() {
        next.is_offline_order = true;
    }
    recompute(&mut next, ctx);

    Ok(Transition {
        state: next,
        effects,
        touched_item,
    })
}

/// Refresh discount/adjustment amounts, exemption flags and totals.
pub fn recompute(state: &mut CartState, ctx: &CartContext<'_>) {
    let subtotal = round_money(state.items.iter().map(CartItem::line_total).sum());

    for discount in &mut state.applied_discounts {
        discount.amount = discount.value.amount_on(subtotal);
    }
    let discount_total: f64 = state.applied_discounts.iter().map(|d| d.amount).sum();
    let order_base = round_money((subtotal - discount_total).max(0.0));

    let items = &state.items;
    for adjustment in &mut state.adjustments {
        let target = adjustment
            .target_item_id
            .as_ref()
            .and_then(|id| items.iter().find(|item| &item.id == id));
        adjustment.amount = match adjustment.kind {
            AdjustmentKind::OneOffDiscount { value } => {
                let base = target.map_or(order_base, CartItem::line_total);
                -value.amount_on(base)
            }
            AdjustmentKind::PriceOverride {
                original_price,
                new_price,
            } => {
                let quantity = target.map_or(0, |item| item.quantity);
                round_money((new_price - original_price) * f64::from(quantity))
            }
            AdjustmentKind::TaxExempt | AdjustmentKind::FeeExempt => 0.0,
        };
    }

    state.is_tax_exempt = state
        .adjustments
        .iter()
        .any(|adj| matches!(adj.kind, AdjustmentKind::TaxExempt));
    state.is_fee_exempt = state
        .adjustments
        .iter()
        .any(|adj| matches!(adj.kind, AdjustmentKind::FeeExempt));

    state.totals = ctx.calculator.calculate_totals(&TotalsInput {
        items: &state.items,
        adjustments: &state.adjustments,
        applied_discounts: &state.applied_discounts,
        settings: ctx.settings,
        payment_method: state.payment_method.as_deref(),
        tip: state.tip,
    });
}

/// Rebuild state from a command log. Entries whose operation id was already
/// seen are skipped, so a duplicated delivery never applies twice.
pub fn replay(
    initial: &CartState,
    log: &[LoggedCommand],
    calculator: &dyn Calculator,
    settings: &PricingSettings,
) -> CartState {
    let mut seen: HashSet<&OperationId> = HashSet::new();
    let mut state = initial.clone();
    for entry in log {
        if let Some(id) = &entry.operation_id {
            if !seen.insert(id) {
                debug!(operation_id = %id, "replay: duplicate operation skipped");
                continue;
            }
        }
        let ctx = CartContext {
            calculator,
            settings,
            is_offline: entry.is_offline,
            now: entry.at,
        };
        match reduce(&state, &entry.command, &ctx) {
            Ok(transition) => state = transition.state,
            Err(e) => {
                debug!(command = entry.command.name(), error = %e, "replay: command rejected")
            }
        }
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calculator::StandardCalculator;

    fn ctx<'a>(settings: &'a PricingSettings, offline: bool) -> CartContext<'a> {
        CartContext {
            calculator: &StandardCalculator,
            settings,
            is_offline: offline,
            now: Utc::now(),
        }
    }

    fn product(id: &str) -> ProductRef {
        ProductRef {
            product_id: id.into(),
            name: format!("Product {id}"),
            tax_category: None,
            product_type: None,
        }
    }

    fn add(product_id: &str, price: f64, qty: u32) -> CartCommand {
        CartCommand::AddItem {
            line_id: ItemId::new_local(),
            product: product(product_id),
            unit_price: price,
            quantity: qty,
            modifiers: vec![],
            notes: None,
        }
    }

    fn apply(state: &CartState, command: CartCommand, ctx: &CartContext<'_>) -> Transition {
        reduce(state, &command, ctx).expect("command accepted")
    }

    #[test]
    fn test_offline_add_merges_into_local_line() {
        let settings = PricingSettings::default();
        let ctx = ctx(&settings, true);
        let t1 = apply(&CartState::default(), add("P1", 5.0, 1), &ctx);
        let t2 = apply(&t1.state, add("P1", 5.0, 1), &ctx);

        assert_eq!(t2.state.items.len(), 1);
        assert_eq!(t2.state.items[0].quantity, 2);
        assert_eq!(t2.state.totals.subtotal, 10.0);
        assert!(t2.state.is_offline_order);
    }

    #[test]
    fn test_online_add_does_not_merge_into_unconfirmed_line() {
        let settings = PricingSettings::default();
        let ctx = ctx(&settings, false);
        let t1 = apply(&CartState::default(), add("P1", 5.0, 1), &ctx);
        let t2 = apply(&t1.state, add("P1", 5.0, 1), &ctx);
        assert_eq!(t2.state.items.len(), 2);

        let mut confirmed = t1.state.clone();
        confirmed.items[0].id = ItemId::Server("srv-1".into());
        let t3 = apply(&confirmed, add("P1", 5.0, 1), &ctx);
        assert_eq!(t3.state.items.len(), 1);
        assert_eq!(t3.state.items[0].quantity, 2);
        assert_eq!(t3.touched_item, Some(ItemId::Server("srv-1".into())));
    }

    #[test]
    fn test_items_with_modifiers_never_merge() {
        let settings = PricingSettings::default();
        let ctx = ctx(&settings, true);
        let t1 = apply(&CartState::default(), add("P1", 5.0, 1), &ctx);
        let with_modifier = CartCommand::AddItem {
            line_id: ItemId::new_local(),
            product: product("P1"),
            unit_price: 5.0,
            quantity: 1,
            modifiers: vec![ModifierSnapshot {
                modifier_id: "m1".into(),
                name: "Extra shot".into(),
                price: 0.75,
                quantity: 1,
            }],
            notes: None,
        };
        let t2 = apply(&t1.state, with_modifier, &ctx);
        assert_eq!(t2.state.items.len(), 2);
        assert_eq!(t2.state.totals.subtotal, 10.75);
    }

    #[test]
    fn test_one_off_discount_ten_percent() {
        let settings = PricingSettings {
            tax_rate: 5.0,
            ..Default::default()
        };
        let ctx = ctx(&settings, false);
        let t1 = apply(&CartState::default(), add("P1", 10.0, 2), &ctx);
        let t2 = apply(
            &t1.state,
            CartCommand::ApplyOneOffDiscount {
                adjustment_id: "adj-1".into(),
                value: DiscountValue::Percent(10.0),
                reason: Some("regular".into()),
                target_item_id: None,
                approved_by: None,
            },
            &ctx,
        );
        assert_eq!(t2.state.adjustments[0].amount, -2.0);
        assert_eq!(t2.state.totals.adjustment_total, -2.0);
        assert_eq!(t2.state.totals.tax, 0.9);
        assert_eq!(t2.state.totals.total, 18.9);
    }

    #[test]
    fn test_discount_above_threshold_requests_approval() {
        let settings = PricingSettings {
            approval_discount_threshold_percent: Some(20.0),
            ..Default::default()
        };
        let ctx = ctx(&settings, false);
        let t1 = apply(&CartState::default(), add("P1", 10.0, 1), &ctx);
        let command = CartCommand::ApplyOneOffDiscount {
            adjustment_id: "adj-1".into(),
            value: DiscountValue::Percent(50.0),
            reason: None,
            target_item_id: None,
            approved_by: None,
        };
        let t2 = apply(&t1.state, command.clone(), &ctx);
        assert!(t2.effects.is_empty());
        assert!(t2.state.adjustments.is_empty());
        assert_eq!(
            t2.state.approval_request.as_ref().map(|r| &r.command),
            Some(&command)
        );

        let approved = apply(&t1.state, command.with_approver("mgr-1"), &ctx);
        assert_eq!(approved.state.adjustments.len(), 1);
        assert_eq!(
            approved.state.adjustments[0].approved_by_user_id.as_deref(),
            Some("mgr-1")
        );
        assert_eq!(approved.state.totals.total, 5.0);
    }

    #[test]
    fn test_price_override_is_reversible() {
        let settings = PricingSettings::default();
        let ctx = ctx(&settings, false);
        let t1 = apply(&CartState::default(), add("P1", 8.0, 2), &ctx);
        let item_id = t1.state.items[0].id.clone();

        let t2 = apply(
            &t1.state,
            CartCommand::ApplyPriceOverride {
                adjustment_id: "po-1".into(),
                item_id: item_id.clone(),
                new_price: 6.0,
                reason: Some("damaged box".into()),
                approved_by: Some("mgr".into()),
            },
            &ctx,
        );
        assert_eq!(t2.state.totals.subtotal, 12.0);
        assert_eq!(t2.state.adjustments[0].amount, -4.0);
        assert_eq!(t2.state.totals.adjustment_total, 0.0);

        let t3 = apply(
            &t2.state,
            CartCommand::RemoveAdjustment {
                adjustment_id: "po-1".into(),
            },
            &ctx,
        );
        assert_eq!(t3.state.items[0].price_at_sale, 8.0);
        assert_eq!(t3.state.totals.subtotal, 16.0);
    }

    #[test]
    fn test_hold_is_rejected_offline() {
        let settings = PricingSettings::default();
        let offline = ctx(&settings, true);
        let t1 = apply(&CartState::default(), add("P1", 5.0, 1), &offline);
        assert_eq!(
            reduce(&t1.state, &CartCommand::HoldOrder, &offline),
            Err(CartError::HoldUnavailableOffline)
        );

        let online = ctx(&settings, false);
        let mut with_local_order = t1.state.clone();
        with_local_order.order_id = Some(OrderRef::Local("offline-1".into()));
        assert_eq!(
            reduce(&with_local_order, &CartCommand::HoldOrder, &online),
            Err(CartError::HoldUnavailableOffline)
        );

        let mut server_order = t1.state.clone();
        server_order.order_id = Some(OrderRef::Server("ord-1".into()));
        let held = apply(&server_order, CartCommand::HoldOrder, &online);
        assert_eq!(held.state.status, OrderStatus::Hold);
        assert!(reduce(&held.state, &add("P2", 1.0, 1), &online).is_err());
    }

    #[test]
    fn test_complete_offline_persists_instead_of_dispatching() {
        let settings = PricingSettings::default();
        let ctx = ctx(&settings, true);
        let t1 = apply(&CartState::default(), add("P1", 5.0, 1), &ctx);
        let done = apply(
            &t1.state,
            CartCommand::CompleteOrder {
                payment_method: Some("cash".into()),
                tip: 1.0,
            },
            &ctx,
        );
        assert_eq!(done.state.status, OrderStatus::Completed);
        assert_eq!(done.state.totals.total, 6.0);
        assert!(done.dispatch_request().is_none());
        assert_eq!(
            done.effects,
            vec![CartEffect::PersistOfflineOrder {
                status: OrderStatus::Completed,
                cancellation_reason: None
            }]
        );
    }

    #[test]
    fn test_cancel_local_order_is_discarded() {
        let settings = PricingSettings::default();
        let ctx = ctx(&settings, true);
        let t1 = apply(&CartState::default(), add("P1", 5.0, 1), &ctx);
        let cancelled = apply(&t1.state, CartCommand::CancelOrder { reason: None }, &ctx);
        assert_eq!(cancelled.state.status, OrderStatus::Cancelled);
        assert_eq!(cancelled.effects, vec![CartEffect::DiscardOrder]);
    }

    #[test]
    fn test_replay_skips_duplicate_operation_ids() {
        let settings = PricingSettings::default();
        let command = add("P1", 5.0, 1);
        let op = OperationId::generate("add_item", Some("P1"));
        let entry = LoggedCommand {
            operation_id: Some(op),
            epoch: 1,
            command,
            is_offline: true,
            at: Utc::now(),
        };
        let state = replay(
            &CartState::default(),
            &[entry.clone(), entry],
            &StandardCalculator,
            &settings,
        );
        assert_eq!(state.items.len(), 1);
        assert_eq!(state.items[0].quantity, 1);
        assert_eq!(state.totals.subtotal, 5.0);
    }
}
