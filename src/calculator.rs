//! Totals calculator seam.
//!
//! The cart treats the calculator as a black box: a pure function from
//! items, adjustments, discounts and settings to totals. `StandardCalculator`
//! is the implementation the terminal ships with.
//!
//! Discount and one-off adjustment amounts arrive already computed (the
//! reducer refreshes them on every change); the calculator only aggregates,
//! taxes and applies surcharges. Price overrides are reflected in the line
//! price and are not counted again in `adjustment_total`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::cart::model::{Adjustment, AdjustmentKind, AppliedDiscount, CartItem, Totals};
use crate::money::{percent_of, round_money};

/// Pricing configuration loaded once from the `settings` and `taxes` datasets.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PricingSettings {
    /// Default tax rate in percent.
    pub tax_rate: f64,
    /// Overrides keyed by tax category.
    #[serde(default)]
    pub category_tax_rates: HashMap<String, f64>,
    #[serde(default)]
    pub service_fee_percent: f64,
    #[serde(default)]
    pub card_surcharge_percent: f64,
    /// One-off discounts above this percentage need manager approval.
    #[serde(default)]
    pub approval_discount_threshold_percent: Option<f64>,
}

impl PricingSettings {
    pub fn rate_for(&self, tax_category: Option<&str>) -> f64 {
        tax_category
            .and_then(|category| self.category_tax_rates.get(category))
            .copied()
            .unwrap_or(self.tax_rate)
    }
}

pub struct TotalsInput<'a> {
    pub items: &'a [CartItem],
    pub adjustments: &'a [Adjustment],
    pub applied_discounts: &'a [AppliedDiscount],
    pub settings: &'a PricingSettings,
    pub payment_method: Option<&'a str>,
    pub tip: f64,
}

pub trait Calculator: Send + Sync {
    fn calculate_totals(&self, input: &TotalsInput<'_>) -> Totals;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StandardCalculator;

impl Calculator for StandardCalculator {
    fn calculate_totals(&self, input: &TotalsInput<'_>) -> Totals {
        let subtotal = round_money(input.items.iter().map(CartItem::line_total).sum());
        let item_count = input.items.iter().map(|item| item.quantity).sum();

        let discount_total = round_money(input.applied_discounts.iter().map(|d| d.amount).sum());
        let adjustment_total = round_money(
            input
                .adjustments
                .iter()
                .filter(|a| matches!(a.kind, AdjustmentKind::OneOffDiscount { .. }))
                .map(|a| a.amount)
                .sum(),
        );
        let tax_exempt = input
            .adjustments
            .iter()
            .any(|a| matches!(a.kind, AdjustmentKind::TaxExempt));
        let fee_exempt = input
            .adjustments
            .iter()
            .any(|a| matches!(a.kind, AdjustmentKind::FeeExempt));

        let taxable = round_money((subtotal - discount_total + adjustment_total).max(0.0));

        // Discounts are spread over lines pro rata before tax.
        let tax = if tax_exempt || subtotal <= 0.0 {
            0.0
        } else {
            let ratio = taxable / subtotal;
            round_money(
                input
                    .items
                    .iter()
                    .map(|item| {
                        item.line_total() * ratio * input.settings.rate_for(item.tax_category())
                            / 100.0
                    })
                    .sum(),
            )
        };

        let surcharge = if fee_exempt {
            0.0
        } else {
            let card = matches!(input.payment_method, Some(m) if m.eq_ignore_ascii_case("card"));
            let mut fee = percent_of(taxable, input.settings.service_fee_percent);
            if card {
                fee += percent_of(taxable, input.settings.card_surcharge_percent);
            }
            round_money(fee)
        };

        let tip = round_money(input.tip.max(0.0));
        Totals {
            subtotal,
            tax,
            discount_total,
            adjustment_total,
            surcharge,
            total: round_money(taxable + tax + surcharge + tip),
            item_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cart::model::{DiscountValue, ItemId, ItemSource, ProductRef};

    fn line(product_id: &str, price: f64, qty: u32, tax_category: Option<&str>) -> CartItem {
        CartItem {
            id: ItemId::new_local(),
            source: ItemSource::Product(ProductRef {
                product_id: product_id.into(),
                name: product_id.into(),
                tax_category: tax_category.map(Into::into),
                product_type: None,
            }),
            quantity: qty,
            price_at_sale: price,
            modifiers: vec![],
            notes: None,
        }
    }

    fn settings() -> PricingSettings {
        PricingSettings {
            tax_rate: 10.0,
            category_tax_rates: HashMap::from([("zero".to_string(), 0.0)]),
            ..Default::default()
        }
    }

    #[test]
    fn test_totals_with_one_off_discount() {
        let items = vec![line("p1", 5.0, 4, None)];
        let adjustments = vec![Adjustment {
            id: "a1".into(),
            kind: AdjustmentKind::OneOffDiscount {
                value: DiscountValue::Percent(10.0),
            },
            amount: -2.0,
            reason: None,
            target_item_id: None,
            approved_by_user_id: None,
        }];
        let settings = settings();
        let totals = StandardCalculator.calculate_totals(&TotalsInput {
            items: &items,
            adjustments: &adjustments,
            applied_discounts: &[],
            settings: &settings,
            payment_method: None,
            tip: 0.0,
        });
        assert_eq!(totals.subtotal, 20.0);
        assert_eq!(totals.adjustment_total, -2.0);
        assert_eq!(totals.tax, 1.8);
        assert_eq!(totals.total, 19.8);
        assert_eq!(totals.item_count, 4);
    }

    #[test]
    fn test_category_rate_and_tax_exemption() {
        let items = vec![line("p1", 10.0, 1, None), line("p2", 10.0, 1, Some("zero"))];
        let settings = settings();
        let input = TotalsInput {
            items: &items,
            adjustments: &[],
            applied_discounts: &[],
            settings: &settings,
            payment_method: None,
            tip: 0.0,
        };
        assert_eq!(StandardCalculator.calculate_totals(&input).tax, 1.0);

        let exempt = vec![Adjustment {
            id: "a1".into(),
            kind: AdjustmentKind::TaxExempt,
            amount: 0.0,
            reason: Some("diplomat".into()),
            target_item_id: None,
            approved_by_user_id: None,
        }];
        let totals = StandardCalculator.calculate_totals(&TotalsInput {
            adjustments: &exempt,
            ..input
        });
        assert_eq!(totals.tax, 0.0);
        assert_eq!(totals.total, 20.0);
    }

    #[test]
    fn test_card_surcharge_respects_fee_exemption() {
        let items = vec![line("p1", 100.0, 1, None)];
        let settings = PricingSettings {
            card_surcharge_percent: 2.0,
            ..Default::default()
        };
        let input = TotalsInput {
            items: &items,
            adjustments: &[],
            applied_discounts: &[],
            settings: &settings,
            payment_method: Some("card"),
            tip: 5.0,
        };
        let totals = StandardCalculator.calculate_totals(&input);
        assert_eq!(totals.surcharge, 2.0);
        assert_eq!(totals.total, 107.0);

        let fee_exempt = vec![Adjustment {
            id: "f".into(),
            kind: AdjustmentKind::FeeExempt,
            amount: 0.0,
            reason: None,
            target_item_id: None,
            approved_by_user_id: None,
        }];
        let totals = StandardCalculator.calculate_totals(&TotalsInput {
            adjustments: &fee_exempt,
            ..input
        });
        assert_eq!(totals.surcharge, 0.0);
    }
}
