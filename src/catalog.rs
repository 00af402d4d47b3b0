//! Read side of the reference-data caches.
//!
//! The cart, the reconciler and the calculator settings all read products,
//! discounts, taxes and settings from the datasets `dataset_sync` keeps
//! current. Reads never fail the caller: a miss or a cache error yields
//! `None` (logged), matching how the terminal degrades when a dataset has
//! not been synced yet.

use serde_json::Value;
use std::sync::Arc;
use tracing::{error, warn};

use crate::calculator::PricingSettings;
use crate::cart::model::{AppliedDiscount, DiscountValue, ProductRef};
use crate::dataset_sync::Dataset;
use crate::db::LocalStore;
use crate::error::Result;
use crate::{value_bool, value_f64, value_str};

/// Lookups the cart needs from the local catalog.
pub trait CatalogLookup: Send + Sync {
    fn product(&self, product_id: &str) -> Option<ProductRef>;
    fn discount(&self, discount_id: &str) -> Option<AppliedDiscount>;
    fn discount_by_code(&self, code: &str) -> Option<AppliedDiscount>;
}

/// SQLite-backed catalog over the synced datasets.
#[derive(Clone)]
pub struct Catalog {
    store: Arc<LocalStore>,
}

impl Catalog {
    pub fn new(store: Arc<LocalStore>) -> Self {
        Self { store }
    }

    fn read(&self, dataset: Dataset) -> Vec<Value> {
        match self.store.read_dataset(dataset.key()) {
            Ok(records) => records,
            Err(e) => {
                error!(dataset = dataset.key(), "catalog read failed: {e}");
                vec![]
            }
        }
    }

    fn find(&self, dataset: Dataset, id: &str) -> Option<Value> {
        match self.store.find_record(dataset.key(), id) {
            Ok(found) => found,
            Err(e) => {
                error!(dataset = dataset.key(), id, "catalog lookup failed: {e}");
                None
            }
        }
    }

    /// Catalog price of a product, for callers that add by id.
    pub fn product_price(&self, product_id: &str) -> Option<f64> {
        self.find(Dataset::Products, product_id)
            .and_then(|record| value_f64(&record, &["price", "base_price", "unit_price"]))
    }
}

impl CatalogLookup for Catalog {
    fn product(&self, product_id: &str) -> Option<ProductRef> {
        self.find(Dataset::Products, product_id)
            .and_then(|record| parse_product(&record))
    }

    fn discount(&self, discount_id: &str) -> Option<AppliedDiscount> {
        self.find(Dataset::Discounts, discount_id)
            .and_then(|record| parse_discount(&record))
    }

    fn discount_by_code(&self, code: &str) -> Option<AppliedDiscount> {
        let wanted = code.trim();
        self.read(Dataset::Discounts)
            .iter()
            .filter(|record| {
                value_str(record, &["code", "discount_code"])
                    .is_some_and(|c| c.eq_ignore_ascii_case(wanted))
            })
            .find_map(parse_discount)
    }
}

pub(crate) fn parse_product(record: &Value) -> Option<ProductRef> {
    Some(ProductRef {
        product_id: crate::db::record_id(record)?,
        name: value_str(record, &["name", "title"]).unwrap_or_default(),
        tax_category: value_str(record, &["tax_category", "tax_category_id", "tax_code"]),
        product_type: value_str(record, &["product_type", "product_type_id", "type"]),
    })
}

/// Inactive discounts are treated as missing.
pub(crate) fn parse_discount(record: &Value) -> Option<AppliedDiscount> {
    if value_bool(record, &["is_active", "active"]) == Some(false) {
        return None;
    }
    let amount = value_f64(record, &["value", "amount", "percentage"])?;
    let kind = value_str(record, &["discount_type", "type", "value_type"]).unwrap_or_default();
    let value = match kind.to_ascii_lowercase().as_str() {
        "fixed" | "fixed_amount" | "amount" => DiscountValue::Fixed(amount),
        _ => DiscountValue::Percent(amount),
    };
    Some(AppliedDiscount {
        discount_id: crate::db::record_id(record)?,
        name: value_str(record, &["name", "title"]).unwrap_or_default(),
        code: value_str(record, &["code", "discount_code"]),
        value,
        amount: 0.0,
    })
}

/// Settings values arrive as numbers or numeric strings.
fn setting_number(record: &Value) -> Option<f64> {
    value_f64(record, &["value", "setting_value"]).or_else(|| {
        value_str(record, &["value", "setting_value"]).and_then(|raw| raw.parse::<f64>().ok())
    })
}

/// Build pricing settings from the `settings` and `taxes` datasets.
pub fn load_pricing_settings(store: &LocalStore) -> Result<PricingSettings> {
    let mut settings = PricingSettings::default();

    for record in store.read_dataset(Dataset::Settings.key())? {
        let Some(key) = value_str(&record, &["key", "setting_key", "id"]) else {
            continue;
        };
        let Some(number) = setting_number(&record) else {
            continue;
        };
        match key.as_str() {
            "tax_rate" | "default_tax_rate" => settings.tax_rate = number,
            "service_fee_percent" | "service_fee_percentage" => {
                settings.service_fee_percent = number
            }
            "card_surcharge_percent" | "card_surcharge_percentage" => {
                settings.card_surcharge_percent = number
            }
            "discount_approval_threshold" | "manager_approval_discount_threshold" => {
                settings.approval_discount_threshold_percent = Some(number)
            }
            _ => {}
        }
    }

    for record in store.read_dataset(Dataset::Taxes.key())? {
        let Some(rate) = value_f64(&record, &["rate", "percentage", "tax_rate"]) else {
            warn!(record = %record, "tax record without rate ignored");
            continue;
        };
        if value_bool(&record, &["is_default", "default"]) == Some(true) {
            settings.tax_rate = rate;
        }
        if let Some(category) = value_str(&record, &["category", "tax_category", "code", "id"]) {
            settings.category_tax_rates.insert(category, rate);
        }
    }

    Ok(settings)
}
