//! Change detection between two snapshots of one monitored site.

use std::collections::{BTreeMap, HashMap, HashSet};

use pwatch_core::{ChangeKind, DetectedChange, DetectionThresholds, Product};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};

use crate::normalize::simple_fold_name;

/// Slack for threshold comparisons so exact boundary moves survive float error.
const EPSILON: f64 = 1e-9;

/// Bookkeeping for one comparison; every product lands in exactly one bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DetectionReport {
    /// Current products matched to a previous one, by name or secondary key.
    pub matched: usize,
    /// Current products with no previous match.
    pub added: usize,
    /// Previous products matched by name from the current side.
    pub consumed: usize,
    /// Previous products not consumed whose secondary key still exists in current.
    pub retained_by_key: usize,
    /// Previous products with no counterpart in current.
    pub removed: usize,
    /// New or removed products that produced no event because of an invalid price.
    pub suppressed: usize,
}

/// Insertion-ordered index: a later duplicate replaces the value but keeps
/// the first key position.
struct Indexed<'a> {
    order: Vec<String>,
    by_key: HashMap<String, &'a Product>,
}

impl<'a> Indexed<'a> {
    fn build(products: &'a [Product], key: impl Fn(&Product) -> Option<String>) -> Self {
        let mut order = Vec::with_capacity(products.len());
        let mut by_key = HashMap::with_capacity(products.len());
        for product in products {
            let Some(k) = key(product) else {
                continue;
            };
            if by_key.insert(k.clone(), product).is_none() {
                order.push(k);
            }
        }
        Self { order, by_key }
    }

    fn get(&self, key: &str) -> Option<&'a Product> {
        self.by_key.get(key).copied()
    }

    fn contains(&self, key: &str) -> bool {
        self.by_key.contains_key(key)
    }

    fn iter(&self) -> impl Iterator<Item = (&str, &'a Product)> + '_ {
        self.order
            .iter()
            .filter_map(|k| self.by_key.get(k).map(|p| (k.as_str(), *p)))
    }
}

/// Folded name, or the raw name when folding leaves nothing, so every
/// product stays indexed.
fn name_key(product: &Product) -> Option<String> {
    let key = simple_fold_name(&product.name);
    if key.is_empty() {
        Some(product.name.clone())
    } else {
        Some(key)
    }
}

/// Cheap `brand|model` key from raw fields only: lowercased and trimmed, no
/// fallback parsing and no alias table.
pub fn secondary_key(product: &Product) -> Option<String> {
    let brand = product.brand.as_deref()?.trim().to_lowercase();
    let model = product.model.as_deref()?.trim().to_lowercase();
    if brand.is_empty() || model.is_empty() {
        return None;
    }
    Some(format!("{brand}|{model}"))
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn format_price(price: f64) -> String {
    format!("{price:.2}")
}

fn valid_price(price: Option<f64>, thresholds: &DetectionThresholds) -> Option<f64> {
    price.filter(|p| *p + EPSILON >= thresholds.min_valid_price)
}

fn presence_details(product: &Product) -> BTreeMap<String, JsonValue> {
    let mut details = BTreeMap::new();
    if let Some(price) = product.price {
        details.insert("price".to_string(), json!(price));
    }
    if let Some(availability) = &product.availability {
        details.insert("availability".to_string(), json!(availability));
    }
    if let Some(url) = &product.source_url {
        details.insert("url".to_string(), json!(url));
    }
    details
}

fn price_change(
    previous: &Product,
    current: &Product,
    thresholds: &DetectionThresholds,
) -> Option<DetectedChange> {
    let old = valid_price(previous.price, thresholds)?;
    let new = valid_price(current.price, thresholds)?;
    if old == new {
        return None;
    }
    let diff = new - old;
    let pct = diff / old * 100.0;
    if pct.abs() + EPSILON < thresholds.min_price_change_pct
        || diff.abs() + EPSILON < thresholds.min_price_change_abs
    {
        return None;
    }

    let kind = if pct > 0.0 {
        ChangeKind::PriceIncrease
    } else {
        ChangeKind::PriceDecrease
    };
    let details = BTreeMap::from([
        ("previous_price".to_string(), json!(old)),
        ("current_price".to_string(), json!(new)),
        ("difference".to_string(), json!(round2(diff))),
        ("percentage".to_string(), json!(round2(pct))),
    ]);
    Some(DetectedChange {
        kind,
        product_name: current.name.clone(),
        old_value: Some(format_price(old)),
        new_value: Some(format_price(new)),
        percentage_change: Some(round2(pct)),
        details,
    })
}

fn stock_change(previous: &Product, current: &Product) -> Option<DetectedChange> {
    let old = previous.availability.as_deref()?.trim();
    let new = current.availability.as_deref()?.trim();
    if old.to_lowercase() == new.to_lowercase() {
        return None;
    }
    let details = BTreeMap::from([
        ("previous_availability".to_string(), json!(old)),
        ("current_availability".to_string(), json!(new)),
    ]);
    Some(DetectedChange {
        kind: ChangeKind::StockChange,
        product_name: current.name.clone(),
        old_value: Some(old.to_string()),
        new_value: Some(new.to_string()),
        percentage_change: None,
        details,
    })
}

/// Compare two product lists already filtered to one site.
///
/// Output order is stable: current products in first-seen order, then
/// leftover previous products in first-seen order.
pub fn detect_changes(
    previous: &[Product],
    current: &[Product],
    thresholds: &DetectionThresholds,
) -> Vec<DetectedChange> {
    detect_changes_with_report(previous, current, thresholds).0
}

pub fn detect_changes_with_report(
    previous: &[Product],
    current: &[Product],
    thresholds: &DetectionThresholds,
) -> (Vec<DetectedChange>, DetectionReport) {
    let prev_by_name = Indexed::build(previous, name_key);
    let curr_by_name = Indexed::build(current, name_key);
    let prev_by_key = Indexed::build(previous, secondary_key);
    let curr_by_key = Indexed::build(current, secondary_key);

    let mut changes = Vec::new();
    let mut report = DetectionReport::default();
    let mut consumed: HashSet<String> = HashSet::new();

    for (name, current_product) in curr_by_name.iter() {
        let matched = prev_by_name.get(name).or_else(|| {
            secondary_key(current_product).and_then(|key| prev_by_key.get(&key))
        });

        let Some(previous_product) = matched else {
            report.added += 1;
            match valid_price(current_product.price, thresholds) {
                Some(price) => changes.push(DetectedChange {
                    kind: ChangeKind::NewProduct,
                    product_name: current_product.name.clone(),
                    old_value: None,
                    new_value: Some(format_price(price)),
                    percentage_change: None,
                    details: presence_details(current_product),
                }),
                None => report.suppressed += 1,
            }
            continue;
        };

        report.matched += 1;
        if let Some(key) = name_key(previous_product) {
            consumed.insert(key);
        }
        changes.extend(price_change(previous_product, current_product, thresholds));
        changes.extend(stock_change(previous_product, current_product));
    }

    for (name, previous_product) in prev_by_name.iter() {
        if consumed.contains(name) {
            report.consumed += 1;
            continue;
        }
        if secondary_key(previous_product).is_some_and(|key| curr_by_key.contains(&key)) {
            report.retained_by_key += 1;
            continue;
        }
        report.removed += 1;
        match valid_price(previous_product.price, thresholds) {
            Some(price) => changes.push(DetectedChange {
                kind: ChangeKind::RemovedProduct,
                product_name: previous_product.name.clone(),
                old_value: Some(format_price(price)),
                new_value: None,
                percentage_change: None,
                details: presence_details(previous_product),
            }),
            None => report.suppressed += 1,
        }
    }

    (changes, report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product(name: &str, price: f64) -> Product {
        Product::named(name).with_price(price)
    }

    fn kinds(changes: &[DetectedChange]) -> Vec<ChangeKind> {
        changes.iter().map(|c| c.kind).collect()
    }

    #[test]
    fn price_increase_reports_rounded_percentage_and_difference() {
        let prev = vec![product("Yamaha MT-07", 9499.0)];
        let curr = vec![product("Yamaha MT-07", 9699.0)];
        let changes = detect_changes(&prev, &curr, &DetectionThresholds::default());
        assert_eq!(changes.len(), 1);
        let change = &changes[0];
        assert_eq!(change.kind, ChangeKind::PriceIncrease);
        assert_eq!(change.percentage_change, Some(2.11));
        assert_eq!(change.details["difference"], json!(200.0));
        assert_eq!(change.details["percentage"], json!(2.11));
        assert_eq!(change.old_value.as_deref(), Some("9499.00"));
        assert_eq!(change.new_value.as_deref(), Some("9699.00"));
    }

    #[test]
    fn price_decrease_is_typed() {
        let prev = vec![product("Kayak", 1000.0)];
        let curr = vec![product("Kayak", 900.0)];
        let changes = detect_changes(&prev, &curr, &DetectionThresholds::default());
        assert_eq!(kinds(&changes), vec![ChangeKind::PriceDecrease]);
        assert_eq!(changes[0].percentage_change, Some(-10.0));
    }

    #[test]
    fn identical_snapshots_yield_nothing() {
        let snapshot = vec![
            product("A", 10.0).with_availability("In stock"),
            product("B", 20.0),
            Product::named("C").with_brand_model("Honda", "Grom"),
        ];
        let thresholds = DetectionThresholds::default();
        assert!(detect_changes(&snapshot, &snapshot, &thresholds).is_empty());
    }

    #[test]
    fn detection_is_idempotent_and_order_stable() {
        let prev = vec![product("A", 100.0), product("B", 50.0), product("Gone", 30.0)];
        let curr = vec![product("New", 12.0), product("B", 60.0), product("A", 100.0)];
        let thresholds = DetectionThresholds::default();
        let first = detect_changes(&prev, &curr, &thresholds);
        let second = detect_changes(&prev, &curr, &thresholds);
        assert_eq!(first, second);
        assert_eq!(
            kinds(&first),
            vec![ChangeKind::NewProduct, ChangeKind::PriceIncrease, ChangeKind::RemovedProduct]
        );
    }

    #[test]
    fn threshold_boundaries_are_inclusive() {
        let thresholds = DetectionThresholds::default();

        // exactly 1.00% and exactly $2.00
        let included = detect_changes(&[product("P", 200.0)], &[product("P", 202.0)], &thresholds);
        assert_eq!(kinds(&included), vec![ChangeKind::PriceIncrease]);

        // 0.99% with a large absolute move
        let small_pct = detect_changes(&[product("P", 1000.0)], &[product("P", 1009.9)], &thresholds);
        assert!(small_pct.is_empty());

        // $1.99 with a large percentage move
        let small_abs = detect_changes(&[product("P", 100.0)], &[product("P", 101.99)], &thresholds);
        assert!(small_abs.is_empty());
    }

    #[test]
    fn custom_thresholds_are_honoured() {
        let thresholds = DetectionThresholds {
            min_valid_price: 1.0,
            min_price_change_pct: 5.0,
            min_price_change_abs: 0.5,
        };
        let prev = [product("P", 10.0)];
        assert!(detect_changes(&prev, &[product("P", 10.4)], &thresholds).is_empty());
        assert_eq!(
            kinds(&detect_changes(&prev, &[product("P", 10.6)], &thresholds)),
            vec![ChangeKind::PriceIncrease]
        );
    }

    #[test]
    fn presence_events_need_a_valid_price() {
        let thresholds = DetectionThresholds::default();
        let prev = vec![product("Old artifact", 0.5), product("Old", 15.0)];
        let curr = vec![Product::named("No price"), product("New", 25.0)];
        let (changes, report) = detect_changes_with_report(&prev, &curr, &thresholds);
        assert_eq!(
            kinds(&changes),
            vec![ChangeKind::NewProduct, ChangeKind::RemovedProduct]
        );
        assert_eq!(changes[0].product_name, "New");
        assert_eq!(changes[1].product_name, "Old");
        assert_eq!(report.suppressed, 2);
    }

    #[test]
    fn stock_change_is_case_and_trim_insensitive() {
        let thresholds = DetectionThresholds::default();
        let prev = vec![product("A", 10.0).with_availability("In Stock "), product("B", 10.0).with_availability("In stock")];
        let curr = vec![product("A", 10.0).with_availability("in stock"), product("B", 10.0).with_availability("Sold out")];
        let changes = detect_changes(&prev, &curr, &thresholds);
        assert_eq!(kinds(&changes), vec![ChangeKind::StockChange]);
        assert_eq!(changes[0].product_name, "B");
        assert_eq!(changes[0].old_value.as_deref(), Some("In stock"));
        assert_eq!(changes[0].new_value.as_deref(), Some("Sold out"));
    }

    #[test]
    fn renamed_product_matches_through_secondary_key() {
        let thresholds = DetectionThresholds::default();
        let prev = vec![product("Yamaha MT07 ABS", 9000.0).with_brand_model("Yamaha", "MT-07")];
        let curr = vec![product("2025 Yamaha MT-07", 9500.0).with_brand_model(" yamaha", "mt-07 ")];
        let (changes, report) = detect_changes_with_report(&prev, &curr, &thresholds);
        assert_eq!(kinds(&changes), vec![ChangeKind::PriceIncrease]);
        assert_eq!(report.matched, 1);
        assert_eq!(report.consumed, 1);
        assert_eq!(report.removed, 0);
    }

    #[test]
    fn secondary_key_in_current_retains_previous_product() {
        let thresholds = DetectionThresholds::default();
        // Two previous records share a key; only the last one is matched, the
        // other is kept alive by key presence rather than reported removed.
        let prev = vec![
            product("Grom red", 4000.0).with_brand_model("Honda", "Grom"),
            product("Grom black", 4000.0).with_brand_model("Honda", "Grom"),
        ];
        let curr = vec![product("Grom", 4000.0).with_brand_model("Honda", "Grom")];
        let (changes, report) = detect_changes_with_report(&prev, &curr, &thresholds);
        assert!(changes.is_empty());
        assert_eq!(report.retained_by_key, 1);
    }

    #[test]
    fn every_product_is_accounted_for_once() {
        let thresholds = DetectionThresholds::default();
        let prev = vec![product("A", 10.0), product("B", 20.0), product("C", 30.0)];
        let curr = vec![product("B", 25.0), product("C", 30.0), product("D", 40.0), product("E", 50.0)];
        let (changes, report) = detect_changes_with_report(&prev, &curr, &thresholds);
        assert_eq!(report.matched + report.added, curr.len());
        assert_eq!(report.consumed + report.retained_by_key + report.removed, prev.len());
        let new_count = changes.iter().filter(|c| c.kind == ChangeKind::NewProduct).count();
        let removed_count = changes.iter().filter(|c| c.kind == ChangeKind::RemovedProduct).count();
        assert_eq!(new_count, report.added);
        assert_eq!(removed_count, report.removed);
    }

    #[test]
    fn product_whose_name_folds_to_nothing_is_still_counted() {
        let invisible = product("\u{200B}", 500.0);
        let (changes, report) =
            detect_changes_with_report(&[], &[invisible.clone()], &DetectionThresholds::default());
        assert_eq!(report.added, 1);
        assert_eq!(kinds(&changes), vec![ChangeKind::NewProduct]);

        let (changes, report) =
            detect_changes_with_report(&[invisible], &[], &DetectionThresholds::default());
        assert_eq!(report.removed, 1);
        assert_eq!(kinds(&changes), vec![ChangeKind::RemovedProduct]);
    }

    #[test]
    fn unchanged_product_yields_no_event() {
        let thresholds = DetectionThresholds::default();
        let prev = vec![product("Same", 500.0).with_availability("In stock")];
        let curr = vec![product("Same", 500.0).with_availability("In stock")];
        assert!(detect_changes(&prev, &curr, &thresholds).is_empty());
    }

    /// Name matching in the time-diffing path uses the light fold, which does
    /// not split letter/digit runs. "Ninja500" and "Ninja 500" are therefore
    /// different products here, while the deep fold would merge them.
    #[test]
    fn light_name_fold_does_not_merge_letter_digit_variants() {
        let thresholds = DetectionThresholds::default();
        let prev = vec![product("Ninja500", 8000.0).with_availability("en stock")];
        let curr = vec![product("Ninja 500", 8000.0).with_availability("épuisé")];
        let changes = detect_changes(&prev, &curr, &thresholds);
        assert_eq!(
            kinds(&changes),
            vec![ChangeKind::NewProduct, ChangeKind::RemovedProduct]
        );
        assert_eq!(
            crate::normalize::fold_text("Ninja500"),
            crate::normalize::fold_text("Ninja 500")
        );
    }
}
