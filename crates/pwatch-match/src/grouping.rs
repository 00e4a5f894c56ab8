//! Merge one product across the reference site and its competitors into
//! comparison rows for market-positioning views.

use std::collections::{BTreeMap, HashMap};

use pwatch_core::Product;
use serde::Serialize;
use tracing::debug;

use crate::identity::{IdentityOptions, IdentityResolver};
use crate::site::{product_matches_site, site_host};

const UNKNOWN_SITE: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompetitorPrice {
    pub product_name: String,
    pub price: Option<f64>,
    /// `price - reference_price`; negative means the competitor is cheaper.
    pub delta: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketPosition {
    Cheapest,
    Priciest,
    Middle,
    Unmatched,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonRow {
    pub base_key: String,
    pub display_name: String,
    pub category: Option<String>,
    pub reference_price: Option<f64>,
    /// Keyed by competitor hostname.
    pub competitors: BTreeMap<String, CompetitorPrice>,
}

impl ComparisonRow {
    fn new(base_key: String, product: &Product, reference_price: Option<f64>) -> Self {
        Self {
            base_key,
            display_name: product.name.clone(),
            category: product.category.clone(),
            reference_price,
            competitors: BTreeMap::new(),
        }
    }

    fn refresh_deltas(&mut self) {
        let reference = self.reference_price;
        for entry in self.competitors.values_mut() {
            entry.delta = match (entry.price, reference) {
                (Some(price), Some(reference)) => Some(((price - reference) * 100.0).round() / 100.0),
                _ => None,
            };
        }
    }

    pub fn cheapest_competitor(&self) -> Option<(&str, f64)> {
        self.competitors
            .iter()
            .filter_map(|(host, entry)| entry.price.map(|p| (host.as_str(), p)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
    }

    /// Where the reference price sits among competitor prices.
    pub fn position(&self) -> MarketPosition {
        let Some(reference) = self.reference_price else {
            return MarketPosition::Unmatched;
        };
        let prices: Vec<f64> = self.competitors.values().filter_map(|c| c.price).collect();
        if prices.is_empty() {
            return MarketPosition::Unmatched;
        }
        let min = prices.iter().copied().fold(f64::INFINITY, f64::min);
        let max = prices.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if reference <= min {
            MarketPosition::Cheapest
        } else if reference >= max {
            MarketPosition::Priciest
        } else {
            MarketPosition::Middle
        }
    }
}

/// Group a snapshot holding reference and competitor records into rows.
///
/// Competitor records carrying a `reference_price` are merged by identity key,
/// one price per competitor host. With `ignore_colors` the first record per
/// host wins (color variants collapse into one key); otherwise later records
/// overwrite. Reference-site records only get a row of their own when no
/// matched row already claims their key.
pub fn group_cross_site(
    products: &[Product],
    reference_site: &str,
    resolver: &IdentityResolver,
    options: IdentityOptions,
) -> Vec<ComparisonRow> {
    let (matched, unmatched): (Vec<&Product>, Vec<&Product>) =
        products.iter().partition(|p| p.reference_price.is_some());

    let mut rows: Vec<ComparisonRow> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for product in matched {
        let key = resolver.build_identity_key(product, options);
        let host = product
            .origin()
            .and_then(site_host)
            .unwrap_or_else(|| UNKNOWN_SITE.to_string());
        let slot = *index.entry(key.clone()).or_insert_with(|| {
            rows.push(ComparisonRow::new(key, product, product.reference_price));
            rows.len() - 1
        });
        let row = &mut rows[slot];
        let entry = CompetitorPrice {
            product_name: product.name.clone(),
            price: product.price,
            delta: None,
        };
        if options.ignore_colors {
            row.competitors.entry(host).or_insert(entry);
        } else {
            row.competitors.insert(host, entry);
            row.reference_price = product.reference_price;
        }
    }

    let mut skipped = 0usize;
    for product in unmatched {
        if !product_matches_site(product, reference_site) {
            skipped += 1;
            continue;
        }
        let key = resolver.build_identity_key(product, options);
        if index.contains_key(&key) {
            continue;
        }
        index.insert(key.clone(), rows.len());
        rows.push(ComparisonRow::new(key, product, product.price));
    }
    if skipped > 0 {
        debug!(skipped, reference_site, "competitor records without a reference match left out of grouping");
    }

    for row in &mut rows {
        row.refresh_deltas();
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IdentityDictionaries;

    fn resolver() -> IdentityResolver {
        IdentityResolver::new(&IdentityDictionaries::default()).expect("resolver")
    }

    fn competitor(name: &str, url: &str, price: f64, reference: f64) -> Product {
        Product::named(name)
            .with_source_url(url)
            .with_price(price)
            .with_reference_price(reference)
    }

    fn reference(name: &str, price: f64) -> Product {
        Product::named(name)
            .with_source_url("https://www.mydealer.ca/p")
            .with_price(price)
    }

    #[test]
    fn same_product_merges_across_competitors() {
        let products = vec![
            competitor("Yamaha MT-07", "https://rival-a.com/mt07", 9300.0, 9499.0),
            competitor("YAMAHA MT07", "https://www.rival-b.com/x", 9600.0, 9499.0),
        ];
        let rows = group_cross_site(&products, "mydealer.ca", &resolver(), IdentityOptions::default());
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.base_key, "yamaha|mt 07");
        assert_eq!(row.reference_price, Some(9499.0));
        assert_eq!(row.competitors["rival-a.com"].delta, Some(-199.0));
        assert_eq!(row.competitors["rival-b.com"].delta, Some(101.0));
        assert_eq!(row.position(), MarketPosition::Middle);
        assert_eq!(row.cheapest_competitor(), Some(("rival-a.com", 9300.0)));
    }

    #[test]
    fn reference_only_rows_do_not_duplicate_matched_rows() {
        let products = vec![
            competitor("Honda Grom", "https://rival-a.com/grom", 4100.0, 4200.0),
            reference("Honda Grom 2025", 4200.0),
            reference("Honda Navi", 2500.0),
            reference("Honda Navi", 2500.0),
        ];
        let rows = group_cross_site(&products, "mydealer.ca", &resolver(), IdentityOptions::default());
        let keys: Vec<&str> = rows.iter().map(|r| r.base_key.as_str()).collect();
        assert_eq!(keys, vec!["honda|grom", "honda|navi"]);
        assert_eq!(rows[1].reference_price, Some(2500.0));
        assert!(rows[1].competitors.is_empty());
        assert_eq!(rows[1].position(), MarketPosition::Unmatched);
    }

    #[test]
    fn unmatched_competitor_records_are_left_out() {
        let products = vec![Product::named("Honda Grom")
            .with_source_url("https://rival-a.com/grom")
            .with_price(4100.0)];
        let rows = group_cross_site(&products, "mydealer.ca", &resolver(), IdentityOptions::default());
        assert!(rows.is_empty());
    }

    #[test]
    fn color_mode_controls_which_price_per_site_is_kept() {
        let products = vec![
            competitor("Yamaha MT-07 Black", "https://rival-a.com/1", 9300.0, 9499.0),
            competitor("Yamaha MT-07 Blue", "https://rival-a.com/2", 9400.0, 9499.0),
        ];
        let resolver = resolver();

        let merged = group_cross_site(
            &products,
            "mydealer.ca",
            &resolver,
            IdentityOptions { ignore_colors: true },
        );
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].competitors["rival-a.com"].price, Some(9300.0));

        let split = group_cross_site(&products, "mydealer.ca", &resolver, IdentityOptions::default());
        assert_eq!(split.len(), 2);
    }

    #[test]
    fn overwrite_mode_keeps_last_price_for_duplicate_key() {
        let products = vec![
            competitor("Yamaha MT-07", "https://rival-a.com/1", 9300.0, 9499.0),
            competitor("Yamaha MT 07", "https://rival-a.com/2", 9350.0, 9499.0),
        ];
        let rows = group_cross_site(&products, "mydealer.ca", &resolver(), IdentityOptions::default());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].competitors["rival-a.com"].price, Some(9350.0));
        assert_eq!(rows[0].position(), MarketPosition::Priciest);
    }
}
