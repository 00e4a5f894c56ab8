//! Core domain model for pwatch: scraped products, snapshots, alerts and change events.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "pwatch-core";

/// Namespace for deterministic change-event ids.
const EVENT_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a4e_93d7_4b0a_8e55_0c1d_f4a2_7b39);

/// A scraped product record after boundary validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub name: String,
    pub price: Option<f64>,
    pub availability: Option<String>,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub source_url: Option<String>,
    pub source_site: Option<String>,
    pub category: Option<String>,
    /// Price of the same product on the owner's reference site, set by the
    /// scraper when it matched a competitor record.
    pub reference_price: Option<f64>,
}

impl Product {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            price: None,
            availability: None,
            brand: None,
            model: None,
            source_url: None,
            source_site: None,
            category: None,
            reference_price: None,
        }
    }

    pub fn with_price(mut self, price: f64) -> Self {
        self.price = Some(price);
        self
    }

    pub fn with_availability(mut self, availability: impl Into<String>) -> Self {
        self.availability = Some(availability.into());
        self
    }

    pub fn with_brand_model(mut self, brand: impl Into<String>, model: impl Into<String>) -> Self {
        self.brand = Some(brand.into());
        self.model = Some(model.into());
        self
    }

    pub fn with_source_url(mut self, url: impl Into<String>) -> Self {
        self.source_url = Some(url.into());
        self
    }

    pub fn with_reference_price(mut self, price: f64) -> Self {
        self.reference_price = Some(price);
        self
    }

    /// The best available pointer to where this record was scraped from.
    pub fn origin(&self) -> Option<&str> {
        self.source_url.as_deref().or(self.source_site.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProductValidationError {
    #[error("product record has no name")]
    MissingName,
    #[error("invalid price {0} for product {1:?}")]
    InvalidPrice(f64, String),
}

/// Price as emitted by heterogeneous scrapers: either a number or display text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawPrice {
    Number(f64),
    Text(String),
}

impl RawPrice {
    pub fn amount(&self) -> Option<f64> {
        match self {
            RawPrice::Number(v) => Some(*v),
            RawPrice::Text(text) => parse_price_text(text),
        }
    }
}

/// Free-form record produced by the external scraper.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawProductRecord {
    #[serde(default, alias = "title")]
    pub name: Option<String>,
    #[serde(default)]
    pub price: Option<RawPrice>,
    #[serde(default, alias = "stock")]
    pub availability: Option<String>,
    #[serde(default, alias = "make", alias = "manufacturer")]
    pub brand: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default, alias = "source_url", alias = "url")]
    pub source_url: Option<String>,
    #[serde(default, alias = "source_site")]
    pub source_site: Option<String>,
    #[serde(default, alias = "state")]
    pub category: Option<String>,
    #[serde(default, alias = "reference_price")]
    pub reference_price: Option<RawPrice>,
}

fn text_or_none(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

/// Characters that render as nothing and are dropped when names are keyed.
fn is_invisible_in_name(ch: char) -> bool {
    ch.is_whitespace()
        || matches!(
            ch,
            '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{2060}' | '\u{FEFF}' | '\u{00AD}'
        )
        || ('\u{2018}'..='\u{201F}').contains(&ch)
}

fn checked_name(value: Option<String>) -> Result<String, ProductValidationError> {
    text_or_none(value)
        .filter(|name| !name.chars().all(is_invisible_in_name))
        .ok_or(ProductValidationError::MissingName)
}

fn checked_price(price: Option<&RawPrice>, name: &str) -> Result<Option<f64>, ProductValidationError> {
    match price.and_then(RawPrice::amount) {
        Some(v) if !v.is_finite() || v < 0.0 => {
            Err(ProductValidationError::InvalidPrice(v, name.to_string()))
        }
        other => Ok(other),
    }
}

impl TryFrom<RawProductRecord> for Product {
    type Error = ProductValidationError;

    fn try_from(raw: RawProductRecord) -> Result<Self, Self::Error> {
        let name = checked_name(raw.name)?;
        let price = checked_price(raw.price.as_ref(), &name)?;
        let reference_price = checked_price(raw.reference_price.as_ref(), &name)?;
        Ok(Self {
            price,
            reference_price,
            availability: text_or_none(raw.availability),
            brand: text_or_none(raw.brand),
            model: text_or_none(raw.model),
            source_url: text_or_none(raw.source_url),
            source_site: text_or_none(raw.source_site),
            category: text_or_none(raw.category),
            name,
        })
    }
}

/// Parse a displayed price such as `$9,499.00`, `9 499,99 $` or `1.299,00 €`.
///
/// Only the first numeric run is considered. When both `,` and `.` appear the
/// last one is the decimal separator; a lone `,` followed by one or two digits
/// is decimal, otherwise grouping.
pub fn parse_price_text(text: &str) -> Option<f64> {
    let mut run = String::new();
    let mut started = false;
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            started = true;
            run.push(ch);
        } else if started && (ch == '.' || ch == ',') {
            run.push(ch);
        } else if started && ch.is_whitespace() {
            run.push(' ');
        } else if started {
            break;
        }
    }
    let run = run.trim_end_matches(|c: char| c == '.' || c == ',' || c == ' ');
    let compact: String = run.chars().filter(|c| *c != ' ').collect();
    if compact.is_empty() {
        return None;
    }

    let last_dot = compact.rfind('.');
    let last_comma = compact.rfind(',');
    let normalized = match (last_dot, last_comma) {
        (Some(d), Some(c)) if d > c => compact.replace(',', ""),
        (Some(_), Some(_)) => compact.replace('.', "").replace(',', "."),
        (None, Some(c)) => {
            let decimals = compact.len() - c - 1;
            if compact.matches(',').count() == 1 && (1..=2).contains(&decimals) {
                compact.replace(',', ".")
            } else {
                compact.replace(',', "")
            }
        }
        (Some(_), None) if compact.matches('.').count() > 1 => compact.replace('.', ""),
        _ => compact,
    };
    normalized.parse::<f64>().ok()
}

/// One timestamped capture of all scraped products for an owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: Uuid,
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
    pub products: Vec<Product>,
}

impl Snapshot {
    pub fn new(owner_id: impl Into<String>, created_at: DateTime<Utc>, products: Vec<Product>) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            created_at,
            products,
        }
    }

    /// Validate raw scraper output, keeping the valid records and returning
    /// the rejected ones alongside their reason.
    pub fn from_raw(
        owner_id: impl Into<String>,
        created_at: DateTime<Utc>,
        records: Vec<RawProductRecord>,
    ) -> (Self, Vec<(RawProductRecord, ProductValidationError)>) {
        let mut products = Vec::with_capacity(records.len());
        let mut rejected = Vec::new();
        for record in records {
            match Product::try_from(record.clone()) {
                Ok(product) => products.push(product),
                Err(err) => rejected.push((record, err)),
            }
        }
        (Self::new(owner_id, created_at, products), rejected)
    }
}

/// Noise thresholds applied by the change detector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectionThresholds {
    /// Prices below this are treated as scraped artifacts, not prices.
    pub min_valid_price: f64,
    /// Minimum absolute percentage move for a price event.
    pub min_price_change_pct: f64,
    /// Minimum absolute currency move for a price event.
    pub min_price_change_abs: f64,
}

impl Default for DetectionThresholds {
    fn default() -> Self {
        Self {
            min_valid_price: 1.0,
            min_price_change_pct: 1.0,
            min_price_change_abs: 2.0,
        }
    }
}

/// A user subscription watching one site for changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub owner_id: String,
    /// Watched site, as entered by the user (hostname or URL).
    pub site: String,
    pub is_active: bool,
    pub email_notification: bool,
    #[serde(default)]
    pub notify_email: Option<String>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_change_detected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub thresholds: Option<DetectionThresholds>,
}

impl Alert {
    pub fn new(owner_id: impl Into<String>, site: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            site: site.into(),
            is_active: true,
            email_notification: false,
            notify_email: None,
            last_run_at: None,
            last_change_detected_at: None,
            thresholds: None,
        }
    }

    pub fn apply(&mut self, update: &AlertUpdate) {
        if let Some(ts) = update.last_run_at {
            self.last_run_at = Some(ts);
        }
        if let Some(ts) = update.last_change_detected_at {
            self.last_change_detected_at = Some(ts);
        }
    }
}

/// Timestamp patch written back to an alert after a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertUpdate {
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_change_detected_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    NewProduct,
    RemovedProduct,
    PriceIncrease,
    PriceDecrease,
    StockChange,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::NewProduct => "new_product",
            ChangeKind::RemovedProduct => "removed_product",
            ChangeKind::PriceIncrease => "price_increase",
            ChangeKind::PriceDecrease => "price_decrease",
            ChangeKind::StockChange => "stock_change",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A change found by comparing two product lists, not yet attributed to an alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedChange {
    pub kind: ChangeKind,
    pub product_name: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub percentage_change: Option<f64>,
    pub details: BTreeMap<String, JsonValue>,
}

/// A persisted change event, attributable to one alert and one snapshot pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub id: Uuid,
    pub alert_id: Uuid,
    pub previous_snapshot_id: Uuid,
    pub current_snapshot_id: Uuid,
    pub kind: ChangeKind,
    pub product_name: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub percentage_change: Option<f64>,
    pub details: BTreeMap<String, JsonValue>,
    pub detected_at: DateTime<Utc>,
}

impl ChangeEvent {
    /// Attribute a detected change. `ordinal` is the change's position in the
    /// detector output, so replaying a comparison yields identical ids.
    pub fn attribute(
        change: DetectedChange,
        alert_id: Uuid,
        previous_snapshot_id: Uuid,
        current_snapshot_id: Uuid,
        ordinal: usize,
        detected_at: DateTime<Utc>,
    ) -> Self {
        let seed = format!("{alert_id}:{previous_snapshot_id}:{current_snapshot_id}:{ordinal}");
        Self {
            id: Uuid::new_v5(&EVENT_NAMESPACE, seed.as_bytes()),
            alert_id,
            previous_snapshot_id,
            current_snapshot_id,
            kind: change.kind,
            product_name: change.product_name,
            old_value: change.old_value,
            new_value: change.new_value,
            percentage_change: change.percentage_change,
            details: change.details,
            detected_at,
        }
    }
}

/// What the scrape trigger is invoked with for one owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeProfile {
    pub owner_id: String,
    pub reference_url: String,
    #[serde(default)]
    pub competitor_urls: Vec<String>,
    #[serde(default)]
    pub categories: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn price_text_variants_parse() {
        assert_eq!(parse_price_text("$9,499.00"), Some(9499.0));
        assert_eq!(parse_price_text("9 499,99 $"), Some(9499.99));
        assert_eq!(parse_price_text("1.299,00 €"), Some(1299.0));
        assert_eq!(parse_price_text("Prix: 12 999 $"), Some(12999.0));
        assert_eq!(parse_price_text("1.234.567"), Some(1234567.0));
        assert_eq!(parse_price_text("call for price"), None);
    }

    #[test]
    fn raw_record_with_aliases_validates() {
        let raw: RawProductRecord = serde_json::from_str(
            r#"{"title":" Yamaha MT-07 ","price":"$9,499","stock":"In stock","make":"Yamaha","url":"https://www.dealer.ca/mt07","state":"new"}"#,
        )
        .expect("raw");
        let product = Product::try_from(raw).expect("valid");
        assert_eq!(product.name, "Yamaha MT-07");
        assert_eq!(product.price, Some(9499.0));
        assert_eq!(product.availability.as_deref(), Some("In stock"));
        assert_eq!(product.brand.as_deref(), Some("Yamaha"));
        assert_eq!(product.category.as_deref(), Some("new"));
        assert_eq!(product.origin(), Some("https://www.dealer.ca/mt07"));
    }

    #[test]
    fn name_of_only_invisible_characters_is_missing() {
        let raw: RawProductRecord =
            serde_json::from_str(r#"{"name":"\u200B \u201C\u201D","price":500}"#).expect("raw");
        assert_eq!(Product::try_from(raw), Err(ProductValidationError::MissingName));

        let quoted = RawProductRecord {
            name: Some("\u{200B}\u{201C}MT-07\u{201D}".into()),
            ..Default::default()
        };
        assert!(Product::try_from(quoted).is_ok());
    }

    #[test]
    fn blank_name_and_negative_price_are_rejected() {
        let blank = RawProductRecord {
            name: Some("   ".into()),
            ..Default::default()
        };
        assert_eq!(Product::try_from(blank), Err(ProductValidationError::MissingName));

        let negative = RawProductRecord {
            name: Some("Thing".into()),
            price: Some(RawPrice::Number(-5.0)),
            ..Default::default()
        };
        assert!(matches!(
            Product::try_from(negative),
            Err(ProductValidationError::InvalidPrice(_, _))
        ));
    }

    #[test]
    fn snapshot_from_raw_splits_rejected_records() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).single().unwrap();
        let records = vec![
            RawProductRecord {
                name: Some("Good".into()),
                price: Some(RawPrice::Number(10.0)),
                ..Default::default()
            },
            RawProductRecord::default(),
        ];
        let (snapshot, rejected) = Snapshot::from_raw("owner-1", at, records);
        assert_eq!(snapshot.products.len(), 1);
        assert_eq!(rejected.len(), 1);
        assert_eq!(snapshot.created_at, at);
    }

    #[test]
    fn attributed_event_ids_are_deterministic() {
        let change = DetectedChange {
            kind: ChangeKind::NewProduct,
            product_name: "x".into(),
            old_value: None,
            new_value: Some("10.00".into()),
            percentage_change: None,
            details: BTreeMap::new(),
        };
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).single().unwrap();
        let (a, p, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let first = ChangeEvent::attribute(change.clone(), a, p, c, 0, at);
        let second = ChangeEvent::attribute(change.clone(), a, p, c, 0, at);
        let other = ChangeEvent::attribute(change, a, p, c, 1, at);
        assert_eq!(first.id, second.id);
        assert_ne!(first.id, other.id);
    }

    #[test]
    fn change_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ChangeKind::PriceDecrease).expect("json");
        assert_eq!(json, "\"price_decrease\"");
        assert_eq!(ChangeKind::StockChange.to_string(), "stock_change");
    }
}
