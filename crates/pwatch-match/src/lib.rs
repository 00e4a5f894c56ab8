//! Product identity resolution, snapshot change detection and cross-site grouping.
//!
//! Everything in this crate is pure and synchronous: callers hand in product
//! lists and dictionaries, and get keys, change lists or comparison rows back.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod detect;
pub mod grouping;
pub mod identity;
pub mod normalize;
pub mod site;

pub use detect::{detect_changes, detect_changes_with_report, secondary_key, DetectionReport};
pub use grouping::{group_cross_site, ComparisonRow, CompetitorPrice, MarketPosition};
pub use identity::{IdentityKey, IdentityOptions, IdentityResolver};
pub use normalize::{
    fold, fold_text, simple_fold_name, strip_colors, strip_dealer_noise, strip_label_prefix,
    DealerNoise, FoldMode,
};
pub use site::{filter_to_site, product_matches_site, site_host};

pub const CRATE_NAME: &str = "pwatch-match";

#[derive(Debug, Error)]
pub enum DictionaryError {
    #[error("invalid dealer-noise pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Injectable vocabulary used by the identity resolver.
///
/// Loaded from `rules/identity.yaml` by the sync crate; every list falls back
/// to the built-in defaults when omitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityDictionaries {
    pub brands: Vec<String>,
    /// Spelling variant -> canonical brand. Both sides are deep-folded on load.
    pub brand_aliases: BTreeMap<String, String>,
    pub colors: Vec<String>,
    /// Regexes matched against deep-folded model text; matches are removed.
    pub dealer_noise_patterns: Vec<String>,
    pub dealer_cities: Vec<String>,
    pub label_prefixes: Vec<String>,
}

fn owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for IdentityDictionaries {
    fn default() -> Self {
        Self {
            brands: owned(&[
                "yamaha", "honda", "kawasaki", "suzuki", "ktm", "husqvarna", "ducati", "triumph",
                "bmw", "harley davidson", "indian", "can am", "ski doo", "sea doo", "lynx",
                "polaris", "arctic cat", "cfmoto", "segway", "kymco", "aprilia", "vespa",
                "piaggio", "royal enfield", "benelli", "moto guzzi", "mv agusta", "gas gas",
                "beta", "sherco", "hisun", "linhai", "massimo", "argo", "textron",
            ]),
            brand_aliases: [
                ("cf moto", "cfmoto"),
                ("canam", "can am"),
                ("brp can am", "can am"),
                ("skidoo", "ski doo"),
                ("seadoo", "sea doo"),
                ("harley", "harley davidson"),
                ("gasgas", "gas gas"),
                ("arcticcat", "arctic cat"),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
            colors: owned(&[
                "black", "noir", "noire", "white", "blanc", "blanche", "red", "rouge", "blue",
                "bleu", "bleue", "green", "vert", "verte", "yellow", "jaune", "orange", "grey",
                "gray", "gris", "grise", "silver", "argent", "brown", "brun", "brune", "beige",
                "purple", "violet", "violette", "pink", "rose", "metallic", "metallique",
                "metallise", "matte", "mat", "mate", "gloss", "brillant", "pearl", "perle",
                "carbon", "carbone", "titanium", "titane", "bronze", "camo", "camouflage",
            ]),
            dealer_noise_patterns: owned(&[
                r"\b(?:for sale|available|disponible|en vente|a vendre)\s+(?:at|in|chez|a|au)\b.*$",
                r"\b(?:at|chez)\s+[a-z0-9 ]*?\b(?:motos?|sports?|motorsports?|powersports?|marine|performance|recreatifs?)\b.*$",
                r"\b(?:dealership|dealer|concessionnaire|concession)\b.*$",
            ]),
            dealer_cities: owned(&[
                "montreal", "quebec", "laval", "longueuil", "sherbrooke", "gatineau",
                "trois rivieres", "levis", "saguenay", "drummondville", "granby", "toronto",
                "ottawa",
            ]),
            label_prefixes: owned(&[
                "manufacturer", "brand", "make", "model", "marque", "fabricant", "modèle",
                "modele",
            ]),
        }
    }
}
