//! Stable `brand|model` identity keys for scraped products.

use std::collections::{HashMap, HashSet};
use std::fmt;

use pwatch_core::Product;
use serde::{Deserialize, Serialize};

use crate::normalize::{
    collapse_whitespace, fold_text, strip_colors, strip_dealer_noise, strip_label_prefix,
    DealerNoise,
};
use crate::{DictionaryError, IdentityDictionaries};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityOptions {
    /// Drop color words from brand and model so color variants share a key.
    pub ignore_colors: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityKey {
    pub brand: String,
    pub model: String,
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.brand, self.model)
    }
}

#[derive(Debug, Clone)]
pub struct IdentityResolver {
    /// Deep-folded, longest first.
    brands: Vec<String>,
    /// Brands plus alias spellings, longest first; what names are scanned for.
    brand_terms: Vec<String>,
    aliases: HashMap<String, String>,
    colors: HashSet<String>,
    dealer_noise: DealerNoise,
    label_prefixes: Vec<String>,
}

fn is_model_year(token: &str) -> bool {
    token.len() == 4
        && token
            .parse::<u16>()
            .map(|year| (2010..=2029).contains(&year))
            .unwrap_or(false)
}

fn without_years(folded: &str) -> String {
    folded
        .split(' ')
        .filter(|t| !t.is_empty() && !is_model_year(t))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Byte offset of `brand` in `name` as a prefix or whole-word run.
fn find_brand(name: &str, brand: &str) -> Option<usize> {
    if brand.is_empty() {
        return None;
    }
    if name.starts_with(brand) {
        return Some(0);
    }
    let padded = format!(" {name} ");
    padded.find(&format!(" {brand} "))
}

fn remove_span(name: &str, start: usize, len: usize) -> String {
    collapse_whitespace(&format!("{} {}", &name[..start], &name[start + len..]))
}

impl IdentityResolver {
    pub fn new(dictionaries: &IdentityDictionaries) -> Result<Self, DictionaryError> {
        let mut brands: Vec<String> = dictionaries
            .brands
            .iter()
            .map(|b| fold_text(b))
            .filter(|b| !b.is_empty())
            .collect();
        brands.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        brands.dedup();

        let aliases: HashMap<String, String> = dictionaries
            .brand_aliases
            .iter()
            .map(|(variant, canonical)| (fold_text(variant), fold_text(canonical)))
            .filter(|(variant, _)| !variant.is_empty())
            .collect();

        let mut brand_terms: Vec<String> = brands.iter().chain(aliases.keys()).cloned().collect();
        brand_terms.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        brand_terms.dedup();

        let colors = dictionaries
            .colors
            .iter()
            .map(|c| fold_text(c))
            .filter(|c| !c.is_empty())
            .collect();

        Ok(Self {
            brands,
            brand_terms,
            aliases,
            colors,
            dealer_noise: DealerNoise::new(
                &dictionaries.dealer_noise_patterns,
                &dictionaries.dealer_cities,
            )?,
            label_prefixes: dictionaries.label_prefixes.clone(),
        })
    }

    pub fn brands(&self) -> &[String] {
        &self.brands
    }

    pub fn colors(&self) -> &HashSet<String> {
        &self.colors
    }

    /// First dictionary brand or alias spelling found in an already
    /// deep-folded name, longest first. Aliases come back uncanonicalized.
    pub fn detect_brand(&self, folded_name: &str) -> Option<&str> {
        self.brand_terms
            .iter()
            .find(|brand| find_brand(folded_name, brand).is_some())
            .map(String::as_str)
    }

    pub fn canonical_brand(&self, brand: &str) -> String {
        self.aliases
            .get(brand)
            .cloned()
            .unwrap_or_else(|| brand.to_string())
    }

    pub fn resolve(&self, product: &Product, options: IdentityOptions) -> IdentityKey {
        let mut brand = product
            .brand
            .as_deref()
            .map(|b| fold_text(&strip_label_prefix(b, &self.label_prefixes)))
            .unwrap_or_default();
        let mut model = product
            .model
            .as_deref()
            .map(|m| fold_text(&strip_label_prefix(m, &self.label_prefixes)))
            .unwrap_or_default();

        if brand.is_empty() || model.is_empty() {
            let name = fold_text(&product.name);
            if let Some(found) = self.detect_brand(&name) {
                let start = find_brand(&name, found).unwrap_or(0);
                model = without_years(&remove_span(&name, start, found.len()));
                brand = found.to_string();
            } else if let Some(start) = find_brand(&name, &brand) {
                // Structured brand the dictionary does not know; keep it.
                model = without_years(&remove_span(&name, start, brand.len()));
            } else {
                model = without_years(&name);
            }
        }

        let mut brand = self.canonical_brand(&brand);
        let mut model = strip_dealer_noise(&model, &self.dealer_noise);

        if options.ignore_colors {
            brand = strip_colors(&brand, &self.colors);
            model = strip_colors(&model, &self.colors);
        }

        IdentityKey { brand, model }
    }

    /// `"brand|model"` grouping key.
    pub fn build_identity_key(&self, product: &Product, options: IdentityOptions) -> String {
        self.resolve(product, options).to_string()
    }
}
