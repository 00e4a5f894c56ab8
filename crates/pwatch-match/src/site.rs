//! Hostname comparison between alerts and scraped records.

use pwatch_core::Product;
use url::Url;

/// Lowercased hostname without scheme or `www.`; `None` when `input` is not a URL or host.
pub fn site_host(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    let url = Url::parse(&candidate).ok()?;
    let host = url.host_str()?.to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host).to_string();
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

/// Whether a record was scraped from `site`. Records whose origin cannot be
/// parsed fall back to substring containment of the raw site string.
pub fn product_matches_site(product: &Product, site: &str) -> bool {
    let Some(origin) = product.origin() else {
        return false;
    };
    match (site_host(origin), site_host(site)) {
        (Some(origin_host), Some(target)) => origin_host == target,
        _ => {
            let raw_site = site.trim().to_lowercase();
            !raw_site.is_empty() && origin.to_lowercase().contains(&raw_site)
        }
    }
}

pub fn filter_to_site(products: &[Product], site: &str) -> Vec<Product> {
    products
        .iter()
        .filter(|p| product_matches_site(p, site))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_is_scheme_and_www_insensitive() {
        assert_eq!(site_host("https://www.Dealer.ca/inventory?p=2").as_deref(), Some("dealer.ca"));
        assert_eq!(site_host("dealer.ca").as_deref(), Some("dealer.ca"));
        assert_eq!(site_host("WWW.dealer.ca").as_deref(), Some("dealer.ca"));
        assert_eq!(site_host("  "), None);
        assert_eq!(site_host("not a host"), None);
    }

    #[test]
    fn products_are_filtered_by_host() {
        let products = vec![
            Product::named("a").with_source_url("https://www.dealer.ca/a"),
            Product::named("b").with_source_url("http://other.com/b"),
            Product::named("c"),
        ];
        let kept = filter_to_site(&products, "dealer.ca");
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].name, "a");
    }

    #[test]
    fn unparsable_origin_falls_back_to_substring() {
        let product = Product::named("a").with_source_url("listing from dealer.ca page 2");
        assert!(product_matches_site(&product, "dealer.ca"));
        assert!(!product_matches_site(&product, "other.com"));
    }
}
