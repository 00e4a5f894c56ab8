//! Best-effort change notifications.

use async_trait::async_trait;
use pwatch_core::{ChangeEvent, ChangeKind};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeNotice {
    pub site_hostname: String,
    pub events: Vec<ChangeEvent>,
    pub current_count: usize,
    pub previous_count: usize,
}

impl ChangeNotice {
    pub fn count(&self, kind: ChangeKind) -> usize {
        self.events.iter().filter(|e| e.kind == kind).count()
    }

    /// One-line digest, e.g. `dealer.ca: 2 price decreases, 1 new product`.
    pub fn headline(&self) -> String {
        let parts = [
            (ChangeKind::PriceDecrease, "price decrease", "price decreases"),
            (ChangeKind::PriceIncrease, "price increase", "price increases"),
            (ChangeKind::NewProduct, "new product", "new products"),
            (ChangeKind::RemovedProduct, "removed product", "removed products"),
            (ChangeKind::StockChange, "stock change", "stock changes"),
        ]
        .into_iter()
        .filter_map(|(kind, one, many)| match self.count(kind) {
            0 => None,
            1 => Some(format!("1 {one}")),
            n => Some(format!("{n} {many}")),
        })
        .collect::<Vec<_>>();
        if parts.is_empty() {
            format!("{}: no changes", self.site_hostname)
        } else {
            format!("{}: {}", self.site_hostname, parts.join(", "))
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, recipient: &str, notice: &ChangeNotice) -> anyhow::Result<()>;
}

/// Writes notifications to the log instead of delivering them.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, recipient: &str, notice: &ChangeNotice) -> anyhow::Result<()> {
        info!(
            recipient,
            site = %notice.site_hostname,
            events = notice.events.len(),
            previous_count = notice.previous_count,
            current_count = notice.current_count,
            "{}",
            notice.headline()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn event(kind: ChangeKind) -> ChangeEvent {
        ChangeEvent {
            id: Uuid::new_v4(),
            alert_id: Uuid::nil(),
            previous_snapshot_id: Uuid::nil(),
            current_snapshot_id: Uuid::nil(),
            kind,
            product_name: "p".into(),
            old_value: None,
            new_value: None,
            percentage_change: None,
            details: BTreeMap::new(),
            detected_at: Utc::now(),
        }
    }

    #[test]
    fn headline_pluralizes_per_kind() {
        let notice = ChangeNotice {
            site_hostname: "dealer.ca".into(),
            events: vec![
                event(ChangeKind::PriceDecrease),
                event(ChangeKind::PriceDecrease),
                event(ChangeKind::NewProduct),
            ],
            current_count: 10,
            previous_count: 9,
        };
        assert_eq!(notice.headline(), "dealer.ca: 2 price decreases, 1 new product");
    }

    #[tokio::test]
    async fn log_notifier_never_fails() {
        let notice = ChangeNotice {
            site_hostname: "dealer.ca".into(),
            events: vec![],
            current_count: 0,
            previous_count: 0,
        };
        assert!(LogNotifier.send("someone@example.com", &notice).await.is_ok());
        assert_eq!(notice.headline(), "dealer.ca: no changes");
    }
}
