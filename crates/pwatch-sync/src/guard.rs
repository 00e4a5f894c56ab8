//! Per-alert sanity checks around the change detector.

use chrono::{DateTime, Utc};
use pwatch_core::{Alert, AlertUpdate, DetectedChange, DetectionThresholds, Snapshot};
use pwatch_match::{detect_changes_with_report, filter_to_site, DetectionReport};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GuardConfig {
    /// Retention ratio (current / previous) under which a run is suspicious.
    pub partial_drop_ratio: f64,
    /// The ratio check only applies when the previous set is larger than this.
    pub partial_drop_min_previous: usize,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            partial_drop_ratio: 0.2,
            partial_drop_min_previous: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Fewer than two snapshots exist for the owner.
    InsufficientHistory,
    /// The newest snapshot was already compared for this alert.
    AlreadyProcessed,
    /// The previous snapshot holds nothing for the alert's site.
    NoBaseline,
    /// The current snapshot holds nothing for the site while the previous did.
    FailedScrape,
}

impl SkipReason {
    /// Whether the alert's `last_run_at` moves forward despite the skip.
    pub fn advances_run(self) -> bool {
        !matches!(self, SkipReason::AlreadyProcessed)
    }
}

/// Ensures an alert processes each new snapshot at most once.
pub struct RunTracker;

impl RunTracker {
    pub fn is_fresh(alert: &Alert, latest: &Snapshot) -> bool {
        alert
            .last_run_at
            .map_or(true, |last_run| latest.created_at > last_run)
    }

    /// The `last_run_at` to record for a run that saw `snapshots` (newest
    /// first). Never earlier than the newest snapshot, so a snapshot written
    /// while the run was in progress counts as processed.
    pub fn run_mark(now: DateTime<Utc>, snapshots: &[Snapshot]) -> DateTime<Utc> {
        snapshots
            .first()
            .map_or(now, |latest| latest.created_at.max(now))
    }

    pub fn advance(now: DateTime<Utc>, changed: bool) -> AlertUpdate {
        AlertUpdate {
            last_run_at: Some(now),
            last_change_detected_at: changed.then_some(now),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub previous_snapshot_id: Uuid,
    pub current_snapshot_id: Uuid,
    pub previous_count: usize,
    pub current_count: usize,
    pub suspicious_drop: bool,
    pub changes: Vec<DetectedChange>,
    pub report: DetectionReport,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GuardDecision {
    Skip {
        reason: SkipReason,
        previous_count: usize,
        current_count: usize,
    },
    Compare(Comparison),
}

fn skip(reason: SkipReason, previous_count: usize, current_count: usize) -> GuardDecision {
    GuardDecision::Skip {
        reason,
        previous_count,
        current_count,
    }
}

pub fn is_partial_drop(previous_count: usize, current_count: usize, config: &GuardConfig) -> bool {
    previous_count > config.partial_drop_min_previous
        && (current_count as f64 / previous_count as f64) < config.partial_drop_ratio
}

/// Decide whether and how to compare the owner's two newest snapshots
/// (`snapshots` is newest first) for one alert.
pub fn evaluate_alert(
    alert: &Alert,
    snapshots: &[Snapshot],
    thresholds: &DetectionThresholds,
    config: &GuardConfig,
) -> GuardDecision {
    let (latest, previous) = match snapshots {
        [latest, previous, ..] => (latest, previous),
        _ => {
            info!(alert_id = %alert.id, snapshots = snapshots.len(), "not enough history to compare");
            return skip(SkipReason::InsufficientHistory, 0, 0);
        }
    };

    if !RunTracker::is_fresh(alert, latest) {
        info!(alert_id = %alert.id, snapshot_id = %latest.id, "latest snapshot already processed");
        return skip(SkipReason::AlreadyProcessed, 0, 0);
    }

    let previous_products = filter_to_site(&previous.products, &alert.site);
    let current_products = filter_to_site(&latest.products, &alert.site);
    let (previous_count, current_count) = (previous_products.len(), current_products.len());

    if previous_products.is_empty() {
        info!(alert_id = %alert.id, site = %alert.site, "no baseline for site yet");
        return skip(SkipReason::NoBaseline, previous_count, current_count);
    }

    if current_products.is_empty() {
        warn!(
            alert_id = %alert.id,
            site = %alert.site,
            previous_count,
            "current snapshot has no products for site; treating as failed scrape"
        );
        return skip(SkipReason::FailedScrape, previous_count, current_count);
    }

    let suspicious_drop = is_partial_drop(previous_count, current_count, config);
    if suspicious_drop {
        warn!(
            alert_id = %alert.id,
            site = %alert.site,
            previous_count,
            current_count,
            "product count dropped sharply; data may be a partial scrape"
        );
    }

    let (changes, report) = detect_changes_with_report(&previous_products, &current_products, thresholds);
    GuardDecision::Compare(Comparison {
        previous_snapshot_id: previous.id,
        current_snapshot_id: latest.id,
        previous_count,
        current_count,
        suspicious_drop,
        changes,
        report,
    })
}
