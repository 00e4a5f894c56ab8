//! Monitoring pass: alerts grouped by owner, owners in parallel up to a
//! bound, alerts of one owner strictly in sequence.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use pwatch_core::{Alert, ChangeEvent, DetectionThresholds, Snapshot};
use pwatch_match::site_host;
use pwatch_storage::{AlertFilter, AlertStore, EventStore, ProfileStore, SnapshotStore};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::guard::{evaluate_alert, GuardConfig, GuardDecision, RunTracker, SkipReason};
use crate::notify::{ChangeNotice, LogNotifier, Notifier};
use crate::trigger::{NoopScrapeTrigger, ScrapeRequest, ScrapeTrigger};

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    /// Used for alerts without their own thresholds.
    pub thresholds: DetectionThresholds,
    pub guard: GuardConfig,
    pub scrape_timeout: Duration,
    pub owner_concurrency: usize,
    pub trigger_scrape: bool,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            thresholds: DetectionThresholds::default(),
            guard: GuardConfig::default(),
            scrape_timeout: Duration::from_secs(15 * 60),
            owner_concurrency: 4,
            trigger_scrape: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AlertOutcome {
    Changed { events: usize },
    Unchanged,
    Skipped { reason: SkipReason },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlertReport {
    pub alert_id: Uuid,
    pub owner_id: String,
    pub site: String,
    pub outcome: AlertOutcome,
    pub suspicious_drop: bool,
    pub previous_count: usize,
    pub current_count: usize,
}

impl AlertReport {
    fn new(alert: &Alert, outcome: AlertOutcome) -> Self {
        Self {
            alert_id: alert.id,
            owner_id: alert.owner_id.clone(),
            site: alert.site.clone(),
            outcome,
            suspicious_drop: false,
            previous_count: 0,
            current_count: 0,
        }
    }

    fn failed(alert: &Alert, error: impl Into<String>) -> Self {
        Self::new(alert, AlertOutcome::Failed { error: error.into() })
    }

    fn with_counts(mut self, previous_count: usize, current_count: usize) -> Self {
        self.previous_count = previous_count;
        self.current_count = current_count;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Alerts whose run advanced: compared, or skipped for lack of data.
    pub checked: usize,
    pub changed: usize,
    /// Alerts skipped because the newest snapshot was already processed.
    pub skipped: usize,
    pub failed: usize,
    pub events: usize,
    pub outcomes: Vec<AlertReport>,
}

impl RunSummary {
    fn from_reports(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        mut outcomes: Vec<AlertReport>,
    ) -> Self {
        outcomes.sort_by(|a, b| a.owner_id.cmp(&b.owner_id).then(a.site.cmp(&b.site)));
        let mut summary = Self {
            run_id,
            started_at,
            finished_at,
            checked: 0,
            changed: 0,
            skipped: 0,
            failed: 0,
            events: 0,
            outcomes: Vec::new(),
        };
        for report in &outcomes {
            match &report.outcome {
                AlertOutcome::Changed { events } => {
                    summary.checked += 1;
                    summary.changed += 1;
                    summary.events += events;
                }
                AlertOutcome::Unchanged => summary.checked += 1,
                AlertOutcome::Skipped { reason } if reason.advances_run() => summary.checked += 1,
                AlertOutcome::Skipped { .. } => summary.skipped += 1,
                AlertOutcome::Failed { .. } => summary.failed += 1,
            }
        }
        summary.outcomes = outcomes;
        summary
    }
}

#[derive(Clone)]
pub struct AlertMonitor {
    alerts: Arc<dyn AlertStore>,
    snapshots: Arc<dyn SnapshotStore>,
    events: Arc<dyn EventStore>,
    profiles: Arc<dyn ProfileStore>,
    trigger: Arc<dyn ScrapeTrigger>,
    notifier: Arc<dyn Notifier>,
    settings: MonitorSettings,
}

impl AlertMonitor {
    pub fn new<S>(store: Arc<S>, settings: MonitorSettings) -> Self
    where
        S: AlertStore + SnapshotStore + EventStore + ProfileStore + 'static,
    {
        Self {
            alerts: store.clone(),
            snapshots: store.clone(),
            events: store.clone(),
            profiles: store,
            trigger: Arc::new(NoopScrapeTrigger),
            notifier: Arc::new(LogNotifier),
            settings,
        }
    }

    pub fn with_trigger(mut self, trigger: Arc<dyn ScrapeTrigger>) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    /// One pass over every active alert. Only failing to list alerts aborts the
    /// pass; everything else is recorded per alert.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let alerts = self
            .alerts
            .list_active_alerts(&AlertFilter::all())
            .await
            .context("listing active alerts")?;

        let mut by_owner: BTreeMap<String, Vec<Alert>> = BTreeMap::new();
        for alert in alerts {
            by_owner.entry(alert.owner_id.clone()).or_default().push(alert);
        }
        info!(%run_id, owners = by_owner.len(), "monitoring run started");

        let permits = Arc::new(Semaphore::new(self.settings.owner_concurrency.max(1)));
        let mut tasks = JoinSet::new();
        let mut pending: Vec<Alert> = Vec::new();
        for (owner_id, owner_alerts) in by_owner {
            pending.extend(owner_alerts.iter().cloned());
            let monitor = self.clone();
            let permits = permits.clone();
            let span = info_span!("owner", owner_id = %owner_id, alerts = owner_alerts.len());
            tasks.spawn(
                async move {
                    let Ok(_permit) = permits.acquire_owned().await else {
                        return owner_alerts
                            .iter()
                            .map(|a| AlertReport::failed(a, "owner scheduling closed"))
                            .collect();
                    };
                    monitor.process_owner(&owner_id, owner_alerts, now).await
                }
                .instrument(span),
            );
        }

        let mut reports: Vec<AlertReport> = Vec::with_capacity(pending.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(owner_reports) => reports.extend(owner_reports),
                Err(err) => error!(error = %err, "owner task aborted"),
            }
        }
        // Alerts of an aborted owner task still need an outcome.
        let reported: HashSet<Uuid> = reports.iter().map(|r| r.alert_id).collect();
        for alert in pending.iter().filter(|a| !reported.contains(&a.id)) {
            reports.push(AlertReport::failed(alert, "owner task aborted"));
        }

        let summary = RunSummary::from_reports(run_id, started_at, Utc::now(), reports);
        info!(
            %run_id,
            checked = summary.checked,
            changed = summary.changed,
            skipped = summary.skipped,
            failed = summary.failed,
            events = summary.events,
            "monitoring run finished"
        );
        Ok(summary)
    }

    async fn process_owner(&self, owner_id: &str, alerts: Vec<Alert>, now: DateTime<Utc>) -> Vec<AlertReport> {
        if self.settings.trigger_scrape {
            self.trigger_scrape(owner_id).await;
        }

        let snapshots = match self.snapshots.latest_snapshots(owner_id, 2).await {
            Ok(snapshots) => snapshots,
            Err(err) => {
                error!(owner_id, error = %err, "could not read snapshots; failing owner's alerts");
                let message = format!("reading snapshots: {err}");
                return alerts.iter().map(|a| AlertReport::failed(a, message.clone())).collect();
            }
        };

        let mut reports = Vec::with_capacity(alerts.len());
        for alert in &alerts {
            let span = info_span!("alert", alert_id = %alert.id, site = %alert.site);
            reports.push(self.process_alert(alert, &snapshots, now).instrument(span).await);
        }
        reports
    }

    /// The scrape result does not gate the comparison; the guard decides on
    /// whatever snapshots exist afterwards.
    async fn trigger_scrape(&self, owner_id: &str) {
        let profile = match self.profiles.scrape_profile(owner_id).await {
            Ok(Some(profile)) => profile,
            Ok(None) => {
                debug!(owner_id, "no scrape profile; comparing existing snapshots");
                return;
            }
            Err(err) => {
                warn!(owner_id, error = %err, "could not load scrape profile");
                return;
            }
        };
        let request = ScrapeRequest::from(profile);
        match tokio::time::timeout(self.settings.scrape_timeout, self.trigger.trigger(&request)).await {
            Ok(true) => info!(owner_id, "scrape finished"),
            Ok(false) => warn!(owner_id, "scrape failed; comparing existing snapshots"),
            Err(_) => warn!(
                owner_id,
                timeout_secs = self.settings.scrape_timeout.as_secs(),
                "scrape timed out; comparing existing snapshots"
            ),
        }
    }

    async fn process_alert(&self, alert: &Alert, snapshots: &[Snapshot], now: DateTime<Utc>) -> AlertReport {
        let thresholds = alert.thresholds.unwrap_or(self.settings.thresholds);
        let run_at = RunTracker::run_mark(now, snapshots);
        let comparison = match evaluate_alert(alert, snapshots, &thresholds, &self.settings.guard) {
            GuardDecision::Skip {
                reason,
                previous_count,
                current_count,
            } => {
                if reason.advances_run() {
                    if let Err(err) = self.alerts.update_alert(alert.id, &RunTracker::advance(run_at, false)).await {
                        warn!(error = %err, "could not advance alert");
                        return AlertReport::failed(alert, format!("advancing alert: {err}"))
                            .with_counts(previous_count, current_count);
                    }
                }
                return AlertReport::new(alert, AlertOutcome::Skipped { reason })
                    .with_counts(previous_count, current_count);
            }
            GuardDecision::Compare(comparison) => comparison,
        };

        let (previous_count, current_count) = (comparison.previous_count, comparison.current_count);
        let events: Vec<ChangeEvent> = comparison
            .changes
            .into_iter()
            .enumerate()
            .map(|(ordinal, change)| {
                ChangeEvent::attribute(
                    change,
                    alert.id,
                    comparison.previous_snapshot_id,
                    comparison.current_snapshot_id,
                    ordinal,
                    now,
                )
            })
            .collect();

        if !events.is_empty() {
            if let Err(err) = self.events.insert_change_events(&events).await {
                error!(error = %err, events = events.len(), "could not persist change events; alert not advanced");
                let mut report = AlertReport::failed(alert, format!("persisting events: {err}"))
                    .with_counts(previous_count, current_count);
                report.suspicious_drop = comparison.suspicious_drop;
                return report;
            }
        }

        let changed = !events.is_empty();
        if let Err(err) = self.alerts.update_alert(alert.id, &RunTracker::advance(run_at, changed)).await {
            // Events are keyed deterministically, so the retry next run re-inserts nothing new.
            warn!(error = %err, "events stored but alert could not be advanced");
            let mut report = AlertReport::failed(alert, format!("advancing alert: {err}"))
                .with_counts(previous_count, current_count);
            report.suspicious_drop = comparison.suspicious_drop;
            return report;
        }

        if changed {
            info!(events = events.len(), previous_count, current_count, "changes detected");
            if alert.email_notification {
                self.notify(alert, events.clone(), previous_count, current_count).await;
            }
        } else {
            debug!(previous_count, current_count, "no changes");
        }

        let outcome = if changed {
            AlertOutcome::Changed { events: events.len() }
        } else {
            AlertOutcome::Unchanged
        };
        let mut report = AlertReport::new(alert, outcome).with_counts(previous_count, current_count);
        report.suspicious_drop = comparison.suspicious_drop;
        report
    }

    async fn notify(&self, alert: &Alert, events: Vec<ChangeEvent>, previous_count: usize, current_count: usize) {
        let recipient = alert.notify_email.as_deref().unwrap_or(&alert.owner_id);
        let notice = ChangeNotice {
            site_hostname: site_host(&alert.site).unwrap_or_else(|| alert.site.clone()),
            events,
            current_count,
            previous_count,
        };
        if let Err(err) = self.notifier.send(recipient, &notice).await {
            warn!(recipient, error = %err, "notification failed");
        }
    }
}
