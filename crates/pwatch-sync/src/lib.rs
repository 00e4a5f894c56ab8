//! Monitoring orchestration: guard, run tracking, scrape trigger, notifications.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use pwatch_core::DetectionThresholds;
use pwatch_match::IdentityDictionaries;
use pwatch_storage::{write_json_atomic, JsonDirStore};
use tokio::fs;
use tracing::{info, warn};

pub mod guard;
pub mod monitor;
pub mod notify;
pub mod trigger;

pub use guard::{evaluate_alert, is_partial_drop, Comparison, GuardConfig, GuardDecision, RunTracker, SkipReason};
pub use monitor::{AlertMonitor, AlertOutcome, AlertReport, MonitorSettings, RunSummary};
pub use notify::{ChangeNotice, LogNotifier, Notifier};
pub use trigger::{HttpScrapeTrigger, NoopScrapeTrigger, ProcessScrapeTrigger, ScrapeRequest, ScrapeTrigger};

pub const CRATE_NAME: &str = "pwatch-sync";

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    pub data_dir: PathBuf,
    pub rules_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub thresholds: DetectionThresholds,
    pub guard: GuardConfig,
    pub scrape_url: Option<String>,
    pub scrape_command: Option<String>,
    pub scrape_timeout_secs: u64,
    pub owner_concurrency: usize,
    pub ignore_colors: bool,
    pub user_agent: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "TRUE" | "True" | "yes")
}

impl MonitorConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env` over an arbitrary key lookup. Unparsable numbers
    /// fall back to their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let number = |key: &str| lookup(key).and_then(|v| v.trim().parse::<f64>().ok());
        let count = |key: &str| lookup(key).and_then(|v| v.trim().parse::<usize>().ok());
        let text = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let defaults = DetectionThresholds::default();
        let guard = GuardConfig::default();
        let data_dir = text("PWATCH_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data"));
        Self {
            reports_dir: text("PWATCH_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("reports")),
            data_dir,
            rules_dir: text("PWATCH_RULES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./rules")),
            thresholds: DetectionThresholds {
                min_valid_price: number("PWATCH_MIN_VALID_PRICE").unwrap_or(defaults.min_valid_price),
                min_price_change_pct: number("PWATCH_MIN_CHANGE_PCT").unwrap_or(defaults.min_price_change_pct),
                min_price_change_abs: number("PWATCH_MIN_CHANGE_ABS").unwrap_or(defaults.min_price_change_abs),
            },
            guard: GuardConfig {
                partial_drop_ratio: number("PWATCH_PARTIAL_DROP_RATIO").unwrap_or(guard.partial_drop_ratio),
                partial_drop_min_previous: count("PWATCH_PARTIAL_DROP_MIN_PREVIOUS")
                    .unwrap_or(guard.partial_drop_min_previous),
            },
            scrape_url: text("PWATCH_SCRAPE_URL"),
            scrape_command: text("PWATCH_SCRAPE_COMMAND"),
            scrape_timeout_secs: lookup("PWATCH_SCRAPE_TIMEOUT_SECS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(900),
            owner_concurrency: count("PWATCH_OWNER_CONCURRENCY").unwrap_or(4).max(1),
            ignore_colors: lookup("PWATCH_IGNORE_COLORS").map(|v| parse_flag(&v)).unwrap_or(false),
            user_agent: text("PWATCH_USER_AGENT").unwrap_or_else(|| "pwatch-bot/0.1".to_string()),
        }
    }

    pub fn scrape_timeout(&self) -> Duration {
        Duration::from_secs(self.scrape_timeout_secs)
    }

    pub fn settings(&self) -> MonitorSettings {
        MonitorSettings {
            thresholds: self.thresholds,
            guard: self.guard,
            scrape_timeout: self.scrape_timeout(),
            owner_concurrency: self.owner_concurrency,
            trigger_scrape: self.scrape_url.is_some() || self.scrape_command.is_some(),
        }
    }

    /// HTTP endpoint wins over a worker command; neither means no scraping.
    pub fn scrape_trigger(&self) -> Result<Arc<dyn ScrapeTrigger>> {
        if let Some(url) = &self.scrape_url {
            let trigger = HttpScrapeTrigger::new(url.clone(), self.scrape_timeout(), &self.user_agent)?;
            return Ok(Arc::new(trigger));
        }
        if let Some(command) = &self.scrape_command {
            let trigger = ProcessScrapeTrigger::from_command_line(command, self.scrape_timeout())
                .with_context(|| format!("empty scrape command {command:?}"))?;
            return Ok(Arc::new(trigger));
        }
        Ok(Arc::new(NoopScrapeTrigger))
    }
}

/// Reads `<rules_dir>/identity.yaml`; a missing file means built-in dictionaries.
pub fn load_dictionaries(rules_dir: &Path) -> Result<IdentityDictionaries> {
    let path = rules_dir.join("identity.yaml");
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "no identity rules file; using built-in dictionaries");
            return Ok(IdentityDictionaries::default());
        }
        Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
    };
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Run one monitoring pass over the JSON data directory and write the run
/// summary under `<reports_dir>/<run_id>/`.
pub async fn run_check_once_from_env() -> Result<RunSummary> {
    let config = MonitorConfig::from_env();
    run_check_once(&config).await
}

pub async fn run_check_once(config: &MonitorConfig) -> Result<RunSummary> {
    let store = Arc::new(JsonDirStore::new(config.data_dir.clone()));
    let monitor = AlertMonitor::new(store, config.settings()).with_trigger(config.scrape_trigger()?);
    let summary = monitor.run_once(Utc::now()).await?;
    write_run_reports(&config.reports_dir, &summary).await?;
    Ok(summary)
}

pub async fn write_run_reports(reports_root: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let reports_dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    write_json_atomic(&reports_dir.join("run_summary.json"), summary)
        .await
        .context("writing run_summary.json")?;

    let failures = summary
        .outcomes
        .iter()
        .filter_map(|r| match &r.outcome {
            AlertOutcome::Failed { error } => Some(format!("- {} ({}): {}", r.site, r.owner_id, error)),
            _ => None,
        })
        .collect::<Vec<_>>();
    let suspicious = summary
        .outcomes
        .iter()
        .filter(|r| r.suspicious_drop)
        .map(|r| format!("- {} ({}): {} -> {}", r.site, r.owner_id, r.previous_count, r.current_count))
        .collect::<Vec<_>>();
    if !suspicious.is_empty() {
        warn!(alerts = suspicious.len(), "run contains suspicious product-count drops");
    }
    let brief = format!(
        "# Price Watch Run\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Checked: {}\n- Changed: {}\n- Skipped: {}\n- Failed: {}\n- Events: {}\n\n## Failures\n{}\n\n## Suspicious Drops\n{}\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.checked,
        summary.changed,
        summary.skipped,
        summary.failed,
        summary.events,
        if failures.is_empty() { "- none".to_string() } else { failures.join("\n") },
        if suspicious.is_empty() { "- none".to_string() } else { suspicious.join("\n") },
    );
    fs::write(reports_dir.join("run_brief.md"), brief)
        .await
        .context("writing run_brief.md")?;
    Ok(reports_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn config_from(pairs: &[(&str, &str)]) -> MonitorConfig {
        let vars: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        MonitorConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = MonitorConfig::default();
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.reports_dir, PathBuf::from("./data").join("reports"));
        assert_eq!(config.thresholds, DetectionThresholds::default());
        assert_eq!(config.guard, GuardConfig::default());
        assert_eq!(config.scrape_timeout(), Duration::from_secs(900));
        assert_eq!(config.owner_concurrency, 4);
        assert!(!config.ignore_colors);
        assert!(!config.settings().trigger_scrape);
    }

    #[test]
    fn env_values_override_defaults_and_bad_numbers_are_ignored() {
        let config = config_from(&[
            ("PWATCH_MIN_CHANGE_PCT", "2.5"),
            ("PWATCH_MIN_CHANGE_ABS", "oops"),
            ("PWATCH_PARTIAL_DROP_MIN_PREVIOUS", "10"),
            ("PWATCH_OWNER_CONCURRENCY", "0"),
            ("PWATCH_IGNORE_COLORS", "true"),
            ("PWATCH_SCRAPE_COMMAND", "node worker.js"),
        ]);
        assert_eq!(config.thresholds.min_price_change_pct, 2.5);
        assert_eq!(config.thresholds.min_price_change_abs, 2.0);
        assert_eq!(config.guard.partial_drop_min_previous, 10);
        assert_eq!(config.owner_concurrency, 1);
        assert!(config.ignore_colors);
        assert!(config.settings().trigger_scrape);
        assert!(config.scrape_trigger().is_ok());
    }

    #[test]
    fn missing_rules_file_falls_back_to_defaults() {
        let dir = tempdir().expect("tempdir");
        let dictionaries = load_dictionaries(dir.path()).expect("defaults");
        assert_eq!(dictionaries, IdentityDictionaries::default());
    }

    #[test]
    fn rules_file_overrides_listed_dictionaries_only() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("identity.yaml"),
            "brands:\n  - zero\n  - energica\ncolors:\n  - teal\n",
        )
        .expect("write");
        let dictionaries = load_dictionaries(dir.path()).expect("parsed");
        assert_eq!(dictionaries.brands, vec!["zero", "energica"]);
        assert_eq!(dictionaries.colors, vec!["teal"]);
        assert_eq!(dictionaries.label_prefixes, IdentityDictionaries::default().label_prefixes);
    }

    #[tokio::test]
    async fn run_reports_land_under_run_id() {
        let dir = tempdir().expect("tempdir");
        let now = Utc::now();
        let summary = RunSummary {
            run_id: uuid::Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            checked: 2,
            changed: 1,
            skipped: 0,
            failed: 0,
            events: 3,
            outcomes: Vec::new(),
        };
        let reports_dir = write_run_reports(dir.path(), &summary).await.expect("reports");
        assert_eq!(reports_dir, dir.path().join(summary.run_id.to_string()));

        let json: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(reports_dir.join("run_summary.json")).expect("summary"),
        )
        .expect("json");
        assert_eq!(json["events"], 3);
        let brief = std::fs::read_to_string(reports_dir.join("run_brief.md")).expect("brief");
        assert!(brief.contains("- Changed: 1"));
        assert!(brief.contains("## Failures\n- none"));
    }

    #[test]
    fn malformed_rules_file_is_an_error() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("identity.yaml"), "brands: [unclosed").expect("write");
        assert!(load_dictionaries(dir.path()).is_err());
    }
}
