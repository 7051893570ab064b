//! Monitoring, stateful alerting, and read-side analytics for CVRS.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cvrs_core::{AlertSeverity, DataSource, DownloadResult, MetricsSnapshot, MonitoringAlert};
use regex::Regex;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cvrs-monitor";

// ---------------------------------------------------------------------------
// Level-triggered alert state machine

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionState {
    Ok,
    Alerting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertEvent {
    Started,
    Resolved,
}

/// Pure transition function: `(state, breached) -> (state', event?)`.
pub fn transition(state: ConditionState, breached: bool) -> (ConditionState, Option<AlertEvent>) {
    match (state, breached) {
        (ConditionState::Ok, true) => (ConditionState::Alerting, Some(AlertEvent::Started)),
        (ConditionState::Alerting, false) => (ConditionState::Ok, Some(AlertEvent::Resolved)),
        (state, _) => (state, None),
    }
}

/// Per-condition suppression state. An ongoing breach emits exactly one
/// `Started` event; repeats only bump `suppressed_count`.
#[derive(Debug, Clone)]
pub struct AlertStateMachine {
    pub key: String,
    pub state: ConditionState,
    pub entered_at: DateTime<Utc>,
    pub suppressed_count: u64,
}

impl AlertStateMachine {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            state: ConditionState::Ok,
            entered_at: Utc::now(),
            suppressed_count: 0,
        }
    }

    pub fn observe(&mut self, breached: bool) -> Option<AlertEvent> {
        let (next, event) = transition(self.state, breached);
        if next != self.state {
            self.state = next;
            self.entered_at = Utc::now();
            self.suppressed_count = 0;
        } else if breached && event.is_none() {
            self.suppressed_count += 1;
        }
        event
    }
}

/// Metric a level-triggered condition evaluates against its threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    DataQualityScore,
    ApiSuccessRate,
}

impl MetricKind {
    fn value(&self, snapshot: &MetricsSnapshot) -> f64 {
        match self {
            MetricKind::DataQualityScore => snapshot.data_quality_score,
            MetricKind::ApiSuccessRate => snapshot.api_success_rate,
        }
    }
}

/// Data-driven condition definition; adding an alert type is adding a row.
#[derive(Debug, Clone)]
pub struct LevelCondition {
    pub key: String,
    pub alert_type: String,
    pub severity: AlertSeverity,
    pub threshold: f64,
    pub metric: MetricKind,
}

// ---------------------------------------------------------------------------
// Monitoring service

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub tick_interval: Duration,
    pub snapshot_cap: usize,
    pub run_history_cap: usize,
    pub recent_run_window: usize,
    pub data_quality_threshold: f64,
    pub api_success_threshold: f64,
    pub long_running_after: chrono::Duration,
    pub auto_resolve_after: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            snapshot_cap: 1440,
            run_history_cap: 200,
            recent_run_window: 50,
            data_quality_threshold: 70.0,
            api_success_threshold: 80.0,
            long_running_after: chrono::Duration::hours(1),
            auto_resolve_after: Duration::from_secs(300),
        }
    }
}

fn default_conditions(config: &MonitorConfig) -> Vec<LevelCondition> {
    vec![
        LevelCondition {
            key: "data_quality".to_string(),
            alert_type: "data_quality".to_string(),
            severity: AlertSeverity::Medium,
            threshold: config.data_quality_threshold,
            metric: MetricKind::DataQualityScore,
        },
        LevelCondition {
            key: "api_success_rate".to_string(),
            alert_type: "api_success_rate".to_string(),
            severity: AlertSeverity::Medium,
            threshold: config.api_success_threshold,
            metric: MetricKind::ApiSuccessRate,
        },
    ]
}

struct MonitorInner {
    snapshots: VecDeque<MetricsSnapshot>,
    alerts: Vec<MonitoringAlert>,
    machines: Vec<AlertStateMachine>,
    runs: HashMap<String, VecDeque<DownloadResult>>,
    running_jobs: HashMap<Uuid, DateTime<Utc>>,
    failed_jobs: HashMap<Uuid, DateTime<Utc>>,
    jobs_completed: u64,
    jobs_failed: u64,
    valid_records: u64,
    invalid_records: u64,
}

/// Owns all monitoring state; constructed once at process start and shared
/// by handle. Everything here is process-local and resets on restart.
pub struct MonitoringService {
    config: MonitorConfig,
    conditions: Vec<LevelCondition>,
    inner: Mutex<MonitorInner>,
    weak: std::sync::Weak<Self>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SuppressionView {
    pub key: String,
    pub state: ConditionState,
    pub entered_at: DateTime<Utc>,
    pub suppressed_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DashboardView {
    pub latest: Option<MetricsSnapshot>,
    pub active_alerts: Vec<MonitoringAlert>,
    pub conditions: Vec<SuppressionView>,
    pub jobs_running: usize,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
}

impl MonitoringService {
    pub fn new(config: MonitorConfig) -> Arc<Self> {
        let conditions = default_conditions(&config);
        let machines: Vec<AlertStateMachine> = conditions
            .iter()
            .map(|c| AlertStateMachine::new(c.key.clone()))
            .collect();
        Arc::new_cyclic(|weak| Self {
            config,
            conditions,
            inner: Mutex::new(MonitorInner {
                snapshots: VecDeque::new(),
                alerts: Vec::new(),
                machines,
                runs: HashMap::new(),
                running_jobs: HashMap::new(),
                failed_jobs: HashMap::new(),
                jobs_completed: 0,
                jobs_failed: 0,
                valid_records: 0,
                invalid_records: 0,
            }),
            weak: weak.clone(),
        })
    }

    // -- recording API, called from the ingestion pipeline ------------------

    pub fn record_job_started(&self, job_id: Uuid) {
        let mut inner = self.lock();
        inner.running_jobs.insert(job_id, Utc::now());
    }

    pub fn record_job_finished(&self, job_id: Uuid, success: bool) {
        let mut inner = self.lock();
        inner.running_jobs.remove(&job_id);
        if success {
            inner.jobs_completed += 1;
        } else {
            inner.jobs_failed += 1;
            inner.failed_jobs.insert(job_id, Utc::now());
        }
    }

    pub fn record_download(&self, result: &DownloadResult) {
        let cap = self.config.run_history_cap;
        let mut inner = self.lock();
        let history = inner.runs.entry(result.source.clone()).or_default();
        history.push_back(result.clone());
        while history.len() > cap {
            history.pop_front();
        }
    }

    pub fn record_validation(&self, valid: usize, invalid: usize) {
        let mut inner = self.lock();
        inner.valid_records += valid as u64;
        inner.invalid_records += invalid as u64;
    }

    // -- periodic evaluation -------------------------------------------------

    /// Spawn the periodic tick task. The loop never dies: a failing
    /// collection turns into a `system_health` alert instead.
    pub fn spawn_ticker(&self) -> tokio::task::JoinHandle<()> {
        let service = self.weak.upgrade().expect("monitoring service alive");
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(service.config.tick_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                service.tick();
            }
        })
    }

    pub fn tick(&self) -> MetricsSnapshot {
        match self.collect_and_evaluate() {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(error = %err, "metrics collection failed");
                self.raise_alert(
                    "system_health".to_string(),
                    AlertSeverity::High,
                    "system_health",
                    format!("metrics collection failed: {err}"),
                    serde_json::json!({}),
                );
                MetricsSnapshot {
                    timestamp: Utc::now(),
                    jobs_running: 0,
                    jobs_completed: 0,
                    jobs_failed: 0,
                    api_success_rate: 0.0,
                    data_quality_score: 0.0,
                    memory_bytes: 0,
                }
            }
        }
    }

    fn collect_and_evaluate(&self) -> anyhow::Result<MetricsSnapshot> {
        let snapshot = {
            let mut inner = self.lock();
            let snapshot = self.snapshot_of(&inner);
            inner.snapshots.push_back(snapshot);
            while inner.snapshots.len() > self.config.snapshot_cap {
                inner.snapshots.pop_front();
            }
            snapshot
        };

        self.evaluate_edge_conditions();
        self.evaluate_level_conditions(&snapshot);
        Ok(snapshot)
    }

    /// Edge-triggered conditions fire once per discrete event (job), deduped
    /// by alert key.
    fn evaluate_edge_conditions(&self) {
        let (failed, long_running) = {
            let inner = self.lock();
            let failed: Vec<Uuid> = inner.failed_jobs.keys().copied().collect();
            let cutoff = Utc::now() - self.config.long_running_after;
            let long_running: Vec<Uuid> = inner
                .running_jobs
                .iter()
                .filter(|(_, started)| **started < cutoff)
                .map(|(id, _)| *id)
                .collect();
            (failed, long_running)
        };

        for job_id in failed {
            self.raise_alert_once(
                format!("job_failed:{job_id}"),
                AlertSeverity::Medium,
                "job_failed",
                format!("ingestion job {job_id} failed"),
                serde_json::json!({ "job_id": job_id }),
            );
        }
        for job_id in long_running {
            self.raise_alert_once(
                format!("job_long_running:{job_id}"),
                AlertSeverity::High,
                "job_long_running",
                format!("ingestion job {job_id} has been running for over an hour"),
                serde_json::json!({ "job_id": job_id }),
            );
        }
    }

    fn evaluate_level_conditions(&self, snapshot: &MetricsSnapshot) {
        for (index, condition) in self.conditions.iter().enumerate() {
            let value = condition.metric.value(snapshot);
            let breached = value < condition.threshold;
            let event = {
                let mut inner = self.lock();
                inner.machines[index].observe(breached)
            };
            match event {
                Some(AlertEvent::Started) => {
                    info!(condition = %condition.key, value, threshold = condition.threshold, "alert started");
                    self.raise_alert(
                        condition.key.clone(),
                        condition.severity,
                        &condition.alert_type,
                        format!(
                            "{} dropped to {value:.1} (threshold {:.1})",
                            condition.key, condition.threshold
                        ),
                        serde_json::json!({ "value": value, "threshold": condition.threshold }),
                    );
                }
                Some(AlertEvent::Resolved) => {
                    info!(condition = %condition.key, value, "alert resolved");
                    self.resolve_by_key(&condition.key);
                }
                None => {}
            }
        }
    }

    fn snapshot_of(&self, inner: &MonitorInner) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: Utc::now(),
            jobs_running: inner.running_jobs.len(),
            jobs_completed: inner.jobs_completed,
            jobs_failed: inner.jobs_failed,
            api_success_rate: recent_success_rate(&inner.runs, self.config.recent_run_window),
            data_quality_score: quality_score(inner.valid_records, inner.invalid_records),
            memory_bytes: read_rss_bytes(),
        }
    }

    /// Current metrics without touching the snapshot history or alerts.
    pub fn current_metrics(&self) -> MetricsSnapshot {
        let inner = self.lock();
        self.snapshot_of(&inner)
    }

    // -- alert management ----------------------------------------------------

    fn raise_alert(
        &self,
        key: String,
        severity: AlertSeverity,
        alert_type: &str,
        message: String,
        details: serde_json::Value,
    ) -> Uuid {
        let alert = MonitoringAlert {
            id: Uuid::new_v4(),
            key,
            severity,
            alert_type: alert_type.to_string(),
            message,
            details,
            timestamp: Utc::now(),
            resolved: false,
        };
        let id = alert.id;
        self.lock().alerts.push(alert);

        // Low-severity alerts self-resolve unless someone beats the timer.
        if severity == AlertSeverity::Low {
            if let (Ok(handle), Some(service)) =
                (tokio::runtime::Handle::try_current(), self.weak.upgrade())
            {
                let delay = self.config.auto_resolve_after;
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    service.resolve_alert(id);
                });
            }
        }
        id
    }

    fn raise_alert_once(
        &self,
        key: String,
        severity: AlertSeverity,
        alert_type: &str,
        message: String,
        details: serde_json::Value,
    ) {
        {
            let inner = self.lock();
            if inner.alerts.iter().any(|a| a.key == key) {
                return;
            }
        }
        self.raise_alert(key, severity, alert_type, message, details);
    }

    pub fn resolve_alert(&self, id: Uuid) -> bool {
        let mut inner = self.lock();
        match inner.alerts.iter_mut().find(|a| a.id == id && !a.resolved) {
            Some(alert) => {
                alert.resolved = true;
                true
            }
            None => false,
        }
    }

    fn resolve_by_key(&self, key: &str) {
        let mut inner = self.lock();
        for alert in inner.alerts.iter_mut().filter(|a| a.key == key && !a.resolved) {
            alert.resolved = true;
        }
    }

    // -- read API ------------------------------------------------------------

    pub fn snapshots(&self) -> Vec<MetricsSnapshot> {
        self.lock().snapshots.iter().copied().collect()
    }

    pub fn latest_snapshot(&self) -> Option<MetricsSnapshot> {
        self.lock().snapshots.back().copied()
    }

    pub fn alerts(&self, include_resolved: bool) -> Vec<MonitoringAlert> {
        self.lock()
            .alerts
            .iter()
            .filter(|a| include_resolved || !a.resolved)
            .cloned()
            .collect()
    }

    pub fn dashboard(&self) -> DashboardView {
        let inner = self.lock();
        DashboardView {
            latest: inner.snapshots.back().copied(),
            active_alerts: inner.alerts.iter().filter(|a| !a.resolved).cloned().collect(),
            conditions: inner
                .machines
                .iter()
                .map(|m| SuppressionView {
                    key: m.key.clone(),
                    state: m.state,
                    entered_at: m.entered_at,
                    suppressed_count: m.suppressed_count,
                })
                .collect(),
            jobs_running: inner.running_jobs.len(),
            jobs_completed: inner.jobs_completed,
            jobs_failed: inner.jobs_failed,
        }
    }

    pub fn run_history(&self) -> HashMap<String, Vec<DownloadResult>> {
        self.lock()
            .runs
            .iter()
            .map(|(source, runs)| (source.clone(), runs.iter().cloned().collect()))
            .collect()
    }

    pub fn last_run_for(&self, source: &str) -> Option<DownloadResult> {
        self.lock()
            .runs
            .get(source)
            .and_then(|runs| runs.back().cloned())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MonitorInner> {
        self.inner.lock().expect("monitor lock poisoned")
    }
}

fn quality_score(valid: u64, invalid: u64) -> f64 {
    let total = valid + invalid;
    if total == 0 {
        100.0
    } else {
        valid as f64 / total as f64 * 100.0
    }
}

fn recent_success_rate(runs: &HashMap<String, VecDeque<DownloadResult>>, window: usize) -> f64 {
    let mut recent: Vec<&DownloadResult> = runs.values().flatten().collect();
    recent.sort_by_key(|r| r.completed_at);
    let recent: Vec<_> = recent.into_iter().rev().take(window).collect();
    if recent.is_empty() {
        return 100.0;
    }
    let successes = recent.iter().filter(|r| r.success).count();
    successes as f64 / recent.len() as f64 * 100.0
}

/// Resident set size from /proc, best effort; zero where unavailable.
fn read_rss_bytes() -> u64 {
    std::fs::read_to_string("/proc/self/statm")
        .ok()
        .and_then(|text| {
            text.split_whitespace()
                .nth(1)
                .and_then(|pages| pages.parse::<u64>().ok())
        })
        .map(|pages| pages * 4096)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Analytics aggregator

/// Ordered (category, pattern) pairs; first match wins, order is exposed by
/// the API so precedence stays auditable.
pub fn default_taxonomy() -> Vec<(&'static str, &'static str)> {
    vec![
        ("rate_limit", r"(?i)rate limit"),
        ("network", r"(?i)timeout|timed out|connection|connect|dns|unreachable|http status 5\d\d"),
        ("parsing", r"(?i)invalid csv|invalid json|invalid xml|parse|malformed|unexpected"),
        ("validation", r"(?i)validation|missing required|empty company"),
        ("persistence", r"(?i)database|constraint|duplicate|transaction"),
    ]
}

pub const UNCATEGORIZED: &str = "uncategorized";

#[derive(Debug, Clone, Serialize)]
pub struct SourceHealth {
    pub source: String,
    pub runs: usize,
    pub success_rate: f64,
    pub uptime_percent: f64,
    pub avg_latency_ms: f64,
    pub health_score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CategoryCount {
    pub category: String,
    pub count: usize,
    pub examples: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBreakdown {
    /// Taxonomy evaluation order, most specific first.
    pub order: Vec<String>,
    pub categories: Vec<CategoryCount>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrendReport {
    pub window_days: i64,
    pub records_current: usize,
    pub records_previous: usize,
    pub records_delta_percent: f64,
    pub errors_current: usize,
    pub errors_previous: usize,
    pub errors_delta_percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CostRanking {
    pub source: String,
    pub cost_per_run: f64,
    pub avg_records_per_run: f64,
    pub cost_per_record: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CostRecommendation {
    pub from_source: String,
    pub to_source: String,
    pub estimated_savings_per_run: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CostRoutingReport {
    pub rankings: Vec<CostRanking>,
    pub recommendation: Option<CostRecommendation>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsSummary {
    pub total_runs: usize,
    pub total_records_processed: usize,
    pub total_records_saved: usize,
    pub overall_success_rate: f64,
    pub data_quality_score: f64,
    pub active_alerts: usize,
}

const MIN_SAVINGS_PER_RUN: f64 = 0.01;

/// Pure read-side view over monitoring history. Owns compiled taxonomy
/// regexes and the static per-source cost table.
pub struct AnalyticsAggregator {
    monitor: Arc<MonitoringService>,
    costs: HashMap<String, f64>,
    taxonomy: Vec<(String, Regex)>,
}

impl AnalyticsAggregator {
    pub fn new(monitor: Arc<MonitoringService>, sources: &[DataSource]) -> Self {
        let costs = sources
            .iter()
            .map(|s| (s.name.clone(), s.cost_per_run))
            .collect();
        let taxonomy = default_taxonomy()
            .into_iter()
            .map(|(category, pattern)| {
                (
                    category.to_string(),
                    Regex::new(pattern).expect("static taxonomy pattern"),
                )
            })
            .collect();
        Self {
            monitor,
            costs,
            taxonomy,
        }
    }

    pub fn categorize(&self, error: &str) -> &str {
        self.taxonomy
            .iter()
            .find(|(_, regex)| regex.is_match(error))
            .map(|(category, _)| category.as_str())
            .unwrap_or(UNCATEGORIZED)
    }

    pub fn source_health(&self) -> Vec<SourceHealth> {
        let history = self.monitor.run_history();
        let mut out: Vec<SourceHealth> = history
            .iter()
            .map(|(source, runs)| {
                let total = runs.len();
                let successes = runs.iter().filter(|r| r.success).count();
                let success_rate = percentage(successes, total);
                let recent: Vec<_> = runs.iter().rev().take(10).collect();
                let uptime_percent =
                    percentage(recent.iter().filter(|r| r.success).count(), recent.len());
                let avg_latency_ms = if total == 0 {
                    0.0
                } else {
                    runs.iter().map(|r| r.download_time_ms as f64).sum::<f64>() / total as f64
                };
                let latency_score = (100.0 - avg_latency_ms / 1000.0).max(0.0);
                let health_score =
                    success_rate * 0.4 + uptime_percent * 0.3 + latency_score * 0.3;
                SourceHealth {
                    source: source.clone(),
                    runs: total,
                    success_rate,
                    uptime_percent,
                    avg_latency_ms,
                    health_score,
                }
            })
            .collect();
        out.sort_by(|a, b| b.health_score.total_cmp(&a.health_score));
        out
    }

    pub fn error_breakdown(&self) -> ErrorBreakdown {
        let history = self.monitor.run_history();
        let mut counts: HashMap<&str, CategoryCount> = HashMap::new();
        for error in history.values().flatten().flat_map(|r| r.errors.iter()) {
            let category = self.categorize(error);
            let entry = counts.entry(category).or_insert_with(|| CategoryCount {
                category: category.to_string(),
                count: 0,
                examples: Vec::new(),
            });
            entry.count += 1;
            if entry.examples.len() < 3 {
                entry.examples.push(error.clone());
            }
        }

        let order: Vec<String> = self
            .taxonomy
            .iter()
            .map(|(category, _)| category.clone())
            .chain(std::iter::once(UNCATEGORIZED.to_string()))
            .collect();
        let categories = order
            .iter()
            .filter_map(|category| counts.remove(category.as_str()))
            .collect();
        ErrorBreakdown { order, categories }
    }

    pub fn trends(&self, window_days: i64) -> TrendReport {
        let now = Utc::now();
        let current_start = now - chrono::Duration::days(window_days);
        let previous_start = current_start - chrono::Duration::days(window_days);

        let history = self.monitor.run_history();
        let mut records_current = 0;
        let mut records_previous = 0;
        let mut errors_current = 0;
        let mut errors_previous = 0;
        for run in history.values().flatten() {
            if run.completed_at >= current_start {
                records_current += run.records_processed;
                errors_current += run.errors.len();
            } else if run.completed_at >= previous_start {
                records_previous += run.records_processed;
                errors_previous += run.errors.len();
            }
        }

        TrendReport {
            window_days,
            records_current,
            records_previous,
            records_delta_percent: delta_percent(records_current, records_previous),
            errors_current,
            errors_previous,
            errors_delta_percent: delta_percent(errors_current, errors_previous),
        }
    }

    pub fn cost_routing(&self) -> CostRoutingReport {
        let history = self.monitor.run_history();
        let mut rankings: Vec<CostRanking> = self
            .costs
            .iter()
            .map(|(source, &cost_per_run)| {
                let runs = history.get(source);
                let (run_count, record_sum) = runs
                    .map(|runs| {
                        (
                            runs.len(),
                            runs.iter().map(|r| r.records_processed).sum::<usize>(),
                        )
                    })
                    .unwrap_or((0, 0));
                let avg_records_per_run = if run_count == 0 {
                    0.0
                } else {
                    record_sum as f64 / run_count as f64
                };
                let cost_per_record = if avg_records_per_run > 0.0 {
                    cost_per_run / avg_records_per_run
                } else {
                    cost_per_run
                };
                CostRanking {
                    source: source.clone(),
                    cost_per_run,
                    avg_records_per_run,
                    cost_per_record,
                }
            })
            .collect();
        rankings.sort_by(|a, b| a.cost_per_record.total_cmp(&b.cost_per_record));

        let most_expensive = rankings
            .iter()
            .rev()
            .find(|r| r.cost_per_record > 0.0)
            .cloned();
        let cheapest_paid = rankings.iter().find(|r| r.cost_per_record > 0.0).cloned();
        let recommendation = match (most_expensive, cheapest_paid) {
            (Some(expensive), Some(cheap)) if expensive.source != cheap.source => {
                let savings = (expensive.cost_per_record - cheap.cost_per_record)
                    * expensive.avg_records_per_run.max(1.0);
                (savings > MIN_SAVINGS_PER_RUN).then(|| CostRecommendation {
                    from_source: expensive.source,
                    to_source: cheap.source,
                    estimated_savings_per_run: savings,
                })
            }
            _ => None,
        };

        CostRoutingReport {
            rankings,
            recommendation,
        }
    }

    pub fn summary(&self) -> AnalyticsSummary {
        let history = self.monitor.run_history();
        let runs: Vec<_> = history.values().flatten().collect();
        let total_runs = runs.len();
        let successes = runs.iter().filter(|r| r.success).count();
        AnalyticsSummary {
            total_runs,
            total_records_processed: runs.iter().map(|r| r.records_processed).sum(),
            total_records_saved: runs.iter().map(|r| r.records_saved).sum(),
            overall_success_rate: percentage(successes, total_runs),
            data_quality_score: self
                .monitor
                .latest_snapshot()
                .map(|s| s.data_quality_score)
                .unwrap_or(100.0),
            active_alerts: self.monitor.alerts(false).len(),
        }
    }
}

fn percentage(part: usize, total: usize) -> f64 {
    if total == 0 {
        100.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}

fn delta_percent(current: usize, previous: usize) -> f64 {
    if previous == 0 {
        if current == 0 {
            0.0
        } else {
            100.0
        }
    } else {
        (current as f64 - previous as f64) / previous as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(source: &str, success: bool, latency_ms: u64, records: usize, errors: &[&str]) -> DownloadResult {
        DownloadResult {
            source: source.to_string(),
            success,
            records_processed: records,
            records_saved: records,
            errors: errors.iter().map(ToString::to_string).collect(),
            download_time_ms: latency_ms,
            attempts: 1,
            completed_at: Utc::now(),
        }
    }

    #[test]
    fn transition_is_a_pure_two_state_machine() {
        use ConditionState::*;
        assert_eq!(transition(Ok, true), (Alerting, Some(AlertEvent::Started)));
        assert_eq!(transition(Alerting, true), (Alerting, None));
        assert_eq!(transition(Alerting, false), (Ok, Some(AlertEvent::Resolved)));
        assert_eq!(transition(Ok, false), (Ok, None));
    }

    #[test]
    fn sustained_breach_emits_one_start_and_counts_suppressions() {
        let mut machine = AlertStateMachine::new("data_quality");
        let mut started = 0;
        for _ in 0..5 {
            if machine.observe(true) == Some(AlertEvent::Started) {
                started += 1;
            }
        }
        assert_eq!(started, 1);
        assert_eq!(machine.suppressed_count, 4);

        assert_eq!(machine.observe(false), Some(AlertEvent::Resolved));
        assert_eq!(machine.suppressed_count, 0);
        assert_eq!(machine.observe(false), None);
    }

    #[tokio::test]
    async fn quality_breach_raises_exactly_one_alert_until_recovery() {
        let service = MonitoringService::new(MonitorConfig::default());
        service.record_validation(1, 9); // 10% quality

        for _ in 0..4 {
            service.tick();
        }
        let quality_alerts: Vec<_> = service
            .alerts(true)
            .into_iter()
            .filter(|a| a.alert_type == "data_quality")
            .collect();
        assert_eq!(quality_alerts.len(), 1);
        assert!(!quality_alerts[0].resolved);

        let dashboard = service.dashboard();
        let condition = dashboard
            .conditions
            .iter()
            .find(|c| c.key == "data_quality")
            .expect("condition tracked");
        assert_eq!(condition.state, ConditionState::Alerting);
        assert_eq!(condition.suppressed_count, 3);

        service.record_validation(1000, 0); // back above threshold
        service.tick();
        let quality_alerts: Vec<_> = service
            .alerts(true)
            .into_iter()
            .filter(|a| a.alert_type == "data_quality")
            .collect();
        assert_eq!(quality_alerts.len(), 1);
        assert!(quality_alerts[0].resolved);
    }

    #[tokio::test]
    async fn failed_jobs_alert_once_per_job() {
        let service = MonitoringService::new(MonitorConfig::default());
        let job_id = Uuid::new_v4();
        service.record_job_started(job_id);
        service.record_job_finished(job_id, false);

        service.tick();
        service.tick();
        let failed: Vec<_> = service
            .alerts(true)
            .into_iter()
            .filter(|a| a.alert_type == "job_failed")
            .collect();
        assert_eq!(failed.len(), 1);
    }

    #[tokio::test]
    async fn long_running_jobs_raise_a_high_alert() {
        let config = MonitorConfig {
            long_running_after: chrono::Duration::milliseconds(5),
            ..Default::default()
        };
        let service = MonitoringService::new(config);
        service.record_job_started(Uuid::new_v4());
        tokio::time::sleep(Duration::from_millis(20)).await;
        service.tick();

        let alerts = service.alerts(false);
        assert!(alerts
            .iter()
            .any(|a| a.alert_type == "job_long_running" && a.severity == AlertSeverity::High));
    }

    #[tokio::test]
    async fn low_severity_alerts_auto_resolve() {
        let config = MonitorConfig {
            auto_resolve_after: Duration::from_millis(20),
            ..Default::default()
        };
        let service = MonitoringService::new(config);
        let id = service.raise_alert(
            "informational".to_string(),
            AlertSeverity::Low,
            "informational",
            "low-priority notice".to_string(),
            serde_json::json!({}),
        );

        assert_eq!(service.alerts(false).len(), 1);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(service.alerts(false).is_empty());
        assert!(!service.resolve_alert(id), "already resolved by the timer");
    }

    #[test]
    fn taxonomy_first_match_wins_in_declared_order() {
        let monitor = MonitoringService::new(MonitorConfig::default());
        let analytics = AnalyticsAggregator::new(monitor, &[]);

        assert_eq!(analytics.categorize("rate limit exceeded for source"), "rate_limit");
        assert_eq!(analytics.categorize("connection timed out"), "network");
        assert_eq!(analytics.categorize("invalid CSV header: oops"), "parsing");
        assert_eq!(analytics.categorize("database error: constraint"), "persistence");
        assert_eq!(analytics.categorize("something else entirely"), UNCATEGORIZED);
    }

    #[test]
    fn health_score_blends_success_uptime_and_latency() {
        let monitor = MonitoringService::new(MonitorConfig::default());
        for _ in 0..8 {
            monitor.record_download(&run("fed-corporations", true, 2_000, 100, &[]));
        }
        for _ in 0..2 {
            monitor.record_download(&run("fed-corporations", false, 2_000, 0, &["timeout"]));
        }

        let analytics = AnalyticsAggregator::new(monitor, &[]);
        let health = analytics.source_health();
        assert_eq!(health.len(), 1);
        let h = &health[0];
        assert_eq!(h.runs, 10);
        assert!((h.success_rate - 80.0).abs() < 1e-9);
        // 80*0.4 + 80*0.3 + (100 - 2)*0.3 = 85.4
        assert!((h.health_score - 85.4).abs() < 1e-9);
    }

    #[test]
    fn cost_routing_recommends_the_cheapest_paid_alternative() {
        let monitor = MonitoringService::new(MonitorConfig::default());
        monitor.record_download(&run("premium-feed", true, 100, 50, &[]));
        monitor.record_download(&run("budget-feed", true, 100, 200, &[]));
        monitor.record_download(&run("open-data", true, 100, 500, &[]));

        let sources = vec![
            source("premium-feed", 25.0),
            source("budget-feed", 4.0),
            source("open-data", 0.0),
        ];
        let analytics = AnalyticsAggregator::new(monitor, &sources);
        let report = analytics.cost_routing();

        assert_eq!(report.rankings.first().map(|r| r.source.as_str()), Some("open-data"));
        let rec = report.recommendation.expect("recommendation present");
        assert_eq!(rec.from_source, "premium-feed");
        assert_eq!(rec.to_source, "budget-feed");
        assert!(rec.estimated_savings_per_run > 0.0);
    }

    #[test]
    fn trends_compare_adjacent_day_windows() {
        let monitor = MonitoringService::new(MonitorConfig::default());
        let mut old = run("fed-corporations", true, 100, 40, &["timeout"]);
        old.completed_at = Utc::now() - chrono::Duration::days(20);
        let mut previous = run("fed-corporations", true, 100, 50, &["timeout", "parse"]);
        previous.completed_at = Utc::now() - chrono::Duration::days(8);
        let current = run("fed-corporations", true, 100, 100, &["timeout"]);
        monitor.record_download(&old);
        monitor.record_download(&previous);
        monitor.record_download(&current);

        let analytics = AnalyticsAggregator::new(monitor, &[]);
        let report = analytics.trends(7);
        assert_eq!(report.records_current, 100);
        assert_eq!(report.records_previous, 50);
        assert!((report.records_delta_percent - 100.0).abs() < 1e-9);
        assert_eq!(report.errors_current, 1);
        assert_eq!(report.errors_previous, 2);
        assert!((report.errors_delta_percent + 50.0).abs() < 1e-9);
    }

    fn source(name: &str, cost: f64) -> DataSource {
        DataSource {
            name: name.to_string(),
            display_name: name.to_string(),
            url: format!("https://example.ca/{name}"),
            source_type: cvrs_core::SourceType::Api,
            format: None,
            enabled: true,
            rate_limit: None,
            field_mappings: Default::default(),
            selectors: None,
            paginate: false,
            cost_per_run: cost,
            notes: None,
        }
    }
}
