//! Ingestion orchestration: validation, deduplication, the source manager,
//! job registry, and the periodic scheduler.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use cvrs_adapters::{downloader_for, Downloader, FetchOutcome, FieldMapper};
use cvrs_core::{
    BusinessRecord, DataSource, DownloadResult, IngestJob, JobState, RuntimeConfig, SourceRegistry,
    SourceType,
};
use cvrs_monitor::MonitoringService;
use cvrs_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher, RateLimiter, VendorStore};
use futures_util::future::join_all;
use tokio::sync::watch;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cvrs-sync";

const JOB_HISTORY_CAP: usize = 1000;

// ---------------------------------------------------------------------------
// Validation

pub struct ValidationRule {
    pub field: &'static str,
    pub message: &'static str,
    pub predicate: fn(&BusinessRecord) -> bool,
}

/// Shipped rule set. Address is deliberately absent: the normalizer
/// substitutes a placeholder instead of the validator rejecting.
pub fn default_rules() -> Vec<ValidationRule> {
    vec![
        ValidationRule {
            field: "company_name",
            message: "company name is required",
            predicate: |r| !r.company_name.trim().is_empty(),
        },
        ValidationRule {
            field: "email",
            message: "email must contain @",
            predicate: |r| r.email.as_deref().map(|e| e.contains('@')).unwrap_or(true),
        },
        ValidationRule {
            field: "website",
            message: "website must be an http(s) URL",
            predicate: |r| {
                r.website
                    .as_deref()
                    .map(|w| w.starts_with("http"))
                    .unwrap_or(true)
            },
        },
    ]
}

#[derive(Debug)]
pub struct InvalidRecord {
    pub record: BusinessRecord,
    pub errors: Vec<String>,
}

pub struct Validator {
    rules: Vec<ValidationRule>,
}

impl Default for Validator {
    fn default() -> Self {
        Self {
            rules: default_rules(),
        }
    }
}

impl Validator {
    pub fn new(rules: Vec<ValidationRule>) -> Self {
        Self { rules }
    }

    /// Partition records into valid and invalid. Invalid records carry the
    /// full list of rule violations and are dropped from later stages.
    pub fn partition(&self, records: Vec<BusinessRecord>) -> (Vec<BusinessRecord>, Vec<InvalidRecord>) {
        let mut valid = Vec::with_capacity(records.len());
        let mut invalid = Vec::new();
        for record in records {
            let errors: Vec<String> = self
                .rules
                .iter()
                .filter(|rule| !(rule.predicate)(&record))
                .map(|rule| format!("{}: {}", rule.field, rule.message))
                .collect();
            if errors.is_empty() {
                valid.push(record);
            } else {
                invalid.push(InvalidRecord { record, errors });
            }
        }
        (valid, invalid)
    }
}

// ---------------------------------------------------------------------------
// Deduplication

/// Collapse records sharing a dedup key, keeping the record with the most
/// non-empty fields. Ties keep the first-seen record; first-seen order is
/// preserved in the output.
pub fn dedup_records(records: Vec<BusinessRecord>) -> Vec<BusinessRecord> {
    let mut order: Vec<String> = Vec::new();
    let mut by_key: HashMap<String, BusinessRecord> = HashMap::new();
    for record in records {
        let key = record.dedup_key();
        match by_key.get(&key) {
            None => {
                order.push(key.clone());
                by_key.insert(key, record);
            }
            Some(existing) => {
                if record.non_empty_field_count() > existing.non_empty_field_count() {
                    by_key.insert(key, record);
                }
            }
        }
    }
    order
        .into_iter()
        .filter_map(|key| by_key.remove(&key))
        .collect()
}

// ---------------------------------------------------------------------------
// Job registry

#[derive(Default)]
struct RegistryInner {
    jobs: VecDeque<IngestJob>,
    controls: HashMap<Uuid, watch::Sender<bool>>,
}

/// In-memory job history, capped at the last [`JOB_HISTORY_CAP`] entries.
/// Pause/resume is a per-job watch channel observed between batches.
#[derive(Default)]
pub struct JobRegistry {
    inner: Mutex<RegistryInner>,
}

impl JobRegistry {
    fn create(&self, sources: &[DataSource]) -> (Uuid, watch::Receiver<bool>) {
        let job = IngestJob {
            id: Uuid::new_v4(),
            sources: sources.iter().map(|s| s.name.clone()).collect(),
            state: JobState::Queued,
            results: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        };
        let id = job.id;
        let (tx, rx) = watch::channel(false);
        let mut inner = self.lock();
        inner.jobs.push_back(job);
        inner.controls.insert(id, tx);
        while inner.jobs.len() > JOB_HISTORY_CAP {
            if let Some(evicted) = inner.jobs.pop_front() {
                inner.controls.remove(&evicted.id);
            }
        }
        (id, rx)
    }

    fn set_state(&self, id: Uuid, state: JobState) {
        let mut inner = self.lock();
        if let Some(job) = inner.jobs.iter_mut().find(|j| j.id == id) {
            job.state = state;
        }
    }

    fn append_result(&self, id: Uuid, result: DownloadResult) {
        let mut inner = self.lock();
        if let Some(job) = inner.jobs.iter_mut().find(|j| j.id == id) {
            job.results.push(result);
        }
    }

    fn finish(&self, id: Uuid, success: bool) {
        let mut inner = self.lock();
        inner.controls.remove(&id);
        if let Some(job) = inner.jobs.iter_mut().find(|j| j.id == id) {
            job.state = if success {
                JobState::Completed
            } else {
                JobState::Failed
            };
            job.finished_at = Some(Utc::now());
        }
    }

    /// Request a pause. Takes effect at the next batch boundary; returns
    /// false once the job has finished.
    pub fn pause(&self, id: Uuid) -> bool {
        self.lock()
            .controls
            .get(&id)
            .map(|tx| tx.send(true).is_ok())
            .unwrap_or(false)
    }

    pub fn resume(&self, id: Uuid) -> bool {
        self.lock()
            .controls
            .get(&id)
            .map(|tx| tx.send(false).is_ok())
            .unwrap_or(false)
    }

    pub fn get(&self, id: Uuid) -> Option<IngestJob> {
        self.lock().jobs.iter().find(|j| j.id == id).cloned()
    }

    /// Jobs newest-first.
    pub fn list(&self) -> Vec<IngestJob> {
        self.lock().jobs.iter().rev().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        self.inner.lock().expect("job registry lock poisoned")
    }
}

// ---------------------------------------------------------------------------
// Source manager

struct InFlightGuard<'a> {
    manager: &'a SourceManager,
    source: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.manager
            .in_flight
            .lock()
            .expect("in-flight lock poisoned")
            .remove(&self.source);
    }
}

/// Orchestrates downloads: in-flight guarding, rate limiting, retry with
/// backoff, the normalize -> validate -> dedup -> persist pipeline, and
/// outcome recording. Owns its limiter and in-flight state; process-local.
pub struct SourceManager {
    config: RuntimeConfig,
    http: HttpFetcher,
    rate_limiter: RateLimiter,
    backoff: BackoffPolicy,
    inter_batch_delay: Duration,
    downloaders: HashMap<SourceType, Box<dyn Downloader>>,
    validator: Validator,
    store: Arc<dyn VendorStore>,
    monitor: Arc<MonitoringService>,
    in_flight: Mutex<HashSet<String>>,
    pub jobs: JobRegistry,
}

impl SourceManager {
    pub fn new(
        config: RuntimeConfig,
        store: Arc<dyn VendorStore>,
        monitor: Arc<MonitoringService>,
    ) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: config.user_agent.clone(),
        })?;
        let backoff = BackoffPolicy {
            max_attempts: config.retry_attempts.max(1),
            base_delay: Duration::from_secs(config.retry_delay_secs),
            ..Default::default()
        };
        let downloaders = [SourceType::File, SourceType::Api, SourceType::Web]
            .into_iter()
            .map(|t| (t, downloader_for(t)))
            .collect();
        Ok(Self {
            config,
            http,
            rate_limiter: RateLimiter::new(),
            backoff,
            inter_batch_delay: Duration::from_millis(500),
            downloaders,
            validator: Validator::default(),
            store,
            monitor,
            in_flight: Mutex::new(HashSet::new()),
            jobs: JobRegistry::default(),
        })
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_inter_batch_delay(mut self, delay: Duration) -> Self {
        self.inter_batch_delay = delay;
        self
    }

    pub fn with_downloader(mut self, downloader: Box<dyn Downloader>) -> Self {
        self.downloaders.insert(downloader.source_type(), downloader);
        self
    }

    /// Run one source end to end. Every failure mode is captured in the
    /// returned result; nothing is thrown past this boundary.
    pub async fn download_from_source(&self, source: &DataSource) -> DownloadResult {
        let started = Instant::now();

        {
            let mut in_flight = self.in_flight.lock().expect("in-flight lock poisoned");
            if !in_flight.insert(source.name.clone()) {
                return DownloadResult::failure(
                    &source.name,
                    vec![format!("download already in progress for {}", source.name)],
                    started.elapsed().as_millis() as u64,
                    0,
                );
            }
        }
        let _guard = InFlightGuard {
            manager: self,
            source: source.name.clone(),
        };

        let limit = source.rate_limit.unwrap_or(self.config.rate_limit_per_minute);
        if !self.rate_limiter.check_and_consume(&source.name, limit) {
            warn!(source = %source.name, limit, "rate limit exceeded");
            let result = DownloadResult::failure(
                &source.name,
                vec![format!("rate limit exceeded for {} ({limit}/min)", source.name)],
                started.elapsed().as_millis() as u64,
                0,
            );
            self.monitor.record_download(&result);
            return result;
        }

        let Some(downloader) = self.downloaders.get(&source.source_type) else {
            let result = DownloadResult::failure(
                &source.name,
                vec![format!("no downloader for source type {:?}", source.source_type)],
                started.elapsed().as_millis() as u64,
                0,
            );
            self.monitor.record_download(&result);
            return result;
        };

        let mut attempt_errors: Vec<String> = Vec::new();
        let mut fetched = None;
        let mut attempts = 0;
        for attempt in 1..=self.backoff.max_attempts {
            attempts = attempt;
            let outcome = downloader.fetch(source, &self.http).await;
            if outcome.is_failure() {
                attempt_errors.extend(
                    outcome
                        .errors
                        .into_iter()
                        .map(|e| format!("attempt {attempt}: {e}")),
                );
                if attempt < self.backoff.max_attempts {
                    tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                }
                continue;
            }
            fetched = Some(outcome);
            break;
        }

        let result = match fetched {
            None => DownloadResult::failure(
                &source.name,
                attempt_errors,
                started.elapsed().as_millis() as u64,
                attempts,
            ),
            Some(FetchOutcome {
                records,
                record_count,
                errors: fetch_errors,
            }) => {
                let mut errors = attempt_errors;
                errors.extend(fetch_errors);
                let records_saved = self.persist_records(source, &records, &mut errors).await;
                DownloadResult {
                    source: source.name.clone(),
                    success: true,
                    records_processed: record_count,
                    records_saved,
                    errors,
                    download_time_ms: started.elapsed().as_millis() as u64,
                    attempts,
                    completed_at: Utc::now(),
                }
            }
        };

        self.monitor.record_download(&result);
        info!(
            source = %source.name,
            success = result.success,
            processed = result.records_processed,
            saved = result.records_saved,
            attempts = result.attempts,
            "source download finished"
        );
        result
    }

    async fn persist_records(
        &self,
        source: &DataSource,
        raw_records: &[cvrs_core::RawRecord],
        errors: &mut Vec<String>,
    ) -> usize {
        if raw_records.is_empty() {
            return 0;
        }
        let mapper = FieldMapper::for_source(source);
        let normalized: Vec<BusinessRecord> =
            raw_records.iter().map(|raw| mapper.normalize(raw)).collect();

        let (valid, invalid) = self.validator.partition(normalized);
        self.monitor.record_validation(valid.len(), invalid.len());
        for rejected in &invalid {
            errors.push(format!(
                "validation: record {:?} rejected: {}",
                rejected.record.company_name,
                rejected.errors.join("; ")
            ));
        }

        let deduped = dedup_records(valid);
        let mut saved = 0;
        for chunk in deduped.chunks(self.config.batch_size.max(1)) {
            for record in chunk {
                match self.store.import_vendor(record.clone(), &source.name).await {
                    Ok(outcome) if outcome.created() => saved += 1,
                    Ok(_) => {}
                    Err(err) => errors.push(format!("persistence: {err}")),
                }
            }
        }
        saved
    }

    /// Run sources in fixed-size concurrency batches with all-settled
    /// semantics: one source's failure never aborts its siblings. Batches
    /// are strictly sequential with a fixed delay in between.
    pub async fn download_from_multiple_sources(
        &self,
        sources: &[DataSource],
    ) -> Vec<DownloadResult> {
        let mut results = Vec::with_capacity(sources.len());
        let batches: Vec<&[DataSource]> =
            sources.chunks(self.config.max_concurrent_sources.max(1)).collect();
        let batch_count = batches.len();
        for (index, batch) in batches.into_iter().enumerate() {
            let batch_results =
                join_all(batch.iter().map(|source| self.download_from_source(source))).await;
            results.extend(batch_results);
            if index + 1 < batch_count {
                tokio::time::sleep(self.inter_batch_delay).await;
            }
        }
        results
    }

    /// Run a registered job inline: used by the CLI and the job spawner.
    pub async fn run_job(&self, sources: Vec<DataSource>) -> IngestJob {
        let (job_id, pause_rx) = self.jobs.create(&sources);
        self.monitor.record_job_started(job_id);
        self.execute_job(job_id, pause_rx, sources).await;
        self.jobs.get(job_id).expect("job just finished")
    }

    /// Spawn a job and return its id immediately.
    pub fn start_job(self: Arc<Self>, sources: Vec<DataSource>) -> Uuid {
        // Register before spawning so the id is immediately queryable.
        let (job_id, pause_rx) = self.jobs.create(&sources);
        self.monitor.record_job_started(job_id);
        let manager = self;
        tokio::spawn(async move {
            manager.execute_job(job_id, pause_rx, sources).await;
        });
        job_id
    }

    async fn execute_job(
        &self,
        job_id: Uuid,
        mut pause_rx: watch::Receiver<bool>,
        sources: Vec<DataSource>,
    ) {
        self.jobs.set_state(job_id, JobState::Running);
        let batches: Vec<Vec<DataSource>> = sources
            .chunks(self.config.max_concurrent_sources.max(1))
            .map(|c| c.to_vec())
            .collect();
        let batch_count = batches.len();
        let mut all_success = true;
        for (index, batch) in batches.into_iter().enumerate() {
            // Pause requests take effect at batch boundaries.
            if *pause_rx.borrow() {
                self.jobs.set_state(job_id, JobState::Paused);
                while *pause_rx.borrow() {
                    if pause_rx.changed().await.is_err() {
                        break;
                    }
                }
                self.jobs.set_state(job_id, JobState::Running);
            }

            let batch_results =
                join_all(batch.iter().map(|source| self.download_from_source(source))).await;
            for result in batch_results {
                all_success &= result.success;
                self.jobs.append_result(job_id, result);
            }
            if index + 1 < batch_count {
                tokio::time::sleep(self.inter_batch_delay).await;
            }
        }

        self.jobs.finish(job_id, all_success);
        self.monitor.record_job_finished(job_id, all_success);
    }
}

// ---------------------------------------------------------------------------
// Scheduler

/// Optional periodic full ingestion, one run every `poll_interval_minutes`.
pub async fn maybe_build_scheduler(
    manager: Arc<SourceManager>,
    registry: &SourceRegistry,
    config: &RuntimeConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let scheduler = JobScheduler::new().await.context("creating scheduler")?;
    let interval = Duration::from_secs(config.poll_interval_minutes.max(1) * 60);
    let sources = registry.enabled();
    let job = Job::new_repeated_async(interval, move |_uuid, _lock| {
        let manager = manager.clone();
        let sources = sources.clone();
        Box::pin(async move {
            let job_id = manager.start_job(sources);
            info!(%job_id, "scheduled ingestion started");
        })
    })
    .context("creating repeated ingestion job")?;
    scheduler.add(job).await.context("adding ingestion job")?;
    Ok(Some(scheduler))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cvrs_adapters::FetchOutcome;
    use cvrs_monitor::MonitorConfig;
    use cvrs_storage::MemoryVendorStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn record(name: &str, id: Option<&str>, fields: usize) -> BusinessRecord {
        let mut record = BusinessRecord {
            company_name: name.to_string(),
            business_identifier: id.map(ToString::to_string),
            ..Default::default()
        };
        if fields >= 1 {
            record.address = Some("100 Main St".to_string());
        }
        if fields >= 2 {
            record.city = Some("Toronto".to_string());
        }
        if fields >= 3 {
            record.phone = Some("613-555-0199".to_string());
        }
        record
    }

    fn api_source(name: &str) -> DataSource {
        DataSource {
            name: name.to_string(),
            display_name: name.to_string(),
            url: format!("https://registry.example.ca/{name}"),
            source_type: SourceType::Api,
            format: None,
            enabled: true,
            rate_limit: None,
            field_mappings: [
                ("company_name".to_string(), vec!["name".to_string()]),
                ("business_identifier".to_string(), vec!["id".to_string()]),
                ("postal_code".to_string(), vec!["postal".to_string()]),
            ]
            .into_iter()
            .collect(),
            selectors: None,
            paginate: false,
            cost_per_run: 0.0,
            notes: None,
        }
    }

    fn raw(pairs: &[(&str, &str)]) -> cvrs_core::RawRecord {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    struct ScriptedDownloader {
        fail_first: u32,
        calls: AtomicU32,
        records: Vec<cvrs_core::RawRecord>,
    }

    #[async_trait]
    impl Downloader for ScriptedDownloader {
        fn source_type(&self) -> SourceType {
            SourceType::Api
        }

        async fn fetch(&self, _source: &DataSource, _http: &HttpFetcher) -> FetchOutcome {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_first {
                FetchOutcome::failure(format!("connection timed out (call {call})"))
            } else {
                FetchOutcome::from_records(self.records.clone())
            }
        }
    }

    fn test_manager(store: Arc<MemoryVendorStore>, downloader: ScriptedDownloader) -> SourceManager {
        let monitor = MonitoringService::new(MonitorConfig::default());
        SourceManager::new(RuntimeConfig::default(), store, monitor)
            .expect("manager")
            .with_backoff(BackoffPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(4),
            })
            .with_inter_batch_delay(Duration::from_millis(1))
            .with_downloader(Box::new(downloader))
    }

    #[test]
    fn validator_partitions_and_reports_all_violations() {
        let validator = Validator::default();
        let mut bad = record("", None, 1);
        bad.email = Some("not-an-email".to_string());
        let records = vec![record("Maple Widgets Inc", Some("1"), 2), bad];

        let (valid, invalid) = validator.partition(records);
        assert_eq!(valid.len(), 1);
        assert_eq!(invalid.len(), 1);
        assert_eq!(invalid[0].errors.len(), 2);
        assert!(invalid[0].errors[0].contains("company_name"));
    }

    #[test]
    fn dedup_keeps_the_most_complete_record() {
        let sparse = record("ABC Corp", Some("123456789"), 1);
        let rich = record("ABC Corp", Some("123456789"), 3);
        let other = record("Other Ltd", Some("555"), 1);

        let deduped = dedup_records(vec![sparse, rich.clone(), other.clone()]);
        assert_eq!(deduped, vec![rich, other]);
    }

    #[test]
    fn dedup_ties_keep_the_first_seen_record() {
        let first = record("ABC Corp", Some("123456789"), 2);
        let mut second = record("ABC Corp", Some("123456789"), 2);
        second.city = Some("Ottawa".to_string());

        let deduped = dedup_records(vec![first.clone(), second]);
        assert_eq!(deduped, vec![first]);
    }

    #[test]
    fn dedup_falls_back_to_name_plus_address() {
        let a = record("No Id Corp", None, 1);
        let b = record("No Id Corp", None, 2);
        let deduped = dedup_records(vec![a, b.clone()]);
        assert_eq!(deduped, vec![b]);
    }

    #[tokio::test]
    async fn retry_succeeds_after_transient_failures() {
        let store = Arc::new(MemoryVendorStore::new());
        let manager = test_manager(
            store.clone(),
            ScriptedDownloader {
                fail_first: 2,
                calls: AtomicU32::new(0),
                records: vec![raw(&[("name", "Maple Widgets Inc"), ("id", "123456789")])],
            },
        );

        let result = manager.download_from_source(&api_source("on-registry")).await;
        assert!(result.success);
        assert_eq!(result.attempts, 3);
        assert_eq!(result.records_saved, 1);
        // Errors from the failed attempts stay visible in the result.
        assert_eq!(result.errors.len(), 2);
    }

    #[tokio::test]
    async fn retry_exhaustion_reports_every_attempt() {
        let store = Arc::new(MemoryVendorStore::new());
        let manager = test_manager(
            store,
            ScriptedDownloader {
                fail_first: u32::MAX,
                calls: AtomicU32::new(0),
                records: vec![],
            },
        );

        let result = manager.download_from_source(&api_source("on-registry")).await;
        assert!(!result.success);
        assert_eq!(result.attempts, 3);
        assert_eq!(result.errors.len(), 3);
        assert!(result.errors.iter().all(|e| e.contains("timed out")));
    }

    #[tokio::test]
    async fn rate_limited_sources_fail_without_retry() {
        let store = Arc::new(MemoryVendorStore::new());
        let manager = test_manager(
            store,
            ScriptedDownloader {
                fail_first: 0,
                calls: AtomicU32::new(0),
                records: vec![],
            },
        );
        let mut source = api_source("on-registry");
        source.rate_limit = Some(0);

        let result = manager.download_from_source(&source).await;
        assert!(!result.success);
        assert_eq!(result.attempts, 0);
        assert!(result.errors[0].contains("rate limit exceeded"));
    }

    #[tokio::test]
    async fn concurrent_reentry_on_one_source_is_rejected() {
        struct SlowDownloader;

        #[async_trait]
        impl Downloader for SlowDownloader {
            fn source_type(&self) -> SourceType {
                SourceType::Api
            }

            async fn fetch(&self, _source: &DataSource, _http: &HttpFetcher) -> FetchOutcome {
                tokio::time::sleep(Duration::from_millis(50)).await;
                FetchOutcome::from_records(vec![])
            }
        }

        let store = Arc::new(MemoryVendorStore::new());
        let monitor = MonitoringService::new(MonitorConfig::default());
        let manager = SourceManager::new(RuntimeConfig::default(), store, monitor)
            .expect("manager")
            .with_downloader(Box::new(SlowDownloader));
        let source = api_source("on-registry");

        let (first, second) = tokio::join!(
            manager.download_from_source(&source),
            manager.download_from_source(&source)
        );
        let rejected = [&first, &second]
            .iter()
            .filter(|r| r.errors.iter().any(|e| e.contains("already in progress")))
            .count();
        assert_eq!(rejected, 1);
    }

    #[tokio::test]
    async fn ingesting_duplicate_raw_records_persists_one_profile() {
        let store = Arc::new(MemoryVendorStore::new());
        let manager = test_manager(
            store.clone(),
            ScriptedDownloader {
                fail_first: 0,
                calls: AtomicU32::new(0),
                records: vec![
                    raw(&[("name", "ABC Corp"), ("id", "123456789"), ("postal", "m5v2t6")]),
                    raw(&[("name", "ABC Corp"), ("id", "123456789"), ("postal", "")]),
                ],
            },
        );

        let result = manager.download_from_source(&api_source("on-registry")).await;
        assert!(result.success);
        assert_eq!(result.records_processed, 2);
        assert_eq!(result.records_saved, 1);

        assert_eq!(store.vendor_count().await.expect("count"), 1);
        let vendor = store
            .get_vendor_by_identifier("123456789")
            .await
            .expect("lookup")
            .expect("present");
        assert_eq!(vendor.record.postal_code.as_deref(), Some("M5V 2T6"));
        assert_eq!(vendor.verification_status, "unverified");
        assert!(vendor.owner_user_id.is_none());

        let provenance = store.provenance_for(vendor.id).await.expect("provenance");
        let fields: Vec<&str> = provenance.iter().map(|p| p.field_name.as_str()).collect();
        assert!(fields.contains(&"company_name"));
        assert!(fields.contains(&"business_identifier"));
        assert!(fields.contains(&"postal_code"));
    }

    #[tokio::test]
    async fn run_job_tracks_results_and_completion() {
        let store = Arc::new(MemoryVendorStore::new());
        let manager = test_manager(
            store,
            ScriptedDownloader {
                fail_first: 0,
                calls: AtomicU32::new(0),
                records: vec![raw(&[("name", "Maple Widgets Inc"), ("id", "42")])],
            },
        );

        let job = manager
            .run_job(vec![api_source("on-registry"), api_source("fed-corporations")])
            .await;
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.results.len(), 2);
        assert!(job.finished_at.is_some());
        assert_eq!(manager.jobs.list().len(), 1);
    }

    #[tokio::test]
    async fn pause_flags_flip_until_the_job_finishes() {
        let registry = JobRegistry::default();
        let (id, rx) = registry.create(&[api_source("on-registry")]);
        assert!(registry.pause(id));
        assert!(*rx.borrow());
        assert!(registry.resume(id));
        assert!(!*rx.borrow());

        registry.finish(id, true);
        drop(rx);
        assert!(!registry.pause(id));
        assert_eq!(registry.get(id).expect("job").state, JobState::Completed);
    }
}
