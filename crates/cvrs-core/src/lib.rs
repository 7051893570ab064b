//! Core domain model and runtime configuration for CVRS.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cvrs-core";

/// Method string recorded on every provenance entry created by ingestion.
pub const IMPORT_METHOD: &str = "Government Registry Import";

/// Canonical field names of a [`BusinessRecord`], in mapping order.
pub const CANONICAL_FIELDS: &[&str] = &[
    "company_name",
    "business_identifier",
    "address",
    "city",
    "province",
    "postal_code",
    "phone",
    "email",
    "website",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    File,
    Api,
    Web,
}

/// Declared document format for file-type sources.
///
/// ZIP is deliberately not a variant: the upstream system declared it but
/// never extracted archives, so a ZIP feed must be configured as the URL of
/// its extracted CSV/JSON document instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    Csv,
    Json,
    Xml,
}

/// CSS selector configuration for web-scrape sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebSelectors {
    /// Selector matching one record row.
    pub row: String,
    /// Canonical field name -> selector evaluated within the row.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<DataSource>,
}

impl SourceRegistry {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, serde_yaml::Error> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(<serde_yaml::Error as serde::de::Error>::custom)?;
        serde_yaml::from_str(&text)
    }

    pub fn enabled(&self) -> Vec<DataSource> {
        self.sources.iter().filter(|s| s.enabled).cloned().collect()
    }

    pub fn find(&self, name: &str) -> Option<&DataSource> {
        self.sources.iter().find(|s| s.name == name)
    }
}

/// Static per-source configuration, loaded at startup and immutable during
/// a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSource {
    pub name: String,
    pub display_name: String,
    pub url: String,
    pub source_type: SourceType,
    #[serde(default)]
    pub format: Option<SourceFormat>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Requests per minute; falls back to the runtime default when absent.
    #[serde(default)]
    pub rate_limit: Option<u32>,
    /// Canonical field name -> priority-ordered candidate source keys.
    #[serde(default)]
    pub field_mappings: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub selectors: Option<WebSelectors>,
    #[serde(default)]
    pub paginate: bool,
    /// Static cost per run in dollars; zero for open government feeds.
    #[serde(default)]
    pub cost_per_run: f64,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Source-native key/value map, discarded after normalization.
pub type RawRecord = BTreeMap<String, String>;

/// Canonical business record produced by the normalizer.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BusinessRecord {
    pub company_name: String,
    pub business_identifier: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub province: Option<String>,
    pub postal_code: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub website: Option<String>,
}

impl BusinessRecord {
    /// Completeness heuristic used by the deduplicator.
    pub fn non_empty_field_count(&self) -> usize {
        let opt = |v: &Option<String>| {
            v.as_deref().map(|s| !s.trim().is_empty()).unwrap_or(false)
        };
        usize::from(!self.company_name.trim().is_empty())
            + usize::from(opt(&self.business_identifier))
            + usize::from(opt(&self.address))
            + usize::from(opt(&self.city))
            + usize::from(opt(&self.province))
            + usize::from(opt(&self.postal_code))
            + usize::from(opt(&self.phone))
            + usize::from(opt(&self.email))
            + usize::from(opt(&self.website))
    }

    /// Dedup key: business identifier when present, otherwise company name
    /// plus address.
    pub fn dedup_key(&self) -> String {
        match self.business_identifier.as_deref() {
            Some(id) if !id.trim().is_empty() => id.trim().to_ascii_lowercase(),
            _ => format!(
                "{}|{}",
                self.company_name.trim().to_ascii_lowercase(),
                self.address.as_deref().unwrap_or("").trim().to_ascii_lowercase()
            ),
        }
    }

    /// (field name, value) pairs for non-empty fields, in canonical order.
    pub fn populated_fields(&self) -> Vec<(&'static str, String)> {
        let mut out = Vec::new();
        if !self.company_name.trim().is_empty() {
            out.push(("company_name", self.company_name.clone()));
        }
        let mut push = |name: &'static str, value: &Option<String>| {
            if let Some(v) = value.as_deref() {
                if !v.trim().is_empty() {
                    out.push((name, v.to_string()));
                }
            }
        };
        push("business_identifier", &self.business_identifier);
        push("address", &self.address);
        push("city", &self.city);
        push("province", &self.province);
        push("postal_code", &self.postal_code);
        push("phone", &self.phone);
        push("email", &self.email);
        push("website", &self.website);
        out
    }
}

/// Persisted vendor profile. Ingestion creates unclaimed stubs
/// (`owner_user_id: None`); the claim workflow attaches an owner later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VendorProfile {
    pub id: Uuid,
    pub owner_user_id: Option<Uuid>,
    pub verification_status: String,
    pub data_source: String,
    pub is_active: bool,
    #[serde(flatten)]
    pub record: BusinessRecord,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VendorProfile {
    pub fn stub_from_record(record: BusinessRecord, source_name: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_user_id: None,
            verification_status: "unverified".to_string(),
            data_source: source_name.to_string(),
            is_active: true,
            record,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_claimed(&self) -> bool {
        self.owner_user_id.is_some()
    }
}

/// Audit record stating which external source supplied a field's value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceEntry {
    pub vendor_id: Uuid,
    pub field_name: String,
    pub source: String,
    pub method: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub vendor_id: Uuid,
    pub action: String,
    pub actor: String,
    pub immutable: bool,
    pub created_at: DateTime<Utc>,
}

/// Per-source-run outcome. Append-only: never updated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadResult {
    pub source: String,
    pub success: bool,
    pub records_processed: usize,
    pub records_saved: usize,
    pub errors: Vec<String>,
    pub download_time_ms: u64,
    pub attempts: u32,
    pub completed_at: DateTime<Utc>,
}

impl DownloadResult {
    pub fn failure(source: &str, errors: Vec<String>, elapsed_ms: u64, attempts: u32) -> Self {
        Self {
            source: source.to_string(),
            success: false,
            records_processed: 0,
            records_saved: 0,
            errors,
            download_time_ms: elapsed_ms,
            attempts,
            completed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
}

/// One ingestion run (full or single-source) tracked by the job registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestJob {
    pub id: Uuid,
    pub sources: Vec<String>,
    pub state: JobState,
    pub results: Vec<DownloadResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl IngestJob {
    pub fn records_processed(&self) -> usize {
        self.results.iter().map(|r| r.records_processed).sum()
    }

    pub fn records_saved(&self) -> usize {
        self.results.iter().map(|r| r.records_saved).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringAlert {
    pub id: Uuid,
    /// Stable condition key used for de-duplication and resolution.
    pub key: String,
    pub severity: AlertSeverity,
    pub alert_type: String,
    pub message: String,
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub resolved: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub jobs_running: usize,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub api_success_rate: f64,
    pub data_quality_score: f64,
    pub memory_bytes: u64,
}

/// Single-use claim token. Only the sha256 hash of the plaintext token is
/// ever stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimToken {
    pub token_hash: String,
    pub vendor_id: Uuid,
    pub email: String,
    pub expires_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub max_attempts: u32,
}

/// Numeric knobs plus ambient settings, all env-defaulted.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub poll_interval_minutes: u64,
    pub batch_size: usize,
    pub retry_attempts: u32,
    pub retry_delay_secs: u64,
    pub max_concurrent_sources: usize,
    pub rate_limit_per_minute: u32,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub database_url: Option<String>,
    pub web_port: u16,
    pub sources_path: PathBuf,
    pub scheduler_enabled: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            poll_interval_minutes: 60,
            batch_size: 100,
            retry_attempts: 3,
            retry_delay_secs: 5,
            max_concurrent_sources: 3,
            rate_limit_per_minute: 30,
            http_timeout_secs: 20,
            user_agent: "cvrs-bot/0.1".to_string(),
            database_url: None,
            web_port: 8000,
            sources_path: PathBuf::from("sources.yaml"),
            scheduler_enabled: false,
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            poll_interval_minutes: env_parse("CVRS_POLL_INTERVAL_MINUTES", defaults.poll_interval_minutes),
            batch_size: env_parse("CVRS_BATCH_SIZE", defaults.batch_size),
            retry_attempts: env_parse("CVRS_RETRY_ATTEMPTS", defaults.retry_attempts),
            retry_delay_secs: env_parse("CVRS_RETRY_DELAY_SECS", defaults.retry_delay_secs),
            max_concurrent_sources: env_parse("CVRS_MAX_CONCURRENT_SOURCES", defaults.max_concurrent_sources)
                .max(1),
            rate_limit_per_minute: env_parse("CVRS_RATE_LIMIT_PER_MINUTE", defaults.rate_limit_per_minute),
            http_timeout_secs: env_parse("CVRS_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            user_agent: std::env::var("CVRS_USER_AGENT").unwrap_or(defaults.user_agent),
            database_url: std::env::var("DATABASE_URL").ok(),
            web_port: env_parse("CVRS_WEB_PORT", defaults.web_port),
            sources_path: std::env::var("CVRS_SOURCES_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.sources_path),
            scheduler_enabled: std::env::var("CVRS_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
