//! HTTP fetch utilities, rate limiting, and vendor persistence for CVRS.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use cvrs_core::{
    AuditLogEntry, BusinessRecord, ClaimToken, ProvenanceEntry, VendorProfile, IMPORT_METHOD,
};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPool;
use sqlx::Row;
use thiserror::Error;
use tracing::{info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cvrs-storage";

// ---------------------------------------------------------------------------
// HTTP fetch

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Exponential backoff: `delay = base * 2^(attempt-1)`, capped at `max_delay`.
/// Attempts are numbered from 1.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(120),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: "cvrs-bot/0.1".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, FetchError::HttpStatus { status: 404, .. })
    }
}

/// Single-shot reqwest wrapper with an explicit per-request timeout.
///
/// Retries belong to the source manager's backoff wrapper, not here; the
/// fetcher only classifies failures so the caller can decide.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .build()
            .context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn get(&self, source_name: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        self.get_with_accept(source_name, url, None).await
    }

    /// GET with `Accept: application/json`, for API sources.
    pub async fn get_json(&self, source_name: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        self.get_with_accept(source_name, url, Some("application/json")).await
    }

    async fn get_with_accept(
        &self,
        source_name: &str,
        url: &str,
        accept: Option<&str>,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source_name, url);
        let mut request = self.client.get(url);
        if let Some(accept) = accept {
            request = request.header(reqwest::header::ACCEPT, accept);
        }

        async move {
            let resp = request.send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            let body = resp.bytes().await?.to_vec();
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

// ---------------------------------------------------------------------------
// Rate limiting

#[derive(Debug, Clone, Copy)]
struct WindowState {
    count: u32,
    started: Instant,
}

/// Per-source fixed-window request counter.
///
/// The counter resets abruptly when the window elapses, so a burst at the
/// boundary can reach twice the nominal limit. Callers must treat `false`
/// as abort-or-requeue; there is no blocking or waiting.
#[derive(Debug)]
pub struct RateLimiter {
    windows: Mutex<HashMap<String, WindowState>>,
    window: Duration,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_window(Duration::from_secs(60))
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            window,
        }
    }

    pub fn check_and_consume(&self, source_key: &str, limit_per_window: u32) -> bool {
        let mut windows = self.windows.lock().expect("rate limiter lock poisoned");
        let now = Instant::now();
        let state = windows.entry(source_key.to_string()).or_insert(WindowState {
            count: 0,
            started: now,
        });
        if now.duration_since(state.started) >= self.window {
            state.count = 0;
            state.started = now;
        }
        if state.count < limit_per_window {
            state.count += 1;
            true
        } else {
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Persistence

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("vendor {0} not found")]
    VendorNotFound(Uuid),
    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

/// Result of an insert-if-absent import. `AlreadyPresent` is a no-op by
/// design: later runs never refresh an existing stub's fields.
#[derive(Debug, Clone)]
pub enum ImportOutcome {
    Created(VendorProfile),
    AlreadyPresent,
}

impl ImportOutcome {
    pub fn created(&self) -> bool {
        matches!(self, ImportOutcome::Created(_))
    }
}

/// Abstract persistence contract consumed by the ingestion core.
#[async_trait]
pub trait VendorStore: Send + Sync {
    async fn get_vendor_by_identifier(
        &self,
        identifier: &str,
    ) -> Result<Option<VendorProfile>, StoreError>;

    async fn get_vendor(&self, id: Uuid) -> Result<Option<VendorProfile>, StoreError>;

    /// Insert-if-absent with provenance and audit writes, atomic per record.
    async fn import_vendor(
        &self,
        record: BusinessRecord,
        source_name: &str,
    ) -> Result<ImportOutcome, StoreError>;

    async fn set_vendor_owner(&self, vendor_id: Uuid, owner: Uuid) -> Result<(), StoreError>;

    async fn append_audit(&self, entry: AuditLogEntry) -> Result<(), StoreError>;

    async fn provenance_for(&self, vendor_id: Uuid) -> Result<Vec<ProvenanceEntry>, StoreError>;

    async fn create_claim_token(&self, token: ClaimToken) -> Result<(), StoreError>;

    async fn get_claim_token(&self, token_hash: &str) -> Result<Option<ClaimToken>, StoreError>;

    async fn update_claim_token(&self, token: ClaimToken) -> Result<(), StoreError>;

    async fn vendor_count(&self) -> Result<u64, StoreError>;
}

fn provenance_for_record(vendor: &VendorProfile, source_name: &str) -> Vec<ProvenanceEntry> {
    vendor
        .record
        .populated_fields()
        .into_iter()
        .map(|(field_name, _)| ProvenanceEntry {
            vendor_id: vendor.id,
            field_name: field_name.to_string(),
            source: source_name.to_string(),
            method: IMPORT_METHOD.to_string(),
        })
        .collect()
}

fn import_audit_entry(vendor_id: Uuid, source_name: &str) -> AuditLogEntry {
    AuditLogEntry {
        vendor_id,
        action: "vendor_imported".to_string(),
        actor: format!("system:ingestion:{source_name}"),
        immutable: true,
        created_at: Utc::now(),
    }
}

// ---------------------------------------------------------------------------
// In-memory store

#[derive(Default)]
struct MemoryInner {
    vendors: HashMap<Uuid, VendorProfile>,
    by_identifier: HashMap<String, Uuid>,
    provenance: Vec<ProvenanceEntry>,
    audit: Vec<AuditLogEntry>,
    tokens: HashMap<String, ClaimToken>,
}

/// In-memory [`VendorStore`] used in tests and DATABASE_URL-less operation.
#[derive(Default)]
pub struct MemoryVendorStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryVendorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn audit_entries(&self) -> Vec<AuditLogEntry> {
        self.inner.lock().expect("store lock poisoned").audit.clone()
    }
}

#[async_trait]
impl VendorStore for MemoryVendorStore {
    async fn get_vendor_by_identifier(
        &self,
        identifier: &str,
    ) -> Result<Option<VendorProfile>, StoreError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        Ok(inner
            .by_identifier
            .get(identifier)
            .and_then(|id| inner.vendors.get(id))
            .cloned())
    }

    async fn get_vendor(&self, id: Uuid) -> Result<Option<VendorProfile>, StoreError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        Ok(inner.vendors.get(&id).cloned())
    }

    async fn import_vendor(
        &self,
        record: BusinessRecord,
        source_name: &str,
    ) -> Result<ImportOutcome, StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        if let Some(identifier) = record.business_identifier.as_deref() {
            if inner.by_identifier.contains_key(identifier) {
                return Ok(ImportOutcome::AlreadyPresent);
            }
        }
        let profile = VendorProfile::stub_from_record(record, source_name);
        if let Some(identifier) = profile.record.business_identifier.clone() {
            inner.by_identifier.insert(identifier, profile.id);
        }
        let provenance = provenance_for_record(&profile, source_name);
        inner.provenance.extend(provenance);
        inner.audit.push(import_audit_entry(profile.id, source_name));
        inner.vendors.insert(profile.id, profile.clone());
        Ok(ImportOutcome::Created(profile))
    }

    async fn set_vendor_owner(&self, vendor_id: Uuid, owner: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let vendor = inner
            .vendors
            .get_mut(&vendor_id)
            .ok_or(StoreError::VendorNotFound(vendor_id))?;
        vendor.owner_user_id = Some(owner);
        vendor.updated_at = Utc::now();
        Ok(())
    }

    async fn append_audit(&self, entry: AuditLogEntry) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        inner.audit.push(entry);
        Ok(())
    }

    async fn provenance_for(&self, vendor_id: Uuid) -> Result<Vec<ProvenanceEntry>, StoreError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        Ok(inner
            .provenance
            .iter()
            .filter(|p| p.vendor_id == vendor_id)
            .cloned()
            .collect())
    }

    async fn create_claim_token(&self, token: ClaimToken) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        inner.tokens.insert(token.token_hash.clone(), token);
        Ok(())
    }

    async fn get_claim_token(&self, token_hash: &str) -> Result<Option<ClaimToken>, StoreError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        Ok(inner.tokens.get(token_hash).cloned())
    }

    async fn update_claim_token(&self, token: ClaimToken) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        inner.tokens.insert(token.token_hash.clone(), token);
        Ok(())
    }

    async fn vendor_count(&self) -> Result<u64, StoreError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        Ok(inner.vendors.len() as u64)
    }
}

// ---------------------------------------------------------------------------
// Postgres store

/// Postgres-backed [`VendorStore`] using runtime-bound queries.
pub struct PgVendorStore {
    pool: PgPool,
}

impl PgVendorStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self::new(pool))
    }
}

fn vendor_from_row(row: &sqlx::postgres::PgRow) -> Result<VendorProfile, sqlx::Error> {
    Ok(VendorProfile {
        id: row.try_get("id")?,
        owner_user_id: row.try_get("owner_user_id")?,
        verification_status: row.try_get("verification_status")?,
        data_source: row.try_get("data_source")?,
        is_active: row.try_get("is_active")?,
        record: BusinessRecord {
            company_name: row.try_get("company_name")?,
            business_identifier: row.try_get("business_identifier")?,
            address: row.try_get("address")?,
            city: row.try_get("city")?,
            province: row.try_get("province")?,
            postal_code: row.try_get("postal_code")?,
            phone: row.try_get("phone")?,
            email: row.try_get("email")?,
            website: row.try_get("website")?,
        },
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn token_from_row(row: &sqlx::postgres::PgRow) -> Result<ClaimToken, sqlx::Error> {
    let attempts: i32 = row.try_get("attempts")?;
    let max_attempts: i32 = row.try_get("max_attempts")?;
    Ok(ClaimToken {
        token_hash: row.try_get("token_hash")?,
        vendor_id: row.try_get("vendor_id")?,
        email: row.try_get("email")?,
        expires_at: row.try_get("expires_at")?,
        claimed_at: row.try_get("claimed_at")?,
        attempts: attempts.max(0) as u32,
        max_attempts: max_attempts.max(0) as u32,
    })
}

const SELECT_VENDOR: &str = r#"
SELECT id, owner_user_id, verification_status, data_source, is_active,
       company_name, business_identifier, address, city, province,
       postal_code, phone, email, website, created_at, updated_at
  FROM vendor_profiles
"#;

#[async_trait]
impl VendorStore for PgVendorStore {
    async fn get_vendor_by_identifier(
        &self,
        identifier: &str,
    ) -> Result<Option<VendorProfile>, StoreError> {
        let row = sqlx::query(&format!("{SELECT_VENDOR} WHERE business_identifier = $1"))
            .bind(identifier)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref()
            .map(vendor_from_row)
            .transpose()
            .map_err(StoreError::from)
    }

    async fn get_vendor(&self, id: Uuid) -> Result<Option<VendorProfile>, StoreError> {
        let row = sqlx::query(&format!("{SELECT_VENDOR} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref()
            .map(vendor_from_row)
            .transpose()
            .map_err(StoreError::from)
    }

    async fn import_vendor(
        &self,
        record: BusinessRecord,
        source_name: &str,
    ) -> Result<ImportOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        if let Some(identifier) = record.business_identifier.as_deref() {
            let existing =
                sqlx::query("SELECT id FROM vendor_profiles WHERE business_identifier = $1")
                    .bind(identifier)
                    .fetch_optional(&mut *tx)
                    .await?;
            if existing.is_some() {
                tx.rollback().await?;
                return Ok(ImportOutcome::AlreadyPresent);
            }
        }

        let profile = VendorProfile::stub_from_record(record, source_name);
        sqlx::query(
            r#"
            INSERT INTO vendor_profiles
                (id, owner_user_id, verification_status, data_source, is_active,
                 company_name, business_identifier, address, city, province,
                 postal_code, phone, email, website, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(profile.id)
        .bind(profile.owner_user_id)
        .bind(&profile.verification_status)
        .bind(&profile.data_source)
        .bind(profile.is_active)
        .bind(&profile.record.company_name)
        .bind(&profile.record.business_identifier)
        .bind(&profile.record.address)
        .bind(&profile.record.city)
        .bind(&profile.record.province)
        .bind(&profile.record.postal_code)
        .bind(&profile.record.phone)
        .bind(&profile.record.email)
        .bind(&profile.record.website)
        .bind(profile.created_at)
        .bind(profile.updated_at)
        .execute(&mut *tx)
        .await?;

        for entry in provenance_for_record(&profile, source_name) {
            sqlx::query(
                r#"
                INSERT INTO provenance_entries (vendor_id, field_name, source, method)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(entry.vendor_id)
            .bind(&entry.field_name)
            .bind(&entry.source)
            .bind(&entry.method)
            .execute(&mut *tx)
            .await?;
        }

        let audit = import_audit_entry(profile.id, source_name);
        sqlx::query(
            r#"
            INSERT INTO audit_log (vendor_id, action, actor, immutable, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(audit.vendor_id)
        .bind(&audit.action)
        .bind(&audit.actor)
        .bind(audit.immutable)
        .bind(audit.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(ImportOutcome::Created(profile))
    }

    async fn set_vendor_owner(&self, vendor_id: Uuid, owner: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE vendor_profiles SET owner_user_id = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(vendor_id)
        .bind(owner)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::VendorNotFound(vendor_id));
        }
        Ok(())
    }

    async fn append_audit(&self, entry: AuditLogEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (vendor_id, action, actor, immutable, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(entry.vendor_id)
        .bind(&entry.action)
        .bind(&entry.actor)
        .bind(entry.immutable)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn provenance_for(&self, vendor_id: Uuid) -> Result<Vec<ProvenanceEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT vendor_id, field_name, source, method
              FROM provenance_entries
             WHERE vendor_id = $1
             ORDER BY field_name
            "#,
        )
        .bind(vendor_id)
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(ProvenanceEntry {
                vendor_id: row.try_get("vendor_id")?,
                field_name: row.try_get("field_name")?,
                source: row.try_get("source")?,
                method: row.try_get("method")?,
            });
        }
        Ok(out)
    }

    async fn create_claim_token(&self, token: ClaimToken) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO claim_tokens
                (token_hash, vendor_id, email, expires_at, claimed_at, attempts, max_attempts)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&token.token_hash)
        .bind(token.vendor_id)
        .bind(&token.email)
        .bind(token.expires_at)
        .bind(token.claimed_at)
        .bind(token.attempts as i32)
        .bind(token.max_attempts as i32)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_claim_token(&self, token_hash: &str) -> Result<Option<ClaimToken>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT token_hash, vendor_id, email, expires_at, claimed_at, attempts, max_attempts
              FROM claim_tokens
             WHERE token_hash = $1
            "#,
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref()
            .map(token_from_row)
            .transpose()
            .map_err(StoreError::from)
    }

    async fn update_claim_token(&self, token: ClaimToken) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE claim_tokens
               SET claimed_at = $2, attempts = $3
             WHERE token_hash = $1
            "#,
        )
        .bind(&token.token_hash)
        .bind(token.claimed_at)
        .bind(token.attempts as i32)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn vendor_count(&self) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM vendor_profiles")
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n.max(0) as u64)
    }
}

// ---------------------------------------------------------------------------
// Claim workflow

#[derive(Debug, Error)]
pub enum ClaimError {
    #[error("unknown claim token")]
    UnknownToken,
    #[error("claim token expired")]
    Expired,
    #[error("claim token already used")]
    AlreadyClaimed,
    #[error("too many verification attempts")]
    TooManyAttempts,
    #[error("vendor profile is already owned")]
    VendorAlreadyOwned,
    #[error("vendor {0} not found")]
    VendorMissing(Uuid),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub fn hash_token(plaintext: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(plaintext.as_bytes());
    hex::encode(hasher.finalize())
}

fn generate_token() -> String {
    format!(
        "{}{}",
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    )
}

/// Issues and verifies single-use, time-limited claim tokens that associate
/// a stub profile with an authenticated user.
pub struct ClaimService {
    store: Arc<dyn VendorStore>,
    ttl: chrono::Duration,
    max_attempts: u32,
}

impl ClaimService {
    pub fn new(store: Arc<dyn VendorStore>) -> Self {
        Self {
            store,
            ttl: chrono::Duration::hours(48),
            max_attempts: 5,
        }
    }

    pub fn with_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Create a token for the vendor and return the plaintext exactly once.
    pub async fn initiate(&self, vendor_id: Uuid, email: &str) -> Result<String, ClaimError> {
        let vendor = self
            .store
            .get_vendor(vendor_id)
            .await?
            .ok_or(ClaimError::VendorMissing(vendor_id))?;
        if vendor.is_claimed() {
            return Err(ClaimError::VendorAlreadyOwned);
        }

        let plaintext = generate_token();
        let token = ClaimToken {
            token_hash: hash_token(&plaintext),
            vendor_id,
            email: email.to_string(),
            expires_at: Utc::now() + self.ttl,
            claimed_at: None,
            attempts: 0,
            max_attempts: self.max_attempts,
        };
        self.store.create_claim_token(token).await?;
        Ok(plaintext)
    }

    /// Consume the token: on success the vendor gains an owner and the token
    /// is marked claimed. Every failure path leaves the vendor untouched.
    pub async fn verify(&self, plaintext: &str, user_id: Uuid) -> Result<VendorProfile, ClaimError> {
        let hash = hash_token(plaintext);
        let mut token = self
            .store
            .get_claim_token(&hash)
            .await?
            .ok_or(ClaimError::UnknownToken)?;

        if token.claimed_at.is_some() {
            return Err(ClaimError::AlreadyClaimed);
        }

        token.attempts += 1;
        self.store.update_claim_token(token.clone()).await?;

        if token.attempts > token.max_attempts {
            return Err(ClaimError::TooManyAttempts);
        }
        if token.expires_at < Utc::now() {
            return Err(ClaimError::Expired);
        }

        let vendor = self
            .store
            .get_vendor(token.vendor_id)
            .await?
            .ok_or(ClaimError::VendorMissing(token.vendor_id))?;
        if vendor.is_claimed() {
            return Err(ClaimError::VendorAlreadyOwned);
        }

        self.store.set_vendor_owner(token.vendor_id, user_id).await?;
        token.claimed_at = Some(Utc::now());
        self.store.update_claim_token(token.clone()).await?;
        self.store
            .append_audit(AuditLogEntry {
                vendor_id: token.vendor_id,
                action: "vendor_claimed".to_string(),
                actor: format!("user:{user_id}"),
                immutable: true,
                created_at: Utc::now(),
            })
            .await?;

        self.store
            .get_vendor(token.vendor_id)
            .await?
            .ok_or(ClaimError::VendorMissing(token.vendor_id))
    }
}
