//! Downloader variants and the field mapper / normalizer for CVRS.

use std::collections::BTreeMap;

use async_trait::async_trait;
use cvrs_core::{BusinessRecord, DataSource, RawRecord, SourceFormat, SourceType};
use cvrs_storage::{FetchError, HttpFetcher};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value as JsonValue;
use tracing::warn;

pub const CRATE_NAME: &str = "cvrs-adapters";

const MAX_PAGES: usize = 25;

/// Raw outcome of one downloader invocation. Failures are captured as data;
/// `fetch` never panics and transport errors never escape as `Err`.
#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    pub records: Vec<RawRecord>,
    /// Usually `records.len()`; XML sources report a tag-count heuristic
    /// with no extracted records.
    pub record_count: usize,
    pub errors: Vec<String>,
}

impl FetchOutcome {
    pub fn from_records(records: Vec<RawRecord>) -> Self {
        Self {
            record_count: records.len(),
            records,
            errors: Vec::new(),
        }
    }

    pub fn failure(message: String) -> Self {
        Self {
            records: Vec::new(),
            record_count: 0,
            errors: vec![message],
        }
    }

    /// A fetch that produced neither records nor a count is a failure the
    /// source manager may retry.
    pub fn is_failure(&self) -> bool {
        !self.errors.is_empty() && self.record_count == 0
    }
}

#[async_trait]
pub trait Downloader: Send + Sync {
    fn source_type(&self) -> SourceType;

    async fn fetch(&self, source: &DataSource, http: &HttpFetcher) -> FetchOutcome;
}

pub fn downloader_for(source_type: SourceType) -> Box<dyn Downloader> {
    match source_type {
        SourceType::File => Box::new(FileDownloader),
        SourceType::Api => Box::new(ApiDownloader),
        SourceType::Web => Box::new(WebDownloader),
    }
}

// ---------------------------------------------------------------------------
// File downloader

pub struct FileDownloader;

#[async_trait]
impl Downloader for FileDownloader {
    fn source_type(&self) -> SourceType {
        SourceType::File
    }

    async fn fetch(&self, source: &DataSource, http: &HttpFetcher) -> FetchOutcome {
        let resp = match http.get(&source.name, &source.url).await {
            Ok(resp) => resp,
            Err(err) => return FetchOutcome::failure(fetch_error_message(&err)),
        };
        let Some(format) = source.format else {
            return FetchOutcome::failure(format!(
                "file source {} declares no format",
                source.name
            ));
        };
        parse_file_document(format, &resp.body)
    }
}

pub fn parse_file_document(format: SourceFormat, body: &[u8]) -> FetchOutcome {
    match format {
        SourceFormat::Csv => parse_csv_records(body),
        SourceFormat::Json => parse_json_records(body),
        SourceFormat::Xml => {
            let count = xml_record_count(body);
            FetchOutcome {
                records: Vec::new(),
                record_count: count,
                errors: if count == 0 {
                    vec!["no repeated XML elements found".to_string()]
                } else {
                    Vec::new()
                },
            }
        }
    }
}

pub fn parse_csv_records(body: &[u8]) -> FetchOutcome {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(body);
    let headers = match reader.headers() {
        Ok(headers) => headers.clone(),
        Err(err) => return FetchOutcome::failure(format!("invalid CSV header: {err}")),
    };

    let mut records = Vec::new();
    let mut errors = Vec::new();
    for (index, row) in reader.records().enumerate() {
        match row {
            Ok(row) => {
                let mut record = RawRecord::new();
                for (key, value) in headers.iter().zip(row.iter()) {
                    if !value.is_empty() {
                        record.insert(key.to_string(), value.to_string());
                    }
                }
                records.push(record);
            }
            Err(err) => errors.push(format!("CSV row {}: {err}", index + 2)),
        }
    }
    FetchOutcome {
        record_count: records.len(),
        records,
        errors,
    }
}

pub fn parse_json_records(body: &[u8]) -> FetchOutcome {
    let value: JsonValue = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(err) => return FetchOutcome::failure(format!("invalid JSON document: {err}")),
    };
    FetchOutcome::from_records(json_value_to_records(value))
}

fn json_value_to_records(value: JsonValue) -> Vec<RawRecord> {
    match value {
        JsonValue::Array(items) => items.into_iter().map(json_item_to_record).collect(),
        other => vec![json_item_to_record(other)],
    }
}

fn json_item_to_record(item: JsonValue) -> RawRecord {
    let mut record = RawRecord::new();
    match item {
        JsonValue::Object(map) => {
            for (key, value) in map {
                match value {
                    JsonValue::String(s) => {
                        record.insert(key, s);
                    }
                    JsonValue::Number(n) => {
                        record.insert(key, n.to_string());
                    }
                    JsonValue::Bool(b) => {
                        record.insert(key, b.to_string());
                    }
                    JsonValue::Null => {}
                    // Nested structures are out of scope for registry feeds.
                    other => {
                        record.insert(key, other.to_string());
                    }
                }
            }
        }
        JsonValue::String(s) => {
            record.insert("value".to_string(), s);
        }
        JsonValue::Number(n) => {
            record.insert("value".to_string(), n.to_string());
        }
        _ => {}
    }
    record
}

/// Count repeated elements by tallying closing tags and taking the most
/// frequent one. A tag-count heuristic, not a parser; nested same-named
/// elements and CDATA will confuse it.
pub fn xml_record_count(body: &[u8]) -> usize {
    let text = String::from_utf8_lossy(body);
    let closing = Regex::new(r"</\s*([A-Za-z0-9_:.-]+)\s*>").expect("static regex");
    let mut tallies: BTreeMap<String, usize> = BTreeMap::new();
    for capture in closing.captures_iter(&text) {
        *tallies.entry(capture[1].to_ascii_lowercase()).or_default() += 1;
    }
    tallies.values().copied().max().unwrap_or(0)
}

// ---------------------------------------------------------------------------
// API downloader

pub struct ApiDownloader;

#[async_trait]
impl Downloader for ApiDownloader {
    fn source_type(&self) -> SourceType {
        SourceType::Api
    }

    async fn fetch(&self, source: &DataSource, http: &HttpFetcher) -> FetchOutcome {
        match http.get_json(&source.name, &source.url).await {
            Ok(resp) => parse_api_body(&resp.body),
            Err(err) => FetchOutcome::failure(fetch_error_message(&err)),
        }
    }
}

pub fn parse_api_body(body: &[u8]) -> FetchOutcome {
    let value: JsonValue = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(err) => return FetchOutcome::failure(format!("invalid JSON response: {err}")),
    };
    match value {
        JsonValue::Array(items) => {
            FetchOutcome::from_records(items.into_iter().map(json_item_to_record).collect())
        }
        JsonValue::Object(_) => FetchOutcome::from_records(vec![json_item_to_record(value)]),
        // Scalar body: counted as one record with nothing to normalize.
        _ => FetchOutcome {
            records: Vec::new(),
            record_count: 1,
            errors: Vec::new(),
        },
    }
}

// ---------------------------------------------------------------------------
// Web-scrape downloader

pub struct WebDownloader;

#[async_trait]
impl Downloader for WebDownloader {
    fn source_type(&self) -> SourceType {
        SourceType::Web
    }

    async fn fetch(&self, source: &DataSource, http: &HttpFetcher) -> FetchOutcome {
        let mut records = Vec::new();
        let mut errors = Vec::new();

        match http.get(&source.name, &source.url).await {
            Ok(resp) => {
                let html = String::from_utf8_lossy(&resp.body).into_owned();
                records.extend(extract_web_records(&html, source));
            }
            Err(err) => return FetchOutcome::failure(fetch_error_message(&err)),
        }

        if source.paginate {
            for page in 2..=MAX_PAGES {
                let url = page_url(&source.url, page);
                match http.get(&source.name, &url).await {
                    Ok(resp) => {
                        let html = String::from_utf8_lossy(&resp.body).into_owned();
                        let page_records = extract_web_records(&html, source);
                        if page_records.is_empty() {
                            break;
                        }
                        records.extend(page_records);
                    }
                    Err(err) if err.is_not_found() => break,
                    Err(err) => {
                        errors.push(format!("page {page}: {}", fetch_error_message(&err)));
                        break;
                    }
                }
            }
        }

        FetchOutcome {
            record_count: records.len(),
            records,
            errors,
        }
    }
}

fn page_url(base: &str, page: usize) -> String {
    if base.contains('?') {
        format!("{base}&page={page}")
    } else {
        format!("{base}?page={page}")
    }
}

/// Extract records using source-declared selectors when present, otherwise
/// the generic table / definition-list heuristic.
pub fn extract_web_records(html: &str, source: &DataSource) -> Vec<RawRecord> {
    let document = Html::parse_document(html);
    if let Some(selectors) = &source.selectors {
        extract_with_selectors(&document, selectors)
    } else {
        let mut records = extract_from_tables(&document);
        records.extend(extract_from_definition_lists(&document));
        records
    }
}

fn extract_with_selectors(document: &Html, selectors: &cvrs_core::WebSelectors) -> Vec<RawRecord> {
    let Ok(row_selector) = Selector::parse(&selectors.row) else {
        warn!(selector = %selectors.row, "invalid row selector");
        return Vec::new();
    };

    let mut records = Vec::new();
    for row in document.select(&row_selector) {
        let mut record = RawRecord::new();
        for (field, selector_text) in &selectors.fields {
            let Ok(field_selector) = Selector::parse(selector_text) else {
                warn!(selector = %selector_text, field = %field, "invalid field selector");
                continue;
            };
            if let Some(text) = row.select(&field_selector).next().map(element_text) {
                if !text.is_empty() {
                    record.insert(field.clone(), text);
                }
            }
        }
        if !record.is_empty() {
            records.push(record);
        }
    }
    records
}

fn element_text(element: ElementRef<'_>) -> String {
    collapse_whitespace(&element.text().collect::<String>())
}

const HEADER_KEYWORDS: &[(&str, &str)] = &[
    ("company", "company_name"),
    ("business name", "company_name"),
    ("corporate name", "company_name"),
    ("name", "company_name"),
    ("business number", "business_identifier"),
    ("identifier", "business_identifier"),
    ("number", "business_identifier"),
    ("bn", "business_identifier"),
    ("address", "address"),
    ("city", "city"),
    ("municipality", "city"),
    ("province", "province"),
    ("postal", "postal_code"),
    ("phone", "phone"),
    ("telephone", "phone"),
    ("email", "email"),
    ("website", "website"),
    ("url", "website"),
];

fn canonical_for_label(label: &str) -> Option<&'static str> {
    let lower = label.to_lowercase();
    HEADER_KEYWORDS
        .iter()
        .find(|(keyword, _)| lower.contains(keyword))
        .map(|(_, canonical)| *canonical)
}

/// Positional fallback when header labels carry no recognizable keyword.
fn canonical_for_position(index: usize) -> Option<&'static str> {
    match index {
        0 => Some("company_name"),
        1 => Some("business_identifier"),
        2 => Some("address"),
        _ => None,
    }
}

fn extract_from_tables(document: &Html) -> Vec<RawRecord> {
    let table_selector = Selector::parse("table").expect("static selector");
    let tr_selector = Selector::parse("tr").expect("static selector");
    let cell_selector = Selector::parse("th, td").expect("static selector");

    let mut records = Vec::new();
    for table in document.select(&table_selector) {
        let mut rows = table.select(&tr_selector);
        let Some(header_row) = rows.next() else {
            continue;
        };
        let headers: Vec<String> = header_row.select(&cell_selector).map(element_text).collect();
        let columns: Vec<Option<&'static str>> = headers
            .iter()
            .enumerate()
            .map(|(index, label)| {
                canonical_for_label(label).or_else(|| canonical_for_position(index))
            })
            .collect();

        for row in rows {
            let cells: Vec<String> = row.select(&cell_selector).map(element_text).collect();
            let mut record = RawRecord::new();
            for (index, cell) in cells.iter().enumerate() {
                if cell.is_empty() {
                    continue;
                }
                if let Some(Some(canonical)) = columns.get(index) {
                    record.insert((*canonical).to_string(), cell.clone());
                }
            }
            if !record.is_empty() {
                records.push(record);
            }
        }
    }
    records
}

fn extract_from_definition_lists(document: &Html) -> Vec<RawRecord> {
    let dl_selector = Selector::parse("dl").expect("static selector");
    let dt_selector = Selector::parse("dt").expect("static selector");
    let dd_selector = Selector::parse("dd").expect("static selector");

    let mut records = Vec::new();
    for dl in document.select(&dl_selector) {
        let labels = dl.select(&dt_selector).map(element_text);
        let values = dl.select(&dd_selector).map(element_text);
        let mut record = RawRecord::new();
        for (label, value) in labels.zip(values) {
            if value.is_empty() {
                continue;
            }
            if let Some(canonical) = canonical_for_label(&label) {
                record.insert(canonical.to_string(), value);
            }
        }
        if !record.is_empty() {
            records.push(record);
        }
    }
    records
}

fn fetch_error_message(err: &FetchError) -> String {
    err.to_string()
}

// ---------------------------------------------------------------------------
// Field mapper / normalizer

/// Resolves raw source keys to canonical fields through a priority-ordered
/// candidate list, then applies the normalization rules.
pub struct FieldMapper {
    source_name: String,
    mappings: BTreeMap<String, Vec<String>>,
}

impl FieldMapper {
    pub fn for_source(source: &DataSource) -> Self {
        Self {
            source_name: source.name.clone(),
            mappings: source.field_mappings.clone(),
        }
    }

    /// Resolve one canonical field. Candidates are tried in declared order,
    /// each through three tiers: exact key, case-insensitive key, then
    /// separator-insensitive key. The canonical name itself is the implicit
    /// final candidate. Ambiguity is logged, never guessed around: the
    /// first match in deterministic key order wins.
    pub fn resolve(&self, record: &RawRecord, canonical: &str) -> Option<String> {
        let declared = self.mappings.get(canonical);
        let candidates = declared
            .into_iter()
            .flatten()
            .map(String::as_str)
            .chain(std::iter::once(canonical));

        for candidate in candidates {
            if let Some(value) = record.get(candidate) {
                if !value.trim().is_empty() {
                    return Some(value.clone());
                }
                continue;
            }

            for tier in [match_key_case_insensitive, match_key_separator_insensitive] {
                let matches = tier(record, candidate);
                if matches.is_empty() {
                    continue;
                }
                if matches.len() > 1 {
                    warn!(
                        source = %self.source_name,
                        canonical,
                        candidate,
                        keys = ?matches,
                        "ambiguous field mapping, using first match"
                    );
                }
                let value = &record[matches[0]];
                if !value.trim().is_empty() {
                    return Some(value.clone());
                }
            }
        }
        None
    }

    /// Map and normalize one raw record into the canonical shape.
    pub fn normalize(&self, record: &RawRecord) -> BusinessRecord {
        let get = |canonical: &str| self.resolve(record, canonical);

        let company_name = get("company_name")
            .map(|v| normalize_company_name(&v))
            .unwrap_or_default();
        let address = match get("address").map(|v| collapse_whitespace(&v)) {
            Some(v) if !v.is_empty() => Some(v),
            _ => Some("Address not available".to_string()),
        };
        let trimmed = |v: Option<String>| {
            v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
        };

        BusinessRecord {
            company_name,
            business_identifier: trimmed(get("business_identifier")),
            address,
            city: trimmed(get("city")),
            province: trimmed(get("province")),
            postal_code: get("postal_code").map(|v| format_postal_code(&v)),
            phone: trimmed(get("phone")),
            email: trimmed(get("email")),
            website: trimmed(get("website")),
        }
    }
}

fn match_key_case_insensitive<'a>(record: &'a RawRecord, candidate: &str) -> Vec<&'a String> {
    record
        .keys()
        .filter(|key| key.eq_ignore_ascii_case(candidate))
        .collect()
}

fn match_key_separator_insensitive<'a>(record: &'a RawRecord, candidate: &str) -> Vec<&'a String> {
    let squashed = squash_key(candidate);
    record
        .keys()
        .filter(|key| squash_key(key) == squashed)
        .collect()
}

fn squash_key(key: &str) -> String {
    key.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

pub fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

const LEGAL_SUFFIXES: &[(&str, &str)] = &[
    ("incorporated", "Inc"),
    ("incorporée", "Inc"),
    ("limited", "Ltd"),
    ("limitée", "Ltée"),
    ("corporation", "Corp"),
    ("company", "Co"),
];

/// Collapse whitespace and canonicalize a trailing legal suffix
/// (Incorporated -> Inc, Limited -> Ltd, ...).
pub fn normalize_company_name(input: &str) -> String {
    let collapsed = collapse_whitespace(input);
    let Some((head, last)) = collapsed.rsplit_once(' ') else {
        return collapsed;
    };
    let bare = last.trim_end_matches(['.', ',']).to_lowercase();
    match LEGAL_SUFFIXES.iter().find(|(long, _)| *long == bare) {
        Some((_, short)) => format!("{head} {short}"),
        None => collapsed,
    }
}

/// Canadian postal-code formatting: strip spaces and uppercase; when the
/// result matches letter-digit-letter digit-letter-digit, reinsert the
/// single space. Anything else is returned unchanged.
pub fn format_postal_code(input: &str) -> String {
    let stripped: String = input
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect();
    let bytes: Vec<char> = stripped.chars().collect();
    let matches = bytes.len() == 6
        && bytes[0].is_ascii_alphabetic()
        && bytes[1].is_ascii_digit()
        && bytes[2].is_ascii_alphabetic()
        && bytes[3].is_ascii_digit()
        && bytes[4].is_ascii_alphabetic()
        && bytes[5].is_ascii_digit();
    if matches {
        format!("{} {}", &stripped[..3], &stripped[3..])
    } else {
        input.to_string()
    }
}
