//! Source adapter protocol + the built-in API-backed job sources.
//!
//! Every source implements [`JobSource`]: a uniform `search` operation,
//! static metadata consumed by source-selection, and a per-instance rate
//! limiter. A failing adapter returns a [`SourceError`]; it never aborts
//! the run it participates in.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use jobscout_core::{RawJobRecord, SourceType};
use jobscout_storage::{FetchError, HttpFetcher};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "jobscout-adapters";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unexpected payload from {source_id}: {message}")]
    Parse {
        source_id: &'static str,
        message: String,
    },
    #[error("source {source_id} requires credentials: {missing}")]
    MissingCredential {
        source_id: &'static str,
        missing: &'static str,
    },
}

/// Static source facts consumed by source-selection before a run starts.
#[derive(Debug, Clone, Serialize)]
pub struct SourceMetadata {
    pub source_id: &'static str,
    pub display_name: &'static str,
    pub source_type: SourceType,
    pub regions: &'static [&'static str],
    pub requires_auth: bool,
    pub robots_compliant: bool,
    pub rate_limit_rpm: u32,
}

/// Uniform job-search capability. `search` is the only operation the run
/// controller invokes during fan-out.
#[async_trait]
pub trait JobSource: Send + Sync {
    fn metadata(&self) -> &SourceMetadata;

    async fn search(
        &self,
        http: &HttpFetcher,
        query: &str,
        location: &str,
        limit: usize,
    ) -> Result<Vec<RawJobRecord>, SourceError>;
}

// ==================== rate limiting ====================

/// Remaining wait before the next call may go out, given the configured
/// minimum interval and the time elapsed since the previous call.
pub fn remaining_delay(min_interval: Duration, since_last: Option<Duration>) -> Duration {
    match since_last {
        None => Duration::ZERO,
        Some(elapsed) => min_interval.saturating_sub(elapsed),
    }
}

/// Minimum inter-call interval enforced per adapter instance, not
/// globally. The sleep here is the only blocking point inside an adapter
/// call; state is a last-call timestamp behind a mutex so concurrent runs
/// holding the same instance still space their calls.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn per_minute(rpm: u32) -> Self {
        let min_interval = if rpm == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(60.0 / f64::from(rpm))
        };
        Self {
            min_interval,
            last_call: Mutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Sleep out the remainder of the interval, then record this call.
    pub async fn acquire(&self) {
        let mut last_call = self.last_call.lock().await;
        let wait = remaining_delay(self.min_interval, last_call.map(|t| t.elapsed()));
        if !wait.is_zero() {
            debug!(wait_ms = wait.as_millis() as u64, "rate limit pacing");
            tokio::time::sleep(wait).await;
        }
        *last_call = Some(Instant::now());
    }
}

// ==================== json helpers ====================

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str()
}

fn json_i64(value: &JsonValue, path: &[&str]) -> Option<i64> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_i64()
}

fn json_array<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a Vec<JsonValue>> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_array()
}

fn text_or_empty(value: Option<&str>) -> String {
    value.map(|s| s.trim().to_string()).unwrap_or_default()
}

fn parse_posted_at(value: &JsonValue) -> Option<DateTime<Utc>> {
    if let Some(text) = value.as_str() {
        return DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|t| t.with_timezone(&Utc))
            .or_else(|| {
                // Some feeds emit a naive `YYYY-MM-DDTHH:MM:SS` stamp.
                chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S")
                    .ok()
                    .map(|naive| Utc.from_utc_datetime(&naive))
            });
    }
    value
        .as_i64()
        .and_then(|epoch| Utc.timestamp_opt(epoch, 0).single())
}

fn matches_query(query: &str, haystacks: &[&str]) -> bool {
    if query.trim().is_empty() {
        return true;
    }
    let needle = query.to_lowercase();
    haystacks
        .iter()
        .any(|text| text.to_lowercase().contains(&needle))
}

// ==================== remotive ====================

const REMOTIVE_METADATA: SourceMetadata = SourceMetadata {
    source_id: "remotive",
    display_name: "Remotive",
    source_type: SourceType::Api,
    regions: &["Global"],
    requires_auth: false,
    robots_compliant: true,
    rate_limit_rpm: 30,
};

const REMOTIVE_URL: &str = "https://remotive.io/api/remote-jobs";

/// Remotive public API: all listings are remote roles.
pub struct RemotiveAdapter {
    limiter: RateLimiter,
}

impl Default for RemotiveAdapter {
    fn default() -> Self {
        Self {
            limiter: RateLimiter::per_minute(REMOTIVE_METADATA.rate_limit_rpm),
        }
    }
}

impl RemotiveAdapter {
    pub fn parse_payload(payload: &JsonValue, limit: usize) -> Result<Vec<RawJobRecord>, SourceError> {
        let jobs = json_array(payload, &["jobs"]).ok_or(SourceError::Parse {
            source_id: REMOTIVE_METADATA.source_id,
            message: "missing `jobs` array".into(),
        })?;
        Ok(jobs
            .iter()
            .take(limit)
            .map(|job| RawJobRecord {
                external_id: json_i64(job, &["id"])
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| text_or_empty(json_str(job, &["id"]))),
                url: text_or_empty(json_str(job, &["url"])),
                apply_url: json_str(job, &["url"]).map(|s| s.trim().to_string()),
                company: text_or_empty(json_str(job, &["company_name"])),
                title: text_or_empty(json_str(job, &["title"])),
                location: {
                    let location = text_or_empty(json_str(job, &["candidate_required_location"]));
                    if location.is_empty() {
                        "Remote".to_string()
                    } else {
                        location
                    }
                },
                description: text_or_empty(json_str(job, &["description"])),
                posted_at: job.get("publication_date").and_then(parse_posted_at),
                salary_text: text_or_empty(json_str(job, &["salary"])),
                ..RawJobRecord::default()
            })
            .collect())
    }
}

#[async_trait]
impl JobSource for RemotiveAdapter {
    fn metadata(&self) -> &SourceMetadata {
        &REMOTIVE_METADATA
    }

    async fn search(
        &self,
        http: &HttpFetcher,
        query: &str,
        _location: &str,
        limit: usize,
    ) -> Result<Vec<RawJobRecord>, SourceError> {
        self.limiter.acquire().await;

        let mut params: Vec<(&str, String)> = vec![("limit", limit.to_string())];
        if !query.trim().is_empty() {
            params.push(("search", query.to_string()));
        }

        let payload = http
            .get_json(REMOTIVE_METADATA.source_id, REMOTIVE_URL, &params, &[])
            .await?;
        let jobs = Self::parse_payload(&payload, limit)?;
        info!(source_id = REMOTIVE_METADATA.source_id, count = jobs.len(), "source search done");
        Ok(jobs)
    }
}

// ==================== arbeitnow ====================

const ARBEITNOW_METADATA: SourceMetadata = SourceMetadata {
    source_id: "arbeitnow",
    display_name: "Arbeitnow",
    source_type: SourceType::Api,
    regions: &["EU"],
    requires_auth: false,
    robots_compliant: true,
    rate_limit_rpm: 30,
};

const ARBEITNOW_URL: &str = "https://www.arbeitnow.com/api/job-board-api";

/// Arbeitnow job-board API (EU-centric). The API has no search parameter,
/// so the query is applied client-side over title/company/description.
pub struct ArbeitnowAdapter {
    limiter: RateLimiter,
}

impl Default for ArbeitnowAdapter {
    fn default() -> Self {
        Self {
            limiter: RateLimiter::per_minute(ARBEITNOW_METADATA.rate_limit_rpm),
        }
    }
}

impl ArbeitnowAdapter {
    pub fn parse_payload(
        payload: &JsonValue,
        query: &str,
        limit: usize,
    ) -> Result<Vec<RawJobRecord>, SourceError> {
        let jobs = json_array(payload, &["data"]).ok_or(SourceError::Parse {
            source_id: ARBEITNOW_METADATA.source_id,
            message: "missing `data` array".into(),
        })?;
        Ok(jobs
            .iter()
            .filter(|job| {
                matches_query(
                    query,
                    &[
                        json_str(job, &["title"]).unwrap_or_default(),
                        json_str(job, &["company_name"]).unwrap_or_default(),
                        json_str(job, &["description"]).unwrap_or_default(),
                    ],
                )
            })
            .take(limit)
            .map(|job| RawJobRecord {
                external_id: text_or_empty(json_str(job, &["slug"])),
                url: text_or_empty(json_str(job, &["url"])),
                apply_url: json_str(job, &["url"]).map(|s| s.trim().to_string()),
                company: text_or_empty(json_str(job, &["company_name"])),
                title: text_or_empty(json_str(job, &["title"])),
                location: text_or_empty(json_str(job, &["location"])),
                description: text_or_empty(json_str(job, &["description"])),
                posted_at: job.get("created_at").and_then(parse_posted_at),
                ..RawJobRecord::default()
            })
            .collect())
    }
}

#[async_trait]
impl JobSource for ArbeitnowAdapter {
    fn metadata(&self) -> &SourceMetadata {
        &ARBEITNOW_METADATA
    }

    async fn search(
        &self,
        http: &HttpFetcher,
        query: &str,
        _location: &str,
        limit: usize,
    ) -> Result<Vec<RawJobRecord>, SourceError> {
        self.limiter.acquire().await;

        let payload = http
            .get_json(ARBEITNOW_METADATA.source_id, ARBEITNOW_URL, &[], &[])
            .await?;
        let jobs = Self::parse_payload(&payload, query, limit)?;
        info!(source_id = ARBEITNOW_METADATA.source_id, count = jobs.len(), "source search done");
        Ok(jobs)
    }
}

// ==================== hackernews jobs ====================

const HACKERNEWS_METADATA: SourceMetadata = SourceMetadata {
    source_id: "hackernews_jobs",
    display_name: "HackerNews Jobs",
    source_type: SourceType::Api,
    regions: &["Global", "US"],
    requires_auth: false,
    robots_compliant: true,
    rate_limit_rpm: 30,
};

const HACKERNEWS_STORIES_URL: &str = "https://hacker-news.firebaseio.com/v0/jobstories.json";

/// HackerNews job stories via the public Firebase API. Titles follow the
/// "Company (YC Sxx) - Role" convention, which we split into company+title.
pub struct HackerNewsJobsAdapter {
    limiter: RateLimiter,
}

impl Default for HackerNewsJobsAdapter {
    fn default() -> Self {
        Self {
            limiter: RateLimiter::per_minute(HACKERNEWS_METADATA.rate_limit_rpm),
        }
    }
}

impl HackerNewsJobsAdapter {
    fn item_url(id: i64) -> String {
        format!("https://hacker-news.firebaseio.com/v0/item/{id}.json")
    }

    pub fn parse_item(item: &JsonValue) -> Option<RawJobRecord> {
        if json_str(item, &["type"]) != Some("job") {
            return None;
        }
        let id = json_i64(item, &["id"]).unwrap_or_default();
        let full_title = text_or_empty(json_str(item, &["title"]));
        let text = text_or_empty(json_str(item, &["text"]));

        let (company, title) = match full_title.split_once(" - ") {
            Some((company, title)) => (company.trim().to_string(), title.trim().to_string()),
            None => (String::new(), full_title.clone()),
        };

        Some(RawJobRecord {
            external_id: id.to_string(),
            url: json_str(item, &["url"])
                .map(|s| s.trim().to_string())
                .unwrap_or_else(|| format!("https://news.ycombinator.com/item?id={id}")),
            company,
            title,
            location: "Remote".to_string(),
            description: text,
            posted_at: item.get("time").and_then(parse_posted_at),
            ..RawJobRecord::default()
        })
    }
}

#[async_trait]
impl JobSource for HackerNewsJobsAdapter {
    fn metadata(&self) -> &SourceMetadata {
        &HACKERNEWS_METADATA
    }

    async fn search(
        &self,
        http: &HttpFetcher,
        query: &str,
        _location: &str,
        limit: usize,
    ) -> Result<Vec<RawJobRecord>, SourceError> {
        self.limiter.acquire().await;

        let ids = http
            .get_json(HACKERNEWS_METADATA.source_id, HACKERNEWS_STORIES_URL, &[], &[])
            .await?;
        let ids: Vec<i64> = ids
            .as_array()
            .map(|a| a.iter().filter_map(|v| v.as_i64()).collect())
            .unwrap_or_default();

        let mut jobs = Vec::new();
        for id in ids.into_iter().take(limit * 2) {
            if jobs.len() >= limit {
                break;
            }
            let item = match http
                .get_json(HACKERNEWS_METADATA.source_id, &Self::item_url(id), &[], &[])
                .await
            {
                Ok(item) => item,
                Err(err) => {
                    // One unfetchable item should not sink the whole page.
                    debug!(item_id = id, error = %err, "skipping hn item");
                    continue;
                }
            };
            let Some(record) = Self::parse_item(&item) else {
                continue;
            };
            if matches_query(query, &[&record.title, &record.company, &record.description]) {
                jobs.push(record);
            }
        }

        info!(source_id = HACKERNEWS_METADATA.source_id, count = jobs.len(), "source search done");
        Ok(jobs)
    }
}

// ==================== registry ====================

pub fn adapter_for_source(source_id: &str) -> Option<Box<dyn JobSource>> {
    match source_id {
        "remotive" => Some(Box::new(RemotiveAdapter::default())),
        "arbeitnow" => Some(Box::new(ArbeitnowAdapter::default())),
        "hackernews_jobs" => Some(Box::new(HackerNewsJobsAdapter::default())),
        _ => None,
    }
}

pub fn all_source_metadata() -> Vec<SourceMetadata> {
    vec![
        REMOTIVE_METADATA.clone(),
        ARBEITNOW_METADATA.clone(),
        HACKERNEWS_METADATA.clone(),
    ]
}

pub fn known_source(source_id: &str) -> bool {
    all_source_metadata()
        .iter()
        .any(|m| m.source_id == source_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn remaining_delay_honors_interval() {
        let interval = Duration::from_secs(2);
        assert_eq!(remaining_delay(interval, None), Duration::ZERO);
        assert_eq!(
            remaining_delay(interval, Some(Duration::from_millis(500))),
            Duration::from_millis(1500)
        );
        assert_eq!(
            remaining_delay(interval, Some(Duration::from_secs(3))),
            Duration::ZERO
        );
    }

    #[test]
    fn limiter_interval_derives_from_rpm() {
        assert_eq!(
            RateLimiter::per_minute(30).min_interval(),
            Duration::from_secs(2)
        );
        assert_eq!(
            RateLimiter::per_minute(60).min_interval(),
            Duration::from_secs(1)
        );
        assert_eq!(RateLimiter::per_minute(0).min_interval(), Duration::ZERO);
    }

    #[tokio::test]
    async fn limiter_records_first_call_without_waiting() {
        let limiter = RateLimiter::per_minute(1);
        let started = Instant::now();
        limiter.acquire().await;
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn registry_resolves_known_sources_only() {
        assert!(adapter_for_source("remotive").is_some());
        assert!(adapter_for_source("arbeitnow").is_some());
        assert!(adapter_for_source("hackernews_jobs").is_some());
        assert!(adapter_for_source("linkedin").is_none());
        assert!(known_source("remotive"));
        assert!(!known_source("linkedin"));
    }

    #[test]
    fn metadata_exposes_selection_facts() {
        let all = all_source_metadata();
        assert_eq!(all.len(), 3);
        assert!(all.iter().all(|m| m.robots_compliant));
        assert!(all.iter().all(|m| !m.requires_auth));
        assert!(all.iter().all(|m| m.rate_limit_rpm > 0));
    }

    #[test]
    fn remotive_payload_maps_fields() {
        let payload = json!({
            "jobs": [{
                "id": 42,
                "url": "https://remotive.io/remote-jobs/software-dev/rust-engineer-42",
                "title": "Rust Engineer",
                "company_name": "Acme",
                "candidate_required_location": "Worldwide",
                "publication_date": "2026-08-20T09:00:00",
                "description": "Build services in Rust.",
                "salary": "$140k-$180k"
            }]
        });
        let jobs = RemotiveAdapter::parse_payload(&payload, 10).unwrap();
        assert_eq!(jobs.len(), 1);
        let job = &jobs[0];
        assert_eq!(job.external_id, "42");
        assert_eq!(job.company, "Acme");
        assert_eq!(job.title, "Rust Engineer");
        assert_eq!(job.location, "Worldwide");
        assert_eq!(job.salary_text, "$140k-$180k");
        assert!(job.posted_at.is_some());
    }

    #[test]
    fn remotive_rejects_malformed_payload() {
        let payload = json!({"unexpected": true});
        assert!(RemotiveAdapter::parse_payload(&payload, 10).is_err());
    }

    #[test]
    fn arbeitnow_filters_by_query_and_parses_epoch() {
        let payload = json!({
            "data": [
                {
                    "slug": "rust-dev-berlin",
                    "url": "https://www.arbeitnow.com/jobs/rust-dev-berlin",
                    "title": "Rust Developer",
                    "company_name": "Berlin Systems",
                    "location": "Berlin",
                    "description": "Backend work in Rust",
                    "created_at": 1755600000
                },
                {
                    "slug": "java-dev",
                    "url": "https://www.arbeitnow.com/jobs/java-dev",
                    "title": "Java Developer",
                    "company_name": "Other GmbH",
                    "location": "Munich",
                    "description": "Enterprise Java",
                    "created_at": 1755600000
                }
            ]
        });
        let jobs = ArbeitnowAdapter::parse_payload(&payload, "rust", 10).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].external_id, "rust-dev-berlin");
        assert!(jobs[0].posted_at.is_some());

        let all = ArbeitnowAdapter::parse_payload(&payload, "", 10).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn hackernews_item_splits_company_from_title() {
        let item = json!({
            "id": 99,
            "type": "job",
            "title": "Acme (YC W24) - Senior Rust Engineer",
            "text": "Work on infra.",
            "time": 1755600000
        });
        let job = HackerNewsJobsAdapter::parse_item(&item).unwrap();
        assert_eq!(job.company, "Acme (YC W24)");
        assert_eq!(job.title, "Senior Rust Engineer");
        assert_eq!(job.url, "https://news.ycombinator.com/item?id=99");
        assert_eq!(job.location, "Remote");

        let story = json!({"id": 1, "type": "story", "title": "Not a job"});
        assert!(HackerNewsJobsAdapter::parse_item(&story).is_none());
    }
}
