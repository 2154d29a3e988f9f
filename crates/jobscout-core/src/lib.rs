//! Core domain model for jobscout: job records, runs, profiles, and the
//! listing identity (fingerprint + canonical URL) used for deduplication.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobscout-core";

/// Maximum length of the stored description snippet.
pub const SNIPPET_LEN: usize = 500;

/// Lifecycle of a discovery run. Transitions are monotonic:
/// `pending -> running -> {completed | failed | stopped}`, with `stopped`
/// also reachable straight from `pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Running | Self::Failed | Self::Stopped),
            Self::Running => matches!(next, Self::Completed | Self::Failed | Self::Stopped),
            Self::Completed | Self::Failed | Self::Stopped => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    Manual,
    Scheduled,
}

/// User-editable status of a discovered listing. Everything else on a
/// `NormalizedJob` is immutable after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    New,
    Saved,
    Applied,
    Ignored,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteType {
    Remote,
    Hybrid,
    Onsite,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Seniority {
    Intern,
    Entry,
    Junior,
    Mid,
    Senior,
    Lead,
    Staff,
    Principal,
    Manager,
    Director,
    Vp,
    Executive,
    Unknown,
}

impl Seniority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Intern => "intern",
            Self::Entry => "entry",
            Self::Junior => "junior",
            Self::Mid => "mid",
            Self::Senior => "senior",
            Self::Lead => "lead",
            Self::Staff => "staff",
            Self::Principal => "principal",
            Self::Manager => "manager",
            Self::Director => "director",
            Self::Vp => "vp",
            Self::Executive => "executive",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Api,
    Browser,
    Rss,
}

/// Source-native listing as returned by one adapter call. Transient: it is
/// normalized immediately and never persisted as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawJobRecord {
    pub external_id: String,
    pub url: String,
    #[serde(default)]
    pub apply_url: Option<String>,
    pub company: String,
    pub title: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub posted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub salary_min: Option<i64>,
    #[serde(default)]
    pub salary_max: Option<i64>,
    #[serde(default)]
    pub salary_currency: Option<String>,
    #[serde(default)]
    pub salary_text: String,
}

/// Deterministic identity for a listing, derived from lower-cased,
/// whitespace-trimmed company + title + location. Two listings with the
/// same triple collide on purpose, even across sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub digest: String,
    /// Set when both company and title are empty. Low-confidence
    /// fingerprints are kept but never merged with anything.
    pub low_confidence: bool,
}

impl Fingerprint {
    pub fn of(company: &str, title: &str, location: &str) -> Self {
        let company = company.trim().to_lowercase();
        let title = title.trim().to_lowercase();
        let location = location.trim().to_lowercase();
        let key = format!("{company}|{title}|{location}");
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        Self {
            digest: hex::encode(hasher.finalize()),
            low_confidence: company.is_empty() && title.is_empty(),
        }
    }
}

/// Strip the query string and fragment from a listing URL so the same
/// posting reached via different tracking parameters compares equal.
pub fn canonical_url(url: &str) -> String {
    let url = url.trim();
    let without_fragment = url.split('#').next().unwrap_or(url);
    without_fragment
        .split('?')
        .next()
        .unwrap_or(without_fragment)
        .to_string()
}

/// Truncate a description to a bounded snippet on a char boundary.
pub fn snippet(description: &str) -> String {
    if description.chars().count() <= SNIPPET_LEN {
        return description.to_string();
    }
    description.chars().take(SNIPPET_LEN).collect()
}

pub fn infer_region(location: &str) -> String {
    let location = location.to_lowercase();
    let groups: [(&str, &[&str]); 8] = [
        (
            "US",
            &[
                "usa",
                "united states",
                "u.s.",
                "america",
                "california",
                "new york",
                "texas",
                "washington",
                "massachusetts",
                "san francisco",
                "los angeles",
                "seattle",
                "boston",
                "nyc",
                "austin",
            ],
        ),
        (
            "UK",
            &[
                "uk",
                "united kingdom",
                "london",
                "manchester",
                "birmingham",
                "england",
                "scotland",
            ],
        ),
        (
            "EU",
            &[
                "germany",
                "france",
                "netherlands",
                "spain",
                "italy",
                "poland",
                "berlin",
                "paris",
                "amsterdam",
                "munich",
                "barcelona",
            ],
        ),
        (
            "India",
            &["india", "bangalore", "mumbai", "delhi", "hyderabad", "chennai", "pune"],
        ),
        (
            "Australia",
            &["australia", "sydney", "melbourne", "brisbane", "perth"],
        ),
        (
            "SEA",
            &[
                "singapore",
                "malaysia",
                "indonesia",
                "philippines",
                "thailand",
                "vietnam",
            ],
        ),
        (
            "Middle East",
            &["uae", "dubai", "saudi", "qatar", "bahrain", "kuwait"],
        ),
        (
            "Canada",
            &["canada", "toronto", "vancouver", "montreal", "calgary"],
        ),
    ];

    for (region, indicators) in groups {
        if indicators.iter().any(|ind| location.contains(ind)) {
            return region.to_string();
        }
    }
    "Global".to_string()
}

pub fn infer_remote_type(title: &str, location: &str, description: &str) -> RemoteType {
    let text = format!("{title} {location} {description}").to_lowercase();
    if text.contains("hybrid") {
        return RemoteType::Hybrid;
    }
    if text.contains("remote") {
        return RemoteType::Remote;
    }
    if text.contains("on-site") || text.contains("onsite") || text.contains("in-office") {
        return RemoteType::Onsite;
    }
    RemoteType::Unknown
}

/// Infer a seniority label from a job title. Returns `Unknown` when the
/// title carries no signal, leaving the scoring neutral default to apply.
pub fn infer_seniority(title: &str) -> Seniority {
    let title = title.to_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| title.contains(w));

    if has(&["intern"]) {
        return Seniority::Intern;
    }
    if has(&["junior", "jr.", "jr "]) {
        return Seniority::Junior;
    }
    if has(&["entry", "associate", "graduate"]) {
        return Seniority::Entry;
    }
    if has(&["principal"]) {
        return Seniority::Principal;
    }
    if has(&["staff"]) {
        return Seniority::Staff;
    }
    if has(&["cto", "ceo", "cfo", "chief"]) {
        return Seniority::Executive;
    }
    if has(&["vp", "vice president"]) {
        return Seniority::Vp;
    }
    if has(&["director"]) {
        return Seniority::Director;
    }
    if has(&["manager", "head of"]) {
        return Seniority::Manager;
    }
    if has(&["lead"]) {
        return Seniority::Lead;
    }
    if has(&["senior", "sr.", "sr "]) {
        return Seniority::Senior;
    }
    Seniority::Unknown
}

/// Canonical persisted listing: one per unique fingerprint per user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedJob {
    pub id: Uuid,
    pub user_id: String,

    pub source_id: String,
    pub source_name: String,
    pub source_type: SourceType,

    pub external_id: String,
    pub canonical_url: String,
    pub fingerprint: Fingerprint,

    pub company: String,
    pub title: String,
    pub location: String,
    pub region: String,
    pub remote_type: RemoteType,
    pub seniority: Seniority,

    pub description: String,
    pub description_snippet: String,
    pub requirements: Vec<String>,

    pub posted_at: Option<DateTime<Utc>>,
    pub scraped_at: DateTime<Utc>,

    pub salary_min: Option<i64>,
    pub salary_max: Option<i64>,
    pub salary_currency: Option<String>,
    pub salary_text: String,

    pub job_url: String,
    pub apply_url: String,

    pub match_score: f64,
    pub matched_skills: Vec<String>,
    pub matched_keywords: Vec<String>,
    pub score_breakdown: BTreeMap<String, f64>,

    pub status: JobStatus,
    pub notes: String,
    pub run_id: Uuid,
}

/// Run-scoped inputs for normalization.
#[derive(Debug, Clone)]
pub struct NormalizeContext {
    pub user_id: String,
    pub run_id: Uuid,
    pub source_id: String,
    pub source_name: String,
    pub source_type: SourceType,
    pub scraped_at: DateTime<Utc>,
}

impl NormalizedJob {
    /// Pure transformation from a source-native record into the canonical
    /// listing, attaching identity and inferred attributes. Scoring fields
    /// start zeroed; the scoring engine fills them in.
    pub fn from_raw(raw: &RawJobRecord, ctx: &NormalizeContext) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: ctx.user_id.clone(),
            source_id: ctx.source_id.clone(),
            source_name: ctx.source_name.clone(),
            source_type: ctx.source_type,
            external_id: raw.external_id.clone(),
            canonical_url: canonical_url(&raw.url),
            fingerprint: Fingerprint::of(&raw.company, &raw.title, &raw.location),
            company: raw.company.clone(),
            title: raw.title.clone(),
            location: raw.location.clone(),
            region: infer_region(&raw.location),
            remote_type: infer_remote_type(&raw.title, &raw.location, &raw.description),
            seniority: infer_seniority(&raw.title),
            description: raw.description.clone(),
            description_snippet: snippet(&raw.description),
            requirements: raw.requirements.clone(),
            posted_at: raw.posted_at,
            scraped_at: ctx.scraped_at,
            salary_min: raw.salary_min,
            salary_max: raw.salary_max,
            salary_currency: raw.salary_currency.clone(),
            salary_text: raw.salary_text.clone(),
            job_url: raw.url.clone(),
            apply_url: raw.apply_url.clone().unwrap_or_else(|| raw.url.clone()),
            match_score: 0.0,
            matched_skills: Vec::new(),
            matched_keywords: Vec::new(),
            score_breakdown: BTreeMap::new(),
            status: JobStatus::New,
            notes: String::new(),
            run_id: ctx.run_id,
        }
    }
}

/// Free-form search parameters attached to a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunProgress {
    pub total_sources: usize,
    pub completed_sources: usize,
    pub jobs_found: usize,
    pub jobs_new: usize,
    pub jobs_updated: usize,
    #[serde(default)]
    pub current_source: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub total_jobs: usize,
    pub new_jobs: usize,
    pub duplicate_jobs: usize,
    pub failed_sources: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunErrorEntry {
    pub source_id: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

/// One execution of discovery across a configured set of sources.
/// Mutated only through the persistence layer; never deleted while active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    pub id: Uuid,
    pub user_id: String,
    pub status: RunStatus,
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub schedule_id: Option<Uuid>,

    pub source_ids: Vec<String>,
    pub search_params: SearchParams,

    pub progress: RunProgress,
    pub errors: Vec<RunErrorEntry>,
    pub stats: RunStats,

    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub export_id: Option<String>,
}

impl JobRun {
    pub fn new(
        user_id: impl Into<String>,
        trigger_type: TriggerType,
        source_ids: Vec<String>,
        search_params: SearchParams,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            status: RunStatus::Pending,
            trigger_type,
            schedule_id: None,
            progress: RunProgress {
                total_sources: source_ids.len(),
                ..RunProgress::default()
            },
            source_ids,
            search_params,
            errors: Vec::new(),
            stats: RunStats::default(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            export_id: None,
        }
    }
}

/// Candidate profile extracted from a resume. Read-only input to scoring.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateProfile {
    pub user_id: String,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub experience_years: i64,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub industries: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemotePreference {
    Remote,
    Hybrid,
    Onsite,
    #[default]
    Any,
}

/// Matching preferences. Read-only input to scoring.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchPreferences {
    pub user_id: String,

    #[serde(default)]
    pub preferred_roles: Vec<String>,
    #[serde(default)]
    pub preferred_industries: Vec<String>,
    #[serde(default)]
    pub required_skills: Vec<String>,
    #[serde(default)]
    pub preferred_skills: Vec<String>,

    #[serde(default)]
    pub included_companies: Vec<String>,
    #[serde(default)]
    pub excluded_companies: Vec<String>,

    #[serde(default)]
    pub preferred_locations: Vec<String>,
    #[serde(default)]
    pub preferred_regions: Vec<String>,
    #[serde(default)]
    pub remote_preference: RemotePreference,

    #[serde(default)]
    pub min_salary: i64,
    #[serde(default)]
    pub max_salary: i64,

    #[serde(default)]
    pub seniority_levels: Vec<Seniority>,

    /// Freshness window in days; listings older than this score low.
    #[serde(default = "default_posted_within_days")]
    pub posted_within_days: i64,

    #[serde(default)]
    pub include_keywords: Vec<String>,
    #[serde(default)]
    pub exclude_keywords: Vec<String>,
}

fn default_posted_within_days() -> i64 {
    30
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    Daily,
    TwiceDaily,
    Weekly,
}

/// Recurring discovery schedule. `next_run_at` is recomputed immediately
/// after a scheduled run is created, independent of the run's outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub id: Uuid,
    pub user_id: String,
    pub enabled: bool,
    pub cadence: Cadence,
    /// Time of day as `HH:MM` in the configured offset.
    pub time_of_day: String,
    #[serde(default)]
    pub utc_offset_minutes: i32,
    #[serde(default)]
    pub source_ids: Vec<String>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_run_id: Option<Uuid>,
}
