//! Persistence capability and HTTP fetch utilities for jobscout.
//!
//! The run controller and scheduler only ever talk to [`Persistence`];
//! `MemoryStore` backs tests and the single-shot CLI path, `PgStore` backs
//! deployments. Both enforce the monotonic run status transition guard so
//! an external `stopped` write can never regress a terminal run.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobscout_core::{
    CandidateProfile, JobRun, MatchPreferences, NormalizedJob, RunErrorEntry, RunProgress,
    RunStats, RunStatus, ScheduleConfig,
};
use reqwest::StatusCode;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info_span;
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobscout-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("run {0} not found")]
    RunNotFound(Uuid),
    #[error("invalid status transition {from:?} -> {to:?}")]
    InvalidTransition { from: RunStatus, to: RunStatus },
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("database: {0}")]
    Database(#[from] sqlx::Error),
}

/// Bounded snapshot of identity keys already persisted for one user,
/// fetched once at run start and consulted by the dedup engine.
#[derive(Debug, Clone, Default)]
pub struct IdentitySnapshot {
    pub fingerprints: HashSet<String>,
    pub canonical_urls: HashSet<String>,
}

/// Storage contract consumed by the run controller, scheduler, and the
/// caller surface. Progress and stats writes are set-semantics so
/// re-delivery never double-counts.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn create_run(&self, run: &JobRun) -> Result<(), StoreError>;
    async fn get_run(&self, run_id: Uuid) -> Result<Option<JobRun>, StoreError>;
    async fn list_runs(&self, user_id: &str, limit: usize) -> Result<Vec<JobRun>, StoreError>;
    async fn get_active_run(&self, user_id: &str) -> Result<Option<JobRun>, StoreError>;

    /// Apply a status transition. Returns `false` (without writing) when
    /// the state machine forbids the move, e.g. stopping a terminal run.
    /// Sets `started_at` on entry to `running` and `completed_at` on any
    /// terminal state.
    async fn update_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn update_run_progress(
        &self,
        run_id: Uuid,
        progress: &RunProgress,
    ) -> Result<(), StoreError>;
    async fn update_run_stats(
        &self,
        run_id: Uuid,
        stats: &RunStats,
        export_id: Option<String>,
    ) -> Result<(), StoreError>;
    async fn add_run_error(&self, run_id: Uuid, entry: &RunErrorEntry) -> Result<(), StoreError>;

    /// Delete terminal runs created before the cutoff. Active runs are
    /// never pruned. Returns the number of runs removed.
    async fn prune_runs(&self, older_than: DateTime<Utc>) -> Result<usize, StoreError>;

    async fn insert_jobs(&self, jobs: &[NormalizedJob]) -> Result<(), StoreError>;
    async fn existing_identity_keys(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<IdentitySnapshot, StoreError>;

    async fn get_profile(&self, user_id: &str) -> Result<Option<CandidateProfile>, StoreError>;
    async fn put_profile(&self, profile: &CandidateProfile) -> Result<(), StoreError>;
    async fn get_preferences(&self, user_id: &str)
        -> Result<Option<MatchPreferences>, StoreError>;
    async fn put_preferences(&self, prefs: &MatchPreferences) -> Result<(), StoreError>;

    async fn get_schedule(&self, user_id: &str) -> Result<Option<ScheduleConfig>, StoreError>;
    async fn put_schedule(&self, schedule: &ScheduleConfig) -> Result<(), StoreError>;
    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleConfig>, StoreError>;
}

fn apply_status(run: &mut JobRun, status: RunStatus, at: DateTime<Utc>) -> bool {
    if !run.status.can_transition_to(status) {
        return false;
    }
    run.status = status;
    if status == RunStatus::Running && run.started_at.is_none() {
        run.started_at = Some(at);
    }
    if status.is_terminal() && run.completed_at.is_none() {
        run.completed_at = Some(at);
    }
    true
}

// ==================== in-memory store ====================

/// RwLock-backed store used in tests and the one-shot CLI path.
#[derive(Debug, Default)]
pub struct MemoryStore {
    runs: RwLock<HashMap<Uuid, JobRun>>,
    jobs: RwLock<Vec<NormalizedJob>>,
    profiles: RwLock<HashMap<String, CandidateProfile>>,
    preferences: RwLock<HashMap<String, MatchPreferences>>,
    schedules: RwLock<HashMap<String, ScheduleConfig>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs persisted for a user, most recently scraped first.
    pub async fn jobs_for_user(&self, user_id: &str) -> Vec<NormalizedJob> {
        let jobs = self.jobs.read().await;
        let mut out: Vec<NormalizedJob> =
            jobs.iter().filter(|j| j.user_id == user_id).cloned().collect();
        out.sort_by(|a, b| b.scraped_at.cmp(&a.scraped_at));
        out
    }
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn create_run(&self, run: &JobRun) -> Result<(), StoreError> {
        self.runs.write().await.insert(run.id, run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<JobRun>, StoreError> {
        Ok(self.runs.read().await.get(&run_id).cloned())
    }

    async fn list_runs(&self, user_id: &str, limit: usize) -> Result<Vec<JobRun>, StoreError> {
        let runs = self.runs.read().await;
        let mut out: Vec<JobRun> =
            runs.values().filter(|r| r.user_id == user_id).cloned().collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out.truncate(limit);
        Ok(out)
    }

    async fn get_active_run(&self, user_id: &str) -> Result<Option<JobRun>, StoreError> {
        let runs = self.runs.read().await;
        Ok(runs
            .values()
            .find(|r| r.user_id == user_id && r.status.is_active())
            .cloned())
    }

    async fn update_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut runs = self.runs.write().await;
        let run = runs.get_mut(&run_id).ok_or(StoreError::RunNotFound(run_id))?;
        Ok(apply_status(run, status, at))
    }

    async fn update_run_progress(
        &self,
        run_id: Uuid,
        progress: &RunProgress,
    ) -> Result<(), StoreError> {
        let mut runs = self.runs.write().await;
        let run = runs.get_mut(&run_id).ok_or(StoreError::RunNotFound(run_id))?;
        run.progress = progress.clone();
        Ok(())
    }

    async fn update_run_stats(
        &self,
        run_id: Uuid,
        stats: &RunStats,
        export_id: Option<String>,
    ) -> Result<(), StoreError> {
        let mut runs = self.runs.write().await;
        let run = runs.get_mut(&run_id).ok_or(StoreError::RunNotFound(run_id))?;
        run.stats = stats.clone();
        if export_id.is_some() {
            run.export_id = export_id;
        }
        Ok(())
    }

    async fn add_run_error(&self, run_id: Uuid, entry: &RunErrorEntry) -> Result<(), StoreError> {
        let mut runs = self.runs.write().await;
        let run = runs.get_mut(&run_id).ok_or(StoreError::RunNotFound(run_id))?;
        run.errors.push(entry.clone());
        Ok(())
    }

    async fn prune_runs(&self, older_than: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut runs = self.runs.write().await;
        let before = runs.len();
        runs.retain(|_, r| !(r.status.is_terminal() && r.created_at < older_than));
        Ok(before - runs.len())
    }

    async fn insert_jobs(&self, jobs: &[NormalizedJob]) -> Result<(), StoreError> {
        self.jobs.write().await.extend_from_slice(jobs);
        Ok(())
    }

    async fn existing_identity_keys(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<IdentitySnapshot, StoreError> {
        let jobs = self.jobs_for_user(user_id).await;
        let mut snapshot = IdentitySnapshot::default();
        for job in jobs.into_iter().take(limit) {
            snapshot.fingerprints.insert(job.fingerprint.digest.clone());
            if !job.canonical_url.is_empty() {
                snapshot.canonical_urls.insert(job.canonical_url.clone());
            }
        }
        Ok(snapshot)
    }

    async fn get_profile(&self, user_id: &str) -> Result<Option<CandidateProfile>, StoreError> {
        Ok(self.profiles.read().await.get(user_id).cloned())
    }

    async fn put_profile(&self, profile: &CandidateProfile) -> Result<(), StoreError> {
        self.profiles
            .write()
            .await
            .insert(profile.user_id.clone(), profile.clone());
        Ok(())
    }

    async fn get_preferences(
        &self,
        user_id: &str,
    ) -> Result<Option<MatchPreferences>, StoreError> {
        Ok(self.preferences.read().await.get(user_id).cloned())
    }

    async fn put_preferences(&self, prefs: &MatchPreferences) -> Result<(), StoreError> {
        self.preferences
            .write()
            .await
            .insert(prefs.user_id.clone(), prefs.clone());
        Ok(())
    }

    async fn get_schedule(&self, user_id: &str) -> Result<Option<ScheduleConfig>, StoreError> {
        Ok(self.schedules.read().await.get(user_id).cloned())
    }

    async fn put_schedule(&self, schedule: &ScheduleConfig) -> Result<(), StoreError> {
        self.schedules
            .write()
            .await
            .insert(schedule.user_id.clone(), schedule.clone());
        Ok(())
    }

    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleConfig>, StoreError> {
        let schedules = self.schedules.read().await;
        Ok(schedules
            .values()
            .filter(|s| s.enabled && s.next_run_at.map(|t| t <= now).unwrap_or(true))
            .cloned()
            .collect())
    }
}

// ==================== postgres store ====================

/// Postgres-backed store. Rows keep a few indexed key columns plus the
/// full document as JSONB, so the schema tracks the domain types without
/// a migration per field.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.into()))?;
        Ok(())
    }

    async fn load_run(&self, run_id: Uuid) -> Result<JobRun, StoreError> {
        let row = sqlx::query("SELECT data FROM job_runs WHERE id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::RunNotFound(run_id))?;
        let data: serde_json::Value = row.try_get("data")?;
        Ok(serde_json::from_value(data)?)
    }

    async fn save_run(&self, run: &JobRun) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE job_runs
               SET status = $2, data = $3
             WHERE id = $1
            "#,
        )
        .bind(run.id)
        .bind(status_str(run.status))
        .bind(serde_json::to_value(run)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn status_str(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Pending => "pending",
        RunStatus::Running => "running",
        RunStatus::Completed => "completed",
        RunStatus::Failed => "failed",
        RunStatus::Stopped => "stopped",
    }
}

#[async_trait]
impl Persistence for PgStore {
    async fn create_run(&self, run: &JobRun) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO job_runs (id, user_id, status, created_at, data)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(run.id)
        .bind(&run.user_id)
        .bind(status_str(run.status))
        .bind(run.created_at)
        .bind(serde_json::to_value(run)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<JobRun>, StoreError> {
        match self.load_run(run_id).await {
            Ok(run) => Ok(Some(run)),
            Err(StoreError::RunNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list_runs(&self, user_id: &str, limit: usize) -> Result<Vec<JobRun>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT data FROM job_runs
             WHERE user_id = $1
             ORDER BY created_at DESC
             LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let data: serde_json::Value = row.try_get("data")?;
            out.push(serde_json::from_value(data)?);
        }
        Ok(out)
    }

    async fn get_active_run(&self, user_id: &str) -> Result<Option<JobRun>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT data FROM job_runs
             WHERE user_id = $1 AND status IN ('pending', 'running')
             ORDER BY created_at DESC
             LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => {
                let data: serde_json::Value = row.try_get("data")?;
                Ok(Some(serde_json::from_value(data)?))
            }
            None => Ok(None),
        }
    }

    async fn update_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut run = self.load_run(run_id).await?;
        if !apply_status(&mut run, status, at) {
            return Ok(false);
        }
        self.save_run(&run).await?;
        Ok(true)
    }

    async fn update_run_progress(
        &self,
        run_id: Uuid,
        progress: &RunProgress,
    ) -> Result<(), StoreError> {
        let mut run = self.load_run(run_id).await?;
        run.progress = progress.clone();
        self.save_run(&run).await
    }

    async fn update_run_stats(
        &self,
        run_id: Uuid,
        stats: &RunStats,
        export_id: Option<String>,
    ) -> Result<(), StoreError> {
        let mut run = self.load_run(run_id).await?;
        run.stats = stats.clone();
        if export_id.is_some() {
            run.export_id = export_id;
        }
        self.save_run(&run).await
    }

    async fn add_run_error(&self, run_id: Uuid, entry: &RunErrorEntry) -> Result<(), StoreError> {
        let mut run = self.load_run(run_id).await?;
        run.errors.push(entry.clone());
        self.save_run(&run).await
    }

    async fn prune_runs(&self, older_than: DateTime<Utc>) -> Result<usize, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM job_runs
             WHERE created_at < $1
               AND status IN ('completed', 'failed', 'stopped')
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn insert_jobs(&self, jobs: &[NormalizedJob]) -> Result<(), StoreError> {
        for job in jobs {
            sqlx::query(
                r#"
                INSERT INTO jobs (id, user_id, fingerprint, canonical_url, scraped_at, data)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(job.id)
            .bind(&job.user_id)
            .bind(&job.fingerprint.digest)
            .bind(&job.canonical_url)
            .bind(job.scraped_at)
            .bind(serde_json::to_value(job)?)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn existing_identity_keys(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<IdentitySnapshot, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT fingerprint, canonical_url FROM jobs
             WHERE user_id = $1
             ORDER BY scraped_at DESC
             LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut snapshot = IdentitySnapshot::default();
        for row in rows {
            let fingerprint: String = row.try_get("fingerprint")?;
            let canonical: String = row.try_get("canonical_url")?;
            snapshot.fingerprints.insert(fingerprint);
            if !canonical.is_empty() {
                snapshot.canonical_urls.insert(canonical);
            }
        }
        Ok(snapshot)
    }

    async fn get_profile(&self, user_id: &str) -> Result<Option<CandidateProfile>, StoreError> {
        let row = sqlx::query("SELECT data FROM profiles WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let data: serde_json::Value = row.try_get("data")?;
                Ok(Some(serde_json::from_value(data)?))
            }
            None => Ok(None),
        }
    }

    async fn put_profile(&self, profile: &CandidateProfile) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO profiles (user_id, data)
            VALUES ($1, $2)
            ON CONFLICT (user_id) DO UPDATE SET data = EXCLUDED.data
            "#,
        )
        .bind(&profile.user_id)
        .bind(serde_json::to_value(profile)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_preferences(
        &self,
        user_id: &str,
    ) -> Result<Option<MatchPreferences>, StoreError> {
        let row = sqlx::query("SELECT data FROM preferences WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let data: serde_json::Value = row.try_get("data")?;
                Ok(Some(serde_json::from_value(data)?))
            }
            None => Ok(None),
        }
    }

    async fn put_preferences(&self, prefs: &MatchPreferences) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO preferences (user_id, data)
            VALUES ($1, $2)
            ON CONFLICT (user_id) DO UPDATE SET data = EXCLUDED.data
            "#,
        )
        .bind(&prefs.user_id)
        .bind(serde_json::to_value(prefs)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_schedule(&self, user_id: &str) -> Result<Option<ScheduleConfig>, StoreError> {
        let row = sqlx::query("SELECT data FROM schedules WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let data: serde_json::Value = row.try_get("data")?;
                Ok(Some(serde_json::from_value(data)?))
            }
            None => Ok(None),
        }
    }

    async fn put_schedule(&self, schedule: &ScheduleConfig) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO schedules (id, user_id, enabled, next_run_at, data)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id) DO UPDATE
               SET enabled = EXCLUDED.enabled,
                   next_run_at = EXCLUDED.next_run_at,
                   data = EXCLUDED.data
            "#,
        )
        .bind(schedule.id)
        .bind(&schedule.user_id)
        .bind(schedule.enabled)
        .bind(schedule.next_run_at)
        .bind(serde_json::to_value(schedule)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleConfig>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT data FROM schedules
             WHERE enabled AND (next_run_at IS NULL OR next_run_at <= $1)
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let data: serde_json::Value = row.try_get("data")?;
            out.push(serde_json::from_value(data)?);
        }
        Ok(out)
    }
}

// ==================== http fetch ====================

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

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid json from {url}: {message}")]
    InvalidJson { url: String, message: String },
}

/// Shared HTTP client for adapters. The call timeout is fixed per client;
/// retryable failures back off exponentially up to the configured cap.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        use anyhow::Context;
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn get_json(
        &self,
        source_id: &str,
        url: &str,
        query: &[(&str, String)],
        headers: &[(&'static str, String)],
    ) -> Result<serde_json::Value, FetchError> {
        let span = info_span!("http_get", source_id, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let mut request = self.client.get(url).query(query);
            for (name, value) in headers {
                request = request.header(*name, value);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?;
                        return serde_json::from_slice(&body).map_err(|e| {
                            FetchError::InvalidJson {
                                url: final_url,
                                message: e.to_string(),
                            }
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobscout_core::{JobRun, SearchParams, TriggerType};

    fn mk_run(user_id: &str) -> JobRun {
        JobRun::new(
            user_id,
            TriggerType::Manual,
            vec!["remotive".into()],
            SearchParams::default(),
        )
    }

    fn mk_job(user_id: &str, company: &str, title: &str, url: &str) -> NormalizedJob {
        use jobscout_core::{NormalizeContext, RawJobRecord, SourceType};
        let raw = RawJobRecord {
            external_id: "e1".into(),
            url: url.into(),
            company: company.into(),
            title: title.into(),
            ..RawJobRecord::default()
        };
        let ctx = NormalizeContext {
            user_id: user_id.into(),
            run_id: Uuid::new_v4(),
            source_id: "remotive".into(),
            source_name: "Remotive".into(),
            source_type: SourceType::Api,
            scraped_at: Utc::now(),
        };
        NormalizedJob::from_raw(&raw, &ctx)
    }

    #[tokio::test]
    async fn run_roundtrip_and_active_lookup() {
        let store = MemoryStore::new();
        let run = mk_run("user-1");
        store.create_run(&run).await.unwrap();

        let loaded = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(loaded, run);

        let active = store.get_active_run("user-1").await.unwrap();
        assert_eq!(active.map(|r| r.id), Some(run.id));
        assert!(store.get_active_run("user-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn status_transitions_guarded_in_store() {
        let store = MemoryStore::new();
        let run = mk_run("user-1");
        store.create_run(&run).await.unwrap();

        assert!(store
            .update_run_status(run.id, RunStatus::Running, Utc::now())
            .await
            .unwrap());
        let loaded = store.get_run(run.id).await.unwrap().unwrap();
        assert!(loaded.started_at.is_some());

        assert!(store
            .update_run_status(run.id, RunStatus::Completed, Utc::now())
            .await
            .unwrap());
        // Terminal runs never regress, even for a stop request.
        assert!(!store
            .update_run_status(run.id, RunStatus::Stopped, Utc::now())
            .await
            .unwrap());
        let loaded = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Completed);
        assert!(loaded.completed_at.is_some());
    }

    #[tokio::test]
    async fn progress_updates_are_set_semantics() {
        let store = MemoryStore::new();
        let run = mk_run("user-1");
        store.create_run(&run).await.unwrap();

        let progress = RunProgress {
            total_sources: 1,
            completed_sources: 1,
            jobs_found: 7,
            ..RunProgress::default()
        };
        // Re-delivery of the same snapshot must not double-count.
        store.update_run_progress(run.id, &progress).await.unwrap();
        store.update_run_progress(run.id, &progress).await.unwrap();

        let loaded = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(loaded.progress.jobs_found, 7);
        assert_eq!(loaded.progress.completed_sources, 1);
    }

    #[tokio::test]
    async fn identity_snapshot_is_bounded_and_scoped_to_user() {
        let store = MemoryStore::new();
        let jobs = vec![
            mk_job("user-1", "Acme", "Engineer", "https://a.com/1?x=1"),
            mk_job("user-1", "Beta", "Analyst", "https://b.com/2"),
            mk_job("user-2", "Gamma", "Designer", "https://c.com/3"),
        ];
        store.insert_jobs(&jobs).await.unwrap();

        let snapshot = store.existing_identity_keys("user-1", 100).await.unwrap();
        assert_eq!(snapshot.fingerprints.len(), 2);
        assert!(snapshot.canonical_urls.contains("https://a.com/1"));
        assert!(!snapshot.canonical_urls.contains("https://c.com/3"));

        let bounded = store.existing_identity_keys("user-1", 1).await.unwrap();
        assert_eq!(bounded.fingerprints.len(), 1);
    }

    #[tokio::test]
    async fn prune_removes_only_old_terminal_runs() {
        let store = MemoryStore::new();
        let mut old_done = mk_run("user-1");
        old_done.created_at = Utc::now() - chrono::Duration::days(60);
        store.create_run(&old_done).await.unwrap();
        store
            .update_run_status(old_done.id, RunStatus::Running, Utc::now())
            .await
            .unwrap();
        store
            .update_run_status(old_done.id, RunStatus::Completed, Utc::now())
            .await
            .unwrap();

        let mut old_active = mk_run("user-2");
        old_active.created_at = Utc::now() - chrono::Duration::days(60);
        store.create_run(&old_active).await.unwrap();

        let removed = store
            .prune_runs(Utc::now() - chrono::Duration::days(30))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_run(old_done.id).await.unwrap().is_none());
        assert!(store.get_run(old_active.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn due_schedules_filters_on_enabled_and_next_run() {
        use jobscout_core::{Cadence, ScheduleConfig};
        let store = MemoryStore::new();
        let now = Utc::now();
        let due = ScheduleConfig {
            id: Uuid::new_v4(),
            user_id: "user-1".into(),
            enabled: true,
            cadence: Cadence::Daily,
            time_of_day: "07:30".into(),
            utc_offset_minutes: 0,
            source_ids: vec![],
            last_run_at: None,
            next_run_at: Some(now - chrono::Duration::minutes(1)),
            last_run_id: None,
        };
        let mut not_due = due.clone();
        not_due.user_id = "user-2".into();
        not_due.next_run_at = Some(now + chrono::Duration::hours(1));
        let mut disabled = due.clone();
        disabled.user_id = "user-3".into();
        disabled.enabled = false;

        store.put_schedule(&due).await.unwrap();
        store.put_schedule(&not_due).await.unwrap();
        store.put_schedule(&disabled).await.unwrap();

        let found = store.due_schedules(now).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].user_id, "user-1");
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }
}
