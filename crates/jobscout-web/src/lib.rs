//! JSON API over the run controller: run lifecycle, standalone scoring,
//! and source metadata. Field names and status values on the wire match
//! the domain types exactly.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use jobscout_adapters::all_source_metadata;
use jobscout_core::{CandidateProfile, MatchPreferences, NormalizedJob, SearchParams, TriggerType};
use jobscout_engine::{score_job, RunController, RunError};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobscout-web";

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<RunController>,
}

impl AppState {
    pub fn new(controller: Arc<RunController>) -> Self {
        Self { controller }
    }
}

#[derive(Debug, Deserialize)]
struct CreateRunRequest {
    user_id: String,
    #[serde(default)]
    source_ids: Option<Vec<String>>,
    #[serde(default)]
    search_params: SearchParams,
}

#[derive(Debug, Deserialize)]
struct ListRunsQuery {
    user_id: String,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct StopRunRequest {
    user_id: String,
}

#[derive(Debug, Deserialize)]
struct ScoreRequest {
    job: NormalizedJob,
    #[serde(default)]
    profile: CandidateProfile,
    #[serde(default)]
    preferences: MatchPreferences,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/sources", get(sources_handler))
        .route("/api/runs", post(create_run_handler).get(list_runs_handler))
        .route("/api/runs/{id}", get(get_run_handler))
        .route("/api/runs/{id}/stop", post(stop_run_handler))
        .route("/api/score", post(score_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "jobscout web listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(serde_json::json!({"status": "ok"})).into_response()
}

async fn sources_handler() -> Response {
    Json(all_source_metadata()).into_response()
}

async fn create_run_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateRunRequest>,
) -> Response {
    match state
        .controller
        .create_run(
            &req.user_id,
            req.source_ids,
            req.search_params,
            TriggerType::Manual,
            None,
        )
        .await
    {
        Ok(run) => {
            let controller = Arc::clone(&state.controller);
            let run_id = run.id;
            tokio::spawn(async move {
                if let Err(err) = controller.execute(run_id).await {
                    tracing::error!(%run_id, error = %err, "run execution failed");
                }
            });
            (StatusCode::CREATED, Json(run)).into_response()
        }
        Err(err) => run_error_response(err),
    }
}

async fn list_runs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListRunsQuery>,
) -> Response {
    let store = state.controller.store();
    match store.list_runs(&query.user_id, query.limit.unwrap_or(20)).await {
        Ok(runs) => Json(runs).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn get_run_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(run_id): AxumPath<Uuid>,
) -> Response {
    let store = state.controller.store();
    match store.get_run(run_id).await {
        Ok(Some(run)) => Json(run).into_response(),
        Ok(None) => not_found("run not found"),
        Err(err) => server_error(err.into()),
    }
}

async fn stop_run_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(run_id): AxumPath<Uuid>,
    Json(req): Json<StopRunRequest>,
) -> Response {
    match state.controller.stop_run(run_id, &req.user_id).await {
        Ok(stopped) => Json(serde_json::json!({"stopped": stopped})).into_response(),
        Err(err) => run_error_response(err),
    }
}

async fn score_handler(Json(req): Json<ScoreRequest>) -> Response {
    let result = score_job(&req.job, &req.profile, &req.preferences);
    Json(result).into_response()
}

fn run_error_response(err: RunError) -> Response {
    let status = match &err {
        RunError::UnknownSource(_) => StatusCode::BAD_REQUEST,
        RunError::ActiveRunExists(_) => StatusCode::CONFLICT,
        RunError::RunNotFound(_) => StatusCode::NOT_FOUND,
        RunError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({"error": err.to_string()}))).into_response()
}

fn not_found(message: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({"error": message})),
    )
        .into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({"error": err.to_string()})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use jobscout_adapters::{JobSource, SourceError, SourceMetadata};
    use jobscout_core::{RawJobRecord, SourceType};
    use jobscout_engine::{EngineConfig, SourceResolver};
    use jobscout_storage::{HttpFetcher, MemoryStore, Persistence};
    use tower::ServiceExt;

    const STUB_METADATA: SourceMetadata = SourceMetadata {
        source_id: "stub",
        display_name: "Stub",
        source_type: SourceType::Api,
        regions: &["Global"],
        requires_auth: false,
        robots_compliant: true,
        rate_limit_rpm: 60,
    };

    struct StubSource;

    #[async_trait]
    impl JobSource for StubSource {
        fn metadata(&self) -> &SourceMetadata {
            &STUB_METADATA
        }

        async fn search(
            &self,
            _http: &HttpFetcher,
            _query: &str,
            _location: &str,
            _limit: usize,
        ) -> Result<Vec<RawJobRecord>, SourceError> {
            Ok(vec![RawJobRecord {
                external_id: "stub-1".into(),
                url: "https://jobs.example.com/stub-1".into(),
                company: "Acme".into(),
                title: "Rust Engineer".into(),
                location: "Remote".into(),
                description: "Rust and Postgres.".into(),
                ..RawJobRecord::default()
            }])
        }
    }

    struct StubResolver;

    impl SourceResolver for StubResolver {
        fn resolve(&self, source_id: &str) -> Option<Box<dyn JobSource>> {
            (source_id == "stub").then(|| Box::new(StubSource) as Box<dyn JobSource>)
        }

        fn available(&self) -> Vec<String> {
            vec!["stub".to_string()]
        }
    }

    fn test_state() -> (Arc<MemoryStore>, AppState) {
        let store = Arc::new(MemoryStore::new());
        let controller = RunController::new(
            Arc::clone(&store) as Arc<dyn Persistence>,
            Box::new(StubResolver),
            EngineConfig::from_env(),
        )
        .unwrap();
        (store, AppState::new(Arc::new(controller)))
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_and_sources() {
        let (_store, state) = test_state();
        let app = app(state);

        let resp = app.clone().oneshot(get("/api/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "ok");

        let resp = app.oneshot(get("/api/sources")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let sources = body_json(resp).await;
        let ids: Vec<&str> = sources
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["source_id"].as_str().unwrap())
            .collect();
        assert!(ids.contains(&"remotive"));
        assert!(ids.contains(&"arbeitnow"));
        assert!(ids.contains(&"hackernews_jobs"));
    }

    #[tokio::test]
    async fn create_run_returns_pending_run() {
        let (_store, state) = test_state();
        let app = app(state);

        let resp = app
            .oneshot(post_json(
                "/api/runs",
                serde_json::json!({"user_id": "alice", "source_ids": ["stub"]}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let run = body_json(resp).await;
        assert_eq!(run["user_id"], "alice");
        assert_eq!(run["status"], "pending");
        assert_eq!(run["trigger_type"], "manual");
        assert_eq!(run["progress"]["total_sources"], 1);
    }

    #[tokio::test]
    async fn second_active_run_conflicts() {
        let (_store, state) = test_state();
        // Seed an active run directly so the second request is deterministic.
        state
            .controller
            .create_run("bob", None, SearchParams::default(), TriggerType::Manual, None)
            .await
            .unwrap();
        let app = app(state);

        let resp = app
            .oneshot(post_json("/api/runs", serde_json::json!({"user_id": "bob"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn unknown_source_is_rejected() {
        let (_store, state) = test_state();
        let app = app(state);

        let resp = app
            .oneshot(post_json(
                "/api/runs",
                serde_json::json!({"user_id": "alice", "source_ids": ["linkedin"]}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn get_and_list_and_stop_run() {
        let (_store, state) = test_state();
        let run = state
            .controller
            .create_run("carol", None, SearchParams::default(), TriggerType::Manual, None)
            .await
            .unwrap();
        let app = app(state);

        let resp = app
            .clone()
            .oneshot(get(&format!("/api/runs/{}", run.id)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["id"], run.id.to_string());

        let resp = app
            .clone()
            .oneshot(get("/api/runs?user_id=carol"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await.as_array().unwrap().len(), 1);

        let resp = app
            .clone()
            .oneshot(post_json(
                &format!("/api/runs/{}/stop", run.id),
                serde_json::json!({"user_id": "someone-else"}),
            ))
            .await
            .unwrap();
        assert_eq!(body_json(resp).await["stopped"], false);

        let resp = app
            .clone()
            .oneshot(post_json(
                &format!("/api/runs/{}/stop", run.id),
                serde_json::json!({"user_id": "carol"}),
            ))
            .await
            .unwrap();
        assert_eq!(body_json(resp).await["stopped"], true);

        let resp = app
            .oneshot(get(&format!("/api/runs/{}", Uuid::new_v4())))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn score_endpoint_returns_breakdown() {
        use jobscout_core::{NormalizeContext, NormalizedJob};

        let raw = RawJobRecord {
            external_id: "j1".into(),
            url: "https://jobs.example.com/j1".into(),
            company: "Acme".into(),
            title: "Software Engineer".into(),
            location: "Berlin".into(),
            description: "Python and AWS.".into(),
            ..RawJobRecord::default()
        };
        let ctx = NormalizeContext {
            user_id: "u1".into(),
            run_id: Uuid::new_v4(),
            source_id: "stub".into(),
            source_name: "Stub".into(),
            source_type: SourceType::Api,
            scraped_at: chrono::Utc::now(),
        };
        let job_payload = NormalizedJob::from_raw(&raw, &ctx);

        let (_store, state) = test_state();
        let app = app(state);
        let resp = app
            .oneshot(post_json(
                "/api/score",
                serde_json::json!({
                    "job": job_payload,
                    "profile": {"user_id": "u1", "skills": ["python"]},
                    "preferences": {"user_id": "u1"}
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let result = body_json(resp).await;
        assert_eq!(result["breakdown"].as_object().unwrap().len(), 7);
        let score = result["score"].as_f64().unwrap();
        assert!((0.0..=100.0).contains(&score));
    }
}
