//! JSON operator API for offerscout.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use offerscout_core::{
    ConfigTemplate, ConflictDecision, ConflictFilter, LocationPatterns, PageRequest, RunFilter,
    RunStage, RunStatus, SourceConfig,
};
use offerscout_extract::CompiledPatterns;
use offerscout_storage::{RecordStore, StoreError};
use offerscout_sync::{
    resolve_conflict, RunOrchestrator, RunRejected, RunRequestOutcome, TestReport,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "offerscout-web";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: RunOrchestrator,
}

impl AppState {
    pub fn new(orchestrator: RunOrchestrator) -> Self {
        Self { orchestrator }
    }

    fn store(&self) -> &dyn RecordStore {
        self.orchestrator.store().as_ref()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/test", post(test_config_handler))
        .route("/api/sources", get(list_sources_handler))
        .route("/api/sources/{id}", put(save_source_handler))
        .route("/api/sources/{id}/run", post(run_source_handler))
        .route("/api/sources/{id}/stage", get(stage_handler))
        .route("/api/runs", get(list_runs_handler))
        .route("/api/conflicts", get(list_conflicts_handler))
        .route("/api/conflicts/{id}/resolve", post(resolve_conflict_handler))
        .route("/api/templates", get(templates_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "operator api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ErrorBody { error: message.into() })).into_response()
}

fn store_error(err: StoreError) -> Response {
    match err {
        StoreError::SourceNotFound(_)
        | StoreError::OfferNotFound(_)
        | StoreError::ConflictNotFound(_) => {
            error_response(StatusCode::NOT_FOUND, err.to_string())
        }
        StoreError::ConflictResolved(_) | StoreError::OfferExists(_) => {
            error_response(StatusCode::CONFLICT, err.to_string())
        }
        other => {
            error!(error = %other, "store request failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, other.to_string())
        }
    }
}

#[derive(Debug, Deserialize)]
struct TestConfigRequest {
    url: String,
    config: SourceConfig,
}

async fn test_config_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TestConfigRequest>,
) -> Json<TestReport> {
    Json(state.orchestrator.test_config(&request.url, &request.config).await)
}

async fn run_source_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.orchestrator.start_run(&id).await {
        Ok(handle) => (
            StatusCode::ACCEPTED,
            Json(RunRequestOutcome::accepted(handle.run_id)),
        )
            .into_response(),
        Err(rejected) => {
            let status = match &rejected {
                RunRejected::AlreadyRunning(_) => StatusCode::CONFLICT,
                RunRejected::UnknownSource(_) => StatusCode::NOT_FOUND,
                RunRejected::Store(err) => {
                    error!(error = %err, source_id = %id, "could not start run");
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            };
            (status, Json(RunRequestOutcome::rejected(rejected.reason()))).into_response()
        }
    }
}

#[derive(Debug, Serialize)]
struct StageBody {
    source_id: String,
    stage: RunStage,
    running: bool,
}

async fn stage_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Json<StageBody> {
    let registry = state.orchestrator.registry();
    Json(StageBody {
        stage: registry.stage(&id),
        running: registry.is_running(&id),
        source_id: id,
    })
}

#[derive(Debug, Default, Deserialize)]
struct RunsQuery {
    source_id: Option<String>,
    status: Option<RunStatus>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    page: Option<usize>,
    page_size: Option<usize>,
}

async fn list_runs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RunsQuery>,
) -> Response {
    let filter = RunFilter {
        source_id: query.source_id,
        status: query.status,
        from: query.from,
        to: query.to,
    };
    let page = PageRequest::new(query.page, query.page_size);
    match state.store().query_runs(&filter, page).await {
        Ok(runs) => Json(runs).into_response(),
        Err(err) => store_error(err),
    }
}

async fn list_conflicts_handler(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<ConflictFilter>,
) -> Response {
    match state.store().list_conflicts(&filter).await {
        Ok(conflicts) => Json(conflicts).into_response(),
        Err(err) => store_error(err),
    }
}

#[derive(Debug, Deserialize)]
struct ResolveRequest {
    decision: ConflictDecision,
}

async fn resolve_conflict_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<ResolveRequest>,
) -> Response {
    match resolve_conflict(state.store(), id, request.decision).await {
        Ok(conflict) => Json(conflict).into_response(),
        Err(err) => store_error(err),
    }
}

async fn list_sources_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store().list_sources().await {
        Ok(sources) => Json(sources).into_response(),
        Err(err) => store_error(err),
    }
}

async fn save_source_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(config): Json<SourceConfig>,
) -> Response {
    if config.source_id != id {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("path id `{id}` does not match source_id `{}`", config.source_id),
        );
    }
    if let Err(err) = CompiledPatterns::compile(&config) {
        return error_response(StatusCode::UNPROCESSABLE_ENTITY, err.to_string());
    }
    if let Err(err) = state.store().save_source(&config).await {
        return store_error(err);
    }
    match state.store().load_source(&id).await {
        Ok(Some(entry)) => Json(entry).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, format!("source `{id}` not found")),
        Err(err) => store_error(err),
    }
}

#[derive(Debug, Serialize)]
struct TemplateBody {
    key: &'static str,
    description: &'static str,
    location_patterns: LocationPatterns,
}

async fn templates_handler() -> Json<Vec<TemplateBody>> {
    Json(
        ConfigTemplate::all()
            .iter()
            .map(|t| TemplateBody {
                key: t.key(),
                description: t.description(),
                location_patterns: t.location_patterns(),
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request};
    use chrono::NaiveDate;
    use http_body_util::BodyExt;
    use offerscout_core::{
        ConflictRecord, ConflictStatus, FieldChange, OfferField, OfferFields, RunOptions,
        StoredOffer,
    };
    use offerscout_storage::{FetchError, FetchedPage, MemoryRecordStore, PageFetcher};
    use serde_json::{json, Value};
    use tokio::sync::Notify;
    use tower::ServiceExt;

    const PAGE: &str = concat!(
        r#"<div class="offer"><h2 class="offer-name">Acme Bank</h2>"#,
        r#"<p class="offer-reward">£150</p></div>"#,
    );

    struct HeldFetcher {
        release: Notify,
    }

    #[async_trait]
    impl PageFetcher for HeldFetcher {
        async fn fetch_page(
            &self,
            _source_id: &str,
            url: &str,
            _options: &RunOptions,
        ) -> Result<FetchedPage, FetchError> {
            self.release.notified().await;
            Ok(FetchedPage {
                status: 200,
                final_url: url.to_string(),
                body: PAGE.to_string(),
                attempts: 1,
                fetched_at: Utc::now(),
            })
        }
    }

    fn source() -> SourceConfig {
        SourceConfig::from_template(
            ConfigTemplate::GenericCardList,
            "acme",
            "Acme",
            "https://offers.example/",
        )
    }

    async fn test_app() -> (Router, Arc<MemoryRecordStore>, Arc<HeldFetcher>) {
        let store = Arc::new(MemoryRecordStore::with_sources([source()]).await);
        let fetcher = Arc::new(HeldFetcher { release: Notify::new() });
        let orchestrator = RunOrchestrator::new(store.clone(), fetcher.clone());
        (app(AppState::new(orchestrator)), store, fetcher)
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json(resp: Response) -> Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn run_request_is_accepted_then_conflicts_while_running() {
        let (app, _store, fetcher) = test_app().await;

        let first = app
            .clone()
            .oneshot(json_request("POST", "/api/sources/acme/run", json!({})))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(first).await["accepted"], json!(true));

        let second = app
            .clone()
            .oneshot(json_request("POST", "/api/sources/acme/run", json!({})))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);
        assert_eq!(
            body_json(second).await,
            json!({"accepted": false, "reason": "already_running"})
        );

        let stage = app.oneshot(get_request("/api/sources/acme/stage")).await.unwrap();
        assert_eq!(body_json(stage).await["running"], json!(true));
        fetcher.release.notify_one();
    }

    #[tokio::test]
    async fn unknown_source_run_is_not_found() {
        let (app, _store, _fetcher) = test_app().await;
        let resp = app
            .oneshot(json_request("POST", "/api/sources/ghost/run", json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn runs_are_filtered_and_paginated() {
        let (app, store, _fetcher) = test_app().await;
        let seeded = [
            (1, RunStatus::Success),
            (2, RunStatus::Failed),
            (3, RunStatus::Success),
        ];
        for (hour, status) in seeded {
            store
                .write_run_record(&offerscout_core::RunRecord {
                    run_id: Uuid::new_v4(),
                    source_id: "acme".to_string(),
                    started_at: DateTime::parse_from_rfc3339(&format!("2026-03-01T0{hour}:00:00Z"))
                        .unwrap()
                        .with_timezone(&Utc),
                    finished_at: Utc::now(),
                    status,
                    deals_found: 1,
                    errors: vec![],
                    artifact_hash: None,
                })
                .await
                .unwrap();
        }

        let resp = app
            .clone()
            .oneshot(get_request("/api/runs?source_id=acme&status=success&page=1&page_size=1"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["total"], json!(2));
        assert_eq!(body["runs"].as_array().unwrap().len(), 1);
        assert_eq!(body["runs"][0]["started_at"], json!("2026-03-01T03:00:00Z"));

        let ranged = app
            .clone()
            .oneshot(get_request("/api/runs?from=2026-03-01T02:00:00Z&to=2026-03-01T02:30:00Z"))
            .await
            .unwrap();
        assert_eq!(body_json(ranged).await["total"], json!(1));

        let beyond = app
            .clone()
            .oneshot(get_request("/api/runs?page=18446744073709551615&page_size=200"))
            .await
            .unwrap();
        assert_eq!(beyond.status(), StatusCode::OK);
        let body = body_json(beyond).await;
        assert_eq!(body["total"], json!(3));
        assert_eq!(body["runs"], json!([]));

        let bad = app.oneshot(get_request("/api/runs?status=exploded")).await.unwrap();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn conflicts_can_be_listed_and_resolved_once() {
        let (app, store, _fetcher) = test_app().await;
        let stored = OfferFields {
            name: "Acme Bank".to_string(),
            reward_amount: 100.0,
            required_payments: 0,
            pay_in_threshold: None,
            expiry: NaiveDate::from_ymd_opt(2099, 12, 31),
        };
        store
            .insert_offer(&StoredOffer::from_fields("acme", &stored, Utc::now()))
            .await
            .unwrap();
        let conflict = ConflictRecord {
            id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            source_id: "acme".to_string(),
            entity_name: "Acme Bank".to_string(),
            changes: vec![FieldChange {
                field: OfferField::RewardAmount,
                old: "100.00".to_string(),
                new: "150.00".to_string(),
            }],
            proposed: OfferFields {
                reward_amount: 150.0,
                ..stored
            },
            status: ConflictStatus::Pending,
            created_at: Utc::now(),
            resolved_at: None,
        };
        store.create_conflict(&conflict).await.unwrap();

        let listed = app
            .clone()
            .oneshot(get_request("/api/conflicts?status=pending"))
            .await
            .unwrap();
        let body = body_json(listed).await;
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["changes"][0]["field"], json!("rewardAmount"));

        let uri = format!("/api/conflicts/{}/resolve", conflict.id);
        let accepted = app
            .clone()
            .oneshot(json_request("POST", &uri, json!({"decision": "accept"})))
            .await
            .unwrap();
        assert_eq!(accepted.status(), StatusCode::OK);
        assert_eq!(body_json(accepted).await["status"], json!("accepted"));
        assert_eq!(store.offers().await[0].reward_amount, 150.0);

        let again = app
            .oneshot(json_request("POST", &uri, json!({"decision": "reject"})))
            .await
            .unwrap();
        assert_eq!(again.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn dry_run_returns_candidates_without_running() {
        let (app, store, fetcher) = test_app().await;
        fetcher.release.notify_one();
        let body = json!({
            "url": "https://offers.example/draft",
            "config": serde_json::to_value(source()).unwrap(),
        });

        let resp = app.oneshot(json_request("POST", "/api/test", body)).await.unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let report = body_json(resp).await;
        assert_eq!(report["success"], json!(true));
        assert_eq!(report["candidates"][0]["offer"]["name"], json!("Acme Bank"));
        let runs = store.query_runs(&RunFilter::default(), PageRequest::default()).await.unwrap();
        assert_eq!(runs.total, 0);
    }

    #[tokio::test]
    async fn saving_a_source_validates_it_first() {
        let (app, _store, _fetcher) = test_app().await;
        let mut edited = source();
        edited.priority = 7;

        let ok = app
            .clone()
            .oneshot(json_request(
                "PUT",
                "/api/sources/acme",
                serde_json::to_value(&edited).unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        assert_eq!(body_json(ok).await["config"]["priority"], json!(7));

        edited.extraction_patterns.reward_amount_pattern = "£\\d+".to_string();
        let invalid = app
            .clone()
            .oneshot(json_request(
                "PUT",
                "/api/sources/acme",
                serde_json::to_value(&edited).unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(invalid.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let mismatched = app
            .oneshot(json_request(
                "PUT",
                "/api/sources/other",
                serde_json::to_value(source()).unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(mismatched.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn templates_are_listed() {
        let (app, _store, _fetcher) = test_app().await;
        let resp = app.oneshot(get_request("/api/templates")).await.unwrap();
        let body = body_json(resp).await;
        assert_eq!(body[0]["key"], json!("generic-card-list"));
        assert_eq!(body[1]["location_patterns"]["container"], json!("table.offers tbody tr"));
    }
}
