//! JSON API over the ingestion, monitoring, and analytics services.
//!
//! Authentication is the host application's middleware; this router only
//! shapes requests and responses.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use cvrs_core::SourceRegistry;
use cvrs_monitor::{AnalyticsAggregator, MonitoringService};
use cvrs_storage::{ClaimError, ClaimService, VendorStore};
use cvrs_sync::SourceManager;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use uuid::Uuid;

pub const CRATE_NAME: &str = "cvrs-web";

#[derive(Clone)]
pub struct AppState {
    pub registry: SourceRegistry,
    pub manager: Arc<SourceManager>,
    pub monitor: Arc<MonitoringService>,
    pub analytics: Arc<AnalyticsAggregator>,
    pub store: Arc<dyn VendorStore>,
    pub claims: Arc<ClaimService>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/sources", get(sources_handler))
        .route("/health", get(health_handler))
        .route("/ingest/full", post(ingest_full_handler))
        .route("/ingest/{source}", post(ingest_source_handler))
        .route("/jobs", get(jobs_handler))
        .route("/jobs/{id}", get(job_handler))
        .route("/jobs/{id}/pause", post(job_pause_handler))
        .route("/jobs/{id}/resume", post(job_resume_handler))
        .route("/monitoring/dashboard", get(monitoring_dashboard_handler))
        .route("/monitoring/alerts", get(monitoring_alerts_handler))
        .route("/monitoring/metrics", get(monitoring_metrics_handler))
        .route("/monitoring/alerts/{id}/resolve", post(alert_resolve_handler))
        .route("/analytics/sources", get(analytics_sources_handler))
        .route("/analytics/errors", get(analytics_errors_handler))
        .route("/analytics/cost-routing", get(analytics_cost_routing_handler))
        .route("/analytics/summary", get(analytics_summary_handler))
        .route("/vendors/{id}/claim", post(claim_initiate_handler))
        .route("/claims/verify", post(claim_verify_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

fn api_error(status: StatusCode, error: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({
            "success": false,
            "error": error,
            "message": message.into(),
        })),
    )
        .into_response()
}

async fn sources_handler(State(state): State<Arc<AppState>>) -> Response {
    let sources: Vec<_> = state
        .registry
        .sources
        .iter()
        .map(|source| {
            let last_run = state.monitor.last_run_for(&source.name);
            json!({
                "name": source.name,
                "display_name": source.display_name,
                "url": source.url,
                "source_type": source.source_type,
                "enabled": source.enabled,
                "rate_limit": source.rate_limit,
                "last_sync": last_run.as_ref().map(|r| r.completed_at),
                "last_sync_success": last_run.as_ref().map(|r| r.success),
            })
        })
        .collect();
    Json(json!({ "success": true, "sources": sources })).into_response()
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let metrics = state.monitor.current_metrics();
    Json(json!({ "success": true, "metrics": metrics })).into_response()
}

async fn ingest_full_handler(State(state): State<Arc<AppState>>) -> Response {
    let sources = state.registry.enabled();
    if sources.is_empty() {
        return api_error(
            StatusCode::BAD_REQUEST,
            "no_enabled_sources",
            "no enabled sources configured",
        );
    }
    let names: Vec<String> = sources.iter().map(|s| s.name.clone()).collect();
    let job_id = state.manager.clone().start_job(sources);
    Json(json!({ "success": true, "job_id": job_id, "sources": names })).into_response()
}

async fn ingest_source_handler(
    State(state): State<Arc<AppState>>,
    Path(source): Path<String>,
) -> Response {
    let Some(source) = state.registry.find(&source).cloned() else {
        return api_error(
            StatusCode::NOT_FOUND,
            "unknown_source",
            format!("no source named {source}"),
        );
    };
    let job_id = state.manager.clone().start_job(vec![source.clone()]);
    Json(json!({ "success": true, "job_id": job_id, "sources": [source.name] })).into_response()
}

async fn jobs_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({ "success": true, "jobs": state.manager.jobs.list() })).into_response()
}

async fn job_handler(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    match state.manager.jobs.get(id) {
        Some(job) => Json(json!({ "success": true, "job": job })).into_response(),
        None => api_error(StatusCode::NOT_FOUND, "unknown_job", format!("no job {id}")),
    }
}

async fn job_pause_handler(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    job_control(&state, id, true)
}

async fn job_resume_handler(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    job_control(&state, id, false)
}

fn job_control(state: &AppState, id: Uuid, pause: bool) -> Response {
    if state.manager.jobs.get(id).is_none() {
        return api_error(StatusCode::NOT_FOUND, "unknown_job", format!("no job {id}"));
    }
    let flipped = if pause {
        state.manager.jobs.pause(id)
    } else {
        state.manager.jobs.resume(id)
    };
    if flipped {
        Json(json!({ "success": true, "job_id": id, "paused": pause })).into_response()
    } else {
        api_error(
            StatusCode::CONFLICT,
            "job_not_active",
            format!("job {id} has already finished"),
        )
    }
}

async fn monitoring_dashboard_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({ "success": true, "dashboard": state.monitor.dashboard() })).into_response()
}

async fn monitoring_alerts_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({ "success": true, "alerts": state.monitor.alerts(true) })).into_response()
}

async fn monitoring_metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({ "success": true, "snapshots": state.monitor.snapshots() })).into_response()
}

async fn alert_resolve_handler(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    if state.monitor.resolve_alert(id) {
        Json(json!({ "success": true, "alert_id": id })).into_response()
    } else {
        api_error(
            StatusCode::NOT_FOUND,
            "unknown_alert",
            format!("no unresolved alert {id}"),
        )
    }
}

async fn analytics_sources_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({ "success": true, "sources": state.analytics.source_health() })).into_response()
}

async fn analytics_errors_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({ "success": true, "errors": state.analytics.error_breakdown() })).into_response()
}

async fn analytics_cost_routing_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({ "success": true, "cost_routing": state.analytics.cost_routing() })).into_response()
}

async fn analytics_summary_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({
        "success": true,
        "summary": state.analytics.summary(),
        "trends": state.analytics.trends(7),
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
struct ClaimRequest {
    email: String,
}

#[derive(Debug, Deserialize)]
struct VerifyRequest {
    token: String,
    user_id: Uuid,
}

async fn claim_initiate_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<ClaimRequest>,
) -> Response {
    match state.claims.initiate(id, &body.email).await {
        Ok(token) => {
            Json(json!({ "success": true, "vendor_id": id, "token": token })).into_response()
        }
        Err(err) => claim_error_response(err),
    }
}

async fn claim_verify_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<VerifyRequest>,
) -> Response {
    match state.claims.verify(&body.token, body.user_id).await {
        Ok(vendor) => Json(json!({ "success": true, "vendor": vendor })).into_response(),
        Err(err) => claim_error_response(err),
    }
}

fn claim_error_response(err: ClaimError) -> Response {
    let (status, code) = match &err {
        ClaimError::UnknownToken => (StatusCode::NOT_FOUND, "unknown_token"),
        ClaimError::Expired => (StatusCode::GONE, "token_expired"),
        ClaimError::AlreadyClaimed => (StatusCode::CONFLICT, "token_already_used"),
        ClaimError::TooManyAttempts => (StatusCode::TOO_MANY_REQUESTS, "too_many_attempts"),
        ClaimError::VendorAlreadyOwned => (StatusCode::CONFLICT, "vendor_already_owned"),
        ClaimError::VendorMissing(_) => (StatusCode::NOT_FOUND, "unknown_vendor"),
        ClaimError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
    };
    api_error(status, code, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use cvrs_core::{BusinessRecord, RuntimeConfig};
    use cvrs_monitor::MonitorConfig;
    use cvrs_storage::{ImportOutcome, MemoryVendorStore};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    const REGISTRY_YAML: &str = r#"
sources:
  - name: fed-corporations
    display_name: Federal Corporations
    url: https://example.ca/corporations.csv
    source_type: file
    format: csv
  - name: on-registry
    display_name: Ontario Business Registry
    url: https://example.ca/api/businesses
    source_type: api
    enabled: false
"#;

    fn test_state() -> (AppState, Arc<MemoryVendorStore>) {
        let registry: SourceRegistry = serde_yaml::from_str(REGISTRY_YAML).expect("registry yaml");
        let store = Arc::new(MemoryVendorStore::new());
        let monitor = MonitoringService::new(MonitorConfig::default());
        let manager = Arc::new(
            SourceManager::new(RuntimeConfig::default(), store.clone(), monitor.clone())
                .expect("manager"),
        );
        let analytics = Arc::new(AnalyticsAggregator::new(monitor.clone(), &registry.sources));
        let claims = Arc::new(ClaimService::new(store.clone()));
        (
            AppState {
                registry,
                manager,
                monitor,
                analytics,
                store: store.clone(),
                claims,
            },
            store,
        )
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.expect("body").to_bytes();
        serde_json::from_slice(&bytes).expect("json body")
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).expect("request")
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    #[tokio::test]
    async fn sources_report_configuration_and_sync_state() {
        let (state, _store) = test_state();
        let app = app(state);
        let response = app.oneshot(get_request("/sources")).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        let sources = body["sources"].as_array().expect("sources array");
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0]["name"], "fed-corporations");
        assert_eq!(sources[1]["enabled"], false);
        assert!(sources[0]["last_sync"].is_null());
    }

    #[tokio::test]
    async fn health_returns_current_metrics() {
        let (state, _store) = test_state();
        let app = app(state);
        let response = app.oneshot(get_request("/health")).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["metrics"]["jobs_running"], 0);
        assert_eq!(body["metrics"]["data_quality_score"], 100.0);
    }

    #[tokio::test]
    async fn monitoring_and_analytics_endpoints_respond() {
        let (state, _store) = test_state();
        let app = app(state);
        for uri in [
            "/monitoring/dashboard",
            "/monitoring/alerts",
            "/monitoring/metrics",
            "/analytics/sources",
            "/analytics/errors",
            "/analytics/cost-routing",
            "/analytics/summary",
        ] {
            let response = app
                .clone()
                .oneshot(get_request(uri))
                .await
                .expect("response");
            assert_eq!(response.status(), StatusCode::OK, "uri: {uri}");
        }
    }

    #[tokio::test]
    async fn unknown_jobs_and_alerts_are_404() {
        let (state, _store) = test_state();
        let app = app(state);
        let id = Uuid::new_v4();

        let response = app
            .clone()
            .oneshot(get_request(&format!("/jobs/{id}")))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "unknown_job");

        let response = app
            .oneshot(post_json(
                &format!("/monitoring/alerts/{id}/resolve"),
                json!({}),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn ingest_of_unknown_source_is_404() {
        let (state, _store) = test_state();
        let app = app(state);
        let response = app
            .oneshot(post_json("/ingest/not-a-source", json!({})))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn claim_round_trip_via_the_api() {
        let (state, store) = test_state();
        let ImportOutcome::Created(profile) = store
            .import_vendor(
                BusinessRecord {
                    company_name: "Maple Widgets Inc".to_string(),
                    business_identifier: Some("123456789".to_string()),
                    address: Some("22 Bay St".to_string()),
                    ..Default::default()
                },
                "fed-corporations",
            )
            .await
            .expect("import")
        else {
            panic!("expected created outcome");
        };
        let app = app(state);

        let response = app
            .clone()
            .oneshot(post_json(
                &format!("/vendors/{}/claim", profile.id),
                json!({ "email": "owner@maplewidgets.ca" }),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let token = body["token"].as_str().expect("token").to_string();

        let user_id = Uuid::new_v4();
        let response = app
            .clone()
            .oneshot(post_json(
                "/claims/verify",
                json!({ "token": token, "user_id": user_id }),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["vendor"]["owner_user_id"], json!(user_id));

        let response = app
            .oneshot(post_json(
                "/claims/verify",
                json!({ "token": token, "user_id": Uuid::new_v4() }),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body = body_json(response).await;
        assert_eq!(body["error"], "token_already_used");
    }
}
