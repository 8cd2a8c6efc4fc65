//! Axum JSON API over the catalog: sync triggers, job polling, and catalog reads.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use simcat_core::PackageFilter;
use simcat_sync::{
    normalize_country_code, CatalogService, JobCommand, JobRunner, SyncError, SyncIntent,
};
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "simcat-web";

#[derive(Clone)]
pub struct AppState {
    pub service: CatalogService,
    pub jobs: JobRunner,
}

impl AppState {
    pub fn new(service: CatalogService, jobs: JobRunner) -> Self {
        Self { service, jobs }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/sync", post(sync_action_handler))
        .route("/api/sync/all", post(sync_all_handler))
        .route("/api/sync/country", post(sync_country_handler))
        .route("/api/update/country", post(update_country_handler))
        .route("/api/sync/batch", post(batch_sync_handler))
        .route("/api/update/batch", post(batch_update_handler))
        .route("/api/sync/provider/{slug}", post(sync_provider_handler))
        .route("/api/update/provider/{slug}", post(update_provider_handler))
        .route("/api/cleanup", delete(cleanup_handler))
        .route("/api/validate", post(validate_handler))
        .route("/api/jobs/{id}", get(job_status_handler))
        .route("/api/stats", get(stats_handler))
        .route("/api/countries", get(countries_handler))
        .route("/api/countries/supported", get(supported_countries_handler))
        .route("/api/search", get(search_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "catalog api listening");
    axum::serve(listener, app(state)).await.context("serving catalog api")?;
    Ok(())
}

/// Error body shared by every endpoint: `{"status": "error", "message": ..}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        let status = match &err {
            SyncError::UnknownProvider(_) => StatusCode::NOT_FOUND,
            SyncError::InvalidCountryCode(_) => StatusCode::BAD_REQUEST,
            _ => {
                error!(error = %err, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({"status": "error", "message": self.message})),
        )
            .into_response()
    }
}

type ApiResult = Result<Response, ApiError>;

#[derive(Debug, Serialize)]
struct Accepted {
    status: &'static str,
    message: String,
    task_id: Uuid,
}

async fn enqueue(state: &AppState, command: JobCommand, message: String) -> ApiResult {
    let handle = state.jobs.enqueue(command).await;
    info!(job_id = %handle.id, %message, "job accepted");
    Ok((
        StatusCode::ACCEPTED,
        Json(Accepted {
            status: "success",
            message,
            task_id: handle.id,
        }),
    )
        .into_response())
}

fn success<T: Serialize>(data: T) -> ApiResult {
    Ok(Json(json!({"status": "success", "data": data})).into_response())
}

#[derive(Debug, Deserialize)]
struct CountryRequest {
    country_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BatchRequest {
    #[serde(default)]
    country_codes: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SyncActionRequest {
    action: String,
    country_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CleanupQuery {
    days: Option<i64>,
    #[serde(default)]
    dry_run: bool,
}

#[derive(Debug, Deserialize)]
struct CountriesQuery {
    provider: Option<String>,
}

fn required_country(code: Option<String>) -> Result<String, ApiError> {
    let code = code
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("country_code is required"))?;
    Ok(normalize_country_code(&code)?)
}

fn required_countries(codes: Vec<String>) -> Result<Vec<String>, ApiError> {
    if codes.is_empty() {
        return Err(ApiError::bad_request("country_codes must be a non-empty list"));
    }
    codes
        .iter()
        .map(|code| normalize_country_code(code).map_err(ApiError::from))
        .collect()
}

fn known_provider(state: &AppState, slug: &str) -> Result<(), ApiError> {
    match state.service.orchestrator().registry().get(slug) {
        Some(_) => Ok(()),
        None => Err(SyncError::UnknownProvider(slug.to_string()).into()),
    }
}

async fn sync_all_handler(State(state): State<Arc<AppState>>) -> ApiResult {
    let message = "full catalog sync started".to_string();
    enqueue(&state, JobCommand::Sync(SyncIntent::SyncAll), message).await
}

async fn sync_country_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CountryRequest>,
) -> ApiResult {
    let country = required_country(body.country_code)?;
    let message = format!("{country} sync started");
    enqueue(&state, JobCommand::Sync(SyncIntent::SyncCountry { country }), message).await
}

async fn update_country_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CountryRequest>,
) -> ApiResult {
    let country = required_country(body.country_code)?;
    let message = format!("{country} update started");
    enqueue(&state, JobCommand::Sync(SyncIntent::UpdateCountry { country }), message).await
}

async fn batch_sync_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<BatchRequest>,
) -> ApiResult {
    let countries = required_countries(body.country_codes)?;
    let message = format!("batch sync started for {} countries", countries.len());
    enqueue(&state, JobCommand::Sync(SyncIntent::BatchSync { countries }), message).await
}

async fn batch_update_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<BatchRequest>,
) -> ApiResult {
    let countries = required_countries(body.country_codes)?;
    let message = format!("batch update started for {} countries", countries.len());
    enqueue(&state, JobCommand::Sync(SyncIntent::BatchUpdate { countries }), message).await
}

async fn sync_provider_handler(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
) -> ApiResult {
    known_provider(&state, &slug)?;
    let message = format!("{slug} sync started");
    enqueue(&state, JobCommand::Sync(SyncIntent::SyncProvider { provider: slug }), message).await
}

async fn update_provider_handler(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
) -> ApiResult {
    known_provider(&state, &slug)?;
    let message = format!("{slug} update started");
    let intent = SyncIntent::UpdateProvider { provider: slug };
    enqueue(&state, JobCommand::Sync(intent), message).await
}

/// Single endpoint taking `{"action": "sync_all" | "sync_country" | "update_country"}`.
async fn sync_action_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SyncActionRequest>,
) -> ApiResult {
    match body.action.as_str() {
        "sync_all" => sync_all_handler(State(state)).await,
        "sync_country" => {
            let request = CountryRequest {
                country_code: body.country_code,
            };
            sync_country_handler(State(state), Json(request)).await
        }
        "update_country" => {
            let request = CountryRequest {
                country_code: body.country_code,
            };
            update_country_handler(State(state), Json(request)).await
        }
        other => Err(ApiError::bad_request(format!("unknown action `{other}`"))),
    }
}

async fn cleanup_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CleanupQuery>,
) -> ApiResult {
    let days = query.days.unwrap_or(30);
    let days = u32::try_from(days)
        .ok()
        .filter(|d| *d >= 1)
        .ok_or_else(|| ApiError::bad_request("days must be a positive number"))?;
    let message = format!("cleaning up packages untouched for {days} days");
    enqueue(
        &state,
        JobCommand::Cleanup {
            days,
            dry_run: query.dry_run,
        },
        message,
    )
    .await
}

async fn validate_handler(State(state): State<Arc<AppState>>) -> ApiResult {
    enqueue(&state, JobCommand::Validate, "package validation started".into()).await
}

async fn job_status_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    let id = Uuid::parse_str(&id)
        .map_err(|_| ApiError::bad_request(format!("invalid job id `{id}`")))?;
    match state.jobs.status(id).await {
        Some(record) => success(record),
        None => Err(ApiError::not_found(format!("job {id} not found"))),
    }
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> ApiResult {
    success(state.service.stats().await?)
}

async fn countries_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CountriesQuery>,
) -> ApiResult {
    let provider = query.provider.filter(|p| p != "all");
    if let Some(slug) = provider.as_deref() {
        known_provider(&state, slug)?;
    }
    let countries = state.service.countries(provider.as_deref()).await?;
    Ok(Json(json!({
        "status": "success",
        "provider": provider.as_deref().unwrap_or("all"),
        "count": countries.len(),
        "countries": countries,
    }))
    .into_response())
}

async fn supported_countries_handler(State(state): State<Arc<AppState>>) -> ApiResult {
    success(state.service.supported_countries().await?)
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<PackageFilter>,
) -> ApiResult {
    let page = state.service.search(&filter).await?;
    success(json!({
        "packages": page.packages,
        "pagination": page.pagination,
        "filters_applied": filter,
    }))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use rust_decimal_macros::dec;
    use serde_json::Value as JsonValue;
    use simcat_adapters::ProviderRegistry;
    use simcat_core::{CountryRef, DataAllowance, NormalizedPackage, ProviderSeed};
    use simcat_storage::{HttpClientConfig, HttpFetcher, MemoryCatalogStore};
    use simcat_sync::{JobState, Orchestrator, RetryPolicy};
    use tower::ServiceExt;

    async fn state() -> AppState {
        let store = Arc::new(MemoryCatalogStore::new());
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        let orchestrator = Orchestrator::new(ProviderRegistry::new(), store, http);

        let reconciler = orchestrator.reconciler();
        let provider = reconciler
            .resolve_provider(&ProviderSeed {
                slug: "esimgo".into(),
                name: "eSIM Go".into(),
                credential: String::new(),
            })
            .await
            .unwrap();
        let packages = [
            ("Turkey 1GB", dec!(3.50), &["TR"][..]),
            ("Europe 5GB", dec!(12.00), &["DE", "TR"][..]),
        ]
        .into_iter()
        .map(|(name, price, codes)| NormalizedPackage {
            external_id: Some(name.to_lowercase()),
            name: name.to_string(),
            price,
            validity_days: 7,
            data: DataAllowance::Megabytes(1024),
            countries: codes.iter().map(|c| CountryRef::code(*c)).collect(),
            detail: JsonValue::Null,
        })
        .collect::<Vec<_>>();
        reconciler.reconcile(&provider, &packages, None).await;

        let service = CatalogService::new(orchestrator);
        let jobs = JobRunner::new(
            Arc::new(service.clone()),
            RetryPolicy {
                max_attempts: 1,
                ..RetryPolicy::default()
            },
        );
        AppState::new(service, jobs)
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, JsonValue) {
        let resp = app.oneshot(request).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn post_json(uri: &str, body: JsonValue) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn trigger_returns_task_id_that_can_be_polled() {
        let state = state().await;
        let jobs = state.jobs.clone();
        let app = app(state);

        let request = post_json("/api/sync/country", json!({"country_code": "tr"}));
        let (status, body) = send(app.clone(), request).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["message"], "TR sync started");
        let id: Uuid = body["task_id"].as_str().unwrap().parse().unwrap();

        for _ in 0..100 {
            if jobs.status(id).await.is_some_and(|r| r.state.is_finished()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let (status, body) = send(app, get(&format!("/api/jobs/{id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["state"], serde_json::to_value(JobState::Failed).unwrap());
        assert_eq!(body["data"]["last_error"], "no providers are configured");
    }

    #[tokio::test]
    async fn bad_input_is_rejected_before_enqueueing() {
        let app = app(state().await);

        let (status, body) = send(app.clone(), post_json("/api/sync/country", json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "error");

        let request = post_json("/api/sync/batch", json!({"country_codes": []}));
        let (status, _) = send(app.clone(), request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let request = post_json("/api/sync", json!({"action": "explode"}));
        let (status, _) = send(app.clone(), request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(app.clone(), post_json("/api/sync/provider/nope", json!({}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let cleanup = Request::builder()
            .method("DELETE")
            .uri("/api/cleanup?days=0")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(app.clone(), cleanup).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(app, get(&format!("/api/jobs/{}", Uuid::new_v4()))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn search_filters_and_echoes_them() {
        let app = app(state().await);
        let request = get("/api/search?country=DE&max_price=20&page_size=5");
        let (status, body) = send(app, request).await;
        assert_eq!(status, StatusCode::OK);

        let data = &body["data"];
        assert_eq!(data["pagination"]["total_count"], 1);
        assert_eq!(data["packages"][0]["name"], "Europe 5GB");
        assert_eq!(data["filters_applied"]["country"], "DE");
        assert_eq!(data["pagination"]["page_size"], 5);
    }

    #[tokio::test]
    async fn stats_and_countries() {
        let app = app(state().await);
        let (status, body) = send(app.clone(), get("/api/stats")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["general"]["active_packages"], 2);
        assert_eq!(body["data"]["top_countries"][0]["code"], "TR");

        let (status, body) = send(app, get("/api/countries")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["provider"], "all");
        assert_eq!(body["count"], 2);
    }
}
