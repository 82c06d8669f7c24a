mod adapters;
mod codec;
mod config;
mod controller;
mod http;
mod llm;
mod metrics;
mod models;
mod reaper;
mod session;
mod store;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use codec::CodecError;
use config::ServiceConfig;
use controller::{PipelineController, PipelineError, PipelineErrorKind, PipelinePolicy};
use eyre::WrapErr;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{
    ApiError, DeleteResponse, EnhancementView, HealthResponse, ProcessResponse, SelectRequest,
    SelectResponse, SessionSummary, UploadResponse,
};
use session::{DescribedView, EnhancementOutcome, ProcessedView, SessionId};
use std::{net::SocketAddr, sync::Arc};
use store::SessionStore;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "studio.api", "server crashed: {err:#}");
    }
}

async fn run() -> eyre::Result<()> {
    init_tracing();

    let config = ServiceConfig::from_env();
    let store = SessionStore::new(config.session_idle_ttl);
    let controller = PipelineController::new(
        store.clone(),
        adapters::Adapters::from_config(&config),
        PipelinePolicy::from_config(&config),
    );
    let _reaper = reaper::spawn(store, config.reap_interval);

    let openapi: serde_json::Value = serde_yaml::from_str(include_str!("../docs/openapi.yaml"))
        .unwrap_or(serde_json::json!({"openapi":"3.0.3"}));
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .wrap_err("installing prometheus recorder")?;

    let state = AppState {
        controller,
        openapi: Arc::new(openapi),
        prometheus_handle,
    };
    let app = app(state, config.body_limit);

    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    info!(target = "studio.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("binding {addr}"))?;
    axum::serve(listener, app.into_make_service())
        .await
        .wrap_err("serving http")?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    controller: PipelineController,
    openapi: Arc<serde_json::Value>,
    prometheus_handle: PrometheusHandle,
}

fn app(state: AppState, body_limit: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui))
        .route("/upload", post(upload))
        .nest(
            "/sessions",
            Router::new()
                .route("/{id}", get(session_summary).delete(cleanup))
                .route("/{id}/process", post(process))
                .route("/{id}/select", post(select)),
        )
        .route("/cleanup/{id}", delete(cleanup).post(cleanup))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(body_limit))
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
///
/// Returns `status` and the number of sessions currently held in memory.
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "studio-api-rs",
        active_session_count: state.controller.active_sessions().await,
    })
}

async fn openapi_json(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    if let Ok(key) = std::env::var("OPENAPI_KEY")
        && header_value(&headers, "X-Docs-Key") != key
    {
        return Err(AppError::Unauthorized("docs"));
    }
    Ok(Json((*state.openapi).clone()))
}

async fn swagger_ui() -> impl IntoResponse {
    let html = r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>Studio API Docs</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: '/openapi.json', dom_id: '#swagger-ui' });
    };
  </script>
</body>
</html>"#;
    (
        [(axum::http::header::CONTENT_TYPE, "text/html; charset=utf-8")],
        html,
    )
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Ok(secret) = std::env::var("METRICS_KEY")
        && header_value(&headers, "X-Metrics-Key") != secret
    {
        return AppError::Unauthorized("metrics").into_response();
    }
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

/// Start a session from raw image bytes.
///
/// - Method: `POST`
/// - Path: `/upload`
/// - Body: the image file itself (JPEG, PNG, BMP or WebP)
/// - Response: `UploadResponse`; 400 when the bytes do not decode
async fn upload(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<UploadResponse>, AppError> {
    crate::metrics::inc_requests("/upload");
    let (id, (width, height)) = state.controller.upload(body.to_vec()).await?;
    Ok(Json(UploadResponse {
        session_id: id.to_string(),
        width,
        height,
    }))
}

/// Detect, cut out and enhance the uploaded subject.
///
/// - Method: `POST`
/// - Path: `/sessions/{id}/process`
/// - Response: `ProcessResponse` with three renditions, each carrying its
///   status; a repeat call returns the stored result with `cached: true`
/// - Errors: 404 unknown session, 409 once a rendition has been chosen,
///   422 when background removal fails
async fn process(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ProcessResponse>, AppError> {
    crate::metrics::inc_requests("/sessions/process");
    let id = parse_session_id(&id, "process")?;
    let view = state.controller.process(id).await?;
    let response = encode_off_thread("process", move || process_response(&view)).await?;
    Ok(Json(response))
}

/// Pick a rendition and generate its listing copy.
///
/// - Method: `POST`
/// - Path: `/sessions/{id}/select`
/// - Body: `SelectRequest` (`optionNumber` 1..=3, optional `tone`, `lang`)
/// - Response: `SelectResponse`
/// - Errors: 400 out-of-range option, 404 unknown session, 409 before
///   `/process` or when a different option was already chosen
async fn select(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<SelectRequest>, JsonRejection>,
) -> Result<Json<SelectResponse>, AppError> {
    crate::metrics::inc_requests("/sessions/select");
    let id = parse_session_id(&id, "select")?;
    let Json(payload) = payload.map_err(|rejection| {
        AppError::Pipeline(PipelineError::invalid_selection(rejection.body_text()))
    })?;
    let view = state
        .controller
        .select(id, payload.option_number, payload.tone, payload.lang)
        .await?;
    let response = encode_off_thread("select", move || select_response(&view)).await?;
    Ok(Json(response))
}

async fn session_summary(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionSummary>, AppError> {
    let id = parse_session_id(&id, "session")?;
    Ok(Json(state.controller.summary(id).await?))
}

/// Drop a session and everything it holds. Also mounted as `/cleanup/{id}`.
async fn cleanup(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeleteResponse>, AppError> {
    crate::metrics::inc_requests("/sessions/delete");
    let id = parse_session_id(&id, "cleanup")?;
    state.controller.cleanup(id).await?;
    Ok(Json(DeleteResponse {
        message: format!("session {id} cleaned up"),
    }))
}

// A malformed id can never name a live session.
fn parse_session_id(raw: &str, stage: &'static str) -> Result<SessionId, AppError> {
    SessionId::parse_str(raw).map_err(|_| {
        AppError::Pipeline(PipelineError::not_found(
            stage,
            format!("session {raw} not found"),
        ))
    })
}

async fn encode_off_thread<T, F>(stage: &'static str, encode: F) -> Result<T, AppError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, CodecError> + Send + 'static,
{
    tokio::task::spawn_blocking(encode)
        .await
        .map_err(|err| PipelineError::internal(stage, err.to_string()))?
        .map_err(|err| PipelineError::internal(stage, format!("encoding images: {err}")).into())
}

fn enhancement_view(slot: &EnhancementOutcome) -> Result<EnhancementView, CodecError> {
    Ok(EnhancementView {
        strategy: slot.strategy.clone(),
        image: codec::to_data_url(&slot.image)?,
        status: slot.status.clone(),
    })
}

fn process_response(view: &ProcessedView) -> Result<ProcessResponse, CodecError> {
    let [first, second, third] = &view.enhancements;
    Ok(ProcessResponse {
        session_id: view.session_id.to_string(),
        enhancement_1: enhancement_view(first)?,
        enhancement_2: enhancement_view(second)?,
        enhancement_3: enhancement_view(third)?,
        no_background_image: codec::to_data_url(&view.no_background)?,
        original_image: codec::to_data_url(&view.original)?,
        detection: view.detection.clone(),
        used_full_frame: view.used_full_frame,
        cached: view.cached,
        stages: view.stages.clone(),
    })
}

fn select_response(view: &DescribedView) -> Result<SelectResponse, CodecError> {
    Ok(SelectResponse {
        chosen_image: codec::to_data_url(&view.chosen.image)?,
        chosen_status: view.chosen.status.clone(),
        option_number: view.option_number,
        description: view.description.listing.clone(),
        description_status: view.description.status.clone(),
        cached: view.cached,
    })
}

#[derive(Debug)]
enum AppError {
    Pipeline(PipelineError),
    Unauthorized(&'static str),
}

impl From<PipelineError> for AppError {
    fn from(value: PipelineError) -> Self {
        Self::Pipeline(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Pipeline(err) => {
                let status = match err.kind() {
                    PipelineErrorKind::Decode | PipelineErrorKind::InvalidSelection => {
                        StatusCode::BAD_REQUEST
                    }
                    PipelineErrorKind::SessionNotFound => StatusCode::NOT_FOUND,
                    PipelineErrorKind::IllegalStageTransition => StatusCode::CONFLICT,
                    PipelineErrorKind::Segmentation => StatusCode::UNPROCESSABLE_ENTITY,
                    PipelineErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                };
                if status.is_server_error() {
                    error!(target = "studio.api", stage = err.stage(), error = %err, "request_failed");
                } else {
                    warn!(target = "studio.api", stage = err.stage(), kind = err.kind().as_str(), "request_rejected");
                }
                let payload = ApiError {
                    error: err.stage().to_string(),
                    kind: err.kind().as_str().to_string(),
                    detail: Some(err.detail().to_string()),
                };
                (status, Json(payload)).into_response()
            }
            AppError::Unauthorized(area) => {
                let payload = ApiError {
                    error: area.to_string(),
                    kind: "unauthorized".into(),
                    detail: None,
                };
                (StatusCode::UNAUTHORIZED, Json(payload)).into_response()
            }
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
