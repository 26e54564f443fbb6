use crate::dispatch::{CommandError, Dispatcher};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use portia_core::{validate_annotate_key, AnnotationFields, Entry, Msisdn, ResolutionResult};
use std::sync::Arc;
use tracing::warn;

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
}

impl From<CommandError> for ApiError {
    fn from(err: CommandError) -> Self {
        let status = if err.is_validation() {
            StatusCode::BAD_REQUEST
        } else if matches!(err, CommandError::Storage(_)) {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        if status != StatusCode::BAD_REQUEST {
            warn!(event = "http_request_failed", status = status.as_u16(), error = %err);
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.message)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/entry/:msisdn", get(get_annotations))
        .route("/entry/:msisdn/:key", get(read_annotation).put(annotate))
        .route("/resolve/:msisdn", get(resolve))
        .route("/health", get(|| async { "ok" }))
        .with_state(dispatcher)
}

fn parse_msisdn(raw: &str) -> Result<Msisdn, ApiError> {
    Msisdn::parse(raw).map_err(|err| ApiError::from(CommandError::from(err)))
}

fn check_key(key: &str) -> Result<(), ApiError> {
    validate_annotate_key(key)
        .map(|_| ())
        .map_err(|err| ApiError::bad_request(err.to_string()))
}

async fn get_annotations(
    State(dispatcher): State<Arc<Dispatcher>>,
    Path(msisdn): Path<String>,
) -> ApiResult<Entry> {
    let msisdn = parse_msisdn(&msisdn)?;
    let entry = dispatcher
        .store()
        .get_annotations(&msisdn)
        .await
        .map_err(CommandError::from)?;
    Ok(Json(entry))
}

async fn read_annotation(
    State(dispatcher): State<Arc<Dispatcher>>,
    Path((msisdn, key)): Path<(String, String)>,
) -> ApiResult<AnnotationFields> {
    check_key(&key)?;
    let msisdn = parse_msisdn(&msisdn)?;
    let fields = dispatcher
        .store()
        .read_annotation(&msisdn, &key)
        .await
        .map_err(CommandError::from)?;
    Ok(Json(fields))
}

/// The raw body is the value; the timestamp is the time of the request.
async fn annotate(
    State(dispatcher): State<Arc<Dispatcher>>,
    Path((msisdn, key)): Path<(String, String)>,
    body: String,
) -> ApiResult<String> {
    check_key(&key)?;
    let msisdn = parse_msisdn(&msisdn)?;
    dispatcher
        .store()
        .annotate(&msisdn, &key, &body, Utc::now())
        .await
        .map_err(CommandError::from)?;
    Ok(Json(body))
}

async fn resolve(
    State(dispatcher): State<Arc<Dispatcher>>,
    Path(msisdn): Path<String>,
) -> ApiResult<ResolutionResult> {
    let msisdn = parse_msisdn(&msisdn)?;
    let result = dispatcher
        .engine()
        .resolve(&msisdn)
        .await
        .map_err(CommandError::from)?;
    Ok(Json(result))
}
