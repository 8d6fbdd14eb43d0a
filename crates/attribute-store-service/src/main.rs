use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use attribute_store_api::{load_config, AttributeStoreApi, API_CONTRACT_VERSION};
use attribute_store_core::{AttrError, EXPORT_PARAMS_REJECTED, NO_FILE_UPLOADED};
use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::rejection::QueryRejection;
use axum::extract::{DefaultBodyLimit, Multipart, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const IMPORT_FORM_HTML: &str = include_str!("../templates/import.html");
const UPLOAD_FIELD: &str = "file";

#[derive(Debug, Clone)]
struct ServiceState {
    api: AttributeStoreApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// JSON error body: a fixed `message` plus optional structured context.
#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ExportParams {
    #[serde(default)]
    user_ids: String,
    #[serde(default)]
    attributes: String,
}

#[derive(Debug, Parser)]
#[command(name = "attribute-store-service")]
#[command(about = "HTTP service for the user attribute store")]
struct Args {
    #[arg(long, default_value = "./attribute_store.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:5000")]
    bind: SocketAddr,
    /// YAML file with patterns, upload policy and export directory.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    export_dir: Option<PathBuf>,
    #[arg(long)]
    max_content_length: Option<usize>,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl From<AttrError> for ServiceError {
    fn from(err: AttrError) -> Self {
        Self {
            status: StatusCode::from_u16(err.status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            message: err.to_string(),
            payload: err.payload(),
        }
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(attr) = err.downcast_ref::<AttrError>() {
            return Self::from(attr.clone());
        }

        tracing::error!(error = %format!("{err:#}"), "request failed");
        Self { status: StatusCode::INTERNAL_SERVER_ERROR, message: err.to_string(), payload: None }
    }
}

/// Oversized bodies keep their 413; any other client-side multipart failure means
/// no usable file arrived.
impl From<MultipartError> for ServiceError {
    fn from(err: MultipartError) -> Self {
        let status = err.status();
        if status == StatusCode::PAYLOAD_TOO_LARGE || !status.is_client_error() {
            return Self { status, message: err.body_text(), payload: None };
        }

        tracing::debug!(error = %err.body_text(), "malformed multipart body");
        AttrError::UploadRejected(NO_FILE_UPLOADED.to_string()).into()
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    let body_limit = state.api.upload_policy().max_content_length;
    Router::new()
        .route("/v1/health", get(health))
        .route("/export/", get(export))
        .route("/import", get(import_form).post(import_upload))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(true).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    if let Some(export_dir) = args.export_dir {
        config.export_dir = export_dir;
    }
    if let Some(max_content_length) = args.max_content_length {
        config.upload.max_content_length = max_content_length;
    }

    let state = ServiceState { api: AttributeStoreApi::new(args.db, &config)? };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, export_dir = %config.export_dir.display(), "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn export(
    State(state): State<ServiceState>,
    query: Result<Query<ExportParams>, QueryRejection>,
) -> Result<Response, ServiceError> {
    let Ok(Query(params)) = query else {
        return Err(AttrError::InvalidRequest(EXPORT_PARAMS_REJECTED.to_string()).into());
    };
    let artifact = state.api.export_artifact(&params.user_ids, &params.attributes)?;
    let body = artifact.read_bytes()?;
    let disposition = format!("attachment; filename={}", artifact.filename());
    drop(artifact);

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/csv".to_string()), (header::CONTENT_DISPOSITION, disposition)],
        body,
    )
        .into_response())
}

async fn import_form() -> Html<&'static str> {
    Html(IMPORT_FORM_HTML)
}

async fn import_upload(
    State(state): State<ServiceState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<StatusCode, ServiceError> {
    let Ok(mut multipart) = multipart else {
        return Err(AttrError::UploadRejected(NO_FILE_UPLOADED.to_string()).into());
    };

    let mut filename = None;
    let mut body = Vec::new();
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        filename = field.file_name().map(ToString::to_string);
        body = field.bytes().await?.to_vec();
        break;
    }

    state.api.import_upload(filename.as_deref(), &body)?;
    Ok(StatusCode::OK)
}
