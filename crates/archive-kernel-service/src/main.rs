use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use archive_kernel_api::{ArchiveKernelApi, AuditQuery, KernelConfig, API_CONTRACT_VERSION};
use archive_kernel_core::{
    Actor, ArchivalId, ArchiveError, ArchiveRequest, AuditOperation, RecordId, RequestOrigin,
    RestoreRequest,
};
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

const ADMIN_ID_HEADER: &str = "x-admin-id";
const ADMIN_ROLE_HEADER: &str = "x-admin-role";
const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

#[derive(Debug, Clone)]
struct ServiceState {
    api: ArchiveKernelApi,
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

/// Error body. Only the coarse public message leaves the process; full detail is in the
/// audit trail and the service log.
#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    code: &'static str,
    error: String,
    retryable: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ArchiveBody {
    reason: Option<String>,
    notes: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct RestoreBody {
    reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ArchivesQuery {
    original_id: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct AuditListQuery {
    archival_id: Option<i64>,
    original_id: Option<i64>,
    limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "archive-kernel-service")]
#[command(about = "Local HTTP service for the archive/restore kernel")]
struct Args {
    #[arg(long, default_value = "./archive_kernel.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4010")]
    bind: SocketAddr,
    /// YAML file with layout, defaults policy and timeouts.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    busy_timeout_ms: Option<u64>,
    #[arg(long)]
    operation_timeout_ms: Option<u64>,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl ServiceError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            code: "invalid_request",
            error: message.into(),
            retryable: false,
        }
    }

    /// Map a facade error onto an HTTP status. `operation` picks the wording for coarse
    /// failures of mutating calls; reads pass `None`.
    fn from_api(err: &anyhow::Error, operation: Option<AuditOperation>) -> Self {
        let Some(archive_error) = err.downcast_ref::<ArchiveError>() else {
            tracing::error!(error = %format!("{err:#}"), "request failed outside the kernel taxonomy");
            return Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                service_contract_version: SERVICE_CONTRACT_VERSION,
                code: "internal",
                error: "request failed; contact an administrator".to_string(),
                retryable: false,
            };
        };

        let status = match archive_error {
            ArchiveError::NotFound(_) => StatusCode::NOT_FOUND,
            ArchiveError::SelfOperationDenied { .. } => StatusCode::FORBIDDEN,
            ArchiveError::AlreadyArchived(_) | ArchiveError::SchemaConstraintViolation(_) => {
                StatusCode::CONFLICT
            }
            ArchiveError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ArchiveError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ArchiveError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let error = archive_error.request_message(operation);
        if status.is_server_error() {
            tracing::warn!(code = archive_error.code(), detail = %archive_error.detail(), "request failed");
        }

        Self {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            code: archive_error.code(),
            error,
            retryable: archive_error.is_retryable(),
        }
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

fn header_text(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}

/// The session layer in front of this service vouches for the acting administrator.
fn actor_from_headers(headers: &HeaderMap) -> Result<Actor, ServiceError> {
    let raw_id = header_text(headers, ADMIN_ID_HEADER)
        .ok_or_else(|| ServiceError::bad_request(format!("missing {ADMIN_ID_HEADER} header")))?;
    let admin_id = raw_id.parse::<i64>().map_err(|_| {
        ServiceError::bad_request(format!("{ADMIN_ID_HEADER} must be an integer identifier"))
    })?;
    Ok(Actor {
        admin_id: RecordId(admin_id),
        role: header_text(headers, ADMIN_ROLE_HEADER).unwrap_or_default(),
    })
}

fn origin_from_headers(headers: &HeaderMap) -> RequestOrigin {
    RequestOrigin {
        ip: header_text(headers, FORWARDED_FOR_HEADER)
            .and_then(|value| value.split(',').next().map(|first| first.trim().to_string())),
        user_agent: header_text(headers, http::header::USER_AGENT.as_str()),
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", get(db_schema_version))
        .route("/v1/schema/:entity", get(schema_describe))
        .route("/v1/records/:original_id/archive", post(archive_record))
        .route("/v1/archives", get(archives_list))
        .route("/v1/archives/:archival_id", get(archive_show))
        .route(
            "/v1/archives/:archival_id/restore",
            get(restore_archive_from_query).post(restore_archive_from_body),
        )
        .route("/v1/audit", get(audit_list))
        .with_state(state)
}

fn load_config(args: &Args) -> Result<KernelConfig> {
    let mut config = match &args.config {
        Some(path) => KernelConfig::load(path)?,
        None => KernelConfig::default(),
    };
    if let Some(ms) = args.busy_timeout_ms {
        config.timeouts.busy_timeout_ms = ms;
    }
    if let Some(ms) = args.operation_timeout_ms {
        config.timeouts.operation_timeout_ms = ms;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("archive_kernel=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let config = load_config(&args)?;
    let state = ServiceState { api: ArchiveKernelApi::with_config(args.db.clone(), config) };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, db = %args.db.display(), "archive kernel service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<archive_kernel_store_sqlite::SchemaStatus>>, ServiceError> {
    let status = state.api.schema_status().map_err(|err| ServiceError::from_api(&err, None))?;
    Ok(Json(envelope(status)))
}

async fn schema_describe(
    State(state): State<ServiceState>,
    Path(entity): Path<String>,
) -> Result<Json<ServiceEnvelope<archive_kernel_core::SchemaDescriptor>>, ServiceError> {
    let descriptor =
        state.api.describe(&entity).map_err(|err| ServiceError::from_api(&err, None))?;
    Ok(Json(envelope(descriptor)))
}

async fn archive_record(
    State(state): State<ServiceState>,
    Path(original_id): Path<i64>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ServiceEnvelope<archive_kernel_core::ArchiveOutcome>>, ServiceError> {
    let body: ArchiveBody = optional_json(&body)?;
    let request = ArchiveRequest {
        original_id: RecordId(original_id),
        actor: actor_from_headers(&headers)?,
        reason: body.reason,
        notes: body.notes,
        origin: origin_from_headers(&headers),
    };
    let outcome = state
        .api
        .archive(&request)
        .map_err(|err| ServiceError::from_api(&err, Some(AuditOperation::Archive)))?;
    Ok(Json(envelope(outcome)))
}

/// Reason and notes are optional, so an absent or blank body is the same as `{}`.
fn optional_json<T>(body: &Bytes) -> Result<T, ServiceError>
where
    T: DeserializeOwned + Default,
{
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|err| ServiceError::bad_request(format!("invalid request body: {err}")))
}

fn restore_archive(
    state: &ServiceState,
    archival_id: i64,
    headers: &HeaderMap,
    reason: Option<String>,
) -> Result<Json<ServiceEnvelope<archive_kernel_core::RestoreOutcome>>, ServiceError> {
    let request = RestoreRequest {
        archival_id: ArchivalId(archival_id),
        actor: actor_from_headers(headers)?,
        reason,
        origin: origin_from_headers(headers),
    };
    let outcome = state
        .api
        .restore(&request)
        .map_err(|err| ServiceError::from_api(&err, Some(AuditOperation::Restore)))?;
    Ok(Json(envelope(outcome)))
}

async fn restore_archive_from_query(
    State(state): State<ServiceState>,
    Path(archival_id): Path<i64>,
    headers: HeaderMap,
    Query(body): Query<RestoreBody>,
) -> Result<Json<ServiceEnvelope<archive_kernel_core::RestoreOutcome>>, ServiceError> {
    restore_archive(&state, archival_id, &headers, body.reason)
}

async fn restore_archive_from_body(
    State(state): State<ServiceState>,
    Path(archival_id): Path<i64>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ServiceEnvelope<archive_kernel_core::RestoreOutcome>>, ServiceError> {
    let body: RestoreBody = optional_json(&body)?;
    restore_archive(&state, archival_id, &headers, body.reason)
}

async fn archives_list(
    State(state): State<ServiceState>,
    Query(query): Query<ArchivesQuery>,
) -> Result<Json<ServiceEnvelope<Vec<archive_kernel_core::ArchivedRecord>>>, ServiceError> {
    let records = state
        .api
        .list_archives(query.original_id.map(RecordId))
        .map_err(|err| ServiceError::from_api(&err, None))?;
    Ok(Json(envelope(records)))
}

async fn archive_show(
    State(state): State<ServiceState>,
    Path(archival_id): Path<i64>,
) -> Result<Json<ServiceEnvelope<archive_kernel_core::ArchivedRecord>>, ServiceError> {
    let record = state
        .api
        .get_archive(ArchivalId(archival_id))
        .map_err(|err| ServiceError::from_api(&err, None))?;
    Ok(Json(envelope(record)))
}

async fn audit_list(
    State(state): State<ServiceState>,
    Query(query): Query<AuditListQuery>,
) -> Result<Json<ServiceEnvelope<Vec<archive_kernel_core::StoredAuditEntry>>>, ServiceError> {
    let entries = state
        .api
        .list_audit(&AuditQuery {
            archival_id: query.archival_id.map(ArchivalId),
            original_id: query.original_id.map(RecordId),
            limit: query.limit,
        })
        .map_err(|err| ServiceError::from_api(&err, None))?;
    Ok(Json(envelope(entries)))
}
