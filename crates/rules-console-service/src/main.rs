use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use rules_console_api::{
    MigrateResult, RulesConsoleApi, SaveRulesRequest, API_CONTRACT_VERSION,
    SERVICE_CONTRACT_VERSION,
};
use rules_console_core::Ruleset;
use rules_console_store_sqlite::{DocumentState, SchemaStatus};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Debug, Clone)]
struct ServiceState {
    api: RulesConsoleApi,
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
struct ServiceError {
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "rules-console-service")]
#[command(about = "Local HTTP service for the rules console")]
struct Args {
    #[arg(long, default_value = "./rules_console.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4010")]
    bind: SocketAddr,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = StatusCode::BAD_REQUEST;
        (status, Json(self)).into_response()
    }
}

impl ServiceState {
    fn error(err: &anyhow::Error) -> ServiceError {
        warn!(error = %format!("{err:#}"), "request failed");
        ServiceError { service_contract_version: SERVICE_CONTRACT_VERSION, error: format!("{err:#}") }
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
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/rules", get(rules_fetch).put(rules_save))
        .route("/v1/rules/state", get(rules_state))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let state = ServiceState { api: RulesConsoleApi::new(args.db.clone()) };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!(bind = %args.bind, db = %args.db.display(), "rules console service listening");
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
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    let status = state.api.schema_status().map_err(|err| ServiceState::error(&err))?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    let result = state.api.migrate(request.dry_run).map_err(|err| ServiceState::error(&err))?;
    Ok(Json(envelope(result)))
}

async fn rules_fetch(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<Vec<Ruleset>>>, ServiceError> {
    let rulesets = state.api.fetch_rulesets().map_err(|err| ServiceState::error(&err))?;
    Ok(Json(envelope(rulesets)))
}

async fn rules_save(
    State(state): State<ServiceState>,
    Json(request): Json<SaveRulesRequest>,
) -> Result<Json<ServiceEnvelope<Vec<Ruleset>>>, ServiceError> {
    let saved = state.api.save_rulesets(&request.data).map_err(|err| ServiceState::error(&err))?;
    info!(rulesets = saved.len(), "rules document replaced");
    Ok(Json(envelope(saved)))
}

async fn rules_state(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<DocumentState>>, ServiceError> {
    let document_state = state.api.document_state().map_err(|err| ServiceState::error(&err))?;
    Ok(Json(envelope(document_state)))
}
