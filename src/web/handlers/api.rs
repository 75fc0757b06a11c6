use axum::{
    extract::{Multipart, Path, Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::db::keys::KeyError;
use crate::db::schema::{SchemaSnapshot, TableInfo};
use crate::engine::{AnswerEnvelope, Outcome, TablePage};
use crate::error::PipelineError;
use crate::ingest::{IngestError, IngestMode, IngestedTable};
use crate::web::state::AppState;

pub const DEFAULT_PAGE_LIMIT: usize = 1000;
const MAX_PAGE_LIMIT: usize = 10_000;

// Request and response types

#[derive(Debug, Deserialize, Clone)]
pub struct AskRequest {
    pub question: String,
}

#[derive(Debug, Serialize)]
pub struct AskResponse<'a> {
    #[serde(flatten)]
    pub envelope: &'a AnswerEnvelope,
    pub outcome: &'a Outcome,
    pub recommended_next_questions: &'a [String],
}

#[derive(Debug, Deserialize)]
pub struct TableQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    #[serde(default)]
    pub replace: bool,
}

#[derive(Debug, Deserialize)]
pub struct PrimaryKeyRequest {
    pub column: String,
}

#[derive(Debug, Deserialize)]
pub struct ForeignKeyRequest {
    pub column: String,
    pub referenced_table: String,
    pub referenced_column: String,
}

#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub version: String,
    pub uptime_seconds: i64,
    pub table_count: usize,
    pub schema_cache_age_seconds: Option<i64>,
}

fn pipeline_error_status(err: &PipelineError) -> StatusCode {
    match err {
        PipelineError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        PipelineError::TranslationUnavailable(_) | PipelineError::MalformedTranslation { .. } => {
            StatusCode::BAD_GATEWAY
        }
    }
}

fn ingest_error_status(err: &IngestError) -> StatusCode {
    match err {
        IngestError::UnsupportedFileType(_)
        | IngestError::InvalidName(_)
        | IngestError::NoColumns(_)
        | IngestError::Csv(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn key_error_status(err: &KeyError) -> StatusCode {
    match err {
        KeyError::TableNotFound(_) | KeyError::ColumnNotFound { .. } => StatusCode::NOT_FOUND,
        KeyError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        // Includes rows that violate the new constraint
        _ => StatusCode::CONFLICT,
    }
}

// API Implementations

pub async fn ask(
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<AskRequest>,
) -> Result<Response, (StatusCode, String)> {
    let question = payload.question.trim();
    if question.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Question must not be empty".to_string()));
    }

    let envelope = app_state.pipeline.ask(question).await.map_err(|e| {
        error!("Question failed: {}", e);
        (pipeline_error_status(&e), e.user_message())
    })?;

    let mut headers = HeaderMap::new();
    headers.insert(
        HeaderName::from_static("x-pipeline-outcome"),
        HeaderValue::from_static(envelope.outcome.kind()),
    );

    let body = AskResponse {
        envelope: &envelope,
        outcome: &envelope.outcome,
        recommended_next_questions: &envelope.translation.recommended_next_questions,
    };

    Ok((StatusCode::OK, headers, Json(body)).into_response())
}

pub async fn get_schema(
    State(app_state): State<Arc<AppState>>,
) -> Result<Json<SchemaSnapshot>, (StatusCode, String)> {
    let schema = app_state.pipeline.schema().await.map_err(|e| {
        error!("Failed to load schema: {}", e);
        (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
    })?;

    Ok(Json(schema.as_ref().clone()))
}

pub async fn refresh_schema(
    State(app_state): State<Arc<AppState>>,
) -> Result<Json<SchemaSnapshot>, (StatusCode, String)> {
    app_state.pipeline.invalidate_schema().await;
    let schema = app_state.pipeline.refresh_schema().await.map_err(|e| {
        error!("Failed to refresh schema: {}", e);
        (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
    })?;

    info!("Schema refreshed on request: {} tables", schema.tables.len());
    Ok(Json(schema.as_ref().clone()))
}

pub async fn get_table(
    State(app_state): State<Arc<AppState>>,
    Path(table): Path<String>,
    Query(query): Query<TableQuery>,
) -> Result<Json<TablePage>, (StatusCode, String)> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_LIMIT).min(MAX_PAGE_LIMIT);
    debug!("Fetching up to {} rows of {}", limit, table);

    match app_state.pipeline.table_page(&table, limit).await {
        Ok(Some(page)) => Ok(Json(page)),
        Ok(None) => Err((StatusCode::NOT_FOUND, format!("Table '{}' not found", table))),
        Err(e) => {
            error!("Failed to fetch table page: {}", e);
            Err((StatusCode::SERVICE_UNAVAILABLE, e.to_string()))
        }
    }
}

pub async fn upload_file(
    State(app_state): State<Arc<AppState>>,
    Query(query): Query<UploadQuery>,
    mut multipart: Multipart,
) -> Result<Json<Vec<IngestedTable>>, (StatusCode, String)> {
    let uploads_dir = app_state.uploads_dir();
    tokio::fs::create_dir_all(&uploads_dir).await.map_err(|e| {
        error!("Failed to create upload directory: {}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, "Failed to store upload".to_string())
    })?;

    let mode = if query.replace {
        IngestMode::Replace
    } else {
        IngestMode::Skip
    };

    let mut loaded = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?
    {
        // Only the final path component of the client's file name is used
        let Some(file_name) = field
            .file_name()
            .and_then(|name| std::path::Path::new(name).file_name())
            .map(|name| name.to_os_string())
        else {
            warn!("Skipping multipart field without a file name");
            continue;
        };

        let data = field
            .bytes()
            .await
            .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

        let path = uploads_dir.join(&file_name);
        tokio::fs::write(&path, &data).await.map_err(|e| {
            error!("Failed to write {}: {}", path.display(), e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to store upload".to_string())
        })?;
        info!("Stored upload {} ({} bytes)", path.display(), data.len());

        let tables = app_state.ingest.ingest_path(&path, mode).await.map_err(|e| {
            error!("Failed to ingest {}: {}", path.display(), e);
            (ingest_error_status(&e), e.to_string())
        })?;
        loaded.extend(tables);
    }

    if loaded.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "No files in upload".to_string()));
    }

    Ok(Json(loaded))
}

// Key management

/// The table's structure after a key change.
async fn rekeyed_table(
    app_state: &AppState,
    table: &str,
    result: Result<(), KeyError>,
) -> Result<Json<TableInfo>, (StatusCode, String)> {
    result.map_err(|e| {
        warn!("Key change on '{}' failed: {}", table, e);
        (key_error_status(&e), e.to_string())
    })?;

    let schema = app_state.pipeline.schema().await.map_err(|e| {
        error!("Failed to load schema: {}", e);
        (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
    })?;

    schema
        .table(table)
        .cloned()
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Table '{}' not found", table)))
}

pub async fn set_primary_key(
    State(app_state): State<Arc<AppState>>,
    Path(table): Path<String>,
    Json(payload): Json<PrimaryKeyRequest>,
) -> Result<Json<TableInfo>, (StatusCode, String)> {
    let result = app_state.keys.set_primary_key(&table, &payload.column).await;
    rekeyed_table(&app_state, &table, result).await
}

pub async fn remove_primary_key(
    State(app_state): State<Arc<AppState>>,
    Path(table): Path<String>,
) -> Result<Json<TableInfo>, (StatusCode, String)> {
    let result = app_state.keys.remove_primary_key(&table).await;
    rekeyed_table(&app_state, &table, result).await
}

pub async fn add_foreign_key(
    State(app_state): State<Arc<AppState>>,
    Path(table): Path<String>,
    Json(payload): Json<ForeignKeyRequest>,
) -> Result<Json<TableInfo>, (StatusCode, String)> {
    let result = app_state
        .keys
        .add_foreign_key(
            &table,
            &payload.column,
            &payload.referenced_table,
            &payload.referenced_column,
        )
        .await;
    rekeyed_table(&app_state, &table, result).await
}

pub async fn remove_foreign_key(
    State(app_state): State<Arc<AppState>>,
    Path((table, column)): Path<(String, String)>,
) -> Result<Json<TableInfo>, (StatusCode, String)> {
    let result = app_state.keys.remove_foreign_key(&table, &column).await;
    rekeyed_table(&app_state, &table, result).await
}

// System status
pub async fn system_status(
    State(app_state): State<Arc<AppState>>,
) -> Result<Json<SystemStatus>, (StatusCode, String)> {
    let now = chrono::Utc::now();
    let uptime = now.signed_duration_since(app_state.startup_time).num_seconds();

    let schema = app_state.pipeline.schema().await.map_err(|e| {
        error!("Failed to load schema: {}", e);
        (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
    })?;

    let cache_age = app_state
        .cache
        .last_refresh()
        .await
        .map(|at| now.signed_duration_since(at).num_seconds());

    Ok(Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime,
        table_count: schema.tables.len(),
        schema_cache_age_seconds: cache_age,
    }))
}
