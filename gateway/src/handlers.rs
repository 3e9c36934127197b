use crate::app::AppState;
use crate::batch;
use crate::context::RequestContext;
use crate::executor::StreamEvent;
use crate::files::UploadParams;
use crate::store::BatchRow;
use crate::wire::{
    BatchCounts, BatchObject, ChatRequest, CreateBatchRequest, DeletedObject, EmbeddingsRequest,
    FileObject, ImageRequest, ListEnvelope, ModelObject,
};
use axum::async_trait;
use axum::body::Body;
use axum::extract::{FromRequestParts, Multipart, Path, Query, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use common_api_errors::{ApiError, ApiResult};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use std::convert::Infallible;
use std::time::Duration;
use uuid::Uuid;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_endpoint))
        .route("/v1/models", get(list_models))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/images/generations", post(images_generations))
        .route("/v1/images/edits", post(images_edits))
        .route("/v1/images/variations", post(images_variations))
        .route("/v1/files", post(upload_file).get(list_files))
        .route("/v1/files/:id", get(get_file).delete(delete_file))
        .route("/v1/files/:id/content", get(file_content))
        .route("/v1/batches", post(create_batch).get(list_batches))
        .route("/v1/batches/:id", get(get_batch))
        .route("/v1/batches/:id/cancel", post(cancel_batch))
        .with_state(state)
}

/// Authenticated request context extractor; rejects with the OpenAI-shaped
/// 401 body.
pub struct Authed(pub RequestContext);

#[async_trait]
impl FromRequestParts<AppState> for Authed {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let authorization = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        state
            .authenticator
            .authenticate(authorization)
            .await
            .map(Authed)
            .map_err(ApiError::from)
    }
}

fn idempotency_key(parts: &axum::http::HeaderMap) -> Option<String> {
    parts
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

fn with_request_id(mut resp: Response, trace_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(trace_id) {
        resp.headers_mut().insert("X-Request-Id", value);
    }
    resp
}

async fn healthz() -> &'static str {
    "ok"
}

async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(resp) => resp,
        Err(err) => {
            tracing::warn!(?err, "Failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable").into_response()
        }
    }
}

// ---------------- inference endpoints ----------------

async fn chat_completions(
    State(state): State<AppState>,
    Authed(rc): Authed,
    headers: axum::http::HeaderMap,
    Json(body): Json<Value>,
) -> ApiResult<Response> {
    let req: ChatRequest = serde_json::from_value(body)
        .map_err(|err| ApiError::invalid("invalid_request", format!("invalid chat request: {err}")))?;
    let trace_id = Uuid::new_v4().to_string();
    let alias = req.model.clone();

    if req.stream == Some(true) {
        let events = state
            .executor
            .chat_stream(&rc, &alias, &req, Some(&trace_id))
            .await
            .map_err(|err| {
                state.metrics.record_request(batch::CHAT_ENDPOINT, err.status());
                ApiError::from(err)
            })?;
        state.metrics.record_request(batch::CHAT_ENDPOINT, 200);
        let sse_stream = events.map(|event| {
            let framed = match event {
                StreamEvent::Chunk(chunk) => Event::default().data(chunk.to_string()),
                StreamEvent::Error(body) => Event::default()
                    .event("error")
                    .data(serde_json::to_string(&body).unwrap_or_default()),
                StreamEvent::Done => Event::default().data("[DONE]"),
            };
            Ok::<Event, Infallible>(framed)
        });
        let resp = Sse::new(sse_stream)
            .keep_alive(KeepAlive::default())
            .into_response();
        return Ok(with_request_id(resp, &trace_id));
    }

    let idem = idempotency_key(&headers);
    let outcome = state
        .executor
        .chat(&rc, &alias, &req, Some(&trace_id), idem.as_deref())
        .await
        .map_err(|err| {
            state.metrics.record_request(batch::CHAT_ENDPOINT, err.status());
            ApiError::from(err)
        })?;
    state.metrics.record_request(batch::CHAT_ENDPOINT, 200);
    Ok(with_request_id(Json(outcome.payload).into_response(), &trace_id))
}

async fn embeddings(
    State(state): State<AppState>,
    Authed(rc): Authed,
    headers: axum::http::HeaderMap,
    Json(body): Json<Value>,
) -> ApiResult<Response> {
    let req: EmbeddingsRequest = serde_json::from_value(body).map_err(|err| {
        ApiError::invalid("invalid_request", format!("invalid embeddings request: {err}"))
    })?;
    let trace_id = Uuid::new_v4().to_string();
    let alias = req.model.clone();
    let idem = idempotency_key(&headers);
    let outcome = state
        .executor
        .embeddings(&rc, &alias, &req, Some(&trace_id), idem.as_deref())
        .await
        .map_err(|err| {
            state.metrics.record_request(batch::EMBEDDINGS_ENDPOINT, err.status());
            ApiError::from(err)
        })?;
    state.metrics.record_request(batch::EMBEDDINGS_ENDPOINT, 200);
    Ok(with_request_id(Json(outcome.payload).into_response(), &trace_id))
}

async fn images_generations(
    State(state): State<AppState>,
    Authed(rc): Authed,
    headers: axum::http::HeaderMap,
    Json(body): Json<Value>,
) -> ApiResult<Response> {
    let req: ImageRequest = serde_json::from_value(body)
        .map_err(|err| ApiError::invalid("invalid_request", format!("invalid image request: {err}")))?;
    let trace_id = Uuid::new_v4().to_string();
    let alias = req
        .model
        .clone()
        .ok_or_else(|| ApiError::invalid("invalid_request", "model is required"))?;
    let idem = idempotency_key(&headers);
    let outcome = state
        .executor
        .images(&rc, &alias, &req, Some(&trace_id), idem.as_deref())
        .await
        .map_err(|err| {
            state.metrics.record_request(batch::IMAGES_ENDPOINT, err.status());
            ApiError::from(err)
        })?;
    state.metrics.record_request(batch::IMAGES_ENDPOINT, 200);
    Ok(with_request_id(Json(outcome.payload).into_response(), &trace_id))
}

/// Shared multipart decoding for image edit/variation forms. Only the
/// textual controls matter to routing; binary parts ride along untouched.
async fn image_form(mut multipart: Multipart) -> ApiResult<ImageRequest> {
    let mut req = ImageRequest {
        model: None,
        prompt: String::new(),
        n: None,
        size: None,
        quality: None,
        response_format: None,
        user: None,
        extra: serde_json::Map::new(),
    };
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::invalid("invalid_request", format!("malformed multipart body: {err}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "model" => req.model = Some(text_field(field).await?),
            "prompt" => req.prompt = text_field(field).await?,
            "n" => req.n = text_field(field).await?.parse().ok(),
            "size" => req.size = Some(text_field(field).await?),
            "response_format" => req.response_format = Some(text_field(field).await?),
            "user" => req.user = Some(text_field(field).await?),
            _ => {
                // Consume binary parts (image, mask) without buffering them
                // into the routed request.
                let _ = field.bytes().await;
            }
        }
    }
    Ok(req)
}

async fn text_field(field: axum::extract::multipart::Field<'_>) -> ApiResult<String> {
    field
        .text()
        .await
        .map_err(|err| ApiError::invalid("invalid_request", format!("malformed field: {err}")))
}

async fn images_edits(
    State(state): State<AppState>,
    Authed(rc): Authed,
    multipart: Multipart,
) -> ApiResult<Response> {
    let req = image_form(multipart).await?;
    let trace_id = Uuid::new_v4().to_string();
    let alias = req
        .model
        .clone()
        .ok_or_else(|| ApiError::invalid("invalid_request", "model is required"))?;
    let outcome = state
        .executor
        .image_edit(&rc, &alias, &req, Some(&trace_id))
        .await
        .map_err(ApiError::from)?;
    Ok(with_request_id(Json(outcome.payload).into_response(), &trace_id))
}

async fn images_variations(
    State(state): State<AppState>,
    Authed(rc): Authed,
    multipart: Multipart,
) -> ApiResult<Response> {
    let req = image_form(multipart).await?;
    let trace_id = Uuid::new_v4().to_string();
    let alias = req
        .model
        .clone()
        .ok_or_else(|| ApiError::invalid("invalid_request", "model is required"))?;
    let outcome = state
        .executor
        .image_variation(&rc, &alias, &req, Some(&trace_id))
        .await
        .map_err(ApiError::from)?;
    Ok(with_request_id(Json(outcome.payload).into_response(), &trace_id))
}

// ---------------- models ----------------

async fn list_models(State(state): State<AppState>, Authed(rc): Authed) -> ApiResult<Response> {
    let entries = state
        .store
        .list_catalog()
        .await
        .map_err(|err| ApiError::internal(err))?;
    let mut seen = std::collections::HashSet::new();
    let models: Vec<ModelObject> = entries
        .into_iter()
        .filter(|e| e.enabled && rc.allows_model(&e.alias))
        .filter(|e| seen.insert(e.alias.clone()))
        .map(|e| ModelObject {
            id: e.alias,
            object: "model".to_string(),
            created: e.created_at.timestamp(),
            owned_by: e.provider,
        })
        .collect();
    Ok(Json(ListEnvelope::new(models, false)).into_response())
}

// ---------------- files ----------------

#[derive(Deserialize)]
struct ListQuery {
    limit: Option<usize>,
    after: Option<String>,
}

fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(20).clamp(1, 100)
}

fn file_to_wire(meta: &crate::files::StoredFile) -> FileObject {
    FileObject {
        id: meta.id.clone(),
        object: "file".to_string(),
        bytes: meta.bytes,
        created_at: meta.created_at.timestamp(),
        filename: meta.filename.clone(),
        purpose: meta.purpose.clone(),
    }
}

async fn upload_file(
    State(state): State<AppState>,
    Authed(rc): Authed,
    mut multipart: Multipart,
) -> ApiResult<Response> {
    let mut purpose = None;
    let mut filename = None;
    let mut content: Option<Bytes> = None;
    let mut content_type = "application/octet-stream".to_string();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::invalid("invalid_request", format!("malformed multipart body: {err}")))?
    {
        match field.name().unwrap_or_default() {
            "purpose" => purpose = Some(text_field(field).await?),
            "file" => {
                filename = field.file_name().map(|f| f.to_string());
                if let Some(ct) = field.content_type() {
                    content_type = ct.to_string();
                }
                content = Some(field.bytes().await.map_err(|err| {
                    ApiError::invalid("invalid_request", format!("failed to read file: {err}"))
                })?);
            }
            _ => {
                let _ = field.bytes().await;
            }
        }
    }

    let purpose = purpose.ok_or_else(|| ApiError::invalid("invalid_request", "purpose is required"))?;
    let content = content.ok_or_else(|| ApiError::invalid("invalid_request", "file is required"))?;
    let stored = state
        .files
        .upload(UploadParams {
            tenant_id: rc.tenant_id,
            filename: filename.unwrap_or_else(|| "upload".to_string()),
            purpose,
            content_type,
            ttl: None,
            content,
        })
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(file_to_wire(&stored)).into_response())
}

async fn list_files(
    State(state): State<AppState>,
    Authed(rc): Authed,
    Query(query): Query<ListQuery>,
) -> ApiResult<Response> {
    let limit = clamp_limit(query.limit);
    let (files, has_more) = state
        .files
        .list(rc.tenant_id, limit, query.after.as_deref())
        .await
        .map_err(ApiError::internal)?;
    let wire: Vec<FileObject> = files.iter().map(file_to_wire).collect();
    Ok(Json(ListEnvelope::new(wire, has_more)).into_response())
}

async fn get_file(
    State(state): State<AppState>,
    Authed(rc): Authed,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let meta = state
        .files
        .get(rc.tenant_id, &id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::NotFound { code: "file_not_found", message: format!("file {id} not found") })?;
    Ok(Json(file_to_wire(&meta)).into_response())
}

async fn file_content(
    State(state): State<AppState>,
    Authed(rc): Authed,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let content = state
        .files
        .download(rc.tenant_id, &id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::NotFound { code: "file_not_found", message: format!("file {id} not found") })?;
    Ok(Response::builder()
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .body(Body::from(content))
        .map_err(ApiError::internal)?)
}

async fn delete_file(
    State(state): State<AppState>,
    Authed(rc): Authed,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let deleted = state
        .files
        .delete(rc.tenant_id, &id)
        .await
        .map_err(ApiError::internal)?;
    if !deleted {
        return Err(ApiError::NotFound { code: "file_not_found", message: format!("file {id} not found") });
    }
    Ok(Json(DeletedObject { id, object: "file".to_string(), deleted: true }).into_response())
}

// ---------------- batches ----------------

const MAX_METADATA_PAIRS: usize = 16;
const MAX_METADATA_KEY: usize = 64;
const MAX_METADATA_VALUE: usize = 512;

fn validate_metadata(metadata: &serde_json::Map<String, Value>) -> ApiResult<()> {
    if metadata.len() > MAX_METADATA_PAIRS {
        return Err(ApiError::invalid("invalid_metadata", "metadata allows at most 16 pairs"));
    }
    for (key, value) in metadata {
        if key.len() > MAX_METADATA_KEY {
            return Err(ApiError::invalid("invalid_metadata", "metadata keys allow at most 64 chars"));
        }
        match value.as_str() {
            Some(s) if s.len() <= MAX_METADATA_VALUE => {}
            Some(_) => {
                return Err(ApiError::invalid(
                    "invalid_metadata",
                    "metadata values allow at most 512 chars",
                ))
            }
            None => {
                return Err(ApiError::invalid("invalid_metadata", "metadata values must be strings"))
            }
        }
    }
    Ok(())
}

fn parse_completion_window(window: &str) -> Duration {
    let parsed = window
        .strip_suffix('h')
        .and_then(|n| n.parse::<u64>().ok())
        .map(|h| Duration::from_secs(h * 3600))
        .or_else(|| {
            window
                .strip_suffix('d')
                .and_then(|n| n.parse::<u64>().ok())
                .map(|d| Duration::from_secs(d * 86_400))
        });
    parsed.unwrap_or(Duration::from_secs(24 * 3600))
}

fn ts(value: Option<DateTime<Utc>>) -> Option<i64> {
    value.map(|v| v.timestamp())
}

pub fn batch_to_wire(row: &BatchRow) -> BatchObject {
    BatchObject {
        id: format!("batch_{}", row.id.simple()),
        object: "batch".to_string(),
        endpoint: row.endpoint.clone(),
        errors: row.errors.clone(),
        input_file_id: row.input_file_id.clone(),
        completion_window: row.completion_window.clone(),
        status: row.status.as_str().to_string(),
        output_file_id: row.output_file_id.clone(),
        error_file_id: row.error_file_id.clone(),
        created_at: row.created_at.timestamp(),
        in_progress_at: ts(row.in_progress_at),
        expires_at: ts(row.expires_at),
        finalizing_at: ts(row.finalizing_at),
        completed_at: ts(row.completed_at),
        failed_at: ts(row.failed_at),
        expired_at: ts(row.expired_at),
        cancelling_at: ts(row.cancelling_at),
        cancelled_at: ts(row.cancelled_at),
        request_counts: BatchCounts {
            total: row.total,
            completed: row.completed,
            failed: row.failed,
            cancelled: row.cancelled,
        },
        metadata: row
            .metadata
            .as_ref()
            .and_then(|m| m.as_object().cloned()),
    }
}

fn parse_batch_id(wire_id: &str) -> ApiResult<Uuid> {
    let raw = wire_id.strip_prefix("batch_").unwrap_or(wire_id);
    Uuid::parse_str(raw)
        .map_err(|_| ApiError::NotFound { code: "batch_not_found", message: format!("batch {wire_id} not found") })
}

async fn create_batch(
    State(state): State<AppState>,
    Authed(rc): Authed,
    Json(req): Json<CreateBatchRequest>,
) -> ApiResult<Response> {
    if !batch::supported_endpoint(&req.endpoint) {
        return Err(ApiError::invalid(
            "invalid_endpoint",
            format!("endpoint {} is not batchable", req.endpoint),
        ));
    }
    if let Some(metadata) = &req.metadata {
        validate_metadata(metadata)?;
    }

    let input = state
        .files
        .download(rc.tenant_id, &req.input_file_id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| {
            ApiError::invalid("invalid_request", format!("input file {} not found", req.input_file_id))
        })?;
    let text = String::from_utf8_lossy(&input);
    let mut items = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        // Unparsable lines still become items; the worker rejects them with
        // a per-item error instead of failing the submission.
        let value: Value = serde_json::from_str(line).unwrap_or(Value::String(line.to_string()));
        let custom_id = value
            .get("custom_id")
            .and_then(|c| c.as_str())
            .map(|c| c.to_string());
        items.push((custom_id, value));
    }
    if items.is_empty() {
        return Err(ApiError::invalid("invalid_request", "input file has no request lines"));
    }

    let now = state.clock.now();
    let window = parse_completion_window(&req.completion_window);
    let created = state
        .store
        .create_batch(
            crate::store::NewBatch {
                tenant_id: rc.tenant_id,
                api_key_id: rc.api_key_id,
                endpoint: req.endpoint.clone(),
                input_file_id: req.input_file_id.clone(),
                completion_window: req.completion_window.clone(),
                max_concurrency: req.max_concurrency.unwrap_or(1).max(1) as i32,
                metadata: req.metadata.clone().map(Value::Object),
                expires_at: Some(now + chrono::Duration::seconds(window.as_secs() as i64)),
            },
            items,
            now,
        )
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(batch_to_wire(&created)).into_response())
}

async fn list_batches(
    State(state): State<AppState>,
    Authed(rc): Authed,
    Query(query): Query<ListQuery>,
) -> ApiResult<Response> {
    let limit = clamp_limit(query.limit);
    let after = match &query.after {
        Some(cursor) => Some(parse_batch_id(cursor)?),
        None => None,
    };
    let (rows, has_more) = state
        .store
        .list_batches(rc.tenant_id, limit, after)
        .await
        .map_err(ApiError::internal)?;
    let wire: Vec<BatchObject> = rows.iter().map(batch_to_wire).collect();
    Ok(Json(ListEnvelope::new(wire, has_more)).into_response())
}

async fn get_batch(
    State(state): State<AppState>,
    Authed(rc): Authed,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let batch_id = parse_batch_id(&id)?;
    let row = state
        .store
        .get_batch(Some(rc.tenant_id), batch_id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::NotFound { code: "batch_not_found", message: format!("batch {id} not found") })?;
    Ok(Json(batch_to_wire(&row)).into_response())
}

async fn cancel_batch(
    State(state): State<AppState>,
    Authed(rc): Authed,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let batch_id = parse_batch_id(&id)?;
    let cancelled = state
        .store
        .cancel_batch(rc.tenant_id, batch_id, state.clock.now())
        .await
        .map_err(ApiError::internal)?;
    match cancelled {
        Some(row) => Ok(Json(batch_to_wire(&row)).into_response()),
        None => {
            // Either unknown or already terminal; disambiguate for the caller.
            let existing = state
                .store
                .get_batch(Some(rc.tenant_id), batch_id)
                .await
                .map_err(ApiError::internal)?;
            match existing {
                Some(row) => Err(ApiError::invalid(
                    "batch_not_cancellable",
                    format!("batch is already {}", row.status.as_str()),
                )),
                None => Err(ApiError::NotFound {
                    code: "batch_not_found",
                    message: format!("batch {id} not found"),
                }),
            }
        }
    }
}
