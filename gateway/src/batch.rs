use crate::clock::Clock;
use crate::context::{ContextBuilder, RequestContext};
use crate::error::{error_type_for_status, GatewayError};
use crate::executor::Executor;
use crate::files::{FileStore, UploadParams};
use crate::store::{BatchItemRow, BatchItemStatus, BatchRow, BatchStatus, Store};
use crate::wire::{
    BatchErrorLine, BatchInputLine, BatchItemError, BatchOutputLine, ChatRequest,
    EmbeddingsRequest, ImageRequest,
};
use anyhow::{Context as _, Result};
use bytes::Bytes;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};

pub const CHAT_ENDPOINT: &str = "/v1/chat/completions";
pub const EMBEDDINGS_ENDPOINT: &str = "/v1/embeddings";
pub const IMAGES_ENDPOINT: &str = "/v1/images/generations";

pub fn supported_endpoint(endpoint: &str) -> bool {
    matches!(endpoint, CHAT_ENDPOINT | EMBEDDINGS_ENDPOINT | IMAGES_ENDPOINT)
}

enum BatchEnd {
    Drained,
    Cancelled,
    Expired,
    /// Worker shutting down mid-batch; items stay claimable.
    Interrupted,
}

/// Polls for queued batches and replays each item through the executor.
/// Multiple workers cooperate through SKIP LOCKED claims; one batch's items
/// are processed sequentially by the worker that claimed them.
pub struct BatchWorker {
    store: Arc<dyn Store>,
    files: Arc<dyn FileStore>,
    executor: Arc<Executor>,
    contexts: Arc<ContextBuilder>,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    error_backoff: Duration,
    shutdown: watch::Receiver<bool>,
}

impl BatchWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        files: Arc<dyn FileStore>,
        executor: Arc<Executor>,
        contexts: Arc<ContextBuilder>,
        clock: Arc<dyn Clock>,
        poll_interval: Duration,
        error_backoff: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            files,
            executor,
            contexts,
            clock,
            poll_interval,
            error_backoff,
            shutdown,
        }
    }

    pub async fn run(self) {
        info!("Batch worker started");
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            match self.store.claim_next_batch(self.clock.now()).await {
                Ok(Some(batch)) => {
                    let batch_id = batch.id;
                    if let Err(err) = self.process_batch(batch).await {
                        error!(?err, %batch_id, "Batch processing failed");
                        sleep(self.error_backoff).await;
                    }
                }
                Ok(None) => {
                    let mut shutdown = self.shutdown.clone();
                    tokio::select! {
                        _ = sleep(self.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(err) => {
                    error!(?err, "Batch claim failed");
                    sleep(self.error_backoff).await;
                }
            }
        }
        info!("Batch worker stopped");
    }

    pub async fn process_batch(&self, batch: BatchRow) -> Result<()> {
        info!(batch_id = %batch.id, endpoint = %batch.endpoint, total = batch.total, "Processing batch");
        let rc = match self.contexts.for_api_key_id(batch.api_key_id).await {
            Ok(rc) => rc,
            Err(err) => {
                // Revoked key or suspended tenant fails the whole batch.
                return self.fail_batch_for_context(&batch, &err.to_string()).await;
            }
        };

        let mut output = NdjsonBuffer::default();
        let mut errors = NdjsonBuffer::default();
        let mut completed = 0i32;
        let mut failed = 0i32;

        let end = loop {
            if *self.shutdown.borrow() {
                break BatchEnd::Interrupted;
            }
            match self.store.batch_status(batch.id).await? {
                Some(BatchStatus::Cancelling) => break BatchEnd::Cancelled,
                Some(_) => {}
                None => anyhow::bail!("batch {} disappeared mid-processing", batch.id),
            }
            if let Some(expires_at) = batch.expires_at {
                if self.clock.now() >= expires_at {
                    break BatchEnd::Expired;
                }
            }
            let Some(item) = self.store.claim_next_item(batch.id).await? else {
                break BatchEnd::Drained;
            };
            match self.execute_item(&rc, &batch, &item).await {
                Ok(response) => {
                    // Row update strictly precedes the NDJSON line and the
                    // counter bump for this item.
                    self.store.complete_item(item.id, response.clone()).await?;
                    output.push(&BatchOutputLine {
                        id: line_id(&item),
                        custom_id: item.custom_id.clone(),
                        response,
                    })?;
                    completed += 1;
                }
                Err(item_error) => {
                    self.store
                        .fail_item(item.id, serde_json::to_value(&item_error)?)
                        .await?;
                    errors.push(&BatchErrorLine {
                        id: line_id(&item),
                        custom_id: item.custom_id.clone(),
                        error: item_error,
                    })?;
                    failed += 1;
                }
            }
        };

        if matches!(end, BatchEnd::Interrupted) {
            // Do not finalize; remaining items stay claimable by the next
            // worker iteration.
            warn!(batch_id = %batch.id, "Batch interrupted by shutdown");
            return Ok(());
        }

        let cancelled = match end {
            BatchEnd::Cancelled | BatchEnd::Expired => {
                self.store.count_items(batch.id, BatchItemStatus::Queued).await? as i32
            }
            _ => 0,
        };
        self.store
            .increment_counts(batch.id, completed, failed, cancelled)
            .await?;
        self.store.set_batch_finalizing(batch.id, self.clock.now()).await?;

        let output_id = self.upload_artifact(&batch, "output", output).await?;
        let error_id = self.upload_artifact(&batch, "errors", errors).await?;

        let status = match end {
            BatchEnd::Cancelled => BatchStatus::Cancelled,
            BatchEnd::Expired => BatchStatus::Expired,
            _ if completed == 0 && failed > 0 => BatchStatus::Failed,
            _ => BatchStatus::Completed,
        };
        self.store
            .finalize_batch(batch.id, status, output_id, error_id, None, self.clock.now())
            .await?;
        info!(
            batch_id = %batch.id,
            status = status.as_str(),
            completed,
            failed,
            cancelled,
            "Batch finalized"
        );
        Ok(())
    }

    /// Context failure: every remaining item fails with `context_error` and
    /// the batch finalizes as failed.
    async fn fail_batch_for_context(&self, batch: &BatchRow, message: &str) -> Result<()> {
        warn!(batch_id = %batch.id, message, "Failing batch on context error");
        let mut errors = NdjsonBuffer::default();
        let mut failed = 0i32;
        while let Some(item) = self.store.claim_next_item(batch.id).await? {
            let item_error = BatchItemError {
                code: "context_error".to_string(),
                message: message.to_string(),
            };
            self.store
                .fail_item(item.id, serde_json::to_value(&item_error)?)
                .await?;
            errors.push(&BatchErrorLine {
                id: line_id(&item),
                custom_id: item.custom_id.clone(),
                error: item_error,
            })?;
            failed += 1;
        }
        self.store.increment_counts(batch.id, 0, failed, 0).await?;
        self.store.set_batch_finalizing(batch.id, self.clock.now()).await?;
        let error_id = self.upload_artifact(batch, "errors", errors).await?;
        self.store
            .finalize_batch(
                batch.id,
                BatchStatus::Failed,
                None,
                error_id,
                Some(json!({ "code": "context_error", "message": message })),
                self.clock.now(),
            )
            .await?;
        Ok(())
    }

    /// Validate and execute one item, mapping every failure to the wire
    /// `{code, message}` shape.
    async fn execute_item(
        &self,
        rc: &RequestContext,
        batch: &BatchRow,
        item: &BatchItemRow,
    ) -> Result<serde_json::Value, BatchItemError> {
        let line: BatchInputLine = serde_json::from_value(item.input.clone()).map_err(|err| {
            BatchItemError {
                code: "invalid_batch_input".to_string(),
                message: format!("malformed batch line: {err}"),
            }
        })?;
        if !line.method.eq_ignore_ascii_case("POST") {
            return Err(BatchItemError {
                code: "invalid_method".to_string(),
                message: format!("unsupported method {}", line.method),
            });
        }
        if line.url != batch.endpoint {
            return Err(BatchItemError {
                code: "invalid_endpoint".to_string(),
                message: format!("url {} does not match batch endpoint {}", line.url, batch.endpoint),
            });
        }
        if line.body.get("model").and_then(|m| m.as_str()).is_none() {
            return Err(BatchItemError {
                code: "invalid_request_error".to_string(),
                message: "model is required".to_string(),
            });
        }
        if line.body.get("stream").and_then(|s| s.as_bool()) == Some(true) {
            return Err(BatchItemError {
                code: "invalid_request_error".to_string(),
                message: "stream is not supported in batches".to_string(),
            });
        }

        let trace = format!("batch_{}_{}", batch.id.simple(), item.item_index);
        let result = match batch.endpoint.as_str() {
            CHAT_ENDPOINT => {
                let req: ChatRequest = serde_json::from_value(line.body).map_err(|err| {
                    BatchItemError {
                        code: "invalid_request_error".to_string(),
                        message: format!("invalid chat request: {err}"),
                    }
                })?;
                let alias = req.model.clone();
                self.executor.chat(rc, &alias, &req, Some(&trace), None).await
            }
            EMBEDDINGS_ENDPOINT => {
                let req: EmbeddingsRequest = serde_json::from_value(line.body).map_err(|err| {
                    BatchItemError {
                        code: "invalid_request_error".to_string(),
                        message: format!("invalid embeddings request: {err}"),
                    }
                })?;
                let alias = req.model.clone();
                self.executor
                    .embeddings(rc, &alias, &req, Some(&trace), None)
                    .await
            }
            IMAGES_ENDPOINT => {
                let req: ImageRequest = serde_json::from_value(line.body).map_err(|err| {
                    BatchItemError {
                        code: "invalid_request_error".to_string(),
                        message: format!("invalid image request: {err}"),
                    }
                })?;
                let alias = req.model.clone().unwrap_or_default();
                self.executor.images(rc, &alias, &req, Some(&trace), None).await
            }
            other => {
                return Err(BatchItemError {
                    code: "invalid_endpoint".to_string(),
                    message: format!("unsupported endpoint {other}"),
                })
            }
        };

        result.map(|outcome| outcome.payload).map_err(map_error)
    }

    async fn upload_artifact(
        &self,
        batch: &BatchRow,
        kind: &str,
        buffer: NdjsonBuffer,
    ) -> Result<Option<String>> {
        if buffer.is_empty() {
            return Ok(None);
        }
        let now = self.clock.now();
        let ttl = batch.expires_at.map(|expires_at| {
            let remaining = expires_at.signed_duration_since(now).num_seconds().max(0);
            Duration::from_secs(remaining as u64)
        });
        let stored = self
            .files
            .upload(UploadParams {
                tenant_id: batch.tenant_id,
                filename: format!("batch_{}_{kind}.jsonl", batch.id.simple()),
                purpose: "batch".to_string(),
                content_type: "application/jsonl".to_string(),
                ttl,
                content: buffer.into_bytes(),
            })
            .await
            .context("upload batch artifact")?;
        Ok(Some(stored.id))
    }
}

fn line_id(item: &BatchItemRow) -> String {
    format!("batch_req_{}", item.id.simple())
}

/// Maps an executor failure to the batch error-file `{code, message}` entry.
fn map_error(err: GatewayError) -> BatchItemError {
    let code = err
        .code()
        .map(|c| c.to_string())
        .unwrap_or_else(|| error_type_for_status(err.status()).to_string());
    BatchItemError { code, message: err.to_string() }
}

/// Append-only NDJSON assembly; one serialized line per entry.
#[derive(Default)]
struct NdjsonBuffer {
    content: String,
    lines: usize,
}

impl NdjsonBuffer {
    fn push<T: serde::Serialize>(&mut self, line: &T) -> Result<()> {
        let serialized = serde_json::to_string(line)?;
        self.content.push_str(&serialized);
        self.content.push('\n');
        self.lines += 1;
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.lines == 0
    }

    fn into_bytes(self) -> Bytes {
        Bytes::from(self.content)
    }
}
