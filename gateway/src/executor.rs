use crate::alerts::AlertDispatcher;
use crate::budget::{BudgetEvaluator, BudgetStatus};
use crate::clock::Clock;
use crate::context::RequestContext;
use crate::error::{GatewayError, GatewayResult};
use crate::guardrails::{GuardrailAction, GuardrailEngine, GuardrailStage, StreamMonitor};
use crate::limits::{LimitError, RateLimiter, SlotRelease};
use crate::router::{Route, RouterEngine};
use crate::store::Store;
use crate::usage::{RequestOutcome, UsageRecorder};
use crate::wire::{ChatRequest, EmbeddingsRequest, ImageRequest, Usage};
use common_api_errors::ErrorBody;
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

/// Result of one executed request: the wire payload, the post-call budget
/// status, and whether this was an idempotent replay.
#[derive(Debug)]
pub struct ExecOutcome {
    pub payload: Value,
    pub budget: Option<BudgetStatus>,
    pub replayed: bool,
}

/// Events emitted on the streaming path. `Done` maps to the final
/// `data: [DONE]` frame; `Error` to an in-stream `event: error`.
pub enum StreamEvent {
    Chunk(Value),
    Error(ErrorBody),
    Done,
}

#[derive(Debug, Clone, Copy)]
enum ImageOp {
    Generate,
    Edit,
    Variation,
}

/// Single code path sequencing budget → admission → route iteration →
/// usage accounting → alerting for every endpoint family.
pub struct Executor {
    router: Arc<RouterEngine>,
    budget: Arc<BudgetEvaluator>,
    limiter: Arc<RateLimiter>,
    usage: Arc<UsageRecorder>,
    alerts: Arc<AlertDispatcher>,
    guardrails: Arc<GuardrailEngine>,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    provider_timeout: Duration,
}

impl Executor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        router: Arc<RouterEngine>,
        budget: Arc<BudgetEvaluator>,
        limiter: Arc<RateLimiter>,
        usage: Arc<UsageRecorder>,
        alerts: Arc<AlertDispatcher>,
        guardrails: Arc<GuardrailEngine>,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        provider_timeout: Duration,
    ) -> Self {
        Self {
            router,
            budget,
            limiter,
            usage,
            alerts,
            guardrails,
            store,
            clock,
            provider_timeout,
        }
    }

    // ---------------- shared pipeline steps ----------------

    /// Route lookup, tenant ACL, and the single pre-call budget check.
    /// A blocked budget records its failure row before returning.
    async fn admit(
        &self,
        rc: &RequestContext,
        alias: &str,
        trace_id: Option<&str>,
    ) -> GatewayResult<(Vec<Arc<Route>>, BudgetStatus)> {
        if !rc.allows_model(alias) {
            return Err(GatewayError::Authorization {
                code: "model_not_permitted",
                message: format!("model {alias} is not enabled for this tenant"),
            });
        }
        let routes = self.router.select_routes(alias).await;
        if routes.is_empty() {
            return Err(GatewayError::ServiceUnavailable(format!(
                "no route available for model {alias}"
            )));
        }
        let now = self.clock.now();
        let status = self.budget.check(rc, now).await?;
        if status.exceeded {
            let outcome = RequestOutcome {
                alias: alias.to_string(),
                provider: "budget".to_string(),
                model: String::new(),
                success: false,
                status: 403,
                error_code: Some("budget_exceeded".to_string()),
                latency_ms: 0,
                input_tokens: 0,
                output_tokens: 0,
                idempotency_key: None,
                trace_id: trace_id.map(|t| t.to_string()),
                response: None,
                cost_override_cents: None,
            };
            if let Err(err) = self.usage.persist(rc, outcome, now).await {
                warn!(?err, "Failed to persist budget-blocked request");
            }
            self.alerts.dispatch_budget(rc, &status, now).await;
            return Err(GatewayError::BudgetExceeded);
        }
        Ok((routes, status))
    }

    async fn acquire(
        &self,
        rc: &RequestContext,
        alias: &str,
        trace_id: Option<&str>,
    ) -> GatewayResult<SlotRelease> {
        let key_scope = rc.key_scope(alias);
        let tenant_scope = rc.tenant_scope(alias);
        let result = self
            .limiter
            .acquire(&key_scope, &tenant_scope, &rc.rate_limit, &rc.rate_limit, self.clock.now())
            .await;
        match result {
            Ok(release) => Ok(release),
            Err(LimitError::Store(err)) => Err(GatewayError::Internal(err)),
            Err(LimitError::Exceeded(msg)) => {
                // A rejected admission is still an attempted request.
                self.persist_outcome(
                    rc,
                    RequestOutcome {
                        alias: alias.to_string(),
                        provider: "ratelimit".to_string(),
                        model: String::new(),
                        success: false,
                        status: 429,
                        error_code: Some("rate_limit_exceeded".to_string()),
                        latency_ms: 0,
                        input_tokens: 0,
                        output_tokens: 0,
                        idempotency_key: None,
                        trace_id: trace_id.map(|t| t.to_string()),
                        response: None,
                        cost_override_cents: None,
                    },
                )
                .await;
                Err(GatewayError::RateLimited(msg))
            }
        }
    }

    /// Prompt-stage guardrail gate. A block is still an attempted request:
    /// its failure row is written before the error propagates, matching the
    /// budget and rate-limit rejection paths.
    async fn inspect_prompt(
        &self,
        rc: &RequestContext,
        alias: &str,
        text: &str,
        trace_id: Option<&str>,
    ) -> GatewayResult<()> {
        if let Err(block) = self
            .guardrails
            .inspect(rc, GuardrailStage::Prompt, text, self.clock.now())
            .await
        {
            self.persist_outcome(
                rc,
                RequestOutcome {
                    alias: alias.to_string(),
                    provider: "guardrail".to_string(),
                    model: String::new(),
                    success: false,
                    status: block.status() as i32,
                    error_code: block.code().map(|c| c.to_string()),
                    latency_ms: 0,
                    input_tokens: 0,
                    output_tokens: 0,
                    idempotency_key: None,
                    trace_id: trace_id.map(|t| t.to_string()),
                    response: None,
                    cost_override_cents: None,
                },
            )
            .await;
            return Err(block);
        }
        Ok(())
    }

    /// Charge reported tokens against both TPM scopes. A breach is
    /// surfaced but the call's usage stays accounted.
    async fn charge_tokens(
        &self,
        rc: &RequestContext,
        alias: &str,
        tokens: i64,
    ) -> Result<(), GatewayError> {
        for scope in [rc.key_scope(alias), rc.tenant_scope(alias)] {
            match self
                .limiter
                .token_allowance(&scope, tokens, &rc.rate_limit, self.clock.now())
                .await
            {
                Ok(()) => {}
                Err(LimitError::Exceeded(msg)) => return Err(GatewayError::RateLimited(msg)),
                Err(LimitError::Store(err)) => return Err(GatewayError::Internal(err)),
            }
        }
        Ok(())
    }

    /// Post-call budget status for the response envelope plus alerting.
    async fn settle_budget(&self, rc: &RequestContext, fallback: BudgetStatus) -> BudgetStatus {
        let now = self.clock.now();
        let status = match self.budget.check(rc, now).await {
            Ok(status) => status,
            Err(err) => {
                debug!(?err, "Post-call budget check failed, using pre-call status");
                fallback
            }
        };
        self.alerts.dispatch_budget(rc, &status, now).await;
        status
    }

    async fn persist_outcome(&self, rc: &RequestContext, outcome: RequestOutcome) {
        if let Err(err) = self.usage.persist(rc, outcome, self.clock.now()).await {
            warn!(?err, "Failed to persist request outcome");
        }
    }

    /// Idempotent replay lookup. A present key with a stored success payload
    /// short-circuits the pipeline entirely.
    async fn replay(
        &self,
        rc: &RequestContext,
        idempotency_key: Option<&str>,
    ) -> GatewayResult<Option<ExecOutcome>> {
        let Some(key) = idempotency_key else {
            return Ok(None);
        };
        let existing = self
            .store
            .find_request_by_idempotency(rc.tenant_id, key)
            .await
            .map_err(GatewayError::Internal)?;
        match existing {
            None => Ok(None),
            Some(row) => match row.response {
                Some(payload) => Ok(Some(ExecOutcome { payload, budget: None, replayed: true })),
                // The key exists but belongs to a failed attempt; replaying
                // a failure body is not possible, so reject the reuse.
                None => Err(GatewayError::invalid(
                    "idempotency_key_in_use",
                    "idempotency key was already used by a failed request",
                )),
            },
        }
    }

    fn all_failed(last: Option<GatewayError>, alias: &str) -> (GatewayError, i32, Option<String>) {
        let message = match &last {
            Some(err) => format!("all routes for {alias} failed: {err}"),
            None => format!("no capable route for {alias}"),
        };
        let error = GatewayError::Provider { status: 502, message };
        let code = error.code().map(|c| c.to_string());
        (error, 502, code)
    }

    // ---------------- chat ----------------

    pub async fn chat(
        &self,
        rc: &RequestContext,
        alias: &str,
        req: &ChatRequest,
        trace_id: Option<&str>,
        idempotency_key: Option<&str>,
    ) -> GatewayResult<ExecOutcome> {
        if let Some(replayed) = self.replay(rc, idempotency_key).await? {
            return Ok(replayed);
        }
        let (routes, pre_status) = self.admit(rc, alias, trace_id).await?;

        let prompt: String = req
            .messages
            .iter()
            .map(|m| m.text())
            .collect::<Vec<_>>()
            .join("\n");
        self.inspect_prompt(rc, alias, &prompt, trace_id).await?;

        let release = self.acquire(rc, alias, trace_id).await?;
        let started = Instant::now();
        let mut last_err: Option<GatewayError> = None;
        let mut last_provider = String::new();

        for route in &routes {
            let Some(chat) = &route.capabilities.chat else {
                continue;
            };
            last_provider = route.provider.clone();
            let attempt = tokio::time::timeout(self.provider_timeout, chat.chat(&route.model, req)).await;
            let result = match attempt {
                Ok(result) => result,
                Err(_) => Err(crate::providers::ProviderError::new(
                    Some(504),
                    "provider call timed out",
                )),
            };
            match result {
                Err(err) => {
                    self.router.report_failure(route);
                    debug!(
                        alias,
                        provider = %route.provider,
                        model = %route.model,
                        %err,
                        "Route attempt failed, falling back"
                    );
                    last_err = Some(GatewayError::Provider {
                        status: err.status.unwrap_or(502),
                        message: err.message,
                    });
                    continue;
                }
                Ok(resp) => {
                    self.router.report_success(route);
                    let latency_ms = started.elapsed().as_millis() as i64;
                    let usage = resp.usage.clone();

                    let response_text: String = resp
                        .choices
                        .iter()
                        .map(|c| c.message.text())
                        .collect::<Vec<_>>()
                        .join("\n");
                    if let Err(block) = self
                        .guardrails
                        .inspect(rc, GuardrailStage::Response, &response_text, self.clock.now())
                        .await
                    {
                        self.persist_outcome(
                            rc,
                            self.success_outcome(route, alias, 403, &usage, latency_ms, trace_id, None, block.code()),
                        )
                        .await;
                        release.release().await;
                        return Err(block);
                    }

                    let payload = serde_json::to_value(&resp)
                        .map_err(|err| GatewayError::Internal(err.into()))?;
                    let stored_response = idempotency_key.map(|_| payload.clone());

                    if usage.total_tokens > 0 {
                        if let Err(breach) = self.charge_tokens(rc, alias, usage.total_tokens).await {
                            self.persist_outcome(
                                rc,
                                self.success_outcome(
                                    route, alias, 429, &usage, latency_ms, trace_id, None,
                                    breach.code(),
                                ),
                            )
                            .await;
                            release.release().await;
                            return Err(breach);
                        }
                    }

                    self.persist_outcome(
                        rc,
                        RequestOutcome {
                            alias: alias.to_string(),
                            provider: route.provider.clone(),
                            model: route.model.clone(),
                            success: true,
                            status: 200,
                            error_code: None,
                            latency_ms,
                            input_tokens: usage.prompt_tokens,
                            output_tokens: usage.completion_tokens,
                            idempotency_key: idempotency_key.map(|k| k.to_string()),
                            trace_id: trace_id.map(|t| t.to_string()),
                            response: stored_response,
                            cost_override_cents: None,
                        },
                    )
                    .await;
                    release.release().await;
                    let budget = self.settle_budget(rc, pre_status).await;
                    return Ok(ExecOutcome { payload, budget: Some(budget), replayed: false });
                }
            }
        }

        // Every route failed (or none carried the capability).
        let latency_ms = started.elapsed().as_millis() as i64;
        let (error, status, code) = Self::all_failed(last_err, alias);
        self.persist_outcome(
            rc,
            RequestOutcome {
                alias: alias.to_string(),
                provider: if last_provider.is_empty() { "none".to_string() } else { last_provider },
                model: String::new(),
                success: false,
                status,
                error_code: code.or_else(|| Some("provider_error".to_string())),
                latency_ms,
                input_tokens: 0,
                output_tokens: 0,
                idempotency_key: None,
                trace_id: trace_id.map(|t| t.to_string()),
                response: None,
                cost_override_cents: None,
            },
        )
        .await;
        release.release().await;
        Err(error)
    }

    #[allow(clippy::too_many_arguments)]
    fn success_outcome(
        &self,
        route: &Route,
        alias: &str,
        status: i32,
        usage: &Usage,
        latency_ms: i64,
        trace_id: Option<&str>,
        response: Option<Value>,
        error_code: Option<&str>,
    ) -> RequestOutcome {
        RequestOutcome {
            alias: alias.to_string(),
            provider: route.provider.clone(),
            model: route.model.clone(),
            success: true,
            status,
            error_code: error_code.map(|c| c.to_string()),
            latency_ms,
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            idempotency_key: None,
            trace_id: trace_id.map(|t| t.to_string()),
            response,
            cost_override_cents: None,
        }
    }

    // ---------------- chat streaming ----------------

    /// Streaming chat. Fail-over applies only to stream initiation; once
    /// chunks flow, the stream is committed to its route. The returned
    /// events are ready to frame as SSE.
    pub async fn chat_stream(
        &self,
        rc: &RequestContext,
        alias: &str,
        req: &ChatRequest,
        trace_id: Option<&str>,
    ) -> GatewayResult<ReceiverStream<StreamEvent>> {
        let (routes, pre_status) = self.admit(rc, alias, trace_id).await?;
        let prompt: String = req
            .messages
            .iter()
            .map(|m| m.text())
            .collect::<Vec<_>>()
            .join("\n");
        self.inspect_prompt(rc, alias, &prompt, trace_id).await?;

        let release = self.acquire(rc, alias, trace_id).await?;
        let started = Instant::now();
        let mut last_err: Option<GatewayError> = None;
        let mut opened = None;

        for route in &routes {
            let Some(streamer) = &route.capabilities.chat_stream else {
                continue;
            };
            match streamer.stream(&route.model, req).await {
                Ok(stream) => {
                    self.router.report_success(route);
                    opened = Some((route.clone(), stream));
                    break;
                }
                Err(err) => {
                    self.router.report_failure(route);
                    last_err = Some(GatewayError::Provider {
                        status: err.status.unwrap_or(502),
                        message: err.message,
                    });
                }
            }
        }

        let Some((route, mut upstream)) = opened else {
            let latency_ms = started.elapsed().as_millis() as i64;
            let (error, status, code) = Self::all_failed(last_err, alias);
            self.persist_outcome(
                rc,
                RequestOutcome {
                    alias: alias.to_string(),
                    provider: "none".to_string(),
                    model: String::new(),
                    success: false,
                    status,
                    error_code: code,
                    latency_ms,
                    input_tokens: 0,
                    output_tokens: 0,
                    idempotency_key: None,
                    trace_id: trace_id.map(|t| t.to_string()),
                    response: None,
                    cost_override_cents: None,
                },
            )
            .await;
            release.release().await;
            return Err(error);
        };

        let (tx, rx) = mpsc::channel::<StreamEvent>(16);
        let rc = rc.clone();
        let alias = alias.to_string();
        let trace_id = trace_id.map(|t| t.to_string());
        let usage_recorder = self.usage.clone();
        let guardrails = self.guardrails.clone();
        let limiter = self.limiter.clone();
        let budget = self.budget.clone();
        let alerts = self.alerts.clone();
        let clock = self.clock.clone();
        let rate_limit = rc.rate_limit;

        tokio::spawn(async move {
            let mut monitor = StreamMonitor::new(rc.guardrails.as_ref());
            let mut usage = Usage::default();
            let mut final_status = 200;
            let mut error_code: Option<String> = None;

            while let Some(item) = upstream.next().await {
                match item {
                    Ok(chunk) => {
                        if let Some(chunk_usage) = &chunk.usage {
                            usage = chunk_usage.clone();
                        }
                        if let Some(matched) = monitor.observe(&chunk) {
                            // First keyword hit terminates the stream.
                            guardrails
                                .record_violation(
                                    &rc,
                                    GuardrailStage::Response,
                                    GuardrailAction::Block,
                                    Some("keyword".to_string()),
                                    json!({ "matched": matched }),
                                    clock.now(),
                                )
                                .await;
                            final_status = 403;
                            error_code = Some("guardrail_violation".to_string());
                            let body = GatewayError::Authorization {
                                code: "guardrail_violation",
                                message: "content blocked by guardrail policy".into(),
                            }
                            .wire_body();
                            let _ = tx.send(StreamEvent::Error(body)).await;
                            break;
                        }
                        match serde_json::to_value(&chunk) {
                            Ok(value) => {
                                if tx.send(StreamEvent::Chunk(value)).await.is_err() {
                                    // Client went away; drop cancels upstream.
                                    final_status = 499;
                                    break;
                                }
                            }
                            Err(err) => {
                                warn!(?err, "Failed to serialize stream chunk");
                            }
                        }
                    }
                    Err(err) => {
                        final_status = err.status.map(|s| s as i32).unwrap_or(502);
                        error_code = Some("provider_error".to_string());
                        let body = GatewayError::Provider {
                            status: err.status.unwrap_or(502),
                            message: err.message,
                        }
                        .wire_body();
                        let _ = tx.send(StreamEvent::Error(body)).await;
                        break;
                    }
                }
            }

            if usage.total_tokens > 0 {
                for scope in [rc.key_scope(&alias), rc.tenant_scope(&alias)] {
                    if let Err(LimitError::Exceeded(msg)) = limiter
                        .token_allowance(&scope, usage.total_tokens, &rate_limit, clock.now())
                        .await
                    {
                        if final_status == 200 {
                            final_status = 429;
                            error_code = Some("rate_limit_exceeded".to_string());
                            let _ = tx
                                .send(StreamEvent::Error(
                                    GatewayError::RateLimited(msg).wire_body(),
                                ))
                                .await;
                        }
                        break;
                    }
                }
            }

            let latency_ms = started.elapsed().as_millis() as i64;
            let outcome = RequestOutcome {
                alias: alias.clone(),
                provider: route.provider.clone(),
                model: route.model.clone(),
                success: true,
                status: final_status,
                error_code,
                latency_ms,
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
                idempotency_key: None,
                trace_id,
                response: None,
                cost_override_cents: None,
            };
            if let Err(err) = usage_recorder.persist(&rc, outcome, clock.now()).await {
                warn!(?err, "Failed to persist streamed request");
            }
            release.release().await;

            let now = clock.now();
            let status = budget.check(&rc, now).await.unwrap_or(pre_status);
            alerts.dispatch_budget(&rc, &status, now).await;

            if final_status == 200 {
                let _ = tx.send(StreamEvent::Done).await;
            }
        });

        Ok(ReceiverStream::new(rx))
    }

    // ---------------- embeddings ----------------

    pub async fn embeddings(
        &self,
        rc: &RequestContext,
        alias: &str,
        req: &EmbeddingsRequest,
        trace_id: Option<&str>,
        idempotency_key: Option<&str>,
    ) -> GatewayResult<ExecOutcome> {
        if let Some(replayed) = self.replay(rc, idempotency_key).await? {
            return Ok(replayed);
        }
        let (routes, pre_status) = self.admit(rc, alias, trace_id).await?;

        let input_text = match &req.input {
            Value::String(s) => s.clone(),
            Value::Array(items) => items
                .iter()
                .filter_map(|v| v.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
            _ => String::new(),
        };
        self.inspect_prompt(rc, alias, &input_text, trace_id).await?;

        let release = self.acquire(rc, alias, trace_id).await?;
        let started = Instant::now();
        let mut last_err: Option<GatewayError> = None;

        for route in &routes {
            let Some(embed) = &route.capabilities.embed else {
                continue;
            };
            let attempt =
                tokio::time::timeout(self.provider_timeout, embed.embed(&route.model, req)).await;
            let result = match attempt {
                Ok(result) => result,
                Err(_) => Err(crate::providers::ProviderError::new(
                    Some(504),
                    "provider call timed out",
                )),
            };
            match result {
                Err(err) => {
                    self.router.report_failure(route);
                    last_err = Some(GatewayError::Provider {
                        status: err.status.unwrap_or(502),
                        message: err.message,
                    });
                }
                Ok(resp) => {
                    self.router.report_success(route);
                    let latency_ms = started.elapsed().as_millis() as i64;
                    let usage = resp.usage.clone();
                    let payload = serde_json::to_value(&resp)
                        .map_err(|err| GatewayError::Internal(err.into()))?;
                    let stored = idempotency_key.map(|_| payload.clone());

                    if usage.total_tokens > 0 {
                        if let Err(breach) = self.charge_tokens(rc, alias, usage.total_tokens).await {
                            self.persist_outcome(
                                rc,
                                self.success_outcome(
                                    route, alias, 429, &usage, latency_ms, trace_id, None,
                                    breach.code(),
                                ),
                            )
                            .await;
                            release.release().await;
                            return Err(breach);
                        }
                    }
                    self.persist_outcome(
                        rc,
                        RequestOutcome {
                            alias: alias.to_string(),
                            provider: route.provider.clone(),
                            model: route.model.clone(),
                            success: true,
                            status: 200,
                            error_code: None,
                            latency_ms,
                            input_tokens: usage.prompt_tokens,
                            output_tokens: usage.completion_tokens,
                            idempotency_key: idempotency_key.map(|k| k.to_string()),
                            trace_id: trace_id.map(|t| t.to_string()),
                            response: stored,
                            cost_override_cents: None,
                        },
                    )
                    .await;
                    release.release().await;
                    let budget = self.settle_budget(rc, pre_status).await;
                    return Ok(ExecOutcome { payload, budget: Some(budget), replayed: false });
                }
            }
        }

        let latency_ms = started.elapsed().as_millis() as i64;
        let (error, status, code) = Self::all_failed(last_err, alias);
        self.persist_outcome(
            rc,
            RequestOutcome {
                alias: alias.to_string(),
                provider: "none".to_string(),
                model: String::new(),
                success: false,
                status,
                error_code: code,
                latency_ms,
                input_tokens: 0,
                output_tokens: 0,
                idempotency_key: None,
                trace_id: trace_id.map(|t| t.to_string()),
                response: None,
                cost_override_cents: None,
            },
        )
        .await;
        release.release().await;
        Err(error)
    }

    // ---------------- images ----------------

    pub async fn images(
        &self,
        rc: &RequestContext,
        alias: &str,
        req: &ImageRequest,
        trace_id: Option<&str>,
        idempotency_key: Option<&str>,
    ) -> GatewayResult<ExecOutcome> {
        self.images_op(rc, alias, req, trace_id, idempotency_key, ImageOp::Generate).await
    }

    pub async fn image_edit(
        &self,
        rc: &RequestContext,
        alias: &str,
        req: &ImageRequest,
        trace_id: Option<&str>,
    ) -> GatewayResult<ExecOutcome> {
        self.images_op(rc, alias, req, trace_id, None, ImageOp::Edit).await
    }

    pub async fn image_variation(
        &self,
        rc: &RequestContext,
        alias: &str,
        req: &ImageRequest,
        trace_id: Option<&str>,
    ) -> GatewayResult<ExecOutcome> {
        self.images_op(rc, alias, req, trace_id, None, ImageOp::Variation).await
    }

    async fn images_op(
        &self,
        rc: &RequestContext,
        alias: &str,
        req: &ImageRequest,
        trace_id: Option<&str>,
        idempotency_key: Option<&str>,
        op: ImageOp,
    ) -> GatewayResult<ExecOutcome> {
        if let Some(replayed) = self.replay(rc, idempotency_key).await? {
            return Ok(replayed);
        }
        let (routes, pre_status) = self.admit(rc, alias, trace_id).await?;
        self.inspect_prompt(rc, alias, &req.prompt, trace_id).await?;

        let release = self.acquire(rc, alias, trace_id).await?;
        let started = Instant::now();
        let mut last_err: Option<GatewayError> = None;

        for route in &routes {
            let Some(image) = &route.capabilities.image else {
                continue;
            };
            let call = async {
                match op {
                    ImageOp::Generate => image.generate(&route.model, req).await,
                    ImageOp::Edit => image.edit(&route.model, req).await,
                    ImageOp::Variation => image.variation(&route.model, req).await,
                }
            };
            let attempt = tokio::time::timeout(self.provider_timeout, call).await;
            let result = match attempt {
                Ok(result) => result,
                Err(_) => Err(crate::providers::ProviderError::new(
                    Some(504),
                    "provider call timed out",
                )),
            };
            match result {
                Err(err) => {
                    self.router.report_failure(route);
                    last_err = Some(GatewayError::Provider {
                        status: err.status.unwrap_or(502),
                        message: err.message,
                    });
                }
                Ok(resp) => {
                    self.router.report_success(route);
                    let latency_ms = started.elapsed().as_millis() as i64;
                    let images = resp.data.len() as i64;
                    // Per-route flat pricing, falling back to token pricing
                    // (usually zero for image backends).
                    let cost_override = route
                        .metadata_i64("price_image_cents")
                        .map(|per_image| per_image * images.max(1));
                    let payload = serde_json::to_value(&resp)
                        .map_err(|err| GatewayError::Internal(err.into()))?;
                    let stored = idempotency_key.map(|_| payload.clone());
                    self.persist_outcome(
                        rc,
                        RequestOutcome {
                            alias: alias.to_string(),
                            provider: route.provider.clone(),
                            model: route.model.clone(),
                            success: true,
                            status: 200,
                            error_code: None,
                            latency_ms,
                            input_tokens: 0,
                            output_tokens: 0,
                            idempotency_key: idempotency_key.map(|k| k.to_string()),
                            trace_id: trace_id.map(|t| t.to_string()),
                            response: stored,
                            cost_override_cents: cost_override,
                        },
                    )
                    .await;
                    release.release().await;
                    let budget = self.settle_budget(rc, pre_status).await;
                    return Ok(ExecOutcome { payload, budget: Some(budget), replayed: false });
                }
            }
        }

        let latency_ms = started.elapsed().as_millis() as i64;
        let (error, status, code) = Self::all_failed(last_err, alias);
        self.persist_outcome(
            rc,
            RequestOutcome {
                alias: alias.to_string(),
                provider: "none".to_string(),
                model: String::new(),
                success: false,
                status,
                error_code: code,
                latency_ms,
                input_tokens: 0,
                output_tokens: 0,
                idempotency_key: None,
                trace_id: trace_id.map(|t| t.to_string()),
                response: None,
                cost_override_cents: None,
            },
        )
        .await;
        release.release().await;
        Err(error)
    }
}
