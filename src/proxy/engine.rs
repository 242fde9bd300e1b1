// Proxy Engine
//
// Composes every manager into the request lifecycle: envelope and schema
// validation, the pre-stage admission chain, the backend forward (the only
// suspending step, issued outside all manager locks), and the post/error
// accounting stages. Credits are deducted exactly once, in the post stage,
// only after a successful forward.

use crate::billing::{
    BatchCreditManager, BillingCycleManager, ConnectionBillingManager, CreditTransferManager,
};
use crate::clock::SharedClock;
use crate::config::ProxyConfig;
use crate::error::GateError;
use crate::experiments::AbTestingManager;
use crate::export::UsageExportEngine;
use crate::gate::{RateLimitSlidingWindow, RequestDeduplicator, RequestValidator, ToolSchemaValidator};
use crate::keys::{
    KeyGroupManager, KeyHierarchyManager, KeyRotationScheduler, KeyScopeManager, KeyStore,
};
use crate::ledger::EventLedger;
use crate::monitoring::{ApiMetricsAggregator, SloMonitor, UsageForecastEngine, UsageQuotaAlert};
use crate::notify::{NotificationManager, WebhookDeliveryLog};
use crate::persist::StateFile;
use crate::pipeline::{MiddlewareOptions, PipelineStage, RequestContext, RequestPipelineManager};
use crate::routing::{BufferState, LoadBalancer, MaintenanceWindowManager, RequestBufferQueue};
use crate::rpc::backend::BackendTransport;
use crate::rpc::{parse_request, RpcId, RpcRequest, RpcResponse};
use crate::session::SessionManager;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Backend name used for the transport configured at startup.
pub const PRIMARY_BACKEND: &str = "primary";

pub struct ProxyEngine {
    pub config: ProxyConfig,
    pub clock: SharedClock,
    pub backend: Arc<dyn BackendTransport>,
    pub ledger: Arc<EventLedger>,
    pub keys: Arc<KeyStore>,
    pub scopes: Arc<KeyScopeManager>,
    pub hierarchy: Arc<KeyHierarchyManager>,
    pub groups: Arc<KeyGroupManager>,
    pub rotation: Arc<KeyRotationScheduler>,
    pub rate_limit: Arc<RateLimitSlidingWindow>,
    pub dedup: Arc<RequestDeduplicator>,
    pub validator: Arc<RequestValidator>,
    pub schemas: Arc<ToolSchemaValidator>,
    pub pipeline: Arc<RequestPipelineManager>,
    pub connection_billing: Arc<ConnectionBillingManager>,
    pub sessions: Arc<SessionManager>,
    pub cycles: Arc<BillingCycleManager>,
    pub transfers: Arc<CreditTransferManager>,
    pub batches: Arc<BatchCreditManager>,
    pub balancer: Arc<LoadBalancer>,
    pub buffer: Arc<RequestBufferQueue>,
    pub maintenance: Arc<MaintenanceWindowManager>,
    pub metrics: Arc<ApiMetricsAggregator>,
    pub slo: Arc<SloMonitor>,
    pub forecast: Arc<UsageForecastEngine>,
    pub quota_alerts: Arc<UsageQuotaAlert>,
    pub notifications: Arc<NotificationManager>,
    pub webhook_log: Arc<WebhookDeliveryLog>,
    pub experiments: Arc<AbTestingManager>,
    pub export: Arc<UsageExportEngine>,
}

impl ProxyEngine {
    pub fn new(
        config: ProxyConfig,
        clock: SharedClock,
        backend: Arc<dyn BackendTransport>,
        persist: Option<Arc<StateFile>>,
    ) -> Arc<Self> {
        let mut keys = KeyStore::new(config.keystore.clone(), clock.clone());
        let mut groups = KeyGroupManager::new(clock.clone());
        if let Some(persist) = &persist {
            keys = keys.with_persistence(persist.clone());
            groups = groups.with_persistence(persist.clone());
            keys.load_records(persist.load_keys());
            groups.load_snapshot(persist.load_groups());
        }
        let keys = Arc::new(keys);
        let groups = Arc::new(groups);

        let metrics = Arc::new(ApiMetricsAggregator::new(config.metrics.clone(), clock.clone()));
        let balancer = Arc::new(LoadBalancer::new(config.balancer.clone()));
        let _ = balancer.add_backend(PRIMARY_BACKEND, 1);

        let engine = Arc::new(Self {
            ledger: Arc::new(EventLedger::new(config.ledger.clone(), clock.clone())),
            scopes: Arc::new(KeyScopeManager::new(config.scopes.clone(), clock.clone())),
            hierarchy: Arc::new(KeyHierarchyManager::new(config.hierarchy.clone(), clock.clone())),
            rotation: Arc::new(KeyRotationScheduler::new(clock.clone())),
            rate_limit: Arc::new(RateLimitSlidingWindow::new(
                config.rate_limit.clone(),
                clock.clone(),
            )),
            dedup: Arc::new(RequestDeduplicator::new(config.dedup.clone(), clock.clone())),
            validator: Arc::new(RequestValidator::new(config.validator.clone())),
            schemas: Arc::new(ToolSchemaValidator::new()),
            pipeline: Arc::new(RequestPipelineManager::new(
                config.pipeline.clone(),
                clock.clone(),
            )),
            connection_billing: Arc::new(ConnectionBillingManager::new(
                config.connection_billing.clone(),
                clock.clone(),
            )),
            sessions: Arc::new(SessionManager::new(config.sessions.clone(), clock.clone())),
            cycles: Arc::new(BillingCycleManager::new(config.cycles.clone(), clock.clone())),
            transfers: Arc::new(CreditTransferManager::new(
                config.transfers.clone(),
                keys.clone(),
                clock.clone(),
            )),
            batches: Arc::new(BatchCreditManager::new(
                config.batches.clone(),
                keys.clone(),
                clock.clone(),
            )),
            buffer: Arc::new(RequestBufferQueue::new(config.buffer.clone(), clock.clone())),
            maintenance: Arc::new(MaintenanceWindowManager::new(clock.clone())),
            slo: Arc::new(SloMonitor::new(config.slo.clone(), clock.clone())),
            forecast: Arc::new(UsageForecastEngine::new(config.forecast.clone(), clock.clone())),
            quota_alerts: Arc::new(UsageQuotaAlert::new(config.quota_alerts.clone(), clock.clone())),
            notifications: Arc::new(NotificationManager::new(
                config.notifications.clone(),
                clock.clone(),
            )),
            webhook_log: Arc::new(WebhookDeliveryLog::new(config.webhooks.clone(), clock.clone())),
            experiments: Arc::new(AbTestingManager::new(clock.clone())),
            export: Arc::new(UsageExportEngine::new(config.export.clone(), metrics.clone())),
            balancer,
            metrics,
            keys,
            groups,
            backend,
            clock,
            config,
        });
        engine.register_builtin_middleware();
        engine
    }

    /// The admission and accounting chain. All built-in middleware run
    /// through the pipeline manager so operators can interleave their own.
    fn register_builtin_middleware(self: &Arc<Self>) {
        let keys = self.keys.clone();
        let groups = self.groups.clone();
        self.pipeline.register(
            PipelineStage::Pre,
            "authenticate",
            MiddlewareOptions { priority: 100, ..Default::default() },
            move |ctx| {
                let record = match keys.get_key(&ctx.api_key) {
                    Some(record) => record,
                    None => {
                        ctx.abort_with(GateError::Unauthorized(
                            "unknown, inactive or expired API key".to_string(),
                        ));
                        return Ok(());
                    }
                };
                if !ctx.tool.is_empty() {
                    if !record.tool_allowed(&ctx.tool) {
                        ctx.abort_with(GateError::PolicyDenied(format!(
                            "tool {} is not in the key's ACL",
                            ctx.tool
                        )));
                        return Ok(());
                    }
                    // A key without its own allow list falls back to its
                    // group's default allow list, when one is set.
                    if record.allowed_tools.is_empty() {
                        if let Some(group) = groups.group_of(&ctx.api_key) {
                            if !group.default_allowed_tools.is_empty()
                                && !group.default_allowed_tools.iter().any(|t| t == &ctx.tool)
                            {
                                ctx.abort_with(GateError::PolicyDenied(format!(
                                    "tool {} is not in the group's ACL",
                                    ctx.tool
                                )));
                            }
                        }
                    }
                }
                Ok(())
            },
        );

        let maintenance = self.maintenance.clone();
        self.pipeline.register(
            PipelineStage::Pre,
            "maintenance",
            MiddlewareOptions { priority: 95, ..Default::default() },
            move |ctx| {
                let status = maintenance.get_status();
                if !status.operational {
                    ctx.abort_with(GateError::Unavailable(
                        status.message.unwrap_or_else(|| "maintenance".to_string()),
                    ));
                }
                Ok(())
            },
        );

        let scopes = self.scopes.clone();
        let groups = self.groups.clone();
        self.pipeline.register(
            PipelineStage::Pre,
            "scopes",
            MiddlewareOptions { priority: 90, ..Default::default() },
            move |ctx| {
                if ctx.tool.is_empty() {
                    return Ok(());
                }
                let access = scopes.check_tool_access(&ctx.api_key, &ctx.tool);
                if access.allowed {
                    return Ok(());
                }
                // Group default scopes can satisfy the requirement for
                // keys that hold none of their own.
                let required = scopes.tool_scopes(&ctx.tool);
                let group_grants = groups
                    .group_of(&ctx.api_key)
                    .map(|g| {
                        g.default_scopes.iter().any(|s| {
                            s == crate::keys::scopes::WILDCARD_SCOPE || required.contains(s)
                        })
                    })
                    .unwrap_or(false);
                if !group_grants {
                    ctx.abort_with(GateError::PolicyDenied(format!(
                        "tool {}: {}",
                        ctx.tool, access.reason
                    )));
                }
                Ok(())
            },
        );

        let rate_limit = self.rate_limit.clone();
        let groups = self.groups.clone();
        let default_limit = self.config.rate_limit.limit;
        self.pipeline.register(
            PipelineStage::Pre,
            "rate-limit",
            MiddlewareOptions { priority: 85, ..Default::default() },
            move |ctx| {
                let limit = groups
                    .group_of(&ctx.api_key)
                    .and_then(|g| g.default_rate_limit)
                    .unwrap_or(default_limit);
                let decision = rate_limit.check_with_limit(&ctx.api_key, limit);
                if !decision.allowed {
                    ctx.metadata
                        .insert("retry_after_ms".to_string(), json!(decision.retry_after_ms));
                    ctx.abort_with(GateError::RateLimited(format!(
                        "retry in {}ms",
                        decision.retry_after_ms
                    )));
                }
                Ok(())
            },
        );

        let keys = self.keys.clone();
        self.pipeline.register(
            PipelineStage::Pre,
            "quota",
            MiddlewareOptions { priority: 80, ..Default::default() },
            move |ctx| {
                if let Err(e) = keys.check_quota(&ctx.api_key, ctx.credits_cost) {
                    ctx.abort_with(e);
                }
                Ok(())
            },
        );

        let keys = self.keys.clone();
        self.pipeline.register(
            PipelineStage::Pre,
            "credits",
            MiddlewareOptions { priority: 75, ..Default::default() },
            move |ctx| {
                if ctx.credits_cost == 0 {
                    return Ok(());
                }
                if let Some(record) = keys.get_key(&ctx.api_key) {
                    if record.credits < ctx.credits_cost && !record.overdraft_enabled {
                        ctx.abort_with(GateError::InsufficientCredits(format!(
                            "balance {} < cost {}",
                            record.credits, ctx.credits_cost
                        )));
                    } else if let Some(limit) = record.spending_limit {
                        if record.total_spent + ctx.credits_cost > limit {
                            ctx.abort_with(GateError::PolicyDenied(format!(
                                "spending limit {} reached",
                                limit
                            )));
                        }
                    }
                }
                Ok(())
            },
        );

        let hierarchy = self.hierarchy.clone();
        let keys = self.keys.clone();
        self.pipeline.register(
            PipelineStage::Pre,
            "hierarchy",
            MiddlewareOptions { priority: 70, ..Default::default() },
            move |ctx| {
                let result = hierarchy.check_credit(&ctx.api_key, ctx.credits_cost, |parent| {
                    keys.balance(parent)
                });
                if let Err(e) = result {
                    ctx.abort_with(e);
                }
                Ok(())
            },
        );

        let dedup = self.dedup.clone();
        self.pipeline.register(
            PipelineStage::Pre,
            "dedup",
            MiddlewareOptions { priority: 65, ..Default::default() },
            move |ctx| {
                if ctx.tool.is_empty() {
                    return Ok(());
                }
                let fingerprint = dedup.fingerprint(&json!({
                    "method": &ctx.method,
                    "params": &ctx.params,
                    "key": &ctx.api_key,
                }));
                if dedup.is_duplicate(&fingerprint) {
                    let record = dedup.record(&fingerprint, &ctx.api_key);
                    ctx.metadata
                        .insert("duplicate_count".to_string(), json!(record.count));
                    ctx.abort_with(GateError::PolicyDenied(
                        "duplicate request inside the dedup window".to_string(),
                    ));
                } else {
                    dedup.record(&fingerprint, &ctx.api_key);
                }
                Ok(())
            },
        );

        let sessions = self.sessions.clone();
        self.pipeline.register(
            PipelineStage::Pre,
            "session",
            MiddlewareOptions { priority: 60, ..Default::default() },
            move |ctx| {
                let session_id = match ctx.params.get("session_id").and_then(|s| s.as_str()) {
                    Some(id) => id.to_string(),
                    None => return Ok(()),
                };
                match sessions.get_session(&session_id) {
                    Some(session)
                        if session.api_key == ctx.api_key
                            && session.status == crate::session::SessionStatus::Active =>
                    {
                        ctx.metadata.insert("session_id".to_string(), json!(session_id));
                    }
                    Some(_) => {
                        ctx.abort_with(GateError::InvalidState(
                            "session is not active".to_string(),
                        ));
                    }
                    None => {
                        ctx.abort_with(GateError::UnknownTask(format!("session {}", session_id)));
                    }
                }
                Ok(())
            },
        );

        // Post stage: accounting, conditioned on a successful forward.
        let keys = self.keys.clone();
        let hierarchy = self.hierarchy.clone();
        let sessions = self.sessions.clone();
        self.pipeline.register(
            PipelineStage::Post,
            "deduct-credits",
            MiddlewareOptions { priority: 100, ..Default::default() },
            move |ctx| {
                if ctx.credits_cost > 0 {
                    if !keys.deduct_credits(&ctx.api_key, ctx.credits_cost) {
                        // The balance moved between admission and now.
                        warn!(key = %ctx.api_key, cost = ctx.credits_cost, "post-forward deduction failed");
                        ctx.metadata.insert("deducted".to_string(), json!(false));
                        return Ok(());
                    }
                    hierarchy.record_usage(&ctx.api_key, ctx.credits_cost);
                }
                ctx.metadata.insert("deducted".to_string(), json!(ctx.credits_cost > 0));
                if let Some(session_id) = ctx
                    .metadata
                    .get("session_id")
                    .and_then(|s| s.as_str())
                    .map(|s| s.to_string())
                {
                    let _ = sessions.record_call(&session_id, &ctx.tool, ctx.credits_cost, None);
                }
                Ok(())
            },
        );

        let ledger = self.ledger.clone();
        self.pipeline.register(
            PipelineStage::Post,
            "ledger",
            MiddlewareOptions { priority: 95, ..Default::default() },
            move |ctx| {
                let _ = ledger.append(
                    "tool.allowed",
                    &ctx.api_key,
                    json!({
                        "tool": &ctx.tool,
                        "credits": ctx.credits_cost,
                        "request_id": &ctx.request_id,
                    }),
                    None,
                );
                Ok(())
            },
        );

        let metrics = self.metrics.clone();
        let slo = self.slo.clone();
        let cycles = self.cycles.clone();
        let forecast = self.forecast.clone();
        let quota_alerts = self.quota_alerts.clone();
        let clock = self.clock.clone();
        self.pipeline.register(
            PipelineStage::Post,
            "record-usage",
            MiddlewareOptions { priority: 90, ..Default::default() },
            move |ctx| {
                let latency = clock.now_ms().saturating_sub(ctx.started_at);
                metrics.record(&ctx.method, &ctx.tool, &ctx.api_key, latency, 200, ctx.credits_cost);
                slo.record_event(&ctx.tool, Some(&ctx.api_key), latency, true);
                if ctx.credits_cost > 0 {
                    cycles.record_usage(&ctx.api_key, &ctx.tool, ctx.credits_cost);
                    forecast.record(&ctx.api_key, ctx.credits_cost);
                    quota_alerts.record_usage(&ctx.api_key, ctx.credits_cost);
                }
                Ok(())
            },
        );

        let notifications = self.notifications.clone();
        let keys = self.keys.clone();
        let low_balance = self.config.low_balance_threshold;
        self.pipeline.register(
            PipelineStage::Post,
            "notify",
            MiddlewareOptions { priority: 85, ..Default::default() },
            move |ctx| {
                notifications.dispatch(
                    "tool.completed",
                    &json!({"key": &ctx.api_key, "tool": &ctx.tool, "credits": ctx.credits_cost}),
                );
                if let Some(balance) = keys.balance(&ctx.api_key) {
                    if balance < low_balance {
                        notifications.dispatch(
                            "credits.low",
                            &json!({"key": &ctx.api_key, "balance": balance}),
                        );
                    }
                }
                Ok(())
            },
        );

        // Error stage: the forward failed, nothing is billed.
        let metrics = self.metrics.clone();
        let slo = self.slo.clone();
        let ledger = self.ledger.clone();
        let notifications = self.notifications.clone();
        let clock = self.clock.clone();
        self.pipeline.register(
            PipelineStage::Error,
            "record-failure",
            MiddlewareOptions { priority: 100, ..Default::default() },
            move |ctx| {
                let latency = clock.now_ms().saturating_sub(ctx.started_at);
                let status = ctx
                    .metadata
                    .get("upstream_status")
                    .and_then(|s| s.as_u64())
                    .unwrap_or(502) as u16;
                metrics.record(&ctx.method, &ctx.tool, &ctx.api_key, latency, status, 0);
                slo.record_event(&ctx.tool, Some(&ctx.api_key), latency, false);
                let _ = ledger.append(
                    "tool.failed",
                    &ctx.api_key,
                    json!({
                        "tool": &ctx.tool,
                        "error": &ctx.forward_error,
                        "request_id": &ctx.request_id,
                    }),
                    None,
                );
                notifications.dispatch(
                    "tool.failed",
                    &json!({"key": &ctx.api_key, "tool": &ctx.tool, "error": &ctx.forward_error}),
                );
                Ok(())
            },
        );
    }

    /// Entry point for one metered JSON-RPC body.
    pub async fn handle_rpc(&self, api_key: &str, body: &Value) -> RpcResponse {
        let fallback_id = body.get("id").and_then(value_to_id);

        let request = match parse_request(body) {
            Ok(request) => request,
            Err(e) => return RpcResponse::from_error(fallback_id, &e),
        };

        let outcome = self.validator.validate(body);
        if !outcome.valid {
            return RpcResponse::failure(
                request.id.clone(),
                GateError::Validation(String::new()).json_rpc_code(),
                "request failed validation",
                Some(json!({ "errors": outcome.errors })),
            );
        }

        match request.method.as_str() {
            "tools/call" => self.handle_tool_call(api_key, body, request).await,
            "tools/list" => self.handle_passthrough(api_key, request).await,
            "session/create" => self.handle_session_create(api_key, request),
            "session/status" => self.handle_session_status(api_key, request),
            "session/end" => self.handle_session_end(api_key, request),
            other => RpcResponse::from_error(
                request.id.clone(),
                &GateError::MethodNotFound(other.to_string()),
            ),
        }
    }

    async fn handle_tool_call(
        &self,
        api_key: &str,
        body: &Value,
        request: RpcRequest,
    ) -> RpcResponse {
        let tool = match request.tool_name() {
            Some(tool) => tool.to_string(),
            None => {
                return RpcResponse::from_error(
                    request.id.clone(),
                    &GateError::Validation("params.name is required".to_string()),
                )
            }
        };

        let schema_errors = self.schemas.validate(&tool, &request.tool_arguments());
        if !schema_errors.is_empty() {
            return RpcResponse::failure(
                request.id.clone(),
                GateError::Validation(String::new()).json_rpc_code(),
                "tool arguments failed schema validation",
                Some(json!({ "errors": schema_errors })),
            );
        }

        let cost = self.config.tool_cost(&tool);
        self.run_metered(api_key, body, request, &tool, cost).await
    }

    async fn handle_passthrough(&self, api_key: &str, request: RpcRequest) -> RpcResponse {
        let body = serde_json::to_value(&request).unwrap_or(Value::Null);
        self.run_metered(api_key, &body, request, "", 0).await
    }

    async fn run_metered(
        &self,
        api_key: &str,
        body: &Value,
        request: RpcRequest,
        tool: &str,
        cost: u64,
    ) -> RpcResponse {
        let request_id = Uuid::new_v4().to_string();
        let mut ctx = RequestContext::new(
            &request_id,
            api_key,
            tool,
            &request.method,
            request.params.clone().unwrap_or(Value::Null),
            self.clock.now_ms(),
        );
        ctx.credits_cost = cost;

        self.pipeline.execute_stage(PipelineStage::Pre, &mut ctx);
        if ctx.aborted {
            return self.respond_aborted(&ctx, body, &request);
        }

        let pick = match self.balancer.pick() {
            Ok(pick) => pick,
            Err(e) => {
                ctx.forward_error = Some(e.to_string());
                self.pipeline.execute_stage(PipelineStage::Error, &mut ctx);
                return RpcResponse::from_error(request.id.clone(), &e);
            }
        };
        debug!(request = %request_id, backend = %pick.name, reason = %pick.reason, "forwarding");

        // The forward is the only suspension point and holds no locks.
        let started = self.clock.now_ms();
        self.balancer.record_connect(&pick.name);
        let forwarded = self
            .backend
            .forward(request.clone(), self.config.backend_timeout_ms)
            .await;
        self.balancer.record_disconnect(&pick.name);
        let latency = self.clock.now_ms().saturating_sub(started);

        match forwarded {
            Ok(result) => {
                self.balancer.record_request(&pick.name, 200, latency);
                ctx.response = Some(result.clone());
                self.pipeline.execute_stage(PipelineStage::Post, &mut ctx);
                RpcResponse::success(request.id.clone(), result)
            }
            Err(e) => {
                let status = match &e {
                    GateError::Timeout(_) => 504u16,
                    _ => 502,
                };
                self.balancer.record_request(&pick.name, status, latency);
                ctx.metadata
                    .insert("upstream_status".to_string(), json!(status));
                ctx.forward_error = Some(e.to_string());
                self.pipeline.execute_stage(PipelineStage::Error, &mut ctx);
                RpcResponse::from_error(request.id.clone(), &e)
            }
        }
    }

    fn respond_aborted(&self, ctx: &RequestContext, body: &Value, request: &RpcRequest) -> RpcResponse {
        let error = ctx
            .abort_error
            .clone()
            .unwrap_or_else(|| {
                GateError::PolicyDenied(
                    ctx.abort_reason.clone().unwrap_or_else(|| "aborted".to_string()),
                )
            });

        let _ = self.ledger.append(
            "tool.denied",
            &ctx.api_key,
            json!({
                "tool": &ctx.tool,
                "reason": error.to_string(),
                "request_id": &ctx.request_id,
            }),
            None,
        );
        let latency = self.clock.now_ms().saturating_sub(ctx.started_at);
        self.metrics.record(
            &ctx.method,
            &ctx.tool,
            &ctx.api_key,
            latency,
            error.http_status(),
            0,
        );

        // During a blocking window with buffering enabled, park the request
        // for the recovery drain instead of dropping it outright.
        let mut data = json!({});
        if matches!(error, GateError::Unavailable(_))
            && self.buffer.state() == BufferState::Buffering
        {
            let parked = self.buffer.enqueue(
                json!({"api_key": &ctx.api_key, "body": body}),
                0,
                None,
            );
            if let Ok(parked) = parked {
                data = json!({"buffered": true, "buffer_id": parked.id});
            }
        }
        if let Some(retry) = ctx.metadata.get("retry_after_ms") {
            data["retry_after_ms"] = retry.clone();
        }

        let data = if data.as_object().map(|o| o.is_empty()).unwrap_or(true) {
            None
        } else {
            Some(data)
        };
        RpcResponse::failure(
            request.id.clone(),
            error.json_rpc_code(),
            &error.to_string(),
            data,
        )
    }

    fn handle_session_create(&self, api_key: &str, request: RpcRequest) -> RpcResponse {
        if self.keys.get_key(api_key).is_none() {
            return RpcResponse::from_error(
                request.id.clone(),
                &GateError::Unauthorized("unknown, inactive or expired API key".to_string()),
            );
        }
        let ttl_ms = request
            .params
            .as_ref()
            .and_then(|p| p.get("ttl_ms"))
            .and_then(|t| t.as_u64());
        match self.sessions.create_session(api_key, ttl_ms) {
            Ok(session) => RpcResponse::success(
                request.id.clone(),
                json!({"session_id": session.id, "expires_at": session.expires_at}),
            ),
            Err(e) => RpcResponse::from_error(request.id.clone(), &e),
        }
    }

    fn handle_session_status(&self, api_key: &str, request: RpcRequest) -> RpcResponse {
        let session_id = match request
            .params
            .as_ref()
            .and_then(|p| p.get("session_id"))
            .and_then(|s| s.as_str())
        {
            Some(id) => id,
            None => {
                return RpcResponse::from_error(
                    request.id.clone(),
                    &GateError::Validation("params.session_id is required".to_string()),
                )
            }
        };
        match self.sessions.get_session(session_id) {
            Some(session) if session.api_key == api_key => RpcResponse::success(
                request.id.clone(),
                serde_json::to_value(&session).unwrap_or(Value::Null),
            ),
            _ => RpcResponse::from_error(
                request.id.clone(),
                &GateError::UnknownTask(format!("session {}", session_id)),
            ),
        }
    }

    fn handle_session_end(&self, api_key: &str, request: RpcRequest) -> RpcResponse {
        let session_id = match request
            .params
            .as_ref()
            .and_then(|p| p.get("session_id"))
            .and_then(|s| s.as_str())
        {
            Some(id) => id,
            None => {
                return RpcResponse::from_error(
                    request.id.clone(),
                    &GateError::Validation("params.session_id is required".to_string()),
                )
            }
        };
        match self.sessions.get_session(session_id) {
            Some(session) if session.api_key == api_key => {}
            _ => {
                return RpcResponse::from_error(
                    request.id.clone(),
                    &GateError::UnknownTask(format!("session {}", session_id)),
                )
            }
        }
        match self.sessions.end_session(session_id) {
            Ok(session) => RpcResponse::success(
                request.id.clone(),
                json!({
                    "session_id": session.id,
                    "total_calls": session.total_calls,
                    "total_credits": session.total_credits,
                }),
            ),
            Err(e) => RpcResponse::from_error(request.id.clone(), &e),
        }
    }

    /// Connection-billing tick: bill every active session and charge the
    /// owed credits through the key store.
    pub fn billing_tick(&self) -> usize {
        let keys = self.keys.clone();
        let available = move |key: &str| keys.balance(key).unwrap_or(0);
        let results = self.connection_billing.bill_all(Some(&available));

        let mut charged_sessions = 0;
        for result in &results {
            if result.credits_charged > 0 {
                let session = self.connection_billing.get_session(&result.session_id);
                if let Some(session) = session {
                    match self
                        .keys
                        .charge_credits(&session.api_key, result.credits_charged, false)
                    {
                        Ok(_) => {
                            charged_sessions += 1;
                            self.cycles.record_usage(
                                &session.api_key,
                                "connection",
                                result.credits_charged,
                            );
                            self.forecast.record(&session.api_key, result.credits_charged);
                        }
                        Err(e) => {
                            warn!(session = %result.session_id, error = %e, "connection charge failed");
                        }
                    }
                }
            }
            if result.should_terminate {
                info!(
                    session = %result.session_id,
                    reason = result.terminate_reason.as_deref().unwrap_or(""),
                    "connection session flagged for termination"
                );
            }
        }
        charged_sessions
    }

    /// Replay requests parked during maintenance. Returns one response per
    /// drained request.
    pub async fn drain_buffer(&self) -> Vec<(String, RpcResponse)> {
        let drained = self.buffer.drain();
        let mut responses = Vec::with_capacity(drained.len());
        for parked in drained {
            let api_key = parked.payload["api_key"].as_str().unwrap_or("").to_string();
            let body = parked.payload["body"].clone();
            let response = self.handle_rpc(&api_key, &body).await;
            responses.push((parked.id, response));
        }
        responses
    }
}

fn value_to_id(value: &Value) -> Option<RpcId> {
    match value {
        Value::String(s) => Some(RpcId::String(s.clone())),
        Value::Number(n) => n.as_i64().map(RpcId::Number),
        Value::Null => Some(RpcId::Null),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::rpc_code;
    use crate::keys::CreateKeyOptions;
    use crate::ledger::EventQuery;
    use crate::rpc::backend::FnBackend;

    fn engine_with(config: ProxyConfig) -> (Arc<ProxyEngine>, Arc<ManualClock>) {
        let clock = ManualClock::shared(1_700_000_000_000);
        let backend = Arc::new(FnBackend::new(|request: &RpcRequest| {
            if request.tool_name() == Some("broken") {
                Err(GateError::Upstream("tool exploded".to_string()))
            } else {
                Ok(json!({"ok": true, "method": request.method}))
            }
        }));
        let engine = ProxyEngine::new(config, clock.clone(), backend, None);
        (engine, clock)
    }

    fn engine() -> (Arc<ProxyEngine>, Arc<ManualClock>) {
        engine_with(ProxyConfig::default())
    }

    fn call_body(tool: &str, id: i64) -> Value {
        json!({
            "jsonrpc": "2.0",
            "method": "tools/call",
            "params": {"name": tool, "arguments": {}},
            "id": id
        })
    }

    #[tokio::test]
    async fn test_deduct_gating_scenario() {
        // A successful 1-credit call leaves 9 credits and one ledger event.
        let (engine, _) = engine();
        let key = engine.keys.create_key("k", 10, CreateKeyOptions::default()).key;

        let response = engine.handle_rpc(&key, &call_body("search", 1)).await;
        assert!(response.is_success(), "{:?}", response.error);
        assert_eq!(engine.keys.get_key(&key).unwrap().credits, 9);

        let events = engine.ledger.query(&EventQuery {
            aggregate_id: Some(key.clone()),
            event_type: Some("tool.allowed".to_string()),
            ..Default::default()
        });
        assert_eq!(events.total, 1);
        assert_eq!(events.events[0].version, 1);
    }

    #[tokio::test]
    async fn test_insufficient_credits_scenario() {
        // A zero-balance key gets -32402, no backend call, no deduction.
        let (engine, _) = engine();
        let key = engine.keys.create_key("k", 0, CreateKeyOptions::default()).key;

        let response = engine.handle_rpc(&key, &call_body("search", 1)).await;
        let error = response.error.unwrap();
        assert_eq!(error.code, rpc_code::INSUFFICIENT_CREDITS);
        assert_eq!(engine.keys.get_key(&key).unwrap().credits, 0);
        // No successful forward was recorded.
        assert_eq!(
            engine
                .ledger
                .query(&EventQuery {
                    event_type: Some("tool.allowed".to_string()),
                    ..Default::default()
                })
                .total,
            0
        );
    }

    #[tokio::test]
    async fn test_unknown_key_unauthorized() {
        let (engine, _) = engine();
        let response = engine.handle_rpc("tg_bogus", &call_body("search", 1)).await;
        assert_eq!(response.error.unwrap().code, rpc_code::SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_invalid_envelope() {
        let (engine, _) = engine();
        let response = engine.handle_rpc("tg_x", &json!({"method": "m"})).await;
        assert_eq!(response.error.unwrap().code, rpc_code::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let (engine, _) = engine();
        let key = engine.keys.create_key("k", 10, CreateKeyOptions::default()).key;
        let body = json!({"jsonrpc": "2.0", "method": "admin/secret", "id": 1});
        let response = engine.handle_rpc(&key, &body).await;
        assert_eq!(response.error.unwrap().code, rpc_code::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_schema_rejection() {
        let (engine, _) = engine();
        let key = engine.keys.create_key("k", 10, CreateKeyOptions::default()).key;
        engine.schemas.register_schema(
            "search",
            json!({"type": "object", "required": ["query"]}),
        );

        let response = engine.handle_rpc(&key, &call_body("search", 1)).await;
        let error = response.error.unwrap();
        assert_eq!(error.code, rpc_code::INVALID_PARAMS);
        // Nothing was deducted for the rejected call.
        assert_eq!(engine.keys.get_key(&key).unwrap().credits, 10);
    }

    #[tokio::test]
    async fn test_forward_failure_runs_error_stage_without_deduction() {
        let (engine, _) = engine();
        let key = engine.keys.create_key("k", 10, CreateKeyOptions::default()).key;

        let response = engine.handle_rpc(&key, &call_body("broken", 1)).await;
        assert_eq!(response.error.unwrap().code, rpc_code::INTERNAL_ERROR);
        assert_eq!(engine.keys.get_key(&key).unwrap().credits, 10);

        let failed = engine.ledger.query(&EventQuery {
            event_type: Some("tool.failed".to_string()),
            ..Default::default()
        });
        assert_eq!(failed.total, 1);
    }

    #[tokio::test]
    async fn test_maintenance_blocks_and_recovers() {
        let (engine, clock) = engine();
        let key = engine.keys.create_key("k", 10, CreateKeyOptions::default()).key;
        engine.maintenance.start_now("upgrade", 60_000, true).unwrap();

        let response = engine.handle_rpc(&key, &call_body("search", 1)).await;
        assert_eq!(response.error.as_ref().unwrap().code, rpc_code::SERVER_ERROR);
        assert!(response.error.unwrap().message.contains("upgrade"));

        // The window expires on its own; traffic flows again.
        clock.advance(60_000);
        let response = engine.handle_rpc(&key, &call_body("search", 2)).await;
        assert!(response.is_success());
    }

    #[tokio::test]
    async fn test_maintenance_buffering_and_drain() {
        let (engine, clock) = engine();
        let key = engine.keys.create_key("k", 10, CreateKeyOptions::default()).key;
        engine.maintenance.start_now("upgrade", 60_000, true).unwrap();
        engine.buffer.start_buffering().unwrap();

        let response = engine.handle_rpc(&key, &call_body("search", 7)).await;
        let error = response.error.unwrap();
        assert_eq!(error.data.as_ref().unwrap()["buffered"], true);
        assert_eq!(engine.buffer.len(), 1);

        clock.advance(60_000);
        let results = engine.drain_buffer().await;
        assert_eq!(results.len(), 1);
        assert!(results[0].1.is_success());
        assert_eq!(engine.keys.get_key(&key).unwrap().credits, 9);
    }

    #[tokio::test]
    async fn test_rate_limit_aborts_with_retry_hint() {
        let mut config = ProxyConfig::default();
        config.rate_limit.limit = 2;
        config.rate_limit.window_ms = 1_000;
        config.dedup.ttl_ms = 0; // identical calls in this test are intended
        let (engine, _) = engine_with(config);
        let key = engine.keys.create_key("k", 100, CreateKeyOptions::default()).key;

        assert!(engine.handle_rpc(&key, &call_body("search", 1)).await.is_success());
        assert!(engine.handle_rpc(&key, &call_body("search", 2)).await.is_success());
        let response = engine.handle_rpc(&key, &call_body("search", 3)).await;
        let error = response.error.unwrap();
        assert_eq!(error.code, rpc_code::SERVER_ERROR);
        assert!(error.data.unwrap()["retry_after_ms"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_dedup_blocks_identical_request() {
        let (engine, _) = engine();
        let key = engine.keys.create_key("k", 100, CreateKeyOptions::default()).key;
        let body = json!({
            "jsonrpc": "2.0",
            "method": "tools/call",
            "params": {"name": "search", "arguments": {"q": "same"}},
            "id": 1
        });

        assert!(engine.handle_rpc(&key, &body).await.is_success());
        let repeat = engine.handle_rpc(&key, &body).await;
        assert!(repeat.error.unwrap().message.contains("duplicate"));
        // Only the first call was billed.
        assert_eq!(engine.keys.get_key(&key).unwrap().credits, 99);
    }

    #[tokio::test]
    async fn test_scope_gate() {
        let (engine, _) = engine();
        let key = engine.keys.create_key("k", 10, CreateKeyOptions::default()).key;
        engine.scopes.set_tool_scopes("search", vec!["read".to_string()]);

        let response = engine.handle_rpc(&key, &call_body("search", 1)).await;
        assert_eq!(response.error.unwrap().code, rpc_code::SERVER_ERROR);

        engine.scopes.grant(&key, "read");
        let response = engine.handle_rpc(&key, &call_body("search", 2)).await;
        assert!(response.is_success());
    }

    #[tokio::test]
    async fn test_acl_denied_tool() {
        let (engine, _) = engine();
        let key = engine
            .keys
            .create_key(
                "k",
                10,
                CreateKeyOptions {
                    denied_tools: vec!["search".to_string()],
                    ..Default::default()
                },
            )
            .key;
        let response = engine.handle_rpc(&key, &call_body("search", 1)).await;
        assert!(response.error.unwrap().message.contains("ACL"));
    }

    #[tokio::test]
    async fn test_session_lifecycle_over_rpc() {
        let (engine, _) = engine();
        let key = engine.keys.create_key("k", 10, CreateKeyOptions::default()).key;

        let created = engine
            .handle_rpc(
                &key,
                &json!({"jsonrpc": "2.0", "method": "session/create", "id": 1}),
            )
            .await;
        let session_id = created.result.unwrap()["session_id"].as_str().unwrap().to_string();

        // A call bound to the session is recorded against it.
        let body = json!({
            "jsonrpc": "2.0",
            "method": "tools/call",
            "params": {"name": "search", "arguments": {}, "session_id": session_id},
            "id": 2
        });
        assert!(engine.handle_rpc(&key, &body).await.is_success());

        let ended = engine
            .handle_rpc(
                &key,
                &json!({"jsonrpc": "2.0", "method": "session/end", "params": {"session_id": session_id}, "id": 3}),
            )
            .await;
        let result = ended.result.unwrap();
        assert_eq!(result["total_calls"], 1);
        assert_eq!(result["total_credits"], 1);

        // Ending twice maps to the not-cancellable code.
        let again = engine
            .handle_rpc(
                &key,
                &json!({"jsonrpc": "2.0", "method": "session/end", "params": {"session_id": session_id}, "id": 4}),
            )
            .await;
        assert_eq!(again.error.unwrap().code, rpc_code::TASK_NOT_CANCELLABLE);

        // Unknown sessions map to the unknown-task code.
        let missing = engine
            .handle_rpc(
                &key,
                &json!({"jsonrpc": "2.0", "method": "session/end", "params": {"session_id": "nope"}, "id": 5}),
            )
            .await;
        assert_eq!(missing.error.unwrap().code, rpc_code::UNKNOWN_TASK);
    }

    #[tokio::test]
    async fn test_billing_tick_charges_connection_sessions() {
        let (engine, clock) = engine();
        let key = engine.keys.create_key("k", 100, CreateKeyOptions::default()).key;
        engine.connection_billing.start_session("c1", &key, "sse");

        // Past grace plus two intervals.
        clock.advance(185_000);
        engine.connection_billing.touch("c1");
        let charged = engine.billing_tick();
        assert_eq!(charged, 1);
        assert_eq!(engine.keys.get_key(&key).unwrap().credits, 98);
        // Interval charges do not inflate call counts.
        assert_eq!(engine.keys.get_key(&key).unwrap().total_calls, 0);
    }

    #[tokio::test]
    async fn test_usage_flows_into_monitoring() {
        let (engine, _) = engine();
        let key = engine.keys.create_key("k", 100, CreateKeyOptions::default()).key;
        engine.cycles.subscribe(&key, crate::billing::BillingFrequency::Daily).unwrap();

        for i in 0..3 {
            let body = json!({
                "jsonrpc": "2.0",
                "method": "tools/call",
                "params": {"name": "search", "arguments": {"i": i}},
                "id": i
            });
            assert!(engine.handle_rpc(&key, &body).await.is_success());
        }

        let summary = engine.metrics.summary(&Default::default());
        assert_eq!(summary.total_calls, 3);
        assert_eq!(summary.total_credits, 3);

        let invoice = engine.cycles.generate_invoice(&key).unwrap();
        assert_eq!(invoice.total_calls, 3);
        assert!(engine.forecast.forecast(&key, Some(97)).is_some());
    }
}
