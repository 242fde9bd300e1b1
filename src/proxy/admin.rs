// Admin Surface
//
// REST subset for operating the proxy: keys and balances, transfers and
// batches, groups, scopes, hierarchy, rotation, maintenance and buffering,
// SLOs and alerts, metrics and exports, billing cycles and invoices,
// experiments, webhooks and backends. Every route sits behind the admin
// key header; HTTP statuses mirror the error classes.

use crate::billing::{BatchOp, BillingFrequency};
use crate::error::GateError;
use crate::export::ExportFormat;
use crate::experiments::Variant;
use crate::keys::CreateKeyOptions;
use crate::ledger::EventQuery;
use crate::monitoring::{MetricsFilter, SloType};
use crate::proxy::server::{AppState, ADMIN_KEY_HEADER};
use axum::extract::{Path, Query, State};
use axum::middleware::{self, Next};
use http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;

type AdminResult = std::result::Result<Json<Value>, (StatusCode, Json<Value>)>;

fn fail(e: GateError) -> (StatusCode, Json<Value>) {
    (
        StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        Json(json!({"error": e.to_string(), "code": e.json_rpc_code()})),
    )
}

fn ok<T: serde::Serialize>(value: T) -> AdminResult {
    Ok(Json(serde_json::to_value(value).unwrap_or(Value::Null)))
}

async fn require_admin(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    let presented = headers
        .get(ADMIN_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if presented.is_empty() || presented != state.admin_key.as_str() {
        return fail(GateError::Unauthorized("admin key required".to_string())).into_response();
    }
    next.run(request).await
}

pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        // keys
        .route("/keys", post(create_key).get(list_keys))
        .route("/keys/{key}", get(get_key).delete(delete_key))
        .route("/keys/{key}/revoke", post(revoke_key))
        .route("/keys/{key}/credits", post(add_credits))
        .route("/keys/{key}/quota", post(set_quota))
        .route("/keys/{key}/acl", post(set_acl))
        .route("/keys/{key}/expiry", post(set_expiry))
        // transfers and batches
        .route("/transfers", post(create_transfer).get(list_transfers))
        .route("/transfers/{id}/reverse", post(reverse_transfer))
        .route("/batches", post(execute_batch).get(batch_history))
        // groups
        .route("/groups", post(create_group).get(list_groups))
        .route("/groups/{id}", delete(delete_group))
        .route("/groups/{id}/assign", post(assign_group))
        // scopes
        .route("/scopes", post(define_scope).get(list_scopes))
        .route("/scopes/grant", post(grant_scope))
        .route("/scopes/revoke", post(revoke_scope))
        .route("/scopes/tools", post(set_tool_scopes))
        // hierarchy
        .route("/hierarchy", post(create_relation))
        .route("/hierarchy/{child}", delete(remove_relation).get(get_relation))
        // rotation
        .route("/rotation/policies", post(create_rotation_policy))
        .route("/rotation/attach", post(attach_rotation))
        .route("/rotation/rotate", post(rotate_key))
        .route("/rotation/schedules", get(list_rotation_schedules))
        // maintenance and buffering
        .route("/maintenance", post(schedule_maintenance).get(list_maintenance))
        .route("/maintenance/{id}/cancel", post(cancel_maintenance))
        .route("/maintenance/{id}/complete", post(complete_maintenance))
        .route("/status", get(proxy_status))
        .route("/buffer/start", post(buffer_start))
        .route("/buffer/drain", post(buffer_drain))
        // monitoring
        .route("/slos", post(define_slo).get(list_slos))
        .route("/slos/{id}/status", get(slo_status))
        .route("/alerts", get(list_alerts))
        .route("/metrics", get(metrics_summary))
        .route("/export", get(export_usage))
        .route("/forecast/{key}", get(forecast_key))
        .route("/ledger", get(query_ledger))
        // billing cycles
        .route("/subscriptions", post(create_subscription))
        .route("/invoices", get(list_invoices))
        .route("/invoices/{id}/generate", post(generate_invoice))
        .route("/invoices/{id}/finalize", post(finalize_invoice))
        .route("/invoices/{id}/pay", post(pay_invoice))
        .route("/invoices/{id}/void", post(void_invoice))
        // sessions
        .route("/sessions", get(list_sessions))
        .route("/connections", get(list_connections))
        // experiments
        .route("/experiments", post(create_experiment).get(list_experiments))
        .route("/experiments/{name}/start", post(start_experiment))
        .route("/experiments/{name}/pause", post(pause_experiment))
        .route("/experiments/{name}/complete", post(complete_experiment))
        .route("/experiments/{name}/assign", post(assign_experiment))
        .route("/experiments/{name}/results", get(experiment_results))
        // notifications
        .route("/notifications/channels", post(add_channel).get(list_channels))
        .route("/notifications/rules", post(add_rule).get(list_rules))
        .route("/notifications/history", get(notification_history))
        // webhooks
        .route("/webhooks", post(add_webhook).get(list_webhooks))
        .route("/webhooks/{id}/deliveries", get(webhook_deliveries))
        .route("/webhooks/{id}/test", post(test_webhook))
        // backends and schemas
        .route("/backends", post(add_backend).get(list_backends))
        .route("/backends/{name}/health", post(set_backend_health))
        .route("/schemas", post(register_schema))
        .route("/config", get(effective_config))
        .layer(middleware::from_fn_with_state(state, require_admin))
}

// ---- keys ----

#[derive(Deserialize)]
struct CreateKeyBody {
    name: String,
    #[serde(default)]
    credits: i64,
    #[serde(default)]
    expires_at: Option<u64>,
    #[serde(default)]
    spending_limit: Option<u64>,
    #[serde(default)]
    allowed_tools: Vec<String>,
    #[serde(default)]
    denied_tools: Vec<String>,
    #[serde(default)]
    overdraft_enabled: bool,
}

async fn create_key(State(state): State<AppState>, Json(body): Json<CreateKeyBody>) -> AdminResult {
    let record = state.engine.keys.create_key(
        &body.name,
        body.credits,
        CreateKeyOptions {
            expires_at: body.expires_at,
            spending_limit: body.spending_limit,
            allowed_tools: body.allowed_tools,
            denied_tools: body.denied_tools,
            overdraft_enabled: body.overdraft_enabled,
            metadata: HashMap::new(),
        },
    );
    ok(record)
}

async fn list_keys(State(state): State<AppState>) -> AdminResult {
    ok(state.engine.keys.list_keys())
}

async fn get_key(State(state): State<AppState>, Path(key): Path<String>) -> AdminResult {
    match state.engine.keys.get_key_raw(&key) {
        Some(record) => ok(record),
        None => Err(fail(GateError::NotFound("key".to_string()))),
    }
}

async fn delete_key(State(state): State<AppState>, Path(key): Path<String>) -> AdminResult {
    state.engine.keys.delete_key(&key).map_err(fail)?;
    ok(json!({"deleted": true}))
}

async fn revoke_key(State(state): State<AppState>, Path(key): Path<String>) -> AdminResult {
    state.engine.keys.revoke_key(&key).map_err(fail)?;
    ok(json!({"revoked": true}))
}

#[derive(Deserialize)]
struct AmountBody {
    amount: u64,
}

async fn add_credits(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(body): Json<AmountBody>,
) -> AdminResult {
    let balance = state.engine.keys.add_credits(&key, body.amount).map_err(fail)?;
    ok(json!({"balance": balance}))
}

#[derive(Deserialize)]
struct QuotaBody {
    #[serde(default)]
    daily_calls: Option<u64>,
    #[serde(default)]
    monthly_calls: Option<u64>,
    #[serde(default)]
    daily_credits: Option<u64>,
    #[serde(default)]
    monthly_credits: Option<u64>,
    /// Also arms the percent-threshold alert tracker.
    #[serde(default)]
    alert_quota: Option<u64>,
}

async fn set_quota(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(body): Json<QuotaBody>,
) -> AdminResult {
    state
        .engine
        .keys
        .set_quota(
            &key,
            body.daily_calls,
            body.monthly_calls,
            body.daily_credits,
            body.monthly_credits,
        )
        .map_err(fail)?;
    if let Some(alert_quota) = body.alert_quota {
        state.engine.quota_alerts.set_quota(&key, alert_quota);
    }
    ok(json!({"updated": true}))
}

#[derive(Deserialize)]
struct AclBody {
    #[serde(default)]
    allowed_tools: Vec<String>,
    #[serde(default)]
    denied_tools: Vec<String>,
}

async fn set_acl(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(body): Json<AclBody>,
) -> AdminResult {
    state
        .engine
        .keys
        .set_acl(&key, body.allowed_tools, body.denied_tools)
        .map_err(fail)?;
    ok(json!({"updated": true}))
}

#[derive(Deserialize)]
struct ExpiryBody {
    expires_at: Option<u64>,
}

async fn set_expiry(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(body): Json<ExpiryBody>,
) -> AdminResult {
    state.engine.keys.set_expiry(&key, body.expires_at).map_err(fail)?;
    ok(json!({"updated": true}))
}

// ---- transfers and batches ----

#[derive(Deserialize)]
struct TransferBody {
    from_key: String,
    to_key: String,
    amount: u64,
    #[serde(default)]
    reason: Option<String>,
}

async fn create_transfer(State(state): State<AppState>, Json(body): Json<TransferBody>) -> AdminResult {
    let record = state
        .engine
        .transfers
        .transfer(&body.from_key, &body.to_key, body.amount, body.reason.as_deref())
        .map_err(fail)?;
    ok(record)
}

async fn list_transfers(State(state): State<AppState>) -> AdminResult {
    ok(state.engine.transfers.history(100))
}

#[derive(Deserialize)]
struct ReasonBody {
    #[serde(default)]
    reason: Option<String>,
}

async fn reverse_transfer(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ReasonBody>,
) -> AdminResult {
    let record = state
        .engine
        .transfers
        .reverse(&id, body.reason.as_deref())
        .map_err(fail)?;
    ok(record)
}

#[derive(Deserialize)]
struct BatchBody {
    ops: Vec<BatchOp>,
    #[serde(default = "default_true")]
    atomic: bool,
}

fn default_true() -> bool {
    true
}

async fn execute_batch(State(state): State<AppState>, Json(body): Json<BatchBody>) -> AdminResult {
    ok(state.engine.batches.execute(body.ops, body.atomic))
}

async fn batch_history(State(state): State<AppState>) -> AdminResult {
    ok(state.engine.batches.history(50))
}

// ---- groups ----

#[derive(Deserialize)]
struct GroupBody {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    default_rate_limit: Option<u32>,
    #[serde(default)]
    default_allowed_tools: Vec<String>,
    #[serde(default)]
    default_scopes: Vec<String>,
}

async fn create_group(State(state): State<AppState>, Json(body): Json<GroupBody>) -> AdminResult {
    ok(state.engine.groups.create_group(
        &body.name,
        &body.description,
        body.default_rate_limit,
        body.default_allowed_tools,
        body.default_scopes,
    ))
}

async fn list_groups(State(state): State<AppState>) -> AdminResult {
    ok(state.engine.groups.list_groups())
}

async fn delete_group(State(state): State<AppState>, Path(id): Path<String>) -> AdminResult {
    state.engine.groups.delete_group(&id).map_err(fail)?;
    ok(json!({"deleted": true}))
}

#[derive(Deserialize)]
struct KeyBody {
    key: String,
}

async fn assign_group(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<KeyBody>,
) -> AdminResult {
    state.engine.groups.assign_key(&body.key, &id).map_err(fail)?;
    ok(json!({"assigned": true}))
}

// ---- scopes ----

#[derive(Deserialize)]
struct ScopeBody {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    includes: Vec<String>,
}

async fn define_scope(State(state): State<AppState>, Json(body): Json<ScopeBody>) -> AdminResult {
    state
        .engine
        .scopes
        .define_scope(&body.name, &body.description, body.includes)
        .map_err(fail)?;
    ok(json!({"defined": true}))
}

async fn list_scopes(State(state): State<AppState>) -> AdminResult {
    ok(state.engine.scopes.list_scopes())
}

#[derive(Deserialize)]
struct GrantBody {
    key: String,
    scope: String,
    #[serde(default)]
    expires_at: Option<u64>,
}

async fn grant_scope(State(state): State<AppState>, Json(body): Json<GrantBody>) -> AdminResult {
    match body.expires_at {
        Some(expires_at) => state
            .engine
            .scopes
            .grant_temporary(&body.key, &body.scope, expires_at)
            .map_err(fail)?,
        None => state.engine.scopes.grant(&body.key, &body.scope),
    }
    ok(json!({"granted": true}))
}

async fn revoke_scope(State(state): State<AppState>, Json(body): Json<GrantBody>) -> AdminResult {
    state.engine.scopes.revoke(&body.key, &body.scope);
    ok(json!({"revoked": true}))
}

#[derive(Deserialize)]
struct ToolScopesBody {
    tool: String,
    scopes: Vec<String>,
}

async fn set_tool_scopes(State(state): State<AppState>, Json(body): Json<ToolScopesBody>) -> AdminResult {
    state.engine.scopes.set_tool_scopes(&body.tool, body.scopes);
    ok(json!({"updated": true}))
}

// ---- hierarchy ----

#[derive(Deserialize)]
struct RelationBody {
    child_key: String,
    parent_key: String,
    #[serde(default)]
    credit_ceiling: u64,
    #[serde(default)]
    inherit_scopes: bool,
    #[serde(default)]
    inherit_acl: bool,
}

async fn create_relation(State(state): State<AppState>, Json(body): Json<RelationBody>) -> AdminResult {
    let relation = state
        .engine
        .hierarchy
        .create_relation(
            &body.child_key,
            &body.parent_key,
            body.credit_ceiling,
            body.inherit_scopes,
            body.inherit_acl,
        )
        .map_err(fail)?;
    ok(relation)
}

async fn remove_relation(State(state): State<AppState>, Path(child): Path<String>) -> AdminResult {
    let removed = state.engine.hierarchy.remove_relation(&child).map_err(fail)?;
    ok(json!({"removed": removed}))
}

async fn get_relation(State(state): State<AppState>, Path(child): Path<String>) -> AdminResult {
    match state.engine.hierarchy.get_relation(&child) {
        Some(relation) => ok(json!({
            "relation": relation,
            "ancestors": state.engine.hierarchy.get_ancestors(&child),
            "descendants": state.engine.hierarchy.get_descendants(&child),
        })),
        None => Err(fail(GateError::NotFound("relation".to_string()))),
    }
}

// ---- rotation ----

#[derive(Deserialize)]
struct RotationPolicyBody {
    interval_seconds: u64,
    #[serde(default)]
    grace_period_seconds: u64,
}

async fn create_rotation_policy(
    State(state): State<AppState>,
    Json(body): Json<RotationPolicyBody>,
) -> AdminResult {
    let policy = state
        .engine
        .rotation
        .create_policy(body.interval_seconds, body.grace_period_seconds)
        .map_err(fail)?;
    ok(policy)
}

#[derive(Deserialize)]
struct AttachRotationBody {
    key: String,
    policy_id: String,
}

async fn attach_rotation(
    State(state): State<AppState>,
    Json(body): Json<AttachRotationBody>,
) -> AdminResult {
    let schedule = state
        .engine
        .rotation
        .attach(&body.key, &body.policy_id)
        .map_err(fail)?;
    ok(schedule)
}

async fn rotate_key(State(state): State<AppState>, Json(body): Json<KeyBody>) -> AdminResult {
    let engine = &state.engine;
    let old = engine
        .keys
        .get_key_raw(&body.key)
        .ok_or_else(|| fail(GateError::NotFound("key".to_string())))?;
    let schedule = engine
        .rotation
        .get_schedule(&body.key)
        .ok_or_else(|| fail(GateError::NotFound("rotation schedule".to_string())))?;
    let policy = engine
        .rotation
        .get_policy(&schedule.policy_id)
        .ok_or_else(|| fail(GateError::NotFound("rotation policy".to_string())))?;

    // Mint the replacement with the old record's posture, then keep the
    // old key alive only through the grace window.
    let replacement = engine.keys.create_key(
        &old.name,
        old.credits as i64,
        CreateKeyOptions {
            expires_at: old.expires_at,
            spending_limit: old.spending_limit,
            allowed_tools: old.allowed_tools.clone(),
            denied_tools: old.denied_tools.clone(),
            overdraft_enabled: old.overdraft_enabled,
            metadata: old.metadata.clone(),
        },
    );
    engine
        .keys
        .charge_credits(&body.key, old.credits, true)
        .map_err(fail)?;
    let grace_ends = engine.clock.now_ms() + policy.grace_period_seconds * 1_000;
    engine.keys.set_expiry(&body.key, Some(grace_ends)).map_err(fail)?;
    let schedule = engine
        .rotation
        .record_rotation(&body.key, &replacement.key)
        .map_err(fail)?;
    ok(json!({"new_key": replacement, "schedule": schedule}))
}

async fn list_rotation_schedules(State(state): State<AppState>) -> AdminResult {
    ok(state.engine.rotation.list_schedules())
}

// ---- maintenance and buffering ----

#[derive(Deserialize)]
struct MaintenanceBody {
    message: String,
    #[serde(default)]
    starts_at: Option<u64>,
    duration_ms: u64,
    #[serde(default = "default_true")]
    block_traffic: bool,
    #[serde(default = "default_true")]
    auto_complete: bool,
}

async fn schedule_maintenance(
    State(state): State<AppState>,
    Json(body): Json<MaintenanceBody>,
) -> AdminResult {
    let window = match body.starts_at {
        Some(starts_at) => state
            .engine
            .maintenance
            .schedule_window(
                &body.message,
                starts_at,
                body.duration_ms,
                body.block_traffic,
                body.auto_complete,
            )
            .map_err(fail)?,
        None => state
            .engine
            .maintenance
            .start_now(&body.message, body.duration_ms, body.block_traffic)
            .map_err(fail)?,
    };
    ok(window)
}

async fn list_maintenance(State(state): State<AppState>) -> AdminResult {
    ok(state.engine.maintenance.list_windows())
}

async fn cancel_maintenance(State(state): State<AppState>, Path(id): Path<String>) -> AdminResult {
    let window = state.engine.maintenance.cancel(&id).map_err(fail)?;
    ok(window)
}

async fn complete_maintenance(State(state): State<AppState>, Path(id): Path<String>) -> AdminResult {
    let window = state.engine.maintenance.complete(&id).map_err(fail)?;
    ok(window)
}

async fn proxy_status(State(state): State<AppState>) -> AdminResult {
    ok(json!({
        "maintenance": state.engine.maintenance.get_status(),
        "backends": state.engine.balancer.list_backends(),
        "buffer": {
            "state": state.engine.buffer.state(),
            "queued": state.engine.buffer.len(),
            "stats": state.engine.buffer.stats(),
        },
        "keys": state.engine.keys.len(),
        "active_sessions": state.engine.sessions.active_count(),
    }))
}

async fn buffer_start(State(state): State<AppState>) -> AdminResult {
    state.engine.buffer.start_buffering().map_err(fail)?;
    ok(json!({"buffering": true}))
}

async fn buffer_drain(State(state): State<AppState>) -> AdminResult {
    let results = state.engine.drain_buffer().await;
    let replayed: Vec<Value> = results
        .iter()
        .map(|(id, response)| json!({"buffer_id": id, "success": response.is_success()}))
        .collect();
    ok(json!({"drained": replayed.len(), "results": replayed}))
}

// ---- monitoring ----

#[derive(Deserialize)]
struct SloBody {
    name: String,
    slo_type: SloType,
    target: f64,
    #[serde(default)]
    threshold_ms: Option<u64>,
    window_seconds: u64,
    #[serde(default)]
    tools: Vec<String>,
    #[serde(default)]
    keys: Vec<String>,
}

async fn define_slo(State(state): State<AppState>, Json(body): Json<SloBody>) -> AdminResult {
    let slo = state
        .engine
        .slo
        .define_slo(
            &body.name,
            body.slo_type,
            body.target,
            body.threshold_ms,
            body.window_seconds,
            body.tools,
            body.keys,
        )
        .map_err(fail)?;
    ok(slo)
}

async fn list_slos(State(state): State<AppState>) -> AdminResult {
    ok(state.engine.slo.list_slos())
}

async fn slo_status(State(state): State<AppState>, Path(id): Path<String>) -> AdminResult {
    match state.engine.slo.compute_status(&id) {
        Some(status) => ok(status),
        None => Err(fail(GateError::NotFound("slo".to_string()))),
    }
}

async fn list_alerts(State(state): State<AppState>) -> AdminResult {
    ok(json!({
        "slo": state.engine.slo.alerts(100),
        "quota": state.engine.quota_alerts.alerts(100),
    }))
}

#[derive(Deserialize, Default)]
struct MetricsQuery {
    #[serde(default)]
    tool: Option<String>,
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    since: Option<u64>,
    #[serde(default)]
    until: Option<u64>,
}

impl MetricsQuery {
    fn filter(&self) -> MetricsFilter {
        MetricsFilter {
            tool: self.tool.clone(),
            key: self.key.clone(),
            method: None,
            since: self.since,
            until: self.until,
        }
    }
}

async fn metrics_summary(
    State(state): State<AppState>,
    Query(query): Query<MetricsQuery>,
) -> AdminResult {
    ok(state.engine.metrics.summary(&query.filter()))
}

#[derive(Deserialize)]
struct ExportQuery {
    #[serde(default)]
    tool: Option<String>,
    #[serde(default)]
    key: Option<String>,
    #[serde(default = "default_export_format")]
    format: ExportFormat,
}

fn default_export_format() -> ExportFormat {
    ExportFormat::Json
}

async fn export_usage(State(state): State<AppState>, Query(query): Query<ExportQuery>) -> AdminResult {
    let filter = MetricsFilter {
        tool: query.tool.clone(),
        key: query.key.clone(),
        ..Default::default()
    };
    let result = state.engine.export.export(&filter, query.format).map_err(fail)?;
    ok(result)
}

async fn forecast_key(State(state): State<AppState>, Path(key): Path<String>) -> AdminResult {
    let balance = state.engine.keys.balance(&key);
    match state.engine.forecast.forecast(&key, balance) {
        Some(forecast) => ok(forecast),
        None => Err(fail(GateError::NotFound("no usage recorded for key".to_string()))),
    }
}

#[derive(Deserialize, Default)]
struct LedgerQuery {
    #[serde(default)]
    aggregate_id: Option<String>,
    #[serde(default)]
    event_type: Option<String>,
    #[serde(default)]
    after_sequence: Option<u64>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    offset: Option<usize>,
}

async fn query_ledger(State(state): State<AppState>, Query(query): Query<LedgerQuery>) -> AdminResult {
    ok(state.engine.ledger.query(&EventQuery {
        aggregate_id: query.aggregate_id,
        event_type: query.event_type,
        after_sequence: query.after_sequence,
        limit: query.limit.unwrap_or(100),
        offset: query.offset.unwrap_or(0),
        ..Default::default()
    }))
}

// ---- billing cycles ----

#[derive(Deserialize)]
struct SubscriptionBody {
    key: String,
    frequency: BillingFrequency,
}

async fn create_subscription(
    State(state): State<AppState>,
    Json(body): Json<SubscriptionBody>,
) -> AdminResult {
    let subscription = state
        .engine
        .cycles
        .subscribe(&body.key, body.frequency)
        .map_err(fail)?;
    ok(subscription)
}

async fn list_invoices(State(state): State<AppState>) -> AdminResult {
    ok(state.engine.cycles.list_invoices(None))
}

// The path id is the subscribed key.
async fn generate_invoice(State(state): State<AppState>, Path(id): Path<String>) -> AdminResult {
    let invoice = state.engine.cycles.generate_invoice(&id).map_err(fail)?;
    ok(invoice)
}

async fn finalize_invoice(State(state): State<AppState>, Path(id): Path<String>) -> AdminResult {
    ok(state.engine.cycles.finalize_invoice(&id).map_err(fail)?)
}

async fn pay_invoice(State(state): State<AppState>, Path(id): Path<String>) -> AdminResult {
    ok(state.engine.cycles.mark_paid(&id).map_err(fail)?)
}

async fn void_invoice(State(state): State<AppState>, Path(id): Path<String>) -> AdminResult {
    ok(state.engine.cycles.void_invoice(&id).map_err(fail)?)
}

// ---- sessions ----

async fn list_sessions(State(state): State<AppState>) -> AdminResult {
    ok(state.engine.sessions.list_sessions(None))
}

async fn list_connections(State(state): State<AppState>) -> AdminResult {
    ok(state.engine.connection_billing.active_sessions())
}

// ---- experiments ----

#[derive(Deserialize)]
struct ExperimentBody {
    name: String,
    variants: Vec<Variant>,
}

async fn create_experiment(
    State(state): State<AppState>,
    Json(body): Json<ExperimentBody>,
) -> AdminResult {
    let experiment = state
        .engine
        .experiments
        .create_experiment(&body.name, body.variants)
        .map_err(fail)?;
    ok(experiment)
}

async fn list_experiments(State(state): State<AppState>) -> AdminResult {
    ok(state.engine.experiments.list_experiments())
}

async fn start_experiment(State(state): State<AppState>, Path(name): Path<String>) -> AdminResult {
    ok(state.engine.experiments.start(&name).map_err(fail)?)
}

async fn pause_experiment(State(state): State<AppState>, Path(name): Path<String>) -> AdminResult {
    ok(state.engine.experiments.pause(&name).map_err(fail)?)
}

async fn complete_experiment(State(state): State<AppState>, Path(name): Path<String>) -> AdminResult {
    ok(state.engine.experiments.complete(&name).map_err(fail)?)
}

async fn assign_experiment(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<KeyBody>,
) -> AdminResult {
    let assignment = state
        .engine
        .experiments
        .assign(&name, &body.key)
        .map_err(fail)?;
    ok(assignment)
}

async fn experiment_results(State(state): State<AppState>, Path(name): Path<String>) -> AdminResult {
    ok(state.engine.experiments.results(&name).map_err(fail)?)
}

// ---- notifications ----

#[derive(Deserialize)]
struct ChannelBody {
    name: String,
    kind: String,
    #[serde(default)]
    endpoint_id: Option<String>,
}

async fn add_channel(State(state): State<AppState>, Json(body): Json<ChannelBody>) -> AdminResult {
    state
        .engine
        .notifications
        .add_channel(&body.name, &body.kind, body.endpoint_id.as_deref());
    ok(json!({"added": true}))
}

async fn list_channels(State(state): State<AppState>) -> AdminResult {
    ok(state.engine.notifications.list_channels())
}

#[derive(Deserialize)]
struct RuleBody {
    event: String,
    channels: Vec<String>,
    #[serde(default)]
    throttle_ms: u64,
    #[serde(default)]
    template: Option<String>,
}

async fn add_rule(State(state): State<AppState>, Json(body): Json<RuleBody>) -> AdminResult {
    ok(state.engine.notifications.add_rule(
        &body.event,
        body.channels,
        body.throttle_ms,
        body.template.as_deref(),
    ))
}

async fn list_rules(State(state): State<AppState>) -> AdminResult {
    ok(state.engine.notifications.list_rules())
}

async fn notification_history(State(state): State<AppState>) -> AdminResult {
    ok(state.engine.notifications.history(100))
}

// ---- webhooks ----

#[derive(Deserialize)]
struct WebhookBody {
    url: String,
    #[serde(default)]
    secret: Option<String>,
}

async fn add_webhook(State(state): State<AppState>, Json(body): Json<WebhookBody>) -> AdminResult {
    let endpoint = state
        .engine
        .webhook_log
        .add_endpoint(&body.url, body.secret.as_deref())
        .map_err(fail)?;
    ok(endpoint)
}

async fn list_webhooks(State(state): State<AppState>) -> AdminResult {
    ok(state.engine.webhook_log.list_endpoints())
}

async fn webhook_deliveries(State(state): State<AppState>, Path(id): Path<String>) -> AdminResult {
    ok(state.engine.webhook_log.deliveries(Some(&id), 100))
}

async fn test_webhook(State(state): State<AppState>, Path(id): Path<String>) -> AdminResult {
    let dispatcher = crate::notify::WebhookDispatcher::new(state.engine.webhook_log.clone());
    let delivery = dispatcher
        .deliver(&id, "test", json!({"test": true}), true)
        .await
        .map_err(fail)?;
    ok(delivery)
}

// ---- backends, schemas, config ----

#[derive(Deserialize)]
struct BackendBody {
    name: String,
    #[serde(default = "default_weight")]
    weight: u32,
}

fn default_weight() -> u32 {
    1
}

async fn add_backend(State(state): State<AppState>, Json(body): Json<BackendBody>) -> AdminResult {
    state
        .engine
        .balancer
        .add_backend(&body.name, body.weight)
        .map_err(fail)?;
    ok(json!({"added": true}))
}

async fn list_backends(State(state): State<AppState>) -> AdminResult {
    ok(state.engine.balancer.list_backends())
}

#[derive(Deserialize)]
struct HealthBody {
    healthy: bool,
}

async fn set_backend_health(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<HealthBody>,
) -> AdminResult {
    state
        .engine
        .balancer
        .set_health(&name, body.healthy)
        .map_err(fail)?;
    ok(json!({"updated": true}))
}

#[derive(Deserialize)]
struct SchemaBody {
    tool: String,
    schema: Value,
}

async fn register_schema(State(state): State<AppState>, Json(body): Json<SchemaBody>) -> AdminResult {
    state.engine.schemas.register_schema(&body.tool, body.schema);
    ok(json!({"registered": true}))
}

async fn effective_config(State(state): State<AppState>) -> AdminResult {
    ok(&state.engine.config)
}
