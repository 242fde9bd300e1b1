// Request Pipeline
//
// Three middleware stages run around every forwarded call: `pre` before the
// backend forward (admission), `post` after a successful forward
// (accounting), and `error` when the forward failed. Middleware run in
// descending priority order, can be scoped to tools or keys, and may abort
// the request by marking the threaded context.

use crate::clock::SharedClock;
use crate::error::{GateError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStage {
    Pre,
    Post,
    Error,
}

/// Mutable context threaded through every handler of a request.
pub struct RequestContext {
    pub request_id: String,
    pub api_key: String,
    pub tool: String,
    pub method: String,
    pub params: Value,
    /// Credits this call will cost if it succeeds.
    pub credits_cost: u64,
    pub aborted: bool,
    pub abort_reason: Option<String>,
    /// Typed error backing the abort, when one applies.
    pub abort_error: Option<GateError>,
    /// Backend response, visible to the post stage.
    pub response: Option<Value>,
    /// Forward failure, visible to the error stage.
    pub forward_error: Option<String>,
    pub metadata: HashMap<String, Value>,
    cancelled: Arc<AtomicBool>,
    pub started_at: u64,
}

impl RequestContext {
    pub fn new(request_id: &str, api_key: &str, tool: &str, method: &str, params: Value, started_at: u64) -> Self {
        Self {
            request_id: request_id.to_string(),
            api_key: api_key.to_string(),
            tool: tool.to_string(),
            method: method.to_string(),
            params,
            credits_cost: 0,
            aborted: false,
            abort_reason: None,
            abort_error: None,
            response: None,
            forward_error: None,
            metadata: HashMap::new(),
            cancelled: Arc::new(AtomicBool::new(false)),
            started_at,
        }
    }

    /// Abort the request; no further pre-stage handlers run and the
    /// forward is skipped.
    pub fn abort(&mut self, reason: &str) {
        self.aborted = true;
        self.abort_reason = Some(reason.to_string());
    }

    pub fn abort_with(&mut self, error: GateError) {
        self.aborted = true;
        self.abort_reason = Some(error.to_string());
        self.abort_error = Some(error);
    }

    /// Request-scoped cancellation handle, shared with the transport.
    pub fn cancellation_handle(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

type Handler = Arc<dyn Fn(&mut RequestContext) -> Result<()> + Send + Sync>;

#[derive(Clone)]
struct MiddlewareEntry {
    name: String,
    stage: PipelineStage,
    priority: i32,
    enabled: bool,
    tool_filter: Option<Vec<String>>,
    key_filter: Option<Vec<String>>,
    handler: Handler,
}

impl MiddlewareEntry {
    fn matches(&self, ctx: &RequestContext) -> bool {
        if let Some(tools) = &self.tool_filter {
            if !tools.iter().any(|t| t == &ctx.tool) {
                return false;
            }
        }
        if let Some(keys) = &self.key_filter {
            if !keys.iter().any(|k| k == &ctx.api_key) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageFailure {
    pub middleware: String,
    pub message: String,
}

/// Outcome of running one stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageResult {
    pub stage: PipelineStage,
    pub executed: Vec<String>,
    pub skipped: Vec<String>,
    pub errors: Vec<StageFailure>,
    pub aborted: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Keep running later middleware after one fails.
    pub continue_on_error: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            continue_on_error: false,
        }
    }
}

/// Registration options for one middleware.
#[derive(Debug, Clone, Default)]
pub struct MiddlewareOptions {
    pub priority: i32,
    pub tool_filter: Option<Vec<String>>,
    pub key_filter: Option<Vec<String>>,
}

pub struct RequestPipelineManager {
    middleware: RwLock<Vec<MiddlewareEntry>>,
    config: PipelineConfig,
    clock: SharedClock,
}

impl RequestPipelineManager {
    pub fn new(config: PipelineConfig, clock: SharedClock) -> Self {
        Self {
            middleware: RwLock::new(Vec::new()),
            config,
            clock,
        }
    }

    pub fn register<F>(&self, stage: PipelineStage, name: &str, options: MiddlewareOptions, handler: F)
    where
        F: Fn(&mut RequestContext) -> Result<()> + Send + Sync + 'static,
    {
        self.middleware.write().push(MiddlewareEntry {
            name: name.to_string(),
            stage,
            priority: options.priority,
            enabled: true,
            tool_filter: options.tool_filter,
            key_filter: options.key_filter,
            handler: Arc::new(handler),
        });
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut middleware = self.middleware.write();
        let mut found = false;
        for entry in middleware.iter_mut().filter(|e| e.name == name) {
            entry.enabled = enabled;
            found = true;
        }
        found
    }

    pub fn remove(&self, name: &str) -> bool {
        let mut middleware = self.middleware.write();
        let before = middleware.len();
        middleware.retain(|e| e.name != name);
        middleware.len() != before
    }

    pub fn middleware_names(&self, stage: PipelineStage) -> Vec<String> {
        let mut entries: Vec<(i32, String)> = self
            .middleware
            .read()
            .iter()
            .filter(|e| e.stage == stage)
            .map(|e| (e.priority, e.name.clone()))
            .collect();
        entries.sort_by(|a, b| b.0.cmp(&a.0));
        entries.into_iter().map(|(_, name)| name).collect()
    }

    /// Run one stage over the context. Handlers execute outside the
    /// registry lock, in descending priority order.
    pub fn execute_stage(&self, stage: PipelineStage, ctx: &mut RequestContext) -> StageResult {
        let started = self.clock.now_ms();
        let mut entries: Vec<MiddlewareEntry> = self
            .middleware
            .read()
            .iter()
            .filter(|e| e.stage == stage)
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut result = StageResult {
            stage,
            executed: Vec::new(),
            skipped: Vec::new(),
            errors: Vec::new(),
            aborted: false,
            duration_ms: 0,
        };

        for entry in entries {
            // An aborted context short-circuits the rest of the pre stage.
            if stage == PipelineStage::Pre && ctx.aborted {
                break;
            }
            if ctx.is_cancelled() {
                ctx.abort("request cancelled");
                break;
            }
            if !entry.enabled || !entry.matches(ctx) {
                result.skipped.push(entry.name.clone());
                continue;
            }

            match (entry.handler)(ctx) {
                Ok(()) => {
                    result.executed.push(entry.name.clone());
                }
                Err(e) => {
                    warn!(middleware = %entry.name, error = %e, "middleware failed");
                    result.errors.push(StageFailure {
                        middleware: entry.name.clone(),
                        message: e.to_string(),
                    });
                    result.executed.push(entry.name.clone());
                    if !self.config.continue_on_error {
                        if ctx.abort_error.is_none() {
                            ctx.abort_with(e);
                        } else {
                            ctx.aborted = true;
                        }
                        break;
                    }
                }
            }
        }

        result.aborted = ctx.aborted;
        result.duration_ms = self.clock.now_ms().saturating_sub(started);
        debug!(
            stage = ?stage,
            executed = result.executed.len(),
            skipped = result.skipped.len(),
            errors = result.errors.len(),
            aborted = result.aborted,
            "pipeline stage complete"
        );
        result
    }
}
