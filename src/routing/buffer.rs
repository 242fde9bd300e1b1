// Request Buffering
//
// Holds requests while the proxy is in maintenance and releases them on
// recovery. The queue only accepts work in the buffering state; drained
// requests come out in priority order (then FIFO), and requests that
// expired while parked are dropped.

use crate::clock::SharedClock;
use crate::error::{GateError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferState {
    Idle,
    Buffering,
    Draining,
}

#[derive(Debug, Clone, Serialize)]
pub struct BufferedRequest {
    pub id: String,
    pub payload: Value,
    pub priority: i32,
    pub enqueued_at: u64,
    pub expires_at: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BufferStats {
    pub enqueued: u64,
    pub dropped_capacity: u64,
    pub dropped_expired: u64,
    pub drained: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    pub capacity: usize,
    /// Applied when a request is enqueued without an explicit TTL.
    pub default_ttl_ms: Option<u64>,
    /// Sort drained requests by (priority desc, enqueued asc).
    pub priority_drain: bool,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: 1_000,
            default_ttl_ms: Some(300_000),
            priority_drain: true,
        }
    }
}

struct BufferInner {
    state: BufferState,
    queue: VecDeque<BufferedRequest>,
    stats: BufferStats,
}

pub struct RequestBufferQueue {
    inner: RwLock<BufferInner>,
    config: BufferConfig,
    clock: SharedClock,
}

impl RequestBufferQueue {
    pub fn new(config: BufferConfig, clock: SharedClock) -> Self {
        Self {
            inner: RwLock::new(BufferInner {
                state: BufferState::Idle,
                queue: VecDeque::new(),
                stats: BufferStats::default(),
            }),
            config,
            clock,
        }
    }

    /// idle -> buffering. Re-entering while already buffering is a no-op.
    pub fn start_buffering(&self) -> Result<()> {
        let mut inner = self.inner.write();
        match inner.state {
            BufferState::Idle | BufferState::Buffering => {
                inner.state = BufferState::Buffering;
                info!("request buffering enabled");
                Ok(())
            }
            BufferState::Draining => Err(GateError::InvalidState(
                "cannot start buffering while draining".to_string(),
            )),
        }
    }

    pub fn enqueue(
        &self,
        payload: Value,
        priority: i32,
        ttl_ms: Option<u64>,
    ) -> Result<BufferedRequest> {
        let now = self.clock.now_ms();
        let mut inner = self.inner.write();
        if inner.state != BufferState::Buffering {
            return Err(GateError::InvalidState(format!(
                "buffer is {:?}",
                inner.state
            )));
        }
        if inner.queue.len() >= self.config.capacity {
            inner.stats.dropped_capacity += 1;
            debug!("buffer at capacity, dropping request");
            return Err(GateError::CapacityExceeded(format!(
                "buffer capacity {} reached",
                self.config.capacity
            )));
        }

        let ttl = ttl_ms.or(self.config.default_ttl_ms);
        let request = BufferedRequest {
            id: Uuid::new_v4().to_string(),
            payload,
            priority,
            enqueued_at: now,
            expires_at: ttl.map(|t| now + t),
        };
        inner.queue.push_back(request.clone());
        inner.stats.enqueued += 1;
        Ok(request)
    }

    /// Release everything: buffering -> draining -> idle. Expired requests
    /// are dropped and counted.
    pub fn drain(&self) -> Vec<BufferedRequest> {
        let now = self.clock.now_ms();
        let mut inner = self.inner.write();
        inner.state = BufferState::Draining;

        let mut drained: Vec<BufferedRequest> = Vec::with_capacity(inner.queue.len());
        while let Some(request) = inner.queue.pop_front() {
            if request.expires_at.map(|t| t <= now).unwrap_or(false) {
                inner.stats.dropped_expired += 1;
            } else {
                drained.push(request);
            }
        }
        if self.config.priority_drain {
            drained.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.enqueued_at.cmp(&b.enqueued_at))
            });
        }
        inner.stats.drained += drained.len() as u64;
        inner.state = BufferState::Idle;
        info!(count = drained.len(), "buffer drained");
        drained
    }

    /// Release at most `n` requests, leaving the rest parked. The queue
    /// stays in draining until it empties.
    pub fn drain_batch(&self, n: usize) -> Vec<BufferedRequest> {
        let now = self.clock.now_ms();
        let mut inner = self.inner.write();
        inner.state = BufferState::Draining;

        if self.config.priority_drain {
            let mut all: Vec<BufferedRequest> = inner.queue.drain(..).collect();
            all.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.enqueued_at.cmp(&b.enqueued_at))
            });
            inner.queue = all.into();
        }

        let mut drained = Vec::with_capacity(n);
        while drained.len() < n {
            let request = match inner.queue.pop_front() {
                Some(r) => r,
                None => break,
            };
            if request.expires_at.map(|t| t <= now).unwrap_or(false) {
                inner.stats.dropped_expired += 1;
            } else {
                drained.push(request);
            }
        }
        inner.stats.drained += drained.len() as u64;
        if inner.queue.is_empty() {
            inner.state = BufferState::Idle;
        }
        drained
    }

    pub fn state(&self) -> BufferState {
        self.inner.read().state
    }

    pub fn len(&self) -> usize {
        self.inner.read().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().queue.is_empty()
    }

    pub fn stats(&self) -> BufferStats {
        self.inner.read().stats.clone()
    }
}
