// Backend Load Balancing
//
// Picks a backend from the healthy subset of the pool. Four strategies:
// round-robin (cyclic index persisted across picks), weighted (random
// offset over cumulative weights), least-connections (argmin with ties
// broken by pool order) and random. Backends accumulate rolling latency
// and error counts; enough 5xx responses mark a backend unhealthy until an
// operator brings it back.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{GateError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BalanceStrategy {
    RoundRobin,
    Weighted,
    LeastConnections,
    Random,
}

#[derive(Debug, Clone, Serialize)]
pub struct Backend {
    pub name: String,
    pub weight: u32,
    pub healthy: bool,
    pub active_connections: u64,
    pub total_requests: u64,
    pub total_errors: u64,
    pub avg_latency_ms: f64,
}

impl Backend {
    fn new(name: &str, weight: u32) -> Self {
        Self {
            name: name.to_string(),
            weight,
            healthy: true,
            active_connections: 0,
            total_requests: 0,
            total_errors: 0,
            avg_latency_ms: 0.0,
        }
    }
}

/// A selection plus the reason it was made, for request tracing.
#[derive(Debug, Clone, Serialize)]
pub struct BackendPick {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerConfig {
    pub strategy: BalanceStrategy,
    /// 5xx responses at or above this count mark the backend unhealthy.
    pub error_threshold: u64,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            strategy: BalanceStrategy::RoundRobin,
            error_threshold: 5,
        }
    }
}

pub struct LoadBalancer {
    backends: RwLock<Vec<Backend>>,
    rr_index: RwLock<usize>,
    config: BalancerConfig,
}

impl LoadBalancer {
    pub fn new(config: BalancerConfig) -> Self {
        Self {
            backends: RwLock::new(Vec::new()),
            rr_index: RwLock::new(0),
            config,
        }
    }

    pub fn add_backend(&self, name: &str, weight: u32) -> Result<()> {
        let mut backends = self.backends.write();
        if backends.iter().any(|b| b.name == name) {
            return Err(GateError::AlreadyExists(format!("backend {}", name)));
        }
        backends.push(Backend::new(name, weight.max(1)));
        Ok(())
    }

    pub fn remove_backend(&self, name: &str) -> Result<()> {
        let mut backends = self.backends.write();
        let before = backends.len();
        backends.retain(|b| b.name != name);
        if backends.len() == before {
            return Err(GateError::NotFound(format!("backend {}", name)));
        }
        Ok(())
    }

    /// Pick a backend from the healthy subset.
    pub fn pick(&self) -> Result<BackendPick> {
        let backends = self.backends.read();
        let healthy: Vec<&Backend> = backends.iter().filter(|b| b.healthy).collect();
        if healthy.is_empty() {
            return Err(GateError::Unavailable("no healthy backends".to_string()));
        }

        let pick = match self.config.strategy {
            BalanceStrategy::RoundRobin => {
                let mut index = self.rr_index.write();
                let chosen = healthy[*index % healthy.len()];
                let position = *index % healthy.len();
                *index = index.wrapping_add(1);
                BackendPick {
                    name: chosen.name.clone(),
                    reason: format!("round-robin position {}", position),
                }
            }
            BalanceStrategy::Weighted => {
                let total: u64 = healthy.iter().map(|b| b.weight as u64).sum();
                let offset = fastrand::u64(0..total.max(1));
                let mut cumulative = 0u64;
                let mut chosen = healthy[0];
                for backend in &healthy {
                    cumulative += backend.weight as u64;
                    if offset < cumulative {
                        chosen = backend;
                        break;
                    }
                }
                BackendPick {
                    name: chosen.name.clone(),
                    reason: format!("weighted offset {} of {}", offset, total),
                }
            }
            BalanceStrategy::LeastConnections => {
                let chosen = healthy
                    .iter()
                    .min_by_key(|b| b.active_connections)
                    .expect("healthy subset is non-empty");
                BackendPick {
                    name: chosen.name.clone(),
                    reason: format!("least connections ({})", chosen.active_connections),
                }
            }
            BalanceStrategy::Random => {
                let chosen = healthy[fastrand::usize(0..healthy.len())];
                BackendPick {
                    name: chosen.name.clone(),
                    reason: "random".to_string(),
                }
            }
        };
        Ok(pick)
    }

    pub fn record_connect(&self, name: &str) {
        if let Some(backend) = self.backends.write().iter_mut().find(|b| b.name == name) {
            backend.active_connections += 1;
        }
    }

    pub fn record_disconnect(&self, name: &str) {
        if let Some(backend) = self.backends.write().iter_mut().find(|b| b.name == name) {
            backend.active_connections = backend.active_connections.saturating_sub(1);
        }
    }

    /// Record a completed request: rolling average latency, error counting,
    /// and automatic unhealthy marking past the error threshold.
    pub fn record_request(&self, name: &str, status_code: u16, latency_ms: u64) {
        let mut backends = self.backends.write();
        let backend = match backends.iter_mut().find(|b| b.name == name) {
            Some(b) => b,
            None => return,
        };

        backend.total_requests += 1;
        let n = backend.total_requests as f64;
        backend.avg_latency_ms = (backend.avg_latency_ms * (n - 1.0) + latency_ms as f64) / n;

        if status_code >= 500 {
            backend.total_errors += 1;
            if backend.total_errors >= self.config.error_threshold && backend.healthy {
                backend.healthy = false;
                warn!(backend = name, errors = backend.total_errors, "backend marked unhealthy");
            }
        }
    }

    /// Manual health override. Recovery resets the error counter.
    pub fn set_health(&self, name: &str, healthy: bool) -> Result<()> {
        let mut backends = self.backends.write();
        let backend = backends
            .iter_mut()
            .find(|b| b.name == name)
            .ok_or_else(|| GateError::NotFound(format!("backend {}", name)))?;
        backend.healthy = healthy;
        if healthy {
            backend.total_errors = 0;
            info!(backend = name, "backend recovered");
        }
        Ok(())
    }

    pub fn list_backends(&self) -> Vec<Backend> {
        self.backends.read().clone()
    }

    pub fn healthy_count(&self) -> usize {
        self.backends.read().iter().filter(|b| b.healthy).count()
    }
}
