// Webhook Delivery
//
// Endpoints, the bounded delivery log, and the egress dispatcher.
// Payloads are POSTed as JSON; a signature header is attached iff the
// endpoint has a secret, and test deliveries carry a marker header.
// Retry scheduling is out of scope: the log records attempts and
// outcomes, resubmission is the operator's call.

use crate::clock::SharedClock;
use crate::error::{GateError, Result};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

pub const SIGNATURE_HEADER: &str = "X-Tollgate-Signature";
pub const TEST_HEADER: &str = "X-Tollgate-Test";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEndpoint {
    pub id: String,
    pub url: String,
    /// Deliveries are signed iff a secret is configured.
    #[serde(default)]
    pub secret: Option<String>,
    pub enabled: bool,
    pub created_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookDelivery {
    pub id: String,
    pub endpoint_id: String,
    pub event: String,
    pub payload: Value,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub response_status: Option<u16>,
    pub last_error: Option<String>,
    pub signed: bool,
    pub test: bool,
    pub created_at: u64,
    pub completed_at: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookLogConfig {
    pub max_deliveries: usize,
}

impl Default for WebhookLogConfig {
    fn default() -> Self {
        Self {
            max_deliveries: 1_000,
        }
    }
}

pub struct WebhookDeliveryLog {
    endpoints: RwLock<HashMap<String, WebhookEndpoint>>,
    deliveries: RwLock<VecDeque<WebhookDelivery>>,
    config: WebhookLogConfig,
    clock: SharedClock,
}

impl WebhookDeliveryLog {
    pub fn new(config: WebhookLogConfig, clock: SharedClock) -> Self {
        Self {
            endpoints: RwLock::new(HashMap::new()),
            deliveries: RwLock::new(VecDeque::new()),
            config,
            clock,
        }
    }

    pub fn add_endpoint(&self, url: &str, secret: Option<&str>) -> Result<WebhookEndpoint> {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(GateError::Validation(format!("invalid webhook url {}", url)));
        }
        let endpoint = WebhookEndpoint {
            id: Uuid::new_v4().to_string(),
            url: url.to_string(),
            secret: secret.map(|s| s.to_string()),
            enabled: true,
            created_at: self.clock.now_ms(),
        };
        self.endpoints
            .write()
            .insert(endpoint.id.clone(), endpoint.clone());
        Ok(endpoint)
    }

    pub fn remove_endpoint(&self, endpoint_id: &str) -> bool {
        self.endpoints.write().remove(endpoint_id).is_some()
    }

    pub fn set_endpoint_enabled(&self, endpoint_id: &str, enabled: bool) -> bool {
        match self.endpoints.write().get_mut(endpoint_id) {
            Some(endpoint) => {
                endpoint.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn get_endpoint(&self, endpoint_id: &str) -> Option<WebhookEndpoint> {
        self.endpoints.read().get(endpoint_id).cloned()
    }

    pub fn list_endpoints(&self) -> Vec<WebhookEndpoint> {
        self.endpoints.read().values().cloned().collect()
    }

    /// Create a pending delivery record for an enabled endpoint.
    pub fn create_delivery(
        &self,
        endpoint_id: &str,
        event: &str,
        payload: Value,
        test: bool,
    ) -> Result<WebhookDelivery> {
        let endpoint = self
            .get_endpoint(endpoint_id)
            .ok_or_else(|| GateError::NotFound(format!("endpoint {}", endpoint_id)))?;
        if !endpoint.enabled {
            return Err(GateError::InvalidState("endpoint is disabled".to_string()));
        }
        let delivery = WebhookDelivery {
            id: Uuid::new_v4().to_string(),
            endpoint_id: endpoint_id.to_string(),
            event: event.to_string(),
            payload,
            status: DeliveryStatus::Pending,
            attempts: 0,
            response_status: None,
            last_error: None,
            signed: endpoint.secret.is_some(),
            test,
            created_at: self.clock.now_ms(),
            completed_at: None,
        };
        let mut deliveries = self.deliveries.write();
        deliveries.push_back(delivery.clone());
        while deliveries.len() > self.config.max_deliveries {
            deliveries.pop_front();
        }
        Ok(delivery)
    }

    /// Record one attempt's outcome.
    pub fn record_outcome(
        &self,
        delivery_id: &str,
        response_status: Option<u16>,
        error: Option<&str>,
    ) -> Result<WebhookDelivery> {
        let now = self.clock.now_ms();
        let mut deliveries = self.deliveries.write();
        let delivery = deliveries
            .iter_mut()
            .find(|d| d.id == delivery_id)
            .ok_or_else(|| GateError::NotFound(format!("delivery {}", delivery_id)))?;

        delivery.attempts += 1;
        delivery.response_status = response_status;
        let success = response_status.map(|s| (200..300).contains(&s)).unwrap_or(false);
        if success {
            delivery.status = DeliveryStatus::Delivered;
            delivery.last_error = None;
        } else {
            delivery.status = DeliveryStatus::Failed;
            delivery.last_error = error.map(|e| e.to_string()).or_else(|| {
                response_status.map(|s| format!("endpoint returned status {}", s))
            });
        }
        delivery.completed_at = Some(now);
        Ok(delivery.clone())
    }

    pub fn get_delivery(&self, delivery_id: &str) -> Option<WebhookDelivery> {
        self.deliveries
            .read()
            .iter()
            .find(|d| d.id == delivery_id)
            .cloned()
    }

    /// Most recent deliveries first, optionally for one endpoint.
    pub fn deliveries(&self, endpoint_id: Option<&str>, limit: usize) -> Vec<WebhookDelivery> {
        self.deliveries
            .read()
            .iter()
            .rev()
            .filter(|d| endpoint_id.map(|e| d.endpoint_id == e).unwrap_or(true))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Delivered/failed counts per endpoint.
    pub fn stats(&self, endpoint_id: &str) -> (u64, u64) {
        let deliveries = self.deliveries.read();
        let mut delivered = 0;
        let mut failed = 0;
        for delivery in deliveries.iter().filter(|d| d.endpoint_id == endpoint_id) {
            match delivery.status {
                DeliveryStatus::Delivered => delivered += 1,
                DeliveryStatus::Failed => failed += 1,
                DeliveryStatus::Pending => {}
            }
        }
        (delivered, failed)
    }
}

/// HMAC-SHA256 signature over the serialized payload, hex-encoded.
pub fn sign_payload(secret: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Egress side: POSTs deliveries and records their outcomes in the log.
pub struct WebhookDispatcher {
    client: reqwest::Client,
    log: Arc<WebhookDeliveryLog>,
}

impl WebhookDispatcher {
    pub fn new(log: Arc<WebhookDeliveryLog>) -> Self {
        Self {
            client: reqwest::Client::new(),
            log,
        }
    }

    /// Deliver one event to one endpoint and record the outcome.
    pub async fn deliver(
        &self,
        endpoint_id: &str,
        event: &str,
        payload: Value,
        test: bool,
    ) -> Result<WebhookDelivery> {
        let endpoint = self
            .log
            .get_endpoint(endpoint_id)
            .ok_or_else(|| GateError::NotFound(format!("endpoint {}", endpoint_id)))?;
        let delivery = self
            .log
            .create_delivery(endpoint_id, event, payload.clone(), test)?;

        let body = serde_json::to_vec(&payload)?;
        let mut request = self
            .client
            .post(&endpoint.url)
            .header("Content-Type", "application/json");
        if let Some(secret) = &endpoint.secret {
            request = request.header(SIGNATURE_HEADER, sign_payload(secret, &body));
        }
        if test {
            request = request.header(TEST_HEADER, "true");
        }

        match request.body(body).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                debug!(endpoint = %endpoint.url, status, "webhook delivered");
                self.log.record_outcome(&delivery.id, Some(status), None)
            }
            Err(e) => {
                warn!(endpoint = %endpoint.url, error = %e, "webhook delivery failed");
                self.log
                    .record_outcome(&delivery.id, None, Some(&e.to_string()))
            }
        }
    }
}
