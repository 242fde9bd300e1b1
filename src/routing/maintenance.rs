// Maintenance Windows
//
// Scheduled downtime with lazy state advancement: windows flip from
// scheduled to active once their start passes, and auto-complete once
// their end passes. An active window with traffic blocking takes the proxy
// out of service for metered calls.

use crate::clock::SharedClock;
use crate::error::{GateError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowStatus {
    Scheduled,
    Active,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceWindow {
    pub id: String,
    pub message: String,
    pub status: WindowStatus,
    pub starts_at: u64,
    pub ends_at: u64,
    pub block_traffic: bool,
    pub auto_complete: bool,
    pub created_at: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MaintenanceStatus {
    pub operational: bool,
    pub message: Option<String>,
    pub active_window: Option<MaintenanceWindow>,
    pub next_window: Option<MaintenanceWindow>,
}

pub struct MaintenanceWindowManager {
    windows: RwLock<HashMap<String, MaintenanceWindow>>,
    clock: SharedClock,
}

impl MaintenanceWindowManager {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            windows: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub fn schedule_window(
        &self,
        message: &str,
        starts_at: u64,
        duration_ms: u64,
        block_traffic: bool,
        auto_complete: bool,
    ) -> Result<MaintenanceWindow> {
        if duration_ms == 0 {
            return Err(GateError::Validation(
                "window duration must be positive".to_string(),
            ));
        }
        let now = self.clock.now_ms();
        let ends_at = starts_at + duration_ms;
        let status = if now >= starts_at && now < ends_at {
            WindowStatus::Active
        } else if now >= ends_at && auto_complete {
            WindowStatus::Completed
        } else {
            WindowStatus::Scheduled
        };

        let window = MaintenanceWindow {
            id: Uuid::new_v4().to_string(),
            message: message.to_string(),
            status,
            starts_at,
            ends_at,
            block_traffic,
            auto_complete,
            created_at: now,
        };
        self.windows.write().insert(window.id.clone(), window.clone());
        info!(window = %window.id, status = ?window.status, "maintenance window scheduled");
        Ok(window)
    }

    /// Schedule a window starting immediately.
    pub fn start_now(
        &self,
        message: &str,
        duration_ms: u64,
        block_traffic: bool,
    ) -> Result<MaintenanceWindow> {
        let now = self.clock.now_ms();
        self.schedule_window(message, now, duration_ms, block_traffic, true)
    }

    pub fn cancel(&self, window_id: &str) -> Result<MaintenanceWindow> {
        let now = self.clock.now_ms();
        let mut windows = self.windows.write();
        let window = windows
            .get_mut(window_id)
            .ok_or_else(|| GateError::NotFound(format!("window {}", window_id)))?;
        advance(window, now);
        match window.status {
            WindowStatus::Scheduled | WindowStatus::Active => {
                window.status = WindowStatus::Cancelled;
                Ok(window.clone())
            }
            status => Err(GateError::InvalidState(format!(
                "cannot cancel window in state {:?}",
                status
            ))),
        }
    }

    /// Manually complete an active window.
    pub fn complete(&self, window_id: &str) -> Result<MaintenanceWindow> {
        let now = self.clock.now_ms();
        let mut windows = self.windows.write();
        let window = windows
            .get_mut(window_id)
            .ok_or_else(|| GateError::NotFound(format!("window {}", window_id)))?;
        advance(window, now);
        match window.status {
            WindowStatus::Active => {
                window.status = WindowStatus::Completed;
                Ok(window.clone())
            }
            status => Err(GateError::InvalidState(format!(
                "cannot complete window in state {:?}",
                status
            ))),
        }
    }

    pub fn get_window(&self, window_id: &str) -> Option<MaintenanceWindow> {
        let now = self.clock.now_ms();
        let mut windows = self.windows.write();
        let window = windows.get_mut(window_id)?;
        advance(window, now);
        Some(window.clone())
    }

    pub fn list_windows(&self) -> Vec<MaintenanceWindow> {
        let now = self.clock.now_ms();
        let mut windows = self.windows.write();
        let mut list: Vec<MaintenanceWindow> = windows
            .values_mut()
            .map(|w| {
                advance(w, now);
                w.clone()
            })
            .collect();
        list.sort_by_key(|w| w.starts_at);
        list
    }

    /// Overall proxy availability. Blocking active windows flip the status
    /// to non-operational with the window's message.
    pub fn get_status(&self) -> MaintenanceStatus {
        let now = self.clock.now_ms();
        let mut windows = self.windows.write();
        for window in windows.values_mut() {
            advance(window, now);
        }

        let blocking = windows
            .values()
            .filter(|w| w.status == WindowStatus::Active && w.block_traffic)
            .min_by_key(|w| w.starts_at)
            .cloned();
        if let Some(window) = blocking {
            return MaintenanceStatus {
                operational: false,
                message: Some(window.message.clone()),
                active_window: Some(window),
                next_window: None,
            };
        }

        let active = windows
            .values()
            .filter(|w| w.status == WindowStatus::Active)
            .min_by_key(|w| w.starts_at)
            .cloned();
        let next = windows
            .values()
            .filter(|w| w.status == WindowStatus::Scheduled && w.starts_at > now)
            .min_by_key(|w| w.starts_at)
            .cloned();
        MaintenanceStatus {
            operational: true,
            message: None,
            active_window: active,
            next_window: next,
        }
    }

    /// True while a blocking window is active.
    pub fn traffic_blocked(&self) -> bool {
        !self.get_status().operational
    }
}

fn advance(window: &mut MaintenanceWindow, now: u64) {
    if window.status == WindowStatus::Scheduled && now >= window.starts_at && now < window.ends_at {
        window.status = WindowStatus::Active;
    }
    if (window.status == WindowStatus::Active || window.status == WindowStatus::Scheduled)
        && window.auto_complete
        && now >= window.ends_at
    {
        window.status = WindowStatus::Completed;
    }
}
