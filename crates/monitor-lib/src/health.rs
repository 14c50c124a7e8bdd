//! Component health for the monitor's liveness and readiness endpoints

use crate::models::Snapshot;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Working with reduced coverage, e.g. one metric domain unavailable
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl ComponentHealth {
    fn new(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            updated_at: chrono::Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: BTreeMap<String, ComponentHealth>,
}

/// Worst status wins
fn overall(components: &BTreeMap<String, ComponentHealth>) -> ComponentStatus {
    components
        .values()
        .map(|c| c.status)
        .fold(ComponentStatus::Healthy, |acc, s| match (acc, s) {
            (ComponentStatus::Unhealthy, _) | (_, ComponentStatus::Unhealthy) => {
                ComponentStatus::Unhealthy
            }
            (ComponentStatus::Degraded, _) | (_, ComponentStatus::Degraded) => {
                ComponentStatus::Degraded
            }
            _ => ComponentStatus::Healthy,
        })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub mod components {
    pub const COLLECTOR: &str = "collector";
    pub const RESPONDER: &str = "responder";
    pub const LOG_READER: &str = "log_reader";
    pub const AUDIT_LOG: &str = "audit_log";
}

/// Shared, cloneable view of component health
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    components: Arc<RwLock<BTreeMap<String, ComponentHealth>>>,
    ready: Arc<RwLock<bool>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    async fn set(&self, name: &str, status: ComponentStatus, message: Option<String>) {
        self.components
            .write()
            .await
            .insert(name.to_string(), ComponentHealth::new(status, message));
    }

    pub async fn set_healthy(&self, name: &str) {
        self.set(name, ComponentStatus::Healthy, None).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.set(name, ComponentStatus::Degraded, Some(message.into()))
            .await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.set(name, ComponentStatus::Unhealthy, Some(message.into()))
            .await;
    }

    /// Collector health follows the errors carried by the latest snapshot
    pub async fn record_snapshot(&self, snapshot: &Snapshot) {
        if snapshot.errors.is_empty() {
            self.set_healthy(components::COLLECTOR).await;
        } else {
            self.set_degraded(components::COLLECTOR, snapshot.errors.join("; "))
                .await;
        }
    }

    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.components.read().await.clone();
        HealthResponse {
            status: overall(&components),
            components,
        }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        if !*self.ready.read().await {
            return ReadinessResponse {
                ready: false,
                reason: Some("monitor not started".to_string()),
            };
        }
        let health = self.health().await;
        match health
            .components
            .iter()
            .find(|(_, c)| c.status == ComponentStatus::Unhealthy)
        {
            Some((name, c)) => ReadinessResponse {
                ready: false,
                reason: Some(format!(
                    "{} unhealthy: {}",
                    name,
                    c.message.as_deref().unwrap_or("no detail")
                )),
            },
            None => ReadinessResponse {
                ready: true,
                reason: None,
            },
        }
    }
}
