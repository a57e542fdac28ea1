//! Container status broadcaster.
//!
//! The orchestration layer hands a snapshot of container states to
//! [`StatusPublisher::publish`]; the publisher stamps it and sends it as JSON
//! on its PUB socket.

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info};

use wharf_core::error::{FabricError, Result};
use wharf_core::status::{ContainerStatus, StatusEvent, STATUS_TOPIC};

use crate::fabric::Fabric;

/// Socket name the publisher registers by default.
pub const DEFAULT_STATUS_SOCKET: &str = "docker-status-pub";

/// Endpoint the publisher binds by default.
pub const DEFAULT_STATUS_ENDPOINT: &str = "tcp://*:5556";

/// Where and under which topic status events are published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusPublisherConfig {
    pub socket: String,
    pub endpoint: String,
    pub topic: String,
}

impl Default for StatusPublisherConfig {
    fn default() -> Self {
        Self {
            socket: DEFAULT_STATUS_SOCKET.to_string(),
            endpoint: DEFAULT_STATUS_ENDPOINT.to_string(),
            topic: STATUS_TOPIC.to_string(),
        }
    }
}

impl StatusPublisherConfig {
    /// Bind a different endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Register under a different socket name.
    pub fn with_socket(mut self, socket: impl Into<String>) -> Self {
        self.socket = socket.into();
        self
    }

    /// Publish under a different topic.
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }
}

/// Publishes [`StatusEvent`]s on a PUB socket.
#[derive(Debug, Clone)]
pub struct StatusPublisher {
    fabric: Fabric,
    config: StatusPublisherConfig,
}

impl StatusPublisher {
    /// Register the default publisher socket (`docker-status-pub` on `tcp://*:5556`).
    pub fn new(fabric: &Fabric) -> Result<Self> {
        Self::with_config(fabric, StatusPublisherConfig::default())
    }

    /// Register the publisher socket described by `config`.
    pub fn with_config(fabric: &Fabric, config: StatusPublisherConfig) -> Result<Self> {
        fabric.register_publisher(&config.socket, &config.endpoint)?;
        info!(
            socket = %config.socket,
            endpoint = %config.endpoint,
            topic = %config.topic,
            "status publisher ready"
        );
        Ok(Self {
            fabric: fabric.clone(),
            config,
        })
    }

    /// Socket the publisher sends on.
    pub fn socket(&self) -> &str {
        &self.config.socket
    }

    /// Topic the publisher sends under.
    pub fn topic(&self) -> &str {
        &self.config.topic
    }

    /// Stamp `statuses` with the current time, publish them, and return the event sent.
    pub fn publish(&self, statuses: Vec<ContainerStatus>) -> Result<StatusEvent> {
        let event = StatusEvent::new(statuses, epoch_millis());
        self.publish_event(&event)?;
        Ok(event)
    }

    /// Publish a prepared event.
    pub fn publish_event(&self, event: &StatusEvent) -> Result<()> {
        let payload = serde_json::to_vec(event)
            .map_err(|e| FabricError::send_failure(&self.config.socket, e))?;
        debug!(
            socket = %self.config.socket,
            statuses = event.statuses.len(),
            bytes = payload.len(),
            "publishing status event"
        );
        self.fabric
            .send(&self.config.socket, &self.config.topic, payload)
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}
