//! Container status messages broadcast on the `docker.status` topic.

use serde::{Deserialize, Serialize};

use crate::schema::TopicSchemas;

/// Topic status events are published under.
pub const STATUS_TOPIC: &str = "docker.status";

/// Topic map with the status topic decoding to [`StatusEvent`].
pub fn default_schemas() -> TopicSchemas {
    TopicSchemas::new().with_json::<StatusEvent>(STATUS_TOPIC)
}

/// Live state of one configured container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStatus {
    /// Id of the configuration record the container was created from
    pub config_id: String,
    /// Human-readable configuration name
    pub config_name: String,
    /// Runtime container id, absent when the container does not exist
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    /// Runtime container name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    /// Runtime status string (`running`, `exited`, `not_found`, ...)
    pub status: String,
    /// Whether the container is running right now
    pub running: bool,
    /// Whether the configuration wants it running
    pub expected_running: bool,
    /// Set when `running` and `expected_running` disagree
    pub attention_needed: bool,
}

impl ContainerStatus {
    /// Build a status, deriving `attention_needed` from the two running flags.
    pub fn new(
        config_id: impl Into<String>,
        config_name: impl Into<String>,
        status: impl Into<String>,
        running: bool,
        expected_running: bool,
    ) -> Self {
        Self {
            config_id: config_id.into(),
            config_name: config_name.into(),
            container_id: None,
            container_name: None,
            status: status.into(),
            running,
            expected_running,
            attention_needed: running != expected_running,
        }
    }

    /// Attach the runtime container identity.
    pub fn with_container(mut self, id: impl Into<String>, name: impl Into<String>) -> Self {
        self.container_id = Some(id.into());
        self.container_name = Some(name.into());
        self
    }
}

/// One status broadcast: every configured container at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub statuses: Vec<ContainerStatus>,
    /// Milliseconds since the Unix epoch
    pub generated_at_epoch_ms: u64,
}

impl StatusEvent {
    /// Wrap `statuses` with a generation timestamp.
    pub fn new(statuses: Vec<ContainerStatus>, generated_at_epoch_ms: u64) -> Self {
        Self {
            statuses,
            generated_at_epoch_ms,
        }
    }

    /// Containers whose state disagrees with their configuration.
    pub fn needing_attention(&self) -> impl Iterator<Item = &ContainerStatus> {
        self.statuses.iter().filter(|s| s.attention_needed)
    }
}
