//! Socket descriptors: the configuration record a socket is registered from.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::endpoint::{Endpoint, EndpointError};
use crate::error::ConfigError;
use crate::pattern::{FrameShape, Role, SocketPattern};

/// Everything the registry needs to create one named socket.
///
/// Descriptors deserialize from the orchestration layer's socket tables:
///
/// ```
/// use wharf_core::descriptor::SocketDescriptor;
/// use wharf_core::pattern::{Role, SocketPattern};
///
/// let json = r#"{"name":"status-sub","pattern":"sub","endpoint":"tcp://127.0.0.1:5556",
///               "role":"connect","topics":["docker.status"]}"#;
/// let desc: SocketDescriptor = serde_json::from_str(json).unwrap();
/// assert_eq!(desc.pattern, SocketPattern::Sub);
/// assert_eq!(desc.role, Role::Connect);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketDescriptor {
    /// Unique registry key
    pub name: String,
    /// Messaging pattern
    pub pattern: SocketPattern,
    /// libzmq endpoint URI
    pub endpoint: String,
    /// Bind or connect
    pub role: Role,
    /// Initial subscriptions (subscriber sockets only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topics: Vec<String>,
    /// Frame shape override; the pattern's default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_shape: Option<FrameShape>,
}

impl SocketDescriptor {
    /// Create a descriptor.
    pub fn new(
        name: impl Into<String>,
        pattern: SocketPattern,
        endpoint: impl Into<String>,
        role: Role,
    ) -> Self {
        Self {
            name: name.into(),
            pattern,
            endpoint: endpoint.into(),
            role,
            topics: Vec::new(),
            frame_shape: None,
        }
    }

    /// Descriptor for a socket that binds its endpoint.
    pub fn bind(name: impl Into<String>, pattern: SocketPattern, endpoint: impl Into<String>) -> Self {
        Self::new(name, pattern, endpoint, Role::Bind)
    }

    /// Descriptor for a socket that connects to its endpoint.
    pub fn connect(
        name: impl Into<String>,
        pattern: SocketPattern,
        endpoint: impl Into<String>,
    ) -> Self {
        Self::new(name, pattern, endpoint, Role::Connect)
    }

    /// Set initial subscriptions.
    pub fn with_topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics = topics.into_iter().map(Into::into).collect();
        self
    }

    /// Override the pattern's default frame shape.
    pub fn with_frame_shape(mut self, shape: FrameShape) -> Self {
        self.frame_shape = Some(shape);
        self
    }

    /// Effective frame shape.
    pub fn frame_shape(&self) -> FrameShape {
        self.frame_shape
            .unwrap_or_else(|| self.pattern.default_frame_shape())
    }

    /// Check the descriptor and return its parsed endpoint.
    pub fn validate(&self) -> Result<Endpoint, ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::EmptyName);
        }

        let invalid = |e: EndpointError| ConfigError::InvalidEndpoint {
            endpoint: self.endpoint.clone(),
            reason: e.to_string(),
        };
        let endpoint = Endpoint::parse(&self.endpoint).map_err(invalid)?;
        endpoint.check_role(self.role).map_err(invalid)?;

        if !self.topics.is_empty() && !self.pattern.is_listener_driven() {
            return Err(ConfigError::Unsupported {
                socket: self.name.clone(),
                pattern: self.pattern.to_string(),
                operation: "topic subscriptions",
            });
        }

        Ok(endpoint)
    }
}

impl fmt::Display for SocketDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.name, self.pattern, self.role, self.endpoint
        )
    }
}
