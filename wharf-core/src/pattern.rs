//! Socket pattern, role and frame shape enumerations.
//!
//! `SocketPattern` names the ZeroMQ messaging pattern a registered socket
//! takes part in. Patterns parse case-insensitively from the names the
//! orchestration layer uses in its configuration (`"PUB"`, `"pub"`,
//! `"Publish"`, ...).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// ZeroMQ socket patterns supported by the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SocketPattern {
    /// PUB socket broadcasting `[topic][payload]` to subscribers
    Pub,

    /// SUB socket receiving topic-filtered broadcasts
    Sub,

    /// PUSH socket distributing work to pullers
    Push,

    /// PULL socket receiving work from pushers
    Pull,

    /// REQ socket for strict request-reply clients
    Req,

    /// REP socket for strict request-reply servers
    Rep,

    /// DEALER socket for asynchronous request-reply
    Dealer,

    /// ROUTER socket for identity-routed replies
    Router,
}

impl SocketPattern {
    /// Get the pattern as its canonical name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pub => "PUB",
            Self::Sub => "SUB",
            Self::Push => "PUSH",
            Self::Pull => "PULL",
            Self::Req => "REQ",
            Self::Rep => "REP",
            Self::Dealer => "DEALER",
            Self::Router => "ROUTER",
        }
    }

    /// Whether `send` tasks make sense on this pattern.
    pub fn can_send(&self) -> bool {
        !matches!(self, Self::Sub | Self::Pull)
    }

    /// Whether `receive` tasks make sense on this pattern.
    pub fn can_receive(&self) -> bool {
        !matches!(self, Self::Pub | Self::Push)
    }

    /// Whether `send_and_wait` makes sense on this pattern.
    pub fn can_request(&self) -> bool {
        matches!(self, Self::Req | Self::Dealer)
    }

    /// Subscriber sockets are driven by a listener loop, never by tasks.
    pub fn is_listener_driven(&self) -> bool {
        matches!(self, Self::Sub)
    }

    /// Frame shape a socket of this pattern uses unless told otherwise.
    pub fn default_frame_shape(&self) -> FrameShape {
        match self {
            Self::Req | Self::Rep | Self::Dealer | Self::Router => FrameShape::Bare,
            Self::Pub | Self::Sub | Self::Push | Self::Pull => FrameShape::TopicTagged,
        }
    }
}

impl fmt::Display for SocketPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SocketPattern {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PUB" | "PUBLISH" => Ok(Self::Pub),
            "SUB" | "SUBSCRIBE" => Ok(Self::Sub),
            "PUSH" => Ok(Self::Push),
            "PULL" => Ok(Self::Pull),
            "REQ" | "REQUEST" => Ok(Self::Req),
            "REP" | "REPLY" => Ok(Self::Rep),
            "DEALER" => Ok(Self::Dealer),
            "ROUTER" => Ok(Self::Router),
            _ => Err(ConfigError::UnknownPattern(s.to_string())),
        }
    }
}

impl TryFrom<String> for SocketPattern {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SocketPattern> for String {
    fn from(pattern: SocketPattern) -> Self {
        pattern.as_str().to_string()
    }
}

/// Whether a socket binds its endpoint or connects to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Listen on the endpoint
    Bind,
    /// Dial the endpoint, reconnecting with the profile's backoff
    Connect,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind => f.write_str("bind"),
            Self::Connect => f.write_str("connect"),
        }
    }
}

/// How a socket splits its messages into topic and payload frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameShape {
    /// `[payload]` out; the last received frame is the payload
    Bare,

    /// `[topic][payload]` both ways; replies are matched to waiting tasks by topic
    TopicTagged,

    /// `[topic][payload]` for plain sends, `[payload]` for requests; a reply whose
    /// first frame equals the awaited topic is treated as topic-tagged
    Inferred,
}
