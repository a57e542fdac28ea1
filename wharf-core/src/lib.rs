//! Wharf Core
//!
//! Transport-agnostic building blocks of the wharf messaging fabric:
//! - Socket patterns, roles and frame shapes (`pattern`)
//! - Socket descriptors and endpoint parsing (`descriptor`, `endpoint`)
//! - Reliability profile and fabric configuration (`options`, `config`)
//! - Topic-to-schema map and decoded messages (`schema`)
//! - Tasks, retry policy and reply promises (`task`, `retry`, `reply`)
//! - Status messages (`status`)
//! - Error types (`error`)

#![deny(unsafe_code)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::cast_possible_truncation)]
pub mod config;
pub mod descriptor;
pub mod endpoint;
pub mod error;
pub mod options;
pub mod pattern;
pub mod reply;
pub mod retry;
pub mod schema;
pub mod status;
pub mod task;

// Keep it minimal to avoid API lock-in.
pub mod prelude {
    pub use crate::config::FabricConfig;
    pub use crate::descriptor::SocketDescriptor;
    pub use crate::error::{ConfigError, DecodeError, FabricError, Result};
    pub use crate::options::ReliabilityProfile;
    pub use crate::pattern::{FrameShape, Role, SocketPattern};
    pub use crate::reply::Reply;
    pub use crate::retry::RetryPolicy;
    pub use crate::schema::{Decoded, TopicSchemas};
    pub use crate::status::{default_schemas, ContainerStatus, StatusEvent, STATUS_TOPIC};
}
