//! # Wharf
//!
//! A thread-per-socket ZeroMQ messaging fabric.
//!
//! ## Architecture
//!
//! - **`wharf-core`**: descriptors, patterns, retry policy, topic schemas, tasks, reply promises
//! - **`wharf`**: the fabric over libzmq (this crate)
//!
//! Every registered socket is owned by exactly one driver thread. Task-driven
//! sockets run a worker that executes sends, receives and requests in order;
//! subscriber sockets run a listener loop that hands decoded messages to a
//! replaceable callback. Callers only ever see the [`Fabric`] facade and the
//! [`Reply`] promises it returns.
//!
//! ```text
//! Fabric → Registry → worker / listener thread → libzmq socket
//!                           │
//!                           └→ Reply promise or listener callback
//! ```
//!
//! ## Quick Start
//!
//! ### Status broadcast
//!
//! ```rust,no_run
//! use wharf::prelude::*;
//!
//! # fn main() -> wharf::Result<()> {
//! let fabric = Fabric::new(FabricConfig::default(), default_schemas())?;
//! fabric.register_publisher("status-pub", "tcp://*:5556")?;
//! fabric.listen("status-sub", "tcp://127.0.0.1:5556", &["docker.status"], |topic, msg| {
//!     if let Some(event) = msg.downcast_ref::<StatusEvent>() {
//!         println!("{topic}: {} containers", event.statuses.len());
//!     }
//! })?;
//!
//! let event = StatusEvent::new(vec![ContainerStatus::new("1", "web", "running", true, true)], 0);
//! fabric.send("status-pub", STATUS_TOPIC, serde_json::to_vec(&event).unwrap())?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Request/reply
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use wharf::prelude::*;
//!
//! # fn main() -> wharf::Result<()> {
//! let fabric = Fabric::new(FabricConfig::default(), TopicSchemas::new().with_raw(""))?;
//! fabric.register_socket(SocketDescriptor::connect("cmd-req", SocketPattern::Req, "tcp://127.0.0.1:5560"))?;
//!
//! // Retries until the reply arrives; the caller bounds the wait.
//! let reply = fabric.send_and_wait("cmd-req", "", &b"ping"[..])?;
//! match reply.wait_timeout(Duration::from_secs(5)) {
//!     Ok(msg) => println!("reply: {:?}", msg.payload()),
//!     Err(e) => eprintln!("still waiting: {e}"),
//! }
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]

mod coordinator;
pub mod dev_tracing;
pub mod fabric;
pub mod listener;
pub mod proxy;
pub mod registry;
pub mod status;
pub mod transport;
mod worker;

pub use fabric::Fabric;
pub use listener::ListenerHandle;
pub use proxy::ProxyHandle;
pub use registry::{Registry, ShutdownReport, SocketHandle};
pub use status::{StatusPublisher, StatusPublisherConfig};
pub use wharf_core::error::{ConfigError, DecodeError, FabricError, Result};
pub use wharf_core::reply::Reply;

/// Convenience prelude for fabric users.
pub mod prelude {
    pub use crate::fabric::Fabric;
    pub use crate::listener::ListenerHandle;
    pub use crate::registry::{ShutdownReport, SocketHandle};
    pub use crate::status::{StatusPublisher, StatusPublisherConfig};
    pub use wharf_core::prelude::*;
}

/// Building blocks re-exported from `wharf-core`.
pub use wharf_core as core;
