//! The fabric facade.
//!
//! [`Fabric`] is the single entry point the rest of a service uses: register
//! sockets, submit work, install listeners, shut down. It holds no logic of
//! its own beyond checking that a socket's pattern supports the operation.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use tracing::{debug, info};

use wharf_core::config::FabricConfig;
use wharf_core::descriptor::SocketDescriptor;
use wharf_core::error::{ConfigError, Result};
use wharf_core::pattern::SocketPattern;
use wharf_core::reply::Reply;
use wharf_core::retry::RetryPolicy;
use wharf_core::schema::{Decoded, TopicSchemas};
use wharf_core::task::Task;

use crate::listener::{Callback, ListenerHandle, Registration};
use crate::proxy::ProxyHandle;
use crate::registry::{Registry, ShutdownReport, SocketHandle};
use crate::worker::Command;

/// Thread-per-socket messaging fabric.
///
/// Cloning is cheap; clones share the same registry.
///
/// # Examples
///
/// ```no_run
/// use wharf::prelude::*;
///
/// # fn main() -> wharf::Result<()> {
/// let fabric = Fabric::new(FabricConfig::default(), TopicSchemas::new().with_raw(""))?;
/// fabric.register_socket(SocketDescriptor::connect("cmd-req", SocketPattern::Req, "tcp://127.0.0.1:5560"))?;
///
/// let reply = fabric.send_and_wait("cmd-req", "", &b"ping"[..])?;
/// let message = reply.wait_timeout(std::time::Duration::from_secs(5))?;
/// println!("{:?}", message.payload());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Fabric {
    registry: Arc<Registry>,
}

impl Fabric {
    /// Create a fabric with its own context and the given topic map.
    pub fn new(config: FabricConfig, schemas: TopicSchemas) -> Result<Self> {
        Ok(Self {
            registry: Arc::new(Registry::new(config, schemas)?),
        })
    }

    /// Underlying registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Register a socket; idempotent by name.
    pub fn register_socket(&self, desc: SocketDescriptor) -> Result<SocketHandle> {
        self.registry.register(desc)
    }

    /// Bind a PUB socket.
    pub fn register_publisher(&self, name: &str, endpoint: &str) -> Result<SocketHandle> {
        self.register_socket(SocketDescriptor::bind(name, SocketPattern::Pub, endpoint))
    }

    /// Connect a SUB socket subscribed to `topics`.
    pub fn register_subscriber<I, S>(
        &self,
        name: &str,
        endpoint: &str,
        topics: I,
    ) -> Result<SocketHandle>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.register_socket(
            SocketDescriptor::connect(name, SocketPattern::Sub, endpoint).with_topics(topics),
        )
    }

    /// Connect a PUSH socket.
    pub fn register_push(&self, name: &str, endpoint: &str) -> Result<SocketHandle> {
        self.register_socket(SocketDescriptor::connect(name, SocketPattern::Push, endpoint))
    }

    /// Bind a PULL socket.
    pub fn register_pull(&self, name: &str, endpoint: &str) -> Result<SocketHandle> {
        self.register_socket(SocketDescriptor::bind(name, SocketPattern::Pull, endpoint))
    }

    /// Close one socket, rejecting its outstanding promises with `Closed`.
    pub fn close_socket(&self, name: &str) -> Result<()> {
        self.registry.close(name)
    }

    fn socket_for(
        &self,
        name: &str,
        allowed: impl Fn(SocketPattern) -> bool,
        operation: &'static str,
    ) -> Result<SocketHandle> {
        if self.registry.is_shutting_down() {
            return Err(ConfigError::ShutDown.into());
        }
        let handle = self.registry.get(name)?;
        if !allowed(handle.pattern()) {
            return Err(ConfigError::Unsupported {
                socket: name.to_string(),
                pattern: handle.pattern().to_string(),
                operation,
            }
            .into());
        }
        Ok(handle)
    }

    /// Fire-and-forget send of `payload` under `topic`.
    ///
    /// Returns once the task is queued; a failed send is logged and dropped.
    pub fn send(&self, socket: &str, topic: &str, payload: impl Into<Bytes>) -> Result<()> {
        let handle = self.socket_for(socket, |p| p.can_send(), "send")?;
        handle
            .entry()
            .submit(Command::Execute(Task::send(topic, payload)))
    }

    /// Send `payload` and wait for the reply, retrying until it arrives.
    pub fn send_and_wait(
        &self,
        socket: &str,
        topic: &str,
        payload: impl Into<Bytes>,
    ) -> Result<Reply> {
        self.send_and_wait_with(socket, topic, payload, RetryPolicy::default())
    }

    /// [`send_and_wait`](Self::send_and_wait) with an explicit retry policy.
    pub fn send_and_wait_with(
        &self,
        socket: &str,
        topic: &str,
        payload: impl Into<Bytes>,
        policy: RetryPolicy,
    ) -> Result<Reply> {
        let handle = self.socket_for(socket, |p| p.can_request(), "send_and_wait")?;
        let (task, reply) = Task::send_and_wait(socket, topic, payload, policy);
        handle.entry().submit(Command::Execute(task))?;
        Ok(reply)
    }

    /// Wait for the next message on `socket`, decoded under `topic`.
    pub fn receive(&self, socket: &str, topic: &str) -> Result<Reply> {
        let handle = self.socket_for(
            socket,
            |p| p.can_receive() && !p.is_listener_driven(),
            "receive",
        )?;
        let (task, reply) = Task::receive(socket, topic);
        handle.entry().submit(Command::Execute(task))?;
        Ok(reply)
    }

    /// Install `callback` on a subscriber socket, replacing any previous one.
    ///
    /// Only messages whose topic is exactly one of `topics` are delivered; an
    /// empty `topics` subscribes to and delivers everything.
    pub fn register_listener<I, S, F>(
        &self,
        socket: &str,
        topics: I,
        callback: F,
    ) -> Result<ListenerHandle>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&str, Decoded) + Send + Sync + 'static,
    {
        let handle = self.socket_for(socket, |p| p.is_listener_driven(), "listeners")?;
        let topics: Vec<String> = topics.into_iter().map(Into::into).collect();
        let callback: Arc<Callback> = Arc::new(callback);
        let registration = Arc::new(Registration::new(&topics, callback));
        let id = registration.id();

        handle
            .entry()
            .submit(Command::SetListenerTopics(topics.clone()))?;
        let slot: &Arc<ArcSwapOption<Registration>> = handle.entry().listener_slot();
        if slot.swap(Some(registration)).is_some() {
            info!(socket, ?topics, "listener replaced");
        } else {
            info!(socket, ?topics, "listener registered");
        }

        Ok(ListenerHandle::new(
            socket,
            id,
            Arc::clone(slot),
            Some(handle.clone()),
        ))
    }

    /// Connect a subscriber socket and install `callback` on it.
    pub fn listen<F>(
        &self,
        name: &str,
        endpoint: &str,
        topics: &[&str],
        callback: F,
    ) -> Result<ListenerHandle>
    where
        F: Fn(&str, Decoded) + Send + Sync + 'static,
    {
        self.register_subscriber(name, endpoint, topics.iter().copied())?;
        self.register_listener(name, topics.iter().copied(), callback)
    }

    /// Retune a socket's receive window and send timeout.
    ///
    /// Applied by the socket's own thread, after work already queued.
    /// Subscriber sockets have no receive window to retune and refuse this
    /// with [`ConfigError::Unsupported`].
    pub fn adjust_timeouts(&self, socket: &str, recv: Duration, send: Duration) -> Result<()> {
        let handle = self.socket_for(socket, |p| !p.is_listener_driven(), "timeouts")?;
        debug!(socket, ?recv, ?send, "timeout adjustment queued");
        handle
            .entry()
            .submit(Command::AdjustTimeouts { recv, send })
    }

    /// Start an XSUB/XPUB forwarding proxy between two bound endpoints.
    ///
    /// The proxy is stopped at shutdown if it is still running.
    pub fn spawn_proxy(&self, frontend: &str, backend: &str) -> Result<Arc<ProxyHandle>> {
        if self.registry.is_shutting_down() {
            return Err(ConfigError::ShutDown.into());
        }
        let context = self.registry.context()?;
        let proxy = Arc::new(ProxyHandle::spawn(&context, frontend, backend)?);
        self.registry.track_proxy(Arc::clone(&proxy))?;
        Ok(proxy)
    }

    /// Drain within the configured bound, force-stop, release the context.
    pub fn shutdown(&self) -> ShutdownReport {
        self.registry.shutdown()
    }

    /// [`shutdown`](Self::shutdown) with an explicit drain bound.
    pub fn shutdown_within(&self, drain_timeout: Duration) -> ShutdownReport {
        self.registry.shutdown_within(drain_timeout)
    }

    /// Whether shutdown completed and released the context.
    pub fn is_closed(&self) -> bool {
        self.registry.is_closed()
    }
}

impl std::fmt::Debug for Fabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fabric")
            .field("sockets", &self.registry.names())
            .field("closed", &self.registry.is_closed())
            .finish()
    }
}
