//! Transport seam between a driver thread and its socket.
//!
//! Driver threads only ever talk to a socket through [`Transport`], so the
//! worker and listener loops can run against libzmq or a scripted socket in
//! tests. libzmq errors are mapped to [`FabricError`] here and nowhere else.

use std::time::Duration;

use bytes::Bytes;
use smallvec::SmallVec;
use tracing::{debug, info, trace};

use wharf_core::descriptor::SocketDescriptor;
use wharf_core::error::{FabricError, Result};
use wharf_core::options::ReliabilityProfile;
use wharf_core::pattern::{Role, SocketPattern};

/// One multipart message. Almost every message is one or two frames.
pub type Frames = SmallVec<[Bytes; 2]>;

/// Blocking-bounded access to one socket, owned by exactly one thread.
pub trait Transport: Send {
    /// Send `frames` as one multipart message, bounded by the send timeout.
    fn send_frames(&mut self, frames: &[Bytes]) -> Result<()>;

    /// Wait up to `timeout` for an incoming message. `Ok(false)` on timeout.
    fn wait_readable(&mut self, timeout: Duration) -> Result<bool>;

    /// Take one message without blocking.
    fn try_recv(&mut self) -> Result<Option<Frames>>;

    /// Add a topic prefix subscription (subscriber sockets).
    fn subscribe(&mut self, topic: &str) -> Result<()>;

    /// Remove a topic prefix subscription (subscriber sockets).
    fn unsubscribe(&mut self, topic: &str) -> Result<()>;

    /// Retune the receive and send timeouts.
    fn set_timeouts(&mut self, recv: Duration, send: Duration) -> Result<()>;
}

/// Map a libzmq socket type for `pattern`.
pub(crate) fn zmq_socket_type(pattern: SocketPattern) -> zmq::SocketType {
    match pattern {
        SocketPattern::Pub => zmq::PUB,
        SocketPattern::Sub => zmq::SUB,
        SocketPattern::Push => zmq::PUSH,
        SocketPattern::Pull => zmq::PULL,
        SocketPattern::Req => zmq::REQ,
        SocketPattern::Rep => zmq::REP,
        SocketPattern::Dealer => zmq::DEALER,
        SocketPattern::Router => zmq::ROUTER,
    }
}

/// Clamp a duration to libzmq's millisecond `int` options.
pub(crate) fn millis(d: Duration) -> i32 {
    i32::try_from(d.as_millis()).unwrap_or(i32::MAX)
}

/// [`Transport`] over a libzmq socket.
pub struct ZmqTransport {
    name: String,
    socket: zmq::Socket,
}

impl ZmqTransport {
    /// Create, configure and bind/connect the socket `desc` describes.
    ///
    /// Runs on the registering thread so bind failures surface synchronously;
    /// the transport then moves into its driver thread.
    pub fn open(
        context: &zmq::Context,
        desc: &SocketDescriptor,
        profile: &ReliabilityProfile,
    ) -> Result<Self> {
        let name = desc.name.clone();
        let map = |e: zmq::Error| FabricError::transport(&name, e);

        let socket = context.socket(zmq_socket_type(desc.pattern)).map_err(map)?;
        socket.set_linger(millis(profile.linger)).map_err(map)?;
        socket.set_sndhwm(clamp(profile.send_hwm)).map_err(map)?;
        socket.set_rcvhwm(clamp(profile.recv_hwm)).map_err(map)?;
        socket.set_rcvtimeo(millis(profile.recv_timeout)).map_err(map)?;
        socket.set_sndtimeo(millis(profile.send_timeout)).map_err(map)?;
        socket
            .set_reconnect_ivl(millis(profile.reconnect_ivl))
            .map_err(map)?;
        socket
            .set_reconnect_ivl_max(millis(profile.reconnect_ivl_max))
            .map_err(map)?;

        if desc.pattern == SocketPattern::Req {
            // A request that gives up must not wedge the socket in its receive state;
            // late replies to it are discarded by libzmq.
            socket.set_req_relaxed(true).map_err(map)?;
            socket.set_req_correlate(true).map_err(map)?;
        }

        match desc.role {
            Role::Bind => {
                socket.bind(&desc.endpoint).map_err(map)?;
                info!(socket = %name, pattern = %desc.pattern, endpoint = %desc.endpoint, "bound socket");
            }
            Role::Connect => {
                socket.set_immediate(profile.immediate).map_err(map)?;
                socket.connect(&desc.endpoint).map_err(map)?;
                info!(socket = %name, pattern = %desc.pattern, endpoint = %desc.endpoint, "connected socket");
            }
        }

        for topic in &desc.topics {
            socket.set_subscribe(topic.as_bytes()).map_err(map)?;
            debug!(socket = %name, topic = %topic, "subscribed");
        }

        Ok(Self { name, socket })
    }

    /// Address the socket actually bound (resolves `tcp://*:0`).
    pub fn last_endpoint(&self) -> Option<String> {
        self.socket.get_last_endpoint().ok().and_then(|r| r.ok())
    }

    fn map(&self, e: zmq::Error) -> FabricError {
        FabricError::transport(&self.name, e)
    }
}

fn clamp(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

impl Transport for ZmqTransport {
    fn send_frames(&mut self, frames: &[Bytes]) -> Result<()> {
        trace!(socket = %self.name, frames = frames.len(), "send");
        self.socket
            .send_multipart(frames.iter().map(|f| &f[..]), 0)
            .map_err(|e| FabricError::send_failure(&self.name, e))
    }

    fn wait_readable(&mut self, timeout: Duration) -> Result<bool> {
        let ready = self
            .socket
            .poll(zmq::POLLIN, i64::from(millis(timeout)))
            .map_err(|e| self.map(e))?;
        Ok(ready > 0)
    }

    fn try_recv(&mut self) -> Result<Option<Frames>> {
        match self.socket.recv_multipart(zmq::DONTWAIT) {
            Ok(parts) => {
                trace!(socket = %self.name, frames = parts.len(), "recv");
                Ok(Some(parts.into_iter().map(Bytes::from).collect()))
            }
            Err(zmq::Error::EAGAIN) => Ok(None),
            Err(e) => Err(self.map(e)),
        }
    }

    fn subscribe(&mut self, topic: &str) -> Result<()> {
        self.socket
            .set_subscribe(topic.as_bytes())
            .map_err(|e| self.map(e))
    }

    fn unsubscribe(&mut self, topic: &str) -> Result<()> {
        self.socket
            .set_unsubscribe(topic.as_bytes())
            .map_err(|e| self.map(e))
    }

    fn set_timeouts(&mut self, recv: Duration, send: Duration) -> Result<()> {
        self.socket
            .set_rcvtimeo(millis(recv))
            .map_err(|e| self.map(e))?;
        self.socket
            .set_sndtimeo(millis(send))
            .map_err(|e| self.map(e))
    }
}
