//! Forwarding proxy for pub/sub fan-in.
//!
//! Publishers connect to the XSUB frontend, subscribers to the XPUB backend;
//! messages flow frontend → backend and subscriptions flow back.
//!
//! ```text
//! Publishers → XSUB (frontend) → XPUB (backend) → Subscribers
//! ```
//!
//! The proxy runs libzmq's steerable proxy on its own thread and is stopped
//! through an inproc control socket.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use wharf_core::endpoint::Endpoint;
use wharf_core::error::{ConfigError, FabricError, Result};

const CONTROL_SEND_TIMEOUT_MS: i32 = 1000;

static NEXT_PROXY: AtomicUsize = AtomicUsize::new(0);

/// Running proxy. [`stop`](Self::stop) is idempotent.
pub struct ProxyHandle {
    frontend: String,
    backend: String,
    control: Mutex<Option<zmq::Socket>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ProxyHandle {
    /// Bind an XSUB frontend and XPUB backend and start forwarding.
    pub(crate) fn spawn(context: &zmq::Context, frontend: &str, backend: &str) -> Result<Self> {
        for endpoint in [frontend, backend] {
            Endpoint::parse(endpoint).map_err(|e| ConfigError::InvalidEndpoint {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })?;
        }

        let map = |e: zmq::Error| FabricError::transport("proxy", e);
        let mut xsub = context.socket(zmq::XSUB).map_err(map)?;
        let mut xpub = context.socket(zmq::XPUB).map_err(map)?;
        xsub.set_linger(0).map_err(map)?;
        xpub.set_linger(0).map_err(map)?;
        xsub.bind(frontend).map_err(map)?;
        xpub.bind(backend).map_err(map)?;

        let control_endpoint = format!(
            "inproc://wharf-proxy-control-{}",
            NEXT_PROXY.fetch_add(1, Ordering::Relaxed)
        );
        let mut steer = context.socket(zmq::PAIR).map_err(map)?;
        steer.bind(&control_endpoint).map_err(map)?;
        let control = context.socket(zmq::PAIR).map_err(map)?;
        control.set_linger(0).map_err(map)?;
        control.set_sndtimeo(CONTROL_SEND_TIMEOUT_MS).map_err(map)?;
        control.connect(&control_endpoint).map_err(map)?;

        let label = format!("{frontend} -> {backend}");
        let thread = std::thread::Builder::new()
            .name("wharf-proxy".to_string())
            .spawn(move || {
                info!(proxy = %label, "proxy started");
                match zmq::proxy_steerable(&mut xsub, &mut xpub, &mut steer) {
                    Ok(()) => info!(proxy = %label, "proxy terminated"),
                    Err(e) => warn!(proxy = %label, error = %e, "proxy stopped"),
                }
            })
            .map_err(|e| FabricError::transport("proxy", e))?;

        Ok(Self {
            frontend: frontend.to_string(),
            backend: backend.to_string(),
            control: Mutex::new(Some(control)),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Endpoint publishers connect to.
    pub fn frontend(&self) -> &str {
        &self.frontend
    }

    /// Endpoint subscribers connect to.
    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Whether the proxy thread is still forwarding.
    pub fn is_running(&self) -> bool {
        self.thread
            .lock()
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Terminate the proxy and join its thread.
    pub fn stop(&self) {
        let Some(control) = self.control.lock().take() else {
            return;
        };
        if let Err(e) = control.send("TERMINATE", 0) {
            warn!(frontend = %self.frontend, error = %e, "failed to signal proxy");
            return;
        }
        drop(control);
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                warn!(frontend = %self.frontend, "proxy thread panicked");
            }
        }
        debug!(frontend = %self.frontend, backend = %self.backend, "proxy joined");
    }
}

impl Drop for ProxyHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for ProxyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyHandle")
            .field("frontend", &self.frontend)
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_and_stop() {
        let ctx = zmq::Context::new();
        let proxy =
            ProxyHandle::spawn(&ctx, "inproc://proxy-front", "inproc://proxy-back").unwrap();
        assert!(proxy.is_running());

        let publisher = ctx.socket(zmq::PUB).unwrap();
        publisher.connect("inproc://proxy-front").unwrap();
        let subscriber = ctx.socket(zmq::SUB).unwrap();
        subscriber.connect("inproc://proxy-back").unwrap();
        subscriber.set_subscribe(b"docker.status").unwrap();
        subscriber.set_rcvtimeo(100).unwrap();

        let mut received = None;
        for _ in 0..50 {
            publisher
                .send_multipart([&b"docker.status"[..], &b"{}"[..]], 0)
                .unwrap();
            if let Ok(parts) = subscriber.recv_multipart(0) {
                received = Some(parts);
                break;
            }
        }
        let parts = received.expect("no message through proxy");
        assert_eq!(parts[0], b"docker.status");

        proxy.stop();
        assert!(!proxy.is_running());
        proxy.stop();
    }

    #[test]
    fn test_invalid_endpoint() {
        let ctx = zmq::Context::new();
        let err = ProxyHandle::spawn(&ctx, "bogus", "inproc://x").unwrap_err();
        assert!(err.is_configuration());
    }
}
