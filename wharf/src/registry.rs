//! Socket registry: owns the libzmq context and every driver thread.
//!
//! Registration is idempotent by name. Each registered socket gets exactly one
//! driver thread: a listener loop for subscriber sockets, a worker for every
//! other pattern. The registry is the only place sockets are closed.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use wharf_core::config::FabricConfig;
use wharf_core::descriptor::SocketDescriptor;
use wharf_core::error::{ConfigError, FabricError, Result};
use wharf_core::pattern::{FrameShape, SocketPattern};
use wharf_core::schema::TopicSchemas;

use crate::listener::{self, ListenerConfig, Slot};
use crate::proxy::ProxyHandle;
use crate::transport::ZmqTransport;
use crate::worker::{self, Command, WorkerConfig};

/// Poll interval while waiting for driver threads to finish.
const JOIN_POLL: Duration = Duration::from_millis(5);

/// One registered socket and its driver thread.
pub(crate) struct SocketEntry {
    descriptor: SocketDescriptor,
    shape: FrameShape,
    bound_endpoint: Option<String>,
    /// Taken on close so the driver sees its inbox disconnect
    control: Mutex<Option<flume::Sender<Command>>>,
    abort: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
    listener: Slot,
}

impl SocketEntry {
    pub(crate) fn submit(&self, cmd: Command) -> Result<()> {
        let guard = self.control.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(FabricError::Closed(self.descriptor.name.clone()));
        };
        tx.send(cmd)
            .map_err(|_| FabricError::Closed(self.descriptor.name.clone()))
    }

    pub(crate) fn listener_slot(&self) -> &Slot {
        &self.listener
    }

    fn close_intake(&self) {
        self.control.lock().take();
    }

    fn raise_abort(&self) {
        self.abort.store(true, Ordering::Release);
    }

    fn is_finished(&self) -> bool {
        self.thread
            .lock()
            .as_ref()
            .map_or(true, JoinHandle::is_finished)
    }

    fn join(&self) {
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                warn!(socket = %self.descriptor.name, "driver thread panicked");
            }
        }
    }

    /// Let go of a thread that would not stop.
    fn detach(&self) {
        self.thread.lock().take();
    }
}

/// Cloneable handle to a registered socket.
#[derive(Clone)]
pub struct SocketHandle {
    entry: Arc<SocketEntry>,
}

impl SocketHandle {
    /// Registry name.
    pub fn name(&self) -> &str {
        &self.entry.descriptor.name
    }

    /// Messaging pattern.
    pub fn pattern(&self) -> SocketPattern {
        self.entry.descriptor.pattern
    }

    /// Descriptor the socket was created from.
    pub fn descriptor(&self) -> &SocketDescriptor {
        &self.entry.descriptor
    }

    /// Effective frame shape.
    pub fn frame_shape(&self) -> FrameShape {
        self.entry.shape
    }

    /// Endpoint libzmq reports after bind/connect (resolves `tcp://*:0`).
    pub fn bound_endpoint(&self) -> Option<&str> {
        self.entry.bound_endpoint.as_deref()
    }

    /// Whether the socket still accepts work.
    pub fn is_open(&self) -> bool {
        self.entry.control.lock().is_some()
    }

    /// Whether both handles refer to the same registered socket.
    pub fn same_socket(&self, other: &SocketHandle) -> bool {
        Arc::ptr_eq(&self.entry, &other.entry)
    }

    pub(crate) fn entry(&self) -> &SocketEntry {
        &self.entry
    }
}

impl std::fmt::Debug for SocketHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketHandle")
            .field("descriptor", &self.entry.descriptor)
            .field("shape", &self.entry.shape)
            .finish()
    }
}

/// What [`Registry::shutdown`] did with each driver thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Finished on their own within the drain bound
    pub drained: usize,
    /// Stopped by the abort flag after the drain bound
    pub forced: usize,
    /// Still blocked after the abort grace period and left behind
    pub abandoned: usize,
}

/// Named sockets over one shared libzmq context.
pub struct Registry {
    context: Mutex<Option<zmq::Context>>,
    sockets: DashMap<String, Arc<SocketEntry>>,
    proxies: Mutex<Vec<Arc<ProxyHandle>>>,
    schemas: Arc<TopicSchemas>,
    config: FabricConfig,
    shutting_down: AtomicBool,
    abandoned: AtomicUsize,
}

impl Registry {
    /// Create a registry with its own libzmq context.
    pub fn new(config: FabricConfig, schemas: TopicSchemas) -> Result<Self> {
        let config = config.validate()?;
        let context = zmq::Context::new();
        context
            .set_io_threads(config.io_threads)
            .map_err(|e| FabricError::transport("context", e))?;
        info!(io_threads = config.io_threads, topics = schemas.len(), "registry created");
        Ok(Self {
            context: Mutex::new(Some(context)),
            sockets: DashMap::new(),
            proxies: Mutex::new(Vec::new()),
            schemas: Arc::new(schemas),
            config,
            shutting_down: AtomicBool::new(false),
            abandoned: AtomicUsize::new(0),
        })
    }

    /// Fabric configuration.
    pub fn config(&self) -> &FabricConfig {
        &self.config
    }

    /// Shared topic-to-schema map.
    pub fn schemas(&self) -> &TopicSchemas {
        &self.schemas
    }

    /// Register `desc`, or return the socket already registered under its name.
    ///
    /// A repeated registration ignores the new parameters. When they differ
    /// the drift is logged, or rejected with [`ConfigError::Conflicting`] under
    /// strict registration.
    pub fn register(&self, desc: SocketDescriptor) -> Result<SocketHandle> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(ConfigError::ShutDown.into());
        }
        desc.validate()?;

        match self.sockets.entry(desc.name.clone()) {
            Entry::Occupied(existing) => {
                let entry = Arc::clone(existing.get());
                if entry.descriptor != desc {
                    if self.config.strict_registration {
                        return Err(ConfigError::Conflicting {
                            name: desc.name,
                            existing: entry.descriptor.to_string(),
                        }
                        .into());
                    }
                    warn!(
                        socket = %desc.name,
                        existing = %entry.descriptor,
                        requested = %desc,
                        "socket already registered, ignoring new parameters"
                    );
                } else {
                    debug!(socket = %desc.name, "socket already registered");
                }
                Ok(SocketHandle { entry })
            }
            Entry::Vacant(slot) => {
                let entry = Arc::new(self.open(desc)?);
                // Shutdown snapshots names under the shard lock this slot holds,
                // so a flag still clear here means the snapshot will see us.
                if self.shutting_down.load(Ordering::Acquire) {
                    drop(slot);
                    entry.close_intake();
                    entry.raise_abort();
                    entry.join();
                    debug!(socket = %entry.descriptor.name, "registration lost race with shutdown");
                    return Err(ConfigError::ShutDown.into());
                }
                slot.insert(Arc::clone(&entry));
                Ok(SocketHandle { entry })
            }
        }
    }

    fn open(&self, desc: SocketDescriptor) -> Result<SocketEntry> {
        let transport = {
            let guard = self.context.lock();
            let context = guard.as_ref().ok_or(ConfigError::ShutDown)?;
            ZmqTransport::open(context, &desc, &self.config.profile)?
        };
        let bound_endpoint = transport.last_endpoint();

        let shape = desc.frame_shape();
        let (tx, rx) = flume::unbounded();
        let abort = Arc::new(AtomicBool::new(false));
        let slot: Slot = Arc::new(ArcSwapOption::empty());

        let name = desc.name.clone();
        let builder = std::thread::Builder::new().name(format!("wharf-{name}"));
        let thread = if desc.pattern.is_listener_driven() {
            let config = ListenerConfig {
                name: name.clone(),
                base_topics: desc.topics.clone(),
                schemas: Arc::clone(&self.schemas),
                wait_slice: self.config.wait_slice,
            };
            let slot = Arc::clone(&slot);
            let abort = Arc::clone(&abort);
            builder.spawn(move || listener::run(config, transport, rx, slot, abort))
        } else {
            let config = WorkerConfig {
                name: name.clone(),
                pattern: desc.pattern,
                shape,
                schemas: Arc::clone(&self.schemas),
                recv_window: self.config.profile.recv_timeout,
                wait_slice: self.config.wait_slice,
            };
            let abort = Arc::clone(&abort);
            builder.spawn(move || worker::run(config, transport, rx, abort))
        }
        .map_err(|e| FabricError::transport(&name, e))?;

        info!(socket = %name, pattern = %desc.pattern, ?shape, "socket registered");
        Ok(SocketEntry {
            descriptor: desc,
            shape,
            bound_endpoint,
            control: Mutex::new(Some(tx)),
            abort,
            thread: Mutex::new(Some(thread)),
            listener: slot,
        })
    }

    /// Look up a registered socket.
    pub fn get(&self, name: &str) -> Result<SocketHandle> {
        self.sockets
            .get(name)
            .map(|e| SocketHandle {
                entry: Arc::clone(e.value()),
            })
            .ok_or_else(|| FabricError::unknown_socket(name))
    }

    /// Whether a socket is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.sockets.contains_key(name)
    }

    /// Names of all registered sockets.
    pub fn names(&self) -> Vec<String> {
        self.sockets.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of registered sockets.
    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    /// Whether no socket is registered.
    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    /// Stop and remove the socket registered under `name`.
    ///
    /// Outstanding promises on it are rejected with [`FabricError::Closed`].
    /// Blocks until the driver thread has exited, which takes at most one send
    /// timeout or wait slice.
    pub fn close(&self, name: &str) -> Result<()> {
        let (_, entry) = self
            .sockets
            .remove(name)
            .ok_or_else(|| FabricError::unknown_socket(name))?;
        entry.close_intake();
        entry.raise_abort();
        entry.join();
        info!(socket = %name, "socket closed");
        Ok(())
    }

    pub(crate) fn context(&self) -> Result<zmq::Context> {
        self.context
            .lock()
            .clone()
            .ok_or_else(|| ConfigError::ShutDown.into())
    }

    pub(crate) fn track_proxy(&self, proxy: Arc<ProxyHandle>) -> Result<()> {
        if self.shutting_down.load(Ordering::Acquire) {
            proxy.stop();
            return Err(ConfigError::ShutDown.into());
        }
        self.proxies.lock().push(proxy);
        Ok(())
    }

    /// Whether [`shutdown`](Self::shutdown) has started.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// True once the context is released and no driver thread was left behind.
    pub fn is_closed(&self) -> bool {
        self.context.lock().is_none() && self.abandoned.load(Ordering::Acquire) == 0
    }

    /// Stop intake, drain, force-stop stragglers and release the context.
    ///
    /// Workers get `drain_timeout` to finish their queued tasks. Those still
    /// running are then aborted, which rejects their pending promises with
    /// [`FabricError::Closed`]; a thread blocked past the abort grace period is
    /// left behind and counted in [`ShutdownReport::abandoned`].
    pub fn shutdown(&self) -> ShutdownReport {
        self.shutdown_within(self.config.drain_timeout)
    }

    /// [`shutdown`](Self::shutdown) with an explicit drain bound.
    pub fn shutdown_within(&self, drain_timeout: Duration) -> ShutdownReport {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            debug!("shutdown already in progress");
            return ShutdownReport::default();
        }

        let names = self.names();
        let entries: Vec<Arc<SocketEntry>> = names
            .iter()
            .filter_map(|n| self.sockets.remove(n).map(|(_, e)| e))
            .collect();
        info!(sockets = entries.len(), ?drain_timeout, "shutting down");

        for entry in &entries {
            entry.close_intake();
        }

        let mut report = ShutdownReport::default();
        wait_for(&entries, Instant::now() + drain_timeout);
        let (finished, running): (Vec<_>, Vec<_>) =
            entries.into_iter().partition(|e| e.is_finished());
        report.drained = finished.len();
        for entry in &finished {
            entry.join();
        }

        if !running.is_empty() {
            warn!(count = running.len(), "drain bound elapsed, aborting workers");
            for entry in &running {
                entry.raise_abort();
            }
            let grace = self.config.profile.send_timeout + self.config.wait_slice * 2;
            wait_for(&running, Instant::now() + grace);
            for entry in running {
                if entry.is_finished() {
                    entry.join();
                    report.forced += 1;
                } else {
                    warn!(socket = %entry.descriptor.name, "driver thread did not stop, leaving it behind");
                    entry.detach();
                    report.abandoned += 1;
                }
            }
        }

        for proxy in self.proxies.lock().drain(..) {
            proxy.stop();
        }

        self.abandoned.fetch_add(report.abandoned, Ordering::AcqRel);
        self.context.lock().take();
        info!(
            drained = report.drained,
            forced = report.forced,
            abandoned = report.abandoned,
            "shutdown complete"
        );
        report
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        if !self.shutting_down.load(Ordering::Acquire) {
            self.shutdown_within(Duration::ZERO);
        }
    }
}

fn wait_for(entries: &[Arc<SocketEntry>], deadline: Instant) {
    while entries.iter().any(|e| !e.is_finished()) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep(JOIN_POLL.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Registry {
        let config = FabricConfig::default().with_wait_slice(Duration::from_millis(10));
        Registry::new(config, TopicSchemas::new().with_raw("")).unwrap()
    }

    #[test]
    fn test_same_name_returns_same_socket() {
        let reg = registry();
        let a = reg
            .register(SocketDescriptor::bind("p", SocketPattern::Pub, "inproc://reg-same"))
            .unwrap();
        let b = reg
            .register(SocketDescriptor::bind("p", SocketPattern::Pub, "inproc://reg-other"))
            .unwrap();
        assert!(a.same_socket(&b));
        assert_eq!(b.descriptor().endpoint, "inproc://reg-same");
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_strict_registration_rejects_drift() {
        let config = FabricConfig::default().with_strict_registration(true);
        let reg = Registry::new(config, TopicSchemas::new()).unwrap();
        reg.register(SocketDescriptor::bind("p", SocketPattern::Pub, "inproc://reg-strict"))
            .unwrap();
        let err = reg
            .register(SocketDescriptor::bind("p", SocketPattern::Push, "inproc://reg-strict"))
            .unwrap_err();
        assert!(matches!(
            err,
            FabricError::Configuration(ConfigError::Conflicting { .. })
        ));
        assert!(reg
            .register(SocketDescriptor::bind("p", SocketPattern::Pub, "inproc://reg-strict"))
            .is_ok());
    }

    #[test]
    fn test_invalid_descriptor() {
        let reg = registry();
        let err = reg
            .register(SocketDescriptor::bind("", SocketPattern::Pub, "inproc://x"))
            .unwrap_err();
        assert_eq!(err, FabricError::Configuration(ConfigError::EmptyName));
        let err = reg
            .register(SocketDescriptor::bind("x", SocketPattern::Pub, "udp://x"))
            .unwrap_err();
        assert!(err.is_configuration());
        assert!(reg.is_empty());
    }

    #[test]
    fn test_close_and_unknown() {
        let reg = registry();
        let handle = reg
            .register(SocketDescriptor::bind("q", SocketPattern::Push, "inproc://reg-close"))
            .unwrap();
        reg.close("q").unwrap();
        assert!(!handle.is_open());
        assert!(!reg.contains("q"));
        assert_eq!(reg.close("q").unwrap_err(), FabricError::unknown_socket("q"));
        assert!(reg.get("q").is_err());
    }

    #[test]
    fn test_shutdown_releases_context() {
        let reg = registry();
        reg.register(SocketDescriptor::bind("a", SocketPattern::Push, "inproc://reg-sd-a"))
            .unwrap();
        reg.register(SocketDescriptor::bind("b", SocketPattern::Pull, "inproc://reg-sd-b"))
            .unwrap();
        let report = reg.shutdown_within(Duration::from_secs(2));
        assert_eq!(report.drained, 2);
        assert!(reg.is_closed());
        assert!(reg.is_empty());
        assert_eq!(
            reg.register(SocketDescriptor::bind("c", SocketPattern::Push, "inproc://reg-sd-c"))
                .unwrap_err(),
            FabricError::Configuration(ConfigError::ShutDown)
        );
    }

    #[test]
    fn test_registration_racing_shutdown_is_never_orphaned() {
        let reg = registry();
        let (registered, report) = std::thread::scope(|s| {
            let workers: Vec<_> = (0..4)
                .map(|t| {
                    let reg = &reg;
                    s.spawn(move || {
                        let mut handles = Vec::new();
                        for i in 0..16 {
                            let name = format!("race-{t}-{i}");
                            let endpoint = format!("inproc://reg-race-{t}-{i}");
                            match reg.register(SocketDescriptor::bind(
                                &name,
                                SocketPattern::Push,
                                &endpoint,
                            )) {
                                Ok(handle) => handles.push(handle),
                                Err(e) => {
                                    assert_eq!(e, FabricError::Configuration(ConfigError::ShutDown));
                                }
                            }
                        }
                        handles
                    })
                })
                .collect();
            std::thread::sleep(Duration::from_millis(2));
            let report = reg.shutdown_within(Duration::from_secs(2));
            let registered: Vec<SocketHandle> = workers
                .into_iter()
                .flat_map(|w| w.join().unwrap())
                .collect();
            (registered, report)
        });

        assert_eq!(
            report.drained + report.forced + report.abandoned,
            registered.len()
        );
        assert!(registered.iter().all(|h| !h.is_open()));
        assert!(reg.is_empty());
    }

    #[test]
    fn test_bound_endpoint_resolves_wildcard_port() {
        let reg = registry();
        let handle = reg
            .register(SocketDescriptor::bind("w", SocketPattern::Pub, "tcp://127.0.0.1:0"))
            .unwrap();
        let endpoint = handle.bound_endpoint().unwrap();
        assert!(endpoint.starts_with("tcp://127.0.0.1:"));
        assert!(!endpoint.ends_with(":0"));
    }
}
