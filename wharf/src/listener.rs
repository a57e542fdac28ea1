//! Listener loop for subscriber sockets.
//!
//! A subscriber socket's driver thread runs this loop instead of a worker:
//! timed wait, read `[topic][payload]`, decode, hand the result to whatever
//! callback is currently installed. The callback lives in an [`ArcSwapOption`]
//! so the facade can replace or remove it without stopping the loop.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use hashbrown::HashSet;
use tracing::{debug, error, info, trace, warn};

use wharf_core::error::{ConfigError, DecodeError, FabricError, Result};
use wharf_core::schema::{Decoded, TopicSchemas};
use wharf_core::task::Task;

use crate::coordinator::preview;
use crate::registry::SocketHandle;
use crate::transport::Transport;
use crate::worker::Command;

/// Callback invoked with `(topic, decoded)` for every accepted message.
pub type Callback = dyn Fn(&str, Decoded) + Send + Sync;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// The callback installed on one subscriber socket and the topics it accepts.
pub(crate) struct Registration {
    id: u64,
    /// Exact topics to deliver; empty accepts everything subscribed
    topics: HashSet<String>,
    callback: Arc<Callback>,
}

impl Registration {
    pub(crate) fn new(topics: &[String], callback: Arc<Callback>) -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            topics: topics.iter().cloned().collect(),
            callback,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    fn accepts(&self, topic: &str) -> bool {
        self.topics.is_empty() || self.topics.contains(topic)
    }
}

/// Shared slot holding a socket's current registration.
pub(crate) type Slot = Arc<ArcSwapOption<Registration>>;

/// Handle to an installed listener.
///
/// Dropping the handle leaves the callback installed; it stays until it is
/// replaced, [detached](Self::detach), or its socket closes.
#[derive(Debug)]
pub struct ListenerHandle {
    socket: String,
    id: u64,
    slot: Slot,
    owner: Option<SocketHandle>,
}

impl ListenerHandle {
    pub(crate) fn new(
        socket: impl Into<String>,
        id: u64,
        slot: Slot,
        owner: Option<SocketHandle>,
    ) -> Self {
        Self {
            socket: socket.into(),
            id,
            slot,
            owner,
        }
    }

    /// Socket the listener is installed on.
    pub fn socket(&self) -> &str {
        &self.socket
    }

    /// Whether this handle's callback is still the installed one.
    pub fn is_active(&self) -> bool {
        matches!(&*self.slot.load(), Some(r) if r.id == self.id)
    }

    /// Remove the callback, unless another registration replaced it.
    ///
    /// Returns `true` when this call removed it.
    pub fn detach(self) -> bool {
        let current = self.slot.load();
        if !matches!(&*current, Some(r) if r.id == self.id) {
            return false;
        }
        let previous = self.slot.compare_and_swap(&current, None::<Arc<Registration>>);
        let removed = matches!(&*previous, Some(r) if r.id == self.id);
        if removed {
            if let Some(owner) = &self.owner {
                let _ = owner.entry().submit(Command::ClearListenerTopics);
            }
            info!(socket = %self.socket, "listener detached");
        }
        removed
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("id", &self.id)
            .field("topics", &self.topics)
            .finish_non_exhaustive()
    }
}

/// Static settings of one listener loop.
pub(crate) struct ListenerConfig {
    pub name: String,
    /// Subscriptions from the socket descriptor, never removed
    pub base_topics: Vec<String>,
    pub schemas: Arc<TopicSchemas>,
    pub wait_slice: Duration,
}

/// Messages read per wake-up before the inbox and abort flag are checked again.
const MAX_BATCH: usize = 256;

/// Wire subscriptions of one subscriber socket.
struct Subscriptions {
    base: HashSet<String>,
    extra: HashSet<String>,
}

impl Subscriptions {
    /// Apply a listener's topic set; an empty set subscribes to everything.
    fn replace<T: Transport>(&mut self, transport: &mut T, topics: Vec<String>) -> Result<()> {
        let wanted: HashSet<String> = if topics.is_empty() {
            HashSet::from_iter([String::new()])
        } else {
            topics.into_iter().collect()
        };
        for topic in wanted.difference(&self.extra) {
            if !self.base.contains(topic) {
                transport.subscribe(topic)?;
            }
        }
        for topic in self.extra.difference(&wanted) {
            if !self.base.contains(topic) {
                transport.unsubscribe(topic)?;
            }
        }
        self.extra = wanted;
        Ok(())
    }

    fn clear<T: Transport>(&mut self, transport: &mut T) -> Result<()> {
        for topic in self.extra.drain() {
            if !self.base.contains(&topic) {
                transport.unsubscribe(&topic)?;
            }
        }
        Ok(())
    }
}

/// Run the listener loop until the inbox disconnects or `abort` is raised.
pub(crate) fn run<T: Transport>(
    config: ListenerConfig,
    mut transport: T,
    inbox: flume::Receiver<Command>,
    slot: Slot,
    abort: Arc<AtomicBool>,
) {
    let ListenerConfig {
        name,
        base_topics,
        schemas,
        wait_slice,
    } = config;
    let mut subs = Subscriptions {
        base: base_topics.into_iter().collect(),
        extra: HashSet::new(),
    };

    info!(socket = %name, "listener loop started");
    'outer: loop {
        if abort.load(Ordering::Acquire) {
            break;
        }

        loop {
            match inbox.try_recv() {
                Ok(cmd) => apply(&name, &mut transport, &mut subs, cmd),
                Err(flume::TryRecvError::Empty) => break,
                Err(flume::TryRecvError::Disconnected) => break 'outer,
            }
        }

        match transport.wait_readable(wait_slice) {
            Ok(true) => {
                for _ in 0..MAX_BATCH {
                    match transport.try_recv() {
                        Ok(Some(frames)) => dispatch(&name, &schemas, &slot, &frames),
                        Ok(None) => break,
                        Err(e) => {
                            warn!(socket = %name, error = %e, "receive failed");
                            break;
                        }
                    }
                    if abort.load(Ordering::Acquire) {
                        break 'outer;
                    }
                }
            }
            Ok(false) => {}
            Err(e) => {
                warn!(socket = %name, error = %e, "wait failed");
                std::thread::sleep(wait_slice);
            }
        }
    }

    slot.store(None);
    info!(socket = %name, "listener loop stopped");
}

fn apply<T: Transport>(name: &str, transport: &mut T, subs: &mut Subscriptions, cmd: Command) {
    match cmd {
        Command::SetListenerTopics(topics) => match subs.replace(transport, topics) {
            Ok(()) => debug!(socket = %name, topics = ?subs.extra, "subscriptions updated"),
            Err(e) => warn!(socket = %name, error = %e, "subscription change failed"),
        },
        Command::ClearListenerTopics => match subs.clear(transport) {
            Ok(()) => debug!(socket = %name, "listener subscriptions cleared"),
            Err(e) => warn!(socket = %name, error = %e, "subscription change failed"),
        },
        Command::AdjustTimeouts { .. } => {
            debug!(socket = %name, "ignoring timeout adjustment on subscriber socket");
        }
        Command::Execute(task) => reject_task(name, task),
    }
}

fn reject_task(name: &str, task: Task) {
    warn!(socket = %name, kind = %task.kind(), "task submitted to subscriber socket");
    task.reject(FabricError::Configuration(ConfigError::Unsupported {
        socket: name.to_string(),
        pattern: "SUB".to_string(),
        operation: "tasks",
    }));
}

fn dispatch(name: &str, schemas: &TopicSchemas, slot: &Slot, frames: &[Bytes]) {
    if frames.len() < 2 {
        let err = DecodeError::Framing(format!(
            "expected [topic][payload], got {} frame(s)",
            frames.len()
        ));
        warn!(socket = %name, error = %err, "dropping message");
        return;
    }

    let Ok(topic) = std::str::from_utf8(&frames[0]) else {
        warn!(socket = %name, topic = %preview(&frames[0]), "dropping message with non-UTF-8 topic");
        return;
    };

    let Some(registration) = slot.load_full() else {
        trace!(socket = %name, topic, "no listener installed, dropping");
        return;
    };
    if !registration.accepts(topic) {
        trace!(socket = %name, topic, "topic not accepted by listener, dropping");
        return;
    }

    let payload = frames[1].clone();
    trace!(socket = %name, topic, payload = %preview(&payload), "dispatching");
    let decoded = match schemas.decode(topic, payload) {
        Ok(decoded) => decoded,
        Err(e) => {
            warn!(socket = %name, error = %e, "dropping undecodable message");
            return;
        }
    };

    if catch_unwind(AssertUnwindSafe(|| (registration.callback)(topic, decoded))).is_err() {
        error!(socket = %name, topic, "listener callback panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::scripted::ScriptedTransport;
    use parking_lot::Mutex;

    fn slot_with(topics: &[&str], seen: Arc<Mutex<Vec<String>>>) -> (Slot, u64) {
        let topics: Vec<String> = topics.iter().map(|t| t.to_string()).collect();
        let callback: Arc<Callback> = Arc::new(move |topic: &str, decoded: Decoded| {
            seen.lock().push(format!(
                "{topic}:{}",
                String::from_utf8_lossy(decoded.payload())
            ));
        });
        let registration = Arc::new(Registration::new(&topics, callback));
        let id = registration.id();
        (Arc::new(ArcSwapOption::new(Some(registration))), id)
    }

    fn schemas() -> TopicSchemas {
        TopicSchemas::new().with_raw("docker.status").with_raw("docker.statusx")
    }

    fn frames(topic: &'static [u8], payload: &'static [u8]) -> Vec<Bytes> {
        vec![Bytes::from_static(topic), Bytes::from_static(payload)]
    }

    #[test]
    fn test_exact_topic_delivery() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (slot, _) = slot_with(&["docker.status"], Arc::clone(&seen));
        let schemas = schemas();

        dispatch("s", &schemas, &slot, &frames(b"docker.status", b"1"));
        dispatch("s", &schemas, &slot, &frames(b"docker.statusx", b"2"));
        dispatch("s", &schemas, &slot, &frames(b"other", b"3"));
        dispatch("s", &schemas, &slot, &[Bytes::from_static(b"docker.status")]);

        assert_eq!(*seen.lock(), vec!["docker.status:1".to_string()]);
    }

    #[test]
    fn test_callback_panic_is_contained() {
        let callback: Arc<Callback> = Arc::new(|_: &str, _: Decoded| panic!("boom"));
        let slot: Slot = Arc::new(ArcSwapOption::new(Some(Arc::new(Registration::new(
            &[],
            callback,
        )))));
        dispatch("s", &schemas(), &slot, &frames(b"docker.status", b"x"));
    }

    #[test]
    fn test_undecodable_topic_is_dropped() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (slot, _) = slot_with(&[], Arc::clone(&seen));
        dispatch("s", &schemas(), &slot, &frames(b"unknown", b"x"));
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_detach_only_removes_own_registration() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (slot, first_id) = slot_with(&[], Arc::clone(&seen));
        let stale = ListenerHandle::new("s", first_id, Arc::clone(&slot), None);

        let replacement = Arc::new(Registration::new(&[], Arc::new(|_: &str, _: Decoded| {})));
        let second_id = replacement.id();
        slot.store(Some(replacement));

        assert!(!stale.is_active());
        assert!(!stale.detach());
        assert!(slot.load().is_some());

        let current = ListenerHandle::new("s", second_id, Arc::clone(&slot), None);
        assert!(current.is_active());
        assert!(current.detach());
        assert!(slot.load().is_none());
    }

    #[test]
    fn test_loop_delivers_and_manages_subscriptions() {
        let transport = ScriptedTransport::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (slot, _) = slot_with(&["docker.status"], Arc::clone(&seen));
        let (tx, rx) = flume::unbounded();
        let abort = Arc::new(AtomicBool::new(false));

        let config = ListenerConfig {
            name: "status-sub".into(),
            base_topics: vec!["docker.status".into()],
            schemas: Arc::new(schemas()),
            wait_slice: Duration::from_millis(10),
        };
        let loop_slot = Arc::clone(&slot);
        let loop_transport = transport.clone();
        let handle =
            std::thread::spawn(move || run(config, loop_transport, rx, loop_slot, abort));

        tx.send(Command::SetListenerTopics(vec!["docker.statusx".into()]))
            .unwrap();
        transport.push_incoming([&b"docker.status"[..], &b"up"[..]]);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while seen.lock().is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(*seen.lock(), vec!["docker.status:up".to_string()]);

        drop(tx);
        handle.join().unwrap();
        assert_eq!(
            transport.script.lock().subscriptions,
            vec!["docker.statusx".to_string()]
        );
        assert!(slot.load().is_none());
    }
}
