//! Task-driven driver thread.
//!
//! Each non-subscriber socket gets one worker thread that owns the socket and
//! executes its tasks strictly in order. One iteration:
//!
//! 1. drain the inbox into the coordinator
//! 2. run every task that is ready, checking the abort flag between tasks
//! 3. if tasks are awaiting a message, wait on the socket for at most one
//!    wait slice (or until the nearest receive window ends), route what
//!    arrived, then expire elapsed windows
//! 4. otherwise block on the inbox for at most one wait slice
//!
//! The worker exits once its inbox is disconnected and nothing is left, or
//! as soon as the abort flag is raised. Whatever it still holds on exit is
//! rejected with [`FabricError::Closed`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use wharf_core::error::FabricError;
use wharf_core::pattern::{FrameShape, SocketPattern};
use wharf_core::schema::TopicSchemas;
use wharf_core::task::Task;

use crate::coordinator::Coordinator;
use crate::transport::Transport;

/// Messages handled by a socket's driver thread, in arrival order.
#[derive(Debug)]
pub(crate) enum Command {
    /// Queue a task (worker sockets only)
    Execute(Task),
    /// Retune the socket's receive window and send timeout
    AdjustTimeouts { recv: Duration, send: Duration },
    /// Replace the listener's subscriptions; empty subscribes to everything (subscriber sockets only)
    SetListenerTopics(Vec<String>),
    /// Drop the listener's subscriptions (subscriber sockets only)
    ClearListenerTopics,
}

/// Messages read off the socket per wake-up before the inbox is checked again.
const MAX_BATCH: usize = 256;

/// Static settings of one worker.
pub(crate) struct WorkerConfig {
    pub name: String,
    pub pattern: SocketPattern,
    pub shape: FrameShape,
    pub schemas: Arc<TopicSchemas>,
    pub recv_window: Duration,
    pub wait_slice: Duration,
}

enum Inbox {
    Open,
    Disconnected,
}

/// Drive `transport` from `inbox` until disconnected and idle, or aborted.
pub(crate) fn run<T: Transport>(
    config: WorkerConfig,
    mut transport: T,
    inbox: flume::Receiver<Command>,
    abort: Arc<AtomicBool>,
) {
    let WorkerConfig {
        name,
        pattern,
        shape,
        schemas,
        recv_window,
        wait_slice,
    } = config;

    info!(socket = %name, %pattern, ?shape, "worker started");
    let mut coord = Coordinator::new(name.clone(), pattern, shape, schemas, recv_window);
    let mut state = Inbox::Open;

    'outer: loop {
        if abort.load(Ordering::Acquire) {
            break;
        }

        loop {
            match inbox.try_recv() {
                Ok(cmd) => apply(&name, &mut coord, &mut transport, cmd),
                Err(flume::TryRecvError::Empty) => break,
                Err(flume::TryRecvError::Disconnected) => {
                    state = Inbox::Disconnected;
                    break;
                }
            }
        }

        let now = Instant::now();
        for _ in 0..coord.ready_len() {
            if abort.load(Ordering::Acquire) {
                break 'outer;
            }
            coord.step(&mut transport, now);
        }

        if coord.has_awaiting() {
            let budget = coord.wait_budget(Instant::now(), wait_slice);
            match transport.wait_readable(budget) {
                Ok(true) => {
                    for _ in 0..MAX_BATCH {
                        match transport.try_recv() {
                            Ok(Some(frames)) => coord.on_message(frames),
                            Ok(None) => break,
                            Err(e) => {
                                warn!(socket = %name, error = %e, "receive failed");
                                break;
                            }
                        }
                        if !coord.has_awaiting() {
                            break;
                        }
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(socket = %name, error = %e, "wait failed");
                    std::thread::sleep(budget);
                }
            }
            coord.expire_windows(Instant::now());
            continue;
        }

        match state {
            Inbox::Disconnected if coord.is_idle() => break,
            Inbox::Disconnected => {
                // Only deferred sends are left.
                std::thread::sleep(coord.wait_budget(Instant::now(), wait_slice));
            }
            Inbox::Open => {
                let budget = coord.wait_budget(Instant::now(), wait_slice);
                match inbox.recv_timeout(budget) {
                    Ok(cmd) => apply(&name, &mut coord, &mut transport, cmd),
                    Err(flume::RecvTimeoutError::Timeout) => {}
                    Err(flume::RecvTimeoutError::Disconnected) => state = Inbox::Disconnected,
                }
            }
        }
    }

    coord.reject_all(&FabricError::Closed(name.clone()));
    if abort.load(Ordering::Acquire) {
        info!(socket = %name, "worker aborted");
    } else {
        info!(socket = %name, "worker drained");
    }
}

fn apply<T: Transport>(name: &str, coord: &mut Coordinator, transport: &mut T, cmd: Command) {
    match cmd {
        Command::Execute(task) => coord.enqueue(task, Instant::now()),
        Command::AdjustTimeouts { recv, send } => match transport.set_timeouts(recv, send) {
            Ok(()) => {
                coord.set_recv_window(recv);
                debug!(socket = %name, ?recv, ?send, "timeouts adjusted");
            }
            Err(e) => warn!(socket = %name, error = %e, "timeout adjustment failed"),
        },
        Command::SetListenerTopics(_) | Command::ClearListenerTopics => {
            debug!(socket = %name, "ignoring subscription change on task-driven socket");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::scripted::ScriptedTransport;
    use bytes::Bytes;
    use wharf_core::retry::RetryPolicy;

    fn spawn(
        pattern: SocketPattern,
        transport: ScriptedTransport,
    ) -> (
        flume::Sender<Command>,
        Arc<AtomicBool>,
        std::thread::JoinHandle<()>,
    ) {
        let (tx, rx) = flume::unbounded();
        let abort = Arc::new(AtomicBool::new(false));
        let config = WorkerConfig {
            name: "w".into(),
            pattern,
            shape: pattern.default_frame_shape(),
            schemas: Arc::new(TopicSchemas::new().with_raw("").with_raw("jobs")),
            recv_window: Duration::from_millis(30),
            wait_slice: Duration::from_millis(10),
        };
        let flag = Arc::clone(&abort);
        let handle = std::thread::spawn(move || run(config, transport, rx, flag));
        (tx, abort, handle)
    }

    #[test]
    fn test_drains_then_exits_on_disconnect() {
        let transport = ScriptedTransport::default();
        let (tx, _abort, handle) = spawn(SocketPattern::Push, transport.clone());
        for i in 0..100u32 {
            tx.send(Command::Execute(Task::send("jobs", i.to_be_bytes().to_vec())))
                .unwrap();
        }
        drop(tx);
        handle.join().unwrap();

        let sent = transport.sent();
        assert_eq!(sent.len(), 100);
        for (i, frames) in sent.iter().enumerate() {
            assert_eq!(&frames[1][..], &(i as u32).to_be_bytes());
        }
    }

    #[test]
    fn test_request_reply_through_worker() {
        let transport = ScriptedTransport::default();
        let (tx, _abort, handle) = spawn(SocketPattern::Req, transport.clone());

        let (task, reply) = Task::send_and_wait("w", "", &b"ping"[..], RetryPolicy::default());
        tx.send(Command::Execute(task)).unwrap();
        while transport.sent().is_empty() {
            std::thread::sleep(Duration::from_millis(1));
        }
        transport.push_incoming([&b"pong"[..]]);

        let message = reply.wait_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(message.payload().as_ref(), b"pong");
        drop(tx);
        handle.join().unwrap();
    }

    #[test]
    fn test_abort_rejects_pending() {
        let transport = ScriptedTransport::default();
        let (tx, abort, handle) = spawn(SocketPattern::Dealer, transport);

        let (task, reply) = Task::send_and_wait("w", "", &b"x"[..], RetryPolicy::default());
        tx.send(Command::Execute(task)).unwrap();
        assert!(reply.wait_timeout(Duration::from_millis(100)).is_err());

        abort.store(true, Ordering::Release);
        handle.join().unwrap();
        assert!(reply.wait().unwrap_err().is_closed());
    }

    #[test]
    fn test_adjust_timeouts() {
        let transport = ScriptedTransport::default();
        let (tx, _abort, handle) = spawn(SocketPattern::Push, transport.clone());
        tx.send(Command::AdjustTimeouts {
            recv: Duration::from_millis(500),
            send: Duration::from_millis(20),
        })
        .unwrap();
        drop(tx);
        handle.join().unwrap();
        assert_eq!(
            transport.script.lock().timeouts,
            Some((Duration::from_millis(500), Duration::from_millis(20)))
        );
    }

    #[test]
    fn test_receive_waits_for_message() {
        let transport = ScriptedTransport::default();
        let (tx, _abort, handle) = spawn(SocketPattern::Pull, transport.clone());
        let (task, reply) = Task::receive("w", "jobs");
        tx.send(Command::Execute(task)).unwrap();

        std::thread::sleep(Duration::from_millis(80));
        assert!(reply.try_take().is_none());

        transport.push_incoming([&b"jobs"[..], &b"42"[..]]);
        assert_eq!(
            reply
                .wait_timeout(Duration::from_secs(5))
                .unwrap()
                .payload()
                .as_ref(),
            b"42"
        );
        drop(tx);
        handle.join().unwrap();
    }
}
