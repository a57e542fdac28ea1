//! Per-socket task state: the ready queue and the awaiting list.
//!
//! The coordinator owns every task a worker has pulled from its inbox. Tasks
//! wait in `ready` until their send leg runs, then in `awaiting` until a
//! message settles them. Incoming frames are routed to awaiting tasks by the
//! socket's [`FrameShape`]:
//!
//! - `Bare`: the last frame is the payload; the oldest awaiting task takes it.
//!   On ROUTER sockets the frames before it are kept as the reply envelope
//! - `TopicTagged`: `[topic][payload]`; the oldest task awaiting that topic takes it.
//!   A message no task awaits, or one without a topic frame, rejects the oldest
//!   awaiting task instead of being lost
//! - `Inferred`: like `Bare`, unless the first frame equals the oldest task's topic
//!   and another frame follows, in which case that next frame is the payload
//!
//! Nothing here blocks or sleeps; the worker decides when to call in.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use smallvec::smallvec;
use tracing::{debug, trace, warn};

use wharf_core::error::{DecodeError, FabricError};
use wharf_core::pattern::{FrameShape, SocketPattern};
use wharf_core::schema::TopicSchemas;
use wharf_core::task::{Task, TaskKind};

use crate::transport::{Frames, Transport};

/// Longest payload prefix shown in debug logs.
const PREVIEW_LEN: usize = 32;

pub(crate) fn preview(payload: &[u8]) -> String {
    hex::encode(&payload[..payload.len().min(PREVIEW_LEN)])
}

/// Ready queue, awaiting list and routing rules for one socket.
pub(crate) struct Coordinator {
    socket: String,
    shape: FrameShape,
    /// REQ sockets allow a single request in flight
    one_in_flight: bool,
    /// ROUTER sockets address every send to the last peer heard from
    routes_replies: bool,
    reply_envelope: Option<Frames>,
    schemas: Arc<TopicSchemas>,
    recv_window: Duration,
    ready: VecDeque<Task>,
    awaiting: VecDeque<Task>,
}

impl Coordinator {
    pub(crate) fn new(
        socket: impl Into<String>,
        pattern: SocketPattern,
        shape: FrameShape,
        schemas: Arc<TopicSchemas>,
        recv_window: Duration,
    ) -> Self {
        Self {
            socket: socket.into(),
            shape,
            one_in_flight: pattern == SocketPattern::Req,
            routes_replies: pattern == SocketPattern::Router,
            reply_envelope: None,
            schemas,
            recv_window,
            ready: VecDeque::new(),
            awaiting: VecDeque::new(),
        }
    }

    pub(crate) fn set_recv_window(&mut self, window: Duration) {
        self.recv_window = window;
    }

    /// Queue a task pulled from the inbox. Receives start waiting right away.
    pub(crate) fn enqueue(&mut self, mut task: Task, now: Instant) {
        debug!(socket = %self.socket, kind = %task.kind(), topic = task.topic(), "task queued");
        if task.kind() == TaskKind::Receive {
            task.open_window(now + self.recv_window);
            self.awaiting.push_back(task);
        } else {
            self.ready.push_back(task);
        }
    }

    pub(crate) fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub(crate) fn has_awaiting(&self) -> bool {
        !self.awaiting.is_empty()
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.ready.is_empty() && self.awaiting.is_empty()
    }

    fn request_in_flight(&self) -> bool {
        self.awaiting
            .iter()
            .any(|t| t.kind() == TaskKind::SendAndWait)
    }

    /// Run the task at the head of the ready queue.
    ///
    /// Tasks held back by backoff or by an in-flight request go to the back.
    pub(crate) fn step<T: Transport>(&mut self, transport: &mut T, now: Instant) {
        let Some(mut task) = self.ready.pop_front() else {
            return;
        };

        if task.is_abandoned() {
            debug!(socket = %self.socket, topic = task.topic(), "dropping abandoned request before send");
            return;
        }

        let held = !task.is_ready(now)
            || (task.kind() == TaskKind::SendAndWait
                && self.one_in_flight
                && self.request_in_flight());
        if held {
            self.ready.push_back(task);
            return;
        }

        match task.kind() {
            TaskKind::Send => match self.frame(&task).and_then(|f| transport.send_frames(&f)) {
                Ok(()) => {
                    debug!(socket = %self.socket, topic = task.topic(), payload = %preview(task.payload()), "sent");
                }
                Err(e) => {
                    warn!(socket = %self.socket, topic = task.topic(), error = %e, "send dropped");
                }
            },
            TaskKind::SendAndWait => match self.frame(&task).and_then(|f| transport.send_frames(&f)) {
                Ok(()) => {
                    task.mark_sent();
                    task.open_window(now + self.recv_window);
                    debug!(socket = %self.socket, topic = task.topic(), attempts = task.attempts(), "request sent, awaiting reply");
                    self.awaiting.push_back(task);
                }
                Err(e) => {
                    let attempts = task.record_failure();
                    if task.is_exhausted() {
                        warn!(socket = %self.socket, attempts, error = %e, "request send retries exhausted");
                        let socket = self.socket.clone();
                        task.reject(FabricError::RetriesExhausted { socket, attempts });
                    } else {
                        let delay = task.policy().delay_for(attempts);
                        debug!(socket = %self.socket, attempts, ?delay, error = %e, "request send failed, will retry");
                        task.defer_until(now + delay);
                        self.ready.push_back(task);
                    }
                }
            },
            TaskKind::Receive => {
                task.open_window(now + self.recv_window);
                self.awaiting.push_back(task);
            }
        }
    }

    fn frame(&self, task: &Task) -> Result<Frames, FabricError> {
        let topic = || Bytes::copy_from_slice(task.topic().as_bytes());
        let body: Frames = match (self.shape, task.kind()) {
            (FrameShape::Bare, _) | (FrameShape::Inferred, TaskKind::SendAndWait) => {
                smallvec![task.payload().clone()]
            }
            (FrameShape::TopicTagged, _) | (FrameShape::Inferred, _) => {
                smallvec![topic(), task.payload().clone()]
            }
        };
        if !self.routes_replies {
            return Ok(body);
        }
        let Some(envelope) = &self.reply_envelope else {
            return Err(FabricError::send_failure(
                &self.socket,
                "no peer has written to this socket yet",
            ));
        };
        let mut frames = envelope.clone();
        frames.extend(body);
        Ok(frames)
    }

    /// Route one incoming message to the awaiting task it answers.
    pub(crate) fn on_message(&mut self, frames: Frames) {
        let Some(last) = frames.last() else {
            return;
        };

        let routed = match self.shape {
            FrameShape::Bare => {
                if self.routes_replies && frames.len() > 1 {
                    self.reply_envelope = Some(frames[..frames.len() - 1].iter().cloned().collect());
                }
                let payload = last.clone();
                self.awaiting.pop_front().map(|t| (t, payload))
            }
            FrameShape::TopicTagged => {
                if frames.len() < 2 {
                    let error = DecodeError::Framing(format!(
                        "expected [topic][payload], got {} frame(s)",
                        frames.len()
                    ));
                    self.reject_oldest(error);
                    return;
                }
                let payload = frames[1].clone();
                let index = self
                    .awaiting
                    .iter()
                    .position(|t| t.topic().as_bytes() == &frames[0][..]);
                match index {
                    Some(i) => self.awaiting.remove(i).map(|t| (t, payload)),
                    None => {
                        let received = String::from_utf8_lossy(&frames[0]).into_owned();
                        let expected = self
                            .awaiting
                            .front()
                            .map(|t| t.topic().to_string())
                            .unwrap_or_default();
                        self.reject_oldest(DecodeError::TopicMismatch { expected, received });
                        return;
                    }
                }
            }
            FrameShape::Inferred => self.awaiting.pop_front().map(|t| {
                let payload = if frames.len() >= 2 && t.topic().as_bytes() == &frames[0][..] {
                    frames[1].clone()
                } else {
                    frames[0].clone()
                };
                (t, payload)
            }),
        };

        let Some((mut task, payload)) = routed else {
            debug!(socket = %self.socket, "message with no awaiting task, dropping");
            return;
        };

        trace!(socket = %self.socket, topic = task.topic(), payload = %preview(&payload), "reply routed");
        let outcome = self
            .schemas
            .decode(task.topic(), payload)
            .map_err(FabricError::from);
        if let Err(e) = &outcome {
            warn!(socket = %self.socket, error = %e, "reply rejected");
        }
        if let Some(completer) = task.take_completer() {
            completer.settle(outcome);
        }
    }

    /// Settle the oldest awaiting task with a message it cannot use.
    fn reject_oldest(&mut self, error: DecodeError) {
        let Some(task) = self.awaiting.pop_front() else {
            debug!(socket = %self.socket, error = %error, "message with no awaiting task, dropping");
            return;
        };
        warn!(socket = %self.socket, topic = task.topic(), error = %error, "message rejected");
        task.reject(FabricError::from(error));
    }

    /// Handle receive windows that elapsed by `now`.
    ///
    /// A request whose window was empty counts a failed attempt and waits
    /// again, or is rejected once its policy is used up. Abandoned receives
    /// are dropped; abandoned requests keep waiting so a late reply cannot be
    /// routed to the next request, except on REQ sockets where libzmq already
    /// discards replies to superseded requests.
    pub(crate) fn expire_windows(&mut self, now: Instant) {
        let mut kept = VecDeque::with_capacity(self.awaiting.len());
        while let Some(mut task) = self.awaiting.pop_front() {
            let elapsed = task.window_ends().map_or(true, |end| end <= now);
            if !elapsed {
                kept.push_back(task);
                continue;
            }

            let abandoned = task.is_abandoned();
            match task.kind() {
                TaskKind::Receive if abandoned => {
                    debug!(socket = %self.socket, topic = task.topic(), "dropping abandoned receive");
                }
                TaskKind::SendAndWait if abandoned && self.one_in_flight => {
                    debug!(socket = %self.socket, topic = task.topic(), "dropping abandoned request");
                }
                TaskKind::SendAndWait => {
                    let attempts = task.record_failure();
                    if task.is_exhausted() {
                        warn!(socket = %self.socket, attempts, "no reply, retries exhausted");
                        let socket = self.socket.clone();
                        task.reject(FabricError::RetriesExhausted { socket, attempts });
                    } else {
                        trace!(socket = %self.socket, attempts, "receive window elapsed, still waiting");
                        task.open_window(now + self.recv_window);
                        kept.push_back(task);
                    }
                }
                _ => {
                    task.open_window(now + self.recv_window);
                    kept.push_back(task);
                }
            }
        }
        self.awaiting = kept;
    }

    /// Earliest instant something needs attention: a window end or a deferred send.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        let windows = self.awaiting.iter().filter_map(Task::window_ends);
        let deferred = self.ready.iter().filter_map(Task::not_before);
        windows.chain(deferred).min()
    }

    /// How long the worker may block, given its wait slice.
    pub(crate) fn wait_budget(&self, now: Instant, slice: Duration) -> Duration {
        self.next_deadline()
            .map_or(slice, |at| at.saturating_duration_since(now).min(slice))
    }

    /// Reject every task still held.
    pub(crate) fn reject_all(&mut self, error: &FabricError) {
        let count = self.ready.len() + self.awaiting.len();
        if count > 0 {
            debug!(socket = %self.socket, count, "rejecting outstanding tasks");
        }
        for task in self.ready.drain(..).chain(self.awaiting.drain(..)) {
            task.reject(error.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::scripted::ScriptedTransport;
    use wharf_core::error::DecodeError;
    use wharf_core::retry::RetryPolicy;

    fn schemas() -> Arc<TopicSchemas> {
        Arc::new(TopicSchemas::new().with_raw("").with_raw("a").with_raw("b"))
    }

    fn coordinator(pattern: SocketPattern) -> Coordinator {
        Coordinator::new(
            "test",
            pattern,
            pattern.default_frame_shape(),
            schemas(),
            Duration::from_millis(50),
        )
    }

    #[test]
    fn test_sends_keep_order_and_shape() {
        let mut coord = coordinator(SocketPattern::Push);
        let mut transport = ScriptedTransport::default();
        let now = Instant::now();
        for i in 0..3u8 {
            coord.enqueue(Task::send("a", vec![i]), now);
        }
        while coord.ready_len() > 0 {
            coord.step(&mut transport, now);
        }
        let sent = transport.sent();
        assert_eq!(sent.len(), 3);
        for (i, frames) in sent.iter().enumerate() {
            assert_eq!(&frames[0][..], b"a");
            assert_eq!(&frames[1][..], &[i as u8]);
        }
        assert!(coord.is_idle());
    }

    #[test]
    fn test_request_resolves_on_bare_reply() {
        let mut coord = coordinator(SocketPattern::Req);
        let mut transport = ScriptedTransport::default();
        let now = Instant::now();
        let (task, reply) = Task::send_and_wait("test", "", &b"ping"[..], RetryPolicy::default());
        coord.enqueue(task, now);
        coord.step(&mut transport, now);

        assert_eq!(transport.sent(), vec![vec![Bytes::from_static(b"ping")]]);
        assert!(coord.has_awaiting());

        coord.on_message(smallvec![Bytes::from_static(b"pong")]);
        assert_eq!(reply.try_take().unwrap().unwrap().payload().as_ref(), b"pong");
        assert!(coord.is_idle());
    }

    #[test]
    fn test_send_failure_is_retried_then_exhausted() {
        let mut coord = coordinator(SocketPattern::Dealer);
        let mut transport = ScriptedTransport::default();
        transport.script.lock().fail_sends = 5;
        let now = Instant::now();
        let (task, reply) = Task::send_and_wait("test", "", &b"x"[..], RetryPolicy::bounded(3));
        coord.enqueue(task, now);

        coord.step(&mut transport, now);
        assert!(reply.try_take().is_none());
        coord.step(&mut transport, now);
        coord.step(&mut transport, now);

        let err = reply.try_take().unwrap().unwrap_err();
        assert_eq!(
            err,
            FabricError::RetriesExhausted {
                socket: "test".into(),
                attempts: 3
            }
        );
        assert!(coord.is_idle());
    }

    #[test]
    fn test_send_backoff_defers_retry() {
        let mut coord = coordinator(SocketPattern::Dealer);
        let mut transport = ScriptedTransport::default();
        transport.script.lock().fail_sends = 1;
        let now = Instant::now();
        let policy = RetryPolicy::unbounded()
            .with_backoff(Duration::from_millis(100), Duration::from_secs(1));
        let (task, _reply) = Task::send_and_wait("test", "", &b"x"[..], policy);
        coord.enqueue(task, now);

        coord.step(&mut transport, now);
        assert_eq!(coord.next_deadline(), Some(now + Duration::from_millis(100)));

        coord.step(&mut transport, now + Duration::from_millis(10));
        assert!(transport.sent().is_empty());

        coord.step(&mut transport, now + Duration::from_millis(100));
        assert_eq!(transport.sent().len(), 1);
        assert!(coord.has_awaiting());
    }

    #[test]
    fn test_silent_peer_keeps_one_pending_task() {
        let mut coord = coordinator(SocketPattern::Dealer);
        let mut transport = ScriptedTransport::default();
        let mut now = Instant::now();
        let (task, reply) = Task::send_and_wait("test", "", &b"x"[..], RetryPolicy::default());
        coord.enqueue(task, now);
        coord.step(&mut transport, now);

        for _ in 0..10 {
            now += Duration::from_millis(60);
            coord.expire_windows(now);
        }
        assert!(reply.try_take().is_none());
        assert!(coord.has_awaiting());
        assert_eq!(coord.ready_len(), 0);
        assert_eq!(transport.sent().len(), 1);
    }

    #[test]
    fn test_empty_windows_exhaust_bounded_policy() {
        let mut coord = coordinator(SocketPattern::Dealer);
        let mut transport = ScriptedTransport::default();
        let mut now = Instant::now();
        let (task, reply) = Task::send_and_wait("test", "", &b"x"[..], RetryPolicy::bounded(2));
        coord.enqueue(task, now);
        coord.step(&mut transport, now);

        now += Duration::from_millis(60);
        coord.expire_windows(now);
        assert!(reply.try_take().is_none());
        now += Duration::from_millis(60);
        coord.expire_windows(now);
        assert!(matches!(
            reply.try_take(),
            Some(Err(FabricError::RetriesExhausted { attempts: 2, .. }))
        ));
    }

    #[test]
    fn test_req_holds_second_request() {
        let mut coord = coordinator(SocketPattern::Req);
        let mut transport = ScriptedTransport::default();
        let now = Instant::now();
        let (first, first_reply) = Task::send_and_wait("test", "", &b"1"[..], RetryPolicy::default());
        let (second, second_reply) = Task::send_and_wait("test", "", &b"2"[..], RetryPolicy::default());
        coord.enqueue(first, now);
        coord.enqueue(second, now);

        coord.step(&mut transport, now);
        coord.step(&mut transport, now);
        assert_eq!(transport.sent().len(), 1);

        coord.on_message(smallvec![Bytes::from_static(b"r1")]);
        coord.step(&mut transport, now);
        assert_eq!(transport.sent().len(), 2);
        coord.on_message(smallvec![Bytes::from_static(b"r2")]);

        assert_eq!(first_reply.wait().unwrap().payload().as_ref(), b"r1");
        assert_eq!(second_reply.wait().unwrap().payload().as_ref(), b"r2");
    }

    #[test]
    fn test_topic_tagged_routing() {
        let mut coord = coordinator(SocketPattern::Pull);
        let now = Instant::now();
        let (task_a, reply_a) = Task::receive("test", "a");
        let (task_b, reply_b) = Task::receive("test", "b");
        coord.enqueue(task_a, now);
        coord.enqueue(task_b, now);

        coord.on_message(smallvec![Bytes::from_static(b"b"), Bytes::from_static(b"for-b")]);
        assert!(reply_a.try_take().is_none());
        assert_eq!(reply_b.try_take().unwrap().unwrap().payload().as_ref(), b"for-b");

        coord.on_message(smallvec![Bytes::from_static(b"a"), Bytes::from_static(b"for-a")]);
        assert_eq!(reply_a.try_take().unwrap().unwrap().topic(), "a");
        assert!(coord.is_idle());
    }

    #[test]
    fn test_unawaited_topic_rejects_oldest_receive() {
        let mut coord = coordinator(SocketPattern::Pull);
        let now = Instant::now();
        let (task_a, reply_a) = Task::receive("test", "a");
        let (task_a2, reply_a2) = Task::receive("test", "a");
        coord.enqueue(task_a, now);
        coord.enqueue(task_a2, now);

        coord.on_message(smallvec![Bytes::from_static(b"b"), Bytes::from_static(b"for-b")]);
        assert_eq!(
            reply_a.try_take().unwrap().unwrap_err(),
            FabricError::Decode(DecodeError::TopicMismatch {
                expected: "a".into(),
                received: "b".into(),
            })
        );
        assert!(reply_a2.try_take().is_none());

        coord.on_message(smallvec![Bytes::from_static(b"only-one-frame")]);
        assert!(matches!(
            reply_a2.try_take(),
            Some(Err(FabricError::Decode(DecodeError::Framing(_))))
        ));
        assert!(coord.is_idle());

        // Nothing left to settle: the message is dropped.
        coord.on_message(smallvec![Bytes::from_static(b"b"), Bytes::from_static(b"late")]);
        assert!(coord.is_idle());
    }

    #[test]
    fn test_router_replies_to_last_sender() {
        let mut coord = coordinator(SocketPattern::Router);
        let mut transport = ScriptedTransport::default();
        let now = Instant::now();

        coord.enqueue(Task::send("", &b"too-early"[..]), now);
        coord.step(&mut transport, now);
        assert!(transport.sent().is_empty());

        let (task, request) = Task::receive("test", "");
        coord.enqueue(task, now);
        coord.on_message(smallvec![Bytes::from_static(b"peer-1"), Bytes::from_static(b"ping")]);
        assert_eq!(request.try_take().unwrap().unwrap().payload().as_ref(), b"ping");

        coord.enqueue(Task::send("", &b"pong"[..]), now);
        coord.step(&mut transport, now);
        assert_eq!(
            transport.sent(),
            vec![vec![Bytes::from_static(b"peer-1"), Bytes::from_static(b"pong")]]
        );
    }

    #[test]
    fn test_inferred_heuristic() {
        let mut coord = Coordinator::new(
            "test",
            SocketPattern::Dealer,
            FrameShape::Inferred,
            schemas(),
            Duration::from_millis(50),
        );
        let mut transport = ScriptedTransport::default();
        let now = Instant::now();

        let (task, reply) = Task::send_and_wait("test", "a", &b"q"[..], RetryPolicy::default());
        coord.enqueue(task, now);
        coord.step(&mut transport, now);
        assert_eq!(transport.sent()[0].len(), 1);
        coord.on_message(smallvec![Bytes::from_static(b"a"), Bytes::from_static(b"tagged")]);
        assert_eq!(reply.wait().unwrap().payload().as_ref(), b"tagged");

        let (task, reply) = Task::send_and_wait("test", "a", &b"q"[..], RetryPolicy::default());
        coord.enqueue(task, now);
        coord.step(&mut transport, now);
        coord.on_message(smallvec![Bytes::from_static(b"bare"), Bytes::from_static(b"x")]);
        assert_eq!(reply.wait().unwrap().payload().as_ref(), b"bare");
    }

    #[test]
    fn test_unknown_topic_rejects_reply() {
        let mut coord = coordinator(SocketPattern::Dealer);
        let mut transport = ScriptedTransport::default();
        let now = Instant::now();
        let (task, reply) =
            Task::send_and_wait("test", "docker.status", &b"{}"[..], RetryPolicy::default());
        coord.enqueue(task, now);
        coord.step(&mut transport, now);
        coord.on_message(smallvec![Bytes::from_static(b"{}")]);

        let err = reply.wait().unwrap_err();
        assert_eq!(
            err,
            FabricError::Decode(DecodeError::UnknownTopic("docker.status".into()))
        );
    }

    #[test]
    fn test_abandoned_receive_is_dropped() {
        let mut coord = coordinator(SocketPattern::Pull);
        let now = Instant::now();
        let (task, reply) = Task::receive("test", "a");
        coord.enqueue(task, now);
        drop(reply);
        coord.expire_windows(now + Duration::from_millis(60));
        assert!(coord.is_idle());
    }

    #[test]
    fn test_reject_all() {
        let mut coord = coordinator(SocketPattern::Dealer);
        let now = Instant::now();
        let (task, reply) = Task::send_and_wait("test", "", &b"x"[..], RetryPolicy::default());
        let (recv, recv_reply) = Task::receive("test", "");
        coord.enqueue(task, now);
        coord.enqueue(recv, now);
        coord.reject_all(&FabricError::Closed("test".into()));
        assert!(reply.wait().unwrap_err().is_closed());
        assert!(recv_reply.wait().unwrap_err().is_closed());
        assert!(coord.is_idle());
    }

    #[test]
    fn test_wait_budget() {
        let coord = coordinator(SocketPattern::Pull);
        let now = Instant::now();
        assert_eq!(
            coord.wait_budget(now, Duration::from_millis(100)),
            Duration::from_millis(100)
        );

        let mut coord = coord;
        let (task, _reply) = Task::receive("test", "a");
        coord.enqueue(task, now);
        assert_eq!(
            coord.wait_budget(now, Duration::from_millis(100)),
            Duration::from_millis(50)
        );
    }
}
