//! Tasks: the units of work queued against a socket.
//!
//! A task's kind never changes. Only request tasks move through phases:
//!
//! ```text
//! Send ──send ok──▶ AwaitingReply ──reply──▶ settled
//!   ▲   │                 │
//!   └───┘ send failed     └── window elapsed: keep waiting (or give up per policy)
//! ```

use std::fmt;
use std::time::Instant;

use bytes::Bytes;

use crate::error::FabricError;
use crate::reply::{self, Completer, Reply};
use crate::retry::RetryPolicy;

/// What a task does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Fire-and-forget send
    Send,
    /// Wait for one message
    Receive,
    /// Send, then wait for the correlated reply
    SendAndWait,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Send => f.write_str("send"),
            Self::Receive => f.write_str("receive"),
            Self::SendAndWait => f.write_str("send-and-wait"),
        }
    }
}

/// Sub-state of a request task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// The send leg has not succeeded yet
    Send,
    /// The send leg succeeded; waiting for the reply
    AwaitingReply,
}

/// One queued unit of work targeting a specific socket.
#[derive(Debug)]
pub struct Task {
    kind: TaskKind,
    topic: String,
    payload: Bytes,
    phase: Phase,
    completer: Option<Completer>,
    policy: RetryPolicy,
    attempts: u32,
    not_before: Option<Instant>,
    window_ends: Option<Instant>,
}

impl Task {
    fn build(kind: TaskKind, topic: String, payload: Bytes, completer: Option<Completer>) -> Self {
        let phase = match kind {
            TaskKind::Receive => Phase::AwaitingReply,
            TaskKind::Send | TaskKind::SendAndWait => Phase::Send,
        };
        Self {
            kind,
            topic,
            payload,
            phase,
            completer,
            policy: RetryPolicy::default(),
            attempts: 0,
            not_before: None,
            window_ends: None,
        }
    }

    /// Fire-and-forget send of `payload` under `topic`.
    pub fn send(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self::build(TaskKind::Send, topic.into(), payload.into(), None)
    }

    /// Receive one message decoded under `topic`.
    pub fn receive(socket: &str, topic: impl Into<String>) -> (Self, Reply) {
        let (completer, reply) = reply::channel(socket);
        let task = Self::build(TaskKind::Receive, topic.into(), Bytes::new(), Some(completer));
        (task, reply)
    }

    /// Send `payload` and wait for the reply, decoded under `topic`.
    pub fn send_and_wait(
        socket: &str,
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        policy: RetryPolicy,
    ) -> (Self, Reply) {
        let (completer, reply) = reply::channel(socket);
        let mut task = Self::build(
            TaskKind::SendAndWait,
            topic.into(),
            payload.into(),
            Some(completer),
        );
        task.policy = policy;
        (task, reply)
    }

    /// Task kind.
    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    /// Topic the task sends under and decodes with.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Payload to send (empty for receives).
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Retry policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Failed attempts so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether this task is waiting for an incoming message.
    pub fn is_awaiting(&self) -> bool {
        self.phase == Phase::AwaitingReply
    }

    /// The send leg went out; move to `AwaitingReply`.
    pub fn mark_sent(&mut self) {
        debug_assert_eq!(self.kind, TaskKind::SendAndWait);
        self.phase = Phase::AwaitingReply;
        self.not_before = None;
    }

    /// Record one failed attempt and return the new count.
    pub fn record_failure(&mut self) -> u32 {
        self.attempts = self.attempts.saturating_add(1);
        self.attempts
    }

    /// Whether the retry policy is used up.
    pub fn is_exhausted(&self) -> bool {
        self.policy.is_exhausted(self.attempts)
    }

    /// Earliest instant the next send attempt may run.
    pub fn not_before(&self) -> Option<Instant> {
        self.not_before
    }

    /// Hold the next send attempt until `at`.
    pub fn defer_until(&mut self, at: Instant) {
        self.not_before = Some(at);
    }

    /// Whether the task may run at `now`.
    pub fn is_ready(&self, now: Instant) -> bool {
        self.not_before.map_or(true, |at| at <= now)
    }

    /// End of the current receive window.
    pub fn window_ends(&self) -> Option<Instant> {
        self.window_ends
    }

    /// Start a new receive window ending at `at`.
    pub fn open_window(&mut self, at: Instant) {
        self.window_ends = Some(at);
    }

    /// True once the caller dropped the reply.
    pub fn is_abandoned(&self) -> bool {
        self.completer.as_ref().is_some_and(Completer::is_abandoned)
    }

    /// Take the completer to settle the task.
    pub fn take_completer(&mut self) -> Option<Completer> {
        self.completer.take()
    }

    /// Reject the task's reply, if it has one.
    pub fn reject(mut self, error: FabricError) {
        if let Some(completer) = self.completer.take() {
            completer.reject(error);
        }
    }
}
