//! Reply promises.
//!
//! A [`Reply`] is the caller's end of a one-shot channel; the worker that owns
//! the task holds the matching [`Completer`]. The fabric never times a reply
//! out on its own: bounding the wait is the caller's job, through
//! [`Reply::wait_timeout`] or by racing the future against a timer.

use std::future::IntoFuture;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::{FabricError, Result};
use crate::schema::Decoded;

type Outcome = Result<Decoded>;

/// Create a linked completer/reply pair for a task on `socket`.
pub fn channel(socket: impl Into<String>) -> (Completer, Reply) {
    let (tx, rx) = flume::bounded(1);
    (
        Completer { tx },
        Reply {
            rx,
            socket: socket.into(),
        },
    )
}

/// Worker-side handle that settles a reply exactly once.
#[derive(Debug)]
pub struct Completer {
    tx: flume::Sender<Outcome>,
}

impl Completer {
    /// Resolve the reply with a decoded message.
    pub fn resolve(self, message: Decoded) {
        let _ = self.tx.send(Ok(message));
    }

    /// Reject the reply.
    pub fn reject(self, error: FabricError) {
        let _ = self.tx.send(Err(error));
    }

    /// Settle with whatever the decode produced.
    pub fn settle(self, outcome: Outcome) {
        let _ = self.tx.send(outcome);
    }

    /// True once the caller dropped its [`Reply`].
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_disconnected()
    }
}

/// Caller-side promise for the outcome of a receive or request task.
///
/// A completer dropped without settling (its socket was torn down) surfaces
/// as [`FabricError::Closed`].
#[derive(Debug)]
pub struct Reply {
    rx: flume::Receiver<Outcome>,
    socket: String,
}

impl Reply {
    /// Socket the task runs on.
    pub fn socket(&self) -> &str {
        &self.socket
    }

    /// Block until the task settles.
    pub fn wait(&self) -> Outcome {
        self.rx
            .recv()
            .unwrap_or_else(|_| Err(FabricError::Closed(self.socket.clone())))
    }

    /// Block until the task settles or `deadline` elapses.
    ///
    /// On [`FabricError::DeadlineElapsed`] the task is still pending and the
    /// reply can be waited on again.
    pub fn wait_timeout(&self, deadline: Duration) -> Outcome {
        match self.rx.recv_timeout(deadline) {
            Ok(outcome) => outcome,
            Err(flume::RecvTimeoutError::Timeout) => Err(FabricError::DeadlineElapsed(deadline)),
            Err(flume::RecvTimeoutError::Disconnected) => {
                Err(FabricError::Closed(self.socket.clone()))
            }
        }
    }

    /// Take the outcome if the task already settled.
    pub fn try_take(&self) -> Option<Outcome> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(flume::TryRecvError::Empty) => None,
            Err(flume::TryRecvError::Disconnected) => {
                Some(Err(FabricError::Closed(self.socket.clone())))
            }
        }
    }
}

impl IntoFuture for Reply {
    type Output = Outcome;
    type IntoFuture = BoxFuture<'static, Outcome>;

    fn into_future(self) -> Self::IntoFuture {
        let socket = self.socket;
        self.rx
            .into_recv_async()
            .map(move |res| res.unwrap_or_else(|_| Err(FabricError::Closed(socket))))
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::TopicSchemas;
    use bytes::Bytes;

    fn decoded(body: &'static [u8]) -> Decoded {
        TopicSchemas::new()
            .with_raw("")
            .decode("", Bytes::from_static(body))
            .unwrap()
    }

    #[test]
    fn test_resolve_then_wait() {
        let (completer, reply) = channel("cmd-req");
        completer.resolve(decoded(b"pong"));
        assert_eq!(reply.wait().unwrap().payload().as_ref(), b"pong");
    }

    #[test]
    fn test_reject() {
        let (completer, reply) = channel("cmd-req");
        completer.reject(FabricError::Closed("cmd-req".into()));
        assert!(reply.wait().unwrap_err().is_closed());
    }

    #[test]
    fn test_deadline_leaves_reply_pending() {
        let (completer, reply) = channel("cmd-req");
        let err = reply.wait_timeout(Duration::from_millis(10)).unwrap_err();
        assert_eq!(err, FabricError::DeadlineElapsed(Duration::from_millis(10)));
        assert!(reply.try_take().is_none());

        completer.resolve(decoded(b"late"));
        assert!(reply.try_take().unwrap().is_ok());
    }

    #[test]
    fn test_dropped_completer_reports_closed() {
        let (completer, reply) = channel("status-sub");
        drop(completer);
        assert_eq!(
            reply.wait().unwrap_err(),
            FabricError::Closed("status-sub".into())
        );
    }

    #[test]
    fn test_abandoned_detection() {
        let (completer, reply) = channel("cmd-req");
        assert!(!completer.is_abandoned());
        drop(reply);
        assert!(completer.is_abandoned());
    }

    #[compio::test]
    async fn test_await_reply() {
        let (completer, reply) = channel("cmd-req");
        std::thread::spawn(move || completer.resolve(decoded(b"async")));
        let message = reply.await.unwrap();
        assert_eq!(message.payload().as_ref(), b"async");
    }
}
