//! Outstanding-request table: pairs each forwarded `http_request` with
//! exactly one outcome.
//!
//! Every pending entry resolves exactly once (matching response, agent
//! error, deadline, session loss, or cancellation) and is removed when
//! it does. Late responses find no entry and are discarded by the caller.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use homelink_proto::{ErrorCode, ErrorFrame, Message, RequestFrame, ResponseFrame};

use crate::registry::AgentHandle;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("request deadline exceeded")]
    Timeout,
    #[error("agent session lost")]
    SessionLost,
    #[error("pending request table full")]
    QueueFull,
    #[error("agent reported {}: {}", .0.code, .0.message)]
    Agent(ErrorFrame),
}

impl DispatchError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Timeout => ErrorCode::UpstreamTimeout,
            Self::SessionLost => ErrorCode::SessionLost,
            Self::QueueFull => ErrorCode::QueueFull,
            Self::Agent(frame) => frame.code,
        }
    }
}

/// What happened to an inbound response or error frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Delivered to the waiter.
    Delivered,
    /// No matching entry; the waiter already resolved or never existed.
    Unknown,
    /// Entry exists but belongs to a different session or user.
    CrossSession,
}

type Outcome = Result<ResponseFrame, DispatchError>;

struct Pending {
    user_id: String,
    session_id: Uuid,
    deadline: Instant,
    tx: oneshot::Sender<Outcome>,
    /// Keeps the owning session's pending counter reachable after close.
    handle: Arc<AgentHandle>,
}

pub struct Correlator {
    pending: DashMap<String, Pending>,
    /// Process-wide bound on outstanding requests.
    max_pending: usize,
}

impl Correlator {
    pub fn new(max_pending: usize) -> Self {
        Self {
            pending: DashMap::new(),
            max_pending,
        }
    }

    /// Forward one request over `handle` and wait for its outcome.
    ///
    /// The deadline covers the writer-channel send as well, so a
    /// backpressured session cannot park the caller past its budget.
    pub async fn dispatch(
        &self,
        handle: &Arc<AgentHandle>,
        mut frame: RequestFrame,
        timeout: Duration,
        max_channels: usize,
    ) -> Outcome {
        let deadline = Instant::now() + timeout;
        let (id, rx) = self.begin(handle, deadline, max_channels)?;
        frame.id = id.clone();
        frame.timeout_ms = Some(timeout.as_millis() as u64);

        // Expire the entry on every exit path, including future drop
        // (client went away); a completed waiter makes this a no-op.
        let guard = ExpireGuard {
            correlator: self,
            id: &id,
        };

        match tokio::time::timeout_at(deadline, handle.frames.send(Message::HttpRequest(frame)))
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(DispatchError::SessionLost),
            Err(_) => return Err(DispatchError::Timeout),
        }

        let outcome = match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(outcome)) => outcome,
            // sender dropped without resolving: the session swept us
            Ok(Err(_)) => Err(DispatchError::SessionLost),
            Err(_) => Err(DispatchError::Timeout),
        };
        drop(guard);
        outcome
    }

    fn begin(
        &self,
        handle: &Arc<AgentHandle>,
        deadline: Instant,
        max_channels: usize,
    ) -> Result<(String, oneshot::Receiver<Outcome>), DispatchError> {
        if handle.is_draining() {
            return Err(DispatchError::SessionLost);
        }
        if self.pending.len() >= self.max_pending {
            tracing::warn!(max = self.max_pending, "pending request table full");
            return Err(DispatchError::QueueFull);
        }
        if handle.pending.fetch_add(1, Ordering::AcqRel) >= max_channels {
            handle.pending.fetch_sub(1, Ordering::AcqRel);
            tracing::debug!(
                session_id = %handle.session_id,
                max_channels,
                "session channel cap reached"
            );
            return Err(DispatchError::QueueFull);
        }

        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            id.clone(),
            Pending {
                user_id: handle.user_id.clone(),
                session_id: handle.session_id,
                deadline,
                tx,
                handle: Arc::clone(handle),
            },
        );
        Ok((id, rx))
    }

    /// Deliver a response frame from `session_id` to its waiter.
    pub fn resolve(&self, session_id: Uuid, user_id: &str, response: ResponseFrame) -> Resolution {
        self.complete(session_id, user_id, &response.id.clone(), Ok(response))
    }

    /// Deliver an agent error frame carrying a request id.
    pub fn fail(&self, session_id: Uuid, user_id: &str, frame: ErrorFrame) -> Resolution {
        let Some(id) = frame.id.clone() else {
            return Resolution::Unknown;
        };
        self.complete(session_id, user_id, &id, Err(DispatchError::Agent(frame)))
    }

    fn complete(
        &self,
        session_id: Uuid,
        user_id: &str,
        id: &str,
        outcome: Outcome,
    ) -> Resolution {
        {
            let Some(entry) = self.pending.get(id) else {
                return Resolution::Unknown;
            };
            if entry.session_id != session_id || entry.user_id != user_id {
                return Resolution::CrossSession;
            }
        }
        match self
            .pending
            .remove_if(id, |_, p| p.session_id == session_id && p.user_id == user_id)
        {
            Some((_, pending)) => {
                pending.handle.pending.fetch_sub(1, Ordering::AcqRel);
                let _ = pending.tx.send(outcome);
                Resolution::Delivered
            }
            // lost the race against a timeout or sweep
            None => Resolution::Unknown,
        }
    }

    /// Remove one entry without signaling; the waiter already has its
    /// outcome (or is gone).
    fn expire(&self, id: &str) {
        if let Some((_, pending)) = self.pending.remove(id) {
            pending.handle.pending.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Fail every pending entry owned by a lost session.
    pub fn fail_session(&self, session_id: Uuid) {
        let ids: Vec<String> = self
            .pending
            .iter()
            .filter(|e| e.session_id == session_id)
            .map(|e| e.key().clone())
            .collect();
        for id in ids {
            if let Some((_, pending)) =
                self.pending.remove_if(&id, |_, p| p.session_id == session_id)
            {
                pending.handle.pending.fetch_sub(1, Ordering::AcqRel);
                let _ = pending.tx.send(Err(DispatchError::SessionLost));
            }
        }
    }

    /// Safety net for waiters that disappeared without expiring their
    /// entry; run by the periodic cleaner.
    pub fn sweep(&self) {
        let now = Instant::now();
        let overdue: Vec<String> = self
            .pending
            .iter()
            .filter(|e| e.deadline < now)
            .map(|e| e.key().clone())
            .collect();
        for id in overdue {
            if let Some((_, pending)) = self.pending.remove_if(&id, |_, p| p.deadline < now) {
                pending.handle.pending.fetch_sub(1, Ordering::AcqRel);
                let _ = pending.tx.send(Err(DispatchError::Timeout));
                tracing::debug!(request_id = %id, "swept overdue pending request");
            }
        }
    }

    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }
}

struct ExpireGuard<'a> {
    correlator: &'a Correlator,
    id: &'a str,
}

impl Drop for ExpireGuard<'_> {
    fn drop(&mut self) {
        self.correlator.expire(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{unix_now, Identity, Tier};
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    fn handle(user: &str) -> (Arc<AgentHandle>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(16);
        let identity = Identity {
            user_id: user.to_owned(),
            tier: Tier::Free,
            expires_at: unix_now() + 3600,
        };
        (Arc::new(AgentHandle::new(&identity, tx)), rx)
    }

    fn request() -> RequestFrame {
        RequestFrame {
            id: String::new(),
            method: "GET".to_owned(),
            path: "/ping".to_owned(),
            headers: HashMap::new(),
            body: bytes::Bytes::new(),
            timeout_ms: None,
        }
    }

    fn response(id: &str) -> ResponseFrame {
        ResponseFrame {
            id: id.to_owned(),
            status: 200,
            headers: HashMap::new(),
            body: bytes::Bytes::from_static(b"pong"),
        }
    }

    #[tokio::test]
    async fn matching_response_resolves_the_waiter() {
        let correlator = Arc::new(Correlator::new(16));
        let (agent, mut frames) = handle("u1");

        let dispatch = {
            let correlator = Arc::clone(&correlator);
            let agent = Arc::clone(&agent);
            tokio::spawn(async move {
                correlator
                    .dispatch(&agent, request(), Duration::from_secs(5), 10)
                    .await
            })
        };

        let sent = frames.recv().await.unwrap();
        let Message::HttpRequest(sent) = sent else {
            panic!("expected http_request frame");
        };
        assert_eq!(
            correlator.resolve(agent.session_id, "u1", response(&sent.id)),
            Resolution::Delivered
        );

        let outcome = dispatch.await.unwrap().unwrap();
        assert_eq!(outcome.status, 200);
        assert_eq!(agent.pending.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn deadline_times_out_and_late_response_is_discarded() {
        let correlator = Arc::new(Correlator::new(16));
        let (agent, mut frames) = handle("u1");

        let outcome = correlator
            .dispatch(&agent, request(), Duration::from_millis(30), 10)
            .await;
        assert!(matches!(outcome, Err(DispatchError::Timeout)));

        let Message::HttpRequest(sent) = frames.recv().await.unwrap() else {
            panic!("expected http_request frame");
        };
        // the entry is gone; a late reply must not be delivered
        assert_eq!(
            correlator.resolve(agent.session_id, "u1", response(&sent.id)),
            Resolution::Unknown
        );
        assert_eq!(correlator.outstanding(), 0);
    }

    #[tokio::test]
    async fn cross_session_response_is_rejected_without_resolving() {
        let correlator = Arc::new(Correlator::new(16));
        let (agent, mut frames) = handle("u1");
        let (intruder, _frames2) = handle("u2");

        let dispatch = {
            let correlator = Arc::clone(&correlator);
            let agent = Arc::clone(&agent);
            tokio::spawn(async move {
                correlator
                    .dispatch(&agent, request(), Duration::from_millis(200), 10)
                    .await
            })
        };

        let Message::HttpRequest(sent) = frames.recv().await.unwrap() else {
            panic!("expected http_request frame");
        };
        assert_eq!(
            correlator.resolve(intruder.session_id, "u2", response(&sent.id)),
            Resolution::CrossSession
        );
        // the rightful waiter still times out normally
        assert!(matches!(
            dispatch.await.unwrap(),
            Err(DispatchError::Timeout)
        ));
    }

    #[tokio::test]
    async fn session_loss_fails_every_pending_entry() {
        let correlator = Arc::new(Correlator::new(16));
        let (agent, _frames) = handle("u1");

        let mut waiters = Vec::new();
        for _ in 0..3 {
            let correlator = Arc::clone(&correlator);
            let agent = Arc::clone(&agent);
            waiters.push(tokio::spawn(async move {
                correlator
                    .dispatch(&agent, request(), Duration::from_secs(5), 10)
                    .await
            }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(correlator.outstanding(), 3);

        correlator.fail_session(agent.session_id);
        for waiter in waiters {
            assert!(matches!(
                waiter.await.unwrap(),
                Err(DispatchError::SessionLost)
            ));
        }
        assert_eq!(correlator.outstanding(), 0);
        assert_eq!(agent.pending.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn channel_cap_and_table_cap_yield_queue_full() {
        let correlator = Arc::new(Correlator::new(2));
        let (agent, _frames) = handle("u1");

        let mut held = Vec::new();
        for _ in 0..2 {
            let correlator = Arc::clone(&correlator);
            let agent = Arc::clone(&agent);
            held.push(tokio::spawn(async move {
                correlator
                    .dispatch(&agent, request(), Duration::from_millis(300), 10)
                    .await
            }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        // table full
        let outcome = correlator
            .dispatch(&agent, request(), Duration::from_millis(50), 10)
            .await;
        assert!(matches!(outcome, Err(DispatchError::QueueFull)));

        // per-session channel cap
        let small = Correlator::new(100);
        let outcome = small
            .dispatch(&agent, request(), Duration::from_millis(50), 2)
            .await;
        assert!(matches!(outcome, Err(DispatchError::QueueFull)));
        for h in held {
            let _ = h.await;
        }
    }

    #[tokio::test]
    async fn dispatched_ids_are_unique() {
        let correlator = Arc::new(Correlator::new(256));
        let (agent, mut frames) = handle("u1");

        let mut tasks = Vec::new();
        for _ in 0..50 {
            let correlator = Arc::clone(&correlator);
            let agent = Arc::clone(&agent);
            tasks.push(tokio::spawn(async move {
                correlator
                    .dispatch(&agent, request(), Duration::from_millis(100), 100)
                    .await
            }));
        }

        let mut seen = std::collections::HashSet::new();
        for _ in 0..50 {
            let Message::HttpRequest(sent) = frames.recv().await.unwrap() else {
                panic!("expected http_request frame");
            };
            assert!(seen.insert(sent.id));
        }
        for t in tasks {
            let _ = t.await;
        }
    }
}
