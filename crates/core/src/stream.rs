//! Session-keyed fan-out of pipeline output to long-lived client connections.
//!
//! Each subscriber owns a bounded queue. Publishing never waits: a subscriber whose
//! queue is full is disconnected, keeps what was already queued, and then observes a
//! synthesized [`StreamEvent::End`]. Closing a session leaves a short tombstone so a
//! late subscriber still learns the stream is over.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::Stream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::config::StreamConfig;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamEvent {
    Payload(String),
    Error(String),
    End,
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::End)
    }
}

#[derive(Clone, Debug)]
pub struct SessionBroker {
    inner: Arc<BrokerInner>,
}

#[derive(Debug)]
struct BrokerInner {
    sessions: Mutex<HashMap<String, SessionSlot>>,
    capacity: usize,
    retention: Duration,
    next_subscriber: AtomicU64,
}

#[derive(Debug)]
enum SessionSlot {
    Open(Vec<Subscriber>),
    Closed { at: Instant },
}

#[derive(Debug)]
struct Subscriber {
    id: u64,
    sender: mpsc::Sender<StreamEvent>,
}

impl SessionBroker {
    pub fn new(capacity: usize, retention: Duration) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                sessions: Mutex::new(HashMap::new()),
                capacity: capacity.max(1),
                retention,
                next_subscriber: AtomicU64::new(1),
            }),
        }
    }

    pub fn from_config(config: &StreamConfig) -> Self {
        Self::new(config.subscriber_capacity, Duration::from_secs(config.closed_retention_secs))
    }

    /// Attaches a new subscriber, creating the session if needed.
    ///
    /// Attaching to a recently closed session yields a subscription that only sees the
    /// terminal marker.
    pub fn open(&self, session_id: &str) -> Subscription {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.inner.capacity);
        let mut sessions = self.inner.lock();
        let now = Instant::now();
        prune_tombstones(&mut sessions, now, self.inner.retention);

        match sessions.get_mut(session_id) {
            Some(SessionSlot::Closed { .. }) => {
                let _ = sender.try_send(StreamEvent::End);
                debug!(
                    event_name = "stream.session.attach_closed",
                    session_id,
                    "subscriber attached to closed session"
                );
            }
            Some(SessionSlot::Open(subscribers)) => {
                subscribers.push(Subscriber { id, sender });
                debug!(
                    event_name = "stream.session.attach",
                    session_id,
                    subscriber_count = subscribers.len(),
                    "subscriber attached"
                );
            }
            None => {
                sessions.insert(session_id.to_string(), SessionSlot::Open(vec![Subscriber { id, sender }]));
                debug!(event_name = "stream.session.open", session_id, "session opened");
            }
        }

        Subscription {
            session_id: session_id.to_string(),
            id,
            receiver,
            broker: Arc::downgrade(&self.inner),
            finished: false,
        }
    }

    /// Delivers `event` to every attached subscriber in publish order and returns how
    /// many received it. Publishing [`StreamEvent::End`] closes the session.
    pub fn publish(&self, session_id: &str, event: StreamEvent) -> usize {
        if event.is_terminal() {
            return self.close(session_id);
        }

        let mut sessions = self.inner.lock();
        let Some(SessionSlot::Open(subscribers)) = sessions.get_mut(session_id) else {
            return 0;
        };

        let mut delivered = 0;
        subscribers.retain(|subscriber| match subscriber.sender.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(
                    event_name = "stream.subscriber.evicted",
                    session_id,
                    subscriber_id = subscriber.id,
                    "slow subscriber disconnected"
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        });

        if subscribers.is_empty() {
            sessions.remove(session_id);
        }

        delivered
    }

    /// Sends the terminal marker to every subscriber and releases the session.
    pub fn close(&self, session_id: &str) -> usize {
        let mut sessions = self.inner.lock();
        let now = Instant::now();
        let previous = sessions.insert(session_id.to_string(), SessionSlot::Closed { at: now });

        let mut notified = 0;
        if let Some(SessionSlot::Open(subscribers)) = previous {
            for subscriber in subscribers {
                // A full queue still ends: dropping the sender synthesizes the marker.
                if subscriber.sender.try_send(StreamEvent::End).is_ok() {
                    notified += 1;
                }
            }
        }

        debug!(event_name = "stream.session.closed", session_id, notified, "session closed");
        prune_tombstones(&mut sessions, now, self.inner.retention);
        notified
    }

    /// Forgets a closed session so the id can carry a new submission.
    pub fn reset(&self, session_id: &str) {
        let mut sessions = self.inner.lock();
        if matches!(sessions.get(session_id), Some(SessionSlot::Closed { .. })) {
            sessions.remove(session_id);
        }
    }

    pub fn subscriber_count(&self, session_id: &str) -> usize {
        match self.inner.lock().get(session_id) {
            Some(SessionSlot::Open(subscribers)) => subscribers.len(),
            _ => 0,
        }
    }

    pub fn open_sessions(&self) -> usize {
        self.inner
            .lock()
            .values()
            .filter(|slot| matches!(slot, SessionSlot::Open(_)))
            .count()
    }
}

impl BrokerInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, SessionSlot>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn detach(&self, session_id: &str, id: u64) {
        let mut sessions = self.lock();
        let Some(SessionSlot::Open(subscribers)) = sessions.get_mut(session_id) else {
            return;
        };

        subscribers.retain(|subscriber| subscriber.id != id);
        if subscribers.is_empty() {
            sessions.remove(session_id);
            debug!(event_name = "stream.session.released", session_id, "last subscriber left");
        }
    }
}

fn prune_tombstones(
    sessions: &mut HashMap<String, SessionSlot>,
    now: Instant,
    retention: Duration,
) {
    sessions.retain(|_, slot| match slot {
        SessionSlot::Closed { at } => now.duration_since(*at) < retention,
        SessionSlot::Open(_) => true,
    });
}

/// One client's view of a session. Always finishes with [`StreamEvent::End`].
#[derive(Debug)]
pub struct Subscription {
    session_id: String,
    id: u64,
    receiver: mpsc::Receiver<StreamEvent>,
    broker: Weak<BrokerInner>,
    finished: bool,
}

impl Subscription {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn recv(&mut self) -> Option<StreamEvent> {
        futures::StreamExt::next(self).await
    }
}

impl Stream for Subscription {
    type Item = StreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        match this.receiver.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                if event.is_terminal() {
                    this.finished = true;
                }
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(Some(StreamEvent::End))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.broker.upgrade() {
            inner.detach(&self.session_id, self.id);
        }
    }
}
