/*
[INPUT]:  Unsolicited application frames from the read loop, handler registrations
[OUTPUT]: Per-tag fan-out to handlers in registration order
[POS]:    Dispatch layer - push event subscriptions
[UPDATE]: When changing handler contracts or delivery guarantees
*/

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::warn;

use crate::codec::Frame;

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Receives push frames for the tags it subscribed to.
///
/// Handlers run on the read loop, one at a time; anything slow should be
/// handed to another task (see [`EventDispatcher::subscribe_channel`]).
pub trait EventHandler: Send + Sync + 'static {
    fn handle(&self, frame: &Frame) -> Result<(), HandlerError>;
}

impl<F> EventHandler for F
where
    F: Fn(&Frame) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    fn handle(&self, frame: &Frame) -> Result<(), HandlerError> {
        self(frame)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    tag: String,
    handler: Arc<dyn EventHandler>,
}

/// Registry of push-event handlers; outlives every connection generation
#[derive(Default)]
pub struct EventDispatcher {
    subscriptions: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
    failures: AtomicU64,
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("subscriptions", &self.len())
            .field("failures", &self.failures())
            .finish()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, tag: &str, handler: impl EventHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.subscriptions.write().push(Subscription {
            id,
            tag: tag.to_string(),
            handler: Arc::new(handler),
        });
        id
    }

    /// Deliver `tag` frames into a channel, for consumers on their own task.
    pub fn subscribe_channel(&self, tag: &str) -> (SubscriptionId, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(tag, move |frame: &Frame| -> Result<(), HandlerError> {
            tx.send(frame.clone())
                .map_err(|_| HandlerError::from("subscription receiver dropped"))
        });
        (id, rx)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.subscriptions.write();
        let before = subscriptions.len();
        subscriptions.retain(|subscription| subscription.id != id);
        subscriptions.len() != before
    }

    /// Deliver `frame` to every handler of its tag. Returns the delivery count.
    pub fn dispatch(&self, frame: &Frame) -> usize {
        // handlers run outside the lock so they may (un)subscribe
        let handlers: Vec<(SubscriptionId, Arc<dyn EventHandler>)> = self
            .subscriptions
            .read()
            .iter()
            .filter(|subscription| subscription.tag == frame.tag)
            .map(|subscription| (subscription.id, Arc::clone(&subscription.handler)))
            .collect();

        let mut delivered = 0;
        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler.handle(frame))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(err)) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(tag = %frame.tag, subscription = id.0, error = %err, "event handler failed");
                }
                Err(_) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(tag = %frame.tag, subscription = id.0, "event handler panicked");
                }
            }
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.subscriptions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Handler errors and panics so far.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}
