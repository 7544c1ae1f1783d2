/*
[INPUT]:  Outgoing commands tagged with a generation, incoming application frames
[OUTPUT]: Exactly-once completion of every pending request
[POS]:    Session layer - request/response correlation
[UPDATE]: When adding correlation modes or changing completion rules
*/

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{Semaphore, oneshot};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::codec::Frame;
use crate::commands::{Command, Correlation};
use crate::error::{Result, SessionError};

const RETIRED_KEYS_LIMIT: usize = 256;

/// What identifies the response of one request
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationKey {
    pub response_tag: String,
    pub failure_tag: Option<String>,
    /// `(field, id)` for id-correlated requests
    pub id: Option<(String, String)>,
}

impl CorrelationKey {
    /// `Some(true)` for a success response, `Some(false)` for a failure one.
    fn matches(&self, frame: &Frame) -> Option<bool> {
        let success = if frame.tag == self.response_tag {
            true
        } else if self.failure_tag.as_deref() == Some(frame.tag.as_str()) {
            false
        } else {
            return None;
        };

        match &self.id {
            None => Some(success),
            Some((field, id)) => {
                let echoed = frame.payload.get(field).map(id_string);
                (echoed.as_deref() == Some(id.as_str())).then_some(success)
            }
        }
    }
}

/// How an inbound frame was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Completed a pending request
    Completed,
    /// Answer to a request that already finished; discarded
    Late,
    /// Frame from a superseded generation; discarded
    Stale,
    /// Not a response; belongs to the dispatcher
    Unmatched,
}

#[derive(Debug)]
struct PendingRequest {
    tag: String,
    key: CorrelationKey,
    generation: u64,
    created_at: Instant,
    slot: oneshot::Sender<Result<Value>>,
}

#[derive(Debug, Default)]
struct Inner {
    next_ticket: u64,
    current_generation: u64,
    retired_through: u64,
    closed: bool,
    pending: BTreeMap<u64, PendingRequest>,
    retired_keys: VecDeque<CorrelationKey>,
}

impl Inner {
    fn retire_key(&mut self, key: CorrelationKey) {
        if key.id.is_none() {
            return;
        }
        if self.retired_keys.len() == RETIRED_KEYS_LIMIT {
            self.retired_keys.pop_front();
        }
        self.retired_keys.push_back(key);
    }
}

/// Pending-request table shared by submitters and the read loop
#[derive(Debug, Default)]
pub struct Correlator {
    inner: Mutex<Inner>,
    classes: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Work out the correlation key and the payload to put on the wire.
    pub fn prepare(command: &Command) -> Result<(Option<CorrelationKey>, Value)> {
        let mut payload = command.payload.clone();
        let Some(response_tag) = command.response_tag.clone() else {
            return Ok((None, payload));
        };

        let id = match &command.correlation {
            Correlation::FireAndForget => return Ok((None, payload)),
            Correlation::Serialized => None,
            Correlation::ById { field } => {
                let Value::Object(fields) = &mut payload else {
                    return Err(SessionError::Config(format!(
                        "{} is correlated by {field} but its payload is not an object",
                        command.tag
                    )));
                };
                let id = match fields.get(field) {
                    Some(existing) if !existing.is_null() => id_string(existing),
                    _ => {
                        let generated = Uuid::new_v4().to_string();
                        fields.insert(field.clone(), Value::from(generated.clone()));
                        generated
                    }
                };
                Some((field.clone(), id))
            }
        };

        Ok((
            Some(CorrelationKey {
                response_tag,
                failure_tag: command.failure_tag.clone(),
                id,
            }),
            payload,
        ))
    }

    /// Slot limiting a serialized class to one request in flight.
    pub fn class_slot(&self, response_tag: &str) -> Arc<Semaphore> {
        self.classes
            .lock()
            .entry(response_tag.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }

    pub fn begin_generation(&self, generation: u64) {
        let mut inner = self.inner.lock();
        inner.current_generation = inner.current_generation.max(generation);
    }

    /// Record a pending request; the guard removes it when dropped.
    pub fn register(
        self: &Arc<Self>,
        generation: u64,
        tag: &str,
        key: CorrelationKey,
    ) -> Result<(PendingGuard, oneshot::Receiver<Result<Value>>)> {
        let (slot, rx) = oneshot::channel();
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(SessionError::Closed);
        }
        if generation <= inner.retired_through {
            return Err(SessionError::ConnectionLost { generation });
        }

        inner.next_ticket += 1;
        let ticket = inner.next_ticket;
        inner.pending.insert(
            ticket,
            PendingRequest {
                tag: tag.to_string(),
                key,
                generation,
                created_at: Instant::now(),
                slot,
            },
        );

        Ok((
            PendingGuard {
                correlator: Arc::clone(self),
                ticket,
            },
            rx,
        ))
    }

    /// Match an inbound frame of `generation` against pending requests.
    pub fn resolve(&self, generation: u64, frame: &Frame) -> Resolution {
        let mut inner = self.inner.lock();
        if generation < inner.current_generation {
            debug!(generation, tag = %frame.tag, "dropping frame from superseded generation");
            return Resolution::Stale;
        }

        let hit = inner.pending.iter().find_map(|(ticket, pending)| {
            if pending.generation != generation {
                return None;
            }
            pending.key.matches(frame).map(|success| (*ticket, success))
        });

        let Some((ticket, success)) = hit else {
            if inner.retired_keys.iter().any(|key| key.matches(frame).is_some()) {
                debug!(tag = %frame.tag, "discarding response for a finished request");
                return Resolution::Late;
            }
            return Resolution::Unmatched;
        };

        let Some(pending) = inner.pending.remove(&ticket) else {
            return Resolution::Unmatched;
        };
        inner.retire_key(pending.key.clone());
        drop(inner);

        debug!(
            command = %pending.tag,
            response = %frame.tag,
            elapsed_ms = pending.created_at.elapsed().as_millis() as u64,
            "request completed"
        );
        let outcome = if success {
            Ok(frame.payload.clone())
        } else {
            Err(SessionError::Rejected {
                tag: frame.tag.clone(),
                payload: frame.payload.clone(),
            })
        };
        // the caller may have given up already
        let _ = pending.slot.send(outcome);
        Resolution::Completed
    }

    /// Fail every request issued on `generation` or earlier.
    pub fn fail_generation(&self, generation: u64) -> usize {
        let drained = {
            let mut inner = self.inner.lock();
            inner.retired_through = inner.retired_through.max(generation);
            drain_where(&mut inner, |pending| pending.generation <= generation)
        };
        let count = drained.len();
        for pending in drained {
            let _ = pending.slot.send(Err(SessionError::ConnectionLost {
                generation: pending.generation,
            }));
        }
        count
    }

    /// Fail everything and refuse new registrations.
    pub fn close(&self) -> usize {
        let drained = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.retired_through = u64::MAX;
            drain_where(&mut inner, |_| true)
        };
        let count = drained.len();
        for pending in drained {
            let _ = pending.slot.send(Err(SessionError::Closed));
        }
        for slot in self.classes.lock().values() {
            slot.close();
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    fn remove(&self, ticket: u64) {
        let mut inner = self.inner.lock();
        if let Some(pending) = inner.pending.remove(&ticket) {
            debug!(command = %pending.tag, ticket, "pending request abandoned");
            inner.retire_key(pending.key);
        }
    }
}

fn drain_where(inner: &mut Inner, predicate: impl Fn(&PendingRequest) -> bool) -> Vec<PendingRequest> {
    let tickets: Vec<u64> = inner
        .pending
        .iter()
        .filter(|(_, pending)| predicate(pending))
        .map(|(ticket, _)| *ticket)
        .collect();
    tickets
        .into_iter()
        .filter_map(|ticket| inner.pending.remove(&ticket))
        .collect()
}

fn id_string(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Removes its pending request on drop (timeout or caller cancellation).
#[derive(Debug)]
pub struct PendingGuard {
    correlator: Arc<Correlator>,
    ticket: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.correlator.remove(self.ticket);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    fn order_key(id: &str) -> CorrelationKey {
        CorrelationKey {
            response_tag: "successopenOrder".to_string(),
            failure_tag: Some("failopenOrder".to_string()),
            id: Some(("requestId".to_string(), id.to_string())),
        }
    }

    fn history_key() -> CorrelationKey {
        CorrelationKey {
            response_tag: "loadHistoryPeriod".to_string(),
            failure_tag: None,
            id: None,
        }
    }

    #[tokio::test]
    async fn out_of_order_responses_reach_their_own_callers() {
        let correlator = Arc::new(Correlator::new());
        correlator.begin_generation(1);
        let (_a, rx_a) = assert_ok!(correlator.register(1, "openOrder", order_key("a")));
        let (_b, rx_b) = assert_ok!(correlator.register(1, "openOrder", order_key("b")));

        let answer_b = Frame::new("successopenOrder", json!({"requestId": "b", "id": 2}));
        let answer_a = Frame::new("successopenOrder", json!({"requestId": "a", "id": 1}));
        assert_eq!(correlator.resolve(1, &answer_b), Resolution::Completed);
        assert_eq!(correlator.resolve(1, &answer_a), Resolution::Completed);

        assert_eq!(assert_ok!(rx_a.await.unwrap())["id"], 1);
        assert_eq!(assert_ok!(rx_b.await.unwrap())["id"], 2);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn duplicate_answer_is_late_not_dispatched() {
        let correlator = Arc::new(Correlator::new());
        correlator.begin_generation(1);
        let (_guard, rx) = assert_ok!(correlator.register(1, "openOrder", order_key("a")));

        let answer = Frame::new("successopenOrder", json!({"requestId": "a"}));
        assert_eq!(correlator.resolve(1, &answer), Resolution::Completed);
        assert_eq!(correlator.resolve(1, &answer), Resolution::Late);
        assert_ok!(rx.await.unwrap());
    }

    #[tokio::test]
    async fn failure_event_completes_with_rejected() {
        let correlator = Arc::new(Correlator::new());
        correlator.begin_generation(1);
        let (_guard, rx) = assert_ok!(correlator.register(1, "openOrder", order_key("a")));

        let refusal = Frame::new("failopenOrder", json!({"requestId": "a", "error": "amount"}));
        assert_eq!(correlator.resolve(1, &refusal), Resolution::Completed);
        match rx.await.unwrap() {
            Err(SessionError::Rejected { tag, payload }) => {
                assert_eq!(tag, "failopenOrder");
                assert_eq!(payload["error"], "amount");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stale_generation_frames_have_no_effect() {
        let correlator = Arc::new(Correlator::new());
        correlator.begin_generation(2);
        let (_guard, mut rx) = assert_ok!(correlator.register(2, "loadHistoryPeriod", history_key()));

        let answer = Frame::new("loadHistoryPeriod", json!({"data": []}));
        assert_eq!(correlator.resolve(1, &answer), Resolution::Stale);
        assert_eq!(correlator.pending_count(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn fail_generation_resolves_each_request_once() {
        let correlator = Arc::new(Correlator::new());
        correlator.begin_generation(1);
        let (_a, rx_a) = assert_ok!(correlator.register(1, "openOrder", order_key("a")));
        let (_b, rx_b) = assert_ok!(correlator.register(1, "loadHistoryPeriod", history_key()));

        assert_eq!(correlator.fail_generation(1), 2);
        assert_eq!(correlator.fail_generation(1), 0);
        assert!(matches!(
            rx_a.await.unwrap(),
            Err(SessionError::ConnectionLost { generation: 1 })
        ));
        assert!(matches!(
            rx_b.await.unwrap(),
            Err(SessionError::ConnectionLost { generation: 1 })
        ));

        // registering against the retired generation fails fast
        assert!(matches!(
            correlator.register(1, "openOrder", order_key("c")),
            Err(SessionError::ConnectionLost { generation: 1 })
        ));
    }

    #[tokio::test]
    async fn dropped_guard_removes_pending_request() {
        let correlator = Arc::new(Correlator::new());
        correlator.begin_generation(1);
        let (guard, _rx) = assert_ok!(correlator.register(1, "openOrder", order_key("a")));
        assert_eq!(correlator.pending_count(), 1);
        drop(guard);
        assert_eq!(correlator.pending_count(), 0);

        let late = Frame::new("successopenOrder", json!({"requestId": "a"}));
        assert_eq!(correlator.resolve(1, &late), Resolution::Late);
    }

    #[tokio::test]
    async fn close_fails_pending_and_rejects_new_work() {
        let correlator = Arc::new(Correlator::new());
        correlator.begin_generation(1);
        let (_guard, rx) = assert_ok!(correlator.register(1, "openOrder", order_key("a")));
        let slot = correlator.class_slot("loadHistoryPeriod");

        assert_eq!(correlator.close(), 1);
        assert!(matches!(rx.await.unwrap(), Err(SessionError::Closed)));
        assert!(matches!(
            correlator.register(5, "openOrder", order_key("b")),
            Err(SessionError::Closed)
        ));
        assert_err!(slot.acquire().await);
    }

    #[test]
    fn prepare_injects_missing_request_id() {
        let command = crate::commands::Command::new("openOrder", json!({"asset": "EURUSD_otc"}))
            .expect("successopenOrder")
            .correlate_by("requestId");
        let (key, payload) = assert_ok!(Correlator::prepare(&command));
        let key = key.unwrap();
        let (field, id) = key.id.unwrap();
        assert_eq!(field, "requestId");
        assert_eq!(payload["requestId"], Value::from(id));
    }

    #[test]
    fn prepare_keeps_numeric_request_id() {
        let command = crate::commands::Command::new("openOrder", json!({"requestId": 77}))
            .expect("successopenOrder")
            .correlate_by("requestId");
        let (key, payload) = assert_ok!(Correlator::prepare(&command));
        assert_eq!(key.unwrap().id.unwrap().1, "77");
        assert_eq!(payload["requestId"], 77);

        let bad = crate::commands::Command::new("openOrder", json!([1]))
            .expect("successopenOrder")
            .correlate_by("requestId");
        assert_err!(Correlator::prepare(&bad));
    }

    #[test]
    fn unrelated_frames_are_unmatched() {
        let correlator = Correlator::new();
        let push = Frame::new("updateStream", json!([]));
        assert_eq!(correlator.resolve(0, &push), Resolution::Unmatched);
    }
}
