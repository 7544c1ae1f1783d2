/*
[INPUT]:  Order, deal and balance events seen on the session
[OUTPUT]: Open deals, settled deal results, latest balance; waiters for results
[POS]:    Account layer - client-side view of the venue's deal events
[UPDATE]: When the venue changes deal event names or shapes
*/

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::codec::Frame;

pub const ORDER_OPENED_TAG: &str = "successopenOrder";
pub const ORDER_CLOSED_TAG: &str = "successcloseOrder";
pub const OPENED_DEALS_TAG: &str = "updateOpenedDeals";
pub const CLOSED_DEALS_TAG: &str = "updateClosedDeals";
pub const BALANCE_TAG: &str = "successupdateBalance";

/// Settled results kept for late lookups
const SETTLED_CAPACITY: usize = 512;

#[derive(Debug, Default)]
struct Book {
    opened: HashMap<String, Value>,
    settled: HashMap<String, Value>,
    settled_order: VecDeque<String>,
    waiters: HashMap<String, Vec<oneshot::Sender<Value>>>,
    balance: Option<Value>,
}

/// Tracks deals from the frames the read loop sees, responses included.
#[derive(Debug, Default)]
pub struct DealBook {
    book: Mutex<Book>,
}

impl DealBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&self, frame: &Frame) {
        match frame.tag.as_str() {
            ORDER_OPENED_TAG => {
                if let Some(id) = deal_id(&frame.payload) {
                    self.book.lock().opened.insert(id, frame.payload.clone());
                }
            }
            OPENED_DEALS_TAG => {
                let opened = deals_in(&frame.payload)
                    .filter_map(|deal| deal_id(deal).map(|id| (id, deal.clone())))
                    .collect();
                self.book.lock().opened = opened;
            }
            ORDER_CLOSED_TAG | CLOSED_DEALS_TAG => {
                let mut book = self.book.lock();
                for deal in deals_in(&frame.payload) {
                    book.settle(deal);
                }
            }
            BALANCE_TAG => {
                self.book.lock().balance = Some(frame.payload.clone());
            }
            _ => {}
        }
    }

    /// Deals opened and not yet settled.
    pub fn opened(&self) -> Vec<Value> {
        self.book.lock().opened.values().cloned().collect()
    }

    pub fn settled(&self, id: &str) -> Option<Value> {
        self.book.lock().settled.get(id).cloned()
    }

    pub fn balance(&self) -> Option<Value> {
        self.book.lock().balance.clone()
    }

    /// The settled deal `id`, or a receiver completed when it settles.
    pub fn result_or_wait(&self, id: &str) -> Result<Value, oneshot::Receiver<Value>> {
        let mut book = self.book.lock();
        if let Some(deal) = book.settled.get(id) {
            return Ok(deal.clone());
        }
        let (tx, rx) = oneshot::channel();
        let waiters = book.waiters.entry(id.to_string()).or_default();
        waiters.retain(|waiter| !waiter.is_closed());
        waiters.push(tx);
        Err(rx)
    }

    /// Drop every waiter; their receivers see the sender go away.
    pub fn close(&self) {
        self.book.lock().waiters.clear();
    }
}

impl Book {
    fn settle(&mut self, deal: &Value) {
        let Some(id) = deal_id(deal) else {
            return;
        };
        self.opened.remove(&id);
        if let Some(waiters) = self.waiters.remove(&id) {
            for waiter in waiters {
                let _ = waiter.send(deal.clone());
            }
        }
        debug!(deal_id = %id, profit = %deal.get("profit").unwrap_or(&serde_json::Value::Null), "deal settled");

        if self.settled.insert(id.clone(), deal.clone()).is_none() {
            self.settled_order.push_back(id);
        }
        while self.settled_order.len() > SETTLED_CAPACITY {
            if let Some(oldest) = self.settled_order.pop_front() {
                self.settled.remove(&oldest);
            }
        }
    }
}

/// `{"deals":[..]}`, a bare array, or a single deal object.
fn deals_in(payload: &Value) -> Box<dyn Iterator<Item = &Value> + '_> {
    match payload {
        Value::Object(map) => match map.get("deals") {
            Some(Value::Array(deals)) => Box::new(deals.iter()),
            _ => Box::new(std::iter::once(payload)),
        },
        Value::Array(deals) => Box::new(deals.iter()),
        _ => Box::new(std::iter::empty()),
    }
}

fn deal_id(deal: &Value) -> Option<String> {
    match deal.get("id")? {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tracks_deals_from_open_to_settled() {
        let book = DealBook::new();
        book.observe(&Frame::new(ORDER_OPENED_TAG, json!({"id": "d1", "requestId": "r1"})));
        book.observe(&Frame::new(ORDER_OPENED_TAG, json!({"id": "d2"})));
        assert_eq!(book.opened().len(), 2);

        book.observe(&Frame::new(
            ORDER_CLOSED_TAG,
            json!({"profit": 0.92, "deals": [{"id": "d1", "profit": 0.92}]}),
        ));
        assert_eq!(book.opened().len(), 1);
        assert_eq!(book.settled("d1").unwrap()["profit"], 0.92);
        assert!(book.settled("d2").is_none());
    }

    #[test]
    fn opened_snapshot_replaces_local_view() {
        let book = DealBook::new();
        book.observe(&Frame::new(ORDER_OPENED_TAG, json!({"id": "gone"})));
        book.observe(&Frame::new(OPENED_DEALS_TAG, json!([{"id": 7}, {"id": 8}])));
        let mut ids: Vec<_> = book.opened().iter().map(|deal| deal["id"].clone()).collect();
        ids.sort_by_key(|id| id.as_u64());
        assert_eq!(ids, vec![json!(7), json!(8)]);
    }

    #[test]
    fn waiter_completes_when_deal_settles() {
        let book = DealBook::new();
        let Err(mut rx) = book.result_or_wait("d9") else {
            panic!("deal is not settled yet");
        };
        assert!(rx.try_recv().is_err());

        book.observe(&Frame::new(CLOSED_DEALS_TAG, json!([{"id": "d9", "profit": -1.0}])));
        assert_eq!(rx.try_recv().unwrap()["profit"], -1.0);
        assert!(book.result_or_wait("d9").is_ok());
    }

    #[test]
    fn close_drops_waiters_and_balance_is_kept() {
        let book = DealBook::new();
        let Err(mut rx) = book.result_or_wait("d1") else {
            panic!("deal is not settled yet");
        };
        book.close();
        assert!(matches!(rx.try_recv(), Err(oneshot::error::TryRecvError::Closed)));

        book.observe(&Frame::new(BALANCE_TAG, json!({"balance": 50000.0, "isDemo": 1})));
        assert_eq!(book.balance().unwrap()["balance"], 50000.0);
    }

    #[test]
    fn settled_results_are_bounded() {
        let book = DealBook::new();
        for n in 0..(SETTLED_CAPACITY + 10) {
            book.observe(&Frame::new(ORDER_CLOSED_TAG, json!({"id": n})));
        }
        assert!(book.settled("0").is_none());
        assert!(book.settled(&(SETTLED_CAPACITY + 9).to_string()).is_some());
    }
}
