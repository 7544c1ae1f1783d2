/*
[INPUT]:  Command tag, opaque JSON payload, expected response events
[OUTPUT]: Command values understood by the request correlator
[POS]:    Command layer - request descriptions and venue command builders
[UPDATE]: When adding venue commands or correlation modes
*/

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::deals::{BALANCE_TAG, ORDER_OPENED_TAG};
use crate::error::{Result, SessionError};

pub const MIN_ORDER_AMOUNT: f64 = 1.0;
pub const MAX_ORDER_AMOUNT: f64 = 50_000.0;
pub const MIN_ORDER_DURATION: Duration = Duration::from_secs(5);
pub const MAX_ORDER_DURATION: Duration = Duration::from_secs(12 * 60 * 60);

/// How a command's response is matched to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Correlation {
    /// The response echoes `payload[field]`; many may be in flight
    ById { field: String },
    /// No id on the wire: one request per response event in flight
    Serialized,
    /// Nothing comes back; resolves once queued for the writer
    FireAndForget,
}

/// One outgoing request
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub tag: String,
    pub payload: Value,
    pub response_tag: Option<String>,
    pub failure_tag: Option<String>,
    pub correlation: Correlation,
    pub timeout: Option<Duration>,
}

impl Command {
    /// A fire-and-forget command.
    pub fn new(tag: impl Into<String>, payload: Value) -> Self {
        Self {
            tag: tag.into(),
            payload,
            response_tag: None,
            failure_tag: None,
            correlation: Correlation::FireAndForget,
            timeout: None,
        }
    }

    /// Wait for `response_tag`. Without an id field the class is serialized.
    pub fn expect(mut self, response_tag: impl Into<String>) -> Self {
        self.response_tag = Some(response_tag.into());
        if self.correlation == Correlation::FireAndForget {
            self.correlation = Correlation::Serialized;
        }
        self
    }

    /// Complete with `Rejected` when `failure_tag` arrives instead.
    pub fn or_fail_on(mut self, failure_tag: impl Into<String>) -> Self {
        self.failure_tag = Some(failure_tag.into());
        self
    }

    /// Match responses on `payload[field]`, generating an id if absent.
    pub fn correlate_by(mut self, field: impl Into<String>) -> Self {
        self.correlation = Correlation::ById {
            field: field.into(),
        };
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn expects_response(&self) -> bool {
        self.response_tag.is_some() && self.correlation != Correlation::FireAndForget
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderDirection {
    Call,
    Put,
}

impl OrderDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderDirection::Call => "call",
            OrderDirection::Put => "put",
        }
    }
}

/// Place a binary option; answered by `successopenOrder` / `failopenOrder`
/// carrying the same `requestId`.
///
/// Amounts outside 1..=50000 and durations outside 5 s..=12 h are refused
/// before anything is sent.
pub fn open_order(
    asset: &str,
    amount: f64,
    direction: OrderDirection,
    duration: Duration,
    is_demo: bool,
) -> Result<Command> {
    if asset.is_empty() {
        return Err(SessionError::Config("order asset is empty".to_string()));
    }
    if !(MIN_ORDER_AMOUNT..=MAX_ORDER_AMOUNT).contains(&amount) {
        return Err(SessionError::Config(format!(
            "order amount {amount} outside {MIN_ORDER_AMOUNT}..={MAX_ORDER_AMOUNT}"
        )));
    }
    if !(MIN_ORDER_DURATION..=MAX_ORDER_DURATION).contains(&duration) {
        return Err(SessionError::Config(format!(
            "order duration {}s outside {}..={}s",
            duration.as_secs(),
            MIN_ORDER_DURATION.as_secs(),
            MAX_ORDER_DURATION.as_secs()
        )));
    }
    let command = Command::new(
        "openOrder",
        json!({
            "asset": asset,
            "amount": amount,
            "action": direction.as_str(),
            "isDemo": u8::from(is_demo),
            "optionType": 100,
            "time": duration.as_secs(),
        }),
    )
    .expect(ORDER_OPENED_TAG)
    .or_fail_on("failopenOrder")
    .correlate_by("requestId");
    Ok(command)
}

/// Ask for the account balance; answered by `successupdateBalance`.
pub fn get_balance() -> Command {
    Command::new("getBalance", Value::Null).expect(BALANCE_TAG)
}

/// Request candles ending at `end_time` (unix seconds). The venue echoes no
/// id, so these requests go out one at a time.
pub fn load_history_period(asset: &str, period: Duration, end_time: i64, offset: i64) -> Command {
    Command::new(
        "loadHistoryPeriod",
        json!({
            "asset": asset,
            "index": end_time * 100,
            "offset": offset,
            "period": period.as_secs(),
            "time": end_time,
        }),
    )
    .expect("loadHistoryPeriod")
}

/// Switch the price stream to `asset`.
pub fn change_symbol(asset: &str, period: Duration) -> Command {
    Command::new(
        "changeSymbol",
        json!({ "asset": asset, "period": period.as_secs() }),
    )
}
