/*
[INPUT]:  Raw text/binary frames of the engine.io v4 / socket.io v5 stream
[OUTPUT]: Control packets and tagged application frames; encoded event frames
[POS]:    Framing layer - multiplex envelope codec
[UPDATE]: When the venue changes envelope conventions or event naming
*/

use serde::Deserialize;
use serde_json::Value;

use crate::error::{Result, SessionError};
use crate::transport::RawFrame;

/// Event carrying the authentication payload.
pub const AUTH_TAG: &str = "auth";
/// Event the venue sends when it accepts the credentials.
pub const AUTH_ACCEPTED_TAG: &str = "successauth";
/// Event the venue sends when it rejects the credentials.
pub const AUTH_REJECTED_TAG: &str = "NotAuthorized";
/// Application-level keep-alive probe event.
pub const KEEP_ALIVE_TAG: &str = "ps";

const ENGINE_PING: &str = "2";
const ENGINE_PONG: &str = "3";
const NAMESPACE_CONNECT: &str = "40";
/// Most binary attachments one event may announce.
pub const MAX_ATTACHMENTS: usize = 64;

/// One decoded application event
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub tag: String,
    pub payload: Value,
}

impl Frame {
    pub fn new(tag: impl Into<String>, payload: Value) -> Self {
        Self {
            tag: tag.into(),
            payload,
        }
    }
}

/// Engine handshake sent by the server right after the socket opens
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeInfo {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    #[serde(default)]
    pub ping_interval: u64,
    #[serde(default)]
    pub ping_timeout: u64,
    #[serde(default)]
    pub max_payload: u64,
}

/// Control-class packets: liveness evidence, never dispatched
#[derive(Debug, Clone, PartialEq)]
pub enum Control {
    Open(HandshakeInfo),
    Close,
    Ping,
    Pong,
    Noop,
    Connect(Value),
    Disconnect,
    ConnectError(Value),
    Ack(Option<u64>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Control(Control),
    Event(Frame),
}

/// Encode an application event: `42["tag",payload]`, or `42["tag"]` for `Null`.
pub fn encode_event(tag: &str, payload: &Value) -> RawFrame {
    let body = if payload.is_null() {
        Value::Array(vec![Value::from(tag)])
    } else {
        Value::Array(vec![Value::from(tag), payload.clone()])
    };
    RawFrame::Text(format!("42{body}"))
}

pub fn keep_alive_probe() -> RawFrame {
    encode_event(KEEP_ALIVE_TAG, &Value::Null)
}

pub fn engine_ping() -> RawFrame {
    RawFrame::text(ENGINE_PING)
}

pub fn engine_pong() -> RawFrame {
    RawFrame::text(ENGINE_PONG)
}

pub fn namespace_connect() -> RawFrame {
    RawFrame::text(NAMESPACE_CONNECT)
}

#[derive(Debug)]
struct PendingBinary {
    ack: bool,
    ack_id: Option<u64>,
    args: Value,
    expected: usize,
    attachments: Vec<Value>,
}

/// Stateful decoder: binary events span one text frame plus N binary frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    pending: Option<PendingBinary>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while a binary event is waiting for attachments.
    pub fn is_awaiting_attachments(&self) -> bool {
        self.pending.is_some()
    }

    /// Decode one raw frame. `Ok(None)` means more frames are needed.
    pub fn decode(&mut self, raw: RawFrame) -> Result<Option<Packet>> {
        match raw {
            RawFrame::Binary(bytes) => self.attach(bytes),
            RawFrame::Text(text) => {
                if let Some(pending) = self.pending.take() {
                    return Err(SessionError::Decode(format!(
                        "text frame while {} attachment(s) outstanding",
                        pending.expected - pending.attachments.len()
                    )));
                }
                self.decode_text(&text)
            }
        }
    }

    fn attach(&mut self, bytes: Vec<u8>) -> Result<Option<Packet>> {
        let Some(pending) = self.pending.as_mut() else {
            return Err(SessionError::Decode(
                "binary frame without a pending binary event".to_string(),
            ));
        };

        let attachment = serde_json::from_slice::<Value>(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
        pending.attachments.push(attachment);
        if pending.attachments.len() < pending.expected {
            return Ok(None);
        }

        let Some(PendingBinary {
            ack,
            ack_id,
            mut args,
            attachments,
            ..
        }) = self.pending.take()
        else {
            return Ok(None);
        };
        fill_placeholders(&mut args, &attachments);
        if ack {
            return Ok(Some(Packet::Control(Control::Ack(ack_id))));
        }
        event_from_args(args).map(|frame| Some(Packet::Event(frame)))
    }

    fn decode_text(&mut self, text: &str) -> Result<Option<Packet>> {
        let mut chars = text.chars();
        let kind = chars
            .next()
            .ok_or_else(|| SessionError::Decode("empty frame".to_string()))?;
        let rest = chars.as_str();

        let control = match kind {
            '0' => {
                let info = serde_json::from_str::<HandshakeInfo>(rest)
                    .map_err(|err| SessionError::Decode(format!("bad open packet: {err}")))?;
                Control::Open(info)
            }
            '1' => Control::Close,
            '2' => Control::Ping,
            '3' => Control::Pong,
            '5' | '6' => Control::Noop,
            '4' => return self.decode_socket_packet(rest),
            other => {
                return Err(SessionError::Decode(format!(
                    "unknown engine packet type {other:?}"
                )));
            }
        };
        Ok(Some(Packet::Control(control)))
    }

    fn decode_socket_packet(&mut self, body: &str) -> Result<Option<Packet>> {
        let mut chars = body.chars();
        let kind = chars
            .next()
            .ok_or_else(|| SessionError::Decode("empty socket packet".to_string()))?;
        let mut rest = chars.as_str();

        let attachments = if matches!(kind, '5' | '6') {
            let (count, after) = rest
                .split_once('-')
                .ok_or_else(|| SessionError::Decode("binary packet without count".to_string()))?;
            rest = after;
            let count = count
                .parse::<usize>()
                .map_err(|_| SessionError::Decode(format!("bad attachment count {count:?}")))?;
            if count > MAX_ATTACHMENTS {
                return Err(SessionError::Decode(format!(
                    "{count} attachments announced, at most {MAX_ATTACHMENTS} accepted"
                )));
            }
            count
        } else {
            0
        };

        let rest = strip_namespace(rest);
        let (ack_id, data) = split_ack_id(rest);

        match kind {
            '0' => Ok(Some(Packet::Control(Control::Connect(parse_optional(data)?)))),
            '1' => Ok(Some(Packet::Control(Control::Disconnect))),
            '4' => Ok(Some(Packet::Control(Control::ConnectError(parse_optional(
                data,
            )?)))),
            '2' => {
                let args = parse_json(data)?;
                event_from_args(args).map(|frame| Some(Packet::Event(frame)))
            }
            '3' => Ok(Some(Packet::Control(Control::Ack(ack_id)))),
            '5' | '6' => {
                let args = parse_json(data)?;
                if attachments == 0 {
                    if kind == '6' {
                        return Ok(Some(Packet::Control(Control::Ack(ack_id))));
                    }
                    return event_from_args(args).map(|frame| Some(Packet::Event(frame)));
                }
                self.pending = Some(PendingBinary {
                    ack: kind == '6',
                    ack_id,
                    args,
                    expected: attachments,
                    attachments: Vec::new(),
                });
                Ok(None)
            }
            other => Err(SessionError::Decode(format!(
                "unknown socket packet type {other:?}"
            ))),
        }
    }
}

fn strip_namespace(data: &str) -> &str {
    if !data.starts_with('/') {
        return data;
    }
    match data.split_once(',') {
        Some((_, rest)) => rest,
        None => "",
    }
}

fn split_ack_id(data: &str) -> (Option<u64>, &str) {
    let digits = data.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return (None, data);
    }
    (data[..digits].parse().ok(), &data[digits..])
}

fn parse_json(data: &str) -> Result<Value> {
    serde_json::from_str(data).map_err(|err| SessionError::Decode(format!("bad payload: {err}")))
}

fn parse_optional(data: &str) -> Result<Value> {
    if data.trim().is_empty() {
        return Ok(Value::Null);
    }
    parse_json(data)
}

fn event_from_args(args: Value) -> Result<Frame> {
    let Value::Array(mut args) = args else {
        return Err(SessionError::Decode("event payload is not an array".to_string()));
    };
    if args.is_empty() {
        return Err(SessionError::Decode("event without a name".to_string()));
    }
    let tag = match args.remove(0) {
        Value::String(tag) => tag,
        other => {
            return Err(SessionError::Decode(format!("event name is not a string: {other}")));
        }
    };
    let payload = match args.len() {
        0 => Value::Null,
        1 => args.remove(0),
        _ => Value::Array(args),
    };
    Ok(Frame { tag, payload })
}

fn fill_placeholders(value: &mut Value, attachments: &[Value]) {
    match value {
        Value::Object(map) => {
            let is_placeholder = map.get("_placeholder").and_then(Value::as_bool) == Some(true);
            if is_placeholder {
                let slot = map
                    .get("num")
                    .and_then(Value::as_u64)
                    .and_then(|num| attachments.get(num as usize));
                if let Some(attachment) = slot {
                    *value = attachment.clone();
                }
                return;
            }
            map.values_mut()
                .for_each(|child| fill_placeholders(child, attachments));
        }
        Value::Array(items) => items
            .iter_mut()
            .for_each(|child| fill_placeholders(child, attachments)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn decode_one(text: &str) -> Packet {
        FrameDecoder::new()
            .decode(RawFrame::text(text))
            .unwrap()
            .unwrap()
    }

    #[test]
    fn encodes_event_with_and_without_payload() {
        assert_eq!(
            encode_event("changeSymbol", &json!({"asset": "EURUSD_otc", "period": 60})),
            RawFrame::text(r#"42["changeSymbol",{"asset":"EURUSD_otc","period":60}]"#)
        );
        assert_eq!(keep_alive_probe(), RawFrame::text(r#"42["ps"]"#));
    }

    #[rstest]
    #[case("2", Control::Ping)]
    #[case("3", Control::Pong)]
    #[case("1", Control::Close)]
    #[case("6", Control::Noop)]
    #[case("41", Control::Disconnect)]
    #[case("40", Control::Connect(Value::Null))]
    #[case(r#"40{"sid":"abc"}"#, Control::Connect(json!({"sid": "abc"})))]
    #[case(r#"44{"message":"nope"}"#, Control::ConnectError(json!({"message": "nope"})))]
    #[case(r#"4312["ok"]"#, Control::Ack(Some(12)))]
    fn decodes_control_packets(#[case] text: &str, #[case] expected: Control) {
        assert_eq!(decode_one(text), Packet::Control(expected));
    }

    #[test]
    fn decodes_open_handshake() {
        let packet = decode_one(r#"0{"sid":"s1","upgrades":[],"pingInterval":25000,"pingTimeout":20000}"#);
        let Packet::Control(Control::Open(info)) = packet else {
            panic!("expected open packet");
        };
        assert_eq!(info.sid, "s1");
        assert_eq!(info.ping_interval, 25000);
    }

    #[test]
    fn decodes_event_argument_shapes() {
        assert_eq!(
            decode_one(r#"42["updateStream",[["EURUSD_otc",1700000000,1.08]]]"#),
            Packet::Event(Frame::new("updateStream", json!([["EURUSD_otc", 1700000000, 1.08]])))
        );
        assert_eq!(decode_one(r#"42["ps"]"#), Packet::Event(Frame::new("ps", Value::Null)));
        assert_eq!(
            decode_one(r#"42["pair",1,2]"#),
            Packet::Event(Frame::new("pair", json!([1, 2])))
        );
        // namespace and ack id are tolerated
        assert_eq!(
            decode_one(r#"42/trade,7["tick",{"p":1}]"#),
            Packet::Event(Frame::new("tick", json!({"p": 1})))
        );
    }

    #[test]
    fn binary_event_waits_for_attachment() {
        let mut decoder = FrameDecoder::new();
        let header = decoder
            .decode(RawFrame::text(
                r#"451-["successupdateBalance",{"_placeholder":true,"num":0}]"#,
            ))
            .unwrap();
        assert!(header.is_none());
        assert!(decoder.is_awaiting_attachments());

        let packet = decoder
            .decode(RawFrame::Binary(br#"{"balance":50000.0,"isDemo":1}"#.to_vec()))
            .unwrap();
        assert_eq!(
            packet,
            Some(Packet::Event(Frame::new(
                "successupdateBalance",
                json!({"balance": 50000.0, "isDemo": 1})
            )))
        );
        assert!(!decoder.is_awaiting_attachments());
    }

    #[test]
    fn binary_attachment_that_is_not_json_becomes_string() {
        let mut decoder = FrameDecoder::new();
        decoder
            .decode(RawFrame::text(r#"451-["blob",{"_placeholder":true,"num":0}]"#))
            .unwrap();
        let packet = decoder.decode(RawFrame::Binary(b"raw bytes".to_vec())).unwrap();
        assert_eq!(packet, Some(Packet::Event(Frame::new("blob", json!("raw bytes")))));
    }

    #[rstest]
    #[case("")]
    #[case("9")]
    #[case("42{not json")]
    #[case(r#"42{"tag":"x"}"#)]
    #[case("42[]")]
    #[case("42[1,2]")]
    #[case("0not-json")]
    #[case("45x-[]")]
    #[case(r#"4518446744073709551615-["x",{}]"#)]
    #[case(r#"4565-["x",{}]"#)]
    fn rejects_malformed_frames(#[case] text: &str) {
        assert!(FrameDecoder::new().decode(RawFrame::text(text)).is_err());
    }

    #[test]
    fn accepts_attachment_count_at_the_limit() {
        let mut decoder = FrameDecoder::new();
        let header = format!(r#"45{MAX_ATTACHMENTS}-["blob",{{}}]"#);
        assert!(decoder.decode(RawFrame::text(&header)).unwrap().is_none());
        assert!(decoder.is_awaiting_attachments());
    }

    #[test]
    fn rejects_orphan_binary_and_interrupted_attachments() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.decode(RawFrame::Binary(vec![1, 2, 3])).is_err());

        decoder
            .decode(RawFrame::text(r#"451-["blob",{"_placeholder":true,"num":0}]"#))
            .unwrap();
        assert!(decoder.decode(RawFrame::text("2")).is_err());
        // state is dropped after the error; the decoder keeps working
        assert_eq!(
            decoder.decode(RawFrame::text("3")).unwrap(),
            Some(Packet::Control(Control::Pong))
        );
    }
}
