/*
[INPUT]:  Raw SSID string captured from a browser session, or individual fields
[OUTPUT]: Credentials and the auth frame sent during the handshake
[POS]:    Auth layer - session identity
[UPDATE]: When the venue changes the auth frame shape
*/

use std::fmt;

use serde_json::{Map, Value};

use crate::codec::{self, FrameDecoder, Packet};
use crate::error::{Result, SessionError};
use crate::transport::RawFrame;

/// Platform id the web terminal reports.
pub const DEFAULT_PLATFORM: u64 = 2;

/// Authentication identity of one session
#[derive(Clone, PartialEq)]
pub struct Credentials {
    session: String,
    is_demo: bool,
    uid: u64,
    platform: u64,
    // flags captured along with a raw SSID, sent back verbatim
    extra: Map<String, Value>,
}

impl Credentials {
    pub fn new(session: impl Into<String>, is_demo: bool, uid: u64) -> Self {
        Self {
            session: session.into(),
            is_demo,
            uid,
            platform: DEFAULT_PLATFORM,
            extra: Map::new(),
        }
    }

    pub fn with_platform(mut self, platform: u64) -> Self {
        self.platform = platform;
        self
    }

    /// Parse a raw SSID such as
    /// `42["auth",{"session":"...","isDemo":1,"uid":123,"platform":2}]`.
    pub fn from_ssid(ssid: &str) -> Result<Self> {
        let packet = FrameDecoder::new()
            .decode(RawFrame::text(ssid.trim()))
            .map_err(|err| SessionError::Config(format!("unreadable ssid: {err}")))?;

        let Some(Packet::Event(frame)) = packet else {
            return Err(SessionError::Config("ssid is not an event frame".to_string()));
        };
        if frame.tag != codec::AUTH_TAG {
            return Err(SessionError::Config(format!(
                "ssid carries {} instead of auth",
                frame.tag
            )));
        }
        let Value::Object(mut fields) = frame.payload else {
            return Err(SessionError::Config("ssid payload is not an object".to_string()));
        };

        let session = match fields.remove("session") {
            Some(Value::String(session)) if !session.is_empty() => session,
            _ => return Err(SessionError::Config("ssid has no session token".to_string())),
        };
        let is_demo = fields.remove("isDemo").map(|value| truthy(&value)).unwrap_or(false);
        let uid = fields
            .remove("uid")
            .as_ref()
            .and_then(as_u64)
            .ok_or_else(|| SessionError::Config("ssid has no numeric uid".to_string()))?;
        let platform = fields
            .remove("platform")
            .as_ref()
            .and_then(as_u64)
            .unwrap_or(DEFAULT_PLATFORM);

        Ok(Self {
            session,
            is_demo,
            uid,
            platform,
            extra: fields,
        })
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn is_demo(&self) -> bool {
        self.is_demo
    }

    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub fn platform(&self) -> u64 {
        self.platform
    }

    /// JSON object carried by the auth event.
    pub fn auth_payload(&self) -> Value {
        let mut payload = Map::new();
        payload.insert("session".to_string(), Value::from(self.session.clone()));
        payload.insert("isDemo".to_string(), Value::from(u8::from(self.is_demo)));
        payload.insert("uid".to_string(), Value::from(self.uid));
        payload.insert("platform".to_string(), Value::from(self.platform));
        for (key, value) in &self.extra {
            payload.insert(key.clone(), value.clone());
        }
        Value::Object(payload)
    }

    pub fn auth_frame(&self) -> RawFrame {
        codec::encode_event(codec::AUTH_TAG, &self.auth_payload())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("session", &"<redacted>")
            .field("is_demo", &self.is_demo)
            .field("uid", &self.uid)
            .field("platform", &self.platform)
            .finish()
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_i64() != Some(0),
        Value::String(text) => matches!(text.as_str(), "1" | "true"),
        _ => false,
    }
}

fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SSID: &str = r#"42["auth",{"session":"h9gku7n5qesi0ashsfop829bc5","isDemo":1,"uid":80056933,"platform":2,"isFastHistory":true,"isOptimized":true}]"#;

    #[test]
    fn parses_browser_ssid() {
        let credentials = Credentials::from_ssid(SSID).unwrap();
        assert_eq!(credentials.session(), "h9gku7n5qesi0ashsfop829bc5");
        assert!(credentials.is_demo());
        assert_eq!(credentials.uid(), 80056933);
        assert_eq!(credentials.platform(), 2);
    }

    #[test]
    fn ssid_flags_round_trip_into_auth_payload() {
        let credentials = Credentials::from_ssid(SSID).unwrap();
        assert_eq!(
            credentials.auth_payload(),
            json!({
                "session": "h9gku7n5qesi0ashsfop829bc5",
                "isDemo": 1,
                "uid": 80056933,
                "platform": 2,
                "isFastHistory": true,
                "isOptimized": true,
            })
        );
    }

    #[test]
    fn hand_built_credentials_send_only_recognized_fields() {
        let credentials = Credentials::new("token", false, 42).with_platform(3);
        let RawFrame::Text(text) = credentials.auth_frame() else {
            panic!("auth frame must be text");
        };
        assert_eq!(
            text,
            r#"42["auth",{"isDemo":0,"platform":3,"session":"token","uid":42}]"#
        );
    }

    #[test]
    fn rejects_unusable_ssids() {
        assert!(Credentials::from_ssid("plain-token").is_err());
        assert!(Credentials::from_ssid(r#"42["other",{"session":"x","uid":1}]"#).is_err());
        assert!(Credentials::from_ssid(r#"42["auth",{"uid":1}]"#).is_err());
        assert!(Credentials::from_ssid(r#"42["auth",{"session":"x"}]"#).is_err());
    }

    #[test]
    fn debug_output_hides_session_token() {
        let credentials = Credentials::new("secret-token", true, 7);
        let rendered = format!("{credentials:?}");
        assert!(!rendered.contains("secret-token"));
        assert!(rendered.contains("uid: 7"));
    }
}
