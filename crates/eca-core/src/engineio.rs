//! Engine.IO v4 text packets.
//!
//! Wire format: `[type digit][payload]`, one packet per WebSocket text frame.

use crate::error::{EcaError, EcaResult};
use serde::{Deserialize, Serialize};

/// Engine.IO protocol revision served by the gateway.
pub const ENGINE_PROTOCOL: &str = "4";

/// Payload of the `open` packet sent right after the upgrade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenPayload {
    pub sid: String,
    pub upgrades: Vec<String>,
    /// Milliseconds between server pings.
    pub ping_interval: u64,
    /// Milliseconds the server waits for a pong.
    pub ping_timeout: u64,
    pub max_payload: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnginePacket {
    Open(OpenPayload),
    Close,
    Ping(Option<String>),
    Pong(Option<String>),
    Message(String),
    Upgrade,
    Noop,
}

impl EnginePacket {
    pub fn decode(frame: &str) -> EcaResult<Self> {
        let mut chars = frame.chars();
        let kind = chars
            .next()
            .ok_or_else(|| EcaError::Codec("empty engine.io packet".into()))?;
        let rest = chars.as_str();
        let data = || (!rest.is_empty()).then(|| rest.to_string());

        match kind {
            '0' => Ok(EnginePacket::Open(serde_json::from_str(rest)?)),
            '1' => Ok(EnginePacket::Close),
            '2' => Ok(EnginePacket::Ping(data())),
            '3' => Ok(EnginePacket::Pong(data())),
            '4' => Ok(EnginePacket::Message(rest.to_string())),
            '5' => Ok(EnginePacket::Upgrade),
            '6' => Ok(EnginePacket::Noop),
            other => Err(EcaError::Codec(format!(
                "unknown engine.io packet type {other:?}"
            ))),
        }
    }

    pub fn encode(&self) -> EcaResult<String> {
        let frame = match self {
            EnginePacket::Open(open) => format!("0{}", serde_json::to_string(open)?),
            EnginePacket::Close => "1".to_string(),
            EnginePacket::Ping(data) => format!("2{}", data.as_deref().unwrap_or_default()),
            EnginePacket::Pong(data) => format!("3{}", data.as_deref().unwrap_or_default()),
            EnginePacket::Message(msg) => format!("4{msg}"),
            EnginePacket::Upgrade => "5".to_string(),
            EnginePacket::Noop => "6".to_string(),
        };
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_uses_camel_case_fields() {
        let open = EnginePacket::Open(OpenPayload {
            sid: "abc".into(),
            upgrades: vec![],
            ping_interval: 25000,
            ping_timeout: 20000,
            max_payload: 1_000_000,
        });
        let frame = open.encode().unwrap();
        assert!(frame.starts_with('0'));
        assert!(frame.contains("\"pingInterval\":25000"));
        assert!(frame.contains("\"maxPayload\":1000000"));
        assert_eq!(EnginePacket::decode(&frame).unwrap(), open);
    }

    #[test]
    fn ping_probe_data_is_kept() {
        assert_eq!(
            EnginePacket::decode("2probe").unwrap(),
            EnginePacket::Ping(Some("probe".into()))
        );
        assert_eq!(EnginePacket::decode("3").unwrap(), EnginePacket::Pong(None));
        assert_eq!(
            EnginePacket::Pong(Some("probe".into())).encode().unwrap(),
            "3probe"
        );
    }

    #[test]
    fn message_carries_socketio_payload() {
        let pkt = EnginePacket::decode("42[\"notice\",\"hi\"]").unwrap();
        assert_eq!(pkt, EnginePacket::Message("2[\"notice\",\"hi\"]".into()));
    }

    #[test]
    fn rejects_empty_and_unknown() {
        assert!(EnginePacket::decode("").is_err());
        assert!(EnginePacket::decode("9").is_err());
        assert!(EnginePacket::decode("0{not json").is_err());
    }
}
