//! Socket.IO v5 packets carried inside Engine.IO `message` packets.
//!
//! Wire format: `<type>[/<namespace>,][<ack id>][<json data>]`. The root
//! namespace `/` is implicit and never written out.

use crate::error::{EcaError, EcaResult};
use serde_json::{json, Value};

pub const ROOT_NAMESPACE: &str = "/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Connect,
    Disconnect,
    Event,
    Ack,
    ConnectError,
}

impl PacketKind {
    fn from_digit(c: char) -> EcaResult<Self> {
        match c {
            '0' => Ok(PacketKind::Connect),
            '1' => Ok(PacketKind::Disconnect),
            '2' => Ok(PacketKind::Event),
            '3' => Ok(PacketKind::Ack),
            '4' => Ok(PacketKind::ConnectError),
            '5' | '6' => Err(EcaError::Codec(
                "binary attachments are not supported".into(),
            )),
            other => Err(EcaError::Codec(format!(
                "unknown socket.io packet type {other:?}"
            ))),
        }
    }

    fn digit(self) -> char {
        match self {
            PacketKind::Connect => '0',
            PacketKind::Disconnect => '1',
            PacketKind::Event => '2',
            PacketKind::Ack => '3',
            PacketKind::ConnectError => '4',
        }
    }
}

/// A decoded Socket.IO packet.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub kind: PacketKind,
    pub nsp: String,
    pub id: Option<u64>,
    pub data: Option<Value>,
}

impl Packet {
    /// `CONNECT` acknowledgement carrying the namespace session id.
    pub fn connect(nsp: &str, sid: &str) -> Self {
        Self {
            kind: PacketKind::Connect,
            nsp: nsp.to_string(),
            id: None,
            data: Some(json!({ "sid": sid })),
        }
    }

    pub fn connect_error(nsp: &str, message: &str) -> Self {
        Self {
            kind: PacketKind::ConnectError,
            nsp: nsp.to_string(),
            id: None,
            data: Some(json!({ "message": message })),
        }
    }

    pub fn disconnect(nsp: &str) -> Self {
        Self {
            kind: PacketKind::Disconnect,
            nsp: nsp.to_string(),
            id: None,
            data: None,
        }
    }

    /// An `EVENT` with a name and its arguments.
    pub fn event(nsp: &str, name: &str, args: Vec<Value>) -> Self {
        let mut data = Vec::with_capacity(args.len() + 1);
        data.push(Value::String(name.to_string()));
        data.extend(args);
        Self {
            kind: PacketKind::Event,
            nsp: nsp.to_string(),
            id: None,
            data: Some(Value::Array(data)),
        }
    }

    pub fn ack(nsp: &str, id: u64, args: Vec<Value>) -> Self {
        Self {
            kind: PacketKind::Ack,
            nsp: nsp.to_string(),
            id: Some(id),
            data: Some(Value::Array(args)),
        }
    }

    /// Event name and arguments, if this is a well-formed `EVENT`.
    pub fn event_parts(&self) -> EcaResult<(&str, &[Value])> {
        if self.kind != PacketKind::Event {
            return Err(EcaError::ProtocolMisuse(format!(
                "expected EVENT, got {:?}",
                self.kind
            )));
        }
        match self.data.as_ref() {
            Some(Value::Array(items)) => match items.split_first() {
                Some((Value::String(name), args)) => Ok((name.as_str(), args)),
                _ => Err(EcaError::ProtocolMisuse(
                    "event payload must start with an event name".into(),
                )),
            },
            _ => Err(EcaError::ProtocolMisuse(
                "event payload must be an array".into(),
            )),
        }
    }

    pub fn decode(input: &str) -> EcaResult<Self> {
        let mut chars = input.chars();
        let kind = PacketKind::from_digit(
            chars
                .next()
                .ok_or_else(|| EcaError::Codec("empty socket.io packet".into()))?,
        )?;
        let mut rest = chars.as_str();

        let nsp = if rest.starts_with('/') {
            // A namespace without a trailing comma ends the packet.
            match rest.find(',') {
                Some(idx) => {
                    let nsp = &rest[..idx];
                    rest = &rest[idx + 1..];
                    nsp.to_string()
                }
                None => {
                    let nsp = rest.to_string();
                    rest = "";
                    nsp
                }
            }
        } else {
            ROOT_NAMESPACE.to_string()
        };

        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        let id = if digits > 0 {
            let id = rest[..digits]
                .parse::<u64>()
                .map_err(|e| EcaError::Codec(format!("invalid ack id: {e}")))?;
            rest = &rest[digits..];
            Some(id)
        } else {
            None
        };

        let data = if rest.is_empty() {
            None
        } else {
            Some(serde_json::from_str(rest)?)
        };

        Ok(Self {
            kind,
            nsp,
            id,
            data,
        })
    }

    pub fn encode(&self) -> EcaResult<String> {
        let mut out = String::new();
        out.push(self.kind.digit());
        if self.nsp != ROOT_NAMESPACE {
            out.push_str(&self.nsp);
            out.push(',');
        }
        if let Some(id) = self.id {
            out.push_str(&id.to_string());
        }
        if let Some(data) = &self.data {
            out.push_str(&serde_json::to_string(data)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_root_event() {
        let pkt = Packet::decode("2[\"notice\",\"hello\"]").unwrap();
        assert_eq!(pkt.kind, PacketKind::Event);
        assert_eq!(pkt.nsp, "/");
        assert_eq!(pkt.id, None);
        let (name, args) = pkt.event_parts().unwrap();
        assert_eq!(name, "notice");
        assert_eq!(args, &[json!("hello")]);
    }

    #[test]
    fn decode_namespaced_event_with_ack_id() {
        let pkt = Packet::decode("2/chat,12[\"msg\",\"a\"]").unwrap();
        assert_eq!(pkt.nsp, "/chat");
        assert_eq!(pkt.id, Some(12));
        assert_eq!(pkt.event_parts().unwrap().0, "msg");
    }

    #[test]
    fn decode_namespace_connect_without_data() {
        let pkt = Packet::decode("0/chat,").unwrap();
        assert_eq!(pkt.kind, PacketKind::Connect);
        assert_eq!(pkt.nsp, "/chat");
        assert!(pkt.data.is_none());

        // Trailing comma is optional when nothing follows.
        assert_eq!(Packet::decode("1/chat").unwrap().nsp, "/chat");
        assert_eq!(Packet::decode("0").unwrap().nsp, "/");
    }

    #[test]
    fn encode_omits_root_namespace() {
        let out = Packet::event("/", "reply", vec![json!("have x")])
            .encode()
            .unwrap();
        assert_eq!(out, "2[\"reply\",\"have x\"]");

        let ack = Packet::ack("/chat", 3, vec![json!("recv a")]).encode().unwrap();
        assert_eq!(ack, "3/chat,3[\"recv a\"]");

        assert_eq!(Packet::disconnect("/").encode().unwrap(), "1");
    }

    #[test]
    fn connect_ack_carries_sid() {
        let out = Packet::connect("/chat", "s1").encode().unwrap();
        assert_eq!(out, "0/chat,{\"sid\":\"s1\"}");
    }

    #[test]
    fn rejects_binary_and_garbage() {
        assert!(Packet::decode("51-[\"x\",{\"_placeholder\":true,\"num\":0}]").is_err());
        assert!(Packet::decode("").is_err());
        assert!(Packet::decode("2[\"unterminated\"").is_err());
    }

    #[test]
    fn event_parts_rejects_nameless_payload() {
        let pkt = Packet::decode("2[42]").unwrap();
        assert!(matches!(pkt.event_parts(), Err(EcaError::ProtocolMisuse(_))));
        let pkt = Packet::decode("2{\"a\":1}").unwrap();
        assert!(pkt.event_parts().is_err());
    }
}
