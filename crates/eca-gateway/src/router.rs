//! Event Router: named inbound events to handler logic, per namespace.
//!
//! | namespace | event    | effect                                   |
//! |-----------|----------|------------------------------------------|
//! | `/`       | `notice` | emit `reply` with `"have " + payload`    |
//! | `/chat`   | `msg`    | store payload, ack `"recv " + payload`   |
//! | `/`       | `bye`    | emit `bye` with last message, then close |
//!
//! Routing is pure: handlers only touch the [`SessionState`] passed in and
//! describe what to send in a [`Dispatch`]. The connection task performs
//! the I/O.

use crate::session::SessionState;
use eca_core::socketio::ROOT_NAMESPACE;
use eca_core::{EcaError, EcaResult, Packet};
use serde_json::Value;
use tracing::{debug, info};

const REPLY_TAG: &str = "have ";
const ACK_TAG: &str = "recv ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Root,
    Chat,
}

impl Namespace {
    pub fn parse(nsp: &str) -> Option<Self> {
        match nsp {
            ROOT_NAMESPACE => Some(Namespace::Root),
            "/chat" => Some(Namespace::Chat),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Namespace::Root => ROOT_NAMESPACE,
            Namespace::Chat => "/chat",
        }
    }
}

/// Packets to send back, in order, and whether to close afterwards.
#[derive(Debug, Default, PartialEq)]
pub struct Dispatch {
    pub outbound: Vec<Packet>,
    pub close: bool,
}

impl Dispatch {
    /// Queue a handler return value as an ACK, if the client asked for one.
    fn reply(&mut self, nsp: Namespace, ack: Option<u64>, value: &str) {
        if let Some(id) = ack {
            self.outbound
                .push(Packet::ack(nsp.as_str(), id, vec![Value::String(value.to_string())]));
        }
    }

    fn emit(&mut self, nsp: Namespace, event: &str, value: &str) {
        self.outbound.push(Packet::event(
            nsp.as_str(),
            event,
            vec![Value::String(value.to_string())],
        ));
    }
}

/// Route one inbound event.
///
/// Unknown events are ignored. A payload of the wrong shape is a
/// [`EcaError::ProtocolMisuse`] and leaves the session untouched.
pub fn route(
    nsp: Namespace,
    event: &str,
    args: &[Value],
    ack: Option<u64>,
    session: &mut SessionState,
) -> EcaResult<Dispatch> {
    let mut dispatch = Dispatch::default();

    match (nsp, event) {
        (Namespace::Root, "notice") => {
            let msg = string_arg(event, args)?;
            info!(notice = %msg, "notice");
            dispatch.emit(nsp, "reply", &format!("{REPLY_TAG}{msg}"));
        }
        (Namespace::Chat, "msg") => {
            let msg = string_arg(event, args)?;
            session.record_message(msg);
            dispatch.reply(nsp, ack, &format!("{ACK_TAG}{msg}"));
        }
        (Namespace::Root, "bye") => {
            let last = session.last_message().to_string();
            dispatch.emit(nsp, "bye", &last);
            dispatch.reply(nsp, ack, &last);
            dispatch.close = true;
        }
        _ => {
            debug!(nsp = nsp.as_str(), event, "no handler for event");
        }
    }

    Ok(dispatch)
}

fn string_arg<'a>(event: &str, args: &'a [Value]) -> EcaResult<&'a str> {
    match args.first() {
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(EcaError::ProtocolMisuse(format!(
            "{event}: expected a string payload, got {other}"
        ))),
        None => Err(EcaError::ProtocolMisuse(format!("{event}: missing payload"))),
    }
}
