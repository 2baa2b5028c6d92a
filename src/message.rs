//! Wire codec: tagged JSON arrays in both directions (NIP-01, NIP-42,
//! NIP-45, NIP-77). Client frames are decoded through `serde_json::Value`
//! so a bad element produces a protocol error instead of dropping the
//! connection.

use serde_json::{json, Value};

use crate::error::ProtocolError;
use crate::event::Event;
use crate::filter::Filter;

/// Frames a client may send.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Event(Box<Event>),
    Req {
        sub_id: String,
        filters: Vec<Filter>,
    },
    Close(String),
    Count {
        sub_id: String,
        filters: Vec<Filter>,
    },
    Auth(Box<Event>),
    NegOpen {
        sub_id: String,
        filter: Box<Filter>,
        initial_msg: String,
    },
    NegMsg {
        sub_id: String,
        msg: String,
    },
    NegClose {
        sub_id: String,
    },
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        let arr = value.as_array().ok_or(ProtocolError::NotAnArray)?;
        let verb = arr
            .first()
            .ok_or(ProtocolError::EmptyArray)?
            .as_str()
            .ok_or(ProtocolError::NotAnArray)?;

        match verb {
            "EVENT" => {
                let event = decode_event(arr.get(1), "EVENT")?;
                Ok(ClientMessage::Event(Box::new(event)))
            }
            "REQ" => {
                let (sub_id, filters) = decode_sub_and_filters(arr, "REQ")?;
                Ok(ClientMessage::Req { sub_id, filters })
            }
            "CLOSE" => {
                let sub_id = decode_sub_id(arr.get(1), "CLOSE")?;
                Ok(ClientMessage::Close(sub_id))
            }
            "COUNT" => {
                let (sub_id, filters) = decode_sub_and_filters(arr, "COUNT")?;
                Ok(ClientMessage::Count { sub_id, filters })
            }
            "AUTH" => {
                let event = decode_event(arr.get(1), "AUTH")?;
                Ok(ClientMessage::Auth(Box::new(event)))
            }
            "NEG-OPEN" => {
                let sub_id = decode_sub_id(arr.get(1), "NEG-OPEN")?;
                let filter: Filter = decode_element(arr.get(2), "NEG-OPEN", "filter")?;
                // Some clients still send the draft five-element form with
                // an id-length at index 3; the message is the last element
                // either way.
                let initial_msg = match arr.len() {
                    4 => decode_hex_str(arr.get(3), "NEG-OPEN")?,
                    5 => decode_hex_str(arr.get(4), "NEG-OPEN")?,
                    n => {
                        return Err(ProtocolError::BadShape {
                            verb: "NEG-OPEN",
                            detail: format!("expected 4 elements, got {n}"),
                        })
                    }
                };
                Ok(ClientMessage::NegOpen {
                    sub_id,
                    filter: Box::new(filter),
                    initial_msg,
                })
            }
            "NEG-MSG" => {
                let sub_id = decode_sub_id(arr.get(1), "NEG-MSG")?;
                let msg = decode_hex_str(arr.get(2), "NEG-MSG")?;
                Ok(ClientMessage::NegMsg { sub_id, msg })
            }
            "NEG-CLOSE" => {
                let sub_id = decode_sub_id(arr.get(1), "NEG-CLOSE")?;
                Ok(ClientMessage::NegClose { sub_id })
            }
            other => Err(ProtocolError::UnknownVerb(other.to_string())),
        }
    }
}

fn decode_event(value: Option<&Value>, verb: &'static str) -> Result<Event, ProtocolError> {
    decode_element(value, verb, "event")
}

fn decode_element<T: serde::de::DeserializeOwned>(
    value: Option<&Value>,
    verb: &'static str,
    what: &str,
) -> Result<T, ProtocolError> {
    let value = value.ok_or(ProtocolError::BadShape {
        verb,
        detail: format!("missing {what}"),
    })?;
    serde_json::from_value(value.clone()).map_err(|e| ProtocolError::BadShape {
        verb,
        detail: format!("bad {what}: {e}"),
    })
}

fn decode_sub_id(value: Option<&Value>, verb: &'static str) -> Result<String, ProtocolError> {
    value
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or(ProtocolError::BadShape {
            verb,
            detail: "missing subscription id".to_string(),
        })
}

fn decode_hex_str(value: Option<&Value>, verb: &'static str) -> Result<String, ProtocolError> {
    let s = value
        .and_then(Value::as_str)
        .ok_or(ProtocolError::BadShape {
            verb,
            detail: "missing hex payload".to_string(),
        })?;
    Ok(s.to_string())
}

fn decode_sub_and_filters(
    arr: &[Value],
    verb: &'static str,
) -> Result<(String, Vec<Filter>), ProtocolError> {
    let sub_id = decode_sub_id(arr.get(1), verb)?;
    if arr.len() < 3 {
        return Err(ProtocolError::BadShape {
            verb,
            detail: "expected at least one filter".to_string(),
        });
    }
    let filters = arr[2..]
        .iter()
        .map(|v| decode_element(Some(v), verb, "filter"))
        .collect::<Result<Vec<Filter>, _>>()?;
    Ok((sub_id, filters))
}

/// Frames the relay sends.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    Event { sub_id: String, event: Event },
    Ok { event_id: String, accepted: bool, message: String },
    Eose { sub_id: String },
    Closed { sub_id: String, message: String },
    Notice { message: String },
    Auth { challenge: String },
    Count { sub_id: String, count: u64 },
    NegMsg { sub_id: String, msg: String },
    NegErr { sub_id: String, message: String },
}

impl RelayMessage {
    pub fn event(sub_id: impl Into<String>, event: Event) -> Self {
        RelayMessage::Event {
            sub_id: sub_id.into(),
            event,
        }
    }

    pub fn ok(event_id: impl Into<String>, accepted: bool, message: impl Into<String>) -> Self {
        RelayMessage::Ok {
            event_id: event_id.into(),
            accepted,
            message: message.into(),
        }
    }

    pub fn eose(sub_id: impl Into<String>) -> Self {
        RelayMessage::Eose {
            sub_id: sub_id.into(),
        }
    }

    pub fn closed(sub_id: impl Into<String>, message: impl Into<String>) -> Self {
        RelayMessage::Closed {
            sub_id: sub_id.into(),
            message: message.into(),
        }
    }

    pub fn notice(message: impl Into<String>) -> Self {
        RelayMessage::Notice {
            message: message.into(),
        }
    }

    pub fn auth(challenge: impl Into<String>) -> Self {
        RelayMessage::Auth {
            challenge: challenge.into(),
        }
    }

    pub fn count(sub_id: impl Into<String>, count: u64) -> Self {
        RelayMessage::Count {
            sub_id: sub_id.into(),
            count,
        }
    }

    pub fn neg_msg(sub_id: impl Into<String>, msg: impl Into<String>) -> Self {
        RelayMessage::NegMsg {
            sub_id: sub_id.into(),
            msg: msg.into(),
        }
    }

    pub fn neg_err(sub_id: impl Into<String>, message: impl Into<String>) -> Self {
        RelayMessage::NegErr {
            sub_id: sub_id.into(),
            message: message.into(),
        }
    }

    pub fn as_json(&self) -> String {
        let value = match self {
            RelayMessage::Event { sub_id, event } => json!(["EVENT", sub_id, event]),
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => json!(["OK", event_id, accepted, message]),
            RelayMessage::Eose { sub_id } => json!(["EOSE", sub_id]),
            RelayMessage::Closed { sub_id, message } => json!(["CLOSED", sub_id, message]),
            RelayMessage::Notice { message } => json!(["NOTICE", message]),
            RelayMessage::Auth { challenge } => json!(["AUTH", challenge]),
            RelayMessage::Count { sub_id, count } => {
                json!(["COUNT", sub_id, { "count": count }])
            }
            RelayMessage::NegMsg { sub_id, msg } => json!(["NEG-MSG", sub_id, msg]),
            RelayMessage::NegErr { sub_id, message } => json!(["NEG-ERR", sub_id, message]),
        };
        value.to_string()
    }
}
