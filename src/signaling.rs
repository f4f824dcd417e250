//! Протокол relay: JSON `{type, data}` поверх WebSocket.

use crate::peer::types::{IceCandidate, SessionDescription};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const TYPE_OFFER: &str = "offer";
pub const TYPE_ANSWER: &str = "answer";
pub const TYPE_ICE_CANDIDATE: &str = "ice-candidate";
pub const TYPE_HANGUP: &str = "hangup";

/// Одно сообщение relay
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
    Hangup,
    /// Тип, которого нет в текущей версии протокола
    Unknown { kind: String, data: Value },
}

/// Как сообщение выглядит на проводе
#[derive(Serialize, Deserialize, Debug, Clone)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

impl Message {
    pub fn kind(&self) -> &str {
        match self {
            Message::Offer(_) => TYPE_OFFER,
            Message::Answer(_) => TYPE_ANSWER,
            Message::IceCandidate(_) => TYPE_ICE_CANDIDATE,
            Message::Hangup => TYPE_HANGUP,
            Message::Unknown { kind, .. } => kind,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        let data = match self {
            Message::Offer(desc) | Message::Answer(desc) => serde_json::to_value(desc)?,
            Message::IceCandidate(cand) => serde_json::to_value(cand)?,
            // пустая строка, как у браузерных клиентов
            Message::Hangup => Value::String(String::new()),
            Message::Unknown { data, .. } => data.clone(),
        };
        serde_json::to_string(&Envelope {
            kind: self.kind().to_string(),
            data,
        })
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        let Envelope { kind, data } = serde_json::from_str(raw)?;
        let msg = match kind.as_str() {
            TYPE_OFFER => Message::Offer(serde_json::from_value(data)?),
            TYPE_ANSWER => Message::Answer(serde_json::from_value(data)?),
            TYPE_ICE_CANDIDATE => Message::IceCandidate(serde_json::from_value(data)?),
            // data у hangup игнорируется
            TYPE_HANGUP => Message::Hangup,
            _ => Message::Unknown { kind, data },
        };
        Ok(msg)
    }
}
