//! Сигнализация p2p-звонка через relay: relay передаёт только метаданные
//! соединения (offer/answer/ICE), медиа идёт напрямую между пирами.

pub mod config;
pub mod error;
pub mod logger;
pub mod peer;
pub mod relay;
pub mod session;
pub mod signaling;
pub mod utils;

pub use config::{CallConfig, RelayConfig};
pub use error::{CallError, MediaError, PeerError, RelayError};
pub use relay::{RelayLink, RelaySubscription, SignalSender};
pub use session::{CallAgent, CallEvent, CallHandle, CallState, Session};
pub use signaling::Message;
