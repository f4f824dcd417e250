use crate::peer::types::RemoteTrack;

/// Состояние звонка
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallState {
    Idle,
    AwaitingLocalMedia,
    Offering,
    AwaitingAnswer,
    AnsweringOffer,
    Connected,
    Closing,
    Closed,
}

impl CallState {
    /// В этих состояниях peer-connection обязан существовать
    pub fn has_peer(&self) -> bool {
        !matches!(self, CallState::Idle | CallState::Closed)
    }
}

/// События для UI / наблюдателей звонка
#[derive(Debug, Clone)]
pub enum CallEvent {
    StateChanged(CallState),
    /// Трек первого удалённого потока для вывода
    RemoteTrack(RemoteTrack),
    /// Локальное превью: id потока или `None`, когда источник снят
    LocalPreview(Option<String>),
    /// Сообщение, которое нужно показать пользователю
    Notice(String),
}

pub const NOTICE_DEVICE_NOT_FOUND: &str =
    "Unable to open your call because no camera and/or microphone were found.";

pub fn notice_generic(err: &dyn std::fmt::Display) -> String {
    format!("Error opening your camera and/or microphone: {err}")
}
