use thiserror::Error;

/// Ошибки захвата локального медиа
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// Камера и/или микрофон отсутствуют
    #[error("no camera and/or microphone found")]
    NotFound,
    /// Пользователь (или политика безопасности) запретил доступ
    #[error("permission denied")]
    PermissionDenied,
    #[error("{0}")]
    Other(String),
}

/// Как ошибка медиа показывается пользователю
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaErrorClass {
    NotFound,
    /// То же самое, что пользователь отменил звонок
    Cancelled,
    Other,
}

impl MediaError {
    pub fn classify(&self) -> MediaErrorClass {
        match self {
            MediaError::NotFound => MediaErrorClass::NotFound,
            MediaError::PermissionDenied => MediaErrorClass::Cancelled,
            MediaError::Other(_) => MediaErrorClass::Other,
        }
    }
}

/// Ошибки peer-connection
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("webrtc: {0}")]
    Rtc(#[from] webrtc::Error),
    /// remote description ещё не установлен
    #[error("remote description is not set")]
    NoRemoteDescription,
    #[error("{0}")]
    Other(String),
}

/// Ошибки relay-канала
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("invalid relay configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Ошибки конфигурации
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("ICE server {0} has an empty url")]
    EmptyServerUrl(String),
    #[error("TURN server {0} requires username and credential")]
    MissingTurnCredentials(String),
    #[error("at least one ICE server must be configured")]
    NoIceServers,
    #[error("relay url: {0}")]
    RelayUrl(String),
    #[error("malformed config: {0}")]
    Json(#[from] serde_json::Error),
}

/// Общая ошибка сигнального автомата
#[derive(Error, Debug)]
pub enum CallError {
    #[error("media: {0}")]
    Media(#[from] MediaError),
    #[error("peer connection: {0}")]
    Peer(#[from] PeerError),
    #[error("operation not valid in state {0:?}")]
    InvalidState(crate::session::CallState),
    /// Соединение закрыли, пока шаг согласования был в полёте
    #[error("peer connection was released")]
    MissingPeer,
    #[error("call agent has stopped")]
    AgentStopped,
}
