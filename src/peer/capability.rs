//! Граница с peer-connection: всё, что сигнальный автомат вызывает у
//! транспорта, и канал, по которому транспорт сообщает о событиях.

use crate::config::{CallConfig, MediaConstraints, OfferOptions};
use crate::error::{MediaError, PeerError};
use crate::peer::media::{LocalStream, LocalTrack};
use crate::peer::types::{IceCandidate, PeerEvent, PeerEventKind, SessionDescription};
use async_trait::async_trait;
use tokio::sync::mpsc;

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self, options: &OfferOptions) -> Result<SessionDescription, PeerError>;
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;
    async fn local_description(&self) -> Option<SessionDescription>;
    /// Падает, если remote description ещё не установлен
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;
    /// `stream` только для привязки трека к потоку, владеет им сессия
    async fn add_track(&self, track: &LocalTrack, stream: &LocalStream) -> Result<(), PeerError>;
    async fn transceivers(&self) -> Vec<Box<dyn Transceiver>>;
    /// Снимает все обработчики событий; после этого capability молчит
    fn detach_handlers(&self);
    async fn close(&self) -> Result<(), PeerError>;
}

#[async_trait]
pub trait Transceiver: Send + Sync {
    async fn stop(&self) -> Result<(), PeerError>;
}

#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(
        &self,
        config: &CallConfig,
        events: PeerEventSender,
    ) -> Result<Box<dyn PeerConnection>, PeerError>;
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(&self, constraints: &MediaConstraints)
        -> Result<LocalStream, MediaError>;
}

/// Отправитель событий одного конкретного peer-connection
#[derive(Debug, Clone)]
pub struct PeerEventSender {
    generation: u64,
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerEventSender {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn emit(&self, kind: PeerEventKind) {
        // сессия уже остановлена — событие никому не нужно
        let _ = self.tx.send(PeerEvent {
            generation: self.generation,
            kind,
        });
    }
}
