//! Сигнальный автомат одного звонка.
//!
//! Все обработчики берут `&mut self` и вызываются из одного цикла событий
//! (`agent::CallAgent`), поэтому два обработчика одной сессии никогда не
//! выполняются одновременно. Асинхронные шаги согласования просто `await`ятся
//! внутри обработчика, и следующее событие ждёт их завершения.

pub mod agent;
pub mod state;

#[cfg(test)]
mod tests;

pub use agent::{CallAgent, CallHandle};
pub use state::{CallEvent, CallState};

use crate::config::CallConfig;
use crate::error::{CallError, MediaError, MediaErrorClass};
use crate::logger::analyze_candidates;
use crate::peer::capability::{MediaDevices, PeerConnection, PeerEventSender, PeerFactory};
use crate::peer::media::LocalStream;
use crate::peer::types::{IceCandidate, PeerEvent, PeerEventKind, RemoteTrack, SessionDescription};
use crate::relay::SignalSender;
use crate::signaling::Message;
use crate::utils::random_id;
use state::{notice_generic, NOTICE_DEVICE_NOT_FOUND};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::signaling_state::RTCSignalingState;

const EVENT_CHANNEL_CAPACITY: usize = 64;

pub struct Session {
    id: String,
    config: CallConfig,
    state: watch::Sender<CallState>,
    peer: Option<Box<dyn PeerConnection>>,
    /// Поколение текущего peer-connection; события старых поколений отбрасываются
    generation: u64,
    tracks_attached: bool,
    remote_description_set: bool,
    local_stream: Option<LocalStream>,
    /// Кандидаты, полученные до установки remote description
    pending_candidates: Vec<IceCandidate>,
    /// Поток, уже отданный на вывод
    remote_stream: Option<String>,
    factory: Arc<dyn PeerFactory>,
    media: Arc<dyn MediaDevices>,
    relay: Arc<dyn SignalSender>,
    peer_events: mpsc::UnboundedSender<PeerEvent>,
    events: broadcast::Sender<CallEvent>,
}

impl Session {
    /// Вторая половина пары: события capability для цикла событий
    pub fn new(
        config: CallConfig,
        factory: Arc<dyn PeerFactory>,
        media: Arc<dyn MediaDevices>,
        relay: Arc<dyn SignalSender>,
    ) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (peer_events, peer_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (state, _) = watch::channel(CallState::Idle);
        let session = Self {
            id: random_id(),
            config,
            state,
            peer: None,
            generation: 0,
            tracks_attached: false,
            remote_description_set: false,
            local_stream: None,
            pending_candidates: Vec::new(),
            remote_stream: None,
            factory,
            media,
            relay,
            peer_events,
            events,
        };
        (session, peer_rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> CallState {
        *self.state.borrow()
    }

    pub fn has_peer(&self) -> bool {
        self.peer.is_some()
    }

    pub fn local_stream(&self) -> Option<&LocalStream> {
        self.local_stream.as_ref()
    }

    pub fn pending_candidates(&self) -> &[IceCandidate] {
        &self.pending_candidates
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    pub fn watch_state(&self) -> watch::Receiver<CallState> {
        self.state.subscribe()
    }

    // ========== USER INTENTS ==========

    /// Исходящий звонок: peer → локальное медиа → offer → relay
    pub async fn start_call(&mut self) -> Result<(), CallError> {
        self.renew_if_closed();
        let state = self.state();
        if state != CallState::Idle {
            tracing::warn!(session = %self.id, "start_call ignored in state {state:?}");
            return Err(CallError::InvalidState(state));
        }

        tracing::info!(session = %self.id, "starting call");
        let result = self.offer_chain().await;
        if let Err(e) = &result {
            self.handle_negotiation_error(e).await;
        }
        result
    }

    /// Отправляет hangup и закрывает звонок. На Idle/Closed ничего не делает.
    pub async fn hang_up(&mut self) {
        let state = self.state();
        if matches!(state, CallState::Idle | CallState::Closed) {
            tracing::debug!(session = %self.id, "hang_up ignored in state {state:?}");
            return;
        }
        self.relay.send(&Message::Hangup);
        self.close_call().await;
    }

    // ========== RELAY MESSAGES ==========

    pub async fn on_message(&mut self, msg: Message) {
        tracing::debug!(
            session = %self.id,
            state = ?self.state(),
            "handling {} message",
            msg.kind()
        );
        match msg {
            Message::Offer(offer) => self.handle_offer(offer).await,
            Message::Answer(answer) => self.handle_answer(answer).await,
            Message::IceCandidate(candidate) => self.handle_remote_candidate(candidate).await,
            Message::Hangup => self.close_call().await,
            Message::Unknown { kind, .. } => {
                tracing::info!("unknown message of type {kind}");
            }
        }
    }

    async fn handle_offer(&mut self, offer: SessionDescription) {
        self.renew_if_closed();
        if let Err(e) = self.answer_chain(offer).await {
            self.handle_negotiation_error(&e).await;
        }
    }

    async fn handle_answer(&mut self, answer: SessionDescription) {
        let state = self.state();
        if state != CallState::AwaitingAnswer {
            tracing::warn!(session = %self.id, "ignoring answer in state {state:?}");
            return;
        }
        if let Err(e) = self.accept_answer(answer).await {
            self.handle_negotiation_error(&e).await;
        }
    }

    async fn handle_remote_candidate(&mut self, candidate: IceCandidate) {
        if self.state() == CallState::Closed {
            tracing::debug!(session = %self.id, "dropping candidate for closed call");
            return;
        }

        // Если remote description уже установлен, применяем кандидат сразу
        if self.remote_description_set {
            if let Some(peer) = self.peer.as_deref() {
                if let Err(e) = peer.add_ice_candidate(candidate).await {
                    tracing::warn!(session = %self.id, "got Error applying candidate: {e}");
                }
                return;
            }
        }

        tracing::debug!(session = %self.id, "Remote description not set yet, queuing candidate");
        self.pending_candidates.push(candidate);
    }

    // ========== CAPABILITY EVENTS ==========

    pub async fn on_peer_event(&mut self, event: PeerEvent) {
        if event.generation != self.generation || self.peer.is_none() {
            tracing::trace!(
                session = %self.id,
                "dropping event of released peer connection: {:?}",
                event.kind
            );
            return;
        }

        match event.kind {
            PeerEventKind::IceCandidate(Some(candidate)) => {
                self.relay.send(&Message::IceCandidate(candidate));
            }
            PeerEventKind::IceCandidate(None) => {
                tracing::debug!(session = %self.id, "ICE candidate gathering completed");
            }
            PeerEventKind::IceConnectionState(st) => match st {
                RTCIceConnectionState::Closed
                | RTCIceConnectionState::Failed
                | RTCIceConnectionState::Disconnected => {
                    tracing::info!(session = %self.id, "ICE connection {st:?}, closing call");
                    self.close_call().await;
                }
                _ => tracing::debug!(session = %self.id, "ICE connection state: {st:?}"),
            },
            PeerEventKind::SignalingState(RTCSignalingState::Closed) => {
                self.close_call().await;
            }
            PeerEventKind::SignalingState(st) => {
                tracing::debug!(session = %self.id, "signaling state: {st:?}");
            }
            PeerEventKind::Track(track) => self.attach_remote_track(track),
        }
    }

    fn attach_remote_track(&mut self, track: RemoteTrack) {
        match &self.remote_stream {
            Some(stream) if *stream != track.stream_id => {
                tracing::debug!(
                    session = %self.id,
                    "ignoring track of additional remote stream {}",
                    track.stream_id
                );
                return;
            }
            Some(_) => {}
            None => self.remote_stream = Some(track.stream_id.clone()),
        }
        tracing::info!(
            session = %self.id,
            "remote {} track {} of stream {}",
            track.kind,
            track.track_id,
            track.stream_id
        );
        self.emit(CallEvent::RemoteTrack(track));
    }

    // ========== NEGOTIATION CHAINS ==========

    async fn offer_chain(&mut self) -> Result<(), CallError> {
        self.create_peer().await?;
        self.set_state(CallState::AwaitingLocalMedia);
        self.start_local_media().await?;

        self.set_state(CallState::Offering);
        self.attach_local_tracks().await?;

        let peer = self.peer()?;
        let offer = peer.create_offer(&self.config.offer).await?;
        peer.set_local_description(offer.clone()).await?;
        self.relay.send(&Message::Offer(offer));

        self.set_state(CallState::AwaitingAnswer);
        Ok(())
    }

    async fn answer_chain(&mut self, offer: SessionDescription) -> Result<(), CallError> {
        if matches!(
            self.state(),
            CallState::Offering | CallState::AwaitingAnswer
        ) {
            // glare не разрешаем: просто отвечаем на чужой offer
            tracing::warn!(session = %self.id, "offer received while offering, answering it");
        }
        self.create_peer().await?;
        self.set_state(CallState::AnsweringOffer);

        // Захват медиа не задерживает установку remote description
        let acquire = self.local_stream.is_none().then(|| {
            let media = self.media.clone();
            let constraints = self.config.media.clone();
            async move { media.get_user_media(&constraints).await }
        });
        let peer = self.peer()?;
        let (captured, remote) = tokio::join!(
            async move {
                match acquire {
                    Some(fut) => Some(fut.await),
                    None => None,
                }
            },
            peer.set_remote_description(offer),
        );

        let media_error = match captured {
            Some(Ok(stream)) => {
                self.adopt_local_stream(stream);
                None
            }
            Some(Err(e)) => Some(e),
            None => None,
        };
        remote?;
        self.remote_description_set = true;
        self.drain_pending_candidates().await;
        if let Some(e) = media_error {
            return Err(e.into());
        }

        self.start_local_media().await?;
        self.attach_local_tracks().await?;

        let peer = self.peer()?;
        let answer = peer.create_answer().await?;
        peer.set_local_description(answer.clone()).await?;
        let local = peer.local_description().await.unwrap_or(answer);
        self.relay.send(&Message::Answer(local));

        self.set_state(CallState::Connected);
        Ok(())
    }

    async fn accept_answer(&mut self, answer: SessionDescription) -> Result<(), CallError> {
        self.peer()?.set_remote_description(answer).await?;
        self.remote_description_set = true;
        self.drain_pending_candidates().await;
        self.set_state(CallState::Connected);
        Ok(())
    }

    // ========== HELPERS ==========

    fn peer(&self) -> Result<&dyn PeerConnection, CallError> {
        self.peer.as_deref().ok_or(CallError::MissingPeer)
    }

    async fn create_peer(&mut self) -> Result<(), CallError> {
        if self.peer.is_some() {
            return Ok(());
        }
        self.generation += 1;
        let events = PeerEventSender::new(self.generation, self.peer_events.clone());
        let peer = self.factory.create(&self.config, events).await?;
        self.peer = Some(peer);
        self.tracks_attached = false;
        self.remote_description_set = false;
        Ok(())
    }

    /// Захват медиа не более одного раза; приостановленный поток просто включается
    async fn start_local_media(&mut self) -> Result<(), MediaError> {
        if let Some(stream) = &self.local_stream {
            if !stream.is_active() {
                stream.set_enabled(true);
                self.emit(CallEvent::LocalPreview(Some(stream.id().to_owned())));
            }
            return Ok(());
        }
        let stream = self.media.get_user_media(&self.config.media).await?;
        self.adopt_local_stream(stream);
        Ok(())
    }

    fn adopt_local_stream(&mut self, stream: LocalStream) {
        tracing::debug!(session = %self.id, "starting local stream {}", stream.id());
        stream.set_enabled(true);
        self.emit(CallEvent::LocalPreview(Some(stream.id().to_owned())));
        self.local_stream = Some(stream);
    }

    async fn attach_local_tracks(&mut self) -> Result<(), CallError> {
        if self.tracks_attached {
            return Ok(());
        }
        let peer = self.peer()?;
        if let Some(stream) = &self.local_stream {
            for track in stream.tracks() {
                peer.add_track(track, stream).await?;
            }
        }
        self.tracks_attached = true;
        Ok(())
    }

    /// Применяет все отложенные кандидаты после установки remote description
    async fn drain_pending_candidates(&mut self) {
        if self.pending_candidates.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.pending_candidates);
        analyze_candidates(&pending);
        let Some(peer) = self.peer.as_deref() else {
            return;
        };
        for candidate in pending {
            tracing::debug!(session = %self.id, "Applying pending candidate: {}", candidate.candidate);
            if let Err(e) = peer.add_ice_candidate(candidate).await {
                tracing::warn!(session = %self.id, "Failed to apply pending candidate: {e}");
            }
        }
    }

    /// Сводит все ошибки медиа и согласования к одному закрытию звонка
    async fn handle_negotiation_error(&mut self, err: &CallError) {
        match err {
            CallError::Media(media) => match media.classify() {
                MediaErrorClass::NotFound => {
                    self.emit(CallEvent::Notice(NOTICE_DEVICE_NOT_FOUND.into()));
                }
                // то же самое, что пользователь отменил звонок
                MediaErrorClass::Cancelled => {
                    tracing::debug!(session = %self.id, "media request cancelled: {media}");
                }
                MediaErrorClass::Other => {
                    tracing::warn!(session = %self.id, "media error: {media}");
                    self.emit(CallEvent::Notice(notice_generic(media)));
                }
            },
            other => {
                tracing::warn!(session = %self.id, "negotiation failed: {other}");
                self.emit(CallEvent::Notice(notice_generic(other)));
            }
        }
        self.close_call().await;
    }

    /// Идемпотентное закрытие звонка
    pub async fn close_call(&mut self) {
        if self.state() == CallState::Closed {
            return;
        }
        tracing::info!(session = %self.id, "Closing call");
        self.set_state(CallState::Closing);
        // события, которые уже в очереди, больше не относятся к этому звонку
        self.generation += 1;

        if let Some(peer) = self.peer.as_deref() {
            peer.detach_handlers();
            for transceiver in peer.transceivers().await {
                if let Err(e) = transceiver.stop().await {
                    tracing::debug!(session = %self.id, "transceiver stop failed: {e}");
                }
            }
            if let Err(e) = peer.close().await {
                tracing::warn!(session = %self.id, "peer connection close failed: {e}");
            }
        }
        self.peer = None;
        self.tracks_attached = false;
        self.remote_description_set = false;
        self.pending_candidates.clear();
        self.remote_stream = None;

        // камеру не освобождаем, только перестаём отправлять
        if let Some(stream) = &self.local_stream {
            stream.set_enabled(false);
            self.emit(CallEvent::LocalPreview(None));
        }

        self.set_state(CallState::Closed);
    }

    fn renew_if_closed(&mut self) {
        if self.state() == CallState::Closed {
            self.id = random_id();
            tracing::info!(session = %self.id, "new session");
            self.set_state(CallState::Idle);
        }
    }

    fn set_state(&self, next: CallState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            tracing::debug!(session = %self.id, "state {prev:?} -> {next:?}");
            self.emit(CallEvent::StateChanged(next));
        }
    }

    fn emit(&self, event: CallEvent) {
        // наблюдателей может не быть
        let _ = self.events.send(event);
    }
}
