use crate::config::{CallConfig, OfferOptions};
use crate::error::PeerError;
use crate::logger::dump_candidate;
use crate::peer::capability::{PeerConnection, PeerEventSender, PeerFactory, Transceiver};
use crate::peer::ice::rtc_config;
use crate::peer::media::{LocalStream, LocalTrack};
use crate::peer::types::{IceCandidate, PeerEventKind, RemoteTrack, SdpType, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Фабрика peer-connection на webrtc-rs
pub struct RtcPeerFactory {
    api: API,
}

impl RtcPeerFactory {
    pub fn new() -> Result<Self, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api })
    }
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create(
        &self,
        config: &CallConfig,
        events: PeerEventSender,
    ) -> Result<Box<dyn PeerConnection>, PeerError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(rtc_config(&config.ice_servers))
                .await?,
        );
        tracing::debug!(generation = events.generation(), "peer connection created");
        attach_handlers(&pc, events);
        Ok(Box::new(RtcPeer { pc }))
    }
}

/// Пробрасываем колбэки webrtc-rs в канал событий сессии
fn attach_handlers(pc: &Arc<RTCPeerConnection>, events: PeerEventSender) {
    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        let tx = tx.clone();
        Box::pin(async move {
            match cand.map(|c| c.to_json()) {
                Some(Ok(init)) => {
                    let candidate = IceCandidate::from(init);
                    dump_candidate("LOCAL", &candidate);
                    tx.emit(PeerEventKind::IceCandidate(Some(candidate)));
                }
                Some(Err(e)) => {
                    tracing::warn!("Failed to serialize local candidate: {e}");
                }
                // cand == None означает конец сбора
                None => tx.emit(PeerEventKind::IceCandidate(None)),
            }
        })
    }));

    let tx = events.clone();
    pc.on_ice_connection_state_change(Box::new(move |st: RTCIceConnectionState| {
        tracing::debug!("ICE connection state changed to: {st:?}");
        tx.emit(PeerEventKind::IceConnectionState(st));
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_signaling_state_change(Box::new(move |st: RTCSignalingState| {
        tracing::debug!("Signaling state changed to: {st:?}");
        tx.emit(PeerEventKind::SignalingState(st));
        Box::pin(async {})
    }));

    let tx = events;
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            tx.emit(PeerEventKind::Track(RemoteTrack {
                stream_id: track.stream_id().to_string(),
                track_id: track.id().to_string(),
                kind: track.kind().to_string(),
                track: Some(track),
            }));
            Box::pin(async {})
        },
    ));
}

pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
}

impl RtcPeer {
    /// recvonly-трансиверы для видов медиа, которые мы хотим принимать,
    /// но сами не отправляем
    async fn ensure_receivers(&self, options: &OfferOptions) -> Result<(), PeerError> {
        let wanted = [
            (RTPCodecType::Audio, options.offer_to_receive_audio),
            (RTPCodecType::Video, options.offer_to_receive_video),
        ];
        for (kind, receive) in wanted {
            if !receive {
                continue;
            }
            let transceivers = self.pc.get_transceivers().await;
            if transceivers.iter().any(|t| t.kind() == kind) {
                continue;
            }
            self.pc
                .add_transceiver_from_kind(
                    kind,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl PeerConnection for RtcPeer {
    async fn create_offer(&self, options: &OfferOptions) -> Result<SessionDescription, PeerError> {
        self.ensure_receivers(options).await?;
        let offer = self.pc.create_offer(None).await?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self.pc.create_answer(None).await?;
        from_rtc(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc.set_local_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc.set_remote_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.pc
            .local_description()
            .await
            .and_then(|desc| from_rtc(desc).ok())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        if self.pc.remote_description().await.is_none() {
            return Err(PeerError::NoRemoteDescription);
        }
        self.pc.add_ice_candidate(candidate.into()).await?;
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack, stream: &LocalStream) -> Result<(), PeerError> {
        let rtc: Arc<dyn TrackLocal + Send + Sync> = track.rtc();
        let sender = self.pc.add_track(rtc).await?;
        tracing::debug!(track = %track.id(), stream = %stream.id(), "local track attached");

        // RTCP нужно вычитывать, иначе interceptors не работают
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn transceivers(&self) -> Vec<Box<dyn Transceiver>> {
        self.pc
            .get_transceivers()
            .await
            .into_iter()
            .map(|t| Box::new(RtcTransceiver(t)) as Box<dyn Transceiver>)
            .collect()
    }

    fn detach_handlers(&self) {
        self.pc
            .on_ice_candidate(Box::new(|_| Box::pin(async {})));
        self.pc
            .on_ice_connection_state_change(Box::new(|_| Box::pin(async {})));
        self.pc
            .on_signaling_state_change(Box::new(|_| Box::pin(async {})));
        self.pc.on_track(Box::new(|_, _, _| Box::pin(async {})));
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.pc.close().await?;
        Ok(())
    }
}

struct RtcTransceiver(Arc<RTCRtpTransceiver>);

#[async_trait]
impl Transceiver for RtcTransceiver {
    async fn stop(&self) -> Result<(), PeerError> {
        self.0.stop().await?;
        Ok(())
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    let rtc = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp)?,
        SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp)?,
        SdpType::Rollback => {
            return Err(PeerError::Other("rollback descriptions are not supported".into()))
        }
    };
    Ok(rtc)
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription, PeerError> {
    let sdp_type = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => {
            return Err(PeerError::Other("unspecified sdp type".into()));
        }
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: desc.sdp,
    })
}
