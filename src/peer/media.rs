use crate::config::MediaConstraints;
use crate::error::MediaError;
use crate::peer::capability::MediaDevices;
use crate::utils::random_id;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }

    fn codec(&self) -> RTCRtpCodecCapability {
        match self {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
        }
    }
}

/// Локальный трек. Клоны разделяют один и тот же флаг `enabled`.
#[derive(Clone)]
pub struct LocalTrack {
    kind: TrackKind,
    rtc: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, stream_id: &str) -> Self {
        let rtc = TrackLocalStaticSample::new(
            kind.codec(),
            format!("{}-{}", kind.as_str(), random_id()),
            stream_id.to_owned(),
        );
        Self {
            kind,
            rtc: Arc::new(rtc),
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn id(&self) -> String {
        use webrtc::track::track_local::TrackLocal;
        self.rtc.id().to_owned()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn rtc(&self) -> Arc<TrackLocalStaticSample> {
        self.rtc.clone()
    }

    /// Отправка сэмпла от внешнего источника захвата. На выключенном треке
    /// сэмпл молча отбрасывается.
    pub async fn write_sample(&self, sample: &Sample) -> Result<(), webrtc::Error> {
        if !self.is_enabled() {
            return Ok(());
        }
        self.rtc.write_sample(sample).await
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id())
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// Захваченный локальный поток
#[derive(Debug, Clone)]
pub struct LocalStream {
    id: String,
    tracks: Vec<LocalTrack>,
}

impl LocalStream {
    pub fn new(id: impl Into<String>, tracks: Vec<LocalTrack>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    /// Поток с треками под заданные ограничения
    pub fn for_constraints(constraints: &MediaConstraints) -> Self {
        let id = format!("stream-{}", random_id());
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(LocalTrack::new(TrackKind::Audio, &id));
        }
        if constraints.video.is_some() {
            tracks.push(LocalTrack::new(TrackKind::Video, &id));
        }
        Self { id, tracks }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn track(&self, kind: TrackKind) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind == kind)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.tracks.iter().for_each(|t| t.set_enabled(enabled));
    }

    pub fn is_active(&self) -> bool {
        self.tracks.iter().any(LocalTrack::is_enabled)
    }
}

/// Устройства на сэмпловых треках: сам захват делает внешний продюсер,
/// который пишет в `LocalTrack::write_sample`.
#[derive(Debug, Clone)]
pub struct TrackMediaDevices {
    pub has_microphone: bool,
    pub has_camera: bool,
}

impl Default for TrackMediaDevices {
    fn default() -> Self {
        Self {
            has_microphone: true,
            has_camera: true,
        }
    }
}

#[async_trait]
impl MediaDevices for TrackMediaDevices {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalStream, MediaError> {
        if !constraints.audio && constraints.video.is_none() {
            return Err(MediaError::Other(
                "at least one of audio and video must be requested".into(),
            ));
        }
        if (constraints.audio && !self.has_microphone)
            || (constraints.video.is_some() && !self.has_camera)
        {
            return Err(MediaError::NotFound);
        }
        Ok(LocalStream::for_constraints(constraints))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VideoConstraints;

    #[tokio::test]
    async fn tracks_follow_constraints() {
        let stream = TrackMediaDevices::default()
            .get_user_media(&MediaConstraints {
                audio: true,
                video: None,
            })
            .await
            .unwrap();
        assert_eq!(stream.tracks().len(), 1);
        assert!(stream.track(TrackKind::Audio).is_some());
        assert!(stream.track(TrackKind::Video).is_none());
    }

    #[tokio::test]
    async fn missing_camera_is_not_found() {
        let devices = TrackMediaDevices {
            has_microphone: true,
            has_camera: false,
        };
        let err = devices
            .get_user_media(&MediaConstraints {
                audio: true,
                video: Some(VideoConstraints {
                    width: 640,
                    height: 480,
                }),
            })
            .await
            .unwrap_err();
        assert_eq!(err, MediaError::NotFound);
    }

    #[test]
    fn pausing_keeps_the_handle() {
        let stream = LocalStream::for_constraints(&MediaConstraints::default());
        let clone = stream.clone();
        stream.set_enabled(false);
        assert!(!clone.is_active());
        assert_eq!(clone.tracks().len(), 2);
        clone.set_enabled(true);
        assert!(stream.is_active());
    }
}
