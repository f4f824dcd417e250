use super::*;
use crate::config::{MediaConstraints, OfferOptions};
use crate::error::PeerError;
use crate::peer::capability::Transceiver;
use crate::peer::media::LocalTrack;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
enum Call {
    CreateOffer,
    CreateAnswer,
    SetLocal(SessionDescription),
    SetRemote(SessionDescription),
    AddCandidate(String),
    AddTrack,
    StopTransceiver,
    Detach,
    Close,
}

#[derive(Default)]
struct PeerLog {
    calls: Mutex<Vec<Call>>,
}

impl PeerLog {
    fn push(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    fn candidates(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::AddCandidate(c) => Some(c),
                _ => None,
            })
            .collect()
    }
}

#[derive(Default, Clone, Copy)]
struct Behavior {
    fail_offer: bool,
    fail_set_remote: bool,
}

struct MockPeer {
    log: Arc<PeerLog>,
    behavior: Behavior,
    remote: Mutex<Option<SessionDescription>>,
    local: Mutex<Option<SessionDescription>>,
}

#[async_trait]
impl PeerConnection for MockPeer {
    async fn create_offer(&self, _options: &OfferOptions) -> Result<SessionDescription, PeerError> {
        self.log.push(Call::CreateOffer);
        if self.behavior.fail_offer {
            return Err(PeerError::Other("offer failed".into()));
        }
        Ok(SessionDescription::offer("local-offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.log.push(Call::CreateAnswer);
        let remote = self.remote.lock().unwrap().clone();
        let remote = remote.ok_or(PeerError::NoRemoteDescription)?;
        Ok(SessionDescription::answer(format!("answer-to:{}", remote.sdp)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.log.push(Call::SetLocal(desc.clone()));
        *self.local.lock().unwrap() = Some(desc);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.log.push(Call::SetRemote(desc.clone()));
        if self.behavior.fail_set_remote {
            return Err(PeerError::Other("bad sdp".into()));
        }
        *self.remote.lock().unwrap() = Some(desc);
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.local.lock().unwrap().clone()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        if self.remote.lock().unwrap().is_none() {
            panic!("candidate applied before remote description");
        }
        self.log.push(Call::AddCandidate(candidate.candidate.clone()));
        if candidate.candidate == "bad" {
            return Err(PeerError::Other("malformed candidate".into()));
        }
        Ok(())
    }

    async fn add_track(&self, _track: &LocalTrack, _stream: &LocalStream) -> Result<(), PeerError> {
        self.log.push(Call::AddTrack);
        Ok(())
    }

    async fn transceivers(&self) -> Vec<Box<dyn Transceiver>> {
        (0..2)
            .map(|_| {
                Box::new(MockTransceiver {
                    log: self.log.clone(),
                }) as Box<dyn Transceiver>
            })
            .collect()
    }

    fn detach_handlers(&self) {
        self.log.push(Call::Detach);
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.log.push(Call::Close);
        Ok(())
    }
}

struct MockTransceiver {
    log: Arc<PeerLog>,
}

#[async_trait]
impl Transceiver for MockTransceiver {
    async fn stop(&self) -> Result<(), PeerError> {
        self.log.push(Call::StopTransceiver);
        Ok(())
    }
}

struct MockFactory {
    log: Arc<PeerLog>,
    behavior: Behavior,
    created: AtomicUsize,
    senders: Mutex<Vec<PeerEventSender>>,
}

impl MockFactory {
    fn last_sender(&self) -> PeerEventSender {
        self.senders.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait]
impl PeerFactory for MockFactory {
    async fn create(
        &self,
        _config: &CallConfig,
        events: PeerEventSender,
    ) -> Result<Box<dyn PeerConnection>, PeerError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        self.senders.lock().unwrap().push(events);
        Ok(Box::new(MockPeer {
            log: self.log.clone(),
            behavior: self.behavior,
            remote: Mutex::new(None),
            local: Mutex::new(None),
        }))
    }
}

struct MockMedia {
    result: Result<(), MediaError>,
    requests: AtomicUsize,
}

#[async_trait]
impl MediaDevices for MockMedia {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalStream, MediaError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.result.clone()?;
        Ok(LocalStream::for_constraints(constraints))
    }
}

#[derive(Default)]
struct RecordingRelay {
    sent: Mutex<Vec<Message>>,
}

impl RecordingRelay {
    fn sent(&self) -> Vec<Message> {
        self.sent.lock().unwrap().clone()
    }

    fn kinds(&self) -> Vec<String> {
        self.sent().iter().map(|m| m.kind().to_string()).collect()
    }
}

impl SignalSender for RecordingRelay {
    fn send(&self, msg: &Message) {
        self.sent.lock().unwrap().push(msg.clone());
    }
}

struct Harness {
    session: Session,
    peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
    log: Arc<PeerLog>,
    factory: Arc<MockFactory>,
    media: Arc<MockMedia>,
    relay: Arc<RecordingRelay>,
    events: broadcast::Receiver<CallEvent>,
}

impl Harness {
    fn new() -> Self {
        Self::with(Ok(()), Behavior::default())
    }

    fn with(media: Result<(), MediaError>, behavior: Behavior) -> Self {
        crate::logger::init();
        let log = Arc::new(PeerLog::default());
        let factory = Arc::new(MockFactory {
            log: log.clone(),
            behavior,
            created: AtomicUsize::new(0),
            senders: Mutex::new(Vec::new()),
        });
        let media = Arc::new(MockMedia {
            result: media,
            requests: AtomicUsize::new(0),
        });
        let relay = Arc::new(RecordingRelay::default());
        let (session, peer_rx) = Session::new(
            CallConfig::default(),
            factory.clone(),
            media.clone(),
            relay.clone(),
        );
        let events = session.subscribe();
        Self {
            session,
            peer_rx,
            log,
            factory,
            media,
            relay,
            events,
        }
    }

    fn drain_events(&mut self) -> Vec<CallEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    fn notices(&mut self) -> Vec<String> {
        self.drain_events()
            .into_iter()
            .filter_map(|e| match e {
                CallEvent::Notice(text) => Some(text),
                _ => None,
            })
            .collect()
    }

    /// Событие capability от текущего peer-connection
    async fn peer_event(&mut self, kind: PeerEventKind) {
        self.factory.last_sender().emit(kind);
        let event = self.peer_rx.recv().await.unwrap();
        self.session.on_peer_event(event).await;
    }

    async fn connected_as_callee(&mut self) {
        self.session
            .on_message(Message::Offer(SessionDescription::offer("remote-offer")))
            .await;
        assert_eq!(self.session.state(), CallState::Connected);
        assert_eq!(self.session.has_peer(), self.session.state().has_peer());
    }
}

fn candidate(text: &str) -> IceCandidate {
    IceCandidate {
        candidate: text.into(),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}

fn remote_track(stream: &str, kind: &str) -> RemoteTrack {
    RemoteTrack {
        stream_id: stream.into(),
        track_id: format!("{stream}-{kind}"),
        kind: kind.into(),
        track: None,
    }
}

fn assert_closed(h: &Harness) {
    assert_eq!(h.session.state(), CallState::Closed);
    assert!(!h.session.has_peer());
    assert!(!h.session.state().has_peer());
    assert!(h.session.pending_candidates().is_empty());
}

#[tokio::test]
async fn start_call_sends_exactly_one_offer() {
    let mut h = Harness::new();
    h.session.start_call().await.unwrap();

    assert_eq!(h.session.state(), CallState::AwaitingAnswer);
    assert_eq!(
        h.relay.sent(),
        vec![Message::Offer(SessionDescription::offer("local-offer"))]
    );
    assert_eq!(
        h.log.calls(),
        vec![
            Call::AddTrack,
            Call::AddTrack,
            Call::CreateOffer,
            Call::SetLocal(SessionDescription::offer("local-offer")),
        ]
    );

    let states: Vec<_> = h
        .drain_events()
        .into_iter()
        .filter_map(|e| match e {
            CallEvent::StateChanged(s) => Some(s),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            CallState::AwaitingLocalMedia,
            CallState::Offering,
            CallState::AwaitingAnswer
        ]
    );
}

#[tokio::test]
async fn start_call_twice_is_rejected() {
    let mut h = Harness::new();
    h.session.start_call().await.unwrap();
    let err = h.session.start_call().await.unwrap_err();
    assert!(matches!(err, CallError::InvalidState(CallState::AwaitingAnswer)));
    assert_eq!(h.relay.kinds(), vec!["offer"]);
    assert_eq!(h.session.state(), CallState::AwaitingAnswer);
}

#[tokio::test]
async fn cold_offer_is_answered() {
    let mut h = Harness::new();
    h.session
        .on_message(Message::Offer(SessionDescription::offer("sdp1")))
        .await;

    assert_eq!(h.session.state(), CallState::Connected);
    assert_eq!(
        h.relay.sent(),
        vec![Message::Answer(SessionDescription::answer("answer-to:sdp1"))]
    );
    assert_eq!(h.media.requests.load(Ordering::SeqCst), 1);
    assert_eq!(h.factory.created.load(Ordering::SeqCst), 1);
    assert!(h.session.local_stream().unwrap().is_active());
}

#[tokio::test]
async fn candidates_wait_for_the_answer() {
    let mut h = Harness::new();
    h.session.start_call().await.unwrap();

    for text in ["c1", "c2", "c3"] {
        h.session
            .on_message(Message::IceCandidate(candidate(text)))
            .await;
    }
    assert!(h.log.candidates().is_empty());
    assert_eq!(h.session.pending_candidates().len(), 3);

    h.session
        .on_message(Message::Answer(SessionDescription::answer("remote-answer")))
        .await;

    assert_eq!(h.session.state(), CallState::Connected);
    assert!(h.session.pending_candidates().is_empty());
    let calls = h.log.calls();
    let remote_at = calls
        .iter()
        .position(|c| matches!(c, Call::SetRemote(_)))
        .unwrap();
    assert_eq!(
        &calls[remote_at + 1..],
        &[
            Call::AddCandidate("c1".into()),
            Call::AddCandidate("c2".into()),
            Call::AddCandidate("c3".into()),
        ]
    );

    // после remote description кандидат применяется сразу
    h.session
        .on_message(Message::IceCandidate(candidate("c4")))
        .await;
    assert_eq!(h.log.candidates(), vec!["c1", "c2", "c3", "c4"]);
}

#[tokio::test]
async fn candidates_before_cold_offer_are_applied_after_it() {
    let mut h = Harness::new();
    h.session
        .on_message(Message::IceCandidate(candidate("early")))
        .await;
    assert_eq!(h.session.state(), CallState::Idle);
    assert!(!h.session.has_peer());

    h.connected_as_callee().await;
    assert_eq!(h.log.candidates(), vec!["early"]);
}

#[tokio::test]
async fn failed_candidate_is_not_fatal() {
    let mut h = Harness::new();
    h.connected_as_callee().await;
    h.session
        .on_message(Message::IceCandidate(candidate("bad")))
        .await;
    assert_eq!(h.session.state(), CallState::Connected);
    assert!(h.session.has_peer());
}

#[tokio::test]
async fn hangup_closes_connected_call() {
    let mut h = Harness::new();
    h.connected_as_callee().await;
    h.session.on_message(Message::Hangup).await;

    assert_closed(&h);
    let calls = h.log.calls();
    let tail = &calls[calls.len() - 4..];
    assert_eq!(
        tail,
        &[
            Call::Detach,
            Call::StopTransceiver,
            Call::StopTransceiver,
            Call::Close
        ]
    );
    // камера остаётся у сессии, но выключена
    assert!(!h.session.local_stream().unwrap().is_active());
    assert!(h
        .drain_events()
        .iter()
        .any(|e| matches!(e, CallEvent::LocalPreview(None))));
}

#[tokio::test]
async fn permission_denied_closes_silently() {
    let mut h = Harness::with(Err(MediaError::PermissionDenied), Behavior::default());
    let err = h.session.start_call().await.unwrap_err();

    assert!(matches!(err, CallError::Media(MediaError::PermissionDenied)));
    assert_closed(&h);
    assert!(h.relay.sent().is_empty());
    assert!(h.notices().is_empty());
    assert_eq!(h.log.count(|c| *c == Call::Close), 1);
}

#[tokio::test]
async fn permission_denied_while_answering_closes_silently() {
    let mut h = Harness::with(Err(MediaError::PermissionDenied), Behavior::default());
    h.session
        .on_message(Message::IceCandidate(candidate("early")))
        .await;
    h.session
        .on_message(Message::Offer(SessionDescription::offer("remote-offer")))
        .await;

    assert_closed(&h);
    assert!(h.relay.sent().is_empty());
    assert!(h.notices().is_empty());
    assert_eq!(h.log.count(|c| *c == Call::CreateAnswer), 0);
    // буфер успел примениться до ошибки захвата, и только один раз
    assert_eq!(h.log.candidates(), vec!["early"]);
    assert_eq!(h.log.count(|c| *c == Call::Close), 1);
}

#[tokio::test]
async fn missing_device_shows_notice() {
    let mut h = Harness::with(Err(MediaError::NotFound), Behavior::default());
    assert!(h.session.start_call().await.is_err());
    assert_closed(&h);
    assert_eq!(h.notices(), vec![state::NOTICE_DEVICE_NOT_FOUND.to_string()]);
}

#[tokio::test]
async fn other_media_error_shows_generic_notice() {
    let mut h = Harness::with(
        Err(MediaError::Other("device busy".into())),
        Behavior::default(),
    );
    assert!(h.session.start_call().await.is_err());
    assert_closed(&h);
    assert_eq!(
        h.notices(),
        vec!["Error opening your camera and/or microphone: device busy".to_string()]
    );
}

#[tokio::test]
async fn offer_failure_tears_down() {
    let mut h = Harness::with(
        Ok(()),
        Behavior {
            fail_offer: true,
            ..Default::default()
        },
    );
    assert!(h.session.start_call().await.is_err());
    assert_closed(&h);
    assert!(h.relay.sent().is_empty());
    assert_eq!(h.notices().len(), 1);
}

#[tokio::test]
async fn bad_remote_offer_closes_call() {
    let mut h = Harness::with(
        Ok(()),
        Behavior {
            fail_set_remote: true,
            ..Default::default()
        },
    );
    h.session
        .on_message(Message::Offer(SessionDescription::offer("garbage")))
        .await;
    assert_closed(&h);
    assert!(h.relay.sent().is_empty());
}

#[tokio::test]
async fn answer_outside_awaiting_answer_is_ignored() {
    let mut h = Harness::new();
    h.session
        .on_message(Message::Answer(SessionDescription::answer("stray")))
        .await;
    assert_eq!(h.session.state(), CallState::Idle);
    assert!(h.log.calls().is_empty());
    assert!(!h.session.has_peer());

    h.connected_as_callee().await;
    let before = h.log.calls().len();
    h.session
        .on_message(Message::Answer(SessionDescription::answer("duplicate")))
        .await;
    assert_eq!(h.session.state(), CallState::Connected);
    assert_eq!(h.log.calls().len(), before);
}

#[tokio::test]
async fn teardown_is_idempotent() {
    let mut h = Harness::new();
    h.session.start_call().await.unwrap();
    let sender = h.factory.last_sender();

    h.session.hang_up().await;
    h.session.hang_up().await;
    h.session.on_message(Message::Hangup).await;
    h.session.close_call().await;
    sender.emit(PeerEventKind::IceConnectionState(RTCIceConnectionState::Failed));
    let event = h.peer_rx.recv().await.unwrap();
    h.session.on_peer_event(event).await;

    assert_closed(&h);
    assert_eq!(h.relay.kinds(), vec!["offer", "hangup"]);
    assert_eq!(h.log.count(|c| *c == Call::Close), 1);
    assert_eq!(h.log.count(|c| *c == Call::Detach), 1);
}

#[tokio::test]
async fn hang_up_on_idle_does_nothing() {
    let mut h = Harness::new();
    h.session.hang_up().await;
    assert_eq!(h.session.state(), CallState::Idle);
    assert!(h.relay.sent().is_empty());
}

#[tokio::test]
async fn hangup_message_on_idle_closes() {
    let mut h = Harness::new();
    h.session.on_message(Message::Hangup).await;
    assert_closed(&h);
    assert!(h.log.calls().is_empty());
}

#[tokio::test]
async fn local_candidates_are_forwarded() {
    let mut h = Harness::new();
    h.session.start_call().await.unwrap();
    h.peer_event(PeerEventKind::IceCandidate(Some(candidate("local-1"))))
        .await;
    h.peer_event(PeerEventKind::IceCandidate(None)).await;
    assert_eq!(
        h.relay.sent()[1],
        Message::IceCandidate(candidate("local-1"))
    );
    assert_eq!(h.relay.sent().len(), 2);
}

#[tokio::test]
async fn late_events_after_teardown_are_dropped() {
    let mut h = Harness::new();
    h.session.start_call().await.unwrap();
    let sender = h.factory.last_sender();
    h.session.hang_up().await;

    sender.emit(PeerEventKind::IceCandidate(Some(candidate("late"))));
    let event = h.peer_rx.recv().await.unwrap();
    h.session.on_peer_event(event).await;
    assert_eq!(h.relay.kinds(), vec!["offer", "hangup"]);
}

#[tokio::test]
async fn ice_disconnect_closes_call() {
    let mut h = Harness::new();
    h.connected_as_callee().await;
    h.peer_event(PeerEventKind::IceConnectionState(
        RTCIceConnectionState::Disconnected,
    ))
    .await;
    assert_closed(&h);
}

#[tokio::test]
async fn ice_checking_keeps_call() {
    let mut h = Harness::new();
    h.connected_as_callee().await;
    h.peer_event(PeerEventKind::IceConnectionState(
        RTCIceConnectionState::Checking,
    ))
    .await;
    h.peer_event(PeerEventKind::SignalingState(RTCSignalingState::Stable))
        .await;
    assert_eq!(h.session.state(), CallState::Connected);
}

#[tokio::test]
async fn signaling_closed_closes_call() {
    let mut h = Harness::new();
    h.connected_as_callee().await;
    h.peer_event(PeerEventKind::SignalingState(RTCSignalingState::Closed))
        .await;
    assert_closed(&h);
}

#[tokio::test]
async fn only_first_remote_stream_is_rendered() {
    let mut h = Harness::new();
    h.connected_as_callee().await;
    h.drain_events();

    h.peer_event(PeerEventKind::Track(remote_track("s1", "audio")))
        .await;
    h.peer_event(PeerEventKind::Track(remote_track("s1", "video")))
        .await;
    h.peer_event(PeerEventKind::Track(remote_track("s2", "video")))
        .await;

    let rendered: Vec<_> = h
        .drain_events()
        .into_iter()
        .filter_map(|e| match e {
            CallEvent::RemoteTrack(t) => Some(t.track_id),
            _ => None,
        })
        .collect();
    assert_eq!(rendered, vec!["s1-audio", "s1-video"]);
}

#[tokio::test]
async fn unknown_message_is_ignored() {
    let mut h = Harness::new();
    h.session.start_call().await.unwrap();
    h.session
        .on_message(Message::Unknown {
            kind: "renegotiate".into(),
            data: serde_json::Value::Null,
        })
        .await;
    assert_eq!(h.session.state(), CallState::AwaitingAnswer);
    assert_eq!(h.relay.kinds(), vec!["offer"]);
}

#[tokio::test]
async fn new_call_after_close_reuses_camera() {
    let mut h = Harness::new();
    h.session.start_call().await.unwrap();
    let first_id = h.session.id().to_string();
    h.session.hang_up().await;

    h.session.start_call().await.unwrap();
    assert_eq!(h.session.state(), CallState::AwaitingAnswer);
    assert_ne!(h.session.id(), first_id);
    assert_eq!(h.factory.created.load(Ordering::SeqCst), 2);
    assert_eq!(h.media.requests.load(Ordering::SeqCst), 1);
    assert!(h.session.local_stream().unwrap().is_active());
    assert_eq!(h.relay.kinds(), vec!["offer", "hangup", "offer"]);
}

#[tokio::test]
async fn glare_offer_is_answered_anyway() {
    let mut h = Harness::new();
    h.session.start_call().await.unwrap();
    h.session
        .on_message(Message::Offer(SessionDescription::offer("their-offer")))
        .await;

    assert_eq!(h.session.state(), CallState::Connected);
    assert_eq!(h.factory.created.load(Ordering::SeqCst), 1);
    // треки уже добавлены при собственном offer
    assert_eq!(h.log.count(|c| *c == Call::AddTrack), 2);
    assert_eq!(h.relay.kinds(), vec!["offer", "answer"]);
}

#[tokio::test]
async fn agent_runs_events_one_at_a_time() {
    let log = Arc::new(PeerLog::default());
    let factory = Arc::new(MockFactory {
        log: log.clone(),
        behavior: Behavior::default(),
        created: AtomicUsize::new(0),
        senders: Mutex::new(Vec::new()),
    });
    let media = Arc::new(MockMedia {
        result: Ok(()),
        requests: AtomicUsize::new(0),
    });
    let relay = Arc::new(RecordingRelay::default());
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (session, peer_rx) = Session::new(CallConfig::default(), factory, media, relay.clone());

    let handle = CallAgent::spawn(session, peer_rx, inbound_rx.into());
    let mut state = handle.watch_state();

    handle.start_call().await.unwrap();
    assert_eq!(handle.state(), CallState::AwaitingAnswer);

    inbound_tx
        .send(Message::IceCandidate(candidate("c1")))
        .unwrap();
    inbound_tx
        .send(Message::Answer(SessionDescription::answer("their-answer")))
        .unwrap();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == CallState::Connected),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(log.candidates(), vec!["c1"]);

    handle.hang_up().await.unwrap();
    assert_eq!(handle.state(), CallState::Closed);
    assert_eq!(relay.kinds(), vec!["offer", "hangup"]);
    handle.shutdown().await;
}
