pub mod capability;
pub mod connection;
pub mod ice;
pub mod media;
pub mod types;

pub use capability::{MediaDevices, PeerConnection, PeerEventSender, PeerFactory, Transceiver};
pub use connection::RtcPeerFactory;
pub use media::{LocalStream, LocalTrack, TrackKind, TrackMediaDevices};
pub use types::{IceCandidate, PeerEvent, PeerEventKind, RemoteTrack, SdpType, SessionDescription};
