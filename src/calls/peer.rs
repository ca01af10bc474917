//! Peer connection seam.
//!
//! The call layer never talks to a WebRTC stack directly. It drives a
//! [`PeerConnection`] and consumes [`PeerEvent`]s from the receiver handed
//! out together with the connection.

use super::media::{MediaStream, MediaTrack};
use crate::config::IceServer;
use async_trait::async_trait;
use callcore::{IceCandidateInit, SessionDescription};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// States that end the call.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Disconnected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        })
    }
}

#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A local candidate was gathered and should be trickled to the peer.
    IceCandidate(IceCandidateInit),
    /// A remote track arrived. Tracks come one at a time.
    Track(MediaTrack),
    ConnectionState(ConnectionState),
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_track(&self, track: &MediaTrack, stream: &MediaStream)
    -> Result<(), anyhow::Error>;

    async fn create_offer(&self) -> Result<SessionDescription, anyhow::Error>;

    async fn create_answer(&self) -> Result<SessionDescription, anyhow::Error>;

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), anyhow::Error>;

    async fn set_remote_description(&self, desc: &SessionDescription)
    -> Result<(), anyhow::Error>;

    async fn add_ice_candidate(&self, candidate: &IceCandidateInit) -> Result<(), anyhow::Error>;

    /// Swaps the track feeding the outgoing video sender without
    /// renegotiating. Returns `false` when there is no video sender.
    async fn replace_video_track(&self, track: &MediaTrack) -> Result<bool, anyhow::Error>;

    async fn close(&self);

    fn connection_state(&self) -> ConnectionState;
}

/// Builds one peer connection per call attempt.
pub trait PeerConnectionFactory: Send + Sync {
    fn create_peer_connection(
        &self,
        ice_servers: &[IceServer],
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::Receiver<PeerEvent>), anyhow::Error>;
}
