//! In-process media and peer connection backends.
//!
//! No packets flow: descriptions are synthetic SDP listing one m-line per
//! attached track, and the connection reports `connected` as soon as both
//! descriptions are set. Remote tracks are synthesized from the m-lines of
//! the remote description. Used by the demo binary and the tests.

use super::error::MediaError;
use super::media::{MediaDevices, MediaStream, MediaTrack};
use super::peer::{ConnectionState, PeerConnection, PeerConnectionFactory, PeerEvent};
use crate::config::IceServer;
use async_trait::async_trait;
use callcore::{
    DisplayConstraints, IceCandidateInit, MediaConstraints, SdpType, SessionDescription, TrackKind,
};
use log::debug;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

const EVENT_CAPACITY: usize = 64;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
pub struct LoopbackMediaDevices {
    failure: Mutex<Option<MediaError>>,
    acquisitions: AtomicUsize,
    display_acquisitions: AtomicUsize,
}

impl LoopbackMediaDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every capture request fail with `failure` until cleared.
    pub fn set_failure(&self, failure: Option<MediaError>) {
        *lock(&self.failure) = failure;
    }

    /// Successful camera/microphone acquisitions so far.
    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    pub fn display_acquisitions(&self) -> usize {
        self.display_acquisitions.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), MediaError> {
        match lock(&self.failure).clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl MediaDevices for LoopbackMediaDevices {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaStream, MediaError> {
        self.check()?;
        if constraints.is_empty() {
            return Err(MediaError::not_found("no media kind requested"));
        }
        let stream = MediaStream::new();
        if constraints.audio.is_some() {
            stream.add_track(MediaTrack::new(TrackKind::Audio, "Loopback microphone"));
        }
        if let Some(video) = &constraints.video {
            stream.add_track(MediaTrack::new(
                TrackKind::Video,
                format!("Loopback camera {}x{}", video.ideal_width, video.ideal_height),
            ));
        }
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        Ok(stream)
    }

    async fn get_display_media(
        &self,
        constraints: &DisplayConstraints,
    ) -> Result<MediaStream, MediaError> {
        self.check()?;
        let stream = MediaStream::new();
        if constraints.video {
            stream.add_track(MediaTrack::new(TrackKind::Video, "Loopback screen"));
        }
        if constraints.audio {
            stream.add_track(MediaTrack::new(TrackKind::Audio, "Loopback system audio"));
        }
        self.display_acquisitions.fetch_add(1, Ordering::SeqCst);
        Ok(stream)
    }
}

#[derive(Default)]
struct PeerInner {
    tracks: Vec<MediaTrack>,
    video_sender: Option<MediaTrack>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied: Vec<IceCandidateInit>,
    failing: HashSet<String>,
    state: Option<ConnectionState>,
    candidates_gathered: u16,
}

pub struct LoopbackPeer {
    id: u64,
    inner: Mutex<PeerInner>,
    events: mpsc::Sender<PeerEvent>,
}

impl LoopbackPeer {
    pub fn new() -> (Arc<Self>, mpsc::Receiver<PeerEvent>) {
        let (events, rx) = mpsc::channel(EVENT_CAPACITY);
        let peer = Arc::new(Self {
            id: rand::random::<u64>(),
            inner: Mutex::new(PeerInner::default()),
            events,
        });
        (peer, rx)
    }

    /// Pushes an event as if the stack had raised it.
    pub fn emit(&self, event: PeerEvent) {
        if self.events.try_send(event).is_err() {
            debug!("Loopback peer {}: event dropped, nobody listening", self.id);
        }
    }

    /// Makes `add_ice_candidate` fail for this candidate line.
    pub fn fail_candidate(&self, candidate: &str) {
        lock(&self.inner).failing.insert(candidate.to_string());
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidateInit> {
        lock(&self.inner).applied.clone()
    }

    pub fn tracks(&self) -> Vec<MediaTrack> {
        lock(&self.inner).tracks.clone()
    }

    pub fn video_sender_track(&self) -> Option<MediaTrack> {
        lock(&self.inner).video_sender.clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        lock(&self.inner).local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        lock(&self.inner).remote.clone()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner).state == Some(ConnectionState::Closed)
    }

    fn describe(&self, sdp_type: SdpType) -> SessionDescription {
        let inner = lock(&self.inner);
        let mut sdp = format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
            self.id
        );
        for track in &inner.tracks {
            sdp.push_str(&format!(
                "m={} 9 UDP/TLS/RTP/SAVPF 96\r\na=msid:- {}\r\n",
                track.kind(),
                track.id()
            ));
        }
        SessionDescription {
            sdp_type,
            sdp,
            call_type: None,
        }
    }

    /// Once both sides are described: report `connected` and surface one
    /// remote track per remote m-line.
    fn maybe_connect(&self) {
        let remote_kinds = {
            let mut inner = lock(&self.inner);
            if inner.state.is_some() || inner.local.is_none() {
                return;
            }
            let Some(remote) = &inner.remote else {
                return;
            };
            let kinds: Vec<TrackKind> = remote
                .sdp
                .lines()
                .filter_map(|line| match line.split_whitespace().next() {
                    Some("m=audio") => Some(TrackKind::Audio),
                    Some("m=video") => Some(TrackKind::Video),
                    _ => None,
                })
                .collect();
            inner.state = Some(ConnectionState::Connected);
            kinds
        };
        for kind in remote_kinds {
            self.emit(PeerEvent::Track(MediaTrack::new(kind, format!("Remote {kind}"))));
        }
        self.emit(PeerEvent::ConnectionState(ConnectionState::Connected));
    }
}

#[async_trait]
impl PeerConnection for LoopbackPeer {
    async fn add_track(
        &self,
        track: &MediaTrack,
        _stream: &MediaStream,
    ) -> Result<(), anyhow::Error> {
        let mut inner = lock(&self.inner);
        if inner.state == Some(ConnectionState::Closed) {
            return Err(anyhow::anyhow!("peer connection is closed"));
        }
        if track.kind() == TrackKind::Video && inner.video_sender.is_none() {
            inner.video_sender = Some(track.clone());
        }
        inner.tracks.push(track.clone());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, anyhow::Error> {
        Ok(self.describe(SdpType::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, anyhow::Error> {
        if lock(&self.inner).remote.is_none() {
            return Err(anyhow::anyhow!("createAnswer without a remote offer"));
        }
        Ok(self.describe(SdpType::Answer))
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), anyhow::Error> {
        let candidate = {
            let mut inner = lock(&self.inner);
            inner.local = Some(desc.clone());
            inner.candidates_gathered += 1;
            IceCandidateInit::new(format!(
                "candidate:{} 1 UDP 2130706431 127.0.0.1 {} typ host",
                inner.candidates_gathered,
                50000 + inner.candidates_gathered
            ))
            .with_sdp_mid("0")
            .with_sdp_m_line_index(0)
        };
        self.emit(PeerEvent::IceCandidate(candidate));
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), anyhow::Error> {
        if !desc.sdp.starts_with("v=0") {
            return Err(anyhow::anyhow!("malformed SDP"));
        }
        lock(&self.inner).remote = Some(desc.clone());
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidateInit) -> Result<(), anyhow::Error> {
        let mut inner = lock(&self.inner);
        if inner.remote.is_none() {
            return Err(anyhow::anyhow!("no remote description"));
        }
        if inner.failing.contains(&candidate.candidate) {
            return Err(anyhow::anyhow!("candidate rejected: {}", candidate.candidate));
        }
        inner.applied.push(candidate.clone());
        Ok(())
    }

    async fn replace_video_track(&self, track: &MediaTrack) -> Result<bool, anyhow::Error> {
        let mut inner = lock(&self.inner);
        match inner.video_sender.as_mut() {
            Some(sender) => {
                *sender = track.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn close(&self) {
        lock(&self.inner).state = Some(ConnectionState::Closed);
    }

    fn connection_state(&self) -> ConnectionState {
        lock(&self.inner).state.unwrap_or(ConnectionState::New)
    }
}

/// Hands out [`LoopbackPeer`]s and remembers them for inspection.
#[derive(Default)]
pub struct LoopbackPeerFactory {
    created: Mutex<Vec<Arc<LoopbackPeer>>>,
}

impl LoopbackPeerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn created(&self) -> Vec<Arc<LoopbackPeer>> {
        lock(&self.created).clone()
    }

    pub fn last(&self) -> Option<Arc<LoopbackPeer>> {
        lock(&self.created).last().cloned()
    }
}

impl PeerConnectionFactory for LoopbackPeerFactory {
    fn create_peer_connection(
        &self,
        ice_servers: &[IceServer],
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::Receiver<PeerEvent>), anyhow::Error> {
        debug!("Creating loopback peer with {} ICE servers", ice_servers.len());
        let (peer, events) = LoopbackPeer::new();
        lock(&self.created).push(peer.clone());
        let peer: Arc<dyn PeerConnection> = peer;
        Ok((peer, events))
    }
}
