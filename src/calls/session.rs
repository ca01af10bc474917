//! One peer connection and the media attached to it.
//!
//! A [`PeerSession`] lives for exactly one call attempt. It is owned by the
//! call manager and driven through `&mut self`, so every operation runs on
//! the manager's event loop and never races another operation on the same
//! session.

use super::error::{MediaError, MediaFailure, SessionError, TransportError};
use super::media::{MediaDevices, MediaStream, MediaTrack};
use super::peer::PeerConnection;
use async_trait::async_trait;
use callcore::{
    CallSettings, CallType, DisplayConstraints, IceCandidateInit, MediaConstraints,
    SessionDescription, SignalPayload,
};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::Arc;

/// Where a session sends the signals it produces.
#[async_trait]
pub trait SignalSink: Send + Sync {
    async fn emit(&self, payload: SignalPayload) -> Result<(), TransportError>;
}

pub struct PeerSession {
    pc: Arc<dyn PeerConnection>,
    devices: Arc<dyn MediaDevices>,
    sink: Arc<dyn SignalSink>,
    call_type: CallType,
    settings: CallSettings,
    local_stream: Option<MediaStream>,
    remote_stream: Option<MediaStream>,
    camera_track: Option<MediaTrack>,
    screen_stream: Option<MediaStream>,
    /// Remote candidates received before the remote description.
    pending_candidates: VecDeque<IceCandidateInit>,
    has_remote_description: bool,
    offer_sent: bool,
    answer_sent: bool,
    answer_applied: bool,
    applied_candidates: usize,
    closed: bool,
}

impl PeerSession {
    pub fn new(
        pc: Arc<dyn PeerConnection>,
        devices: Arc<dyn MediaDevices>,
        sink: Arc<dyn SignalSink>,
        call_type: CallType,
        settings: CallSettings,
    ) -> Self {
        Self {
            pc,
            devices,
            sink,
            call_type,
            settings,
            local_stream: None,
            remote_stream: None,
            camera_track: None,
            screen_stream: None,
            pending_candidates: VecDeque::new(),
            has_remote_description: false,
            offer_sent: false,
            answer_sent: false,
            answer_applied: false,
            applied_candidates: 0,
            closed: false,
        }
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.closed {
            Err(SessionError::Closed)
        } else {
            Ok(())
        }
    }

    /// Acquires camera/microphone and attaches the tracks to the connection.
    /// Media is acquired at most once per session.
    pub async fn acquire_local_media(
        &mut self,
        want_video: bool,
        want_audio: bool,
    ) -> Result<MediaStream, SessionError> {
        self.ensure_open()?;
        if let Some(stream) = &self.local_stream {
            return Ok(stream.clone());
        }

        let constraints = MediaConstraints::for_call(&self.settings, want_video, want_audio);
        let stream = self.devices.get_user_media(&constraints).await?;
        for track in stream.tracks() {
            if let Err(e) = self.pc.add_track(&track, &stream).await {
                stream.stop_all();
                return Err(SessionError::negotiation("addTrack", e));
            }
        }
        self.camera_track = stream.video_tracks().into_iter().next();
        debug!(
            target: "Call/Session",
            "Acquired local media: {} audio, {} video",
            stream.audio_tracks().len(),
            stream.video_tracks().len()
        );
        self.local_stream = Some(stream.clone());
        Ok(stream)
    }

    /// Caller side: acquire media, create the offer, set it locally and
    /// send it. A second call returns the existing stream without a new offer.
    pub async fn start_call(
        &mut self,
        want_video: bool,
        want_audio: bool,
    ) -> Result<MediaStream, SessionError> {
        let stream = self.acquire_local_media(want_video, want_audio).await?;
        if self.offer_sent {
            debug!(target: "Call/Session", "Offer already sent, not creating another");
            return Ok(stream);
        }

        let offer = self
            .pc
            .create_offer()
            .await
            .map_err(|e| SessionError::negotiation("createOffer", e))?
            .with_call_type(self.call_type);
        self.pc
            .set_local_description(&offer)
            .await
            .map_err(|e| SessionError::negotiation("setLocalDescription", e))?;
        self.sink.emit(SignalPayload::Offer(offer)).await?;
        self.offer_sent = true;
        info!(target: "Call/Session", "Sent {} offer", self.call_type);
        Ok(stream)
    }

    /// Callee side: apply the remote offer, answer it, then release any
    /// candidates that arrived early. Duplicate offers are ignored.
    pub async fn answer_call(
        &mut self,
        offer: &SessionDescription,
        want_video: bool,
        want_audio: bool,
    ) -> Result<MediaStream, SessionError> {
        let stream = self.acquire_local_media(want_video, want_audio).await?;
        if self.answer_sent || self.has_remote_description {
            debug!(target: "Call/Session", "Ignoring duplicate offer");
            return Ok(stream);
        }

        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| SessionError::negotiation("setRemoteDescription", e))?;
        self.has_remote_description = true;

        let answer = self
            .pc
            .create_answer()
            .await
            .map_err(|e| SessionError::negotiation("createAnswer", e))?
            .with_call_type(self.call_type);
        self.pc
            .set_local_description(&answer)
            .await
            .map_err(|e| SessionError::negotiation("setLocalDescription", e))?;
        self.sink.emit(SignalPayload::Answer(answer)).await?;
        self.answer_sent = true;
        info!(target: "Call/Session", "Sent answer");

        self.flush_pending_candidates().await;
        Ok(stream)
    }

    /// Applies the far end's answer. Returns `false` when the answer was not
    /// applied because it is a duplicate or no offer is outstanding.
    pub async fn handle_answer(&mut self, answer: &SessionDescription) -> Result<bool, SessionError> {
        self.ensure_open()?;
        if self.answer_applied || self.has_remote_description {
            debug!(target: "Call/Session", "Ignoring duplicate answer");
            return Ok(false);
        }
        if !self.offer_sent {
            warn!(target: "Call/Session", "Ignoring answer received before our offer");
            return Ok(false);
        }

        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| SessionError::negotiation("setRemoteDescription", e))?;
        self.has_remote_description = true;
        self.answer_applied = true;
        self.flush_pending_candidates().await;
        Ok(true)
    }

    /// Queues the candidate until a remote description exists, applies it
    /// otherwise.
    pub async fn handle_ice_candidate(&mut self, candidate: IceCandidateInit) {
        if self.closed {
            return;
        }
        if !self.has_remote_description {
            debug!(
                target: "Call/Session",
                "Queueing ICE candidate ({} pending)",
                self.pending_candidates.len() + 1
            );
            self.pending_candidates.push_back(candidate);
            return;
        }
        self.apply_candidate(&candidate).await;
    }

    async fn flush_pending_candidates(&mut self) {
        if self.pending_candidates.is_empty() {
            return;
        }
        debug!(
            target: "Call/Session",
            "Applying {} queued ICE candidates",
            self.pending_candidates.len()
        );
        while let Some(candidate) = self.pending_candidates.pop_front() {
            self.apply_candidate(&candidate).await;
        }
    }

    async fn apply_candidate(&mut self, candidate: &IceCandidateInit) {
        match self.pc.add_ice_candidate(candidate).await {
            Ok(()) => self.applied_candidates += 1,
            Err(e) => {
                warn!(target: "Call/Session", "Failed to add ICE candidate: {e}");
            }
        }
    }

    /// Trickles a locally gathered candidate to the far end.
    pub async fn emit_local_candidate(&self, candidate: IceCandidateInit) {
        if self.closed {
            return;
        }
        if let Err(e) = self.sink.emit(SignalPayload::IceCandidate(candidate)).await {
            warn!(target: "Call/Session", "Failed to send ICE candidate: {e}");
        }
    }

    /// Adds a remote track to the remote stream, creating the stream on the
    /// first track. Returns the stream and whether the track was new.
    pub fn handle_remote_track(&mut self, track: MediaTrack) -> (MediaStream, bool) {
        let stream = self.remote_stream.get_or_insert_with(MediaStream::new).clone();
        let added = stream.add_track(track);
        (stream, added)
    }

    /// Captures the display and swaps it in for the outgoing camera track.
    pub async fn start_screen_share(&mut self) -> Result<MediaStream, SessionError> {
        self.ensure_open()?;
        if let Some(stream) = &self.screen_stream {
            return Ok(stream.clone());
        }

        let display = self
            .devices
            .get_display_media(&DisplayConstraints::default())
            .await?;
        let Some(track) = display.video_tracks().into_iter().next() else {
            display.stop_all();
            return Err(MediaError::new(MediaFailure::Other, "display capture has no video").into());
        };

        match self.pc.replace_video_track(&track).await {
            Ok(true) => info!(target: "Call/Session", "Screen share started"),
            Ok(false) => {
                debug!(target: "Call/Session", "No video sender, screen share is not sent");
            }
            Err(e) => {
                display.stop_all();
                return Err(SessionError::negotiation("replaceTrack", e));
            }
        }
        self.screen_stream = Some(display.clone());
        Ok(display)
    }

    /// Stops the display capture and puts the camera back. Returns `false`
    /// when no screen share was running.
    pub async fn stop_screen_share(&mut self) -> Result<bool, SessionError> {
        let Some(display) = self.screen_stream.take() else {
            return Ok(false);
        };
        display.stop_all();
        if self.closed {
            return Ok(true);
        }
        if let Some(camera) = &self.camera_track {
            self.pc
                .replace_video_track(camera)
                .await
                .map_err(|e| SessionError::negotiation("replaceTrack", e))?;
        }
        info!(target: "Call/Session", "Screen share stopped");
        Ok(true)
    }

    pub fn screen_track(&self) -> Option<MediaTrack> {
        self.screen_stream
            .as_ref()
            .and_then(|s| s.video_tracks().into_iter().next())
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.screen_stream.is_some()
    }

    pub fn toggle_microphone(&self) -> bool {
        let tracks = self
            .local_stream
            .as_ref()
            .map(|s| s.audio_tracks())
            .unwrap_or_default();
        toggle(&tracks)
    }

    pub fn toggle_camera(&self) -> bool {
        let tracks = self
            .local_stream
            .as_ref()
            .map(|s| s.video_tracks())
            .unwrap_or_default();
        toggle(&tracks)
    }

    /// Stops all tracks and closes the connection. Safe to call repeatedly.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for stream in [&self.local_stream, &self.remote_stream, &self.screen_stream]
            .into_iter()
            .flatten()
        {
            stream.stop_all();
        }
        self.pending_candidates.clear();
        self.pc.close().await;
        debug!(target: "Call/Session", "Peer session closed");
    }

    /// Closes the session and tells the far end.
    pub async fn end_call(&mut self) -> Result<(), TransportError> {
        let was_open = !self.closed;
        self.close().await;
        if was_open {
            self.sink.emit(SignalPayload::EndCall).await?;
        }
        Ok(())
    }

    pub fn local_stream(&self) -> Option<&MediaStream> {
        self.local_stream.as_ref()
    }

    pub fn remote_stream(&self) -> Option<&MediaStream> {
        self.remote_stream.as_ref()
    }

    pub fn offer_sent(&self) -> bool {
        self.offer_sent
    }

    pub fn answer_sent(&self) -> bool {
        self.answer_sent
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn applied_candidates(&self) -> usize {
        self.applied_candidates
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

fn toggle(tracks: &[MediaTrack]) -> bool {
    let Some(first) = tracks.first() else {
        return false;
    };
    let enabled = !first.is_enabled();
    for track in tracks {
        track.set_enabled(enabled);
    }
    enabled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::loopback::{LoopbackMediaDevices, LoopbackPeer};
    use callcore::{SdpType, SignalType};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<SignalPayload>>,
    }

    impl RecordingSink {
        fn types(&self) -> Vec<SignalType> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|p| p.signal_type())
                .collect()
        }
    }

    #[async_trait]
    impl SignalSink for RecordingSink {
        async fn emit(&self, payload: SignalPayload) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push(payload);
            Ok(())
        }
    }

    struct Fixture {
        session: PeerSession,
        peer: Arc<LoopbackPeer>,
        devices: Arc<LoopbackMediaDevices>,
        sink: Arc<RecordingSink>,
    }

    fn fixture(call_type: CallType) -> Fixture {
        let (peer, _events) = LoopbackPeer::new();
        let devices = Arc::new(LoopbackMediaDevices::new());
        let sink = Arc::new(RecordingSink::default());
        let session = PeerSession::new(
            peer.clone(),
            devices.clone(),
            sink.clone(),
            call_type,
            CallSettings::default(),
        );
        Fixture {
            session,
            peer,
            devices,
            sink,
        }
    }

    fn candidate(n: u16) -> IceCandidateInit {
        IceCandidateInit::new(format!("candidate:{n} 1 UDP 2130706431 10.0.0.{n} 9 typ host"))
            .with_sdp_mid("0")
            .with_sdp_m_line_index(0)
    }

    fn remote_offer() -> SessionDescription {
        SessionDescription::offer("v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n")
            .with_call_type(CallType::Audio)
    }

    #[tokio::test]
    async fn test_start_call_emits_tagged_offer_once() {
        let mut f = fixture(CallType::Video);
        let stream = f.session.start_call(true, true).await.unwrap();
        assert_eq!(stream.video_tracks().len(), 1);
        assert_eq!(stream.audio_tracks().len(), 1);

        f.session.start_call(true, true).await.unwrap();
        assert_eq!(f.devices.acquisitions(), 1);

        let sent = f.sink.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            SignalPayload::Offer(desc) => {
                assert_eq!(desc.sdp_type, SdpType::Offer);
                assert_eq!(desc.call_type, Some(CallType::Video));
            }
            other => panic!("expected offer, got {other:?}"),
        }
        assert_eq!(f.peer.tracks().len(), 2);
    }

    #[tokio::test]
    async fn test_media_failure_propagates() {
        let mut f = fixture(CallType::Audio);
        f.devices
            .set_failure(Some(MediaError::not_allowed("Permission denied")));
        let err = f.session.start_call(false, true).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Media(MediaError {
                kind: MediaFailure::NotAllowed,
                ..
            })
        ));
        assert!(f.sink.sent.lock().unwrap().is_empty());
        assert!(f.session.local_stream().is_none());
    }

    #[tokio::test]
    async fn test_candidates_queue_until_offer_is_answered() {
        let mut f = fixture(CallType::Audio);
        for n in 1..=5 {
            f.session.handle_ice_candidate(candidate(n)).await;
        }
        assert_eq!(f.session.pending_candidates(), 5);
        assert!(f.peer.applied_candidates().is_empty());

        f.session.answer_call(&remote_offer(), false, true).await.unwrap();

        assert_eq!(f.session.pending_candidates(), 0);
        assert_eq!(f.session.applied_candidates(), 5);
        let applied: Vec<_> = f.peer.applied_candidates();
        assert_eq!(applied, (1..=5).map(candidate).collect::<Vec<_>>());

        // Late candidates go straight through.
        f.session.handle_ice_candidate(candidate(6)).await;
        assert_eq!(f.peer.applied_candidates().len(), 6);
        assert_eq!(f.sink.types(), vec![SignalType::Answer]);
    }

    #[tokio::test]
    async fn test_candidates_before_answer_on_caller() {
        let mut f = fixture(CallType::Audio);
        f.session.start_call(false, true).await.unwrap();
        f.session.handle_ice_candidate(candidate(1)).await;
        f.session.handle_ice_candidate(candidate(2)).await;
        assert_eq!(f.session.pending_candidates(), 2);

        let answer = SessionDescription::answer("v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n");
        assert!(f.session.handle_answer(&answer).await.unwrap());
        assert!(!f.session.handle_answer(&answer).await.unwrap());
        assert_eq!(f.peer.applied_candidates(), vec![candidate(1), candidate(2)]);
    }

    #[tokio::test]
    async fn test_failed_candidate_is_swallowed() {
        let mut f = fixture(CallType::Audio);
        f.peer.fail_candidate(&candidate(2).candidate);
        f.session.answer_call(&remote_offer(), false, true).await.unwrap();
        for n in 1..=3 {
            f.session.handle_ice_candidate(candidate(n)).await;
        }
        assert_eq!(f.session.applied_candidates(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_offer_is_ignored() {
        let mut f = fixture(CallType::Audio);
        let first = f.session.answer_call(&remote_offer(), false, true).await.unwrap();
        let second = f.session.answer_call(&remote_offer(), false, true).await.unwrap();
        assert!(first.same_stream(&second));
        assert_eq!(f.devices.acquisitions(), 1);
        assert_eq!(f.sink.types(), vec![SignalType::Answer]);
    }

    #[tokio::test]
    async fn test_remote_tracks_accumulate_in_one_stream() {
        let mut f = fixture(CallType::Video);
        let audio = MediaTrack::new(callcore::TrackKind::Audio, "remote mic");
        let video = MediaTrack::new(callcore::TrackKind::Video, "remote cam");

        let (first, added) = f.session.handle_remote_track(audio.clone());
        assert!(added);
        let (second, added) = f.session.handle_remote_track(video);
        assert!(added);
        let (third, added) = f.session.handle_remote_track(audio);
        assert!(!added);

        assert!(first.same_stream(&second) && second.same_stream(&third));
        assert_eq!(third.tracks().len(), 2);
    }

    #[tokio::test]
    async fn test_screen_share_replaces_and_reverts() {
        let mut f = fixture(CallType::Video);
        f.session.start_call(true, true).await.unwrap();
        let camera = f.session.local_stream().unwrap().video_tracks()[0].clone();

        let display = f.session.start_screen_share().await.unwrap();
        let screen = display.video_tracks()[0].clone();
        assert_eq!(f.peer.video_sender_track(), Some(screen.clone()));
        assert!(f.session.is_screen_sharing());

        assert!(f.session.stop_screen_share().await.unwrap());
        assert!(screen.is_stopped());
        assert_eq!(f.peer.video_sender_track(), Some(camera));
        assert!(!f.session.stop_screen_share().await.unwrap());
    }

    #[tokio::test]
    async fn test_screen_share_on_audio_call_has_no_sender() {
        let mut f = fixture(CallType::Audio);
        f.session.start_call(false, true).await.unwrap();
        f.session.start_screen_share().await.unwrap();
        assert_eq!(f.peer.video_sender_track(), None);
    }

    #[tokio::test]
    async fn test_toggles() {
        let mut f = fixture(CallType::Audio);
        assert!(!f.session.toggle_microphone());

        f.session.start_call(false, true).await.unwrap();
        assert!(!f.session.toggle_microphone());
        assert!(f.session.toggle_microphone());
        // No camera on an audio call.
        assert!(!f.session.toggle_camera());
    }

    #[tokio::test]
    async fn test_end_call_stops_everything_once() {
        let mut f = fixture(CallType::Video);
        let local = f.session.start_call(true, true).await.unwrap();
        let (remote, _) = f
            .session
            .handle_remote_track(MediaTrack::new(callcore::TrackKind::Audio, "remote"));

        f.session.end_call().await.unwrap();
        f.session.end_call().await.unwrap();
        f.session.close().await;

        assert!(local.tracks().iter().all(|t| t.is_stopped()));
        assert!(remote.tracks().iter().all(|t| t.is_stopped()));
        assert!(f.peer.is_closed());
        assert_eq!(f.sink.types(), vec![SignalType::Offer, SignalType::EndCall]);
        assert!(matches!(
            f.session.start_call(true, true).await,
            Err(SessionError::Closed)
        ));
    }
}
