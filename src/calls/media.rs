//! Local and remote media handles.
//!
//! Tracks are shared handles: cloning a [`MediaTrack`] does not duplicate the
//! underlying capture, and stopping any clone stops all of them.

use super::error::MediaError;
use async_trait::async_trait;
use callcore::{DisplayConstraints, MediaConstraints, TrackKind};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::watch;

fn random_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

struct TrackInner {
    id: String,
    kind: TrackKind,
    label: String,
    enabled: AtomicBool,
    ended: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind, label: impl Into<String>) -> Self {
        Self::with_id(random_id(), kind, label)
    }

    pub fn with_id(id: impl Into<String>, kind: TrackKind, label: impl Into<String>) -> Self {
        let (ended, _) = watch::channel(false);
        Self {
            inner: Arc::new(TrackInner {
                id: id.into(),
                kind,
                label: label.into(),
                enabled: AtomicBool::new(true),
                ended,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Releases the capture. Idempotent.
    pub fn stop(&self) {
        self.inner.ended.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.inner.ended.borrow()
    }

    /// Resolves once the track has been stopped, locally or by the platform.
    pub async fn ended(&self) {
        let mut rx = self.inner.ended.subscribe();
        let _ = rx.wait_for(|ended| *ended).await;
    }
}

impl PartialEq for MediaTrack {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for MediaTrack {}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// A set of tracks rendered together. Clones share the same track list.
#[derive(Clone)]
pub struct MediaStream {
    id: String,
    tracks: Arc<RwLock<Vec<MediaTrack>>>,
}

impl MediaStream {
    pub fn new() -> Self {
        Self::from_tracks(Vec::new())
    }

    pub fn from_tracks(tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: random_id(),
            tracks: Arc::new(RwLock::new(tracks)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Adds a track unless one with the same id is already present.
    pub fn add_track(&self, track: MediaTrack) -> bool {
        let mut tracks = self.tracks.write().unwrap_or_else(|e| e.into_inner());
        if tracks.iter().any(|t| t == &track) {
            return false;
        }
        tracks.push(track);
        true
    }

    pub fn tracks(&self) -> Vec<MediaTrack> {
        self.tracks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn tracks_of(&self, kind: TrackKind) -> Vec<MediaTrack> {
        self.tracks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|t| t.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn audio_tracks(&self) -> Vec<MediaTrack> {
        self.tracks_of(TrackKind::Audio)
    }

    pub fn video_tracks(&self) -> Vec<MediaTrack> {
        self.tracks_of(TrackKind::Video)
    }

    pub fn is_empty(&self) -> bool {
        self.tracks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }

    pub fn stop_all(&self) {
        for track in self.tracks() {
            track.stop();
        }
    }

    /// Whether both handles refer to the same stream object.
    pub fn same_stream(&self, other: &MediaStream) -> bool {
        Arc::ptr_eq(&self.tracks, &other.tracks)
    }
}

impl Default for MediaStream {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.id)
            .field("tracks", &self.tracks())
            .finish()
    }
}

/// Camera, microphone and display capture.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaStream, MediaError>;

    async fn get_display_media(
        &self,
        constraints: &DisplayConstraints,
    ) -> Result<MediaStream, MediaError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_stream_dedups_tracks() {
        let stream = MediaStream::new();
        let audio = MediaTrack::new(TrackKind::Audio, "mic");
        assert!(stream.add_track(audio.clone()));
        assert!(!stream.add_track(audio));
        assert!(stream.add_track(MediaTrack::new(TrackKind::Video, "cam")));
        assert_eq!(stream.audio_tracks().len(), 1);
        assert_eq!(stream.video_tracks().len(), 1);
    }

    #[test]
    fn test_clones_share_state() {
        let stream = MediaStream::new();
        let alias = stream.clone();
        let track = MediaTrack::new(TrackKind::Audio, "mic");
        alias.add_track(track.clone());
        assert!(stream.same_stream(&alias));
        assert!(!stream.same_stream(&MediaStream::new()));

        stream.stop_all();
        assert!(track.is_stopped());
    }

    #[tokio::test]
    async fn test_ended_resolves_after_stop() {
        let track = MediaTrack::new(TrackKind::Video, "screen");
        let waiter = track.clone();
        let handle = tokio::spawn(async move { waiter.ended().await });
        track.stop();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        // Already ended: resolves immediately.
        track.ended().await;
    }
}
