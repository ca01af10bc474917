//! Media constraint presets.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Audio => "audio",
            Self::Video => "video",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoQuality {
    /// 480p, for slow connections.
    Low,
    /// 720p.
    #[default]
    Medium,
    /// 1080p.
    High,
}

impl VideoQuality {
    pub fn resolution(&self) -> (u32, u32) {
        match self {
            Self::Low => (640, 480),
            Self::Medium => (1280, 720),
            Self::High => (1920, 1080),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioQuality {
    Low,
    Medium,
    #[default]
    High,
}

impl AudioQuality {
    pub fn sample_rate(&self) -> u32 {
        match self {
            Self::Low => 16_000,
            Self::Medium => 32_000,
            Self::High => 48_000,
        }
    }
}

/// Per-user call preferences, persisted by the UI as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CallSettings {
    pub video_quality: VideoQuality,
    pub audio_quality: AudioQuality,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_video_device: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_audio_device: Option<String>,
}

pub const IDEAL_FRAME_RATE: u32 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoConstraints {
    pub ideal_width: u32,
    pub ideal_height: u32,
    pub ideal_frame_rate: u32,
    pub device_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    pub ideal_sample_rate: u32,
    pub device_id: Option<String>,
}

/// What the media device collaborator is asked for. `None` means the kind
/// is not requested at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaConstraints {
    pub video: Option<VideoConstraints>,
    pub audio: Option<AudioConstraints>,
}

impl MediaConstraints {
    pub fn for_call(settings: &CallSettings, want_video: bool, want_audio: bool) -> Self {
        let video = want_video.then(|| {
            let (ideal_width, ideal_height) = settings.video_quality.resolution();
            VideoConstraints {
                ideal_width,
                ideal_height,
                ideal_frame_rate: IDEAL_FRAME_RATE,
                device_id: settings.preferred_video_device.clone(),
            }
        });
        // Voice processing is not user-configurable.
        let audio = want_audio.then(|| AudioConstraints {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            ideal_sample_rate: settings.audio_quality.sample_rate(),
            device_id: settings.preferred_audio_device.clone(),
        });
        Self { video, audio }
    }

    pub fn is_empty(&self) -> bool {
        self.video.is_none() && self.audio.is_none()
    }
}

/// Display capture request used for screen sharing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayConstraints {
    pub video: bool,
    pub audio: bool,
}

impl Default for DisplayConstraints {
    fn default() -> Self {
        Self {
            video: true,
            audio: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_video_is_720p30() {
        let c = MediaConstraints::for_call(&CallSettings::default(), true, true);
        let video = c.video.unwrap();
        assert_eq!((video.ideal_width, video.ideal_height), (1280, 720));
        assert_eq!(video.ideal_frame_rate, 30);

        let audio = c.audio.unwrap();
        assert!(audio.echo_cancellation && audio.noise_suppression && audio.auto_gain_control);
    }

    #[test]
    fn test_audio_only_call() {
        let c = MediaConstraints::for_call(&CallSettings::default(), false, true);
        assert!(c.video.is_none());
        assert!(c.audio.is_some());
        assert!(MediaConstraints::for_call(&CallSettings::default(), false, false).is_empty());
    }

    #[test]
    fn test_settings_drive_constraints() {
        let settings = CallSettings {
            video_quality: VideoQuality::Low,
            audio_quality: AudioQuality::Low,
            preferred_video_device: Some("cam-2".into()),
            preferred_audio_device: None,
        };
        let c = MediaConstraints::for_call(&settings, true, true);
        let video = c.video.unwrap();
        assert_eq!((video.ideal_width, video.ideal_height), (640, 480));
        assert_eq!(video.device_id.as_deref(), Some("cam-2"));
        assert_eq!(c.audio.unwrap().ideal_sample_rate, 16_000);
    }

    #[test]
    fn test_settings_json_defaults() {
        let settings: CallSettings = serde_json::from_str(r#"{"videoQuality":"high"}"#).unwrap();
        assert_eq!(settings.video_quality, VideoQuality::High);
        assert_eq!(settings.audio_quality, AudioQuality::High);
        assert_eq!(settings.preferred_audio_device, None);
    }
}
