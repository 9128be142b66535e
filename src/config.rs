use std::path::Path;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use capture_bus::encoder::VideoSettings;

use crate::transport::messages::{FRAME_TOPIC, POSE_TOPIC, VIDEO_TOPIC};

/// Highest domain id the transport layer accepts.
pub const MAX_DOMAIN_ID: u32 = 232;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    pub domain_id: u32,
    pub interface: String,
    pub frame_topic: String,
    pub pose_topic: String,
    pub video_topic: String,
    /// Publish encoded video while streaming.
    pub publish_video: bool,
    /// Publish camera poses alongside encoded video while streaming.
    pub publish_poses: bool,
    /// In Snap mode, skip the full-frame topic and publish a pose sample
    /// for every captured frame instead.
    pub snap_pose_only: bool,
    /// Attach compressed depth planes to streamed video frames.
    pub publish_depth: bool,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            domain_id: 0,
            interface: "en0".to_string(),
            frame_topic: FRAME_TOPIC.to_string(),
            pose_topic: POSE_TOPIC.to_string(),
            video_topic: VIDEO_TOPIC.to_string(),
            publish_video: true,
            publish_poses: true,
            snap_pose_only: false,
            publish_depth: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleSettings {
    pub enabled: bool,
    /// Minimum interval between published frames, milliseconds.
    pub interval_ms: u64,
}

impl Default for ThrottleSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: 100,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub world_alignment: String,
    pub autofocus: bool,
    pub depth_enabled: bool,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1440,
            fps: 60,
            world_alignment: "gravity".to_string(),
            autofocus: true,
            depth_enabled: false,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub transport: TransportSettings,
    pub throttle: ThrottleSettings,
    pub capture: CaptureSettings,
    pub video: VideoSettings,
    /// Directory dataset projects are written under.
    pub dataset_root: String,
}

impl Settings {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("read settings {}", path.as_ref().display()))?;
        let settings: Settings = serde_json::from_str(&raw).context("parse settings")?;
        settings.validated()
    }

    pub fn validated(mut self) -> anyhow::Result<Self> {
        if self.transport.domain_id > MAX_DOMAIN_ID {
            log::warn!(
                "domain id {} above {}, clamping",
                self.transport.domain_id,
                MAX_DOMAIN_ID
            );
            self.transport.domain_id = MAX_DOMAIN_ID;
        }
        if self.transport.interface.is_empty() {
            bail!("transport interface must not be empty");
        }
        if self.capture.width == 0 || self.capture.height == 0 {
            bail!(
                "invalid capture size {}x{}",
                self.capture.width,
                self.capture.height
            );
        }
        if self.capture.fps == 0 {
            bail!("capture fps must be positive");
        }
        if self.throttle.enabled && self.throttle.interval_ms == 0 {
            bail!("throttle interval must be positive when enabled");
        }
        if self.dataset_root.is_empty() {
            self.dataset_root = ".".to_string();
        }
        self.video = self.video.validated();
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let settings = Settings::default().validated().unwrap();
        assert_eq!(settings.transport.domain_id, 0);
        assert_eq!(settings.transport.video_topic, VIDEO_TOPIC);
        assert_eq!(settings.dataset_root, ".");
    }

    #[test]
    fn test_domain_id_clamped() {
        let mut settings = Settings::default();
        settings.transport.domain_id = 500;
        let settings = settings.validated().unwrap();
        assert_eq!(settings.transport.domain_id, MAX_DOMAIN_ID);
    }

    #[test]
    fn test_rejects_empty_interface() {
        let mut settings = Settings::default();
        settings.transport.interface.clear();
        assert!(settings.validated().is_err());
    }

    #[test]
    fn test_rejects_zero_throttle_interval() {
        let mut settings = Settings::default();
        settings.throttle.enabled = true;
        settings.throttle.interval_ms = 0;
        assert!(settings.validated().is_err());
    }

    #[test]
    fn test_parses_partial_json() {
        let raw = r#"{ "transport": { "domain_id": 7 }, "throttle": { "enabled": true } }"#;
        let settings: Settings = serde_json::from_str(raw).unwrap();
        assert_eq!(settings.transport.domain_id, 7);
        assert!(settings.throttle.enabled);
        assert_eq!(settings.capture.width, 1920);
    }
}
