use capture_bus::frame::{CameraIntrinsics, EncodedFrame, Frame, Transform};
use serde::{Deserialize, Serialize};

pub const FRAME_TOPIC: &str = "Frames";
pub const POSE_TOPIC: &str = "Poses";
pub const VIDEO_TOPIC: &str = "VideoFrames";

/// Pixel format tag carried in full-frame snapshots.
pub const FORMAT_RGB8: &str = "rgb8";

/// One full captured frame, published on user-triggered snapshots.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FrameMessage {
    pub id: u32,
    pub timestamp: f64,
    pub intrinsics: CameraIntrinsics,
    /// Column-major flattened 4x4 extrinsic.
    pub transform: [f32; 16],
    pub width: u32,
    pub height: u32,
    pub format: String,
    pub image: Vec<u8>,
    pub has_depth: bool,
    pub depth_width: u32,
    pub depth_height: u32,
    pub depth_scale: f32,
    pub depth_image: Vec<u8>,
}

impl FrameMessage {
    pub fn from_frame(id: u32, frame: &Frame) -> Self {
        let depth = frame.depth.as_ref();
        Self {
            id,
            timestamp: frame.timestamp,
            intrinsics: frame.intrinsics,
            transform: frame.transform.0,
            width: frame.width,
            height: frame.height,
            format: FORMAT_RGB8.to_string(),
            image: frame.rgb.to_vec(),
            has_depth: depth.is_some(),
            depth_width: depth.map(|d| d.width).unwrap_or(0),
            depth_height: depth.map(|d| d.height).unwrap_or(0),
            depth_scale: depth.map(|d| d.scale).unwrap_or(0.0),
            depth_image: depth.map(|d| d.data.to_vec()).unwrap_or_default(),
        }
    }
}

/// Camera pose sample. `action` is an application-level annotation riding
/// along with the pose; 1.0 unless the operator selects something else.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoseMessage {
    pub id: u32,
    pub timestamp: f64,
    pub intrinsics: CameraIntrinsics,
    pub transform: [f32; 16],
    pub action: f32,
}

pub const DEFAULT_ACTION: f32 = 1.0;

impl PoseMessage {
    pub fn from_frame(id: u32, frame: &Frame, action: f32) -> Self {
        Self {
            id,
            timestamp: frame.timestamp,
            intrinsics: frame.intrinsics,
            transform: frame.transform.0,
            action,
        }
    }
}

/// Encoded video frame plus the pose it was captured at. Depth fields are
/// zeroed when the frame carries no depth pair.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PosedVideoFrame {
    pub stream_id: u32,
    pub is_keyframe: bool,
    pub timestamp: f64,
    /// Annex-B NALU bytes; parameter sets prepended on keyframes.
    pub nalus: Vec<u8>,
    pub transform: [f32; 16],
    pub intrinsics: CameraIntrinsics,
    pub width: u32,
    pub height: u32,
    pub has_depth: bool,
    pub depth_width: u32,
    pub depth_height: u32,
    pub depth_scale: f32,
    /// Losslessly compressed depth plane when present.
    pub depth_image: Vec<u8>,
}

impl PosedVideoFrame {
    pub fn from_encoded(stream_id: u32, encoded: &EncodedFrame) -> Self {
        Self {
            stream_id,
            is_keyframe: encoded.is_keyframe,
            timestamp: encoded.timestamp,
            nalus: encoded.nalus.to_vec(),
            transform: encoded.transform.0,
            intrinsics: encoded.intrinsics,
            width: encoded.width,
            height: encoded.height,
            has_depth: false,
            depth_width: 0,
            depth_height: 0,
            depth_scale: 0.0,
            depth_image: Vec::new(),
        }
    }

    pub fn with_depth(mut self, width: u32, height: u32, scale: f32, compressed: Vec<u8>) -> Self {
        self.has_depth = true;
        self.depth_width = width;
        self.depth_height = height;
        self.depth_scale = scale;
        self.depth_image = compressed;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use capture_bus::frame::DepthBuffer;

    fn frame_with_depth() -> Frame {
        Frame {
            timestamp: 2.5,
            rgb: Bytes::from_static(&[1, 2, 3]),
            depth: Some(DepthBuffer {
                width: 2,
                height: 1,
                scale: 1.0,
                data: Bytes::from_static(&[0, 0, 0, 0, 0, 0, 128, 63]),
            }),
            intrinsics: CameraIntrinsics {
                fx: 100.0,
                fy: 100.0,
                cx: 1.0,
                cy: 0.5,
            },
            transform: Transform::IDENTITY,
            width: 2,
            height: 1,
        }
    }

    #[test]
    fn test_frame_message_carries_depth() {
        let msg = FrameMessage::from_frame(3, &frame_with_depth());
        assert_eq!(msg.id, 3);
        assert!(msg.has_depth);
        assert_eq!(msg.depth_width, 2);
        assert_eq!(msg.format, FORMAT_RGB8);
        assert_eq!(msg.image, vec![1, 2, 3]);
    }

    #[test]
    fn test_pose_message_defaults() {
        let msg = PoseMessage::from_frame(0, &frame_with_depth(), DEFAULT_ACTION);
        assert_eq!(msg.action, 1.0);
        assert_eq!(msg.transform, Transform::IDENTITY.0);
    }

    #[test]
    fn test_posed_video_frame_zeroed_depth() {
        let encoded = EncodedFrame {
            is_keyframe: true,
            nalus: Bytes::from_static(&[0, 0, 0, 1, 0x65]),
            width: 2,
            height: 1,
            intrinsics: CameraIntrinsics::default(),
            transform: Transform::IDENTITY,
            timestamp: 2.5,
        };
        let msg = PosedVideoFrame::from_encoded(7, &encoded);
        assert!(!msg.has_depth);
        assert_eq!(msg.depth_width, 0);
        assert_eq!(msg.depth_scale, 0.0);
        assert!(msg.depth_image.is_empty());
    }
}
