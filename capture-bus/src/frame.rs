use std::fmt::{Display, Formatter};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Pinhole camera intrinsics (focal lengths and principal point, in pixels).
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    pub fx: f32,
    pub fy: f32,
    pub cx: f32,
    pub cy: f32,
}

/// 4x4 camera extrinsic transform, stored column-major (16 floats).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transform(pub [f32; 16]);

impl Transform {
    pub const IDENTITY: Transform = Transform([
        1.0, 0.0, 0.0, 0.0, //
        0.0, 1.0, 0.0, 0.0, //
        0.0, 0.0, 1.0, 0.0, //
        0.0, 0.0, 0.0, 1.0,
    ]);

    /// Nested row-major array form, as written into the dataset manifest.
    pub fn rows(&self) -> [[f32; 4]; 4] {
        let m = &self.0;
        let mut rows = [[0.0f32; 4]; 4];
        for r in 0..4 {
            for c in 0..4 {
                rows[r][c] = m[c * 4 + r];
            }
        }
        rows
    }

    pub fn from_rows(rows: [[f32; 4]; 4]) -> Self {
        let mut m = [0.0f32; 16];
        for r in 0..4 {
            for c in 0..4 {
                m[c * 4 + r] = rows[r][c];
            }
        }
        Transform(m)
    }
}

impl Default for Transform {
    fn default() -> Self {
        Transform::IDENTITY
    }
}

/// Per-frame depth plane: little-endian f32 meters, row-major.
#[derive(Clone, Debug)]
pub struct DepthBuffer {
    pub width: u32,
    pub height: u32,
    /// Multiplier mapping stored values to meters.
    pub scale: f32,
    pub data: Bytes,
}

/// One captured sample from the frame source. Shared as `Arc<Frame>` so the
/// pipeline never copies pixel payloads while frames are in flight.
#[derive(Clone, Debug)]
pub struct Frame {
    /// Session timestamp, seconds, monotonic within a capture session.
    pub timestamp: f64,
    /// Packed RGB8 image buffer.
    pub rgb: Bytes,
    pub depth: Option<DepthBuffer>,
    pub intrinsics: CameraIntrinsics,
    pub transform: Transform,
    pub width: u32,
    pub height: u32,
}

impl Display for Frame {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "Frame {{ ts: {:.3}, {}x{}, rgb: {}, depth: {} }}",
            self.timestamp,
            self.width,
            self.height,
            self.rgb.len(),
            self.depth.as_ref().map(|d| d.data.len()).unwrap_or(0)
        )
    }
}

/// Output of the video encoder: an Annex-B bitstream with parameter sets
/// prepended when the frame is a keyframe, plus the pose metadata of its
/// source frame.
#[derive(Clone, Debug)]
pub struct EncodedFrame {
    pub is_keyframe: bool,
    pub nalus: Bytes,
    pub width: u32,
    pub height: u32,
    pub intrinsics: CameraIntrinsics,
    pub transform: Transform,
    pub timestamp: f64,
}

/// `(source frame, encoded payload)`; a `None` payload is the drop
/// notification for that frame.
pub type EncoderOutput = (Arc<Frame>, Option<EncodedFrame>);

pub type EncoderOutputSender = tokio::sync::broadcast::Sender<EncoderOutput>;
pub type EncoderOutputReceiver = tokio::sync::broadcast::Receiver<EncoderOutput>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transform_rows_round_trip() {
        let mut m = [0.0f32; 16];
        for (i, v) in m.iter_mut().enumerate() {
            *v = i as f32;
        }
        let t = Transform(m);
        let rows = t.rows();
        // Column-major [0..16] means rows[r][c] == c * 4 + r.
        assert_eq!(rows[0], [0.0, 4.0, 8.0, 12.0]);
        assert_eq!(rows[3], [3.0, 7.0, 11.0, 15.0]);
        assert_eq!(Transform::from_rows(rows), t);
    }

    #[test]
    fn test_identity_rows() {
        let rows = Transform::IDENTITY.rows();
        for r in 0..4 {
            for c in 0..4 {
                assert_eq!(rows[r][c], if r == c { 1.0 } else { 0.0 });
            }
        }
    }
}
