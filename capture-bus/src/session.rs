use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    annexb::{Codec, FormatDescription, SampleFlags},
    encoder::VideoSettings,
};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("compression session could not be created: {0}")]
    Creation(String),
    #[error("compression session is closed")]
    Closed,
    #[error("frame submission rejected: {0}")]
    Submit(String),
}

/// One asynchronous completion from the compression session. `token`
/// correlates the event back to the submitted frame.
#[derive(Clone, Debug)]
pub enum SessionEvent {
    Sample {
        token: u64,
        /// Length-prefixed (AVCC/HVCC) bitstream of the encoded frame.
        data: Bytes,
        flags: SampleFlags,
        format: FormatDescription,
    },
    Dropped {
        token: u64,
    },
    /// Terminal event: all in-flight frames have been drained.
    Flushed,
}

/// Completion channel handed to the session at creation. The session pushes
/// events into it from whatever context its driver runs on; the encoder's
/// drain task is the only consumer.
pub type SessionSink = tokio::sync::mpsc::Sender<SessionEvent>;

pub const SESSION_CHAN_CAP: usize = 64;

/// The selected channel's pixel data for one frame.
#[derive(Clone, Debug)]
pub struct Picture {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub settings: VideoSettings,
}

/// Seam to the asynchronous hardware compression session. Submission never
/// blocks on completion; results arrive on the `SessionSink` given at
/// creation, possibly from a different execution context.
pub trait CompressionSession: Send {
    fn submit(
        &mut self,
        token: u64,
        picture: Picture,
        pts: f64,
        force_keyframe: bool,
    ) -> Result<(), SessionError>;

    /// Drain all in-flight frames, emit `SessionEvent::Flushed` if the sink
    /// has room, and release the sink so the completion channel closes.
    /// Further submits fail with `Closed`.
    fn complete(&mut self);
}

/// Factory signature used by the encoder so backends stay pluggable.
pub type SessionFactory =
    dyn FnOnce(&SessionConfig, SessionSink) -> Result<Box<dyn CompressionSession>, SessionError>;

/// Deterministic software stand-in for a hardware compression session: wraps
/// each submitted picture into a single length-prefixed NAL unit, honoring
/// the forced-keyframe flag and the configured keyframe interval. The output
/// goes through the exact same AVCC-to-Annex-B path a hardware bitstream
/// would, which is what the callers exercise.
pub struct LoopbackSession {
    sink: Option<SessionSink>,
    codec: Codec,
    keyframe_interval: u32,
    frames_since_key: u32,
    closed: bool,
}

impl LoopbackSession {
    pub fn create(
        config: &SessionConfig,
        sink: SessionSink,
    ) -> Result<Box<dyn CompressionSession>, SessionError> {
        if config.width == 0 || config.height == 0 {
            return Err(SessionError::Creation(format!(
                "invalid dimensions {}x{}",
                config.width, config.height
            )));
        }
        Ok(Box::new(LoopbackSession {
            sink: Some(sink),
            codec: config.settings.codec,
            keyframe_interval: config.settings.keyframe_interval.max(1),
            frames_since_key: 0,
            closed: false,
        }))
    }

    fn format_description(&self) -> FormatDescription {
        let parameter_sets = match self.codec {
            Codec::H264 => vec![
                Bytes::from_static(&[0x67, 0x42, 0xc0, 0x1e, 0xd9]),
                Bytes::from_static(&[0x68, 0xcb, 0x83, 0xcb, 0x20]),
            ],
            Codec::Hevc => vec![
                Bytes::from_static(&[0x40, 0x01, 0x0c, 0x01]),
                Bytes::from_static(&[0x42, 0x01, 0x01, 0x01]),
                Bytes::from_static(&[0x44, 0x01, 0xc1, 0x72]),
            ],
        };
        FormatDescription {
            codec: self.codec,
            parameter_sets,
        }
    }
}

impl CompressionSession for LoopbackSession {
    fn submit(
        &mut self,
        token: u64,
        picture: Picture,
        _pts: f64,
        force_keyframe: bool,
    ) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }
        let Some(sink) = self.sink.as_ref() else {
            return Err(SessionError::Closed);
        };

        if force_keyframe || self.frames_since_key >= self.keyframe_interval {
            self.frames_since_key = 0;
        }
        let is_key = self.frames_since_key == 0;
        self.frames_since_key += 1;

        // Single NALU: header byte + raw picture payload, length-prefixed.
        let header: u8 = match (self.codec, is_key) {
            (Codec::H264, true) => 0x65,
            (Codec::H264, false) => 0x41,
            (Codec::Hevc, true) => 0x26,
            (Codec::Hevc, false) => 0x02,
        };
        let mut data = BytesMut::with_capacity(picture.data.len() + 5);
        data.put_u32(picture.data.len() as u32 + 1);
        data.put_u8(header);
        data.extend_from_slice(&picture.data);

        let event = SessionEvent::Sample {
            token,
            data: data.freeze(),
            flags: SampleFlags {
                not_sync: Some(!is_key),
            },
            format: self.format_description(),
        };
        if sink.try_send(event).is_err() {
            // Completion queue full: report the frame as dropped if possible.
            let _ = sink.try_send(SessionEvent::Dropped { token });
            log::debug!("loopback session output queue full, frame {} dropped", token);
        }
        Ok(())
    }

    fn complete(&mut self) {
        self.closed = true;
        // Dropping the sink closes the completion channel, so the consumer
        // still sees end-of-stream when the Flushed event cannot be queued.
        if let Some(sink) = self.sink.take() {
            let _ = sink.try_send(SessionEvent::Flushed);
        }
    }
}
