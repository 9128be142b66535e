use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};

use bytes::BytesMut;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::{
    annexb::{self, Codec},
    frame::{EncodedFrame, EncoderOutput, EncoderOutputReceiver, EncoderOutputSender, Frame},
    session::{
        CompressionSession, Picture, SessionConfig, SessionError, SessionEvent, SessionSink,
        SESSION_CHAN_CAP,
    },
};

/// Floor applied to configured bitrates.
pub const MIN_BITRATE: u32 = 100_000;

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct VideoSettings {
    pub codec: Codec,
    /// Average bitrate, bits per second.
    pub bitrate: u32,
    /// Maximum frames between scheduled keyframes.
    pub keyframe_interval: u32,
    pub realtime: bool,
    /// 0.0..=1.0 encoder quality hint.
    pub quality: f32,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            codec: Codec::H264,
            bitrate: 3_000_000,
            keyframe_interval: 60,
            realtime: true,
            quality: 0.25,
        }
    }
}

impl VideoSettings {
    pub fn validated(mut self) -> Self {
        if self.bitrate < MIN_BITRATE {
            self.bitrate = MIN_BITRATE;
        }
        if self.keyframe_interval == 0 {
            self.keyframe_interval = 1;
        }
        self.quality = self.quality.clamp(0.0, 1.0);
        self
    }
}

/// Which frame channel feeds the encoder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VideoSource {
    Color,
    Depth,
}

#[derive(Debug, thiserror::Error)]
pub enum EncoderError {
    #[error("encoder session: {0}")]
    SessionCreation(String),
    #[error("no pixel buffer available for the configured source channel")]
    SourceBufferUnavailable,
    #[error("frame submission failed: {0}")]
    Submit(String),
    #[error("encoder is closed")]
    Closed,
}

/// Wraps an asynchronous compression session: frames go in through
/// `encode`, encoded Annex-B frames (or drop notifications) come out of the
/// broadcast stream. Completion events are drained from the session's
/// channel on a dedicated task, so callback delivery context never leaks
/// into callers.
pub struct VideoEncoder {
    width: u32,
    height: u32,
    fps: u32,
    source: VideoSource,
    settings: VideoSettings,
    session: Mutex<Box<dyn CompressionSession>>,
    force_key: AtomicBool,
    closed: AtomicBool,
    next_token: AtomicU64,
    in_flight: Arc<Mutex<HashMap<u64, Arc<Frame>>>>,
    out: EncoderOutputSender,
    cancel: CancellationToken,
    drain: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl VideoEncoder {
    /// Encoder output = encoded frames (small relative to raw). Moderate
    /// capacity for bursts.
    const OUTPUT_CHAN_CAP: usize = 64;

    pub fn new<F>(
        width: u32,
        height: u32,
        fps: u32,
        source: VideoSource,
        settings: VideoSettings,
        make_session: F,
    ) -> Result<Self, EncoderError>
    where
        F: FnOnce(&SessionConfig, SessionSink) -> Result<Box<dyn CompressionSession>, SessionError>,
    {
        let settings = settings.validated();
        let config = SessionConfig {
            width,
            height,
            fps,
            settings: settings.clone(),
        };
        let (sink, events) = mpsc::channel(SESSION_CHAN_CAP);
        let session = make_session(&config, sink)
            .map_err(|e| EncoderError::SessionCreation(e.to_string()))?;

        let (out, _) = broadcast::channel(Self::OUTPUT_CHAN_CAP);
        let in_flight = Arc::new(Mutex::new(HashMap::new()));
        let cancel = CancellationToken::new();

        let drain = tokio::spawn(Self::drain_loop(
            events,
            Arc::clone(&in_flight),
            out.clone(),
            cancel.clone(),
        ));

        log::info!(
            "video encoder ready: {}x{}@{} {:?} source {:?}",
            width,
            height,
            fps,
            settings.codec,
            source
        );

        Ok(Self {
            width,
            height,
            fps,
            source,
            settings,
            session: Mutex::new(session),
            force_key: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            next_token: AtomicU64::new(0),
            in_flight,
            out,
            cancel,
            drain: Mutex::new(Some(drain)),
        })
    }

    pub fn with_loopback(
        width: u32,
        height: u32,
        fps: u32,
        source: VideoSource,
        settings: VideoSettings,
    ) -> Result<Self, EncoderError> {
        Self::new(width, height, fps, source, settings, crate::session::LoopbackSession::create)
    }

    pub fn subscribe(&self) -> EncoderOutputReceiver {
        self.out.subscribe()
    }

    /// One-shot: the next `encode` call submits a forced sync frame.
    pub fn force_keyframe(&self) {
        self.force_key.store(true, Ordering::Release);
    }

    /// Submits one frame for compression. Returns without waiting for
    /// completion; the result arrives on the output stream.
    pub fn encode(&self, frame: &Arc<Frame>) -> Result<(), EncoderError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EncoderError::Closed);
        }
        let picture = match self.source {
            VideoSource::Color => Picture {
                data: frame.rgb.clone(),
                width: frame.width,
                height: frame.height,
            },
            VideoSource::Depth => {
                let depth = frame
                    .depth
                    .as_ref()
                    .ok_or(EncoderError::SourceBufferUnavailable)?;
                Picture {
                    data: depth.data.clone(),
                    width: depth.width,
                    height: depth.height,
                }
            }
        };

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.in_flight
            .lock()
            .unwrap()
            .insert(token, Arc::clone(frame));

        // Consumed exactly once, even if this submission fails.
        let force = self.force_key.swap(false, Ordering::AcqRel);

        let res = self
            .session
            .lock()
            .unwrap()
            .submit(token, picture, frame.timestamp, force);
        if let Err(e) = res {
            self.in_flight.lock().unwrap().remove(&token);
            return Err(match e {
                SessionError::Closed => EncoderError::Closed,
                other => EncoderError::Submit(other.to_string()),
            });
        }
        Ok(())
    }

    /// Flushes in-flight frames and invalidates the session. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.session.lock().unwrap().complete();
        let handle = self.drain.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.cancel.cancel();
    }

    async fn drain_loop(
        mut events: mpsc::Receiver<SessionEvent>,
        in_flight: Arc<Mutex<HashMap<u64, Arc<Frame>>>>,
        out: EncoderOutputSender,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                ev = events.recv() => match ev {
                    Some(ev) => ev,
                    None => break,
                },
            };
            match event {
                SessionEvent::Flushed => break,
                SessionEvent::Dropped { token } => {
                    let frame = in_flight.lock().unwrap().remove(&token);
                    if let Some(frame) = frame {
                        log::debug!("frame dropped by compression session (ts {:.3})", frame.timestamp);
                        let _ = out.send((frame, None));
                    }
                }
                SessionEvent::Sample {
                    token,
                    data,
                    flags,
                    format,
                } => {
                    let frame = match in_flight.lock().unwrap().remove(&token) {
                        Some(f) => f,
                        None => {
                            log::warn!("completion for unknown frame token {}", token);
                            continue;
                        }
                    };
                    let mut nalus = annexb::to_annex_b(&data);
                    if nalus.is_empty() {
                        log::warn!("could not extract NALUs, frame discarded");
                        continue;
                    }
                    let is_keyframe = flags.is_keyframe();
                    if is_keyframe {
                        match annexb::extract_parameter_sets(&format) {
                            Some(sets) => {
                                let mut buf = BytesMut::with_capacity(sets.len() + nalus.len());
                                buf.extend_from_slice(&sets);
                                buf.extend_from_slice(&nalus);
                                nalus = buf.freeze();
                            }
                            None => {
                                log::warn!("could not extract parameter sets, keyframe discarded");
                                continue;
                            }
                        }
                    }
                    let encoded = EncodedFrame {
                        is_keyframe,
                        nalus,
                        width: frame.width,
                        height: frame.height,
                        intrinsics: frame.intrinsics,
                        transform: frame.transform,
                        timestamp: frame.timestamp,
                    };
                    let _ = out.send((frame, Some(encoded)));
                }
            }
        }
        // Completion events lost to a full session channel leave their
        // frames behind; report them as dropped so no submission goes
        // unanswered.
        let mut leftover: Vec<_> = in_flight.lock().unwrap().drain().collect();
        if !leftover.is_empty() {
            log::debug!("{} frames unanswered at drain exit", leftover.len());
            leftover.sort_by_key(|(token, _)| *token);
            for (_, frame) in leftover {
                let _ = out.send((frame, None));
            }
        }
        log::info!("encoder drain task finished");
    }
}

impl Drop for VideoEncoder {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
        if let Ok(mut session) = self.session.lock() {
            session.complete();
        }
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{CameraIntrinsics, DepthBuffer, Transform};
    use bytes::Bytes;

    fn test_frame(ts: f64, with_depth: bool) -> Arc<Frame> {
        Arc::new(Frame {
            timestamp: ts,
            rgb: Bytes::from(vec![0x10u8; 4 * 4 * 3]),
            depth: with_depth.then(|| DepthBuffer {
                width: 2,
                height: 2,
                scale: 1.0,
                data: Bytes::from(vec![0u8; 16]),
            }),
            intrinsics: CameraIntrinsics {
                fx: 500.0,
                fy: 500.0,
                cx: 2.0,
                cy: 2.0,
            },
            transform: Transform::IDENTITY,
            width: 4,
            height: 4,
        })
    }

    fn loopback_encoder(source: VideoSource) -> VideoEncoder {
        VideoEncoder::with_loopback(4, 4, 30, source, VideoSettings::default()).unwrap()
    }

    #[tokio::test]
    async fn test_session_creation_failure_propagates() {
        let err = VideoEncoder::with_loopback(0, 0, 30, VideoSource::Color, VideoSettings::default())
            .err()
            .unwrap();
        assert!(matches!(err, EncoderError::SessionCreation(_)));
    }

    #[tokio::test]
    async fn test_depth_source_without_depth_buffer_fails() {
        let encoder = loopback_encoder(VideoSource::Depth);
        let err = encoder.encode(&test_frame(0.0, false)).err().unwrap();
        assert!(matches!(err, EncoderError::SourceBufferUnavailable));
        // The frame with a depth buffer goes through.
        encoder.encode(&test_frame(0.1, true)).unwrap();
    }

    #[tokio::test]
    async fn test_first_output_is_keyframe_with_parameter_sets() {
        let encoder = loopback_encoder(VideoSource::Color);
        let mut rx = encoder.subscribe();
        encoder.encode(&test_frame(0.0, false)).unwrap();
        encoder.encode(&test_frame(0.033, false)).unwrap();

        let (frame, encoded) = rx.recv().await.unwrap();
        let encoded = encoded.unwrap();
        assert_eq!(frame.timestamp, 0.0);
        assert!(encoded.is_keyframe);
        // Keyframe payload = SPS + PPS + frame NALU.
        assert_eq!(annexb::split_nalus(&encoded.nalus).len(), 3);

        let (_, encoded) = rx.recv().await.unwrap();
        let encoded = encoded.unwrap();
        assert!(!encoded.is_keyframe);
        assert_eq!(annexb::split_nalus(&encoded.nalus).len(), 1);
    }

    #[tokio::test]
    async fn test_force_keyframe_consumed_once() {
        let encoder = loopback_encoder(VideoSource::Color);
        let mut rx = encoder.subscribe();
        // First frame is a scheduled keyframe; get past it.
        encoder.encode(&test_frame(0.0, false)).unwrap();
        let _ = rx.recv().await.unwrap();

        encoder.force_keyframe();
        encoder.encode(&test_frame(0.1, false)).unwrap();
        encoder.encode(&test_frame(0.2, false)).unwrap();

        let (_, encoded) = rx.recv().await.unwrap();
        let encoded = encoded.unwrap();
        assert!(encoded.is_keyframe);
        let nalus = annexb::split_nalus(&encoded.nalus);
        assert_eq!(nalus.len(), 3);
        // Parameter sets come before the frame payload.
        assert_eq!(nalus[0][0], 0x67);
        assert_eq!(nalus[1][0], 0x68);
        assert_eq!(nalus[2][0], 0x65);

        // Flag was consumed: the next frame is not forced.
        let (_, encoded) = rx.recv().await.unwrap();
        assert!(!encoded.unwrap().is_keyframe);
    }

    #[tokio::test]
    async fn test_close_returns_when_completion_channel_overflows() {
        // Submit well past the session channel capacity without yielding, so
        // completion events (including the terminal flush) get discarded.
        let encoder = loopback_encoder(VideoSource::Color);
        let mut rx = encoder.subscribe();
        for i in 0..(SESSION_CHAN_CAP + 8) {
            encoder.encode(&test_frame(i as f64 * 0.033, false)).unwrap();
        }
        tokio::time::timeout(std::time::Duration::from_secs(3), encoder.close())
            .await
            .unwrap();

        // Every submission gets an answer: a sample or a drop notification.
        let mut answered = 0usize;
        loop {
            match rx.try_recv() {
                Ok(_) => answered += 1,
                Err(broadcast::error::TryRecvError::Lagged(n)) => answered += n as usize,
                Err(_) => break,
            }
        }
        assert_eq!(answered, SESSION_CHAN_CAP + 8);
    }

    #[tokio::test]
    async fn test_encode_after_close_fails() {
        let encoder = loopback_encoder(VideoSource::Color);
        encoder.close().await;
        let err = encoder.encode(&test_frame(0.0, false)).err().unwrap();
        assert!(matches!(err, EncoderError::Closed));
    }

    /// Scripted session for failure-path coverage: emits a drop notification
    /// for every submitted frame.
    struct DroppingSession {
        sink: Option<SessionSink>,
    }

    impl CompressionSession for DroppingSession {
        fn submit(
            &mut self,
            token: u64,
            _picture: Picture,
            _pts: f64,
            _force: bool,
        ) -> Result<(), SessionError> {
            if let Some(sink) = &self.sink {
                let _ = sink.try_send(SessionEvent::Dropped { token });
            }
            Ok(())
        }

        fn complete(&mut self) {
            if let Some(sink) = self.sink.take() {
                let _ = sink.try_send(SessionEvent::Flushed);
            }
        }
    }

    #[tokio::test]
    async fn test_drop_notification_correlates_source_frame() {
        let encoder = VideoEncoder::new(
            4,
            4,
            30,
            VideoSource::Color,
            VideoSettings::default(),
            |_config, sink| {
                Ok(Box::new(DroppingSession { sink: Some(sink) }) as Box<dyn CompressionSession>)
            },
        )
        .unwrap();
        let mut rx = encoder.subscribe();
        let frame = test_frame(1.5, false);
        encoder.encode(&frame).unwrap();

        let (source, payload) = rx.recv().await.unwrap();
        assert!(payload.is_none());
        assert_eq!(source.timestamp, 1.5);
    }
}
