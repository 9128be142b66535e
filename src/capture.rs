use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use capture_bus::frame::{CameraIntrinsics, DepthBuffer, Frame, Transform};

use crate::config::CaptureSettings;

const FRAME_CHAN_CAP: usize = 8;

/// Camera tracking quality, surfaced to the operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TrackingState {
    #[default]
    NotAvailable,
    Normal,
    ExcessiveMotion,
    Initializing,
    InsufficientFeatures,
    Unknown,
}

impl std::fmt::Display for TrackingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TrackingState::NotAvailable => "Not Available",
            TrackingState::Normal => "Tracking Normal",
            TrackingState::ExcessiveMotion => "Excessive Motion",
            TrackingState::Initializing => "Tracking Initializing",
            TrackingState::InsufficientFeatures => "Insufficient Features",
            TrackingState::Unknown => "Unknown",
        };
        write!(f, "{}", s)
    }
}

/// Fan-out point for captured frames. Producers push with [`FrameSource::push`];
/// the pipeline subscribes per mode and snapshots read [`FrameSource::current_frame`].
pub struct FrameSource {
    tx: broadcast::Sender<Arc<Frame>>,
    tracking_tx: watch::Sender<TrackingState>,
    latest: Mutex<Option<Arc<Frame>>>,
}

impl FrameSource {
    pub fn new() -> Arc<Self> {
        let (tx, _) = broadcast::channel(FRAME_CHAN_CAP);
        let (tracking_tx, _) = watch::channel(TrackingState::default());
        Arc::new(Self {
            tx,
            tracking_tx,
            latest: Mutex::new(None),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Frame>> {
        self.tx.subscribe()
    }

    pub fn tracking(&self) -> watch::Receiver<TrackingState> {
        self.tracking_tx.subscribe()
    }

    pub fn set_tracking(&self, state: TrackingState) {
        self.tracking_tx.send_replace(state);
    }

    /// Most recent frame seen, regardless of subscriber backlog.
    pub fn current_frame(&self) -> Option<Arc<Frame>> {
        self.latest.lock().ok().and_then(|g| g.clone())
    }

    pub fn push(&self, frame: Arc<Frame>) {
        if let Ok(mut latest) = self.latest.lock() {
            *latest = Some(frame.clone());
        }
        // No subscribers is fine; Stream mode may not be active.
        let _ = self.tx.send(frame);
    }
}

/// Synthetic frame producer used in place of a camera. Emits a moving
/// gradient at the configured rate with a slow circular pose orbit.
pub struct TestPatternSource {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

impl TestPatternSource {
    pub fn start(source: Arc<FrameSource>, settings: CaptureSettings) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            source.set_tracking(TrackingState::Normal);
            let interval = Duration::from_secs_f64(1.0 / settings.fps.max(1) as f64);
            let mut ticker = tokio::time::interval(interval);
            let mut n: u64 = 0;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let frame = synthesize(&settings, n);
                source.push(Arc::new(frame));
                n += 1;
            }
            log::debug!("test pattern source stopped after {} frames", n);
        });
        Self { handle, cancel }
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

fn synthesize(settings: &CaptureSettings, n: u64) -> Frame {
    let w = settings.width;
    let h = settings.height;
    let mut rgb = Vec::with_capacity((w * h * 3) as usize);
    let phase = (n % 256) as u8;
    for y in 0..h {
        for x in 0..w {
            rgb.push((x as u8).wrapping_add(phase));
            rgb.push(y as u8);
            rgb.push(phase);
        }
    }
    let depth = settings.depth_enabled.then(|| {
        let mut data = Vec::with_capacity((w * h * 4) as usize);
        for i in 0..(w * h) {
            let meters = 1.0 + (i % 100) as f32 / 100.0;
            data.extend_from_slice(&meters.to_le_bytes());
        }
        DepthBuffer {
            width: w,
            height: h,
            scale: 1.0,
            data: Bytes::from(data),
        }
    });
    let fps = settings.fps.max(1) as f64;
    let angle = n as f32 * 0.01;
    let mut m = Transform::IDENTITY.0;
    m[0] = angle.cos();
    m[1] = angle.sin();
    m[4] = -angle.sin();
    m[5] = angle.cos();
    m[12] = angle.cos() * 0.5;
    m[13] = angle.sin() * 0.5;
    Frame {
        timestamp: n as f64 / fps,
        rgb: Bytes::from(rgb),
        depth,
        intrinsics: CameraIntrinsics {
            fx: w as f32 * 0.8,
            fy: w as f32 * 0.8,
            cx: w as f32 / 2.0,
            cy: h as f32 / 2.0,
        },
        transform: Transform(m),
        width: w,
        height: h,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_settings() -> CaptureSettings {
        CaptureSettings {
            width: 8,
            height: 6,
            fps: 120,
            depth_enabled: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_tracking_state_labels() {
        assert_eq!(TrackingState::Normal.to_string(), "Tracking Normal");
        assert_eq!(TrackingState::NotAvailable.to_string(), "Not Available");
        assert_eq!(
            TrackingState::InsufficientFeatures.to_string(),
            "Insufficient Features"
        );
    }

    #[test]
    fn test_push_updates_current_frame() {
        let source = FrameSource::new();
        assert!(source.current_frame().is_none());
        let frame = Arc::new(synthesize(&small_settings(), 0));
        source.push(frame.clone());
        let current = source.current_frame().unwrap();
        assert_eq!(current.timestamp, frame.timestamp);
    }

    #[test]
    fn test_synthesized_frame_shape() {
        let settings = small_settings();
        let frame = synthesize(&settings, 3);
        assert_eq!(frame.rgb.len(), 8 * 6 * 3);
        let depth = frame.depth.unwrap();
        assert_eq!(depth.data.len(), 8 * 6 * 4);
        assert_eq!(frame.timestamp, 3.0 / 120.0);
    }

    #[tokio::test]
    async fn test_test_pattern_source_emits() {
        let source = FrameSource::new();
        let mut rx = source.subscribe();
        let mut tracking = source.tracking();
        let pattern = TestPatternSource::start(source.clone(), small_settings());
        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.width, 8);
        tracking.changed().await.ok();
        assert_eq!(*tracking.borrow(), TrackingState::Normal);
        pattern.stop().await;
        assert!(source.current_frame().is_some());
    }
}
