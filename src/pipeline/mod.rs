mod throttle;


use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::{anyhow, Context};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use capture_bus::depth::compress_depth;
use capture_bus::encoder::{VideoEncoder, VideoSource};
use capture_bus::frame::Frame;

use crate::capture::FrameSource;
use crate::config::Settings;
use crate::dataset::DatasetWriter;
use crate::transport::messages::{FrameMessage, PoseMessage, PosedVideoFrame};
use crate::transport::{Domain, Publisher, Qos, TransportConfig};

use throttle::{release_pending, LatestWins};

/// What the pipeline is currently doing with incoming frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActiveMode {
    /// Encode and publish continuously.
    Stream,
    /// Hold transport open, send single frames on demand.
    Snap,
    /// Write frames into a local dataset project.
    Save,
}

#[derive(Clone, Debug)]
pub struct PipelineStatus {
    pub mode: Option<ActiveMode>,
    pub frames_published: u32,
    pub snaps_sent: u32,
    pub frames_saved: usize,
    pub action: f32,
}

enum PipelineCommand {
    SetMode(Option<ActiveMode>, oneshot::Sender<anyhow::Result<()>>),
    SendSnap(oneshot::Sender<anyhow::Result<u32>>),
    SaveFrame(oneshot::Sender<anyhow::Result<usize>>),
    FinalizeProject {
        zip: bool,
        reply: oneshot::Sender<anyhow::Result<PathBuf>>,
    },
    SetAction(f32),
    Status(oneshot::Sender<PipelineStatus>),
}

/// Handle to the pipeline worker. Cheap to clone; all mutation funnels
/// through the worker's command loop so mode changes are serialized.
#[derive(Clone)]
pub struct Pipeline {
    tx: mpsc::Sender<PipelineCommand>,
}

impl Pipeline {
    pub fn start(settings: Settings, source: Arc<FrameSource>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(16);
        let worker = Worker::new(settings, source);
        let handle = tokio::spawn(worker.run(rx));
        (Self { tx }, handle)
    }

    pub async fn set_mode(&self, mode: Option<ActiveMode>) -> anyhow::Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PipelineCommand::SetMode(mode, reply))
            .await
            .map_err(|_| anyhow!("pipeline stopped"))?;
        rx.await.map_err(|_| anyhow!("pipeline stopped"))?
    }

    /// Publishes the current frame (and its pose) once. Snap mode only.
    pub async fn send_snap(&self) -> anyhow::Result<u32> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PipelineCommand::SendSnap(reply))
            .await
            .map_err(|_| anyhow!("pipeline stopped"))?;
        rx.await.map_err(|_| anyhow!("pipeline stopped"))?
    }

    /// Appends the current frame to the open dataset project. Save mode only.
    pub async fn save_frame(&self) -> anyhow::Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PipelineCommand::SaveFrame(reply))
            .await
            .map_err(|_| anyhow!("pipeline stopped"))?;
        rx.await.map_err(|_| anyhow!("pipeline stopped"))?
    }

    /// Writes the manifest, leaves Save mode, and returns the project path.
    pub async fn finalize_project(&self, zip: bool) -> anyhow::Result<PathBuf> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PipelineCommand::FinalizeProject { zip, reply })
            .await
            .map_err(|_| anyhow!("pipeline stopped"))?;
        rx.await.map_err(|_| anyhow!("pipeline stopped"))?
    }

    pub async fn set_action(&self, action: f32) -> anyhow::Result<()> {
        self.tx
            .send(PipelineCommand::SetAction(action))
            .await
            .map_err(|_| anyhow!("pipeline stopped"))
    }

    pub async fn status(&self) -> anyhow::Result<PipelineStatus> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PipelineCommand::Status(reply))
            .await
            .map_err(|_| anyhow!("pipeline stopped"))?;
        rx.await.map_err(|_| anyhow!("pipeline stopped"))
    }

    /// Tears down whatever mode is active and stops the worker.
    pub async fn shutdown(self) {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(PipelineCommand::SetMode(None, reply))
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}

struct StreamState {
    domain: Domain,
    video_pub: Option<Arc<Publisher<PosedVideoFrame>>>,
    pose_pub: Option<Arc<Publisher<PoseMessage>>>,
    encoder: Option<Arc<VideoEncoder>>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

struct SnapState {
    domain: Domain,
    frame_pub: Option<Publisher<FrameMessage>>,
    pose_pub: Arc<Publisher<PoseMessage>>,
    /// Shared with the pose-only forwarder so discrete snaps and continuous
    /// poses draw from one id sequence. Restarts at 0 on every mode entry.
    next_id: Arc<AtomicU32>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

struct SaveState {
    writer: DatasetWriter,
}

enum ModeState {
    Stream(StreamState),
    Snap(SnapState),
    Save(SaveState),
}

impl ModeState {
    fn mode(&self) -> ActiveMode {
        match self {
            ModeState::Stream(_) => ActiveMode::Stream,
            ModeState::Snap(_) => ActiveMode::Snap,
            ModeState::Save(_) => ActiveMode::Save,
        }
    }
}

struct Worker {
    settings: Settings,
    source: Arc<FrameSource>,
    state: Option<ModeState>,
    action_tx: watch::Sender<f32>,
    frames_published: Arc<AtomicU32>,
    snaps_sent: u32,
}

impl Worker {
    fn new(settings: Settings, source: Arc<FrameSource>) -> Self {
        let (action_tx, _) = watch::channel(crate::transport::messages::DEFAULT_ACTION);
        Self {
            settings,
            source,
            state: None,
            action_tx,
            frames_published: Arc::new(AtomicU32::new(0)),
            snaps_sent: 0,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<PipelineCommand>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                PipelineCommand::SetMode(mode, reply) => {
                    let res = self.set_mode(mode).await;
                    let _ = reply.send(res);
                }
                PipelineCommand::SendSnap(reply) => {
                    let _ = reply.send(self.send_snap());
                }
                PipelineCommand::SaveFrame(reply) => {
                    let _ = reply.send(self.save_frame().await);
                }
                PipelineCommand::FinalizeProject { zip, reply } => {
                    let _ = reply.send(self.finalize_project(zip));
                }
                PipelineCommand::SetAction(action) => {
                    self.action_tx.send_replace(action);
                }
                PipelineCommand::Status(reply) => {
                    let _ = reply.send(self.status());
                }
            }
        }
        // Senders gone; make sure no mode outlives its pipeline.
        self.teardown().await;
    }

    fn status(&self) -> PipelineStatus {
        PipelineStatus {
            mode: self.state.as_ref().map(|s| s.mode()),
            frames_published: self.frames_published.load(Ordering::Relaxed),
            snaps_sent: self.snaps_sent,
            frames_saved: match &self.state {
                Some(ModeState::Save(s)) => s.writer.frame_count(),
                _ => 0,
            },
            action: *self.action_tx.borrow(),
        }
    }

    /// Mode switches always finish tearing the old mode down before any new
    /// resource is created, so transport and encoder handles never overlap.
    async fn set_mode(&mut self, mode: Option<ActiveMode>) -> anyhow::Result<()> {
        if self.state.as_ref().map(|s| s.mode()) == mode {
            return Ok(());
        }
        self.teardown().await;
        let state = match mode {
            None => None,
            Some(ActiveMode::Stream) => Some(ModeState::Stream(self.setup_stream()?)),
            Some(ActiveMode::Snap) => Some(ModeState::Snap(self.setup_snap()?)),
            Some(ActiveMode::Save) => Some(ModeState::Save(SaveState {
                writer: DatasetWriter::create(&self.settings.dataset_root)?,
            })),
        };
        self.state = state;
        if let Some(state) = &self.state {
            log::info!("pipeline mode now {:?}", state.mode());
        } else {
            log::info!("pipeline idle");
        }
        Ok(())
    }

    /// Teardown failures are logged, never propagated: the next mode must
    /// always be reachable.
    async fn teardown(&mut self) {
        let Some(state) = self.state.take() else {
            return;
        };
        match state {
            ModeState::Stream(mut stream) => {
                stream.cancel.cancel();
                for task in stream.tasks.drain(..) {
                    let _ = task.await;
                }
                if let Some(encoder) = &stream.encoder {
                    encoder.close().await;
                }
                if let Some(video) = &stream.video_pub {
                    video.stop();
                }
                if let Some(pose) = &stream.pose_pub {
                    pose.stop();
                }
                if let Err(e) = stream.domain.destroy() {
                    log::warn!("stream domain teardown: {}", e);
                }
            }
            ModeState::Snap(mut snap) => {
                snap.cancel.cancel();
                for task in snap.tasks.drain(..) {
                    let _ = task.await;
                }
                if let Some(frame_pub) = &snap.frame_pub {
                    frame_pub.stop();
                }
                snap.pose_pub.stop();
                if let Err(e) = snap.domain.destroy() {
                    log::warn!("snap domain teardown: {}", e);
                }
            }
            ModeState::Save(save) => {
                // Leaving Save mode without an explicit finalize still
                // persists what was captured; empty projects are removed.
                if save.writer.frame_count() > 0 {
                    match save.writer.finalize(false) {
                        Ok(path) => {
                            log::info!("unfinalized project persisted at {}", path.display())
                        }
                        Err(e) => log::warn!("save teardown: {}", e),
                    }
                } else if let Err(e) = save.writer.clean() {
                    log::warn!("save teardown: {}", e);
                }
            }
        }
    }

    fn create_domain(&self) -> anyhow::Result<Domain> {
        let mut domain = Domain::new(
            self.settings.transport.domain_id,
            TransportConfig {
                interface: self.settings.transport.interface.clone(),
            },
        );
        domain.create().context("create transport domain")?;
        Ok(domain)
    }

    fn setup_stream(&mut self) -> anyhow::Result<StreamState> {
        let transport = &self.settings.transport;
        let capture = &self.settings.capture;
        let domain = self.create_domain()?;

        let video_pub = if transport.publish_video {
            let p = Arc::new(Publisher::<PosedVideoFrame>::new(
                &domain,
                &transport.video_topic,
                Qos::realtime(),
            )?);
            if !p.start() {
                return Err(anyhow!("could not start video publisher"));
            }
            Some(p)
        } else {
            None
        };
        let pose_pub = if transport.publish_poses {
            let p = Arc::new(Publisher::<PoseMessage>::new(
                &domain,
                &transport.pose_topic,
                Qos::realtime(),
            )?);
            if !p.start() {
                if let Some(video) = &video_pub {
                    video.stop();
                }
                return Err(anyhow!("could not start pose publisher"));
            }
            Some(p)
        } else {
            None
        };

        // The encoder only exists when there is a video topic to feed.
        let encoder = match &video_pub {
            Some(_) => Some(Arc::new(VideoEncoder::with_loopback(
                capture.width,
                capture.height,
                capture.fps,
                VideoSource::Color,
                self.settings.video.clone(),
            )?)),
            None => None,
        };

        let cancel = CancellationToken::new();
        let published = Arc::new(AtomicU32::new(0));
        self.frames_published = Arc::clone(&published);
        let mut tasks = Vec::new();

        // Capture fan-in: throttled frames go out as poses and into the
        // encoder. Pose ids restart at 0 on every mode entry.
        {
            let rx = self.source.subscribe();
            let token = cancel.clone();
            let throttle = self
                .settings
                .throttle
                .enabled
                .then(|| LatestWins::new(Duration::from_millis(self.settings.throttle.interval_ms)));
            let pose_pub = pose_pub.clone();
            let encoder = encoder.clone();
            let action_rx = self.action_tx.subscribe();
            tasks.push(tokio::spawn(dispatch_frames(
                rx, pose_pub, encoder, action_rx, throttle, token,
            )));
        }

        if let Some(encoder) = &encoder {
            // Peer arrival forces the next frame to be a sync frame so a
            // late joiner can decode immediately.
            {
                let encoder = Arc::clone(encoder);
                let mut peers = domain.peers()?;
                let token = cancel.clone();
                tasks.push(tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = token.cancelled() => break,
                            changed = peers.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                                let count = *peers.borrow_and_update();
                                log::info!("peers: {}", count);
                                encoder.force_keyframe();
                            }
                        }
                    }
                }));
            }

            // Encoder output -> video topic. Stream ids restart at 0 on
            // every mode entry; depth pairs with its video frame by id.
            if let Some(video_pub) = &video_pub {
                let video_pub = Arc::clone(video_pub);
                let mut enc_rx = encoder.subscribe();
                let token = cancel.clone();
                let published = Arc::clone(&published);
                let publish_depth = transport.publish_depth;
                tasks.push(tokio::spawn(async move {
                    let mut stream_id: u32 = 0;
                    loop {
                        let output = tokio::select! {
                            _ = token.cancelled() => break,
                            out = enc_rx.recv() => match out {
                                Ok(out) => out,
                                Err(broadcast::error::RecvError::Lagged(n)) => {
                                    log::warn!("publisher lagged, {} encoded frames skipped", n);
                                    continue;
                                }
                                Err(broadcast::error::RecvError::Closed) => break,
                            },
                        };
                        let (frame, encoded) = output;
                        let Some(encoded) = encoded else {
                            log::debug!("frame {:.3} dropped before encode", frame.timestamp);
                            continue;
                        };
                        let mut msg = PosedVideoFrame::from_encoded(stream_id, &encoded);
                        if publish_depth {
                            if let Some(depth) = &frame.depth {
                                match compress_depth(depth) {
                                    Ok(compressed) => {
                                        msg = msg.with_depth(
                                            depth.width,
                                            depth.height,
                                            depth.scale,
                                            compressed.to_vec(),
                                        );
                                    }
                                    Err(e) => log::warn!("depth compression failed: {}", e),
                                }
                            }
                        }
                        if video_pub.publish(&msg) {
                            published.fetch_add(1, Ordering::Relaxed);
                        }
                        stream_id = stream_id.wrapping_add(1);
                    }
                }));
            }
        }

        Ok(StreamState {
            domain,
            video_pub,
            pose_pub,
            encoder,
            cancel,
            tasks,
        })
    }

    fn setup_snap(&mut self) -> anyhow::Result<SnapState> {
        let transport = &self.settings.transport;
        let domain = self.create_domain()?;
        let frame_pub = if transport.snap_pose_only {
            None
        } else {
            let p = Publisher::<FrameMessage>::new(&domain, &transport.frame_topic, Qos::default())?;
            if !p.start() {
                return Err(anyhow!("could not start frame publisher"));
            }
            Some(p)
        };
        let pose_pub = Arc::new(Publisher::<PoseMessage>::new(
            &domain,
            &transport.pose_topic,
            Qos::default(),
        )?);
        if !pose_pub.start() {
            if let Some(p) = &frame_pub {
                p.stop();
            }
            return Err(anyhow!("could not start pose publisher"));
        }

        let next_id = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        // Pose-only configuration keeps the pose topic live between snaps:
        // every captured frame goes out as a pose sample.
        if transport.snap_pose_only {
            let mut rx = self.source.subscribe();
            let pose_pub = Arc::clone(&pose_pub);
            let next_id = Arc::clone(&next_id);
            let action_rx = self.action_tx.subscribe();
            let token = cancel.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    let frame = tokio::select! {
                        _ = token.cancelled() => break,
                        res = rx.recv() => match res {
                            Ok(frame) => frame,
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                log::debug!("capture backlog, {} poses skipped", n);
                                continue;
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                    };
                    let id = next_id.fetch_add(1, Ordering::Relaxed);
                    let pose = PoseMessage::from_frame(id, &frame, *action_rx.borrow());
                    pose_pub.publish(&pose);
                }
            }));
        }

        Ok(SnapState {
            domain,
            frame_pub,
            pose_pub,
            next_id,
            cancel,
            tasks,
        })
    }

    fn send_snap(&mut self) -> anyhow::Result<u32> {
        let Some(ModeState::Snap(snap)) = self.state.as_mut() else {
            return Err(anyhow!("not in snap mode"));
        };
        let frame = self
            .source
            .current_frame()
            .ok_or_else(|| anyhow!("no frame available yet"))?;
        let id = snap.next_id.fetch_add(1, Ordering::Relaxed);
        let action = *self.action_tx.borrow();
        let pose = PoseMessage::from_frame(id, &frame, action);
        if !snap.pose_pub.publish(&pose) {
            log::warn!("snap pose {} not delivered", id);
        }
        if let Some(frame_pub) = &snap.frame_pub {
            let msg = FrameMessage::from_frame(id, &frame);
            if !frame_pub.publish(&msg) {
                log::warn!("snap frame {} not delivered", id);
            }
        }
        self.snaps_sent += 1;
        log::info!("snap {} sent ({}x{})", id, frame.width, frame.height);
        Ok(id)
    }

    async fn save_frame(&mut self) -> anyhow::Result<usize> {
        let frame = match self.state.as_mut() {
            Some(ModeState::Save(_)) => self
                .source
                .current_frame()
                .ok_or_else(|| anyhow!("no frame available yet"))?,
            _ => return Err(anyhow!("not in save mode")),
        };
        let Some(ModeState::Save(save)) = self.state.as_mut() else {
            return Err(anyhow!("not in save mode"));
        };
        save.writer.save_frame(frame).await?;
        Ok(save.writer.frame_count())
    }

    fn finalize_project(&mut self, zip: bool) -> anyhow::Result<PathBuf> {
        match self.state.take() {
            Some(ModeState::Save(save)) => {
                let path = save.writer.finalize(zip)?;
                log::info!("project finalized at {}", path.display());
                Ok(path)
            }
            other => {
                self.state = other;
                Err(anyhow!("not in save mode"))
            }
        }
    }
}

/// Stream-mode frame fan-out: each admitted frame becomes one pose sample
/// and one encoder submission. A pose failure never blocks the encode.
async fn dispatch_frames(
    mut rx: broadcast::Receiver<Arc<Frame>>,
    pose_pub: Option<Arc<Publisher<PoseMessage>>>,
    encoder: Option<Arc<VideoEncoder>>,
    action_rx: watch::Receiver<f32>,
    mut throttle: Option<LatestWins<Arc<Frame>>>,
    cancel: CancellationToken,
) {
    let mut pose_id: u32 = 0;
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            res = rx.recv() => match res {
                Ok(frame) => {
                    let admitted = match throttle.as_mut() {
                        Some(t) => t.admit(frame),
                        None => Some(frame),
                    };
                    match admitted {
                        Some(frame) => frame,
                        None => continue,
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::debug!("capture backlog, {} frames skipped", n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            Some(frame) = release_pending(&mut throttle) => frame,
        };
        if let Some(pose_pub) = &pose_pub {
            let pose = PoseMessage::from_frame(pose_id, &frame, *action_rx.borrow());
            pose_pub.publish(&pose);
            pose_id = pose_id.wrapping_add(1);
        }
        if let Some(encoder) = &encoder {
            if let Err(e) = encoder.encode(&frame) {
                log::warn!("encode failed: {}", e);
            }
        }
    }
}
