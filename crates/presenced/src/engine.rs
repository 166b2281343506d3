//! Per-stream pipeline driver.
//!
//! Every video stream gets its own OS thread that leases the camera and
//! detector, then loops: read frame, detect, advance the liveness
//! challenge, maybe record attendance, publish metrics, annotate, encode
//! and hand the JPEG to the HTTP body through a bounded channel. The loop
//! stops on end of stream, device or detector failure, client disconnect
//! or cancellation, and the camera is released exactly once on every path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Local;
use presence_core::{FaceDetector, FrameRenderer, LivenessPolicy, LivenessSession, Stage, Status};
use presence_hw::{AcquirePolicy, CameraOpener, ExclusivePool, FrameSource, PoolError};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::attendance::{AttendanceGate, AttendanceLedger};
use crate::metrics::{MetricsBoard, MetricsSnapshot, SessionId};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to spawn stream thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Camera and detector, leased together for the length of one stream.
pub struct Rig {
    pub camera: Box<dyn CameraOpener>,
    pub detector: Box<dyn FaceDetector>,
}

#[derive(Debug, Clone, Copy)]
pub struct DriverSettings {
    pub liveness: LivenessPolicy,
    pub acquire: AcquirePolicy,
    /// Encoded frames buffered ahead of a slow client.
    pub buffer_frames: usize,
}

/// Why a stream stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    CameraBusy,
    OpenFailed,
    EndOfStream,
    DeviceFailed,
    DetectorFailed,
    ClientGone,
    Cancelled,
}

impl StreamEnd {
    fn status(self) -> Status {
        match self {
            StreamEnd::CameraBusy => Status::CameraBusy,
            StreamEnd::OpenFailed | StreamEnd::DeviceFailed => Status::CameraUnavailable,
            StreamEnd::EndOfStream => Status::StreamEnded,
            StreamEnd::DetectorFailed => Status::DetectorFailed,
            StreamEnd::ClientGone | StreamEnd::Cancelled => Status::Disconnected,
        }
    }
}

/// Clone-safe handle that starts streams.
#[derive(Clone)]
pub struct StreamDriver {
    rig: Arc<ExclusivePool<Rig>>,
    renderer: Arc<FrameRenderer>,
    metrics: Arc<MetricsBoard>,
    ledger: Arc<dyn AttendanceLedger>,
    settings: DriverSettings,
}

impl StreamDriver {
    pub fn new(
        rig: Rig,
        renderer: FrameRenderer,
        metrics: Arc<MetricsBoard>,
        ledger: Arc<dyn AttendanceLedger>,
        settings: DriverSettings,
    ) -> Self {
        Self {
            rig: ExclusivePool::new(rig),
            renderer: Arc::new(renderer),
            metrics,
            ledger,
            settings,
        }
    }

    /// True when no stream currently holds the camera.
    pub fn camera_idle(&self) -> bool {
        self.rig.is_available()
    }

    /// Start a stream for `user` on a dedicated thread.
    ///
    /// The returned [`FrameStream`] yields encoded JPEG frames; dropping it
    /// stops the driver.
    pub fn start(&self, user: &str) -> Result<FrameStream, EngineError> {
        let session = SessionId::new_v4();
        let cancel = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel(self.settings.buffer_frames.max(1));

        self.metrics.begin_session(user, session);

        let ctx = StreamContext {
            driver: self.clone(),
            user: user.to_string(),
            session,
            cancel: Arc::clone(&cancel),
            tx,
        };
        std::thread::Builder::new()
            .name("presence-stream".into())
            .spawn(move || {
                let end = ctx.run();
                tracing::info!(user = %ctx.user, session = %ctx.session, ?end, "stream finished");
            })?;

        tracing::info!(user, %session, "stream started");
        Ok(FrameStream {
            session,
            rx,
            cancel,
        })
    }
}

/// Receiving end of a stream. Dropping it cancels the driver.
pub struct FrameStream {
    session: SessionId,
    rx: mpsc::Receiver<Vec<u8>>,
    cancel: Arc<AtomicBool>,
}

impl FrameStream {
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Next encoded frame, or `None` once the driver has stopped.
    pub async fn next(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    #[cfg(test)]
    pub fn blocking_next(&mut self) -> Option<Vec<u8>> {
        self.rx.blocking_recv()
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }
}

impl Drop for FrameStream {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Releases the source on drop unless released explicitly first.
struct SourceGuard {
    source: Box<dyn FrameSource>,
    released: bool,
}

impl SourceGuard {
    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.source.release();
        }
    }
}

impl Drop for SourceGuard {
    fn drop(&mut self) {
        self.release();
    }
}

struct StreamContext {
    driver: StreamDriver,
    user: String,
    session: SessionId,
    cancel: Arc<AtomicBool>,
    tx: mpsc::Sender<Vec<u8>>,
}

impl StreamContext {
    fn run(&self) -> StreamEnd {
        let driver = &self.driver;

        let mut lease = match driver.rig.acquire_unless(driver.settings.acquire, &self.cancel) {
            Ok(lease) => lease,
            Err(PoolError::Cancelled) => {
                tracing::debug!(user = %self.user, "client left while waiting for the camera");
                self.finish(StreamEnd::Cancelled, Stage::Searching);
                return StreamEnd::Cancelled;
            }
            Err(e) => {
                tracing::warn!(user = %self.user, error = %e, "camera busy");
                self.finish(StreamEnd::CameraBusy, Stage::Searching);
                return StreamEnd::CameraBusy;
            }
        };
        if self.cancel.load(Ordering::Relaxed) {
            drop(lease);
            self.finish(StreamEnd::Cancelled, Stage::Searching);
            return StreamEnd::Cancelled;
        }
        let rig = &mut *lease;

        let mut source = match rig.camera.open() {
            Ok(source) => SourceGuard {
                source,
                released: false,
            },
            Err(e) => {
                tracing::error!(device = rig.camera.device(), error = %e, "failed to open camera");
                self.finish(StreamEnd::OpenFailed, Stage::Searching);
                return StreamEnd::OpenFailed;
            }
        };

        let mut gate = AttendanceGate::begin(
            Arc::clone(&driver.ledger),
            &self.user,
            Local::now().date_naive(),
        );
        if gate.already_recorded() {
            driver.metrics.publish(
                self.session,
                MetricsSnapshot::new(0, &Status::AlreadyRecorded, Stage::Searching),
            );
        }
        let mut liveness = LivenessSession::new(driver.settings.liveness, gate.already_recorded());
        let detector = &mut rig.detector;

        let end = loop {
            if self.cancel.load(Ordering::Relaxed) {
                break StreamEnd::Cancelled;
            }

            let frame = match source.source.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break StreamEnd::EndOfStream,
                Err(e) => {
                    tracing::error!(error = %e, "camera read failed");
                    break StreamEnd::DeviceFailed;
                }
            };

            let faces = match detector.detect(&frame) {
                Ok(faces) => faces,
                Err(e) => {
                    tracing::error!(detector = detector.name(), error = %e, "face detection failed");
                    break StreamEnd::DetectorFailed;
                }
            };

            let mut step = liveness.advance(&faces);
            if step.request_attendance {
                gate.record(Local::now());
            }
            if step.stage == Stage::Confirmed && gate.save_failed() {
                step.status = Status::SaveFailed;
            }

            driver
                .metrics
                .publish(self.session, MetricsSnapshot::from_step(&step));

            let label = step.status.to_string();
            let jpeg = driver
                .renderer
                .render(frame, step.face.as_ref(), &label, step.status.color())
                .and_then(|annotated| driver.renderer.encode(&annotated));
            let jpeg = match jpeg {
                Ok(jpeg) => jpeg,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to render frame, skipping");
                    continue;
                }
            };

            if self.tx.blocking_send(jpeg).is_err() {
                break StreamEnd::ClientGone;
            }
        };

        source.release();
        drop(lease);
        self.finish(end, liveness.stage());
        end
    }

    fn finish(&self, end: StreamEnd, stage: Stage) {
        self.driver
            .metrics
            .publish(self.session, MetricsSnapshot::new(0, &end.status(), stage));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attendance::testing::MemoryLedger;
    use presence_core::{BoundingBox, DetectorError, Frame};
    use presence_hw::CameraError;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    const WIDTH: u32 = 160;
    const HEIGHT: u32 = 120;

    /// What the scripted source does once its frames run out.
    #[derive(Clone, Copy)]
    enum Tail {
        End,
        Fail,
        Repeat,
    }

    #[derive(Default)]
    struct Counters {
        opened: AtomicUsize,
        released: AtomicUsize,
    }

    struct ScriptedCamera {
        faces: Vec<Option<(u32, u32)>>,
        tail: Tail,
        counters: Arc<Counters>,
    }

    impl CameraOpener for ScriptedCamera {
        fn device(&self) -> &str {
            "scripted"
        }

        fn open(&self) -> Result<Box<dyn FrameSource>, CameraError> {
            self.counters.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ScriptedSource {
                faces: self.faces.clone(),
                tail: self.tail,
                pos: 0,
                counters: Arc::clone(&self.counters),
            }))
        }
    }

    struct ScriptedSource {
        faces: Vec<Option<(u32, u32)>>,
        tail: Tail,
        pos: usize,
        counters: Arc<Counters>,
    }

    impl FrameSource for ScriptedSource {
        fn device(&self) -> &str {
            "scripted"
        }

        fn next_frame(&mut self) -> Result<Option<Frame>, CameraError> {
            let face = match self.faces.get(self.pos) {
                Some(face) => *face,
                None => match self.tail {
                    Tail::End => return Ok(None),
                    Tail::Fail => return Err(CameraError::unavailable("scripted", "unplugged")),
                    Tail::Repeat => self.faces.last().copied().flatten(),
                },
            };
            self.pos += 1;
            Ok(Some(frame_with_face(face)))
        }

        fn release(&mut self) {
            self.counters.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FailingCamera;

    impl CameraOpener for FailingCamera {
        fn device(&self) -> &str {
            "missing"
        }

        fn open(&self) -> Result<Box<dyn FrameSource>, CameraError> {
            Err(CameraError::unavailable("missing", "no such device"))
        }
    }

    /// Reports the bright square drawn by `frame_with_face`.
    struct SquareDetector {
        fail_after: Option<usize>,
        calls: usize,
    }

    impl FaceDetector for SquareDetector {
        fn name(&self) -> &'static str {
            "square"
        }

        fn detect(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, DetectorError> {
            self.calls += 1;
            if self.fail_after.is_some_and(|n| self.calls > n) {
                return Err(DetectorError::Inference("scripted".into()));
            }
            let width = frame.width as usize;
            let first = frame.data.chunks_exact(3).position(|px| px[0] == 255);
            Ok(first
                .map(|i| BoundingBox {
                    x: (i % width) as i32,
                    y: (i / width) as i32,
                    width: 20,
                    height: 20,
                    confidence: 1.0,
                })
                .into_iter()
                .collect())
        }
    }

    fn frame_with_face(face: Option<(u32, u32)>) -> Frame {
        let mut frame = Frame::filled(WIDTH, HEIGHT, [0, 0, 0]);
        if let Some((x0, y0)) = face {
            for y in y0..y0 + 20 {
                for x in x0..x0 + 20 {
                    let i = ((y * WIDTH + x) * 3) as usize;
                    frame.data[i..i + 3].copy_from_slice(&[255, 255, 255]);
                }
            }
        }
        frame
    }

    /// Empty, face, moved face, then `still` frames holding still.
    fn live_script(still: usize) -> Vec<Option<(u32, u32)>> {
        let mut script = vec![None, Some((20, 20)), Some((60, 20))];
        script.extend(std::iter::repeat(Some((60, 20))).take(still));
        script
    }

    fn policy(still_frames_required: u32) -> DriverSettings {
        DriverSettings {
            liveness: LivenessPolicy {
                still_frames_required,
                ..LivenessPolicy::default()
            },
            acquire: AcquirePolicy::FailFast,
            buffer_frames: 2,
        }
    }

    struct Harness {
        driver: StreamDriver,
        metrics: Arc<MetricsBoard>,
        ledger: Arc<MemoryLedger>,
        counters: Arc<Counters>,
    }

    fn harness(
        script: Vec<Option<(u32, u32)>>,
        tail: Tail,
        ledger: MemoryLedger,
        settings: DriverSettings,
    ) -> Harness {
        let counters = Arc::new(Counters::default());
        let metrics = Arc::new(MetricsBoard::new());
        let ledger = Arc::new(ledger);
        let rig = Rig {
            camera: Box::new(ScriptedCamera {
                faces: script,
                tail,
                counters: Arc::clone(&counters),
            }),
            detector: Box::new(SquareDetector {
                fail_after: None,
                calls: 0,
            }),
        };
        let driver = StreamDriver::new(
            rig,
            FrameRenderer::default(),
            Arc::clone(&metrics),
            ledger.clone(),
            settings,
        );
        Harness {
            driver,
            metrics,
            ledger,
            counters,
        }
    }

    fn drain(stream: &mut FrameStream) -> usize {
        let mut frames = 0;
        while let Some(jpeg) = stream.blocking_next() {
            assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
            frames += 1;
        }
        frames
    }

    fn wait_until(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_live_stream_records_once_and_releases() {
        let h = harness(live_script(10), Tail::End, MemoryLedger::default(), policy(5));
        let mut stream = h.driver.start("alice").unwrap();
        let session = stream.session();

        assert_eq!(drain(&mut stream), 13);
        wait_until("camera release", || h.driver.camera_idle());

        assert_eq!(h.ledger.create_calls(), 1);
        assert_eq!(h.ledger.record_count(), 1);
        assert_eq!(h.counters.opened.load(Ordering::SeqCst), 1);
        assert_eq!(h.counters.released.load(Ordering::SeqCst), 1);

        let snap = h.metrics.read(session);
        assert_eq!(snap.liveness_step, 4);
        assert_eq!(snap.status, "Stream ended");
    }

    #[test]
    fn test_static_face_never_records() {
        let script = vec![Some((20, 20)); 40];
        let h = harness(script, Tail::End, MemoryLedger::default(), policy(5));
        let mut stream = h.driver.start("alice").unwrap();
        let session = stream.session();

        drain(&mut stream);
        wait_until("camera release", || h.driver.camera_idle());
        assert_eq!(h.ledger.create_calls(), 0);
        assert_eq!(h.metrics.read(session).liveness_step, 2);
    }

    #[test]
    fn test_already_recorded_skips_challenge() {
        let ledger = MemoryLedger::with_record("alice", Local::now().date_naive());
        let h = harness(vec![None, Some((20, 20)), Some((20, 20))], Tail::Repeat, ledger, policy(5));
        let mut stream = h.driver.start("alice").unwrap();

        for _ in 0..3 {
            stream.blocking_next().unwrap();
        }
        let snap = h.metrics.read_for_user("alice");
        assert_eq!(snap.liveness_step, 4);
        assert_eq!(snap.status, "Attendance already recorded today");
        assert_eq!(snap.face_count, 1);

        drop(stream);
        wait_until("camera release", || h.driver.camera_idle());
        assert_eq!(h.ledger.create_calls(), 0);
        assert_eq!(h.counters.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_save_failure_stays_confirmed() {
        let h = harness(live_script(10), Tail::End, MemoryLedger::failing(), policy(5));
        let mut stream = h.driver.start("alice").unwrap();

        // Stop reading right after confirmation so the failure status is visible
        for _ in 0..9 {
            stream.blocking_next().unwrap();
        }
        let snap = h.metrics.read_for_user("alice");
        assert_eq!(snap.liveness_step, 4);
        assert_eq!(snap.status, "Attendance confirmed, but saving failed");

        drain(&mut stream);
        wait_until("camera release", || h.driver.camera_idle());
        assert_eq!(h.ledger.create_calls(), 1);
        assert_eq!(h.ledger.record_count(), 0);
    }

    #[test]
    fn test_cancel_releases_camera_once() {
        let h = harness(vec![Some((20, 20))], Tail::Repeat, MemoryLedger::default(), policy(5));
        let mut stream = h.driver.start("alice").unwrap();
        let session = stream.session();

        for _ in 0..3 {
            stream.blocking_next().unwrap();
        }
        drop(stream);

        wait_until("camera release", || {
            h.counters.released.load(Ordering::SeqCst) == 1 && h.driver.camera_idle()
        });
        wait_until("final status", || {
            h.metrics.read(session).status == "Camera disconnected"
        });
        assert_eq!(h.counters.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_device_failure_ends_stream() {
        let h = harness(vec![None, None], Tail::Fail, MemoryLedger::default(), policy(5));
        let mut stream = h.driver.start("alice").unwrap();
        let session = stream.session();

        assert_eq!(drain(&mut stream), 2);
        wait_until("camera release", || h.driver.camera_idle());
        assert_eq!(h.counters.released.load(Ordering::SeqCst), 1);
        assert_eq!(h.metrics.read(session).status, "Error: camera unavailable");
    }

    #[test]
    fn test_detector_failure_ends_stream() {
        let counters = Arc::new(Counters::default());
        let metrics = Arc::new(MetricsBoard::new());
        let rig = Rig {
            camera: Box::new(ScriptedCamera {
                faces: vec![Some((20, 20))],
                tail: Tail::Repeat,
                counters: Arc::clone(&counters),
            }),
            detector: Box::new(SquareDetector {
                fail_after: Some(2),
                calls: 0,
            }),
        };
        let driver = StreamDriver::new(
            rig,
            FrameRenderer::default(),
            Arc::clone(&metrics),
            Arc::new(MemoryLedger::default()),
            policy(5),
        );

        let mut stream = driver.start("alice").unwrap();
        let session = stream.session();
        assert_eq!(drain(&mut stream), 2);
        wait_until("camera release", || driver.camera_idle());
        assert_eq!(counters.released.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.read(session).status, "Error: face detection failed");
    }

    #[test]
    fn test_open_failure_reports_unavailable() {
        let metrics = Arc::new(MetricsBoard::new());
        let driver = StreamDriver::new(
            Rig {
                camera: Box::new(FailingCamera),
                detector: Box::new(SquareDetector {
                    fail_after: None,
                    calls: 0,
                }),
            },
            FrameRenderer::default(),
            Arc::clone(&metrics),
            Arc::new(MemoryLedger::default()),
            policy(5),
        );

        let mut stream = driver.start("alice").unwrap();
        assert!(stream.blocking_next().is_none());
        assert_eq!(
            metrics.read(stream.session()).status,
            "Error: camera unavailable"
        );
        wait_until("lease returned", || driver.camera_idle());
    }

    #[test]
    fn test_second_stream_is_busy_under_fail_fast() {
        let h = harness(vec![Some((20, 20))], Tail::Repeat, MemoryLedger::default(), policy(5));
        let mut first = h.driver.start("alice").unwrap();
        first.blocking_next().unwrap();

        let mut second = h.driver.start("bob").unwrap();
        assert!(second.blocking_next().is_none());
        assert_eq!(
            h.metrics.read(second.session()).status,
            "Camera busy, try again later"
        );
        assert_eq!(h.counters.opened.load(Ordering::SeqCst), 1);

        drop(first);
        wait_until("camera release", || h.driver.camera_idle());
    }

    #[test]
    fn test_waiter_that_leaves_never_opens_camera() {
        let mut settings = policy(5);
        settings.acquire = AcquirePolicy::Block;
        let h = harness(vec![Some((20, 20))], Tail::Repeat, MemoryLedger::default(), settings);
        let mut first = h.driver.start("alice").unwrap();
        first.blocking_next().unwrap();

        let second = h.driver.start("bob").unwrap();
        let waiting = second.session();
        std::thread::sleep(Duration::from_millis(100));
        drop(second);
        wait_until("waiter gives up", || {
            h.metrics.read(waiting).status == "Camera disconnected"
        });

        drop(first);
        wait_until("camera release", || {
            h.counters.released.load(Ordering::SeqCst) == 1 && h.driver.camera_idle()
        });
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(h.counters.opened.load(Ordering::SeqCst), 1);
        assert_eq!(h.counters.released.load(Ordering::SeqCst), 1);
    }
}
