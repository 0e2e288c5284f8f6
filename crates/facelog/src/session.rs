use crate::render::Renderer;
use chrono::NaiveTime;
use facelog_core::{FaceEncoder, FaceLabel, FrameMatcher, LabeledFace, Ledger, LedgerError, LedgerRecord};
use facelog_hw::{Frame, VideoSource};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("failed to persist attendance: {0}")]
    Persist(#[from] LedgerError),
    #[error("session already stopped")]
    AlreadyStopped,
}

/// Lifecycle of a capture session. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Running,
    Stopping,
    Stopped,
}

/// Why the capture loop left the running state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Cancelled,
    SourceExhausted,
    FrameLimit,
    CaptureFailed(String),
}

/// Cooperative cancellation flag shared between the capture thread and its controller.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-session knobs taken from configuration.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub attendance_path: PathBuf,
    pub downsample_factor: u32,
    pub max_frames: Option<u64>,
}

/// Summary returned once the session has stopped.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub frames: u64,
    pub stop_reason: StopReason,
    pub attendance_path: PathBuf,
    pub records: Vec<LedgerRecord>,
}

type Clock = Box<dyn FnMut() -> NaiveTime + Send>;

/// Single-threaded capture loop: frame → encode → match → ledger → render.
///
/// The ledger is written, the source released and the renderer closed on
/// every path out of [`CaptureSession::run`]. Dropping a session that never
/// reached `Stopped` still releases the source and renderer.
pub struct CaptureSession<S: VideoSource, E: FaceEncoder, R: Renderer> {
    source: S,
    encoder: E,
    renderer: R,
    matcher: FrameMatcher,
    ledger: Ledger,
    options: SessionOptions,
    stop: StopSignal,
    state: SessionState,
    frames: u64,
    clock: Clock,
}

impl<S: VideoSource, E: FaceEncoder, R: Renderer> CaptureSession<S, E, R> {
    pub fn new(
        source: S,
        encoder: E,
        renderer: R,
        matcher: FrameMatcher,
        options: SessionOptions,
        stop: StopSignal,
    ) -> Self {
        Self {
            source,
            encoder,
            renderer,
            matcher,
            ledger: Ledger::new(),
            options,
            stop,
            state: SessionState::Running,
            frames: 0,
            clock: Box::new(|| chrono::Local::now().time()),
        }
    }

    /// Replace the wall clock used for first-seen times.
    pub fn with_clock<C>(mut self, clock: C) -> Self
    where
        C: FnMut() -> NaiveTime + Send + 'static,
    {
        self.clock = Box::new(clock);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drive the loop until stopped, then flush and release everything.
    pub fn run(&mut self) -> Result<SessionReport, SessionError> {
        if self.state != SessionState::Running {
            return Err(SessionError::AlreadyStopped);
        }

        tracing::info!(
            references = self.matcher.references().len(),
            threshold = self.matcher.threshold(),
            "capture running"
        );

        let reason = loop {
            if let Some(reason) = self.step() {
                break reason;
            }
        };

        self.transition(SessionState::Stopping);
        tracing::info!(?reason, frames = self.frames, "capture stopping");

        let flushed = self.ledger.write_csv(&self.options.attendance_path);
        self.source.release();
        self.renderer.close();
        self.transition(SessionState::Stopped);
        flushed?;

        Ok(SessionReport {
            frames: self.frames,
            stop_reason: reason,
            attendance_path: self.options.attendance_path.clone(),
            records: self.ledger.snapshot(),
        })
    }

    fn transition(&mut self, next: SessionState) {
        tracing::debug!(from = ?self.state, to = ?next, "session state");
        self.state = next;
    }

    /// One loop iteration. Returns the reason to stop, if any.
    fn step(&mut self) -> Option<StopReason> {
        if self.stop.is_triggered() {
            return Some(StopReason::Cancelled);
        }
        if self.options.max_frames.is_some_and(|max| self.frames >= max) {
            return Some(StopReason::FrameLimit);
        }

        let frame = match self.source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => return Some(StopReason::SourceExhausted),
            Err(e) => {
                tracing::error!(error = %e, "frame capture failed");
                return Some(StopReason::CaptureFailed(e.to_string()));
            }
        };
        self.frames += 1;

        let faces = self.process(&frame);
        if let Err(e) = self.renderer.render(&frame, &faces) {
            tracing::warn!(error = %e, "render failed");
        }
        None
    }

    /// Detect, match and record the faces of one frame.
    ///
    /// Returned regions are in full-resolution frame coordinates.
    fn process(&mut self, frame: &Frame) -> Vec<LabeledFace> {
        if frame.is_dark {
            tracing::trace!(seq = frame.sequence, "dark frame; skipping detection");
            return Vec::new();
        }

        let factor = self.options.downsample_factor.max(1);
        let small = frame.downsample(factor);
        if small.width == 0 || small.height == 0 {
            return Vec::new();
        }

        let detected = match self.encoder.encode(&small.data, small.width, small.height) {
            Ok(faces) => faces,
            Err(e) => {
                tracing::warn!(error = %e, seq = frame.sequence, "face encoding failed");
                return Vec::new();
            }
        };

        let mut labeled = self.matcher.match_faces(&detected);
        for face in &mut labeled {
            face.region = face.region.scaled(factor as f32);
        }

        if labeled.iter().any(|f| f.label.is_known()) {
            let now = (self.clock)();
            for face in &labeled {
                if let FaceLabel::Known(label) = &face.label {
                    if self.ledger.record_if_new(label, now) {
                        tracing::info!(
                            label = %label,
                            time = %now.format(facelog_core::ledger::TIME_FORMAT),
                            distance = ?face.distance,
                            "first sighting recorded"
                        );
                    }
                }
            }
        }

        labeled
    }
}

impl<S: VideoSource, E: FaceEncoder, R: Renderer> Drop for CaptureSession<S, E, R> {
    fn drop(&mut self) {
        if self.state != SessionState::Stopped {
            tracing::warn!(state = ?self.state, "session dropped before stopping; releasing source");
            self.source.release();
            self.renderer.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::RenderError;
    use facelog_core::{
        BoundingBox, DetectedFace, Embedding, EncoderError, Metric, ReferenceEntry, ReferenceSet,
    };
    use facelog_hw::CameraError;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Scripted frames; records whether it was released.
    struct ScriptedSource {
        frames: VecDeque<Result<Frame, CameraError>>,
        released: Arc<AtomicBool>,
        stop_after: Option<(usize, StopSignal)>,
        served: usize,
    }

    impl ScriptedSource {
        fn new(frames: Vec<Result<Frame, CameraError>>) -> (Self, Arc<AtomicBool>) {
            let released = Arc::new(AtomicBool::new(false));
            let source = Self {
                frames: frames.into(),
                released: released.clone(),
                stop_after: None,
                served: 0,
            };
            (source, released)
        }
    }

    impl VideoSource for ScriptedSource {
        fn next_frame(&mut self) -> Result<Option<Frame>, CameraError> {
            if let Some((n, signal)) = &self.stop_after {
                if self.served >= *n {
                    signal.trigger();
                }
            }
            self.served += 1;
            self.frames.pop_front().transpose()
        }

        fn release(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    /// Picks faces by the first pixel of the (downsampled) frame:
    /// 40 alice, 41 bob, 42 stranger, 43 bob then alice, 44 encoder error.
    /// Records every frame size it was called with.
    struct PixelEncoder {
        sizes: Arc<Mutex<Vec<(u32, u32)>>>,
    }

    fn region() -> BoundingBox {
        BoundingBox {
            x: 1.0,
            y: 2.0,
            width: 3.0,
            height: 4.0,
            confidence: 0.99,
            landmarks: None,
        }
    }

    fn detected(values: &[f32]) -> DetectedFace {
        DetectedFace {
            region: region(),
            embedding: Some(Embedding::new(values.to_vec())),
        }
    }

    impl FaceEncoder for PixelEncoder {
        fn encode(
            &mut self,
            pixels: &[u8],
            width: u32,
            height: u32,
        ) -> Result<Vec<DetectedFace>, EncoderError> {
            self.sizes.lock().unwrap().push((width, height));
            Ok(match pixels[0] {
                40 => vec![detected(&[1.0, 0.0])],
                41 => vec![detected(&[0.0, 1.0])],
                42 => vec![detected(&[0.5, 0.5])],
                43 => vec![detected(&[0.0, 1.0]), detected(&[0.98, 0.0])],
                44 => {
                    return Err(EncoderError::InvalidFrame {
                        width,
                        height,
                        expected: 0,
                        actual: 0,
                    })
                }
                _ => vec![],
            })
        }
    }

    #[derive(Default)]
    struct RecordingRenderer {
        rendered: Arc<Mutex<Vec<Vec<LabeledFace>>>>,
        closed: Arc<AtomicBool>,
    }

    impl Renderer for RecordingRenderer {
        fn render(&mut self, _frame: &Frame, faces: &[LabeledFace]) -> Result<(), RenderError> {
            self.rendered.lock().unwrap().push(faces.to_vec());
            Ok(())
        }

        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// 8x8 frame whose pixels all carry `code` (bright enough not to be dark).
    fn frame(code: u8) -> Result<Frame, CameraError> {
        Ok(Frame::from_gray(vec![code; 64], 8, 8, 0))
    }

    fn matcher() -> FrameMatcher {
        let refs = ReferenceSet::new(vec![
            ReferenceEntry {
                label: "alice".into(),
                embedding: Embedding::new(vec![1.0, 0.0]),
            },
            ReferenceEntry {
                label: "bob".into(),
                embedding: Embedding::new(vec![0.0, 1.0]),
            },
        ]);
        FrameMatcher::new(refs, Metric::Euclidean, 0.5)
    }

    fn ticking_clock() -> impl FnMut() -> NaiveTime + Send + 'static {
        let mut secs = 0;
        move || {
            secs += 1;
            NaiveTime::from_hms_opt(9, 0, secs).unwrap()
        }
    }

    struct Harness {
        session: CaptureSession<ScriptedSource, PixelEncoder, RecordingRenderer>,
        released: Arc<AtomicBool>,
        closed: Arc<AtomicBool>,
        rendered: Arc<Mutex<Vec<Vec<LabeledFace>>>>,
        sizes: Arc<Mutex<Vec<(u32, u32)>>>,
        csv: PathBuf,
        _dir: tempfile::TempDir,
    }

    fn harness(frames: Vec<Result<Frame, CameraError>>, factor: u32, max: Option<u64>) -> Harness {
        harness_with_source(ScriptedSource::new(frames), factor, max, StopSignal::new())
    }

    fn harness_with_source(
        (source, released): (ScriptedSource, Arc<AtomicBool>),
        factor: u32,
        max: Option<u64>,
        stop: StopSignal,
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let csv = dir.path().join("attendance.csv");
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let renderer = RecordingRenderer::default();
        let rendered = renderer.rendered.clone();
        let closed = renderer.closed.clone();

        let session = CaptureSession::new(
            source,
            PixelEncoder {
                sizes: sizes.clone(),
            },
            renderer,
            matcher(),
            SessionOptions {
                attendance_path: csv.clone(),
                downsample_factor: factor,
                max_frames: max,
            },
            stop,
        )
        .with_clock(ticking_clock());

        Harness {
            session,
            released,
            closed,
            rendered,
            sizes,
            csv,
            _dir: dir,
        }
    }

    #[test]
    fn test_records_first_sighting_once() {
        let mut h = harness(vec![frame(40), frame(40), frame(41), frame(40)], 1, None);
        let report = h.session.run().unwrap();

        assert_eq!(report.frames, 4);
        assert_eq!(report.stop_reason, StopReason::SourceExhausted);
        let labels: Vec<_> = report.records.iter().map(|r| r.label.as_str()).collect();
        assert_eq!(labels, ["alice", "bob"]);
        // clock ticks once per frame with a known face
        assert_eq!(report.records[0].time, NaiveTime::from_hms_opt(9, 0, 1).unwrap());
        assert_eq!(report.records[1].time, NaiveTime::from_hms_opt(9, 0, 3).unwrap());

        assert_eq!(
            std::fs::read_to_string(&h.csv).unwrap(),
            "Name,Time\nalice,09:00:01\nbob,09:00:03\n"
        );
        assert_eq!(h.session.state(), SessionState::Stopped);
        assert!(h.released.load(Ordering::SeqCst));
        assert!(h.closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_unknown_faces_not_recorded() {
        let mut h = harness(vec![frame(42), frame(42)], 1, None);
        let report = h.session.run().unwrap();
        assert!(report.records.is_empty());

        let rendered = h.rendered.lock().unwrap();
        assert_eq!(rendered.len(), 2);
        assert_eq!(rendered[0][0].label, FaceLabel::Unknown);
        assert_eq!(std::fs::read_to_string(&h.csv).unwrap(), "Name,Time\n");
    }

    #[test]
    fn test_two_faces_in_one_frame() {
        let mut h = harness(vec![frame(43)], 1, None);
        let report = h.session.run().unwrap();
        let labels: Vec<_> = report.records.iter().map(|r| r.label.as_str()).collect();
        assert_eq!(labels, ["bob", "alice"]);
        assert_eq!(report.records[0].time, report.records[1].time);
    }

    #[test]
    fn test_downsample_and_rescale() {
        let mut h = harness(vec![frame(40)], 4, None);
        h.session.run().unwrap();

        assert_eq!(*h.sizes.lock().unwrap(), vec![(2, 2)]);
        let rendered = h.rendered.lock().unwrap();
        let r = &rendered[0][0].region;
        assert_eq!((r.x, r.y, r.width, r.height), (4.0, 8.0, 12.0, 16.0));
    }

    #[test]
    fn test_dark_frames_skip_detection() {
        let mut h = harness(vec![frame(1), frame(40)], 1, None);
        let report = h.session.run().unwrap();
        assert_eq!(report.frames, 2);
        assert_eq!(h.sizes.lock().unwrap().len(), 1);
        assert_eq!(h.rendered.lock().unwrap()[0].len(), 0);
    }

    #[test]
    fn test_encoder_error_does_not_stop_loop() {
        let mut h = harness(vec![frame(44), frame(41)], 1, None);
        let report = h.session.run().unwrap();
        assert_eq!(report.frames, 2);
        assert_eq!(report.records.len(), 1);
    }

    #[test]
    fn test_capture_failure_still_flushes() {
        let mut h = harness(
            vec![
                frame(40),
                Err(CameraError::CaptureFailed("unplugged".into())),
                frame(41),
            ],
            1,
            None,
        );
        let report = h.session.run().unwrap();
        assert!(matches!(report.stop_reason, StopReason::CaptureFailed(ref m) if m.contains("unplugged")));
        assert_eq!(report.frames, 1);
        assert_eq!(
            std::fs::read_to_string(&h.csv).unwrap(),
            "Name,Time\nalice,09:00:01\n"
        );
        assert!(h.released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_cancellation_stops_and_flushes() {
        let stop = StopSignal::new();
        let (mut source, released) = ScriptedSource::new((0..10).map(|_| frame(40)).collect());
        source.stop_after = Some((2, stop.clone()));

        let mut h = harness_with_source((source, released), 1, None, stop);
        let report = h.session.run().unwrap();

        // the third pull triggers the signal but still yields a frame
        assert_eq!(report.frames, 3);
        assert_eq!(report.stop_reason, StopReason::Cancelled);
        assert!(h.csv.exists());
        assert!(h.released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_triggered_before_start() {
        let stop = StopSignal::new();
        stop.trigger();
        let mut h = harness_with_source(ScriptedSource::new(vec![frame(40)]), 1, None, stop);
        let report = h.session.run().unwrap();
        assert_eq!(report.frames, 0);
        assert_eq!(report.stop_reason, StopReason::Cancelled);
    }

    #[test]
    fn test_frame_limit() {
        let mut h = harness((0..5).map(|_| frame(42)).collect(), 1, Some(2));
        let report = h.session.run().unwrap();
        assert_eq!(report.frames, 2);
        assert_eq!(report.stop_reason, StopReason::FrameLimit);
    }

    #[test]
    fn test_run_twice_is_error() {
        let mut h = harness(vec![], 1, None);
        h.session.run().unwrap();
        assert!(matches!(h.session.run(), Err(SessionError::AlreadyStopped)));
    }

    #[test]
    fn test_persist_failure_still_releases() {
        let mut h = harness(vec![frame(40)], 1, None);
        h.session.options.attendance_path = h.csv.join("not-a-dir").join("out.csv");
        assert!(matches!(h.session.run(), Err(SessionError::Persist(_))));
        assert_eq!(h.session.state(), SessionState::Stopped);
        assert!(h.released.load(Ordering::SeqCst));
        assert!(h.closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_drop_without_run_releases() {
        let h = harness(vec![frame(40)], 1, None);
        let released = h.released.clone();
        drop(h);
        assert!(released.load(Ordering::SeqCst));
    }
}
