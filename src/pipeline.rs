//! Pipeline state machine.
//!
//! `PipelineController` owns the stream, the buffer pool, the reference
//! frame and the flow engine, and drives them through a fixed lifecycle:
//!
//! ```text
//! Uninitialized -> Acquiring -> Streaming <-> Reconfiguring
//!                                   |
//!                                 Stopped
//! ```
//!
//! A reconfiguration halts processing and releases every
//! resolution-dependent resource before the replacement stream is
//! negotiated; buffers are reallocated only once the new stream reports
//! its actual resolution. Every teardown bumps a generation counter, and
//! negotiation results carrying a stale generation are discarded without
//! touching pipeline state.

use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;

use anyhow::Result;

use crate::buffer::{convert_to_grayscale, BufferPool};
use crate::config::Tunables;
use crate::export::{FlowFieldExporter, WorkbookWriter};
use crate::flow::{FlowEngine, FlowParams};
use crate::reference::{CaptureMode, ReferenceCheck, ReferenceFrameManager};
use crate::render::{render, DrawSurface};
use crate::source::{negotiate, FrameSource, FrameStream};
use crate::{PipelineError, Resolution};

/// Lifecycle states of the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Uninitialized,
    Acquiring,
    Streaming,
    Reconfiguring,
    Stopped,
}

/// What one frame step did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepReport {
    /// Not streaming; nothing was read or drawn.
    Idle,
    /// Frame drawn without an overlay.
    PassThrough { reference_invalidated: bool },
    /// Frame drawn with a freshly computed flow overlay.
    Flow,
    /// The stream changed resolution mid-flight; buffers were rebuilt and
    /// the frame drawn pass-through.
    Rebuilt,
}

/// Outcome of applying a negotiation result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyResult {
    Applied,
    /// The result belonged to a superseded generation and was discarded.
    Stale,
}

/// The outcome of one asynchronous negotiation, tagged with the
/// generation it was started under.
pub struct NegotiationResult {
    generation: u64,
    outcome: Result<Box<dyn FrameStream>>,
}

impl NegotiationResult {
    pub fn new(generation: u64, outcome: Result<Box<dyn FrameStream>>) -> Self {
        NegotiationResult {
            generation,
            outcome,
        }
    }
}

pub struct PipelineController {
    source: Arc<dyn FrameSource>,
    stream: Option<Box<dyn FrameStream>>,
    state: PipelineState,
    /// Bumped on every teardown; results tagged with an older value are
    /// stale.
    generation: u64,
    pool: BufferPool,
    reference: ReferenceFrameManager,
    engine: FlowEngine,
    /// A flow field for the current stream exists and may be exported.
    flow_available: bool,
    device_id: String,
    target_fps: u32,
    pending: Option<Receiver<NegotiationResult>>,
}

impl PipelineController {
    pub fn new(source: Arc<dyn FrameSource>, engine: FlowEngine) -> Self {
        PipelineController {
            source,
            stream: None,
            state: PipelineState::Uninitialized,
            generation: 0,
            pool: BufferPool::new(),
            reference: ReferenceFrameManager::new(),
            engine,
            flow_available: false,
            device_id: String::new(),
            target_fps: 30,
            pending: None,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn flow_available(&self) -> bool {
        self.flow_available
    }

    pub fn reference(&self) -> &ReferenceFrameManager {
        &self.reference
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Negotiated stream resolution, when streaming.
    pub fn resolution(&self) -> Option<Resolution> {
        self.stream.as_ref().map(|s| s.resolution())
    }

    /// Acquire the initial stream and enter `Streaming`.
    ///
    /// A permission refusal leaves the pipeline `Uninitialized` so a later
    /// start can be attempted; any other failure is surfaced unchanged.
    pub fn start(&mut self, device_id: &str, resolution: Resolution, target_fps: u32) -> Result<()> {
        self.state = PipelineState::Acquiring;
        self.device_id = device_id.to_string();
        self.target_fps = target_fps;

        match negotiate(self.source.as_ref(), device_id, resolution, target_fps) {
            Ok(stream) => {
                let actual = stream.resolution();
                if actual != resolution {
                    log::info!("negotiated {} instead of requested {}", actual, resolution);
                }
                self.pool.resize(actual);
                self.stream = Some(stream);
                self.state = PipelineState::Streaming;
                log::info!("streaming from {} at {}", device_id, actual);
                Ok(())
            }
            Err(err) => {
                self.state = PipelineState::Uninitialized;
                Err(err)
            }
        }
    }

    /// Halt processing ahead of a renegotiation: bump the generation, drop
    /// buffers, reference and flow. The old stream is retained so a failed
    /// renegotiation can resume it.
    pub fn begin_reconfigure(&mut self) -> u64 {
        self.generation += 1;
        self.state = PipelineState::Reconfiguring;
        self.pool.release();
        self.reference.clear();
        self.flow_available = false;
        self.generation
    }

    /// Apply the outcome of a negotiation started at `begin_reconfigure`.
    ///
    /// Results from a superseded generation, or arriving after `stop`, are
    /// discarded without touching any state. On success buffers are sized
    /// to the stream's actual resolution; a constraint failure resumes the
    /// previous stream when one is still held.
    pub fn complete_reconfigure(&mut self, result: NegotiationResult) -> Result<ApplyResult> {
        if result.generation != self.generation || self.state == PipelineState::Stopped {
            log::debug!(
                "discarding negotiation result for generation {} (current {})",
                result.generation,
                self.generation
            );
            return Ok(ApplyResult::Stale);
        }

        match result.outcome {
            Ok(stream) => {
                let actual = stream.resolution();
                self.pool.resize(actual);
                self.stream = Some(stream);
                self.state = PipelineState::Streaming;
                log::info!("reconfigured to {}", actual);
                Ok(ApplyResult::Applied)
            }
            Err(err) => match err.downcast_ref::<PipelineError>() {
                Some(PipelineError::DeviceAccessDenied { .. }) => {
                    self.stream = None;
                    self.state = PipelineState::Uninitialized;
                    Err(err)
                }
                _ => {
                    // Keep the prior stream running when we still hold one.
                    if let Some(stream) = self.stream.as_ref() {
                        let prior = stream.resolution();
                        log::warn!("reconfiguration failed ({}), resuming at {}", err, prior);
                        self.pool.resize(prior);
                        self.state = PipelineState::Streaming;
                        Ok(ApplyResult::Applied)
                    } else {
                        self.state = PipelineState::Uninitialized;
                        Err(err)
                    }
                }
            },
        }
    }

    /// Kick off a negotiation on a worker thread. The result is picked up
    /// by `poll_negotiation`; a result that outlives its generation is
    /// discarded there.
    pub fn spawn_reconfigure(&mut self, device_id: &str, resolution: Resolution) {
        let generation = self.begin_reconfigure();
        self.device_id = device_id.to_string();

        let (tx, rx) = mpsc::channel();
        let source = Arc::clone(&self.source);
        let device = device_id.to_string();
        let fps = self.target_fps;
        std::thread::spawn(move || {
            let outcome = negotiate(source.as_ref(), &device, resolution, fps);
            let _ = tx.send(NegotiationResult {
                generation,
                outcome,
            });
        });
        self.pending = Some(rx);
    }

    /// Apply a pending negotiation result if one has arrived.
    pub fn poll_negotiation(&mut self) -> Result<Option<ApplyResult>> {
        let Some(rx) = self.pending.as_ref() else {
            return Ok(None);
        };
        match rx.try_recv() {
            Ok(result) => {
                self.pending = None;
                self.complete_reconfigure(result).map(Some)
            }
            Err(mpsc::TryRecvError::Empty) => Ok(None),
            Err(mpsc::TryRecvError::Disconnected) => {
                self.pending = None;
                Ok(None)
            }
        }
    }

    /// Stop the pipeline and release everything. Late negotiation results
    /// are invalidated by the generation bump.
    pub fn stop(&mut self) {
        self.generation += 1;
        self.state = PipelineState::Stopped;
        self.stream = None;
        self.pool.release();
        self.reference.clear();
        self.flow_available = false;
        log::info!("pipeline stopped");
    }

    /// Capture the most recent grayscale frame as the motion reference.
    /// A no-op outside `Streaming`.
    pub fn capture_reference(&mut self) {
        if self.state != PipelineState::Streaming {
            return;
        }
        if let Some(buffers) = self.pool.active() {
            self.reference.capture(&buffers.gray);
            self.flow_available = false;
        }
    }

    /// Process one frame: read, convert, estimate flow against the
    /// reference when one is valid, and draw onto `surface`.
    pub fn step(&mut self, tunables: &Tunables, surface: &mut dyn DrawSurface) -> Result<StepReport> {
        if self.state != PipelineState::Streaming {
            return Ok(StepReport::Idle);
        }
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("streaming without a stream"))?;

        // A source may change its delivery size mid-flight. Rebuild the
        // buffers to the new size and render this frame pass-through.
        let actual = stream.resolution();
        let mut rebuilt = false;
        if self.pool.resolution() != Some(actual) {
            log::warn!("stream resolution changed to {}, rebuilding buffers", actual);
            self.pool.release();
            self.pool.resize(actual);
            self.flow_available = false;
            rebuilt = true;
        }

        let buffers = self
            .pool
            .active_mut()
            .ok_or_else(|| anyhow::anyhow!("buffer pool empty while streaming"))?;

        if let Err(err) = stream.read_frame(&mut buffers.frame) {
            return self.fail("capture", err);
        }
        if let Err(err) = convert_to_grayscale(&buffers.frame, &mut buffers.gray) {
            return self.fail("grayscale", err);
        }

        let check = self.reference.invalidate_if_mismatched(actual);
        if check == ReferenceCheck::Invalidated {
            self.flow_available = false;
        }

        let mut computed = false;
        if check == ReferenceCheck::Valid {
            let params = FlowParams {
                window_size: tunables.window_size,
                ..FlowParams::default()
            };
            let reference = self
                .reference
                .get()
                .ok_or_else(|| anyhow::anyhow!("reference vanished after validity check"))?;
            if let Err(err) =
                self.engine
                    .compute(reference, &buffers.gray, &params, &mut buffers.flow)
            {
                return self.fail("flow", err);
            }
            computed = true;
        }

        let flow = computed.then_some(&buffers.flow);
        if let Err(err) = render(
            &buffers.frame,
            flow,
            tunables.flow_step,
            tunables.vector_scale,
            tunables.stroke_color,
            surface,
        ) {
            return self.fail("render", err);
        }

        if computed {
            self.flow_available = true;
        }
        // In continuous mode this frame becomes the reference for the next
        // one, after the overlay was drawn against the old reference.
        if tunables.capture_mode == CaptureMode::Continuous {
            if let Some(buffers) = self.pool.active() {
                self.reference.update_continuous(&buffers.gray);
            }
        }

        Ok(if rebuilt {
            StepReport::Rebuilt
        } else if computed {
            StepReport::Flow
        } else {
            StepReport::PassThrough {
                reference_invalidated: check == ReferenceCheck::Invalidated,
            }
        })
    }

    /// Export the most recent flow field. Refused while no flow exists for
    /// the current stream.
    pub fn export(&self, writer: &mut dyn WorkbookWriter, path: &std::path::Path) -> Result<()> {
        if !self.flow_available {
            return Err(anyhow::anyhow!(
                "no flow field is available for the current stream"
            ));
        }
        let buffers = self
            .pool
            .active()
            .ok_or_else(|| anyhow::anyhow!("buffer pool empty"))?;
        FlowFieldExporter::export(&buffers.flow, writer, path)
    }

    /// A processing failure is fatal: log, release, stop.
    fn fail(&mut self, stage: &'static str, err: anyhow::Error) -> Result<StepReport> {
        let failure = PipelineError::ProcessingFailure {
            stage,
            message: err.to_string(),
        };
        log::error!("{}", failure);
        self.stop();
        Err(failure.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::FrameBuffer;
    use crate::flow::UniformFlow;
    use crate::render::RasterSurface;
    use crate::source::SyntheticSource;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn controller(source: SyntheticSource) -> PipelineController {
        PipelineController::new(
            Arc::new(source),
            FlowEngine::new(Box::new(UniformFlow::new(1.0, 0.0))),
        )
    }

    fn res(w: u32, h: u32) -> Resolution {
        Resolution::new(w, h).unwrap()
    }

    #[test]
    fn start_allocates_and_streams() {
        let mut ctl = controller(SyntheticSource::new());
        ctl.start("stub://static", res(640, 480), 30).unwrap();

        assert_eq!(ctl.state(), PipelineState::Streaming);
        assert_eq!(ctl.pool().resolution(), Some(res(640, 480)));
    }

    #[test]
    fn denied_device_returns_to_uninitialized() {
        let mut ctl = controller(SyntheticSource::denied());
        let err = ctl.start("stub://denied", res(640, 480), 30).unwrap_err();

        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::DeviceAccessDenied { .. })
        ));
        assert_eq!(ctl.state(), PipelineState::Uninitialized);
        assert!(!ctl.pool().is_allocated());
    }

    #[test]
    fn step_is_idle_until_started() {
        let mut ctl = controller(SyntheticSource::new());
        let mut surface = RasterSurface::new(res(640, 480));
        let report = ctl.step(&Tunables::default(), &mut surface).unwrap();
        assert_eq!(report, StepReport::Idle);
    }

    #[test]
    fn flow_requires_a_captured_reference() {
        let mut ctl = controller(SyntheticSource::new());
        ctl.start("stub://static", res(64, 48), 30).unwrap();
        let tunables = Tunables::default();
        let mut surface = RasterSurface::new(res(64, 48));

        let first = ctl.step(&tunables, &mut surface).unwrap();
        assert_eq!(
            first,
            StepReport::PassThrough {
                reference_invalidated: false
            }
        );
        assert!(!ctl.flow_available());

        ctl.capture_reference();
        let second = ctl.step(&tunables, &mut surface).unwrap();
        assert_eq!(second, StepReport::Flow);
        assert!(ctl.flow_available());
    }

    #[test]
    fn reconfigure_releases_then_reallocates() {
        let mut ctl = controller(SyntheticSource::new());
        ctl.start("stub://static", res(640, 480), 30).unwrap();
        let mut surface = RasterSurface::new(res(640, 480));
        ctl.step(&Tunables::default(), &mut surface).unwrap();
        ctl.capture_reference();

        let generation = ctl.begin_reconfigure();
        assert_eq!(ctl.state(), PipelineState::Reconfiguring);
        assert!(!ctl.pool().is_allocated());
        assert!(!ctl.reference().is_set());

        let outcome = negotiate(
            &SyntheticSource::new(),
            "stub://static",
            res(1280, 720),
            30,
        );
        let applied = ctl
            .complete_reconfigure(NegotiationResult {
                generation,
                outcome,
            })
            .unwrap();
        assert_eq!(applied, ApplyResult::Applied);
        assert_eq!(ctl.state(), PipelineState::Streaming);
        assert_eq!(ctl.pool().resolution(), Some(res(1280, 720)));
    }

    #[test]
    fn stale_generation_results_are_discarded() {
        let mut ctl = controller(SyntheticSource::new());
        ctl.start("stub://static", res(640, 480), 30).unwrap();

        let old_generation = ctl.begin_reconfigure();
        // A second request supersedes the first before its result lands.
        let _ = ctl.begin_reconfigure();

        let outcome = negotiate(
            &SyntheticSource::new(),
            "stub://static",
            res(1280, 720),
            30,
        );
        let applied = ctl
            .complete_reconfigure(NegotiationResult {
                generation: old_generation,
                outcome,
            })
            .unwrap();
        assert_eq!(applied, ApplyResult::Stale);
        assert_eq!(ctl.state(), PipelineState::Reconfiguring);
        assert!(!ctl.pool().is_allocated());
    }

    #[test]
    fn failed_reconfigure_resumes_the_prior_stream() {
        let mut ctl = controller(SyntheticSource::new());
        ctl.start("stub://static", res(640, 480), 30).unwrap();

        let generation = ctl.begin_reconfigure();
        let outcome = Err(PipelineError::ConstraintUnsatisfiable {
            device: "stub://static".to_string(),
            width: 7680,
            height: 4320,
        }
        .into());
        let applied = ctl
            .complete_reconfigure(NegotiationResult {
                generation,
                outcome,
            })
            .unwrap();

        assert_eq!(applied, ApplyResult::Applied);
        assert_eq!(ctl.state(), PipelineState::Streaming);
        assert_eq!(ctl.pool().resolution(), Some(res(640, 480)));
    }

    #[test]
    fn export_is_gated_on_a_computed_flow() {
        struct NullWriter;
        impl WorkbookWriter for NullWriter {
            fn write_workbook(
                &mut self,
                _a: &[Vec<f32>],
                _b: &[Vec<f32>],
                _sheets: (&str, &str),
                _path: &std::path::Path,
            ) -> Result<()> {
                Ok(())
            }
        }

        let mut ctl = controller(SyntheticSource::new());
        ctl.start("stub://static", res(64, 48), 30).unwrap();
        let mut writer = NullWriter;
        assert!(ctl.export(&mut writer, std::path::Path::new("out.xlsx")).is_err());

        let mut surface = RasterSurface::new(res(64, 48));
        ctl.step(&Tunables::default(), &mut surface).unwrap();
        ctl.capture_reference();
        ctl.step(&Tunables::default(), &mut surface).unwrap();
        assert!(ctl.export(&mut writer, std::path::Path::new("out.xlsx")).is_ok());
    }

    /// Stream whose reported resolution flips after a set number of reads.
    struct ShrinkingStream {
        reads: AtomicU32,
        flip_after: u32,
        before: Resolution,
        after: Resolution,
    }

    impl FrameStream for ShrinkingStream {
        fn resolution(&self) -> Resolution {
            if self.reads.load(Ordering::SeqCst) >= self.flip_after {
                self.after
            } else {
                self.before
            }
        }

        fn read_frame(&mut self, out: &mut FrameBuffer) -> Result<()> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            let data = out.data_mut();
            data.fill(128);
            Ok(())
        }
    }

    struct ShrinkingSource {
        before: Resolution,
        after: Resolution,
        flip_after: u32,
    }

    impl FrameSource for ShrinkingSource {
        fn enumerate_devices(&self) -> Result<Vec<crate::source::DeviceInfo>> {
            Ok(vec![])
        }

        fn open(&self, _request: &crate::source::OpenRequest) -> Result<Box<dyn FrameStream>> {
            Ok(Box::new(ShrinkingStream {
                reads: AtomicU32::new(0),
                flip_after: self.flip_after,
                before: self.before,
                after: self.after,
            }))
        }
    }

    #[test]
    fn mid_stream_resolution_change_rebuilds_and_invalidates() {
        let source = ShrinkingSource {
            before: res(64, 48),
            after: res(32, 24),
            flip_after: 2,
        };
        let mut ctl = PipelineController::new(
            Arc::new(source),
            FlowEngine::new(Box::new(UniformFlow::new(1.0, 0.0))),
        );
        ctl.start("any", res(64, 48), 30).unwrap();
        let tunables = Tunables::default();
        let mut surface = RasterSurface::new(res(64, 48));

        ctl.step(&tunables, &mut surface).unwrap();
        ctl.capture_reference();
        assert_eq!(ctl.step(&tunables, &mut surface).unwrap(), StepReport::Flow);

        // Third read happens after the flip; buffers rebuild, the stale
        // reference is gone, and flow is no longer exportable.
        let report = ctl.step(&tunables, &mut surface).unwrap();
        assert_eq!(report, StepReport::Rebuilt);
        assert_eq!(ctl.pool().resolution(), Some(res(32, 24)));
        assert!(!ctl.reference().is_set());
        assert!(!ctl.flow_available());
    }
}
