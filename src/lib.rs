//! Flowscope
//!
//! This crate implements a streaming dense motion-field pipeline: it
//! acquires live video frames, computes a dense displacement field between
//! a grayscale reference frame and the current frame, renders the field as
//! a sparse vector overlay, and exports it as tabular data.
//!
//! # Architecture
//!
//! One single-threaded cooperative loop drives capture, grayscale
//! conversion, flow estimation and rendering in order. Correctness rests on
//! strict ordering rather than locking:
//!
//! - All buffers and the reference frame are exclusively owned by the
//!   pipeline context; reconfiguration always halts the loop, releases
//!   buffers, reallocates, then resumes.
//! - Device/resolution negotiation is cancel-unaware; completed results
//!   are tagged with a generation counter and discarded when stale.
//! - A reference/current dimension mismatch is a local recovery: the
//!   reference is dropped and the frame is rendered without an overlay.
//!
//! # Module Structure
//!
//! - `buffer`: frame/grayscale/flow buffers and the `BufferPool`
//! - `reference`: reference-frame snapshot and capture policy
//! - `flow`: flow engine wrapper over pluggable estimator backends
//! - `render`: frame + vector-overlay drawing onto a `DrawSurface`
//! - `export`: flow field to displacement tables and workbook writing
//! - `source`: frame sources, device enumeration, constraint negotiation
//! - `pipeline`: the top-level controller state machine
//! - `sched`: fixed-rate frame pacing

use std::fmt;

pub mod buffer;
pub mod config;
pub mod export;
pub mod flow;
pub mod pipeline;
pub mod reference;
pub mod render;
pub mod sched;
pub mod source;

pub use buffer::{convert_to_grayscale, BufferPool, FlowField, FrameBuffer, GrayscaleBuffer};
pub use config::{FlowscopeConfig, Tunables};
pub use export::{CsvWorkbookWriter, FlowFieldExporter, WorkbookWriter};
pub use flow::{
    backend_for, effective_window_size, BlockMatchFlow, FlowBackend, FlowEngine, FlowParams,
    UniformFlow,
};
pub use pipeline::{ApplyResult, NegotiationResult, PipelineController, PipelineState, StepReport};
pub use reference::{CaptureMode, ReferenceCheck, ReferenceFrameManager};
pub use render::{render, DrawSurface, RasterSurface, Rgba};
pub use sched::PacingScheduler;
pub use source::{
    available_presets, negotiate, ConstraintMode, DeviceInfo, FrameSource, FrameStream,
    OpenRequest, PresetChoice, SyntheticSource,
};

// -------------------- Resolution --------------------

/// Frame dimensions in pixels. Both sides are always positive; every buffer
/// simultaneously in use reports the same resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> anyhow::Result<Self> {
        if width == 0 || height == 0 {
            return Err(anyhow::anyhow!(
                "resolution sides must be positive, got {}x{}",
                width,
                height
            ));
        }
        Ok(Self { width, height })
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

// -------------------- Error Taxonomy --------------------

/// Pipeline failures that cross a component boundary.
///
/// Two conditions from the failure taxonomy are deliberately absent here:
/// a reference/current dimension mismatch is a local recovery handled by
/// `ReferenceFrameManager`, and a stale negotiation result is a design
/// guard, reported as `pipeline::ApplyResult::Stale` rather than an error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PipelineError {
    /// Permission refusal while opening a device. The controller surfaces
    /// this and remains in (or returns to) `Uninitialized`.
    DeviceAccessDenied { device: String },
    /// Neither the exact nor the relaxed resolution request could be
    /// satisfied. Surfaced with no pipeline state change.
    ConstraintUnsatisfiable {
        device: String,
        width: u32,
        height: u32,
    },
    /// Unexpected failure inside an iteration's capture/convert/flow/render
    /// step. Fatal for the loop: the controller transitions to `Stopped`.
    ProcessingFailure {
        stage: &'static str,
        message: String,
    },
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::DeviceAccessDenied { device } => {
                write!(f, "device access denied for {}", device)
            }
            PipelineError::ConstraintUnsatisfiable {
                device,
                width,
                height,
            } => write!(
                f,
                "device {} cannot satisfy {}x{} even with relaxed constraints",
                device, width, height
            ),
            PipelineError::ProcessingFailure { stage, message } => {
                write!(f, "processing failure in {}: {}", stage, message)
            }
        }
    }
}

impl std::error::Error for PipelineError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_rejects_zero_sides() {
        assert!(Resolution::new(0, 480).is_err());
        assert!(Resolution::new(640, 0).is_err());
        assert_eq!(Resolution::new(640, 480).unwrap().to_string(), "640x480");
    }

    #[test]
    fn errors_render_their_context() {
        let err = PipelineError::ConstraintUnsatisfiable {
            device: "stub://cam0".to_string(),
            width: 3840,
            height: 2160,
        };
        let text = err.to_string();
        assert!(text.contains("stub://cam0"));
        assert!(text.contains("3840x2160"));
    }
}
