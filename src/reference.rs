//! Reference-frame snapshot and capture policy.
//!
//! At most one reference grayscale snapshot is alive at any time. The slot
//! is an exclusive single-owner cell: replacing the reference reassigns the
//! `Option`, which drops the previous snapshot first. The grayscale buffer
//! carries the resolution it was captured at, so a divergence from the live
//! frame resolution can be detected and recovered locally without ever
//! stopping the pipeline.

use serde::Deserialize;

use crate::buffer::GrayscaleBuffer;
use crate::Resolution;

/// Reference update policy.
///
/// Manual: the reference changes only on an explicit capture trigger.
/// Continuous: the reference is replaced after every processed frame, once
/// flow computation for that frame has consumed the prior reference.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    #[default]
    Manual,
    Continuous,
}

/// Outcome of the per-frame reference validity check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReferenceCheck {
    /// A reference exists and matches the live frame resolution.
    Valid,
    /// No reference is held; the frame renders pass-through.
    Absent,
    /// A reference existed but its resolution diverged; it has been
    /// released and the caller must skip flow computation this frame.
    Invalidated,
}

/// Owner of the single reference grayscale snapshot.
#[derive(Default)]
pub struct ReferenceFrameManager {
    reference: Option<GrayscaleBuffer>,
    replacements: u64,
}

impl ReferenceFrameManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an owned copy of `gray` as the new reference, releasing any
    /// prior snapshot first. The controller gates this on the Streaming
    /// state; the manager itself is unconditional.
    pub fn capture(&mut self, gray: &GrayscaleBuffer) {
        self.reference = Some(gray.clone());
        self.replacements += 1;
    }

    /// Continuous-mode update: unconditionally replace the reference with a
    /// copy of the current grayscale frame. Called once per processed
    /// frame, after flow computation has consumed the prior reference.
    pub fn update_continuous(&mut self, gray: &GrayscaleBuffer) {
        self.capture(gray);
    }

    /// Release the reference if its resolution no longer matches the live
    /// frame resolution. Local recovery: the caller suppresses the overlay
    /// for this frame and clears the export affordance, nothing more.
    pub fn invalidate_if_mismatched(&mut self, frame_resolution: Resolution) -> ReferenceCheck {
        match &self.reference {
            None => ReferenceCheck::Absent,
            Some(reference) if reference.resolution() == frame_resolution => ReferenceCheck::Valid,
            Some(reference) => {
                log::warn!(
                    "reference frame {} no longer matches live frame {}, dropping it",
                    reference.resolution(),
                    frame_resolution
                );
                self.reference = None;
                ReferenceCheck::Invalidated
            }
        }
    }

    pub fn get(&self) -> Option<&GrayscaleBuffer> {
        self.reference.as_ref()
    }

    pub fn is_set(&self) -> bool {
        self.reference.is_some()
    }

    /// Release the reference unconditionally (stop/reconfigure teardown).
    pub fn clear(&mut self) {
        self.reference = None;
    }

    /// Number of times the reference slot has been replaced.
    pub fn replacements(&self) -> u64 {
        self.replacements
    }
}
