//! Frame sources.
//!
//! A `FrameSource` enumerates devices and opens streams; an opened
//! `FrameStream` reports its negotiated resolution and fills frame buffers.
//! Negotiation is two-phase: an exact request first, then a retry with
//! relaxed "ideal" constraints the source may clamp to its capability
//! bounds. Sources available:
//! - `stub://` synthetic scenes (deterministic, testable)
//! - local V4L2 devices (feature: source-v4l2)

mod synthetic;
#[cfg(feature = "source-v4l2")]
pub mod v4l2;

pub use synthetic::SyntheticSource;
#[cfg(feature = "source-v4l2")]
pub use v4l2::V4l2Source;

use anyhow::Result;

use crate::{PipelineError, Resolution};

/// One enumerated capture device with its capability bounds. The bounds
/// filter which resolution presets are offered for it.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub id: String,
    pub label: String,
    pub max_width: u32,
    pub max_height: u32,
}

impl DeviceInfo {
    pub fn supports(&self, resolution: Resolution) -> bool {
        resolution.width <= self.max_width && resolution.height <= self.max_height
    }
}

/// Constraint strictness for an open request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConstraintMode {
    /// The negotiated stream must match the requested resolution.
    Exact,
    /// The source may clamp the request to what the device can do.
    Ideal,
}

/// A device/resolution open request.
#[derive(Clone, Debug)]
pub struct OpenRequest {
    pub device_id: String,
    pub resolution: Resolution,
    pub target_fps: u32,
    pub mode: ConstraintMode,
}

/// An opened stream delivering frames at one negotiated resolution.
pub trait FrameStream: Send {
    /// Negotiated actual resolution. May differ from the request under
    /// `Ideal` constraints.
    fn resolution(&self) -> Resolution;

    /// Fill `out` with the next frame. `out` is sized to `resolution()`.
    fn read_frame(&mut self, out: &mut crate::buffer::FrameBuffer) -> Result<()>;
}

/// A frame source: device enumeration plus stream opening.
pub trait FrameSource: Send + Sync {
    fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>>;

    fn open(&self, request: &OpenRequest) -> Result<Box<dyn FrameStream>>;
}

/// Open a stream with exact constraints, retrying once with relaxed
/// constraints when the exact request cannot be satisfied. A permission
/// refusal is surfaced immediately; relaxation would not help.
pub fn negotiate(
    source: &dyn FrameSource,
    device_id: &str,
    resolution: Resolution,
    target_fps: u32,
) -> Result<Box<dyn FrameStream>> {
    let exact = OpenRequest {
        device_id: device_id.to_string(),
        resolution,
        target_fps,
        mode: ConstraintMode::Exact,
    };
    match source.open(&exact) {
        Ok(stream) => Ok(stream),
        Err(err) => {
            if let Some(PipelineError::DeviceAccessDenied { .. }) =
                err.downcast_ref::<PipelineError>()
            {
                return Err(err);
            }
            log::warn!(
                "exact {} request on {} failed ({}), retrying with ideal constraints",
                resolution,
                device_id,
                err
            );
            source.open(&OpenRequest {
                mode: ConstraintMode::Ideal,
                ..exact
            })
        }
    }
}

// -------------------- Resolution Presets --------------------

/// Named resolution presets offered to the configuration surface.
pub const RESOLUTION_PRESETS: &[(&str, u32, u32)] = &[
    ("4K", 3840, 2160),
    ("1440p", 2560, 1440),
    ("1080p", 1920, 1080),
    ("720p", 1280, 720),
    ("480p", 640, 480),
];

/// One offered preset choice.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PresetChoice {
    /// The device's capability maximum. Offered only when capability
    /// probing succeeded.
    AutoMax(Resolution),
    Fixed { name: &'static str, resolution: Resolution },
}

impl PresetChoice {
    pub fn resolution(&self) -> Resolution {
        match self {
            PresetChoice::AutoMax(res) => *res,
            PresetChoice::Fixed { resolution, .. } => *resolution,
        }
    }
}

/// Presets offered for a device. Fixed presets beyond the device's
/// capability bounds are filtered out; with no capability information all
/// fixed presets are offered and auto-max is withheld.
pub fn available_presets(capabilities: Option<&DeviceInfo>) -> Vec<PresetChoice> {
    let mut choices = Vec::new();
    if let Some(caps) = capabilities {
        if let Ok(max) = Resolution::new(caps.max_width, caps.max_height) {
            choices.push(PresetChoice::AutoMax(max));
        }
    }
    for &(name, w, h) in RESOLUTION_PRESETS {
        let resolution = Resolution { width: w, height: h };
        let within = capabilities.map(|caps| caps.supports(resolution)).unwrap_or(true);
        if within {
            choices.push(PresetChoice::Fixed { name, resolution });
        }
    }
    choices
}

/// Resolve a preset name ("720p") or literal "WxH" spec to a resolution.
pub fn resolve_resolution_spec(spec: &str) -> Result<Resolution> {
    for &(name, w, h) in RESOLUTION_PRESETS {
        if spec.eq_ignore_ascii_case(name) {
            return Resolution::new(w, h);
        }
    }
    if let Some((w, h)) = spec.split_once('x') {
        let width: u32 = w.trim().parse().unwrap_or(0);
        let height: u32 = h.trim().parse().unwrap_or(0);
        return Resolution::new(width, height);
    }
    Err(anyhow::anyhow!(
        "unknown resolution '{}': expected a preset name or WxH",
        spec
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(max_w: u32, max_h: u32) -> DeviceInfo {
        DeviceInfo {
            id: "stub://cam0".to_string(),
            label: "stub cam".to_string(),
            max_width: max_w,
            max_height: max_h,
        }
    }

    #[test]
    fn presets_filter_on_capability_bounds() {
        let device = caps(1280, 720);
        let choices = available_presets(Some(&device));

        assert_eq!(
            choices[0],
            PresetChoice::AutoMax(Resolution::new(1280, 720).unwrap())
        );
        let names: Vec<&str> = choices
            .iter()
            .filter_map(|c| match c {
                PresetChoice::Fixed { name, .. } => Some(*name),
                PresetChoice::AutoMax(_) => None,
            })
            .collect();
        assert_eq!(names, vec!["720p", "480p"]);
    }

    #[test]
    fn unknown_capabilities_withhold_auto_max() {
        let choices = available_presets(None);
        assert!(matches!(choices[0], PresetChoice::Fixed { name: "4K", .. }));
        assert_eq!(choices.len(), RESOLUTION_PRESETS.len());
    }

    #[test]
    fn resolves_preset_names_and_literals() {
        assert_eq!(
            resolve_resolution_spec("480p").unwrap(),
            Resolution::new(640, 480).unwrap()
        );
        assert_eq!(
            resolve_resolution_spec("800x600").unwrap(),
            Resolution::new(800, 600).unwrap()
        );
        assert!(resolve_resolution_spec("cinema").is_err());
        assert!(resolve_resolution_spec("0x600").is_err());
    }
}
