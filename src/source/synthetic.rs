//! Synthetic frame source.
//!
//! `stub://` devices render a deterministic textured scene that translates
//! by a fixed per-frame offset, so motion estimates have a known ground
//! truth. Useful for tests and for running the daemon without hardware.

use anyhow::Result;
use rand::Rng;

use crate::buffer::FrameBuffer;
use crate::{PipelineError, Resolution};

use super::{ConstraintMode, DeviceInfo, FrameSource, FrameStream, OpenRequest};

/// A configured synthetic device.
#[derive(Clone, Debug)]
struct SyntheticDevice {
    id: String,
    label: String,
    max: Resolution,
    /// Per-frame scene translation in pixels.
    shift: (i32, i32),
    /// Opening this device fails with an access refusal.
    denied: bool,
}

/// Source backing `stub://` device ids.
pub struct SyntheticSource {
    devices: Vec<SyntheticDevice>,
    noise: bool,
}

impl SyntheticSource {
    /// Default device set: a static camera and a panning camera, both
    /// capped at 1080p.
    pub fn new() -> Self {
        let cap = Resolution {
            width: 1920,
            height: 1080,
        };
        SyntheticSource {
            devices: vec![
                SyntheticDevice {
                    id: "stub://static".to_string(),
                    label: "Synthetic static scene".to_string(),
                    max: cap,
                    shift: (0, 0),
                    denied: false,
                },
                SyntheticDevice {
                    id: "stub://pan".to_string(),
                    label: "Synthetic panning scene".to_string(),
                    max: cap,
                    shift: (2, 1),
                    denied: false,
                },
            ],
            noise: false,
        }
    }

    /// A single device with an explicit per-frame shift and capability cap.
    pub fn with_shift(shift: (i32, i32), max: Resolution) -> Self {
        SyntheticSource {
            devices: vec![SyntheticDevice {
                id: "stub://scripted".to_string(),
                label: "Synthetic scripted scene".to_string(),
                max,
                shift,
                denied: false,
            }],
            noise: false,
        }
    }

    /// A device whose open always fails with an access refusal.
    pub fn denied() -> Self {
        SyntheticSource {
            devices: vec![SyntheticDevice {
                id: "stub://denied".to_string(),
                label: "Synthetic denied device".to_string(),
                max: Resolution {
                    width: 640,
                    height: 480,
                },
                shift: (0, 0),
                denied: true,
            }],
            noise: false,
        }
    }

    /// Add low-amplitude per-pixel noise to generated frames.
    pub fn with_noise(mut self) -> Self {
        self.noise = true;
        self
    }
}

impl Default for SyntheticSource {
    fn default() -> Self {
        SyntheticSource::new()
    }
}

impl FrameSource for SyntheticSource {
    fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(self
            .devices
            .iter()
            .map(|d| DeviceInfo {
                id: d.id.clone(),
                label: d.label.clone(),
                max_width: d.max.width,
                max_height: d.max.height,
            })
            .collect())
    }

    fn open(&self, request: &OpenRequest) -> Result<Box<dyn FrameStream>> {
        let device = self
            .devices
            .iter()
            .find(|d| d.id == request.device_id)
            .ok_or_else(|| anyhow::anyhow!("no such device: {}", request.device_id))?;
        if device.denied {
            return Err(PipelineError::DeviceAccessDenied {
                device: device.id.clone(),
            }
            .into());
        }

        let within = request.resolution.width <= device.max.width
            && request.resolution.height <= device.max.height;
        let actual = match request.mode {
            ConstraintMode::Exact if !within => {
                return Err(PipelineError::ConstraintUnsatisfiable {
                    device: device.id.clone(),
                    width: request.resolution.width,
                    height: request.resolution.height,
                }
                .into());
            }
            ConstraintMode::Exact => request.resolution,
            ConstraintMode::Ideal => Resolution {
                width: request.resolution.width.min(device.max.width),
                height: request.resolution.height.min(device.max.height),
            },
        };

        Ok(Box::new(SyntheticStream {
            resolution: actual,
            shift: device.shift,
            noise: self.noise,
            frame_index: 0,
        }))
    }
}

/// Stream of procedurally generated frames.
pub struct SyntheticStream {
    resolution: Resolution,
    shift: (i32, i32),
    noise: bool,
    frame_index: i64,
}

/// Textured sample at wrapped scene coordinates. Aperiodic enough that
/// block matching locks onto the true translation.
fn scene_luma(x: i64, y: i64, width: u32, height: u32) -> u8 {
    let sx = x.rem_euclid(width as i64) as u64;
    let sy = y.rem_euclid(height as i64) as u64;
    (((sx * 37) ^ (sy * 101)).wrapping_add(sx * sy) % 251) as u8
}

impl FrameStream for SyntheticStream {
    fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn read_frame(&mut self, out: &mut FrameBuffer) -> Result<()> {
        if out.resolution() != self.resolution {
            return Err(anyhow::anyhow!(
                "frame buffer is {}, stream delivers {}",
                out.resolution(),
                self.resolution
            ));
        }
        let (w, h) = (self.resolution.width, self.resolution.height);
        // Content translates by `shift` pixels per frame; pixel (x, y) of
        // frame t samples the scene at (x, y) minus the accumulated offset.
        let off_x = self.shift.0 as i64 * self.frame_index;
        let off_y = self.shift.1 as i64 * self.frame_index;
        let mut rng = rand::thread_rng();
        for y in 0..h {
            for x in 0..w {
                let mut luma = scene_luma(x as i64 - off_x, y as i64 - off_y, w, h);
                if self.noise {
                    luma = luma.saturating_add(rng.gen_range(0..4));
                }
                out.set_pixel(x, y, [luma, luma, luma, 255]);
            }
        }
        self.frame_index += 1;
        Ok(())
    }
}
