//! V4L2 frame source (feature: source-v4l2).
//!
//! Opens a local device node (e.g., /dev/video0), requests an RGB3 format
//! at the negotiated resolution and frame rate, and converts captured
//! RGB24 buffers into RGBA frame buffers. Under `Exact` constraints an
//! actual format that differs from the request is refused; under `Ideal`
//! the driver's chosen format defines the stream resolution.

use anyhow::{Context, Result};
use ouroboros::self_referencing;

use crate::buffer::FrameBuffer;
use crate::{PipelineError, Resolution};

use super::{ConstraintMode, DeviceInfo, FrameSource, FrameStream, OpenRequest};

/// Source backed by local V4L2 device nodes.
pub struct V4l2Source;

impl V4l2Source {
    pub fn new() -> Self {
        V4l2Source
    }
}

impl Default for V4l2Source {
    fn default() -> Self {
        V4l2Source::new()
    }
}

impl FrameSource for V4l2Source {
    fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>> {
        use v4l::video::Capture;

        let mut devices = Vec::new();
        for node in v4l::context::enum_devices() {
            let path = node.path().to_string_lossy().to_string();
            let Ok(device) = v4l::Device::with_path(node.path()) else {
                continue;
            };
            let label = node
                .name()
                .unwrap_or_else(|| format!("video device {}", node.index()));
            // The largest discrete frame size the driver advertises, if it
            // advertises any; otherwise the current format's dimensions.
            let (max_width, max_height) = probe_max_frame_size(&device)
                .unwrap_or_else(|| {
                    device
                        .format()
                        .map(|f| (f.width, f.height))
                        .unwrap_or((0, 0))
                });
            devices.push(DeviceInfo {
                id: path,
                label,
                max_width,
                max_height,
            });
        }
        Ok(devices)
    }

    fn open(&self, request: &OpenRequest) -> Result<Box<dyn FrameStream>> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let mut device = v4l::Device::with_path(&request.device_id).map_err(|err| {
            if err.kind() == std::io::ErrorKind::PermissionDenied {
                anyhow::Error::new(PipelineError::DeviceAccessDenied {
                    device: request.device_id.clone(),
                })
            } else {
                anyhow::Error::new(err).context(format!("open v4l2 device {}", request.device_id))
            }
        })?;

        let mut format = device.format().context("read v4l2 format")?;
        format.width = request.resolution.width;
        format.height = request.resolution.height;
        format.fourcc = v4l::FourCC::new(b"RGB3");
        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "failed to set format on {}: {}",
                    request.device_id,
                    err
                );
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };

        let actual = Resolution::new(format.width, format.height)?;
        if request.mode == ConstraintMode::Exact && actual != request.resolution {
            return Err(PipelineError::ConstraintUnsatisfiable {
                device: request.device_id.clone(),
                width: request.resolution.width,
                height: request.resolution.height,
            }
            .into());
        }

        if request.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(request.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!("failed to set fps on {}: {}", request.device_id, err);
            }
        }

        let state = V4l2StateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;

        log::info!("opened {} at {}", request.device_id, actual);
        Ok(Box::new(V4l2Stream {
            resolution: actual,
            state,
        }))
    }
}

fn probe_max_frame_size(device: &v4l::Device) -> Option<(u32, u32)> {
    use v4l::video::Capture;

    let formats = device.enum_formats().ok()?;
    let mut best: Option<(u32, u32)> = None;
    for format in formats {
        let Ok(sizes) = device.enum_framesizes(format.fourcc) else {
            continue;
        };
        for size in sizes {
            for discrete in size.size.to_discrete() {
                let candidate = (discrete.width, discrete.height);
                if best.map_or(true, |b| {
                    candidate.0 as u64 * candidate.1 as u64 > b.0 as u64 * b.1 as u64
                }) {
                    best = Some(candidate);
                }
            }
        }
    }
    best
}

#[self_referencing]
struct V4l2State {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

/// Stream of frames captured from one device.
pub struct V4l2Stream {
    resolution: Resolution,
    state: V4l2State,
}

impl FrameStream for V4l2Stream {
    fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn read_frame(&mut self, out: &mut FrameBuffer) -> Result<()> {
        use v4l::io::traits::CaptureStream;

        let (buf, _meta) = self
            .state
            .with_mut(|fields| fields.stream.next())
            .map_err(|err| anyhow::Error::new(err).context("capture v4l2 frame"))?;

        let expected = (self.resolution.pixel_count() as usize) * 3;
        if buf.len() < expected {
            return Err(anyhow::anyhow!(
                "short v4l2 frame: got {} bytes, need {}",
                buf.len(),
                expected
            ));
        }
        if out.resolution() != self.resolution {
            return Err(anyhow::anyhow!(
                "frame buffer is {}, stream delivers {}",
                out.resolution(),
                self.resolution
            ));
        }

        let rgba = out.data_mut();
        for (i, rgb) in buf[..expected].chunks_exact(3).enumerate() {
            let o = i * 4;
            rgba[o] = rgb[0];
            rgba[o + 1] = rgb[1];
            rgba[o + 2] = rgb[2];
            rgba[o + 3] = 255;
        }
        Ok(())
    }
}
