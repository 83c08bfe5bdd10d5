//! Frame and vector-overlay rendering.
//!
//! `render` is a pure function of its inputs and the external drawing
//! surface: the current frame is always drawn first, then (if a flow field
//! is present) a sparse grid of displacement vectors on top. `RasterSurface`
//! is the in-crate surface used by the daemon and tests; anything that can
//! blit a frame and stroke a line can stand in for it.

use std::path::Path;

use anyhow::{anyhow, Context, Result};

use crate::buffer::{FlowField, FrameBuffer};
use crate::Resolution;

/// Stroke color, 8 bits per channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rgba {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Rgba {
    pub const BLACK: Rgba = Rgba {
        r: 0,
        g: 0,
        b: 0,
        a: 255,
    };

    /// Parse an HTML-style "#rrggbb" color.
    pub fn parse(text: &str) -> Result<Self> {
        let hex = text.trim().trim_start_matches('#');
        // Byte-length check alone would let a multibyte char through and
        // panic on the slice below.
        if hex.len() != 6 || !hex.is_ascii() {
            return Err(anyhow!("stroke color must be #rrggbb, got '{}'", text));
        }
        let channel = |i: usize| -> Result<u8> {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .with_context(|| format!("invalid stroke color '{}'", text))
        };
        Ok(Rgba {
            r: channel(0)?,
            g: channel(2)?,
            b: channel(4)?,
            a: 255,
        })
    }
}

/// External drawing surface: a frame blit plus line strokes.
pub trait DrawSurface {
    /// Draw the full frame at (0, 0) sized to its own resolution.
    fn draw_frame(&mut self, frame: &FrameBuffer) -> Result<()>;

    /// Stroke a line segment with the given color and width.
    fn stroke_line(&mut self, x0: f32, y0: f32, x1: f32, y1: f32, color: Rgba, width: f32)
        -> Result<()>;
}

/// Overlay stroke width in pixels.
const STROKE_WIDTH: f32 = 2.0;

/// Draw one frame, optionally with its flow-field overlay.
///
/// The flow field is sampled on a regular grid with spacing `step` in both
/// axes (clamped to >= 2); each sample strokes a segment from the sample
/// point to `(x + dx * vector_scale, y + dy * vector_scale)`.
pub fn render(
    frame: &FrameBuffer,
    flow: Option<&FlowField>,
    step: u32,
    vector_scale: f32,
    stroke_color: Rgba,
    surface: &mut dyn DrawSurface,
) -> Result<()> {
    surface.draw_frame(frame)?;

    let Some(flow) = flow else {
        return Ok(());
    };

    let step = step.max(2);
    let res = flow.resolution();
    for y in (0..res.height).step_by(step as usize) {
        for x in (0..res.width).step_by(step as usize) {
            let dx = flow.dx(x, y) * vector_scale;
            let dy = flow.dy(x, y) * vector_scale;
            surface.stroke_line(
                x as f32,
                y as f32,
                x as f32 + dx,
                y as f32 + dy,
                stroke_color,
                STROKE_WIDTH,
            )?;
        }
    }
    Ok(())
}

/// In-memory RGBA raster implementing `DrawSurface`.
pub struct RasterSurface {
    resolution: Resolution,
    data: Vec<u8>,
}

impl RasterSurface {
    pub fn new(resolution: Resolution) -> Self {
        Self {
            resolution,
            data: vec![0u8; resolution.pixel_count() * 4],
        }
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn pixel(&self, x: u32, y: u32) -> Rgba {
        let i = ((y * self.resolution.width + x) * 4) as usize;
        Rgba {
            r: self.data[i],
            g: self.data[i + 1],
            b: self.data[i + 2],
            a: self.data[i + 3],
        }
    }

    fn plot(&mut self, x: i64, y: i64, color: Rgba) {
        if x < 0 || y < 0 || x >= self.resolution.width as i64 || y >= self.resolution.height as i64
        {
            return;
        }
        let i = ((y as u32 * self.resolution.width + x as u32) * 4) as usize;
        self.data[i] = color.r;
        self.data[i + 1] = color.g;
        self.data[i + 2] = color.b;
        self.data[i + 3] = color.a;
    }

    /// Dump the raster as a binary PPM (overlay snapshot export).
    pub fn write_ppm(&self, path: &Path) -> Result<()> {
        use std::io::Write;

        let file = std::fs::File::create(path)
            .with_context(|| format!("create snapshot {}", path.display()))?;
        let mut out = std::io::BufWriter::new(file);
        writeln!(out, "P6\n{} {}\n255", self.resolution.width, self.resolution.height)?;
        for rgba in self.data.chunks_exact(4) {
            out.write_all(&rgba[..3])?;
        }
        Ok(())
    }
}

impl DrawSurface for RasterSurface {
    fn draw_frame(&mut self, frame: &FrameBuffer) -> Result<()> {
        if frame.resolution() != self.resolution {
            // The surface follows the negotiated frame size.
            self.resolution = frame.resolution();
            self.data = vec![0u8; self.resolution.pixel_count() * 4];
        }
        self.data.copy_from_slice(frame.data());
        Ok(())
    }

    fn stroke_line(
        &mut self,
        x0: f32,
        y0: f32,
        x1: f32,
        y1: f32,
        color: Rgba,
        width: f32,
    ) -> Result<()> {
        let steps = (x1 - x0).abs().max((y1 - y0).abs()).ceil() as i64;
        let thick = width >= 2.0;
        for s in 0..=steps.max(0) {
            let t = if steps == 0 { 0.0 } else { s as f32 / steps as f32 };
            let x = (x0 + (x1 - x0) * t).round() as i64;
            let y = (y0 + (y1 - y0) * t).round() as i64;
            self.plot(x, y, color);
            if thick {
                self.plot(x + 1, y, color);
                self.plot(x, y + 1, color);
            }
        }
        Ok(())
    }
}
