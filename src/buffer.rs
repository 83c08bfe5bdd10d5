//! Image and flow buffer lifecycle.
//!
//! All live buffers agree on one `Resolution` at a time. `BufferPool` owns
//! the three working buffers of the pipeline (raw frame, grayscale, flow
//! field) as a single slot: `resize` drops the previous allocation before
//! the new one is installed, and `release` empties the slot entirely. The
//! pool must only be resized while the pipeline is not mid-iteration; the
//! borrow checker enforces that no reference into the old buffers survives
//! a resize.

use anyhow::{anyhow, Result};

use crate::Resolution;

/// Raw RGBA frame, row-major, 4 bytes per pixel.
pub struct FrameBuffer {
    resolution: Resolution,
    data: Vec<u8>,
}

impl FrameBuffer {
    pub fn new(resolution: Resolution) -> Self {
        let len = resolution.pixel_count() * 4;
        Self {
            resolution,
            data: vec![0u8; len],
        }
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// RGBA value at (x, y). Caller keeps coordinates in bounds.
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let i = ((y * self.resolution.width + x) * 4) as usize;
        [
            self.data[i],
            self.data[i + 1],
            self.data[i + 2],
            self.data[i + 3],
        ]
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, rgba: [u8; 4]) {
        let i = ((y * self.resolution.width + x) * 4) as usize;
        self.data[i..i + 4].copy_from_slice(&rgba);
    }
}

/// Single-channel grayscale frame, one byte per pixel.
#[derive(Clone)]
pub struct GrayscaleBuffer {
    resolution: Resolution,
    data: Vec<u8>,
}

impl GrayscaleBuffer {
    pub fn new(resolution: Resolution) -> Self {
        Self {
            resolution,
            data: vec![0u8; resolution.pixel_count()],
        }
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn luma(&self, x: u32, y: u32) -> u8 {
        self.data[(y * self.resolution.width + x) as usize]
    }

    pub fn set_luma(&mut self, x: u32, y: u32, value: u8) {
        self.data[(y * self.resolution.width + x) as usize] = value;
    }
}

/// Dense motion field: one (dx, dy) pair per pixel, interleaved f32,
/// displacement in pixel units from the reference frame to the current one.
pub struct FlowField {
    resolution: Resolution,
    data: Vec<f32>,
}

impl FlowField {
    pub fn new(resolution: Resolution) -> Self {
        Self {
            resolution,
            data: vec![0.0f32; resolution.pixel_count() * 2],
        }
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn dx(&self, x: u32, y: u32) -> f32 {
        self.data[((y * self.resolution.width + x) * 2) as usize]
    }

    pub fn dy(&self, x: u32, y: u32) -> f32 {
        self.data[((y * self.resolution.width + x) * 2 + 1) as usize]
    }

    pub fn set(&mut self, x: u32, y: u32, dx: f32, dy: f32) {
        let i = ((y * self.resolution.width + x) * 2) as usize;
        self.data[i] = dx;
        self.data[i + 1] = dy;
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }
}

/// Rec.601 luma conversion, matching the RGBA-to-gray weights used by the
/// upstream vision stack (0.299 R + 0.587 G + 0.114 B, alpha ignored).
pub fn convert_to_grayscale(frame: &FrameBuffer, out: &mut GrayscaleBuffer) -> Result<()> {
    if frame.resolution() != out.resolution() {
        return Err(anyhow!(
            "grayscale conversion resolution mismatch: frame {} vs out {}",
            frame.resolution(),
            out.resolution()
        ));
    }
    for (dst, src) in out.data.iter_mut().zip(frame.data.chunks_exact(4)) {
        let r = src[0] as u32;
        let g = src[1] as u32;
        let b = src[2] as u32;
        *dst = ((299 * r + 587 * g + 114 * b + 500) / 1000) as u8;
    }
    Ok(())
}

/// The three working buffers of one streaming generation.
pub struct WorkingBuffers {
    pub frame: FrameBuffer,
    pub gray: GrayscaleBuffer,
    pub flow: FlowField,
}

impl WorkingBuffers {
    fn allocate(resolution: Resolution) -> Self {
        Self {
            frame: FrameBuffer::new(resolution),
            gray: GrayscaleBuffer::new(resolution),
            flow: FlowField::new(resolution),
        }
    }
}

/// Owner of the frame/grayscale/flow buffers for the current resolution.
///
/// `resize` is atomic from the pipeline's point of view: the previous
/// buffers are dropped when the slot is reassigned, and afterwards all
/// three buffers report the new resolution.
#[derive(Default)]
pub struct BufferPool {
    active: Option<WorkingBuffers>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop any existing buffers and allocate fresh ones at `resolution`.
    /// Must not be called while an iteration is in flight.
    pub fn resize(&mut self, resolution: Resolution) {
        self.active = Some(WorkingBuffers::allocate(resolution));
    }

    /// Release all buffers without reallocating.
    pub fn release(&mut self) {
        self.active = None;
    }

    pub fn is_allocated(&self) -> bool {
        self.active.is_some()
    }

    pub fn resolution(&self) -> Option<Resolution> {
        self.active.as_ref().map(|b| b.frame.resolution())
    }

    pub fn active(&self) -> Option<&WorkingBuffers> {
        self.active.as_ref()
    }

    pub fn active_mut(&mut self) -> Option<&mut WorkingBuffers> {
        self.active.as_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn res(w: u32, h: u32) -> Resolution {
        Resolution::new(w, h).unwrap()
    }

    #[test]
    fn resize_sizes_all_three_buffers() {
        let mut pool = BufferPool::new();

        for (w, h) in [(640, 480), (1280, 720), (2, 2)] {
            pool.resize(res(w, h));
            let bufs = pool.active().expect("allocated");
            assert_eq!(bufs.frame.resolution(), res(w, h));
            assert_eq!(bufs.gray.resolution(), res(w, h));
            assert_eq!(bufs.flow.resolution(), res(w, h));
            assert_eq!(bufs.frame.data().len(), (w * h * 4) as usize);
            assert_eq!(bufs.gray.data().len(), (w * h) as usize);
            assert_eq!(bufs.flow.data().len(), (w * h * 2) as usize);
        }
    }

    #[test]
    fn release_empties_the_pool() {
        let mut pool = BufferPool::new();
        pool.resize(res(64, 48));
        assert!(pool.is_allocated());

        pool.release();
        assert!(!pool.is_allocated());
        assert_eq!(pool.resolution(), None);
    }

    #[test]
    fn grayscale_conversion_uses_rec601_weights() {
        let mut frame = FrameBuffer::new(res(2, 1));
        frame.set_pixel(0, 0, [255, 0, 0, 255]);
        frame.set_pixel(1, 0, [0, 255, 0, 255]);
        let mut gray = GrayscaleBuffer::new(res(2, 1));

        convert_to_grayscale(&frame, &mut gray).unwrap();

        assert_eq!(gray.luma(0, 0), 76); // 0.299 * 255
        assert_eq!(gray.luma(1, 0), 150); // 0.587 * 255
    }

    #[test]
    fn grayscale_conversion_rejects_mismatched_buffers() {
        let frame = FrameBuffer::new(res(4, 4));
        let mut gray = GrayscaleBuffer::new(res(2, 2));
        assert!(convert_to_grayscale(&frame, &mut gray).is_err());
    }

    #[test]
    fn flow_field_round_trips_pairs() {
        let mut flow = FlowField::new(res(3, 2));
        flow.set(2, 1, 1.5, -0.5);
        assert_eq!(flow.dx(2, 1), 1.5);
        assert_eq!(flow.dy(2, 1), -0.5);
        assert_eq!(flow.dx(0, 0), 0.0);
    }
}
