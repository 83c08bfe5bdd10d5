use anyhow::Result;

use crate::buffer::{FlowField, GrayscaleBuffer};
use crate::flow::engine::{FlowBackend, FlowParams};

/// CPU backend: coarse block-matching displacement search.
///
/// Estimates one integer displacement per window-sized tile by minimizing
/// the sampled absolute difference between the reference patch and the
/// shifted current patch, then fills every pixel of the tile with that
/// displacement. It honors the engine's window-size contract and output
/// shape; pyramid and polynomial parameters do not apply to this
/// formulation and are ignored.
pub struct BlockMatchFlow {
    /// Maximum displacement searched in each axis, in pixels.
    pub search_radius: u32,
}

impl Default for BlockMatchFlow {
    fn default() -> Self {
        Self { search_radius: 8 }
    }
}

impl BlockMatchFlow {
    pub fn new(search_radius: u32) -> Self {
        Self { search_radius }
    }
}

impl FlowBackend for BlockMatchFlow {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn estimate(
        &mut self,
        reference: &GrayscaleBuffer,
        current: &GrayscaleBuffer,
        params: &FlowParams,
        out: &mut FlowField,
    ) -> Result<()> {
        let res = current.resolution();
        let w = res.width as i64;
        let h = res.height as i64;
        let win = params.window_size.max(3) as i64;
        let half = win / 2;
        let radius = self.search_radius as i64;
        // Wide windows are subsampled to keep the search affordable.
        let stride = if win >= 9 { 2 } else { 1 };

        let tiles_x = (w + win - 1) / win;
        let tiles_y = (h + win - 1) / win;

        for ty in 0..tiles_y {
            let cy = (ty * win + win / 2).min(h - 1);
            for tx in 0..tiles_x {
                let cx = (tx * win + win / 2).min(w - 1);

                // Zero displacement is the baseline; only a strictly better
                // match replaces it, so flat regions report no motion.
                let mut best_dx = 0i64;
                let mut best_dy = 0i64;
                let mut best_cost = patch_cost(reference, current, cx, cy, 0, 0, half, stride);

                for dy in -radius..=radius {
                    for dx in -radius..=radius {
                        if dx == 0 && dy == 0 {
                            continue;
                        }
                        let cost = patch_cost(reference, current, cx, cy, dx, dy, half, stride);
                        if cost < best_cost {
                            best_cost = cost;
                            best_dx = dx;
                            best_dy = dy;
                        }
                    }
                }

                let x0 = tx * win;
                let y0 = ty * win;
                let x1 = (x0 + win).min(w);
                let y1 = (y0 + win).min(h);
                for y in y0..y1 {
                    for x in x0..x1 {
                        out.set(x as u32, y as u32, best_dx as f32, best_dy as f32);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Sampled sum of absolute differences between the reference patch centered
/// at (cx, cy) and the current patch displaced by (dx, dy). Out-of-bounds
/// samples clamp to the nearest edge pixel.
fn patch_cost(
    reference: &GrayscaleBuffer,
    current: &GrayscaleBuffer,
    cx: i64,
    cy: i64,
    dx: i64,
    dy: i64,
    half: i64,
    stride: i64,
) -> u64 {
    let res = reference.resolution();
    let w = res.width as i64;
    let h = res.height as i64;
    let mut cost = 0u64;

    let mut j = -half;
    while j <= half {
        let ry = (cy + j).clamp(0, h - 1);
        let sy = (cy + dy + j).clamp(0, h - 1);
        let mut i = -half;
        while i <= half {
            let rx = (cx + i).clamp(0, w - 1);
            let sx = (cx + dx + i).clamp(0, w - 1);
            let a = reference.luma(rx as u32, ry as u32) as i64;
            let b = current.luma(sx as u32, sy as u32) as i64;
            cost += (a - b).unsigned_abs();
            i += stride;
        }
        j += stride;
    }
    cost
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Resolution;

    /// Deterministic wrap-around texture so a shifted frame is defined at
    /// every pixel.
    fn textured(res: Resolution, shift_x: i64, shift_y: i64) -> GrayscaleBuffer {
        let mut gray = GrayscaleBuffer::new(res);
        for y in 0..res.height {
            for x in 0..res.width {
                let sx = (x as i64 - shift_x).rem_euclid(res.width as i64) as u32;
                let sy = (y as i64 - shift_y).rem_euclid(res.height as i64) as u32;
                let v = (sx.wrapping_mul(37) ^ sy.wrapping_mul(101)).wrapping_add(sx * sy);
                gray.set_luma(x, y, (v % 251) as u8);
            }
        }
        gray
    }

    fn mean_flow(flow: &FlowField, margin: u32) -> (f64, f64) {
        let res = flow.resolution();
        let mut sum_dx = 0.0f64;
        let mut sum_dy = 0.0f64;
        let mut n = 0u64;
        for y in margin..res.height - margin {
            for x in margin..res.width - margin {
                sum_dx += flow.dx(x, y) as f64;
                sum_dy += flow.dy(x, y) as f64;
                n += 1;
            }
        }
        (sum_dx / n as f64, sum_dy / n as f64)
    }

    #[test]
    fn recovers_integer_shift() {
        let res = Resolution::new(64, 48).unwrap();
        let reference = textured(res, 0, 0);
        let current = textured(res, 3, -2);
        let mut flow = FlowField::new(res);
        let mut backend = BlockMatchFlow::new(4);
        let params = FlowParams {
            window_size: 9,
            ..FlowParams::default()
        };

        backend
            .estimate(&reference, &current, &params, &mut flow)
            .unwrap();

        let (mean_dx, mean_dy) = mean_flow(&flow, 8);
        assert!((mean_dx - 3.0).abs() < 0.5, "mean dx {}", mean_dx);
        assert!((mean_dy + 2.0).abs() < 0.5, "mean dy {}", mean_dy);
    }

    #[test]
    fn static_scene_reports_no_motion() {
        let res = Resolution::new(48, 32).unwrap();
        let frame = textured(res, 0, 0);
        let mut flow = FlowField::new(res);
        let mut backend = BlockMatchFlow::default();

        backend
            .estimate(&frame, &frame, &FlowParams::default(), &mut flow)
            .unwrap();

        for y in 0..res.height {
            for x in 0..res.width {
                assert_eq!(flow.dx(x, y), 0.0);
                assert_eq!(flow.dy(x, y), 0.0);
            }
        }
    }
}
