use anyhow::Result;

use crate::buffer::{FlowField, GrayscaleBuffer};
use crate::flow::engine::{FlowBackend, FlowParams};

/// Stub backend: fills the whole field with one constant displacement.
/// Useful for pipeline tests that only care about field lifecycle, not
/// estimation quality.
pub struct UniformFlow {
    dx: f32,
    dy: f32,
}

impl UniformFlow {
    pub fn new(dx: f32, dy: f32) -> Self {
        Self { dx, dy }
    }
}

impl FlowBackend for UniformFlow {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn estimate(
        &mut self,
        _reference: &GrayscaleBuffer,
        _current: &GrayscaleBuffer,
        _params: &FlowParams,
        out: &mut FlowField,
    ) -> Result<()> {
        let res = out.resolution();
        for y in 0..res.height {
            for x in 0..res.width {
                out.set(x, y, self.dx, self.dy);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Resolution;

    #[test]
    fn uniform_flow_fills_every_pixel() {
        let res = Resolution::new(5, 4).unwrap();
        let gray = GrayscaleBuffer::new(res);
        let mut flow = FlowField::new(res);
        let mut backend = UniformFlow::new(0.5, 2.0);

        backend
            .estimate(&gray, &gray, &FlowParams::default(), &mut flow)
            .unwrap();

        assert_eq!(flow.dx(4, 3), 0.5);
        assert_eq!(flow.dy(0, 0), 2.0);
    }
}
