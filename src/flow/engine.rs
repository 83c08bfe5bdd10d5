use anyhow::Result;

use crate::buffer::{FlowField, GrayscaleBuffer};

/// Parameters of the dense-flow call contract.
///
/// The defaults are the tuning the pipeline has always run with: a 15 px
/// window over a 3-level pyramid at scale 0.5, 3 iterations, polynomial
/// expansion of 5 with sigma 1.2. Backends are free to ignore parameters
/// that do not apply to their formulation, but the window size and its
/// parity rule are normative.
#[derive(Clone, Copy, Debug)]
pub struct FlowParams {
    pub window_size: u32,
    pub pyramid_scale: f64,
    pub pyramid_levels: u32,
    pub iterations: u32,
    pub poly_expansion_size: u32,
    pub poly_sigma: f64,
}

impl Default for FlowParams {
    fn default() -> Self {
        Self {
            window_size: 15,
            pyramid_scale: 0.5,
            pyramid_levels: 3,
            iterations: 3,
            poly_expansion_size: 5,
            poly_sigma: 1.2,
        }
    }
}

/// Parity correction: an even configured window size is incremented by one
/// before every invocation. Applied per call, never cached, so a tunable
/// changed mid-stream takes effect on the next frame.
pub fn effective_window_size(configured: u32) -> u32 {
    if configured % 2 == 0 {
        configured + 1
    } else {
        configured
    }
}

/// Dense-flow estimator backend.
///
/// Implementations receive two grayscale frames of identical resolution
/// (enforced upstream by the reference-frame manager) and fill `out` with
/// one (dx, dy) pair per pixel, in pixel units, measuring the apparent
/// displacement from `reference` to `current`.
pub trait FlowBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Estimate the dense flow field. `params.window_size` is already
    /// parity-corrected when the engine calls this.
    fn estimate(
        &mut self,
        reference: &GrayscaleBuffer,
        current: &GrayscaleBuffer,
        params: &FlowParams,
        out: &mut FlowField,
    ) -> Result<()>;
}

/// Stateless wrapper invoking the external dense-flow capability.
pub struct FlowEngine {
    backend: Box<dyn FlowBackend>,
}

impl FlowEngine {
    pub fn new(backend: Box<dyn FlowBackend>) -> Self {
        Self { backend }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Compute the flow field for one frame pair.
    ///
    /// Precondition (caller responsibility, checked upstream): `reference`,
    /// `current` and `out` share one resolution.
    pub fn compute(
        &mut self,
        reference: &GrayscaleBuffer,
        current: &GrayscaleBuffer,
        params: &FlowParams,
        out: &mut FlowField,
    ) -> Result<()> {
        debug_assert_eq!(reference.resolution(), current.resolution());
        debug_assert_eq!(current.resolution(), out.resolution());

        let effective = FlowParams {
            window_size: effective_window_size(params.window_size),
            ..*params
        };
        self.backend.estimate(reference, current, &effective, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::backends::UniformFlow;
    use crate::Resolution;

    #[test]
    fn window_size_parity_correction() {
        assert_eq!(effective_window_size(16), 17);
        assert_eq!(effective_window_size(15), 15);
        assert_eq!(effective_window_size(3), 3);
    }

    #[test]
    fn engine_corrects_parity_on_every_call() {
        use std::sync::{Arc, Mutex};

        struct WindowProbe {
            seen: Arc<Mutex<Vec<u32>>>,
        }
        impl FlowBackend for WindowProbe {
            fn name(&self) -> &'static str {
                "probe"
            }
            fn estimate(
                &mut self,
                _reference: &GrayscaleBuffer,
                _current: &GrayscaleBuffer,
                params: &FlowParams,
                _out: &mut FlowField,
            ) -> Result<()> {
                self.seen.lock().unwrap().push(params.window_size);
                Ok(())
            }
        }

        let res = Resolution::new(8, 8).unwrap();
        let gray = GrayscaleBuffer::new(res);
        let mut flow = FlowField::new(res);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut engine = FlowEngine::new(Box::new(WindowProbe { seen: seen.clone() }));

        for configured in [16, 15, 3, 42] {
            let params = FlowParams {
                window_size: configured,
                ..FlowParams::default()
            };
            engine.compute(&gray, &gray, &params, &mut flow).unwrap();
        }

        assert_eq!(*seen.lock().unwrap(), vec![17, 15, 3, 43]);
    }

    #[test]
    fn engine_fills_output_via_backend() {
        let res = Resolution::new(4, 3).unwrap();
        let gray = GrayscaleBuffer::new(res);
        let mut flow = FlowField::new(res);
        let mut engine = FlowEngine::new(Box::new(UniformFlow::new(2.0, -1.0)));

        engine
            .compute(&gray, &gray, &FlowParams::default(), &mut flow)
            .unwrap();

        assert_eq!(flow.dx(3, 2), 2.0);
        assert_eq!(flow.dy(0, 0), -1.0);
    }
}
