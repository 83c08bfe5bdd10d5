mod cpu;
mod stub;

use anyhow::{anyhow, Result};

pub use cpu::BlockMatchFlow;
pub use stub::UniformFlow;

use super::FlowBackend;

/// Resolve a backend by configured name.
pub fn backend_for(name: &str) -> Result<Box<dyn FlowBackend>> {
    match name {
        "cpu" => Ok(Box::new(BlockMatchFlow::default())),
        "stub" => Ok(Box::new(UniformFlow::new(0.0, 0.0))),
        other => Err(anyhow!("unknown flow backend '{}'", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_backends() {
        assert_eq!(backend_for("cpu").unwrap().name(), "cpu");
        assert_eq!(backend_for("stub").unwrap().name(), "stub");
        assert!(backend_for("farneback-gpu").is_err());
    }
}
