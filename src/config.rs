use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::reference::CaptureMode;
use crate::render::Rgba;
use crate::source::resolve_resolution_spec;
use crate::Resolution;

const DEFAULT_DEVICE: &str = "stub://static";
const DEFAULT_RESOLUTION: &str = "480p";
const DEFAULT_FPS: u32 = 30;
const DEFAULT_BACKEND: &str = "cpu";
const DEFAULT_FLOW_STEP: u32 = 16;
const DEFAULT_WINDOW_SIZE: u32 = 15;
const DEFAULT_VECTOR_SCALE: f32 = 1.0;
const DEFAULT_STROKE_COLOR: &str = "#000000";
const DEFAULT_EXPORT_DIR: &str = ".";

const FLOW_STEP_RANGE: (u32, u32) = (2, 64);
const WINDOW_SIZE_RANGE: (u32, u32) = (3, 256);
const VECTOR_SCALE_RANGE: (f32, f32) = (0.1, 5.0);

#[derive(Debug, Deserialize, Default)]
struct FlowscopeConfigFile {
    capture: Option<CaptureConfigFile>,
    flow: Option<FlowConfigFile>,
    overlay: Option<OverlayConfigFile>,
    export: Option<ExportConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    device: Option<String>,
    resolution: Option<String>,
    target_fps: Option<u32>,
    mode: Option<CaptureMode>,
}

#[derive(Debug, Deserialize, Default)]
struct FlowConfigFile {
    backend: Option<String>,
    window_size: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct OverlayConfigFile {
    flow_step: Option<u32>,
    vector_scale: Option<f32>,
    stroke_color: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ExportConfigFile {
    dir: Option<PathBuf>,
}

/// Resolved daemon configuration.
#[derive(Debug, Clone)]
pub struct FlowscopeConfig {
    pub device: String,
    pub resolution: Resolution,
    pub target_fps: u32,
    pub backend: String,
    pub export_dir: PathBuf,
    pub tunables: Tunables,
}

/// Settings adjustable without renegotiating the stream.
#[derive(Debug, Clone)]
pub struct Tunables {
    pub flow_step: u32,
    pub window_size: u32,
    pub vector_scale: f32,
    pub capture_mode: CaptureMode,
    pub stroke_color: Rgba,
}

impl Default for Tunables {
    fn default() -> Self {
        Tunables {
            flow_step: DEFAULT_FLOW_STEP,
            window_size: DEFAULT_WINDOW_SIZE,
            vector_scale: DEFAULT_VECTOR_SCALE,
            capture_mode: CaptureMode::Manual,
            stroke_color: Rgba::BLACK,
        }
    }
}

impl FlowscopeConfig {
    /// Load configuration: JSON file named by FLOWSCOPE_CONFIG, then
    /// FLOWSCOPE_* environment overrides, then range validation.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("FLOWSCOPE_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate();
        Ok(cfg)
    }

    fn from_file(file: FlowscopeConfigFile) -> Result<Self> {
        let device = file
            .capture
            .as_ref()
            .and_then(|c| c.device.clone())
            .unwrap_or_else(|| DEFAULT_DEVICE.to_string());
        let resolution_spec = file
            .capture
            .as_ref()
            .and_then(|c| c.resolution.clone())
            .unwrap_or_else(|| DEFAULT_RESOLUTION.to_string());
        let target_fps = file
            .capture
            .as_ref()
            .and_then(|c| c.target_fps)
            .unwrap_or(DEFAULT_FPS);
        let capture_mode = file
            .capture
            .as_ref()
            .and_then(|c| c.mode)
            .unwrap_or(CaptureMode::Manual);
        let backend = file
            .flow
            .as_ref()
            .and_then(|f| f.backend.clone())
            .unwrap_or_else(|| DEFAULT_BACKEND.to_string());
        let window_size = file
            .flow
            .as_ref()
            .and_then(|f| f.window_size)
            .unwrap_or(DEFAULT_WINDOW_SIZE);
        let flow_step = file
            .overlay
            .as_ref()
            .and_then(|o| o.flow_step)
            .unwrap_or(DEFAULT_FLOW_STEP);
        let vector_scale = file
            .overlay
            .as_ref()
            .and_then(|o| o.vector_scale)
            .unwrap_or(DEFAULT_VECTOR_SCALE);
        let stroke_spec = file
            .overlay
            .as_ref()
            .and_then(|o| o.stroke_color.clone())
            .unwrap_or_else(|| DEFAULT_STROKE_COLOR.to_string());
        let export_dir = file
            .export
            .and_then(|e| e.dir)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_EXPORT_DIR));

        Ok(Self {
            device,
            resolution: resolve_resolution_spec(&resolution_spec)?,
            target_fps,
            backend,
            export_dir,
            tunables: Tunables {
                flow_step,
                window_size,
                vector_scale,
                capture_mode,
                stroke_color: Rgba::parse(&stroke_spec)?,
            },
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(device) = std::env::var("FLOWSCOPE_DEVICE") {
            if !device.trim().is_empty() {
                self.device = device;
            }
        }
        if let Ok(spec) = std::env::var("FLOWSCOPE_RESOLUTION") {
            if !spec.trim().is_empty() {
                self.resolution = resolve_resolution_spec(&spec)?;
            }
        }
        if let Ok(fps) = std::env::var("FLOWSCOPE_FPS") {
            self.target_fps = fps
                .parse()
                .map_err(|_| anyhow!("FLOWSCOPE_FPS must be an integer frame rate"))?;
        }
        if let Ok(mode) = std::env::var("FLOWSCOPE_CAPTURE_MODE") {
            self.tunables.capture_mode = match mode.to_ascii_lowercase().as_str() {
                "manual" => CaptureMode::Manual,
                "continuous" => CaptureMode::Continuous,
                other => {
                    return Err(anyhow!(
                        "FLOWSCOPE_CAPTURE_MODE must be 'manual' or 'continuous', got '{}'",
                        other
                    ))
                }
            };
        }
        if let Ok(color) = std::env::var("FLOWSCOPE_STROKE_COLOR") {
            if !color.trim().is_empty() {
                self.tunables.stroke_color = Rgba::parse(&color)?;
            }
        }
        if let Ok(step) = std::env::var("FLOWSCOPE_FLOW_STEP") {
            self.tunables.flow_step = step
                .parse()
                .map_err(|_| anyhow!("FLOWSCOPE_FLOW_STEP must be an integer pixel stride"))?;
        }
        if let Ok(size) = std::env::var("FLOWSCOPE_WINDOW_SIZE") {
            self.tunables.window_size = size
                .parse()
                .map_err(|_| anyhow!("FLOWSCOPE_WINDOW_SIZE must be an integer"))?;
        }
        if let Ok(scale) = std::env::var("FLOWSCOPE_VECTOR_SCALE") {
            self.tunables.vector_scale = scale
                .parse()
                .map_err(|_| anyhow!("FLOWSCOPE_VECTOR_SCALE must be a number"))?;
        }
        if let Ok(backend) = std::env::var("FLOWSCOPE_BACKEND") {
            if !backend.trim().is_empty() {
                self.backend = backend;
            }
        }
        if let Ok(dir) = std::env::var("FLOWSCOPE_EXPORT_DIR") {
            if !dir.trim().is_empty() {
                self.export_dir = PathBuf::from(dir);
            }
        }
        Ok(())
    }

    /// Clamp tunables into their working ranges, logging each adjustment.
    fn validate(&mut self) {
        self.tunables.clamp_into_range();
        if self.target_fps == 0 {
            log::warn!("target fps 0 adjusted to {}", DEFAULT_FPS);
            self.target_fps = DEFAULT_FPS;
        }
    }
}

impl Tunables {
    pub fn clamp_into_range(&mut self) {
        let step = self.flow_step.clamp(FLOW_STEP_RANGE.0, FLOW_STEP_RANGE.1);
        if step != self.flow_step {
            log::warn!("flow step {} clamped to {}", self.flow_step, step);
            self.flow_step = step;
        }
        let window = self
            .window_size
            .clamp(WINDOW_SIZE_RANGE.0, WINDOW_SIZE_RANGE.1);
        if window != self.window_size {
            log::warn!("window size {} clamped to {}", self.window_size, window);
            self.window_size = window;
        }
        let scale = self
            .vector_scale
            .clamp(VECTOR_SCALE_RANGE.0, VECTOR_SCALE_RANGE.1);
        if scale != self.vector_scale {
            log::warn!("vector scale {} clamped to {}", self.vector_scale, scale);
            self.vector_scale = scale;
        }
    }
}

fn read_config_file(path: &Path) -> Result<FlowscopeConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_shipping_profile() {
        let cfg = FlowscopeConfig::from_file(FlowscopeConfigFile::default()).unwrap();
        assert_eq!(cfg.device, "stub://static");
        assert_eq!(cfg.resolution, Resolution::new(640, 480).unwrap());
        assert_eq!(cfg.target_fps, 30);
        assert_eq!(cfg.backend, "cpu");
        assert_eq!(cfg.tunables.flow_step, 16);
        assert_eq!(cfg.tunables.window_size, 15);
        assert_eq!(cfg.tunables.capture_mode, CaptureMode::Manual);
        assert_eq!(cfg.tunables.stroke_color, Rgba::BLACK);
    }

    #[test]
    fn out_of_range_tunables_are_clamped() {
        let mut tunables = Tunables {
            flow_step: 1,
            window_size: 1000,
            vector_scale: 9.0,
            ..Tunables::default()
        };
        tunables.clamp_into_range();
        assert_eq!(tunables.flow_step, 2);
        assert_eq!(tunables.window_size, 256);
        assert!((tunables.vector_scale - 5.0).abs() < f32::EPSILON);
    }
}
