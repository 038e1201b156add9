use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::{Error, Result};

/// Inference device for the feature extractor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Cuda,
    Cpu,
}

/// Settings of a [`crate::TrackingSession`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Path to the ONNX export of the feature extractor.
    #[serde(default = "model_default")]
    pub model: String,
    /// Working square resolution fed to the feature extractor.
    #[serde(default = "side_default")]
    pub side: i32,
    /// Patch size of the vision transformer.
    #[serde(default = "patch_size_default")]
    pub patch_size: i32,
    /// Number of `track` calls between full re-embedding matches.
    #[serde(default = "stride_default")]
    pub stride: u64,
    /// Smoothing window length, `0` selects exponential smoothing.
    #[serde(default = "window_default")]
    pub window: usize,
    /// Exponential smoothing factor.
    #[serde(default = "alpha_default")]
    pub alpha: f32,
    #[serde(default)]
    pub device: Device,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            model: model_default(),
            side: side_default(),
            patch_size: patch_size_default(),
            stride: stride_default(),
            window: window_default(),
            alpha: alpha_default(),
            device: Device::default(),
        }
    }
}

impl TrackerConfig {
    /// Reads a JSON configuration from `path`, filling missing fields with defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        let config = serde_json::from_str::<TrackerConfig>(&json)?;
        config.validate()?;
        Ok(config)
    }

    /// Writes this configuration as pretty JSON to `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.side <= 0 || self.patch_size <= 0 {
            return Err(Error::Config(format!(
                "side {} and patch size {} must be positive",
                self.side, self.patch_size
            )));
        }
        if self.side % self.patch_size != 0 {
            return Err(Error::Config(format!(
                "side {} is not a multiple of patch size {}",
                self.side, self.patch_size
            )));
        }
        if self.stride == 0 {
            return Err(Error::Config("stride must be at least 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.alpha) {
            return Err(Error::Config(format!(
                "alpha {} is outside of [0, 1]",
                self.alpha
            )));
        }
        Ok(())
    }
}

fn model_default() -> String {
    "models/dino_vits8.onnx".to_string()
}

fn side_default() -> i32 {
    336
}

fn patch_size_default() -> i32 {
    8
}

fn stride_default() -> u64 {
    3
}

fn window_default() -> usize {
    2
}

fn alpha_default() -> f32 {
    0.3
}

#[cfg(test)]
mod tests {
    use std::{env, str::FromStr};

    use super::*;

    #[test]
    fn default_is_valid() {
        let config = TrackerConfig::default();

        assert!(config.validate().is_ok());
        assert_eq!(config.side, 336);
        assert_eq!(config.patch_size, 8);
        assert_eq!(config.stride, 3);
        assert_eq!(config.window, 2);
        assert_eq!(config.device, Device::Cuda);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config =
            serde_json::from_str::<TrackerConfig>(r#"{ "side": 224, "device": "cpu" }"#).unwrap();

        assert_eq!(config.side, 224);
        assert_eq!(config.device, Device::Cpu);
        assert_eq!(config.stride, 3);
        assert_eq!(config.alpha, 0.3);
    }

    #[test]
    fn save_then_load() {
        let path = env::temp_dir().join(format!("tracker-config-{}.json", std::process::id()));
        let config = TrackerConfig {
            window: 0,
            alpha: 0.75,
            ..TrackerConfig::default()
        };

        config.save(&path).unwrap();
        let loaded = TrackerConfig::load(&path).unwrap();
        let _ = fs::remove_file(&path);

        assert_eq!(loaded, config);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let bad = [
            TrackerConfig {
                side: 100,
                patch_size: 8,
                ..TrackerConfig::default()
            },
            TrackerConfig {
                stride: 0,
                ..TrackerConfig::default()
            },
            TrackerConfig {
                alpha: 1.5,
                ..TrackerConfig::default()
            },
            TrackerConfig {
                patch_size: 0,
                ..TrackerConfig::default()
            },
        ];

        for config in bad {
            assert!(matches!(config.validate(), Err(Error::Config(_))));
        }
    }

    #[test]
    fn device_from_str() {
        assert_eq!(Device::from_str("CPU").unwrap(), Device::Cpu);
        assert_eq!(Device::from_str("cuda").unwrap(), Device::Cuda);
        assert_eq!(Device::Cpu.to_string(), "cpu");
    }
}
