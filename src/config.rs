//! Configuration types for try-on jobs

use crate::{
    error::{Result, TryOnError},
    types::GarmentCategory,
};
use serde::{Deserialize, Serialize};
use std::{fmt, ops::RangeInclusive, path::PathBuf, str::FromStr, time::Duration};

/// Refiner strengths that sharpen texture without overwriting structure
pub const REFINER_STRENGTH_RANGE: RangeInclusive<f32> = 0.15..=0.30;

/// Accepted inference step counts
pub const STEPS_RANGE: RangeInclusive<u32> = 1..=150;

/// Accepted working and output resolutions
pub const SIZE_RANGE: RangeInclusive<u32> = 64..=4096;

/// Compute device for the resident models
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Device {
    Cpu,
    /// CUDA device by ordinal
    Cuda(u32),
}

impl Default for Device {
    fn default() -> Self {
        Self::Cuda(0)
    }
}

impl Device {
    #[must_use]
    pub fn is_gpu(self) -> bool {
        matches!(self, Self::Cuda(_))
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
        }
    }
}

impl FromStr for Device {
    type Err = TryOnError;

    fn from_str(s: &str) -> Result<Self> {
        let value = s.trim().to_ascii_lowercase();
        match value.as_str() {
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda(0)),
            _ => value
                .strip_prefix("cuda:")
                .and_then(|ordinal| ordinal.parse().ok())
                .map(Self::Cuda)
                .ok_or_else(|| {
                    TryOnError::invalid_config(format!("unknown device '{s}' (expected cpu or cuda:N)"))
                }),
        }
    }
}

impl TryFrom<String> for Device {
    type Error = TryOnError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Device> for String {
    fn from(device: Device) -> Self {
        device.to_string()
    }
}

/// Numeric precision the models are loaded with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Fp32,
    #[default]
    Fp16,
    Bf16,
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fp32 => write!(f, "fp32"),
            Self::Fp16 => write!(f, "fp16"),
            Self::Bf16 => write!(f, "bf16"),
        }
    }
}

impl FromStr for Precision {
    type Err = TryOnError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fp32" | "float32" => Ok(Self::Fp32),
            "fp16" | "float16" | "half" => Ok(Self::Fp16),
            "bf16" | "bfloat16" => Ok(Self::Bf16),
            _ => Err(TryOnError::invalid_config(format!(
                "unknown precision '{s}' (expected fp32, fp16 or bf16)"
            ))),
        }
    }
}

/// Process-wide configuration for the try-on pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TryOnConfig {
    pub device: Device,
    pub precision: Precision,

    /// Diffusion sampling steps
    pub num_inference_steps: u32,
    pub guidance_scale: f32,
    /// How far the inpainter may depart from the guide composite
    pub inpaint_strength: f32,

    /// Side of the square final composite
    pub output_size: u32,
    /// Side of the square canvas inputs are letterboxed to
    pub working_size: u32,

    pub refiner_enabled: bool,
    /// Must lie inside [`REFINER_STRENGTH_RANGE`]
    pub refiner_strength: f32,

    /// Pixels added around the face box before exclusion
    pub face_mask_padding: u32,
    pub identity_lock_scale: f32,
    /// Identity conditioning and hard face exclusion
    pub face_identity_enabled: bool,

    /// Longest wait for the inference gate
    pub gate_timeout: Duration,
    /// Whole-job deadline, queue wait included
    pub job_timeout: Duration,

    /// Width of the soft mask edge and of the face paste ramp
    pub feather_radius: u32,
    pub closing_radius: u32,
    /// Extra pixels around the garment handed to the inpainter
    pub inpaint_dilation: u32,
    pub min_keypoint_confidence: f32,
    /// Fewer confident keypoints than this skips thin-plate refinement
    pub min_tps_keypoints: usize,
    pub poisson_iterations: u32,
    pub histogram_strength: f32,
    pub seed: u64,

    /// Largest accepted upload per image
    pub max_upload_bytes: usize,
    /// Root of the filesystem result store, inline results when unset
    pub result_dir: Option<PathBuf>,
}

impl Default for TryOnConfig {
    fn default() -> Self {
        Self {
            device: Device::default(),
            precision: Precision::default(),
            num_inference_steps: 30,
            guidance_scale: 7.5,
            inpaint_strength: 0.85,
            output_size: 1024,
            working_size: 1024,
            refiner_enabled: false,
            refiner_strength: 0.2,
            face_mask_padding: 30,
            identity_lock_scale: 0.8,
            face_identity_enabled: true,
            gate_timeout: Duration::from_secs(30),
            job_timeout: Duration::from_secs(120),
            feather_radius: 6,
            closing_radius: 2,
            inpaint_dilation: 10,
            min_keypoint_confidence: 0.3,
            min_tps_keypoints: 4,
            poisson_iterations: 400,
            histogram_strength: 1.0,
            seed: 42,
            max_upload_bytes: 20 * 1024 * 1024,
            result_dir: None,
        }
    }
}

impl TryOnConfig {
    /// Create a new configuration builder
    ///
    /// ```rust
    /// use tryon_compose::TryOnConfig;
    ///
    /// let config = TryOnConfig::builder()
    ///     .num_inference_steps(20)
    ///     .refiner(true, 0.2)
    ///     .build()
    ///     .unwrap();
    /// assert!(config.refiner_enabled);
    /// ```
    #[must_use]
    pub fn builder() -> TryOnConfigBuilder {
        TryOnConfigBuilder::default()
    }

    /// Load from `TRYON_*` environment variables, reading `.env` first when present
    ///
    /// Unset variables keep their defaults; a malformed value is an error.
    pub fn from_env() -> Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!(path = %path.display(), "loaded .env");
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let env = EnvReader { lookup: &lookup };

        if let Some(device) = env.parsed::<Device>("TRYON_DEVICE")? {
            config.device = device;
        }
        if let Some(precision) = env.parsed::<Precision>("TRYON_PRECISION")? {
            config.precision = precision;
        }
        if let Some(steps) = env.parsed("TRYON_STEPS")? {
            config.num_inference_steps = steps;
        }
        if let Some(size) = env.parsed("TRYON_OUTPUT_SIZE")? {
            config.output_size = size;
        }
        if let Some(enabled) = env.flag("TRYON_REFINER_ENABLED")? {
            config.refiner_enabled = enabled;
        }
        if let Some(strength) = env.parsed("TRYON_REFINER_STRENGTH")? {
            config.refiner_strength = strength;
        }
        if let Some(padding) = env.parsed("TRYON_FACE_MASK_PADDING")? {
            config.face_mask_padding = padding;
        }
        if let Some(scale) = env.parsed("TRYON_IDENTITY_LOCK_SCALE")? {
            config.identity_lock_scale = scale;
        }
        if let Some(enabled) = env.flag("TRYON_FACE_IDENTITY_ENABLED")? {
            config.face_identity_enabled = enabled;
        }
        if let Some(secs) = env.parsed::<u64>("TRYON_GATE_TIMEOUT_SECS")? {
            config.gate_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env.parsed::<u64>("TRYON_JOB_TIMEOUT_SECS")? {
            config.job_timeout = Duration::from_secs(secs);
        }
        if let Some(dir) = env.raw("TRYON_RESULT_DIR") {
            config.result_dir = Some(PathBuf::from(dir));
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration parameters
    ///
    /// # Validation Rules
    ///
    /// - Refiner strength: 0.15-0.30, checked even when the refiner is off
    /// - Inference steps: 1-150
    /// - Output and working size: 64-4096
    /// - Strengths and confidences: 0.0-1.0, identity lock scale 0.0-2.0
    /// - Timeouts: non-zero
    pub fn validate(&self) -> Result<()> {
        if !REFINER_STRENGTH_RANGE.contains(&self.refiner_strength) {
            return Err(TryOnError::config_value_error(
                "refiner_strength",
                self.refiner_strength,
                "0.15-0.30",
            ));
        }
        if !STEPS_RANGE.contains(&self.num_inference_steps) {
            return Err(TryOnError::config_value_error(
                "num_inference_steps",
                self.num_inference_steps,
                "1-150",
            ));
        }
        for (name, size) in [
            ("output_size", self.output_size),
            ("working_size", self.working_size),
        ] {
            if !SIZE_RANGE.contains(&size) {
                return Err(TryOnError::config_value_error(name, size, "64-4096"));
            }
        }
        for (name, value) in [
            ("inpaint_strength", self.inpaint_strength),
            ("histogram_strength", self.histogram_strength),
            ("min_keypoint_confidence", self.min_keypoint_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(TryOnError::config_value_error(name, value, "0.0-1.0"));
            }
        }
        if !(0.0..=2.0).contains(&self.identity_lock_scale) {
            return Err(TryOnError::config_value_error(
                "identity_lock_scale",
                self.identity_lock_scale,
                "0.0-2.0",
            ));
        }
        if !(self.guidance_scale.is_finite() && self.guidance_scale >= 1.0) {
            return Err(TryOnError::config_value_error(
                "guidance_scale",
                self.guidance_scale,
                ">= 1.0",
            ));
        }
        if self.gate_timeout.is_zero() || self.job_timeout.is_zero() {
            return Err(TryOnError::invalid_config("timeouts must be non-zero"));
        }
        if self.min_tps_keypoints < 3 {
            return Err(TryOnError::config_value_error(
                "min_tps_keypoints",
                self.min_tps_keypoints,
                ">= 3",
            ));
        }
        if self.max_upload_bytes == 0 {
            return Err(TryOnError::invalid_config("max_upload_bytes must be non-zero"));
        }
        Ok(())
    }

    /// Merge per-job overrides over this configuration and validate the result
    pub fn for_job(&self, options: &JobOptions) -> Result<Self> {
        let mut merged = self.clone();
        if let Some(steps) = options.num_inference_steps {
            merged.num_inference_steps = steps;
        }
        if let Some(enabled) = options.refiner_enabled {
            merged.refiner_enabled = enabled;
        }
        if let Some(strength) = options.refiner_strength {
            merged.refiner_strength = strength;
        }
        if let Some(enabled) = options.face_identity_enabled {
            merged.face_identity_enabled = enabled;
        }
        merged.validate()?;
        Ok(merged)
    }
}

struct EnvReader<'a, F> {
    lookup: &'a F,
}

impl<F> EnvReader<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    fn parsed<T: FromStr>(&self, key: &str) -> Result<Option<T>> {
        self.raw(key)
            .map(|value| {
                value.trim().parse::<T>().map_err(|_| {
                    TryOnError::invalid_config(format!("{key}: cannot parse '{value}'"))
                })
            })
            .transpose()
    }

    fn flag(&self, key: &str) -> Result<Option<bool>> {
        self.raw(key)
            .map(|value| match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(TryOnError::invalid_config(format!(
                    "{key}: expected a boolean, got '{value}'"
                ))),
            })
            .transpose()
    }
}

/// Builder for `TryOnConfig`
#[derive(Debug, Default)]
pub struct TryOnConfigBuilder {
    config: TryOnConfig,
}

impl TryOnConfigBuilder {
    #[must_use]
    pub fn device(mut self, device: Device) -> Self {
        self.config.device = device;
        self
    }

    #[must_use]
    pub fn precision(mut self, precision: Precision) -> Self {
        self.config.precision = precision;
        self
    }

    #[must_use]
    pub fn num_inference_steps(mut self, steps: u32) -> Self {
        self.config.num_inference_steps = steps;
        self
    }

    #[must_use]
    pub fn guidance_scale(mut self, scale: f32) -> Self {
        self.config.guidance_scale = scale;
        self
    }

    #[must_use]
    pub fn inpaint_strength(mut self, strength: f32) -> Self {
        self.config.inpaint_strength = strength;
        self
    }

    #[must_use]
    pub fn output_size(mut self, size: u32) -> Self {
        self.config.output_size = size;
        self
    }

    #[must_use]
    pub fn working_size(mut self, size: u32) -> Self {
        self.config.working_size = size;
        self
    }

    /// Enable or disable the refiner and set its strength
    #[must_use]
    pub fn refiner(mut self, enabled: bool, strength: f32) -> Self {
        self.config.refiner_enabled = enabled;
        self.config.refiner_strength = strength;
        self
    }

    #[must_use]
    pub fn face_mask_padding(mut self, padding: u32) -> Self {
        self.config.face_mask_padding = padding;
        self
    }

    #[must_use]
    pub fn identity_lock_scale(mut self, scale: f32) -> Self {
        self.config.identity_lock_scale = scale;
        self
    }

    #[must_use]
    pub fn face_identity_enabled(mut self, enabled: bool) -> Self {
        self.config.face_identity_enabled = enabled;
        self
    }

    #[must_use]
    pub fn gate_timeout(mut self, timeout: Duration) -> Self {
        self.config.gate_timeout = timeout;
        self
    }

    #[must_use]
    pub fn job_timeout(mut self, timeout: Duration) -> Self {
        self.config.job_timeout = timeout;
        self
    }

    #[must_use]
    pub fn feather_radius(mut self, radius: u32) -> Self {
        self.config.feather_radius = radius;
        self
    }

    #[must_use]
    pub fn closing_radius(mut self, radius: u32) -> Self {
        self.config.closing_radius = radius;
        self
    }

    #[must_use]
    pub fn inpaint_dilation(mut self, pixels: u32) -> Self {
        self.config.inpaint_dilation = pixels;
        self
    }

    #[must_use]
    pub fn min_keypoint_confidence(mut self, confidence: f32) -> Self {
        self.config.min_keypoint_confidence = confidence;
        self
    }

    #[must_use]
    pub fn min_tps_keypoints(mut self, count: usize) -> Self {
        self.config.min_tps_keypoints = count;
        self
    }

    #[must_use]
    pub fn poisson_iterations(mut self, iterations: u32) -> Self {
        self.config.poisson_iterations = iterations;
        self
    }

    #[must_use]
    pub fn histogram_strength(mut self, strength: f32) -> Self {
        self.config.histogram_strength = strength;
        self
    }

    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = seed;
        self
    }

    #[must_use]
    pub fn max_upload_bytes(mut self, bytes: usize) -> Self {
        self.config.max_upload_bytes = bytes;
        self
    }

    #[must_use]
    pub fn result_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.config.result_dir = Some(dir.into());
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<TryOnConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Per-job overrides supplied with a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    pub category: GarmentCategory,
    pub num_inference_steps: Option<u32>,
    pub refiner_enabled: Option<bool>,
    pub refiner_strength: Option<f32>,
    pub face_identity_enabled: Option<bool>,
}

impl JobOptions {
    #[must_use]
    pub fn new(category: GarmentCategory) -> Self {
        Self {
            category,
            num_inference_steps: None,
            refiner_enabled: None,
            refiner_strength: None,
            face_identity_enabled: None,
        }
    }

    #[must_use]
    pub fn num_inference_steps(mut self, steps: u32) -> Self {
        self.num_inference_steps = Some(steps);
        self
    }

    /// Enable the refiner at `strength`
    #[must_use]
    pub fn refiner(mut self, strength: f32) -> Self {
        self.refiner_enabled = Some(true);
        self.refiner_strength = Some(strength);
        self
    }

    #[must_use]
    pub fn without_refiner(mut self) -> Self {
        self.refiner_enabled = Some(false);
        self
    }

    #[must_use]
    pub fn face_identity_enabled(mut self, enabled: bool) -> Self {
        self.face_identity_enabled = Some(enabled);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = TryOnConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.num_inference_steps, 30);
        assert_eq!(config.output_size, 1024);
        assert_eq!(config.face_mask_padding, 30);
        assert!((config.refiner_strength - 0.2).abs() < f32::EPSILON);
    }

    #[test]
    fn test_refiner_strength_outside_safe_range_is_rejected() {
        let err = TryOnConfig::builder().refiner(true, 0.5).build().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
        assert!(err.to_string().contains("refiner_strength"));

        assert!(TryOnConfig::builder().refiner(true, 0.15).build().is_ok());
        assert!(TryOnConfig::builder().refiner(true, 0.30).build().is_ok());
        assert!(TryOnConfig::builder().refiner(true, 0.1).build().is_err());
    }

    #[test]
    fn test_steps_and_sizes_validated() {
        assert!(TryOnConfig::builder().num_inference_steps(0).build().is_err());
        assert!(TryOnConfig::builder().num_inference_steps(151).build().is_err());
        assert!(TryOnConfig::builder().output_size(32).build().is_err());
        assert!(TryOnConfig::builder().working_size(8192).build().is_err());
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        assert!(TryOnConfig::builder()
            .gate_timeout(Duration::ZERO)
            .build()
            .is_err());
    }

    #[test]
    fn test_device_parsing() {
        assert_eq!("cpu".parse::<Device>().unwrap(), Device::Cpu);
        assert_eq!("CUDA".parse::<Device>().unwrap(), Device::Cuda(0));
        assert_eq!("cuda:2".parse::<Device>().unwrap(), Device::Cuda(2));
        assert!("tpu".parse::<Device>().is_err());
        assert_eq!(Device::Cuda(1).to_string(), "cuda:1");
    }

    #[test]
    fn test_device_serde_as_string() {
        let json = serde_json::to_string(&Device::Cuda(3)).unwrap();
        assert_eq!(json, "\"cuda:3\"");
        let back: Device = serde_json::from_str("\"cpu\"").unwrap();
        assert_eq!(back, Device::Cpu);
    }

    #[test]
    fn test_from_lookup_reads_variables() {
        let config = TryOnConfig::from_lookup(lookup(&[
            ("TRYON_DEVICE", "cpu"),
            ("TRYON_PRECISION", "fp32"),
            ("TRYON_STEPS", "20"),
            ("TRYON_REFINER_ENABLED", "yes"),
            ("TRYON_REFINER_STRENGTH", "0.25"),
            ("TRYON_FACE_IDENTITY_ENABLED", "0"),
            ("TRYON_GATE_TIMEOUT_SECS", "5"),
            ("TRYON_RESULT_DIR", "/tmp/results"),
        ]))
        .unwrap();

        assert_eq!(config.device, Device::Cpu);
        assert_eq!(config.precision, Precision::Fp32);
        assert_eq!(config.num_inference_steps, 20);
        assert!(config.refiner_enabled);
        assert!(!config.face_identity_enabled);
        assert_eq!(config.gate_timeout, Duration::from_secs(5));
        assert_eq!(config.result_dir, Some(PathBuf::from("/tmp/results")));
    }

    #[test]
    fn test_from_lookup_rejects_malformed_values() {
        let err = TryOnConfig::from_lookup(lookup(&[("TRYON_STEPS", "many")])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
        assert!(err.to_string().contains("TRYON_STEPS"));

        let err =
            TryOnConfig::from_lookup(lookup(&[("TRYON_REFINER_ENABLED", "maybe")])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);

        let err =
            TryOnConfig::from_lookup(lookup(&[("TRYON_REFINER_STRENGTH", "0.5")])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    }

    #[test]
    fn test_job_options_are_merged_and_validated() {
        let base = TryOnConfig::default();
        let merged = base
            .for_job(&JobOptions::new(GarmentCategory::Upper).num_inference_steps(12).refiner(0.2))
            .unwrap();
        assert_eq!(merged.num_inference_steps, 12);
        assert!(merged.refiner_enabled);

        let err = base
            .for_job(&JobOptions::new(GarmentCategory::Upper).refiner(0.5))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    }
}
