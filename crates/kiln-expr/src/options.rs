use serde::{Deserialize, Serialize};

use crate::error::OptionsError;

/// Tunables of the distribution engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributionOptions {
    /// Upper bound on the number of samples in a baked LUT. At least 2.
    pub max_lut_sample_count: usize,
    /// Search for the smallest LUT within `lut_error_threshold` of the full one.
    pub optimize_lut_size: bool,
    /// Absolute per-element error allowed when shrinking a LUT.
    pub lut_error_threshold: f32,
    /// Trim flat leading and trailing regions before baking.
    pub reduce_time_range: bool,
    /// Relative tolerance (floored at 1) used to detect flat regions.
    pub time_range_tolerance: f32,
}

impl Default for DistributionOptions {
    fn default() -> Self {
        Self {
            max_lut_sample_count: 64,
            optimize_lut_size: true,
            lut_error_threshold: 0.01,
            reduce_time_range: true,
            time_range_tolerance: 1.0e-4,
        }
    }
}

impl DistributionOptions {
    pub fn from_toml_str(source: &str) -> Result<Self, OptionsError> {
        let options: Self = toml::from_str(source)?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.max_lut_sample_count < 2 {
            return Err(OptionsError::InvalidValue {
                field: "max_lut_sample_count",
                reason: format!("must be at least 2, got {}", self.max_lut_sample_count),
            });
        }
        if !(self.lut_error_threshold.is_finite() && self.lut_error_threshold >= 0.0) {
            return Err(OptionsError::InvalidValue {
                field: "lut_error_threshold",
                reason: format!("must be a non-negative number, got {}", self.lut_error_threshold),
            });
        }
        if !(self.time_range_tolerance.is_finite() && self.time_range_tolerance >= 0.0) {
            return Err(OptionsError::InvalidValue {
                field: "time_range_tolerance",
                reason: format!("must be a non-negative number, got {}", self.time_range_tolerance),
            });
        }
        Ok(())
    }
}
