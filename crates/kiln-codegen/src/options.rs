use serde::{Deserialize, Serialize};

use crate::error::CodegenError;

/// Tunables of the code generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodegenOptions {
    /// Worker threads for generation tasks; 0 lets rayon decide.
    pub num_threads: usize,
    /// Generate a single default state even if the object declares states.
    pub ignore_states: bool,
    /// Run the semantic optimiser on conditions and state roots.
    pub optimize: bool,
    /// Largest image tile edge in pixels; 0 disables tiling.
    pub image_tiling: u32,
}

impl Default for CodegenOptions {
    fn default() -> Self {
        Self {
            num_threads: 0,
            ignore_states: false,
            optimize: true,
            image_tiling: 0,
        }
    }
}

impl CodegenOptions {
    pub fn from_toml_str(source: &str) -> Result<Self, CodegenError> {
        let options: Self = toml::from_str(source)?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), CodegenError> {
        if self.image_tiling > u16::MAX as u32 {
            return Err(CodegenError::InvalidOption {
                field: "image_tiling",
                reason: format!("must be at most {}, got {}", u16::MAX, self.image_tiling),
            });
        }
        Ok(())
    }
}
