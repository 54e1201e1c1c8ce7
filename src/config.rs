//! Generation request configuration

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::{DEFAULT_BLOCK_LENGTH, DEFAULT_GEN_LENGTH, DEFAULT_THRESHOLD, EOS_TOKEN_ID, MASK_TOKEN_ID};

/// Which KV cache layout the Cache Store uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheVariant {
    /// One cache; settled prefix + active block fed on every call
    Single,
    /// Settled-prefix cache plus active-block cache; only the block is fed
    #[default]
    Dual,
}

impl FromStr for CacheVariant {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "single" => Ok(Self::Single),
            "dual" => Ok(Self::Dual),
            other => Err(ConfigError::UnknownCacheVariant(other.to_string())),
        }
    }
}

impl fmt::Display for CacheVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single => f.write_str("single"),
            Self::Dual => f.write_str("dual"),
        }
    }
}

/// Per-request generation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Number of masked slots appended after the prompt
    pub gen_length: usize,

    /// Positions denoised together before advancing
    pub block_length: usize,

    /// Minimum confidence for a position to be revealed in parallel
    pub threshold: f32,

    /// Sentinel for unresolved slots
    pub mask_id: u32,

    pub eos_id: u32,

    pub cache_variant: CacheVariant,

    /// Stop after the block that reveals `eos_id`
    pub early_stop: bool,

    /// Extend the settled-prefix cache across blocks instead of rebuilding it.
    /// Only meaningful for the dual variant.
    pub reuse_prefix_cache: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            gen_length: DEFAULT_GEN_LENGTH,
            block_length: DEFAULT_BLOCK_LENGTH,
            threshold: DEFAULT_THRESHOLD,
            mask_id: MASK_TOKEN_ID,
            eos_id: EOS_TOKEN_ID,
            cache_variant: CacheVariant::Dual,
            early_stop: true,
            reuse_prefix_cache: true,
        }
    }
}

impl GenerationConfig {
    /// Load configuration from JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        use anyhow::Context;

        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the settings before any forward pass runs
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gen_length == 0 {
            return Err(ConfigError::ZeroGenLength);
        }
        if self.block_length == 0 {
            return Err(ConfigError::ZeroBlockLength);
        }
        if self.block_length > self.gen_length {
            return Err(ConfigError::BlockLongerThanGeneration {
                block_length: self.block_length,
                gen_length: self.gen_length,
            });
        }
        if !(0.0..=1.0).contains(&self.threshold) {
            // NaN fails the range check too
            return Err(ConfigError::InvalidThreshold(self.threshold));
        }
        if self.mask_id == self.eos_id {
            return Err(ConfigError::MaskEqualsEos(self.mask_id));
        }
        Ok(())
    }

    /// Number of blocks the generation region splits into
    pub fn num_blocks(&self) -> usize {
        self.gen_length.div_ceil(self.block_length)
    }
}
