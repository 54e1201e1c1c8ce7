//! Error taxonomy for block-wise diffusion generation
//!
//! Callers can tell three things apart: the request was misconfigured, the
//! model failed, or this crate broke one of its own invariants.

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, DllmError>;

#[derive(Error, Debug)]
pub enum DllmError {
    /// Rejected before any forward pass
    #[error("invalid generation config: {0}")]
    Config(#[from] ConfigError),

    /// Forward pass failure, passed through untouched
    #[error(transparent)]
    Model(candle_core::Error),

    /// Internal defect; never caused by user input
    #[error("internal invariant violated: {0}")]
    Invariant(#[from] InvariantViolation),

    /// Failure in the crate's own tensor ops on model outputs
    #[error("tensor op failed: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),
}

impl DllmError {
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    pub fn is_invariant(&self) -> bool {
        matches!(self, Self::Invariant(_))
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("gen_length must be > 0")]
    ZeroGenLength,

    #[error("block_length must be > 0")]
    ZeroBlockLength,

    #[error("block_length {block_length} exceeds gen_length {gen_length}")]
    BlockLongerThanGeneration {
        block_length: usize,
        gen_length: usize,
    },

    #[error("threshold {0} is outside [0, 1]")]
    InvalidThreshold(f32),

    #[error("mask_id and eos_id must differ (both {0})")]
    MaskEqualsEos(u32),

    #[error("unknown cache variant '{0}' (expected 'single' or 'dual')")]
    UnknownCacheVariant(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InvariantViolation {
    #[error("block {block} made no progress at step {step} with {masked} masked positions")]
    NoProgress {
        block: usize,
        step: usize,
        masked: usize,
    },

    #[error("block {block} exceeded its step budget of {budget}")]
    StepBudgetExceeded { block: usize, budget: usize },

    #[error("stale cache: built for prefix length {cached}, settled prefix is {settled}")]
    StaleCache { cached: usize, settled: usize },

    #[error("cache covers {actual} positions, expected {expected}")]
    CacheShape { expected: usize, actual: usize },

    #[error("position {position} is outside active block [{start}, {end})")]
    RevealOutsideBlock {
        position: usize,
        start: usize,
        end: usize,
    },

    #[error("position {0} was already resolved")]
    RevealResolved(usize),

    #[error("logits shape {actual:?} does not match expected {expected:?}")]
    LogitsShape {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("{candidates} candidates scored for {masked} masked positions")]
    CandidateCount { masked: usize, candidates: usize },
}
