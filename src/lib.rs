//! dinfer-rs: block-wise parallel decoding for masked-diffusion language models
//!
//! Generation fills a canvas of mask slots block by block. Each denoising
//! step runs the model once and reveals every masked position whose
//! confidence clears a threshold, so a single forward pass can resolve many
//! tokens. A KV cache keyed to the settled prefix carries work across steps
//! and blocks.

pub mod cache;
pub mod canvas;
pub mod config;
pub mod decoding;
pub mod engine;
pub mod error;
pub mod model;
pub mod tokenizer;

pub use cache::{CacheStore, KvState};
pub use canvas::Canvas;
pub use config::{CacheVariant, GenerationConfig};
pub use decoding::{BlockWiseDiffusionLLM, GenerationOutput, ThresholdParallelDecoder};
pub use engine::{Completion, DllmEngine, Prompt};
pub use error::{ConfigError, DllmError, InvariantViolation};
pub use model::DiffusionModel;
pub use tokenizer::TextCodec;

/// MASK token ID for LLaDA-MoE
pub const MASK_TOKEN_ID: u32 = 156895;

/// EOS token ID for LLaDA-MoE
pub const EOS_TOKEN_ID: u32 = 156892;

pub const DEFAULT_GEN_LENGTH: usize = 128;

/// Default block length; 32 balances parallelism against quality
pub const DEFAULT_BLOCK_LENGTH: usize = 32;

pub const DEFAULT_THRESHOLD: f32 = 0.9;
