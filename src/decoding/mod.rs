//! Block-wise parallel decoding
//!
//! - `blocks`: partitions the generation region into spans
//! - `scoring`: confidence per masked position
//! - `threshold`: which masked positions a step reveals
//! - `generate`: the per-request state machine tying them together

pub mod blocks;
pub mod generate;
pub mod scoring;
pub mod threshold;

pub use blocks::{BlockIterator, BlockIteratorFactory, BlockSpan};
pub use generate::{BlockStats, BlockWiseDiffusionLLM, FinishReason, GenerationOutput, GenerationStats};
pub use scoring::{Candidate, ConfidenceScorer, MaxProbability};
pub use threshold::{DecodeDecision, Reveal, ThresholdParallelDecoder};
