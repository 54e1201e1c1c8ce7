//! Block-wise diffusion generation
//!
//! Per request the engine walks an explicit state machine:
//!
//! ```text
//! AwaitingBlock -> Denoising -> BlockComplete -> AwaitingBlock | Done
//! ```
//!
//! Blocks are strictly sequential: a block is denoised until every slot is
//! resolved (or early stop fires) before the next span is pulled. Within a
//! block, each step is one forward pass followed by one threshold decision.

use candle_core::Tensor;

use crate::cache::{CacheEvent, CacheStore};
use crate::canvas::Canvas;
use crate::config::{CacheVariant, GenerationConfig};
use crate::decoding::blocks::{BlockIteratorFactory, BlockSpan};
use crate::decoding::scoring::{ConfidenceScorer, MaxProbability};
use crate::decoding::threshold::ThresholdParallelDecoder;
use crate::error::{ConfigError, InvariantViolation, Result};
use crate::model::DiffusionModel;

/// Why generation stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// Every block resolved
    Length,
    /// Early stop after the block that revealed end-of-sequence
    EndOfSequence,
}

/// Statistics from one block
#[derive(Debug, Clone, PartialEq)]
pub struct BlockStats {
    pub index: usize,
    pub start: usize,
    pub end: usize,
    pub steps: usize,
    pub tokens_generated: usize,
    pub avg_confidence: f32,
    /// Settled-prefix cache was reused or extended instead of rebuilt
    pub prefix_reused: bool,
}

/// Statistics from a whole request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationStats {
    pub blocks: Vec<BlockStats>,
    /// Model invocations, including prefix caching
    pub forward_calls: usize,
    pub cache_rebuilds: usize,
}

impl GenerationStats {
    pub fn total_steps(&self) -> usize {
        self.blocks.iter().map(|b| b.steps).sum()
    }

    pub fn tokens_generated(&self) -> usize {
        self.blocks.iter().map(|b| b.tokens_generated).sum()
    }

    /// Average parallelism; 1.0 means autoregressive pace
    pub fn tokens_per_step(&self) -> f32 {
        let steps = self.total_steps();
        if steps == 0 {
            0.0
        } else {
            self.tokens_generated() as f32 / steps as f32
        }
    }
}

/// Result of one generation request
#[derive(Debug, Clone)]
pub struct GenerationOutput {
    /// Prompt tokens as fed in
    pub prompt: Vec<u32>,
    /// Generation region, truncated at the first end-of-sequence token when
    /// early stop fired
    pub tokens: Vec<u32>,
    pub finish_reason: FinishReason,
    pub stats: GenerationStats,
}

impl GenerationOutput {
    /// Prompt followed by generated tokens
    pub fn sequence(&self) -> Vec<u32> {
        let mut ids = self.prompt.clone();
        ids.extend_from_slice(&self.tokens);
        ids
    }
}

/// Block being denoised
struct ActiveBlock {
    span: BlockSpan,
    steps: usize,
    tokens_generated: usize,
    confidence_sum: f32,
    prefix_reused: bool,
}

impl ActiveBlock {
    fn new(span: BlockSpan, event: CacheEvent) -> Self {
        Self {
            span,
            steps: 0,
            tokens_generated: 0,
            confidence_sum: 0.0,
            prefix_reused: matches!(event, CacheEvent::Reused | CacheEvent::Extended { .. }),
        }
    }

    fn into_stats(self) -> BlockStats {
        let avg_confidence = if self.tokens_generated > 0 {
            self.confidence_sum / self.tokens_generated as f32
        } else {
            0.0
        };
        BlockStats {
            index: self.span.index,
            start: self.span.start,
            end: self.span.end,
            steps: self.steps,
            tokens_generated: self.tokens_generated,
            avg_confidence,
            prefix_reused: self.prefix_reused,
        }
    }
}

enum State {
    AwaitingBlock,
    Denoising(ActiveBlock),
    BlockComplete {
        block: ActiveBlock,
        eos_position: Option<usize>,
    },
    Done(FinishReason),
}

/// Blocks of mask slots denoised in parallel, one threshold step at a time
pub struct BlockWiseDiffusionLLM<M, S = MaxProbability> {
    model: M,
    decoder: ThresholdParallelDecoder,
    scorer: S,
    blocks: BlockIteratorFactory,
    cache_variant: CacheVariant,
    early_stop: bool,
}

impl<M: DiffusionModel> BlockWiseDiffusionLLM<M, MaxProbability> {
    pub fn new(
        model: M,
        decoder: ThresholdParallelDecoder,
        blocks: BlockIteratorFactory,
        cache_variant: CacheVariant,
        early_stop: bool,
    ) -> Self {
        let scorer = MaxProbability::suppressing(decoder.mask_id());
        Self {
            model,
            decoder,
            scorer,
            blocks,
            cache_variant,
            early_stop,
        }
    }

    /// Build from a validated config
    pub fn from_config(model: M, config: &GenerationConfig) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::new(
            model,
            ThresholdParallelDecoder::new(config.threshold, config.mask_id, config.eos_id),
            BlockIteratorFactory::new(config.reuse_prefix_cache),
            config.cache_variant,
            config.early_stop,
        ))
    }
}

impl<M: DiffusionModel, S: ConfidenceScorer> BlockWiseDiffusionLLM<M, S> {
    /// Swap the confidence strategy
    pub fn with_scorer<T: ConfidenceScorer>(self, scorer: T) -> BlockWiseDiffusionLLM<M, T> {
        BlockWiseDiffusionLLM {
            model: self.model,
            decoder: self.decoder,
            scorer,
            blocks: self.blocks,
            cache_variant: self.cache_variant,
            early_stop: self.early_stop,
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn decoder(&self) -> &ThresholdParallelDecoder {
        &self.decoder
    }

    /// Fill `gen_length` mask slots after `prompt`, `block_length` at a time
    pub fn generate(
        &self,
        prompt: &[u32],
        gen_length: usize,
        block_length: usize,
    ) -> Result<GenerationOutput> {
        let mut blocks = self.blocks.create(gen_length, block_length)?;
        let mut canvas = Canvas::new(prompt, gen_length, self.decoder.mask_id());
        let mut cache = CacheStore::new(self.cache_variant);
        let mut stats = GenerationStats::default();

        tracing::info!(
            "Generating {} tokens in {} blocks (prompt={}, threshold={}, cache={}, early_stop={})",
            gen_length,
            blocks.len(),
            prompt.len(),
            self.decoder.threshold(),
            self.cache_variant,
            self.early_stop
        );

        let mut state = State::AwaitingBlock;
        let finish_reason = loop {
            state = match state {
                State::AwaitingBlock => match blocks.next() {
                    None => State::Done(FinishReason::Length),
                    Some(span) => {
                        let event = cache.begin_block(&self.model, &canvas, &span)?;
                        match event {
                            CacheEvent::Extended { .. } => stats.forward_calls += 1,
                            CacheEvent::Rebuilt { .. } => {
                                stats.forward_calls += 1;
                                stats.cache_rebuilds += 1;
                            }
                            _ => {}
                        }
                        tracing::debug!(
                            "Block {} [{}, {}) start: cache {:?}",
                            span.index,
                            span.start,
                            span.end,
                            event
                        );
                        State::Denoising(ActiveBlock::new(span, event))
                    }
                },
                State::Denoising(mut block) => {
                    self.step(&mut cache, &mut canvas, &mut block)?;
                    stats.forward_calls += 1;

                    // EOS revealed in an earlier step counts once the slots
                    // before it are resolved
                    let eos_position = if self.early_stop {
                        canvas.settled_eos_in(&block.span, self.decoder.eos_id())
                    } else {
                        None
                    };

                    if eos_position.is_some() || canvas.masked_in(&block.span).is_empty() {
                        State::BlockComplete { block, eos_position }
                    } else {
                        State::Denoising(block)
                    }
                }
                State::BlockComplete { block, eos_position } => {
                    cache.finish_block(&block.span);
                    let block_stats = block.into_stats();
                    tracing::debug!(
                        "Block {} done: {} tokens in {} steps (avg confidence {:.3})",
                        block_stats.index,
                        block_stats.tokens_generated,
                        block_stats.steps,
                        block_stats.avg_confidence
                    );
                    stats.blocks.push(block_stats);

                    match eos_position {
                        Some(position) => {
                            tracing::debug!("End of sequence at position {}, stopping early", position);
                            State::Done(FinishReason::EndOfSequence)
                        }
                        None => State::AwaitingBlock,
                    }
                }
                State::Done(reason) => break reason,
            };
        };

        let mut tokens = canvas.generated().to_vec();
        if finish_reason == FinishReason::EndOfSequence {
            if let Some(eos) = canvas.first_eos(self.decoder.eos_id()) {
                tokens.truncate(eos);
            }
        }

        tracing::info!(
            "Generated {} tokens in {} steps ({:.2} tokens/step, {} forward calls)",
            tokens.len(),
            stats.total_steps(),
            stats.tokens_per_step(),
            stats.forward_calls
        );

        Ok(GenerationOutput {
            prompt: prompt.to_vec(),
            tokens,
            finish_reason,
            stats,
        })
    }

    /// One denoising step over the active block
    fn step(
        &self,
        cache: &mut CacheStore,
        canvas: &mut Canvas,
        block: &mut ActiveBlock,
    ) -> Result<()> {
        let span = block.span;
        let masked = canvas.masked_in(&span);

        block.steps += 1;
        if block.steps > span.len() {
            return Err(InvariantViolation::StepBudgetExceeded {
                block: span.index,
                budget: span.len(),
            }
            .into());
        }

        let logits = cache.forward(&self.model, canvas, &span)?;
        let mask_logits = select_rows(&logits, &masked, span.start)?;
        let candidates = self.scorer.score(&mask_logits)?;
        let decision = self.decoder.decide(&masked, &candidates)?;

        if decision.is_empty() {
            return Err(InvariantViolation::NoProgress {
                block: span.index,
                step: block.steps,
                masked: masked.len(),
            }
            .into());
        }

        for reveal in &decision.reveals {
            if !span.contains(reveal.position) {
                return Err(InvariantViolation::RevealOutsideBlock {
                    position: reveal.position,
                    start: span.start,
                    end: span.end,
                }
                .into());
            }
            canvas.reveal(reveal.position, reveal.token)?;
        }

        block.tokens_generated += decision.len();
        block.confidence_sum += decision.confidence_sum();

        tracing::debug!(
            "Block {} step {}: revealed {}/{} masked{}",
            span.index,
            block.steps,
            decision.len(),
            masked.len(),
            if decision.used_greedy_floor { " (greedy floor)" } else { "" }
        );

        Ok(())
    }
}

/// Rows of block logits belonging to the masked positions
fn select_rows(logits: &Tensor, masked: &[usize], block_start: usize) -> candle_core::Result<Tensor> {
    let rows: Vec<u32> = masked.iter().map(|&p| (p - block_start) as u32).collect();
    let index = Tensor::from_vec(rows, masked.len(), logits.device())?;
    logits.contiguous()?.index_select(&index, 0)
}
