//! Token canvas for masked-diffusion generation
//!
//! The canvas is `prompt ++ [MASK; gen_length]`. Which generation slots are
//! still masked is tracked explicitly rather than by comparing token values,
//! so a prompt or prediction that happens to equal the mask id is never
//! mistaken for an open slot.

use crate::decoding::blocks::BlockSpan;
use crate::error::InvariantViolation;

#[derive(Debug, Clone)]
pub struct Canvas {
    /// Prompt followed by the generation region
    tokens: Vec<u32>,
    prompt_len: usize,
    /// Per generation slot: has it been revealed
    resolved: Vec<bool>,
    mask_id: u32,
}

impl Canvas {
    pub fn new(prompt: &[u32], gen_length: usize, mask_id: u32) -> Self {
        let mut tokens = Vec::with_capacity(prompt.len() + gen_length);
        tokens.extend_from_slice(prompt);
        tokens.resize(prompt.len() + gen_length, mask_id);

        Self {
            tokens,
            prompt_len: prompt.len(),
            resolved: vec![false; gen_length],
            mask_id,
        }
    }

    pub fn prompt_len(&self) -> usize {
        self.prompt_len
    }

    pub fn gen_length(&self) -> usize {
        self.resolved.len()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn mask_id(&self) -> u32 {
        self.mask_id
    }

    /// Whole canvas including prompt
    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }

    /// Generation region only
    pub fn generated(&self) -> &[u32] {
        &self.tokens[self.prompt_len..]
    }

    /// Absolute canvas index of a generation-relative position
    pub fn absolute(&self, position: usize) -> usize {
        self.prompt_len + position
    }

    /// Canvas tokens from the start through the end of `span`
    pub fn through(&self, span: &BlockSpan) -> &[u32] {
        &self.tokens[..self.absolute(span.end)]
    }

    /// Canvas tokens covered by `span`
    pub fn block(&self, span: &BlockSpan) -> &[u32] {
        &self.tokens[self.absolute(span.start)..self.absolute(span.end)]
    }

    /// Canvas tokens in absolute range `[from, to)`
    pub fn slice(&self, from: usize, to: usize) -> &[u32] {
        &self.tokens[from..to]
    }

    pub fn is_masked(&self, position: usize) -> bool {
        !self.resolved[position]
    }

    /// Generation-relative positions in `span` still masked, ascending
    pub fn masked_in(&self, span: &BlockSpan) -> Vec<usize> {
        span.range().filter(|&p| !self.resolved[p]).collect()
    }

    pub fn masked_count(&self) -> usize {
        self.resolved.iter().filter(|r| !**r).count()
    }

    /// Prompt plus every resolved generation slot
    pub fn resolved_count(&self) -> usize {
        self.prompt_len + self.resolved.iter().filter(|r| **r).count()
    }

    /// Resolve a masked slot. Resolved slots are never rewritten.
    pub fn reveal(&mut self, position: usize, token: u32) -> Result<(), InvariantViolation> {
        if self.resolved[position] {
            return Err(InvariantViolation::RevealResolved(position));
        }
        self.resolved[position] = true;
        let idx = self.absolute(position);
        self.tokens[idx] = token;
        Ok(())
    }

    /// Lowest resolved position in `span` holding `eos_id`, provided every
    /// position before it in the span is resolved too
    pub fn settled_eos_in(&self, span: &BlockSpan, eos_id: u32) -> Option<usize> {
        for position in span.range() {
            if !self.resolved[position] {
                return None;
            }
            if self.tokens[self.absolute(position)] == eos_id {
                return Some(position);
            }
        }
        None
    }

    /// First resolved `eos_id` in the generation region
    pub fn first_eos(&self, eos_id: u32) -> Option<usize> {
        (0..self.gen_length())
            .find(|&p| self.resolved[p] && self.tokens[self.absolute(p)] == eos_id)
    }
}
