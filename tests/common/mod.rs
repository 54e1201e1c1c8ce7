//! Deterministic stand-in for a masked-diffusion model
//!
//! Every canvas position has a fixed target token and logit strength, so
//! confidences (and therefore reveal order) are known in advance.

#![allow(dead_code)]

use std::cell::RefCell;

use candle_core::{DType, Device, Result, Tensor};

use dinfer_rs::decoding::{Candidate, ConfidenceScorer, MaxProbability};
use dinfer_rs::{DiffusionModel, KvState};

pub const VOCAB: usize = 16;
pub const MASK: u32 = 15;
pub const EOS: u32 = 14;

/// One recorded forward call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Call {
    pub position_offset: usize,
    pub input_len: usize,
    pub past_len: usize,
}

type Target = Box<dyn Fn(usize) -> (u32, f32)>;

pub struct ScriptedModel {
    /// Absolute position -> (token, logit strength)
    target: Target,
    fail_on_call: Option<usize>,
    pub calls: RefCell<Vec<Call>>,
}

impl ScriptedModel {
    pub fn new(target: impl Fn(usize) -> (u32, f32) + 'static) -> Self {
        Self {
            target: Box::new(target),
            fail_on_call: None,
            calls: RefCell::new(Vec::new()),
        }
    }

    /// Token `pos % 10` everywhere at a uniform, modest confidence
    pub fn uniform(strength: f32) -> Self {
        Self::new(move |pos| ((pos % 10) as u32, strength))
    }

    /// Fail on the `n`th call (zero-based)
    pub fn failing_on(mut self, n: usize) -> Self {
        self.fail_on_call = Some(n);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }

    pub fn expected_token(&self, pos: usize) -> u32 {
        (self.target)(pos).0
    }
}

impl DiffusionModel for ScriptedModel {
    fn forward(
        &self,
        input_ids: &[u32],
        position_offset: usize,
        past: Option<&KvState>,
    ) -> Result<(Tensor, KvState)> {
        let past_len = match past {
            Some(kv) => kv.seq_len()?,
            None => 0,
        };

        let call_index = self.calls.borrow().len();
        self.calls.borrow_mut().push(Call {
            position_offset,
            input_len: input_ids.len(),
            past_len,
        });
        if self.fail_on_call == Some(call_index) {
            candle_core::bail!("scripted failure on call {}", call_index);
        }

        let mut logits = vec![0.0f32; input_ids.len() * VOCAB];
        for i in 0..input_ids.len() {
            let (token, strength) = (self.target)(position_offset + i);
            logits[i * VOCAB + token as usize] = strength;
        }
        let logits = Tensor::from_vec(logits, (1, input_ids.len(), VOCAB), &Device::Cpu)?;

        let total = past_len + input_ids.len();
        let layers = (0..2)
            .map(|_| {
                let k = Tensor::zeros((1, 2, total, 4), DType::F32, &Device::Cpu)?;
                Ok((k.clone(), k))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok((logits, KvState::new(layers)))
    }
}

/// Max-probability scoring that records how many rows each step scored
#[derive(Default)]
pub struct CountingScorer {
    inner: MaxProbability,
    pub rows: RefCell<Vec<usize>>,
}

impl CountingScorer {
    pub fn new() -> Self {
        Self {
            inner: MaxProbability::suppressing(MASK),
            rows: RefCell::new(Vec::new()),
        }
    }
}

impl ConfidenceScorer for &CountingScorer {
    fn score(&self, logits: &Tensor) -> Result<Vec<Candidate>> {
        self.rows.borrow_mut().push(logits.dim(0)?);
        self.inner.score(logits)
    }
}
