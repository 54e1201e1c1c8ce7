//! Per-position confidence scoring for masked slots

use candle_core::{DType, Result, Tensor, D};

/// Best prediction for one masked position
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub token: u32,
    pub confidence: f32,
}

impl Candidate {
    pub fn new(token: u32, confidence: f32) -> Self {
        Self { token, confidence }
    }
}

/// Turns logits for masked positions into ranked candidates.
///
/// The threshold decoder only ever looks at the candidates, so alternative
/// scoring (temperature, margin, entropy) plugs in here.
pub trait ConfidenceScorer {
    /// `logits` is `[num_masked, vocab]`; returns one candidate per row
    fn score(&self, logits: &Tensor) -> Result<Vec<Candidate>>;
}

/// Arg-max token with its softmax probability as confidence
#[derive(Debug, Clone, Copy, Default)]
pub struct MaxProbability {
    /// Token whose logit is forced to -inf before the softmax
    suppressed: Option<u32>,
}

impl MaxProbability {
    pub fn new() -> Self {
        Self::default()
    }

    /// Never predict `token_id` (the mask id)
    pub fn suppressing(token_id: u32) -> Self {
        Self {
            suppressed: Some(token_id),
        }
    }
}

impl ConfidenceScorer for MaxProbability {
    fn score(&self, logits: &Tensor) -> Result<Vec<Candidate>> {
        // Model may emit F16/BF16
        let logits = logits.to_dtype(DType::F32)?;
        let (_, vocab_size) = logits.dims2()?;

        let logits = match self.suppressed {
            Some(id) if vocab_size == 1 && id == 0 => {
                candle_core::bail!("suppressing token {} leaves no finite logit", id)
            }
            Some(id) if (id as usize) < vocab_size => {
                let mut bias = vec![0.0f32; vocab_size];
                bias[id as usize] = f32::NEG_INFINITY;
                let bias = Tensor::from_vec(bias, (1, vocab_size), logits.device())?;
                logits.broadcast_add(&bias)?
            }
            _ => logits,
        };

        let probs = candle_nn::ops::softmax(&logits, D::Minus1)?;
        let confidences: Vec<f32> = probs.max(D::Minus1)?.to_vec1()?;
        let tokens: Vec<u32> = probs.argmax(D::Minus1)?.to_vec1()?;

        // A row of all -inf logits softmaxes to NaN and argmax may land anywhere
        if let Some(id) = self.suppressed {
            if let Some(row) = tokens.iter().position(|&t| t == id) {
                candle_core::bail!("row {} predicted suppressed token {}", row, id);
            }
        }

        Ok(tokens
            .into_iter()
            .zip(confidences)
            .map(|(token, confidence)| Candidate { token, confidence })
            .collect())
    }
}
