//! Threshold-based parallel unmasking
//!
//! Every masked position whose confidence clears the threshold is revealed in
//! the same step. When none does, the single most confident position is
//! revealed anyway, so each forward pass resolves at least one slot.

use crate::error::InvariantViolation;

use super::scoring::Candidate;

/// One newly revealed slot
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reveal {
    /// Generation-relative position
    pub position: usize,
    pub token: u32,
    pub confidence: f32,
}

/// What a single denoising step resolves
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodeDecision {
    /// Sorted by position
    pub reveals: Vec<Reveal>,
    /// Lowest revealed position carrying the end-of-sequence token
    pub eos_position: Option<usize>,
    /// Set when nothing cleared the threshold and the floor picked one slot
    pub used_greedy_floor: bool,
}

impl DecodeDecision {
    pub fn len(&self) -> usize {
        self.reveals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reveals.is_empty()
    }

    pub fn positions(&self) -> impl Iterator<Item = usize> + '_ {
        self.reveals.iter().map(|r| r.position)
    }

    pub fn confidence_sum(&self) -> f32 {
        self.reveals.iter().map(|r| r.confidence).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdParallelDecoder {
    threshold: f32,
    mask_id: u32,
    eos_id: u32,
}

impl ThresholdParallelDecoder {
    pub fn new(threshold: f32, mask_id: u32, eos_id: u32) -> Self {
        Self {
            threshold,
            mask_id,
            eos_id,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn mask_id(&self) -> u32 {
        self.mask_id
    }

    pub fn eos_id(&self) -> u32 {
        self.eos_id
    }

    /// Decide which masked positions to reveal.
    ///
    /// `candidates[i]` is the scored prediction for `masked[i]`. The result is
    /// non-empty whenever `masked` is.
    pub fn decide(
        &self,
        masked: &[usize],
        candidates: &[Candidate],
    ) -> Result<DecodeDecision, InvariantViolation> {
        if masked.len() != candidates.len() {
            return Err(InvariantViolation::CandidateCount {
                masked: masked.len(),
                candidates: candidates.len(),
            });
        }

        let mut reveals: Vec<Reveal> = masked
            .iter()
            .zip(candidates)
            .filter(|(_, c)| c.confidence >= self.threshold)
            .map(|(&position, c)| Reveal {
                position,
                token: c.token,
                confidence: c.confidence,
            })
            .collect();

        let mut used_greedy_floor = false;
        if reveals.is_empty() && !masked.is_empty() {
            reveals.push(self.most_confident(masked, candidates));
            used_greedy_floor = true;
        }

        reveals.sort_by_key(|r| r.position);
        let eos_position = reveals
            .iter()
            .find(|r| r.token == self.eos_id)
            .map(|r| r.position);

        Ok(DecodeDecision {
            reveals,
            eos_position,
            used_greedy_floor,
        })
    }

    /// Highest confidence, lowest position on ties. NaN loses to everything.
    fn most_confident(&self, masked: &[usize], candidates: &[Candidate]) -> Reveal {
        let mut pairs = masked.iter().copied().zip(candidates.iter().copied());
        let (mut best_pos, mut best) = pairs
            .next()
            .unwrap_or((0, Candidate::new(self.mask_id, f32::NAN)));

        for (position, candidate) in pairs {
            let (c, b) = (candidate.confidence, best.confidence);
            let better = if b.is_nan() {
                !c.is_nan() || position < best_pos
            } else {
                c > b || (c == b && position < best_pos)
            };
            if better {
                best_pos = position;
                best = candidate;
            }
        }

        Reveal {
            position: best_pos,
            token: best.token,
            confidence: best.confidence,
        }
    }
}
