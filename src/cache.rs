//! KV cache management for block-wise denoising
//!
//! Two layouts share one API:
//! - `Single`: every step feeds the settled prefix plus the active block with
//!   no past. Returned K/V is checked for shape and discarded.
//! - `Dual`: a settled-prefix cache that only changes between blocks, plus an
//!   active-block cache rebuilt each step. Steps feed the active block only.
//!
//! The store records which prefix length its cache was built for and refuses
//! to run against any other settled length.

use candle_core::{Result as CandleResult, Tensor};

use crate::canvas::Canvas;
use crate::config::CacheVariant;
use crate::decoding::blocks::BlockSpan;
use crate::error::{DllmError, InvariantViolation, Result};
use crate::model::DiffusionModel;

/// Per-layer (keys, values), each `[batch, kv_heads, seq, head_dim]`
#[derive(Clone, Debug)]
pub struct KvState {
    layers: Vec<(Tensor, Tensor)>,
}

impl KvState {
    pub fn new(layers: Vec<(Tensor, Tensor)>) -> Self {
        Self { layers }
    }

    pub fn layers(&self) -> &[(Tensor, Tensor)] {
        &self.layers
    }

    pub fn into_layers(self) -> Vec<(Tensor, Tensor)> {
        self.layers
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Sequence positions covered; layers that disagree are an error
    pub fn seq_len(&self) -> CandleResult<usize> {
        let mut len = None;
        for (k, v) in &self.layers {
            let (k_len, v_len) = (k.dim(2)?, v.dim(2)?);
            if k_len != v_len || len.is_some_and(|l| l != k_len) {
                candle_core::bail!("inconsistent kv lengths across layers");
            }
            len = Some(k_len);
        }
        Ok(len.unwrap_or(0))
    }

    /// Slice `[start, start + len)` along the sequence dimension
    pub fn narrow(&self, start: usize, len: usize) -> CandleResult<Self> {
        let layers = self
            .layers
            .iter()
            .map(|(k, v)| Ok((k.narrow(2, start, len)?, v.narrow(2, start, len)?)))
            .collect::<CandleResult<Vec<_>>>()?;
        Ok(Self { layers })
    }
}

/// How the settled-prefix cache was prepared for a new block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEvent {
    /// Single variant: nothing kept across steps
    Recompute,
    /// Nothing settled yet, nothing to cache
    Empty,
    /// Prefix already covered the settled length
    Reused,
    /// Newly settled tokens appended onto the existing prefix cache
    Extended { tokens: usize },
    /// Prefix cache recomputed from position 0
    Rebuilt { tokens: usize },
}

#[derive(Debug, Default)]
pub struct SingleCache {
    /// Settled length the current block was opened under
    settled: usize,
}

#[derive(Debug, Default)]
pub struct DualCache {
    /// K/V for canvas `[0, prefix_len)`
    prefix: Option<KvState>,
    prefix_len: usize,
    /// K/V for the in-flight block from the latest step
    active: Option<KvState>,
}

#[derive(Debug)]
pub enum CacheStore {
    Single(SingleCache),
    Dual(DualCache),
}

impl CacheStore {
    pub fn new(variant: CacheVariant) -> Self {
        match variant {
            CacheVariant::Single => Self::Single(SingleCache::default()),
            CacheVariant::Dual => Self::Dual(DualCache::default()),
        }
    }

    pub fn variant(&self) -> CacheVariant {
        match self {
            Self::Single(_) => CacheVariant::Single,
            Self::Dual(_) => CacheVariant::Dual,
        }
    }

    /// Canvas positions the settled-prefix cache was built for (dual only)
    pub fn prefix_len(&self) -> Option<usize> {
        match self {
            Self::Single(_) => None,
            Self::Dual(dual) => Some(dual.prefix_len),
        }
    }

    /// Positions held by the active-block cache; always 0 for single
    pub fn cached_len(&self) -> usize {
        match self {
            Self::Single(_) => 0,
            Self::Dual(dual) => dual
                .active
                .as_ref()
                .and_then(|kv| kv.seq_len().ok())
                .unwrap_or(0),
        }
    }

    /// Prepare for denoising `span`.
    ///
    /// Dual: drops the active-block cache and brings the settled-prefix cache
    /// up to `prompt + span.start`, reusing it when the span allows.
    pub fn begin_block<M: DiffusionModel + ?Sized>(
        &mut self,
        model: &M,
        canvas: &Canvas,
        span: &BlockSpan,
    ) -> Result<CacheEvent> {
        let settled = canvas.absolute(span.start);

        match self {
            Self::Single(single) => {
                single.settled = settled;
                Ok(CacheEvent::Recompute)
            }
            Self::Dual(dual) => {
                dual.active = None;

                if dual.prefix_len > settled {
                    return Err(InvariantViolation::StaleCache {
                        cached: dual.prefix_len,
                        settled,
                    }
                    .into());
                }
                if dual.prefix_len == settled {
                    return Ok(if settled == 0 {
                        CacheEvent::Empty
                    } else {
                        CacheEvent::Reused
                    });
                }

                if span.reuse_prefix && dual.prefix.is_some() {
                    let tokens = settled - dual.prefix_len;
                    dual.extend_prefix(model, canvas, settled)?;
                    Ok(CacheEvent::Extended { tokens })
                } else {
                    dual.prefix = None;
                    dual.prefix_len = 0;
                    dual.extend_prefix(model, canvas, settled)?;
                    Ok(CacheEvent::Rebuilt { tokens: settled })
                }
            }
        }
    }

    /// Run the model for the active block and return its logits
    /// `[span.len(), vocab]`
    pub fn forward<M: DiffusionModel + ?Sized>(
        &mut self,
        model: &M,
        canvas: &Canvas,
        span: &BlockSpan,
    ) -> Result<Tensor> {
        let settled = canvas.absolute(span.start);

        match self {
            Self::Single(single) => {
                if single.settled != settled {
                    return Err(InvariantViolation::StaleCache {
                        cached: single.settled,
                        settled,
                    }
                    .into());
                }

                let input = canvas.through(span);
                let (logits, kv) = model.forward(input, 0, None).map_err(DllmError::Model)?;
                check_logits(&logits, input.len())?;
                check_kv(&kv, input.len())?;

                Ok(logits.squeeze(0)?.narrow(0, settled, span.len())?)
            }
            Self::Dual(dual) => {
                dual.verify_prefix(settled)?;

                let input = canvas.block(span);
                let (logits, kv) = model
                    .forward(input, settled, dual.prefix.as_ref())
                    .map_err(DllmError::Model)?;
                check_logits(&logits, input.len())?;
                check_kv(&kv, settled + input.len())?;
                dual.active = Some(kv.narrow(settled, input.len())?);

                Ok(logits.squeeze(0)?)
            }
        }
    }

    /// The block's tokens are final; settled prefix is about to grow
    pub fn finish_block(&mut self, span: &BlockSpan) {
        match self {
            Self::Single(_) => {}
            Self::Dual(dual) => {
                dual.active = None;
                if !span.reuse_prefix {
                    dual.prefix = None;
                    dual.prefix_len = 0;
                }
            }
        }
    }
}

impl DualCache {
    /// Feed canvas `[prefix_len, settled)` on top of the current prefix
    fn extend_prefix<M: DiffusionModel + ?Sized>(
        &mut self,
        model: &M,
        canvas: &Canvas,
        settled: usize,
    ) -> Result<()> {
        let input = canvas.slice(self.prefix_len, settled);
        tracing::debug!(
            "Caching prefix positions {}..{} ({} tokens)",
            self.prefix_len,
            settled,
            input.len()
        );

        let (_, kv) = model
            .forward(input, self.prefix_len, self.prefix.as_ref())
            .map_err(DllmError::Model)?;
        check_kv(&kv, settled)?;

        self.prefix = Some(kv);
        self.prefix_len = settled;
        Ok(())
    }

    fn verify_prefix(&self, settled: usize) -> Result<()> {
        if self.prefix_len != settled {
            return Err(InvariantViolation::StaleCache {
                cached: self.prefix_len,
                settled,
            }
            .into());
        }
        let actual = match &self.prefix {
            Some(kv) => kv.seq_len()?,
            None => 0,
        };
        if actual != settled {
            return Err(InvariantViolation::CacheShape {
                expected: settled,
                actual,
            }
            .into());
        }
        Ok(())
    }
}

fn check_logits(logits: &Tensor, input_len: usize) -> Result<()> {
    let dims = logits.dims();
    if dims.len() != 3 || dims[0] != 1 || dims[1] != input_len {
        let vocab = dims.last().copied().unwrap_or(0);
        return Err(InvariantViolation::LogitsShape {
            expected: vec![1, input_len, vocab],
            actual: dims.to_vec(),
        }
        .into());
    }
    Ok(())
}

fn check_kv(kv: &KvState, expected: usize) -> Result<()> {
    let actual = kv.seq_len()?;
    if actual != expected {
        return Err(InvariantViolation::CacheShape { expected, actual }.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use candle_core::{DType, Device};

    use super::*;

    const MASK: u32 = 9;
    const VOCAB: usize = 10;

    /// (position_offset, input_len, past_len) per call
    #[derive(Default)]
    struct RecordingModel {
        calls: RefCell<Vec<(usize, usize, usize)>>,
    }

    impl DiffusionModel for RecordingModel {
        fn forward(
            &self,
            input_ids: &[u32],
            position_offset: usize,
            past: Option<&KvState>,
        ) -> CandleResult<(Tensor, KvState)> {
            let past_len = match past {
                Some(kv) => kv.seq_len()?,
                None => 0,
            };
            self.calls
                .borrow_mut()
                .push((position_offset, input_ids.len(), past_len));

            let total = past_len + input_ids.len();
            let logits = Tensor::zeros((1, input_ids.len(), VOCAB), DType::F32, &Device::Cpu)?;
            let k = Tensor::zeros((1, 1, total, 2), DType::F32, &Device::Cpu)?;
            Ok((logits, KvState::new(vec![(k.clone(), k)])))
        }
    }

    struct FailingModel;

    impl DiffusionModel for FailingModel {
        fn forward(&self, _: &[u32], _: usize, _: Option<&KvState>) -> CandleResult<(Tensor, KvState)> {
            candle_core::bail!("device lost")
        }
    }

    fn spans(gen_length: usize, block_length: usize, reuse: bool) -> Vec<BlockSpan> {
        crate::decoding::blocks::BlockIterator::new(gen_length, block_length, reuse)
            .unwrap()
            .collect()
    }

    #[test]
    fn test_kv_state_len_and_narrow() -> CandleResult<()> {
        let k = Tensor::zeros((1, 2, 6, 4), DType::F32, &Device::Cpu)?;
        let kv = KvState::new(vec![(k.clone(), k.clone()), (k.clone(), k)]);
        assert_eq!(kv.seq_len()?, 6);
        assert_eq!(kv.narrow(2, 3)?.seq_len()?, 3);
        assert_eq!(KvState::new(vec![]).seq_len()?, 0);
        Ok(())
    }

    #[test]
    fn test_kv_state_rejects_ragged_layers() -> CandleResult<()> {
        let a = Tensor::zeros((1, 1, 3, 2), DType::F32, &Device::Cpu)?;
        let b = Tensor::zeros((1, 1, 4, 2), DType::F32, &Device::Cpu)?;
        let kv = KvState::new(vec![(a.clone(), a), (b.clone(), b)]);
        assert!(kv.seq_len().is_err());
        Ok(())
    }

    #[test]
    fn test_single_feeds_prefix_and_block() -> Result<()> {
        let model = RecordingModel::default();
        let canvas = Canvas::new(&[1, 2, 3], 8, MASK);
        let mut store = CacheStore::new(CacheVariant::Single);

        for span in spans(8, 4, true) {
            assert_eq!(store.begin_block(&model, &canvas, &span)?, CacheEvent::Recompute);
            let logits = store.forward(&model, &canvas, &span)?;
            assert_eq!(logits.dims(), &[4, VOCAB]);
            // Nothing carried between calls
            assert_eq!(store.cached_len(), 0);
            store.finish_block(&span);
        }

        assert_eq!(*model.calls.borrow(), vec![(0, 7, 0), (0, 11, 0)]);
        assert_eq!(store.prefix_len(), None);
        Ok(())
    }

    #[test]
    fn test_dual_extends_prefix_between_blocks() -> Result<()> {
        let model = RecordingModel::default();
        let canvas = Canvas::new(&[1, 2, 3], 8, MASK);
        let mut store = CacheStore::new(CacheVariant::Dual);
        let blocks = spans(8, 4, true);

        // Nothing to extend yet: the prompt is computed from scratch
        assert_eq!(
            store.begin_block(&model, &canvas, &blocks[0])?,
            CacheEvent::Rebuilt { tokens: 3 }
        );
        assert_eq!(store.prefix_len(), Some(3));
        store.forward(&model, &canvas, &blocks[0])?;
        assert_eq!(store.cached_len(), 4);
        store.finish_block(&blocks[0]);

        assert_eq!(
            store.begin_block(&model, &canvas, &blocks[1])?,
            CacheEvent::Extended { tokens: 4 }
        );
        assert_eq!(store.prefix_len(), Some(7));
        let logits = store.forward(&model, &canvas, &blocks[1])?;
        assert_eq!(logits.dims(), &[4, VOCAB]);

        assert_eq!(
            *model.calls.borrow(),
            vec![
                (0, 3, 0), // prompt
                (3, 4, 3), // block 0 step
                (3, 4, 3), // commit block 0
                (7, 4, 7), // block 1 step
            ]
        );
        Ok(())
    }

    #[test]
    fn test_dual_without_reuse_rebuilds() -> Result<()> {
        let model = RecordingModel::default();
        let canvas = Canvas::new(&[1, 2], 8, MASK);
        let mut store = CacheStore::new(CacheVariant::Dual);
        let blocks = spans(8, 4, false);

        store.begin_block(&model, &canvas, &blocks[0])?;
        store.forward(&model, &canvas, &blocks[0])?;
        store.finish_block(&blocks[0]);
        assert_eq!(store.prefix_len(), Some(0));

        assert_eq!(
            store.begin_block(&model, &canvas, &blocks[1])?,
            CacheEvent::Rebuilt { tokens: 6 }
        );
        assert_eq!(model.calls.borrow()[2], (0, 6, 0));
        Ok(())
    }

    #[test]
    fn test_dual_empty_prompt() -> Result<()> {
        let model = RecordingModel::default();
        let canvas = Canvas::new(&[], 4, MASK);
        let mut store = CacheStore::new(CacheVariant::Dual);
        let blocks = spans(4, 4, true);

        assert_eq!(store.begin_block(&model, &canvas, &blocks[0])?, CacheEvent::Empty);
        store.forward(&model, &canvas, &blocks[0])?;
        assert_eq!(*model.calls.borrow(), vec![(0, 4, 0)]);
        Ok(())
    }

    #[test]
    fn test_stale_prefix_detected() -> Result<()> {
        let model = RecordingModel::default();
        let canvas = Canvas::new(&[1, 2, 3], 8, MASK);
        let mut store = CacheStore::new(CacheVariant::Dual);
        let blocks = spans(8, 4, true);

        store.begin_block(&model, &canvas, &blocks[0])?;
        // Skipping begin_block for the next span leaves the prefix at 3
        let err = store.forward(&model, &canvas, &blocks[1]).unwrap_err();
        assert!(matches!(
            err,
            DllmError::Invariant(InvariantViolation::StaleCache { cached: 3, settled: 7 })
        ));
        Ok(())
    }

    #[test]
    fn test_stale_single_detected() -> Result<()> {
        let model = RecordingModel::default();
        let canvas = Canvas::new(&[1], 8, MASK);
        let mut store = CacheStore::new(CacheVariant::Single);
        let blocks = spans(8, 4, true);

        store.begin_block(&model, &canvas, &blocks[0])?;
        let err = store.forward(&model, &canvas, &blocks[1]).unwrap_err();
        assert!(err.is_invariant());
        Ok(())
    }

    #[test]
    fn test_model_error_passes_through() {
        let canvas = Canvas::new(&[1, 2], 4, MASK);
        let mut store = CacheStore::new(CacheVariant::Dual);
        let blocks = spans(4, 4, true);

        let err = store.begin_block(&FailingModel, &canvas, &blocks[0]).unwrap_err();
        assert!(matches!(err, DllmError::Model(_)));
        assert!(err.to_string().contains("device lost"));
    }
}
