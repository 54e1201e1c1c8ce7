//! Model boundary
//!
//! The transformer itself lives outside this crate. Anything that maps
//! `(token ids, past K/V)` to `(logits, K/V)` can drive generation.

use candle_core::{Result, Tensor};

use crate::cache::KvState;

/// Forward pass of a masked-diffusion language model
pub trait DiffusionModel {
    /// Run the model over `input_ids`.
    ///
    /// # Arguments
    /// * `input_ids` - Tokens to process; mask slots carry the mask id
    /// * `position_offset` - Absolute canvas position of `input_ids[0]`
    /// * `past` - K/V for canvas positions `[0, position_offset)`, if cached
    ///
    /// # Returns
    /// (logits, kv) where logits is `[1, input_ids.len(), vocab]` and kv
    /// covers `past` followed by `input_ids`
    fn forward(
        &self,
        input_ids: &[u32],
        position_offset: usize,
        past: Option<&KvState>,
    ) -> Result<(Tensor, KvState)>;
}

impl<M: DiffusionModel + ?Sized> DiffusionModel for &M {
    fn forward(
        &self,
        input_ids: &[u32],
        position_offset: usize,
        past: Option<&KvState>,
    ) -> Result<(Tensor, KvState)> {
        (**self).forward(input_ids, position_offset, past)
    }
}

impl<M: DiffusionModel + ?Sized> DiffusionModel for Box<M> {
    fn forward(
        &self,
        input_ids: &[u32],
        position_offset: usize,
        past: Option<&KvState>,
    ) -> Result<(Tensor, KvState)> {
        (**self).forward(input_ids, position_offset, past)
    }
}
