//! Block partitioning of the generation region

use std::iter::FusedIterator;
use std::ops::Range;

use crate::error::ConfigError;

/// Half-open span `[start, end)` of the generation region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSpan {
    /// Zero-based block number
    pub index: usize,
    pub start: usize,
    pub end: usize,
    /// The settled-prefix cache left by the previous block may be extended
    /// rather than rebuilt
    pub reuse_prefix: bool,
}

impl BlockSpan {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }

    pub fn contains(&self, position: usize) -> bool {
        self.range().contains(&position)
    }
}

/// Builds block iterators with a fixed cache-reuse policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockIteratorFactory {
    reuse_prefix_cache: bool,
}

impl BlockIteratorFactory {
    pub fn new(reuse_prefix_cache: bool) -> Self {
        Self { reuse_prefix_cache }
    }

    pub fn reuse_prefix_cache(&self) -> bool {
        self.reuse_prefix_cache
    }

    pub fn create(&self, gen_length: usize, block_length: usize) -> Result<BlockIterator, ConfigError> {
        BlockIterator::new(gen_length, block_length, self.reuse_prefix_cache)
    }
}

impl Default for BlockIteratorFactory {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Yields consecutive block spans; once exhausted it stays exhausted
#[derive(Debug)]
pub struct BlockIterator {
    gen_length: usize,
    block_length: usize,
    next_start: usize,
    next_index: usize,
    reuse_prefix: bool,
}

impl BlockIterator {
    pub fn new(gen_length: usize, block_length: usize, reuse_prefix: bool) -> Result<Self, ConfigError> {
        if gen_length == 0 {
            return Err(ConfigError::ZeroGenLength);
        }
        if block_length == 0 {
            return Err(ConfigError::ZeroBlockLength);
        }
        if block_length > gen_length {
            return Err(ConfigError::BlockLongerThanGeneration {
                block_length,
                gen_length,
            });
        }

        Ok(Self {
            gen_length,
            block_length,
            next_start: 0,
            next_index: 0,
            reuse_prefix,
        })
    }

    pub fn num_blocks(&self) -> usize {
        self.gen_length.div_ceil(self.block_length)
    }
}

impl Iterator for BlockIterator {
    type Item = BlockSpan;

    fn next(&mut self) -> Option<BlockSpan> {
        if self.next_start >= self.gen_length {
            return None;
        }

        let start = self.next_start;
        let end = (start + self.block_length).min(self.gen_length);
        let span = BlockSpan {
            index: self.next_index,
            start,
            end,
            reuse_prefix: self.reuse_prefix,
        };

        self.next_start = end;
        self.next_index += 1;
        Some(span)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.num_blocks() - self.next_index;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for BlockIterator {}

impl FusedIterator for BlockIterator {}
