//! High-level text generation engine

use crate::config::GenerationConfig;
use crate::decoding::{BlockWiseDiffusionLLM, GenerationOutput};
use crate::error::Result;
use crate::model::DiffusionModel;
use crate::tokenizer::TextCodec;

/// Raw text or pre-tokenized ids
#[derive(Debug, Clone, PartialEq)]
pub enum Prompt {
    Text(String),
    Tokens(Vec<u32>),
}

impl From<&str> for Prompt {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for Prompt {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Vec<u32>> for Prompt {
    fn from(ids: Vec<u32>) -> Self {
        Self::Tokens(ids)
    }
}

/// Generated ids plus their decoded text
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub output: GenerationOutput,
}

/// Tokenize, generate block-wise, detokenize
pub struct DllmEngine<M, T> {
    llm: BlockWiseDiffusionLLM<M>,
    tokenizer: T,
    config: GenerationConfig,
}

impl<M: DiffusionModel, T: TextCodec> DllmEngine<M, T> {
    /// Fails fast on an invalid config, before the model is ever called
    pub fn new(model: M, tokenizer: T, config: GenerationConfig) -> Result<Self> {
        let llm = BlockWiseDiffusionLLM::from_config(model, &config)?;
        tracing::info!(
            "Engine ready: gen_length={}, block_length={}, threshold={}, cache={}",
            config.gen_length,
            config.block_length,
            config.threshold,
            config.cache_variant
        );

        Ok(Self {
            llm,
            tokenizer,
            config,
        })
    }

    /// Generate token ids only
    pub fn generate_ids(&self, prompt: impl Into<Prompt>) -> Result<GenerationOutput> {
        let prompt_ids = match prompt.into() {
            Prompt::Text(text) => self.tokenizer.encode(&text)?,
            Prompt::Tokens(ids) => ids,
        };
        tracing::debug!("Prompt tokens: {}", prompt_ids.len());

        self.llm
            .generate(&prompt_ids, self.config.gen_length, self.config.block_length)
    }

    /// Generate and decode, with special tokens stripped from the text
    pub fn generate(&self, prompt: impl Into<Prompt>) -> Result<Completion> {
        let output = self.generate_ids(prompt)?;
        let text = self.tokenizer.decode(&output.tokens, true)?;
        Ok(Completion { text, output })
    }

    /// Get generation configuration
    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    pub fn tokenizer(&self) -> &T {
        &self.tokenizer
    }
}
