//! Tokenizer boundary

use std::path::Path;

use anyhow::Result;
use tokenizers::Tokenizer;

use crate::error::DllmError;

/// Text <-> token id conversion
pub trait TextCodec {
    fn encode(&self, text: &str) -> Result<Vec<u32>, DllmError>;

    /// `skip_special_tokens` drops EOS and other special tokens from the text
    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String, DllmError>;
}

impl TextCodec for Tokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>, DllmError> {
        let encoding = (**self)
            .encode(text, true)
            .map_err(|e| DllmError::Tokenizer(format!("Tokenization failed: {}", e)))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String, DllmError> {
        (**self)
            .decode(ids, skip_special_tokens)
            .map_err(|e| DllmError::Tokenizer(format!("Decoding failed: {}", e)))
    }
}

/// Load `tokenizer.json` from a model directory or a direct file path
pub fn load_tokenizer<P: AsRef<Path>>(path: P) -> Result<Tokenizer> {
    let path = path.as_ref();
    let file = if path.is_dir() {
        path.join("tokenizer.json")
    } else {
        path.to_path_buf()
    };

    tracing::info!("Loading tokenizer from {}", file.display());
    Tokenizer::from_file(&file)
        .map_err(|e| anyhow::anyhow!("Failed to load tokenizer {}: {}", file.display(), e))
}

#[cfg(test)]
mod tests {
    use tokenizers::models::wordlevel::WordLevel;
    use tokenizers::pre_tokenizers::whitespace::Whitespace;
    use tokenizers::AddedToken;

    use super::*;

    fn word_level() -> Tokenizer {
        let vocab = [("[UNK]", 0u32), ("hello", 1), ("world", 2)]
            .into_iter()
            .map(|(word, id)| (word.to_string(), id))
            .collect();
        let model = WordLevel::builder()
            .vocab(vocab)
            .unk_token("[UNK]".to_string())
            .build()
            .unwrap();

        let mut tokenizer = Tokenizer::new(model);
        tokenizer.with_pre_tokenizer(Some(Whitespace {}));
        tokenizer.add_special_tokens(&[AddedToken::from("</s>", true)]);
        tokenizer
    }

    #[test]
    fn test_encode_decode_word_level() {
        let tokenizer = word_level();
        let ids = TextCodec::encode(&tokenizer, "hello world").unwrap();
        assert_eq!(ids, vec![1, 2]);

        let text = TextCodec::decode(&tokenizer, &ids, true).unwrap();
        assert_eq!(text, "hello world");
    }

    #[test]
    fn test_decode_skips_special_tokens() {
        let tokenizer = word_level();
        let eos = tokenizer.token_to_id("</s>").unwrap();
        let ids = TextCodec::encode(&tokenizer, "hello </s>").unwrap();
        assert_eq!(ids, vec![1, eos]);

        assert_eq!(TextCodec::decode(&tokenizer, &[1, 2, eos], true).unwrap(), "hello world");
        let raw = TextCodec::decode(&tokenizer, &[1, 2, eos], false).unwrap();
        assert!(raw.contains("</s>"));
    }

    #[test]
    fn test_load_tokenizer_missing_file() {
        let err = load_tokenizer("/nonexistent/tokenizer.json").unwrap_err();
        assert!(err.to_string().contains("Failed to load tokenizer"));
    }

    #[test]
    fn test_load_tokenizer_resolves_directory() {
        let dir = std::env::temp_dir();
        let err = load_tokenizer(&dir).unwrap_err();
        assert!(err.to_string().contains("tokenizer.json"));
    }
}
