use std::path::Path;

use thiserror::Error;
use tokenizers::{AddedToken, Tokenizer};

use crate::multimodal::DEFAULT_IMAGE_TOKEN;

#[derive(Debug, Error)]
pub enum TokenizerError {
    #[error("tokenizer load: {0}")]
    Load(String),
    #[error("encode: {0}")]
    Encode(String),
    #[error("decode: {0}")]
    Decode(String),
    #[error("tokenizer save: {0}")]
    Save(String),
}

pub struct TokenizerWrapper {
    inner: Tokenizer,
    bos_token_id: Option<u32>,
}

impl TokenizerWrapper {
    pub fn from_file(path: &Path) -> Result<Self, TokenizerError> {
        let inner = Tokenizer::from_file(path).map_err(|e| TokenizerError::Load(e.to_string()))?;
        Ok(Self {
            inner,
            bos_token_id: None,
        })
    }

    /// Word-level tokenizer over `t0..t{vocab_size}` plus the given words,
    /// split on whitespace and punctuation. Unknown words map to `t0`.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn for_testing(vocab_size: usize, words: &[&str]) -> Self {
        use tokenizers::models::wordlevel::WordLevel;
        use tokenizers::pre_tokenizers::whitespace::Whitespace;

        let vocab = (0..vocab_size)
            .map(|i| (format!("t{i}"), i as u32))
            .chain(
                words
                    .iter()
                    .enumerate()
                    .map(|(i, w)| (w.to_string(), (vocab_size + i) as u32)),
            )
            .collect();
        let model = WordLevel::builder()
            .vocab(vocab)
            .unk_token("t0".into())
            .build()
            .expect("build test tokenizer model");
        let mut tokenizer = Tokenizer::new(model);
        tokenizer.with_pre_tokenizer(Some(Whitespace {}));
        Self {
            inner: tokenizer,
            bos_token_id: None,
        }
    }

    /// Prepend `id` to every [`Self::encode_with_image_token`] result.
    pub fn with_bos(mut self, id: Option<u32>) -> Self {
        self.bos_token_id = id;
        self
    }

    pub fn bos_token_id(&self) -> Option<u32> {
        self.bos_token_id
    }

    /// Register `tokens` as special so they are never split. Returns how many
    /// were new.
    pub fn add_special_tokens(&mut self, tokens: &[&str]) -> usize {
        let tokens: Vec<AddedToken> = tokens
            .iter()
            .map(|t| AddedToken::from(t.to_string(), true))
            .collect();
        self.inner.add_special_tokens(&tokens)
    }

    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.inner.token_to_id(token)
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    pub fn encode(&self, text: &str) -> Result<Vec<u32>, TokenizerError> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| TokenizerError::Encode(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Tokenize `prompt` with every `<image>` replaced by `image_token_id`.
    ///
    /// Text between markers is encoded on its own, so the placeholder never
    /// merges with neighbouring text.
    pub fn encode_with_image_token(
        &self,
        prompt: &str,
        image_token_id: u32,
    ) -> Result<Vec<u32>, TokenizerError> {
        let mut ids: Vec<u32> = self.bos_token_id.into_iter().collect();
        for (i, chunk) in prompt.split(DEFAULT_IMAGE_TOKEN).enumerate() {
            if i > 0 {
                ids.push(image_token_id);
            }
            if !chunk.is_empty() {
                ids.extend(self.encode(chunk)?);
            }
        }
        Ok(ids)
    }

    pub fn decode(&self, ids: &[u32]) -> Result<String, TokenizerError> {
        self.inner
            .decode(ids, true)
            .map_err(|e| TokenizerError::Decode(e.to_string()))
    }

    pub fn save(&self, path: &Path) -> Result<(), TokenizerError> {
        self.inner
            .save(path, false)
            .map_err(|e| TokenizerError::Save(e.to_string()))
    }
}
