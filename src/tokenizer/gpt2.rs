use std::path::Path;
use tokenizers::tokenizer::Tokenizer;

use crate::{ChatMimicError, Result};

/// GPT-2 end of text marker, also used for padding
pub const EOS_TOKEN: &str = "<|endoftext|>";

/// GPT2 Tokenizer wrapper
#[derive(Clone)]
pub struct GPT2Tokenizer {
    tokenizer: Tokenizer,
    vocab_size: usize,
    eos_token_id: u32,
}

impl GPT2Tokenizer {
    /// Wrap an already constructed tokenizer
    pub fn from_tokenizer(tokenizer: Tokenizer) -> Result<Self> {
        let eos_token_id = tokenizer
            .token_to_id(EOS_TOKEN)
            .ok_or_else(|| ChatMimicError::Tokenizer(format!("tokenizer has no {} token", EOS_TOKEN)))?;
        let vocab_size = tokenizer.get_vocab_size(true);

        Ok(Self {
            tokenizer,
            vocab_size,
            eos_token_id,
        })
    }

    /// Load a `tokenizer.json` file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let tokenizer = Tokenizer::from_file(path)
            .map_err(|e| {
                ChatMimicError::Tokenizer(format!("failed to load {}: {}", path.display(), e))
            })?;
        Self::from_tokenizer(tokenizer)
    }

    /// Load tokenizer from a directory
    pub fn from_pretrained<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_file(path.as_ref().join("tokenizer.json"))
    }

    /// Save tokenizer to a directory
    pub fn save_pretrained<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let save_path = path.as_ref().join("tokenizer.json");
        self.tokenizer
            .save(&save_path, false)
            .map_err(|e| {
                ChatMimicError::Tokenizer(format!("failed to save {}: {}", save_path.display(), e))
            })?;
        Ok(())
    }

    /// Encode text to token ids
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| ChatMimicError::Tokenizer(format!("failed to encode text: {}", e)))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Decode token ids to text
    pub fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.tokenizer
            .decode(ids, skip_special_tokens)
            .map_err(|e| ChatMimicError::Tokenizer(format!("failed to decode tokens: {}", e)))
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// GPT2 has no pad token, so padding reuses EOS
    pub fn pad_token_id(&self) -> u32 {
        self.eos_token_id
    }

    pub fn eos_token_id(&self) -> u32 {
        self.eos_token_id
    }
}

impl std::fmt::Debug for GPT2Tokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GPT2Tokenizer")
            .field("vocab_size", &self.vocab_size)
            .field("eos_token_id", &self.eos_token_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NO_EOS: &str = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {"type": "WordLevel", "vocab": {"[UNK]": 0, "hi": 1}, "unk_token": "[UNK]"}
    }"#;

    #[test]
    fn tokenizer_without_eos_is_rejected() {
        let tokenizer = Tokenizer::from_bytes(NO_EOS.as_bytes()).unwrap();
        let err = GPT2Tokenizer::from_tokenizer(tokenizer).unwrap_err();
        assert!(matches!(err, ChatMimicError::Tokenizer(ref msg) if msg.contains(EOS_TOKEN)));
    }

    #[test]
    fn missing_tokenizer_file_is_a_tokenizer_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = GPT2Tokenizer::from_pretrained(dir.path()).unwrap_err();
        assert!(matches!(err, ChatMimicError::Tokenizer(_)));
    }
}
