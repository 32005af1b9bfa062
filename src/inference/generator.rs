use anyhow::Result;
use candle_core::{Device, IndexOp, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};

use crate::config::GenerationConfig;
use crate::model::GPT;
use crate::tokenizer::GPT2Tokenizer;

/// Sampling strategy for the given parameters
pub fn sampling(config: &GenerationConfig) -> Sampling {
    let temperature = config.temperature;
    if temperature <= 0.0 {
        return Sampling::ArgMax;
    }
    match (config.top_k, config.top_p) {
        (None, None) => Sampling::All { temperature },
        (Some(k), None) => Sampling::TopK { k, temperature },
        (None, Some(p)) => Sampling::TopP { p, temperature },
        (Some(k), Some(p)) => Sampling::TopKThenTopP { k, p, temperature },
    }
}

/// Autoregressive sampler over a [`GPT`] model
pub struct TokenGenerator<'a> {
    model: &'a GPT,
    device: &'a Device,
    config: &'a GenerationConfig,
    eos_token_id: u32,
    processor: LogitsProcessor,
}

impl<'a> TokenGenerator<'a> {
    pub fn new(
        model: &'a GPT,
        device: &'a Device,
        config: &'a GenerationConfig,
        eos_token_id: u32,
        seed: u64,
    ) -> Self {
        Self {
            model,
            device,
            config,
            eos_token_id,
            processor: LogitsProcessor::from_sampling(seed, sampling(config)),
        }
    }

    /// Keep the end of the prompt so that prompt and reply fit the context
    pub fn crop_prompt(&self, prompt_ids: &[u32]) -> Vec<u32> {
        let n_positions = self.model.n_positions();
        let budget = n_positions - self.config.max_new_tokens.min(n_positions - 1);
        if prompt_ids.is_empty() {
            return vec![self.eos_token_id];
        }
        let start = prompt_ids.len().saturating_sub(budget);
        prompt_ids[start..].to_vec()
    }

    fn next_token(&mut self, tokens: &[u32]) -> Result<u32> {
        let n_positions = self.model.n_positions();
        let context = &tokens[tokens.len().saturating_sub(n_positions)..];

        let input = Tensor::new(context, self.device)?.unsqueeze(0)?;
        let logits = self.model.forward(&input, false)?;
        let logits = logits.i((0, context.len() - 1))?;

        let logits = if self.config.repeat_penalty == 1.0 {
            logits
        } else {
            let start = tokens.len().saturating_sub(self.config.repeat_last_n);
            candle_transformers::utils::apply_repeat_penalty(
                &logits,
                self.config.repeat_penalty,
                &tokens[start..],
            )?
        };

        Ok(self.processor.sample(&logits)?)
    }

    /// Generate new token ids, calling `on_token` after each one.
    /// Stops at EOS (not included) or after `max_new_tokens`.
    pub fn generate_with<F>(&mut self, prompt_ids: &[u32], mut on_token: F) -> Result<Vec<u32>>
    where
        F: FnMut(u32) -> Result<()>,
    {
        let mut tokens = self.crop_prompt(prompt_ids);
        let mut generated = Vec::with_capacity(self.config.max_new_tokens);

        for _ in 0..self.config.max_new_tokens {
            let next = self.next_token(&tokens)?;
            if next == self.eos_token_id {
                break;
            }
            tokens.push(next);
            generated.push(next);
            on_token(next)?;
        }

        Ok(generated)
    }

    pub fn generate(&mut self, prompt_ids: &[u32]) -> Result<Vec<u32>> {
        self.generate_with(prompt_ids, |_| Ok(()))
    }
}

fn seed_for(config: &GenerationConfig) -> u64 {
    config.seed.unwrap_or_else(rand::random)
}

/// Generate `num_return_sequences` continuations of `prompt`.
/// Only the new text is returned, trimmed.
pub fn generate_texts(
    model: &GPT,
    tokenizer: &GPT2Tokenizer,
    device: &Device,
    prompt: &str,
    config: &GenerationConfig,
) -> Result<Vec<String>> {
    let prompt_ids = tokenizer.encode(prompt)?;
    let seed = seed_for(config);

    (0..config.num_return_sequences.max(1))
        .map(|i| -> Result<String> {
            let mut generator =
                TokenGenerator::new(model, device, config, tokenizer.eos_token_id(), seed.wrapping_add(i as u64));
            let ids = generator.generate(&prompt_ids)?;
            Ok(tokenizer.decode(&ids, true)?.trim().to_string())
        })
        .collect()
}

/// Stream one continuation, handing each decoded fragment to `callback`
pub fn generate_stream<F>(
    model: &GPT,
    tokenizer: &GPT2Tokenizer,
    device: &Device,
    prompt: &str,
    config: &GenerationConfig,
    mut callback: F,
) -> Result<String>
where
    F: FnMut(&str) -> Result<()>,
{
    let prompt_ids = tokenizer.encode(prompt)?;
    let mut generator = TokenGenerator::new(model, device, config, tokenizer.eos_token_id(), seed_for(config));

    // Decode the running sequence so multi-token characters come out whole
    let mut ids: Vec<u32> = Vec::new();
    let mut printed = 0;
    generator.generate_with(&prompt_ids, |token| {
        ids.push(token);
        let text = tokenizer.decode(&ids, true)?;
        if text.len() > printed && text.is_char_boundary(printed) && !text.ends_with('\u{FFFD}') {
            callback(&text[printed..])?;
            printed = text.len();
        }
        Ok(())
    })?;

    let text = tokenizer.decode(&ids, true)?;
    if text.len() > printed && text.is_char_boundary(printed) {
        callback(&text[printed..])?;
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_positive_temperature_is_greedy() {
        let config = GenerationConfig {
            temperature: 0.0,
            ..GenerationConfig::default()
        };
        assert!(matches!(sampling(&config), Sampling::ArgMax));
    }

    #[test]
    fn picks_combined_filter() {
        let config = GenerationConfig {
            top_k: Some(40),
            top_p: Some(0.9),
            ..GenerationConfig::default()
        };
        assert!(matches!(sampling(&config), Sampling::TopKThenTopP { k: 40, .. }));
    }
}
