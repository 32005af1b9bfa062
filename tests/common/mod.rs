#![allow(dead_code)]

use candle_core::Device;
use chatmimic::config::ModelConfig;
use chatmimic::model::ClassConfig;
use chatmimic::{ChatModel, GPT2Tokenizer, ModelType};
use serde_json::{json, Map, Value};
use tokenizers::Tokenizer;

/// Words the test tokenizer knows; everything else maps to `[UNK]`
pub const WORDS: &[&str] = &[
    "<|endoftext|>",
    "[UNK]",
    "[",
    "]:",
    "OTHER",
    "ASSISTANT",
    "hi",
    "hello",
    "how",
    "are",
    "you",
    "good",
    "thanks",
    "what",
    "is",
    "up",
    "nothing",
    "much",
    "?",
    ",",
];

/// Word-level tokenizer with a whitespace pre-tokenizer
pub fn word_tokenizer() -> GPT2Tokenizer {
    let vocab: Map<String, Value> = WORDS
        .iter()
        .enumerate()
        .map(|(i, w)| (w.to_string(), json!(i)))
        .collect();

    let config = json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [{
            "id": 0,
            "content": "<|endoftext|>",
            "single_word": false,
            "lstrip": false,
            "rstrip": false,
            "normalized": false,
            "special": true
        }],
        "normalizer": null,
        "pre_tokenizer": { "type": "Whitespace" },
        "post_processor": null,
        "decoder": null,
        "model": { "type": "WordLevel", "vocab": vocab, "unk_token": "[UNK]" }
    });

    let tokenizer = Tokenizer::from_bytes(config.to_string().as_bytes()).unwrap();
    GPT2Tokenizer::from_tokenizer(tokenizer).unwrap()
}

/// Randomly initialized two-layer model over [`word_tokenizer`]
pub fn tiny_model() -> ChatModel {
    let tokenizer = word_tokenizer();
    let config = ModelConfig::tiny(tokenizer.vocab_size());
    ChatModel::from_parts(config, tokenizer, ClassConfig::for_type(ModelType::Gpt2), &Device::Cpu).unwrap()
}

/// Two conversations in the downloader's nested format
pub fn transcript_json() -> String {
    json!([
        [
            { "author": "bob", "content": "hi", "start_time": 1_700_000_000_000i64 },
            { "author": "qarri", "content": "hello", "start_time": 1_700_000_001_000i64 },
            { "author": "bob", "content": "how are you ?", "start_time": 1_700_000_002_000i64 },
            { "author": "qarri", "content": "good , thanks", "start_time": 1_700_000_003_000i64 }
        ],
        [
            { "author": "bob", "content": "what is up ?", "start_time": 1_700_000_100_000i64 },
            { "author": "Qarri", "content": "nothing much", "start_time": 1_700_000_101_000i64 },
            { "author": "bob", "content": "   ", "start_time": 1_700_000_102_000i64 },
            { "author": "qarri", "content": "you ?", "start_time": 1_700_000_103_000i64 }
        ]
    ])
    .to_string()
}
