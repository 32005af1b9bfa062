pub mod chat;
pub mod config;
pub mod data;
pub mod discord;
pub mod inference;
pub mod io;
pub mod model;
pub mod tokenizer;
pub mod training;

pub use chat::{ChatBot, Generator};
pub use config::{Config, GenerationConfig, ModelType, TrainingConfig};
pub use data::{ChatDataset, ExampleBuilder, Transcript, Turn};
pub use model::chat_model::ChatModel;
pub use model::gpt::GPT;
pub use tokenizer::GPT2Tokenizer;

/// Custom error type for chatmimic
#[derive(thiserror::Error, Debug)]
pub enum ChatMimicError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Transcript error: {0}")]
    Transcript(String),

    #[error("Config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ChatMimicError>;
