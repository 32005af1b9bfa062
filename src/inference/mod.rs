pub mod generator;

pub use generator::{generate_stream, generate_texts, sampling, TokenGenerator};
