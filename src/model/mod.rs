pub mod attention;
pub mod block;
pub mod chat_model;
pub mod conv1d;
pub mod gpt;

pub use chat_model::{ChatModel, ClassConfig};
pub use gpt::{masked_lm_loss, GPT};
