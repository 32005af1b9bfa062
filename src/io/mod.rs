pub mod json;
pub mod safetensors;
