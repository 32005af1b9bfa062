use candle_core::Device;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

use crate::{ChatMimicError, Result};

/// Pretrained checkpoints that can be fine-tuned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelType {
    #[serde(rename = "GPT2")]
    Gpt2,
    #[serde(rename = "GPT2_MEDIUM")]
    Gpt2Medium,
    #[serde(rename = "GPT2_LARGE")]
    Gpt2Large,
    #[serde(rename = "GPT2_XL")]
    Gpt2Xl,
    #[serde(rename = "DISTILGPT2")]
    DistilGpt2,
}

impl ModelType {
    /// Repository id on the Hugging Face hub
    pub fn repo_id(&self) -> &'static str {
        match self {
            ModelType::Gpt2 => "openai-community/gpt2",
            ModelType::Gpt2Medium => "openai-community/gpt2-medium",
            ModelType::Gpt2Large => "openai-community/gpt2-large",
            ModelType::Gpt2Xl => "openai-community/gpt2-xl",
            ModelType::DistilGpt2 => "distilbert/distilgpt2",
        }
    }

    pub fn architecture_type(&self) -> &'static str {
        "causal"
    }

    /// Name used in `class_cfg.json`
    pub fn key(&self) -> &'static str {
        match self {
            ModelType::Gpt2 => "GPT2",
            ModelType::Gpt2Medium => "GPT2_MEDIUM",
            ModelType::Gpt2Large => "GPT2_LARGE",
            ModelType::Gpt2Xl => "GPT2_XL",
            ModelType::DistilGpt2 => "DISTILGPT2",
        }
    }
}

impl FromStr for ModelType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "gpt2" => Ok(ModelType::Gpt2),
            "gpt2-medium" => Ok(ModelType::Gpt2Medium),
            "gpt2-large" => Ok(ModelType::Gpt2Large),
            "gpt2-xl" => Ok(ModelType::Gpt2Xl),
            "distilgpt2" => Ok(ModelType::DistilGpt2),
            _ => Err(format!(
                "Invalid model type: {}. Use gpt2, gpt2-medium, gpt2-large, gpt2-xl or distilgpt2",
                s
            )),
        }
    }
}

impl std::fmt::Display for ModelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelType::Gpt2 => write!(f, "gpt2"),
            ModelType::Gpt2Medium => write!(f, "gpt2-medium"),
            ModelType::Gpt2Large => write!(f, "gpt2-large"),
            ModelType::Gpt2Xl => write!(f, "gpt2-xl"),
            ModelType::DistilGpt2 => write!(f, "distilgpt2"),
        }
    }
}

/// Architecture of a GPT-2 checkpoint, as stored in its `config.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub n_embd: usize,
    pub n_layer: usize,
    pub n_head: usize,
    #[serde(default)]
    pub n_positions: Option<usize>,
    #[serde(default)]
    pub n_ctx: Option<usize>,
    #[serde(default)]
    pub n_inner: Option<usize>,
    #[serde(default = "default_layer_norm_epsilon")]
    pub layer_norm_epsilon: f64,
    #[serde(default = "default_pdrop")]
    pub embd_pdrop: f32,
    #[serde(default = "default_pdrop")]
    pub attn_pdrop: f32,
    #[serde(default = "default_pdrop")]
    pub resid_pdrop: f32,
    #[serde(default = "default_model_type")]
    pub model_type: String,
}

fn default_layer_norm_epsilon() -> f64 {
    1e-5
}

fn default_pdrop() -> f32 {
    0.1
}

fn default_model_type() -> String {
    "gpt2".to_string()
}

impl ModelConfig {
    /// Small architecture for tests and experiments
    pub fn tiny(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            n_embd: 16,
            n_layer: 2,
            n_head: 2,
            n_positions: Some(32),
            n_ctx: None,
            n_inner: None,
            layer_norm_epsilon: 1e-5,
            embd_pdrop: 0.0,
            attn_pdrop: 0.0,
            resid_pdrop: 0.0,
            model_type: default_model_type(),
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: ModelConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path.as_ref(), serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.model_type != "gpt2" {
            return Err(ChatMimicError::Config(format!(
                "unsupported architecture {:?}, only gpt2 checkpoints can be loaded",
                self.model_type
            )));
        }
        if self.n_head == 0 || self.n_embd % self.n_head != 0 {
            return Err(ChatMimicError::Config(format!(
                "n_embd {} is not divisible by n_head {}",
                self.n_embd, self.n_head
            )));
        }
        Ok(())
    }

    /// Maximum sequence length
    pub fn n_positions(&self) -> usize {
        self.n_positions.or(self.n_ctx).unwrap_or(1024)
    }

    pub fn n_inner(&self) -> usize {
        self.n_inner.unwrap_or(4 * self.n_embd)
    }

    /// Parameter count in millions (LM head is tied to the token embedding)
    pub fn param_count_millions(&self) -> f32 {
        let embeddings = self.vocab_size * self.n_embd + self.n_positions() * self.n_embd;
        let attention = self.n_layer * (4 * self.n_embd * self.n_embd + 4 * self.n_embd);
        let mlp = self.n_layer * (2 * self.n_embd * self.n_inner() + self.n_inner() + self.n_embd);
        let layer_norm = self.n_layer * 4 * self.n_embd + 2 * self.n_embd;

        (embeddings + attention + mlp + layer_norm) as f32 / 1_000_000.0
    }
}

/// Fine-tuning hyperparameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub warmup_steps: usize,
    pub weight_decay: f64,
    pub max_grad_norm: f64,
    /// Save a checkpoint every N epochs (0 disables checkpoints)
    pub save_steps: usize,
    pub max_length: usize,
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 3,
            batch_size: 4,
            learning_rate: 5e-5,
            warmup_steps: 0,
            weight_decay: 0.0,
            max_grad_norm: 1.0,
            save_steps: 0,
            max_length: 128,
            seed: 42,
        }
    }
}

/// Sampling parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub max_new_tokens: usize,
    /// Values <= 0 select greedy decoding
    pub temperature: f64,
    pub top_p: Option<f64>,
    pub top_k: Option<usize>,
    pub repeat_penalty: f32,
    pub repeat_last_n: usize,
    pub num_return_sequences: usize,
    pub seed: Option<u64>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 100,
            temperature: 0.7,
            top_p: Some(0.9),
            top_k: None,
            repeat_penalty: 1.0,
            repeat_last_n: 64,
            num_return_sequences: 1,
            seed: None,
        }
    }
}

impl GenerationConfig {
    /// Defaults used when replying inside a conversation
    pub fn chat() -> Self {
        Self {
            max_new_tokens: 80,
            temperature: 0.8,
            ..Self::default()
        }
    }
}

/// Conversation and dataset labelling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub target_author: String,
    pub context_window: usize,
    /// Preceding turns included in each training example; defaults to `context_window`
    pub example_context_turns: Option<usize>,
    pub generation: GenerationConfig,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            target_author: String::new(),
            context_window: 6,
            example_context_turns: None,
            generation: GenerationConfig::chat(),
        }
    }
}

impl ChatConfig {
    /// A chat prompt shows the last `context_window` turns before the reply,
    /// so training examples carry as many unless told otherwise
    pub fn example_context_turns(&self) -> usize {
        self.example_context_turns.unwrap_or(self.context_window)
    }
}

/// Discord bot settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    /// Environment variable holding the bot token
    pub token_env: String,
    /// Channels the bot answers in; empty means every channel it can read
    pub allowed_channels: Vec<u64>,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            token_env: "BOT_TOKEN".to_string(),
            allowed_channels: Vec::new(),
        }
    }
}

impl BotConfig {
    pub fn token(&self) -> Result<String> {
        std::env::var(&self.token_env).map_err(|_| {
            ChatMimicError::Config(format!("environment variable {} is not set", self.token_env))
        })
    }

    pub fn allows(&self, channel_id: u64) -> bool {
        self.allowed_channels.is_empty() || self.allowed_channels.contains(&channel_id)
    }
}

/// Main configuration struct
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model_type: ModelType,
    pub training: TrainingConfig,
    pub chat: ChatConfig,
    pub bot: BotConfig,
    pub force_cpu: bool,

    // Device configuration (not serialized)
    #[serde(skip)]
    pub device: Option<Device>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_type: ModelType::Gpt2Medium,
            training: TrainingConfig::default(),
            chat: ChatConfig::default(),
            bot: BotConfig::default(),
            force_cpu: false,
            device: None,
        }
    }
}

impl Config {
    /// Load a JSON config file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chat.context_window == 0 {
            return Err(ChatMimicError::Config("context_window must be at least 1".into()));
        }
        if self.training.batch_size == 0 {
            return Err(ChatMimicError::Config("batch_size must be at least 1".into()));
        }
        if self.training.max_length < 2 {
            return Err(ChatMimicError::Config("max_length must be at least 2".into()));
        }
        Ok(())
    }

    /// Apply `CHATMIMIC_*` environment variable overrides
    pub fn from_env_overrides(self) -> Result<Self> {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply `CHATMIMIC_*` overrides read through `lookup`.
    /// A variable that is set but does not parse is an error.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| -> Option<(String, String)> {
            lookup(name).map(|value| (name.to_string(), value))
        };
        fn parse<T: FromStr>((name, value): (String, String)) -> Result<T> {
            value.trim().parse::<T>().map_err(|_| {
                ChatMimicError::Config(format!("{} has an invalid value {:?}", name, value))
            })
        }

        if let Some(v) = var("CHATMIMIC_MODEL") {
            self.model_type = parse(v)?;
        }
        if let Some((_, author)) = var("CHATMIMIC_AUTHOR") {
            self.chat.target_author = author;
        }
        if let Some(v) = var("CHATMIMIC_EPOCHS") {
            self.training.epochs = parse(v)?;
        }
        if let Some(v) = var("CHATMIMIC_BATCH_SIZE") {
            self.training.batch_size = parse(v)?;
        }
        if let Some(v) = var("CHATMIMIC_LEARNING_RATE") {
            self.training.learning_rate = parse(v)?;
        }
        if let Some(v) = var("CHATMIMIC_CONTEXT_WINDOW") {
            self.chat.context_window = parse(v)?;
        }
        if let Some((name, channels)) = var("CHATMIMIC_CHANNELS") {
            let ids = channels
                .split(',')
                .filter(|c| !c.trim().is_empty())
                .map(|c| parse::<u64>((name.clone(), c.to_string())))
                .collect::<Result<Vec<u64>>>()?;
            if ids.is_empty() {
                return Err(ChatMimicError::Config(format!(
                    "{} is set but lists no channel ids",
                    name
                )));
            }
            self.bot.allowed_channels = ids;
        }
        Ok(self)
    }

    /// Initialize and get the compute device
    pub fn init_device(&mut self) -> candle_core::Result<&Device> {
        if self.device.is_none() {
            let device = if self.force_cpu {
                Device::Cpu
            } else {
                Device::cuda_if_available(0)?
            };
            self.device = Some(device);
        }
        Ok(self.device.get_or_insert(Device::Cpu))
    }

    /// Log current settings
    pub fn log_settings(&self) {
        log::info!("Model: {}", self.model_type);
        log::info!(
            "Training: {} epochs, batch {}, lr {:.1e}, max length {}",
            self.training.epochs,
            self.training.batch_size,
            self.training.learning_rate,
            self.training.max_length
        );
        log::info!(
            "Chat: target author {:?}, context window {}, example context {}",
            self.chat.target_author,
            self.chat.context_window,
            self.chat.example_context_turns()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_type_parses_common_spellings() {
        assert_eq!("gpt2".parse::<ModelType>().unwrap(), ModelType::Gpt2);
        assert_eq!("GPT2_MEDIUM".parse::<ModelType>().unwrap(), ModelType::Gpt2Medium);
        assert_eq!("distilgpt2".parse::<ModelType>().unwrap(), ModelType::DistilGpt2);
        assert!("bloom".parse::<ModelType>().is_err());
    }

    #[test]
    fn partial_json_config_keeps_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"model_type": "GPT2", "chat": {"target_author": "qarri"}}"#)
                .unwrap();
        assert_eq!(config.model_type, ModelType::Gpt2);
        assert_eq!(config.chat.target_author, "qarri");
        assert_eq!(config.chat.context_window, 6);
        assert_eq!(config.training.batch_size, 4);
        assert_eq!(config.chat.generation.max_new_tokens, 80);
    }

    #[test]
    fn reads_hf_gpt2_config() {
        let json = r#"{
            "activation_function": "gelu_new",
            "architectures": ["GPT2LMHeadModel"],
            "layer_norm_epsilon": 1e-05,
            "model_type": "gpt2",
            "n_ctx": 1024,
            "n_embd": 768,
            "n_head": 12,
            "n_layer": 12,
            "n_positions": 1024,
            "vocab_size": 50257
        }"#;
        let config: ModelConfig = serde_json::from_str(json).unwrap();
        config.validate().unwrap();
        assert_eq!(config.n_positions(), 1024);
        assert_eq!(config.n_inner(), 3072);
        // the 124M checkpoint
        assert!((config.param_count_millions() - 124.4).abs() < 0.1);
    }

    #[test]
    fn other_architectures_are_rejected() {
        let mut config = ModelConfig::tiny(10);
        config.model_type = "opt".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_context_window_is_rejected() {
        let mut config = Config::default();
        config.chat.context_window = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_allow_list_allows_everything() {
        let mut bot = BotConfig::default();
        assert!(bot.allows(1));
        bot.allowed_channels = vec![7];
        assert!(bot.allows(7));
        assert!(!bot.allows(8));
    }

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let pairs: Vec<(String, String)> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name: &str| pairs.iter().find(|(k, _)| k == name).map(|(_, v)| v.clone())
    }

    #[test]
    fn environment_overrides_the_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chatmimic.json");
        std::fs::write(
            &path,
            r#"{"training": {"epochs": 7, "batch_size": 8}, "chat": {"target_author": "qarri"}}"#,
        )
        .unwrap();

        let config = Config::load(&path)
            .unwrap()
            .with_overrides(env(&[("CHATMIMIC_EPOCHS", "2"), ("CHATMIMIC_MODEL", "distilgpt2")]))
            .unwrap();
        assert_eq!(config.training.epochs, 2);
        assert_eq!(config.training.batch_size, 8);
        assert_eq!(config.chat.target_author, "qarri");
        assert_eq!(config.model_type, ModelType::DistilGpt2);

        // flags are assigned last in the front end
        let mut config = config;
        config.training.epochs = 5;
        assert_eq!(config.training.epochs, 5);
    }

    #[test]
    fn unparsable_environment_values_are_errors() {
        let err = Config::default()
            .with_overrides(env(&[("CHATMIMIC_EPOCHS", "ten")]))
            .unwrap_err();
        assert!(err.to_string().contains("CHATMIMIC_EPOCHS"));
        assert!(err.to_string().contains("ten"));
    }

    #[test]
    fn malformed_channel_list_keeps_the_bot_locked_down() {
        let mut config = Config::default();
        config.bot.allowed_channels = vec![1075946648108269702];

        assert!(config
            .clone()
            .with_overrides(env(&[("CHATMIMIC_CHANNELS", "#general")]))
            .is_err());
        assert!(config
            .clone()
            .with_overrides(env(&[("CHATMIMIC_CHANNELS", " , ")]))
            .is_err());

        let config = config
            .with_overrides(env(&[("CHATMIMIC_CHANNELS", "1, 2")]))
            .unwrap();
        assert_eq!(config.bot.allowed_channels, vec![1, 2]);
        assert!(!config.bot.allows(42));
    }

    #[test]
    fn zero_context_window_from_environment_fails_validation() {
        let config = Config::default()
            .with_overrides(env(&[("CHATMIMIC_CONTEXT_WINDOW", "0")]))
            .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn example_context_follows_the_window() {
        let config: Config = serde_json::from_str(r#"{"chat": {"context_window": 4}}"#).unwrap();
        assert_eq!(config.chat.example_context_turns(), 4);

        let config: Config =
            serde_json::from_str(r#"{"chat": {"context_window": 4, "example_context_turns": 0}}"#)
                .unwrap();
        assert_eq!(config.chat.example_context_turns(), 0);
    }
}
