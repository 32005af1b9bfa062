use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use hf_hub::api::sync::Api;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::gpt::GPT;
use crate::config::{GenerationConfig, ModelConfig, ModelType, TrainingConfig};
use crate::data::ChatDataset;
use crate::inference;
use crate::io::{json, safetensors};
use crate::tokenizer::GPT2Tokenizer;
use crate::training::{self, TrainingReport};

pub const CLASS_CONFIG_FILE: &str = "class_cfg.json";
pub const MODEL_CONFIG_FILE: &str = "config.json";
pub const WEIGHTS_FILE: &str = "model.safetensors";

/// Which pretrained checkpoint a saved model started from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassConfig {
    pub custom_model_type: ModelType,
    pub architecture_type: String,
    pub model_name: String,
}

impl ClassConfig {
    pub fn for_type(model_type: ModelType) -> Self {
        Self {
            custom_model_type: model_type,
            architecture_type: model_type.architecture_type().to_string(),
            model_name: model_type.repo_id().to_string(),
        }
    }
}

/// Pretrained generative model plus its tokenizer
pub struct ChatModel {
    model: GPT,
    varmap: VarMap,
    tokenizer: GPT2Tokenizer,
    class_config: ClassConfig,
    device: Device,
}

impl ChatModel {
    /// Download (or reuse from the hub cache) and load a pretrained checkpoint
    pub fn new(model_type: ModelType, device: &Device) -> Result<Self> {
        log::info!("Loading model {} on {:?}...", model_type.repo_id(), device);

        let api = Api::new().context("Failed to initialize Hugging Face hub client")?;
        let repo = api.model(model_type.repo_id().to_string());
        let fetch = |file: &str| -> Result<PathBuf> {
            repo.get(file)
                .with_context(|| format!("Failed to fetch {} from {}", file, model_type.repo_id()))
        };

        let config = ModelConfig::load(fetch(MODEL_CONFIG_FILE)?)?;
        let tokenizer = GPT2Tokenizer::from_file(fetch("tokenizer.json")?)?;
        let weights = fetch(WEIGHTS_FILE)?;

        Self::load(config, tokenizer, &weights, ClassConfig::for_type(model_type), device)
    }

    /// Load a directory written by [`ChatModel::save`]
    pub fn from_pretrained<P: AsRef<Path>>(model_dir: P, device: &Device) -> Result<Self> {
        let model_dir = model_dir.as_ref();
        let class_config: ClassConfig = json::read_json(model_dir.join(CLASS_CONFIG_FILE))?;
        let config = ModelConfig::load(model_dir.join(MODEL_CONFIG_FILE))
            .with_context(|| format!("Failed to load model config from {}", model_dir.display()))?;
        let tokenizer = GPT2Tokenizer::from_pretrained(model_dir)?;

        log::info!(
            "Loading fine-tuned {} from {}",
            class_config.custom_model_type,
            model_dir.display()
        );
        Self::load(config, tokenizer, &model_dir.join(WEIGHTS_FILE), class_config, device)
    }

    fn load(
        config: ModelConfig,
        tokenizer: GPT2Tokenizer,
        weights: &Path,
        class_config: ClassConfig,
        device: &Device,
    ) -> Result<Self> {
        let model = Self::from_parts(config, tokenizer, class_config, device)?;
        safetensors::load_into_varmap(&model.varmap, weights, device)?;
        Ok(model)
    }

    /// Build a model with freshly initialized weights
    pub fn from_parts(
        config: ModelConfig,
        tokenizer: GPT2Tokenizer,
        class_config: ClassConfig,
        device: &Device,
    ) -> Result<Self> {
        if tokenizer.vocab_size() > config.vocab_size {
            return Err(anyhow!(
                "Tokenizer has {} tokens but the model only {}",
                tokenizer.vocab_size(),
                config.vocab_size
            ));
        }

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = GPT::new(&config, vb).context("Failed to initialize GPT model")?;

        Ok(Self {
            model,
            varmap,
            tokenizer,
            class_config,
            device: device.clone(),
        })
    }

    /// Write weights, tokenizer, model config and class config to `output_dir`
    pub fn save<P: AsRef<Path>>(&self, output_dir: P) -> Result<()> {
        let output_dir = output_dir.as_ref();
        std::fs::create_dir_all(output_dir)
            .with_context(|| format!("Failed to create model directory: {}", output_dir.display()))?;

        let mut metadata = HashMap::new();
        metadata.insert("format".to_string(), "pt".to_string());
        metadata.insert("base_model".to_string(), self.class_config.model_name.clone());
        safetensors::save_varmap(&self.varmap, output_dir.join(WEIGHTS_FILE), metadata)?;

        self.tokenizer
            .save_pretrained(output_dir)
            .context("Failed to save tokenizer")?;
        self.model.config().save(output_dir.join(MODEL_CONFIG_FILE))?;
        json::write_json(output_dir.join(CLASS_CONFIG_FILE), &self.class_config)?;

        log::info!("Model folder saved to: {}", output_dir.display());
        Ok(())
    }

    /// Sample continuations of `prompt`, without the prompt itself
    pub fn gen_text(&self, prompt: &str, config: &GenerationConfig) -> Result<Vec<String>> {
        inference::generate_texts(&self.model, &self.tokenizer, &self.device, prompt, config)
    }

    /// Stream a single continuation fragment by fragment
    pub fn gen_stream<F>(&self, prompt: &str, config: &GenerationConfig, callback: F) -> Result<String>
    where
        F: FnMut(&str) -> Result<()>,
    {
        inference::generate_stream(&self.model, &self.tokenizer, &self.device, prompt, config, callback)
    }

    /// Fine-tune in place; checkpoints go to `output_dir/checkpoint-{epoch}`
    pub fn finetune(
        &self,
        dataset: &ChatDataset,
        config: &TrainingConfig,
        output_dir: Option<&Path>,
    ) -> Result<TrainingReport> {
        training::train_model(&self.model, &self.varmap, dataset, config, |epoch| {
            let Some(dir) = output_dir else {
                return Ok(None);
            };
            let path = dir.join(format!("checkpoint-{}", epoch));
            self.save(&path)?;
            Ok(Some(path))
        })
    }

    /// Build a dataset from examples using this model's tokenizer and device
    pub fn dataset(&self, examples: &[String], max_length: usize) -> Result<ChatDataset> {
        let max_length = max_length.min(self.model.n_positions() + 1);
        ChatDataset::new(examples, &self.tokenizer, max_length, &self.device)
    }

    pub fn tokenizer(&self) -> &GPT2Tokenizer {
        &self.tokenizer
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn class_config(&self) -> &ClassConfig {
        &self.class_config
    }

    pub fn model_info(&self) -> String {
        let config = self.model.config();
        format!(
            "Base model: {}\nVocab size: {}\nEmbedding dim: {}\nLayers: {}\nHeads: {}\nContext: {}\nParameters: {:.2}M\nDevice: {:?}",
            self.class_config.model_name,
            config.vocab_size,
            config.n_embd,
            config.n_layer,
            config.n_head,
            config.n_positions(),
            config.param_count_millions(),
            self.device
        )
    }
}

impl crate::chat::Generator for ChatModel {
    fn generate(&self, prompt: &str, config: &GenerationConfig) -> Result<String> {
        self.gen_text(prompt, config)?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("Generation returned no sequences"))
    }
}
