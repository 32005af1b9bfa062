use anyhow::{Context, Result};
use chrono::Local;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::TrainingConfig;
use crate::tokenizer::GPT2Tokenizer;

/// Read and parse a JSON file
pub fn read_json<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Write a value as pretty printed JSON, creating parent directories
pub fn write_json<T: Serialize, P: AsRef<Path>>(path: P, value: &T) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(value)?;
    fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
}

pub const TRAINING_INFO_FILE: &str = "training_info.json";

/// Dataset information saved as JSON
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetInfo {
    pub metadata: DatasetMetadata,
    pub samples: Vec<DatasetSample>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetMetadata {
    pub total_samples: usize,
    pub total_tokens: usize,
    pub average_tokens_per_sample: f64,
    pub creation_date: String,
    pub target_author: String,
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetSample {
    pub text: String,
    pub tokens: usize,
}

/// Save the training examples with their token counts
pub fn save_dataset<P: AsRef<Path>>(
    path: P,
    examples: &[String],
    tokenizer: &GPT2Tokenizer,
    target_author: &str,
    source: &str,
) -> Result<()> {
    let mut samples = Vec::with_capacity(examples.len());
    for text in examples {
        let tokens = tokenizer.encode(text)?.len();
        samples.push(DatasetSample {
            text: text.clone(),
            tokens,
        });
    }

    let total_tokens: usize = samples.iter().map(|s| s.tokens).sum();
    let metadata = DatasetMetadata {
        total_samples: samples.len(),
        total_tokens,
        average_tokens_per_sample: if samples.is_empty() {
            0.0
        } else {
            total_tokens as f64 / samples.len() as f64
        },
        creation_date: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        target_author: target_author.to_string(),
        source: source.to_string(),
    };

    write_json(path.as_ref(), &DatasetInfo { metadata, samples })?;
    log::info!("Dataset saved to: {}", path.as_ref().display());
    Ok(())
}

/// Save examples as plain text, one block per example
pub fn save_dataset_text<P: AsRef<Path>>(path: P, examples: &[String]) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut content = String::new();
    for (i, example) in examples.iter().enumerate() {
        content.push_str(&format!("=== Sample {} ===\n", i + 1));
        content.push_str(example);
        content.push_str("\n\n");
    }

    fs::write(path, content)?;
    log::info!("Text dataset saved to: {}", path.display());
    Ok(())
}

/// Summary of a fine-tuning run saved next to the weights
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingInfo {
    pub base_model: String,
    pub target_author: String,
    pub examples: usize,
    pub epochs_completed: usize,
    pub final_loss: Option<f32>,
    pub interrupted: bool,
    pub params: TrainingConfig,
    pub creation_date: String,
    pub training_time: String,
}

impl TrainingInfo {
    pub fn new(
        base_model: &str,
        target_author: &str,
        examples: usize,
        report: &crate::training::TrainingReport,
        params: &TrainingConfig,
        seconds: f64,
    ) -> Self {
        Self {
            base_model: base_model.to_string(),
            target_author: target_author.to_string(),
            examples,
            epochs_completed: report.epochs_completed,
            final_loss: report.final_loss,
            interrupted: report.interrupted,
            params: params.clone(),
            creation_date: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            training_time: format!("{:.1} seconds", seconds),
        }
    }
}

/// A fine-tuned model directory found on disk
#[derive(Debug, Clone)]
pub struct SavedModel {
    pub folder_name: String,
    pub path: PathBuf,
    pub info: TrainingInfo,
}

/// List model directories under `models_dir` that carry a training summary, newest first
pub fn list_saved_models<P: AsRef<Path>>(models_dir: P) -> Result<Vec<SavedModel>> {
    let models_dir = models_dir.as_ref();
    let mut models = Vec::new();

    if !models_dir.exists() {
        return Ok(models);
    }

    for entry in fs::read_dir(models_dir)? {
        let path = entry?.path();
        let info_path = path.join(TRAINING_INFO_FILE);
        if !path.is_dir() || !info_path.exists() {
            continue;
        }

        match read_json::<TrainingInfo, _>(&info_path) {
            Ok(info) => models.push(SavedModel {
                folder_name: path
                    .file_name()
                    .unwrap_or_default()
                    .to_string_lossy()
                    .to_string(),
                path: path.clone(),
                info,
            }),
            Err(e) => log::warn!("Skipping {}: {:#}", path.display(), e),
        }
    }

    models.sort_by(|a, b| b.info.creation_date.cmp(&a.info.creation_date));
    Ok(models)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trip_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/info.json");
        let params = TrainingConfig::default();
        write_json(&path, &params).unwrap();
        let back: TrainingConfig = read_json(&path).unwrap();
        assert_eq!(back.batch_size, params.batch_size);
    }

    #[test]
    fn text_dump_numbers_samples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dataset.txt");
        save_dataset_text(&path, &["a".to_string(), "b".to_string()]).unwrap();
        let content = fs::read_to_string(path).unwrap();
        assert!(content.starts_with("=== Sample 1 ===\na\n\n=== Sample 2 ===\nb"));
    }

    #[test]
    fn lists_only_directories_with_training_info() {
        let dir = tempfile::tempdir().unwrap();
        let report = crate::training::TrainingReport {
            epochs_completed: 2,
            final_loss: Some(1.5),
            ..Default::default()
        };
        let info = TrainingInfo::new("gpt2", "qarri", 10, &report, &TrainingConfig::default(), 3.0);
        write_json(dir.path().join("qarri/training_info.json"), &info).unwrap();
        fs::create_dir_all(dir.path().join("empty")).unwrap();

        let models = list_saved_models(dir.path()).unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].folder_name, "qarri");
        assert_eq!(models[0].info.epochs_completed, 2);

        assert!(list_saved_models(dir.path().join("missing")).unwrap().is_empty());
    }
}
