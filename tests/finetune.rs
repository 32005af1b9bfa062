mod common;

use chatmimic::data::{ExampleBuilder, Transcript};
use chatmimic::TrainingConfig;

fn examples() -> Vec<String> {
    let transcript = Transcript::from_json_str(&common::transcript_json()).unwrap();
    ExampleBuilder::new("qarri").with_context(2).build(&transcript)
}

fn config(epochs: usize) -> TrainingConfig {
    TrainingConfig {
        epochs,
        batch_size: 2,
        learning_rate: 1e-2,
        max_length: 24,
        ..Default::default()
    }
}

#[test]
fn transcript_yields_tagged_examples() {
    let examples = examples();
    assert_eq!(examples.len(), 4);
    assert_eq!(examples[0], "[OTHER]: hi\n[ASSISTANT]: hello");
    assert!(examples.iter().all(|e| !e.contains("   ")));
}

#[test]
fn finetuning_lowers_the_loss() {
    let model = common::tiny_model();
    let dataset = model.dataset(&examples(), 24).unwrap();

    let first = model.finetune(&dataset, &config(1), None).unwrap();
    let later = model.finetune(&dataset, &config(30), None).unwrap();

    assert_eq!(first.epochs_completed, 1);
    assert_eq!(later.epochs_completed, 30);
    assert!(!later.interrupted);
    assert_eq!(later.steps, 60);
    assert!(later.final_loss.unwrap() < first.final_loss.unwrap());
}

#[test]
fn checkpoints_are_written_every_save_steps_epochs() {
    let model = common::tiny_model();
    let dataset = model.dataset(&examples(), 24).unwrap();
    let dir = tempfile::tempdir().unwrap();

    let mut training = config(3);
    training.save_steps = 2;
    let report = model.finetune(&dataset, &training, Some(dir.path())).unwrap();

    assert_eq!(
        report.checkpoints,
        vec![dir.path().join("checkpoint-0"), dir.path().join("checkpoint-2")]
    );
    assert!(dir.path().join("checkpoint-0/model.safetensors").exists());
    assert!(!dir.path().join("checkpoint-1").exists());
}

#[test]
fn dataset_without_a_full_batch_is_an_error() {
    let model = common::tiny_model();
    let dataset = model.dataset(&examples(), 24).unwrap();
    let mut training = config(1);
    training.batch_size = 16;
    assert!(model.finetune(&dataset, &training, None).is_err());
}

#[test]
fn dataset_length_is_capped_by_the_context() {
    let model = common::tiny_model();
    let dataset = model.dataset(&examples(), 1000).unwrap();
    // 32 positions plus the shifted target
    assert_eq!(dataset.max_length(), 33);
    assert_eq!(dataset.sample(0).unwrap().seq_len(), 32);

    let loader = dataset.dataloader(3, true, true, 1);
    assert_eq!(loader.len(), 1);
    let loader = dataset.dataloader(3, false, false, 1);
    assert_eq!(loader.count(), 2);
}
