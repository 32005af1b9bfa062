mod common;

use candle_core::Device;
use chatmimic::model::chat_model::{CLASS_CONFIG_FILE, MODEL_CONFIG_FILE, WEIGHTS_FILE};
use chatmimic::{ChatModel, GenerationConfig, ModelType};

fn greedy(max_new_tokens: usize) -> GenerationConfig {
    GenerationConfig {
        max_new_tokens,
        temperature: 0.0,
        top_p: None,
        ..Default::default()
    }
}

#[test]
fn saved_model_reloads_with_identical_output() {
    let model = common::tiny_model();
    let dir = tempfile::tempdir().unwrap();
    model.save(dir.path()).unwrap();

    for file in [WEIGHTS_FILE, MODEL_CONFIG_FILE, CLASS_CONFIG_FILE, "tokenizer.json"] {
        assert!(dir.path().join(file).exists(), "missing {}", file);
    }

    let reloaded = ChatModel::from_pretrained(dir.path(), &Device::Cpu).unwrap();
    assert_eq!(reloaded.class_config().custom_model_type, ModelType::Gpt2);
    assert_eq!(reloaded.tokenizer().vocab_size(), model.tokenizer().vocab_size());

    let prompt = "[OTHER]: hi\n[ASSISTANT]: ";
    let before = model.gen_text(prompt, &greedy(8)).unwrap();
    let after = reloaded.gen_text(prompt, &greedy(8)).unwrap();
    assert_eq!(before, after);
}

#[test]
fn returns_requested_number_of_sequences() {
    let model = common::tiny_model();
    let config = GenerationConfig {
        max_new_tokens: 4,
        num_return_sequences: 3,
        seed: Some(7),
        ..Default::default()
    };
    let texts = model.gen_text("hello", &config).unwrap();
    assert_eq!(texts.len(), 3);
}

#[test]
fn seeded_sampling_is_reproducible() {
    let model = common::tiny_model();
    let config = GenerationConfig {
        max_new_tokens: 6,
        temperature: 1.0,
        seed: Some(11),
        ..Default::default()
    };
    let a = model.gen_text("how are you", &config).unwrap();
    let b = model.gen_text("how are you", &config).unwrap();
    assert_eq!(a, b);
}

#[test]
fn long_prompts_are_cropped_to_the_context() {
    let model = common::tiny_model();
    // far more words than the 32 positions of the tiny model
    let prompt = "hi ".repeat(200);
    let texts = model.gen_text(&prompt, &greedy(5)).unwrap();
    assert_eq!(texts.len(), 1);
}

#[test]
fn streaming_matches_collected_text() {
    let model = common::tiny_model();
    let mut streamed = String::new();
    let full = model
        .gen_stream("hi", &greedy(6), |fragment| {
            streamed.push_str(fragment);
            Ok(())
        })
        .unwrap();
    assert_eq!(streamed, full);
}

#[test]
fn loading_a_missing_directory_fails() {
    let dir = tempfile::tempdir().unwrap();
    assert!(ChatModel::from_pretrained(dir.path().join("nope"), &Device::Cpu).is_err());
}

#[test]
#[ignore = "downloads distilgpt2 from the Hugging Face hub"]
fn pretrained_checkpoint_generates_text() {
    let model = ChatModel::new(ModelType::DistilGpt2, &Device::Cpu).unwrap();
    let texts = model.gen_text("Hello, my name is", &greedy(10)).unwrap();
    assert!(!texts[0].is_empty());
}
