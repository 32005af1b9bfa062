use anyhow::{bail, Context, Result};
use candle_core::Device;
use clap::{Parser, Subcommand};
use colored::*;
use dialoguer::{theme::ColorfulTheme, Input, Select};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chatmimic::config::{Config, ModelType, TrainingConfig};
use chatmimic::data::{ExampleBuilder, Transcript};
use chatmimic::io::json::{self, TrainingInfo, TRAINING_INFO_FILE};
use chatmimic::model::chat_model::CLASS_CONFIG_FILE;
use chatmimic::training::TrainingReport;
use chatmimic::{discord, ChatBot, ChatModel};

const DEFAULT_MODEL_DIR: &str = "models/chatmimic";
const DEFAULT_MODELS_ROOT: &str = "models";

#[derive(Parser)]
#[command(
    name = "chatmimic",
    version = "0.1.0",
    about = "Fine-tune a GPT-2 chat persona on a transcript and talk to it",
    long_about = "Chatmimic - teach a pretrained GPT-2 to talk like one author of a chat transcript\n\
                  \n\
                  Examples:\n\
                    # Fine-tune on everything qarri wrote\n\
                    chatmimic train transcript.json --author qarri\n\
                    \n\
                    # Chat with the result\n\
                    chatmimic repl --model-dir models/chatmimic\n\
                    \n\
                    # Serve it on Discord (token read from BOT_TOKEN)\n\
                    chatmimic bot --model-dir models/chatmimic"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// JSON config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Run on the CPU even when CUDA is available
    #[arg(long, global = true)]
    cpu: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Fine-tune a model on one author's messages
    Train {
        /// Transcript JSON file
        transcript: PathBuf,

        /// Author whose messages the model learns to write
        #[arg(short, long)]
        author: Option<String>,

        /// Pretrained model to start from (gpt2, gpt2-medium, gpt2-large, gpt2-xl, distilgpt2)
        #[arg(short, long)]
        model: Option<ModelType>,

        /// Continue training a saved model instead of a pretrained one
        #[arg(long)]
        resume: Option<PathBuf>,

        /// Where the fine-tuned model is saved
        #[arg(short, long, default_value = DEFAULT_MODEL_DIR)]
        output_dir: PathBuf,

        /// Number of training epochs
        #[arg(long)]
        epochs: Option<usize>,

        /// Batch size for training
        #[arg(long)]
        batch_size: Option<usize>,

        /// Learning rate
        #[arg(long)]
        learning_rate: Option<f64>,

        /// Save a checkpoint every N epochs
        #[arg(long)]
        save_steps: Option<usize>,

        /// Maximum tokens per training example
        #[arg(long)]
        max_length: Option<usize>,

        /// Preceding turns included in each example
        #[arg(long)]
        context_turns: Option<usize>,

        /// Train on the author's raw messages without speaker tags
        #[arg(long)]
        plain: bool,

        /// Only use the conversation at this index
        #[arg(long)]
        conversation: Option<usize>,

        /// Merge consecutive messages by the same author
        #[arg(long)]
        merge: bool,

        /// Random seed
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Chat with a model in the terminal
    Repl {
        /// Saved model directory (falls back to the pretrained model)
        #[arg(short, long, default_value = DEFAULT_MODEL_DIR)]
        model_dir: PathBuf,

        /// Pretrained model used when no saved model is found
        #[arg(long)]
        model: Option<ModelType>,

        /// Transcript used by the `train N` command
        #[arg(short, long)]
        transcript: Option<PathBuf>,

        /// Author used by the `train N` command
        #[arg(short, long)]
        author: Option<String>,

        /// Number of recent turns the model sees
        #[arg(long)]
        context_window: Option<usize>,
    },

    /// Answer Discord messages with a model
    Bot {
        /// Saved model directory (falls back to the pretrained model)
        #[arg(short, long, default_value = DEFAULT_MODEL_DIR)]
        model_dir: PathBuf,

        /// Pretrained model used when no saved model is found
        #[arg(long)]
        model: Option<ModelType>,

        /// Number of recent turns the model sees
        #[arg(long)]
        context_window: Option<usize>,

        /// Channel ids to answer in (comma separated, default: all)
        #[arg(long, value_delimiter = ',')]
        channels: Vec<u64>,
    },

    /// Continue a raw prompt
    Generate {
        /// The prompt to continue
        #[arg(short, long)]
        prompt: String,

        /// Saved model directory (uses the pretrained model when omitted)
        #[arg(short, long)]
        model_dir: Option<PathBuf>,

        /// Pretrained model used when no directory is given
        #[arg(long)]
        model: Option<ModelType>,

        /// Maximum tokens to generate
        #[arg(long, default_value = "100")]
        max_new_tokens: usize,

        /// Temperature for sampling (0 for greedy)
        #[arg(long, default_value = "0.7")]
        temperature: f64,

        /// Top-k sampling parameter
        #[arg(long)]
        top_k: Option<usize>,

        /// Top-p sampling parameter
        #[arg(long)]
        top_p: Option<f64>,

        /// Number of continuations
        #[arg(short, long, default_value = "1")]
        num_return_sequences: usize,

        /// Random seed
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Show a transcript and who wrote what
    Inspect {
        /// Transcript JSON file
        transcript: PathBuf,

        /// Only show the conversation at this index
        #[arg(long)]
        conversation: Option<usize>,

        /// Merge consecutive messages by the same author
        #[arg(long)]
        merge: bool,

        /// Also preview the training examples for this author
        #[arg(short, long)]
        author: Option<String>,
    },

    /// List fine-tuned models
    List {
        /// Models directory
        #[arg(long, default_value = DEFAULT_MODELS_ROOT)]
        models_dir: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logger
    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::from_default_env().filter_level(level).init();

    println!("{}", "=".repeat(60).bright_blue());
    println!("{}", "Chatmimic - chat personas from transcripts".bright_white().bold());
    println!("{}", "Version 0.1.0 - Rust + Candle Edition".bright_white());
    println!("{}", "=".repeat(60).bright_blue());
    println!();

    let mut config = load_config(cli.config.as_deref(), cli.cpu)?;

    match cli.command {
        Some(Commands::Train {
            transcript,
            author,
            model,
            resume,
            output_dir,
            epochs,
            batch_size,
            learning_rate,
            save_steps,
            max_length,
            context_turns,
            plain,
            conversation,
            merge,
            seed,
        }) => {
            if let Some(author) = author {
                config.chat.target_author = author;
            }
            if let Some(model) = model {
                config.model_type = model;
            }
            let training = &mut config.training;
            training.epochs = epochs.unwrap_or(training.epochs);
            training.batch_size = batch_size.unwrap_or(training.batch_size);
            training.learning_rate = learning_rate.unwrap_or(training.learning_rate);
            training.save_steps = save_steps.unwrap_or(training.save_steps);
            training.max_length = max_length.unwrap_or(training.max_length);
            training.seed = seed.unwrap_or(training.seed);
            if let Some(turns) = context_turns {
                config.chat.example_context_turns = Some(turns);
            }
            config.validate()?;

            let examples = build_examples(&config, &transcript, conversation, merge, plain)?;
            let device = config.init_device()?.clone();
            let model = match resume {
                Some(dir) => ChatModel::from_pretrained(&dir, &device)?,
                None => ChatModel::new(config.model_type, &device)?,
            };

            let report = finetune_and_save(
                &model,
                &examples,
                &config.chat.target_author,
                &config.training,
                &output_dir,
                &transcript,
            )?;
            print_summary(&report, &output_dir);
            print_sample(&model, &config)?;
        }

        Some(Commands::Repl {
            model_dir,
            model,
            transcript,
            author,
            context_window,
        }) => {
            if let Some(model) = model {
                config.model_type = model;
            }
            if let Some(author) = author {
                config.chat.target_author = author;
            }
            config.chat.context_window = context_window.unwrap_or(config.chat.context_window);
            config.validate()?;

            let device = config.init_device()?.clone();
            let model = load_or_base(&model_dir, config.model_type, &device)?;
            repl(model, &config, &model_dir, transcript.as_deref())?;
        }

        Some(Commands::Bot {
            model_dir,
            model,
            context_window,
            channels,
        }) => {
            if let Some(model) = model {
                config.model_type = model;
            }
            config.chat.context_window = context_window.unwrap_or(config.chat.context_window);
            if !channels.is_empty() {
                config.bot.allowed_channels = channels;
            }
            config.validate()?;

            let device = config.init_device()?.clone();
            let model = load_or_base(&model_dir, config.model_type, &device)?;
            let chatbot =
                ChatBot::with_generation(model, config.chat.context_window, config.chat.generation.clone())?;
            discord::run_bot(chatbot, &config.bot)?;
        }

        Some(Commands::Generate {
            prompt,
            model_dir,
            model,
            max_new_tokens,
            temperature,
            top_k,
            top_p,
            num_return_sequences,
            seed,
        }) => {
            if let Some(model) = model {
                config.model_type = model;
            }
            let device = config.init_device()?.clone();
            let model = match model_dir {
                Some(dir) => ChatModel::from_pretrained(&dir, &device)?,
                None => ChatModel::new(config.model_type, &device)?,
            };

            let generation = chatmimic::GenerationConfig {
                max_new_tokens,
                temperature,
                top_k,
                top_p,
                num_return_sequences,
                seed,
                ..Default::default()
            };
            generate(&model, &prompt, &generation)?;
        }

        Some(Commands::Inspect {
            transcript,
            conversation,
            merge,
            author,
        }) => {
            inspect(&transcript, conversation, merge, author.as_deref(), &config)?;
        }

        Some(Commands::List { models_dir }) => {
            list_models(&models_dir)?;
        }

        None => {
            main_menu(config)?;
        }
    }

    Ok(())
}

/// Config file, then `CHATMIMIC_*` environment overrides, then `--cpu`
fn load_config(path: Option<&Path>, cpu: bool) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::default(),
    };
    let mut config = config.from_env_overrides()?;
    config.force_cpu |= cpu;
    config.log_settings();
    Ok(config)
}

fn load_transcript(path: &Path, conversation: Option<usize>, merge: bool) -> Result<Transcript> {
    let mut transcript = Transcript::load(path, conversation)
        .with_context(|| format!("Failed to load transcript {}", path.display()))?;
    transcript.sort_chronological();
    if merge {
        transcript.merge_consecutive();
    }
    Ok(transcript)
}

fn build_examples(
    config: &Config,
    path: &Path,
    conversation: Option<usize>,
    merge: bool,
    plain: bool,
) -> Result<Vec<String>> {
    let author = &config.chat.target_author;
    if author.trim().is_empty() {
        bail!("No target author given; pass --author or set chat.target_author in the config");
    }

    let transcript = load_transcript(path, conversation, merge)?;
    let mut builder = ExampleBuilder::new(author.as_str()).with_context(config.chat.example_context_turns());
    if plain {
        builder = builder.plain();
    }

    let examples = builder.build(&transcript);
    if examples.is_empty() {
        bail!("{} has no messages in {}", author, path.display());
    }
    println!(
        "{}",
        format!("Built {} training examples for {}", examples.len(), author).bright_cyan()
    );
    Ok(examples)
}

/// Load a saved model, falling back to the pretrained checkpoint
fn load_or_base(model_dir: &Path, model_type: ModelType, device: &Device) -> Result<ChatModel> {
    if model_dir.join(CLASS_CONFIG_FILE).exists() {
        match ChatModel::from_pretrained(model_dir, device) {
            Ok(model) => {
                println!("{}", format!("Loaded model from {}", model_dir.display()).bright_green());
                return Ok(model);
            }
            Err(e) => log::warn!("Could not load {}: {:#}", model_dir.display(), e),
        }
    } else {
        log::info!("No saved model in {}", model_dir.display());
    }

    println!("{}", format!("Using pretrained {}", model_type).yellow());
    ChatModel::new(model_type, device)
}

fn finetune_and_save(
    model: &ChatModel,
    examples: &[String],
    author: &str,
    training: &TrainingConfig,
    output_dir: &Path,
    source: &Path,
) -> Result<TrainingReport> {
    let source = source.display().to_string();
    json::save_dataset(output_dir.join("dataset.json"), examples, model.tokenizer(), author, &source)?;
    json::save_dataset_text(output_dir.join("dataset.txt"), examples)?;

    let dataset = model.dataset(examples, training.max_length)?;
    println!(
        "{}",
        format!(
            "Training on {} samples ({} target tokens) for {} epochs",
            dataset.len(),
            dataset.trained_tokens(),
            training.epochs
        )
        .bright_cyan()
    );

    let start = Instant::now();
    let report = model.finetune(&dataset, training, Some(output_dir))?;
    let elapsed = start.elapsed().as_secs_f64();

    model.save(output_dir)?;
    let info = TrainingInfo::new(
        &model.class_config().model_name,
        author,
        examples.len(),
        &report,
        training,
        elapsed,
    );
    json::write_json(output_dir.join(TRAINING_INFO_FILE), &info)?;

    Ok(report)
}

fn print_summary(report: &TrainingReport, output_dir: &Path) {
    println!("\n{}", "=".repeat(60).bright_blue());
    if report.interrupted {
        println!("{}", "Training stopped early".yellow().bold());
    } else {
        println!("{}", "Training complete!".bright_green().bold());
    }
    println!("{}", format!("Model folder: {}", output_dir.display()).bright_white());
    println!("{}", format!("Epochs: {}", report.epochs_completed).bright_white());
    if let Some(loss) = report.final_loss {
        println!("{}", format!("Final loss: {:.4}", loss).bright_white());
    }
    for checkpoint in &report.checkpoints {
        println!("{}", format!("Checkpoint: {}", checkpoint.display()).bright_white());
    }
    println!("{}", "=".repeat(60).bright_blue());
}

fn print_sample(model: &ChatModel, config: &Config) -> Result<()> {
    let mut chatbot = ChatBot::with_generation(model, config.chat.context_window, config.chat.generation.clone())?;
    let reply = chatbot.add_message("hey, what's up?")?;
    println!("\n{}", "Sample reply to \"hey, what's up?\":".bright_green());
    println!("{}", reply);
    Ok(())
}

fn repl(model: ChatModel, config: &Config, model_dir: &Path, transcript: Option<&Path>) -> Result<()> {
    let mut chatbot =
        ChatBot::with_generation(model, config.chat.context_window, config.chat.generation.clone())?;

    println!("\n{}", "Chat mode. Type 'quit' to exit.".bright_cyan());
    println!("{}", "You can also use special commands:".bright_cyan());
    println!("  train N  - Fine-tune N epochs on the transcript and save");
    println!("  bot      - Hand this model to the Discord bot");
    println!("  /reset   - Forget the conversation");
    println!("  /info    - Show model information");

    loop {
        let input = Input::<String>::with_theme(&ColorfulTheme::default())
            .with_prompt(">")
            .allow_empty(true)
            .interact_text()?;
        let input = input.trim();

        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("quit") {
            break;
        }

        match input {
            "bot" => {
                println!("{}", "Starting Discord bot...".bright_cyan());
                return discord::run_bot(chatbot, &config.bot);
            }
            "/reset" => {
                chatbot.reset();
                println!("{}", "Conversation cleared.".bright_green());
                continue;
            }
            "/info" => {
                println!("\n{}\n", chatbot.model().model_info());
                continue;
            }
            _ => {}
        }

        if let Some(epochs) = input.strip_prefix("train ") {
            let epochs: usize = match epochs.trim().parse() {
                Ok(n) if n > 0 => n,
                _ => {
                    println!("{}", "Usage: train N (N > 0)".yellow());
                    continue;
                }
            };
            let Some(path) = transcript else {
                println!("{}", "Start the REPL with --transcript to train.".yellow());
                continue;
            };

            let mut training = config.training.clone();
            training.epochs = epochs;
            let result = build_examples(config, path, None, false, false).and_then(|examples| {
                finetune_and_save(
                    chatbot.model(),
                    &examples,
                    &config.chat.target_author,
                    &training,
                    model_dir,
                    path,
                )
            });
            match result {
                Ok(report) => print_summary(&report, model_dir),
                Err(e) => println!("{}", format!("Training failed: {:#}", e).red()),
            }
            continue;
        }

        match chatbot.add_message(input) {
            Ok(reply) => println!("{}", reply.bright_white()),
            Err(e) => println!("{}", format!("Generation failed: {:#}", e).red()),
        }
    }

    Ok(())
}

fn generate(model: &ChatModel, prompt: &str, generation: &chatmimic::GenerationConfig) -> Result<()> {
    if generation.num_return_sequences > 1 {
        println!("\n{}", "Generating text...".bright_yellow());
        for (i, text) in model.gen_text(prompt, generation)?.iter().enumerate() {
            println!("\n{}", format!("[{}]", i + 1).bright_green());
            println!("{}{}", prompt, text);
        }
        return Ok(());
    }

    // Stream generation with live output
    print!("\n{}", "Generated:".bright_green());
    print!(" {}", prompt);
    std::io::stdout().flush()?;

    model.gen_stream(prompt, generation, |fragment| {
        print!("{}", fragment);
        std::io::stdout().flush()?;
        Ok(())
    })?;

    println!("\n");
    Ok(())
}

fn inspect(
    path: &Path,
    conversation: Option<usize>,
    merge: bool,
    author: Option<&str>,
    config: &Config,
) -> Result<()> {
    let transcript = load_transcript(path, conversation, merge)?;
    println!("{}", transcript.render());

    println!("{}", format!("{} messages", transcript.len()).bright_cyan());
    println!("{}", "-".repeat(40));
    for (name, count) in transcript.authors() {
        println!("{:>6}  {}", count, name);
    }
    println!("{}", "-".repeat(40));

    if let Some(author) = author {
        let examples = ExampleBuilder::new(author)
            .with_context(config.chat.example_context_turns())
            .build(&transcript);
        println!(
            "\n{}",
            format!("{} training examples for {}", examples.len(), author).bright_cyan()
        );
        for (i, example) in examples.iter().take(3).enumerate() {
            println!("{}", format!("=== Sample {} ===", i + 1).bright_white());
            println!("{}\n", example);
        }
    }

    Ok(())
}

fn list_models(models_dir: &Path) -> Result<()> {
    let models = json::list_saved_models(models_dir)?;

    if models.is_empty() {
        println!("{}", "No models found.".yellow());
        return Ok(());
    }

    println!("{}", format!("Found {} models:", models.len()).bright_cyan());
    println!("{}", "-".repeat(80));

    for (i, model) in models.iter().enumerate() {
        println!("{}", format!("{}. {}", i + 1, model.folder_name).bright_white().bold());
        println!("   Path: {}", model.path.display());
        println!("   Author: {}", model.info.target_author);
        println!("   Base model: {}", model.info.base_model);
        println!("   Created: {}", model.info.creation_date);
        println!("   Examples: {}", model.info.examples);
        println!("   Epochs: {}", model.info.epochs_completed);
        if let Some(loss) = model.info.final_loss {
            println!("   Final loss: {:.4}", loss);
        }
        println!("{}", "-".repeat(80));
    }

    Ok(())
}

fn select_model(models_dir: &Path) -> Result<Option<PathBuf>> {
    let models = json::list_saved_models(models_dir)?;

    if models.is_empty() {
        println!("{}", "No models found. Train one first.".yellow());
        return Ok(None);
    }

    let model_names: Vec<String> = models
        .iter()
        .map(|m| format!("{} - {} ({})", m.folder_name, m.info.target_author, m.info.creation_date))
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select a model")
        .default(0)
        .items(&model_names)
        .interact()?;

    Ok(Some(models[selection].path.clone()))
}

fn main_menu(mut config: Config) -> Result<()> {
    let options = vec![
        "Chat with a fine-tuned model",
        "Chat with the pretrained model",
        "List fine-tuned models",
        "Exit",
    ];

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("What would you like to do?")
        .default(0)
        .items(&options)
        .interact()?;

    match selection {
        0 => {
            if let Some(model_dir) = select_model(Path::new(DEFAULT_MODELS_ROOT))? {
                let device = config.init_device()?.clone();
                let model = ChatModel::from_pretrained(&model_dir, &device)?;
                repl(model, &config, &model_dir, None)?;
            }
        }
        1 => {
            let device = config.init_device()?.clone();
            let model = ChatModel::new(config.model_type, &device)?;
            repl(model, &config, Path::new(DEFAULT_MODEL_DIR), None)?;
        }
        2 => list_models(Path::new(DEFAULT_MODELS_ROOT))?,
        _ => println!("Goodbye!"),
    }

    Ok(())
}
