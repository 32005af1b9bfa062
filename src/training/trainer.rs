use anyhow::{bail, Context, Result};
use candle_core::backprop::GradStore;
use candle_core::Var;
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Once;

use crate::config::TrainingConfig;
use crate::data::ChatDataset;
use crate::model::{masked_lm_loss, GPT};

static TRAINING: AtomicBool = AtomicBool::new(false);
static INTERRUPTED: AtomicBool = AtomicBool::new(false);
static HANDLER: Once = Once::new();

/// Route Ctrl-C to the training loop while it runs; exit otherwise
fn install_interrupt_handler() {
    HANDLER.call_once(|| {
        let result = ctrlc::set_handler(|| {
            if TRAINING.load(Ordering::SeqCst) {
                INTERRUPTED.store(true, Ordering::SeqCst);
            } else {
                std::process::exit(130);
            }
        });
        if let Err(e) = result {
            log::warn!("Could not install Ctrl-C handler: {}", e);
        }
    });
}

/// Marks a training run as active for the interrupt handler
struct TrainingGuard;

impl TrainingGuard {
    fn start() -> Self {
        install_interrupt_handler();
        INTERRUPTED.store(false, Ordering::SeqCst);
        TRAINING.store(true, Ordering::SeqCst);
        TrainingGuard
    }

    fn interrupted(&self) -> bool {
        INTERRUPTED.load(Ordering::SeqCst)
    }
}

impl Drop for TrainingGuard {
    fn drop(&mut self) {
        TRAINING.store(false, Ordering::SeqCst);
    }
}

/// Linear warmup then linear decay to zero
#[derive(Debug, Clone, Copy)]
pub struct LinearSchedule {
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
}

impl LinearSchedule {
    pub fn new(base_lr: f64, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            base_lr,
            warmup_steps,
            total_steps,
        }
    }

    /// Learning rate used for optimizer step `step` (0-based)
    pub fn lr_at(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return self.base_lr * step as f64 / self.warmup_steps.max(1) as f64;
        }
        let remaining = self.total_steps.saturating_sub(step) as f64;
        let span = self.total_steps.saturating_sub(self.warmup_steps).max(1) as f64;
        self.base_lr * (remaining / span).max(0.0)
    }
}

/// Scale gradients so their global L2 norm is at most `max_norm`.
/// Returns the norm before clipping.
pub fn clip_grad_norm(vars: &[Var], grads: &mut GradStore, max_norm: f64) -> candle_core::Result<f64> {
    let mut total = 0f64;
    for var in vars {
        if let Some(grad) = grads.get(var) {
            total += grad.sqr()?.sum_all()?.to_dtype(candle_core::DType::F64)?.to_scalar::<f64>()?;
        }
    }
    let norm = total.sqrt();

    if max_norm > 0.0 && norm > max_norm {
        let scale = max_norm / (norm + 1e-6);
        for var in vars {
            if let Some(grad) = grads.get(var) {
                let scaled = (grad * scale)?;
                grads.insert(var, scaled);
            }
        }
    }

    Ok(norm)
}

/// Whether a checkpoint is written after epoch `epoch` (0-based)
pub fn checkpoint_due(epoch: usize, save_steps: usize) -> bool {
    save_steps > 0 && epoch % save_steps == 0
}

/// Outcome of a fine-tuning run
#[derive(Debug, Clone, Default)]
pub struct TrainingReport {
    pub epochs_completed: usize,
    /// Average loss of the last completed epoch
    pub final_loss: Option<f32>,
    pub interrupted: bool,
    pub checkpoints: Vec<PathBuf>,
    pub steps: usize,
}

/// Fine-tune `model` in place.
///
/// `checkpoint` is called after each epoch where [`checkpoint_due`] holds and
/// returns where the checkpoint went, if anywhere.
pub fn train_model<F>(
    model: &GPT,
    varmap: &VarMap,
    dataset: &ChatDataset,
    config: &TrainingConfig,
    mut checkpoint: F,
) -> Result<TrainingReport>
where
    F: FnMut(usize) -> Result<Option<PathBuf>>,
{
    let vars = varmap.all_vars();
    let params = ParamsAdamW {
        lr: config.learning_rate,
        beta1: 0.9,
        beta2: 0.999,
        eps: 1e-8,
        weight_decay: config.weight_decay,
    };
    let mut optimizer = AdamW::new(vars.clone(), params).context("Failed to create AdamW optimizer")?;

    let mut dataloader = dataset.dataloader(config.batch_size, true, true, config.seed);
    let batches = dataloader.len();
    if batches == 0 {
        bail!(
            "Dataset of {} samples yields no full batch of {}",
            dataset.len(),
            config.batch_size
        );
    }

    let schedule = LinearSchedule::new(config.learning_rate, config.warmup_steps, batches * config.epochs);
    let style = ProgressStyle::with_template(
        "{msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} | Loss: {prefix} | ETA: {eta}",
    )?
    .progress_chars("#>-");

    let guard = TrainingGuard::start();
    let mut report = TrainingReport::default();

    for epoch in 0..config.epochs {
        if epoch > 0 {
            dataloader.reset();
        }

        let pb = ProgressBar::new(batches as u64);
        pb.set_style(style.clone());
        pb.set_message(format!("Finetuning [epoch {}/{}]", epoch + 1, config.epochs));

        let mut epoch_loss = 0f32;
        for batch in &mut dataloader {
            let batch = batch?;

            optimizer.set_learning_rate(schedule.lr_at(report.steps));
            let logits = model.forward(&batch.input_ids, true)?;
            let loss = masked_lm_loss(&logits, &batch.targets, &batch.loss_mask)?;

            let mut grads = loss.backward()?;
            let norm = clip_grad_norm(&vars, &mut grads, config.max_grad_norm)?;
            optimizer.step(&grads)?;
            report.steps += 1;

            let loss_val = loss.to_scalar::<f32>()?;
            epoch_loss += loss_val;
            log::debug!("step {} loss {:.4} grad norm {:.3}", report.steps, loss_val, norm);

            pb.set_prefix(format!("{:.4}", loss_val));
            pb.inc(1);

            if guard.interrupted() {
                break;
            }
        }
        pb.finish_and_clear();

        if guard.interrupted() {
            println!("{}", "Training interrupted..".yellow());
            report.interrupted = true;
            break;
        }

        if checkpoint_due(epoch, config.save_steps) {
            if let Some(path) = checkpoint(epoch)? {
                println!("Saved checkpoint {}", epoch);
                report.checkpoints.push(path);
            }
        }

        let avg_loss = epoch_loss / batches as f32;
        println!(
            "{}",
            format!("Epoch {}/{}, Average Loss: {:.4}", epoch + 1, config.epochs, avg_loss).bright_white()
        );
        report.epochs_completed += 1;
        report.final_loss = Some(avg_loss);
    }

    Ok(report)
}
