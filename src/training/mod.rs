pub mod trainer;

pub use trainer::{checkpoint_due, clip_grad_norm, train_model, LinearSchedule, TrainingReport};
