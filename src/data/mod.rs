pub mod dataset;
pub mod examples;
pub mod transcript;

pub use dataset::{Batch, ChatDataset, DataLoader, Sample};
pub use examples::{tag_line, ExampleBuilder, ASSISTANT_LABEL, OTHER_LABEL};
pub use transcript::{Transcript, Turn};
