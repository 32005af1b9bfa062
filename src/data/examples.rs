use std::collections::VecDeque;

use super::transcript::{Transcript, Turn};

/// Label for the persona being imitated
pub const ASSISTANT_LABEL: &str = "[ASSISTANT]";
/// Label for everyone else in the conversation
pub const OTHER_LABEL: &str = "[OTHER]";

/// Render one speaker-tagged line
pub fn tag_line(label: &str, content: &str) -> String {
    format!("{}: {}", label, content)
}

/// Turns a transcript into training strings for one target author
#[derive(Debug, Clone)]
pub struct ExampleBuilder {
    target_author: String,
    context_turns: usize,
    plain: bool,
}

impl ExampleBuilder {
    pub fn new(target_author: impl Into<String>) -> Self {
        Self {
            target_author: target_author.into(),
            context_turns: 0,
            plain: false,
        }
    }

    /// Number of preceding turns prepended to each example
    pub fn with_context(mut self, context_turns: usize) -> Self {
        self.context_turns = context_turns;
        self
    }

    /// Emit the raw message text with no speaker tags or context
    pub fn plain(mut self) -> Self {
        self.plain = true;
        self
    }

    pub fn target_author(&self) -> &str {
        &self.target_author
    }

    fn label_for(&self, turn: &Turn) -> &'static str {
        if turn.is_by(&self.target_author) {
            ASSISTANT_LABEL
        } else {
            OTHER_LABEL
        }
    }

    pub fn build(&self, transcript: &Transcript) -> Vec<String> {
        let mut examples = Vec::new();
        let mut history: VecDeque<&Turn> = VecDeque::with_capacity(self.context_turns + 1);

        for turn in transcript.turns().iter().filter(|t| !t.is_blank()) {
            if turn.is_by(&self.target_author) {
                if self.plain {
                    examples.push(turn.content.clone());
                } else {
                    let mut lines: Vec<String> = history
                        .iter()
                        .map(|t| tag_line(self.label_for(t), &t.content))
                        .collect();
                    lines.push(tag_line(ASSISTANT_LABEL, &turn.content));
                    examples.push(lines.join("\n"));
                }
            }

            if self.context_turns > 0 {
                history.push_back(turn);
                if history.len() > self.context_turns {
                    history.pop_front();
                }
            }
        }

        log::info!(
            "Built {} examples for author {:?}",
            examples.len(),
            self.target_author
        );
        examples
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn transcript() -> Transcript {
        let now = Utc::now();
        Transcript::new(vec![
            Turn::new("bob", "hi", now),
            Turn::new("Qarri", "hello", now),
            Turn::new("bob", "   ", now),
            Turn::new("alice", "what's up", now),
            Turn::new("qarri", "nm", now),
            Turn::new("qarri", "", now),
        ])
    }

    #[test]
    fn plain_mode_keeps_only_target_content() {
        let examples = ExampleBuilder::new("qarri").plain().build(&transcript());
        assert_eq!(examples, vec!["hello", "nm"]);
    }

    #[test]
    fn tagged_without_context() {
        let examples = ExampleBuilder::new("QARRI").build(&transcript());
        assert_eq!(examples, vec!["[ASSISTANT]: hello", "[ASSISTANT]: nm"]);
    }

    #[test]
    fn tagged_with_context_skips_blank_turns() {
        let examples = ExampleBuilder::new("qarri").with_context(2).build(&transcript());
        assert_eq!(
            examples,
            vec![
                "[OTHER]: hi\n[ASSISTANT]: hello".to_string(),
                "[ASSISTANT]: hello\n[OTHER]: what's up\n[ASSISTANT]: nm".to_string(),
            ]
        );
    }

    #[test]
    fn unknown_author_yields_nothing() {
        assert!(ExampleBuilder::new("nobody").build(&transcript()).is_empty());
    }
}
