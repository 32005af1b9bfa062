//! Rolling conversation state that turns chat messages into model prompts.

use anyhow::{bail, Result};
use std::collections::VecDeque;

use crate::config::GenerationConfig;
use crate::data::{tag_line, ASSISTANT_LABEL, OTHER_LABEL};

/// Anything that can continue a prompt
pub trait Generator {
    fn generate(&self, prompt: &str, config: &GenerationConfig) -> Result<String>;
}

impl<G: Generator + ?Sized> Generator for &G {
    fn generate(&self, prompt: &str, config: &GenerationConfig) -> Result<String> {
        (**self).generate(prompt, config)
    }
}

impl<G: Generator + ?Sized> Generator for std::sync::Arc<G> {
    fn generate(&self, prompt: &str, config: &GenerationConfig) -> Result<String> {
        (**self).generate(prompt, config)
    }
}

/// Cut a generated reply where the model starts writing the next speaker's turn
pub fn trim_reply(text: &str) -> &str {
    let cut = [ASSISTANT_LABEL, OTHER_LABEL]
        .iter()
        .filter_map(|label| text.find(label))
        .min()
        .unwrap_or(text.len());
    text[..cut].trim()
}

/// Conversation state over a bounded window of recent turns
pub struct ChatBot<G> {
    model: G,
    messages: VecDeque<(&'static str, String)>,
    context_window: usize,
    generation: GenerationConfig,
}

impl<G: Generator> ChatBot<G> {
    pub fn new(model: G, context_window: usize) -> Result<Self> {
        Self::with_generation(model, context_window, GenerationConfig::chat())
    }

    pub fn with_generation(model: G, context_window: usize, generation: GenerationConfig) -> Result<Self> {
        if context_window == 0 {
            bail!("context window must hold at least one turn");
        }
        Ok(Self {
            model,
            messages: VecDeque::with_capacity(context_window + 1),
            context_window,
            generation,
        })
    }

    fn push(&mut self, label: &'static str, content: String) {
        self.messages.push_back((label, content));
        while self.messages.len() > self.context_window {
            self.messages.pop_front();
        }
    }

    /// Record an incoming message and render the prompt for the reply
    pub fn add_input_and_make_prompt(&mut self, input: &str) -> String {
        self.push(OTHER_LABEL, input.to_string());

        let mut parts: Vec<String> = self
            .messages
            .iter()
            .map(|(label, content)| tag_line(label, content))
            .collect();
        parts.push(format!("{}: ", ASSISTANT_LABEL));
        parts.join("\n")
    }

    /// Reply to `content`, remembering both sides of the exchange
    pub fn add_message(&mut self, content: &str) -> Result<String> {
        let prompt = self.add_input_and_make_prompt(content);
        log::debug!("Prompt:\n{}", prompt);

        let text = self.model.generate(&prompt, &self.generation)?;
        let reply = trim_reply(&text).to_string();
        self.push(ASSISTANT_LABEL, reply.clone());
        Ok(reply)
    }

    pub fn reset(&mut self) {
        self.messages.clear();
    }

    pub fn history(&self) -> impl Iterator<Item = (&str, &str)> {
        self.messages.iter().map(|(l, c)| (*l, c.as_str()))
    }

    pub fn context_window(&self) -> usize {
        self.context_window
    }

    pub fn generation(&self) -> &GenerationConfig {
        &self.generation
    }

    pub fn generation_mut(&mut self) -> &mut GenerationConfig {
        &mut self.generation
    }

    pub fn model(&self) -> &G {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    /// Replies with a canned string and records every prompt
    struct Echo {
        reply: String,
        prompts: RefCell<Vec<String>>,
    }

    impl Echo {
        fn new(reply: &str) -> Self {
            Self {
                reply: reply.to_string(),
                prompts: RefCell::new(Vec::new()),
            }
        }
    }

    impl Generator for Echo {
        fn generate(&self, prompt: &str, _config: &GenerationConfig) -> Result<String> {
            self.prompts.borrow_mut().push(prompt.to_string());
            Ok(self.reply.clone())
        }
    }

    #[test]
    fn first_prompt_has_input_and_open_reply() {
        let mut bot = ChatBot::new(Echo::new("x"), 6).unwrap();
        assert_eq!(bot.add_input_and_make_prompt("hi"), "[OTHER]: hi\n[ASSISTANT]: ");
    }

    #[test]
    fn replies_are_remembered() {
        let mut bot = ChatBot::new(Echo::new("  sup  "), 6).unwrap();
        assert_eq!(bot.add_message("hi").unwrap(), "sup");
        bot.add_message("how are you").unwrap();

        let prompts = bot.model().prompts.borrow();
        assert_eq!(
            prompts[1],
            "[OTHER]: hi\n[ASSISTANT]: sup\n[OTHER]: how are you\n[ASSISTANT]: "
        );
    }

    #[test]
    fn window_keeps_only_recent_turns() {
        let mut bot = ChatBot::new(Echo::new("ok"), 3).unwrap();
        for i in 0..5 {
            bot.add_message(&format!("m{i}")).unwrap();
        }
        assert_eq!(bot.history().count(), 3);

        let prompt = bot.add_input_and_make_prompt("last");
        assert_eq!(prompt, "[OTHER]: m4\n[ASSISTANT]: ok\n[OTHER]: last\n[ASSISTANT]: ");
    }

    #[test]
    fn invented_turns_are_cut() {
        assert_eq!(trim_reply("sure thing\n[OTHER]: no way"), "sure thing");
        assert_eq!(trim_reply("a [ASSISTANT]: b [OTHER]: c"), "a");
        assert_eq!(trim_reply(" plain "), "plain");
    }

    #[test]
    fn reset_clears_history() {
        let mut bot = ChatBot::new(Echo::new("ok"), 2).unwrap();
        bot.add_message("hi").unwrap();
        bot.reset();
        assert_eq!(bot.history().count(), 0);
    }

    #[test]
    fn zero_window_is_rejected() {
        assert!(ChatBot::new(Echo::new("ok"), 0).is_err());
    }
}
