//! Minimal Discord front end for a [`ChatBot`].

use anyhow::{anyhow, Context as _, Result};
use serenity::async_trait;
use serenity::model::channel::Message;
use serenity::model::gateway::Ready;
use serenity::model::user::OnlineStatus;
use serenity::prelude::*;
use std::sync::{Arc, Mutex};

use crate::chat::{ChatBot, Generator};
use crate::config::BotConfig;

/// Discord rejects messages longer than this many characters
pub const MESSAGE_LIMIT: usize = 2000;

/// Split `text` into chunks of at most `limit` characters, preferring line breaks
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for line in text.split('\n') {
        let line_len = line.chars().count();
        let sep = usize::from(!current.is_empty());

        if current_len + sep + line_len <= limit {
            if sep == 1 {
                current.push('\n');
            }
            current.push_str(line);
            current_len += sep + line_len;
            continue;
        }

        if !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }

        let chars: Vec<char> = line.chars().collect();
        let mut pieces = chars.chunks(limit).peekable();
        while let Some(piece) = pieces.next() {
            if pieces.peek().is_some() {
                chunks.push(piece.iter().collect());
            } else {
                current = piece.iter().collect();
                current_len = piece.len();
            }
        }
    }

    if !current.trim().is_empty() {
        chunks.push(current);
    }
    chunks.retain(|c| !c.trim().is_empty());
    chunks
}

struct Handler<G> {
    chatbot: Arc<Mutex<ChatBot<G>>>,
    config: BotConfig,
}

impl<G: Generator + Send + 'static> Handler<G> {
    async fn reply(&self, content: String) -> Result<String> {
        let chatbot = Arc::clone(&self.chatbot);
        tokio::task::spawn_blocking(move || {
            let mut chatbot = chatbot.lock().map_err(|_| anyhow!("chatbot lock poisoned"))?;
            chatbot.add_message(&content)
        })
        .await
        .context("generation task failed")?
    }
}

#[async_trait]
impl<G: Generator + Send + 'static> EventHandler for Handler<G> {
    async fn ready(&self, ctx: Context, ready: Ready) {
        ctx.set_presence(None, OnlineStatus::DoNotDisturb);
        log::info!("Ready: {}", ready.user.name);
    }

    async fn message(&self, ctx: Context, msg: Message) {
        let own_id = ctx.cache.current_user().id;
        if msg.author.id == own_id || !self.config.allows(msg.channel_id.get()) {
            return;
        }

        let reply = match self.reply(msg.content.clone()).await {
            Ok(reply) => reply,
            Err(e) => {
                log::error!("Failed to generate a reply: {:#}", e);
                return;
            }
        };

        let chunks = split_message(&reply, MESSAGE_LIMIT);
        if chunks.is_empty() {
            log::warn!("Generated an empty reply to {:?}", msg.content);
        }
        for chunk in chunks {
            if let Err(e) = msg.channel_id.say(&ctx.http, chunk).await {
                log::error!("Failed to send message: {}", e);
                break;
            }
        }
    }
}

/// Connect to Discord and answer messages until the connection ends
pub async fn serve<G: Generator + Send + 'static>(chatbot: ChatBot<G>, config: &BotConfig) -> Result<()> {
    let token = config.token()?;
    let intents =
        GatewayIntents::GUILD_MESSAGES | GatewayIntents::DIRECT_MESSAGES | GatewayIntents::MESSAGE_CONTENT;

    let handler = Handler {
        chatbot: Arc::new(Mutex::new(chatbot)),
        config: config.clone(),
    };

    let mut client = Client::builder(&token, intents)
        .event_handler(handler)
        .await
        .context("Error creating client")?;

    client.start().await.context("Discord client error")?;
    Ok(())
}

/// Blocking wrapper around [`serve`] for the synchronous front end
pub fn run_bot<G: Generator + Send + 'static>(chatbot: ChatBot<G>, config: &BotConfig) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    runtime.block_on(serve(chatbot, config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(split_message("hello\nthere", 2000), vec!["hello\nthere"]);
    }

    #[test]
    fn splits_on_line_breaks() {
        assert_eq!(split_message("aaa\nbbb\ncc", 7), vec!["aaa\nbbb", "cc"]);
    }

    #[test]
    fn hard_splits_long_lines() {
        assert_eq!(split_message("abcdefg", 3), vec!["abc", "def", "g"]);
        assert_eq!(split_message("x\nabcdefg", 3), vec!["x", "abc", "def", "g"]);
    }

    #[test]
    fn counts_characters_not_bytes() {
        let text = "é".repeat(4);
        assert_eq!(split_message(&text, 4), vec![text.clone()]);
    }

    #[test]
    fn blank_text_sends_nothing() {
        assert!(split_message("", 10).is_empty());
        assert!(split_message(" \n ", 10).is_empty());
    }
}
