use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use crate::{ChatMimicError, Result};

/// One message of a chat transcript
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub author: String,
    pub content: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub start_time: DateTime<Utc>,
}

impl Turn {
    pub fn new(author: impl Into<String>, content: impl Into<String>, start_time: DateTime<Utc>) -> Self {
        Self {
            author: author.into(),
            content: content.into(),
            start_time,
        }
    }

    pub fn is_by(&self, author: &str) -> bool {
        self.author.to_lowercase() == author.to_lowercase()
    }

    pub fn is_blank(&self) -> bool {
        self.content.trim().is_empty()
    }
}

/// Transcript files are either a list of conversations or a single flat list
enum TranscriptFile {
    Conversations(Vec<Vec<Turn>>),
    Flat(Vec<Turn>),
}

impl TranscriptFile {
    fn into_conversations(self) -> Vec<Vec<Turn>> {
        match self {
            TranscriptFile::Conversations(conversations) => conversations,
            TranscriptFile::Flat(turns) => vec![turns],
        }
    }
}

/// Ordered list of turns loaded from a transcript file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Transcript {
    turns: Vec<Turn>,
}

impl Transcript {
    pub fn new(turns: Vec<Turn>) -> Self {
        Self { turns }
    }

    /// Parse every conversation in the document, concatenated in file order
    pub fn from_json_str(json: &str) -> Result<Self> {
        let file = parse_file(json)?;
        let turns = file.into_conversations().into_iter().flatten().collect();
        Ok(Self { turns })
    }

    /// Parse a single conversation by index
    pub fn from_conversation(json: &str, index: usize) -> Result<Self> {
        let mut conversations = parse_file(json)?.into_conversations();
        let count = conversations.len();
        if index >= count {
            return Err(ChatMimicError::Transcript(format!(
                "conversation {} requested but the transcript holds {}",
                index, count
            )));
        }
        Ok(Self {
            turns: conversations.swap_remove(index),
        })
    }

    /// Load a transcript file, optionally restricted to one conversation
    pub fn load<P: AsRef<Path>>(path: P, conversation: Option<usize>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        let transcript = match conversation {
            Some(index) => Self::from_conversation(&json, index)?,
            None => Self::from_json_str(&json)?,
        };
        log::info!("Loaded {} turns from {}", transcript.len(), path.display());
        Ok(transcript)
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Stable sort by timestamp
    pub fn sort_chronological(&mut self) {
        self.turns.sort_by_key(|t| t.start_time);
    }

    /// Fold runs of messages by the same author into a single turn
    pub fn merge_consecutive(&mut self) {
        let mut merged: Vec<Turn> = Vec::with_capacity(self.turns.len());
        for turn in self.turns.drain(..) {
            match merged.last_mut() {
                Some(last) if last.is_by(&turn.author) => {
                    last.content.push('\n');
                    last.content.push_str(&turn.content);
                }
                _ => merged.push(turn),
            }
        }
        self.turns = merged;
    }

    /// Distinct authors with their message counts, most active first.
    /// Names differing only in case count as one author, shown as first seen.
    pub fn authors(&self) -> Vec<(String, usize)> {
        let mut counts: BTreeMap<String, (&str, usize)> = BTreeMap::new();
        for turn in &self.turns {
            counts
                .entry(turn.author.to_lowercase())
                .or_insert((turn.author.as_str(), 0))
                .1 += 1;
        }
        let mut authors: Vec<(String, usize)> =
            counts.into_values().map(|(a, c)| (a.to_string(), c)).collect();
        authors.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        authors
    }

    /// Human readable dump of the transcript
    pub fn render(&self) -> String {
        let mut out = String::new();
        for turn in &self.turns {
            let _ = write!(
                out,
                "\n{} at {}\n{}\n",
                turn.author,
                turn.start_time.format("%H:%M:%S"),
                turn.content
            );
        }
        out
    }
}

impl<'a> IntoIterator for &'a Transcript {
    type Item = &'a Turn;
    type IntoIter = std::slice::Iter<'a, Turn>;

    fn into_iter(self) -> Self::IntoIter {
        self.turns.iter()
    }
}

fn parse_file(json: &str) -> Result<TranscriptFile> {
    match serde_json::from_str::<Vec<Vec<Turn>>>(json) {
        Ok(conversations) => Ok(TranscriptFile::Conversations(conversations)),
        Err(nested_err) => match serde_json::from_str::<Vec<Turn>>(json) {
            Ok(turns) => Ok(TranscriptFile::Flat(turns)),
            // report the error for the shape the document actually has
            Err(_) if looks_nested(json) => Err(nested_err.into()),
            Err(flat_err) => Err(flat_err.into()),
        },
    }
}

fn looks_nested(json: &str) -> bool {
    let mut chars = json.chars().filter(|c| !c.is_whitespace());
    chars.next() == Some('[') && chars.next() == Some('[')
}
