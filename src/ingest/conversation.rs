//! Chat-export input: turns a conversation tree (a `mapping` of nodes with
//! parent links plus the `current_node` leaf) into an ingestible [`Document`].
//!
//! Only the active branch is kept. It is rebuilt by walking parent links back
//! from `current_node`, so edits and regenerations on abandoned branches never
//! reach the graph.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use crate::ingest::atomizer::Document;

#[derive(Debug, Clone, Deserialize)]
pub struct Conversation {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub mapping: HashMap<String, ConversationNode>,
    #[serde(default)]
    pub current_node: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConversationNode {
    #[serde(default)]
    pub message: Option<RawMessage>,
    #[serde(default)]
    pub parent: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawMessage {
    pub author: Author,
    #[serde(default)]
    pub content: Option<RawContent>,
    /// Seconds since the epoch, fractional.
    #[serde(default)]
    pub create_time: Option<f64>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Author {
    pub role: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawContent {
    #[serde(default)]
    pub parts: Vec<Value>,
}

/// Image or file attachment carried by a message part.
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub content_type: String,
    pub asset_pointer: Option<String>,
    pub image_url: Option<String>,
}

/// One message of the active branch.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub role: String,
    pub text: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub model_slug: Option<String>,
    pub attachments: Vec<Attachment>,
}

/// Read a chat export (a JSON array of conversations).
pub fn load_conversations(path: impl AsRef<Path>) -> Result<Vec<Conversation>> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read conversations from {}", path.display()))?;
    let conversations: Vec<Conversation> = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not a conversation export", path.display()))?;
    tracing::info!(path = %path.display(), count = conversations.len(), "conversations loaded");
    Ok(conversations)
}

impl Conversation {
    /// Messages on the branch ending at `current_node`, oldest first. Nodes
    /// without a message, and messages with neither text nor attachments, are
    /// skipped. A parent cycle ends the walk.
    pub fn linear_messages(&self) -> Vec<Message> {
        let mut messages = Vec::new();
        let mut seen = BTreeSet::new();
        let mut cursor = self.current_node.as_deref();
        while let Some(id) = cursor {
            if !seen.insert(id) {
                tracing::warn!(node = id, "parent cycle in conversation mapping");
                break;
            }
            let Some(node) = self.mapping.get(id) else {
                break;
            };
            if let Some(message) = node.message.as_ref().and_then(Message::from_raw) {
                messages.push(message);
            }
            cursor = node.parent.as_deref();
        }
        messages.reverse();
        messages
    }

    /// Render the active branch as `[user]` / `[agent]` blocks. System and
    /// tool messages are dropped. Returns `None` when nothing is left.
    pub fn to_document(&self) -> Option<Document> {
        let blocks: Vec<String> = self
            .linear_messages()
            .iter()
            .filter(|m| !m.text.trim().is_empty())
            .filter_map(|m| {
                let speaker = match m.role.as_str() {
                    "user" => "user",
                    "assistant" => "agent",
                    _ => return None,
                };
                Some(format!("[{speaker}]\n{}\n", m.text.trim()))
            })
            .collect();
        if blocks.is_empty() {
            return None;
        }
        let document = Document::new(blocks.join("\n"));
        Some(match &self.id {
            Some(id) => document.with_source(format!("conversation:{id}")),
            None => document,
        })
    }
}

impl Message {
    fn from_raw(raw: &RawMessage) -> Option<Self> {
        let parts = raw.content.as_ref().map(|c| c.parts.as_slice()).unwrap_or_default();
        let mut text = String::new();
        let mut attachments = Vec::new();
        for part in parts {
            match part {
                Value::String(s) => text.push_str(s),
                Value::Object(fields) => {
                    let content_type = fields
                        .get("content_type")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    if content_type.to_lowercase().contains("image")
                        || fields.contains_key("asset_pointer")
                    {
                        let field = |name: &str| {
                            fields.get(name).and_then(Value::as_str).map(str::to_string)
                        };
                        attachments.push(Attachment {
                            content_type: content_type.to_string(),
                            asset_pointer: field("asset_pointer"),
                            image_url: field("image_url"),
                        });
                    }
                }
                _ => {}
            }
        }
        if text.is_empty() && attachments.is_empty() {
            return None;
        }

        let timestamp = raw.create_time.and_then(|secs| {
            let whole = secs.floor();
            let nanos = ((secs - whole) * 1e9) as u32;
            DateTime::from_timestamp(whole as i64, nanos)
        });
        let model_slug = raw
            .metadata
            .as_ref()
            .and_then(|m| m.get("model_slug"))
            .and_then(Value::as_str)
            .map(str::to_string);

        Some(Self {
            role: raw.author.role.clone(),
            text,
            timestamp,
            model_slug,
            attachments,
        })
    }
}
