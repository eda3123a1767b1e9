//! Append-only conversation transcript
//!
//! The transcript is the single source of truth rendered by the view layer.
//! Entries are created by the session controller when an exchange completes
//! and are never edited or removed; ordering is append order, which is
//! completion order for the operation that produced the entry.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use tokio::sync::broadcast;

/// Who produced a transcript entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        })
    }
}

/// Which input path produced a transcript entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Origin {
    /// Typed text submission
    AdminText,
    /// Push-to-talk voice recording
    VoiceRecording,
    /// Continuous listening turn
    LiveListening,
    /// Scheduler- or server-injected idle message
    Periodic,
    /// Attached image notice
    ImageUpload,
    /// One-shot greeting at session start
    Greeting,
}

/// One immutable line of the conversation
#[derive(Debug, Clone, Serialize)]
pub struct TranscriptEntry {
    pub role: Role,
    pub content: String,
    pub origin: Origin,
    pub timestamp: DateTime<Utc>,
}

impl TranscriptEntry {
    pub fn new(role: Role, content: impl Into<String>, origin: Origin) -> Self {
        Self {
            role,
            content: content.into(),
            origin,
            timestamp: Utc::now(),
        }
    }
}

/// Ordered log of transcript entries with change notification
///
/// Appends are O(1) and preserve arrival order. There is no update or delete;
/// concurrent completions are already serialized by the controller's single
/// dispatch task, so no locking is needed here.
pub struct TranscriptStore {
    entries: Vec<TranscriptEntry>,
    update_tx: broadcast::Sender<TranscriptEntry>,
}

impl TranscriptStore {
    pub fn new() -> Self {
        let (update_tx, _) = broadcast::channel(100);
        Self {
            entries: Vec::new(),
            update_tx,
        }
    }

    /// Append an entry and notify subscribers
    ///
    /// A lagging or absent subscriber never blocks or fails the append.
    pub fn append(&mut self, entry: TranscriptEntry) {
        let _ = self.update_tx.send(entry.clone());
        self.entries.push(entry);
    }

    /// Read-only ordered snapshot for rendering
    #[allow(dead_code)]
    pub fn all(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Subscribe to appended entries
    pub fn subscribe(&self) -> broadcast::Receiver<TranscriptEntry> {
        self.update_tx.subscribe()
    }
}

impl Default for TranscriptStore {
    fn default() -> Self {
        Self::new()
    }
}
