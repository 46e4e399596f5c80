//! The Session collaborator: an optional external participant that mirrors
//! appended messages, can compact the log, and stores arbitrary metadata
//! (titles, etc). On-disk persistence is left to the host process — this
//! seam only describes the contract. [`InMemorySessionCollaborator`] is a
//! reference implementation for tests and as a demonstration of the seam.

use agentcore_types::Message;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::RwLock;

#[async_trait]
pub trait SessionCollaborator: Send + Sync {
    async fn append(&self, message: Message);
    async fn append_many(&self, messages: Vec<Message>);
    async fn get_path(&self) -> Vec<Message>;
    async fn current_id(&self) -> Option<String>;
    async fn save(&self, dir: &str) -> Result<(), String>;
    /// Compact the log to roughly `ratio` of its current message count.
    async fn compact(&self, ratio: f32);
    async fn set_metadata(&self, key: &str, value: String);
    async fn get_metadata(&self, key: &str) -> Option<String>;
}

pub struct InMemorySessionCollaborator {
    id: String,
    messages: RwLock<Vec<Message>>,
    metadata: DashMap<String, String>,
}

impl InMemorySessionCollaborator {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            messages: RwLock::new(Vec::new()),
            metadata: DashMap::new(),
        }
    }
}

#[async_trait]
impl SessionCollaborator for InMemorySessionCollaborator {
    async fn append(&self, message: Message) {
        self.messages.write().expect("lock poisoned").push(message);
    }

    async fn append_many(&self, messages: Vec<Message>) {
        self.messages
            .write()
            .expect("lock poisoned")
            .extend(messages);
    }

    async fn get_path(&self) -> Vec<Message> {
        self.messages.read().expect("lock poisoned").clone()
    }

    async fn current_id(&self) -> Option<String> {
        Some(self.id.clone())
    }

    async fn save(&self, _dir: &str) -> Result<(), String> {
        // Persistence to disk is out of scope; this is a no-op hook point.
        Ok(())
    }

    /// Best-effort truncating "compaction": keeps the first message and the
    /// newest `ratio` fraction of the rest. Real summarisation quality is
    /// out of scope.
    async fn compact(&self, ratio: f32) {
        let mut messages = self.messages.write().expect("lock poisoned");
        if messages.len() <= 2 {
            return;
        }
        let keep_tail = ((messages.len() - 1) as f32 * ratio.clamp(0.0, 1.0)).ceil() as usize;
        let keep_tail = keep_tail.max(1).min(messages.len() - 1);
        let cutoff = messages.len() - keep_tail;
        let head = messages[0].clone();
        let tail: Vec<Message> = messages.split_off(cutoff);
        *messages = std::iter::once(head).chain(tail).collect();
    }

    async fn set_metadata(&self, key: &str, value: String) {
        self.metadata.insert(key.to_string(), value);
    }

    async fn get_metadata(&self, key: &str) -> Option<String> {
        self.metadata.get(key).map(|v| v.clone())
    }
}
