use chrono::Utc;
use dashmap::DashMap;

use crate::types::Conversation;

/// Per-conversation presence state, keyed solely by cid.
///
/// Conversations are created on first reference and never removed here.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    conversations: DashMap<String, Conversation>,
}

fn new_conversation(cid: &str) -> Conversation {
    Conversation {
        cid: cid.to_string(),
        agent_online: true,
        last_typing_at: None,
        next_seq: 0,
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, cid: &str) -> Conversation {
        self.conversations
            .entry(cid.to_string())
            .or_insert_with(|| new_conversation(cid))
            .clone()
    }

    /// Returns the value held before the write.
    pub fn set_agent_online(&self, cid: &str, online: bool) -> bool {
        let mut entry = self
            .conversations
            .entry(cid.to_string())
            .or_insert_with(|| new_conversation(cid));
        std::mem::replace(&mut entry.agent_online, online)
    }

    pub fn is_agent_online(&self, cid: &str) -> bool {
        self.get_or_create(cid).agent_online
    }

    /// Allocates the next append position for `cid`.
    pub fn next_seq(&self, cid: &str) -> u64 {
        let mut entry = self
            .conversations
            .entry(cid.to_string())
            .or_insert_with(|| new_conversation(cid));
        entry.next_seq += 1;
        entry.next_seq
    }

    pub fn touch_typing(&self, cid: &str) {
        let mut entry = self
            .conversations
            .entry(cid.to_string())
            .or_insert_with(|| new_conversation(cid));
        entry.last_typing_at = Some(Utc::now());
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }
}
