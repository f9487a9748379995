//! In-memory message arena for lineage checks
//!
//! Messages are stored by id and `previous_id` stays a key, so walks are
//! plain lookups. Every walk is bounded by the arena size; a dangling parent
//! or a cycle ends the walk instead of looping.

use crate::db::Message;
use std::collections::HashMap;

#[derive(Debug, Default, Clone)]
pub struct MessageArena {
    messages: HashMap<String, Message>,
}

impl MessageArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_messages(messages: impl IntoIterator<Item = Message>) -> Self {
        let mut arena = Self::new();
        for message in messages {
            arena.insert(message);
        }
        arena
    }

    pub fn insert(&mut self, message: Message) {
        self.messages.insert(message.id.clone(), message);
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.messages.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.messages.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.values()
    }

    /// Walk from `id` towards the root, `id` first.
    ///
    /// Returns `None` when `id` is absent or the walk cannot reach a root.
    #[cfg(test)]
    fn walk_up(&self, id: &str) -> Option<Vec<&Message>> {
        let mut current = self.messages.get(id)?;
        let mut path = vec![current];

        while let Some(parent_id) = current.previous_id.as_deref() {
            if path.len() > self.messages.len() {
                return None;
            }
            current = self.messages.get(parent_id)?;
            path.push(current);
        }
        Some(path)
    }

    /// Steps from `id` to its root; roots have depth 0
    #[cfg(test)]
    pub fn depth(&self, id: &str) -> Option<usize> {
        self.walk_up(id).map(|path| path.len() - 1)
    }

    /// Root-first chain ending at `id`
    #[cfg(test)]
    pub fn chain_to(&self, id: &str) -> Option<Vec<&Message>> {
        self.walk_up(id).map(|mut path| {
            path.reverse();
            path
        })
    }

    /// Whether `ancestor` lies on the path from `descendant` to its root.
    /// A message counts as its own ancestor.
    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> bool {
        let mut current = match self.messages.get(descendant) {
            Some(m) => m,
            None => return false,
        };
        for _ in 0..=self.messages.len() {
            if current.id == ancestor {
                return true;
            }
            match current.previous_id.as_deref().and_then(|p| self.messages.get(p)) {
                Some(parent) => current = parent,
                None => return false,
            }
        }
        false
    }

    /// Messages sharing `id`'s parent, itself included, by sequence number
    #[cfg(test)]
    pub fn siblings(&self, id: &str) -> Option<Vec<&Message>> {
        let message = self.messages.get(id)?;
        let mut siblings: Vec<&Message> = self
            .messages
            .values()
            .filter(|m| m.conversation_id == message.conversation_id && m.previous_id == message.previous_id)
            .collect();
        siblings.sort_by_key(|m| m.sequence_number);
        Some(siblings)
    }
}
