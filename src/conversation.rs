//! Ordered log of exchanged messages.

use chrono::{DateTime, Local};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sender {
    User,
    Assistant,
}

/// A single chat message. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    sender: Sender,
    text: String,
    timestamp: DateTime<Local>,
}

impl Message {
    fn new(sender: Sender, text: String) -> Self {
        Self {
            sender,
            text,
            timestamp: Local::now(),
        }
    }

    pub fn sender(&self) -> Sender {
        self.sender
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn timestamp(&self) -> DateTime<Local> {
        self.timestamp
    }
}

/// Append/clear-only message log. Insertion order is chronological order.
#[derive(Debug, Default)]
pub struct ConversationStore {
    messages: Vec<Message>,
    epoch: u64,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message. Blank text is dropped; messages are never empty.
    pub fn push(&mut self, sender: Sender, text: impl Into<String>) -> Option<&Message> {
        let text = text.into();
        if text.trim().is_empty() {
            return None;
        }
        self.messages.push(Message::new(sender, text));
        self.messages.last()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.epoch += 1;
    }

    /// Lazy view over the current contents. Call again to restart.
    pub fn iter(&self) -> std::slice::Iter<'_, Message> {
        self.messages.iter()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Number of times the log has been cleared.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_insertion_order_without_dedup() {
        let mut store = ConversationStore::new();
        store.push(Sender::User, "hi");
        store.push(Sender::Assistant, "hello");
        store.push(Sender::User, "hi");

        let texts: Vec<&str> = store.iter().map(Message::text).collect();
        assert_eq!(texts, ["hi", "hello", "hi"]);
        assert!(store.iter().next().unwrap().timestamp() <= store.iter().last().unwrap().timestamp());
    }

    #[test]
    fn blank_text_is_not_stored() {
        let mut store = ConversationStore::new();
        assert!(store.push(Sender::User, "   ").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn clear_empties_and_bumps_epoch() {
        let mut store = ConversationStore::new();
        store.push(Sender::User, "one");
        store.clear();
        assert!(store.is_empty());
        assert_eq!(store.epoch(), 1);

        store.push(Sender::Assistant, "two");
        assert_eq!(store.len(), 1);
        assert_eq!(store.iter().last().unwrap().sender(), Sender::Assistant);
    }
}
