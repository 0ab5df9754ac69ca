//! Bounded per-agent conversation buffer.
//!
//! Conversations are append-only and strictly ordered by `seq`. Only the
//! newest messages are retained; older ones fold into a single summary slot
//! so the buffer cannot grow without bound on chatty agents.

use chrono::Utc;

use super::{Message, MessageSender};

/// How many messages are retained before compaction kicks in.
pub const RETAINED_MESSAGES: usize = 200;

/// Append-only message buffer with drop-oldest compaction.
#[derive(Debug, Default)]
pub struct ConversationBuffer {
    messages: std::collections::VecDeque<Message>,
    /// One-slot digest of everything compacted away.
    summary: Option<String>,
    compacted: u64,
    next_seq: u64,
    capacity: usize,
}

impl ConversationBuffer {
    pub fn new() -> Self {
        Self::with_capacity(RETAINED_MESSAGES)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            messages: std::collections::VecDeque::new(),
            summary: None,
            compacted: 0,
            next_seq: 0,
            capacity: capacity.max(1),
        }
    }

    /// Append a message, assigning the next sequence number.
    ///
    /// Returns a clone of the stored message (with `seq` and `timestamp`
    /// filled in) for event emission.
    pub fn push(&mut self, from: MessageSender, text: impl Into<String>) -> Message {
        let message = Message {
            from,
            text: text.into(),
            timestamp: Utc::now(),
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.messages.push_back(message.clone());

        while self.messages.len() > self.capacity {
            if let Some(old) = self.messages.pop_front() {
                self.compacted += 1;
                let prefix: String = old.text.chars().take(80).collect();
                self.summary = Some(format!(
                    "{} earlier messages compacted; last: {} {}",
                    self.compacted, old.from, prefix
                ));
            }
        }

        message
    }

    /// Ordered snapshot of the retained messages.
    pub fn messages(&self) -> Vec<Message> {
        self.messages.iter().cloned().collect()
    }

    /// Digest of compacted history, if any messages have been dropped.
    pub fn summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seq_is_monotonic_and_dense() {
        let mut buf = ConversationBuffer::new();
        for i in 0..5 {
            let m = buf.push(MessageSender::Human, format!("m{i}"));
            assert_eq!(m.seq, i);
        }
        let seqs: Vec<u64> = buf.messages().iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn overflow_compacts_oldest_into_summary() {
        let mut buf = ConversationBuffer::with_capacity(3);
        for i in 0..5 {
            buf.push(MessageSender::Agent, format!("message {i}"));
        }
        assert_eq!(buf.len(), 3);
        // Oldest two are gone but seq keeps counting from the start.
        assert_eq!(buf.messages()[0].seq, 2);
        let summary = buf.summary().expect("summary should be set");
        assert!(summary.contains("2 earlier messages"));
        assert!(summary.contains("message 1"));
    }

    #[test]
    fn no_summary_before_overflow() {
        let mut buf = ConversationBuffer::with_capacity(10);
        buf.push(MessageSender::Human, "hello");
        assert!(buf.summary().is_none());
    }
}
