//! Outbound delivery: trimming, blank fallback and splitting long replies.

use anyhow::Result;
use async_trait::async_trait;

/// Sent when the final content is blank after trimming.
pub const BLANK_REPLY: &str = "brrr... my brain went blank! Try asking again?";

/// Sent when a turn fails for any reason.
pub const ERROR_REPLY: &str = "brrr... something went wrong! Try again?";

/// Where replies for one incoming message go.
#[async_trait]
pub trait ReplySink: Send + Sync {
    /// Send as a reply to the incoming message.
    async fn reply(&self, text: &str) -> Result<()>;
    /// Send as a plain message in the same channel.
    async fn send(&self, text: &str) -> Result<()>;
}

/// Split on fixed character boundaries. Never splits inside a UTF-8 sequence.
pub fn chunk_message(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(max_chars)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

/// Deliver final content: the first chunk as a reply, the rest as plain
/// sends, in order. Returns how many messages went out.
pub async fn deliver(sink: &dyn ReplySink, content: &str, max_chars: usize) -> Result<usize> {
    let trimmed = content.trim();
    let text = if trimmed.is_empty() {
        BLANK_REPLY
    } else {
        trimmed
    };

    let chunks = chunk_message(text, max_chars);
    for (i, chunk) in chunks.iter().enumerate() {
        if i == 0 {
            sink.reply(chunk).await?;
        } else {
            sink.send(chunk).await?;
        }
    }
    if chunks.len() > 1 {
        tracing::debug!("Reply split into {} messages", chunks.len());
    }
    Ok(chunks.len())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum Sent {
        Reply(String),
        Send(String),
    }

    impl Sent {
        pub fn text(&self) -> &str {
            match self {
                Sent::Reply(t) | Sent::Send(t) => t,
            }
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub sent: Mutex<Vec<Sent>>,
    }

    impl RecordingSink {
        pub fn messages(&self) -> Vec<Sent> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ReplySink for RecordingSink {
        async fn reply(&self, text: &str) -> Result<()> {
            self.sent.lock().unwrap().push(Sent::Reply(text.to_string()));
            Ok(())
        }

        async fn send(&self, text: &str) -> Result<()> {
            self.sent.lock().unwrap().push(Sent::Send(text.to_string()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn long_output_is_split_into_ordered_chunks() {
        let content: String = (0..3000).map(|i| (b'a' + (i % 26) as u8) as char).collect();
        let sink = RecordingSink::default();
        let count = deliver(&sink, &content, 2000).await.unwrap();

        let sent = sink.messages();
        assert_eq!(count, 2);
        assert!(matches!(sent[0], Sent::Reply(_)));
        assert!(matches!(sent[1], Sent::Send(_)));
        assert!(sent.iter().all(|m| m.text().chars().count() <= 2000));
        let joined: String = sent.iter().map(Sent::text).collect();
        assert_eq!(joined, content);
    }

    #[tokio::test]
    async fn blank_content_gets_fallback() {
        let sink = RecordingSink::default();
        deliver(&sink, "  \n ", 2000).await.unwrap();
        assert_eq!(sink.messages(), vec![Sent::Reply(BLANK_REPLY.to_string())]);
    }

    #[test]
    fn chunking_counts_characters_not_bytes() {
        let text = "é".repeat(5);
        let chunks = chunk_message(&text, 2);
        assert_eq!(chunks, vec!["éé", "éé", "é"]);
    }

    #[test]
    fn short_text_is_a_single_chunk() {
        assert_eq!(chunk_message("hi", 2000), vec!["hi"]);
    }
}
