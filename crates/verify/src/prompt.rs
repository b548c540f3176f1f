use async_trait::async_trait;
use meter_core::ReadingKind;
use std::sync::Mutex;

/// What the user should be asked for next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prompt {
    Photo { session_id: String, kind: ReadingKind },
    ManualEntry { session_id: String, kind: ReadingKind },
}

/// Outbound channel to the user (chat bot, console, push notification).
/// Delivery failures are the implementation's concern; the workflow does
/// not wait on the user's reply.
#[async_trait]
pub trait Prompter: Send + Sync {
    async fn prompt(&self, user_id: &str, prompt: Prompt);
}

/// Keeps every prompt in memory.
#[derive(Debug, Default)]
pub struct RecordingPrompter {
    sent: Mutex<Vec<(String, Prompt)>>,
}

impl RecordingPrompter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(String, Prompt)> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Prompter for RecordingPrompter {
    async fn prompt(&self, user_id: &str, prompt: Prompt) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push((user_id.to_string(), prompt));
        }
    }
}
