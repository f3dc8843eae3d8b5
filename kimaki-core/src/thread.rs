use serde::{Deserialize, Serialize};

/// One chat turn arriving in a thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadMessage {
    pub thread_id: String,
    pub message_id: String,
    #[serde(default)]
    pub author: Option<String>,
    pub content: String,
}

/// Published state of a thread's serializer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ThreadState {
    #[default]
    Idle,
    Running,
    /// An interrupt was signalled and the running turn has not stopped yet.
    Interrupted,
}

impl ThreadState {
    pub fn as_str(self) -> &'static str {
        match self {
            ThreadState::Idle => "idle",
            ThreadState::Running => "running",
            ThreadState::Interrupted => "interrupted",
        }
    }
}
