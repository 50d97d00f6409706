//! Per-connection session state.
//!
//! Owned by exactly one connection task and dropped when it ends.

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionState {
    last_message: Option<String>,
}

impl SessionState {
    /// Replace the last chat message.
    pub fn record_message(&mut self, msg: impl Into<String>) {
        self.last_message = Some(msg.into());
    }

    /// Last chat message, or `""` when none has arrived yet.
    pub fn last_message(&self) -> &str {
        self.last_message.as_deref().unwrap_or_default()
    }
}
