//! Meeting chat

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::admission::Stage;
use crate::identity::Identity;
use crate::records::{decode_chat, MeetingRecords};
use crate::store::StoreError;
use crate::sync::MeetingSnapshot;
use crate::types::ChatMessage;

/// Chat errors
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// Nothing left after trimming
    #[error("Message is empty")]
    Empty,

    /// Chat turned off by the host
    #[error("Chat is disabled in this meeting")]
    Disabled,

    /// Sender not admitted
    #[error("Only participants can send messages")]
    NotInMeeting,

    /// Store operation failed
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Chat history as last received
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatState {
    /// Messages ordered by creation time
    pub messages: Vec<ChatMessage>,
    /// Set until the first snapshot arrives
    pub loading: bool,
}

/// Live chat history of one meeting
pub struct ChatFeed {
    state: watch::Receiver<ChatState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ChatFeed {
    /// Subscribe to the meeting's chat
    pub async fn start(records: &MeetingRecords) -> Result<Self, StoreError> {
        let mut subscription = records
            .store()
            .subscribe(&records.paths().chat_messages())
            .await?;
        let (tx, rx) = watch::channel(ChatState {
            messages: Vec::new(),
            loading: true,
        });
        let task = tokio::spawn(async move {
            while let Some(snapshot) = subscription.next().await {
                tx.send_replace(ChatState {
                    messages: decode_chat(&snapshot),
                    loading: false,
                });
            }
        });
        Ok(Self {
            state: rx,
            task: Mutex::new(Some(task)),
        })
    }

    /// Latest messages
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.state.borrow().messages.clone()
    }

    /// Latest-value channel
    pub fn watch(&self) -> watch::Receiver<ChatState> {
        self.state.clone()
    }

    /// Stop listening
    pub fn close(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for ChatFeed {
    fn drop(&mut self) {
        self.close();
    }
}

/// Validate and append a message from `sender`
///
/// # Errors
///
/// Fails for blank text, outside the meeting stage, when chat is disabled,
/// or when the write fails
#[tracing::instrument(skip(records, snapshot, sender, text), fields(meeting_id = %records.meeting_id(), uid = %sender.uid()))]
pub async fn send_message(
    records: &MeetingRecords,
    snapshot: &MeetingSnapshot,
    stage: Stage,
    sender: &Identity,
    text: &str,
) -> Result<ChatMessage, ChatError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(ChatError::Empty);
    }
    if stage != Stage::InMeeting {
        return Err(ChatError::NotInMeeting);
    }
    if snapshot
        .meeting
        .as_ref()
        .is_some_and(|m| !m.settings.chat_enabled)
    {
        return Err(ChatError::Disabled);
    }
    let message = records
        .append_chat(sender.uid(), sender.name(), text)
        .await
        .inspect_err(|e| tracing::error!(error = %e, "Failed to send chat message"))?;
    tracing::debug!(message_id = %message.id, "Chat message sent");
    Ok(message)
}
