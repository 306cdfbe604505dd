//! Typed meeting records
//!
//! Read and write the meeting, participant, waiting-room and chat records of
//! one meeting. The store offers no transactions, so multi-record operations
//! are ordered so that an interrupted sequence leaves a state the admission
//! logic already handles.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::identity::{Identity, Uid};
use crate::store::{MeetingPaths, RealtimeStore, Snapshot, StoreError};
use crate::types::{
    now_millis, ChatMessage, DeviceFlag, Meeting, MeetingId, MeetingSettings, Participant,
    WaitingEntry,
};

/// Record access for one meeting
#[derive(Clone)]
pub struct MeetingRecords {
    store: Arc<dyn RealtimeStore>,
    meeting_id: MeetingId,
    paths: MeetingPaths,
}

impl MeetingRecords {
    /// Records of `meeting_id`
    pub fn new(store: Arc<dyn RealtimeStore>, meeting_id: MeetingId) -> Self {
        let paths = MeetingPaths::new(&meeting_id);
        Self {
            store,
            meeting_id,
            paths,
        }
    }

    /// Meeting id
    pub fn meeting_id(&self) -> &MeetingId {
        &self.meeting_id
    }

    /// Store paths of this meeting
    pub fn paths(&self) -> &MeetingPaths {
        &self.paths
    }

    /// Underlying store
    pub fn store(&self) -> &Arc<dyn RealtimeStore> {
        &self.store
    }

    /// Create the meeting record with `host` as host
    #[tracing::instrument(skip(self, host, title, settings), fields(meeting_id = %self.meeting_id, host = %host.uid()))]
    pub async fn create_meeting(
        &self,
        host: &Identity,
        title: impl Into<String>,
        settings: MeetingSettings,
    ) -> Result<Meeting, StoreError> {
        let meeting = Meeting {
            id: self.meeting_id.clone(),
            host_id: host.uid().clone(),
            host_name: host.name().to_string(),
            title: title.into(),
            created_at: now_millis(),
            is_active: true,
            settings,
        };
        self.store
            .write(&self.paths.meeting(), to_value(&meeting)?)
            .await?;
        tracing::info!("Meeting created");
        Ok(meeting)
    }

    /// Read the meeting record
    pub async fn meeting(&self) -> Result<Option<Meeting>, StoreError> {
        let value = self.store.read_once(&self.paths.meeting()).await?;
        value.map(from_value).transpose()
    }

    /// Set the active flag; returns `false` if the meeting no longer exists
    pub async fn set_meeting_active(&self, active: bool) -> Result<bool, StoreError> {
        let path = self.paths.meeting();
        if self.store.read_once(&path).await?.is_none() {
            return Ok(false);
        }
        let mut fields = Map::new();
        fields.insert("isActive".to_string(), Value::Bool(active));
        self.store.update(&path, fields).await?;
        tracing::info!(meeting_id = %self.meeting_id, active, "Meeting active flag set");
        Ok(true)
    }

    /// Delete the meeting and every record below it
    pub async fn delete_meeting(&self) -> Result<(), StoreError> {
        self.store.remove(self.paths.root()).await?;
        tracing::info!(meeting_id = %self.meeting_id, "Meeting deleted");
        Ok(())
    }

    /// Write a waiting-room entry
    pub async fn join_waiting_room(&self, entry: &WaitingEntry) -> Result<(), StoreError> {
        self.store
            .write(&self.paths.waiting_entry(&entry.uid), to_value(entry)?)
            .await?;
        tracing::debug!(meeting_id = %self.meeting_id, uid = %entry.uid, "Waiting entry written");
        Ok(())
    }

    /// Read one waiting-room entry
    pub async fn waiting_entry(&self, uid: &Uid) -> Result<Option<WaitingEntry>, StoreError> {
        let value = self.store.read_once(&self.paths.waiting_entry(uid)).await?;
        value.map(from_value).transpose()
    }

    /// Delete a waiting-room entry
    pub async fn remove_from_waiting_room(&self, uid: &Uid) -> Result<(), StoreError> {
        self.store.remove(&self.paths.waiting_entry(uid)).await
    }

    /// Write a participant record
    pub async fn add_participant(&self, participant: &Participant) -> Result<(), StoreError> {
        self.store
            .write(&self.paths.participant(&participant.uid), to_value(participant)?)
            .await?;
        tracing::debug!(
            meeting_id = %self.meeting_id,
            uid = %participant.uid,
            role = ?participant.role,
            "Participant written"
        );
        Ok(())
    }

    /// Read one participant
    pub async fn participant(&self, uid: &Uid) -> Result<Option<Participant>, StoreError> {
        let value = self.store.read_once(&self.paths.participant(uid)).await?;
        value.map(from_value).transpose()
    }

    /// Read the roster
    pub async fn participants(&self) -> Result<Vec<Participant>, StoreError> {
        let value = self.store.read_once(&self.paths.participants()).await?;
        Ok(decode_participants(&Snapshot(value)))
    }

    /// Delete a participant record
    pub async fn remove_participant(&self, uid: &Uid) -> Result<(), StoreError> {
        self.store.remove(&self.paths.participant(uid)).await?;
        tracing::debug!(meeting_id = %self.meeting_id, uid = %uid, "Participant removed");
        Ok(())
    }

    /// Set one device flag on a participant record
    ///
    /// Returns `false` without writing when the record is gone, so a late
    /// toggle cannot resurrect a removed participant.
    pub async fn set_device_flag(
        &self,
        uid: &Uid,
        flag: DeviceFlag,
        on: bool,
    ) -> Result<bool, StoreError> {
        let path = self.paths.participant(uid);
        if self.store.read_once(&path).await?.is_none() {
            return Ok(false);
        }
        let mut fields = Map::new();
        fields.insert(flag.field().to_string(), Value::Bool(on));
        self.store.update(&path, fields).await?;
        tracing::trace!(uid = %uid, flag = flag.field(), on, "Device flag written");
        Ok(true)
    }

    /// Promote a waiting entry to a participant
    ///
    /// The participant is written before the entry is removed. A client that
    /// reads the entry and then the participant always finds at least one of
    /// the two. Separate subscriptions give no such guarantee.
    #[tracing::instrument(skip(self, entry), fields(meeting_id = %self.meeting_id, uid = %entry.uid))]
    pub async fn admit(&self, entry: &WaitingEntry) -> Result<Participant, StoreError> {
        let participant = entry.admit(now_millis());
        self.add_participant(&participant).await?;
        self.remove_from_waiting_room(&entry.uid).await?;
        tracing::info!("Admitted");
        Ok(participant)
    }

    /// Delete a waiting entry without promoting it
    #[tracing::instrument(skip(self), fields(meeting_id = %self.meeting_id))]
    pub async fn reject(&self, uid: &Uid) -> Result<(), StoreError> {
        self.remove_from_waiting_room(uid).await?;
        tracing::info!("Rejected");
        Ok(())
    }

    /// Append a chat message
    pub async fn append_chat(
        &self,
        sender: &Uid,
        sender_name: &str,
        text: &str,
    ) -> Result<ChatMessage, StoreError> {
        let id = self.store.push_key();
        let message = ChatMessage {
            id: id.clone(),
            sender_id: sender.clone(),
            sender_name: sender_name.to_string(),
            text: text.to_string(),
            created_at: now_millis(),
        };
        self.store
            .write(&self.paths.chat_messages().child(&id), to_value(&message)?)
            .await?;
        Ok(message)
    }
}

impl std::fmt::Debug for MeetingRecords {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeetingRecords")
            .field("meeting_id", &self.meeting_id)
            .finish()
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, StoreError> {
    Ok(serde_json::to_value(value)?)
}

fn from_value<T: DeserializeOwned>(value: Value) -> Result<T, StoreError> {
    Ok(serde_json::from_value(value)?)
}

fn decode_children<T: DeserializeOwned>(snapshot: &Snapshot, what: &str) -> Vec<T> {
    snapshot
        .children()
        .into_iter()
        .filter_map(|(key, value)| match serde_json::from_value(value.clone()) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(key, error = %e, "Skipping malformed {what} record");
                None
            }
        })
        .collect()
}

/// Decode a meeting snapshot; a malformed record counts as absent
pub fn decode_meeting(snapshot: &Snapshot) -> Option<Meeting> {
    let value = snapshot.value()?;
    match serde_json::from_value(value.clone()) {
        Ok(meeting) => Some(meeting),
        Err(e) => {
            tracing::warn!(error = %e, "Malformed meeting record");
            None
        }
    }
}

/// Decode the roster, ordered by join time
pub fn decode_participants(snapshot: &Snapshot) -> Vec<Participant> {
    let mut participants: Vec<Participant> = decode_children(snapshot, "participant");
    participants.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then_with(|| a.uid.cmp(&b.uid)));
    participants
}

/// Decode the waiting room, ordered by request time
pub fn decode_waiting_room(snapshot: &Snapshot) -> Vec<WaitingEntry> {
    let mut entries: Vec<WaitingEntry> = decode_children(snapshot, "waiting entry");
    entries.sort_by(|a, b| {
        a.requested_at
            .cmp(&b.requested_at)
            .then_with(|| a.uid.cmp(&b.uid))
    });
    entries
}

/// Decode chat messages, ordered by creation time
pub fn decode_chat(snapshot: &Snapshot) -> Vec<ChatMessage> {
    let mut messages: Vec<ChatMessage> = decode_children(snapshot, "chat message");
    messages.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    messages
}
