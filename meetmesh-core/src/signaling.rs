//! Signaling over the realtime store
//!
//! Offers, answers and ICE candidates are written into the recipient's mailbox
//! under `signaling/{to}/{offers|answers|iceCandidates}/{from}`. Offers and
//! answers occupy a single slot per sender, candidates are appended under
//! generated keys. The recipient deletes every slot right after reading it.
//!
//! Store delivery is not exactly-once: a slot can show up in several
//! snapshots before its removal lands. [`DuplicateFilter`] remembers which
//! envelopes were already handled.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

use crate::identity::Uid;
use crate::store::{MeetingPaths, RealtimeStore, Snapshot, StoreError, StorePath, Subscription};
use crate::types::{now_millis, Millis};

/// Signaling errors
#[derive(Error, Debug)]
pub enum SignalingError {
    /// Store operation failed
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Mailbox record could not be decoded
    #[error("Malformed {kind:?} from {from}: {reason}")]
    Malformed {
        /// Slot kind
        kind: SignalKind,
        /// Sender key of the slot
        from: String,
        /// Decoder message
        reason: String,
    },
}

/// Kind of signaling message, one mailbox folder each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SignalKind {
    /// Session offer
    Offer,
    /// Session answer
    Answer,
    /// ICE candidate
    IceCandidate,
}

impl SignalKind {
    /// Processing order within one mailbox snapshot
    pub const ALL: [SignalKind; 3] = [SignalKind::Offer, SignalKind::Answer, SignalKind::IceCandidate];

    /// Mailbox folder name
    pub fn segment(self) -> &'static str {
        match self {
            Self::Offer => "offers",
            Self::Answer => "answers",
            Self::IceCandidate => "iceCandidates",
        }
    }
}

/// Session description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Offer
    Offer,
    /// Answer
    Answer,
}

/// Session description exchanged through the mailbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    /// SDP text
    pub sdp: String,
}

impl SessionDescription {
    /// Build an offer
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Build an answer
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateFields {
    /// Candidate line
    pub candidate: String,
    /// Media stream identification tag
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    /// Media line index
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

/// Protocol payload of an envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalPayload {
    /// Session offer
    Offer(SessionDescription),
    /// Session answer
    Answer(SessionDescription),
    /// ICE candidate
    Candidate(CandidateFields),
}

impl SignalPayload {
    /// Mailbox kind of this payload
    pub fn kind(&self) -> SignalKind {
        match self {
            Self::Offer(_) => SignalKind::Offer,
            Self::Answer(_) => SignalKind::Answer,
            Self::Candidate(_) => SignalKind::IceCandidate,
        }
    }
}

/// Directional signaling message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingEnvelope {
    /// Sender
    pub from: Uid,
    /// Recipient
    pub to: Uid,
    /// Sender-side timestamp, unique per sender
    pub timestamp: Millis,
    /// Payload
    pub payload: SignalPayload,
}

/// Identity of an envelope for duplicate suppression
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EnvelopeId {
    /// Message kind
    pub kind: SignalKind,
    /// Sender
    pub from: Uid,
    /// Sender timestamp
    pub timestamp: Millis,
}

impl SignalingEnvelope {
    /// Duplicate-suppression key
    pub fn id(&self) -> EnvelopeId {
        EnvelopeId {
            kind: self.payload.kind(),
            from: self.from.clone(),
            timestamp: self.timestamp,
        }
    }

    /// Encode as a store record
    pub fn to_record(&self) -> Result<Value, SignalingError> {
        let value = match &self.payload {
            SignalPayload::Offer(desc) | SignalPayload::Answer(desc) => {
                serde_json::to_value(DescriptionRecord {
                    description: desc.clone(),
                    from: self.from.clone(),
                    timestamp: self.timestamp,
                })
            }
            SignalPayload::Candidate(fields) => serde_json::to_value(CandidateRecord {
                fields: fields.clone(),
                from: self.from.clone(),
                timestamp: self.timestamp,
            }),
        };
        value.map_err(|e| SignalingError::Malformed {
            kind: self.payload.kind(),
            from: self.from.to_string(),
            reason: e.to_string(),
        })
    }

    /// Decode a record read from the `kind` folder of `to`'s mailbox
    pub fn from_record(
        kind: SignalKind,
        slot_from: &str,
        to: &Uid,
        value: &Value,
    ) -> Result<Self, SignalingError> {
        let malformed = |reason: String| SignalingError::Malformed {
            kind,
            from: slot_from.to_string(),
            reason,
        };
        let (from, timestamp, payload) = match kind {
            SignalKind::Offer | SignalKind::Answer => {
                let record: DescriptionRecord =
                    serde_json::from_value(value.clone()).map_err(|e| malformed(e.to_string()))?;
                let payload = match (kind, record.description.sdp_type) {
                    (SignalKind::Offer, SdpType::Offer) => SignalPayload::Offer(record.description),
                    (SignalKind::Answer, SdpType::Answer) => SignalPayload::Answer(record.description),
                    (_, other) => {
                        return Err(malformed(format!("{other:?} stored in {} slot", kind.segment())))
                    }
                };
                (record.from, record.timestamp, payload)
            }
            SignalKind::IceCandidate => {
                let record: CandidateRecord =
                    serde_json::from_value(value.clone()).map_err(|e| malformed(e.to_string()))?;
                (record.from, record.timestamp, SignalPayload::Candidate(record.fields))
            }
        };
        if from.as_str() != slot_from {
            return Err(malformed(format!("record claims sender {from}")));
        }
        Ok(Self {
            from,
            to: to.clone(),
            timestamp,
            payload,
        })
    }
}

#[derive(Serialize, Deserialize)]
struct DescriptionRecord {
    #[serde(flatten)]
    description: SessionDescription,
    from: Uid,
    timestamp: Millis,
}

#[derive(Serialize, Deserialize)]
struct CandidateRecord {
    #[serde(flatten)]
    fields: CandidateFields,
    from: Uid,
    timestamp: Millis,
}

/// One slot found in a mailbox snapshot
#[derive(Debug)]
pub struct MailboxItem {
    /// Where the record lives; remove it once handled
    pub slot: StorePath,
    /// Raw record as read
    pub record: Value,
    /// Decoded envelope
    pub envelope: Result<SignalingEnvelope, SignalingError>,
}

/// Per-sender timestamp source that never repeats a value
#[derive(Debug, Default)]
pub struct EnvelopeClock {
    last: Mutex<Millis>,
}

impl EnvelopeClock {
    /// Next timestamp: wall clock, bumped past the previous one if needed
    pub fn next(&self) -> Millis {
        let mut last = self.last.lock();
        let ts = now_millis().max(*last + 1);
        *last = ts;
        ts
    }
}

/// Set of envelopes already handled
#[derive(Debug, Default)]
pub struct DuplicateFilter {
    seen: Mutex<HashSet<EnvelopeId>>,
}

impl DuplicateFilter {
    /// Create an empty filter
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `id`; returns `false` if it was already seen
    pub fn first_sighting(&self, id: &EnvelopeId) -> bool {
        self.seen.lock().insert(id.clone())
    }

    /// Whether `id` was seen
    pub fn contains(&self, id: &EnvelopeId) -> bool {
        self.seen.lock().contains(id)
    }

    /// Number of remembered envelopes
    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    /// Whether nothing is remembered
    pub fn is_empty(&self) -> bool {
        self.seen.lock().is_empty()
    }

    /// Forget everything; only safe once the mailbox itself is gone
    pub fn clear(&self) {
        self.seen.lock().clear();
    }
}

/// The local user's view of the signaling area of one meeting
pub struct SignalingMailbox {
    store: Arc<dyn RealtimeStore>,
    paths: MeetingPaths,
    local: Uid,
    clock: EnvelopeClock,
}

impl SignalingMailbox {
    /// Create a mailbox for `local`
    pub fn new(store: Arc<dyn RealtimeStore>, paths: MeetingPaths, local: Uid) -> Self {
        Self {
            store,
            paths,
            local,
            clock: EnvelopeClock::default(),
        }
    }

    /// Local uid
    pub fn local(&self) -> &Uid {
        &self.local
    }

    /// Path of the local mailbox
    pub fn path(&self) -> StorePath {
        self.paths.mailbox(&self.local)
    }

    /// Write `payload` into the mailbox of `to`
    #[tracing::instrument(skip(self, payload), fields(from = %self.local, to = %to, kind = ?payload.kind()))]
    pub async fn send(
        &self,
        to: &Uid,
        payload: SignalPayload,
    ) -> Result<SignalingEnvelope, SignalingError> {
        let envelope = SignalingEnvelope {
            from: self.local.clone(),
            to: to.clone(),
            timestamp: self.clock.next(),
            payload,
        };
        let kind = envelope.payload.kind();
        let mut slot = self.paths.mailbox_slot(to, kind, &self.local);
        if kind == SignalKind::IceCandidate {
            slot = slot.child(self.store.push_key());
        }
        self.store.write(&slot, envelope.to_record()?).await?;
        tracing::debug!(timestamp = envelope.timestamp, "Sent signaling message");
        Ok(envelope)
    }

    /// Subscribe to the local mailbox
    pub async fn subscribe(&self) -> Result<Subscription, SignalingError> {
        Ok(self.store.subscribe(&self.path()).await?)
    }

    /// Decode every slot in a mailbox snapshot
    ///
    /// Items come out offers first, then answers, then candidates in the
    /// order they were appended.
    pub fn parse_snapshot(&self, snapshot: &Snapshot) -> Vec<MailboxItem> {
        let mailbox = self.path();
        let Some(Value::Object(root)) = snapshot.value() else {
            return Vec::new();
        };

        let mut items = Vec::new();
        for kind in SignalKind::ALL {
            let Some(Value::Object(senders)) = root.get(kind.segment()) else {
                continue;
            };
            for (from, record) in senders {
                let slot = mailbox.child(kind.segment()).child(from);
                match kind {
                    SignalKind::Offer | SignalKind::Answer => items.push(MailboxItem {
                        envelope: SignalingEnvelope::from_record(kind, from, &self.local, record),
                        record: record.clone(),
                        slot,
                    }),
                    SignalKind::IceCandidate => {
                        let Some(candidates) = record.as_object() else {
                            items.push(MailboxItem {
                                envelope: Err(SignalingError::Malformed {
                                    kind,
                                    from: from.clone(),
                                    reason: "candidate folder is not an object".to_string(),
                                }),
                                record: record.clone(),
                                slot,
                            });
                            continue;
                        };
                        for (key, candidate) in candidates {
                            items.push(MailboxItem {
                                envelope: SignalingEnvelope::from_record(
                                    kind,
                                    from,
                                    &self.local,
                                    candidate,
                                ),
                                record: candidate.clone(),
                                slot: slot.child(key),
                            });
                        }
                    }
                }
            }
        }
        items
    }

    /// Delete a slot after it was read
    ///
    /// Offer and answer slots are reused by the sender. If the slot already
    /// holds a newer record it is left for the next snapshot. Returns whether
    /// the slot was removed.
    pub async fn consume(&self, item: &MailboxItem) -> Result<bool, SignalingError> {
        match self.store.read_once(&item.slot).await? {
            Some(current) if current != item.record => {
                tracing::debug!(slot = %item.slot, "Slot overwritten since read, keeping it");
                Ok(false)
            }
            _ => {
                self.store.remove(&item.slot).await?;
                Ok(true)
            }
        }
    }

    /// Delete the whole local mailbox
    #[tracing::instrument(skip(self), fields(uid = %self.local))]
    pub async fn clear(&self) -> Result<(), SignalingError> {
        self.store.remove(&self.path()).await?;
        tracing::debug!("Cleared signaling mailbox");
        Ok(())
    }
}

impl std::fmt::Debug for SignalingMailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingMailbox")
            .field("local", &self.local)
            .field("path", &self.path())
            .finish()
    }
}
