//! Peer connection seam
//!
//! [`RtcConnection`] is the part of a WebRTC peer connection the peer manager
//! drives. Connection callbacks (local candidates, inbound tracks, state
//! changes) are turned into [`PeerEvent`]s on a channel instead of being
//! handled inside the callback.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::identity::Uid;
use crate::media::{LocalTrack, TrackKind};
use crate::signaling::{CandidateFields, SessionDescription};

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// Session description rejected
    #[error("Invalid session description: {0}")]
    InvalidDescription(String),

    /// Candidate rejected
    #[error("Invalid ICE candidate: {0}")]
    InvalidCandidate(String),

    /// Operation in the wrong negotiation state
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    /// Track could not be attached or replaced
    #[error("Track error: {0}")]
    Track(String),

    /// Connection already closed
    #[error("Connection closed")]
    Closed,

    /// Backend failure
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Created, nothing exchanged yet
    New,
    /// Negotiating
    Connecting,
    /// Media can flow
    Connected,
    /// Transport lost, may recover
    Disconnected,
    /// Transport failed
    Failed,
    /// Closed locally
    Closed,
}

impl ConnectionState {
    /// Whether the remote stream should be dropped in this state
    pub fn drops_stream(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

/// Inbound track announced by a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    /// Track id
    pub id: String,
    /// Audio or video
    pub kind: TrackKind,
    /// Stream the track belongs to
    pub stream_id: String,
}

/// Something a connection reported
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Local ICE candidate to forward to the remote
    LocalCandidate(CandidateFields),
    /// Inbound track
    RemoteTrack(RemoteTrack),
    /// Lifecycle change
    StateChanged(ConnectionState),
}

/// Event tagged with the connection that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct PeerEvent {
    /// Remote uid
    pub remote: Uid,
    /// Id of the connection instance
    pub connection_id: u64,
    /// Event
    pub event: ConnectionEvent,
}

/// Where a connection reports its events
///
/// Events from a replaced connection carry the old `connection_id` and are
/// ignored by the manager.
#[derive(Debug, Clone)]
pub struct EventSink {
    remote: Uid,
    connection_id: u64,
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl EventSink {
    /// Create a sink for one connection
    pub fn new(remote: Uid, connection_id: u64, tx: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self {
            remote,
            connection_id,
            tx,
        }
    }

    /// Remote uid
    pub fn remote(&self) -> &Uid {
        &self.remote
    }

    /// Connection instance id
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Report an event; dropped silently once the manager is gone
    pub fn emit(&self, event: ConnectionEvent) {
        let _ = self.tx.send(PeerEvent {
            remote: self.remote.clone(),
            connection_id: self.connection_id,
            event,
        });
    }
}

/// One transport-level connection to a remote participant
#[async_trait]
pub trait RtcConnection: Send + Sync {
    /// Attach an outbound track
    async fn add_track(&self, track: &LocalTrack) -> Result<(), ConnectionError>;

    /// Swap the source feeding the outbound video sender without renegotiating
    ///
    /// Returns `false` when the connection has no video sender.
    async fn replace_video_track(&self, track: &LocalTrack) -> Result<bool, ConnectionError>;

    /// Build an offer
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, ConnectionError>;

    /// Build an answer to the current remote offer
    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError>;

    /// Apply a local description
    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), ConnectionError>;

    /// Apply a remote description
    async fn set_remote_description(&self, desc: &SessionDescription)
        -> Result<(), ConnectionError>;

    /// Apply a remote candidate
    async fn add_ice_candidate(&self, candidate: &CandidateFields) -> Result<(), ConnectionError>;

    /// Current state
    fn state(&self) -> ConnectionState;

    /// Close the connection
    async fn close(&self) -> Result<(), ConnectionError>;
}

/// Builds connections
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Create a connection to `remote` that reports into `sink`
    async fn create(
        &self,
        remote: &Uid,
        sink: EventSink,
    ) -> Result<Arc<dyn RtcConnection>, ConnectionError>;
}
