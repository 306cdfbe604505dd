//! Meetmesh - peer-to-peer meeting signaling and admission core
//!
//! This library runs the client side of a small video meeting over a shared
//! realtime key-value store:
//!
//! - **Store adapter**: typed read/write/subscribe over a hierarchical store,
//!   namespaced per meeting
//! - **Peer mesh**: one WebRTC connection per remote participant, negotiated
//!   through per-user signaling mailboxes
//! - **Media control**: camera/microphone capture, screen share and quality
//!   profiles with in-place track replacement
//! - **Meeting state**: live meeting, roster and waiting-room snapshots
//! - **Admission**: pre-join, waiting room, host approval and forced exits
//!
//! # Examples
//!
//! ```rust,no_run
//! use meetmesh_core::{Identity, MeetingSession, MeetingSettings, MemoryStore, Uid};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let store = Arc::new(MemoryStore::new());
//! let host = Identity::member(Uid::parse("alice")?, "Alice");
//!
//! let meeting =
//!     MeetingSession::create_meeting(store.clone(), &host, "Standup", MeetingSettings::default())
//!         .await?;
//! let session = MeetingSession::builder(store, meeting.id.clone())
//!     .with_identity(host)
//!     .build()
//!     .await?;
//!
//! session.join("Alice", true, true).await?;
//! session.toggle_mic().await?;
//! session.leave().await?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

/// Core meeting records and value types
pub mod types;

/// User identity and guest generation
pub mod identity;

/// Realtime store adapter
pub mod store;

/// Typed meeting records over the store
pub mod records;

/// Signaling envelopes and mailboxes
pub mod signaling;

/// Connection backend seam
pub mod connection;

/// `webrtc` crate connection backend
#[cfg(feature = "webrtc-backend")]
pub mod webrtc_backend;

/// Peer connection management
pub mod peer;

/// Local media tracks and controller
pub mod media;

/// Meeting state synchronizer
pub mod sync;

/// Admission state machine
pub mod admission;

/// Meeting chat
pub mod chat;

/// Hosted media service seam
pub mod media_service;

/// Session orchestration and UI intents
pub mod session;

/// Mock connections and test helpers
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

// Re-export main types at crate root
pub use admission::{
    AdmissionError, AdmissionMachine, ExitReason, JoinPlan, Presence, Stage, Transition,
};
pub use chat::{ChatError, ChatFeed, ChatState};
pub use connection::{
    ConnectionError, ConnectionEvent, ConnectionFactory, ConnectionState, RemoteTrack,
    RtcConnection,
};
pub use identity::{AvatarColor, Identity, IdentityProvider, StaticIdentity, Uid};
pub use media::{
    LocalTrack, MediaController, MediaDevices, MediaError, MediaNotice, MediaStatus,
    SyntheticDevices, TrackKind, TrackSource,
};
pub use media_service::{
    LocalTokenIssuer, MediaServiceError, MediaTokenGrant, MediaTokenIssuer, MediaTokenRequest,
    MediaTransport,
};
pub use peer::{
    InitiatorPolicy, PeerError, PeerManager, PeerManagerConfig, PeerManagerEvent, RemoteStream,
    DEFAULT_ICE_SERVERS,
};
pub use records::MeetingRecords;
pub use session::{
    factory_builder, FactoryBuilder, MeetingSession, MeetingSessionBuilder, SessionConfig,
    SessionError, SessionEvent,
};
pub use signaling::{SignalKind, SignalPayload, SignalingEnvelope, SignalingError, SignalingMailbox};
pub use store::{MemoryStore, RealtimeStore, Snapshot, StoreError, StorePath, Subscription};
pub use sync::{MeetingSnapshot, MeetingSync};
pub use types::*;
#[cfg(feature = "webrtc-backend")]
pub use webrtc_backend::{WebRtcConnection, WebRtcConnectionFactory};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::admission::{ExitReason, Stage};
    pub use crate::identity::{Identity, Uid};
    pub use crate::media::{MediaNotice, MediaStatus};
    pub use crate::session::{MeetingSession, SessionConfig, SessionError, SessionEvent};
    pub use crate::store::{MemoryStore, RealtimeStore};
    pub use crate::types::{MeetingId, MeetingSettings, QualityProfile};
}
