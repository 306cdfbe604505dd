//! Peer connection management
//!
//! [`PeerManager`] holds one connection per remote participant (full mesh)
//! and runs the offer/answer/candidate exchange through the local
//! [`SignalingMailbox`]. Every signaling input and every connection callback
//! is handled by a single pump task ([`PeerManager::run`]), so handlers never
//! race each other.
//!
//! Failure policy: a failed connection gets one ICE restart in place. The
//! initiating side offers the restart at once; the other side waits
//! [`PeerManagerConfig::restart_grace_ms`] for that offer and restarts itself
//! if none came. A second failure closes and forgets the connection; the next
//! roster change creates a fresh one.
//!
//! The remote stream is dropped while a connection is disconnected or failed.
//! Inbound tracks are remembered per connection and republished when it
//! reconnects, since a recovered transport announces no tracks again.

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, RwLock};

use crate::connection::{
    ConnectionError, ConnectionEvent, ConnectionFactory, ConnectionState, EventSink, PeerEvent,
    RemoteTrack, RtcConnection,
};
use crate::identity::Uid;
use crate::media::{LocalTrack, OutboundTracks, TrackKind};
use crate::signaling::{
    CandidateFields, DuplicateFilter, EnvelopeId, SessionDescription, SignalKind, SignalPayload,
    SignalingEnvelope, SignalingError, SignalingMailbox,
};
use crate::store::{Snapshot, Subscription};
use crate::types::{Millis, Participant};

/// Public STUN servers used when none are configured
pub const DEFAULT_ICE_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Peer manager errors
#[derive(Error, Debug)]
pub enum PeerError {
    /// Operation on one connection failed
    #[error("Connection to {remote} failed: {source}")]
    Connection {
        /// Remote uid
        remote: Uid,
        /// Underlying error
        #[source]
        source: ConnectionError,
    },

    /// Mailbox write or read failed
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    /// Attempted to connect to the local uid
    #[error("Cannot connect to self")]
    SelfConnection,
}

fn conn_err(remote: &Uid) -> impl FnOnce(ConnectionError) -> PeerError + '_ {
    move |source| PeerError::Connection {
        remote: remote.clone(),
        source,
    }
}

/// Which side of a pair sends the first offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitiatorPolicy {
    /// Only the lexicographically smaller uid offers
    #[default]
    LowerUidInitiates,
    /// Both sides offer when they see each other
    Always,
}

/// Peer manager configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerManagerConfig {
    /// STUN/TURN server URLs
    pub ice_servers: Vec<String>,
    /// ICE restarts attempted per failure episode
    pub max_ice_restarts: u32,
    /// Offer initiation rule
    pub initiator_policy: InitiatorPolicy,
    /// How long the non-initiating side waits for a restart offer before
    /// restarting itself
    pub restart_grace_ms: u64,
}

impl Default for PeerManagerConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect(),
            max_ice_restarts: 1,
            initiator_policy: InitiatorPolicy::default(),
            restart_grace_ms: 2_000,
        }
    }
}

/// Media received from one remote participant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    /// Remote uid
    pub remote: Uid,
    /// Stream id announced by the remote
    pub stream_id: String,
    /// At most one track per kind
    pub tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    /// Inbound video track, if any
    pub fn video(&self) -> Option<&RemoteTrack> {
        self.tracks.iter().find(|t| t.kind == TrackKind::Video)
    }

    /// Inbound audio track, if any
    pub fn audio(&self) -> Option<&RemoteTrack> {
        self.tracks.iter().find(|t| t.kind == TrackKind::Audio)
    }
}

/// Peer manager events
#[derive(Debug, Clone, PartialEq)]
pub enum PeerManagerEvent {
    /// Connection created
    ConnectionCreated(Uid),
    /// Connection changed state
    ConnectionStateChanged {
        /// Remote uid
        remote: Uid,
        /// Previous state
        old_state: ConnectionState,
        /// New state
        new_state: ConnectionState,
    },
    /// ICE restart offered
    IceRestart(Uid),
    /// Connection closed and forgotten
    ConnectionDiscarded(Uid),
    /// Inbound media added or replaced
    RemoteStreamUpdated(RemoteStream),
    /// Inbound media gone
    RemoteStreamRemoved(Uid),
}

struct PeerRecord {
    connection: Arc<dyn RtcConnection>,
    connection_id: u64,
    state: ConnectionState,
    ice_restarts: u32,
    restart_deferred: bool,
    remote_description_set: bool,
    pending_candidates: Vec<CandidateFields>,
    remote_tracks: Vec<RemoteTrack>,
}

type DeferredRestart = (Uid, u64);

/// Peer Connection Manager
pub struct PeerManager {
    local: Uid,
    config: PeerManagerConfig,
    factory: Arc<dyn ConnectionFactory>,
    mailbox: Arc<SignalingMailbox>,
    peers: RwLock<HashMap<Uid, PeerRecord>>,
    streams: parking_lot::RwLock<HashMap<Uid, RemoteStream>>,
    local_tracks: parking_lot::RwLock<Vec<LocalTrack>>,
    roster: parking_lot::Mutex<HashSet<Uid>>,
    processed: DuplicateFilter,
    next_connection_id: AtomicU64,
    peer_events: mpsc::UnboundedSender<PeerEvent>,
    deferred_tx: mpsc::UnboundedSender<DeferredRestart>,
    deferred_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<DeferredRestart>>>,
    events: broadcast::Sender<PeerManagerEvent>,
}

impl PeerManager {
    /// Create a manager; the receiver carries connection callbacks and must
    /// be passed to [`PeerManager::run`]
    pub fn new(
        config: PeerManagerConfig,
        factory: Arc<dyn ConnectionFactory>,
        mailbox: Arc<SignalingMailbox>,
        event_capacity: usize,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<PeerEvent>) {
        let (peer_events, rx) = mpsc::unbounded_channel();
        let (deferred_tx, deferred_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(event_capacity.max(1));
        let manager = Arc::new(Self {
            local: mailbox.local().clone(),
            config,
            factory,
            mailbox,
            peers: RwLock::new(HashMap::new()),
            streams: parking_lot::RwLock::new(HashMap::new()),
            local_tracks: parking_lot::RwLock::new(Vec::new()),
            roster: parking_lot::Mutex::new(HashSet::new()),
            processed: DuplicateFilter::new(),
            next_connection_id: AtomicU64::new(1),
            peer_events,
            deferred_tx,
            deferred_rx: parking_lot::Mutex::new(Some(deferred_rx)),
            events,
        });
        (manager, rx)
    }

    /// Local uid
    pub fn local(&self) -> &Uid {
        &self.local
    }

    /// Subscribe to manager events
    pub fn subscribe(&self) -> broadcast::Receiver<PeerManagerEvent> {
        self.events.subscribe()
    }

    /// Whether `local` sends the first offer to `remote`
    pub fn initiates(&self, remote: &Uid) -> bool {
        match self.config.initiator_policy {
            InitiatorPolicy::Always => true,
            InitiatorPolicy::LowerUidInitiates => self.local < *remote,
        }
    }

    /// Tracks attached to connections created from now on
    pub fn set_local_tracks(&self, tracks: Vec<LocalTrack>) {
        tracing::debug!(count = tracks.len(), "Local tracks set");
        *self.local_tracks.write() = tracks;
    }

    /// Return the connection to `remote`, creating it if needed
    ///
    /// A new connection gets every current local track attached.
    #[tracing::instrument(skip(self), fields(local = %self.local))]
    pub async fn ensure_connection(
        &self,
        remote: &Uid,
    ) -> Result<Arc<dyn RtcConnection>, PeerError> {
        if *remote == self.local {
            return Err(PeerError::SelfConnection);
        }
        if let Some(record) = self.peers.read().await.get(remote) {
            return Ok(record.connection.clone());
        }

        let mut peers = self.peers.write().await;
        if let Some(record) = peers.get(remote) {
            return Ok(record.connection.clone());
        }

        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let sink = EventSink::new(remote.clone(), connection_id, self.peer_events.clone());
        let connection = self
            .factory
            .create(remote, sink)
            .await
            .map_err(conn_err(remote))?;

        let tracks = self.local_tracks.read().clone();
        for track in &tracks {
            if let Err(e) = connection.add_track(track).await {
                tracing::warn!(track_id = %track.id(), error = %e, "Failed to attach local track");
            }
        }

        peers.insert(
            remote.clone(),
            PeerRecord {
                connection: connection.clone(),
                connection_id,
                state: ConnectionState::New,
                ice_restarts: 0,
                restart_deferred: false,
                remote_description_set: false,
                pending_candidates: Vec::new(),
                remote_tracks: Vec::new(),
            },
        );
        drop(peers);

        tracing::debug!(connection_id, tracks = tracks.len(), "Peer connection created");
        let _ = self
            .events
            .send(PeerManagerEvent::ConnectionCreated(remote.clone()));
        Ok(connection)
    }

    /// Start negotiation with `remote` if no connection exists
    ///
    /// Returns `false` when a connection was already there. A connection
    /// whose offer could not be produced is discarded so a later call can
    /// retry.
    #[tracing::instrument(skip(self), fields(local = %self.local))]
    pub async fn initiate_for(&self, remote: &Uid) -> Result<bool, PeerError> {
        if self.has_connection(remote).await {
            return Ok(false);
        }
        let connection = self.ensure_connection(remote).await?;
        if let Err(e) = self.send_offer(remote, &connection, false).await {
            tracing::warn!(error = %e, "Offer failed, discarding connection");
            self.discard(remote, None).await;
            return Err(e);
        }
        tracing::info!("Offer sent");
        Ok(true)
    }

    async fn send_offer(
        &self,
        remote: &Uid,
        connection: &Arc<dyn RtcConnection>,
        ice_restart: bool,
    ) -> Result<(), PeerError> {
        let offer = connection
            .create_offer(ice_restart)
            .await
            .map_err(conn_err(remote))?;
        connection
            .set_local_description(&offer)
            .await
            .map_err(conn_err(remote))?;
        self.mailbox
            .send(remote, SignalPayload::Offer(offer))
            .await?;
        Ok(())
    }

    /// Reconcile connections with the roster
    ///
    /// Connections to participants that were in the roster and have left are
    /// closed. Participants without a connection get an offer when the
    /// initiator policy says so. Returns the uids offers were sent to.
    pub async fn sync_participants(&self, participants: &[Participant]) -> Vec<Uid> {
        let present: HashSet<Uid> = participants
            .iter()
            .map(|p| p.uid.clone())
            .filter(|uid| *uid != self.local)
            .collect();

        let departed: Vec<Uid> = {
            let mut roster = self.roster.lock();
            let departed = roster.difference(&present).cloned().collect();
            *roster = present.clone();
            departed
        };
        for remote in departed {
            if self.has_connection(&remote).await {
                tracing::info!(remote = %remote, "Participant left, closing connection");
                self.discard(&remote, None).await;
            }
        }

        let mut initiated = Vec::new();
        for participant in participants {
            let remote = &participant.uid;
            if *remote == self.local || !self.initiates(remote) {
                continue;
            }
            match self.initiate_for(remote).await {
                Ok(true) => initiated.push(remote.clone()),
                Ok(false) => {}
                Err(e) => tracing::warn!(remote = %remote, error = %e, "Could not start negotiation"),
            }
        }
        initiated
    }

    /// Handle an offer; returns `false` for a duplicate
    #[tracing::instrument(skip(self, offer), fields(local = %self.local))]
    pub async fn handle_incoming_offer(
        &self,
        from: &Uid,
        timestamp: Millis,
        offer: &SessionDescription,
    ) -> Result<bool, PeerError> {
        if !self.first_sighting(SignalKind::Offer, from, timestamp) {
            return Ok(false);
        }
        let connection = self.ensure_connection(from).await?;
        connection
            .set_remote_description(offer)
            .await
            .map_err(conn_err(from))?;
        self.remote_description_applied(from, &connection).await;

        let answer = connection.create_answer().await.map_err(conn_err(from))?;
        connection
            .set_local_description(&answer)
            .await
            .map_err(conn_err(from))?;
        self.mailbox
            .send(from, SignalPayload::Answer(answer))
            .await?;
        tracing::info!("Answer sent");
        Ok(true)
    }

    /// Handle an answer; returns `false` for a duplicate or when the
    /// connection is already gone
    #[tracing::instrument(skip(self, answer), fields(local = %self.local))]
    pub async fn handle_incoming_answer(
        &self,
        from: &Uid,
        timestamp: Millis,
        answer: &SessionDescription,
    ) -> Result<bool, PeerError> {
        if !self.first_sighting(SignalKind::Answer, from, timestamp) {
            return Ok(false);
        }
        let Some(connection) = self.connection(from).await else {
            tracing::debug!("Answer for a connection that no longer exists, ignoring");
            return Ok(false);
        };
        connection
            .set_remote_description(answer)
            .await
            .map_err(conn_err(from))?;
        self.remote_description_applied(from, &connection).await;
        tracing::debug!("Answer applied");
        Ok(true)
    }

    /// Handle a remote candidate; candidates that arrive before the remote
    /// description are held until it is applied
    #[tracing::instrument(skip(self, candidate), fields(local = %self.local))]
    pub async fn handle_incoming_candidate(
        &self,
        from: &Uid,
        timestamp: Millis,
        candidate: &CandidateFields,
    ) -> Result<bool, PeerError> {
        if !self.first_sighting(SignalKind::IceCandidate, from, timestamp) {
            return Ok(false);
        }
        let connection = {
            let mut peers = self.peers.write().await;
            let Some(record) = peers.get_mut(from) else {
                tracing::debug!("Candidate without a connection, ignoring");
                return Ok(false);
            };
            if !record.remote_description_set {
                record.pending_candidates.push(candidate.clone());
                tracing::trace!(pending = record.pending_candidates.len(), "Candidate queued");
                return Ok(true);
            }
            record.connection.clone()
        };
        connection
            .add_ice_candidate(candidate)
            .await
            .map_err(conn_err(from))?;
        Ok(true)
    }

    /// Dispatch an envelope to its handler
    pub async fn handle_envelope(&self, envelope: &SignalingEnvelope) -> Result<bool, PeerError> {
        let from = &envelope.from;
        match &envelope.payload {
            SignalPayload::Offer(offer) => {
                self.handle_incoming_offer(from, envelope.timestamp, offer)
                    .await
            }
            SignalPayload::Answer(answer) => {
                self.handle_incoming_answer(from, envelope.timestamp, answer)
                    .await
            }
            SignalPayload::Candidate(candidate) => {
                self.handle_incoming_candidate(from, envelope.timestamp, candidate)
                    .await
            }
        }
    }

    /// Handle every slot of a mailbox snapshot and delete the slots
    ///
    /// Errors stay scoped to the envelope that caused them. Returns how many
    /// envelopes were acted on.
    pub async fn process_mailbox_snapshot(&self, snapshot: &Snapshot) -> usize {
        let mut handled = 0;
        for item in self.mailbox.parse_snapshot(snapshot) {
            match &item.envelope {
                Ok(envelope) => match self.handle_envelope(envelope).await {
                    Ok(true) => handled += 1,
                    Ok(false) => {}
                    Err(e) => tracing::warn!(
                        from = %envelope.from,
                        kind = ?envelope.payload.kind(),
                        error = %e,
                        "Signaling message failed"
                    ),
                },
                Err(e) => tracing::warn!(slot = %item.slot, error = %e, "Dropping malformed signaling record"),
            }
            if let Err(e) = self.mailbox.consume(&item).await {
                tracing::error!(slot = %item.slot, error = %e, "Failed to consume signaling slot");
            }
        }
        handled
    }

    /// Handle a connection callback
    pub async fn handle_peer_event(&self, event: PeerEvent) {
        let PeerEvent {
            remote,
            connection_id,
            event,
        } = event;
        if !self.is_current(&remote, connection_id).await {
            tracing::trace!(remote = %remote, connection_id, "Event from a replaced connection, ignoring");
            return;
        }
        match event {
            ConnectionEvent::LocalCandidate(candidate) => {
                if let Err(e) = self
                    .mailbox
                    .send(&remote, SignalPayload::Candidate(candidate))
                    .await
                {
                    tracing::warn!(remote = %remote, error = %e, "Failed to send candidate");
                }
            }
            ConnectionEvent::RemoteTrack(track) => self.publish_remote_track(&remote, track).await,
            ConnectionEvent::StateChanged(state) => {
                self.on_state_change(&remote, connection_id, state).await
            }
        }
    }

    async fn publish_remote_track(&self, remote: &Uid, track: RemoteTrack) {
        if let Some(record) = self.peers.write().await.get_mut(remote) {
            record.remote_tracks.retain(|t| t.kind != track.kind);
            record.remote_tracks.push(track.clone());
        }
        let stream = {
            let mut streams = self.streams.write();
            let stream = streams
                .entry(remote.clone())
                .or_insert_with(|| RemoteStream {
                    remote: remote.clone(),
                    stream_id: track.stream_id.clone(),
                    tracks: Vec::new(),
                });
            stream.stream_id = track.stream_id.clone();
            stream.tracks.retain(|t| t.kind != track.kind);
            stream.tracks.push(track);
            stream.clone()
        };
        tracing::debug!(remote = %remote, tracks = stream.tracks.len(), "Remote stream updated");
        let _ = self.events.send(PeerManagerEvent::RemoteStreamUpdated(stream));
    }

    fn restore_remote_stream(&self, remote: &Uid, tracks: Vec<RemoteTrack>) {
        let Some(stream_id) = tracks.last().map(|t| t.stream_id.clone()) else {
            return;
        };
        let stream = RemoteStream {
            remote: remote.clone(),
            stream_id,
            tracks,
        };
        self.streams.write().insert(remote.clone(), stream.clone());
        tracing::debug!(remote = %remote, tracks = stream.tracks.len(), "Remote stream restored");
        let _ = self.events.send(PeerManagerEvent::RemoteStreamUpdated(stream));
    }

    fn drop_remote_stream(&self, remote: &Uid) {
        if self.streams.write().remove(remote).is_some() {
            tracing::debug!(remote = %remote, "Remote stream dropped");
            let _ = self
                .events
                .send(PeerManagerEvent::RemoteStreamRemoved(remote.clone()));
        }
    }

    async fn on_state_change(&self, remote: &Uid, connection_id: u64, new_state: ConnectionState) {
        enum Next {
            Nothing,
            Restore(Vec<RemoteTrack>),
            Restart(Arc<dyn RtcConnection>),
            Defer,
            Discard,
        }

        let next = {
            let mut peers = self.peers.write().await;
            let Some(record) = peers.get_mut(remote) else {
                return;
            };
            let old_state = std::mem::replace(&mut record.state, new_state);
            if old_state == new_state {
                return;
            }
            tracing::debug!(
                remote = %remote,
                connection_id,
                old_state = ?old_state,
                new_state = ?new_state,
                "Peer connection state transition"
            );
            let _ = self.events.send(PeerManagerEvent::ConnectionStateChanged {
                remote: remote.clone(),
                old_state,
                new_state,
            });

            match new_state {
                ConnectionState::Connected => {
                    record.ice_restarts = 0;
                    record.restart_deferred = false;
                    if old_state.drops_stream() && !record.remote_tracks.is_empty() {
                        Next::Restore(record.remote_tracks.clone())
                    } else {
                        Next::Nothing
                    }
                }
                ConnectionState::Failed if record.ice_restarts < self.config.max_ice_restarts => {
                    record.ice_restarts += 1;
                    if self.initiates(remote) {
                        Next::Restart(record.connection.clone())
                    } else {
                        record.restart_deferred = true;
                        Next::Defer
                    }
                }
                ConnectionState::Failed | ConnectionState::Closed => Next::Discard,
                _ => Next::Nothing,
            }
        };

        if new_state.drops_stream() {
            self.drop_remote_stream(remote);
        }

        match next {
            Next::Nothing => {}
            Next::Restore(tracks) => self.restore_remote_stream(remote, tracks),
            Next::Defer => {
                tracing::debug!(remote = %remote, "Connection failed, waiting for a restart offer");
                let tx = self.deferred_tx.clone();
                let due = (remote.clone(), connection_id);
                let grace = std::time::Duration::from_millis(self.config.restart_grace_ms);
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    let _ = tx.send(due);
                });
            }
            Next::Restart(connection) => {
                tracing::info!(remote = %remote, "Connection failed, attempting ICE restart");
                let _ = self.events.send(PeerManagerEvent::IceRestart(remote.clone()));
                if let Err(e) = self.send_offer(remote, &connection, true).await {
                    tracing::warn!(remote = %remote, error = %e, "ICE restart failed");
                }
            }
            Next::Discard => {
                if new_state == ConnectionState::Failed {
                    tracing::warn!(remote = %remote, "Connection failed again, giving up");
                }
                self.discard(remote, Some(connection_id)).await;
            }
        }
    }

    /// Restart ICE from the non-initiating side when no restart offer
    /// arrived during the grace period
    async fn deferred_restart(&self, remote: &Uid, connection_id: u64) {
        let connection = {
            let mut peers = self.peers.write().await;
            match peers.get_mut(remote) {
                Some(record)
                    if record.connection_id == connection_id
                        && record.restart_deferred
                        && record.state == ConnectionState::Failed =>
                {
                    record.restart_deferred = false;
                    record.connection.clone()
                }
                _ => return,
            }
        };
        tracing::info!(remote = %remote, "No restart offer received, attempting ICE restart");
        let _ = self.events.send(PeerManagerEvent::IceRestart(remote.clone()));
        if let Err(e) = self.send_offer(remote, &connection, true).await {
            tracing::warn!(remote = %remote, error = %e, "ICE restart failed");
        }
    }

    /// Close and forget the connection to `remote`
    ///
    /// With `only_id`, nothing happens if the stored connection is a newer
    /// one.
    async fn discard(&self, remote: &Uid, only_id: Option<u64>) {
        let record = {
            let mut peers = self.peers.write().await;
            match peers.get(remote) {
                Some(record) if only_id.map_or(true, |id| id == record.connection_id) => {
                    peers.remove(remote)
                }
                _ => None,
            }
        };
        let Some(record) = record else {
            return;
        };
        if let Err(e) = record.connection.close().await {
            tracing::warn!(remote = %remote, error = %e, "Error closing connection");
        }
        self.drop_remote_stream(remote);
        tracing::debug!(remote = %remote, "Peer connection discarded");
        let _ = self
            .events
            .send(PeerManagerEvent::ConnectionDiscarded(remote.clone()));
    }

    /// Swap the outbound video on every connection; per-peer failures are
    /// logged and skipped
    pub async fn replace_video_track(&self, track: &LocalTrack) -> usize {
        {
            let mut tracks = self.local_tracks.write();
            tracks.retain(|t| t.kind() != TrackKind::Video);
            tracks.push(track.clone());
        }

        let connections: Vec<(Uid, Arc<dyn RtcConnection>)> = self
            .peers
            .read()
            .await
            .iter()
            .map(|(uid, record)| (uid.clone(), record.connection.clone()))
            .collect();

        let results = join_all(connections.iter().map(|(uid, connection)| async move {
            (uid, connection.replace_video_track(track).await)
        }))
        .await;

        let mut replaced = 0;
        for (uid, result) in results {
            match result {
                Ok(true) => replaced += 1,
                Ok(false) => tracing::debug!(remote = %uid, "No video sender to replace"),
                Err(e) => tracing::warn!(remote = %uid, error = %e, "Video track replacement failed"),
            }
        }
        tracing::debug!(track_id = %track.id(), replaced, "Outbound video replaced");
        replaced
    }

    /// Close every connection, forget all state and delete the local mailbox
    ///
    /// The duplicate filter is cleared only after the mailbox removal has
    /// completed, so nothing still in the store can be handled twice.
    #[tracing::instrument(skip(self), fields(local = %self.local))]
    pub async fn teardown_all(&self) -> Result<(), PeerError> {
        let records: Vec<(Uid, PeerRecord)> = self.peers.write().await.drain().collect();
        let count = records.len();
        for (remote, record) in records {
            if let Err(e) = record.connection.close().await {
                tracing::warn!(remote = %remote, error = %e, "Error closing connection");
            }
            let _ = self.events.send(PeerManagerEvent::ConnectionDiscarded(remote));
        }
        let streams: Vec<Uid> = self.streams.write().drain().map(|(uid, _)| uid).collect();
        for remote in streams {
            let _ = self.events.send(PeerManagerEvent::RemoteStreamRemoved(remote));
        }
        self.roster.lock().clear();
        self.local_tracks.write().clear();

        self.mailbox.clear().await?;
        self.processed.clear();
        tracing::info!(connections = count, "Peer connections torn down");
        Ok(())
    }

    /// Pump connection callbacks, mailbox snapshots and deferred restarts
    /// until the callbacks and the mailbox both end
    pub async fn run(
        self: Arc<Self>,
        mut peer_events: mpsc::UnboundedReceiver<PeerEvent>,
        mut mailbox: Subscription,
    ) {
        let mut deferred = self.deferred_rx.lock().take();
        let mut events_open = true;
        let mut mailbox_open = true;
        while events_open || mailbox_open {
            tokio::select! {
                Some((remote, connection_id)) = next_deferred(&mut deferred) => {
                    self.deferred_restart(&remote, connection_id).await;
                }
                event = peer_events.recv(), if events_open => match event {
                    Some(event) => self.handle_peer_event(event).await,
                    None => events_open = false,
                },
                snapshot = mailbox.next(), if mailbox_open => match snapshot {
                    Some(snapshot) => {
                        self.process_mailbox_snapshot(&snapshot).await;
                    }
                    None => mailbox_open = false,
                },
            }
        }
        tracing::debug!(local = %self.local, "Peer event pump stopped");
    }

    fn first_sighting(&self, kind: SignalKind, from: &Uid, timestamp: Millis) -> bool {
        let id = EnvelopeId {
            kind,
            from: from.clone(),
            timestamp,
        };
        let first = self.processed.first_sighting(&id);
        if !first {
            tracing::trace!(from = %from, kind = ?kind, timestamp, "Duplicate signaling message");
        }
        first
    }

    async fn remote_description_applied(&self, remote: &Uid, connection: &Arc<dyn RtcConnection>) {
        let pending = {
            let mut peers = self.peers.write().await;
            match peers.get_mut(remote) {
                Some(record) if Arc::ptr_eq(&record.connection, connection) => {
                    record.remote_description_set = true;
                    // The remote is negotiating; no restart of our own
                    record.restart_deferred = false;
                    std::mem::take(&mut record.pending_candidates)
                }
                _ => Vec::new(),
            }
        };
        for candidate in pending {
            if let Err(e) = connection.add_ice_candidate(&candidate).await {
                tracing::warn!(remote = %remote, error = %e, "Queued candidate rejected");
            }
        }
    }

    async fn is_current(&self, remote: &Uid, connection_id: u64) -> bool {
        self.peers
            .read()
            .await
            .get(remote)
            .is_some_and(|r| r.connection_id == connection_id)
    }

    /// Whether a connection to `remote` exists
    pub async fn has_connection(&self, remote: &Uid) -> bool {
        self.peers.read().await.contains_key(remote)
    }

    /// Connection to `remote`
    pub async fn connection(&self, remote: &Uid) -> Option<Arc<dyn RtcConnection>> {
        self.peers
            .read()
            .await
            .get(remote)
            .map(|r| r.connection.clone())
    }

    /// Last state reported by the connection to `remote`
    pub async fn connection_state(&self, remote: &Uid) -> Option<ConnectionState> {
        self.peers.read().await.get(remote).map(|r| r.state)
    }

    /// Remote uids with a connection
    pub async fn connected_peers(&self) -> Vec<Uid> {
        let mut uids: Vec<Uid> = self.peers.read().await.keys().cloned().collect();
        uids.sort();
        uids
    }

    /// Number of connections
    pub async fn connection_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Inbound stream from `remote`
    pub fn remote_stream(&self, remote: &Uid) -> Option<RemoteStream> {
        self.streams.read().get(remote).cloned()
    }

    /// All inbound streams
    pub fn remote_streams(&self) -> Vec<RemoteStream> {
        self.streams.read().values().cloned().collect()
    }

    /// Number of remembered signaling messages
    pub fn processed_count(&self) -> usize {
        self.processed.len()
    }
}

async fn next_deferred(
    rx: &mut Option<mpsc::UnboundedReceiver<DeferredRestart>>,
) -> Option<DeferredRestart> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl OutboundTracks for PeerManager {
    async fn set_outbound_tracks(&self, tracks: Vec<LocalTrack>) {
        self.set_local_tracks(tracks);
    }

    async fn replace_outbound_video(&self, track: &LocalTrack) -> usize {
        self.replace_video_track(track).await
    }
}

impl std::fmt::Debug for PeerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerManager")
            .field("local", &self.local)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::identity::AvatarColor;
    use crate::media::TrackSource;
    use crate::store::{MemoryStore, MeetingPaths, RealtimeStore};
    use crate::testing::{MockConnectionFactory, MockNetwork};
    use crate::types::{MeetingId, ParticipantIdentity, WaitingEntry};

    struct Side {
        store: MemoryStore,
        manager: Arc<PeerManager>,
        events: mpsc::UnboundedReceiver<PeerEvent>,
        factory: Arc<MockConnectionFactory>,
    }

    fn side(store: &MemoryStore, network: &MockNetwork, uid: &str, policy: InitiatorPolicy) -> Side {
        let config = PeerManagerConfig {
            initiator_policy: policy,
            restart_grace_ms: 50,
            ..Default::default()
        };
        side_with(store, network, uid, config)
    }

    fn side_with(
        store: &MemoryStore,
        network: &MockNetwork,
        uid: &str,
        config: PeerManagerConfig,
    ) -> Side {
        let local = Uid::new(uid);
        let mailbox = Arc::new(SignalingMailbox::new(
            Arc::new(store.clone()),
            MeetingPaths::new(&MeetingId::new("abcdefghi")),
            local.clone(),
        ));
        let factory = Arc::new(network.factory(&local));
        let (manager, events) = PeerManager::new(config, factory.clone(), mailbox, 64);
        Side {
            store: store.clone(),
            manager,
            events,
            factory,
        }
    }

    fn participant(uid: &str, joined_at: Millis) -> Participant {
        WaitingEntry {
            uid: Uid::new(uid),
            name: uid.to_string(),
            identity: ParticipantIdentity::Guest {
                avatar_color: AvatarColor::Red,
            },
            requested_at: 0,
            camera_on: true,
            mic_on: true,
        }
        .admit(joined_at)
    }

    async fn mailbox_snapshot(side: &Side) -> Snapshot {
        let path = MeetingPaths::new(&MeetingId::new("abcdefghi")).mailbox(side.manager.local());
        Snapshot(side.store.read_once(&path).await.unwrap())
    }

    async fn drain_events(side: &mut Side) {
        while let Ok(event) = side.events.try_recv() {
            side.manager.handle_peer_event(event).await;
        }
    }

    /// Negotiate `a` (initiator) with `b` by hand, both sending mic and camera
    async fn connect(a: &mut Side, b: &mut Side) {
        for side in [&*a, &*b] {
            side.manager.set_local_tracks(vec![
                LocalTrack::new(TrackSource::Microphone, None),
                LocalTrack::new(TrackSource::Camera, None),
            ]);
        }
        let roster = vec![participant("a", 1), participant("b", 2)];
        a.manager.sync_participants(&roster).await;
        b.manager.sync_participants(&roster).await;
        for _ in 0..2 {
            b.manager.process_mailbox_snapshot(&mailbox_snapshot(b).await).await;
            a.manager.process_mailbox_snapshot(&mailbox_snapshot(a).await).await;
            drain_events(a).await;
            drain_events(b).await;
        }
        assert_eq!(
            a.manager.connection_state(&Uid::new("b")).await,
            Some(ConnectionState::Connected)
        );
        assert_eq!(
            b.manager.connection_state(&Uid::new("a")).await,
            Some(ConnectionState::Connected)
        );
    }

    #[tokio::test]
    async fn test_ensure_connection_is_idempotent() {
        let store = MemoryStore::new();
        let network = MockNetwork::new();
        let a = side(&store, &network, "a", InitiatorPolicy::default());
        a.manager.set_local_tracks(vec![
            LocalTrack::new(TrackSource::Microphone, None),
            LocalTrack::new(TrackSource::Camera, None),
        ]);

        let first = a.manager.ensure_connection(&Uid::new("b")).await.unwrap();
        let second = a.manager.ensure_connection(&Uid::new("b")).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(a.manager.connection_count().await, 1);

        let mock = a.factory.connection(&Uid::new("b")).unwrap();
        assert_eq!(mock.added_tracks().len(), 2);
        assert!(matches!(
            a.manager.ensure_connection(&Uid::new("a")).await,
            Err(PeerError::SelfConnection)
        ));
    }

    #[tokio::test]
    async fn test_offer_answer_exchange() {
        let store = MemoryStore::new();
        let network = MockNetwork::new();
        let mut a = side(&store, &network, "a", InitiatorPolicy::default());
        let mut b = side(&store, &network, "b", InitiatorPolicy::default());
        let roster = vec![participant("a", 1), participant("b", 2)];
        for side in [&a, &b] {
            side.manager.set_local_tracks(vec![
                LocalTrack::new(TrackSource::Microphone, None),
                LocalTrack::new(TrackSource::Camera, None),
            ]);
        }

        // Only the lower uid initiates
        assert_eq!(b.manager.sync_participants(&roster).await, Vec::<Uid>::new());
        assert_eq!(a.manager.sync_participants(&roster).await, vec![Uid::new("b")]);

        let handled = b.manager.process_mailbox_snapshot(&mailbox_snapshot(&b).await).await;
        assert_eq!(handled, 1);
        assert!(b.manager.has_connection(&Uid::new("a")).await);

        let handled = a.manager.process_mailbox_snapshot(&mailbox_snapshot(&a).await).await;
        assert_eq!(handled, 1);

        // Candidates flow through the event channels
        drain_events(&mut a).await;
        drain_events(&mut b).await;
        b.manager.process_mailbox_snapshot(&mailbox_snapshot(&b).await).await;
        a.manager.process_mailbox_snapshot(&mailbox_snapshot(&a).await).await;
        drain_events(&mut a).await;
        drain_events(&mut b).await;

        assert_eq!(
            a.manager.connection_state(&Uid::new("b")).await,
            Some(ConnectionState::Connected)
        );
        assert_eq!(
            b.manager.connection_state(&Uid::new("a")).await,
            Some(ConnectionState::Connected)
        );
        assert!(a.factory.connection(&Uid::new("b")).unwrap().remote_candidates().len() >= 1);
        let stream = b.manager.remote_stream(&Uid::new("a")).unwrap();
        assert_eq!(stream.tracks.len(), 2);
        assert!(stream.video().is_some() && stream.audio().is_some());

        // Every slot was consumed
        assert!(mailbox_snapshot(&a).await.value().is_none());
        assert!(mailbox_snapshot(&b).await.value().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_snapshot_handled_once() {
        let store = MemoryStore::new();
        let network = MockNetwork::new();
        let a = side(&store, &network, "a", InitiatorPolicy::default());
        let b = side(&store, &network, "b", InitiatorPolicy::default());
        a.manager.initiate_for(&Uid::new("b")).await.unwrap();

        let snapshot = mailbox_snapshot(&b).await;
        assert_eq!(b.manager.process_mailbox_snapshot(&snapshot).await, 1);
        assert_eq!(b.manager.process_mailbox_snapshot(&snapshot).await, 0);

        let mock = b.factory.connection(&Uid::new("a")).unwrap();
        assert_eq!(mock.remote_descriptions().len(), 1);
        assert_eq!(mock.local_descriptions().len(), 1);
    }

    #[tokio::test]
    async fn test_answer_without_connection_is_ignored() {
        let store = MemoryStore::new();
        let network = MockNetwork::new();
        let a = side(&store, &network, "a", InitiatorPolicy::default());
        let handled = a
            .manager
            .handle_incoming_answer(&Uid::new("z"), 5, &SessionDescription::answer("x"))
            .await
            .unwrap();
        assert!(!handled);
        let handled = a
            .manager
            .handle_incoming_candidate(
                &Uid::new("z"),
                6,
                &CandidateFields {
                    candidate: "c".to_string(),
                    sdp_mid: None,
                    sdp_mline_index: None,
                },
            )
            .await
            .unwrap();
        assert!(!handled);
    }

    #[tokio::test]
    async fn test_malformed_offer_is_scoped_to_peer() {
        let store = MemoryStore::new();
        let network = MockNetwork::new();
        let b = side(&store, &network, "b", InitiatorPolicy::default());
        let err = b
            .manager
            .handle_incoming_offer(&Uid::new("a"), 1, &SessionDescription::offer(""))
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::Connection { .. }));

        // Another peer is unaffected
        let ok = b
            .manager
            .handle_incoming_offer(&Uid::new("c"), 1, &SessionDescription::offer("v=0"))
            .await
            .unwrap();
        assert!(ok);
    }

    #[tokio::test]
    async fn test_failure_restarts_once_then_discards() {
        let store = MemoryStore::new();
        let network = MockNetwork::new();
        let mut a = side(&store, &network, "a", InitiatorPolicy::default());
        a.manager.initiate_for(&Uid::new("b")).await.unwrap();
        let mock = a.factory.connection(&Uid::new("b")).unwrap();
        let mut events = a.manager.subscribe();

        mock.set_state(ConnectionState::Connecting);
        mock.set_state(ConnectionState::Failed);
        drain_events(&mut a).await;
        assert_eq!(mock.ice_restarts(), 1);
        assert!(a.manager.has_connection(&Uid::new("b")).await);

        mock.set_state(ConnectionState::Failed);
        // Same state twice is not a transition; go through connecting
        mock.set_state(ConnectionState::Connecting);
        mock.set_state(ConnectionState::Failed);
        drain_events(&mut a).await;
        assert_eq!(mock.ice_restarts(), 1);
        assert!(!a.manager.has_connection(&Uid::new("b")).await);
        assert!(mock.is_closed());

        let mut saw_restart = false;
        let mut saw_discard = false;
        while let Ok(event) = events.try_recv() {
            match event {
                PeerManagerEvent::IceRestart(_) => saw_restart = true,
                PeerManagerEvent::ConnectionDiscarded(_) => saw_discard = true,
                _ => {}
            }
        }
        assert!(saw_restart && saw_discard);
    }

    #[tokio::test]
    async fn test_connected_resets_restart_budget() {
        let store = MemoryStore::new();
        let network = MockNetwork::new();
        let mut a = side(&store, &network, "a", InitiatorPolicy::default());
        a.manager.initiate_for(&Uid::new("b")).await.unwrap();
        let mock = a.factory.connection(&Uid::new("b")).unwrap();

        for _ in 0..3 {
            mock.set_state(ConnectionState::Failed);
            mock.set_state(ConnectionState::Connected);
        }
        drain_events(&mut a).await;
        assert_eq!(mock.ice_restarts(), 3);
        assert!(a.manager.has_connection(&Uid::new("b")).await);
    }

    #[tokio::test]
    async fn test_stale_connection_events_ignored() {
        let store = MemoryStore::new();
        let network = MockNetwork::new();
        let mut a = side(&store, &network, "a", InitiatorPolicy::default());
        a.manager.initiate_for(&Uid::new("b")).await.unwrap();
        let old = a.factory.connection(&Uid::new("b")).unwrap();
        old.set_state(ConnectionState::Closed);
        drain_events(&mut a).await;
        assert!(!a.manager.has_connection(&Uid::new("b")).await);

        a.manager.initiate_for(&Uid::new("b")).await.unwrap();
        // Late event from the first connection
        old.set_state(ConnectionState::Failed);
        drain_events(&mut a).await;
        assert!(a.manager.has_connection(&Uid::new("b")).await);
    }

    #[tokio::test]
    async fn test_roster_pruning() {
        let store = MemoryStore::new();
        let network = MockNetwork::new();
        let a = side(&store, &network, "a", InitiatorPolicy::Always);
        let roster = vec![participant("a", 1), participant("b", 2), participant("c", 3)];
        let initiated = a.manager.sync_participants(&roster).await;
        assert_eq!(initiated, vec![Uid::new("b"), Uid::new("c")]);

        // An offer from someone the roster has not shown yet survives a sync
        a.manager
            .handle_incoming_offer(&Uid::new("d"), 1, &SessionDescription::offer("v=0"))
            .await
            .unwrap();

        let roster = vec![participant("a", 1), participant("c", 3)];
        assert!(a.manager.sync_participants(&roster).await.is_empty());
        assert_eq!(
            a.manager.connected_peers().await,
            vec![Uid::new("c"), Uid::new("d")]
        );
        assert!(a.factory.connection(&Uid::new("b")).unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_replace_video_track_keeps_one_video_sender() {
        let store = MemoryStore::new();
        let network = MockNetwork::new();
        let a = side(&store, &network, "a", InitiatorPolicy::Always);
        a.manager.set_local_tracks(vec![
            LocalTrack::new(TrackSource::Microphone, None),
            LocalTrack::new(TrackSource::Camera, None),
        ]);
        a.manager
            .sync_participants(&[participant("a", 1), participant("b", 2), participant("c", 3)])
            .await;

        let screen = LocalTrack::new(TrackSource::Screen, None);
        assert_eq!(a.manager.replace_video_track(&screen).await, 2);
        for remote in ["b", "c"] {
            let mock = a.factory.connection(&Uid::new(remote)).unwrap();
            let video: Vec<LocalTrack> = mock
                .outbound_tracks()
                .into_iter()
                .filter(|t| t.kind() == TrackKind::Video)
                .collect();
            assert_eq!(video.len(), 1);
            assert_eq!(video[0].source(), TrackSource::Screen);
        }

        // New connections get the replacement too
        a.manager.ensure_connection(&Uid::new("d")).await.unwrap();
        let mock = a.factory.connection(&Uid::new("d")).unwrap();
        assert!(mock.outbound_tracks().iter().any(|t| t.source() == TrackSource::Screen));
    }

    #[tokio::test]
    async fn test_teardown_clears_everything() {
        let store = MemoryStore::new();
        let network = MockNetwork::new();
        let a = side(&store, &network, "a", InitiatorPolicy::default());
        let b = side(&store, &network, "b", InitiatorPolicy::default());
        b.manager.initiate_for(&Uid::new("a")).await.unwrap();
        a.manager.initiate_for(&Uid::new("b")).await.unwrap();
        a.manager
            .process_mailbox_snapshot(&mailbox_snapshot(&a).await)
            .await;
        assert!(a.manager.processed_count() > 0);

        // Something left in the mailbox
        b.manager
            .handle_peer_event(PeerEvent {
                remote: Uid::new("a"),
                connection_id: 1,
                event: ConnectionEvent::LocalCandidate(CandidateFields {
                    candidate: "late".to_string(),
                    sdp_mid: None,
                    sdp_mline_index: None,
                }),
            })
            .await;

        a.manager.teardown_all().await.unwrap();
        assert_eq!(a.manager.connection_count().await, 0);
        assert_eq!(a.manager.processed_count(), 0);
        assert!(mailbox_snapshot(&a).await.value().is_none());
        assert!(a.factory.connection(&Uid::new("b")).unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_run_pump_connects_pair() {
        let store = MemoryStore::new();
        let network = MockNetwork::new();
        let a = side(&store, &network, "a", InitiatorPolicy::default());
        let b = side(&store, &network, "b", InitiatorPolicy::default());

        let a_sub = a.manager.mailbox.subscribe().await.unwrap();
        let b_sub = b.manager.mailbox.subscribe().await.unwrap();
        let a_task = tokio::spawn(a.manager.clone().run(a.events, a_sub));
        let b_task = tokio::spawn(b.manager.clone().run(b.events, b_sub));

        let roster = vec![participant("a", 1), participant("b", 2)];
        a.manager.sync_participants(&roster).await;
        b.manager.sync_participants(&roster).await;

        let connected = crate::testing::eventually(|| {
            let a = a.manager.clone();
            let b = b.manager.clone();
            async move {
                a.connection_state(&Uid::new("b")).await == Some(ConnectionState::Connected)
                    && b.connection_state(&Uid::new("a")).await == Some(ConnectionState::Connected)
            }
        })
        .await;
        assert!(connected);

        a_task.abort();
        b_task.abort();
    }

    #[tokio::test]
    async fn test_reconnect_restores_remote_stream() {
        let store = MemoryStore::new();
        let network = MockNetwork::new();
        let mut a = side(&store, &network, "a", InitiatorPolicy::default());
        let mut b = side(&store, &network, "b", InitiatorPolicy::default());
        connect(&mut a, &mut b).await;
        let a_uid = Uid::new("a");
        let towards_a = b.factory.connection(&a_uid).unwrap();
        let inbound = b.manager.remote_stream(&a_uid).unwrap();
        assert_eq!(inbound.tracks.len(), 2);

        towards_a.set_state(ConnectionState::Disconnected);
        drain_events(&mut b).await;
        assert!(b.manager.remote_stream(&a_uid).is_none());
        assert!(b.manager.has_connection(&a_uid).await);

        towards_a.set_state(ConnectionState::Connected);
        drain_events(&mut b).await;
        assert_eq!(b.manager.remote_stream(&a_uid), Some(inbound));
    }

    #[tokio::test]
    async fn test_restart_then_reconnect_restores_remote_stream() {
        let store = MemoryStore::new();
        let network = MockNetwork::new();
        let mut a = side(&store, &network, "a", InitiatorPolicy::default());
        let mut b = side(&store, &network, "b", InitiatorPolicy::default());
        connect(&mut a, &mut b).await;
        let b_uid = Uid::new("b");
        let towards_b = a.factory.connection(&b_uid).unwrap();
        let inbound = a.manager.remote_stream(&b_uid).unwrap();

        towards_b.set_state(ConnectionState::Failed);
        drain_events(&mut a).await;
        assert_eq!(towards_b.ice_restarts(), 1);
        assert!(a.manager.remote_stream(&b_uid).is_none());

        // The restart offer is answered over the mailboxes
        b.manager.process_mailbox_snapshot(&mailbox_snapshot(&b).await).await;
        a.manager.process_mailbox_snapshot(&mailbox_snapshot(&a).await).await;
        towards_b.set_state(ConnectionState::Connected);
        drain_events(&mut a).await;
        assert_eq!(a.manager.remote_stream(&b_uid), Some(inbound));
        assert_eq!(a.manager.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_non_initiator_restarts_after_grace() {
        let store = MemoryStore::new();
        let network = MockNetwork::new();
        let mut a = side(&store, &network, "a", InitiatorPolicy::default());
        let mut b = side(&store, &network, "b", InitiatorPolicy::default());
        connect(&mut a, &mut b).await;
        let a_uid = Uid::new("a");
        let b_uid = Uid::new("b");
        let towards_a = b.factory.connection(&a_uid).unwrap();

        let b_sub = b.manager.mailbox.subscribe().await.unwrap();
        let b_task = tokio::spawn(b.manager.clone().run(b.events, b_sub));

        // Only this side sees the failure
        towards_a.set_state(ConnectionState::Failed);
        let restarted = crate::testing::eventually(|| {
            let towards_a = towards_a.clone();
            async move { towards_a.ice_restarts() == 1 }
        })
        .await;
        assert!(restarted);

        // The initiator receives the restart offer and answers it
        let towards_b = a.factory.connection(&b_uid).unwrap();
        assert_eq!(towards_b.remote_descriptions().len(), 1);
        let initiator = &a;
        let answered = crate::testing::eventually(|| {
            let towards_b = towards_b.clone();
            async move {
                let snapshot = mailbox_snapshot(initiator).await;
                initiator.manager.process_mailbox_snapshot(&snapshot).await;
                towards_b.remote_descriptions().len() == 2
            }
        })
        .await;
        assert!(answered);
        assert_eq!(towards_b.ice_restarts(), 0);
        b_task.abort();
    }

    #[tokio::test]
    async fn test_non_initiator_waits_for_restart_offer() {
        let store = MemoryStore::new();
        let network = MockNetwork::new();
        let mut a = side(&store, &network, "a", InitiatorPolicy::default());
        let config = PeerManagerConfig {
            restart_grace_ms: 300,
            ..Default::default()
        };
        let mut b = side_with(&store, &network, "b", config);
        connect(&mut a, &mut b).await;
        let a_uid = Uid::new("a");
        let b_uid = Uid::new("b");
        let towards_a = b.factory.connection(&a_uid).unwrap();
        let towards_b = a.factory.connection(&b_uid).unwrap();

        let b_sub = b.manager.mailbox.subscribe().await.unwrap();
        let b_task = tokio::spawn(b.manager.clone().run(b.events, b_sub));

        // Both sides fail; the initiator offers the restart
        towards_a.set_state(ConnectionState::Failed);
        let failed = crate::testing::eventually(|| {
            let manager = b.manager.clone();
            let a_uid = a_uid.clone();
            async move { manager.connection_state(&a_uid).await == Some(ConnectionState::Failed) }
        })
        .await;
        assert!(failed);
        towards_b.set_state(ConnectionState::Failed);
        drain_events(&mut a).await;
        assert_eq!(towards_b.ice_restarts(), 1);
        let answered = crate::testing::eventually(|| {
            let towards_a = towards_a.clone();
            async move { towards_a.remote_descriptions().len() == 2 }
        })
        .await;
        assert!(answered);

        tokio::time::sleep(std::time::Duration::from_millis(600)).await;
        assert_eq!(towards_a.ice_restarts(), 0);
        b_task.abort();
    }
}
