//! Test utilities
//!
//! [`MockNetwork`] hands out [`MockConnectionFactory`]s whose connections
//! find their counterpart by `(local, remote)`. A connection counts as
//! established once it has both a local and a remote description. At that
//! point it reports `Connected` and announces its outbound tracks to the
//! counterpart as inbound tracks. Replacing the video track on an established
//! connection announces the new source the same way.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::connection::{
    ConnectionError, ConnectionEvent, ConnectionFactory, ConnectionState, EventSink,
    RemoteTrack, RtcConnection,
};
use crate::identity::Uid;
use crate::media::{LocalTrack, TrackKind};
use crate::signaling::{CandidateFields, SdpType, SessionDescription};

type Registry = Mutex<HashMap<(Uid, Uid), Arc<MockConnection>>>;

/// Shared registry pairing mock connections
#[derive(Clone, Default)]
pub struct MockNetwork {
    registry: Arc<Registry>,
}

impl MockNetwork {
    /// Empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory for connections created by `local`
    pub fn factory(&self, local: &Uid) -> MockConnectionFactory {
        MockConnectionFactory {
            local: local.clone(),
            registry: Arc::downgrade(&self.registry),
            fail: AtomicBool::new(false),
            created: Mutex::new(Vec::new()),
        }
    }

    /// Latest connection `local` created towards `remote`
    pub fn connection(&self, local: &Uid, remote: &Uid) -> Option<Arc<MockConnection>> {
        self.registry
            .lock()
            .get(&(local.clone(), remote.clone()))
            .cloned()
    }
}

/// [`ConnectionFactory`] producing [`MockConnection`]s
pub struct MockConnectionFactory {
    local: Uid,
    registry: Weak<Registry>,
    fail: AtomicBool,
    created: Mutex<Vec<Arc<MockConnection>>>,
}

impl MockConnectionFactory {
    /// Make `create` fail
    pub fn fail_creation(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Latest connection created towards `remote`
    pub fn connection(&self, remote: &Uid) -> Option<Arc<MockConnection>> {
        self.created
            .lock()
            .iter()
            .rev()
            .find(|c| c.remote == *remote)
            .cloned()
    }

    /// Number of connections created so far
    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }
}

#[async_trait]
impl ConnectionFactory for MockConnectionFactory {
    async fn create(
        &self,
        remote: &Uid,
        sink: EventSink,
    ) -> Result<Arc<dyn RtcConnection>, ConnectionError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ConnectionError::Backend("mock creation failure".to_string()));
        }
        let connection = Arc::new(MockConnection {
            local: self.local.clone(),
            remote: remote.clone(),
            sink,
            registry: self.registry.clone(),
            state: Mutex::new(MockState::default()),
        });
        if let Some(registry) = self.registry.upgrade() {
            registry
                .lock()
                .insert((self.local.clone(), remote.clone()), connection.clone());
        }
        self.created.lock().push(connection.clone());
        Ok(connection)
    }
}

struct MockState {
    senders: Vec<LocalTrack>,
    added: Vec<LocalTrack>,
    replacements: Vec<LocalTrack>,
    local_descriptions: Vec<SessionDescription>,
    remote_descriptions: Vec<SessionDescription>,
    remote_candidates: Vec<CandidateFields>,
    offers: u32,
    ice_restarts: u32,
    state: ConnectionState,
    established: bool,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            senders: Vec::new(),
            added: Vec::new(),
            replacements: Vec::new(),
            local_descriptions: Vec::new(),
            remote_descriptions: Vec::new(),
            remote_candidates: Vec::new(),
            offers: 0,
            ice_restarts: 0,
            state: ConnectionState::New,
            established: false,
        }
    }
}

/// In-memory [`RtcConnection`] that records every call
pub struct MockConnection {
    local: Uid,
    remote: Uid,
    sink: EventSink,
    registry: Weak<Registry>,
    state: Mutex<MockState>,
}

impl MockConnection {
    /// Local uid
    pub fn local(&self) -> &Uid {
        &self.local
    }

    /// Remote uid
    pub fn remote(&self) -> &Uid {
        &self.remote
    }

    /// Force a state and report it
    pub fn set_state(&self, state: ConnectionState) {
        self.state.lock().state = state;
        self.sink.emit(ConnectionEvent::StateChanged(state));
    }

    /// Tracks passed to `add_track`
    pub fn added_tracks(&self) -> Vec<LocalTrack> {
        self.state.lock().added.clone()
    }

    /// Tracks currently feeding the senders
    pub fn outbound_tracks(&self) -> Vec<LocalTrack> {
        self.state.lock().senders.clone()
    }

    /// Tracks passed to `replace_video_track`
    pub fn replacements(&self) -> Vec<LocalTrack> {
        self.state.lock().replacements.clone()
    }

    /// Local descriptions applied
    pub fn local_descriptions(&self) -> Vec<SessionDescription> {
        self.state.lock().local_descriptions.clone()
    }

    /// Remote descriptions applied
    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.state.lock().remote_descriptions.clone()
    }

    /// Remote candidates applied
    pub fn remote_candidates(&self) -> Vec<CandidateFields> {
        self.state.lock().remote_candidates.clone()
    }

    /// Offers created with the ICE restart flag
    pub fn ice_restarts(&self) -> u32 {
        self.state.lock().ice_restarts
    }

    /// Whether `close` was called
    pub fn is_closed(&self) -> bool {
        self.state.lock().state == ConnectionState::Closed
    }

    fn check_open(&self) -> Result<(), ConnectionError> {
        if self.is_closed() {
            Err(ConnectionError::Closed)
        } else {
            Ok(())
        }
    }

    fn counterpart(&self) -> Option<Arc<MockConnection>> {
        let registry = self.registry.upgrade()?;
        let peer = registry
            .lock()
            .get(&(self.remote.clone(), self.local.clone()))
            .cloned();
        peer
    }

    fn announce(&self, tracks: &[LocalTrack]) {
        let Some(peer) = self.counterpart() else {
            return;
        };
        for track in tracks {
            peer.sink.emit(ConnectionEvent::RemoteTrack(RemoteTrack {
                id: track.id().to_string(),
                kind: track.kind(),
                stream_id: format!("stream-{}", self.local),
            }));
        }
    }

    fn check_established(&self) {
        let senders = {
            let mut state = self.state.lock();
            if state.established
                || state.local_descriptions.is_empty()
                || state.remote_descriptions.is_empty()
            {
                return;
            }
            state.established = true;
            state.state = ConnectionState::Connected;
            state.senders.clone()
        };
        self.sink
            .emit(ConnectionEvent::StateChanged(ConnectionState::Connected));
        self.announce(&senders);
    }
}

#[async_trait]
impl RtcConnection for MockConnection {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), ConnectionError> {
        self.check_open()?;
        let mut state = self.state.lock();
        state.senders.push(track.clone());
        state.added.push(track.clone());
        Ok(())
    }

    async fn replace_video_track(&self, track: &LocalTrack) -> Result<bool, ConnectionError> {
        self.check_open()?;
        let established = {
            let mut state = self.state.lock();
            let Some(sender) = state
                .senders
                .iter_mut()
                .find(|t| t.kind() == TrackKind::Video)
            else {
                return Ok(false);
            };
            *sender = track.clone();
            state.replacements.push(track.clone());
            state.established
        };
        if established {
            self.announce(std::slice::from_ref(track));
        }
        Ok(true)
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, ConnectionError> {
        self.check_open()?;
        let mut state = self.state.lock();
        state.offers += 1;
        if ice_restart {
            state.ice_restarts += 1;
        }
        Ok(SessionDescription::offer(format!(
            "v=0 mock-offer {}->{} #{}",
            self.local, self.remote, state.offers
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError> {
        self.check_open()?;
        let state = self.state.lock();
        match state.remote_descriptions.last() {
            Some(desc) if desc.sdp_type == SdpType::Offer => Ok(SessionDescription::answer(
                format!("v=0 mock-answer {}->{}", self.local, self.remote),
            )),
            _ => Err(ConnectionError::Negotiation(
                "no remote offer to answer".to_string(),
            )),
        }
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), ConnectionError> {
        self.check_open()?;
        let n = {
            let mut state = self.state.lock();
            state.local_descriptions.push(desc.clone());
            state.local_descriptions.len()
        };
        self.sink.emit(ConnectionEvent::LocalCandidate(CandidateFields {
            candidate: format!("candidate:{n} 1 udp 2130706431 127.0.0.1 {} typ host", 50000 + n),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }));
        self.check_established();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), ConnectionError> {
        self.check_open()?;
        if desc.sdp.trim().is_empty() {
            return Err(ConnectionError::InvalidDescription("empty sdp".to_string()));
        }
        self.state.lock().remote_descriptions.push(desc.clone());
        self.check_established();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &CandidateFields) -> Result<(), ConnectionError> {
        self.check_open()?;
        let mut state = self.state.lock();
        if state.remote_descriptions.is_empty() {
            return Err(ConnectionError::InvalidCandidate(
                "remote description not set".to_string(),
            ));
        }
        state.remote_candidates.push(candidate.clone());
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        self.state.lock().state
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        {
            let mut state = self.state.lock();
            if state.state == ConnectionState::Closed {
                return Ok(());
            }
            state.state = ConnectionState::Closed;
        }
        self.sink
            .emit(ConnectionEvent::StateChanged(ConnectionState::Closed));
        Ok(())
    }
}

/// Poll `check` until it returns `true` or five seconds pass
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
