//! Meeting session orchestration
//!
//! A [`MeetingSession`] is built per meeting page. It owns the synchronizer,
//! the admission machine and, once the local user is in the meeting, the
//! media controller and the peer manager. Every UI intent is a method that
//! returns `Result<_, SessionError>`; nothing here is fatal to the process.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::admission::{
    ensure_capacity, AdmissionError, AdmissionMachine, JoinPlan, Presence, Stage, Transition,
};
use crate::chat::{send_message, ChatError, ChatFeed};
use crate::connection::{ConnectionError, ConnectionFactory};
use crate::identity::{Identity, IdentityProvider, Uid};
use crate::media::{
    Detached, MediaController, MediaDevices, MediaError, MediaNotice, MediaStatus,
    OutboundTracks, SyntheticDevices,
};
use crate::media_service::{
    select_transport, MediaTokenIssuer, MediaTokenRequest, MediaTransport,
};
use crate::peer::{PeerError, PeerManager, PeerManagerConfig, PeerManagerEvent, RemoteStream};
use crate::records::MeetingRecords;
use crate::signaling::{SignalingError, SignalingMailbox};
use crate::store::{RealtimeStore, StoreError};
use crate::sync::{MeetingSnapshot, MeetingSync};
use crate::types::{
    now_millis, ChatMessage, DeviceFlag, DeviceState, Meeting, MeetingId, MeetingSettings,
    Participant, QualityProfile, WaitingEntry,
};

/// Session errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// Store operation failed
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Admission refused the operation
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    /// Media operation failed
    #[error(transparent)]
    Media(#[from] MediaError),

    /// Peer connection operation failed
    #[error(transparent)]
    Peer(#[from] PeerError),

    /// Mailbox operation failed
    #[error(transparent)]
    Signaling(#[from] SignalingError),

    /// Chat refused the message
    #[error(transparent)]
    Chat(#[from] ChatError),

    /// Connection backend could not be created
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Guests must provide a display name
    #[error("A display name is required")]
    NameRequired,

    /// Operation needs the meeting stage
    #[error("Not in the meeting (currently {0})")]
    NotInMeeting(Stage),

    /// Host tried to moderate themselves
    #[error("Cannot do this to yourself")]
    SelfTarget,

    /// Neither a connection backend nor a hosted media issuer is available
    #[error("No connection backend configured")]
    NoConnectionBackend,
}

/// Session configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Peer manager settings
    pub peer: PeerManagerConfig,
    /// Camera profile used when capture starts
    pub default_quality: QualityProfile,
    /// Capacity of the event channels
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            peer: PeerManagerConfig::default(),
            default_quality: QualityProfile::default(),
            event_capacity: 256,
        }
    }
}

/// Session events
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Local stage changed
    StageChanged(Transition),
    /// Media transport chosen on entering the meeting
    TransportSelected(MediaTransport),
    /// Media notice
    Media(MediaNotice),
    /// Peer connection event
    Peer(PeerManagerEvent),
    /// Background operation failed
    Failure(String),
}

/// Builds a connection factory once the local uid is known
pub type FactoryBuilder = Arc<
    dyn Fn(&Uid, &PeerManagerConfig) -> Result<Arc<dyn ConnectionFactory>, ConnectionError>
        + Send
        + Sync,
>;

/// Wrap a closure as a [`FactoryBuilder`]
pub fn factory_builder<F>(build: F) -> FactoryBuilder
where
    F: Fn(&Uid, &PeerManagerConfig) -> Result<Arc<dyn ConnectionFactory>, ConnectionError>
        + Send
        + Sync
        + 'static,
{
    Arc::new(build)
}

struct Live {
    media: Arc<MediaController>,
    peers: Option<Arc<PeerManager>>,
    transport: MediaTransport,
    tasks: Vec<JoinHandle<()>>,
}

/// One user's view of one meeting
pub struct MeetingSession {
    config: SessionConfig,
    records: MeetingRecords,
    sync: Arc<MeetingSync>,
    chat: ChatFeed,
    identity: parking_lot::Mutex<Option<Identity>>,
    admission: parking_lot::Mutex<AdmissionMachine>,
    intent: parking_lot::Mutex<Option<(bool, bool)>>,
    devices: Arc<dyn MediaDevices>,
    factory: Option<FactoryBuilder>,
    issuer: Option<Arc<dyn MediaTokenIssuer>>,
    live: Mutex<Option<Live>>,
    stage: watch::Sender<Stage>,
    events: broadcast::Sender<SessionEvent>,
    driver: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl MeetingSession {
    /// Create a builder for `meeting_id`
    #[must_use]
    pub fn builder(store: Arc<dyn RealtimeStore>, meeting_id: MeetingId) -> MeetingSessionBuilder {
        MeetingSessionBuilder::new(store, meeting_id)
    }

    /// Create a meeting hosted by `host` under a fresh id
    ///
    /// # Errors
    ///
    /// Returns error if the meeting record cannot be written
    pub async fn create_meeting(
        store: Arc<dyn RealtimeStore>,
        host: &Identity,
        title: impl Into<String>,
        settings: MeetingSettings,
    ) -> Result<Meeting, SessionError> {
        let records = MeetingRecords::new(store, MeetingId::generate());
        Ok(records.create_meeting(host, title, settings).await?)
    }

    /// Current stage
    pub fn stage(&self) -> Stage {
        self.admission.lock().stage()
    }

    /// Stage changes as a latest-value channel
    pub fn stage_watch(&self) -> watch::Receiver<Stage> {
        self.stage.subscribe()
    }

    /// Wait until the stage satisfies `predicate`
    pub async fn wait_for_stage(&self, mut predicate: impl FnMut(Stage) -> bool) -> Stage {
        let mut rx = self.stage_watch();
        let stage = match rx.wait_for(|s| predicate(*s)).await {
            Ok(stage) => *stage,
            Err(_) => self.stage(),
        };
        stage
    }

    /// Local identity, once known
    pub fn identity(&self) -> Option<Identity> {
        self.identity.lock().clone()
    }

    /// Meeting records
    pub fn records(&self) -> &MeetingRecords {
        &self.records
    }

    /// Live meeting state
    pub fn sync(&self) -> &Arc<MeetingSync> {
        &self.sync
    }

    /// Latest meeting snapshot
    pub fn snapshot(&self) -> MeetingSnapshot {
        self.sync.latest()
    }

    /// Chat history
    pub fn chat(&self) -> &ChatFeed {
        &self.chat
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Peer manager while in the meeting over the mesh
    pub async fn peers(&self) -> Option<Arc<PeerManager>> {
        self.live.lock().await.as_ref().and_then(|l| l.peers.clone())
    }

    /// Transport in use while in the meeting
    pub async fn transport(&self) -> Option<MediaTransport> {
        self.live.lock().await.as_ref().map(|l| l.transport.clone())
    }

    /// Local media state while in the meeting
    pub async fn media_status(&self) -> Option<MediaStatus> {
        let media = self.live.lock().await.as_ref().map(|l| l.media.clone())?;
        Some(media.status().await)
    }

    /// Inbound streams from every connected peer
    pub async fn remote_streams(&self) -> Vec<RemoteStream> {
        match self.peers().await {
            Some(peers) => peers.remote_streams(),
            None => Vec::new(),
        }
    }

    /// Join from the pre-join screen
    ///
    /// The host enters directly; everyone else enters directly only when
    /// the meeting does not require approval, and waits otherwise. A user
    /// without an identity joins as a guest named `name`.
    #[tracing::instrument(skip(self, name), fields(meeting_id = %self.records.meeting_id()))]
    pub async fn join(&self, name: &str, camera_on: bool, mic_on: bool) -> Result<Stage, SessionError> {
        let snapshot = self.sync.latest();
        let existing = self.identity.lock().clone();
        let identity = match existing {
            Some(identity) => identity,
            None => {
                let name = name.trim();
                if name.is_empty() {
                    return Err(SessionError::NameRequired);
                }
                Identity::guest(name)
            }
        };
        let plan = self.admission.lock().plan_join(&snapshot, &identity)?;

        *self.identity.lock() = Some(identity.clone());
        self.admission.lock().set_local(identity.uid().clone());
        *self.intent.lock() = Some((camera_on, mic_on));

        match plan {
            JoinPlan::EnterDirectly { role } => {
                let participant = Participant {
                    uid: identity.uid().clone(),
                    name: identity.name().to_string(),
                    identity: (&identity).into(),
                    role,
                    joined_at: now_millis(),
                    devices: DeviceState::joining(camera_on, mic_on),
                };
                self.records.add_participant(&participant).await?;
            }
            JoinPlan::RequestEntry => {
                let entry = WaitingEntry {
                    uid: identity.uid().clone(),
                    name: identity.name().to_string(),
                    identity: (&identity).into(),
                    requested_at: now_millis(),
                    camera_on,
                    mic_on,
                };
                self.records.join_waiting_room(&entry).await?;
            }
        }
        tracing::info!(uid = %identity.uid(), plan = ?plan, "Join requested");

        let transition = self.admission.lock().joined(plan);
        if let Some(transition) = transition {
            self.apply(transition).await;
        }
        if plan == JoinPlan::RequestEntry {
            // The host may have answered before any tick showed the entry
            self.confirm_waiting().await;
        }
        Ok(self.stage())
    }

    /// Admit a waiting user (host only)
    #[tracing::instrument(skip(self), fields(meeting_id = %self.records.meeting_id()))]
    pub async fn admit(&self, uid: &Uid) -> Result<Participant, SessionError> {
        let snapshot = self.sync.latest();
        self.admission.lock().ensure_host(&snapshot)?;
        let entry = match snapshot.waiting_entry(uid) {
            Some(entry) => entry.clone(),
            None => self
                .records
                .waiting_entry(uid)
                .await?
                .ok_or_else(|| AdmissionError::NotWaiting(uid.clone()))?,
        };
        if let Some(meeting) = &snapshot.meeting {
            ensure_capacity(&meeting.settings, snapshot.participants.len())?;
        }
        Ok(self.records.admit(&entry).await?)
    }

    /// Reject a waiting user (host only)
    #[tracing::instrument(skip(self), fields(meeting_id = %self.records.meeting_id()))]
    pub async fn reject(&self, uid: &Uid) -> Result<(), SessionError> {
        let snapshot = self.sync.latest();
        self.admission.lock().ensure_host(&snapshot)?;
        Ok(self.records.reject(uid).await?)
    }

    /// Remove a participant from the meeting (host only)
    #[tracing::instrument(skip(self), fields(meeting_id = %self.records.meeting_id()))]
    pub async fn remove_participant(&self, uid: &Uid) -> Result<(), SessionError> {
        let snapshot = self.sync.latest();
        {
            let admission = self.admission.lock();
            admission.ensure_host(&snapshot)?;
            if admission.local() == Some(uid) {
                return Err(SessionError::SelfTarget);
            }
        }
        Ok(self.records.remove_participant(uid).await?)
    }

    /// Lower a participant's raised hand (host only)
    pub async fn lower_hand(&self, uid: &Uid) -> Result<bool, SessionError> {
        let snapshot = self.sync.latest();
        self.admission.lock().ensure_host(&snapshot)?;
        Ok(self
            .records
            .set_device_flag(uid, DeviceFlag::RaisedHand, false)
            .await?)
    }

    /// Raise or lower the local hand; returns the new state
    pub async fn toggle_hand(&self) -> Result<bool, SessionError> {
        let local = self.in_meeting_uid()?;
        let raised = self
            .sync
            .latest()
            .participant(&local)
            .is_some_and(|p| p.devices.has_raised_hand);
        self.records
            .set_device_flag(&local, DeviceFlag::RaisedHand, !raised)
            .await?;
        Ok(!raised)
    }

    /// Turn the camera on or off; returns the new state
    pub async fn toggle_video(&self) -> Result<bool, SessionError> {
        Ok(self.live_media().await?.toggle_video().await?)
    }

    /// Turn the microphone on or off; returns the new state
    pub async fn toggle_mic(&self) -> Result<bool, SessionError> {
        Ok(self.live_media().await?.toggle_mic().await?)
    }

    /// Share the screen in place of the camera
    pub async fn start_screen_share(&self) -> Result<(), SessionError> {
        Ok(self.live_media().await?.start_screen_share().await?)
    }

    /// Stop sharing and return to the camera
    pub async fn stop_screen_share(&self) -> Result<(), SessionError> {
        Ok(self.live_media().await?.stop_screen_share().await?)
    }

    /// Switch the camera profile
    pub async fn change_quality(&self, profile: QualityProfile) -> Result<(), SessionError> {
        Ok(self.live_media().await?.change_quality(profile).await?)
    }

    /// Send a chat message
    pub async fn send_chat(&self, text: &str) -> Result<ChatMessage, SessionError> {
        let identity = self
            .identity()
            .ok_or_else(|| SessionError::NotInMeeting(self.stage()))?;
        let snapshot = self.sync.latest();
        Ok(send_message(&self.records, &snapshot, self.stage(), &identity, text).await?)
    }

    /// Leave the meeting
    ///
    /// Connections and captures are released first. The participant record
    /// (or waiting-room entry) is then removed, and a leaving host marks the
    /// meeting inactive, which ends it for everyone else.
    #[tracing::instrument(skip(self), fields(meeting_id = %self.records.meeting_id()))]
    pub async fn leave(&self) -> Result<(), SessionError> {
        let snapshot = self.sync.latest();
        let (previous, transition, local) = {
            let mut admission = self.admission.lock();
            let previous = admission.stage();
            (previous, admission.leave(), admission.local().cloned())
        };
        let Some(transition) = transition else {
            return Ok(());
        };
        self.apply(transition).await;

        let Some(local) = local else {
            return Ok(());
        };
        match previous {
            Stage::InMeeting => {
                self.records.remove_participant(&local).await?;
                if snapshot.is_host(&local) {
                    self.records.set_meeting_active(false).await?;
                    tracing::info!("Host left, meeting ended");
                }
            }
            Stage::Waiting => self.records.remove_from_waiting_room(&local).await?,
            _ => {}
        }
        Ok(())
    }

    /// Delete the meeting and all its records (host only)
    pub async fn delete_meeting(&self) -> Result<(), SessionError> {
        let snapshot = self.sync.latest();
        self.admission.lock().ensure_host(&snapshot)?;
        self.shutdown_live().await;
        Ok(self.records.delete_meeting().await?)
    }

    /// Stop every task and subscription of this session
    pub async fn close(&self) {
        if let Some(driver) = self.driver.lock().take() {
            driver.abort();
        }
        self.shutdown_live().await;
        self.sync.close();
        self.chat.close();
        tracing::debug!(meeting_id = %self.records.meeting_id(), "Session closed");
    }

    fn in_meeting_uid(&self) -> Result<Uid, SessionError> {
        let admission = self.admission.lock();
        match (admission.stage(), admission.local()) {
            (Stage::InMeeting, Some(uid)) => Ok(uid.clone()),
            (stage, _) => Err(SessionError::NotInMeeting(stage)),
        }
    }

    async fn live_media(&self) -> Result<Arc<MediaController>, SessionError> {
        let media = self.live.lock().await.as_ref().map(|l| l.media.clone());
        media.ok_or_else(|| SessionError::NotInMeeting(self.stage()))
    }

    async fn on_tick(&self, snapshot: MeetingSnapshot) {
        let transition = self.admission.lock().on_snapshot(&snapshot);
        if let Some(transition) = transition {
            self.apply(transition).await;
        }
        let unconfirmed = self.admission.lock().needs_confirmation();
        if unconfirmed {
            self.confirm_waiting().await;
        }
        if self.stage() != Stage::InMeeting {
            return;
        }
        if let Some(peers) = self.peers().await {
            let initiated = peers.sync_participants(&snapshot.participants).await;
            if !initiated.is_empty() {
                tracing::debug!(count = initiated.len(), "Offered connections to new peers");
            }
        }
    }

    /// Settle the waiting stage with direct reads of both records
    async fn confirm_waiting(&self) {
        let Some(uid) = self.admission.lock().local().cloned() else {
            return;
        };
        let presence = match self.read_presence(&uid).await {
            Ok(presence) => presence,
            Err(e) => {
                tracing::warn!(uid = %uid, error = %e, "Could not confirm waiting-room status");
                return;
            }
        };
        let transition = self.admission.lock().confirm_presence(presence);
        if let Some(transition) = transition {
            self.apply(transition).await;
        }
    }

    async fn read_presence(&self, uid: &Uid) -> Result<Presence, StoreError> {
        // Entry first: admission writes the participant before removing it
        let in_waiting = self.records.waiting_entry(uid).await?.is_some();
        let in_roster = self.records.participant(uid).await?.is_some();
        Ok(Presence {
            in_roster,
            in_waiting,
        })
    }

    /// Run the side effects of a stage change, then publish it
    async fn apply(&self, transition: Transition) {
        match transition.to {
            Stage::InMeeting => {
                if let Err(e) = self.enter_meeting().await {
                    tracing::warn!(error = %e, "Failed to start meeting media");
                    let _ = self.events.send(SessionEvent::Failure(e.to_string()));
                }
            }
            Stage::Exited(reason) => {
                tracing::info!(reason = ?reason, "Exited meeting: {reason}");
                self.shutdown_live().await;
            }
            _ => {}
        }
        // A later transition may already have landed
        self.stage.send_replace(self.stage());
        let _ = self.events.send(SessionEvent::StageChanged(transition));
    }

    async fn enter_meeting(&self) -> Result<(), SessionError> {
        let mut live = self.live.lock().await;
        if live.is_some() || self.stage() != Stage::InMeeting {
            return Ok(());
        }
        let identity = self.identity().ok_or(SessionError::NameRequired)?;
        let local = identity.uid().clone();

        let request = MediaTokenRequest {
            meeting_id: self.records.meeting_id().clone(),
            display_name: identity.name().to_string(),
            participant_id: Some(local.clone()),
        };
        let transport = select_transport(self.issuer.as_deref(), &request).await;
        let _ = self
            .events
            .send(SessionEvent::TransportSelected(transport.clone()));

        let mut tasks = Vec::new();
        let mut mesh = None;
        let outbound: Arc<dyn OutboundTracks> = if transport.is_mesh() {
            let builder = self
                .factory
                .as_ref()
                .ok_or(SessionError::NoConnectionBackend)?;
            let factory = builder(&local, &self.config.peer)?;
            let mailbox = Arc::new(SignalingMailbox::new(
                self.records.store().clone(),
                self.records.paths().clone(),
                local.clone(),
            ));
            let subscription = mailbox.subscribe().await?;
            let (peers, peer_events) = PeerManager::new(
                self.config.peer.clone(),
                factory,
                mailbox,
                self.config.event_capacity,
            );
            tasks.push(forward(peers.subscribe(), self.events.clone(), SessionEvent::Peer));
            mesh = Some((peers.clone(), peer_events, subscription));
            peers
        } else {
            Arc::new(Detached)
        };

        let media = MediaController::new(
            self.devices.clone(),
            outbound,
            self.records.clone(),
            local.clone(),
            self.config.default_quality,
        );
        tasks.push(forward(media.subscribe(), self.events.clone(), SessionEvent::Media));

        let snapshot = self.sync.latest();
        let intent = *self.intent.lock();
        let (camera_on, mic_on) = intent.unwrap_or_else(|| {
            snapshot
                .participant(&local)
                .map(|p| (p.devices.is_video_on, p.devices.is_mic_on))
                .unwrap_or((false, false))
        });
        media.initialize(camera_on, mic_on).await;

        let peers = match mesh {
            Some((peers, peer_events, subscription)) => {
                tasks.push(tokio::spawn(peers.clone().run(peer_events, subscription)));
                peers.sync_participants(&snapshot.participants).await;
                Some(peers)
            }
            None => None,
        };

        tracing::info!(uid = %local, mesh = transport.is_mesh(), "Entered meeting");
        *live = Some(Live {
            media,
            peers,
            transport,
            tasks,
        });
        Ok(())
    }

    async fn shutdown_live(&self) {
        let Some(live) = self.live.lock().await.take() else {
            return;
        };
        for task in &live.tasks {
            task.abort();
        }
        if let Some(peers) = &live.peers {
            if let Err(e) = peers.teardown_all().await {
                tracing::error!(error = %e, "Failed to tear down peer connections");
            }
        }
        live.media.release().await;
    }

    fn spawn_driver(self: &Arc<Self>, mut ticks: mpsc::UnboundedReceiver<MeetingSnapshot>) {
        let session = Arc::downgrade(self);
        let driver = tokio::spawn(async move {
            while let Some(snapshot) = ticks.recv().await {
                let Some(session) = session.upgrade() else {
                    break;
                };
                session.on_tick(snapshot).await;
            }
        });
        *self.driver.lock() = Some(driver);
    }
}

impl Drop for MeetingSession {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.get_mut().take() {
            driver.abort();
        }
        if let Some(live) = self.live.get_mut().take() {
            for task in live.tasks {
                task.abort();
            }
        }
    }
}

impl std::fmt::Debug for MeetingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeetingSession")
            .field("meeting_id", self.records.meeting_id())
            .field("stage", &self.stage())
            .finish()
    }
}

fn forward<T: Clone + Send + 'static>(
    mut rx: broadcast::Receiver<T>,
    tx: broadcast::Sender<SessionEvent>,
    wrap: fn(T) -> SessionEvent,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let _ = tx.send(wrap(event));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Session event forwarder lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Meeting session builder
pub struct MeetingSessionBuilder {
    store: Arc<dyn RealtimeStore>,
    meeting_id: MeetingId,
    identity: Option<Identity>,
    config: SessionConfig,
    devices: Option<Arc<dyn MediaDevices>>,
    factory: Option<FactoryBuilder>,
    issuer: Option<Arc<dyn MediaTokenIssuer>>,
}

impl MeetingSessionBuilder {
    /// Create new builder
    #[must_use]
    pub fn new(store: Arc<dyn RealtimeStore>, meeting_id: MeetingId) -> Self {
        Self {
            store,
            meeting_id,
            identity: None,
            config: SessionConfig::default(),
            devices: None,
            factory: None,
            issuer: None,
        }
    }

    /// Set the local identity; without one the user joins as a guest
    #[must_use]
    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Take the local identity from an authentication provider
    #[must_use]
    pub fn with_identity_provider(mut self, provider: &dyn IdentityProvider) -> Self {
        self.identity = provider.current();
        self
    }

    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Set capture devices; defaults to [`SyntheticDevices`]
    #[must_use]
    pub fn with_devices(mut self, devices: Arc<dyn MediaDevices>) -> Self {
        self.devices = Some(devices);
        self
    }

    /// Use `factory` for every peer connection
    #[must_use]
    pub fn with_connection_factory(mut self, factory: Arc<dyn ConnectionFactory>) -> Self {
        self.factory = Some(factory_builder(move |_, _| Ok(factory.clone())));
        self
    }

    /// Build the connection factory from the local uid when entering
    #[must_use]
    pub fn with_factory_builder(mut self, builder: FactoryBuilder) -> Self {
        self.factory = Some(builder);
        self
    }

    /// Prefer the hosted media service when `issuer` grants a token
    #[must_use]
    pub fn with_token_issuer(mut self, issuer: Arc<dyn MediaTokenIssuer>) -> Self {
        self.issuer = Some(issuer);
        self
    }

    #[cfg(feature = "webrtc-backend")]
    fn default_factory() -> Option<FactoryBuilder> {
        Some(factory_builder(|local, config| {
            let factory = crate::webrtc_backend::WebRtcConnectionFactory::new(
                local,
                config.ice_servers.clone(),
            )?;
            Ok(Arc::new(factory) as Arc<dyn ConnectionFactory>)
        }))
    }

    #[cfg(not(feature = "webrtc-backend"))]
    fn default_factory() -> Option<FactoryBuilder> {
        None
    }

    /// Subscribe to the meeting and start the session
    ///
    /// # Errors
    ///
    /// Returns error if the meeting subscriptions cannot be opened or no
    /// media transport is available
    pub async fn build(self) -> Result<Arc<MeetingSession>, SessionError> {
        let factory = self.factory.or_else(Self::default_factory);
        if factory.is_none() && self.issuer.is_none() {
            return Err(SessionError::NoConnectionBackend);
        }

        let records = MeetingRecords::new(self.store, self.meeting_id);
        let sync = MeetingSync::start(&records).await?;
        let chat = ChatFeed::start(&records).await?;
        let (events, _) = broadcast::channel(self.config.event_capacity.max(1));
        let (stage, _) = watch::channel(Stage::Loading);
        let local = self.identity.as_ref().map(|i| i.uid().clone());

        let session = Arc::new(MeetingSession {
            config: self.config,
            records,
            sync,
            chat,
            identity: parking_lot::Mutex::new(self.identity),
            admission: parking_lot::Mutex::new(AdmissionMachine::new(local)),
            intent: parking_lot::Mutex::new(None),
            devices: self
                .devices
                .unwrap_or_else(|| Arc::new(SyntheticDevices::new())),
            factory,
            issuer: self.issuer,
            live: Mutex::new(None),
            stage,
            events,
            driver: parking_lot::Mutex::new(None),
        });
        session.spawn_driver(session.sync.ticks());
        tracing::info!(meeting_id = %session.records.meeting_id(), "Meeting session started");
        Ok(session)
    }
}
