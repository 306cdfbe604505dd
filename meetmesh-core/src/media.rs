//! Local media management
//!
//! [`MediaController`] exclusively owns the local capture devices. It hands
//! outbound tracks to the peer connections, swaps the outbound video source
//! between camera and screen, and mirrors every device change into the local
//! participant record.
//!
//! Capture hardware sits behind [`MediaDevices`]. [`SyntheticDevices`]
//! produces tracks without hardware.

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::identity::Uid;
use crate::records::MeetingRecords;
use crate::store::StoreError;
use crate::types::{DeviceFlag, QualityProfile};

/// Media-related errors
#[derive(Error, Debug)]
pub enum MediaError {
    /// Device missing or busy
    #[error("{source_kind} unavailable: {reason}")]
    DeviceUnavailable {
        /// Which capture source
        source_kind: TrackSource,
        /// Reason reported by the device layer
        reason: String,
    },

    /// User or platform refused access
    #[error("Permission denied for {0}")]
    PermissionDenied(TrackSource),

    /// Camera profile cannot change while the screen is shared
    #[error("Quality cannot change while screen sharing")]
    ScreenShareActive,

    /// Device state could not be written to the participant record
    #[error("Device state not saved: {0}")]
    Sync(#[from] StoreError),
}

/// Audio or video
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackKind {
    /// Audio
    Audio,
    /// Video
    Video,
}

/// Capture source of a local track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackSource {
    /// Microphone
    Microphone,
    /// Camera
    Camera,
    /// Display capture
    Screen,
}

impl TrackSource {
    /// Media kind produced by this source
    pub fn kind(self) -> TrackKind {
        match self {
            Self::Microphone => TrackKind::Audio,
            Self::Camera | Self::Screen => TrackKind::Video,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Microphone => "microphone",
            Self::Camera => "camera",
            Self::Screen => "screen",
        }
    }
}

impl fmt::Display for TrackSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

struct TrackInner {
    id: String,
    source: TrackSource,
    profile: Option<QualityProfile>,
    enabled: AtomicBool,
    live: AtomicBool,
}

/// Local capture track
///
/// Clones share the enabled and live flags, so a connection holding a clone
/// sees `set_enabled` immediately.
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<TrackInner>,
}

impl LocalTrack {
    /// New live, enabled track
    pub fn new(source: TrackSource, profile: Option<QualityProfile>) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                id: format!("{}-{}", source.label(), uuid::Uuid::new_v4()),
                source,
                profile,
                enabled: AtomicBool::new(true),
                live: AtomicBool::new(true),
            }),
        }
    }

    /// Track id
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Capture source
    pub fn source(&self) -> TrackSource {
        self.inner.source
    }

    /// Media kind
    pub fn kind(&self) -> TrackKind {
        self.inner.source.kind()
    }

    /// Capture profile, camera tracks only
    pub fn profile(&self) -> Option<QualityProfile> {
        self.inner.profile
    }

    /// Whether frames are sent
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Mute or unmute without touching the connection
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Whether the capture is still running
    pub fn is_live(&self) -> bool {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// Stop the capture and release the device
    pub fn stop(&self) {
        self.inner.live.store(false, Ordering::SeqCst);
    }
}

impl PartialEq for LocalTrack {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for LocalTrack {}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.inner.id)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

/// Screen capture plus the signal fired when the platform ends it
#[derive(Debug)]
pub struct DisplayCapture {
    /// Screen track
    pub track: LocalTrack,
    /// Resolves when sharing is ended outside the app
    pub ended: oneshot::Receiver<()>,
}

/// Capture device access
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Open the camera at `profile`
    async fn open_camera(&self, profile: QualityProfile) -> Result<LocalTrack, MediaError>;

    /// Open the microphone
    async fn open_microphone(&self) -> Result<LocalTrack, MediaError>;

    /// Start display capture
    async fn open_display(&self) -> Result<DisplayCapture, MediaError>;
}

/// Devices that produce tracks without hardware
#[derive(Default)]
pub struct SyntheticDevices {
    camera_denied: AtomicBool,
    microphone_denied: AtomicBool,
    display_denied: AtomicBool,
    display_end: SyncMutex<Option<oneshot::Sender<()>>>,
    opened: SyncMutex<Vec<LocalTrack>>,
}

impl SyntheticDevices {
    /// All devices available
    pub fn new() -> Self {
        Self::default()
    }

    /// Make camera acquisition fail
    pub fn deny_camera(&self, denied: bool) {
        self.camera_denied.store(denied, Ordering::SeqCst);
    }

    /// Make microphone acquisition fail
    pub fn deny_microphone(&self, denied: bool) {
        self.microphone_denied.store(denied, Ordering::SeqCst);
    }

    /// Make display capture fail
    pub fn deny_display(&self, denied: bool) {
        self.display_denied.store(denied, Ordering::SeqCst);
    }

    /// End the current display capture as the platform's "stop sharing" would
    pub fn end_display(&self) -> bool {
        match self.display_end.lock().take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    /// Every track opened so far
    pub fn opened(&self) -> Vec<LocalTrack> {
        self.opened.lock().clone()
    }

    fn open(&self, source: TrackSource, profile: Option<QualityProfile>) -> LocalTrack {
        let track = LocalTrack::new(source, profile);
        self.opened.lock().push(track.clone());
        tracing::debug!(track_id = %track.id(), source = %source, "Synthetic track opened");
        track
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn open_camera(&self, profile: QualityProfile) -> Result<LocalTrack, MediaError> {
        if self.camera_denied.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied(TrackSource::Camera));
        }
        Ok(self.open(TrackSource::Camera, Some(profile)))
    }

    async fn open_microphone(&self) -> Result<LocalTrack, MediaError> {
        if self.microphone_denied.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied(TrackSource::Microphone));
        }
        Ok(self.open(TrackSource::Microphone, None))
    }

    async fn open_display(&self) -> Result<DisplayCapture, MediaError> {
        if self.display_denied.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied(TrackSource::Screen));
        }
        let (tx, rx) = oneshot::channel();
        *self.display_end.lock() = Some(tx);
        Ok(DisplayCapture {
            track: self.open(TrackSource::Screen, None),
            ended: rx,
        })
    }
}

/// Where outbound tracks go
#[async_trait]
pub trait OutboundTracks: Send + Sync {
    /// Tracks attached to every new connection
    async fn set_outbound_tracks(&self, tracks: Vec<LocalTrack>);

    /// Replace the video source on every live connection; returns how many
    /// connections were updated
    async fn replace_outbound_video(&self, track: &LocalTrack) -> usize;
}

/// Outbound sink for sessions whose media is not carried by the mesh
#[derive(Debug, Default)]
pub struct Detached;

#[async_trait]
impl OutboundTracks for Detached {
    async fn set_outbound_tracks(&self, _tracks: Vec<LocalTrack>) {}

    async fn replace_outbound_video(&self, _track: &LocalTrack) -> usize {
        0
    }
}

/// Media state changes worth showing to the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaNotice {
    /// A device could not be opened and is off
    DeviceUnavailable(TrackSource),
    /// Screen sharing started
    ScreenShareStarted,
    /// Screen sharing ended; `by_platform` when stopped outside the app
    ScreenShareEnded {
        /// Ended by the platform rather than by a call to stop
        by_platform: bool,
    },
    /// Camera profile changed
    QualityChanged(QualityProfile),
}

/// Snapshot of the local media state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaStatus {
    /// Camera enabled
    pub video_on: bool,
    /// Microphone enabled
    pub mic_on: bool,
    /// Screen shared
    pub presenting: bool,
    /// Camera profile
    pub profile: QualityProfile,
}

struct MediaState {
    camera: Option<LocalTrack>,
    microphone: Option<LocalTrack>,
    screen: Option<LocalTrack>,
    video_on: bool,
    mic_on: bool,
    profile: QualityProfile,
    screen_watch: Option<JoinHandle<()>>,
}

impl MediaState {
    fn status(&self) -> MediaStatus {
        MediaStatus {
            video_on: self.video_on,
            mic_on: self.mic_on,
            presenting: self.screen.is_some(),
            profile: self.profile,
        }
    }
}

/// Media Track Controller
pub struct MediaController {
    devices: Arc<dyn MediaDevices>,
    outbound: Arc<dyn OutboundTracks>,
    records: MeetingRecords,
    local: Uid,
    state: Mutex<MediaState>,
    notices: broadcast::Sender<MediaNotice>,
    weak_self: Weak<MediaController>,
}

impl MediaController {
    /// Create a controller for `local`; nothing is captured until
    /// [`MediaController::initialize`]
    pub fn new(
        devices: Arc<dyn MediaDevices>,
        outbound: Arc<dyn OutboundTracks>,
        records: MeetingRecords,
        local: Uid,
        profile: QualityProfile,
    ) -> Arc<Self> {
        let (notices, _) = broadcast::channel(64);
        Arc::new_cyclic(|weak_self| Self {
            devices,
            outbound,
            records,
            local,
            state: Mutex::new(MediaState {
                camera: None,
                microphone: None,
                screen: None,
                video_on: false,
                mic_on: false,
                profile,
                screen_watch: None,
            }),
            notices,
            weak_self: weak_self.clone(),
        })
    }

    /// Subscribe to media notices
    pub fn subscribe(&self) -> broadcast::Receiver<MediaNotice> {
        self.notices.subscribe()
    }

    /// Current state
    pub async fn status(&self) -> MediaStatus {
        self.state.lock().await.status()
    }

    /// Current outbound video track, screen first
    pub async fn outbound_video(&self) -> Option<LocalTrack> {
        let state = self.state.lock().await;
        state.screen.clone().or_else(|| state.camera.clone())
    }

    /// Current microphone track
    pub async fn microphone(&self) -> Option<LocalTrack> {
        self.state.lock().await.microphone.clone()
    }

    /// Acquire camera and microphone
    ///
    /// A device that cannot be opened is reported and left off; joining goes
    /// on without it.
    #[tracing::instrument(skip(self), fields(uid = %self.local))]
    pub async fn initialize(&self, camera_on: bool, mic_on: bool) -> MediaStatus {
        let mut state = self.state.lock().await;

        match self.devices.open_camera(state.profile).await {
            Ok(track) => {
                track.set_enabled(camera_on);
                state.video_on = camera_on;
                state.camera = Some(track);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Camera unavailable, continuing without video");
                state.video_on = false;
                let _ = self
                    .notices
                    .send(MediaNotice::DeviceUnavailable(TrackSource::Camera));
            }
        }
        match self.devices.open_microphone().await {
            Ok(track) => {
                track.set_enabled(mic_on);
                state.mic_on = mic_on;
                state.microphone = Some(track);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Microphone unavailable, continuing without audio");
                state.mic_on = false;
                let _ = self
                    .notices
                    .send(MediaNotice::DeviceUnavailable(TrackSource::Microphone));
            }
        }

        let tracks: Vec<LocalTrack> = state
            .microphone
            .iter()
            .chain(state.camera.iter())
            .cloned()
            .collect();
        self.outbound.set_outbound_tracks(tracks).await;

        let status = state.status();
        drop(state);
        // The record was written with the pre-join intent; correct it when a
        // device failed
        if status.video_on != camera_on {
            self.write_flag_logged(DeviceFlag::Video, status.video_on).await;
        }
        if status.mic_on != mic_on {
            self.write_flag_logged(DeviceFlag::Mic, status.mic_on).await;
        }
        tracing::info!(video_on = status.video_on, mic_on = status.mic_on, "Media initialized");
        status
    }

    /// Flip the camera on or off
    ///
    /// While the screen is shared only the preference changes; it applies
    /// when the camera comes back.
    pub async fn toggle_video(&self) -> Result<bool, MediaError> {
        let on = {
            let mut state = self.state.lock().await;
            if state.camera.is_none() && state.screen.is_none() {
                return Err(MediaError::DeviceUnavailable {
                    source_kind: TrackSource::Camera,
                    reason: "no camera track".to_string(),
                });
            }
            state.video_on = !state.video_on;
            if let Some(camera) = &state.camera {
                camera.set_enabled(state.video_on);
            }
            state.video_on
        };
        tracing::debug!(uid = %self.local, video_on = on, "Video toggled");
        self.write_flag(DeviceFlag::Video, on).await?;
        Ok(on)
    }

    /// Flip the microphone on or off
    pub async fn toggle_mic(&self) -> Result<bool, MediaError> {
        let on = {
            let mut state = self.state.lock().await;
            let Some(microphone) = state.microphone.clone() else {
                return Err(MediaError::DeviceUnavailable {
                    source_kind: TrackSource::Microphone,
                    reason: "no microphone track".to_string(),
                });
            };
            state.mic_on = !state.mic_on;
            microphone.set_enabled(state.mic_on);
            state.mic_on
        };
        tracing::debug!(uid = %self.local, mic_on = on, "Microphone toggled");
        self.write_flag(DeviceFlag::Mic, on).await?;
        Ok(on)
    }

    /// Replace the outbound video with a screen capture
    #[tracing::instrument(skip(self), fields(uid = %self.local))]
    pub async fn start_screen_share(&self) -> Result<(), MediaError> {
        let mut state = self.state.lock().await;
        if state.screen.is_some() {
            tracing::debug!("Screen share already active");
            return Ok(());
        }

        let capture = self.devices.open_display().await?;
        let screen = capture.track;
        let replaced = self.outbound.replace_outbound_video(&screen).await;
        // Camera and screen are never outbound together
        if let Some(camera) = state.camera.take() {
            camera.stop();
        }
        state.screen = Some(screen);

        let weak = self.weak_self.clone();
        let ended = capture.ended;
        state.screen_watch = Some(tokio::spawn(async move {
            if ended.await.is_ok() {
                if let Some(controller) = weak.upgrade() {
                    controller.finish_screen_share(true).await;
                }
            }
        }));
        drop(state);

        tracing::info!(connections = replaced, "Screen share started");
        let _ = self.notices.send(MediaNotice::ScreenShareStarted);
        self.write_flag(DeviceFlag::Presenting, true).await?;
        Ok(())
    }

    /// Go back to the camera
    pub async fn stop_screen_share(&self) -> Result<(), MediaError> {
        match self.finish_screen_share(false).await {
            Some(Err(e)) => Err(e),
            _ => Ok(()),
        }
    }

    /// Returns `None` when no screen share was active
    async fn finish_screen_share(&self, by_platform: bool) -> Option<Result<(), MediaError>> {
        let mut state = self.state.lock().await;
        let screen = state.screen.take()?;
        if let Some(watch) = state.screen_watch.take() {
            if !by_platform {
                watch.abort();
            }
        }
        screen.stop();

        let restored_video = match self.devices.open_camera(state.profile).await {
            Ok(camera) => {
                camera.set_enabled(state.video_on);
                let replaced = self.outbound.replace_outbound_video(&camera).await;
                tracing::debug!(connections = replaced, "Camera restored");
                state.camera = Some(camera);
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "Camera not reacquired after screen share");
                let _ = self
                    .notices
                    .send(MediaNotice::DeviceUnavailable(TrackSource::Camera));
                let was_on = state.video_on;
                state.video_on = false;
                was_on.then_some(false)
            }
        };
        drop(state);

        tracing::info!(uid = %self.local, by_platform, "Screen share stopped");
        let _ = self
            .notices
            .send(MediaNotice::ScreenShareEnded { by_platform });
        let mut result = self.write_flag(DeviceFlag::Presenting, false).await;
        if let Some(video_on) = restored_video {
            if let Err(e) = self.write_flag(DeviceFlag::Video, video_on).await {
                result = result.and(Err(e));
            }
        }
        Some(result)
    }

    /// Reopen the camera at a different profile
    #[tracing::instrument(skip(self), fields(uid = %self.local))]
    pub async fn change_quality(&self, profile: QualityProfile) -> Result<(), MediaError> {
        let mut state = self.state.lock().await;
        if state.screen.is_some() {
            return Err(MediaError::ScreenShareActive);
        }
        if state.profile == profile && state.camera.is_some() {
            return Ok(());
        }

        let camera = self.devices.open_camera(profile).await?;
        camera.set_enabled(state.video_on);
        let replaced = self.outbound.replace_outbound_video(&camera).await;
        if let Some(old) = state.camera.replace(camera) {
            old.stop();
        }
        let old_profile = std::mem::replace(&mut state.profile, profile);
        tracing::info!(
            old_profile = %old_profile,
            new_profile = %profile,
            connections = replaced,
            "Quality changed"
        );
        let _ = self.notices.send(MediaNotice::QualityChanged(profile));
        Ok(())
    }

    /// Stop every capture
    pub async fn release(&self) {
        let mut state = self.state.lock().await;
        if let Some(watch) = state.screen_watch.take() {
            watch.abort();
        }
        for track in [
            state.camera.take(),
            state.microphone.take(),
            state.screen.take(),
        ]
        .into_iter()
        .flatten()
        {
            track.stop();
        }
        tracing::debug!(uid = %self.local, "Media released");
    }

    async fn write_flag(&self, flag: DeviceFlag, on: bool) -> Result<(), MediaError> {
        match self.records.set_device_flag(&self.local, flag, on).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                tracing::debug!(flag = flag.field(), "Participant record gone, flag not written");
                Ok(())
            }
            Err(e) => {
                tracing::error!(flag = flag.field(), error = %e, "Failed to write device flag");
                Err(e.into())
            }
        }
    }

    async fn write_flag_logged(&self, flag: DeviceFlag, on: bool) {
        let _ = self.write_flag(flag, on).await;
    }
}

impl fmt::Debug for MediaController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaController")
            .field("local", &self.local)
            .finish()
    }
}
