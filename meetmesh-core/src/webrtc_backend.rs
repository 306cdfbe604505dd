//! [`RtcConnection`] over the `webrtc` crate
//!
//! Local tracks are mapped to one `TrackLocalStaticSample` each and shared by
//! every connection, so a capture pipeline writes samples once per track.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::connection::{
    ConnectionError, ConnectionEvent, ConnectionFactory, ConnectionState, EventSink,
    RemoteTrack, RtcConnection,
};
use crate::identity::Uid;
use crate::media::{LocalTrack, TrackKind};
use crate::signaling::{CandidateFields, SdpType, SessionDescription};

fn backend(e: webrtc::Error) -> ConnectionError {
    ConnectionError::Backend(e.to_string())
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: "".to_string(),
            rtcp_feedback: vec![],
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: "".to_string(),
            rtcp_feedback: vec![],
        },
    }
}

fn map_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
    }
}

/// Sample tracks keyed by local track id
///
/// Entries of stopped local tracks are evicted whenever the cache is used.
struct TrackCache {
    stream_id: String,
    tracks: Mutex<HashMap<String, (LocalTrack, Arc<TrackLocalStaticSample>)>>,
}

impl TrackCache {
    fn get(&self, track: &LocalTrack) -> Arc<TrackLocalStaticSample> {
        let mut tracks = self.tracks.lock();
        tracks.retain(|id, (local, _)| {
            let live = local.is_live();
            if !live {
                tracing::debug!(track_id = %id, "Evicting stopped sample track");
            }
            live
        });
        let (_, sample) = tracks.entry(track.id().to_string()).or_insert_with(|| {
            tracing::debug!(track_id = %track.id(), kind = ?track.kind(), "Creating sample track");
            let sample = Arc::new(TrackLocalStaticSample::new(
                codec_for(track.kind()),
                track.id().to_string(),
                self.stream_id.clone(),
            ));
            (track.clone(), sample)
        });
        sample.clone()
    }

    fn len(&self) -> usize {
        self.tracks.lock().len()
    }
}

/// Factory for `webrtc`-backed connections
pub struct WebRtcConnectionFactory {
    api: API,
    ice_servers: Vec<String>,
    tracks: Arc<TrackCache>,
}

impl WebRtcConnectionFactory {
    /// Create a factory for connections owned by `local`
    ///
    /// # Errors
    ///
    /// Returns error if the default codecs cannot be registered
    pub fn new(local: &Uid, ice_servers: Vec<String>) -> Result<Self, ConnectionError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(backend)?;
        let api = APIBuilder::new().with_media_engine(media_engine).build();
        Ok(Self {
            api,
            ice_servers,
            tracks: Arc::new(TrackCache {
                stream_id: format!("meetmesh-{local}"),
                tracks: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Sample track backing `track`; capture pipelines write media here
    pub fn sample_track(&self, track: &LocalTrack) -> Arc<TrackLocalStaticSample> {
        self.tracks.get(track)
    }

    /// Number of sample tracks held for live local tracks
    pub fn sample_track_count(&self) -> usize {
        self.tracks.len()
    }

    fn configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }
}

#[async_trait]
impl ConnectionFactory for WebRtcConnectionFactory {
    async fn create(
        &self,
        remote: &Uid,
        sink: EventSink,
    ) -> Result<Arc<dyn RtcConnection>, ConnectionError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.configuration())
                .await
                .map_err(|e| {
                    tracing::error!(remote = %remote, error = %e, "Failed to create peer connection");
                    backend(e)
                })?,
        );

        let candidate_sink = sink.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = candidate_sink.clone();
            Box::pin(async move {
                // `None` marks the end of gathering
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => sink.emit(ConnectionEvent::LocalCandidate(CandidateFields {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    })),
                    Err(e) => tracing::warn!(error = %e, "Could not serialize local candidate"),
                }
            })
        }));

        let state_sink = sink.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            state_sink.emit(ConnectionEvent::StateChanged(map_state(state)));
            Box::pin(async {})
        }));

        let track_sink = sink;
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let kind = match track.kind() {
                RTPCodecType::Audio => TrackKind::Audio,
                _ => TrackKind::Video,
            };
            track_sink.emit(ConnectionEvent::RemoteTrack(RemoteTrack {
                id: track.id(),
                kind,
                stream_id: track.stream_id(),
            }));
            Box::pin(async {})
        }));

        tracing::debug!(remote = %remote, "webrtc peer connection created");
        Ok(Arc::new(WebRtcConnection {
            pc,
            tracks: self.tracks.clone(),
            video_sender: AsyncMutex::new(None),
        }))
    }
}

/// Connection backed by `RTCPeerConnection`
pub struct WebRtcConnection {
    pc: Arc<RTCPeerConnection>,
    tracks: Arc<TrackCache>,
    video_sender: AsyncMutex<Option<Arc<RTCRtpSender>>>,
}

impl WebRtcConnection {
    fn to_rtc(desc: &SessionDescription) -> Result<RTCSessionDescription, ConnectionError> {
        if desc.sdp.trim().is_empty() {
            return Err(ConnectionError::InvalidDescription("empty sdp".to_string()));
        }
        let parsed = match desc.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(desc.sdp.clone()),
            SdpType::Answer => RTCSessionDescription::answer(desc.sdp.clone()),
        };
        parsed.map_err(|e| ConnectionError::InvalidDescription(e.to_string()))
    }
}

#[async_trait]
impl RtcConnection for WebRtcConnection {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), ConnectionError> {
        let rtc_track: Arc<dyn TrackLocal + Send + Sync> = self.tracks.get(track);
        let sender = self
            .pc
            .add_track(rtc_track)
            .await
            .map_err(|e| ConnectionError::Track(e.to_string()))?;
        if track.kind() == TrackKind::Video {
            *self.video_sender.lock().await = Some(sender);
        }
        Ok(())
    }

    async fn replace_video_track(&self, track: &LocalTrack) -> Result<bool, ConnectionError> {
        let sender = self.video_sender.lock().await.clone();
        let Some(sender) = sender else {
            return Ok(false);
        };
        let rtc_track: Arc<dyn TrackLocal + Send + Sync> = self.tracks.get(track);
        sender
            .replace_track(Some(rtc_track))
            .await
            .map_err(|e| ConnectionError::Track(e.to_string()))?;
        Ok(true)
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, ConnectionError> {
        let options = RTCOfferOptions {
            ice_restart,
            ..Default::default()
        };
        let offer = self
            .pc
            .create_offer(Some(options))
            .await
            .map_err(|e| ConnectionError::Negotiation(e.to_string()))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| ConnectionError::Negotiation(e.to_string()))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), ConnectionError> {
        self.pc
            .set_local_description(Self::to_rtc(desc)?)
            .await
            .map_err(|e| ConnectionError::Negotiation(e.to_string()))
    }

    async fn set_remote_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), ConnectionError> {
        self.pc
            .set_remote_description(Self::to_rtc(desc)?)
            .await
            .map_err(|e| ConnectionError::InvalidDescription(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: &CandidateFields) -> Result<(), ConnectionError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            ..Default::default()
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| ConnectionError::InvalidCandidate(e.to_string()))
    }

    fn state(&self) -> ConnectionState {
        map_state(self.pc.connection_state())
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        self.pc.close().await.map_err(backend)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::media::TrackSource;
    use tokio::sync::mpsc;

    #[test]
    fn test_state_mapping() {
        assert_eq!(map_state(RTCPeerConnectionState::Unspecified), ConnectionState::New);
        assert_eq!(map_state(RTCPeerConnectionState::Failed), ConnectionState::Failed);
        assert_eq!(map_state(RTCPeerConnectionState::Closed), ConnectionState::Closed);
    }

    #[test]
    fn test_codecs() {
        assert_eq!(codec_for(TrackKind::Audio).mime_type, "audio/opus");
        assert_eq!(codec_for(TrackKind::Video).clock_rate, 90000);
    }

    #[tokio::test]
    async fn test_offer_contains_tracks() {
        let factory = WebRtcConnectionFactory::new(&Uid::new("a"), vec![]).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let connection = factory
            .create(&Uid::new("b"), EventSink::new(Uid::new("b"), 1, tx))
            .await
            .unwrap();

        let mic = LocalTrack::new(TrackSource::Microphone, None);
        let camera = LocalTrack::new(TrackSource::Camera, None);
        connection.add_track(&mic).await.unwrap();
        connection.add_track(&camera).await.unwrap();

        let offer = connection.create_offer(false).await.unwrap();
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));

        let screen = LocalTrack::new(TrackSource::Screen, None);
        assert!(connection.replace_video_track(&screen).await.unwrap());
        // Shared sample track per local track
        assert!(Arc::ptr_eq(&factory.sample_track(&screen), &factory.sample_track(&screen)));

        connection.close().await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_empty_remote_description_rejected() {
        let factory = WebRtcConnectionFactory::new(&Uid::new("a"), vec![]).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let connection = factory
            .create(&Uid::new("b"), EventSink::new(Uid::new("b"), 1, tx))
            .await
            .unwrap();
        let err = connection
            .set_remote_description(&SessionDescription::offer(" "))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::InvalidDescription(_)));
    }

    #[tokio::test]
    async fn test_stopped_tracks_are_evicted() {
        let factory = WebRtcConnectionFactory::new(&Uid::new("a"), vec![]).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let connection = factory
            .create(&Uid::new("b"), EventSink::new(Uid::new("b"), 1, tx))
            .await
            .unwrap();

        let camera = LocalTrack::new(TrackSource::Camera, None);
        connection.add_track(&camera).await.unwrap();
        assert_eq!(factory.sample_track_count(), 1);

        // Screen share replaces the camera, which is then stopped
        let screen = LocalTrack::new(TrackSource::Screen, None);
        connection.replace_video_track(&screen).await.unwrap();
        camera.stop();
        let restored = LocalTrack::new(TrackSource::Camera, None);
        connection.replace_video_track(&restored).await.unwrap();
        assert_eq!(factory.sample_track_count(), 2);

        screen.stop();
        factory.sample_track(&restored);
        assert_eq!(factory.sample_track_count(), 1);
        connection.close().await.unwrap();
    }
}
