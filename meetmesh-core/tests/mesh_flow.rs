//! Peer mesh behavior between full sessions
//!
//! Connections run over the mock network; negotiation goes through the
//! signaling mailboxes in the shared store.

mod common;

use common::{member, open_meeting, Harness};
use meetmesh_core::testing::eventually;
use meetmesh_core::{
    ConnectionState, MeetingSession, QualityProfile, Stage, SyntheticDevices, TrackKind,
    TrackSource, Uid,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;

struct Pair {
    harness: Harness,
    a: Arc<MeetingSession>,
    b: Arc<MeetingSession>,
    a_devices: Arc<SyntheticDevices>,
}

async fn connected_pair(meeting: &str) -> Pair {
    let host = member("a");
    let harness = Harness::new(meeting, &host, open_meeting()).await;
    let a_devices = Arc::new(SyntheticDevices::new());
    let a = harness.session(Some(host), a_devices.clone()).await;
    let b = harness
        .session(Some(member("b")), Arc::new(SyntheticDevices::new()))
        .await;

    assert_eq!(a.join("", true, true).await.unwrap(), Stage::InMeeting);
    assert_eq!(b.join("", true, true).await.unwrap(), Stage::InMeeting);

    let (a_peers, b_peers) = (a.peers().await.unwrap(), b.peers().await.unwrap());
    assert!(
        eventually(|| {
            let a_peers = a_peers.clone();
            let b_peers = b_peers.clone();
            async move {
                a_peers.connection_state(&Uid::new("b")).await == Some(ConnectionState::Connected)
                    && b_peers.connection_state(&Uid::new("a")).await
                        == Some(ConnectionState::Connected)
                    && b_peers
                        .remote_stream(&Uid::new("a"))
                        .is_some_and(|s| s.video().is_some() && s.audio().is_some())
            }
        })
        .await
    );
    Pair {
        harness,
        a,
        b,
        a_devices,
    }
}

fn opened(devices: &SyntheticDevices, source: TrackSource) -> Vec<String> {
    devices
        .opened()
        .into_iter()
        .filter(|t| t.source() == source)
        .map(|t| t.id().to_string())
        .collect()
}

#[tokio::test]
async fn test_two_peers_exchange_media() {
    let pair = connected_pair("meshpairs").await;
    let a = Uid::new("a");
    let b = Uid::new("b");

    let b_peers = pair.b.peers().await.unwrap();
    let stream = b_peers.remote_stream(&a).unwrap();
    let camera = opened(&pair.a_devices, TrackSource::Camera);
    assert_eq!(stream.video().map(|t| t.id.clone()), camera.last().cloned());

    // One connection per remote on each side
    assert_eq!(b_peers.connection_count().await, 1);
    assert_eq!(pair.a.peers().await.unwrap().connection_count().await, 1);
    assert!(pair.harness.network.connection(&a, &b).is_some());
    assert!(pair.harness.network.connection(&b, &a).is_some());
    assert_eq!(pair.a.remote_streams().await.len(), 1);
}

#[tokio::test]
async fn test_screen_share_replaces_video_in_place() {
    let pair = connected_pair("sharescrn").await;
    let a = Uid::new("a");
    let b = Uid::new("b");
    let b_peers = pair.b.peers().await.unwrap();
    let before = pair.harness.network.connection(&b, &a).unwrap();

    pair.a.start_screen_share().await.unwrap();
    let screen = opened(&pair.a_devices, TrackSource::Screen);
    assert_eq!(screen.len(), 1);
    assert!(pair.a.media_status().await.unwrap().presenting);

    assert!(
        eventually(|| {
            let b_peers = b_peers.clone();
            let screen = screen[0].clone();
            async move {
                b_peers
                    .remote_stream(&Uid::new("a"))
                    .and_then(|s| s.video().map(|t| t.id == screen))
                    .unwrap_or(false)
            }
        })
        .await
    );
    let after = pair.harness.network.connection(&b, &a).unwrap();
    assert!(Arc::ptr_eq(&before, &after));
    assert_eq!(b_peers.connection_count().await, 1);

    pair.a.stop_screen_share().await.unwrap();
    let outbound = pair.harness.network.connection(&a, &b).unwrap().outbound_tracks();
    let video: Vec<_> = outbound
        .iter()
        .filter(|t| t.kind() == TrackKind::Video)
        .collect();
    assert_eq!(video.len(), 1);
    assert_eq!(video[0].source(), TrackSource::Camera);
    assert!(!pair.a.media_status().await.unwrap().presenting);
}

#[tokio::test]
async fn test_quality_change_keeps_connection() {
    let pair = connected_pair("qualityxx").await;
    let a = Uid::new("a");
    let b = Uid::new("b");
    let connection = pair.harness.network.connection(&a, &b).unwrap();

    pair.a.change_quality(QualityProfile::Low360).await.unwrap();
    let replacements = connection.replacements();
    assert_eq!(replacements.len(), 1);
    assert_eq!(replacements[0].profile(), Some(QualityProfile::Low360));
    assert!(Arc::ptr_eq(
        &connection,
        &pair.harness.network.connection(&a, &b).unwrap()
    ));
}

#[tokio::test]
async fn test_departed_peer_is_pruned() {
    let pair = connected_pair("prunepeer").await;
    let a = Uid::new("a");
    let b = Uid::new("b");
    let a_peers = pair.a.peers().await.unwrap();
    let towards_b = pair.harness.network.connection(&a, &b).unwrap();

    pair.b.leave().await.unwrap();
    assert!(
        eventually(|| {
            let a_peers = a_peers.clone();
            async move { a_peers.connection_count().await == 0 }
        })
        .await
    );
    assert!(towards_b.is_closed());
    assert!(a_peers.remote_stream(&b).is_none());
    assert_eq!(pair.a.stage(), Stage::InMeeting);
}

#[tokio::test]
async fn test_leaving_clears_own_mailbox() {
    let pair = connected_pair("mailboxes").await;
    let b = Uid::new("b");
    let mailbox = pair.harness.records().paths().mailbox(&b);

    pair.b.leave().await.unwrap();
    assert!(pair.harness.store.get(&mailbox).is_none());
    assert!(pair.b.peers().await.is_none());
}

#[tokio::test]
async fn test_transient_disconnect_keeps_media() {
    let pair = connected_pair("reconnect").await;
    let a = Uid::new("a");
    let b = Uid::new("b");
    let b_peers = pair.b.peers().await.unwrap();
    let inbound = b_peers.remote_stream(&a).unwrap();
    let towards_a = pair.harness.network.connection(&b, &a).unwrap();

    towards_a.set_state(ConnectionState::Disconnected);
    assert!(
        eventually(|| {
            let b_peers = b_peers.clone();
            async move { b_peers.remote_stream(&Uid::new("a")).is_none() }
        })
        .await
    );

    towards_a.set_state(ConnectionState::Connected);
    assert!(
        eventually(|| {
            let b_peers = b_peers.clone();
            let inbound = inbound.clone();
            async move { b_peers.remote_stream(&Uid::new("a")) == Some(inbound) }
        })
        .await
    );
    assert_eq!(b_peers.connection_count().await, 1);
    assert!(Arc::ptr_eq(
        &towards_a,
        &pair.harness.network.connection(&b, &a).unwrap()
    ));
}

#[tokio::test]
async fn test_ice_restart_recovers_media() {
    let pair = connected_pair("icerstart").await;
    let a = Uid::new("a");
    let b = Uid::new("b");
    let a_peers = pair.a.peers().await.unwrap();
    assert!(
        eventually(|| {
            let a_peers = a_peers.clone();
            async move {
                a_peers
                    .remote_stream(&Uid::new("b"))
                    .is_some_and(|s| s.video().is_some() && s.audio().is_some())
            }
        })
        .await
    );
    let inbound = a_peers.remote_stream(&b).unwrap();
    let towards_b = pair.harness.network.connection(&a, &b).unwrap();
    let towards_a = pair.harness.network.connection(&b, &a).unwrap();
    let offers = towards_a.remote_descriptions().len();

    // The initiator restarts and the other side answers over the mailboxes
    towards_b.set_state(ConnectionState::Failed);
    assert!(
        eventually(|| {
            let towards_a = towards_a.clone();
            let towards_b = towards_b.clone();
            async move {
                towards_a.remote_descriptions().len() == offers + 1
                    && towards_b.remote_descriptions().len() == 2
            }
        })
        .await
    );
    assert_eq!(towards_b.ice_restarts(), 1);
    assert!(a_peers.remote_stream(&b).is_none());

    towards_b.set_state(ConnectionState::Connected);
    assert!(
        eventually(|| {
            let a_peers = a_peers.clone();
            let inbound = inbound.clone();
            async move { a_peers.remote_stream(&Uid::new("b")) == Some(inbound) }
        })
        .await
    );
    assert_eq!(a_peers.connection_count().await, 1);
    assert_eq!(pair.a.stage(), Stage::InMeeting);
}
