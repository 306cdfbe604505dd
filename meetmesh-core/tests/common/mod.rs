//! Shared setup for the meeting integration tests

#![allow(dead_code)]

use meetmesh_core::testing::MockNetwork;
use meetmesh_core::{
    factory_builder, AvatarColor, ConnectionFactory, Identity, Meeting, MeetingId,
    MeetingRecords, MeetingSession, MeetingSettings, MemoryStore, RealtimeStore, Stage,
    SyntheticDevices, Uid,
};
use std::sync::Arc;

/// One in-process meeting: a store, a mock network and the meeting record
pub struct Harness {
    pub store: MemoryStore,
    pub network: MockNetwork,
    pub meeting: Meeting,
}

impl Harness {
    /// Create meeting `id` hosted by `host`
    pub async fn new(id: &str, host: &Identity, settings: MeetingSettings) -> Self {
        let store = MemoryStore::new();
        let records = MeetingRecords::new(Arc::new(store.clone()), MeetingId::new(id));
        let meeting = records
            .create_meeting(host, "Integration", settings)
            .await
            .unwrap();
        Self {
            store,
            network: MockNetwork::new(),
            meeting,
        }
    }

    pub fn store(&self) -> Arc<dyn RealtimeStore> {
        Arc::new(self.store.clone())
    }

    /// Records of the meeting, as seen by a third party
    pub fn records(&self) -> MeetingRecords {
        MeetingRecords::new(self.store(), self.meeting.id.clone())
    }

    /// Session for `identity` (or an anonymous guest) waiting on the pre-join screen
    pub async fn session(
        &self,
        identity: Option<Identity>,
        devices: Arc<SyntheticDevices>,
    ) -> Arc<MeetingSession> {
        let network = self.network.clone();
        let mut builder = MeetingSession::builder(self.store(), self.meeting.id.clone())
            .with_devices(devices)
            .with_factory_builder(factory_builder(move |local, _| {
                Ok(Arc::new(network.factory(local)) as Arc<dyn ConnectionFactory>)
            }));
        if let Some(identity) = identity {
            builder = builder.with_identity(identity);
        }
        let session = builder.build().await.unwrap();
        session.wait_for_stage(|s| s != Stage::Loading).await;
        session
    }
}

pub fn member(uid: &str) -> Identity {
    Identity::member(Uid::new(uid), uid.to_uppercase())
}

pub fn guest(uid: &str) -> Identity {
    Identity::Guest {
        uid: Uid::new(uid),
        name: format!("Guest {uid}"),
        avatar_color: AvatarColor::Green,
    }
}

pub fn open_meeting() -> MeetingSettings {
    MeetingSettings {
        require_approval: false,
        ..MeetingSettings::default()
    }
}
