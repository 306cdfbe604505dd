//! Meeting state synchronizer
//!
//! Keeps three live subscriptions (meeting record, roster, waiting room) and
//! republishes the latest value of each as one [`MeetingSnapshot`]. Nothing
//! beyond the last received value is cached.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::identity::Uid;
use crate::records::{decode_meeting, decode_participants, decode_waiting_room, MeetingRecords};
use crate::store::{StoreError, Subscription};
use crate::types::{Meeting, MeetingId, Participant, WaitingEntry};

/// Latest state of one meeting
#[derive(Debug, Clone, PartialEq)]
pub struct MeetingSnapshot {
    /// Meeting record; `None` when absent or malformed
    pub meeting: Option<Meeting>,
    /// Roster ordered by join time
    pub participants: Vec<Participant>,
    /// Waiting room ordered by request time
    pub waiting_room: Vec<WaitingEntry>,
    /// Set until the meeting record's first snapshot arrives
    pub loading: bool,
    /// Number of updates applied so far
    pub revision: u64,
}

impl MeetingSnapshot {
    /// Snapshot before any data arrived
    pub fn loading() -> Self {
        Self {
            meeting: None,
            participants: Vec::new(),
            waiting_room: Vec::new(),
            loading: true,
            revision: 0,
        }
    }

    /// Roster entry of `uid`
    pub fn participant(&self, uid: &Uid) -> Option<&Participant> {
        self.participants.iter().find(|p| p.uid == *uid)
    }

    /// Whether `uid` is on the roster
    pub fn is_participant(&self, uid: &Uid) -> bool {
        self.participant(uid).is_some()
    }

    /// Waiting-room entry of `uid`
    pub fn waiting_entry(&self, uid: &Uid) -> Option<&WaitingEntry> {
        self.waiting_room.iter().find(|w| w.uid == *uid)
    }

    /// Whether `uid` is waiting for admission
    pub fn is_waiting(&self, uid: &Uid) -> bool {
        self.waiting_entry(uid).is_some()
    }

    /// Whether the meeting exists and is active
    pub fn is_active(&self) -> bool {
        self.meeting.as_ref().is_some_and(|m| m.is_active)
    }

    /// Whether `uid` hosts the meeting
    pub fn is_host(&self, uid: &Uid) -> bool {
        self.meeting.as_ref().is_some_and(|m| m.host_id == *uid)
    }
}

/// Which subscription produced an update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Meeting,
    Participants,
    WaitingRoom,
}

type Listeners = Arc<Mutex<Vec<mpsc::UnboundedSender<MeetingSnapshot>>>>;

/// Live view of one meeting
///
/// [`MeetingSync::watch`] always holds the latest snapshot and may skip
/// intermediate ones; [`MeetingSync::ticks`] delivers every update in order.
pub struct MeetingSync {
    meeting_id: MeetingId,
    state: Arc<watch::Sender<MeetingSnapshot>>,
    listeners: Listeners,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MeetingSync {
    /// Subscribe to the meeting's records and start publishing snapshots
    ///
    /// # Errors
    ///
    /// Returns error if any of the three subscriptions cannot be opened
    #[tracing::instrument(skip(records), fields(meeting_id = %records.meeting_id()))]
    pub async fn start(records: &MeetingRecords) -> Result<Arc<Self>, StoreError> {
        let store = records.store();
        let paths = records.paths();
        let meeting_sub = store.subscribe(&paths.meeting()).await?;
        let participants_sub = store.subscribe(&paths.participants()).await?;
        let waiting_sub = store.subscribe(&paths.waiting_room()).await?;

        let (state, _) = watch::channel(MeetingSnapshot::loading());
        let state = Arc::new(state);
        let listeners: Listeners = Arc::new(Mutex::new(Vec::new()));
        let task = tokio::spawn(Self::pump(
            records.meeting_id().clone(),
            state.clone(),
            listeners.clone(),
            meeting_sub,
            participants_sub,
            waiting_sub,
        ));

        tracing::debug!("Meeting synchronizer started");
        Ok(Arc::new(Self {
            meeting_id: records.meeting_id().clone(),
            state,
            listeners,
            task: Mutex::new(Some(task)),
        }))
    }

    async fn pump(
        meeting_id: MeetingId,
        state: Arc<watch::Sender<MeetingSnapshot>>,
        listeners: Listeners,
        mut meeting_sub: Subscription,
        mut participants_sub: Subscription,
        mut waiting_sub: Subscription,
    ) {
        loop {
            // Roster is polled before the waiting room; admission writes the
            // participant before removing the entry
            let (source, snapshot) = tokio::select! {
                biased;
                Some(s) = meeting_sub.next() => (Source::Meeting, s),
                Some(s) = participants_sub.next() => (Source::Participants, s),
                Some(s) = waiting_sub.next() => (Source::WaitingRoom, s),
                else => break,
            };

            let mut current = state.borrow().clone();
            match source {
                Source::Meeting => {
                    current.meeting = decode_meeting(&snapshot);
                    current.loading = false;
                }
                Source::Participants => current.participants = decode_participants(&snapshot),
                Source::WaitingRoom => current.waiting_room = decode_waiting_room(&snapshot),
            }
            current.revision += 1;
            tracing::trace!(
                meeting_id = %meeting_id,
                source = ?source,
                revision = current.revision,
                "Meeting snapshot updated"
            );

            listeners
                .lock()
                .retain(|tx| tx.send(current.clone()).is_ok());
            state.send_replace(current);
        }
        tracing::debug!(meeting_id = %meeting_id, "Meeting subscriptions closed");
    }

    /// Meeting id
    pub fn meeting_id(&self) -> &MeetingId {
        &self.meeting_id
    }

    /// Latest snapshot
    pub fn latest(&self) -> MeetingSnapshot {
        self.state.borrow().clone()
    }

    /// Latest-value channel
    pub fn watch(&self) -> watch::Receiver<MeetingSnapshot> {
        self.state.subscribe()
    }

    /// Every update in order, starting with the current snapshot
    pub fn ticks(&self) -> mpsc::UnboundedReceiver<MeetingSnapshot> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut listeners = self.listeners.lock();
        // Holding the lock keeps the pump from publishing between these two steps
        let _ = tx.send(self.state.borrow().clone());
        listeners.push(tx);
        rx
    }

    /// Wait until a snapshot satisfies `predicate`
    pub async fn wait_for(
        &self,
        mut predicate: impl FnMut(&MeetingSnapshot) -> bool,
    ) -> Option<MeetingSnapshot> {
        let mut rx = self.watch();
        let snapshot = rx.wait_for(|s| predicate(s)).await.ok().map(|s| (*s).clone());
        snapshot
    }

    /// Drop all subscriptions; listeners see their stream end
    pub fn close(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            tracing::debug!(meeting_id = %self.meeting_id, "Meeting synchronizer closed");
        }
        self.listeners.lock().clear();
    }
}

impl Drop for MeetingSync {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::store::MemoryStore;
    use crate::types::{MeetingSettings, WaitingEntry};
    use std::time::Duration;

    fn records(store: &MemoryStore) -> MeetingRecords {
        MeetingRecords::new(Arc::new(store.clone()), MeetingId::new("syncmtgaa"))
    }

    #[tokio::test]
    async fn test_loading_clears_on_first_meeting_snapshot() {
        let store = MemoryStore::new();
        let records = records(&store);
        let sync = MeetingSync::start(&records).await.unwrap();

        // Absent meeting still clears loading
        let snapshot = sync.wait_for(|s| !s.loading).await.unwrap();
        assert!(snapshot.meeting.is_none());
        assert!(!snapshot.is_active());
    }

    #[tokio::test]
    async fn test_tracks_all_three_collections() {
        let store = MemoryStore::new();
        let records = records(&store);
        let host = Identity::member(Uid::new("h1"), "Host");
        records
            .create_meeting(&host, "Standup", MeetingSettings::default())
            .await
            .unwrap();

        let sync = MeetingSync::start(&records).await.unwrap();
        let guest = Identity::guest("Guest");
        let entry = WaitingEntry {
            uid: guest.uid().clone(),
            name: guest.name().to_string(),
            identity: (&guest).into(),
            requested_at: 5,
            camera_on: true,
            mic_on: false,
        };
        records.join_waiting_room(&entry).await.unwrap();

        let snapshot = sync
            .wait_for(|s| s.is_waiting(guest.uid()))
            .await
            .unwrap();
        assert!(snapshot.is_active());
        assert!(snapshot.is_host(&Uid::new("h1")));

        records.admit(&entry).await.unwrap();
        let snapshot = sync
            .wait_for(|s| s.is_participant(guest.uid()) && !s.is_waiting(guest.uid()))
            .await
            .unwrap();
        assert_eq!(snapshot.participants.len(), 1);
    }

    #[tokio::test]
    async fn test_ticks_are_ordered_and_start_with_current() {
        let store = MemoryStore::new();
        let records = records(&store);
        let sync = MeetingSync::start(&records).await.unwrap();
        let mut ticks = sync.ticks();

        let first = ticks.recv().await.unwrap();
        let host = Identity::member(Uid::new("h1"), "Host");
        records
            .create_meeting(&host, "Retro", MeetingSettings::default())
            .await
            .unwrap();

        let mut last = first.revision;
        loop {
            let tick = tokio::time::timeout(Duration::from_secs(5), ticks.recv())
                .await
                .unwrap()
                .unwrap();
            assert!(tick.revision > last);
            last = tick.revision;
            if tick.is_active() {
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_admission_never_publishes_a_gap() {
        let store = MemoryStore::new();
        let records = records(&store);
        let host = Identity::member(Uid::new("h1"), "Host");
        records
            .create_meeting(&host, "Queue", MeetingSettings::default())
            .await
            .unwrap();
        let sync = MeetingSync::start(&records).await.unwrap();
        let mut ticks = sync.ticks();

        for i in 0..25 {
            let guest = Identity::guest(format!("Guest {i}"));
            let uid = guest.uid().clone();
            let entry = WaitingEntry {
                uid: uid.clone(),
                name: guest.name().to_string(),
                identity: (&guest).into(),
                requested_at: i,
                camera_on: false,
                mic_on: false,
            };
            records.join_waiting_room(&entry).await.unwrap();
            loop {
                let tick = ticks.recv().await.unwrap();
                if tick.is_waiting(&uid) {
                    break;
                }
            }

            records.admit(&entry).await.unwrap();
            loop {
                let tick = ticks.recv().await.unwrap();
                assert!(
                    tick.is_waiting(&uid) || tick.is_participant(&uid),
                    "admission {i} published a tick without {uid}"
                );
                if !tick.is_waiting(&uid) {
                    break;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_close_unsubscribes() {
        let store = MemoryStore::new();
        let records = records(&store);
        let sync = MeetingSync::start(&records).await.unwrap();
        let mut ticks = sync.ticks();
        assert_eq!(store.subscriber_count(), 3);

        sync.close();
        while ticks.recv().await.is_some() {}
        assert!(
            crate::testing::eventually(|| {
                let store = store.clone();
                async move { store.subscriber_count() == 0 }
            })
            .await
        );
    }
}
