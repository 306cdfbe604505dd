//! Property tests for admission
//!
//! The stage machine is driven with arbitrary snapshot sequences, and the
//! waiting-room records with arbitrary host actions.

use meetmesh_core::records::decode_waiting_room;
use meetmesh_core::{
    AdmissionMachine, ExitReason, Identity, JoinPlan, Meeting, MeetingId, MeetingRecords,
    MeetingSettings, MeetingSnapshot, MemoryStore, ParticipantIdentity, Presence, Snapshot, Stage,
    Uid, WaitingEntry,
};
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;

fn meeting(active: bool) -> Meeting {
    Meeting {
        id: MeetingId::new("propertyx"),
        host_id: Uid::new("h1"),
        host_name: "Host".to_string(),
        title: "Props".to_string(),
        created_at: 1,
        is_active: active,
        settings: MeetingSettings::default(),
    }
}

fn entry(uid: &Uid) -> WaitingEntry {
    WaitingEntry {
        uid: uid.clone(),
        name: uid.as_str().to_uppercase(),
        identity: ParticipantIdentity::Member {
            email: None,
            photo_url: None,
        },
        requested_at: 1,
        camera_on: false,
        mic_on: false,
    }
}

#[derive(Debug, Clone, Copy)]
struct Tick {
    active: bool,
    in_roster: bool,
    in_waiting: bool,
}

fn tick() -> impl Strategy<Value = Tick> {
    // Inactive meetings are rare so sequences get past them
    (prop::bool::weighted(0.9), any::<bool>(), any::<bool>()).prop_map(
        |(active, in_roster, in_waiting)| Tick {
            active,
            in_roster,
            in_waiting,
        },
    )
}

#[derive(Debug, Clone, Copy)]
enum Action {
    Request(usize),
    Admit(usize),
    Reject(usize),
}

fn action() -> impl Strategy<Value = Action> {
    prop_oneof![
        (0..3usize).prop_map(Action::Request),
        (0..3usize).prop_map(Action::Admit),
        (0..3usize).prop_map(Action::Reject),
    ]
}

fn snapshot(local: &Uid, tick: Tick) -> MeetingSnapshot {
    let pending = entry(local);
    MeetingSnapshot {
        meeting: Some(meeting(tick.active)),
        participants: if tick.in_roster {
            vec![pending.admit(2)]
        } else {
            Vec::new()
        },
        waiting_room: if tick.in_waiting {
            vec![pending]
        } else {
            Vec::new()
        },
        loading: false,
        revision: 1,
    }
}

proptest! {
    #[test]
    fn prop_waiting_user_follows_roster(ticks in prop::collection::vec(tick(), 1..24)) {
        let local = Uid::new("m1");
        let mut machine = AdmissionMachine::new(Some(local.clone()));
        let first = snapshot(&local, Tick { active: true, in_roster: false, in_waiting: false });
        machine.on_snapshot(&first);
        prop_assert_eq!(machine.stage(), Stage::PreJoin);

        let identity = Identity::member(local.clone(), "M1");
        let plan = machine.plan_join(&first, &identity).unwrap();
        prop_assert_eq!(plan, JoinPlan::RequestEntry);
        machine.joined(plan);

        for tick in ticks {
            let before = machine.stage();
            machine.on_snapshot(&snapshot(&local, tick));
            // A tick alone never rejects
            if !before.is_terminal() {
                prop_assert_ne!(machine.stage(), Stage::Exited(ExitReason::Rejected));
            }
            if machine.needs_confirmation() {
                prop_assert!(!tick.in_roster && !tick.in_waiting);
                machine.confirm_presence(Presence {
                    in_roster: tick.in_roster,
                    in_waiting: tick.in_waiting,
                });
            }
            let after = machine.stage();

            if before.is_terminal() {
                prop_assert_eq!(after, before);
                continue;
            }
            if !tick.active {
                prop_assert_eq!(after, Stage::Exited(ExitReason::MeetingEnded));
                continue;
            }
            if before == Stage::Waiting && tick.in_roster {
                prop_assert_eq!(after, Stage::InMeeting);
            }
            if after == Stage::Exited(ExitReason::Rejected) {
                prop_assert_eq!(before, Stage::Waiting);
                prop_assert!(!tick.in_waiting && !tick.in_roster);
            }
            if after == Stage::Exited(ExitReason::Removed) {
                prop_assert_eq!(before, Stage::InMeeting);
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_admission_records_stay_disjoint(actions in prop::collection::vec(action(), 1..16)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let uids: Vec<Uid> = (0..3).map(|i| Uid::new(format!("u{i}"))).collect();

        let (roster, waiting, expected_roster, expected_waiting) = runtime.block_on(async {
            let store = MemoryStore::new();
            let records = MeetingRecords::new(Arc::new(store.clone()), MeetingId::new("propertyx"));
            let mut expected_roster = BTreeSet::new();
            let mut expected_waiting = BTreeSet::new();

            for action in actions {
                match action {
                    Action::Request(i) => {
                        if !expected_roster.contains(&uids[i]) {
                            records.join_waiting_room(&entry(&uids[i])).await.unwrap();
                            expected_waiting.insert(uids[i].clone());
                        }
                    }
                    Action::Admit(i) => {
                        if let Some(pending) = records.waiting_entry(&uids[i]).await.unwrap() {
                            records.admit(&pending).await.unwrap();
                            expected_waiting.remove(&uids[i]);
                            expected_roster.insert(uids[i].clone());
                        }
                    }
                    Action::Reject(i) => {
                        records.reject(&uids[i]).await.unwrap();
                        expected_waiting.remove(&uids[i]);
                    }
                }
            }

            let roster: BTreeSet<Uid> = records
                .participants()
                .await
                .unwrap()
                .into_iter()
                .map(|p| p.uid)
                .collect();
            let waiting: BTreeSet<Uid> =
                decode_waiting_room(&Snapshot(store.get(&records.paths().waiting_room())))
                    .into_iter()
                    .map(|w| w.uid)
                    .collect();
            (roster, waiting, expected_roster, expected_waiting)
        });

        prop_assert!(roster.is_disjoint(&waiting));
        prop_assert_eq!(roster, expected_roster);
        prop_assert_eq!(waiting, expected_waiting);
    }
}
