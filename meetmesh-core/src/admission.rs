//! Admission state machine
//!
//! Moves the local user through `loading → pre-join → waiting → in-meeting`
//! using only what the synchronizer publishes. Roster and waiting room update
//! independently, so both are consulted on every tick.
//!
//! A missing or inactive meeting forces an exit from any stage. While
//! waiting, appearing on the roster is checked before disappearing from the
//! waiting room. A tick that shows the local user in neither collection is
//! not trusted on its own: the two subscriptions can deliver an admission's
//! writes in either order. The machine only flags the absence, and the
//! caller settles it with [`AdmissionMachine::confirm_presence`] after
//! reading both records directly.

use std::fmt;

use crate::identity::{Identity, Uid};
use crate::store::StoreError;
use crate::sync::MeetingSnapshot;
use crate::types::{MeetingSettings, ParticipantIdentity, Role};

/// Why the local user left the meeting page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitReason {
    /// Meeting record absent
    MeetingNotFound,
    /// Meeting no longer active
    MeetingEnded,
    /// Waiting-room entry removed without admission
    Rejected,
    /// Removed from the roster by the host
    Removed,
    /// Left voluntarily
    Left,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            Self::MeetingNotFound => "This meeting does not exist or has ended",
            Self::MeetingEnded => "This meeting has ended",
            Self::Rejected => "Your request to join was denied",
            Self::Removed => "You were removed from the meeting",
            Self::Left => "You left the meeting",
        };
        f.write_str(message)
    }
}

/// Stage of the local user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Waiting for the first meeting snapshot
    Loading,
    /// Choosing devices and name before joining
    PreJoin,
    /// In the waiting room
    Waiting,
    /// Admitted
    InMeeting,
    /// Terminal
    Exited(ExitReason),
}

impl Stage {
    /// Whether no further transition is possible
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Exited(_))
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Loading => f.write_str("loading"),
            Stage::PreJoin => f.write_str("pre-join"),
            Stage::Waiting => f.write_str("waiting"),
            Stage::InMeeting => f.write_str("meeting"),
            Stage::Exited(reason) => write!(f, "exited ({reason:?})"),
        }
    }
}

/// A stage change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// Previous stage
    pub from: Stage,
    /// New stage
    pub to: Stage,
}

/// How a join intent is carried out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinPlan {
    /// Write a participant record directly
    EnterDirectly {
        /// Role of the new participant
        role: Role,
    },
    /// Write a waiting-room entry and wait for the host
    RequestEntry,
}

/// Admission errors
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    /// Operation not allowed in the current stage
    #[error("Not allowed while {0}")]
    InvalidStage(Stage),

    /// Meeting missing or inactive
    #[error("Meeting is not available")]
    MeetingUnavailable,

    /// Guests excluded by the meeting settings
    #[error("Guests are not allowed in this meeting")]
    GuestsNotAllowed,

    /// Roster at capacity
    #[error("Meeting is full ({max} participants)")]
    MeetingFull {
        /// Configured limit
        max: u32,
    },

    /// Host-only action
    #[error("Only the host can do this")]
    NotHost,

    /// No waiting-room entry for this user
    #[error("{0} is not in the waiting room")]
    NotWaiting(Uid),

    /// Store operation failed
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Refuse when the roster already holds `max_participants`
pub fn ensure_capacity(
    settings: &MeetingSettings,
    roster_len: usize,
) -> Result<(), AdmissionError> {
    if roster_len >= settings.max_participants as usize {
        return Err(AdmissionError::MeetingFull {
            max: settings.max_participants,
        });
    }
    Ok(())
}

/// Stage tracking for the local user
#[derive(Debug, Clone)]
pub struct AdmissionMachine {
    local: Option<Uid>,
    stage: Stage,
    seen_in_roster: bool,
    absent: bool,
}

/// Where a direct read found the local user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Presence {
    /// Participant record exists
    pub in_roster: bool,
    /// Waiting-room entry exists
    pub in_waiting: bool,
}

impl AdmissionMachine {
    /// Start in `Loading`; `local` is `None` until a guest picks a name
    pub fn new(local: Option<Uid>) -> Self {
        Self {
            local,
            stage: Stage::Loading,
            seen_in_roster: false,
            absent: false,
        }
    }

    /// Current stage
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Local uid, if known
    pub fn local(&self) -> Option<&Uid> {
        self.local.as_ref()
    }

    /// Adopt the uid generated for a guest
    pub fn set_local(&mut self, uid: Uid) {
        self.local = Some(uid);
    }

    fn enter(&mut self, to: Stage, snapshot: Option<&MeetingSnapshot>) -> Option<Transition> {
        if to == self.stage {
            return None;
        }
        let from = self.stage;
        self.stage = to;
        self.absent = false;
        self.seen_in_roster = match (&self.local, snapshot) {
            (Some(uid), Some(snapshot)) => snapshot.is_participant(uid),
            _ => false,
        };
        tracing::debug!(old_state = %from, new_state = %to, "Admission stage changed");
        Some(Transition { from, to })
    }

    /// Reconcile against a synchronizer tick
    pub fn on_snapshot(&mut self, snapshot: &MeetingSnapshot) -> Option<Transition> {
        if self.stage.is_terminal() || snapshot.loading {
            return None;
        }

        let meeting_exit = match &snapshot.meeting {
            None => Some(ExitReason::MeetingNotFound),
            Some(meeting) if !meeting.is_active => Some(ExitReason::MeetingEnded),
            Some(_) => None,
        };
        if let Some(reason) = meeting_exit {
            return self.enter(Stage::Exited(reason), None);
        }

        let Some(uid) = self.local.clone() else {
            // Guests pick a name on the pre-join screen
            return match self.stage {
                Stage::Loading => self.enter(Stage::PreJoin, None),
                _ => None,
            };
        };
        let in_roster = snapshot.is_participant(&uid);
        let in_waiting = snapshot.is_waiting(&uid);

        let next = match self.stage {
            Stage::Loading if in_roster => Stage::InMeeting,
            Stage::Loading if in_waiting => Stage::Waiting,
            Stage::Loading => Stage::PreJoin,
            Stage::PreJoin if in_roster => Stage::InMeeting,
            Stage::PreJoin if in_waiting => Stage::Waiting,
            Stage::Waiting if in_roster => Stage::InMeeting,
            Stage::InMeeting if !in_roster && self.seen_in_roster => {
                Stage::Exited(ExitReason::Removed)
            }
            stage => stage,
        };

        if self.stage == Stage::Waiting {
            self.absent = !in_roster && !in_waiting;
            if self.absent {
                tracing::debug!(uid = %uid, "Absent from both collections, confirming");
            }
        }
        self.seen_in_roster |= in_roster;
        self.enter(next, Some(snapshot))
    }

    /// Whether the last tick left the local user in neither collection
    /// while waiting; settle it with [`AdmissionMachine::confirm_presence`]
    pub fn needs_confirmation(&self) -> bool {
        self.stage == Stage::Waiting && self.absent
    }

    /// Settle the waiting stage against a direct read of both records
    ///
    /// The waiting room must be read before the roster: an admission writes
    /// the participant before removing the entry, so a missing entry read
    /// first guarantees the roster read sees any admission. Absent from
    /// both means the host removed the entry without admitting.
    pub fn confirm_presence(&mut self, presence: Presence) -> Option<Transition> {
        if self.stage != Stage::Waiting {
            return None;
        }
        self.absent = false;
        let next = if presence.in_roster {
            Stage::InMeeting
        } else if presence.in_waiting {
            Stage::Waiting
        } else {
            Stage::Exited(ExitReason::Rejected)
        };
        self.enter(next, None)
    }

    /// Decide how `identity` joins, given the latest snapshot
    ///
    /// # Errors
    ///
    /// Fails outside `PreJoin`, when the meeting is unavailable, when guests
    /// are excluded, or when direct entry would exceed the roster limit
    pub fn plan_join(
        &self,
        snapshot: &MeetingSnapshot,
        identity: &Identity,
    ) -> Result<JoinPlan, AdmissionError> {
        if self.stage != Stage::PreJoin {
            return Err(AdmissionError::InvalidStage(self.stage));
        }
        let meeting = snapshot
            .meeting
            .as_ref()
            .filter(|m| m.is_active)
            .ok_or(AdmissionError::MeetingUnavailable)?;

        if meeting.host_id == *identity.uid() {
            return Ok(JoinPlan::EnterDirectly { role: Role::Host });
        }
        if identity.is_guest() && !meeting.settings.allow_guests {
            return Err(AdmissionError::GuestsNotAllowed);
        }
        if meeting.settings.require_approval {
            return Ok(JoinPlan::RequestEntry);
        }
        ensure_capacity(&meeting.settings, snapshot.participants.len())?;
        Ok(JoinPlan::EnterDirectly {
            role: Role::for_identity(&ParticipantIdentity::from(identity)),
        })
    }

    /// Record that the join write for `plan` succeeded
    pub fn joined(&mut self, plan: JoinPlan) -> Option<Transition> {
        let to = match plan {
            JoinPlan::EnterDirectly { .. } => Stage::InMeeting,
            JoinPlan::RequestEntry => Stage::Waiting,
        };
        self.enter(to, None)
    }

    /// Leave voluntarily
    pub fn leave(&mut self) -> Option<Transition> {
        if self.stage.is_terminal() {
            return None;
        }
        self.enter(Stage::Exited(ExitReason::Left), None)
    }

    /// Fail unless the local user is in the meeting as its host
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::InvalidStage`] outside the meeting and
    /// [`AdmissionError::NotHost`] for everyone but the host
    pub fn ensure_host(&self, snapshot: &MeetingSnapshot) -> Result<(), AdmissionError> {
        if self.stage != Stage::InMeeting {
            return Err(AdmissionError::InvalidStage(self.stage));
        }
        match &self.local {
            Some(uid) if snapshot.is_host(uid) => Ok(()),
            _ => Err(AdmissionError::NotHost),
        }
    }
}
