//! Membership state transitions.
//!
//! Tracks Up/Suspect/Down per machine from liveness observations. A machine
//! turns Suspect only after a sustained down streak, Suspect resolves back to
//! Up on any up observation (refutation) or hardens to Down after the
//! confirmation delay. Eventual consistency across machines is fine; Suspect
//! exists precisely to tolerate delayed or reordered observations.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use uncloud_model::{MachineId, MembershipState};

/// How long a peer must look down before it becomes Suspect.
pub const SUSPECT_DELAY: Duration = Duration::from_secs(10);

/// How long a Suspect machine gets for a refutation before it is Down.
pub const CONFIRM_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct Entry {
    state: MembershipState,
    /// Start of the current uninterrupted down streak.
    down_since: Option<Instant>,
    suspect_since: Option<Instant>,
}

impl Default for Entry {
    fn default() -> Self {
        Self { state: MembershipState::Up, down_since: None, suspect_since: None }
    }
}

/// Per-machine membership state derived from liveness observations.
#[derive(Debug, Default)]
pub struct MembershipTracker {
    entries: HashMap<MachineId, Entry>,
}

impl MembershipTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one liveness observation. Returns the new state when it
    /// changed.
    pub fn observe(&mut self, id: &MachineId, up: bool) -> Option<MembershipState> {
        self.observe_at(id, up, Instant::now())
    }

    pub fn observe_at(
        &mut self,
        id: &MachineId,
        up: bool,
        now: Instant,
    ) -> Option<MembershipState> {
        let entry = self.entries.entry(id.clone()).or_default();
        let old = entry.state;

        if up {
            entry.down_since = None;
            entry.suspect_since = None;
            entry.state = MembershipState::Up;
        } else {
            let down_since = *entry.down_since.get_or_insert(now);
            match entry.state {
                MembershipState::Up => {
                    if now.duration_since(down_since) >= SUSPECT_DELAY {
                        entry.state = MembershipState::Suspect;
                        entry.suspect_since = Some(now);
                    }
                }
                MembershipState::Suspect => {
                    let suspect_since = entry.suspect_since.unwrap_or(down_since);
                    if now.duration_since(suspect_since) >= CONFIRM_DELAY {
                        entry.state = MembershipState::Down;
                    }
                }
                MembershipState::Down => {}
            }
        }

        (entry.state != old).then_some(entry.state)
    }

    /// Current state of a machine; unknown machines are Up.
    pub fn state(&self, id: &MachineId) -> MembershipState {
        self.entries.get(id).map(|e| e.state).unwrap_or(MembershipState::Up)
    }

    /// Drop tracking for a removed machine.
    pub fn forget(&mut self, id: &MachineId) {
        self.entries.remove(id);
    }
}
