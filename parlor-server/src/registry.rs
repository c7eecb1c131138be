//! Session registry and broadcast engine.
//!
//! The single shared table of active participants, plus the admin set and
//! ban table keyed by identity fingerprint. All of it lives behind one
//! exclusive lock: mutating operations take the lock for their critical
//! section and release it before any delivery happens. Broadcast snapshots
//! the membership under that lock, so a participant added or removed
//! concurrently either fully receives a message or doesn't see it at all.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;

use crate::history::History;
use crate::participant::Participant;

/// Display names are truncated to this many characters.
pub const MAX_NAME_LEN: usize = 32;
/// How many broadcast messages the history ring retains.
pub const HISTORY_LEN: usize = 20;
/// How many history lines a newly joined participant gets replayed.
pub const JOIN_REPLAY: usize = 10;

/// A requested display name collided with an active participant.
///
/// Never fatal: the requester is assigned a fallback name and told about
/// it.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NameError {
    #[error("{0} is not available")]
    Unavailable(String),
}

/// Ban entry for one identity fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanStatus {
    Permanent,
    ExpiresAt(Instant),
}

struct RoomState {
    /// Display name -> participant handle.
    participants: HashMap<String, Arc<Participant>>,
    /// Total connections ever registered. Feeds `Guest<N>` fallback names
    /// and is never reused.
    count: u64,
    /// Fingerprints with operator privileges.
    admins: HashSet<String>,
    /// Fingerprint -> ban entry. Absent means not banned.
    banned: HashMap<String, BanStatus>,
    history: History,
}

/// The authoritative table of active participants.
pub struct Registry {
    state: Mutex<RoomState>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RoomState {
                participants: HashMap::new(),
                count: 0,
                admins: HashSet::new(),
                banned: HashMap::new(),
                history: History::new(HISTORY_LEN),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a new participant.
    ///
    /// The requested name may be rewritten to resolve a collision; the
    /// participant is told when that happens. Outside the lock, the
    /// newcomer gets recent history and a welcome line, then the join is
    /// announced to the whole room, newcomer included.
    pub fn add(&self, participant: Arc<Participant>) {
        let requested = participant.name();
        let (name, collided, num, replay) = {
            let mut state = self.state.lock();
            state.count += 1;
            let (name, collision) = propose_name(&state, &requested);
            participant.set_name(name.clone());
            state
                .participants
                .insert(name.clone(), Arc::clone(&participant));
            let num = state.participants.len();
            let replay = state.history.recent(JOIN_REPLAY);
            (name, collision.is_some(), num, replay)
        };

        for line in replay {
            participant.send(line);
        }
        participant.send("-> Welcome to parlor. Type /help for commands.");
        if collided {
            participant.send(format!(
                "-> Your name '{requested}' is not available, renamed to '{name}'. Use /nick <name> to change it."
            ));
        }

        self.broadcast(&format!("* {name} joined. (Total connected: {num})"), None);
    }

    /// Remove the entry keyed by the participant's current name, then
    /// announce the departure. The announcement excludes nobody; the
    /// leaver is already out of the table and cannot receive it.
    pub fn remove(&self, participant: &Arc<Participant>) {
        let name = participant.name();
        self.state.lock().participants.remove(&name);
        self.broadcast(&format!("* {name} left."), None);
    }

    /// Change a participant's display name.
    ///
    /// A collision is reported privately to the requester and nothing
    /// changes; otherwise the rename is announced to the whole room.
    pub fn rename(&self, participant: &Arc<Participant>, requested: &str) {
        let mut state = self.state.lock();
        let (name, collision) = propose_name(&state, requested);
        if let Some(err) = collision {
            drop(state);
            participant.send(format!("-> {err}"));
            return;
        }
        let old = participant.name();
        state.participants.remove(&old);
        participant.set_name(name.clone());
        state
            .participants
            .insert(name.clone(), Arc::clone(participant));
        drop(state);

        self.broadcast(&format!("* {old} is now known as {name}."), None);
    }

    /// All display names, optionally filtered to those starting with
    /// `prefix`. No ordering guarantee.
    pub fn list(&self, prefix: Option<&str>) -> Vec<String> {
        self.state
            .lock()
            .participants
            .keys()
            .filter(|name| prefix.is_none_or(|p| name.starts_with(p)))
            .cloned()
            .collect()
    }

    /// Exact-name lookup.
    pub fn who(&self, name: &str) -> Option<Arc<Participant>> {
        self.state.lock().participants.get(name).cloned()
    }

    /// Grant operator status to an identity fingerprint.
    pub fn op(&self, fingerprint: &str) {
        tracing::info!(%fingerprint, "Granting operator status");
        self.state.lock().admins.insert(fingerprint.to_string());
    }

    /// Whether the participant's identity holds operator status. Tied to
    /// the fingerprint, never the display name.
    pub fn is_op(&self, participant: &Participant) -> bool {
        self.state.lock().admins.contains(participant.fingerprint())
    }

    /// Whether an identity is currently banned. An expired entry is
    /// removed on the way out and does not block a join.
    pub fn is_banned(&self, fingerprint: &str) -> bool {
        let mut state = self.state.lock();
        match state.banned.get(fingerprint) {
            None => false,
            Some(BanStatus::Permanent) => true,
            Some(BanStatus::ExpiresAt(when)) => {
                if *when <= Instant::now() {
                    state.banned.remove(fingerprint);
                    false
                } else {
                    true
                }
            }
        }
    }

    /// Ban an identity. `None` means permanent; overwrites any existing
    /// entry for that fingerprint.
    pub fn ban(&self, fingerprint: &str, duration: Option<Duration>) {
        let status = match duration {
            Some(d) => BanStatus::ExpiresAt(Instant::now() + d),
            None => BanStatus::Permanent,
        };
        tracing::info!(%fingerprint, ?status, "Banning identity");
        self.state
            .lock()
            .banned
            .insert(fingerprint.to_string(), status);
    }

    /// Lift a ban. No error if the identity was not banned.
    pub fn unban(&self, fingerprint: &str) {
        self.state.lock().banned.remove(fingerprint);
    }

    /// Currently banned fingerprints. Expired entries are pruned first.
    pub fn banned(&self) -> Vec<String> {
        let mut state = self.state.lock();
        let now = Instant::now();
        state.banned.retain(|_, status| match status {
            BanStatus::Permanent => true,
            BanStatus::ExpiresAt(when) => *when > now,
        });
        state.banned.keys().cloned().collect()
    }

    /// Handles of every active participant (used at shutdown).
    pub fn participants(&self) -> Vec<Arc<Participant>> {
        self.state.lock().participants.values().cloned().collect()
    }

    /// Append `message` to history and deliver it to every registered
    /// participant except `exclude`, compared by handle identity rather
    /// than name so a concurrent rename cannot skip or duplicate anyone.
    /// The history append and membership snapshot are one atomic step;
    /// delivery happens outside the lock and never blocks on a slow
    /// participant.
    pub fn broadcast(&self, message: &str, exclude: Option<&Arc<Participant>>) {
        let targets = {
            let mut state = self.state.lock();
            state.history.push(message.to_string());
            state.participants.values().cloned().collect::<Vec<_>>()
        };
        tracing::debug!(recipients = targets.len(), %message, "Broadcast");
        for target in &targets {
            if exclude.is_some_and(|excluded| Arc::ptr_eq(excluded, target)) {
                continue;
            }
            target.send(message.to_string());
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve a requested display name against the active set. Callers must
/// hold the registry lock.
///
/// Strips everything outside `[0-9A-Za-z_]`, truncates to
/// [`MAX_NAME_LEN`], substitutes `Guest<counter>` when empty, and reports
/// collisions without rejecting: the fallback name is assigned and the
/// error is surfaced to the requester. The fallback itself is not
/// re-checked for collisions. The counter is never reused, so a clash
/// requires someone to have renamed themselves to a future `Guest<N>`.
fn propose_name(state: &RoomState, requested: &str) -> (String, Option<NameError>) {
    let mut name: String = requested
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    name.truncate(MAX_NAME_LEN);

    if name.is_empty() {
        name = format!("Guest{}", state.count);
    }

    if state.participants.contains_key(&name) {
        let taken = name;
        let fallback = format!("Guest{}", state.count);
        return (fallback, Some(NameError::Unavailable(taken)));
    }

    (name, None)
}
