//! Member store and per-member state machine
//!
//! Guarded by a single `parking_lot::RwLock`: one lock protects the member
//! table, the failed/left lists, and the recent-intent buffer together,
//! taken in write mode by the intent handler, the authoritative handler,
//! and the reaper, and in read mode by `members()`/`num_members()`/the
//! snapshotter.

use std::net::SocketAddr;
use std::time::Instant;

use indexmap::IndexMap;
use parking_lot::RwLock;
use rand::seq::SliceRandom;

use crate::intent::{IntentBuffer, IntentKind};
use crate::member::types::{Member, MemberStatus};

/// Membership event kinds emitted to the outbound event sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberEventKind {
    Join,
    Leave,
    Failed,
    Update,
    Reap,
}

/// Outcome of processing an advisory intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentResult {
    /// The intent's ltime was not newer than the member's status-clock; it
    /// must not be rebroadcast.
    Stale,
    /// The intent was accepted but produces no externally visible change
    /// (e.g. a join intent for a Failed member only advances the clock).
    Ignored { rebroadcast: bool },
    /// The intent changed member state. `event` is set only for leave
    /// intents against a Failed member; every other intent-driven
    /// transition emits no event, since only the authoritative path is
    /// expected to emit events for those.
    Applied {
        rebroadcast: bool,
        event: Option<MemberEventKind>,
    },
}

struct MemberStoreInner {
    members: IndexMap<String, Member>,
    failed: Vec<String>,
    left: Vec<String>,
    intents: IntentBuffer,
}

/// Indexed, locked table of members plus the per-member state machine.
pub struct MemberStore {
    inner: RwLock<MemberStoreInner>,
    local_name: String,
}

impl MemberStore {
    pub fn new(local_name: impl Into<String>, local_addr: SocketAddr) -> Self {
        let local_name = local_name.into();
        let mut members = IndexMap::new();
        members.insert(local_name.clone(), Member::new(local_name.clone(), local_addr));
        Self {
            inner: RwLock::new(MemberStoreInner {
                members,
                failed: Vec::new(),
                left: Vec::new(),
                intents: IntentBuffer::new(),
            }),
            local_name,
        }
    }

    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    /// Snapshot of every known member, in insertion order.
    pub fn members(&self) -> Vec<Member> {
        self.inner.read().members.values().cloned().collect()
    }

    pub fn num_members(&self) -> usize {
        self.inner.read().members.len()
    }

    pub fn get(&self, name: &str) -> Option<Member> {
        self.inner.read().members.get(name).cloned()
    }

    pub fn status_of(&self, name: &str) -> MemberStatus {
        self.inner
            .read()
            .members
            .get(name)
            .map(|m| m.status)
            .unwrap_or(MemberStatus::None)
    }

    fn remove_from_lists(inner: &mut MemberStoreInner, name: &str) {
        inner.failed.retain(|n| n != name);
        inner.left.retain(|n| n != name);
    }

    fn file_into_list(inner: &mut MemberStoreInner, name: &str, status: MemberStatus) {
        Self::remove_from_lists(inner, name);
        match status {
            MemberStatus::Failed => inner.failed.push(name.to_string()),
            MemberStatus::Left => inner.left.push(name.to_string()),
            _ => {}
        }
    }

    /// Process an advisory (gossiped) join intent.
    pub fn handle_join_intent(&self, name: &str, ltime: u64) -> IntentResult {
        let mut inner = self.inner.write();

        if let Some(member) = inner.members.get(name).cloned() {
            if ltime <= member.status_ltime {
                return IntentResult::Stale;
            }
            let mut updated = member.clone();
            updated.status_ltime = ltime;
            let result = match member.status {
                MemberStatus::Left | MemberStatus::Failed => {
                    IntentResult::Ignored { rebroadcast: false }
                }
                MemberStatus::Leaving => {
                    updated.status = MemberStatus::Alive;
                    updated.leave_time = None;
                    IntentResult::Applied {
                        rebroadcast: true,
                        event: None,
                    }
                }
                MemberStatus::Alive => IntentResult::Applied {
                    rebroadcast: true,
                    event: None,
                },
                MemberStatus::None => unreachable!("members table never stores None"),
            };
            inner.members.insert(name.to_string(), updated);
            result
        } else {
            let addr: SocketAddr = "0.0.0.0:0".parse().unwrap();
            let mut placeholder = Member::new(name.to_string(), addr);
            placeholder.status = MemberStatus::Alive;
            placeholder.status_ltime = ltime;
            inner.members.insert(name.to_string(), placeholder);
            inner.intents.discard(name);
            IntentResult::Applied {
                rebroadcast: true,
                event: None,
            }
        }
    }

    /// Process an advisory (gossiped) leave intent.
    ///
    /// `is_local` must be true when `name` is this node's own name; a leave
    /// intent naming a still-Alive local node is always refuted rather than
    /// applied.
    pub fn handle_leave_intent(&self, name: &str, ltime: u64, is_local: bool) -> IntentResult {
        let mut inner = self.inner.write();

        let existing = inner.members.get(name).cloned();

        if is_local {
            if let Some(ref m) = existing {
                if m.status == MemberStatus::Alive {
                    return IntentResult::Ignored { rebroadcast: false };
                }
            }
        }

        let Some(member) = existing else {
            inner.intents.record(IntentKind::Leave, name, ltime);
            return IntentResult::Applied {
                rebroadcast: true,
                event: None,
            };
        };

        // A leave intent with ltime == status-clock against a Failed member
        // still fires Failed -> Left, overriding the general staleness rule
        // below; handled as an explicit special case ahead of it.
        if member.status == MemberStatus::Failed && ltime >= member.status_ltime {
            let mut updated = member.clone();
            updated.status = MemberStatus::Left;
            updated.status_ltime = ltime.max(member.status_ltime);
            updated.leave_time = Some(Instant::now());
            inner.members.insert(name.to_string(), updated);
            Self::file_into_list(&mut inner, name, MemberStatus::Left);
            return IntentResult::Applied {
                rebroadcast: true,
                event: Some(MemberEventKind::Leave),
            };
        }

        if member.status == MemberStatus::Left {
            // "no intent can leave Left" — ignored fully, clock not bumped.
            return IntentResult::Stale;
        }

        if ltime <= member.status_ltime {
            return IntentResult::Stale;
        }

        let mut updated = member.clone();
        updated.status_ltime = ltime;
        let result = match member.status {
            MemberStatus::Alive => {
                updated.status = MemberStatus::Leaving;
                IntentResult::Applied {
                    rebroadcast: true,
                    event: None,
                }
            }
            MemberStatus::Leaving => IntentResult::Applied {
                rebroadcast: true,
                event: None,
            },
            MemberStatus::Left | MemberStatus::Failed | MemberStatus::None => {
                unreachable!("handled above")
            }
        };
        inner.members.insert(name.to_string(), updated);
        result
    }

    /// Process an authoritative transport notification. Always wins: may
    /// resurrect Left/Failed to Alive, may push any live status down to
    /// Failed/Left. Always returns the event to emit.
    pub fn handle_authoritative_join(
        &self,
        name: &str,
        addr: SocketAddr,
        witnessed_clock: u64,
    ) -> MemberEventKind {
        let mut inner = self.inner.write();
        Self::remove_from_lists(&mut inner, name);
        inner.intents.discard(name);

        let event = if inner.members.contains_key(name) {
            MemberEventKind::Join
        } else {
            MemberEventKind::Join
        };

        let entry = inner
            .members
            .entry(name.to_string())
            .or_insert_with(|| Member::new(name.to_string(), addr));
        entry.addr = addr;
        entry.status = MemberStatus::Alive;
        entry.leave_time = None;
        entry.status_ltime = entry.status_ltime.max(witnessed_clock);
        event
    }

    pub fn handle_authoritative_fail(
        &self,
        name: &str,
        witnessed_clock: u64,
    ) -> MemberEventKind {
        self.handle_authoritative_down(name, MemberStatus::Failed, witnessed_clock)
    }

    pub fn handle_authoritative_leave(
        &self,
        name: &str,
        witnessed_clock: u64,
    ) -> MemberEventKind {
        self.handle_authoritative_down(name, MemberStatus::Left, witnessed_clock)
    }

    fn handle_authoritative_down(
        &self,
        name: &str,
        status: MemberStatus,
        witnessed_clock: u64,
    ) -> MemberEventKind {
        let mut inner = self.inner.write();
        let addr = inner
            .members
            .get(name)
            .map(|m| m.addr)
            .unwrap_or_else(|| "0.0.0.0:0".parse().unwrap());
        let entry = inner
            .members
            .entry(name.to_string())
            .or_insert_with(|| Member::new(name.to_string(), addr));
        entry.status = status;
        entry.leave_time = Some(Instant::now());
        entry.status_ltime = entry.status_ltime.max(witnessed_clock);
        Self::file_into_list(&mut inner, name, status);
        match status {
            MemberStatus::Failed => MemberEventKind::Failed,
            MemberStatus::Left => MemberEventKind::Leave,
            _ => MemberEventKind::Update,
        }
    }

    /// Permanently drop a member (reaper only). Returns `true` if it existed.
    pub fn reap(&self, name: &str) -> bool {
        let mut inner = self.inner.write();
        Self::remove_from_lists(&mut inner, name);
        inner.members.shift_remove(name).is_some()
    }

    /// Names currently in the failed list, oldest first.
    pub fn failed_names(&self) -> Vec<String> {
        self.inner.read().failed.clone()
    }

    /// Names currently in the left list, oldest first.
    pub fn left_names(&self) -> Vec<String> {
        self.inner.read().left.clone()
    }

    pub fn expire_intents(&self, timeout: std::time::Duration) {
        self.inner.write().intents.expire(timeout);
    }

    /// Pick up to `k` distinct, currently-alive members at random, excluding
    /// any name in `exclude`. Used to choose relay intermediaries for a
    /// query response's relay factor.
    pub fn random_others(&self, k: usize, exclude: &[&str]) -> Vec<Member> {
        let mut candidates: Vec<Member> = self
            .inner
            .read()
            .members
            .values()
            .filter(|m| m.status == MemberStatus::Alive && !exclude.contains(&m.name.as_str()))
            .cloned()
            .collect();
        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(k);
        candidates
    }
}
