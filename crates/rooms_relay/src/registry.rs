/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::collections::{BTreeSet, HashMap};

use rooms_protocol::ServerEvent;
use tokio::sync::mpsc;

pub type SessionId = u64;
pub type SessionTx = mpsc::UnboundedSender<ServerEvent>;

struct SessionEntry {
    username: String,
    room: Option<String>,
    tx: SessionTx,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    /// Same room again; membership unchanged.
    Rejoined,
    /// Session is bound to another room for its lifetime.
    AlreadyBound(String),
    UnknownSession,
}

/// Active usernames with the number of live sessions using them. Duplicates are
/// counted, never rejected.
#[derive(Default)]
struct NameRegistry {
    active: HashMap<String, usize>,
}

impl NameRegistry {
    fn register(&mut self, name: &str) {
        *self.active.entry(name.to_string()).or_insert(0) += 1;
    }

    fn release(&mut self, name: &str) {
        if let Some(n) = self.active.get_mut(name) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                self.active.remove(name);
            }
        }
    }

    fn sessions_using(&self, name: &str) -> usize {
        self.active.get(name).copied().unwrap_or(0)
    }
}

/// Room membership for every live transport session. Owned by the relay
/// dispatch loop, never shared.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: HashMap<String, BTreeSet<SessionId>>,
    sessions: HashMap<SessionId, SessionEntry>,
    names: NameRegistry,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&mut self, session: SessionId, username: String, tx: SessionTx) {
        self.names.register(&username);
        if let Some(prev) = self.sessions.insert(session, SessionEntry { username, room: None, tx }) {
            self.names.release(&prev.username);
        }
    }

    /// Renames a session that has not joined a room yet.
    pub fn rename(&mut self, session: SessionId, username: &str) -> bool {
        let Some(entry) = self.sessions.get_mut(&session) else {
            return false;
        };
        if entry.room.is_some() || entry.username == username {
            return false;
        }
        self.names.release(&entry.username);
        self.names.register(username);
        entry.username = username.to_string();
        true
    }

    pub fn join(&mut self, session: SessionId, room_id: &str) -> JoinOutcome {
        let Some(entry) = self.sessions.get_mut(&session) else {
            return JoinOutcome::UnknownSession;
        };
        match entry.room.as_deref() {
            Some(bound) if bound == room_id => return JoinOutcome::Rejoined,
            Some(bound) => return JoinOutcome::AlreadyBound(bound.to_string()),
            None => {}
        }
        entry.room = Some(room_id.to_string());
        self.rooms.entry(room_id.to_string()).or_default().insert(session);
        JoinOutcome::Joined
    }

    /// Drops the session and returns `(room, username)` when it had joined one.
    pub fn leave(&mut self, session: SessionId) -> Option<(String, String)> {
        let entry = self.sessions.remove(&session)?;
        self.names.release(&entry.username);
        let room_id = entry.room?;
        if let Some(members) = self.rooms.get_mut(&room_id) {
            members.remove(&session);
            if members.is_empty() {
                self.rooms.remove(&room_id);
            }
        }
        Some((room_id, entry.username))
    }

    pub fn room_of(&self, session: SessionId) -> Option<&str> {
        self.sessions.get(&session).and_then(|s| s.room.as_deref())
    }

    pub fn username_of(&self, session: SessionId) -> Option<&str> {
        self.sessions.get(&session).map(|s| s.username.as_str())
    }

    pub fn members(&self, room_id: &str) -> Vec<SessionId> {
        self.rooms
            .get(room_id)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Distinct usernames held by live sessions.
    pub fn name_count(&self) -> usize {
        self.names.active.len()
    }

    pub fn sessions_using_name(&self, name: &str) -> usize {
        self.names.sessions_using(name)
    }

    pub fn deliver(&self, session: SessionId, event: ServerEvent) -> bool {
        match self.sessions.get(&session) {
            Some(s) => s.tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Sends to every member of `room_id` except `except`. Returns the number of
    /// sessions reached.
    pub fn broadcast(&self, room_id: &str, except: SessionId, event: &ServerEvent) -> usize {
        let Some(members) = self.rooms.get(room_id) else {
            return 0;
        };
        members
            .iter()
            .filter(|id| **id != except)
            .filter(|id| self.deliver(**id, event.clone()))
            .count()
    }

    /// Sends to the sessions of `username` inside `room_id`, skipping `except`.
    pub fn send_to_participant(
        &self,
        room_id: &str,
        username: &str,
        except: SessionId,
        event: &ServerEvent,
    ) -> usize {
        let Some(members) = self.rooms.get(room_id) else {
            return 0;
        };
        members
            .iter()
            .filter(|id| **id != except)
            .filter(|id| self.username_of(**id) == Some(username))
            .filter(|id| self.deliver(**id, event.clone()))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rooms_protocol::Participant;

    fn session(reg: &mut RoomRegistry, id: SessionId, name: &str) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        reg.connect(id, name.to_string(), tx);
        rx
    }

    #[test]
    fn join_is_idempotent_and_binds_once() {
        let mut reg = RoomRegistry::new();
        let _rx = session(&mut reg, 1, "alice");
        assert_eq!(reg.join(1, "r1"), JoinOutcome::Joined);
        assert_eq!(reg.join(1, "r1"), JoinOutcome::Rejoined);
        assert_eq!(reg.join(1, "r2"), JoinOutcome::AlreadyBound("r1".to_string()));
        assert_eq!(reg.members("r1"), vec![1]);
        assert!(reg.members("r2").is_empty());
        assert_eq!(reg.join(9, "r1"), JoinOutcome::UnknownSession);
    }

    #[test]
    fn leave_removes_member_and_empty_room() {
        let mut reg = RoomRegistry::new();
        let _a = session(&mut reg, 1, "alice");
        let _b = session(&mut reg, 2, "bob");
        reg.join(1, "r1");
        reg.join(2, "r1");
        assert_eq!(reg.leave(1), Some(("r1".to_string(), "alice".to_string())));
        assert_eq!(reg.members("r1"), vec![2]);
        assert_eq!(reg.leave(2), Some(("r1".to_string(), "bob".to_string())));
        assert_eq!(reg.room_count(), 0);
        assert_eq!(reg.leave(2), None);
    }

    #[test]
    fn duplicate_names_are_counted_not_rejected() {
        let mut reg = RoomRegistry::new();
        let _a = session(&mut reg, 1, "alice");
        let _b = session(&mut reg, 2, "alice");
        assert_eq!(reg.sessions_using_name("alice"), 2);
        reg.leave(1);
        assert_eq!(reg.sessions_using_name("alice"), 1);
        assert!(reg.rename(2, "alicia"));
        assert_eq!(reg.sessions_using_name("alice"), 0);
        assert_eq!(reg.sessions_using_name("alicia"), 1);
    }

    #[test]
    fn targeted_send_reaches_only_that_participant() {
        let mut reg = RoomRegistry::new();
        let _a = session(&mut reg, 1, "alice");
        let mut b = session(&mut reg, 2, "bob");
        let mut c = session(&mut reg, 3, "carol");
        for id in 1..=3 {
            reg.join(id, "r1");
        }
        let ev = ServerEvent::ParticipantJoined(Participant { username: "x".to_string() });
        assert_eq!(reg.send_to_participant("r1", "bob", 1, &ev), 1);
        assert!(b.try_recv().is_ok());
        assert!(c.try_recv().is_err());
        assert_eq!(reg.send_to_participant("r1", "nobody", 1, &ev), 0);
    }

    #[test]
    fn members_never_include_disconnected_sessions() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut reg = RoomRegistry::new();
        let mut live: Vec<SessionId> = Vec::new();
        let mut receivers = HashMap::new();
        let rooms = ["r1", "r2", "r3"];
        for step in 0..500u64 {
            if live.is_empty() || rng.gen_bool(0.6) {
                let id = step + 1;
                receivers.insert(id, session(&mut reg, id, "user"));
                reg.join(id, rooms[rng.gen_range(0..rooms.len())]);
                live.push(id);
            } else {
                let gone = live.swap_remove(rng.gen_range(0..live.len()));
                reg.leave(gone);
                receivers.remove(&gone);
            }
            for room in rooms {
                for member in reg.members(room) {
                    assert!(live.contains(&member), "session {member} left but is still in {room}");
                }
            }
        }
    }
}
