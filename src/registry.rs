//! Live sessions, indexed by session and by player.

use std::collections::HashMap;

use crate::session::{ParticipantId, Session, SessionId};

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, Session>,
    by_participant: HashMap<ParticipantId, SessionId>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, session: Session) -> SessionId {
        let id = session.id();
        for player in session.players() {
            self.by_participant.insert(player.id, id);
        }
        self.sessions.insert(id, session);
        id
    }

    /// The active session `participant` plays in.
    pub fn lookup(&self, participant: ParticipantId) -> Option<&Session> {
        let id = self.by_participant.get(&participant)?;
        self.sessions.get(id).filter(|s| s.is_open())
    }

    pub fn lookup_mut(&mut self, participant: ParticipantId) -> Option<&mut Session> {
        let id = self.by_participant.get(&participant)?;
        self.sessions.get_mut(id).filter(|s| s.is_open())
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    /// Removes a session and forgets both of its players.
    pub fn remove(&mut self, id: SessionId) -> Option<Session> {
        let session = self.sessions.remove(&id)?;
        for player in session.players() {
            self.by_participant.remove(&player.id);
        }
        Some(session)
    }

    pub fn contains_participant(&self, participant: ParticipantId) -> bool {
        self.by_participant.contains_key(&participant)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Weak};

    use super::*;
    use crate::channel::MemoryChannel;
    use crate::session::Participant;
    use crate::task_catalog::{Task, TestVector};

    fn session() -> Session {
        let player = || {
            let channel: Weak<MemoryChannel> = Weak::new();
            Participant::new(ParticipantId::next(), "p".to_string(), channel)
        };
        let task = Task::new("t", "d", "f", vec![TestVector::new([1], 1)]).unwrap();
        Session::new(player(), player(), Arc::new(task))
    }

    #[test]
    fn lookup_by_either_player() {
        let mut registry = SessionRegistry::new();
        let session = session();
        let [a, b] = [session.players()[0].id, session.players()[1].id];
        let id = registry.insert(session);

        assert_eq!(registry.lookup(a).map(Session::id), Some(id));
        assert_eq!(registry.lookup(b).map(Session::id), Some(id));
        assert!(registry.lookup(ParticipantId::next()).is_none());

        assert!(registry.remove(id).is_some());
        assert!(registry.lookup(a).is_none());
        assert!(registry.lookup(b).is_none());
        assert!(!registry.contains_participant(a));
        assert!(registry.is_empty());
        assert!(registry.remove(id).is_none());
    }

    #[test]
    fn closed_sessions_are_not_returned() {
        let mut registry = SessionRegistry::new();
        let session = session();
        let a = session.players()[0].id;
        let id = registry.insert(session);
        registry.get_mut(id).unwrap().abandon(a).unwrap();
        assert!(registry.lookup(a).is_none());
    }
}
