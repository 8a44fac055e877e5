//! The set of live sessions, counted by stream load.

use std::sync::RwLock;

use tunnel::Session;

use crate::Error;

#[derive(Default)]
pub struct Pool {
    sessions: RwLock<Vec<Session>>,
}

impl Pool {
    pub fn new() -> Pool {
        Pool::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.sessions.read().unwrap().clone()
    }

    pub fn add(&self, session: Session) {
        self.sessions.write().unwrap().push(session);
    }

    pub fn remove(&self, session: &Session) -> Result<(), Error> {
        let mut sessions = self.sessions.write().unwrap();
        let before = sessions.len();
        sessions.retain(|other| !other.same(session));
        if sessions.len() == before {
            return Err(Error::SessionNotFound);
        }
        Ok(())
    }

    /// The session carrying the fewest streams right now.
    pub fn least_loaded(&self) -> Option<(Session, usize)> {
        let sessions = self.sessions.read().unwrap();
        sessions
            .iter()
            .map(|session| (session.clone(), session.len()))
            .min_by_key(|(_, load)| *load)
    }

    /// Close every session and forget them all.
    pub fn cut_all(&self) {
        let sessions: Vec<Session> = {
            let mut guard = self.sessions.write().unwrap();
            guard.drain(..).collect()
        };
        tracing::warn!(sessions = sessions.len(), "cutting all sessions");
        for session in sessions {
            session.close();
        }
    }
}
