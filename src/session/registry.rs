// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
};

use crate::{
    bus::{Bus, Message},
    session::Session,
};

/// Mapping from session_id to session state, strictly owned by the session
/// layer. `HashMap`, not `DashMap`: the CORE has no thread boundary to
/// protect against (`spec.md` §5).
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RefCell<HashMap<u16, Session>>,
    /// Creation order, used to give `round_robin` a stable rotation.
    order: RefCell<Vec<u16>>,
    cursor: Cell<usize>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, session: Session) {
        let id = session.session_id;
        self.order.borrow_mut().push(id);
        self.sessions.borrow_mut().insert(id, session);
    }

    pub fn contains(&self, session_id: u16) -> bool {
        self.sessions.borrow().contains_key(&session_id)
    }

    /// Runs `f` against the session if present, returning its result.
    pub fn with_session<R>(&self, session_id: u16, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        self.sessions.borrow_mut().get_mut(&session_id).map(f)
    }

    /// Removes the session and publishes SESSION_CLOSED. Idempotent: closing
    /// an already-absent session is a no-op.
    pub fn close(&self, session_id: u16, bus: &Bus) {
        let removed = self.sessions.borrow_mut().remove(&session_id).is_some();
        if removed {
            self.order.borrow_mut().retain(|&id| id != session_id);
            bus.post(&Message::SessionClosed { session_id });
        }
    }

    /// Session ids in round-robin order starting just after whichever id
    /// was first on the previous call, so that repeated calls rotate
    /// fairly across sessions. Ids of sessions closed since the last call
    /// are simply absent.
    pub fn round_robin_ids(&self) -> Vec<u16> {
        let order = self.order.borrow();
        if order.is_empty() {
            return Vec::new();
        }
        let start = self.cursor.get() % order.len();
        let rotated: Vec<u16> = order[start..]
            .iter()
            .chain(order[..start].iter())
            .copied()
            .collect();
        self.cursor.set((start + 1) % order.len());
        rotated
    }

    pub fn for_each(&self, mut f: impl FnMut(&Session)) {
        for session in self.sessions.borrow().values() {
            f(session);
        }
    }

    /// Drops every session without posting SESSION_CLOSED. Used on
    /// SHUTDOWN, where `spec.md` §5 forbids posting further messages.
    pub fn clear_silently(&self) {
        self.sessions.borrow_mut().clear();
        self.order.borrow_mut().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionState;

    #[test]
    fn create_lookup_close_round_trip() {
        let bus = Bus::new();
        let reg = SessionRegistry::new();
        reg.create(Session::new(1, 0x1234, None));

        assert!(reg.contains(1));
        reg.with_session(1, |s| s.state = SessionState::Established);
        assert_eq!(
            reg.with_session(1, |s| s.state),
            Some(SessionState::Established)
        );

        reg.close(1, &bus);
        assert!(!reg.contains(1));
    }

    #[test]
    fn round_robin_rotates_and_skips_closed() {
        let reg = SessionRegistry::new();
        reg.create(Session::new(1, 0, None));
        reg.create(Session::new(2, 0, None));
        reg.create(Session::new(3, 0, None));

        assert_eq!(reg.round_robin_ids(), vec![1, 2, 3]);
        assert_eq!(reg.round_robin_ids(), vec![2, 3, 1]);

        let bus = Bus::new();
        reg.close(2, &bus);
        assert_eq!(reg.round_robin_ids(), vec![3, 1]);
    }
}
