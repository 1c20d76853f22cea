//! Service for storing links to all the currently active sessions on
//! this proxy, keyed both by session id and by player uuid.
//!
//! The store holds weak links; the per-connection driver task is the
//! sole strong owner of a session, so dropping the connection drops the
//! session even if a stale entry lingers here until the next sweep.

use crate::session::{SessionLink, WeakSessionLink};
use crate::utils::types::SessionID;
use hashbrown::HashMap;
use parking_lot::Mutex;
use uuid::Uuid;

/// Store of live sessions.
///
/// Uses blocking mutexes as there is little to no overhead since all
/// operations are just map reads and writes which don't warrant the
/// need for the async variant.
#[derive(Default)]
pub struct Sessions {
    /// Every accepted connection, keyed by session id
    connections: Mutex<HashMap<SessionID, WeakSessionLink>>,
    /// Sessions that have announced a player uuid. At most one live
    /// session per uuid is kept here at any instant.
    players: Mutex<HashMap<Uuid, WeakSessionLink>>,
}

impl Sessions {
    /// Tracks a freshly accepted connection
    pub fn add_connection(&self, session: &SessionLink) {
        self.connections
            .lock()
            .insert(session.id, SessionLink::downgrade(session));
    }

    /// Removes a closed connection and, when the uuid entry still
    /// points at this session, its player registration
    pub fn remove_connection(&self, session_id: SessionID, uuid: Option<Uuid>) {
        self.connections.lock().remove(&session_id);

        if let Some(uuid) = uuid {
            let players = &mut *self.players.lock();
            let owned = players
                .get(&uuid)
                .and_then(WeakSessionLink::upgrade)
                .map_or(true, |current| current.id == session_id);
            if owned {
                players.remove(&uuid);
            }
        }
    }

    /// Non-forcing uuid registration used at Connect time for
    /// visibility. An existing live session under the uuid is left in
    /// place; the conflict is resolved at backend acceptance.
    pub fn try_register_player(&self, uuid: Uuid, session: &SessionLink) -> bool {
        let players = &mut *self.players.lock();
        if let Some(existing) = players.get(&uuid).and_then(WeakSessionLink::upgrade) {
            if existing.id != session.id {
                return false;
            }
        }
        players.insert(uuid, SessionLink::downgrade(session));
        true
    }

    /// Removes and returns a live session registered under `uuid` that
    /// is not the session identified by `session_id`. The caller must
    /// fully close the returned session before publishing its own
    /// registration through [`Self::register_player`].
    pub fn take_conflicting_player(
        &self,
        uuid: Uuid,
        session_id: SessionID,
    ) -> Option<SessionLink> {
        let players = &mut *self.players.lock();
        let existing = players.get(&uuid).and_then(WeakSessionLink::upgrade)?;
        if existing.id == session_id {
            return None;
        }
        players.remove(&uuid);
        Some(existing)
    }

    /// Forcing uuid registration used at backend acceptance
    pub fn register_player(&self, uuid: Uuid, session: &SessionLink) {
        self.players
            .lock()
            .insert(uuid, SessionLink::downgrade(session));
    }

    /// Looks up the session for a player uuid, dropping a dead entry
    pub fn lookup_player(&self, uuid: Uuid) -> Option<SessionLink> {
        let players = &mut *self.players.lock();
        let session = players.get(&uuid)?;
        match session.upgrade() {
            Some(value) => Some(value),
            // Session has stopped, remove it from the map
            None => {
                players.remove(&uuid);
                None
            }
        }
    }

    /// Looks up a session by the player display name (case-insensitive)
    pub fn lookup_player_by_name(&self, name: &str) -> Option<SessionLink> {
        self.live_players()
            .into_iter()
            .find(|session| match session.username() {
                Some(username) => username.eq_ignore_ascii_case(name),
                None => false,
            })
    }

    /// Snapshot of every live session with a registered player
    pub fn live_players(&self) -> Vec<SessionLink> {
        let players = &mut *self.players.lock();
        players.retain(|_, link| link.strong_count() > 0);
        players.values().filter_map(WeakSessionLink::upgrade).collect()
    }

    /// Number of live registered players
    pub fn player_count(&self) -> usize {
        self.live_players().len()
    }

    /// Number of accepted connections, live or not yet swept
    pub fn connection_count(&self) -> usize {
        let connections = &mut *self.connections.lock();
        connections.retain(|_, link| link.strong_count() > 0);
        connections.len()
    }

    /// Sessions currently attached to the named backend
    pub fn players_on_server(&self, server: &str) -> Vec<SessionLink> {
        self.live_players()
            .into_iter()
            .filter(|session| match session.server_name() {
                Some(name) => name.eq_ignore_ascii_case(server),
                None => false,
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::session::{Session, SessionState};
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn test_session(id: SessionID) -> SessionLink {
        Session::for_tests(
            id,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 40000 + id as u16),
        )
    }

    /// Only one live session per uuid is visible at any instant
    #[test]
    fn test_player_uniqueness() {
        let sessions = Sessions::default();
        let uuid = Uuid::new_v4();

        let first = test_session(1);
        let second = test_session(2);
        sessions.add_connection(&first);
        sessions.add_connection(&second);

        assert!(sessions.try_register_player(uuid, &first));
        // Second arrival does not evict the live first session
        assert!(!sessions.try_register_player(uuid, &second));
        assert_eq!(sessions.lookup_player(uuid).unwrap().id, 1);

        // Forcing path: the conflict is taken out before the replacement
        let conflicting = sessions.take_conflicting_player(uuid, 2).unwrap();
        assert_eq!(conflicting.id, 1);
        sessions.register_player(uuid, &second);
        assert_eq!(sessions.lookup_player(uuid).unwrap().id, 2);
        assert_eq!(sessions.player_count(), 1);
    }

    /// A session that dropped is swept from lookups
    #[test]
    fn test_dead_sessions_swept() {
        let sessions = Sessions::default();
        let uuid = Uuid::new_v4();

        {
            let session = test_session(1);
            sessions.add_connection(&session);
            sessions.try_register_player(uuid, &session);
        }

        assert!(sessions.lookup_player(uuid).is_none());
        assert_eq!(sessions.player_count(), 0);
        assert_eq!(sessions.connection_count(), 0);
    }

    /// Removing a connection only clears the uuid entry it still owns
    #[test]
    fn test_remove_respects_owner() {
        let sessions = Sessions::default();
        let uuid = Uuid::new_v4();

        let first = test_session(1);
        let second = test_session(2);
        sessions.add_connection(&first);
        sessions.add_connection(&second);

        sessions.try_register_player(uuid, &first);
        let _ = sessions.take_conflicting_player(uuid, 2);
        sessions.register_player(uuid, &second);

        // The old session closing later must not clear the new entry
        sessions.remove_connection(1, Some(uuid));
        assert_eq!(sessions.lookup_player(uuid).unwrap().id, 2);

        sessions.remove_connection(2, Some(uuid));
        assert!(sessions.lookup_player(uuid).is_none());
    }

    /// Name lookups are case-insensitive over live sessions
    #[test]
    fn test_lookup_by_name() {
        let sessions = Sessions::default();
        let uuid = Uuid::new_v4();

        let session = test_session(1);
        sessions.add_connection(&session);
        session.set_player(uuid, "Steve".to_string());
        sessions.try_register_player(uuid, &session);
        session.set_state(SessionState::Connected);

        assert!(sessions.lookup_player_by_name("steve").is_some());
        assert!(sessions.lookup_player_by_name("Alex").is_none());
    }
}
