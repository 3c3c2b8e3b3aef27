//! Connection id and user id lookup for live sessions.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use parley_core::ids::{ConnectionId, UserId};

use crate::session::Session;

/// Outcome of [`Registry::bind_user`].
#[derive(Debug)]
pub enum Binding {
    /// The session now holds the user; carries the session it displaced.
    Bound { evicted: Option<Arc<Session>> },
    /// The session was closing or closed and was left unbound.
    Refused,
}

impl Binding {
    pub fn evicted(&self) -> Option<&Arc<Session>> {
        match self {
            Self::Bound { evicted } => evicted.as_ref(),
            Self::Refused => None,
        }
    }

    pub fn is_refused(&self) -> bool {
        matches!(self, Self::Refused)
    }
}

#[derive(Default)]
struct Maps {
    connections: HashMap<ConnectionId, Arc<Session>>,
    users: HashMap<UserId, Arc<Session>>,
}

/// Every registered session, plus the one session bound to each user.
///
/// One lock guards both maps and is never held across I/O or a session close.
#[derive(Default)]
pub struct Registry {
    maps: RwLock<Maps>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session: Arc<Session>) -> ConnectionId {
        let id = session.id().clone();
        let _ = self.maps.write().connections.insert(id.clone(), session);
        debug!(connection_id = %id, "registered");
        id
    }

    /// Remove a session. Its user binding goes too, unless a newer session
    /// already took it over.
    pub fn unregister(&self, id: &ConnectionId) -> Option<Arc<Session>> {
        let mut maps = self.maps.write();
        let session = maps.connections.remove(id)?;
        if let Some(user) = session.user() {
            if maps
                .users
                .get(&user)
                .is_some_and(|bound| Arc::ptr_eq(bound, &session))
            {
                let _ = maps.users.remove(&user);
            }
        }
        drop(maps);
        debug!(connection_id = %id, "unregistered");
        Some(session)
    }

    /// Bind `user` to `session`, evicting whichever session held the user
    /// before. The evicted session leaves OPEN before the lock is released;
    /// its release runs on a separate task.
    ///
    /// A session that is no longer OPEN is refused, so a login still queued
    /// on an evicted connection cannot take the user back.
    pub fn bind_user(&self, user: UserId, session: &Arc<Session>) -> Binding {
        let evicted = {
            let mut maps = self.maps.write();
            if !session.is_open() {
                drop(maps);
                debug!(connection_id = %session.id(), user_id = %user, "bind refused, session not open");
                return Binding::Refused;
            }

            if let Some(old_user) = session.user().filter(|u| u != &user) {
                if maps
                    .users
                    .get(&old_user)
                    .is_some_and(|bound| Arc::ptr_eq(bound, session))
                {
                    let _ = maps.users.remove(&old_user);
                }
            }
            session.set_user(user.clone());

            let evicted = maps
                .users
                .insert(user.clone(), Arc::clone(session))
                .filter(|old| !Arc::ptr_eq(old, session));
            if let Some(old) = &evicted {
                old.begin_close();
            }
            evicted
        };

        if let Some(old) = &evicted {
            info!(
                user_id = %user,
                evicted = %old.id(),
                connection_id = %session.id(),
                "user logged in elsewhere, evicting previous connection"
            );
            schedule_close(Arc::clone(old));
        }
        Binding::Bound { evicted }
    }

    pub fn lookup(&self, id: &ConnectionId) -> Option<Arc<Session>> {
        self.maps.read().connections.get(id).cloned()
    }

    pub fn lookup_by_user(&self, user: &UserId) -> Option<Arc<Session>> {
        self.maps.read().users.get(user).cloned()
    }

    pub fn count(&self) -> usize {
        self.maps.read().connections.len()
    }

    pub fn online_users(&self) -> usize {
        self.maps.read().users.len()
    }

    /// Call `f` on a snapshot of every registered session, outside the lock.
    pub fn for_each(&self, mut f: impl FnMut(&Arc<Session>)) {
        let snapshot: Vec<Arc<Session>> = self.maps.read().connections.values().cloned().collect();
        for session in &snapshot {
            f(session);
        }
    }
}

fn schedule_close(session: Arc<Session>) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            let _ = handle.spawn(async move {
                session.close();
            });
        }
        Err(_) => {
            session.close();
        }
    }
}
