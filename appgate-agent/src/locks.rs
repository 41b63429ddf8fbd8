//! Lock enforcement for live connections.
//!
//! Locks originate in the control plane; the agent only asks whether any
//! target of a connection is currently locked and disconnects on a match.
//! The watcher is a collaborator trait so the control-plane client plugs in;
//! [`StaticLockWatcher`] covers local runs and tests.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::identity::Identity;

/// One lockable facet of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockTarget {
    /// Locks a user by name.
    User(String),
    /// Locks every holder of a role.
    Role(String),
    /// Locks one application session.
    Session(String),
}

impl fmt::Display for LockTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockTarget::User(user) => write!(f, "user {user:?}"),
            LockTarget::Role(role) => write!(f, "role {role:?}"),
            LockTarget::Session(session) => write!(f, "session {session:?}"),
        }
    }
}

/// The lock targets of an authenticated connection: the user, every held
/// role, and the application session.
pub fn lock_targets(identity: &Identity) -> Vec<LockTarget> {
    let mut targets = vec![LockTarget::User(identity.username.clone())];
    for role in &identity.groups {
        targets.push(LockTarget::Role(role.clone()));
    }
    if !identity.route_to_app.session_id.is_empty() {
        targets.push(LockTarget::Session(
            identity.route_to_app.session_id.clone(),
        ));
    }
    targets
}

/// Answers whether any of a connection's targets is locked.
pub trait LockWatcher: Send + Sync {
    /// The lock message when a target is in force, `None` otherwise.
    fn find_lock(&self, targets: &[LockTarget]) -> Option<String>;
}

/// An in-memory lock set.
#[derive(Debug, Default)]
pub struct StaticLockWatcher {
    locked: Mutex<HashSet<LockTarget>>,
}

impl StaticLockWatcher {
    /// An empty (nothing locked) watcher.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Put a lock in force.
    pub fn lock_target(&self, target: LockTarget) {
        self.locked.lock().unwrap().insert(target);
    }

    /// Lift a lock.
    pub fn unlock_target(&self, target: &LockTarget) {
        self.locked.lock().unwrap().remove(target);
    }
}

impl LockWatcher for StaticLockWatcher {
    fn find_lock(&self, targets: &[LockTarget]) -> Option<String> {
        let locked = self.locked.lock().unwrap();
        targets
            .iter()
            .find(|target| locked.contains(target))
            .map(|target| format!("lock targeting {target} is in force"))
    }
}
