//! User record: the lifecycle state of a started logical user.

use crate::external::UserStopCallback;
use crate::tracing_compat::debug;
use crate::types::UserId;
use std::sync::Arc;

/// Lifecycle state of a started user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UserState {
    /// Started; core services are coming up.
    Booting,
    /// Booted but credential-encrypted storage is still locked.
    RunningLocked,
    /// Fully running with storage unlocked.
    Running,
    /// The user-stopping broadcast is in flight; a new start can still
    /// revive the user.
    Stopping,
    /// The shutdown broadcast has been sent; the user must fully stop before
    /// it can run again.
    Shutdown,
}

impl UserState {
    /// Returns true for the states counted against the running-user bound.
    #[must_use]
    pub const fn counts_as_running(self) -> bool {
        matches!(self, Self::Booting | Self::RunningLocked | Self::Running)
    }
}

/// A started user and its transient flags.
pub struct UserRecord {
    /// The user this record tracks.
    pub id: UserId,
    /// Current lifecycle state.
    pub state: UserState,
    /// State to revert to when a start interrupts `Stopping`.
    pub last_state: UserState,
    /// An initialize broadcast is outstanding.
    pub initializing: bool,
    /// A foreground switch toward this user is in progress.
    pub switching: bool,
    /// Callbacks to fire when the user finishes stopping.
    pub stop_callbacks: Vec<Arc<dyn UserStopCallback>>,
}

impl std::fmt::Debug for UserRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserRecord")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("initializing", &self.initializing)
            .field("switching", &self.switching)
            .field("stop_callbacks", &self.stop_callbacks.len())
            .finish()
    }
}

impl UserRecord {
    /// Creates a freshly started user in `Booting`.
    #[must_use]
    pub fn new(id: UserId) -> Self {
        Self {
            id,
            state: UserState::Booting,
            last_state: UserState::Booting,
            initializing: false,
            switching: false,
            stop_callbacks: Vec::new(),
        }
    }

    /// Moves the record to `next`, remembering the prior state so a start
    /// arriving during `Stopping` can revert.
    pub fn set_state(&mut self, next: UserState) {
        debug!(user = %self.id, from = ?self.state, to = ?next, "user state");
        self.last_state = self.state;
        self.state = next;
    }

    /// Returns true while the user counts against the running bound.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.state.counts_as_running()
    }
}
