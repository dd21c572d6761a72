//! User lifecycle: start, switch, stop, unlock.
//!
//! Users traverse BOOTING → RUNNING_LOCKED → RUNNING, and stop through the
//! two-phase broadcast protocol: STOPPING is broadcast first; its delivery
//! completion moves the user to SHUTDOWN and sends the shutdown broadcast,
//! whose completion runs the final teardown. A start arriving while the user
//! is still STOPPING quietly revives it; once SHUTDOWN was sent the user
//! must boot from scratch.
//!
//! At most `max_running_users` users run concurrently; the least recently
//! used eligible user is stopped when the bound is exceeded. The system user
//! and the current user are never eligible.

use crate::error::{Error, ErrorKind, Result};
use crate::external::{BroadcastRequest, UserStopCallback, UserSwitchObserver};
use crate::record::{UserRecord, UserState};
use crate::supervisor::state::{
    DeadlineKind, PendingBroadcast, PolicyEvent, SupervisorState,
};
use crate::tracing_compat::{debug, info, warn};
use crate::types::{ExtraValue, Intent, UserId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Broadcast actions emitted by the user controller.
pub mod actions {
    /// A user was started (first transition into a running state).
    pub const USER_STARTED: &str = "user.started";
    /// Ordered companion of [`USER_STARTED`], delivered to all users.
    pub const USER_STARTING: &str = "user.starting";
    /// First-boot initialization of a new user.
    pub const USER_INITIALIZE: &str = "user.initialize";
    /// The user booted as far as its locked state allows.
    pub const LOCKED_BOOT_COMPLETED: &str = "user.locked-boot-completed";
    /// The user's credential-encrypted storage unlocked.
    pub const USER_UNLOCKED: &str = "user.unlocked";
    /// A managed profile of the receiving user unlocked.
    pub const MANAGED_PROFILE_UNLOCKED: &str = "user.managed-profile-unlocked";
    /// The user fully booted.
    pub const BOOT_COMPLETED: &str = "user.boot-completed";
    /// The receiving user moved to the background.
    pub const USER_BACKGROUND: &str = "user.background";
    /// The receiving user moved to the foreground.
    pub const USER_FOREGROUND: &str = "user.foreground";
    /// The foreground user changed (sent once per switch, after the
    /// background/foreground pair).
    pub const USER_SWITCHED: &str = "user.switched";
    /// Phase one of the stop protocol.
    pub const USER_STOPPING: &str = "user.stopping";
    /// Phase two of the stop protocol.
    pub const USER_SHUTDOWN: &str = "user.shutdown";
    /// The user fully stopped and its processes were torn down.
    pub const USER_STOPPED: &str = "user.stopped";
}

/// Permission strings checked on user operations.
pub mod permissions {
    /// Required of receivers of the stopping broadcast.
    pub const INTERACT_ACROSS_USERS: &str = "interact-across-users";
    /// Required of callers of start/stop/switch/unlock.
    pub const INTERACT_ACROSS_USERS_FULL: &str = "interact-across-users-full";
    /// Required of receivers of the switched broadcast.
    pub const MANAGE_USERS: &str = "manage-users";
}

/// Intent extra carrying the subject user id.
pub const EXTRA_USER_HANDLE: &str = "user-handle";

/// An in-flight foreground switch.
#[derive(Debug)]
pub struct SwitchSession {
    /// Monotonic sequence number guarding stale continuations.
    pub seq: u64,
    /// The outgoing user.
    pub old_user: UserId,
    /// The incoming user.
    pub new_user: UserId,
    /// Observer cookies not yet acknowledged.
    pub outstanding: HashSet<u64>,
}

/// Mutable user-controller state, owned by the supervisor.
pub struct UserControllerState {
    /// The foreground user.
    pub current_user: UserId,
    /// Set while a switch is retargeting the foreground.
    pub target_user: Option<UserId>,
    /// Every started user.
    pub started: HashMap<UserId, UserRecord>,
    /// Started users, least recently used first.
    pub lru: Vec<UserId>,
    /// Registered switch observers.
    pub observers: Vec<(u64, Arc<dyn UserSwitchObserver>)>,
    next_observer: u64,
    /// The in-flight switch, if any.
    pub switch: Option<SwitchSession>,
    switch_seq: u64,
    next_cookie: u64,
}

impl UserControllerState {
    /// Creates controller state with the system user booting.
    #[must_use]
    pub fn new() -> Self {
        let mut started = HashMap::new();
        started.insert(UserId::SYSTEM, UserRecord::new(UserId::SYSTEM));
        Self {
            current_user: UserId::SYSTEM,
            target_user: None,
            started,
            lru: vec![UserId::SYSTEM],
            observers: Vec::new(),
            next_observer: 0,
            switch: None,
            switch_seq: 0,
            next_cookie: 0,
        }
    }

    /// Returns the number of users counted against the running bound.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.started.values().filter(|u| u.is_running()).count()
    }

    fn touch_lru(&mut self, user: UserId) {
        self.lru.retain(|&u| u != user);
        self.lru.push(user);
    }
}

impl Default for UserControllerState {
    fn default() -> Self {
        Self::new()
    }
}

fn user_intent(action: &str, user: UserId) -> Intent {
    Intent::for_action(action).with_extra(EXTRA_USER_HANDLE, ExtraValue::Int(i64::from(user.0)))
}

impl SupervisorState {
    fn broadcast_to_user(
        &mut self,
        action: &str,
        subject: UserId,
        target: Option<UserId>,
        permission: Option<&str>,
        registered_only: bool,
        completion: Option<PendingBroadcast>,
    ) {
        let completion = completion.map(|c| self.new_broadcast_id(c));
        let request = BroadcastRequest {
            completion,
            intent: user_intent(action, subject),
            user: target,
            required_permission: permission.map(ToString::to_string),
            registered_only,
            foreground: true,
        };
        self.dispatcher.broadcast_intent(&request);
    }

    /// Registers a switch observer; returns its registration id.
    pub(crate) fn register_user_switch_observer(
        &mut self,
        observer: Arc<dyn UserSwitchObserver>,
    ) -> u64 {
        let id = self.users.next_observer;
        self.users.next_observer += 1;
        self.users.observers.push((id, observer));
        id
    }

    /// Removes a switch observer.
    pub(crate) fn unregister_user_switch_observer(&mut self, id: u64) {
        self.users.observers.retain(|(oid, _)| *oid != id);
    }

    /// Starts a user, foreground (switch) or background.
    ///
    /// Starting the already-current user is a successful no-op.
    pub(crate) fn start_user(&mut self, user_id: UserId, foreground: bool) -> Result<bool> {
        let old_user = self.users.current_user;
        if foreground && old_user == user_id {
            return Ok(true);
        }

        let Some(user_info) = self.user_registry.user_info(user_id) else {
            warn!(user = %user_id, "no such user");
            return Ok(false);
        };
        if foreground && user_info.managed_profile {
            warn!(user = %user_id, "cannot switch to a profile user");
            return Ok(false);
        }

        if foreground {
            self.window.start_freezing_screen();
        }

        let mut need_start = false;
        if !self.users.started.contains_key(&user_id) {
            self.users.started.insert(user_id, UserRecord::new(user_id));
            need_start = true;
        }
        self.users.touch_lru(user_id);

        if foreground {
            self.users.current_user = user_id;
            self.users.target_user = None;
            let profiles = self.user_registry.profiles_of(user_id);
            self.window.set_current_user(user_id, &profiles);
            self.window.lock_now();
        } else {
            self.users.touch_lru(old_user);
        }

        {
            let record = self
                .users
                .started
                .get_mut(&user_id)
                .expect("record inserted above");
            match record.state {
                UserState::Stopping => {
                    // The shutdown broadcast never went out; quietly revive.
                    let revived = record.last_state;
                    record.state = revived;
                    need_start = true;
                }
                UserState::Shutdown => {
                    record.state = UserState::Booting;
                    record.last_state = UserState::Booting;
                    need_start = true;
                }
                _ => {}
            }
        }

        if need_start {
            info!(user = %user_id, foreground, "user started");
            self.broadcast_to_user(actions::USER_STARTED, user_id, Some(user_id), None, true, None);
            self.broadcast_to_user(
                actions::USER_STARTING,
                user_id,
                None,
                Some(permissions::INTERACT_ACROSS_USERS),
                true,
                None,
            );
        }

        if !user_info.initialized && !user_id.is_system() {
            self.users
                .started
                .get_mut(&user_id)
                .expect("record inserted above")
                .initializing = true;
            self.broadcast_to_user(
                actions::USER_INITIALIZE,
                user_id,
                Some(user_id),
                None,
                false,
                Some(PendingBroadcast::UserInitialize {
                    user: user_id,
                    foreground,
                    old_user,
                }),
            );
        } else if user_id.is_system() && !user_info.initialized {
            self.user_registry.make_initialized(user_id);
        }

        if foreground {
            self.dispatch_user_switch(old_user, user_id);
        } else {
            self.finish_user_boot(user_id)?;
        }
        Ok(true)
    }

    /// BOOTING → RUNNING_LOCKED, plus the locked-boot broadcast and an
    /// automatic unlock attempt with an empty token.
    pub(crate) fn finish_user_boot(&mut self, user_id: UserId) -> Result<()> {
        let booting = self
            .users
            .started
            .get(&user_id)
            .is_some_and(|u| u.state == UserState::Booting);
        if booting {
            self.users
                .started
                .get_mut(&user_id)
                .expect("checked above")
                .set_state(UserState::RunningLocked);
            self.broadcast_to_user(
                actions::LOCKED_BOOT_COMPLETED,
                user_id,
                Some(user_id),
                None,
                false,
                None,
            );
        }
        let _ = self.unlock_user_internal(user_id, None, None)?;
        Ok(())
    }

    /// Unlocks a user's storage key and steps it to RUNNING.
    pub(crate) fn unlock_user_internal(
        &mut self,
        user_id: UserId,
        token: Option<&[u8]>,
        secret: Option<&[u8]>,
    ) -> Result<bool> {
        let Some(record) = self.users.started.get(&user_id) else {
            return Err(Error::new(ErrorKind::UserNotRunning)
                .with_context(format!("{user_id} is not started")));
        };
        if record.state == UserState::Running {
            return Ok(true);
        }

        if !self.storage.is_user_key_unlocked(user_id) {
            let serial = self
                .user_registry
                .user_info(user_id)
                .map_or(0, |info| info.serial);
            if let Err(err) = self.storage.unlock_user_key(user_id, serial, token, secret) {
                debug!(user = %user_id, error = %err, "user key unlock failed");
                return Ok(false);
            }
        }
        self.finish_user_unlock(user_id)?;
        Ok(true)
    }

    fn finish_user_unlock(&mut self, user_id: UserId) -> Result<()> {
        let locked = self
            .users
            .started
            .get(&user_id)
            .is_some_and(|u| u.state == UserState::RunningLocked);
        if !locked {
            return Ok(());
        }
        self.users
            .started
            .get_mut(&user_id)
            .expect("checked above")
            .set_state(UserState::Running);

        // App storage gets prepared before anyone hears about the unlock.
        self.user_registry.prepare_user_storage(user_id);
        self.broadcast_to_user(actions::USER_UNLOCKED, user_id, Some(user_id), None, true, None);

        let info = self.user_registry.user_info(user_id);
        if info.is_some_and(|i| i.managed_profile) {
            if let Some(parent) = self.user_registry.profile_parent(user_id) {
                self.broadcast_to_user(
                    actions::MANAGED_PROFILE_UNLOCKED,
                    user_id,
                    Some(parent),
                    None,
                    true,
                    None,
                );
            }
        }
        self.broadcast_to_user(actions::BOOT_COMPLETED, user_id, Some(user_id), None, false, None);
        Ok(())
    }

    /// Stops a user and its profile-group relatives.
    ///
    /// Without `force`, a relative that is the system user or the current
    /// user aborts the whole operation; with `force` the requested user is
    /// stopped anyway (relatives are left running).
    pub(crate) fn stop_user(
        &mut self,
        user_id: UserId,
        force: bool,
        callback: Option<Arc<dyn UserStopCallback>>,
    ) -> Result<()> {
        if user_id.is_system() {
            return Err(Error::new(ErrorKind::UserOpInvalid).with_context("cannot stop the system user"));
        }
        if self.users.current_user == user_id || self.users.target_user == Some(user_id) {
            return Err(Error::new(ErrorKind::UserOpInvalid).with_context("cannot stop the current user"));
        }

        let related = self.users_to_stop(user_id);
        let blocked = related
            .iter()
            .any(|&u| u.is_system() || self.users.current_user == u);
        if blocked {
            if force {
                info!(user = %user_id, "force stop; related users stay running");
                self.stop_single_user(user_id, callback);
                return Ok(());
            }
            return Err(Error::new(ErrorKind::UserOpInvalid)
                .with_context("related users cannot be stopped"));
        }
        for related_user in related {
            let cb = if related_user == user_id {
                callback.clone()
            } else {
                None
            };
            self.stop_single_user(related_user, cb);
        }
        Ok(())
    }

    /// Started users sharing the target's profile group, target included.
    fn users_to_stop(&self, user_id: UserId) -> Vec<UserId> {
        let mut result = vec![user_id];
        let Some(group) = self
            .user_registry
            .user_info(user_id)
            .and_then(|i| i.profile_group)
        else {
            return result;
        };
        for &started in self.users.started.keys() {
            if started == user_id {
                continue;
            }
            let same_group = self
                .user_registry
                .user_info(started)
                .and_then(|i| i.profile_group)
                == Some(group);
            if same_group {
                result.push(started);
            }
        }
        result
    }

    fn stop_single_user(&mut self, user_id: UserId, callback: Option<Arc<dyn UserStopCallback>>) {
        let Some(record) = self.users.started.get_mut(&user_id) else {
            // Not started; just report completion.
            if let Some(callback) = callback {
                callback.user_stopped(user_id);
            }
            return;
        };
        if let Some(callback) = callback {
            record.stop_callbacks.push(callback);
        }
        if matches!(record.state, UserState::Stopping | UserState::Shutdown) {
            return;
        }
        record.set_state(UserState::Stopping);
        info!(user = %user_id, "user stopping; sending phase-one broadcast");
        self.broadcast_to_user(
            actions::USER_STOPPING,
            user_id,
            None,
            Some(permissions::INTERACT_ACROSS_USERS),
            true,
            Some(PendingBroadcast::UserStopping(user_id)),
        );
    }

    /// Phase-one completion: STOPPING → SHUTDOWN unless a start revived the
    /// user meanwhile, then phase two.
    pub(crate) fn finish_user_stopping(&mut self, user_id: UserId) {
        let Some(record) = self.users.started.get_mut(&user_id) else {
            return;
        };
        if record.state != UserState::Stopping {
            // Revived while the broadcast was in flight; abort the stop.
            debug!(user = %user_id, "stop aborted by a concurrent start");
            return;
        }
        record.set_state(UserState::Shutdown);
        self.broadcast_to_user(
            actions::USER_SHUTDOWN,
            user_id,
            Some(user_id),
            None,
            false,
            Some(PendingBroadcast::UserShutdown(user_id)),
        );
    }

    /// Phase-two completion: the user can no longer run. Removes records,
    /// finishes its activities, tears down its processes, and fires
    /// stop-callbacks. Ephemeral users are deleted here.
    pub(crate) fn finish_user_stop(&mut self, user_id: UserId) -> Result<()> {
        let state = self.users.started.get(&user_id).map(|r| r.state);
        let (stopped, callbacks) = match state {
            Some(UserState::Shutdown) => {
                let mut record = self.users.started.remove(&user_id).expect("state read above");
                self.users.lru.retain(|&u| u != user_id);
                (true, std::mem::take(&mut record.stop_callbacks))
            }
            Some(_) => {
                let callbacks = self
                    .users
                    .started
                    .get_mut(&user_id)
                    .map(|r| std::mem::take(&mut r.stop_callbacks))
                    .unwrap_or_default();
                (false, callbacks)
            }
            None => (false, Vec::new()),
        };

        if stopped {
            info!(user = %user_id, "user fully stopped");
            self.finish_user_activities(user_id)?;
            self.force_stop_user_processes(user_id, "finish user")?;
            self.broadcast_to_user(actions::USER_STOPPED, user_id, None, None, true, None);
        }

        for callback in callbacks {
            if stopped {
                callback.user_stopped(user_id);
            } else {
                callback.user_stop_aborted(user_id);
            }
        }

        if stopped {
            let ephemeral = self
                .user_registry
                .user_info(user_id)
                .is_some_and(|i| i.ephemeral);
            if ephemeral {
                self.user_registry.remove_user(user_id);
            }
        }
        Ok(())
    }

    /// Kills every process belonging to `user`.
    pub(crate) fn force_stop_user_processes(&mut self, user: UserId, reason: &str) -> Result<()> {
        let doomed: Vec<_> = self
            .processes
            .iter()
            .filter(|(_, p)| p.user == user && !p.persistent)
            .map(|(idx, _)| crate::types::ProcessId::from_arena(idx))
            .collect();
        for process_id in doomed {
            if self.processes.get(process_id.arena_index()).is_some() {
                self.kill_process(process_id, reason)?;
            }
        }
        Ok(())
    }

    // === Switch protocol ===

    fn dispatch_user_switch(&mut self, old_user: UserId, new_user: UserId) {
        self.users.switch_seq += 1;
        let seq = self.users.switch_seq;
        if let Some(record) = self.users.started.get_mut(&new_user) {
            record.switching = true;
        }

        let observers: Vec<_> = self
            .users
            .observers
            .iter()
            .map(|(_, o)| Arc::clone(o))
            .collect();
        if observers.is_empty() {
            self.users.switch = Some(SwitchSession {
                seq,
                old_user,
                new_user,
                outstanding: HashSet::new(),
            });
            self.continue_user_switch(seq);
            return;
        }

        let mut outstanding = HashSet::new();
        let mut cookies = Vec::new();
        for _ in &observers {
            let cookie = self.users.next_cookie;
            self.users.next_cookie += 1;
            outstanding.insert(cookie);
            cookies.push(cookie);
        }
        self.users.switch = Some(SwitchSession {
            seq,
            old_user,
            new_user,
            outstanding,
        });
        self.arm_deadline(DeadlineKind::UserSwitch(seq), self.config.user_switch_timeout);
        for (observer, cookie) in observers.iter().zip(cookies) {
            observer.on_user_switching(new_user, cookie);
        }
    }

    /// Observer acknowledgement; the last one continues the switch.
    pub(crate) fn acknowledge_user_switch(&mut self, cookie: u64) {
        let seq = match &mut self.users.switch {
            Some(session) => {
                if !session.outstanding.remove(&cookie) {
                    return;
                }
                if !session.outstanding.is_empty() {
                    return;
                }
                session.seq
            }
            None => return,
        };
        self.continue_user_switch(seq);
    }

    /// Observer deadline expiry: the switch continues regardless.
    pub(crate) fn user_switch_timed_out(&mut self, seq: u64) {
        let stalled = self
            .users
            .switch
            .as_ref()
            .is_some_and(|s| s.seq == seq && !s.outstanding.is_empty());
        if stalled {
            warn!(seq, "user switch observers timed out; continuing");
            if let Some(session) = &mut self.users.switch {
                session.outstanding.clear();
            }
            self.continue_user_switch(seq);
        }
    }

    /// Brings the new user's stacks forward, emits the ordered switch
    /// broadcasts, and completes the switch.
    fn continue_user_switch(&mut self, seq: u64) {
        let Some(session) = self.users.switch.take() else {
            return;
        };
        if session.seq != seq {
            self.users.switch = Some(session);
            return;
        }
        self.cancel_deadline(DeadlineKind::UserSwitch(seq));
        let SwitchSession {
            old_user, new_user, ..
        } = session;

        // New user's home comes to the front on every display.
        let homes: Vec<_> = self.displays.values().filter_map(|d| d.home_stack).collect();
        for home in homes {
            let _ = self.move_stack_to_front(home);
        }
        let _ = self.resume_top_activities();

        self.send_user_switch_broadcasts(old_user, new_user);
        let _ = self.finish_user_boot(new_user);

        if let Some(record) = self.users.started.get_mut(&new_user) {
            record.switching = false;
        }
        self.complete_switch_unfreeze(new_user);

        self.start_current_user_profiles();
        self.stop_guest_or_ephemeral_in_background();
        self.stop_running_users();
    }

    /// Ordered switch broadcasts: USER_BACKGROUND for every profile of the
    /// outgoing user, USER_FOREGROUND for every profile of the incoming
    /// user, then a single USER_SWITCHED.
    fn send_user_switch_broadcasts(&mut self, old_user: UserId, new_user: UserId) {
        for profile in self.user_registry.profiles_of(old_user) {
            self.broadcast_to_user(
                actions::USER_BACKGROUND,
                profile,
                Some(profile),
                None,
                true,
                None,
            );
        }
        for profile in self.user_registry.profiles_of(new_user) {
            self.broadcast_to_user(
                actions::USER_FOREGROUND,
                profile,
                Some(profile),
                None,
                true,
                None,
            );
        }
        self.broadcast_to_user(
            actions::USER_SWITCHED,
            new_user,
            None,
            Some(permissions::MANAGE_USERS),
            true,
            None,
        );
    }

    /// Unfreezes the screen and reports completion once neither a switch
    /// nor first-boot initialization is pending.
    pub(crate) fn complete_switch_unfreeze(&mut self, user_id: UserId) {
        let busy = self
            .users
            .started
            .get(&user_id)
            .is_some_and(|u| u.switching || u.initializing);
        if busy {
            return;
        }
        self.window.stop_freezing_screen();
        let observers: Vec<_> = self
            .users
            .observers
            .iter()
            .map(|(_, o)| Arc::clone(o))
            .collect();
        for observer in observers {
            observer.on_user_switch_complete(user_id);
        }
        self.push_event(PolicyEvent::UserSwitchComplete(user_id));
    }

    /// First-boot initialize broadcast finished delivery.
    pub(crate) fn finish_user_initialize(
        &mut self,
        user_id: UserId,
        _foreground: bool,
        _old_user: UserId,
    ) {
        self.user_registry.make_initialized(user_id);
        if let Some(record) = self.users.started.get_mut(&user_id) {
            record.initializing = false;
        }
        self.complete_switch_unfreeze(user_id);
    }

    /// Starts the (initialized) profiles of the current user, bounded by
    /// the running-user limit.
    fn start_current_user_profiles(&mut self) {
        let current = self.users.current_user;
        let profiles: Vec<_> = self
            .user_registry
            .profiles_of(current)
            .into_iter()
            .filter(|&p| p != current)
            .filter(|&p| {
                self.user_registry
                    .user_info(p)
                    .is_some_and(|i| i.initialized)
            })
            .collect();
        let budget = self.config.max_running_users.saturating_sub(1);
        if profiles.len() > budget {
            warn!(count = profiles.len(), budget, "more profiles than the running-user bound");
        }
        for profile in profiles.into_iter().take(budget) {
            let _ = self.start_user(profile, false);
        }
    }

    /// Force-stops a backgrounded guest or ephemeral user, oldest first.
    fn stop_guest_or_ephemeral_in_background(&mut self) {
        let current = self.users.current_user;
        let candidates: Vec<_> = self.users.lru.clone();
        for user_id in candidates {
            if user_id.is_system() || user_id == current {
                continue;
            }
            let state = self.users.started.get(&user_id).map(|u| u.state);
            if matches!(state, Some(UserState::Stopping | UserState::Shutdown) | None) {
                continue;
            }
            let disposable = self
                .user_registry
                .user_info(user_id)
                .is_some_and(|i| i.guest || i.ephemeral);
            if disposable {
                let _ = self.stop_user(user_id, true, None);
                break;
            }
        }
    }

    /// Evicts least-recently-used users beyond the running bound. The
    /// system user and the current user are never eligible.
    pub(crate) fn stop_running_users(&mut self) {
        let max = self.config.max_running_users;
        let mut num = self.users.lru.len();
        let mut i = 0;
        while num > max && i < self.users.lru.len() {
            let candidate = self.users.lru[i];
            let Some(record) = self.users.started.get(&candidate) else {
                self.users.lru.remove(i);
                num -= 1;
                continue;
            };
            if matches!(record.state, UserState::Stopping | UserState::Shutdown) {
                num -= 1;
                i += 1;
                continue;
            }
            if candidate.is_system() || candidate == self.users.current_user {
                i += 1;
                continue;
            }
            debug!(user = %candidate, "evicting LRU user beyond the running bound");
            if self.stop_user(candidate, false, None).is_err() {
                // A refused stop (related-user rule) no longer counts as an
                // excess user to resolve.
                num -= 1;
            }
            num -= 1;
            i += 1;
        }
    }
}
