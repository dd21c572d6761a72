//! The supervisor facade: the single lock, the condition variable, and
//! every public entry point.
//!
//! All mutable state sits behind one mutex; operations that span subsystems
//! take it once at the entry point and hold it across the whole transition.
//! The condition variable implements the three permitted in-lock waits:
//! blocking a launch caller until its activity is resumed or visible,
//! settling the shutdown protocol, and (through deadlines) the user-switch
//! observer fan-out. Every wait is bounded.

mod inspect;
pub(crate) mod start;
pub mod state;

pub use inspect::{
    ActivitySnapshot, DisplaySnapshot, ProcessSnapshot, Snapshot, StackSnapshot, TaskSnapshot,
    UserSnapshot,
};
pub use start::{
    StartResult, ACTION_HEAVY_WEIGHT_SWITCHER, EXTRA_CURRENT_APP, EXTRA_HAS_RESULT,
    EXTRA_NEW_APP, EXTRA_PENDING_INTENT,
};
pub use state::{PolicyEvent, WaitKind, WaitOutcome};

use crate::config::SupervisorConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::external::{
    ApplicationThread, BroadcastDispatcher, BroadcastId, CrashReportReceiver, LmkSink,
    PackageResolver, ProcessLauncher, StorageService, SysfsLmkSink, UserRegistry,
    UserStopCallback, UserSwitchObserver, WindowSession,
};
use crate::tracing_compat::{debug, warn};
use crate::types::{
    ActivityId, ActivityOptions, ApplicationInfo, ClockSource, ComponentName, Intent,
    SystemClock, UserId,
};
use crate::user::permissions;
use parking_lot::{Condvar, Mutex};
use start::{ResultTo, StartOutcome};
use state::{PendingBroadcast, SupervisorState};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Identity and grants of the calling context.
#[derive(Debug, Clone)]
pub struct Caller {
    /// Calling pid.
    pub pid: i32,
    /// Calling uid.
    pub uid: i32,
    permissions: BTreeSet<String>,
}

impl Caller {
    /// Root and the core system uid hold every permission implicitly.
    const SYSTEM_UID: i32 = 1000;

    /// Creates an unprivileged caller.
    #[must_use]
    pub fn new(pid: i32, uid: i32) -> Self {
        Self {
            pid,
            uid,
            permissions: BTreeSet::new(),
        }
    }

    /// Creates the system caller.
    #[must_use]
    pub fn system() -> Self {
        Self::new(0, Self::SYSTEM_UID)
    }

    /// Grants a permission.
    #[must_use]
    pub fn grant(mut self, permission: impl Into<String>) -> Self {
        self.permissions.insert(permission.into());
        self
    }

    /// Returns true if the caller holds `permission`.
    #[must_use]
    pub fn has_permission(&self, permission: &str) -> bool {
        self.uid == 0 || self.uid == Self::SYSTEM_UID || self.permissions.contains(permission)
    }

    fn require(&self, permission: &str) -> Result<()> {
        if self.has_permission(permission) {
            Ok(())
        } else {
            Err(Error::new(ErrorKind::PermissionDenied).with_context(format!(
                "pid={} uid={} requires {permission}",
                self.pid, self.uid
            )))
        }
    }
}

/// Outcome of a blocking launch call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitResult {
    /// How the launch concluded.
    pub result: StartResult,
    /// Component that satisfied the wait; `None` on timeout.
    pub who: Option<ComponentName>,
    /// Time from this activity's launch to satisfaction.
    pub this_time: Duration,
    /// Time from the first launch of the sequence to satisfaction.
    pub total_time: Duration,
    /// The wait hit its deadline before the activity came up.
    pub timeout: bool,
}

/// Builder wiring the supervisor to its collaborators.
pub struct SupervisorBuilder {
    config: SupervisorConfig,
    clock: Arc<dyn ClockSource>,
    resolver: Option<Arc<dyn PackageResolver>>,
    window: Option<Arc<dyn WindowSession>>,
    launcher: Option<Arc<dyn ProcessLauncher>>,
    storage: Option<Arc<dyn StorageService>>,
    dispatcher: Option<Arc<dyn BroadcastDispatcher>>,
    user_registry: Option<Arc<dyn UserRegistry>>,
    lmk: Arc<dyn LmkSink>,
    crash_receiver: Option<Arc<dyn CrashReportReceiver>>,
}

impl SupervisorBuilder {
    /// Creates a builder with default config, the system clock, and the
    /// sysfs low-memory-killer sink.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: SupervisorConfig::default(),
            clock: Arc::new(SystemClock),
            resolver: None,
            window: None,
            launcher: None,
            storage: None,
            dispatcher: None,
            user_registry: None,
            lmk: Arc::new(SysfsLmkSink::default()),
            crash_receiver: None,
        }
    }

    /// Sets the configuration.
    #[must_use]
    pub fn config(mut self, config: SupervisorConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the time source.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn ClockSource>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the package resolver.
    #[must_use]
    pub fn resolver(mut self, resolver: Arc<dyn PackageResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Sets the window session.
    #[must_use]
    pub fn window(mut self, window: Arc<dyn WindowSession>) -> Self {
        self.window = Some(window);
        self
    }

    /// Sets the process launcher.
    #[must_use]
    pub fn launcher(mut self, launcher: Arc<dyn ProcessLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Sets the storage service.
    #[must_use]
    pub fn storage(mut self, storage: Arc<dyn StorageService>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Sets the broadcast dispatcher.
    #[must_use]
    pub fn dispatcher(mut self, dispatcher: Arc<dyn BroadcastDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Sets the user registry.
    #[must_use]
    pub fn user_registry(mut self, registry: Arc<dyn UserRegistry>) -> Self {
        self.user_registry = Some(registry);
        self
    }

    /// Sets the low-memory-killer sink.
    #[must_use]
    pub fn lmk_sink(mut self, lmk: Arc<dyn LmkSink>) -> Self {
        self.lmk = lmk;
        self
    }

    /// Sets the crash report receiver.
    #[must_use]
    pub fn crash_receiver(mut self, receiver: Arc<dyn CrashReportReceiver>) -> Self {
        self.crash_receiver = Some(receiver);
        self
    }

    /// Builds the supervisor. Fails if any mandatory collaborator is
    /// missing.
    pub fn build(self) -> Result<Supervisor> {
        fn missing(what: &str) -> Error {
            Error::new(ErrorKind::Configuration).with_context(format!("missing collaborator: {what}"))
        }
        let mut state = SupervisorState::new(
            self.config,
            self.clock,
            self.resolver.ok_or_else(|| missing("package resolver"))?,
            self.window.ok_or_else(|| missing("window session"))?,
            self.launcher.ok_or_else(|| missing("process launcher"))?,
            self.storage.ok_or_else(|| missing("storage service"))?,
            self.dispatcher.ok_or_else(|| missing("broadcast dispatcher"))?,
            self.user_registry.ok_or_else(|| missing("user registry"))?,
            self.lmk,
            self.crash_receiver,
        );
        // The killer table is exported once at boot; callers refresh it on
        // display-size changes.
        state.update_oom_levels();
        Ok(Supervisor {
            state: Mutex::new(state),
            cond: Condvar::new(),
        })
    }
}

impl Default for SupervisorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The activity, process, and user lifecycle supervisor.
pub struct Supervisor {
    state: Mutex<SupervisorState>,
    cond: Condvar,
}

impl Supervisor {
    /// Returns a builder.
    #[must_use]
    pub fn builder() -> SupervisorBuilder {
        SupervisorBuilder::new()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut SupervisorState) -> T) -> T {
        let mut guard = self.state.lock();
        let out = f(&mut guard);
        drop(guard);
        // Any state change may satisfy a blocked waiter.
        self.cond.notify_all();
        out
    }

    // === Launch ===

    /// Starts an activity without blocking on the result.
    pub fn start_activity(
        &self,
        intent: Intent,
        options: Option<ActivityOptions>,
        user: UserId,
    ) -> Result<StartResult> {
        self.with_state(|state| {
            state
                .start_activity_inner(intent, options, user, None, false, false)
                .map(|outcome| outcome.result)
        })
    }

    /// Starts an activity and blocks until it is resumed (or, for a
    /// task-to-front, visible), bounded by the launch-wait deadline.
    pub fn start_activity_may_wait(
        &self,
        intent: Intent,
        options: Option<ActivityOptions>,
        user: UserId,
    ) -> Result<WaitResult> {
        let mut guard = self.state.lock();
        let StartOutcome {
            result,
            stack,
            waiter,
        } = guard.start_activity_inner(intent, options, user, None, false, true)?;

        let Some(waiter) = waiter else {
            // Task-to-front with the top already visible: satisfied without
            // waiting.
            let who = guard
                .top_running_activity(stack)
                .and_then(|a| guard.activity(a).ok())
                .map(|a| a.component.clone());
            drop(guard);
            self.cond.notify_all();
            return Ok(WaitResult {
                result,
                who,
                this_time: Duration::ZERO,
                total_time: Duration::ZERO,
                timeout: false,
            });
        };

        let deadline = Instant::now() + guard.config.launch_wait_timeout;
        loop {
            let settled = guard
                .waiters
                .get(&waiter)
                .map_or(true, |w| w.outcome.is_some() || w.timed_out);
            if settled {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                if let Some(w) = guard.waiters.get_mut(&waiter) {
                    w.timed_out = true;
                }
                warn!("launch wait hit its deadline");
                break;
            }
            let _ = self.cond.wait_for(&mut guard, deadline - now);
        }

        let record = guard.waiters.remove(&waiter);
        if let Ok(stack_record) = guard.stack_mut(stack) {
            stack_record.waiting_launched.retain(|&w| w != waiter);
            stack_record.waiting_visible_waiters.retain(|&w| w != waiter);
        }
        drop(guard);
        self.cond.notify_all();

        let (who, this_time, total_time, timeout) = match record {
            Some(record) => match record.outcome {
                Some(outcome) => (
                    Some(outcome.component),
                    outcome.this_time,
                    outcome.total_time,
                    false,
                ),
                None => (None, Duration::ZERO, Duration::ZERO, record.timed_out),
            },
            None => (None, Duration::ZERO, Duration::ZERO, false),
        };
        Ok(WaitResult {
            result,
            who,
            this_time,
            total_time,
            timeout,
        })
    }

    /// Batch start: each intermediate activity becomes the result receiver
    /// of the next; the first failure aborts the remainder.
    pub fn start_activities(
        &self,
        intents: Vec<(Intent, Option<ActivityOptions>)>,
        user: UserId,
    ) -> Result<StartResult> {
        self.with_state(|state| {
            let mut result_to: Option<ActivityId> = None;
            for (intent, options) in intents {
                let receiver = result_to.map(|activity| ResultTo {
                    activity,
                    who: None,
                    request_code: -1,
                });
                let outcome = state.start_activity_inner(intent, options, user, receiver, true, false)?;
                result_to = state.top_running_activity(outcome.stack);
            }
            Ok(StartResult::Success)
        })
    }

    /// Requests an activity finish with a result for its caller.
    pub fn finish_activity(
        &self,
        token: ActivityId,
        result_code: i32,
        result_data: Option<Intent>,
    ) -> Result<bool> {
        self.with_state(|state| state.finish_activity(token, result_code, result_data, "app-request"))
    }

    /// Brings a task to the front by its externally visible number.
    pub fn move_task_to_front(&self, task_num: i32) -> Result<()> {
        self.with_state(|state| {
            let task = state.task_by_num(task_num).ok_or_else(|| {
                Error::new(ErrorKind::StaleRecord).with_context(format!("no task #{task_num}"))
            })?;
            state.move_task_to_front(task)
        })
    }

    // === Process lifecycle reports ===

    /// A forked process registered its scheduling thread.
    pub fn attach_application(
        &self,
        process_name: &str,
        uid: i32,
        pid: i32,
        thread: Arc<dyn ApplicationThread>,
    ) -> Result<bool> {
        self.with_state(|state| state.attach_application_locked(process_name, uid, pid, thread))
    }

    /// Pause completion report.
    pub fn activity_paused(&self, token: ActivityId) -> Result<()> {
        self.with_state(|state| state.complete_pause(token))
    }

    /// Idle report after a resume settles.
    pub fn activity_idle(&self, token: ActivityId) -> Result<()> {
        self.with_state(|state| state.activity_idle(token))
    }

    /// Stop completion report with the saved-state blob.
    pub fn activity_stopped(&self, token: ActivityId, saved_state: Option<Vec<u8>>) -> Result<()> {
        self.with_state(|state| state.activity_stopped(token, saved_state))
    }

    /// Destroy completion report.
    pub fn activity_destroyed(&self, token: ActivityId) -> Result<()> {
        self.with_state(|state| state.activity_destroyed(token))
    }

    /// Death notification for a process.
    pub fn app_died(&self, process_name: &str, uid: i32) -> Result<()> {
        self.with_state(|state| {
            let Some(process) = state.process_id_for(process_name, uid) else {
                debug!(process = process_name, uid, "death notification for unknown process");
                return Ok(());
            };
            state.handle_app_died(process, false)
        })
    }

    /// Crash report for a process. Returns false when the quick-crash rule
    /// removed the process entirely.
    pub fn app_crashed(
        &self,
        process_name: &str,
        uid: i32,
        short_msg: &str,
        long_msg: &str,
        stack: Option<&str>,
    ) -> Result<bool> {
        self.with_state(|state| {
            let process = state.process_id_for(process_name, uid).ok_or_else(|| {
                Error::new(ErrorKind::StaleRecord)
                    .with_context(format!("crash from unknown process {process_name}/{uid}"))
            })?;
            state.handle_app_crash(process, short_msg, long_msg, stack)
        })
    }

    /// Ensures a process is running for a non-activity purpose (service,
    /// broadcast receiver). Bad processes are refused.
    pub fn request_process_start(
        &self,
        info: &ApplicationInfo,
        user: UserId,
        hosting_type: &str,
        hosting_name: &str,
    ) -> Result<()> {
        self.with_state(|state| {
            let name = info.process_name.clone();
            state
                .start_process_locked(&name, info, user, hosting_type, hosting_name)
                .map(|_| ())
        })
    }

    /// Records a running service for crash policy and importance.
    pub fn note_service_running(
        &self,
        process_name: &str,
        uid: i32,
        service: &str,
        foreground: bool,
    ) -> Result<()> {
        self.with_state(|state| {
            let process = state.process_id_for(process_name, uid).ok_or_else(|| {
                Error::new(ErrorKind::StaleRecord)
                    .with_context(format!("no process {process_name}/{uid}"))
            })?;
            state.note_service_running(process, service, foreground)?;
            state.update_oom_adjustments();
            Ok(())
        })
    }

    /// Records whether any client is bound to this process's services with
    /// the above-client flag, which caps the client one bucket below.
    pub fn note_bound_above_client(
        &self,
        process_name: &str,
        uid: i32,
        above_client: bool,
    ) -> Result<()> {
        self.with_state(|state| {
            let process = state.process_id_for(process_name, uid).ok_or_else(|| {
                Error::new(ErrorKind::StaleRecord)
                    .with_context(format!("no process {process_name}/{uid}"))
            })?;
            state.process_mut(process)?.has_above_client = above_client;
            state.update_oom_adjustments();
            Ok(())
        })
    }

    /// Returns true if `(process_name, uid)` is on the bad-process list.
    pub fn is_bad_process(&self, process_name: &str, uid: i32) -> bool {
        self.state.lock().app_errors.is_bad_process(process_name, uid)
    }

    /// Explicit user command: forget all crash history.
    pub fn reset_crash_history(&self) {
        self.with_state(|state| state.app_errors.reset_all());
    }

    /// Re-exports the low-memory-killer table (after a display change).
    pub fn update_oom_levels(&self) {
        self.with_state(SupervisorState::update_oom_levels);
    }

    // === Users ===

    /// Starts a user in the background.
    pub fn start_user(&self, caller: &Caller, user: UserId) -> Result<bool> {
        caller.require(permissions::INTERACT_ACROSS_USERS_FULL)?;
        self.with_state(|state| state.start_user(user, false))
    }

    /// Switches the foreground to `user`.
    pub fn switch_user(&self, caller: &Caller, user: UserId) -> Result<bool> {
        caller.require(permissions::INTERACT_ACROSS_USERS_FULL)?;
        self.with_state(|state| state.start_user(user, true))
    }

    /// Stops a user (and its profile group, unless forced).
    pub fn stop_user(
        &self,
        caller: &Caller,
        user: UserId,
        force: bool,
        callback: Option<Arc<dyn UserStopCallback>>,
    ) -> Result<()> {
        caller.require(permissions::INTERACT_ACROSS_USERS_FULL)?;
        self.with_state(|state| state.stop_user(user, force, callback))
    }

    /// Unlocks a user's credential-encrypted storage.
    pub fn unlock_user(
        &self,
        caller: &Caller,
        user: UserId,
        token: Option<&[u8]>,
        secret: Option<&[u8]>,
    ) -> Result<bool> {
        caller.require(permissions::INTERACT_ACROSS_USERS_FULL)?;
        self.with_state(|state| state.unlock_user_internal(user, token, secret))
    }

    /// Registers a user-switch observer; returns its registration id.
    pub fn register_user_switch_observer(&self, observer: Arc<dyn UserSwitchObserver>) -> u64 {
        self.with_state(|state| state.register_user_switch_observer(observer))
    }

    /// Removes a user-switch observer.
    pub fn unregister_user_switch_observer(&self, id: u64) {
        self.with_state(|state| state.unregister_user_switch_observer(id));
    }

    /// Observer acknowledgement for an in-flight switch.
    pub fn acknowledge_user_switch(&self, cookie: u64) {
        self.with_state(|state| state.acknowledge_user_switch(cookie));
    }

    /// Returns the current foreground user.
    pub fn current_user(&self) -> UserId {
        self.state.lock().users.current_user
    }

    // === Displays and stacks ===

    /// Registers a display.
    pub fn add_display(&self, display: crate::types::DisplayId) {
        self.with_state(|state| state.add_display(display));
    }

    /// Creates a stack on a display. Singleton roles (home, recents,
    /// pinned, split-primary) may exist at most once per display.
    pub fn create_stack(
        &self,
        display: crate::types::DisplayId,
        windowing_mode: crate::types::WindowingMode,
        activity_type: crate::types::ActivityType,
        on_top: bool,
    ) -> Result<crate::types::StackId> {
        self.with_state(|state| state.create_stack(display, windowing_mode, activity_type, on_top))
    }

    /// Removes a stack, finishing everything it hosts. Removing the
    /// split-screen primary dismisses split-screen mode.
    pub fn remove_stack(&self, stack: crate::types::StackId) -> Result<()> {
        self.with_state(|state| state.remove_stack(stack))
    }

    /// Changes a stack's windowing mode.
    pub fn set_stack_windowing_mode(
        &self,
        stack: crate::types::StackId,
        mode: crate::types::WindowingMode,
    ) -> Result<()> {
        self.with_state(|state| state.set_stack_windowing_mode(stack, mode))
    }

    /// Moves a stack to the front of its display (clamped below pinned and
    /// always-on-top stacks).
    pub fn move_stack_to_front(&self, stack: crate::types::StackId) -> Result<()> {
        self.with_state(|state| {
            state.move_stack_to_front(stack)?;
            state.focused_stack = Some(stack);
            state.resume_top_activity(stack)?;
            Ok(())
        })
    }

    // === Coordination ===

    /// Reports delivery completion of a gated broadcast.
    pub fn finish_broadcast(&self, id: BroadcastId) -> Result<()> {
        self.with_state(|state| {
            let Some(pending) = state.pending_broadcasts.remove(&id) else {
                return Err(Error::new(ErrorKind::StaleRecord)
                    .with_context(format!("unknown {id}")));
            };
            match pending {
                PendingBroadcast::UserStopping(user) => {
                    state.finish_user_stopping(user);
                    Ok(())
                }
                PendingBroadcast::UserShutdown(user) => state.finish_user_stop(user),
                PendingBroadcast::UserInitialize {
                    user,
                    foreground,
                    old_user,
                } => {
                    state.finish_user_initialize(user, foreground, old_user);
                    Ok(())
                }
            }
        })
    }

    /// Fires every lifecycle deadline due at the clock's current time.
    /// Returns how many fired.
    pub fn process_deadlines(&self) -> usize {
        self.with_state(|state| {
            let now = state.now();
            state.process_deadlines(now)
        })
    }

    /// Puts the device to sleep or wakes it.
    pub fn set_sleeping(&self, sleeping: bool) -> Result<()> {
        self.with_state(|state| {
            let stacks: Vec<_> = state
                .stacks
                .iter()
                .map(|(index, _)| crate::types::StackId::from_arena(index))
                .collect();
            if sleeping {
                // Flag first: pause completions must not resume anything.
                state.sleeping = true;
                for stack in stacks {
                    state.stop_if_sleeping(stack)?;
                }
            } else {
                state.sleeping = false;
                for stack in stacks {
                    state.awake_from_sleeping(stack)?;
                }
                state.resume_top_activities()?;
            }
            Ok(())
        })
    }

    /// Initiates sleep on every stack and waits until all resumed and
    /// pausing activities settled, or `timeout` elapsed. Returns true on
    /// timeout; states are never rolled back.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        let mut guard = self.state.lock();
        guard.sleeping = true;
        let stacks: Vec<_> = guard
            .stacks
            .iter()
            .map(|(index, _)| crate::types::StackId::from_arena(index))
            .collect();
        for stack in stacks {
            let _ = guard.stop_if_sleeping(stack);
        }

        let deadline = Instant::now() + timeout;
        let mut timed_out = false;
        loop {
            let settled = guard
                .stacks
                .iter()
                .all(|(_, s)| s.resumed.is_none() && s.pausing.is_none());
            if settled {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                warn!("supervisor shutdown timed out");
                timed_out = true;
                break;
            }
            let _ = self.cond.wait_for(&mut guard, deadline - now);
        }
        drop(guard);
        self.cond.notify_all();
        timed_out
    }

    /// Drains the policy event journal.
    pub fn drain_events(&self) -> Vec<PolicyEvent> {
        self.state.lock().drain_events()
    }

    /// Takes a read-only snapshot of the whole system.
    pub fn snapshot(&self) -> Snapshot {
        self.state.lock().snapshot()
    }

    /// Verifies the structural invariants; returns a description of the
    /// first violation found.
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        self.state.lock().check_invariants()
    }
}
