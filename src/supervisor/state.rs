//! The supervisor's mutable state.
//!
//! Every record table and policy object lives in [`SupervisorState`], guarded
//! by the single supervisor lock in [`super::Supervisor`]. Component behavior
//! is written as `impl SupervisorState` blocks next to the component it
//! belongs to (`stack`, `display`, `process`, `user`, ...); this module holds
//! the struct itself plus the cross-cutting helpers: record lookup, waiter
//! bookkeeping, deadline queue, and the policy event journal.

use crate::apperrors::AppErrors;
use crate::config::SupervisorConfig;
use crate::display::DisplayRecord;
use crate::error::{Error, ErrorKind, Result};
use crate::external::{
    BroadcastDispatcher, BroadcastId, CrashReportReceiver, LmkSink, PackageResolver,
    ProcessLauncher, StorageService, UserRegistry, WindowSession,
};
use crate::launch::LaunchParamsController;
use crate::record::{ActivityRecord, ProcessRecord, TaskRecord};
use crate::stack::StackRecord;
use crate::tracing_compat::{debug, warn};
use crate::types::{
    ActivityId, ClockSource, ComponentName, DisplayId, ProcessId, StackId, TaskId, Time, UserId,
};
use crate::user::UserControllerState;
use crate::util::Arena;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// Key identifying a process before it has a pid.
pub(crate) type ProcessKey = (String, i32);

/// What a blocked launch caller is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitKind {
    /// Wait until the launched activity reaches RESUMED.
    Launched,
    /// Wait until the (already running) top activity reports visible.
    Visible,
}

/// Terminal payload handed to a satisfied launch waiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitOutcome {
    /// Component that satisfied the wait.
    pub component: ComponentName,
    /// Time from this activity's launch to satisfaction.
    pub this_time: Duration,
    /// Time from the first launch of the sequence to satisfaction.
    pub total_time: Duration,
}

/// Bookkeeping for one blocked launch caller.
#[derive(Debug)]
pub struct WaitRecord {
    /// The stack whose queues reference this waiter.
    pub stack: StackId,
    /// What satisfies the wait.
    pub kind: WaitKind,
    /// When the wait began.
    pub started: Time,
    /// Set by the satisfier.
    pub outcome: Option<WaitOutcome>,
    /// Set when the deadline passed first.
    pub timed_out: bool,
}

/// A pending bounded-wait expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineKind {
    /// Pause completion overdue; force-completes the pause.
    Pause(ActivityId),
    /// Stop completion overdue; force-completes the stop.
    Stop(ActivityId),
    /// Destroy completion overdue; kills the hosting process.
    Destroy(ActivityId),
    /// User-switch observers overdue; the switch continues anyway.
    UserSwitch(u64),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    pub(crate) at: Time,
    pub(crate) kind: DeadlineKind,
}

/// Continuation to run when a gated broadcast finishes delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingBroadcast {
    /// The user-stopping broadcast: completion moves the user to SHUTDOWN
    /// and sends the shutdown broadcast.
    UserStopping(UserId),
    /// The shutdown broadcast: completion runs the final user teardown.
    UserShutdown(UserId),
    /// The first-boot initialize broadcast: completion finishes the switch.
    UserInitialize {
        /// The initializing user.
        user: UserId,
        /// Whether the start was a foreground switch.
        foreground: bool,
        /// The previously current user.
        old_user: UserId,
    },
}

/// Journal entry for policy decisions the outside world may care about.
///
/// Conformance suites drain the journal to assert that structural events
/// fired exactly as often as required.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyEvent {
    /// The stack order of a display changed.
    StackOrderChanged(DisplayId),
    /// A split-screen primary stack appeared and secondaries were resized.
    SplitScreenActivated(DisplayId),
    /// The split-screen primary went away and secondaries were restored.
    SplitScreenDismissed(DisplayId),
    /// A launch was redirected to the heavyweight switcher.
    HeavyweightRedirected {
        /// The component originally requested.
        requested: ComponentName,
    },
    /// A process tripped the crash policy and was marked bad.
    ProcessMarkedBad {
        /// Process name.
        process_name: String,
        /// Application uid.
        uid: i32,
    },
    /// A user switch fully completed (screen unfrozen).
    UserSwitchComplete(UserId),
}

/// All mutable supervisor state, guarded by the supervisor lock.
pub struct SupervisorState {
    /// Configuration (normalized at construction).
    pub(crate) config: SupervisorConfig,
    /// Time source.
    pub(crate) clock: Arc<dyn ClockSource>,

    // External collaborators.
    pub(crate) resolver: Arc<dyn PackageResolver>,
    pub(crate) window: Arc<dyn WindowSession>,
    pub(crate) launcher: Arc<dyn ProcessLauncher>,
    pub(crate) storage: Arc<dyn StorageService>,
    pub(crate) dispatcher: Arc<dyn BroadcastDispatcher>,
    pub(crate) user_registry: Arc<dyn UserRegistry>,
    pub(crate) lmk: Arc<dyn LmkSink>,
    pub(crate) crash_receiver: Option<Arc<dyn CrashReportReceiver>>,

    // Record tables.
    pub(crate) activities: Arena<ActivityRecord>,
    pub(crate) tasks: Arena<TaskRecord>,
    pub(crate) stacks: Arena<StackRecord>,
    pub(crate) displays: BTreeMap<DisplayId, DisplayRecord>,
    pub(crate) processes: Arena<ProcessRecord>,
    pub(crate) process_names: HashMap<ProcessKey, ProcessId>,
    /// Process ids ordered least-recently-used first.
    pub(crate) process_lru: Vec<ProcessId>,
    /// At most one heavyweight process runs at a time.
    pub(crate) heavy_weight_process: Option<ProcessId>,

    // Numbering for externally visible ids.
    pub(crate) next_task_num: i32,
    pub(crate) next_stack_num: i32,

    // Policy subsystems.
    pub(crate) app_errors: AppErrors,
    pub(crate) users: UserControllerState,
    pub(crate) launch_params: LaunchParamsController,

    // Coordination.
    pub(crate) waiters: HashMap<u64, WaitRecord>,
    next_waiter: u64,
    pub(crate) pending_broadcasts: HashMap<BroadcastId, PendingBroadcast>,
    next_broadcast: u64,
    pub(crate) deadlines: Vec<Deadline>,
    pub(crate) events: Vec<PolicyEvent>,
    /// The whole device is asleep.
    pub(crate) sleeping: bool,
    /// Stack that last received a launch or explicit focus.
    pub(crate) focused_stack: Option<StackId>,
}

impl SupervisorState {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        mut config: SupervisorConfig,
        clock: Arc<dyn ClockSource>,
        resolver: Arc<dyn PackageResolver>,
        window: Arc<dyn WindowSession>,
        launcher: Arc<dyn ProcessLauncher>,
        storage: Arc<dyn StorageService>,
        dispatcher: Arc<dyn BroadcastDispatcher>,
        user_registry: Arc<dyn UserRegistry>,
        lmk: Arc<dyn LmkSink>,
        crash_receiver: Option<Arc<dyn CrashReportReceiver>>,
    ) -> Self {
        config.normalize();
        let mut state = Self {
            config,
            clock,
            resolver,
            window,
            launcher,
            storage,
            dispatcher,
            user_registry,
            lmk,
            crash_receiver,
            activities: Arena::new(),
            tasks: Arena::new(),
            stacks: Arena::new(),
            displays: BTreeMap::new(),
            processes: Arena::new(),
            process_names: HashMap::new(),
            process_lru: Vec::new(),
            heavy_weight_process: None,
            next_task_num: 0,
            next_stack_num: 0,
            app_errors: AppErrors::new(),
            users: UserControllerState::new(),
            launch_params: LaunchParamsController::with_default_modifiers(),
            waiters: HashMap::new(),
            next_waiter: 0,
            pending_broadcasts: HashMap::new(),
            next_broadcast: 0,
            deadlines: Vec::new(),
            events: Vec::new(),
            sleeping: false,
            focused_stack: None,
        };
        state.add_display(DisplayId::DEFAULT);
        state
    }

    /// Returns the current time.
    pub(crate) fn now(&self) -> Time {
        self.clock.now()
    }

    // === Record lookup ===

    pub(crate) fn activity(&self, id: ActivityId) -> Result<&ActivityRecord> {
        self.activities
            .get(id.arena_index())
            .ok_or_else(|| stale("activity", &id.to_string()))
    }

    pub(crate) fn activity_mut(&mut self, id: ActivityId) -> Result<&mut ActivityRecord> {
        self.activities
            .get_mut(id.arena_index())
            .ok_or_else(|| stale("activity", &id.to_string()))
    }

    pub(crate) fn task(&self, id: TaskId) -> Result<&TaskRecord> {
        self.tasks
            .get(id.arena_index())
            .ok_or_else(|| stale("task", &id.to_string()))
    }

    pub(crate) fn task_mut(&mut self, id: TaskId) -> Result<&mut TaskRecord> {
        self.tasks
            .get_mut(id.arena_index())
            .ok_or_else(|| stale("task", &id.to_string()))
    }

    pub(crate) fn stack(&self, id: StackId) -> Result<&StackRecord> {
        self.stacks
            .get(id.arena_index())
            .ok_or_else(|| stale("stack", &id.to_string()))
    }

    pub(crate) fn stack_mut(&mut self, id: StackId) -> Result<&mut StackRecord> {
        self.stacks
            .get_mut(id.arena_index())
            .ok_or_else(|| stale("stack", &id.to_string()))
    }

    pub(crate) fn process(&self, id: ProcessId) -> Result<&ProcessRecord> {
        self.processes
            .get(id.arena_index())
            .ok_or_else(|| stale("process", &id.to_string()))
    }

    pub(crate) fn process_mut(&mut self, id: ProcessId) -> Result<&mut ProcessRecord> {
        self.processes
            .get_mut(id.arena_index())
            .ok_or_else(|| stale("process", &id.to_string()))
    }

    pub(crate) fn display(&self, id: DisplayId) -> Result<&DisplayRecord> {
        self.displays
            .get(&id)
            .ok_or_else(|| stale("display", &id.to_string()))
    }

    pub(crate) fn display_mut(&mut self, id: DisplayId) -> Result<&mut DisplayRecord> {
        self.displays
            .get_mut(&id)
            .ok_or_else(|| stale("display", &id.to_string()))
    }

    /// Returns the stack owning `activity` (through its task).
    pub(crate) fn stack_of(&self, activity: ActivityId) -> Result<StackId> {
        let task = self.activity(activity)?.task;
        Ok(self.task(task)?.stack)
    }

    // === Waiters ===

    pub(crate) fn new_waiter(&mut self, stack: StackId, kind: WaitKind) -> u64 {
        let id = self.next_waiter;
        self.next_waiter += 1;
        let started = self.now();
        self.waiters.insert(
            id,
            WaitRecord {
                stack,
                kind,
                started,
                outcome: None,
                timed_out: false,
            },
        );
        id
    }

    pub(crate) fn satisfy_waiter(&mut self, waiter: u64, outcome: WaitOutcome) {
        if let Some(record) = self.waiters.get_mut(&waiter) {
            if record.outcome.is_none() && !record.timed_out {
                record.outcome = Some(outcome);
            }
        }
    }

    // === Deadlines ===

    pub(crate) fn arm_deadline(&mut self, kind: DeadlineKind, delay: Duration) {
        let at = self.now() + delay;
        debug!(?kind, at = %at, "deadline armed");
        self.deadlines.push(Deadline { at, kind });
    }

    pub(crate) fn cancel_deadline(&mut self, kind: DeadlineKind) {
        self.deadlines.retain(|d| d.kind != kind);
    }

    /// Fires every deadline at or before `now`. Returns how many fired.
    pub(crate) fn process_deadlines(&mut self, now: Time) -> usize {
        let mut due = Vec::new();
        self.deadlines.retain(|d| {
            if d.at <= now {
                due.push(d.kind);
                false
            } else {
                true
            }
        });
        let fired = due.len();
        for kind in due {
            warn!(?kind, "deadline expired");
            match kind {
                DeadlineKind::Pause(activity) => self.pause_timed_out(activity),
                DeadlineKind::Stop(activity) => self.stop_timed_out(activity),
                DeadlineKind::Destroy(activity) => self.destroy_timed_out(activity),
                DeadlineKind::UserSwitch(seq) => self.user_switch_timed_out(seq),
            }
        }
        fired
    }

    // === Gated broadcasts ===

    pub(crate) fn new_broadcast_id(&mut self, action: PendingBroadcast) -> BroadcastId {
        self.next_broadcast += 1;
        let id = BroadcastId(self.next_broadcast);
        self.pending_broadcasts.insert(id, action);
        id
    }

    // === Events ===

    pub(crate) fn push_event(&mut self, event: PolicyEvent) {
        self.events.push(event);
    }

    /// Drains the policy event journal.
    pub fn drain_events(&mut self) -> Vec<PolicyEvent> {
        std::mem::take(&mut self.events)
    }
}

fn stale(kind: &str, id: &str) -> Error {
    Error::new(ErrorKind::StaleRecord).with_context(format!("{kind} {id} is gone"))
}
