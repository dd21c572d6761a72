//! Read-only snapshots and invariant checking.
//!
//! Conformance suites and diagnostic dumps read the supervisor through the
//! snapshot types here rather than poking at live records.
//! [`SupervisorState::check_invariants`] verifies the structural invariants
//! after every interesting transition.

use crate::record::{ActivityState, ProcessState, UserState};
use crate::supervisor::state::SupervisorState;
use crate::types::{ActivityId, ActivityType, DisplayId, ProcessId, StackId, UserId, WindowingMode};
use serde::Serialize;

/// One activity, as observed.
#[derive(Debug, Clone, Serialize)]
pub struct ActivitySnapshot {
    /// Record id (also the process-facing token).
    #[serde(skip)]
    pub id: ActivityId,
    /// Flattened component name.
    pub component: String,
    /// Lifecycle state.
    #[serde(skip)]
    pub state: ActivityState,
    /// Visibility as last computed.
    pub visible: bool,
    /// Finish requested.
    pub finishing: bool,
    /// Owning user.
    #[serde(skip)]
    pub user: UserId,
    /// Hosting process name.
    pub process_name: String,
    /// Whether a hosting process is attached.
    pub has_process: bool,
}

/// One task, bottom to top.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    /// Externally visible number.
    pub task_num: i32,
    /// Activities, bottom to top.
    pub activities: Vec<ActivitySnapshot>,
}

/// One stack, bottom to top.
#[derive(Debug, Clone, Serialize)]
pub struct StackSnapshot {
    /// Record id.
    #[serde(skip)]
    pub id: StackId,
    /// Externally visible number.
    pub stack_num: i32,
    /// Windowing mode.
    #[serde(skip)]
    pub windowing_mode: WindowingMode,
    /// Activity type.
    #[serde(skip)]
    pub activity_type: ActivityType,
    /// The resumed activity, if any.
    #[serde(skip)]
    pub resumed: Option<ActivityId>,
    /// The pausing activity, if any.
    #[serde(skip)]
    pub pausing: Option<ActivityId>,
    /// Tasks, bottom to top.
    pub tasks: Vec<TaskSnapshot>,
}

/// One display, stacks bottom to top.
#[derive(Debug, Clone, Serialize)]
pub struct DisplaySnapshot {
    /// Display id.
    #[serde(skip)]
    pub id: DisplayId,
    /// Stacks, bottom to top.
    pub stacks: Vec<StackSnapshot>,
    /// Cached home singleton.
    #[serde(skip)]
    pub home_stack: Option<StackId>,
    /// Cached pinned singleton.
    #[serde(skip)]
    pub pinned_stack: Option<StackId>,
    /// Cached split-screen-primary singleton.
    #[serde(skip)]
    pub split_primary_stack: Option<StackId>,
}

/// One process, as observed.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessSnapshot {
    /// Record id.
    #[serde(skip)]
    pub id: ProcessId,
    /// Process name.
    pub process_name: String,
    /// Application uid.
    pub uid: i32,
    /// Pid, once forked.
    pub pid: Option<i32>,
    /// Thread attached.
    pub active: bool,
    /// Current OOM adjustment.
    pub adj: i32,
    /// Importance bucket.
    #[serde(skip)]
    pub proc_state: ProcessState,
    /// On the bad list.
    pub bad: bool,
    /// Killed.
    pub killed: bool,
    /// Hosted activity count.
    pub activities: usize,
}

/// One user, as observed.
#[derive(Debug, Clone, Serialize)]
pub struct UserSnapshot {
    /// User id.
    #[serde(skip)]
    pub id: UserId,
    /// Lifecycle state.
    #[serde(skip)]
    pub state: UserState,
    /// A switch toward this user is in flight.
    pub switching: bool,
    /// First-boot initialization is in flight.
    pub initializing: bool,
}

/// The whole system, as observed under the lock.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    /// Displays in id order.
    pub displays: Vec<DisplaySnapshot>,
    /// Processes in table order.
    pub processes: Vec<ProcessSnapshot>,
    /// Started users in id order.
    pub users: Vec<UserSnapshot>,
    /// The current foreground user.
    #[serde(skip)]
    pub current_user: UserId,
    /// The heavyweight process, if any.
    #[serde(skip)]
    pub heavy_weight_process: Option<ProcessId>,
    /// Users in a running state.
    pub running_users: usize,
}

impl Snapshot {
    /// Finds an activity snapshot by id, anywhere in the tree.
    #[must_use]
    pub fn activity(&self, id: ActivityId) -> Option<&ActivitySnapshot> {
        self.displays
            .iter()
            .flat_map(|d| &d.stacks)
            .flat_map(|s| &s.tasks)
            .flat_map(|t| &t.activities)
            .find(|a| a.id == id)
    }

    /// Finds a stack snapshot by id.
    #[must_use]
    pub fn stack(&self, id: StackId) -> Option<&StackSnapshot> {
        self.displays
            .iter()
            .flat_map(|d| &d.stacks)
            .find(|s| s.id == id)
    }

    /// Counts activities in a given state across the whole tree.
    #[must_use]
    pub fn count_in_state(&self, state: ActivityState) -> usize {
        self.displays
            .iter()
            .flat_map(|d| &d.stacks)
            .flat_map(|s| &s.tasks)
            .flat_map(|t| &t.activities)
            .filter(|a| a.state == state)
            .count()
    }
}

impl SupervisorState {
    /// Takes a read-only snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        let mut displays = Vec::new();
        for display in self.displays.values() {
            let mut stacks = Vec::new();
            for &stack_id in &display.stacks {
                let Ok(stack) = self.stack(stack_id) else {
                    continue;
                };
                let mut tasks = Vec::new();
                for &task_id in &stack.tasks {
                    let Ok(task) = self.task(task_id) else {
                        continue;
                    };
                    let activities = task
                        .activities
                        .iter()
                        .filter_map(|&activity_id| {
                            let activity = self.activity(activity_id).ok()?;
                            Some(ActivitySnapshot {
                                id: activity_id,
                                component: activity.component.flatten(),
                                state: activity.state,
                                visible: activity.visible,
                                finishing: activity.finishing,
                                user: activity.user,
                                process_name: activity.process_name.clone(),
                                has_process: activity.app.is_some(),
                            })
                        })
                        .collect();
                    tasks.push(TaskSnapshot {
                        task_num: task.task_num,
                        activities,
                    });
                }
                stacks.push(StackSnapshot {
                    id: stack_id,
                    stack_num: stack.stack_num,
                    windowing_mode: stack.windowing_mode,
                    activity_type: stack.activity_type,
                    resumed: stack.resumed,
                    pausing: stack.pausing,
                    tasks,
                });
            }
            displays.push(DisplaySnapshot {
                id: display.id,
                stacks,
                home_stack: display.home_stack,
                pinned_stack: display.pinned_stack,
                split_primary_stack: display.split_primary_stack,
            });
        }

        let processes = self
            .processes
            .iter()
            .map(|(index, record)| ProcessSnapshot {
                id: ProcessId::from_arena(index),
                process_name: record.process_name.clone(),
                uid: record.uid,
                pid: record.pid,
                active: record.is_active(),
                adj: record.cur_adj,
                proc_state: record.proc_state,
                bad: record.bad,
                killed: record.killed,
                activities: record.activities.len(),
            })
            .collect();

        let mut users: Vec<UserSnapshot> = self
            .users
            .started
            .values()
            .map(|record| UserSnapshot {
                id: record.id,
                state: record.state,
                switching: record.switching,
                initializing: record.initializing,
            })
            .collect();
        users.sort_by_key(|u| u.id);

        let running_users = self.users.running_count();
        Snapshot {
            displays,
            processes,
            users,
            current_user: self.users.current_user,
            heavy_weight_process: self.heavy_weight_process,
            running_users,
        }
    }

    /// Verifies the structural invariants; returns a description of the
    /// first violation.
    pub fn check_invariants(&self) -> Result<(), String> {
        // Per stack: at most one RESUMED, at most one PAUSING, never the
        // same record.
        for (index, stack) in self.stacks.iter() {
            let stack_id = StackId::from_arena(index);
            let mut resumed = 0usize;
            let mut pausing = 0usize;
            for &task_id in &stack.tasks {
                let Ok(task) = self.task(task_id) else {
                    return Err(format!("{stack_id} references missing {task_id}"));
                };
                if task.stack != stack_id {
                    return Err(format!("{task_id} disowns {stack_id}"));
                }
                for &activity_id in &task.activities {
                    let Ok(activity) = self.activity(activity_id) else {
                        return Err(format!("{task_id} references missing {activity_id}"));
                    };
                    match activity.state {
                        ActivityState::Resumed => resumed += 1,
                        ActivityState::Pausing => pausing += 1,
                        _ => {}
                    }
                }
            }
            if resumed > 1 {
                return Err(format!("{stack_id} has {resumed} resumed activities"));
            }
            if pausing > 1 {
                return Err(format!("{stack_id} has {pausing} pausing activities"));
            }
            if stack.resumed.is_some() && stack.resumed == stack.pausing {
                return Err(format!("{stack_id} resumed == pausing"));
            }
        }

        // Per display: singleton roles and pinned-topmost.
        for display in self.displays.values() {
            let mut home = 0usize;
            let mut recents = 0usize;
            let mut pinned = 0usize;
            let mut split_primary = 0usize;
            for &stack_id in &display.stacks {
                let Ok(stack) = self.stack(stack_id) else {
                    return Err(format!("{} references missing {stack_id}", display.id));
                };
                match stack.activity_type {
                    ActivityType::Home => home += 1,
                    ActivityType::Recents => recents += 1,
                    _ => {}
                }
                match stack.windowing_mode {
                    WindowingMode::Pinned => pinned += 1,
                    WindowingMode::SplitScreenPrimary => split_primary += 1,
                    _ => {}
                }
            }
            if home > 1 || recents > 1 || pinned > 1 || split_primary > 1 {
                return Err(format!("{} duplicates a singleton stack role", display.id));
            }
            if let Some(pinned_stack) = display.pinned_stack {
                if display.stacks.last() != Some(&pinned_stack) {
                    return Err(format!("{} pinned stack is not topmost", display.id));
                }
            }
        }

        // Every live task is referenced by exactly one stack.
        for (index, _task) in self.tasks.iter() {
            let task_id = crate::types::TaskId::from_arena(index);
            let owners = self
                .stacks
                .iter()
                .filter(|(_, s)| s.tasks.contains(&task_id))
                .count();
            if owners != 1 {
                return Err(format!("{task_id} is owned by {owners} stacks"));
            }
        }

        // At most one heavyweight process.
        let heavyweights = self
            .processes
            .iter()
            .filter(|(index, p)| {
                p.is_active()
                    && p.info.cant_save_state
                    && Some(ProcessId::from_arena(*index)) == self.heavy_weight_process
            })
            .count();
        if self.heavy_weight_process.is_some() && heavyweights > 1 {
            return Err("more than one heavyweight process".to_string());
        }

        // Bounded running users.
        let running = self.users.running_count();
        if running > self.config.max_running_users {
            return Err(format!(
                "{running} users running, bound is {}",
                self.config.max_running_users
            ));
        }

        // A bad process is neither isolated nor persistent.
        for (_, process) in self.processes.iter() {
            if process.bad && (process.isolated || process.persistent) {
                return Err(format!(
                    "bad mark on exempt process {}",
                    process.process_name
                ));
            }
        }
        Ok(())
    }
}
