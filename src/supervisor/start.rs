//! The launch pipeline: resolve, redirect, place, and dispatch.
//!
//! A launch request flows: intent validation → package resolution (with the
//! resolved component cached back into the intent) → heavyweight
//! interception → launch-params computation → stack selection → task
//! selection or creation → the stack's resume choreography.

use crate::error::{Error, ErrorKind, Result};
use crate::launch::CalculateRequest;
use crate::record::{ActivityRecord, TaskRecord};
use crate::supervisor::state::{PolicyEvent, SupervisorState};
use crate::tracing_compat::{debug, info};
use crate::types::{
    ActivityId, ActivityInfo, ActivityOptions, ActivityType, ComponentName, DisplayId,
    ExtraValue, Intent, StackId, TaskId, UserId, WindowingMode,
};

/// Action of the internal switcher activity that confirms replacing the
/// running heavyweight application.
pub const ACTION_HEAVY_WEIGHT_SWITCHER: &str = "supervisor.heavy-weight-switcher";

/// Switcher extra: the deferred original intent.
pub const EXTRA_PENDING_INTENT: &str = "heavy-weight.pending-intent";
/// Switcher extra: package of the application being launched.
pub const EXTRA_NEW_APP: &str = "heavy-weight.new-app";
/// Switcher extra: package of the heavyweight application currently running.
pub const EXTRA_CURRENT_APP: &str = "heavy-weight.current-app";
/// Switcher extra: whether the caller expects a result.
pub const EXTRA_HAS_RESULT: &str = "heavy-weight.has-result";

/// How a launch request concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartResult {
    /// A new activity record was created and is being brought up.
    Success,
    /// An existing task satisfied the launch and was brought to the front.
    TaskToFront,
}

/// What `start_activity_inner` produced.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StartOutcome {
    pub(crate) result: StartResult,
    pub(crate) stack: StackId,
    /// Registered launch waiter, when the caller asked to block. `None` on
    /// a task-to-front whose top was already visible.
    pub(crate) waiter: Option<u64>,
}

/// Result-receiver plumbing for batch starts.
pub(crate) struct ResultTo {
    pub(crate) activity: ActivityId,
    pub(crate) who: Option<String>,
    pub(crate) request_code: i32,
}

impl SupervisorState {
    /// Resolves an intent, caching the component for idempotent replay.
    pub(crate) fn resolve_activity(
        &mut self,
        intent: &mut Intent,
        user: UserId,
    ) -> Result<ActivityInfo> {
        let info = self
            .resolver
            .resolve_intent(intent, user)
            .ok_or_else(|| Error::new(ErrorKind::ResolveFailed).with_context("no matching activity"))?;
        // Replaying the resolved intent must restart the exact same
        // activity, so the component is written back.
        intent.component = Some(info.component());
        Ok(info)
    }

    /// The launch entry point behind every public start call.
    pub(crate) fn start_activity_inner(
        &mut self,
        intent: Intent,
        options: Option<ActivityOptions>,
        user: UserId,
        result_to: Option<ResultTo>,
        in_batch: bool,
        register_wait: bool,
    ) -> Result<StartOutcome> {
        if intent.carries_file_descriptors {
            return Err(Error::new(ErrorKind::BadIntent)
                .with_context("file descriptors passed in intent"));
        }
        if !self.users.started.contains_key(&user) {
            return Err(Error::new(ErrorKind::UserNotRunning)
                .with_context(format!("launch for {user} which is not running")));
        }

        let mut intent = intent;
        let mut info = self.resolve_activity(&mut intent, user)?;
        if info.application.cant_save_state {
            if in_batch {
                return Err(Error::new(ErrorKind::BadIntent)
                    .with_context("cant-save-state applications not supported in batch starts"));
            }
            info = self.maybe_redirect_heavyweight(&mut intent, info, user)?;
        }
        let component = info.component();

        // Reuse policy: a task rooted in the same component for the same
        // user comes to the front instead of stacking a new instance.
        if let Some((stack_id, task_id)) = self.find_task_for_component(&component, user) {
            debug!(task = %task_id, component = %component, "bringing existing task forward");
            // A top that is already visible satisfies the caller without any
            // wait; otherwise the waiter must exist before the resume runs.
            let mut waiter = None;
            if register_wait {
                let top_visible = self
                    .top_running_activity(stack_id)
                    .and_then(|top| self.activity(top).ok())
                    .is_some_and(|a| a.now_visible);
                if !top_visible {
                    let id = self.new_waiter(stack_id, crate::supervisor::state::WaitKind::Visible);
                    self.stack_mut(stack_id)?.waiting_visible_waiters.push(id);
                    waiter = Some(id);
                }
            }
            self.move_task_to_front(task_id)?;
            if let Some(top) = self.top_running_activity(stack_id) {
                if self.activity(top)?.component == component {
                    self.deliver_new_intent(top, intent)?;
                }
            }
            return Ok(StartOutcome {
                result: StartResult::TaskToFront,
                stack: stack_id,
                waiter,
            });
        }

        let activity_type = options
            .as_ref()
            .map_or(ActivityType::Standard, |o| {
                if o.launch_activity_type == ActivityType::Undefined {
                    ActivityType::Standard
                } else {
                    o.launch_activity_type
                }
            });

        // Placement: the modifier chain first, then windowing-mode
        // resolution against the chosen display.
        let display_id = {
            let request = CalculateRequest {
                task: None,
                layout: info.layout.as_ref(),
                activity: None,
                source: None,
                options: options.as_ref(),
                display_bounds: self.display(DisplayId::DEFAULT)?.bounds,
            };
            let params = self.launch_params.calculate(&request);
            if params.has_preferred_display() {
                params.preferred_display
            } else {
                DisplayId::DEFAULT
            }
        };
        if !self.displays.contains_key(&display_id) {
            return Err(Error::new(ErrorKind::Configuration)
                .with_context(format!("launch on unknown {display_id}")));
        }

        let windowing_mode = self.resolve_windowing_mode(
            display_id,
            Some(&info),
            options.as_ref(),
            None,
            activity_type,
        )?;

        let stack_id = self.select_launch_stack(display_id, windowing_mode, activity_type)?;
        let task_id = self.create_task(stack_id, intent.clone(), None, user)?;
        let activity_id = self.create_activity(task_id, user, info, intent)?;
        if let Some(result_to) = result_to {
            let activity = self.activity_mut(activity_id)?;
            activity.result_to = Some(result_to.activity);
            activity.result_who = result_to.who;
            activity.request_code = result_to.request_code;
        }

        let now = self.now();
        self.stack_mut(stack_id)?.set_launch_time(now);
        self.focused_stack = Some(stack_id);
        let waiter = if register_wait {
            let id = self.new_waiter(stack_id, crate::supervisor::state::WaitKind::Launched);
            self.stack_mut(stack_id)?.waiting_launched.push(id);
            Some(id)
        } else {
            None
        };
        info!(activity = %activity_id, component = %component, stack = %stack_id, "starting activity");
        self.resume_top_activity(stack_id)?;
        Ok(StartOutcome {
            result: StartResult::Success,
            stack: stack_id,
            waiter,
        })
    }

    /// Prefers the focused stack when it is compatible; otherwise asks the
    /// display for (or creates) a matching stack.
    fn select_launch_stack(
        &mut self,
        display_id: DisplayId,
        windowing_mode: WindowingMode,
        activity_type: ActivityType,
    ) -> Result<StackId> {
        if let Some(focused) = self.focused_stack {
            if let Ok(stack) = self.stack(focused) {
                if stack.display == display_id
                    && stack.windowing_mode == windowing_mode
                    && stack.activity_type == activity_type
                {
                    return Ok(focused);
                }
            }
        }
        self.get_or_create_stack(display_id, windowing_mode, activity_type, true)
    }

    /// Intercepts a launch that would start a second heavyweight process:
    /// the request is rewritten into the internal switcher, carrying the
    /// original intent as a deferred extra.
    fn maybe_redirect_heavyweight(
        &mut self,
        intent: &mut Intent,
        info: ActivityInfo,
        user: UserId,
    ) -> Result<ActivityInfo> {
        if info.process_name != info.application.package {
            // Only the package-default process counts as heavyweight.
            return Ok(info);
        }
        let Some(running) = self.heavy_weight_process else {
            return Ok(info);
        };
        let running_record = self
            .process(running)
            .ok()
            .map(|r| (r.process_name.clone(), r.uid, r.info.package.clone()));
        let Some((running_name, running_uid, current_package)) = running_record else {
            // The heavyweight process went away without clearing the slot.
            self.heavy_weight_process = None;
            return Ok(info);
        };
        if running_uid == info.application.uid && running_name == info.process_name {
            return Ok(info);
        }

        let requested = info.component();
        info!(requested = %requested, running = %running_name, "redirecting to heavyweight switcher");
        let mut switcher = Intent::for_action(ACTION_HEAVY_WEIGHT_SWITCHER)
            .with_extra(
                EXTRA_PENDING_INTENT,
                ExtraValue::Pending(Box::new(intent.clone())),
            )
            .with_extra(
                EXTRA_NEW_APP,
                ExtraValue::Text(info.application.package.clone()),
            )
            .with_extra(EXTRA_CURRENT_APP, ExtraValue::Text(current_package))
            .with_extra(EXTRA_HAS_RESULT, ExtraValue::Bool(false));
        switcher.flags = intent.flags;

        self.push_event(PolicyEvent::HeavyweightRedirected { requested });
        let switcher_info = self.resolve_activity(&mut switcher, user)?;
        *intent = switcher;
        Ok(switcher_info)
    }

    /// Finds a task rooted in `component` for `user`, topmost first.
    fn find_task_for_component(
        &self,
        component: &ComponentName,
        user: UserId,
    ) -> Option<(StackId, TaskId)> {
        for display in self.displays.values() {
            for &stack_id in display.stacks.iter().rev() {
                let Ok(stack) = self.stack(stack_id) else {
                    continue;
                };
                for &task_id in stack.tasks.iter().rev() {
                    let Ok(task) = self.task(task_id) else {
                        continue;
                    };
                    if task.user != user {
                        continue;
                    }
                    let rooted = task.root_activity().and_then(|a| self.activity(a).ok());
                    if rooted.is_some_and(|a| &a.component == component) {
                        return Some((stack_id, task_id));
                    }
                }
            }
        }
        None
    }

    /// Creates a task on top of `stack_id` with a collision-checked number.
    pub(crate) fn create_task(
        &mut self,
        stack_id: StackId,
        root_intent: Intent,
        affinity: Option<String>,
        user: UserId,
    ) -> Result<TaskId> {
        loop {
            self.next_task_num = self.next_task_num.wrapping_add(1);
            if self.next_task_num <= 0 {
                self.next_task_num = 1;
            }
            let candidate = self.next_task_num;
            if !self.tasks.iter().any(|(_, t)| t.task_num == candidate) {
                break;
            }
        }
        let task_num = self.next_task_num;
        let index = self.tasks.insert(TaskRecord::new(
            TaskId::new_for_test(0, 0),
            task_num,
            stack_id,
            root_intent,
            affinity,
            user,
        ));
        let task_id = TaskId::from_arena(index);
        self.tasks.get_mut(index).expect("freshly inserted task").id = task_id;
        self.stack_mut(stack_id)?.tasks.push(task_id);
        Ok(task_id)
    }

    /// Creates an activity record on top of `task_id`.
    pub(crate) fn create_activity(
        &mut self,
        task_id: TaskId,
        user: UserId,
        info: ActivityInfo,
        intent: Intent,
    ) -> Result<ActivityId> {
        let index = self.activities.insert(ActivityRecord::new(
            ActivityId::new_for_test(0, 0),
            task_id,
            user,
            info,
            intent,
        ));
        let activity_id = ActivityId::from_arena(index);
        self.activities
            .get_mut(index)
            .expect("freshly inserted activity")
            .id = activity_id;
        self.task_mut(task_id)?.push_activity(activity_id);
        let stack_id = self.task(task_id)?.stack;
        self.stack_mut(stack_id)?.update_lru(activity_id);
        Ok(activity_id)
    }

    /// Finds a task by its externally visible number.
    pub(crate) fn task_by_num(&self, task_num: i32) -> Option<TaskId> {
        self.tasks
            .iter()
            .find(|(_, t)| t.task_num == task_num)
            .map(|(index, _)| TaskId::from_arena(index))
    }
}
