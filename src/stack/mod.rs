//! Activity stacks and the pause/resume choreography.
//!
//! A stack is an ordered sequence of tasks on one display. The choreography
//! here maintains the two stack invariants: at most one activity is RESUMED,
//! at most one is PAUSING, and the pause of the outgoing activity strictly
//! precedes the resume of its successor.
//!
//! The flow of [`SupervisorState::resume_top_activity`]:
//!
//! 1. Pick the topmost non-finishing activity; with none, fall back to the
//!    display's home stack.
//! 2. A different activity currently RESUMED starts pausing; this routine
//!    re-enters when the pause completes.
//! 3. A pause still in flight defers the resume to its completion.
//! 4. A missing host process is started; the attach re-enters.
//! 5. Otherwise the resume is scheduled into the hosting process.

use crate::error::Result;
use crate::record::ActivityState;
use crate::supervisor::state::{DeadlineKind, PolicyEvent, SupervisorState, WaitOutcome};
use crate::tracing_compat::{debug, warn};
use crate::types::{
    ActivityId, ActivityType, DisplayId, Intent, ResultInfo, StackId, TaskId, Time, UserId,
    WindowingMode,
};
use std::time::Duration;

/// Reason string recorded when an activity is finished after its process
/// failed a second launch attempt.
pub const REASON_SECOND_CRASH: &str = "2nd-crash";

/// An ordered sequence of tasks on a single display.
#[derive(Debug)]
pub struct StackRecord {
    /// This record's id.
    pub id: StackId,
    /// Externally visible stack number, unique across displays.
    pub stack_num: i32,
    /// Owning display.
    pub display: DisplayId,
    /// Tasks, bottom to top.
    pub tasks: Vec<TaskId>,
    /// Windowing mode of every task in the stack.
    pub windowing_mode: WindowingMode,
    /// Role of the activities the stack hosts.
    pub activity_type: ActivityType,
    /// Sorts above non-always-on-top stacks (and below pinned).
    pub always_on_top: bool,
    /// The single resumed activity, if any.
    pub resumed: Option<ActivityId>,
    /// The single pausing activity, if any.
    pub pausing: Option<ActivityId>,
    /// The previously paused activity.
    pub last_paused: Option<ActivityId>,
    /// All contained activities, least recently used first.
    pub lru: Vec<ActivityId>,
    /// Activities waiting to be told they are visible.
    pub waiting_visible: Vec<ActivityId>,
    /// Paused activities waiting for an idle tick to be stopped.
    pub stopping: Vec<ActivityId>,
    /// Activities paused because the display went to sleep.
    pub going_to_sleep: Vec<ActivityId>,
    /// Finishing activities whose destruction awaits their successor.
    pub finishing: Vec<ActivityId>,
    /// Launch waiters blocked until the next activity resumes.
    pub waiting_launched: Vec<u64>,
    /// Launch waiters blocked until the top activity reports visible.
    pub waiting_visible_waiters: Vec<u64>,
    /// The stack's display is asleep.
    pub sleeping: bool,
    /// Start of the current activity launch (for `this_time`).
    pub launch_start: Time,
    /// Start of the whole launch sequence (for `total_time`).
    pub launch_sequence_start: Time,
}

impl StackRecord {
    /// Creates an empty stack.
    #[must_use]
    pub fn new(
        id: StackId,
        stack_num: i32,
        display: DisplayId,
        windowing_mode: WindowingMode,
        activity_type: ActivityType,
    ) -> Self {
        Self {
            id,
            stack_num,
            display,
            tasks: Vec::new(),
            windowing_mode,
            activity_type,
            always_on_top: windowing_mode.is_always_on_top(),
            resumed: None,
            pausing: None,
            last_paused: None,
            lru: Vec::new(),
            waiting_visible: Vec::new(),
            stopping: Vec::new(),
            going_to_sleep: Vec::new(),
            finishing: Vec::new(),
            waiting_launched: Vec::new(),
            waiting_visible_waiters: Vec::new(),
            sleeping: false,
            launch_start: Time::ZERO,
            launch_sequence_start: Time::ZERO,
        }
    }

    /// Returns the topmost task.
    #[must_use]
    pub fn top_task(&self) -> Option<TaskId> {
        self.tasks.last().copied()
    }

    /// Moves `activity` to the most-recently-used end.
    pub fn update_lru(&mut self, activity: ActivityId) {
        self.lru.retain(|&a| a != activity);
        self.lru.push(activity);
    }

    /// Drops `activity` from every transient queue.
    pub fn forget_activity(&mut self, activity: ActivityId) {
        self.lru.retain(|&a| a != activity);
        self.waiting_visible.retain(|&a| a != activity);
        self.stopping.retain(|&a| a != activity);
        self.going_to_sleep.retain(|&a| a != activity);
        self.finishing.retain(|&a| a != activity);
        if self.resumed == Some(activity) {
            self.resumed = None;
        }
        if self.pausing == Some(activity) {
            self.pausing = None;
        }
        if self.last_paused == Some(activity) {
            self.last_paused = None;
        }
    }

    /// Stamps launch-measurement start times.
    pub fn set_launch_time(&mut self, now: Time) {
        if self.launch_start == Time::ZERO {
            self.launch_start = now;
            if self.launch_sequence_start == Time::ZERO {
                self.launch_sequence_start = now;
            }
        }
    }

    fn clear_launch_times(&mut self) {
        self.launch_start = Time::ZERO;
        self.launch_sequence_start = Time::ZERO;
    }
}

impl SupervisorState {
    /// Returns the topmost activity eligible to run (in history, not
    /// finishing).
    pub(crate) fn top_running_activity(&self, stack_id: StackId) -> Option<ActivityId> {
        let stack = self.stack(stack_id).ok()?;
        for &task_id in stack.tasks.iter().rev() {
            let Ok(task) = self.task(task_id) else {
                continue;
            };
            for &activity_id in task.activities.iter().rev() {
                if let Ok(activity) = self.activity(activity_id) {
                    if activity.can_be_top() {
                        return Some(activity_id);
                    }
                }
            }
        }
        None
    }

    /// The central routine: brings the top activity of `stack_id` to
    /// RESUMED, pausing a predecessor first when necessary.
    ///
    /// Returns true if it initiated any work.
    pub(crate) fn resume_top_activity(&mut self, stack_id: StackId) -> Result<bool> {
        self.resume_top_activity_inner(stack_id, true)
    }

    fn resume_top_activity_inner(&mut self, stack_id: StackId, allow_home: bool) -> Result<bool> {
        if self.sleeping {
            return Ok(false);
        }
        // Only the focused stack and display-top stacks resume; back stacks
        // stay paused until they come forward again.
        let display_top = self.display(self.stack(stack_id)?.display)?.top_stack();
        if self.focused_stack != Some(stack_id) && display_top != Some(stack_id) {
            return Ok(false);
        }

        let Some(top) = self.top_running_activity(stack_id) else {
            // Nothing to run here; the display's home stack takes over.
            if allow_home {
                let home = self.display(self.stack(stack_id)?.display)?.home_stack;
                if let Some(home) = home {
                    if home != stack_id {
                        self.focused_stack = Some(home);
                        return self.resume_top_activity_inner(home, false);
                    }
                }
            }
            return Ok(false);
        };

        let stack = self.stack(stack_id)?;
        if stack.pausing.is_some() {
            // Re-entered when the pause completes.
            return Ok(false);
        }
        if stack.resumed == Some(top) {
            self.ensure_activities_visible(stack_id)?;
            return Ok(false);
        }
        if stack.resumed.is_some() {
            // Pause strictly precedes the next resume.
            self.start_pausing(stack_id, false, false)?;
            return Ok(true);
        }

        // A stack coming forward pauses whatever is resumed elsewhere.
        self.pause_back_stacks(stack_id)?;

        let (app, state) = {
            let activity = self.activity(top)?;
            (activity.app, activity.state)
        };
        let process_active = app
            .and_then(|p| self.process(p).ok())
            .is_some_and(crate::record::ProcessRecord::is_active);

        if process_active && state != ActivityState::Initializing {
            // Already launched into its process; schedule a plain resume.
            self.deliver_pending_and_resume(top)?;
        } else {
            self.start_specific_activity(top, true)?;
        }
        Ok(true)
    }

    /// Pauses the resumed activity of every other stack.
    fn pause_back_stacks(&mut self, resuming_stack: StackId) -> Result<()> {
        let others: Vec<StackId> = self
            .stacks
            .iter()
            .filter(|(index, stack)| {
                stack.resumed.is_some() && StackId::from_arena(*index) != resuming_stack
            })
            .map(|(index, _)| StackId::from_arena(index))
            .collect();
        for other in others {
            self.start_pausing(other, false, false)?;
        }
        Ok(())
    }

    /// Delivers queued results/intents and schedules the resume of an
    /// already-launched activity. Falls back to a full restart if the remote
    /// call fails.
    fn deliver_pending_and_resume(&mut self, activity_id: ActivityId) -> Result<()> {
        let (process_id, results, new_intents) = {
            let activity = self.activity_mut(activity_id)?;
            let (results, new_intents) = activity.take_pending_deliveries();
            (activity.app, results, new_intents)
        };
        let thread = process_id
            .and_then(|p| self.process(p).ok())
            .and_then(|p| p.thread.clone());
        let Some(thread) = thread else {
            return self.start_specific_activity(activity_id, true);
        };

        let mut remote_ok = true;
        if !results.is_empty() {
            remote_ok &= thread.schedule_send_result(activity_id, &results).is_ok();
        }
        for intent in &new_intents {
            remote_ok &= thread.schedule_new_intent(activity_id, intent).is_ok();
        }
        remote_ok &= thread.schedule_resume_activity(activity_id, true).is_ok();

        if remote_ok {
            self.minimal_resume(activity_id)?;
            Ok(())
        } else {
            warn!(activity = %activity_id, "resume call failed; restarting host process");
            self.start_specific_activity(activity_id, true)
        }
    }

    /// Completes the bookkeeping of a resume: state, stack pointers, LRU,
    /// launch-waiter satisfaction, deferred destruction, and visibility.
    pub(crate) fn minimal_resume(&mut self, activity_id: ActivityId) -> Result<()> {
        let stack_id = self.stack_of(activity_id)?;
        {
            let activity = self.activity_mut(activity_id)?;
            activity.set_state(ActivityState::Resumed, "resume");
            activity.idle = false;
            activity.stopped = false;
            activity.sleeping = false;
        }
        {
            let stack = self.stack_mut(stack_id)?;
            stack.resumed = Some(activity_id);
            stack.update_lru(activity_id);
            stack.stopping.retain(|&a| a != activity_id);
            stack.going_to_sleep.retain(|&a| a != activity_id);
        }
        self.report_activity_launched(stack_id, activity_id)?;
        self.destroy_deferred_finishers(stack_id)?;
        self.ensure_activities_visible(stack_id)?;
        self.update_oom_adjustments();
        Ok(())
    }

    /// Satisfies launch waiters once the activity reached RESUMED.
    fn report_activity_launched(&mut self, stack_id: StackId, activity_id: ActivityId) -> Result<()> {
        let now = self.now();
        let (waiters, this_time, total_time) = {
            let stack = self.stack_mut(stack_id)?;
            if stack.waiting_launched.is_empty() {
                stack.clear_launch_times();
                return Ok(());
            }
            let this_time = if stack.launch_start == Time::ZERO {
                Duration::ZERO
            } else {
                now.duration_since(stack.launch_start)
            };
            let total_time = if stack.launch_sequence_start == Time::ZERO {
                Duration::ZERO
            } else {
                now.duration_since(stack.launch_sequence_start)
            };
            stack.clear_launch_times();
            (std::mem::take(&mut stack.waiting_launched), this_time, total_time)
        };
        let component = self.activity(activity_id)?.component.clone();
        for waiter in waiters {
            self.satisfy_waiter(
                waiter,
                WaitOutcome {
                    component: component.clone(),
                    this_time,
                    total_time,
                },
            );
        }
        Ok(())
    }

    /// Transitions the resumed activity to PAUSING and schedules the pause
    /// into its process.
    pub(crate) fn start_pausing(
        &mut self,
        stack_id: StackId,
        user_leaving: bool,
        ui_sleeping: bool,
    ) -> Result<bool> {
        let Some(prev) = self.stack(stack_id)?.resumed else {
            return Ok(false);
        };
        {
            let stack = self.stack_mut(stack_id)?;
            stack.resumed = None;
            stack.pausing = Some(prev);
        }
        let (finishing, app) = {
            let activity = self.activity_mut(prev)?;
            activity.set_state(ActivityState::Pausing, "pause");
            if ui_sleeping {
                activity.sleeping = true;
            }
            (activity.finishing, activity.app)
        };
        let thread = app
            .and_then(|p| self.process(p).ok())
            .and_then(|p| p.thread.clone());

        match thread {
            Some(thread) => {
                if thread
                    .schedule_pause_activity(prev, finishing, user_leaving)
                    .is_ok()
                {
                    self.arm_deadline(DeadlineKind::Pause(prev), self.config.pause_timeout);
                } else {
                    // Dead process cannot report back; treat the pause as done.
                    warn!(activity = %prev, "pause call failed; completing pause locally");
                    self.complete_pause(prev)?;
                }
            }
            None => {
                self.complete_pause(prev)?;
            }
        }
        Ok(true)
    }

    /// Pause completion, from the process or a deadline expiry.
    pub(crate) fn complete_pause(&mut self, activity_id: ActivityId) -> Result<()> {
        self.cancel_deadline(DeadlineKind::Pause(activity_id));
        let stack_id = self.stack_of(activity_id)?;
        {
            let stack = self.stack_mut(stack_id)?;
            if stack.pausing == Some(activity_id) {
                stack.pausing = None;
                stack.last_paused = Some(activity_id);
            }
        }
        let finishing = {
            let activity = self.activity_mut(activity_id)?;
            if activity.state == ActivityState::Pausing {
                activity.set_state(ActivityState::Paused, "pause complete");
            }
            activity.finishing
        };

        if finishing {
            self.finish_current_activity(activity_id)?;
        } else {
            let sleeping = self.stack(stack_id)?.sleeping;
            let stack = self.stack_mut(stack_id)?;
            if sleeping {
                stack.going_to_sleep.push(activity_id);
            } else {
                stack.stopping.push(activity_id);
            }
        }

        // The successor's resume was gated on this pause.
        self.resume_top_activity(stack_id)?;
        Ok(())
    }

    pub(crate) fn pause_timed_out(&mut self, activity_id: ActivityId) {
        let still_pausing = self
            .activity(activity_id)
            .map(|a| a.state == ActivityState::Pausing)
            .unwrap_or(false);
        if still_pausing {
            warn!(activity = %activity_id, "pause deadline expired; forcing PAUSED");
            let _ = self.complete_pause(activity_id);
        }
    }

    /// Idle report from a process: the moment deferred stops and destroys
    /// are carried out.
    pub(crate) fn activity_idle(&mut self, activity_id: ActivityId) -> Result<()> {
        if let Ok(activity) = self.activity_mut(activity_id) {
            activity.idle = true;
        }
        let stack_id = self.stack_of(activity_id)?;
        self.report_top_visible(stack_id)?;

        let to_stop = {
            let stack = self.stack_mut(stack_id)?;
            std::mem::take(&mut stack.stopping)
        };
        for candidate in to_stop {
            self.schedule_stop(candidate)?;
        }
        self.destroy_deferred_finishers(stack_id)?;
        Ok(())
    }

    /// Schedules a stop into the hosting process.
    pub(crate) fn schedule_stop(&mut self, activity_id: ActivityId) -> Result<()> {
        let (state, visible, thread) = {
            let activity = self.activity(activity_id)?;
            let thread = activity
                .app
                .and_then(|p| self.processes.get(p.arena_index()))
                .and_then(|p| p.thread.clone());
            (activity.state, activity.visible, thread)
        };
        if state != ActivityState::Paused {
            return Ok(());
        }
        match thread {
            Some(thread) => {
                self.activity_mut(activity_id)?
                    .set_state(ActivityState::Stopping, "stop");
                if thread.schedule_stop_activity(activity_id, visible).is_ok() {
                    self.arm_deadline(DeadlineKind::Stop(activity_id), self.config.stop_timeout);
                } else {
                    self.activity_stopped(activity_id, None)?;
                }
            }
            None => {
                self.activity_stopped(activity_id, None)?;
            }
        }
        Ok(())
    }

    /// Stop completion, from the process or a deadline expiry.
    pub(crate) fn activity_stopped(
        &mut self,
        activity_id: ActivityId,
        saved_state: Option<Vec<u8>>,
    ) -> Result<()> {
        self.cancel_deadline(DeadlineKind::Stop(activity_id));
        let finishing = {
            let activity = self.activity_mut(activity_id)?;
            if saved_state.is_some() {
                activity.saved_state = saved_state;
            }
            if matches!(
                activity.state,
                ActivityState::Stopping | ActivityState::Paused
            ) {
                activity.set_state(ActivityState::Stopped, "stop complete");
            }
            activity.stopped = true;
            activity.finishing
        };
        if finishing {
            self.destroy_activity(activity_id, "finish-after-stop")?;
        }
        Ok(())
    }

    pub(crate) fn stop_timed_out(&mut self, activity_id: ActivityId) {
        let overdue = self
            .activity(activity_id)
            .map(|a| a.state == ActivityState::Stopping)
            .unwrap_or(false);
        if overdue {
            warn!(activity = %activity_id, "stop deadline expired; forcing STOPPED");
            let _ = self.activity_stopped(activity_id, None);
        }
    }

    /// Requests an activity finish. Returns false if it was already
    /// finishing.
    pub(crate) fn finish_activity(
        &mut self,
        activity_id: ActivityId,
        result_code: i32,
        result_data: Option<Intent>,
        reason: &str,
    ) -> Result<bool> {
        let (already, state, result_to, result_who, request_code) = {
            let activity = self.activity(activity_id)?;
            (
                activity.finishing,
                activity.state,
                activity.result_to,
                activity.result_who.clone(),
                activity.request_code,
            )
        };
        if already {
            return Ok(false);
        }
        debug!(activity = %activity_id, reason, "finishing activity");
        self.activity_mut(activity_id)?.finishing = true;

        if let Some(receiver) = result_to {
            if request_code >= 0 {
                self.send_activity_result(
                    receiver,
                    ResultInfo {
                        result_who,
                        request_code,
                        result_code,
                        data: result_data,
                    },
                )?;
            }
        }

        let stack_id = self.stack_of(activity_id)?;
        let (resumed, pausing) = {
            let stack = self.stack(stack_id)?;
            (stack.resumed, stack.pausing)
        };
        if resumed == Some(activity_id) {
            // Pause first; the finish continues from complete_pause.
            self.start_pausing(stack_id, false, false)?;
        } else if pausing != Some(activity_id) {
            if state == ActivityState::Initializing {
                self.remove_activity_from_history(activity_id)?;
                self.resume_top_activity(stack_id)?;
            } else {
                self.finish_current_activity(activity_id)?;
            }
        }
        Ok(true)
    }

    /// Destroys a finishing activity now if its successor is already
    /// resumed; otherwise parks it on the finishing queue with a deadline.
    pub(crate) fn finish_current_activity(&mut self, activity_id: ActivityId) -> Result<()> {
        let stack_id = self.stack_of(activity_id)?;
        let successor_resumed = self.stack(stack_id)?.resumed.is_some();
        if successor_resumed {
            self.destroy_activity(activity_id, "finish")?;
        } else {
            self.activity_mut(activity_id)?
                .set_state(ActivityState::Finishing, "finish deferred");
            self.stack_mut(stack_id)?.finishing.push(activity_id);
            self.arm_deadline(
                DeadlineKind::Destroy(activity_id),
                self.config.destroy_timeout,
            );
            self.resume_top_activity(stack_id)?;
        }
        Ok(())
    }

    /// Destroys every queued finisher whose successor has now resumed.
    fn destroy_deferred_finishers(&mut self, stack_id: StackId) -> Result<()> {
        let ready = {
            let stack = self.stack_mut(stack_id)?;
            if stack.resumed.is_none() {
                return Ok(());
            }
            std::mem::take(&mut stack.finishing)
        };
        for finisher in ready {
            self.destroy_activity(finisher, "finish-after-resume")?;
        }
        Ok(())
    }

    /// Schedules destruction into the process, or removes the record
    /// directly when no process is attached.
    pub(crate) fn destroy_activity(&mut self, activity_id: ActivityId, reason: &str) -> Result<()> {
        self.cancel_deadline(DeadlineKind::Destroy(activity_id));
        let thread = {
            let activity = self.activity(activity_id)?;
            activity
                .app
                .and_then(|p| self.processes.get(p.arena_index()))
                .and_then(|p| p.thread.clone())
        };
        match thread {
            Some(thread) => {
                self.activity_mut(activity_id)?
                    .set_state(ActivityState::Destroying, reason);
                if thread.schedule_destroy_activity(activity_id, true).is_ok() {
                    self.arm_deadline(
                        DeadlineKind::Destroy(activity_id),
                        self.config.destroy_timeout,
                    );
                } else {
                    self.remove_activity_from_history(activity_id)?;
                }
            }
            None => {
                self.remove_activity_from_history(activity_id)?;
            }
        }
        Ok(())
    }

    /// Destruction acknowledged by the process.
    pub(crate) fn activity_destroyed(&mut self, activity_id: ActivityId) -> Result<()> {
        self.cancel_deadline(DeadlineKind::Destroy(activity_id));
        let stack_id = self.stack_of(activity_id)?;
        self.remove_activity_from_history(activity_id)?;
        self.resume_top_activity(stack_id)?;
        Ok(())
    }

    /// A destroy deadline expired: a queued finisher is destroyed anyway; a
    /// scheduled destroy that was never acknowledged kills the process.
    pub(crate) fn destroy_timed_out(&mut self, activity_id: ActivityId) {
        let Ok(activity) = self.activity(activity_id) else {
            return;
        };
        match activity.state {
            ActivityState::Finishing => {
                warn!(activity = %activity_id, "deferred finish overdue; destroying now");
                let _ = self.destroy_activity(activity_id, "destroy-timeout");
            }
            ActivityState::Destroying => {
                warn!(activity = %activity_id, "destroy unacknowledged; killing process");
                if let Some(process) = activity.app {
                    let _ = self.kill_process(process, "destroy timeout");
                } else {
                    let _ = self.remove_activity_from_history(activity_id);
                }
            }
            _ => {}
        }
    }

    /// Takes an activity out of history: detaches it from its process, task,
    /// stack queues, and the arena. Destroys the task when it empties.
    pub(crate) fn remove_activity_from_history(&mut self, activity_id: ActivityId) -> Result<()> {
        let (task_id, process) = {
            let activity = self.activity_mut(activity_id)?;
            activity.set_state(ActivityState::Destroyed, "remove from history");
            (activity.task, activity.app.take())
        };
        if let Some(process) = process {
            if let Some(record) = self.processes.get_mut(process.arena_index()) {
                record.activities.retain(|&a| a != activity_id);
            }
        }

        let stack_id = self.task(task_id)?.stack;
        self.stack_mut(stack_id)?.forget_activity(activity_id);

        let task_empty = {
            let task = self.task_mut(task_id)?;
            task.remove_activity(activity_id);
            task.is_empty()
        };
        if task_empty {
            // Removing the last activity destroys the task.
            self.stack_mut(stack_id)?.tasks.retain(|&t| t != task_id);
            self.tasks.remove(task_id.arena_index());
            debug!(task = %task_id, stack = %stack_id, "task removed with last activity");
        }
        self.activities.remove(activity_id.arena_index());
        Ok(())
    }

    /// Queues (or directly delivers) a result on the receiving activity.
    pub(crate) fn send_activity_result(
        &mut self,
        receiver: ActivityId,
        result: ResultInfo,
    ) -> Result<()> {
        let (state, thread) = {
            let Ok(activity) = self.activity(receiver) else {
                return Ok(());
            };
            let thread = activity
                .app
                .and_then(|p| self.processes.get(p.arena_index()))
                .and_then(|p| p.thread.clone());
            (activity.state, thread)
        };
        if state == ActivityState::Resumed {
            if let Some(thread) = thread {
                if thread
                    .schedule_send_result(receiver, std::slice::from_ref(&result))
                    .is_ok()
                {
                    return Ok(());
                }
            }
        }
        self.activity_mut(receiver)?.add_result(result);
        Ok(())
    }

    /// Queues (or directly delivers) a new intent on a running activity.
    pub(crate) fn deliver_new_intent(&mut self, receiver: ActivityId, intent: Intent) -> Result<()> {
        let (state, thread) = {
            let activity = self.activity(receiver)?;
            let thread = activity
                .app
                .and_then(|p| self.processes.get(p.arena_index()))
                .and_then(|p| p.thread.clone());
            (activity.state, thread)
        };
        if state == ActivityState::Resumed {
            if let Some(thread) = thread {
                if thread.schedule_new_intent(receiver, &intent).is_ok() {
                    return Ok(());
                }
            }
        }
        self.activity_mut(receiver)?.add_new_intent(intent);
        Ok(())
    }

    // === Visibility ===

    /// Recomputes visibility for every activity in the stack and pushes
    /// changes to the window manager.
    pub(crate) fn ensure_activities_visible(&mut self, stack_id: StackId) -> Result<()> {
        let stack_visible = self.stack_visible_on_display(stack_id)?;
        let task_ids = self.stack(stack_id)?.tasks.clone();

        let mut behind_opaque = false;
        let mut changes: Vec<(ActivityId, bool)> = Vec::new();
        for task_id in task_ids.iter().rev() {
            let activity_ids = self.task(*task_id)?.activities.clone();
            for activity_id in activity_ids.iter().rev() {
                let Ok(activity) = self.activity(*activity_id) else {
                    continue;
                };
                if !activity.in_history() {
                    continue;
                }
                let target = stack_visible && !behind_opaque && !activity.finishing;
                if activity.fullscreen && !activity.finishing {
                    behind_opaque = true;
                }
                if activity.visible != target {
                    changes.push((*activity_id, target));
                }
            }
        }

        for (activity_id, visible) in changes {
            self.window.set_app_visibility(activity_id, visible);
            if let Ok(activity) = self.activity_mut(activity_id) {
                activity.visible = visible;
            }
        }
        self.report_top_visible(stack_id)?;
        Ok(())
    }

    /// Marks the top activity as having reported visible and satisfies
    /// visible-waiters.
    pub(crate) fn report_top_visible(&mut self, stack_id: StackId) -> Result<()> {
        let Some(top) = self.top_running_activity(stack_id) else {
            return Ok(());
        };
        let (visible, state, component) = {
            let activity = self.activity(top)?;
            (
                activity.visible,
                activity.state,
                activity.component.clone(),
            )
        };
        if !visible
            || !matches!(state, ActivityState::Resumed | ActivityState::Paused)
        {
            return Ok(());
        }
        self.activity_mut(top)?.now_visible = true;

        let waiters = {
            let stack = self.stack_mut(stack_id)?;
            std::mem::take(&mut stack.waiting_visible_waiters)
        };
        let now = self.now();
        for waiter in waiters {
            let started = self
                .waiters
                .get(&waiter)
                .map_or(now, |w| w.started);
            self.satisfy_waiter(
                waiter,
                WaitOutcome {
                    component: component.clone(),
                    this_time: now.duration_since(started),
                    total_time: now.duration_since(started),
                },
            );
        }
        Ok(())
    }

    /// Returns true unless an opaque fullscreen stack above fully covers
    /// this stack on its display. The pinned stack always floats.
    pub(crate) fn stack_visible_on_display(&self, stack_id: StackId) -> Result<bool> {
        let stack = self.stack(stack_id)?;
        if stack.windowing_mode == WindowingMode::Pinned {
            return Ok(true);
        }
        let display = self.display(stack.display)?;
        let Some(position) = display.stacks.iter().position(|&s| s == stack_id) else {
            return Ok(false);
        };
        for &above_id in &display.stacks[position + 1..] {
            let Ok(above) = self.stack(above_id) else {
                continue;
            };
            if above.windowing_mode != WindowingMode::Fullscreen {
                continue;
            }
            if let Some(top) = self.top_running_activity(above_id) {
                if self.activity(top)?.fullscreen {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    // === Sleep ===

    /// Starts pausing the resumed activity because the device is going to
    /// sleep or shutting down.
    pub(crate) fn stop_if_sleeping(&mut self, stack_id: StackId) -> Result<()> {
        {
            let stack = self.stack_mut(stack_id)?;
            stack.sleeping = true;
        }
        if self.stack(stack_id)?.resumed.is_some() {
            self.start_pausing(stack_id, false, true)?;
        }
        Ok(())
    }

    /// Clears sleep state and queues formerly sleeping activities for stop.
    pub(crate) fn awake_from_sleeping(&mut self, stack_id: StackId) -> Result<()> {
        let asleep = {
            let stack = self.stack_mut(stack_id)?;
            stack.sleeping = false;
            std::mem::take(&mut stack.going_to_sleep)
        };
        for activity_id in asleep {
            if let Ok(activity) = self.activity_mut(activity_id) {
                activity.sleeping = false;
            }
            self.stack_mut(stack_id)?.stopping.push(activity_id);
        }
        Ok(())
    }

    // === Task movement ===

    /// Moves a task to the top of its stack and resumes.
    pub(crate) fn move_task_to_front(&mut self, task_id: TaskId) -> Result<()> {
        let stack_id = self.task(task_id)?.stack;
        {
            let stack = self.stack_mut(stack_id)?;
            stack.tasks.retain(|&t| t != task_id);
            stack.tasks.push(task_id);
        }
        let display = self.stack(stack_id)?.display;
        self.push_event(PolicyEvent::StackOrderChanged(display));
        self.focused_stack = Some(stack_id);
        self.resume_top_activity(stack_id)?;
        Ok(())
    }

    /// Resumes the top activity of the top stack on every display.
    pub(crate) fn resume_top_activities(&mut self) -> Result<()> {
        let tops: Vec<StackId> = self
            .displays
            .values()
            .filter_map(|d| d.stacks.last().copied())
            .collect();
        for stack_id in tops {
            self.resume_top_activity(stack_id)?;
        }
        Ok(())
    }

    /// Finishes every activity of `user` across all stacks.
    pub(crate) fn finish_user_activities(&mut self, user: UserId) -> Result<()> {
        let doomed: Vec<ActivityId> = self
            .activities
            .iter()
            .filter(|(_, a)| a.user == user && a.in_history())
            .map(|(idx, _)| ActivityId::from_arena(idx))
            .collect();
        for activity_id in doomed {
            if self.activities.get(activity_id.arena_index()).is_some() {
                self.remove_activity_from_history(activity_id)?;
            }
        }
        self.resume_top_activities()
    }
}
