//! Process registry: start, attach, LRU, death, and OOM bookkeeping.
//!
//! Processes are created on first need, become *active* when their hosting
//! thread attaches, and are torn down on kill or death notification. The
//! coupling to activity state lives here: a launch into a process that fails
//! once triggers a restart and retry; a second failure in the same attempt
//! finishes the activity.

pub mod oom;

use crate::error::{Error, ErrorKind, Result};
use crate::external::ActivityLaunch;
use crate::record::{ActivityState, ProcessRecord, ProcessState, ServiceRecord};
use crate::stack::REASON_SECOND_CRASH;
use crate::supervisor::state::SupervisorState;
use crate::tracing_compat::{debug, info, warn};
use crate::types::{ActivityId, ActivityType, ApplicationInfo, ProcessId, UserId, RESULT_CANCELED};
use oom::OomLevels;
use std::sync::Arc;

impl SupervisorState {
    /// Looks up a process by its `(name, uid)` identity.
    pub(crate) fn process_id_for(&self, process_name: &str, uid: i32) -> Option<ProcessId> {
        self.process_names
            .get(&(process_name.to_string(), uid))
            .copied()
    }

    /// Returns the existing record for `(name, uid)` or creates one.
    pub(crate) fn get_or_create_process(
        &mut self,
        process_name: &str,
        info: &ApplicationInfo,
        user: UserId,
    ) -> ProcessId {
        if let Some(existing) = self.process_id_for(process_name, info.uid) {
            return existing;
        }
        let index = self.processes.insert(ProcessRecord::new(
            ProcessId::new_for_test(0, 0),
            process_name.to_string(),
            info.clone(),
            user,
        ));
        let id = ProcessId::from_arena(index);
        self.processes
            .get_mut(index)
            .expect("freshly inserted process")
            .id = id;
        self.process_names
            .insert((process_name.to_string(), info.uid), id);
        self.process_lru.push(id);
        id
    }

    /// Ensures a process exists and is being forked for `(name, uid)`.
    ///
    /// An explicit activity launch into a bad process clears the bad mark
    /// and its crash clock; any other hosting purpose is refused while the
    /// process is bad.
    pub(crate) fn start_process_locked(
        &mut self,
        process_name: &str,
        info: &ApplicationInfo,
        user: UserId,
        hosting_type: &str,
        hosting_name: &str,
    ) -> Result<ProcessId> {
        if self.app_errors.is_bad_process(process_name, info.uid) {
            if hosting_type == "activity" {
                info!(process = process_name, uid = info.uid, "explicit launch clears bad mark");
                self.app_errors.clear_bad_process(process_name, info.uid);
                self.app_errors.reset_process_crash_time(process_name, info.uid);
            } else {
                return Err(Error::new(ErrorKind::QuotaExceeded).with_context(format!(
                    "refusing to start bad process {process_name}/{}",
                    info.uid
                )));
            }
        }

        let id = self.get_or_create_process(process_name, info, user);
        {
            let record = self.process(id)?;
            if record.is_active() {
                return Ok(id);
            }
        }
        let spawn = self
            .launcher
            .spawn_process(process_name, info, hosting_type, hosting_name);
        match spawn {
            Ok(pid) => {
                let record = self.process_mut(id)?;
                record.pid = Some(pid);
                record.bad = false;
                record.killed = false;
                debug!(process = %id, name = process_name, pid, hosting_type, "process forked");
                Ok(id)
            }
            Err(err) => {
                warn!(process = process_name, error = %err, "process start failed");
                Err(Error::new(ErrorKind::ProcessStartFailed)
                    .with_context(format!("could not fork {process_name}")))
            }
        }
    }

    /// A forked process registered its thread. Scans every stack for a
    /// top activity waiting on this process and starts it.
    ///
    /// Returns true if any activity launch was driven by the attach.
    pub(crate) fn attach_application_locked(
        &mut self,
        process_name: &str,
        uid: i32,
        pid: i32,
        thread: Arc<dyn crate::external::ApplicationThread>,
    ) -> Result<bool> {
        let Some(process_id) = self.process_id_for(process_name, uid) else {
            return Err(Error::new(ErrorKind::StaleRecord)
                .with_context(format!("attach from unknown process {process_name}/{uid}")));
        };
        self.process_mut(process_id)?.make_active(pid, thread);
        self.update_process_lru(process_id);

        let mut did_something = false;
        let stack_ids: Vec<_> = self.stacks.iter().map(|(idx, _)| idx).collect();
        for stack_index in stack_ids {
            let stack_id = crate::types::StackId::from_arena(stack_index);
            let Some(top) = self.top_running_activity(stack_id) else {
                continue;
            };
            let matches = {
                let activity = self.activity(top)?;
                activity.app.is_none()
                    && activity.process_name == process_name
                    && activity.info.application.uid == uid
            };
            if matches {
                match self.real_start_activity(top, process_id, true) {
                    Ok(started) => did_something |= started,
                    Err(err) => {
                        warn!(activity = %top, error = %err, "start on attach failed");
                    }
                }
            } else {
                self.ensure_activities_visible(stack_id)?;
            }
        }
        self.update_oom_adjustments();
        Ok(did_something)
    }

    /// Launches an activity into an attached process.
    ///
    /// The first remote failure marks the attempt and asks for a process
    /// restart; the second failure within the same attempt finishes the
    /// activity with a cancelled result.
    pub(crate) fn real_start_activity(
        &mut self,
        activity_id: ActivityId,
        process_id: ProcessId,
        and_resume: bool,
    ) -> Result<bool> {
        let thread = self
            .process(process_id)?
            .thread
            .clone()
            .ok_or_else(|| Error::new(ErrorKind::LaunchFailed).with_context("process not attached"))?;

        let now = self.now();
        let stack_id = self.stack_of(activity_id)?;
        self.stack_mut(stack_id)?.set_launch_time(now);

        // The window side learns about the incoming surface before the
        // process does, and gets a chance to re-evaluate orientation for
        // the new top.
        self.window.set_app_visibility(activity_id, true);
        self.window.update_orientation();

        let launch = {
            let activity = self.activity_mut(activity_id)?;
            activity.note_launch(now);
            activity.app = Some(process_id);
            activity.sleeping = false;
            let (results, new_intents) = if and_resume {
                activity.take_pending_deliveries()
            } else {
                (Vec::new(), Vec::new())
            };
            ActivityLaunch {
                token: activity_id,
                intent: activity.intent.clone(),
                info: activity.info.clone(),
                saved_state: activity.saved_state.clone(),
                results,
                new_intents,
                not_resumed: !and_resume,
                is_forward: true,
            }
        };
        {
            let record = self.process_mut(process_id)?;
            if !record.hosts_activity(activity_id) {
                record.activities.push(activity_id);
            }
        }
        self.update_process_lru(process_id);

        match thread.schedule_launch_activity(&launch) {
            Ok(()) => {
                {
                    let activity = self.activity_mut(activity_id)?;
                    activity.launch_failed = false;
                }
                self.stack_mut(stack_id)?.update_lru(activity_id);
                self.note_heavyweight(process_id)?;
                if and_resume {
                    self.minimal_resume(activity_id)?;
                } else {
                    // Starting in the background: looks like it already
                    // paused and stopped.
                    let activity = self.activity_mut(activity_id)?;
                    activity.set_state(ActivityState::Stopped, "background start");
                    activity.stopped = true;
                }
                Ok(true)
            }
            Err(err) => {
                let second = self.activity(activity_id)?.launch_failed;
                if second {
                    warn!(activity = %activity_id, error = %err, "second launch failure; giving up");
                    self.handle_app_died(process_id, false)?;
                    if self.activities.get(activity_id.arena_index()).is_some() {
                        self.finish_activity(
                            activity_id,
                            RESULT_CANCELED,
                            None,
                            REASON_SECOND_CRASH,
                        )?;
                    }
                    Err(Error::new(ErrorKind::CrashFatal).with_context(REASON_SECOND_CRASH))
                } else {
                    warn!(activity = %activity_id, error = %err, "launch failed; will restart process");
                    {
                        let activity = self.activity_mut(activity_id)?;
                        activity.launch_failed = true;
                        activity.app = None;
                    }
                    // A failed remote call means the process side is gone;
                    // detach it so the retry forks a fresh one.
                    {
                        let record = self.process_mut(process_id)?;
                        record.activities.retain(|&a| a != activity_id);
                        record.make_inactive();
                    }
                    Err(Error::new(ErrorKind::LaunchFailed).with_context("launch call failed"))
                }
            }
        }
    }

    /// Starts `activity_id`, forking its hosting process first if necessary.
    pub(crate) fn start_specific_activity(
        &mut self,
        activity_id: ActivityId,
        and_resume: bool,
    ) -> Result<()> {
        let (process_name, uid, app_info, user, hosting_name) = {
            let activity = self.activity(activity_id)?;
            (
                activity.process_name.clone(),
                activity.info.application.uid,
                activity.info.application.clone(),
                activity.user,
                activity.component.flatten(),
            )
        };
        let now = self.now();
        let stack_id = self.stack_of(activity_id)?;
        self.stack_mut(stack_id)?.set_launch_time(now);

        if let Some(process_id) = self.process_id_for(&process_name, uid) {
            if self.process(process_id)?.is_active() {
                match self.real_start_activity(activity_id, process_id, and_resume) {
                    Ok(_) => return Ok(()),
                    Err(err) if err.kind() == ErrorKind::LaunchFailed => {
                        // First failure: fall through to restart the process.
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        match self.start_process_locked(&process_name, &app_info, user, "activity", &hosting_name) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == ErrorKind::ProcessStartFailed => {
                // Transient: the activity stays INITIALIZING and is retried
                // when a process becomes available.
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn note_heavyweight(&mut self, process_id: ProcessId) -> Result<()> {
        let record = self.process(process_id)?;
        if record.info.cant_save_state && record.process_name == record.info.package {
            if let Some(existing) = self.heavy_weight_process {
                if existing != process_id {
                    warn!(new = %process_id, old = %existing,
                        "starting heavyweight process while another is running");
                }
            }
            self.heavy_weight_process = Some(process_id);
        }
        Ok(())
    }

    /// Death notification: detaches the process and fans the cleanup out to
    /// every stack. Activities at their task's root position survive when a
    /// restart is in flight; everything else leaves history.
    pub(crate) fn handle_app_died(&mut self, process_id: ProcessId, restarting: bool) -> Result<()> {
        let (hosted, persistent) = {
            let record = self.process_mut(process_id)?;
            record.make_inactive();
            (std::mem::take(&mut record.activities), record.persistent)
        };
        if self.heavy_weight_process == Some(process_id) {
            self.heavy_weight_process = None;
        }

        for activity_id in hosted {
            let Ok(activity) = self.activity(activity_id) else {
                continue;
            };
            let task_id = activity.task;
            let keep = restarting && self.task(task_id).map(|t| t.is_root(activity_id)).unwrap_or(false);
            let stack_id = self.stack_of(activity_id)?;
            if keep {
                let activity = self.activity_mut(activity_id)?;
                activity.app = None;
                activity.visible = false;
                activity.now_visible = false;
                activity.set_state(ActivityState::Initializing, "app died, awaiting restart");
                let stack = self.stack_mut(stack_id)?;
                if stack.resumed == Some(activity_id) {
                    stack.resumed = None;
                }
                if stack.pausing == Some(activity_id) {
                    stack.pausing = None;
                }
            } else {
                self.remove_activity_from_history(activity_id)?;
            }
        }

        if !restarting && !persistent {
            self.remove_process_record(process_id)?;
        }
        self.resume_top_activities()?;
        self.update_oom_adjustments();
        Ok(())
    }

    fn remove_process_record(&mut self, process_id: ProcessId) -> Result<()> {
        let (name, uid) = {
            let record = self.process(process_id)?;
            (record.process_name.clone(), record.uid)
        };
        self.process_names.remove(&(name, uid));
        self.process_lru.retain(|&p| p != process_id);
        self.processes.remove(process_id.arena_index());
        Ok(())
    }

    /// Kills a process and runs the death path immediately.
    pub(crate) fn kill_process(&mut self, process_id: ProcessId, reason: &str) -> Result<()> {
        let pid = {
            let record = self.process_mut(process_id)?;
            record.note_killed(true);
            record.pid
        };
        if let Some(pid) = pid {
            info!(process = %process_id, pid, reason, "killing process");
            self.launcher.kill_process(pid, reason);
        }
        self.handle_app_died(process_id, false)
    }

    /// Moves a process to the most-recently-used end.
    pub(crate) fn update_process_lru(&mut self, process_id: ProcessId) {
        let now = self.now();
        self.process_lru.retain(|&p| p != process_id);
        self.process_lru.push(process_id);
        if let Some(record) = self.processes.get_mut(process_id.arena_index()) {
            record.last_activity_time = now;
        }
    }

    /// Registers a hosted service, for crash policy and importance.
    pub(crate) fn note_service_running(
        &mut self,
        process_id: ProcessId,
        name: &str,
        foreground: bool,
    ) -> Result<()> {
        let now = self.now();
        let record = self.process_mut(process_id)?;
        if let Some(existing) = record.services.iter_mut().find(|s| s.name == name) {
            existing.foreground = foreground;
            existing.restart_time = now;
        } else {
            record.services.push(ServiceRecord {
                name: name.to_string(),
                foreground,
                restart_time: now,
                crash_count: 0,
            });
        }
        Ok(())
    }

    // === OOM adjustment ===

    /// Recomputes every process's adjustment from what it hosts. LRU order
    /// within a bucket is left to the external killer.
    pub(crate) fn update_oom_adjustments(&mut self) {
        let resumed: Vec<ActivityId> = self
            .stacks
            .iter()
            .filter_map(|(_, s)| s.resumed)
            .collect();

        let mut computed: Vec<(ProcessId, i32, ProcessState)> = Vec::new();
        for (index, record) in self.processes.iter() {
            let id = ProcessId::from_arena(index);
            if !record.is_active() {
                continue;
            }
            let (raw, state) = if record.persistent {
                (oom::PERSISTENT_PROC_ADJ, ProcessState::Persistent)
            } else if record.activities.iter().any(|a| resumed.contains(a)) {
                (oom::FOREGROUND_APP_ADJ, ProcessState::Top)
            } else if record
                .activities
                .iter()
                .any(|&a| self.activity(a).map(|r| r.visible).unwrap_or(false))
            {
                (oom::VISIBLE_APP_ADJ, ProcessState::Visible)
            } else if record.services.iter().any(|s| s.foreground) {
                (oom::PERCEPTIBLE_APP_ADJ, ProcessState::ForegroundService)
            } else if !record.services.is_empty() {
                (oom::SERVICE_ADJ, ProcessState::Service)
            } else if self.process_hosts_home(record) {
                (oom::HOME_APP_ADJ, ProcessState::Home)
            } else if record.info.cant_save_state {
                (oom::HEAVY_WEIGHT_APP_ADJ, ProcessState::Cached)
            } else {
                (oom::CACHED_APP_MIN_ADJ, ProcessState::Cached)
            };
            computed.push((id, raw, state));
        }

        for (id, raw, state) in computed {
            if let Some(record) = self.processes.get_mut(id.arena_index()) {
                record.raw_adj = raw;
                record.cur_adj = record.modify_raw_oom_adj(raw);
                record.set_adj = record.cur_adj;
                record.proc_state = state;
            }
        }
    }

    fn process_hosts_home(&self, record: &ProcessRecord) -> bool {
        record.activities.iter().any(|&a| {
            self.activity(a)
                .ok()
                .and_then(|r| self.task(r.task).ok())
                .and_then(|t| self.stack(t.stack).ok())
                .is_some_and(|s| s.activity_type == ActivityType::Home)
        })
    }

    /// Recomputes the killer table from the memory profile and writes it to
    /// the sysfs sink.
    pub(crate) fn update_oom_levels(&mut self) {
        let levels = OomLevels::compute(&self.config.memory);
        if let Err(err) = levels.write_to(&*self.lmk, &self.config.memory) {
            warn!(error = %err, "failed to write low-memory-killer table");
        }
    }
}
