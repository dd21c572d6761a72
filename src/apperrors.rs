//! Crash accounting and the bad-process policy.
//!
//! Per `(process name, uid)` the supervisor tracks last-crash timestamps, a
//! rolling crash-count window, dialog throttling, and the bad-process list.
//! The quick-crash rule: a crash within the minimum crash interval of the
//! previous one, or a crash count exceeding the windowed limit, marks the
//! process *bad*: broadcasts to it are refused and its activities are
//! finished. Persistent processes are never marked bad; isolated processes
//! have no durable identity and bypass the list entirely.

use crate::config::SupervisorConfig;
use crate::error::Result;
use crate::external::CrashReport;
use crate::record::ProcessState;
use crate::supervisor::state::{PolicyEvent, SupervisorState};
use crate::tracing_compat::{info, warn};
use crate::types::{ProcessId, Time};
use std::collections::HashMap;

type ProcessKey = (String, i32);

/// Why a process earned its bad mark.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BadProcessInfo {
    /// When the mark was applied.
    pub time: Time,
    /// One-line failure summary.
    pub short_msg: String,
    /// Full failure message.
    pub long_msg: String,
    /// Stack trace, if captured.
    pub stack: Option<String>,
}

/// Crash bookkeeping across all processes.
#[derive(Debug, Default)]
pub struct AppErrors {
    /// Last crash per process; reset on explicit process restart.
    crash_times: HashMap<ProcessKey, Time>,
    /// Last crash per process; survives restarts, cleared only by explicit
    /// command.
    crash_times_persistent: HashMap<ProcessKey, Time>,
    /// Last time the user saw an error dialog, for throttling.
    crash_show_dialog_times: HashMap<ProcessKey, Time>,
    /// Rolling window: (window start, crashes within the window).
    crash_counts: HashMap<ProcessKey, (Time, u32)>,
    /// Processes considered bad.
    bad_processes: HashMap<ProcessKey, BadProcessInfo>,
}

impl AppErrors {
    /// Creates empty bookkeeping.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if `(process_name, uid)` is on the bad list.
    #[must_use]
    pub fn is_bad_process(&self, process_name: &str, uid: i32) -> bool {
        self.bad_processes
            .contains_key(&(process_name.to_string(), uid))
    }

    /// Returns the recorded reason for a bad mark.
    #[must_use]
    pub fn bad_process_info(&self, process_name: &str, uid: i32) -> Option<&BadProcessInfo> {
        self.bad_processes.get(&(process_name.to_string(), uid))
    }

    /// Removes a bad mark.
    pub fn clear_bad_process(&mut self, process_name: &str, uid: i32) {
        self.bad_processes.remove(&(process_name.to_string(), uid));
    }

    /// Forgets the restart-scoped crash clock of one process.
    pub fn reset_process_crash_time(&mut self, process_name: &str, uid: i32) {
        let key = (process_name.to_string(), uid);
        self.crash_times.remove(&key);
        self.crash_counts.remove(&key);
    }

    /// Explicit user command: forget every crash clock, including the
    /// persistent ones, and clear the bad list.
    pub fn reset_all(&mut self) {
        self.crash_times.clear();
        self.crash_times_persistent.clear();
        self.crash_counts.clear();
        self.bad_processes.clear();
    }

    /// Records that the user was shown a dialog for this process.
    pub fn note_dialog_shown(&mut self, process_name: &str, uid: i32, now: Time) {
        self.crash_show_dialog_times
            .insert((process_name.to_string(), uid), now);
    }

    /// Returns true if a dialog was shown within the crash interval.
    #[must_use]
    pub fn dialog_recently_shown(
        &self,
        process_name: &str,
        uid: i32,
        now: Time,
        config: &SupervisorConfig,
    ) -> bool {
        self.crash_show_dialog_times
            .get(&(process_name.to_string(), uid))
            .is_some_and(|&shown| now < shown + config.min_crash_interval)
    }

    fn last_crash(&self, key: &ProcessKey) -> Option<Time> {
        self.crash_times.get(key).copied()
    }

    fn last_crash_persistent(&self, key: &ProcessKey) -> Option<Time> {
        self.crash_times_persistent.get(key).copied()
    }

    fn record_crash(&mut self, key: &ProcessKey, now: Time, config: &SupervisorConfig) {
        self.crash_times.insert(key.clone(), now);
        self.crash_times_persistent.insert(key.clone(), now);
        let entry = match self.crash_counts.get(key) {
            Some(&(window_start, count))
                if now < window_start + config.crash_count_reset_interval =>
            {
                (window_start, count + 1)
            }
            _ => (now, 1),
        };
        self.crash_counts.insert(key.clone(), entry);
    }

    fn over_crash_limit(&self, key: &ProcessKey, now: Time, config: &SupervisorConfig) -> bool {
        self.crash_counts.get(key).is_some_and(|&(start, count)| {
            now < start + config.crash_count_reset_interval && count >= config.crash_count_limit
        })
    }

    fn mark_bad(&mut self, key: ProcessKey, info: BadProcessInfo) {
        self.crash_times.remove(&key);
        self.crash_counts.remove(&key);
        self.bad_processes.insert(key, info);
    }
}

impl SupervisorState {
    /// Handles one crash of `process_id`.
    ///
    /// Returns false when the quick-crash rule removed the process (nothing
    /// left to show a dialog for); true when the crash was absorbed.
    pub(crate) fn handle_app_crash(
        &mut self,
        process_id: ProcessId,
        short_msg: &str,
        long_msg: &str,
        stack: Option<&str>,
    ) -> Result<bool> {
        let now = self.now();
        let (key, persistent, isolated, user, bound_foreground) = {
            let record = self.process_mut(process_id)?;
            record.crashing = true;
            (
                (record.process_name.clone(), record.uid),
                record.persistent,
                record.isolated,
                record.user,
                record.proc_state == ProcessState::BoundForegroundService,
            )
        };

        // Services crashing with their process accumulate their own counts;
        // a foreground(-bound) service under its retry ceiling keeps the
        // process restartable.
        let mut try_again = false;
        {
            let min_interval = self.config.min_crash_interval;
            let retry_ceiling = self.config.bound_service_max_crash_retry;
            let record = self.process_mut(process_id)?;
            for service in &mut record.services {
                if now > service.restart_time + min_interval {
                    service.crash_count = 1;
                } else {
                    service.crash_count += 1;
                }
                if service.crash_count < retry_ceiling && (service.foreground || bound_foreground) {
                    try_again = true;
                }
            }
        }

        let (crash_time, crash_time_persistent) = if isolated {
            (None, None)
        } else {
            (
                self.app_errors.last_crash(&key),
                self.app_errors.last_crash_persistent(&key),
            )
        };

        let quick_crash = crash_time
            .is_some_and(|last| now < last + self.config.min_crash_interval);
        let over_limit = !isolated && self.app_errors.over_crash_limit(&key, now, &self.config);

        if quick_crash || over_limit {
            warn!(
                process = %key.0,
                uid = key.1,
                reason = if quick_crash { "crashed quickly" } else { "over crash limit" },
                "process has crashed too many times"
            );
            if !persistent {
                if !isolated {
                    // Isolated processes have no durable identity to mark.
                    self.app_errors.mark_bad(
                        key.clone(),
                        BadProcessInfo {
                            time: now,
                            short_msg: short_msg.to_string(),
                            long_msg: long_msg.to_string(),
                            stack: stack.map(ToString::to_string),
                        },
                    );
                    self.push_event(PolicyEvent::ProcessMarkedBad {
                        process_name: key.0.clone(),
                        uid: key.1,
                    });
                }
                {
                    let record = self.process_mut(process_id)?;
                    record.bad = true;
                    record.removed = true;
                }
                self.kill_process(process_id, "crash")?;
                self.resume_top_activities()?;
                self.report_crash(&key, user, short_msg, long_msg, stack, try_again, false);
                return Ok(false);
            }
            // Persistent processes stay; the count below is still recorded
            // for diagnostics.
            info!(process = %key.0, "persistent process over crash limit; keeping it");
            self.resume_top_activities()?;
        } else {
            self.finish_top_crashed_activities(process_id)?;
        }

        let repeating = crash_time_persistent
            .is_some_and(|last| now < last + self.config.min_crash_interval);
        if !isolated {
            self.app_errors.record_crash(&key, now, &self.config);
        }
        self.report_crash(&key, user, short_msg, long_msg, stack, try_again, repeating);
        Ok(true)
    }

    fn report_crash(
        &self,
        key: &ProcessKey,
        user: crate::types::UserId,
        short_msg: &str,
        long_msg: &str,
        stack: Option<&str>,
        restartable_for_service: bool,
        repeating: bool,
    ) {
        if let Some(receiver) = &self.crash_receiver {
            receiver.report(&CrashReport {
                process_name: key.0.clone(),
                uid: key.1,
                user,
                short_msg: short_msg.to_string(),
                long_msg: long_msg.to_string(),
                stack: stack.map(ToString::to_string),
                restartable_for_service,
                repeating,
            });
        }
    }

    /// Finishes the topmost activity of every stack where the crashing
    /// process owns the top.
    pub(crate) fn finish_top_crashed_activities(&mut self, process_id: ProcessId) -> Result<()> {
        let stack_ids: Vec<_> = self.stacks.iter().map(|(idx, _)| idx).collect();
        for index in stack_ids {
            let stack_id = crate::types::StackId::from_arena(index);
            let Some(top) = self.top_running_activity(stack_id) else {
                continue;
            };
            let crashed = self.activity(top)?.app == Some(process_id);
            if crashed {
                self.finish_activity(top, crate::types::RESULT_CANCELED, None, "crashed")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn key() -> ProcessKey {
        ("com.example".to_string(), 10001)
    }

    #[test]
    fn crash_window_counts_and_resets() {
        let config = SupervisorConfig::default();
        let mut errors = AppErrors::new();
        let k = key();

        errors.record_crash(&k, Time::from_secs(10), &config);
        errors.record_crash(&k, Time::from_secs(20), &config);
        assert!(!errors.over_crash_limit(&k, Time::from_secs(21), &config));

        for i in 0..config.crash_count_limit {
            errors.record_crash(&k, Time::from_secs(30 + u64::from(i)), &config);
        }
        assert!(errors.over_crash_limit(&k, Time::from_secs(50), &config));

        // Past the reset interval the window starts over.
        let later = Time::from_secs(30) + config.crash_count_reset_interval
            + Duration::from_secs(1);
        errors.record_crash(&k, later, &config);
        assert!(!errors.over_crash_limit(&k, later, &config));
    }

    #[test]
    fn bad_mark_clears_restart_scoped_clocks_only() {
        let config = SupervisorConfig::default();
        let mut errors = AppErrors::new();
        let k = key();
        errors.record_crash(&k, Time::from_secs(5), &config);
        errors.mark_bad(
            k.clone(),
            BadProcessInfo {
                time: Time::from_secs(5),
                short_msg: "boom".into(),
                long_msg: "boom boom".into(),
                stack: None,
            },
        );
        assert!(errors.is_bad_process(&k.0, k.1));
        assert_eq!(errors.last_crash(&k), None);
        // The persistent clock survives the mark.
        assert_eq!(errors.last_crash_persistent(&k), Some(Time::from_secs(5)));
    }

    #[test]
    fn reset_all_clears_everything() {
        let config = SupervisorConfig::default();
        let mut errors = AppErrors::new();
        let k = key();
        errors.record_crash(&k, Time::from_secs(5), &config);
        errors.mark_bad(
            k.clone(),
            BadProcessInfo {
                time: Time::from_secs(5),
                short_msg: "boom".into(),
                long_msg: String::new(),
                stack: None,
            },
        );
        errors.reset_all();
        assert!(!errors.is_bad_process(&k.0, k.1));
        assert_eq!(errors.last_crash_persistent(&k), None);
    }

    #[test]
    fn dialog_throttle_tracks_interval() {
        let config = SupervisorConfig::default();
        let mut errors = AppErrors::new();
        errors.note_dialog_shown("com.example", 10001, Time::from_secs(100));
        assert!(errors.dialog_recently_shown(
            "com.example",
            10001,
            Time::from_secs(120),
            &config
        ));
        assert!(!errors.dialog_recently_shown(
            "com.example",
            10001,
            Time::from_secs(100) + config.min_crash_interval + Duration::from_secs(1),
            &config
        ));
    }
}
