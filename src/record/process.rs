//! Process record: an OS process hosting activity and service code.

use crate::external::ApplicationThread;
use crate::process::oom;
use crate::tracing_compat::debug;
use crate::types::{ActivityId, ApplicationInfo, ProcessId, Time, UserId};
use std::sync::Arc;

/// Coarse process importance, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProcessState {
    /// Persistent system process.
    Persistent,
    /// Hosting the resumed activity.
    Top,
    /// Bound by a foreground process to one of its services.
    BoundForegroundService,
    /// Running a foreground service.
    ForegroundService,
    /// Hosting visible (but not resumed) activities.
    Visible,
    /// Running an ordinary service.
    Service,
    /// Hosting the home activity.
    Home,
    /// The previous foreground application.
    Previous,
    /// Only cached content remains.
    Cached,
    /// Not running.
    Nonexistent,
}

/// Kernel scheduling group for the process's threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SchedGroup {
    /// Background cgroup.
    Background,
    /// Default (foreground) cgroup.
    #[default]
    Default,
    /// Top-app cgroup.
    TopApp,
}

/// A service hosted by a process; tracked only as far as crash policy and
/// importance need.
#[derive(Debug, Clone)]
pub struct ServiceRecord {
    /// Service class name.
    pub name: String,
    /// Whether the service runs in the foreground.
    pub foreground: bool,
    /// When the service was last (re)started.
    pub restart_time: Time,
    /// Consecutive crashes attributed to this service.
    pub crash_count: u32,
}

/// An operating-system process hosting components of a single uid.
///
/// Identity is the `(process_name, uid)` pair; the pid exists only after the
/// fork, and the process is *active* while its thread handle is attached.
pub struct ProcessRecord {
    /// This record's id.
    pub id: ProcessId,
    /// Process name (usually the package name).
    pub process_name: String,
    /// Application uid.
    pub uid: i32,
    /// Logical user derived from the uid.
    pub user: UserId,
    /// Owning application.
    pub info: ApplicationInfo,
    /// Assigned pid, once forked.
    pub pid: Option<i32>,
    /// Handle into the hosting process, once attached.
    pub thread: Option<Arc<dyn ApplicationThread>>,
    /// Activities hosted here (non-owning).
    pub activities: Vec<ActivityId>,
    /// Services hosted here.
    pub services: Vec<ServiceRecord>,
    /// Computed OOM adjustment before client modifications.
    pub raw_adj: i32,
    /// Current OOM adjustment.
    pub cur_adj: i32,
    /// Last adjustment reported to the kernel.
    pub set_adj: i32,
    /// Scheduling group.
    pub sched_group: SchedGroup,
    /// Coarse importance bucket.
    pub proc_state: ProcessState,
    /// Last time the process hosted something the user saw (drives LRU).
    pub last_activity_time: Time,
    /// A crash dialog/report is in flight.
    pub crashing: bool,
    /// An ANR report is in flight.
    pub not_responding: bool,
    /// Persistent processes are restarted by the system and never marked bad.
    pub persistent: bool,
    /// Isolated processes have no durable identity.
    pub isolated: bool,
    /// Tripped the quick-crash policy.
    pub bad: bool,
    /// Killed (by the supervisor or externally).
    pub killed: bool,
    /// Killed deliberately by the supervisor.
    pub killed_by_supervisor: bool,
    /// Removed from the registry; awaiting cleanup.
    pub removed: bool,
    /// Some client bound to a service here with the above-client flag.
    pub has_above_client: bool,
}

impl std::fmt::Debug for ProcessRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessRecord")
            .field("id", &self.id)
            .field("process_name", &self.process_name)
            .field("uid", &self.uid)
            .field("pid", &self.pid)
            .field("active", &self.thread.is_some())
            .field("proc_state", &self.proc_state)
            .field("bad", &self.bad)
            .field("killed", &self.killed)
            .finish_non_exhaustive()
    }
}

impl ProcessRecord {
    /// Creates a record for a process that has not been forked yet.
    #[must_use]
    pub fn new(id: ProcessId, process_name: String, info: ApplicationInfo, user: UserId) -> Self {
        let persistent = info.persistent;
        let uid = info.uid;
        Self {
            id,
            process_name,
            uid,
            user,
            info,
            pid: None,
            thread: None,
            activities: Vec::new(),
            services: Vec::new(),
            raw_adj: oom::UNKNOWN_ADJ,
            cur_adj: oom::UNKNOWN_ADJ,
            set_adj: oom::UNKNOWN_ADJ,
            sched_group: SchedGroup::default(),
            proc_state: ProcessState::Nonexistent,
            last_activity_time: Time::ZERO,
            crashing: false,
            not_responding: false,
            persistent,
            isolated: false,
            bad: false,
            killed: false,
            killed_by_supervisor: false,
            removed: false,
            has_above_client: false,
        }
    }

    /// Returns true while the hosting thread is attached.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.thread.is_some()
    }

    /// Attaches the hosting thread after the process registered itself.
    pub fn make_active(&mut self, pid: i32, thread: Arc<dyn ApplicationThread>) {
        debug!(process = %self.id, name = %self.process_name, pid, "process attached");
        self.pid = Some(pid);
        self.thread = Some(thread);
        self.killed = false;
        self.killed_by_supervisor = false;
        self.proc_state = if self.persistent {
            ProcessState::Persistent
        } else {
            ProcessState::Cached
        };
    }

    /// Detaches the thread after death; the record may be reused for a
    /// restart.
    pub fn make_inactive(&mut self) {
        self.thread = None;
        self.pid = None;
        self.proc_state = ProcessState::Nonexistent;
    }

    /// Returns true if any hosted activity id matches `activity`.
    #[must_use]
    pub fn hosts_activity(&self, activity: ActivityId) -> bool {
        self.activities.contains(&activity)
    }

    /// Applies the above-client bind rule: clients bound with the
    /// above-client flag force this process one bucket below its raw
    /// adjustment, skipping reserved levels.
    #[must_use]
    pub fn modify_raw_oom_adj(&self, adj: i32) -> i32 {
        if !self.has_above_client {
            return adj;
        }
        if adj < oom::FOREGROUND_APP_ADJ {
            // System levels are never dropped.
            adj
        } else if adj < oom::VISIBLE_APP_ADJ {
            oom::VISIBLE_APP_ADJ
        } else if adj < oom::PERCEPTIBLE_APP_ADJ {
            oom::PERCEPTIBLE_APP_ADJ
        } else if adj < oom::CACHED_APP_MIN_ADJ {
            oom::CACHED_APP_MIN_ADJ
        } else if adj < oom::CACHED_APP_MAX_ADJ {
            adj + 1
        } else {
            adj
        }
    }

    /// Marks the process killed. Persistent processes keep their record
    /// alive so the system restarts them.
    pub fn note_killed(&mut self, by_supervisor: bool) {
        if !self.persistent {
            self.killed = true;
            self.killed_by_supervisor = by_supervisor;
        }
    }
}
