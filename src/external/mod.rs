//! Narrow interfaces to the supervisor's external collaborators.
//!
//! The window manager, package resolver, process launcher, per-process
//! application threads, storage service, and broadcast dispatcher are
//! external to the core; the supervisor consumes them only through the traits
//! here. [`testing`] provides in-memory doubles used by the conformance
//! suites.
//!
//! Calls that cross into a process (the [`ApplicationThread`] methods) return
//! `Result`: a failed call means the remote side is dead or wedged, and the
//! caller decides between retry and escalation.

pub mod testing;

use crate::error::Result;
use crate::types::{
    ActivityId, ActivityInfo, ApplicationInfo, Intent, ResultInfo, UserId,
};
use core::fmt;
use std::io;

/// Identifier of an ordered broadcast whose delivery completion gates a
/// lifecycle step.
///
/// The supervisor mints the id and attaches it to the outgoing
/// [`BroadcastRequest`]; the dispatcher (or a test harness) reports delivery
/// completion back through `Supervisor::finish_broadcast`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct BroadcastId(pub u64);

impl fmt::Display for BroadcastId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "broadcast#{}", self.0)
    }
}

/// A broadcast handed to the external dispatcher.
#[derive(Clone, Debug)]
pub struct BroadcastRequest {
    /// Set when the supervisor needs a completion callback for this
    /// broadcast.
    pub completion: Option<BroadcastId>,
    /// The intent to deliver.
    pub intent: Intent,
    /// Target user, or `None` for all users.
    pub user: Option<UserId>,
    /// Permission receivers must hold.
    pub required_permission: Option<String>,
    /// Deliver only to registered (non-manifest) receivers.
    pub registered_only: bool,
    /// Deliver on the foreground queue.
    pub foreground: bool,
}

/// Delivers lifecycle broadcasts. External collaborator.
pub trait BroadcastDispatcher: Send + Sync {
    /// Enqueues a broadcast for delivery.
    ///
    /// Delivery is asynchronous; when `request.completion` is set, the
    /// dispatcher must eventually report completion so the gated protocol
    /// step can run.
    fn broadcast_intent(&self, request: &BroadcastRequest);
}

/// Resolves intents against installed packages. External collaborator.
pub trait PackageResolver: Send + Sync {
    /// Resolves `intent` for `user`, returning the matching activity.
    fn resolve_intent(&self, intent: &Intent, user: UserId) -> Option<ActivityInfo>;
}

/// Static facts about a logical user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserInfo {
    /// The user id.
    pub id: UserId,
    /// Stable serial number (used for storage keys).
    pub serial: i32,
    /// Profile group the user belongs to, if any.
    pub profile_group: Option<i32>,
    /// Set once first-boot initialization completed.
    pub initialized: bool,
    /// Removed entirely once stopped.
    pub ephemeral: bool,
    /// A guest account.
    pub guest: bool,
    /// A managed profile of another (full) user.
    pub managed_profile: bool,
}

impl UserInfo {
    /// Creates an ordinary, initialized full user.
    #[must_use]
    pub fn full(id: UserId, serial: i32) -> Self {
        Self {
            id,
            serial,
            profile_group: None,
            initialized: true,
            ephemeral: false,
            guest: false,
            managed_profile: false,
        }
    }
}

/// Queries and mutates the user database. External collaborator.
pub trait UserRegistry: Send + Sync {
    /// Returns static facts about `user`, if it exists.
    fn user_info(&self, user: UserId) -> Option<UserInfo>;
    /// Returns `user` plus its profiles.
    fn profiles_of(&self, user: UserId) -> Vec<UserId>;
    /// Returns the parent of a managed profile.
    fn profile_parent(&self, user: UserId) -> Option<UserId>;
    /// Marks first-boot initialization complete.
    fn make_initialized(&self, user: UserId);
    /// Deletes an (ephemeral) user.
    fn remove_user(&self, user: UserId);
    /// Gives the registry a chance to prepare app storage before unlock
    /// completes.
    fn prepare_user_storage(&self, user: UserId);
}

/// Surface and focus side-effects. External collaborator.
///
/// Where a visibility change fans out over several stacks the supervisor
/// brackets the updates with [`WindowSession::defer_surface_layout`] /
/// [`WindowSession::continue_surface_layout`] so the visual update lands
/// atomically.
pub trait WindowSession: Send + Sync {
    /// Shows or hides an activity's surface.
    fn set_app_visibility(&self, token: ActivityId, visible: bool);
    /// Begins a deferred-layout bracket.
    fn defer_surface_layout(&self);
    /// Ends a deferred-layout bracket.
    fn continue_surface_layout(&self);
    /// Freezes the screen for a user switch.
    fn start_freezing_screen(&self);
    /// Unfreezes the screen.
    fn stop_freezing_screen(&self);
    /// Re-evaluates display orientation; returns true if the configuration
    /// changed.
    fn update_orientation(&self) -> bool;
    /// Tells the window manager which user (and profiles) own the screen.
    fn set_current_user(&self, user: UserId, profiles: &[UserId]);
    /// Locks the device now (shown with the user switcher on the keyguard).
    fn lock_now(&self);
    /// Dismisses the keyguard if it is showing.
    fn dismiss_keyguard(&self);
}

/// Forks application processes. External collaborator.
pub trait ProcessLauncher: Send + Sync {
    /// Forks a process for `info`, returning the pid. The new process
    /// registers itself later through `Supervisor::attach_application`.
    fn spawn_process(
        &self,
        process_name: &str,
        info: &ApplicationInfo,
        hosting_type: &str,
        hosting_name: &str,
    ) -> Result<i32>;

    /// Kills a previously spawned process.
    fn kill_process(&self, pid: i32, reason: &str);
}

/// Everything a scheduled activity launch carries into the process.
#[derive(Clone, Debug)]
pub struct ActivityLaunch {
    /// Token identifying the activity.
    pub token: ActivityId,
    /// The (resolved) intent.
    pub intent: Intent,
    /// Resolved manifest entry.
    pub info: ActivityInfo,
    /// Saved-state blob from the previous incarnation.
    pub saved_state: Option<Vec<u8>>,
    /// Results to deliver with the launch.
    pub results: Vec<ResultInfo>,
    /// New intents to deliver with the launch.
    pub new_intents: Vec<Intent>,
    /// Launch into the stopped state instead of resuming.
    pub not_resumed: bool,
    /// The launch is a forward navigation (affects transitions).
    pub is_forward: bool,
}

/// The scheduling surface of one hosted application process.
///
/// All methods are asynchronous requests; the process reports lifecycle
/// completion back through the supervisor's `activity_*` entry points. A
/// returned error means the remote side is gone.
pub trait ApplicationThread: Send + Sync {
    /// Starts (or restarts) an activity in the process.
    fn schedule_launch_activity(&self, launch: &ActivityLaunch) -> Result<()>;
    /// Resumes an activity already launched into the process.
    fn schedule_resume_activity(&self, token: ActivityId, is_forward: bool) -> Result<()>;
    /// Asks an activity to pause.
    fn schedule_pause_activity(
        &self,
        token: ActivityId,
        finishing: bool,
        user_leaving: bool,
    ) -> Result<()>;
    /// Asks an activity to stop.
    fn schedule_stop_activity(&self, token: ActivityId, visible: bool) -> Result<()>;
    /// Asks an activity to wind down after a finish or config change.
    fn schedule_destroy_activity(&self, token: ActivityId, finishing: bool) -> Result<()>;
    /// Delivers results to a resumed activity.
    fn schedule_send_result(&self, token: ActivityId, results: &[ResultInfo]) -> Result<()>;
    /// Delivers a new intent to a resumed activity.
    fn schedule_new_intent(&self, token: ActivityId, intent: &Intent) -> Result<()>;
    /// Tells an activity its display went to sleep or woke up.
    fn schedule_sleeping(&self, token: ActivityId, sleeping: bool) -> Result<()>;
    /// Makes the process throw a deliberate crash with `message`.
    fn schedule_crash(&self, message: &str);
}

/// Unlocks per-user credential-encrypted storage. External collaborator.
pub trait StorageService: Send + Sync {
    /// Unlocks the user's key with the supplied credentials.
    fn unlock_user_key(
        &self,
        user: UserId,
        serial: i32,
        token: Option<&[u8]>,
        secret: Option<&[u8]>,
    ) -> Result<()>;

    /// Returns true if the user's key is already unlocked.
    fn is_user_key_unlocked(&self, user: UserId) -> bool;
}

/// Observer of user switches, registered with the supervisor.
pub trait UserSwitchObserver: Send + Sync {
    /// A switch toward `new_user` is starting. The observer must eventually
    /// acknowledge through `Supervisor::acknowledge_user_switch(cookie)`;
    /// the switch proceeds once all observers acknowledged or the deadline
    /// passed.
    fn on_user_switching(&self, new_user: UserId, cookie: u64);
    /// The switch to `new_user` completed and the screen unfroze.
    fn on_user_switch_complete(&self, new_user: UserId);
    /// The foreground moved between profiles of the current user.
    fn on_foreground_profile_switch(&self, _user: UserId) {}
}

/// Completion callback for a requested user stop.
pub trait UserStopCallback: Send + Sync {
    /// The user fully stopped.
    fn user_stopped(&self, user: UserId);
    /// The stop was abandoned (user restarted or record went stale).
    fn user_stop_aborted(&self, user: UserId);
}

/// A crash escalated out of the supervisor.
#[derive(Clone, Debug)]
pub struct CrashReport {
    /// Crashing process name.
    pub process_name: String,
    /// Crashing uid.
    pub uid: i32,
    /// User the process ran as.
    pub user: UserId,
    /// One-line failure summary.
    pub short_msg: String,
    /// Full failure message.
    pub long_msg: String,
    /// Stack trace, if captured.
    pub stack: Option<String>,
    /// The process hosted a foreground-bound service and may be restarted
    /// once more despite the crash policy.
    pub restartable_for_service: bool,
    /// The same process also crashed within the persistent window.
    pub repeating: bool,
}

/// Receives crash reports for surfacing to the user/telemetry.
pub trait CrashReportReceiver: Send + Sync {
    /// Delivers one report.
    fn report(&self, report: &CrashReport);
}

/// Sink for the kernel low-memory-killer tables.
///
/// The file-level contract: two comma-separated integer lists (adjustments
/// and page counts) and a reserve kilobyte count.
pub trait LmkSink: Send + Sync {
    /// Writes the adjustment and minfree tables.
    fn write_oom_levels(&self, adj_line: &str, minfree_line: &str) -> io::Result<()>;
    /// Writes the extra-free reserve in kilobytes.
    fn set_extra_free_kbytes(&self, kb: i64) -> io::Result<()>;
}

/// [`LmkSink`] writing the real sysfs nodes.
#[derive(Debug, Clone)]
pub struct SysfsLmkSink {
    /// Path of the adjustment list node.
    pub adj_path: std::path::PathBuf,
    /// Path of the minfree list node.
    pub minfree_path: std::path::PathBuf,
    /// Path of the extra-free-kbytes sysctl node.
    pub extra_free_path: std::path::PathBuf,
}

impl Default for SysfsLmkSink {
    fn default() -> Self {
        Self {
            adj_path: "/sys/module/lowmemorykiller/parameters/adj".into(),
            minfree_path: "/sys/module/lowmemorykiller/parameters/minfree".into(),
            extra_free_path: "/proc/sys/vm/extra_free_kbytes".into(),
        }
    }
}

impl LmkSink for SysfsLmkSink {
    fn write_oom_levels(&self, adj_line: &str, minfree_line: &str) -> io::Result<()> {
        std::fs::write(&self.adj_path, adj_line)?;
        std::fs::write(&self.minfree_path, minfree_line)
    }

    fn set_extra_free_kbytes(&self, kb: i64) -> io::Result<()> {
        std::fs::write(&self.extra_free_path, kb.to_string())
    }
}
