//! In-memory doubles for the external collaborators.
//!
//! Every double records the calls it receives so conformance suites can
//! assert on ordering and payloads. Failure injection is limited to what the
//! lifecycle protocols actually distinguish: launch-call failures (the
//! two-strikes rule), spawn failures, and unlock failures.

use super::{
    ActivityLaunch, ApplicationThread, BroadcastDispatcher, BroadcastRequest, CrashReport,
    CrashReportReceiver, LmkSink, PackageResolver, ProcessLauncher, StorageService, UserInfo,
    UserRegistry, UserStopCallback, UserSwitchObserver, WindowSession,
};
use crate::error::{Error, ErrorKind, Result};
use crate::types::{ActivityId, ActivityInfo, ApplicationInfo, ComponentName, Intent, ResultInfo, UserId};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io;

/// Package resolver backed by registered manifests.
#[derive(Default)]
pub struct FakeResolver {
    by_component: Mutex<HashMap<ComponentName, ActivityInfo>>,
    by_action: Mutex<HashMap<String, ActivityInfo>>,
}

impl FakeResolver {
    /// Creates an empty resolver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an activity reachable by explicit component.
    pub fn register(&self, info: ActivityInfo) {
        self.by_component.lock().insert(info.component(), info);
    }

    /// Registers an activity reachable through an action string.
    pub fn register_action(&self, action: impl Into<String>, info: ActivityInfo) {
        self.by_component.lock().insert(info.component(), info.clone());
        self.by_action.lock().insert(action.into(), info);
    }
}

impl PackageResolver for FakeResolver {
    fn resolve_intent(&self, intent: &Intent, _user: UserId) -> Option<ActivityInfo> {
        if let Some(component) = &intent.component {
            return self.by_component.lock().get(component).cloned();
        }
        let action = intent.action.as_ref()?;
        self.by_action.lock().get(action).cloned()
    }
}

/// User database backed by a map.
#[derive(Default)]
pub struct FakeUserRegistry {
    users: Mutex<HashMap<UserId, UserInfo>>,
    removed: Mutex<Vec<UserId>>,
    prepared_storage: Mutex<Vec<UserId>>,
}

impl FakeUserRegistry {
    /// Creates a registry that already knows the system user.
    #[must_use]
    pub fn with_system_user() -> Self {
        let registry = Self::default();
        registry.add(UserInfo::full(UserId::SYSTEM, 0));
        registry
    }

    /// Adds a user.
    pub fn add(&self, info: UserInfo) {
        self.users.lock().insert(info.id, info);
    }

    /// Returns the users removed through [`UserRegistry::remove_user`].
    #[must_use]
    pub fn removed(&self) -> Vec<UserId> {
        self.removed.lock().clone()
    }

    /// Returns the users whose storage was prepared.
    #[must_use]
    pub fn prepared_storage(&self) -> Vec<UserId> {
        self.prepared_storage.lock().clone()
    }
}

impl UserRegistry for FakeUserRegistry {
    fn user_info(&self, user: UserId) -> Option<UserInfo> {
        self.users.lock().get(&user).cloned()
    }

    fn profiles_of(&self, user: UserId) -> Vec<UserId> {
        let users = self.users.lock();
        let Some(group) = users.get(&user).and_then(|u| u.profile_group) else {
            return vec![user];
        };
        let mut ids: Vec<UserId> = users
            .values()
            .filter(|u| u.profile_group == Some(group))
            .map(|u| u.id)
            .collect();
        ids.sort();
        ids
    }

    fn profile_parent(&self, user: UserId) -> Option<UserId> {
        let users = self.users.lock();
        let info = users.get(&user)?;
        if !info.managed_profile {
            return None;
        }
        let group = info.profile_group?;
        users
            .values()
            .find(|u| u.profile_group == Some(group) && !u.managed_profile)
            .map(|u| u.id)
    }

    fn make_initialized(&self, user: UserId) {
        if let Some(info) = self.users.lock().get_mut(&user) {
            info.initialized = true;
        }
    }

    fn remove_user(&self, user: UserId) {
        self.users.lock().remove(&user);
        self.removed.lock().push(user);
    }

    fn prepare_user_storage(&self, user: UserId) {
        self.prepared_storage.lock().push(user);
    }
}

/// A call into the window manager.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WindowCall {
    /// Visibility changed for a token.
    SetVisibility(ActivityId, bool),
    /// Deferred-layout bracket opened.
    DeferLayout,
    /// Deferred-layout bracket closed.
    ContinueLayout,
    /// Screen freeze started.
    FreezeScreen,
    /// Screen freeze ended.
    UnfreezeScreen,
    /// Orientation re-evaluated.
    UpdateOrientation,
    /// Current user changed.
    SetCurrentUser(UserId, Vec<UserId>),
    /// Device locked.
    LockNow,
    /// Keyguard dismissed.
    DismissKeyguard,
}

/// Window session that records every call.
#[derive(Default)]
pub struct RecordingWindowSession {
    calls: Mutex<Vec<WindowCall>>,
}

impl RecordingWindowSession {
    /// Returns all recorded calls.
    #[must_use]
    pub fn calls(&self) -> Vec<WindowCall> {
        self.calls.lock().clone()
    }

    /// Returns how many times `call` was recorded.
    #[must_use]
    pub fn count(&self, call: &WindowCall) -> usize {
        self.calls.lock().iter().filter(|c| *c == call).count()
    }
}

impl WindowSession for RecordingWindowSession {
    fn set_app_visibility(&self, token: ActivityId, visible: bool) {
        self.calls.lock().push(WindowCall::SetVisibility(token, visible));
    }

    fn defer_surface_layout(&self) {
        self.calls.lock().push(WindowCall::DeferLayout);
    }

    fn continue_surface_layout(&self) {
        self.calls.lock().push(WindowCall::ContinueLayout);
    }

    fn start_freezing_screen(&self) {
        self.calls.lock().push(WindowCall::FreezeScreen);
    }

    fn stop_freezing_screen(&self) {
        self.calls.lock().push(WindowCall::UnfreezeScreen);
    }

    fn update_orientation(&self) -> bool {
        self.calls.lock().push(WindowCall::UpdateOrientation);
        false
    }

    fn set_current_user(&self, user: UserId, profiles: &[UserId]) {
        self.calls
            .lock()
            .push(WindowCall::SetCurrentUser(user, profiles.to_vec()));
    }

    fn lock_now(&self) {
        self.calls.lock().push(WindowCall::LockNow);
    }

    fn dismiss_keyguard(&self) {
        self.calls.lock().push(WindowCall::DismissKeyguard);
    }
}

/// One spawn request seen by the fake launcher.
#[derive(Clone, Debug)]
pub struct SpawnedProcess {
    /// Process name.
    pub process_name: String,
    /// Application uid.
    pub uid: i32,
    /// Assigned pid.
    pub pid: i32,
    /// Hosting type ("activity", "service", ...).
    pub hosting_type: String,
    /// Hosting component description.
    pub hosting_name: String,
}

#[derive(Default)]
struct LauncherState {
    next_pid: i32,
    spawned: Vec<SpawnedProcess>,
    killed: Vec<(i32, String)>,
    fail_spawns: usize,
}

/// Launcher assigning sequential pids.
#[derive(Default)]
pub struct FakeLauncher {
    state: Mutex<LauncherState>,
}

impl FakeLauncher {
    /// Creates a launcher whose first pid is 1000.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LauncherState {
                next_pid: 1000,
                ..LauncherState::default()
            }),
        }
    }

    /// Makes the next `n` spawn attempts fail.
    pub fn fail_next_spawns(&self, n: usize) {
        self.state.lock().fail_spawns = n;
    }

    /// Returns every spawn request seen.
    #[must_use]
    pub fn spawned(&self) -> Vec<SpawnedProcess> {
        self.state.lock().spawned.clone()
    }

    /// Returns every `(pid, reason)` kill seen.
    #[must_use]
    pub fn killed(&self) -> Vec<(i32, String)> {
        self.state.lock().killed.clone()
    }
}

impl ProcessLauncher for FakeLauncher {
    fn spawn_process(
        &self,
        process_name: &str,
        info: &ApplicationInfo,
        hosting_type: &str,
        hosting_name: &str,
    ) -> Result<i32> {
        let mut state = self.state.lock();
        if state.fail_spawns > 0 {
            state.fail_spawns -= 1;
            return Err(Error::new(ErrorKind::ProcessStartFailed)
                .with_context(format!("spawn refused for {process_name}")));
        }
        state.next_pid += 1;
        let pid = state.next_pid;
        state.spawned.push(SpawnedProcess {
            process_name: process_name.to_string(),
            uid: info.uid,
            pid,
            hosting_type: hosting_type.to_string(),
            hosting_name: hosting_name.to_string(),
        });
        Ok(pid)
    }

    fn kill_process(&self, pid: i32, reason: &str) {
        self.state.lock().killed.push((pid, reason.to_string()));
    }
}

/// One scheduling call seen by a fake application thread.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ThreadCall {
    /// Launch scheduled.
    Launch {
        /// Activity token.
        token: ActivityId,
        /// Started into the stopped state.
        not_resumed: bool,
        /// Results delivered with the launch.
        results: usize,
        /// New intents delivered with the launch.
        new_intents: usize,
    },
    /// Resume scheduled for an already-launched activity.
    Resume(ActivityId),
    /// Pause scheduled.
    Pause {
        /// Activity token.
        token: ActivityId,
        /// The activity is finishing.
        finishing: bool,
        /// The user is leaving (home press rather than another launch).
        user_leaving: bool,
    },
    /// Stop scheduled.
    Stop(ActivityId),
    /// Destroy scheduled.
    Destroy(ActivityId),
    /// Results delivered to a resumed activity.
    SendResult(ActivityId, usize),
    /// New intent delivered to a resumed activity.
    NewIntent(ActivityId),
    /// Sleep state delivered.
    Sleeping(ActivityId, bool),
    /// Deliberate crash requested.
    Crash(String),
}

#[derive(Default)]
struct ThreadState {
    calls: Vec<ThreadCall>,
    fail_launches: u32,
    dead: bool,
}

/// Application thread that records calls and can simulate a dead process.
#[derive(Default)]
pub struct FakeApplicationThread {
    state: Mutex<ThreadState>,
}

impl FakeApplicationThread {
    /// Creates a healthy thread.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` launch calls fail with a remote error.
    pub fn fail_next_launches(&self, n: u32) {
        self.state.lock().fail_launches = n;
    }

    /// Makes every subsequent call fail, as if the process died.
    pub fn go_dead(&self) {
        self.state.lock().dead = true;
    }

    /// Returns all recorded calls.
    #[must_use]
    pub fn calls(&self) -> Vec<ThreadCall> {
        self.state.lock().calls.clone()
    }

    /// Returns only the launch calls.
    #[must_use]
    pub fn launches(&self) -> Vec<ThreadCall> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| matches!(c, ThreadCall::Launch { .. }))
            .cloned()
            .collect()
    }

    fn record(&self, call: ThreadCall) -> Result<()> {
        let mut state = self.state.lock();
        if state.dead {
            return Err(Error::new(ErrorKind::LaunchFailed).with_context("process is dead"));
        }
        state.calls.push(call);
        Ok(())
    }
}

impl ApplicationThread for FakeApplicationThread {
    fn schedule_launch_activity(&self, launch: &ActivityLaunch) -> Result<()> {
        let mut state = self.state.lock();
        if state.dead {
            return Err(Error::new(ErrorKind::LaunchFailed).with_context("process is dead"));
        }
        if state.fail_launches > 0 {
            state.fail_launches -= 1;
            return Err(Error::new(ErrorKind::LaunchFailed).with_context("launch call failed"));
        }
        state.calls.push(ThreadCall::Launch {
            token: launch.token,
            not_resumed: launch.not_resumed,
            results: launch.results.len(),
            new_intents: launch.new_intents.len(),
        });
        Ok(())
    }

    fn schedule_resume_activity(&self, token: ActivityId, _is_forward: bool) -> Result<()> {
        self.record(ThreadCall::Resume(token))
    }

    fn schedule_pause_activity(
        &self,
        token: ActivityId,
        finishing: bool,
        user_leaving: bool,
    ) -> Result<()> {
        self.record(ThreadCall::Pause {
            token,
            finishing,
            user_leaving,
        })
    }

    fn schedule_stop_activity(&self, token: ActivityId, _visible: bool) -> Result<()> {
        self.record(ThreadCall::Stop(token))
    }

    fn schedule_destroy_activity(&self, token: ActivityId, _finishing: bool) -> Result<()> {
        self.record(ThreadCall::Destroy(token))
    }

    fn schedule_send_result(&self, token: ActivityId, results: &[ResultInfo]) -> Result<()> {
        self.record(ThreadCall::SendResult(token, results.len()))
    }

    fn schedule_new_intent(&self, token: ActivityId, _intent: &Intent) -> Result<()> {
        self.record(ThreadCall::NewIntent(token))
    }

    fn schedule_sleeping(&self, token: ActivityId, sleeping: bool) -> Result<()> {
        self.record(ThreadCall::Sleeping(token, sleeping))
    }

    fn schedule_crash(&self, message: &str) {
        let _ = self.record(ThreadCall::Crash(message.to_string()));
    }
}

/// Dispatcher that records broadcasts in send order.
#[derive(Default)]
pub struct RecordingDispatcher {
    sent: Mutex<Vec<BroadcastRequest>>,
}

impl RecordingDispatcher {
    /// Returns every broadcast sent so far.
    #[must_use]
    pub fn sent(&self) -> Vec<BroadcastRequest> {
        self.sent.lock().clone()
    }

    /// Returns the action strings of the broadcasts, in send order.
    #[must_use]
    pub fn actions(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter_map(|r| r.intent.action.clone())
            .collect()
    }

    /// Returns the completion-gated broadcasts `(action, id)`, in send order.
    #[must_use]
    pub fn completions(&self) -> Vec<(String, super::BroadcastId)> {
        self.sent
            .lock()
            .iter()
            .filter_map(|r| Some((r.intent.action.clone()?, r.completion?)))
            .collect()
    }
}

impl BroadcastDispatcher for RecordingDispatcher {
    fn broadcast_intent(&self, request: &BroadcastRequest) {
        self.sent.lock().push(request.clone());
    }
}

/// Storage service with an in-memory unlocked set.
#[derive(Default)]
pub struct FakeStorage {
    unlocked: Mutex<HashSet<UserId>>,
    refuse: Mutex<HashSet<UserId>>,
}

impl FakeStorage {
    /// Creates storage with every key locked.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-unlocks a user's key (device without credential encryption).
    pub fn pre_unlock(&self, user: UserId) {
        self.unlocked.lock().insert(user);
    }

    /// Marks `user`'s key as credential-bound: unlock attempts without a
    /// token or secret fail, attempts carrying either succeed.
    pub fn require_credentials(&self, user: UserId) {
        self.refuse.lock().insert(user);
    }
}

impl StorageService for FakeStorage {
    fn unlock_user_key(
        &self,
        user: UserId,
        _serial: i32,
        token: Option<&[u8]>,
        secret: Option<&[u8]>,
    ) -> Result<()> {
        if self.refuse.lock().contains(&user) && token.is_none() && secret.is_none() {
            return Err(Error::new(ErrorKind::PermissionDenied)
                .with_context(format!("key for {user} requires credentials")));
        }
        self.unlocked.lock().insert(user);
        Ok(())
    }

    fn is_user_key_unlocked(&self, user: UserId) -> bool {
        self.unlocked.lock().contains(&user)
    }
}

/// Observer that records events and the cookies it must acknowledge.
#[derive(Default)]
pub struct RecordingSwitchObserver {
    switching: Mutex<Vec<(UserId, u64)>>,
    complete: Mutex<Vec<UserId>>,
}

impl RecordingSwitchObserver {
    /// Returns `(new_user, cookie)` for every switching callback.
    #[must_use]
    pub fn switching(&self) -> Vec<(UserId, u64)> {
        self.switching.lock().clone()
    }

    /// Returns the cookie of the most recent switching callback.
    #[must_use]
    pub fn last_cookie(&self) -> Option<u64> {
        self.switching.lock().last().map(|(_, c)| *c)
    }

    /// Returns the users for which the switch completed.
    #[must_use]
    pub fn completed(&self) -> Vec<UserId> {
        self.complete.lock().clone()
    }
}

impl UserSwitchObserver for RecordingSwitchObserver {
    fn on_user_switching(&self, new_user: UserId, cookie: u64) {
        self.switching.lock().push((new_user, cookie));
    }

    fn on_user_switch_complete(&self, new_user: UserId) {
        self.complete.lock().push(new_user);
    }
}

/// Stop callback recording terminal outcomes.
#[derive(Default)]
pub struct RecordingStopCallback {
    events: Mutex<Vec<(UserId, bool)>>,
}

impl RecordingStopCallback {
    /// Returns `(user, stopped)` events; `stopped == false` means aborted.
    #[must_use]
    pub fn events(&self) -> Vec<(UserId, bool)> {
        self.events.lock().clone()
    }
}

impl UserStopCallback for RecordingStopCallback {
    fn user_stopped(&self, user: UserId) {
        self.events.lock().push((user, true));
    }

    fn user_stop_aborted(&self, user: UserId) {
        self.events.lock().push((user, false));
    }
}

/// Crash receiver that keeps reports in memory.
#[derive(Default)]
pub struct RecordingCrashReceiver {
    reports: Mutex<Vec<CrashReport>>,
}

impl RecordingCrashReceiver {
    /// Returns every report received.
    #[must_use]
    pub fn reports(&self) -> Vec<CrashReport> {
        self.reports.lock().clone()
    }
}

impl CrashReportReceiver for RecordingCrashReceiver {
    fn report(&self, report: &CrashReport) {
        self.reports.lock().push(report.clone());
    }
}

/// LMK sink capturing the written tables.
#[derive(Default)]
pub struct MemoryLmkSink {
    levels: Mutex<Option<(String, String)>>,
    extra_free: Mutex<Option<i64>>,
}

impl MemoryLmkSink {
    /// Returns the last `(adj, minfree)` lines written.
    #[must_use]
    pub fn levels(&self) -> Option<(String, String)> {
        self.levels.lock().clone()
    }

    /// Returns the last extra-free reserve written.
    #[must_use]
    pub fn extra_free_kbytes(&self) -> Option<i64> {
        *self.extra_free.lock()
    }
}

impl LmkSink for MemoryLmkSink {
    fn write_oom_levels(&self, adj_line: &str, minfree_line: &str) -> io::Result<()> {
        *self.levels.lock() = Some((adj_line.to_string(), minfree_line.to_string()));
        Ok(())
    }

    fn set_extra_free_kbytes(&self, kb: i64) -> io::Result<()> {
        *self.extra_free.lock() = Some(kb);
        Ok(())
    }
}
