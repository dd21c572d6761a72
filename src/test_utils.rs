//! Test utilities.
//!
//! Shared helpers for the unit and conformance suites:
//! - tracing-based logging initialization
//! - a phase macro for readable test output
//! - [`TestHarness`]: a supervisor wired to in-memory doubles with a manual
//!   clock, plus fixture helpers for the common launch flows

use crate::config::SupervisorConfig;
use crate::external::testing::{
    FakeApplicationThread, FakeLauncher, FakeResolver, FakeStorage, FakeUserRegistry,
    MemoryLmkSink, RecordingCrashReceiver, RecordingDispatcher, RecordingWindowSession,
};
use crate::supervisor::Supervisor;
use crate::types::{ActivityInfo, ApplicationInfo, ComponentName, Intent, ManualClock};
use std::sync::Arc;

#[cfg(feature = "tracing-integration")]
use std::sync::Once;

#[cfg(feature = "tracing-integration")]
static INIT_LOGGING: Once = Once::new();

/// Initialize test logging with debug-level output.
///
/// Safe to call multiple times; only initializes once.
#[cfg(feature = "tracing-integration")]
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .with_target(true)
            .with_ansi(false)
            .try_init();
    });
}

/// Initialize test logging (no-op without `tracing-integration`).
#[cfg(not(feature = "tracing-integration"))]
pub fn init_test_logging() {}

/// Emits a phase header into the test log.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        $crate::tracing_compat::info!(phase = $name, "==== phase ====");
    };
}

/// A supervisor wired to recording doubles and a manual clock.
pub struct TestHarness {
    /// The supervisor under test.
    pub supervisor: Supervisor,
    /// Manually advanced clock.
    pub clock: Arc<ManualClock>,
    /// Resolver with registered fixtures.
    pub resolver: Arc<FakeResolver>,
    /// Window-manager recorder.
    pub window: Arc<RecordingWindowSession>,
    /// Process launcher assigning pids.
    pub launcher: Arc<FakeLauncher>,
    /// Storage service with in-memory keys.
    pub storage: Arc<FakeStorage>,
    /// Broadcast recorder.
    pub dispatcher: Arc<RecordingDispatcher>,
    /// User database.
    pub users: Arc<FakeUserRegistry>,
    /// Low-memory-killer sink.
    pub lmk: Arc<MemoryLmkSink>,
    /// Crash-report recorder.
    pub crashes: Arc<RecordingCrashReceiver>,
}

impl TestHarness {
    /// Creates a harness with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(SupervisorConfig::default())
    }

    /// Creates a harness with a custom configuration.
    #[must_use]
    pub fn with_config(config: SupervisorConfig) -> Self {
        init_test_logging();
        let clock = ManualClock::new();
        let resolver = Arc::new(FakeResolver::new());
        let window = Arc::new(RecordingWindowSession::default());
        let launcher = Arc::new(FakeLauncher::new());
        let storage = Arc::new(FakeStorage::new());
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let users = Arc::new(FakeUserRegistry::with_system_user());
        let lmk = Arc::new(MemoryLmkSink::default());
        let crashes = Arc::new(RecordingCrashReceiver::default());
        let supervisor = Supervisor::builder()
            .config(config)
            .clock(clock.clone())
            .resolver(resolver.clone())
            .window(window.clone())
            .launcher(launcher.clone())
            .storage(storage.clone())
            .dispatcher(dispatcher.clone())
            .user_registry(users.clone())
            .lmk_sink(lmk.clone())
            .crash_receiver(crashes.clone())
            .build()
            .expect("harness build");
        Self {
            supervisor,
            clock,
            resolver,
            window,
            launcher,
            storage,
            dispatcher,
            users,
            lmk,
            crashes,
        }
    }

    /// Registers an application and one of its activities; returns the
    /// manifest entry.
    pub fn register_activity(&self, package: &str, uid: i32, name: &str) -> ActivityInfo {
        let info = ActivityInfo::new(name, ApplicationInfo::new(package, uid));
        self.resolver.register(info.clone());
        info
    }

    /// Builds an explicit intent for a registered activity.
    #[must_use]
    pub fn intent_for(package: &str, name: &str) -> Intent {
        Intent::for_component(ComponentName::new(package, name))
    }

    fn latest_pid(&self, process_name: &str, uid: i32) -> i32 {
        self.launcher
            .spawned()
            .iter()
            .rev()
            .find(|p| p.process_name == process_name && p.uid == uid)
            .map(|p| p.pid)
            .expect("process was spawned")
    }

    /// Attaches a fresh fake thread for the most recently spawned process
    /// matching `(process_name, uid)`.
    pub fn attach(&self, process_name: &str, uid: i32) -> Arc<FakeApplicationThread> {
        let thread = Arc::new(FakeApplicationThread::new());
        self.supervisor
            .attach_application(process_name, uid, self.latest_pid(process_name, uid), thread.clone())
            .expect("attach");
        thread
    }

    /// Like [`TestHarness::attach`], with the thread primed to fail its
    /// first `failures` launch calls.
    pub fn attach_failing(
        &self,
        process_name: &str,
        uid: i32,
        failures: u32,
    ) -> Arc<FakeApplicationThread> {
        let thread = Arc::new(FakeApplicationThread::new());
        thread.fail_next_launches(failures);
        self.supervisor
            .attach_application(process_name, uid, self.latest_pid(process_name, uid), thread.clone())
            .expect("attach");
        thread
    }

    /// Reports delivery completion for every gated broadcast, including
    /// ones enqueued by earlier completions, until none remain.
    pub fn finish_all_broadcasts(&self) {
        let mut finished = std::collections::HashSet::new();
        loop {
            let pending: Vec<_> = self
                .dispatcher
                .completions()
                .into_iter()
                .filter(|(_, id)| !finished.contains(id))
                .collect();
            if pending.is_empty() {
                break;
            }
            for (_, id) in pending {
                finished.insert(id);
                let _ = self.supervisor.finish_broadcast(id);
            }
        }
    }

    /// Asserts the structural invariants hold.
    pub fn assert_invariants(&self) {
        if let Err(violation) = self.supervisor.check_invariants() {
            panic!("invariant violated: {violation}");
        }
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
