//! Low-memory-killer export, process importance, and the shutdown settle.

use activity_supervisor::config::{MemoryProfile, SupervisorConfig};
use activity_supervisor::record::ActivityState;
use activity_supervisor::test_utils::TestHarness;
use activity_supervisor::types::UserId;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[test]
fn boot_exports_the_killer_table_for_the_device_profile() {
    // 1080x1920 is past the high-profile display threshold: the high table
    // applies wholesale.
    let harness = TestHarness::new();
    let (adj, minfree) = harness.lmk.levels().expect("table written at boot");
    assert_eq!(adj, "0,1,2,3,9,15");
    assert_eq!(minfree, "12288,15360,18432,21504,24576,30720");
    assert_eq!(
        harness.lmk.extra_free_kbytes(),
        Some(1080 * 1920 * 4 * 3 / 1024)
    );
}

#[test]
fn low_profile_device_exports_the_low_table() {
    let config = SupervisorConfig {
        memory: MemoryProfile {
            total_mem_mb: 300,
            display_width: 320,
            display_height: 480,
            ..MemoryProfile::default()
        },
        ..SupervisorConfig::default()
    };
    let harness = TestHarness::with_config(config);
    let (adj, minfree) = harness.lmk.levels().expect("table written at boot");
    assert_eq!(adj, "0,1,2,3,9,15");
    assert_eq!(minfree, "2048,3072,4096,6144,7168,8192");
}

#[test]
fn process_hosting_the_resumed_activity_is_foreground() {
    let harness = TestHarness::new();
    harness.register_activity("com.example.app", 10040, "Main");
    harness
        .supervisor
        .start_activity(
            TestHarness::intent_for("com.example.app", "Main"),
            None,
            UserId::SYSTEM,
        )
        .expect("start");
    harness.attach("com.example.app", 10040);

    let snapshot = harness.supervisor.snapshot();
    let process = snapshot
        .processes
        .iter()
        .find(|p| p.process_name == "com.example.app")
        .expect("process");
    assert!(process.active);
    assert_eq!(process.adj, 0);
}

#[test]
fn shutdown_times_out_when_an_activity_never_settles() {
    let harness = TestHarness::new();
    harness.register_activity("com.example.stuck", 10041, "Main");
    harness
        .supervisor
        .start_activity(
            TestHarness::intent_for("com.example.stuck", "Main"),
            None,
            UserId::SYSTEM,
        )
        .expect("start");
    let thread = harness.attach("com.example.stuck", 10041);

    let started = Instant::now();
    let timed_out = harness.supervisor.shutdown(Duration::from_millis(500));
    assert!(timed_out);
    assert!(started.elapsed() >= Duration::from_millis(500));

    // The pause was issued and the state advanced; nothing rolled back.
    assert!(thread.calls().iter().any(|c| matches!(
        c,
        activity_supervisor::external::testing::ThreadCall::Pause { .. }
    )));
    let snapshot = harness.supervisor.snapshot();
    assert_eq!(snapshot.count_in_state(ActivityState::Pausing), 1);
    harness.assert_invariants();
}

#[test]
fn shutdown_returns_once_pausing_settles() {
    let harness = Arc::new(TestHarness::new());
    harness.register_activity("com.example.app", 10042, "Main");
    harness
        .supervisor
        .start_activity(
            TestHarness::intent_for("com.example.app", "Main"),
            None,
            UserId::SYSTEM,
        )
        .expect("start");
    harness.attach("com.example.app", 10042);
    let resumed = harness
        .supervisor
        .snapshot()
        .displays
        .iter()
        .flat_map(|d| &d.stacks)
        .find_map(|s| s.resumed)
        .expect("resumed");

    let driver = {
        let harness = Arc::clone(&harness);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            harness.supervisor.activity_paused(resumed).expect("pause report");
        })
    };

    let timed_out = harness.supervisor.shutdown(Duration::from_secs(5));
    driver.join().expect("driver");
    assert!(!timed_out);

    let snapshot = harness.supervisor.snapshot();
    assert_eq!(snapshot.count_in_state(ActivityState::Resumed), 0);
    assert_eq!(snapshot.count_in_state(ActivityState::Pausing), 0);
    harness.assert_invariants();
}

#[test]
fn sleep_and_wake_round_trip_resumes_the_top_activity() {
    let harness = TestHarness::new();
    harness.register_activity("com.example.app", 10043, "Main");
    harness
        .supervisor
        .start_activity(
            TestHarness::intent_for("com.example.app", "Main"),
            None,
            UserId::SYSTEM,
        )
        .expect("start");
    harness.attach("com.example.app", 10043);
    let resumed = harness
        .supervisor
        .snapshot()
        .displays
        .iter()
        .flat_map(|d| &d.stacks)
        .find_map(|s| s.resumed)
        .expect("resumed");

    harness.supervisor.set_sleeping(true).expect("sleep");
    harness.supervisor.activity_paused(resumed).expect("pause report");
    assert_eq!(
        harness.supervisor.snapshot().count_in_state(ActivityState::Resumed),
        0
    );

    harness.supervisor.set_sleeping(false).expect("wake");
    assert_eq!(
        harness.supervisor.snapshot().count_in_state(ActivityState::Resumed),
        1
    );
    harness.assert_invariants();
}
