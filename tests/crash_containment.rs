//! Crash containment: quick-crash detection, the bad-process list, the
//! persistent and isolated exemptions, and the bound-service retry.

use activity_supervisor::error::ErrorKind;
use activity_supervisor::supervisor::PolicyEvent;
use activity_supervisor::test_utils::TestHarness;
use activity_supervisor::types::{ActivityInfo, ApplicationInfo, UserId};
use std::time::Duration;

fn launch_and_attach(harness: &TestHarness, package: &str, uid: i32, name: &str) {
    harness.register_activity(package, uid, name);
    harness
        .supervisor
        .start_activity(TestHarness::intent_for(package, name), None, UserId::SYSTEM)
        .expect("start");
    harness.attach(package, uid);
}

#[test]
fn first_crash_finishes_the_top_activity_and_records_it() {
    let harness = TestHarness::new();
    launch_and_attach(&harness, "com.example.app", 10020, "Main");

    let absorbed = harness
        .supervisor
        .app_crashed("com.example.app", 10020, "NullPointer", "boom at Main", None)
        .expect("crash handled");
    assert!(absorbed);

    // Not a quick crash: the top activity is finished, the process stays.
    let snapshot = harness.supervisor.snapshot();
    let top = snapshot
        .displays
        .iter()
        .flat_map(|d| &d.stacks)
        .flat_map(|s| &s.tasks)
        .flat_map(|t| &t.activities)
        .next()
        .expect("activity still in history");
    assert!(top.finishing);
    assert!(!harness.supervisor.is_bad_process("com.example.app", 10020));

    let reports = harness.crashes.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].short_msg, "NullPointer");
    assert!(!reports[0].repeating);
}

#[test]
fn quick_second_crash_marks_the_process_bad() {
    let harness = TestHarness::new();
    launch_and_attach(&harness, "com.example.crashy", 10021, "Main");

    harness
        .supervisor
        .app_crashed("com.example.crashy", 10021, "boom", "first crash", None)
        .expect("first crash");

    // Crash again well inside the 60s window.
    harness.clock.advance(Duration::from_secs(30));
    let absorbed = harness
        .supervisor
        .app_crashed("com.example.crashy", 10021, "boom", "second crash", Some("stack"))
        .expect("second crash");
    assert!(!absorbed);

    assert!(harness.supervisor.is_bad_process("com.example.crashy", 10021));
    assert!(harness.supervisor.drain_events().iter().any(|e| matches!(
        e,
        PolicyEvent::ProcessMarkedBad { process_name, uid }
            if process_name == "com.example.crashy" && *uid == 10021
    )));
    // The process was killed and its activities left history.
    assert!(!harness.launcher.killed().is_empty());
    let snapshot = harness.supervisor.snapshot();
    assert!(snapshot
        .displays
        .iter()
        .flat_map(|d| &d.stacks)
        .flat_map(|s| &s.tasks)
        .flat_map(|t| &t.activities)
        .all(|a| !a.component.starts_with("com.example.crashy/")));
    harness.assert_invariants();

    // Broadcasts can no longer revive it.
    let info = ApplicationInfo::new("com.example.crashy", 10021);
    let err = harness
        .supervisor
        .request_process_start(&info, UserId::SYSTEM, "broadcast", "Receiver")
        .expect_err("refused");
    assert_eq!(err.kind(), ErrorKind::QuotaExceeded);
}

#[test]
fn explicit_activity_launch_clears_the_bad_mark() {
    let harness = TestHarness::new();
    launch_and_attach(&harness, "com.example.crashy", 10022, "Main");
    harness
        .supervisor
        .app_crashed("com.example.crashy", 10022, "boom", "1", None)
        .expect("first");
    harness.clock.advance(Duration::from_secs(10));
    harness
        .supervisor
        .app_crashed("com.example.crashy", 10022, "boom", "2", None)
        .expect("second");
    assert!(harness.supervisor.is_bad_process("com.example.crashy", 10022));

    // The user explicitly launches it again: the mark and the crash clock
    // are forgiven and a fresh process is forked.
    let spawns_before = harness.launcher.spawned().len();
    harness
        .supervisor
        .start_activity(
            TestHarness::intent_for("com.example.crashy", "Main"),
            None,
            UserId::SYSTEM,
        )
        .expect("explicit relaunch");
    assert!(!harness.supervisor.is_bad_process("com.example.crashy", 10022));
    assert_eq!(harness.launcher.spawned().len(), spawns_before + 1);
    harness.assert_invariants();
}

#[test]
fn persistent_processes_are_never_marked_bad() {
    let harness = TestHarness::new();
    let mut application = ApplicationInfo::new("com.vendor.telephony", 1001);
    application.persistent = true;
    harness
        .resolver
        .register(ActivityInfo::new("Dialer", application));
    harness
        .supervisor
        .start_activity(
            TestHarness::intent_for("com.vendor.telephony", "Dialer"),
            None,
            UserId::SYSTEM,
        )
        .expect("start");
    harness.attach("com.vendor.telephony", 1001);

    harness
        .supervisor
        .app_crashed("com.vendor.telephony", 1001, "boom", "1", None)
        .expect("first");
    harness.clock.advance(Duration::from_secs(5));
    let absorbed = harness
        .supervisor
        .app_crashed("com.vendor.telephony", 1001, "boom", "2", None)
        .expect("second");

    // The count is recorded for diagnostics but the process survives.
    assert!(absorbed);
    assert!(!harness.supervisor.is_bad_process("com.vendor.telephony", 1001));
    assert!(harness.launcher.killed().is_empty());
    harness.assert_invariants();
}

#[test]
fn crashing_foreground_service_is_flagged_restartable() {
    let harness = TestHarness::new();
    launch_and_attach(&harness, "com.example.music", 10023, "Player");
    harness
        .supervisor
        .note_service_running("com.example.music", 10023, "PlaybackService", true)
        .expect("service");

    harness
        .supervisor
        .app_crashed("com.example.music", 10023, "boom", "player crash", None)
        .expect("crash");

    let reports = harness.crashes.reports();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].restartable_for_service);
}

#[test]
fn persistent_crash_clock_survives_the_forgiven_restart() {
    let harness = TestHarness::new();
    launch_and_attach(&harness, "com.example.app", 10024, "Main");

    harness
        .supervisor
        .app_crashed("com.example.app", 10024, "boom", "1", None)
        .expect("first");
    harness.clock.advance(Duration::from_secs(10));
    harness
        .supervisor
        .app_crashed("com.example.app", 10024, "boom", "2", None)
        .expect("quick second");
    assert!(harness.supervisor.is_bad_process("com.example.app", 10024));

    // An explicit relaunch forgives the restart-scoped clock, but the
    // persistent clock still flags the next crash as repeating.
    harness
        .supervisor
        .start_activity(
            TestHarness::intent_for("com.example.app", "Main"),
            None,
            UserId::SYSTEM,
        )
        .expect("relaunch");
    harness.attach("com.example.app", 10024);
    harness.clock.advance(Duration::from_secs(10));
    harness
        .supervisor
        .app_crashed("com.example.app", 10024, "boom", "3", None)
        .expect("third");

    let reports = harness.crashes.reports();
    let last = reports.last().expect("report");
    assert!(last.repeating);
    // Not treated as a quick crash: the forgiven clock was empty.
    assert!(!harness.supervisor.is_bad_process("com.example.app", 10024));
}
