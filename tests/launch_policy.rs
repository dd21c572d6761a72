//! Launch policy: resolution caching, refusal paths, task reuse, batch
//! starts, the heavyweight switcher redirect, and the two-strikes rule.

use activity_supervisor::error::ErrorKind;
use activity_supervisor::record::ActivityState;
use activity_supervisor::supervisor::{
    PolicyEvent, StartResult, ACTION_HEAVY_WEIGHT_SWITCHER,
};
use activity_supervisor::test_utils::TestHarness;
use activity_supervisor::types::{
    ActivityInfo, ApplicationInfo, ComponentName, Intent, UserId,
};
use std::time::Duration;

fn heavyweight_activity(package: &str, uid: i32, name: &str) -> ActivityInfo {
    let mut application = ApplicationInfo::new(package, uid);
    application.cant_save_state = true;
    ActivityInfo::new(name, application)
}

#[test]
fn resolution_caches_component_into_the_intent() {
    let harness = TestHarness::new();
    let info = ActivityInfo::new("Viewer", ApplicationInfo::new("com.example.photos", 10010));
    harness.resolver.register_action("view-photo", info);

    harness
        .supervisor
        .start_activity(Intent::for_action("view-photo"), None, UserId::SYSTEM)
        .expect("start");

    // The record carries the resolved component, so replaying the stored
    // intent restarts the exact same activity.
    let snapshot = harness.supervisor.snapshot();
    let activity = snapshot
        .displays
        .iter()
        .flat_map(|d| &d.stacks)
        .flat_map(|s| &s.tasks)
        .flat_map(|t| &t.activities)
        .next()
        .expect("one activity");
    assert_eq!(activity.component, "com.example.photos/Viewer");
}

#[test]
fn intents_with_file_descriptors_are_refused() {
    let harness = TestHarness::new();
    harness.register_activity("com.example.app", 10011, "Main");
    let mut intent = TestHarness::intent_for("com.example.app", "Main");
    intent.carries_file_descriptors = true;

    let err = harness
        .supervisor
        .start_activity(intent, None, UserId::SYSTEM)
        .expect_err("must refuse");
    assert_eq!(err.kind(), ErrorKind::BadIntent);
    assert_eq!(harness.supervisor.snapshot().count_in_state(ActivityState::Initializing), 0);
}

#[test]
fn unresolvable_intent_reports_resolve_failure() {
    let harness = TestHarness::new();
    let err = harness
        .supervisor
        .start_activity(
            Intent::for_component(ComponentName::new("no.such", "Thing")),
            None,
            UserId::SYSTEM,
        )
        .expect_err("must fail");
    assert_eq!(err.kind(), ErrorKind::ResolveFailed);
}

#[test]
fn launch_for_a_stopped_user_is_refused() {
    let harness = TestHarness::new();
    harness.register_activity("com.example.app", 10012, "Main");
    let err = harness
        .supervisor
        .start_activity(
            TestHarness::intent_for("com.example.app", "Main"),
            None,
            UserId(77),
        )
        .expect_err("user not running");
    assert_eq!(err.kind(), ErrorKind::UserNotRunning);
}

#[test]
fn relaunch_brings_existing_task_to_front_without_waiting() {
    let harness = TestHarness::new();
    harness.register_activity("com.example.app", 10013, "Main");

    harness
        .supervisor
        .start_activity(
            TestHarness::intent_for("com.example.app", "Main"),
            None,
            UserId::SYSTEM,
        )
        .expect("first start");
    let thread = harness.attach("com.example.app", 10013);

    // The top is resumed and visible, so the blocking variant returns
    // immediately with zero wait times.
    let result = harness
        .supervisor
        .start_activity_may_wait(
            TestHarness::intent_for("com.example.app", "Main"),
            None,
            UserId::SYSTEM,
        )
        .expect("second start");
    assert_eq!(result.result, StartResult::TaskToFront);
    assert!(!result.timeout);
    assert_eq!(result.this_time, Duration::ZERO);
    assert_eq!(result.total_time, Duration::ZERO);
    assert_eq!(
        result.who.map(|c| c.flatten()).as_deref(),
        Some("com.example.app/Main")
    );

    // Only one instance exists and it received the replayed intent.
    let snapshot = harness.supervisor.snapshot();
    assert_eq!(snapshot.count_in_state(ActivityState::Resumed), 1);
    assert!(thread
        .calls()
        .iter()
        .any(|c| matches!(c, activity_supervisor::external::testing::ThreadCall::NewIntent(_))));
    harness.assert_invariants();
}

#[test]
fn batch_start_refuses_heavyweight_targets() {
    let harness = TestHarness::new();
    harness
        .resolver
        .register(heavyweight_activity("com.heavy.app", 10014, "Main"));

    let err = harness
        .supervisor
        .start_activities(
            vec![(TestHarness::intent_for("com.heavy.app", "Main"), None)],
            UserId::SYSTEM,
        )
        .expect_err("must refuse");
    assert_eq!(err.kind(), ErrorKind::BadIntent);
}

#[test]
fn batch_start_stacks_all_activities() {
    let harness = TestHarness::new();
    harness.register_activity("com.example.app", 10015, "First");
    harness.register_activity("com.example.app", 10015, "Second");

    let result = harness
        .supervisor
        .start_activities(
            vec![
                (TestHarness::intent_for("com.example.app", "First"), None),
                (TestHarness::intent_for("com.example.app", "Second"), None),
            ],
            UserId::SYSTEM,
        )
        .expect("batch");
    assert_eq!(result, StartResult::Success);

    let snapshot = harness.supervisor.snapshot();
    assert_eq!(snapshot.count_in_state(ActivityState::Initializing), 2);
    harness.assert_invariants();
}

#[test]
fn second_heavyweight_launch_is_redirected_to_the_switcher() {
    let harness = TestHarness::new();
    harness
        .resolver
        .register(heavyweight_activity("com.heavy.one", 10100, "Main"));
    harness
        .resolver
        .register(heavyweight_activity("com.heavy.two", 10101, "Main"));
    let switcher = ActivityInfo::new("HeavyWeightSwitcher", ApplicationInfo::new("system.server", 1000));
    harness
        .resolver
        .register_action(ACTION_HEAVY_WEIGHT_SWITCHER, switcher);

    harness
        .supervisor
        .start_activity(
            TestHarness::intent_for("com.heavy.one", "Main"),
            None,
            UserId::SYSTEM,
        )
        .expect("first heavyweight");
    harness.attach("com.heavy.one", 10100);
    assert!(harness.supervisor.snapshot().heavy_weight_process.is_some());

    harness
        .supervisor
        .start_activity(
            TestHarness::intent_for("com.heavy.two", "Main"),
            None,
            UserId::SYSTEM,
        )
        .expect("second heavyweight");

    // The caller's launch was transparently rewritten to the switcher.
    let events = harness.supervisor.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        PolicyEvent::HeavyweightRedirected { requested }
            if requested.flatten() == "com.heavy.two/Main"
    )));
    let snapshot = harness.supervisor.snapshot();
    let components: Vec<_> = snapshot
        .displays
        .iter()
        .flat_map(|d| &d.stacks)
        .flat_map(|s| &s.tasks)
        .flat_map(|t| &t.activities)
        .map(|a| a.component.clone())
        .collect();
    assert!(components.contains(&"system.server/HeavyWeightSwitcher".to_string()));
    assert!(!components.contains(&"com.heavy.two/Main".to_string()));
    harness.assert_invariants();
}

#[test]
fn relaunching_the_running_heavyweight_is_not_redirected() {
    let harness = TestHarness::new();
    harness
        .resolver
        .register(heavyweight_activity("com.heavy.one", 10100, "Main"));

    harness
        .supervisor
        .start_activity(
            TestHarness::intent_for("com.heavy.one", "Main"),
            None,
            UserId::SYSTEM,
        )
        .expect("first");
    harness.attach("com.heavy.one", 10100);

    let result = harness
        .supervisor
        .start_activity(
            TestHarness::intent_for("com.heavy.one", "Main"),
            None,
            UserId::SYSTEM,
        )
        .expect("relaunch");
    assert_eq!(result, StartResult::TaskToFront);
    assert!(harness.supervisor.drain_events().iter().all(|e| {
        !matches!(e, PolicyEvent::HeavyweightRedirected { .. })
    }));
}

#[test]
fn first_launch_failure_retries_second_is_fatal() {
    let harness = TestHarness::new();
    harness.register_activity("com.example.flaky", 10016, "Anchor");
    harness.register_activity("com.example.flaky", 10016, "Broken");

    // Bring the process up with a healthy anchor activity.
    harness
        .supervisor
        .start_activity(
            TestHarness::intent_for("com.example.flaky", "Anchor"),
            None,
            UserId::SYSTEM,
        )
        .expect("anchor");
    let thread = harness.attach("com.example.flaky", 10016);

    // The next launch into this process fails remotely.
    thread.fail_next_launches(1);
    harness
        .supervisor
        .start_activity(
            TestHarness::intent_for("com.example.flaky", "Broken"),
            None,
            UserId::SYSTEM,
        )
        .expect("start broken");
    let anchor = harness
        .supervisor
        .snapshot()
        .displays
        .iter()
        .flat_map(|d| &d.stacks)
        .flat_map(|s| &s.tasks)
        .flat_map(|t| &t.activities)
        .find(|a| a.component.ends_with("/Anchor"))
        .map(|a| a.id)
        .expect("anchor present");
    harness.supervisor.activity_paused(anchor).expect("anchor pause");

    // First strike: the process was restarted for a retry.
    assert_eq!(harness.launcher.spawned().len(), 2);

    // The retry fails too: the activity is finished for good.
    let retry_thread = harness.attach_failing("com.example.flaky", 10016, 1);
    let snapshot = harness.supervisor.snapshot();
    assert!(snapshot
        .displays
        .iter()
        .flat_map(|d| &d.stacks)
        .flat_map(|s| &s.tasks)
        .flat_map(|t| &t.activities)
        .all(|a| !a.component.ends_with("/Broken")));
    assert!(retry_thread.launches().is_empty());
    harness.assert_invariants();
}
