//! Lifecycle conformance: the pause/resume choreography and its deadlines.
//!
//! Verifies the stack invariants end to end: at most one RESUMED activity
//! per stack, pause strictly before resume, deferred stops on idle, and the
//! deadline-driven forced transitions.

use activity_supervisor::external::testing::ThreadCall;
use activity_supervisor::record::ActivityState;
use activity_supervisor::supervisor::StartResult;
use activity_supervisor::test_utils::TestHarness;
use activity_supervisor::types::{ActivityId, UserId};
use std::sync::Arc;
use std::time::Duration;

fn resumed_activity(harness: &TestHarness) -> Option<ActivityId> {
    harness
        .supervisor
        .snapshot()
        .displays
        .iter()
        .flat_map(|d| &d.stacks)
        .find_map(|s| s.resumed)
}

#[test]
fn cold_launch_creates_stack_process_and_resumes() {
    let harness = TestHarness::new();
    harness.register_activity("com.example.mail", 10001, "Main");
    activity_supervisor::test_phase!("request");

    let result = harness
        .supervisor
        .start_activity(
            TestHarness::intent_for("com.example.mail", "Main"),
            None,
            UserId::SYSTEM,
        )
        .expect("start");
    assert_eq!(result, StartResult::Success);

    // The process was forked but has not attached: the activity waits in
    // INITIALIZING.
    let spawned = harness.launcher.spawned();
    assert_eq!(spawned.len(), 1);
    assert_eq!(spawned[0].process_name, "com.example.mail");
    assert_eq!(spawned[0].hosting_type, "activity");
    let snapshot = harness.supervisor.snapshot();
    assert_eq!(snapshot.count_in_state(ActivityState::Initializing), 1);
    harness.assert_invariants();

    activity_supervisor::test_phase!("attach");
    harness.clock.advance(Duration::from_millis(40));
    let thread = harness.attach("com.example.mail", 10001);

    let snapshot = harness.supervisor.snapshot();
    assert_eq!(snapshot.count_in_state(ActivityState::Resumed), 1);
    let resumed = resumed_activity(&harness).expect("resumed activity");
    let activity = snapshot.activity(resumed).expect("snapshot entry");
    assert_eq!(activity.component, "com.example.mail/Main");
    assert!(activity.visible);
    assert!(matches!(
        thread.calls().first(),
        Some(ThreadCall::Launch { not_resumed: false, .. })
    ));
    harness.assert_invariants();
}

#[test]
fn launch_wait_blocks_until_resume_and_reports_timing() {
    let harness = Arc::new(TestHarness::new());
    harness.register_activity("com.example.browser", 10002, "View");

    let driver = {
        let harness = Arc::clone(&harness);
        std::thread::spawn(move || {
            // Give the caller time to enter its wait, then play the process
            // side: advance the clock and attach.
            std::thread::sleep(Duration::from_millis(50));
            harness.clock.advance(Duration::from_millis(120));
            harness.attach("com.example.browser", 10002);
        })
    };

    let result = harness
        .supervisor
        .start_activity_may_wait(
            TestHarness::intent_for("com.example.browser", "View"),
            None,
            UserId::SYSTEM,
        )
        .expect("start");
    driver.join().expect("driver thread");

    assert_eq!(result.result, StartResult::Success);
    assert!(!result.timeout);
    assert_eq!(
        result.who.map(|c| c.flatten()).as_deref(),
        Some("com.example.browser/View")
    );
    assert!(result.total_time > Duration::ZERO);
    harness.assert_invariants();
}

#[test]
fn pause_strictly_precedes_resume() {
    let harness = TestHarness::new();
    harness.register_activity("com.example.app", 10003, "First");
    harness.register_activity("com.example.app", 10003, "Second");

    harness
        .supervisor
        .start_activity(
            TestHarness::intent_for("com.example.app", "First"),
            None,
            UserId::SYSTEM,
        )
        .expect("start first");
    let thread = harness.attach("com.example.app", 10003);
    let first = resumed_activity(&harness).expect("first resumed");

    harness
        .supervisor
        .start_activity(
            TestHarness::intent_for("com.example.app", "Second"),
            None,
            UserId::SYSTEM,
        )
        .expect("start second");

    // First pauses; second must not resume before the completion report.
    let snapshot = harness.supervisor.snapshot();
    assert_eq!(
        snapshot.activity(first).expect("first").state,
        ActivityState::Pausing
    );
    assert_eq!(snapshot.count_in_state(ActivityState::Resumed), 0);
    assert_eq!(snapshot.count_in_state(ActivityState::Initializing), 1);
    assert!(thread
        .calls()
        .iter()
        .any(|c| matches!(c, ThreadCall::Pause { token, .. } if *token == first)));
    harness.assert_invariants();

    harness
        .supervisor
        .activity_paused(first)
        .expect("pause report");

    let snapshot = harness.supervisor.snapshot();
    assert_eq!(
        snapshot.activity(first).expect("first").state,
        ActivityState::Paused
    );
    assert_eq!(snapshot.count_in_state(ActivityState::Resumed), 1);
    let second = resumed_activity(&harness).expect("second resumed");
    assert_ne!(second, first);
    harness.assert_invariants();
}

#[test]
fn pause_deadline_forces_the_transition() {
    let harness = TestHarness::new();
    harness.register_activity("com.example.slow", 10004, "Stuck");
    harness.register_activity("com.example.slow", 10004, "Next");

    harness
        .supervisor
        .start_activity(
            TestHarness::intent_for("com.example.slow", "Stuck"),
            None,
            UserId::SYSTEM,
        )
        .expect("start");
    harness.attach("com.example.slow", 10004);
    let stuck = resumed_activity(&harness).expect("resumed");

    harness
        .supervisor
        .start_activity(
            TestHarness::intent_for("com.example.slow", "Next"),
            None,
            UserId::SYSTEM,
        )
        .expect("start next");
    assert_eq!(
        harness.supervisor.snapshot().activity(stuck).expect("stuck").state,
        ActivityState::Pausing
    );

    // No completion report; the 500ms deadline forces PAUSED and the
    // successor resumes.
    harness.clock.advance(Duration::from_millis(600));
    let fired = harness.supervisor.process_deadlines();
    assert!(fired >= 1);

    let snapshot = harness.supervisor.snapshot();
    assert_eq!(
        snapshot.activity(stuck).expect("stuck").state,
        ActivityState::Paused
    );
    assert_eq!(snapshot.count_in_state(ActivityState::Resumed), 1);
    harness.assert_invariants();
}

#[test]
fn idle_report_drives_deferred_stops() {
    let harness = TestHarness::new();
    harness.register_activity("com.example.app", 10005, "First");
    harness.register_activity("com.example.app", 10005, "Second");

    harness
        .supervisor
        .start_activity(
            TestHarness::intent_for("com.example.app", "First"),
            None,
            UserId::SYSTEM,
        )
        .expect("start first");
    let thread = harness.attach("com.example.app", 10005);
    let first = resumed_activity(&harness).expect("first");

    harness
        .supervisor
        .start_activity(
            TestHarness::intent_for("com.example.app", "Second"),
            None,
            UserId::SYSTEM,
        )
        .expect("start second");
    harness.supervisor.activity_paused(first).expect("paused");
    let second = resumed_activity(&harness).expect("second");

    // The paused predecessor is stopped only after the new top goes idle.
    assert!(!thread
        .calls()
        .iter()
        .any(|c| matches!(c, ThreadCall::Stop(token) if *token == first)));
    harness.supervisor.activity_idle(second).expect("idle");
    assert!(thread
        .calls()
        .iter()
        .any(|c| matches!(c, ThreadCall::Stop(token) if *token == first)));

    harness
        .supervisor
        .activity_stopped(first, Some(b"saved".to_vec()))
        .expect("stopped");
    assert_eq!(
        harness.supervisor.snapshot().activity(first).expect("first").state,
        ActivityState::Stopped
    );
    harness.assert_invariants();
}

#[test]
fn finishing_activity_delivers_result_and_is_destroyed_after_successor_resume() {
    let harness = TestHarness::new();
    harness.register_activity("com.example.app", 10006, "Caller");
    harness.register_activity("com.example.app", 10006, "Callee");

    harness
        .supervisor
        .start_activity(
            TestHarness::intent_for("com.example.app", "Caller"),
            None,
            UserId::SYSTEM,
        )
        .expect("start caller");
    let thread = harness.attach("com.example.app", 10006);
    let caller = resumed_activity(&harness).expect("caller");

    harness
        .supervisor
        .start_activity(
            TestHarness::intent_for("com.example.app", "Callee"),
            None,
            UserId::SYSTEM,
        )
        .expect("start callee");
    harness.supervisor.activity_paused(caller).expect("paused");
    let callee = resumed_activity(&harness).expect("callee");

    harness
        .supervisor
        .finish_activity(callee, -1, None)
        .expect("finish");
    // The callee pauses first; its completion resumes the caller and only
    // then schedules the destroy.
    harness.supervisor.activity_paused(callee).expect("pause report");

    let snapshot = harness.supervisor.snapshot();
    assert_eq!(resumed_activity(&harness), Some(caller));
    assert!(snapshot.activity(callee).is_none() || {
        let state = snapshot.activity(callee).expect("callee").state;
        matches!(state, ActivityState::Destroying | ActivityState::Finishing)
    });
    assert!(thread
        .calls()
        .iter()
        .any(|c| matches!(c, ThreadCall::Resume(token) if *token == caller)));

    if harness.supervisor.snapshot().activity(callee).is_some() {
        harness
            .supervisor
            .activity_destroyed(callee)
            .expect("destroyed");
    }
    assert!(harness.supervisor.snapshot().activity(callee).is_none());
    harness.assert_invariants();
}

#[test]
fn app_death_removes_hosted_activities() {
    let harness = TestHarness::new();
    harness.register_activity("com.example.app", 10007, "Root");

    harness
        .supervisor
        .start_activity(
            TestHarness::intent_for("com.example.app", "Root"),
            None,
            UserId::SYSTEM,
        )
        .expect("start");
    harness.attach("com.example.app", 10007);
    let root = resumed_activity(&harness).expect("root");

    harness
        .supervisor
        .app_died("com.example.app", 10007)
        .expect("death notification");

    // Not restarting: the activity leaves history.
    assert!(harness.supervisor.snapshot().activity(root).is_none());
    harness.assert_invariants();
}
