//! Display policy: singleton stacks, pinned ordering, windowing-mode
//! resolution, and the split-screen activation/dismissal side effects.

use activity_supervisor::error::ErrorKind;
use activity_supervisor::supervisor::PolicyEvent;
use activity_supervisor::test_utils::TestHarness;
use activity_supervisor::types::{
    ActivityOptions, ActivityType, DisplayId, StackId, UserId, WindowingMode,
};

fn stack_order(harness: &TestHarness) -> Vec<StackId> {
    harness.supervisor.snapshot().displays[0]
        .stacks
        .iter()
        .map(|s| s.id)
        .collect()
}

fn stack_mode(harness: &TestHarness, stack: StackId) -> WindowingMode {
    harness
        .supervisor
        .snapshot()
        .stack(stack)
        .expect("stack present")
        .windowing_mode
}

#[test]
fn singleton_roles_cannot_be_duplicated() {
    let harness = TestHarness::new();
    harness
        .supervisor
        .create_stack(
            DisplayId::DEFAULT,
            WindowingMode::Fullscreen,
            ActivityType::Home,
            true,
        )
        .expect("home stack");

    let err = harness
        .supervisor
        .create_stack(
            DisplayId::DEFAULT,
            WindowingMode::Fullscreen,
            ActivityType::Home,
            true,
        )
        .expect_err("second home stack");
    assert_eq!(err.kind(), ErrorKind::Configuration);

    harness
        .supervisor
        .create_stack(
            DisplayId::DEFAULT,
            WindowingMode::Pinned,
            ActivityType::Standard,
            true,
        )
        .expect("pinned stack");
    let err = harness
        .supervisor
        .create_stack(
            DisplayId::DEFAULT,
            WindowingMode::Pinned,
            ActivityType::Standard,
            true,
        )
        .expect_err("second pinned stack");
    assert_eq!(err.kind(), ErrorKind::Configuration);
    harness.assert_invariants();
}

#[test]
fn pinned_stack_stays_topmost() {
    let harness = TestHarness::new();
    harness.register_activity("com.example.app", 10030, "Main");
    harness
        .supervisor
        .start_activity(
            TestHarness::intent_for("com.example.app", "Main"),
            None,
            UserId::SYSTEM,
        )
        .expect("launch");
    let app_stack = stack_order(&harness)[0];

    let pinned = harness
        .supervisor
        .create_stack(
            DisplayId::DEFAULT,
            WindowingMode::Pinned,
            ActivityType::Standard,
            false,
        )
        .expect("pinned");
    assert_eq!(stack_order(&harness).last(), Some(&pinned));

    // Raising a normal stack clamps below the pinned stack.
    harness
        .supervisor
        .move_stack_to_front(app_stack)
        .expect("raise");
    let order = stack_order(&harness);
    assert_eq!(order.last(), Some(&pinned));
    assert_eq!(order[order.len() - 2], app_stack);
    harness.assert_invariants();
}

#[test]
fn unsupported_freeform_request_falls_back_to_fullscreen() {
    // Default capabilities: no freeform support.
    let harness = TestHarness::new();
    harness.register_activity("com.example.app", 10031, "Main");
    let options = ActivityOptions {
        launch_windowing_mode: WindowingMode::Freeform,
        ..ActivityOptions::default()
    };
    harness
        .supervisor
        .start_activity(
            TestHarness::intent_for("com.example.app", "Main"),
            Some(options),
            UserId::SYSTEM,
        )
        .expect("launch");
    let stack = stack_order(&harness)[0];
    assert_eq!(stack_mode(&harness, stack), WindowingMode::Fullscreen);
}

#[test]
fn fullscreen_or_split_secondary_depends_on_a_primary() {
    let harness = TestHarness::new();
    harness.register_activity("com.example.a", 10032, "Main");
    harness.register_activity("com.example.b", 10033, "Main");

    // Without a primary: plain fullscreen.
    let options = ActivityOptions {
        launch_windowing_mode: WindowingMode::FullscreenOrSplitScreenSecondary,
        ..ActivityOptions::default()
    };
    harness
        .supervisor
        .start_activity(
            TestHarness::intent_for("com.example.a", "Main"),
            Some(options.clone()),
            UserId::SYSTEM,
        )
        .expect("first");
    let first_stack = *stack_order(&harness).first().expect("stack");
    assert_eq!(stack_mode(&harness, first_stack), WindowingMode::Fullscreen);

    // With a primary: the same request docks as split-secondary.
    harness
        .supervisor
        .create_stack(
            DisplayId::DEFAULT,
            WindowingMode::SplitScreenPrimary,
            ActivityType::Standard,
            true,
        )
        .expect("primary");
    harness
        .supervisor
        .start_activity(
            TestHarness::intent_for("com.example.b", "Main"),
            Some(options),
            UserId::SYSTEM,
        )
        .expect("second");
    let modes: Vec<_> = stack_order(&harness)
        .iter()
        .map(|&s| stack_mode(&harness, s))
        .collect();
    assert!(modes.contains(&WindowingMode::SplitScreenSecondary));
    harness.assert_invariants();
}

#[test]
fn split_screen_activation_resizes_standard_stacks() {
    let harness = TestHarness::new();
    harness
        .supervisor
        .create_stack(
            DisplayId::DEFAULT,
            WindowingMode::Fullscreen,
            ActivityType::Home,
            true,
        )
        .expect("home");
    harness.register_activity("com.example.app", 10034, "Main");
    harness
        .supervisor
        .start_activity(
            TestHarness::intent_for("com.example.app", "Main"),
            None,
            UserId::SYSTEM,
        )
        .expect("launch");
    let app_stack = *stack_order(&harness).last().expect("app stack");

    harness
        .supervisor
        .create_stack(
            DisplayId::DEFAULT,
            WindowingMode::SplitScreenPrimary,
            ActivityType::Standard,
            true,
        )
        .expect("primary");

    let events = harness.supervisor.drain_events();
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, PolicyEvent::SplitScreenActivated(_)))
            .count(),
        1
    );
    // The standard stack docked; home keeps its own windowing.
    assert_eq!(stack_mode(&harness, app_stack), WindowingMode::SplitScreenSecondary);
    let home = harness.supervisor.snapshot().displays[0]
        .home_stack
        .expect("home cached");
    assert_eq!(stack_mode(&harness, home), WindowingMode::Fullscreen);
    harness.assert_invariants();
}

#[test]
fn split_screen_dismissal_restores_fullscreen_and_tucks_home_behind() {
    let harness = TestHarness::new();
    harness
        .supervisor
        .create_stack(
            DisplayId::DEFAULT,
            WindowingMode::Fullscreen,
            ActivityType::Home,
            true,
        )
        .expect("home");
    harness.register_activity("com.example.app", 10035, "Main");
    harness
        .supervisor
        .start_activity(
            TestHarness::intent_for("com.example.app", "Main"),
            None,
            UserId::SYSTEM,
        )
        .expect("launch");
    let app_stack = *stack_order(&harness).last().expect("app stack");
    let primary = harness
        .supervisor
        .create_stack(
            DisplayId::DEFAULT,
            WindowingMode::SplitScreenPrimary,
            ActivityType::Standard,
            true,
        )
        .expect("primary");
    assert_eq!(stack_mode(&harness, app_stack), WindowingMode::SplitScreenSecondary);
    harness.supervisor.drain_events();

    harness.supervisor.remove_stack(primary).expect("dismiss");

    let events = harness.supervisor.drain_events();
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, PolicyEvent::SplitScreenDismissed(_)))
            .count(),
        1,
        "dismissal fires exactly once"
    );
    assert_eq!(stack_mode(&harness, app_stack), WindowingMode::Fullscreen);

    // Home sits directly behind the surviving fullscreen stack.
    let order = stack_order(&harness);
    let home = harness.supervisor.snapshot().displays[0]
        .home_stack
        .expect("home cached");
    assert_eq!(order.last(), Some(&app_stack));
    assert_eq!(order[order.len() - 2], home);
    harness.assert_invariants();
}

#[test]
fn create_then_remove_restores_the_stack_order() {
    let harness = TestHarness::new();
    harness.register_activity("com.example.app", 10036, "Main");
    harness
        .supervisor
        .start_activity(
            TestHarness::intent_for("com.example.app", "Main"),
            None,
            UserId::SYSTEM,
        )
        .expect("launch");
    let before = stack_order(&harness);

    let scratch = harness
        .supervisor
        .create_stack(
            DisplayId::DEFAULT,
            WindowingMode::Fullscreen,
            ActivityType::Standard,
            true,
        )
        .expect("scratch stack");
    assert_ne!(stack_order(&harness), before);

    harness.supervisor.remove_stack(scratch).expect("remove");
    assert_eq!(stack_order(&harness), before);
    harness.assert_invariants();
}

#[test]
fn launches_on_an_unknown_display_are_refused() {
    let harness = TestHarness::new();
    harness.register_activity("com.example.app", 10037, "Main");
    let options = ActivityOptions {
        launch_display_id: Some(DisplayId(9)),
        ..ActivityOptions::default()
    };
    let err = harness
        .supervisor
        .start_activity(
            TestHarness::intent_for("com.example.app", "Main"),
            Some(options),
            UserId::SYSTEM,
        )
        .expect_err("unknown display");
    assert_eq!(err.kind(), ErrorKind::Configuration);

    // Registering the display makes the same launch succeed.
    harness.supervisor.add_display(DisplayId(9));
    harness
        .supervisor
        .start_activity(
            TestHarness::intent_for("com.example.app", "Main"),
            Some(ActivityOptions {
                launch_display_id: Some(DisplayId(9)),
                ..ActivityOptions::default()
            }),
            UserId::SYSTEM,
        )
        .expect("launch on new display");
    let snapshot = harness.supervisor.snapshot();
    assert_eq!(snapshot.displays.len(), 2);
    harness.assert_invariants();
}
