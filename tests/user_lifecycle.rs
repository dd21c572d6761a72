//! User lifecycle conformance: switch ordering, bounded concurrency, the
//! two-phase stop protocol, related-user rules, and unlock.

use activity_supervisor::external::testing::{RecordingStopCallback, RecordingSwitchObserver};
use activity_supervisor::external::UserInfo;
use activity_supervisor::record::UserState;
use activity_supervisor::supervisor::{Caller, PolicyEvent};
use activity_supervisor::test_utils::TestHarness;
use activity_supervisor::types::UserId;
use activity_supervisor::user::actions;
use activity_supervisor::user::permissions::INTERACT_ACROSS_USERS_FULL;
use std::sync::Arc;
use std::time::Duration;

fn full_user(id: i32, serial: i32) -> UserInfo {
    UserInfo::full(UserId(id), serial)
}

fn user_state(harness: &TestHarness, id: i32) -> Option<UserState> {
    harness
        .supervisor
        .snapshot()
        .users
        .iter()
        .find(|u| u.id == UserId(id))
        .map(|u| u.state)
}

fn action_index(actions: &[String], wanted: &str) -> usize {
    actions
        .iter()
        .position(|a| a == wanted)
        .unwrap_or_else(|| panic!("broadcast {wanted} was not sent: {actions:?}"))
}

#[test]
fn switch_broadcasts_background_foreground_switched_in_order() {
    let harness = TestHarness::new();
    harness.users.add(full_user(10, 110));

    let switched = harness
        .supervisor
        .switch_user(&Caller::system(), UserId(10))
        .expect("switch");
    assert!(switched);
    assert_eq!(harness.supervisor.current_user(), UserId(10));

    let actions = harness.dispatcher.actions();
    let background = action_index(&actions, actions::USER_BACKGROUND);
    let foreground = action_index(&actions, actions::USER_FOREGROUND);
    let switched = action_index(&actions, actions::USER_SWITCHED);
    assert!(background < foreground, "background precedes foreground");
    assert!(foreground < switched, "foreground precedes switched");

    // With storage unlockable by an empty token, the user marches all the
    // way to RUNNING.
    assert_eq!(user_state(&harness, 10), Some(UserState::Running));
    harness.assert_invariants();
}

#[test]
fn switching_to_the_current_user_is_a_noop() {
    let harness = TestHarness::new();
    let before = harness.dispatcher.sent().len();
    assert!(harness
        .supervisor
        .switch_user(&Caller::system(), UserId::SYSTEM)
        .expect("noop switch"));
    assert_eq!(harness.dispatcher.sent().len(), before);
    assert_eq!(harness.supervisor.current_user(), UserId::SYSTEM);
}

#[test]
fn observers_gate_the_switch_until_they_acknowledge() {
    let harness = TestHarness::new();
    harness.users.add(full_user(10, 110));
    let observer = Arc::new(RecordingSwitchObserver::default());
    harness
        .supervisor
        .register_user_switch_observer(observer.clone());

    harness
        .supervisor
        .switch_user(&Caller::system(), UserId(10))
        .expect("switch");

    // The observer saw the switch start; the ordered broadcasts wait for
    // its acknowledgement.
    assert_eq!(observer.switching().len(), 1);
    assert!(!harness.dispatcher.actions().contains(&actions::USER_SWITCHED.to_string()));

    let cookie = observer.last_cookie().expect("cookie");
    harness.supervisor.acknowledge_user_switch(cookie);

    assert!(harness.dispatcher.actions().contains(&actions::USER_SWITCHED.to_string()));
    assert_eq!(observer.completed(), vec![UserId(10)]);
    assert!(harness
        .supervisor
        .drain_events()
        .contains(&PolicyEvent::UserSwitchComplete(UserId(10))));
    harness.assert_invariants();
}

#[test]
fn observer_timeout_continues_the_switch() {
    let harness = TestHarness::new();
    harness.users.add(full_user(10, 110));
    let observer = Arc::new(RecordingSwitchObserver::default());
    harness
        .supervisor
        .register_user_switch_observer(observer.clone());

    harness
        .supervisor
        .switch_user(&Caller::system(), UserId(10))
        .expect("switch");
    assert!(!harness.dispatcher.actions().contains(&actions::USER_SWITCHED.to_string()));

    // Nobody acknowledges; the 2s deadline continues the switch anyway.
    harness.clock.advance(Duration::from_millis(2100));
    assert!(harness.supervisor.process_deadlines() >= 1);
    assert!(harness.dispatcher.actions().contains(&actions::USER_SWITCHED.to_string()));
    harness.assert_invariants();
}

#[test]
fn running_users_stay_within_the_bound() {
    let harness = TestHarness::new();
    for (id, serial) in [(10, 110), (11, 111), (12, 112)] {
        harness.users.add(full_user(id, serial));
    }
    let caller = Caller::system();
    harness.supervisor.start_user(&caller, UserId(10)).expect("start 10");
    harness.supervisor.start_user(&caller, UserId(11)).expect("start 11");
    assert_eq!(harness.supervisor.snapshot().running_users, 3);

    harness.supervisor.switch_user(&caller, UserId(12)).expect("switch 12");

    // The LRU-oldest eligible user was pushed into the stop protocol; the
    // system user and the new current user survive.
    assert_eq!(user_state(&harness, 10), Some(UserState::Stopping));
    assert_eq!(harness.supervisor.snapshot().running_users, 3);
    assert_eq!(harness.supervisor.current_user(), UserId(12));
    harness.assert_invariants();
}

#[test]
fn stop_runs_the_two_phase_broadcast_protocol() {
    let harness = TestHarness::new();
    harness.users.add(full_user(10, 110));
    let caller = Caller::system();
    harness.supervisor.start_user(&caller, UserId(10)).expect("start");

    let callback = Arc::new(RecordingStopCallback::default());
    harness
        .supervisor
        .stop_user(&caller, UserId(10), false, Some(callback.clone()))
        .expect("stop");
    assert_eq!(user_state(&harness, 10), Some(UserState::Stopping));

    // Phase one: the stopping broadcast completes.
    let (action, stopping_id) = harness.dispatcher.completions()[0].clone();
    assert_eq!(action, actions::USER_STOPPING);
    harness.supervisor.finish_broadcast(stopping_id).expect("phase one");
    assert_eq!(user_state(&harness, 10), Some(UserState::Shutdown));

    // Phase two: the shutdown broadcast completes and teardown runs.
    let (action, shutdown_id) = harness.dispatcher.completions()[1].clone();
    assert_eq!(action, actions::USER_SHUTDOWN);
    harness.supervisor.finish_broadcast(shutdown_id).expect("phase two");

    assert_eq!(user_state(&harness, 10), None);
    assert_eq!(callback.events(), vec![(UserId(10), true)]);
    let all = harness.dispatcher.actions();
    let stopping = action_index(&all, actions::USER_STOPPING);
    let shutdown = action_index(&all, actions::USER_SHUTDOWN);
    let stopped = action_index(&all, actions::USER_STOPPED);
    assert!(stopping < shutdown && shutdown < stopped);
    harness.assert_invariants();
}

#[test]
fn start_during_stopping_quietly_revives_the_user() {
    let harness = TestHarness::new();
    harness.users.add(full_user(10, 110));
    let caller = Caller::system();
    harness.supervisor.start_user(&caller, UserId(10)).expect("start");
    assert_eq!(user_state(&harness, 10), Some(UserState::Running));

    harness
        .supervisor
        .stop_user(&caller, UserId(10), false, None)
        .expect("stop");
    assert_eq!(user_state(&harness, 10), Some(UserState::Stopping));

    // A start lands before the stopping broadcast finishes: the user
    // reverts to its prior state and phase two never runs.
    harness.supervisor.start_user(&caller, UserId(10)).expect("restart");
    assert_eq!(user_state(&harness, 10), Some(UserState::Running));

    let (_, stopping_id) = harness.dispatcher.completions()[0].clone();
    harness.supervisor.finish_broadcast(stopping_id).expect("late completion");
    assert_eq!(user_state(&harness, 10), Some(UserState::Running));
    let actions_sent = harness.dispatcher.actions();
    assert!(!actions_sent.contains(&actions::USER_SHUTDOWN.to_string()));
    harness.assert_invariants();
}

#[test]
fn stopping_the_system_or_current_user_is_refused() {
    let harness = TestHarness::new();
    harness.users.add(full_user(10, 110));
    let caller = Caller::system();

    let err = harness
        .supervisor
        .stop_user(&caller, UserId::SYSTEM, false, None)
        .expect_err("system user");
    assert_eq!(err.kind(), activity_supervisor::error::ErrorKind::UserOpInvalid);

    harness.supervisor.switch_user(&caller, UserId(10)).expect("switch");
    let err = harness
        .supervisor
        .stop_user(&caller, UserId(10), false, None)
        .expect_err("current user");
    assert_eq!(err.kind(), activity_supervisor::error::ErrorKind::UserOpInvalid);
}

#[test]
fn related_users_block_the_stop_unless_forced() {
    let harness = TestHarness::new();
    // 20 is a full user; 21 is its managed profile (same profile group).
    let mut parent = full_user(20, 120);
    parent.profile_group = Some(7);
    harness.users.add(parent);
    let mut profile = full_user(21, 121);
    profile.profile_group = Some(7);
    profile.managed_profile = true;
    harness.users.add(profile);

    let caller = Caller::system();
    harness.supervisor.switch_user(&caller, UserId(20)).expect("switch");
    harness.supervisor.start_user(&caller, UserId(21)).expect("profile");

    // The profile's group contains the current user: non-force refuses.
    let err = harness
        .supervisor
        .stop_user(&caller, UserId(21), false, None)
        .expect_err("related current");
    assert_eq!(err.kind(), activity_supervisor::error::ErrorKind::UserOpInvalid);
    assert_eq!(user_state(&harness, 21), Some(UserState::Running));

    // Force stops the requested user only; the current user stays.
    harness
        .supervisor
        .stop_user(&caller, UserId(21), true, None)
        .expect("force stop");
    assert_eq!(user_state(&harness, 21), Some(UserState::Stopping));
    assert_eq!(harness.supervisor.current_user(), UserId(20));
    harness.assert_invariants();
}

#[test]
fn credential_bound_user_stays_locked_until_unlocked() {
    let harness = TestHarness::new();
    harness.users.add(full_user(30, 130));
    harness.storage.require_credentials(UserId(30));
    let caller = Caller::system();

    harness.supervisor.start_user(&caller, UserId(30)).expect("start");
    assert_eq!(user_state(&harness, 30), Some(UserState::RunningLocked));
    let sent = harness.dispatcher.actions();
    assert!(sent.contains(&actions::LOCKED_BOOT_COMPLETED.to_string()));
    assert!(!sent.contains(&actions::USER_UNLOCKED.to_string()));

    let unlocked = harness
        .supervisor
        .unlock_user(&caller, UserId(30), Some(b"pin"), None)
        .expect("unlock");
    assert!(unlocked);
    assert_eq!(user_state(&harness, 30), Some(UserState::Running));
    let sent = harness.dispatcher.actions();
    let unlocked_at = action_index(&sent, actions::USER_UNLOCKED);
    let boot_at = action_index(&sent, actions::BOOT_COMPLETED);
    assert!(unlocked_at < boot_at);
    assert_eq!(harness.users.prepared_storage(), vec![UserId(30)]);
}

#[test]
fn managed_profile_unlock_notifies_the_parent() {
    let harness = TestHarness::new();
    let mut parent = full_user(50, 150);
    parent.profile_group = Some(9);
    harness.users.add(parent);
    let mut profile = full_user(51, 151);
    profile.profile_group = Some(9);
    profile.managed_profile = true;
    harness.users.add(profile);

    let caller = Caller::system();
    harness.supervisor.start_user(&caller, UserId(50)).expect("parent");
    harness.supervisor.start_user(&caller, UserId(51)).expect("profile");

    let profile_unlocked = harness
        .dispatcher
        .sent()
        .into_iter()
        .find(|r| r.intent.action.as_deref() == Some(actions::MANAGED_PROFILE_UNLOCKED))
        .expect("profile-unlocked broadcast");
    assert_eq!(profile_unlocked.user, Some(UserId(50)));
}

#[test]
fn ephemeral_users_are_deleted_after_stopping() {
    let harness = TestHarness::new();
    let mut guest = full_user(40, 140);
    guest.ephemeral = true;
    harness.users.add(guest);
    let caller = Caller::system();

    harness.supervisor.start_user(&caller, UserId(40)).expect("start");
    harness
        .supervisor
        .stop_user(&caller, UserId(40), false, None)
        .expect("stop");
    harness.finish_all_broadcasts();
    assert_eq!(user_state(&harness, 40), None);
    assert_eq!(harness.users.removed(), vec![UserId(40)]);
}

#[test]
fn user_operations_require_the_full_interact_permission() {
    let harness = TestHarness::new();
    harness.users.add(full_user(10, 110));

    let unprivileged = Caller::new(321, 10400);
    let err = harness
        .supervisor
        .switch_user(&unprivileged, UserId(10))
        .expect_err("denied");
    assert_eq!(err.kind(), activity_supervisor::error::ErrorKind::PermissionDenied);

    let granted = Caller::new(321, 10400).grant(INTERACT_ACROSS_USERS_FULL);
    assert!(harness
        .supervisor
        .switch_user(&granted, UserId(10))
        .expect("granted switch"));
}
