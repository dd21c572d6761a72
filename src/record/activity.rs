//! Activity record and its lifecycle state machine.

use crate::tracing_compat::debug;
use crate::types::{
    ActivityId, ActivityInfo, ComponentName, Intent, ProcessId, ResultInfo, TaskId, Time, UserId,
};
use smallvec::SmallVec;

/// Lifecycle state of an activity.
///
/// An activity is *in history* while its state is anything but `Destroyed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityState {
    /// Created but not yet launched into a process.
    Initializing,
    /// The single active activity of its stack, receiving input.
    Resumed,
    /// Asked to pause; completion or deadline expiry moves it to `Paused`.
    Pausing,
    /// Focus relinquished; still in memory, possibly visible.
    Paused,
    /// Asked to stop; completion or deadline expiry moves it to `Stopped`.
    Stopping,
    /// No longer visible; UI resources may be reclaimed.
    Stopped,
    /// Finish requested; awaiting its successor before destruction.
    Finishing,
    /// Destruction scheduled in the hosting process.
    Destroying,
    /// Terminal; the record is about to leave history.
    Destroyed,
}

impl ActivityState {
    /// Returns true for states where the activity still occupies history.
    #[must_use]
    pub const fn in_history(self) -> bool {
        !matches!(self, Self::Destroyed)
    }
}

/// A single user-visible screen hosted in an application process.
#[derive(Debug)]
pub struct ActivityRecord {
    /// This record's id; also the token handed to the hosting process.
    pub id: ActivityId,
    /// Owning task.
    pub task: TaskId,
    /// Logical user the activity belongs to.
    pub user: UserId,
    /// Resolved manifest entry.
    pub info: ActivityInfo,
    /// The (resolved) intent that started this activity.
    pub intent: Intent,
    /// Resolved component, cached for idempotent replay.
    pub component: ComponentName,
    /// Hosting process name.
    pub process_name: String,
    /// Hosting process, once attached.
    pub app: Option<ProcessId>,
    /// Current lifecycle state.
    pub state: ActivityState,
    /// Saved-state blob captured at the last stop.
    pub saved_state: Option<Vec<u8>>,
    /// Pending results, delivered at the next resume.
    pub results: SmallVec<[ResultInfo; 2]>,
    /// Pending new intents, delivered at the next resume.
    pub new_intents: Vec<Intent>,
    /// Activity that should receive this one's result.
    pub result_to: Option<ActivityId>,
    /// Result channel identifier within the receiver.
    pub result_who: Option<String>,
    /// Request code the receiver used (negative = no result expected).
    pub request_code: i32,
    /// Whether the activity window is currently visible.
    pub visible: bool,
    /// Reported visible at least once since its last launch.
    pub now_visible: bool,
    /// Put to sleep by its display.
    pub sleeping: bool,
    /// Finish has been requested.
    pub finishing: bool,
    /// A launch into the hosting process failed once this attempt.
    pub launch_failed: bool,
    /// Stop completed and saved state captured.
    pub stopped: bool,
    /// The process reported idle after resuming this activity.
    pub idle: bool,
    /// Whether this activity fully occludes what is behind it.
    pub fullscreen: bool,
    /// Number of times a launch was scheduled.
    pub launch_count: u32,
    /// When the last launch was scheduled.
    pub last_launch_time: Time,
}

impl ActivityRecord {
    /// Creates a record in `Initializing` for a resolved launch.
    #[must_use]
    pub fn new(
        id: ActivityId,
        task: TaskId,
        user: UserId,
        info: ActivityInfo,
        intent: Intent,
    ) -> Self {
        let component = info.component();
        let process_name = info.process_name.clone();
        let fullscreen = info.opaque;
        Self {
            id,
            task,
            user,
            info,
            intent,
            component,
            process_name,
            app: None,
            state: ActivityState::Initializing,
            saved_state: None,
            results: SmallVec::new(),
            new_intents: Vec::new(),
            result_to: None,
            result_who: None,
            request_code: -1,
            visible: false,
            now_visible: false,
            sleeping: false,
            finishing: false,
            launch_failed: false,
            stopped: false,
            idle: false,
            fullscreen,
            launch_count: 0,
            last_launch_time: Time::ZERO,
        }
    }

    /// Returns true while the record occupies history.
    #[must_use]
    pub const fn in_history(&self) -> bool {
        self.state.in_history()
    }

    /// Returns true if the activity can be the resume target of its stack.
    #[must_use]
    pub const fn can_be_top(&self) -> bool {
        !self.finishing && self.in_history()
    }

    /// Moves the record to `next`, logging the transition.
    pub fn set_state(&mut self, next: ActivityState, reason: &str) {
        debug!(
            activity = %self.id,
            component = %self.component,
            from = ?self.state,
            to = ?next,
            reason,
            "activity state"
        );
        self.state = next;
    }

    /// Queues a result for delivery at the next resume.
    pub fn add_result(&mut self, result: ResultInfo) {
        self.results.push(result);
    }

    /// Queues a new intent for delivery at the next resume.
    pub fn add_new_intent(&mut self, intent: Intent) {
        self.new_intents.push(intent);
    }

    /// Drains queued results and intents for delivery with a launch/resume.
    pub fn take_pending_deliveries(&mut self) -> (Vec<ResultInfo>, Vec<Intent>) {
        (
            self.results.drain(..).collect(),
            std::mem::take(&mut self.new_intents),
        )
    }

    /// Marks a launch attempt: bumps the counter and timestamps it.
    pub fn note_launch(&mut self, now: Time) {
        self.launch_count += 1;
        self.last_launch_time = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ApplicationInfo;

    fn record() -> ActivityRecord {
        let info = ActivityInfo::new("Main", ApplicationInfo::new("com.example", 10001));
        ActivityRecord::new(
            ActivityId::new_for_test(0, 0),
            TaskId::new_for_test(0, 0),
            UserId::SYSTEM,
            info,
            Intent::new(),
        )
    }

    #[test]
    fn new_record_is_initializing_and_in_history() {
        let r = record();
        assert_eq!(r.state, ActivityState::Initializing);
        assert!(r.in_history());
        assert!(r.can_be_top());
    }

    #[test]
    fn destroyed_leaves_history() {
        let mut r = record();
        r.set_state(ActivityState::Destroyed, "test");
        assert!(!r.in_history());
        assert!(!r.can_be_top());
    }

    #[test]
    fn finishing_cannot_be_top() {
        let mut r = record();
        r.finishing = true;
        assert!(r.in_history());
        assert!(!r.can_be_top());
    }

    #[test]
    fn pending_deliveries_drain_once() {
        let mut r = record();
        r.add_result(ResultInfo {
            result_who: None,
            request_code: 1,
            result_code: -1,
            data: None,
        });
        r.add_new_intent(Intent::for_action("view"));

        let (results, intents) = r.take_pending_deliveries();
        assert_eq!(results.len(), 1);
        assert_eq!(intents.len(), 1);

        let (results, intents) = r.take_pending_deliveries();
        assert!(results.is_empty());
        assert!(intents.is_empty());
    }

    #[test]
    fn note_launch_counts_attempts() {
        let mut r = record();
        r.note_launch(Time::from_millis(5));
        r.note_launch(Time::from_millis(9));
        assert_eq!(r.launch_count, 2);
        assert_eq!(r.last_launch_time, Time::from_millis(9));
    }
}
