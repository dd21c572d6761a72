//! Records for the supervised entities.
//!
//! Records are passive data owned by the supervisor's arenas; behavior that
//! spans records (choreography, placement, crash handling) lives with the
//! component that drives it. Ownership runs display → stack → task →
//! activity; processes and activities reference each other only through
//! typed ids.

pub mod activity;
pub mod process;
pub mod task;
pub mod user;

pub use activity::{ActivityRecord, ActivityState};
pub use process::{ProcessRecord, ProcessState, SchedGroup, ServiceRecord};
pub use task::TaskRecord;
pub use user::{UserRecord, UserState};
