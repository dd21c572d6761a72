//! Core types: identifiers, logical time, windowing enums, and intents.

mod id;
mod intent;
mod time;
mod window;

pub use id::{ActivityId, DisplayId, ProcessId, StackId, TaskId, UserId};
pub use intent::{
    ActivityInfo, ActivityOptions, ApplicationInfo, ComponentName, ExtraValue, Intent,
    ResultInfo, WindowLayout, RESULT_CANCELED, RESULT_OK,
};
pub use time::{ClockSource, ManualClock, SystemClock, Time};
pub use window::{ActivityType, Gravity, Rect, WindowingMode};
